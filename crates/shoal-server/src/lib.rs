//! Server side of the framed storage protocol: accepts connections,
//! decodes request frames, invokes the configured backends, and emits
//! replies at the safety level each request asked for.

use anyhow::Context;
use bytes::BytesMut;
use shoal::message::{Message, Opcode, MAX_BODY_LEN, SAFETY_NETWORK, SAFETY_STORAGE};
use shoal_backend::{CommitMode, KvBackend, ObjectBackend};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct Server {
    object: Arc<dyn ObjectBackend>,
    kv: Arc<dyn KvBackend>,
    session_limit: Arc<tokio::sync::Semaphore>,
}

impl Server {
    pub fn new(
        object: Arc<dyn ObjectBackend>,
        kv: Arc<dyn KvBackend>,
        max_sessions: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            object,
            kv,
            session_limit: Arc::new(tokio::sync::Semaphore::new(max_sessions)),
        })
    }

    /// Accept and serve sessions until `stop` fires, then wait for the
    /// in-flight sessions to finish.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        stop: CancellationToken,
    ) -> anyhow::Result<()> {
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                accept = listener.accept() => {
                    let Ok((socket, addr)) = accept else {
                        continue;
                    };
                    socket.set_nodelay(true)?;

                    let server = self.clone();
                    let session_stop = stop.child_token();
                    tracker.spawn(async move {
                        let _ = serve(server, socket, addr, session_stop).await;
                    });
                }
                _ = stop.cancelled() => break,
            }
        }

        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

#[tracing::instrument(level = "info", err(Debug, level = "warn"), skip(server, socket, stop), fields(%addr))]
async fn serve<S>(
    server: Arc<Server>,
    socket: S,
    addr: std::net::SocketAddr,
    stop: CancellationToken,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _permit = match server.session_limit.try_acquire() {
        Ok(permit) => permit,
        Err(_) => {
            metrics::counter!("shoal_rejected_sessions", "reason" => "over_limit").increment(1);
            anyhow::bail!("session limit reached, rejecting connection");
        }
    };

    tracing::debug!("accepted client connection");
    metrics::gauge!("shoal_open_sessions").increment(1);

    let (mut r, mut w) = tokio::io::split(socket);
    let result = async {
        loop {
            tokio::select! {
                frame = Message::receive(&mut r) => {
                    match frame {
                        Ok(Some(mut frame)) => {
                            dispatch(&server, &mut frame, &mut r, &mut w).await?;
                        }
                        Ok(None) => return Ok(()),
                        Err(shoal::Error::UnknownOpcode { op, flags }) => {
                            // The frame was consumed; the stream is still
                            // aligned, so the session survives. Acknowledge
                            // with an empty reply when one was requested.
                            tracing::warn!(op, "ignoring frame with unknown opcode");
                            if flags & (SAFETY_NETWORK | SAFETY_STORAGE) != 0 {
                                Message::new(Opcode::None).send(&mut w).await?;
                            }
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                _ = stop.cancelled() => anyhow::bail!("signalled to stop"),
            }
        }
    }
    .await;

    metrics::gauge!("shoal_open_sessions").decrement(1);
    let _ = w.shutdown().await;
    result
}

async fn dispatch<R, W>(
    server: &Server,
    frame: &mut Message,
    r: &mut R,
    w: &mut W,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match frame.op() {
        Opcode::ObjectCreate
        | Opcode::ObjectDelete
        | Opcode::ObjectOpen
        | Opcode::ObjectClose
        | Opcode::ObjectSync => object_meta(server, frame, w).await,
        Opcode::ObjectStatus => object_status(server, frame, w).await,
        Opcode::ObjectRead => object_read(server, frame, w).await,
        Opcode::ObjectWrite => object_write(server, frame, r, w).await,
        Opcode::KvPut | Opcode::KvDelete => kv_write(server, frame, w).await,
        Opcode::KvGet => kv_get(server, frame, w).await,
        Opcode::None => {
            if frame.wants_reply() {
                Message::reply_to(frame).send(w).await?;
            }
            Ok(())
        }
    }
}

/// Create, delete, open, close, and sync: one name per sub-op, one u64
/// status (0 = ok) per sub-op in the reply.
async fn object_meta<W>(server: &Server, frame: &mut Message, w: &mut W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let namespace = frame.get_str()?;
    let mut reply = Message::reply_to(frame);

    for _ in 0..frame.count() {
        let name = frame.get_str()?;
        let result = match frame.op() {
            Opcode::ObjectCreate => match server.object.create(&namespace, &name).await {
                Ok(handle) if frame.wants_storage() => handle.sync().await,
                Ok(_) => Ok(()),
                Err(err) => Err(err),
            },
            Opcode::ObjectDelete => match server.object.open(&namespace, &name).await {
                Ok(handle) => handle.delete().await,
                Err(err) => Err(err),
            },
            Opcode::ObjectSync => match server.object.open(&namespace, &name).await {
                Ok(handle) => handle.sync().await,
                Err(err) => Err(err),
            },
            // Open and close only check existence; handles are per-request.
            _ => server.object.open(&namespace, &name).await.map(|_| ()),
        };

        reply.add_operation();
        match result {
            Ok(()) => reply.append_u64(0),
            Err(err) => {
                tracing::debug!(namespace, name, error = %err, "object operation failed");
                reply.append_u64(1);
            }
        }
    }

    if frame.wants_reply() {
        reply.send(w).await?;
    }
    Ok(())
}

/// Status always replies: i64 mtime (negative marks failure) and u64 size
/// per sub-op.
async fn object_status<W>(server: &Server, frame: &mut Message, w: &mut W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let namespace = frame.get_str()?;
    let mut reply = Message::reply_to(frame);

    for _ in 0..frame.count() {
        let name = frame.get_str()?;
        let status = match server.object.open(&namespace, &name).await {
            Ok(handle) => handle.status().await,
            Err(err) => Err(err),
        };

        reply.add_operation();
        match status {
            Ok(status) => {
                reply.append_i64(status.modified.max(0));
                reply.append_u64(status.size);
            }
            Err(err) => {
                tracing::debug!(namespace, name, error = %err, "status failed");
                reply.append_i64(-1);
                reply.append_u64(0);
            }
        }
    }

    reply.send(w).await?;
    Ok(())
}

/// Read streams one reply frame per sub-op, each carrying the byte count
/// and the bulk payload directly after its body.
async fn object_read<W>(server: &Server, frame: &mut Message, w: &mut W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let namespace = frame.get_str()?;
    let name = frame.get_str()?;

    let handle = match server.object.open(&namespace, &name).await {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::debug!(namespace, name, error = %err, "read open failed");
            None
        }
    };

    for _ in 0..frame.count() {
        let length = frame.get_u64()?;
        let offset = frame.get_u64()?;
        anyhow::ensure!(length <= MAX_BODY_LEN as u64, "read length exceeds maximum");

        let mut reply = Message::reply_to(frame);
        reply.add_operation();

        match &handle {
            Some(handle) => {
                let mut buf = BytesMut::zeroed(length as usize);
                match handle.read(&mut buf, offset).await {
                    Ok(n) => {
                        buf.truncate(n);
                        reply.append_u64(n as u64);
                        reply.add_send(buf.freeze());
                    }
                    Err(err) => {
                        tracing::debug!(namespace, name, error = %err, "read failed");
                        reply.append_u64(0);
                    }
                }
            }
            None => reply.append_u64(0),
        }
        reply.send(w).await?;
    }
    Ok(())
}

/// Write consumes each sub-op's bulk payload from the stream; the reply
/// carries bytes_written per sub-op.
async fn object_write<R, W>(
    server: &Server,
    frame: &mut Message,
    r: &mut R,
    w: &mut W,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let namespace = frame.get_str()?;
    let name = frame.get_str()?;

    let handle = match server.object.open(&namespace, &name).await {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::debug!(namespace, name, error = %err, "write open failed");
            None
        }
    };

    let mut written = Vec::with_capacity(frame.count() as usize);
    for _ in 0..frame.count() {
        let length = frame.get_u64()?;
        let offset = frame.get_u64()?;
        anyhow::ensure!(length <= MAX_BODY_LEN as u64, "write length exceeds maximum");

        // The payload must be drained even when the open failed, or the
        // stream desynchronizes.
        let mut data = BytesMut::zeroed(length as usize);
        r.read_exact(&mut data).await?;

        let n = match &handle {
            Some(handle) => match handle.write(data.freeze(), offset).await {
                Ok(n) => n as u64,
                Err(err) => {
                    tracing::debug!(namespace, name, error = %err, "write failed");
                    0
                }
            },
            None => 0,
        };
        written.push(n);
    }

    // Durability is confirmed once, before the reply frame.
    if frame.wants_storage() {
        if let Some(handle) = &handle {
            if let Err(err) = handle.sync().await {
                tracing::warn!(namespace, name, error = %err, "sync after write failed");
                written.iter_mut().for_each(|n| *n = 0);
            }
        }
    }

    if frame.wants_reply() {
        let mut reply = Message::reply_to(frame);
        for n in written {
            reply.add_operation();
            reply.append_u64(n);
        }
        reply.send(w).await?;
    }
    Ok(())
}

/// Put and delete stage into one backend write batch and commit once.
async fn kv_write<W>(server: &Server, frame: &mut Message, w: &mut W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let namespace = frame.get_str()?;
    let mode = if frame.wants_storage() {
        CommitMode::Durable
    } else {
        CommitMode::Buffered
    };

    let mut batch = server
        .kv
        .write_batch(&namespace, mode)
        .await
        .context("starting kv write batch")?;

    for _ in 0..frame.count() {
        let key = frame.get_str()?;
        match frame.op() {
            Opcode::KvPut => {
                let len = frame.get_u32()?;
                let value = frame.get_bytes(len as usize)?;
                batch.put(&key, value);
            }
            _ => batch.delete(&key),
        }
    }

    let committed = match batch.commit().await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(namespace, error = %err, "kv commit failed");
            false
        }
    };

    if frame.wants_reply() {
        let mut reply = Message::reply_to(frame);
        for _ in 0..frame.count() {
            reply.add_operation();
            // Only durable commits report a per-sub-op status; a network
            // level reply acknowledges receipt by arriving at all.
            if frame.wants_storage() {
                reply.append_u32(if committed { 0 } else { 1 });
            }
        }
        reply.send(w).await?;
    }
    Ok(())
}

/// Get always replies: u32 length plus the value bytes per sub-op, with
/// zero length marking an absent key.
async fn kv_get<W>(server: &Server, frame: &mut Message, w: &mut W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let namespace = frame.get_str()?;
    let mut reply = Message::reply_to(frame);

    for _ in 0..frame.count() {
        let key = frame.get_str()?;
        reply.add_operation();
        match server.kv.get(&namespace, &key).await {
            Ok(Some(value)) => {
                reply.append_u32(value.len() as u32);
                reply.append_bytes(&value);
            }
            Ok(None) => reply.append_u32(0),
            Err(err) => {
                tracing::debug!(namespace, key, error = %err, "kv get failed");
                reply.append_u32(0);
            }
        }
    }

    reply.send(w).await?;
    Ok(())
}
