//! Per-server pools of reusable client connections.
//!
//! Each server index owns a FIFO of idle TCP streams and a fair semaphore
//! capping how many connections may exist at once. Checking out prefers an
//! idle stream and dials only when none is available; waiters queue in
//! arrival order. A connection that saw an I/O error must be discarded so
//! the next checkout dials a fresh one.

use crate::config::Configuration;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_PORT: u16 = 4711;

pub struct ConnectionPool {
    object: Vec<Arc<ServerSlot>>,
    kv: Vec<Arc<ServerSlot>>,
}

struct ServerSlot {
    address: String,
    limit: Arc<Semaphore>,
    idle: Mutex<VecDeque<TcpStream>>,
}

impl ServerSlot {
    fn new(address: &str, max_connections: usize) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            limit: Arc::new(Semaphore::new(max_connections)),
            idle: Mutex::new(VecDeque::new()),
        })
    }
}

impl ConnectionPool {
    pub fn new(config: &Configuration) -> Self {
        let slots = |servers: &[String]| {
            servers
                .iter()
                .map(|address| ServerSlot::new(address, config.max_connections))
                .collect()
        };
        Self {
            object: slots(&config.object_servers),
            kv: slots(&config.kv_servers),
        }
    }

    pub fn object_count(&self) -> usize {
        self.object.len()
    }

    pub fn kv_count(&self) -> usize {
        self.kv.len()
    }

    /// Check out a connection to the object server at `index`.
    pub async fn object(&self, index: usize) -> crate::Result<PooledConnection> {
        let slot = self
            .object
            .get(index)
            .ok_or(crate::Error::InvalidArgument("object server index"))?;
        checkout(slot).await
    }

    /// Check out a connection to the kv server at `index`.
    pub async fn kv(&self, index: usize) -> crate::Result<PooledConnection> {
        let slot = self
            .kv
            .get(index)
            .ok_or(crate::Error::InvalidArgument("kv server index"))?;
        checkout(slot).await
    }
}

async fn checkout(slot: &Arc<ServerSlot>) -> crate::Result<PooledConnection> {
    let permit = slot
        .limit
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| crate::Error::Protocol("connection pool is shut down"))?;

    let idle = slot.idle.lock().unwrap().pop_front();
    let stream = match idle {
        Some(stream) => stream,
        None => {
            let address = with_default_port(&slot.address);
            tracing::debug!(%address, "dialing server");
            let stream = TcpStream::connect(&address).await?;
            stream.set_nodelay(true)?;
            stream
        }
    };

    Ok(PooledConnection {
        stream: Some(stream),
        slot: slot.clone(),
        _permit: permit,
    })
}

/// Settle a checked-out connection after a run: reuse it on success,
/// discard it after any error (the stream state is unknown).
pub(crate) fn finish<T>(conn: PooledConnection, result: crate::Result<T>) -> crate::Result<T> {
    match result {
        Ok(value) => {
            conn.release();
            Ok(value)
        }
        Err(err) => {
            conn.discard();
            Err(err)
        }
    }
}

fn with_default_port(address: &str) -> String {
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{DEFAULT_PORT}")
    }
}

/// A checked-out connection. Call `release` to return it for reuse;
/// dropping it (or calling `discard`) closes the stream instead, which is
/// the required path after any I/O error.
pub struct PooledConnection {
    stream: Option<TcpStream>,
    slot: Arc<ServerSlot>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn stream(&mut self) -> &mut TcpStream {
        // The option is only emptied by release/discard, which consume self.
        self.stream.as_mut().expect("connection already returned")
    }

    /// Return a healthy connection to the idle FIFO.
    pub fn release(mut self) {
        if let Some(stream) = self.stream.take() {
            self.slot.idle.lock().unwrap().push_back(stream);
        }
        // The permit drops after the push, so a waiter always finds the
        // idle stream it was woken for.
    }

    /// Drop a broken connection; the next checkout dials a fresh one.
    pub fn discard(mut self) {
        self.stream.take();
    }
}
