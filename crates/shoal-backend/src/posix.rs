use crate::{BackendObject, Error, ObjectBackend, ObjectStatus, Result};
use bytes::Bytes;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

/// Object storage over a POSIX filesystem: one file per object at
/// `root/namespace/name`. Reads and writes are positioned (pread/pwrite)
/// and run on the blocking thread pool.
pub struct PosixObjectBackend {
    root: PathBuf,
}

impl PosixObjectBackend {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let root = path.into();
        std::fs::create_dir_all(&root)?;
        tracing::debug!(root = %root.display(), "opened posix object store");
        Ok(Self { root })
    }

    fn object_path(&self, namespace: &str, name: &str) -> Result<PathBuf> {
        // Namespace and name are single path components.
        for part in [namespace, name] {
            if part.is_empty() || part == "." || part == ".." || part.contains(['/', '\0']) {
                return Err(Error::Io(std::io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("invalid object identity {namespace:?}/{name:?}"),
                )));
            }
        }
        Ok(self.root.join(namespace).join(name))
    }
}

#[async_trait::async_trait]
impl ObjectBackend for PosixObjectBackend {
    async fn create(&self, namespace: &str, name: &str) -> Result<Box<dyn BackendObject>> {
        let path = self.object_path(namespace, name)?;
        let (namespace, name) = (namespace.to_string(), name.to_string());

        let file = {
            let path = path.clone();
            let (namespace, name) = (namespace.clone(), name.clone());
            spawn_fs(move || {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .map_err(|err| match err.kind() {
                        ErrorKind::AlreadyExists => Error::AlreadyExists { namespace, name },
                        _ => Error::Io(err),
                    })
            })
            .await?
        };

        Ok(Box::new(PosixObject {
            file: Arc::new(file),
            path,
            namespace,
            name,
        }))
    }

    async fn open(&self, namespace: &str, name: &str) -> Result<Box<dyn BackendObject>> {
        let path = self.object_path(namespace, name)?;
        let (namespace, name) = (namespace.to_string(), name.to_string());

        let file = {
            let path = path.clone();
            let (namespace, name) = (namespace.clone(), name.clone());
            spawn_fs(move || {
                std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|err| match err.kind() {
                        ErrorKind::NotFound => Error::NotFound { namespace, name },
                        _ => Error::Io(err),
                    })
            })
            .await?
        };

        Ok(Box::new(PosixObject {
            file: Arc::new(file),
            path,
            namespace,
            name,
        }))
    }
}

struct PosixObject {
    file: Arc<std::fs::File>,
    path: PathBuf,
    namespace: String,
    name: String,
}

#[async_trait::async_trait]
impl BackendObject for PosixObject {
    async fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.file.clone();
        let len = buf.len();

        let data = spawn_fs(move || {
            let mut tmp = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                match file.read_at(&mut tmp[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(err) if err.kind() == ErrorKind::Interrupted => (),
                    Err(err) => return Err(Error::Io(err)),
                }
            }
            tmp.truncate(filled);
            Ok(tmp)
        })
        .await?;

        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn write(&self, data: Bytes, offset: u64) -> Result<usize> {
        let file = self.file.clone();
        let len = data.len();

        spawn_fs(move || {
            file.write_all_at(&data, offset)?;
            Ok(())
        })
        .await?;
        Ok(len)
    }

    async fn status(&self) -> Result<ObjectStatus> {
        let file = self.file.clone();

        spawn_fs(move || {
            let meta = file.metadata()?;
            Ok(ObjectStatus {
                modified: crate::unix_micros(meta.modified()?),
                size: meta.len(),
            })
        })
        .await
    }

    async fn sync(&self) -> Result<()> {
        let file = self.file.clone();
        spawn_fs(move || Ok(file.sync_all()?)).await
    }

    async fn delete(&self) -> Result<()> {
        let path = self.path.clone();
        let (namespace, name) = (self.namespace.clone(), self.name.clone());

        spawn_fs(move || {
            std::fs::remove_file(&path).map_err(|err| match err.kind() {
                ErrorKind::NotFound => Error::NotFound { namespace, name },
                _ => Error::Io(err),
            })
        })
        .await
    }
}

async fn spawn_fs<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(join) => Err(Error::Io(std::io::Error::new(
            ErrorKind::Other,
            format!("filesystem task failed: {join}"),
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ObjectBackend;

    #[tokio::test]
    async fn write_read_status_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = PosixObjectBackend::new(dir.path()).unwrap();

        let object = backend.create("ns", "obj").await.unwrap();
        object.write(Bytes::from_static(b"stored"), 0).await.unwrap();
        object.sync().await.unwrap();

        let reopened = backend.open("ns", "obj").await.unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(reopened.read(&mut buf, 0).await.unwrap(), 6);
        assert_eq!(&buf, b"stored");

        let status = reopened.status().await.unwrap();
        assert_eq!(status.size, 6);
        assert!(status.modified > 0);

        reopened.delete().await.unwrap();
        assert!(matches!(
            backend.open("ns", "obj").await.err(),
            Some(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn sparse_write_extends_with_zeroes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = PosixObjectBackend::new(dir.path()).unwrap();

        let object = backend.create("ns", "sparse").await.unwrap();
        object.write(Bytes::from_static(b"z"), 8).await.unwrap();

        let mut buf = [1u8; 9];
        assert_eq!(object.read(&mut buf, 0).await.unwrap(), 9);
        assert_eq!(&buf, b"\0\0\0\0\0\0\0\0z");
    }

    #[tokio::test]
    async fn create_existing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let backend = PosixObjectBackend::new(dir.path()).unwrap();

        backend.create("ns", "obj").await.unwrap();
        assert!(matches!(
            backend.create("ns", "obj").await.err(),
            Some(Error::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = PosixObjectBackend::new(dir.path()).unwrap();

        assert!(backend.create("..", "obj").await.is_err());
        assert!(backend.create("ns", "a/b").await.is_err());
    }
}
