//! Master-side cluster socket: where workers check in.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use crate::cluster::channel::{WorkerChannel, WorkerHello};
use crate::cluster::registry::WorkerRegistry;

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_HELLO_BYTES: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("I/O error reading hello: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed hello: {0}")]
    Hello(#[from] serde_json::Error),
    #[error("Worker did not introduce itself in time")]
    Timeout,
    #[error("Hello line too long")]
    TooLong,
}

pub struct ClusterListener {
    listener: UnixListener,
    path: PathBuf,
    registry: Arc<WorkerRegistry>,
}

impl ClusterListener {
    /// Bind the cluster socket, replacing a stale socket file.
    pub fn bind(path: &Path, registry: Arc<WorkerRegistry>) -> std::io::Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed stale cluster socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(path)?;
        tracing::info!(path = %path.display(), "Cluster socket bound");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            registry,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept workers until shutdown. Removes the socket file on exit.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Cluster listener shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let registry = Arc::clone(&self.registry);
                        tokio::spawn(async move {
                            if let Err(e) = serve_worker(stream, registry).await {
                                tracing::warn!(error = %e, "Worker registration failed");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept worker"),
                },
            }
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Register a worker and keep it registered until its channel closes.
async fn serve_worker(mut stream: UnixStream, registry: Arc<WorkerRegistry>) -> Result<(), RegistrationError> {
    let hello = tokio::time::timeout(HELLO_TIMEOUT, read_hello(&mut stream))
        .await
        .map_err(|_| RegistrationError::Timeout)??;

    let entry = registry.register(hello.pid, WorkerChannel::new(stream));
    entry.channel().closed().await;
    registry.deregister(entry.id());
    Ok(())
}

// Byte at a time: nothing past the newline may be consumed.
async fn read_hello(stream: &mut UnixStream) -> Result<WorkerHello, RegistrationError> {
    let mut line = Vec::with_capacity(32);
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if line.len() >= MAX_HELLO_BYTES {
            return Err(RegistrationError::TooLong);
        }
        line.push(byte);
    }
    Ok(serde_json::from_slice(&line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::channel::HandleReceiver;
    use std::sync::atomic::{AtomicU32, Ordering};

    static SOCKET_SEQ: AtomicU32 = AtomicU32::new(0);

    fn socket_path() -> PathBuf {
        std::env::temp_dir().join(format!(
            "cluster-http-listener-{}-{}.sock",
            std::process::id(),
            SOCKET_SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    async fn wait_for(registry: &WorkerRegistry, count: usize) {
        for _ in 0..200 {
            if registry.len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry never reached {count} workers");
    }

    #[tokio::test]
    async fn worker_registers_and_deregisters() {
        let path = socket_path();
        let registry = Arc::new(WorkerRegistry::new());
        let listener = ClusterListener::bind(&path, Arc::clone(&registry)).unwrap();
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(listener.run(rx));

        let receiver = HandleReceiver::connect(&path).await.unwrap();
        wait_for(&registry, 1).await;
        assert_eq!(registry.snapshot()[0].pid(), std::process::id());

        drop(receiver);
        wait_for(&registry, 0).await;

        tx.send(()).unwrap();
        task.await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn malformed_hello_is_not_registered() {
        use tokio::io::AsyncWriteExt;

        let path = socket_path();
        let registry = Arc::new(WorkerRegistry::new());
        let listener = ClusterListener::bind(&path, Arc::clone(&registry)).unwrap();
        let (_tx, rx) = broadcast::channel(1);
        tokio::spawn(listener.run(rx));

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"not json\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let path = socket_path();
        std::fs::write(&path, b"stale").unwrap();
        let listener = ClusterListener::bind(&path, Arc::new(WorkerRegistry::new())).unwrap();
        assert_eq!(listener.path(), path.as_path());
        drop(listener);
        let _ = std::fs::remove_file(&path);
    }
}
