//! IPC server for operator commands over a Unix Domain Socket.
//!
//! The daemon binds one socket, accepts any number of CLI connections and
//! answers each newline-delimited JSON request with exactly one response.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use super::messages::{IpcRequest, IpcResponse};
use crate::process::BoxFuture;

/// Longest accepted request line.
const MAX_REQUEST_BYTES: u64 = 64 * 1024;

/// Answers IPC requests.
pub trait IpcHandler: Send + Sync + 'static {
    fn handle(&self, request: IpcRequest) -> BoxFuture<'_, IpcResponse>;
}

/// A server that listens for IPC connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to `path`.
    ///
    /// Parent directories are created with mode 0700. A stale socket file
    /// at `path` is replaced.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
                }
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }

    /// Answer requests with `handler` until `shutdown` is cancelled, then
    /// remove the socket file.
    pub async fn serve<H: IpcHandler>(self, handler: Arc<H>, shutdown: CancellationToken) {
        tracing::info!("IPC listening on {}", self.path.display());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept() => match accepted {
                    Ok(conn) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            if let Err(e) = conn.answer_all(handler.as_ref()).await {
                                tracing::debug!("IPC connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("IPC accept failed: {}", e),
                },
            }
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!("Failed to remove IPC socket {}: {}", self.path.display(), e);
        }
    }
}

/// A connection to an IPC client.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        let bytes_read = (&mut self.reader)
            .take(MAX_REQUEST_BYTES + 1)
            .read_line(&mut line)
            .await?;

        if bytes_read == 0 {
            return Ok(None);
        }
        if bytes_read as u64 > MAX_REQUEST_BYTES {
            return Err(IpcError::RequestTooLarge(bytes_read));
        }

        let request = serde_json::from_str(line.trim())?;
        Ok(Some(request))
    }

    /// Send a response to the client.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        Ok(())
    }

    /// Answer every request on this connection until the client leaves.
    ///
    /// A malformed request gets an `Error` response; the connection stays
    /// open.
    pub async fn answer_all<H: IpcHandler + ?Sized>(mut self, handler: &H) -> Result<(), IpcError> {
        loop {
            let response = match self.read_request().await {
                Ok(Some(request)) => {
                    tracing::debug!(?request, "IPC request");
                    handler.handle(request).await
                }
                Ok(None) => return Ok(()),
                Err(IpcError::Json(e)) => IpcResponse::Error {
                    message: format!("invalid request: {e}"),
                },
                Err(e) => return Err(e),
            };
            self.send_response(&response).await?;
        }
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request of {0} bytes exceeds the limit")]
    RequestTooLarge(usize),

    #[error("daemon did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("daemon closed the connection")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{Component, SessionKey};
    use tempfile::tempdir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct EchoHandler;

    impl IpcHandler for EchoHandler {
        fn handle(&self, request: IpcRequest) -> BoxFuture<'_, IpcResponse> {
            Box::pin(async move {
                match request {
                    IpcRequest::Ping => IpcResponse::Pong,
                    IpcRequest::ProcessStatus { key } => IpcResponse::Error {
                        message: format!("unknown {key}"),
                    },
                    _ => IpcResponse::Stopping,
                }
            })
        }
    }

    async fn roundtrip_line(path: &Path, line: &str) -> String {
        let stream = UnixStream::connect(path).await.unwrap();
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        write_half.write_all(line.as_bytes()).await.unwrap();
        write_half.flush().await.unwrap();
        let mut response = String::new();
        reader.read_line(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_server_bind_creates_private_parent_dirs() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nested").join("daemon.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
        assert_eq!(server.path(), socket_path.as_path());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(socket_path.parent().unwrap())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[tokio::test]
    async fn test_server_bind_replaces_stale_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");

        let first = IpcServer::bind(&socket_path).await.unwrap();
        drop(first);

        let _second = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_serve_answers_and_removes_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(Arc::new(EchoHandler), shutdown.clone()));

        let request = serde_json::to_string(&IpcRequest::ProcessStatus {
            key: SessionKey::new("bot-1", Component::Main),
        })
        .unwrap();
        let line = roundtrip_line(&socket_path, &format!("{request}\n")).await;
        let response: IpcResponse = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(
            response,
            IpcResponse::Error {
                message: "unknown bot-1/main".to_string()
            }
        );

        shutdown.cancel();
        task.await.unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_response() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(Arc::new(EchoHandler), shutdown.clone()));

        let line = roundtrip_line(&socket_path, "{not json}\n").await;
        let response: IpcResponse = serde_json::from_str(line.trim()).unwrap();
        assert!(matches!(response, IpcResponse::Error { .. }));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_connection_read_returns_none_on_disconnect() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        let socket_path_clone = socket_path.clone();
        tokio::spawn(async move {
            let _stream = UnixStream::connect(&socket_path_clone).await.unwrap();
        });

        let mut conn = server.accept().await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let request = conn.read_request().await.unwrap();
        assert!(request.is_none());
    }
}
