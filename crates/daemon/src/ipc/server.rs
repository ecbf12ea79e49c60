//! IPC Server for handling CLI connections via Unix Domain Sockets.

use std::future::Future;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use super::messages::{IpcRequest, IpcResponse};

/// A server that listens for IPC connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Creates parent directories (mode 0700) and replaces a leftover socket
    /// file. The socket itself is restricted to the owner.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

        tracing::debug!("IPC server bound to {:?}", path);
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Returns the socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }

    /// Accepts connections until `shutdown` fires, answering each request
    /// with `handler`.
    ///
    /// Each connection runs on its own task. The socket file is removed on
    /// return.
    pub async fn serve<H, Fut>(self, handler: H, shutdown: CancellationToken)
    where
        H: Fn(IpcRequest) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = IpcResponse> + Send,
    {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept() => match accepted {
                    Ok(conn) => {
                        let handler = handler.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = conn.serve(handler, shutdown).await {
                                tracing::debug!("IPC connection ended with error: {}", e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("Failed to accept IPC connection: {}", e),
                },
            }
        }

        let _ = std::fs::remove_file(&self.path);
        tracing::debug!("IPC server stopped");
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
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Ok(None);
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

    /// Answers requests until the client disconnects or `shutdown` fires.
    ///
    /// Malformed lines get an error response; the connection stays open.
    pub async fn serve<H, Fut>(
        mut self,
        handler: H,
        shutdown: CancellationToken,
    ) -> Result<(), IpcError>
    where
        H: Fn(IpcRequest) -> Fut,
        Fut: Future<Output = IpcResponse>,
    {
        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                request = self.read_request() => request,
            };

            let response = match request {
                Ok(Some(request)) => handler(request).await,
                Ok(None) => return Ok(()),
                Err(IpcError::Json(e)) => IpcResponse::error(format!("malformed request: {e}")),
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

    /// The daemon answered with a response of the wrong kind.
    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(Box<IpcResponse>),
}
