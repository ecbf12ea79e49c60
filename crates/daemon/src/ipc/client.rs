//! IPC Client for communicating with the daemon via Unix Domain Sockets.

use std::io;
use std::path::Path;
use std::time::Duration;

use termshare_protocol::{Metadata, RegistrySnapshot};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;

/// Default timeout for client operations in seconds.
///
/// Opening a session may wait for a user server to start, so this is longer
/// than the default startup deadline.
const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect to the daemon with a custom timeout.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;

        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request to the daemon and wait for a response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.send_internal(request))
            .await
            .map_err(|_| timed_out("operation timed out"))?
    }

    async fn send_internal(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }

        Ok(serde_json::from_str(line.trim())?)
    }

    /// Returns `true` if the daemon responds with a Pong.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    /// Get the current status of the daemon.
    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    /// Request the daemon to stop.
    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Stop).await
    }

    /// Fetch a snapshot of every session.
    pub async fn list_sessions(&mut self) -> Result<RegistrySnapshot, IpcError> {
        match self.send(IpcRequest::ListSessions).await? {
            IpcResponse::Sessions { sessions } => Ok(sessions),
            other => Err(IpcError::UnexpectedResponse(Box::new(other))),
        }
    }

    pub async fn open_session(
        &mut self,
        username: &str,
        metadata: Option<Metadata>,
    ) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::OpenSession {
            username: username.to_string(),
            metadata,
        })
        .await
    }

    pub async fn join_session(
        &mut self,
        sid: &str,
        username: &str,
        metadata: Option<Metadata>,
    ) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::JoinSession {
            sid: sid.to_string(),
            username: username.to_string(),
            metadata,
        })
        .await
    }

    pub async fn remove_user(&mut self, sid: &str, username: &str) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::RemoveUser {
            sid: sid.to_string(),
            username: username.to_string(),
        })
        .await
    }

    pub async fn invite(&mut self, sid: &str, username: &str) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Invite {
            sid: sid.to_string(),
            username: username.to_string(),
        })
        .await
    }

    pub async fn claim(&mut self, token: &str) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Claim {
            token: token.to_string(),
        })
        .await
    }
}

fn timed_out(message: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, message.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::server::IpcServer;
    use tempfile::tempdir;

    /// Serves exactly one request with a canned response.
    async fn one_shot_server(
        socket_path: &Path,
        expected: IpcRequest,
        response: IpcResponse,
    ) -> tokio::task::JoinHandle<()> {
        let server = IpcServer::bind(socket_path).await.unwrap();
        tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            let request = conn.read_request().await.unwrap().unwrap();
            assert_eq!(request, expected);
            conn.send_response(&response).await.unwrap();
        })
    }

    #[tokio::test]
    async fn test_client_connect_fails_when_daemon_not_running() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nonexistent.sock");

        assert!(IpcClient::connect(&socket_path).await.is_err());
    }

    #[tokio::test]
    async fn test_client_ping() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = one_shot_server(&socket_path, IpcRequest::Ping, IpcResponse::Pong).await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert!(client.ping().await.unwrap());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_list_sessions() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let mut sessions = RegistrySnapshot::new();
        sessions.insert("sid-1".to_string(), Default::default());
        let server = one_shot_server(
            &socket_path,
            IpcRequest::ListSessions,
            IpcResponse::Sessions {
                sessions: sessions.clone(),
            },
        )
        .await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert_eq!(client.list_sessions().await.unwrap(), sessions);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_list_sessions_unexpected_response() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = one_shot_server(
            &socket_path,
            IpcRequest::ListSessions,
            IpcResponse::error("boom"),
        )
        .await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        let result = client.list_sessions().await;
        assert!(matches!(result, Err(IpcError::UnexpectedResponse(_))));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_claim() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let expected = IpcResponse::Claimed {
            sid: "sid-1".to_string(),
            username: "alice".to_string(),
        };
        let server = one_shot_server(
            &socket_path,
            IpcRequest::Claim {
                token: "tok".to_string(),
            },
            expected.clone(),
        )
        .await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert_eq!(client.claim("tok").await.unwrap(), expected);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_timeout() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        // Server that never responds
        let _server_handle = tokio::spawn(async move {
            let _conn = server.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut client = IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
            .await
            .unwrap();

        assert!(client.ping().await.is_err());
    }
}
