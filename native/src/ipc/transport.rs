// Byte-stream transports: length-prefixed framing over a named pipe or TCP.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use super::{MAX_FRAME_SIZE, PIPE_PREFIX};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{kind} transport is not available on this platform")]
    Unavailable { kind: TransportKind },
    #[error("failed to bind {kind} endpoint: {message}")]
    Bind { kind: TransportKind, message: String },
    #[error("installer did not connect over {kind} within {timeout:?}")]
    ConnectTimeout {
        kind: TransportKind,
        timeout: Duration,
    },
    #[error("failed to accept {kind} connection: {message}")]
    Accept { kind: TransportKind, message: String },
    #[error("frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Which byte-stream carries the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    NamedPipe,
    Tcp,
}

impl TransportKind {
    pub fn alternate(self) -> Self {
        match self {
            TransportKind::NamedPipe => TransportKind::Tcp,
            TransportKind::Tcp => TransportKind::NamedPipe,
        }
    }

    /// Preferred transport first, its alternate once.
    pub fn attempt_order(self) -> [TransportKind; 2] {
        [self, self.alternate()]
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "named_pipe" | "pipe" | "namedpipe" => Some(TransportKind::NamedPipe),
            "tcp" => Some(TransportKind::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::NamedPipe => f.write_str("named pipe"),
            TransportKind::Tcp => f.write_str("TCP"),
        }
    }
}

/// Where the installer should connect, expressed as launch arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Pipe { name: String },
    Tcp { port: u16 },
}

impl Endpoint {
    pub fn kind(&self) -> TransportKind {
        match self {
            Endpoint::Pipe { .. } => TransportKind::NamedPipe,
            Endpoint::Tcp { .. } => TransportKind::Tcp,
        }
    }

    /// `<pipe-name> --pipe` or `<port>`.
    pub fn launch_args(&self) -> Vec<String> {
        match self {
            Endpoint::Pipe { name } => vec![name.clone(), "--pipe".to_string()],
            Endpoint::Tcp { port } => vec![port.to_string()],
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Pipe { name } => write!(f, "pipe {}", name),
            Endpoint::Tcp { port } => write!(f, "tcp 127.0.0.1:{}", port),
        }
    }
}

/// Duplex stream handed to the connection once the peer is attached.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Read one length-prefixed frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one length-prefixed frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Listening side of a transport, bound before the installer is launched.
pub enum TransportListener {
    #[cfg(windows)]
    Pipe {
        name: String,
        server: tokio::net::windows::named_pipe::NamedPipeServer,
    },
    #[cfg(unix)]
    Pipe {
        name: String,
        listener: tokio::net::UnixListener,
        _socket: SocketFile,
    },
    Tcp {
        listener: TcpListener,
        port: u16,
    },
}

impl TransportListener {
    pub async fn bind(kind: TransportKind) -> Result<Self, TransportError> {
        match kind {
            TransportKind::NamedPipe => Self::bind_pipe(),
            TransportKind::Tcp => {
                let listener = TcpListener::bind(("127.0.0.1", 0))
                    .await
                    .map_err(|e| TransportError::Bind {
                        kind,
                        message: e.to_string(),
                    })?;
                let port = listener.local_addr()?.port();
                debug!("[IPC] Listening on 127.0.0.1:{}", port);
                Ok(TransportListener::Tcp { listener, port })
            }
        }
    }

    #[cfg(windows)]
    fn bind_pipe() -> Result<Self, TransportError> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let name = format!(r"\\.\pipe\{}-{}", PIPE_PREFIX, uuid::Uuid::new_v4());
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&name)
            .map_err(|e| TransportError::Bind {
                kind: TransportKind::NamedPipe,
                message: e.to_string(),
            })?;
        debug!("[IPC] Created named pipe {}", name);
        Ok(TransportListener::Pipe { name, server })
    }

    #[cfg(unix)]
    fn bind_pipe() -> Result<Self, TransportError> {
        let path = std::env::temp_dir().join(format!("{}-{}.sock", PIPE_PREFIX, uuid::Uuid::new_v4()));
        let listener =
            tokio::net::UnixListener::bind(&path).map_err(|e| TransportError::Bind {
                kind: TransportKind::NamedPipe,
                message: e.to_string(),
            })?;
        debug!("[IPC] Created socket {:?}", path);
        Ok(TransportListener::Pipe {
            name: path.to_string_lossy().to_string(),
            listener,
            _socket: SocketFile(path),
        })
    }

    #[cfg(not(any(unix, windows)))]
    fn bind_pipe() -> Result<Self, TransportError> {
        Err(TransportError::Unavailable {
            kind: TransportKind::NamedPipe,
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        match self {
            #[cfg(any(unix, windows))]
            TransportListener::Pipe { name, .. } => Endpoint::Pipe { name: name.clone() },
            TransportListener::Tcp { port, .. } => Endpoint::Tcp { port: *port },
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.endpoint().kind()
    }

    /// Wait for the installer to attach. Consumes the listener: one peer per session.
    pub async fn accept(self, timeout: Duration) -> Result<BoxedStream, TransportError> {
        let kind = self.kind();
        let endpoint = self.endpoint();
        info!("[IPC] Waiting for installer on {} (timeout: {:?})", endpoint, timeout);

        let accepted = tokio::time::timeout(timeout, self.accept_inner()).await;
        match accepted {
            Ok(Ok(stream)) => {
                info!("[IPC] Installer connected over {}", kind);
                Ok(stream)
            }
            Ok(Err(e)) => {
                warn!("[IPC] Accept failed on {}: {}", endpoint, e);
                Err(TransportError::Accept {
                    kind,
                    message: e.to_string(),
                })
            }
            Err(_) => Err(TransportError::ConnectTimeout { kind, timeout }),
        }
    }

    async fn accept_inner(self) -> std::io::Result<BoxedStream> {
        match self {
            #[cfg(windows)]
            TransportListener::Pipe { server, .. } => {
                server.connect().await?;
                Ok(Box::new(server))
            }
            #[cfg(unix)]
            TransportListener::Pipe { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            TransportListener::Tcp { listener, .. } => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                debug!("[IPC] TCP peer {}", addr);
                Ok(Box::new(stream))
            }
        }
    }
}

/// Removes the unix socket file once the listener is gone.
#[cfg(unix)]
pub struct SocketFile(std::path::PathBuf);

#[cfg(unix)]
impl Drop for SocketFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_duplex_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, br#"{"type":"request"}"#).await.unwrap();
        write_frame(&mut a, b"").await.unwrap();

        let first = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(first, br#"{"type":"request"}"#.to_vec());
        let second = read_frame(&mut b).await.unwrap().unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn clean_close_reads_as_end_of_stream() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32 + 1).to_le_bytes();
        a.write_all(&len).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err, TransportError::FrameTooLarge(MAX_FRAME_SIZE + 1));
    }

    #[test]
    fn fallback_order_tries_each_transport_once() {
        assert_eq!(
            TransportKind::NamedPipe.attempt_order(),
            [TransportKind::NamedPipe, TransportKind::Tcp]
        );
        assert_eq!(
            TransportKind::Tcp.attempt_order(),
            [TransportKind::Tcp, TransportKind::NamedPipe]
        );
    }

    #[test]
    fn endpoints_render_launch_arguments() {
        let pipe = Endpoint::Pipe {
            name: "installer-1".to_string(),
        };
        assert_eq!(pipe.launch_args(), vec!["installer-1", "--pipe"]);
        assert_eq!(Endpoint::Tcp { port: 4242 }.launch_args(), vec!["4242"]);
    }

    #[tokio::test]
    async fn tcp_listener_accepts_a_peer() {
        let listener = TransportListener::bind(TransportKind::Tcp).await.unwrap();
        let port = match listener.endpoint() {
            Endpoint::Tcp { port } => port,
            other => panic!("unexpected endpoint {:?}", other),
        };

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            write_frame(&mut stream, b"hello").await.unwrap();
        });

        let mut stream = listener.accept(Duration::from_secs(5)).await.unwrap();
        assert_eq!(read_frame(&mut stream).await.unwrap().unwrap(), b"hello".to_vec());
        client.await.unwrap();
    }

    #[tokio::test]
    async fn accept_times_out_without_a_peer() {
        let listener = TransportListener::bind(TransportKind::Tcp).await.unwrap();
        let err = listener.accept(Duration::from_millis(50)).await.err().unwrap();
        assert!(matches!(
            err,
            TransportError::ConnectTimeout {
                kind: TransportKind::Tcp,
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_is_removed_with_the_listener() {
        let listener = TransportListener::bind(TransportKind::NamedPipe).await.unwrap();
        let path = match listener.endpoint() {
            Endpoint::Pipe { name } => std::path::PathBuf::from(name),
            other => panic!("unexpected endpoint {:?}", other),
        };
        assert!(path.exists());

        let connect_path = path.clone();
        let client = tokio::spawn(async move {
            let mut stream = tokio::net::UnixStream::connect(connect_path).await.unwrap();
            write_frame(&mut stream, b"ping").await.unwrap();
        });

        let mut stream = listener.accept(Duration::from_secs(5)).await.unwrap();
        assert_eq!(read_frame(&mut stream).await.unwrap().unwrap(), b"ping".to_vec());
        client.await.unwrap();
        assert!(!path.exists());
    }
}
