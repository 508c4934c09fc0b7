// Host side of the installer RPC protocol.
// Length-prefixed JSON frames over a named pipe (TCP as fallback), with callbacks in both directions.

pub mod callbacks;
pub mod connection;
pub mod params;
pub mod protocol;
pub mod transport;

pub use callbacks::{Callback, CallbackRegistry};
pub use connection::{Connection, RequestInfo, RpcError, WeakConnection};
pub use params::Arg;
pub use protocol::{CallbackId, Frame, ProtocolError, RemoteError};
pub use transport::{BoxedStream, Endpoint, TransportError, TransportKind, TransportListener};

/// Prefix of pipe names and socket files created for installer sessions.
pub const PIPE_PREFIX: &str = "mod-installer";

/// Frames above this size are a transport failure.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
