pub mod connection;
pub mod session;
pub mod url;

pub use connection::{
    encode_close_payload, DataCallback, FrameKind, MessageAssembler, RetryPolicy,
    WebSocketCloseCode, WebSocketConnection,
};
pub use session::{LoopMetrics, Session, SessionStatus};
pub use url::normalize_url;
