//! Node-to-node transfer (component C10): connection handshake, the
//! sender/receiver transfer state machines, and retry/backoff, all
//! built on the wire framing in `jsi-protocol`.

pub mod connection;
pub mod framing;
pub mod receiver;
pub mod retry;
pub mod sender;

pub use connection::{handshake_client, handshake_server, PeerInfo, FLAG_PULL};
pub use receiver::{serve, ServeHandle};
pub use retry::Backoff;
pub use sender::{pull, push, PushSummary};
