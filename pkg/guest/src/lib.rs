//! Host side of the guest agent channel.
//!
//! The guest agent listens on a vsock port and speaks length-prefixed JSON:
//! requests carry an id and get exactly one response; process exits are
//! pushed unsolicited and matched by pid.

pub mod channel;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod vsock;

pub use channel::{ExecResult, GuestChannel, SpawnResult};
pub use error::GuestError;
pub use protocol::ProcessExit;
pub use vsock::VsockChannel;
