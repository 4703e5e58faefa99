//! Clipboard sharing over LAN multicast.
//!
//! A sender announces its clipboard to a multicast group once per interval.
//! Clips too large for one datagram are announced as a pointer and served in
//! full by a TCP fallback server on the sender.

pub mod announcer;
pub mod clipboard;
pub mod config;
pub mod deadline;
pub mod duration_serde;
pub mod fallback;
pub mod interfaces;
pub mod protocol;
pub mod receiver;

pub use announcer::{AnnounceError, AnnounceSettings, Announcer, TickReport};
pub use clipboard::{ClipboardAccess, ClipboardError, MemoryClipboard, Snapshot, SystemClipboard};
pub use config::{Config, ConfigError};
pub use deadline::{run_with_deadline, Outcome};
pub use interfaces::{InterfaceError, Multicasters};
pub use protocol::{Envelope, Kind, ProtocolError};
pub use receiver::{ReceiveError, ReceiveSettings, Received, Receiver};
