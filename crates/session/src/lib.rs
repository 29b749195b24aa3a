//! USB analyzer session core
//!
//! This crate owns everything with real state in the analyzer: the
//! device directory snapshot, the single device session state machine
//! (connect, vendor control transfers, interrupt streaming), and the
//! reconciliation of hot-plug notifications against both. The
//! presentation shell talks to it through the channel bridge and
//! renders whatever comes back; it never touches the device handle.
//!
//! All session state transitions are owned by one blocking control
//! thread ([`worker::SessionWorkerThread`]); the async side drives it
//! through [`channel::SessionBridge`].

pub mod backend;
pub mod channel;
pub mod directory;
pub mod error;
pub mod session;
pub mod stream;
pub mod testing;
pub mod types;
pub mod worker;

pub use backend::libusb::LibusbBackend;
pub use backend::{HotplugEvent, PlatformBackend, PlatformDevice};
pub use channel::{
    SessionBridge, SessionCommand, SessionEvent, SessionWorker, create_session_bridge,
};
pub use directory::DeviceDirectory;
pub use error::{ConnectError, Error, PlatformError, Result, StreamError, TransferError};
pub use session::Session;
pub use types::{
    DeviceDescriptor, DeviceKey, DriverClass, EndpointId, SessionInfo, TransferOutcome,
    TransferRequest,
};
pub use worker::spawn_session_worker;
