//! Remote inspection of tile residency
//!
//! A client connects over TCP and sends one JSON command per line; each
//! command gets one JSON response line. The application supplies a
//! [`DebugHandler`] that answers from its own state:
//! ```ignore
//! let handler = Arc::new(Mutex::new(MyHandler::new()));
//! let _server = DebugServer::start(handler, DEFAULT_PORT);
//! ```

pub mod protocol;
pub mod server;

pub use protocol::*;
pub use server::{DebugHandler, DebugServer, SharedHandler, MAX_LINE_BYTES};

/// Default debug server port
pub const DEFAULT_PORT: u16 = 9743;
