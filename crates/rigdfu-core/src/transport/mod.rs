//! Transport layer module.

pub mod mock;
pub mod serial;
pub mod traits;

pub use mock::MockTransport;
pub use self::serial::SerialTransport;
pub use traits::{ByteTransport, TransportError};
