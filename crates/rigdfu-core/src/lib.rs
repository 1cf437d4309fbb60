//! RigDFU-Core: firmware image assembly and serial DFU for RigDFU loaders.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Image**: Sparse memory images, segment location, container assembly
//! - **Profile**: Per-device address windows loaded from TOML
//! - **Protocol**: Constants, opcodes, frame codec
//! - **Transport**: Byte-stream abstraction (serial port, mock)
//! - **State**: Update state machine and per-phase handlers
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//! - **Signer**: Key/MAC config packets and the external signer
//!
//! # Example
//!
//! ```no_run
//! use rigdfu_core::image::ImageContainer;
//! use rigdfu_core::session::{SessionConfig, UpdateSession};
//! use rigdfu_core::transport::SerialTransport;
//!
//! let config = SessionConfig::default();
//! let image = ImageContainer::load_from_file("app.bin").expect("bad image");
//! let port = SerialTransport::open("/dev/ttyUSB0", config.baud_rate).expect("no port");
//!
//! let mut session = UpdateSession::new(port, config);
//! session.run(&image).expect("DFU failed");
//! ```

pub mod events;
pub mod image;
pub mod profile;
pub mod protocol;
pub mod session;
pub mod signer;
pub mod state;
pub mod transport;

pub use events::{DfuEvent, DfuObserver, DfuPhase, NullObserver, TracingObserver};
pub use image::{ImageContainer, RegionLocator, SegmentRequest, SparseMemoryImage};
pub use profile::{AddressWindow, DeviceProfile};
pub use session::{SessionConfig, SessionError, UpdateSession};
pub use transport::{ByteTransport, MockTransport, SerialTransport};
