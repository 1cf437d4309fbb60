//! Image assembly: memory dumps in, update container out.

pub mod container;
pub mod hexfile;
pub mod locator;
pub mod memory;

pub use container::{ContainerError, ContainerHeader, ImageContainer};
pub use hexfile::{load_binary_file, load_hex_file, parse_intel_hex};
pub use locator::{
    LocateError, RegionLocator, SegmentKind, SegmentLayout, SegmentLocation, SegmentRequest,
};
pub use memory::{DEFAULT_PAD, MemoryError, MemoryRegion, MemorySource, SparseMemoryImage};
