//! Memory dump loaders.
//!
//! Intel HEX files are the usual input; raw binaries can be placed at an
//! explicit base address.

use std::path::Path;

use ihex::Record;
use tracing::{debug, info};

use super::memory::{MemoryError, MemorySource};

/// Parse Intel HEX text into a memory source named `name`.
pub fn parse_intel_hex(name: &str, text: &str) -> Result<MemorySource, MemoryError> {
    let mut source = MemorySource::new(name);
    let mut base: u32 = 0;

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record = Record::from_record_string(line).map_err(|e| MemoryError::HexParse {
            origin: name.to_string(),
            line: index + 1,
            message: e.to_string(),
        })?;

        match record {
            Record::Data { offset, value } => {
                let addr = base
                    .checked_add(offset as u32)
                    .ok_or_else(|| MemoryError::AddressOverflow {
                        start: base,
                        len: value.len(),
                        origin: name.to_string(),
                    })?;
                source.push(addr, value)?;
            }
            Record::ExtendedSegmentAddress(segment) => base = (segment as u32) << 4,
            Record::ExtendedLinearAddress(upper) => base = (upper as u32) << 16,
            Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => {}
            Record::EndOfFile => break,
        }
    }

    debug!(source = name, regions = source.regions().len(), "Parsed Intel HEX");
    Ok(source)
}

/// Load an Intel HEX file from disk.
pub fn load_hex_file<P: AsRef<Path>>(path: P) -> Result<MemorySource, MemoryError> {
    let path = path.as_ref();
    info!(path = %path.display(), "Loading hex file");
    let text = std::fs::read_to_string(path)?;
    parse_intel_hex(&path.display().to_string(), &text)
}

/// Load a raw binary dump, placing its first byte at `base`.
pub fn load_binary_file<P: AsRef<Path>>(path: P, base: u32) -> Result<MemorySource, MemoryError> {
    let path = path.as_ref();
    info!(path = %path.display(), base = %format!("0x{:08X}", base), "Loading binary file");
    let data = std::fs::read(path)?;
    MemorySource::from_bytes(path.display().to_string(), base, data)
}
