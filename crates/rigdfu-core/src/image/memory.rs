//! Sparse memory image built from one or more memory dumps.
//!
//! Every dump (hex file, raw binary) is first turned into a [`MemorySource`]:
//! a named list of contiguous regions. Sources are merged into a
//! [`SparseMemoryImage`], which keeps its regions in a `BTreeMap` keyed by
//! start address so that iteration is always in ascending address order.
//!
//! Overlapping data is only tolerated when it is the exact same region
//! (same bounds, same bytes) loaded twice.

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use tracing::{debug, trace};

/// Fill value for addresses that hold no data (erased flash).
pub const DEFAULT_PAD: u8 = 0xFF;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("data region [0x{start:05X}-0x{end:05X}] in {origin} overlaps earlier data")]
    ConflictingRegion { start: u32, end: u32, origin: String },

    #[error("no data available at 0x{addr:08X}")]
    OutOfRange { addr: u32 },

    #[error("region at 0x{start:08X} ({len} bytes) in {origin} runs past the 32-bit address space")]
    AddressOverflow {
        start: u32,
        len: usize,
        origin: String,
    },

    #[error("invalid Intel HEX in {origin} (line {line}): {message}")]
    HexParse {
        origin: String,
        line: usize,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A contiguous run of bytes starting at `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u32,
    pub data: Vec<u8>,
}

impl MemoryRegion {
    /// Exclusive end address.
    pub fn end(&self) -> u32 {
        // Construction through `MemorySource::push` guarantees this fits.
        self.start + self.data.len() as u32
    }
}

/// Regions read from one dump, tagged with a display name for error reports.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    name: String,
    regions: Vec<MemoryRegion>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            regions: Vec::new(),
        }
    }

    /// Source holding a single block of bytes at `base`.
    pub fn from_bytes(name: impl Into<String>, base: u32, data: Vec<u8>) -> Result<Self, MemoryError> {
        let mut source = Self::new(name);
        source.push(base, data)?;
        Ok(source)
    }

    /// Append data at `start`. Data that directly continues the previous
    /// region is coalesced into it.
    pub fn push(&mut self, start: u32, data: Vec<u8>) -> Result<(), MemoryError> {
        if start as u64 + data.len() as u64 > u32::MAX as u64 {
            return Err(MemoryError::AddressOverflow {
                start,
                len: data.len(),
                origin: self.name.clone(),
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        if let Some(last) = self.regions.last_mut()
            && last.end() == start
        {
            last.data.extend_from_slice(&data);
            return Ok(());
        }

        self.regions.push(MemoryRegion { start, data });
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Disjoint memory regions keyed by start address.
#[derive(Debug, Clone, Default)]
pub struct SparseMemoryImage {
    regions: BTreeMap<u32, Vec<u8>>,
}

impl SparseMemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge all sources, in order, into a fresh image.
    pub fn merge<I>(sources: I) -> Result<Self, MemoryError>
    where
        I: IntoIterator<Item = MemorySource>,
    {
        let mut image = Self::new();
        for source in sources {
            image.add_source(&source)?;
        }
        Ok(image)
    }

    /// Merge one more source into this image.
    pub fn add_source(&mut self, source: &MemorySource) -> Result<(), MemoryError> {
        let mut incoming: Vec<&MemoryRegion> = source.regions().iter().collect();
        incoming.sort_by_key(|r| r.start);

        for region in incoming {
            if region.data.is_empty() {
                continue;
            }
            let (start, end) = (region.start, region.end());

            let mut duplicate = false;
            for (&ostart, odata) in &self.regions {
                let oend = ostart + odata.len() as u32;
                if start < oend && end > ostart {
                    if start == ostart && end == oend && region.data == *odata {
                        duplicate = true;
                        continue;
                    }
                    return Err(MemoryError::ConflictingRegion {
                        start,
                        end,
                        origin: source.name().to_string(),
                    });
                }
            }

            if duplicate {
                trace!(start = %format!("0x{:05X}", start), source = source.name(), "Identical region already present");
            } else {
                self.regions.insert(start, region.data.clone());
            }
        }

        debug!(
            source = source.name(),
            regions = self.regions.len(),
            bytes = self.data_len(),
            "Merged memory source"
        );
        Ok(())
    }

    /// Tightest `[lo, hi)` inside `[min_addr, max_addr)` that holds data,
    /// with `lo` rounded down and `hi` rounded up to `round_to`.
    ///
    /// Returns `None` when nothing intersects the window.
    pub fn extents(&self, min_addr: u32, max_addr: u32, round_to: u32) -> Option<(u32, u32)> {
        let mut ext_min = None;
        let mut ext_max = None;

        for (&start, data) in &self.regions {
            let end = start + data.len() as u32;
            if ext_min.is_none() && min_addr < end {
                ext_min = Some(min_addr.max(start));
            }
            if ext_min.is_some() && max_addr > start {
                ext_max = Some(max_addr.min(end));
            }
        }

        let (lo, hi) = (ext_min?, ext_max?);
        let round = round_to.max(1) as u64;
        let lo = lo as u64 - (lo as u64 % round);
        let hi = (hi as u64).div_ceil(round) * round;
        Some((lo as u32, hi.min(u32::MAX as u64) as u32))
    }

    /// Exactly `max_addr - min_addr` bytes; gaps are filled with `pad`.
    pub fn extract(&self, min_addr: u32, max_addr: u32, pad: u8) -> Vec<u8> {
        if max_addr <= min_addr {
            return Vec::new();
        }

        let total = (max_addr - min_addr) as usize;
        let mut buf = Vec::with_capacity(total);
        let mut addr = min_addr;

        for (&start, data) in self.regions.range(..max_addr) {
            let end = start + data.len() as u32;
            if addr >= end {
                continue;
            }
            if addr < start {
                buf.resize(buf.len() + (start - addr) as usize, pad);
                addr = start;
            }
            let end = end.min(max_addr);
            buf.extend_from_slice(&data[(addr - start) as usize..(end - start) as usize]);
            addr = end;
        }

        buf.resize(total, pad);
        buf
    }

    /// Little-endian word at `addr`. Missing bytes inside the word read as
    /// [`DEFAULT_PAD`]; a word with no stored byte at all is out of range.
    pub fn read_u32_le(&self, addr: u32) -> Result<u32, MemoryError> {
        let end = addr
            .checked_add(4)
            .ok_or(MemoryError::OutOfRange { addr })?;
        if !self.has_data(addr, end) {
            return Err(MemoryError::OutOfRange { addr });
        }
        Ok(LittleEndian::read_u32(&self.extract(addr, end, DEFAULT_PAD)))
    }

    /// Whether any stored byte falls inside `[min_addr, max_addr)`.
    pub fn has_data(&self, min_addr: u32, max_addr: u32) -> bool {
        self.regions
            .range(..max_addr)
            .any(|(&start, data)| start + data.len() as u32 > min_addr)
    }

    /// Regions in ascending address order.
    pub fn regions(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.regions.iter().map(|(&start, data)| (start, data.as_slice()))
    }

    /// Number of stored regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Total number of stored bytes.
    pub fn data_len(&self) -> usize {
        self.regions.values().map(Vec::len).sum()
    }
}
