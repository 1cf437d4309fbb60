//! Update image container.
//!
//! Layout (little-endian):
//!
//! ```text
//! u32 sd_len, u32 bl_len, u32 app_len   start packet payload
//! [u8; 16] iv, [u8; 16] tag              init packet payload
//! sd ‖ bl ‖ app                          transferred in chunks
//! ```
//!
//! The IV and tag are left zeroed; they are reserved for an encryption step
//! that happens elsewhere.

use std::io::Cursor;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use thiserror::Error;
use tracing::{debug, info};

use super::locator::{SegmentKind, SegmentLayout};
use super::memory::{DEFAULT_PAD, SparseMemoryImage};

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("image is {len} bytes, shorter than the {min}-byte header")]
    TooShort { len: usize, min: usize },

    #[error("image contains no segments")]
    Empty,

    #[error("{kind} length {len} is not a multiple of 4")]
    Misaligned { kind: SegmentKind, len: u32 },

    #[error("unsupported image combination; application must be updated alone")]
    InvalidCombination,

    #[error("header declares {expected} payload bytes, image holds {actual}")]
    LengthMismatch { expected: u64, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The three segment lengths at the start of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerHeader {
    pub softdevice_len: u32,
    pub bootloader_len: u32,
    pub application_len: u32,
}

impl ContainerHeader {
    pub const SIZE: usize = 12;

    pub fn len_of(&self, kind: SegmentKind) -> u32 {
        match kind {
            SegmentKind::Softdevice => self.softdevice_len,
            SegmentKind::Bootloader => self.bootloader_len,
            SegmentKind::Application => self.application_len,
        }
    }

    pub fn payload_len(&self) -> u64 {
        self.softdevice_len as u64 + self.bootloader_len as u64 + self.application_len as u64
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_u32_into(
            &[self.softdevice_len, self.bootloader_len, self.application_len],
            &mut buf,
        );
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ContainerError> {
        if data.len() < Self::SIZE {
            return Err(ContainerError::TooShort {
                len: data.len(),
                min: Self::SIZE,
            });
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            softdevice_len: cursor.read_u32::<LittleEndian>()?,
            bootloader_len: cursor.read_u32::<LittleEndian>()?,
            application_len: cursor.read_u32::<LittleEndian>()?,
        })
    }

    /// Checks a device bootloader performs before accepting an update.
    pub fn validate(&self) -> Result<(), ContainerError> {
        if self.payload_len() == 0 {
            return Err(ContainerError::Empty);
        }
        for kind in SegmentKind::ALL {
            let len = self.len_of(kind);
            if len % 4 != 0 {
                return Err(ContainerError::Misaligned { kind, len });
            }
        }
        if self.application_len != 0 && (self.softdevice_len != 0 || self.bootloader_len != 0) {
            return Err(ContainerError::InvalidCombination);
        }
        Ok(())
    }
}

/// An assembled update image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageContainer {
    pub header: ContainerHeader,
    pub iv: [u8; 16],
    pub tag: [u8; 16],
    payload: Vec<u8>,
}

impl ImageContainer {
    /// Header, IV and tag.
    pub const PREFIX_SIZE: usize = ContainerHeader::SIZE + 32;

    /// Pack the located segments, in container order, into an image.
    pub fn build(layout: &SegmentLayout, image: &SparseMemoryImage) -> Self {
        let mut header = ContainerHeader::default();
        let mut payload = Vec::new();

        for location in layout.iter() {
            let data = image.extract(location.start, location.end, DEFAULT_PAD);
            debug!(kind = %location.kind, bytes = data.len(), "Extracted segment");
            let len = location.len();
            match location.kind {
                SegmentKind::Softdevice => header.softdevice_len = len,
                SegmentKind::Bootloader => header.bootloader_len = len,
                SegmentKind::Application => header.application_len = len,
            }
            payload.extend_from_slice(&data);
        }

        Self {
            header,
            iv: [0; 16],
            tag: [0; 16],
            payload,
        }
    }

    /// Parse a container, rejecting anything a device would refuse.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ContainerError> {
        if data.len() < Self::PREFIX_SIZE {
            return Err(ContainerError::TooShort {
                len: data.len(),
                min: Self::PREFIX_SIZE,
            });
        }
        let header = ContainerHeader::from_bytes(data)?;
        header.validate()?;

        let payload = &data[Self::PREFIX_SIZE..];
        if header.payload_len() != payload.len() as u64 {
            return Err(ContainerError::LengthMismatch {
                expected: header.payload_len(),
                actual: payload.len(),
            });
        }

        let mut iv = [0u8; 16];
        let mut tag = [0u8; 16];
        iv.copy_from_slice(&data[ContainerHeader::SIZE..ContainerHeader::SIZE + 16]);
        tag.copy_from_slice(&data[ContainerHeader::SIZE + 16..Self::PREFIX_SIZE]);

        Ok(Self {
            header,
            iv,
            tag,
            payload: payload.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_len());
        buf.extend_from_slice(&self.start_packet());
        buf.extend_from_slice(&self.init_packet());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ContainerError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let container = Self::from_bytes(&data)?;
        info!(
            path = %path.display(),
            sd = container.header.softdevice_len,
            bl = container.header.bootloader_len,
            app = container.header.application_len,
            "Loaded image"
        );
        Ok(container)
    }

    /// Write the container to `path`, returning the number of bytes written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<usize, ContainerError> {
        let bytes = self.to_bytes();
        std::fs::write(path, &bytes)?;
        Ok(bytes.len())
    }

    /// Payload of the Start request.
    pub fn start_packet(&self) -> [u8; ContainerHeader::SIZE] {
        self.header.to_bytes()
    }

    /// Payload of the Init request.
    pub fn init_packet(&self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        buf[..16].copy_from_slice(&self.iv);
        buf[16..].copy_from_slice(&self.tag);
        buf
    }

    /// Segment data streamed by ImageTransfer requests.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn total_len(&self) -> usize {
        Self::PREFIX_SIZE + self.payload.len()
    }
}

/// Header-shaped record wrapping `payload`, as consumed by the image signer.
pub(crate) fn header_record(lengths: [u32; 3], payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; ImageContainer::PREFIX_SIZE];
    LittleEndian::write_u32_into(&lengths, &mut buf[..ContainerHeader::SIZE]);
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::locator::SegmentLocation;
    use crate::image::memory::MemorySource;

    fn layout_with(sd: Option<(u32, u32)>, bl: Option<(u32, u32)>) -> SegmentLayout {
        let loc = |kind, (start, end)| SegmentLocation { kind, start, end };
        SegmentLayout {
            softdevice: sd.map(|r| loc(SegmentKind::Softdevice, r)),
            bootloader: bl.map(|r| loc(SegmentKind::Bootloader, r)),
            application: None,
        }
    }

    #[test]
    fn test_build_softdevice_and_bootloader() {
        let image = SparseMemoryImage::merge([
            MemorySource::from_bytes("sd", 0x1000, vec![0x11; 4096]).unwrap(),
            MemorySource::from_bytes("bl", 0x3a800, vec![0x22; 8000]).unwrap(),
        ])
        .unwrap();
        let layout = layout_with(Some((0x1000, 0x2000)), Some((0x3a800, 0x3c800)));

        let container = ImageContainer::build(&layout, &image);
        let bytes = container.to_bytes();

        assert_eq!(bytes.len(), 12 + 32 + 4096 + 8192);
        let header = ContainerHeader::from_bytes(&bytes).unwrap();
        assert_eq!(
            (header.softdevice_len, header.bootloader_len, header.application_len),
            (4096, 8192, 0)
        );
        assert!(bytes[12..44].iter().all(|&b| b == 0));
        assert!(bytes[44..44 + 4096].iter().all(|&b| b == 0x11));
        // Bootloader data runs short of its extent and is padded.
        let bl = &bytes[44 + 4096..];
        assert!(bl[..8000].iter().all(|&b| b == 0x22));
        assert!(bl[8000..].iter().all(|&b| b == 0xFF));

        assert_eq!(ImageContainer::from_bytes(&bytes).unwrap(), container);
    }

    #[test]
    fn test_packets_split_prefix() {
        let image = SparseMemoryImage::merge([MemorySource::from_bytes(
            "app",
            0x18000,
            vec![0xA5; 64],
        )
        .unwrap()])
        .unwrap();
        let layout = SegmentLayout {
            application: Some(SegmentLocation {
                kind: SegmentKind::Application,
                start: 0x18000,
                end: 0x18040,
            }),
            ..Default::default()
        };
        let container = ImageContainer::build(&layout, &image);
        assert_eq!(container.start_packet(), [0, 0, 0, 0, 0, 0, 0, 0, 64, 0, 0, 0]);
        assert_eq!(container.init_packet(), [0u8; 32]);
        assert_eq!(container.payload(), &[0xA5; 64][..]);
    }

    #[test]
    fn test_from_bytes_sanity_checks() {
        let with = |lengths: [u32; 3], payload_len: usize| {
            header_record(lengths, &vec![0u8; payload_len])
        };

        assert!(matches!(
            ImageContainer::from_bytes(&[0u8; 43]),
            Err(ContainerError::TooShort { len: 43, .. })
        ));
        assert!(matches!(
            ImageContainer::from_bytes(&with([0, 0, 0], 0)),
            Err(ContainerError::Empty)
        ));
        assert!(matches!(
            ImageContainer::from_bytes(&with([0, 6, 0], 6)),
            Err(ContainerError::Misaligned {
                kind: SegmentKind::Bootloader,
                len: 6
            })
        ));
        assert!(matches!(
            ImageContainer::from_bytes(&with([4, 0, 4], 8)),
            Err(ContainerError::InvalidCombination)
        ));
        assert!(matches!(
            ImageContainer::from_bytes(&with([0, 0, 8], 12)),
            Err(ContainerError::LengthMismatch {
                expected: 8,
                actual: 12
            })
        ));
        assert!(ImageContainer::from_bytes(&with([0, 0, 8], 8)).is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");
        let container = ImageContainer::from_bytes(&header_record([8, 4, 0], &[7u8; 12])).unwrap();

        let written = container.save_to_file(&path).unwrap();
        assert_eq!(written, 56);
        assert_eq!(ImageContainer::load_from_file(&path).unwrap(), container);
    }
}
