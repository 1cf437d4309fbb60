//! Locating softdevice, bootloader and application segments.
//!
//! The only trust signal available in a raw dump is the Cortex-M vector
//! table: a plausible initial stack pointer followed by a Thumb reset vector
//! pointing back into the candidate range. Candidates are scanned upwards in
//! page strides and the first match wins.
//!
//! Once a start address is accepted the segment is extended to cover all
//! data that follows it inside the window, not just the verified code.

use std::fmt;

use thiserror::Error;
use tracing::{debug, info};

use super::memory::SparseMemoryImage;
use crate::profile::{AddressWindow, DeviceProfile};

/// Rounding used for segment extents; flash writes are word sized.
const WORD: u32 = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LocateError {
    #[error("{0} requested, but no address could be determined for it")]
    SegmentNotFound(SegmentKind),

    #[error("unsupported image combination; application must be updated alone")]
    InvalidCombination,

    #[error("no softdevice, bootloader, or application found")]
    NoSegmentsFound,

    #[error("{kind} window 0x{start:X}-0x{end:X} is empty")]
    InvalidWindow { kind: SegmentKind, start: u32, end: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SegmentKind {
    Softdevice,
    Bootloader,
    Application,
}

impl SegmentKind {
    /// Container order.
    pub const ALL: [SegmentKind; 3] = [Self::Softdevice, Self::Bootloader, Self::Application];
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Softdevice => "Softdevice",
            Self::Bootloader => "Bootloader",
            Self::Application => "Application",
        };
        f.pad(name)
    }
}

/// A located segment, `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLocation {
    pub kind: SegmentKind,
    pub start: u32,
    pub end: u32,
}

impl SegmentLocation {
    pub fn new(kind: SegmentKind, window: AddressWindow) -> Self {
        Self {
            kind,
            start: window.start,
            end: window.end,
        }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for SegmentLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>12}: 0x{:05x} - 0x{:05x} ({} bytes)",
            self.kind,
            self.start,
            self.end,
            self.len()
        )
    }
}

/// Segments selected for an image. Application never coexists with the
/// other two.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentLayout {
    pub softdevice: Option<SegmentLocation>,
    pub bootloader: Option<SegmentLocation>,
    pub application: Option<SegmentLocation>,
}

impl SegmentLayout {
    pub fn get(&self, kind: SegmentKind) -> Option<&SegmentLocation> {
        match kind {
            SegmentKind::Softdevice => self.softdevice.as_ref(),
            SegmentKind::Bootloader => self.bootloader.as_ref(),
            SegmentKind::Application => self.application.as_ref(),
        }
    }

    /// Present segments in container order.
    pub fn iter(&self) -> impl Iterator<Item = &SegmentLocation> {
        SegmentKind::ALL.into_iter().filter_map(|kind| self.get(kind))
    }
}

/// Which segments the caller wants and where, if known.
///
/// With no `include_*` flag set, every segment that can be located (or has
/// a fixed window) is included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentRequest {
    pub include_softdevice: bool,
    pub include_bootloader: bool,
    pub include_application: bool,
    pub softdevice_window: Option<AddressWindow>,
    pub bootloader_window: Option<AddressWindow>,
    pub application_window: Option<AddressWindow>,
}

impl SegmentRequest {
    fn forced(&self, kind: SegmentKind) -> bool {
        match kind {
            SegmentKind::Softdevice => self.include_softdevice,
            SegmentKind::Bootloader => self.include_bootloader,
            SegmentKind::Application => self.include_application,
        }
    }

    fn fixed(&self, kind: SegmentKind) -> Option<AddressWindow> {
        match kind {
            SegmentKind::Softdevice => self.softdevice_window,
            SegmentKind::Bootloader => self.bootloader_window,
            SegmentKind::Application => self.application_window,
        }
    }

    fn search(&self) -> bool {
        !(self.include_softdevice || self.include_bootloader || self.include_application)
    }
}

/// Finds segment boundaries in a merged image using a device profile.
pub struct RegionLocator<'a> {
    image: &'a SparseMemoryImage,
    profile: &'a DeviceProfile,
}

impl<'a> RegionLocator<'a> {
    pub fn new(image: &'a SparseMemoryImage, profile: &'a DeviceProfile) -> Self {
        Self { image, profile }
    }

    /// Whether `[min_addr, max_addr)` starts with a plausible vector table.
    ///
    /// Missing words count as invalid.
    pub fn is_valid_code(&self, min_addr: u32, max_addr: u32) -> bool {
        let Ok(initial_sp) = self.image.read_u32_le(min_addr) else {
            return false;
        };
        let Some(reset) = min_addr
            .checked_add(4)
            .and_then(|addr| self.image.read_u32_le(addr).ok())
        else {
            return false;
        };

        let (min_sp, max_sp) = self.profile.stack_pointer_range();
        initial_sp % 4 == 0
            && (min_sp..=max_sp).contains(&initial_sp)
            && reset % 2 == 1
            && reset >= min_addr
            && reset < max_addr
    }

    /// First page-aligned candidate in `[lo, hi)` holding valid code.
    fn scan(&self, lo: u32, hi: u32) -> Option<u32> {
        let page = self.profile.device.page_size.max(1);
        let mut addr = lo;
        while addr < hi {
            if self.is_valid_code(addr, hi) {
                return Some(addr);
            }
            addr = addr.checked_add(page)?;
        }
        None
    }

    /// The softdevice must fill its configured window completely, and the
    /// end address it declares must bound a valid vector table.
    pub fn find_softdevice(&self) -> Option<AddressWindow> {
        if !self.profile.softdevice.compatible {
            return None;
        }
        let window = self.profile.softdevice_window();
        if self.image.extents(window.start, window.end, WORD) != Some((window.start, window.end)) {
            debug!(window = %window, "Softdevice window not fully covered");
            return None;
        }

        let end = self.image.read_u32_le(self.profile.softdevice.size_address).ok()?;
        if !self.is_valid_code(window.start, end) {
            debug!(end = %format!("0x{:05x}", end), "No valid softdevice vector table");
            return None;
        }

        let (_, hi) = self.image.extents(window.start, end, WORD)?;
        Some(AddressWindow::new(window.start, hi))
    }

    pub fn find_bootloader(&self) -> Option<AddressWindow> {
        if !self.profile.bootloader_supported() {
            return None;
        }
        let window = self.profile.bootloader_window();
        let (lo, hi) = self.image.extents(window.start, window.end, WORD)?;
        let addr = self.scan(lo, hi)?;
        let (start, end) = self.image.extents(addr, window.end, WORD)?;
        Some(AddressWindow::new(start, end))
    }

    /// `softdevice` and `bootloader` narrow the search window: the
    /// application ends where the bootloader starts and begins where the
    /// softdevice says it ends.
    pub fn find_application(
        &self,
        softdevice: Option<AddressWindow>,
        bootloader: Option<AddressWindow>,
    ) -> Option<AddressWindow> {
        let configured = self.profile.application_window();
        let (mut min_addr, mut max_addr) = (configured.start, configured.end);

        if let Some(bl) = bootloader {
            max_addr = bl.start;
        }
        if let Some(sd) = softdevice
            && let Some(end_word) = sd.start.checked_add(self.profile.softdevice.end_offset)
            && let Ok(sd_end) = self.image.read_u32_le(end_word)
        {
            let sd_window = self.profile.softdevice_window();
            if sd_end > sd_window.start && sd_end < sd_window.end {
                min_addr = sd_end;
            }
        }

        let (lo, hi) = self
            .image
            .extents(min_addr, max_addr, self.profile.device.page_size)?;
        let addr = self.scan(lo, hi)?;
        let (start, end) = self.image.extents(addr, hi, WORD)?;
        Some(AddressWindow::new(start, end))
    }

    /// Decide which segments go into the image and where each one lives.
    pub fn resolve(&self, request: &SegmentRequest) -> Result<SegmentLayout, LocateError> {
        for kind in SegmentKind::ALL {
            if let Some(w) = request.fixed(kind)
                && w.is_empty()
            {
                return Err(LocateError::InvalidWindow {
                    kind,
                    start: w.start,
                    end: w.end,
                });
            }
        }

        let softdevice = request.softdevice_window.or_else(|| self.find_softdevice());
        let bootloader = request.bootloader_window.or_else(|| self.find_bootloader());
        let application = request
            .application_window
            .or_else(|| self.find_application(softdevice, bootloader));

        let search = request.search();
        let select = |kind: SegmentKind,
                      found: Option<AddressWindow>|
         -> Result<Option<SegmentLocation>, LocateError> {
            if !(request.forced(kind) || (search && found.is_some())) {
                return Ok(None);
            }
            let window = found.ok_or(LocateError::SegmentNotFound(kind))?;
            Ok(Some(SegmentLocation::new(kind, window)))
        };

        let layout = SegmentLayout {
            softdevice: select(SegmentKind::Softdevice, softdevice)?,
            bootloader: select(SegmentKind::Bootloader, bootloader)?,
            application: select(SegmentKind::Application, application)?,
        };

        if layout.iter().next().is_none() {
            return Err(LocateError::NoSegmentsFound);
        }
        if layout.application.is_some()
            && (layout.softdevice.is_some() || layout.bootloader.is_some())
        {
            return Err(LocateError::InvalidCombination);
        }

        for location in layout.iter() {
            info!("{}", location);
        }
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::memory::MemorySource;

    const PROFILE: &str = r#"
name = "test"

[device]
page_size = 0x400
min_stack_pointer = 0x20000000
max_stack_pointer = 0x20004000

[softdevice]
min_address = 0x1000
max_address = 0x2000
size_address = 0x1ff8
end_offset = 0xff8

[bootloader]
min_address = 0x8000
max_address = 0xa000

[application]
min_address = 0x1000
max_address = 0x8000
"#;

    fn profile() -> DeviceProfile {
        DeviceProfile::from_toml_str(PROFILE).unwrap()
    }

    fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// `len` zero bytes at `base` starting with the given vector table.
    fn code(name: &str, base: u32, len: usize, sp: u32, reset: u32) -> MemorySource {
        let mut data = vec![0u8; len];
        put_u32(&mut data, 0, sp);
        put_u32(&mut data, 4, reset);
        MemorySource::from_bytes(name, base, data).unwrap()
    }

    fn softdevice() -> MemorySource {
        let mut data = vec![0u8; 0x1000];
        put_u32(&mut data, 0, 0x2000_2000);
        put_u32(&mut data, 4, 0x1101);
        // Declared end, also read as the application start.
        put_u32(&mut data, 0xff8, 0x1c00);
        MemorySource::from_bytes("sd.hex", 0x1000, data).unwrap()
    }

    fn bootloader() -> MemorySource {
        code("bl.hex", 0x8800, 0x800, 0x2000_3000, 0x8901)
    }

    fn application() -> MemorySource {
        code("app.hex", 0x4000, 0x1000, 0x2000_4000, 0x4101)
    }

    fn image(sources: Vec<MemorySource>) -> SparseMemoryImage {
        SparseMemoryImage::merge(sources).unwrap()
    }

    fn loc(kind: SegmentKind, start: u32, end: u32) -> Option<SegmentLocation> {
        Some(SegmentLocation { kind, start, end })
    }

    #[test]
    fn test_is_valid_code() {
        let profile = profile();
        let cases = [
            (0x2000_1000, 0x0101, true),
            (0x2000_1002, 0x0101, false), // misaligned stack pointer
            (0x1FFF_FFFC, 0x0101, false), // stack pointer below range
            (0x2000_4004, 0x0101, false), // stack pointer above range
            (0x2000_1000, 0x0100, false), // even reset vector
            (0x2000_1000, 0x0401, false), // reset vector past window
        ];
        for (sp, reset, expected) in cases {
            let img = image(vec![code("x", 0x0, 0x400, sp, reset)]);
            let locator = RegionLocator::new(&img, &profile);
            assert_eq!(
                locator.is_valid_code(0x0, 0x400),
                expected,
                "sp={sp:#x} reset={reset:#x}"
            );
        }

        let img = image(vec![code("x", 0x100, 0x400, 0x2000_1000, 0x00F1)]);
        let locator = RegionLocator::new(&img, &profile);
        assert!(!locator.is_valid_code(0x100, 0x500), "reset below window");
        assert!(!locator.is_valid_code(0x1000, 0x2000), "no data");
    }

    #[test]
    fn test_find_softdevice() {
        let profile = profile();
        let img = image(vec![softdevice()]);
        let locator = RegionLocator::new(&img, &profile);
        assert_eq!(
            locator.find_softdevice(),
            Some(AddressWindow::new(0x1000, 0x1c00))
        );
    }

    #[test]
    fn test_softdevice_requires_full_window() {
        let profile = profile();
        let img = image(vec![code("sd.hex", 0x1000, 0x800, 0x2000_2000, 0x1101)]);
        let locator = RegionLocator::new(&img, &profile);
        assert_eq!(locator.find_softdevice(), None);
    }

    #[test]
    fn test_incompatible_profile_skips_softdevice_and_bootloader() {
        let mut profile = profile();
        profile.softdevice.compatible = false;
        let img = image(vec![softdevice(), bootloader()]);
        let locator = RegionLocator::new(&img, &profile);
        assert_eq!(locator.find_softdevice(), None);
        assert_eq!(locator.find_bootloader(), None);
    }

    #[test]
    fn test_bootloader_scan_uses_page_strides() {
        let profile = profile();
        let mut data = vec![0u8; 0x1000];
        // Junk at the first page, vector table at the second.
        put_u32(&mut data, 0, 0xDEAD_BEEF);
        put_u32(&mut data, 0x400, 0x2000_3000);
        put_u32(&mut data, 0x404, 0x8501);
        let img = image(vec![MemorySource::from_bytes("bl.hex", 0x8000, data).unwrap()]);
        let locator = RegionLocator::new(&img, &profile);
        assert_eq!(
            locator.find_bootloader(),
            Some(AddressWindow::new(0x8400, 0x9000))
        );
    }

    #[test]
    fn test_application_start_follows_softdevice() {
        let profile = profile();
        let img = image(vec![softdevice(), application()]);
        let locator = RegionLocator::new(&img, &profile);

        let sd = locator.find_softdevice();
        assert!(sd.is_some());
        assert_eq!(
            locator.find_application(sd, None),
            Some(AddressWindow::new(0x4000, 0x5000))
        );
        // Without the softdevice hint, its vector table looks like an app.
        assert_eq!(
            locator.find_application(None, None),
            Some(AddressWindow::new(0x1000, 0x5000))
        );
    }

    #[test]
    fn test_application_ends_at_bootloader() {
        let profile = profile();
        let img = image(vec![application()]);
        let locator = RegionLocator::new(&img, &profile);
        let bl = Some(AddressWindow::new(0x4800, 0x5000));
        assert_eq!(
            locator.find_application(None, bl),
            Some(AddressWindow::new(0x4000, 0x4800))
        );
    }

    #[test]
    fn test_extent_covers_trailing_data_past_verified_code() {
        // Only the vector table at 0x4000 is verified; unrelated data further
        // up the window still ends up inside the located segment.
        let profile = profile();
        let img = image(vec![
            application(),
            MemorySource::from_bytes("tail.hex", 0x6000, vec![0x55; 0x100]).unwrap(),
        ]);
        let locator = RegionLocator::new(&img, &profile);
        assert_eq!(
            locator.find_application(None, None),
            Some(AddressWindow::new(0x4000, 0x6100))
        );
    }

    #[test]
    fn test_resolve_search_softdevice_and_bootloader() {
        let profile = profile();
        let img = image(vec![softdevice(), bootloader()]);
        let layout = RegionLocator::new(&img, &profile)
            .resolve(&SegmentRequest::default())
            .unwrap();
        assert_eq!(layout.softdevice, loc(SegmentKind::Softdevice, 0x1000, 0x1c00));
        assert_eq!(layout.bootloader, loc(SegmentKind::Bootloader, 0x8800, 0x9000));
        assert_eq!(layout.application, None);
    }

    #[test]
    fn test_resolve_search_application_only() {
        let profile = profile();
        let img = image(vec![application()]);
        let layout = RegionLocator::new(&img, &profile)
            .resolve(&SegmentRequest::default())
            .unwrap();
        assert_eq!(layout.iter().count(), 1);
        assert_eq!(layout.application, loc(SegmentKind::Application, 0x4000, 0x5000));
    }

    #[test]
    fn test_resolve_search_rejects_full_dump() {
        let profile = profile();
        let img = image(vec![softdevice(), application(), bootloader()]);
        let locator = RegionLocator::new(&img, &profile);
        assert_eq!(
            locator.resolve(&SegmentRequest::default()),
            Err(LocateError::InvalidCombination)
        );

        // Forcing a valid subset picks it out of the same dump.
        let layout = locator
            .resolve(&SegmentRequest {
                include_softdevice: true,
                include_bootloader: true,
                ..Default::default()
            })
            .unwrap();
        assert!(layout.softdevice.is_some() && layout.bootloader.is_some());
        assert!(layout.application.is_none());

        let layout = locator
            .resolve(&SegmentRequest {
                include_application: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(layout.application, loc(SegmentKind::Application, 0x4000, 0x5000));
    }

    #[test]
    fn test_resolve_rejects_every_application_pairing() {
        let profile = profile();
        let img = image(vec![softdevice(), application(), bootloader()]);
        let locator = RegionLocator::new(&img, &profile);

        for (sd, bl) in [(true, false), (false, true), (true, true)] {
            let request = SegmentRequest {
                include_softdevice: sd,
                include_bootloader: bl,
                include_application: true,
                ..Default::default()
            };
            assert_eq!(
                locator.resolve(&request),
                Err(LocateError::InvalidCombination),
                "sd={sd} bl={bl}"
            );
        }
    }

    #[test]
    fn test_resolve_forced_segment_missing() {
        let profile = profile();
        let img = image(vec![application()]);
        let request = SegmentRequest {
            include_softdevice: true,
            ..Default::default()
        };
        assert_eq!(
            RegionLocator::new(&img, &profile).resolve(&request),
            Err(LocateError::SegmentNotFound(SegmentKind::Softdevice))
        );
    }

    #[test]
    fn test_resolve_nothing_found() {
        let profile = profile();
        let img = SparseMemoryImage::new();
        assert_eq!(
            RegionLocator::new(&img, &profile).resolve(&SegmentRequest::default()),
            Err(LocateError::NoSegmentsFound)
        );
    }

    #[test]
    fn test_resolve_fixed_window_is_used_verbatim() {
        let profile = profile();
        let img = image(vec![application()]);
        let request = SegmentRequest {
            include_application: true,
            application_window: Some(AddressWindow::new(0x4000, 0x4800)),
            ..Default::default()
        };
        let layout = RegionLocator::new(&img, &profile).resolve(&request).unwrap();
        assert_eq!(layout.application, loc(SegmentKind::Application, 0x4000, 0x4800));

        // A fixed window also counts as found when searching.
        let request = SegmentRequest {
            bootloader_window: Some(AddressWindow::new(0x9000, 0xa000)),
            ..Default::default()
        };
        assert_eq!(
            RegionLocator::new(&img, &profile).resolve(&request),
            Err(LocateError::InvalidCombination)
        );

        let request = SegmentRequest {
            application_window: Some(AddressWindow::new(0x4000, 0x4000)),
            ..Default::default()
        };
        assert!(matches!(
            RegionLocator::new(&img, &profile).resolve(&request),
            Err(LocateError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn test_location_report_format() {
        let location = SegmentLocation {
            kind: SegmentKind::Bootloader,
            start: 0x3a800,
            end: 0x3c000,
        };
        assert_eq!(
            location.to_string(),
            "  Bootloader: 0x3a800 - 0x3c000 (6144 bytes)"
        );
    }
}
