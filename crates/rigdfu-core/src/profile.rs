//! Per-family device profiles.
//!
//! A profile names the flash windows each segment may live in, the valid
//! initial stack pointer range and the flash page size. Profiles are plain
//! TOML; hex integer literals (`0x1000`) are accepted.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProfileError {
    #[error("{section}: empty or inverted window 0x{start:X}-0x{end:X}")]
    InvalidWindow {
        section: &'static str,
        start: u32,
        end: u32,
    },
    #[error("page size must be non-zero")]
    ZeroPageSize,
    #[error("stack pointer range 0x{min:08X}-0x{max:08X} is inverted")]
    InvalidStackRange { min: u32, max: u32 },
    #[error("softdevice size word 0x{0:X} lies outside its window")]
    SizeAddressOutsideWindow(u32),
    #[error("invalid address window '{0}', expected LOW-HIGH")]
    ParseWindow(String),
}

/// Half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressWindow {
    pub start: u32,
    pub end: u32,
}

impl AddressWindow {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end
    }
}

impl fmt::Display for AddressWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:05x} - 0x{:05x}", self.start, self.end)
    }
}

impl FromStr for AddressWindow {
    type Err = ProfileError;

    /// Parses `LOW-HIGH`, e.g. `0x1000-0x16000`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ProfileError::ParseWindow(s.to_string());
        let (low, high) = s.split_once('-').ok_or_else(err)?;
        let window = Self::new(
            parse_u32(low).ok_or_else(err)?,
            parse_u32(high).ok_or_else(err)?,
        );
        if window.is_empty() {
            return Err(err());
        }
        Ok(window)
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_u32(s: &str) -> Option<u32> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSection {
    /// Flash page size; candidate image starts are scanned in this stride.
    pub page_size: u32,
    pub min_stack_pointer: u32,
    pub max_stack_pointer: u32,
    /// Bootloader address is stored in UICR.
    #[serde(default)]
    pub uicr_compatible: bool,
    /// MAC address is stored apart from the key data page.
    #[serde(default)]
    pub mac_separate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftdeviceSection {
    #[serde(default = "default_true")]
    pub compatible: bool,
    /// The window must be fully covered by data for a softdevice to be
    /// recognised.
    pub min_address: u32,
    pub max_address: u32,
    /// Word holding the softdevice's declared end address.
    pub size_address: u32,
    /// Offset from the softdevice start of the word holding the first
    /// application address.
    pub end_offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootloaderSection {
    #[serde(default = "default_true")]
    pub compatible: bool,
    pub min_address: u32,
    pub max_address: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSection {
    pub min_address: u32,
    pub max_address: u32,
}

/// Address layout and capabilities of one chip family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    pub device: DeviceSection,
    pub softdevice: SoftdeviceSection,
    pub bootloader: BootloaderSection,
    #[serde(alias = "app")]
    pub application: ApplicationSection,
}

const BUILTIN: &[(&str, &str)] = &[
    ("nrf51822-s110", include_str!("../profiles/nrf51822-s110.toml")),
    ("nrf51822-s130", include_str!("../profiles/nrf51822-s130.toml")),
    ("nrf52832-s132", include_str!("../profiles/nrf52832-s132.toml")),
    ("mkw41z", include_str!("../profiles/mkw41z.toml")),
];

impl DeviceProfile {
    /// Load and validate a profile from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading profile {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("in profile {}", path.display()))
    }

    /// Parse and validate a profile from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let profile: DeviceProfile = toml::from_str(content)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Save this profile as TOML.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Look up one of the bundled profiles by name.
    pub fn builtin(name: &str) -> Result<Self> {
        let (_, content) = BUILTIN
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow!("unknown device profile '{}'", name))?;
        Self::from_toml_str(content)
    }

    /// Names of the bundled profiles.
    pub fn builtin_names() -> impl Iterator<Item = &'static str> {
        BUILTIN.iter().map(|(n, _)| *n)
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.device.page_size == 0 {
            return Err(ProfileError::ZeroPageSize);
        }
        if self.device.min_stack_pointer > self.device.max_stack_pointer {
            return Err(ProfileError::InvalidStackRange {
                min: self.device.min_stack_pointer,
                max: self.device.max_stack_pointer,
            });
        }

        let mut windows = vec![("application", self.application_window())];
        if self.softdevice.compatible {
            windows.push(("softdevice", self.softdevice_window()));
        }
        if self.bootloader_supported() {
            windows.push(("bootloader", self.bootloader_window()));
        }
        for (section, w) in windows {
            if w.is_empty() {
                return Err(ProfileError::InvalidWindow {
                    section,
                    start: w.start,
                    end: w.end,
                });
            }
        }

        if self.softdevice.compatible
            && !self.softdevice_window().contains(self.softdevice.size_address)
        {
            return Err(ProfileError::SizeAddressOutsideWindow(
                self.softdevice.size_address,
            ));
        }
        Ok(())
    }

    pub fn softdevice_window(&self) -> AddressWindow {
        AddressWindow::new(self.softdevice.min_address, self.softdevice.max_address)
    }

    pub fn bootloader_window(&self) -> AddressWindow {
        AddressWindow::new(self.bootloader.min_address, self.bootloader.max_address)
    }

    pub fn application_window(&self) -> AddressWindow {
        AddressWindow::new(self.application.min_address, self.application.max_address)
    }

    /// Bootloaders are only located on families that also take a softdevice.
    pub fn bootloader_supported(&self) -> bool {
        self.softdevice.compatible && self.bootloader.compatible
    }

    pub fn stack_pointer_range(&self) -> (u32, u32) {
        (self.device.min_stack_pointer, self.device.max_stack_pointer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name = "sample"

[device]
page_size = 0x400
min_stack_pointer = 0x20000000
max_stack_pointer = 0x20004000

[softdevice]
min_address = 0x1000
max_address = 0x300c
size_address = 0x3008
end_offset = 0x2008

[bootloader]
min_address = 0x3a800
max_address = 0x40000

[app]
min_address = 0x18000
max_address = 0x3a800
"#;

    #[test]
    fn test_parse_profile_with_defaults() {
        let profile = DeviceProfile::from_toml_str(SAMPLE).unwrap();
        assert_eq!(profile.device.page_size, 0x400);
        assert!(profile.softdevice.compatible);
        assert!(profile.bootloader_supported());
        assert!(!profile.device.uicr_compatible);
        assert_eq!(profile.application_window(), AddressWindow::new(0x18000, 0x3a800));
    }

    #[test]
    fn test_builtin_profiles_are_valid() {
        for name in DeviceProfile::builtin_names() {
            let profile = DeviceProfile::builtin(name).unwrap();
            assert_eq!(profile.name, name);
        }
        assert!(DeviceProfile::builtin("nope").is_err());

        let kw = DeviceProfile::builtin("MKW41Z").unwrap();
        assert!(!kw.softdevice.compatible);
        assert!(!kw.bootloader_supported());
    }

    #[test]
    fn test_validate_rejects_bad_layouts() {
        let mut profile = DeviceProfile::from_toml_str(SAMPLE).unwrap();
        profile.device.page_size = 0;
        assert_eq!(profile.validate(), Err(ProfileError::ZeroPageSize));

        let mut profile = DeviceProfile::from_toml_str(SAMPLE).unwrap();
        profile.bootloader.max_address = profile.bootloader.min_address;
        assert!(matches!(
            profile.validate(),
            Err(ProfileError::InvalidWindow {
                section: "bootloader",
                ..
            })
        ));

        let mut profile = DeviceProfile::from_toml_str(SAMPLE).unwrap();
        profile.device.min_stack_pointer = 0x3000_0000;
        assert!(matches!(
            profile.validate(),
            Err(ProfileError::InvalidStackRange { .. })
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.toml");
        let profile = DeviceProfile::builtin("nrf52832-s132").unwrap();
        profile.save_to_file(&path).unwrap();
        assert_eq!(DeviceProfile::load_from_file(&path).unwrap(), profile);
    }

    #[test]
    fn test_parse_address_window() {
        assert_eq!(
            "0x1000-0x16000".parse::<AddressWindow>().unwrap(),
            AddressWindow::new(0x1000, 0x16000)
        );
        assert_eq!(
            "4096-8192".parse::<AddressWindow>().unwrap(),
            AddressWindow::new(4096, 8192)
        );
        assert!("0x2000-0x1000".parse::<AddressWindow>().is_err());
        assert!("0x1000".parse::<AddressWindow>().is_err());
        assert!("zz-0x1000".parse::<AddressWindow>().is_err());
    }
}
