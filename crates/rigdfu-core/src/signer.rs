//! Key and MAC rotation packets.
//!
//! A config record is wrapped in the same header/IV/tag layout as an update
//! image so that the image signing tool can encrypt it:
//!
//! ```text
//! u32 48, u32 0, u32 0 | [u8; 32] iv+tag | old key | new key | mac | [u8; 10]
//! ```
//!
//! The signer is an external executable called as
//! `signer <plaintext> <ciphertext> <HEXKEY>`, keyed with the old key.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::image::container::header_record;
use crate::protocol::constants::{CONFIG_PACKET_SIZE, CONFIG_RECORD_SIZE, KEY_SIZE, MAC_SIZE};

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("signer {program} failed ({status}): {stderr}")]
    SigningFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("signer produced {actual} bytes, expected {expected}")]
    CiphertextSize { expected: usize, actual: usize },

    #[error("invalid hex string '{input}', expected {expected} bytes")]
    InvalidHex { input: String, expected: usize },

    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),
}

/// Contents of a config packet before encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRecord {
    /// Key currently on the device; also the encryption key.
    pub old_key: [u8; KEY_SIZE],
    pub new_key: [u8; KEY_SIZE],
    /// Device byte order (little-endian).
    pub mac: [u8; MAC_SIZE],
}

impl ConfigRecord {
    pub fn to_bytes(&self) -> [u8; CONFIG_RECORD_SIZE] {
        let mut buf = [0u8; CONFIG_RECORD_SIZE];
        buf[..16].copy_from_slice(&self.old_key);
        buf[16..32].copy_from_slice(&self.new_key);
        buf[32..38].copy_from_slice(&self.mac);
        buf
    }

    /// Header-shaped plaintext handed to the signer.
    pub fn plaintext(&self) -> Vec<u8> {
        header_record([CONFIG_RECORD_SIZE as u32, 0, 0], &self.to_bytes())
    }
}

/// Encrypts config plaintext.
pub trait ConfigSigner {
    fn sign(&self, plaintext: &[u8], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>, SignerError>;
}

/// Runs the image signing executable on files in a scratch directory.
#[derive(Debug, Clone)]
pub struct ExternalSigner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ExternalSigner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Argument placed before the plaintext path, e.g. a script run by an
    /// interpreter.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl ConfigSigner for ExternalSigner {
    #[instrument(skip_all, fields(program = %self.program.display()))]
    fn sign(&self, plaintext: &[u8], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>, SignerError> {
        // Removed on drop, whichever way this returns.
        let dir = tempfile::Builder::new().prefix("rigdfu-config").tempdir()?;
        let pt_path = dir.path().join("pt.bin");
        let ct_path = dir.path().join("ct.bin");
        std::fs::write(&pt_path, plaintext)?;

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&pt_path)
            .arg(&ct_path)
            .arg(hex::encode_upper(key))
            .output()?;
        if !output.status.success() {
            return Err(SignerError::SigningFailed {
                program: self.program.display().to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let ciphertext = std::fs::read(&ct_path)?;
        debug!(bytes = ciphertext.len(), "Signer finished");
        Ok(ciphertext)
    }
}

/// Encrypt `record` with its old key, checking the packet size.
pub fn sign_config(signer: &dyn ConfigSigner, record: &ConfigRecord) -> Result<Vec<u8>, SignerError> {
    let plaintext = record.plaintext();
    debug!(plaintext = %hex::encode_upper(&plaintext), "Config packet");
    let packet = signer.sign(&plaintext, &record.old_key)?;
    if packet.len() != CONFIG_PACKET_SIZE {
        return Err(SignerError::CiphertextSize {
            expected: CONFIG_PACKET_SIZE,
            actual: packet.len(),
        });
    }
    info!("Configuration encryption success");
    Ok(packet)
}

/// Parse `N` bytes of hex. Anything that is not a hex digit (`:`, spaces,
/// dashes) is ignored.
pub fn parse_hex_bytes<const N: usize>(input: &str) -> Result<[u8; N], SignerError> {
    let invalid = || SignerError::InvalidHex {
        input: input.to_string(),
        expected: N,
    };
    let digits: String = input.chars().filter(char::is_ascii_hexdigit).collect();
    let bytes = hex::decode(digits).map_err(|_| invalid())?;
    bytes.try_into().map_err(|_| invalid())
}

/// Parse a MAC written most significant byte first into device order.
pub fn parse_mac(input: &str) -> Result<[u8; MAC_SIZE], SignerError> {
    let mut mac = parse_hex_bytes::<MAC_SIZE>(input)?;
    mac.reverse();
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ConfigRecord {
        ConfigRecord {
            old_key: [0x11; 16],
            new_key: [0x22; 16],
            mac: [1, 2, 3, 4, 5, 6],
        }
    }

    #[test]
    fn test_config_record_layout() {
        let bytes = record().to_bytes();
        assert_eq!(bytes.len(), 48);
        assert_eq!(&bytes[..16], &[0x11; 16]);
        assert_eq!(&bytes[16..32], &[0x22; 16]);
        assert_eq!(&bytes[32..38], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&bytes[38..], &[0; 10]);
    }

    #[test]
    fn test_plaintext_layout() {
        let pt = record().plaintext();
        assert_eq!(pt.len(), CONFIG_PACKET_SIZE);
        assert_eq!(pt[0], 48);
        assert!(pt[1..44].iter().all(|&b| b == 0));
        // Fields sit at 32, 48 and 64 past the length header.
        let body = &pt[12..];
        assert_eq!(&body[32..48], &[0x11; 16]);
        assert_eq!(&body[48..64], &[0x22; 16]);
        assert_eq!(&body[64..70], &[1, 2, 3, 4, 5, 6]);
    }

    struct FixedSigner(usize);

    impl ConfigSigner for FixedSigner {
        fn sign(&self, _: &[u8], _: &[u8; KEY_SIZE]) -> Result<Vec<u8>, SignerError> {
            Ok(vec![0x5A; self.0])
        }
    }

    #[test]
    fn test_sign_config_checks_size() {
        assert_eq!(sign_config(&FixedSigner(92), &record()).unwrap().len(), 92);
        assert!(matches!(
            sign_config(&FixedSigner(91), &record()),
            Err(SignerError::CiphertextSize {
                expected: 92,
                actual: 91
            })
        ));
    }

    #[test]
    fn test_parse_hex_bytes() {
        let key: [u8; 16] = parse_hex_bytes("00112233445566778899aabbccddeeff").unwrap();
        assert_eq!(key[0], 0x00);
        assert_eq!(key[15], 0xFF);

        let spaced: [u8; 4] = parse_hex_bytes("DE AD-be:ef").unwrap();
        assert_eq!(spaced, [0xDE, 0xAD, 0xBE, 0xEF]);

        assert!(matches!(
            parse_hex_bytes::<16>("0011"),
            Err(SignerError::InvalidHex { expected: 16, .. })
        ));
        assert!(parse_hex_bytes::<2>("abc").is_err());
    }

    #[test]
    fn test_parse_mac_reverses() {
        assert_eq!(
            parse_mac("e2:ec:1d:93:2e:99").unwrap(),
            [0x99, 0x2e, 0x93, 0x1d, 0xec, 0xe2]
        );
    }

    #[cfg(unix)]
    mod external {
        use std::path::Path;

        use super::*;

        fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, body).unwrap();
            path
        }

        #[test]
        fn test_external_signer_passes_files_and_key() {
            let dir = tempfile::tempdir().unwrap();
            let sh = script(
                dir.path(),
                "sign.sh",
                "[ \"$3\" = \"11111111111111111111111111111111\" ] || exit 7\ncp \"$1\" \"$2\"\n",
            );

            let signer = ExternalSigner::new("sh").arg(&sh);
            let packet = sign_config(&signer, &record()).unwrap();
            assert_eq!(packet, record().plaintext());
        }

        #[test]
        fn test_external_signer_failure_cleans_up() {
            let dir = tempfile::tempdir().unwrap();
            let seen = dir.path().join("seen");
            let sh = script(
                dir.path(),
                "fail.sh",
                &format!(
                    "dirname \"$1\" > '{}'\necho boom >&2\nexit 3\n",
                    seen.display()
                ),
            );

            let err = ExternalSigner::new("sh")
                .arg(&sh)
                .sign(b"plaintext", &[0u8; 16])
                .unwrap_err();
            match err {
                SignerError::SigningFailed { stderr, .. } => assert_eq!(stderr, "boom"),
                other => panic!("unexpected error: {other:?}"),
            }

            let scratch = std::fs::read_to_string(&seen).unwrap();
            assert!(!Path::new(scratch.trim()).exists());
        }

        #[test]
        fn test_external_signer_wrong_size() {
            let dir = tempfile::tempdir().unwrap();
            let sh = script(dir.path(), "short.sh", "head -c 10 \"$1\" > \"$2\"\n");
            let signer = ExternalSigner::new("sh").arg(&sh);
            assert!(matches!(
                sign_config(&signer, &record()),
                Err(SignerError::CiphertextSize { actual: 10, .. })
            ));
        }
    }
}
