//! Whole-file and per-block MD5 fingerprints
//!
//! MD5 is used as a 128-bit fingerprint, not a security primitive; both ends
//! of the wire must agree on it. The hex rendering below is the wire format
//! for checksums.

use std::fmt;
use std::io::Read;
use std::path::Path;

/// A 128-bit content fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum([u8; 16]);

impl Checksum {
    /// Fingerprint a byte slice.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(md5::compute(data).0)
    }

    /// Fingerprint a file by streaming its contents.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or read.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        Self::from_reader(&mut file)
    }

    /// Fingerprint everything a reader yields.
    ///
    /// # Errors
    /// Returns an error if reading fails.
    pub fn from_reader<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut context = md5::Context::new();
        let mut buffer = [0u8; 64 * 1024];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            context.consume(&buffer[..bytes_read]);
        }

        Ok(Self(context.compute().0))
    }

    /// Wrap raw digest bytes.
    #[must_use]
    pub fn from_raw(raw: [u8; 16]) -> Self {
        Self(raw)
    }

    /// Get raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Render as the 32-character lowercase hex wire form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the 32-character hex wire form.
    ///
    /// # Errors
    /// Returns an error if the input is not exactly 32 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut raw = [0u8; 16];
        hex::decode_to_slice(s, &mut raw)?;
        Ok(Self(raw))
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
