use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

/// A fingerprint identifies a file by its first N bytes, so a file keeps
/// its identity when it is renamed or when it grows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint {
    first_bytes: Vec<u8>,
}

impl Fingerprint {
    /// Read a fingerprint of up to `size` bytes from the start of the file
    pub fn read(file: &mut File, size: usize) -> io::Result<Self> {
        let mut buf = vec![0u8; size];
        file.seek(SeekFrom::Start(0))?;

        let mut filled = 0;
        while filled < size {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);

        Ok(Self { first_bytes: buf })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { first_bytes: bytes }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.first_bytes
    }

    pub fn bytes(&self) -> &[u8] {
        &self.first_bytes
    }

    pub fn len(&self) -> usize {
        self.first_bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_bytes.is_empty()
    }

    /// Two fingerprints match when one is a prefix of the other and the
    /// shorter is non-empty. A file that has grown since it was last
    /// observed still matches; a file whose leading content changed does
    /// not.
    pub fn matches(&self, other: &Fingerprint) -> bool {
        let shorter = self.first_bytes.len().min(other.first_bytes.len());
        if shorter == 0 {
            return false;
        }
        self.first_bytes[..shorter] == other.first_bytes[..shorter]
    }
}
