// src/hash.rs

//! Content digests for artifact verification
//!
//! Every digest is SHA-256. The canonical text form is `sha256:<hex>`, which
//! is also what release assets publish; bare 64-character hex is accepted on
//! input.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::str::FromStr;

const ALGORITHM_PREFIX: &str = "sha256:";
const HEX_LEN: usize = 64;

/// A verified-format SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse `sha256:<hex>` or bare hex
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidDigestFormat("empty digest".to_string()));
        }

        let hex = match trimmed.split_once(':') {
            Some((algorithm, hex)) if algorithm.eq_ignore_ascii_case("sha256") => hex,
            Some((algorithm, _)) => {
                return Err(Error::InvalidDigestFormat(format!(
                    "unsupported algorithm '{}'",
                    algorithm
                )));
            }
            None => trimmed,
        };

        if hex.len() != HEX_LEN || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidDigestFormat(format!(
                "expected {} hex characters, got '{}'",
                HEX_LEN, hex
            )));
        }

        Ok(Self(hex.to_ascii_lowercase()))
    }

    /// Lowercase hex without the algorithm prefix
    pub fn hex(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    fn from_hasher(hasher: Sha256) -> Self {
        Self(format!("{:x}", hasher.finalize()))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", ALGORITHM_PREFIX, self.0)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

/// Compute the digest of an in-memory buffer
pub fn digest(bytes: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Digest::from_hasher(hasher)
}

/// Check a buffer against an expected digest
pub fn verify(bytes: &[u8], expected: &Digest) -> bool {
    &digest(bytes) == expected
}

/// Check a buffer against a digest string, rejecting malformed digests
pub fn verify_str(bytes: &[u8], expected: &str) -> Result<bool> {
    let expected = Digest::parse(expected)?;
    Ok(verify(bytes, &expected))
}

/// Stream a reader through the hasher
pub fn digest_reader<R: Read>(mut reader: R) -> io::Result<Digest> {
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(Digest::from_hasher(hasher))
}

/// Digest of a file on disk
pub fn digest_file(path: &Path) -> Result<Digest> {
    let file = File::open(path)
        .map_err(|e| Error::io(format!("Failed to open {} for checksum", path.display()), e))?;
    digest_reader(file)
        .map_err(|e| Error::io(format!("Failed to read {} for checksum", path.display()), e))
}

/// Digest of a file if it exists, `None` when it does not
pub fn digest_file_if_exists(path: &Path) -> Result<Option<Digest>> {
    match File::open(path) {
        Ok(file) => digest_reader(file)
            .map(Some)
            .map_err(|e| Error::io(format!("Failed to read {}", path.display()), e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(format!("Failed to open {}", path.display()), e)),
    }
}

/// Writer adapter that hashes everything written through it
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Return the inner writer, the digest and the byte count
    pub fn finish(self) -> (W, Digest, u64) {
        (self.inner, Digest::from_hasher(self.hasher), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("hello world")
    const HELLO: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_digest_known_value() {
        assert_eq!(digest(b"hello world").hex(), HELLO);
        assert_eq!(digest(b"hello world").to_string(), format!("sha256:{}", HELLO));
    }

    #[test]
    fn test_parse_accepts_prefixed_and_bare() {
        let bare = Digest::parse(HELLO).unwrap();
        let prefixed = Digest::parse(&format!("sha256:{}", HELLO)).unwrap();
        let upper = Digest::parse(&HELLO.to_uppercase()).unwrap();
        assert_eq!(bare, prefixed);
        assert_eq!(bare, upper);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for input in ["", "sha256:", "abc", "md5:d41d8cd98f00b204e9800998ecf8427e"] {
            let err = Digest::parse(input).unwrap_err();
            assert!(matches!(err, Error::InvalidDigestFormat(_)), "{}", input);
        }
        let not_hex = "z".repeat(64);
        assert!(Digest::parse(&not_hex).is_err());
    }

    #[test]
    fn test_verify() {
        let expected = Digest::parse(HELLO).unwrap();
        assert!(verify(b"hello world", &expected));
        assert!(!verify(b"hello world!", &expected));
        assert!(verify_str(b"hello world", HELLO).unwrap());
        assert!(verify_str(b"hello world", "").is_err());
    }

    #[test]
    fn test_hashing_writer_matches_digest() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        let (buffer, d, written) = writer.finish();
        assert_eq!(buffer, b"hello world");
        assert_eq!(d.hex(), HELLO);
        assert_eq!(written, 11);
    }

    #[test]
    fn test_digest_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(digest_file(&path).unwrap().hex(), HELLO);
        assert!(digest_file_if_exists(&dir.path().join("missing")).unwrap().is_none());
    }

    #[test]
    fn test_serde_uses_prefixed_form() {
        let d = Digest::parse(HELLO).unwrap();
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"sha256:{}\"", HELLO));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
        assert!(serde_json::from_str::<Digest>("\"nope\"").is_err());
    }
}
