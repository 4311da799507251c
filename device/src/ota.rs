//! Upload bookkeeping shared by both OTA endpoints: password check, progress
//! accounting and the optional SHA-256 verification.

use core::fmt::Write as _;

use irblaster_common::{OtaError, OtaEvent};
use sha2::{Digest, Sha256};

pub const OTA_CHUNK_SIZE: usize = 4096;

pub fn authorize(configured: &str, supplied: Option<&str>) -> Result<(), OtaError> {
    if configured.is_empty() || supplied == Some(configured) {
        Ok(())
    } else {
        Err(OtaError::Auth)
    }
}

pub struct OtaUpload {
    hasher: Sha256,
    expected_sha256: Option<String>,
    written: usize,
    total: usize,
}

impl OtaUpload {
    pub fn begin(total: usize, expected_sha256: Option<&str>) -> Result<Self, OtaError> {
        if total == 0 {
            return Err(OtaError::Begin);
        }

        let expected_sha256 = match expected_sha256.map(str::trim) {
            Some(value) if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) => {
                return Err(OtaError::Begin);
            }
            other => other.map(str::to_ascii_lowercase),
        };

        Ok(Self {
            hasher: Sha256::new(),
            expected_sha256,
            written: 0,
            total,
        })
    }

    pub fn record(&mut self, chunk: &[u8]) -> OtaEvent {
        self.hasher.update(chunk);
        self.written = self.written.saturating_add(chunk.len());
        OtaEvent::Progress {
            written: self.written,
            total: self.total,
        }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Returns the hex digest of the received image.
    pub fn finish(self) -> Result<String, OtaError> {
        if self.written != self.total {
            return Err(OtaError::Receive);
        }

        let digest = self.hasher.finalize();
        let mut digest_hex = String::with_capacity(64);
        for byte in digest {
            let _ = write!(&mut digest_hex, "{byte:02x}");
        }

        match self.expected_sha256 {
            Some(expected) if expected != digest_hex => Err(OtaError::End),
            _ => Ok(digest_hex),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn password_is_only_checked_when_configured() {
        assert_eq!(authorize("", None), Ok(()));
        assert_eq!(authorize("pw", Some("pw")), Ok(()));
        assert_eq!(authorize("pw", Some("nope")), Err(OtaError::Auth));
        assert_eq!(authorize("pw", None), Err(OtaError::Auth));
    }

    #[test]
    fn matching_digest_completes() {
        let mut upload = OtaUpload::begin(5, Some(HELLO_SHA256.to_uppercase().as_str())).unwrap();
        upload.record(b"he");
        assert_eq!(
            upload.record(b"llo"),
            OtaEvent::Progress {
                written: 5,
                total: 5
            }
        );
        assert_eq!(upload.finish().unwrap(), HELLO_SHA256);
    }

    #[test]
    fn mismatched_digest_fails_at_end() {
        let mut upload = OtaUpload::begin(5, Some("0".repeat(64).as_str())).unwrap();
        upload.record(b"hello");
        assert_eq!(upload.finish(), Err(OtaError::End));
    }

    #[test]
    fn short_body_is_a_receive_error() {
        let mut upload = OtaUpload::begin(10, None).unwrap();
        upload.record(b"hello");
        assert_eq!(upload.finish(), Err(OtaError::Receive));
    }

    #[test]
    fn empty_or_malformed_requests_fail_to_begin() {
        assert!(matches!(OtaUpload::begin(0, None), Err(OtaError::Begin)));
        assert!(matches!(
            OtaUpload::begin(5, Some("abc")),
            Err(OtaError::Begin)
        ));
    }
}
