//! Readers that check what flows through them.
//!
//! Every byte stream entering the system with a claimed digest goes through
//! [`VerifyReader`]; a clean EOF is only ever reported after both the size
//! and the digest check pass. [`HashingReader`] is the inverse: the digest
//! is unknown up front and becomes available once the stream is drained.

use std::pin::Pin;
use std::task::{Context, Poll};

use sha2::Sha256;
use tokio::io::{AsyncRead, ReadBuf};

use crate::digest::digest_eq;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("digest mismatch, expected sha256:{expected}")]
    DigestMismatch { expected: String },
    #[error("size mismatch, expected {expected} got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

impl From<VerifyError> for std::io::Error {
    fn from(e: VerifyError) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    }
}

/// Pull the original [`VerifyError`] back out of an io error, if that is
/// what it carries.
pub fn verify_error(e: &std::io::Error) -> Option<&VerifyError> {
    e.get_ref().and_then(|inner| inner.downcast_ref())
}

pub struct VerifyReader<R> {
    inner: R,
    hasher: Option<Sha256>,
    expected_hex: String,
    expected_size: Option<u64>,
    count: u64,
    finished: bool,
}

impl<R> VerifyReader<R> {
    /// `expected_hex` is the lowercase hex of the expected sha256;
    /// `expected_size` of `None` skips the size check.
    pub fn new(inner: R, expected_hex: impl Into<String>, expected_size: Option<u64>) -> Self {
        use sha2::Digest as _;
        VerifyReader {
            inner,
            hasher: Some(Sha256::new()),
            expected_hex: expected_hex.into(),
            expected_size,
            count: 0,
            finished: false,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.count
    }

    fn check_eof(&mut self) -> Result<(), VerifyError> {
        if let Some(expected) = self.expected_size {
            if self.count != expected {
                return Err(VerifyError::SizeMismatch {
                    expected,
                    actual: self.count,
                });
            }
        }
        let hasher = self.hasher.take().expect("checked once at eof");
        if !digest_eq(&self.expected_hex, hasher) {
            return Err(VerifyError::DigestMismatch {
                expected: self.expected_hex.clone(),
            });
        }
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for VerifyReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        use sha2::Digest as _;
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {
                let filled = &buf.filled()[before..];
                if filled.is_empty() {
                    this.finished = true;
                    match this.check_eof() {
                        Ok(()) => Poll::Ready(Ok(())),
                        Err(e) => Poll::Ready(Err(e.into())),
                    }
                } else {
                    this.count += filled.len() as u64;
                    if let Some(hasher) = this.hasher.as_mut() {
                        hasher.update(filled);
                    }
                    // over-long streams fail as soon as the excess shows up
                    if let Some(expected) = this.expected_size {
                        if this.count > expected {
                            this.finished = true;
                            return Poll::Ready(Err(VerifyError::SizeMismatch {
                                expected,
                                actual: this.count,
                            }
                            .into()));
                        }
                    }
                    Poll::Ready(Ok(()))
                }
            }
        }
    }
}

pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        use sha2::Digest as _;
        HashingReader {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    /// `(lowercase hex digest, byte count)` of everything read so far.
    /// Meaningful once the stream has hit EOF.
    pub fn finalize(self) -> (String, u64) {
        use sha2::Digest as _;
        (hex::encode(self.hasher.finalize()), self.count)
    }

    pub fn bytes_read(&self) -> u64 {
        self.count
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        use sha2::Digest as _;
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = &buf.filled()[before..];
                this.count += filled.len() as u64;
                this.hasher.update(filled);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    const ABC_HEX: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[tokio::test]
    async fn test_verify_ok() {
        let mut r = VerifyReader::new(&b"abc"[..], ABC_HEX, Some(3));
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn test_verify_unknown_size() {
        let mut r = VerifyReader::new(&b"abc"[..], ABC_HEX, None);
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_digest_mismatch() {
        let mut r = VerifyReader::new(&b"abd"[..], ABC_HEX, Some(3));
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).await.unwrap_err();
        assert!(matches!(
            verify_error(&err),
            Some(VerifyError::DigestMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_short_stream() {
        let mut r = VerifyReader::new(&b"ab"[..], ABC_HEX, Some(3));
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).await.unwrap_err();
        assert!(matches!(
            verify_error(&err),
            Some(VerifyError::SizeMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_verify_long_stream_fails_before_eof() {
        let mut r = VerifyReader::new(&b"abcdef"[..], ABC_HEX, Some(3));
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).await.unwrap_err();
        assert!(matches!(
            verify_error(&err),
            Some(VerifyError::SizeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_hashing_reader() {
        let mut r = HashingReader::new(&b"abc"[..]);
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        let (hex, count) = r.finalize();
        assert_eq!(hex, ABC_HEX);
        assert_eq!(count, 3);
    }
}
