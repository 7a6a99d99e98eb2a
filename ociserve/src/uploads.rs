//! Blob upload sessions.
//!
//! A session is (id, accumulated bytes). PATCHes must arrive with
//! contiguous ranges; the accumulated length is the only cursor. Sessions
//! survive a failed finalize so the client can recover.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("upload session unknown")]
    Unknown,
    #[error("range start {got} does not match accumulated length {expected}")]
    RangeMismatch { expected: u64, got: u64 },
}

#[derive(Default)]
pub struct UploadSet {
    sessions: Mutex<HashMap<u64, Vec<u8>>>,
}

impl UploadSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> u64 {
        // ids are positive 63-bit so they survive being parsed as i64
        let id = rand::random::<u64>() >> 1;
        self.sessions.lock().unwrap().insert(id, Vec::new());
        id
    }

    /// Append a chunk, optionally checked against a declared start offset.
    /// Returns the new accumulated length.
    pub fn append(
        &self,
        id: u64,
        declared_start: Option<u64>,
        chunk: &[u8],
    ) -> Result<u64, UploadError> {
        let mut sessions = self.sessions.lock().unwrap();
        let buf = sessions.get_mut(&id).ok_or(UploadError::Unknown)?;
        if let Some(start) = declared_start {
            if start != buf.len() as u64 {
                return Err(UploadError::RangeMismatch {
                    expected: buf.len() as u64,
                    got: start,
                });
            }
        }
        buf.extend_from_slice(chunk);
        Ok(buf.len() as u64)
    }

    /// Remove the session and hand back its bytes. A PUT to an id that was
    /// never POSTed is a one-shot monolithic upload, so a missing session
    /// reads as empty.
    pub fn take(&self, id: u64) -> Vec<u8> {
        self.sessions.lock().unwrap().remove(&id).unwrap_or_default()
    }

    /// Restore a session after a failed finalize.
    pub fn restore(&self, id: u64, buf: Vec<u8>) {
        self.sessions.lock().unwrap().insert(id, buf);
    }

    pub fn len(&self, id: u64) -> Option<u64> {
        self.sessions.lock().unwrap().get(&id).map(|b| b.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_appends() {
        let set = UploadSet::new();
        let id = set.begin();
        assert_eq!(set.append(id, Some(0), b"hel").unwrap(), 3);
        assert_eq!(set.append(id, Some(3), b"lo").unwrap(), 5);
        assert_eq!(set.take(id), b"hello");
    }

    #[test]
    fn test_out_of_order_rejected() {
        let set = UploadSet::new();
        let id = set.begin();
        set.append(id, Some(0), b"hel").unwrap();
        assert_eq!(
            set.append(id, Some(5), b"lo"),
            Err(UploadError::RangeMismatch {
                expected: 3,
                got: 5
            })
        );
        // the session is unharmed
        assert_eq!(set.append(id, Some(3), b"lo").unwrap(), 5);
    }

    #[test]
    fn test_unchecked_append() {
        let set = UploadSet::new();
        let id = set.begin();
        set.append(id, None, b"ab").unwrap();
        set.append(id, None, b"cd").unwrap();
        assert_eq!(set.take(id), b"abcd");
    }

    #[test]
    fn test_unknown_session() {
        let set = UploadSet::new();
        assert_eq!(set.append(7, None, b"x"), Err(UploadError::Unknown));
        assert_eq!(set.take(7), Vec::<u8>::new());
    }

    #[test]
    fn test_restore() {
        let set = UploadSet::new();
        let id = set.begin();
        set.append(id, None, b"abc").unwrap();
        let buf = set.take(id);
        set.restore(id, buf);
        assert_eq!(set.len(id), Some(3));
    }

    #[test]
    fn test_ids_are_63_bit() {
        for _ in 0..64 {
            let set = UploadSet::new();
            assert!(set.begin() < (1 << 63));
        }
    }
}
