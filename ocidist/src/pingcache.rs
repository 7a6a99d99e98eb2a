//! Optional on-disk cache of ping results and bearer tokens, so short-lived
//! processes don't redo the challenge dance on every run.
//!
//! Layout: `<root>/ping/<escaped-registry>` and `<root>/token/<escaped-key>`
//! holding small JSON records. Entries older than ten minutes (or past the
//! token's own lifetime) are ignored; corrupt files are treated as absent.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{trace, warn};
use serde::{Deserialize, Serialize};

use crate::authn::{Challenge, Token};
use crate::transport::{Pong, Scheme};

const TTL: Duration = Duration::from_secs(10 * 60);

pub struct DiskCache {
    ping_dir: PathBuf,
    token_dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct StoredChallenge {
    scheme: String,
    params: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct StoredPing {
    scheme: String,
    challenges: Vec<StoredChallenge>,
    stamp: u64,
}

#[derive(Serialize, Deserialize)]
struct StoredToken {
    token: String,
    expires_in: u64,
    stamp: u64,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn fresh(stamp: u64, ttl: Duration) -> bool {
    now().saturating_sub(stamp) < ttl.as_secs()
}

// url-style escaping that keeps filenames flat: alphanumerics and a few
// safe punctuation chars pass, everything else becomes %XX
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'_' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

impl DiskCache {
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<DiskCache> {
        let root = root.as_ref();
        let ping_dir = root.join("ping");
        let token_dir = root.join("token");
        fs::create_dir_all(&ping_dir)?;
        fs::create_dir_all(&token_dir)?;
        Ok(DiskCache { ping_dir, token_dir })
    }

    pub fn load_ping(&self, registry: &str) -> Option<Pong> {
        let path = self.ping_dir.join(escape(registry));
        let stored: StoredPing = serde_json::from_str(&fs::read_to_string(path).ok()?).ok()?;
        if !fresh(stored.stamp, TTL) {
            return None;
        }
        let scheme = match stored.scheme.as_str() {
            "https" => Scheme::Https,
            "http" => Scheme::Http,
            _ => return None,
        };
        Some(Pong {
            scheme,
            challenges: stored
                .challenges
                .into_iter()
                .map(|c| Challenge {
                    scheme: c.scheme,
                    params: c.params,
                })
                .collect(),
        })
    }

    pub fn store_ping(&self, registry: &str, pong: &Pong) {
        let stored = StoredPing {
            scheme: pong.scheme.as_str().to_string(),
            challenges: pong
                .challenges
                .iter()
                .map(|c| StoredChallenge {
                    scheme: c.scheme.clone(),
                    params: c.params.clone(),
                })
                .collect(),
            stamp: now(),
        };
        self.write(&self.ping_dir.join(escape(registry)), &stored);
    }

    pub fn load_token(&self, key: &str) -> Option<String> {
        let path = self.token_dir.join(escape(key));
        let stored: StoredToken = serde_json::from_str(&fs::read_to_string(path).ok()?).ok()?;
        let ttl = TTL.min(Duration::from_secs(stored.expires_in));
        if !fresh(stored.stamp, ttl) {
            return None;
        }
        Some(stored.token)
    }

    pub fn store_token(&self, key: &str, token: &Token) {
        let stored = StoredToken {
            token: token.token.clone(),
            expires_in: token.expires_in.as_secs(),
            stamp: now(),
        };
        self.write(&self.token_dir.join(escape(key)), &stored);
    }

    pub fn drop_token(&self, key: &str) {
        let _ = fs::remove_file(self.token_dir.join(escape(key)));
    }

    fn write<T: Serialize>(&self, path: &Path, value: &T) {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                if let Err(e) = fs::write(path, bytes) {
                    warn!("cache write {} failed: {e}", path.display());
                } else {
                    trace!("cached {}", path.display());
                }
            }
            Err(e) => warn!("cache serialize failed: {e}"),
        }
    }
}
