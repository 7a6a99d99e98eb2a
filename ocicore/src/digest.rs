use oci_spec::image::{Digest, DigestAlgorithm, Sha256Digest};
use sha2::Sha256;

pub const SHA256_HEX_LEN: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("bad digest {0:?}")]
    Bad(String),
    #[error("unsupported digest algorithm {0}")]
    UnsupportedAlgorithm(String),
}

pub fn is_lower_hex(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Parse `sha256:<64 lower hex>`. Other algorithms are rejected up front
/// since everything downstream hashes with sha256.
pub fn parse_sha256(s: &str) -> Result<Digest, DigestError> {
    match s.split_once(':') {
        Some(("sha256", hex)) if hex.len() == SHA256_HEX_LEN && is_lower_hex(hex) => {
            Ok(hex.parse::<Sha256Digest>()
                .map_err(|_| DigestError::Bad(s.to_string()))?
                .into())
        }
        Some(("sha256", _)) | None => Err(DigestError::Bad(s.to_string())),
        Some((algo, _)) => Err(DigestError::UnsupportedAlgorithm(algo.to_string())),
    }
}

pub fn sha256_digest(data: impl AsRef<[u8]>) -> Digest {
    use sha2::Digest as _;
    hex::encode(Sha256::digest(data))
        .parse::<Sha256Digest>()
        .expect("hex encoding of a sha256 is a valid digest")
        .into()
}

pub fn expect_sha256(digest: &Digest) -> Result<&str, DigestError> {
    match digest.algorithm() {
        DigestAlgorithm::Sha256 => Ok(digest.digest()),
        algo => Err(DigestError::UnsupportedAlgorithm(algo.to_string())),
    }
}

// compares a finalized hasher against the lowercase hex form without
// allocating the encoded string
pub fn digest_eq(digest_lower_hex_str: &str, hasher: Sha256) -> bool {
    use sha2::Digest as _;
    let digest_bytes = hasher.finalize();
    if digest_lower_hex_str.len() != 2 * digest_bytes.len() {
        return false;
    }

    #[rustfmt::skip]
    const LUT: [u8; 16] = [
        //0  1   2   3   4   5   6   7   8   9
        48, 49, 50, 51, 52, 53, 54, 55, 56, 57,
        //a  b   c    d    e    f
        97, 98, 99, 100, 101, 102,
    ];
    let as_byte_pairs = <str as AsRef<[u8]>>::as_ref(digest_lower_hex_str).chunks_exact(2);

    as_byte_pairs.zip(digest_bytes).all(|(pair, byte)| {
        LUT[(byte >> 4) as usize] == pair[0] && LUT[(byte & 0xf) as usize] == pair[1]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let hex = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        let d = parse_sha256(&format!("sha256:{hex}")).unwrap();
        assert_eq!(d.digest(), hex);
        assert!(parse_sha256("sha256:short").is_err());
        assert!(parse_sha256(&format!("sha256:{}", hex.to_uppercase())).is_err());
        assert_eq!(
            parse_sha256(&format!("sha512:{hex}")),
            Err(DigestError::UnsupportedAlgorithm("sha512".to_string()))
        );
        assert!(parse_sha256("nocolon").is_err());
    }

    #[test]
    fn test_sha256_digest() {
        assert_eq!(
            sha256_digest("abc").to_string(),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_digest_eq() {
        fn hasher_of(data: &[u8]) -> Sha256 {
            use sha2::Digest as _;
            let mut hasher = Sha256::new();
            hasher.update(data);
            hasher
        }
        assert!(digest_eq(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
            hasher_of(b"abc"),
        ));
        // truncated
        assert!(!digest_eq(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015a",
            hasher_of(b"abc"),
        ));
        // wrong last nibble
        assert!(!digest_eq(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ae",
            hasher_of(b"abc"),
        ));
    }
}
