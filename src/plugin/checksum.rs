//! Entry script integrity checks
//!
//! Every service manifest pins its entry script with four digests. Two of them
//! (MD5 and SHA-1) only exist so that manifests issued by older releases keep
//! verifying; SHA-256 and SHA-512 carry the actual integrity guarantee. All four
//! must match for a script to be accepted.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;

/// Digest set pinned by a manifest for its entry script.
///
/// Each field holds the lowercase hex encoding of the digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checksums {
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    pub sha512: String,
}

/// Digest algorithm identifiers, used when reporting mismatches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Md5 => write!(f, "md5"),
            Algorithm::Sha1 => write!(f, "sha1"),
            Algorithm::Sha256 => write!(f, "sha256"),
            Algorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

/// Rejection of a byte buffer against an expected digest set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("checksum mismatch ({})", format_algorithms(.mismatched))]
pub struct IntegrityError {
    /// Algorithms whose digest did not match, in fixed algorithm order
    pub mismatched: Vec<Algorithm>,
}

fn format_algorithms(algorithms: &[Algorithm]) -> String {
    algorithms
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Checksums {
    /// Compute the full digest set over `bytes`, exactly as given
    pub fn compute(bytes: &[u8]) -> Self {
        Self {
            md5: hex_digest::<Md5>(bytes),
            sha1: hex_digest::<Sha1>(bytes),
            sha256: hex_digest::<Sha256>(bytes),
            sha512: hex_digest::<Sha512>(bytes),
        }
    }

    /// Verify `bytes` against this digest set.
    ///
    /// A mismatch in any single algorithm rejects the buffer.
    pub fn verify(&self, bytes: &[u8]) -> Result<(), IntegrityError> {
        verify(bytes, self)
    }

    fn get(&self, algorithm: Algorithm) -> &str {
        match algorithm {
            Algorithm::Md5 => &self.md5,
            Algorithm::Sha1 => &self.sha1,
            Algorithm::Sha256 => &self.sha256,
            Algorithm::Sha512 => &self.sha512,
        }
    }
}

/// Compute the digest set of `bytes`
pub fn compute(bytes: &[u8]) -> Checksums {
    Checksums::compute(bytes)
}

/// Compare the digests of `bytes` with `expected`; fails closed
pub fn verify(bytes: &[u8], expected: &Checksums) -> Result<(), IntegrityError> {
    let actual = Checksums::compute(bytes);

    let mismatched: Vec<Algorithm> = [
        Algorithm::Md5,
        Algorithm::Sha1,
        Algorithm::Sha256,
        Algorithm::Sha512,
    ]
    .into_iter()
    .filter(|algorithm| {
        !actual
            .get(*algorithm)
            .eq_ignore_ascii_case(expected.get(*algorithm).trim())
    })
    .collect();

    if mismatched.is_empty() {
        Ok(())
    } else {
        Err(IntegrityError { mismatched })
    }
}

fn hex_digest<D: Digest>(bytes: &[u8]) -> String {
    let mut hasher = D::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_digests_of_empty_input() {
        let checksums = compute(b"");
        assert_eq!(checksums.md5, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(checksums.sha1, "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(
            checksums.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(checksums.sha512.starts_with("cf83e1357eefb8bdf1542850d66d8007"));
        assert_eq!(checksums.sha512.len(), 128);
    }

    #[test]
    fn test_no_normalization_of_whitespace() {
        let a = compute(b"registerFeature(Posts);");
        let b = compute(b"registerFeature(Posts);\n");
        assert_ne!(a, b);
    }

    #[test]
    fn test_single_algorithm_mismatch_rejects() {
        let bytes = b"class Posts extends PostFeature {}";
        let mut expected = compute(bytes);
        expected.sha1 = compute(b"something else").sha1;

        let err = verify(bytes, &expected).unwrap_err();
        assert_eq!(err.mismatched, vec![Algorithm::Sha1]);
        assert!(err.to_string().contains("sha1"));
    }

    #[test]
    fn test_uppercase_expected_digest_is_accepted() {
        let bytes = b"abc";
        let mut expected = compute(bytes);
        expected.sha256 = expected.sha256.to_uppercase();
        assert!(verify(bytes, &expected).is_ok());
    }

    #[test]
    fn test_checksums_json_field_names() {
        let json = serde_json::to_value(compute(b"x")).unwrap();
        for key in ["md5", "sha1", "sha256", "sha512"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
    }

    proptest! {
        #[test]
        fn prop_computed_checksums_verify(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
            prop_assert!(verify(&bytes, &compute(&bytes)).is_ok());
        }

        #[test]
        fn prop_single_bit_flip_fails(
            bytes in proptest::collection::vec(any::<u8>(), 1..1024),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let expected = compute(&bytes);
            let mut flipped = bytes.clone();
            let i = index.index(flipped.len());
            flipped[i] ^= 1 << bit;
            prop_assert!(verify(&flipped, &expected).is_err());
        }
    }
}
