//! Digest validation and keying helpers shared by the whole storage stack.

use sha2::{Digest as _, Sha256};
use tonic::Status;

use crate::build::bazel::remote::execution::v2::Digest;

type Result<T, E = Status> = std::result::Result<T, E>;

/// SHA-256 of the empty byte sequence. Bazel assumes the CAS always holds
/// the empty blob, so leaf stores preload it under this hash.
pub const EMPTY_BLOB_HASH: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

pub fn empty_digest() -> Digest {
    Digest {
        hash: EMPTY_BLOB_HASH.into(),
        size_bytes: 0,
    }
}

/// Hash family implied by the length of a digest's hash string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashFamily {
    Sha256,
}

impl HashFamily {
    pub fn from_hash_length(length: usize) -> Result<Self> {
        match length {
            64 => Ok(HashFamily::Sha256),
            _ => Err(Status::invalid_argument(format!(
                "Unknown digest hash length: {} characters",
                length
            ))),
        }
    }

    pub fn hasher(&self) -> Sha256 {
        match self {
            HashFamily::Sha256 => Sha256::new(),
        }
    }
}

/// Validates the format of the fields in a Digest and returns the hash
/// family implied by the hash length.
pub fn validate_digest(digest: &Digest) -> Result<HashFamily> {
    let family = HashFamily::from_hash_length(digest.hash.len())?;
    // Uppercase hex would give the same blob a second representation, so
    // it is rejected instead of normalized.
    for c in digest.hash.chars() {
        if !matches!(c, '0'..='9' | 'a'..='f') {
            return Err(Status::invalid_argument(format!(
                "Non-hexadecimal character in digest hash: {:?}",
                c
            )));
        }
    }
    if digest.size_bytes < 0 {
        return Err(Status::invalid_argument(format!(
            "Invalid digest size: {} bytes",
            digest.size_bytes
        )));
    }
    Ok(family)
}

/// Selects between the two canonical key forms for a digest. Backends that
/// are shared between instances key blobs with the instance name; backends
/// that exist per instance leave it out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigestKeyFormat {
    WithInstance,
    WithoutInstance,
}

pub fn digest_key(instance: &str, digest: &Digest, format: DigestKeyFormat) -> String {
    match format {
        DigestKeyFormat::WithInstance => {
            format!("{}:{}:{}", instance, digest.hash, digest.size_bytes)
        }
        DigestKeyFormat::WithoutInstance => format!("{}:{}", digest.hash, digest.size_bytes),
    }
}

const FNV_PRIME: u64 = 1099511628211;

/// FNV-1a over a digest key. The initialization constant is configurable
/// so that two shardings over the same digest domain stay independent.
pub fn fnv1a(key: &str, initialization: u64) -> u64 {
    let mut h = initialization;
    for b in key.bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

#[cfg(test)]
mod test {
    use super::*;

    fn sha256_digest(hash: &str, size_bytes: i64) -> Digest {
        Digest {
            hash: hash.into(),
            size_bytes,
        }
    }

    #[test]
    fn validate_accepts_lowercase_sha256() {
        let digest = empty_digest();
        assert_eq!(validate_digest(&digest).unwrap(), HashFamily::Sha256);
    }

    #[test]
    fn validate_rejects_uppercase_hex() {
        let digest = sha256_digest(
            "E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855",
            0,
        );
        let err = validate_digest(&digest).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn validate_rejects_unknown_length() {
        let digest = sha256_digest("abc", 5);
        let err = validate_digest(&digest).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn validate_rejects_negative_size() {
        let digest = sha256_digest(EMPTY_BLOB_HASH, -1);
        let err = validate_digest(&digest).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn key_formats() {
        let digest = sha256_digest(EMPTY_BLOB_HASH, 0);
        assert_eq!(
            digest_key("inst", &digest, DigestKeyFormat::WithInstance),
            format!("inst:{}:0", EMPTY_BLOB_HASH)
        );
        assert_eq!(
            digest_key("inst", &digest, DigestKeyFormat::WithoutInstance),
            format!("{}:0", EMPTY_BLOB_HASH)
        );
    }

    #[test]
    fn fnv1a_is_deterministic_and_seeded() {
        assert_eq!(fnv1a("abc:5", 0), fnv1a("abc:5", 0));
        assert_ne!(fnv1a("abc:5", 0), fnv1a("abc:5", 1));
        assert_ne!(fnv1a("abc:5", 0), fnv1a("abc:6", 0));
    }
}
