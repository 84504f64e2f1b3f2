use std::str::FromStr;

use data_encoding::HEXLOWER;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

pub const SHA256_LEN: usize = 32;

/// The algorithm prefix used in the string representation.
const SHA256_PREFIX: &str = "sha256:";

/// A content digest, as used by OCI registries and image layouts.
/// Only sha256 is supported, which is what every registry speaks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; SHA256_LEN]);

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("unsupported digest algorithm in {0}")]
    UnsupportedAlgorithm(String),

    #[error("invalid digest encoding in {0}")]
    InvalidEncoding(String),

    #[error("invalid digest length: {0}")]
    InvalidDigestLen(usize),
}

impl Digest {
    /// Calculates the digest of the passed data.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    /// Lowercase hex encoding of the digest, without the algorithm prefix.
    pub fn encoded(&self) -> String {
        HEXLOWER.encode(&self.0)
    }

    pub fn algorithm(&self) -> &'static str {
        "sha256"
    }
}

impl From<[u8; SHA256_LEN]> for Digest {
    fn from(value: [u8; SHA256_LEN]) -> Self {
        Self(value)
    }
}

impl From<sha2::digest::Output<Sha256>> for Digest {
    fn from(value: sha2::digest::Output<Sha256>) -> Self {
        Self(value.into())
    }
}

impl TryFrom<&[u8]> for Digest {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let v: [u8; SHA256_LEN] = value
            .try_into()
            .map_err(|_| Error::InvalidDigestLen(value.len()))?;
        Ok(Self(v))
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s
            .strip_prefix(SHA256_PREFIX)
            .ok_or_else(|| Error::UnsupportedAlgorithm(s.to_string()))?;

        // uppercase hex is not canonical in OCI, reject it.
        let raw = HEXLOWER
            .decode(encoded.as_bytes())
            .map_err(|_| Error::InvalidEncoding(s.to_string()))?;

        Digest::try_from(raw.as_slice())
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", SHA256_PREFIX, self.encoded())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", SHA256_PREFIX, self.encoded())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
