//! Identifier generation.
//!
//! Primary ids are UUIDv7 values whose timestamp bits carry the *source*
//! creation time, so ids sort by original creation order no matter when they
//! were migrated. External ids are a pure function of the primary id.

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::timestamp::context::NoContext;
use uuid::{Timestamp, Uuid};

const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
/// 36^25 > 2^128, so every u128 fits.
pub const EXTERNAL_ID_BODY_LEN: usize = 25;
/// UUIDv7 carries a 48-bit millisecond timestamp.
const MAX_SOURCE_MS: u64 = (1 << 48) - 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentError {
    #[error("invalid source timestamp `{raw}`: {reason}")]
    InvalidTimestamp { raw: String, reason: &'static str },
    #[error("invalid primary id `{raw}`")]
    InvalidPrimaryId { raw: String },
}

/// A historical creation time, in milliseconds since the epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceTime(u64);

impl SourceTime {
    pub fn from_millis(ms: u64) -> Result<Self, IdentError> {
        if ms > MAX_SOURCE_MS {
            return Err(IdentError::InvalidTimestamp {
                raw: ms.to_string(),
                reason: "beyond the 48-bit millisecond range",
            });
        }
        Ok(Self(ms))
    }

    pub fn from_secs(secs: u64) -> Result<Self, IdentError> {
        Self::from_millis(secs.saturating_mul(1000))
    }

    /// Parse integer or fractional epoch seconds.
    pub fn parse(raw: &str) -> Result<Self, IdentError> {
        let trimmed = raw.trim();
        let invalid = |reason| IdentError::InvalidTimestamp {
            raw: raw.to_string(),
            reason,
        };
        if trimmed.is_empty() {
            return Err(invalid("empty"));
        }
        if let Ok(secs) = trimmed.parse::<u64>() {
            return Self::from_secs(secs);
        }
        let secs: f64 = trimmed.parse().map_err(|_| invalid("not a number"))?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(invalid("must be a finite, non-negative number"));
        }
        let ms = (secs * 1000.0).round();
        if ms > MAX_SOURCE_MS as f64 {
            return Err(invalid("beyond the 48-bit millisecond range"));
        }
        Ok(Self(ms as u64))
    }

    pub fn millis(self) -> u64 {
        self.0
    }

    pub fn secs(self) -> u64 {
        self.0 / 1000
    }

    /// Seconds as an index score. Whole seconds render without a fraction.
    pub fn score(self) -> f64 {
        self.0 as f64 / 1000.0
    }
}

/// Time-ordered primary identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrimaryId(Uuid);

impl PrimaryId {
    /// New id whose leading bits encode `created`. Trailing bits are random,
    /// so two calls with the same time differ.
    pub fn from_source_time(created: SourceTime) -> Self {
        let ms = created.millis();
        let ts = Timestamp::from_unix(NoContext, ms / 1000, ((ms % 1000) * 1_000_000) as u32);
        Self(Uuid::new_v7(ts))
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Millisecond timestamp carried in the id.
    pub fn timestamp_ms(&self) -> u64 {
        let bytes = self.0.as_bytes();
        bytes[..6]
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
    }
}

impl fmt::Display for PrimaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for PrimaryId {
    type Err = IdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| IdentError::InvalidPrimaryId { raw: s.to_string() })
    }
}

/// Public identifier: `prefix` + 25 base36 chars.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    pub fn derive(primary: &PrimaryId, prefix: &str) -> Self {
        let seed: [u8; 32] = Sha256::digest(primary.as_bytes()).into();
        let mut rng = StdRng::from_seed(seed);
        let mut block = [0u8; 16];
        rng.fill_bytes(&mut block);
        let body = base36_fixed(u128::from_be_bytes(block));
        Self(format!("{prefix}{body}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn base36_fixed(mut value: u128) -> String {
    let mut out = [b'0'; EXTERNAL_ID_BODY_LEN];
    for slot in out.iter_mut().rev() {
        *slot = BASE36_ALPHABET[(value % 36) as usize];
        value /= 36;
    }
    out.iter().map(|byte| *byte as char).collect()
}
