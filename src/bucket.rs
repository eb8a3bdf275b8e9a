//! Bucket properties, quorum values and counters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::errors::{Result, RiakError};

/// Replication-acknowledgment threshold.
///
/// Encoded on the wire as `"all"`, `"one"`, `"quorum"` or a bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawQuorum", into = "RawQuorum")]
pub enum Quorum {
    All,
    One,
    Quorum,
    Count(u32),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawQuorum {
    Count(u32),
    Symbol(String),
}

impl TryFrom<RawQuorum> for Quorum {
    type Error = String;

    fn try_from(raw: RawQuorum) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawQuorum::Count(n) => Ok(Quorum::Count(n)),
            RawQuorum::Symbol(s) => s.parse().map_err(|e: RiakError| e.to_string()),
        }
    }
}

impl From<Quorum> for RawQuorum {
    fn from(q: Quorum) -> Self {
        match q {
            Quorum::Count(n) => RawQuorum::Count(n),
            symbolic => RawQuorum::Symbol(symbolic.to_string()),
        }
    }
}

impl fmt::Display for Quorum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quorum::All => f.write_str("all"),
            Quorum::One => f.write_str("one"),
            Quorum::Quorum => f.write_str("quorum"),
            Quorum::Count(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for Quorum {
    type Err = RiakError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Quorum::All),
            "one" => Ok(Quorum::One),
            "quorum" => Ok(Quorum::Quorum),
            other => other.parse::<u32>().map(Quorum::Count).map_err(|_| {
                RiakError::validation(format!(
                    "invalid quorum value '{s}': expected all | one | quorum | integer"
                ))
            }),
        }
    }
}

impl Quorum {
    /// Check the value against a bucket's replica count.
    pub fn validate(&self, field: &str, n_val: u32) -> Result<()> {
        match *self {
            Quorum::Count(n) if n == 0 || n > n_val => Err(RiakError::validation(format!(
                "{field} must be between 1 and n_val ({n_val}), got {n}"
            ))),
            _ => Ok(()),
        }
    }
}

/// Replication and conflict settings for a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketProperties {
    pub n_val: u32,
    #[serde(default)]
    pub allow_mult: bool,
    #[serde(default)]
    pub last_write_wins: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<Quorum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<Quorum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dw: Option<Quorum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rw: Option<Quorum>,
}

impl Default for BucketProperties {
    fn default() -> Self {
        Self {
            n_val: 3,
            allow_mult: false,
            last_write_wins: false,
            r: None,
            w: None,
            dw: None,
            rw: None,
        }
    }
}

impl BucketProperties {
    /// Validate every field against the symbolic/numeric quorum domain.
    pub fn validate(&self) -> Result<()> {
        if self.n_val < 1 {
            return Err(RiakError::validation("n_val must be >= 1"));
        }
        for (field, value) in [("r", self.r), ("w", self.w), ("dw", self.dw), ("rw", self.rw)] {
            if let Some(q) = value {
                q.validate(field, self.n_val)?;
            }
        }
        Ok(())
    }
}

/// `{"props": {...}}` body used by the props resource.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PropsEnvelope {
    pub props: BucketProperties,
}

/// A counter value read from a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Counter {
    pub bucket: String,
    pub key: String,
    pub value: i64,
}

impl Counter {
    /// Send `delta` through `conn`, then apply it to the local value.
    ///
    /// The local value is left unchanged when the update fails. Other
    /// writers are not reflected until the counter is read again.
    pub async fn add(&mut self, conn: &Connection, delta: i64) -> Result<()> {
        conn.update_counter(&self.bucket, &self.key, delta).await?;
        self.value = self.value.saturating_add(delta);
        Ok(())
    }

    pub async fn increment(&mut self, conn: &Connection) -> Result<()> {
        self.add(conn, 1).await
    }

    pub async fn decrement(&mut self, conn: &Connection) -> Result<()> {
        self.add(conn, -1).await
    }
}
