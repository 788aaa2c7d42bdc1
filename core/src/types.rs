//! Shared data structures exchanged between the facade, the index and the backends.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Application-chosen identifier of a cached blob, usually derived from a URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derive the key for a URL. The serialised, normalised form of the URL is the key.
    pub fn from_url(url: &Url) -> Self {
        Self(url.as_str().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the key contains the given fragment anywhere.
    pub fn contains(&self, fragment: &str) -> bool {
        self.0.contains(fragment)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&Url> for CacheKey {
    fn from(url: &Url) -> Self {
        Self::from_url(url)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// How far below capacity a trim pass goes once the disk budget is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrimLevel {
    /// Aggressive eviction, lowest target fill.
    Low,
    #[default]
    Middle,
    /// Light eviction, highest target fill.
    High,
}

/// Target fill fractions of the disk capacity for each [`TrimLevel`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimFractions {
    pub low: f64,
    pub middle: f64,
    pub high: f64,
}

impl Default for TrimFractions {
    fn default() -> Self {
        Self { low: 0.5, middle: 0.7, high: 0.9 }
    }
}

impl TrimFractions {
    pub fn fraction(&self, level: TrimLevel) -> f64 {
        match level {
            TrimLevel::Low => self.low,
            TrimLevel::Middle => self.middle,
            TrimLevel::High => self.high,
        }
    }

    /// Usage a trim pass must reach for the given capacity and level.
    pub fn target(&self, capacity: u64, level: TrimLevel) -> u64 {
        (capacity as f64 * self.fraction(level)).floor() as u64
    }

    pub(crate) fn is_valid(&self) -> bool {
        [self.low, self.middle, self.high].iter().all(|f| *f > 0.0 && *f <= 1.0)
    }
}

/// Which catalog implementation backs the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Embedded relational catalog (`catalog.sqlite3`).
    #[default]
    Sqlite,
    /// Transactional snapshot store (`catalog.json`).
    Snapshot,
}

impl BackendKind {
    pub fn file_name(self) -> &'static str {
        match self {
            BackendKind::Sqlite => "catalog.sqlite3",
            BackendKind::Snapshot => "catalog.json",
        }
    }
}

/// Budget for the in-memory value cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    pub bytes_max: usize,
    pub entries_max: Option<usize>,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self { bytes_max: 32 * 1024 * 1024, entries_max: None }
    }
}
