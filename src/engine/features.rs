//! Engine version quirks
//!
//! Detected once per connection and fixed for its lifetime.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EngineVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl EngineVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    /// Lenient parse of strings like `4.3.1`, `v24.0.7` or `4.4.0-dev`.
    /// Anything unreadable becomes `0.0.0`, which means "unknown".
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim().trim_start_matches('v');
        let mut parts = [0u64; 3];

        for (slot, part) in parts.iter_mut().zip(raw.split('.')) {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            match digits.parse() {
                Ok(n) => *slot = n,
                Err(_) => break,
            }
            if digits.len() != part.len() {
                break;
            }
        }

        Self::new(parts[0], parts[1], parts[2])
    }

    pub fn is_known(&self) -> bool {
        self.major != 0
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineFeatures {
    /// Engine swaps network send and receive counters (before 4.4).
    pub reversed_network: bool,
    /// Engine aggregates samples per requested interval itself (3.4 and later).
    pub native_interval: bool,
}

impl EngineFeatures {
    pub fn detect(version: EngineVersion) -> Self {
        Self {
            reversed_network: version.is_known() && version < EngineVersion::new(4, 4, 0),
            native_interval: version >= EngineVersion::new(3, 4, 0),
        }
    }
}
