use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::fiscal::FiscalPeriod;
use crate::location::{LocationRegistry, is_valid_code};
use crate::model::SequenceNumber;

/// Fixed literal leading every case key.
pub const KEY_PREFIX: &str = "DVM";

static KEY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^DVM-([A-Z]{3,5})-([0-9]{2}-[0-9]{2})-([0-9]{3})$").expect("key pattern compiles")
});

/// Decoded identity of a case: `DVM-<CODE>-<YY-YY>-<NNN>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OfficeKey {
    pub code: String,
    pub period: FiscalPeriod,
    pub sequence: SequenceNumber,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Shape mismatch: foreign or legacy data.
    Malformed(String),
    InvalidCode(String),
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::Malformed(k) => write!(f, "malformed case key: {k:?}"),
            KeyError::InvalidCode(c) => write!(f, "invalid location code: {c:?}"),
        }
    }
}

impl std::error::Error for KeyError {}

impl OfficeKey {
    pub fn new(code: &str, period: FiscalPeriod, sequence: SequenceNumber) -> Result<Self, KeyError> {
        if !is_valid_code(code) {
            return Err(KeyError::InvalidCode(code.to_string()));
        }
        Ok(Self {
            code: code.to_string(),
            period,
            sequence,
        })
    }

    pub fn encode(&self) -> String {
        format!("{KEY_PREFIX}-{}-{}-{}", self.code, self.period, self.sequence)
    }

    pub fn decode(key: &str) -> Result<Self, KeyError> {
        let malformed = || KeyError::Malformed(key.to_string());
        let caps = KEY_PATTERN.captures(key).ok_or_else(malformed)?;
        let period = caps[2].parse::<FiscalPeriod>().map_err(|_| malformed())?;
        let sequence = caps[3]
            .parse::<u16>()
            .ok()
            .and_then(SequenceNumber::new)
            .ok_or_else(malformed)?;
        Ok(Self {
            code: caps[1].to_string(),
            period,
            sequence,
        })
    }

    /// Slash-separated display form, e.g. `DVM/SNGL/24-25/004`.
    pub fn office_label(&self) -> String {
        format!("{KEY_PREFIX}/{}/{}/{}", self.code, self.period, self.sequence)
    }

    pub fn location<'r>(&self, registry: &'r LocationRegistry) -> Option<&'r str> {
        registry.name_from_code(&self.code)
    }
}

impl fmt::Display for OfficeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
