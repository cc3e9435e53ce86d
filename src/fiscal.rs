use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Two-digit "YY-YY" numbering epoch. Financial years run April through March.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FiscalPeriod {
    first: u8,
    second: u8,
}

/// Month number (1-based) on which a new financial year begins.
const FISCAL_START_MONTH: u32 = 4;

impl FiscalPeriod {
    /// Period whose first year is `year` (full four-digit year).
    pub fn starting(year: i32) -> Self {
        Self {
            first: two_digits(year),
            second: two_digits(year + 1),
        }
    }

    pub fn for_date(date: NaiveDate) -> Self {
        if date.month() >= FISCAL_START_MONTH {
            Self::starting(date.year())
        } else {
            Self::starting(date.year() - 1)
        }
    }

    pub fn first(&self) -> u8 {
        self.first
    }

    pub fn second(&self) -> u8 {
        self.second
    }
}

fn two_digits(year: i32) -> u8 {
    year.rem_euclid(100) as u8
}

impl fmt::Display for FiscalPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{:02}", self.first, self.second)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePeriodError(pub String);

impl fmt::Display for ParsePeriodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid fiscal period: {:?}", self.0)
    }
}

impl std::error::Error for ParsePeriodError {}

impl FromStr for FiscalPeriod {
    type Err = ParsePeriodError;

    /// Accepts exactly `DD-DD` where the second year follows the first (99-00 wraps).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParsePeriodError(s.to_string());
        let bytes = s.as_bytes();
        if bytes.len() != 5 || bytes[2] != b'-' {
            return Err(err());
        }
        let parse = |part: &str| -> Option<u8> {
            if part.bytes().all(|b| b.is_ascii_digit()) {
                part.parse().ok()
            } else {
                None
            }
        };
        let first = parse(&s[0..2]).ok_or_else(err)?;
        let second = parse(&s[3..5]).ok_or_else(err)?;
        if (first + 1) % 100 != second {
            return Err(err());
        }
        Ok(Self { first, second })
    }
}
