use chrono::NaiveDate;

use crate::fiscal::FiscalPeriod;
use crate::model::Actor;

#[derive(Debug)]
pub enum EngineError {
    /// No case stored under this key.
    NotFound(String),
    /// Branch name matches no registry entry or alias.
    UnknownLocation(String),
    Forbidden {
        actor: Actor,
        branch: String,
    },
    MissingField(&'static str),
    /// Every number in `1..=999` is consumed for the period.
    AllocationExhausted(FiscalPeriod),
    /// A concurrent writer claimed or stored the key first.
    DuplicateAllocation(String),
    /// The case belongs to a reservation and cannot be removed.
    LinkedToReservation(String),
    /// Only fully elapsed days may be finalized.
    DayNotElapsed(NaiveDate),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(key) => write!(f, "case not found: {key}"),
            EngineError::UnknownLocation(name) => write!(f, "unknown location: {name:?}"),
            EngineError::Forbidden { actor, branch } => {
                write!(f, "{actor} may not act for branch {branch}")
            }
            EngineError::MissingField(name) => write!(f, "required field missing: {name}"),
            EngineError::AllocationExhausted(period) => {
                write!(f, "no free case number left in fiscal period {period}")
            }
            EngineError::DuplicateAllocation(key) => {
                write!(f, "allocation conflict on {key}: retry")
            }
            EngineError::LinkedToReservation(key) => {
                write!(f, "case {key} was committed from a reservation and cannot be deleted")
            }
            EngineError::DayNotElapsed(date) => write!(f, "{date} has not elapsed yet"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Whether the caller may simply try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::DuplicateAllocation(_) | EngineError::WalError(_))
    }
}
