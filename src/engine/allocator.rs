use std::collections::BTreeSet;

use tracing::debug;

use crate::fiscal::FiscalPeriod;
use crate::keycodec::OfficeKey;
use crate::model::*;

use super::{Engine, EngineError};

/// Smallest number in `1..=999` not in `consumed`. Fills gaps before extending.
pub fn lowest_free(consumed: &BTreeSet<SequenceNumber>) -> Option<SequenceNumber> {
    let mut candidate = SequenceNumber::FIRST;
    for &taken in consumed {
        if taken > candidate {
            break;
        }
        if taken == candidate {
            candidate = candidate.next()?;
        }
    }
    Some(candidate)
}

impl Engine {
    /// Every number consumed in `period`: decoded case keys of registry locations,
    /// committed reservations of the period, and the caller's unsaved batch.
    pub(super) fn consumed_numbers(
        &self,
        period: FiscalPeriod,
        batch: &BTreeSet<SequenceNumber>,
    ) -> BTreeSet<SequenceNumber> {
        let mut consumed = batch.clone();
        for key in self.store.case_keys() {
            match OfficeKey::decode(&key) {
                Ok(decoded) if decoded.period == period => {
                    if self.registry.contains_code(&decoded.code) {
                        consumed.insert(decoded.sequence);
                    } else {
                        debug!("ignoring {key}: code {} not in registry", decoded.code);
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("ignoring stored key: {e}"),
            }
        }
        for reservation in self.store.reservations() {
            if reservation.slot.fiscal_period() == period
                && let Some(seq) = reservation.committed_sequence_number()
            {
                consumed.insert(seq);
            }
        }
        consumed
    }

    /// Lowest free number for `period`, given numbers already taken by an unsaved batch.
    ///
    /// Read-only: nothing is claimed. Use the commit/create operations to claim.
    pub fn next_free(
        &self,
        period: FiscalPeriod,
        batch: &BTreeSet<SequenceNumber>,
    ) -> Result<SequenceNumber, EngineError> {
        lowest_free(&self.consumed_numbers(period, batch))
            .ok_or(EngineError::AllocationExhausted(period))
    }

    /// Pick a number and key for `code` in `period`. Caller must hold the period lock
    /// and write the key through `persist`, whose conditional write rejects a key
    /// that was taken in the meantime.
    pub(super) fn claim_key(
        &self,
        code: &str,
        period: FiscalPeriod,
        batch: &BTreeSet<SequenceNumber>,
    ) -> Result<(SequenceNumber, String), EngineError> {
        let seq = self.next_free(period, batch)?;
        let key = OfficeKey::new(code, period, seq)
            .map_err(|_| EngineError::UnknownLocation(code.to_string()))?
            .encode();
        Ok((seq, key))
    }

    /// Consumed numbers of `period`, grouped by canonical location.
    pub fn allocated_numbers(&self, period: FiscalPeriod) -> AllocatedNumberSet {
        let mut set = AllocatedNumberSet {
            period: Some(period),
            ..Default::default()
        };
        for key in self.store.case_keys() {
            let Ok(decoded) = OfficeKey::decode(&key) else { continue };
            if decoded.period != period {
                continue;
            }
            if let Some(name) = decoded.location(&self.registry) {
                set.by_location
                    .entry(name.to_string())
                    .or_default()
                    .insert(decoded.sequence);
            }
        }
        for reservation in self.store.reservations() {
            if reservation.slot.fiscal_period() == period
                && let Some(seq) = reservation.committed_sequence_number()
            {
                set.by_location
                    .entry(reservation.slot.branch.clone())
                    .or_default()
                    .insert(seq);
            }
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(nums: &[u16]) -> BTreeSet<SequenceNumber> {
        nums.iter().map(|&n| SequenceNumber::new(n).unwrap()).collect()
    }

    #[test]
    fn empty_starts_at_one() {
        assert_eq!(lowest_free(&set(&[])).unwrap().get(), 1);
    }

    #[test]
    fn fills_gaps_first() {
        assert_eq!(lowest_free(&set(&[1, 2, 4])).unwrap().get(), 3);
        assert_eq!(lowest_free(&set(&[2, 3])).unwrap().get(), 1);
        assert_eq!(lowest_free(&set(&[1, 2, 3])).unwrap().get(), 4);
    }

    #[test]
    fn exhausted_range_has_no_free_number() {
        let all: Vec<u16> = (1..=999).collect();
        assert!(lowest_free(&set(&all)).is_none());
        let almost: Vec<u16> = (1..=998).collect();
        assert_eq!(lowest_free(&set(&almost)).unwrap().get(), 999);
    }
}
