use chrono::NaiveDate;

use crate::fiscal::FiscalPeriod;
use crate::keycodec::OfficeKey;
use crate::model::*;

use super::Engine;

/// Shown when neither the key nor the record names a known branch.
pub const UNKNOWN_LOCATION: &str = "Unknown";

impl Engine {
    pub fn get_case(&self, key: &str) -> Option<CaseRecord> {
        self.store.get_case(key)
    }

    pub fn case_count(&self) -> usize {
        self.store.case_count()
    }

    /// Cases numbered in `period`, in key order. Foreign keys are not listed.
    pub fn list_cases(&self, period: FiscalPeriod) -> Vec<CaseRecord> {
        let mut cases: Vec<CaseRecord> = self
            .store
            .cases()
            .into_iter()
            .filter(|c| OfficeKey::decode(&c.key).is_ok_and(|k| k.period == period))
            .collect();
        cases.sort_by(|a, b| a.key.cmp(&b.key));
        cases
    }

    /// Last date through which every branch has been finalized.
    pub fn swept_through(&self) -> Option<NaiveDate> {
        self.store.swept_through()
    }

    /// Stored reservations for `date`, by branch name.
    pub fn list_reservations(&self, date: NaiveDate) -> Vec<Reservation> {
        self.store.reservations_on(date)
    }

    /// Branch name for display: decoded key first, then the record's own
    /// location (canonicalized when possible), then `"Unknown"`.
    pub fn display_location(&self, record: &CaseRecord) -> String {
        if let Ok(key) = OfficeKey::decode(&record.key)
            && let Some(name) = key.location(&self.registry)
        {
            return name.to_string();
        }
        if let Some(name) = self.registry.canonicalize(&record.location) {
            return name.to_string();
        }
        if record.location.trim().is_empty() {
            UNKNOWN_LOCATION.to_string()
        } else {
            record.location.clone()
        }
    }

    /// Display label (`DVM/<CODE>/<YY-YY>/<NNN>`), for allocated keys only.
    pub fn office_label(&self, record: &CaseRecord) -> Option<String> {
        OfficeKey::decode(&record.key).ok().map(|k| k.office_label())
    }

    /// Branch used for authorization checks on an existing case.
    pub(super) fn case_branch(&self, record: &CaseRecord) -> String {
        self.display_location(record)
    }
}
