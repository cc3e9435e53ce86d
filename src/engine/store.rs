use std::sync::atomic::{AtomicI32, Ordering};

use chrono::{Datelike, NaiveDate};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::model::*;

/// `swept_through` value before any sweep completed.
const NEVER_SWEPT: i32 = i32::MIN;

/// In-memory image of the document store: cases by key, reservations by slot.
pub struct InMemoryStore {
    cases: DashMap<String, CaseRecord>,
    reservations: DashMap<SlotKey, Reservation>,
    /// Sweep watermark as days from CE.
    swept_through: AtomicI32,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            cases: DashMap::new(),
            reservations: DashMap::new(),
            swept_through: AtomicI32::new(NEVER_SWEPT),
        }
    }

    // ── Cases ────────────────────────────────────────────────

    pub fn case_count(&self) -> usize {
        self.cases.len()
    }

    pub fn contains_case(&self, key: &str) -> bool {
        self.cases.contains_key(key)
    }

    pub fn get_case(&self, key: &str) -> Option<CaseRecord> {
        self.cases.get(key).map(|e| e.value().clone())
    }

    pub fn case_keys(&self) -> Vec<String> {
        self.cases.iter().map(|e| e.key().clone()).collect()
    }

    pub fn cases(&self) -> Vec<CaseRecord> {
        self.cases.iter().map(|e| e.value().clone()).collect()
    }

    /// Conditional write: only succeeds when nothing is stored under the key.
    pub fn insert_case_if_absent(&self, record: CaseRecord) -> bool {
        match self.cases.entry(record.key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    // ── Reservations ─────────────────────────────────────────

    pub fn reservation(&self, slot: &SlotKey) -> Option<Reservation> {
        self.reservations.get(slot).map(|e| e.value().clone())
    }

    pub fn reservations_on(&self, date: NaiveDate) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|e| e.key().date == date)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.slot.branch.cmp(&b.slot.branch));
        out
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.reservations.iter().map(|e| e.value().clone()).collect()
    }

    /// Last date through which the sweep finalized every branch.
    pub fn swept_through(&self) -> Option<NaiveDate> {
        match self.swept_through.load(Ordering::Acquire) {
            NEVER_SWEPT => None,
            days => NaiveDate::from_num_days_from_ce_opt(days),
        }
    }

    // ── Event application ────────────────────────────────────

    /// Apply a logged event. Replay and live writes go through here.
    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::CasesCreated { records } => {
                for record in records {
                    if !self.insert_case_if_absent(record.clone()) {
                        tracing::warn!("replayed case {} over an existing key; keeping the first", record.key);
                    }
                }
            }
            Event::CaseUpdated { key, fields } => {
                let slot = match self.cases.get_mut(key) {
                    Some(mut case) => {
                        case.fields = fields.clone();
                        case.origin.slot().cloned()
                    }
                    None => None,
                };
                if let Some(slot) = slot
                    && let Some(mut reservation) = self.reservations.get_mut(&slot)
                {
                    reservation.fields = fields.clone();
                }
            }
            Event::CaseDeleted { key } => {
                self.cases.remove(key);
            }
            Event::ReservationSaved { reservation } => {
                self.reservations
                    .insert(reservation.slot.clone(), reservation.clone());
            }
            Event::ReservationCommitted { reservation, record } => {
                if !self.insert_case_if_absent(record.clone()) {
                    tracing::warn!("replayed case {} over an existing key; keeping the first", record.key);
                }
                self.reservations
                    .insert(reservation.slot.clone(), reservation.clone());
            }
            Event::ReservationMirrored { reservation, key } => {
                if let Some(mut case) = self.cases.get_mut(key) {
                    case.fields = reservation.fields.clone();
                }
                self.reservations
                    .insert(reservation.slot.clone(), reservation.clone());
            }
            Event::SweepCompleted { date } => {
                self.swept_through
                    .fetch_max(date.num_days_from_ce(), Ordering::AcqRel);
            }
        }
    }

    /// Minimal event set that recreates the current contents.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut records = self.cases();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        let mut events: Vec<Event> = records
            .chunks(crate::limits::MAX_BATCH_SIZE)
            .map(|chunk| Event::CasesCreated {
                records: chunk.to_vec(),
            })
            .collect();
        let mut reservations = self.reservations();
        reservations.sort_by(|a, b| a.slot.cmp(&b.slot));
        events.extend(
            reservations
                .into_iter()
                .map(|reservation| Event::ReservationSaved { reservation }),
        );
        if let Some(date) = self.swept_through() {
            events.push(Event::SweepCompleted { date });
        }
        events
    }
}
