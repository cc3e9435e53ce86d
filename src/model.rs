use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::fiscal::FiscalPeriod;
use crate::limits::{MAX_FIELD_LEN, MAX_SEQUENCE};

/// Case number within a fiscal period, always in `1..=999`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(u16);

impl SequenceNumber {
    pub const FIRST: SequenceNumber = SequenceNumber(1);

    pub fn new(n: u16) -> Option<Self> {
        (1..=MAX_SEQUENCE).contains(&n).then_some(Self(n))
    }

    pub fn get(self) -> u16 {
        self.0
    }

    pub fn next(self) -> Option<Self> {
        Self::new(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// A business field that distinguishes "not yet provided" from "explicitly empty".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field<T> {
    Missing,
    Empty,
    Value(T),
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Missing
    }
}

impl<T: Clone> Field<T> {
    /// Apply a patch entry: `Missing` leaves the current value alone.
    pub fn merge(&mut self, patch: &Field<T>) {
        if !matches!(patch, Field::Missing) {
            *self = patch.clone();
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Field::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Field::Missing)
    }
}

impl Field<String> {
    fn has_text(&self) -> bool {
        self.value().is_some_and(|s| !s.trim().is_empty())
    }

    fn too_long(&self) -> bool {
        self.value().is_some_and(|s| s.len() > MAX_FIELD_LEN)
    }
}

/// Free-form business fields of a case. Irrelevant to numbering, mirrored between a
/// committed reservation and its case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseFields {
    pub visit_date: Field<NaiveDate>,
    pub customer_name: Field<String>,
    pub bank_name: Field<String>,
    pub bank_branch: Field<String>,
    pub engineer: Field<String>,
    pub property_address: Field<String>,
    /// Fee in paise.
    pub fees: Field<u64>,
    pub report_status: Field<String>,
    pub bill_status: Field<String>,
}

impl CaseFields {
    /// Every field explicitly cleared. Used for system-finalized cases.
    pub fn blank() -> Self {
        Self {
            visit_date: Field::Empty,
            customer_name: Field::Empty,
            bank_name: Field::Empty,
            bank_branch: Field::Empty,
            engineer: Field::Empty,
            property_address: Field::Empty,
            fees: Field::Empty,
            report_status: Field::Empty,
            bill_status: Field::Empty,
        }
    }

    pub fn merge(&mut self, patch: &CaseFields) {
        self.visit_date.merge(&patch.visit_date);
        self.customer_name.merge(&patch.customer_name);
        self.bank_name.merge(&patch.bank_name);
        self.bank_branch.merge(&patch.bank_branch);
        self.engineer.merge(&patch.engineer);
        self.property_address.merge(&patch.property_address);
        self.fees.merge(&patch.fees);
        self.report_status.merge(&patch.report_status);
        self.bill_status.merge(&patch.bill_status);
    }

    /// Name of the first text field exceeding the length limit.
    pub fn oversized_field(&self) -> Option<&'static str> {
        [
            ("customer_name", &self.customer_name),
            ("bank_name", &self.bank_name),
            ("bank_branch", &self.bank_branch),
            ("engineer", &self.engineer),
            ("property_address", &self.property_address),
            ("report_status", &self.report_status),
            ("bill_status", &self.bill_status),
        ]
        .into_iter()
        .find(|(_, f)| f.too_long())
        .map(|(name, _)| name)
    }

    /// Name of the first required field that is not filled in.
    pub fn missing_required(&self) -> Option<&'static str> {
        if self.visit_date.value().is_none() {
            return Some("visit_date");
        }
        if !self.customer_name.has_text() {
            return Some("customer_name");
        }
        if !self.bank_name.has_text() {
            return Some("bank_name");
        }
        None
    }
}

/// Identity of a reservation slot: one per calendar date and canonical branch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub branch: String,
}

impl SlotKey {
    pub fn new(date: NaiveDate, branch: impl Into<String>) -> Self {
        Self {
            date,
            branch: branch.into(),
        }
    }

    /// Store path of the reservation record.
    pub fn path(&self) -> String {
        format!("reservations/{}/{}", self.date.format("%Y-%m-%d"), self.branch)
    }

    pub fn fiscal_period(&self) -> FiscalPeriod {
        FiscalPeriod::for_date(self.date)
    }
}

/// How a case came to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Created from completed fields with a number assigned immediately.
    Direct,
    /// Materialized by a user commit of a reservation.
    Reservation(SlotKey),
    /// Materialized by the daily sweep; carries no human-entered data.
    Finalized(SlotKey),
    /// Bulk-loaded under an externally chosen key.
    Imported,
}

impl Origin {
    pub fn slot(&self) -> Option<&SlotKey> {
        match self {
            Origin::Reservation(slot) | Origin::Finalized(slot) => Some(slot),
            Origin::Direct | Origin::Imported => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseRecord {
    /// Opaque push id, independent of the key.
    pub id: Ulid,
    /// Storage key, `DVM-<CODE>-<YY-YY>-<NNN>` for every allocated case.
    pub key: String,
    /// Canonical branch name, or the raw stored name for imported data.
    pub location: String,
    pub fields: CaseFields,
    pub origin: Origin,
    pub created_at: DateTime<Utc>,
}

impl CaseRecord {
    pub fn is_system_finalized(&self) -> bool {
        matches!(self.origin, Origin::Finalized(_))
    }
}

/// The number a reservation was committed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    pub sequence: SequenceNumber,
    pub key: String,
    /// True when the sweep committed it rather than a user.
    pub finalized: bool,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub slot: SlotKey,
    pub fields: CaseFields,
    pub committed: Option<Commitment>,
}

impl Reservation {
    pub fn draft(slot: SlotKey) -> Self {
        Self {
            slot,
            fields: CaseFields::default(),
            committed: None,
        }
    }

    pub fn committed_sequence_number(&self) -> Option<SequenceNumber> {
        self.committed.as_ref().map(|c| c.sequence)
    }

    pub fn is_committed(&self) -> bool {
        self.committed.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    /// No row stored for the slot.
    Empty,
    Draft,
    Committed,
    /// Committed by the sweep.
    Finalized,
}

/// Acting identity handed over by the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Branch(String),
    Admin,
    Scheduler,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Branch(b) => write!(f, "branch {b}"),
            Actor::Admin => f.write_str("admin"),
            Actor::Scheduler => f.write_str("scheduler"),
        }
    }
}

/// Input for a directly created case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCase {
    pub location: String,
    pub fields: CaseFields,
}

/// Flat event enum; this is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// One or more cases written together (a save batch, or an import).
    CasesCreated {
        records: Vec<CaseRecord>,
    },
    /// Full field state after a merge. Also rewrites the linked reservation, if any.
    CaseUpdated {
        key: String,
        fields: CaseFields,
    },
    CaseDeleted {
        key: String,
    },
    /// Draft edits, or a full reservation restored by compaction.
    ReservationSaved {
        reservation: Reservation,
    },
    /// A reservation and the case it materialized, written as one record.
    ReservationCommitted {
        reservation: Reservation,
        record: CaseRecord,
    },
    /// Committed reservation edited: its fields are copied onto the case under `key`.
    ReservationMirrored {
        reservation: Reservation,
        key: String,
    },
    /// Every branch is finalized for every day up to and including `date`.
    SweepCompleted {
        date: NaiveDate,
    },
}

impl Event {
    /// Keys of the cases this event creates.
    pub fn new_case_keys(&self) -> Vec<&str> {
        match self {
            Event::CasesCreated { records } => records.iter().map(|r| r.key.as_str()).collect(),
            Event::ReservationCommitted { record, .. } => vec![record.key.as_str()],
            _ => Vec::new(),
        }
    }
}

/// Externally produced record loaded under its own key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyCase {
    pub key: String,
    pub location: String,
    pub fields: CaseFields,
}

// ── Query result types ───────────────────────────────────────────

/// Sequence numbers consumed in one fiscal period.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocatedNumberSet {
    pub period: Option<FiscalPeriod>,
    pub by_location: BTreeMap<String, BTreeSet<SequenceNumber>>,
}

impl AllocatedNumberSet {
    pub fn all(&self) -> BTreeSet<SequenceNumber> {
        self.by_location.values().flatten().copied().collect()
    }

    pub fn for_location(&self, location: &str) -> BTreeSet<SequenceNumber> {
        self.by_location.get(location).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub reservation: Reservation,
    pub record: CaseRecord,
    /// False when the slot was already committed and only fields were re-saved.
    pub newly_allocated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped_existing: usize,
    /// Imported under keys the allocator will never decode.
    pub malformed_keys: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_number_bounds() {
        assert!(SequenceNumber::new(0).is_none());
        assert_eq!(SequenceNumber::new(1), Some(SequenceNumber::FIRST));
        assert!(SequenceNumber::new(999).is_some());
        assert!(SequenceNumber::new(1000).is_none());
        assert!(SequenceNumber::new(999).unwrap().next().is_none());
    }

    #[test]
    fn sequence_number_displays_three_digits() {
        assert_eq!(SequenceNumber::new(7).unwrap().to_string(), "007");
        assert_eq!(SequenceNumber::new(42).unwrap().to_string(), "042");
        assert_eq!(SequenceNumber::new(999).unwrap().to_string(), "999");
    }

    #[test]
    fn merge_respects_missing_vs_empty() {
        let mut fields = CaseFields {
            customer_name: Field::Value("Asha Patil".into()),
            engineer: Field::Value("R. Kulkarni".into()),
            ..Default::default()
        };
        let patch = CaseFields {
            customer_name: Field::Empty,
            fees: Field::Value(250_000),
            ..Default::default()
        };
        fields.merge(&patch);
        assert_eq!(fields.customer_name, Field::Empty);
        assert_eq!(fields.engineer, Field::Value("R. Kulkarni".into()));
        assert_eq!(fields.fees, Field::Value(250_000));
        assert!(fields.bank_name.is_missing());
    }

    #[test]
    fn required_fields() {
        let mut fields = CaseFields::default();
        assert_eq!(fields.missing_required(), Some("visit_date"));
        fields.visit_date = Field::Value(NaiveDate::from_ymd_opt(2024, 9, 10).unwrap());
        fields.customer_name = Field::Value("   ".into());
        assert_eq!(fields.missing_required(), Some("customer_name"));
        fields.customer_name = Field::Value("Asha Patil".into());
        fields.bank_name = Field::Empty;
        assert_eq!(fields.missing_required(), Some("bank_name"));
        fields.bank_name = Field::Value("SBI".into());
        assert_eq!(fields.missing_required(), None);
    }

    #[test]
    fn oversized_text_is_reported() {
        let fields = CaseFields {
            property_address: Field::Value("x".repeat(MAX_FIELD_LEN + 1)),
            ..Default::default()
        };
        assert_eq!(fields.oversized_field(), Some("property_address"));
        assert_eq!(CaseFields::blank().oversized_field(), None);
    }

    #[test]
    fn slot_path_uses_iso_date() {
        let slot = SlotKey::new(NaiveDate::from_ymd_opt(2024, 9, 10).unwrap(), "Pune");
        assert_eq!(slot.path(), "reservations/2024-09-10/Pune");
        assert_eq!(slot.fiscal_period().to_string(), "24-25");
    }

    #[test]
    fn allocated_set_union() {
        let mut set = AllocatedNumberSet::default();
        let n = |v| SequenceNumber::new(v).unwrap();
        set.by_location.insert("Pune".into(), [n(1), n(3)].into());
        set.by_location.insert("Sangli".into(), [n(2)].into());
        assert_eq!(set.all(), [n(1), n(2), n(3)].into());
        assert!(set.for_location("Satara").is_empty());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let slot = SlotKey::new(NaiveDate::from_ymd_opt(2024, 9, 10).unwrap(), "Pune");
        let event = Event::ReservationCommitted {
            reservation: Reservation {
                slot: slot.clone(),
                fields: CaseFields::blank(),
                committed: Some(Commitment {
                    sequence: SequenceNumber::new(7).unwrap(),
                    key: "DVM-PUNE-24-25-007".into(),
                    finalized: true,
                    committed_at: Utc::now(),
                }),
            },
            record: CaseRecord {
                id: Ulid::new(),
                key: "DVM-PUNE-24-25-007".into(),
                location: "Pune".into(),
                fields: CaseFields::blank(),
                origin: Origin::Finalized(slot),
                created_at: Utc::now(),
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
