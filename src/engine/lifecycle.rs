use std::collections::BTreeSet;

use chrono::NaiveDate;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Outcome of one daily sweep.
#[derive(Debug, Default)]
pub struct FinalizeReport {
    pub date: Option<NaiveDate>,
    /// Keys of the system-finalized cases written by this sweep.
    pub finalized: Vec<String>,
    /// Branches whose slot was already committed.
    pub skipped: Vec<String>,
    pub failed: Vec<(String, EngineError)>,
}

/// Who is driving a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitMode {
    User,
    Sweep,
}

impl Engine {
    /// Stored reservation for the slot, or a fresh unsaved draft.
    pub fn reservation(&self, date: NaiveDate, branch: &str) -> Result<Reservation, EngineError> {
        let slot = SlotKey::new(date, self.canonical_branch(branch)?);
        Ok(self
            .store
            .reservation(&slot)
            .unwrap_or_else(|| Reservation::draft(slot)))
    }

    pub fn reservation_state(&self, date: NaiveDate, branch: &str) -> Result<ReservationState, EngineError> {
        let slot = SlotKey::new(date, self.canonical_branch(branch)?);
        Ok(match self.store.reservation(&slot) {
            None => ReservationState::Empty,
            Some(r) => match &r.committed {
                None => ReservationState::Draft,
                Some(c) if c.finalized => ReservationState::Finalized,
                Some(_) => ReservationState::Committed,
            },
        })
    }

    /// Merge field edits into the slot. On a committed slot the edit is mirrored
    /// onto its case in the same write.
    pub async fn update_draft(
        &self,
        actor: &Actor,
        date: NaiveDate,
        branch: &str,
        patch: &CaseFields,
    ) -> Result<Reservation, EngineError> {
        let branch = self.canonical_branch(branch)?;
        self.authorize(actor, &branch)?;
        if let Some(name) = patch.oversized_field() {
            return Err(EngineError::LimitExceeded(name));
        }
        let slot = SlotKey::new(date, branch);
        let lock = self.slot_lock(&slot);
        let _guard = lock.lock().await;

        let mut reservation = self
            .store
            .reservation(&slot)
            .unwrap_or_else(|| Reservation::draft(slot.clone()));
        reservation.fields.merge(patch);

        let event = match &reservation.committed {
            Some(c) => Event::ReservationMirrored {
                key: c.key.clone(),
                reservation: reservation.clone(),
            },
            None => Event::ReservationSaved {
                reservation: reservation.clone(),
            },
        };
        self.persist_and_apply(&slot.branch, &event).await?;
        Ok(reservation)
    }

    /// Turn the slot's draft into a case under the next free number. Re-committing
    /// an already committed slot only re-saves its fields onto the existing case.
    pub async fn commit(
        &self,
        actor: &Actor,
        date: NaiveDate,
        branch: &str,
    ) -> Result<CommitOutcome, EngineError> {
        let branch = self.canonical_branch(branch)?;
        self.authorize(actor, &branch)?;
        let outcome = self.commit_slot(SlotKey::new(date, branch), CommitMode::User).await;
        let status = match &outcome {
            Ok(o) if o.newly_allocated => "allocated",
            Ok(_) => "resaved",
            Err(_) => "error",
        };
        metrics::counter!(crate::observability::COMMITS_TOTAL, "status" => status).increment(1);
        outcome
    }

    /// System commit of an uncommitted slot with blank fields. `None` if the slot
    /// was already committed.
    pub async fn finalize(&self, date: NaiveDate, branch: &str) -> Result<Option<CaseRecord>, EngineError> {
        let slot = SlotKey::new(date, self.canonical_branch(branch)?);
        let outcome = self.commit_slot(slot, CommitMode::Sweep).await?;
        Ok(outcome.newly_allocated.then_some(outcome.record))
    }

    /// Finalize every registry branch for `date`, which must be before `today`.
    pub async fn finalize_day(&self, date: NaiveDate, today: NaiveDate) -> Result<FinalizeReport, EngineError> {
        if date >= today {
            return Err(EngineError::DayNotElapsed(date));
        }
        let mut report = FinalizeReport {
            date: Some(date),
            ..Default::default()
        };
        let branches: Vec<String> = self.registry.branches().map(str::to_string).collect();
        for branch in branches {
            match self.finalize(date, &branch).await {
                Ok(Some(record)) => {
                    info!("finalized {} for {branch} on {date}", record.key);
                    report.finalized.push(record.key);
                }
                Ok(None) => report.skipped.push(branch),
                Err(e) => {
                    error!("finalize {branch} on {date} failed: {e}");
                    report.failed.push((branch, e));
                }
            }
        }
        metrics::counter!(crate::observability::FINALIZED_TOTAL).increment(report.finalized.len() as u64);
        Ok(report)
    }

    /// Finalize each day after the sweep watermark up to `through`, or only
    /// `through` when no sweep has completed yet. Days after a partially failed
    /// one are still swept, but the watermark stops before the failure so the
    /// next call retries it.
    pub async fn finalize_through(
        &self,
        through: NaiveDate,
        today: NaiveDate,
    ) -> Result<Vec<FinalizeReport>, EngineError> {
        if through >= today {
            return Err(EngineError::DayNotElapsed(through));
        }
        let mut date = match self.store.swept_through() {
            Some(swept) if swept >= through => return Ok(Vec::new()),
            Some(swept) => swept.succ_opt().unwrap_or(through),
            None => through,
        };

        let mut reports = Vec::new();
        let mut advancing = true;
        loop {
            let report = self.finalize_day(date, today).await?;
            if !report.failed.is_empty() {
                advancing = false;
            }
            if advancing {
                self.persist(&Event::SweepCompleted { date }).await?;
            }
            reports.push(report);
            match date.succ_opt() {
                Some(next) if next <= through => date = next,
                _ => break,
            }
        }
        if !advancing {
            warn!("sweep watermark held at {:?}", self.store.swept_through());
        }
        Ok(reports)
    }

    async fn commit_slot(&self, slot: SlotKey, mode: CommitMode) -> Result<CommitOutcome, EngineError> {
        let lock = self.slot_lock(&slot);
        let _slot_guard = lock.lock().await;

        let mut reservation = self
            .store
            .reservation(&slot)
            .unwrap_or_else(|| Reservation::draft(slot.clone()));

        if let Some(commitment) = reservation.committed.clone() {
            let record = self
                .store
                .get_case(&commitment.key)
                .ok_or_else(|| EngineError::NotFound(commitment.key.clone()))?;
            if mode == CommitMode::Sweep {
                return Ok(CommitOutcome {
                    reservation,
                    record,
                    newly_allocated: false,
                });
            }
            let event = Event::ReservationMirrored {
                key: commitment.key.clone(),
                reservation: reservation.clone(),
            };
            self.persist_and_apply(&slot.branch, &event).await?;
            let record = self.store.get_case(&commitment.key).unwrap_or(record);
            return Ok(CommitOutcome {
                reservation,
                record,
                newly_allocated: false,
            });
        }

        let (fields, origin) = match mode {
            CommitMode::User => (reservation.fields.clone(), Origin::Reservation(slot.clone())),
            CommitMode::Sweep => (CaseFields::blank(), Origin::Finalized(slot.clone())),
        };
        let code = self.short_code(&slot.branch)?;
        let period = slot.fiscal_period();

        let period_lock = self.period_lock(period);
        let _period_guard = period_lock.lock().await;
        let (sequence, key) = self.claim_key(&code, period, &BTreeSet::new())?;

        let now = self.now();
        let record = CaseRecord {
            id: Ulid::new(),
            key: key.clone(),
            location: slot.branch.clone(),
            fields: fields.clone(),
            origin,
            created_at: now,
        };
        reservation.fields = fields;
        reservation.committed = Some(Commitment {
            sequence,
            key: key.clone(),
            finalized: mode == CommitMode::Sweep,
            committed_at: now,
        });

        let event = Event::ReservationCommitted {
            reservation: reservation.clone(),
            record: record.clone(),
        };
        self.persist_and_apply(&slot.branch, &event).await?;
        let origin_label = match mode {
            CommitMode::User => "reservation",
            CommitMode::Sweep => "finalized",
        };
        metrics::counter!(crate::observability::ALLOCATIONS_TOTAL, "origin" => origin_label).increment(1);
        info!("committed {} as {key}", slot.path());

        Ok(CommitOutcome {
            reservation,
            record,
            newly_allocated: true,
        })
    }
}
