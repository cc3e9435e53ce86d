use std::collections::{BTreeMap, BTreeSet, HashSet};

use tokio::sync::{OwnedMutexGuard, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::fiscal::FiscalPeriod;
use crate::keycodec::OfficeKey;
use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, WalCommand, WalControl};

/// A validated batch entry, ready for numbering.
struct PendingCase {
    branch: String,
    code: String,
    period: FiscalPeriod,
    fields: CaseFields,
}

impl Engine {
    /// Acquire period locks in ascending order.
    async fn lock_periods(&self, periods: &BTreeSet<FiscalPeriod>) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(periods.len());
        for &period in periods {
            guards.push(self.period_lock(period).lock_owned().await);
        }
        guards
    }

    /// Create cases from completed fields, numbering each immediately.
    /// All-or-nothing: the whole batch is written as one log record.
    pub async fn create_cases(
        &self,
        actor: &Actor,
        batch: Vec<NewCase>,
    ) -> Result<Vec<CaseRecord>, EngineError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        if batch.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }

        let mut pending = Vec::with_capacity(batch.len());
        for new_case in batch {
            let branch = self.canonical_branch(&new_case.location)?;
            self.authorize(actor, &branch)?;
            if let Some(name) = new_case.fields.missing_required() {
                return Err(EngineError::MissingField(name));
            }
            if let Some(name) = new_case.fields.oversized_field() {
                return Err(EngineError::LimitExceeded(name));
            }
            let Some(&visit_date) = new_case.fields.visit_date.value() else {
                return Err(EngineError::MissingField("visit_date"));
            };
            pending.push(PendingCase {
                code: self.short_code(&branch)?,
                branch,
                period: FiscalPeriod::for_date(visit_date),
                fields: new_case.fields,
            });
        }

        let periods: BTreeSet<FiscalPeriod> = pending.iter().map(|p| p.period).collect();
        let _guards = self.lock_periods(&periods).await;

        // Numbers claimed by earlier entries of this batch, not yet in the store.
        let mut in_batch: BTreeMap<FiscalPeriod, BTreeSet<SequenceNumber>> = BTreeMap::new();
        let now = self.now();
        let mut records = Vec::with_capacity(pending.len());
        for case in pending {
            let taken = in_batch.entry(case.period).or_default();
            let (sequence, key) = self.claim_key(&case.code, case.period, taken)?;
            taken.insert(sequence);
            records.push(CaseRecord {
                id: Ulid::new(),
                key,
                location: case.branch,
                fields: case.fields,
                origin: Origin::Direct,
                created_at: now,
            });
        }

        let event = Event::CasesCreated {
            records: records.clone(),
        };
        self.persist(&event).await?;
        let branches: BTreeSet<&str> = records.iter().map(|r| r.location.as_str()).collect();
        for branch in branches {
            self.notify.send(branch, &event);
        }
        metrics::counter!(crate::observability::ALLOCATIONS_TOTAL, "origin" => "direct")
            .increment(records.len() as u64);
        info!("created {} cases", records.len());
        Ok(records)
    }

    pub async fn create_case(&self, actor: &Actor, new_case: NewCase) -> Result<CaseRecord, EngineError> {
        self.create_cases(actor, vec![new_case])
            .await?
            .pop()
            .ok_or(EngineError::LimitExceeded("empty batch"))
    }

    /// Merge a field patch into a case. Key and number never change.
    pub async fn update_case(
        &self,
        actor: &Actor,
        key: &str,
        patch: &CaseFields,
    ) -> Result<CaseRecord, EngineError> {
        if let Some(name) = patch.oversized_field() {
            return Err(EngineError::LimitExceeded(name));
        }
        let existing = self
            .store
            .get_case(key)
            .ok_or_else(|| EngineError::NotFound(key.to_string()))?;
        let branch = self.case_branch(&existing);
        self.authorize(actor, &branch)?;

        // Linked cases are edited under the reservation's lock so the mirror stays exact.
        let slot_lock = existing.origin.slot().map(|slot| self.slot_lock(slot));
        let _slot_guard = match &slot_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let mut record = self
            .store
            .get_case(key)
            .ok_or_else(|| EngineError::NotFound(key.to_string()))?;
        record.fields.merge(patch);
        let event = Event::CaseUpdated {
            key: key.to_string(),
            fields: record.fields.clone(),
        };
        self.persist_and_apply(&branch, &event).await?;
        Ok(record)
    }

    /// Remove a directly created or imported case. Its number becomes a gap.
    pub async fn delete_case(&self, actor: &Actor, key: &str) -> Result<(), EngineError> {
        let existing = self
            .store
            .get_case(key)
            .ok_or_else(|| EngineError::NotFound(key.to_string()))?;
        if existing.origin.slot().is_some() {
            return Err(EngineError::LinkedToReservation(key.to_string()));
        }
        let branch = self.case_branch(&existing);
        self.authorize(actor, &branch)?;

        let _guard = match OfficeKey::decode(key) {
            Ok(decoded) => Some(self.period_lock(decoded.period).lock_owned().await),
            Err(_) => None,
        };
        if !self.store.contains_case(key) {
            return Err(EngineError::NotFound(key.to_string()));
        }
        let event = Event::CaseDeleted { key: key.to_string() };
        self.persist_and_apply(&branch, &event).await?;
        info!("deleted case {key}");
        Ok(())
    }

    /// Load externally keyed records. Existing keys are left untouched.
    pub async fn import_records(
        &self,
        actor: &Actor,
        records: Vec<LegacyCase>,
    ) -> Result<ImportSummary, EngineError> {
        if *actor != Actor::Admin {
            return Err(EngineError::Forbidden {
                actor: actor.clone(),
                branch: "*".into(),
            });
        }
        if records.len() > MAX_IMPORT_SIZE {
            return Err(EngineError::LimitExceeded("import too large"));
        }
        for legacy in &records {
            if let Some(name) = legacy.fields.oversized_field() {
                return Err(EngineError::LimitExceeded(name));
            }
        }

        let periods: BTreeSet<FiscalPeriod> = records
            .iter()
            .filter_map(|r| OfficeKey::decode(&r.key).ok().map(|k| k.period))
            .collect();
        let _guards = self.lock_periods(&periods).await;

        let mut summary = ImportSummary::default();
        let mut seen = HashSet::new();
        let now = self.now();
        let mut accepted = Vec::new();
        for legacy in records {
            if self.store.contains_case(&legacy.key) || !seen.insert(legacy.key.clone()) {
                summary.skipped_existing += 1;
                continue;
            }
            if OfficeKey::decode(&legacy.key).is_err() {
                summary.malformed_keys += 1;
            }
            let location = self
                .registry
                .canonicalize(&legacy.location)
                .map(str::to_string)
                .unwrap_or(legacy.location);
            accepted.push(CaseRecord {
                id: Ulid::new(),
                key: legacy.key,
                location,
                fields: legacy.fields,
                origin: Origin::Imported,
                created_at: now,
            });
        }
        summary.imported = accepted.len();

        for chunk in accepted.chunks(MAX_BATCH_SIZE) {
            let event = Event::CasesCreated {
                records: chunk.to_vec(),
            };
            self.persist(&event).await?;
            for record in chunk {
                self.notify.send(&record.location, &event);
            }
        }
        info!(
            "imported {} records ({} skipped, {} with foreign keys)",
            summary.imported, summary.skipped_existing, summary.malformed_keys
        );
        Ok(summary)
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let events = self.store.snapshot();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Control(WalControl::Compact { events, response: tx }))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::Control(WalControl::AppendsSinceCompact { response: tx }))
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
