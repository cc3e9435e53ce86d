mod allocator;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod store;

pub use allocator::lowest_free;
pub use error::EngineError;
pub use lifecycle::FinalizeReport;
pub use store::InMemoryStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};

use crate::fiscal::FiscalPeriod;
use crate::location::LocationRegistry;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

type AppendAck = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append { event: Event, response: AppendAck },
    Control(WalControl),
}

/// Requests served between append batches.
pub(super) enum WalControl {
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Appends that queue up while a flush is running are written
/// together and share one fsync; a control request ends the batch and runs
/// after it.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            WalCommand::Control(control) => {
                run_control(&mut wal, control);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut control = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                WalCommand::Control(c) => {
                    control = Some(c);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(c) = control {
            run_control(&mut wal, c);
        }
    }
}

fn commit_batch(wal: &mut Wal<Event>, batch: Vec<(Event, AppendAck)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        tracing::error!("WAL write of {} records failed: {e}", batch.len());
        // Cut the file back to the last acknowledged record so a partial frame
        // cannot hide later appends from replay.
        if let Err(rollback) = wal.rollback() {
            tracing::error!("WAL rollback failed: {rollback}");
        }
    }
    for (_, ack) in batch {
        let _ = ack.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

fn run_control(wal: &mut Wal<Event>, control: WalControl) {
    match control {
        WalControl::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalControl::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

/// Allocation and reservation engine over one WAL-backed store.
///
/// Lock order: slot lock, then period locks in ascending period order.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub registry: Arc<LocationRegistry>,
    /// One writer per fiscal period at a time: makes scan-then-write atomic.
    period_locks: DashMap<FiscalPeriod, Arc<Mutex<()>>>,
    /// Serializes commit/edit of a single (date, branch) reservation.
    slot_locks: DashMap<SlotKey, Arc<Mutex<()>>>,
    /// Writers hold it shared across append+apply; compaction holds it exclusively
    /// so its snapshot never misses an appended event.
    pub(super) write_gate: RwLock<()>,
    /// Case keys claimed by writes that are not yet applied.
    in_flight: DashMap<String, ()>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        registry: Arc<LocationRegistry>,
    ) -> io::Result<Self> {
        let (wal, replay) = Wal::<Event>::recover(&wal_path)?;
        if replay.discarded_tail {
            tracing::warn!(
                "{}: truncated torn or corrupt tail after {} valid entries ({} bytes)",
                wal_path.display(),
                replay.records.len(),
                replay.valid_len
            );
        }
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = InMemoryStore::new();
        for event in &replay.records {
            store.apply_event(event);
        }
        tracing::info!(
            "replayed {} events: {} cases",
            replay.records.len(),
            store.case_count()
        );

        Ok(Self {
            store,
            wal_tx,
            notify,
            registry,
            period_locks: DashMap::new(),
            slot_locks: DashMap::new(),
            write_gate: RwLock::new(()),
            in_flight: DashMap::new(),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply. Nothing changes in memory unless the append succeeded.
    ///
    /// Events that create cases are conditional writes: every new key must be
    /// neither stored nor claimed by another in-flight write, else the event is
    /// rejected with `DuplicateAllocation` before it reaches the log.
    pub(super) async fn persist(&self, event: &Event) -> Result<(), EngineError> {
        let keys = event.new_case_keys();
        self.claim_keys(&keys)?;
        let result = self.append_and_apply(event).await;
        for key in keys {
            self.in_flight.remove(key);
        }
        result
    }

    async fn append_and_apply(&self, event: &Event) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        self.wal_append(event).await?;
        self.store.apply_event(event);
        metrics::counter!(crate::observability::EVENTS_TOTAL, "event" => crate::observability::event_label(event))
            .increment(1);
        Ok(())
    }

    /// Claim `keys` for one write, all or none.
    pub(super) fn claim_keys(&self, keys: &[&str]) -> Result<(), EngineError> {
        for (i, &key) in keys.iter().enumerate() {
            // Claim first, then look at the store: a writer that finished in
            // between has already applied its case.
            let claimed = match self.in_flight.entry(key.to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(());
                    true
                }
                Entry::Occupied(_) => false,
            };
            if !claimed || self.store.contains_case(key) {
                let held = if claimed { &keys[..=i] } else { &keys[..i] };
                for k in held {
                    self.in_flight.remove(*k);
                }
                tracing::warn!("conditional write lost {key} to a concurrent writer");
                metrics::counter!(crate::observability::ALLOCATION_CONFLICTS_TOTAL).increment(1);
                return Err(EngineError::DuplicateAllocation(key.to_string()));
            }
        }
        Ok(())
    }

    pub(super) async fn persist_and_apply(&self, branch: &str, event: &Event) -> Result<(), EngineError> {
        self.persist(event).await?;
        self.notify.send(branch, event);
        Ok(())
    }

    pub(super) fn period_lock(&self, period: FiscalPeriod) -> Arc<Mutex<()>> {
        self.period_locks.entry(period).or_default().clone()
    }

    pub(super) fn slot_lock(&self, slot: &SlotKey) -> Arc<Mutex<()>> {
        self.slot_locks.entry(slot.clone()).or_default().clone()
    }

    /// Canonical branch name, or `UnknownLocation`.
    pub fn canonical_branch(&self, name: &str) -> Result<String, EngineError> {
        self.registry
            .canonicalize(name)
            .map(str::to_string)
            .ok_or_else(|| EngineError::UnknownLocation(name.to_string()))
    }

    pub(super) fn short_code(&self, branch: &str) -> Result<String, EngineError> {
        self.registry
            .short_code_of(branch)
            .map(str::to_string)
            .ok_or_else(|| EngineError::UnknownLocation(branch.to_string()))
    }

    /// A branch actor may only touch its own branch.
    pub(super) fn authorize(&self, actor: &Actor, branch: &str) -> Result<(), EngineError> {
        let allowed = match actor {
            Actor::Admin | Actor::Scheduler => true,
            Actor::Branch(own) => self.registry.canonicalize(own) == Some(branch),
        };
        if allowed {
            Ok(())
        } else {
            Err(EngineError::Forbidden {
                actor: actor.clone(),
                branch: branch.to_string(),
            })
        }
    }

    pub(super) fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
