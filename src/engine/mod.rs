pub mod aggregate;
mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use aggregate::{aggregate, collect_busy, Aggregation, BusySet, FailureReason, ProviderFailure};
pub use availability::{
    merge_overlapping, resolve_availability, resolve_day, walk_slots, working_window, DayAvailability,
    ResolverOptions,
};
pub(crate) use conflict::now_ms;
pub use error::EngineError;
pub use queries::SlotReport;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::provider::CalendarBackend;
use crate::wal::Wal;

pub type SharedOwnerState = Arc<RwLock<OwnerState>>;

/// Knobs shared by every owner of one tenant.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub time_zone: TimeZoneSpec,
    pub resolver: ResolverOptions,
    /// Used for every weekday an owner has not configured.
    pub default_window: DayWindow,
    /// Per-calendar bound on busy lookups and event creation.
    pub provider_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            time_zone: TimeZoneSpec::tokyo(),
            resolver: ResolverOptions::default(),
            default_window: DayWindow::fallback(),
            provider_timeout: Duration::from_secs(5),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so no buffered bytes leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

pub struct Engine {
    pub state: DashMap<String, SharedOwnerState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: booking request id → owner
    pub(super) request_to_owner: DashMap<Ulid, String>,
    pub(super) calendar: Arc<dyn CalendarBackend>,
    pub config: EngineConfig,
    /// Shared by writes that may create an owner, exclusive during compaction.
    pub(super) owner_gate: RwLock<()>,
}

/// Apply an event directly to an OwnerState (no locking — caller holds the lock).
fn apply_to_owner(os: &mut OwnerState, event: &Event, request_index: &DashMap<Ulid, String>) {
    match event {
        Event::ScheduleDaySet { weekday, window, .. } => os.schedule.set(*weekday, *window),
        Event::ScheduleCleared { .. } => os.schedule.clear(),
        Event::MemberAdded { identity, .. } => {
            if !os.members.contains(identity) {
                os.members.push(identity.clone());
            }
        }
        Event::MemberRemoved { identity, .. } => os.members.retain(|m| m != identity),
        Event::RequestSubmitted {
            id,
            owner,
            span,
            guest_name,
            guest_email,
            note,
        } => {
            os.insert_request(BookingRequest {
                id: *id,
                owner: owner.clone(),
                span: *span,
                guest_name: guest_name.clone(),
                guest_email: guest_email.clone(),
                note: note.clone(),
                status: RequestStatus::Pending,
            });
            request_index.insert(*id, owner.clone());
        }
        Event::RequestConfirmed { id, event_id, link, .. } => {
            if let Some(r) = os.request_mut(id) {
                r.status = RequestStatus::Confirmed {
                    event_id: event_id.clone(),
                    link: link.clone(),
                };
            }
        }
        Event::RequestDeclined { id, .. } => {
            if let Some(r) = os.request_mut(id) {
                r.status = RequestStatus::Declined;
            }
        }
        Event::RequestExpired { id, .. } => {
            if let Some(r) = os.request_mut(id) {
                r.status = RequestStatus::Expired;
            }
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, calendar: Arc<dyn CalendarBackend>, config: EngineConfig) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            request_to_owner: DashMap::new(),
            calendar,
            config,
            owner_gate: RwLock::new(()),
        };

        // Sole owner of these Arcs during replay, so try_write always succeeds.
        // Never block here: this may run inside an async context (lazy tenant creation).
        for event in &events {
            let os = engine
                .state
                .entry(event.owner().to_string())
                .or_insert_with(|| Arc::new(RwLock::new(OwnerState::new(event.owner().to_string()))))
                .clone();
            let mut guard = os.try_write().expect("replay: uncontended write");
            apply_to_owner(&mut guard, event, &engine.request_to_owner);
        }

        Ok(engine)
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

    pub fn get_owner(&self, owner: &str) -> Option<SharedOwnerState> {
        self.state.get(owner).map(|e| e.value().clone())
    }

    pub fn get_owner_for_request(&self, request_id: &Ulid) -> Option<String> {
        self.request_to_owner.get(request_id).map(|e| e.value().clone())
    }

    /// Owners come into existence on their first write.
    /// Callers hold `owner_gate` shared until their event is persisted.
    pub(super) fn get_or_create_owner(&self, owner: &str) -> Result<SharedOwnerState, EngineError> {
        if let Some(os) = self.get_owner(owner) {
            return Ok(os);
        }
        if owner.is_empty() {
            return Err(EngineError::InvalidInput("owner is empty"));
        }
        if owner.len() > MAX_OWNER_LEN {
            return Err(EngineError::LimitExceeded("owner name too long"));
        }
        if self.state.len() >= MAX_OWNERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many owners"));
        }
        Ok(self
            .state
            .entry(owner.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(OwnerState::new(owner.to_string()))))
            .clone())
    }

    /// WAL-append + apply in one call.
    pub(super) async fn persist_and_apply(&self, os: &mut OwnerState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_owner(os, event, &self.request_to_owner);
        Ok(())
    }

    /// Lookup request → owner, get owner, acquire write lock.
    pub(super) async fn resolve_request_write(
        &self,
        request_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<OwnerState>, EngineError> {
        let owner = self
            .get_owner_for_request(request_id)
            .ok_or(EngineError::NotFound(*request_id))?;
        let os = self
            .get_owner(&owner)
            .ok_or(EngineError::UnknownOwner(owner))?;
        Ok(os.write_owned().await)
    }
}
