mod error;
mod reservations;
mod spaces;
#[cfg(test)]
mod tests;
mod validate;

pub use error::{EngineError, RejectReason};
pub use validate::validate_duration;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

use crate::model::*;
use crate::wal::Wal;

pub type SharedSpaceState = Arc<RwLock<SpaceState>>;

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
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush what we have before compacting or reporting counters.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
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
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The datastore: every space behind its own lock, plus the indexes needed
/// to enforce name uniqueness and find a reservation's space.
pub struct Engine {
    spaces: DashMap<SpaceId, SharedSpaceState>,
    /// Unique name index: space name → space id.
    names: DashMap<String, SpaceId>,
    /// Reverse lookup: reservation id → space id.
    reservation_to_space: DashMap<ReservationId, SpaceId>,
    next_space_id: AtomicI64,
    next_reservation_id: AtomicI64,
    /// Registered spaces plus registrations in flight, capped at `max_spaces`.
    space_slots: AtomicUsize,
    max_spaces: usize,
    /// Mutations hold this shared across WAL append + apply; compaction takes it
    /// exclusively so its snapshot matches the log it replaces.
    commit_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

/// Apply a reservation-level event to a space (no locking, caller holds the lock).
fn apply_to_space(ss: &mut SpaceState, event: &Event, index: &DashMap<ReservationId, SpaceId>) {
    match event {
        Event::SpaceUpdated { name, capacity, .. } => {
            ss.name = name.clone();
            ss.capacity = *capacity;
        }
        Event::ReservationCreated { id, space_id, window } => {
            ss.insert_reservation(Reservation { id: *id, window: *window });
            index.insert(*id, *space_id);
        }
        Event::ReservationRescheduled { id, window, .. } => {
            ss.remove_reservation(*id);
            ss.insert_reservation(Reservation { id: *id, window: *window });
        }
        Event::ReservationCancelled { id, .. } => {
            ss.remove_reservation(*id);
            index.remove(id);
        }
        // Registration, deletion and checkpoints are handled at the map level.
        Event::SpaceRegistered { .. } | Event::SpaceDeleted { .. } | Event::SequenceCheckpoint { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            spaces: DashMap::new(),
            names: DashMap::new(),
            reservation_to_space: DashMap::new(),
            next_space_id: AtomicI64::new(1),
            next_reservation_id: AtomicI64::new(1),
            space_slots: AtomicUsize::new(0),
            max_spaces: crate::limits::MAX_SPACES,
            commit_gate: RwLock::new(()),
            wal_tx,
        };

        for event in &events {
            engine.replay_event(event);
        }
        debug!(
            events = events.len(),
            spaces = engine.spaces.len(),
            reservations = engine.reservation_to_space.len(),
            "replayed WAL {}",
            wal_path.display()
        );

        Ok(engine)
    }

    // We're the sole owner of every Arc during replay, so try_write always
    // succeeds. Never use blocking_write here: this may run inside a runtime.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::SpaceRegistered { id, name, capacity } => {
                let ss = SpaceState::new(*id, name.clone(), *capacity);
                self.spaces.insert(*id, Arc::new(RwLock::new(ss)));
                self.names.insert(name.clone(), *id);
                self.space_slots.fetch_add(1, Ordering::SeqCst);
                self.next_space_id.fetch_max(id + 1, Ordering::SeqCst);
            }
            Event::SpaceDeleted { id } => {
                let Some(rs) = self.space_state(id) else { return };
                if let Ok(mut guard) = rs.try_write() {
                    self.drop_space(&mut guard);
                }
            }
            Event::SequenceCheckpoint { next_space_id, next_reservation_id } => {
                self.next_space_id.fetch_max(*next_space_id, Ordering::SeqCst);
                self.next_reservation_id
                    .fetch_max(*next_reservation_id, Ordering::SeqCst);
            }
            other => {
                let Some(space_id) = event_space_id(other) else { return };
                let Some(rs) = self.space_state(&space_id) else { return };
                let Ok(mut guard) = rs.try_write() else { return };
                if let Event::SpaceUpdated { id, name, .. } = other {
                    self.names.remove_if(&guard.name, |_, owner| owner == id);
                    self.names.insert(name.clone(), *id);
                }
                if let Event::ReservationCreated { id, .. } = other {
                    self.next_reservation_id.fetch_max(id + 1, Ordering::SeqCst);
                }
                apply_to_space(&mut guard, other, &self.reservation_to_space);
            }
        }
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
            .map_err(|_| EngineError::DatastoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::DatastoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::DatastoreUnavailable(e.to_string()))
    }

    /// WAL-append then apply. Nothing is applied if the append fails.
    async fn persist_and_apply(&self, ss: &mut SpaceState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_space(ss, event, &self.reservation_to_space);
        Ok(())
    }

    fn space_state(&self, id: &SpaceId) -> Option<SharedSpaceState> {
        self.spaces.get(id).map(|e| e.value().clone())
    }

    fn space_for_reservation(&self, id: &ReservationId) -> Option<SpaceId> {
        self.reservation_to_space.get(id).map(|e| *e.value())
    }

    /// Lookup reservation → space, acquire the space's write lock, and confirm
    /// the reservation is still there once the lock is held.
    async fn resolve_reservation_write(
        &self,
        id: ReservationId,
    ) -> Result<OwnedRwLockWriteGuard<SpaceState>, EngineError> {
        let space_id = self
            .space_for_reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let rs = self
            .space_state(&space_id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let guard = rs.write_owned().await;
        if guard.deleted || guard.get_reservation(id).is_none() {
            return Err(EngineError::ReservationNotFound(id));
        }
        Ok(guard)
    }

    /// Remove a space and everything that points at it. Caller holds its write lock.
    fn drop_space(&self, ss: &mut SpaceState) {
        ss.deleted = true;
        for r in ss.reservations.drain(..) {
            self.reservation_to_space.remove(&r.id);
        }
        self.names.remove_if(&ss.name, |_, owner| *owner == ss.id);
        self.spaces.remove(&ss.id);
        self.release_space_slot();
    }

    /// Reserve room for one more space, failing once the store is full.
    fn claim_space_slot(&self) -> Result<(), EngineError> {
        self.space_slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_spaces).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| EngineError::LimitExceeded("too many spaces"))
    }

    fn release_space_slot(&self) {
        self.space_slots.fetch_sub(1, Ordering::SeqCst);
    }

    /// Snapshot every space (ordered by id) without holding map guards across awaits.
    fn space_states(&self) -> Vec<SharedSpaceState> {
        let mut states: Vec<(SpaceId, SharedSpaceState)> = self
            .spaces
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        states.sort_by_key(|(id, _)| *id);
        states.into_iter().map(|(_, rs)| rs).collect()
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state, preceded by the identity sequences.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut events = vec![Event::SequenceCheckpoint {
            next_space_id: self.next_space_id.load(Ordering::SeqCst),
            next_reservation_id: self.next_reservation_id.load(Ordering::SeqCst),
        }];
        for rs in self.space_states() {
            let guard = rs.read().await;
            if guard.deleted {
                continue;
            }
            events.push(Event::SpaceRegistered {
                id: guard.id,
                name: guard.name.clone(),
                capacity: guard.capacity,
            });
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    space_id: guard.id,
                    window: r.window,
                });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::DatastoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::DatastoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::DatastoreUnavailable(e.to_string()))?;
        debug!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// The space a reservation-level event belongs to.
fn event_space_id(event: &Event) -> Option<SpaceId> {
    match event {
        Event::ReservationCreated { space_id, .. }
        | Event::ReservationRescheduled { space_id, .. }
        | Event::ReservationCancelled { space_id, .. } => Some(*space_id),
        Event::SpaceUpdated { id, .. } => Some(*id),
        Event::SpaceRegistered { .. } | Event::SpaceDeleted { .. } | Event::SequenceCheckpoint { .. } => None,
    }
}
