use serde::{Deserialize, Serialize};

/// Unix milliseconds, UTC. The only time type.
pub type Ms = i64;

pub type SpaceId = i64;
pub type ReservationId = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// Closed interval `[start, end]`. Two windows that share a boundary instant overlap.
///
/// Unlike a validated reservation, a window may be empty or inverted; the
/// duration check rejects those before anything is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: Ms,
    pub end: Ms,
}

impl Window {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    /// Saturates at the i64 bounds, which lie far outside any valid duration.
    pub fn duration_ms(&self) -> Ms {
        self.end.saturating_sub(self.start)
    }

    pub fn overlaps(&self, other: &Window) -> bool {
        self.start <= other.end && self.end >= other.start
    }
}

/// A committed reservation, as held inside its space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub window: Window,
}

#[derive(Debug, Clone)]
pub struct SpaceState {
    pub id: SpaceId,
    pub name: String,
    pub capacity: u32,
    /// Set under the write lock when the space is deleted, so writers that
    /// queued on the lock see the space as gone.
    pub deleted: bool,
    /// Reservations sorted by `window.start`.
    pub reservations: Vec<Reservation>,
}

impl SpaceState {
    pub fn new(id: SpaceId, name: String, capacity: u32) -> Self {
        Self {
            id,
            name,
            capacity,
            deleted: false,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by window.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.window.start, |r| r.window.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: ReservationId) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get_reservation(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Reservations whose window intersects `query` under the closed rule.
    /// Binary search skips everything starting after `query.end`.
    pub fn overlapping(&self, query: Window) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.window.start <= query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.window.end >= query.start)
    }

    pub fn info(&self) -> SpaceInfo {
        SpaceInfo {
            id: self.id,
            name: self.name.clone(),
            capacity: self.capacity,
        }
    }

    pub fn reservation_info(&self, reservation: &Reservation) -> ReservationInfo {
        ReservationInfo {
            id: reservation.id,
            space_id: self.id,
            start: reservation.window.start,
            end: reservation.window.end,
        }
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SpaceRegistered {
        id: SpaceId,
        name: String,
        capacity: u32,
    },
    SpaceUpdated {
        id: SpaceId,
        name: String,
        capacity: u32,
    },
    SpaceDeleted {
        id: SpaceId,
    },
    ReservationCreated {
        id: ReservationId,
        space_id: SpaceId,
        window: Window,
    },
    ReservationRescheduled {
        id: ReservationId,
        space_id: SpaceId,
        window: Window,
    },
    ReservationCancelled {
        id: ReservationId,
        space_id: SpaceId,
    },
    /// Written first by compaction so identity sequences survive the loss of
    /// the events that advanced them.
    SequenceCheckpoint {
        next_space_id: SpaceId,
        next_reservation_id: ReservationId,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceInfo {
    pub id: SpaceId,
    pub name: String,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub id: ReservationId,
    pub space_id: SpaceId,
    pub start: Ms,
    pub end: Ms,
}
