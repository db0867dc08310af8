use std::sync::atomic::Ordering;

use tracing::{error, info};

use crate::limits::*;
use crate::model::*;
use crate::observability::RESERVATIONS_REJECTED_TOTAL;

use super::validate::{check_duration, check_no_overlap, collect_overlaps};
use super::{Engine, EngineError};

/// Log and count a failed reservation write. Rule rejections are expected
/// traffic; datastore failures are not.
fn record_failure(op: &'static str, err: &EngineError) {
    if let Some(reason) = err.rejection() {
        metrics::counter!(RESERVATIONS_REJECTED_TOTAL, "reason" => reason.label(), "op" => op)
            .increment(1);
        info!(op, reason = reason.label(), "reservation rejected: {err}");
    } else if matches!(err, EngineError::DatastoreUnavailable(_)) {
        error!(op, "reservation write failed: {err}");
    } else {
        info!(op, "reservation write refused: {err}");
    }
}

impl Engine {
    /// Duration check, then overlap check against every reservation on the
    /// space, then commit. The space's write lock is held from the overlap
    /// check through the commit, so concurrent writers on one space serialize.
    pub async fn create_reservation(
        &self,
        space_id: SpaceId,
        window: Window,
    ) -> Result<ReservationId, EngineError> {
        let result = self.try_create_reservation(space_id, window).await;
        match &result {
            Ok(id) => info!(reservation_id = id, space_id, "reservation created"),
            Err(e) => record_failure("create", e),
        }
        result
    }

    async fn try_create_reservation(
        &self,
        space_id: SpaceId,
        window: Window,
    ) -> Result<ReservationId, EngineError> {
        check_duration(&window)?;

        let _gate = self.commit_gate.read().await;
        let rs = self
            .space_state(&space_id)
            .ok_or(EngineError::SpaceNotFound(space_id))?;
        let mut guard = rs.write().await;
        if guard.deleted {
            return Err(EngineError::SpaceNotFound(space_id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_SPACE {
            return Err(EngineError::LimitExceeded("too many reservations on space"));
        }

        check_no_overlap(&guard, &window, None)?;

        let id = self.next_reservation_id.fetch_add(1, Ordering::SeqCst);
        let event = Event::ReservationCreated { id, space_id, window };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(id)
    }

    /// Move a reservation to a new window. Both checks run again; the
    /// reservation itself is left out of the overlap set.
    pub async fn update_reservation_time(
        &self,
        id: ReservationId,
        window: Window,
    ) -> Result<(), EngineError> {
        let result = self.try_update_reservation_time(id, window).await;
        match &result {
            Ok(()) => info!(reservation_id = id, "reservation rescheduled"),
            Err(e) => record_failure("update", e),
        }
        result
    }

    async fn try_update_reservation_time(
        &self,
        id: ReservationId,
        window: Window,
    ) -> Result<(), EngineError> {
        check_duration(&window)?;

        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_reservation_write(id).await?;
        check_no_overlap(&guard, &window, Some(id))?;

        let event = Event::ReservationRescheduled { id, space_id: guard.id, window };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn cancel_reservation(&self, id: ReservationId) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_reservation_write(id).await?;
        let space_id = guard.id;
        let event = Event::ReservationCancelled { id, space_id };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(reservation_id = id, space_id, "reservation cancelled");
        Ok(())
    }

    pub async fn get_reservation(&self, id: ReservationId) -> Result<ReservationInfo, EngineError> {
        let space_id = self
            .space_for_reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let rs = self
            .space_state(&space_id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let guard = rs.read().await;
        guard
            .get_reservation(id)
            .map(|r| guard.reservation_info(r))
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// Every reservation, ordered by id.
    pub async fn list_reservations(&self) -> Vec<ReservationInfo> {
        let mut all = Vec::new();
        for rs in self.space_states() {
            let guard = rs.read().await;
            all.extend(guard.reservations.iter().map(|r| guard.reservation_info(r)));
        }
        all.sort_by_key(|r| r.id);
        all
    }

    /// Reservations on one space, ordered by start time. Unknown spaces have none.
    pub async fn list_reservations_by_space(&self, space_id: SpaceId) -> Vec<ReservationInfo> {
        let Some(rs) = self.space_state(&space_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        guard
            .reservations
            .iter()
            .map(|r| guard.reservation_info(r))
            .collect()
    }

    /// Reservations on `space_id` that intersect `window` under the closed-interval rule.
    pub async fn find_overlaps(
        &self,
        space_id: SpaceId,
        window: Window,
        exclude: Option<ReservationId>,
    ) -> Vec<ReservationInfo> {
        let Some(rs) = self.space_state(&space_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        collect_overlaps(&guard, &window, exclude)
            .iter()
            .map(|r| guard.reservation_info(r))
            .collect()
    }
}
