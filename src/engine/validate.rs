use crate::model::*;

use super::EngineError;

/// Shortest accepted reservation (inclusive).
pub const MIN_RESERVATION_MS: Ms = HOUR_MS;
/// Longest accepted reservation (inclusive).
pub const MAX_RESERVATION_MS: Ms = 8 * HOUR_MS;

/// True iff the window lasts between 1 and 8 hours, both bounds inclusive.
/// Empty and inverted windows are invalid.
pub fn validate_duration(window: &Window) -> bool {
    (MIN_RESERVATION_MS..=MAX_RESERVATION_MS).contains(&window.duration_ms())
}

pub(crate) fn check_duration(window: &Window) -> Result<(), EngineError> {
    if validate_duration(window) {
        Ok(())
    } else {
        Err(EngineError::InvalidDuration {
            duration_ms: window.duration_ms(),
        })
    }
}

/// Every reservation on the space that intersects `window`, skipping `exclude`
/// (the reservation being rescheduled, which must not conflict with itself).
pub fn collect_overlaps(
    space: &SpaceState,
    window: &Window,
    exclude: Option<ReservationId>,
) -> Vec<Reservation> {
    space
        .overlapping(*window)
        .filter(|r| Some(r.id) != exclude)
        .cloned()
        .collect()
}

pub(crate) fn check_no_overlap(
    space: &SpaceState,
    window: &Window,
    exclude: Option<ReservationId>,
) -> Result<(), EngineError> {
    let conflicting: Vec<ReservationId> = collect_overlaps(space, window, exclude)
        .iter()
        .map(|r| r.id)
        .collect();
    if conflicting.is_empty() {
        Ok(())
    } else {
        Err(EngineError::OverlapConflict {
            space_id: space.id,
            conflicting,
        })
    }
}
