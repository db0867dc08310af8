use crate::model::{Ms, ReservationId, SpaceId};

/// Why a reservation write was refused by a business rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Duration,
    Overlap,
}

impl RejectReason {
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::Duration => "duration",
            RejectReason::Overlap => "overlap",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("a space named {0:?} already exists")]
    DuplicateName(String),
    #[error("space not found: {0}")]
    SpaceNotFound(SpaceId),
    #[error("reservation not found: {0}")]
    ReservationNotFound(ReservationId),
    #[error("reservation must last between 1 and 8 hours, got {duration_ms} ms")]
    InvalidDuration { duration_ms: Ms },
    #[error("reservation overlaps existing reservation(s) {conflicting:?} on space {space_id}")]
    OverlapConflict {
        space_id: SpaceId,
        conflicting: Vec<ReservationId>,
    },
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("datastore unavailable: {0}")]
    DatastoreUnavailable(String),
}

impl EngineError {
    /// Business-rule rejections, as opposed to lookups and infrastructure failures.
    pub fn rejection(&self) -> Option<RejectReason> {
        match self {
            EngineError::InvalidDuration { .. } => Some(RejectReason::Duration),
            EngineError::OverlapConflict { .. } => Some(RejectReason::Overlap),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::SpaceNotFound(_) | EngineError::ReservationNotFound(_)
        )
    }
}
