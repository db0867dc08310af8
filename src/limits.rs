//! Operational limits. Anything a client can grow without bound is capped here.

/// Maximum byte length of a space name.
pub const MAX_NAME_LEN: usize = 256;

/// Maximum number of spaces in one store.
pub const MAX_SPACES: usize = 100_000;

/// Maximum number of live reservations on a single space.
pub const MAX_RESERVATIONS_PER_SPACE: usize = 100_000;
