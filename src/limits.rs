use crate::model::Minute;

/// Minutes in a calendar day; `24:00` is the latest valid time.
pub const MINUTES_PER_DAY: Minute = 1440;

pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_REASON_LEN: usize = 500;

/// Upper bound on the "any available" fan-out.
pub const MAX_QUALIFIED_PROFESSIONALS: usize = 256;

pub const MAX_COMBO_SERVICES: usize = 16;

/// Smallest slot cadence accepted from configuration.
pub const MIN_SLOT_CADENCE: Minute = 5;

pub const MAX_DEVICE_ID_LEN: usize = 128;

/// A stash record larger than this is treated as corrupt.
pub const MAX_PENDING_RECORD_BYTES: usize = 64 * 1024;
