/// Longest subject, cohort or owner accepted from the catalog file.
pub const MAX_FIELD_LEN: usize = 256;

/// Catalog entries kept after deduplication.
pub const MAX_CATALOG_ENTRIES: usize = 10_000;

pub const MAX_LAB_ID_LEN: usize = 64;

/// Weeks per academic term.
pub const MAX_WEEKS: u32 = 53;

/// Caller ids longer than this are refused at login.
pub const MAX_CALLER_ID_LEN: usize = 128;

/// Largest WAL payload replay will allocate for. A full week of one-slot
/// reservations is well under this.
pub const MAX_WAL_RECORD_BYTES: usize = 64 * 1024 * 1024;
