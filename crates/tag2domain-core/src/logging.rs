//! Structured logging schema and field name constants for tag2domain.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation can query measurement handling by the same field names
//! across the resolver, the reconciler, and the storage adapter.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Corrupted reference data, unrecoverable storage failure |
//! | WARN  | Rejected or stale measurement, retry scheduled |
//! | INFO  | Lifecycle events, interval open/prolong/end, new tags and values |
//! | DEBUG | Resolution decisions, per-phase timings |
//! | TRACE | Per-row adapter work |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "msm", "db", "ingest"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "resolver", "reconciler", "adapter", "pool", "stream"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "handle_measurement", "resolve", "insert_intersections"
pub const OPERATION: &str = "op";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Producer that emitted the measurement.
pub const PRODUCER: &str = "producer";

/// Producer-assigned measurement identifier.
pub const MEASUREMENT_ID: &str = "measurement_id";

/// Tag type selecting the intersection table.
pub const TAG_TYPE: &str = "tag_type";

/// Entity the measurement refers to.
pub const TAGGED_ID: &str = "tagged_id";

/// Resolved taxonomy ID.
pub const TAXONOMY_ID: &str = "taxonomy_id";

/// Tag ID of an interval.
pub const TAG_ID: &str = "tag_id";

/// Value ID of an interval (absent for value-less tags).
pub const VALUE_ID: &str = "value_id";

// ─── Reconciliation fields ─────────────────────────────────────────────────

/// Number of intervals opened.
pub const INSERT_COUNT: &str = "insert_count";

/// Number of intervals prolonged.
pub const PROLONG_COUNT: &str = "prolong_count";

/// Number of intervals closed.
pub const END_COUNT: &str = "end_count";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of rows returned by a query.
pub const RESULT_COUNT: &str = "result_count";

// ─── Database fields ───────────────────────────────────────────────────────

/// Number of active connections in the pool.
pub const POOL_SIZE: &str = "pool_size";

/// Number of idle connections in the pool.
pub const POOL_IDLE: &str = "pool_idle";

/// Database table affected.
pub const DB_TABLE: &str = "db_table";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error kind (see `Error::kind`).
pub const ERROR_KIND: &str = "error_kind";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Retry attempt number.
pub const ATTEMPT: &str = "attempt";
