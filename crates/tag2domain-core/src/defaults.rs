//! Centralized default constants for tag2domain.
//!
//! All crates and the ingest binary reference these constants instead of
//! defining their own magic numbers.

// =============================================================================
// TAG TYPES
// =============================================================================

/// Tag type for domain intersections.
pub const TAG_TYPE_DOMAIN: &str = "domain";

/// Tag type for delegation intersections.
pub const TAG_TYPE_DELEGATION: &str = "delegation";

/// Tag type for generic intersections.
pub const TAG_TYPE_INTERSECTION: &str = "intersection";

/// Intersection table backing [`TAG_TYPE_DOMAIN`] in the shipped schema.
pub const DOMAIN_TABLE: &str = "domain_tags";

/// Intersection table backing [`TAG_TYPE_DELEGATION`] in the shipped schema.
pub const DELEGATION_TABLE: &str = "delegation_tags";

/// Intersection table backing [`TAG_TYPE_INTERSECTION`] in the shipped schema.
pub const INTERSECTION_TABLE: &str = "intersection_tags";

// =============================================================================
// MEASUREMENTS
// =============================================================================

/// Separator between measurement documents in a stream.
pub const STREAM_SEPARATOR: &str = "--**--SEPARATOR-52579864--**--";

/// Maximum measurement age; `None` disables the check.
pub const MAX_MEASUREMENT_AGE_MINUTES: Option<i64> = None;

// =============================================================================
// INGEST
// =============================================================================

/// Attempts per measurement before the ingest loop gives up on a storage failure.
pub const RETRY_MAX_ATTEMPTS: u32 = 5;

/// Base backoff between retries; multiplied by the attempt number.
pub const RETRY_BACKOFF_MS: u64 = 500;

/// Connections in the ingest pool. Measurements are handled one at a time.
pub const INGEST_MAX_CONNECTIONS: u32 = 2;
