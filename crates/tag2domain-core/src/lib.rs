//! # tag2domain-core
//!
//! Core types, traits, and interval reconciliation for tag2domain.
//!
//! This crate provides the measurement model, the error taxonomy, the pure
//! reconciliation algorithm, and the [`StorageAdapter`] seam that the other
//! tag2domain crates depend on.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod measurement;
#[cfg(feature = "mock")]
pub mod mock;
pub mod models;
pub mod reconcile;
pub mod temporal;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Disposition, Error, Result};
pub use measurement::{
    IdOrName, Measurement, MeasurementDocument, MeasurementTag, TagRef, TaxonomyRef, ValueRef,
};
pub use models::*;
pub use reconcile::{calc_changes, reconcile};
pub use temporal::{format_timestamp, parse_timestamp};
pub use traits::*;
