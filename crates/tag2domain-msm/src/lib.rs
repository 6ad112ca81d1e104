//! # tag2domain-msm
//!
//! Applies measurements to the stored tag intervals.
//!
//! This crate provides:
//! - Reference resolution with controlled auto-creation of tags and values
//! - The maximum measurement age guard
//! - [`MeasurementToTags`], which runs resolution, reconciliation and the
//!   resulting writes as one transaction
//!
//! ## Example
//!
//! ```ignore
//! use tag2domain_msm::{FreshnessGuard, MeasurementToTags};
//!
//! let adapter = db.adapter();
//! let mut handler = MeasurementToTags::new(adapter)
//!     .with_freshness(FreshnessGuard::from_minutes(Some(60))?);
//!
//! let result = handler.handle_json(&document).await?;
//! println!("opened {} intervals", result.tag_changes.insert.len());
//! ```

pub mod freshness;
pub mod handler;
pub mod resolver;

// Re-export core types
pub use tag2domain_core::*;

pub use freshness::FreshnessGuard;
pub use handler::MeasurementToTags;
pub use resolver::resolve;
