//! Bookkeeping primitives
//!
//! Append-only ledgers plus the manifest (upsert) and readiness/watermark
//! tables. Every write carries the execution id that produced it; the
//! facades attach it so pipelines cannot forget.

mod anomalies;
mod manifest;
mod quality;
mod readiness;
mod rejects;
mod watermarks;

pub use anomalies::AnomalyRecorder;
pub use manifest::Manifest;
pub use quality::{HistoryWindow, QualityCheck, QualityComparison, QualityReport, QualityRunner};
pub use readiness::Readiness;
pub use rejects::RejectSink;
pub use watermarks::Watermarks;
