//! Three-stage news analysis: screen, enrich, decide.
//!
//! `StagePipeline` turns one `NewsItem` into a terminal `AnalysisRecord`;
//! `AnalysisService` wraps it with the claim/upsert protocol and signal
//! emission so the batch and on-demand entry points share one code path.

pub mod events;
pub mod pipeline;
pub mod prompts;
pub mod schema;
pub mod service;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use events::{BroadcastSink, LogSink};
pub use pipeline::{PipelineConfig, Stage, StagePipeline};
pub use service::{AnalysisOutcome, AnalysisService};
