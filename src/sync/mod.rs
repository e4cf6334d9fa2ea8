// ABOUTME: Incremental synchronization engine
// ABOUTME: Watermarks, change-set merging and load orchestration

pub mod merge;
pub mod orchestrator;
pub mod watermark;

pub use merge::{ChangeRecord, ChangeSetMergeEngine, MergeKeys, MergeOutcome, MergePlan, MergeStats};
pub use orchestrator::{
    FullLoadMode, FullLoadOutcome, FullLoadSpec, IncrementalOutcome, IncrementalSpec,
    SyncOrchestrator, SyncPhase, SyncPlan, SyncStats,
};
pub use watermark::{Watermark, WatermarkStore};
