pub mod resolution;
pub mod bar_store;
pub mod jsonl_store;
pub mod trigger_registry;
pub mod stats;
pub mod write_buffer;
pub mod bar_accumulator;
pub mod backfiller;
pub mod gap_scanner;
pub mod reconciler;
pub mod pipeline;

pub use resolution::Resolution;
pub use bar_store::{BarStore, MemoryBarStore};
pub use jsonl_store::JsonlBarStore;
pub use trigger_registry::{Trigger, TriggerRegistry, Triggers};
pub use stats::{HealthReport, PipelineStats, StatsSnapshot};
pub use write_buffer::{WriteBuffer, WriteBufferConfig, WriteBufferHandle, WriteItem};
pub use bar_accumulator::{AccumulatorEvent, BarAccumulator, FeedMessage};
pub use backfiller::Backfiller;
pub use gap_scanner::{cluster_runs, GapScanner, MissingRun, ScanReport};
pub use reconciler::{ReconcileRequest, Reconciler, SupervisorPolicy};
pub use pipeline::{PipelineSet, PipelineSettings};
