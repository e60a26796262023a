// Profiler module
//
// Per-layer forward/backward instrumentation for module trees: walks the
// model once, attaches timing hooks to every leaf and turns the recorded
// events into per-iteration reports and exports.

mod core;
mod export;
mod hooks;
mod record;
mod report;
mod walker;

// Re-export public API
pub use self::core::{scoped_profiling, Profiler, ProfilerHandle, ProfilerOptions, ProfilerScope};
pub use export::{export_profile, write_profile, ExportFormat, ProfileSnapshot};
pub use hooks::{format_backward, format_forward, DiagnosticSink, HookRecorder, RecorderOptions};
pub use record::{EventRecord, Phase, RecordLog};
pub use report::{IterationTiming, LayerTiming, ProfileReport};
pub use walker::{ModuleClassifier, ModuleTreeWalker, NamingOptions, NodeKind, QualifiedName};
