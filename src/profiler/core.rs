// Core profiler implementation module

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::export::ProfileSnapshot;
use super::hooks::{DiagnosticSink, HookRecorder, ProfilerShared, RecorderOptions};
use super::record::{EventRecord, Phase};
use super::report::ProfileReport;
use super::walker::{ModuleClassifier, ModuleTreeWalker, NamingOptions};
use crate::error::Result;
use crate::module::Module;

/// Tunables for classification, naming and hook output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerOptions {
    pub classifier: ModuleClassifier,
    pub naming: NamingOptions,
    pub recorder: RecorderOptions,
}

/// Per-layer forward/backward profiler for one model and one process.
///
/// Hooks are installed on the first `start()` and stay installed; `stop()`
/// only turns recording off. Records accumulate for the lifetime of the
/// profiler.
pub struct Profiler {
    model: Arc<dyn Module>,
    pid: String,
    enabled: bool,
    hook_done: bool,
    layer_num: usize,
    options: ProfilerOptions,
    shared: Arc<ProfilerShared>,
}

impl fmt::Debug for Profiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profiler")
            .field("model", &self.model.type_name())
            .field("pid", &self.pid)
            .field("enabled", &self.enabled)
            .field("hook_done", &self.hook_done)
            .field("layer_num", &self.layer_num)
            .field("profiling_on", &self.is_profiling())
            .finish()
    }
}

impl Profiler {
    /// Create a profiler printing diagnostics to stdout
    pub fn new(model: Arc<dyn Module>, pid: impl fmt::Display, enabled: bool) -> Self {
        Self::with_options(model, pid, enabled, ProfilerOptions::default(), DiagnosticSink::Stdout)
    }

    pub fn with_options(
        model: Arc<dyn Module>,
        pid: impl fmt::Display,
        enabled: bool,
        options: ProfilerOptions,
        sink: DiagnosticSink,
    ) -> Self {
        let pid = pid.to_string();
        let shared = Arc::new(ProfilerShared::new(pid.clone(), sink, options.recorder.clone()));
        Self {
            model,
            pid,
            enabled,
            hook_done: false,
            layer_num: 0,
            options,
            shared,
        }
    }

    pub fn pid(&self) -> &str {
        &self.pid
    }

    /// Whether scopes turn recording on
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_profiling(&self) -> bool {
        self.shared.profiling_on.load(Ordering::SeqCst)
    }

    pub fn hook_done(&self) -> bool {
        self.hook_done
    }

    /// Number of instrumented leaves
    pub fn layer_num(&self) -> usize {
        self.layer_num
    }

    /// Install hooks (first call only) and turn recording on.
    ///
    /// A model that cannot be walked fails here; later calls then only
    /// flip the flag.
    pub fn start(&mut self) -> Result<&mut Self> {
        if !self.hook_done {
            self.hook_done = true;
            self.layer_num = self.hook_modules()?;
        }
        self.shared.profiling_on.store(true, Ordering::SeqCst);
        Ok(self)
    }

    /// Turn recording off; hooks stay installed
    pub fn stop(&mut self) -> &mut Self {
        self.shared.profiling_on.store(false, Ordering::SeqCst);
        self
    }

    fn hook_modules(&self) -> Result<usize> {
        let walker = ModuleTreeWalker::new(&self.options.classifier)
            .with_naming(self.options.naming.clone());
        let shared = &self.shared;
        let layer_num = walker.walk(self.model.as_ref(), &self.pid, |leaf, name| {
            debug!("instrumenting {}", name);
            HookRecorder::new(name, shared).attach(leaf);
        })?;
        info!(
            "[{}] profiler attached to {} layers of {}",
            self.pid,
            layer_num,
            self.model.type_name()
        );
        Ok(layer_num)
    }

    /// Record for the lifetime of the returned guard (when enabled)
    pub fn scope(&mut self) -> Result<ProfilerScope<'_>> {
        if self.enabled {
            self.start()?;
        }
        Ok(ProfilerScope { profiler: self })
    }

    pub fn records(&self, phase: Phase) -> Vec<EventRecord> {
        self.shared.records.snapshot(phase)
    }

    pub fn snapshot(&self) -> ProfileSnapshot {
        ProfileSnapshot {
            pid: self.pid.clone(),
            layer_num: self.layer_num,
            forward: self.records(Phase::Forward),
            backward: self.records(Phase::Backward),
        }
    }

    pub fn report(&self) -> Result<ProfileReport> {
        ProfileReport::build(
            self.layer_num,
            &self.records(Phase::Forward),
            &self.records(Phase::Backward),
        )
    }

    /// Per-iteration forward/backward timing text
    pub fn format_report(&self) -> Result<String> {
        Ok(self.report()?.to_string())
    }
}

impl fmt::Display for Profiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.report() {
            Ok(report) => write!(f, "{}", report),
            Err(e) => write!(f, "<{}>", e),
        }
    }
}

/// Borrowing guard returned by [`Profiler::scope`]; stops recording on drop
pub struct ProfilerScope<'p> {
    profiler: &'p mut Profiler,
}

impl Deref for ProfilerScope<'_> {
    type Target = Profiler;

    fn deref(&self) -> &Profiler {
        self.profiler
    }
}

impl DerefMut for ProfilerScope<'_> {
    fn deref_mut(&mut self) -> &mut Profiler {
        self.profiler
    }
}

impl Drop for ProfilerScope<'_> {
    fn drop(&mut self) {
        if self.profiler.enabled {
            self.profiler.stop();
        }
    }
}

/// Owning guard returned by [`scoped_profiling`]; stops recording on drop
pub struct ProfilerHandle {
    profiler: Profiler,
}

impl Deref for ProfilerHandle {
    type Target = Profiler;

    fn deref(&self) -> &Profiler {
        &self.profiler
    }
}

impl DerefMut for ProfilerHandle {
    fn deref_mut(&mut self) -> &mut Profiler {
        &mut self.profiler
    }
}

impl Drop for ProfilerHandle {
    fn drop(&mut self) {
        if self.profiler.enabled {
            self.profiler.stop();
        }
    }
}

/// Create a profiler for `model` and, when `enabled`, start recording
/// until the returned handle is dropped
pub fn scoped_profiling(
    model: Arc<dyn Module>,
    pid: impl fmt::Display,
    enabled: bool,
) -> Result<ProfilerHandle> {
    let mut profiler = Profiler::new(model, pid, enabled);
    if enabled {
        profiler.start()?;
    }
    Ok(ProfilerHandle { profiler })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::Tape;
    use crate::error::Error;
    use crate::module::invoke;
    use crate::module::test_support::Probe;
    use crate::tensor::{DataType, Tensor};
    use ndarray::{ArrayD, IxDyn};

    fn model() -> Arc<dyn Module> {
        Arc::new(Probe::node(
            "PeleeNet",
            vec![
                Probe::node("Sequential", vec![Probe::leaf("Conv2d"), Probe::leaf("ReLU")]),
                Probe::leaf("Linear"),
            ],
        ))
    }

    fn quiet(model: Arc<dyn Module>, enabled: bool) -> Profiler {
        let options = ProfilerOptions::default();
        Profiler::with_options(model, 5, enabled, options, DiagnosticSink::Discard)
    }

    fn step(model: &dyn Module, backward: bool) {
        let mut tape = Tape::new();
        let x = tape.input(Tensor::new(&[1, 2], DataType::Float32));
        let y = invoke(model, &x, &mut tape).unwrap();
        if backward {
            tape.backward(&y, ArrayD::ones(IxDyn(&[1, 2]))).unwrap();
        }
    }

    #[test]
    fn test_start_walks_once() {
        let model = model();
        let mut profiler = quiet(Arc::clone(&model), true);
        assert!(!profiler.is_profiling());
        profiler.start().unwrap();
        assert_eq!(profiler.layer_num(), 3);
        profiler.stop();
        assert!(!profiler.is_profiling());
        profiler.start().unwrap();
        assert!(profiler.is_profiling());
        assert_eq!(profiler.layer_num(), 3);

        // 4 callbacks per leaf from a single walk
        let children = model.children();
        let first = children[0].1;
        assert_eq!(first.children()[0].1.hooks().len(), 4);
    }

    #[test]
    fn test_records_only_while_on() {
        let model = model();
        let mut profiler = quiet(Arc::clone(&model), true);
        profiler.start().unwrap();
        profiler.stop();
        step(model.as_ref(), true);
        assert!(profiler.records(Phase::Forward).is_empty());

        profiler.start().unwrap();
        step(model.as_ref(), true);
        step(model.as_ref(), false);
        let forward: Vec<String> =
            profiler.records(Phase::Forward).into_iter().map(|r| r.name).collect();
        assert_eq!(
            forward[..3],
            [
                "[5] PeleeNet/Sequential/Conv2d",
                "[5] PeleeNet/Sequential/ReLU",
                "[5] PeleeNet/Linear"
            ]
        );
        assert_eq!(forward.len(), 6);
        assert_eq!(profiler.records(Phase::Backward).len(), 3);

        let report = profiler.report().unwrap();
        assert_eq!(report.iteration_count(), 2);
        assert!(report.iterations[1].backward.is_empty());
    }

    #[test]
    fn test_scope_stops_on_early_return() {
        fn failing_step(profiler: &mut Profiler) -> Result<()> {
            let scope = profiler.scope()?;
            assert!(scope.is_profiling());
            Err(Error::AutogradError("boom".to_string()))
        }
        let mut profiler = quiet(model(), true);
        assert!(failing_step(&mut profiler).is_err());
        assert!(!profiler.is_profiling());
        assert!(profiler.hook_done());
    }

    #[test]
    fn test_disabled_scope_installs_nothing() {
        let model = model();
        let mut profiler = quiet(Arc::clone(&model), false);
        {
            let _scope = profiler.scope().unwrap();
            step(model.as_ref(), true);
        }
        assert!(!profiler.hook_done());
        assert_eq!(profiler.format_report().unwrap(), "");
    }

    #[test]
    fn test_invalid_model_fails_start_once() {
        let unnamed = Probe::node("", vec![Probe::leaf("Conv2d")]);
        let mut profiler = quiet(Arc::new(unnamed), true);
        assert!(matches!(profiler.start(), Err(Error::InvalidModel(_))));
        assert!(!profiler.is_profiling());
        assert!(profiler.start().is_ok());
        assert_eq!(profiler.layer_num(), 0);
    }

    #[test]
    fn test_leaf_root_reports_nothing() {
        let model: Arc<dyn Module> = Arc::new(Probe::leaf("Linear"));
        let mut profiler = quiet(Arc::clone(&model), true);
        profiler.start().unwrap();
        assert_eq!(profiler.layer_num(), 0);
        assert_eq!(model.hooks().len(), 0);
        step(model.as_ref(), true);
        assert!(profiler.records(Phase::Forward).is_empty());
        assert_eq!(profiler.format_report().unwrap(), "");
    }

    #[test]
    fn test_handle_stops_on_drop() {
        let model = model();
        let handle = scoped_profiling(Arc::clone(&model), "h", true).unwrap();
        assert!(handle.is_profiling());
        let shared = Arc::clone(&handle.shared);
        drop(handle);
        assert!(!shared.profiling_on.load(Ordering::SeqCst));

        let mut handle = scoped_profiling(model, "h", true).unwrap();
        handle.stop();
        assert!(!handle.is_profiling());
        assert_eq!(handle.layer_num(), 3);
    }
}
