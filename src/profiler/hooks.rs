// Hook recorder
// The per-leaf callbacks that emit diagnostics and append timing records

use std::fmt::{self, Write as FmtWrite};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::debug;
use serde::{Deserialize, Serialize};

use super::record::{EventRecord, Phase, RecordLog};
use super::walker::QualifiedName;
use crate::module::Module;
use crate::tensor::{Parameter, Tensor};

/// Where hook diagnostics are written
pub enum DiagnosticSink {
    Stdout,
    Writer(Mutex<Box<dyn Write + Send>>),
    Discard,
}

impl fmt::Debug for DiagnosticSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticSink::Stdout => f.write_str("Stdout"),
            DiagnosticSink::Writer(_) => f.write_str("Writer"),
            DiagnosticSink::Discard => f.write_str("Discard"),
        }
    }
}

impl DiagnosticSink {
    pub fn writer(writer: impl Write + Send + 'static) -> Self {
        DiagnosticSink::Writer(Mutex::new(Box::new(writer)))
    }

    /// Write one block of text; failures are logged and dropped
    pub fn emit(&self, text: &str) {
        let result = match self {
            DiagnosticSink::Stdout => {
                let stdout = io::stdout();
                let mut lock = stdout.lock();
                lock.write_all(text.as_bytes())
            }
            DiagnosticSink::Writer(writer) => match writer.lock() {
                Ok(mut writer) => writer.write_all(text.as_bytes()).and_then(|_| writer.flush()),
                Err(_) => Err(io::Error::new(io::ErrorKind::Other, "diagnostic writer poisoned")),
            },
            DiagnosticSink::Discard => Ok(()),
        };
        if let Err(e) = result {
            debug!("dropped profiler diagnostic: {}", e);
        }
    }
}

/// What the hooks print
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderOptions {
    /// Print tensor values after each dtype/shape line of the forward block
    pub emit_values: bool,
    /// Print the inputs again in place of the outputs
    pub mirror_inputs_as_output: bool,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            emit_values: true,
            mirror_inputs_as_output: false,
        }
    }
}

/// State shared between a profiler and all of its recorders
#[derive(Debug)]
pub(crate) struct ProfilerShared {
    pub(crate) pid: String,
    pub(crate) profiling_on: AtomicBool,
    pub(crate) records: RecordLog,
    pub(crate) sink: DiagnosticSink,
    pub(crate) options: RecorderOptions,
    epoch: Instant,
}

impl ProfilerShared {
    pub(crate) fn new(pid: String, sink: DiagnosticSink, options: RecorderOptions) -> Self {
        Self {
            pid,
            profiling_on: AtomicBool::new(false),
            records: RecordLog::new(),
            sink,
            options,
            epoch: Instant::now(),
        }
    }

    fn millis(&self, at: Instant) -> f64 {
        at.saturating_duration_since(self.epoch).as_secs_f64() * 1000.0
    }
}

/// Callbacks for one instrumented leaf
pub struct HookRecorder {
    name: QualifiedName,
    shared: Weak<ProfilerShared>,
    forward_started: Mutex<Option<Instant>>,
    backward_started: Mutex<Option<Instant>>,
}

impl HookRecorder {
    pub(crate) fn new(name: QualifiedName, shared: &Arc<ProfilerShared>) -> Arc<Self> {
        Arc::new(Self {
            name,
            shared: Arc::downgrade(shared),
            forward_started: Mutex::new(None),
            backward_started: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &QualifiedName {
        &self.name
    }

    /// Register the four callbacks on `module`
    pub(crate) fn attach(self: &Arc<Self>, module: &dyn Module) {
        let hooks = module.hooks();

        let recorder = Arc::clone(self);
        hooks.register_forward_pre_hook(move |_, _| recorder.mark_start(Phase::Forward));

        let recorder = Arc::clone(self);
        hooks.register_forward_hook(move |module, inputs, output| {
            recorder.on_forward_completed(module, inputs, output)
        });

        let recorder = Arc::clone(self);
        hooks.register_backward_pre_hook(move |_, _| recorder.mark_start(Phase::Backward));

        let recorder = Arc::clone(self);
        hooks.register_backward_hook(move |module, grad_inputs, grad_outputs| {
            recorder.on_backward_completed(module, grad_inputs, grad_outputs)
        });
    }

    /// Shared state, if the profiler is alive and recording
    fn active(&self) -> Option<Arc<ProfilerShared>> {
        self.shared
            .upgrade()
            .filter(|shared| shared.profiling_on.load(Ordering::SeqCst))
    }

    fn start_slot(&self, phase: Phase) -> &Mutex<Option<Instant>> {
        match phase {
            Phase::Forward => &self.forward_started,
            Phase::Backward => &self.backward_started,
        }
    }

    fn mark_start(&self, phase: Phase) {
        if self.active().is_none() {
            return;
        }
        if let Ok(mut slot) = self.start_slot(phase).lock() {
            *slot = Some(Instant::now());
        }
    }

    fn take_start(&self, phase: Phase) -> Option<Instant> {
        self.start_slot(phase).lock().ok().and_then(|mut slot| slot.take())
    }

    fn finish(&self, shared: &ProfilerShared, phase: Phase, end: Instant, text: &str) {
        let start = self.take_start(phase).unwrap_or(end);
        shared.sink.emit(text);
        shared.records.append(
            phase,
            EventRecord::new(self.name.as_str(), shared.millis(start), shared.millis(end)),
        );
    }

    pub fn on_forward_completed(&self, module: &dyn Module, inputs: &[&Tensor], output: &Tensor) {
        let Some(shared) = self.active() else {
            return;
        };
        let end = Instant::now();
        let text =
            format_forward(&self.name, &shared.pid, module, inputs, output, &shared.options);
        self.finish(&shared, Phase::Forward, end, &text);
    }

    pub fn on_backward_completed(
        &self,
        module: &dyn Module,
        grad_inputs: &[&Tensor],
        grad_outputs: &[&Tensor],
    ) {
        let Some(shared) = self.active() else {
            return;
        };
        let end = Instant::now();
        let text = format_backward(
            &self.name,
            &shared.pid,
            module,
            grad_inputs,
            grad_outputs,
            &shared.options,
        );
        self.finish(&shared, Phase::Backward, end, &text);
    }
}

fn describe(param: Option<&Parameter>) -> String {
    match param {
        Some(p) => p.descriptor().to_string(),
        None => "none []".to_string(),
    }
}

fn write_tensors(text: &mut String, pid: &str, tensors: &[&Tensor], values: bool) {
    for (i, tensor) in tensors.iter().enumerate() {
        let _ = writeln!(text, "    [{}] {} {}", pid, i, tensor.descriptor());
        if values {
            let _ = writeln!(text, "    [{}] {} {}", pid, i, tensor.data);
        }
    }
}

/// Diagnostic block for one forward completion
pub fn format_forward(
    name: &QualifiedName,
    pid: &str,
    module: &dyn Module,
    inputs: &[&Tensor],
    output: &Tensor,
    options: &RecorderOptions,
) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "forward: {}", name);
    for (param_name, param) in module.parameters() {
        let d = param.descriptor();
        let _ = writeln!(
            text,
            "  [{}] {}: {} {:?} {}",
            pid, param_name, d.data_type, d.shape, d.requires_grad
        );
    }
    let _ = writeln!(text, "  [{}] input:", pid);
    write_tensors(&mut text, pid, inputs, options.emit_values);
    let _ = writeln!(text, "  [{}] output:", pid);
    if options.mirror_inputs_as_output {
        write_tensors(&mut text, pid, inputs, options.emit_values);
    } else {
        write_tensors(&mut text, pid, &[output], options.emit_values);
    }
    text
}

/// Diagnostic block for one backward completion; dtype and shape only
pub fn format_backward(
    name: &QualifiedName,
    pid: &str,
    module: &dyn Module,
    grad_inputs: &[&Tensor],
    grad_outputs: &[&Tensor],
    options: &RecorderOptions,
) -> String {
    let mut text = String::new();
    let _ = writeln!(
        text,
        "backward: {} {} {}",
        name,
        describe(module.weight()),
        describe(module.bias())
    );
    let _ = writeln!(text, "  [{}] input:", pid);
    write_tensors(&mut text, pid, grad_inputs, false);
    let _ = writeln!(text, "  [{}] output:", pid);
    let outputs = if options.mirror_inputs_as_output { grad_inputs } else { grad_outputs };
    write_tensors(&mut text, pid, outputs, false);
    text
}
