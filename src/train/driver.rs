// Training and evaluation loops

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::checkpoint::{
    load_checkpoint, load_state_dict, save_checkpoint, state_dict, Checkpoint, CHECKPOINT_FILE,
};
use super::config::TrainConfig;
use super::data::{DataLoader, Split, SyntheticImageDataset};
use super::loss::{Criterion, CrossEntropyLoss};
use super::meter::{accuracy, AverageMeter};
use super::optim::{Optimizer, Sgd};
use super::schedule::adjust_learning_rate;
use crate::autograd::Tape;
use crate::error::Result;
use crate::module::{invoke, set_training, Module};
use crate::nn::{DataParallel, PeleeNet};
use crate::profiler::{write_profile, DiagnosticSink, ExportFormat, Profiler, ProfilerScope};
use crate::tensor::Tensor;

/// What `validate` does with each batch's forward pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileMode {
    /// Time repeated forward passes
    None,
    /// Record layers and print the report
    Stdio,
    /// Record layers and write a Chrome trace named after the mode
    Trace(String),
}

impl From<&str> for ProfileMode {
    fn from(value: &str) -> Self {
        match value {
            "" | "none" => ProfileMode::None,
            "stdio" => ProfileMode::Stdio,
            name => ProfileMode::Trace(name.to_string()),
        }
    }
}

impl fmt::Display for ProfileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileMode::None => f.write_str("none"),
            ProfileMode::Stdio => f.write_str("stdio"),
            ProfileMode::Trace(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub loss: f64,
    pub acc1: f64,
    pub acc5: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationStats {
    pub loss: f64,
    pub acc1: f64,
    pub acc5: f64,
    /// Mean seconds per timed forward pass
    pub forward_time: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub best_acc1: f64,
    pub last: Option<ValidationStats>,
    pub epochs_run: usize,
    /// Leaves instrumented by the run-level profiler (0 when not tracing)
    pub traced_layers: usize,
}

/// Build the network named by `config.arch` with `num_classes` outputs
pub fn build_model(
    config: &TrainConfig,
    num_classes: usize,
    rng: &mut StdRng,
) -> Result<Arc<dyn Module>> {
    let mut model_config = config.model.clone();
    model_config.num_classes = num_classes;
    if config.arch == "peleenet" {
        info!("=> creating model '{}'", config.arch);
    } else {
        warn!("=> unsupported model '{}'. creating PeleeNet by default.", config.arch);
    }
    let model = PeleeNet::new(&model_config, rng)?;
    if config.distributed() {
        info!("=> wrapping model for {} processes", config.world_size);
        return Ok(Arc::new(DataParallel::new(Box::new(model))));
    }
    Ok(Arc::new(model))
}

/// Start a profiler scope, degrading to no profiling when the model cannot
/// be instrumented
fn enter_profiling(profiler: &mut Profiler) -> Option<ProfilerScope<'_>> {
    match profiler.scope() {
        Ok(scope) => Some(scope),
        Err(e) => {
            warn!("layer profiling disabled: {}", e);
            None
        }
    }
}

pub fn train_epoch(
    loader: &dyn DataLoader,
    model: &dyn Module,
    criterion: &dyn Criterion,
    optimizer: &mut dyn Optimizer,
    epoch: usize,
    config: &TrainConfig,
) -> Result<EpochStats> {
    let mut batch_time = AverageMeter::new();
    let mut data_time = AverageMeter::new();
    let mut losses = AverageMeter::new();
    let mut top1 = AverageMeter::new();
    let mut top5 = AverageMeter::new();

    set_training(model, true);

    let batches = loader.len();
    let mut end = Instant::now();
    for i in 0..batches {
        adjust_learning_rate(
            optimizer,
            config.lr_policy,
            config.lr,
            epoch,
            config.epochs,
            i,
            batches,
        );

        let batch = loader.batch(i)?;
        data_time.update(end.elapsed().as_secs_f64(), 1);
        let n = batch.len();

        let mut tape = Tape::new();
        let input = tape.input(batch.input);
        let output = invoke(model, &input, &mut tape)?;
        let loss = criterion.forward(output.tensor(), &batch.target)?;

        let acc = accuracy(output.tensor(), &batch.target, &[1, 5])?;
        losses.update(loss.loss, n);
        top1.update(acc[0], n);
        top5.update(acc[1], n);

        optimizer.zero_grad(model);
        tape.backward(&output, loss.grad.data)?;
        optimizer.step(model)?;

        batch_time.update(end.elapsed().as_secs_f64(), 1);
        end = Instant::now();

        if i % config.print_freq == 0 {
            info!(
                "Epoch: [{}][{}/{}]\tTime {:.3} ({:.3})\tData {:.3} ({:.3})\tLoss {:.4} ({:.4})\tAcc@1 {:.3} ({:.3})\tAcc@5 {:.3} ({:.3})",
                epoch,
                i,
                batches,
                batch_time.val,
                batch_time.avg,
                data_time.val,
                data_time.avg,
                losses.val,
                losses.avg,
                top1.val,
                top1.avg,
                top5.val,
                top5.avg
            );
        }
    }

    Ok(EpochStats {
        loss: losses.avg,
        acc1: top1.avg,
        acc5: top5.avg,
    })
}

fn forward_no_grad(model: &dyn Module, input: &Tensor) -> Result<Tensor> {
    let mut tape = Tape::no_grad();
    let x = tape.input(input.clone());
    let output = invoke(model, &x, &mut tape)?;
    Ok(output.tensor().clone())
}

/// Evaluate `model` on every batch of `loader` without gradients
pub fn validate(
    loader: &dyn DataLoader,
    model: &Arc<dyn Module>,
    criterion: &dyn Criterion,
    config: &TrainConfig,
    profile: &ProfileMode,
    pid: u32,
) -> Result<ValidationStats> {
    let mut batch_time = AverageMeter::new();
    let mut losses = AverageMeter::new();
    let mut top1 = AverageMeter::new();
    let mut top5 = AverageMeter::new();
    let mut forward_time = AverageMeter::new();

    set_training(model.as_ref(), false);

    let mut profiler = match profile {
        ProfileMode::None => None,
        ProfileMode::Stdio => Some(DiagnosticSink::Stdout),
        ProfileMode::Trace(_) => Some(DiagnosticSink::Discard),
    }
    .map(|sink| {
        Profiler::with_options(Arc::clone(model), pid, true, config.profiler.clone(), sink)
    });

    for i in 0..loader.len() {
        let batch = loader.batch(i)?;
        let end = Instant::now();

        let output = match profiler.as_mut() {
            Some(profiler) => {
                let _scope = enter_profiling(profiler);
                let t0 = Instant::now();
                let output = forward_no_grad(model.as_ref(), &batch.input)?;
                forward_time.update(t0.elapsed().as_secs_f64(), 1);
                output
            }
            None => {
                let mut output = None;
                for run in 0..config.eval_runs {
                    let t0 = Instant::now();
                    output = Some(forward_no_grad(model.as_ref(), &batch.input)?);
                    if run >= config.eval_warmup {
                        forward_time.update(t0.elapsed().as_secs_f64(), 1);
                    }
                }
                match output {
                    Some(output) => output,
                    None => forward_no_grad(model.as_ref(), &batch.input)?,
                }
            }
        };
        batch_time.update(end.elapsed().as_secs_f64(), 1);

        let n = batch.len();
        let loss = criterion.forward(&output, &batch.target)?;
        let acc = accuracy(&output, &batch.target, &[1, 5])?;
        losses.update(loss.loss, n);
        top1.update(acc[0], n);
        top5.update(acc[1], n);
    }

    if let Some(profiler) = &profiler {
        match profile {
            ProfileMode::Stdio => emit_report(profiler, &DiagnosticSink::Stdout),
            ProfileMode::Trace(name) => {
                let path = config.logs_dir.join(format!("{}.json", name));
                write_profile(&profiler.snapshot(), ExportFormat::ChromeTrace, &path)?;
                info!("=> wrote layer trace '{}'", path.display());
            }
            ProfileMode::None => {}
        }
    }

    info!(
        "time: {:.3}s, Acc1: {:.3}, Acc5: {:.3}",
        forward_time.avg, top1.avg, top5.avg
    );

    Ok(ValidationStats {
        loss: losses.avg,
        acc1: top1.avg,
        acc5: top5.avg,
        forward_time: forward_time.avg,
    })
}

/// Print the run-level layer report, if one was recorded
fn report_layer_trace(profiler: &Profiler) {
    if !profiler.hook_done() {
        return;
    }
    emit_report(profiler, &DiagnosticSink::Stdout);
}

fn emit_report(profiler: &Profiler, sink: &DiagnosticSink) {
    match profiler.format_report() {
        Ok(report) => sink.emit(&format!("{}\n", report)),
        Err(e) => warn!("layer report unavailable: {}", e),
    }
}

fn synthetic_loader(config: &TrainConfig, split: Split) -> Result<SyntheticImageDataset> {
    SyntheticImageDataset::new(&config.dataset, split, config.input_dim, config.batch_size)
}

/// Full run: build, optionally restore, then evaluate or train
pub fn run(config: &TrainConfig) -> Result<RunSummary> {
    config.validate()?;
    info!("args: {:?}", config);
    let pid = std::process::id();
    let mut rng = StdRng::seed_from_u64(config.seed);

    let val_loader = synthetic_loader(config, Split::Val)?;
    info!("Total classes: {}", val_loader.num_classes());
    info!("data: '{}' ({} loader workers requested)", config.data, config.workers);

    let model = build_model(config, val_loader.num_classes(), &mut rng)?;
    let criterion = CrossEntropyLoss::new();
    let mut optimizer = Sgd::new(config.lr, config.momentum, config.weight_decay);

    let mut start_epoch = config.start_epoch;
    let mut best_acc1 = 0.0f64;

    if let Some(resume) = &config.resume {
        if resume.is_file() {
            info!("=> loading checkpoint '{}'", resume.display());
            let checkpoint = load_checkpoint(resume)?;
            start_epoch = checkpoint.epoch;
            best_acc1 = checkpoint.best_acc1;
            load_state_dict(model.as_ref(), &checkpoint.state_dict)?;
            optimizer.load_state(checkpoint.optimizer)?;
            info!("=> loaded checkpoint '{}' (epoch {})", resume.display(), checkpoint.epoch);
        } else {
            warn!("=> no checkpoint found at '{}'", resume.display());
        }
    } else if config.pretrained {
        let path = config.checkpoint_dir.join(CHECKPOINT_FILE);
        if path.is_file() {
            let checkpoint = load_checkpoint(&path)?;
            load_state_dict(model.as_ref(), &checkpoint.state_dict)?;
            info!(
                "=> loaded checkpoint '{}' (epoch {}, acc@1 {})",
                path.display(),
                checkpoint.epoch,
                checkpoint.best_acc1
            );
        } else {
            warn!("=> no checkpoint found at '{}'", path.display());
        }
    }

    let mut profiler = Profiler::with_options(
        Arc::clone(&model),
        pid,
        config.trace_layers,
        config.profiler.clone(),
        DiagnosticSink::Stdout,
    );

    if config.evaluate {
        let stats = {
            let _scope = enter_profiling(&mut profiler);
            info!("main validation");
            let mode = ProfileMode::from(config.profile.as_str());
            validate(&val_loader, &model, &criterion, config, &mode, pid)?
        };
        report_layer_trace(&profiler);
        return Ok(RunSummary {
            best_acc1: best_acc1.max(stats.acc1),
            last: Some(stats),
            epochs_run: 0,
            traced_layers: profiler.layer_num(),
        });
    }

    let train_loader = synthetic_loader(config, Split::Train)?;

    let mut last = None;
    let mut epochs_run = 0;
    for epoch in start_epoch..config.epochs {
        {
            let _scope = enter_profiling(&mut profiler);
            train_epoch(&train_loader, model.as_ref(), &criterion, &mut optimizer, epoch, config)?;
        }

        let stats = validate(&val_loader, &model, &criterion, config, &ProfileMode::None, pid)?;

        let is_best = stats.acc1 > best_acc1;
        best_acc1 = best_acc1.max(stats.acc1);
        save_checkpoint(
            &Checkpoint {
                epoch: epoch + 1,
                arch: config.arch.clone(),
                state_dict: state_dict(model.as_ref()),
                best_acc1,
                optimizer: optimizer.state(),
            },
            is_best,
            &config.checkpoint_dir,
        )?;
        last = Some(stats);
        epochs_run += 1;
    }

    report_layer_trace(&profiler);
    Ok(RunSummary {
        best_acc1,
        last,
        epochs_run,
        traced_layers: profiler.layer_num(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_mode_from_config() {
        assert_eq!(ProfileMode::from("none"), ProfileMode::None);
        assert_eq!(ProfileMode::from("stdio"), ProfileMode::Stdio);
        assert_eq!(ProfileMode::from("run1"), ProfileMode::Trace("run1".to_string()));
        assert_eq!(ProfileMode::from("run1").to_string(), "run1");
    }

    #[test]
    fn test_build_model_wraps_for_world_size() {
        let mut config = TrainConfig::tiny();
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(build_model(&config, 4, &mut rng).unwrap().type_name(), "PeleeNet");
        config.world_size = 2;
        config.arch = "resnet".to_string();
        let model = build_model(&config, 4, &mut rng).unwrap();
        assert_eq!(model.type_name(), "DataParallel");
    }

    #[test]
    fn test_train_epoch_reduces_loss() {
        let mut config = TrainConfig::tiny();
        config.epochs = 4;
        let mut rng = StdRng::seed_from_u64(1);
        let model = build_model(&config, config.dataset.num_classes, &mut rng).unwrap();
        let loader = synthetic_loader(&config, Split::Train).unwrap();
        let criterion = CrossEntropyLoss::new();
        let mut optimizer = Sgd::new(config.lr, config.momentum, config.weight_decay);

        let first =
            train_epoch(&loader, model.as_ref(), &criterion, &mut optimizer, 0, &config).unwrap();
        let mut last = first;
        for epoch in 1..config.epochs {
            last = train_epoch(&loader, model.as_ref(), &criterion, &mut optimizer, epoch, &config)
                .unwrap();
        }
        assert!(last.loss < first.loss, "{} !< {}", last.loss, first.loss);
    }

    #[test]
    fn test_validate_times_only_after_warmup() {
        let config = TrainConfig::tiny();
        let mut rng = StdRng::seed_from_u64(2);
        let model = build_model(&config, config.dataset.num_classes, &mut rng).unwrap();
        let loader = synthetic_loader(&config, Split::Val).unwrap();
        let criterion = CrossEntropyLoss::new();
        let stats =
            validate(&loader, &model, &criterion, &config, &ProfileMode::None, 1).unwrap();
        assert!(stats.forward_time > 0.0);
        assert!((0.0..=100.0).contains(&stats.acc1));
        assert!(stats.acc5 >= stats.acc1);
    }

    #[derive(Clone, Default)]
    struct Shared(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Closed;

    impl std::io::Write for Closed {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdout closed"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_layer_report_goes_through_sink() {
        use crate::module::test_support::Probe;
        use crate::profiler::ProfilerOptions;
        use crate::tensor::DataType;

        let model: Arc<dyn Module> =
            Arc::new(Probe::node("PeleeNet", vec![Probe::leaf("Conv2d"), Probe::leaf("Linear")]));
        let mut profiler = Profiler::with_options(
            Arc::clone(&model),
            3,
            true,
            ProfilerOptions::default(),
            DiagnosticSink::Discard,
        );
        profiler.start().unwrap();
        let mut tape = Tape::new();
        let x = tape.input(Tensor::new(&[1, 2], DataType::Float32));
        invoke(model.as_ref(), &x, &mut tape).unwrap();
        profiler.stop();

        let buffer = Shared::default();
        emit_report(&profiler, &DiagnosticSink::writer(buffer.clone()));
        let text = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains(" Iteration 1 "));
        assert!(text.contains("([3] PeleeNet/Linear)"));
        assert!(text.ends_with("\n\n"));

        // a closed stream drops the report instead of panicking
        emit_report(&profiler, &DiagnosticSink::writer(Closed));
    }
}
