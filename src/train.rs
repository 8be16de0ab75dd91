use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::check_points::{self, CheckpointFiles, CheckpointMeta};
use crate::config::{InitFrom, TrainConfig};
use crate::data::{BatchIter, PretokDataset, Split};
use crate::export::export_model;
use crate::model::builder::{build_transformer, compute_dtype_for, pick_device, seed_device};
use crate::model::Transformer;
use crate::mtp::{mtp_loss, HeadWeights, MtpBatch, MtpLoss};
use crate::schedule::LrSchedule;
use crate::utils::format_count;

/// Seed of the batch order; training offsets it by the starting iteration.
const DATA_SEED: u64 = 42;
const INITIAL_BEST_VAL_LOSS: f32 = 1e9;
/// Local iterations before MFU is reported; the first ones include warmup costs.
const MFU_WARMUP_ITERS: usize = 5;
const EXPORT_FILE: &str = "model.bin";
const METRICS_FILE: &str = "metrics.jsonl";

#[derive(Debug, Clone)]
pub struct StepStats {
    pub iter: usize,
    /// Weighted multi-head loss, averaged over micro-steps.
    pub loss: f32,
    /// Next-token loss, averaged over micro-steps.
    pub primary_loss: f32,
    pub lr: f64,
    /// Global gradient norm before clipping.
    pub grad_norm: f32,
    pub dt: Duration,
    /// True when the update was dropped because of non-finite gradients.
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitLoss {
    pub total: f32,
    pub per_head: Vec<f32>,
}

impl SplitLoss {
    pub fn primary(&self) -> f32 {
        self.per_head[0]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalLosses {
    pub train: SplitLoss,
    pub val: SplitLoss,
}

/// Dynamic loss scale for f16 activations.
#[derive(Debug, Clone)]
struct GradScaler {
    scale: f64,
    good_steps: usize,
    growth_interval: usize,
}

impl GradScaler {
    fn new() -> Self {
        Self {
            scale: 65536.0,
            good_steps: 0,
            growth_interval: 2000,
        }
    }

    /// Returns whether the step should be applied.
    fn update(&mut self, grads_finite: bool) -> bool {
        if !grads_finite {
            self.scale *= 0.5;
            self.good_steps = 0;
            return false;
        }
        self.good_steps += 1;
        if self.good_steps == self.growth_interval {
            self.scale *= 2.0;
            self.good_steps = 0;
        }
        true
    }
}

/// Appends one JSON object per line.
struct MetricsLog {
    path: PathBuf,
}

impl MetricsLog {
    fn append(&self, record: &serde_json::Value) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(f, "{record}")?;
        Ok(())
    }
}

pub struct Trainer {
    config: TrainConfig,
    device: Device,
    varmap: VarMap,
    model: Transformer,
    vars: Vec<Var>,
    decay_opt: AdamW,
    no_decay_opt: AdamW,
    schedule: LrSchedule,
    head_weights: HeadWeights,
    scaler: Option<GradScaler>,
    train_data: Arc<PretokDataset>,
    val_data: Arc<PretokDataset>,
    train_batches: BatchIter,
    metrics: MetricsLog,
    iter_num: usize,
    local_iter_num: usize,
    best_val_loss: f32,
    running_mfu: Option<f64>,
}

impl Trainer {
    /// Opens the shards under `config.shard_dir()` and builds the trainer.
    pub fn new(config: TrainConfig) -> Result<Self> {
        let dir = config.shard_dir();
        let train = PretokDataset::open(&dir, Split::Train)?;
        let val = PretokDataset::open(&dir, Split::Val)?;
        Self::with_datasets(config, train, val)
    }

    pub fn with_datasets(
        config: TrainConfig,
        train: PretokDataset,
        val: PretokDataset,
    ) -> Result<Self> {
        config.validate()?;
        let device = pick_device(config.device)?;
        seed_device(&device, config.seed);
        info!(?device, precision = ?config.precision, "selected device");

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model_args = config.model_args();
        let compute_dtype = compute_dtype_for(config.precision, &device);
        let model = build_transformer(vb, &model_args, compute_dtype)?;

        let mut iter_num = 0;
        let mut best_val_loss = INITIAL_BEST_VAL_LOSS;
        if config.init_from == InitFrom::Resume {
            let meta = check_points::load_latest(&config.out_dir, &mut varmap)?;
            ensure!(
                meta.model_args == model_args,
                "checkpoint model args {:?} do not match the configured model {:?}",
                meta.model_args,
                model_args
            );
            iter_num = meta.iter_num;
            best_val_loss = meta.best_val_loss;
            info!(iter_num, best_val_loss, "resuming training");
        }

        let vars = varmap.all_vars();
        // matrices and embeddings decay, gains do not
        let (decay_vars, no_decay_vars): (Vec<Var>, Vec<Var>) =
            vars.iter().cloned().partition(|v| v.rank() >= 2);
        let count = |vs: &[Var]| vs.iter().map(|v| v.elem_count()).sum::<usize>();
        info!(
            decayed_tensors = decay_vars.len(),
            decayed_params = count(&decay_vars),
            non_decayed_tensors = no_decay_vars.len(),
            non_decayed_params = count(&no_decay_vars),
            "optimizer parameter groups"
        );
        let params = ParamsAdamW {
            lr: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: 1e-8,
            weight_decay: config.weight_decay,
        };
        let decay_opt = AdamW::new(decay_vars, params.clone())?;
        let no_decay_opt = AdamW::new(
            no_decay_vars,
            ParamsAdamW {
                weight_decay: 0.0,
                ..params
            },
        )?;

        let head_weights =
            HeadWeights::new(config.n_future, config.mtp_loss_weight, config.mtp_weighting)?;
        debug!(weights = ?head_weights.as_slice(), "mtp head weights");

        let train_data = Arc::new(train);
        let val_data = Arc::new(val);
        let train_batches = BatchIter::new(
            train_data.clone(),
            config.batch_size,
            config.max_seq_len,
            config.n_future,
            device.clone(),
            DATA_SEED + iter_num as u64,
        )?;

        fs::create_dir_all(&config.out_dir)
            .with_context(|| format!("failed to create {}", config.out_dir.display()))?;
        let metrics = MetricsLog {
            path: config.out_dir.join(METRICS_FILE),
        };
        let scaler = config.precision.needs_loss_scaling().then(GradScaler::new);

        Ok(Self {
            schedule: LrSchedule::from_config(&config),
            config,
            device,
            varmap,
            model,
            vars,
            decay_opt,
            no_decay_opt,
            head_weights,
            scaler,
            train_data,
            val_data,
            train_batches,
            metrics,
            iter_num,
            local_iter_num: 0,
            best_val_loss,
            running_mfu: None,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn model(&self) -> &Transformer {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn iter_num(&self) -> usize {
        self.iter_num
    }

    pub fn best_val_loss(&self) -> f32 {
        self.best_val_loss
    }

    fn loss_on(&self, batch: &MtpBatch, train: bool) -> Result<MtpLoss> {
        let logits = self.model.forward(&batch.inputs, train)?;
        mtp_loss(&logits, &batch.targets, &self.head_weights)
    }

    /// One optimizer update over `gradient_accumulation_steps` micro-batches.
    pub fn train_step(&mut self) -> Result<StepStats> {
        let iter = self.iter_num;
        let lr = self.schedule.lr(iter);
        self.decay_opt.set_learning_rate(lr);
        self.no_decay_opt.set_learning_rate(lr);

        let started = Instant::now();
        let accum = self.config.gradient_accumulation_steps;
        let loss_scale = self.scaler.as_ref().map_or(1.0, |s| s.scale);

        let mut summed: Vec<Option<Tensor>> = vec![None; self.vars.len()];
        let mut last_store: Option<GradStore> = None;
        let mut loss_sum = 0f64;
        let mut primary_sum = 0f64;
        for _ in 0..accum {
            let batch = self.train_batches.next_batch()?;
            let loss = self.loss_on(&batch, true)?;
            let scaled = (&loss.total * (loss_scale / accum as f64))?;
            let store = scaled.backward()?;
            for (slot, var) in summed.iter_mut().zip(&self.vars) {
                if let Some(g) = store.get(var.as_tensor()) {
                    *slot = Some(match slot.take() {
                        Some(prev) => (prev + g)?,
                        None => g.clone(),
                    });
                }
            }
            last_store = Some(store);
            loss_sum += loss.total.to_scalar::<f32>()? as f64;
            primary_sum += loss.primary().to_scalar::<f32>()? as f64;
        }

        // the last micro-step's store carries the summed, unscaled gradients
        let mut grads = last_store.context("gradient_accumulation_steps must be > 0")?;
        for (slot, var) in summed.into_iter().zip(&self.vars) {
            if let Some(g) = slot {
                grads.insert(var.as_tensor(), (g / loss_scale)?);
            }
        }

        let grad_norm = global_grad_norm(&grads, &self.vars)?;
        let skipped = match self.scaler.as_mut() {
            Some(scaler) => !scaler.update(grad_norm.is_finite()),
            None => {
                ensure!(grad_norm.is_finite(), "non-finite gradient norm at iter {iter}");
                false
            }
        };
        if skipped {
            warn!(iter, "non-finite gradients, skipping update and lowering the loss scale");
        } else {
            if self.config.grad_clip > 0.0 {
                clip_grads(&mut grads, &self.vars, grad_norm, self.config.grad_clip)?;
            }
            self.decay_opt.step(&grads)?;
            self.no_decay_opt.step(&grads)?;
        }

        self.iter_num += 1;
        Ok(StepStats {
            iter,
            loss: (loss_sum / accum as f64) as f32,
            primary_loss: (primary_sum / accum as f64) as f32,
            lr,
            grad_norm: grad_norm as f32,
            dt: started.elapsed(),
            skipped,
        })
    }

    /// Mean losses over `eval_iters` batches of each split.
    ///
    /// Every call draws the same batches, so successive evaluations are comparable.
    pub fn estimate_loss(&self) -> Result<EvalLosses> {
        Ok(EvalLosses {
            train: self.eval_split(&self.train_data)?,
            val: self.eval_split(&self.val_data)?,
        })
    }

    fn eval_split(&self, data: &Arc<PretokDataset>) -> Result<SplitLoss> {
        let mut batches = BatchIter::new(
            data.clone(),
            self.config.batch_size,
            self.config.max_seq_len,
            self.config.n_future,
            self.device.clone(),
            DATA_SEED,
        )?;
        let n = self.config.eval_iters;
        let mut total = 0f64;
        let mut per_head = vec![0f64; self.config.n_future];
        for _ in 0..n {
            let batch = batches.next_batch()?;
            let loss = self.loss_on(&batch, false)?;
            total += loss.total.to_scalar::<f32>()? as f64;
            for (acc, v) in per_head.iter_mut().zip(loss.per_head_values()?) {
                *acc += v as f64;
            }
        }
        Ok(SplitLoss {
            total: (total / n as f64) as f32,
            per_head: per_head.into_iter().map(|v| (v / n as f64) as f32).collect(),
        })
    }

    /// Saves weights and meta for the current iteration into `out_dir`.
    pub fn save_checkpoint(&self) -> Result<CheckpointFiles> {
        let meta = CheckpointMeta {
            model_args: self.model.args().clone(),
            iter_num: self.iter_num,
            best_val_loss: self.best_val_loss,
            config: self.config.clone(),
        };
        check_points::save_checkpoint(&self.config.out_dir, &self.varmap, &meta)
    }

    pub fn export(&self) -> Result<PathBuf> {
        let path = self.config.out_dir.join(EXPORT_FILE);
        export_model(&self.model, &path, self.config.export_version)?;
        Ok(path)
    }

    fn evaluate(&mut self) -> Result<EvalLosses> {
        let losses = self.estimate_loss()?;
        info!(
            iter = self.iter_num,
            train_loss = losses.train.total,
            val_loss = losses.val.total,
            val_next_token = losses.val.primary(),
            "eval"
        );
        debug!(train = ?losses.train.per_head, val = ?losses.val.per_head, "eval per head");
        self.metrics.append(&json!({
            "iter": self.iter_num,
            "lr": self.schedule.lr(self.iter_num),
            "train_loss": losses.train.total,
            "val_loss": losses.val.total,
            "train_per_head": losses.train.per_head,
            "val_per_head": losses.val.per_head,
        }))?;
        Ok(losses)
    }

    /// The training loop: periodic eval and checkpointing, stepping until `max_iters`.
    pub fn run(&mut self) -> Result<()> {
        info!(
            params = %format_count(self.model.num_params()),
            tokens_per_iter = self.config.tokens_per_iter(),
            n_future = self.config.n_future,
            start_iter = self.iter_num,
            "starting training"
        );
        if self.config.eval_only {
            self.evaluate()?;
            return Ok(());
        }

        loop {
            if self.iter_num % self.config.eval_interval == 0 {
                let losses = self.evaluate()?;
                let val = losses.val.primary();
                if val < self.best_val_loss || self.config.always_save_checkpoint {
                    self.best_val_loss = val;
                    if self.iter_num > 0 {
                        self.save_checkpoint()?;
                        self.export()?;
                    }
                }
            }

            let stats = self.train_step()?;
            if stats.iter % self.config.log_interval == 0 {
                if self.local_iter_num >= MFU_WARMUP_ITERS {
                    let mfu = self.model.estimate_mfu(
                        self.config.batch_size * self.config.gradient_accumulation_steps,
                        stats.dt.as_secs_f64(),
                        self.config.promised_flops,
                    );
                    self.running_mfu = Some(match self.running_mfu {
                        Some(prev) => 0.9 * prev + 0.1 * mfu,
                        None => mfu,
                    });
                }
                info!(
                    iter = stats.iter,
                    loss = format_args!("{:.4}", stats.loss),
                    next_token = format_args!("{:.4}", stats.primary_loss),
                    lr = format_args!("{:e}", stats.lr),
                    grad_norm = format_args!("{:.3}", stats.grad_norm),
                    ms = format_args!("{:.2}", stats.dt.as_secs_f64() * 1000.0),
                    mfu = format_args!("{:.2}%", self.running_mfu.unwrap_or(0.0) * 100.0),
                    "step"
                );
            }
            self.local_iter_num += 1;

            if self.iter_num > self.config.max_iters {
                break;
            }
        }
        Ok(())
    }
}

fn global_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut sq = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sq += g.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(sq.sqrt())
}

/// Rescales gradients so their global norm is at most `max_norm`.
fn clip_grads(grads: &mut GradStore, vars: &[Var], norm: f64, max_norm: f64) -> Result<()> {
    let coef = max_norm / (norm + 1e-6);
    if coef >= 1.0 {
        return Ok(());
    }
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), (g * coef)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceKind, Precision, VocabSource};
    use crate::data::Shard;
    use tempfile::tempdir;

    fn tiny_config(out_dir: PathBuf) -> TrainConfig {
        TrainConfig {
            out_dir,
            batch_size: 2,
            max_seq_len: 8,
            vocab_source: VocabSource::Custom,
            vocab_size: 16,
            dim: 16,
            n_layers: 1,
            n_heads: 2,
            n_kv_heads: 1,
            multiple_of: 8,
            n_future: 2,
            gradient_accumulation_steps: 2,
            learning_rate: 1e-2,
            max_iters: 4,
            warmup_iters: 1,
            eval_interval: 2,
            eval_iters: 2,
            device: DeviceKind::Cpu,
            ..TrainConfig::default()
        }
    }

    fn cyclic_dataset(len: usize) -> PretokDataset {
        let tokens: Vec<u16> = (0..len).map(|i| (i % 16) as u16).collect();
        PretokDataset::from_shards(vec![Shard::from_tokens("cyclic", tokens)])
    }

    #[test]
    fn grad_scaler_backs_off_and_grows() {
        let mut scaler = GradScaler {
            growth_interval: 2,
            ..GradScaler::new()
        };
        assert!(!scaler.update(false));
        assert_eq!(scaler.scale, 32768.0);
        assert!(scaler.update(true));
        assert!(scaler.update(true));
        assert_eq!(scaler.scale, 65536.0);
    }

    fn half_precision_trainer(precision: Precision) -> Result<(tempfile::TempDir, Trainer)> {
        let dir = tempdir()?;
        let config = TrainConfig {
            precision,
            ..tiny_config(dir.path().to_path_buf())
        };
        let trainer = Trainer::with_datasets(config, cyclic_dataset(200), cyclic_dataset(100))?;
        Ok((dir, trainer))
    }

    #[test]
    fn f16_steps_are_loss_scaled_and_finite() -> Result<()> {
        let (_dir, mut trainer) = half_precision_trainer(Precision::F16)?;
        assert_eq!(trainer.model().compute_dtype(), DType::F16);
        assert_eq!(trainer.scaler.as_ref().map(|s| s.scale), Some(65536.0));

        for _ in 0..3 {
            let stats = trainer.train_step()?;
            assert!(!stats.skipped);
            assert!(stats.loss.is_finite() && stats.primary_loss.is_finite());
            // gradients are unscaled before the norm is taken
            assert!(stats.grad_norm.is_finite() && stats.grad_norm < 1e3, "{stats:?}");
        }
        assert_eq!(trainer.scaler.as_ref().map(|s| s.good_steps), Some(3));
        let losses = trainer.estimate_loss()?;
        assert!(losses.val.total.is_finite() && losses.train.primary().is_finite());
        Ok(())
    }

    #[test]
    fn bf16_steps_are_finite_without_loss_scaling() -> Result<()> {
        let (_dir, mut trainer) = half_precision_trainer(Precision::Bf16)?;
        let expected = compute_dtype_for(Precision::Bf16, &Device::Cpu);
        assert_eq!(trainer.model().compute_dtype(), expected);
        assert!(trainer.scaler.is_none());

        let stats = trainer.train_step()?;
        assert!(!stats.skipped);
        assert!(stats.loss.is_finite() && stats.grad_norm.is_finite());
        assert!(trainer.estimate_loss()?.val.total.is_finite());
        Ok(())
    }

    #[test]
    fn f16_non_finite_gradients_skip_the_update() -> Result<()> {
        let (_dir, mut trainer) = half_precision_trainer(Precision::F16)?;
        let gain = trainer
            .vars
            .iter()
            .find(|v| v.rank() == 1)
            .cloned()
            .context("model has no norm gains")?;
        gain.set(&Tensor::full(f32::INFINITY, gain.shape(), &Device::Cpu)?)?;
        let untouched = trainer.vars.iter().find(|v| v.rank() == 2).cloned().unwrap();
        let before = untouched.flatten_all()?.to_vec1::<f32>()?;

        let stats = trainer.train_step()?;
        assert!(stats.skipped);
        assert!(!stats.grad_norm.is_finite());
        assert_eq!(trainer.scaler.as_ref().map(|s| s.scale), Some(32768.0));
        assert_eq!(trainer.iter_num(), 1);
        assert_eq!(untouched.flatten_all()?.to_vec1::<f32>()?, before);
        Ok(())
    }

    #[test]
    fn f32_non_finite_gradients_are_an_error() -> Result<()> {
        let dir = tempdir()?;
        let config = tiny_config(dir.path().to_path_buf());
        let mut trainer = Trainer::with_datasets(config, cyclic_dataset(200), cyclic_dataset(100))?;
        let gain = trainer.vars.iter().find(|v| v.rank() == 1).cloned().unwrap();
        gain.set(&Tensor::full(f32::INFINITY, gain.shape(), &Device::Cpu)?)?;
        assert!(trainer.train_step().is_err());
        Ok(())
    }

    #[test]
    fn clipping_bounds_global_norm() -> Result<()> {
        let device = Device::Cpu;
        let a = Var::from_tensor(&Tensor::new(&[3f32, 0.0], &device)?)?;
        let b = Var::from_tensor(&Tensor::new(&[0f32, 4.0], &device)?)?;
        let loss = (a.as_tensor().sum_all()? * 3.0)?.add(&(b.as_tensor().sum_all()? * 4.0)?)?;
        let mut grads = loss.backward()?;
        let vars = vec![a.clone(), b.clone()];

        let norm = global_grad_norm(&grads, &vars)?;
        // grads are [3, 3] and [4, 4]
        assert!((norm - 50f64.sqrt()).abs() < 1e-5);

        clip_grads(&mut grads, &vars, norm, 1.0)?;
        let clipped = global_grad_norm(&grads, &vars)?;
        assert!((clipped - 1.0).abs() < 1e-4, "clipped={clipped}");
        Ok(())
    }

    #[test]
    fn training_reduces_loss_on_a_repeating_stream() -> Result<()> {
        let dir = tempdir()?;
        let config = TrainConfig {
            max_iters: 30,
            learning_rate: 3e-2,
            decay_lr: false,
            ..tiny_config(dir.path().to_path_buf())
        };
        let mut trainer = Trainer::with_datasets(config, cyclic_dataset(400), cyclic_dataset(100))?;

        let before = trainer.estimate_loss()?.val.total;
        for _ in 0..30 {
            let stats = trainer.train_step()?;
            assert!(!stats.skipped);
            assert!(stats.grad_norm.is_finite());
        }
        let after = trainer.estimate_loss()?.val;
        assert!(after.total < before, "loss did not drop: {before} -> {}", after.total);
        assert_eq!(after.per_head.len(), 2);
        assert_eq!(trainer.iter_num(), 30);
        Ok(())
    }

    #[test]
    fn run_checkpoints_and_exports() -> Result<()> {
        let dir = tempdir()?;
        let config = TrainConfig {
            always_save_checkpoint: true,
            ..tiny_config(dir.path().to_path_buf())
        };
        let mut trainer = Trainer::with_datasets(config, cyclic_dataset(200), cyclic_dataset(100))?;
        trainer.run()?;

        // evals at 0, 2, 4; the loop stops once iter_num exceeds max_iters
        assert_eq!(trainer.iter_num(), 5);
        assert_eq!(check_points::find_last_step(dir.path()), Some(4));
        assert!(dir.path().join(EXPORT_FILE).exists());
        let metrics = fs::read_to_string(dir.path().join(METRICS_FILE))?;
        assert_eq!(metrics.lines().count(), 3);
        let first: serde_json::Value = serde_json::from_str(metrics.lines().next().unwrap())?;
        assert_eq!(first["iter"], 0);
        assert_eq!(first["val_per_head"].as_array().map(Vec::len), Some(2));
        Ok(())
    }

    #[test]
    fn resume_restores_weights_and_progress() -> Result<()> {
        let dir = tempdir()?;
        let config = tiny_config(dir.path().to_path_buf());
        let mut trainer =
            Trainer::with_datasets(config.clone(), cyclic_dataset(200), cyclic_dataset(100))?;
        trainer.train_step()?;
        trainer.train_step()?;
        trainer.save_checkpoint()?;
        let saved = trainer.model().tok_embeddings().flatten_all()?.to_vec1::<f32>()?;

        let resumed_config = TrainConfig {
            init_from: InitFrom::Resume,
            ..config
        };
        let resumed =
            Trainer::with_datasets(resumed_config, cyclic_dataset(200), cyclic_dataset(100))?;
        assert_eq!(resumed.iter_num(), 2);
        assert_eq!(resumed.best_val_loss(), INITIAL_BEST_VAL_LOSS);
        let loaded = resumed.model().tok_embeddings().flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(saved, loaded);
        Ok(())
    }

    #[test]
    fn resume_rejects_a_different_model() -> Result<()> {
        let dir = tempdir()?;
        let config = TrainConfig {
            always_save_checkpoint: true,
            ..tiny_config(dir.path().to_path_buf())
        };
        let mut trainer =
            Trainer::with_datasets(config.clone(), cyclic_dataset(200), cyclic_dataset(100))?;
        trainer.train_step()?;
        trainer.save_checkpoint()?;

        let other = TrainConfig {
            init_from: InitFrom::Resume,
            n_future: 3,
            ..config
        };
        assert!(Trainer::with_datasets(other, cyclic_dataset(200), cyclic_dataset(100)).is_err());
        Ok(())
    }

    #[test]
    fn eval_only_writes_one_record_and_no_checkpoint() -> Result<()> {
        let dir = tempdir()?;
        let config = TrainConfig {
            eval_only: true,
            ..tiny_config(dir.path().to_path_buf())
        };
        let mut trainer = Trainer::with_datasets(config, cyclic_dataset(200), cyclic_dataset(100))?;
        trainer.run()?;

        assert_eq!(trainer.iter_num(), 0);
        assert_eq!(check_points::find_last_step(dir.path()), None);
        let metrics = fs::read_to_string(dir.path().join(METRICS_FILE))?;
        assert_eq!(metrics.lines().count(), 1);
        Ok(())
    }
}
