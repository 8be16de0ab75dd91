use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, ensure, Context, Result};
use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::export::ExportVersion;
use crate::model::ModelArgs;
use crate::mtp::MtpWeighting;

/// Vocabulary size of the Llama 2 sentencepiece tokenizer.
pub const LLAMA2_VOCAB_SIZE: usize = 32000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InitFrom {
    #[default]
    Scratch,
    Resume,
}

/// Which tokenizer produced the shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VocabSource {
    #[default]
    Llama2,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal,
}

impl FromStr for DeviceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "metal" => Ok(Self::Metal),
            "cuda" => Ok(Self::Cuda(0)),
            other => match other.strip_prefix("cuda:") {
                Some(ordinal) => Ok(Self::Cuda(
                    ordinal
                        .parse()
                        .with_context(|| format!("bad cuda ordinal in {other:?}"))?,
                )),
                None => bail!(
                    "unknown device {other:?} (expected auto, cpu, metal, cuda or cuda:N)"
                ),
            },
        }
    }
}

/// Dtype of activations and matmuls; parameters and optimizer state stay in f32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    Bf16,
    F16,
}

impl Precision {
    pub fn compute_dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::Bf16 => DType::BF16,
            Self::F16 => DType::F16,
        }
    }

    /// f16 activations need loss scaling to keep small gradients representable.
    pub fn needs_loss_scaling(self) -> bool {
        self == Self::F16
    }
}

impl FromStr for Precision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "f32" | "float32" => Ok(Self::F32),
            "bf16" | "bfloat16" => Ok(Self::Bf16),
            "f16" | "float16" => Ok(Self::F16),
            other => bail!("unknown precision {other:?} (expected f32, bf16 or f16)"),
        }
    }
}

/// Every knob of a training run. Missing fields in a config file take the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    // I/O
    pub out_dir: PathBuf,
    pub data_dir: PathBuf,
    pub eval_interval: usize,
    pub log_interval: usize,
    pub eval_iters: usize,
    pub eval_only: bool,
    pub always_save_checkpoint: bool,
    pub init_from: InitFrom,

    // data
    pub batch_size: usize,
    pub max_seq_len: usize,
    pub vocab_source: VocabSource,
    pub vocab_size: usize,

    // model
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub multiple_of: usize,
    pub hidden_dim: Option<usize>,
    pub norm_eps: f64,
    pub dropout: f32,

    // multi-token prediction
    pub n_future: usize,
    pub mtp_loss_weight: f64,
    pub mtp_weighting: MtpWeighting,

    // AdamW
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub max_iters: usize,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub grad_clip: f64,

    // learning rate schedule
    pub decay_lr: bool,
    pub warmup_iters: usize,
    /// Defaults to `max_iters` when unset.
    pub lr_decay_iters: Option<usize>,
    pub min_lr: f64,

    // system
    pub device: DeviceKind,
    pub precision: Precision,
    pub seed: u64,
    pub export_version: ExportVersion,
    /// Peak FLOP/s of the accelerator, for MFU reporting.
    pub promised_flops: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("out"),
            data_dir: PathBuf::from("data"),
            eval_interval: 2000,
            log_interval: 1,
            eval_iters: 100,
            eval_only: false,
            always_save_checkpoint: false,
            init_from: InitFrom::Scratch,

            batch_size: 128,
            max_seq_len: 256,
            vocab_source: VocabSource::Llama2,
            vocab_size: LLAMA2_VOCAB_SIZE,

            dim: 288,
            n_layers: 6,
            n_heads: 6,
            n_kv_heads: 6,
            multiple_of: 32,
            hidden_dim: None,
            norm_eps: 1e-5,
            dropout: 0.0,

            n_future: 4,
            mtp_loss_weight: 1.0,
            mtp_weighting: MtpWeighting::Uniform,

            gradient_accumulation_steps: 4,
            learning_rate: 5e-4,
            max_iters: 100_000,
            weight_decay: 1e-1,
            beta1: 0.9,
            beta2: 0.95,
            grad_clip: 1.0,

            decay_lr: true,
            warmup_iters: 1000,
            lr_decay_iters: None,
            min_lr: 0.0,

            device: DeviceKind::Auto,
            precision: Precision::F32,
            seed: 1337,
            export_version: ExportVersion::V0,
            promised_flops: 312e12,
        }
    }
}

impl TrainConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write config {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.model_args().validate()?;
        ensure!(self.batch_size > 0, "batch_size must be > 0");
        ensure!(
            self.gradient_accumulation_steps > 0,
            "gradient_accumulation_steps must be > 0"
        );
        ensure!(self.eval_interval > 0, "eval_interval must be > 0");
        ensure!(self.log_interval > 0, "log_interval must be > 0");
        ensure!(self.eval_iters > 0, "eval_iters must be > 0");
        ensure!(
            self.mtp_loss_weight.is_finite() && self.mtp_loss_weight >= 0.0,
            "mtp_loss_weight must be finite and >= 0, got {}",
            self.mtp_loss_weight
        );
        if let MtpWeighting::Geometric { ratio } = self.mtp_weighting {
            ensure!(
                ratio > 0.0 && ratio <= 1.0,
                "geometric ratio must be in (0, 1], got {ratio}"
            );
        }
        if self.vocab_source == VocabSource::Llama2 {
            ensure!(
                self.vocab_size == LLAMA2_VOCAB_SIZE,
                "the llama2 vocabulary has {LLAMA2_VOCAB_SIZE} tokens, got vocab_size {}",
                self.vocab_size
            );
        }
        // shards store u16 token ids
        ensure!(
            self.vocab_size <= u16::MAX as usize + 1,
            "vocab_size {} does not fit u16 shards",
            self.vocab_size
        );
        ensure!(self.learning_rate > 0.0, "learning_rate must be > 0");
        ensure!(
            self.min_lr <= self.learning_rate,
            "min_lr ({}) must not exceed learning_rate ({})",
            self.min_lr,
            self.learning_rate
        );
        ensure!(
            self.lr_decay_iters() >= self.warmup_iters,
            "lr_decay_iters ({}) must be >= warmup_iters ({})",
            self.lr_decay_iters(),
            self.warmup_iters
        );
        ensure!(self.grad_clip >= 0.0, "grad_clip must be >= 0 (0 disables)");
        Ok(())
    }

    pub fn model_args(&self) -> ModelArgs {
        ModelArgs {
            dim: self.dim,
            n_layers: self.n_layers,
            n_heads: self.n_heads,
            n_kv_heads: self.n_kv_heads,
            vocab_size: self.vocab_size,
            hidden_dim: self.hidden_dim,
            multiple_of: self.multiple_of,
            norm_eps: self.norm_eps,
            max_seq_len: self.max_seq_len,
            dropout: self.dropout,
            n_future: self.n_future,
        }
    }

    pub fn lr_decay_iters(&self) -> usize {
        self.lr_decay_iters.unwrap_or(self.max_iters)
    }

    pub fn tokens_per_iter(&self) -> usize {
        self.gradient_accumulation_steps * self.batch_size * self.max_seq_len
    }

    /// Directory holding the `data*.bin` token shards.
    pub fn shard_dir(&self) -> PathBuf {
        match self.vocab_source {
            VocabSource::Llama2 => self.data_dir.join("TinyStories_all_data"),
            VocabSource::Custom => self.data_dir.join(format!("tok{}", self.vocab_size)),
        }
    }
}
