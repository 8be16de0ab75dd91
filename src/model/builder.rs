use std::panic::{catch_unwind, UnwindSafe};

use anyhow::Result;
use candle_core::{utils, DType, Device, Tensor};
use candle_nn::{Init, VarBuilder};
use tracing::{debug, warn};

use crate::config::{DeviceKind, Precision};
use crate::model::attention::{Attention, Block, FeedForward};
use crate::model::llama::{ModelArgs, Transformer};
use crate::model::rope::RoPE;

const INIT_STD: f64 = 0.02;

/// Builds a [`Transformer`] whose parameters live in `vb`.
///
/// With a `VarMap`-backed builder the parameters are created with the initialisation below;
/// loading a checkpoint into the same `VarMap` afterwards overwrites them.
pub fn build_transformer(
    vb: VarBuilder,
    args: &ModelArgs,
    compute_dtype: DType,
) -> Result<Transformer> {
    args.validate()?;
    let tok_embeddings = vb.get_with_hints(
        (args.vocab_size, args.dim),
        "tok_embeddings.weight",
        normal(INIT_STD),
    )?;

    let mut layers = Vec::with_capacity(args.n_layers);
    for idx in 0..args.n_layers {
        layers.push(load_block(vb.pp(format!("layers.{idx}")), args)?);
    }
    let mut mtp_heads = Vec::with_capacity(args.n_future - 1);
    for idx in 0..args.n_future - 1 {
        mtp_heads.push(load_block(vb.pp(format!("mtp_heads.{idx}")), args)?);
    }
    let norm = vb.get_with_hints(args.dim, "norm.weight", Init::Const(1.0))?;

    let rope = RoPE::new(tok_embeddings.device(), args.max_seq_len, args.head_dim())?;
    debug!(
        layers = layers.len(),
        mtp_heads = mtp_heads.len(),
        ?compute_dtype,
        "built transformer"
    );
    Ok(Transformer::new(
        args.clone(),
        tok_embeddings,
        layers,
        mtp_heads,
        norm,
        rope,
        compute_dtype,
    ))
}

pub(crate) fn load_block(vb: VarBuilder, args: &ModelArgs) -> Result<Block> {
    // residual projections get a depth-scaled init
    let residual_std = INIT_STD / (2.0 * args.n_layers as f64).sqrt();
    let head_dim = args.head_dim();
    let hidden = args.ffn_hidden_dim();

    let attn_vb = vb.pp("attention");
    let wq = weight(&attn_vb, "wq", args.n_heads * head_dim, args.dim, INIT_STD)?;
    let wk = weight(&attn_vb, "wk", args.n_kv_heads * head_dim, args.dim, INIT_STD)?;
    let wv = weight(&attn_vb, "wv", args.n_kv_heads * head_dim, args.dim, INIT_STD)?;
    let wo = weight(&attn_vb, "wo", args.dim, args.n_heads * head_dim, residual_std)?;
    let attention = Attention::new(wq, wk, wv, wo, args);

    let ffn_vb = vb.pp("feed_forward");
    let w1 = weight(&ffn_vb, "w1", hidden, args.dim, INIT_STD)?;
    let w2 = weight(&ffn_vb, "w2", args.dim, hidden, INIT_STD)?;
    let w3 = weight(&ffn_vb, "w3", hidden, args.dim, residual_std)?;
    let feed_forward = FeedForward::new(w1, w2, w3, args.dropout);

    let attention_norm = vb.get_with_hints(args.dim, "attention_norm.weight", Init::Const(1.0))?;
    let ffn_norm = vb.get_with_hints(args.dim, "ffn_norm.weight", Init::Const(1.0))?;
    Ok(Block::new(
        attention,
        feed_forward,
        attention_norm,
        ffn_norm,
        args.norm_eps,
    ))
}

fn weight(vb: &VarBuilder, name: &str, out_dim: usize, in_dim: usize, std: f64) -> Result<Tensor> {
    Ok(vb.pp(name).get_with_hints((out_dim, in_dim), "weight", normal(std))?)
}

fn normal(stdev: f64) -> Init {
    Init::Randn { mean: 0.0, stdev }
}

pub fn pick_device(kind: DeviceKind) -> Result<Device> {
    match kind {
        DeviceKind::Cpu => Ok(Device::Cpu),
        DeviceKind::Cuda(ordinal) => Ok(Device::new_cuda(ordinal)?),
        DeviceKind::Metal => Ok(Device::new_metal(0)?),
        DeviceKind::Auto => {
            if utils::cuda_is_available() {
                // Try CUDA, fall back to CPU if unavailable/unusable.
                if let Some(device) = safe_try_device(|| Device::new_cuda(0)) {
                    return Ok(device);
                }
            }
            if utils::metal_is_available() {
                // Candle Metal initialization may panic on misconfigured environments.
                if let Some(device) = safe_try_device(|| Device::new_metal(0)) {
                    return Ok(device);
                }
            }
            Ok(Device::Cpu)
        }
    }
}

/// Activation dtype for `precision` on `device`; bf16 falls back to f32 where the backend
/// has no bf16 matmul.
pub fn compute_dtype_for(precision: Precision, device: &Device) -> DType {
    let dtype = precision.compute_dtype();
    if dtype == DType::BF16 && !device.supports_bf16() {
        warn!(?device, "bf16 is not supported on this device, computing in f32");
        return DType::F32;
    }
    dtype
}

/// Seeds the device RNG used for parameter init and dropout, where the backend allows it.
pub fn seed_device(device: &Device, seed: u64) {
    if let Err(err) = device.set_seed(seed) {
        warn!(%err, "device rng cannot be seeded; initialisation is not reproducible");
    }
}

fn safe_try_device<F>(f: F) -> Option<Device>
where
    F: FnOnce() -> candle_core::Result<Device> + UnwindSafe,
{
    match catch_unwind(f) {
        Ok(Ok(device)) => Some(device),
        Ok(Err(_)) | Err(_) => None,
    }
}
