use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Module};
use serde::{Deserialize, Serialize};

use super::{attention::Block, rope::RoPE};
use crate::model::ops::{causal_mask, linear, maybe_dropout, rms_norm};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArgs {
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    /// Feed-forward width; derived from `dim` and `multiple_of` when unset.
    pub hidden_dim: Option<usize>,
    pub multiple_of: usize,
    pub norm_eps: f64,
    pub max_seq_len: usize,
    pub dropout: f32,

    /// Number of output heads, the primary next-token head included.
    pub n_future: usize,
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            dim: 4096,
            n_layers: 32,
            n_heads: 32,
            n_kv_heads: 32,
            vocab_size: 32000,
            hidden_dim: None,
            multiple_of: 256,
            norm_eps: 1e-5,
            max_seq_len: 2048,
            dropout: 0.0,
            n_future: 1,
        }
    }
}

impl ModelArgs {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.dim > 0, "dim must be > 0");
        ensure!(self.n_layers > 0, "model must have at least one layer");
        ensure!(self.n_heads > 0, "n_heads must be > 0");
        ensure!(self.n_kv_heads > 0, "n_kv_heads must be > 0");
        ensure!(self.vocab_size > 0, "vocab_size must be > 0");
        ensure!(self.max_seq_len > 0, "max_seq_len must be > 0");
        ensure!(self.multiple_of > 0, "multiple_of must be > 0");
        ensure!(self.hidden_dim != Some(0), "hidden_dim must be > 0 when set");
        ensure!(self.n_future > 0, "n_future must be >= 1 (the next-token head)");
        ensure!(
            self.dim % self.n_heads == 0,
            "dim ({}) must be divisible by n_heads ({})",
            self.dim,
            self.n_heads
        );
        ensure!(self.head_dim() % 2 == 0, "head_dim must be even");
        ensure!(
            self.n_heads % self.n_kv_heads == 0,
            "n_heads ({}) must be a multiple of n_kv_heads ({})",
            self.n_heads,
            self.n_kv_heads
        );
        ensure!(
            (0.0..1.0).contains(&self.dropout),
            "dropout must be in [0, 1), got {}",
            self.dropout
        );
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// SwiGLU width: two thirds of `4 * dim`, rounded up to `multiple_of`.
    pub fn ffn_hidden_dim(&self) -> usize {
        if let Some(hidden) = self.hidden_dim {
            return hidden;
        }
        let hidden = 2 * (4 * self.dim) / 3;
        self.multiple_of * hidden.div_ceil(self.multiple_of)
    }
}

/// Llama2-style decoder with a shared trunk and `n_future` output heads.
///
/// Head 0 predicts the next token from the trunk. Head `k >= 1` runs one extra block over
/// the trunk output and predicts the token `k + 1` positions ahead. All heads share the
/// final norm and the output projection, which is tied to the token embedding.
#[derive(Debug)]
pub struct Transformer {
    args: ModelArgs,
    tok_embeddings: Tensor,
    layers: Vec<Block>,
    mtp_heads: Vec<Block>,
    norm: Tensor,
    rope: RoPE,
    compute_dtype: DType,
}

impl Transformer {
    pub fn new(
        args: ModelArgs,
        tok_embeddings: Tensor,
        layers: Vec<Block>,
        mtp_heads: Vec<Block>,
        norm: Tensor,
        rope: RoPE,
        compute_dtype: DType,
    ) -> Self {
        Self {
            args,
            tok_embeddings,
            layers,
            mtp_heads,
            norm,
            rope,
            compute_dtype,
        }
    }

    pub fn args(&self) -> &ModelArgs {
        &self.args
    }

    pub fn n_heads_out(&self) -> usize {
        1 + self.mtp_heads.len()
    }

    /// Logits for every head, each `(B, T, vocab_size)`, ordered by prediction offset.
    pub fn forward(&self, tokens: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let (hidden, mask) = self.trunk(tokens, train)?;

        let mut logits = Vec::with_capacity(self.n_heads_out());
        logits.push(self.project(&hidden)?);
        for head in &self.mtp_heads {
            let h = head.forward(&hidden, &self.rope, &mask, train)?;
            logits.push(self.project(&h)?);
        }
        Ok(logits)
    }

    /// Next-token logits only, `(B, T, vocab_size)`.
    pub fn forward_primary(&self, tokens: &Tensor) -> Result<Tensor> {
        let (hidden, _) = self.trunk(tokens, false)?;
        self.project(&hidden)
    }

    fn trunk(&self, tokens: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (_batch, seq_len) = tokens.dims2()?;
        ensure!(seq_len > 0, "forward expects seq_len > 0");
        ensure!(
            seq_len <= self.args.max_seq_len,
            "sequence length {} exceeds max_seq_len {}",
            seq_len,
            self.args.max_seq_len
        );

        let embed = Embedding::new(self.tok_embeddings.clone(), self.args.dim);
        let h = embed.forward(tokens)?.to_dtype(self.compute_dtype)?;
        let mut h = maybe_dropout(&h, self.args.dropout, train)?;

        let mask = causal_mask(tokens.device(), seq_len)?.reshape((1, 1, seq_len, seq_len))?;
        for layer in &self.layers {
            h = layer.forward(&h, &self.rope, &mask, train)?;
        }
        Ok((h, mask))
    }

    fn project(&self, hidden: &Tensor) -> Result<Tensor> {
        let h = rms_norm(hidden, &self.norm, self.args.norm_eps)?;
        linear(&h, &self.tok_embeddings)
    }

    pub fn device(&self) -> &Device {
        self.tok_embeddings.device()
    }

    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }

    pub(crate) fn tok_embeddings(&self) -> &Tensor {
        &self.tok_embeddings
    }

    pub(crate) fn layers(&self) -> &[Block] {
        &self.layers
    }

    pub(crate) fn norm(&self) -> &Tensor {
        &self.norm
    }

    pub(crate) fn rope(&self) -> &RoPE {
        &self.rope
    }

    /// Parameter count; the tied embedding/output matrix is counted once.
    pub fn num_params(&self) -> usize {
        let blocks: usize = self
            .layers
            .iter()
            .chain(self.mtp_heads.iter())
            .flat_map(|b| b.parameters())
            .map(|t| t.elem_count())
            .sum();
        blocks + self.tok_embeddings.elem_count() + self.norm.elem_count()
    }

    /// Model FLOPs utilization relative to `promised_flops` (per second).
    ///
    /// Every token passes through the trunk and each auxiliary head block, so all of those
    /// count as layers.
    pub fn estimate_mfu(&self, fwdbwd_per_iter: usize, dt: f64, promised_flops: f64) -> f64 {
        let n = self.num_params() as f64;
        let l = (self.layers.len() + self.mtp_heads.len()) as f64;
        let h = self.args.n_heads as f64;
        let q = self.args.head_dim() as f64;
        let t = self.args.max_seq_len as f64;

        let flops_per_token = 6.0 * n + 12.0 * l * h * q * t;
        let flops_per_fwdbwd = flops_per_token * t;
        let flops_per_iter = flops_per_fwdbwd * fwdbwd_per_iter as f64;
        let flops_achieved = flops_per_iter / dt;
        flops_achieved / promised_flops
    }
}
