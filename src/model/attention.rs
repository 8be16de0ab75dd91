use anyhow::{ensure, Result};
use candle_core::Tensor;

use crate::model::llama::ModelArgs;
use crate::model::ops::{linear, maybe_dropout, rms_norm, scaled_dot_product_attention};
use crate::model::rope::RoPE;

/// Pre-norm transformer block wiring attention and feed-forward sublayers.
#[derive(Debug)]
pub struct Block {
    pub(crate) attention: Attention,
    pub(crate) feed_forward: FeedForward,
    pub(crate) attention_norm: Tensor,
    pub(crate) ffn_norm: Tensor,
    norm_eps: f64,
}

impl Block {
    pub fn new(
        attention: Attention,
        feed_forward: FeedForward,
        attention_norm: Tensor,
        ffn_norm: Tensor,
        norm_eps: f64,
    ) -> Self {
        Self {
            attention,
            feed_forward,
            attention_norm,
            ffn_norm,
            norm_eps,
        }
    }

    pub fn forward(&self, x: &Tensor, rope: &RoPE, mask: &Tensor, train: bool) -> Result<Tensor> {
        let attn_input = rms_norm(x, &self.attention_norm, self.norm_eps)?;
        let attn_out = self.attention.forward(&attn_input, rope, mask, train)?;
        let residual = x.add(&attn_out)?;
        let ffn_input = rms_norm(&residual, &self.ffn_norm, self.norm_eps)?;
        let ffn_out = self.feed_forward.forward(&ffn_input, train)?;
        Ok(residual.add(&ffn_out)?)
    }

    pub(crate) fn parameters(&self) -> Vec<&Tensor> {
        vec![
            &self.attention.wq,
            &self.attention.wk,
            &self.attention.wv,
            &self.attention.wo,
            &self.feed_forward.w1,
            &self.feed_forward.w2,
            &self.feed_forward.w3,
            &self.attention_norm,
            &self.ffn_norm,
        ]
    }
}

/// Causal grouped-query self-attention.
#[derive(Debug)]
pub struct Attention {
    pub(crate) wq: Tensor,
    pub(crate) wk: Tensor,
    pub(crate) wv: Tensor,
    pub(crate) wo: Tensor,
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    kv_repeat: usize,
    dropout: f32,
}

impl Attention {
    pub fn new(wq: Tensor, wk: Tensor, wv: Tensor, wo: Tensor, args: &ModelArgs) -> Self {
        Self {
            wq,
            wk,
            wv,
            wo,
            n_heads: args.n_heads,
            n_kv_heads: args.n_kv_heads,
            head_dim: args.head_dim(),
            kv_repeat: args.n_heads / args.n_kv_heads,
            dropout: args.dropout,
        }
    }

    pub fn forward(&self, x: &Tensor, rope: &RoPE, mask: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        ensure!(seq_len > 0, "attention expects seq_len > 0");

        let q = linear(x, &self.wq)?.reshape((batch, seq_len, self.n_heads, self.head_dim))?;
        let k = linear(x, &self.wk)?.reshape((batch, seq_len, self.n_kv_heads, self.head_dim))?;
        let v = linear(x, &self.wv)?.reshape((batch, seq_len, self.n_kv_heads, self.head_dim))?;

        let q = rope.apply(&q)?;
        let k = rope.apply(&k)?;

        // (B, H, T, D); matmul kernels want contiguous inputs
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = self.repeat_kv(&k.transpose(1, 2)?.contiguous()?)?;
        let v = self.repeat_kv(&v.transpose(1, 2)?.contiguous()?)?;

        let attn_dropout = (train && self.dropout > 0.0).then_some(self.dropout);
        let context = scaled_dot_product_attention(&q, &k, &v, Some(mask), attn_dropout)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, self.n_heads * self.head_dim))?;

        let out = linear(&context, &self.wo)?;
        maybe_dropout(&out, self.dropout, train)
    }

    fn repeat_kv(&self, xs: &Tensor) -> Result<Tensor> {
        if self.kv_repeat == 1 {
            Ok(xs.clone())
        } else {
            let (batch, n_kv_heads, seq_len, head_dim) = xs.dims4()?;
            Ok(xs
                .unsqueeze(2)?
                .repeat((1, 1, self.kv_repeat, 1, 1))?
                .reshape((batch, n_kv_heads * self.kv_repeat, seq_len, head_dim))?)
        }
    }
}

/// SwiGLU feed-forward: `w2(silu(w1 x) * w3 x)`.
#[derive(Debug)]
pub struct FeedForward {
    pub(crate) w1: Tensor,
    pub(crate) w2: Tensor,
    pub(crate) w3: Tensor,
    dropout: f32,
}

impl FeedForward {
    pub fn new(w1: Tensor, w2: Tensor, w3: Tensor, dropout: f32) -> Self {
        Self {
            w1,
            w2,
            w3,
            dropout,
        }
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let gate = linear(x, &self.w1)?.silu()?;
        let up = linear(x, &self.w3)?;
        let out = linear(&(gate * up)?, &self.w2)?;
        maybe_dropout(&out, self.dropout, train)
    }
}
