use anyhow::{ensure, Result};
use candle_core::{DType, Tensor, D};
use candle_nn::{Linear, Module};

/// RMSNorm with a learnable gain, computed in f32 and cast back to the input dtype.
///
/// Written with plain tensor ops so gradients flow through it; `candle_nn::ops::rms_norm`
/// has no backward pass.
pub fn rms_norm(x: &Tensor, weight: &Tensor, eps: f64) -> Result<Tensor> {
    let in_dtype = x.dtype();
    let x = x.to_dtype(DType::F32)?;
    let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;
    let normed = x.broadcast_div(&(mean_sq + eps)?.sqrt()?)?;
    let out = normed.broadcast_mul(&weight.to_dtype(DType::F32)?)?;
    Ok(out.to_dtype(in_dtype)?)
}

/// Applies `x @ weight.T`, casting the (f32 master) weight to the activation dtype first.
pub fn linear(x: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let weight = weight.to_dtype(x.dtype())?;
    Ok(Linear::new(weight, None).forward(x)?)
}

/// Scaled dot-product attention.
///
/// Expects `q`, `k`, `v` shaped `[batch, heads, q_len, head_dim]`,
/// `[batch, heads, k_len, head_dim]`, `[batch, heads, k_len, head_dim]`.
/// `mask` is a boolean/binary tensor broadcastable to `[batch, heads, q_len, k_len]`
/// where `true` means keep. `dropout` is applied to the attention probabilities.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    dropout: Option<f32>,
) -> Result<Tensor> {
    let in_dtype = q.dtype();
    let (_, _, _, hd) = q.dims4()?;

    let scale = (hd as f64).sqrt();
    // softmax in f32 regardless of the compute dtype
    let q_f = q.to_dtype(DType::F32)?.contiguous()?;
    let k_t = k.to_dtype(DType::F32)?.transpose(2, 3)?.contiguous()?;
    let v_f = v.to_dtype(DType::F32)?.contiguous()?;

    let mut scores = (q_f.matmul(&k_t)? / scale)?;

    if let Some(m) = mask {
        let m = m.broadcast_as(scores.shape())?;
        let neg_inf = Tensor::full(f32::NEG_INFINITY, scores.dims().to_vec(), scores.device())?;
        scores = m.where_cond(&scores, &neg_inf)?;
    }

    let mut attn = candle_nn::ops::softmax(&scores, D::Minus1)?;
    if let Some(p) = dropout {
        attn = candle_nn::ops::dropout(&attn, p)?;
    }
    let ctx = attn.matmul(&v_f)?;
    Ok(ctx.to_dtype(in_dtype)?)
}

/// Dropout that is a no-op outside training or when `p == 0`.
pub fn maybe_dropout(x: &Tensor, p: f32, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        Ok(candle_nn::ops::dropout(x, p)?)
    } else {
        Ok(x.clone())
    }
}

/// Lower-triangular `(seq_len, seq_len)` mask, `1` where the query may attend to the key.
pub fn causal_mask(device: &candle_core::Device, seq_len: usize) -> Result<Tensor> {
    ensure!(seq_len > 0, "causal mask needs seq_len > 0");
    let query_positions = Tensor::arange(0u32, seq_len as u32, device)?.reshape((seq_len, 1))?;
    let key_positions = Tensor::arange(0u32, seq_len as u32, device)?.reshape((1, seq_len))?;

    let q_grid = query_positions.repeat((1, seq_len))?;
    let k_grid = key_positions.repeat((seq_len, 1))?;
    Ok(q_grid.ge(&k_grid)?)
}
