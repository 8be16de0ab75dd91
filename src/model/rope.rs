/// Rotary position embeddings over interleaved `(even, odd)` feature pairs.
use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor};

const BASE_THETA: f32 = 10_000.0;

#[derive(Debug)]
pub struct RoPE {
    /// Pre-computed cos/sin tables with shape (max_positions, head_dim/2), always f32.
    cos: Tensor,
    sin: Tensor,
    max_positions: usize,
    head_dim: usize,
}

impl RoPE {
    pub fn new(device: &Device, max_positions: usize, head_dim: usize) -> Result<Self> {
        ensure!(head_dim % 2 == 0, "RoPE needs an even head_dim, got {head_dim}");
        let half_dim = head_dim / 2;

        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| BASE_THETA.powf(-((2 * i) as f32 / head_dim as f32)))
            .collect();

        let positions = Tensor::arange(0u32, max_positions as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_positions, 1))?;
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        let angles = positions.matmul(&inv_freq)?;

        Ok(Self {
            cos: angles.cos()?,
            sin: angles.sin()?,
            max_positions,
            head_dim,
        })
    }

    /// The `(cos, sin)` tables, each `(max_positions, head_dim/2)`.
    pub fn tables(&self) -> (&Tensor, &Tensor) {
        (&self.cos, &self.sin)
    }

    /// Rotate `x` shaped `[batch, seq_len, heads, head_dim]`, starting at position 0.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, heads, head_dim) = x.dims4()?;

        ensure!(
            head_dim == self.head_dim,
            "head_dim mismatch: expected {}, got {}",
            self.head_dim,
            head_dim
        );
        ensure!(
            seq_len <= self.max_positions,
            "sequence length {} exceeds max {}",
            seq_len,
            self.max_positions
        );

        let in_dtype = x.dtype();
        let half = head_dim / 2;

        // (1, T, 1, half) so it broadcasts over batch and heads
        let cos = self
            .cos
            .narrow(0, 0, seq_len)?
            .to_dtype(in_dtype)?
            .unsqueeze(0)?
            .unsqueeze(2)?;
        let sin = self
            .sin
            .narrow(0, 0, seq_len)?
            .to_dtype(in_dtype)?
            .unsqueeze(0)?
            .unsqueeze(2)?;

        let pairs = x.reshape((batch, seq_len, heads, half, 2))?;
        let x0 = pairs.narrow(4, 0, 1)?.squeeze(4)?;
        let x1 = pairs.narrow(4, 1, 1)?.squeeze(4)?;

        // (x0 + i x1) * (cos + i sin)
        let y0 = x0.broadcast_mul(&cos)?.broadcast_sub(&x1.broadcast_mul(&sin)?)?;
        let y1 = x0.broadcast_mul(&sin)?.broadcast_add(&x1.broadcast_mul(&cos)?)?;

        Ok(Tensor::stack(&[&y0, &y1], 4)?.reshape((batch, seq_len, heads, head_dim))?)
    }
}
