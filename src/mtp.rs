//! Multi-token prediction: per-head target windows and the weighted multi-head loss.
//!
//! Head `k` (0-based) is trained to predict the token `k + 1` positions after its input
//! position, so head 0 is the ordinary next-token objective. A training window therefore
//! holds `seq_len + n_future` tokens: the first `seq_len` are the inputs and head `k`'s
//! targets are the slice starting at offset `k + 1`.

use anyhow::{ensure, Result};
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::model::loss::{count_valid, cross_entropy_loss, LossReduction};

/// Target value excluded from the loss.
pub const IGNORE_INDEX: i64 = -1;

/// Tokens needed to build inputs and every head's targets for one row.
pub fn window_len(seq_len: usize, n_future: usize) -> usize {
    seq_len + n_future
}

/// One row of `window_len(seq_len, n_future)` tokens starting at `start`.
///
/// Positions past the end of `stream` are filled with [`IGNORE_INDEX`]; the caller must
/// make sure the `seq_len` input positions themselves exist.
pub fn window_from_stream(
    stream: &[u16],
    start: usize,
    seq_len: usize,
    n_future: usize,
) -> Result<Vec<i64>> {
    ensure!(
        start + seq_len <= stream.len(),
        "window at {start} needs {seq_len} input tokens, stream has {}",
        stream.len()
    );
    Ok((start..start + window_len(seq_len, n_future))
        .map(|i| stream.get(i).map_or(IGNORE_INDEX, |&tok| tok as i64))
        .collect())
}

/// Targets of every head for a single window, `targets[k][t] = window[t + k + 1]`.
pub fn future_targets(window: &[i64], n_future: usize) -> Result<Vec<Vec<i64>>> {
    ensure!(n_future > 0, "n_future must be >= 1");
    ensure!(
        window.len() > n_future,
        "window of {} tokens is too short for {n_future} heads",
        window.len()
    );
    let seq_len = window.len() - n_future;
    Ok((0..n_future)
        .map(|k| window[k + 1..k + 1 + seq_len].to_vec())
        .collect())
}

/// Model inputs and per-head targets for one batch.
#[derive(Debug, Clone)]
pub struct MtpBatch {
    /// (B, T) token ids.
    pub inputs: Tensor,
    /// `n_future` tensors of (B, T) i64 targets, ordered by prediction offset.
    pub targets: Vec<Tensor>,
}

impl MtpBatch {
    pub fn n_future(&self) -> usize {
        self.targets.len()
    }
}

/// Splits a `(B, T + n_future)` window tensor into inputs and per-head targets.
pub fn split_window(window: &Tensor, n_future: usize) -> Result<MtpBatch> {
    ensure!(n_future > 0, "n_future must be >= 1");
    let (_batch, width) = window.dims2()?;
    ensure!(
        width > n_future,
        "window width {width} leaves no input positions for {n_future} heads"
    );
    let seq_len = width - n_future;
    let window = window.to_dtype(DType::I64)?;

    let inputs = window.narrow(1, 0, seq_len)?;
    let min_input = inputs.min_all()?.to_scalar::<i64>()?;
    ensure!(
        min_input >= 0,
        "input positions must hold real tokens, found {min_input}"
    );
    let inputs = inputs.to_dtype(DType::U32)?;
    let targets = (0..n_future)
        .map(|k| Ok(window.narrow(1, k + 1, seq_len)?.contiguous()?))
        .collect::<Result<Vec<_>>>()?;
    Ok(MtpBatch { inputs, targets })
}

/// How the auxiliary loss mass is spread over heads `1..n_future`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MtpWeighting {
    #[default]
    Uniform,
    /// Head `k` gets a share proportional to `ratio^(k-1)`.
    Geometric { ratio: f64 },
}

/// Per-head loss weights: 1 for the primary head, `lambda` split across the others.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadWeights(Vec<f64>);

impl HeadWeights {
    pub fn new(n_future: usize, lambda: f64, weighting: MtpWeighting) -> Result<Self> {
        ensure!(n_future > 0, "n_future must be >= 1");
        ensure!(
            lambda.is_finite() && lambda >= 0.0,
            "mtp loss weight must be finite and >= 0, got {lambda}"
        );
        let aux = n_future - 1;
        let shares: Vec<f64> = match weighting {
            MtpWeighting::Uniform => vec![1.0; aux],
            MtpWeighting::Geometric { ratio } => {
                ensure!(
                    ratio > 0.0 && ratio <= 1.0,
                    "geometric ratio must be in (0, 1], got {ratio}"
                );
                (0..aux).map(|k| ratio.powi(k as i32)).collect()
            }
        };
        let total: f64 = shares.iter().sum();

        let mut weights = Vec::with_capacity(n_future);
        weights.push(1.0);
        weights.extend(shares.iter().map(|s| lambda * s / total));
        Ok(Self(weights))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Weighted multi-head loss with the per-head components kept for reporting.
#[derive(Debug, Clone)]
pub struct MtpLoss {
    /// Scalar to backpropagate.
    pub total: Tensor,
    /// Unweighted mean CE of each head.
    pub per_head: Vec<Tensor>,
}

impl MtpLoss {
    pub fn primary(&self) -> &Tensor {
        &self.per_head[0]
    }

    pub fn per_head_values(&self) -> Result<Vec<f32>> {
        self.per_head
            .iter()
            .map(|t| Ok(t.to_scalar::<f32>()?))
            .collect()
    }
}

/// `sum_k weights[k] * CE(logits[k], targets[k])`.
///
/// The three slices must describe the same heads in the same order. A head whose targets
/// are all [`IGNORE_INDEX`] contributes zero.
pub fn mtp_loss(logits: &[Tensor], targets: &[Tensor], weights: &HeadWeights) -> Result<MtpLoss> {
    ensure!(!logits.is_empty(), "mtp loss needs at least one head");
    ensure!(
        logits.len() == targets.len() && logits.len() == weights.len(),
        "head count mismatch: {} logits, {} targets, {} weights",
        logits.len(),
        targets.len(),
        weights.len()
    );
    let (b, t, _v) = logits[0].dims3()?;
    let device = logits[0].device();

    let mut total = Tensor::zeros((), DType::F32, device)?;
    let mut per_head = Vec::with_capacity(logits.len());
    for (k, ((head_logits, head_targets), &w)) in logits
        .iter()
        .zip(targets)
        .zip(weights.as_slice())
        .enumerate()
    {
        let (hb, ht, _) = head_logits.dims3()?;
        ensure!(
            (hb, ht) == (b, t),
            "head {k} logits are ({hb}, {ht}, _), expected ({b}, {t}, _)"
        );
        let loss = if count_valid(head_targets, IGNORE_INDEX)? == 0 {
            Tensor::zeros((), DType::F32, device)?
        } else {
            cross_entropy_loss(head_logits, head_targets, IGNORE_INDEX, LossReduction::Mean)?
        };
        if w != 0.0 {
            total = (total + (&loss * w)?)?;
        }
        per_head.push(loss);
    }
    Ok(MtpLoss { total, per_head })
}
