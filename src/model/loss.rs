use anyhow::{ensure, Result};
use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossReduction {
    Mean,
    None,
}

/// Cross entropy loss for logits and integer class targets.
///
/// - logits: (B, T, V), any float dtype; the math runs in f32
/// - targets: (B, T) integer tensor with class indices in [0, V) or ignore_index
/// - ignore_index: targets equal to this value are ignored in reduction/averaging
/// - reduction:
///   - Mean: scalar () averaged over the non-ignored positions
///   - None: per-position loss with shape (B, T), zero where ignored
pub fn cross_entropy_loss(
    logits: &Tensor,
    targets: &Tensor,
    ignore_index: i64,
    reduction: LossReduction,
) -> Result<Tensor> {
    let (b, t, v) = logits.dims3()?;
    let (tb, tt) = targets.dims2()?;
    ensure!(
        (tb, tt) == (b, t),
        "targets shape ({tb}, {tt}) does not match logits ({b}, {t}, {v})"
    );
    let logits = logits.to_dtype(DType::F32)?;
    let targets = targets.to_dtype(DType::I64)?;
    let n = b * t;
    let logits2d = logits.reshape((n, v))?;
    let targets = targets.reshape(n)?;

    let ignore_t = Tensor::full(ignore_index, n, targets.device())?;
    let valid_mask = targets.ne(&ignore_t)?; // 1 = valid, 0 = ignore
    // ignored positions gather class 0 and are zeroed afterwards
    let safe_targets = targets.mul(&valid_mask.to_dtype(DType::I64)?)?;

    // logsumexp = max + log(sum(exp(x - max))); the max carries no gradient
    let max_logits = logits2d.max_keepdim(D::Minus1)?.detach();
    let shifted = logits2d.broadcast_sub(&max_logits)?;
    let sum_exp = shifted.exp()?.sum_keepdim(D::Minus1)?;
    let lse = (sum_exp.log()? + max_logits)?.squeeze(D::Minus1)?; // (N,)

    let gathered = logits2d
        .gather(&safe_targets.to_dtype(DType::U32)?.reshape((n, 1))?, D::Minus1)?
        .squeeze(D::Minus1)?; // (N,)
    let nll = (lse - gathered)?;
    let valid_f = valid_mask.to_dtype(DType::F32)?;
    let nll_masked = nll.mul(&valid_f)?;

    match reduction {
        LossReduction::None => Ok(nll_masked.reshape((b, t))?),
        LossReduction::Mean => {
            let denom = valid_f.sum_all()?.to_scalar::<f32>()?;
            if denom == 0.0 {
                // no valid targets
                Ok(Tensor::full(f32::INFINITY, (), logits.device())?)
            } else {
                Ok((nll_masked.sum_all()? / denom as f64)?)
            }
        }
    }
}

/// Number of targets that are not `ignore_index`.
pub fn count_valid(targets: &Tensor, ignore_index: i64) -> Result<usize> {
    let targets = targets.to_dtype(DType::I64)?;
    let ignore_t = Tensor::full(ignore_index, targets.dims(), targets.device())?;
    let valid = targets
        .ne(&ignore_t)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(valid as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result as AnyResult;
    use candle_core::Device;

    fn probs_logits(device: &Device) -> AnyResult<Tensor> {
        // softmax probs are [0.1, 0.7, 0.2] and [0.2, 0.3, 0.5]
        Ok(Tensor::from_vec(
            vec![
                0.1f32.ln(),
                0.7f32.ln(),
                0.2f32.ln(), // pos 0
                0.2f32.ln(),
                0.3f32.ln(),
                0.5f32.ln(), // pos 1
            ],
            (1, 2, 3),
            device,
        )?)
    }

    #[test]
    fn test_cross_entropy_simple() -> AnyResult<()> {
        let device = Device::Cpu;
        let logits = probs_logits(&device)?;
        let targets = Tensor::from_vec(vec![1i64, 2], (1, 2), &device)?;
        let loss = cross_entropy_loss(&logits, &targets, -1, LossReduction::Mean)?;
        let val = loss.to_scalar::<f32>()?;
        // (-ln(0.7) + -ln(0.5)) / 2 = 0.524911
        assert!((val - 0.5249).abs() < 1e-3, "got {val}");
        Ok(())
    }

    #[test]
    fn ignored_positions_are_excluded_from_mean() -> AnyResult<()> {
        let device = Device::Cpu;
        let logits = probs_logits(&device)?;
        let targets = Tensor::from_vec(vec![1i64, -1], (1, 2), &device)?;
        let loss = cross_entropy_loss(&logits, &targets, -1, LossReduction::Mean)?;
        let val = loss.to_scalar::<f32>()?;
        assert!((val - (-0.7f32.ln())).abs() < 1e-4, "got {val}");

        let per_pos = cross_entropy_loss(&logits, &targets, -1, LossReduction::None)?;
        assert_eq!(per_pos.dims(), &[1, 2]);
        assert_eq!(per_pos.to_vec2::<f32>()?[0][1], 0.0);
        assert_eq!(count_valid(&targets, -1)?, 1);
        Ok(())
    }

    #[test]
    fn all_ignored_gives_infinity() -> AnyResult<()> {
        let device = Device::Cpu;
        let logits = probs_logits(&device)?;
        let targets = Tensor::from_vec(vec![-1i64, -1], (1, 2), &device)?;
        let loss = cross_entropy_loss(&logits, &targets, -1, LossReduction::Mean)?;
        assert!(loss.to_scalar::<f32>()?.is_infinite());
        Ok(())
    }

    #[test]
    fn gradient_is_softmax_minus_onehot() -> AnyResult<()> {
        let device = Device::Cpu;
        let var = candle_core::Var::from_tensor(&probs_logits(&device)?)?;
        let targets = Tensor::from_vec(vec![1i64, -1], (1, 2), &device)?;
        let loss = cross_entropy_loss(var.as_tensor(), &targets, -1, LossReduction::Mean)?;
        let grads = loss.backward()?;
        let g = grads.get(var.as_tensor()).expect("grad").to_vec3::<f32>()?;
        let expected = [0.1f32, 0.7 - 1.0, 0.2];
        for (got, want) in g[0][0].iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-5, "got {got}, want {want}");
        }
        assert!(g[0][1].iter().all(|x| x.abs() < 1e-7));
        Ok(())
    }

    #[test]
    fn rejects_mismatched_shapes() -> AnyResult<()> {
        let device = Device::Cpu;
        let logits = probs_logits(&device)?;
        let targets = Tensor::from_vec(vec![1i64, 2, 0], (1, 3), &device)?;
        assert!(cross_entropy_loss(&logits, &targets, -1, LossReduction::Mean).is_err());
        Ok(())
    }
}
