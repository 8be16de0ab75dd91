use std::f64::consts::PI;

use crate::config::TrainConfig;

/// Linear warmup to `learning_rate`, cosine decay to `min_lr` at `lr_decay_iters`, then flat.
#[derive(Debug, Clone, PartialEq)]
pub struct LrSchedule {
    pub learning_rate: f64,
    pub warmup_iters: usize,
    pub lr_decay_iters: usize,
    pub min_lr: f64,
    /// When false the rate stays at `learning_rate`.
    pub decay: bool,
}

impl LrSchedule {
    pub fn from_config(config: &TrainConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            warmup_iters: config.warmup_iters,
            lr_decay_iters: config.lr_decay_iters(),
            min_lr: config.min_lr,
            decay: config.decay_lr,
        }
    }

    pub fn lr(&self, iter: usize) -> f64 {
        if !self.decay {
            return self.learning_rate;
        }
        if iter < self.warmup_iters {
            return self.learning_rate * iter as f64 / self.warmup_iters as f64;
        }
        if iter > self.lr_decay_iters {
            return self.min_lr;
        }
        let span = self.lr_decay_iters - self.warmup_iters;
        if span == 0 {
            return self.min_lr;
        }
        let decay_ratio = (iter - self.warmup_iters) as f64 / span as f64;
        debug_assert!((0.0..=1.0).contains(&decay_ratio));
        // coeff goes 1 -> 0
        let coeff = 0.5 * (1.0 + (PI * decay_ratio).cos());
        self.min_lr + coeff * (self.learning_rate - self.min_lr)
    }
}
