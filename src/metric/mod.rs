use burn::prelude::*;

/// Peak signal-to-noise ratio in decibels, assuming unit peak signal.
#[derive(Clone, Debug)]
pub struct PsnrMetric<B: Backend> {
    log_10: Tensor<B, 1>,
}

impl<B: Backend> PsnrMetric<B> {
    pub fn init(device: &B::Device) -> Self {
        Self {
            log_10: Tensor::from_floats([10.0], device).log(),
        }
    }

    pub fn forward<const D: usize>(
        &self,
        logits: Tensor<B, D>,
        targets: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        let error = logits - targets;
        self.from_mse((error.clone() * error).mean())
    }

    pub fn from_mse(&self, mse: Tensor<B, 1>) -> Tensor<B, 1> {
        mse.log() / self.log_10.clone() * -10.0
    }
}

/// Scalar counterpart used for per-batch reporting.
pub fn psnr_from_mse(mse: f32) -> f32 {
    -10.0 * mse.log10()
}

/// Rolling buffer of recent PSNR values, drained on each progress
/// report.
#[derive(Debug, Default)]
pub struct PsnrAccumulator {
    values: Vec<f32>,
}

impl PsnrAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f32) {
        self.values.push(value);
    }

    pub fn mean(&self) -> Option<f32> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f32>() / self.values.len() as f32)
    }

    pub fn reset(&mut self) {
        self.values.clear();
    }
}
