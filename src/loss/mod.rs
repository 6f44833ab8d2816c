use crate::*;

use burn::{
    nn::loss::{MseLoss, Reduction},
    prelude::*,
    tensor::ElementConversion,
};

#[derive(Config, Debug)]
pub struct PhotometricLossConfig {
    #[config(default = 0.0)]
    pub ortho_weight: f64,
    #[config(default = 8e-5)]
    pub l1_weight_initial: f64,
    #[config(default = 4e-5)]
    pub l1_weight_rest: f64,
    #[config(default = 0.0)]
    pub tv_weight_density: f64,
    #[config(default = 0.0)]
    pub tv_weight_app: f64,
}

/// Reconstruction loss over the uniformly sampled batch plus the
/// regularization terms whose weights the schedule decays. The engine
/// holds the mutable weight state; the orchestrator drives the decay.
pub struct PhotometricLossEngine {
    ortho_weight: f64,
    l1_weight: f64,
    l1_weight_rest: f64,
    tv_weight_density: f64,
    tv_weight_app: f64,
    decay_factor: f64,
}

pub struct PhotometricLoss<B: Backend> {
    pub total: Tensor<B, 1>,
    pub mse: f32,
}

impl PhotometricLossEngine {
    pub fn new(config: &PhotometricLossConfig, decay_factor: f64) -> Self {
        Self {
            ortho_weight: config.ortho_weight,
            l1_weight: config.l1_weight_initial,
            l1_weight_rest: config.l1_weight_rest,
            tv_weight_density: config.tv_weight_density,
            tv_weight_app: config.tv_weight_app,
            decay_factor,
        }
    }

    pub fn compute<B: Backend>(
        &self,
        rendered: Tensor<B, 2>,
        target: Tensor<B, 2>,
        field: &field::TensorialField<B>,
    ) -> PhotometricLoss<B> {
        let image_loss = MseLoss::new().forward(rendered, target, Reduction::Mean);
        let mse: f32 = image_loss.clone().into_scalar().elem();

        let mut total = image_loss;
        if self.ortho_weight > 0.0 {
            total = total + field.vector_component_diffs().mul_scalar(self.ortho_weight);
        }
        if self.l1_weight > 0.0 {
            total = total + field.density_l1().mul_scalar(self.l1_weight);
        }
        if self.tv_weight_density > 0.0 {
            total = total + field.tv_loss_density().mul_scalar(self.tv_weight_density);
        }
        if self.tv_weight_app > 0.0 {
            total = total + field.tv_loss_app().mul_scalar(self.tv_weight_app);
        }

        PhotometricLoss {
            total,
            mse,
        }
    }

    /// Applied once per iteration, mirroring the learning-rate decay.
    pub fn decay_tv_weights(&mut self) {
        self.tv_weight_density *= self.decay_factor;
        self.tv_weight_app *= self.decay_factor;
    }

    /// Switched at the first alpha-mask checkpoint.
    pub fn sustain_l1_weight(&mut self) {
        self.l1_weight = self.l1_weight_rest;
    }

    pub fn l1_weight(&self) -> f64 {
        self.l1_weight
    }

    pub fn tv_weight_density(&self) -> f64 {
        self.tv_weight_density
    }

    pub fn tv_weight_app(&self) -> f64 {
        self.tv_weight_app
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type Backend = burn::backend::NdArray;

    fn engine(decay_factor: f64) -> PhotometricLossEngine {
        PhotometricLossEngine::new(
            &PhotometricLossConfig {
                ortho_weight: 1e-3,
                l1_weight_initial: 8e-5,
                l1_weight_rest: 4e-5,
                tv_weight_density: 0.1,
                tv_weight_app: 0.01,
            },
            decay_factor,
        )
    }

    fn test_field(
        device: &<Backend as burn::prelude::Backend>::Device,
    ) -> field::TensorialField<Backend> {
        field::TensorialFieldConfig {
            density_components: 4,
            appearance_components: 6,
            appearance_features: 8,
            head_hidden_size: 16,
            direction_encoder: encoder::FrequencyEncoderConfig {
                band_count: 2,
            },
            density_shift: 0.0,
            alpha_threshold: 1e-4,
            distance_scale: 25.0,
        }
        .init(
            field::BoundingBox::new([-1.5, -1.5, -1.5], [1.5, 1.5, 1.5]),
            [8, 8, 8],
            device,
        )
        .unwrap()
    }

    #[test]
    fn tv_weights_decay_multiplicatively() {
        let mut engine = engine(0.9);

        for _ in 0..100 {
            engine.decay_tv_weights();
        }

        let expected_density = 0.1 * 0.9f64.powi(100);
        let expected_app = 0.01 * 0.9f64.powi(100);
        assert!((engine.tv_weight_density() - expected_density).abs() < 1e-15);
        assert!((engine.tv_weight_app() - expected_app).abs() < 1e-16);
    }

    #[test]
    fn l1_weight_switches_to_the_sustained_value() {
        let mut engine = engine(1.0);
        assert_eq!(engine.l1_weight(), 8e-5);
        engine.sustain_l1_weight();
        assert_eq!(engine.l1_weight(), 4e-5);
    }

    #[test]
    fn regularizers_only_add_to_the_image_loss() {
        let device = Default::default();
        let field = test_field(&device);

        let rendered =
            Tensor::random([64, 3], Distribution::Uniform(0.0, 1.0), &device);
        let target =
            Tensor::random([64, 3], Distribution::Uniform(0.0, 1.0), &device);

        let loss = engine(0.9).compute(rendered, target, &field);
        let total: f32 = loss.total.into_scalar();
        assert!(total.is_finite());
        assert!(loss.mse.is_finite());
        assert!(total >= loss.mse);
    }
}
