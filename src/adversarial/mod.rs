use crate::*;

use anyhow::{bail, Result};
use burn::{
    nn::loss::{BinaryCrossEntropyLoss, BinaryCrossEntropyLossConfig},
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion, Int},
};

#[derive(Config, Debug)]
pub struct AdversarialTrainerConfig {
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    #[config(default = 10)]
    pub generator_cadence: usize,
    #[config(default = 0.5)]
    pub beta_1: f64,
    #[config(default = 0.99)]
    pub beta_2: f64,
    #[config(default = 32)]
    pub base_channels: usize,
}

/// Owns the patch discriminator and its optimizer. The discriminator
/// steps every iteration against detached renders; the generator loss
/// is produced on a fixed cadence from a gradient-carrying render and
/// folded into the radiance-field loss instead.
pub struct AdversarialTrainer<B: AutodiffBackend, O> {
    discriminator: discriminator::PatchDiscriminator<B>,
    optimizer: O,
    criterion: BinaryCrossEntropyLoss<B>,
    learning_rate: f64,
    tile_extent: usize,
    generator_cadence: usize,
}

impl AdversarialTrainerConfig {
    pub fn init<B: AutodiffBackend>(
        &self,
        batch: usize,
        device: &B::Device,
    ) -> Result<AdversarialTrainer<B, impl Optimizer<discriminator::PatchDiscriminator<B>, B>>>
    {
        let tile_extent = match sampler::exact_square_root(batch) {
            Some(extent) if extent >= 2 => extent,
            _ => bail!(
                "Adversarial batch size ({}) must be a perfect square of at least 2x2",
                batch
            ),
        };
        if self.generator_cadence == 0 {
            bail!("Generator cadence must be greater than 0");
        }

        let discriminator = discriminator::PatchDiscriminatorConfig {
            tile_extent,
            base_channels: self.base_channels,
        }
        .init(device)?;

        Ok(AdversarialTrainer {
            discriminator,
            optimizer: AdamConfig::new()
                .with_beta_1(self.beta_1 as f32)
                .with_beta_2(self.beta_2 as f32)
                .init(),
            criterion: BinaryCrossEntropyLossConfig::new()
                .with_logits(true)
                .init(device),
            learning_rate: self.learning_rate,
            tile_extent,
            generator_cadence: self.generator_cadence,
        })
    }
}

impl<B, O> AdversarialTrainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<discriminator::PatchDiscriminator<B>, B>,
{
    pub fn tile_extent(&self) -> usize {
        self.tile_extent
    }

    pub fn wants_generator_step(&self, iteration: usize) -> bool {
        iteration % self.generator_cadence == 0
    }

    /// One discriminator update: BCE against ones for the real patch
    /// plus BCE against zeros for the no-gradient render, which enters
    /// the graph as a constant. Returns the loss value for reporting.
    pub fn discriminator_step(
        &mut self,
        real: Tensor<B, 2>,
        fake: Tensor<B::InnerBackend, 2>,
    ) -> f32 {
        let device = real.device();

        let real_logits = self
            .discriminator
            .forward(self.tile(real))
            .squeeze::<1>(1);
        let fake_logits = self
            .discriminator
            .forward(self.tile(Tensor::from_inner(fake)))
            .squeeze::<1>(1);

        let ones = Tensor::<B, 1, Int>::ones([1], &device);
        let zeros = Tensor::<B, 1, Int>::zeros([1], &device);
        let loss = self.criterion.forward(real_logits, ones)
            + self.criterion.forward(fake_logits, zeros);

        let gradients =
            GradientsParams::from_grads(loss.backward(), &self.discriminator);
        self.discriminator = self.optimizer.step(
            self.learning_rate,
            self.discriminator.clone(),
            gradients,
        );

        loss.into_scalar().elem()
    }

    /// Generator objective for a gradient-carrying render: how strongly
    /// the discriminator is fooled. No discriminator update happens
    /// here; the caller folds this into the radiance-field loss.
    pub fn generator_loss(&self, fake: Tensor<B, 2>) -> Tensor<B, 1> {
        let device = fake.device();
        let logits = self
            .discriminator
            .forward(self.tile(fake))
            .squeeze::<1>(1);
        self.criterion
            .forward(logits, Tensor::<B, 1, Int>::ones([1], &device))
    }

    fn tile(&self, colors: Tensor<B, 2>) -> Tensor<B, 4> {
        let extent = self.tile_extent as i32;
        colors
            .reshape([1, extent, extent, 3])
            .permute([0, 3, 1, 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type Backend = burn::backend::Autodiff<burn::backend::NdArray>;

    fn config() -> AdversarialTrainerConfig {
        AdversarialTrainerConfig {
            learning_rate: 1e-4,
            generator_cadence: 10,
            beta_1: 0.5,
            beta_2: 0.99,
            base_channels: 8,
        }
    }

    #[test]
    fn non_square_batches_fail_at_setup() {
        let device = Default::default();
        assert!(config().init::<Backend>(24, &device).is_err());
        assert!(config().init::<Backend>(1, &device).is_err());
        assert!(config().init::<Backend>(16, &device).is_ok());
    }

    #[test]
    fn generator_steps_run_on_the_configured_cadence() {
        let device = Default::default();
        let trainer = config().init::<Backend>(16, &device).unwrap();

        assert!(trainer.wants_generator_step(0));
        assert!(!trainer.wants_generator_step(5));
        assert!(trainer.wants_generator_step(10));
        assert!(trainer.wants_generator_step(20));
    }

    #[test]
    fn discriminator_steps_produce_finite_losses() {
        let device = Default::default();
        let mut trainer = config().init::<Backend>(16, &device).unwrap();

        for _ in 0..3 {
            let real = Tensor::random([16, 3], Distribution::Uniform(0.0, 1.0), &device);
            let fake = Tensor::random([16, 3], Distribution::Uniform(0.0, 1.0), &device)
                .inner();
            let loss = trainer.discriminator_step(real, fake);
            assert!(loss.is_finite());
            assert!(loss >= 0.0);
        }
    }

    #[test]
    fn generator_loss_carries_gradients() {
        let device = Default::default();
        let trainer = config().init::<Backend>(16, &device).unwrap();

        let fake = Tensor::random([16, 3], Distribution::Uniform(0.0, 1.0), &device)
            .require_grad();
        let loss = trainer.generator_loss(fake.clone());
        assert_eq!(loss.dims(), [1]);

        let gradients = loss.backward();
        assert!(fake.grad(&gradients).is_some());
    }
}
