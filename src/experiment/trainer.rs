use crate::*;

use anyhow::{bail, Result};
use burn::{
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use kdam::{term, Bar, BarExt};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    io::{stderr, IsTerminal},
    path::PathBuf,
};

use super::{tester::Tester, ExperimentConfig};

pub struct Trainer<B: AutodiffBackend> {
    pub(super) artifact_directory: PathBuf,
    pub(super) config: ExperimentConfig,
    pub(super) dataset_train: dataset::RayDataset<B>,
    pub(super) device: B::Device,
    pub(super) progress_bar: Bar,
    pub(super) renderer: renderer::RayRenderer,
    pub(super) tester: Tester<B>,
}

/// All mutable training state, threaded by reference through the loop.
/// The two field optimizers live alongside it in `train` because their
/// concrete adaptor types are private to the optimizer construction.
struct TrainingState<B: AutodiffBackend> {
    field: field::TensorialField<B>,
    uniform_rays: dataset::RayBundle<B>,
    grid_rays: dataset::RayBundle<B>,
    uniform_sampler: sampler::UniformRaySampler,
    grid_sampler: sampler::GridPatchSampler,
    loss_engine: loss::PhotometricLossEngine,
    lr_spatial: f64,
    lr_basis: f64,
    resolution: schedule::VolumeResolution,
    sample_count: usize,
    psnrs: metric::PsnrAccumulator,
}

#[derive(Clone, Copy, Default)]
struct IterationReport {
    mse: f32,
    discriminator_loss: f32,
    generator_loss: f32,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn train(&self) -> Result<field::TensorialField<B::InnerBackend>> {
        let config = &self.config;
        let device = &self.device;
        if let Some(seed) = config.seed {
            B::seed(seed);
        }

        let bounds = self.dataset_train.bounds();
        let white_background = self.dataset_train.white_background();
        let kind = field::FieldKind::from_tag(&config.model_kind)?;

        let decay_iterations = if config.lr_decay_iterations > 0 {
            config.lr_decay_iterations
        } else {
            config.iteration_count
        };
        let lr_factor =
            schedule::decay_factor(config.lr_decay_target_ratio, decay_iterations);
        log::info!(
            "Learning-rate decay to {} over {} iterations (factor {:.6})",
            config.lr_decay_target_ratio,
            decay_iterations,
            lr_factor,
        );

        let mut state = {
            let resolution = schedule::voxels_to_resolution(
                config.initial_voxel_count,
                bounds.extents(),
            );
            let field = match &config.resume_checkpoint {
                Some(path) => {
                    let (field, manifest) =
                        field::load_field::<B>(path.as_ref(), device)?;
                    log::info!("Resumed {} checkpoint from {}", manifest.kind, path);
                    field
                }
                None => kind.init::<B>(&config.field, bounds, resolution, device)?,
            };
            let resolution = field.resolution();

            let uniform_rays = self.dataset_train.rays();
            // The patch sampler stays pinned to the unfiltered image-major
            // arrays even after ray filtering rebuilds the uniform side.
            let grid_rays = self.dataset_train.rays();

            TrainingState {
                uniform_sampler: sampler::UniformRaySampler::new(
                    uniform_rays.len(),
                    config.batch_size,
                    sampler_rng(config.seed, 0x5eed),
                )?,
                grid_sampler: sampler::GridPatchSampler::new(
                    grid_rays.len(),
                    config.batch_size,
                    self.dataset_train.image_count(),
                    config.patch_dilation,
                    sampler_rng(config.seed, 0x9717),
                )?,
                uniform_rays,
                grid_rays,
                loss_engine: loss::PhotometricLossEngine::new(
                    &config.photometric,
                    lr_factor,
                ),
                lr_spatial: config.lr_spatial,
                lr_basis: config.lr_basis,
                sample_count: schedule::samples_for_resolution(
                    resolution,
                    config.step_ratio,
                    config.max_samples_per_ray,
                ),
                resolution,
                field,
                psnrs: metric::PsnrAccumulator::new(),
            }
        };

        let mut volume_schedule = schedule::VolumeSchedule::new(
            config.initial_voxel_count,
            config.final_voxel_count,
            config.upsample_checkpoints.clone(),
        )?;
        let mut prune_schedule = schedule::AlphaPruneSchedule::new(
            config.alpha_mask_checkpoints.clone(),
            state.resolution,
        )?;

        let mut adversary =
            config.adversarial.init::<B>(config.batch_size, device)?;

        let field_adam = AdamConfig::new().with_beta_1(0.9).with_beta_2(0.99);
        let mut optim_spatial = field_adam.init();
        let mut optim_basis = field_adam.init();

        let mut report = IterationReport::default();
        let mut progress_bar = self.progress_bar.clone();
        term::init(stderr().is_terminal());

        for iteration in 0..config.iteration_count {
            let uniform_batch = state
                .uniform_rays
                .select(state.uniform_sampler.next_batch());
            let grid_batch = state.grid_rays.select(&state.grid_sampler.next_batch());

            // Discriminator update against a constant render of the
            // patch: the field is evaluated through its no-gradient view.
            let fake_patch = self
                .renderer
                .render(
                    grid_batch.origins.clone().inner(),
                    grid_batch.directions.clone().inner(),
                    &state.field.valid(),
                    state.sample_count,
                    white_background,
                    true,
                )
                .colors;
            report.discriminator_loss =
                adversary.discriminator_step(grid_batch.colors.clone(), fake_patch);

            if adversary.wants_generator_step(iteration) {
                // Fresh render with gradient flow for the generator term.
                let fake_patch = self
                    .renderer
                    .render(
                        grid_batch.origins,
                        grid_batch.directions,
                        &state.field,
                        state.sample_count,
                        white_background,
                        true,
                    )
                    .colors;
                let generator_loss = adversary.generator_loss(fake_patch);
                report.generator_loss =
                    generator_loss.clone().into_scalar().elem();

                let rendered = self
                    .renderer
                    .render(
                        uniform_batch.origins,
                        uniform_batch.directions,
                        &state.field,
                        state.sample_count,
                        white_background,
                        true,
                    )
                    .colors;
                let photometric = state.loss_engine.compute(
                    rendered,
                    uniform_batch.colors,
                    &state.field,
                );
                report.mse = photometric.mse;
                state.psnrs.push(metric::psnr_from_mse(photometric.mse));

                let total_loss = photometric.total + generator_loss;
                let mut gradients = total_loss.backward();
                let spatial = GradientsParams::from_params(
                    &mut gradients,
                    &state.field,
                    &state.field.spatial_param_ids(),
                );
                let basis = GradientsParams::from_params(
                    &mut gradients,
                    &state.field,
                    &state.field.basis_param_ids(),
                );
                state.field =
                    optim_spatial.step(state.lr_spatial, state.field.clone(), spatial);
                state.field =
                    optim_basis.step(state.lr_basis, state.field.clone(), basis);
            }

            state.lr_spatial *= lr_factor;
            state.lr_basis *= lr_factor;
            state.loss_engine.decay_tv_weights();

            if iteration % config.progress_refresh_rate == 0 {
                progress_bar.postfix = format!(
                    "┃ PSNR = {:.2} dB ┃ mse = {:.6} ┃ d = {:.3} ┃ g = {:.3}",
                    state.psnrs.mean().unwrap_or(0.0),
                    report.mse,
                    report.discriminator_loss,
                    report.generator_loss,
                );
                state.psnrs.reset();
            }
            progress_bar.update(1)?;

            if config.evaluation_cadence > 0
                && iteration % config.evaluation_cadence
                    == config.evaluation_cadence - 1
            {
                let evaluation = self.tester.test_with_prefix(
                    &state.field.valid(),
                    state.sample_count,
                    &format!("{:06}_", iteration),
                )?;
                if let Some(mean) = evaluation.mean_psnr {
                    log::info!(
                        "Evaluation at iteration {}: PSNR = {:.2} dB",
                        iteration,
                        mean,
                    );
                }
            }

            if let Some(step) = prune_schedule.step_at(iteration, config.ndc_rays) {
                let mask_resolution = prune_schedule.mask_resolution(state.resolution);
                self.prune_step(&mut state, step, mask_resolution)?;
            }

            if let Some(voxel_count) = volume_schedule.upsample_at(iteration) {
                self.upsample_step(&mut state, voxel_count, iteration);
                optim_spatial = field_adam.init();
                optim_basis = field_adam.init();
            }
        }

        progress_bar.clear()?;
        progress_bar
            .set_bar_format(
                "{desc suffix=''} ┃ \
                {total} {unit} ┃ \
                {rate:.1} {unit}/s ┃ \
                {elapsed human=true}\n",
            )
            .map_err(anyhow::Error::msg)?;
        progress_bar.set_description("Trained");
        progress_bar.refresh()?;

        let checkpoint = field::FieldCheckpoint::capture(
            &state.field,
            &config.field,
            &config.model_kind,
        );
        field::save_field(
            &state.field,
            &checkpoint,
            &self.artifact_directory.join("checkpoint"),
        )?;

        Ok(state.field.valid())
    }

    /// Alpha-mask checkpoint: refresh the occupancy grid, optionally
    /// shrink the field bounds, optionally drop rays that miss the
    /// occupied region and rebuild the uniform sampler over the rest.
    fn prune_step(
        &self,
        state: &mut TrainingState<B>,
        step: schedule::PruneStep,
        mask_resolution: schedule::VolumeResolution,
    ) -> Result<()> {
        let (field, tight_bounds) =
            state.field.clone().update_alpha_mask(mask_resolution);
        state.field = field;

        if step.shrink_bounds {
            state.field = state.field.clone().shrink(tight_bounds);
            state.resolution = state.field.resolution();
            state.loss_engine.sustain_l1_weight();
            log::info!(
                "Sustained density-L1 weight at {}",
                state.loss_engine.l1_weight(),
            );
        }

        if step.filter_rays {
            let before = state.uniform_rays.len();
            let (origins, directions, colors) = state.field.filter_rays(
                state.uniform_rays.origins.clone(),
                state.uniform_rays.directions.clone(),
                state.uniform_rays.colors.clone(),
                false,
            );
            state.uniform_rays = dataset::RayBundle {
                origins,
                directions,
                colors,
            };

            let batch = self.config.batch_size.min(state.uniform_rays.len());
            if batch == 0 {
                bail!("Ray filtering removed every training ray");
            }
            if batch < self.config.batch_size {
                log::warn!(
                    "Filtered ray count {} fell below the batch size; clamping",
                    state.uniform_rays.len(),
                );
            }
            state.uniform_sampler = sampler::UniformRaySampler::new(
                state.uniform_rays.len(),
                batch,
                sampler_rng(self.config.seed, 0xf117),
            )?;
            log::info!(
                "Rebuilt uniform sampler over {} of {} rays",
                state.uniform_rays.len(),
                before,
            );
        }

        Ok(())
    }

    /// Upsample checkpoint: move to the next voxel budget and rescale
    /// the learning rates; the caller rebuilds the optimizers since the
    /// parameter tensors were replaced.
    fn upsample_step(
        &self,
        state: &mut TrainingState<B>,
        voxel_count: usize,
        iteration: usize,
    ) {
        let config = &self.config;
        state.resolution = schedule::voxels_to_resolution(
            voxel_count,
            state.field.bounds().extents(),
        );
        state.sample_count = schedule::samples_for_resolution(
            state.resolution,
            config.step_ratio,
            config.max_samples_per_ray,
        );
        state.field = state.field.clone().upsample_volume_grid(state.resolution);

        let scale = if config.lr_upsample_reset {
            log::info!("Reset learning rates to their initial values");
            1.0
        } else {
            schedule::decayed_scale(
                config.lr_decay_target_ratio,
                iteration,
                config.iteration_count,
            )
        };
        state.lr_spatial = config.lr_spatial * scale;
        state.lr_basis = config.lr_basis * scale;
    }
}

fn sampler_rng(seed: Option<u64>, salt: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_mul(0x9e3779b97f4a7c15) ^ salt),
        None => StdRng::from_entropy(),
    }
}
