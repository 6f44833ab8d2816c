pub mod tester;
pub mod trainer;

use crate::*;

use self::{tester::*, trainer::*};
use anyhow::Result;
use burn::{prelude::*, tensor::backend::AutodiffBackend};
use kdam::tqdm;
use std::{fs, path::PathBuf};

#[derive(Config, Debug)]
pub struct ExperimentConfig {
    pub artifact_directory: String,
    pub dataset: dataset::RayDatasetConfig,
    pub dataset_file_path_or_url: String,
    #[config(default = 0.875)]
    pub train_ratio: f32,
    pub seed: Option<u64>,

    #[config(default = 30000)]
    pub iteration_count: usize,
    #[config(default = 4096)]
    pub batch_size: usize,
    #[config(default = "vec![2000, 3000, 4000, 5500, 7000]")]
    pub upsample_checkpoints: Vec<usize>,
    #[config(default = "vec![2000, 4000]")]
    pub alpha_mask_checkpoints: Vec<usize>,
    #[config(default = false)]
    pub ndc_rays: bool,

    #[config(default = 2097152)]
    pub initial_voxel_count: usize,
    #[config(default = 27000000)]
    pub final_voxel_count: usize,
    #[config(default = 0.5)]
    pub step_ratio: f64,
    #[config(default = 1024)]
    pub max_samples_per_ray: usize,

    #[config(default = 2e-2)]
    pub lr_spatial: f64,
    #[config(default = 1e-3)]
    pub lr_basis: f64,
    #[config(default = 0.1)]
    pub lr_decay_target_ratio: f64,
    /// Zero falls back to the full iteration count.
    #[config(default = 0)]
    pub lr_decay_iterations: usize,
    #[config(default = true)]
    pub lr_upsample_reset: bool,

    #[config(default = 20)]
    pub patch_dilation: usize,

    #[config(default = "String::from(\"cp\")")]
    pub model_kind: String,
    pub field: field::TensorialFieldConfig,
    pub renderer: renderer::RayRendererConfig,
    pub adversarial: adversarial::AdversarialTrainerConfig,
    pub photometric: loss::PhotometricLossConfig,

    #[config(default = 100)]
    pub progress_refresh_rate: usize,
    #[config(default = 5000)]
    pub evaluation_cadence: usize,
    #[config(default = 8)]
    pub evaluation_image_cap: usize,
    pub resume_checkpoint: Option<String>,
}

pub struct Experiment<B: AutodiffBackend> {
    pub trainer: Trainer<B>,
    pub tester: Tester<B>,
}

impl ExperimentConfig {
    pub fn init<B: AutodiffBackend>(
        &self,
        device: &B::Device,
    ) -> Result<Experiment<B>> {
        let dataset = self
            .dataset
            .init_from_file_path_or_url::<B>(&self.dataset_file_path_or_url, device)?;
        self.init_with_dataset(dataset, device)
    }

    /// Builds the experiment around an already-loaded dataset.
    pub fn init_with_dataset<B: AutodiffBackend>(
        &self,
        dataset: dataset::RayDataset<B>,
        device: &B::Device,
    ) -> Result<Experiment<B>> {
        if let Some(seed) = self.seed {
            B::seed(seed);
        }

        // Sampler and model-tag geometry must fail here, not mid-run.
        field::FieldKind::from_tag(&self.model_kind)?;

        let artifact_directory = PathBuf::from(&self.artifact_directory);
        let datasets = dataset.split_for_training(self.train_ratio);
        if datasets.train.ray_count() == 0 {
            anyhow::bail!("Training split is empty");
        }

        let renderer = self.renderer.init()?;
        let metric_fidelity = metric::PsnrMetric::<B::InnerBackend>::init(device);

        let progress_bar = {
            let mut bar = tqdm!(
                desc = "Training",
                colour = "orangered",
                dynamic_ncols = true,
                force_refresh = true,
                total = self.iteration_count,
                unit = "steps",
                bar_format = "{desc suffix=''} {postfix} ┃ \
                {percentage:.0}% = {count}/{total} {unit} ┃ \
                {rate:.1} {unit}/s ┃ \
                {remaining human=true} \
                ┃{animation}┃"
            );
            bar.postfix = format!("on {} rays", datasets.train.ray_count());
            bar
        };

        let _ = fs::remove_dir_all(&artifact_directory);
        fs::create_dir_all(&artifact_directory)?;
        self.save(artifact_directory.join("config.json"))?;

        let tester = Tester {
            artifact_directory: artifact_directory.clone(),
            dataset: datasets.test,
            image_cap: self.evaluation_image_cap,
            metric_fidelity,
            renderer: renderer.clone(),
        };

        Ok(Experiment {
            trainer: Trainer {
                artifact_directory,
                config: self.clone(),
                dataset_train: datasets.train,
                device: device.clone(),
                progress_bar,
                renderer,
                tester: tester.clone(),
            },
            tester,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::BoundingBox;
    use burn::tensor::Distribution;

    type InnerBackend = burn::backend::NdArray;
    type Backend = burn::backend::Autodiff<InnerBackend>;

    fn synthetic_dataset(
        device: &<Backend as burn::tensor::backend::Backend>::Device,
    ) -> dataset::RayDataset<Backend> {
        let image_count = 3;
        let image_extent = 8;
        let count = image_count * image_extent * image_extent;

        // Inward-facing rays from a shell around the scene box.
        let origins = Tensor::random([count, 3], Distribution::Uniform(-0.2, 0.2), device)
            + Tensor::from_floats([[0.0, 0.0, -4.0]], device).expand([count, 3]);
        let directions =
            Tensor::random([count, 3], Distribution::Uniform(-0.1, 0.1), device)
                + Tensor::from_floats([[0.0, 0.0, 1.0]], device).expand([count, 3]);
        let colors = Tensor::random([count, 3], Distribution::Uniform(0.0, 1.0), device);

        dataset::RayDataset::from_parts(
            dataset::RayBundle {
                origins,
                directions,
                colors,
            },
            image_count,
            image_extent,
            BoundingBox::new([-1.5, -1.5, -1.5], [1.5, 1.5, 1.5]),
            false,
        )
        .unwrap()
    }

    fn tiny_config(artifact_directory: &str) -> ExperimentConfig {
        ExperimentConfig {
            artifact_directory: artifact_directory.into(),
            dataset: dataset::RayDatasetConfig {
                bounds_min: [-1.5, -1.5, -1.5],
                bounds_max: [1.5, 1.5, 1.5],
                white_background: false,
            },
            dataset_file_path_or_url: String::new(),
            train_ratio: 0.7,
            seed: Some(20211202),
            iteration_count: 11,
            batch_size: 16,
            upsample_checkpoints: vec![4],
            alpha_mask_checkpoints: vec![2, 6],
            ndc_rays: false,
            initial_voxel_count: 512,
            final_voxel_count: 4096,
            step_ratio: 0.5,
            max_samples_per_ray: 12,
            lr_spatial: 2e-2,
            lr_basis: 1e-3,
            lr_decay_target_ratio: 0.1,
            lr_decay_iterations: 0,
            lr_upsample_reset: true,
            patch_dilation: 0,
            model_kind: "cp".into(),
            field: field::TensorialFieldConfig {
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
            },
            renderer: renderer::RayRendererConfig {
                rays_per_chunk: 64,
                distance_range: 2.0..6.0,
            },
            adversarial: adversarial::AdversarialTrainerConfig {
                learning_rate: 1e-4,
                generator_cadence: 5,
                beta_1: 0.5,
                beta_2: 0.99,
                base_channels: 8,
            },
            photometric: loss::PhotometricLossConfig {
                ortho_weight: 1e-3,
                l1_weight_initial: 8e-5,
                l1_weight_rest: 4e-5,
                tv_weight_density: 0.01,
                tv_weight_app: 0.001,
            },
            progress_refresh_rate: 4,
            evaluation_cadence: 5,
            evaluation_image_cap: 1,
            resume_checkpoint: None,
        }
    }

    #[test]
    fn unknown_model_tags_fail_at_setup() {
        let device = Default::default();
        let mut config = tiny_config("/tmp/adversarial-tensorf-tag-test");
        config.model_kind = "vm-split".into();
        assert!(config
            .init_with_dataset::<Backend>(synthetic_dataset(&device), &device)
            .is_err());
    }

    #[test]
    fn a_tiny_run_trains_and_checkpoints() {
        let device = Default::default();
        let directory =
            std::env::temp_dir().join("adversarial-tensorf-experiment-test");
        let _ = fs::remove_dir_all(&directory);

        let config = tiny_config(directory.to_str().unwrap());
        let experiment = config
            .init_with_dataset::<Backend>(synthetic_dataset(&device), &device)
            .unwrap();

        let trained = experiment.trainer.train().unwrap();

        // The upsample checkpoint took effect.
        assert!(trained.resolution().iter().all(|&extent| extent >= 8));

        // The checkpoint reloads into an equivalent field.
        let (restored, manifest) = field::load_field::<InnerBackend>(
            &directory.join("checkpoint"),
            &Default::default(),
        )
        .unwrap();
        assert_eq!(manifest.kind, "cp");
        assert_eq!(restored.resolution(), trained.resolution());
        assert_eq!(restored.bounds(), trained.bounds());

        let _ = fs::remove_dir_all(&directory);
    }
}
