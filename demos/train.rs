extern crate adversarial_tensorf;

use adversarial_tensorf::prelude::*;

fn main() -> anyhow::Result<()> {
    type InnerBackend = backend::Wgpu;
    type Backend = backend::Autodiff<InnerBackend>;

    let device = backend::wgpu::WgpuDevice::default();

    let experiment = experiment::ExperimentConfig::new(
        "artifacts/lego".into(),
        dataset::RayDatasetConfig::new([-1.5, -1.5, -1.5], [1.5, 1.5, 1.5])
            .with_white_background(true),
        "resources/lego-tiny/data.npz".into(),
        field::TensorialFieldConfig::new(encoder::FrequencyEncoderConfig::new(2)),
        renderer::RayRendererConfig::new(4096, 2.0..6.0),
        adversarial::AdversarialTrainerConfig::new(),
        loss::PhotometricLossConfig::new()
            .with_tv_weight_density(0.1)
            .with_tv_weight_app(0.01),
    )
    .with_seed(Some(20211202))
    .with_iteration_count(15000)
    .with_batch_size(256)
    .with_patch_dilation(2)
    .with_upsample_checkpoints(vec![2000, 3000, 4000, 5500, 7000])
    .with_alpha_mask_checkpoints(vec![2000, 4000])
    .with_initial_voxel_count(128 * 128 * 128)
    .with_final_voxel_count(300 * 300 * 300)
    .with_evaluation_cadence(5000)
    .init::<Backend>(&device)?;

    let field = experiment.trainer.train()?;

    let sample_count =
        schedule::samples_for_resolution(field.resolution(), 0.5, 1024);
    experiment.tester.test(&field, sample_count)?;

    Ok(())
}
