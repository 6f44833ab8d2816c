extern crate adversarial_tensorf;

use adversarial_tensorf::prelude::*;
use std::path::{Path, PathBuf};

fn main() -> anyhow::Result<()> {
    type InnerBackend = backend::Wgpu;
    type Backend = backend::Autodiff<InnerBackend>;

    let device = backend::wgpu::WgpuDevice::default();

    let checkpoint_directory = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "artifacts/lego/checkpoint".into());
    let dataset_path = std::env::args()
        .nth(2)
        .unwrap_or_else(|| "resources/lego-tiny/data.npz".into());

    if !Path::new(&checkpoint_directory)
        .join("checkpoint.json")
        .exists()
    {
        eprintln!("The checkpoint path does not exist: {}", checkpoint_directory);
        return Ok(());
    }

    let (field, manifest) =
        field::load_field::<InnerBackend>(Path::new(&checkpoint_directory), &device)?;
    eprintln!(
        "Loaded {} field at resolution {:?}",
        manifest.kind,
        field.resolution()
    );

    let dataset = dataset::RayDatasetConfig::new(
        manifest.bounds_min,
        manifest.bounds_max,
    )
    .init_from_file_path_or_url::<Backend>(&dataset_path, &device)?
    .split_for_training(0.875)
    .test;

    let tester = experiment::tester::Tester::new(
        PathBuf::from(&checkpoint_directory),
        dataset,
        renderer::RayRendererConfig::new(4096, 2.0..6.0).init()?,
        usize::MAX,
        &device,
    );

    let sample_count =
        schedule::samples_for_resolution(field.resolution(), 0.5, 1024);
    let evaluation = tester.test(&field, sample_count)?;
    if let Some(mean) = evaluation.mean_psnr {
        eprintln!("Mean PSNR over {} views: {:.2} dB", evaluation.items.len(), mean);
    }

    Ok(())
}
