use crate::*;

use anyhow::{anyhow, Result};
use burn::{
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use std::{fs, path::PathBuf};

/// Renders the held-out views through the current field, reports their
/// PSNR, and dumps the renders as PNGs.
#[derive(Clone, Debug)]
pub struct Tester<B: AutodiffBackend> {
    pub(super) artifact_directory: PathBuf,
    pub(super) dataset: dataset::RayDataset<B>,
    pub(super) image_cap: usize,
    pub(super) metric_fidelity: metric::PsnrMetric<B::InnerBackend>,
    pub(super) renderer: renderer::RayRenderer,
}

#[derive(Config, Debug)]
pub struct EvaluationOutput {
    pub items: Vec<EvaluationOutputItem>,
    pub mean_psnr: Option<f64>,
}

#[derive(Config, Debug)]
pub struct EvaluationOutputItem {
    pub index: usize,
    pub fidelity: f64,
}

impl<B: AutodiffBackend> Tester<B> {
    /// Standalone construction for render-only workflows; training
    /// builds its tester through `ExperimentConfig::init`.
    pub fn new(
        artifact_directory: PathBuf,
        dataset: dataset::RayDataset<B>,
        renderer: renderer::RayRenderer,
        image_cap: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            artifact_directory,
            dataset,
            image_cap,
            metric_fidelity: metric::PsnrMetric::init(device),
            renderer,
        }
    }

    /// Final evaluation: renders every capped view and persists the
    /// summary next to the renders.
    pub fn test(
        &self,
        field: &field::TensorialField<B::InnerBackend>,
        sample_count: usize,
    ) -> Result<EvaluationOutput> {
        let output = self.test_with_prefix(field, sample_count, "")?;
        output.save(self.artifact_directory.join("evaluation-output.json"))?;
        Ok(output)
    }

    pub(super) fn test_with_prefix(
        &self,
        field: &field::TensorialField<B::InnerBackend>,
        sample_count: usize,
        prefix: &str,
    ) -> Result<EvaluationOutput> {
        let count = self.dataset.image_count().min(self.image_cap);
        let extent = self.dataset.image_extent();
        let white_background = self.dataset.white_background();

        let render_directory = self.artifact_directory.join("renders");
        fs::create_dir_all(&render_directory)?;

        let mut items = Vec::with_capacity(count);
        for index in 0..count {
            let rays = self.dataset.rays_for_image(index);

            let output = self.renderer.render(
                rays.origins.inner(),
                rays.directions.inner(),
                field,
                sample_count,
                white_background,
                false,
            );

            let fidelity: f64 = self
                .metric_fidelity
                .forward(output.colors.clone(), rays.colors.inner())
                .into_scalar()
                .elem();
            items.push(EvaluationOutputItem {
                index,
                fidelity,
            });

            save_png(
                &render_directory.join(format!("{}{:03}.png", prefix, index)),
                output.colors,
                extent,
            )?;
        }

        let mean_psnr = if items.is_empty() {
            None
        } else {
            Some(
                items.iter().map(|item| item.fidelity).sum::<f64>()
                    / items.len() as f64,
            )
        };

        Ok(EvaluationOutput {
            items,
            mean_psnr,
        })
    }
}

fn save_png<B: Backend>(
    path: &std::path::Path,
    colors: Tensor<B, 2>,
    extent: usize,
) -> Result<()> {
    let values: Vec<f32> = colors
        .clamp(0.0, 1.0)
        .mul_scalar(255.0)
        .into_data()
        .to_vec()
        .map_err(|error| anyhow!("{:?}", error))?;
    let bytes: Vec<u8> = values.into_iter().map(|value| value as u8).collect();

    let image = image::RgbImage::from_raw(extent as u32, extent as u32, bytes)
        .ok_or_else(|| anyhow!("Rendered image has the wrong size"))?;
    image.save(path)?;
    Ok(())
}
