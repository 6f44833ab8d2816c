use crate::*;
use anyhow::{bail, Result};
use burn::{prelude::*, tensor::Distribution};
use std::ops::Range;

#[derive(Config, Debug)]
pub struct RayRendererConfig {
    pub rays_per_chunk: usize,
    pub distance_range: Range<f64>,
}

/// Chunked volume renderer over flat ray batches: stratified depths
/// between the near and far planes, alpha compositing with cumulative
/// transmittance, optional white-background blending.
#[derive(Clone, Debug)]
pub struct RayRenderer {
    chunk_size: usize,
    near: f32,
    far: f32,
}

#[derive(Clone, Debug)]
pub struct RenderOutput<B: Backend> {
    pub colors: Tensor<B, 2>,
    pub opacities: Tensor<B, 1>,
    pub depths: Tensor<B, 1>,
}

impl RayRendererConfig {
    pub fn init(&self) -> Result<RayRenderer> {
        if self.rays_per_chunk == 0 {
            bail!("Ray count per chunk must be greater than 0");
        }
        if self.distance_range.end <= self.distance_range.start {
            bail!("Render distance range must not be empty");
        }
        Ok(RayRenderer {
            chunk_size: self.rays_per_chunk,
            near: self.distance_range.start as f32,
            far: self.distance_range.end as f32,
        })
    }
}

impl RayRenderer {
    pub fn render<B: Backend>(
        &self,
        origins: Tensor<B, 2>,
        directions: Tensor<B, 2>,
        field: &field::TensorialField<B>,
        sample_count: usize,
        white_background: bool,
        jittered: bool,
    ) -> RenderOutput<B> {
        let count = origins.dims()[0];
        let chunk_count = count.div_ceil(self.chunk_size).max(1);

        let mut colors = Vec::with_capacity(chunk_count);
        let mut opacities = Vec::with_capacity(chunk_count);
        let mut depths = Vec::with_capacity(chunk_count);

        for (origins, directions) in origins
            .chunk(chunk_count, 0)
            .into_iter()
            .zip(directions.chunk(chunk_count, 0))
        {
            let output = self.render_chunk(
                origins,
                directions,
                field,
                sample_count.max(2),
                white_background,
                jittered,
            );
            colors.push(output.colors);
            opacities.push(output.opacities);
            depths.push(output.depths);
        }

        RenderOutput {
            colors: Tensor::cat(colors, 0),
            opacities: Tensor::cat(opacities, 0),
            depths: Tensor::cat(depths, 0),
        }
    }

    fn render_chunk<B: Backend>(
        &self,
        origins: Tensor<B, 2>,
        directions: Tensor<B, 2>,
        field: &field::TensorialField<B>,
        sample_count: usize,
        white_background: bool,
        jittered: bool,
    ) -> RenderOutput<B> {
        let count = origins.dims()[0];
        let device = origins.device();
        let step = (self.far - self.near) / sample_count as f32;

        let distances = {
            let base = Tensor::arange(0..sample_count as i64, &device)
                .float()
                .mul_scalar(step)
                .add_scalar(self.near)
                .unsqueeze_dim::<2>(0);
            if jittered {
                base + Tensor::random(
                    [count, sample_count],
                    Distribution::Uniform(0.0, step as f64),
                    &device,
                )
            } else {
                base.expand([count, sample_count])
            }
        };

        let positions = (origins.unsqueeze_dim::<3>(1)
            + directions.clone().unsqueeze_dim::<3>(1)
                * distances.clone().unsqueeze_dim::<3>(2))
        .reshape([-1, 3]);
        let flat_directions = directions
            .unsqueeze_dim::<3>(1)
            .expand([count, sample_count, 3])
            .reshape([-1, 3]);

        let density = field
            .density_at(positions.clone())
            .reshape([count as i32, sample_count as i32]);
        let samples = field
            .rgb_at(positions, flat_directions)
            .reshape([count as i32, sample_count as i32, 3]);

        let deltas = Tensor::cat(
            vec![
                distances.clone().slice([0..count, 1..sample_count])
                    - distances.clone().slice([0..count, 0..sample_count - 1]),
                Tensor::full([count, 1], 1e9, &device),
            ],
            1,
        );

        let translucency = (density * deltas)
            .mul_scalar(-field.distance_scale())
            .exp();

        let cumulative_translucency = {
            let mut product = translucency.clone().add_scalar(1e-9);
            for index in 1..sample_count {
                product = product.clone().slice_assign(
                    [0..count, index..index + 1],
                    product.clone().slice([0..count, index - 1..index])
                        * product.slice([0..count, index..index + 1]),
                );
            }
            product
        };

        let weights =
            (translucency.neg().add_scalar(1.0)) * cumulative_translucency;

        let colors = (samples * weights.clone().unsqueeze_dim::<3>(2))
            .sum_dim(1)
            .squeeze::<2>(1);
        let opacities = weights.clone().sum_dim(1).squeeze::<1>(1);
        let depths = (weights * distances).sum_dim(1).squeeze::<1>(1);

        let colors = if white_background {
            colors + opacities.clone().neg().add_scalar(1.0).unsqueeze_dim::<2>(1)
        } else {
            colors
        };

        RenderOutput {
            colors,
            opacities,
            depths,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Backend = burn::backend::NdArray;

    fn renderer() -> RayRenderer {
        RayRendererConfig {
            rays_per_chunk: 16,
            distance_range: 2.0..6.0,
        }
        .init()
        .unwrap()
    }

    fn test_field(
        density_shift: f64,
        device: &<Backend as burn::prelude::Backend>::Device,
    ) -> field::TensorialField<Backend> {
        let config = field::TensorialFieldConfig {
            density_components: 4,
            appearance_components: 6,
            appearance_features: 8,
            head_hidden_size: 16,
            direction_encoder: encoder::FrequencyEncoderConfig {
                band_count: 2,
            },
            density_shift,
            alpha_threshold: 1e-4,
            distance_scale: 25.0,
        };
        config
            .init(
                field::BoundingBox::new([-1.5, -1.5, -1.5], [1.5, 1.5, 1.5]),
                [8, 8, 8],
                device,
            )
            .unwrap()
    }

    #[test]
    fn renderer_rejects_degenerate_configs() {
        assert!(RayRendererConfig {
            rays_per_chunk: 0,
            distance_range: 2.0..6.0,
        }
        .init()
        .is_err());
        assert!(RayRendererConfig {
            rays_per_chunk: 16,
            distance_range: 6.0..2.0,
        }
        .init()
        .is_err());
    }

    #[test]
    fn rendered_batches_keep_their_shape() {
        let device = Default::default();
        let field = test_field(0.0, &device);

        let origins =
            Tensor::random([37, 3], burn::tensor::Distribution::Default, &device);
        let directions = Tensor::random(
            [37, 3],
            burn::tensor::Distribution::Uniform(-1.0, 1.0),
            &device,
        );

        let output = renderer().render(origins, directions, &field, 9, false, true);
        assert_eq!(output.colors.dims(), [37, 3]);
        assert_eq!(output.opacities.dims(), [37]);
        assert_eq!(output.depths.dims(), [37]);
    }

    #[test]
    fn empty_space_renders_to_the_background() {
        let device = Default::default();
        let field = test_field(-40.0, &device);

        let origins = Tensor::from_floats([[0.0, 0.0, -4.0]], &device);
        let directions = Tensor::from_floats([[0.0, 0.0, 1.0]], &device);

        let output = renderer().render(
            origins.clone(),
            directions.clone(),
            &field,
            16,
            false,
            false,
        );
        let opacity: f32 = output.opacities.into_scalar();
        assert!(opacity < 1e-3);
        let color_sum: f32 = output.colors.sum().into_scalar();
        assert!(color_sum < 1e-3);

        let white = renderer().render(origins, directions, &field, 16, true, false);
        let color_sum: f32 = white.colors.sum().into_scalar();
        assert!((color_sum - 3.0).abs() < 1e-2);
    }
}
