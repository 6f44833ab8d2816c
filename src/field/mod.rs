use crate::*;

use anyhow::{bail, Result};
use burn::{
    module::{Ignored, Param, ParamId},
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkGzFileRecorder},
    tensor::{activation, Distribution, TensorData},
};
use schedule::VolumeResolution;
use std::{fs, path::Path};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl BoundingBox {
    pub fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self {
            min,
            max,
        }
    }

    pub fn extents(&self) -> [f32; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    pub fn encloses(&self, other: &BoundingBox) -> bool {
        (0..3).all(|axis| {
            self.min[axis] <= other.min[axis] && other.max[axis] <= self.max[axis]
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldKind {
    ComponentProduct,
}

/// Known radiance-field kinds, looked up from the configured model tag.
const FIELD_REGISTRY: &[(&str, FieldKind)] = &[
    ("cp", FieldKind::ComponentProduct),
    ("component-product", FieldKind::ComponentProduct),
];

impl FieldKind {
    pub fn from_tag(tag: &str) -> Result<Self> {
        match FIELD_REGISTRY.iter().find(|(known, _)| *known == tag) {
            Some((_, kind)) => Ok(*kind),
            None => {
                let known: Vec<&str> =
                    FIELD_REGISTRY.iter().map(|(tag, _)| *tag).collect();
                bail!(
                    "Unknown radiance-field kind '{}' (known kinds: {})",
                    tag,
                    known.join(", ")
                )
            }
        }
    }

    pub fn init<B: Backend>(
        &self,
        config: &TensorialFieldConfig,
        bounds: BoundingBox,
        resolution: VolumeResolution,
        device: &B::Device,
    ) -> Result<TensorialField<B>> {
        match self {
            FieldKind::ComponentProduct => config.init(bounds, resolution, device),
        }
    }
}

#[derive(Config, Debug)]
pub struct TensorialFieldConfig {
    #[config(default = 16)]
    pub density_components: usize,
    #[config(default = 48)]
    pub appearance_components: usize,
    #[config(default = 27)]
    pub appearance_features: usize,
    #[config(default = 128)]
    pub head_hidden_size: usize,
    pub direction_encoder: encoder::FrequencyEncoderConfig,
    #[config(default = -10.0)]
    pub density_shift: f64,
    #[config(default = 1e-4)]
    pub alpha_threshold: f64,
    #[config(default = 25.0)]
    pub distance_scale: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct FieldSettings {
    pub density_shift: f32,
    pub alpha_threshold: f32,
    pub distance_scale: f32,
}

/// Occupancy grid derived from the density field, sampled over the
/// bounds it was computed with.
#[derive(Debug, Module)]
pub struct AlphaMask<B: Backend> {
    values: Tensor<B, 3>,
    bounds: Ignored<BoundingBox>,
}

/// Radiance field factored into per-axis component lines (a rank
/// decomposition of the scene volume): density is the summed product of
/// the density lines, appearance features are projected through a basis
/// layer and decoded with a view-conditioned head.
#[derive(Debug, Module)]
pub struct TensorialField<B: Backend> {
    density_lines: Vec<Param<Tensor<B, 2>>>,
    appearance_lines: Vec<Param<Tensor<B, 2>>>,
    basis: nn::Linear<B>,
    head_hidden: nn::Linear<B>,
    head_output: nn::Linear<B>,
    direction_encoder: encoder::FrequencyEncoder<B>,
    bounds: Ignored<BoundingBox>,
    resolution: Ignored<VolumeResolution>,
    alpha_mask: Option<AlphaMask<B>>,
    settings: Ignored<FieldSettings>,
}

impl TensorialFieldConfig {
    pub fn init<B: Backend>(
        &self,
        bounds: BoundingBox,
        resolution: VolumeResolution,
        device: &B::Device,
    ) -> Result<TensorialField<B>> {
        if self.density_components == 0 || self.appearance_components == 0 {
            bail!("Component counts must be greater than 0");
        }
        if resolution.iter().any(|&extent| extent < 2) {
            bail!("Grid resolution must be at least 2 per axis");
        }
        if (0..3).any(|axis| bounds.max[axis] <= bounds.min[axis]) {
            bail!("Scene bounds must have positive extent on every axis");
        }

        let component_lines = |count: usize| -> Vec<Param<Tensor<B, 2>>> {
            (0..3)
                .map(|axis| {
                    Param::from_tensor(Tensor::random(
                        [count, resolution[axis]],
                        Distribution::Normal(0.0, 0.1),
                        device,
                    ))
                })
                .collect()
        };

        let head_input_size =
            self.appearance_features + self.direction_encoder.output_size(3);

        Ok(TensorialField {
            density_lines: component_lines(self.density_components),
            appearance_lines: component_lines(self.appearance_components),
            basis: nn::LinearConfig::new(
                self.appearance_components,
                self.appearance_features,
            )
            .with_bias(false)
            .init(device),
            head_hidden: nn::LinearConfig::new(
                head_input_size,
                self.head_hidden_size,
            )
            .init(device),
            head_output: nn::LinearConfig::new(self.head_hidden_size, 3).init(device),
            direction_encoder: self.direction_encoder.init(device)?,
            bounds: Ignored(bounds),
            resolution: Ignored(resolution),
            alpha_mask: None,
            settings: Ignored(FieldSettings {
                density_shift: self.density_shift as f32,
                alpha_threshold: self.alpha_threshold as f32,
                distance_scale: self.distance_scale as f32,
            }),
        })
    }
}

impl<B: Backend> TensorialField<B> {
    pub fn bounds(&self) -> BoundingBox {
        self.bounds.0
    }

    pub fn resolution(&self) -> VolumeResolution {
        self.resolution.0
    }

    pub fn alpha_bounds(&self) -> Option<BoundingBox> {
        self.alpha_mask.as_ref().map(|mask| mask.bounds.0)
    }

    pub fn alpha_mask_resolution(&self) -> Option<VolumeResolution> {
        self.alpha_mask.as_ref().map(|mask| mask.values.dims())
    }

    pub fn distance_scale(&self) -> f32 {
        self.settings.0.distance_scale
    }

    fn device(&self) -> B::Device {
        self.density_lines[0].val().device()
    }

    /// Parameters of the spatial component lines, optimized at the
    /// spatial learning rate.
    pub fn spatial_param_ids(&self) -> Vec<ParamId> {
        self.density_lines
            .iter()
            .chain(self.appearance_lines.iter())
            .map(|line| line.id)
            .collect()
    }

    /// Parameters of the basis projection and the appearance head,
    /// optimized at the basis learning rate.
    pub fn basis_param_ids(&self) -> Vec<ParamId> {
        let mut ids = vec![
            self.basis.weight.id,
            self.head_hidden.weight.id,
            self.head_output.weight.id,
        ];
        for bias in [&self.head_hidden.bias, &self.head_output.bias] {
            if let Some(bias) = bias {
                ids.push(bias.id);
            }
        }
        ids
    }

    fn sample_lines(
        lines: &[Param<Tensor<B, 2>>],
        points: &Tensor<B, 2>,
        bounds: &BoundingBox,
        resolution: &VolumeResolution,
    ) -> Tensor<B, 2> {
        let count = points.dims()[0];
        let mut product: Option<Tensor<B, 2>> = None;

        for (axis, line) in lines.iter().enumerate() {
            let extent = resolution[axis];
            let span = bounds.max[axis] - bounds.min[axis];
            let coordinate = points
                .clone()
                .slice([0..count, axis..axis + 1])
                .squeeze::<1>(1);
            let position = (coordinate.sub_scalar(bounds.min[axis]))
                .div_scalar(span)
                .mul_scalar((extent - 1) as f32);

            let sample = interpolate_line(line.val(), position);
            product = Some(match product {
                None => sample,
                Some(product) => product * sample,
            });
        }

        product.expect("component lines cover three axes")
    }

    /// Volume density at world-space points, shape `[count]`.
    pub fn density_at(&self, points: Tensor<B, 2>) -> Tensor<B, 1> {
        let components = Self::sample_lines(
            &self.density_lines,
            &points,
            &self.bounds.0,
            &self.resolution.0,
        );
        let raw = components.sum_dim(0).squeeze::<1>(0);
        activation::softplus(raw.add_scalar(self.settings.0.density_shift), 1.0)
    }

    /// View-dependent color at world-space points, shape `[count, 3]`.
    pub fn rgb_at(&self, points: Tensor<B, 2>, directions: Tensor<B, 2>) -> Tensor<B, 2> {
        let features = Self::sample_lines(
            &self.appearance_lines,
            &points,
            &self.bounds.0,
            &self.resolution.0,
        )
        .swap_dims(0, 1);
        let features = self.basis.forward(features);

        let encoded = self.direction_encoder.forward(directions);
        let hidden = activation::relu(
            self.head_hidden.forward(Tensor::cat(vec![features, encoded], 1)),
        );
        activation::sigmoid(self.head_output.forward(hidden))
    }

    /// Orthogonality penalty over the component lines: the mean absolute
    /// off-diagonal of each line set's Gram matrix.
    pub fn vector_component_diffs(&self) -> Tensor<B, 1> {
        let device = self.device();
        let mut penalty = Tensor::zeros([1], &device);

        for line in self.density_lines.iter().chain(self.appearance_lines.iter()) {
            let values = line.val();
            let [components, _] = values.dims();
            let norms = (values.clone() * values.clone())
                .sum_dim(1)
                .sqrt()
                .add_scalar(1e-8);
            let normalized = values / norms;
            let gram = normalized.clone().matmul(normalized.transpose());
            penalty = penalty
                + (gram - identity_matrix::<B>(components, &device)).abs().mean();
        }

        penalty
    }

    pub fn density_l1(&self) -> Tensor<B, 1> {
        let mut penalty = Tensor::zeros([1], &self.device());
        for line in self.density_lines.iter() {
            penalty = penalty + line.val().abs().mean();
        }
        penalty
    }

    pub fn tv_loss_density(&self) -> Tensor<B, 1> {
        line_total_variation(&self.density_lines, &self.device())
    }

    pub fn tv_loss_app(&self) -> Tensor<B, 1> {
        line_total_variation(&self.appearance_lines, &self.device())
    }

    /// Keeps the rays whose segments intersect the active bounds
    /// (`bounds_only`) or the alpha-masked region, probing the occupancy
    /// grid along each surviving segment in the latter mode.
    pub fn filter_rays(
        &self,
        origins: Tensor<B, 2>,
        directions: Tensor<B, 2>,
        colors: Tensor<B, 2>,
        bounds_only: bool,
    ) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
        let device = origins.device();
        let bounds = if bounds_only {
            self.bounds.0
        } else {
            self.alpha_bounds().unwrap_or(self.bounds.0)
        };

        let count = origins.dims()[0];
        let min = Tensor::<B, 1>::from_floats(bounds.min.as_slice(), &device)
            .unsqueeze_dim::<2>(0);
        let max = Tensor::<B, 1>::from_floats(bounds.max.as_slice(), &device)
            .unsqueeze_dim::<2>(0);

        let degenerate = directions.clone().abs().lower_elem(1e-6);
        let safe_directions = directions.clone().mask_fill(degenerate, 1e-6);

        let enter = (min - origins.clone()) / safe_directions.clone();
        let exit = (max - origins.clone()) / safe_directions;
        let near = enter.clone().min_pair(exit.clone()).max_dim(1);
        let far = enter.max_pair(exit).min_dim(1);

        let keep = Tensor::cat(
            vec![
                near.clone().lower_equal(far.clone()),
                far.clone().greater_elem(0.0),
            ],
            1,
        )
        .all_dim(1);

        let keep = match (bounds_only, self.alpha_mask.as_ref()) {
            (false, Some(mask)) => Tensor::cat(
                vec![
                    keep,
                    mask.ray_probe(
                        origins.clone(),
                        directions.clone(),
                        near.clamp_min(0.0),
                        far,
                    ),
                ],
                1,
            )
            .all_dim(1),
            _ => keep,
        };

        let kept = keep.squeeze::<1>(1).argwhere().squeeze::<1>(1);
        let kept_count = kept.dims()[0];
        log::info!(
            "Ray filtering kept {}/{} rays ({:.1}%)",
            kept_count,
            count,
            100.0 * kept_count as f64 / count as f64
        );

        (
            origins.select(0, kept.clone()),
            directions.select(0, kept.clone()),
            colors.select(0, kept),
        )
    }

    /// Rebuilds the occupancy grid at `resolution` over the current
    /// bounds and returns the tight bounds of the occupied region.
    pub fn update_alpha_mask(
        mut self,
        resolution: VolumeResolution,
    ) -> (Self, BoundingBox) {
        let device = self.device();
        let bounds = self.bounds.0;
        let extents = bounds.extents();
        let [x_extent, y_extent, z_extent] = resolution;

        let axis_coordinates = |extent: usize, axis: usize| -> Tensor<B, 1> {
            Tensor::arange(0..extent as i64, &device)
                .float()
                .div_scalar((extent - 1) as f32)
                .mul_scalar(extents[axis])
                .add_scalar(bounds.min[axis])
        };
        let points = Tensor::stack::<4>(
            vec![
                axis_coordinates(x_extent, 0)
                    .reshape([x_extent as i32, 1, 1])
                    .expand([x_extent, y_extent, z_extent]),
                axis_coordinates(y_extent, 1)
                    .reshape([1, y_extent as i32, 1])
                    .expand([x_extent, y_extent, z_extent]),
                axis_coordinates(z_extent, 2)
                    .reshape([1, 1, z_extent as i32])
                    .expand([x_extent, y_extent, z_extent]),
            ],
            3,
        )
        .reshape([-1, 3]);

        let voxel_count = x_extent * y_extent * z_extent;
        let chunk_count = voxel_count.div_ceil(256 * 1024);
        let density = Tensor::cat(
            points
                .chunk(chunk_count, 0)
                .into_iter()
                .map(|chunk| self.density_at(chunk))
                .collect(),
            0,
        );

        let step = (extents[0] / x_extent as f32
            + extents[1] / y_extent as f32
            + extents[2] / z_extent as f32)
            / 3.0
            * self.settings.0.distance_scale;
        let alpha = density.mul_scalar(-step).exp().neg().add_scalar(1.0);
        let occupancy = alpha
            .greater_equal_elem(self.settings.0.alpha_threshold)
            .float()
            .reshape([x_extent as i32, y_extent as i32, z_extent as i32]);

        let occupied_range = |projection: Vec<f32>| -> Option<(usize, usize)> {
            let first = projection.iter().position(|&value| value > 0.5)?;
            let last = projection.iter().rposition(|&value| value > 0.5)?;
            Some((first, last))
        };
        let ranges = [
            occupied_range(
                occupancy
                    .clone()
                    .max_dim(2)
                    .max_dim(1)
                    .reshape([-1])
                    .into_data()
                    .to_vec()
                    .unwrap(),
            ),
            occupied_range(
                occupancy
                    .clone()
                    .max_dim(2)
                    .max_dim(0)
                    .reshape([-1])
                    .into_data()
                    .to_vec()
                    .unwrap(),
            ),
            occupied_range(
                occupancy
                    .clone()
                    .max_dim(1)
                    .max_dim(0)
                    .reshape([-1])
                    .into_data()
                    .to_vec()
                    .unwrap(),
            ),
        ];

        if ranges.iter().any(|range| range.is_none()) {
            log::warn!("Alpha-mask update found no occupied voxels; keeping bounds");
            return (self, bounds);
        }

        let mut tight = bounds;
        for axis in 0..3 {
            let (first, last) = ranges[axis].unwrap();
            let cell = extents[axis] / (resolution[axis] - 1) as f32;
            tight.min[axis] = bounds.min[axis] + first as f32 * cell;
            tight.max[axis] = bounds.min[axis] + last as f32 * cell;
        }

        self.alpha_mask = Some(AlphaMask {
            values: occupancy,
            bounds: Ignored(bounds),
        });
        (self, tight)
    }

    /// Crops the component lines to the voxel range covering `target`.
    pub fn shrink(mut self, target: BoundingBox) -> Self {
        let bounds = self.bounds.0;
        let resolution = self.resolution.0;
        let mut shrunk = bounds;
        let mut cropped = resolution;

        for axis in 0..3 {
            let extent = resolution[axis];
            let cell =
                (bounds.max[axis] - bounds.min[axis]) / (extent - 1) as f32;
            let first = (((target.min[axis] - bounds.min[axis]) / cell).floor()
                as isize)
                .clamp(0, extent as isize - 2) as usize;
            let last = (((target.max[axis] - bounds.min[axis]) / cell).ceil()
                as isize)
                .clamp(first as isize + 1, extent as isize - 1)
                as usize;

            let crop = |line: &Param<Tensor<B, 2>>| {
                let values = line.val().detach();
                let [components, _] = values.dims();
                Param::from_tensor(values.slice([0..components, first..last + 1]))
            };
            self.density_lines[axis] = crop(&self.density_lines[axis]);
            self.appearance_lines[axis] = crop(&self.appearance_lines[axis]);

            cropped[axis] = last - first + 1;
            shrunk.min[axis] = bounds.min[axis] + first as f32 * cell;
            shrunk.max[axis] = bounds.min[axis] + last as f32 * cell;
        }

        log::info!(
            "Shrunk field bounds to {:?}..{:?} at resolution {:?}",
            shrunk.min,
            shrunk.max,
            cropped
        );
        self.bounds = Ignored(shrunk);
        self.resolution = Ignored(cropped);
        self
    }

    /// Linearly resizes the component lines to a finer grid.
    pub fn upsample_volume_grid(mut self, resolution: VolumeResolution) -> Self {
        let device = self.device();
        let current = self.resolution.0;

        for axis in 0..3 {
            let target = resolution[axis];
            let positions = Tensor::arange(0..target as i64, &device)
                .float()
                .mul_scalar((current[axis] - 1) as f32 / (target - 1) as f32);

            let resize = |line: &Param<Tensor<B, 2>>| {
                Param::from_tensor(interpolate_line(
                    line.val().detach(),
                    positions.clone(),
                ))
            };
            self.density_lines[axis] = resize(&self.density_lines[axis]);
            self.appearance_lines[axis] = resize(&self.appearance_lines[axis]);
        }

        log::info!("Upsampled field grid {:?} -> {:?}", current, resolution);
        self.resolution = Ignored(resolution);
        self
    }

    fn without_alpha_mask(mut self) -> Self {
        self.alpha_mask = None;
        self
    }
}

impl<B: Backend> AlphaMask<B> {
    /// True per ray when any probe along `[near, far]` lands in an
    /// occupied voxel.
    fn ray_probe(
        &self,
        origins: Tensor<B, 2>,
        directions: Tensor<B, 2>,
        near: Tensor<B, 2>,
        far: Tensor<B, 2>,
    ) -> Tensor<B, 2, Bool> {
        const PROBE_COUNT: usize = 32;

        let device = origins.device();
        let count = origins.dims()[0];
        let bounds = self.bounds.0;
        let extents = bounds.extents();
        let [x_extent, y_extent, z_extent] = self.values.dims();

        let steps = Tensor::arange(0..PROBE_COUNT as i64, &device)
            .float()
            .div_scalar((PROBE_COUNT - 1) as f32)
            .unsqueeze_dim::<2>(0);
        let distances = near.clone() + (far - near) * steps;

        let voxel_index = |axis: usize, extent: usize| -> Tensor<B, 2, Int> {
            let position = origins.clone().slice([0..count, axis..axis + 1])
                + directions.clone().slice([0..count, axis..axis + 1])
                    * distances.clone();
            position
                .sub_scalar(bounds.min[axis])
                .div_scalar(extents[axis])
                .mul_scalar((extent - 1) as f32)
                .add_scalar(0.5)
                .floor()
                .int()
                .clamp(0, extent as i32 - 1)
        };

        let flat_index = (voxel_index(0, x_extent) * (y_extent as i32 * z_extent as i32)
            + voxel_index(1, y_extent) * z_extent as i32
            + voxel_index(2, z_extent))
        .reshape([-1]);

        self.values
            .clone()
            .reshape([-1])
            .select(0, flat_index)
            .reshape([count as i32, PROBE_COUNT as i32])
            .max_dim(1)
            .greater_elem(0.5)
    }
}

fn interpolate_line<B: Backend>(
    values: Tensor<B, 2>,
    positions: Tensor<B, 1>,
) -> Tensor<B, 2> {
    let extent = values.dims()[1];
    let positions = positions.clamp(0.0, (extent - 1) as f32);
    let lower = positions.clone().floor();
    let fraction = (positions - lower.clone()).unsqueeze_dim::<2>(0);
    let lower = lower.int();
    let upper = lower.clone().add_scalar(1).clamp(0, extent as i32 - 1);

    let start = values.clone().select(1, lower);
    let stop = values.select(1, upper);
    start.clone() + (stop - start) * fraction
}

fn identity_matrix<B: Backend>(size: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut values = vec![0.0f32; size * size];
    for index in 0..size {
        values[index * size + index] = 1.0;
    }
    Tensor::from_data(TensorData::new(values, [size, size]), device)
}

/// Everything needed to rebuild a field before loading its weights:
/// saved next to the record so a checkpoint is self-describing.
#[derive(Config, Debug)]
pub struct FieldCheckpoint {
    pub kind: String,
    pub field: TensorialFieldConfig,
    pub bounds_min: [f32; 3],
    pub bounds_max: [f32; 3],
    pub resolution: [usize; 3],
    pub mask_resolution: Option<[usize; 3]>,
}

impl FieldCheckpoint {
    pub fn capture<B: Backend>(
        field: &TensorialField<B>,
        config: &TensorialFieldConfig,
        kind_tag: &str,
    ) -> Self {
        Self {
            kind: kind_tag.into(),
            field: config.clone(),
            bounds_min: field.bounds().min,
            bounds_max: field.bounds().max,
            resolution: field.resolution(),
            mask_resolution: field.alpha_mask_resolution(),
        }
    }
}

pub fn save_field<B: Backend>(
    field: &TensorialField<B>,
    checkpoint: &FieldCheckpoint,
    directory: &Path,
) -> Result<()> {
    fs::create_dir_all(directory)?;
    checkpoint.save(directory.join("checkpoint.json"))?;
    field.clone().without_alpha_mask().save_file(
        directory.join("field"),
        &NamedMpkGzFileRecorder::<FullPrecisionSettings>::new(),
    )?;
    Ok(())
}

pub fn load_field<B: Backend>(
    directory: &Path,
    device: &B::Device,
) -> Result<(TensorialField<B>, FieldCheckpoint)> {
    let checkpoint = FieldCheckpoint::load(directory.join("checkpoint.json"))?;
    let kind = FieldKind::from_tag(&checkpoint.kind)?;
    let bounds = BoundingBox::new(checkpoint.bounds_min, checkpoint.bounds_max);

    let field = kind.init::<B>(&checkpoint.field, bounds, checkpoint.resolution, device)?;
    let field = field.load_file(
        directory.join("field"),
        &NamedMpkGzFileRecorder::<FullPrecisionSettings>::new(),
        device,
    )?;

    // The occupancy grid is derived data: rebuild it instead of
    // serializing it.
    let field = match checkpoint.mask_resolution {
        Some(resolution) => field.update_alpha_mask(resolution).0,
        None => field,
    };
    Ok((field, checkpoint))
}
