use crate::field::BoundingBox;

use anyhow::{bail, Result};
use burn::{prelude::*, tensor::TensorData};
use npyz::{npz, NpyFile};
use regex::Regex;
use reqwest::IntoUrl;
use std::{fs::File, io, path::Path};
use zip::ZipArchive;

#[derive(Config, Debug)]
pub struct RayDatasetConfig {
    pub bounds_min: [f32; 3],
    pub bounds_max: [f32; 3],
    #[config(default = false)]
    pub white_background: bool,
}

/// Index-aligned ray arrays, one row per ray.
#[derive(Clone, Debug)]
pub struct RayBundle<B: Backend> {
    pub origins: Tensor<B, 2>,
    pub directions: Tensor<B, 2>,
    pub colors: Tensor<B, 2>,
}

impl<B: Backend> RayBundle<B> {
    pub fn len(&self) -> usize {
        self.origins.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn select(&self, indices: &[usize]) -> RayBundle<B> {
        let device = self.origins.device();
        let rows: Vec<i64> = indices.iter().map(|&index| index as i64).collect();
        let rows = Tensor::<B, 1, Int>::from_data(
            TensorData::new(rows, [indices.len()]),
            &device,
        );
        RayBundle {
            origins: self.origins.clone().select(0, rows.clone()),
            directions: self.directions.clone().select(0, rows.clone()),
            colors: self.colors.clone().select(0, rows),
        }
    }
}

/// Posed-image dataset flattened to per-ray arrays, image-major: each
/// image contributes `image_extent²` consecutive rays.
#[derive(Clone, Debug)]
pub struct RayDataset<B: Backend> {
    rays: RayBundle<B>,
    image_count: usize,
    image_extent: usize,
    bounds: BoundingBox,
    white_background: bool,
}

#[derive(Clone, Debug)]
pub struct RayDatasetSplit<B: Backend> {
    pub train: RayDataset<B>,
    pub test: RayDataset<B>,
}

impl RayDatasetConfig {
    pub fn init_from_reader<B: Backend, R: io::Read + io::Seek>(
        &self,
        reader: R,
        device: &B::Device,
    ) -> Result<RayDataset<B>> {
        let mut archive = ZipArchive::new(reader)?;

        let focal = *NpyFile::new(io::BufReader::new(
            archive.by_name(&npz::file_name_from_array_name("focal"))?,
        ))?
        .into_vec::<f64>()?
        .first()
        .ok_or(io::Error::from(io::ErrorKind::InvalidData))?
            as f32;

        let images = {
            let array = NpyFile::new(io::BufReader::new(
                archive.by_name(&npz::file_name_from_array_name("images"))?,
            ))?;
            let shape: Vec<usize> =
                array.shape().iter().map(|&extent| extent as usize).collect();
            Tensor::<B, 4>::from_data(
                TensorData::new(array.into_vec::<f32>()?, shape),
                device,
            )
        };

        let poses = {
            let array = NpyFile::new(io::BufReader::new(
                archive.by_name(&npz::file_name_from_array_name("poses"))?,
            ))?;
            let shape: Vec<usize> =
                array.shape().iter().map(|&extent| extent as usize).collect();
            Tensor::<B, 3>::from_data(
                TensorData::new(array.into_vec::<f32>()?, shape),
                device,
            )
        };

        let [image_count, height, width, channel_count] = images.dims();
        if poses.dims()[0] != image_count {
            bail!("Image and pose counts differ");
        }
        if channel_count != 3 {
            bail!("Images must have 3 color channels");
        }
        if height != width {
            bail!("Images must be square to support patch sampling");
        }

        let rays_per_image = height * width;

        // Camera-space pixel plane shared by every image.
        let plane = {
            let plane_x = (Tensor::arange(0..width as i64, device)
                .float()
                .unsqueeze_dim::<2>(0)
                .repeat_dim(0, height)
                - (width as f32) / 2.0)
                / focal;
            let plane_y = (-Tensor::arange(0..height as i64, device)
                .float()
                .unsqueeze_dim::<2>(1)
                .repeat_dim(1, width)
                + (height as f32) / 2.0)
                / focal;
            let plane_z = Tensor::full([height, width], -1.0, device);
            Tensor::<B, 2>::stack::<3>(vec![plane_x, plane_y, plane_z], 2)
                .reshape([-1, 3])
        };

        let mut origins = Vec::with_capacity(image_count);
        let mut directions = Vec::with_capacity(image_count);
        for image in 0..image_count {
            let rotation = poses
                .clone()
                .slice([image..image + 1, 0..3, 0..3])
                .reshape([3, 3]);
            let translation = poses
                .clone()
                .slice([image..image + 1, 0..3, 3..4])
                .reshape([1, 3]);

            directions.push(plane.clone().matmul(rotation.transpose()));
            origins.push(translation.repeat_dim(0, rays_per_image));
        }

        RayDataset::from_parts(
            RayBundle {
                origins: Tensor::cat(origins, 0),
                directions: Tensor::cat(directions, 0),
                colors: images.reshape([-1, 3]),
            },
            image_count,
            height,
            BoundingBox::new(self.bounds_min, self.bounds_max),
            self.white_background,
        )
    }

    pub fn init_from_file_path<B: Backend>(
        &self,
        file_path: impl AsRef<Path>,
        device: &B::Device,
    ) -> Result<RayDataset<B>> {
        self.init_from_reader(File::open(file_path)?, device)
    }

    pub fn init_from_url<B: Backend>(
        &self,
        url: impl IntoUrl,
        device: &B::Device,
    ) -> Result<RayDataset<B>> {
        self.init_from_reader(
            io::Cursor::new(
                reqwest::blocking::get(url)?.error_for_status()?.bytes()?,
            ),
            device,
        )
    }

    pub fn init_from_file_path_or_url<B: Backend>(
        &self,
        file_path_or_url: &str,
        device: &B::Device,
    ) -> Result<RayDataset<B>> {
        if Regex::new(r"https?://").unwrap().is_match(file_path_or_url) {
            self.init_from_url(file_path_or_url, device)
        } else {
            self.init_from_file_path(file_path_or_url, device)
        }
    }
}

impl<B: Backend> RayDataset<B> {
    pub fn from_parts(
        rays: RayBundle<B>,
        image_count: usize,
        image_extent: usize,
        bounds: BoundingBox,
        white_background: bool,
    ) -> Result<Self> {
        let expected = image_count * image_extent * image_extent;
        if rays.len() != expected
            || rays.directions.dims() != rays.origins.dims()
            || rays.colors.dims() != rays.origins.dims()
        {
            bail!(
                "Ray arrays must hold {} image-major rows of 3 columns",
                expected
            );
        }
        Ok(Self {
            rays,
            image_count,
            image_extent,
            bounds,
            white_background,
        })
    }

    pub fn rays(&self) -> RayBundle<B> {
        self.rays.clone()
    }

    pub fn ray_count(&self) -> usize {
        self.rays.len()
    }

    pub fn image_count(&self) -> usize {
        self.image_count
    }

    pub fn image_extent(&self) -> usize {
        self.image_extent
    }

    pub fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    pub fn white_background(&self) -> bool {
        self.white_background
    }

    /// The contiguous ray block of one image.
    pub fn rays_for_image(&self, image: usize) -> RayBundle<B> {
        let rays_per_image = self.image_extent * self.image_extent;
        let start = image * rays_per_image;
        let stop = start + rays_per_image;
        let columns = self.rays.origins.dims()[1];
        RayBundle {
            origins: self.rays.origins.clone().slice([start..stop, 0..columns]),
            directions: self
                .rays
                .directions
                .clone()
                .slice([start..stop, 0..columns]),
            colors: self.rays.colors.clone().slice([start..stop, 0..columns]),
        }
    }

    /// Splits at image granularity; the leading share becomes the
    /// training set.
    pub fn split_for_training(self, ratio: f32) -> RayDatasetSplit<B> {
        let train_images = ((ratio.clamp(0.0, 1.0) * self.image_count as f32)
            .round() as usize)
            .min(self.image_count);
        let rays_per_image = self.image_extent * self.image_extent;
        let boundary = train_images * rays_per_image;
        let total = self.rays.len();
        let columns = self.rays.origins.dims()[1];

        let part = |start: usize, stop: usize, image_count: usize| RayDataset {
            rays: RayBundle {
                origins: self.rays.origins.clone().slice([start..stop, 0..columns]),
                directions: self
                    .rays
                    .directions
                    .clone()
                    .slice([start..stop, 0..columns]),
                colors: self.rays.colors.clone().slice([start..stop, 0..columns]),
            },
            image_count,
            image_extent: self.image_extent,
            bounds: self.bounds,
            white_background: self.white_background,
        };

        RayDatasetSplit {
            train: part(0, boundary, train_images),
            test: part(boundary, total, self.image_count - train_images),
        }
    }
}
