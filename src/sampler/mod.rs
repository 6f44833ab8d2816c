use anyhow::{bail, Result};
use rand::{rngs::StdRng, seq::SliceRandom, Rng};

/// Draws disjoint batches from a shuffled permutation of `0..total`,
/// reshuffling whenever the next slice would overrun the range. The
/// trailing remainder of each pass is dropped.
pub struct UniformRaySampler {
    total: usize,
    batch: usize,
    cursor: usize,
    order: Vec<usize>,
    rng: StdRng,
}

impl UniformRaySampler {
    pub fn new(total: usize, batch: usize, rng: StdRng) -> Result<Self> {
        if batch == 0 {
            bail!("Batch size must be greater than 0");
        }
        if batch > total {
            bail!(
                "Batch size ({}) must not exceed the ray count ({})",
                batch,
                total
            );
        }
        Ok(Self {
            total,
            batch,
            // One past the last slice, so the first call reshuffles.
            cursor: total,
            order: (0..total).collect(),
            rng,
        })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn next_batch(&mut self) -> &[usize] {
        self.cursor += self.batch;
        if self.cursor + self.batch > self.total {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        &self.order[self.cursor..self.cursor + self.batch]
    }
}

/// Draws spatially contiguous square tiles of ray indices, one tile per
/// call, from a single image's block. Rays are assumed image-major: each
/// image owns `image_extent²` consecutive indices. A dilation of `d`
/// samples every `(d + 1)`-th ray along both tile axes.
pub struct GridPatchSampler {
    image_count: usize,
    rays_per_image: usize,
    image_extent: usize,
    tile_extent: usize,
    dilation: usize,
    horizontal_boundary: usize,
    vertical_boundary: usize,
    rng: StdRng,
}

impl GridPatchSampler {
    pub fn new(
        total: usize,
        batch: usize,
        image_count: usize,
        dilation: usize,
        rng: StdRng,
    ) -> Result<Self> {
        let tile_extent = match exact_square_root(batch) {
            Some(extent) if extent > 0 => extent,
            _ => bail!("Patch batch size ({}) must be a non-zero perfect square", batch),
        };
        if image_count == 0 || total % image_count != 0 {
            bail!(
                "Ray count ({}) must split evenly over {} images",
                total,
                image_count
            );
        }
        let rays_per_image = total / image_count;
        let image_extent = match exact_square_root(rays_per_image) {
            Some(extent) => extent,
            None => bail!(
                "Rays per image ({}) must form a square block",
                rays_per_image
            ),
        };

        // Largest top-left column such that the dilated tile still fits.
        let span = tile_extent + dilation * (tile_extent - 1);
        if span >= image_extent {
            bail!(
                "A {}x{} patch with dilation {} does not fit a {}x{} image",
                tile_extent,
                tile_extent,
                dilation,
                image_extent,
                image_extent
            );
        }
        let horizontal_boundary = image_extent - span;
        let vertical_boundary = horizontal_boundary * (image_extent + 1);

        Ok(Self {
            image_count,
            rays_per_image,
            image_extent,
            tile_extent,
            dilation,
            horizontal_boundary,
            vertical_boundary,
            rng,
        })
    }

    pub fn tile_extent(&self) -> usize {
        self.tile_extent
    }

    pub fn next_batch(&mut self) -> Vec<usize> {
        let image = self.rng.gen_range(0..self.image_count);

        let mut top_left = self.rng.gen_range(0..self.rays_per_image);
        while top_left % self.image_extent > self.horizontal_boundary
            || top_left > self.vertical_boundary
        {
            top_left = self.rng.gen_range(0..self.rays_per_image);
        }

        let stride = self.dilation + 1;
        let base = image * self.rays_per_image + top_left;
        let mut indices = Vec::with_capacity(self.tile_extent * self.tile_extent);
        for row in 0..self.tile_extent {
            let row_start = base + row * stride * self.image_extent;
            for column in 0..self.tile_extent {
                indices.push(row_start + column * stride);
            }
        }
        indices
    }
}

pub(crate) fn exact_square_root(value: usize) -> Option<usize> {
    let root = (value as f64).sqrt().round() as usize;
    if root * root == value {
        Some(root)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(20211202)
    }

    #[test]
    fn uniform_batches_partition_the_index_space() {
        let mut sampler = UniformRaySampler::new(400, 16, rng()).unwrap();

        let mut seen = BTreeSet::new();
        for _ in 0..25 {
            let batch = sampler.next_batch().to_vec();
            assert_eq!(batch.len(), 16);
            assert_eq!(batch.iter().collect::<BTreeSet<_>>().len(), 16);
            seen.extend(batch);
        }
        assert_eq!(seen, (0..400).collect::<BTreeSet<_>>());
    }

    #[test]
    fn uniform_sampler_drops_the_pass_remainder() {
        let mut sampler = UniformRaySampler::new(10, 3, rng()).unwrap();

        let mut seen = BTreeSet::new();
        for _ in 0..3 {
            seen.extend(sampler.next_batch().to_vec());
        }
        assert_eq!(seen.len(), 9);

        // The fourth call starts a fresh pass instead of serving the
        // one leftover index.
        let batch = sampler.next_batch().to_vec();
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn uniform_sampler_reshuffles_between_passes() {
        let mut sampler = UniformRaySampler::new(64, 64, rng()).unwrap();
        let first = sampler.next_batch().to_vec();
        let second = sampler.next_batch().to_vec();

        assert_eq!(
            first.iter().collect::<BTreeSet<_>>(),
            second.iter().collect::<BTreeSet<_>>()
        );
        assert_ne!(first, second);
    }

    #[test]
    fn uniform_sampler_rejects_oversized_batches() {
        assert!(UniformRaySampler::new(8, 16, rng()).is_err());
        assert!(UniformRaySampler::new(8, 0, rng()).is_err());
    }

    #[test]
    fn grid_tiles_stay_inside_one_image_block() {
        // 100 images of 7x7 rays, 2x2 tiles.
        let mut sampler = GridPatchSampler::new(4900, 4, 100, 0, rng()).unwrap();

        for _ in 0..200 {
            let indices = sampler.next_batch();
            assert_eq!(indices.len(), 4);
            assert!(indices.iter().all(|&index| index < 4900));

            let block = indices[0] / 49;
            assert!(indices.iter().all(|&index| index / 49 == block));

            let anchor = indices[0];
            assert_eq!(
                indices,
                vec![anchor, anchor + 1, anchor + 7, anchor + 8]
            );
        }
    }

    #[test]
    fn grid_dilation_stretches_the_tile_footprint() {
        let mut sampler = GridPatchSampler::new(4900, 4, 100, 1, rng()).unwrap();

        for _ in 0..200 {
            let indices = sampler.next_batch();
            let anchor = indices[0];
            assert_eq!(
                indices,
                vec![anchor, anchor + 2, anchor + 14, anchor + 16]
            );
            assert!(indices.iter().all(|&index| index / 49 == anchor / 49));
        }
    }

    #[test]
    fn grid_sampler_rejects_tiles_that_cannot_fit() {
        // 3x3 tile dilated by 2 spans 7 rays: as wide as the image.
        assert!(GridPatchSampler::new(4900, 9, 100, 2, rng()).is_err());
    }

    #[test]
    fn grid_sampler_rejects_non_square_batches() {
        assert!(GridPatchSampler::new(4900, 5, 100, 0, rng()).is_err());
    }

    #[test]
    fn grid_sampler_rejects_ragged_ray_layouts() {
        assert!(GridPatchSampler::new(4899, 4, 100, 0, rng()).is_err());
        assert!(GridPatchSampler::new(4800, 4, 100, 0, rng()).is_err());
    }
}
