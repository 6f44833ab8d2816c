use anyhow::{bail, Result};
use burn::{
    nn::{self, PaddingConfig2d},
    prelude::*,
    tensor::activation,
};

#[derive(Config, Debug)]
pub struct PatchDiscriminatorConfig {
    pub tile_extent: usize,
    #[config(default = 32)]
    pub base_channels: usize,
}

/// Binary real/fake classifier over square `[1, 3, h, h]` image tiles:
/// strided convolutions down to a small spatial footprint, then a
/// single-logit head.
#[derive(Debug, Module)]
pub struct PatchDiscriminator<B: Backend> {
    convolutions: Vec<nn::conv::Conv2d<B>>,
    head: nn::Linear<B>,
    tile_extent: usize,
}

impl PatchDiscriminatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<PatchDiscriminator<B>> {
        if self.tile_extent < 2 {
            bail!("Discriminator tile extent must be at least 2");
        }
        if self.base_channels == 0 {
            bail!("Discriminator channel count must be greater than 0");
        }

        let strided = |input: usize, output: usize| {
            nn::conv::Conv2dConfig::new([input, output], [3, 3])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        let mut convolutions = vec![strided(3, self.base_channels)];
        let mut extent = self.tile_extent.div_ceil(2);
        let mut channels = self.base_channels;
        while extent > 4 {
            convolutions.push(strided(channels, (channels * 2).min(256)));
            channels = (channels * 2).min(256);
            extent = extent.div_ceil(2);
        }

        Ok(PatchDiscriminator {
            convolutions,
            head: nn::LinearConfig::new(channels * extent * extent, 1).init(device),
            tile_extent: self.tile_extent,
        })
    }
}

impl<B: Backend> PatchDiscriminator<B> {
    pub fn tile_extent(&self) -> usize {
        self.tile_extent
    }

    /// Per-tile real/fake logits, shape `[tiles, 1]`.
    pub fn forward(&self, tiles: Tensor<B, 4>) -> Tensor<B, 2> {
        let count = tiles.dims()[0];

        let mut features = tiles;
        for convolution in self.convolutions.iter() {
            features = activation::relu(convolution.forward(features));
        }

        self.head.forward(features.reshape([count as i32, -1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type Backend = burn::backend::NdArray;

    #[test]
    fn logits_come_out_one_per_tile() {
        let device = Default::default();

        for tile_extent in [2, 7, 16, 32] {
            let discriminator = PatchDiscriminatorConfig {
                tile_extent,
                base_channels: 8,
            }
            .init::<Backend>(&device)
            .unwrap();

            let tiles = Tensor::random(
                [2, 3, tile_extent, tile_extent],
                Distribution::Default,
                &device,
            );
            let logits = discriminator.forward(tiles);
            assert_eq!(logits.dims(), [2, 1]);

            let values: Vec<f32> = logits.into_data().to_vec().unwrap();
            assert!(values.iter().all(|value| value.is_finite()));
        }
    }

    #[test]
    fn degenerate_tiles_are_rejected() {
        let device = Default::default();
        assert!(PatchDiscriminatorConfig {
            tile_extent: 1,
            base_channels: 8,
        }
        .init::<Backend>(&device)
        .is_err());
    }
}
