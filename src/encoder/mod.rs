use anyhow::{bail, Result};
use burn::prelude::*;
use std::f32::consts::PI;

#[derive(Config, Debug)]
pub struct FrequencyEncoderConfig {
    pub band_count: usize,
}

/// Sinusoidal feature expansion of input coordinates: the identity plus
/// sine and cosine at octave-spaced frequencies.
#[derive(Debug, Module)]
pub struct FrequencyEncoder<B: Backend> {
    frequencies: Tensor<B, 3>,
}

impl FrequencyEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<FrequencyEncoder<B>> {
        if self.band_count == 0 {
            bail!("Frequency band count must be greater than 0");
        }

        let bands: Vec<f32> = (0..self.band_count)
            .map(|level| 2.0f32.powi(level as i32) * PI)
            .collect();
        let frequencies = Tensor::<B, 1>::from_floats(bands.as_slice(), device)
            .reshape([1, self.band_count, 1]);

        Ok(FrequencyEncoder {
            frequencies,
        })
    }

    pub fn output_size(&self, input_size: usize) -> usize {
        input_size * (2 * self.band_count + 1)
    }
}

impl<B: Backend> FrequencyEncoder<B> {
    pub fn forward(&self, coordinates: Tensor<B, 2>) -> Tensor<B, 2> {
        let count = coordinates.dims()[0];
        let coordinates = coordinates.unsqueeze_dim::<3>(1);
        let scaled = coordinates.clone() * self.frequencies.clone();

        Tensor::cat(vec![coordinates, scaled.clone().sin(), scaled.cos()], 1)
            .reshape([count as i32, -1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Backend = burn::backend::NdArray;

    #[test]
    fn encoded_width_matches_the_band_count() {
        let device = Default::default();

        let config = FrequencyEncoderConfig {
            band_count: 4,
        };
        let encoder = config.init::<Backend>(&device).unwrap();

        let input = Tensor::from_floats([[1.0, -2.0, 0.5], [0.0, 0.25, -1.0]], &device);
        let output = encoder.forward(input);
        assert_eq!(output.dims(), [2, config.output_size(3)]);
    }

    #[test]
    fn zero_bands_are_a_configuration_error() {
        let device = Default::default();
        let config = FrequencyEncoderConfig {
            band_count: 0,
        };
        assert!(config.init::<Backend>(&device).is_err());
    }

    #[test]
    fn identity_features_lead_the_expansion() {
        let device = Default::default();

        let encoder = FrequencyEncoderConfig {
            band_count: 1,
        }
        .init::<Backend>(&device)
        .unwrap();

        let output = encoder.forward(Tensor::from_floats([[0.5, -0.5]], &device));
        let values: Vec<f32> = output.into_data().to_vec().unwrap();
        assert_eq!(values.len(), 6);
        assert_eq!(&values[0..2], &[0.5, -0.5]);
    }
}
