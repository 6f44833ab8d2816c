extern crate anyhow;
extern crate burn;
extern crate image;
extern crate kdam;
extern crate log;
extern crate npyz;
extern crate rand;
extern crate regex;
extern crate reqwest;
extern crate zip;

pub mod adversarial;
pub mod dataset;
pub mod discriminator;
pub mod encoder;
pub mod experiment;
pub mod field;
pub mod loss;
pub mod metric;
pub mod renderer;
pub mod sampler;
pub mod schedule;

pub mod prelude {
    pub use crate::*;

    pub use burn::backend;
    pub use burn::prelude::{Config, Module};
}
