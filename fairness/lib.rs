#![deny(dead_code)]
#![deny(unused_imports)]

pub mod config;
pub mod counterfactual;
pub mod data;
pub mod diagnostics;
pub mod estimate;
pub mod hmc;
pub mod io;
pub mod model;
pub mod pipeline;
pub mod predictor;
pub mod progress;
pub mod simulate;
pub mod sweep;

#[cfg(test)]
mod test_fixtures;
