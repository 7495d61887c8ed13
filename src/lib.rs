//! Neural style transfer by direct pixel optimization.
//!
//! A noise image is optimized so that the Gram matrices of its convolutional
//! activations match those of a style image (Gatys et al. 2015). The target
//! Gram matrices are computed once from a single forward pass; each epoch
//! then evaluates and differentiates the loss with respect to the pixels
//! only, since the network weights are frozen.
//!
//! # Example
//!```no_run
//! use nstyle::{config::NstConfig, run::run};
//! use std::{collections::BTreeMap, path::PathBuf};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = NstConfig {
//!     style_img: Some(PathBuf::from("starry_night.jpg")),
//!     style_layers: BTreeMap::from([("ReLU".to_string(), vec![0, 2, 4])]),
//!     style_layer_weights: vec![1. / 3.; 3],
//!     ..NstConfig::default()
//! };
//! let (output, report) = run(&config)?;
//! println!("{} after {} evaluations", output.display(), report.evaluations);
//! # Ok(())
//! # }
//!```

/// Variables and reverse-mode automatic differentiation.
pub mod autograd;
/// Redis-backed batch processing.
pub mod batch;
/// Run configuration.
pub mod config;
/// Feature extraction.
pub mod extract;
/// Gram matrices, style losses and the loss aggregator.
pub mod loss;
/// Layers, networks and the architecture registry.
pub mod model;
/// Optimizers.
pub mod optim;
/// The optimization driver.
pub mod optimize;
/// Image pre/postprocessing.
pub mod processing;
/// End to end runs.
pub mod run;
