use crate::{
    extract::LayerSelector,
    loss::{GramKind, GRAM_KINDS},
    model::{LayerKind, ARCHITECTURES},
    optim::{OptimizerOptions, OPTIMIZERS},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    path::PathBuf,
    str::FromStr,
};

/// The pooling mode ids accepted in a config.
pub const POOLS: [&str; 2] = ["avg", "max"];

/// Invalid run configuration.
///
/// Every string identifier is validated against its closed registry before
/// any model is built or image decoded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Unknown architecture id.
    #[error("unknown model {0:?}, expected one of {ARCHITECTURES:?}")]
    UnknownModel(String),
    /// Unknown pooling mode.
    #[error("unknown pool {0:?}, expected one of {POOLS:?}")]
    UnknownPool(String),
    /// Unknown layer kind in a selector.
    #[error(transparent)]
    UnknownLayerKind(#[from] crate::model::UnknownLayerKind),
    /// Unknown gram kind id.
    #[error(transparent)]
    UnknownGramKind(#[from] crate::loss::UnknownGramKind),
    /// Unknown optimizer id.
    #[error(transparent)]
    UnknownOptimizer(#[from] crate::optim::UnknownOptimizer),
    /// No style image was given.
    #[error("a style image is required")]
    MissingStyleImage,
    /// Weight and selected-layer counts differ.
    #[error("{weights} style weight(s) for {layers} selected layer(s)")]
    WeightCountMismatch {
        /// Provided weights.
        weights: usize,
        /// Selected layers.
        layers: usize,
    },
}

/// One neural style transfer run, typically deserialized from JSON.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NstConfig {
    /// Architecture id, see [`ARCHITECTURES`].
    pub model: String,
    /// Pooling mode, see [`POOLS`]. `"avg"` replaces every max pooling layer.
    pub pool: String,
    /// Style image path.
    pub style_img: Option<PathBuf>,
    /// Layer kind name to occurrence indices, eg `{"ReLU": [0, 2, 4]}`.
    pub style_layers: BTreeMap<String, Vec<usize>>,
    /// Positional weights, one per selected layer.
    pub style_layer_weights: Vec<f32>,
    /// Content image path. Content losses are unimplemented, so setting this
    /// fails at loss construction.
    pub content_img: Option<PathBuf>,
    /// Content layer selectors, see `content_img`.
    pub content_layers: BTreeMap<String, Vec<usize>>,
    /// `total = alpha·content + (1 - alpha)·style`.
    pub alpha: Option<f32>,
    /// Gram kind id, see [`GRAM_KINDS`].
    pub style_gram_class: String,
    /// Optimizer id, see [`OPTIMIZERS`].
    pub optimization_method: String,
    /// Optimizer options.
    pub optimization_options: OptimizerOptions,
    /// Outer optimization steps.
    pub epochs: usize,
    /// Weight blob path. Unset leaves the network at its random init.
    pub weights: Option<PathBuf>,
    /// Output image path. Unset derives a name from the style image and a
    /// hash of the config.
    pub output_filepath: Option<PathBuf>,
}

impl Default for NstConfig {
    fn default() -> Self {
        Self {
            model: "vgg19".to_string(),
            pool: "avg".to_string(),
            style_img: None,
            style_layers: BTreeMap::new(),
            style_layer_weights: Vec::new(),
            content_img: None,
            content_layers: BTreeMap::new(),
            alpha: None,
            style_gram_class: GramKind::NormalizedGram.to_string(),
            optimization_method: "LBFGS".to_string(),
            optimization_options: OptimizerOptions::default(),
            epochs: 200,
            weights: None,
            output_filepath: None,
        }
    }
}

impl NstConfig {
    /// Validates every identifier against its registry.
    ///
    /// Selector occurrence indices are validated later against the built
    /// network; this pass catches everything that does not need one.
    ///
    /// **Errors**
    ///
    /// See [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !ARCHITECTURES.contains(&self.model.as_str()) {
            return Err(ConfigError::UnknownModel(self.model.clone()));
        }
        if !POOLS.contains(&self.pool.as_str()) {
            return Err(ConfigError::UnknownPool(self.pool.clone()));
        }
        for name in self.style_layers.keys().chain(self.content_layers.keys()) {
            LayerKind::from_str(name)?;
        }
        GramKind::from_str(&self.style_gram_class)?;
        if !OPTIMIZERS.contains(&self.optimization_method.as_str()) {
            return Err(ConfigError::UnknownOptimizer(
                crate::optim::UnknownOptimizer(self.optimization_method.clone()),
            ));
        }
        if self.style_img.is_none() {
            return Err(ConfigError::MissingStyleImage);
        }
        let layers: usize = self.style_layers.values().map(Vec::len).sum();
        if self.style_layer_weights.len() != layers {
            return Err(ConfigError::WeightCountMismatch {
                weights: self.style_layer_weights.len(),
                layers,
            });
        }
        Ok(())
    }
    /// The style selector with parsed layer kinds.
    ///
    /// **Errors**
    ///
    /// Fails on unknown layer kind names.
    pub fn style_selector(&self) -> Result<LayerSelector, ConfigError> {
        let mut selector = LayerSelector::new();
        for (name, indices) in self.style_layers.iter() {
            selector.insert(LayerKind::from_str(name)?, indices.clone());
        }
        Ok(selector)
    }
    /// The parsed gram kind.
    ///
    /// **Errors**
    ///
    /// Fails on an unknown gram kind id.
    pub fn gram_kind(&self) -> Result<GramKind, ConfigError> {
        Ok(GramKind::from_str(&self.style_gram_class)?)
    }
    /// The output path, derived from the style image name and a config hash
    /// when not set explicitly.
    pub fn output_filepath(&self) -> PathBuf {
        if let Some(path) = &self.output_filepath {
            return path.clone();
        }
        let stem = self
            .style_img
            .as_deref()
            .and_then(|path| path.file_stem())
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "style".to_string());
        let mut hasher = DefaultHasher::new();
        serde_json::to_string(self)
            .unwrap_or_default()
            .hash(&mut hasher);
        PathBuf::from(format!("generated/{stem}_{:08x}.png", hasher.finish() as u32))
    }
    /// The five style configurations evaluated by Gatys et al. 2015 on
    /// vgg19, labelled `a` through `e`.
    pub fn gatys_presets(style_img: PathBuf, output_dir: &std::path::Path, epochs: usize) -> Vec<Self> {
        let presets: [(&str, &[usize]); 5] = [
            ("a", &[0]),
            ("b", &[0, 2]),
            ("c", &[0, 2, 4]),
            ("d", &[0, 2, 4, 8]),
            ("e", &[0, 2, 4, 8, 12]),
        ];
        presets
            .iter()
            .map(|(style_id, layers)| Self {
                model: "vgg19".to_string(),
                pool: "avg".to_string(),
                style_img: Some(style_img.clone()),
                style_layers: BTreeMap::from([(
                    LayerKind::Relu.to_string(),
                    layers.to_vec(),
                )]),
                style_layer_weights: vec![1. / layers.len() as f32; layers.len()],
                style_gram_class: GramKind::NormalizedGram.to_string(),
                optimization_method: "LBFGS".to_string(),
                epochs,
                output_filepath: Some(output_dir.join(format!("vangogh_style_{style_id}.png"))),
                ..Self::default()
            })
            .collect()
    }
}
