use crate::{
    autograd::Variable,
    config::NstConfig,
    extract::FeatureExtractor,
    loss::{gram, NstLoss},
    model,
    optim::Optimizer,
    optimize::{optimize, Report},
    processing::{noise_like, Processor},
};
use anyhow::{Context, Result};
use rand::{rngs::StdRng, SeedableRng};
use std::path::PathBuf;

/// Runs one style transfer end to end and returns the output path and the
/// optimization report.
///
/// The target Gram matrices are computed from a single forward pass over the
/// style image; only the generated image is re-evaluated per epoch.
///
/// **Errors**
///
/// Returns an error on an invalid config, unreadable style image or weights,
/// or a failed optimization.
pub fn run(config: &NstConfig) -> Result<(PathBuf, Report)> {
    config.validate()?;
    let style_path = config.style_img.as_ref().context("a style image is required")?;
    tracing::info!(model = %config.model, style = %style_path.display(), "starting run");

    let processor = Processor::default();
    let style = processor.preprocess_file(style_path)?;

    let mut network = model::build(&config.model)
        .with_context(|| format!("unknown model {:?}", config.model))?;
    if let Some(weights) = &config.weights {
        network.load_weights(weights)?;
    }
    if config.pool == "avg" {
        network = network.replace_max_with_avg();
    }
    // The selector is checked against the network after the pooling
    // substitution, so selecting MaxPool2d under avg pooling fails here
    // instead of silently matching nothing.
    let extractor = FeatureExtractor::new(network, &config.style_selector()?)?;

    let gram_kind = config.gram_kind()?;
    let targets = extractor
        .extract(&Variable::from(style.clone()))?
        .iter()
        .map(|activation| gram(activation, gram_kind).into_value())
        .collect();
    let mut loss = NstLoss::builder()
        .style_targets(targets)
        .style_weights(config.style_layer_weights.clone())
        .style_gram(gram_kind);
    if let Some(alpha) = config.alpha {
        loss = loss.alpha(alpha);
    }
    let loss = loss.build()?;

    let mut rng = StdRng::from_entropy();
    let noise = noise_like(&style, &mut rng);
    let mut optimizer = Optimizer::build(&config.optimization_method, &config.optimization_options)?;
    let (image, report) = optimize(&extractor, &loss, noise, &mut optimizer, config.epochs)?;

    let output = config.output_filepath();
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {parent:?}"))?;
        }
    }
    processor.save(&image, &output, true)?;
    tracing::info!(output = %output.display(), loss = report.final_loss, "run finished");
    Ok((output, report))
}
