use nstyle::{
    config::NstConfig,
    optim::OptimizerOptions,
    run::run,
};
use std::collections::BTreeMap;

fn style_image(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("style.png");
    let image = image::RgbImage::from_fn(64, 64, |x, y| {
        // diagonal stripes, enough structure for a non-trivial gram target
        let value = if (x + y) % 16 < 8 { 220 } else { 40 };
        image::Rgb([value, value / 2, 255 - value])
    });
    image.save(&path).unwrap();
    path
}

#[test]
fn end_to_end_alexnet_run() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("generated.png");
    let config = NstConfig {
        model: "alexnet".to_string(),
        pool: "avg".to_string(),
        style_img: Some(style_image(dir.path())),
        style_layers: BTreeMap::from([("ReLU".to_string(), vec![0, 1])]),
        style_layer_weights: vec![0.5, 0.5],
        style_gram_class: "NormalizedGramMatrix".to_string(),
        optimization_method: "SGD".to_string(),
        optimization_options: OptimizerOptions {
            learning_rate: Some(0.05),
            ..OptimizerOptions::default()
        },
        epochs: 2,
        output_filepath: Some(output.clone()),
        ..NstConfig::default()
    };
    let (path, report) = run(&config).unwrap();
    assert_eq!(path, output);
    assert_eq!(report.epochs, 2);
    assert_eq!(report.evaluations, 2);
    assert!(report.final_loss.is_finite());
    let generated = image::open(&path).unwrap().to_rgb8();
    // smaller edge rescaled to 256
    assert_eq!(generated.dimensions(), (256, 256));
}

#[test]
fn run_rejects_invalid_config_before_any_work() {
    let config = NstConfig {
        model: "resnet50".to_string(),
        ..NstConfig::default()
    };
    let error = run(&config).unwrap_err();
    assert!(error.to_string().contains("unknown model"));
}

#[test]
fn queued_payload_round_trips_through_run_config() {
    let grid = serde_json::json!({
        "model": ["alexnet"],
        "style_img": ["style.png"],
        "style_layers": [{"ReLU": [0]}],
        "style_layer_weights": [[1.0]],
        "epochs": [1, 2],
    });
    let points = nstyle::batch::parameter_grid(grid.as_object().unwrap()).unwrap();
    assert_eq!(points.len(), 2);
    for point in points {
        let config: NstConfig =
            serde_json::from_value(serde_json::Value::Object(point)).unwrap();
        config.validate().unwrap();
    }
}
