use std::path::Path;

use burn::backend::{Autodiff, NdArray};
use image::{Rgb, RgbImage};

use vit_lora::base::RANDOM_TINY;
use vit_lora::checkpoint::{AdapterCheckpoint, LABELS_FILE};
use vit_lora::data::ImageProcessorConfig;
use vit_lora::eval::evaluate_adapter;
use vit_lora::inference::Predictor;
use vit_lora::lora::{LoraConfig, LoraTarget};
use vit_lora::training::{EXPERIMENT_LOG_FILE, PipelineOptions, TrainingConfig, run};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<TestBackend>;

const CLASSES: [(&str, [u8; 3]); 2] = [("apples", [200, 30, 30]), ("limes", [40, 190, 60])];
const IMAGES_PER_CLASS: usize = 6;

fn write_image_folder(root: &Path) {
    for (class, color) in CLASSES {
        let dir = root.join(class);
        std::fs::create_dir_all(&dir).unwrap();
        for index in 0..IMAGES_PER_CLASS {
            let shade = (index * 10) as u8;
            let image = RgbImage::from_fn(40, 36, |x, y| {
                if (x + y) % 7 == 0 {
                    Rgb([shade, shade, shade])
                } else {
                    Rgb(color)
                }
            });
            image.save(dir.join(format!("{index}.png"))).unwrap();
        }
    }
}

fn config() -> TrainingConfig {
    TrainingConfig::new()
        .with_lora(
            LoraConfig::new()
                .with_rank(2)
                .with_alpha(4.0)
                .with_target_modules(vec![LoraTarget::Query, LoraTarget::Value, LoraTarget::Output]),
        )
        .with_num_epochs(1)
        .with_batch_size(4)
        .with_num_workers(1)
        .with_test_fraction(0.25)
}

#[test]
fn fine_tunes_saves_and_reloads_an_adapter() {
    let workspace = tempfile::tempdir().unwrap();
    let data_dir = workspace.path().join("images");
    write_image_folder(&data_dir);

    let options = PipelineOptions {
        base_model: RANDOM_TINY.to_string(),
        data_dir: data_dir.clone(),
        output_dir: workspace.path().join("adapter"),
        artifact_dir: workspace.path().join("artifacts"),
    };
    let device = Default::default();

    let report = run::<TestAutodiffBackend>(&options, config(), Default::default()).unwrap();

    assert_eq!(report.num_train + report.num_test, CLASSES.len() * IMAGES_PER_CLASS);
    assert_eq!(report.num_test, 3);
    assert!(report.params.trainable < report.params.total);
    assert_eq!(report.eval.total, report.num_test);
    assert_eq!(report.reloaded.correct, report.eval.correct);
    assert!((report.reloaded.loss - report.eval.loss).abs() < 1e-4);
    assert!(options.artifact_dir.join("config.json").is_file());
    assert!(options.artifact_dir.join(EXPERIMENT_LOG_FILE).is_file());

    let checkpoint = AdapterCheckpoint::load(&options.output_dir).unwrap();
    assert_eq!(checkpoint.config.base_model, RANDOM_TINY);
    assert_eq!(checkpoint.processor.size, 32);
    assert_eq!(checkpoint.labels.names(), ["apples", "limes"]);
    assert!(options.output_dir.join(LABELS_FILE).is_file());

    let predictor = Predictor::<TestBackend>::from_adapter(None, &options.output_dir, true, &device)
        .unwrap();
    let prediction = predictor.predict(data_dir.join("limes/0.png")).unwrap();
    assert!(["apples", "limes"].contains(&prediction.label.as_str()));
    assert_eq!(prediction.top_k.len(), 2);

    let full = evaluate_adapter::<TestBackend>(
        None,
        &options.output_dir,
        &data_dir,
        5,
        &device,
    )
    .unwrap();
    assert_eq!(full.total, CLASSES.len() * IMAGES_PER_CLASS);
}

#[test]
fn rejects_a_folder_with_a_single_class() {
    let workspace = tempfile::tempdir().unwrap();
    let data_dir = workspace.path().join("images");
    let dir = data_dir.join("apples");
    std::fs::create_dir_all(&dir).unwrap();
    RgbImage::new(8, 8).save(dir.join("0.png")).unwrap();

    let options = PipelineOptions {
        base_model: RANDOM_TINY.to_string(),
        data_dir,
        output_dir: workspace.path().join("adapter"),
        artifact_dir: workspace.path().join("artifacts"),
    };

    let result = run::<TestAutodiffBackend>(&options, config(), Default::default());

    assert!(matches!(result, Err(vit_lora::Error::Dataset(_))));
    assert!(!options.output_dir.exists());
}

#[test]
fn rejects_an_inverted_crop_scale() {
    let workspace = tempfile::tempdir().unwrap();
    let data_dir = workspace.path().join("images");
    write_image_folder(&data_dir);

    let options = PipelineOptions {
        base_model: RANDOM_TINY.to_string(),
        data_dir,
        output_dir: workspace.path().join("adapter"),
        artifact_dir: workspace.path().join("artifacts"),
    };
    let config = config().with_processor(ImageProcessorConfig::new().with_crop_scale((1.0, 0.5)));

    let result = run::<TestAutodiffBackend>(&options, config, Default::default());

    assert!(matches!(result, Err(vit_lora::Error::Processor(_))));
    assert!(!options.output_dir.exists());
}
