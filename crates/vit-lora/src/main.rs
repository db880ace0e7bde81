#![recursion_limit = "256"]

use std::path::PathBuf;

use burn::tensor::backend::AutodiffBackend;
use clap::{Parser, Subcommand};
use tracing_subscriber::filter::{LevelFilter, filter_fn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

use vit_lora::inference::Predictor;
use vit_lora::lora::{LoraConfig, LoraTarget};
use vit_lora::training::{PipelineOptions, TrainingConfig, run};

#[derive(Parser, Debug)]
#[command(version, about = "Fine-tune Vision Transformer classifiers with LoRA")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fine-tune adapters and a classification head on an image folder.
    Train {
        /// Hub repository, local checkpoint, `random-tiny` or `random-base`.
        #[arg(long, default_value = "google/vit-base-patch16-224-in21k")]
        model: String,
        /// Root of a `<class>/<image>` folder.
        #[arg(long)]
        data: PathBuf,
        /// Where the adapter is written.
        #[arg(long)]
        output: PathBuf,
        /// Learner metrics, logs and checkpoints. Defaults to `<output>/artifacts`.
        #[arg(long)]
        artifact_dir: Option<PathBuf>,
        #[arg(long, default_value_t = 5)]
        epochs: usize,
        #[arg(long, default_value_t = 32)]
        batch_size: usize,
        #[arg(long, default_value_t = 2)]
        num_workers: usize,
        #[arg(long, default_value_t = 5e-3)]
        lr: f64,
        #[arg(long, default_value_t = 16)]
        rank: usize,
        #[arg(long, default_value_t = 16.0)]
        alpha: f64,
        #[arg(long, default_value_t = 0.1)]
        dropout: f64,
        /// Comma separated layers to adapt.
        #[arg(long, value_delimiter = ',', default_value = "query,value")]
        targets: Vec<LoraTarget>,
        /// Scale adapters by `alpha / sqrt(rank)`.
        #[arg(long)]
        rslora: bool,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value_t = 0.1)]
        test_fraction: f64,
        #[arg(long)]
        max_samples: Option<usize>,
    },
    /// Measure the accuracy of a saved adapter on an image folder.
    Eval {
        /// Overrides the base model recorded in the adapter.
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        adapter: PathBuf,
        #[arg(long)]
        data: PathBuf,
        #[arg(long, default_value_t = 32)]
        batch_size: usize,
    },
    /// Classify images with a saved adapter.
    Predict {
        /// Overrides the base model recorded in the adapter.
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        adapter: PathBuf,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
        /// Keep adapters separate from the base weights instead of merging them.
        #[arg(long)]
        no_merge: bool,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
}

fn launch<B: AutodiffBackend>(cli: Cli, device: B::Device) -> vit_lora::Result<()> {
    match cli.command {
        Command::Train {
            model,
            data,
            output,
            artifact_dir,
            epochs,
            batch_size,
            num_workers,
            lr,
            rank,
            alpha,
            dropout,
            targets,
            rslora,
            seed,
            test_fraction,
            max_samples,
        } => {
            let lora = LoraConfig::new()
                .with_rank(rank)
                .with_alpha(alpha)
                .with_dropout(dropout)
                .with_target_modules(targets)
                .with_use_rslora(rslora);
            let config = TrainingConfig::new()
                .with_lora(lora)
                .with_num_epochs(epochs)
                .with_batch_size(batch_size)
                .with_num_workers(num_workers)
                .with_learning_rate(lr)
                .with_seed(seed)
                .with_test_fraction(test_fraction)
                .with_max_samples(max_samples);
            let options = PipelineOptions {
                base_model: model,
                data_dir: data,
                artifact_dir: artifact_dir.unwrap_or_else(|| output.join("artifacts")),
                output_dir: output,
            };

            println!(
                "logging to {}",
                options.artifact_dir.join(vit_lora::training::EXPERIMENT_LOG_FILE).display()
            );
            let report = run::<B>(&options, config, device)?;
            println!("{}", report.params);
            println!("train images: {} | test images: {}", report.num_train, report.num_test);
            println!("trained  {}", report.eval);
            println!("reloaded {}", report.reloaded);
        }
        Command::Eval {
            model,
            adapter,
            data,
            batch_size,
        } => {
            let report = vit_lora::eval::evaluate_adapter::<B::InnerBackend>(
                model.as_deref(),
                &adapter,
                &data,
                batch_size,
                &device,
            )?;
            println!("{report}");
        }
        Command::Predict {
            model,
            adapter,
            top_k,
            no_merge,
            images,
        } => {
            let predictor = Predictor::<B::InnerBackend>::from_adapter(
                model.as_deref(),
                &adapter,
                !no_merge,
                &device,
            )?
            .with_top_k(top_k);

            for path in images {
                let prediction = predictor.predict(&path)?;
                println!(
                    "{}: {} ({:.2}%)",
                    path.display(),
                    prediction.label,
                    100.0 * prediction.score
                );
                for (label, probability) in prediction.top_k.iter().skip(1) {
                    println!("    {label}: {:.2}%", 100.0 * probability);
                }
            }
        }
    }

    Ok(())
}

fn init_logging() {
    let layer = tracing_subscriber::fmt::layer()
        .with_filter(LevelFilter::INFO)
        .with_filter(filter_fn(|m| {
            if let Some(path) = m.module_path() {
                // The wgpu crate is logging too much, so we skip `info` level.
                if path.starts_with("wgpu") && *m.level() >= LevelFilter::INFO {
                    return false;
                }
            }
            true
        }));
    registry().with(layer).init();
}

#[cfg(any(
    feature = "ndarray",
    feature = "ndarray-blas-netlib",
    feature = "ndarray-blas-openblas",
    feature = "ndarray-blas-accelerate",
))]
mod ndarray {
    use burn::backend::Autodiff;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};

    use crate::{Cli, launch};

    pub fn run(cli: Cli) -> vit_lora::Result<()> {
        launch::<Autodiff<NdArray>>(cli, NdArrayDevice::Cpu)
    }
}

#[cfg(feature = "tch-gpu")]
mod tch_gpu {
    use burn::backend::Autodiff;
    use burn::backend::libtorch::{LibTorch, LibTorchDevice};

    use crate::{Cli, launch};

    pub fn run(cli: Cli) -> vit_lora::Result<()> {
        #[cfg(not(target_os = "macos"))]
        let device = LibTorchDevice::Cuda(0);
        #[cfg(target_os = "macos")]
        let device = LibTorchDevice::Mps;

        launch::<Autodiff<LibTorch>>(cli, device)
    }
}

#[cfg(feature = "tch-cpu")]
mod tch_cpu {
    use burn::backend::Autodiff;
    use burn::backend::libtorch::{LibTorch, LibTorchDevice};

    use crate::{Cli, launch};

    pub fn run(cli: Cli) -> vit_lora::Result<()> {
        launch::<Autodiff<LibTorch>>(cli, LibTorchDevice::Cpu)
    }
}

#[cfg(feature = "wgpu")]
mod wgpu {
    use burn::backend::Autodiff;
    use burn::backend::wgpu::{Wgpu, WgpuDevice};

    use crate::{Cli, launch};

    pub fn run(cli: Cli) -> vit_lora::Result<()> {
        launch::<Autodiff<Wgpu>>(cli, WgpuDevice::default())
    }
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    // Training logs go to the experiment log under the artifact directory.
    if !matches!(cli.command, Command::Train { .. }) {
        init_logging();
    }

    #[cfg(any(
        feature = "ndarray",
        feature = "ndarray-blas-netlib",
        feature = "ndarray-blas-openblas",
        feature = "ndarray-blas-accelerate",
    ))]
    let result = ndarray::run(cli);
    #[cfg(all(
        feature = "tch-gpu",
        not(any(
            feature = "ndarray",
            feature = "ndarray-blas-netlib",
            feature = "ndarray-blas-openblas",
            feature = "ndarray-blas-accelerate",
        ))
    ))]
    let result = tch_gpu::run(cli);
    #[cfg(all(
        feature = "tch-cpu",
        not(any(
            feature = "ndarray",
            feature = "ndarray-blas-netlib",
            feature = "ndarray-blas-openblas",
            feature = "ndarray-blas-accelerate",
            feature = "tch-gpu",
        ))
    ))]
    let result = tch_cpu::run(cli);
    #[cfg(all(
        feature = "wgpu",
        not(any(
            feature = "ndarray",
            feature = "ndarray-blas-netlib",
            feature = "ndarray-blas-openblas",
            feature = "ndarray-blas-accelerate",
            feature = "tch-gpu",
            feature = "tch-cpu",
        ))
    ))]
    let result = wgpu::run(cli);

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            eprintln!("error: {err}");
            std::process::ExitCode::FAILURE
        }
    }
}
