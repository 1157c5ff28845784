use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tabled::{Table, Tabled};
use tracing::{error, info, warn};

use ddp_orchestrator::checkpoint::CheckpointTracker;
use ddp_orchestrator::env::EnvMap;
use ddp_orchestrator::fit_loop::EpochLoop;
use ddp_orchestrator::logging::{self, rank_zero_info};
use ddp_orchestrator::models::{RegressionConfig, RegressionModule};
use ddp_orchestrator::spawn::{ProcessSpawner, Stagger};
use ddp_orchestrator::{
    AcceleratorConnector, DistributedBackend, GpuSpec, RunContext, RunOutcome, TrainModule, TrainerConfig,
    TrainingOrchestrator,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the demo regression model
    Fit {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override distributed backend (ddp, ddp_spawn, ddp_cpu, ddp2)
        #[arg(short, long)]
        backend: Option<DistributedBackend>,

        /// Override GPU selection, a count ("2") or ids ("0,3")
        #[arg(short, long)]
        gpus: Option<GpuSpec>,

        #[arg(long)]
        num_nodes: Option<usize>,

        #[arg(long)]
        num_processes: Option<usize>,

        #[arg(long)]
        max_epochs: Option<usize>,

        /// Stop once every worker's validation loss is below this
        #[arg(long)]
        target_loss: Option<f64>,

        /// Evaluate only
        #[arg(long)]
        test: bool,

        /// Write a JSON run summary here
        #[arg(short, long)]
        summary: Option<PathBuf>,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
    /// Generate a sample configuration file
    GenConfig {
        /// Preset (cpu, gpu)
        #[arg(long, default_value = "cpu")]
        preset: String,

        #[arg(long, default_value_t = 2)]
        workers: usize,
    },
}

#[derive(Tabled)]
struct SummaryRow {
    metric: String,
    value: String,
}

fn summary_table(outcome: &RunOutcome, best_model_path: Option<&str>) -> String {
    let mut rows = Vec::new();
    if let Some(Value::Object(results)) = &outcome.results {
        for (metric, value) in results {
            rows.push(SummaryRow {
                metric: metric.clone(),
                value: value.to_string(),
            });
        }
    }
    rows.push(SummaryRow {
        metric: "best_model_path".to_string(),
        value: best_model_path.unwrap_or("-").to_string(),
    });
    Table::new(rows).to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(&cli.command, Commands::Fit { verbose: true, .. });
    logging::init_tracing(verbose);

    match cli.command {
        Commands::Fit {
            config,
            backend,
            gpus,
            num_nodes,
            num_processes,
            max_epochs,
            target_loss,
            test,
            summary,
            ..
        } => {
            let mut trainer_config = match &config {
                Some(path) => TrainerConfig::load(path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => TrainerConfig::default(),
            };

            // Apply CLI overrides
            if backend.is_some() {
                trainer_config.distributed_backend = backend;
            }
            if gpus.is_some() {
                trainer_config.gpus = gpus;
            }
            if let Some(num_nodes) = num_nodes {
                trainer_config.num_nodes = num_nodes;
            }
            if let Some(num_processes) = num_processes {
                trainer_config.num_processes = num_processes;
            }
            if let Some(max_epochs) = max_epochs {
                trainer_config.max_epochs = max_epochs;
            }

            let mut ctx = RunContext::new(trainer_config, EnvMap::from_process());
            ctx.testing = test;
            AcceleratorConnector::default().on_trainer_init(&mut ctx)?;
            let selected = AcceleratorConnector::default().select_accelerator(&ctx);

            let stagger = if ctx.config.stagger_spawn {
                Stagger::default()
            } else {
                Stagger::Disabled
            };
            let spawner = ProcessSpawner::default()
                .with_stagger(stagger)
                .with_original_cwd(ctx.config.original_cwd.clone())
                .with_registry(ctx.children.clone());
            let orchestrator = TrainingOrchestrator::new(selected).with_spawner(spawner);
            let children = ctx.children.clone();

            rank_zero_info(format!("🚀 Distributed training starting ({selected})"));
            let model_config = RegressionConfig::default();
            let (max_epochs, steps_per_epoch) = (ctx.config.max_epochs, ctx.config.steps_per_epoch);

            let run = tokio::task::spawn_blocking(move || {
                let outcome = orchestrator.run(&mut ctx, |process_idx| {
                    let module: Box<dyn TrainModule> =
                        Box::new(RegressionModule::new(model_config.clone(), &candle_core::Device::Cpu)?);
                    let mut train_loop = EpochLoop::new(max_epochs, steps_per_epoch, model_config.in_features, 42);
                    if let Some(target) = target_loss {
                        train_loop = train_loop.with_target_loss(target);
                    }
                    tracing::debug!("built worker {}", process_idx);
                    Ok((module, train_loop))
                });
                (ctx, outcome)
            });

            let (ctx, outcome) = tokio::select! {
                joined = run => joined.context("training thread failed")?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted, terminating {} worker processes", children.len());
                    children.terminate_all();
                    // the blocking worker thread cannot be cancelled
                    std::process::exit(130);
                }
            };

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("❌ Training failed: {}", e);
                    children.terminate_all();
                    return Err(e.into());
                }
            };

            if ctx.is_global_zero() && outcome.results.is_some() {
                let best = ctx.checkpoint.best_model_path();
                println!("\n📊 Training Results:");
                println!("{}", summary_table(&outcome, best));

                if let Some(path) = summary {
                    let record = json!({
                        "finished_at": Utc::now().to_rfc3339(),
                        "backend": selected.to_string(),
                        "world_size": ctx.world_size,
                        "best_model_path": best,
                        "results": outcome.results,
                    });
                    std::fs::write(&path, serde_json::to_string_pretty(&record)?)?;
                    info!("Summary saved to: {}", path.display());
                }
            }
        }
        Commands::GenConfig { preset, workers } => {
            let config = match preset.as_str() {
                "cpu" => TrainerConfig::cpu_workers(workers),
                "gpu" => TrainerConfig::multi_gpu(workers),
                _ => {
                    eprintln!("❌ Unknown preset: {}", preset);
                    std::process::exit(1);
                }
            };
            std::fs::create_dir_all("config")?;

            let config_path = format!("config/{}.json", preset);
            config.save(&config_path)?;

            println!("✅ Generated configuration: {}", config_path);
        }
    }

    Ok(())
}
