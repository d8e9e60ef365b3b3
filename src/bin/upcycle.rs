//! Convert a dense Megatron-style checkpoint into a mixture-of-experts one.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use mptools::checkpoint::{ExpertLayout, UpcycleConfig, Upcycler};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Expert layout of the checkpoint being read
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum InputFormat {
    /// Dense checkpoint, upcycle it
    None,
    Local,
    #[value(name = "grouped_gemm")]
    GroupedGemm,
    Scattermoe,
}

impl InputFormat {
    fn layout(self) -> Option<ExpertLayout> {
        match self {
            InputFormat::None => None,
            InputFormat::Local => Some(ExpertLayout::Local),
            InputFormat::GroupedGemm => Some(ExpertLayout::GroupedGemm),
            InputFormat::Scattermoe => Some(ExpertLayout::ScatterMoe),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "mptools-upcycle", about = "Upcycle a dense checkpoint into MoE experts")]
struct Args {
    /// Checkpoint directory containing latest_checkpointed_iteration.txt
    #[arg(long)]
    input_dir: PathBuf,

    #[arg(long)]
    output_dir: PathBuf,

    #[arg(long)]
    num_experts: usize,

    /// Expert layout of the input; a MoE input is converted, not upcycled
    #[arg(long, value_enum, default_value_t = InputFormat::None)]
    input_expert_format: InputFormat,

    /// Expert layout to write
    #[arg(long, value_enum, default_value_t = ExpertLayout::Local)]
    transformer_impl: ExpertLayout,

    #[arg(long, default_value_t = 0.0)]
    router_std: f64,

    #[arg(long, default_value_t = 0.0)]
    expert_std: f64,

    #[arg(long, default_value_t = 0.0)]
    expert_uniform: f64,

    #[arg(long, default_value_t = 1.0)]
    scale_st_w1: f64,

    #[arg(long, default_value_t = 1.0)]
    scale_st: f64,

    #[arg(long, default_value_t = 1)]
    granularity: usize,

    /// Seed for routers and expert noise; random when unset
    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    fn to_config(&self) -> UpcycleConfig {
        let mut config = UpcycleConfig::default()
            .with_num_experts(self.num_experts)
            .with_input_expert_format(self.input_expert_format.layout())
            .with_transformer_impl(self.transformer_impl)
            .with_router_std(self.router_std)
            .with_expert_std(self.expert_std)
            .with_expert_uniform(self.expert_uniform)
            .with_scales(self.scale_st_w1, self.scale_st)
            .with_granularity(self.granularity);
        config.seed = self.seed;
        config
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let upcycler = Upcycler::new(args.to_config())?;
    let report = upcycler
        .run(&args.input_dir, &args.output_dir)
        .with_context(|| format!("upcycling {}", args.input_dir.display()))?;

    info!(
        tensor_parallel = report.tensor_parallel,
        pipeline_parallel = report.pipeline_parallel,
        partitions = report.partitions,
        routers = report.routers_created,
        output = %args.output_dir.display(),
        "done"
    );
    Ok(())
}
