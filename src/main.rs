use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tarot::{
    leakage_model::aes::SboxModel,
    rank::{RankEstimation, RankEstimationConfig},
    trace::TraceDataset,
};
use tracing::info;

#[derive(Clone, Copy, ValueEnum)]
enum Model {
    /// S-box output value
    Identity,
    /// Hamming weight of the S-box output
    HammingWeight,
}

impl From<Model> for SboxModel {
    fn from(model: Model) -> Self {
        match model {
            Model::Identity => SboxModel::Identity,
            Model::HammingWeight => SboxModel::HammingWeight,
        }
    }
}

/// Template attack log-probabilities of AES first round key bytes.
#[derive(Parser)]
#[command(name = "tarot", version, about)]
struct Cli {
    /// Traces npy file (f64, one row per trace)
    #[arg(long, value_name = "FILE")]
    traces: PathBuf,
    /// Plaintexts npy file (u8, one row per trace)
    #[arg(long, value_name = "FILE")]
    plaintexts: PathBuf,
    /// Fixed key used for all traces, as hex
    #[arg(long, value_name = "HEX")]
    key: String,
    /// JSON configuration file, overridden by command line options
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    #[arg(long)]
    sample_start: Option<usize>,
    #[arg(long)]
    sample_end: Option<usize>,
    /// Number of traces to analyze
    #[arg(long)]
    trace_count: Option<usize>,
    /// Stride between trace count checkpoints, 0 for a single checkpoint
    #[arg(long)]
    trace_step: Option<usize>,
    #[arg(long)]
    bin_count: Option<usize>,
    /// Number of worker threads
    #[arg(long)]
    threads: Option<usize>,
    #[arg(long, value_enum, default_value = "hamming-weight")]
    model: Model,
    /// Output CSV file
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

impl Cli {
    fn config(&self) -> Result<RankEstimationConfig> {
        let mut config = match &self.config {
            Some(path) => RankEstimationConfig::load(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
            None => RankEstimationConfig::default(),
        };

        if let Some(sample_start) = self.sample_start {
            config.sample_start = sample_start;
        }
        if self.sample_end.is_some() {
            config.sample_end = self.sample_end;
        }
        if self.trace_count.is_some() {
            config.trace_count = self.trace_count;
        }
        if let Some(trace_step) = self.trace_step {
            config.trace_step = trace_step;
        }
        if let Some(bin_count) = self.bin_count {
            config.bin_count = bin_count;
        }
        if self.threads.is_some() {
            config.num_threads = self.threads;
        }

        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .init();

    let config = cli.config()?;
    let key = hex::decode(&cli.key).context("Invalid key hex string")?;
    let dataset = TraceDataset::from_npy(&cli.traces, &cli.plaintexts, key)
        .context("Failed to load traces")?;
    let model = SboxModel::from(cli.model);

    let estimation = RankEstimation::new(&dataset, &model, &config)?;
    #[cfg(feature = "progress_bar")]
    let estimation = {
        let progress_bar = tarot::util::progress_bar(estimation.unit_count());
        estimation.with_progress_bar(progress_bar)
    };

    let log_probabilities = estimation.compute()?;
    for (step_idx, step) in log_probabilities.steps().iter().enumerate() {
        let best: Vec<usize> = (0..log_probabilities.key_size())
            .map(|byte_index| log_probabilities.best_guess(step_idx, byte_index))
            .collect();
        info!(traces = step, best_guesses = ?best, "checkpoint");
    }

    log_probabilities
        .save_csv(&cli.output)
        .with_context(|| format!("Failed to write {}", cli.output.display()))?;

    Ok(())
}
