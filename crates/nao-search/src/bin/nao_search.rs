use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use nao_data::LanguageDatasets;
use nao_model::CriterionRegistry;
use nao_search::{JsonArchStore, LogProgress, NaoSearch, NaoTrainer, NoopProgress, ProgressReporter};
use nao_types::{HParams, Split, TaskRegistry};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Neural architecture optimization search for translation models
#[derive(Parser, Debug)]
#[command(name = "nao-search", version, about, long_about = None)]
struct Cli {
    /// Registered task name
    #[arg(short = 'T', long)]
    task: Option<String>,

    /// Directory holding dictionaries and split files
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory for the ranked arch pools
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// JSON file with hyperparameters; flags override it
    #[arg(long)]
    hparams_file: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    /// Size of the architecture pool
    #[arg(long)]
    num_seed_arch: Option<usize>,

    /// Child training epochs per search step
    #[arg(long)]
    child_eval_freq: Option<usize>,

    #[arg(long)]
    child_eval_batch_size: Option<usize>,

    #[arg(long)]
    ctrl_batch_size: Option<usize>,

    #[arg(long)]
    ctrl_train_epochs: Option<usize>,

    /// Best arches kept for the next pool
    #[arg(long)]
    num_remain_top: Option<usize>,

    /// Best arches the controller generates from
    #[arg(long)]
    num_pred_top: Option<usize>,

    /// Stop after this many search steps (unbounded if omitted)
    #[arg(long)]
    max_ctrl_step: Option<u64>,

    #[arg(long)]
    num_gpus: Option<usize>,

    /// Train different arches on different devices
    #[arg(long)]
    arch_dist: bool,

    /// Also compute the validation loss of every arch
    #[arg(long)]
    compute_eval_loss: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn hparams(&self) -> anyhow::Result<HParams> {
        let mut hparams = match &self.hparams_file {
            Some(path) => HParams::from_json_file(path)
                .with_context(|| format!("reading hyperparameters from {}", path.display()))?,
            None => HParams {
                save_dir: JsonArchStore::default_dir(),
                ..HParams::default()
            },
        };
        if let Some(task) = &self.task {
            hparams.task = task.clone();
        }
        if let Some(dir) = &self.data_dir {
            hparams.data_dir = dir.clone();
        }
        if let Some(dir) = &self.save_dir {
            hparams.save_dir = dir.clone();
        }
        if let Some(seed) = self.seed {
            hparams.seed = seed;
        }
        if let Some(n) = self.num_seed_arch {
            hparams.num_seed_arch = n;
        }
        if let Some(n) = self.child_eval_freq {
            hparams.child_eval_freq = n;
        }
        if let Some(n) = self.child_eval_batch_size {
            hparams.child_eval_batch_size = n;
        }
        if let Some(n) = self.ctrl_batch_size {
            hparams.ctrl_batch_size = n;
        }
        if let Some(n) = self.ctrl_train_epochs {
            hparams.ctrl_train_epochs = n;
        }
        if let Some(n) = self.num_remain_top {
            hparams.num_remain_top = n;
        }
        if let Some(n) = self.num_pred_top {
            hparams.num_pred_top = n;
        }
        if self.max_ctrl_step.is_some() {
            hparams.max_ctrl_step = self.max_ctrl_step;
        }
        if let Some(n) = self.num_gpus {
            hparams.num_gpus = n;
        }
        hparams.arch_dist |= self.arch_dist;
        hparams.compute_eval_loss |= self.compute_eval_loss;
        hparams.validate()?;
        Ok(hparams)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_target(false).with_env_filter(filter).init();

    let hparams = cli.hparams()?;
    let tasks = TaskRegistry::with_defaults();
    let task = tasks.get(&hparams.task)?;
    info!("Task {} ({}-{})", task.name, task.source_lang, task.target_lang);

    let datasets = LanguageDatasets::load(&hparams.data_dir, task, &[Split::Train, Split::Dev])
        .with_context(|| format!("loading datasets from {}", hparams.data_dir.display()))?;

    let criterion = CriterionRegistry::with_defaults().build(&hparams.criterion, &hparams)?;
    let progress: Box<dyn ProgressReporter> = if cli.quiet {
        Box::new(NoopProgress)
    } else {
        Box::new(LogProgress::default())
    };
    let store = Arc::new(JsonArchStore::new(&hparams.save_dir));
    info!("Saving arch pools to {} (run {})", store.dir().display(), store.run_id());

    let trainer = NaoTrainer::new(hparams, Arc::new(datasets), criterion)?.with_progress(progress);
    let mut search = NaoSearch::new(trainer, store);
    let summary = search.run().await?;
    info!("Finished {} search steps", summary.steps);
    Ok(())
}
