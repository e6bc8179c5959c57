use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

mod aggregate;
mod cohort;
mod config;
mod did;
mod error;
mod loader;
mod models;
mod period;
mod report;
mod significance;

use config::StudyConfig;
use models::{BanVariant, Region};

#[derive(Parser)]
#[command(name = "ban-impact")]
#[command(about = "Difference-in-differences analysis of commit activity around a national AI tool ban", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct InputArgs {
    /// Commit file for the Italy cohort
    #[arg(long)]
    italy: PathBuf,
    /// Commit file for the Austria cohort
    #[arg(long)]
    austria: PathBuf,
    /// Commit file for the France cohort
    #[arg(long)]
    france: PathBuf,
    /// JSON study configuration; defaults apply to missing fields
    #[arg(long)]
    config: Option<PathBuf>,
    /// Restrict to one ban-duration variant (3-day, 7-day or full)
    #[arg(long)]
    variant: Option<BanVariant>,
    #[arg(long)]
    seed: Option<u64>,
    /// Per-region cohort cap
    #[arg(long)]
    cap: Option<usize>,
}

impl InputArgs {
    fn study_config(&self) -> anyhow::Result<StudyConfig> {
        let mut config = match &self.config {
            Some(path) => StudyConfig::load(path)?,
            None => StudyConfig::default(),
        };
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(cap) = self.cap {
            config.sample_cap = cap;
        }
        config.validate()?;
        Ok(config)
    }

    fn sources(&self) -> Vec<(Region, PathBuf)> {
        vec![
            (Region::Italy, self.italy.clone()),
            (Region::Austria, self.austria.clone()),
            (Region::France, self.france.clone()),
        ]
    }

    fn variants(&self) -> Vec<BanVariant> {
        match self.variant {
            Some(variant) => vec![variant],
            None => BanVariant::ALL.to_vec(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Draw a seeded cohort from a user list
    Sample {
        #[arg(long)]
        users: PathBuf,
        #[arg(long, default_value_t = 1000)]
        size: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long)]
        out: PathBuf,
    },
    /// Print difference-in-differences estimates
    Analyze {
        #[command(flatten)]
        inputs: InputArgs,
        /// Also write the full run as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Generate a markdown report
    Report {
        #[command(flatten)]
        inputs: InputArgs,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Export daily trend series per region as CSV
    Trends {
        #[command(flatten)]
        inputs: InputArgs,
        #[arg(long, default_value = "trends.csv")]
        out: PathBuf,
    },
}

fn write_json(run: &report::AnalysisRun<'_>, path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("cannot create {}", path.display()))?;
    report::write_json(run, std::io::BufWriter::new(file))?;
    println!("Run summary written to {}.", path.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sample {
            users,
            size,
            seed,
            out,
        } => {
            let list = cohort::read_user_list_file(&users)
                .with_context(|| format!("failed to read user list {}", users.display()))?;
            let sampled = cohort::sample_users(&list, size, seed);
            let file = std::fs::File::create(&out)
                .with_context(|| format!("cannot create {}", out.display()))?;
            cohort::write_user_list(file, &sampled)?;
            println!(
                "Sampled {} of {} users into {}.",
                sampled.len(),
                list.len(),
                out.display()
            );
        }
        Commands::Analyze { inputs, json } => {
            let config = inputs.study_config()?;
            let dataset = loader::load_dataset(&inputs.sources(), &config);
            let (tables, outcomes) = did::estimate_all(&dataset.records, &config, &inputs.variants());

            for (region, reason) in &dataset.failures {
                println!("{region} not loaded: {reason}");
            }
            println!(
                "{} vs controls, difference-in-differences per control group and outcome:",
                config.treatment
            );
            print!("{}", report::estimates_table(&outcomes));

            if let Some(path) = json {
                let run = report::AnalysisRun::new(&config, &dataset, &tables, &outcomes);
                write_json(&run, &path)?;
            }
        }
        Commands::Report { inputs, out, json } => {
            let config = inputs.study_config()?;
            let dataset = loader::load_dataset(&inputs.sources(), &config);
            let (tables, outcomes) = did::estimate_all(&dataset.records, &config, &inputs.variants());
            let run = report::AnalysisRun::new(&config, &dataset, &tables, &outcomes);

            std::fs::write(&out, report::build_report(&run))
                .with_context(|| format!("cannot write {}", out.display()))?;
            println!("Report written to {}.", out.display());

            if let Some(path) = json {
                write_json(&run, &path)?;
            }
        }
        Commands::Trends { inputs, out } => {
            let config = inputs.study_config()?;
            let dataset = loader::load_dataset(&inputs.sources(), &config);
            let trends = aggregate::daily_trends(&dataset.records);

            let mut writer = csv::Writer::from_path(&out)
                .with_context(|| format!("cannot create {}", out.display()))?;
            for trend in &trends {
                writer.serialize(trend)?;
            }
            writer.flush()?;
            println!("Wrote {} daily rows to {}.", trends.len(), out.display());
        }
    }

    Ok(())
}
