use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use oastest_core::FuzzMode;

#[derive(Parser)]
#[command(name = "oastest", version, about = "OpenAPI test planning and fuzzing")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn verbose(&self) -> bool {
        match &self.command {
            Command::Generate { verbose, .. } | Command::Run { verbose, .. } => *verbose,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate test plans from an OpenAPI document.
    Generate {
        /// Directory where the generated plan files land.
        #[arg(short = 'd', long, default_value = "meqa_data")]
        out_dir: PathBuf,
        /// The OpenAPI document (JSON or YAML).
        #[arg(short = 's', long, default_value = "meqa_data/swagger.yml")]
        spec: PathBuf,
        /// Planning algorithm.
        #[arg(short = 'a', long, value_enum, default_value_t = Algorithm::All)]
        algorithm: Algorithm,
        /// Turn on verbose logging.
        #[arg(short = 'v', long)]
        verbose: bool,
        /// Whitelisted API paths, one per line (path plan only).
        #[arg(short = 'w', long)]
        whitelist: Option<PathBuf>,
        /// Paths listed in this file are ignored (wins over the whitelist).
        #[arg(short = 'i', long)]
        ignored_paths: Option<PathBuf>,
    },
    /// Run a test plan against a live server.
    Run {
        /// The plan file to execute.
        #[arg(long)]
        plan: PathBuf,
        /// The OpenAPI document (JSON or YAML).
        #[arg(short = 's', long)]
        spec: PathBuf,
        /// Where to write the result plan; defaults to result.yml in the
        /// data directory.
        #[arg(long)]
        result_file: Option<PathBuf>,
        /// Base URL override; defaults to the spec's first server entry.
        #[arg(long)]
        base_url: Option<String>,
        /// Basic-auth username.
        #[arg(long, default_value = "")]
        username: String,
        /// Basic-auth password.
        #[arg(long, default_value = "")]
        password: String,
        /// Bearer token; wins over basic auth when set.
        #[arg(long, default_value = "")]
        api_token: String,
        /// Dataset file with positive/negative value pools.
        #[arg(long)]
        dataset: Option<PathBuf>,
        /// Fuzz sample kinds to generate.
        #[arg(long, value_enum, default_value_t = FuzzArg::None)]
        fuzz_type: FuzzArg,
        /// Replay previously recorded failures instead of fresh samples.
        #[arg(long)]
        repro: bool,
        /// Data directory for datasets, unique keys, and the failure log.
        #[arg(short = 'd', long, default_value = "meqa_data")]
        data_dir: PathBuf,
        /// Dataset values consumed per type and run.
        #[arg(long, default_value_t = 10)]
        batch_size: usize,
        /// Turn on verbose logging.
        #[arg(short = 'v', long)]
        verbose: bool,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Algorithm {
    Simple,
    Object,
    Path,
    All,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum FuzzArg {
    None,
    Positive,
    Datatype,
    Negative,
    All,
}

impl From<FuzzArg> for FuzzMode {
    fn from(arg: FuzzArg) -> FuzzMode {
        match arg {
            FuzzArg::None => FuzzMode::None,
            FuzzArg::Positive => FuzzMode::Positive,
            FuzzArg::Datatype => FuzzMode::Datatype,
            FuzzArg::Negative => FuzzMode::Negative,
            FuzzArg::All => FuzzMode::All,
        }
    }
}
