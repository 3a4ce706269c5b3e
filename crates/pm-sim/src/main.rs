use std::error::Error;

use clap::{Parser, Subcommand};
use commands::{
    hiscores::{self, HiscoresArgs},
    run::{self, RunArgs, WalkArgs},
    seed::{self, SeedArgs},
};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "pm-sim", about = "Protomodel walker pool and hiscore CLI")]
struct Cli {
    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pool of walkers sharing one hiscore list.
    Run(RunArgs),
    /// Run a single walker; used by process-isolated pools.
    Walk(WalkArgs),
    /// Inspect or merge persisted hiscore lists.
    Hiscores(HiscoresArgs),
    /// Write random starting states for a later seeded run.
    Seed(SeedArgs),
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    match cli.command {
        Command::Run(args) => run::run(&args),
        Command::Walk(args) => run::walk(&args),
        Command::Hiscores(args) => hiscores::run(&args),
        Command::Seed(args) => seed::run(&args),
    }
}
