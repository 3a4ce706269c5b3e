use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Subcommand};
use glob::glob;
use log::info;
use pm_walk::{compile_hiscores, HiscoreConfig, HiscorePaths, HiscoreRecord, Hiscores};

#[derive(Args, Debug)]
pub struct HiscoresArgs {
    #[command(subcommand)]
    pub command: HiscoresCommand,
}

#[derive(Subcommand, Debug)]
pub enum HiscoresCommand {
    /// Merge several hiscore records into one.
    Compile(CompileArgs),
    /// Print a hiscore record as a table.
    Show(ShowArgs),
}

#[derive(Args, Debug)]
pub struct CompileArgs {
    /// Record paths or glob patterns.
    #[arg(long = "inputs", value_name = "PATH", num_args = 1.., required = true)]
    pub inputs: Vec<PathBuf>,
    /// Slots of the merged list.
    #[arg(long, default_value_t = 10)]
    pub capacity: usize,
    /// Destination record; ranked states and cutoff land beside it.
    #[arg(long)]
    pub out: PathBuf,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Record to print.
    pub record: PathBuf,
}

pub fn run(args: &HiscoresArgs) -> Result<(), Box<dyn Error>> {
    match &args.command {
        HiscoresCommand::Compile(args) => compile(args),
        HiscoresCommand::Show(args) => show(args),
    }
}

fn compile(args: &CompileArgs) -> Result<(), Box<dyn Error>> {
    let inputs = resolve_paths(&args.inputs)?;
    let slots = compile_hiscores(&inputs, args.capacity)?;
    let config = HiscoreConfig {
        capacity: args.capacity,
        ..HiscoreConfig::default()
    };
    let mut board = Hiscores::persistent(config, HiscorePaths::for_record(&args.out));
    board.overwrite(slots)?;
    info!(
        "merged {} records into {}",
        inputs.len(),
        args.out.display()
    );
    print!("{board}");
    Ok(())
}

fn show(args: &ShowArgs) -> Result<(), Box<dyn Error>> {
    let record = HiscoreRecord::load(&args.record)?;
    println!(
        "{} (generation {}, written {})",
        args.record.display(),
        record.generation,
        record.timestamp
    );
    let config = HiscoreConfig {
        capacity: record.slots.len(),
        strip_combinations: false,
        ..HiscoreConfig::default()
    };
    let mut board = Hiscores::in_memory(config);
    board.overwrite(record.slots)?;
    print!("{board}");
    Ok(())
}

fn resolve_paths(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, Box<dyn Error>> {
    let mut resolved = Vec::new();
    for input in inputs {
        let text = input.to_string_lossy();
        if text.contains('*') || text.contains('?') || text.contains('[') {
            for entry in glob(&text)? {
                resolved.push(entry?);
            }
        } else {
            resolved.push(input.clone());
        }
    }
    resolved.sort();
    resolved.dedup();
    if resolved.is_empty() {
        return Err("no hiscore records matched the inputs".into());
    }
    Ok(resolved)
}
