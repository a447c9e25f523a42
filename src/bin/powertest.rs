//! Power model evaluation.
//!
//! This program loads a model written by `powerfit`, predicts the
//! power of a new simulation run from its toggles, and prints the
//! NRMSE and AVGE of every label against the measured power.
//!
//! The hierarchy file must be the one the model was trained with.

use ciborium::{ from_reader, into_writer };
use simmani::{ IngestConfig, ModuleHierarchy, PowerModel, PowerRun, PowerTraces, ToggleSource };
use simmani::{ evaluate_power_model, read_toggles };
use std::fs::File;
use std::io::{ BufReader, BufWriter };
use std::path::PathBuf;

#[derive(clap::Parser, Debug)]
struct PowerTestArgs {
    /// The trained model (CBOR).
    model: PathBuf,
    /// The measured power runs of the new benchmark (CBOR).
    power: PathBuf,
    /// Read toggles from this binary toggle file.
    #[clap(long, conflicts_with = "vcd")]
    toggle_file: Option<PathBuf>,
    /// Read toggles from these vcd files, in time order.
    #[clap(long, num_args = 1..)]
    vcd: Vec<PathBuf>,
    /// The module hierarchy file.
    #[clap(long)]
    hierarchy: Option<PathBuf>,
    /// Cycles aggregated into one window.
    #[clap(long, default_value_t = 1)]
    window: u64,
    /// The optional score output path (CBOR).
    #[clap(long)]
    output: Option<PathBuf>,
}

fn run(args: &PowerTestArgs) -> Result<(), Box<dyn std::error::Error>> {
    let model: PowerModel = from_reader(BufReader::new(File::open(&args.model)?))?;
    clilog::info!(PWRTEST_MODEL, "model: {} signals, {} terms, {} labels",
                  model.signals.len(), model.terms.len(), model.modules.len());

    // only the model's signals are needed
    let config = IngestConfig::with_window(args.window)
        .keep_signals(model.signals.iter().map(|s| s.name.clone()));
    let source = match &args.toggle_file {
        Some(path) => ToggleSource::ToggleFile(path),
        None if !args.vcd.is_empty() => ToggleSource::Vcd(&args.vcd),
        None => return Err("either --toggle-file or --vcd is required".into())
    };
    let trace = read_toggles(source, &config)?;

    let runs: Vec<PowerRun> = from_reader(BufReader::new(File::open(&args.power)?))?;
    let power = PowerTraces::align(&runs, &trace)?;
    let hierarchy = match &args.hierarchy {
        Some(path) => Some(ModuleHierarchy::read(path)?),
        None => None
    };

    let scores = evaluate_power_model(&model, &trace, &power, hierarchy.as_ref())?;
    for (label, score) in &scores {
        println!("{}: NRMSE {:.4}, AVGE {:.4}", label, score.nrmse, score.avge);
    }
    if let Some(path) = &args.output {
        into_writer(&scores, BufWriter::new(File::create(path)?))?;
    }
    Ok(())
}

fn main() {
    clilog::init_stderr_color_debug();
    let args = <PowerTestArgs as clap::Parser>::parse();
    clilog::debug!("args: {:?}", args);
    if let Err(e) = run(&args) {
        clilog::error!(POWERTEST_FAIL, "{}", e);
        std::process::exit(1);
    }
}
