//! Power model fitting.
//!
//! This program reads toggles of the representative signals and the
//! measured per-module power of the same simulation runs, then fits
//! one polynomial power model per module label.
//!
//! The power runs are a CBOR list of `PowerRun`, one per trace file
//! and in the same order. The optional hierarchy file lists one
//! `path [label]` per line, the last line naming the catch-all label.

use ciborium::{ from_reader, into_writer };
use simmani::{ FitConfig, IngestConfig, ModuleHierarchy, PowerRun, PowerTraces, ToggleSource };
use simmani::{ read_toggles, train_power_model, TestScore };
use simmani::ingest::read_signal_list;
use std::fs::File;
use std::io::{ BufReader, BufWriter };
use std::path::PathBuf;

#[derive(clap::Parser, Debug)]
struct PowerFitArgs {
    /// The measured power runs (CBOR).
    power: PathBuf,
    /// The model output path (CBOR).
    model: PathBuf,
    /// Read toggles from this binary toggle file.
    #[clap(long, conflicts_with = "vcd")]
    toggle_file: Option<PathBuf>,
    /// Read toggles from these vcd files, in time order.
    #[clap(long, num_args = 1..)]
    vcd: Vec<PathBuf>,
    /// The representative signal list, one name per line.
    #[clap(long)]
    signals: Option<PathBuf>,
    /// The module hierarchy file.
    ///
    /// If not specified, only the design total is modeled.
    #[clap(long)]
    hierarchy: Option<PathBuf>,
    /// Cycles aggregated into one window.
    #[clap(long, default_value_t = 1)]
    window: u64,
    /// Highest polynomial degree.
    #[clap(long, default_value_t = 2)]
    degree: usize,
    /// Use plain L1 instead of the elastic net.
    #[clap(long)]
    lasso: bool,
    /// The optional training run output path (CBOR), with targets,
    /// predictions and fit statistics.
    #[clap(long)]
    run_output: Option<PathBuf>,
}

fn run(args: &PowerFitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = IngestConfig::with_window(args.window);
    if let Some(path) = &args.signals {
        config = config.keep_signals(read_signal_list(path)?);
    }
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

    let fit_config = FitConfig {
        degree: args.degree,
        elastic_net: !args.lasso,
        ..Default::default()
    };
    let training = train_power_model(&trace, &power, hierarchy.as_ref(), &fit_config)?;
    for r in &training.records {
        let score = TestScore::of(&r.target, &r.prediction)?;
        println!("{}: {} terms, R^2 {:.4}, BIC {:.2}, NRMSE {:.4}, AVGE {:.4}",
                 r.label, r.report.df, r.report.r2, r.report.bic,
                 score.nrmse, score.avge);
    }
    into_writer(&training.model(), BufWriter::new(File::create(&args.model)?))?;
    if let Some(path) = &args.run_output {
        into_writer(&training, BufWriter::new(File::create(path)?))?;
    }
    Ok(())
}

fn main() {
    clilog::init_stderr_color_debug();
    let args = <PowerFitArgs as clap::Parser>::parse();
    clilog::debug!("args: {:?}", args);
    if let Err(e) = run(&args) {
        clilog::error!(POWERFIT_FAIL, "{}", e);
        std::process::exit(1);
    }
}
