//! Toggle strobe processing.
//!
//! This program reads one or more VCD files of the same design
//! (in time order) and counts per-window signal toggles on the
//! rising clock edges. It outputs a binary toggle file.
//!
//! The toggle file is later read by `sigcluster` and `powerfit`
//! in place of the much larger waveforms.

use simmani::{ IngestConfig, Result, ToggleTrace };
use simmani::ingest::read_signal_list;
use simmani::toggle_file::write_toggle_file;
use simmani::vcd::read_vcd_toggles;
use std::path::PathBuf;

#[derive(clap::Parser, Debug)]
struct ToggleStrobeArgs {
    /// The toggle file output path.
    output: PathBuf,
    /// The input vcd file paths, in time order.
    #[clap(required = true)]
    vcd: Vec<PathBuf>,
    /// Cycles aggregated into one window.
    #[clap(long, default_value_t = 1)]
    window: u64,
    /// The clock signal name.
    #[clap(long, default_value = "clock")]
    clock: String,
    /// The reset signal name.
    #[clap(long, default_value = "reset")]
    reset: String,
    /// Optional file listing the only signals to track.
    #[clap(long)]
    signals: Option<PathBuf>,
}

fn run(args: &ToggleStrobeArgs) -> Result<()> {
    let mut config = IngestConfig {
        clock: args.clock.as_str().into(),
        reset: args.reset.as_str().into(),
        ..IngestConfig::with_window(args.window)
    };
    if let Some(path) = &args.signals {
        config = config.keep_signals(read_signal_list(path)?);
    }
    let parts = args.vcd.iter()
        .map(|f| read_vcd_toggles(f, &config))
        .collect::<Result<Vec<_>>>()?;
    let trace = ToggleTrace::merge(config.window, parts)?;
    write_toggle_file(&args.output, &trace)?;
    clilog::info!(STROBE_DONE, "wrote {} signals, {} windows to {}",
                  trace.signals.len(), trace.toggles.ncols(),
                  args.output.display());
    Ok(())
}

fn main() {
    clilog::init_stderr_color_debug();
    let args = <ToggleStrobeArgs as clap::Parser>::parse();
    clilog::debug!("args: {:?}", args);
    if let Err(e) = run(&args) {
        clilog::error!(STROBE_FAIL, "{}", e);
        std::process::exit(1);
    }
}
