//! Signal clustering.
//!
//! This program reads toggles (a toggle file or VCD files), clusters
//! the signals by their switching activity, and prints one
//! representative signal per cluster.
//!
//! The printed list is meant to be fed back as the keep-list of
//! `togglestrobe` or `powerfit`.

use ciborium::into_writer;
use rand::rngs::StdRng;
use rand::SeedableRng;
use simmani::{ ClusterConfig, IngestConfig, ToggleSource };
use simmani::{ cluster_signals, read_toggles };
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

#[derive(clap::Parser, Debug)]
struct SigClusterArgs {
    /// Read toggles from this binary toggle file.
    #[clap(long, conflicts_with = "vcd")]
    toggle_file: Option<PathBuf>,
    /// Read toggles from these vcd files, in time order.
    #[clap(long, num_args = 1..)]
    vcd: Vec<PathBuf>,
    /// Cycles aggregated into one window.
    #[clap(long, default_value_t = 1)]
    window: u64,
    /// The smallest cluster count tried.
    #[clap(long, default_value_t = 1)]
    min_k: usize,
    /// The largest cluster count tried.
    ///
    /// If not specified, it is derived from the signal count.
    #[clap(long)]
    max_k: Option<usize>,
    /// Seed for the projection, k-means restarts and the sweep.
    #[clap(long, default_value_t = 0)]
    seed: u64,
    /// The optional cluster result output path (CBOR).
    #[clap(long)]
    output: Option<PathBuf>,
}

fn run(args: &SigClusterArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = IngestConfig::with_window(args.window);
    let source = match &args.toggle_file {
        Some(path) => ToggleSource::ToggleFile(path),
        None if !args.vcd.is_empty() => ToggleSource::Vcd(&args.vcd),
        None => return Err("either --toggle-file or --vcd is required".into())
    };
    let trace = read_toggles(source, &config)?;
    let n = trace.signals.len();
    let max_k = args.max_k
        .unwrap_or_else(|| ClusterConfig::max_k_for(n, args.min_k))
        .min(trace.toggles.ncols());
    let cluster_config = ClusterConfig { seed: args.seed, ..Default::default() };
    let mut rng = StdRng::seed_from_u64(args.seed);
    let result = cluster_signals(&trace.toggles, args.min_k, max_k,
                                 &cluster_config, &mut rng)?;

    let names = trace.signal_names();
    for group in result.groups(&names) {
        clilog::debug!("{}: {} members", group[0], group.len());
    }
    for name in result.center_names(&names) {
        println!("{}", name);
    }
    if let Some(path) = &args.output {
        into_writer(&result, BufWriter::new(File::create(path)?))?;
    }
    Ok(())
}

fn main() {
    clilog::init_stderr_color_debug();
    let args = <SigClusterArgs as clap::Parser>::parse();
    clilog::debug!("args: {:?}", args);
    if let Err(e) = run(&args) {
        clilog::error!(SIGCLUSTER_FAIL, "{}", e);
        std::process::exit(1);
    }
}
