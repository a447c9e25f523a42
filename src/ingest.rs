//! Toggle ingest: reading, merging and post-filtering traces.

use compact_str::CompactString;
use serde::{ Serialize, Deserialize };
use std::path::{ Path, PathBuf };
use crate::config::IngestConfig;
use crate::error::{ Error, Result };
use crate::matrix::{ CsrMatrix, DenseMatrix };
use crate::toggle_file::read_toggle_file;
use crate::vcd::{ read_vcd_toggles, VcdToggles };

/// A traced signal. Its index is its position in the signal list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signal {
    /// Dotted hierarchical path with the top prefix stripped.
    pub name: CompactString,
    /// Bit width.
    pub width: usize,
}

/// Per-window toggle rates of a set of signals, possibly spanning
/// several trace files along the time axis.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToggleTrace {
    /// Cycles per column.
    pub window: u64,
    /// Observed cycles, one entry per trace file.
    pub cycles: Vec<u64>,
    /// Reset cycles, one entry per trace file.
    pub reset_cycles: Vec<u64>,
    pub signals: Vec<Signal>,
    /// Rows are signals, columns are windows.
    pub toggles: CsrMatrix,
    /// Names dropped by post-filtering.
    pub removed: Vec<CompactString>,
}

/// Where toggles come from.
#[derive(Debug, Clone, Copy)]
pub enum ToggleSource<'a> {
    /// A pre-aggregated binary toggle file.
    ToggleFile(&'a Path),
    /// One or more VCD files of the same design, in time order.
    Vcd(&'a [PathBuf]),
}

impl ToggleTrace {
    #[inline]
    pub fn total_cycles(&self) -> u64 {
        self.cycles.iter().sum()
    }

    #[inline]
    pub fn total_reset_cycles(&self) -> u64 {
        self.reset_cycles.iter().sum()
    }

    /// Cycles outside of reset.
    #[inline]
    pub fn active_cycles(&self) -> u64 {
        self.total_cycles() - self.total_reset_cycles()
    }

    pub fn signal_names(&self) -> Vec<CompactString> {
        self.signals.iter().map(|s| s.name.clone()).collect()
    }

    pub fn widths(&self) -> Vec<usize> {
        self.signals.iter().map(|s| s.width).collect()
    }

    /// Windows as rows and signals as columns, ready for regression.
    #[inline]
    pub fn samples(&self) -> DenseMatrix {
        self.toggles.transpose_dense()
    }

    /// Drop every signal for which `keep` is false. Returns the
    /// dropped names, which are also appended to `removed`.
    pub fn retain(&mut self, mut keep: impl FnMut(&Signal) -> bool) -> Vec<CompactString> {
        let mut rows = Vec::with_capacity(self.signals.len());
        let mut dropped = Vec::new();
        for (i, s) in self.signals.iter().enumerate() {
            if keep(s) {
                rows.push(i);
            }
            else {
                dropped.push(s.name.clone());
            }
        }
        if !dropped.is_empty() {
            self.toggles = self.toggles.select_rows(&rows);
            self.signals = rows.iter().map(|&i| self.signals[i].clone()).collect();
            self.removed.extend(dropped.iter().cloned());
        }
        dropped
    }

    /// Windows of every file, each file padded to whole windows.
    pub fn window_count(&self) -> Result<usize> {
        window_count(self.window, &self.cycles, &self.reset_cycles)
    }

    /// Concatenate per-file toggles along the time axis.
    ///
    /// Every file must carry the same signals in the same order. Each
    /// file keeps its own windows, so a trailing partial window of one
    /// file never absorbs cycles of the next.
    pub fn merge(window: u64, parts: Vec<VcdToggles>) -> Result<ToggleTrace> {
        let mut parts = parts.into_iter();
        let Some(first) = parts.next() else {
            return Err(Error::format("no trace files given"));
        };
        let mut cycles = vec![first.cycles];
        let mut reset_cycles = vec![first.reset_cycles];
        let mut matrices = vec![first.toggles];
        for (i, part) in parts.enumerate() {
            if part.signals != first.signals {
                return Err(Error::format(format!(
                    "signals of trace {} differ from the first trace", i + 1)));
            }
            cycles.push(part.cycles);
            reset_cycles.push(part.reset_cycles);
            matrices.push(part.toggles);
        }
        let toggles = if matrices.len() == 1 {
            matrices.pop().unwrap_or_else(|| CsrMatrix::zeros(0, 0))
        } else {
            CsrMatrix::hstack(&matrices)?
        };
        let trace = ToggleTrace {
            window, cycles, reset_cycles,
            signals: first.signals,
            toggles,
            removed: Vec::new(),
        };
        let ncols = trace.window_count()?;
        if trace.toggles.ncols() != ncols {
            return Err(Error::mismatch("merged toggle windows vs file windows",
                                       trace.toggles.ncols(), ncols));
        }
        Ok(trace)
    }
}

/// Column count of a multi-file trace: the sum over files of
/// `ceil(active / window)`.
pub(crate) fn window_count(window: u64, cycles: &[u64], reset_cycles: &[u64]) -> Result<usize> {
    if cycles.len() != reset_cycles.len() {
        return Err(Error::mismatch(
            "cycle lists vs reset cycle lists", cycles.len(), reset_cycles.len()));
    }
    let mut ncols = 0u64;
    for (i, (&c, &r)) in cycles.iter().zip(reset_cycles).enumerate() {
        let active = c.checked_sub(r).ok_or_else(|| Error::format(format!(
            "trace {} has {} reset cycles but only {} cycles", i, r, c)))?;
        ncols += active.div_ceil(window);
    }
    usize::try_from(ncols).map_err(|_| Error::format("window count does not fit in memory"))
}

/// Remove wide and excluded signals according to `config`.
///
/// With a keep-list, exactly the listed signals survive. Without one,
/// signals at least `wide_signal_width` bits wide and names matching
/// the exclusion markers are dropped.
pub fn post_filter(trace: &mut ToggleTrace, config: &IngestConfig) -> Vec<CompactString> {
    let removed = trace.retain(|s| match &config.keep {
        Some(keep) => keep.contains(s.name.as_str()),
        None => s.width < config.wide_signal_width &&
            !config.is_excluded(&s.name)
    });
    clilog::info!(TGL_FILTER, "removed {} wide or excluded signals", removed.len());
    for name in &removed {
        clilog::info!(TGL_FILTER_ITEM, "- {}", name);
    }
    removed
}

/// Read a signal list: one name per line, blank lines and `#`
/// comments ignored.
pub fn read_signal_list(path: impl AsRef<Path>) -> Result<Vec<CompactString>> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_name_lines(&text).map(CompactString::from).collect())
}

pub(crate) fn parse_name_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(|l| l.split('#').next().unwrap_or("").trim())
        .filter(|l| !l.is_empty())
}

/// Read toggles from a toggle file or VCDs, then post-filter.
pub fn read_toggles(source: ToggleSource<'_>, config: &IngestConfig) -> Result<ToggleTrace> {
    let timer = clilog::stimer!("read toggles");
    let mut trace = match source {
        ToggleSource::ToggleFile(path) => {
            let trace = read_toggle_file(path)?;
            if trace.window != config.window {
                return Err(Error::format(format!(
                    "{} has window {}, expected {}",
                    path.display(), trace.window, config.window)));
            }
            trace
        }
        ToggleSource::Vcd(files) => {
            let parts = files.iter()
                .map(|f| read_vcd_toggles(f, config))
                .collect::<Result<Vec<_>>>()?;
            ToggleTrace::merge(config.window, parts)?
        }
    };
    post_filter(&mut trace, config);
    clilog::info!(TGL_READ_DONE,
                  "{} cycles, {} reset cycles, {} signals, {} windows",
                  trace.total_cycles(), trace.total_reset_cycles(),
                  trace.signals.len(), trace.toggles.ncols());
    clilog::finish!(timer);
    Ok(trace)
}
