//! VCD event-log toggle extraction.
//!
//! The header is parsed once to build the signal table, then the
//! value changes are streamed with [`vcd_ng::FastFlow`] so memory
//! stays proportional to the number of tracked signals.

use compact_str::CompactString;
use itertools::Itertools;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use vcd_ng::{ Parser, FastFlow, ScopeItem, Var, VarType };
use crate::config::IngestConfig;
use crate::error::{ Error, Result };
use crate::ingest::Signal;
use crate::matrix::{ CsrBuilder, CsrMatrix, divide_csr };

/// Toggle data of a single VCD file.
#[derive(Debug, Clone)]
pub struct VcdToggles {
    /// Observed rising clock edges.
    pub cycles: u64,
    /// Cycles committed while reset was asserted.
    pub reset_cycles: u64,
    pub signals: Vec<Signal>,
    /// Toggle rates, signals by windows.
    pub toggles: CsrMatrix,
}

/// What a VCD id code stands for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Symbol {
    Clock,
    Reset,
    Tracked(usize),
}

/// Clock edge tracking.
///
/// `Rising` means a counted rising edge happened and its toggles have
/// not been committed yet; the commit happens at the next timestamp.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum EdgeState {
    Low,
    Rising,
    High,
}

/// Bit vector of one signal value, least significant word first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BitValue(Vec<u64>);

impl BitValue {
    #[inline]
    fn zeros(width: usize) -> BitValue {
        BitValue(vec![0; width.div_ceil(64).max(1)])
    }

    /// Load a VCD value string (MSB first). Anything other than `1`
    /// reads as zero; short strings are zero-extended.
    fn load(&mut self, bits: &[u8], width: usize) {
        self.0.iter_mut().for_each(|w| *w = 0);
        for (i, &b) in bits.iter().rev().take(width).enumerate() {
            if b == b'1' {
                self.0[i / 64] |= 1 << (i % 64);
            }
        }
    }

    #[inline]
    fn hamming(&self, other: &BitValue) -> u32 {
        self.0.iter().zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Per-signal accumulator state.
#[derive(Debug, Clone)]
struct SignalState {
    width: usize,
    prev: BitValue,
    cur: BitValue,
    pending: bool,
    count: u64,
    /// Flushed (window index, toggle count) pairs.
    entries: Vec<(usize, u64)>,
}

impl SignalState {
    fn new(width: usize) -> SignalState {
        SignalState {
            width,
            prev: BitValue::zeros(width),
            cur: BitValue::zeros(width),
            pending: false,
            count: 0,
            entries: Vec::new(),
        }
    }

    fn flush(&mut self, window_idx: usize) {
        if self.count == 0 {
            return;
        }
        match self.entries.last_mut() {
            Some((idx, c)) if *idx == window_idx => *c += self.count,
            _ => self.entries.push((window_idx, self.count))
        }
        self.count = 0;
    }
}

/// Signal table built from the VCD header.
struct Definitions {
    /// Id code to symbol.
    lookup: Vec<Option<Symbol>>,
    signals: Vec<Signal>,
}

/// Open and parse failures of a VCD are format errors naming the file.
fn vcd_error(vcd_file: &Path, e: std::io::Error) -> Error {
    Error::format(format!("{}: {}", vcd_file.display(), e))
}

/// Walk the scope tree, calling `f` with the scope path of every variable.
fn enumerate_vars(
    items: &[ScopeItem],
    path: &mut Vec<CompactString>,
    f: &mut impl FnMut(&Var, &[CompactString])
) {
    for item in items {
        match item {
            ScopeItem::Var(var) => f(var, &path[..]),
            ScopeItem::Scope(scope) => {
                path.push(scope.identifier.as_str().into());
                enumerate_vars(&scope.children[..], path, f);
                path.pop();
            }
            _ => {}
        }
    }
}

/// Parse the header and register clock, reset and tracked signals.
fn read_definitions(
    vcd_file: &Path, config: &IngestConfig
) -> Result<Definitions> {
    let f = File::open(vcd_file).map_err(|e| vcd_error(vcd_file, e))?;
    let mut f = BufReader::with_capacity(65536, f);
    let mut parser = Parser::new(&mut f);
    let header = parser.parse_header().map_err(|e| vcd_error(vcd_file, e))?;

    let mut id_count = 0;
    enumerate_vars(&header.items[..], &mut Vec::new(), &mut |v, _| {
        id_count = (v.code.0 as usize + 1).max(id_count);
    });
    let mut lookup = vec![None; id_count];
    let mut signals = Vec::new();
    let mut clock = None;
    let mut reset = None;
    // scopes entered before the first variable form the stripped prefix
    let mut prefix: Option<Vec<CompactString>> = None;

    enumerate_vars(&header.items[..], &mut Vec::new(), &mut |var, path| {
        let prefix = prefix.get_or_insert_with(|| path.to_vec());
        if matches!(var.var_type, VarType::Integer | VarType::Real) {
            return
        }
        let rel = match path.strip_prefix(&prefix[..]) {
            Some(rel) => rel,
            None => path
        };
        let name: CompactString = rel.iter().map(|s| s.as_str())
            .chain(std::iter::once(var.reference.as_str()))
            .join(".").into();
        let code = var.code.0 as usize;
        if name == config.clock {
            clock.get_or_insert(code);
        }
        else if name == config.reset {
            reset.get_or_insert(code);
        }
        else if config.is_denied(&name) || !config.is_kept(&name) {
            clilog::debug!(VCD_SKIP, "skip signal {}", name);
        }
        else if lookup[code].is_none() {
            lookup[code] = Some(Symbol::Tracked(signals.len()));
            signals.push(Signal { name, width: var.size as usize });
        }
    });

    let clock = clock.ok_or_else(|| Error::format(format!(
        "no clock signal `{}` in {}", config.clock, vcd_file.display())))?;
    let reset = reset.ok_or_else(|| Error::format(format!(
        "no reset signal `{}` in {}", config.reset, vcd_file.display())))?;
    lookup[clock] = Some(Symbol::Clock);
    lookup[reset] = Some(Symbol::Reset);
    clilog::debug!(VCD_DEFS, "{}: prefix `{}`, {} tracked signals",
                   vcd_file.display(),
                   prefix.as_deref().unwrap_or_default().iter().format("."),
                   signals.len());
    Ok(Definitions { lookup, signals })
}

/// The value-phase state machine.
struct ToggleCounter {
    window: u64,
    cycles: u64,
    reset_cycles: u64,
    edge: EdgeState,
    reset: bool,
    states: Vec<SignalState>,
    /// Signals with a pending value, committed at the next tick.
    pending: Vec<usize>,
    /// Signals with a nonzero accumulator.
    dirty: Vec<usize>,
}

impl ToggleCounter {
    fn new(signals: &[Signal], window: u64) -> ToggleCounter {
        ToggleCounter {
            window,
            cycles: 0,
            reset_cycles: 0,
            edge: EdgeState::Low,
            reset: false,
            states: signals.iter().map(|s| SignalState::new(s.width)).collect(),
            pending: Vec::new(),
            dirty: Vec::new(),
        }
    }

    #[inline]
    fn active_cycles(&self) -> u64 {
        self.cycles - self.reset_cycles
    }

    /// A new timestamp begins.
    fn on_timestamp(&mut self) {
        if self.edge == EdgeState::Rising {
            self.commit();
            self.edge = EdgeState::High;
        }
    }

    fn on_clock(&mut self, high: bool, time: u64) {
        self.edge = match (high, self.edge) {
            (true, EdgeState::Low) if time > 0 => {
                self.cycles += 1;
                EdgeState::Rising
            }
            (true, EdgeState::Low) => EdgeState::High,
            (true, edge) => edge,
            (false, _) => EdgeState::Low,
        };
    }

    fn on_value(&mut self, i: usize, bits: &[u8]) {
        if self.cycles == 0 || self.edge == EdgeState::Low {
            return
        }
        let state = &mut self.states[i];
        state.cur.load(bits, state.width);
        if !state.pending {
            state.pending = true;
            self.pending.push(i);
        }
    }

    /// Fold pending values into the accumulators and flush full windows.
    fn commit(&mut self) {
        if self.reset {
            self.reset_cycles += 1;
        }
        for i in self.pending.drain(..) {
            let state = &mut self.states[i];
            let toggles = state.prev.hamming(&state.cur);
            if toggles > 0 {
                if state.count == 0 {
                    self.dirty.push(i);
                }
                state.count += u64::from(toggles);
                state.prev.0.copy_from_slice(&state.cur.0);
            }
            state.pending = false;
        }
        let active = self.active_cycles();
        if !self.reset && active > 0 && active % self.window == 0 {
            self.flush((active / self.window - 1) as usize);
        }
    }

    fn flush(&mut self, window_idx: usize) {
        for i in self.dirty.drain(..) {
            self.states[i].flush(window_idx);
        }
    }

    /// Flush the trailing partial window and assemble the matrix.
    fn finish(mut self) -> Result<(u64, u64, CsrMatrix)> {
        let active = self.active_cycles();
        if active % self.window != 0 {
            self.flush((active / self.window) as usize);
        }
        let ncols = active.div_ceil(self.window) as usize;
        let mut builder = CsrBuilder::new(ncols);
        let mut denoms = Vec::with_capacity(self.states.len());
        for state in &self.states {
            for &(idx, count) in &state.entries {
                builder.push(idx, count as f64);
            }
            builder.finish_row();
            denoms.push((self.window * state.width as u64) as f64);
        }
        let toggles = divide_csr(&builder.build()?, &denoms)?;
        Ok((self.cycles, self.reset_cycles, toggles))
    }
}

/// Extract per-window toggle rates from one VCD file.
pub fn read_vcd_toggles(
    vcd_file: impl AsRef<Path>, config: &IngestConfig
) -> Result<VcdToggles> {
    let vcd_file = vcd_file.as_ref();
    if config.window == 0 {
        return Err(Error::format("window size must be positive"));
    }
    let timer = clilog::stimer!("read vcd");
    let Definitions { lookup, signals } = read_definitions(vcd_file, config)?;
    let mut counter = ToggleCounter::new(&signals, config.window);

    let f = File::open(vcd_file).map_err(|e| vcd_error(vcd_file, e))?;
    let mut flow = FastFlow::new(f, 65536);
    use vcd_ng::{ FastFlowToken, FFValueChange };
    let mut time = None;
    while let Some(tok) = flow.next_token().map_err(|e| vcd_error(vcd_file, e))? {
        match tok {
            FastFlowToken::Timestamp(t) => {
                counter.on_timestamp();
                time = Some(t);
            }
            FastFlowToken::Value(FFValueChange { id, bits }) => {
                let Some(t) = time else { continue };
                match lookup.get(id.0 as usize).copied().flatten() {
                    Some(Symbol::Clock) =>
                        counter.on_clock(bits.last() == Some(&b'1'), t),
                    Some(Symbol::Reset) =>
                        counter.reset = bits.last() == Some(&b'1'),
                    Some(Symbol::Tracked(i)) => counter.on_value(i, bits),
                    None => {}
                }
            }
        }
    }
    let (cycles, reset_cycles, toggles) = counter.finish()?;
    clilog::info!(VCD_READ, "{}: {} cycles, {} reset cycles, {} signals",
                  vcd_file.display(), cycles, reset_cycles, signals.len());
    clilog::finish!(timer);
    Ok(VcdToggles { cycles, reset_cycles, signals, toggles })
}
