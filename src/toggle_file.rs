//! Binary toggle file.
//!
//! A compact, pre-aggregated form of [`ToggleTrace`]. All fields are
//! little endian. Arrays are prefixed with their `u64` length.
//!
//! ```text
//! window           u64
//! cycles           u64 array
//! reset cycles     u64 array
//! signals          u64 count, then (u64 length, utf-8 bytes) each
//! widths           u64 array
//! row pointers     u64 array (signals + 1)
//! entries          (u64 column, u32 toggle count) until end of file
//! ```

use std::fs::File;
use std::io::{ self, BufReader, BufWriter, Read, Write };
use std::path::Path;
use crate::error::{ Error, Result };
use crate::ingest::{ window_count, Signal, ToggleTrace };
use crate::matrix::{ CsrMatrix, divide_csr, multiply_rows };

/// Reader that turns early EOF into a format error naming the field.
struct FieldReader<R> {
    inner: R,
}

impl<R: Read> FieldReader<R> {
    fn bytes<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::format(format!(
                "truncated toggle file while reading {}", what)),
            _ => Error::Io(e)
        })?;
        Ok(buf)
    }

    #[inline]
    fn u64(&mut self, what: &str) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes::<8>(what)?))
    }

    #[inline]
    fn len(&mut self, what: &str) -> Result<usize> {
        usize::try_from(self.u64(what)?).map_err(|_| Error::format(format!(
            "length of {} does not fit in memory", what)))
    }

    fn u64_array(&mut self, what: &str) -> Result<Vec<u64>> {
        let len = self.len(what)?;
        let mut v = Vec::with_capacity(len.min(1 << 16));
        for _ in 0..len {
            v.push(self.u64(what)?);
        }
        Ok(v)
    }

    fn string(&mut self, what: &str) -> Result<String> {
        let len = self.len(what)?;
        let mut buf = Vec::with_capacity(len.min(1 << 16));
        (&mut self.inner).take(len as u64).read_to_end(&mut buf)?;
        if buf.len() != len {
            return Err(Error::format(format!(
                "truncated toggle file while reading {}", what)));
        }
        String::from_utf8(buf).map_err(|_| Error::format(format!(
            "{} is not valid utf-8", what)))
    }

    /// Next `(column, count)` entry, or `None` at a clean end of file.
    fn entry(&mut self) -> Result<Option<(u64, u32)>> {
        let mut buf = [0u8; 12];
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into())
            }
        }
        match filled {
            0 => Ok(None),
            12 => {
                let mut col = [0u8; 8];
                let mut cnt = [0u8; 4];
                col.copy_from_slice(&buf[..8]);
                cnt.copy_from_slice(&buf[8..]);
                Ok(Some((u64::from_le_bytes(col), u32::from_le_bytes(cnt))))
            }
            _ => Err(Error::format("truncated toggle entry at end of file"))
        }
    }
}

/// Read a binary toggle file into a trace with toggle rates.
pub fn read_toggle_file(path: impl AsRef<Path>) -> Result<ToggleTrace> {
    let path = path.as_ref();
    let f = File::open(path)?;
    read_toggles_from(BufReader::with_capacity(65536, f))
}

/// Read the binary toggle layout from any reader.
pub fn read_toggles_from<R: Read>(reader: R) -> Result<ToggleTrace> {
    let mut r = FieldReader { inner: reader };
    let window = r.u64("window")?;
    if window == 0 {
        return Err(Error::format("window size must be positive"));
    }
    let cycles = r.u64_array("cycles")?;
    let reset_cycles = r.u64_array("reset cycles")?;
    let ncols = window_count(window, &cycles, &reset_cycles)?;
    let num_signals = r.len("signal count")?;
    let mut names = Vec::with_capacity(num_signals.min(1 << 16));
    for _ in 0..num_signals {
        names.push(r.string("signal name")?);
    }
    let widths = r.u64_array("widths")?;
    if widths.len() != names.len() {
        return Err(Error::mismatch("widths vs signals", widths.len(), names.len()));
    }
    let indptr = r.u64_array("row pointers")?
        .into_iter().map(|p| p as usize).collect::<Vec<_>>();

    let mut indices = Vec::new();
    let mut counts = Vec::new();
    while let Some((col, count)) = r.entry()? {
        indices.push(col as usize);
        counts.push(count as f64);
    }

    let raw = CsrMatrix::from_parts(names.len(), ncols, indptr, indices, counts)?;
    let signals: Vec<Signal> = names.into_iter().zip(widths)
        .map(|(name, width)| Signal { name: name.into(), width: width as usize })
        .collect();
    let denoms = signals.iter()
        .map(|s| (window * s.width as u64) as f64)
        .collect::<Vec<_>>();
    let toggles = divide_csr(&raw, &denoms)?;
    clilog::debug!(TGL_READ, "toggle file: window {}, {} signals, {} entries",
                   window, signals.len(), toggles.nnz());
    Ok(ToggleTrace {
        window, cycles, reset_cycles, signals, toggles,
        removed: Vec::new(),
    })
}

/// Write a trace in the binary toggle layout.
///
/// Rates are scaled back to integer toggle counts, which must fit in
/// 32 bits.
pub fn write_toggle_file(path: impl AsRef<Path>, trace: &ToggleTrace) -> Result<()> {
    let f = File::create(path.as_ref())?;
    let mut w = BufWriter::with_capacity(65536, f);
    write_toggles_to(&mut w, trace)?;
    w.flush()?;
    Ok(())
}

/// Write the binary toggle layout to any writer.
pub fn write_toggles_to<W: Write>(w: &mut W, trace: &ToggleTrace) -> Result<()> {
    fn put_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
        w.write_all(&v.to_le_bytes())
    }
    fn put_array<W: Write>(w: &mut W, v: impl ExactSizeIterator<Item = u64>) -> io::Result<()> {
        put_u64(w, v.len() as u64)?;
        for x in v {
            put_u64(w, x)?;
        }
        Ok(())
    }

    let factors = trace.signals.iter()
        .map(|s| (trace.window * s.width as u64) as f64)
        .collect::<Vec<_>>();
    let counts = multiply_rows(&trace.toggles, &factors)?;

    put_u64(w, trace.window)?;
    put_array(w, trace.cycles.iter().copied())?;
    put_array(w, trace.reset_cycles.iter().copied())?;
    put_u64(w, trace.signals.len() as u64)?;
    for s in &trace.signals {
        put_u64(w, s.name.len() as u64)?;
        w.write_all(s.name.as_bytes())?;
    }
    put_array(w, trace.signals.iter().map(|s| s.width as u64))?;
    put_array(w, counts.indptr().iter().map(|&p| p as u64))?;
    for (&col, &count) in counts.indices().iter().zip(counts.data()) {
        let rounded = count.round();
        if !(0.0..=u32::MAX as f64).contains(&rounded) {
            return Err(Error::format(format!(
                "toggle count {} in column {} does not fit in 32 bits", rounded, col)));
        }
        put_u64(w, col as u64)?;
        w.write_all(&(rounded as u32).to_le_bytes())?;
    }
    Ok(())
}
