//! Power traces, model training and prediction.

use compact_str::CompactString;
use indexmap::IndexMap;
use serde::{ Serialize, Deserialize };
use crate::config::FitConfig;
use crate::error::{ Error, Result };
use crate::hierarchy::ModuleHierarchy;
use crate::ingest::{ Signal, ToggleTrace };
use crate::matrix::{ AverageRows, DenseMatrix, translate_indices };
use crate::regression::{ design_matrix, FitReport, PolynomialDesign, Term };

/// Largest tolerated surplus of power samples over trace cycles.
const MAX_POWER_SURPLUS: u64 = 10;

/// Measured power per module. Rows are modules, columns are cycles
/// (or windows once averaged). The first module is the design total.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PowerTraces {
    modules: Vec<CompactString>,
    powers: DenseMatrix,
}

/// Power of one simulation run, excluding its reset period.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PowerRun {
    pub traces: PowerTraces,
    /// Reset cycles reported by the power tool.
    pub reset_cycles: u64,
}

impl PowerTraces {
    pub fn new(modules: Vec<CompactString>, powers: DenseMatrix) -> Result<PowerTraces> {
        if modules.len() != powers.nrows() {
            return Err(Error::mismatch("module names vs power rows",
                                       modules.len(), powers.nrows()));
        }
        Ok(PowerTraces { modules, powers })
    }

    #[inline]
    pub fn modules(&self) -> &[CompactString] {
        &self.modules
    }

    #[inline]
    pub fn powers(&self) -> &DenseMatrix {
        &self.powers
    }

    /// Number of samples per module.
    #[inline]
    pub fn len(&self) -> usize {
        self.powers.ncols()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The design total, i.e. the first trace.
    pub fn total(&self) -> Option<(&CompactString, &[f64])> {
        self.modules.first().map(|m| (m, self.powers.row(0)))
    }

    pub fn get(&self, module: &str) -> Option<&[f64]> {
        self.modules.iter().position(|m| m.as_str() == module).map(|i| self.powers.row(i))
    }

    /// Keep the first `len` samples.
    fn truncate(&self, len: usize) -> PowerTraces {
        let mut powers = DenseMatrix::zeros(self.powers.nrows(), len);
        for i in 0..self.powers.nrows() {
            powers.row_mut(i).copy_from_slice(&self.powers.row(i)[..len]);
        }
        PowerTraces { modules: self.modules.clone(), powers }
    }

    /// Mean over every `window` consecutive samples.
    pub fn average(&self, window: usize) -> PowerTraces {
        PowerTraces {
            modules: self.modules.clone(),
            powers: self.powers.average_rows(window),
        }
    }

    /// Line up per-run power with a toggle trace.
    ///
    /// Each run must report the same reset cycles as its trace file
    /// and at least as many samples as the trace has active cycles,
    /// but fewer than ten more. Runs are truncated, averaged into the
    /// trace window, and concatenated so that the sample count equals
    /// the trace's window count.
    pub fn align(runs: &[PowerRun], trace: &ToggleTrace) -> Result<PowerTraces> {
        if runs.len() != trace.cycles.len() {
            return Err(Error::mismatch("power runs vs trace files",
                                       runs.len(), trace.cycles.len()));
        }
        let Some(first) = runs.first() else {
            return Err(Error::format("no power runs given"));
        };
        let mut parts = Vec::with_capacity(runs.len());
        for (i, run) in runs.iter().enumerate() {
            if run.traces.modules != first.traces.modules {
                return Err(Error::format(format!(
                    "modules of power run {} differ from the first run", i)));
            }
            if run.reset_cycles != trace.reset_cycles[i] {
                return Err(Error::format(format!(
                    "power run {} has {} reset cycles, trace has {}",
                    i, run.reset_cycles, trace.reset_cycles[i])));
            }
            let active = trace.cycles[i].saturating_sub(trace.reset_cycles[i]);
            let samples = run.traces.len() as u64;
            if samples < active || samples >= active + MAX_POWER_SURPLUS {
                return Err(Error::format(format!(
                    "power run {} has {} samples for {} active cycles",
                    i, samples, active)));
            }
            if samples != active {
                clilog::debug!(PWR_TRUNC, "truncating power run {} from {} to {} samples",
                               i, samples, active);
            }
            parts.push(run.traces.truncate(active as usize)
                       .average(trace.window as usize).powers);
        }
        let powers = DenseMatrix::hstack(&parts)?;
        if powers.ncols() != trace.toggles.ncols() {
            return Err(Error::mismatch("power windows vs toggle windows",
                                       powers.ncols(), trace.toggles.ncols()));
        }
        Ok(PowerTraces { modules: first.traces.modules.clone(), powers })
    }
}

/// Normalized error scores of a prediction.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TestScore {
    /// Root mean squared error over the mean measured power.
    pub nrmse: f64,
    /// Error of the mean power over the mean measured power.
    pub avge: f64,
}

impl TestScore {
    pub fn of(y: &[f64], y_hat: &[f64]) -> Result<TestScore> {
        if y.len() != y_hat.len() {
            return Err(Error::mismatch("measured vs predicted samples", y.len(), y_hat.len()));
        }
        if y.is_empty() {
            return Err(Error::mismatch("measured samples vs minimum", 0, 1));
        }
        let n = y.len() as f64;
        let mean = y.iter().sum::<f64>() / n;
        let mean_hat = y_hat.iter().sum::<f64>() / n;
        let mse = y.iter().zip(y_hat).map(|(a, b)| (a - b) * (a - b)).sum::<f64>() / n;
        Ok(TestScore {
            nrmse: mse.sqrt() / mean,
            avge: (mean_hat - mean).abs() / mean,
        })
    }
}

/// Outcome of fitting one target.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FitRecord {
    pub label: CompactString,
    pub target: Vec<f64>,
    pub prediction: Vec<f64>,
    /// `[intercept, term_1, ..]`.
    pub coefficients: Vec<f64>,
    pub report: FitReport,
}

/// All fits of one training run over a shared set of terms.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TrainingRun {
    pub signals: Vec<Signal>,
    pub terms: Vec<Term>,
    pub records: Vec<FitRecord>,
}

impl TrainingRun {
    /// Append the records of another run over the same signals and terms.
    pub fn merge(&mut self, other: TrainingRun) -> Result<()> {
        if other.signals != self.signals {
            return Err(Error::format("training runs use different signals"));
        }
        if other.terms != self.terms {
            return Err(Error::mismatch("terms of merged training run",
                                       other.terms.len(), self.terms.len()));
        }
        self.records.extend(other.records);
        Ok(())
    }

    pub fn get(&self, label: &str) -> Option<&FitRecord> {
        self.records.iter().find(|r| r.label == label)
    }

    /// Keep only the coefficients, keyed by label.
    pub fn model(&self) -> PowerModel {
        PowerModel {
            signals: self.signals.clone(),
            terms: self.terms.clone(),
            modules: self.records.iter()
                .map(|r| (r.label.clone(), r.coefficients.clone()))
                .collect(),
        }
    }
}

/// A trained power model: one coefficient vector per label over
/// shared polynomial terms.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PowerModel {
    pub signals: Vec<Signal>,
    pub terms: Vec<Term>,
    pub modules: IndexMap<CompactString, Vec<f64>>,
}

impl PowerModel {
    /// Terms with a nonzero coefficient for `label`, with their weights.
    pub fn active_terms(&self, label: &str) -> Option<Vec<(String, f64)>> {
        let names: Vec<&str> = self.signals.iter().map(|s| s.name.as_str()).collect();
        let coefs = self.modules.get(label)?;
        Some(self.terms.iter().zip(&coefs[1..])
             .filter(|(_, c)| **c != 0.0)
             .map(|(t, &c)| (t.label(&names), c))
             .collect())
    }

    /// Predict per-window power of every label from a toggle trace.
    ///
    /// The trace must carry every model signal, in any order.
    pub fn predict(&self, trace: &ToggleTrace) -> Result<IndexMap<CompactString, Vec<f64>>> {
        let theirs: Vec<&str> = trace.signals.iter().map(|s| s.name.as_str()).collect();
        let ours: Vec<&str> = self.signals.iter().map(|s| s.name.as_str()).collect();
        let mut positions = Vec::with_capacity(ours.len());
        for name in &ours {
            let i = theirs.iter().position(|t| t == name)
                .ok_or_else(|| Error::Lookup(format!("model signal {} in trace", name)))?;
            positions.push(i);
        }
        // restrict the trace to model signals in trace order, then
        // rewrite term indices into that order
        positions.sort_unstable();
        let trace_order: Vec<&str> = positions.iter().map(|&i| theirs[i]).collect();
        let terms = translate_indices(&ours, &trace_order, &self.terms)?;
        let toggles = trace.toggles.select_rows(&positions);
        let design = design_matrix(&toggles.transpose_dense(), &terms)?;
        self.modules.iter()
            .map(|(label, coefs)| Ok((label.clone(), design.dot(coefs)?)))
            .collect()
    }
}

/// Regression targets as `(label, power, positive)`: the total, then
/// every hierarchy label, then the unconstrained catch-all.
fn power_targets(
    power: &PowerTraces, hierarchy: Option<&ModuleHierarchy>
) -> Result<Vec<(CompactString, Vec<f64>, bool)>> {
    let mut targets = Vec::new();
    match hierarchy {
        Some(h) => {
            let t = h.decompose(power)?;
            targets.push((t.total.0, t.total.1, true));
            targets.extend(t.labels.into_iter().map(|(l, y)| (l, y, true)));
            targets.push((t.catch_all.0, t.catch_all.1, false));
        }
        None => {
            let (name, y) = power.total().ok_or_else(|| Error::format("no power traces"))?;
            targets.push((name.clone(), y.to_vec(), true));
        }
    }
    Ok(targets)
}

/// Score a stored model on a run it was not trained on.
///
/// The new power is split with the same hierarchy as in training, and
/// every model label is scored against its target.
pub fn evaluate_power_model(
    model: &PowerModel, trace: &ToggleTrace, power: &PowerTraces,
    hierarchy: Option<&ModuleHierarchy>
) -> Result<IndexMap<CompactString, TestScore>> {
    if power.len() != trace.toggles.ncols() {
        return Err(Error::mismatch("power samples vs toggle windows",
                                   power.len(), trace.toggles.ncols()));
    }
    let targets = power_targets(power, hierarchy)?;
    let predicted = model.predict(trace)?;
    let mut scores = IndexMap::with_capacity(predicted.len());
    for (label, y_hat) in &predicted {
        let (_, y, _) = targets.iter().find(|(l, _, _)| l == label)
            .ok_or_else(|| Error::Lookup(format!("power target of label {}", label)))?;
        let score = TestScore::of(y, y_hat)?;
        clilog::info!(PWR_TEST, "{}: NRMSE {:.4}, AVGE {:.4}", label, score.nrmse, score.avge);
        scores.insert(label.clone(), score);
    }
    Ok(scores)
}

/// Fit every power target against polynomial terms of the trace.
///
/// Without a hierarchy only the design total is fitted. With one, the
/// total and every label are fitted with non-negative coefficients and
/// the catch-all target without constraint.
pub fn train_power_model(
    trace: &ToggleTrace, power: &PowerTraces,
    hierarchy: Option<&ModuleHierarchy>, config: &FitConfig
) -> Result<TrainingRun> {
    if power.len() != trace.toggles.ncols() {
        return Err(Error::mismatch("power samples vs toggle windows",
                                   power.len(), trace.toggles.ncols()));
    }
    let targets = power_targets(power, hierarchy)?;

    let timer = clilog::stimer!("train power model");
    let design = PolynomialDesign::new(&trace.samples(), config.degree)?;
    let mut records = Vec::with_capacity(targets.len());
    for (label, target, positive) in targets {
        clilog::info!(PWR_FIT, "fitting {} ({} samples)", label, target.len());
        let fit = design.fit(&target, positive, config)?;
        records.push(FitRecord {
            label,
            target,
            prediction: fit.prediction,
            coefficients: fit.coefficients,
            report: fit.report,
        });
    }
    clilog::finish!(timer);
    Ok(TrainingRun { signals: trace.signals.clone(), terms: design.terms, records })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::CsrMatrix;

    fn trace(rows: &[Vec<f64>], names: &[&str], cycles: Vec<u64>, reset: Vec<u64>) -> ToggleTrace {
        ToggleTrace {
            window: 1,
            cycles,
            reset_cycles: reset,
            signals: names.iter().map(|n| Signal { name: (*n).into(), width: 1 }).collect(),
            toggles: CsrMatrix::from_dense(&DenseMatrix::from_rows(rows).unwrap()),
            removed: Vec::new(),
        }
    }

    fn square_trace(n: usize) -> ToggleTrace {
        let a = (0..n).map(|i| if i % 2 == 0 { 1.0 } else { 0.0 }).collect();
        let b = (0..n).map(|i| if i % 4 < 2 { 1.0 } else { 0.0 }).collect();
        trace(&[a, b], &["a", "b"], vec![n as u64 + 1], vec![1])
    }

    fn lasso() -> FitConfig {
        FitConfig { degree: 1, elastic_net: false, ..Default::default() }
    }

    #[test]
    fn align_truncates_and_averages() {
        let mut t = trace(&[vec![0.0, 0.0]], &["a"], vec![5, 3], vec![1, 1]);
        t.window = 2;
        let t = ToggleTrace { toggles: CsrMatrix::zeros(1, 3), ..t };
        let run = |v: Vec<f64>, reset| PowerRun {
            traces: PowerTraces::new(vec!["top".into()],
                                     DenseMatrix::from_rows(&[v]).unwrap()).unwrap(),
            reset_cycles: reset,
        };
        let runs = [run(vec![1.0, 3.0, 5.0, 7.0, 100.0], 1), run(vec![2.0, 4.0], 1)];
        let p = PowerTraces::align(&runs, &t).unwrap();
        assert_eq!(p.total().unwrap().1, &[2.0, 6.0, 3.0]);

        let bad_reset = [run(vec![1.0; 4], 1), run(vec![2.0, 4.0], 0)];
        assert!(matches!(PowerTraces::align(&bad_reset, &t), Err(Error::Format(_))));
        let short = [run(vec![1.0; 3], 1), run(vec![2.0, 4.0], 1)];
        assert!(PowerTraces::align(&short, &t).is_err());
        let long = [run(vec![1.0; 14], 1), run(vec![2.0, 4.0], 1)];
        assert!(PowerTraces::align(&long, &t).is_err());
    }

    #[test]
    fn scores() {
        let s = TestScore::of(&[2.0, 2.0], &[1.0, 3.0]).unwrap();
        assert_eq!(s.nrmse, 0.5);
        assert_eq!(s.avge, 0.0);
        let s = TestScore::of(&[2.0, 2.0], &[3.0, 3.0]).unwrap();
        assert_eq!(s.avge, 0.5);
        assert!(TestScore::of(&[1.0], &[]).is_err());
    }

    #[test]
    fn train_and_predict_total() {
        let t = square_trace(40);
        let y: Vec<f64> = t.samples().column(0).iter().map(|a| 4.0 * a + 2.0).collect();
        let power = PowerTraces::new(vec!["top".into()],
                                     DenseMatrix::from_rows(&[y.clone()]).unwrap()).unwrap();
        let run = train_power_model(&t, &power, None, &lasso()).unwrap();
        assert_eq!(run.records.len(), 1);
        assert_eq!(run.records[0].label, "top");
        assert_eq!(run.records[0].report.df, 1);

        let model = run.model();
        let active = model.active_terms("top").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0, "a");

        // same signals in the opposite order
        let mut swapped = t.clone();
        swapped.signals.reverse();
        swapped.toggles = t.toggles.select_rows(&[1, 0]);
        let direct = model.predict(&t).unwrap();
        let reordered = model.predict(&swapped).unwrap();
        assert_eq!(direct["top"].len(), 40);
        for (a, b) in direct["top"].iter().zip(&reordered["top"]) {
            assert!((a - b).abs() < 1e-12);
        }
        let score = TestScore::of(&y, &direct["top"]).unwrap();
        assert!(score.nrmse < 0.01, "{:?}", score);
    }

    #[test]
    fn hierarchy_targets_and_catch_all() {
        let t = square_trace(40);
        let s = t.samples();
        let core: Vec<f64> = s.column(0).iter().map(|a| 2.0 * a + 1.0).collect();
        let total: Vec<f64> = core.iter().map(|c| c + 0.5).collect();
        let power = PowerTraces::new(
            vec!["top".into(), "top.core".into()],
            DenseMatrix::from_rows(&[total, core]).unwrap()).unwrap();
        let h = ModuleHierarchy::new(&[("top.core", Some("core")), ("other", None)]).unwrap();
        let run = train_power_model(&t, &power, Some(&h), &lasso()).unwrap();
        let labels: Vec<&str> = run.records.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["top", "core", "other"]);
        let rest = run.get("other").unwrap();
        assert!(rest.target.iter().all(|&v| (v - 0.5).abs() < 1e-12));
        assert!((rest.coefficients[0] - 0.5).abs() < 1e-9);

        let mut merged = run.clone();
        merged.merge(run.clone()).unwrap();
        assert_eq!(merged.records.len(), 6);
    }

    #[test]
    fn evaluate_on_held_out_trace() {
        let train = square_trace(40);
        let power_of = |t: &ToggleTrace| {
            let core: Vec<f64> = t.samples().column(0).iter().map(|a| 2.0 * a + 1.0).collect();
            let total: Vec<f64> = core.iter().map(|c| c + 0.5).collect();
            PowerTraces::new(vec!["top".into(), "top.core".into()],
                             DenseMatrix::from_rows(&[total, core]).unwrap()).unwrap()
        };
        let h = ModuleHierarchy::new(&[("top.core", Some("core")), ("other", None)]).unwrap();
        let model = train_power_model(&train, &power_of(&train), Some(&h), &lasso())
            .unwrap().model();

        // a shorter run with the signals listed in the opposite order
        let base = square_trace(24);
        let mut test = base.clone();
        test.signals.reverse();
        test.toggles = base.toggles.select_rows(&[1, 0]);
        let scores = evaluate_power_model(&model, &test, &power_of(&base), Some(&h)).unwrap();
        let labels: Vec<&str> = scores.keys().map(|l| l.as_str()).collect();
        assert_eq!(labels, vec!["top", "core", "other"]);
        assert!(scores["core"].nrmse < 0.01, "{:?}", scores["core"]);
        assert!(scores["top"].avge < 0.01, "{:?}", scores["top"]);

        // without the hierarchy only the total has a target
        let r = evaluate_power_model(&model, &test, &power_of(&base), None);
        assert!(matches!(r, Err(Error::Lookup(_))));
    }

    #[test]
    fn predict_needs_every_signal() {
        let t = square_trace(8);
        let model = PowerModel {
            signals: vec![Signal { name: "gone".into(), width: 1 }],
            terms: vec![Term(vec![0])],
            modules: [("top".into(), vec![0.0, 1.0])].into_iter().collect(),
        };
        assert!(matches!(model.predict(&t), Err(Error::Lookup(_))));
    }

    #[test]
    fn sample_mismatch() {
        let t = square_trace(8);
        let power = PowerTraces::new(vec!["top".into()],
                                     DenseMatrix::from_rows(&[vec![1.0; 7]]).unwrap()).unwrap();
        let r = train_power_model(&t, &power, None, &lasso());
        assert!(matches!(r, Err(Error::DimensionMismatch { .. })));
    }
}
