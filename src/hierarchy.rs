//! Module hierarchy and hierarchical power decomposition.

use compact_str::CompactString;
use indexmap::IndexMap;
use serde::{ Serialize, Deserialize };
use std::path::Path;
use crate::error::{ Error, Result };
use crate::ingest::parse_name_lines;
use crate::power::PowerTraces;

/// Whether `child` is a strict path descendant of `parent`.
#[inline]
fn is_descendant(child: &str, parent: &str) -> bool {
    child.len() > parent.len() + 1 &&
        child.starts_with(parent) &&
        child.as_bytes()[parent.len()] == b'.'
}

/// Direct listed children of every listed module.
///
/// A module `c` is a child of `m` when `c` lies under `m` and no other
/// listed module lies between them. Modules without children map to
/// an empty list. Output order follows the input order.
pub fn find_children<S: AsRef<str>>(modules: &[S]) -> IndexMap<CompactString, Vec<CompactString>> {
    let mut children: IndexMap<CompactString, Vec<CompactString>> = modules.iter()
        .map(|m| (CompactString::from(m.as_ref()), Vec::new()))
        .collect();
    for c in modules {
        let c = c.as_ref();
        // the nearest listed ancestor is the longest one
        let parent = modules.iter()
            .map(|m| m.as_ref())
            .filter(|m| is_descendant(c, m))
            .max_by_key(|m| m.len());
        if let Some(p) = parent {
            if let Some(v) = children.get_mut(p) {
                v.push(c.into());
            }
        }
    }
    children
}

/// One module of the power tree.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    /// Dotted instance path, as named in the power traces.
    pub path: CompactString,
    /// Label the module's power is reported and modeled under.
    pub label: CompactString,
}

/// Ordered power-tree partition plus a catch-all label.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ModuleHierarchy {
    modules: Vec<ModuleEntry>,
    catch_all: CompactString,
    children: IndexMap<CompactString, Vec<CompactString>>,
}

/// Regression targets derived from measured module power.
#[derive(Debug, Clone)]
pub struct PowerTargets {
    /// Design total, named after the first power trace.
    pub total: (CompactString, Vec<f64>),
    /// Net power per label, in hierarchy order.
    pub labels: IndexMap<CompactString, Vec<f64>>,
    /// Total minus every label; may be negative.
    pub catch_all: (CompactString, Vec<f64>),
}

impl ModuleHierarchy {
    /// Build from `(path, label)` pairs. The last entry names the
    /// catch-all label; the others partition the power tree.
    pub fn new<S: AsRef<str>>(entries: &[(S, Option<S>)]) -> Result<ModuleHierarchy> {
        let Some(((last, last_label), rest)) = entries.split_last() else {
            return Err(Error::format("empty module hierarchy"));
        };
        let modules: Vec<ModuleEntry> = rest.iter().map(|(p, l)| ModuleEntry {
            path: p.as_ref().into(),
            label: l.as_ref().unwrap_or(p).as_ref().into(),
        }).collect();
        let catch_all = last_label.as_ref().unwrap_or(last).as_ref().into();
        let paths: Vec<&str> = modules.iter().map(|m| m.path.as_str()).collect();
        let children = find_children(&paths);
        Ok(ModuleHierarchy { modules, catch_all, children })
    }

    /// Read a hierarchy file: one `path [label]` entry per line, the
    /// last line naming the catch-all label.
    pub fn read(path: impl AsRef<Path>) -> Result<ModuleHierarchy> {
        ModuleHierarchy::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<ModuleHierarchy> {
        let mut entries: Vec<(&str, Option<&str>)> = Vec::new();
        for line in parse_name_lines(text) {
            let mut fields = line.split_whitespace();
            let (Some(path), label, None) = (fields.next(), fields.next(), fields.next()) else {
                return Err(Error::format(format!("bad hierarchy line: {}", line)));
            };
            entries.push((path, label));
        }
        ModuleHierarchy::new(&entries)
    }

    #[inline]
    pub fn modules(&self) -> &[ModuleEntry] {
        &self.modules
    }

    #[inline]
    pub fn catch_all(&self) -> &str {
        &self.catch_all
    }

    /// Direct listed children of `path`.
    #[inline]
    pub fn children(&self, path: &str) -> &[CompactString] {
        self.children.get(path).map(|v| &v[..]).unwrap_or(&[])
    }

    /// Labels in first-appearance order.
    pub fn labels(&self) -> Vec<CompactString> {
        let mut labels: Vec<CompactString> = Vec::new();
        for m in &self.modules {
            if !labels.contains(&m.label) {
                labels.push(m.label.clone());
            }
        }
        labels
    }

    /// Split measured power into per-label regression targets.
    ///
    /// A module's net power is its measured power minus the measured
    /// power of its direct listed children, so nested power is counted
    /// once. Labels sum the net power of their modules. The catch-all
    /// target is the design total (first trace) minus all labels.
    pub fn decompose(&self, traces: &PowerTraces) -> Result<PowerTargets> {
        let (total_name, total) = traces.total()
            .ok_or_else(|| Error::format("no power traces"))?;
        let mut labels: IndexMap<CompactString, Vec<f64>> = IndexMap::new();
        for m in &self.modules {
            let mut y = traces.get(&m.path)
                .ok_or_else(|| Error::Lookup(format!("power of module {}", m.path)))?
                .to_vec();
            for c in self.children(&m.path) {
                let child = traces.get(c)
                    .ok_or_else(|| Error::Lookup(format!("power of module {}", c)))?;
                y.iter_mut().zip(child).for_each(|(a, b)| *a -= b);
            }
            labels.entry(m.label.clone())
                .or_insert_with(|| vec![0.0; y.len()])
                .iter_mut().zip(&y).for_each(|(a, b)| *a += b);
        }
        let mut rest = total.to_vec();
        for y in labels.values() {
            rest.iter_mut().zip(y).for_each(|(a, b)| *a -= b);
        }
        Ok(PowerTargets {
            total: (total_name.clone(), total.to_vec()),
            labels,
            catch_all: (self.catch_all.clone(), rest),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::DenseMatrix;

    #[test]
    fn children_skip_listed_intermediates() {
        let ch = find_children(&["tile", "tile.core", "tile.core.alu", "tile.icache", "tilex"]);
        assert_eq!(ch["tile"], vec!["tile.core", "tile.icache"]);
        assert_eq!(ch["tile.core"], vec!["tile.core.alu"]);
        assert!(ch["tile.core.alu"].is_empty());
        assert!(ch["tilex"].is_empty());
    }

    #[test]
    fn children_through_unlisted_levels() {
        let ch = find_children(&["top", "top.a.b.leaf"]);
        assert_eq!(ch["top"], vec!["top.a.b.leaf"]);
    }

    #[test]
    fn decompose_counts_nested_power_once() {
        let h = ModuleHierarchy::new(&[
            ("top", None), ("top.leafA", None), ("top.leafB", None), ("misc", None)
        ]).unwrap();
        let traces = PowerTraces::new(
            vec!["top".into(), "top.leafA".into(), "top.leafB".into()],
            DenseMatrix::from_rows(&[vec![10.0], vec![3.0], vec![4.0]]).unwrap()
        ).unwrap();
        let t = h.decompose(&traces).unwrap();
        assert_eq!(t.total.1, vec![10.0]);
        assert_eq!(t.labels["top"], vec![3.0]);
        assert_eq!(t.labels["top.leafA"], vec![3.0]);
        assert_eq!(t.labels["top.leafB"], vec![4.0]);
        assert_eq!(t.catch_all.0, "misc");
        assert_eq!(t.catch_all.1, vec![0.0]);
    }

    #[test]
    fn shared_labels_accumulate() {
        let h = ModuleHierarchy::new(&[
            ("t.core", Some("cpu")), ("t.fpu", Some("cpu")), ("t.mem", None), ("other", None)
        ]).unwrap();
        assert_eq!(h.labels(), vec!["cpu", "t.mem"]);
        let traces = PowerTraces::new(
            vec!["t".into(), "t.core".into(), "t.fpu".into(), "t.mem".into()],
            DenseMatrix::from_rows(&[
                vec![20.0, 22.0], vec![5.0, 6.0], vec![2.0, 2.0], vec![7.0, 9.0]
            ]).unwrap()
        ).unwrap();
        let t = h.decompose(&traces).unwrap();
        assert_eq!(t.labels["cpu"], vec![7.0, 8.0]);
        assert_eq!(t.catch_all.1, vec![6.0, 5.0]);
    }

    #[test]
    fn parse_hierarchy_file() {
        let h = ModuleHierarchy::parse("# partition\ntile.core core\ntile.icache\nrest\n").unwrap();
        assert_eq!(h.modules().len(), 2);
        assert_eq!(h.modules()[0].label, "core");
        assert_eq!(h.modules()[1].label, "tile.icache");
        assert_eq!(h.catch_all(), "rest");
        assert!(ModuleHierarchy::parse("a b c\nrest").is_err());
        assert!(ModuleHierarchy::parse("# empty\n").is_err());
    }

    #[test]
    fn missing_module_power() {
        let h = ModuleHierarchy::new(&[("t.core", None), ("misc", None)]).unwrap();
        let traces = PowerTraces::new(
            vec!["t".into()], DenseMatrix::from_rows(&[vec![1.0]]).unwrap()).unwrap();
        assert!(matches!(h.decompose(&traces), Err(Error::Lookup(_))));
    }
}
