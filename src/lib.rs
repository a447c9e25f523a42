//! ## `simmani`: activity-based power modeling
//!
//! This contains the core functionalities and data structures
//! for building cycle-level power models from RTL simulation:
//!
//! 1. VCD waveforms are reduced to per-window signal toggle rates
//!    ([`ingest`], [`vcd`], [`toggle_file`]).
//! 2. Signals are clustered by activity and one representative is
//!    kept per cluster ([`cluster`]).
//! 3. Measured module power is regressed on polynomial terms of the
//!    representative toggle rates ([`regression`], [`power`],
//!    [`hierarchy`]).
//!
//! See the binaries for example usage.

pub mod error;
pub mod config;
pub mod matrix;
pub mod vcd;
pub mod toggle_file;
pub mod ingest;
pub mod cluster;
pub mod regression;
pub mod hierarchy;
pub mod power;

pub use error::{ Error, Result };
pub use config::{ ClusterConfig, FitConfig, IngestConfig };
pub use matrix::{ average_rows, divide_csr, translate_indices, CsrMatrix, DenseMatrix };
pub use ingest::{ read_toggles, Signal, ToggleSource, ToggleTrace };
pub use cluster::{ cluster_signals, ClusterResult };
pub use regression::{ build_terms, design_matrix, polynomial_regression, FitReport, Term };
pub use hierarchy::{ find_children, ModuleHierarchy };
pub use power::{ evaluate_power_model, train_power_model, PowerModel, PowerRun, PowerTraces, TestScore, TrainingRun };
