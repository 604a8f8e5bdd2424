//! Deterministic kernel: policies, data lake, compiler, backtest adapter,
//! dossier writer, gates, holdout vault, parameter sweeps, curve
//! composition, registry and indexes.

pub mod backtest;
pub mod catalog;
pub mod compiler;
pub mod composer;
pub mod dossier;
pub mod dsl;
pub mod gates;
pub mod holdout;
pub mod indexer;
pub mod lake;
pub mod policies;
pub mod registry;
pub mod runner;
pub mod sweep;
pub mod trace;

pub use backtest::{run_adapter, BacktestOutput, Strategy, VECTORBT_SIGNAL_V1};
pub use catalog::{DataCatalog, Segment, SegmentKind};
pub use compiler::{compile_blueprint, CompiledRunspec};
pub use composer::{compose_curves, compose_runs, ComposeInput, ComposeOutcome};
pub use dossier::{export_dossier_zip, extend_manifest, verify_dossier, write_dossier, ExistsBehavior};
pub use gates::{run_gates, GateRunInput, GateRunReport};
pub use holdout::{evaluate_holdout, HoldoutResult};
pub use indexer::build_all_indexes;
pub use policies::{PolicyBundle, ResolvedPolicies};
pub use registry::{create_card_from_run, promote_card, record_trial, search_experience, ExperienceQuery};
pub use runner::{run_runspec, EngineSettings, RunOutcome};
pub use sweep::{enumerate_param_grid, run_sweep, SweepSpec};
pub use trace::{run_calc_trace_preview, TracePreviewInput};
