//! Deterministic parameter sweep over a compiled runspec.
//!
//! Every grid point is a full run: the base strategy's `params` are
//! overridden, the trial runspec is sealed into its own dossier and gated.
//! Evidence lands in `trials.jsonl` (append-only, resumable by params hash)
//! and `leaderboard.json`. Ranking uses the test metric only; the holdout
//! contributes nothing but its pass/fail filter.

use anyhow::Result;
use eam_core::{
    append_jsonl, atomic_write_json_pretty, canonical_json_digest, ensure_dir, read_json_object, read_jsonl,
    sha256_file, EamError,
};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::dossier::ExistsBehavior;
use crate::gates::{run_gates, GateRunInput};
use crate::policies::{BudgetParams, ResolvedPolicies};
use crate::runner::run_runspec;

pub const TRIALS_FILE: &str = "trials.jsonl";
pub const LEADERBOARD_FILE: &str = "leaderboard.json";
pub const SWEEP_METRICS: &[&str] = &["sharpe", "total_return", "max_drawdown"];
const LEADERBOARD_TOP: usize = 10;

#[derive(Clone, Debug, PartialEq)]
pub struct SweepSpec {
    pub param_grid: Map<String, Value>,
    pub metric: String,
    pub higher_is_better: bool,
    pub max_trials: Option<u64>,
    pub stop_if_no_improvement_n: Option<u64>,
}

impl SweepSpec {
    /// Unknown metrics fall back to `sharpe`.
    pub fn parse(doc: &Value) -> Result<SweepSpec> {
        let param_grid = doc
            .get("param_grid")
            .and_then(|v| v.as_object())
            .cloned()
            .ok_or_else(|| EamError::InvalidContract("sweep_spec.param_grid must be an object".into()))?;
        let metric = doc
            .get("metric")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|m| SWEEP_METRICS.contains(m))
            .unwrap_or("sharpe")
            .to_string();
        Ok(SweepSpec {
            param_grid,
            metric,
            higher_is_better: doc.get("higher_is_better").and_then(|v| v.as_bool()).unwrap_or(true),
            max_trials: doc.get("max_trials").and_then(|v| v.as_u64()).filter(|n| *n > 0),
            stop_if_no_improvement_n: doc.get("stop_if_no_improvement_n").and_then(|v| v.as_u64()),
        })
    }
}

/// `sweep_spec` carried by a job spec: top level, `extensions`, or the
/// submitted blueprint's `extensions`.
pub fn find_sweep_spec(job_spec: &Value) -> Option<&Value> {
    ["/sweep_spec", "/extensions/sweep_spec", "/blueprint/extensions/sweep_spec"]
        .iter()
        .filter_map(|p| job_spec.pointer(p))
        .find(|v| v.is_object())
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        _ => 3,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    type_rank(a).cmp(&type_rank(b)).then_with(|| match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => Ordering::Equal,
    })
}

/// Cartesian product of the grid: keys sorted, each key's values sorted
/// null < bool < number < string.
pub fn enumerate_param_grid(grid: &Map<String, Value>) -> Result<Vec<Map<String, Value>>> {
    if grid.is_empty() {
        return Err(EamError::InvalidContract("sweep_spec.param_grid must be a non-empty object".into()).into());
    }
    let mut keys: Vec<&String> = grid.keys().collect();
    keys.sort();
    let mut axes = Vec::new();
    for key in &keys {
        let values = match grid.get(*key).and_then(|v| v.as_array()) {
            Some(v) if !v.is_empty() => v,
            _ => {
                return Err(EamError::InvalidContract(format!(
                    "sweep_spec.param_grid['{}'] must be a non-empty list",
                    key
                ))
                .into())
            }
        };
        if values.iter().any(|v| v.is_array() || v.is_object()) {
            return Err(EamError::InvalidContract(format!(
                "sweep_spec.param_grid['{}'] contains an unsupported value type",
                key
            ))
            .into());
        }
        let mut sorted = values.clone();
        sorted.sort_by(compare_values);
        axes.push(sorted);
    }
    let mut combos = vec![Map::new()];
    for (key, axis) in keys.iter().zip(axes) {
        let mut next = Vec::with_capacity(combos.len() * axis.len());
        for base in &combos {
            for v in &axis {
                let mut m = base.clone();
                m.insert((*key).clone(), v.clone());
                next.push(m);
            }
        }
        combos = next;
    }
    Ok(combos)
}

pub struct SweepInput<'a> {
    pub job_id: &'a str,
    pub spec: &'a SweepSpec,
    pub base_runspec: &'a Value,
    pub bundle_path: &'a Path,
    pub data_root: &'a Path,
    pub artifact_root: &'a Path,
    pub job_root: &'a Path,
    pub out_dir: &'a Path,
}

#[derive(Clone, Debug)]
pub struct SweepOutcome {
    pub status: String,
    pub trials_path: PathBuf,
    pub leaderboard_path: PathBuf,
    pub trials_recorded: usize,
    pub stopped: Option<Value>,
}

impl SweepOutcome {
    pub fn to_json(&self) -> Value {
        json!({
            "status": self.status,
            "sweep_trials_path": self.trials_path.display().to_string(),
            "sweep_leaderboard_path": self.leaderboard_path.display().to_string(),
            "trials_recorded": self.trials_recorded,
            "stopped": self.stopped,
        })
    }
}

fn metric_of(trial: &Value) -> Option<f64> {
    trial.get("test_metric").and_then(|v| v.as_f64())
}

/// Gate-passing and not failing the holdout filter.
fn eligible(trial: &Value) -> bool {
    trial.get("overall_pass").and_then(|v| v.as_bool()) == Some(true)
        && trial.get("holdout_pass_minimal").and_then(|v| v.as_bool()) != Some(false)
}

fn better(candidate: f64, best: f64, higher_is_better: bool) -> bool {
    if higher_is_better {
        candidate > best
    } else {
        candidate < best
    }
}

struct Limits {
    max_trials: usize,
    stop_if_no_improvement_n: u64,
    budget_policy_ref: Value,
}

/// Budget policy caps the sweep; the sweep spec may only tighten it.
fn limits(spec: &SweepSpec, grid_total: usize, policies: &ResolvedPolicies) -> Result<Limits> {
    let (budget, budget_ref) = match &policies.budget {
        Some(p) => (
            Some(p.typed_params::<BudgetParams>()?),
            json!({
                "budget_policy_path": p.path.display().to_string(),
                "budget_policy_id": p.policy_id,
                "budget_policy_sha256": sha256_file(&p.path)?,
            }),
        ),
        None => (None, Value::Null),
    };
    let mut max_trials = grid_total;
    if let Some(cap) = budget.as_ref().map(|b| b.max_proposals_per_job).filter(|n| *n > 0) {
        max_trials = max_trials.min(cap as usize);
    }
    if let Some(cap) = spec.max_trials {
        max_trials = max_trials.min(cap as usize);
    }
    let policy_n = budget.and_then(|b| b.stop_if_no_improvement_n).unwrap_or(0);
    let stop_if_no_improvement_n = match spec.stop_if_no_improvement_n {
        Some(n) if policy_n > 0 => policy_n.min(n),
        Some(n) => n,
        None => policy_n,
    };
    Ok(Limits {
        max_trials,
        stop_if_no_improvement_n,
        budget_policy_ref: budget_ref,
    })
}

fn trial_runspec(base: &Value, base_dsl: &Value, params: &Map<String, Value>, metric: &str) -> Value {
    let mut dsl = base_dsl.clone();
    let mut merged = dsl.get("params").and_then(|v| v.as_object()).cloned().unwrap_or_default();
    merged.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
    dsl["params"] = Value::Object(merged);
    let mut runspec = base.clone();
    runspec["extensions"]["signal_dsl_hash"] = json!(canonical_json_digest(&dsl));
    runspec["extensions"]["strategy_spec"] = dsl;
    runspec["extensions"]["sweep_params"] = Value::Object(params.clone());
    runspec["extensions"]["sweep_metric"] = json!(metric);
    runspec
}

/// Run the grid for one job. A present leaderboard makes this a noop.
pub fn run_sweep(input: &SweepInput<'_>) -> Result<SweepOutcome> {
    let trials_path = input.out_dir.join(TRIALS_FILE);
    let leaderboard_path = input.out_dir.join(LEADERBOARD_FILE);
    if leaderboard_path.is_file() {
        tracing::info!(job_id = input.job_id, "sweep leaderboard exists; noop");
        return Ok(SweepOutcome {
            status: "noop".into(),
            trials_recorded: read_jsonl(&trials_path)?.len(),
            trials_path,
            leaderboard_path,
            stopped: None,
        });
    }
    let spec = input.spec;
    let combos = enumerate_param_grid(&spec.param_grid)?;
    let base_dsl = input
        .base_runspec
        .pointer("/extensions/strategy_spec")
        .filter(|v| v.is_object())
        .ok_or_else(|| EamError::InvalidContract("sweep needs a signal strategy_spec in runspec.extensions".into()))?;
    let policies = ResolvedPolicies::load(input.bundle_path)?;
    let limits = limits(spec, combos.len(), &policies)?;
    ensure_dir(input.out_dir)?;

    let mut done: BTreeSet<String> = read_jsonl(&trials_path)?
        .iter()
        .filter_map(|t| t.get("params").filter(|p| p.is_object()).map(canonical_json_digest))
        .collect();
    let dossiers_dir = input.artifact_root.join("dossiers");
    let mut best: Option<f64> = None;
    let mut streak = 0u64;
    let mut tried = 0usize;
    let mut stopped = None;

    for (index, params) in combos.iter().enumerate() {
        if tried >= limits.max_trials {
            stopped = Some(json!({
                "reason": "max_trials",
                "limit": limits.max_trials,
                "current_trials": tried,
                "grid_total": combos.len(),
            }));
            tracing::info!(job_id = input.job_id, limit = limits.max_trials, "sweep trial budget exhausted");
            break;
        }
        let key = canonical_json_digest(&Value::Object(params.clone()));
        if done.contains(&key) {
            tried += 1;
            continue;
        }
        let runspec = trial_runspec(input.base_runspec, base_dsl, params, &spec.metric);
        let mut trial = json!({
            "schema_version": "sweep_trial_v1",
            "job_id": input.job_id,
            "trial_index": index,
            "params": params,
            "metric": spec.metric,
            "higher_is_better": spec.higher_is_better,
            "test_metric": null,
            "overall_pass": false,
            "holdout_pass_minimal": null,
            "run_id": eam_core::short_digest(&runspec),
            "dossier_path": null,
            "gate_results_path": null,
        });
        match run_runspec(&runspec, input.bundle_path, input.data_root, &dossiers_dir, ExistsBehavior::Noop) {
            Ok(outcome) => {
                let report = run_gates(&GateRunInput {
                    dossier_dir: &outcome.dossier_dir,
                    bundle_path: input.bundle_path,
                    data_root: input.data_root,
                    artifact_root: input.artifact_root,
                    job_root: input.job_root,
                })?;
                let holdout_pass = read_json_object(&report.gate_results_path)
                    .and_then(|d| d.pointer("/holdout_summary/pass").and_then(|v| v.as_bool()));
                trial["test_metric"] = outcome.metrics.get(&spec.metric).cloned().unwrap_or(Value::Null);
                trial["overall_pass"] = json!(report.overall_pass);
                trial["holdout_pass_minimal"] = json!(holdout_pass);
                trial["dossier_path"] = json!(outcome.dossier_dir.display().to_string());
                trial["gate_results_path"] = json!(report.gate_results_path.display().to_string());
            }
            Err(err) => {
                tracing::warn!(job_id = input.job_id, trial_index = index, error = %err, "sweep trial failed");
                trial["error"] = json!(format!("{:#}", err));
            }
        }
        append_jsonl(&trials_path, &trial)?;
        done.insert(key);
        tried += 1;

        match metric_of(&trial).filter(|_| eligible(&trial)) {
            Some(m) if best.map(|b| better(m, b, spec.higher_is_better)).unwrap_or(true) => {
                best = Some(m);
                streak = 0;
            }
            _ => streak += 1,
        }
        if limits.stop_if_no_improvement_n > 0 && streak >= limits.stop_if_no_improvement_n {
            stopped = Some(json!({
                "reason": "stop_if_no_improvement_n",
                "limit": limits.stop_if_no_improvement_n,
                "no_improve_streak": streak,
                "trials_completed": tried,
            }));
            tracing::info!(job_id = input.job_id, streak, "sweep stopped without improvement");
            break;
        }
    }

    let all = read_jsonl(&trials_path)?;
    let leaderboard = build_leaderboard(input.job_id, spec, &all, combos.len(), &limits, stopped.as_ref());
    atomic_write_json_pretty(&leaderboard_path, &leaderboard)?;
    Ok(SweepOutcome {
        status: "created".into(),
        trials_recorded: all.len(),
        trials_path,
        leaderboard_path,
        stopped,
    })
}

fn build_leaderboard(
    job_id: &str,
    spec: &SweepSpec,
    trials: &[Value],
    grid_total: usize,
    limits: &Limits,
    stopped: Option<&Value>,
) -> Value {
    let mut ranked: Vec<(&Value, f64)> = trials
        .iter()
        .filter(|t| eligible(t))
        .filter_map(|t| metric_of(t).map(|m| (t, m)))
        .collect();
    // stable sort keeps grid order among ties
    ranked.sort_by(|a, b| {
        let ord = a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal);
        if spec.higher_is_better {
            ord.reverse()
        } else {
            ord
        }
    });
    let pick = |t: Option<&Value>, keys: &[&str]| -> Value {
        let mut out = Map::new();
        for k in keys {
            out.insert((*k).to_string(), t.and_then(|t| t.get(*k)).cloned().unwrap_or(Value::Null));
        }
        Value::Object(out)
    };
    let best = pick(
        ranked.first().map(|(t, _)| *t),
        &["trial_index", "params", "test_metric", "run_id", "dossier_path", "gate_results_path"],
    );
    let top: Vec<Value> = ranked
        .iter()
        .take(LEADERBOARD_TOP)
        .map(|(t, _)| {
            pick(
                Some(*t),
                &["trial_index", "params", "test_metric", "run_id", "dossier_path", "overall_pass", "holdout_pass_minimal"],
            )
        })
        .collect();
    let mut extensions = Map::new();
    if let Some(s) = stopped {
        extensions.insert("stopped".into(), s.clone());
    }
    json!({
        "schema_version": "leaderboard_v1",
        "job_id": job_id,
        "metric": spec.metric,
        "higher_is_better": spec.higher_is_better,
        "grid_total": grid_total,
        "max_trials": limits.max_trials,
        "trials_recorded": trials.len(),
        "budget_policy_ref": limits.budget_policy_ref,
        "best": best,
        "top": top,
        "extensions": extensions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_blueprint;
    use crate::compiler::tests::{bundle_path, demo_blueprint};
    use crate::lake::demo_ingest;
    use crate::lake::tests::demo_latency;
    use eam_core::scratch_dir;
    use std::fs;

    /// Demo blueprint with a close-above-SMA strategy whose window is a param.
    fn sma_blueprint() -> Value {
        let mut bp = demo_blueprint();
        bp["blueprint_id"] = json!("bp_demo_sma_sweep");
        bp["strategy_spec"]["extensions"]["strategy_id"] = json!("close_above_sma_sweep_v1");
        bp["strategy_spec"]["params"] = json!({"window": 2});
        bp["strategy_spec"]["expressions"] = json!({
            "ma": {"op": "sma", "of": {"op": "col", "field": "close"}, "window": {"param": "window"}},
            "entry_all": {"op": "gt", "left": {"op": "col", "field": "close"}, "right": {"op": "ref", "name": "ma"}},
            "exit_none": {"op": "not", "of": {"op": "ref", "name": "entry_all"}}
        });
        bp
    }

    fn sweep_in(root: &Path, job_id: &str, spec: &SweepSpec) -> Result<SweepOutcome> {
        demo_ingest(&root.join("data/lake"), "demo_snap", &demo_latency()).expect("ingest");
        let compiled = compile_blueprint(&sma_blueprint(), &bundle_path(), "demo_snap").expect("compile");
        let job_root = root.join("artifacts/jobs");
        run_sweep(&SweepInput {
            job_id,
            spec,
            base_runspec: &compiled.runspec,
            bundle_path: &bundle_path(),
            data_root: &root.join("data"),
            artifact_root: &root.join("artifacts"),
            job_root: &job_root,
            out_dir: &job_root.join(job_id).join("outputs/sweep"),
        })
    }

    #[test]
    fn grid_is_sorted_by_key_then_type_order() {
        let grid = json!({"b": ["x", 2, null, true, 1], "a": [false, true]});
        let combos = enumerate_param_grid(grid.as_object().expect("grid")).expect("grid");
        assert_eq!(combos.len(), 10);
        assert_eq!(Value::Object(combos[0].clone()), json!({"a": false, "b": null}));
        let b_axis: Vec<Value> = combos.iter().take(5).map(|c| c["b"].clone()).collect();
        assert_eq!(b_axis, vec![json!(null), json!(true), json!(1), json!(2), json!("x")]);
        assert_eq!(combos[5]["a"], true);

        for bad in [json!({}), json!({"w": []}), json!({"w": [[1]]})] {
            let err = enumerate_param_grid(bad.as_object().expect("grid")).expect_err("bad grid");
            assert_eq!(eam_core::exit_code_for(&err), eam_core::EXIT_INVALID);
        }
    }

    #[test]
    fn spec_defaults_and_lookup_order() {
        let spec = SweepSpec::parse(&json!({"param_grid": {"w": [1]}, "metric": "alpha", "max_trials": 0})).expect("spec");
        assert_eq!(spec.metric, "sharpe");
        assert!(spec.higher_is_better);
        assert_eq!(spec.max_trials, None);
        assert!(SweepSpec::parse(&json!({"param_grid": [1]})).is_err());

        let job = json!({"blueprint": {"extensions": {"sweep_spec": {"param_grid": {"w": [2]}}}}});
        assert_eq!(find_sweep_spec(&job).expect("found")["param_grid"]["w"][0], 2);
        assert!(find_sweep_spec(&json!({"extensions": {}})).is_none());
    }

    #[test]
    fn sweep_records_trials_and_ranks_by_test_metric() {
        let root = scratch_dir("eam_sweep_test");
        let spec = SweepSpec::parse(&json!({
            "param_grid": {"window": [3, 2]},
            "metric": "total_return",
            "stop_if_no_improvement_n": 5
        }))
        .expect("spec");
        let outcome = sweep_in(&root, "job1", &spec).expect("sweep");
        assert_eq!(outcome.status, "created");
        assert_eq!(outcome.trials_recorded, 2);

        let trials = read_jsonl(&outcome.trials_path).expect("trials");
        assert_eq!(trials[0]["params"], json!({"window": 2}));
        assert_eq!(trials[1]["params"], json!({"window": 3}));
        assert_ne!(trials[0]["run_id"], trials[1]["run_id"]);
        for t in &trials {
            assert_eq!(t["schema_version"], "sweep_trial_v1");
            assert!(t.get("error").is_none(), "unexpected: {}", t);
            assert!(Path::new(t["gate_results_path"].as_str().expect("gates")).is_file());
            let runspec = eam_core::read_json(&Path::new(t["dossier_path"].as_str().expect("dossier")).join("config_snapshot.json"))
                .expect("config")["runspec"]
                .clone();
            assert_eq!(runspec["extensions"]["sweep_params"], t["params"]);
            assert_eq!(runspec["extensions"]["strategy_spec"]["params"], t["params"]);
        }

        let board = eam_core::read_json(&outcome.leaderboard_path).expect("leaderboard");
        assert_eq!(board["schema_version"], "leaderboard_v1");
        assert_eq!(board["grid_total"], 2);
        assert_eq!(board["trials_recorded"], 2);
        let top = board["top"].as_array().expect("top");
        if top.len() == 2 {
            assert!(top[0]["test_metric"].as_f64() >= top[1]["test_metric"].as_f64());
        }
        if let Some(first) = top.first() {
            assert_eq!(board["best"]["run_id"], first["run_id"]);
        }
        let text = fs::read_to_string(&outcome.leaderboard_path).expect("text");
        assert!(!text.contains("holdout_sharpe"));

        let again = sweep_in(&root, "job1", &spec).expect("rerun");
        assert_eq!(again.status, "noop");
        assert_eq!(read_jsonl(&outcome.trials_path).expect("trials").len(), 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn trial_cap_stops_sweep_and_resume_skips_recorded_params() {
        let root = scratch_dir("eam_sweep_cap_test");
        let spec = SweepSpec::parse(&json!({"param_grid": {"window": [2, 3, 4]}, "max_trials": 1})).expect("spec");
        let outcome = sweep_in(&root, "job1", &spec).expect("sweep");
        assert_eq!(outcome.trials_recorded, 1);
        let stopped = outcome.stopped.expect("stopped");
        assert_eq!(stopped["reason"], "max_trials");
        assert_eq!(stopped["grid_total"], 3);
        let board = eam_core::read_json(&outcome.leaderboard_path).expect("leaderboard");
        assert_eq!(board["max_trials"], 1);
        assert_eq!(board["extensions"]["stopped"]["reason"], "max_trials");

        // a lost leaderboard is rebuilt without rerunning recorded params
        fs::remove_file(&outcome.leaderboard_path).expect("drop leaderboard");
        let wider = SweepSpec {
            max_trials: Some(2),
            ..spec
        };
        let resumed = sweep_in(&root, "job1", &wider).expect("resume");
        let trials = read_jsonl(&resumed.trials_path).expect("trials");
        assert_eq!(trials.len(), 2);
        assert_eq!(trials[1]["params"], json!({"window": 3}));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn buy_and_hold_runspec_cannot_be_swept() {
        let root = scratch_dir("eam_sweep_bh_test");
        let compiled = compile_blueprint(&demo_blueprint(), &bundle_path(), "demo_snap").expect("compile");
        let spec = SweepSpec::parse(&json!({"param_grid": {"window": [2]}})).expect("spec");
        let err = run_sweep(&SweepInput {
            job_id: "job1",
            spec: &spec,
            base_runspec: &compiled.runspec,
            bundle_path: &bundle_path(),
            data_root: &root.join("data"),
            artifact_root: &root.join("artifacts"),
            job_root: &root.join("artifacts/jobs"),
            out_dir: &root.join("sweep"),
        })
        .expect_err("no dsl");
        assert!(err.to_string().contains("strategy_spec"), "unexpected: {}", err);
        let _ = fs::remove_dir_all(root);
    }
}
