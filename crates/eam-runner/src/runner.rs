//! Deterministic run: compiled runspec -> adapter -> sealed dossier.

use anyhow::Result;
use eam_core::{sha256_file, short_digest, EamError};
use eam_schemas::ensure_valid;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use crate::backtest::{run_adapter, BacktestOutput, Strategy, DEFAULT_INIT_CASH};
use crate::catalog::{runspec_anchor, runspec_segments, runspec_symbols, DataCatalog, QueryResult, Segment, SegmentKind};
use crate::dossier::{dossier_dir, write_dossier, DossierInput, ExistsBehavior};
use crate::lake::OHLCV_DATASET_ID;
use crate::policies::{find_inline_policy_keys, CostParams, ExecutionParams, ResolvedPolicies};

/// Adapter inputs shared by the runner, the stress gates and the holdout vault.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub adapter_id: String,
    pub snapshot_id: String,
    pub symbols: Vec<String>,
    pub strategy: Strategy,
    pub execution: ExecutionParams,
    pub cost: CostParams,
    pub lag_bars: u32,
}

impl EngineSettings {
    pub fn from_runspec(runspec: &Value, policies: &ResolvedPolicies) -> Result<Self> {
        let declared = runspec
            .get("policy_bundle_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if declared != policies.bundle.policy_bundle_id {
            return Err(EamError::PolicyViolation(format!(
                "runspec.policy_bundle_id mismatch: runspec={} bundle={}",
                declared, policies.bundle.policy_bundle_id
            ))
            .into());
        }
        if let Some(ptr) = find_inline_policy_keys(runspec).first() {
            return Err(EamError::PolicyViolation(format!(
                "runspec at {}: inline policy parameters are forbidden",
                ptr
            ))
            .into());
        }
        let symbols = runspec_symbols(runspec);
        if symbols.is_empty() {
            return Err(EamError::InvalidContract("runspec at /extensions/symbols: required".into()).into());
        }
        Ok(EngineSettings {
            adapter_id: runspec
                .pointer("/adapter/adapter_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            snapshot_id: runspec
                .get("data_snapshot_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            symbols,
            strategy: Strategy::from_runspec(runspec)?,
            execution: policies.execution_params()?,
            cost: policies.cost_params()?,
            lag_bars: policies.asof_params()?.lag_bars(),
        })
    }

    pub fn with_cost(&self, cost: CostParams) -> Self {
        EngineSettings {
            cost,
            ..self.clone()
        }
    }

    pub fn with_lag(&self, lag_bars: u32) -> Self {
        EngineSettings {
            lag_bars,
            ..self.clone()
        }
    }

    pub fn run_segment(&self, catalog: &DataCatalog, segment: &Segment) -> Result<(QueryResult, BacktestOutput)> {
        let query = catalog.query_segment(&self.snapshot_id, &self.symbols, segment)?;
        let out = run_adapter(
            &self.adapter_id,
            &query.rows,
            &self.strategy,
            &self.execution,
            &self.cost,
            self.lag_bars,
        )?;
        Ok((query, out))
    }
}

#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub dossier_dir: PathBuf,
    pub status: String,
    pub metrics: Value,
}

impl RunOutcome {
    pub fn to_json(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "dossier_dir": self.dossier_dir.display().to_string(),
            "status": self.status,
            "metrics": self.metrics,
        })
    }
}

fn segment_summary(seg: &Segment, result: Option<&(QueryResult, BacktestOutput)>) -> Value {
    let mut v = json!({
        "segment_id": seg.segment_id,
        "kind": seg.kind.as_str(),
        "start": seg.start.to_string(),
        "end": seg.end.to_string(),
    });
    match result {
        Some((query, out)) => {
            v["status"] = json!("ok");
            v["rows"] = json!(query.rows.len());
            v["excluded_by_asof"] = json!(query.excluded_by_asof);
            v["total_return"] = json!(out.stats.total_return);
            v["sharpe"] = json!(out.stats.sharpe);
            v["max_drawdown"] = json!(out.stats.max_drawdown);
            v["trade_count"] = json!(out.stats.trade_count);
        }
        None => {
            v["status"] = json!("no_data");
        }
    }
    v
}

fn report_markdown(run_id: &str, settings: &EngineSettings, metrics: &Value, summaries: &[Value], has_holdout: bool) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Run report {}\n\n", run_id));
    out.push_str(&format!("- adapter: {}\n", settings.adapter_id));
    out.push_str(&format!("- strategy: {}\n", settings.strategy.name()));
    out.push_str(&format!("- snapshot: {}\n", settings.snapshot_id));
    out.push_str(&format!("- symbols: {}\n", settings.symbols.join(", ")));
    out.push_str(&format!("- lag_bars: {}\n\n", settings.lag_bars));
    out.push_str("## Test segment\n\n");
    for key in ["total_return", "sharpe", "max_drawdown", "trade_count"] {
        out.push_str(&format!("- {}: {}\n", key, metrics.get(key).cloned().unwrap_or(Value::Null)));
    }
    out.push_str("\n## Segments\n\n| segment | kind | status | total_return |\n|---|---|---|---|\n");
    for s in summaries {
        out.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            s["segment_id"].as_str().unwrap_or_default(),
            s["kind"].as_str().unwrap_or_default(),
            s["status"].as_str().unwrap_or_default(),
            s.get("total_return").cloned().unwrap_or(Value::Null)
        ));
    }
    if has_holdout {
        out.push_str("\nThe reserved evaluation window is judged only by its pass/fail gate.\n");
    }
    out
}

/// Run a compiled runspec and seal its dossier under `dossiers_dir`.
pub fn run_runspec(
    runspec: &Value,
    bundle_path: &Path,
    data_root: &Path,
    dossiers_dir: &Path,
    behavior: ExistsBehavior,
) -> Result<RunOutcome> {
    ensure_valid(runspec)?;
    let run_id = short_digest(runspec);
    let target = dossier_dir(dossiers_dir, &run_id)?;
    if target.exists() && behavior == ExistsBehavior::Noop {
        let metrics = eam_core::read_json_object(&target.join("metrics.json")).unwrap_or(Value::Null);
        tracing::info!(run_id = %run_id, "dossier exists; run is a noop");
        return Ok(RunOutcome {
            run_id,
            dossier_dir: target,
            status: "noop".into(),
            metrics,
        });
    }

    let policies = ResolvedPolicies::load(bundle_path)?;
    let settings = EngineSettings::from_runspec(runspec, &policies)?;
    let catalog = DataCatalog::new(data_root);
    let snapshot_manifest_path = catalog.snapshot_dir(&settings.snapshot_id)?.join("manifest.json");
    let snapshot_manifest = catalog.manifest(&settings.snapshot_id)?;

    let test = runspec_anchor(runspec, SegmentKind::Test)?
        .ok_or_else(|| EamError::InvalidContract("runspec at /segments/test: required".into()))?;
    let (test_query, baseline) = settings.run_segment(&catalog, &test)?;
    tracing::info!(run_id = %run_id, rows = test_query.rows.len(), total_return = baseline.stats.total_return, "baseline complete");

    let mut input = DossierInput {
        run_id: run_id.clone(),
        policy_bundle_id: policies.bundle.policy_bundle_id.clone(),
        data_snapshot_id: settings.snapshot_id.clone(),
        blueprint_hash: runspec
            .pointer("/blueprint_ref/blueprint_hash")
            .and_then(|v| v.as_str())
            .map(String::from),
        ..Default::default()
    };

    let mut summaries = Vec::new();
    let segments = runspec_segments(runspec)?;
    let has_holdout = segments.iter().any(|s| s.kind == SegmentKind::Holdout);
    for seg in segments.iter().filter(|s| s.kind != SegmentKind::Holdout) {
        let result = if seg.segment_id == test.segment_id {
            Some((
                QueryResult {
                    rows: test_query.rows.clone(),
                    excluded_by_asof: test_query.excluded_by_asof,
                },
                baseline.clone(),
            ))
        } else {
            let query = catalog.query_segment(&settings.snapshot_id, &settings.symbols, seg)?;
            if query.rows.is_empty() {
                None
            } else {
                let out = run_adapter(
                    &settings.adapter_id,
                    &query.rows,
                    &settings.strategy,
                    &settings.execution,
                    &settings.cost,
                    settings.lag_bars,
                )?;
                Some((query, out))
            }
        };
        summaries.push(segment_summary(seg, result.as_ref()));
        if let Some((_, out)) = &result {
            let base = format!("segments/{}", seg.segment_id);
            input
                .add_json(&format!("{}/metrics.json", base), out.metrics_json())
                .add_text(&format!("{}/curve.csv", base), out.curve_csv())
                .add_text(&format!("{}/trades.csv", base), out.trades_csv());
        }
    }

    let mut metrics = baseline.metrics_json();
    metrics["segment_id"] = json!(test.segment_id);
    let config_snapshot = json!({
        "run_id": run_id,
        "runspec": runspec,
        "policy_bundle_id": policies.bundle.policy_bundle_id,
        "policy_bundle_file": policies.bundle.path.file_name().and_then(|s| s.to_str()).unwrap_or_default(),
        "policy_sha256": policies.sha256_map()?,
        "policy_ids": {
            "execution": policies.execution.policy_id,
            "cost": policies.cost.policy_id,
            "asof_latency": policies.asof_latency.policy_id,
            "risk": policies.risk.policy_id,
            "gate_suite": policies.gate_suite.policy_id,
        },
        "env": {
            "adapter_id": settings.adapter_id,
            "lag_bars": settings.lag_bars,
            "init_cash": DEFAULT_INIT_CASH,
            "engine": env!("CARGO_PKG_NAME"),
            "engine_version": env!("CARGO_PKG_VERSION"),
        },
        "deps": {
            "adapter": settings.adapter_id,
            "strategy": settings.strategy.name(),
        },
    });
    let dataset_sha = snapshot_manifest
        .pointer("/datasets/0/sha256")
        .cloned()
        .unwrap_or(Value::Null);
    let data_manifest = json!({
        "snapshot_id": settings.snapshot_id,
        "dataset_id": OHLCV_DATASET_ID,
        "snapshot_manifest_sha256": sha256_file(&snapshot_manifest_path)?,
        "dataset_sha256": dataset_sha,
        "symbols": settings.symbols,
        "test_query": test_query.summary(),
        "asof_rule": policies.asof_params()?.asof_rule,
    });
    input
        .add_json("config_snapshot.json", config_snapshot)
        .add_json("data_manifest.json", data_manifest)
        .add_json("metrics.json", metrics.clone())
        .add_json("segments_summary.json", json!({"segments": summaries}))
        .add_json("exposure.json", baseline.exposure_json())
        .add_text("curve.csv", baseline.curve_csv())
        .add_text("trades.csv", baseline.trades_csv())
        .add_text("positions.csv", baseline.positions_csv())
        .add_text("turnover.csv", baseline.turnover_csv())
        .add_text(
            "reports/report.md",
            report_markdown(&run_id, &settings, &metrics, &summaries, has_holdout),
        );

    let written = write_dossier(dossiers_dir, &input, behavior)?;
    Ok(RunOutcome {
        run_id,
        dossier_dir: written.dossier_dir,
        status: written.status,
        metrics,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::compiler::compile_blueprint;
    use crate::compiler::tests::{bundle_path, demo_blueprint};
    use crate::lake::demo_ingest;
    use crate::lake::tests::demo_latency;
    use eam_core::scratch_dir;
    use std::fs;

    /// Demo lake + compiled demo blueprint + sealed dossier under `root`.
    pub(crate) fn demo_run(root: &Path) -> (Value, RunOutcome) {
        demo_ingest(&root.join("data/lake"), "demo_snap", &demo_latency()).expect("ingest");
        let compiled = compile_blueprint(&demo_blueprint(), &bundle_path(), "demo_snap").expect("compile");
        let outcome = run_runspec(
            &compiled.runspec,
            &bundle_path(),
            &root.join("data"),
            &root.join("artifacts/dossiers"),
            ExistsBehavior::Noop,
        )
        .expect("run");
        (compiled.runspec, outcome)
    }

    #[test]
    fn demo_run_seals_dossier_and_rerun_is_noop() {
        let root = scratch_dir("eam_runner_test");
        let (runspec, outcome) = demo_run(&root);
        assert_eq!(outcome.status, "created");
        for f in ["config_snapshot.json", "metrics.json", "curve.csv", "trades.csv", "positions.csv", "segments_summary.json", "reports/report.md"] {
            assert!(outcome.dossier_dir.join(f).is_file(), "missing {}", f);
        }
        assert!(outcome.dossier_dir.join("segments/train_000/metrics.json").is_file());
        assert!(!outcome.dossier_dir.join("segments/holdout_000").exists());
        let manifest_before = fs::read(outcome.dossier_dir.join("dossier_manifest.json")).expect("manifest");

        let again = run_runspec(&runspec, &bundle_path(), &root.join("data"), &root.join("artifacts/dossiers"), ExistsBehavior::Noop)
            .expect("rerun");
        assert_eq!(again.status, "noop");
        assert_eq!(again.run_id, outcome.run_id);
        assert_eq!(fs::read(outcome.dossier_dir.join("dossier_manifest.json")).expect("manifest"), manifest_before);

        let summary = fs::read_to_string(outcome.dossier_dir.join("segments_summary.json")).expect("summary");
        assert!(!summary.contains("holdout"));
        let report = fs::read_to_string(outcome.dossier_dir.join("reports/report.md")).expect("report");
        assert!(report.lines().all(|l| !(l.to_lowercase().contains("holdout") && l.chars().any(|c| c.is_ascii_digit()))));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_snapshot_is_reported() {
        let root = scratch_dir("eam_runner_missing_test");
        let compiled = compile_blueprint(&demo_blueprint(), &bundle_path(), "absent_snap").expect("compile");
        let err = run_runspec(&compiled.runspec, &bundle_path(), &root.join("data"), &root.join("dossiers"), ExistsBehavior::Noop)
            .expect_err("missing");
        assert!(err.to_string().contains("snapshot not found"), "unexpected: {}", err);
        let _ = fs::remove_dir_all(root);
    }
}
