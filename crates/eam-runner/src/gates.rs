//! Gate runner: deterministic pass/fail adjudication of a sealed dossier.
//!
//! Gate evidence is appended next to the dossier (`gate_results.json`,
//! `risk_report.json`, `segments/<id>/gate_<gate_id>.json`) and registered in
//! the manifest append-only. A second run over the same dossier is a noop.

use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset, NaiveDate};
use eam_core::{atomic_write_json_pretty, read_json, read_json_object, sha256_file, short_digest, EamError};
use eam_schemas::{ensure_valid, validate_payload};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::backtest::VECTORBT_SIGNAL_V1;
use crate::catalog::{count_asof_violations, runspec_anchor, runspec_segments, DataCatalog, Segment, SegmentKind};
use crate::dossier::{extend_manifest, load_manifest};
use crate::holdout::evaluate_holdout;
use crate::lake::{self, format_ts, OHLCV_DATASET_ID};
use crate::policies::{GateSpec, ResolvedPolicies, RiskParams, HOLDOUT_OUTPUT_RULE};
use crate::runner::EngineSettings;

pub const GATE_RESULTS_FILE: &str = "gate_results.json";
pub const RISK_REPORT_FILE: &str = "risk_report.json";
const TOLERANCE: f64 = 1e-9;
const MAX_LEAKS_REPORTED: usize = 50;

const ALWAYS_INVALID_ON_FAIL: &[&str] = &[
    "basic_sanity",
    "determinism_guard",
    "gate_no_lookahead_v1",
    "data_snapshot_integrity_v1",
];
const SEGMENT_GATES: &[&str] = &["gate_no_lookahead_v1", "gate_cost_x2_v1", "gate_delay_plus_1bar_v1"];
const HOLDOUT_GATE: &str = "gate_holdout_passfail_v1";
const MANDATORY_VECTORBT_GATES: &[&str] = &[
    "gate_no_lookahead_v1",
    "gate_delay_plus_1bar_v1",
    "gate_cost_x2_v1",
    "risk_policy_compliance_v1",
    "gate_holdout_passfail_v1",
];

#[derive(Clone, Debug, PartialEq)]
pub struct GateOutcome {
    pub gate_id: String,
    pub gate_version: String,
    pub pass: bool,
    pub status: &'static str,
    pub metrics: Value,
    pub thresholds: Option<Value>,
    pub artifacts: Vec<String>,
    pub notes: String,
    pub segment_id: Option<String>,
}

impl GateOutcome {
    fn new(spec: &GateSpec, pass: bool, metrics: Value) -> Self {
        GateOutcome {
            gate_id: spec.gate_id.clone(),
            gate_version: spec.gate_version.clone(),
            pass,
            status: if pass { "pass" } else { "fail" },
            metrics,
            thresholds: None,
            artifacts: Vec::new(),
            notes: String::new(),
            segment_id: None,
        }
    }

    fn error(spec: &GateSpec, message: impl Into<String>) -> Self {
        GateOutcome::new(spec, false, json!({"error": message.into()}))
    }

    fn skipped(spec: &GateSpec, metrics: Value, notes: &str) -> Self {
        GateOutcome {
            status: "skipped",
            notes: notes.to_string(),
            ..GateOutcome::new(spec, true, metrics)
        }
    }

    fn with_evidence(mut self, artifacts: &[&str], notes: &str) -> Self {
        self.artifacts = artifacts.iter().map(|s| s.to_string()).collect();
        self.notes = notes.to_string();
        self
    }

    fn with_thresholds(mut self, thresholds: Value) -> Self {
        self.thresholds = Some(thresholds);
        self
    }

    /// Failure that makes the whole evaluation INVALID rather than a normal fail.
    pub fn is_invalidating(&self) -> bool {
        if self.pass {
            return false;
        }
        ALWAYS_INVALID_ON_FAIL.contains(&self.gate_id.as_str())
            || self.metrics.get("error").is_some()
            || self
                .metrics
                .get("missing_artifacts")
                .and_then(|v| v.as_array())
                .map(|a| !a.is_empty())
                .unwrap_or(false)
    }

    pub fn to_json(&self) -> Value {
        let mut v = json!({
            "gate_id": self.gate_id,
            "gate_version": self.gate_version,
            "pass": self.pass,
            "status": self.status,
            "metrics": self.metrics,
            "evidence": {"artifacts": self.artifacts, "notes": self.notes},
        });
        if let Some(t) = &self.thresholds {
            v["thresholds"] = t.clone();
        }
        if let Some(s) = &self.segment_id {
            v["segment_id"] = json!(s);
        }
        v
    }
}

/// Everything a gate may read. Built once per gate run.
pub struct GateContext<'a> {
    pub dossier_dir: &'a Path,
    pub policies: &'a ResolvedPolicies,
    pub settings: std::result::Result<EngineSettings, String>,
    pub runspec: &'a Value,
    pub manifest: &'a Value,
    pub config_snapshot: &'a Value,
    pub metrics: &'a Value,
    pub catalog: DataCatalog,
    pub artifact_root: &'a Path,
    pub job_root: &'a Path,
}

impl GateContext<'_> {
    fn run_id(&self) -> &str {
        self.manifest.get("run_id").and_then(|v| v.as_str()).unwrap_or_default()
    }

    fn snapshot_id(&self) -> &str {
        self.runspec
            .get("data_snapshot_id")
            .and_then(|v| v.as_str())
            .or_else(|| self.manifest.get("data_snapshot_id").and_then(|v| v.as_str()))
            .unwrap_or_default()
    }

    /// Baseline total return for `segment`, from the dossier's recorded metrics.
    fn baseline_return(&self, segment: &Segment) -> Option<f64> {
        let seg_metrics = self
            .dossier_dir
            .join("segments")
            .join(&segment.segment_id)
            .join("metrics.json");
        if let Some(m) = read_json_object(&seg_metrics) {
            return m.get("total_return").and_then(|v| v.as_f64());
        }
        if self.metrics.get("segment_id").and_then(|v| v.as_str()) == Some(segment.segment_id.as_str()) {
            return self.metrics.get("total_return").and_then(|v| v.as_f64());
        }
        None
    }
}

// ---------------------------------------------------------------------------
// gates
// ---------------------------------------------------------------------------

const BASE_REQUIRED: &[&str] = &[
    "config_snapshot.json",
    "metrics.json",
    "curve.csv",
    "trades.csv",
    "dossier_manifest.json",
];

fn gate_basic_sanity(ctx: &GateContext<'_>, spec: &GateSpec) -> GateOutcome {
    let mut required: Vec<String> = BASE_REQUIRED.iter().map(|s| s.to_string()).collect();
    if let Some(extra) = spec.params.get("require_artifacts").and_then(|v| v.as_array()) {
        for a in extra.iter().filter_map(|v| v.as_str()) {
            if a != GATE_RESULTS_FILE && !required.iter().any(|r| r == a) {
                required.push(a.to_string());
            }
        }
    }
    let missing: Vec<&String> = required
        .iter()
        .filter(|rel| !ctx.dossier_dir.join(rel.as_str()).is_file())
        .collect();
    GateOutcome::new(
        spec,
        missing.is_empty(),
        json!({"required": required, "missing_artifacts": missing}),
    )
    .with_evidence(&["dossier_manifest.json"], "required dossier files are present")
}

fn gate_determinism_guard(ctx: &GateContext<'_>, spec: &GateSpec) -> GateOutcome {
    let runspec_ok = ctx.config_snapshot.get("runspec").map(|v| v.is_object()).unwrap_or(false);
    let sha_ok = ctx
        .config_snapshot
        .get("policy_sha256")
        .and_then(|v| v.as_object())
        .map(|m| !m.is_empty())
        .unwrap_or(false);
    let run_id_matches = runspec_ok && short_digest(&ctx.config_snapshot["runspec"]) == ctx.run_id();
    GateOutcome::new(
        spec,
        runspec_ok && sha_ok && run_id_matches,
        json!({
            "runspec_present": runspec_ok,
            "policy_sha256_present": sha_ok,
            "run_id_matches_runspec": run_id_matches,
        }),
    )
    .with_evidence(&["config_snapshot.json"], "config snapshot pins runspec and policy hashes")
}

fn gate_no_lookahead(ctx: &GateContext<'_>, spec: &GateSpec, segment: &Segment) -> GateOutcome {
    let symbols = crate::catalog::runspec_symbols(ctx.runspec);
    match ctx.catalog.query_segment(ctx.snapshot_id(), &symbols, segment) {
        Ok(query) => {
            let violations = count_asof_violations(&query.rows, &segment.as_of);
            GateOutcome::new(
                spec,
                violations == 0,
                json!({
                    "snapshot_id": ctx.snapshot_id(),
                    "rows_before_asof": query.rows.len() + query.excluded_by_asof,
                    "rows_after_asof": query.rows.len(),
                    "violations_count": violations,
                    "segment": {"start": segment.start.to_string(), "end": segment.end.to_string(), "as_of": format_ts(&segment.as_of)},
                }),
            )
            .with_evidence(
                &["config_snapshot.json", "data_manifest.json"],
                "re-queries the catalog and asserts available_at <= as_of",
            )
        }
        Err(e) => GateOutcome::error(spec, format!("catalog query failed: {}", e)),
    }
}

enum Stress {
    CostX2,
    DelayPlusOne,
}

fn gate_stress(ctx: &GateContext<'_>, spec: &GateSpec, segment: &Segment, stress: Stress) -> GateOutcome {
    let settings = match &ctx.settings {
        Ok(s) => s,
        Err(e) => return GateOutcome::error(spec, e.clone()),
    };
    let (default_drop, stressed, thresholds) = match stress {
        Stress::CostX2 => (0.10, settings.with_cost(settings.cost.doubled()), json!({"factor": 2.0})),
        Stress::DelayPlusOne => (
            0.05,
            settings.with_lag(settings.lag_bars + 1),
            json!({"extra_lag_bars": 1}),
        ),
    };
    let max_drop = spec
        .params
        .get("max_return_drop")
        .and_then(|v| v.as_f64())
        .unwrap_or(default_drop);
    let baseline = match ctx.baseline_return(segment) {
        Some(b) => b,
        None => {
            return GateOutcome::new(
                spec,
                false,
                json!({"missing_artifacts": [format!("segments/{}/metrics.json", segment.segment_id)]}),
            )
        }
    };
    let (query, out) = match stressed.run_segment(&ctx.catalog, segment) {
        Ok(r) => r,
        Err(e) => return GateOutcome::error(spec, e.to_string()),
    };
    let stressed_return = out.stats.total_return;
    let mut thresholds = thresholds;
    thresholds["max_return_drop"] = json!(max_drop);
    GateOutcome::new(
        spec,
        stressed_return >= baseline - max_drop - TOLERANCE,
        json!({
            "rows_after_asof": query.rows.len(),
            "baseline_total_return": baseline,
            "stressed_total_return": stressed_return,
            "return_drop": baseline - stressed_return,
            "stressed_lag_bars": stressed.lag_bars,
            "stressed_commission_bps": stressed.cost.commission_bps,
            "stressed_slippage_bps": stressed.cost.slippage_bps,
        }),
    )
    .with_thresholds(thresholds)
    .with_evidence(
        &["config_snapshot.json", "metrics.json", "curve.csv", "trades.csv"],
        "re-runs the adapter in memory with the stressed setting",
    )
}

fn gate_holdout_passfail(ctx: &GateContext<'_>, spec: &GateSpec) -> (GateOutcome, Option<Value>) {
    let segment = match runspec_anchor(ctx.runspec, SegmentKind::Holdout) {
        Ok(Some(s)) => s,
        Ok(None) => {
            return (
                GateOutcome::skipped(spec, json!({"holdout_present": false}), "no holdout segment in runspec"),
                None,
            )
        }
        Err(e) => return (GateOutcome::error(spec, e.to_string()), None),
    };
    let output = ctx
        .policies
        .gate_suite
        .params()
        .pointer("/holdout_policy/output")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if output != HOLDOUT_OUTPUT_RULE {
        return (
            GateOutcome::error(spec, format!("holdout_policy.output must be '{}'", HOLDOUT_OUTPUT_RULE)),
            None,
        );
    }
    let settings = match &ctx.settings {
        Ok(s) => s,
        Err(e) => return (GateOutcome::error(spec, e.clone()), None),
    };
    match evaluate_holdout(&ctx.catalog, settings, &segment, &spec.params) {
        Ok(h) => {
            let outcome = GateOutcome::new(
                spec,
                h.passed,
                json!({"holdout_present": true, "pass": h.passed, "summary": h.summary}),
            )
            .with_evidence(&["config_snapshot.json"], "evaluated in the vault; only pass/fail leaves it");
            (outcome, Some(h.to_summary_json()))
        }
        Err(e) => (GateOutcome::error(spec, e.to_string()), None),
    }
}

// ---- holdout leak scan ----------------------------------------------------

/// Any digit counts, dates included: a holdout boundary is itself a leak.
fn contains_number(v: &Value) -> bool {
    match v {
        Value::Number(_) => true,
        Value::String(s) => s.chars().any(|c| c.is_ascii_digit()),
        Value::Array(items) => items.iter().any(contains_number),
        Value::Object(map) => map.values().any(contains_number),
        _ => false,
    }
}

fn walk_holdout_keys(v: &Value, ptr: &str, out: &mut Vec<(String, String)>) {
    match v {
        Value::Object(map) => {
            for (k, child) in map {
                let p = format!("{}/{}", ptr, crate::policies::escape_pointer(k));
                if k.to_lowercase().contains("holdout") && contains_number(child) {
                    let snippet: String = child.to_string().chars().take(200).collect();
                    out.push((p.clone(), snippet));
                }
                walk_holdout_keys(child, &p, out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                walk_holdout_keys(child, &format!("{}/{}", ptr, i), out);
            }
        }
        _ => {}
    }
}

#[derive(Default)]
struct LeakScan {
    leaks: Vec<Value>,
    errors: Vec<String>,
}

impl LeakScan {
    fn scan_file(&mut self, path: &Path, rel: &str) {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                self.errors.push(format!("{}: read error: {}", rel, e));
                return;
            }
        };
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or_default();
        match ext {
            "json" => match serde_json::from_str::<Value>(&text) {
                Ok(doc) => self.record_json(&doc, rel, "json", ""),
                Err(e) => self.errors.push(format!("{}: JSON parse error: {}", rel, e)),
            },
            "jsonl" => {
                for (i, line) in text.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(line) {
                        Ok(doc) => self.record_json(&doc, rel, "jsonl", &(i + 1).to_string()),
                        Err(e) => self.errors.push(format!("{}:{}: JSONL parse error: {}", rel, i + 1, e)),
                    }
                }
            }
            _ => {
                for (i, line) in text.lines().enumerate() {
                    if line.to_lowercase().contains("holdout") && line.chars().any(|c| c.is_ascii_digit()) {
                        self.leaks.push(json!({
                            "file": rel,
                            "kind": "md",
                            "location": format!("line:{}", i + 1),
                            "snippet": line.trim().chars().take(200).collect::<String>(),
                        }));
                    }
                }
            }
        }
    }

    fn record_json(&mut self, doc: &Value, rel: &str, kind: &str, prefix: &str) {
        let mut found = Vec::new();
        walk_holdout_keys(doc, "", &mut found);
        for (ptr, snippet) in found {
            self.leaks.push(json!({
                "file": rel,
                "kind": kind,
                "location": format!("{}{}", prefix, ptr),
                "snippet": snippet,
            }));
        }
    }
}

fn glob_children(dir: &Path, nested: &[&str], file_filter: impl Fn(&Path) -> bool) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return out,
    };
    let mut children: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).filter(|p| p.is_dir()).collect();
    children.sort();
    for child in children {
        let target = nested.iter().fold(child, |acc, part| acc.join(part));
        if target.is_file() {
            if file_filter(&target) {
                out.push(target);
            }
        } else if target.is_dir() {
            let mut files: Vec<PathBuf> = fs::read_dir(&target)
                .map(|rd| rd.filter_map(|e| e.ok().map(|e| e.path())).collect())
                .unwrap_or_default();
            files.sort();
            out.extend(files.into_iter().filter(|p| p.is_file() && file_filter(p)));
        }
    }
    out
}

/// Iteration-facing files the leak guard reads.
pub fn leak_scan_targets(dossier_dir: &Path, artifact_root: &Path, job_root: &Path) -> Vec<PathBuf> {
    let any = |_: &Path| true;
    let json_only = |p: &Path| p.extension().and_then(|s| s.to_str()) == Some("json");
    let mut targets = Vec::new();
    targets.extend(glob_children(job_root, &["outputs", "sweep", "leaderboard.json"], any));
    targets.extend(glob_children(job_root, &["outputs", "sweep", "trials.jsonl"], any));
    targets.extend(glob_children(job_root, &["outputs", "proposals"], json_only));
    for rel in ["attribution_report.json", "reports/report.md", "segments_summary.json"] {
        let p = dossier_dir.join(rel);
        if p.is_file() {
            targets.push(p);
        }
    }
    for p in glob_children(&artifact_root.join("dossiers"), &["attribution_report.json"], any) {
        if !targets.contains(&p) {
            targets.push(p);
        }
    }
    targets
}

fn gate_holdout_leak_guard(ctx: &GateContext<'_>, spec: &GateSpec) -> GateOutcome {
    let targets = leak_scan_targets(ctx.dossier_dir, ctx.artifact_root, ctx.job_root);
    let mut scan = LeakScan::default();
    let mut rels = Vec::new();
    for p in &targets {
        let rel = p
            .strip_prefix(ctx.artifact_root)
            .unwrap_or(p)
            .to_string_lossy()
            .replace('\\', "/");
        scan.scan_file(p, &rel);
        rels.push(rel);
    }
    let evidence: Vec<&str> = rels.iter().take(MAX_LEAKS_REPORTED).map(String::as_str).collect();
    if !scan.errors.is_empty() {
        return GateOutcome::new(
            spec,
            false,
            json!({"error": "parse errors while scanning holdout leak targets", "parse_errors": scan.errors}),
        )
        .with_evidence(&evidence, "");
    }
    let leak_count = scan.leaks.len();
    scan.leaks.truncate(MAX_LEAKS_REPORTED);
    GateOutcome::new(
        spec,
        leak_count == 0,
        json!({"leak_count": leak_count, "leaks": scan.leaks, "scanned_files": targets.len()}),
    )
    .with_evidence(&evidence, "holdout keys must not carry numbers; holdout lines must not carry digits")
}

// ---- risk ------------------------------------------------------------------

fn csv_rows(path: &Path) -> Result<Vec<BTreeMap<String, String>>> {
    let text = fs::read_to_string(path)?;
    let mut lines = text.lines();
    let header: Vec<String> = lines
        .next()
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .collect();
    Ok(lines
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            header
                .iter()
                .cloned()
                .zip(l.split(',').map(|c| c.trim().to_string()))
                .collect()
        })
        .collect())
}

fn cell_f64(row: &BTreeMap<String, String>, key: &str) -> f64 {
    row.get(key).and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0)
}

fn gate_risk_compliance(ctx: &GateContext<'_>, spec: &GateSpec) -> GateOutcome {
    let files = ["positions.csv", "turnover.csv", "exposure.json"];
    let missing: Vec<&str> = files
        .iter()
        .copied()
        .filter(|f| !ctx.dossier_dir.join(f).is_file())
        .collect();
    if !missing.is_empty() {
        return GateOutcome::new(spec, false, json!({"missing_artifacts": missing}));
    }
    let limits: RiskParams = ctx.policies.risk_params().unwrap_or_default();
    let allow_short = ctx
        .policies
        .execution_params()
        .map(|p| p.allow_short)
        .unwrap_or(false);
    let loaded = (|| -> Result<(Vec<BTreeMap<String, String>>, Vec<BTreeMap<String, String>>, Value)> {
        Ok((
            csv_rows(&ctx.dossier_dir.join("positions.csv"))?,
            csv_rows(&ctx.dossier_dir.join("turnover.csv"))?,
            read_json(&ctx.dossier_dir.join("exposure.json"))?,
        ))
    })();
    let (positions, turnover, exposure) = match loaded {
        Ok(v) => v,
        Err(e) => return GateOutcome::error(spec, format!("risk evidence unreadable: {}", e)),
    };
    let mut per_dt: BTreeMap<String, usize> = BTreeMap::new();
    let mut short_count = 0usize;
    for row in &positions {
        let qty = cell_f64(row, "qty");
        if qty.abs() > 0.0 {
            *per_dt.entry(row.get("dt").cloned().unwrap_or_default()).or_default() += 1;
        }
        if qty < 0.0 {
            short_count += 1;
        }
    }
    let max_positions = per_dt.values().copied().max().unwrap_or(0);
    let max_turnover = turnover.iter().map(|r| cell_f64(r, "turnover")).fold(0.0_f64, f64::max);
    let max_leverage = exposure.get("max_leverage").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let max_drawdown = ctx.metrics.get("max_drawdown").and_then(|v| v.as_f64()).unwrap_or(0.0);

    let mut violations = Vec::new();
    if max_leverage > limits.max_leverage + TOLERANCE {
        violations.push(format!("max_leverage {} > {}", max_leverage, limits.max_leverage));
    }
    if max_positions as u64 > limits.max_positions {
        violations.push(format!("max_positions {} > {}", max_positions, limits.max_positions));
    }
    if max_turnover > limits.max_turnover + TOLERANCE {
        violations.push(format!("max_turnover {} > {}", max_turnover, limits.max_turnover));
    }
    if let Some(dd) = limits.max_drawdown {
        if max_drawdown > dd + TOLERANCE {
            violations.push(format!("max_drawdown {} > {}", max_drawdown, dd));
        }
    }
    if short_count > 0 && !allow_short {
        violations.push(format!("{} short position rows while allow_short=false", short_count));
    }
    let pass = violations.is_empty();
    let limits_json = json!({
        "max_leverage": limits.max_leverage,
        "max_positions": limits.max_positions,
        "max_turnover": limits.max_turnover,
        "max_drawdown": limits.max_drawdown,
        "allow_short": allow_short,
    });
    let observed = json!({
        "max_leverage": max_leverage,
        "max_positions": max_positions,
        "max_turnover": max_turnover,
        "max_drawdown": max_drawdown,
        "short_position_rows": short_count,
    });
    let report_path = ctx.dossier_dir.join(RISK_REPORT_FILE);
    if !report_path.exists() {
        let report = json!({
            "report_version": "risk_report_v1",
            "run_id": ctx.run_id(),
            "risk_policy_id": ctx.policies.risk.policy_id,
            "limits": limits_json,
            "observed": observed,
            "violations": violations,
            "pass": pass,
        });
        if let Err(e) = atomic_write_json_pretty(&report_path, &report) {
            return GateOutcome::error(spec, format!("write risk_report.json: {}", e));
        }
    }
    GateOutcome::new(
        spec,
        pass,
        json!({"observed": observed, "violations": violations}),
    )
    .with_thresholds(limits_json)
    .with_evidence(
        &["positions.csv", "turnover.csv", "exposure.json", RISK_REPORT_FILE],
        "risk evidence compared against risk_policy limits",
    )
}

// ---- data snapshot integrity ----------------------------------------------

fn gate_snapshot_integrity(ctx: &GateContext<'_>, spec: &GateSpec) -> GateOutcome {
    let snapshot_id = ctx.snapshot_id();
    let snap_dir = match ctx.catalog.snapshot_dir(snapshot_id) {
        Ok(d) => d,
        Err(_) => {
            return GateOutcome::new(spec, false, json!({"reason": "invalid snapshot_id format", "snapshot_id": snapshot_id}))
        }
    };
    let mut errors: Vec<String> = Vec::new();
    let manifest = match ctx.catalog.manifest(snapshot_id) {
        Ok(m) => m,
        Err(_) => {
            return GateOutcome::new(
                spec,
                false,
                json!({"snapshot_id": snapshot_id, "errors": ["snapshot not found under data_root/lake"]}),
            )
        }
    };
    let check_contract = |doc: &Value, name: &str, errors: &mut Vec<String>| {
        let v = validate_payload(doc);
        if !v.is_ok() {
            errors.push(format!("{} contract: {}", name, v.message));
        }
    };
    check_contract(&manifest, "manifest.json", &mut errors);
    let quality = read_json_object(&snap_dir.join("quality_report.json"));
    match &quality {
        Some(q) => check_contract(q, "quality_report.json", &mut errors),
        None => errors.push("missing quality_report.json".into()),
    }
    let ingest = read_json_object(&snap_dir.join("ingest_manifest.json"));
    if let Some(i) = &ingest {
        check_contract(i, "ingest_manifest.json", &mut errors);
    }

    let dataset = manifest
        .get("datasets")
        .and_then(|v| v.as_array())
        .and_then(|ds| ds.iter().find(|d| d.get("dataset_id").and_then(|v| v.as_str()) == Some(OHLCV_DATASET_ID)))
        .cloned()
        .unwrap_or(Value::Null);
    let manifest_sha = dataset.get("sha256").and_then(|v| v.as_str()).map(String::from);
    let manifest_rows = dataset.get("row_count").and_then(|v| v.as_u64());
    let mut actual_sha = None;
    let mut actual_rows = None;
    match dataset.get("file").and_then(|v| v.as_str()) {
        Some(file) => {
            let data_path = snap_dir.join(file);
            if !data_path.is_file() {
                errors.push("data file missing (manifest.datasets[].file not found)".into());
            } else {
                match sha256_file(&data_path) {
                    Ok(sha) => {
                        if manifest_sha.as_deref() != Some(sha.as_str()) {
                            errors.push("sha256 mismatch: manifest.datasets[].sha256 != sha256(data_file)".into());
                        }
                        actual_sha = Some(sha);
                    }
                    Err(e) => errors.push(format!("failed to hash data file: {}", e)),
                }
                match lake::read_bars_csv(&data_path) {
                    Ok(bars) => {
                        actual_rows = Some(bars.len() as u64);
                        reconcile_ranges(&dataset, &bars, &mut errors);
                    }
                    Err(e) => errors.push(format!("data file unreadable: {}", e)),
                }
            }
        }
        None => errors.push("manifest missing datasets[] entry".into()),
    }
    if manifest_rows.is_some() && actual_rows.is_some() && manifest_rows != actual_rows {
        errors.push("row_count mismatch: manifest.datasets[].row_count != rows(data_file)".into());
    }
    let quality_rows = quality.as_ref().and_then(|q| q.get("rows_after_dedup").and_then(|v| v.as_u64()));
    if quality_rows.is_some() && manifest_rows.is_some() && quality_rows != manifest_rows {
        errors.push("row_count mismatch: quality_report.rows_after_dedup != manifest.datasets[].row_count".into());
    }
    let mut metrics = json!({
        "snapshot_id": snapshot_id,
        "missing_ingest_manifest": ingest.is_none(),
        "manifest_sha256": manifest_sha,
        "actual_sha256": actual_sha,
        "manifest_row_count": manifest_rows,
        "actual_row_count": actual_rows,
        "quality_rows_after_dedup": quality_rows,
    });
    if !errors.is_empty() {
        metrics["errors"] = json!(errors);
    }
    GateOutcome::new(spec, errors.is_empty(), metrics).with_evidence(
        &["data_manifest.json"],
        "snapshot contracts, dataset sha256 and manifest ranges re-checked",
    )
}

fn reconcile_ranges(dataset: &Value, bars: &[lake::Bar], errors: &mut Vec<String>) {
    let dts: BTreeSet<NaiveDate> = bars.iter().map(|b| b.dt).collect();
    let avs: BTreeSet<DateTime<FixedOffset>> = bars.iter().map(|b| b.available_at).collect();
    let checks = [
        ("dt_min", dts.iter().next().map(|d| d.to_string())),
        ("dt_max", dts.iter().next_back().map(|d| d.to_string())),
        ("available_at_min", avs.iter().next().map(format_ts)),
        ("available_at_max", avs.iter().next_back().map(format_ts)),
    ];
    for (key, actual) in checks {
        let declared = dataset.get(key).and_then(|v| v.as_str());
        if let (Some(d), Some(a)) = (declared, actual.as_deref()) {
            if d != a {
                errors.push(format!("{} mismatch between manifest and data file", key));
            }
        }
    }
}

// ---- composed runs ---------------------------------------------------------

fn gate_components_integrity(ctx: &GateContext<'_>, spec: &GateSpec) -> GateOutcome {
    let min_points = spec
        .params
        .get("min_intersection_points")
        .and_then(|v| v.as_u64())
        .unwrap_or(1)
        .max(1);
    let path = ctx.dossier_dir.join("components.json");
    let doc = match read_json_object(&path) {
        Some(d) => d,
        None => return GateOutcome::error(spec, "missing components.json"),
    };
    let components = match doc.get("components").and_then(|v| v.as_array()) {
        Some(c) if !c.is_empty() => c.clone(),
        _ => return GateOutcome::error(spec, "components.json missing non-empty components list"),
    };
    let dossiers = ctx.dossier_dir.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut errors = Vec::new();
    for (i, c) in components.iter().enumerate() {
        let run_id = match c.get("run_id").and_then(|v| v.as_str()) {
            Some(r) if eam_core::is_safe_id(r) => r,
            _ => {
                errors.push(format!("components[{}].run_id missing", i));
                continue;
            }
        };
        let gr_path = dossiers.join(run_id).join(GATE_RESULTS_FILE);
        match read_json_object(&gr_path) {
            None => errors.push(format!("missing gate_results for component run_id={}", run_id)),
            Some(gr) => {
                let v = validate_payload(&gr);
                if !v.is_ok() {
                    errors.push(format!("component gate_results invalid for run_id={}: {}", run_id, v.message));
                } else if gr.get("overall_pass").and_then(|v| v.as_bool()) != Some(true) {
                    errors.push(format!("component overall_pass=false for run_id={}", run_id));
                }
            }
        }
    }
    let intersection_points = doc
        .pointer("/alignment_stats/overall/intersection_points")
        .and_then(|v| v.as_u64())
        .unwrap_or_else(|| {
            fs::read_to_string(ctx.dossier_dir.join("curve.csv"))
                .map(|t| t.lines().filter(|l| !l.trim().is_empty()).count().saturating_sub(1) as u64)
                .unwrap_or(0)
        });
    if intersection_points < min_points {
        errors.push(format!("intersection_points {} < {}", intersection_points, min_points));
    }
    GateOutcome::new(
        spec,
        errors.is_empty(),
        json!({"components": components.len(), "intersection_points": intersection_points, "errors": errors}),
    )
    .with_thresholds(json!({"min_intersection_points": min_points}))
    .with_evidence(&["components.json", "curve.csv"], "component runs must each have passed their gates")
}

// ---------------------------------------------------------------------------
// suite
// ---------------------------------------------------------------------------

fn run_level_gate(ctx: &GateContext<'_>, spec: &GateSpec) -> GateOutcome {
    if spec.gate_version != "v1" {
        return GateOutcome::error(spec, "unsupported gate_id/gate_version");
    }
    match spec.gate_id.as_str() {
        "basic_sanity" => gate_basic_sanity(ctx, spec),
        "determinism_guard" => gate_determinism_guard(ctx, spec),
        "data_snapshot_integrity_v1" => gate_snapshot_integrity(ctx, spec),
        "holdout_leak_guard_v1" => gate_holdout_leak_guard(ctx, spec),
        "risk_policy_compliance_v1" => gate_risk_compliance(ctx, spec),
        "components_integrity_v1" => gate_components_integrity(ctx, spec),
        _ => GateOutcome::error(spec, "unsupported gate_id/gate_version"),
    }
}

fn segment_gate(ctx: &GateContext<'_>, spec: &GateSpec, segment: &Segment) -> GateOutcome {
    let mut outcome = if spec.gate_version != "v1" {
        GateOutcome::error(spec, "unsupported gate_id/gate_version")
    } else {
        match spec.gate_id.as_str() {
            "gate_no_lookahead_v1" => gate_no_lookahead(ctx, spec, segment),
            "gate_cost_x2_v1" => gate_stress(ctx, spec, segment, Stress::CostX2),
            "gate_delay_plus_1bar_v1" => gate_stress(ctx, spec, segment, Stress::DelayPlusOne),
            _ => GateOutcome::error(spec, "unsupported gate_id/gate_version"),
        }
    };
    outcome.segment_id = Some(segment.segment_id.clone());
    outcome.artifacts = outcome
        .artifacts
        .iter()
        .map(|a| match a.as_str() {
            "metrics.json" | "curve.csv" | "trades.csv" => format!("segments/{}/{}", segment.segment_id, a),
            _ => a.clone(),
        })
        .collect();
    outcome
}

/// Suite gates in declared order followed by any missing mandatory gates.
pub fn merged_gate_list(suite: &[GateSpec], adapter_id: &str) -> Vec<GateSpec> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for g in suite {
        if seen.insert((g.gate_id.clone(), g.gate_version.clone())) {
            out.push(g.clone());
        }
    }
    if adapter_id == VECTORBT_SIGNAL_V1 {
        for id in MANDATORY_VECTORBT_GATES {
            if seen.insert((id.to_string(), "v1".to_string())) {
                out.push(GateSpec {
                    gate_id: id.to_string(),
                    gate_version: "v1".into(),
                    params: Value::Object(Map::new()),
                });
            }
        }
    }
    out
}

pub struct GateRunInput<'a> {
    pub dossier_dir: &'a Path,
    pub bundle_path: &'a Path,
    pub data_root: &'a Path,
    pub artifact_root: &'a Path,
    pub job_root: &'a Path,
}

#[derive(Clone, Debug)]
pub struct GateRunReport {
    pub run_id: String,
    pub gate_suite_id: String,
    pub overall_pass: bool,
    pub invalid: bool,
    pub status: String,
    pub gate_results_path: PathBuf,
    pub gates: Vec<Value>,
}

impl GateRunReport {
    pub fn to_json(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "gate_suite_id": self.gate_suite_id,
            "overall_pass": self.overall_pass,
            "invalid": self.invalid,
            "status": self.status,
            "gate_results_path": self.gate_results_path.display().to_string(),
            "gates": self.gates,
        })
    }
}

fn gate_rows(results: &Value) -> Vec<Value> {
    results
        .get("results")
        .and_then(|v| v.as_array())
        .map(|rs| {
            rs.iter()
                .map(|r| {
                    json!({
                        "gate_id": r.get("gate_id"),
                        "pass": r.get("pass"),
                        "status": r.get("status"),
                        "segment_id": r.get("segment_id"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn require_json(dossier_dir: &Path, rel: &str) -> Result<Value> {
    read_json_object(&dossier_dir.join(rel))
        .ok_or_else(|| EamError::GateInvalid(format!("{} missing or not a JSON object", rel)).into())
}

/// Evaluate the policy gate suite against one dossier.
pub fn run_gates(input: &GateRunInput<'_>) -> Result<GateRunReport> {
    let results_path = input.dossier_dir.join(GATE_RESULTS_FILE);
    if results_path.is_file() {
        let existing = read_json(&results_path)?;
        return Ok(GateRunReport {
            run_id: existing.get("run_id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            gate_suite_id: existing.get("gate_suite_id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            overall_pass: existing.get("overall_pass").and_then(|v| v.as_bool()).unwrap_or(false),
            invalid: false,
            status: "noop".into(),
            gate_results_path: results_path,
            gates: gate_rows(&existing),
        });
    }
    let manifest = load_manifest(input.dossier_dir)
        .map_err(|e| EamError::GateInvalid(format!("dossier_manifest.json: {}", e)))?;
    let run_id = manifest
        .get("run_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EamError::GateInvalid("missing run_id in dossier_manifest.json".into()))?
        .to_string();
    let config_snapshot = require_json(input.dossier_dir, "config_snapshot.json")?;
    let metrics = require_json(input.dossier_dir, "metrics.json")?;
    let runspec = match config_snapshot.get("runspec") {
        Some(r) if r.is_object() => r.clone(),
        _ => return Err(EamError::GateInvalid("config_snapshot.runspec missing or not an object".into()).into()),
    };
    let policies = ResolvedPolicies::load(input.bundle_path)
        .map_err(|e| EamError::GateInvalid(format!("policy bundle: {}", e)))?;
    let suite = policies
        .gate_suite_params()
        .map_err(|e| EamError::GateInvalid(format!("gate suite: {}", e)))?;
    let adapter_id = runspec
        .pointer("/adapter/adapter_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let gates = merged_gate_list(&suite.gates, &adapter_id);
    let ctx = GateContext {
        dossier_dir: input.dossier_dir,
        policies: &policies,
        settings: EngineSettings::from_runspec(&runspec, &policies).map_err(|e| e.to_string()),
        runspec: &runspec,
        manifest: &manifest,
        config_snapshot: &config_snapshot,
        metrics: &metrics,
        catalog: DataCatalog::new(input.data_root),
        artifact_root: input.artifact_root,
        job_root: input.job_root,
    };

    let mut results: Vec<GateOutcome> = Vec::new();
    let mut holdout_summary = None;
    for spec in gates.iter().filter(|g| !SEGMENT_GATES.contains(&g.gate_id.as_str())) {
        if spec.gate_id == HOLDOUT_GATE {
            let (outcome, summary) = gate_holdout_passfail(&ctx, spec);
            holdout_summary = summary;
            results.push(outcome);
        } else {
            results.push(run_level_gate(&ctx, spec));
        }
        tracing::debug!(run_id = %run_id, gate_id = %spec.gate_id, "gate evaluated");
    }

    let segments = runspec_segments(&runspec).map_err(|e| EamError::GateInvalid(e.to_string()))?;
    let mut segment_results = Vec::new();
    let mut evidence_files = Vec::new();
    for seg in segments.iter().filter(|s| s.kind == SegmentKind::Test) {
        let mut seg_outcomes = Vec::new();
        for spec in gates.iter().filter(|g| SEGMENT_GATES.contains(&g.gate_id.as_str())) {
            let outcome = segment_gate(&ctx, spec, seg);
            let rel = format!("segments/{}/gate_{}.json", seg.segment_id, spec.gate_id);
            let path = input.dossier_dir.join(&rel);
            if !path.exists() {
                atomic_write_json_pretty(&path, &outcome.to_json())?;
            }
            evidence_files.push(rel);
            seg_outcomes.push(outcome);
        }
        segment_results.push(json!({
            "segment_id": seg.segment_id,
            "kind": seg.kind.as_str(),
            "overall_pass": seg_outcomes.iter().all(|o| o.pass),
            "results": seg_outcomes.iter().map(GateOutcome::to_json).collect::<Vec<_>>(),
        }));
        results.extend(seg_outcomes);
    }

    let invalid = results.iter().any(GateOutcome::is_invalidating);
    let overall_pass = results.iter().all(|o| o.pass);
    let mut doc = json!({
        "schema_version": "gate_results_v2",
        "run_id": run_id,
        "gate_suite_id": policies.gate_suite.policy_id,
        "overall_pass": overall_pass,
        "results": results.iter().map(GateOutcome::to_json).collect::<Vec<_>>(),
    });
    if !segment_results.is_empty() {
        doc["segment_results"] = Value::Array(segment_results);
    }
    if let Some(h) = holdout_summary {
        doc["holdout_summary"] = h;
    }
    ensure_valid(&doc).map_err(|e| anyhow!("gate_results schema validation failed: {}", e))?;
    atomic_write_json_pretty(&results_path, &doc)?;

    let mut registered = evidence_files;
    if input.dossier_dir.join(RISK_REPORT_FILE).is_file() {
        registered.push(RISK_REPORT_FILE.to_string());
    }
    registered.push(GATE_RESULTS_FILE.to_string());
    extend_manifest(input.dossier_dir, &registered)?;

    tracing::info!(run_id = %run_id, overall_pass, invalid, "gates complete");
    Ok(GateRunReport {
        run_id,
        gate_suite_id: policies.gate_suite.policy_id.clone(),
        overall_pass,
        invalid,
        status: "created".into(),
        gate_results_path: results_path,
        gates: gate_rows(&doc),
    })
}
