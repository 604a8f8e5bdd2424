//! Curve-level composition: a weighted blend of card runs sealed as a new
//! dossier with its own runspec, gates and (optionally) its own card.
//!
//! Components are aligned on the intersection of their curve dates. Each
//! component contributes its daily return scaled by its normalized weight and
//! the composed equity is rebuilt from `base_equity`.

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use eam_core::{canonical_json_digest, read_json_object, sha256_file, short_digest, EamError};
use eam_schemas::ensure_valid;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::catalog::{runspec_symbols, Segment, SegmentKind};
use crate::dossier::{dossier_dir, write_dossier, DossierInput, ExistsBehavior};
use crate::gates::{run_gates, GateRunInput};
use crate::lake::parse_date;
use crate::policies::ResolvedPolicies;
use crate::registry::{create_card_from_run, record_trial, show_card};

pub const CURVE_COMPOSER_V1: &str = "curve_composer_v1";
pub const COMPOSER_BLUEPRINT_ID: &str = "composer_curve_level_mvp_v1";
pub const COMPOSER_SNAPSHOT_ID: &str = "composer_virtual_v1";
pub const COMPONENTS_FILE: &str = "components.json";
const WEIGHT_TOLERANCE: f64 = 1e-9;
const BASE_EQUITY: f64 = 1.0;
const TRADING_DAYS: f64 = 252.0;

/// One aligned input curve.
#[derive(Clone, Debug)]
pub struct CurveComponent {
    pub card_id: String,
    pub run_id: String,
    pub weight: f64,
    pub curve: Vec<(NaiveDate, f64)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComposedStats {
    pub total_return: f64,
    pub max_drawdown: f64,
    pub sharpe: Option<f64>,
    pub final_equity: f64,
}

#[derive(Clone, Debug)]
pub struct ComposedCurve {
    pub curve: Vec<(NaiveDate, f64)>,
    pub stats: ComposedStats,
    pub alignment_stats: Value,
}

impl ComposedCurve {
    pub fn curve_csv(&self) -> String {
        let mut out = String::from("dt,equity\n");
        for (dt, eq) in &self.curve {
            out.push_str(&format!("{},{:.6}\n", dt, eq));
        }
        out
    }

    pub fn metrics_json(&self) -> Value {
        json!({
            "adapter_id": CURVE_COMPOSER_V1,
            "n_bars": self.curve.len(),
            "total_return": self.stats.total_return,
            "max_drawdown": self.stats.max_drawdown,
            "sharpe": self.stats.sharpe,
            "trade_count": 0,
            "final_equity": self.stats.final_equity,
        })
    }
}

/// Parse a dossier `curve.csv` (`dt,equity`).
pub fn read_curve_csv(path: &Path) -> Result<Vec<(NaiveDate, f64)>> {
    let text = fs::read_to_string(path)
        .map_err(|e| EamError::InvalidContract(format!("read {}: {}", path.display(), e)))?;
    let mut lines = text.lines();
    let header: Vec<&str> = lines.next().unwrap_or_default().split(',').map(str::trim).collect();
    let dt_col = header.iter().position(|h| *h == "dt");
    let eq_col = header.iter().position(|h| *h == "equity");
    let (dt_col, eq_col) = match (dt_col, eq_col) {
        (Some(d), Some(e)) => (d, e),
        _ => return Err(EamError::InvalidContract(format!("{}: expected dt,equity header", path.display())).into()),
    };
    let mut out = Vec::new();
    for line in lines.filter(|l| !l.trim().is_empty()) {
        let cells: Vec<&str> = line.split(',').map(str::trim).collect();
        let dt = cells.get(dt_col).ok_or_else(|| anyhow!("short curve row: {}", line))?;
        let eq = cells
            .get(eq_col)
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(|| anyhow!("bad equity in curve row: {}", line))?;
        out.push((parse_date(dt)?, eq));
    }
    Ok(out)
}

fn span(curve: &[(NaiveDate, f64)]) -> Option<(NaiveDate, NaiveDate)> {
    Some((curve.first()?.0, curve.last()?.0))
}

/// Blend `components` on the intersection of their dates.
pub fn compose_curves(components: &[CurveComponent], base_equity: f64) -> Result<ComposedCurve> {
    if components.is_empty() {
        return Err(EamError::Usage("at least one component is required".into()).into());
    }
    let weight_sum: f64 = components.iter().map(|c| c.weight).sum();
    if weight_sum.abs() < WEIGHT_TOLERANCE {
        return Err(EamError::Usage("weights must not sum to zero".into()).into());
    }

    let series: Vec<BTreeMap<NaiveDate, f64>> = components
        .iter()
        .map(|c| c.curve.iter().copied().collect())
        .collect();
    let mut dates: BTreeSet<NaiveDate> = series[0].keys().copied().collect();
    for s in &series[1..] {
        dates.retain(|d| s.contains_key(d));
    }
    if dates.is_empty() {
        return Err(EamError::InvalidContract("component curves share no dates".into()).into());
    }
    let dates: Vec<NaiveDate> = dates.into_iter().collect();

    let mut composed = vec![0.0_f64; dates.len()];
    for (component, s) in components.iter().zip(&series) {
        let w = component.weight / weight_sum;
        for i in 1..dates.len() {
            let prev = s[&dates[i - 1]];
            let cur = s[&dates[i]];
            let r = if prev != 0.0 { cur / prev - 1.0 } else { 0.0 };
            composed[i] += w * r;
        }
    }
    let mut curve = Vec::with_capacity(dates.len());
    let mut equity = base_equity;
    for (dt, r) in dates.iter().zip(&composed) {
        equity *= 1.0 + r;
        curve.push((*dt, equity));
    }

    let first = curve[0].1;
    let last = curve[curve.len() - 1].1;
    let mut peak = f64::MIN;
    let mut max_dd = 0.0_f64;
    for (_, e) in &curve {
        peak = peak.max(*e);
        if peak > 0.0 {
            max_dd = max_dd.max((peak - e) / peak);
        }
    }
    let returns = &composed[1..];
    let sharpe = if returns.len() >= 2 {
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
        let sd = var.sqrt();
        (sd > 0.0 && sd.is_finite()).then(|| mean / sd * TRADING_DAYS.sqrt())
    } else {
        None
    };

    let per_component: Vec<Value> = components
        .iter()
        .map(|c| {
            let (start, end) = span(&c.curve).map(|(a, b)| (a.to_string(), b.to_string())).unwrap_or_default();
            json!({
                "card_id": c.card_id,
                "run_id": c.run_id,
                "points": c.curve.len(),
                "start": start,
                "end": end,
            })
        })
        .collect();
    let alignment_stats = json!({
        "align": "intersection",
        "overall": {
            "intersection_points": dates.len(),
            "start": dates[0].to_string(),
            "end": dates[dates.len() - 1].to_string(),
        },
        "components": per_component,
    });

    Ok(ComposedCurve {
        stats: ComposedStats {
            total_return: if first != 0.0 { last / first - 1.0 } else { 0.0 },
            max_drawdown: max_dd,
            sharpe,
            final_equity: last,
        },
        curve,
        alignment_stats,
    })
}

pub struct ComposeInput<'a> {
    pub card_ids: &'a [String],
    pub weights: &'a [f64],
    pub bundle_path: &'a Path,
    pub registry_root: &'a Path,
    pub artifact_root: &'a Path,
    pub data_root: &'a Path,
    pub job_root: &'a Path,
    /// Card title; when set the composed run is recorded and carded on PASS.
    pub register_title: Option<&'a str>,
}

#[derive(Clone, Debug)]
pub struct ComposeOutcome {
    pub run_id: String,
    pub dossier_dir: PathBuf,
    pub status: String,
    pub overall_pass: bool,
    pub gate_results_path: PathBuf,
    pub trial: Option<Value>,
    pub card: Option<Value>,
}

impl ComposeOutcome {
    pub fn to_json(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "dossier_dir": self.dossier_dir.display().to_string(),
            "status": self.status,
            "overall_pass": self.overall_pass,
            "gate_results_path": self.gate_results_path.display().to_string(),
            "trial": self.trial,
            "card": self.card,
        })
    }
}

fn check_weights(card_ids: &[String], weights: &[f64], allow_negative: bool) -> Result<()> {
    if card_ids.is_empty() {
        return Err(EamError::Usage("at least one card_id is required".into()).into());
    }
    if card_ids.len() != weights.len() {
        return Err(EamError::Usage(format!(
            "card_ids and weights must have the same length ({} vs {})",
            card_ids.len(),
            weights.len()
        ))
        .into());
    }
    let unique: BTreeSet<&str> = card_ids.iter().map(String::as_str).collect();
    if unique.len() != card_ids.len() {
        return Err(EamError::Usage("card_ids must be unique".into()).into());
    }
    if weights.iter().any(|w| !w.is_finite()) {
        return Err(EamError::Usage("weights must be finite numbers".into()).into());
    }
    if !allow_negative && weights.iter().any(|w| *w < 0.0) {
        return Err(EamError::Usage("negative weights are not allowed by the policy bundle".into()).into());
    }
    let sum: f64 = weights.iter().sum();
    if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(EamError::Usage(format!("weights must sum to 1 (got {})", sum)).into());
    }
    Ok(())
}

struct ResolvedComponent {
    component: CurveComponent,
    curve_sha256: String,
    symbols: Vec<String>,
}

fn resolve_component(registry_root: &Path, dossiers: &Path, card_id: &str, weight: f64) -> Result<ResolvedComponent> {
    let card = show_card(registry_root, card_id)?;
    let run_id = card
        .get("primary_run_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EamError::InvalidContract(format!("card {} has no primary_run_id", card_id)))?
        .to_string();
    let dir = dossier_dir(dossiers, &run_id)?;
    let curve_path = dir.join("curve.csv");
    let curve = read_curve_csv(&curve_path)?;
    if curve.is_empty() {
        return Err(EamError::InvalidContract(format!("empty curve for run_id={}", run_id)).into());
    }
    let symbols = read_json_object(&dir.join("config_snapshot.json"))
        .and_then(|c| c.get("runspec").map(runspec_symbols))
        .unwrap_or_default();
    Ok(ResolvedComponent {
        curve_sha256: sha256_file(&curve_path)?,
        symbols,
        component: CurveComponent {
            card_id: card_id.to_string(),
            run_id,
            weight,
            curve,
        },
    })
}

fn composer_runspec(policy_bundle_id: &str, composer_spec: &Value, window: (NaiveDate, NaiveDate), symbols: &[String]) -> Result<Value> {
    let (start, end) = window;
    let segments: Vec<Segment> = [
        ("train_000", SegmentKind::Train),
        ("test_000", SegmentKind::Test),
        ("holdout_000", SegmentKind::Holdout),
    ]
    .iter()
    .map(|(id, kind)| Segment::new(id, *kind, start, end))
    .collect();
    let mut seg_obj = serde_json::Map::new();
    for seg in &segments {
        seg_obj.insert(seg.kind.as_str().to_string(), seg.to_json());
    }
    seg_obj.insert("list".into(), Value::Array(segments.iter().map(Segment::to_json).collect()));
    let mut extensions = json!({"composer_spec": composer_spec});
    if !symbols.is_empty() {
        extensions["symbols"] = json!(symbols);
    }
    let runspec = json!({
        "schema_version": "run_spec_v2",
        "blueprint_ref": {
            "blueprint_id": COMPOSER_BLUEPRINT_ID,
            "blueprint_hash": canonical_json_digest(composer_spec),
        },
        "policy_bundle_id": policy_bundle_id,
        "data_snapshot_id": COMPOSER_SNAPSHOT_ID,
        "segments": Value::Object(seg_obj),
        "adapter": {"adapter_id": CURVE_COMPOSER_V1},
        "output_spec": {"artifacts": ["metrics.json", "curve.csv", "trades.csv", COMPONENTS_FILE]},
        "extensions": extensions,
    });
    ensure_valid(&runspec).map_err(|e| anyhow!("composer runspec failed its contract: {}", e))?;
    Ok(runspec)
}

fn report_markdown(run_id: &str, composed: &ComposedCurve, components: &[CurveComponent]) -> String {
    let mut out = format!("# Composed run {}\n\n", run_id);
    out.push_str(&format!("- adapter: {}\n", CURVE_COMPOSER_V1));
    out.push_str(&format!("- total_return: {:.6}\n", composed.stats.total_return));
    out.push_str(&format!("- max_drawdown: {:.6}\n", composed.stats.max_drawdown));
    match composed.stats.sharpe {
        Some(s) => out.push_str(&format!("- sharpe: {:.6}\n", s)),
        None => out.push_str("- sharpe: n/a\n"),
    }
    out.push_str("\n## Components\n\n| card_id | run_id | weight |\n|---|---|---|\n");
    for c in components {
        out.push_str(&format!("| {} | {} | {:.6} |\n", c.card_id, c.run_id, c.weight));
    }
    out
}

/// Compose card runs into a sealed, gated dossier. Reruns with the same
/// cards and weights are noops down to registration.
pub fn compose_runs(input: &ComposeInput<'_>) -> Result<ComposeOutcome> {
    if let Some(title) = input.register_title {
        if title.trim().is_empty() {
            return Err(EamError::Usage("registering a composed card requires a title".into()).into());
        }
    }
    let policies = ResolvedPolicies::load(input.bundle_path)?;
    let allow_negative = policies
        .bundle
        .doc
        .pointer("/extensions/composer/allow_negative_weights")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    check_weights(input.card_ids, input.weights, allow_negative)?;

    let dossiers = input.artifact_root.join("dossiers");
    let mut resolved = input
        .card_ids
        .iter()
        .zip(input.weights)
        .map(|(card_id, w)| resolve_component(input.registry_root, &dossiers, card_id.trim(), *w))
        .collect::<Result<Vec<_>>>()?;
    resolved.sort_by(|a, b| {
        (&a.component.card_id, &a.component.run_id).cmp(&(&b.component.card_id, &b.component.run_id))
    });
    let components: Vec<CurveComponent> = resolved.iter().map(|r| r.component.clone()).collect();

    let window = components
        .iter()
        .filter_map(|c| span(&c.curve))
        .fold(None, |acc: Option<(NaiveDate, NaiveDate)>, (s, e)| match acc {
            None => Some((s, e)),
            Some((a, b)) => Some((a.min(s), b.max(e))),
        })
        .ok_or_else(|| EamError::InvalidContract("component curves are empty".into()))?;
    let symbols: Vec<String> = resolved
        .iter()
        .flat_map(|r| r.symbols.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let composer_spec = json!({
        "schema_version": "composer_spec_v1",
        "align": "intersection",
        "base_equity": BASE_EQUITY,
        "components": components
            .iter()
            .map(|c| json!({"card_id": c.card_id, "run_id": c.run_id, "weight": c.weight}))
            .collect::<Vec<_>>(),
    });
    let runspec = composer_runspec(&policies.bundle.policy_bundle_id, &composer_spec, window, &symbols)?;
    let run_id = short_digest(&runspec);

    let composed = compose_curves(&components, BASE_EQUITY)?;
    let components_doc = json!({
        "schema_version": "curve_composer_components_v1",
        "run_id": run_id,
        "components": composer_spec["components"],
        "alignment_stats": composed.alignment_stats,
    });
    let config_snapshot = json!({
        "run_id": run_id,
        "runspec": runspec,
        "policy_bundle_id": policies.bundle.policy_bundle_id,
        "policy_bundle_file": policies.bundle.path.file_name().and_then(|s| s.to_str()).unwrap_or_default(),
        "policy_sha256": policies.sha256_map()?,
        "policy_ids": {"gate_suite": policies.gate_suite.policy_id},
        "env": {
            "adapter_id": CURVE_COMPOSER_V1,
            "engine": env!("CARGO_PKG_NAME"),
            "engine_version": env!("CARGO_PKG_VERSION"),
        },
    });
    let data_manifest = json!({
        "snapshot_id": COMPOSER_SNAPSHOT_ID,
        "virtual": true,
        "components": resolved
            .iter()
            .map(|r| json!({
                "card_id": r.component.card_id,
                "run_id": r.component.run_id,
                "curve_sha256": r.curve_sha256,
            }))
            .collect::<Vec<_>>(),
    });
    let mut dossier = DossierInput {
        run_id: run_id.clone(),
        policy_bundle_id: policies.bundle.policy_bundle_id.clone(),
        data_snapshot_id: COMPOSER_SNAPSHOT_ID.to_string(),
        blueprint_hash: runspec
            .pointer("/blueprint_ref/blueprint_hash")
            .and_then(|v| v.as_str())
            .map(String::from),
        ..Default::default()
    };
    dossier
        .add_json("config_snapshot.json", config_snapshot)
        .add_json("data_manifest.json", data_manifest)
        .add_json("metrics.json", composed.metrics_json())
        .add_json(COMPONENTS_FILE, components_doc)
        .add_text("curve.csv", composed.curve_csv())
        .add_text("trades.csv", "symbol,entry_dt,exit_dt,pnl,qty,fees\n".to_string())
        .add_text("reports/report.md", report_markdown(&run_id, &composed, &components));
    let written = write_dossier(&dossiers, &dossier, ExistsBehavior::Noop)?;
    tracing::info!(run_id = %run_id, components = components.len(), status = %written.status, "composed run sealed");

    let gates = run_gates(&GateRunInput {
        dossier_dir: &written.dossier_dir,
        bundle_path: input.bundle_path,
        data_root: input.data_root,
        artifact_root: input.artifact_root,
        job_root: input.job_root,
    })?;

    let (mut trial, mut card) = (None, None);
    if let Some(title) = input.register_title {
        trial = Some(record_trial(&written.dossier_dir, input.registry_root, ExistsBehavior::Noop)?);
        if gates.overall_pass {
            card = Some(create_card_from_run(input.registry_root, &run_id, title, ExistsBehavior::Noop)?);
        } else {
            tracing::warn!(run_id = %run_id, "composed run failed its gates; no card created");
        }
    }
    Ok(ComposeOutcome {
        run_id,
        dossier_dir: written.dossier_dir,
        status: written.status,
        overall_pass: gates.overall_pass,
        gate_results_path: gates.gate_results_path,
        trial,
        card,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_blueprint;
    use crate::compiler::tests::{bundle_path, demo_blueprint};
    use crate::lake::demo_ingest;
    use crate::lake::tests::demo_latency;
    use crate::policies::tests::repo_policies_dir;
    use crate::runner::run_runspec;
    use eam_core::scratch_dir;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).expect("date")
    }

    fn component(card_id: &str, weight: f64, points: &[(&str, f64)]) -> CurveComponent {
        CurveComponent {
            card_id: card_id.into(),
            run_id: format!("run_{}", card_id),
            weight,
            curve: points.iter().map(|(dt, eq)| (d(dt), *eq)).collect(),
        }
    }

    fn composer_bundle() -> PathBuf {
        repo_policies_dir().join("policy_bundle_composer_v1.yaml")
    }

    /// Gate-passing card over the demo snapshot, one per blueprint id.
    fn carded(root: &Path, blueprint_id: &str) -> String {
        let mut bp = demo_blueprint();
        bp["blueprint_id"] = json!(blueprint_id);
        let compiled = compile_blueprint(&bp, &bundle_path(), "demo_snap").expect("compile");
        let outcome = run_runspec(
            &compiled.runspec,
            &bundle_path(),
            &root.join("data"),
            &root.join("artifacts/dossiers"),
            ExistsBehavior::Noop,
        )
        .expect("run");
        run_gates(&GateRunInput {
            dossier_dir: &outcome.dossier_dir,
            bundle_path: &bundle_path(),
            data_root: &root.join("data"),
            artifact_root: &root.join("artifacts"),
            job_root: &root.join("artifacts/jobs"),
        })
        .expect("gates");
        let registry = root.join("artifacts/registry");
        record_trial(&outcome.dossier_dir, &registry, ExistsBehavior::Noop).expect("record");
        let card = create_card_from_run(&registry, &outcome.run_id, blueprint_id, ExistsBehavior::Noop).expect("card");
        card["card_id"].as_str().expect("card_id").to_string()
    }

    fn compose(root: &Path, card_ids: &[String], weights: &[f64], title: Option<&str>) -> Result<ComposeOutcome> {
        compose_runs(&ComposeInput {
            card_ids,
            weights,
            bundle_path: &composer_bundle(),
            registry_root: &root.join("artifacts/registry"),
            artifact_root: &root.join("artifacts"),
            data_root: &root.join("data"),
            job_root: &root.join("artifacts/jobs"),
            register_title: title,
        })
    }

    #[test]
    fn curves_blend_on_date_intersection() {
        let a = component("a", 3.0, &[("2024-01-01", 100.0), ("2024-01-02", 110.0), ("2024-01-03", 121.0), ("2024-01-04", 121.0)]);
        let b = component("b", 1.0, &[("2024-01-02", 50.0), ("2024-01-03", 45.0), ("2024-01-04", 54.0), ("2024-01-05", 60.0)]);
        let out = compose_curves(&[a, b], 1.0).expect("compose");
        let dates: Vec<String> = out.curve.iter().map(|(dt, _)| dt.to_string()).collect();
        assert_eq!(dates, vec!["2024-01-02", "2024-01-03", "2024-01-04"]);
        // day 2: 0.75 * 10% + 0.25 * -10% = 5%; day 3: 0.75 * 0% + 0.25 * 20% = 5%
        assert!((out.curve[0].1 - 1.0).abs() < 1e-12);
        assert!((out.curve[1].1 - 1.05).abs() < 1e-12);
        assert!((out.curve[2].1 - 1.1025).abs() < 1e-12);
        assert!((out.stats.total_return - 0.1025).abs() < 1e-12);
        assert_eq!(out.stats.max_drawdown, 0.0);
        assert_eq!(out.alignment_stats["overall"]["intersection_points"], 3);
        assert_eq!(out.alignment_stats["components"][1]["start"], "2024-01-02");
    }

    #[test]
    fn drawdown_and_sharpe_follow_the_composed_curve() {
        let a = component("a", 1.0, &[("2024-01-01", 1.0), ("2024-01-02", 1.2), ("2024-01-03", 0.9), ("2024-01-04", 1.0)]);
        let out = compose_curves(&[a], 1.0).expect("compose");
        assert!((out.stats.max_drawdown - 0.25).abs() < 1e-12);
        assert!(out.stats.sharpe.is_some());
        assert_eq!(out.metrics_json()["trade_count"], 0);
        assert!(out.curve_csv().starts_with("dt,equity\n2024-01-01,1.000000\n"));

        let short = component("s", 1.0, &[("2024-01-01", 1.0), ("2024-01-02", 1.1)]);
        assert!(compose_curves(&[short], 1.0).expect("compose").stats.sharpe.is_none());
    }

    #[test]
    fn disjoint_curves_are_rejected() {
        let a = component("a", 0.5, &[("2024-01-01", 1.0)]);
        let b = component("b", 0.5, &[("2024-02-01", 1.0)]);
        let err = compose_curves(&[a, b], 1.0).expect_err("disjoint");
        assert!(err.to_string().contains("share no dates"), "unexpected: {}", err);
    }

    #[test]
    fn weights_are_checked_before_any_card_is_read() {
        let ids = vec!["card_a".to_string(), "card_b".to_string()];
        let err = check_weights(&ids, &[0.5], false).expect_err("count");
        assert!(err.to_string().contains("same length"), "unexpected: {}", err);
        let err = check_weights(&ids, &[0.6, 0.6], false).expect_err("sum");
        assert!(err.to_string().contains("sum to 1"), "unexpected: {}", err);
        let err = check_weights(&ids, &[1.5, -0.5], false).expect_err("negative");
        assert!(err.to_string().contains("negative weights"), "unexpected: {}", err);
        check_weights(&ids, &[1.5, -0.5], true).expect("negative allowed");
        let dup = vec!["card_a".to_string(), "card_a".to_string()];
        assert!(check_weights(&dup, &[0.5, 0.5], false).is_err());

        let root = scratch_dir("eam_composer_weights_test");
        let err = compose(&root, &ids, &[0.7, 0.7], None).expect_err("sum");
        assert!(matches!(err.downcast_ref::<EamError>(), Some(EamError::Usage(_))), "unexpected: {}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn composed_run_is_gated_and_carded() {
        let root = scratch_dir("eam_composer_run_test");
        demo_ingest(&root.join("data/lake"), "demo_snap", &demo_latency()).expect("ingest");
        let cards = vec![carded(&root, "bp_blend_a"), carded(&root, "bp_blend_b")];

        let outcome = compose(&root, &cards, &[0.5, 0.5], Some("Blend of demo runs")).expect("compose");
        assert_eq!(outcome.status, "created");
        assert!(outcome.overall_pass, "gates: {}", fs::read_to_string(&outcome.gate_results_path).unwrap_or_default());
        for f in ["config_snapshot.json", "metrics.json", "curve.csv", "trades.csv", COMPONENTS_FILE, "reports/report.md"] {
            assert!(outcome.dossier_dir.join(f).is_file(), "missing {}", f);
        }
        let components = eam_core::read_json(&outcome.dossier_dir.join(COMPONENTS_FILE)).expect("components");
        assert_eq!(components["schema_version"], "curve_composer_components_v1");
        assert!(components["alignment_stats"]["overall"]["intersection_points"].as_u64().unwrap_or(0) >= 2);
        let config = eam_core::read_json(&outcome.dossier_dir.join("config_snapshot.json")).expect("config");
        assert_eq!(config["runspec"]["adapter"]["adapter_id"], CURVE_COMPOSER_V1);
        assert_eq!(config["runspec"]["data_snapshot_id"], COMPOSER_SNAPSHOT_ID);
        assert_eq!(short_digest(&config["runspec"]), outcome.run_id);

        let card = outcome.card.clone().expect("card on pass");
        assert_eq!(card["primary_run_id"], outcome.run_id.as_str());
        assert_eq!(outcome.trial.as_ref().map(|t| t["adapter_id"].clone()), Some(json!(CURVE_COMPOSER_V1)));

        // same blend in another order is the same run
        let reversed = vec![cards[1].clone(), cards[0].clone()];
        let again = compose(&root, &reversed, &[0.5, 0.5], Some("Blend of demo runs")).expect("rerun");
        assert_eq!(again.run_id, outcome.run_id);
        assert_eq!(again.status, "noop");
        assert_eq!(again.card.as_ref().map(|c| c["card_id"].clone()), Some(card["card_id"].clone()));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_component_fails_the_composed_gates() {
        let root = scratch_dir("eam_composer_fail_test");
        demo_ingest(&root.join("data/lake"), "demo_snap", &demo_latency()).expect("ingest");
        let cards = vec![carded(&root, "bp_blend_a"), carded(&root, "bp_blend_b")];
        let registry = root.join("artifacts/registry");
        let run_id = show_card(&registry, &cards[1]).expect("card")["primary_run_id"]
            .as_str()
            .expect("run")
            .to_string();
        let gr_path = root.join("artifacts/dossiers").join(&run_id).join("gate_results.json");
        let mut gr = eam_core::read_json(&gr_path).expect("gate results");
        gr["overall_pass"] = json!(false);
        eam_core::atomic_write_json_pretty(&gr_path, &gr).expect("write");

        let outcome = compose(&root, &cards, &[0.25, 0.75], Some("Blend")).expect("compose");
        assert!(!outcome.overall_pass);
        assert!(outcome.card.is_none());
        assert_eq!(outcome.trial.as_ref().map(|t| t["overall_pass"].clone()), Some(json!(false)));
        let text = fs::read_to_string(&outcome.gate_results_path).expect("results");
        assert!(text.contains("component overall_pass=false"), "unexpected: {}", text);
        let _ = fs::remove_dir_all(root);
    }
}
