//! Blueprint + policy bundle + snapshot id -> `run_spec_v2`.
//!
//! Compilation is pure: the same inputs always produce the same runspec bytes
//! and therefore the same `run_id`.

use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDate};
use eam_core::{canonical_json_digest, is_safe_id, short_digest, EamError};
use eam_schemas::{ensure_valid, validate_payload};
use serde_json::{json, Value};
use std::path::Path;

use crate::backtest::{BUY_AND_HOLD_STRATEGY_ID, VECTORBT_SIGNAL_V1};
use crate::catalog::{Segment, SegmentKind};
use crate::dsl::SignalProgram;
use crate::lake::{parse_date, parse_timestamp, OHLCV_DATASET_ID};
use crate::policies::{find_inline_policy_keys, load_policy_bundle, PolicyBundle};

pub const COMPILER_VERSION: &str = "v1";
pub const RUNSPEC_ARTIFACTS: &[&str] = &[
    "metrics.json",
    "curve.csv",
    "trades.csv",
    "positions.csv",
    "turnover.csv",
    "exposure.json",
];

#[derive(Clone, Debug)]
pub struct CompiledRunspec {
    pub run_id: String,
    pub runspec: Value,
    pub segments: Vec<Segment>,
}

fn invalid(msg: impl Into<String>) -> anyhow::Error {
    EamError::InvalidContract(msg.into()).into()
}

fn protocol_bars(blueprint: &Value, key: &str) -> i64 {
    blueprint
        .pointer(&format!("/evaluation_protocol/{}/bars", key))
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
        .max(0)
}

fn declared_segment(blueprint: &Value, key: &str) -> Result<Option<(NaiveDate, NaiveDate, Option<String>)>> {
    let seg = match blueprint.pointer(&format!("/evaluation_protocol/segments/{}", key)) {
        Some(s) if s.is_object() => s,
        _ => return Ok(None),
    };
    let date = |field: &str| -> Result<NaiveDate> {
        let raw = seg
            .get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid(format!("blueprint at /evaluation_protocol/segments/{}/{}: required", key, field)))?;
        parse_date(raw)
    };
    let as_of = seg.get("as_of").and_then(|v| v.as_str()).map(String::from);
    Ok(Some((date("start")?, date("end")?, as_of)))
}

fn make_segment(
    id: &str,
    kind: SegmentKind,
    start: NaiveDate,
    end: NaiveDate,
    as_of: Option<&str>,
) -> Result<Segment> {
    if start > end {
        return Err(invalid(format!("segment {} has start {} after end {}", id, start, end)));
    }
    let mut seg = Segment::new(id, kind, start, end);
    if let Some(raw) = as_of {
        seg.as_of = parse_timestamp(raw)?;
    }
    Ok(seg)
}

/// Train/test pairs rolled over `[start, end]`.
fn walk_forward_segments(blueprint: &Value, wf: &Value) -> Result<Vec<Segment>> {
    let days = |key: &str| -> Result<i64> {
        wf.get(key)
            .and_then(|v| v.as_i64())
            .filter(|n| *n >= 1)
            .ok_or_else(|| invalid(format!("walk_forward.{} must be an integer >= 1", key)))
    };
    let train_days = days("train_window_days")?;
    let test_days = days("test_window_days")?;
    let step = days("step_days")?;
    let purge = protocol_bars(blueprint, "purge");
    let embargo = protocol_bars(blueprint, "embargo");
    let test_anchor = declared_segment(blueprint, "test")?;
    let train_anchor = declared_segment(blueprint, "train")?;
    let start = match wf.get("start").and_then(|v| v.as_str()) {
        Some(s) => parse_date(s)?,
        None => train_anchor
            .as_ref()
            .or(test_anchor.as_ref())
            .map(|(s, _, _)| *s)
            .ok_or_else(|| invalid("walk_forward needs start or a declared segment"))?,
    };
    let end = match wf.get("end").and_then(|v| v.as_str()) {
        Some(s) => parse_date(s)?,
        None => test_anchor
            .as_ref()
            .map(|(_, e, _)| *e)
            .ok_or_else(|| invalid("walk_forward needs end or a test segment"))?,
    };
    let mut out = Vec::new();
    let mut fold = 0usize;
    loop {
        let train_start = start + Duration::days(step * fold as i64);
        let train_end = train_start + Duration::days(train_days - 1 - purge);
        let test_start = train_start + Duration::days(train_days + embargo);
        let test_end = train_start + Duration::days(train_days + test_days - 1);
        if test_end > end || fold >= 1000 {
            break;
        }
        if train_end >= train_start {
            out.push(make_segment(&format!("train_{:03}", fold), SegmentKind::Train, train_start, train_end, None)?);
        }
        if test_start <= test_end {
            out.push(make_segment(&format!("test_{:03}", fold), SegmentKind::Test, test_start, test_end, None)?);
        }
        fold += 1;
    }
    if !out.iter().any(|s| s.kind == SegmentKind::Test) {
        return Err(invalid("walk_forward produced no test segment inside [start, end]"));
    }
    Ok(out)
}

fn fixed_split_segments(blueprint: &Value) -> Result<Vec<Segment>> {
    let purge = protocol_bars(blueprint, "purge");
    let embargo = protocol_bars(blueprint, "embargo");
    let mut out = Vec::new();
    if let Some((start, end, as_of)) = declared_segment(blueprint, "train")? {
        let end = end - Duration::days(purge);
        out.push(make_segment("train_000", SegmentKind::Train, start, end, as_of.as_deref())?);
    }
    let (start, end, as_of) = declared_segment(blueprint, "test")?
        .ok_or_else(|| invalid("blueprint at /evaluation_protocol/segments: 'test' is a required property"))?;
    let start = start + Duration::days(embargo);
    let test = make_segment("test_000", SegmentKind::Test, start, end, as_of.as_deref())?;
    if let Some(train) = out.first() {
        if train.end >= test.start {
            return Err(invalid(format!(
                "train segment must end before test starts ({} >= {})",
                train.end, test.start
            )));
        }
    }
    out.push(test);
    Ok(out)
}

pub fn compile_segments(blueprint: &Value) -> Result<Vec<Segment>> {
    let mut segments = match blueprint.pointer("/evaluation_protocol/walk_forward") {
        Some(wf) if wf.is_object() => walk_forward_segments(blueprint, wf)?,
        _ => fixed_split_segments(blueprint)?,
    };
    if let Some((start, end, as_of)) = declared_segment(blueprint, "holdout")? {
        let holdout = make_segment("holdout_000", SegmentKind::Holdout, start, end, as_of.as_deref())?;
        let last_test_end = segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Test)
            .map(|s| s.end)
            .max();
        if let Some(test_end) = last_test_end {
            if holdout.start <= test_end {
                return Err(invalid(format!(
                    "holdout must start after the last test segment ends ({} <= {})",
                    holdout.start, test_end
                )));
            }
        }
        segments.push(holdout);
    }
    Ok(segments)
}

fn check_blueprint(blueprint: &Value, bundle: &PolicyBundle) -> Result<()> {
    ensure_valid(blueprint)?;
    let declared = blueprint
        .get("policy_bundle_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if declared != bundle.policy_bundle_id {
        return Err(EamError::PolicyViolation(format!(
            "blueprint.policy_bundle_id mismatch: blueprint={} bundle={}",
            declared, bundle.policy_bundle_id
        ))
        .into());
    }
    let inline = find_inline_policy_keys(blueprint);
    if let Some(ptr) = inline.first() {
        return Err(EamError::PolicyViolation(format!(
            "blueprint at {}: inline policy parameters are forbidden (reference policies instead)",
            ptr
        ))
        .into());
    }
    let datasets: Vec<&str> = blueprint
        .get("data_requirements")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|d| d.get("dataset_id").and_then(|v| v.as_str())).collect())
        .unwrap_or_default();
    if !datasets.contains(&OHLCV_DATASET_ID) {
        return Err(invalid(format!(
            "blueprint at /data_requirements: dataset '{}' is required",
            OHLCV_DATASET_ID
        )));
    }
    if let Some(engine) = blueprint
        .pointer("/strategy_spec/extensions/engine_contract")
        .and_then(|v| v.as_str())
    {
        if engine != VECTORBT_SIGNAL_V1 {
            return Err(EamError::Usage(format!("unsupported engine_contract: {}", engine)).into());
        }
    }
    let spec = blueprint
        .get("strategy_spec")
        .ok_or_else(|| invalid("blueprint at /strategy_spec: required"))?;
    if spec.get("dsl_version").is_some() {
        let v = validate_payload(spec);
        if !v.is_ok() {
            return Err(invalid(format!("strategy_spec: {}", v.message)));
        }
        SignalProgram::parse(spec).map_err(|e| invalid(format!("strategy_spec: {}", e)))?;
    }
    Ok(())
}

/// Compile a blueprint against the bundle at `bundle_path`.
pub fn compile_blueprint(blueprint: &Value, bundle_path: &Path, snapshot_id: &str) -> Result<CompiledRunspec> {
    if !is_safe_id(snapshot_id) {
        return Err(EamError::Usage(format!("unsafe snapshot_id: {}", snapshot_id)).into());
    }
    let bundle = load_policy_bundle(bundle_path)?;
    check_blueprint(blueprint, &bundle)?;
    let segments = compile_segments(blueprint)?;

    let symbols = blueprint
        .pointer("/universe/symbols")
        .cloned()
        .ok_or_else(|| invalid("blueprint at /universe/symbols: required"))?;
    let strategy_id = blueprint
        .pointer("/strategy_spec/extensions/strategy_id")
        .and_then(|v| v.as_str())
        .unwrap_or("signal_dsl")
        .to_string();
    let mode = if blueprint.pointer("/evaluation_protocol/walk_forward").is_some() {
        "walk_forward"
    } else {
        "fixed_split"
    };
    let anchor = |kind: SegmentKind| {
        segments
            .iter()
            .find(|s| s.kind == kind)
            .map(Segment::to_json)
    };
    let mut seg_obj = serde_json::Map::new();
    for kind in [SegmentKind::Train, SegmentKind::Test, SegmentKind::Holdout] {
        if let Some(v) = anchor(kind) {
            seg_obj.insert(kind.as_str().to_string(), v);
        }
    }
    seg_obj.insert(
        "list".into(),
        Value::Array(segments.iter().map(Segment::to_json).collect()),
    );
    let mut extensions = json!({
        "compiler_version": COMPILER_VERSION,
        "dataset_id": OHLCV_DATASET_ID,
        "symbols": symbols,
        "strategy_id": strategy_id,
        "evaluation_protocol": {
            "mode": mode,
            "purge_bars": protocol_bars(blueprint, "purge"),
            "embargo_bars": protocol_bars(blueprint, "embargo"),
        },
    });
    if strategy_id != BUY_AND_HOLD_STRATEGY_ID {
        if let Some(spec) = blueprint.get("strategy_spec") {
            extensions["strategy_spec"] = spec.clone();
        }
    }
    let runspec = json!({
        "schema_version": "run_spec_v2",
        "blueprint_ref": {
            "blueprint_id": blueprint.get("blueprint_id").cloned().unwrap_or(Value::Null),
            "blueprint_hash": canonical_json_digest(blueprint),
        },
        "policy_bundle_id": bundle.policy_bundle_id,
        "data_snapshot_id": snapshot_id,
        "segments": Value::Object(seg_obj),
        "adapter": {"adapter_id": VECTORBT_SIGNAL_V1},
        "output_spec": {"artifacts": RUNSPEC_ARTIFACTS},
        "extensions": extensions,
    });
    ensure_valid(&runspec).map_err(|e| anyhow!("compiled runspec failed its contract: {}", e))?;
    let run_id = short_digest(&runspec);
    tracing::info!(run_id = %run_id, mode, segments = segments.len(), "runspec compiled");
    Ok(CompiledRunspec {
        run_id,
        runspec,
        segments,
    })
}

pub fn runspec_run_id(runspec: &Value) -> String {
    short_digest(runspec)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::policies::tests::repo_policies_dir;
    use serde_json::json;
    use std::path::PathBuf;

    pub(crate) fn demo_blueprint() -> Value {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../contracts/examples/blueprint_ok.json");
        eam_core::read_json(&path).expect("demo blueprint")
    }

    pub(crate) fn bundle_path() -> PathBuf {
        repo_policies_dir().join("policy_bundle_v1.yaml")
    }

    #[test]
    fn demo_blueprint_compiles_deterministically() {
        let a = compile_blueprint(&demo_blueprint(), &bundle_path(), "demo_snap").expect("compile");
        let b = compile_blueprint(&demo_blueprint(), &bundle_path(), "demo_snap").expect("compile");
        assert_eq!(a.run_id, b.run_id);
        assert_eq!(a.run_id.len(), 12);
        let ids: Vec<&str> = a.segments.iter().map(|s| s.segment_id.as_str()).collect();
        assert_eq!(ids, vec!["train_000", "test_000", "holdout_000"]);
        assert_eq!(
            a.runspec.pointer("/segments/test/as_of").and_then(|v| v.as_str()),
            Some("2024-01-07T23:59:59+08:00")
        );
        let other = compile_blueprint(&demo_blueprint(), &bundle_path(), "other_snap").expect("compile");
        assert_ne!(a.run_id, other.run_id);
    }

    #[test]
    fn inline_policy_params_are_rejected() {
        let mut bp = demo_blueprint();
        bp["strategy_spec"]["execution"]["cost_model"]["commission_bps"] = json!(1.0);
        let err = compile_blueprint(&bp, &bundle_path(), "demo_snap").expect_err("inline");
        assert!(
            err.to_string().contains("/strategy_spec/execution/cost_model/commission_bps"),
            "unexpected: {}",
            err
        );
    }

    #[test]
    fn bundle_mismatch_and_overlapping_holdout_fail() {
        let mut bp = demo_blueprint();
        bp["policy_bundle_id"] = json!("someone_else");
        let err = compile_blueprint(&bp, &bundle_path(), "demo_snap").expect_err("mismatch");
        assert!(err.to_string().contains("blueprint.policy_bundle_id mismatch"));

        let mut bp = demo_blueprint();
        bp["evaluation_protocol"]["segments"]["holdout"]["start"] = json!("2024-01-06");
        let err = compile_blueprint(&bp, &bundle_path(), "demo_snap").expect_err("overlap");
        assert!(err.to_string().contains("holdout must start after"), "unexpected: {}", err);
    }

    #[test]
    fn walk_forward_rolls_folds_with_purge_and_embargo() {
        let mut bp = demo_blueprint();
        bp["evaluation_protocol"]["walk_forward"] = json!({
            "train_window_days": 3,
            "test_window_days": 2,
            "step_days": 2,
            "start": "2024-01-01",
            "end": "2024-01-07"
        });
        bp["evaluation_protocol"]["purge"] = json!({"bars": 1});
        bp["evaluation_protocol"]["embargo"] = json!({"bars": 0});
        let segs = compile_segments(&bp).expect("segments");
        let ids: Vec<&str> = segs.iter().map(|s| s.segment_id.as_str()).collect();
        assert_eq!(ids, vec!["train_000", "test_000", "train_001", "test_001", "holdout_000"]);
        // purge trims one day off each training window
        assert_eq!(segs[0].end, NaiveDate::from_ymd_opt(2024, 1, 2).expect("date"));
        assert_eq!(segs[3].end, NaiveDate::from_ymd_opt(2024, 1, 7).expect("date"));
    }
}
