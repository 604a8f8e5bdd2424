//! Job-level data fetch: pre-flight validation, execution against the lake,
//! and sealing the evidence into the run's dossier.

use anyhow::Result;
use chrono::NaiveDate;
use eam_core::{atomic_write_json_pretty, atomic_write_text, copy_tree, ensure_dir, read_json, EamError};
use eam_runner::catalog::{runspec_segments, runspec_symbols, DataCatalog};
use eam_runner::dossier::extend_manifest;
use eam_runner::lake::{bars_to_csv, end_of_day, format_ts, parse_date, parse_timestamp, OHLCV_DATASET_ID};
use eam_schemas::validate_fetch_request;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

pub const FETCH_DIR: &str = "fetch";
pub const VALIDATION_ERROR_FILE: &str = "fetch_request_validation_error.json";
pub const FETCH_REQUEST_FILE: &str = "fetch_request.json";
pub const FETCH_META_FILE: &str = "fetch_result_meta.json";
pub const FETCH_PREVIEW_FILE: &str = "fetch_preview.csv";
pub const FETCH_STEPS_INDEX_FILE: &str = "fetch_steps_index.json";

pub fn fetch_dir(job_dir: &Path) -> PathBuf {
    job_dir.join("outputs").join(FETCH_DIR)
}

/// Validate the request before anything is dispatched. A failure leaves
/// `fetch_request_validation_error.json` behind and returns
/// `FetchRequestInvalid`.
pub fn preflight_fetch_request(job_dir: &Path, request: &Value) -> Result<()> {
    let validation = validate_fetch_request(request);
    if validation.is_ok() {
        return Ok(());
    }
    let path = fetch_dir(job_dir).join(VALIDATION_ERROR_FILE);
    atomic_write_json_pretty(
        &path,
        &json!({
            "schema_version": "fetch_request_validation_error_v1",
            "code": "FETCH_REQUEST_INVALID",
            "exit_code": validation.code,
            "message": validation.message,
            "fetch_request": request,
        }),
    )?;
    tracing::warn!(path = %path.display(), "fetch request rejected before dispatch");
    Err(EamError::FetchRequestInvalid(validation.message).into())
}

/// First non-null value at `/key`, `/intent/key` or `/kwargs/key`.
fn lookup<'a>(req: &'a Value, key: &str) -> Option<&'a Value> {
    std::iter::once(req.get(key))
        .chain(["intent", "kwargs"].iter().map(|scope| req.get(*scope).and_then(|s| s.get(key))))
        .flatten()
        .find(|v| !v.is_null())
}

fn request_symbols(req: &Value) -> Vec<String> {
    let raw = lookup(req, "symbols").or_else(|| lookup(req, "symbol"));
    let mut out: Vec<String> = match raw {
        Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str()).map(str::trim).map(String::from).collect(),
        Some(Value::String(s)) => s.split(',').map(str::trim).map(String::from).collect(),
        _ => Vec::new(),
    };
    out.retain(|s| !s.is_empty());
    out.sort();
    out.dedup();
    out
}

fn request_date(req: &Value, key: &str) -> Result<Option<NaiveDate>> {
    lookup(req, key).and_then(|v| v.as_str()).map(parse_date).transpose()
}

#[derive(Clone, Debug)]
pub struct FetchOutcome {
    pub dir: PathBuf,
    pub steps_index: PathBuf,
    pub rows: usize,
    pub excluded_by_asof: usize,
}

impl FetchOutcome {
    pub fn to_json(&self) -> Value {
        json!({
            "fetch_dir": self.dir.display().to_string(),
            "fetch_steps_index": self.steps_index.display().to_string(),
            "rows": self.rows,
            "excluded_by_asof": self.excluded_by_asof,
        })
    }
}

/// Resolve the request against the runspec's snapshot and write the fetch
/// evidence under `jobs/<id>/outputs/fetch/`. Missing bounds fall back to the
/// runspec's segment range; `auto_symbols` takes the runspec universe.
pub fn execute_fetch(job_dir: &Path, data_root: &Path, request: &Value, runspec: &Value) -> Result<FetchOutcome> {
    let dir = fetch_dir(job_dir);
    ensure_dir(&dir)?;
    let snapshot_id = runspec
        .get("data_snapshot_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EamError::InvalidContract("runspec at /data_snapshot_id: required".into()))?;
    let mut symbols = request_symbols(request);
    if symbols.is_empty() {
        symbols = runspec_symbols(runspec);
    }
    let segments = runspec_segments(runspec)?;
    let start = match request_date(request, "start")? {
        Some(d) => d,
        None => segments
            .iter()
            .map(|s| s.start)
            .min()
            .ok_or_else(|| EamError::FetchRequestInvalid("no start date and runspec has no segments".into()))?,
    };
    let end = match request_date(request, "end")? {
        Some(d) => d,
        None => segments
            .iter()
            .map(|s| s.end)
            .max()
            .ok_or_else(|| EamError::FetchRequestInvalid("no end date and runspec has no segments".into()))?,
    };
    let as_of = match lookup(request, "as_of").and_then(|v| v.as_str()) {
        Some(raw) => parse_timestamp(raw)?,
        None => end_of_day(end),
    };

    let result = DataCatalog::new(data_root).query_ohlcv(snapshot_id, &symbols, start, end, &as_of)?;
    let request_path = dir.join(FETCH_REQUEST_FILE);
    let meta_path = dir.join(FETCH_META_FILE);
    let preview_path = dir.join(FETCH_PREVIEW_FILE);
    let steps_index = dir.join(FETCH_STEPS_INDEX_FILE);
    atomic_write_json_pretty(&request_path, request)?;
    atomic_write_text(&preview_path, &bars_to_csv(&result.rows))?;
    atomic_write_json_pretty(
        &meta_path,
        &json!({
            "schema_version": "fetch_result_meta_v1",
            "dataset_id": OHLCV_DATASET_ID,
            "snapshot_id": snapshot_id,
            "symbols": symbols,
            "start": start.to_string(),
            "end": end.to_string(),
            "as_of": format_ts(&as_of),
            "rows": result.rows.len(),
            "excluded_by_asof": result.excluded_by_asof,
        }),
    )?;
    atomic_write_json_pretty(
        &steps_index,
        &json!({
            "schema_version": "fetch_steps_index_v1",
            "steps": [{
                "step_id": OHLCV_DATASET_ID,
                "request_path": request_path.display().to_string(),
                "meta_path": meta_path.display().to_string(),
                "preview_path": preview_path.display().to_string(),
            }],
        }),
    )?;
    tracing::info!(snapshot_id, rows = result.rows.len(), excluded = result.excluded_by_asof, "fetch evidence written");
    Ok(FetchOutcome {
        dir,
        steps_index,
        rows: result.rows.len(),
        excluded_by_asof: result.excluded_by_asof,
    })
}

fn rewrite_prefix(value: &mut Value, from: &str, to: &str) {
    match value {
        Value::String(s) if s.starts_with(from) => {
            *s = format!("{}{}", to, &s[from.len()..]);
        }
        Value::Array(items) => items.iter_mut().for_each(|v| rewrite_prefix(v, from, to)),
        Value::Object(map) => map.values_mut().for_each(|v| rewrite_prefix(v, from, to)),
        _ => {}
    }
}

/// Copy job fetch evidence into `<dossier>/fetch/`, point the steps index at
/// the copies, and register them in the manifest. Returns the added entries.
/// A dossier that already carries `fetch/` is left untouched.
pub fn sync_fetch_to_dossier(job_dir: &Path, dossier_dir: &Path) -> Result<Vec<String>> {
    let src = fetch_dir(job_dir);
    if !src.join(FETCH_STEPS_INDEX_FILE).is_file() {
        return Ok(Vec::new());
    }
    let dst = dossier_dir.join(FETCH_DIR);
    if dst.exists() {
        tracing::debug!(dossier = %dossier_dir.display(), "dossier fetch evidence already sealed");
        return Ok(Vec::new());
    }
    let copied = copy_tree(&src, &dst)?;
    let index_path = dst.join(FETCH_STEPS_INDEX_FILE);
    let mut index = read_json(&index_path)?;
    rewrite_prefix(&mut index, &src.display().to_string(), &dst.display().to_string());
    atomic_write_json_pretty(&index_path, &index)?;

    let mut rels: Vec<String> = copied
        .iter()
        .filter(|p| p.file_name().and_then(|n| n.to_str()) != Some(VALIDATION_ERROR_FILE))
        .map(|p| format!("{}/{}", FETCH_DIR, p.to_string_lossy().replace('\\', "/")))
        .collect();
    rels.sort();
    let added = extend_manifest(dossier_dir, &rels)?;
    tracing::info!(dossier = %dossier_dir.display(), added = added.len(), "fetch evidence synced into dossier");
    Ok(added)
}
