//! Append-only run/job indexes under `registry/`. Rows are keyed by id and
//! never rewritten; the scan is best-effort over whatever is on disk.

use anyhow::Result;
use eam_core::{append_jsonl, is_safe_id, now_iso, read_json_object, EamRoots};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::registry::{RegistryPaths, CARD_FILE};

pub const RUNS_INDEX_FILE: &str = "runs_index.jsonl";
pub const JOBS_INDEX_FILE: &str = "jobs_index.jsonl";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexSummary {
    pub indexed: usize,
    pub skipped_existing: usize,
    pub total_seen: usize,
    pub index_path: PathBuf,
}

impl IndexSummary {
    pub fn to_json(&self) -> Value {
        json!({
            "indexed": self.indexed,
            "skipped_existing": self.skipped_existing,
            "total_seen": self.total_seen,
            "index_path": self.index_path.display().to_string(),
        })
    }
}

/// Lenient line reader: unparsable lines are ignored rather than fatal.
fn lenient_jsonl(path: &Path) -> Vec<Value> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };
    BufReader::new(file)
        .lines()
        .map_while(|l| l.ok())
        .filter_map(|l| serde_json::from_str::<Value>(l.trim()).ok())
        .filter(|v| v.is_object())
        .collect()
}

fn existing_ids(path: &Path, key: &str) -> BTreeSet<String> {
    lenient_jsonl(path)
        .iter()
        .filter_map(|v| v.get(key).and_then(|s| s.as_str()).map(String::from))
        .collect()
}

fn safe_subdirs(dir: &Path) -> Vec<String> {
    let mut out: Vec<String> = fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter_map(|e| e.file_name().to_str().map(String::from))
                .filter(|name| is_safe_id(name))
                .collect()
        })
        .unwrap_or_default();
    out.sort();
    out
}

fn non_empty(v: Option<&Value>) -> Value {
    match v.and_then(|s| s.as_str()).map(str::trim) {
        Some(s) if !s.is_empty() => json!(s),
        _ => Value::Null,
    }
}

fn cards_by_run(registry_root: &Path) -> BTreeMap<String, Vec<String>> {
    let paths = RegistryPaths::new(registry_root);
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for card_id in safe_subdirs(&paths.cards_dir()) {
        if let Some(card) = read_json_object(&paths.card_dir(&card_id).join(CARD_FILE)) {
            if let Some(run_id) = card.get("primary_run_id").and_then(|v| v.as_str()).filter(|r| is_safe_id(r)) {
                out.entry(run_id.to_string()).or_default().push(card_id);
            }
        }
    }
    out
}

pub fn build_runs_index(roots: &EamRoots) -> Result<IndexSummary> {
    let index_path = roots.registry_root.join(RUNS_INDEX_FILE);
    let mut existing = existing_ids(&index_path, "run_id");
    let cards = cards_by_run(&roots.registry_root);
    let mut summary = IndexSummary {
        index_path: index_path.clone(),
        ..Default::default()
    };
    let dossiers = roots.dossiers_dir();
    for run_id in safe_subdirs(&dossiers) {
        summary.total_seen += 1;
        if existing.contains(&run_id) {
            summary.skipped_existing += 1;
            continue;
        }
        let dir = dossiers.join(&run_id);
        let manifest = read_json_object(&dir.join("dossier_manifest.json")).unwrap_or_default();
        let config = read_json_object(&dir.join("config_snapshot.json")).unwrap_or_default();
        let gates = read_json_object(&dir.join("gate_results.json"));
        let mut policy_bundle_id = non_empty(config.get("policy_bundle_id"));
        if policy_bundle_id.is_null() {
            policy_bundle_id = non_empty(config.pointer("/runspec/policy_bundle_id"));
        }
        let row = json!({
            "index_version": "runs_index_v1",
            "indexed_at": now_iso(),
            "run_id": run_id,
            "snapshot_id": non_empty(manifest.get("data_snapshot_id")),
            "policy_bundle_id": policy_bundle_id,
            "overall_pass": gates.as_ref().and_then(|g| g.get("overall_pass")).and_then(|v| v.as_bool()),
            "dossier_path": format!("dossiers/{}", run_id),
            "card_ids": cards.get(&run_id).cloned().unwrap_or_default(),
        });
        append_jsonl(&index_path, &row)?;
        existing.insert(run_id);
        summary.indexed += 1;
    }
    Ok(summary)
}

fn job_last_state(events: &[Value]) -> Value {
    let last = match events.last() {
        Some(l) => l,
        None => return json!({"last_event_type": null, "last_recorded_at": null, "waiting_step": null}),
    };
    let event_type = non_empty(last.get("event_type"));
    let waiting_step = if event_type == json!("WAITING_APPROVAL") {
        non_empty(last.pointer("/outputs/step"))
    } else {
        Value::Null
    };
    json!({
        "last_event_type": event_type,
        "last_recorded_at": non_empty(last.get("recorded_at").or_else(|| last.pointer("/extensions/recorded_at"))),
        "waiting_step": waiting_step,
    })
}

fn llm_evidence_summary(outputs: &Value) -> Value {
    let paths: BTreeSet<&str> = outputs
        .as_object()
        .map(|m| {
            m.iter()
                .filter(|(k, _)| k.ends_with("_agent_run_path"))
                .filter_map(|(_, v)| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .collect()
        })
        .unwrap_or_default();
    json!({"agent_run_paths": paths, "agent_run_count": paths.len()})
}

pub fn build_jobs_index(roots: &EamRoots) -> Result<IndexSummary> {
    let index_path = roots.registry_root.join(JOBS_INDEX_FILE);
    let mut existing = existing_ids(&index_path, "job_id");
    let mut summary = IndexSummary {
        index_path: index_path.clone(),
        ..Default::default()
    };
    for job_id in safe_subdirs(&roots.job_root) {
        summary.total_seen += 1;
        if existing.contains(&job_id) {
            summary.skipped_existing += 1;
            continue;
        }
        let dir = roots.job_dir(&job_id);
        let spec = read_json_object(&dir.join("job_spec.json")).unwrap_or_default();
        let outputs = read_json_object(&dir.join("outputs/outputs.json")).unwrap_or_default();
        let events = lenient_jsonl(&dir.join("events.jsonl"));
        let mut snapshot_id = non_empty(spec.get("snapshot_id"));
        if snapshot_id.is_null() {
            snapshot_id = non_empty(outputs.get("snapshot_id"));
        }
        let mut policy_bundle_id = non_empty(spec.get("policy_bundle_id"));
        if policy_bundle_id.is_null() {
            policy_bundle_id = non_empty(outputs.get("policy_bundle_id"));
        }
        let row = json!({
            "index_version": "jobs_index_v1",
            "indexed_at": now_iso(),
            "job_id": job_id,
            "job_schema_version": non_empty(spec.get("schema_version")),
            "snapshot_id": snapshot_id,
            "policy_bundle_id": policy_bundle_id,
            "state": job_last_state(&events),
            "llm_evidence": llm_evidence_summary(&outputs),
            "job_dir": format!("jobs/{}", job_id),
        });
        append_jsonl(&index_path, &row)?;
        existing.insert(job_id);
        summary.indexed += 1;
    }
    Ok(summary)
}

pub fn build_all_indexes(roots: &EamRoots) -> Result<Value> {
    let runs = build_runs_index(roots)?;
    let jobs = build_jobs_index(roots)?;
    tracing::info!(runs = runs.indexed, jobs = jobs.indexed, "indexes updated");
    Ok(json!({"runs": runs.to_json(), "jobs": jobs.to_json()}))
}

/// Latest-first rows of the runs index.
pub fn list_runs_from_index(registry_root: &Path, limit: usize) -> Vec<Value> {
    let mut rows = lenient_jsonl(&registry_root.join(RUNS_INDEX_FILE));
    rows.reverse();
    rows.truncate(limit);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use eam_core::{ensure_dir, scratch_dir};

    #[test]
    fn indexes_are_append_only_and_idempotent() {
        let root = scratch_dir("eam_indexer_test");
        let roots = EamRoots::new(&root.join("data"), &root.join("artifacts"), &root);
        let run_dir = roots.dossiers_dir().join("run_a");
        ensure_dir(&run_dir).expect("run dir");
        fs::write(
            run_dir.join("dossier_manifest.json"),
            r#"{"run_id":"run_a","data_snapshot_id":"snap1"}"#,
        )
        .expect("manifest");
        ensure_dir(&roots.dossiers_dir().join("bad.id")).expect("unsafe dir");
        let job_dir = roots.job_dir("job_a");
        ensure_dir(&job_dir).expect("job dir");
        fs::write(
            job_dir.join("events.jsonl"),
            "{\"event_type\":\"WAITING_APPROVAL\",\"outputs\":{\"step\":\"blueprint\"}}\n{torn",
        )
        .expect("events");

        let first = build_all_indexes(&roots).expect("index");
        assert_eq!(first["runs"]["indexed"], 1);
        assert_eq!(first["jobs"]["indexed"], 1);
        let before = fs::read(roots.registry_root.join(RUNS_INDEX_FILE)).expect("runs");

        let second = build_all_indexes(&roots).expect("index");
        assert_eq!(second["runs"]["indexed"], 0);
        assert_eq!(second["runs"]["skipped_existing"], 1);
        assert_eq!(second["jobs"]["indexed"], 0);
        assert_eq!(fs::read(roots.registry_root.join(RUNS_INDEX_FILE)).expect("runs"), before);

        let jobs = lenient_jsonl(&roots.registry_root.join(JOBS_INDEX_FILE));
        assert_eq!(jobs[0]["state"]["waiting_step"], "blueprint");
        let runs = list_runs_from_index(&roots.registry_root, 10);
        assert_eq!(runs[0]["snapshot_id"], "snap1");
        let _ = fs::remove_dir_all(root);
    }
}
