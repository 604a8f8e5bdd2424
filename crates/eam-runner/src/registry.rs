//! Experience registry: an append-only trial log plus experience cards whose
//! status is the fold of their own event log.

use anyhow::{anyhow, Result};
use eam_core::{append_jsonl, atomic_write_json_pretty, ensure_dir, is_safe_id, now_iso, read_json, read_json_object, read_jsonl, sha256_file, EamError};
use eam_schemas::{ensure_valid, validate_file};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::catalog::runspec_symbols;
use crate::dossier::{ExistsBehavior, MANIFEST_FILE};
use crate::gates::GATE_RESULTS_FILE;

pub const TRIAL_LOG_FILE: &str = "trial_log.jsonl";
pub const CARD_FILE: &str = "card_v1.json";
pub const CARD_EVENTS_FILE: &str = "events.jsonl";

pub const ALLOWED_STATUSES: [&str; 4] = ["draft", "challenger", "champion", "retired"];

const KEY_ARTIFACTS: &[&str] = &[
    "dossier_manifest.json",
    "config_snapshot.json",
    "metrics.json",
    "curve.csv",
    "trades.csv",
    "gate_results.json",
];

fn next_status(current: &str) -> Option<&'static str> {
    match current {
        "draft" => Some("challenger"),
        "challenger" => Some("champion"),
        "champion" => Some("retired"),
        _ => None,
    }
}

pub struct RegistryPaths {
    pub root: PathBuf,
}

impl RegistryPaths {
    pub fn new(root: &Path) -> Self {
        RegistryPaths {
            root: root.to_path_buf(),
        }
    }

    pub fn trial_log(&self) -> PathBuf {
        self.root.join(TRIAL_LOG_FILE)
    }

    pub fn cards_dir(&self) -> PathBuf {
        self.root.join("cards")
    }

    pub fn card_dir(&self, card_id: &str) -> PathBuf {
        self.cards_dir().join(card_id)
    }
}

fn invalid(msg: impl Into<String>) -> anyhow::Error {
    EamError::InvalidContract(msg.into()).into()
}

fn require_file(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(invalid(format!("missing required file: {}", path.display())))
    }
}

fn str_at<'a>(v: &'a Value, ptr: &str) -> &'a str {
    v.pointer(ptr).and_then(|s| s.as_str()).map(str::trim).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// trial log
// ---------------------------------------------------------------------------

pub fn list_trials(registry_root: &Path) -> Result<Vec<Value>> {
    read_jsonl(&RegistryPaths::new(registry_root).trial_log())
}

pub fn get_trial(registry_root: &Path, run_id: &str) -> Result<Option<Value>> {
    Ok(list_trials(registry_root)?
        .into_iter()
        .find(|ev| ev.get("run_id").and_then(|v| v.as_str()) == Some(run_id)))
}

/// Record a gated dossier in `trial_log.jsonl`. One event per `run_id`.
pub fn record_trial(dossier_dir: &Path, registry_root: &Path, if_exists: ExistsBehavior) -> Result<Value> {
    let manifest_path = dossier_dir.join(MANIFEST_FILE);
    let config_path = dossier_dir.join("config_snapshot.json");
    let gate_results_path = dossier_dir.join(GATE_RESULTS_FILE);
    for p in [&manifest_path, &config_path, &gate_results_path] {
        require_file(p)?;
    }
    let manifest = read_json_object(&manifest_path).ok_or_else(|| invalid("dossier_manifest.json must be a JSON object"))?;
    let config = read_json_object(&config_path).ok_or_else(|| invalid("config_snapshot.json must be a JSON object"))?;

    let validation = validate_file(&gate_results_path, None);
    if !validation.is_ok() {
        return Err(invalid(format!("gate_results invalid: {}", validation.message)));
    }
    let gate_results = read_json(&gate_results_path)?;

    let run_id = str_at(&manifest, "/run_id");
    if run_id.is_empty() {
        return Err(invalid("missing run_id in dossier_manifest.json"));
    }
    if let Some(existing) = get_trial(registry_root, run_id)? {
        return match if_exists {
            ExistsBehavior::Noop => Ok(existing),
            ExistsBehavior::Reject => Err(EamError::WriteConflict(format!("trial already recorded: {}", run_id)).into()),
        };
    }

    let runspec = match config.get("runspec") {
        Some(r) if r.is_object() => r,
        _ => return Err(invalid("config_snapshot.runspec missing or not an object")),
    };
    let policy_bundle_id = str_at(&manifest, "/policy_bundle_id");
    let snapshot_id = str_at(&manifest, "/data_snapshot_id");
    let adapter_id = str_at(runspec, "/adapter/adapter_id");
    if policy_bundle_id.is_empty() || snapshot_id.is_empty() || adapter_id.is_empty() {
        return Err(invalid("missing policy_bundle_id/data_snapshot_id/adapter_id evidence"));
    }

    let mut event = json!({
        "schema_version": "trial_event_v1",
        "run_id": run_id,
        "recorded_at": now_iso(),
        "dossier_path": dossier_dir.display().to_string(),
        "gate_results_path": gate_results_path.display().to_string(),
        "overall_pass": gate_results.get("overall_pass").and_then(|v| v.as_bool()).unwrap_or(false),
        "policy_bundle_id": policy_bundle_id,
        "snapshot_id": snapshot_id,
        "adapter_id": adapter_id,
    });
    let blueprint_id = str_at(runspec, "/blueprint_ref/blueprint_id");
    if !blueprint_id.is_empty() {
        event["blueprint_id"] = json!(blueprint_id);
    }
    let suite_id = str_at(&gate_results, "/gate_suite_id");
    if !suite_id.is_empty() {
        event["gate_suite_id"] = json!(suite_id);
    }
    ensure_valid(&event).map_err(|e| invalid(format!("trial_event invalid: {}", e)))?;

    let paths = RegistryPaths::new(registry_root);
    append_jsonl(&paths.trial_log(), &event)?;
    tracing::info!(run_id, "trial recorded");
    Ok(event)
}

// ---------------------------------------------------------------------------
// cards
// ---------------------------------------------------------------------------

/// Base status folded over PROMOTED events; anything unknown collapses to draft.
pub fn effective_status(base: &Value, events: &[Value]) -> String {
    let mut status = base.get("status").and_then(|v| v.as_str()).unwrap_or("draft").to_string();
    for ev in events {
        if ev.get("event_type").and_then(|v| v.as_str()) == Some("PROMOTED") {
            if let Some(ns) = ev.get("new_status").and_then(|v| v.as_str()) {
                if ALLOWED_STATUSES.contains(&ns) {
                    status = ns.to_string();
                }
            }
        }
    }
    if ALLOWED_STATUSES.contains(&status.as_str()) {
        status
    } else {
        "draft".to_string()
    }
}

fn load_card(paths: &RegistryPaths, card_id: &str) -> Result<(Value, Vec<Value>)> {
    if !is_safe_id(card_id) {
        return Err(EamError::Usage(format!("invalid card_id: '{}'", card_id)).into());
    }
    let dir = paths.card_dir(card_id);
    let base = match read_json_object(&dir.join(CARD_FILE)) {
        Some(b) => b,
        None => return Err(EamError::NotFound(format!("card not found: {}", card_id)).into()),
    };
    let events = read_jsonl(&dir.join(CARD_EVENTS_FILE))?;
    Ok((base, events))
}

fn with_status(mut base: Value, events: &[Value]) -> Value {
    base["effective_status"] = json!(effective_status(&base, events));
    base
}

/// Create `card_<run_id>` from a recorded trial that passed its gates.
pub fn create_card_from_run(registry_root: &Path, run_id: &str, title: &str, if_exists: ExistsBehavior) -> Result<Value> {
    let run_id = run_id.trim();
    let title = title.trim();
    if !is_safe_id(run_id) {
        return Err(EamError::Usage(format!("invalid run_id: '{}'", run_id)).into());
    }
    if title.is_empty() {
        return Err(EamError::Usage("title must be non-empty".into()).into());
    }
    let trial = get_trial(registry_root, run_id)?
        .ok_or_else(|| invalid("trial not found in trial_log.jsonl; run record-trial first"))?;
    if trial.get("overall_pass").and_then(|v| v.as_bool()) != Some(true) {
        return Err(invalid("cannot create card: overall_pass is false (Gate PASS required)"));
    }

    let paths = RegistryPaths::new(registry_root);
    let card_id = format!("card_{}", run_id);
    let card_dir = paths.card_dir(&card_id);
    let card_path = card_dir.join(CARD_FILE);
    if card_path.exists() {
        return match if_exists {
            ExistsBehavior::Noop => {
                let (base, events) = load_card(&paths, &card_id)?;
                Ok(with_status(base, &events))
            }
            ExistsBehavior::Reject => Err(EamError::WriteConflict(format!("card already exists: {}", card_id)).into()),
        };
    }

    let dossier_path = str_at(&trial, "/dossier_path");
    let gate_results_path = str_at(&trial, "/gate_results_path");
    let symbols = read_json_object(&Path::new(dossier_path).join("config_snapshot.json"))
        .and_then(|c| c.get("runspec").map(runspec_symbols))
        .unwrap_or_default();
    let mut gate_summary = json!({"overall_pass": true});
    let suite_id = str_at(&trial, "/gate_suite_id");
    if !suite_id.is_empty() {
        gate_summary["gate_suite_id"] = json!(suite_id);
    }
    let card = json!({
        "schema_version": "experience_card_v1",
        "card_id": card_id,
        "created_at": now_iso(),
        "title": title,
        "status": "draft",
        "primary_run_id": run_id,
        "run_ids": [run_id],
        "policy_bundle_id": str_at(&trial, "/policy_bundle_id"),
        "data_snapshot_id": str_at(&trial, "/snapshot_id"),
        "gate_summary": gate_summary,
        "evidence": {
            "dossier_path": dossier_path,
            "gate_results_path": gate_results_path,
            "key_artifacts": KEY_ARTIFACTS,
        },
        "applicability": {"freq": "ohlcv_1d", "symbols": symbols},
    });
    ensure_valid(&card).map_err(|e| invalid(format!("experience_card invalid: {}", e)))?;

    ensure_dir(&card_dir)?;
    atomic_write_json_pretty(&card_path, &card)?;
    append_jsonl(
        &card_dir.join(CARD_EVENTS_FILE),
        &json!({
            "event_version": 1,
            "event_type": "CREATED",
            "recorded_at": now_iso(),
            "card_id": card_id,
            "run_id": run_id,
            "notes": "card created from Gate PASS trial",
        }),
    )?;
    tracing::info!(card_id = %card_id, "card created");
    Ok(with_status(card, &[]))
}

/// Append a PROMOTED event. Without `allow_skip` only the next linear status
/// is accepted and `retired` is terminal.
pub fn promote_card(registry_root: &Path, card_id: &str, new_status: &str, allow_skip: bool) -> Result<Value> {
    let new_status = new_status.trim();
    if !ALLOWED_STATUSES.contains(&new_status) {
        return Err(EamError::Usage(format!("new_status must be one of {:?}", ALLOWED_STATUSES)).into());
    }
    let paths = RegistryPaths::new(registry_root);
    let (base, events) = load_card(&paths, card_id)?;
    let current = effective_status(&base, &events);
    if !allow_skip {
        let expected = next_status(&current)
            .ok_or_else(|| invalid(format!("cannot promote from terminal status: {}", current)))?;
        if new_status != expected {
            return Err(invalid(format!(
                "invalid transition: {} -> {} (expected {})",
                current, new_status, expected
            )));
        }
    }
    let event = json!({
        "event_version": 1,
        "event_type": "PROMOTED",
        "recorded_at": now_iso(),
        "card_id": card_id,
        "old_status": current,
        "new_status": new_status,
    });
    append_jsonl(&paths.card_dir(card_id).join(CARD_EVENTS_FILE), &event)?;
    Ok(event)
}

pub fn list_cards(registry_root: &Path) -> Result<Vec<Value>> {
    let paths = RegistryPaths::new(registry_root);
    let mut out = Vec::new();
    for card_id in card_ids(&paths) {
        if let Ok((base, events)) = load_card(&paths, &card_id) {
            out.push(json!({
                "card_id": base.get("card_id").cloned().unwrap_or_else(|| json!(card_id)),
                "status": effective_status(&base, &events),
                "title": base.get("title"),
                "primary_run_id": base.get("primary_run_id"),
            }));
        }
    }
    Ok(out)
}

pub fn show_card(registry_root: &Path, card_id: &str) -> Result<Value> {
    let paths = RegistryPaths::new(registry_root);
    let (base, events) = load_card(&paths, card_id)?;
    let mut out = with_status(base, &events);
    out["events"] = Value::Array(events);
    Ok(out)
}

/// sha256 of the card's files, for immutability checks.
pub fn card_file_hashes(registry_root: &Path, card_id: &str) -> Result<BTreeMap<String, String>> {
    let dir = RegistryPaths::new(registry_root).card_dir(card_id);
    let mut out = BTreeMap::new();
    for name in [CARD_FILE, CARD_EVENTS_FILE] {
        let p = dir.join(name);
        if p.is_file() {
            out.insert(name.to_string(), sha256_file(&p)?);
        }
    }
    Ok(out)
}

fn card_ids(paths: &RegistryPaths) -> Vec<String> {
    let mut ids: Vec<String> = fs::read_dir(paths.cards_dir())
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter_map(|e| e.file_name().to_str().map(String::from))
                .filter(|id| is_safe_id(id))
                .collect()
        })
        .unwrap_or_default();
    ids.sort();
    ids
}

// ---------------------------------------------------------------------------
// retrieval
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct ExperienceQuery {
    pub query: String,
    pub symbols: Vec<String>,
    pub frequency: Option<String>,
    pub tags: Vec<String>,
    pub top_k: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct RankingReason {
    pub reason: &'static str,
    pub field: &'static str,
    pub token: Option<String>,
    pub weight: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExperienceMatch {
    pub card_id: String,
    pub run_id: String,
    pub score: f64,
    pub effective_status: String,
    pub title: String,
    pub policy_bundle_id: Option<String>,
    pub symbols: Vec<String>,
    pub ranking_explain: Vec<RankingReason>,
}

/// Lowercased `[A-Za-z0-9_]+` tokens, first occurrence order.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    text.to_lowercase()
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_string()))
        .map(String::from)
        .collect()
}

/// Deterministic token-overlap search over cards. No embeddings, no network.
pub fn search_experience(registry_root: &Path, q: &ExperienceQuery) -> Result<Vec<ExperienceMatch>> {
    let paths = RegistryPaths::new(registry_root);
    let top_k = q.top_k.clamp(1, 50);
    let mut tokens = tokenize(&q.query);
    for t in q.tags.iter().flat_map(|t| tokenize(t)) {
        if !tokens.contains(&t) {
            tokens.push(t);
        }
    }
    let wanted: BTreeSet<String> = q
        .symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    let wanted_freq = q.frequency.as_deref().map(str::trim).filter(|s| !s.is_empty());

    let mut matches = Vec::new();
    for card_id in card_ids(&paths) {
        let (base, events) = match load_card(&paths, &card_id) {
            Ok(c) => c,
            Err(_) => continue,
        };
        let status = effective_status(&base, &events);
        let title = str_at(&base, "/title").to_string();
        let freq = str_at(&base, "/applicability/freq");
        let mut symbols: Vec<String> = base
            .pointer("/applicability/symbols")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
            .unwrap_or_default();
        symbols.sort();
        symbols.dedup();
        let sym_set: BTreeSet<String> = symbols.iter().map(|s| s.to_uppercase()).collect();
        let title_l = title.to_lowercase();
        let tags_l = base
            .get("tags")
            .or_else(|| base.pointer("/extensions/tags"))
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|t| t.as_str()).collect::<Vec<_>>().join(" ").to_lowercase())
            .unwrap_or_default();
        let notes_l = events
            .iter()
            .filter_map(|e| e.get("notes").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        let mut explain = Vec::new();
        let mut add = |reason, field, token: Option<String>, weight| {
            explain.push(RankingReason { reason, field, token, weight });
        };
        for tok in &tokens {
            if title_l.contains(tok.as_str()) {
                add("token_in_title", "title", Some(tok.clone()), 5.0);
            }
            if tags_l.contains(tok.as_str()) {
                add("token_in_tags", "tags", Some(tok.clone()), 3.0);
            }
            if notes_l.contains(tok.as_str()) {
                add("token_in_notes", "notes", Some(tok.clone()), 2.0);
            }
            if sym_set.contains(&tok.to_uppercase()) {
                add("token_in_symbols", "symbols", Some(tok.to_uppercase()), 4.0);
            }
        }
        let common: Vec<&String> = wanted.intersection(&sym_set).collect();
        if !common.is_empty() {
            let joined = common.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",");
            add("symbols_intersection", "symbols", Some(joined), 6.0);
        }
        if let Some(f) = wanted_freq {
            if f == freq {
                add("frequency_match", "frequency", Some(f.to_string()), 2.0);
            }
        }
        match status.as_str() {
            "champion" => add("status_bonus", "effective_status", Some(status.clone()), 0.2),
            "challenger" => add("status_bonus", "effective_status", Some(status.clone()), 0.1),
            _ => {}
        }
        let score: f64 = explain.iter().map(|r| r.weight).sum();
        let browsing = tokens.is_empty() && wanted.is_empty() && wanted_freq.is_none();
        if browsing {
            explain.push(RankingReason { reason: "empty_query", field: "query", token: None, weight: 0.0 });
        } else if score <= 0.0 || explain.iter().all(|r| r.reason == "status_bonus") {
            continue;
        }
        explain.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.field.cmp(b.field))
                .then_with(|| a.token.cmp(&b.token))
        });
        let policy_bundle_id = Some(str_at(&base, "/policy_bundle_id").to_string()).filter(|s| !s.is_empty());
        matches.push(ExperienceMatch {
            card_id: base.get("card_id").and_then(|v| v.as_str()).unwrap_or(&card_id).to_string(),
            run_id: str_at(&base, "/primary_run_id").to_string(),
            score,
            effective_status: status,
            title,
            policy_bundle_id,
            symbols,
            ranking_explain: explain,
        });
    }
    matches.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.card_id.cmp(&b.card_id)));
    matches.truncate(top_k);
    Ok(matches)
}

/// `experience_pack.json` payload for the intent stage.
pub fn experience_pack(registry_root: &Path, q: &ExperienceQuery) -> Result<Value> {
    let matches = search_experience(registry_root, q)?;
    Ok(json!({
        "pack_version": "experience_pack_v1",
        "query": {
            "query": q.query,
            "symbols": q.symbols,
            "frequency": q.frequency,
            "tags": q.tags,
            "top_k": q.top_k.clamp(1, 50),
        },
        "matches": serde_json::to_value(&matches).map_err(|e| anyhow!("serialize matches: {}", e))?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::tests::bundle_path;
    use crate::gates::{run_gates, GateRunInput};
    use crate::runner::tests::demo_run;
    use eam_core::scratch_dir;

    /// Demo dossier with gates applied, recorded in the registry.
    fn recorded(root: &Path) -> (String, PathBuf) {
        let (_, outcome) = demo_run(root);
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
        (outcome.run_id, registry)
    }

    #[test]
    fn trial_record_is_deduplicated_by_run_id() {
        let root = scratch_dir("eam_registry_trial_test");
        let (run_id, registry) = recorded(&root);
        let dossier = root.join("artifacts/dossiers").join(&run_id);
        let before = fs::read(registry.join(TRIAL_LOG_FILE)).expect("log");
        let again = record_trial(&dossier, &registry, ExistsBehavior::Noop).expect("noop");
        assert_eq!(again["run_id"], run_id.as_str());
        assert_eq!(fs::read(registry.join(TRIAL_LOG_FILE)).expect("log"), before);
        let err = record_trial(&dossier, &registry, ExistsBehavior::Reject).expect_err("dup");
        assert!(err.to_string().contains("already recorded"), "unexpected: {}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn card_lifecycle_is_event_sourced() {
        let root = scratch_dir("eam_registry_card_test");
        let (run_id, registry) = recorded(&root);
        let card = create_card_from_run(&registry, &run_id, "Buy and hold demo", ExistsBehavior::Reject).expect("card");
        let card_id = card["card_id"].as_str().expect("id").to_string();
        assert_eq!(card["effective_status"], "draft");
        let hashes = card_file_hashes(&registry, &card_id).expect("hashes");

        let err = promote_card(&registry, &card_id, "champion", false).expect_err("skip");
        assert!(err.to_string().contains("invalid transition"), "unexpected: {}", err);
        promote_card(&registry, &card_id, "challenger", false).expect("challenger");
        promote_card(&registry, &card_id, "champion", false).expect("champion");
        let shown = show_card(&registry, &card_id).expect("show");
        assert_eq!(shown["effective_status"], "champion");
        assert_eq!(shown["status"], "draft");
        assert_eq!(shown["events"].as_array().map(|a| a.len()), Some(3));
        assert_eq!(
            card_file_hashes(&registry, &card_id).expect("hashes")[CARD_FILE],
            hashes[CARD_FILE]
        );

        promote_card(&registry, &card_id, "retired", false).expect("retired");
        let err = promote_card(&registry, &card_id, "draft", false).expect_err("terminal");
        assert!(err.to_string().contains("terminal"), "unexpected: {}", err);
        promote_card(&registry, &card_id, "draft", true).expect("allow skip");
        assert_eq!(list_cards(&registry).expect("list")[0]["status"], "draft");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failing_trial_cannot_become_a_card() {
        let root = scratch_dir("eam_registry_gate_fail_test");
        let registry = root.join("registry");
        append_jsonl(
            &registry.join(TRIAL_LOG_FILE),
            &json!({"schema_version": "trial_event_v1", "run_id": "r1", "overall_pass": false}),
        )
        .expect("seed");
        let err = create_card_from_run(&registry, "r1", "nope", ExistsBehavior::Reject).expect_err("gate");
        assert!(err.to_string().contains("Gate PASS required"), "unexpected: {}", err);
        assert!(!registry.join("cards/card_r1").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn search_ranks_by_token_overlap() {
        let root = scratch_dir("eam_registry_search_test");
        let (run_id, registry) = recorded(&root);
        create_card_from_run(&registry, &run_id, "Buy and hold demo", ExistsBehavior::Reject).expect("card");
        let hits = search_experience(
            &registry,
            &ExperienceQuery { query: "hold momentum".into(), top_k: 5, ..Default::default() },
        )
        .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].ranking_explain[0].reason, "token_in_title");
        let none = search_experience(
            &registry,
            &ExperienceQuery { query: "unrelated".into(), top_k: 5, ..Default::default() },
        )
        .expect("search");
        assert!(none.is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn effective_status_ignores_unknown_values() {
        let base = json!({"status": "draft"});
        let events = vec![
            json!({"event_type": "PROMOTED", "new_status": "challenger"}),
            json!({"event_type": "PROMOTED", "new_status": "legendary"}),
        ];
        assert_eq!(effective_status(&base, &events), "challenger");
        assert_eq!(effective_status(&json!({"status": "weird"}), &[]), "draft");
    }
}
