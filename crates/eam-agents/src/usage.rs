//! Per-job LLM usage accounting against `llm_budget_policy`.
//!
//! Events live in `<job>/outputs/llm/llm_usage_events.jsonl`; the aggregate
//! report is rebuilt from them after every append.

use anyhow::Result;
use eam_core::{append_jsonl, atomic_write_json_pretty, now_iso, read_json_object, read_jsonl};
use eam_runner::policies::{LlmBudgetParams, ResolvedPolicy};
use eam_schemas::ensure_valid;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const USAGE_EVENTS_FILE: &str = "llm_usage_events.jsonl";
pub const USAGE_REPORT_FILE: &str = "llm_usage_report.json";
pub const BUDGET_STOP_FILE: &str = "budget_stop.json";

#[derive(Clone, Debug)]
pub struct UsagePaths {
    pub usage_dir: PathBuf,
    pub events: PathBuf,
    pub report: PathBuf,
}

impl UsagePaths {
    pub fn for_job(job_dir: &Path) -> Self {
        let usage_dir = job_dir.join("outputs").join("llm");
        UsagePaths {
            events: usage_dir.join(USAGE_EVENTS_FILE),
            report: usage_dir.join(USAGE_REPORT_FILE),
            usage_dir,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BudgetThresholds {
    pub policy_id: String,
    pub params: LlmBudgetParams,
}

impl BudgetThresholds {
    pub fn from_policy(policy: &ResolvedPolicy) -> Result<Self> {
        Ok(BudgetThresholds {
            policy_id: policy.policy_id.clone(),
            params: policy.typed_params()?,
        })
    }

    pub fn to_json(&self) -> Value {
        json!({
            "max_calls_per_job": self.params.max_calls_per_job,
            "max_prompt_chars_per_job": self.params.max_prompt_chars_per_job,
            "max_response_chars_per_job": self.params.max_response_chars_per_job,
            "max_wall_seconds_per_job": self.params.max_wall_seconds_per_job,
            "max_calls_per_agent_run": self.params.max_calls_per_agent_run,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UsageTotals {
    pub calls: u64,
    pub prompt_chars: u64,
    pub response_chars: u64,
    pub wall_seconds: f64,
}

impl UsageTotals {
    pub fn add(&self, other: &UsageTotals) -> UsageTotals {
        UsageTotals {
            calls: self.calls + other.calls,
            prompt_chars: self.prompt_chars + other.prompt_chars,
            response_chars: self.response_chars + other.response_chars,
            wall_seconds: self.wall_seconds + other.wall_seconds,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "calls": self.calls,
            "prompt_chars": self.prompt_chars,
            "response_chars": self.response_chars,
            "wall_seconds": self.wall_seconds,
        })
    }

    fn from_event(ev: &Value) -> UsageTotals {
        let int = |k: &str| ev.pointer(&format!("/delta/{}", k)).and_then(|v| v.as_u64()).unwrap_or(0);
        UsageTotals {
            calls: int("calls"),
            prompt_chars: int("prompt_chars"),
            response_chars: int("response_chars"),
            wall_seconds: ev
                .pointer("/delta/wall_seconds")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0)
                .max(0.0),
        }
    }
}

/// Which ceilings a prospective total would cross. Zero limits are disabled.
pub fn would_exceed(thresholds: &BudgetThresholds, totals: &UsageTotals, agent_run_calls: u64) -> BTreeMap<&'static str, bool> {
    let p = &thresholds.params;
    let over = |limit: u64, value: u64| limit > 0 && value > limit;
    let mut out = BTreeMap::new();
    out.insert("max_calls_per_job", over(p.max_calls_per_job, totals.calls));
    out.insert("max_prompt_chars_per_job", over(p.max_prompt_chars_per_job, totals.prompt_chars));
    out.insert("max_response_chars_per_job", over(p.max_response_chars_per_job, totals.response_chars));
    out.insert(
        "max_wall_seconds_per_job",
        p.max_wall_seconds_per_job > 0.0 && totals.wall_seconds > p.max_wall_seconds_per_job,
    );
    out.insert(
        "max_calls_per_agent_run",
        p.max_calls_per_agent_run.map(|l| over(l, agent_run_calls)).unwrap_or(false),
    );
    out
}

const STOP_PRIORITY: [&str; 5] = [
    "max_calls_per_job",
    "max_prompt_chars_per_job",
    "max_response_chars_per_job",
    "max_wall_seconds_per_job",
    "max_calls_per_agent_run",
];

pub fn stop_reason(exceeded: &BTreeMap<&'static str, bool>) -> Option<String> {
    STOP_PRIORITY
        .iter()
        .find(|k| exceeded.get(*k).copied().unwrap_or(false))
        .map(|k| format!("exceeded_{}", k))
}

pub fn load_usage_events(paths: &UsagePaths) -> Result<Vec<Value>> {
    Ok(read_jsonl(&paths.events)?.into_iter().filter(|v| v.is_object()).collect())
}

pub struct Aggregate {
    pub totals: UsageTotals,
    pub by_agent: BTreeMap<String, UsageTotals>,
    pub stop_reason: Option<String>,
}

pub fn aggregate(events: &[Value]) -> Aggregate {
    let mut agg = Aggregate {
        totals: UsageTotals::default(),
        by_agent: BTreeMap::new(),
        stop_reason: None,
    };
    for ev in events {
        let agent = ev
            .get("agent_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("unknown")
            .to_string();
        let delta = UsageTotals::from_event(ev);
        agg.totals = agg.totals.add(&delta);
        let entry = agg.by_agent.entry(agent).or_default();
        *entry = entry.add(&delta);
        if let Some(r) = ev.get("stop_reason").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
            agg.stop_reason = Some(r.to_string());
        }
    }
    agg
}

pub struct UsageEvent<'a> {
    pub job_id: &'a str,
    pub agent_id: &'a str,
    pub event_type: &'a str,
    pub delta: UsageTotals,
    pub would_exceed: Option<BTreeMap<&'static str, bool>>,
    pub stop_reason: Option<String>,
    pub evidence_refs: Option<Value>,
}

pub fn write_usage_event(paths: &UsagePaths, thresholds: &BudgetThresholds, event: &UsageEvent<'_>) -> Result<()> {
    let mut ev = json!({
        "schema_version": "llm_usage_event_v1",
        "job_id": event.job_id,
        "agent_id": event.agent_id,
        "event_type": event.event_type,
        "recorded_at": now_iso(),
        "delta": event.delta.to_json(),
        "policy_id": thresholds.policy_id,
        "thresholds": thresholds.to_json(),
    });
    if let Some(w) = &event.would_exceed {
        ev["would_exceed"] = json!(w);
    }
    if let Some(r) = &event.stop_reason {
        ev["stop_reason"] = json!(r);
    }
    if let Some(refs) = &event.evidence_refs {
        ev["evidence_refs"] = refs.clone();
    }
    append_jsonl(&paths.events, &ev)
}

fn collect_refs(events: &[Value], key: &str) -> Vec<String> {
    let mut out: Vec<String> = events
        .iter()
        .filter_map(|ev| ev.pointer(&format!("/evidence_refs/{}", key)).and_then(|v| v.as_str()))
        .map(String::from)
        .collect();
    out.sort();
    out.dedup();
    out
}

pub fn build_usage_report(paths: &UsagePaths, job_id: &str, thresholds: &BudgetThresholds) -> Result<Value> {
    let events = load_usage_events(paths)?;
    let agg = aggregate(&events);
    let by_agent: Map<String, Value> = agg.by_agent.iter().map(|(k, t)| (k.clone(), t.to_json())).collect();
    Ok(json!({
        "schema_version": "llm_usage_report_v1",
        "job_id": job_id,
        "generated_at": now_iso(),
        "policy_id": thresholds.policy_id,
        "limits": thresholds.to_json(),
        "totals": agg.totals.to_json(),
        "by_agent": by_agent,
        "stopped": agg.stop_reason.is_some(),
        "stop_reason": agg.stop_reason,
        "evidence_refs": {
            "usage_events_path": paths.events.display().to_string(),
            "llm_calls_paths": collect_refs(&events, "llm_calls_path"),
            "redaction_summary_paths": collect_refs(&events, "redaction_summary_path"),
            "cassette_paths": collect_refs(&events, "cassette_path"),
            "agent_out_dirs": collect_refs(&events, "agent_out_dir"),
        },
    }))
}

pub fn write_usage_report(paths: &UsagePaths, job_id: &str, thresholds: &BudgetThresholds) -> Result<PathBuf> {
    let report = build_usage_report(paths, job_id, thresholds)?;
    ensure_valid(&report)?;
    atomic_write_json_pretty(&paths.report, &report)?;
    Ok(paths.report.clone())
}

/// `(stopped, stop_reason)` from the last written report.
pub fn is_budget_stopped(job_dir: &Path) -> (bool, Option<String>) {
    match read_json_object(&UsagePaths::for_job(job_dir).report) {
        Some(doc) => (
            doc.get("stopped").and_then(|v| v.as_bool()).unwrap_or(false),
            doc.get("stop_reason").and_then(|v| v.as_str()).map(String::from),
        ),
        None => (false, None),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use eam_core::scratch_dir;
    use std::fs;

    pub(crate) fn thresholds(max_calls: u64) -> BudgetThresholds {
        BudgetThresholds {
            policy_id: "llm_budget_policy_v1_test".into(),
            params: LlmBudgetParams {
                max_calls_per_job: max_calls,
                max_prompt_chars_per_job: 0,
                max_response_chars_per_job: 0,
                max_wall_seconds_per_job: 0.0,
                max_calls_per_agent_run: None,
            },
        }
    }

    #[test]
    fn stop_reason_follows_priority() {
        let t = thresholds(1);
        let totals = UsageTotals {
            calls: 2,
            ..Default::default()
        };
        let exceeded = would_exceed(&t, &totals, 2);
        assert_eq!(stop_reason(&exceeded).as_deref(), Some("exceeded_max_calls_per_job"));
        assert_eq!(stop_reason(&would_exceed(&t, &UsageTotals::default(), 0)), None);
    }

    #[test]
    fn report_aggregates_events_by_agent() {
        let root = scratch_dir("eam_usage_test");
        let paths = UsagePaths::for_job(&root);
        let t = thresholds(1);
        let delta = UsageTotals {
            calls: 1,
            prompt_chars: 10,
            response_chars: 5,
            wall_seconds: 0.5,
        };
        for (agent, stop) in [("intent_agent_v1", None), ("strategy_spec_agent_v1", Some("exceeded_max_calls_per_job".to_string()))] {
            write_usage_event(
                &paths,
                &t,
                &UsageEvent {
                    job_id: "job1",
                    agent_id: agent,
                    event_type: if stop.is_some() { "BUDGET_BLOCKED_PRECALL" } else { "CALL_COMPLETED" },
                    delta: if stop.is_some() { UsageTotals::default() } else { delta },
                    would_exceed: None,
                    stop_reason: stop,
                    evidence_refs: None,
                },
            )
            .expect("event");
        }
        write_usage_report(&paths, "job1", &t).expect("report");
        let report = read_json_object(&paths.report).expect("report json");
        assert_eq!(report["totals"]["calls"], 1);
        assert_eq!(report["by_agent"]["intent_agent_v1"]["prompt_chars"], 10);
        assert_eq!(report["stopped"], true);
        assert_eq!(is_budget_stopped(&root), (true, Some("exceeded_max_calls_per_job".into())));
        let _ = fs::remove_dir_all(root);
    }
}
