//! Hard red lines for agent outputs. Not schema validation: these reject
//! inline policy params, executable payloads, policy overrides and holdout
//! detail regardless of what the output claims to be.

use eam_core::canonical_json_digest;
use eam_runner::policies::{escape_pointer, INLINE_POLICY_KEYS};
use serde_json::{json, Value};

pub const GUARD_REPORT_FILE: &str = "output_guard_report.json";

const SCRIPT_TOKENS: &[&str] = &["code", "python", "script", "bash", "shell"];
const HOLDOUT_DETAIL_KEYS: &[&str] = &["holdout_curve", "holdout_trades", "holdout_curve.csv", "holdout_trades.csv"];
const POLICY_OVERRIDE_KEYS: &[&str] = &[
    "policy_overrides",
    "policy_override",
    "overrides",
    "execution_policy",
    "cost_policy",
    "asof_latency_policy",
    "risk_policy",
    "gate_suite",
    "budget_policy",
    "policy_bundle",
];
const MAX_DEPTH: usize = 30;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardFinding {
    pub rule_id: &'static str,
    pub path: String,
    pub message: String,
}

impl GuardFinding {
    fn new(rule_id: &'static str, path: &str, message: String) -> Self {
        GuardFinding {
            rule_id,
            path: path.to_string(),
            message,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({"rule_id": self.rule_id, "path": self.path, "message": self.message})
    }
}

/// Token split on non-alphanumerics, so `description` never matches `script`.
fn key_tokens(lower: &str) -> impl Iterator<Item = &str> {
    lower.split(|c: char| !c.is_ascii_alphanumeric()).filter(|t| !t.is_empty())
}

fn non_empty_str(v: &Value) -> Option<&str> {
    v.as_str().filter(|s| !s.trim().is_empty())
}

struct Scan {
    allow_metric_keys: bool,
    findings: Vec<GuardFinding>,
}

impl Scan {
    fn walk(&mut self, value: &Value, path: &str, depth: usize) {
        if depth > MAX_DEPTH {
            return;
        }
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    let child = format!("{}/{}", path, escape_pointer(k));
                    let lower = k.to_ascii_lowercase();
                    if !self.allow_metric_keys && INLINE_POLICY_KEYS.contains(&lower.as_str()) {
                        // the blueprint's `asof_rule: {mode: asof}` is a data requirement
                        if lower == "asof_rule" && non_empty_str(v).is_none() {
                            self.walk(v, &child, depth + 1);
                            continue;
                        }
                        self.findings.push(GuardFinding::new(
                            "no_inline_policy_params",
                            &child,
                            format!("forbidden inline policy param key: {}", k),
                        ));
                    }
                    if key_tokens(&lower).any(|t| SCRIPT_TOKENS.contains(&t)) {
                        self.findings.push(GuardFinding::new(
                            "no_executable_scripts",
                            &child,
                            format!("forbidden script/code key: {}", k),
                        ));
                    }
                    if POLICY_OVERRIDE_KEYS.contains(&lower.as_str()) {
                        self.findings.push(GuardFinding::new(
                            "no_policy_overrides",
                            &child,
                            format!("forbidden policy override key: {}", k),
                        ));
                    }
                    if HOLDOUT_DETAIL_KEYS.contains(&lower.as_str()) {
                        self.findings.push(GuardFinding::new(
                            "no_holdout_details",
                            &child,
                            format!("forbidden holdout detail key: {}", k),
                        ));
                    }
                    if let Some(s) = non_empty_str(v) {
                        let s = s.to_ascii_lowercase();
                        if s.contains("holdout_curve") || s.contains("holdout_trades") {
                            self.findings.push(GuardFinding::new(
                                "no_holdout_details",
                                &child,
                                "holdout detail reference found in string value".into(),
                            ));
                        }
                    }
                    self.walk(v, &child, depth + 1);
                }
            }
            Value::Array(items) => {
                for (i, v) in items.iter().enumerate() {
                    self.walk(v, &format!("{}/{}", path, i), depth + 1);
                }
            }
            _ => {}
        }
    }
}

/// JSON pointers of policy-override keys anywhere in `value`.
pub fn find_policy_override_keys(value: &Value) -> Vec<String> {
    let mut scan = Scan {
        allow_metric_keys: true,
        findings: Vec::new(),
    };
    scan.walk(value, "", 0);
    scan.findings
        .into_iter()
        .filter(|f| f.rule_id == "no_policy_overrides")
        .map(|f| f.path)
        .collect()
}

/// Build an `output_guard_report_v1` for `output`. The report agent may quote
/// metric names that collide with policy keys (`max_drawdown`).
pub fn validate_agent_output(agent_id: &str, output: &Value, prompt_version: &str, output_schema_version: &str) -> Value {
    let mut scan = Scan {
        allow_metric_keys: agent_id == "report_agent_v1",
        findings: Vec::new(),
    };
    scan.walk(output, "", 0);
    let passed = scan.findings.is_empty();
    json!({
        "schema_version": "output_guard_report_v1",
        "agent_id": agent_id,
        "prompt_version": prompt_version,
        "output_schema_version": output_schema_version,
        "guard_status": if passed { "pass" } else { "fail" },
        "passed": passed,
        "finding_count": scan.findings.len(),
        "findings": scan.findings.iter().map(GuardFinding::to_json).collect::<Vec<_>>(),
        "extensions": {"output_sha256_hint": canonical_json_digest(output)},
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(report: &Value) -> Vec<String> {
        report["findings"]
            .as_array()
            .expect("findings")
            .iter()
            .map(|f| f["rule_id"].as_str().expect("rule").to_string())
            .collect()
    }

    #[test]
    fn clean_blueprint_passes() {
        let bp = json!({
            "description": "no scripts here",
            "data_requirements": [{"asof_rule": {"mode": "asof"}}],
            "strategy_spec": {"execution": {"cost_model": {"ref_policy": true}}}
        });
        let report = validate_agent_output("intent_agent_v1", &bp, "v1", "blueprint_v1");
        assert_eq!(report["guard_status"], "pass");
        assert_eq!(report["finding_count"], 0);
        eam_schemas::ensure_valid(&report).expect("report contract");
    }

    #[test]
    fn red_lines_are_reported_with_pointers() {
        let out = json!({
            "commission_bps": 1,
            "python_code": "print(1)",
            "policy_overrides": {},
            "notes": ["see holdout_curve.csv"]
        });
        let report = validate_agent_output("intent_agent_v1", &out, "v1", "blueprint_v1");
        assert_eq!(report["guard_status"], "fail");
        let found = rules(&report);
        assert!(found.contains(&"no_inline_policy_params".to_string()));
        assert!(found.contains(&"no_executable_scripts".to_string()));
        assert!(found.contains(&"no_policy_overrides".to_string()));
        // string scan applies to object values only
        assert!(!found.contains(&"no_holdout_details".to_string()));

        let nested = json!({"evidence": {"file": "holdout_trades.csv"}, "holdout_curve": []});
        let report = validate_agent_output("report_agent_v1", &nested, "v1", "report_summary_v1");
        assert_eq!(report["finding_count"], 2);

        let metrics = json!({"metrics": {"max_drawdown": 0.1}});
        assert_eq!(validate_agent_output("report_agent_v1", &metrics, "v1", "x")["finding_count"], 0);
        assert_eq!(validate_agent_output("improvement_agent_v1", &metrics, "v1", "x")["finding_count"], 1);
    }
}
