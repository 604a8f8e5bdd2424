//! Agent catalog: ids, output bundles and the deterministic producers the
//! `mock` provider answers with.
//!
//! A producer maps an agent input to a JSON bundle whose top-level keys are
//! the agent's outputs. The harness writes the bundle the same way whether it
//! came from a producer, the real provider or a cassette.

use anyhow::{anyhow, Result};
use chrono::Duration;
use eam_core::{canonical_json_digest, short_digest, EamError, EamRoots};
use eam_runner::backtest::{BUY_AND_HOLD_STRATEGY_ID, VECTORBT_SIGNAL_V1};
use eam_runner::dsl::SignalProgram;
use eam_runner::lake::{parse_date, OHLCV_DATASET_ID};
use eam_runner::policies::load_policy_bundle;
use eam_schemas::{ensure_valid, validate_payload};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const AGENT_VERSION: &str = "1.0.0";
pub const DEFAULT_MAX_PROPOSALS: usize = 3;

const TRACE_SAMPLE_ROWS: u64 = 20;
const TRACE_SAMPLE_SYMBOLS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    Json,
    Text,
}

/// One output of an agent bundle.
#[derive(Clone, Copy, Debug)]
pub struct OutputSpec {
    pub key: &'static str,
    pub file: &'static str,
    pub kind: OutputKind,
    /// Contract-validated before it is written.
    pub contract: bool,
}

const fn json_out(key: &'static str, file: &'static str, contract: bool) -> OutputSpec {
    OutputSpec {
        key,
        file,
        kind: OutputKind::Json,
        contract,
    }
}

const fn text_out(key: &'static str, file: &'static str) -> OutputSpec {
    OutputSpec {
        key,
        file,
        kind: OutputKind::Text,
        contract: false,
    }
}

const INTENT_OUTPUTS: &[OutputSpec] = &[json_out("blueprint_draft", "blueprint_draft.json", true)];
const STRATEGY_SPEC_OUTPUTS: &[OutputSpec] = &[
    json_out("blueprint_final", "blueprint_final.json", true),
    json_out("signal_dsl", "signal_dsl.json", true),
    json_out("variable_dictionary", "variable_dictionary.json", true),
    json_out("calc_trace_plan", "calc_trace_plan.json", true),
];
const SPEC_QA_OUTPUTS: &[OutputSpec] = &[
    json_out("spec_qa_report", "spec_qa_report.json", false),
    text_out("spec_qa_report_md", "spec_qa_report.md"),
];
const BACKTEST_OUTPUTS: &[OutputSpec] = &[json_out("backtest_plan", "backtest_plan.json", false)];
const DEMO_OUTPUTS: &[OutputSpec] = &[json_out("demo_plan", "demo_plan.json", false)];
const REPORT_OUTPUTS: &[OutputSpec] = &[
    text_out("report_md", "report_agent.md"),
    json_out("report_summary", "report_summary.json", false),
];
const IMPROVEMENT_OUTPUTS: &[OutputSpec] = &[json_out("improvement_proposals", "improvement_proposals.json", true)];
const DIAGNOSTICS_OUTPUTS: &[OutputSpec] = &[json_out("diagnostics_plan", "diagnostics_plan.json", false)];
const CURATOR_OUTPUTS: &[OutputSpec] = &[json_out("registry_curator_summary", "registry_curator_summary.json", false)];
const COMPOSER_OUTPUTS: &[OutputSpec] = &[json_out("composer_agent_plan", "composer_agent_plan.json", false)];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AgentKind {
    Intent,
    StrategySpec,
    SpecQa,
    Backtest,
    Demo,
    Report,
    Improvement,
    Diagnostics,
    RegistryCurator,
    Composer,
}

impl AgentKind {
    pub const ALL: [AgentKind; 10] = [
        AgentKind::Intent,
        AgentKind::StrategySpec,
        AgentKind::SpecQa,
        AgentKind::Backtest,
        AgentKind::Demo,
        AgentKind::Report,
        AgentKind::Improvement,
        AgentKind::Diagnostics,
        AgentKind::RegistryCurator,
        AgentKind::Composer,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            AgentKind::Intent => "intent_agent_v1",
            AgentKind::StrategySpec => "strategy_spec_agent_v1",
            AgentKind::SpecQa => "spec_qa_agent_v1",
            AgentKind::Backtest => "backtest_agent_v1",
            AgentKind::Demo => "demo_agent_v1",
            AgentKind::Report => "report_agent_v1",
            AgentKind::Improvement => "improvement_agent_v1",
            AgentKind::Diagnostics => "diagnostics_agent_v1",
            AgentKind::RegistryCurator => "registry_curator_v1",
            AgentKind::Composer => "composer_agent_v1",
        }
    }

    pub fn parse(agent_id: &str) -> Result<AgentKind> {
        AgentKind::ALL
            .iter()
            .copied()
            .find(|k| k.id() == agent_id)
            .ok_or_else(|| EamError::Usage(format!("unknown agent_id: {}", agent_id)).into())
    }

    pub fn outputs(&self) -> &'static [OutputSpec] {
        match self {
            AgentKind::Intent => INTENT_OUTPUTS,
            AgentKind::StrategySpec => STRATEGY_SPEC_OUTPUTS,
            AgentKind::SpecQa => SPEC_QA_OUTPUTS,
            AgentKind::Backtest => BACKTEST_OUTPUTS,
            AgentKind::Demo => DEMO_OUTPUTS,
            AgentKind::Report => REPORT_OUTPUTS,
            AgentKind::Improvement => IMPROVEMENT_OUTPUTS,
            AgentKind::Diagnostics => DIAGNOSTICS_OUTPUTS,
            AgentKind::RegistryCurator => CURATOR_OUTPUTS,
            AgentKind::Composer => COMPOSER_OUTPUTS,
        }
    }

    /// Agents that get a registry experience pack next to their outputs.
    pub fn uses_retrieval(&self) -> bool {
        matches!(self, AgentKind::Intent | AgentKind::Improvement)
    }

    /// JSON schema of the response bundle, sent to real providers and hashed
    /// into the request.
    pub fn bundle_schema(&self) -> Value {
        let mut props = Map::new();
        for out in self.outputs() {
            let ty = match out.kind {
                OutputKind::Json => "object",
                OutputKind::Text => "string",
            };
            props.insert(out.key.to_string(), json!({"type": ty}));
        }
        let required: Vec<&str> = self.outputs().iter().map(|o| o.key).collect();
        json!({"type": "object", "required": required, "properties": props})
    }

    /// Shape check on a response bundle from any source.
    pub fn check_bundle(&self, bundle: &Value) -> Result<()> {
        for out in self.outputs() {
            let v = bundle.get(out.key).ok_or_else(|| {
                EamError::InvalidContract(format!("{} response missing '{}'", self.id(), out.key))
            })?;
            let ok = match out.kind {
                OutputKind::Json => v.is_object(),
                OutputKind::Text => v.is_string(),
            };
            if !ok {
                return Err(EamError::InvalidContract(format!("{} response '{}' has the wrong type", self.id(), out.key)).into());
            }
            if out.contract {
                ensure_valid(v).map_err(|e| anyhow!("{} output '{}': {}", self.id(), out.key, e))?;
            }
        }
        Ok(())
    }

    pub fn produce(&self, input: &Value, ctx: &AgentContext<'_>) -> Result<Value> {
        match self {
            AgentKind::Intent => intent(input, ctx),
            AgentKind::StrategySpec => strategy_spec(input),
            AgentKind::SpecQa => spec_qa(input),
            AgentKind::Backtest => backtest_plan(input),
            AgentKind::Demo => demo_plan(input),
            AgentKind::Report => report(input),
            AgentKind::Improvement => improvement(input),
            AgentKind::Diagnostics => diagnostics(input),
            AgentKind::RegistryCurator => curator(input),
            AgentKind::Composer => composer(input),
        }
    }
}

pub struct AgentContext<'a> {
    pub roots: &'a EamRoots,
}

impl AgentContext<'_> {
    /// Relative paths in agent inputs are relative to the repo root.
    pub fn resolve_repo_path(&self, raw: &str) -> PathBuf {
        let p = Path::new(raw);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.roots.repo_root.join(p)
        }
    }
}

fn str_field<'a>(v: &'a Value, key: &str) -> Result<&'a str> {
    v.get(key)
        .and_then(|x| x.as_str())
        .ok_or_else(|| EamError::InvalidContract(format!("agent input missing string '{}'", key)).into())
}

fn obj_field<'a>(v: &'a Value, key: &str) -> Result<&'a Value> {
    v.get(key)
        .filter(|x| x.is_object())
        .ok_or_else(|| EamError::InvalidContract(format!("agent input missing object '{}'", key)).into())
}

fn string_list(v: Option<&Value>) -> Vec<String> {
    v.and_then(|x| x.as_array())
        .map(|a| a.iter().filter_map(|s| s.as_str()).map(String::from).collect())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// strategy templates
// ---------------------------------------------------------------------------

pub const STRATEGY_TEMPLATES: &[&str] = &["buy_and_hold", "ma_crossover", "close_above_sma"];

fn col(field: &str) -> Value {
    json!({"op": "col", "field": field})
}

fn sma(field: &str, window: u64) -> Value {
    json!({"op": "sma", "of": col(field), "window": window})
}

fn reference(name: &str) -> Value {
    json!({"op": "ref", "name": name})
}

/// `strategy_spec` for a named template; unknown names are a usage error.
pub fn strategy_template(name: &str) -> Result<Value> {
    let (strategy_id, expressions, entry, exit) = match name {
        "buy_and_hold" => (
            BUY_AND_HOLD_STRATEGY_ID,
            json!({
                "entry_all": {"op": "const", "value": true},
                "exit_none": {"op": "const", "value": false},
            }),
            "entry_all",
            "exit_none",
        ),
        "ma_crossover" => (
            "ma_crossover_v1",
            json!({
                "fast_ma": sma("close", 3),
                "slow_ma": sma("close", 5),
                "entry_cross": {"op": "gt", "left": reference("fast_ma"), "right": reference("slow_ma")},
                "exit_cross": {"op": "lt", "left": reference("fast_ma"), "right": reference("slow_ma")},
            }),
            "entry_cross",
            "exit_cross",
        ),
        "close_above_sma" => (
            "close_above_sma_v1",
            json!({
                "trend_ma": sma("close", 5),
                "entry_trend": {"op": "gt", "left": col("close"), "right": reference("trend_ma")},
                "exit_trend": {"op": "not", "of": reference("entry_trend")},
            }),
            "entry_trend",
            "exit_trend",
        ),
        other => {
            return Err(EamError::Usage(format!(
                "unknown strategy_template '{}' (expected one of {})",
                other,
                STRATEGY_TEMPLATES.join("|")
            ))
            .into())
        }
    };
    Ok(json!({
        "dsl_version": "signal_dsl_v1",
        "execution": {"cost_model": {"ref_policy": true}, "order_timing": "next_open"},
        "expressions": expressions,
        "signals": {"entry": entry, "exit": exit},
        "extensions": {"engine_contract": VECTORBT_SIGNAL_V1, "strategy_id": strategy_id},
    }))
}

fn template_of(doc: &Value) -> Option<String> {
    doc.pointer("/extensions/strategy_template")
        .and_then(|v| v.as_str())
        .map(String::from)
}

fn collect_cols(expr: &Value, out: &mut BTreeSet<String>) {
    match expr {
        Value::Object(map) => {
            if map.get("op").and_then(|v| v.as_str()) == Some("col") {
                if let Some(f) = map.get("field").and_then(|v| v.as_str()) {
                    out.insert(f.to_string());
                }
            }
            for v in map.values() {
                collect_cols(v, out);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_cols(v, out)),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// intent
// ---------------------------------------------------------------------------

/// Train/test/holdout windows over the idea's `[start, end]`: 30% / rest / 30%.
fn split_window(start: &str, end: &str) -> Result<Value> {
    let start = parse_date(start)?;
    let end = parse_date(end)?;
    let days = (end - start).num_days() + 1;
    if days < 3 {
        return Err(EamError::Usage(format!("idea window {}..{} is shorter than 3 days", start, end)).into());
    }
    let edge = (days * 3 / 10).max(1);
    let train_end = start + Duration::days(edge - 1);
    let holdout_start = end - Duration::days(edge - 1);
    let test_start = train_end + Duration::days(1);
    let test_end = holdout_start - Duration::days(1);
    Ok(json!({
        "train": {"start": start.to_string(), "end": train_end.to_string()},
        "test": {"start": test_start.to_string(), "end": test_end.to_string()},
        "holdout": {"start": holdout_start.to_string(), "end": end.to_string()},
    }))
}

fn intent(idea: &Value, ctx: &AgentContext<'_>) -> Result<Value> {
    ensure_valid(idea)?;
    let bundle_path = ctx.resolve_repo_path(str_field(idea, "policy_bundle_path")?);
    let bundle = load_policy_bundle(&bundle_path)?;
    let gate_suite_id = bundle
        .doc
        .get("gate_suite_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EamError::PolicyViolation("policy bundle has no gate_suite_id".into()))?;
    let template = template_of(idea).unwrap_or_else(|| "buy_and_hold".into());
    let mut extensions = json!({"source": "idea_spec_v1", "idea_sha256": canonical_json_digest(idea)});
    extensions["strategy_template"] = json!(template);
    let blueprint = json!({
        "schema_version": "blueprint_v1",
        "blueprint_id": format!("bp_{}", short_digest(idea)),
        "title": str_field(idea, "title")?,
        "description": str_field(idea, "hypothesis_text")?,
        "policy_bundle_id": bundle.policy_bundle_id,
        "universe": {
            "asset_pack": "demo",
            "calendar": "DEMO",
            "symbols": string_list(idea.get("symbols")),
            "timezone": "Asia/Taipei",
        },
        "bar_spec": {"frequency": "1d"},
        "data_requirements": [{
            "dataset_id": OHLCV_DATASET_ID,
            "frequency": "1d",
            "fields": ["open", "high", "low", "close", "volume", "available_at"],
            "adjustment": "none",
            "asof_rule": {"mode": "asof"},
        }],
        "strategy_spec": strategy_template("buy_and_hold")?,
        "evaluation_protocol": {
            "segments": split_window(str_field(idea, "start")?, str_field(idea, "end")?)?,
            "purge": {"bars": 0},
            "embargo": {"bars": 0},
            "gate_suite_id": gate_suite_id,
        },
        "report_spec": {"sections": ["summary", "gates"]},
        "extensions": extensions,
    });
    Ok(json!({"blueprint_draft": blueprint}))
}

// ---------------------------------------------------------------------------
// strategy spec
// ---------------------------------------------------------------------------

fn strategy_spec(input: &Value) -> Result<Value> {
    let draft = obj_field(input, "blueprint_draft")?;
    let template = input
        .get("idea")
        .and_then(template_of)
        .or_else(|| template_of(draft))
        .unwrap_or_else(|| "buy_and_hold".into());
    let spec = strategy_template(&template)?;
    let mut blueprint = draft.clone();
    blueprint["strategy_spec"] = spec.clone();

    let signal_dsl = json!({
        "dsl_version": "signal_dsl_v1",
        "expressions": spec["expressions"].clone(),
        "signals": spec["signals"].clone(),
    });
    let mut cols = BTreeSet::new();
    collect_cols(&spec["expressions"], &mut cols);
    cols.insert("close".to_string());
    let variables: Vec<Value> = cols
        .iter()
        .map(|f| {
            json!({
                "name": f,
                "source": format!("{}.{}", OHLCV_DATASET_ID, f),
                "dtype": "float",
                "description": format!("daily {} visible at as_of", f),
            })
        })
        .collect();
    let steps: Vec<Value> = spec["expressions"]
        .as_object()
        .map(|m| m.keys().cloned().collect::<Vec<_>>())
        .unwrap_or_default()
        .iter()
        .enumerate()
        .map(|(i, name)| json!({"step_id": format!("s{}", i + 1), "expr_ref": name, "description": format!("evaluate {}", name)}))
        .collect();
    let symbols: Vec<String> = string_list(draft.pointer("/universe/symbols"))
        .into_iter()
        .take(TRACE_SAMPLE_SYMBOLS)
        .collect();
    Ok(json!({
        "blueprint_final": blueprint,
        "signal_dsl": signal_dsl,
        "variable_dictionary": {"schema_version": "variable_dictionary_v1", "variables": variables},
        "calc_trace_plan": {
            "schema_version": "calc_trace_plan_v1",
            "sample": {"max_rows": TRACE_SAMPLE_ROWS, "symbols": symbols},
            "steps": steps,
        },
    }))
}

// ---------------------------------------------------------------------------
// spec QA
// ---------------------------------------------------------------------------

struct Checks(Vec<Value>);

impl Checks {
    fn push(&mut self, check_id: &str, pass: bool, message: String) {
        self.0.push(json!({"check_id": check_id, "pass": pass, "message": message}));
    }
}

fn contract_check(checks: &mut Checks, input: &Value, key: &str) {
    match input.get(key) {
        Some(v) if v.is_object() => {
            let res = validate_payload(v);
            checks.push(&format!("{}_contract", key), res.is_ok(), res.message);
        }
        _ => checks.push(&format!("{}_contract", key), false, format!("{} is missing", key)),
    }
}

fn spec_qa(input: &Value) -> Result<Value> {
    let mut checks = Checks(Vec::new());
    for key in ["blueprint_final", "signal_dsl", "variable_dictionary", "calc_trace_plan"] {
        contract_check(&mut checks, input, key);
    }
    let dsl = input.get("signal_dsl").cloned().unwrap_or(Value::Null);
    match SignalProgram::parse(&dsl) {
        Ok(_) => checks.push("signal_dsl_compiles", true, "signal program compiles".into()),
        Err(e) => checks.push("signal_dsl_compiles", false, e.to_string()),
    }
    let expr_names: BTreeSet<String> = dsl
        .get("expressions")
        .and_then(|v| v.as_object())
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();
    let missing_refs: Vec<String> = input
        .pointer("/calc_trace_plan/steps")
        .and_then(|v| v.as_array())
        .map(|steps| {
            steps
                .iter()
                .filter_map(|s| s.get("expr_ref").and_then(|v| v.as_str()))
                .filter(|r| !expr_names.contains(*r))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    checks.push(
        "trace_plan_refs_resolve",
        missing_refs.is_empty(),
        if missing_refs.is_empty() {
            "every trace step references a known expression".into()
        } else {
            format!("unknown expr_ref: {}", missing_refs.join(", "))
        },
    );
    let mut used = BTreeSet::new();
    collect_cols(dsl.get("expressions").unwrap_or(&Value::Null), &mut used);
    let declared: BTreeSet<String> = input
        .pointer("/variable_dictionary/variables")
        .and_then(|v| v.as_array())
        .map(|vars| vars.iter().filter_map(|v| v.get("name").and_then(|n| n.as_str())).map(String::from).collect())
        .unwrap_or_default();
    let undeclared: Vec<String> = used.difference(&declared).cloned().collect();
    checks.push(
        "variables_declared",
        undeclared.is_empty(),
        if undeclared.is_empty() {
            "every referenced column is declared".into()
        } else {
            format!("undeclared columns: {}", undeclared.join(", "))
        },
    );
    let same_spec = input.pointer("/blueprint_final/strategy_spec/expressions") == dsl.get("expressions");
    checks.push(
        "blueprint_matches_dsl",
        same_spec,
        if same_spec {
            "blueprint strategy_spec carries the same expressions".into()
        } else {
            "blueprint strategy_spec differs from signal_dsl".into()
        },
    );

    let failed = checks.0.iter().filter(|c| c["pass"] == false).count();
    let status = if failed == 0 { "pass" } else { "fail" };
    let mut md = format!("# Spec QA\n\nstatus: {}\n\n| check | pass | message |\n|---|---|---|\n", status);
    for c in &checks.0 {
        md.push_str(&format!(
            "| {} | {} | {} |\n",
            c["check_id"].as_str().unwrap_or_default(),
            c["pass"],
            c["message"].as_str().unwrap_or_default().replace('|', "/")
        ));
    }
    Ok(json!({
        "spec_qa_report": {
            "schema_version": "spec_qa_report_v1",
            "status": status,
            "failed_count": failed,
            "checks": checks.0,
        },
        "spec_qa_report_md": md,
    }))
}

// ---------------------------------------------------------------------------
// evidence-only plans
// ---------------------------------------------------------------------------

fn backtest_plan(input: &Value) -> Result<Value> {
    let runspec = obj_field(input, "runspec")?;
    let segments: Vec<Value> = runspec
        .pointer("/segments/list")
        .and_then(|v| v.as_array())
        .map(|list| list.iter().filter_map(|s| s.get("segment_id").cloned()).collect())
        .unwrap_or_default();
    Ok(json!({
        "backtest_plan": {
            "schema_version": "backtest_plan_v1",
            "run_id": str_field(input, "run_id")?,
            "adapter_id": runspec.pointer("/adapter/adapter_id").cloned().unwrap_or(Value::Null),
            "data_snapshot_id": runspec.get("data_snapshot_id").cloned().unwrap_or(Value::Null),
            "symbols": runspec.pointer("/extensions/symbols").cloned().unwrap_or(json!([])),
            "segments": segments,
            "steps": [
                "load snapshot bars filtered by available_at <= as_of",
                "evaluate entry/exit signals with the policy trade lag",
                "apply execution and cost policies",
                "seal dossier and run gate suite",
            ],
        }
    }))
}

fn demo_plan(input: &Value) -> Result<Value> {
    let bp = obj_field(input, "blueprint_final")?;
    Ok(json!({
        "demo_plan": {
            "schema_version": "demo_agent_plan_v1",
            "blueprint_id": bp.get("blueprint_id").cloned().unwrap_or(Value::Null),
            "symbols": bp.pointer("/universe/symbols").cloned().unwrap_or(json!([])),
            "review_items": [
                "calc trace preview rows respect as_of",
                "entry and exit columns flip where the expressions say",
                "no trade is placed before the configured lag",
            ],
        }
    }))
}

fn gate_counts(input: &Value) -> (usize, usize, usize) {
    let mut counts = (0, 0, 0);
    if let Some(results) = input.pointer("/gate_summary/results").and_then(|v| v.as_array()) {
        for r in results {
            match r.get("status").and_then(|v| v.as_str()) {
                Some("pass") => counts.0 += 1,
                Some("fail") => counts.1 += 1,
                _ => counts.2 += 1,
            }
        }
    }
    counts
}

fn failed_gates(input: &Value) -> Vec<String> {
    input
        .pointer("/gate_summary/results")
        .and_then(|v| v.as_array())
        .map(|results| {
            results
                .iter()
                .filter(|r| r.get("status").and_then(|v| v.as_str()) == Some("fail"))
                .filter_map(|r| r.get("gate_id").and_then(|v| v.as_str()).map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn report(input: &Value) -> Result<Value> {
    let run_id = str_field(input, "run_id")?;
    let metrics = input.get("metrics").cloned().unwrap_or(json!({}));
    let overall_pass = input.pointer("/gate_summary/overall_pass").and_then(|v| v.as_bool()).unwrap_or(false);
    let (pass, fail, skipped) = gate_counts(input);
    let mut md = format!("# Experiment report {}\n\n", run_id);
    md.push_str(&format!("Gates: {} ({} pass, {} fail, {} skipped)\n\n", if overall_pass { "PASS" } else { "FAIL" }, pass, fail, skipped));
    md.push_str("## Test metrics\n\n");
    for key in ["total_return", "sharpe", "max_drawdown", "trade_count"] {
        md.push_str(&format!("- {}: {}\n", key, metrics.get(key).cloned().unwrap_or(Value::Null)));
    }
    let failed = failed_gates(input);
    if !failed.is_empty() {
        md.push_str(&format!("\n## Failed gates\n\n{}\n", failed.iter().map(|g| format!("- {}", g)).collect::<Vec<_>>().join("\n")));
    }
    Ok(json!({
        "report_md": md,
        "report_summary": {
            "schema_version": "report_summary_v1",
            "run_id": run_id,
            "overall_pass": overall_pass,
            "gate_counts": {"pass": pass, "fail": fail, "skipped": skipped},
            "metrics": metrics,
        },
    }))
}

fn diagnostics(input: &Value) -> Result<Value> {
    let run_id = str_field(input, "run_id")?;
    let failed = failed_gates(input);
    let trades = input.pointer("/metrics/trade_count").and_then(|v| v.as_u64()).unwrap_or(0);
    let mut findings = Vec::new();
    for gate in &failed {
        findings.push(json!({"kind": "gate_failed", "gate_id": gate}));
    }
    if trades == 0 {
        findings.push(json!({"kind": "no_trades", "detail": "the test segment produced no trades"}));
    }
    Ok(json!({
        "diagnostics_plan": {
            "schema_version": "diagnostics_agent_plan_v1",
            "run_id": run_id,
            "findings": findings,
            "next_checks": if findings.is_empty() {
                json!(["compare against registry champions"])
            } else {
                json!(["inspect gate evidence in the dossier", "review trade timing against the lag policy"])
            },
        }
    }))
}

fn curator(input: &Value) -> Result<Value> {
    let run_id = str_field(input, "run_id")?;
    let overall_pass = input.get("overall_pass").and_then(|v| v.as_bool()).unwrap_or(false);
    let recorded = input.get("trial_recorded").and_then(|v| v.as_bool()).unwrap_or(false);
    let action = if overall_pass && recorded { "create_card" } else { "keep_trial_only" };
    Ok(json!({
        "registry_curator_summary": {
            "schema_version": "registry_curator_summary_v1",
            "run_id": run_id,
            "recommendation": action,
            "reasons": [
                format!("overall_pass={}", overall_pass),
                format!("trial_recorded={}", recorded),
            ],
        }
    }))
}

fn composer(input: &Value) -> Result<Value> {
    let run_id = str_field(input, "run_id")?;
    let candidates: Vec<Value> = input
        .get("cards")
        .and_then(|v| v.as_array())
        .map(|cards| {
            cards
                .iter()
                .filter(|c| matches!(c.get("status").and_then(|v| v.as_str()), Some("champion") | Some("challenger")))
                .filter_map(|c| c.get("card_id").cloned())
                .collect()
        })
        .unwrap_or_default();
    Ok(json!({
        "composer_agent_plan": {
            "schema_version": "composer_agent_plan_v1",
            "run_id": run_id,
            "candidate_card_ids": candidates,
            "note": "composition is evidence only; no run is scheduled",
        }
    }))
}

// ---------------------------------------------------------------------------
// improvements
// ---------------------------------------------------------------------------

fn bump_bars(bp: &mut Value, key: &str) -> u64 {
    let next = bp
        .pointer(&format!("/evaluation_protocol/{}/bars", key))
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
        + 1;
    bp["evaluation_protocol"][key] = json!({"bars": next});
    next
}

fn improvement(input: &Value) -> Result<Value> {
    let base = obj_field(input, "blueprint_final")?;
    let base_job_id = str_field(input, "base_job_id")?;
    let cap = input
        .get("max_proposals")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_MAX_PROPOSALS);
    let base_id = base.get("blueprint_id").and_then(|v| v.as_str()).unwrap_or("bp");
    let current = base
        .pointer("/strategy_spec/extensions/strategy_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    let mut proposals = Vec::new();
    let mut draft = |n: usize, title: &str, rationale: &str, change: String, edit: &dyn Fn(&mut Value) -> Result<()>| -> Result<()> {
        let mut bp = base.clone();
        edit(&mut bp)?;
        bp["blueprint_id"] = json!(format!("{}_p{:03}", base_id, n));
        proposals.push(json!({
            "proposal_id": format!("p_{:03}", n),
            "title": title,
            "rationale": rationale,
            "change_summary": [change],
            "blueprint_draft": bp,
        }));
        Ok(())
    };

    if current == BUY_AND_HOLD_STRATEGY_ID {
        draft(1, "Trend filter", "Check whether a moving-average crossover beats passive exposure.", "strategy: ma_crossover".into(), &|bp| {
            bp["strategy_spec"] = strategy_template("ma_crossover")?;
            Ok(())
        })?;
    } else {
        draft(1, "Passive baseline", "Measure the signal against plain buy-and-hold on the same window.", "strategy: buy_and_hold".into(), &|bp| {
            bp["strategy_spec"] = strategy_template("buy_and_hold")?;
            Ok(())
        })?;
    }
    draft(2, "Wider embargo", "Test sensitivity to information bleeding across the split.", "embargo bars +1".into(), &|bp| {
        bump_bars(bp, "embargo");
        Ok(())
    })?;
    let symbols = string_list(base.pointer("/universe/symbols"));
    if symbols.len() > 1 {
        let first = symbols[0].clone();
        draft(3, "Single-name check", "Confirm the result is not driven by one symbol.", format!("universe: {}", first), &move |bp| {
            bp["universe"]["symbols"] = json!([first.clone()]);
            Ok(())
        })?;
    } else {
        draft(3, "Purge before test", "Drop the last training bar to reduce overlap.", "purge bars +1".into(), &|bp| {
            bump_bars(bp, "purge");
            Ok(())
        })?;
    }
    proposals.truncate(cap);

    let mut doc = json!({
        "schema_version": "improvement_proposals_v1",
        "base_job_id": base_job_id,
        "proposals": proposals,
    });
    if let Some(run_id) = input.get("base_run_id").and_then(|v| v.as_str()) {
        doc["base_run_id"] = json!(run_id);
    }
    Ok(json!({"improvement_proposals": doc}))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    pub(crate) fn repo_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    pub(crate) fn demo_idea() -> Value {
        eam_core::read_json(&repo_root().join("contracts/examples/idea_spec_ok.json")).expect("idea example")
    }

    fn ctx_roots() -> EamRoots {
        EamRoots::new(&PathBuf::from("/tmp/eam-data"), &PathBuf::from("/tmp/eam-artifacts"), &repo_root())
    }

    #[test]
    fn window_split_matches_demo_segments() {
        let segs = split_window("2024-01-01", "2024-01-10").expect("split");
        assert_eq!(segs["train"]["end"], "2024-01-03");
        assert_eq!(segs["test"]["start"], "2024-01-04");
        assert_eq!(segs["test"]["end"], "2024-01-07");
        assert_eq!(segs["holdout"]["start"], "2024-01-08");
        assert!(split_window("2024-01-01", "2024-01-02").is_err());
    }

    #[test]
    fn intent_draft_is_a_valid_blueprint() {
        let roots = ctx_roots();
        let ctx = AgentContext { roots: &roots };
        let bundle = AgentKind::Intent.produce(&demo_idea(), &ctx).expect("intent");
        AgentKind::Intent.check_bundle(&bundle).expect("bundle");
        let bp = &bundle["blueprint_draft"];
        assert_eq!(bp["policy_bundle_id"], "policy_bundle_v1_default");
        assert_eq!(bp["universe"]["symbols"], json!(["AAA"]));
        assert!(bp["blueprint_id"].as_str().expect("id").starts_with("bp_"));
    }

    #[test]
    fn strategy_spec_outputs_pass_qa() {
        let roots = ctx_roots();
        let ctx = AgentContext { roots: &roots };
        let mut idea = demo_idea();
        idea["extensions"] = json!({"strategy_template": "ma_crossover"});
        let draft = AgentKind::Intent.produce(&idea, &ctx).expect("intent")["blueprint_draft"].clone();
        let spec = AgentKind::StrategySpec
            .produce(&json!({"idea": idea, "blueprint_draft": draft}), &ctx)
            .expect("strategy");
        AgentKind::StrategySpec.check_bundle(&spec).expect("bundle");
        assert_eq!(spec["blueprint_final"]["strategy_spec"]["extensions"]["strategy_id"], "ma_crossover_v1");

        let qa = AgentKind::SpecQa.produce(&spec, &ctx).expect("qa");
        assert_eq!(qa["spec_qa_report"]["status"], "pass", "{}", qa["spec_qa_report_md"]);

        let mut broken = spec.clone();
        broken["calc_trace_plan"]["steps"][0]["expr_ref"] = json!("nope");
        let qa = AgentKind::SpecQa.produce(&broken, &ctx).expect("qa");
        assert_eq!(qa["spec_qa_report"]["status"], "fail");
    }

    #[test]
    fn improvement_proposals_respect_cap_and_contract() {
        let roots = ctx_roots();
        let ctx = AgentContext { roots: &roots };
        let bp = eam_core::read_json(&repo_root().join("contracts/examples/blueprint_ok.json")).expect("bp");
        let input = json!({"base_job_id": "abc123", "base_run_id": "r1", "blueprint_final": bp, "max_proposals": 2});
        let out = AgentKind::Improvement.produce(&input, &ctx).expect("improve");
        AgentKind::Improvement.check_bundle(&out).expect("bundle");
        let proposals = out["improvement_proposals"]["proposals"].as_array().expect("list");
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0]["blueprint_draft"]["strategy_spec"]["extensions"]["strategy_id"], "ma_crossover_v1");
        assert_eq!(proposals[1]["blueprint_draft"]["evaluation_protocol"]["embargo"]["bars"], 1);
    }

    #[test]
    fn unknown_agents_and_templates_are_usage_errors() {
        let err = AgentKind::parse("oracle_v1").expect_err("unknown");
        assert_eq!(eam_core::exit_code_for(&err), eam_core::EXIT_USAGE_OR_ERROR);
        assert!(strategy_template("martingale").is_err());
        assert_eq!(AgentKind::parse("composer_agent_v1").expect("known"), AgentKind::Composer);
    }
}
