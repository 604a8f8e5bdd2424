//! `run_agent`: one agent invocation from input file to sealed evidence.
//!
//! Order matters: prompt pack, redaction, request hash, budget pre-check,
//! dispatch, outputs, guard, session, usage, and `agent_run.json` last so its
//! presence marks a completed run.

use anyhow::{anyhow, Context, Result};
use eam_core::{
    atomic_write_json_pretty, atomic_write_text, canonical_json, ensure_dir, read_json, EamError, EamRoots,
};
use eam_runner::policies::ResolvedPolicies;
use eam_runner::registry::{experience_pack, ExperienceQuery};
use eam_schemas::ensure_valid;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use crate::agents::{AgentContext, AgentKind, OutputKind, AGENT_VERSION};
use crate::cassette::{prompt_hash_v1, CassetteStore, LLM_CALLS_FILE};
use crate::guards::{validate_agent_output, GUARD_REPORT_FILE};
use crate::promptpack::{select_version, PromptLocator};
use crate::provider::{LlmEnv, LlmMode, RealHttpProvider};
use crate::redaction::{root_placeholders, sanitize_for_llm, RedactionLimits, REDACTION_SUMMARY_FILE};
use crate::usage::{
    aggregate, load_usage_events, stop_reason, would_exceed, write_usage_event, write_usage_report,
    BudgetThresholds, UsageEvent, UsagePaths, UsageTotals, BUDGET_STOP_FILE,
};

pub const AGENT_RUN_FILE: &str = "agent_run.json";
pub const LLM_SESSION_FILE: &str = "llm_session.json";
pub const ERROR_SUMMARY_FILE: &str = "error_summary.json";
pub const EXPERIENCE_PACK_FILE: &str = "experience_pack.json";

const TEMPERATURE: f64 = 0.0;
const SEED: u64 = 0;
const EXPERIENCE_TOP_K: usize = 5;

pub struct AgentRunRequest<'a> {
    pub agent_id: &'a str,
    pub input_path: &'a Path,
    pub out_dir: &'a Path,
    /// Inferred from `out_dir` under the job root when absent.
    pub job_id: Option<&'a str>,
    /// Bundle supplying `llm_budget_policy`; the repo default when absent.
    pub bundle_path: Option<&'a Path>,
}

#[derive(Clone, Debug)]
pub struct AgentRunResult {
    pub agent_id: String,
    pub out_dir: PathBuf,
    pub agent_run: Value,
    pub outputs: BTreeMap<String, PathBuf>,
    pub reused: bool,
    /// Pre-call budget breach: nothing was produced.
    pub budget_stopped: bool,
    pub stop_reason: Option<String>,
    pub guard_passed: bool,
}

impl AgentRunResult {
    pub fn to_json(&self) -> Value {
        json!({
            "agent_id": self.agent_id,
            "out_dir": self.out_dir.display().to_string(),
            "agent_run": self.agent_run,
            "outputs": self.outputs.iter().map(|(k, p)| (k.clone(), json!(p.display().to_string()))).collect::<serde_json::Map<_, _>>(),
            "reused": self.reused,
            "budget_stopped": self.budget_stopped,
            "stop_reason": self.stop_reason,
            "guard_passed": self.guard_passed,
        })
    }
}

/// Job the out dir belongs to: `<job_root>/<job_id>/...`.
fn infer_job_id(roots: &EamRoots, out_dir: &Path) -> Option<String> {
    let rel = out_dir.strip_prefix(&roots.job_root).ok()?;
    match rel.components().next() {
        Some(Component::Normal(s)) => s.to_str().map(String::from),
        _ => None,
    }
}

fn output_paths(kind: AgentKind, out_dir: &Path) -> BTreeMap<String, PathBuf> {
    kind.outputs()
        .iter()
        .map(|o| (o.key.to_string(), out_dir.join(o.file)))
        .collect()
}

fn reuse_existing(kind: AgentKind, out_dir: &Path, agent_run: Value) -> AgentRunResult {
    let ext = |k: &str| agent_run.pointer(&format!("/extensions/{}", k)).cloned();
    let budget_stopped = ext("budget_stopped").and_then(|v| v.as_bool()).unwrap_or(false);
    AgentRunResult {
        agent_id: kind.id().to_string(),
        out_dir: out_dir.to_path_buf(),
        outputs: if budget_stopped { BTreeMap::new() } else { output_paths(kind, out_dir) },
        reused: true,
        budget_stopped,
        stop_reason: ext("stop_reason").and_then(|v| v.as_str().map(String::from)),
        guard_passed: agent_run.get("guard_status").and_then(|v| v.as_str()) == Some("pass"),
        agent_run,
    }
}

fn load_thresholds(roots: &EamRoots, bundle_path: Option<&Path>) -> Result<Option<BudgetThresholds>> {
    let path = bundle_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| roots.default_bundle_path());
    let policies = ResolvedPolicies::load(&path)?;
    policies.llm_budget.as_ref().map(BudgetThresholds::from_policy).transpose()
}

fn write_experience_pack(roots: &EamRoots, kind: AgentKind, input: &Value, out_dir: &Path) -> Result<PathBuf> {
    let bp = input.get("blueprint_final");
    let text = |key: &str| {
        input
            .get(key)
            .or_else(|| bp.and_then(|b| b.get(key)))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    let symbols = input
        .get("symbols")
        .or_else(|| bp.and_then(|b| b.pointer("/universe/symbols")))
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|s| s.as_str()).map(String::from).collect())
        .unwrap_or_default();
    let query = ExperienceQuery {
        query: format!("{} {} {}", text("title"), text("hypothesis_text"), text("description")).trim().to_string(),
        symbols,
        frequency: Some("1d".into()),
        tags: Vec::new(),
        top_k: EXPERIENCE_TOP_K,
    };
    let pack = experience_pack(&roots.registry_root, &query)?;
    let path = out_dir.join(EXPERIENCE_PACK_FILE);
    atomic_write_json_pretty(&path, &pack)?;
    tracing::debug!(agent_id = kind.id(), path = %path.display(), "experience pack written");
    Ok(path)
}

/// Where the response came from.
enum Dispatch {
    Produced(Value, &'static str),
    Replayed(Value),
}

impl Dispatch {
    fn bundle(&self) -> &Value {
        match self {
            Dispatch::Produced(v, _) | Dispatch::Replayed(v) => v,
        }
    }

    fn source(&self) -> &'static str {
        match self {
            Dispatch::Produced(_, source) => *source,
            Dispatch::Replayed(_) => "cassette",
        }
    }
}

pub fn run_agent(roots: &EamRoots, env: &LlmEnv, req: &AgentRunRequest<'_>) -> Result<AgentRunResult> {
    let kind = AgentKind::parse(req.agent_id)?;
    let existing = req.out_dir.join(AGENT_RUN_FILE);
    if existing.is_file() {
        tracing::info!(agent_id = req.agent_id, out_dir = %req.out_dir.display(), "agent_run.json exists; reusing");
        return Ok(reuse_existing(kind, req.out_dir, read_json(&existing)?));
    }
    let thresholds = load_thresholds(roots, req.bundle_path)?;
    run_agent_with_budget(roots, env, req, thresholds.as_ref())
}

/// `run_agent` with explicit thresholds (`None` disables budget accounting).
pub fn run_agent_with_budget(
    roots: &EamRoots,
    env: &LlmEnv,
    req: &AgentRunRequest<'_>,
    thresholds: Option<&BudgetThresholds>,
) -> Result<AgentRunResult> {
    let kind = AgentKind::parse(req.agent_id)?;
    let out_dir = req.out_dir;
    let existing = out_dir.join(AGENT_RUN_FILE);
    if existing.is_file() {
        return Ok(reuse_existing(kind, out_dir, read_json(&existing)?));
    }
    ensure_dir(out_dir)?;
    let input = read_json(req.input_path).with_context(|| format!("agent input {}", req.input_path.display()))?;
    let job_id = req
        .job_id
        .map(String::from)
        .or_else(|| infer_job_id(roots, out_dir));
    let job_dir = job_id.as_ref().map(|id| roots.job_dir(id));

    // prompt pack
    let version = select_version(job_dir.as_deref(), kind.id(), env.prompt_version.as_deref());
    let locator = PromptLocator::new(&roots.repo_root, env.promptpack_root.clone());
    let pack = locator.resolve(kind.id(), &version)?;

    // redaction
    let (sanitized, redaction) = sanitize_for_llm(&input, &root_placeholders(roots), RedactionLimits::default());
    let redaction_path = out_dir.join(REDACTION_SUMMARY_FILE);
    redaction.write(&redaction_path)?;

    let mut output_refs: Vec<String> = Vec::new();
    if kind.uses_retrieval() {
        output_refs.push(write_experience_pack(roots, kind, &input, out_dir)?.display().to_string());
    }

    // request
    let schema = kind.bundle_schema();
    let user = format!("INPUT_JSON:\n{}\n", canonical_json(&sanitized));
    let request = json!({
        "agent_id": kind.id(),
        "agent_version": AGENT_VERSION,
        "provider_id": env.provider_id,
        "sanitized_input_sha256": redaction.sanitized_sha256,
        "prompt_version": pack.prompt_version,
        "output_schema_version": pack.output_schema_version,
        "promptpack_sha256": pack.sha256,
        "system": pack.system,
        "user": user,
        "schema_sha256": eam_core::canonical_json_digest(&schema),
        "temperature": TEMPERATURE,
        "seed": SEED,
    });
    let prompt_hash = prompt_hash_v1(&request);
    let prompt_chars = (pack.system.chars().count() + user.chars().count()) as u64;

    let cassette = CassetteStore::in_dir(env.cassette_dir.as_deref().unwrap_or(out_dir));
    let calls_path = out_dir.join(LLM_CALLS_FILE);
    let session_path = out_dir.join(LLM_SESSION_FILE);
    let guard_path = out_dir.join(GUARD_REPORT_FILE);

    // budget pre-check
    let budget = match (thresholds, &job_id, &job_dir) {
        (Some(t), Some(id), Some(dir)) => Some((t, id.as_str(), UsagePaths::for_job(dir))),
        _ => None,
    };
    if let Some((t, id, paths)) = &budget {
        let totals = aggregate(&load_usage_events(paths)?).totals;
        let prospective = totals.add(&UsageTotals {
            calls: 1,
            prompt_chars,
            ..Default::default()
        });
        let exceeded = would_exceed(t, &prospective, 1);
        if let Some(reason) = stop_reason(&exceeded) {
            write_usage_event(
                paths,
                t,
                &UsageEvent {
                    job_id: id,
                    agent_id: kind.id(),
                    event_type: "BUDGET_BLOCKED_PRECALL",
                    delta: UsageTotals::default(),
                    would_exceed: Some(exceeded),
                    stop_reason: Some(reason.clone()),
                    evidence_refs: Some(json!({"agent_out_dir": out_dir.display().to_string()})),
                },
            )?;
            let report_path = write_usage_report(paths, id, t)?;
            atomic_write_json_pretty(
                &out_dir.join(BUDGET_STOP_FILE),
                &json!({
                    "schema_version": "llm_budget_stop_v1",
                    "job_id": id,
                    "agent_id": kind.id(),
                    "policy_id": t.policy_id,
                    "stop_reason": reason,
                    "usage_report_ref": report_path.display().to_string(),
                }),
            )?;
            tracing::warn!(job_id = *id, agent_id = kind.id(), stop_reason = %reason, "llm budget exhausted before call");
            let guard = json!({
                "schema_version": "output_guard_report_v1",
                "agent_id": kind.id(),
                "prompt_version": pack.prompt_version,
                "output_schema_version": pack.output_schema_version,
                "guard_status": "pass",
                "passed": true,
                "finding_count": 0,
                "findings": [],
                "extensions": {"skipped": true, "reason": "budget_stopped"},
            });
            atomic_write_json_pretty(&guard_path, &guard)?;
            write_session(&session_path, kind, env, &[], &calls_path, &cassette, "none")?;
            let agent_run = build_agent_run(&AgentRunFields {
                kind,
                env,
                input_path: req.input_path,
                output_refs: &output_refs,
                pack_version: &pack.prompt_version,
                pack_schema: &pack.output_schema_version,
                guard_status: "skipped",
                session_path: &session_path,
                extensions: json!({
                    "prompt_hash": prompt_hash,
                    "promptpack_sha256": pack.sha256,
                    "promptpack_source": pack.source.as_str(),
                    "promptpack_path": pack.path.display().to_string(),
                    "redaction_summary_ref": redaction_path.display().to_string(),
                    "budget_stopped": true,
                    "stop_reason": reason,
                }),
            });
            ensure_valid(&agent_run)?;
            atomic_write_json_pretty(&existing, &agent_run)?;
            return Ok(AgentRunResult {
                agent_id: kind.id().to_string(),
                out_dir: out_dir.to_path_buf(),
                agent_run,
                outputs: BTreeMap::new(),
                reused: false,
                budget_stopped: true,
                stop_reason: Some(reason),
                guard_passed: true,
            });
        }
    }

    // dispatch
    let started = Instant::now();
    let dispatched = dispatch(roots, env, kind, &input, &request, &prompt_hash, &cassette, out_dir)?;
    let wall_seconds = started.elapsed().as_secs_f64();
    let bundle = dispatched.bundle();
    kind.check_bundle(bundle)?;

    let call = json!({
        "schema_version": "llm_call_v1",
        "prompt_hash": prompt_hash,
        "provider_id": env.provider_id,
        "mode": env.mode.as_str(),
        "request": request,
        "response_json": bundle,
        "extensions": {"agent_id": kind.id(), "response_source": dispatched.source()},
    });
    ensure_valid(&call)?;
    if env.mode == LlmMode::Record && !matches!(dispatched, Dispatch::Replayed(_)) {
        cassette.append_call(&call)?;
    }
    eam_core::append_jsonl(&calls_path, &call)?;

    // outputs
    let mut outputs = BTreeMap::new();
    for spec in kind.outputs() {
        let path = out_dir.join(spec.file);
        match spec.kind {
            OutputKind::Json => atomic_write_json_pretty(&path, &bundle[spec.key])?,
            OutputKind::Text => atomic_write_text(&path, bundle[spec.key].as_str().unwrap_or_default())?,
        }
        output_refs.push(path.display().to_string());
        outputs.insert(spec.key.to_string(), path);
    }

    // guard
    let guard = validate_agent_output(kind.id(), bundle, &pack.prompt_version, &pack.output_schema_version);
    ensure_valid(&guard)?;
    atomic_write_json_pretty(&guard_path, &guard)?;
    let guard_passed = guard["passed"].as_bool().unwrap_or(false);
    if !guard_passed {
        tracing::warn!(agent_id = kind.id(), findings = %guard["finding_count"], "output guard failed");
    }

    write_session(&session_path, kind, env, &[prompt_hash.clone()], &calls_path, &cassette, dispatched.source())?;

    // usage
    let mut post_stop = None;
    if let Some((t, id, paths)) = &budget {
        let delta = UsageTotals {
            calls: 1,
            prompt_chars,
            response_chars: canonical_json(bundle).chars().count() as u64,
            wall_seconds,
        };
        let totals = aggregate(&load_usage_events(paths)?).totals.add(&delta);
        let exceeded = would_exceed(t, &totals, 1);
        post_stop = stop_reason(&exceeded);
        write_usage_event(
            paths,
            t,
            &UsageEvent {
                job_id: id,
                agent_id: kind.id(),
                event_type: "CALL_COMPLETED",
                delta,
                would_exceed: Some(exceeded),
                stop_reason: post_stop.clone(),
                evidence_refs: Some(json!({
                    "llm_calls_path": calls_path.display().to_string(),
                    "redaction_summary_path": redaction_path.display().to_string(),
                    "cassette_path": cassette.path.display().to_string(),
                    "agent_out_dir": out_dir.display().to_string(),
                })),
            },
        )?;
        write_usage_report(paths, id, t)?;
    }

    let agent_run = build_agent_run(&AgentRunFields {
        kind,
        env,
        input_path: req.input_path,
        output_refs: &output_refs,
        pack_version: &pack.prompt_version,
        pack_schema: &pack.output_schema_version,
        guard_status: if guard_passed { "pass" } else { "fail" },
        session_path: &session_path,
        extensions: json!({
            "prompt_hash": prompt_hash,
            "promptpack_sha256": pack.sha256,
            "promptpack_source": pack.source.as_str(),
            "promptpack_path": pack.path.display().to_string(),
            "redaction_summary_ref": redaction_path.display().to_string(),
            "guard_report_ref": guard_path.display().to_string(),
            "response_source": dispatched.source(),
            "budget_stopped": false,
            "stop_reason": post_stop,
        }),
    });
    ensure_valid(&agent_run)?;
    atomic_write_json_pretty(&existing, &agent_run)?;
    tracing::info!(
        agent_id = kind.id(),
        mode = env.mode.as_str(),
        prompt_hash = %prompt_hash,
        guard_passed,
        "agent run complete"
    );
    Ok(AgentRunResult {
        agent_id: kind.id().to_string(),
        out_dir: out_dir.to_path_buf(),
        agent_run,
        outputs,
        reused: false,
        budget_stopped: false,
        stop_reason: post_stop,
        guard_passed,
    })
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    roots: &EamRoots,
    env: &LlmEnv,
    kind: AgentKind,
    input: &Value,
    request: &Value,
    prompt_hash: &str,
    cassette: &CassetteStore,
    out_dir: &Path,
) -> Result<Dispatch> {
    if env.mode == LlmMode::Replay {
        return match cassette.replay_response(prompt_hash)? {
            Some(v) => Ok(Dispatch::Replayed(v)),
            None => Err(EamError::CassetteMiss(format!(
                "no cassette entry for {} prompt_hash {} in {}",
                kind.id(),
                prompt_hash,
                cassette.path.display()
            ))
            .into()),
        };
    }
    if !env.uses_real_provider() {
        // deterministic producers run in-process on the unsanitized input
        let ctx = AgentContext { roots };
        return Ok(Dispatch::Produced(kind.produce(input, &ctx)?, "mock"));
    }
    let provider = RealHttpProvider::new(env);
    let system = request["system"].as_str().unwrap_or_default();
    let user = request["user"].as_str().unwrap_or_default();
    match provider.complete_json(system, user, &kind.bundle_schema(), TEMPERATURE, Some(SEED)) {
        Ok(v) => Ok(Dispatch::Produced(v, "real")),
        Err(err) => {
            let fallback = cassette.replay_response(prompt_hash)?;
            atomic_write_json_pretty(
                &out_dir.join(ERROR_SUMMARY_FILE),
                &json!({
                    "schema_version": "llm_error_summary_v1",
                    "agent_id": kind.id(),
                    "provider_id": env.provider_id,
                    "mode": env.mode.as_str(),
                    "prompt_hash": prompt_hash,
                    "error": err.to_string(),
                    "fallback": if fallback.is_some() { "cassette_hit" } else { "cassette_miss" },
                }),
            )?;
            tracing::warn!(agent_id = kind.id(), error = %err, "real provider failed");
            match fallback {
                Some(v) => Ok(Dispatch::Replayed(v)),
                None => Err(anyhow!("{} provider call failed and no cassette entry exists: {}", kind.id(), err)),
            }
        }
    }
}

fn write_session(
    path: &Path,
    kind: AgentKind,
    env: &LlmEnv,
    hashes: &[String],
    calls_path: &Path,
    cassette: &CassetteStore,
    source: &str,
) -> Result<()> {
    let session = json!({
        "schema_version": "llm_session_v1",
        "agent_id": kind.id(),
        "provider_id": env.provider_id,
        "mode": env.mode.as_str(),
        "call_count": hashes.len(),
        "prompt_hashes": hashes,
        "calls_path": calls_path.display().to_string(),
        "cassette_path": cassette.path.display().to_string(),
        "extensions": {"response_source": source},
    });
    ensure_valid(&session)?;
    atomic_write_json_pretty(path, &session)
}

struct AgentRunFields<'a> {
    kind: AgentKind,
    env: &'a LlmEnv,
    input_path: &'a Path,
    output_refs: &'a [String],
    pack_version: &'a str,
    pack_schema: &'a str,
    guard_status: &'a str,
    session_path: &'a Path,
    extensions: Value,
}

fn build_agent_run(f: &AgentRunFields<'_>) -> Value {
    json!({
        "schema_version": "agent_run_v1",
        "agent_id": f.kind.id(),
        "agent_version": AGENT_VERSION,
        "created_at": eam_core::now_iso(),
        "input_ref": f.input_path.display().to_string(),
        "output_refs": f.output_refs,
        "prompt_version": f.pack_version,
        "output_schema_version": f.pack_schema,
        "provider_id": f.env.provider_id,
        "cassette_mode": f.env.mode.as_str(),
        "guard_status": f.guard_status,
        "llm_session_ref": f.session_path.display().to_string(),
        "extensions": f.extensions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::tests::{demo_idea, repo_root};
    use crate::usage::tests::thresholds;
    use eam_core::scratch_dir;
    use std::fs;

    fn roots(root: &Path) -> EamRoots {
        EamRoots::new(&root.join("data"), &root.join("artifacts"), &repo_root())
    }

    fn write_input(root: &Path) -> PathBuf {
        let path = root.join("inputs/idea.json");
        atomic_write_json_pretty(&path, &demo_idea()).expect("input");
        path
    }

    fn run(roots: &EamRoots, env: &LlmEnv, input: &Path, out_dir: &Path) -> Result<AgentRunResult> {
        run_agent_with_budget(
            roots,
            env,
            &AgentRunRequest {
                agent_id: "intent_agent_v1",
                input_path: input,
                out_dir,
                job_id: None,
                bundle_path: None,
            },
            None,
        )
    }

    #[test]
    fn record_then_replay_is_byte_identical() {
        let root = scratch_dir("eam_harness_replay_test");
        let roots = roots(&root);
        let input = write_input(&root);
        let cassettes = root.join("cassettes");
        let mut env = LlmEnv::mock(LlmMode::Record);
        env.cassette_dir = Some(cassettes.clone());

        let recorded = run(&roots, &env, &input, &root.join("rec")).expect("record");
        assert!(recorded.guard_passed);
        assert_eq!(recorded.agent_run["cassette_mode"], "record");
        assert!(cassettes.join("cassette.jsonl").is_file());

        env.mode = LlmMode::Replay;
        let replayed = run(&roots, &env, &input, &root.join("rep")).expect("replay");
        let a = fs::read(&recorded.outputs["blueprint_draft"]).expect("a");
        let b = fs::read(&replayed.outputs["blueprint_draft"]).expect("b");
        assert_eq!(a, b);
        assert_eq!(replayed.agent_run["extensions"]["response_source"], "cassette");
        assert!(root.join("rep/experience_pack.json").is_file());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn replay_miss_is_a_cassette_miss() {
        let root = scratch_dir("eam_harness_miss_test");
        let roots = roots(&root);
        let input = write_input(&root);
        let env = LlmEnv::mock(LlmMode::Replay);
        let err = run(&roots, &env, &input, &root.join("out")).expect_err("miss");
        assert_eq!(eam_core::error_code_for(&err), "cassette_miss");
        assert!(!root.join("out").join(AGENT_RUN_FILE).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn existing_agent_run_is_reused() {
        let root = scratch_dir("eam_harness_reuse_test");
        let roots = roots(&root);
        let input = write_input(&root);
        let env = LlmEnv::mock(LlmMode::Live);
        let first = run(&roots, &env, &input, &root.join("out")).expect("first");
        assert!(!first.reused);
        let second = run(&roots, &env, &input, &root.join("out")).expect("second");
        assert!(second.reused);
        assert_eq!(first.agent_run, second.agent_run);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn second_call_is_blocked_by_job_budget() {
        let root = scratch_dir("eam_harness_budget_test");
        let roots = roots(&root);
        let input = write_input(&root);
        let env = LlmEnv::mock(LlmMode::Live);
        let t = thresholds(1);
        let job_dir = roots.job_dir("job1");
        let call = |dir: &str| {
            run_agent_with_budget(
                &roots,
                &env,
                &AgentRunRequest {
                    agent_id: "intent_agent_v1",
                    input_path: &input,
                    out_dir: &job_dir.join("outputs").join(dir),
                    job_id: None,
                    bundle_path: None,
                },
                Some(&t),
            )
        };
        let first = call("intent").expect("first");
        assert!(!first.budget_stopped);
        let second = call("intent_again").expect("second");
        assert!(second.budget_stopped);
        assert_eq!(second.stop_reason.as_deref(), Some("exceeded_max_calls_per_job"));
        assert_eq!(second.agent_run["guard_status"], "skipped");
        assert!(job_dir.join("outputs/intent_again").join(BUDGET_STOP_FILE).is_file());
        let report = read_json(&UsagePaths::for_job(&job_dir).report).expect("report");
        assert_eq!(report["totals"]["calls"], 1);
        assert_eq!(report["stopped"], true);
        let _ = fs::remove_dir_all(root);
    }
}
