//! Event-sourced job orchestration.
//!
//! A job's state is the fold of its `events.jsonl`. `advance_job_once` walks
//! the stage plan for the job kind, runs the first stage that is not complete,
//! and stops at the first checkpoint that lacks a fresh approval. Decisions
//! and reruns only ever append events.

use anyhow::Result;
use eam_agents::usage::UsagePaths;
use eam_agents::{is_budget_stopped, AgentKind, AgentRunRequest, AgentRunResult, LlmEnv};
use eam_core::{atomic_write_json_pretty, read_json, EamError, EamRoots};
use eam_runner::catalog::{runspec_anchor, runspec_symbols, SegmentKind};
use eam_runner::gates::{run_gates, GateRunInput};
use eam_runner::lake::format_ts;
use eam_runner::policies::ResolvedPolicies;
use eam_runner::registry::{list_cards, record_trial};
use eam_runner::sweep::{find_sweep_spec, run_sweep, SweepInput, SweepSpec};
use eam_runner::trace::{run_calc_trace_preview, TracePreviewInput};
use eam_runner::{compile_blueprint, run_runspec, ExistsBehavior};
use eam_schemas::ensure_valid;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::fetch::{execute_fetch, preflight_fetch_request, sync_fetch_to_dossier};
use crate::store::{
    append_event, budget_params, bundle_path_for, lineage_depth, load_job_events, load_job_spec, load_outputs_index,
    lock_job, try_lock_job, write_outputs_index, EventType, JobKind, JobPaths,
};

pub const STEP_LLM_LIVE_CONFIRM: &str = "llm_live_confirm";
pub const STEP_AGENT_OUTPUT_INVALID: &str = "agent_output_invalid";
pub const REJECT_STATE_FILE: &str = "reject_state.json";
const MAX_ACTIONS_PER_ADVANCE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Intent,
    StrategySpec,
    SpecQa,
    RunspecCompile,
    TracePreview,
    DeterministicRun,
    GateRunner,
    RegistryRecord,
    Diagnostics,
    RegistryCurator,
    Composer,
    Report,
    Sweep,
    Improvement,
}

impl Stage {
    pub const ALL: [Stage; 14] = [
        Stage::Intent,
        Stage::StrategySpec,
        Stage::SpecQa,
        Stage::RunspecCompile,
        Stage::TracePreview,
        Stage::DeterministicRun,
        Stage::GateRunner,
        Stage::RegistryRecord,
        Stage::Diagnostics,
        Stage::RegistryCurator,
        Stage::Composer,
        Stage::Report,
        Stage::Sweep,
        Stage::Improvement,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Stage::Intent => "intent",
            Stage::StrategySpec => "strategy_spec",
            Stage::SpecQa => "spec_qa",
            Stage::RunspecCompile => "runspec_compile",
            Stage::TracePreview => "trace_preview",
            Stage::DeterministicRun => "deterministic_run",
            Stage::GateRunner => "gate_runner",
            Stage::RegistryRecord => "registry_record",
            Stage::Diagnostics => "diagnostics",
            Stage::RegistryCurator => "registry_curator",
            Stage::Composer => "composer",
            Stage::Report => "report",
            Stage::Sweep => "sweep",
            Stage::Improvement => "improvement",
        }
    }

    pub fn parse(raw: &str) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| s.id() == raw)
    }

    pub fn completion_event(&self) -> EventType {
        match self {
            Stage::Intent => EventType::BlueprintProposed,
            Stage::StrategySpec => EventType::StrategySpecProposed,
            Stage::SpecQa => EventType::SpecQaCompleted,
            Stage::RunspecCompile => EventType::RunspecCompiled,
            Stage::TracePreview => EventType::TracePreviewCompleted,
            Stage::DeterministicRun => EventType::RunCompleted,
            Stage::GateRunner => EventType::GatesCompleted,
            Stage::RegistryRecord => EventType::RegistryUpdated,
            Stage::Diagnostics | Stage::RegistryCurator | Stage::Composer | Stage::Report => EventType::ReportCompleted,
            Stage::Sweep => EventType::SweepCompleted,
            Stage::Improvement => EventType::ImprovementsProposed,
        }
    }

    /// Stage an agent's output belongs to, for reruns.
    pub fn of_agent(agent: AgentKind) -> Stage {
        match agent {
            AgentKind::Intent => Stage::Intent,
            AgentKind::StrategySpec => Stage::StrategySpec,
            AgentKind::SpecQa => Stage::SpecQa,
            AgentKind::Backtest | AgentKind::Demo => Stage::TracePreview,
            AgentKind::Report => Stage::Report,
            AgentKind::Improvement => Stage::Improvement,
            AgentKind::Diagnostics => Stage::Diagnostics,
            AgentKind::RegistryCurator => Stage::RegistryCurator,
            AgentKind::Composer => Stage::Composer,
        }
    }

    fn dir_name(&self) -> String {
        match self {
            Stage::RunspecCompile => "runspec".into(),
            Stage::TracePreview => "trace".into(),
            Stage::DeterministicRun => "run".into(),
            Stage::GateRunner => "gates".into(),
            Stage::RegistryRecord => "registry".into(),
            Stage::Sweep => "sweep".into(),
            other => format!("agents/{}", other.id()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PlanStep {
    Run(Stage),
    /// Checkpoint step and the stage whose output it reviews (`None`: the
    /// submission itself).
    Checkpoint(&'static str, Option<Stage>),
    /// Approval required before the stage runs, when the job asks for it.
    Approval(&'static str, Stage),
}

const IDEA_PLAN: &[PlanStep] = &[
    PlanStep::Run(Stage::Intent),
    PlanStep::Checkpoint("blueprint", Some(Stage::Intent)),
    PlanStep::Run(Stage::StrategySpec),
    PlanStep::Checkpoint("strategy_spec", Some(Stage::StrategySpec)),
    PlanStep::Run(Stage::SpecQa),
    PlanStep::Checkpoint("spec_qa", Some(Stage::SpecQa)),
    PlanStep::Run(Stage::RunspecCompile),
    PlanStep::Checkpoint("runspec", Some(Stage::RunspecCompile)),
    PlanStep::Run(Stage::TracePreview),
    PlanStep::Checkpoint("trace_preview", Some(Stage::TracePreview)),
    PlanStep::Run(Stage::DeterministicRun),
    PlanStep::Run(Stage::GateRunner),
    PlanStep::Run(Stage::RegistryRecord),
    PlanStep::Run(Stage::Diagnostics),
    PlanStep::Run(Stage::RegistryCurator),
    PlanStep::Run(Stage::Composer),
    PlanStep::Run(Stage::Report),
    PlanStep::Approval("sweep", Stage::Sweep),
    PlanStep::Run(Stage::Sweep),
    PlanStep::Run(Stage::Improvement),
    PlanStep::Checkpoint("improvements", Some(Stage::Improvement)),
];

const BLUEPRINT_PLAN: &[PlanStep] = &[
    PlanStep::Checkpoint("blueprint", None),
    PlanStep::Run(Stage::RunspecCompile),
    PlanStep::Checkpoint("runspec", Some(Stage::RunspecCompile)),
    PlanStep::Run(Stage::DeterministicRun),
    PlanStep::Run(Stage::GateRunner),
    PlanStep::Run(Stage::RegistryRecord),
    PlanStep::Approval("sweep", Stage::Sweep),
    PlanStep::Run(Stage::Sweep),
];

fn plan_for(kind: JobKind) -> &'static [PlanStep] {
    match kind {
        JobKind::Idea => IDEA_PLAN,
        JobKind::Blueprint => BLUEPRINT_PLAN,
    }
}

/// Steps a human can be asked about for this job kind.
pub fn checkpoint_steps(kind: JobKind) -> Vec<&'static str> {
    let mut steps: Vec<&'static str> = plan_for(kind)
        .iter()
        .filter_map(|s| match s {
            PlanStep::Checkpoint(step, _) | PlanStep::Approval(step, _) => Some(*step),
            PlanStep::Run(_) => None,
        })
        .collect();
    steps.push(STEP_AGENT_OUTPUT_INVALID);
    if kind == JobKind::Idea {
        steps.push(STEP_LLM_LIVE_CONFIRM);
    }
    steps
}

// ---------------------------------------------------------------------------
// state fold
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Rejected,
}

#[derive(Clone, Debug)]
struct Completion {
    index: usize,
    guard_passed: bool,
    skipped: bool,
}

#[derive(Clone, Debug)]
pub struct JobState {
    pub job_id: String,
    pub kind: JobKind,
    pub event_count: usize,
    pub waiting: Option<String>,
    pub done: bool,
    pub stopped_budget: Option<String>,
    pub error: Option<String>,
    pub last_event: Option<String>,
    decisions: BTreeMap<String, (usize, Decision)>,
    rejections: BTreeMap<String, u32>,
    completions: BTreeMap<Stage, Completion>,
    reruns: BTreeMap<Stage, (usize, u32)>,
}

fn event_str<'a>(event: &'a Value, ptr: &str) -> Option<&'a str> {
    event.pointer(ptr).and_then(|v| v.as_str())
}

impl JobState {
    pub fn fold(job_id: &str, kind: JobKind, events: &[Value]) -> JobState {
        let mut state = JobState {
            job_id: job_id.to_string(),
            kind,
            event_count: events.len(),
            waiting: None,
            done: false,
            stopped_budget: None,
            error: None,
            last_event: None,
            decisions: BTreeMap::new(),
            rejections: BTreeMap::new(),
            completions: BTreeMap::new(),
            reruns: BTreeMap::new(),
        };
        for (index, event) in events.iter().enumerate() {
            let Some(event_type) = event_str(event, "/event_type").and_then(EventType::parse) else {
                continue;
            };
            state.last_event = Some(event_type.as_str().to_string());
            let step = event_str(event, "/outputs/step").map(String::from);
            match event_type {
                EventType::WaitingApproval => state.waiting = step,
                EventType::Approved => {
                    if let Some(step) = step {
                        if state.waiting.as_deref() == Some(step.as_str()) {
                            state.waiting = None;
                        }
                        state.decisions.insert(step, (index, Decision::Approved));
                    }
                }
                EventType::Rejected => {
                    if let Some(step) = step {
                        *state.rejections.entry(step.clone()).or_default() += 1;
                        state.decisions.insert(step, (index, Decision::Rejected));
                    }
                }
                EventType::RerunRequested => {
                    if let Some(stage) = event_str(event, "/outputs/stage").and_then(Stage::parse) {
                        let count = state.reruns.get(&stage).map(|(_, n)| *n).unwrap_or(0);
                        state.reruns.insert(stage, (index, count + 1));
                        state.waiting = None;
                    }
                }
                EventType::StoppedBudget => {
                    state.stopped_budget = Some(event_str(event, "/outputs/stop_reason").unwrap_or("budget").to_string())
                }
                EventType::Error => state.error = event.get("message").and_then(|v| v.as_str()).map(String::from),
                EventType::Done => {
                    state.done = true;
                    state.waiting = None;
                }
                other => {
                    if let Some(stage) = event_str(event, "/outputs/stage").and_then(Stage::parse) {
                        if stage.completion_event() == other {
                            state.completions.insert(
                                stage,
                                Completion {
                                    index,
                                    guard_passed: event.pointer("/outputs/guard_passed").and_then(|v| v.as_bool()).unwrap_or(true),
                                    skipped: event.pointer("/outputs/skipped").and_then(|v| v.as_bool()).unwrap_or(false),
                                },
                            );
                        }
                    }
                }
            }
        }
        state
    }

    pub fn load(roots: &EamRoots, job_id: &str) -> Result<JobState> {
        let kind = JobKind::of_spec(&load_job_spec(roots, job_id)?)?;
        Ok(JobState::fold(job_id, kind, &load_job_events(roots, job_id)?))
    }

    /// A rerun of this stage or any earlier one voids its completion.
    fn completion(&self, stage: Stage) -> Option<&Completion> {
        let done = self.completions.get(&stage)?;
        let voided = self
            .reruns
            .iter()
            .any(|(s, (rerun_index, _))| *s <= stage && *rerun_index > done.index);
        if voided {
            None
        } else {
            Some(done)
        }
    }

    pub fn is_complete(&self, stage: Stage) -> bool {
        self.completion(stage).is_some()
    }

    pub fn attempt(&self, stage: Stage) -> u32 {
        self.reruns.get(&stage).map(|(_, n)| n + 1).unwrap_or(1)
    }

    /// Event index of the latest live completion of any stage before `stage`.
    fn settled_before(&self, stage: Stage) -> usize {
        Stage::ALL
            .iter()
            .filter(|s| **s < stage)
            .filter_map(|s| self.completion(*s))
            .map(|c| c.index)
            .max()
            .unwrap_or(0)
    }

    /// Last decision wins and must postdate `after`.
    fn approved_after(&self, step: &str, after: usize) -> bool {
        matches!(self.decisions.get(step), Some((index, Decision::Approved)) if *index > after)
    }

    pub fn status(&self) -> &'static str {
        if self.done {
            if self.stopped_budget.is_some() {
                "stopped_budget"
            } else if self.error.is_some() {
                "error"
            } else {
                "done"
            }
        } else if self.waiting.is_some() {
            "waiting_approval"
        } else {
            "running"
        }
    }

    pub fn to_json(&self) -> Value {
        let completed: Vec<&str> = Stage::ALL.iter().filter(|s| self.is_complete(**s)).map(|s| s.id()).collect();
        json!({
            "job_id": self.job_id,
            "job_kind": self.kind.as_str(),
            "status": self.status(),
            "waiting_step": self.waiting,
            "done": self.done,
            "stop_reason": self.stopped_budget,
            "error": self.error,
            "last_event": self.last_event,
            "event_count": self.event_count,
            "completed_stages": completed,
        })
    }
}

// ---------------------------------------------------------------------------
// decisions
// ---------------------------------------------------------------------------

fn require_waiting(state: &JobState, step: &str) -> Result<()> {
    if state.done {
        return Err(EamError::Usage(format!("job {} is finished", state.job_id)).into());
    }
    match state.waiting.as_deref() {
        Some(waiting) if waiting == step => Ok(()),
        Some(waiting) => Err(EamError::Usage(format!(
            "job {} is waiting on step {}, not {}",
            state.job_id, waiting, step
        ))
        .into()),
        None => Err(EamError::Usage(format!("job {} is not waiting for approval", state.job_id)).into()),
    }
}

pub fn approve(roots: &EamRoots, job_id: &str, step: &str) -> Result<Value> {
    let _lock = lock_job(roots, job_id)?;
    let state = JobState::load(roots, job_id)?;
    require_waiting(&state, step)?;
    let event = append_event(roots, job_id, EventType::Approved, Some(json!({"step": step})), None)?;
    tracing::info!(job_id, step, "step approved");
    Ok(event)
}

/// Record the rejection, point `reject_state.json` at it, and wait on the
/// same step again.
pub fn reject(roots: &EamRoots, job_id: &str, step: &str, note: &str) -> Result<Value> {
    let _lock = lock_job(roots, job_id)?;
    let state = JobState::load(roots, job_id)?;
    require_waiting(&state, step)?;
    let paths = JobPaths::existing(roots, job_id)?;
    let n = state.rejections.get(step).copied().unwrap_or(0) + 1;
    let record_path = paths.outputs.join("rejections").join(format!("{}_{}.json", step, n));
    atomic_write_json_pretty(
        &record_path,
        &json!({
            "schema_version": "rejection_v1",
            "job_id": job_id,
            "step": step,
            "n": n,
            "note": note,
            "recorded_at": eam_core::now_iso(),
        }),
    )?;
    let state_path = paths.outputs.join(REJECT_STATE_FILE);
    atomic_write_json_pretty(
        &state_path,
        &json!({
            "schema_version": "reject_state_v1",
            "job_id": job_id,
            "step": step,
            "rejections": n,
            "last_rejection_path": record_path.display().to_string(),
        }),
    )?;
    let event = append_event(
        roots,
        job_id,
        EventType::Rejected,
        Some(json!({"step": step, "note": note, "rejection_path": record_path.display().to_string()})),
        None,
    )?;
    append_event(roots, job_id, EventType::WaitingApproval, Some(json!({"step": step})), None)?;
    tracing::info!(job_id, step, n, "step rejected");
    Ok(event)
}

/// Void the completion of `agent_id`'s stage so the next advance re-executes
/// it into a fresh attempt directory.
pub fn rerun(roots: &EamRoots, job_id: &str, agent_id: &str) -> Result<Value> {
    let stage = Stage::of_agent(AgentKind::parse(agent_id)?);
    let _lock = lock_job(roots, job_id)?;
    let state = JobState::load(roots, job_id)?;
    if state.done {
        return Err(EamError::Usage(format!("job {} is finished", job_id)).into());
    }
    if state.waiting.is_none() {
        return Err(EamError::Usage(format!("job {} is not waiting for approval", job_id)).into());
    }
    if !state.is_complete(stage) {
        return Err(EamError::Usage(format!("stage {} has not run for job {}", stage.id(), job_id)).into());
    }
    let event = append_event(
        roots,
        job_id,
        EventType::RerunRequested,
        Some(json!({"agent_id": agent_id, "stage": stage.id(), "attempt": state.attempt(stage) + 1})),
        None,
    )?;
    tracing::info!(job_id, agent_id, stage = stage.id(), "rerun requested");
    Ok(event)
}

// ---------------------------------------------------------------------------
// advance
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Action {
    Run(Stage),
    Wait(String, Value),
    Finish,
}

/// Whether a job spec asks for an optional stage.
fn requested(stage: Stage, spec: &Value) -> bool {
    match stage {
        Stage::Sweep => find_sweep_spec(spec).is_some(),
        _ => true,
    }
}

fn next_action(state: &JobState, env: &LlmEnv, spec: &Value) -> Action {
    if state.kind == JobKind::Idea && env.uses_real_provider() && !state.approved_after(STEP_LLM_LIVE_CONFIRM, 0) {
        return Action::Wait(
            STEP_LLM_LIVE_CONFIRM.into(),
            json!({"provider_id": env.provider_id, "mode": env.mode.as_str()}),
        );
    }
    for step in plan_for(state.kind) {
        match step {
            PlanStep::Run(stage) => match state.completion(*stage) {
                None => return Action::Run(*stage),
                Some(done) if !done.guard_passed && !state.approved_after(STEP_AGENT_OUTPUT_INVALID, done.index) => {
                    return Action::Wait(STEP_AGENT_OUTPUT_INVALID.into(), json!({"stage": stage.id()}));
                }
                Some(_) => {}
            },
            PlanStep::Checkpoint(name, anchor) => {
                let after = match anchor {
                    Some(stage) => match state.completion(*stage) {
                        Some(done) if done.skipped => continue,
                        Some(done) => done.index,
                        None => return Action::Run(*stage),
                    },
                    None => 0,
                };
                if !state.approved_after(name, after) {
                    let mut outputs = json!({});
                    if let Some(stage) = anchor {
                        outputs["stage"] = json!(stage.id());
                    }
                    return Action::Wait((*name).to_string(), outputs);
                }
            }
            PlanStep::Approval(name, stage) => {
                if state.completion(*stage).is_some() || !requested(*stage, spec) {
                    continue;
                }
                if !state.approved_after(name, state.settled_before(*stage)) {
                    return Action::Wait((*name).to_string(), json!({"stage": stage.id()}));
                }
            }
        }
    }
    Action::Finish
}

#[derive(Clone, Debug)]
pub struct AdvanceOutcome {
    pub job_id: String,
    pub actions: Vec<String>,
    pub state: JobState,
}

impl AdvanceOutcome {
    pub fn to_json(&self) -> Value {
        let mut v = self.state.to_json();
        v["actions"] = json!(self.actions);
        v
    }
}

/// Advance one job under its lock until it blocks or finishes.
pub fn advance_job_once(roots: &EamRoots, env: &LlmEnv, job_id: &str) -> Result<AdvanceOutcome> {
    let _lock = lock_job(roots, job_id)?;
    advance_locked(roots, env, job_id)
}

/// Visit every job in id order; jobs locked by another worker are skipped.
pub fn advance_all_once(roots: &EamRoots, env: &LlmEnv) -> Result<Vec<AdvanceOutcome>> {
    let mut out = Vec::new();
    for job_id in crate::store::list_job_ids(roots)? {
        let Some(_lock) = try_lock_job(roots, &job_id)? else {
            tracing::debug!(job_id = %job_id, "job locked by another worker; skipping");
            continue;
        };
        if JobState::load(roots, &job_id)?.done {
            continue;
        }
        out.push(advance_locked(roots, env, &job_id)?);
    }
    Ok(out)
}

fn finish_with_error(roots: &EamRoots, job_id: &str, stage: Option<Stage>, err: &anyhow::Error) -> Result<()> {
    let outputs = json!({
        "stage": stage.map(|s| s.id()),
        "code": eam_core::error_code_for(err),
    });
    let message = format!("{:#}", err);
    tracing::warn!(job_id, stage = stage.map(|s| s.id()), error = %message, "stage failed");
    append_event(roots, job_id, EventType::Error, Some(outputs), Some(&message))?;
    append_event(roots, job_id, EventType::Done, None, None)?;
    Ok(())
}

fn finish_with_budget_stop(roots: &EamRoots, job_id: &str, stage: Option<Stage>, reason: &str, report: &Path) -> Result<()> {
    let outputs = json!({
        "stage": stage.map(|s| s.id()),
        "stop_reason": reason,
        "llm_usage_report_path": report.display().to_string(),
    });
    append_event(roots, job_id, EventType::StoppedBudget, Some(outputs), None)?;
    append_event(roots, job_id, EventType::Done, Some(json!({"status": "stopped_budget"})), None)?;
    tracing::warn!(job_id, stage = stage.map(|s| s.id()), stop_reason = %reason, "budget stop");
    Ok(())
}

fn advance_locked(roots: &EamRoots, env: &LlmEnv, job_id: &str) -> Result<AdvanceOutcome> {
    let spec = load_job_spec(roots, job_id)?;
    let paths = JobPaths::existing(roots, job_id)?;
    let usage_report = UsagePaths::for_job(&paths.dir).report;
    let mut actions = Vec::new();
    for _ in 0..MAX_ACTIONS_PER_ADVANCE {
        let state = JobState::load(roots, job_id)?;
        if state.done {
            break;
        }
        // A breach recorded after a completed call stops the job before anything else runs.
        if let (true, reason) = is_budget_stopped(&paths.dir) {
            let reason = reason.unwrap_or_else(|| "budget".into());
            finish_with_budget_stop(roots, job_id, None, &reason, &usage_report)?;
            actions.push("stopped_budget".to_string());
            break;
        }
        if state.waiting.is_some() {
            break;
        }
        if let Some(request) = spec.get("fetch_request") {
            if let Err(err) = preflight_fetch_request(&paths.dir, request) {
                finish_with_error(roots, job_id, None, &err)?;
                actions.push("fetch_request_invalid".to_string());
                break;
            }
        }
        match next_action(&state, env, &spec) {
            Action::Wait(step, mut outputs) => {
                outputs["step"] = json!(step);
                append_event(roots, job_id, EventType::WaitingApproval, Some(outputs), None)?;
                tracing::info!(job_id, step = %step, "waiting for approval");
                actions.push(format!("wait:{}", step));
            }
            Action::Finish => {
                append_event(roots, job_id, EventType::Done, None, None)?;
                tracing::info!(job_id, "job done");
                actions.push("done".to_string());
            }
            Action::Run(stage) => {
                actions.push(format!("run:{}", stage.id()));
                let runner = StageRunner {
                    roots,
                    env,
                    job_id,
                    spec: &spec,
                    paths: &paths,
                    state: &state,
                };
                match runner.run(stage) {
                    Ok(outputs) => {
                        append_event(roots, job_id, stage.completion_event(), Some(Value::Object(outputs)), None)?;
                        tracing::info!(job_id, stage = stage.id(), "stage completed");
                    }
                    Err(err) => match err.downcast_ref::<EamError>() {
                        Some(EamError::BudgetBreach(reason)) => {
                            finish_with_budget_stop(roots, job_id, Some(stage), reason, &usage_report)?
                        }
                        _ => finish_with_error(roots, job_id, Some(stage), &err)?,
                    },
                }
            }
        }
    }
    Ok(AdvanceOutcome {
        job_id: job_id.to_string(),
        actions,
        state: JobState::load(roots, job_id)?,
    })
}

// ---------------------------------------------------------------------------
// stages
// ---------------------------------------------------------------------------

struct StageRunner<'a> {
    roots: &'a EamRoots,
    env: &'a LlmEnv,
    job_id: &'a str,
    spec: &'a Value,
    paths: &'a JobPaths,
    state: &'a JobState,
}

fn path_str(p: &Path) -> Value {
    json!(p.display().to_string())
}

/// Collects output pointers for the index and the completion event.
struct StageOutputs {
    stage: Stage,
    attempt: u32,
    index: Map<String, Value>,
    extra: Map<String, Value>,
    guard_passed: bool,
}

impl StageOutputs {
    fn new(stage: Stage, attempt: u32) -> Self {
        StageOutputs {
            stage,
            attempt,
            index: Map::new(),
            extra: Map::new(),
            guard_passed: true,
        }
    }

    fn pointer(&mut self, key: &str, path: &Path) -> &mut Self {
        self.index.insert(key.to_string(), path_str(path));
        self
    }

    fn value(&mut self, key: &str, value: Value) -> &mut Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    fn agent(&mut self, res: &AgentRunResult) -> &mut Self {
        for (key, path) in &res.outputs {
            self.index.insert(key.clone(), path_str(path));
        }
        self.guard_passed &= res.guard_passed;
        self.extra
            .insert(format!("{}_run", res.agent_id), path_str(&res.out_dir.join(eam_agents::AGENT_RUN_FILE)));
        self
    }
}

impl<'a> StageRunner<'a> {
    fn bundle_path(&self) -> PathBuf {
        bundle_path_for(self.roots, self.spec)
    }

    fn stage_dir(&self, stage: Stage) -> PathBuf {
        let base = self.paths.outputs.join(stage.dir_name());
        match self.state.attempt(stage) {
            1 => base,
            n => base.join(format!("attempt_{}", n)),
        }
    }

    fn indexed(&self, key: &str) -> Result<Value> {
        let index = load_outputs_index(self.roots, self.job_id)?;
        let path = index
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| EamError::NotFound(format!("job {} has no {} output yet", self.job_id, key)))?;
        read_json(Path::new(path))
    }

    fn indexed_str(&self, key: &str) -> Result<String> {
        load_outputs_index(self.roots, self.job_id)?
            .get(key)
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| EamError::NotFound(format!("job {} has no {} output yet", self.job_id, key)).into())
    }

    fn blueprint(&self) -> Result<Value> {
        match self.state.kind {
            JobKind::Idea => self.indexed("blueprint_final"),
            JobKind::Blueprint => self
                .spec
                .get("blueprint")
                .cloned()
                .ok_or_else(|| EamError::InvalidContract("job_spec at /blueprint: required".into()).into()),
        }
    }

    fn snapshot_id(&self) -> Result<String> {
        self.spec
            .get("snapshot_id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| EamError::InvalidContract("job spec at /snapshot_id: required".into()).into())
    }

    /// One harness call; a pre-call budget stop surfaces as `BudgetBreach`.
    fn agent(&self, out: &mut StageOutputs, agent: AgentKind, input: &Value, out_dir: &Path) -> Result<AgentRunResult> {
        let input_path = out_dir.join("agent_input.json");
        atomic_write_json_pretty(&input_path, input)?;
        let bundle = self.bundle_path();
        let res = eam_agents::run_agent(
            self.roots,
            self.env,
            &AgentRunRequest {
                agent_id: agent.id(),
                input_path: &input_path,
                out_dir,
                job_id: Some(self.job_id),
                bundle_path: Some(&bundle),
            },
        )?;
        if res.budget_stopped {
            let reason = res.stop_reason.clone().unwrap_or_else(|| "budget".into());
            return Err(EamError::BudgetBreach(reason).into());
        }
        out.agent(&res);
        Ok(res)
    }

    fn gate_summary(&self) -> Result<Value> {
        self.indexed("gate_summary")
    }

    fn run(&self, stage: Stage) -> Result<Map<String, Value>> {
        let dir = self.stage_dir(stage);
        let mut out = StageOutputs::new(stage, self.state.attempt(stage));
        match stage {
            Stage::Intent => {
                self.agent(&mut out, AgentKind::Intent, self.spec, &dir)?;
            }
            Stage::StrategySpec => {
                let input = json!({"idea": self.spec, "blueprint_draft": self.indexed("blueprint_draft")?});
                self.agent(&mut out, AgentKind::StrategySpec, &input, &dir)?;
            }
            Stage::SpecQa => {
                let mut input = Map::new();
                for key in ["blueprint_final", "signal_dsl", "variable_dictionary", "calc_trace_plan"] {
                    input.insert(key.to_string(), self.indexed(key)?);
                }
                let res = self.agent(&mut out, AgentKind::SpecQa, &Value::Object(input), &dir)?;
                if let Some(path) = res.outputs.get("spec_qa_report") {
                    let report = read_json(path)?;
                    out.value("qa_status", report.get("status").cloned().unwrap_or(Value::Null));
                }
            }
            Stage::RunspecCompile => {
                let compiled = compile_blueprint(&self.blueprint()?, &self.bundle_path(), &self.snapshot_id()?)?;
                ensure_valid(&compiled.runspec)?;
                let path = dir.join("runspec.json");
                atomic_write_json_pretty(&path, &compiled.runspec)?;
                out.pointer("runspec", &path).value("run_id", json!(compiled.run_id));
                tracing::info!(job_id = self.job_id, run_id = %compiled.run_id, "runspec compiled");
            }
            Stage::TracePreview => {
                let runspec = self.indexed("runspec")?;
                let run_id = eam_runner::compiler::runspec_run_id(&runspec);
                let backtest_input = json!({"runspec": runspec, "run_id": run_id});
                self.agent(&mut out, AgentKind::Backtest, &backtest_input, &dir.join("backtest"))?;
                let demo_input = json!({"blueprint_final": self.blueprint()?});
                self.agent(&mut out, AgentKind::Demo, &demo_input, &dir.join("demo"))?;

                let test = runspec_anchor(&runspec, SegmentKind::Test)?
                    .ok_or_else(|| EamError::InvalidContract("runspec at /segments/test: required".into()))?;
                let lag_bars = ResolvedPolicies::load(&self.bundle_path())?.asof_params()?.lag_bars();
                let signal_dsl = self.indexed("signal_dsl")?;
                let trace_plan = self.indexed("calc_trace_plan")?;
                let (as_of, start, end) = (format_ts(&test.as_of), test.start.to_string(), test.end.to_string());
                let snapshot_id = self.snapshot_id()?;
                let preview = run_calc_trace_preview(
                    &dir.join("calc_trace"),
                    &self.roots.data_root,
                    &TracePreviewInput {
                        snapshot_id: &snapshot_id,
                        as_of: &as_of,
                        start: &start,
                        end: &end,
                        symbols: runspec_symbols(&runspec),
                        signal_dsl: &signal_dsl,
                        trace_plan: &trace_plan,
                        lag_bars,
                    },
                )?;
                out.pointer("calc_trace_preview", &preview.csv_path)
                    .pointer("trace_meta", &preview.meta_path);
            }
            Stage::DeterministicRun => {
                let runspec = self.indexed("runspec")?;
                if let Some(request) = self.spec.get("fetch_request") {
                    let fetched = execute_fetch(&self.paths.dir, &self.roots.data_root, request, &runspec)?;
                    out.pointer("fetch_steps_index", &fetched.steps_index)
                        .value("fetch", fetched.to_json());
                }
                let outcome = run_runspec(
                    &runspec,
                    &self.bundle_path(),
                    &self.roots.data_root,
                    &self.roots.dossiers_dir(),
                    ExistsBehavior::Noop,
                )?;
                let synced = sync_fetch_to_dossier(&self.paths.dir, &outcome.dossier_dir)?;
                out.pointer("dossier", &outcome.dossier_dir)
                    .pointer("metrics", &outcome.dossier_dir.join("metrics.json"))
                    .value("run_id", json!(outcome.run_id))
                    .value("run_status", json!(outcome.status))
                    .value("fetch_synced", json!(synced));
                out.index.insert("run_id".into(), json!(outcome.run_id));
            }
            Stage::GateRunner => {
                let dossier = PathBuf::from(self.indexed_str("dossier")?);
                let bundle = self.bundle_path();
                let report = run_gates(&GateRunInput {
                    dossier_dir: &dossier,
                    bundle_path: &bundle,
                    data_root: &self.roots.data_root,
                    artifact_root: &self.roots.artifact_root,
                    job_root: &self.roots.job_root,
                })?;
                if report.invalid {
                    return Err(EamError::GateInvalid(format!("gate suite {} reported invalid results", report.gate_suite_id)).into());
                }
                let results: Vec<Value> = report
                    .gates
                    .iter()
                    .map(|g| json!({"gate_id": g["gate_id"], "status": g["status"], "pass": g["pass"]}))
                    .collect();
                let summary = json!({
                    "run_id": report.run_id,
                    "gate_suite_id": report.gate_suite_id,
                    "overall_pass": report.overall_pass,
                    "results": results,
                });
                let path = dir.join("gate_summary.json");
                atomic_write_json_pretty(&path, &summary)?;
                out.pointer("gate_summary", &path)
                    .pointer("gate_results", &report.gate_results_path)
                    .value("overall_pass", json!(report.overall_pass));
            }
            Stage::RegistryRecord => {
                let dossier = PathBuf::from(self.indexed_str("dossier")?);
                let trial = record_trial(&dossier, &self.roots.registry_root, ExistsBehavior::Noop)?;
                let path = dir.join("trial_event.json");
                atomic_write_json_pretty(&path, &trial)?;
                out.pointer("trial_event", &path)
                    .value("run_id", trial.get("run_id").cloned().unwrap_or(Value::Null));
            }
            Stage::Diagnostics | Stage::Report => {
                let input = json!({
                    "run_id": self.indexed_str("run_id")?,
                    "metrics": self.indexed("metrics")?,
                    "gate_summary": self.gate_summary()?,
                });
                let kind = if stage == Stage::Report { AgentKind::Report } else { AgentKind::Diagnostics };
                self.agent(&mut out, kind, &input, &dir)?;
            }
            Stage::RegistryCurator => {
                let summary = self.gate_summary()?;
                let input = json!({
                    "run_id": self.indexed_str("run_id")?,
                    "overall_pass": summary.get("overall_pass").cloned().unwrap_or(json!(false)),
                    "trial_recorded": self.state.is_complete(Stage::RegistryRecord),
                });
                self.agent(&mut out, AgentKind::RegistryCurator, &input, &dir)?;
            }
            Stage::Composer => {
                let run_id = self.indexed_str("run_id")?;
                let cards: Vec<Value> = list_cards(&self.roots.registry_root)?
                    .into_iter()
                    .filter(|c| c.get("primary_run_id").and_then(|v| v.as_str()) == Some(run_id.as_str()))
                    .map(|c| json!({"card_id": c["card_id"], "status": c["status"]}))
                    .collect();
                let input = json!({"run_id": run_id, "cards": cards});
                self.agent(&mut out, AgentKind::Composer, &input, &dir)?;
            }
            Stage::Sweep => {
                let Some(doc) = find_sweep_spec(self.spec) else {
                    out.value("skipped", json!(true)).value("skip_reason", json!("no_sweep_spec"));
                    return self.finish(out);
                };
                let spec = SweepSpec::parse(doc)?;
                let runspec = self.indexed("runspec")?;
                let bundle = self.bundle_path();
                let outcome = run_sweep(&SweepInput {
                    job_id: self.job_id,
                    spec: &spec,
                    base_runspec: &runspec,
                    bundle_path: &bundle,
                    data_root: &self.roots.data_root,
                    artifact_root: &self.roots.artifact_root,
                    job_root: &self.roots.job_root,
                    out_dir: &dir,
                })?;
                out.pointer("sweep_trials_path", &outcome.trials_path)
                    .pointer("sweep_leaderboard_path", &outcome.leaderboard_path)
                    .value("sweep_metric", json!(spec.metric))
                    .value("trials_recorded", json!(outcome.trials_recorded))
                    .value("sweep_stopped", outcome.stopped.clone().unwrap_or(Value::Null));
                tracing::info!(job_id = self.job_id, trials = outcome.trials_recorded, status = %outcome.status, "sweep finished");
            }
            Stage::Improvement => {
                let budget = budget_params(self.roots, self.spec)?;
                let depth = lineage_depth(self.spec);
                if let Some(b) = &budget {
                    if depth >= b.max_total_iterations {
                        tracing::info!(job_id = self.job_id, depth, "lineage at max_total_iterations; no proposals");
                        out.value("skipped", json!(true)).value("skip_reason", json!("max_total_iterations"));
                        return self.finish(out);
                    }
                }
                let input = json!({
                    "base_job_id": self.job_id,
                    "base_run_id": self.indexed_str("run_id")?,
                    "blueprint_final": self.blueprint()?,
                    "max_proposals": budget.map(|b| b.max_proposals_per_job).unwrap_or(eam_agents::agents::DEFAULT_MAX_PROPOSALS as u64),
                });
                self.agent(&mut out, AgentKind::Improvement, &input, &dir)?;
            }
        }
        self.finish(out)
    }

    /// Persist index pointers and build the completion event's outputs.
    fn finish(&self, out: StageOutputs) -> Result<Map<String, Value>> {
        if !out.index.is_empty() {
            write_outputs_index(self.roots, self.job_id, &out.index)?;
        }
        let mut outputs = out.extra;
        outputs.insert("stage".into(), json!(out.stage.id()));
        outputs.insert("attempt".into(), json!(out.attempt));
        outputs.insert("guard_passed".into(), json!(out.guard_passed));
        outputs.insert("artifacts".into(), Value::Object(out.index));
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{example, ingest_demo, repo_root, test_roots};
    use crate::store::{create_job_from_blueprint, create_job_from_idea};
    use eam_agents::LlmMode;
    use eam_core::scratch_dir;
    use std::fs;

    fn mock_env() -> LlmEnv {
        LlmEnv::mock(LlmMode::Live)
    }

    fn event_types(roots: &EamRoots, job_id: &str) -> Vec<String> {
        load_job_events(roots, job_id)
            .expect("events")
            .iter()
            .map(|e| e["event_type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn approve_waiting(roots: &EamRoots, env: &LlmEnv, job_id: &str, step: &str) -> AdvanceOutcome {
        approve(roots, job_id, step).expect("approve");
        advance_job_once(roots, env, job_id).expect("advance")
    }

    #[test]
    fn idea_job_stops_at_blueprint_checkpoint_then_strategy_spec() {
        let root = scratch_dir("eam_workflow_idea_test");
        let roots = test_roots(&root);
        let env = mock_env();
        let job = create_job_from_idea(&roots, &example("idea_spec_ok.json")).expect("create");

        let first = advance_job_once(&roots, &env, &job.job_id).expect("advance");
        assert_eq!(first.state.waiting.as_deref(), Some("blueprint"));
        let draft = read_json(&roots.job_dir(&job.job_id).join("outputs/agents/intent/blueprint_draft.json")).expect("draft");
        eam_schemas::ensure_valid(&draft).expect("draft is a valid blueprint");

        let again = advance_job_once(&roots, &env, &job.job_id).expect("idle advance");
        assert!(again.actions.is_empty());

        let err = approve(&roots, &job.job_id, "runspec").expect_err("wrong step");
        assert!(err.to_string().contains("waiting on step blueprint"), "unexpected: {}", err);

        let next = approve_waiting(&roots, &env, &job.job_id, "blueprint");
        assert_eq!(next.state.waiting.as_deref(), Some("strategy_spec"));
        assert!(next.state.is_complete(Stage::StrategySpec));
        assert_eq!(
            event_types(&roots, &job.job_id),
            vec![
                "IDEA_SUBMITTED",
                "BLUEPRINT_PROPOSED",
                "WAITING_APPROVAL",
                "APPROVED",
                "STRATEGY_SPEC_PROPOSED",
                "WAITING_APPROVAL"
            ]
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn reject_requires_fresh_approval_and_rerun_uses_attempt_dir() {
        let root = scratch_dir("eam_workflow_reject_test");
        let roots = test_roots(&root);
        let env = mock_env();
        let job = create_job_from_idea(&roots, &example("idea_spec_ok.json")).expect("create");
        advance_job_once(&roots, &env, &job.job_id).expect("advance");

        reject(&roots, &job.job_id, "blueprint", "needs a longer window").expect("reject");
        let outputs = roots.job_dir(&job.job_id).join("outputs");
        assert!(outputs.join("rejections/blueprint_1.json").is_file());
        let reject_state = read_json(&outputs.join(REJECT_STATE_FILE)).expect("reject state");
        assert_eq!(reject_state["schema_version"], "reject_state_v1");
        let state = advance_job_once(&roots, &env, &job.job_id).expect("advance").state;
        assert_eq!(state.waiting.as_deref(), Some("blueprint"));

        rerun(&roots, &job.job_id, "intent_agent_v1").expect("rerun");
        let after = advance_job_once(&roots, &env, &job.job_id).expect("advance");
        assert_eq!(after.state.waiting.as_deref(), Some("blueprint"));
        assert_eq!(after.state.attempt(Stage::Intent), 2);
        assert!(outputs.join("agents/intent/attempt_2/blueprint_draft.json").is_file());
        let index = load_outputs_index(&roots, &job.job_id).expect("index");
        assert!(index["blueprint_draft"].as_str().unwrap_or_default().contains("attempt_2"));

        let err = rerun(&roots, &job.job_id, "report_agent_v1").expect_err("not run yet");
        assert!(err.to_string().contains("has not run"), "unexpected: {}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn blueprint_job_runs_to_done() {
        let root = scratch_dir("eam_workflow_blueprint_test");
        let roots = test_roots(&root);
        ingest_demo(&roots);
        let env = mock_env();
        let job = create_job_from_blueprint(
            &roots,
            &example("blueprint_ok.json"),
            "demo_snap_001",
            "policies/policy_bundle_v1.yaml",
            Some(&example("fetch_request_ok.json")),
        )
        .expect("create");
        let first = advance_job_once(&roots, &env, &job.job_id).expect("advance");
        assert_eq!(first.state.waiting.as_deref(), Some("blueprint"));
        let second = approve_waiting(&roots, &env, &job.job_id, "blueprint");
        assert_eq!(second.state.waiting.as_deref(), Some("runspec"));
        let done = approve_waiting(&roots, &env, &job.job_id, "runspec");
        assert!(done.state.done, "unexpected: {}", done.to_json());
        assert_eq!(done.state.error, None);

        let types = event_types(&roots, &job.job_id);
        for t in ["RUNSPEC_COMPILED", "RUN_COMPLETED", "GATES_COMPLETED", "REGISTRY_UPDATED", "DONE"] {
            assert!(types.contains(&t.to_string()), "missing {} in {:?}", t, types);
        }
        let dossier = PathBuf::from(load_outputs_index(&roots, &job.job_id).expect("index")["dossier"].as_str().expect("dossier").to_string());
        assert!(dossier.join("fetch/fetch_steps_index.json").is_file());
        assert_eq!(eam_runner::registry::list_trials(&roots.registry_root).expect("trials").len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    /// Demo blueprint with a close-above-SMA strategy and a window sweep.
    fn sweep_blueprint() -> Value {
        let mut bp = example("blueprint_ok.json");
        bp["blueprint_id"] = json!("bp_demo_sma_sweep");
        bp["strategy_spec"]["extensions"]["strategy_id"] = json!("close_above_sma_sweep_v1");
        bp["strategy_spec"]["params"] = json!({"window": 2});
        bp["strategy_spec"]["expressions"] = json!({
            "ma": {"op": "sma", "of": {"op": "col", "field": "close"}, "window": {"param": "window"}},
            "entry_all": {"op": "gt", "left": {"op": "col", "field": "close"}, "right": {"op": "ref", "name": "ma"}},
            "exit_none": {"op": "not", "of": {"op": "ref", "name": "entry_all"}}
        });
        bp["extensions"]["sweep_spec"] = json!({
            "param_grid": {"window": [3, 2]},
            "metric": "total_return",
            "stop_if_no_improvement_n": 5
        });
        bp
    }

    #[test]
    fn sweep_waits_for_approval_then_records_trials() {
        let root = scratch_dir("eam_workflow_sweep_test");
        let roots = test_roots(&root);
        ingest_demo(&roots);
        let env = mock_env();
        let job = create_job_from_blueprint(&roots, &sweep_blueprint(), "demo_snap_001", "policies/policy_bundle_v1.yaml", None)
            .expect("create");
        advance_job_once(&roots, &env, &job.job_id).expect("advance");
        approve_waiting(&roots, &env, &job.job_id, "blueprint");
        let before = approve_waiting(&roots, &env, &job.job_id, "runspec");
        assert_eq!(before.state.waiting.as_deref(), Some("sweep"), "unexpected: {}", before.to_json());
        assert!(before.state.is_complete(Stage::RegistryRecord));
        let sweep_dir = roots.job_dir(&job.job_id).join("outputs/sweep");
        assert!(!sweep_dir.join(eam_runner::sweep::TRIALS_FILE).exists());

        let done = approve_waiting(&roots, &env, &job.job_id, "sweep");
        assert!(done.state.done, "unexpected: {}", done.to_json());
        assert_eq!(done.state.error, None);
        let index = load_outputs_index(&roots, &job.job_id).expect("index");
        let trials_path = PathBuf::from(index["sweep_trials_path"].as_str().expect("trials path"));
        assert_eq!(trials_path, sweep_dir.join(eam_runner::sweep::TRIALS_FILE));
        let trials = eam_core::read_jsonl(&trials_path).expect("trials");
        assert_eq!(trials.len(), 2);
        assert_eq!(trials[0]["params"], json!({"window": 2}));
        let board = read_json(Path::new(index["sweep_leaderboard_path"].as_str().expect("board path"))).expect("board");
        assert_eq!(board["job_id"], job.job_id.as_str());
        assert_eq!(board["metric"], "total_return");

        let event = load_job_events(&roots, &job.job_id)
            .expect("events")
            .into_iter()
            .find(|e| e["event_type"] == "SWEEP_COMPLETED")
            .expect("sweep event");
        assert_eq!(event["outputs"]["sweep_metric"], "total_return");
        assert_eq!(event["outputs"]["trials_recorded"], 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn sweep_checkpoint_only_applies_when_requested() {
        let ev = |t: &str, outputs: Value| json!({"event_type": t, "outputs": outputs});
        let mut events = vec![
            ev("BLUEPRINT_SUBMITTED", json!({})),
            ev("WAITING_APPROVAL", json!({"step": "blueprint"})),
            ev("APPROVED", json!({"step": "blueprint"})),
            ev("RUNSPEC_COMPILED", json!({"stage": "runspec_compile"})),
            ev("WAITING_APPROVAL", json!({"step": "runspec"})),
            ev("APPROVED", json!({"step": "runspec"})),
            ev("RUN_COMPLETED", json!({"stage": "deterministic_run"})),
            ev("GATES_COMPLETED", json!({"stage": "gate_runner"})),
            ev("REGISTRY_UPDATED", json!({"stage": "registry_record"})),
        ];
        let with_sweep = json!({"blueprint": sweep_blueprint()});
        let state = JobState::fold("job1", JobKind::Blueprint, &events);
        assert_eq!(next_action(&state, &mock_env(), &json!({})), Action::Run(Stage::Sweep));
        assert_eq!(
            next_action(&state, &mock_env(), &with_sweep),
            Action::Wait("sweep".into(), json!({"stage": "sweep"}))
        );

        events.push(ev("WAITING_APPROVAL", json!({"step": "sweep"})));
        events.push(ev("APPROVED", json!({"step": "sweep"})));
        let state = JobState::fold("job1", JobKind::Blueprint, &events);
        assert_eq!(next_action(&state, &mock_env(), &with_sweep), Action::Run(Stage::Sweep));

        events.push(ev("SWEEP_COMPLETED", json!({"stage": "sweep"})));
        let state = JobState::fold("job1", JobKind::Blueprint, &events);
        assert_eq!(next_action(&state, &mock_env(), &with_sweep), Action::Finish);
        assert!(checkpoint_steps(JobKind::Blueprint).contains(&"sweep"));
    }

    #[test]
    fn invalid_fetch_request_stops_before_dispatch() {
        let root = scratch_dir("eam_workflow_fetch_test");
        let roots = test_roots(&root);
        let bad = json!({"intent": {"asset": "stock", "start": "2024-01-01", "end": "2024-01-10"}});
        let job = create_job_from_blueprint(&roots, &example("blueprint_ok.json"), "demo_snap_001", "policies/policy_bundle_v1.yaml", Some(&bad))
            .expect("create");
        let outcome = advance_job_once(&roots, &mock_env(), &job.job_id).expect("advance");
        assert!(outcome.state.done);
        assert_eq!(event_types(&roots, &job.job_id), vec!["BLUEPRINT_SUBMITTED", "ERROR", "DONE"]);
        let events = load_job_events(&roots, &job.job_id).expect("events");
        assert!(events[1]["message"].as_str().unwrap_or_default().starts_with("FETCH_REQUEST_INVALID"));
        assert!(roots
            .job_dir(&job.job_id)
            .join("outputs/fetch/fetch_request_validation_error.json")
            .is_file());
        let _ = fs::remove_dir_all(root);
    }

    /// Policy copy under `root` with one llm budget line replaced.
    fn budget_bundle(root: &Path, from: &str, to: &str) -> PathBuf {
        let dir = root.join("policies");
        eam_core::copy_tree(&repo_root().join("policies"), &dir).expect("copy policies");
        fs::remove_file(dir.join(eam_runner::policies::LOCK_FILE)).expect("drop lock");
        let budget = dir.join("llm_budget_policy_v1.yaml");
        let text = fs::read_to_string(&budget).expect("budget yaml");
        assert!(text.contains(from), "budget policy has no line {}", from);
        fs::write(&budget, text.replace(from, to)).expect("write budget");
        dir.join("policy_bundle_v1.yaml")
    }

    fn idea_with_bundle(roots: &EamRoots, bundle: &Path) -> String {
        let mut idea = example("idea_spec_ok.json");
        idea["policy_bundle_path"] = json!(bundle.display().to_string());
        create_job_from_idea(roots, &idea).expect("create").job_id
    }

    fn stop_event(roots: &EamRoots, job_id: &str) -> Value {
        load_job_events(roots, job_id)
            .expect("events")
            .into_iter()
            .find(|e| e["event_type"] == "STOPPED_BUDGET")
            .expect("stop event")
    }

    #[test]
    fn budget_of_one_call_stops_after_first_agent() {
        let root = scratch_dir("eam_workflow_budget_test");
        let roots = test_roots(&root);
        let env = mock_env();
        let bundle = budget_bundle(&root, "max_calls_per_job: 50", "max_calls_per_job: 1");
        let mut idea = example("idea_spec_ok.json");
        idea["policy_bundle_path"] = json!(bundle.display().to_string());
        let job = create_job_from_idea(&roots, &idea).expect("create");

        advance_job_once(&roots, &env, &job.job_id).expect("advance");
        let done = approve_waiting(&roots, &env, &job.job_id, "blueprint");
        assert!(done.state.done);
        assert_eq!(done.state.stopped_budget.as_deref(), Some("exceeded_max_calls_per_job"));
        let types = event_types(&roots, &job.job_id);
        assert_eq!(&types[types.len() - 2..], &["STOPPED_BUDGET".to_string(), "DONE".to_string()]);

        let calls = eam_core::read_jsonl(&roots.job_dir(&job.job_id).join("outputs/agents/intent/llm_calls.jsonl")).expect("calls");
        assert_eq!(calls.len(), 1);
        assert!(!roots.job_dir(&job.job_id).join("outputs/agents/strategy_spec/llm_calls.jsonl").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn response_breach_after_call_stops_job_before_checkpoint() {
        let root = scratch_dir("eam_workflow_response_budget_test");
        let roots = test_roots(&root);
        let bundle = budget_bundle(&root, "max_response_chars_per_job: 2000000", "max_response_chars_per_job: 10");
        let job_id = idea_with_bundle(&roots, &bundle);

        let outcome = advance_job_once(&roots, &mock_env(), &job_id).expect("advance");
        assert!(outcome.state.done, "unexpected: {}", outcome.to_json());
        assert_eq!(outcome.state.waiting, None);
        assert_eq!(outcome.state.status(), "stopped_budget");
        assert_eq!(outcome.state.stopped_budget.as_deref(), Some("exceeded_max_response_chars_per_job"));
        assert_eq!(
            event_types(&roots, &job_id),
            vec!["IDEA_SUBMITTED", "BLUEPRINT_PROPOSED", "STOPPED_BUDGET", "DONE"]
        );
        let stop = stop_event(&roots, &job_id);
        let report = PathBuf::from(stop["outputs"]["llm_usage_report_path"].as_str().expect("report path"));
        assert!(report.is_file());
        assert_eq!(read_json(&report).expect("report")["stopped"], true);

        let again = advance_job_once(&roots, &mock_env(), &job_id).expect("idle advance");
        assert!(again.actions.is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn prompt_breach_blocks_the_first_call() {
        let root = scratch_dir("eam_workflow_prompt_budget_test");
        let roots = test_roots(&root);
        let bundle = budget_bundle(&root, "max_prompt_chars_per_job: 2000000", "max_prompt_chars_per_job: 10");
        let job_id = idea_with_bundle(&roots, &bundle);

        let outcome = advance_job_once(&roots, &mock_env(), &job_id).expect("advance");
        assert!(outcome.state.done);
        assert_eq!(outcome.state.status(), "stopped_budget");
        assert_eq!(outcome.state.stopped_budget.as_deref(), Some("exceeded_max_prompt_chars_per_job"));
        assert_eq!(event_types(&roots, &job_id), vec!["IDEA_SUBMITTED", "STOPPED_BUDGET", "DONE"]);
        assert_eq!(stop_event(&roots, &job_id)["outputs"]["stage"], "intent");
        let intent = roots.job_dir(&job_id).join("outputs/agents/intent");
        assert!(intent.join(eam_agents::usage::BUDGET_STOP_FILE).is_file());
        assert!(!intent.join("llm_calls.jsonl").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn events_are_append_only_across_advances() {
        let root = scratch_dir("eam_workflow_append_only_test");
        let roots = test_roots(&root);
        let env = mock_env();
        let job = create_job_from_idea(&roots, &example("idea_spec_ok.json")).expect("create");
        let events_path = roots.job_dir(&job.job_id).join(crate::store::EVENTS_FILE);
        let mut previous = fs::read(&events_path).expect("events");
        advance_job_once(&roots, &env, &job.job_id).expect("advance");
        for step in ["blueprint", "strategy_spec"] {
            let now = fs::read(&events_path).expect("events");
            assert_eq!(&now[..previous.len()], &previous[..]);
            previous = now;
            approve_waiting(&roots, &env, &job.job_id, step);
        }
        let last = fs::read(&events_path).expect("events");
        assert_eq!(&last[..previous.len()], &previous[..]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn fold_voids_downstream_completions_on_rerun() {
        let ev = |t: &str, outputs: Value| json!({"event_type": t, "outputs": outputs});
        let events = vec![
            ev("IDEA_SUBMITTED", json!({})),
            ev("BLUEPRINT_PROPOSED", json!({"stage": "intent"})),
            ev("WAITING_APPROVAL", json!({"step": "blueprint"})),
            ev("APPROVED", json!({"step": "blueprint"})),
            ev("STRATEGY_SPEC_PROPOSED", json!({"stage": "strategy_spec", "guard_passed": false})),
            ev("WAITING_APPROVAL", json!({"step": "agent_output_invalid"})),
            ev("RERUN_REQUESTED", json!({"stage": "intent"})),
        ];
        let state = JobState::fold("job1", JobKind::Idea, &events);
        assert!(state.waiting.is_none());
        assert!(!state.is_complete(Stage::Intent));
        assert!(!state.is_complete(Stage::StrategySpec));
        assert_eq!(next_action(&state, &mock_env(), &json!({})), Action::Run(Stage::Intent));

        let state = JobState::fold("job1", JobKind::Idea, &events[..5]);
        assert_eq!(
            next_action(&state, &mock_env(), &json!({})),
            Action::Wait(STEP_AGENT_OUTPUT_INVALID.into(), json!({"stage": "strategy_spec"}))
        );
    }
}
