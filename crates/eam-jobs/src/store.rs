//! Job directories: immutable spec, append-only events, output pointers.
//!
//! ```text
//! jobs/<job_id>/job_spec.json
//!               events.jsonl
//!               inputs/
//!               outputs/outputs.json
//!               .lock
//! ```

use anyhow::Result;
use eam_core::{
    acquire_exclusive_lock, append_jsonl, atomic_write_json_pretty, ensure_dir, is_safe_id, now_iso, read_json,
    read_json_object, read_jsonl, short_digest, EamError, EamRoots, ExclusiveLock,
};
use eam_runner::policies::{find_inline_policy_keys, BudgetParams, ResolvedPolicies};
use eam_schemas::ensure_valid;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const JOB_SPEC_FILE: &str = "job_spec.json";
pub const EVENTS_FILE: &str = "events.jsonl";
pub const OUTPUTS_INDEX_FILE: &str = "outputs.json";
pub const JOB_LOCK_FILE: &str = ".lock";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    IdeaSubmitted,
    BlueprintSubmitted,
    BlueprintProposed,
    StrategySpecProposed,
    SpecQaCompleted,
    RunspecCompiled,
    TracePreviewCompleted,
    WaitingApproval,
    Approved,
    Rejected,
    RerunRequested,
    RunCompleted,
    GatesCompleted,
    RegistryUpdated,
    ReportCompleted,
    SweepCompleted,
    ImprovementsProposed,
    Spawned,
    StoppedBudget,
    Error,
    Done,
}

impl EventType {
    pub const ALL: [EventType; 21] = [
        EventType::IdeaSubmitted,
        EventType::BlueprintSubmitted,
        EventType::BlueprintProposed,
        EventType::StrategySpecProposed,
        EventType::SpecQaCompleted,
        EventType::RunspecCompiled,
        EventType::TracePreviewCompleted,
        EventType::WaitingApproval,
        EventType::Approved,
        EventType::Rejected,
        EventType::RerunRequested,
        EventType::RunCompleted,
        EventType::GatesCompleted,
        EventType::RegistryUpdated,
        EventType::ReportCompleted,
        EventType::SweepCompleted,
        EventType::ImprovementsProposed,
        EventType::Spawned,
        EventType::StoppedBudget,
        EventType::Error,
        EventType::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::IdeaSubmitted => "IDEA_SUBMITTED",
            EventType::BlueprintSubmitted => "BLUEPRINT_SUBMITTED",
            EventType::BlueprintProposed => "BLUEPRINT_PROPOSED",
            EventType::StrategySpecProposed => "STRATEGY_SPEC_PROPOSED",
            EventType::SpecQaCompleted => "SPEC_QA_COMPLETED",
            EventType::RunspecCompiled => "RUNSPEC_COMPILED",
            EventType::TracePreviewCompleted => "TRACE_PREVIEW_COMPLETED",
            EventType::WaitingApproval => "WAITING_APPROVAL",
            EventType::Approved => "APPROVED",
            EventType::Rejected => "REJECTED",
            EventType::RerunRequested => "RERUN_REQUESTED",
            EventType::RunCompleted => "RUN_COMPLETED",
            EventType::GatesCompleted => "GATES_COMPLETED",
            EventType::RegistryUpdated => "REGISTRY_UPDATED",
            EventType::ReportCompleted => "REPORT_COMPLETED",
            EventType::SweepCompleted => "SWEEP_COMPLETED",
            EventType::ImprovementsProposed => "IMPROVEMENTS_PROPOSED",
            EventType::Spawned => "SPAWNED",
            EventType::StoppedBudget => "STOPPED_BUDGET",
            EventType::Error => "ERROR",
            EventType::Done => "DONE",
        }
    }

    pub fn parse(raw: &str) -> Option<EventType> {
        EventType::ALL.iter().copied().find(|t| t.as_str() == raw)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    Idea,
    Blueprint,
}

impl JobKind {
    pub fn of_spec(spec: &Value) -> Result<JobKind> {
        match spec.get("schema_version").and_then(|v| v.as_str()) {
            Some("idea_spec_v1") => Ok(JobKind::Idea),
            Some("job_spec_v1") => Ok(JobKind::Blueprint),
            other => Err(EamError::InvalidContract(format!("unsupported job spec schema_version: {:?}", other)).into()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Idea => "idea",
            JobKind::Blueprint => "blueprint",
        }
    }
}

#[derive(Clone, Debug)]
pub struct JobPaths {
    pub job_id: String,
    pub dir: PathBuf,
    pub spec: PathBuf,
    pub events: PathBuf,
    pub inputs: PathBuf,
    pub outputs: PathBuf,
    pub outputs_index: PathBuf,
    pub lock: PathBuf,
}

impl JobPaths {
    pub fn new(roots: &EamRoots, job_id: &str) -> Result<Self> {
        if !is_safe_id(job_id) {
            return Err(EamError::Usage(format!("unsafe job_id: {}", job_id)).into());
        }
        let dir = roots.job_dir(job_id);
        Ok(JobPaths {
            job_id: job_id.to_string(),
            spec: dir.join(JOB_SPEC_FILE),
            events: dir.join(EVENTS_FILE),
            inputs: dir.join("inputs"),
            outputs: dir.join("outputs"),
            outputs_index: dir.join("outputs").join(OUTPUTS_INDEX_FILE),
            lock: dir.join(JOB_LOCK_FILE),
            dir,
        })
    }

    /// Existing job or `NotFound`.
    pub fn existing(roots: &EamRoots, job_id: &str) -> Result<Self> {
        let paths = JobPaths::new(roots, job_id)?;
        if !paths.spec.is_file() {
            return Err(EamError::NotFound(format!("job not found: {}", job_id)).into());
        }
        Ok(paths)
    }
}

#[derive(Clone, Debug)]
pub struct CreateResult {
    pub job_id: String,
    pub job_dir: PathBuf,
    pub status: &'static str,
}

impl CreateResult {
    pub fn to_json(&self) -> Value {
        json!({
            "job_id": self.job_id,
            "job_dir": self.job_dir.display().to_string(),
            "status": self.status,
        })
    }
}

fn create_job(roots: &EamRoots, spec: &Value, input_name: &str, first: EventType) -> Result<CreateResult> {
    ensure_valid(spec)?;
    let job_id = short_digest(spec);
    let paths = JobPaths::new(roots, &job_id)?;
    if paths.spec.is_file() {
        tracing::info!(job_id = %job_id, "job exists");
        return Ok(CreateResult {
            job_id,
            job_dir: paths.dir,
            status: "exists",
        });
    }
    ensure_dir(&paths.inputs)?;
    ensure_dir(&paths.outputs)?;
    let input_path = paths.inputs.join(input_name);
    atomic_write_json_pretty(&input_path, spec)?;
    atomic_write_json_pretty(&paths.spec, spec)?;
    append_event(
        roots,
        &job_id,
        first,
        Some(json!({"job_spec": paths.spec.display().to_string(), "input": input_path.display().to_string()})),
        None,
    )?;
    tracing::info!(job_id = %job_id, event = first.as_str(), "job created");
    Ok(CreateResult {
        job_id,
        job_dir: paths.dir,
        status: "created",
    })
}

/// `job_id` is the short digest of the canonical idea spec.
pub fn create_job_from_idea(roots: &EamRoots, idea: &Value) -> Result<CreateResult> {
    create_job(roots, idea, "idea_spec.json", EventType::IdeaSubmitted)
}

pub fn blueprint_job_spec(
    blueprint: &Value,
    snapshot_id: &str,
    policy_bundle_path: &str,
    fetch_request: Option<&Value>,
    extensions: Option<Value>,
) -> Value {
    let mut spec = json!({
        "schema_version": "job_spec_v1",
        "job_kind": "blueprint",
        "blueprint": blueprint,
        "snapshot_id": snapshot_id,
        "policy_bundle_path": policy_bundle_path,
    });
    if let Some(req) = fetch_request {
        spec["fetch_request"] = req.clone();
    }
    if let Some(ext) = extensions {
        spec["extensions"] = ext;
    }
    spec
}

pub fn create_job_from_blueprint(
    roots: &EamRoots,
    blueprint: &Value,
    snapshot_id: &str,
    policy_bundle_path: &str,
    fetch_request: Option<&Value>,
) -> Result<CreateResult> {
    let spec = blueprint_job_spec(blueprint, snapshot_id, policy_bundle_path, fetch_request, None);
    create_job(roots, &spec, "blueprint.json", EventType::BlueprintSubmitted)
}

/// Validate and append one `job_event_v2` line.
pub fn append_event(
    roots: &EamRoots,
    job_id: &str,
    event_type: EventType,
    outputs: Option<Value>,
    message: Option<&str>,
) -> Result<Value> {
    let paths = JobPaths::new(roots, job_id)?;
    let mut event = json!({
        "schema_version": "job_event_v2",
        "job_id": job_id,
        "event_type": event_type.as_str(),
        "extensions": {"recorded_at": now_iso()},
    });
    if let Some(out) = outputs {
        event["outputs"] = out;
    }
    if let Some(msg) = message {
        event["message"] = json!(msg);
    }
    ensure_valid(&event)?;
    append_jsonl(&paths.events, &event)?;
    tracing::debug!(job_id, event = event_type.as_str(), "job event appended");
    Ok(event)
}

pub fn load_job_events(roots: &EamRoots, job_id: &str) -> Result<Vec<Value>> {
    let paths = JobPaths::existing(roots, job_id)?;
    read_jsonl(&paths.events)
}

pub fn load_job_spec(roots: &EamRoots, job_id: &str) -> Result<Value> {
    let paths = JobPaths::existing(roots, job_id)?;
    read_json(&paths.spec)
}

pub fn load_outputs_index(roots: &EamRoots, job_id: &str) -> Result<Value> {
    let paths = JobPaths::existing(roots, job_id)?;
    Ok(read_json_object(&paths.outputs_index).unwrap_or_else(|| json!({})))
}

/// Merge `updates` into `outputs/outputs.json`. Keys come out sorted.
pub fn write_outputs_index(roots: &EamRoots, job_id: &str, updates: &Map<String, Value>) -> Result<Value> {
    let paths = JobPaths::existing(roots, job_id)?;
    let mut index = match read_json_object(&paths.outputs_index) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    for (k, v) in updates {
        index.insert(k.clone(), v.clone());
    }
    let index = eam_core::sorted_value(&Value::Object(index));
    atomic_write_json_pretty(&paths.outputs_index, &index)?;
    Ok(index)
}

/// Job directories holding a spec, sorted.
pub fn list_job_ids(roots: &EamRoots) -> Result<Vec<String>> {
    if !roots.job_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut ids: Vec<String> = fs::read_dir(&roots.job_root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().join(JOB_SPEC_FILE).is_file())
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .filter(|id| is_safe_id(id))
        .collect();
    ids.sort();
    Ok(ids)
}

pub fn lock_job(roots: &EamRoots, job_id: &str) -> Result<ExclusiveLock> {
    let paths = JobPaths::existing(roots, job_id)?;
    acquire_exclusive_lock(&paths.lock)
}

/// `None` when another worker holds the job.
pub fn try_lock_job(roots: &EamRoots, job_id: &str) -> Result<Option<ExclusiveLock>> {
    match lock_job(roots, job_id) {
        Ok(lock) => Ok(Some(lock)),
        Err(err) if matches!(err.downcast_ref::<EamError>(), Some(EamError::WriteConflict(_))) => Ok(None),
        Err(err) => Err(err),
    }
}

// ---------------------------------------------------------------------------
// child jobs
// ---------------------------------------------------------------------------

/// Resolve a job spec's `policy_bundle_path` against the repo root.
pub fn bundle_path_for(roots: &EamRoots, spec: &Value) -> PathBuf {
    match spec.get("policy_bundle_path").and_then(|v| v.as_str()) {
        Some(raw) if Path::new(raw).is_absolute() => PathBuf::from(raw),
        Some(raw) => roots.repo_root.join(raw),
        None => roots.default_bundle_path(),
    }
}

pub fn budget_params(roots: &EamRoots, spec: &Value) -> Result<Option<BudgetParams>> {
    let policies = ResolvedPolicies::load(&bundle_path_for(roots, spec))?;
    policies.budget.as_ref().map(|p| p.typed_params::<BudgetParams>()).transpose()
}

/// Lineage depth recorded on a spec; roots are depth 0.
pub fn lineage_depth(spec: &Value) -> u64 {
    spec.pointer("/extensions/lineage/depth").and_then(|v| v.as_u64()).unwrap_or(0)
}

fn load_proposals(roots: &EamRoots, job_id: &str) -> Result<Value> {
    let index = load_outputs_index(roots, job_id)?;
    let path = index
        .get("improvement_proposals")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EamError::NotFound(format!("job {} has no improvement proposals", job_id)))?;
    read_json(Path::new(path))
}

#[derive(Clone, Debug)]
pub struct SpawnResult {
    pub child: CreateResult,
    pub base_job_id: String,
    pub proposal_id: String,
    pub depth: u64,
}

impl SpawnResult {
    pub fn to_json(&self) -> Value {
        let mut v = self.child.to_json();
        v["base_job_id"] = json!(self.base_job_id);
        v["proposal_id"] = json!(self.proposal_id);
        v["lineage_depth"] = json!(self.depth);
        v
    }
}

/// Blueprint job from one improvement proposal of `base_job_id`, subject to
/// `budget_policy` spawn and lineage limits.
pub fn spawn_child_from_proposal(roots: &EamRoots, base_job_id: &str, proposal_id: &str) -> Result<SpawnResult> {
    let base_spec = load_job_spec(roots, base_job_id)?;
    let doc = load_proposals(roots, base_job_id)?;
    let proposal = doc
        .get("proposals")
        .and_then(|v| v.as_array())
        .and_then(|ps| ps.iter().find(|p| p.get("proposal_id").and_then(|v| v.as_str()) == Some(proposal_id)))
        .ok_or_else(|| EamError::NotFound(format!("proposal {} not found in job {}", proposal_id, base_job_id)))?;
    if let Some(ext) = proposal.get("extensions") {
        if let Some(ptr) = eam_agents::guards::find_policy_override_keys(ext).first() {
            return Err(EamError::PolicyViolation(format!(
                "proposal {} extensions at {}: policy overrides are forbidden",
                proposal_id, ptr
            ))
            .into());
        }
    }
    let draft = proposal
        .get("blueprint_draft")
        .filter(|v| v.is_object())
        .ok_or_else(|| EamError::InvalidContract(format!("proposal {} has no blueprint_draft", proposal_id)))?;
    if let Some(ptr) = find_inline_policy_keys(draft).first() {
        return Err(EamError::PolicyViolation(format!(
            "proposal {} blueprint at {}: inline policy parameters are forbidden",
            proposal_id, ptr
        ))
        .into());
    }

    let depth = lineage_depth(&base_spec) + 1;
    let root_job_id = base_spec
        .pointer("/extensions/lineage/root_job_id")
        .and_then(|v| v.as_str())
        .unwrap_or(base_job_id)
        .to_string();
    let snapshot_id = base_spec.get("snapshot_id").and_then(|v| v.as_str()).unwrap_or_default();
    let bundle = base_spec.get("policy_bundle_path").and_then(|v| v.as_str()).unwrap_or_default();
    let spec = blueprint_job_spec(
        draft,
        snapshot_id,
        bundle,
        base_spec.get("fetch_request"),
        Some(json!({
            "lineage": {
                "root_job_id": root_job_id,
                "parent_job_id": base_job_id,
                "proposal_id": proposal_id,
                "depth": depth,
            }
        })),
    );
    let child_id = short_digest(&spec);
    if JobPaths::new(roots, &child_id)?.spec.is_file() {
        return Ok(SpawnResult {
            child: CreateResult {
                job_dir: roots.job_dir(&child_id),
                job_id: child_id,
                status: "exists",
            },
            base_job_id: base_job_id.to_string(),
            proposal_id: proposal_id.to_string(),
            depth,
        });
    }

    if let Some(budget) = budget_params(roots, &base_spec)? {
        if depth > budget.max_total_iterations {
            return Err(EamError::BudgetBreach(format!(
                "lineage depth {} exceeds max_total_iterations {}",
                depth, budget.max_total_iterations
            ))
            .into());
        }
        let spawned = load_job_events(roots, base_job_id)?
            .iter()
            .filter(|e| e.get("event_type").and_then(|v| v.as_str()) == Some(EventType::Spawned.as_str()))
            .count() as u64;
        if spawned >= budget.max_spawn_per_job {
            return Err(EamError::BudgetBreach(format!(
                "job {} already spawned {} children (max_spawn_per_job {})",
                base_job_id, spawned, budget.max_spawn_per_job
            ))
            .into());
        }
    }

    let child = create_job(roots, &spec, "blueprint.json", EventType::BlueprintSubmitted)?;
    append_event(
        roots,
        base_job_id,
        EventType::Spawned,
        Some(json!({"child_job_id": child.job_id, "proposal_id": proposal_id, "lineage_depth": depth})),
        None,
    )?;
    tracing::info!(base_job_id, child_job_id = %child.job_id, proposal_id, depth, "child job spawned");
    Ok(SpawnResult {
        child,
        base_job_id: base_job_id.to_string(),
        proposal_id: proposal_id.to_string(),
        depth,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use eam_core::scratch_dir;
    use std::path::PathBuf;

    pub(crate) fn repo_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    pub(crate) fn test_roots(root: &Path) -> EamRoots {
        EamRoots::new(&root.join("data"), &root.join("artifacts"), &repo_root())
    }

    pub(crate) fn example(name: &str) -> Value {
        read_json(&repo_root().join("contracts/examples").join(name)).expect("example")
    }

    pub(crate) fn bundle() -> PathBuf {
        repo_root().join("policies/policy_bundle_v1.yaml")
    }

    pub(crate) fn ingest_demo(roots: &EamRoots) {
        let latency = ResolvedPolicies::load(&bundle()).expect("policies").asof_params().expect("asof");
        eam_runner::lake::demo_ingest(&roots.lake_dir(), "demo_snap_001", &latency).expect("ingest");
    }

    /// Demo snapshot plus a sealed buy-and-hold dossier under `root`.
    pub(crate) fn demo_dossier(root: &Path) -> (Value, eam_runner::RunOutcome) {
        let roots = test_roots(root);
        ingest_demo(&roots);
        let compiled =
            eam_runner::compile_blueprint(&example("blueprint_ok.json"), &bundle(), "demo_snap_001").expect("compile");
        let outcome = eam_runner::run_runspec(
            &compiled.runspec,
            &bundle(),
            &roots.data_root,
            &roots.dossiers_dir(),
            eam_runner::ExistsBehavior::Noop,
        )
        .expect("run");
        (compiled.runspec, outcome)
    }

    #[test]
    fn create_is_idempotent_and_events_append() {
        let root = scratch_dir("eam_store_create_test");
        let roots = test_roots(&root);
        let idea = example("idea_spec_ok.json");
        let first = create_job_from_idea(&roots, &idea).expect("create");
        assert_eq!(first.status, "created");
        assert_eq!(first.job_id.len(), 12);
        let again = create_job_from_idea(&roots, &idea).expect("again");
        assert_eq!(again.status, "exists");
        assert_eq!(again.job_id, first.job_id);

        let before = fs::read(JobPaths::new(&roots, &first.job_id).expect("paths").events).expect("events");
        append_event(&roots, &first.job_id, EventType::WaitingApproval, Some(json!({"step": "blueprint"})), None)
            .expect("append");
        let after = fs::read(JobPaths::new(&roots, &first.job_id).expect("paths").events).expect("events");
        assert!(after.len() > before.len());
        assert_eq!(&after[..before.len()], &before[..]);

        let events = load_job_events(&roots, &first.job_id).expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event_type"], "IDEA_SUBMITTED");
        assert_eq!(list_job_ids(&roots).expect("ids"), vec![first.job_id.clone()]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn invalid_specs_and_missing_jobs_are_reported() {
        let root = scratch_dir("eam_store_invalid_test");
        let roots = test_roots(&root);
        let err = create_job_from_idea(&roots, &example("idea_spec_bad.json")).expect_err("bad idea");
        assert_eq!(eam_core::exit_code_for(&err), eam_core::EXIT_INVALID);
        let err = load_job_spec(&roots, "nope").expect_err("missing");
        assert!(err.to_string().contains("job not found"), "unexpected: {}", err);
        assert!(JobPaths::new(&roots, "../escape").is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn outputs_index_merges_with_sorted_keys() {
        let root = scratch_dir("eam_store_outputs_test");
        let roots = test_roots(&root);
        let bp = example("blueprint_ok.json");
        let job = create_job_from_blueprint(&roots, &bp, "demo_snap_001", "policies/policy_bundle_v1.yaml", None)
            .expect("create");
        let mut a = Map::new();
        a.insert("runspec".into(), json!("/x/runspec.json"));
        write_outputs_index(&roots, &job.job_id, &a).expect("write");
        let mut b = Map::new();
        b.insert("dossier".into(), json!("/x/dossier"));
        let index = write_outputs_index(&roots, &job.job_id, &b).expect("write");
        let keys: Vec<&String> = index.as_object().expect("obj").keys().collect();
        assert_eq!(keys, vec!["dossier", "runspec"]);
        assert_eq!(load_outputs_index(&roots, &job.job_id).expect("load"), index);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn lock_is_exclusive_per_job() {
        let root = scratch_dir("eam_store_lock_test");
        let roots = test_roots(&root);
        let job = create_job_from_idea(&roots, &example("idea_spec_ok.json")).expect("create");
        let held = try_lock_job(&roots, &job.job_id).expect("lock");
        assert!(held.is_some());
        assert!(try_lock_job(&roots, &job.job_id).expect("second").is_none());
        drop(held);
        assert!(try_lock_job(&roots, &job.job_id).expect("third").is_some());
        let _ = fs::remove_dir_all(root);
    }

    fn write_proposals(roots: &EamRoots, job_id: &str, doc: &Value) {
        let path = roots.job_dir(job_id).join("outputs/agents/improvement/improvement_proposals.json");
        atomic_write_json_pretty(&path, doc).expect("proposals");
        let mut m = Map::new();
        m.insert("improvement_proposals".into(), json!(path.display().to_string()));
        write_outputs_index(roots, job_id, &m).expect("index");
    }

    #[test]
    fn spawn_enforces_spawn_budget_and_records_lineage() {
        let root = scratch_dir("eam_store_spawn_test");
        let roots = test_roots(&root);
        let base = create_job_from_idea(&roots, &example("idea_spec_ok.json")).expect("create");
        let mut doc = example("improvement_proposals_ok.json");
        let template = doc["proposals"][0].clone();
        let mut proposals = Vec::new();
        for n in 1..=4 {
            let mut p = template.clone();
            p["proposal_id"] = json!(format!("p_{:03}", n));
            p["blueprint_draft"]["blueprint_id"] = json!(format!("bp_child_{}", n));
            proposals.push(p);
        }
        doc["proposals"] = json!(proposals);
        write_proposals(&roots, &base.job_id, &doc);

        let child = spawn_child_from_proposal(&roots, &base.job_id, "p_001").expect("spawn");
        assert_eq!(child.child.status, "created");
        assert_eq!(child.depth, 1);
        let spec = load_job_spec(&roots, &child.child.job_id).expect("child spec");
        assert_eq!(spec["extensions"]["lineage"]["parent_job_id"], json!(base.job_id));
        let again = spawn_child_from_proposal(&roots, &base.job_id, "p_001").expect("again");
        assert_eq!(again.child.status, "exists");

        spawn_child_from_proposal(&roots, &base.job_id, "p_002").expect("second");
        spawn_child_from_proposal(&roots, &base.job_id, "p_003").expect("third");
        let err = spawn_child_from_proposal(&roots, &base.job_id, "p_004").expect_err("over budget");
        assert!(err.to_string().contains("max_spawn_per_job"), "unexpected: {}", err);
        let err = spawn_child_from_proposal(&roots, &base.job_id, "p_999").expect_err("missing");
        assert_eq!(eam_core::error_code_for(&err), "not_found");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn spawn_rejects_policy_overrides_in_extensions() {
        let root = scratch_dir("eam_store_spawn_override_test");
        let roots = test_roots(&root);
        let base = create_job_from_idea(&roots, &example("idea_spec_ok.json")).expect("create");
        let mut doc = example("improvement_proposals_ok.json");
        doc["proposals"][0]["extensions"] = json!({"policy_overrides": {"cost": "cheap"}});
        write_proposals(&roots, &base.job_id, &doc);
        let err = spawn_child_from_proposal(&roots, &base.job_id, "p_001").expect_err("override");
        assert!(err.to_string().contains("policy overrides are forbidden"), "unexpected: {}", err);
        let _ = fs::remove_dir_all(root);
    }
}
