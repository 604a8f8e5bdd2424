//! Job store and orchestrator: idea or blueprint submissions advanced through
//! agent stages, human checkpoints and the deterministic run pipeline.

pub mod fetch;
pub mod store;
pub mod workflow;

pub use store::{
    append_event, create_job_from_blueprint, create_job_from_idea, list_job_ids, load_job_events, load_job_spec,
    load_outputs_index, spawn_child_from_proposal, write_outputs_index, CreateResult, EventType, JobKind, SpawnResult,
};
pub use workflow::{advance_all_once, advance_job_once, approve, reject, rerun, AdvanceOutcome, JobState, Stage};

/// Spec, folded state, events and output pointers for one job.
pub fn job_summary(roots: &eam_core::EamRoots, job_id: &str) -> anyhow::Result<serde_json::Value> {
    let spec = load_job_spec(roots, job_id)?;
    let state = JobState::load(roots, job_id)?;
    let kind = state.kind;
    Ok(serde_json::json!({
        "job_id": job_id,
        "job_spec": spec,
        "state": state.to_json(),
        "checkpoint_steps": workflow::checkpoint_steps(kind),
        "outputs": load_outputs_index(roots, job_id)?,
        "events": load_job_events(roots, job_id)?,
    }))
}
