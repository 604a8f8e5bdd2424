use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use eam_agents::{AgentRunRequest, LlmEnv};
use eam_core::{error_code_for, exit_code_for, read_json, EamError, EamRoots, EXIT_INVALID, EXIT_OK};
use eam_runner::policies::{validate_policies_dir, write_lock, ResolvedPolicies};
use eam_runner::{registry, ExistsBehavior, ExperienceQuery, GateRunInput};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod serve;

const COMPOSER_BUNDLE_FILE: &str = "policy_bundle_composer_v1.yaml";

#[derive(Parser)]
#[command(name = "eam", version = "0.3.0", about = "Experience Asset Machine CLI")]
struct Cli {
    /// Emit a single JSON envelope on stdout.
    #[arg(long, global = true)]
    json: bool,
    /// Overrides EAM_DATA_ROOT.
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,
    /// Overrides EAM_ARTIFACT_ROOT.
    #[arg(long, global = true)]
    artifact_root: Option<PathBuf>,
    /// Overrides EAM_REPO_ROOT.
    #[arg(long, global = true)]
    repo_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ExistsArg {
    #[value(name = "noop")]
    Noop,
    #[value(name = "reject")]
    Reject,
}

impl From<ExistsArg> for ExistsBehavior {
    fn from(value: ExistsArg) -> Self {
        match value {
            ExistsArg::Noop => ExistsBehavior::Noop,
            ExistsArg::Reject => ExistsBehavior::Reject,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a contract file, or every example in a directory.
    Validate {
        path: PathBuf,
        #[arg(long)]
        schema: Option<PathBuf>,
        #[arg(long)]
        fetch_request: bool,
    },
    Policies {
        #[command(subcommand)]
        command: PolicyCommands,
    },
    Ingest {
        #[command(subcommand)]
        command: IngestCommands,
    },
    /// Compile a blueprint into a runspec.
    Compile {
        #[arg(long)]
        blueprint: PathBuf,
        #[arg(long)]
        snapshot_id: String,
        #[arg(long)]
        policy_bundle: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run a runspec and seal its dossier.
    Run {
        #[arg(long)]
        runspec: PathBuf,
        #[arg(long)]
        policy_bundle: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "noop")]
        if_exists: ExistsArg,
    },
    /// Run the policy gate suite against a dossier.
    Gates {
        #[arg(long)]
        dossier: PathBuf,
        #[arg(long)]
        policy_bundle: Option<PathBuf>,
    },
    /// Blend card runs into a composed, gated dossier.
    Compose {
        #[arg(long = "card-id", required = true)]
        card_ids: Vec<String>,
        #[arg(long = "weight", required = true, allow_negative_numbers = true)]
        weights: Vec<f64>,
        /// Defaults to the composer bundle next to the default bundle.
        #[arg(long)]
        policy_bundle: Option<PathBuf>,
        /// Record the composed trial and card it on Gate PASS.
        #[arg(long)]
        register_card: bool,
        #[arg(long)]
        title: Option<String>,
    },
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Advance every job repeatedly.
    Worker {
        #[arg(long, default_value_t = 5.0)]
        interval_seconds: f64,
        #[arg(long)]
        once: bool,
    },
    /// Append newly seen runs and jobs to the registry indexes.
    Index,
    Dossier {
        #[command(subcommand)]
        command: DossierCommands,
    },
    /// Serve the job/run/card HTTP surface.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

#[derive(Subcommand)]
enum PolicyCommands {
    Validate {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    Lock {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum IngestCommands {
    /// Write the deterministic demo snapshot.
    Demo {
        #[arg(long, default_value = "demo_snap_001")]
        snapshot_id: String,
        #[arg(long)]
        policy_bundle: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum RegistryCommands {
    RecordTrial {
        #[arg(long)]
        dossier: PathBuf,
        #[arg(long, value_enum, default_value = "noop")]
        if_exists: ExistsArg,
    },
    CreateCard {
        #[arg(long)]
        run_id: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, value_enum, default_value = "noop")]
        if_exists: ExistsArg,
    },
    Promote {
        #[arg(long)]
        card_id: String,
        #[arg(long)]
        status: String,
        #[arg(long)]
        allow_skip: bool,
    },
    ListCards,
    ShowCard {
        #[arg(long)]
        card_id: String,
    },
    Search {
        #[arg(long, default_value = "")]
        query: String,
        #[arg(long = "symbol")]
        symbols: Vec<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        frequency: Option<String>,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
    },
}

#[derive(Subcommand)]
enum AgentCommands {
    Run {
        #[arg(long)]
        agent_id: String,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
        #[arg(long)]
        job_id: Option<String>,
        #[arg(long)]
        policy_bundle: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    CreateIdea {
        #[arg(long)]
        idea: PathBuf,
    },
    CreateBlueprint {
        #[arg(long)]
        blueprint: PathBuf,
        #[arg(long)]
        snapshot_id: String,
        #[arg(long, default_value = "policies/policy_bundle_v1.yaml")]
        policy_bundle_path: String,
        #[arg(long)]
        fetch_request: Option<PathBuf>,
    },
    List,
    Show {
        job_id: String,
    },
    Approve {
        job_id: String,
        #[arg(long)]
        step: String,
    },
    Reject {
        job_id: String,
        #[arg(long)]
        step: String,
        #[arg(long, default_value = "")]
        note: String,
    },
    Rerun {
        job_id: String,
        #[arg(long)]
        agent_id: String,
    },
    /// Advance one job, or all jobs when no id is given.
    Advance {
        job_id: Option<String>,
    },
    Spawn {
        job_id: String,
        #[arg(long)]
        proposal_id: String,
    },
}

#[derive(Subcommand)]
enum DossierCommands {
    Verify {
        #[arg(long)]
        dossier: PathBuf,
    },
    Export {
        #[arg(long)]
        dossier: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
}

/// Command payload plus the process exit code it implies.
struct Reply {
    body: Value,
    exit_code: i32,
}

impl Reply {
    fn ok(body: Value) -> Self {
        Reply {
            body,
            exit_code: EXIT_OK,
        }
    }

    fn with_code(body: Value, exit_code: i32) -> Self {
        Reply { body, exit_code }
    }
}

fn main() {
    eam_core::init_logging();
    let cli = Cli::parse();
    let json_mode = cli.json;
    let name = command_name(&cli.command);
    let roots = build_roots(&cli);
    match run_command(&roots, cli.command) {
        Ok(reply) => {
            if json_mode {
                emit_json(&envelope(name, reply.exit_code == EXIT_OK, reply.body));
            } else {
                print_text(&reply.body);
            }
            std::process::exit(reply.exit_code);
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code_for(&err), format!("{:#}", err), json!({"command": name})));
            } else {
                eprintln!("{:#}", err);
            }
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn build_roots(cli: &Cli) -> EamRoots {
    let env = EamRoots::from_env();
    let data = cli.data_root.clone().unwrap_or_else(|| env.data_root.clone());
    let artifact = cli.artifact_root.clone().unwrap_or_else(|| env.artifact_root.clone());
    let repo = cli.repo_root.clone().unwrap_or_else(|| env.repo_root.clone());
    if cli.artifact_root.is_none() {
        let mut roots = EamRoots::new(&data, &artifact, &repo);
        roots.job_root = env.job_root;
        roots.registry_root = env.registry_root;
        roots
    } else {
        EamRoots::new(&data, &artifact, &repo)
    }
}

fn bundle_or_default(roots: &EamRoots, bundle: Option<PathBuf>) -> PathBuf {
    bundle.unwrap_or_else(|| roots.default_bundle_path())
}

fn path_json(p: &Path) -> Value {
    json!(p.display().to_string())
}

fn run_command(roots: &EamRoots, command: Commands) -> Result<Reply> {
    match command {
        Commands::Validate {
            path,
            schema,
            fetch_request,
        } => {
            if path.is_dir() {
                let mismatches = eam_schemas::check_examples_dir(&path)?;
                let rows: Vec<Value> = mismatches
                    .iter()
                    .map(|(p, v)| json!({"path": path_json(p), "code": v.code, "message": v.message}))
                    .collect();
                let code = if rows.is_empty() { EXIT_OK } else { EXIT_INVALID };
                return Ok(Reply::with_code(
                    json!({"dir": path_json(&path), "mismatches": rows}),
                    code,
                ));
            }
            let validation = if fetch_request {
                eam_schemas::validate_fetch_request(&read_json(&path)?)
            } else {
                eam_schemas::validate_file(&path, schema.as_deref())
            };
            Ok(Reply::with_code(
                json!({"path": path_json(&path), "code": validation.code, "message": validation.message}),
                validation.code,
            ))
        }
        Commands::Policies { command } => match command {
            PolicyCommands::Validate { dir } => {
                let dir = dir.unwrap_or_else(|| roots.policies_dir());
                let files = validate_policies_dir(&dir)?;
                Ok(Reply::ok(json!({
                    "dir": path_json(&dir),
                    "validated": files.iter().map(|p| path_json(p)).collect::<Vec<_>>(),
                })))
            }
            PolicyCommands::Lock { dir } => {
                let dir = dir.unwrap_or_else(|| roots.policies_dir());
                let lock = write_lock(&dir)?;
                Ok(Reply::ok(json!({"lock": path_json(&lock)})))
            }
        },
        Commands::Ingest {
            command: IngestCommands::Demo {
                snapshot_id,
                policy_bundle,
            },
        } => {
            let bundle = bundle_or_default(roots, policy_bundle);
            let latency = ResolvedPolicies::load(&bundle)?.asof_params()?;
            let res = eam_runner::lake::demo_ingest(&roots.lake_dir(), &snapshot_id, &latency)?;
            Ok(Reply::ok(json!({
                "snapshot_id": res.snapshot_id,
                "snapshot_dir": path_json(&res.snapshot_dir),
                "manifest": path_json(&res.manifest_path),
                "rows_written": res.rows_written,
                "duplicate_count": res.duplicate_count,
                "status": res.status,
            })))
        }
        Commands::Compile {
            blueprint,
            snapshot_id,
            policy_bundle,
            out,
        } => {
            let bundle = bundle_or_default(roots, policy_bundle);
            let compiled = eam_runner::compile_blueprint(&read_json(&blueprint)?, &bundle, &snapshot_id)?;
            let mut body = json!({
                "run_id": compiled.run_id,
                "segments": compiled.segments.iter().map(|s| s.to_json()).collect::<Vec<_>>(),
            });
            match out {
                Some(out) => {
                    eam_core::atomic_write_json_pretty(&out, &compiled.runspec)?;
                    body["runspec_path"] = path_json(&out);
                }
                None => body["runspec"] = compiled.runspec,
            }
            Ok(Reply::ok(body))
        }
        Commands::Run {
            runspec,
            policy_bundle,
            if_exists,
        } => {
            let bundle = bundle_or_default(roots, policy_bundle);
            let outcome = eam_runner::run_runspec(
                &read_json(&runspec)?,
                &bundle,
                &roots.data_root,
                &roots.dossiers_dir(),
                if_exists.into(),
            )?;
            Ok(Reply::ok(outcome.to_json()))
        }
        Commands::Gates { dossier, policy_bundle } => {
            let bundle = bundle_or_default(roots, policy_bundle);
            let report = eam_runner::run_gates(&GateRunInput {
                dossier_dir: &dossier,
                bundle_path: &bundle,
                data_root: &roots.data_root,
                artifact_root: &roots.artifact_root,
                job_root: &roots.job_root,
            })?;
            // a failing gate is a recorded outcome; only invalid evidence is an error
            let code = if report.invalid { EXIT_INVALID } else { EXIT_OK };
            Ok(Reply::with_code(report.to_json(), code))
        }
        Commands::Compose {
            card_ids,
            weights,
            policy_bundle,
            register_card,
            title,
        } => {
            if register_card && title.as_deref().map(str::trim).unwrap_or_default().is_empty() {
                return Err(EamError::Usage("--register-card requires --title".into()).into());
            }
            let bundle = policy_bundle.unwrap_or_else(|| roots.policies_dir().join(COMPOSER_BUNDLE_FILE));
            let outcome = eam_runner::compose_runs(&eam_runner::ComposeInput {
                card_ids: &card_ids,
                weights: &weights,
                bundle_path: &bundle,
                registry_root: &roots.registry_root,
                artifact_root: &roots.artifact_root,
                data_root: &roots.data_root,
                job_root: &roots.job_root,
                register_title: if register_card { title.as_deref() } else { None },
            })?;
            Ok(Reply::ok(outcome.to_json()))
        }
        Commands::Registry { command } => run_registry(roots, command),
        Commands::Agent {
            command:
                AgentCommands::Run {
                    agent_id,
                    input,
                    out_dir,
                    job_id,
                    policy_bundle,
                },
        } => {
            let env = LlmEnv::from_env()?;
            let result = eam_agents::run_agent(
                roots,
                &env,
                &AgentRunRequest {
                    agent_id: &agent_id,
                    input_path: &input,
                    out_dir: &out_dir,
                    job_id: job_id.as_deref(),
                    bundle_path: policy_bundle.as_deref(),
                },
            )?;
            Ok(Reply::ok(result.to_json()))
        }
        Commands::Job { command } => run_job(roots, command),
        Commands::Worker { interval_seconds, once } => {
            let env = LlmEnv::from_env()?;
            run_worker(roots, &env, interval_seconds, once)
        }
        Commands::Index => Ok(Reply::ok(eam_runner::build_all_indexes(roots)?)),
        Commands::Dossier { command } => match command {
            DossierCommands::Verify { dossier } => {
                let report = eam_runner::verify_dossier(&dossier)?;
                let code = if report.ok() { EXIT_OK } else { EXIT_INVALID };
                Ok(Reply::with_code(report.to_json(), code))
            }
            DossierCommands::Export { dossier, out } => {
                let files = eam_runner::export_dossier_zip(&dossier, &out)?;
                Ok(Reply::ok(json!({"zip": path_json(&out), "files": files})))
            }
        },
        Commands::Serve { bind } => {
            let env = LlmEnv::from_env()?;
            let auth = serve::WriteAuth::from_env()?;
            serve::serve(roots, &env, auth, &bind)?;
            Ok(Reply::ok(json!({"bind": bind})))
        }
    }
}

fn run_registry(roots: &EamRoots, command: RegistryCommands) -> Result<Reply> {
    let root = &roots.registry_root;
    let body = match command {
        RegistryCommands::RecordTrial { dossier, if_exists } => {
            json!({"trial": registry::record_trial(&dossier, root, if_exists.into())?})
        }
        RegistryCommands::CreateCard {
            run_id,
            title,
            if_exists,
        } => json!({"card": registry::create_card_from_run(root, &run_id, &title, if_exists.into())?}),
        RegistryCommands::Promote {
            card_id,
            status,
            allow_skip,
        } => json!({"event": registry::promote_card(root, &card_id, &status, allow_skip)?}),
        RegistryCommands::ListCards => json!({"cards": registry::list_cards(root)?}),
        RegistryCommands::ShowCard { card_id } => json!({"card": registry::show_card(root, &card_id)?}),
        RegistryCommands::Search {
            query,
            symbols,
            tags,
            frequency,
            top_k,
        } => {
            let q = ExperienceQuery {
                query,
                symbols,
                frequency,
                tags,
                top_k,
            };
            let matches = eam_runner::search_experience(root, &q)?;
            json!({"matches": serde_json::to_value(&matches)?})
        }
    };
    Ok(Reply::ok(body))
}

fn run_job(roots: &EamRoots, command: JobCommands) -> Result<Reply> {
    let body = match command {
        JobCommands::CreateIdea { idea } => eam_jobs::create_job_from_idea(roots, &read_json(&idea)?)?.to_json(),
        JobCommands::CreateBlueprint {
            blueprint,
            snapshot_id,
            policy_bundle_path,
            fetch_request,
        } => {
            let fetch = fetch_request.as_deref().map(read_json).transpose()?;
            eam_jobs::create_job_from_blueprint(
                roots,
                &read_json(&blueprint)?,
                &snapshot_id,
                &policy_bundle_path,
                fetch.as_ref(),
            )?
            .to_json()
        }
        JobCommands::List => json!({"jobs": serve::job_rows(roots)?}),
        JobCommands::Show { job_id } => eam_jobs::job_summary(roots, &job_id)?,
        JobCommands::Approve { job_id, step } => json!({"event": eam_jobs::approve(roots, &job_id, &step)?}),
        JobCommands::Reject { job_id, step, note } => {
            json!({"event": eam_jobs::reject(roots, &job_id, &step, &note)?})
        }
        JobCommands::Rerun { job_id, agent_id } => json!({"event": eam_jobs::rerun(roots, &job_id, &agent_id)?}),
        JobCommands::Advance { job_id } => {
            let env = LlmEnv::from_env()?;
            match job_id {
                Some(id) => eam_jobs::advance_job_once(roots, &env, &id)?.to_json(),
                None => {
                    let outcomes = eam_jobs::advance_all_once(roots, &env)?;
                    json!({"jobs": outcomes.iter().map(|o| o.to_json()).collect::<Vec<_>>()})
                }
            }
        }
        JobCommands::Spawn { job_id, proposal_id } => {
            eam_jobs::spawn_child_from_proposal(roots, &job_id, &proposal_id)?.to_json()
        }
    };
    Ok(Reply::ok(body))
}

fn run_worker(roots: &EamRoots, env: &LlmEnv, interval_seconds: f64, once: bool) -> Result<Reply> {
    if !(interval_seconds.is_finite() && interval_seconds >= 0.0) {
        return Err(EamError::Usage("--interval-seconds must be a non-negative number".into()).into());
    }
    let mut iterations = 0u64;
    let mut advanced = 0usize;
    loop {
        iterations += 1;
        match eam_jobs::advance_all_once(roots, env) {
            Ok(outcomes) => {
                advanced += outcomes.iter().filter(|o| !o.actions.is_empty()).count();
                tracing::info!(iteration = iterations, jobs = outcomes.len(), "worker pass complete");
            }
            Err(err) => tracing::error!(iteration = iterations, error = %format!("{:#}", err), "worker pass failed"),
        }
        if once {
            break;
        }
        std::thread::sleep(Duration::from_secs_f64(interval_seconds));
    }
    Ok(Reply::ok(json!({"iterations": iterations, "jobs_advanced": advanced})))
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Validate { .. } => "validate",
        Commands::Policies { command } => match command {
            PolicyCommands::Validate { .. } => "policies validate",
            PolicyCommands::Lock { .. } => "policies lock",
        },
        Commands::Ingest { .. } => "ingest demo",
        Commands::Compile { .. } => "compile",
        Commands::Run { .. } => "run",
        Commands::Gates { .. } => "gates",
        Commands::Compose { .. } => "compose",
        Commands::Registry { command } => match command {
            RegistryCommands::RecordTrial { .. } => "registry record-trial",
            RegistryCommands::CreateCard { .. } => "registry create-card",
            RegistryCommands::Promote { .. } => "registry promote",
            RegistryCommands::ListCards => "registry list-cards",
            RegistryCommands::ShowCard { .. } => "registry show-card",
            RegistryCommands::Search { .. } => "registry search",
        },
        Commands::Agent { .. } => "agent run",
        Commands::Job { command } => match command {
            JobCommands::CreateIdea { .. } => "job create-idea",
            JobCommands::CreateBlueprint { .. } => "job create-blueprint",
            JobCommands::List => "job list",
            JobCommands::Show { .. } => "job show",
            JobCommands::Approve { .. } => "job approve",
            JobCommands::Reject { .. } => "job reject",
            JobCommands::Rerun { .. } => "job rerun",
            JobCommands::Advance { .. } => "job advance",
            JobCommands::Spawn { .. } => "job spawn",
        },
        Commands::Worker { .. } => "worker",
        Commands::Index => "index",
        Commands::Dossier { command } => match command {
            DossierCommands::Verify { .. } => "dossier verify",
            DossierCommands::Export { .. } => "dossier export",
        },
        Commands::Serve { .. } => "serve",
    }
}

/// `{ok, command, ...body}`; non-object bodies land under `result`.
fn envelope(command: &str, ok: bool, body: Value) -> Value {
    let mut out = json!({"ok": ok, "command": command});
    match body {
        Value::Object(map) => {
            for (k, v) in map {
                if k != "ok" && k != "command" {
                    out[k.as_str()] = v;
                }
            }
        }
        other => out["result"] = other,
    }
    out
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

/// `key: value` lines; nested values print as compact JSON.
fn print_text(body: &Value) {
    match body {
        Value::Object(map) => {
            for (k, v) in map {
                match v {
                    Value::String(s) => println!("{}: {}", k, s),
                    Value::Null => println!("{}: none", k),
                    other => println!("{}: {}", k, other),
                }
            }
        }
        other => println!("{}", other),
    }
}
