//! Thin JSON-over-HTTP surface for jobs, runs, cards and snapshots.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use eam_agents::LlmEnv;
use eam_core::{error_code_for, read_json_object, EamError, EamRoots};
use eam_jobs::JobState;
use eam_runner::dossier::{dossier_dir, load_manifest};
use eam_runner::gates::GATE_RESULTS_FILE;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::Read;
use tiny_http::{Header, Response, Server};

/// Guard for mutating endpoints, from `EAM_WRITE_AUTH_MODE`.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteAuth {
    Open,
    Basic { user: String, password: String },
}

impl WriteAuth {
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        match var("EAM_WRITE_AUTH_MODE").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("none") | Some("off") => Ok(WriteAuth::Open),
            Some("basic") => match (var("EAM_WRITE_AUTH_USER"), var("EAM_WRITE_AUTH_PASSWORD")) {
                (Some(user), Some(password)) => Ok(WriteAuth::Basic { user, password }),
                _ => Err(EamError::Usage(
                    "EAM_WRITE_AUTH_MODE=basic requires EAM_WRITE_AUTH_USER and EAM_WRITE_AUTH_PASSWORD".into(),
                )
                .into()),
            },
            Some(other) => Err(EamError::Usage(format!("unknown EAM_WRITE_AUTH_MODE: {}", other)).into()),
        }
    }

    /// Checks an `Authorization` header value.
    pub fn allows(&self, authorization: Option<&str>) -> bool {
        let (user, password) = match self {
            WriteAuth::Open => return true,
            WriteAuth::Basic { user, password } => (user, password),
        };
        let Some(encoded) = authorization.and_then(|h| h.trim().strip_prefix("Basic ")) else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(text) = String::from_utf8(decoded) else {
            return false;
        };
        match text.split_once(':') {
            Some((u, p)) => u == user && p == password,
            None => false,
        }
    }
}

/// One parsed request, independent of the transport.
pub struct ApiRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: BTreeMap<String, String>,
    pub body: &'a str,
    pub authorization: Option<&'a str>,
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => match std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                Some(b) => {
                    out.push(b);
                    i += 2;
                }
                None => out.push(b'%'),
            },
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Split `url` into a path and its decoded query parameters.
pub fn split_url(url: &str) -> (&str, BTreeMap<String, String>) {
    let (path, raw_query) = url.split_once('?').unwrap_or((url, ""));
    let query = raw_query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(k), percent_decode(v))
        })
        .collect();
    (path, query)
}

fn required<'q>(query: &'q BTreeMap<String, String>, key: &str) -> Result<&'q str> {
    query
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EamError::Usage(format!("missing query parameter: {}", key)).into())
}

fn body_json(body: &str) -> Result<Value> {
    serde_json::from_str(body).map_err(|e| EamError::Usage(format!("request body is not JSON: {}", e)).into())
}

/// Folded state for every job, newest id order.
pub fn job_rows(roots: &EamRoots) -> Result<Vec<Value>> {
    eam_jobs::list_job_ids(roots)?
        .iter()
        .map(|id| JobState::load(roots, id).map(|s| s.to_json()))
        .collect()
}

fn run_view(roots: &EamRoots, run_id: &str) -> Result<Value> {
    let dir = dossier_dir(&roots.dossiers_dir(), run_id)?;
    if !dir.is_dir() {
        return Err(EamError::NotFound(format!("run not found: {}", run_id)).into());
    }
    Ok(json!({
        "run_id": run_id,
        "dossier_dir": dir.display().to_string(),
        "manifest": load_manifest(&dir)?,
        "metrics": read_json_object(&dir.join("metrics.json")),
        "has_gate_results": dir.join(GATE_RESULTS_FILE).is_file(),
    }))
}

fn run_gates_view(roots: &EamRoots, run_id: &str) -> Result<Value> {
    let path = dossier_dir(&roots.dossiers_dir(), run_id)?.join(GATE_RESULTS_FILE);
    read_json_object(&path).ok_or_else(|| EamError::NotFound(format!("gate results not found for run {}", run_id)).into())
}

fn route(roots: &EamRoots, env: &LlmEnv, req: &ApiRequest<'_>) -> Result<Value> {
    let segments: Vec<&str> = req.path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    let q = &req.query;
    match (req.method, segments.as_slice()) {
        ("POST", ["jobs", "idea"]) => Ok(eam_jobs::create_job_from_idea(roots, &body_json(req.body)?)?.to_json()),
        ("POST", ["jobs", "blueprint"]) => {
            let body = body_json(req.body)?;
            // either a bare blueprint or {blueprint, fetch_request}
            let (blueprint, fetch) = match body.get("blueprint") {
                Some(bp) => (bp.clone(), body.get("fetch_request").cloned()),
                None => (body, None),
            };
            let bundle = q
                .get("policy_bundle_path")
                .map(String::as_str)
                .filter(|v| !v.is_empty())
                .unwrap_or("policies/policy_bundle_v1.yaml");
            Ok(eam_jobs::create_job_from_blueprint(roots, &blueprint, required(q, "snapshot_id")?, bundle, fetch.as_ref())?
                .to_json())
        }
        ("GET", ["jobs"]) => Ok(json!({"jobs": job_rows(roots)?})),
        ("GET", ["jobs", id]) => eam_jobs::job_summary(roots, id),
        ("POST", ["jobs", id, "approve"]) => Ok(json!({"event": eam_jobs::approve(roots, id, required(q, "step")?)?})),
        ("POST", ["jobs", id, "reject"]) => {
            let note = q.get("note").map(String::as_str).unwrap_or("");
            Ok(json!({"event": eam_jobs::reject(roots, id, required(q, "step")?, note)?}))
        }
        ("POST", ["jobs", id, "rerun"]) => Ok(json!({"event": eam_jobs::rerun(roots, id, required(q, "agent_id")?)?})),
        ("POST", ["jobs", id, "advance"]) => Ok(eam_jobs::advance_job_once(roots, env, id)?.to_json()),
        ("GET", ["runs", run_id]) => run_view(roots, run_id),
        ("GET", ["runs", run_id, "gates"]) => run_gates_view(roots, run_id),
        ("GET", ["cards", card_id]) => eam_runner::registry::show_card(&roots.registry_root, card_id),
        ("GET", ["snapshots"]) => Ok(json!({"snapshots": eam_runner::lake::list_snapshots(&roots.lake_dir())?})),
        ("GET", ["snapshots", id]) => eam_runner::lake::load_snapshot_manifest(&roots.lake_dir(), id),
        _ => Err(EamError::NotFound(format!("no route for {} {}", req.method, req.path)).into()),
    }
}

fn status_for(err: &anyhow::Error) -> u16 {
    match err.downcast_ref::<EamError>() {
        Some(EamError::NotFound(_)) => 404,
        Some(EamError::Usage(_)) => 400,
        Some(EamError::WriteConflict(_)) => 409,
        Some(EamError::BudgetBreach(_)) => 429,
        Some(_) => 422,
        None => 500,
    }
}

/// Route one request to `(status, body)`. Write endpoints go through `auth`.
pub fn handle(roots: &EamRoots, env: &LlmEnv, auth: &WriteAuth, req: &ApiRequest<'_>) -> (u16, Value) {
    if req.method != "GET" && !auth.allows(req.authorization) {
        return (
            401,
            json!({"ok": false, "error": {"code": "unauthorized", "message": "write endpoints require basic auth", "details": {}}}),
        );
    }
    match route(roots, env, req) {
        Ok(body) => (200, body),
        Err(err) => {
            let status = status_for(&err);
            if status >= 500 {
                tracing::error!(path = req.path, error = %format!("{:#}", err), "request failed");
            }
            (
                status,
                json!({
                    "ok": false,
                    "error": {
                        "code": error_code_for(&err),
                        "message": format!("{:#}", err),
                        "details": {"method": req.method, "path": req.path},
                    }
                }),
            )
        }
    }
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

/// Blocking accept loop; requests are handled one at a time.
pub fn serve(roots: &EamRoots, env: &LlmEnv, auth: WriteAuth, bind: &str) -> Result<()> {
    let server = Server::http(bind).map_err(|e| anyhow::anyhow!("failed to bind {}: {}", bind, e))?;
    tracing::info!(bind, "serving");
    for mut request in server.incoming_requests() {
        let method = request.method().to_string().to_ascii_uppercase();
        let url = request.url().to_string();
        let authorization = request
            .headers()
            .iter()
            .find(|h| h.field.equiv("Authorization"))
            .map(|h| h.value.as_str().to_string());
        let mut body = String::new();
        let read = request.as_reader().read_to_string(&mut body).context("failed to read request body");
        let (status, payload) = match read {
            Ok(_) => {
                let (path, query) = split_url(&url);
                let req = ApiRequest {
                    method: &method,
                    path,
                    query,
                    body: &body,
                    authorization: authorization.as_deref(),
                };
                handle(roots, env, &auth, &req)
            }
            Err(err) => (
                400,
                json!({"ok": false, "error": {"code": "usage_error", "message": format!("{:#}", err), "details": {}}}),
            ),
        };
        tracing::debug!(method = %method, url = %url, status, "request");
        let text = serde_json::to_string(&payload).unwrap_or_else(|_| "{\"ok\":false}".to_string());
        let mut response = Response::from_string(text).with_status_code(status);
        if let Some(h) = header("Content-Type", "application/json") {
            response = response.with_header(h);
        }
        if status == 401 {
            if let Some(h) = header("WWW-Authenticate", "Basic realm=\"eam\"") {
                response = response.with_header(h);
            }
        }
        let _ = request.respond(response);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eam_agents::LlmMode;
    use eam_core::scratch_dir;
    use std::fs;
    use std::path::PathBuf;

    fn repo_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn request<'a>(method: &'a str, url: &'a str, body: &'a str, authorization: Option<&'a str>) -> ApiRequest<'a> {
        let (path, query) = split_url(url);
        ApiRequest {
            method,
            path,
            query,
            body,
            authorization,
        }
    }

    #[test]
    fn query_strings_are_decoded() {
        let (path, q) = split_url("/jobs/abc/reject?step=blueprint&note=too%20risky+now&flag");
        assert_eq!(path, "/jobs/abc/reject");
        assert_eq!(q["note"], "too risky now");
        assert_eq!(q["step"], "blueprint");
        assert_eq!(q["flag"], "");
        assert_eq!(percent_decode("100%"), "100%");
    }

    #[test]
    fn basic_auth_checks_credentials() {
        let auth = WriteAuth::Basic {
            user: "ops".into(),
            password: "s3cret".into(),
        };
        let good = format!("Basic {}", STANDARD.encode("ops:s3cret"));
        let bad = format!("Basic {}", STANDARD.encode("ops:nope"));
        assert!(auth.allows(Some(&good)));
        assert!(!auth.allows(Some(&bad)));
        assert!(!auth.allows(Some("Basic !!!")));
        assert!(!auth.allows(None));
        assert!(WriteAuth::Open.allows(None));
    }

    #[test]
    fn job_routes_and_error_bodies() {
        let root = scratch_dir("eam_serve_routes_test");
        let roots = EamRoots::new(&root.join("data"), &root.join("artifacts"), &repo_root());
        let env = LlmEnv::mock(LlmMode::Live);
        let auth = WriteAuth::Basic {
            user: "ops".into(),
            password: "pw".into(),
        };
        let idea = fs::read_to_string(repo_root().join("contracts/examples/idea_spec_ok.json")).expect("idea example");

        let (status, body) = handle(&roots, &env, &auth, &request("POST", "/jobs/idea", &idea, None));
        assert_eq!(status, 401);
        assert_eq!(body["error"]["code"], "unauthorized");

        let creds = format!("Basic {}", STANDARD.encode("ops:pw"));
        let (status, body) = handle(&roots, &env, &auth, &request("POST", "/jobs/idea", &idea, Some(&creds)));
        assert_eq!(status, 200, "unexpected: {}", body);
        let job_id = body["job_id"].as_str().expect("job_id").to_string();

        let (status, body) = handle(&roots, &env, &auth, &request("GET", "/jobs", "", None));
        assert_eq!(status, 200);
        assert_eq!(body["jobs"][0]["job_id"], job_id.as_str());

        let url = format!("/jobs/{}", job_id);
        let (status, body) = handle(&roots, &env, &auth, &request("GET", &url, "", None));
        assert_eq!(status, 200);
        assert_eq!(body["events"][0]["event_type"], "IDEA_SUBMITTED");

        let url = format!("/jobs/{}/approve", job_id);
        let (status, body) = handle(&roots, &env, &auth, &request("POST", &url, "", Some(&creds)));
        assert_eq!(status, 400, "unexpected: {}", body);
        assert!(body["error"]["message"].as_str().unwrap_or("").contains("step"));

        let (status, body) = handle(&roots, &env, &auth, &request("GET", "/jobs/missing123", "", None));
        assert_eq!(status, 404);
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"]["code"], "not_found");

        let (status, _) = handle(&roots, &env, &auth, &request("GET", "/runs/nope", "", None));
        assert_eq!(status, 404);
        let (status, body) = handle(&roots, &env, &auth, &request("GET", "/snapshots", "", None));
        assert_eq!(status, 200);
        assert_eq!(body["snapshots"], json!([]));
        let (status, _) = handle(&roots, &env, &auth, &request("DELETE", "/jobs", "", Some(&creds)));
        assert_eq!(status, 404);
        let _ = fs::remove_dir_all(root);
    }
}
