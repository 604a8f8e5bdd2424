use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate};
use eam_core::{EamError, EXIT_INVALID, EXIT_OK, EXIT_USAGE_OR_ERROR};
use include_dir::{include_dir, Dir};
use jsonschema::JSONSchema;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Versioned contract schemas shipped with the binary.
pub static CONTRACTS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/../../contracts");

pub const FETCH_REQUEST_SCHEMA: &str = "fetch_request_schema_v1.json";

const SCHEMA_FILES: &[(&str, &str)] = &[
    ("agent_run_v1", "agent_run_schema_v1.json"),
    ("blueprint_v1", "blueprint_schema_v1.json"),
    ("calc_trace_plan_v1", "calc_trace_plan_v1.json"),
    ("data_snapshot_manifest_v1", "data_snapshot_manifest_schema_v1.json"),
    ("dossier_v1", "dossier_schema_v1.json"),
    ("experience_card_v1", "experience_card_schema_v1.json"),
    ("gate_results_v1", "gate_results_schema_v1.json"),
    ("gate_results_v2", "gate_results_schema_v2.json"),
    ("idea_spec_v1", "idea_spec_schema_v1.json"),
    ("improvement_proposals_v1", "improvement_proposals_schema_v1.json"),
    ("ingest_manifest_v1", "ingest_manifest_schema_v1.json"),
    ("job_event_v1", "job_event_schema_v1.json"),
    ("job_event_v2", "job_event_schema_v2.json"),
    ("job_spec_v1", "job_spec_schema_v1.json"),
    ("llm_call_v1", "llm_call_schema_v1.json"),
    ("llm_session_v1", "llm_session_schema_v1.json"),
    ("llm_usage_report_v1", "llm_usage_report_schema_v1.json"),
    ("output_guard_report_v1", "output_guard_report_schema_v1.json"),
    ("quality_report_v1", "quality_report_schema_v1.json"),
    ("run_spec_v1", "run_spec_schema_v1.json"),
    ("run_spec_v2", "run_spec_schema_v2.json"),
    ("trial_event_v1", "trial_event_schema_v1.json"),
    ("variable_dictionary_v1", "variable_dictionary_v1.json"),
];

const DSL_FILES: &[(&str, &str)] = &[("signal_dsl_v1", "signal_dsl_v1.json")];

/// Outcome of a contract check: an exit code plus a single human line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validation {
    pub code: i32,
    pub message: String,
}

impl Validation {
    fn ok(schema_file: &str) -> Self {
        Validation {
            code: EXIT_OK,
            message: format!("OK: {}", schema_file),
        }
    }

    fn invalid(message: String) -> Self {
        Validation {
            code: EXIT_INVALID,
            message,
        }
    }

    fn usage(message: String) -> Self {
        Validation {
            code: EXIT_USAGE_OR_ERROR,
            message,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == EXIT_OK
    }

    /// Convert to a `Result`, mapping failures onto typed errors.
    pub fn into_result(self) -> Result<()> {
        match self.code {
            EXIT_OK => Ok(()),
            EXIT_INVALID => Err(EamError::InvalidContract(strip_prefix(&self.message)).into()),
            _ => Err(EamError::Usage(strip_prefix(&self.message)).into()),
        }
    }
}

fn strip_prefix(message: &str) -> String {
    message
        .strip_prefix("INVALID: ")
        .or_else(|| message.strip_prefix("ERROR: "))
        .unwrap_or(message)
        .to_string()
}

pub fn schema_file_for_version(schema_version: &str) -> Option<&'static str> {
    SCHEMA_FILES
        .iter()
        .find(|(v, _)| *v == schema_version)
        .map(|(_, f)| *f)
}

pub fn schema_file_for_dsl(dsl_version: &str) -> Option<&'static str> {
    DSL_FILES
        .iter()
        .find(|(v, _)| *v == dsl_version)
        .map(|(_, f)| *f)
}

pub fn load_embedded_schema(file_name: &str) -> Result<Value> {
    let file = CONTRACTS
        .get_file(file_name)
        .ok_or_else(|| anyhow!("missing schema: contracts/{}", file_name))?;
    let text = file
        .contents_utf8()
        .ok_or_else(|| anyhow!("schema is not utf-8: {}", file_name))?;
    Ok(serde_json::from_str(text)?)
}

pub fn compile_schema(schema: &Value) -> Result<JSONSchema> {
    JSONSchema::options()
        .compile(schema)
        .map_err(|e| anyhow!("schema compile failed: {}", e))
}

/// Validate `payload` against `schema`; report the first error ordered by
/// (instance pointer, message) so output is stable across runs.
pub fn validate_with_schema(payload: &Value, schema_file: &str, schema: &Value) -> Validation {
    let compiled = match compile_schema(schema) {
        Ok(c) => c,
        Err(e) => return Validation::usage(format!("ERROR: {}: {}", schema_file, e)),
    };
    let outcome = match compiled.validate(payload) {
        Ok(()) => Validation::ok(schema_file),
        Err(errors) => {
            let mut found: Vec<(String, String)> = errors
                .map(|e| {
                    let ptr = e.instance_path.to_string();
                    let ptr = if ptr.is_empty() { "/".to_string() } else { ptr };
                    (ptr, e.to_string())
                })
                .collect();
            found.sort();
            match found.into_iter().next() {
                Some((ptr, msg)) => {
                    Validation::invalid(format!("INVALID: {} at {}: {}", schema_file, ptr, msg))
                }
                None => Validation::ok(schema_file),
            }
        }
    };
    outcome
}

/// Dispatch on `schema_version` (else `dsl_version`) and validate.
pub fn validate_payload(payload: &Value) -> Validation {
    let (field, version) = match discriminator(payload) {
        Some(d) => d,
        None => {
            return Validation::usage(
                "ERROR: missing schema_version/dsl_version (or pass --schema <schema_file>)"
                    .to_string(),
            )
        }
    };
    let file = if field == "schema_version" {
        schema_file_for_version(&version)
    } else {
        schema_file_for_dsl(&version)
    };
    let file = match file {
        Some(f) => f,
        None => {
            return Validation::invalid(format!(
                "INVALID: discriminator at /{}: Unknown {}: '{}'",
                field, field, version
            ))
        }
    };
    match load_embedded_schema(file) {
        Ok(schema) => validate_with_schema(payload, file, &schema),
        Err(e) => Validation::usage(format!("ERROR: {}", e)),
    }
}

fn discriminator(payload: &Value) -> Option<(&'static str, String)> {
    let obj = payload.as_object()?;
    for field in ["schema_version", "dsl_version"] {
        if let Some(v) = obj.get(field).and_then(|v| v.as_str()) {
            if !v.trim().is_empty() {
                return Some((field, v.to_string()));
            }
        }
    }
    None
}

/// Validate a file on disk. `forced_schema` may be a path to a schema file or
/// the name of an embedded one; it bypasses discriminator dispatch.
pub fn validate_file(path: &Path, forced_schema: Option<&Path>) -> Validation {
    if !path.is_file() {
        return Validation::usage(format!("ERROR: file not found: {}", path.display()));
    }
    let payload = match std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|s| serde_json::from_str::<Value>(&s).map_err(anyhow::Error::from))
    {
        Ok(v) => v,
        Err(e) => {
            return Validation::invalid(format!("INVALID: {} at /: invalid json: {}", path.display(), e))
        }
    };
    let result = match forced_schema {
        Some(schema_path) => validate_forced(&payload, schema_path),
        None => validate_payload(&payload),
    };
    if result.is_ok() {
        Validation::ok(&path.display().to_string())
    } else {
        result
    }
}

fn validate_forced(payload: &Value, schema_path: &Path) -> Validation {
    let name = schema_path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("schema.json")
        .to_string();
    let schema = if schema_path.is_file() {
        std::fs::read_to_string(schema_path)
            .map_err(anyhow::Error::from)
            .and_then(|s| serde_json::from_str::<Value>(&s).map_err(anyhow::Error::from))
    } else {
        load_embedded_schema(&name)
    };
    match schema {
        Ok(schema) => validate_with_schema(payload, &name, &schema),
        Err(e) => Validation::usage(format!("ERROR: {}", e)),
    }
}

/// Shorthand used by writers: dispatch-validate and turn failure into an error.
pub fn ensure_valid(payload: &Value) -> Result<()> {
    validate_payload(payload).into_result()
}

// ---------------------------------------------------------------------------
// fetch request
// ---------------------------------------------------------------------------

fn fetch_value<'a>(req: &'a Value, key: &str) -> Option<(String, &'a Value)> {
    if let Some(v) = req.get(key).filter(|v| !v.is_null()) {
        return Some((format!("/{}", key), v));
    }
    for scope in ["intent", "kwargs"] {
        if let Some(v) = req
            .get(scope)
            .filter(|s| s.is_object())
            .and_then(|s| s.get(key))
            .filter(|v| !v.is_null())
        {
            return Some((format!("/{}/{}", scope, key), v));
        }
    }
    None
}

fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s.replace('Z', "+00:00")) {
        return Some(dt.date_naive());
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|dt| dt.date())
}

fn has_symbol_value(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => items
            .iter()
            .any(|i| i.as_str().map(|s| !s.trim().is_empty()).unwrap_or(false)),
        _ => true,
    }
}

fn fetch_request_has_symbols(req: &Value) -> bool {
    let mut candidates: Vec<Option<&Value>> = vec![req.get("symbols")];
    if let Some(intent) = req.get("intent").filter(|v| v.is_object()) {
        candidates.push(intent.get("symbols"));
    }
    if let Some(kwargs) = req.get("kwargs").filter(|v| v.is_object()) {
        candidates.push(kwargs.get("symbols"));
        candidates.push(kwargs.get("symbol"));
    }
    candidates.into_iter().flatten().any(has_symbol_value)
}

fn fetch_request_auto_symbols(req: &Value) -> std::result::Result<(bool, &'static str), String> {
    let top = req.get("auto_symbols").filter(|v| !v.is_null());
    let in_intent = req
        .get("intent")
        .filter(|v| v.is_object())
        .and_then(|i| i.get("auto_symbols"))
        .filter(|v| !v.is_null());
    if let Some(t) = top {
        if !t.is_boolean() {
            return Err("INVALID: fetch_request at /auto_symbols: auto_symbols must be boolean".into());
        }
    }
    if let Some(i) = in_intent {
        if !i.is_boolean() {
            return Err(
                "INVALID: fetch_request at /intent/auto_symbols: auto_symbols must be boolean".into(),
            );
        }
    }
    match (top.and_then(|v| v.as_bool()), in_intent.and_then(|v| v.as_bool())) {
        (Some(t), Some(i)) if t != i => Err(
            "INVALID: fetch_request at /intent/auto_symbols: auto_symbols conflicts with top-level /auto_symbols"
                .into(),
        ),
        (_, Some(i)) => Ok((i, "/intent/auto_symbols")),
        (Some(t), None) => Ok((t, "/auto_symbols")),
        (None, None) => Ok((false, "/auto_symbols")),
    }
}

/// Schema check plus the cross-field rules a fetch request must satisfy.
pub fn validate_fetch_request(req: &Value) -> Validation {
    let schema = match load_embedded_schema(FETCH_REQUEST_SCHEMA) {
        Ok(s) => s,
        Err(e) => return Validation::usage(format!("ERROR: {}", e)),
    };
    let base = validate_with_schema(req, FETCH_REQUEST_SCHEMA, &schema);
    if !base.is_ok() {
        return base;
    }
    if !req.is_object() {
        return Validation::invalid("INVALID: fetch_request must be an object".into());
    }
    let has_intent = req.get("intent").map(|v| v.is_object()).unwrap_or(false);
    let has_function = req
        .get("function")
        .and_then(|v| v.as_str())
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false);
    if has_intent && has_function {
        return Validation::invalid(
            "INVALID: fetch_request at /: intent and function modes are mutually exclusive in v1"
                .into(),
        );
    }
    let has_symbols = fetch_request_has_symbols(req);
    let (auto_symbols, auto_path) = match fetch_request_auto_symbols(req) {
        Ok(v) => v,
        Err(msg) => return Validation::invalid(msg),
    };
    if !has_symbols && !auto_symbols {
        return Validation::invalid(
            "INVALID: fetch_request at /: symbols (or kwargs.symbol) is required unless auto_symbols=true"
                .into(),
        );
    }
    if has_symbols && auto_symbols {
        return Validation::invalid(format!(
            "INVALID: fetch_request at {}: auto_symbols=true cannot be combined with explicit symbols",
            auto_path
        ));
    }

    let mut bounds: Vec<(String, NaiveDate)> = Vec::new();
    for key in ["start", "end"] {
        if let Some((ptr, raw)) = fetch_value(req, key) {
            let s = match raw.as_str() {
                Some(s) => s,
                None => {
                    return Validation::invalid(format!(
                        "INVALID: fetch_request at {}: {} must be string",
                        ptr, key
                    ))
                }
            };
            match parse_iso_date(s) {
                Some(d) => bounds.push((ptr, d)),
                None => {
                    return Validation::invalid(format!(
                        "INVALID: fetch_request at {}: {} must be ISO date/datetime string",
                        ptr, key
                    ))
                }
            }
        }
    }
    if let (Some((start_ptr, start)), Some((_, end))) = (
        bounds.iter().find(|(p, _)| p.ends_with("/start")),
        bounds.iter().find(|(p, _)| p.ends_with("/end")),
    ) {
        if start > end {
            return Validation::invalid(format!(
                "INVALID: fetch_request at {}: start must be <= end ({} > {})",
                start_ptr, start, end
            ));
        }
    }
    Validation::ok(FETCH_REQUEST_SCHEMA)
}

// ---------------------------------------------------------------------------
// examples
// ---------------------------------------------------------------------------

/// Check every `*_ok.json` / `*_bad.json` fixture under `dir`. Returns the
/// files whose outcome did not match their suffix.
pub fn check_examples_dir(dir: &Path) -> Result<Vec<(PathBuf, Validation)>> {
    let mut mismatches = Vec::new();
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    entries.sort();
    for path in entries {
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let outcome = if name.starts_with("fetch_request") {
            match std::fs::read_to_string(&path)
                .ok()
                .and_then(|s| serde_json::from_str::<Value>(&s).ok())
            {
                Some(v) => validate_fetch_request(&v),
                None => Validation::invalid(format!("INVALID: {} at /: invalid json", name)),
            }
        } else {
            validate_file(&path, None)
        };
        let expected_ok = name.ends_with("_ok.json");
        let expected_bad = name.ends_with("_bad.json");
        if (expected_ok && !outcome.is_ok())
            || (expected_bad && (outcome.code != EXIT_INVALID || !outcome.message.contains(" at ")))
        {
            tracing::warn!(file = %name, code = outcome.code, "example does not match its expected outcome");
            mismatches.push((path, outcome));
        }
    }
    Ok(mismatches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn examples_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../contracts/examples")
    }

    #[test]
    fn every_registered_schema_is_embedded_and_compiles() {
        for (_, file) in SCHEMA_FILES.iter().chain(DSL_FILES.iter()) {
            let schema = load_embedded_schema(file).expect("embedded schema");
            compile_schema(&schema).expect("schema compiles");
        }
        let fetch = load_embedded_schema(FETCH_REQUEST_SCHEMA).expect("fetch schema");
        compile_schema(&fetch).expect("fetch schema compiles");
    }

    #[test]
    fn examples_match_their_suffix() {
        let mismatches = check_examples_dir(&examples_dir()).expect("scan examples");
        assert!(mismatches.is_empty(), "unexpected outcomes: {:?}", mismatches);
    }

    #[test]
    fn missing_discriminator_is_usage_error() {
        let v = validate_payload(&json!({"x": 1}));
        assert_eq!(v.code, EXIT_USAGE_OR_ERROR);
        assert!(v.message.contains("missing schema_version/dsl_version"));
    }

    #[test]
    fn unknown_discriminator_is_invalid() {
        let v = validate_payload(&json!({"schema_version": "nope_v9"}));
        assert_eq!(v.code, EXIT_INVALID);
        assert_eq!(
            v.message,
            "INVALID: discriminator at /schema_version: Unknown schema_version: 'nope_v9'"
        );
    }

    #[test]
    fn first_error_is_reported_with_pointer() {
        let v = validate_payload(&json!({
            "schema_version": "trial_event_v1",
            "run_id": 5
        }));
        assert_eq!(v.code, EXIT_INVALID);
        assert!(v.message.starts_with("INVALID: trial_event_schema_v1.json at /"), "{}", v.message);
        let again = validate_payload(&json!({
            "schema_version": "trial_event_v1",
            "run_id": 5
        }));
        assert_eq!(v, again);
    }

    #[test]
    fn fetch_request_rejects_intent_and_function_together() {
        let v = validate_fetch_request(&json!({
            "intent": {"asset": "stock", "symbols": ["AAA"]},
            "function": "fetch_stock_day"
        }));
        assert_eq!(v.code, EXIT_INVALID);
        assert!(v.message.contains("mutually exclusive"), "{}", v.message);
    }

    #[test]
    fn fetch_request_requires_symbols_unless_auto() {
        let missing = validate_fetch_request(&json!({"intent": {"asset": "stock"}}));
        assert!(missing.message.contains("symbols (or kwargs.symbol) is required"));

        let both = validate_fetch_request(&json!({
            "intent": {"asset": "stock", "symbols": ["AAA"], "auto_symbols": true}
        }));
        assert!(both.message.contains("/intent/auto_symbols"), "{}", both.message);

        let conflict = validate_fetch_request(&json!({
            "auto_symbols": false,
            "intent": {"asset": "stock", "auto_symbols": true}
        }));
        assert!(conflict.message.contains("conflicts with top-level"));

        let auto = validate_fetch_request(&json!({"intent": {"asset": "stock", "auto_symbols": true}}));
        assert!(auto.is_ok(), "{}", auto.message);
    }

    #[test]
    fn fetch_request_checks_date_order() {
        let v = validate_fetch_request(&json!({
            "intent": {"asset": "stock", "symbols": ["AAA"], "start": "2024-02-01", "end": "2024-01-01"}
        }));
        assert_eq!(v.code, EXIT_INVALID);
        assert!(v.message.contains("/intent/start: start must be <= end"), "{}", v.message);

        let bad = validate_fetch_request(&json!({
            "function": "fetch_stock_day",
            "kwargs": {"symbol": "AAA", "start": "yesterday"}
        }));
        assert!(bad.message.contains("ISO date"), "{}", bad.message);
    }
}
