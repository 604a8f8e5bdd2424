use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const EXIT_OK: i32 = 0;
pub const EXIT_USAGE_OR_ERROR: i32 = 1;
pub const EXIT_INVALID: i32 = 2;

/// Typed failure kinds shared by every component. Library code wraps these in
/// `anyhow::Error`; boundaries recover the kind with [`exit_code_for`].
#[derive(Debug, thiserror::Error)]
pub enum EamError {
    #[error("ERROR: {0}")]
    Usage(String),
    #[error("INVALID: {0}")]
    InvalidContract(String),
    #[error("INVALID: {0}")]
    PolicyViolation(String),
    #[error("INVALID: {0}")]
    GateInvalid(String),
    #[error("budget_breach: {0}")]
    BudgetBreach(String),
    #[error("cassette miss for prompt_hash (replay mode): {0}")]
    CassetteMiss(String),
    #[error("write_conflict: {0}")]
    WriteConflict(String),
    #[error("FETCH_REQUEST_INVALID: {0}")]
    FetchRequestInvalid(String),
    #[error("holdout_leak: {0}")]
    HoldoutLeak(String),
    #[error("not_found: {0}")]
    NotFound(String),
}

impl EamError {
    pub fn exit_code(&self) -> i32 {
        match self {
            EamError::Usage(_) | EamError::NotFound(_) => EXIT_USAGE_OR_ERROR,
            _ => EXIT_INVALID,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            EamError::Usage(_) => "usage_error",
            EamError::InvalidContract(_) => "invalid_contract",
            EamError::PolicyViolation(_) => "policy_violation",
            EamError::GateInvalid(_) => "gate_invalid",
            EamError::BudgetBreach(_) => "budget_breach",
            EamError::CassetteMiss(_) => "cassette_miss",
            EamError::WriteConflict(_) => "write_conflict",
            EamError::FetchRequestInvalid(_) => "fetch_request_invalid",
            EamError::HoldoutLeak(_) => "holdout_leak",
            EamError::NotFound(_) => "not_found",
        }
    }
}

pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<EamError>()
        .map(|e| e.exit_code())
        .unwrap_or(EXIT_USAGE_OR_ERROR)
}

pub fn error_code_for(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<EamError>()
        .map(|e| e.code())
        .unwrap_or("command_failed")
}

// ---------------------------------------------------------------------------
// hashing + canonical JSON
// ---------------------------------------------------------------------------

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = std::io::Read::read(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compact JSON with sorted object keys and non-ASCII escaped as `\uXXXX`.
/// This is the byte form every content hash in the system is computed over.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => out.push_str(&value.to_string()),
        Value::String(s) => write_ascii_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_ascii_string(key, out);
                out.push(':');
                if let Some(v) = map.get(key.as_str()) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
    }
}

fn write_ascii_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 || (c as u32) > 0x7f => {
                let mut buf = [0u16; 2];
                for unit in c.encode_utf16(&mut buf) {
                    out.push_str(&format!("\\u{:04x}", unit));
                }
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

pub fn canonical_json_digest(value: &Value) -> String {
    sha256_bytes(canonical_json(value).as_bytes())
}

/// First 12 hex chars of the canonical digest; used for job ids and run ids.
pub fn short_digest(value: &Value) -> String {
    canonical_json_digest(value)[..12].to_string()
}

/// Rebuild every object with keys inserted in sorted order so that pretty
/// output is stable regardless of the map implementation.
pub fn sorted_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                if let Some(v) = map.get(k.as_str()) {
                    out.insert(k.clone(), sorted_value(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted_value).collect()),
        other => other.clone(),
    }
}

/// Indent-2, sorted keys, trailing newline.
pub fn pretty_json_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(&sorted_value(value))?;
    bytes.push(b'\n');
    Ok(bytes)
}

// ---------------------------------------------------------------------------
// filesystem
// ---------------------------------------------------------------------------

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create dir {}", path.display()))?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    atomic_write_bytes(path, &pretty_json_bytes(value)?)
}

pub fn atomic_write_text(path: &Path, text: &str) -> Result<()> {
    atomic_write_bytes(path, text.as_bytes())
}

pub fn read_json(path: &Path) -> Result<Value> {
    let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parse json {}", path.display()))
}

/// Read a JSON file, returning `None` when it is missing or not an object.
pub fn read_json_object(path: &Path) -> Option<Value> {
    read_json(path).ok().filter(|v| v.is_object())
}

/// Append one canonical JSON line. A single `write_all` on an O_APPEND handle
/// keeps concurrent appends line-atomic on local filesystems.
pub fn append_jsonl(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut line = canonical_json(value);
    line.push('\n');
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open for append {}", path.display()))?;
    file.write_all(line.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Read a JSONL file. Blank lines are skipped and a torn final line (no
/// trailing newline, unparsable) is ignored; any other bad line is an error.
pub fn read_jsonl(path: &Path) -> Result<Vec<Value>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path)?;
    let lines: Vec<String> = BufReader::new(file).lines().collect::<std::io::Result<_>>()?;
    let total = lines.len();
    let mut out = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(v) => out.push(v),
            Err(_) if idx + 1 == total => {
                tracing::warn!(path = %path.display(), "skipping torn trailing jsonl line");
            }
            Err(e) => return Err(anyhow!("invalid jsonl line {} in {}: {}", idx + 1, path.display(), e)),
        }
    }
    Ok(out)
}

/// Recursively copy `src` into `dst`, creating directories as needed.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<Vec<PathBuf>> {
    let mut copied = Vec::new();
    for entry in walkdir::WalkDir::new(src).sort_by_file_name() {
        let entry = entry?;
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => continue,
        };
        let target = dst.join(&rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied.push(rel);
        }
    }
    Ok(copied)
}

/// Exclusive marker file removed on drop.
#[derive(Debug)]
pub struct ExclusiveLock {
    path: PathBuf,
}

impl ExclusiveLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn acquire_exclusive_lock(lock_path: &Path) -> Result<ExclusiveLock> {
    if let Some(parent) = lock_path.parent() {
        ensure_dir(parent)?;
    }
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(mut file) => {
            let payload = format!(
                "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                std::process::id(),
                Utc::now().to_rfc3339()
            );
            let _ = file.write_all(payload.as_bytes());
            let _ = file.sync_all();
            Ok(ExclusiveLock {
                path: lock_path.to_path_buf(),
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(EamError::WriteConflict(format!(
            "operation_in_progress: {} is held by another worker",
            lock_path.display()
        ))
        .into()),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// time
// ---------------------------------------------------------------------------

/// Current time, pinned by `SOURCE_DATE_EPOCH` when set.
pub fn now_utc() -> DateTime<Utc> {
    if let Ok(raw) = std::env::var("SOURCE_DATE_EPOCH") {
        if let Ok(secs) = raw.trim().parse::<i64>() {
            if let Some(ts) = Utc.timestamp_opt(secs, 0).single() {
                return ts;
            }
        }
    }
    Utc::now()
}

pub fn now_iso() -> String {
    now_utc().to_rfc3339_opts(SecondsFormat::Secs, false)
}

// ---------------------------------------------------------------------------
// roots + env
// ---------------------------------------------------------------------------

pub fn env_truthy(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// The named roots every component works under. Read once from the
/// environment at the process boundary and passed down explicitly.
#[derive(Clone, Debug)]
pub struct EamRoots {
    pub data_root: PathBuf,
    pub artifact_root: PathBuf,
    pub job_root: PathBuf,
    pub registry_root: PathBuf,
    pub repo_root: PathBuf,
}

impl EamRoots {
    pub fn new(data_root: &Path, artifact_root: &Path, repo_root: &Path) -> Self {
        EamRoots {
            data_root: data_root.to_path_buf(),
            artifact_root: artifact_root.to_path_buf(),
            job_root: artifact_root.join("jobs"),
            registry_root: artifact_root.join("registry"),
            repo_root: repo_root.to_path_buf(),
        }
    }

    pub fn from_env() -> Self {
        let data_root = env_path("EAM_DATA_ROOT").unwrap_or_else(|| PathBuf::from("/data"));
        let artifact_root =
            env_path("EAM_ARTIFACT_ROOT").unwrap_or_else(|| PathBuf::from("/artifacts"));
        let repo_root = env_path("EAM_REPO_ROOT").unwrap_or_else(find_repo_root);
        let mut roots = EamRoots::new(&data_root, &artifact_root, &repo_root);
        if let Some(job_root) = env_path("EAM_JOB_ROOT") {
            roots.job_root = job_root;
        }
        if let Some(registry_root) = env_path("EAM_REGISTRY_ROOT") {
            roots.registry_root = registry_root;
        }
        roots
    }

    pub fn dossiers_dir(&self) -> PathBuf {
        self.artifact_root.join("dossiers")
    }

    pub fn lake_dir(&self) -> PathBuf {
        self.data_root.join("lake")
    }

    pub fn policies_dir(&self) -> PathBuf {
        self.repo_root.join("policies")
    }

    pub fn default_bundle_path(&self) -> PathBuf {
        self.policies_dir().join("policy_bundle_v1.yaml")
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.job_root.join(job_id)
    }
}

/// Nearest ancestor of the working directory that holds `policies/`.
pub fn find_repo_root() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut cur: Option<&Path> = Some(cwd.as_path());
    while let Some(dir) = cur {
        if dir.join("policies").is_dir() {
            return dir.to_path_buf();
        }
        cur = dir.parent();
    }
    cwd
}

/// Ids used as directory names: `^[A-Za-z0-9_-]{1,128}$`.
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Install the stderr fmt subscriber. Filter comes from `EAM_LOG`, else `warn`.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("EAM_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Unique scratch directory for tests and temporary work.
pub fn scratch_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "{}_{}_{}",
        prefix,
        std::process::id(),
        Utc::now().timestamp_micros()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_and_escapes_non_ascii() {
        let v = json!({"b": 1, "a": {"z": [1, 2], "y": "caf\u{e9}"}});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":{"y":"caf\u00e9","z":[1,2]},"b":1}"#
        );
    }

    #[test]
    fn short_digest_is_twelve_hex_chars() {
        let d = short_digest(&json!({"x": 1}));
        assert_eq!(d.len(), 12);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(d, short_digest(&json!({"x": 1})));
    }

    #[test]
    fn pretty_json_ends_with_newline() {
        let bytes = pretty_json_bytes(&json!({"b": 1, "a": 2})).expect("pretty");
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.ends_with("}\n"));
        assert!(text.find("\"a\"").expect("a") < text.find("\"b\"").expect("b"));
    }

    #[test]
    fn jsonl_append_is_prefix_preserving_and_torn_tail_is_skipped() {
        let root = scratch_dir("eam_core_jsonl_test");
        ensure_dir(&root).expect("root");
        let path = root.join("events.jsonl");
        append_jsonl(&path, &json!({"n": 1})).expect("append 1");
        let first = fs::read(&path).expect("read");
        append_jsonl(&path, &json!({"n": 2})).expect("append 2");
        let second = fs::read(&path).expect("read");
        assert!(second.len() > first.len());
        assert_eq!(&second[..first.len()], &first[..]);

        let mut f = fs::OpenOptions::new().append(true).open(&path).expect("open");
        f.write_all(b"{\"n\":").expect("torn write");
        let rows = read_jsonl(&path).expect("read jsonl");
        assert_eq!(rows.len(), 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn exclusive_lock_is_exclusive() {
        let root = scratch_dir("eam_core_lock_test");
        let lock_path = root.join(".lock");
        let lock1 = acquire_exclusive_lock(&lock_path).expect("first lock must succeed");
        let err = acquire_exclusive_lock(&lock_path).expect_err("second lock must fail");
        assert!(
            err.to_string().contains("operation_in_progress"),
            "unexpected lock error: {}",
            err
        );
        drop(lock1);
        let lock2 = acquire_exclusive_lock(&lock_path).expect("lock should be re-acquirable");
        drop(lock2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn safe_ids_reject_path_characters() {
        assert!(is_safe_id("job_abc-123"));
        assert!(!is_safe_id(""));
        assert!(!is_safe_id("../etc"));
        assert!(!is_safe_id(&"a".repeat(129)));
    }

    #[test]
    fn eam_error_maps_exit_codes() {
        let usage: anyhow::Error = EamError::Usage("x".into()).into();
        let invalid: anyhow::Error = EamError::InvalidContract("x".into()).into();
        let plain = anyhow!("boom");
        assert_eq!(exit_code_for(&usage), EXIT_USAGE_OR_ERROR);
        assert_eq!(exit_code_for(&invalid), EXIT_INVALID);
        assert_eq!(exit_code_for(&plain), EXIT_USAGE_OR_ERROR);
        assert_eq!(error_code_for(&invalid), "invalid_contract");
    }
}
