use anyhow::{anyhow, Context, Result};
use eam_core::{atomic_write_text, now_iso, sha256_file, EamError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const POLICY_VERSION: &str = "v1";
pub const ASOF_RULE: &str = "available_at<=as_of";
pub const HOLDOUT_OUTPUT_RULE: &str = "pass_fail_minimal_summary";
pub const LOCK_FILE: &str = "policy_lock_v1.yaml";
pub const LOCK_VERSION: &str = "policy_lock_v1";

/// Parameter names that belong to policies and must never appear inline in
/// blueprints, runspecs or agent outputs.
pub const INLINE_POLICY_KEYS: &[&str] = &[
    "commission_bps",
    "slippage_bps",
    "tax_bps",
    "min_fee",
    "currency",
    "default_latency_seconds",
    "bar_close_to_signal_seconds",
    "trade_lag_bars_default",
    "asof_rule",
    "max_leverage",
    "max_positions",
    "max_drawdown",
];

const BUNDLE_FORBIDDEN_KEYS: &[&str] = &["params", "overrides", "policies"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PolicyKind {
    Execution,
    Cost,
    AsofLatency,
    Risk,
    GateSuite,
    Budget,
    LlmBudget,
}

impl PolicyKind {
    pub const REQUIRED: [PolicyKind; 5] = [
        PolicyKind::Execution,
        PolicyKind::Cost,
        PolicyKind::AsofLatency,
        PolicyKind::Risk,
        PolicyKind::GateSuite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Execution => "execution",
            PolicyKind::Cost => "cost",
            PolicyKind::AsofLatency => "asof_latency",
            PolicyKind::Risk => "risk",
            PolicyKind::GateSuite => "gate_suite",
            PolicyKind::Budget => "budget",
            PolicyKind::LlmBudget => "llm_budget",
        }
    }

    pub fn bundle_key(&self) -> &'static str {
        match self {
            PolicyKind::Execution => "execution_policy_id",
            PolicyKind::Cost => "cost_policy_id",
            PolicyKind::AsofLatency => "asof_latency_policy_id",
            PolicyKind::Risk => "risk_policy_id",
            PolicyKind::GateSuite => "gate_suite_id",
            PolicyKind::Budget => "budget_policy_id",
            PolicyKind::LlmBudget => "llm_budget_policy_id",
        }
    }

    pub fn parse(raw: &str) -> Option<PolicyKind> {
        match raw {
            "execution" => Some(PolicyKind::Execution),
            "cost" => Some(PolicyKind::Cost),
            "asof_latency" => Some(PolicyKind::AsofLatency),
            "risk" => Some(PolicyKind::Risk),
            "gate_suite" => Some(PolicyKind::GateSuite),
            "budget" => Some(PolicyKind::Budget),
            "llm_budget" => Some(PolicyKind::LlmBudget),
            _ => None,
        }
    }

    /// Kind of a policy document, derived from its `policy_id` prefix.
    pub fn from_policy_id(policy_id: &str) -> Option<PolicyKind> {
        if policy_id.starts_with("llm_budget_policy") {
            Some(PolicyKind::LlmBudget)
        } else if policy_id.starts_with("execution_policy") {
            Some(PolicyKind::Execution)
        } else if policy_id.starts_with("cost_policy") {
            Some(PolicyKind::Cost)
        } else if policy_id.starts_with("asof_latency_policy") {
            Some(PolicyKind::AsofLatency)
        } else if policy_id.starts_with("risk_policy") {
            Some(PolicyKind::Risk)
        } else if policy_id.starts_with("gate_suite") {
            Some(PolicyKind::GateSuite)
        } else if policy_id.starts_with("budget_policy") {
            Some(PolicyKind::Budget)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// typed params
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct ExecutionParams {
    pub order_timing: String,
    pub fill_price: String,
    #[serde(default)]
    pub allow_short: bool,
    #[serde(default)]
    pub lot_size: Option<f64>,
    #[serde(default)]
    pub rounding: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CostParams {
    pub commission_bps: f64,
    pub slippage_bps: f64,
    #[serde(default)]
    pub tax_bps: Option<f64>,
    #[serde(default)]
    pub min_fee: Option<f64>,
}

impl CostParams {
    pub fn doubled(&self) -> CostParams {
        CostParams {
            commission_bps: self.commission_bps * 2.0,
            slippage_bps: self.slippage_bps * 2.0,
            tax_bps: self.tax_bps,
            min_fee: self.min_fee,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AsofLatencyParams {
    pub asof_rule: String,
    pub default_latency_seconds: i64,
    pub bar_close_to_signal_seconds: i64,
    pub trade_lag_bars_default: i64,
}

impl AsofLatencyParams {
    pub fn lag_bars(&self) -> u32 {
        self.trade_lag_bars_default.max(1) as u32
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RiskParams {
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
    #[serde(default = "default_max_positions")]
    pub max_positions: u64,
    #[serde(default = "default_max_turnover")]
    pub max_turnover: f64,
    #[serde(default)]
    pub max_drawdown: Option<f64>,
}

fn default_max_leverage() -> f64 {
    1.0
}

fn default_max_positions() -> u64 {
    20
}

fn default_max_turnover() -> f64 {
    1.0
}

impl Default for RiskParams {
    fn default() -> Self {
        RiskParams {
            max_leverage: default_max_leverage(),
            max_positions: default_max_positions(),
            max_turnover: default_max_turnover(),
            max_drawdown: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct GateSpec {
    pub gate_id: String,
    pub gate_version: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HoldoutPolicy {
    pub output: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GateSuiteParams {
    pub gates: Vec<GateSpec>,
    pub holdout_policy: HoldoutPolicy,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BudgetParams {
    pub max_proposals_per_job: u64,
    pub max_spawn_per_job: u64,
    pub max_total_iterations: u64,
    #[serde(default)]
    pub stop_if_no_improvement_n: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LlmBudgetParams {
    pub max_calls_per_job: u64,
    pub max_prompt_chars_per_job: u64,
    pub max_response_chars_per_job: u64,
    pub max_wall_seconds_per_job: f64,
    #[serde(default)]
    pub max_calls_per_agent_run: Option<u64>,
}

// ---------------------------------------------------------------------------
// loading
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct PolicyBundle {
    pub path: PathBuf,
    pub policy_bundle_id: String,
    pub doc: Value,
}

impl PolicyBundle {
    pub fn policies_dir(&self) -> PathBuf {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn policy_id(&self, kind: PolicyKind) -> Option<&str> {
        self.doc
            .get(kind.bundle_key())
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    }
}

#[derive(Clone, Debug)]
pub struct ResolvedPolicy {
    pub policy_id: String,
    pub path: PathBuf,
    pub doc: Value,
}

impl ResolvedPolicy {
    pub fn params(&self) -> &Value {
        self.doc.get("params").unwrap_or(&Value::Null)
    }

    pub fn typed_params<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.params().clone()).map_err(|e| {
            EamError::PolicyViolation(format!("{} at /params: {}", file_label(&self.path), e))
                .into()
        })
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("policy")
        .to_string()
}

fn violation(path: &Path, ptr: &str, reason: impl Into<String>) -> anyhow::Error {
    EamError::PolicyViolation(format!("{} at {}: {}", file_label(path), ptr, reason.into())).into()
}

pub fn load_yaml(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value = serde_yaml::from_str(&text)
        .map_err(|e| violation(path, "/", format!("invalid yaml: {}", e)))?;
    if !value.is_object() {
        return Err(violation(path, "/", "policy document must be a mapping"));
    }
    Ok(value)
}

pub fn load_policy_bundle(path: &Path) -> Result<PolicyBundle> {
    let doc = load_yaml(path)?;
    validate_bundle_doc(path, &doc)?;
    let bundle = PolicyBundle {
        path: path.to_path_buf(),
        policy_bundle_id: doc
            .get("policy_bundle_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        doc,
    };
    let lock_path = bundle.policies_dir().join(LOCK_FILE);
    if lock_path.is_file() {
        verify_lock(&bundle.policies_dir())?;
    }
    Ok(bundle)
}

fn validate_bundle_doc(path: &Path, doc: &Value) -> Result<()> {
    match doc.get("policy_version").and_then(|v| v.as_str()) {
        Some(POLICY_VERSION) => {}
        _ => return Err(violation(path, "/policy_version", "policy_version must be 'v1'")),
    }
    let id = doc
        .get("policy_bundle_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if id.trim().is_empty() {
        return Err(violation(path, "/policy_bundle_id", "policy_bundle_id is required"));
    }
    for key in BUNDLE_FORBIDDEN_KEYS {
        if doc.get(*key).is_some() {
            return Err(violation(
                path,
                &format!("/{}", key),
                "inline params/overrides are forbidden in a policy bundle",
            ));
        }
    }
    for kind in PolicyKind::REQUIRED {
        let ok = doc
            .get(kind.bundle_key())
            .and_then(|v| v.as_str())
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        if !ok {
            return Err(violation(
                path,
                &format!("/{}", kind.bundle_key()),
                format!("{} is required", kind.bundle_key()),
            ));
        }
    }
    Ok(())
}

fn policy_files(policies_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(policies_dir)
        .with_context(|| format!("read policies dir {}", policies_dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            let ext = p.extension().and_then(|s| s.to_str());
            (ext == Some("yaml") || ext == Some("yml"))
                && p.file_name().and_then(|s| s.to_str()) != Some(LOCK_FILE)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Find the single policy document with `policy_id == id` under `policies_dir`.
pub fn find_policy(policies_dir: &Path, id: &str) -> Result<ResolvedPolicy> {
    let mut matches = Vec::new();
    for path in policy_files(policies_dir)? {
        let doc = load_yaml(&path)?;
        if doc.get("policy_id").and_then(|v| v.as_str()) == Some(id) {
            matches.push((path, doc));
        }
    }
    match matches.len() {
        0 => Err(EamError::PolicyViolation(format!(
            "policy_id not found under {}: {}",
            policies_dir.display(),
            id
        ))
        .into()),
        1 => {
            let (path, doc) = matches.remove(0);
            validate_policy_doc(&path, &doc)?;
            Ok(ResolvedPolicy {
                policy_id: id.to_string(),
                path,
                doc,
            })
        }
        _ => Err(EamError::PolicyViolation(format!("duplicate policy_id found: {}", id)).into()),
    }
}

pub fn resolve_policy(bundle: &PolicyBundle, kind: PolicyKind) -> Result<ResolvedPolicy> {
    let id = bundle.policy_id(kind).ok_or_else(|| {
        violation(
            &bundle.path,
            &format!("/{}", kind.bundle_key()),
            format!("{} is required", kind.bundle_key()),
        )
    })?;
    find_policy(&bundle.policies_dir(), id)
}

/// Resolve an optional reference (budget, llm_budget); absent id is `None`.
pub fn resolve_optional_policy(
    bundle: &PolicyBundle,
    kind: PolicyKind,
) -> Result<Option<ResolvedPolicy>> {
    match bundle.policy_id(kind) {
        Some(id) => Ok(Some(find_policy(&bundle.policies_dir(), id)?)),
        None => Ok(None),
    }
}

/// Every policy a run depends on, resolved and typed.
#[derive(Clone, Debug)]
pub struct ResolvedPolicies {
    pub bundle: PolicyBundle,
    pub execution: ResolvedPolicy,
    pub cost: ResolvedPolicy,
    pub asof_latency: ResolvedPolicy,
    pub risk: ResolvedPolicy,
    pub gate_suite: ResolvedPolicy,
    pub budget: Option<ResolvedPolicy>,
    pub llm_budget: Option<ResolvedPolicy>,
}

impl ResolvedPolicies {
    pub fn load(bundle_path: &Path) -> Result<Self> {
        let bundle = load_policy_bundle(bundle_path)?;
        Ok(ResolvedPolicies {
            execution: resolve_policy(&bundle, PolicyKind::Execution)?,
            cost: resolve_policy(&bundle, PolicyKind::Cost)?,
            asof_latency: resolve_policy(&bundle, PolicyKind::AsofLatency)?,
            risk: resolve_policy(&bundle, PolicyKind::Risk)?,
            gate_suite: resolve_policy(&bundle, PolicyKind::GateSuite)?,
            budget: resolve_optional_policy(&bundle, PolicyKind::Budget)?,
            llm_budget: resolve_optional_policy(&bundle, PolicyKind::LlmBudget)?,
            bundle,
        })
    }

    pub fn execution_params(&self) -> Result<ExecutionParams> {
        self.execution.typed_params()
    }

    pub fn cost_params(&self) -> Result<CostParams> {
        self.cost.typed_params()
    }

    pub fn asof_params(&self) -> Result<AsofLatencyParams> {
        self.asof_latency.typed_params()
    }

    pub fn risk_params(&self) -> Result<RiskParams> {
        self.risk.typed_params()
    }

    pub fn gate_suite_params(&self) -> Result<GateSuiteParams> {
        self.gate_suite.typed_params()
    }

    /// sha256 of the bundle file and every referenced policy file, keyed by
    /// policy id. Recorded in each dossier's config snapshot.
    pub fn sha256_map(&self) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        out.insert(
            self.bundle.policy_bundle_id.clone(),
            sha256_file(&self.bundle.path)?,
        );
        let mut refs = vec![
            &self.execution,
            &self.cost,
            &self.asof_latency,
            &self.risk,
            &self.gate_suite,
        ];
        refs.extend(self.budget.iter());
        refs.extend(self.llm_budget.iter());
        for p in refs {
            out.insert(p.policy_id.clone(), sha256_file(&p.path)?);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// validation
// ---------------------------------------------------------------------------

fn require_number(path: &Path, params: &Value, key: &str, min: f64) -> Result<()> {
    match params.get(key).and_then(|v| v.as_f64()) {
        Some(v) if v >= min => Ok(()),
        Some(_) => Err(violation(path, &format!("/params/{}", key), format!("{} must be >= {}", key, min))),
        None => Err(violation(path, &format!("/params/{}", key), format!("{} must be a number", key))),
    }
}

fn optional_number(path: &Path, params: &Value, key: &str, min: f64) -> Result<()> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(()),
        Some(_) => require_number(path, params, key, min),
    }
}

fn require_int(path: &Path, params: &Value, key: &str, min: i64) -> Result<()> {
    match params.get(key).and_then(|v| v.as_i64()) {
        Some(v) if v >= min => Ok(()),
        Some(_) => Err(violation(path, &format!("/params/{}", key), format!("{} must be >= {}", key, min))),
        None => Err(violation(path, &format!("/params/{}", key), format!("{} must be an integer", key))),
    }
}

fn optional_int(path: &Path, params: &Value, key: &str, min: i64) -> Result<()> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(()),
        Some(_) => require_int(path, params, key, min),
    }
}

fn require_enum(path: &Path, params: &Value, key: &str, allowed: &[&str]) -> Result<()> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(v) if allowed.contains(&v) => Ok(()),
        _ => Err(violation(
            path,
            &format!("/params/{}", key),
            format!("{} must be one of {:?}", key, allowed),
        )),
    }
}

/// Common fields plus per-kind parameter typing.
pub fn validate_policy_doc(path: &Path, doc: &Value) -> Result<()> {
    let policy_id = doc
        .get("policy_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if policy_id.trim().is_empty() {
        return Err(violation(path, "/policy_id", "policy_id is required"));
    }
    if doc.get("policy_version").and_then(|v| v.as_str()) != Some(POLICY_VERSION) {
        return Err(violation(path, "/policy_version", "policy_version must be 'v1'"));
    }
    for key in ["title", "description"] {
        let ok = doc
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        if !ok {
            return Err(violation(path, &format!("/{}", key), format!("{} is required", key)));
        }
    }
    let params = match doc.get("params") {
        Some(p) if p.as_object().map(|m| !m.is_empty()).unwrap_or(false) => p,
        _ => return Err(violation(path, "/params", "params must be a non-empty mapping")),
    };
    let kind = PolicyKind::from_policy_id(policy_id).ok_or_else(|| {
        violation(path, "/policy_id", format!("unrecognized policy kind for '{}'", policy_id))
    })?;
    match kind {
        PolicyKind::Execution => {
            require_enum(path, params, "order_timing", &["next_open", "close", "next_close"])?;
            require_enum(path, params, "fill_price", &["open", "close", "vwap"])?;
            if let Some(v) = params.get("allow_short") {
                if !v.is_boolean() {
                    return Err(violation(path, "/params/allow_short", "allow_short must be boolean"));
                }
            }
            optional_number(path, params, "lot_size", 0.0)?;
            if let Some(v) = params.get("rounding") {
                if !v.is_string() {
                    return Err(violation(path, "/params/rounding", "rounding must be a string"));
                }
            }
        }
        PolicyKind::Cost => {
            require_number(path, params, "commission_bps", 0.0)?;
            require_number(path, params, "slippage_bps", 0.0)?;
            optional_number(path, params, "tax_bps", 0.0)?;
            optional_number(path, params, "min_fee", 0.0)?;
        }
        PolicyKind::AsofLatency => {
            if params.get("asof_rule").and_then(|v| v.as_str()) != Some(ASOF_RULE) {
                return Err(violation(
                    path,
                    "/params/asof_rule",
                    format!("asof_rule must be '{}'", ASOF_RULE),
                ));
            }
            require_int(path, params, "default_latency_seconds", 0)?;
            require_int(path, params, "bar_close_to_signal_seconds", 0)?;
            require_int(path, params, "trade_lag_bars_default", 0)?;
        }
        PolicyKind::Risk => {
            require_number(path, params, "max_leverage", 0.0)?;
            require_int(path, params, "max_positions", 1)?;
            require_number(path, params, "max_turnover", 0.0)?;
            optional_number(path, params, "max_drawdown", 0.0)?;
        }
        PolicyKind::GateSuite => {
            let gates = params.get("gates").and_then(|v| v.as_array());
            match gates {
                Some(g) if !g.is_empty() => {
                    for (i, gate) in g.iter().enumerate() {
                        for key in ["gate_id", "gate_version"] {
                            if gate.get(key).and_then(|v| v.as_str()).is_none() {
                                return Err(violation(
                                    path,
                                    &format!("/params/gates/{}/{}", i, key),
                                    format!("{} is required", key),
                                ));
                            }
                        }
                    }
                }
                _ => return Err(violation(path, "/params/gates", "gates must be a non-empty list")),
            }
            let output = params
                .pointer("/holdout_policy/output")
                .and_then(|v| v.as_str());
            if output != Some(HOLDOUT_OUTPUT_RULE) {
                return Err(violation(
                    path,
                    "/params/holdout_policy/output",
                    format!("holdout_policy.output must be '{}'", HOLDOUT_OUTPUT_RULE),
                ));
            }
        }
        PolicyKind::Budget => {
            require_int(path, params, "max_proposals_per_job", 0)?;
            require_int(path, params, "max_spawn_per_job", 0)?;
            require_int(path, params, "max_total_iterations", 0)?;
            optional_int(path, params, "stop_if_no_improvement_n", 0)?;
        }
        PolicyKind::LlmBudget => {
            require_int(path, params, "max_calls_per_job", 0)?;
            require_int(path, params, "max_prompt_chars_per_job", 0)?;
            require_int(path, params, "max_response_chars_per_job", 0)?;
            require_number(path, params, "max_wall_seconds_per_job", 0.0)?;
            optional_int(path, params, "max_calls_per_agent_run", 0)?;
        }
    }
    Ok(())
}

/// Validate every YAML in the directory and reject duplicate ids.
pub fn validate_policies_dir(policies_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut seen: BTreeMap<String, PathBuf> = BTreeMap::new();
    let files = policy_files(policies_dir)?;
    for path in &files {
        let doc = load_yaml(path)?;
        let id = if doc.get("policy_bundle_id").is_some() {
            validate_bundle_doc(path, &doc)?;
            doc.get("policy_bundle_id").and_then(|v| v.as_str()).unwrap_or_default().to_string()
        } else {
            validate_policy_doc(path, &doc)?;
            doc.get("policy_id").and_then(|v| v.as_str()).unwrap_or_default().to_string()
        };
        if let Some(prev) = seen.insert(id.clone(), path.clone()) {
            return Err(EamError::PolicyViolation(format!(
                "duplicate policy_id found: {} ({} and {})",
                id,
                file_label(&prev),
                file_label(path)
            ))
            .into());
        }
    }
    Ok(files)
}

fn lock_items(policies_dir: &Path) -> Result<Vec<Value>> {
    let mut items = Vec::new();
    for path in policy_files(policies_dir)? {
        let doc = load_yaml(&path)?;
        let id = doc
            .get("policy_id")
            .or_else(|| doc.get("policy_bundle_id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| violation(&path, "/policy_id", "policy_id is required"))?
            .to_string();
        items.push(json!({
            "id": id,
            "file": file_label(&path),
            "sha256": sha256_file(&path)?,
        }));
    }
    items.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
    Ok(items)
}

/// Write `policy_lock_v1.yaml` pinning the sha256 of every policy file.
pub fn write_lock(policies_dir: &Path) -> Result<PathBuf> {
    validate_policies_dir(policies_dir)?;
    let lock = json!({
        "lock_version": LOCK_VERSION,
        "generated_at": now_iso(),
        "items": lock_items(policies_dir)?,
    });
    let text = serde_yaml::to_string(&lock)?;
    let path = policies_dir.join(LOCK_FILE);
    atomic_write_text(&path, &text)?;
    tracing::info!(path = %path.display(), "policy lock written");
    Ok(path)
}

pub fn verify_lock(policies_dir: &Path) -> Result<()> {
    let lock_path = policies_dir.join(LOCK_FILE);
    let text = fs::read_to_string(&lock_path)
        .with_context(|| format!("read {}", lock_path.display()))?;
    let lock: Value = serde_yaml::from_str(&text)
        .map_err(|e| violation(&lock_path, "/", format!("invalid yaml: {}", e)))?;
    if lock.get("lock_version").and_then(|v| v.as_str()) != Some(LOCK_VERSION) {
        return Err(violation(&lock_path, "/lock_version", "lock_version must be 'policy_lock_v1'"));
    }
    let items = lock
        .get("items")
        .and_then(|v| v.as_array())
        .ok_or_else(|| violation(&lock_path, "/items", "items must be a list"))?;
    for item in items {
        let file = item
            .get("file")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("lock item without file"))?;
        let expected = item.get("sha256").and_then(|v| v.as_str()).unwrap_or_default();
        let path = policies_dir.join(file);
        let actual = if path.is_file() {
            sha256_file(&path)?
        } else {
            String::new()
        };
        if actual != expected {
            return Err(EamError::PolicyViolation(format!(
                "sha256 mismatch vs lock for {}",
                file
            ))
            .into());
        }
    }
    Ok(())
}

/// JSON pointers of inline policy parameters found anywhere in `value`.
/// `asof_rule` only counts when it carries a string (the blueprint's
/// `asof_rule: {mode: asof}` object is a data requirement, not a policy).
pub fn find_inline_policy_keys(value: &Value) -> Vec<String> {
    let mut found = Vec::new();
    walk_inline(value, "", &mut found);
    found.sort();
    found
}

fn walk_inline(value: &Value, ptr: &str, found: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let child = format!("{}/{}", ptr, escape_pointer(k));
                let is_policy_key = INLINE_POLICY_KEYS.contains(&k.as_str())
                    && (k != "asof_rule" || v.is_string());
                if is_policy_key {
                    found.push(child.clone());
                }
                walk_inline(v, &child, found);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                walk_inline(v, &format!("{}/{}", ptr, i), found);
            }
        }
        _ => {}
    }
}

pub fn escape_pointer(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use eam_core::{ensure_dir, scratch_dir};

    pub(crate) fn repo_policies_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../policies")
    }

    fn copy_policies(prefix: &str) -> PathBuf {
        let root = scratch_dir(prefix);
        ensure_dir(&root).expect("root");
        for entry in fs::read_dir(repo_policies_dir()).expect("policies") {
            let path = entry.expect("entry").path();
            if path.is_file() {
                fs::copy(&path, root.join(path.file_name().expect("name"))).expect("copy");
            }
        }
        root
    }

    #[test]
    fn repository_bundle_resolves_every_kind() {
        let resolved =
            ResolvedPolicies::load(&repo_policies_dir().join("policy_bundle_v1.yaml"))
                .expect("bundle resolves");
        assert_eq!(resolved.bundle.policy_bundle_id, "policy_bundle_v1_default");
        assert_eq!(resolved.asof_params().expect("asof").asof_rule, ASOF_RULE);
        assert!(resolved.asof_params().expect("asof").lag_bars() >= 1);
        assert!(!resolved.gate_suite_params().expect("suite").gates.is_empty());
        assert!(resolved.budget.is_some());
        let shas = resolved.sha256_map().expect("sha map");
        assert_eq!(shas.len(), 8);
    }

    #[test]
    fn repository_policies_dir_is_valid_and_locked() {
        validate_policies_dir(&repo_policies_dir()).expect("dir validates");
        verify_lock(&repo_policies_dir()).expect("lock matches");
    }

    #[test]
    fn bundle_with_inline_params_is_rejected() {
        let root = copy_policies("eam_policy_inline_test");
        let bundle = root.join("policy_bundle_v1.yaml");
        let mut text = fs::read_to_string(&bundle).expect("read");
        text.push_str("params:\n  commission_bps: 1\n");
        fs::write(&bundle, text).expect("write");
        let _ = fs::remove_file(root.join(LOCK_FILE));
        let err = load_policy_bundle(&bundle).expect_err("inline params must fail");
        assert!(err.to_string().contains("/params"), "unexpected: {}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn tampered_policy_fails_lock_check() {
        let root = copy_policies("eam_policy_lock_test");
        let cost = root.join("cost_policy_v1.yaml");
        let text = fs::read_to_string(&cost).expect("read").replace("5.0", "7.0");
        fs::write(&cost, text).expect("write");
        let err = load_policy_bundle(&root.join("policy_bundle_v1.yaml"))
            .expect_err("lock mismatch must fail");
        assert!(
            err.to_string().contains("sha256 mismatch vs lock for cost_policy_v1.yaml"),
            "unexpected: {}",
            err
        );
        write_lock(&root).expect("relock");
        load_policy_bundle(&root.join("policy_bundle_v1.yaml")).expect("relocked bundle loads");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn duplicate_policy_id_is_rejected() {
        let root = copy_policies("eam_policy_dup_test");
        fs::copy(root.join("risk_policy_v1.yaml"), root.join("risk_policy_copy.yaml"))
            .expect("dup");
        let err = validate_policies_dir(&root).expect_err("duplicate must fail");
        assert!(err.to_string().contains("duplicate policy_id found"), "unexpected: {}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn asof_rule_must_match() {
        let path = PathBuf::from("asof_latency_policy_v1.yaml");
        let doc = json!({
            "policy_id": "asof_latency_policy_v1_x",
            "policy_version": "v1",
            "title": "t",
            "description": "d",
            "params": {
                "asof_rule": "available_at<as_of",
                "default_latency_seconds": 0,
                "bar_close_to_signal_seconds": 0,
                "trade_lag_bars_default": 1
            }
        });
        let err = validate_policy_doc(&path, &doc).expect_err("bad rule");
        assert!(err.to_string().contains("/params/asof_rule"));
    }

    #[test]
    fn inline_policy_keys_are_found_with_pointers() {
        let v = json!({
            "strategy_spec": {"execution": {"cost_model": {"commission_bps": 3}}},
            "data_requirements": [{"asof_rule": {"mode": "asof"}}],
            "notes": {"asof_rule": "available_at<=as_of"}
        });
        let found = find_inline_policy_keys(&v);
        assert_eq!(
            found,
            vec![
                "/notes/asof_rule".to_string(),
                "/strategy_spec/execution/cost_model/commission_bps".to_string()
            ]
        );
    }
}
