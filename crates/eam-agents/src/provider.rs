//! Provider selection and the HTTP JSON-completion client.

use anyhow::{anyhow, Result};
use eam_core::{env_truthy, EamError};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

pub const PROVIDER_MOCK: &str = "mock";
pub const PROVIDER_REAL: &str = "real";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LlmMode {
    Live,
    Record,
    Replay,
}

impl LlmMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "live" => Ok(LlmMode::Live),
            "record" => Ok(LlmMode::Record),
            "replay" => Ok(LlmMode::Replay),
            other => Err(EamError::Usage(format!("invalid EAM_LLM_MODE: {} (expected live|record|replay)", other)).into()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LlmMode::Live => "live",
            LlmMode::Record => "record",
            LlmMode::Replay => "replay",
        }
    }
}

pub fn check_provider_id(raw: &str) -> Result<String> {
    match raw.trim() {
        "" | PROVIDER_MOCK => Ok(PROVIDER_MOCK.to_string()),
        PROVIDER_REAL => Ok(PROVIDER_REAL.to_string()),
        other => Err(EamError::Usage(format!("provider '{}' is not supported (expected mock|real)", other)).into()),
    }
}

#[derive(Clone, Debug)]
pub struct RealProviderConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_seconds: f64,
    pub retries: u32,
}

impl Default for RealProviderConfig {
    fn default() -> Self {
        RealProviderConfig {
            base_url: None,
            api_key: None,
            model: "default".into(),
            timeout_seconds: 30.0,
            retries: 2,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// LLM-related environment, read once at the process boundary.
#[derive(Clone, Debug)]
pub struct LlmEnv {
    pub provider_id: String,
    pub mode: LlmMode,
    pub cassette_dir: Option<PathBuf>,
    pub disable_network: bool,
    pub prompt_version: Option<String>,
    pub promptpack_root: Option<PathBuf>,
    pub real: RealProviderConfig,
}

impl LlmEnv {
    pub fn mock(mode: LlmMode) -> Self {
        LlmEnv {
            provider_id: PROVIDER_MOCK.into(),
            mode,
            cassette_dir: None,
            disable_network: true,
            prompt_version: None,
            promptpack_root: None,
            real: RealProviderConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let real = RealProviderConfig {
            base_url: env_string("EAM_LLM_REAL_BASE_URL"),
            api_key: env_string("EAM_LLM_REAL_API_KEY"),
            model: env_string("EAM_LLM_REAL_MODEL").unwrap_or_else(|| "default".into()),
            timeout_seconds: env_string("EAM_LLM_REAL_TIMEOUT_SECONDS")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(30.0)
                .max(1.0),
            retries: env_string("EAM_LLM_REAL_RETRIES")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(2)
                .min(5),
        };
        Ok(LlmEnv {
            provider_id: check_provider_id(&env_string("EAM_LLM_PROVIDER").unwrap_or_default())?,
            mode: LlmMode::parse(&env_string("EAM_LLM_MODE").unwrap_or_default())?,
            cassette_dir: env_string("EAM_LLM_CASSETTE_DIR").map(PathBuf::from),
            disable_network: env_truthy("EAM_LLM_DISABLE_NETWORK"),
            prompt_version: env_string("EAM_AGENT_PROMPT_VERSION"),
            promptpack_root: env_string("EAM_AGENT_PROMPTPACK_ROOT").map(PathBuf::from),
            real,
        })
    }

    pub fn uses_real_provider(&self) -> bool {
        self.provider_id == PROVIDER_REAL && self.mode != LlmMode::Replay
    }
}

/// `POST {base}/complete_json` with `{model, system, user, schema, temperature, seed}`;
/// the completion is the response's `json` object.
pub struct RealHttpProvider {
    config: RealProviderConfig,
    disable_network: bool,
}

impl RealHttpProvider {
    pub fn new(env: &LlmEnv) -> Self {
        RealHttpProvider {
            config: env.real.clone(),
            disable_network: env.disable_network,
        }
    }

    fn call_once(&self, client: &reqwest::blocking::Client, url: &str, body: &Value) -> Result<Value> {
        let mut request = client.post(url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send()?;
        let status = response.status();
        let text = response.text()?;
        if status.as_u16() >= 400 {
            let snippet: String = text.chars().take(500).collect();
            return Err(anyhow!("real provider HTTP {}: {}", status.as_u16(), snippet));
        }
        let doc: Value = serde_json::from_str(&text)?;
        doc.get("json")
            .filter(|v| v.is_object())
            .cloned()
            .ok_or_else(|| anyhow!("real provider response must contain object field 'json'"))
    }

    pub fn complete_json(&self, system: &str, user: &str, schema: &Value, temperature: f64, seed: Option<u64>) -> Result<Value> {
        if cfg!(test) || self.disable_network {
            return Err(anyhow!("real provider network disabled by EAM_LLM_DISABLE_NETWORK"));
        }
        let base = self
            .config
            .base_url
            .as_deref()
            .ok_or_else(|| anyhow!("EAM_LLM_REAL_BASE_URL is required for real provider"))?;
        let url = format!("{}/complete_json", base.trim_end_matches('/'));
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs_f64(self.config.timeout_seconds))
            .build()?;
        let body = json!({
            "model": self.config.model,
            "system": system,
            "user": user,
            "schema": schema,
            "temperature": temperature,
            "seed": seed,
        });
        let mut attempt = 0u32;
        loop {
            match self.call_once(&client, &url, &body) {
                Ok(v) => return Ok(v),
                Err(err) if attempt < self.config.retries => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %err, "real provider call failed; retrying");
                    thread::sleep(Duration::from_millis(200 * u64::from(attempt)));
                }
                Err(err) => return Err(anyhow!("real provider failed after retries: {}", err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_and_providers_parse() {
        assert_eq!(LlmMode::parse("").expect("default"), LlmMode::Live);
        assert_eq!(LlmMode::parse("REPLAY").expect("replay"), LlmMode::Replay);
        assert!(LlmMode::parse("stream").is_err());
        assert_eq!(check_provider_id("real").expect("real"), "real");
        let err = check_provider_id("external").expect_err("external refused");
        assert!(err.to_string().contains("not supported"), "unexpected: {}", err);
    }

    #[test]
    fn real_provider_refuses_network_in_tests() {
        let mut env = LlmEnv::mock(LlmMode::Live);
        env.provider_id = PROVIDER_REAL.into();
        env.real.base_url = Some("http://127.0.0.1:9".into());
        assert!(env.uses_real_provider());
        let err = RealHttpProvider::new(&env)
            .complete_json("s", "u", &json!({}), 0.0, None)
            .expect_err("network disabled");
        assert!(err.to_string().contains("disabled"), "unexpected: {}", err);
    }
}
