//! Versioned prompt packs: `<root>/<agent_id>/prompt_<version>.md`, a block of
//! `key: value` header lines, a `---` separator, then the system prompt.

use anyhow::{Context, Result};
use eam_core::{read_json_object, sha256_bytes, EamError};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PROMPT_VERSION: &str = "v1";
pub const PROMPT_PINS_FILE: &str = "prompt_pins.json";
pub const OVERRIDES_DIR: &str = "prompt_overrides";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromptSource {
    Override,
    EnvRoot,
    Repo,
}

impl PromptSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptSource::Override => "prompt_overrides",
            PromptSource::EnvRoot => "env_root",
            PromptSource::Repo => "repo",
        }
    }
}

#[derive(Clone, Debug)]
pub struct PromptPack {
    pub path: PathBuf,
    pub prompt_version: String,
    pub output_schema_version: String,
    pub system: String,
    pub sha256: String,
    pub source: PromptSource,
}

pub fn normalize_version(raw: &str) -> String {
    let v = raw.trim();
    if v.is_empty() {
        DEFAULT_PROMPT_VERSION.to_string()
    } else if v.starts_with('v') {
        v.to_string()
    } else {
        format!("v{}", v)
    }
}

/// Split header lines from the body. Without a `---` line the header ends at
/// the first line that has no `:`.
pub fn parse_header(text: &str) -> (BTreeMap<String, String>, String) {
    let lines: Vec<&str> = text.lines().collect();
    let mut meta = BTreeMap::new();
    let mut body_start = 0;
    for (i, line) in lines.iter().enumerate() {
        if line.trim() == "---" {
            body_start = i + 1;
            break;
        }
        match line.split_once(':') {
            Some((k, v)) => {
                let k = k.trim();
                if !k.is_empty() {
                    meta.insert(k.to_string(), v.trim().to_string());
                }
            }
            None => {
                body_start = i;
                break;
            }
        }
    }
    let body = format!("{}\n", lines[body_start.min(lines.len())..].join("\n").trim());
    (meta, body)
}

pub fn load_promptpack(root: &Path, agent_id: &str, version: &str, source: PromptSource) -> Result<PromptPack> {
    let version = normalize_version(version);
    let path = root.join(agent_id).join(format!("prompt_{}.md", version));
    if !path.is_file() {
        return Err(EamError::NotFound(format!("promptpack {}", path.display())).into());
    }
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let (meta, system) = parse_header(&text);
    let prompt_version = meta
        .get("prompt_version")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| version.clone());
    let output_schema_version = meta
        .get("output_schema_version")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            EamError::InvalidContract(format!("promptpack missing output_schema_version: {}", path.display()))
        })?;
    Ok(PromptPack {
        sha256: sha256_bytes(&bytes),
        path,
        prompt_version,
        output_schema_version,
        system,
        source,
    })
}

/// Where prompt packs are looked up, in precedence order.
#[derive(Clone, Debug)]
pub struct PromptLocator {
    pub repo_root: PathBuf,
    pub env_root: Option<PathBuf>,
}

impl PromptLocator {
    pub fn new(repo_root: &Path, env_root: Option<PathBuf>) -> Self {
        PromptLocator {
            repo_root: repo_root.to_path_buf(),
            env_root,
        }
    }

    pub fn overrides_root(&self) -> PathBuf {
        self.repo_root.join(OVERRIDES_DIR).join("agents")
    }

    pub fn default_root(&self) -> PathBuf {
        match &self.env_root {
            Some(root) => root.clone(),
            None => self.repo_root.join("prompts").join("agents"),
        }
    }

    pub fn resolve(&self, agent_id: &str, version: &str) -> Result<PromptPack> {
        let file = format!("prompt_{}.md", normalize_version(version));
        let overrides = self.overrides_root();
        if overrides.join(agent_id).join(&file).is_file() {
            return load_promptpack(&overrides, agent_id, version, PromptSource::Override);
        }
        let source = if self.env_root.is_some() {
            PromptSource::EnvRoot
        } else {
            PromptSource::Repo
        };
        load_promptpack(&self.default_root(), agent_id, version, source)
    }
}

/// Per-job pin from `<job>/outputs/prompt_pins.json` (`{"pins": {agent: version}}`).
pub fn pinned_version(job_dir: &Path, agent_id: &str) -> Option<String> {
    read_json_object(&job_dir.join("outputs").join(PROMPT_PINS_FILE))?
        .pointer(&format!("/pins/{}", agent_id))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(normalize_version)
}

/// Pin > environment > default.
pub fn select_version(job_dir: Option<&Path>, agent_id: &str, env_version: Option<&str>) -> String {
    if let Some(pin) = job_dir.and_then(|d| pinned_version(d, agent_id)) {
        return pin;
    }
    match env_version.map(str::trim).filter(|s| !s.is_empty()) {
        Some(v) => normalize_version(v),
        None => DEFAULT_PROMPT_VERSION.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eam_core::{ensure_dir, scratch_dir};

    #[test]
    fn header_and_body_are_split() {
        let (meta, body) = parse_header("prompt_version: v1\noutput_schema_version: blueprint_v1\n---\n\nDraft a blueprint.\n");
        assert_eq!(meta.get("output_schema_version").map(String::as_str), Some("blueprint_v1"));
        assert_eq!(body, "Draft a blueprint.\n");
    }

    #[test]
    fn overrides_take_precedence_and_pins_win() {
        let root = scratch_dir("eam_promptpack_test");
        let repo_dir = root.join("prompts/agents/intent_agent_v1");
        let over_dir = root.join("prompt_overrides/agents/intent_agent_v1");
        ensure_dir(&repo_dir).expect("repo");
        ensure_dir(&over_dir).expect("over");
        fs::write(repo_dir.join("prompt_v1.md"), "output_schema_version: blueprint_v1\n---\nrepo\n").expect("write");
        fs::write(repo_dir.join("prompt_v2.md"), "output_schema_version: blueprint_v1\n---\nv2\n").expect("write");
        fs::write(over_dir.join("prompt_v1.md"), "output_schema_version: blueprint_v1\n---\nover\n").expect("write");

        let locator = PromptLocator::new(&root, None);
        let pack = locator.resolve("intent_agent_v1", "1").expect("pack");
        assert_eq!(pack.source, PromptSource::Override);
        assert_eq!(pack.system, "over\n");

        let job = root.join("job");
        ensure_dir(&job.join("outputs")).expect("outputs");
        fs::write(job.join("outputs").join(PROMPT_PINS_FILE), r#"{"pins":{"intent_agent_v1":"v2"}}"#).expect("pins");
        assert_eq!(select_version(Some(&job), "intent_agent_v1", Some("v1")), "v2");
        assert_eq!(select_version(None, "intent_agent_v1", Some("3")), "v3");
        let pinned = locator.resolve("intent_agent_v1", "v2").expect("v2");
        assert_eq!(pinned.source, PromptSource::Repo);
        assert_eq!(pinned.prompt_version, "v2");

        fs::write(repo_dir.join("prompt_v3.md"), "prompt_version: v3\n---\nno schema\n").expect("write");
        let err = locator.resolve("intent_agent_v1", "v3").expect_err("missing schema");
        assert!(err.to_string().contains("output_schema_version"), "unexpected: {}", err);
        let _ = fs::remove_dir_all(root);
    }
}
