//! Input sanitization before anything reaches a provider or a cassette.

use anyhow::Result;
use eam_core::{atomic_write_json_pretty, canonical_json_digest, EamRoots};
use serde_json::{json, Map, Value};
use std::path::Path;

pub const REDACTION_SUMMARY_FILE: &str = "redaction_summary.json";

const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "holdout", "vault", "secret", "token", "auth", "password", "apikey", "api_key", "bearer", "cookie",
];

const TRUNCATED: &str = "<TRUNCATED>";
const TRUNCATED_DEPTH: &str = "<TRUNCATED_DEPTH>";

#[derive(Clone, Copy, Debug)]
pub struct RedactionLimits {
    pub max_depth: usize,
    pub max_str_chars: usize,
    pub max_list_items: usize,
    pub max_dict_items: usize,
}

impl Default for RedactionLimits {
    fn default() -> Self {
        RedactionLimits {
            max_depth: 10,
            max_str_chars: 20_000,
            max_list_items: 50,
            max_dict_items: 200,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RedactionSummary {
    pub removed_keys: Vec<String>,
    pub truncated_strings: usize,
    pub truncated_lists: usize,
    pub truncated_dicts: usize,
    pub replaced_paths: usize,
    pub sanitized_sha256: String,
}

impl RedactionSummary {
    pub fn to_json(&self) -> Value {
        json!({
            "removed_keys": self.removed_keys,
            "truncated_strings": self.truncated_strings,
            "truncated_lists": self.truncated_lists,
            "truncated_dicts": self.truncated_dicts,
            "replaced_paths": self.replaced_paths,
            "sanitized_sha256": self.sanitized_sha256,
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        atomic_write_json_pretty(path, &self.to_json())
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEY_FRAGMENTS.iter().any(|f| lower.contains(f))
}

/// Host paths that become placeholders, longest first so nested roots win.
pub fn root_placeholders(roots: &EamRoots) -> Vec<(String, &'static str)> {
    let mut out = vec![
        (roots.job_root.display().to_string(), "<EAM_JOB_ROOT>"),
        (roots.data_root.display().to_string(), "<EAM_DATA_ROOT>"),
        (roots.artifact_root.display().to_string(), "<EAM_ARTIFACT_ROOT>"),
    ];
    out.retain(|(p, _)| !p.is_empty() && p != "/");
    out.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    out
}

struct Walker<'a> {
    limits: RedactionLimits,
    placeholders: &'a [(String, &'static str)],
    summary: RedactionSummary,
}

impl Walker<'_> {
    fn scrub_string(&mut self, s: &str) -> Value {
        let mut out = s.to_string();
        for (root, placeholder) in self.placeholders {
            if out.contains(root.as_str()) {
                out = out.replace(root.as_str(), placeholder);
                self.summary.replaced_paths += 1;
            }
        }
        if out.chars().count() > self.limits.max_str_chars {
            self.summary.truncated_strings += 1;
            out = out.chars().take(self.limits.max_str_chars).collect::<String>() + TRUNCATED;
        }
        Value::String(out)
    }

    fn walk(&mut self, value: &Value, path: &str, depth: usize) -> Value {
        if depth > self.limits.max_depth {
            return Value::String(TRUNCATED_DEPTH.into());
        }
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                if keys.len() > self.limits.max_dict_items {
                    self.summary.truncated_dicts += 1;
                    keys.truncate(self.limits.max_dict_items);
                }
                let mut out = Map::new();
                for k in keys {
                    let child = format!("{}/{}", path, k);
                    if is_sensitive_key(k) {
                        self.summary.removed_keys.push(child);
                        continue;
                    }
                    let v = self.walk(&map[k], &child, depth + 1);
                    out.insert(k.clone(), v);
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                let keep = if items.len() > self.limits.max_list_items {
                    self.summary.truncated_lists += 1;
                    &items[..self.limits.max_list_items]
                } else {
                    &items[..]
                };
                Value::Array(
                    keep.iter()
                        .enumerate()
                        .map(|(i, v)| self.walk(v, &format!("{}/{}", path, i), depth + 1))
                        .collect(),
                )
            }
            Value::String(s) => self.scrub_string(s),
            other => other.clone(),
        }
    }
}

/// Drop sensitive keys, replace host roots, cap size. Object keys come out
/// sorted so the sanitized form hashes stably.
pub fn sanitize_for_llm(value: &Value, placeholders: &[(String, &'static str)], limits: RedactionLimits) -> (Value, RedactionSummary) {
    let mut walker = Walker {
        limits,
        placeholders,
        summary: RedactionSummary::default(),
    };
    let sanitized = walker.walk(value, "", 0);
    let mut summary = walker.summary;
    summary.sanitized_sha256 = canonical_json_digest(&sanitized);
    (sanitized, summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn roots() -> EamRoots {
        EamRoots::new(&PathBuf::from("/srv/eam/data"), &PathBuf::from("/srv/eam/artifacts"), &PathBuf::from("/repo"))
    }

    #[test]
    fn sensitive_keys_are_dropped_and_roots_replaced() {
        let input = json!({
            "title": "demo",
            "holdout_metrics": {"sharpe": 1.2},
            "nested": {"API_Key": "k", "path": "/srv/eam/artifacts/jobs/abc/outputs/x.json"},
            "data": "/srv/eam/data/lake/snap"
        });
        let (out, summary) = sanitize_for_llm(&input, &root_placeholders(&roots()), RedactionLimits::default());
        assert!(out.get("holdout_metrics").is_none());
        assert!(out["nested"].get("API_Key").is_none());
        assert_eq!(out["nested"]["path"], "<EAM_JOB_ROOT>/abc/outputs/x.json");
        assert_eq!(out["data"], "<EAM_DATA_ROOT>/lake/snap");
        assert_eq!(summary.removed_keys, vec!["/holdout_metrics".to_string(), "/nested/API_Key".to_string()]);
        assert_eq!(summary.replaced_paths, 2);
        assert_eq!(summary.sanitized_sha256, canonical_json_digest(&out));
    }

    #[test]
    fn caps_truncate_depth_lists_and_strings() {
        let limits = RedactionLimits {
            max_depth: 2,
            max_str_chars: 4,
            max_list_items: 2,
            max_dict_items: 200,
        };
        let input = json!({"a": {"b": {"c": 1}}, "l": [1, 2, 3], "s": "abcdefgh"});
        let (out, summary) = sanitize_for_llm(&input, &[], limits);
        assert_eq!(out["a"]["b"]["c"], TRUNCATED_DEPTH);
        assert_eq!(out["l"], json!([1, 2]));
        assert_eq!(out["s"], "abcd<TRUNCATED>");
        assert_eq!(summary.truncated_lists, 1);
        assert_eq!(summary.truncated_strings, 1);
    }
}
