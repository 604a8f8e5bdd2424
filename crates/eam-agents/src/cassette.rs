//! Content-addressed LLM call log. Each line is an `llm_call_v1` record keyed
//! by `prompt_hash`; the first match wins on replay.

use anyhow::Result;
use eam_core::{append_jsonl, canonical_json_digest, read_jsonl};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

pub const CASSETTE_FILE: &str = "cassette.jsonl";
pub const LLM_CALLS_FILE: &str = "llm_calls.jsonl";

/// `sha256(canonical({"v": 1, "request": request}))`.
pub fn prompt_hash_v1(request: &Value) -> String {
    canonical_json_digest(&json!({"v": 1, "request": request}))
}

#[derive(Clone, Debug)]
pub struct CassetteStore {
    pub path: PathBuf,
}

impl CassetteStore {
    pub fn new(path: &Path) -> Self {
        CassetteStore {
            path: path.to_path_buf(),
        }
    }

    /// `dir/cassette.jsonl`.
    pub fn in_dir(dir: &Path) -> Self {
        CassetteStore::new(&dir.join(CASSETTE_FILE))
    }

    pub fn append_call(&self, call: &Value) -> Result<()> {
        append_jsonl(&self.path, call)
    }

    pub fn replay_response(&self, prompt_hash: &str) -> Result<Option<Value>> {
        for doc in read_jsonl(&self.path)? {
            if doc.get("prompt_hash").and_then(|v| v.as_str()) == Some(prompt_hash) {
                return Ok(doc.get("response_json").filter(|r| r.is_object()).cloned());
            }
        }
        Ok(None)
    }

    pub fn tail_calls(&self, limit: usize) -> Result<Vec<Value>> {
        let docs = read_jsonl(&self.path)?;
        let skip = docs.len().saturating_sub(limit);
        Ok(docs.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eam_core::scratch_dir;
    use std::fs;

    #[test]
    fn first_matching_hash_is_replayed() {
        let root = scratch_dir("eam_cassette_test");
        let store = CassetteStore::in_dir(&root);
        let h = prompt_hash_v1(&json!({"agent_id": "a"}));
        assert_eq!(h.len(), 64);
        assert_ne!(h, prompt_hash_v1(&json!({"agent_id": "b"})));
        store.append_call(&json!({"prompt_hash": h, "response_json": {"n": 1}})).expect("append");
        store.append_call(&json!({"prompt_hash": h, "response_json": {"n": 2}})).expect("append");
        assert_eq!(store.replay_response(&h).expect("replay"), Some(json!({"n": 1})));
        assert_eq!(store.replay_response("missing").expect("replay"), None);
        assert_eq!(store.tail_calls(1).expect("tail")[0]["response_json"]["n"], 2);
        let _ = fs::remove_dir_all(root);
    }
}
