//! Sealed evidence bundles under `dossiers/<run_id>/`.
//!
//! Files are staged in a sibling `.tmp_<run_id>/`, hashed, and the manifest is
//! written last before the directory is renamed into place. Sealed files are
//! never rewritten; the manifest may only grow (see [`extend_manifest`]).

use anyhow::{anyhow, Context, Result};
use eam_core::{
    atomic_write_json_pretty, ensure_dir, is_safe_id, now_iso, pretty_json_bytes, read_json,
    sha256_file, EamError,
};
use eam_schemas::ensure_valid;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "dossier_manifest.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExistsBehavior {
    Noop,
    Reject,
}

impl ExistsBehavior {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "noop" => Ok(ExistsBehavior::Noop),
            "reject" | "fail" => Ok(ExistsBehavior::Reject),
            other => Err(EamError::Usage(format!("if-exists must be noop|reject, got '{}'", other)).into()),
        }
    }
}

/// Everything a dossier holds, keyed by path relative to the dossier root.
#[derive(Clone, Debug, Default)]
pub struct DossierInput {
    pub run_id: String,
    pub policy_bundle_id: String,
    pub data_snapshot_id: String,
    pub blueprint_hash: Option<String>,
    pub json_files: BTreeMap<String, Value>,
    pub text_files: BTreeMap<String, String>,
    pub extensions: Map<String, Value>,
}

impl DossierInput {
    pub fn add_json(&mut self, rel: &str, value: Value) -> &mut Self {
        self.json_files.insert(rel.to_string(), value);
        self
    }

    pub fn add_text(&mut self, rel: &str, text: String) -> &mut Self {
        self.text_files.insert(rel.to_string(), text);
        self
    }
}

#[derive(Clone, Debug)]
pub struct DossierWriteResult {
    pub run_id: String,
    pub dossier_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub status: String,
}

/// Logical artifact name: relative path without its extension.
pub fn artifact_name(rel: &str) -> String {
    match rel.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() && !stem.ends_with('/') => stem.to_string(),
        _ => rel.to_string(),
    }
}

fn check_rel(rel: &str) -> Result<()> {
    let bad = rel.is_empty()
        || rel.starts_with('/')
        || rel.split('/').any(|p| p.is_empty() || p == "." || p == "..")
        || rel == MANIFEST_FILE;
    if bad {
        return Err(EamError::Usage(format!("invalid dossier artifact path: {}", rel)).into());
    }
    Ok(())
}

struct StagingGuard {
    path: PathBuf,
    armed: bool,
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

pub fn dossier_dir(dossiers_dir: &Path, run_id: &str) -> Result<PathBuf> {
    if !is_safe_id(run_id) {
        return Err(EamError::Usage(format!("unsafe run_id: {}", run_id)).into());
    }
    Ok(dossiers_dir.join(run_id))
}

fn existing(dir: PathBuf, run_id: &str, behavior: ExistsBehavior) -> Result<DossierWriteResult> {
    match behavior {
        ExistsBehavior::Noop => Ok(DossierWriteResult {
            run_id: run_id.to_string(),
            manifest_path: dir.join(MANIFEST_FILE),
            dossier_dir: dir,
            status: "noop".to_string(),
        }),
        ExistsBehavior::Reject => Err(EamError::WriteConflict(format!(
            "dossier already exists: {}",
            dir.display()
        ))
        .into()),
    }
}

pub fn write_dossier(
    dossiers_dir: &Path,
    input: &DossierInput,
    behavior: ExistsBehavior,
) -> Result<DossierWriteResult> {
    let final_dir = dossier_dir(dossiers_dir, &input.run_id)?;
    if final_dir.exists() {
        return existing(final_dir, &input.run_id, behavior);
    }
    ensure_dir(dossiers_dir)?;
    let staging = dossiers_dir.join(format!(".tmp_{}", input.run_id));
    if staging.exists() {
        fs::remove_dir_all(&staging)
            .with_context(|| format!("remove stale staging dir {}", staging.display()))?;
    }
    ensure_dir(&staging)?;
    let mut guard = StagingGuard {
        path: staging.clone(),
        armed: true,
    };

    let mut artifacts = BTreeMap::new();
    let mut hashes = BTreeMap::new();
    let mut write = |rel: &str, bytes: &[u8]| -> Result<()> {
        check_rel(rel)?;
        let path = staging.join(rel);
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
        artifacts.insert(artifact_name(rel), rel.to_string());
        hashes.insert(rel.to_string(), sha256_file(&path)?);
        Ok(())
    };
    for (rel, value) in &input.json_files {
        write(rel, &pretty_json_bytes(value)?)?;
    }
    for (rel, text) in &input.text_files {
        write(rel, text.as_bytes())?;
    }

    let mut manifest = json!({
        "schema_version": "dossier_v1",
        "run_id": input.run_id,
        "created_at": now_iso(),
        "policy_bundle_id": input.policy_bundle_id,
        "data_snapshot_id": input.data_snapshot_id,
        "append_only": true,
        "artifacts": artifacts,
        "hashes": hashes,
    });
    if let Some(h) = &input.blueprint_hash {
        manifest["blueprint_hash"] = json!(h);
    }
    if !input.extensions.is_empty() {
        manifest["extensions"] = Value::Object(input.extensions.clone());
    }
    ensure_valid(&manifest)?;
    atomic_write_json_pretty(&staging.join(MANIFEST_FILE), &manifest)?;

    if let Err(e) = fs::rename(&staging, &final_dir) {
        if final_dir.exists() {
            // lost a race with another writer; ours is discarded by the guard
            return existing(final_dir, &input.run_id, behavior);
        }
        return Err(anyhow!("rename {} -> {}: {}", staging.display(), final_dir.display(), e));
    }
    guard.armed = false;
    tracing::info!(run_id = %input.run_id, files = input.json_files.len() + input.text_files.len(), "dossier sealed");
    Ok(DossierWriteResult {
        run_id: input.run_id.clone(),
        manifest_path: final_dir.join(MANIFEST_FILE),
        dossier_dir: final_dir,
        status: "created".to_string(),
    })
}

pub fn load_manifest(dossier_dir: &Path) -> Result<Value> {
    let path = dossier_dir.join(MANIFEST_FILE);
    if !path.is_file() {
        return Err(EamError::NotFound(format!("dossier manifest not found: {}", path.display())).into());
    }
    read_json(&path)
}

/// Register files already present under `dossier_dir`. Existing entries must
/// match exactly; nothing recorded before is ever changed.
pub fn extend_manifest(dossier_dir: &Path, rel_paths: &[String]) -> Result<Vec<String>> {
    let mut manifest = load_manifest(dossier_dir)?;
    let mut added = Vec::new();
    for rel in rel_paths {
        check_rel(rel)?;
        let path = dossier_dir.join(rel);
        if !path.is_file() {
            return Err(EamError::NotFound(format!("artifact missing: {}", rel)).into());
        }
        let sha = sha256_file(&path)?;
        let name = artifact_name(rel);
        match manifest.pointer(&format!("/hashes/{}", crate::policies::escape_pointer(rel))) {
            Some(prev) if prev.as_str() == Some(sha.as_str()) => continue,
            Some(_) => {
                return Err(EamError::WriteConflict(format!(
                    "append-only dossier: {} already sealed with a different hash",
                    rel
                ))
                .into())
            }
            None => {}
        }
        if let Some(prev) = manifest.pointer(&format!("/artifacts/{}", crate::policies::escape_pointer(&name))) {
            if prev.as_str() != Some(rel.as_str()) {
                return Err(EamError::WriteConflict(format!("artifact name {} already taken", name)).into());
            }
        }
        manifest["artifacts"][&name] = json!(rel);
        manifest["hashes"][rel.as_str()] = json!(sha);
        added.push(rel.clone());
    }
    if !added.is_empty() {
        ensure_valid(&manifest)?;
        atomic_write_json_pretty(&dossier_dir.join(MANIFEST_FILE), &manifest)?;
    }
    Ok(added)
}

#[derive(Clone, Debug, Default)]
pub struct VerifyReport {
    pub checked: usize,
    pub missing: Vec<String>,
    pub mismatched: Vec<String>,
}

impl VerifyReport {
    pub fn ok(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "ok": self.ok(),
            "checked": self.checked,
            "missing": self.missing,
            "mismatched": self.mismatched,
        })
    }
}

/// Recompute every hash recorded in the manifest.
pub fn verify_dossier(dossier_dir: &Path) -> Result<VerifyReport> {
    let manifest = load_manifest(dossier_dir)?;
    ensure_valid(&manifest)?;
    let mut report = VerifyReport::default();
    if let Some(hashes) = manifest.get("hashes").and_then(|v| v.as_object()) {
        for (rel, expected) in hashes {
            report.checked += 1;
            let path = dossier_dir.join(rel);
            if !path.is_file() {
                report.missing.push(rel.clone());
            } else if Some(sha256_file(&path)?.as_str()) != expected.as_str() {
                report.mismatched.push(rel.clone());
            }
        }
    }
    Ok(report)
}

/// Zip a sealed dossier with fixed timestamps so equal dossiers give equal bytes.
pub fn export_dossier_zip(dossier_dir: &Path, out: &Path) -> Result<usize> {
    load_manifest(dossier_dir)?;
    if let Some(parent) = out.parent() {
        ensure_dir(parent)?;
    }
    let prefix = dossier_dir
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("dossier")
        .to_string();
    let file = fs::File::create(out).with_context(|| format!("create {}", out.display()))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());
    let mut count = 0usize;
    for entry in walkdir::WalkDir::new(dossier_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dossier_dir)
            .map_err(|e| anyhow!("strip prefix: {}", e))?;
        let name = format!("{}/{}", prefix, rel.to_string_lossy().replace('\\', "/"));
        zip.start_file(name, options)?;
        zip.write_all(&fs::read(entry.path())?)?;
        count += 1;
    }
    zip.finish()?;
    tracing::info!(out = %out.display(), files = count, "dossier exported");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eam_core::scratch_dir;

    fn sample(run_id: &str) -> DossierInput {
        let mut input = DossierInput {
            run_id: run_id.to_string(),
            policy_bundle_id: "policy_bundle_v1_default".into(),
            data_snapshot_id: "snap".into(),
            ..Default::default()
        };
        input
            .add_json("metrics.json", json!({"total_return": 0.1}))
            .add_text("curve.csv", "dt,equity\n2024-01-01,1.0\n".into())
            .add_text("reports/report.md", "# Report\n".into());
        input
    }

    #[test]
    fn write_seals_and_second_write_is_noop() {
        let root = scratch_dir("eam_dossier_test");
        let first = write_dossier(&root, &sample("run_a"), ExistsBehavior::Noop).expect("write");
        assert_eq!(first.status, "created");
        let manifest = load_manifest(&first.dossier_dir).expect("manifest");
        assert_eq!(manifest["artifacts"]["reports/report"], "reports/report.md");
        assert!(!root.join(".tmp_run_a").exists());
        let before = fs::read(&first.manifest_path).expect("bytes");

        let second = write_dossier(&root, &sample("run_a"), ExistsBehavior::Noop).expect("noop");
        assert_eq!(second.status, "noop");
        assert_eq!(fs::read(&first.manifest_path).expect("bytes"), before);
        let err = write_dossier(&root, &sample("run_a"), ExistsBehavior::Reject).expect_err("reject");
        assert!(err.to_string().contains("already exists"));
        assert!(verify_dossier(&first.dossier_dir).expect("verify").ok());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_write_leaves_no_staging_dir() {
        let root = scratch_dir("eam_dossier_fail_test");
        let mut input = sample("run_b");
        input.add_text("../escape.txt", "x".into());
        write_dossier(&root, &input, ExistsBehavior::Noop).expect_err("bad path");
        assert!(!root.join(".tmp_run_b").exists());
        assert!(!root.join("run_b").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn extend_manifest_is_append_only_and_verify_catches_tamper() {
        let root = scratch_dir("eam_dossier_extend_test");
        let res = write_dossier(&root, &sample("run_c"), ExistsBehavior::Noop).expect("write");
        ensure_dir(&res.dossier_dir.join("fetch")).expect("dir");
        fs::write(res.dossier_dir.join("fetch/step.json"), "{}\n").expect("fetch");
        let added = extend_manifest(&res.dossier_dir, &["fetch/step.json".to_string()]).expect("extend");
        assert_eq!(added, vec!["fetch/step.json".to_string()]);
        let again = extend_manifest(&res.dossier_dir, &["fetch/step.json".to_string()]).expect("again");
        assert!(again.is_empty());

        fs::write(res.dossier_dir.join("curve.csv"), "tampered\n").expect("tamper");
        let err = extend_manifest(&res.dossier_dir, &["curve.csv".to_string()]).expect_err("sealed");
        assert!(err.to_string().contains("append-only"));
        let report = verify_dossier(&res.dossier_dir).expect("verify");
        assert_eq!(report.mismatched, vec!["curve.csv".to_string()]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn export_writes_every_file() {
        let root = scratch_dir("eam_dossier_zip_test");
        let res = write_dossier(&root, &sample("run_d"), ExistsBehavior::Noop).expect("write");
        let out = root.join("export/run_d.zip");
        let count = export_dossier_zip(&res.dossier_dir, &out).expect("zip");
        assert_eq!(count, 4);
        assert!(out.is_file());
        let _ = fs::remove_dir_all(root);
    }
}
