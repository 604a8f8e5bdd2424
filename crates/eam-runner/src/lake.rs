//! Snapshot storage for daily OHLCV bars.
//!
//! A snapshot is an immutable directory `lake/<snapshot_id>/` holding the bar
//! file, a `data_snapshot_manifest_v1` and a `quality_report_v1`. Rows are
//! deduplicated on `(symbol, dt)` and written sorted, so the same input always
//! produces the same bytes and the same manifest hash.

use anyhow::{anyhow, Context, Result};
use chrono::{
    DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, SecondsFormat, Utc,
};
use eam_core::{
    atomic_write_json_pretty, atomic_write_text, ensure_dir, is_safe_id, now_iso, read_json,
    sha256_file, EamError,
};
use eam_schemas::ensure_valid;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::policies::AsofLatencyParams;

pub const OHLCV_DATASET_ID: &str = "ohlcv_1d";
pub const OHLCV_FILE: &str = "ohlcv_1d.csv";
pub const OHLCV_FIELDS: [&str; 9] = [
    "symbol",
    "dt",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "available_at",
    "source",
];
const DAILY_CLOSE_HOUR: u32 = 16;

pub fn market_offset() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).unwrap_or_else(|| Utc.fix())
}

/// Close of the daily bar for `dt` in market time.
pub fn daily_close(dt: NaiveDate) -> DateTime<FixedOffset> {
    let naive = dt.and_time(NaiveTime::from_hms_opt(DAILY_CLOSE_HOUR, 0, 0).unwrap_or_default());
    localize(naive)
}

/// End-of-day as-of anchor (`23:59:59` market time).
pub fn end_of_day(dt: NaiveDate) -> DateTime<FixedOffset> {
    let naive = dt.and_time(NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default());
    localize(naive)
}

fn localize(naive: NaiveDateTime) -> DateTime<FixedOffset> {
    let offset = market_offset();
    DateTime::from_naive_utc_and_offset(naive - Duration::seconds(offset.local_minus_utc() as i64), offset)
}

/// Parse RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS` (market time) or a bare date
/// (start of day, market time).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<FixedOffset>> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s.replace('Z', "+00:00")) {
        return Ok(dt);
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(localize(naive));
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(localize(d.and_time(NaiveTime::default())));
    }
    Err(anyhow!("invalid timestamp: '{}'", raw))
}

pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    let s = raw.trim();
    NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d")
        .map_err(|_| anyhow!("invalid date: '{}'", raw))
}

pub fn format_ts(ts: &DateTime<FixedOffset>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, false)
}

#[derive(Clone, Debug, PartialEq)]
pub struct Bar {
    pub symbol: String,
    pub dt: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub available_at: DateTime<FixedOffset>,
    pub source: String,
}

impl Bar {
    pub fn field(&self, name: &str) -> Option<f64> {
        match name {
            "open" => Some(self.open),
            "high" => Some(self.high),
            "low" => Some(self.low),
            "close" => Some(self.close),
            "volume" => Some(self.volume),
            _ => None,
        }
    }

    fn csv_line(&self) -> String {
        format!(
            "{},{},{:.6},{:.6},{:.6},{:.6},{:.6},{},{}",
            self.symbol,
            self.dt,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            format_ts(&self.available_at),
            self.source
        )
    }
}

/// Row as delivered by an ingest source; `available_at` may be missing.
#[derive(Clone, Debug)]
pub struct RawBar {
    pub symbol: String,
    pub dt: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub available_at: Option<DateTime<FixedOffset>>,
}

impl RawBar {
    fn into_bar(self, latency: &AsofLatencyParams, source: &str) -> Bar {
        let available_at = self.available_at.unwrap_or_else(|| {
            daily_close(self.dt)
                + Duration::seconds(latency.default_latency_seconds + latency.bar_close_to_signal_seconds)
        });
        Bar {
            symbol: self.symbol,
            dt: self.dt,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            available_at,
            source: source.to_string(),
        }
    }
}

pub fn bars_to_csv(bars: &[Bar]) -> String {
    let mut out = OHLCV_FIELDS.join(",");
    out.push('\n');
    for bar in bars {
        out.push_str(&bar.csv_line());
        out.push('\n');
    }
    out
}

pub fn read_bars_csv(path: &Path) -> Result<Vec<Bar>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut lines = text.lines();
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| anyhow!("empty bar file: {}", path.display()))?
        .split(',')
        .collect();
    let col = |name: &str| -> Result<usize> {
        header
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| anyhow!("{}: missing column {}", path.display(), name))
    };
    let idx: Vec<usize> = OHLCV_FIELDS
        .iter()
        .map(|f| col(f))
        .collect::<Result<_>>()?;
    let mut bars = Vec::new();
    for (n, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let cells: Vec<&str> = line.split(',').collect();
        let cell = |i: usize| -> Result<String> {
            cells
                .get(idx[i])
                .map(|s| s.trim().to_string())
                .ok_or_else(|| anyhow!("{}: short row {}", path.display(), n + 2))
        };
        let num = |i: usize| -> Result<f64> {
            cell(i)?
                .parse::<f64>()
                .map_err(|_| anyhow!("{}: bad number in row {}", path.display(), n + 2))
        };
        bars.push(Bar {
            symbol: cell(0)?,
            dt: parse_date(&cell(1)?)?,
            open: num(2)?,
            high: num(3)?,
            low: num(4)?,
            close: num(5)?,
            volume: num(6)?,
            available_at: parse_timestamp(&cell(7)?)?,
            source: cell(8)?,
        });
    }
    Ok(bars)
}

pub struct SnapshotWriteResult {
    pub snapshot_id: String,
    pub snapshot_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub rows_written: usize,
    pub duplicate_count: usize,
    pub status: String,
}

pub fn snapshot_dir(lake_root: &Path, snapshot_id: &str) -> Result<PathBuf> {
    if !is_safe_id(snapshot_id) {
        return Err(EamError::Usage(format!("unsafe snapshot_id: {}", snapshot_id)).into());
    }
    Ok(lake_root.join(snapshot_id))
}

/// Write a new snapshot. An existing snapshot is never overwritten: the call
/// returns `status = "exists"` and leaves the directory untouched.
pub fn write_snapshot(
    lake_root: &Path,
    snapshot_id: &str,
    rows: Vec<RawBar>,
    latency: &AsofLatencyParams,
    source: &str,
) -> Result<SnapshotWriteResult> {
    let dir = snapshot_dir(lake_root, snapshot_id)?;
    let manifest_path = dir.join("manifest.json");
    if manifest_path.is_file() {
        let manifest = read_json(&manifest_path)?;
        let rows_written = manifest
            .pointer("/datasets/0/row_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        return Ok(SnapshotWriteResult {
            snapshot_id: snapshot_id.to_string(),
            snapshot_dir: dir,
            manifest_path,
            rows_written,
            duplicate_count: 0,
            status: "exists".to_string(),
        });
    }
    let rows_in = rows.len();
    let mut invalid_price_count = 0usize;
    let mut by_key: BTreeMap<(String, NaiveDate), Bar> = BTreeMap::new();
    for raw in rows {
        if !(raw.open > 0.0 && raw.high > 0.0 && raw.low > 0.0 && raw.close > 0.0) || raw.high < raw.low {
            invalid_price_count += 1;
        }
        let bar = raw.into_bar(latency, source);
        by_key.insert((bar.symbol.clone(), bar.dt), bar);
    }
    let bars: Vec<Bar> = by_key.into_values().collect();
    if bars.is_empty() {
        return Err(EamError::Usage("snapshot has no rows".into()).into());
    }
    let duplicate_count = rows_in - bars.len();

    ensure_dir(&dir)?;
    let data_path = dir.join(OHLCV_FILE);
    atomic_write_text(&data_path, &bars_to_csv(&bars))?;

    let symbols: BTreeSet<&str> = bars.iter().map(|b| b.symbol.as_str()).collect();
    let dt_min = bars.iter().map(|b| b.dt).min();
    let dt_max = bars.iter().map(|b| b.dt).max();
    let av_min = bars.iter().map(|b| b.available_at).min();
    let av_max = bars.iter().map(|b| b.available_at).max();
    let created_at = now_iso();
    let manifest = json!({
        "schema_version": "data_snapshot_manifest_v1",
        "snapshot_id": snapshot_id,
        "created_at": created_at,
        "source": source,
        "datasets": [{
            "dataset_id": OHLCV_DATASET_ID,
            "file": OHLCV_FILE,
            "row_count": bars.len(),
            "fields": OHLCV_FIELDS,
            "symbols": symbols,
            "dt_min": dt_min.map(|d| d.to_string()),
            "dt_max": dt_max.map(|d| d.to_string()),
            "available_at_min": av_min.map(|t| format_ts(&t)),
            "available_at_max": av_max.map(|t| format_ts(&t)),
            "sha256": sha256_file(&data_path)?,
            "extensions": {"asof_rule": latency.asof_rule},
        }],
    });
    ensure_valid(&manifest)?;
    let quality = json!({
        "schema_version": "quality_report_v1",
        "snapshot_id": snapshot_id,
        "dataset_id": OHLCV_DATASET_ID,
        "rows_before_dedup": rows_in,
        "rows_after_dedup": bars.len(),
        "duplicate_count": duplicate_count,
        "invalid_price_count": invalid_price_count,
        "checks": [
            {"check_id": "no_duplicate_symbol_dt", "pass": true},
            {"check_id": "positive_prices", "pass": invalid_price_count == 0},
            {"check_id": "available_at_present", "pass": true},
        ],
    });
    ensure_valid(&quality)?;
    let ingest = json!({
        "schema_version": "ingest_manifest_v1",
        "snapshot_id": snapshot_id,
        "ingested_at": created_at,
        "source": source,
        "rows_in": rows_in,
        "rows_written": bars.len(),
        "files": [OHLCV_FILE, "manifest.json", "quality_report.json"],
    });
    ensure_valid(&ingest)?;
    atomic_write_json_pretty(&dir.join("quality_report.json"), &quality)?;
    atomic_write_json_pretty(&dir.join("ingest_manifest.json"), &ingest)?;
    // Manifest last: its presence marks the snapshot complete.
    atomic_write_json_pretty(&manifest_path, &manifest)?;
    tracing::info!(snapshot_id, rows = bars.len(), duplicate_count, "snapshot written");
    Ok(SnapshotWriteResult {
        snapshot_id: snapshot_id.to_string(),
        snapshot_dir: dir,
        manifest_path,
        rows_written: bars.len(),
        duplicate_count,
        status: "created".to_string(),
    })
}

/// Deterministic demo bars: two symbols, ten days from 2024-01-01.
pub fn demo_rows() -> Vec<RawBar> {
    let mut rows = Vec::new();
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default();
    for (si, symbol) in ["AAA", "BBB"].iter().enumerate() {
        for di in 0..10i64 {
            let base = 100.0 + si as f64 * 10.0 + di as f64 * 0.1;
            rows.push(RawBar {
                symbol: symbol.to_string(),
                dt: start + Duration::days(di),
                open: base,
                high: base + 1.0,
                low: base - 1.0,
                close: base + 0.5,
                volume: 1000.0 + di as f64,
                available_at: None,
            });
        }
    }
    rows
}

pub fn demo_ingest(
    lake_root: &Path,
    snapshot_id: &str,
    latency: &AsofLatencyParams,
) -> Result<SnapshotWriteResult> {
    write_snapshot(lake_root, snapshot_id, demo_rows(), latency, "demo")
}

pub fn list_snapshots(lake_root: &Path) -> Result<Vec<String>> {
    if !lake_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut ids: Vec<String> = fs::read_dir(lake_root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().join("manifest.json").is_file())
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .filter(|id| is_safe_id(id))
        .collect();
    ids.sort();
    Ok(ids)
}

pub fn load_snapshot_manifest(lake_root: &Path, snapshot_id: &str) -> Result<Value> {
    let path = snapshot_dir(lake_root, snapshot_id)?.join("manifest.json");
    if !path.is_file() {
        return Err(EamError::NotFound(format!("snapshot not found: {}", snapshot_id)).into());
    }
    read_json(&path)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use eam_core::scratch_dir;

    pub(crate) fn demo_latency() -> AsofLatencyParams {
        AsofLatencyParams {
            asof_rule: "available_at<=as_of".into(),
            default_latency_seconds: 300,
            bar_close_to_signal_seconds: 0,
            trade_lag_bars_default: 1,
        }
    }

    #[test]
    fn demo_ingest_writes_deterministic_snapshot() {
        let root = scratch_dir("eam_lake_test");
        let first = demo_ingest(&root.join("a"), "demo_snap", &demo_latency()).expect("ingest a");
        let second = demo_ingest(&root.join("b"), "demo_snap", &demo_latency()).expect("ingest b");
        assert_eq!(first.rows_written, 20);
        assert_eq!(
            fs::read(first.snapshot_dir.join(OHLCV_FILE)).expect("a"),
            fs::read(second.snapshot_dir.join(OHLCV_FILE)).expect("b")
        );
        let again = demo_ingest(&root.join("a"), "demo_snap", &demo_latency()).expect("again");
        assert_eq!(again.status, "exists");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn available_at_is_derived_from_latency() {
        let root = scratch_dir("eam_lake_latency_test");
        let res = demo_ingest(&root, "snap", &demo_latency()).expect("ingest");
        let bars = read_bars_csv(&res.snapshot_dir.join(OHLCV_FILE)).expect("read");
        assert_eq!(format_ts(&bars[0].available_at), "2024-01-01T16:05:00+08:00");
        assert_eq!(bars[0].symbol, "AAA");
        assert!((bars[0].close - 100.5).abs() < 1e-9);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn duplicates_are_dropped_and_counted() {
        let root = scratch_dir("eam_lake_dup_test");
        let mut rows = demo_rows();
        rows.push(rows[0].clone());
        let res = write_snapshot(&root, "dup", rows, &demo_latency(), "demo").expect("write");
        assert_eq!(res.rows_written, 20);
        assert_eq!(res.duplicate_count, 1);
        let q = read_json(&res.snapshot_dir.join("quality_report.json")).expect("quality");
        assert_eq!(q["duplicate_count"], 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn naive_timestamps_are_market_time() {
        let ts = parse_timestamp("2024-01-02T16:00:00").expect("parse");
        assert_eq!(format_ts(&ts), "2024-01-02T16:00:00+08:00");
        let utc = parse_timestamp("2024-01-02T08:00:00Z").expect("parse");
        assert_eq!(utc, ts);
    }
}
