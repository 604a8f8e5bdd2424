use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset, NaiveDate};
use eam_core::EamError;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::lake::{self, format_ts, parse_date, parse_timestamp, Bar, OHLCV_DATASET_ID};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    Train,
    Test,
    Holdout,
}

impl SegmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentKind::Train => "train",
            SegmentKind::Test => "test",
            SegmentKind::Holdout => "holdout",
        }
    }

    pub fn parse(raw: &str) -> Option<SegmentKind> {
        match raw {
            "train" => Some(SegmentKind::Train),
            "test" => Some(SegmentKind::Test),
            "holdout" => Some(SegmentKind::Holdout),
            _ => None,
        }
    }
}

/// Evaluation window with its as-of visibility cutoff.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    pub segment_id: String,
    pub kind: SegmentKind,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub as_of: DateTime<FixedOffset>,
}

impl Segment {
    pub fn new(segment_id: &str, kind: SegmentKind, start: NaiveDate, end: NaiveDate) -> Self {
        Segment {
            segment_id: segment_id.to_string(),
            kind,
            start,
            end,
            as_of: lake::end_of_day(end),
        }
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let text = |key: &str| -> Result<String> {
            value
                .get(key)
                .and_then(|v| v.as_str())
                .map(String::from)
                .ok_or_else(|| anyhow!("segment missing '{}'", key))
        };
        let kind_raw = text("kind")?;
        let kind = SegmentKind::parse(&kind_raw)
            .ok_or_else(|| anyhow!("unknown segment kind '{}'", kind_raw))?;
        Ok(Segment {
            segment_id: text("segment_id")?,
            kind,
            start: parse_date(&text("start")?)?,
            end: parse_date(&text("end")?)?,
            as_of: parse_timestamp(&text("as_of")?)?,
        })
    }

    pub fn to_json(&self) -> Value {
        json!({
            "segment_id": self.segment_id,
            "kind": self.kind.as_str(),
            "start": self.start.to_string(),
            "end": self.end.to_string(),
            "as_of": format_ts(&self.as_of),
        })
    }
}

/// All segments of a compiled runspec in list order.
pub fn runspec_segments(runspec: &Value) -> Result<Vec<Segment>> {
    if let Some(list) = runspec.pointer("/segments/list").and_then(|v| v.as_array()) {
        return list.iter().map(Segment::from_json).collect();
    }
    let mut out = Vec::new();
    for key in ["train", "test", "holdout"] {
        if let Some(seg) = runspec.pointer(&format!("/segments/{}", key)) {
            out.push(Segment::from_json(seg)?);
        }
    }
    Ok(out)
}

/// The anchor segment of `kind` (`segments.train|test|holdout`).
pub fn runspec_anchor(runspec: &Value, kind: SegmentKind) -> Result<Option<Segment>> {
    match runspec.pointer(&format!("/segments/{}", kind.as_str())) {
        Some(v) if v.is_object() => Ok(Some(Segment::from_json(v)?)),
        _ => Ok(None),
    }
}

pub fn runspec_symbols(runspec: &Value) -> Vec<String> {
    runspec
        .pointer("/extensions/symbols")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|s| s.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

pub struct QueryResult {
    pub rows: Vec<Bar>,
    pub excluded_by_asof: usize,
}

impl QueryResult {
    pub fn summary(&self) -> Value {
        let symbols: BTreeSet<&str> = self.rows.iter().map(|b| b.symbol.as_str()).collect();
        json!({
            "rows": self.rows.len(),
            "excluded_by_asof": self.excluded_by_asof,
            "symbols": symbols,
        })
    }
}

/// Read access to lake snapshots with as-of gating.
#[derive(Clone, Debug)]
pub struct DataCatalog {
    lake_root: PathBuf,
}

impl DataCatalog {
    pub fn new(data_root: &Path) -> Self {
        DataCatalog {
            lake_root: data_root.join("lake"),
        }
    }

    pub fn lake_root(&self) -> &Path {
        &self.lake_root
    }

    pub fn snapshot_dir(&self, snapshot_id: &str) -> Result<PathBuf> {
        lake::snapshot_dir(&self.lake_root, snapshot_id)
    }

    pub fn manifest(&self, snapshot_id: &str) -> Result<Value> {
        lake::load_snapshot_manifest(&self.lake_root, snapshot_id)
    }

    fn dataset_path(&self, snapshot_id: &str, dataset_id: &str) -> Result<PathBuf> {
        let manifest = self.manifest(snapshot_id)?;
        let file = manifest
            .get("datasets")
            .and_then(|v| v.as_array())
            .and_then(|ds| {
                ds.iter()
                    .find(|d| d.get("dataset_id").and_then(|v| v.as_str()) == Some(dataset_id))
            })
            .and_then(|d| d.get("file").and_then(|v| v.as_str()))
            .ok_or_else(|| {
                EamError::NotFound(format!("dataset {} not in snapshot {}", dataset_id, snapshot_id))
            })?;
        Ok(self.snapshot_dir(snapshot_id)?.join(file))
    }

    /// Bars for `symbols` with `start <= dt <= end`, keeping only rows with
    /// `available_at <= as_of`; sorted by `(symbol, dt)`.
    pub fn query_ohlcv(
        &self,
        snapshot_id: &str,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
        as_of: &DateTime<FixedOffset>,
    ) -> Result<QueryResult> {
        let path = self.dataset_path(snapshot_id, OHLCV_DATASET_ID)?;
        let wanted: BTreeSet<&str> = symbols.iter().map(String::as_str).collect();
        let mut rows = Vec::new();
        let mut excluded_by_asof = 0usize;
        for bar in lake::read_bars_csv(&path)? {
            if !wanted.contains(bar.symbol.as_str()) || bar.dt < start || bar.dt > end {
                continue;
            }
            if bar.available_at > *as_of {
                excluded_by_asof += 1;
                continue;
            }
            rows.push(bar);
        }
        rows.sort_by(|a, b| (a.symbol.as_str(), a.dt).cmp(&(b.symbol.as_str(), b.dt)));
        Ok(QueryResult {
            rows,
            excluded_by_asof,
        })
    }

    pub fn query_segment(
        &self,
        snapshot_id: &str,
        symbols: &[String],
        segment: &Segment,
    ) -> Result<QueryResult> {
        self.query_ohlcv(snapshot_id, symbols, segment.start, segment.end, &segment.as_of)
    }
}

/// Rows whose `available_at` is later than `as_of`.
pub fn count_asof_violations(rows: &[Bar], as_of: &DateTime<FixedOffset>) -> usize {
    rows.iter().filter(|b| b.available_at > *as_of).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lake::tests::demo_latency;
    use eam_core::scratch_dir;

    #[test]
    fn query_applies_symbol_date_and_asof_filters() {
        let root = scratch_dir("eam_catalog_test");
        lake::demo_ingest(&root.join("lake"), "snap", &demo_latency()).expect("ingest");
        let catalog = DataCatalog::new(&root);
        let start = NaiveDate::from_ymd_opt(2024, 1, 2).expect("date");
        let end = NaiveDate::from_ymd_opt(2024, 1, 5).expect("date");
        // 16:00 close + 300s latency: the 2024-01-05 bar is not yet visible at 16:04.
        let as_of = parse_timestamp("2024-01-05T16:04:00+08:00").expect("ts");
        let res = catalog
            .query_ohlcv("snap", &["BBB".to_string()], start, end, &as_of)
            .expect("query");
        assert_eq!(res.rows.len(), 3);
        assert_eq!(res.excluded_by_asof, 1);
        assert!(res.rows.iter().all(|b| b.symbol == "BBB"));
        assert_eq!(count_asof_violations(&res.rows, &as_of), 0);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn segments_round_trip_through_runspec_json() {
        let seg = Segment::new(
            "test_000",
            SegmentKind::Test,
            NaiveDate::from_ymd_opt(2024, 1, 4).expect("date"),
            NaiveDate::from_ymd_opt(2024, 1, 7).expect("date"),
        );
        let rs = json!({"segments": {"test": seg.to_json(), "list": [seg.to_json()]}});
        assert_eq!(runspec_segments(&rs).expect("segments"), vec![seg.clone()]);
        assert_eq!(
            runspec_anchor(&rs, SegmentKind::Test).expect("anchor"),
            Some(seg)
        );
        assert_eq!(runspec_anchor(&rs, SegmentKind::Holdout).expect("none"), None);
    }

    #[test]
    fn missing_snapshot_is_not_found() {
        let root = scratch_dir("eam_catalog_missing_test");
        let err = DataCatalog::new(&root).manifest("nope").expect_err("missing");
        assert!(err.to_string().contains("snapshot not found"));
    }
}
