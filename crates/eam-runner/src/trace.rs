//! Calc trace preview: a short per-row table of what the signal program sees
//! and emits, for human review before the deterministic run.

use anyhow::{anyhow, Result};
use eam_core::{atomic_write_json_pretty, atomic_write_text, canonical_json_digest, ensure_dir, sha256_bytes};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use crate::catalog::DataCatalog;
use crate::dsl::SignalProgram;
use crate::lake::{format_ts, parse_date, parse_timestamp, Bar, OHLCV_DATASET_ID};

pub const TRACE_CSV: &str = "calc_trace_preview.csv";
pub const TRACE_META: &str = "trace_meta.json";
const DEFAULT_MAX_ROWS: usize = 20;

pub struct TracePreviewInput<'a> {
    pub snapshot_id: &'a str,
    pub as_of: &'a str,
    pub start: &'a str,
    pub end: &'a str,
    pub symbols: Vec<String>,
    pub signal_dsl: &'a Value,
    pub trace_plan: &'a Value,
    pub lag_bars: u32,
}

#[derive(Clone, Debug)]
pub struct TracePreview {
    pub csv_path: PathBuf,
    pub meta_path: PathBuf,
    pub meta: Value,
}

fn fmt_value(v: f64) -> String {
    if v.is_nan() {
        String::new()
    } else {
        format!("{}", v)
    }
}

fn flag(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

fn lagged(raw: &[bool], lag: usize) -> Vec<bool> {
    (0..raw.len()).map(|i| i >= lag && raw[i - lag]).collect()
}

/// Evaluate the program per symbol over the as-of filtered window and write
/// `calc_trace_preview.csv` + `trace_meta.json` into `out_dir`.
pub fn run_calc_trace_preview(out_dir: &Path, data_root: &Path, input: &TracePreviewInput<'_>) -> Result<TracePreview> {
    let program = SignalProgram::parse(input.signal_dsl)
        .map_err(|e| anyhow!("trace preview failed to compile signal_dsl_v1: {}", e))?;
    let plan_symbols: Vec<String> = input
        .trace_plan
        .pointer("/sample/symbols")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|s| s.as_str()).filter(|s| !s.trim().is_empty()).map(String::from).collect())
        .unwrap_or_default();
    let symbols = if plan_symbols.is_empty() { input.symbols.clone() } else { plan_symbols };
    let max_rows = input
        .trace_plan
        .pointer("/sample/max_rows")
        .and_then(|v| v.as_u64())
        .map(|n| n.max(1) as usize)
        .unwrap_or(DEFAULT_MAX_ROWS);
    let steps: Vec<String> = input
        .trace_plan
        .get("steps")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|s| s.get("expr_ref").and_then(|v| v.as_str()))
                .filter(|r| program.expressions.contains_key(*r))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let as_of = parse_timestamp(input.as_of)?;
    let catalog = DataCatalog::new(data_root);
    let query = catalog.query_ohlcv(
        input.snapshot_id,
        &symbols,
        parse_date(input.start)?,
        parse_date(input.end)?,
        &as_of,
    )?;

    let mut header = vec!["dt", "symbol", "close", "available_at", "eligible"];
    header.extend(steps.iter().map(String::as_str));
    header.extend(["entry_raw", "exit_raw", "entry_lagged", "exit_lagged"]);
    let mut csv = header.join(",");
    csv.push('\n');

    let lag = input.lag_bars.max(1) as usize;
    let mut signal_bits = String::new();
    let mut rows_written = 0usize;
    let mut start = 0usize;
    while start < query.rows.len() && rows_written < max_rows {
        let symbol = &query.rows[start].symbol;
        let end = query.rows[start..]
            .iter()
            .position(|b| &b.symbol != symbol)
            .map(|p| start + p)
            .unwrap_or(query.rows.len());
        let bars: &[Bar] = &query.rows[start..end];
        let (entry, exit) = program.signals(bars)?;
        let entry_l = lagged(&entry, lag);
        let exit_l = lagged(&exit, lag);
        let columns: Vec<Vec<f64>> = steps
            .iter()
            .map(|s| program.evaluate(s, bars))
            .collect::<Result<_>>()?;
        for (i, bar) in bars.iter().enumerate() {
            if rows_written >= max_rows {
                break;
            }
            let mut cells = vec![
                bar.dt.to_string(),
                bar.symbol.clone(),
                fmt_value(bar.close),
                format_ts(&bar.available_at),
                flag(bar.available_at <= as_of).to_string(),
            ];
            cells.extend(columns.iter().map(|c| fmt_value(c[i])));
            cells.extend([entry[i], exit[i], entry_l[i], exit_l[i]].iter().map(|b| flag(*b).to_string()));
            csv.push_str(&cells.join(","));
            csv.push('\n');
            signal_bits.push_str(&format!("{}{}{}{}", entry[i] as u8, exit[i] as u8, entry_l[i] as u8, exit_l[i] as u8));
            rows_written += 1;
        }
        start = end;
    }

    ensure_dir(out_dir)?;
    let csv_path = out_dir.join(TRACE_CSV);
    atomic_write_text(&csv_path, &csv)?;
    let meta = json!({
        "snapshot_id": input.snapshot_id,
        "dataset_id": OHLCV_DATASET_ID,
        "as_of": input.as_of,
        "rows_before_asof": query.rows.len() + query.excluded_by_asof,
        "rows_after_asof": query.rows.len(),
        "rows_written": rows_written,
        "lag_bars_used": lag,
        "dsl_fingerprint": canonical_json_digest(input.signal_dsl),
        "signals_fingerprint": sha256_bytes(signal_bits.as_bytes()),
    });
    let meta_path = out_dir.join(TRACE_META);
    atomic_write_json_pretty(&meta_path, &meta)?;
    Ok(TracePreview {
        csv_path,
        meta_path,
        meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lake::demo_ingest;
    use crate::lake::tests::demo_latency;
    use eam_core::scratch_dir;
    use std::fs;

    #[test]
    fn preview_writes_lagged_signal_columns() {
        let root = scratch_dir("eam_trace_test");
        demo_ingest(&root.join("data/lake"), "demo_snap", &demo_latency()).expect("ingest");
        let dsl = json!({
            "dsl_version": "signal_dsl_v1",
            "signals": {"entry": "entry_all", "exit": "exit_none"},
            "expressions": {
                "entry_all": {"op": "const", "value": true},
                "exit_none": {"op": "const", "value": false}
            }
        });
        let plan = json!({
            "schema_version": "calc_trace_plan_v1",
            "sample": {"max_rows": 3, "symbols": ["AAA"]},
            "steps": [{"step_id": "s1", "expr_ref": "entry_all"}]
        });
        let out = root.join("trace");
        let preview = run_calc_trace_preview(
            &out,
            &root.join("data"),
            &TracePreviewInput {
                snapshot_id: "demo_snap",
                as_of: "2024-12-31T23:59:59+08:00",
                start: "2024-01-01",
                end: "2024-12-31",
                symbols: vec!["AAA".into(), "BBB".into()],
                signal_dsl: &dsl,
                trace_plan: &plan,
                lag_bars: 1,
            },
        )
        .expect("preview");
        let csv = fs::read_to_string(&preview.csv_path).expect("csv");
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "dt,symbol,close,available_at,eligible,entry_all,entry_raw,exit_raw,entry_lagged,exit_lagged");
        assert_eq!(lines.len(), 4);
        assert!(lines[1].ends_with(",true,1,true,false,false,false"), "row: {}", lines[1]);
        assert!(lines[2].ends_with(",1,true,false,true,false"), "row: {}", lines[2]);
        assert_eq!(preview.meta["rows_written"], 3);
        let _ = fs::remove_dir_all(root);
    }
}
