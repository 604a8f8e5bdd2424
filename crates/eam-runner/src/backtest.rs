//! Backtest adapters. The runner and the gates only talk to
//! [`BacktestAdapter`]; `vectorbt_signal_v1` is the deterministic reference
//! implementation (long-only, equal-weight, daily bars).

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use eam_core::EamError;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::dsl::SignalProgram;
use crate::lake::Bar;
use crate::policies::{CostParams, ExecutionParams};

pub const VECTORBT_SIGNAL_V1: &str = "vectorbt_signal_v1";
pub const BUY_AND_HOLD_STRATEGY_ID: &str = "buy_and_hold_mvp";
pub const DEFAULT_INIT_CASH: f64 = 100_000.0;
const TRADING_DAYS: f64 = 252.0;
const BPS: f64 = 1e4;

#[derive(Clone, Debug)]
pub enum Strategy {
    BuyAndHold,
    Signal(SignalProgram),
}

impl Strategy {
    /// Strategy carried by a compiled runspec (`extensions.strategy_id` /
    /// `extensions.strategy_spec`).
    pub fn from_runspec(runspec: &Value) -> Result<Strategy> {
        let strategy_id = runspec
            .pointer("/extensions/strategy_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if strategy_id == BUY_AND_HOLD_STRATEGY_ID {
            return Ok(Strategy::BuyAndHold);
        }
        match runspec.pointer("/extensions/strategy_spec") {
            Some(spec) if spec.is_object() => Ok(Strategy::Signal(SignalProgram::parse(spec)?)),
            _ => Err(EamError::Usage(format!(
                "runspec has no strategy_spec and strategy_id '{}' is not built in",
                strategy_id
            ))
            .into()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::BuyAndHold => "buy_and_hold",
            Strategy::Signal(_) => "signal_dsl_v1",
        }
    }
}

pub struct BacktestInput<'a> {
    pub bars: &'a [Bar],
    pub strategy: &'a Strategy,
    pub execution: &'a ExecutionParams,
    pub cost: &'a CostParams,
    pub lag_bars: u32,
    pub init_cash: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Trade {
    pub symbol: String,
    pub entry_dt: NaiveDate,
    pub exit_dt: NaiveDate,
    pub qty: f64,
    pub pnl: f64,
    pub fees: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PositionRow {
    pub dt: NaiveDate,
    pub symbol: String,
    pub qty: f64,
    pub close: f64,
    pub position_value: f64,
    pub equity: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BacktestStats {
    pub total_return: f64,
    pub max_drawdown: f64,
    pub sharpe: f64,
    pub trade_count: usize,
    pub final_equity: f64,
    pub max_leverage: f64,
    pub max_positions: usize,
    pub max_turnover: f64,
}

#[derive(Clone, Debug)]
pub struct BacktestOutput {
    pub adapter_id: String,
    pub init_cash: f64,
    pub lag_bars: u32,
    pub curve: Vec<(NaiveDate, f64)>,
    pub trades: Vec<Trade>,
    pub positions: Vec<PositionRow>,
    pub turnover: Vec<(NaiveDate, f64)>,
    pub stats: BacktestStats,
}

pub trait BacktestAdapter {
    fn adapter_id(&self) -> &str;
    fn run(&self, input: &BacktestInput<'_>) -> Result<BacktestOutput>;
}

pub fn adapter_for(adapter_id: &str) -> Result<Box<dyn BacktestAdapter>> {
    match adapter_id {
        VECTORBT_SIGNAL_V1 => Ok(Box::new(VectorbtSignalAdapter)),
        other => Err(EamError::Usage(format!("unsupported adapter_id: {}", other)).into()),
    }
}

fn num(v: f64) -> String {
    format!("{:.6}", v)
}

impl BacktestOutput {
    pub fn metrics_json(&self) -> Value {
        json!({
            "adapter_id": self.adapter_id,
            "init_cash": self.init_cash,
            "lag_bars": self.lag_bars,
            "n_bars": self.curve.len(),
            "total_return": self.stats.total_return,
            "max_drawdown": self.stats.max_drawdown,
            "sharpe": self.stats.sharpe,
            "trade_count": self.stats.trade_count,
            "final_equity": self.stats.final_equity,
        })
    }

    pub fn exposure_json(&self) -> Value {
        json!({
            "schema_version": "backtest_exposure_v1",
            "max_leverage": self.stats.max_leverage,
            "max_positions": self.stats.max_positions,
            "max_turnover": self.stats.max_turnover,
            "allow_short": false,
            "min_qty": self.positions.iter().map(|p| p.qty).fold(0.0_f64, f64::min),
        })
    }

    pub fn curve_csv(&self) -> String {
        let mut out = String::from("dt,equity\n");
        for (dt, eq) in &self.curve {
            out.push_str(&format!("{},{}\n", dt, num(*eq)));
        }
        out
    }

    pub fn trades_csv(&self) -> String {
        let mut out = String::from("symbol,entry_dt,exit_dt,pnl,qty,fees\n");
        for t in &self.trades {
            out.push_str(&format!(
                "{},{},{},{},{},{}\n",
                t.symbol,
                t.entry_dt,
                t.exit_dt,
                num(t.pnl),
                num(t.qty),
                num(t.fees)
            ));
        }
        out
    }

    pub fn positions_csv(&self) -> String {
        let mut out = String::from("dt,symbol,qty,close,position_value,equity\n");
        for p in &self.positions {
            out.push_str(&format!(
                "{},{},{},{},{},{}\n",
                p.dt,
                p.symbol,
                num(p.qty),
                num(p.close),
                num(p.position_value),
                num(p.equity)
            ));
        }
        out
    }

    pub fn turnover_csv(&self) -> String {
        let mut out = String::from("dt,turnover\n");
        for (dt, t) in &self.turnover {
            out.push_str(&format!("{},{}\n", dt, num(*t)));
        }
        out
    }
}

/// Reference adapter: equal-weight long-only signals on daily bars.
pub struct VectorbtSignalAdapter;

struct SymbolPlan {
    by_date: BTreeMap<NaiveDate, usize>,
    bars: Vec<Bar>,
    entry: Vec<bool>,
    exit: Vec<bool>,
}

struct Holding {
    qty: f64,
    cost_basis: f64,
    entry_fees: f64,
    entry_dt: NaiveDate,
}

fn shift(raw: &[bool], lag: usize) -> Vec<bool> {
    (0..raw.len())
        .map(|i| i >= lag && raw[i - lag])
        .collect()
}

fn plan_symbol(bars: Vec<Bar>, strategy: &Strategy, lag: usize) -> Result<SymbolPlan> {
    let n = bars.len();
    let (entry_raw, exit_raw) = match strategy {
        Strategy::BuyAndHold => {
            let mut entry = vec![false; n];
            let mut exit = vec![false; n];
            if n > 0 {
                entry[0] = true;
                exit[n.saturating_sub(1 + lag)] = true;
            }
            (entry, exit)
        }
        Strategy::Signal(program) => program.signals(&bars)?,
    };
    let by_date = bars.iter().enumerate().map(|(i, b)| (b.dt, i)).collect();
    Ok(SymbolPlan {
        by_date,
        entry: shift(&entry_raw, lag),
        exit: shift(&exit_raw, lag),
        bars,
    })
}

fn fill_price(bar: &Bar, execution: &ExecutionParams) -> Result<f64> {
    match (execution.order_timing.as_str(), execution.fill_price.as_str()) {
        ("next_open", "open") => Ok(bar.open),
        ("close", "close") => Ok(bar.close),
        (timing, price) => Err(EamError::Usage(format!(
            "{}: unsupported execution order_timing={} fill_price={}",
            VECTORBT_SIGNAL_V1, timing, price
        ))
        .into()),
    }
}

fn round_lot(qty: f64, lot_size: Option<f64>) -> f64 {
    match lot_size {
        Some(lot) if lot > 0.0 => (qty / lot).floor() * lot,
        _ => qty,
    }
}

impl BacktestAdapter for VectorbtSignalAdapter {
    fn adapter_id(&self) -> &str {
        VECTORBT_SIGNAL_V1
    }

    fn run(&self, input: &BacktestInput<'_>) -> Result<BacktestOutput> {
        if input.bars.is_empty() {
            return Err(EamError::Usage("backtest has no bars (check snapshot and segment)".into()).into());
        }
        if input.lag_bars < 1 {
            return Err(EamError::PolicyViolation("lag_bars must be >= 1".into()).into());
        }
        if input.execution.allow_short {
            tracing::debug!("allow_short ignored: reference adapter is long-only");
        }
        let lag = input.lag_bars as usize;
        let commission = input.cost.commission_bps / BPS;
        let slippage = input.cost.slippage_bps / BPS;
        let tax = input.cost.tax_bps.unwrap_or(0.0) / BPS;
        let min_fee = input.cost.min_fee.unwrap_or(0.0);
        let fee_for = |value: f64, extra: f64| (value * (commission + extra)).max(min_fee);

        let mut per_symbol: BTreeMap<String, Vec<Bar>> = BTreeMap::new();
        for bar in input.bars {
            per_symbol.entry(bar.symbol.clone()).or_default().push(bar.clone());
        }
        let mut plans = BTreeMap::new();
        for (symbol, mut bars) in per_symbol {
            bars.sort_by_key(|b| b.dt);
            plans.insert(symbol, plan_symbol(bars, input.strategy, lag)?);
        }
        let dates: BTreeSet<NaiveDate> = input.bars.iter().map(|b| b.dt).collect();

        let mut cash = input.init_cash;
        let mut holdings: BTreeMap<String, Holding> = BTreeMap::new();
        let mut last_close: BTreeMap<String, f64> = BTreeMap::new();
        let mut prev_equity = input.init_cash;
        let mut out = BacktestOutput {
            adapter_id: VECTORBT_SIGNAL_V1.to_string(),
            init_cash: input.init_cash,
            lag_bars: input.lag_bars,
            curve: Vec::new(),
            trades: Vec::new(),
            positions: Vec::new(),
            turnover: Vec::new(),
            stats: BacktestStats::default(),
        };

        for dt in &dates {
            let mut traded = 0.0;
            let today: Vec<(&String, &SymbolPlan, usize)> = plans
                .iter()
                .filter_map(|(s, p)| p.by_date.get(dt).map(|i| (s, p, *i)))
                .collect();

            // exits before entries so freed cash is reallocated the same day
            for (symbol, plan, i) in &today {
                if !(plan.exit[*i] && !plan.entry[*i]) {
                    continue;
                }
                if let Some(h) = holdings.remove(*symbol) {
                    let price = fill_price(&plan.bars[*i], input.execution)? * (1.0 - slippage);
                    let gross = h.qty * price;
                    let fees = fee_for(gross, tax);
                    cash += gross - fees;
                    traded += gross;
                    out.trades.push(Trade {
                        symbol: symbol.to_string(),
                        entry_dt: h.entry_dt,
                        exit_dt: *dt,
                        qty: h.qty,
                        pnl: gross - fees - h.cost_basis,
                        fees: h.entry_fees + fees,
                    });
                }
            }
            let entering: Vec<&(&String, &SymbolPlan, usize)> = today
                .iter()
                .filter(|(s, p, i)| p.entry[*i] && !p.exit[*i] && !holdings.contains_key(*s))
                .collect();
            let free = plans.len() - holdings.len();
            if !entering.is_empty() && free > 0 && cash > 0.0 {
                let alloc = cash / free as f64;
                for (symbol, plan, i) in entering {
                    let price = fill_price(&plan.bars[*i], input.execution)? * (1.0 + slippage);
                    let qty = round_lot(alloc / (price * (1.0 + commission)), input.execution.lot_size);
                    if qty <= 0.0 {
                        continue;
                    }
                    let gross = qty * price;
                    let fees = fee_for(gross, 0.0);
                    if gross + fees > cash + 1e-9 {
                        continue;
                    }
                    cash -= gross + fees;
                    traded += gross;
                    holdings.insert(
                        symbol.to_string(),
                        Holding {
                            qty,
                            cost_basis: gross + fees,
                            entry_fees: fees,
                            entry_dt: *dt,
                        },
                    );
                }
            }

            for (symbol, plan, i) in &today {
                last_close.insert(symbol.to_string(), plan.bars[*i].close);
            }
            let mut gross_exposure = 0.0;
            let mut rows = Vec::new();
            for (symbol, h) in &holdings {
                let close = last_close.get(symbol).copied().unwrap_or(0.0);
                let value = h.qty * close;
                gross_exposure += value.abs();
                rows.push((symbol.clone(), h.qty, close, value));
            }
            let equity = cash + gross_exposure;
            for (symbol, qty, close, value) in rows {
                out.positions.push(PositionRow {
                    dt: *dt,
                    symbol,
                    qty,
                    close,
                    position_value: value,
                    equity,
                });
            }
            let turnover = if prev_equity > 0.0 { traded / prev_equity } else { 0.0 };
            let denom = gross_exposure + cash.max(0.0);
            let leverage = if denom > 0.0 { gross_exposure / denom } else { 0.0 };
            out.stats.max_leverage = out.stats.max_leverage.max(leverage);
            out.stats.max_positions = out.stats.max_positions.max(holdings.len());
            out.stats.max_turnover = out.stats.max_turnover.max(turnover);
            out.turnover.push((*dt, turnover));
            out.curve.push((*dt, equity));
            prev_equity = equity;
        }

        // open positions are marked out at the last close without extra costs
        if let Some(last_dt) = dates.iter().next_back() {
            for (symbol, h) in holdings {
                let close = last_close.get(&symbol).copied().unwrap_or(0.0);
                out.trades.push(Trade {
                    symbol,
                    entry_dt: h.entry_dt,
                    exit_dt: *last_dt,
                    qty: h.qty,
                    pnl: h.qty * close - h.cost_basis,
                    fees: h.entry_fees,
                });
            }
        }
        out.trades.sort_by(|a, b| {
            (a.entry_dt, a.symbol.as_str()).cmp(&(b.entry_dt, b.symbol.as_str()))
        });
        summarize(&mut out);
        Ok(out)
    }
}

fn summarize(out: &mut BacktestOutput) {
    let equities: Vec<f64> = out.curve.iter().map(|(_, e)| *e).collect();
    let final_equity = equities.last().copied().unwrap_or(out.init_cash);
    let mut peak = f64::MIN;
    let mut max_dd = 0.0_f64;
    for e in &equities {
        peak = peak.max(*e);
        if peak > 0.0 {
            max_dd = max_dd.max((peak - e) / peak);
        }
    }
    let returns: Vec<f64> = equities
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    let sharpe = if returns.len() >= 2 {
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
            / (returns.len() - 1) as f64;
        let sd = var.sqrt();
        if sd > 0.0 && sd.is_finite() {
            mean / sd * TRADING_DAYS.sqrt()
        } else {
            0.0
        }
    } else {
        0.0
    };
    out.stats.total_return = final_equity / out.init_cash - 1.0;
    out.stats.max_drawdown = max_dd;
    out.stats.sharpe = sharpe;
    out.stats.trade_count = out.trades.len();
    out.stats.final_equity = final_equity;
}

/// Run `adapter_id` over `bars` with policy-derived execution and costs.
pub fn run_adapter(
    adapter_id: &str,
    bars: &[Bar],
    strategy: &Strategy,
    execution: &ExecutionParams,
    cost: &CostParams,
    lag_bars: u32,
) -> Result<BacktestOutput> {
    let adapter = adapter_for(adapter_id)?;
    let out = adapter.run(&BacktestInput {
        bars,
        strategy,
        execution,
        cost,
        lag_bars,
        init_cash: DEFAULT_INIT_CASH,
    })?;
    if !out.stats.total_return.is_finite() {
        return Err(anyhow!("{}: non-finite total_return", adapter_id));
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::lake::daily_close;
    use chrono::Duration;
    use serde_json::json;

    pub(crate) fn next_open() -> ExecutionParams {
        ExecutionParams {
            order_timing: "next_open".into(),
            fill_price: "open".into(),
            allow_short: false,
            lot_size: Some(1.0),
            rounding: None,
        }
    }

    pub(crate) fn costs(bps: f64) -> CostParams {
        CostParams {
            commission_bps: bps,
            slippage_bps: bps,
            tax_bps: None,
            min_fee: None,
        }
    }

    fn trending(symbol: &str, n: i64, step: f64) -> Vec<Bar> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).expect("date");
        (0..n)
            .map(|i| {
                let dt = start + Duration::days(i);
                let px = 100.0 + step * i as f64;
                Bar {
                    symbol: symbol.into(),
                    dt,
                    open: px,
                    high: px + 1.0,
                    low: px - 1.0,
                    close: px + 0.5,
                    volume: 1000.0,
                    available_at: daily_close(dt),
                    source: "test".into(),
                }
            })
            .collect()
    }

    #[test]
    fn buy_and_hold_enters_after_lag_and_exits_on_last_bar() {
        let bars = trending("AAA", 5, 1.0);
        let out = run_adapter(VECTORBT_SIGNAL_V1, &bars, &Strategy::BuyAndHold, &next_open(), &costs(0.0), 1)
            .expect("run");
        assert_eq!(out.trades.len(), 1);
        let t = &out.trades[0];
        assert_eq!(t.entry_dt, bars[1].dt);
        assert_eq!(t.exit_dt, bars[4].dt);
        assert_eq!(out.curve.len(), 5);
        assert!((out.curve[0].1 - DEFAULT_INIT_CASH).abs() < 1e-9);
        assert!(out.stats.total_return > 0.0);
        assert!(out.stats.max_leverage <= 1.0 + 1e-9);
    }

    #[test]
    fn higher_costs_lower_returns_and_runs_are_deterministic() {
        let mut bars = trending("AAA", 8, 1.0);
        bars.extend(trending("BBB", 8, 0.5));
        let cheap = run_adapter(VECTORBT_SIGNAL_V1, &bars, &Strategy::BuyAndHold, &next_open(), &costs(5.0), 1)
            .expect("cheap");
        let again = run_adapter(VECTORBT_SIGNAL_V1, &bars, &Strategy::BuyAndHold, &next_open(), &costs(5.0), 1)
            .expect("again");
        let dear = run_adapter(VECTORBT_SIGNAL_V1, &bars, &Strategy::BuyAndHold, &next_open(), &costs(50.0), 1)
            .expect("dear");
        assert_eq!(cheap.curve_csv(), again.curve_csv());
        assert_eq!(cheap.trades_csv(), again.trades_csv());
        assert!(dear.stats.total_return < cheap.stats.total_return);
        assert_eq!(cheap.stats.max_positions, 2);
    }

    #[test]
    fn signal_program_trades_on_lagged_crossings() {
        let program = SignalProgram::parse(&json!({
            "signals": {"entry": "up", "exit": "down"},
            "expressions": {
                "up": {"op": "gt", "left": {"op": "col", "field": "close"}, "right": {"op": "const", "value": 102}},
                "down": {"op": "not", "of": {"op": "ref", "name": "up"}}
            }
        }))
        .expect("program");
        let bars = trending("AAA", 6, 1.0);
        let out = run_adapter(
            VECTORBT_SIGNAL_V1,
            &bars,
            &Strategy::Signal(program),
            &next_open(),
            &costs(0.0),
            2,
        )
        .expect("run");
        // close > 102 first holds on bar 2; two bars of lag puts the fill on bar 4
        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].entry_dt, bars[4].dt);
    }

    #[test]
    fn unsupported_execution_and_zero_lag_are_rejected() {
        let bars = trending("AAA", 3, 1.0);
        let mut exec = next_open();
        exec.fill_price = "vwap".into();
        let err = run_adapter(VECTORBT_SIGNAL_V1, &bars, &Strategy::BuyAndHold, &exec, &costs(0.0), 1)
            .expect_err("vwap");
        assert!(err.to_string().contains("unsupported execution"), "unexpected: {}", err);
        let err = run_adapter(VECTORBT_SIGNAL_V1, &bars, &Strategy::BuyAndHold, &next_open(), &costs(0.0), 0)
            .expect_err("lag");
        assert!(err.to_string().contains("lag_bars"));
        assert!(adapter_for("zipline").is_err());
    }
}
