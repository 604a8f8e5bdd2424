//! Signal DSL v1: named expressions over one symbol's bar series.
//!
//! Every expression evaluates to one `f64` per bar. Booleans are `1.0`/`0.0`
//! and `NaN` marks "not yet defined" (for example the warm-up of a moving
//! average); `NaN` is false wherever a boolean is needed.
//!
//! A document may carry a `params` object. `{"op": "param", "name": ..}`
//! reads a numeric or boolean param, and the integer fields `window`/`bars`
//! accept `{"param": name}` in place of a literal. Params are bound at parse
//! time, so a sweep trial is just the same document with other params.

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::lake::Bar;

const MAX_REF_DEPTH: usize = 32;

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Const(f64),
    Col(String),
    Sma { of: Box<Expr>, window: usize },
    Lag { of: Box<Expr>, bars: usize },
    Binary { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    Not(Box<Expr>),
    Ref(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Gt,
    Ge,
    Lt,
    Le,
    And,
    Or,
}

impl BinOp {
    fn parse(op: &str) -> Option<BinOp> {
        Some(match op {
            "add" => BinOp::Add,
            "sub" => BinOp::Sub,
            "mul" => BinOp::Mul,
            "div" => BinOp::Div,
            "gt" => BinOp::Gt,
            "ge" => BinOp::Ge,
            "lt" => BinOp::Lt,
            "le" => BinOp::Le,
            "and" => BinOp::And,
            "or" => BinOp::Or,
            _ => return None,
        })
    }

    fn apply(&self, a: f64, b: f64) -> f64 {
        if a.is_nan() || b.is_nan() {
            return f64::NAN;
        }
        let bool_f = |v: bool| if v { 1.0 } else { 0.0 };
        match self {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => {
                if b == 0.0 {
                    f64::NAN
                } else {
                    a / b
                }
            }
            BinOp::Gt => bool_f(a > b),
            BinOp::Ge => bool_f(a >= b),
            BinOp::Lt => bool_f(a < b),
            BinOp::Le => bool_f(a <= b),
            BinOp::And => bool_f(a != 0.0 && b != 0.0),
            BinOp::Or => bool_f(a != 0.0 || b != 0.0),
        }
    }
}

pub const PRICE_FIELDS: &[&str] = &["open", "high", "low", "close", "volume"];

fn scalar(v: Option<&Value>) -> Option<f64> {
    match v {
        Some(Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
        Some(v) if v.is_number() => v.as_f64(),
        _ => None,
    }
}

impl Expr {
    pub fn parse(value: &Value) -> Result<Expr> {
        Expr::parse_with(value, &Map::new())
    }

    pub fn parse_with(value: &Value, params: &Map<String, Value>) -> Result<Expr> {
        let op = value
            .get("op")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("expression missing 'op'"))?;
        let child = |key: &str| -> Result<Box<Expr>> {
            let v = value
                .get(key)
                .ok_or_else(|| anyhow!("'{}' expression missing '{}'", op, key))?;
            Ok(Box::new(Expr::parse_with(v, params)?))
        };
        let count = |key: &str| -> Result<usize> {
            let raw = match value.get(key) {
                Some(Value::Object(m)) => match m.get("param").and_then(|v| v.as_str()) {
                    Some(name) => params
                        .get(name)
                        .ok_or_else(|| anyhow!("'{}' expression refers to unknown param '{}'", op, name))?,
                    None => return Err(anyhow!("'{}' expression '{}' object needs 'param'", op, key)),
                },
                other => other.unwrap_or(&Value::Null),
            };
            raw.as_u64()
                .filter(|n| *n >= 1)
                .map(|n| n as usize)
                .ok_or_else(|| anyhow!("'{}' expression needs integer '{}' >= 1", op, key))
        };
        match op {
            "const" => scalar(value.get("value"))
                .map(Expr::Const)
                .ok_or_else(|| anyhow!("'const' expression needs boolean or numeric 'value'")),
            "param" => {
                let name = value
                    .get("name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("'param' expression missing 'name'"))?;
                scalar(params.get(name))
                    .map(Expr::Const)
                    .ok_or_else(|| anyhow!("param '{}' must be a boolean or number", name))
            }
            "col" => {
                let field = value
                    .get("field")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("'col' expression missing 'field'"))?;
                if !PRICE_FIELDS.contains(&field) {
                    return Err(anyhow!("'col' field must be one of {:?}", PRICE_FIELDS));
                }
                Ok(Expr::Col(field.to_string()))
            }
            "sma" => Ok(Expr::Sma {
                of: child("of")?,
                window: count("window")?,
            }),
            "lag" => Ok(Expr::Lag {
                of: child("of")?,
                bars: count("bars")?,
            }),
            "not" => Ok(Expr::Not(child("of")?)),
            "ref" => value
                .get("name")
                .and_then(|v| v.as_str())
                .map(|n| Expr::Ref(n.to_string()))
                .ok_or_else(|| anyhow!("'ref' expression missing 'name'")),
            other => match BinOp::parse(other) {
                Some(op) => Ok(Expr::Binary {
                    op,
                    left: child("left")?,
                    right: child("right")?,
                }),
                None => Err(anyhow!("unsupported expression op '{}'", other)),
            },
        }
    }
}

/// Parsed strategy: named expressions plus the entry/exit signal names.
#[derive(Clone, Debug, PartialEq)]
pub struct SignalProgram {
    pub entry: String,
    pub exit: String,
    pub expressions: BTreeMap<String, Expr>,
}

impl SignalProgram {
    /// Parse a `signal_dsl_v1` document (or a blueprint `strategy_spec`).
    pub fn parse(doc: &Value) -> Result<SignalProgram> {
        let signal = |key: &str| -> Result<String> {
            doc.pointer(&format!("/signals/{}", key))
                .and_then(|v| v.as_str())
                .map(String::from)
                .ok_or_else(|| anyhow!("signals.{} is required", key))
        };
        let exprs = doc
            .get("expressions")
            .and_then(|v| v.as_object())
            .ok_or_else(|| anyhow!("expressions must be an object"))?;
        let params = match doc.get("params") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(m)) => m.clone(),
            Some(_) => return Err(anyhow!("params must be an object")),
        };
        let mut expressions = BTreeMap::new();
        for (name, raw) in exprs {
            let expr = Expr::parse_with(raw, &params).map_err(|e| anyhow!("expressions.{}: {}", name, e))?;
            expressions.insert(name.clone(), expr);
        }
        let program = SignalProgram {
            entry: signal("entry")?,
            exit: signal("exit")?,
            expressions,
        };
        for name in [&program.entry, &program.exit] {
            if !program.expressions.contains_key(name) {
                return Err(anyhow!("signal refers to unknown expression '{}'", name));
            }
        }
        Ok(program)
    }

    pub fn evaluate(&self, name: &str, bars: &[Bar]) -> Result<Vec<f64>> {
        let expr = self
            .expressions
            .get(name)
            .ok_or_else(|| anyhow!("unknown expression '{}'", name))?;
        self.eval(expr, bars, 0)
    }

    fn eval(&self, expr: &Expr, bars: &[Bar], depth: usize) -> Result<Vec<f64>> {
        if depth > MAX_REF_DEPTH {
            return Err(anyhow!("expression references nest too deep (cycle?)"));
        }
        let n = bars.len();
        Ok(match expr {
            Expr::Const(v) => vec![*v; n],
            Expr::Col(field) => bars
                .iter()
                .map(|b| b.field(field).unwrap_or(f64::NAN))
                .collect(),
            Expr::Sma { of, window } => {
                let src = self.eval(of, bars, depth + 1)?;
                (0..n)
                    .map(|i| {
                        if i + 1 < *window {
                            f64::NAN
                        } else {
                            src[i + 1 - window..=i].iter().sum::<f64>() / *window as f64
                        }
                    })
                    .collect()
            }
            Expr::Lag { of, bars: k } => {
                let src = self.eval(of, bars, depth + 1)?;
                (0..n)
                    .map(|i| if i >= *k { src[i - k] } else { f64::NAN })
                    .collect()
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval(left, bars, depth + 1)?;
                let r = self.eval(right, bars, depth + 1)?;
                l.iter().zip(r.iter()).map(|(a, b)| op.apply(*a, *b)).collect()
            }
            Expr::Not(of) => self
                .eval(of, bars, depth + 1)?
                .into_iter()
                .map(|v| if v.is_nan() { f64::NAN } else if v != 0.0 { 0.0 } else { 1.0 })
                .collect(),
            Expr::Ref(name) => {
                let target = self
                    .expressions
                    .get(name)
                    .ok_or_else(|| anyhow!("unknown expression '{}'", name))?;
                self.eval(target, bars, depth + 1)?
            }
        })
    }

    /// Raw (unlagged) entry and exit booleans for one symbol's bars.
    pub fn signals(&self, bars: &[Bar]) -> Result<(Vec<bool>, Vec<bool>)> {
        let truthy = |v: Vec<f64>| v.into_iter().map(|x| !x.is_nan() && x != 0.0).collect();
        Ok((
            truthy(self.evaluate(&self.entry, bars)?),
            truthy(self.evaluate(&self.exit, bars)?),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lake::{daily_close, Bar};
    use chrono::{Duration, NaiveDate};
    use serde_json::json;

    fn bars(closes: &[f64]) -> Vec<Bar> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).expect("date");
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let dt = start + Duration::days(i as i64);
                Bar {
                    symbol: "AAA".into(),
                    dt,
                    open: *c,
                    high: *c,
                    low: *c,
                    close: *c,
                    volume: 1.0,
                    available_at: daily_close(dt),
                    source: "test".into(),
                }
            })
            .collect()
    }

    #[test]
    fn crossover_program_evaluates_with_warmup() {
        let doc = json!({
            "dsl_version": "signal_dsl_v1",
            "signals": {"entry": "up", "exit": "down"},
            "expressions": {
                "fast": {"op": "sma", "of": {"op": "col", "field": "close"}, "window": 2},
                "up": {"op": "gt", "left": {"op": "col", "field": "close"}, "right": {"op": "ref", "name": "fast"}},
                "down": {"op": "not", "of": {"op": "ref", "name": "up"}}
            }
        });
        let program = SignalProgram::parse(&doc).expect("parse");
        let (entry, exit) = program.signals(&bars(&[1.0, 2.0, 1.0, 3.0])).expect("signals");
        assert_eq!(entry, vec![false, true, false, true]);
        // warm-up bar stays undefined for both signals
        assert_eq!(exit, vec![false, false, true, false]);
    }

    #[test]
    fn params_bind_windows_and_thresholds() {
        let doc = |window: u64| {
            json!({
                "signals": {"entry": "up", "exit": "down"},
                "params": {"window": window, "floor": 1.5},
                "expressions": {
                    "ma": {"op": "sma", "of": {"op": "col", "field": "close"}, "window": {"param": "window"}},
                    "up": {"op": "and",
                           "left": {"op": "gt", "left": {"op": "col", "field": "close"}, "right": {"op": "ref", "name": "ma"}},
                           "right": {"op": "gt", "left": {"op": "col", "field": "close"}, "right": {"op": "param", "name": "floor"}}},
                    "down": {"op": "not", "of": {"op": "ref", "name": "up"}}
                }
            })
        };
        let closes = [1.0, 2.0, 1.0, 3.0];
        let (short, _) = SignalProgram::parse(&doc(2)).expect("parse").signals(&bars(&closes)).expect("signals");
        let (long, _) = SignalProgram::parse(&doc(3)).expect("parse").signals(&bars(&closes)).expect("signals");
        assert_eq!(short, vec![false, true, false, true]);
        assert_eq!(long, vec![false, false, false, true]);

        let mut missing = doc(2);
        missing["params"] = json!({});
        let err = SignalProgram::parse(&missing).expect_err("unbound");
        assert!(err.to_string().contains("unknown param 'window'"), "unexpected: {}", err);
    }

    #[test]
    fn self_reference_is_rejected() {
        let doc = json!({
            "signals": {"entry": "a", "exit": "a"},
            "expressions": {"a": {"op": "ref", "name": "a"}}
        });
        let program = SignalProgram::parse(&doc).expect("parse");
        let err = program.signals(&bars(&[1.0])).expect_err("cycle");
        assert!(err.to_string().contains("nest too deep"));
    }

    #[test]
    fn unknown_ops_and_fields_fail_to_parse() {
        assert!(Expr::parse(&json!({"op": "python", "code": "1"})).is_err());
        assert!(Expr::parse(&json!({"op": "col", "field": "holdout"})).is_err());
        assert!(Expr::parse(&json!({"op": "sma", "of": {"op": "const", "value": 1}, "window": 0})).is_err());
    }
}
