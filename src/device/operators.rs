//! Operator map and constant evaluator.
//!
//! The map says how a logical operator is spelled on a backend. Operators
//! without a mapping can still be used when every argument is a constant: the
//! evaluator folds them before emission.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::models::enums::DatabaseType;
use crate::query_ast::ast::{BinaryOperator, UnaryOperator};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorMapping {
    Binary(BinaryOperator),
    Unary(UnaryOperator),
    /// Plain function call with the given SQL name.
    Function(String),
}

#[derive(Debug, Clone, Default)]
pub struct OperatorMap {
    map: HashMap<String, OperatorMapping>,
}

impl OperatorMap {
    pub fn get(&self, operator: &str) -> Option<&OperatorMapping> {
        self.map.get(operator)
    }

    pub fn insert(&mut self, operator: impl Into<String>, mapping: OperatorMapping) {
        self.map.insert(operator.into(), mapping);
    }

    pub fn remove(&mut self, operator: &str) -> Option<OperatorMapping> {
        self.map.remove(operator)
    }

    pub fn for_dialect(db_type: DatabaseType) -> Self {
        use BinaryOperator as B;
        let mut ops = Self::default();
        for (name, op) in [
            ("=", B::Equal),
            ("<>", B::NotEqual),
            ("<", B::Less),
            ("<=", B::LessOrEqual),
            (">", B::Greater),
            (">=", B::GreaterOrEqual),
            ("and", B::And),
            ("or", B::Or),
            ("like", B::Like),
            ("+", B::Add),
            ("-", B::Subtract),
            ("*", B::Multiply),
            ("/", B::Divide),
            ("%", B::Modulo),
            ("||", B::Concat),
        ] {
            ops.insert(name, OperatorMapping::Binary(op));
        }
        ops.insert("not", OperatorMapping::Unary(UnaryOperator::Not));
        ops.insert("neg", OperatorMapping::Unary(UnaryOperator::Negate));
        for (name, sql) in [("upper", "UPPER"), ("lower", "LOWER"), ("abs", "ABS"), ("round", "ROUND"), ("coalesce", "COALESCE")] {
            ops.insert(name, OperatorMapping::Function(sql.to_string()));
        }
        let length = match db_type {
            DatabaseType::MySQL => "CHAR_LENGTH",
            DatabaseType::MsSQL => "LEN",
            _ => "LENGTH",
        };
        ops.insert("length", OperatorMapping::Function(length.to_string()));
        // SQLite only has POWER when built with the math extension.
        if db_type != DatabaseType::SQLite {
            ops.insert("power", OperatorMapping::Function("POWER".to_string()));
        }
        ops
    }
}

/// Evaluates a deterministic operator over constant arguments.
pub trait ConstantEvaluator: Send + Sync {
    /// `None` when the operator is unknown or the arguments do not fit it.
    fn evaluate(&self, operator: &str, args: &[Value]) -> Option<Value>;

    fn is_deterministic(&self, _operator: &str) -> bool {
        true
    }
}

/// Folds the built-in operators.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicEvaluator;

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Dec(Decimal),
    Float(f64),
}

fn num(v: &Value) -> Option<Num> {
    match v {
        Value::Integer(i) => Some(Num::Int(*i)),
        Value::Decimal(d) => Some(Num::Dec(*d)),
        Value::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

fn as_f64(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Dec(d) => d.to_f64().unwrap_or(f64::NAN),
        Num::Float(f) => f,
    }
}

fn as_decimal(n: Num) -> Option<Decimal> {
    match n {
        Num::Int(i) => Some(Decimal::from(i)),
        Num::Dec(d) => Some(d),
        Num::Float(f) => Decimal::try_from(f).ok(),
    }
}

fn arithmetic(op: &str, a: Num, b: Num) -> Option<Value> {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => match op {
            "+" => x.checked_add(y).map(Value::Integer),
            "-" => x.checked_sub(y).map(Value::Integer),
            "*" => x.checked_mul(y).map(Value::Integer),
            "/" => x.checked_div(y).map(Value::Integer),
            "%" => x.checked_rem(y).map(Value::Integer),
            _ => None,
        },
        (Num::Float(_), _) | (_, Num::Float(_)) => {
            let (x, y) = (as_f64(a), as_f64(b));
            match op {
                "+" => Some(Value::Float(x + y)),
                "-" => Some(Value::Float(x - y)),
                "*" => Some(Value::Float(x * y)),
                "/" if y != 0.0 => Some(Value::Float(x / y)),
                _ => None,
            }
        }
        _ => {
            let (x, y) = (as_decimal(a)?, as_decimal(b)?);
            match op {
                "+" => x.checked_add(y).map(Value::Decimal),
                "-" => x.checked_sub(y).map(Value::Decimal),
                "*" => x.checked_mul(y).map(Value::Decimal),
                "/" => x.checked_div(y).map(Value::Decimal),
                "%" => x.checked_rem(y).map(Value::Decimal),
                _ => None,
            }
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Boolean(x), Value::Boolean(y)) => Some(x.cmp(y)),
        (Value::Date(x), Value::Date(y)) => Some(x.cmp(y)),
        (Value::DateTime(x), Value::DateTime(y)) => Some(x.cmp(y)),
        _ => {
            let (x, y) = (num(a)?, num(b)?);
            match (x, y) {
                (Num::Int(i), Num::Int(j)) => Some(i.cmp(&j)),
                (Num::Float(_), _) | (_, Num::Float(_)) => as_f64(x).partial_cmp(&as_f64(y)),
                _ => Some(as_decimal(x)?.cmp(&as_decimal(y)?)),
            }
        }
    }
}

impl ConstantEvaluator for BasicEvaluator {
    fn evaluate(&self, operator: &str, args: &[Value]) -> Option<Value> {
        use std::cmp::Ordering;
        match (operator, args) {
            ("and", [a, b]) => match (a.as_bool(), b.as_bool()) {
                (Some(false), _) | (_, Some(false)) => Some(Value::Boolean(false)),
                (Some(true), Some(true)) => Some(Value::Boolean(true)),
                _ => Some(Value::Null),
            },
            ("or", [a, b]) => match (a.as_bool(), b.as_bool()) {
                (Some(true), _) | (_, Some(true)) => Some(Value::Boolean(true)),
                (Some(false), Some(false)) => Some(Value::Boolean(false)),
                _ => Some(Value::Null),
            },
            ("not", [a]) => Some(a.as_bool().map(|b| Value::Boolean(!b)).unwrap_or(Value::Null)),
            ("coalesce", args) => Some(args.iter().find(|a| !a.is_null()).cloned().unwrap_or(Value::Null)),
            (_, args) if args.iter().any(Value::is_null) => Some(Value::Null),
            ("=" | "<>" | "<" | "<=" | ">" | ">=", [a, b]) => {
                let ord = compare(a, b)?;
                let result = match operator {
                    "=" => ord == Ordering::Equal,
                    "<>" => ord != Ordering::Equal,
                    "<" => ord == Ordering::Less,
                    "<=" => ord != Ordering::Greater,
                    ">" => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                };
                Some(Value::Boolean(result))
            }
            ("+" | "-" | "*" | "/" | "%", [a, b]) => arithmetic(operator, num(a)?, num(b)?),
            ("neg", [a]) => match num(a)? {
                Num::Int(i) => i.checked_neg().map(Value::Integer),
                Num::Dec(d) => Some(Value::Decimal(-d)),
                Num::Float(f) => Some(Value::Float(-f)),
            },
            ("abs", [a]) => match num(a)? {
                Num::Int(i) => i.checked_abs().map(Value::Integer),
                Num::Dec(d) => Some(Value::Decimal(d.abs())),
                Num::Float(f) => Some(Value::Float(f.abs())),
            },
            ("power", [a, b]) => Some(Value::Float(as_f64(num(a)?).powf(as_f64(num(b)?)))),
            ("||", [Value::String(a), Value::String(b)]) => Some(Value::String(format!("{}{}", a, b))),
            ("upper", [Value::String(s)]) => Some(Value::String(s.to_uppercase())),
            ("lower", [Value::String(s)]) => Some(Value::String(s.to_lowercase())),
            ("length", [Value::String(s)]) => Some(Value::Integer(s.chars().count() as i64)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_mixed_arithmetic() {
        let e = BasicEvaluator;
        assert_eq!(e.evaluate("+", &[Value::Integer(2), Value::Integer(3)]), Some(Value::Integer(5)));
        assert_eq!(e.evaluate("*", &[Value::Integer(2), Value::Float(1.5)]), Some(Value::Float(3.0)));
        assert_eq!(e.evaluate("/", &[Value::Integer(1), Value::Integer(0)]), None);
        assert_eq!(e.evaluate("power", &[Value::Integer(2), Value::Integer(10)]), Some(Value::Float(1024.0)));
    }

    #[test]
    fn three_valued_logic() {
        let e = BasicEvaluator;
        assert_eq!(e.evaluate("and", &[Value::Null, Value::Boolean(false)]), Some(Value::Boolean(false)));
        assert_eq!(e.evaluate("or", &[Value::Null, Value::Boolean(false)]), Some(Value::Null));
        assert_eq!(e.evaluate(">", &[Value::Null, Value::Integer(1)]), Some(Value::Null));
    }

    #[test]
    fn sqlite_has_no_power_mapping() {
        assert!(OperatorMap::for_dialect(DatabaseType::SQLite).get("power").is_none());
        assert_eq!(
            OperatorMap::for_dialect(DatabaseType::MsSQL).get("length"),
            Some(&OperatorMapping::Function("LEN".into()))
        );
    }
}
