use std::cmp::Ordering;

use super::{bounded_str, function, ty, Args, Arity, Callable};
use crate::formula::Limits;
use crate::value::{Fault, Number, Value};

pub(super) static BUILTINS: &[Callable] = &[
    function("abs", Arity::exactly(1), abs),
    function("len", Arity::exactly(1), len),
    function("min", Arity::at_least(1), min),
    function("max", Arity::at_least(1), max),
    function("round", Arity::range(1, 2), round),
    function("sum", Arity::range(1, 2), sum),
    function("upper", Arity::exactly(1), upper),
    function("lower", Arity::exactly(1), lower),
    function("strip", Arity::exactly(1), strip),
    function("startswith", Arity::exactly(2), startswith),
    function("endswith", Arity::exactly(2), endswith),
    function("replace", Arity::exactly(3), replace),
    function("isnull", Arity::exactly(1), isnull),
    function("coalesce", Arity::at_least(1), coalesce),
    ty("str", Arity::exactly(1), to_str),
    ty("int", Arity::exactly(1), to_int),
    ty("float", Arity::exactly(1), to_float),
    ty("bool", Arity::exactly(1), to_bool),
    ty("list", Arity::exactly(1), to_list),
];

fn abs(args: Args, _: &Limits) -> Result<Value, Fault> {
    match args.number(0)? {
        Number::Int(i) => i.checked_abs().map(Value::Int).ok_or(Fault::Overflow("abs")),
        Number::Float(f) => Ok(Value::Float(f.abs())),
    }
}

fn len(args: Args, _: &Limits) -> Result<Value, Fault> {
    let n = match args.get(0) {
        Value::Str(s) => s.chars().count(),
        Value::List(items) => items.len(),
        other => {
            return Err(args.fault(format!("object of type '{}' has no len()", other.kind())));
        }
    };
    Ok(Value::Int(n as i64))
}

/// Items to pick the extreme from: a single list argument, or all arguments.
fn candidates<'a>(args: &Args<'a>) -> Result<&'a [Value], Fault> {
    let items = if args.len() == 1 {
        args.list(0)?
    } else {
        args.all()
    };
    if items.is_empty() {
        return Err(args.fault("arg is an empty sequence"));
    }
    Ok(items)
}

fn extreme(args: Args, wanted: Ordering, op: &'static str) -> Result<Value, Fault> {
    let items = candidates(&args)?;
    let mut best = &items[0];
    for item in &items[1..] {
        if item.compare(best, op)? == Some(wanted) {
            best = item;
        }
    }
    Ok(best.clone())
}

fn min(args: Args, _: &Limits) -> Result<Value, Fault> {
    extreme(args, Ordering::Less, "min()")
}

fn max(args: Args, _: &Limits) -> Result<Value, Fault> {
    extreme(args, Ordering::Greater, "max()")
}

fn round(args: Args, _: &Limits) -> Result<Value, Fault> {
    let digits = match args.opt(1) {
        Some(_) => Some(args.int(1)?),
        None => None,
    };
    match (args.number(0)?, digits) {
        (Number::Int(i), None) => Ok(Value::Int(i)),
        (Number::Int(i), Some(d)) if d >= 0 => Ok(Value::Int(i)),
        (Number::Int(i), Some(d)) => {
            let scale = 10f64.powi(d.clamp(-30, 0).unsigned_abs() as i32);
            Ok(Value::Int(((i as f64 / scale).round_ties_even() * scale) as i64))
        }
        (Number::Float(f), None) => {
            if !f.is_finite() {
                return Err(args.fault("cannot convert non-finite float to integer"));
            }
            let rounded = f.round_ties_even();
            if rounded < i64::MIN as f64 || rounded >= i64::MAX as f64 {
                return Err(Fault::Overflow("round"));
            }
            Ok(Value::Int(rounded as i64))
        }
        (Number::Float(f), Some(d)) => {
            let scale = 10f64.powi(d.clamp(-308, 308) as i32);
            let rounded = (f * scale).round_ties_even() / scale;
            Ok(Value::Float(if rounded.is_finite() { rounded } else { f }))
        }
    }
}

fn sum(args: Args, _: &Limits) -> Result<Value, Fault> {
    let mut total = match args.opt(1) {
        Some(_) => args.number(1)?,
        None => Number::Int(0),
    };
    for item in args.list(0)? {
        let n = item
            .as_number()
            .ok_or_else(|| args.fault(format!("unsupported item type '{}'", item.kind())))?;
        total = match (total, n) {
            (Number::Int(a), Number::Int(b)) => {
                Number::Int(a.checked_add(b).ok_or(Fault::Overflow("sum"))?)
            }
            (a, b) => Number::Float(a.as_f64() + b.as_f64()),
        };
    }
    Ok(match total {
        Number::Int(i) => Value::Int(i),
        Number::Float(f) => Value::Float(f),
    })
}

fn upper(args: Args, limits: &Limits) -> Result<Value, Fault> {
    bounded_str(args.str(0)?.to_uppercase(), limits)
}

fn lower(args: Args, limits: &Limits) -> Result<Value, Fault> {
    bounded_str(args.str(0)?.to_lowercase(), limits)
}

fn strip(args: Args, _: &Limits) -> Result<Value, Fault> {
    Ok(Value::Str(args.str(0)?.trim().to_string()))
}

fn startswith(args: Args, _: &Limits) -> Result<Value, Fault> {
    Ok(Value::Bool(args.str(0)?.starts_with(args.str(1)?)))
}

fn endswith(args: Args, _: &Limits) -> Result<Value, Fault> {
    Ok(Value::Bool(args.str(0)?.ends_with(args.str(1)?)))
}

fn replace(args: Args, limits: &Limits) -> Result<Value, Fault> {
    let (s, old, new) = (args.str(0)?, args.str(1)?, args.str(2)?);
    let count = if old.is_empty() {
        s.chars().count() + 1
    } else {
        s.matches(old).count()
    };
    let projected = s.len() + count.saturating_mul(new.len());
    if projected > limits.max_string_len {
        return Err(Fault::LimitExceeded {
            what: "string length",
            limit: limits.max_string_len,
        });
    }
    Ok(Value::Str(s.replace(old, new)))
}

fn isnull(args: Args, _: &Limits) -> Result<Value, Fault> {
    Ok(Value::Bool(args.get(0).is_null()))
}

fn coalesce(args: Args, _: &Limits) -> Result<Value, Fault> {
    Ok(args
        .all()
        .iter()
        .find(|v| !v.is_null())
        .cloned()
        .unwrap_or(Value::Null))
}

fn to_str(args: Args, limits: &Limits) -> Result<Value, Fault> {
    bounded_str(args.get(0).to_text(), limits)
}

fn to_int(args: Args, _: &Limits) -> Result<Value, Fault> {
    match args.get(0) {
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(f) => {
            if !f.is_finite() {
                return Err(args.fault("cannot convert non-finite float to integer"));
            }
            let truncated = f.trunc();
            if truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 {
                return Err(Fault::Overflow("int"));
            }
            Ok(Value::Int(truncated as i64))
        }
        Value::Str(s) => s
            .trim()
            .replace('_', "")
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| Fault::Value(format!("invalid literal for int() with base 10: '{s}'"))),
        other => Err(args.fault(format!(
            "argument must be a string or a number, not '{}'",
            other.kind()
        ))),
    }
}

fn to_float(args: Args, _: &Limits) -> Result<Value, Fault> {
    match args.get(0) {
        Value::Str(s) => {
            let trimmed = s.trim();
            let parsed = match trimmed.to_ascii_lowercase().as_str() {
                "inf" | "+inf" | "infinity" | "+infinity" => Some(f64::INFINITY),
                "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
                "nan" | "+nan" | "-nan" => Some(f64::NAN),
                _ => trimmed.parse::<f64>().ok(),
            };
            parsed
                .map(Value::Float)
                .ok_or_else(|| Fault::Value(format!("could not convert string to float: '{s}'")))
        }
        other => match other.as_number() {
            Some(n) => Ok(Value::Float(n.as_f64())),
            None => Err(args.fault(format!(
                "argument must be a string or a number, not '{}'",
                other.kind()
            ))),
        },
    }
}

fn to_bool(args: Args, _: &Limits) -> Result<Value, Fault> {
    Ok(Value::Bool(args.get(0).is_truthy()))
}

fn to_list(args: Args, limits: &Limits) -> Result<Value, Fault> {
    match args.get(0) {
        Value::List(items) => Ok(Value::List(items.clone())),
        Value::Str(s) => {
            if s.chars().count() > limits.max_list_len {
                return Err(Fault::LimitExceeded {
                    what: "list length",
                    limit: limits.max_list_len,
                });
            }
            Ok(Value::List(s.chars().map(|c| Value::Str(c.to_string())).collect()))
        }
        other => Err(args.fault(format!("'{}' object is not iterable", other.kind()))),
    }
}
