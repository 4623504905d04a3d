use std::cmp::Ordering;

use super::bind::Node;
use super::parse::{BinaryOp, LogicOp, UnaryOp};
use super::Limits;
use crate::record::Record;
use crate::value::{Fault, Number, Value, ValueKind};

pub(super) struct Evaluator<'a> {
    pub record: &'a Record,
    pub limits: &'a Limits,
}

impl Evaluator<'_> {
    pub fn eval(&self, node: &Node) -> Result<Value, Fault> {
        match node {
            Node::Literal(value) => Ok(value.clone()),
            Node::Field(name) => self.field(name),
            Node::FieldAt(name) => match self.eval(name)? {
                Value::Str(name) => self.field(&name),
                other => Err(Fault::Value(format!(
                    "field names must be str, not '{}'",
                    other.kind()
                ))),
            },
            Node::Call { callable, args } => {
                let values = args.iter().map(|arg| self.eval(arg)).collect::<Result<Vec<_>, _>>()?;
                callable.call(&values, self.limits)
            }
            Node::Index { base, index } => index_into(self.eval(base)?, self.eval(index)?),
            Node::List(items) => {
                let mut footprint = Footprint {
                    elements: items.len(),
                    bytes: 0,
                }
                .check(self.limits)?;
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    let value = self.eval(item)?;
                    footprint = footprint.plus(Footprint::of(&value)).check(self.limits)?;
                    values.push(value);
                }
                Ok(Value::List(values))
            }
            Node::Unary { op, operand } => unary(*op, self.eval(operand)?),
            Node::Binary { op, lhs, rhs } => binary(*op, self.eval(lhs)?, self.eval(rhs)?, self.limits),
            Node::Logic { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let short_circuit = match op {
                    LogicOp::And => !lhs.is_truthy(),
                    LogicOp::Or => lhs.is_truthy(),
                };
                if short_circuit {
                    Ok(lhs)
                } else {
                    self.eval(rhs)
                }
            }
            Node::Conditional {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond)?.is_truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
        }
    }

    fn field(&self, name: &str) -> Result<Value, Fault> {
        self.record
            .get(name)
            .cloned()
            .ok_or_else(|| Fault::MissingField(name.to_string()))
    }
}

fn string_limit(limits: &Limits) -> Fault {
    Fault::LimitExceeded {
        what: "string length",
        limit: limits.max_string_len,
    }
}

fn list_limit(limits: &Limits) -> Fault {
    Fault::LimitExceeded {
        what: "list length",
        limit: limits.max_list_len,
    }
}

/// Elements and string bytes held by a value, counting nested lists through.
/// A list is bounded as a whole: elements by `max_list_len`, text by `max_string_len`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Footprint {
    elements: usize,
    bytes: usize,
}

impl Footprint {
    fn of(value: &Value) -> Self {
        match value {
            Value::Str(s) => Self {
                elements: 0,
                bytes: s.len(),
            },
            Value::List(items) => items.iter().fold(
                Self {
                    elements: items.len(),
                    bytes: 0,
                },
                |total, item| total.plus(Self::of(item)),
            ),
            _ => Self::default(),
        }
    }

    fn plus(self, other: Self) -> Self {
        Self {
            elements: self.elements.saturating_add(other.elements),
            bytes: self.bytes.saturating_add(other.bytes),
        }
    }

    fn times(self, n: usize) -> Self {
        Self {
            elements: self.elements.saturating_mul(n),
            bytes: self.bytes.saturating_mul(n),
        }
    }

    fn check(self, limits: &Limits) -> Result<Self, Fault> {
        if self.elements > limits.max_list_len {
            Err(list_limit(limits))
        } else if self.bytes > limits.max_string_len {
            Err(string_limit(limits))
        } else {
            Ok(self)
        }
    }
}

fn index_into(base: Value, index: Value) -> Result<Value, Fault> {
    let Some(Number::Int(i)) = index.as_number().filter(|_| !matches!(index, Value::Bool(_))) else {
        return match base {
            Value::Str(_) | Value::List(_) => Err(Fault::IndexType(index.kind())),
            other => Err(Fault::NotSubscriptable(other.kind())),
        };
    };

    let kind = base.kind();
    let resolve = |len: usize| -> Result<usize, Fault> {
        let len = len as i64;
        let at = if i < 0 { i + len } else { i };
        if (0..len).contains(&at) {
            Ok(at as usize)
        } else {
            Err(Fault::IndexOutOfRange {
                container: kind,
                index: i,
            })
        }
    };

    match base {
        Value::Str(s) => {
            let at = resolve(s.chars().count())?;
            Ok(s.chars().nth(at).map(|c| Value::Str(c.to_string())).unwrap_or_default())
        }
        Value::List(mut items) => {
            let at = resolve(items.len())?;
            Ok(items.swap_remove(at))
        }
        other => Err(Fault::NotSubscriptable(other.kind())),
    }
}

fn unary(op: UnaryOp, operand: Value) -> Result<Value, Fault> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!operand.is_truthy())),
        UnaryOp::Neg => match operand.as_number() {
            Some(Number::Int(i)) => i.checked_neg().map(Value::Int).ok_or(Fault::Overflow("-")),
            Some(Number::Float(f)) => Ok(Value::Float(-f)),
            None => Err(Fault::UnaryType {
                op: "-",
                operand: operand.kind(),
            }),
        },
        UnaryOp::Pos => match operand.as_number() {
            Some(Number::Int(i)) => Ok(Value::Int(i)),
            Some(Number::Float(f)) => Ok(Value::Float(f)),
            None => Err(Fault::UnaryType {
                op: "+",
                operand: operand.kind(),
            }),
        },
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value, limits: &Limits) -> Result<Value, Fault> {
    use BinaryOp::*;

    match op {
        Eq => return Ok(Value::Bool(lhs.loose_eq(&rhs))),
        NotEq => return Ok(Value::Bool(!lhs.loose_eq(&rhs))),
        Lt | LtEq | Gt | GtEq => {
            let ordering = lhs.compare(&rhs, op.symbol())?;
            let holds = match (op, ordering) {
                (_, None) => false,
                (Lt, Some(o)) => o == Ordering::Less,
                (LtEq, Some(o)) => o != Ordering::Greater,
                (Gt, Some(o)) => o == Ordering::Greater,
                (_, Some(o)) => o != Ordering::Less,
            };
            return Ok(Value::Bool(holds));
        }
        In | NotIn => {
            let found = contains(&rhs, &lhs)?;
            return Ok(Value::Bool(found == (op == In)));
        }
        _ => {}
    }

    let mismatch = |lhs: &Value, rhs: &Value| Fault::OperandTypes {
        op: op.symbol(),
        lhs: lhs.kind(),
        rhs: rhs.kind(),
    };

    match (op, &lhs, &rhs) {
        (Add, Value::Str(a), Value::Str(b)) => {
            if a.len() + b.len() > limits.max_string_len {
                return Err(string_limit(limits));
            }
            return Ok(Value::Str(format!("{a}{b}")));
        }
        (Add, Value::List(a), Value::List(b)) => {
            Footprint::of(&lhs).plus(Footprint::of(&rhs)).check(limits)?;
            return Ok(Value::List(a.iter().chain(b).cloned().collect()));
        }
        (Mul, Value::Str(_) | Value::List(_), _) => {
            return repeat(&lhs, &rhs, limits).unwrap_or_else(|| Err(mismatch(&lhs, &rhs)));
        }
        (Mul, _, Value::Str(_) | Value::List(_)) => {
            return repeat(&rhs, &lhs, limits).unwrap_or_else(|| Err(mismatch(&lhs, &rhs)));
        }
        _ => {}
    }

    let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) else {
        return Err(mismatch(&lhs, &rhs));
    };
    match (a, b) {
        (Number::Int(a), Number::Int(b)) => int_arith(op, a, b),
        (a, b) => float_arith(op, a.as_f64(), b.as_f64()),
    }
}

/// `sequence * count`. `None` when the count is not an integer.
fn repeat(sequence: &Value, count: &Value, limits: &Limits) -> Option<Result<Value, Fault>> {
    let Some(Number::Int(n)) = count.as_number() else {
        return None;
    };
    let n = n.max(0) as usize;
    Some(match sequence {
        Value::Str(s) => {
            if s.len().saturating_mul(n) > limits.max_string_len {
                Err(string_limit(limits))
            } else {
                Ok(Value::Str(s.repeat(n)))
            }
        }
        Value::List(items) => Footprint::of(sequence).times(n).check(limits).map(|_| {
            let mut repeated = Vec::with_capacity(items.len() * n);
            for _ in 0..n {
                repeated.extend_from_slice(items);
            }
            Value::List(repeated)
        }),
        _ => return None,
    })
}

fn contains(container: &Value, item: &Value) -> Result<bool, Fault> {
    match (container, item) {
        (Value::Str(haystack), Value::Str(needle)) => Ok(haystack.contains(needle.as_str())),
        (Value::Str(_), other) => Err(Fault::Value(format!(
            "'in <string>' requires string as left operand, not {}",
            other.kind()
        ))),
        (Value::List(items), item) => Ok(items.iter().any(|candidate| candidate.loose_eq(item))),
        (other, _) => Err(Fault::Value(format!(
            "argument of type '{}' is not iterable",
            other.kind()
        ))),
    }
}

fn int_arith(op: BinaryOp, a: i64, b: i64) -> Result<Value, Fault> {
    use BinaryOp::*;

    let symbol = op.symbol();
    let checked = |result: Option<i64>| result.map(Value::Int).ok_or(Fault::Overflow(symbol));
    match op {
        Add => checked(a.checked_add(b)),
        Sub => checked(a.checked_sub(b)),
        Mul => checked(a.checked_mul(b)),
        Div => float_arith(op, a as f64, b as f64),
        FloorDiv | Mod if b == 0 => Err(Fault::DivisionByZero),
        FloorDiv => checked(floor_div(a, b)),
        Mod => checked(floor_mod(a, b)),
        Pow if b < 0 => {
            if a == 0 {
                return Err(Fault::DivisionByZero);
            }
            float_arith(op, a as f64, b as f64)
        }
        Pow => {
            let exponent = u32::try_from(b).map_err(|_| Fault::Overflow(symbol))?;
            checked(a.checked_pow(exponent))
        }
        _ => float_arith(op, a as f64, b as f64),
    }
}

/// Floor division, rounding toward negative infinity.
fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        q.checked_sub(1)
    } else {
        Some(q)
    }
}

/// Remainder with the sign of the divisor.
fn floor_mod(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(r + b)
    } else {
        Some(r)
    }
}

fn float_arith(op: BinaryOp, a: f64, b: f64) -> Result<Value, Fault> {
    use BinaryOp::*;

    let result = match op {
        Add => a + b,
        Sub => a - b,
        Mul => a * b,
        Div | FloorDiv | Mod if b == 0.0 => return Err(Fault::DivisionByZero),
        Div => a / b,
        FloorDiv => (a / b).floor(),
        Mod => {
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
                r + b
            } else {
                r
            }
        }
        Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(Fault::DivisionByZero);
            }
            let p = a.powf(b);
            if p.is_nan() && !a.is_nan() && !b.is_nan() {
                return Err(Fault::Value(
                    "negative number cannot be raised to a fractional power".to_string(),
                ));
            }
            p
        }
        _ => {
            return Err(Fault::OperandTypes {
                op: op.symbol(),
                lhs: ValueKind::Float,
                rhs: ValueKind::Float,
            })
        }
    };
    Ok(Value::Float(result))
}
