//! Everything the process is able to offer to formulas. Allow-lists select
//! from this catalogue; a name the host does not provide can never be allowed.

use crate::formula::Limits;
use crate::value::{Fault, Number, Value};

mod builtins;
mod modules;

pub type NativeFn = fn(Args, &Limits) -> Result<Value, Fault>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallableKind {
    Function,
    Type,
}

/// Number of arguments a callable accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: Option<usize>,
}

impl Arity {
    pub const fn exactly(n: usize) -> Self {
        Self {
            min: n,
            max: Some(n),
        }
    }

    pub const fn range(min: usize, max: usize) -> Self {
        Self {
            min,
            max: Some(max),
        }
    }

    pub const fn at_least(min: usize) -> Self {
        Self { min, max: None }
    }

    pub fn accepts(&self, given: usize) -> bool {
        given >= self.min && self.max.map_or(true, |max| given <= max)
    }
}

impl std::fmt::Display for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let plural = |n: usize| if n == 1 { "argument" } else { "arguments" };
        match self.max {
            Some(max) if max == self.min => write!(f, "exactly {} {}", max, plural(max)),
            Some(max) => write!(f, "{} to {} arguments", self.min, max),
            None => write!(f, "at least {} {}", self.min, plural(self.min)),
        }
    }
}

/// Natively implemented function or type converter.
#[derive(Debug, Clone, Copy)]
pub struct Callable {
    pub name: &'static str,
    pub kind: CallableKind,
    pub arity: Arity,
    pub func: NativeFn,
}

impl Callable {
    pub fn call(&self, values: &[Value], limits: &Limits) -> Result<Value, Fault> {
        if !self.arity.accepts(values.len()) {
            return Err(Fault::call(
                self.name,
                format!("takes {} ({} given)", self.arity, values.len()),
            ));
        }
        (self.func)(
            Args {
                name: self.name,
                values,
            },
            limits,
        )
    }
}

#[derive(Debug)]
pub enum Member {
    Function(Callable),
    Constant(Value),
}

#[derive(Debug)]
pub struct Module {
    pub name: &'static str,
    pub members: &'static [(&'static str, Member)],
}

impl Module {
    pub fn member(&self, name: &str) -> Option<&'static Member> {
        self.members
            .iter()
            .find(|(member, _)| *member == name)
            .map(|(_, member)| member)
    }
}

const fn function(name: &'static str, arity: Arity, func: NativeFn) -> Callable {
    Callable {
        name,
        kind: CallableKind::Function,
        arity,
        func,
    }
}

const fn ty(name: &'static str, arity: Arity, func: NativeFn) -> Callable {
    Callable {
        name,
        kind: CallableKind::Type,
        arity,
        func,
    }
}

/// Look up a builtin callable or type by name.
pub fn builtin(name: &str) -> Option<&'static Callable> {
    builtins::BUILTINS.iter().find(|callable| callable.name == name)
}

/// Look up a module by name.
pub fn module(name: &str) -> Option<&'static Module> {
    modules::MODULES.iter().copied().find(|module| module.name == name)
}

/// Arguments of a native call, with typed accessors that produce call faults.
#[derive(Clone, Copy)]
pub struct Args<'a> {
    name: &'static str,
    values: &'a [Value],
}

impl<'a> Args<'a> {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn all(&self) -> &'a [Value] {
        self.values
    }

    pub fn get(&self, i: usize) -> &'a Value {
        let values: &'a [Value] = self.values;
        &values[i]
    }

    pub fn opt(&self, i: usize) -> Option<&'a Value> {
        let values: &'a [Value] = self.values;
        values.get(i).filter(|v| !v.is_null())
    }

    pub fn fault(&self, message: impl Into<String>) -> Fault {
        Fault::call(self.name, message)
    }

    fn wrong_type(&self, i: usize, expected: &str) -> Fault {
        self.fault(format!(
            "argument {} must be {}, not '{}'",
            i + 1,
            expected,
            self.values[i].kind()
        ))
    }

    pub fn str(&self, i: usize) -> Result<&'a str, Fault> {
        match self.get(i) {
            Value::Str(s) => Ok(s),
            _ => Err(self.wrong_type(i, "str")),
        }
    }

    pub fn int(&self, i: usize) -> Result<i64, Fault> {
        match self.values[i].as_number() {
            Some(Number::Int(n)) => Ok(n),
            _ => Err(self.wrong_type(i, "int")),
        }
    }

    pub fn number(&self, i: usize) -> Result<Number, Fault> {
        self.values[i]
            .as_number()
            .ok_or_else(|| self.wrong_type(i, "a number"))
    }

    pub fn float(&self, i: usize) -> Result<f64, Fault> {
        self.number(i).map(|n| n.as_f64())
    }

    pub fn list(&self, i: usize) -> Result<&'a [Value], Fault> {
        match self.get(i) {
            Value::List(items) => Ok(items),
            _ => Err(self.wrong_type(i, "list")),
        }
    }
}

/// Finite float result, or a range fault naming the function.
pub(crate) fn finite(args: &Args, value: f64) -> Result<Value, Fault> {
    if value.is_finite() {
        Ok(Value::Float(value))
    } else {
        Err(args.fault("math range error"))
    }
}

/// Check a string about to be produced against the configured limit.
pub(crate) fn bounded_str(s: String, limits: &Limits) -> Result<Value, Fault> {
    if s.len() > limits.max_string_len {
        return Err(Fault::LimitExceeded {
            what: "string length",
            limit: limits.max_string_len,
        });
    }
    Ok(Value::Str(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_text() {
        assert_eq!(Arity::exactly(1).to_string(), "exactly 1 argument");
        assert_eq!(Arity::range(1, 2).to_string(), "1 to 2 arguments");
        assert_eq!(Arity::at_least(2).to_string(), "at least 2 arguments");
    }

    #[test]
    fn catalogue_lookups() {
        assert!(builtin("abs").is_some());
        assert_eq!(builtin("int").map(|c| c.kind), Some(CallableKind::Type));
        assert!(builtin("eval").is_none());
        assert!(builtin("__import__").is_none());

        let math = module("math").unwrap();
        assert!(matches!(math.member("sqrt"), Some(Member::Function(_))));
        assert!(matches!(math.member("pi"), Some(Member::Constant(Value::Float(_)))));
        assert!(math.member("system").is_none());
        assert!(module("os").is_some());
        assert!(module("subprocess").is_none());
    }

    #[test]
    fn call_checks_arity() {
        let abs = builtin("abs").unwrap();
        let err = abs.call(&[], &Limits::default()).unwrap_err();
        assert_eq!(err.to_string(), "abs() takes exactly 1 argument (0 given)");
    }
}
