use std::collections::HashMap;
use std::f64::consts;

use lazy_regex::Lazy;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};

use super::{bounded_str, finite, function, Args, Arity, Member, Module};
use crate::formula::Limits;
use crate::value::{Fault, Number, Value};

pub(super) static MODULES: &[&Module] = &[&MATH, &STRING, &RE, &OS];

static MATH: Module = Module {
    name: "math",
    members: &[
        ("pi", Member::Constant(Value::Float(consts::PI))),
        ("e", Member::Constant(Value::Float(consts::E))),
        ("inf", Member::Constant(Value::Float(f64::INFINITY))),
        ("sqrt", Member::Function(function("math.sqrt", Arity::exactly(1), sqrt))),
        ("floor", Member::Function(function("math.floor", Arity::exactly(1), floor))),
        ("ceil", Member::Function(function("math.ceil", Arity::exactly(1), ceil))),
        ("exp", Member::Function(function("math.exp", Arity::exactly(1), exp))),
        ("log", Member::Function(function("math.log", Arity::range(1, 2), log))),
        ("log10", Member::Function(function("math.log10", Arity::exactly(1), log10))),
        ("pow", Member::Function(function("math.pow", Arity::exactly(2), pow))),
        ("sin", Member::Function(function("math.sin", Arity::exactly(1), sin))),
        ("cos", Member::Function(function("math.cos", Arity::exactly(1), cos))),
        ("tan", Member::Function(function("math.tan", Arity::exactly(1), tan))),
    ],
};

static STRING: Module = Module {
    name: "string",
    members: &[
        ("upper", Member::Function(function("string.upper", Arity::exactly(1), upper))),
        ("lower", Member::Function(function("string.lower", Arity::exactly(1), lower))),
        ("title", Member::Function(function("string.title", Arity::exactly(1), title))),
        ("strip", Member::Function(function("string.strip", Arity::range(1, 2), strip))),
        ("lstrip", Member::Function(function("string.lstrip", Arity::range(1, 2), lstrip))),
        ("rstrip", Member::Function(function("string.rstrip", Arity::range(1, 2), rstrip))),
        ("find", Member::Function(function("string.find", Arity::exactly(2), find))),
        ("split", Member::Function(function("string.split", Arity::range(1, 2), split))),
        ("join", Member::Function(function("string.join", Arity::exactly(2), join))),
        ("zfill", Member::Function(function("string.zfill", Arity::exactly(2), zfill))),
    ],
};

static RE: Module = Module {
    name: "re",
    members: &[
        ("match", Member::Function(function("re.match", Arity::exactly(2), re_match))),
        ("search", Member::Function(function("re.search", Arity::exactly(2), re_search))),
        ("sub", Member::Function(function("re.sub", Arity::exactly(3), re_sub))),
    ],
};

/// Present so that allow-lists have something dangerous to refuse. Nothing
/// here reaches the operating system, even when the module is allowed.
static OS: Module = Module {
    name: "os",
    members: &[
        ("system", Member::Function(function("os.system", Arity::exactly(1), denied))),
        ("getenv", Member::Function(function("os.getenv", Arity::range(1, 2), denied))),
    ],
};

fn sqrt(args: Args, _: &Limits) -> Result<Value, Fault> {
    let x = args.float(0)?;
    if x < 0.0 {
        return Err(args.fault("math domain error"));
    }
    finite(&args, x.sqrt())
}

fn to_integral(args: &Args, x: f64) -> Result<Value, Fault> {
    if !x.is_finite() {
        return Err(args.fault("cannot convert non-finite float to integer"));
    }
    if x < i64::MIN as f64 || x >= i64::MAX as f64 {
        return Err(Fault::Overflow("integral conversion"));
    }
    Ok(Value::Int(x as i64))
}

fn floor(args: Args, _: &Limits) -> Result<Value, Fault> {
    match args.number(0)? {
        Number::Int(i) => Ok(Value::Int(i)),
        Number::Float(f) => to_integral(&args, f.floor()),
    }
}

fn ceil(args: Args, _: &Limits) -> Result<Value, Fault> {
    match args.number(0)? {
        Number::Int(i) => Ok(Value::Int(i)),
        Number::Float(f) => to_integral(&args, f.ceil()),
    }
}

fn exp(args: Args, _: &Limits) -> Result<Value, Fault> {
    finite(&args, args.float(0)?.exp())
}

fn log(args: Args, _: &Limits) -> Result<Value, Fault> {
    let x = args.float(0)?;
    if x <= 0.0 {
        return Err(args.fault("math domain error"));
    }
    match args.opt(1) {
        None => finite(&args, x.ln()),
        Some(_) => {
            let base = args.float(1)?;
            if base <= 0.0 || base == 1.0 {
                return Err(args.fault("math domain error"));
            }
            finite(&args, x.ln() / base.ln())
        }
    }
}

fn log10(args: Args, _: &Limits) -> Result<Value, Fault> {
    let x = args.float(0)?;
    if x <= 0.0 {
        return Err(args.fault("math domain error"));
    }
    finite(&args, x.log10())
}

fn pow(args: Args, _: &Limits) -> Result<Value, Fault> {
    finite(&args, args.float(0)?.powf(args.float(1)?))
}

fn sin(args: Args, _: &Limits) -> Result<Value, Fault> {
    finite(&args, args.float(0)?.sin())
}

fn cos(args: Args, _: &Limits) -> Result<Value, Fault> {
    finite(&args, args.float(0)?.cos())
}

fn tan(args: Args, _: &Limits) -> Result<Value, Fault> {
    finite(&args, args.float(0)?.tan())
}

fn upper(args: Args, limits: &Limits) -> Result<Value, Fault> {
    bounded_str(args.str(0)?.to_uppercase(), limits)
}

fn lower(args: Args, limits: &Limits) -> Result<Value, Fault> {
    bounded_str(args.str(0)?.to_lowercase(), limits)
}

fn title(args: Args, limits: &Limits) -> Result<Value, Fault> {
    let mut out = String::with_capacity(args.str(0)?.len());
    let mut in_word = false;
    for c in args.str(0)?.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    bounded_str(out, limits)
}

/// Characters to strip: the optional second argument, or whitespace.
fn strip_with(args: &Args, f: fn(&str, &dyn Fn(char) -> bool) -> String) -> Result<Value, Fault> {
    let s = args.str(0)?;
    match args.opt(1) {
        None => Ok(Value::Str(f(s, &|c: char| c.is_whitespace()))),
        Some(_) => {
            let chars = args.str(1)?;
            Ok(Value::Str(f(s, &|c: char| chars.contains(c))))
        }
    }
}

fn strip(args: Args, _: &Limits) -> Result<Value, Fault> {
    strip_with(&args, |s, p| s.trim_matches(|c| p(c)).to_string())
}

fn lstrip(args: Args, _: &Limits) -> Result<Value, Fault> {
    strip_with(&args, |s, p| s.trim_start_matches(|c| p(c)).to_string())
}

fn rstrip(args: Args, _: &Limits) -> Result<Value, Fault> {
    strip_with(&args, |s, p| s.trim_end_matches(|c| p(c)).to_string())
}

fn find(args: Args, _: &Limits) -> Result<Value, Fault> {
    let (s, sub) = (args.str(0)?, args.str(1)?);
    let index = s
        .find(sub)
        .map(|byte| s[..byte].chars().count() as i64)
        .unwrap_or(-1);
    Ok(Value::Int(index))
}

fn split(args: Args, limits: &Limits) -> Result<Value, Fault> {
    let s = args.str(0)?;
    let parts: Vec<Value> = match args.opt(1) {
        None => s.split_whitespace().map(Value::from).collect(),
        Some(_) => {
            let sep = args.str(1)?;
            if sep.is_empty() {
                return Err(Fault::Value("empty separator".to_string()));
            }
            s.split(sep).map(Value::from).collect()
        }
    };
    if parts.len() > limits.max_list_len {
        return Err(Fault::LimitExceeded {
            what: "list length",
            limit: limits.max_list_len,
        });
    }
    Ok(Value::List(parts))
}

fn join(args: Args, limits: &Limits) -> Result<Value, Fault> {
    let sep = args.str(0)?;
    let items = args.list(1)?;
    let mut parts = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        match item {
            Value::Str(s) => parts.push(s.as_str()),
            other => {
                return Err(Fault::Value(format!(
                    "sequence item {i}: expected str instance, {} found",
                    other.kind()
                )));
            }
        }
    }
    bounded_str(parts.join(sep), limits)
}

fn zfill(args: Args, limits: &Limits) -> Result<Value, Fault> {
    let s = args.str(0)?;
    let width = args.int(1)?.max(0) as usize;
    if width > limits.max_string_len {
        return Err(Fault::LimitExceeded {
            what: "string length",
            limit: limits.max_string_len,
        });
    }
    let len = s.chars().count();
    if len >= width {
        return Ok(Value::Str(s.to_string()));
    }
    let (sign, digits) = match s.strip_prefix(['+', '-']) {
        Some(rest) => (&s[..1], rest),
        None => ("", s),
    };
    Ok(Value::Str(format!("{sign}{}{digits}", "0".repeat(width - len))))
}

/// Compiled patterns kept across calls. Cleared when full.
static PATTERNS: Lazy<Mutex<HashMap<String, Regex>>> = Lazy::new(Default::default);

const PATTERN_CACHE_SIZE: usize = 64;

fn compile_pattern(args: &Args) -> Result<Regex, Fault> {
    let source = args.str(0)?;
    if let Some(pattern) = PATTERNS.lock().get(source) {
        return Ok(pattern.clone());
    }

    let pattern = RegexBuilder::new(source)
        .size_limit(1 << 20)
        .build()
        .map_err(|e| args.fault(format!("invalid pattern: {e}")))?;

    let mut patterns = PATTERNS.lock();
    if patterns.len() >= PATTERN_CACHE_SIZE {
        log::debug!("pattern cache full, clearing {} entries", patterns.len());
        patterns.clear();
    }
    patterns.insert(source.to_string(), pattern.clone());
    Ok(pattern)
}

/// Translate a replacement template written with `\1`, `\g<1>` and `\g<name>`
/// group references into the `${1}` form of `regex`. A literal `$` stays literal.
fn replacement(args: &Args, template: &str) -> Result<String, Fault> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' => match chars.next() {
                Some(d @ '0'..='9') => {
                    let mut group = String::from(d);
                    if let Some(e) = chars.next_if(char::is_ascii_digit) {
                        group.push(e);
                    }
                    out.push_str(&format!("${{{group}}}"));
                }
                Some('g') => {
                    if chars.next() != Some('<') {
                        return Err(args.fault("missing < in group reference"));
                    }
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '>' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    let valid = !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_');
                    if !closed || !valid {
                        return Err(args.fault(format!("bad group reference <{name}>")));
                    }
                    out.push_str(&format!("${{{name}}}"));
                }
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => return Err(args.fault("bad escape (end of pattern)")),
            },
            other => out.push(other),
        }
    }
    Ok(out)
}

fn re_match(args: Args, _: &Limits) -> Result<Value, Fault> {
    let pattern = compile_pattern(&args)?;
    Ok(match pattern.find(args.str(1)?) {
        Some(m) if m.start() == 0 => Value::Str(m.as_str().to_string()),
        _ => Value::Null,
    })
}

fn re_search(args: Args, _: &Limits) -> Result<Value, Fault> {
    let pattern = compile_pattern(&args)?;
    Ok(pattern
        .find(args.str(1)?)
        .map(|m| Value::Str(m.as_str().to_string()))
        .unwrap_or(Value::Null))
}

fn re_sub(args: Args, limits: &Limits) -> Result<Value, Fault> {
    let pattern = compile_pattern(&args)?;
    let template = replacement(&args, args.str(1)?)?;
    let replaced = pattern.replace_all(args.str(2)?, template.as_str());
    bounded_str(replaced.into_owned(), limits)
}

fn denied(args: Args, _: &Limits) -> Result<Value, Fault> {
    Err(Fault::NotPermitted(format!(
        "{}() is not available to formulas",
        args.name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::module;

    fn call(module_name: &str, member: &str, args: &[Value]) -> Result<Value, Fault> {
        match module(module_name).unwrap().member(member) {
            Some(Member::Function(f)) => f.call(args, &Limits::default()),
            other => panic!("{module_name}.{member} is not a function: {other:?}"),
        }
    }

    #[test]
    fn math_domain_errors_are_faults() {
        assert_eq!(call("math", "sqrt", &[Value::Int(9)]), Ok(Value::Float(3.0)));
        assert!(call("math", "sqrt", &[Value::Int(-1)]).is_err());
        assert!(call("math", "log", &[Value::Int(0)]).is_err());
        assert!(call("math", "exp", &[Value::Int(10_000)]).is_err());
        assert_eq!(call("math", "floor", &[Value::Float(-1.5)]), Ok(Value::Int(-2)));
    }

    #[test]
    fn string_helpers() {
        assert_eq!(call("string", "title", &["hello wORLD".into()]), Ok("Hello World".into()));
        assert_eq!(call("string", "zfill", &["-42".into(), Value::Int(5)]), Ok("-0042".into()));
        assert_eq!(call("string", "find", &["héllo".into(), "l".into()]), Ok(Value::Int(2)));
        assert_eq!(
            call("string", "split", &["a,b".into(), ",".into()]),
            Ok(Value::List(vec!["a".into(), "b".into()]))
        );
        assert_eq!(
            call("string", "strip", &["xxhixx".into(), "x".into()]),
            Ok("hi".into())
        );
    }

    #[test]
    fn string_case_results_are_bounded() {
        let small = Limits {
            max_string_len: 4,
            max_list_len: 4,
        };
        for member in ["upper", "title"] {
            let Some(Member::Function(f)) = module("string").unwrap().member(member) else {
                panic!("string.{member} is not a function");
            };
            assert!(
                matches!(f.call(&["ŉŉ".into()], &small), Err(Fault::LimitExceeded { .. })),
                "string.{member}"
            );
        }
    }

    #[test]
    fn regex_members() {
        assert_eq!(call("re", "match", &["[a-z]+".into(), "abc1".into()]), Ok("abc".into()));
        assert_eq!(call("re", "match", &["[0-9]+".into(), "abc1".into()]), Ok(Value::Null));
        assert_eq!(call("re", "search", &["[0-9]+".into(), "abc12".into()]), Ok("12".into()));
        assert_eq!(
            call("re", "sub", &["[0-9]".into(), "#".into(), "a1b2".into()]),
            Ok("a#b#".into())
        );
        assert!(call("re", "search", &["(".into(), "x".into()]).is_err());
    }

    #[test]
    fn substitution_uses_backslash_group_references() {
        let sub = |pattern: &str, template: &str, text: &str| {
            call("re", "sub", &[pattern.into(), template.into(), text.into()])
        };
        assert_eq!(sub("([a-z])([0-9])", "\\2\\1", "a1b2"), Ok("1a2b".into()));
        assert_eq!(sub("(?P<d>[0-9])", "<\\g<d>>", "a1"), Ok("a<1>".into()));
        assert_eq!(sub("([0-9])", "\\g<1>0", "a1"), Ok("a10".into()));
        assert_eq!(sub("[0-9]", "$1", "a1"), Ok("a$1".into()));
        assert_eq!(sub("[0-9]", "\\\\", "a1"), Ok("a\\".into()));
        assert!(sub("([0-9])", "\\g<1", "a1").is_err());
        assert!(sub("([0-9])", "x\\", "a1").is_err());
    }

    #[test]
    fn patterns_are_compiled_once() {
        let pattern = "[a-c]+x{2}";
        assert_eq!(call("re", "search", &[pattern.into(), "zabxx".into()]), Ok("abxx".into()));
        assert!(PATTERNS.lock().contains_key(pattern));
        assert_eq!(call("re", "match", &[pattern.into(), "cxx".into()]), Ok("cxx".into()));
    }

    #[test]
    fn os_never_runs_anything() {
        let err = call("os", "system", &["rm -rf /".into()]).unwrap_err();
        assert!(matches!(err, Fault::NotPermitted(_)));
    }
}
