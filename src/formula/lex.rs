use logos::Logos;

/// Lexical element of a formula.
#[derive(Debug, Logos, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n\f]+")]
pub enum FormulaLex {
    #[token("and", priority = 100)]
    And,

    #[token("or", priority = 100)]
    Or,

    #[token("not", priority = 100)]
    Not,

    #[token("if", priority = 100)]
    If,

    #[token("else", priority = 100)]
    Else,

    #[token("in", priority = 100)]
    In,

    #[token("True", priority = 100)]
    #[token("true", priority = 100)]
    True,

    #[token("False", priority = 100)]
    #[token("false", priority = 100)]
    False,

    #[token("None", priority = 100)]
    #[token("null", priority = 100)]
    None,

    #[regex("[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex("[0-9][0-9_]*", lex_int)]
    Int(i64),

    #[regex(r"[0-9][0-9_]*\.[0-9_]*([eE][+-]?[0-9]+)?", lex_float)]
    #[regex(r"\.[0-9][0-9_]*([eE][+-]?[0-9]+)?", lex_float)]
    #[regex(r"[0-9][0-9_]*[eE][+-]?[0-9]+", lex_float)]
    Float(f64),

    #[regex(r#""([^"\\]|\\.)*""#, lex_str)]
    #[regex(r#"'([^'\\]|\\.)*'"#, lex_str)]
    Str(String),

    #[token("+")]
    Plus,

    #[token("-")]
    Minus,

    #[token("*")]
    Star,

    #[token("**")]
    DoubleStar,

    #[token("/")]
    Slash,

    #[token("//")]
    DoubleSlash,

    #[token("%")]
    Percent,

    #[token("==")]
    Eq,

    #[token("!=")]
    NotEq,

    #[token("<")]
    Lt,

    #[token("<=")]
    LtEq,

    #[token(">")]
    Gt,

    #[token(">=")]
    GtEq,

    #[token("(")]
    OpenParen,

    #[token(")")]
    CloseParen,

    #[token("[")]
    OpenBracket,

    #[token("]")]
    CloseBracket,

    #[token(",")]
    Comma,

    #[token(".")]
    Dot,
}

/// Integer literal. Literals that do not fit into 64 bits are rejected by the lexer.
fn lex_int(lex: &mut logos::Lexer<FormulaLex>) -> Option<i64> {
    lex.slice().replace('_', "").parse().ok()
}

fn lex_float(lex: &mut logos::Lexer<FormulaLex>) -> Option<f64> {
    lex.slice().replace('_', "").parse().ok()
}

/// Unquote a string literal and apply escape sequences. Unknown escapes are kept verbatim.
fn lex_str(lex: &mut logos::Lexer<FormulaLex>) -> String {
    let slice = lex.slice();
    let unquoted = &slice[1..slice.len() - 1];

    let mut out = String::with_capacity(unquoted.len());
    let mut chars = unquoted.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

impl FormulaLex {
    /// How the token looks in source, for diagnostics.
    pub fn describe(&self) -> String {
        use FormulaLex::*;
        match self {
            And => "and".into(),
            Or => "or".into(),
            Not => "not".into(),
            If => "if".into(),
            Else => "else".into(),
            In => "in".into(),
            True => "True".into(),
            False => "False".into(),
            None => "None".into(),
            Ident(name) => name.clone(),
            Int(i) => i.to_string(),
            Float(f) => f.to_string(),
            Str(s) => format!("{s:?}"),
            Plus => "+".into(),
            Minus => "-".into(),
            Star => "*".into(),
            DoubleStar => "**".into(),
            Slash => "/".into(),
            DoubleSlash => "//".into(),
            Percent => "%".into(),
            Eq => "==".into(),
            NotEq => "!=".into(),
            Lt => "<".into(),
            LtEq => "<=".into(),
            Gt => ">".into(),
            GtEq => ">=".into(),
            OpenParen => "(".into(),
            CloseParen => ")".into(),
            OpenBracket => "[".into(),
            CloseBracket => "]".into(),
            Comma => ",".into(),
            Dot => ".".into(),
        }
    }
}
