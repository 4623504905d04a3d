use logos::Logos;

use super::lex::FormulaLex;
use crate::span::{Span, Spanned};
use crate::value::Value;

/// Iterator over lexical elements.
type LexIter<'a> = logos::SpannedIter<'a, FormulaLex>;

/// Deepest nesting of sub-expressions the parser accepts.
const MAX_DEPTH: usize = 128;

/// Parsed formula, before any name was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    Literal(Value),

    /// Bare identifier. Whether it names a field, a function or a module is
    /// decided by the binder from the position it appears in.
    Name(String),

    /// `base.name`, where base should name a module.
    Member {
        base: Box<Spanned<Ast>>,
        name: Spanned<String>,
    },

    Call {
        callee: Box<Spanned<Ast>>,
        args: Vec<Spanned<Ast>>,
    },

    Index {
        base: Box<Spanned<Ast>>,
        index: Box<Spanned<Ast>>,
    },

    List(Vec<Spanned<Ast>>),

    Unary {
        op: UnaryOp,
        operand: Box<Spanned<Ast>>,
    },

    Binary {
        op: BinaryOp,
        lhs: Box<Spanned<Ast>>,
        rhs: Box<Spanned<Ast>>,
    },

    /// Short-circuiting `and`/`or`.
    Logic {
        op: LogicOp,
        lhs: Box<Spanned<Ast>>,
        rhs: Box<Spanned<Ast>>,
    },

    /// `then if cond else otherwise`
    Conditional {
        cond: Box<Spanned<Ast>>,
        then: Box<Spanned<Ast>>,
        otherwise: Box<Spanned<Ast>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    NotIn,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        use BinaryOp::*;
        match self {
            Add => "+",
            Sub => "-",
            Mul => "*",
            Div => "/",
            FloorDiv => "//",
            Mod => "%",
            Pow => "**",
            Eq => "==",
            NotEq => "!=",
            Lt => "<",
            LtEq => "<=",
            Gt => ">",
            GtEq => ">=",
            In => "in",
            NotIn => "not in",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyntaxError {
    #[error("formula is empty")]
    Empty,

    #[error("unrecognized token `{0}`")]
    UnknownToken(String),

    #[error("unexpected end of formula, expected {0}")]
    UnexpectedEnd(&'static str),

    #[error("expected {expected}, found `{found}`")]
    Expected {
        expected: &'static str,
        found: String,
    },

    #[error("formula is nested too deeply")]
    TooDeep,
}

type ParseResult<T> = Result<T, Spanned<SyntaxError>>;

/// Parse the formula text into a syntax tree.
pub fn parse(formula: &str) -> ParseResult<Spanned<Ast>> {
    let mut parser = Parser {
        tokens: FormulaLex::lexer(formula).spanned(),
        end: Span::from(formula.len()..formula.len()),
        depth: 0,
    };

    if parser.peek()?.is_none() {
        return Err(Span::NONE.with(SyntaxError::Empty));
    }

    let ast = parser.expression()?;
    match parser.next()? {
        None => Ok(ast),
        Some(token) => {
            let (token, span) = token.split();
            Err(span.with(SyntaxError::Expected {
                expected: "end of formula",
                found: token.describe(),
            }))
        }
    }
}

struct Parser<'f> {
    tokens: LexIter<'f>,
    end: Span,
    depth: usize,
}

impl<'f> Parser<'f> {
    /// Take the next token, failing on anything the lexer could not recognize.
    fn next(&mut self) -> ParseResult<Option<Spanned<FormulaLex>>> {
        match self.tokens.next() {
            None => Ok(None),
            Some((Ok(token), range)) => Ok(Some(Span::from(range).with(token))),
            Some((Err(()), range)) => {
                let slice = self.tokens.slice().to_owned();
                Err(Span::from(range).with(SyntaxError::UnknownToken(slice)))
            }
        }
    }

    /// Look at the next token without consuming it.
    fn peek(&mut self) -> ParseResult<Option<FormulaLex>> {
        let backup = self.tokens.clone();
        let next = self.next();
        self.tokens = backup;
        next.map(|t| t.map(Spanned::into_inner))
    }

    /// Check if next token is the given one. If so, advance the iterator and return its [Span].
    fn probe(&mut self, expected: &FormulaLex) -> Option<Span> {
        let backup = self.tokens.clone();

        if let Some((Ok(next), range)) = self.tokens.next() {
            if next == *expected {
                return Some(Span::from(range));
            }
        }

        self.tokens = backup;
        None
    }

    /// Expect the next token to be the given one.
    fn expect(&mut self, expected: &FormulaLex, what: &'static str) -> ParseResult<Span> {
        match self.next()? {
            Some(token) if *token == *expected => Ok(token.span()),
            Some(token) => {
                let (token, span) = token.split();
                Err(span.with(SyntaxError::Expected {
                    expected: what,
                    found: token.describe(),
                }))
            }
            None => Err(self.end.with(SyntaxError::UnexpectedEnd(what))),
        }
    }

    /// Track nesting, so hostile input cannot exhaust the stack.
    fn nested<T>(&mut self, span: Span, f: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        if self.depth >= MAX_DEPTH {
            return Err(span.with(SyntaxError::TooDeep));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    /// Left-associative chains deepen the tree without recursing, so they count too.
    fn link(&self, links: &mut usize, span: Span) -> ParseResult<()> {
        *links += 1;
        if self.depth + *links > MAX_DEPTH {
            return Err(span.with(SyntaxError::TooDeep));
        }
        Ok(())
    }

    /// `or_expr ['if' or_expr 'else' expression]`
    fn expression(&mut self) -> ParseResult<Spanned<Ast>> {
        let start = self.end;
        self.nested(start, |p| {
            let then = p.or_expr()?;
            if p.probe(&FormulaLex::If).is_none() {
                return Ok(then);
            }
            let cond = p.or_expr()?;
            p.expect(&FormulaLex::Else, "`else`")?;
            let otherwise = p.expression()?;
            let span = then.span().combine(&otherwise.span());
            Ok(span.with(Ast::Conditional {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            }))
        })
    }

    fn or_expr(&mut self) -> ParseResult<Spanned<Ast>> {
        let mut lhs = self.and_expr()?;
        let mut links = 0;
        while let Some(op_t) = self.probe(&FormulaLex::Or) {
            self.link(&mut links, op_t)?;
            let rhs = self.and_expr()?;
            lhs = logic(LogicOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> ParseResult<Spanned<Ast>> {
        let mut lhs = self.not_expr()?;
        let mut links = 0;
        while let Some(op_t) = self.probe(&FormulaLex::And) {
            self.link(&mut links, op_t)?;
            let rhs = self.not_expr()?;
            lhs = logic(LogicOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> ParseResult<Spanned<Ast>> {
        if let Some(not_t) = self.probe(&FormulaLex::Not) {
            let operand = self.nested(not_t, Self::not_expr)?;
            return Ok(unary(UnaryOp::Not, not_t, operand));
        }
        self.comparison()
    }

    /// Comparisons do not chain: `a < b < c` is a syntax error.
    fn comparison(&mut self) -> ParseResult<Spanned<Ast>> {
        use FormulaLex as L;

        let lhs = self.additive()?;
        let op = match self.peek()? {
            Some(L::Eq) => BinaryOp::Eq,
            Some(L::NotEq) => BinaryOp::NotEq,
            Some(L::Lt) => BinaryOp::Lt,
            Some(L::LtEq) => BinaryOp::LtEq,
            Some(L::Gt) => BinaryOp::Gt,
            Some(L::GtEq) => BinaryOp::GtEq,
            Some(L::In) => BinaryOp::In,
            Some(L::Not) => {
                self.next()?;
                self.expect(&L::In, "`in` after `not`")?;
                let rhs = self.additive()?;
                return Ok(binary(BinaryOp::NotIn, lhs, rhs));
            }
            _ => return Ok(lhs),
        };
        self.next()?;
        let rhs = self.additive()?;
        Ok(binary(op, lhs, rhs))
    }

    fn additive(&mut self) -> ParseResult<Spanned<Ast>> {
        let mut lhs = self.multiplicative()?;
        let mut links = 0;
        loop {
            let op = match self.peek()? {
                Some(FormulaLex::Plus) => BinaryOp::Add,
                Some(FormulaLex::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.link(&mut links, lhs.span())?;
            self.next()?;
            let rhs = self.multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn multiplicative(&mut self) -> ParseResult<Spanned<Ast>> {
        let mut lhs = self.unary()?;
        let mut links = 0;
        loop {
            let op = match self.peek()? {
                Some(FormulaLex::Star) => BinaryOp::Mul,
                Some(FormulaLex::Slash) => BinaryOp::Div,
                Some(FormulaLex::DoubleSlash) => BinaryOp::FloorDiv,
                Some(FormulaLex::Percent) => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.link(&mut links, lhs.span())?;
            self.next()?;
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> ParseResult<Spanned<Ast>> {
        let op = if let Some(span) = self.probe(&FormulaLex::Minus) {
            Some((UnaryOp::Neg, span))
        } else {
            self.probe(&FormulaLex::Plus).map(|span| (UnaryOp::Pos, span))
        };
        match op {
            Some((op, span)) => {
                let operand = self.nested(span, Self::unary)?;
                Ok(unary(op, span, operand))
            }
            None => self.power(),
        }
    }

    /// `postfix ['**' unary]`, so `-2 ** 2` is `-(2 ** 2)` and `2 ** -1` is allowed.
    fn power(&mut self) -> ParseResult<Spanned<Ast>> {
        let base = self.postfix()?;
        match self.probe(&FormulaLex::DoubleStar) {
            Some(span) => {
                let exponent = self.nested(span, Self::unary)?;
                Ok(binary(BinaryOp::Pow, base, exponent))
            }
            None => Ok(base),
        }
    }

    fn postfix(&mut self) -> ParseResult<Spanned<Ast>> {
        use FormulaLex as L;

        let mut node = self.atom()?;
        let mut links = 0;
        loop {
            if self.probe(&L::OpenParen).is_some() {
                self.link(&mut links, node.span())?;
                let args = self.arguments()?;
                let close = self.expect(&L::CloseParen, "`)` or `,`")?;
                let span = node.span().combine(&close);
                node = span.with(Ast::Call {
                    callee: Box::new(node),
                    args,
                });
            } else if self.probe(&L::Dot).is_some() {
                self.link(&mut links, node.span())?;
                let name = match self.next()? {
                    Some(token) => match token.split() {
                        (L::Ident(name), span) => span.with(name),
                        (other, span) => {
                            return Err(span.with(SyntaxError::Expected {
                                expected: "a member name after `.`",
                                found: other.describe(),
                            }));
                        }
                    },
                    None => return Err(self.end.with(SyntaxError::UnexpectedEnd("a member name"))),
                };
                let span = node.span().combine(&name.span());
                node = span.with(Ast::Member {
                    base: Box::new(node),
                    name,
                });
            } else if let Some(open) = self.probe(&L::OpenBracket) {
                self.link(&mut links, open)?;
                let index = self.nested(open, Self::expression)?;
                let close = self.expect(&L::CloseBracket, "`]`")?;
                let span = node.span().combine(&close);
                node = span.with(Ast::Index {
                    base: Box::new(node),
                    index: Box::new(index),
                });
            } else {
                return Ok(node);
            }
        }
    }

    /// Comma separated expressions up to, not including, the closing parenthesis.
    fn arguments(&mut self) -> ParseResult<Vec<Spanned<Ast>>> {
        let mut args = Vec::new();
        while self.peek()? != Some(FormulaLex::CloseParen) {
            args.push(self.expression()?);
            if self.probe(&FormulaLex::Comma).is_none() {
                break;
            }
        }
        Ok(args)
    }

    fn atom(&mut self) -> ParseResult<Spanned<Ast>> {
        use FormulaLex as L;

        let Some(token) = self.next()? else {
            return Err(self.end.with(SyntaxError::UnexpectedEnd("a value")));
        };
        let (token, span) = token.split();
        let ast = match token {
            L::Int(i) => Ast::Literal(Value::Int(i)),
            L::Float(f) => Ast::Literal(Value::Float(f)),
            L::Str(s) => Ast::Literal(Value::Str(s)),
            L::True => Ast::Literal(Value::Bool(true)),
            L::False => Ast::Literal(Value::Bool(false)),
            L::None => Ast::Literal(Value::Null),
            L::Ident(name) => Ast::Name(name),
            L::OpenParen => {
                let inner = self.nested(span, Self::expression)?;
                let close = self.expect(&L::CloseParen, "`)`")?;
                let (inner, _) = inner.split();
                return Ok(span.combine(&close).with(inner));
            }
            L::OpenBracket => {
                let mut items = Vec::new();
                while self.peek()? != Some(L::CloseBracket) {
                    items.push(self.nested(span, Self::expression)?);
                    if self.probe(&L::Comma).is_none() {
                        break;
                    }
                }
                let close = self.expect(&L::CloseBracket, "`]` or `,`")?;
                return Ok(span.combine(&close).with(Ast::List(items)));
            }
            other => {
                return Err(span.with(SyntaxError::Expected {
                    expected: "a value",
                    found: other.describe(),
                }));
            }
        };
        Ok(span.with(ast))
    }
}

fn unary(op: UnaryOp, op_t: Span, operand: Spanned<Ast>) -> Spanned<Ast> {
    let span = op_t.combine(&operand.span());
    span.with(Ast::Unary {
        op,
        operand: Box::new(operand),
    })
}

fn binary(op: BinaryOp, lhs: Spanned<Ast>, rhs: Spanned<Ast>) -> Spanned<Ast> {
    let span = lhs.span().combine(&rhs.span());
    span.with(Ast::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

fn logic(op: LogicOp, lhs: Spanned<Ast>, rhs: Spanned<Ast>) -> Spanned<Ast> {
    let span = lhs.span().combine(&rhs.span());
    span.with(Ast::Logic {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ast(input: &str) -> Ast {
        parse(input).unwrap().into_inner()
    }

    fn err(input: &str) -> SyntaxError {
        parse(input).unwrap_err().into_inner()
    }

    fn name(n: &str) -> Ast {
        Ast::Name(n.to_string())
    }

    #[test]
    fn precedence_of_arithmetic() {
        let Ast::Binary { op, lhs, rhs } = ast("a + b * c") else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Add);
        assert_eq!(**lhs, name("a"));
        let Ast::Binary { op, .. } = rhs.into_inner() else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Mul);
    }

    #[test]
    fn power_binds_tighter_than_unary_minus() {
        let Ast::Unary { op, operand } = ast("-2 ** 2") else {
            panic!("expected unary");
        };
        assert_eq!(op, UnaryOp::Neg);
        assert!(matches!(**operand, Ast::Binary { op: BinaryOp::Pow, .. }));
    }

    #[test]
    fn power_is_right_associative() {
        let Ast::Binary { op, lhs, rhs } = ast("2 ** 3 ** 2") else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Pow);
        assert_eq!(**lhs, Ast::Literal(Value::Int(2)));
        assert!(matches!(**rhs, Ast::Binary { op: BinaryOp::Pow, .. }));
    }

    #[test]
    fn module_call() {
        let Ast::Call { callee, args } = ast("os.system('rm -rf /')") else {
            panic!("expected call");
        };
        let Ast::Member { base, name } = callee.into_inner() else {
            panic!("expected member");
        };
        assert_eq!(**base, self::name("os"));
        assert_eq!(&*name, "system");
        assert_eq!(args.len(), 1);
        assert_eq!(*args[0], Ast::Literal(Value::Str("rm -rf /".into())));
    }

    #[test]
    fn nested_calls_keep_all_arguments() {
        let Ast::Call { args, .. } = ast("max(1, min(2, 3, 4, 5, 6), abs(-7), 8, 9)") else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 5);
        let Ast::Call { args: inner, .. } = &*args[1] else {
            panic!("expected inner call");
        };
        assert_eq!(inner.len(), 5);
        assert_eq!(*inner[4], Ast::Literal(Value::Int(6)));
        assert!(matches!(ast("f()"), Ast::Call { args, .. } if args.is_empty()));
    }

    #[test]
    fn conditional_and_logic() {
        let Ast::Conditional { cond, .. } = ast("a if b and not c else 0") else {
            panic!("expected conditional");
        };
        assert!(matches!(**cond, Ast::Logic { op: LogicOp::And, .. }));
    }

    #[test]
    fn not_in() {
        assert!(matches!(ast("'x' not in s"), Ast::Binary { op: BinaryOp::NotIn, .. }));
    }

    #[test]
    fn index_and_list() {
        let Ast::Index { base, index } = ast("col['a']") else {
            panic!("expected index");
        };
        assert_eq!(**base, name("col"));
        assert_eq!(**index, Ast::Literal(Value::Str("a".into())));
        assert!(matches!(ast("[1, 2,]"), Ast::List(items) if items.len() == 2));
    }

    #[test]
    fn spans_cover_source() {
        let parsed = parse("  a + bb ").unwrap();
        assert_eq!((parsed.span().start(), parsed.span().end()), (2, 8));
    }

    #[test]
    fn syntax_errors() {
        assert_eq!(err(""), SyntaxError::Empty);
        assert_eq!(err("   "), SyntaxError::Empty);
        assert_eq!(err("a +"), SyntaxError::UnexpectedEnd("a value"));
        assert_eq!(err("a ; b"), SyntaxError::UnknownToken(";".into()));
        assert!(matches!(err("a b"), SyntaxError::Expected { expected: "end of formula", .. }));
        assert!(matches!(err("a < b < c"), SyntaxError::Expected { .. }));
        assert!(matches!(err("f(1, 2"), SyntaxError::UnexpectedEnd(_)));
        assert!(matches!(err("x if y"), SyntaxError::UnexpectedEnd("`else`")));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let input = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        assert_eq!(err(&input), SyntaxError::TooDeep);

        let chain = vec!["a"; 500].join(" + ");
        assert_eq!(err(&chain), SyntaxError::TooDeep);
        assert!(parse(&vec!["a"; 50].join(" + ")).is_ok());
    }
}
