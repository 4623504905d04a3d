use std::collections::BTreeSet;
use std::sync::Arc;

use super::parse::{Ast, BinaryOp, LogicOp, UnaryOp};
use super::{CompileError, RECORD_BINDING};
use crate::host::{Callable, Member};
use crate::registry::Capabilities;
use crate::span::{Span, Spanned};
use crate::value::Value;

/// Formula with every name resolved. Evaluation never looks names up again.
#[derive(Debug)]
pub(super) enum Node {
    Literal(Value),
    Field(String),

    /// `col[...]`: field selected by a computed name.
    FieldAt(Box<Node>),

    Call {
        callable: &'static Callable,
        args: Vec<Node>,
    },
    Index {
        base: Box<Node>,
        index: Box<Node>,
    },
    List(Vec<Node>),
    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Logic {
        op: LogicOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Conditional {
        cond: Box<Node>,
        then: Box<Node>,
        otherwise: Box<Node>,
    },
}

pub(super) struct Binder<'a> {
    capabilities: &'a Capabilities,
    fields: Option<&'a BTreeSet<&'a str>>,
    errors: Vec<CompileError>,
}

impl<'a> Binder<'a> {
    pub fn new(capabilities: &'a Arc<Capabilities>, fields: Option<&'a BTreeSet<&'a str>>) -> Self {
        Self {
            capabilities: capabilities.as_ref(),
            fields,
            errors: Vec::new(),
        }
    }

    pub fn bind(mut self, ast: Spanned<Ast>) -> Result<Node, Vec<CompileError>> {
        let node = self.node(ast);
        if self.errors.is_empty() {
            Ok(node)
        } else {
            Err(self.errors)
        }
    }

    /// Record the error and continue with a placeholder, so later errors are found too.
    fn fail(&mut self, error: CompileError) -> Node {
        log::trace!("binding failed: {error}");
        self.errors.push(error);
        Node::Literal(Value::Null)
    }

    fn is_field(&self, name: &str) -> bool {
        self.fields.is_some_and(|fields| fields.contains(name))
    }

    fn boxed(&mut self, ast: Spanned<Ast>) -> Box<Node> {
        Box::new(self.node(ast))
    }

    fn node(&mut self, ast: Spanned<Ast>) -> Node {
        let (ast, span) = ast.split();
        match ast {
            Ast::Literal(value) => Node::Literal(value),
            Ast::Name(name) => self.name(name, span),
            Ast::Member { base, name } => self.member(*base, name, span),
            Ast::Call { callee, args } => self.call(*callee, args, span),
            Ast::Index { base, index } => {
                if self.is_record_binding(&base) {
                    Node::FieldAt(self.boxed(*index))
                } else {
                    Node::Index {
                        base: self.boxed(*base),
                        index: self.boxed(*index),
                    }
                }
            }
            Ast::List(items) => Node::List(items.into_iter().map(|item| self.node(item)).collect()),
            Ast::Unary { op, operand } => Node::Unary {
                op,
                operand: self.boxed(*operand),
            },
            Ast::Binary { op, lhs, rhs } => Node::Binary {
                op,
                lhs: self.boxed(*lhs),
                rhs: self.boxed(*rhs),
            },
            Ast::Logic { op, lhs, rhs } => Node::Logic {
                op,
                lhs: self.boxed(*lhs),
                rhs: self.boxed(*rhs),
            },
            Ast::Conditional {
                cond,
                then,
                otherwise,
            } => Node::Conditional {
                cond: self.boxed(*cond),
                then: self.boxed(*then),
                otherwise: self.boxed(*otherwise),
            },
        }
    }

    /// A real field named like the record binding takes precedence over it.
    fn is_record_binding(&self, ast: &Ast) -> bool {
        matches!(ast, Ast::Name(name) if name == RECORD_BINDING && !self.is_field(name))
    }

    fn name(&mut self, name: String, span: Span) -> Node {
        if self.is_field(&name) {
            return Node::Field(name);
        }
        if name == RECORD_BINDING {
            return self.fail(CompileError::RecordNotIndexed { span });
        }
        if self.capabilities.symbol(&name).is_some() {
            return self.fail(CompileError::NotCalled { name, span });
        }
        match self.fields {
            Some(_) => self.fail(CompileError::UnknownField { name, span }),
            None => Node::Field(name),
        }
    }

    /// Resolve `module.member` through the allowed imports.
    fn module_member(&mut self, base: Spanned<Ast>, member: &str, span: Span) -> Option<(String, &'static Member)> {
        let Ast::Name(module_name) = base.into_inner() else {
            self.fail(CompileError::AttributeNotAllowed { span });
            return None;
        };
        let module = match self.capabilities.resolve_import(&module_name) {
            Ok(module) => module,
            Err(error) => {
                self.fail(CompileError::ImportNotAllowed { error, span });
                return None;
            }
        };
        match module.member(member) {
            Some(found) => Some((format!("{module_name}.{member}"), found)),
            None => {
                self.fail(CompileError::UnknownMember {
                    module: module_name,
                    member: member.to_string(),
                    span,
                });
                None
            }
        }
    }

    fn member(&mut self, base: Spanned<Ast>, name: Spanned<String>, span: Span) -> Node {
        match self.module_member(base, &name, span) {
            None => Node::Literal(Value::Null),
            Some((_, Member::Constant(value))) => Node::Literal(value.clone()),
            Some((name, Member::Function(_))) => self.fail(CompileError::NotCalled { name, span }),
        }
    }

    fn call(&mut self, callee: Spanned<Ast>, args: Vec<Spanned<Ast>>, span: Span) -> Node {
        let callee_span = callee.span();
        let callable = match callee.into_inner() {
            Ast::Name(name) => match self.capabilities.symbol(&name) {
                Some(callable) => Some(callable),
                None => {
                    self.fail(CompileError::SymbolNotAllowed {
                        name,
                        span: callee_span,
                    });
                    None
                }
            },
            Ast::Member { base, name } => match self.module_member(*base, &name, callee_span) {
                Some((_, Member::Function(callable))) => Some(callable),
                Some((name, Member::Constant(_))) => {
                    self.fail(CompileError::ConstantCalled {
                        name,
                        span: callee_span,
                    });
                    None
                }
                None => None,
            },
            _ => {
                self.fail(CompileError::NotCallable { span: callee_span });
                None
            }
        };

        let given = args.len();
        let args: Vec<Node> = args.into_iter().map(|arg| self.node(arg)).collect();

        let Some(callable) = callable else {
            return Node::Literal(Value::Null);
        };
        if !callable.arity.accepts(given) {
            return self.fail(CompileError::Arity {
                name: callable.name.to_string(),
                expected: callable.arity,
                given,
                span,
            });
        }
        Node::Call { callable, args }
    }
}
