//! Restricted expression language used by gating predicates, conditions,
//! scripts, loop item lists, outputs and `${...}` templates.
//!
//! Expressions are parsed into an [`Expr`] tree and interpreted against a
//! JSON context; nothing is ever handed to a dynamic evaluator. Only the
//! functions in [`FUNCTIONS`] can be called.

pub mod eval;
pub mod lexer;
pub mod parser;

pub use eval::{to_text, truthy, values_equal};
pub use parser::{parse, BinaryOp, Expr, UnaryOp, FUNCTIONS};

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("unexpected character '{ch}' at offset {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unexpected {found} at offset {pos}, expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: String,
        pos: usize,
    },

    #[error("expression nested too deeply at offset {0}")]
    TooDeep(usize),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{name}() takes {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("template error: {0}")]
    Template(String),
}

/// Accept both `expr` and `${expr}` spellings for predicate fields.
pub fn strip_template(source: &str) -> &str {
    let trimmed = source.trim();
    match trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        Some(inner) if !inner.contains("${") => inner,
        _ => trimmed,
    }
}

/// Parse and evaluate `source` in one go.
pub fn evaluate_str(source: &str, ctx: &Map<String, Value>) -> Result<Value, ExprError> {
    let expr = parse(strip_template(source))?;
    eval::evaluate(&expr, ctx)
}

pub fn evaluate_bool(source: &str, ctx: &Map<String, Value>) -> Result<bool, ExprError> {
    evaluate_str(source, ctx).map(|v| truthy(&v))
}
