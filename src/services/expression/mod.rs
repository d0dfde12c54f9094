//! Stream-expression language
//!
//! A small, safe DSL used in three places: group conditions, the
//! dynamic-addon-fetching exit condition, and stream-filter selectors.
//! Conditions evaluate to booleans; selectors evaluate to a subset of the
//! candidate streams.

mod ast;
mod eval;
mod lexer;

pub use ast::Expr;
pub use eval::Value;

use crate::models::ParsedStream;

/// Expression failure. Parse errors carry the byte position; evaluation
/// errors carry the offending sub-expression and the observed kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprError {
    /// The expression is structurally invalid.
    Parse { position: usize, message: String },
    /// The expression evaluated to the wrong kind of value.
    Kind {
        expected: &'static str,
        actual: String,
        context: String,
    },
    /// Evaluation failed on a structurally valid expression.
    Eval { message: String, context: String },
}

impl ExprError {
    pub(crate) fn parse(position: usize, message: impl Into<String>) -> Self {
        ExprError::Parse {
            position,
            message: message.into(),
        }
    }

    pub(crate) fn kind(expected: &'static str, actual: &str, context: String) -> Self {
        ExprError::Kind {
            expected,
            actual: actual.to_string(),
            context,
        }
    }

    pub(crate) fn eval(message: impl Into<String>, context: String) -> Self {
        ExprError::Eval {
            message: message.into(),
            context,
        }
    }
}

impl std::fmt::Display for ExprError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExprError::Parse { position, message } => {
                write!(f, "invalid expression at position {}: {}", position, message)
            }
            ExprError::Kind {
                expected,
                actual,
                context,
            } => write!(
                f,
                "expression returned {} where {} was expected (in {})",
                actual, expected, context
            ),
            ExprError::Eval { message, context } => {
                write!(f, "expression evaluation failed: {} (in {})", message, context)
            }
        }
    }
}

impl std::error::Error for ExprError {}

/// Evaluate an expression source against a stream collection.
pub fn evaluate(source: &str, streams: &[ParsedStream]) -> Result<Value, ExprError> {
    let expr = Expr::parse(source)?;
    eval::eval(&expr, streams)
}

/// Evaluate a condition that must produce a boolean.
pub fn check_condition(source: &str, streams: &[ParsedStream]) -> Result<bool, ExprError> {
    match evaluate(source, streams)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::kind("boolean", other.kind(), source.to_string())),
    }
}

/// Evaluate a selector that must produce a stream subset. The returned
/// indices are in input order.
pub fn select(source: &str, streams: &[ParsedStream]) -> Result<Vec<usize>, ExprError> {
    match evaluate(source, streams)? {
        Value::Streams(indices) => Ok(indices),
        other => Err(ExprError::kind("streams", other.kind(), source.to_string())),
    }
}

/// Validate a group or dynamic-fetch condition: it must parse and a dry
/// run on the empty collection must produce a boolean.
pub fn validate_condition(source: &str) -> Result<(), ExprError> {
    check_condition(source, &[]).map(|_| ())
}

/// Validate a filter selector: it must parse and a dry run on the empty
/// collection must produce a stream list.
pub fn validate_selector(source: &str) -> Result<(), ExprError> {
    select(source, &[]).map(|_| ())
}
