//! Tree-walking evaluator for stream expressions.
//!
//! Expressions evaluate against a candidate stream collection. A field
//! comparison (`type = "debrid"`) selects the subset of streams matching
//! it; boolean connectives intersect, union or complement those subsets.
//! Scalar operands (`count(...) > 0`) evaluate to plain values, so group
//! and dynamic-fetch conditions come out as booleans.

use regex::Regex;

use super::ast::{CmpOp, Expr};
use super::ExprError;
use crate::models::ParsedStream;

/// Evaluation result kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<String>),
    /// Indices into the evaluation context, in context order.
    Streams(Vec<usize>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "boolean",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Streams(_) => "streams",
        }
    }
}

/// A stream field observed during evaluation.
#[derive(Debug, Clone, PartialEq)]
enum Field {
    Str(String),
    Num(f64),
    Bool(bool),
    List(Vec<String>),
}

impl Field {
    fn truthy(&self) -> bool {
        match self {
            Field::Bool(b) => *b,
            Field::Num(n) => *n != 0.0,
            Field::Str(s) => !s.is_empty(),
            Field::List(l) => !l.is_empty(),
        }
    }
}

/// Resolve a dotted path against one stream. `stream.` and `parsedFile.`
/// prefixes are accepted but optional.
fn field_value(stream: &ParsedStream, path: &str) -> Option<Field> {
    let path = path.strip_prefix("stream.").unwrap_or(path);
    let path = path.strip_prefix("parsedFile.").unwrap_or(path);
    match path {
        "type" => Some(Field::Str(stream.stream_type.to_string())),
        "resolution" => stream.parsed_file.resolution.clone().map(Field::Str),
        "quality" => stream.parsed_file.quality.clone().map(Field::Str),
        "encode" => stream.parsed_file.encode.clone().map(Field::Str),
        "title" => stream.parsed_file.title.clone().map(Field::Str),
        "releaseGroup" => stream.parsed_file.release_group.clone().map(Field::Str),
        "year" => stream.parsed_file.year.map(|y| Field::Num(y as f64)),
        "season" => stream.parsed_file.season.map(|s| Field::Num(s as f64)),
        "episode" => stream.parsed_file.episode.map(|e| Field::Num(e as f64)),
        "languages" => Some(Field::List(stream.parsed_file.languages.clone())),
        "visualTags" => Some(Field::List(stream.parsed_file.visual_tags.clone())),
        "audioTags" => Some(Field::List(stream.parsed_file.audio_tags.clone())),
        "audioChannels" => Some(Field::List(stream.parsed_file.audio_channels.clone())),
        "size" => stream.size.map(|s| Field::Num(s as f64)),
        "folderSize" => stream.folder_size.map(|s| Field::Num(s as f64)),
        "seeders" => stream
            .torrent
            .as_ref()
            .and_then(|t| t.seeders)
            .map(|s| Field::Num(s as f64)),
        "infoHash" => stream
            .torrent
            .as_ref()
            .map(|t| Field::Str(t.info_hash.clone())),
        "cached" => Some(Field::Bool(stream.is_cached())),
        "service" => stream
            .service
            .as_ref()
            .map(|s| Field::Str(s.id.to_string())),
        "addon" => Some(Field::Str(stream.addon.name.clone())),
        "addonId" => Some(Field::Str(stream.addon.instance_id.clone())),
        "indexer" => stream.indexer.clone().map(Field::Str),
        "age" => stream.age.clone().map(Field::Str),
        "filename" => stream.filename.clone().map(Field::Str),
        "folderName" => stream.folder_name.clone().map(Field::Str),
        "library" => Some(Field::Bool(stream.library)),
        "proxied" => Some(Field::Bool(stream.proxied)),
        "keywordMatched" => Some(Field::Bool(stream.keyword_matched.unwrap_or(false))),
        "regexMatched" => stream.regex_matched.map(|i| Field::Num(i as f64)),
        "duration" => stream.duration.map(|d| Field::Num(d as f64)),
        _ => None,
    }
}

fn describe(expr: &Expr) -> String {
    format!("{:?}", expr)
}

pub fn eval(expr: &Expr, streams: &[ParsedStream]) -> Result<Value, ExprError> {
    match expr {
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Num(n) => Ok(Value::Num(*n)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::List(items) => Ok(Value::List(items.clone())),
        Expr::Path(name) => {
            if name == "streams" {
                return Ok(Value::Streams((0..streams.len()).collect()));
            }
            // A bare field selects the streams where it is truthy.
            let selected = streams
                .iter()
                .enumerate()
                .filter(|(_, s)| field_value(s, name).map(|f| f.truthy()).unwrap_or(false))
                .map(|(i, _)| i)
                .collect();
            Ok(Value::Streams(selected))
        }
        Expr::Call { name, arg } => {
            let value = eval(arg, streams)?;
            match (name.as_str(), &value) {
                ("count", Value::Streams(indices)) => Ok(Value::Num(indices.len() as f64)),
                ("count", Value::List(items)) => Ok(Value::Num(items.len() as f64)),
                ("exists", Value::Streams(indices)) => Ok(Value::Bool(!indices.is_empty())),
                ("count" | "exists", other) => Err(ExprError::kind(
                    "streams",
                    other.kind(),
                    describe(arg),
                )),
                _ => Err(ExprError::eval(
                    format!("unknown function '{}'", name),
                    describe(expr),
                )),
            }
        }
        Expr::Cmp { op, lhs, rhs } => eval_cmp(*op, lhs, rhs, streams),
        Expr::And(a, b) => {
            let left = eval(a, streams)?;
            let right = eval(b, streams)?;
            match (left, right) {
                (Value::Bool(x), Value::Bool(y)) => Ok(Value::Bool(x && y)),
                (Value::Streams(x), Value::Streams(y)) => {
                    Ok(Value::Streams(x.into_iter().filter(|i| y.contains(i)).collect()))
                }
                (left, right) => Err(ExprError::eval(
                    format!(
                        "'and' operands must both be booleans or both stream sets, got {} and {}",
                        left.kind(),
                        right.kind()
                    ),
                    describe(expr),
                )),
            }
        }
        Expr::Or(a, b) => {
            let left = eval(a, streams)?;
            let right = eval(b, streams)?;
            match (left, right) {
                (Value::Bool(x), Value::Bool(y)) => Ok(Value::Bool(x || y)),
                (Value::Streams(x), Value::Streams(y)) => {
                    let mut union: Vec<usize> = x;
                    for i in y {
                        if !union.contains(&i) {
                            union.push(i);
                        }
                    }
                    union.sort_unstable();
                    Ok(Value::Streams(union))
                }
                (left, right) => Err(ExprError::eval(
                    format!(
                        "'or' operands must both be booleans or both stream sets, got {} and {}",
                        left.kind(),
                        right.kind()
                    ),
                    describe(expr),
                )),
            }
        }
        Expr::Not(inner) => match eval(inner, streams)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            Value::Streams(selected) => Ok(Value::Streams(
                (0..streams.len()).filter(|i| !selected.contains(i)).collect(),
            )),
            other => Err(ExprError::eval(
                format!("'not' operand must be boolean or streams, got {}", other.kind()),
                describe(expr),
            )),
        },
    }
}

fn eval_cmp(
    op: CmpOp,
    lhs: &Expr,
    rhs: &Expr,
    streams: &[ParsedStream],
) -> Result<Value, ExprError> {
    // A field path on the left selects matching streams.
    if let Expr::Path(path) = lhs {
        if path != "streams" {
            let rhs_value = eval(rhs, streams)?;
            let mut regex = None;
            if op == CmpOp::Matches {
                let pattern = match &rhs_value {
                    Value::Str(p) => p,
                    other => {
                        return Err(ExprError::kind("string", other.kind(), describe(rhs)))
                    }
                };
                regex = Some(Regex::new(pattern).map_err(|e| {
                    ExprError::eval(format!("invalid regex: {}", e), describe(rhs))
                })?);
            }
            let selected = streams
                .iter()
                .enumerate()
                .filter_map(|(i, stream)| {
                    let field = field_value(stream, path);
                    match field_matches(field.as_ref(), op, &rhs_value, regex.as_ref()) {
                        Ok(true) => Some(Ok(i)),
                        Ok(false) => None,
                        Err(e) => Some(Err(e)),
                    }
                })
                .collect::<Result<Vec<usize>, ExprError>>()?;
            return Ok(Value::Streams(selected));
        }
    }

    // Scalar comparison.
    let left = eval(lhs, streams)?;
    let right = eval(rhs, streams)?;
    let result = match (op, &left, &right) {
        (CmpOp::Eq, Value::Num(a), Value::Num(b)) => a == b,
        (CmpOp::Ne, Value::Num(a), Value::Num(b)) => a != b,
        (CmpOp::Lt, Value::Num(a), Value::Num(b)) => a < b,
        (CmpOp::Le, Value::Num(a), Value::Num(b)) => a <= b,
        (CmpOp::Gt, Value::Num(a), Value::Num(b)) => a > b,
        (CmpOp::Ge, Value::Num(a), Value::Num(b)) => a >= b,
        (CmpOp::Eq, Value::Str(a), Value::Str(b)) => a.eq_ignore_ascii_case(b),
        (CmpOp::Ne, Value::Str(a), Value::Str(b)) => !a.eq_ignore_ascii_case(b),
        (CmpOp::Eq, Value::Bool(a), Value::Bool(b)) => a == b,
        (CmpOp::Ne, Value::Bool(a), Value::Bool(b)) => a != b,
        (CmpOp::Contains, Value::Str(a), Value::Str(b)) => {
            a.to_lowercase().contains(&b.to_lowercase())
        }
        (CmpOp::In, Value::Str(a), Value::List(items)) => {
            items.iter().any(|i| i.eq_ignore_ascii_case(a))
        }
        _ => {
            return Err(ExprError::eval(
                format!(
                    "cannot apply {:?} to {} and {}",
                    op,
                    left.kind(),
                    right.kind()
                ),
                format!("{:?} {:?} {:?}", lhs, op, rhs),
            ))
        }
    };
    Ok(Value::Bool(result))
}

/// Apply a comparison between one stream's field and a literal. An absent
/// field fails every test except `!=`.
fn field_matches(
    field: Option<&Field>,
    op: CmpOp,
    rhs: &Value,
    regex: Option<&Regex>,
) -> Result<bool, ExprError> {
    let field = match field {
        Some(f) => f,
        None => return Ok(op == CmpOp::Ne),
    };
    let result = match (op, field, rhs) {
        (CmpOp::Eq, Field::Str(a), Value::Str(b)) => a.eq_ignore_ascii_case(b),
        (CmpOp::Ne, Field::Str(a), Value::Str(b)) => !a.eq_ignore_ascii_case(b),
        (CmpOp::Eq, Field::Num(a), Value::Num(b)) => a == b,
        (CmpOp::Ne, Field::Num(a), Value::Num(b)) => a != b,
        (CmpOp::Lt, Field::Num(a), Value::Num(b)) => a < b,
        (CmpOp::Le, Field::Num(a), Value::Num(b)) => a <= b,
        (CmpOp::Gt, Field::Num(a), Value::Num(b)) => a > b,
        (CmpOp::Ge, Field::Num(a), Value::Num(b)) => a >= b,
        (CmpOp::Eq, Field::Bool(a), Value::Bool(b)) => a == b,
        (CmpOp::Ne, Field::Bool(a), Value::Bool(b)) => a != b,
        // On list fields equality means membership.
        (CmpOp::Eq, Field::List(items), Value::Str(b)) => {
            items.iter().any(|i| i.eq_ignore_ascii_case(b))
        }
        (CmpOp::Ne, Field::List(items), Value::Str(b)) => {
            !items.iter().any(|i| i.eq_ignore_ascii_case(b))
        }
        (CmpOp::Contains, Field::Str(a), Value::Str(b)) => {
            a.to_lowercase().contains(&b.to_lowercase())
        }
        (CmpOp::Contains, Field::List(items), Value::Str(b)) => {
            items.iter().any(|i| i.eq_ignore_ascii_case(b))
        }
        (CmpOp::Matches, Field::Str(a), Value::Str(_)) => {
            regex.expect("regex compiled for Matches").is_match(a)
        }
        (CmpOp::Matches, Field::List(items), Value::Str(_)) => {
            let re = regex.expect("regex compiled for Matches");
            items.iter().any(|i| re.is_match(i))
        }
        (CmpOp::In, Field::Str(a), Value::List(items)) => {
            items.iter().any(|i| i.eq_ignore_ascii_case(a))
        }
        (CmpOp::In, Field::Num(a), Value::List(items)) => {
            items.iter().any(|i| i.parse::<f64>().ok() == Some(*a))
        }
        (_, field, rhs) => {
            let field_kind = match field {
                Field::Str(_) => "string",
                Field::Num(_) => "number",
                Field::Bool(_) => "boolean",
                Field::List(_) => "list",
            };
            return Err(ExprError::eval(
                format!(
                    "cannot apply {:?} to {} field and {} value",
                    op,
                    field_kind,
                    rhs.kind()
                ),
                format!("{:?}", op),
            ));
        }
    };
    Ok(result)
}
