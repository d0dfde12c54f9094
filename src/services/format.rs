//! Formatter
//!
//! Renders the client-facing name/description pair from user templates.
//! Templates reference stream fields with `{stream.PATH}` and carry
//! conditional snippets `{stream.PATH::OP[TRUE||FALSE]}` where OP is one
//! of `exists`, `=value`, `>value`, `join(sep)`, `bytes` or `time`.
//! Stream-type markers come from the template, never from code.

use serde_json::Value;

use crate::models::{FormatConfig, ParsedStream};

/// Rendered client-facing strings.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedStream {
    pub name: String,
    pub description: String,
}

pub struct Formatter {
    name_template: String,
    description_template: String,
}

impl Formatter {
    pub fn new(config: &FormatConfig) -> Self {
        Self {
            name_template: config.name_template.clone(),
            description_template: config.description_template.clone(),
        }
    }

    /// Render both templates. The stream itself is never modified.
    pub fn format(&self, stream: &ParsedStream) -> FormattedStream {
        let value = serde_json::to_value(stream).unwrap_or(Value::Null);
        FormattedStream {
            name: render(&self.name_template, &value),
            description: render(&self.description_template, &value),
        }
    }
}

/// Navigate a dotted path into the serialized stream. The leading
/// `stream.` segment is implicit.
fn lookup<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    let path = path.strip_prefix("stream.").unwrap_or(path);
    let mut current = root;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    match current {
        Value::Null => None,
        other => Some(other),
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else {
                n.to_string()
            }
        }
        Value::Array(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Null => String::new(),
        Value::Object(_) => String::new(),
    }
}

/// Whether a value counts as present for `exists`.
fn exists(value: Option<&Value>) -> bool {
    match value {
        None => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(_) => true,
    }
}

fn human_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{:.0} {}", value, UNITS[unit])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

fn human_time(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Render one template against a serialized stream.
pub fn render(template: &str, root: &Value) -> String {
    let mut output = String::with_capacity(template.len());
    let chars: Vec<char> = template.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '{' {
            output.push(chars[i]);
            i += 1;
            continue;
        }
        // find the matching close brace
        let mut depth = 1;
        let mut j = i + 1;
        while j < chars.len() && depth > 0 {
            match chars[j] {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
            j += 1;
        }
        if depth != 0 {
            // unbalanced; emit the rest verbatim
            output.extend(&chars[i..]);
            break;
        }
        let inner: String = chars[i + 1..j - 1].iter().collect();
        output.push_str(&render_segment(&inner, root));
        i = j;
    }
    output
}

/// Render one `{...}` segment: `path` or `path::op` or `path::op[T||F]`.
fn render_segment(segment: &str, root: &Value) -> String {
    let (path, rest) = match segment.split_once("::") {
        Some((path, rest)) => (path.trim(), Some(rest)),
        None => (segment.trim(), None),
    };
    let value = lookup(root, path);

    let rest = match rest {
        None => return value.map(render_value).unwrap_or_default(),
        Some(rest) => rest,
    };

    let (op, branches) = split_op_branches(rest);

    // transforms without branches
    match op {
        "bytes" => {
            return value
                .and_then(|v| v.as_f64())
                .map(human_bytes)
                .unwrap_or_default()
        }
        "time" => {
            return value
                .and_then(|v| v.as_f64())
                .map(human_time)
                .unwrap_or_default()
        }
        _ if op.starts_with("join(") && op.ends_with(')') => {
            let separator = &op[5..op.len() - 1];
            return match value {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(render_value)
                    .collect::<Vec<_>>()
                    .join(separator),
                _ => String::new(),
            };
        }
        _ => {}
    }

    // conditional ops with [TRUE||FALSE] branches
    let condition = match op {
        "exists" => exists(value),
        _ if op.starts_with('=') => {
            let expected = &op[1..];
            match value {
                Some(Value::String(s)) => s.eq_ignore_ascii_case(expected),
                Some(Value::Bool(b)) => expected.parse::<bool>() == Ok(*b),
                Some(Value::Number(n)) => {
                    expected.parse::<f64>().ok() == n.as_f64()
                }
                _ => false,
            }
        }
        _ if op.starts_with('>') => {
            let bound: Option<f64> = op[1..].parse().ok();
            match (value.and_then(|v| v.as_f64()), bound) {
                (Some(v), Some(bound)) => v > bound,
                _ => false,
            }
        }
        _ => false,
    };

    match branches {
        Some((true_branch, false_branch)) => {
            let branch = if condition { true_branch } else { false_branch };
            render(branch, root)
        }
        None => condition.to_string(),
    }
}

/// Split `op[TRUE||FALSE]` into the op and its branches, honouring nested
/// brackets inside the branches.
fn split_op_branches(rest: &str) -> (&str, Option<(&str, &str)>) {
    let open = match rest.find('[') {
        Some(index) => index,
        None => return (rest.trim(), None),
    };
    let op = rest[..open].trim();
    let body = &rest[open + 1..];

    let mut depth = 1;
    let mut close = None;
    for (offset, c) in body.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(offset);
                    break;
                }
            }
            _ => {}
        }
    }
    let close = match close {
        Some(index) => index,
        None => return (op, None),
    };
    let branches = &body[..close];

    // split on the first top-level `||`
    let mut depth = 0;
    let bytes = branches.as_bytes();
    for i in 0..bytes.len().saturating_sub(1) {
        match bytes[i] {
            b'[' => depth += 1,
            b']' => depth -= 1,
            b'|' if depth == 0 && bytes[i + 1] == b'|' => {
                return (op, Some((&branches[..i], &branches[i + 2..])));
            }
            _ => {}
        }
    }
    (op, Some((branches, "")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AddonRef, ServiceId, ServiceRef, StreamType, TorrentInfo};

    fn stream() -> ParsedStream {
        let mut s = ParsedStream::error(
            AddonRef {
                instance_id: "tor1".into(),
                name: "Torrent Addon".into(),
            },
            "x",
            None,
        );
        s.error = None;
        s.stream_type = StreamType::Debrid;
        s.url = Some("https://cdn.example.com/v.mkv".into());
        s.filename = Some("Movie.2024.1080p.mkv".into());
        s.size = Some(2 * 1024 * 1024 * 1024);
        s.parsed_file.resolution = Some("1080p".into());
        s.parsed_file.languages = vec!["English".into(), "French".into()];
        s.service = Some(ServiceRef {
            id: ServiceId::RealDebrid,
            cached: true,
        });
        s.torrent = Some(TorrentInfo {
            info_hash: "abc".into(),
            file_idx: None,
            seeders: Some(12),
            sources: vec![],
        });
        s
    }

    #[test]
    fn test_plain_reference() {
        let value = serde_json::to_value(stream()).unwrap();
        assert_eq!(render("{stream.addon.name}", &value), "Torrent Addon");
        assert_eq!(render("{stream.parsedFile.resolution}", &value), "1080p");
    }

    #[test]
    fn test_exists_branches() {
        let value = serde_json::to_value(stream()).unwrap();
        assert_eq!(
            render("{stream.filename::exists[has file||no file]}", &value),
            "has file"
        );
        assert_eq!(
            render("{stream.folderName::exists[has folder||no folder]}", &value),
            "no folder"
        );
    }

    #[test]
    fn test_eq_and_gt_ops() {
        let value = serde_json::to_value(stream()).unwrap();
        assert_eq!(render("{stream.type::=debrid[D||-]}", &value), "D");
        assert_eq!(render("{stream.service.cached::=true[⚡||⏳]}", &value), "⚡");
        assert_eq!(render("{stream.torrent.seeders::>5[hot||cold]}", &value), "hot");
        assert_eq!(render("{stream.torrent.seeders::>100[hot||cold]}", &value), "cold");
    }

    #[test]
    fn test_bytes_join_time() {
        let value = serde_json::to_value(stream()).unwrap();
        assert_eq!(render("{stream.size::bytes}", &value), "2.00 GB");
        assert_eq!(
            render("{stream.parsedFile.languages::join( / )}", &value),
            "English / French"
        );
        let duration = serde_json::json!({"duration": 5025});
        assert_eq!(render("{duration::time}", &duration), "1h 23m");
    }

    #[test]
    fn test_nested_reference_in_branch() {
        let value = serde_json::to_value(stream()).unwrap();
        assert_eq!(
            render(
                "{stream.service.cached::=true[⚡ {stream.parsedFile.resolution}||none]}",
                &value
            ),
            "⚡ 1080p"
        );
    }

    #[test]
    fn test_literal_brackets_in_branch() {
        let value = serde_json::to_value(stream()).unwrap();
        assert_eq!(render("{stream.type::=p2p[[P2P] ||direct]}", &value), "direct");
        let mut p2p = stream();
        p2p.stream_type = StreamType::P2p;
        p2p.url = None;
        p2p.service = None;
        let value = serde_json::to_value(p2p).unwrap();
        assert_eq!(render("{stream.type::=p2p[[P2P] ||direct]}", &value), "[P2P] ");
    }

    #[test]
    fn test_format_does_not_mutate_stream() {
        let original = stream();
        let before = serde_json::to_value(&original).unwrap();
        let formatter = Formatter::new(&crate::models::FormatConfig::default());
        let rendered = formatter.format(&original);
        assert!(!rendered.name.is_empty());
        let after = serde_json::to_value(&original).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_default_name_template_markers() {
        let formatter = Formatter::new(&crate::models::FormatConfig::default());
        let rendered = formatter.format(&stream());
        assert!(rendered.name.contains("⚡"));
        assert!(rendered.name.contains("Torrent Addon"));
        assert!(rendered.name.contains("1080p"));
    }
}
