use std::fmt::Write as _;

use serde_json::Value as Json;

use crate::value::{float_repr, json_key, lock, throw, ExcKind, Flow, Value};

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub(crate) struct DumpOptions {
    pub indent: Option<String>,
    pub sort_keys: bool,
    pub ensure_ascii: bool,
    pub item_separator: String,
    pub key_separator: String,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            indent: None,
            sort_keys: false,
            ensure_ascii: true,
            item_separator: ", ".to_string(),
            key_separator: ": ".to_string(),
        }
    }
}

/// `json.dumps`, matching CPython's default output byte for byte.
pub(crate) fn dumps(value: &Value, options: &DumpOptions) -> Flow<String> {
    let mut out = String::new();
    write_value(&mut out, value, options, 0)?;
    Ok(out)
}

fn write_value(out: &mut String, value: &Value, options: &DumpOptions, depth: usize) -> Flow<()> {
    if depth > MAX_DEPTH {
        return throw(ExcKind::ValueError, "Circular reference detected");
    }
    match value {
        Value::None => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Int(number) => {
            let _ = write!(out, "{number}");
        }
        Value::Float(number) => {
            if number.is_nan() {
                out.push_str("NaN");
            } else if number.is_infinite() {
                out.push_str(if *number > 0.0 { "Infinity" } else { "-Infinity" });
            } else {
                out.push_str(&float_repr(*number));
            }
        }
        Value::Str(text) => write_string(out, text, options.ensure_ascii),
        Value::List(_) | Value::Tuple(_) => {
            let items = value.iterate()?;
            if items.is_empty() {
                out.push_str("[]");
                return Ok(());
            }
            out.push('[');
            for (position, item) in items.iter().enumerate() {
                if position > 0 {
                    out.push_str(separator(options));
                }
                newline(out, options, depth + 1);
                write_value(out, item, options, depth + 1)?;
            }
            newline(out, options, depth);
            out.push(']');
        }
        Value::Dict(dict) => {
            let items = lock(dict).items();
            if items.is_empty() {
                out.push_str("{}");
                return Ok(());
            }
            let mut entries = items
                .iter()
                .map(|(key, value)| -> Flow<(String, &Value)> { Ok((json_key(key)?, value)) })
                .collect::<Flow<Vec<_>>>()?;
            if options.sort_keys {
                entries.sort_by(|a, b| a.0.cmp(&b.0));
            }
            out.push('{');
            for (position, (key, item)) in entries.into_iter().enumerate() {
                if position > 0 {
                    out.push_str(separator(options));
                }
                newline(out, options, depth + 1);
                write_string(out, &key, options.ensure_ascii);
                out.push_str(&options.key_separator);
                write_value(out, item, options, depth + 1)?;
            }
            newline(out, options, depth);
            out.push('}');
        }
        other => {
            return throw(
                ExcKind::TypeError,
                format!("Object of type {} is not JSON serializable", other.type_name()),
            )
        }
    }
    Ok(())
}

fn separator(options: &DumpOptions) -> &str {
    if options.indent.is_some() && options.item_separator == ", " {
        ","
    } else {
        &options.item_separator
    }
}

fn newline(out: &mut String, options: &DumpOptions, depth: usize) {
    if let Some(indent) = &options.indent {
        out.push('\n');
        for _ in 0..depth {
            out.push_str(indent);
        }
    }
}

fn write_string(out: &mut String, text: &str, ensure_ascii: bool) {
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c if ensure_ascii && !c.is_ascii() => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{unit:04x}");
                }
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// `json.loads`. Object keys come back in sorted order.
pub(crate) fn loads(text: &str) -> Flow<Value> {
    match serde_json::from_str::<Json>(text) {
        Ok(json) => Ok(Value::from_json(&json)),
        Err(err) => throw(ExcKind::JSONDecodeError, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Dict;

    fn sample() -> Value {
        let mut dict = Dict::new();
        dict.insert(Value::str("b"), Value::list(vec![Value::Int(1), Value::Float(2.5)]))
            .ok();
        dict.insert(Value::str("a"), Value::None).ok();
        Value::dict(dict)
    }

    #[test]
    fn default_separators_match_python() {
        let text = dumps(&sample(), &DumpOptions::default()).unwrap_or_default();
        assert_eq!(text, r#"{"b": [1, 2.5], "a": null}"#);
    }

    #[test]
    fn indent_and_sort_keys() {
        let options = DumpOptions {
            indent: Some("  ".to_string()),
            sort_keys: true,
            ..DumpOptions::default()
        };
        let text = dumps(&sample(), &options).unwrap_or_default();
        assert_eq!(text, "{\n  \"a\": null,\n  \"b\": [\n    1,\n    2.5\n  ]\n}");
    }

    #[test]
    fn ascii_escaping() {
        let value = Value::str("é\"\n");
        let escaped = dumps(&value, &DumpOptions::default()).unwrap_or_default();
        assert_eq!(escaped, "\"\\u00e9\\\"\\n\"");
        let raw = dumps(
            &value,
            &DumpOptions {
                ensure_ascii: false,
                ..DumpOptions::default()
            },
        )
        .unwrap_or_default();
        assert_eq!(raw, "\"é\\\"\\n\"");
    }

    #[test]
    fn invalid_json_raises_decode_error() {
        match loads("{not json") {
            Err(crate::value::Interrupt::Raise(exc)) => {
                assert_eq!(exc.kind, ExcKind::JSONDecodeError);
                assert!(exc.kind.is_subclass_of(ExcKind::ValueError));
            }
            _ => panic!("expected JSONDecodeError"),
        }
    }
}
