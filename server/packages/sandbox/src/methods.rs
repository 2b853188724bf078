use std::sync::Arc;

use crate::builtins::{materialize, sort_values, Args};
use crate::format;
use crate::value::{exception, lock, py_eq, throw, DictCell, ExcKind, Flow, ListCell, Value};
use crate::vm::{normalize_index, Vm};

const STR_METHODS: &[&str] = &[
    "upper",
    "lower",
    "strip",
    "lstrip",
    "rstrip",
    "split",
    "splitlines",
    "join",
    "replace",
    "startswith",
    "endswith",
    "find",
    "index",
    "count",
    "format",
    "title",
    "capitalize",
    "isdigit",
    "isalpha",
    "isalnum",
    "isspace",
    "isupper",
    "islower",
    "zfill",
    "center",
    "ljust",
    "rjust",
    "partition",
];

const LIST_METHODS: &[&str] = &[
    "append", "extend", "insert", "pop", "remove", "index", "count", "sort", "reverse", "clear",
    "copy",
];

const DICT_METHODS: &[&str] = &[
    "get",
    "keys",
    "values",
    "items",
    "pop",
    "setdefault",
    "update",
    "clear",
    "copy",
];

fn table(receiver: &Value) -> &'static [&'static str] {
    match receiver {
        Value::Str(_) => STR_METHODS,
        Value::List(_) => LIST_METHODS,
        Value::Dict(_) => DICT_METHODS,
        _ => &[],
    }
}

fn resolve(receiver: &Value, name: &str) -> Option<&'static str> {
    table(receiver).iter().copied().find(|method| *method == name)
}

pub(crate) fn has_method(receiver: &Value, name: &str) -> bool {
    resolve(receiver, name).is_some()
}

pub(crate) fn call(
    vm: &mut Vm,
    receiver: &Value,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(Arc<str>, Value)>,
) -> Flow<Value> {
    let Some(method) = resolve(receiver, name) else {
        return throw(
            ExcKind::AttributeError,
            format!("'{}' object has no attribute '{name}'", receiver.type_name()),
        );
    };
    match receiver {
        Value::Str(text) => {
            if method == "format" {
                vm.charge(text.len() / 64)?;
                let mut charge = |units| vm.charge(units);
                let text = format::str_format(text, &args, &kwargs, &mut charge)?;
                return Ok(Value::str(text));
            }
            let mut args = Args::new(method, args, kwargs);
            let value = str_method(vm, text, method, &mut args)?;
            args.finish()?;
            Ok(value)
        }
        Value::List(items) => {
            let mut args = Args::new(method, args, kwargs);
            let value = list_method(vm, items, method, &mut args)?;
            args.finish()?;
            Ok(value)
        }
        Value::Dict(dict) => {
            let mut args = Args::new(method, args, kwargs);
            let value = dict_method(vm, dict, method, &mut args)?;
            args.finish()?;
            Ok(value)
        }
        _ => throw(
            ExcKind::AttributeError,
            format!("'{}' object has no attribute '{name}'", receiver.type_name()),
        ),
    }
}

fn str_arg(args: &Args, position: usize, method: &str) -> Flow<Option<Arc<str>>> {
    match args.get(position) {
        None | Some(Value::None) => Ok(None),
        Some(Value::Str(text)) => Ok(Some(text.clone())),
        Some(other) => throw(
            ExcKind::TypeError,
            format!(
                "{method}() argument {} must be str, not {}",
                position + 1,
                other.type_name()
            ),
        ),
    }
}

fn fill_char(args: &Args, method: &str) -> Flow<char> {
    match str_arg(args, 1, method)? {
        None => Ok(' '),
        Some(fill) if fill.chars().count() == 1 => Ok(fill.chars().next().unwrap_or(' ')),
        Some(_) => throw(
            ExcKind::TypeError,
            "The fill character must be exactly one character long",
        ),
    }
}

fn str_method(vm: &mut Vm, text: &Arc<str>, method: &'static str, args: &mut Args) -> Flow<Value> {
    vm.charge(text.len() / 64)?;
    let text: &str = text;
    Ok(match method {
        "upper" => {
            args.arity(0, 0)?;
            Value::str(text.to_uppercase())
        }
        "lower" => {
            args.arity(0, 0)?;
            Value::str(text.to_lowercase())
        }
        "strip" | "lstrip" | "rstrip" => {
            args.arity(0, 1)?;
            let chars: Option<Vec<char>> =
                str_arg(args, 0, method)?.map(|set| set.chars().collect());
            let matches = |c: char| match &chars {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            Value::str(match method {
                "strip" => text.trim_matches(matches),
                "lstrip" => text.trim_start_matches(matches),
                _ => text.trim_end_matches(matches),
            })
        }
        "split" => {
            let sep = args.param(0, "sep");
            let maxsplit = args.param(1, "maxsplit");
            args.arity(0, 2)?;
            let maxsplit = match maxsplit {
                Some(value) => value.as_index()?,
                None => -1,
            };
            let limit = if maxsplit < 0 { usize::MAX } else { maxsplit as usize };
            let parts: Vec<Value> = match sep {
                None | Some(Value::None) => split_whitespace(text, limit)
                    .into_iter()
                    .map(Value::str)
                    .collect(),
                Some(Value::Str(sep)) => {
                    if sep.is_empty() {
                        return throw(ExcKind::ValueError, "empty separator");
                    }
                    text.splitn(limit.saturating_add(1), sep.as_ref())
                        .map(Value::str)
                        .collect()
                }
                Some(other) => {
                    return throw(
                        ExcKind::TypeError,
                        format!("must be str or None, not {}", other.type_name()),
                    )
                }
            };
            Value::list(parts)
        }
        "splitlines" => {
            args.arity(0, 0)?;
            Value::list(text.lines().map(Value::str).collect())
        }
        "join" => {
            args.arity(1, 1)?;
            let items = materialize(vm, args.get(0))?;
            let mut parts = Vec::with_capacity(items.len());
            for (position, item) in items.iter().enumerate() {
                match item {
                    Value::Str(part) => parts.push(part.to_string()),
                    other => {
                        return throw(
                            ExcKind::TypeError,
                            format!(
                                "sequence item {position}: expected str instance, {} found",
                                other.type_name()
                            ),
                        )
                    }
                }
            }
            Value::str(parts.join(text))
        }
        "replace" => {
            args.arity(2, 3)?;
            let (Some(old), Some(new)) = (str_arg(args, 0, method)?, str_arg(args, 1, method)?)
            else {
                return throw(ExcKind::TypeError, "replace() arguments must be str");
            };
            let count = match args.get(2) {
                Some(count) => count.as_index()?,
                None => -1,
            };
            if count >= 0 {
                Value::str(text.replacen(old.as_ref(), &new, count as usize))
            } else {
                Value::str(text.replace(old.as_ref(), &new))
            }
        }
        "startswith" | "endswith" => {
            args.arity(1, 1)?;
            let candidates = match args.first() {
                Value::Tuple(items) => items.to_vec(),
                other => vec![other],
            };
            let mut found = false;
            for candidate in candidates {
                let Value::Str(affix) = candidate else {
                    return throw(
                        ExcKind::TypeError,
                        format!("{method} first arg must be str or a tuple of str"),
                    );
                };
                found |= if method == "startswith" {
                    text.starts_with(affix.as_ref())
                } else {
                    text.ends_with(affix.as_ref())
                };
            }
            Value::Bool(found)
        }
        "find" | "index" => {
            args.arity(1, 1)?;
            let Some(needle) = str_arg(args, 0, method)? else {
                return throw(ExcKind::TypeError, format!("{method}() argument must be str"));
            };
            match text.find(needle.as_ref()) {
                Some(byte) => Value::Int(text[..byte].chars().count() as i64),
                None if method == "find" => Value::Int(-1),
                None => return throw(ExcKind::ValueError, "substring not found"),
            }
        }
        "count" => {
            args.arity(1, 1)?;
            let Some(needle) = str_arg(args, 0, method)? else {
                return throw(ExcKind::TypeError, "count() argument must be str");
            };
            let count = if needle.is_empty() {
                text.chars().count() + 1
            } else {
                text.matches(needle.as_ref()).count()
            };
            Value::Int(count as i64)
        }
        "title" => {
            args.arity(0, 0)?;
            let mut out = String::with_capacity(text.len());
            let mut previous_cased = false;
            for c in text.chars() {
                if previous_cased {
                    out.extend(c.to_lowercase());
                } else {
                    out.extend(c.to_uppercase());
                }
                previous_cased = c.is_alphabetic();
            }
            Value::str(out)
        }
        "capitalize" => {
            args.arity(0, 0)?;
            let mut chars = text.chars();
            let out = match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.as_str().to_lowercase().chars())
                    .collect::<String>(),
                None => String::new(),
            };
            Value::str(out)
        }
        "isdigit" | "isalpha" | "isalnum" | "isspace" => {
            args.arity(0, 0)?;
            let test: fn(char) -> bool = match method {
                "isdigit" => |c| c.is_ascii_digit(),
                "isalpha" => char::is_alphabetic,
                "isalnum" => char::is_alphanumeric,
                _ => char::is_whitespace,
            };
            Value::Bool(!text.is_empty() && text.chars().all(test))
        }
        "isupper" | "islower" => {
            args.arity(0, 0)?;
            let cased: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
            let all = if method == "isupper" {
                cased.iter().all(|c| !c.is_lowercase())
            } else {
                cased.iter().all(|c| !c.is_uppercase())
            };
            Value::Bool(!cased.is_empty() && all)
        }
        "zfill" => {
            args.arity(1, 1)?;
            let width = args.first().as_index()?.max(0) as usize;
            vm.charge(width / 64)?;
            let len = text.chars().count();
            if len >= width {
                Value::str(text)
            } else {
                let (sign, digits) = match text.chars().next() {
                    Some(c @ ('+' | '-')) => (c.to_string(), &text[1..]),
                    _ => (String::new(), text),
                };
                Value::str(format!("{sign}{}{digits}", "0".repeat(width - len)))
            }
        }
        "center" | "ljust" | "rjust" => {
            args.arity(1, 2)?;
            let width = args.first().as_index()?.max(0) as usize;
            vm.charge(width / 64)?;
            let fill = fill_char(args, method)?;
            let len = text.chars().count();
            if len >= width {
                Value::str(text)
            } else {
                let padding = width - len;
                let (left, right) = match method {
                    "ljust" => (0, padding),
                    "rjust" => (padding, 0),
                    _ => {
                        let left = padding / 2 + (padding & width & 1);
                        (left, padding - left)
                    }
                };
                let repeat = |count: usize| std::iter::repeat(fill).take(count).collect::<String>();
                Value::str(format!("{}{text}{}", repeat(left), repeat(right)))
            }
        }
        "partition" => {
            args.arity(1, 1)?;
            let Some(sep) = str_arg(args, 0, method)? else {
                return throw(ExcKind::TypeError, "must be str, not NoneType");
            };
            if sep.is_empty() {
                return throw(ExcKind::ValueError, "empty separator");
            }
            let parts = match text.split_once(sep.as_ref()) {
                Some((head, tail)) => [head, sep.as_ref(), tail],
                None => [text, "", ""],
            };
            Value::tuple(parts.into_iter().map(Value::str).collect())
        }
        other => {
            return throw(
                ExcKind::AttributeError,
                format!("'str' object has no attribute '{other}'"),
            )
        }
    })
}

fn split_whitespace(text: &str, limit: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = text.trim_start();
    while !rest.is_empty() {
        if parts.len() == limit {
            parts.push(rest.to_string());
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                parts.push(rest[..end].to_string());
                rest = rest[end..].trim_start();
            }
            None => {
                parts.push(rest.to_string());
                break;
            }
        }
    }
    parts
}

fn position_of(items: &[Value], target: &Value) -> Flow<Option<usize>> {
    for (position, item) in items.iter().enumerate() {
        if py_eq(item, target)? {
            return Ok(Some(position));
        }
    }
    Ok(None)
}

fn list_method(
    vm: &mut Vm,
    items: &Arc<ListCell>,
    method: &'static str,
    args: &mut Args,
) -> Flow<Value> {
    Ok(match method {
        "append" => {
            args.arity(1, 1)?;
            lock(items).push(args.first());
            Value::None
        }
        "extend" => {
            args.arity(1, 1)?;
            let extra = materialize(vm, args.get(0))?;
            lock(items).extend(extra);
            Value::None
        }
        "insert" => {
            args.arity(2, 2)?;
            let index = args.first().as_index()?;
            let value = args.get(1).cloned().unwrap_or(Value::None);
            let mut items = lock(items);
            let len = items.len() as i64;
            let position = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(position as usize, value);
            Value::None
        }
        "pop" => {
            args.arity(0, 1)?;
            let index = match args.get(0) {
                Some(index) => index.as_index()?,
                None => -1,
            };
            let mut items = lock(items);
            if items.is_empty() {
                return throw(ExcKind::IndexError, "pop from empty list");
            }
            let Some(position) = normalize_index(index, items.len()) else {
                return throw(ExcKind::IndexError, "pop index out of range");
            };
            items.remove(position)
        }
        "remove" => {
            args.arity(1, 1)?;
            let target = args.first();
            let snapshot = lock(items).clone();
            match position_of(&snapshot, &target)? {
                Some(position) => {
                    let mut items = lock(items);
                    if position < items.len() {
                        items.remove(position);
                    }
                    Value::None
                }
                None => return throw(ExcKind::ValueError, "list.remove(x): x not in list"),
            }
        }
        "index" => {
            args.arity(1, 1)?;
            let target = args.first();
            let snapshot = lock(items).clone();
            match position_of(&snapshot, &target)? {
                Some(position) => Value::Int(position as i64),
                None => {
                    return throw(
                        ExcKind::ValueError,
                        format!("{} is not in list", target.repr()?),
                    )
                }
            }
        }
        "count" => {
            args.arity(1, 1)?;
            let target = args.first();
            let snapshot = lock(items).clone();
            let mut count = 0;
            for item in &snapshot {
                if py_eq(item, &target)? {
                    count += 1;
                }
            }
            Value::Int(count)
        }
        "sort" => {
            args.arity(0, 0)?;
            let key = args.keyword("key");
            let reverse = args.keyword("reverse").is_some_and(|flag| flag.truthy());
            let snapshot = lock(items).clone();
            let sorted = sort_values(vm, snapshot, key.as_ref(), reverse)?;
            *lock(items) = sorted;
            Value::None
        }
        "reverse" => {
            args.arity(0, 0)?;
            lock(items).reverse();
            Value::None
        }
        "clear" => {
            args.arity(0, 0)?;
            lock(items).clear();
            Value::None
        }
        "copy" => {
            args.arity(0, 0)?;
            let copy = lock(items).clone();
            Value::list(copy)
        }
        other => {
            return throw(
                ExcKind::AttributeError,
                format!("'list' object has no attribute '{other}'"),
            )
        }
    })
}

fn dict_method(
    vm: &mut Vm,
    dict: &Arc<DictCell>,
    method: &'static str,
    args: &mut Args,
) -> Flow<Value> {
    Ok(match method {
        "get" => {
            args.arity(1, 2)?;
            let found = lock(dict).get(&args.first())?;
            found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None))
        }
        "keys" => {
            args.arity(0, 0)?;
            let keys = lock(dict).keys();
            Value::list(keys)
        }
        "values" => {
            args.arity(0, 0)?;
            let values = lock(dict).values();
            Value::list(values)
        }
        "items" => {
            args.arity(0, 0)?;
            let items = lock(dict).items();
            Value::list(
                items
                    .into_iter()
                    .map(|(key, value)| Value::tuple(vec![key, value]))
                    .collect(),
            )
        }
        "pop" => {
            args.arity(1, 2)?;
            let key = args.first();
            let removed = lock(dict).remove(&key)?;
            match (removed, args.get(1)) {
                (Some(value), _) => value,
                (None, Some(default)) => default.clone(),
                (None, None) => return Err(exception(ExcKind::KeyError, key.repr()?)),
            }
        }
        "setdefault" => {
            args.arity(1, 2)?;
            let key = args.first();
            let default = args.get(1).cloned().unwrap_or(Value::None);
            let mut dict = lock(dict);
            match dict.get(&key)? {
                Some(existing) => existing,
                None => {
                    dict.insert(key, default.clone())?;
                    default
                }
            }
        }
        "update" => {
            args.arity(0, 1)?;
            let pairs = match args.get(0) {
                None => Vec::new(),
                Some(Value::Dict(other)) => lock(other).items(),
                Some(iterable) => {
                    let mut pairs = Vec::new();
                    for pair in materialize(vm, Some(iterable))? {
                        match pair.iterate()?.as_slice() {
                            [key, value] => pairs.push((key.clone(), value.clone())),
                            _ => {
                                return throw(
                                    ExcKind::ValueError,
                                    "dictionary update sequence element has wrong length",
                                )
                            }
                        }
                    }
                    pairs
                }
            };
            let keywords: Vec<(Value, Value)> = args
                .drain_keywords()
                .into_iter()
                .map(|(key, value)| (Value::Str(key), value))
                .collect();
            let mut dict = lock(dict);
            for (key, value) in pairs.into_iter().chain(keywords) {
                dict.insert(key, value)?;
            }
            Value::None
        }
        "clear" => {
            args.arity(0, 0)?;
            lock(dict).clear();
            Value::None
        }
        "copy" => {
            args.arity(0, 0)?;
            let copy = lock(dict).clone();
            Value::dict(copy)
        }
        other => {
            return throw(
                ExcKind::AttributeError,
                format!("'dict' object has no attribute '{other}'"),
            )
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Dict;

    #[test]
    fn method_tables_by_type() {
        assert!(has_method(&Value::str("x"), "upper"));
        assert!(has_method(&Value::list(vec![]), "append"));
        assert!(has_method(&Value::dict(Dict::new()), "setdefault"));
        assert!(!has_method(&Value::str("x"), "append"));
        assert!(!has_method(&Value::Int(1), "upper"));
    }

    #[test]
    fn whitespace_split_honours_limit() {
        assert_eq!(split_whitespace("  a b\tc  ", usize::MAX), vec!["a", "b", "c"]);
        assert_eq!(split_whitespace("a b c", 1), vec!["a", "b c"]);
        assert!(split_whitespace("   ", usize::MAX).is_empty());
    }
}
