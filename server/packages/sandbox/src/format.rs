use crate::value::{float_repr, lock, throw, ExcKind, Flow, Num, Value};

/// Step meter for work proportional to a requested width or precision.
pub(crate) type Charge<'a> = &'a mut dyn FnMut(usize) -> Flow<()>;

/// Parsed `[[fill]align][sign][0][width][,][.precision][type]`.
#[derive(Debug, Default)]
struct Spec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    zero: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

fn parse_spec(spec: &str) -> Flow<Spec> {
    let chars: Vec<char> = spec.chars().collect();
    let mut parsed = Spec::default();
    let mut i = 0;
    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
    if chars.len() >= 2 && is_align(chars[1]) {
        parsed.fill = Some(chars[0]);
        parsed.align = Some(chars[1]);
        i = 2;
    } else if chars.first().copied().is_some_and(is_align) {
        parsed.align = Some(chars[0]);
        i = 1;
    }
    if let Some(&c) = chars.get(i) {
        if matches!(c, '+' | '-' | ' ') {
            parsed.sign = Some(c);
            i += 1;
        }
    }
    if chars.get(i) == Some(&'#') {
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        parsed.zero = true;
        i += 1;
    }
    let mut width = String::new();
    while let Some(c) = chars.get(i).filter(|c| c.is_ascii_digit()) {
        width.push(*c);
        i += 1;
    }
    parsed.width = width.parse().unwrap_or(0);
    if let Some(&c) = chars.get(i) {
        if c == ',' || c == '_' {
            parsed.grouping = Some(c);
            i += 1;
        }
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        let mut precision = String::new();
        while let Some(c) = chars.get(i).filter(|c| c.is_ascii_digit()) {
            precision.push(*c);
            i += 1;
        }
        if precision.is_empty() {
            return throw(ExcKind::ValueError, "Format specifier missing precision");
        }
        parsed.precision = precision.parse().ok();
    }
    match &chars[i.min(chars.len())..] {
        [] => {}
        [kind] => parsed.kind = Some(*kind),
        _ => return throw(ExcKind::ValueError, "Invalid format specifier"),
    }
    Ok(parsed)
}

/// `format(value, spec)` as used by f-string fields and `str.format`.
pub fn format_value(value: &Value, spec: &str, charge: Charge<'_>) -> Flow<String> {
    if spec.is_empty() {
        return value.to_text();
    }
    let spec = parse_spec(spec)?;
    charge(spec.width.saturating_add(spec.precision.unwrap_or(0)) / 64)?;
    let unknown = |type_name: &str| {
        throw(
            ExcKind::ValueError,
            format!(
                "Unknown format code '{}' for object of type '{type_name}'",
                spec.kind.unwrap_or(' ')
            ),
        )
    };

    match value {
        Value::Str(text) => {
            if !matches!(spec.kind, None | Some('s')) {
                return unknown("str");
            }
            let mut text = text.to_string();
            if let Some(precision) = spec.precision {
                text = text.chars().take(precision).collect();
            }
            Ok(pad(&spec, String::new(), text, '<'))
        }
        Value::Int(_) | Value::Bool(_) | Value::Float(_) => {
            let Some(number) = value.as_num() else {
                return unknown(value.type_name());
            };
            format_number(&spec, number, value.type_name())
        }
        other => {
            if spec.kind.is_some() || spec.precision.is_some() {
                return throw(
                    ExcKind::TypeError,
                    format!(
                        "unsupported format string passed to {}.__format__",
                        other.type_name()
                    ),
                );
            }
            Ok(pad(&spec, String::new(), other.to_text()?, '<'))
        }
    }
}

fn format_number(spec: &Spec, number: Num, type_name: &str) -> Flow<String> {
    let negative = match number {
        Num::Int(value) => value < 0,
        Num::Float(value) => value.is_sign_negative() && value != 0.0,
    };
    let body = match (spec.kind, number) {
        (None | Some('d') | Some('n'), Num::Int(value))
            if spec.precision.is_none() || spec.kind.is_some() =>
        {
            group(&value.unsigned_abs().to_string(), spec.grouping)
        }
        (Some('x'), Num::Int(value)) => format!("{:x}", value.unsigned_abs()),
        (Some('X'), Num::Int(value)) => format!("{:X}", value.unsigned_abs()),
        (Some('o'), Num::Int(value)) => format!("{:o}", value.unsigned_abs()),
        (Some('b'), Num::Int(value)) => format!("{:b}", value.unsigned_abs()),
        (Some('d' | 'n' | 'x' | 'X' | 'o' | 'b'), Num::Float(_)) => {
            return throw(
                ExcKind::ValueError,
                format!(
                    "Unknown format code '{}' for object of type '{type_name}'",
                    spec.kind.unwrap_or(' ')
                ),
            )
        }
        (Some('f' | 'F'), number) => {
            let precision = spec.precision.unwrap_or(6);
            fixed(number.as_f64().abs(), precision, spec.grouping)
        }
        (Some('%'), number) => {
            let precision = spec.precision.unwrap_or(6);
            format!(
                "{}%",
                fixed(number.as_f64().abs() * 100.0, precision, spec.grouping)
            )
        }
        (Some('e' | 'E'), number) => {
            let text = exponent(number.as_f64().abs(), spec.precision.unwrap_or(6));
            if spec.kind == Some('E') {
                text.to_uppercase()
            } else {
                text
            }
        }
        (Some('g' | 'G'), number) => general(number.as_f64().abs(), spec.precision.unwrap_or(6)),
        (None, Num::Float(value)) => match spec.precision {
            Some(precision) => general(value.abs(), precision),
            None => {
                let text = float_repr(value.abs());
                match text.split_once('.') {
                    Some((whole, fraction)) if spec.grouping.is_some() => {
                        format!("{}.{fraction}", group(whole, spec.grouping))
                    }
                    _ => text,
                }
            }
        },
        (None, Num::Int(value)) => {
            general(value.unsigned_abs() as f64, spec.precision.unwrap_or(6))
        }
        (Some(kind), _) => {
            return throw(
                ExcKind::ValueError,
                format!("Unknown format code '{kind}' for object of type '{type_name}'"),
            )
        }
    };
    let sign = if negative {
        "-".to_string()
    } else {
        match spec.sign {
            Some('+') => "+".to_string(),
            Some(' ') => " ".to_string(),
            _ => String::new(),
        }
    };
    Ok(pad(spec, sign, body, '>'))
}

fn fixed(value: f64, precision: usize, grouping: Option<char>) -> String {
    if !value.is_finite() {
        return float_repr(value);
    }
    let text = format!("{value:.precision$}");
    match text.split_once('.') {
        Some((whole, fraction)) => format!("{}.{fraction}", group(whole, grouping)),
        None => group(&text, grouping),
    }
}

fn exponent(value: f64, precision: usize) -> String {
    if !value.is_finite() {
        return float_repr(value);
    }
    let text = format!("{value:.precision$e}");
    let (mantissa, exp) = text.split_once('e').unwrap_or((&text, "0"));
    let (sign, digits) = match exp.strip_prefix('-') {
        Some(digits) => ('-', digits),
        None => ('+', exp),
    };
    format!("{mantissa}e{sign}{digits:0>2}")
}

/// `g` presentation: shortest of fixed and exponent with trailing zeros removed.
fn general(value: f64, precision: usize) -> String {
    if !value.is_finite() {
        return float_repr(value);
    }
    let precision = precision.max(1);
    if value == 0.0 {
        return "0".to_string();
    }
    let exp = value.abs().log10().floor() as i32;
    let strip = |text: String| -> String {
        if text.contains('.') {
            text.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            text
        }
    };
    if exp < -4 || exp >= precision as i32 {
        let text = exponent(value, precision - 1);
        let (mantissa, exp) = text.split_once('e').unwrap_or((&text, ""));
        format!("{}e{exp}", strip(mantissa.to_string()))
    } else {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        strip(format!("{value:.decimals$}"))
    }
}

fn group(digits: &str, separator: Option<char>) -> String {
    let Some(separator) = separator else {
        return digits.to_string();
    };
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (position, c) in digits.chars().enumerate() {
        if position > 0 && (digits.len() - position) % 3 == 0 {
            out.push(separator);
        }
        out.push(c);
    }
    out
}

fn pad(spec: &Spec, sign: String, body: String, default_align: char) -> String {
    let (fill, align) = if spec.zero && spec.align.is_none() {
        ('0', '=')
    } else {
        (spec.fill.unwrap_or(' '), spec.align.unwrap_or(default_align))
    };
    let len = sign.chars().count() + body.chars().count();
    if len >= spec.width {
        return format!("{sign}{body}");
    }
    let padding = spec.width - len;
    let fill_str = |count: usize| std::iter::repeat(fill).take(count).collect::<String>();
    match align {
        '<' => format!("{sign}{body}{}", fill_str(padding)),
        '^' => format!(
            "{}{sign}{body}{}",
            fill_str(padding / 2),
            fill_str(padding - padding / 2)
        ),
        '=' => format!("{sign}{}{body}", fill_str(padding)),
        _ => format!("{}{sign}{body}", fill_str(padding)),
    }
}

/// `template % args`.
pub fn percent_format(template: &str, args: &Value, charge: Charge<'_>) -> Flow<String> {
    let positional: Vec<Value> = match args {
        Value::Tuple(items) => items.to_vec(),
        Value::Dict(_) => Vec::new(),
        other => vec![other.clone()],
    };
    let mapping = match args {
        Value::Dict(dict) => Some(lock(dict).clone()),
        _ => None,
    };
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut next = 0;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut value = None;
        if chars.get(i) == Some(&'(') {
            let close = chars[i..]
                .iter()
                .position(|c| *c == ')')
                .map(|offset| i + offset);
            let Some(close) = close else {
                return throw(ExcKind::ValueError, "incomplete format key");
            };
            let key: String = chars[i + 1..close].iter().collect();
            i = close + 1;
            let Some(mapping) = &mapping else {
                return throw(ExcKind::TypeError, "format requires a mapping");
            };
            match mapping.get(&Value::str(&key))? {
                Some(found) => value = Some(found),
                None => return throw(ExcKind::KeyError, crate::value::str_repr(&key)),
            }
        }
        let mut flags = String::new();
        while let Some(&flag) = chars.get(i).filter(|c| matches!(c, '-' | '+' | ' ' | '0' | '#')) {
            flags.push(flag);
            i += 1;
        }
        let mut width = String::new();
        while let Some(&digit) = chars.get(i).filter(|c| c.is_ascii_digit()) {
            width.push(digit);
            i += 1;
        }
        let mut precision = None;
        if chars.get(i) == Some(&'.') {
            i += 1;
            let mut digits = String::new();
            while let Some(&digit) = chars.get(i).filter(|c| c.is_ascii_digit()) {
                digits.push(digit);
                i += 1;
            }
            precision = Some(digits.parse::<usize>().unwrap_or(0));
        }
        let Some(&kind) = chars.get(i) else {
            return throw(ExcKind::ValueError, "incomplete format");
        };
        i += 1;
        if kind == '%' {
            out.push('%');
            continue;
        }
        let value = match value {
            Some(value) => value,
            None => {
                let Some(value) = positional.get(next) else {
                    return throw(ExcKind::TypeError, "not enough arguments for format string");
                };
                next += 1;
                value.clone()
            }
        };

        let mut spec = String::new();
        if flags.contains('-') {
            spec.push('<');
        } else if matches!(kind, 's' | 'r' | 'a') {
            spec.push('>');
        }
        if flags.contains('+') {
            spec.push('+');
        } else if flags.contains(' ') {
            spec.push(' ');
        }
        if flags.contains('0') && !flags.contains('-') && !matches!(kind, 's' | 'r' | 'a') {
            spec.push('0');
        }
        spec.push_str(&width);
        let rendered = match kind {
            's' => format_value(&Value::str(value.to_text()?), &spec, charge)?,
            'r' | 'a' => format_value(&Value::str(value.repr()?), &spec, charge)?,
            'd' | 'i' | 'u' => {
                let number = match value.as_num() {
                    Some(Num::Int(number)) => number,
                    Some(Num::Float(number)) => number.trunc() as i64,
                    None => {
                        return throw(
                            ExcKind::TypeError,
                            format!(
                                "%{kind} format: a real number is required, not {}",
                                value.type_name()
                            ),
                        )
                    }
                };
                spec.push('d');
                format_value(&Value::Int(number), &spec, charge)?
            }
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'x' | 'X' | 'o' => {
                if value.as_num().is_none() {
                    return throw(
                        ExcKind::TypeError,
                        format!(
                            "%{kind} format: a real number is required, not {}",
                            value.type_name()
                        ),
                    );
                }
                if let Some(precision) = precision {
                    spec.push_str(&format!(".{precision}"));
                }
                spec.push(kind);
                format_value(&value, &spec, charge)?
            }
            other => {
                return throw(
                    ExcKind::ValueError,
                    format!("unsupported format character '{other}'"),
                )
            }
        };
        out.push_str(&rendered);
    }
    if mapping.is_none() && next < positional.len() {
        return throw(
            ExcKind::TypeError,
            "not all arguments converted during string formatting",
        );
    }
    Ok(out)
}

/// `template.format(*args, **kwargs)`.
pub fn str_format(
    template: &str,
    args: &[Value],
    kwargs: &[(std::sync::Arc<str>, Value)],
    charge: Charge<'_>,
) -> Flow<String> {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut auto_index = 0;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '{' && chars.get(i + 1) == Some(&'{') {
            out.push('{');
            i += 2;
            continue;
        }
        if c == '}' && chars.get(i + 1) == Some(&'}') {
            out.push('}');
            i += 2;
            continue;
        }
        if c == '}' {
            return throw(ExcKind::ValueError, "Single '}' encountered in format string");
        }
        if c != '{' {
            out.push(c);
            i += 1;
            continue;
        }
        let Some(close) = chars[i..].iter().position(|c| *c == '}').map(|offset| i + offset) else {
            return throw(ExcKind::ValueError, "Single '{' encountered in format string");
        };
        let field: String = chars[i + 1..close].iter().collect();
        i = close + 1;

        let (name, rest) = match field.find(['!', ':']) {
            Some(position) => field.split_at(position),
            None => (field.as_str(), ""),
        };
        let (conversion, spec) = match rest.strip_prefix('!') {
            Some(after) => {
                let mut parts = after.splitn(2, ':');
                let conversion = parts.next().and_then(|conv| conv.chars().next());
                (conversion, parts.next().unwrap_or(""))
            }
            None => (None, rest.strip_prefix(':').unwrap_or("")),
        };

        let value = if name.is_empty() {
            let value = args.get(auto_index).cloned();
            auto_index += 1;
            value.ok_or_else(|| {
                crate::value::exception(
                    ExcKind::IndexError,
                    "Replacement index out of range for positional args tuple",
                )
            })?
        } else if let Ok(position) = name.parse::<usize>() {
            args.get(position).cloned().ok_or_else(|| {
                crate::value::exception(
                    ExcKind::IndexError,
                    format!("Replacement index {position} out of range for positional args tuple"),
                )
            })?
        } else {
            kwargs
                .iter()
                .find(|(key, _)| key.as_ref() == name)
                .map(|(_, value)| value.clone())
                .ok_or_else(|| {
                    crate::value::exception(ExcKind::KeyError, crate::value::str_repr(name))
                })?
        };
        let value = match conversion {
            Some('r') | Some('a') => Value::str(value.repr()?),
            Some('s') => Value::str(value.to_text()?),
            Some(other) => {
                return throw(
                    ExcKind::ValueError,
                    format!("Unknown conversion specifier {other}"),
                )
            }
            None => value,
        };
        out.push_str(&format_value(&value, spec, charge)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(value: Value, spec: &str) -> String {
        format_value(&value, spec, &mut |_| Ok(())).unwrap_or_else(|_| panic!("format {spec}"))
    }

    #[test]
    fn number_specs() {
        assert_eq!(fmt(Value::Float(3.14159), ".2f"), "3.14");
        assert_eq!(fmt(Value::Int(42), "05d"), "00042");
        assert_eq!(fmt(Value::Int(-42), "05d"), "-0042");
        assert_eq!(fmt(Value::Int(1234567), ","), "1,234,567");
        assert_eq!(fmt(Value::Float(0.256), ".1%"), "25.6%");
        assert_eq!(fmt(Value::Int(255), "x"), "ff");
        assert_eq!(fmt(Value::Int(5), "+d"), "+5");
        assert_eq!(fmt(Value::Float(1234.5), ",.2f"), "1,234.50");
        assert_eq!(fmt(Value::Float(12345.678), "e"), "1.234568e+04");
    }

    #[test]
    fn alignment_specs() {
        assert_eq!(fmt(Value::str("ab"), ">5"), "   ab");
        assert_eq!(fmt(Value::str("ab"), "*^6"), "**ab**");
        assert_eq!(fmt(Value::str("ab"), "5"), "ab   ");
        assert_eq!(fmt(Value::Int(7), "<3"), "7  ");
        assert_eq!(fmt(Value::str("abcdef"), ".3"), "abc");
    }

    #[test]
    fn general_format() {
        assert_eq!(fmt(Value::Float(0.5), "g"), "0.5");
        assert_eq!(fmt(Value::Float(1234567.0), "g"), "1.23457e+06");
        assert_eq!(fmt(Value::Float(2.0), ".3"), "2");
    }

    #[test]
    fn percent_formatting() {
        let args = Value::tuple(vec![Value::str("x"), Value::Int(3), Value::Float(0.5)]);
        let text = percent_format("%s=%d (%.2f) 100%%", &args, &mut |_| Ok(())).unwrap_or_default();
        assert_eq!(text, "x=3 (0.50) 100%");
        assert!(percent_format("%s %s", &Value::str("only"), &mut |_| Ok(())).is_err());
    }

    #[test]
    fn str_format_fields() {
        let args = vec![Value::str("a"), Value::Int(2)];
        let kwargs = vec![(std::sync::Arc::from("name"), Value::str("z"))];
        let text = str_format("{} {}! {name!r} {1:>3} {{}}", &args, &kwargs, &mut |_| Ok(()))
            .unwrap_or_default();
        assert_eq!(text, "a 2! 'z'   2 {}");
    }

    #[test]
    fn width_and_precision_are_charged_before_padding() {
        let mut charged = 0;
        let text = format_value(&Value::Int(1), ">640", &mut |units| {
            charged += units;
            Ok(())
        })
        .unwrap_or_default();
        assert_eq!(text.len(), 640);
        assert_eq!(charged, 10);

        let refused = format_value(&Value::Int(1), ">999999999999", &mut |units| {
            if units > 1_000_000 {
                throw(ExcKind::RuntimeError, "over budget")
            } else {
                Ok(())
            }
        });
        assert!(refused.is_err());
    }
}
