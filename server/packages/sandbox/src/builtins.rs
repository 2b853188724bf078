use std::cmp::Ordering;
use std::sync::Arc;

use crate::ast::BinOp;
use crate::json::{self, DumpOptions};
use crate::value::{lock, py_cmp, throw, Dict, ExcKind, Flow, Interrupt, Num, Range, Value};
use crate::vm::Vm;

const BUILTINS: &[&str] = &[
    "print",
    "len",
    "str",
    "int",
    "float",
    "bool",
    "list",
    "tuple",
    "dict",
    "range",
    "enumerate",
    "zip",
    "sorted",
    "reversed",
    "min",
    "max",
    "sum",
    "abs",
    "round",
    "any",
    "all",
    "repr",
    "isinstance",
];

/// Type names `isinstance` accepts as its second argument.
const TYPE_BUILTINS: &[&str] = &["int", "float", "str", "bool", "list", "tuple", "dict", "range"];

pub(crate) fn lookup(name: &str) -> Option<&'static str> {
    BUILTINS.iter().copied().find(|builtin| *builtin == name)
}

/// Positional and keyword arguments of one builtin call.
pub(crate) struct Args {
    name: &'static str,
    positional: Vec<Value>,
    keywords: Vec<(Arc<str>, Value)>,
}

impl Args {
    pub(crate) fn new(
        name: &'static str,
        positional: Vec<Value>,
        keywords: Vec<(Arc<str>, Value)>,
    ) -> Self {
        Self {
            name,
            positional,
            keywords,
        }
    }

    pub(crate) fn arity(&self, min: usize, max: usize) -> Flow<()> {
        let given = self.positional.len();
        if given < min || given > max {
            let expected = if min == max {
                format!("exactly {min}")
            } else if given < min {
                format!("at least {min}")
            } else {
                format!("at most {max}")
            };
            let plural = if expected.ends_with(" 1") { "" } else { "s" };
            return throw(
                ExcKind::TypeError,
                format!(
                    "{}() takes {expected} argument{plural} ({given} given)",
                    self.name
                ),
            );
        }
        Ok(())
    }

    pub(crate) fn keyword(&mut self, key: &str) -> Option<Value> {
        let position = self
            .keywords
            .iter()
            .position(|(name, _)| name.as_ref() == key)?;
        Some(self.keywords.remove(position).1)
    }

    /// Rejects keyword arguments nobody consumed.
    pub(crate) fn finish(&self) -> Flow<()> {
        match self.keywords.first() {
            Some((key, _)) => throw(
                ExcKind::TypeError,
                format!("{}() got an unexpected keyword argument '{key}'", self.name),
            ),
            None => Ok(()),
        }
    }

    pub(crate) fn drain_keywords(&mut self) -> Vec<(Arc<str>, Value)> {
        std::mem::take(&mut self.keywords)
    }

    pub(crate) fn get(&self, position: usize) -> Option<&Value> {
        self.positional.get(position)
    }

    /// Positional argument `position`, else keyword `key`.
    pub(crate) fn param(&mut self, position: usize, key: &str) -> Option<Value> {
        match self.positional.get(position) {
            Some(value) => Some(value.clone()),
            None => self.keyword(key),
        }
    }

    pub(crate) fn first(&self) -> Value {
        self.positional.first().cloned().unwrap_or(Value::None)
    }
}

pub(crate) fn call(
    vm: &mut Vm,
    name: &'static str,
    args: Vec<Value>,
    kwargs: Vec<(Arc<str>, Value)>,
) -> Flow<Value> {
    let mut args = Args::new(name, args, kwargs);
    let value = match name {
        "print" => print(vm, &mut args)?,
        "len" => {
            args.arity(1, 1)?;
            Value::Int(len(&args.first())? as i64)
        }
        "str" => {
            args.arity(0, 1)?;
            Value::str(args.get(0).map(Value::to_text).transpose()?.unwrap_or_default())
        }
        "repr" => {
            args.arity(1, 1)?;
            Value::str(args.first().repr()?)
        }
        "bool" => {
            args.arity(0, 1)?;
            Value::Bool(args.get(0).is_some_and(Value::truthy))
        }
        "int" => to_int(&mut args)?,
        "float" => {
            args.arity(0, 1)?;
            to_float(args.get(0).unwrap_or(&Value::Float(0.0)))?
        }
        "list" => {
            args.arity(0, 1)?;
            Value::list(materialize(vm, args.get(0))?)
        }
        "tuple" => {
            args.arity(0, 1)?;
            Value::tuple(materialize(vm, args.get(0))?)
        }
        "dict" => to_dict(vm, &mut args)?,
        "range" => range(&args)?,
        "enumerate" => {
            let iterable = args.param(0, "iterable");
            let start = args.param(1, "start");
            args.arity(0, 2)?;
            let Some(iterable) = iterable else {
                return throw(
                    ExcKind::TypeError,
                    "enumerate() missing required argument 'iterable'",
                );
            };
            let start = match start {
                Some(start) => start.as_index()?,
                None => 0,
            };
            let items = materialize(vm, Some(&iterable))?;
            let mut pairs = Vec::with_capacity(items.len());
            for (offset, item) in items.into_iter().enumerate() {
                let index = start.checked_add(offset as i64).ok_or_else(|| {
                    crate::value::exception(ExcKind::OverflowError, "integer overflow")
                })?;
                pairs.push(Value::tuple(vec![Value::Int(index), item]));
            }
            Value::iterator(pairs)
        }
        "zip" => {
            let columns = args
                .positional
                .iter()
                .map(|iterable| materialize(vm, Some(iterable)))
                .collect::<Flow<Vec<_>>>()?;
            let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
            let zipped = (0..rows)
                .map(|row| Value::tuple(columns.iter().map(|column| column[row].clone()).collect()))
                .collect();
            Value::iterator(zipped)
        }
        "sorted" => {
            args.arity(1, 1)?;
            let key = args.keyword("key");
            let reverse = args.keyword("reverse").is_some_and(|flag| flag.truthy());
            let items = materialize(vm, args.get(0))?;
            Value::list(sort_values(vm, items, key.as_ref(), reverse)?)
        }
        "reversed" => {
            args.arity(1, 1)?;
            let mut items = match args.first() {
                Value::Dict(_) | Value::Iterator(_) => {
                    return throw(
                        ExcKind::TypeError,
                        format!("'{}' object is not reversible", args.first().type_name()),
                    )
                }
                other => materialize(vm, Some(&other))?,
            };
            items.reverse();
            Value::iterator(items)
        }
        "min" => extreme(vm, &mut args, Ordering::Less)?,
        "max" => extreme(vm, &mut args, Ordering::Greater)?,
        "sum" => {
            let start = args.param(1, "start");
            args.arity(1, 2)?;
            let mut total = start.unwrap_or(Value::Int(0));
            if matches!(total, Value::Str(_)) {
                return throw(
                    ExcKind::TypeError,
                    "sum() can't sum strings [use ''.join(seq) instead]",
                );
            }
            for item in materialize(vm, args.get(0))? {
                total = vm.binary(BinOp::Add, &total, &item)?;
            }
            total
        }
        "abs" => {
            args.arity(1, 1)?;
            match args.first().as_num() {
                Some(Num::Int(value)) => Value::Int(value.checked_abs().ok_or_else(|| {
                    crate::value::exception(ExcKind::OverflowError, "integer overflow")
                })?),
                Some(Num::Float(value)) => Value::Float(value.abs()),
                None => {
                    return throw(
                        ExcKind::TypeError,
                        format!("bad operand type for abs(): '{}'", args.first().type_name()),
                    )
                }
            }
        }
        "round" => {
            let digits = args.param(1, "ndigits");
            args.arity(1, 2)?;
            round(&args.first(), digits)?
        }
        "any" => {
            args.arity(1, 1)?;
            Value::Bool(materialize(vm, args.get(0))?.iter().any(Value::truthy))
        }
        "all" => {
            args.arity(1, 1)?;
            Value::Bool(materialize(vm, args.get(0))?.iter().all(Value::truthy))
        }
        "isinstance" => {
            args.arity(2, 2)?;
            let (Some(value), Some(kind)) = (args.get(0), args.get(1)) else {
                return throw(ExcKind::TypeError, "isinstance expected 2 arguments");
            };
            Value::Bool(is_instance(value, kind)?)
        }
        "json.dumps" => {
            args.arity(1, 1)?;
            let options = dump_options(&mut args)?;
            args.finish()?;
            let value = args.first();
            vm.charge(value.size_hint() / 8)?;
            return Ok(Value::str(json::dumps(&value, &options)?));
        }
        "json.loads" => {
            args.arity(1, 1)?;
            let Value::Str(text) = args.first() else {
                return throw(
                    ExcKind::TypeError,
                    format!(
                        "the JSON object must be str, not {}",
                        args.first().type_name()
                    ),
                );
            };
            vm.charge(text.len() / 64)?;
            json::loads(&text)?
        }
        other => return throw(ExcKind::NameError, format!("name '{other}' is not defined")),
    };
    args.finish()?;
    Ok(value)
}

fn print(vm: &mut Vm, args: &mut Args) -> Flow<Value> {
    let text_keyword = |value: Option<Value>, default: &str, key: &str| -> Flow<String> {
        match value {
            None | Some(Value::None) => Ok(default.to_string()),
            Some(Value::Str(text)) => Ok(text.to_string()),
            Some(other) => throw(
                ExcKind::TypeError,
                format!("{key} must be None or a string, not {}", other.type_name()),
            ),
        }
    };
    let sep = text_keyword(args.keyword("sep"), " ", "sep")?;
    let end = text_keyword(args.keyword("end"), "\n", "end")?;
    let mut line = args
        .positional
        .iter()
        .map(Value::to_text)
        .collect::<Flow<Vec<_>>>()?
        .join(&sep);
    line.push_str(&end);
    vm.write_output(&line);
    Ok(Value::None)
}

pub(crate) fn len(value: &Value) -> Flow<usize> {
    match value {
        Value::Str(text) => Ok(text.chars().count()),
        Value::List(items) => Ok(lock(items).len()),
        Value::Tuple(items) => Ok(items.len()),
        Value::Dict(dict) => Ok(lock(dict).len()),
        Value::Range(range) => Ok(range.len()),
        other => throw(
            ExcKind::TypeError,
            format!("object of type '{}' has no len()", other.type_name()),
        ),
    }
}

/// Collects an iterable, charging the step budget for its size.
pub(crate) fn materialize(vm: &mut Vm, value: Option<&Value>) -> Flow<Vec<Value>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    vm.charge(value.size_hint() / 8)?;
    value.iterate()
}

fn to_int(args: &mut Args) -> Flow<Value> {
    let base = args.param(1, "base");
    args.arity(0, 2)?;
    let value = args.first();
    if let Some(base) = base {
        let base = base.as_index()?;
        let Value::Str(text) = &value else {
            return throw(
                ExcKind::TypeError,
                "int() can't convert non-string with explicit base",
            );
        };
        if !(2..=36).contains(&base) {
            return throw(ExcKind::ValueError, "int() base must be >= 2 and <= 36");
        }
        return parse_int(text, base as u32);
    }
    match value {
        Value::None if args.get(0).is_none() => Ok(Value::Int(0)),
        Value::Bool(flag) => Ok(Value::Int(flag as i64)),
        Value::Int(number) => Ok(Value::Int(number)),
        Value::Float(number) => {
            if number.is_nan() {
                return throw(ExcKind::ValueError, "cannot convert float NaN to integer");
            }
            if number.is_infinite() {
                return throw(
                    ExcKind::OverflowError,
                    "cannot convert float infinity to integer",
                );
            }
            let truncated = number.trunc();
            if truncated.abs() >= 9.223_372_036_854_776e18 {
                return throw(ExcKind::OverflowError, "integer overflow");
            }
            Ok(Value::Int(truncated as i64))
        }
        Value::Str(text) => parse_int(&text, 10),
        other => throw(
            ExcKind::TypeError,
            format!(
                "int() argument must be a string or a number, not '{}'",
                other.type_name()
            ),
        ),
    }
}

fn parse_int(text: &str, base: u32) -> Flow<Value> {
    let cleaned: String = text.trim().chars().filter(|c| *c != '_').collect();
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.strip_prefix('+').unwrap_or(&cleaned)),
    };
    let parsed = if digits.is_empty() || digits.starts_with(['+', '-']) {
        None
    } else {
        i64::from_str_radix(digits, base)
            .ok()
            .and_then(|number| if negative { number.checked_neg() } else { Some(number) })
    };
    match parsed {
        Some(number) => Ok(Value::Int(number)),
        None => throw(
            ExcKind::ValueError,
            format!(
                "invalid literal for int() with base {base}: {}",
                crate::value::str_repr(text)
            ),
        ),
    }
}

fn to_float(value: &Value) -> Flow<Value> {
    match value {
        Value::Bool(flag) => Ok(Value::Float(*flag as i64 as f64)),
        Value::Int(number) => Ok(Value::Float(*number as f64)),
        Value::Float(number) => Ok(Value::Float(*number)),
        Value::Str(text) => {
            let cleaned: String = text.trim().chars().filter(|c| *c != '_').collect();
            match cleaned.parse::<f64>() {
                Ok(number) => Ok(Value::Float(number)),
                Err(_) => throw(
                    ExcKind::ValueError,
                    format!(
                        "could not convert string to float: {}",
                        crate::value::str_repr(text)
                    ),
                ),
            }
        }
        other => throw(
            ExcKind::TypeError,
            format!(
                "float() argument must be a string or a real number, not '{}'",
                other.type_name()
            ),
        ),
    }
}

fn to_dict(vm: &mut Vm, args: &mut Args) -> Flow<Value> {
    args.arity(0, 1)?;
    let mut dict = match args.get(0) {
        None => Dict::new(),
        Some(Value::Dict(source)) => lock(source).clone(),
        Some(iterable) => {
            let mut dict = Dict::new();
            for (position, pair) in materialize(vm, Some(iterable))?.into_iter().enumerate() {
                let items = pair.iterate().map_err(|_| {
                    crate::value::exception(
                        ExcKind::TypeError,
                        format!(
                            "cannot convert dictionary update sequence element #{position} \
                             to a sequence"
                        ),
                    )
                })?;
                let [key, value] = <[Value; 2]>::try_from(items).map_err(|items| {
                    crate::value::exception(
                        ExcKind::ValueError,
                        format!(
                            "dictionary update sequence element #{position} has length {}; \
                             2 is required",
                            items.len()
                        ),
                    )
                })?;
                dict.insert(key, value)?;
            }
            dict
        }
    };
    for (key, value) in args.drain_keywords() {
        dict.insert(Value::Str(key), value)?;
    }
    Ok(Value::dict(dict))
}

fn range(args: &Args) -> Flow<Value> {
    args.arity(1, 3)?;
    let bounds = args
        .positional
        .iter()
        .map(Value::as_index)
        .collect::<Flow<Vec<_>>>()?;
    let (start, stop, step) = match bounds.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => (0, 0, 1),
    };
    if step == 0 {
        return throw(ExcKind::ValueError, "range() arg 3 must not be zero");
    }
    Ok(Value::Range(Range { start, stop, step }))
}

/// Stable sort with Python's `key=` and `reverse=` semantics.
pub(crate) fn sort_values(
    vm: &mut Vm,
    items: Vec<Value>,
    key: Option<&Value>,
    reverse: bool,
) -> Flow<Vec<Value>> {
    vm.charge(items.len())?;
    let keys = match key {
        Some(Value::None) | None => items.clone(),
        Some(function) => items
            .iter()
            .map(|item| vm.call_nested(function, vec![item.clone()]))
            .collect::<Flow<Vec<_>>>()?,
    };
    let mut order: Vec<usize> = (0..items.len()).collect();
    let mut failure: Option<Interrupt> = None;
    order.sort_by(|a, b| {
        let (left, right) = if reverse { (b, a) } else { (a, b) };
        match py_cmp(&keys[*left], &keys[*right]) {
            Ok(ordering) => ordering,
            Err(err) => {
                failure.get_or_insert(err);
                Ordering::Equal
            }
        }
    });
    if let Some(err) = failure {
        return Err(err);
    }
    Ok(order.into_iter().map(|index| items[index].clone()).collect())
}

/// `min` / `max`: `wanted` is the ordering that makes a candidate win.
fn extreme(vm: &mut Vm, args: &mut Args, wanted: Ordering) -> Flow<Value> {
    let key = args.keyword("key").filter(|key| !matches!(key, Value::None));
    let default = args.keyword("default");
    args.finish()?;
    let items = match args.positional.len() {
        0 => {
            return throw(
                ExcKind::TypeError,
                format!("{} expected at least 1 argument, got 0", args.name),
            )
        }
        1 => materialize(vm, args.get(0))?,
        _ => {
            if default.is_some() {
                return throw(
                    ExcKind::TypeError,
                    format!(
                        "Cannot specify a default for {}() with multiple positional arguments",
                        args.name
                    ),
                );
            }
            args.positional.clone()
        }
    };
    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let rank = match &key {
            Some(function) => vm.call_nested(function, vec![item.clone()])?,
            None => item.clone(),
        };
        let replace = match &best {
            None => true,
            Some((_, best_rank)) => py_cmp(&rank, best_rank)? == wanted,
        };
        if replace {
            best = Some((item, rank));
        }
    }
    match (best, default) {
        (Some((item, _)), _) => Ok(item),
        (None, Some(default)) => Ok(default),
        (None, None) => throw(
            ExcKind::ValueError,
            format!("{}() arg is an empty sequence", args.name),
        ),
    }
}

fn round_half_even(value: f64) -> f64 {
    let rounded = value.round();
    if (value - value.trunc()).abs() == 0.5 {
        2.0 * (value / 2.0).round()
    } else {
        rounded
    }
}

/// Largest and smallest `ndigits` that can change a float.
const ROUND_DIGITS_MAX: i64 = 323;
const ROUND_DIGITS_MIN: i64 = -308;

fn round(value: &Value, digits: Option<Value>) -> Flow<Value> {
    let digits = match digits {
        None | Some(Value::None) => None,
        Some(digits) => Some(digits.as_index()?),
    };
    match (value.as_num(), digits) {
        (Some(Num::Int(number)), None) => Ok(Value::Int(number)),
        (Some(Num::Int(number)), Some(digits)) => round_int(number, digits),
        (Some(Num::Float(number)), None) => {
            if number.is_nan() {
                return throw(ExcKind::ValueError, "cannot convert float NaN to integer");
            }
            if number.is_infinite() {
                return throw(
                    ExcKind::OverflowError,
                    "cannot convert float infinity to integer",
                );
            }
            let rounded = round_half_even(number);
            if rounded.abs() >= 9.223_372_036_854_776e18 {
                return throw(ExcKind::OverflowError, "integer overflow");
            }
            Ok(Value::Int(rounded as i64))
        }
        (Some(Num::Float(number)), Some(digits)) => round_float(number, digits).map(Value::Float),
        (None, _) => throw(
            ExcKind::TypeError,
            format!(
                "type {} doesn't define __round__ method",
                value.type_name()
            ),
        ),
    }
}

fn round_int(number: i64, digits: i64) -> Flow<Value> {
    if digits >= 0 {
        return Ok(Value::Int(number));
    }
    // Every i64 is below 10^19, so coarser rounding always lands on zero.
    let exponent = digits.checked_neg().unwrap_or(i64::MAX);
    if exponent > 19 {
        return Ok(Value::Int(0));
    }
    let scale = 10i128.pow(exponent as u32);
    let number = i128::from(number);
    let quotient = number.div_euclid(scale);
    let round_up = match (number.rem_euclid(scale) * 2).cmp(&scale) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => quotient % 2 != 0,
    };
    let rounded = (quotient + i128::from(round_up)) * scale;
    match i64::try_from(rounded) {
        Ok(rounded) => Ok(Value::Int(rounded)),
        Err(_) => throw(ExcKind::OverflowError, "integer overflow"),
    }
}

/// Rounds the exact binary value half to even, so `round(2.675, 2)` is 2.67.
fn round_float(number: f64, digits: i64) -> Flow<f64> {
    if !number.is_finite() || digits > ROUND_DIGITS_MAX {
        return Ok(number);
    }
    if digits < ROUND_DIGITS_MIN {
        return Ok(0.0 * number);
    }
    if digits >= 0 {
        let text = format!("{:.*}", digits as usize, number);
        return Ok(text.parse().unwrap_or(number));
    }
    let scale = 10f64.powi(-digits as i32);
    let rounded = round_half_even(number / scale) * scale;
    if !rounded.is_finite() {
        return throw(ExcKind::OverflowError, "rounded value too large to represent");
    }
    Ok(rounded)
}

fn is_instance(value: &Value, kind: &Value) -> Flow<bool> {
    match kind {
        Value::Tuple(kinds) => {
            for kind in kinds.iter() {
                if is_instance(value, kind)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::ExceptionType(kind) => Ok(match value {
            Value::Exception(exc) => exc.kind.is_subclass_of(*kind),
            _ => false,
        }),
        Value::Builtin(name) if TYPE_BUILTINS.contains(name) => Ok(match (*name, value) {
            ("int", Value::Bool(_)) => true,
            (name, value) => value.type_name() == name,
        }),
        _ => throw(
            ExcKind::TypeError,
            "isinstance() arg 2 must be a type or tuple of types",
        ),
    }
}

fn dump_options(args: &mut Args) -> Flow<DumpOptions> {
    let mut options = DumpOptions::default();
    match args.keyword("indent") {
        None | Some(Value::None) => {}
        Some(Value::Str(text)) => options.indent = Some(text.to_string()),
        Some(value) => options.indent = Some(" ".repeat(value.as_index()?.max(0) as usize)),
    }
    if let Some(flag) = args.keyword("sort_keys") {
        options.sort_keys = flag.truthy();
    }
    if let Some(flag) = args.keyword("ensure_ascii") {
        options.ensure_ascii = flag.truthy();
    }
    match args.keyword("separators") {
        None | Some(Value::None) => {}
        Some(value) => {
            let parts = value.iterate()?;
            match parts.as_slice() {
                [Value::Str(item), Value::Str(key)] => {
                    options.item_separator = item.to_string();
                    options.key_separator = key.to_string();
                }
                _ => {
                    return throw(
                        ExcKind::TypeError,
                        "separators must be a pair of strings",
                    )
                }
            }
        }
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_uses_bankers_rounding() {
        assert!(matches!(round(&Value::Float(2.5), None).ok(), Some(Value::Int(2))));
        assert!(matches!(round(&Value::Float(3.5), None).ok(), Some(Value::Int(4))));
        assert!(matches!(round(&Value::Float(-2.5), None).ok(), Some(Value::Int(-2))));
        assert_eq!(round_float(1.2345, 2).ok(), Some(1.23));
        assert!(matches!(
            round(&Value::Int(1250), Some(Value::Int(-2))).ok(),
            Some(Value::Int(1200))
        ));
        assert!(matches!(round_int(-1250, -2).ok(), Some(Value::Int(-1200))));
        assert!(matches!(round_int(-1350, -2).ok(), Some(Value::Int(-1400))));
    }

    #[test]
    fn round_follows_the_decimal_value_of_floats() {
        assert_eq!(round_float(2.675, 2).ok(), Some(2.67));
        assert_eq!(round_float(0.125, 2).ok(), Some(0.12));
        assert_eq!(round_float(0.375, 2).ok(), Some(0.38));
        assert_eq!(round_float(1234.5, -1).ok(), Some(1230.0));
        assert_eq!(round_float(1.5, 400).ok(), Some(1.5));
        assert_eq!(round_float(1e300, -400).ok(), Some(0.0));
    }

    #[test]
    fn round_rejects_out_of_range_results() {
        let kind = |result: Flow<Value>| match result {
            Err(Interrupt::Raise(exc)) => Some(exc.kind),
            _ => None,
        };
        assert!(matches!(round_int(5, i64::MIN).ok(), Some(Value::Int(0))));
        assert!(matches!(round_int(4_000_000_000_000_000_000, -19).ok(), Some(Value::Int(0))));
        assert_eq!(kind(round_int(i64::MAX, -19)), Some(ExcKind::OverflowError));
        assert_eq!(kind(round_int(9_000_000_000_000_000_000, -19)), Some(ExcKind::OverflowError));
        assert_eq!(kind(round(&Value::Float(1e300), None)), Some(ExcKind::OverflowError));
        assert_eq!(kind(round(&Value::Float(f64::NAN), None)), Some(ExcKind::ValueError));
    }

    #[test]
    fn int_parsing() {
        assert!(matches!(parse_int(" 42 ", 10).ok(), Some(Value::Int(42))));
        assert!(matches!(parse_int("-ff", 16).ok(), Some(Value::Int(-255))));
        assert!(matches!(parse_int("1_000", 10).ok(), Some(Value::Int(1000))));
        assert!(parse_int("4.5", 10).is_err());
        assert!(parse_int("--1", 10).is_err());
    }

    #[test]
    fn isinstance_treats_bool_as_int() {
        assert!(matches!(is_instance(&Value::Bool(true), &Value::Builtin("int")), Ok(true)));
        assert!(matches!(is_instance(&Value::Int(1), &Value::Builtin("bool")), Ok(false)));
        let kinds = Value::tuple(vec![Value::Builtin("str"), Value::Builtin("list")]);
        assert!(matches!(is_instance(&Value::list(vec![]), &kinds), Ok(true)));
        assert!(is_instance(&Value::Int(1), &Value::Int(2)).is_err());
    }

    #[test]
    fn range_rejects_zero_step() {
        let args = Args::new(
            "range",
            vec![Value::Int(0), Value::Int(5), Value::Int(0)],
            Vec::new(),
        );
        assert!(range(&args).is_err());
    }
}
