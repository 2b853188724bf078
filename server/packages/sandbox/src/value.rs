use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use acp_bridge_error::SandboxError;
use serde_json::{Map, Number, Value as Json};

use crate::compiler::Code;

/// Nesting limit for repr, equality, ordering, hashing and JSON conversion.
const MAX_DEPTH: usize = 64;

fn too_deep<T>(what: &str) -> Flow<T> {
    throw(ExcKind::RecursionError, format!("maximum recursion depth exceeded {what}"))
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Arc<ListCell>),
    Tuple(Arc<TupleCell>),
    Dict(Arc<DictCell>),
    Range(Range),
    Slice(Arc<SliceValue>),
    Function(Arc<Function>),
    Builtin(&'static str),
    External(Arc<str>),
    Method(Arc<BoundMethod>),
    Module(&'static str),
    ExceptionType(ExcKind),
    Exception(Arc<Exception>),
    Iterator(Arc<Mutex<IterState>>),
}

/// Storage behind a list value.
#[derive(Debug, Default)]
pub struct ListCell(Mutex<Vec<Value>>);

/// Storage behind a tuple value.
#[derive(Debug, Default)]
pub struct TupleCell(Vec<Value>);

/// Storage behind a dict value.
#[derive(Debug, Default)]
pub struct DictCell(Mutex<Dict>);

impl Deref for ListCell {
    type Target = Mutex<Vec<Value>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Deref for TupleCell {
    type Target = Vec<Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Deref for DictCell {
    type Target = Mutex<Dict>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Containers nested thousands deep would overflow the stack if each level
// dropped its children recursively, so every cell hands its children to an
// explicit worklist instead.
impl Drop for ListCell {
    fn drop(&mut self) {
        let items = self.0.get_mut().unwrap_or_else(PoisonError::into_inner);
        release(std::mem::take(items));
    }
}

impl Drop for TupleCell {
    fn drop(&mut self) {
        release(std::mem::take(&mut self.0));
    }
}

impl Drop for DictCell {
    fn drop(&mut self) {
        let dict = self.0.get_mut().unwrap_or_else(PoisonError::into_inner);
        release(dict.take_values());
    }
}

fn release(mut pending: Vec<Value>) {
    while let Some(value) = pending.pop() {
        match value {
            Value::List(cell) => {
                if let Some(mut cell) = Arc::into_inner(cell) {
                    pending.append(cell.0.get_mut().unwrap_or_else(PoisonError::into_inner));
                }
            }
            Value::Tuple(cell) => {
                if let Some(mut cell) = Arc::into_inner(cell) {
                    pending.append(&mut cell.0);
                }
            }
            Value::Dict(cell) => {
                if let Some(mut cell) = Arc::into_inner(cell) {
                    let dict = cell.0.get_mut().unwrap_or_else(PoisonError::into_inner);
                    pending.extend(dict.take_values());
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    pub fn len(&self) -> usize {
        let span = if self.step > 0 {
            (self.stop as i128 - self.start as i128 + self.step as i128 - 1) / self.step as i128
        } else {
            (self.start as i128 - self.stop as i128 - self.step as i128 - 1)
                / (-(self.step as i128))
        };
        span.max(0) as usize
    }

    pub fn get(&self, index: usize) -> i64 {
        self.start + self.step * index as i64
    }
}

#[derive(Debug, Clone)]
pub struct SliceValue {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

impl SliceValue {
    /// Resolves the slice against a sequence of `len` items, returning the
    /// selected indices in order.
    pub fn indices(&self, len: usize) -> Flow<Vec<usize>> {
        let len = len as i64;
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return throw(ExcKind::ValueError, "slice step cannot be zero");
        }
        let clamp = |value: i64, low: i64, high: i64| value.max(low).min(high);
        let resolve = |bound: Option<i64>, default: i64, low: i64, high: i64| match bound {
            None => default,
            Some(value) if value < 0 => clamp(value + len, low, high),
            Some(value) => clamp(value, low, high),
        };
        let mut out = Vec::new();
        if step > 0 {
            let start = resolve(self.start, 0, 0, len);
            let stop = resolve(self.stop, len, 0, len);
            let mut index = start;
            while index < stop {
                out.push(index as usize);
                index += step;
            }
        } else {
            let start = resolve(self.start, len - 1, -1, len - 1);
            let stop = resolve(self.stop, -1, -1, len - 1);
            let mut index = start;
            while index > stop {
                out.push(index as usize);
                index += step;
            }
        }
        Ok(out)
    }
}

#[derive(Debug)]
pub struct Function {
    pub code: Arc<Code>,
    pub defaults: Vec<Value>,
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub name: Arc<str>,
}

#[derive(Debug)]
pub enum IterState {
    List(Arc<ListCell>, usize),
    Items(Vec<Value>, usize),
    Range(Range, usize),
}

impl IterState {
    pub fn next_value(&mut self) -> Option<Value> {
        match self {
            Self::List(items, index) => {
                let item = lock(items).get(*index).cloned();
                *index += 1;
                item
            }
            Self::Items(items, index) => {
                let item = items.get(*index).cloned();
                *index += 1;
                item
            }
            Self::Range(range, index) => {
                if *index >= range.len() {
                    return None;
                }
                let item = Value::Int(range.get(*index));
                *index += 1;
                Some(item)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcKind {
    Exception,
    ArithmeticError,
    AssertionError,
    AttributeError,
    IndexError,
    KeyError,
    LookupError,
    NameError,
    NotImplementedError,
    OverflowError,
    RecursionError,
    RuntimeError,
    StopIteration,
    ToolError,
    TypeError,
    UnboundLocalError,
    ValueError,
    JSONDecodeError,
    ZeroDivisionError,
}

impl ExcKind {
    pub const ALL: &'static [ExcKind] = &[
        Self::Exception,
        Self::ArithmeticError,
        Self::AssertionError,
        Self::AttributeError,
        Self::IndexError,
        Self::KeyError,
        Self::LookupError,
        Self::NameError,
        Self::NotImplementedError,
        Self::OverflowError,
        Self::RecursionError,
        Self::RuntimeError,
        Self::StopIteration,
        Self::ToolError,
        Self::TypeError,
        Self::UnboundLocalError,
        Self::ValueError,
        Self::ZeroDivisionError,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Exception => "Exception",
            Self::ArithmeticError => "ArithmeticError",
            Self::AssertionError => "AssertionError",
            Self::AttributeError => "AttributeError",
            Self::IndexError => "IndexError",
            Self::KeyError => "KeyError",
            Self::LookupError => "LookupError",
            Self::NameError => "NameError",
            Self::NotImplementedError => "NotImplementedError",
            Self::OverflowError => "OverflowError",
            Self::RecursionError => "RecursionError",
            Self::RuntimeError => "RuntimeError",
            Self::StopIteration => "StopIteration",
            Self::ToolError => "ToolError",
            Self::TypeError => "TypeError",
            Self::UnboundLocalError => "UnboundLocalError",
            Self::ValueError => "ValueError",
            Self::JSONDecodeError => "JSONDecodeError",
            Self::ZeroDivisionError => "ZeroDivisionError",
        }
    }

    /// Builtin exception types visible by name. `JSONDecodeError` lives on the json module.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }

    fn parent(&self) -> Option<Self> {
        match self {
            Self::Exception => None,
            Self::IndexError | Self::KeyError => Some(Self::LookupError),
            Self::OverflowError | Self::ZeroDivisionError => Some(Self::ArithmeticError),
            Self::RecursionError | Self::NotImplementedError => Some(Self::RuntimeError),
            Self::UnboundLocalError => Some(Self::NameError),
            Self::JSONDecodeError => Some(Self::ValueError),
            _ => Some(Self::Exception),
        }
    }

    /// True when an `except handler:` clause catches this kind.
    pub fn is_subclass_of(&self, handler: ExcKind) -> bool {
        let mut current = Some(*self);
        while let Some(kind) = current {
            if kind == handler {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

#[derive(Debug, Clone)]
pub struct Exception {
    pub kind: ExcKind,
    pub message: String,
    pub line: usize,
}

impl Exception {
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: 0,
        }
    }
}

pub enum Interrupt {
    Raise(Arc<Exception>),
    Fatal(SandboxError),
}

impl From<SandboxError> for Interrupt {
    fn from(value: SandboxError) -> Self {
        Self::Fatal(value)
    }
}

pub type Flow<T> = Result<T, Interrupt>;

pub fn exception(kind: ExcKind, message: impl Into<String>) -> Interrupt {
    Interrupt::Raise(Arc::new(Exception::new(kind, message)))
}

pub fn throw<T>(kind: ExcKind, message: impl Into<String>) -> Flow<T> {
    Err(exception(kind, message))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(i64),
    Float(u64),
    Str(Arc<str>),
    Tuple(Vec<HashKey>),
    Type(ExcKind),
}

impl HashKey {
    pub fn from_value(value: &Value) -> Flow<Self> {
        Self::from_value_depth(value, 0)
    }

    fn from_value_depth(value: &Value, depth: usize) -> Flow<Self> {
        if depth > MAX_DEPTH {
            return too_deep("while hashing");
        }
        Ok(match value {
            Value::None => Self::None,
            Value::Bool(flag) => Self::Int(*flag as i64),
            Value::Int(number) => Self::Int(*number),
            Value::Float(number) => {
                if number.fract() == 0.0 && number.abs() < 9.2e18 {
                    Self::Int(*number as i64)
                } else {
                    Self::Float(number.to_bits())
                }
            }
            Value::Str(text) => Self::Str(text.clone()),
            Value::Tuple(items) => Self::Tuple(
                items
                    .iter()
                    .map(|item| HashKey::from_value_depth(item, depth + 1))
                    .collect::<Flow<Vec<_>>>()?,
            ),
            Value::ExceptionType(kind) => Self::Type(*kind),
            other => {
                return throw(
                    ExcKind::TypeError,
                    format!("unhashable type: '{}'", other.type_name()),
                )
            }
        })
    }
}

/// Insertion-ordered dictionary.
#[derive(Debug, Clone, Default)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
    index: HashMap<HashKey, usize>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> Flow<Option<Value>> {
        let hash = HashKey::from_value(key)?;
        Ok(self
            .index
            .get(&hash)
            .map(|position| self.entries[*position].1.clone()))
    }

    pub fn contains(&self, key: &Value) -> Flow<bool> {
        Ok(self.index.contains_key(&HashKey::from_value(key)?))
    }

    pub fn insert(&mut self, key: Value, value: Value) -> Flow<()> {
        let hash = HashKey::from_value(&key)?;
        match self.index.get(&hash) {
            Some(position) => self.entries[*position].1 = value,
            None => {
                self.index.insert(hash, self.entries.len());
                self.entries.push((key, value));
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &Value) -> Flow<Option<Value>> {
        let hash = HashKey::from_value(key)?;
        let Some(position) = self.index.remove(&hash) else {
            return Ok(None);
        };
        let (_, value) = self.entries.remove(position);
        for slot in self.index.values_mut() {
            if *slot > position {
                *slot -= 1;
            }
        }
        Ok(Some(value))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Empties the dict, returning keys and values flattened in entry order.
    fn take_values(&mut self) -> Vec<Value> {
        self.index.clear();
        std::mem::take(&mut self.entries)
            .into_iter()
            .flat_map(|(key, value)| [key, value])
            .collect()
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|(_, value)| value.clone()).collect()
    }

    pub fn items(&self) -> Vec<(Value, Value)> {
        self.entries.clone()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(value) => value as f64,
            Self::Float(value) => value,
        }
    }
}

impl Value {
    pub fn str(text: impl AsRef<str>) -> Self {
        Self::Str(Arc::from(text.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Self::List(Arc::new(ListCell(Mutex::new(items))))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Self::Tuple(Arc::new(TupleCell(items)))
    }

    pub fn dict(dict: Dict) -> Self {
        Self::Dict(Arc::new(DictCell(Mutex::new(dict))))
    }

    pub fn iterator(items: Vec<Value>) -> Self {
        Self::Iterator(Arc::new(Mutex::new(IterState::Items(items, 0))))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
            Self::Range(_) => "range",
            Self::Slice(_) => "slice",
            Self::Function(_) => "function",
            Self::Builtin(_) | Self::External(_) => "builtin_function_or_method",
            Self::Method(_) => "method",
            Self::Module(_) => "module",
            Self::ExceptionType(_) => "type",
            Self::Exception(exc) => exc.kind.name(),
            Self::Iterator(_) => "iterator",
        }
    }

    pub fn as_num(&self) -> Option<Num> {
        match self {
            Self::Bool(flag) => Some(Num::Int(*flag as i64)),
            Self::Int(value) => Some(Num::Int(*value)),
            Self::Float(value) => Some(Num::Float(*value)),
            _ => None,
        }
    }

    pub fn as_index(&self) -> Flow<i64> {
        match self {
            Self::Bool(flag) => Ok(*flag as i64),
            Self::Int(value) => Ok(*value),
            other => throw(
                ExcKind::TypeError,
                format!(
                    "'{}' object cannot be interpreted as an integer",
                    other.type_name()
                ),
            ),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(flag) => *flag,
            Self::Int(value) => *value != 0,
            Self::Float(value) => *value != 0.0,
            Self::Str(text) => !text.is_empty(),
            Self::List(items) => !lock(items).is_empty(),
            Self::Tuple(items) => !items.is_empty(),
            Self::Dict(dict) => !lock(dict).is_empty(),
            Self::Range(range) => range.len() > 0,
            _ => true,
        }
    }

    /// Materializes any iterable into a vector of items.
    pub fn iterate(&self) -> Flow<Vec<Value>> {
        Ok(match self {
            Self::List(items) => lock(items).clone(),
            Self::Tuple(items) => items.to_vec(),
            Self::Str(text) => text.chars().map(|c| Value::str(c.to_string())).collect(),
            Self::Dict(dict) => lock(dict).keys(),
            Self::Range(range) => (0..range.len()).map(|i| Value::Int(range.get(i))).collect(),
            Self::Iterator(state) => {
                let mut state = lock(state);
                let mut items = Vec::new();
                while let Some(item) = state.next_value() {
                    items.push(item);
                }
                items
            }
            other => {
                return throw(
                    ExcKind::TypeError,
                    format!("'{}' object is not iterable", other.type_name()),
                )
            }
        })
    }

    /// Length of the value if it has one, used to charge work before materializing.
    pub fn size_hint(&self) -> usize {
        match self {
            Self::List(items) => lock(items).len(),
            Self::Tuple(items) => items.len(),
            Self::Str(text) => text.len(),
            Self::Dict(dict) => lock(dict).len(),
            Self::Range(range) => range.len(),
            _ => 0,
        }
    }

    /// `repr()` conversion. A container reached again while it is being
    /// printed shows as `[...]`, `(...)` or `{...}`.
    pub fn repr(&self) -> Flow<String> {
        let mut out = String::new();
        self.write_repr(&mut out, &mut Vec::new())?;
        Ok(out)
    }

    /// `str()` conversion.
    pub fn to_text(&self) -> Flow<String> {
        match self {
            Self::Str(text) => Ok(text.to_string()),
            Self::Exception(exc) => Ok(exc.message.clone()),
            other => other.repr(),
        }
    }

    fn write_repr(&self, out: &mut String, open: &mut Vec<usize>) -> Flow<()> {
        if open.len() > MAX_DEPTH {
            return too_deep("while getting the repr of an object");
        }
        match self {
            Self::None => out.push_str("None"),
            Self::Bool(true) => out.push_str("True"),
            Self::Bool(false) => out.push_str("False"),
            Self::Int(value) => {
                let _ = write!(out, "{value}");
            }
            Self::Float(value) => out.push_str(&float_repr(*value)),
            Self::Str(text) => out.push_str(&str_repr(text)),
            Self::List(items) => {
                let address = Arc::as_ptr(items) as usize;
                if open.contains(&address) {
                    out.push_str("[...]");
                    return Ok(());
                }
                let items = lock(items).clone();
                open.push(address);
                write_sequence(out, "[", "]", &items, open)?;
                open.pop();
            }
            Self::Tuple(items) => {
                let address = Arc::as_ptr(items) as usize;
                if open.contains(&address) {
                    out.push_str("(...)");
                    return Ok(());
                }
                open.push(address);
                if items.len() == 1 {
                    out.push('(');
                    items[0].write_repr(out, open)?;
                    out.push_str(",)");
                } else {
                    write_sequence(out, "(", ")", items, open)?;
                }
                open.pop();
            }
            Self::Dict(dict) => {
                let address = Arc::as_ptr(dict) as usize;
                if open.contains(&address) {
                    out.push_str("{...}");
                    return Ok(());
                }
                let items = lock(dict).items();
                open.push(address);
                out.push('{');
                for (position, (key, value)) in items.iter().enumerate() {
                    if position > 0 {
                        out.push_str(", ");
                    }
                    key.write_repr(out, open)?;
                    out.push_str(": ");
                    value.write_repr(out, open)?;
                }
                out.push('}');
                open.pop();
            }
            Self::Range(range) => {
                if range.step == 1 {
                    let _ = write!(out, "range({}, {})", range.start, range.stop);
                } else {
                    let _ = write!(out, "range({}, {}, {})", range.start, range.stop, range.step);
                }
            }
            Self::Slice(slice) => {
                let part = |bound: Option<i64>| bound.map_or("None".to_string(), |v| v.to_string());
                let _ = write!(
                    out,
                    "slice({}, {}, {})",
                    part(slice.start),
                    part(slice.stop),
                    part(slice.step)
                );
            }
            Self::Function(function) => {
                let _ = write!(out, "<function {}>", function.code.name);
            }
            Self::Builtin(name) => {
                let _ = write!(out, "<built-in function {name}>");
            }
            Self::External(name) => {
                let _ = write!(out, "<external function {name}>");
            }
            Self::Method(method) => {
                let _ = write!(
                    out,
                    "<built-in method {} of {} object>",
                    method.name,
                    method.receiver.type_name()
                );
            }
            Self::Module(name) => {
                let _ = write!(out, "<module '{name}'>");
            }
            Self::ExceptionType(kind) => {
                let _ = write!(out, "<class '{}'>", kind.name());
            }
            Self::Exception(exc) => {
                let _ = write!(out, "{}({})", exc.kind.name(), str_repr(&exc.message));
            }
            Self::Iterator(_) => out.push_str("<iterator object>"),
        }
        Ok(())
    }

    pub fn to_json(&self) -> Flow<Json> {
        self.to_json_inner(&mut Vec::new())
    }

    fn to_json_inner(&self, open: &mut Vec<usize>) -> Flow<Json> {
        if open.len() > MAX_DEPTH {
            return too_deep("while encoding a JSON object");
        }
        let address = match self {
            Self::List(items) => Some(Arc::as_ptr(items) as usize),
            Self::Tuple(items) => Some(Arc::as_ptr(items) as usize),
            Self::Dict(dict) => Some(Arc::as_ptr(dict) as usize),
            _ => None,
        };
        if let Some(address) = address {
            if open.contains(&address) {
                return throw(ExcKind::ValueError, "Circular reference detected");
            }
        }
        Ok(match self {
            Self::None => Json::Null,
            Self::Bool(flag) => Json::Bool(*flag),
            Self::Int(value) => Json::from(*value),
            Self::Float(value) => match Number::from_f64(*value) {
                Some(number) => Json::Number(number),
                None => {
                    return throw(
                        ExcKind::ValueError,
                        "Out of range float values are not JSON compliant",
                    )
                }
            },
            Self::Str(text) => Json::String(text.to_string()),
            Self::List(_) | Self::Tuple(_) => {
                let items = self.iterate()?;
                open.extend(address);
                let array = items
                    .iter()
                    .map(|item| item.to_json_inner(open))
                    .collect::<Flow<Vec<_>>>()?;
                open.pop();
                Json::Array(array)
            }
            Self::Dict(dict) => {
                let items = lock(dict).items();
                open.extend(address);
                let mut map = Map::new();
                for (key, value) in items {
                    map.insert(json_key(&key)?, value.to_json_inner(open)?);
                }
                open.pop();
                Json::Object(map)
            }
            other => {
                return throw(
                    ExcKind::TypeError,
                    format!(
                        "Object of type {} is not JSON serializable",
                        other.type_name()
                    ),
                )
            }
        })
    }

    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::None,
            Json::Bool(flag) => Value::Bool(*flag),
            Json::Number(number) => match number.as_i64() {
                Some(value) => Value::Int(value),
                None => Value::Float(number.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(text) => Value::str(text),
            Json::Array(items) => Value::list(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => {
                let mut dict = Dict::new();
                for (key, value) in map {
                    // String keys always hash.
                    let _ = dict.insert(Value::str(key), Value::from_json(value));
                }
                Value::dict(dict)
            }
        }
    }
}

/// Dictionary keys as JSON object keys, converted the way `json.dumps` does.
pub fn json_key(key: &Value) -> Flow<String> {
    match key {
        Value::Str(text) => Ok(text.to_string()),
        Value::Int(value) => Ok(value.to_string()),
        Value::Float(value) => Ok(float_repr(*value)),
        Value::Bool(true) => Ok("true".to_string()),
        Value::Bool(false) => Ok("false".to_string()),
        Value::None => Ok("null".to_string()),
        other => throw(
            ExcKind::TypeError,
            format!(
                "keys must be str, int, float, bool or None, not {}",
                other.type_name()
            ),
        ),
    }
}

fn write_sequence(
    out: &mut String,
    open_mark: &str,
    close_mark: &str,
    items: &[Value],
    open: &mut Vec<usize>,
) -> Flow<()> {
    out.push_str(open_mark);
    for (position, item) in items.iter().enumerate() {
        if position > 0 {
            out.push_str(", ");
        }
        item.write_repr(out, open)?;
    }
    out.push_str(close_mark);
    Ok(())
}

pub fn float_repr(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let magnitude = value.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let formatted = format!("{value:e}");
        let (mantissa, exponent) = formatted.split_once('e').unwrap_or((&formatted, "0"));
        let (sign, digits) = match exponent.strip_prefix('-') {
            Some(digits) => ('-', digits),
            None => ('+', exponent),
        };
        return format!("{mantissa}e{sign}{digits:0>2}");
    }
    let text = format!("{value}");
    if text.contains('.') {
        text
    } else {
        format!("{text}.0")
    }
}

pub fn str_repr(text: &str) -> String {
    let quote = if text.contains('\'') && !text.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// `==` with numeric cross-type equality.
pub fn py_eq(left: &Value, right: &Value) -> Flow<bool> {
    eq_depth(left, right, 0)
}

fn eq_depth(left: &Value, right: &Value, depth: usize) -> Flow<bool> {
    if depth > MAX_DEPTH {
        return too_deep("in comparison");
    }
    if let (Some(a), Some(b)) = (left.as_num(), right.as_num()) {
        return Ok(match (a, b) {
            (Num::Int(a), Num::Int(b)) => a == b,
            (a, b) => a.as_f64() == b.as_f64(),
        });
    }
    Ok(match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::List(a), Value::List(b)) => {
            if Arc::ptr_eq(a, b) {
                return Ok(true);
            }
            let a = lock(a).clone();
            let b = lock(b).clone();
            seq_eq(&a, &b, depth)?
        }
        (Value::Tuple(a), Value::Tuple(b)) => Arc::ptr_eq(a, b) || seq_eq(a, b, depth)?,
        (Value::Dict(a), Value::Dict(b)) => {
            if Arc::ptr_eq(a, b) {
                return Ok(true);
            }
            let a = lock(a).items();
            let b = lock(b).clone();
            if a.len() != b.len() {
                return Ok(false);
            }
            for (key, value) in &a {
                match b.get(key)? {
                    Some(other) if eq_depth(value, &other, depth + 1)? => {}
                    _ => return Ok(false),
                }
            }
            true
        }
        (Value::Range(a), Value::Range(b)) => a == b,
        (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
        (Value::Builtin(a), Value::Builtin(b)) => a == b,
        (Value::External(a), Value::External(b)) => a == b,
        (Value::Module(a), Value::Module(b)) => a == b,
        (Value::ExceptionType(a), Value::ExceptionType(b)) => a == b,
        (Value::Exception(a), Value::Exception(b)) => Arc::ptr_eq(a, b),
        _ => false,
    })
}

fn seq_eq(a: &[Value], b: &[Value], depth: usize) -> Flow<bool> {
    if a.len() != b.len() {
        return Ok(false);
    }
    for (x, y) in a.iter().zip(b.iter()) {
        if !eq_depth(x, y, depth + 1)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// `is` identity.
pub fn py_is(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => Arc::ptr_eq(a, b) || a == b,
        (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
        (Value::Tuple(a), Value::Tuple(b)) => Arc::ptr_eq(a, b),
        (Value::Dict(a), Value::Dict(b)) => Arc::ptr_eq(a, b),
        (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
        (Value::Exception(a), Value::Exception(b)) => Arc::ptr_eq(a, b),
        (Value::ExceptionType(a), Value::ExceptionType(b)) => a == b,
        (Value::Builtin(a), Value::Builtin(b)) => a == b,
        (Value::Module(a), Value::Module(b)) => a == b,
        _ => false,
    }
}

/// Ordering for `<`, `sorted`, `min` and `max`.
pub fn py_cmp(left: &Value, right: &Value) -> Flow<Ordering> {
    cmp_depth(left, right, 0)
}

fn cmp_depth(left: &Value, right: &Value, depth: usize) -> Flow<Ordering> {
    if depth > MAX_DEPTH {
        return too_deep("in comparison");
    }
    if let (Some(a), Some(b)) = (left.as_num(), right.as_num()) {
        return Ok(match (a, b) {
            (Num::Int(a), Num::Int(b)) => a.cmp(&b),
            (a, b) => a
                .as_f64()
                .partial_cmp(&b.as_f64())
                .unwrap_or(Ordering::Equal),
        });
    }
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (Value::List(a), Value::List(b)) => {
            let a = lock(a).clone();
            let b = lock(b).clone();
            seq_cmp(&a, &b, depth)
        }
        (Value::Tuple(a), Value::Tuple(b)) => seq_cmp(a, b, depth),
        _ => throw(
            ExcKind::TypeError,
            format!(
                "'<' not supported between instances of '{}' and '{}'",
                left.type_name(),
                right.type_name()
            ),
        ),
    }
}

fn seq_cmp(a: &[Value], b: &[Value], depth: usize) -> Flow<Ordering> {
    for (x, y) in a.iter().zip(b.iter()) {
        if !eq_depth(x, y, depth + 1)? {
            return cmp_depth(x, y, depth + 1);
        }
    }
    Ok(a.len().cmp(&b.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_repr_matches_python() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(-2.5), "-2.5");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1.5e-5), "1.5e-05");
        assert_eq!(float_repr(f64::INFINITY), "inf");
    }

    #[test]
    fn str_repr_picks_quotes() {
        assert_eq!(str_repr("abc"), "'abc'");
        assert_eq!(str_repr("it's"), "\"it's\"");
        assert_eq!(str_repr("a\nb"), "'a\\nb'");
    }

    #[test]
    fn dict_keeps_insertion_order_and_numeric_keys() {
        let mut dict = Dict::new();
        dict.insert(Value::str("b"), Value::Int(1)).ok();
        dict.insert(Value::Int(1), Value::Int(2)).ok();
        dict.insert(Value::str("a"), Value::Int(3)).ok();
        dict.insert(Value::Float(1.0), Value::Int(4)).ok();
        assert_eq!(dict.len(), 3);
        assert_eq!(
            Value::dict(dict.clone()).repr().ok().as_deref(),
            Some("{'b': 1, 1: 4, 'a': 3}")
        );

        dict.remove(&Value::str("b")).ok();
        assert!(matches!(dict.get(&Value::str("a")).ok().flatten(), Some(Value::Int(3))));
        assert!(matches!(dict.get(&Value::Bool(true)).ok().flatten(), Some(Value::Int(4))));
    }

    #[test]
    fn unhashable_keys_raise() {
        let mut dict = Dict::new();
        let result = dict.insert(Value::list(vec![]), Value::None);
        match result {
            Err(Interrupt::Raise(exc)) => {
                assert_eq!(exc.kind, ExcKind::TypeError);
                assert_eq!(exc.message, "unhashable type: 'list'");
            }
            _ => panic!("expected TypeError"),
        }
    }

    #[test]
    fn self_referencing_list_repr_terminates() {
        let list = Value::list(vec![Value::Int(1)]);
        if let Value::List(items) = &list {
            lock(items).push(list.clone());
        }
        assert_eq!(list.repr().ok().as_deref(), Some("[1, [...]]"));

        let dict = Value::dict(Dict::new());
        if let Value::Dict(cell) = &dict {
            lock(cell).insert(Value::str("me"), dict.clone()).ok();
        }
        assert_eq!(dict.repr().ok().as_deref(), Some("{'me': {...}}"));
        match dict.to_json() {
            Err(Interrupt::Raise(exc)) => assert_eq!(exc.kind, ExcKind::ValueError),
            _ => panic!("expected ValueError"),
        }
    }

    fn nested_lists(depth: usize) -> Value {
        let mut value = Value::list(Vec::new());
        for _ in 0..depth {
            value = Value::list(vec![value]);
        }
        value
    }

    fn recursion_error<T>(result: Flow<T>) {
        match result {
            Err(Interrupt::Raise(exc)) => assert_eq!(exc.kind, ExcKind::RecursionError),
            _ => panic!("expected RecursionError"),
        }
    }

    #[test]
    fn deeply_nested_containers_raise_recursion_error() {
        let deep = nested_lists(200_000);
        let other = nested_lists(200_000);
        recursion_error(deep.repr());
        recursion_error(deep.to_text());
        recursion_error(py_eq(&deep, &other));
        recursion_error(py_cmp(&deep, &other));
        recursion_error(deep.to_json());

        let mut tuple = Value::tuple(Vec::new());
        for _ in 0..200_000 {
            tuple = Value::tuple(vec![tuple]);
        }
        recursion_error(HashKey::from_value(&tuple));

        let mut dict = Value::dict(Dict::new());
        for _ in 0..200_000 {
            let mut outer = Dict::new();
            outer.insert(Value::str("k"), dict).ok();
            dict = Value::dict(outer);
        }
        drop((deep, other, tuple, dict));
    }

    #[test]
    fn shallow_nesting_still_compares_and_prints() {
        let deep = nested_lists(40);
        let other = nested_lists(40);
        assert_eq!(py_eq(&deep, &other).ok(), Some(true));
        assert_eq!(py_cmp(&deep, &other).ok(), Some(Ordering::Equal));
        let text = deep.repr().ok().unwrap_or_default();
        assert_eq!(text, format!("{}{}", "[".repeat(41), "]".repeat(41)));
    }

    #[test]
    fn exception_hierarchy() {
        assert!(ExcKind::KeyError.is_subclass_of(ExcKind::LookupError));
        assert!(ExcKind::ZeroDivisionError.is_subclass_of(ExcKind::ArithmeticError));
        assert!(ExcKind::ToolError.is_subclass_of(ExcKind::Exception));
        assert!(!ExcKind::ValueError.is_subclass_of(ExcKind::LookupError));
    }

    #[test]
    fn slices_resolve_like_python() {
        let slice = SliceValue {
            start: None,
            stop: None,
            step: Some(-1),
        };
        assert_eq!(slice.indices(3).ok(), Some(vec![2, 1, 0]));
        let slice = SliceValue {
            start: Some(-2),
            stop: None,
            step: None,
        };
        assert_eq!(slice.indices(5).ok(), Some(vec![3, 4]));
    }
}
