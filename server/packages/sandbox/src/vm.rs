use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use acp_bridge_error::SandboxError;
use serde_json::{Map, Value as Json};

use crate::ast::{BinOp, CmpOp, UnaryOp};
use crate::builtins;
use crate::compiler::{Code, Instr};
use crate::format;
use crate::methods;
use crate::runner::ExternalFunction;
use crate::value::{
    exception, lock, py_cmp, py_eq, py_is, throw, BoundMethod, Dict, ExcKind, Exception, Flow,
    Function, Interrupt, IterState, Num, SliceValue, Value,
};

/// How often wall time and cancellation are checked, in instructions.
const CHECK_INTERVAL: u64 = 1024;

#[derive(Debug, Clone)]
pub(crate) struct Limits {
    pub max_steps: u64,
    pub max_duration: Duration,
    pub max_output_bytes: usize,
    pub max_call_depth: usize,
}

struct Frame {
    code: Arc<Code>,
    pc: usize,
    /// `None` for module level, where names live in globals.
    locals: Option<HashMap<Arc<str>, Value>>,
    stack_base: usize,
}

struct Handler {
    frame: usize,
    target: usize,
    stack_depth: usize,
}

pub(crate) struct PendingCall {
    pub function: String,
    pub arguments: Map<String, Json>,
}

pub(crate) enum Exit {
    Returned(Value),
    Suspended(PendingCall),
}

pub(crate) struct Vm {
    frames: Vec<Frame>,
    stack: Vec<Value>,
    handlers: Vec<Handler>,
    globals: HashMap<Arc<str>, Value>,
    externals: HashMap<Arc<str>, ExternalFunction>,
    limits: Limits,
    steps: u64,
    elapsed: Duration,
    running_since: Option<Instant>,
    cancel: Arc<AtomicBool>,
    output: String,
    output_truncated: bool,
    nested: usize,
}

impl Vm {
    pub fn new(
        module: Arc<Code>,
        externals: Vec<ExternalFunction>,
        limits: Limits,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let externals = externals
            .into_iter()
            .map(|function| (Arc::from(function.name.as_str()), function))
            .collect();
        Self {
            frames: vec![Frame {
                code: module,
                pc: 0,
                locals: None,
                stack_base: 0,
            }],
            stack: Vec::new(),
            handlers: Vec::new(),
            globals: HashMap::new(),
            externals,
            limits,
            steps: 0,
            elapsed: Duration::ZERO,
            running_since: None,
            cancel,
            output: String::new(),
            output_truncated: false,
            nested: 0,
        }
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn output_truncated(&self) -> bool {
        self.output_truncated
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
            + self
                .running_since
                .map(|since| since.elapsed())
                .unwrap_or_default()
    }

    pub fn start_clock(&mut self) {
        self.running_since = Some(Instant::now());
    }

    pub fn stop_clock(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.elapsed += since.elapsed();
        }
    }

    /// Runs until the frame at `stop_depth` returns or an external call suspends.
    pub fn execute(&mut self, stop_depth: usize) -> Flow<Exit> {
        loop {
            match self.step(stop_depth) {
                Ok(None) => {}
                Ok(Some(exit)) => return Ok(exit),
                Err(Interrupt::Raise(exc)) => {
                    let exc = self.locate(exc);
                    self.unwind(exc, stop_depth)?;
                }
                Err(fatal) => return Err(fatal),
            }
        }
    }

    /// Delivers the result of a suspended external call.
    pub fn resume_value(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Raises `exc` at the point where the script suspended.
    pub fn resume_error(&mut self, exc: Exception) -> Flow<()> {
        let exc = self.locate(Arc::new(exc));
        self.unwind(exc, 0)
    }

    pub fn current_line(&self) -> usize {
        self.frames
            .last()
            .and_then(|frame| frame.code.lines.get(frame.pc.saturating_sub(1)))
            .copied()
            .unwrap_or(0)
    }

    fn locate(&self, exc: Arc<Exception>) -> Arc<Exception> {
        if exc.line != 0 {
            return exc;
        }
        let mut located = (*exc).clone();
        located.line = self.current_line();
        Arc::new(located)
    }

    fn unwind(&mut self, exc: Arc<Exception>, stop_depth: usize) -> Flow<()> {
        let catchable = self
            .handlers
            .last()
            .is_some_and(|handler| handler.frame >= stop_depth);
        if catchable {
            if let Some(handler) = self.handlers.pop() {
                self.frames.truncate(handler.frame + 1);
                self.stack.truncate(handler.stack_depth);
                if let Some(frame) = self.frames.last_mut() {
                    frame.pc = handler.target;
                }
                self.stack.push(Value::Exception(exc));
                return Ok(());
            }
        }
        if let Some(frame) = self.frames.get(stop_depth) {
            let base = frame.stack_base;
            self.stack.truncate(base);
        }
        self.frames.truncate(stop_depth);
        Err(Interrupt::Raise(exc))
    }

    fn internal(&self, message: &str) -> Interrupt {
        Interrupt::Fatal(SandboxError::Runtime {
            kind: "InternalError".to_string(),
            message: message.to_string(),
            line: self.current_line(),
        })
    }

    fn tick(&mut self) -> Flow<()> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(self.step_budget_exceeded());
        }
        if self.steps % CHECK_INTERVAL == 0 {
            self.check_interrupts()?;
        }
        Ok(())
    }

    /// Accounts for work proportional to `units` done by a single builtin.
    pub fn charge(&mut self, units: usize) -> Flow<()> {
        self.steps = self.steps.saturating_add(units as u64);
        if self.steps > self.limits.max_steps {
            return Err(self.step_budget_exceeded());
        }
        self.check_interrupts()
    }

    fn step_budget_exceeded(&self) -> Interrupt {
        Interrupt::Fatal(SandboxError::BudgetExceeded {
            reason: format!(
                "step budget of {} instructions exhausted",
                self.limits.max_steps
            ),
        })
    }

    fn check_interrupts(&self) -> Flow<()> {
        if self.cancel.load(AtomicOrdering::SeqCst) {
            return Err(Interrupt::Fatal(SandboxError::Cancelled));
        }
        if self.elapsed() > self.limits.max_duration {
            return Err(Interrupt::Fatal(SandboxError::BudgetExceeded {
                reason: format!(
                    "time budget of {}ms exhausted",
                    self.limits.max_duration.as_millis()
                ),
            }));
        }
        Ok(())
    }

    pub fn write_output(&mut self, text: &str) {
        if self.output_truncated {
            return;
        }
        let room = self.limits.max_output_bytes.saturating_sub(self.output.len());
        if text.len() <= room {
            self.output.push_str(text);
            return;
        }
        let mut cut = room;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        self.output.push_str(&text[..cut]);
        self.output_truncated = true;
        tracing::debug!(limit = self.limits.max_output_bytes, "script output truncated");
    }

    fn pop(&mut self) -> Flow<Value> {
        match self.stack.pop() {
            Some(value) => Ok(value),
            None => Err(self.internal("stack underflow")),
        }
    }

    fn pop_n(&mut self, count: usize) -> Flow<Vec<Value>> {
        if count > self.stack.len() {
            return Err(self.internal("stack underflow"));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn top(&self) -> Flow<&Value> {
        match self.stack.last() {
            Some(value) => Ok(value),
            None => Err(self.internal("stack underflow")),
        }
    }

    fn jump(&mut self, target: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc = target;
        }
    }

    fn step(&mut self, stop_depth: usize) -> Flow<Option<Exit>> {
        self.tick()?;
        let (code, pc) = match self.frames.last_mut() {
            Some(frame) => {
                let pc = frame.pc;
                frame.pc += 1;
                (frame.code.clone(), pc)
            }
            None => return Err(self.internal("no active frame")),
        };
        let Some(instr) = code.instructions.get(pc) else {
            return Err(self.internal("instruction pointer out of range"));
        };

        match instr {
            Instr::Const(value) => self.stack.push(value.clone()),
            Instr::Load(name) => {
                let value = self.load(name)?;
                self.stack.push(value);
            }
            Instr::Store(name) => {
                let value = self.pop()?;
                self.store(name.clone(), value);
            }
            Instr::LoadAttr(name) => {
                let target = self.pop()?;
                let value = self.get_attr(target, name)?;
                self.stack.push(value);
            }
            Instr::Subscript => {
                let key = self.pop()?;
                let container = self.pop()?;
                let value = self.subscript(&container, &key)?;
                self.stack.push(value);
            }
            Instr::StoreSubscript => {
                let key = self.pop()?;
                let container = self.pop()?;
                let value = self.pop()?;
                self.store_subscript(&container, key, value)?;
            }
            Instr::BuildSlice => {
                let parts = self.pop_n(3)?;
                let bound = |value: &Value| -> Flow<Option<i64>> {
                    match value {
                        Value::None => Ok(None),
                        other => other.as_index().map(Some),
                    }
                };
                let slice = SliceValue {
                    start: bound(&parts[0])?,
                    stop: bound(&parts[1])?,
                    step: bound(&parts[2])?,
                };
                self.stack.push(Value::Slice(Arc::new(slice)));
            }
            Instr::BuildList(count) => {
                let items = self.pop_n(*count)?;
                self.stack.push(Value::list(items));
            }
            Instr::BuildTuple(count) => {
                let items = self.pop_n(*count)?;
                self.stack.push(Value::tuple(items));
            }
            Instr::BuildDict(count) => {
                let items = self.pop_n(count * 2)?;
                let mut dict = Dict::new();
                let mut items = items.into_iter();
                while let (Some(key), Some(value)) = (items.next(), items.next()) {
                    dict.insert(key, value)?;
                }
                self.stack.push(Value::dict(dict));
            }
            Instr::BuildString(count) => {
                let parts = self.pop_n(*count)?;
                let text = parts.iter().map(Value::to_text).collect::<Flow<String>>()?;
                self.charge(text.len() / 64)?;
                self.stack.push(Value::str(text));
            }
            Instr::FormatValue { conversion, spec } => {
                let value = self.pop()?;
                let value = match conversion {
                    Some('r') | Some('a') => Value::str(value.repr()?),
                    Some(_) => Value::str(value.to_text()?),
                    None => value,
                };
                let text = match spec {
                    Some(spec) => {
                        format::format_value(&value, spec, &mut |units| self.charge(units))?
                    }
                    None => value.to_text()?,
                };
                self.stack.push(Value::str(text));
            }
            Instr::ListAppend(distance) => {
                let value = self.pop()?;
                match self.peek_at(*distance)? {
                    Value::List(items) => {
                        lock(&items).push(value);
                    }
                    _ => return Err(self.internal("list append target is not a list")),
                }
            }
            Instr::DictInsert(distance) => {
                let value = self.pop()?;
                let key = self.pop()?;
                match self.peek_at(*distance)? {
                    Value::Dict(dict) => {
                        lock(&dict).insert(key, value)?;
                    }
                    _ => return Err(self.internal("dict insert target is not a dict")),
                }
            }
            Instr::Unpack(count) => {
                let value = self.pop()?;
                let items = value.iterate()?;
                if items.len() < *count {
                    return throw(
                        ExcKind::ValueError,
                        format!(
                            "not enough values to unpack (expected {count}, got {})",
                            items.len()
                        ),
                    );
                }
                if items.len() > *count {
                    return throw(
                        ExcKind::ValueError,
                        format!("too many values to unpack (expected {count})"),
                    );
                }
                self.stack.extend(items.into_iter().rev());
            }
            Instr::Binary(op) => {
                let right = self.pop()?;
                let left = self.pop()?;
                let value = self.binary(*op, &left, &right)?;
                self.stack.push(value);
            }
            Instr::Unary(op) => {
                let operand = self.pop()?;
                let value = unary(*op, &operand)?;
                self.stack.push(value);
            }
            Instr::Compare(op) => {
                let right = self.pop()?;
                let left = self.pop()?;
                let value = compare(*op, &left, &right)?;
                self.stack.push(Value::Bool(value));
            }
            Instr::Jump(target) => self.jump(*target),
            Instr::PopJumpIfFalse(target) => {
                if !self.pop()?.truthy() {
                    self.jump(*target);
                }
            }
            Instr::PopJumpIfTrue(target) => {
                if self.pop()?.truthy() {
                    self.jump(*target);
                }
            }
            Instr::JumpIfFalseOrPop(target) => {
                if self.top()?.truthy() {
                    self.pop()?;
                } else {
                    self.jump(*target);
                }
            }
            Instr::JumpIfTrueOrPop(target) => {
                if self.top()?.truthy() {
                    self.jump(*target);
                } else {
                    self.pop()?;
                }
            }
            Instr::GetIter => {
                let value = self.pop()?;
                let iterator = make_iter(value)?;
                self.stack.push(iterator);
            }
            Instr::ForIter(target) => {
                let next = match self.top()? {
                    Value::Iterator(state) => lock(state).next_value(),
                    _ => return Err(self.internal("for loop over a non-iterator")),
                };
                match next {
                    Some(item) => self.stack.push(item),
                    None => {
                        self.pop()?;
                        self.jump(*target);
                    }
                }
            }
            Instr::Call { argc, kwnames } => {
                let kw_values = self.pop_n(kwnames.len())?;
                let args = self.pop_n(*argc)?;
                let callee = self.pop()?;
                let kwargs = kwnames.iter().cloned().zip(kw_values).collect();
                return self.call(callee, args, kwargs);
            }
            Instr::MakeFunction(code) => {
                let defaults = self.pop_n(code.num_defaults)?;
                self.stack.push(Value::Function(Arc::new(Function {
                    code: code.clone(),
                    defaults,
                })));
            }
            Instr::Return => {
                let value = self.pop()?;
                let Some(frame) = self.frames.pop() else {
                    return Err(self.internal("return without frame"));
                };
                let depth = self.frames.len();
                while self.handlers.last().is_some_and(|handler| handler.frame >= depth) {
                    self.handlers.pop();
                }
                self.stack.truncate(frame.stack_base);
                if depth <= stop_depth {
                    return Ok(Some(Exit::Returned(value)));
                }
                self.stack.push(value);
            }
            Instr::Pop => {
                self.pop()?;
            }
            Instr::DupTop => {
                let value = self.top()?.clone();
                self.stack.push(value);
            }
            Instr::DupTopTwo => {
                let pair = self.pop_n(2)?;
                self.stack.extend(pair.iter().cloned());
                self.stack.extend(pair);
            }
            Instr::RotTwo => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(self.internal("stack underflow"));
                }
                self.stack.swap(len - 1, len - 2);
            }
            Instr::RotThree => {
                let len = self.stack.len();
                if len < 3 {
                    return Err(self.internal("stack underflow"));
                }
                self.stack[len - 3..].rotate_right(1);
            }
            Instr::SetupExcept(target) => self.handlers.push(Handler {
                frame: self.frames.len() - 1,
                target: *target,
                stack_depth: self.stack.len(),
            }),
            Instr::PopExcept => {
                self.handlers.pop();
            }
            Instr::Raise(true) => {
                let value = self.pop()?;
                return match value {
                    Value::Exception(exc) => Err(Interrupt::Raise(exc)),
                    Value::ExceptionType(kind) => throw(kind, ""),
                    _ => throw(
                        ExcKind::TypeError,
                        "exceptions must derive from BaseException",
                    ),
                };
            }
            Instr::Raise(false) => {
                return throw(ExcKind::RuntimeError, "No active exception to reraise");
            }
            Instr::ExceptionMatches => {
                let kind = self.pop()?;
                let exc = self.pop()?;
                let matched = exception_matches(&exc, &kind)?;
                self.stack.push(Value::Bool(matched));
            }
            Instr::Import(name) => {
                let module = match name.as_ref() {
                    "json" => Value::Module("json"),
                    other => {
                        return throw(ExcKind::RuntimeError, format!("No module named '{other}'"))
                    }
                };
                self.stack.push(module);
            }
        }
        Ok(None)
    }

    /// Clones the value `distance` slots below the top of the stack.
    fn peek_at(&self, distance: usize) -> Flow<Value> {
        let len = self.stack.len();
        if distance == 0 || distance > len {
            return Err(self.internal("stack underflow"));
        }
        Ok(self.stack[len - distance].clone())
    }

    fn load(&self, name: &Arc<str>) -> Flow<Value> {
        if let Some(value) = self
            .frames
            .last()
            .and_then(|frame| frame.locals.as_ref())
            .and_then(|locals| locals.get(name))
        {
            return Ok(value.clone());
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        if self.externals.contains_key(name) {
            return Ok(Value::External(name.clone()));
        }
        if let Some(builtin) = builtins::lookup(name) {
            return Ok(Value::Builtin(builtin));
        }
        if let Some(kind) = ExcKind::from_name(name) {
            return Ok(Value::ExceptionType(kind));
        }
        throw(ExcKind::NameError, format!("name '{name}' is not defined"))
    }

    fn store(&mut self, name: Arc<str>, value: Value) {
        match self.frames.last_mut().and_then(|frame| frame.locals.as_mut()) {
            Some(locals) => {
                locals.insert(name, value);
            }
            None => {
                self.globals.insert(name, value);
            }
        }
    }

    fn call(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        kwargs: Vec<(Arc<str>, Value)>,
    ) -> Flow<Option<Exit>> {
        match callee {
            Value::Function(function) => {
                self.push_frame(&function, args, kwargs)?;
                Ok(None)
            }
            Value::External(name) => {
                if self.nested > 0 {
                    return throw(
                        ExcKind::RuntimeError,
                        format!("external function `{name}` cannot be called from a key function"),
                    );
                }
                let arguments = self.bind_external(&name, args, kwargs)?;
                Ok(Some(Exit::Suspended(PendingCall {
                    function: name.to_string(),
                    arguments,
                })))
            }
            other => {
                let value = self.call_native(other, args, kwargs)?;
                self.stack.push(value);
                Ok(None)
            }
        }
    }

    fn call_native(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        kwargs: Vec<(Arc<str>, Value)>,
    ) -> Flow<Value> {
        match callee {
            Value::Builtin(name) => builtins::call(self, name, args, kwargs),
            Value::Method(method) => {
                methods::call(self, &method.receiver, &method.name, args, kwargs)
            }
            Value::ExceptionType(kind) => {
                if !kwargs.is_empty() {
                    return throw(
                        ExcKind::TypeError,
                        format!("{}() takes no keyword arguments", kind.name()),
                    );
                }
                let message = match args.as_slice() {
                    [] => String::new(),
                    [single] => single.to_text()?,
                    many => Value::tuple(many.to_vec()).repr()?,
                };
                Ok(Value::Exception(Arc::new(Exception::new(kind, message))))
            }
            other => throw(
                ExcKind::TypeError,
                format!("'{}' object is not callable", other.type_name()),
            ),
        }
    }

    /// Calls `callee` to completion from inside a builtin (key functions).
    pub fn call_nested(&mut self, callee: &Value, args: Vec<Value>) -> Flow<Value> {
        match callee {
            Value::Function(function) => {
                let depth = self.frames.len();
                self.push_frame(function, args, Vec::new())?;
                self.nested += 1;
                let result = self.execute(depth);
                self.nested -= 1;
                match result? {
                    Exit::Returned(value) => Ok(value),
                    Exit::Suspended(_) => Err(self.internal("suspended inside a nested call")),
                }
            }
            Value::External(name) => throw(
                ExcKind::RuntimeError,
                format!("external function `{name}` cannot be called from a key function"),
            ),
            other => self.call_native(other.clone(), args, Vec::new()),
        }
    }

    fn push_frame(
        &mut self,
        function: &Function,
        args: Vec<Value>,
        kwargs: Vec<(Arc<str>, Value)>,
    ) -> Flow<()> {
        if self.frames.len() >= self.limits.max_call_depth {
            return throw(ExcKind::RecursionError, "maximum recursion depth exceeded");
        }
        let code = &function.code;
        let mut slots = bind_slots(&code.name, &code.params, args, kwargs)?;
        let first_default = code.params.len() - function.defaults.len();
        let mut locals = HashMap::with_capacity(code.params.len());
        for (position, param) in code.params.iter().enumerate() {
            let value = match slots[position].take() {
                Some(value) => value,
                None if position >= first_default => {
                    function.defaults[position - first_default].clone()
                }
                None => {
                    return throw(
                        ExcKind::TypeError,
                        format!(
                            "{}() missing required positional argument: '{param}'",
                            code.name
                        ),
                    )
                }
            };
            locals.insert(param.clone(), value);
        }
        self.frames.push(Frame {
            code: code.clone(),
            pc: 0,
            locals: Some(locals),
            stack_base: self.stack.len(),
        });
        Ok(())
    }

    fn bind_external(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(Arc<str>, Value)>,
    ) -> Flow<Map<String, Json>> {
        let Some(function) = self.externals.get(name) else {
            return throw(ExcKind::NameError, format!("name '{name}' is not defined"));
        };
        let params: Vec<Arc<str>> = function
            .params
            .iter()
            .map(|param| Arc::from(param.name.as_str()))
            .collect();
        let mut slots = bind_slots(name, &params, args, kwargs)?;
        let mut arguments = Map::new();
        for (position, param) in function.params.iter().enumerate() {
            let value = match (slots[position].take(), &param.default) {
                (Some(value), _) => value.to_json()?,
                (None, Some(default)) => default.clone(),
                (None, None) => {
                    return throw(
                        ExcKind::TypeError,
                        format!("{name}() missing required argument: '{}'", param.name),
                    )
                }
            };
            arguments.insert(param.name.clone(), value);
        }
        Ok(arguments)
    }

    fn get_attr(&self, target: Value, name: &Arc<str>) -> Flow<Value> {
        match &target {
            Value::Module(module) => match (*module, name.as_ref()) {
                ("json", "dumps") => Ok(Value::Builtin("json.dumps")),
                ("json", "loads") => Ok(Value::Builtin("json.loads")),
                ("json", "JSONDecodeError") => Ok(Value::ExceptionType(ExcKind::JSONDecodeError)),
                _ => throw(
                    ExcKind::AttributeError,
                    format!("module '{module}' has no attribute '{name}'"),
                ),
            },
            Value::Exception(exc) if name.as_ref() == "args" => {
                Ok(Value::tuple(vec![Value::str(&exc.message)]))
            }
            value if methods::has_method(value, name) => Ok(Value::Method(Arc::new(BoundMethod {
                receiver: target.clone(),
                name: name.clone(),
            }))),
            value => throw(
                ExcKind::AttributeError,
                format!("'{}' object has no attribute '{name}'", value.type_name()),
            ),
        }
    }

    fn subscript(&mut self, container: &Value, key: &Value) -> Flow<Value> {
        match container {
            Value::List(items) => {
                let items = lock(items).clone();
                self.sequence_item(&items, key, "list").map(|item| match item {
                    SeqItem::One(value) => value,
                    SeqItem::Many(values) => Value::list(values),
                })
            }
            Value::Tuple(items) => self.sequence_item(items, key, "tuple").map(|item| match item {
                SeqItem::One(value) => value,
                SeqItem::Many(values) => Value::tuple(values),
            }),
            Value::Str(text) => {
                let chars: Vec<Value> = text.chars().map(|c| Value::str(c.to_string())).collect();
                self.sequence_item(&chars, key, "string").map(|item| match item {
                    SeqItem::One(value) => value,
                    SeqItem::Many(values) => {
                        let text = values.iter().filter_map(|value| match value {
                            Value::Str(text) => Some(text.as_ref()),
                            _ => None,
                        });
                        Value::str(text.collect::<String>())
                    }
                })
            }
            Value::Range(range) => {
                let index = key.as_index()?;
                let len = range.len() as i64;
                let position = if index < 0 { index + len } else { index };
                if position < 0 || position >= len {
                    return throw(ExcKind::IndexError, "range object index out of range");
                }
                Ok(Value::Int(range.get(position as usize)))
            }
            Value::Dict(dict) => match lock(dict).get(key)? {
                Some(value) => Ok(value),
                None => throw(ExcKind::KeyError, key.repr()?),
            },
            other => throw(
                ExcKind::TypeError,
                format!("'{}' object is not subscriptable", other.type_name()),
            ),
        }
    }

    fn sequence_item(&mut self, items: &[Value], key: &Value, kind: &str) -> Flow<SeqItem> {
        match key {
            Value::Slice(slice) => {
                let indices = slice.indices(items.len())?;
                self.charge(indices.len() / 8)?;
                Ok(SeqItem::Many(
                    indices.into_iter().map(|index| items[index].clone()).collect(),
                ))
            }
            Value::Int(_) | Value::Bool(_) => {
                let index = normalize_index(key.as_index()?, items.len()).ok_or_else(|| {
                    exception(ExcKind::IndexError, format!("{kind} index out of range"))
                })?;
                Ok(SeqItem::One(items[index].clone()))
            }
            other => throw(
                ExcKind::TypeError,
                format!(
                    "{kind} indices must be integers or slices, not {}",
                    other.type_name()
                ),
            ),
        }
    }

    fn store_subscript(&mut self, container: &Value, key: Value, value: Value) -> Flow<()> {
        match container {
            Value::List(items) => {
                let mut items = lock(items);
                let index = match &key {
                    Value::Int(_) | Value::Bool(_) => normalize_index(key.as_index()?, items.len())
                        .ok_or_else(|| {
                            exception(ExcKind::IndexError, "list assignment index out of range")
                        })?,
                    other => {
                        return throw(
                            ExcKind::TypeError,
                            format!("list indices must be integers, not {}", other.type_name()),
                        )
                    }
                };
                items[index] = value;
                Ok(())
            }
            Value::Dict(dict) => lock(dict).insert(key, value),
            other => throw(
                ExcKind::TypeError,
                format!(
                    "'{}' object does not support item assignment",
                    other.type_name()
                ),
            ),
        }
    }

    pub fn binary(&mut self, op: BinOp, left: &Value, right: &Value) -> Flow<Value> {
        if let (Some(a), Some(b)) = (left.as_num(), right.as_num()) {
            return arithmetic(op, a, b);
        }
        match (op, left, right) {
            (BinOp::Add, Value::Str(a), Value::Str(b)) => {
                self.charge((a.len() + b.len()) / 64)?;
                let mut text = String::with_capacity(a.len() + b.len());
                text.push_str(a);
                text.push_str(b);
                Ok(Value::str(text))
            }
            (BinOp::Add, Value::Str(_), other) => throw(
                ExcKind::TypeError,
                format!(
                    "can only concatenate str (not \"{}\") to str",
                    other.type_name()
                ),
            ),
            (BinOp::Add, Value::List(a), Value::List(b)) => {
                let mut items = lock(a).clone();
                items.extend(lock(b).iter().cloned());
                self.charge(items.len() / 8)?;
                Ok(Value::list(items))
            }
            (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
                let mut items = a.to_vec();
                items.extend(b.iter().cloned());
                self.charge(items.len() / 8)?;
                Ok(Value::tuple(items))
            }
            (
                BinOp::Mul,
                Value::Str(_) | Value::List(_) | Value::Tuple(_),
                Value::Int(_) | Value::Bool(_),
            ) => {
                self.repeat(left, right.as_index()?)
            }
            (
                BinOp::Mul,
                Value::Int(_) | Value::Bool(_),
                Value::Str(_) | Value::List(_) | Value::Tuple(_),
            ) => {
                self.repeat(right, left.as_index()?)
            }
            (BinOp::Mod, Value::Str(template), args) => {
                let text = format::percent_format(template, args, &mut |units| self.charge(units))?;
                Ok(Value::str(text))
            }
            _ => throw(
                ExcKind::TypeError,
                format!(
                    "unsupported operand type(s) for {}: '{}' and '{}'",
                    op.symbol(),
                    left.type_name(),
                    right.type_name()
                ),
            ),
        }
    }

    fn repeat(&mut self, sequence: &Value, count: i64) -> Flow<Value> {
        let count = count.max(0) as usize;
        let unit = sequence.size_hint();
        self.charge(unit.saturating_mul(count) / 16)?;
        Ok(match sequence {
            Value::Str(text) => Value::str(text.repeat(count)),
            Value::List(items) => {
                let items = lock(items).clone();
                Value::list(repeat_items(&items, count))
            }
            Value::Tuple(items) => Value::tuple(repeat_items(items, count)),
            _ => Value::None,
        })
    }
}

enum SeqItem {
    One(Value),
    Many(Vec<Value>),
}

fn repeat_items(items: &[Value], count: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len() * count);
    for _ in 0..count {
        out.extend(items.iter().cloned());
    }
    out
}

pub(crate) fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let position = if index < 0 { index + len } else { index };
    if position < 0 || position >= len {
        None
    } else {
        Some(position as usize)
    }
}

fn bind_slots(
    name: &str,
    params: &[Arc<str>],
    args: Vec<Value>,
    kwargs: Vec<(Arc<str>, Value)>,
) -> Flow<Vec<Option<Value>>> {
    if args.len() > params.len() {
        return throw(
            ExcKind::TypeError,
            format!(
                "{name}() takes {} positional arguments but {} were given",
                params.len(),
                args.len()
            ),
        );
    }
    let mut slots: Vec<Option<Value>> = args.into_iter().map(Some).collect();
    slots.resize(params.len(), None);
    for (key, value) in kwargs {
        let Some(position) = params.iter().position(|param| *param == key) else {
            return throw(
                ExcKind::TypeError,
                format!("{name}() got an unexpected keyword argument '{key}'"),
            );
        };
        if slots[position].is_some() {
            return throw(
                ExcKind::TypeError,
                format!("{name}() got multiple values for argument '{key}'"),
            );
        }
        slots[position] = Some(value);
    }
    Ok(slots)
}

fn make_iter(value: Value) -> Flow<Value> {
    let state = match value {
        Value::Iterator(_) => return Ok(value),
        Value::List(items) => IterState::List(items, 0),
        Value::Range(range) => IterState::Range(range, 0),
        other => IterState::Items(other.iterate()?, 0),
    };
    Ok(Value::Iterator(Arc::new(std::sync::Mutex::new(state))))
}

fn exception_matches(exc: &Value, kind: &Value) -> Flow<bool> {
    let Value::Exception(exc) = exc else {
        return Ok(false);
    };
    match kind {
        Value::ExceptionType(kind) => Ok(exc.kind.is_subclass_of(*kind)),
        Value::Tuple(kinds) => {
            for kind in kinds.iter() {
                if exception_matches(&Value::Exception(exc.clone()), kind)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => throw(
            ExcKind::TypeError,
            "catching classes that do not inherit from BaseException is not allowed",
        ),
    }
}

fn overflow() -> Interrupt {
    exception(ExcKind::OverflowError, "integer overflow")
}

pub(crate) fn arithmetic(op: BinOp, left: Num, right: Num) -> Flow<Value> {
    if let (Num::Int(a), Num::Int(b)) = (left, right) {
        return int_arithmetic(op, a, b);
    }
    let (a, b) = (left.as_f64(), right.as_f64());
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return throw(ExcKind::ZeroDivisionError, "float division by zero");
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return throw(ExcKind::ZeroDivisionError, "float floor division by zero");
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return throw(ExcKind::ZeroDivisionError, "float modulo");
            }
            let remainder = a % b;
            if remainder != 0.0 && (remainder < 0.0) != (b < 0.0) {
                remainder + b
            } else {
                remainder
            }
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return throw(
                    ExcKind::ZeroDivisionError,
                    "0.0 cannot be raised to a negative power",
                );
            }
            a.powf(b)
        }
    };
    Ok(Value::Float(value))
}

fn int_arithmetic(op: BinOp, a: i64, b: i64) -> Flow<Value> {
    let value = match op {
        BinOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinOp::Div => {
            if b == 0 {
                return throw(ExcKind::ZeroDivisionError, "division by zero");
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return throw(
                    ExcKind::ZeroDivisionError,
                    "integer division or modulo by zero",
                );
            }
            let quotient = a.checked_div(b).ok_or_else(overflow)?;
            if a % b != 0 && ((a < 0) != (b < 0)) {
                quotient - 1
            } else {
                quotient
            }
        }
        BinOp::Mod => {
            if b == 0 {
                return throw(
                    ExcKind::ZeroDivisionError,
                    "integer division or modulo by zero",
                );
            }
            let remainder = a.checked_rem(b).ok_or_else(overflow)?;
            if remainder != 0 && ((remainder < 0) != (b < 0)) {
                remainder + b
            } else {
                remainder
            }
        }
        BinOp::Pow => {
            if b < 0 {
                if a == 0 {
                    return throw(
                        ExcKind::ZeroDivisionError,
                        "0.0 cannot be raised to a negative power",
                    );
                }
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            let exponent = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exponent).ok_or_else(overflow)?
        }
    };
    Ok(Value::Int(value))
}

fn unary(op: UnaryOp, operand: &Value) -> Flow<Value> {
    match (op, operand.as_num()) {
        (UnaryOp::Not, _) => Ok(Value::Bool(!operand.truthy())),
        (UnaryOp::Neg, Some(Num::Int(value))) => {
            Ok(Value::Int(value.checked_neg().ok_or_else(overflow)?))
        }
        (UnaryOp::Neg, Some(Num::Float(value))) => Ok(Value::Float(-value)),
        (UnaryOp::Pos, Some(Num::Int(value))) => Ok(Value::Int(value)),
        (UnaryOp::Pos, Some(Num::Float(value))) => Ok(Value::Float(value)),
        (_, None) => throw(
            ExcKind::TypeError,
            format!(
                "bad operand type for unary {}: '{}'",
                if op == UnaryOp::Neg { "-" } else { "+" },
                operand.type_name()
            ),
        ),
    }
}

pub(crate) fn compare(op: CmpOp, left: &Value, right: &Value) -> Flow<bool> {
    Ok(match op {
        CmpOp::Eq => py_eq(left, right)?,
        CmpOp::NotEq => !py_eq(left, right)?,
        CmpOp::Lt => ordering(op, left, right)?.is_lt(),
        CmpOp::LtE => ordering(op, left, right)?.is_le(),
        CmpOp::Gt => ordering(op, left, right)?.is_gt(),
        CmpOp::GtE => ordering(op, left, right)?.is_ge(),
        CmpOp::In => contains(right, left)?,
        CmpOp::NotIn => !contains(right, left)?,
        CmpOp::Is => py_is(left, right),
        CmpOp::IsNot => !py_is(left, right),
    })
}

fn ordering(op: CmpOp, left: &Value, right: &Value) -> Flow<std::cmp::Ordering> {
    py_cmp(left, right).map_err(|err| match err {
        Interrupt::Raise(exc) if exc.kind == ExcKind::TypeError => cmp_error(op, left, right),
        other => other,
    })
}

fn cmp_error(op: CmpOp, left: &Value, right: &Value) -> Interrupt {
    exception(
        ExcKind::TypeError,
        format!(
            "'{}' not supported between instances of '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ),
    )
}

pub(crate) fn contains(container: &Value, item: &Value) -> Flow<bool> {
    match container {
        Value::Str(text) => match item {
            Value::Str(needle) => Ok(text.contains(needle.as_ref())),
            other => throw(
                ExcKind::TypeError,
                format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ),
            ),
        },
        Value::Dict(dict) => lock(dict).contains(item),
        Value::Range(range) => Ok(match item.as_num() {
            Some(Num::Int(value)) => {
                let len = range.len();
                len > 0 && {
                    let offset = value as i128 - range.start as i128;
                    offset % range.step as i128 == 0 && {
                        let position = offset / range.step as i128;
                        position >= 0 && position < len as i128
                    }
                }
            }
            _ => false,
        }),
        Value::List(_) | Value::Tuple(_) | Value::Iterator(_) => {
            for candidate in container.iterate()? {
                if py_eq(&candidate, item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => throw(
            ExcKind::TypeError,
            format!("argument of type '{}' is not iterable", other.type_name()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Range;

    #[test]
    fn floor_division_and_modulo_follow_python() {
        let cases = [(7, 2, 3, 1), (-7, 2, -4, 1), (7, -2, -4, -1), (-7, -2, 3, -1)];
        for (a, b, quotient, remainder) in cases {
            assert!(matches!(
                int_arithmetic(BinOp::FloorDiv, a, b).ok(),
                Some(Value::Int(q)) if q == quotient
            ));
            assert!(matches!(
                int_arithmetic(BinOp::Mod, a, b).ok(),
                Some(Value::Int(r)) if r == remainder
            ));
        }
    }

    #[test]
    fn integer_overflow_raises() {
        match int_arithmetic(BinOp::Mul, i64::MAX, 2) {
            Err(Interrupt::Raise(exc)) => assert_eq!(exc.kind, ExcKind::OverflowError),
            _ => panic!("expected OverflowError"),
        }
    }

    #[test]
    fn range_membership() {
        let range = Value::Range(Range {
            start: 0,
            stop: 10,
            step: 3,
        });
        assert!(matches!(contains(&range, &Value::Int(9)), Ok(true)));
        assert!(matches!(contains(&range, &Value::Int(4)), Ok(false)));
        assert!(matches!(contains(&range, &Value::Int(12)), Ok(false)));
    }

    #[test]
    fn negative_indices_normalize() {
        assert_eq!(normalize_index(-1, 3), Some(2));
        assert_eq!(normalize_index(3, 3), None);
        assert_eq!(normalize_index(-4, 3), None);
    }
}
