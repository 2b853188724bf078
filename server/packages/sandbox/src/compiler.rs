use std::sync::Arc;

use acp_bridge_error::SandboxError;

use crate::ast::{
    BinOp, BoolOp, CmpOp, Comprehension, Constant, Expr, ExprKind, FStringPart, Stmt, StmtKind,
    UnaryOp,
};
use crate::value::{ExcKind, Value};

#[derive(Debug)]
pub struct Code {
    pub name: String,
    pub params: Vec<Arc<str>>,
    pub num_defaults: usize,
    pub instructions: Vec<Instr>,
    pub lines: Vec<usize>,
}

#[derive(Debug, Clone)]
pub enum Instr {
    Const(Value),
    Load(Arc<str>),
    Store(Arc<str>),
    LoadAttr(Arc<str>),
    /// `container[key]`.
    Subscript,
    /// Pops key, container, value and performs `container[key] = value`.
    StoreSubscript,
    BuildSlice,
    BuildList(usize),
    BuildTuple(usize),
    BuildDict(usize),
    BuildString(usize),
    FormatValue {
        conversion: Option<char>,
        spec: Option<Arc<str>>,
    },
    /// Pops a value and appends it to the list `n` slots below the new top.
    ListAppend(usize),
    DictInsert(usize),
    Unpack(usize),
    Binary(BinOp),
    Unary(UnaryOp),
    Compare(CmpOp),
    Jump(usize),
    PopJumpIfFalse(usize),
    PopJumpIfTrue(usize),
    JumpIfFalseOrPop(usize),
    JumpIfTrueOrPop(usize),
    GetIter,
    /// Pushes the next item, or pops the iterator and jumps when exhausted.
    ForIter(usize),
    Call {
        argc: usize,
        kwnames: Arc<[Arc<str>]>,
    },
    MakeFunction(Arc<Code>),
    Return,
    Pop,
    DupTop,
    DupTopTwo,
    RotTwo,
    RotThree,
    SetupExcept(usize),
    PopExcept,
    /// `true` raises the top of stack, `false` is a bare re-raise with nothing active.
    Raise(bool),
    ExceptionMatches,
    Import(Arc<str>),
}

type CResult<T> = Result<T, SandboxError>;

struct LoopContext {
    continue_target: usize,
    breaks: Vec<usize>,
    handler_depth: usize,
    is_for: bool,
}

struct Compiler {
    instructions: Vec<Instr>,
    lines: Vec<usize>,
    line: usize,
    loops: Vec<LoopContext>,
    handler_depth: usize,
    active_exceptions: Vec<Arc<str>>,
    hidden: usize,
}

pub fn compile_module(module: &[Stmt]) -> CResult<Arc<Code>> {
    let mut compiler = Compiler::new(1);
    compiler.block(module)?;
    Ok(compiler.finish("<module>".to_string(), Vec::new(), 0))
}

impl Compiler {
    fn new(line: usize) -> Self {
        Self {
            instructions: Vec::new(),
            lines: Vec::new(),
            line,
            loops: Vec::new(),
            handler_depth: 0,
            active_exceptions: Vec::new(),
            hidden: 0,
        }
    }

    fn finish(mut self, name: String, params: Vec<Arc<str>>, num_defaults: usize) -> Arc<Code> {
        self.emit(Instr::Const(Value::None));
        self.emit(Instr::Return);
        Arc::new(Code {
            name,
            params,
            num_defaults,
            instructions: self.instructions,
            lines: self.lines,
        })
    }

    fn error(&self, message: impl Into<String>) -> SandboxError {
        SandboxError::validation(self.line, format!("syntax error: {}", message.into()))
    }

    fn emit(&mut self, instr: Instr) -> usize {
        self.instructions.push(instr);
        self.lines.push(self.line);
        self.instructions.len() - 1
    }

    fn here(&self) -> usize {
        self.instructions.len()
    }

    fn patch(&mut self, at: usize, target: usize) {
        if let Some(instr) = self.instructions.get_mut(at) {
            match instr {
                Instr::Jump(slot)
                | Instr::PopJumpIfFalse(slot)
                | Instr::PopJumpIfTrue(slot)
                | Instr::JumpIfFalseOrPop(slot)
                | Instr::JumpIfTrueOrPop(slot)
                | Instr::ForIter(slot)
                | Instr::SetupExcept(slot) => *slot = target,
                _ => {}
            }
        }
    }

    fn patch_here(&mut self, at: usize) {
        let target = self.here();
        self.patch(at, target);
    }

    fn name(&self, name: &str) -> Arc<str> {
        Arc::from(name)
    }

    fn block(&mut self, body: &[Stmt]) -> CResult<()> {
        for stmt in body {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> CResult<()> {
        self.line = stmt.line;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.expr(expr)?;
                self.emit(Instr::Pop);
            }
            StmtKind::Assign { targets, value } => {
                self.expr(value)?;
                for (position, target) in targets.iter().enumerate() {
                    if position + 1 < targets.len() {
                        self.emit(Instr::DupTop);
                    }
                    self.store(target)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.aug_assign(target, *op, value)?,
            StmtKind::If { test, body, orelse } => {
                self.expr(test)?;
                let to_else = self.emit(Instr::PopJumpIfFalse(0));
                self.block(body)?;
                if orelse.is_empty() {
                    self.patch_here(to_else);
                } else {
                    let to_end = self.emit(Instr::Jump(0));
                    self.patch_here(to_else);
                    self.block(orelse)?;
                    self.patch_here(to_end);
                }
            }
            StmtKind::While { test, body } => {
                let start = self.here();
                self.expr(test)?;
                let exit = self.emit(Instr::PopJumpIfFalse(0));
                self.loop_body(start, false, body)?;
                self.line = stmt.line;
                self.emit(Instr::Jump(start));
                self.patch_here(exit);
                self.close_loop();
            }
            StmtKind::For { target, iter, body } => {
                self.expr(iter)?;
                self.emit(Instr::GetIter);
                let start = self.emit(Instr::ForIter(0));
                self.store(target)?;
                self.loop_body(start, true, body)?;
                self.line = stmt.line;
                self.emit(Instr::Jump(start));
                self.patch_here(start);
                self.close_loop();
            }
            StmtKind::Break => {
                let Some(context) = self.loops.last() else {
                    return Err(self.error("`break` outside loop"));
                };
                let unwind = self.handler_depth - context.handler_depth;
                let is_for = context.is_for;
                for _ in 0..unwind {
                    self.emit(Instr::PopExcept);
                }
                if is_for {
                    self.emit(Instr::Pop);
                }
                let jump = self.emit(Instr::Jump(0));
                if let Some(context) = self.loops.last_mut() {
                    context.breaks.push(jump);
                }
            }
            StmtKind::Continue => {
                let Some(context) = self.loops.last() else {
                    return Err(self.error("`continue` outside loop"));
                };
                let unwind = self.handler_depth - context.handler_depth;
                let target = context.continue_target;
                for _ in 0..unwind {
                    self.emit(Instr::PopExcept);
                }
                self.emit(Instr::Jump(target));
            }
            StmtKind::Pass => {}
            StmtKind::FunctionDef { name, params, body } => {
                let mut num_defaults = 0;
                for param in params {
                    if let Some(default) = &param.default {
                        self.expr(default)?;
                        num_defaults += 1;
                    }
                }
                let mut inner = Compiler::new(stmt.line);
                inner.block(body)?;
                let code = inner.finish(
                    name.clone(),
                    params.iter().map(|param| self.name(&param.name)).collect(),
                    num_defaults,
                );
                self.line = stmt.line;
                self.emit(Instr::MakeFunction(code));
                self.emit(Instr::Store(self.name(name)));
            }
            StmtKind::Return(value) => {
                match value {
                    Some(value) => self.expr(value)?,
                    None => {
                        self.emit(Instr::Const(Value::None));
                    }
                }
                self.emit(Instr::Return);
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                if !finalbody.is_empty() {
                    return Err(self.error("`finally` blocks are not supported"));
                }
                let setup = self.emit(Instr::SetupExcept(0));
                self.handler_depth += 1;
                self.block(body)?;
                self.handler_depth -= 1;
                self.emit(Instr::PopExcept);
                self.block(orelse)?;
                let mut to_end = vec![self.emit(Instr::Jump(0))];

                self.patch_here(setup);
                self.line = stmt.line;
                let slot = self.name(&format!("$exc{}", self.hidden));
                self.hidden += 1;
                self.emit(Instr::Store(slot.clone()));
                self.active_exceptions.push(slot.clone());
                for handler in handlers {
                    self.line = handler.line;
                    let mut skip = None;
                    if let Some(kind) = &handler.kind {
                        self.emit(Instr::Load(slot.clone()));
                        self.expr(kind)?;
                        self.emit(Instr::ExceptionMatches);
                        skip = Some(self.emit(Instr::PopJumpIfFalse(0)));
                    }
                    if let Some(name) = &handler.name {
                        self.emit(Instr::Load(slot.clone()));
                        self.emit(Instr::Store(self.name(name)));
                    }
                    self.block(&handler.body)?;
                    to_end.push(self.emit(Instr::Jump(0)));
                    if let Some(skip) = skip {
                        self.patch_here(skip);
                    }
                }
                self.active_exceptions.pop();
                self.emit(Instr::Load(slot));
                self.emit(Instr::Raise(true));
                for jump in to_end {
                    self.patch_here(jump);
                }
            }
            StmtKind::Raise(exc) => match exc {
                Some(exc) => {
                    self.expr(exc)?;
                    self.emit(Instr::Raise(true));
                }
                None => match self.active_exceptions.last().cloned() {
                    Some(slot) => {
                        self.emit(Instr::Load(slot));
                        self.emit(Instr::Raise(true));
                    }
                    None => {
                        self.emit(Instr::Raise(false));
                    }
                },
            },
            StmtKind::Assert { test, message } => {
                self.expr(test)?;
                let skip = self.emit(Instr::PopJumpIfTrue(0));
                self.emit(Instr::Const(Value::ExceptionType(ExcKind::AssertionError)));
                let argc = match message {
                    Some(message) => {
                        self.expr(message)?;
                        1
                    }
                    None => 0,
                };
                self.emit(Instr::Call {
                    argc,
                    kwnames: Arc::from(Vec::new()),
                });
                self.emit(Instr::Raise(true));
                self.patch_here(skip);
            }
            StmtKind::Import(names) => {
                for alias in names {
                    self.emit(Instr::Import(self.name(&alias.name)));
                    let bound = match &alias.asname {
                        Some(asname) => asname.clone(),
                        None => alias.name.split('.').next().unwrap_or(&alias.name).to_string(),
                    };
                    self.emit(Instr::Store(self.name(&bound)));
                }
            }
            StmtKind::ImportFrom { module, names } => {
                self.emit(Instr::Import(self.name(module)));
                for alias in names {
                    self.emit(Instr::DupTop);
                    self.emit(Instr::LoadAttr(self.name(&alias.name)));
                    let bound = alias.asname.as_ref().unwrap_or(&alias.name);
                    self.emit(Instr::Store(self.name(bound)));
                }
                self.emit(Instr::Pop);
            }
            StmtKind::Unsupported { message, .. } => return Err(self.error(message.clone())),
        }
        Ok(())
    }

    fn loop_body(&mut self, start: usize, is_for: bool, body: &[Stmt]) -> CResult<()> {
        self.loops.push(LoopContext {
            continue_target: start,
            breaks: Vec::new(),
            handler_depth: self.handler_depth,
            is_for,
        });
        self.block(body)
    }

    fn close_loop(&mut self) {
        if let Some(context) = self.loops.pop() {
            for jump in context.breaks {
                self.patch_here(jump);
            }
        }
    }

    fn store(&mut self, target: &Expr) -> CResult<()> {
        self.line = target.line;
        match &target.kind {
            ExprKind::Name(name) => {
                self.emit(Instr::Store(self.name(name)));
            }
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                self.emit(Instr::Unpack(items.len()));
                for item in items {
                    self.store(item)?;
                }
            }
            ExprKind::Subscript { value, index } => {
                self.expr(value)?;
                self.expr(index)?;
                self.emit(Instr::StoreSubscript);
            }
            ExprKind::Attribute { .. } => {
                return Err(self.error("attribute assignment is not supported"))
            }
            _ => return Err(self.error("cannot assign to expression")),
        }
        Ok(())
    }

    fn aug_assign(&mut self, target: &Expr, op: BinOp, value: &Expr) -> CResult<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                self.emit(Instr::Load(self.name(name)));
                self.expr(value)?;
                self.emit(Instr::Binary(op));
                self.emit(Instr::Store(self.name(name)));
            }
            ExprKind::Subscript {
                value: container,
                index,
            } => {
                self.expr(container)?;
                self.expr(index)?;
                self.emit(Instr::DupTopTwo);
                self.emit(Instr::Subscript);
                self.expr(value)?;
                self.emit(Instr::Binary(op));
                self.emit(Instr::RotThree);
                self.emit(Instr::StoreSubscript);
            }
            _ => return Err(self.error("illegal expression for augmented assignment")),
        }
        Ok(())
    }

    fn expr(&mut self, expr: &Expr) -> CResult<()> {
        self.line = expr.line;
        match &expr.kind {
            ExprKind::Constant(constant) => {
                let value = match constant {
                    Constant::None => Value::None,
                    Constant::Bool(flag) => Value::Bool(*flag),
                    Constant::Int(value) => Value::Int(*value),
                    Constant::Float(value) => Value::Float(*value),
                    Constant::Str(text) => Value::str(text),
                };
                self.emit(Instr::Const(value));
            }
            ExprKind::FString(parts) => {
                for part in parts {
                    match part {
                        FStringPart::Literal(text) => {
                            self.emit(Instr::Const(Value::str(text)));
                        }
                        FStringPart::Field {
                            expr,
                            conversion,
                            spec,
                        } => {
                            self.expr(expr)?;
                            self.emit(Instr::FormatValue {
                                conversion: *conversion,
                                spec: spec.as_deref().map(Arc::from),
                            });
                        }
                    }
                }
                self.emit(Instr::BuildString(parts.len()));
            }
            ExprKind::Name(name) => {
                self.emit(Instr::Load(self.name(name)));
            }
            ExprKind::List(items) => {
                for item in items {
                    self.expr(item)?;
                }
                self.emit(Instr::BuildList(items.len()));
            }
            ExprKind::Tuple(items) => {
                for item in items {
                    self.expr(item)?;
                }
                self.emit(Instr::BuildTuple(items.len()));
            }
            ExprKind::Dict(pairs) => {
                for (key, value) in pairs {
                    self.expr(key)?;
                    self.expr(value)?;
                }
                self.emit(Instr::BuildDict(pairs.len()));
            }
            ExprKind::Attribute { value, attr } => {
                self.expr(value)?;
                self.line = expr.line;
                self.emit(Instr::LoadAttr(self.name(attr)));
            }
            ExprKind::Subscript { value, index } => {
                self.expr(value)?;
                self.expr(index)?;
                self.line = expr.line;
                self.emit(Instr::Subscript);
            }
            ExprKind::Slice { lower, upper, step } => {
                for part in [lower, upper, step] {
                    match part {
                        Some(part) => self.expr(part)?,
                        None => {
                            self.emit(Instr::Const(Value::None));
                        }
                    }
                }
                self.emit(Instr::BuildSlice);
            }
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                self.expr(func)?;
                for arg in args {
                    self.expr(arg)?;
                }
                for (_, value) in keywords {
                    self.expr(value)?;
                }
                self.line = expr.line;
                let kwnames: Vec<Arc<str>> =
                    keywords.iter().map(|(name, _)| self.name(name)).collect();
                self.emit(Instr::Call {
                    argc: args.len(),
                    kwnames: Arc::from(kwnames),
                });
            }
            ExprKind::BinOp { left, op, right } => {
                self.expr(left)?;
                self.expr(right)?;
                self.line = expr.line;
                self.emit(Instr::Binary(*op));
            }
            ExprKind::UnaryOp { op, operand } => {
                self.expr(operand)?;
                self.line = expr.line;
                self.emit(Instr::Unary(*op));
            }
            ExprKind::BoolOp { op, left, right } => {
                self.expr(left)?;
                let jump = match op {
                    BoolOp::And => self.emit(Instr::JumpIfFalseOrPop(0)),
                    BoolOp::Or => self.emit(Instr::JumpIfTrueOrPop(0)),
                };
                self.expr(right)?;
                self.patch_here(jump);
            }
            ExprKind::Compare { left, ops } => self.compare(left, ops, expr.line)?,
            ExprKind::IfExp { test, body, orelse } => {
                self.expr(test)?;
                let to_else = self.emit(Instr::PopJumpIfFalse(0));
                self.expr(body)?;
                let to_end = self.emit(Instr::Jump(0));
                self.patch_here(to_else);
                self.expr(orelse)?;
                self.patch_here(to_end);
            }
            ExprKind::ListComp {
                element,
                generators,
            } => {
                self.emit(Instr::BuildList(0));
                let starts = self.comprehension_loops(generators)?;
                self.expr(element)?;
                self.emit(Instr::ListAppend(generators.len() + 1));
                self.close_comprehension(starts);
            }
            ExprKind::DictComp {
                key,
                value,
                generators,
            } => {
                self.emit(Instr::BuildDict(0));
                let starts = self.comprehension_loops(generators)?;
                self.expr(key)?;
                self.expr(value)?;
                self.emit(Instr::DictInsert(generators.len() + 1));
                self.close_comprehension(starts);
            }
            ExprKind::Unsupported { message, .. } => return Err(self.error(message.clone())),
        }
        Ok(())
    }

    fn compare(&mut self, left: &Expr, ops: &[(CmpOp, Expr)], line: usize) -> CResult<()> {
        self.expr(left)?;
        let mut cleanups = Vec::new();
        for (position, (op, right)) in ops.iter().enumerate() {
            self.expr(right)?;
            self.line = line;
            if position + 1 < ops.len() {
                self.emit(Instr::DupTop);
                self.emit(Instr::RotThree);
                self.emit(Instr::Compare(*op));
                cleanups.push(self.emit(Instr::JumpIfFalseOrPop(0)));
            } else {
                self.emit(Instr::Compare(*op));
            }
        }
        if cleanups.is_empty() {
            return Ok(());
        }
        let to_end = self.emit(Instr::Jump(0));
        for cleanup in cleanups {
            self.patch_here(cleanup);
        }
        self.emit(Instr::RotTwo);
        self.emit(Instr::Pop);
        self.patch_here(to_end);
        Ok(())
    }

    fn comprehension_loops(&mut self, generators: &[Comprehension]) -> CResult<Vec<usize>> {
        let mut starts = Vec::with_capacity(generators.len());
        for generator in generators {
            self.expr(&generator.iter)?;
            self.emit(Instr::GetIter);
            let start = self.emit(Instr::ForIter(0));
            starts.push(start);
            self.store(&generator.target)?;
            for condition in &generator.ifs {
                self.expr(condition)?;
                self.emit(Instr::PopJumpIfFalse(start));
            }
        }
        Ok(starts)
    }

    fn close_comprehension(&mut self, starts: Vec<usize>) {
        for start in starts.into_iter().rev() {
            self.emit(Instr::Jump(start));
            self.patch_here(start);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    fn compile(source: &str) -> Arc<Code> {
        let module = parse_module(source).expect("parse");
        compile_module(&module).expect("compile")
    }

    #[test]
    fn module_ends_with_implicit_return() {
        let code = compile("x = 1\n");
        let tail = &code.instructions[code.instructions.len() - 2..];
        assert!(matches!(tail[0], Instr::Const(Value::None)));
        assert!(matches!(tail[1], Instr::Return));
        assert_eq!(code.lines.len(), code.instructions.len());
    }

    #[test]
    fn jumps_are_patched_in_range() {
        let code = compile(
            "for i in range(3):\n    if i == 1:\n        continue\n    try:\n        break\
             \n    except ValueError as e:\n        raise\nx = [a for a in y if a]\n",
        );
        let len = code.instructions.len();
        for instr in &code.instructions {
            match instr {
                Instr::Jump(target)
                | Instr::PopJumpIfFalse(target)
                | Instr::PopJumpIfTrue(target)
                | Instr::JumpIfFalseOrPop(target)
                | Instr::JumpIfTrueOrPop(target)
                | Instr::ForIter(target)
                | Instr::SetupExcept(target) => {
                    assert!(*target > 0 && *target < len, "bad target in {instr:?}")
                }
                _ => {}
            }
        }
    }

    #[test]
    fn break_inside_try_pops_handler_and_iterator() {
        let code =
            compile("for i in x:\n    try:\n        break\n    except Exception:\n        pass\n");
        let position = code
            .instructions
            .iter()
            .position(|instr| matches!(instr, Instr::PopExcept))
            .expect("pop except");
        assert!(matches!(code.instructions[position + 1], Instr::Pop));
        assert!(matches!(code.instructions[position + 2], Instr::Jump(_)));
    }

    #[test]
    fn functions_record_defaults() {
        let code = compile("def f(a, b=1, c=2):\n    return a\n");
        let function = code
            .instructions
            .iter()
            .find_map(|instr| match instr {
                Instr::MakeFunction(code) => Some(code.clone()),
                _ => None,
            })
            .expect("function");
        assert_eq!(function.name, "f");
        assert_eq!(function.params.len(), 3);
        assert_eq!(function.num_defaults, 2);
    }
}
