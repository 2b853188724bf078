use acp_bridge_error::{SandboxError, Violation};

use crate::ast::{Comprehension, Expr, ExprKind, FStringPart, Stmt, StmtKind};
use crate::parser::parse_module;

pub const BANNED_BUILTINS: &[&str] = &[
    "eval",
    "exec",
    "open",
    "compile",
    "__import__",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "input",
];

/// Parses `source` and checks it against the allow-list. Every violation is
/// collected; nothing is executed.
pub fn validate(source: &str, allowed_modules: &[String]) -> Result<Vec<Stmt>, SandboxError> {
    let module = parse_module(source).map_err(|err| {
        SandboxError::validation(err.line, format!("syntax error: {}", err.message))
    })?;

    let mut validator = Validator {
        allowed_modules,
        violations: Vec::new(),
        loop_depth: 0,
    };
    validator.block(&module);

    if validator.violations.is_empty() {
        Ok(module)
    } else {
        let mut violations = validator.violations;
        violations.sort_by_key(|violation| violation.line);
        Err(SandboxError::Validation { violations })
    }
}

struct Validator<'a> {
    allowed_modules: &'a [String],
    violations: Vec<Violation>,
    loop_depth: usize,
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

impl Validator<'_> {
    fn report(&mut self, line: usize, message: impl Into<String>) {
        self.violations.push(Violation {
            line,
            message: message.into(),
        });
    }

    fn check_module(&mut self, line: usize, module: &str) {
        let root = module.split('.').next().unwrap_or(module);
        if !self.allowed_modules.iter().any(|allowed| allowed == root) {
            self.report(line, format!("import of module `{module}` is not allowed"));
        }
    }

    fn check_binding(&mut self, line: usize, name: &str) {
        if is_dunder(name) {
            self.report(line, format!("access to dunder name `{name}` is not allowed"));
        } else if BANNED_BUILTINS.contains(&name) {
            self.report(line, format!("use of builtin `{name}` is not allowed"));
        }
    }

    fn block(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Expr(expr) => self.expr(expr),
            StmtKind::Assign { targets, value } => {
                for target in targets {
                    self.expr(target);
                }
                self.expr(value);
            }
            StmtKind::AugAssign { target, value, .. } => {
                self.expr(target);
                self.expr(value);
            }
            StmtKind::If { test, body, orelse } => {
                self.expr(test);
                self.block(body);
                self.block(orelse);
            }
            StmtKind::While { test, body } => {
                self.expr(test);
                self.loop_body(body);
            }
            StmtKind::For { target, iter, body } => {
                self.expr(target);
                self.expr(iter);
                self.loop_body(body);
            }
            StmtKind::Break | StmtKind::Continue => {
                if self.loop_depth == 0 {
                    let keyword = if matches!(stmt.kind, StmtKind::Break) {
                        "break"
                    } else {
                        "continue"
                    };
                    self.report(line, format!("syntax error: `{keyword}` outside loop"));
                }
            }
            StmtKind::Pass => {}
            StmtKind::FunctionDef { name, params, body } => {
                self.check_binding(line, name);
                for param in params {
                    self.check_binding(line, &param.name);
                    if let Some(default) = &param.default {
                        self.expr(default);
                    }
                }
                let outer = std::mem::replace(&mut self.loop_depth, 0);
                self.block(body);
                self.loop_depth = outer;
            }
            StmtKind::Return(value) | StmtKind::Raise(value) => {
                if let Some(value) = value {
                    self.expr(value);
                }
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                self.block(body);
                for handler in handlers {
                    if let Some(kind) = &handler.kind {
                        self.expr(kind);
                    }
                    if let Some(name) = &handler.name {
                        self.check_binding(handler.line, name);
                    }
                    self.block(&handler.body);
                }
                self.block(orelse);
                if !finalbody.is_empty() {
                    self.report(line, "`finally` blocks are not supported");
                    self.block(finalbody);
                }
            }
            StmtKind::Assert { test, message } => {
                self.expr(test);
                if let Some(message) = message {
                    self.expr(message);
                }
            }
            StmtKind::Import(names) => {
                for alias in names {
                    self.check_module(line, &alias.name);
                    if let Some(asname) = &alias.asname {
                        self.check_binding(line, asname);
                    }
                }
            }
            StmtKind::ImportFrom { module, names } => {
                if module.starts_with('.') {
                    self.report(line, "relative imports are not allowed");
                } else {
                    self.check_module(line, module);
                }
                for alias in names {
                    if alias.name == "*" {
                        self.report(line, "wildcard imports are not allowed");
                        continue;
                    }
                    self.check_binding(line, &alias.name);
                    if let Some(asname) = &alias.asname {
                        self.check_binding(line, asname);
                    }
                }
            }
            StmtKind::Unsupported { message, body } => {
                self.report(line, message.clone());
                self.block(body);
            }
        }
    }

    fn loop_body(&mut self, body: &[Stmt]) {
        self.loop_depth += 1;
        self.block(body);
        self.loop_depth -= 1;
    }

    fn comprehension(&mut self, generators: &[Comprehension]) {
        for generator in generators {
            self.expr(&generator.target);
            self.expr(&generator.iter);
            for condition in &generator.ifs {
                self.expr(condition);
            }
        }
    }

    fn expr(&mut self, expr: &Expr) {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Constant(_) => {}
            ExprKind::FString(parts) => {
                for part in parts {
                    if let FStringPart::Field { expr, .. } = part {
                        self.expr(expr);
                    }
                }
            }
            ExprKind::Name(name) => self.check_binding(line, name),
            ExprKind::List(items) | ExprKind::Tuple(items) => {
                for item in items {
                    self.expr(item);
                }
            }
            ExprKind::Dict(pairs) => {
                for (key, value) in pairs {
                    self.expr(key);
                    self.expr(value);
                }
            }
            ExprKind::Attribute { value, attr } => {
                if attr.starts_with("__") {
                    self.report(line, format!("access to attribute `{attr}` is not allowed"));
                }
                self.expr(value);
            }
            ExprKind::Subscript { value, index } => {
                self.expr(value);
                self.expr(index);
            }
            ExprKind::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.expr(part);
                }
            }
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                self.expr(func);
                for arg in args {
                    self.expr(arg);
                }
                for (_, value) in keywords {
                    self.expr(value);
                }
            }
            ExprKind::BinOp { left, right, .. } | ExprKind::BoolOp { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
            ExprKind::UnaryOp { operand, .. } => self.expr(operand),
            ExprKind::Compare { left, ops } => {
                self.expr(left);
                for (_, right) in ops {
                    self.expr(right);
                }
            }
            ExprKind::IfExp { test, body, orelse } => {
                self.expr(test);
                self.expr(body);
                self.expr(orelse);
            }
            ExprKind::ListComp {
                element,
                generators,
            } => {
                self.comprehension(generators);
                self.expr(element);
            }
            ExprKind::DictComp {
                key,
                value,
                generators,
            } => {
                self.comprehension(generators);
                self.expr(key);
                self.expr(value);
            }
            ExprKind::Unsupported { message, operands } => {
                self.report(line, message.clone());
                for operand in operands {
                    self.expr(operand);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<String> {
        vec!["json".to_string()]
    }

    fn violations(source: &str) -> Vec<Violation> {
        match validate(source, &allowed()) {
            Err(SandboxError::Validation { violations }) => violations,
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn accepts_plain_scripts() {
        let source = "import json\nfrom json import dumps as d\nx = [i * 2 for i in range(3)]\
                      \nprint(d(x))\n";
        assert!(validate(source, &allowed()).is_ok());
    }

    #[test]
    fn reports_every_violation_with_lines() {
        let found = violations("import os\nx = 1\nclass A:\n    pass\ny = eval('1')\n");
        let rendered: Vec<_> = found.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "line 1: import of module `os` is not allowed",
                "line 3: class definitions are not allowed",
                "line 5: use of builtin `eval` is not allowed",
            ]
        );
    }

    #[test]
    fn rejects_dunder_access() {
        let found = violations("x = ().__class__\ny = __builtins__\n");
        assert_eq!(found.len(), 2);
        assert!(found[0].message.contains("__class__"));
        assert!(found[1].message.contains("__builtins__"));
    }

    #[test]
    fn rejects_disallowed_syntax() {
        let found = violations(
            "global g\nf = lambda: 1\nwith x:\n    pass\ndel f\ntry:\n    pass\nfinally:\
             \n    pass\n",
        );
        assert_eq!(found.len(), 5);
    }

    #[test]
    fn syntax_errors_become_violations() {
        let found = violations("x = (1,\n");
        assert_eq!(found.len(), 1);
        assert!(found[0].message.starts_with("syntax error"));
    }

    #[test]
    fn break_outside_loop() {
        let found = violations("def f():\n    break\n");
        assert_eq!(found[0].message, "syntax error: `break` outside loop");
    }

    #[test]
    fn import_restrictions() {
        let found = violations(
            "from . import x\nfrom json import *\nimport json.decoder\nimport subprocess\n",
        );
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].message, "relative imports are not allowed");
        assert_eq!(found[1].message, "wildcard imports are not allowed");
        assert_eq!(found[2].line, 4);
    }
}
