use crate::ast::{
    Alias, BinOp, BoolOp, CmpOp, Comprehension, Constant, ExceptHandler, Expr, ExprKind,
    FStringPart, Param, Stmt, StmtKind, UnaryOp,
};
use crate::lexer::{tokenize, FPiece, SyntaxError, Tok, Token};

type PResult<T> = Result<T, SyntaxError>;

/// Deepest nesting of brackets, unary operators and blocks a script may use.
pub(crate) const MAX_NESTING: usize = 100;

pub fn parse_module(source: &str) -> PResult<Vec<Stmt>> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    parser.parse_file()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    /// Runs `parse` one nesting level deeper, refusing to go past [`MAX_NESTING`].
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(format!("too many nested levels (limit {MAX_NESTING})")));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    /// One more link of a left-nested chain (`a + b + c`, `f()()`). The tree
    /// grows a level per link even though the parser only loops.
    fn deepen(&mut self) -> PResult<()> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(format!("too many nested levels (limit {MAX_NESTING})")));
        }
        self.depth += 1;
        Ok(())
    }

    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        let index = (self.pos + offset).min(self.tokens.len().saturating_sub(1));
        self.tokens.get(index).map(|token| &token.tok).unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        let index = self.pos.min(self.tokens.len().saturating_sub(1));
        self.tokens.get(index).map(|token| token.line).unwrap_or(1)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(self.line(), message)
    }

    fn unexpected(&self) -> SyntaxError {
        match self.peek() {
            Tok::Indent => self.error("unexpected indent"),
            tok => self.error(format!("invalid syntax: unexpected {tok}")),
        }
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(found) if *found == op)
    }

    fn is_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Keyword(found) if *found == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.is_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.is_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> PResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{op}`, found {}", self.peek())))
        }
    }

    fn expect_kw(&mut self, kw: &str) -> PResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{kw}`, found {}", self.peek())))
        }
    }

    fn expect_name(&mut self) -> PResult<String> {
        match self.peek().clone() {
            Tok::Name(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected a name, found {other}"))),
        }
    }

    fn starts_expression(&self) -> bool {
        match self.peek() {
            Tok::Name(_) | Tok::Int(_) | Tok::Float(_) | Tok::Str(_) | Tok::FStr(_) => true,
            Tok::Keyword(kw) => matches!(
                *kw,
                "True" | "False" | "None" | "not" | "lambda" | "await" | "yield"
            ),
            Tok::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+" | "~" | "..."),
            _ => false,
        }
    }

    fn parse_file(&mut self) -> PResult<Vec<Stmt>> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Eof => break,
                Tok::Newline => {
                    self.advance();
                }
                _ => body.extend(self.parse_statement()?),
            }
        }
        Ok(body)
    }

    fn parse_statement(&mut self) -> PResult<Vec<Stmt>> {
        let keyword = match self.peek() {
            Tok::Keyword(kw) => Some(*kw),
            Tok::Indent => return Err(self.unexpected()),
            Tok::Op("@") => return Ok(vec![self.parse_decorated()?]),
            _ => None,
        };
        match keyword {
            Some("if") => Ok(vec![self.parse_if()?]),
            Some("while") => Ok(vec![self.parse_while()?]),
            Some("for") => Ok(vec![self.parse_for()?]),
            Some("def") => Ok(vec![self.parse_def()?]),
            Some("try") => Ok(vec![self.parse_try()?]),
            Some("class") => Ok(vec![self.parse_class()?]),
            Some("with") => Ok(vec![self.parse_with()?]),
            Some("async") => Ok(vec![self.parse_async()?]),
            _ => self.parse_simple_line(),
        }
    }

    fn parse_simple_line(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = vec![self.parse_simple()?];
        while self.eat_op(";") {
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                break;
            }
            stmts.push(self.parse_simple()?);
        }
        match self.peek() {
            Tok::Newline => {
                self.advance();
                Ok(stmts)
            }
            Tok::Eof => Ok(stmts),
            other => Err(self.error(format!("invalid syntax: unexpected {other}"))),
        }
    }

    fn parse_block(&mut self) -> PResult<Vec<Stmt>> {
        self.nested(Self::parse_block_body)
    }

    fn parse_block_body(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_op(":")?;
        if !matches!(self.peek(), Tok::Newline) {
            return self.parse_simple_line();
        }
        self.advance();
        if !matches!(self.peek(), Tok::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.advance();
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Dedent => {
                    self.advance();
                    break;
                }
                Tok::Eof => break,
                Tok::Newline => {
                    self.advance();
                }
                _ => body.extend(self.parse_statement()?),
            }
        }
        Ok(body)
    }

    fn no_loop_else(&self) -> PResult<()> {
        if self.is_kw("else") {
            Err(self.error("`else` clauses on loops are not supported"))
        } else {
            Ok(())
        }
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        let test = self.parse_test()?;
        let body = self.parse_block()?;
        let orelse = if self.is_kw("elif") {
            vec![self.nested(Self::parse_if)?]
        } else if self.eat_kw("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            kind: StmtKind::If { test, body, orelse },
            line,
        })
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        let test = self.parse_test()?;
        let body = self.parse_block()?;
        self.no_loop_else()?;
        Ok(Stmt {
            kind: StmtKind::While { test, body },
            line,
        })
    }

    fn parse_for(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        let target = self.parse_target_list()?;
        self.expect_kw("in")?;
        let iter = self.parse_test_list()?;
        let body = self.parse_block()?;
        self.no_loop_else()?;
        Ok(Stmt {
            kind: StmtKind::For { target, iter, body },
            line,
        })
    }

    fn parse_def(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let mut params: Vec<Param> = Vec::new();
        while !self.is_op(")") {
            if self.is_op("*") || self.is_op("**") || self.is_op("/") {
                return Err(self.error("variadic and keyword-only parameters are not supported"));
            }
            let param = self.expect_name()?;
            if self.eat_op(":") {
                self.parse_test()?;
            }
            let default = if self.eat_op("=") {
                Some(self.parse_test()?)
            } else {
                None
            };
            if default.is_none() && params.iter().any(|p| p.default.is_some()) {
                return Err(self.error("non-default argument follows default argument"));
            }
            if params.iter().any(|p| p.name == param) {
                return Err(
                    self.error(format!("duplicate argument `{param}` in function definition"))
                );
            }
            params.push(Param {
                name: param,
                default,
            });
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.parse_test()?;
        }
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::FunctionDef { name, params, body },
            line,
        })
    }

    fn parse_try(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        let body = self.parse_block()?;
        let mut handlers = Vec::new();
        while self.is_kw("except") {
            let handler_line = self.line();
            self.advance();
            let (kind, name) = if self.is_op(":") {
                (None, None)
            } else {
                let kind = self.parse_test()?;
                let name = if self.eat_kw("as") {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                (Some(kind), name)
            };
            let body = self.parse_block()?;
            handlers.push(ExceptHandler {
                kind,
                name,
                body,
                line: handler_line,
            });
        }
        let orelse = if !handlers.is_empty() && self.eat_kw("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat_kw("finally") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.error("expected `except` or `finally` block"));
        }
        Ok(Stmt {
            kind: StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            },
            line,
        })
    }

    fn parse_class(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        self.expect_name()?;
        if self.eat_op("(") {
            while !self.is_op(")") {
                self.parse_test()?;
                if !self.eat_op(",") {
                    break;
                }
            }
            self.expect_op(")")?;
        }
        let body = self.parse_block()?;
        Ok(unsupported_stmt("class definitions are not allowed", body, line))
    }

    fn parse_with(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        loop {
            self.parse_test()?;
            if self.eat_kw("as") {
                self.parse_target_list()?;
            }
            if !self.eat_op(",") {
                break;
            }
        }
        let body = self.parse_block()?;
        Ok(unsupported_stmt("`with` statements are not allowed", body, line))
    }

    fn parse_async(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        if !(self.is_kw("def") || self.is_kw("for") || self.is_kw("with")) {
            return Err(self.unexpected());
        }
        let inner = self.parse_statement()?;
        Ok(unsupported_stmt("`async` code is not allowed", inner, line))
    }

    fn parse_decorated(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        self.parse_test()?;
        if !matches!(self.peek(), Tok::Newline) {
            return Err(self.unexpected());
        }
        self.advance();
        let inner = self.parse_statement()?;
        Ok(unsupported_stmt("decorators are not allowed", inner, line))
    }

    fn at_simple_end(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Op(";"))
    }

    fn parse_simple(&mut self) -> PResult<Stmt> {
        let line = self.line();
        let keyword = match self.peek() {
            Tok::Keyword(kw) => Some(*kw),
            _ => None,
        };
        let kind = match keyword {
            Some("pass") => {
                self.advance();
                StmtKind::Pass
            }
            Some("break") => {
                self.advance();
                StmtKind::Break
            }
            Some("continue") => {
                self.advance();
                StmtKind::Continue
            }
            Some("return") => {
                self.advance();
                if self.at_simple_end() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.parse_test_list()?))
                }
            }
            Some("raise") => {
                self.advance();
                let exc = if self.at_simple_end() {
                    None
                } else {
                    Some(self.parse_test()?)
                };
                if self.eat_kw("from") {
                    self.parse_test()?;
                }
                StmtKind::Raise(exc)
            }
            Some(kw @ ("global" | "nonlocal")) => {
                self.advance();
                loop {
                    self.expect_name()?;
                    if !self.eat_op(",") {
                        break;
                    }
                }
                StmtKind::Unsupported {
                    message: format!("`{kw}` statements are not allowed"),
                    body: Vec::new(),
                }
            }
            Some("del") => {
                self.advance();
                self.parse_test_list()?;
                StmtKind::Unsupported {
                    message: "`del` statements are not allowed".to_string(),
                    body: Vec::new(),
                }
            }
            Some("import") => self.parse_import()?,
            Some("from") => self.parse_from()?,
            Some("assert") => {
                self.advance();
                let test = self.parse_test()?;
                let message = if self.eat_op(",") {
                    Some(self.parse_test()?)
                } else {
                    None
                };
                StmtKind::Assert { test, message }
            }
            _ => self.parse_expression_statement()?,
        };
        Ok(Stmt { kind, line })
    }

    fn parse_expression_statement(&mut self) -> PResult<StmtKind> {
        let first = self.parse_test_list()?;
        if self.is_op("=") {
            let mut targets = vec![first];
            while self.eat_op("=") {
                targets.push(self.parse_test_list()?);
            }
            let value = targets.pop().ok_or_else(|| self.error("invalid assignment"))?;
            return Ok(StmtKind::Assign { targets, value });
        }
        if let Tok::Op(op) = self.peek() {
            let aug = match *op {
                "+=" => Some(BinOp::Add),
                "-=" => Some(BinOp::Sub),
                "*=" => Some(BinOp::Mul),
                "/=" => Some(BinOp::Div),
                "//=" => Some(BinOp::FloorDiv),
                "%=" => Some(BinOp::Mod),
                "**=" => Some(BinOp::Pow),
                "&=" | "|=" | "^=" | "<<=" | ">>=" => {
                    return Err(self.error(format!("operator `{op}` is not supported")))
                }
                _ => None,
            };
            if let Some(op) = aug {
                self.advance();
                let value = self.parse_test_list()?;
                return Ok(StmtKind::AugAssign {
                    target: first,
                    op,
                    value,
                });
            }
        }
        if self.eat_op(":") {
            // Annotated assignment; the annotation is ignored.
            self.parse_test()?;
            if self.eat_op("=") {
                let value = self.parse_test_list()?;
                return Ok(StmtKind::Assign {
                    targets: vec![first],
                    value,
                });
            }
            return Ok(StmtKind::Pass);
        }
        Ok(StmtKind::Expr(first))
    }

    fn parse_dotted_name(&mut self) -> PResult<String> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn parse_import(&mut self) -> PResult<StmtKind> {
        self.advance();
        let mut names = Vec::new();
        loop {
            let name = self.parse_dotted_name()?;
            let asname = if self.eat_kw("as") {
                Some(self.expect_name()?)
            } else {
                None
            };
            names.push(Alias { name, asname });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(StmtKind::Import(names))
    }

    fn parse_from(&mut self) -> PResult<StmtKind> {
        self.advance();
        let mut module = String::new();
        while self.is_op(".") || self.is_op("...") {
            if let Tok::Op(op) = self.advance() {
                module.push_str(op);
            }
        }
        if !self.is_kw("import") {
            module.push_str(&self.parse_dotted_name()?);
        }
        self.expect_kw("import")?;
        if self.eat_op("*") {
            return Ok(StmtKind::ImportFrom {
                module,
                names: vec![Alias {
                    name: "*".to_string(),
                    asname: None,
                }],
            });
        }
        let parenthesized = self.eat_op("(");
        let mut names = Vec::new();
        loop {
            if parenthesized && self.is_op(")") {
                break;
            }
            let name = self.expect_name()?;
            let asname = if self.eat_kw("as") {
                Some(self.expect_name()?)
            } else {
                None
            };
            names.push(Alias { name, asname });
            if !self.eat_op(",") {
                break;
            }
        }
        if parenthesized {
            self.expect_op(")")?;
        }
        Ok(StmtKind::ImportFrom { module, names })
    }

    /// Assignment targets of `for` loops and comprehensions; stops before `in`.
    fn parse_target_list(&mut self) -> PResult<Expr> {
        let line = self.line();
        let first = self.parse_arith()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_kw("in") || self.is_op("=") || self.is_op(":") {
                break;
            }
            items.push(self.parse_arith()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), line))
    }

    fn parse_test_list(&mut self) -> PResult<Expr> {
        let line = self.line();
        let first = self.parse_test()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expression() {
                break;
            }
            items.push(self.parse_test()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), line))
    }

    fn parse_test(&mut self) -> PResult<Expr> {
        self.nested(Self::parse_test_inner)
    }

    fn parse_test_inner(&mut self) -> PResult<Expr> {
        let line = self.line();
        if self.is_kw("lambda") {
            return self.parse_lambda();
        }
        if self.eat_kw("yield") {
            self.eat_kw("from");
            let operands = if self.starts_expression() {
                vec![self.parse_test_list()?]
            } else {
                Vec::new()
            };
            return Ok(Expr::new(
                ExprKind::Unsupported {
                    message: "`yield` is not allowed".to_string(),
                    operands,
                },
                line,
            ));
        }
        let body = self.parse_or()?;
        if self.eat_kw("if") {
            let test = self.parse_or()?;
            self.expect_kw("else")?;
            let orelse = self.parse_test()?;
            return Ok(Expr::new(
                ExprKind::IfExp {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
                line,
            ));
        }
        Ok(body)
    }

    fn parse_lambda(&mut self) -> PResult<Expr> {
        let line = self.line();
        self.advance();
        while !self.is_op(":") {
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                return Err(self.error("expected `:` in lambda"));
            }
            self.advance();
        }
        self.advance();
        let body = self.parse_test()?;
        Ok(Expr::new(
            ExprKind::Unsupported {
                message: "lambda expressions are not allowed".to_string(),
                operands: vec![body],
            },
            line,
        ))
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut left = self.parse_and()?;
        let base = self.depth;
        while self.is_kw("or") {
            self.deepen()?;
            let line = self.line();
            self.advance();
            let right = self.parse_and()?;
            left = Expr::new(
                ExprKind::BoolOp {
                    op: BoolOp::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            );
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut left = self.parse_not()?;
        let base = self.depth;
        while self.is_kw("and") {
            self.deepen()?;
            let line = self.line();
            self.advance();
            let right = self.parse_not()?;
            left = Expr::new(
                ExprKind::BoolOp {
                    op: BoolOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            );
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_not(&mut self) -> PResult<Expr> {
        if self.is_kw("not") {
            let line = self.line();
            self.advance();
            let operand = self.nested(Self::parse_not)?;
            return Ok(Expr::new(
                ExprKind::UnaryOp {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                line,
            ));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let line = self.line();
        let left = self.parse_arith()?;
        let mut ops = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Op("==") => CmpOp::Eq,
                Tok::Op("!=") => CmpOp::NotEq,
                Tok::Op("<") => CmpOp::Lt,
                Tok::Op("<=") => CmpOp::LtE,
                Tok::Op(">") => CmpOp::Gt,
                Tok::Op(">=") => CmpOp::GtE,
                Tok::Keyword("in") => CmpOp::In,
                Tok::Keyword("is") => {
                    if matches!(self.peek_at(1), Tok::Keyword("not")) {
                        self.advance();
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                Tok::Keyword("not") if matches!(self.peek_at(1), Tok::Keyword("in")) => {
                    self.advance();
                    CmpOp::NotIn
                }
                _ => break,
            };
            self.advance();
            ops.push((op, self.parse_arith()?));
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr::new(
            ExprKind::Compare {
                left: Box::new(left),
                ops,
            },
            line,
        ))
    }

    fn parse_arith(&mut self) -> PResult<Expr> {
        let mut left = self.parse_term()?;
        let base = self.depth;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                Tok::Op(op @ ("|" | "&" | "^" | "<<" | ">>")) => {
                    return Err(self.error(format!("operator `{op}` is not supported")))
                }
                _ => break,
            };
            self.deepen()?;
            let line = self.line();
            self.advance();
            let right = self.parse_term()?;
            left = binop(left, op, right, line);
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_term(&mut self) -> PResult<Expr> {
        let mut left = self.parse_factor()?;
        let base = self.depth;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                Tok::Op("@") => return Err(self.error("operator `@` is not supported")),
                _ => break,
            };
            self.deepen()?;
            let line = self.line();
            self.advance();
            let right = self.parse_factor()?;
            left = binop(left, op, right, line);
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_factor(&mut self) -> PResult<Expr> {
        let line = self.line();
        let op = match self.peek() {
            Tok::Op("-") => UnaryOp::Neg,
            Tok::Op("+") => UnaryOp::Pos,
            Tok::Op("~") => return Err(self.error("operator `~` is not supported")),
            _ => return self.parse_power(),
        };
        self.advance();
        let operand = self.nested(Self::parse_factor)?;
        Ok(Expr::new(
            ExprKind::UnaryOp {
                op,
                operand: Box::new(operand),
            },
            line,
        ))
    }

    fn parse_power(&mut self) -> PResult<Expr> {
        let base = self.parse_primary()?;
        if self.is_op("**") {
            let line = self.line();
            self.advance();
            let exponent = self.nested(Self::parse_factor)?;
            return Ok(binop(base, BinOp::Pow, exponent, line));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let line = self.line();
        if self.eat_kw("await") {
            let operand = self.nested(Self::parse_primary)?;
            return Ok(Expr::new(
                ExprKind::Unsupported {
                    message: "`await` is not allowed".to_string(),
                    operands: vec![operand],
                },
                line,
            ));
        }
        let mut expr = self.parse_atom()?;
        let base = self.depth;
        loop {
            if self.is_op("(") || self.is_op("[") || self.is_op(".") {
                self.deepen()?;
            }
            let line = self.line();
            if self.is_op("(") {
                expr = self.parse_call(expr)?;
            } else if self.eat_op("[") {
                let index = self.parse_subscript()?;
                self.expect_op("]")?;
                expr = Expr::new(
                    ExprKind::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                    },
                    line,
                );
            } else if self.eat_op(".") {
                let attr = self.expect_name()?;
                expr = Expr::new(
                    ExprKind::Attribute {
                        value: Box::new(expr),
                        attr,
                    },
                    line,
                );
            } else {
                break;
            }
        }
        self.depth = base;
        Ok(expr)
    }

    fn parse_subscript(&mut self) -> PResult<Expr> {
        let line = self.line();
        let first = self.parse_slice_item()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op("]") {
                break;
            }
            items.push(self.parse_slice_item()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), line))
    }

    fn parse_slice_item(&mut self) -> PResult<Expr> {
        let line = self.line();
        let lower = if self.is_op(":") {
            None
        } else {
            Some(self.parse_test()?)
        };
        if !self.eat_op(":") {
            return lower.ok_or_else(|| self.unexpected());
        }
        let bound_end = |p: &Self| p.is_op(":") || p.is_op("]") || p.is_op(",");
        let upper = if bound_end(self) {
            None
        } else {
            Some(Box::new(self.parse_test()?))
        };
        let step = if self.eat_op(":") {
            if self.is_op("]") || self.is_op(",") {
                None
            } else {
                Some(Box::new(self.parse_test()?))
            }
        } else {
            None
        };
        Ok(Expr::new(
            ExprKind::Slice {
                lower: lower.map(Box::new),
                upper,
                step,
            },
            line,
        ))
    }

    fn parse_call(&mut self, func: Expr) -> PResult<Expr> {
        let line = self.line();
        self.advance();
        let mut args = Vec::new();
        let mut keywords: Vec<(String, Expr)> = Vec::new();
        loop {
            if self.eat_op(")") {
                break;
            }
            if self.is_op("*") || self.is_op("**") {
                return Err(self.error("star-arguments are not supported"));
            }
            let keyword = match (self.peek(), self.peek_at(1)) {
                (Tok::Name(name), Tok::Op("=")) => Some(name.clone()),
                _ => None,
            };
            if let Some(name) = keyword {
                self.advance();
                self.advance();
                if keywords.iter().any(|(existing, _)| *existing == name) {
                    return Err(self.error(format!("keyword argument repeated: {name}")));
                }
                let value = self.parse_test()?;
                keywords.push((name, value));
            } else {
                let arg_line = self.line();
                let mut arg = self.parse_test()?;
                if self.is_kw("for") {
                    let generators = self.parse_comprehension()?;
                    arg = Expr::new(
                        ExprKind::ListComp {
                            element: Box::new(arg),
                            generators,
                        },
                        arg_line,
                    );
                }
                if !keywords.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(arg);
            }
            if !self.eat_op(",") {
                self.expect_op(")")?;
                break;
            }
        }
        Ok(Expr::new(
            ExprKind::Call {
                func: Box::new(func),
                args,
                keywords,
            },
            line,
        ))
    }

    fn parse_comprehension(&mut self) -> PResult<Vec<Comprehension>> {
        let mut generators = Vec::new();
        while self.eat_kw("for") {
            let target = self.parse_target_list()?;
            self.expect_kw("in")?;
            let iter = self.parse_or()?;
            let mut ifs = Vec::new();
            while self.eat_kw("if") {
                ifs.push(self.parse_or()?);
            }
            generators.push(Comprehension { target, iter, ifs });
        }
        Ok(generators)
    }

    fn parse_atom(&mut self) -> PResult<Expr> {
        let line = self.line();
        let tok = self.peek().clone();
        let kind = match tok {
            Tok::Name(name) => {
                self.advance();
                ExprKind::Name(name)
            }
            Tok::Int(value) => {
                self.advance();
                ExprKind::Constant(Constant::Int(value))
            }
            Tok::Float(value) => {
                self.advance();
                ExprKind::Constant(Constant::Float(value))
            }
            Tok::Str(_) | Tok::FStr(_) => self.parse_strings()?,
            Tok::Keyword("True") => {
                self.advance();
                ExprKind::Constant(Constant::Bool(true))
            }
            Tok::Keyword("False") => {
                self.advance();
                ExprKind::Constant(Constant::Bool(false))
            }
            Tok::Keyword("None") => {
                self.advance();
                ExprKind::Constant(Constant::None)
            }
            Tok::Op("(") => {
                self.advance();
                return self.parse_paren(line);
            }
            Tok::Op("[") => {
                self.advance();
                return self.parse_list(line);
            }
            Tok::Op("{") => {
                self.advance();
                return self.parse_brace(line);
            }
            Tok::Op("...") => {
                self.advance();
                ExprKind::Unsupported {
                    message: "`...` is not supported".to_string(),
                    operands: Vec::new(),
                }
            }
            _ => return Err(self.unexpected()),
        };
        Ok(Expr::new(kind, line))
    }

    fn parse_paren(&mut self, line: usize) -> PResult<Expr> {
        if self.eat_op(")") {
            return Ok(Expr::new(ExprKind::Tuple(Vec::new()), line));
        }
        let first = self.parse_test()?;
        if self.is_kw("for") {
            let generators = self.parse_comprehension()?;
            self.expect_op(")")?;
            return Ok(Expr::new(
                ExprKind::ListComp {
                    element: Box::new(first),
                    generators,
                },
                line,
            ));
        }
        if self.eat_op(")") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op(")") {
                break;
            }
            items.push(self.parse_test()?);
        }
        self.expect_op(")")?;
        Ok(Expr::new(ExprKind::Tuple(items), line))
    }

    fn parse_list(&mut self, line: usize) -> PResult<Expr> {
        if self.eat_op("]") {
            return Ok(Expr::new(ExprKind::List(Vec::new()), line));
        }
        let first = self.parse_test()?;
        if self.is_kw("for") {
            let generators = self.parse_comprehension()?;
            self.expect_op("]")?;
            return Ok(Expr::new(
                ExprKind::ListComp {
                    element: Box::new(first),
                    generators,
                },
                line,
            ));
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op("]") {
                break;
            }
            items.push(self.parse_test()?);
        }
        self.expect_op("]")?;
        Ok(Expr::new(ExprKind::List(items), line))
    }

    fn parse_brace(&mut self, line: usize) -> PResult<Expr> {
        if self.eat_op("}") {
            return Ok(Expr::new(ExprKind::Dict(Vec::new()), line));
        }
        if self.is_op("**") {
            return Err(self.error("dictionary unpacking is not supported"));
        }
        let first = self.parse_test()?;
        if !self.eat_op(":") {
            // Set display or set comprehension.
            let mut operands = vec![first];
            if self.is_kw("for") {
                self.parse_comprehension()?;
            }
            while self.eat_op(",") {
                if self.is_op("}") {
                    break;
                }
                operands.push(self.parse_test()?);
            }
            self.expect_op("}")?;
            return Ok(Expr::new(
                ExprKind::Unsupported {
                    message: "set literals are not supported".to_string(),
                    operands,
                },
                line,
            ));
        }
        let value = self.parse_test()?;
        if self.is_kw("for") {
            let generators = self.parse_comprehension()?;
            self.expect_op("}")?;
            return Ok(Expr::new(
                ExprKind::DictComp {
                    key: Box::new(first),
                    value: Box::new(value),
                    generators,
                },
                line,
            ));
        }
        let mut pairs = vec![(first, value)];
        while self.eat_op(",") {
            if self.is_op("}") {
                break;
            }
            let key = self.parse_test()?;
            self.expect_op(":")?;
            let value = self.parse_test()?;
            pairs.push((key, value));
        }
        self.expect_op("}")?;
        Ok(Expr::new(ExprKind::Dict(pairs), line))
    }

    /// Adjacent string literals concatenate; any f-string makes the whole run one.
    fn parse_strings(&mut self) -> PResult<ExprKind> {
        let mut parts: Vec<FStringPart> = Vec::new();
        let mut plain = String::new();
        let mut formatted = false;
        loop {
            match self.peek().clone() {
                Tok::Str(text) => {
                    self.advance();
                    plain.push_str(&text);
                }
                Tok::FStr(pieces) => {
                    let piece_line = self.line();
                    self.advance();
                    formatted = true;
                    for piece in pieces {
                        match piece {
                            FPiece::Literal(text) => plain.push_str(&text),
                            FPiece::Field {
                                source,
                                conversion,
                                spec,
                            } => {
                                if !plain.is_empty() {
                                    parts.push(FStringPart::Literal(std::mem::take(&mut plain)));
                                }
                                let expr = parse_fragment(&source, piece_line, self.depth)?;
                                parts.push(FStringPart::Field {
                                    expr,
                                    conversion,
                                    spec,
                                });
                            }
                        }
                    }
                }
                _ => break,
            }
        }
        if !formatted {
            return Ok(ExprKind::Constant(Constant::Str(plain)));
        }
        if !plain.is_empty() {
            parts.push(FStringPart::Literal(plain));
        }
        Ok(ExprKind::FString(parts))
    }
}

fn binop(left: Expr, op: BinOp, right: Expr, line: usize) -> Expr {
    Expr::new(
        ExprKind::BinOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        },
        line,
    )
}

fn unsupported_stmt(message: &str, body: Vec<Stmt>, line: usize) -> Stmt {
    Stmt {
        kind: StmtKind::Unsupported {
            message: message.to_string(),
            body,
        },
        line,
    }
}

/// Parses the expression inside an f-string field, continuing the enclosing
/// parser's nesting depth.
fn parse_fragment(source: &str, line: usize, depth: usize) -> PResult<Expr> {
    let mut tokens = tokenize(source).map_err(|err| SyntaxError::new(line, err.message))?;
    for token in &mut tokens {
        token.line = line;
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth,
    };
    let expr = parser.parse_test_list()?;
    while matches!(parser.peek(), Tok::Newline) {
        parser.advance();
    }
    if !matches!(parser.peek(), Tok::Eof) {
        return Err(SyntaxError::new(line, "f-string: invalid expression"));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Vec<Stmt> {
        parse_module(source).expect("parse")
    }

    #[test]
    fn parses_nested_blocks() {
        let module = parse(
            "def f(a, b=2):\n    for i in range(a):\n        if i > b:\n            return i\
             \n    return None\nx = f(5)\n",
        );
        assert_eq!(module.len(), 2);
        match &module[0].kind {
            StmtKind::FunctionDef { name, params, body } => {
                assert_eq!(name, "f");
                assert_eq!(params.len(), 2);
                assert!(params[1].default.is_some());
                assert_eq!(body.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(module[1].line, 6);
    }

    #[test]
    fn semicolons_separate_statements() {
        let module = parse("x = 1; y = 2; print(x + y)\n");
        assert_eq!(module.len(), 3);
    }

    #[test]
    fn chained_comparison_and_keywords() {
        let module = parse("ok = 0 < x <= 10 and name not in seen\nf(a, key=len)\n");
        match &module[0].kind {
            StmtKind::Assign { value, .. } => {
                assert!(matches!(value.kind, ExprKind::BoolOp { op: BoolOp::And, .. }))
            }
            other => panic!("unexpected {other:?}"),
        }
        match &module[1].kind {
            StmtKind::Expr(Expr {
                kind: ExprKind::Call { keywords, .. },
                ..
            }) => assert_eq!(keywords[0].0, "key"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn disallowed_constructs_still_parse() {
        let module =
            parse("class A:\n    pass\nf = lambda x: x\nwith open('a') as fh:\n    pass\n");
        assert!(matches!(module[0].kind, StmtKind::Unsupported { .. }));
        match &module[1].kind {
            StmtKind::Assign { value, .. } => {
                assert!(matches!(value.kind, ExprKind::Unsupported { .. }))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(module[2].kind, StmtKind::Unsupported { .. }));
    }

    #[test]
    fn fstring_fields_become_expressions() {
        let module = parse("s = f'{a + 1}-{b!r}'\n");
        match &module[0].kind {
            StmtKind::Assign { value, .. } => match &value.kind {
                ExprKind::FString(parts) => assert_eq!(parts.len(), 3),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn deep_nesting_is_a_syntax_error() {
        let deep_list = format!("x = {}{}\n", "[".repeat(50_000), "]".repeat(50_000));
        let deep_parens = format!("x = {}1{}\n", "(".repeat(100_000), ")".repeat(100_000));
        let long_sum = format!("x = {}1\n", "1 + ".repeat(100_000));
        let long_calls = format!("x = f{}\n", "()".repeat(100_000));
        let unary = format!("x = {}1\n", "-".repeat(100_000));
        let mut elifs = String::from("if x == 0:\n    pass\n");
        for n in 1..=500 {
            elifs.push_str(&format!("elif x == {n}:\n    pass\n"));
        }
        for source in [deep_list, deep_parens, long_sum, long_calls, unary, elifs] {
            let err = parse_module(&source).expect_err("nesting limit");
            assert!(err.message.contains("too many nested levels"), "{}", err.message);
        }
    }

    #[test]
    fn moderate_nesting_parses() {
        let nested = format!("x = {}1{}\n", "[".repeat(40), "]".repeat(40));
        let sum = format!("x = {}1\n", "1 + ".repeat(40));
        let fstring = "s = f'{((1, [2]))}'\n";
        for source in [nested.as_str(), sum.as_str(), fstring] {
            parse_module(source).expect("parses");
        }
    }

    #[test]
    fn reports_line_of_syntax_error() {
        let err = parse_module("x = 1\ny = 2 +\nz = 3\n").expect_err("dangling operator");
        assert_eq!(err.line, 2);
    }
}
