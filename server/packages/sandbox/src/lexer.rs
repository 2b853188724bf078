use std::fmt;

pub const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=",
    "%=", "&=", "|=", "^=", "->", ":=", "<<", ">>", "+", "-", "*", "/", "%", "<", ">", "=", "(",
    ")", "[", "]", "{", "}", ",", ":", ".", ";", "@", "&", "|", "^", "~",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Keyword(&'static str),
    Int(i64),
    Float(f64),
    Str(String),
    FStr(Vec<FPiece>),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Name(name) => write!(f, "name `{name}`"),
            Tok::Keyword(kw) => write!(f, "keyword `{kw}`"),
            Tok::Int(value) => write!(f, "number `{value}`"),
            Tok::Float(value) => write!(f, "number `{value}`"),
            Tok::Str(_) | Tok::FStr(_) => f.write_str("string literal"),
            Tok::Op(op) => write!(f, "`{op}`"),
            Tok::Newline => f.write_str("end of line"),
            Tok::Indent => f.write_str("indent"),
            Tok::Dedent => f.write_str("dedent"),
            Tok::Eof => f.write_str("end of input"),
        }
    }
}

/// Piece of an f-string: literal text or a `{expr!conv:spec}` field.
#[derive(Debug, Clone, PartialEq)]
pub enum FPiece {
    Literal(String),
    Field {
        source: String,
        conversion: Option<char>,
        spec: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub line: usize,
    pub message: String,
}

impl SyntaxError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    indents: Vec<usize>,
    depth: usize,
    at_line_start: bool,
    tokens: Vec<Token>,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        indents: vec![0],
        depth: 0,
        at_line_start: true,
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }

    fn run(&mut self) -> Result<(), SyntaxError> {
        loop {
            if self.at_line_start && self.depth == 0 {
                if !self.indentation()? {
                    break;
                }
            }
            let Some(c) = self.peek(0) else { break };
            match c {
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        self.push(Tok::Newline);
                        self.at_line_start = true;
                    }
                    self.line += 1;
                }
                '#' => self.skip_comment(),
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\\' if self.peek(1) == Some('\r') && self.peek(2) == Some('\n') => {
                    self.pos += 3;
                    self.line += 1;
                }
                c if c.is_ascii_digit() => self.number()?,
                '.' if self.peek(1).is_some_and(|n| n.is_ascii_digit()) => self.number()?,
                c if c.is_alphabetic() || c == '_' => self.word()?,
                '"' | '\'' => {
                    let text = self.string(false)?;
                    self.push(Tok::Str(text));
                }
                _ => self.operator()?,
            }
        }

        if self
            .tokens
            .last()
            .is_some_and(|token| !matches!(token.tok, Tok::Newline))
        {
            self.push(Tok::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(())
    }

    /// Measures the indentation of a logical line and emits INDENT/DEDENT.
    /// Returns false at end of input.
    fn indentation(&mut self) -> Result<bool, SyntaxError> {
        loop {
            let mut column = 0;
            while let Some(c) = self.peek(0) {
                match c {
                    ' ' => column += 1,
                    '\t' => column = (column / 8 + 1) * 8,
                    '\x0c' | '\r' => {}
                    _ => break,
                }
                self.pos += 1;
            }
            match self.peek(0) {
                None => return Ok(false),
                Some('\n') => {
                    self.pos += 1;
                    self.line += 1;
                }
                Some('#') => self.skip_comment(),
                Some(_) => {
                    let current = *self.indents.last().unwrap_or(&0);
                    if column > current {
                        self.indents.push(column);
                        self.push(Tok::Indent);
                    } else {
                        while column < *self.indents.last().unwrap_or(&0) {
                            self.indents.pop();
                            self.push(Tok::Dedent);
                        }
                        if column != *self.indents.last().unwrap_or(&0) {
                            return Err(SyntaxError::new(
                                self.line,
                                "unindent does not match any outer indentation level",
                            ));
                        }
                    }
                    self.at_line_start = false;
                    return Ok(true);
                }
            }
        }
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn number(&mut self) -> Result<(), SyntaxError> {
        let start = self.pos;
        if self.peek(0) == Some('0') {
            let radix = match self.peek(1) {
                Some('x' | 'X') => Some(16),
                Some('o' | 'O') => Some(8),
                Some('b' | 'B') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.pos += 2;
                let digits = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
                let digits = digits.replace('_', "");
                let value = i64::from_str_radix(&digits, radix).map_err(|_| {
                    SyntaxError::new(self.line, format!("invalid number literal `{digits}`"))
                })?;
                self.push(Tok::Int(value));
                return Ok(());
            }
        }

        let mut is_float = false;
        self.take_while(|c| c.is_ascii_digit() || c == '_');
        if self.peek(0) == Some('.') && self.peek(1).map_or(true, |c| c != '.') {
            is_float = true;
            self.pos += 1;
            self.take_while(|c| c.is_ascii_digit() || c == '_');
        }
        if matches!(self.peek(0), Some('e' | 'E')) {
            let sign = matches!(self.peek(1), Some('+' | '-'));
            let digit_at = if sign { 2 } else { 1 };
            if self.peek(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                self.pos += digit_at;
                self.take_while(|c| c.is_ascii_digit());
            }
        }
        if matches!(self.peek(0), Some('j' | 'J')) {
            return Err(SyntaxError::new(self.line, "complex numbers are not supported"));
        }

        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|_| {
                    SyntaxError::new(self.line, format!("invalid number literal `{text}`"))
                })?;
            self.push(Tok::Float(value));
        } else {
            let value = text.parse::<i64>().map_err(|_| {
                SyntaxError::new(self.line, format!("integer literal `{text}` is too large"))
            })?;
            self.push(Tok::Int(value));
        }
        Ok(())
    }

    fn take_while(&mut self, predicate: impl Fn(char) -> bool) -> String {
        let start = self.pos;
        while self.peek(0).is_some_and(&predicate) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn word(&mut self) -> Result<(), SyntaxError> {
        let word = self.take_while(|c| c.is_alphanumeric() || c == '_');
        if matches!(self.peek(0), Some('"' | '\'')) {
            let prefix = word.to_ascii_lowercase();
            let (raw, fstring) = match prefix.as_str() {
                "r" => (true, false),
                "f" => (false, true),
                "rf" | "fr" => (true, true),
                "u" => (false, false),
                "b" | "br" | "rb" => {
                    return Err(SyntaxError::new(self.line, "bytes literals are not supported"))
                }
                _ => {
                    self.push_word(word);
                    return Ok(());
                }
            };
            let line = self.line;
            let text = self.string(raw)?;
            let tok = if fstring {
                Tok::FStr(split_fstring(&text, line)?)
            } else {
                Tok::Str(text)
            };
            self.tokens.push(Token { tok, line });
            return Ok(());
        }
        self.push_word(word);
        Ok(())
    }

    fn push_word(&mut self, word: String) {
        match KEYWORDS.iter().find(|kw| **kw == word) {
            Some(kw) => self.push(Tok::Keyword(kw)),
            None => self.push(Tok::Name(word)),
        }
    }

    fn string(&mut self, raw: bool) -> Result<String, SyntaxError> {
        let start_line = self.line;
        let quote = self.peek(0).unwrap_or('"');
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let mut out = String::new();
        loop {
            let Some(c) = self.peek(0) else {
                return Err(SyntaxError::new(start_line, "unterminated string literal"));
            };
            if c == quote {
                if !triple {
                    self.pos += 1;
                    return Ok(out);
                }
                if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                    self.pos += 3;
                    return Ok(out);
                }
            }
            if c == '\n' {
                if !triple {
                    return Err(SyntaxError::new(start_line, "unterminated string literal"));
                }
                self.line += 1;
            }
            if c == '\\' {
                let next = self.peek(1);
                if raw {
                    out.push('\\');
                    if let Some(next) = next {
                        if next == '\n' {
                            self.line += 1;
                        }
                        out.push(next);
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                    }
                    continue;
                }
                self.pos += 2;
                match next {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('0') => out.push('\0'),
                    Some('\\') => out.push('\\'),
                    Some('\'') => out.push('\''),
                    Some('"') => out.push('"'),
                    Some('\n') => self.line += 1,
                    Some('x') => out.push(self.hex_escape(2)?),
                    Some('u') => out.push(self.hex_escape(4)?),
                    Some('U') => out.push(self.hex_escape(8)?),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => {
                        return Err(SyntaxError::new(start_line, "unterminated string literal"))
                    }
                }
                continue;
            }
            out.push(c);
            self.pos += 1;
        }
    }

    fn hex_escape(&mut self, len: usize) -> Result<char, SyntaxError> {
        let digits: String = self.chars[self.pos..(self.pos + len).min(self.chars.len())]
            .iter()
            .collect();
        self.pos += digits.chars().count();
        u32::from_str_radix(&digits, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| SyntaxError::new(self.line, format!("invalid escape `\\{digits}`")))
    }

    fn operator(&mut self) -> Result<(), SyntaxError> {
        for op in OPERATORS {
            let matches = op
                .chars()
                .enumerate()
                .all(|(i, c)| self.peek(i) == Some(c));
            if matches {
                self.pos += op.chars().count();
                match *op {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
                    _ => {}
                }
                self.push(Tok::Op(op));
                return Ok(());
            }
        }
        let c = self.peek(0).unwrap_or(' ');
        Err(SyntaxError::new(self.line, format!("unexpected character `{c}`")))
    }
}

/// Splits decoded f-string text into literal and field pieces.
fn split_fstring(text: &str, line: usize) -> Result<Vec<FPiece>, SyntaxError> {
    let chars: Vec<char> = text.chars().collect();
    let mut pieces = Vec::new();
    let mut literal = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '{' {
            if chars.get(i + 1) == Some(&'{') {
                literal.push('{');
                i += 2;
                continue;
            }
            if !literal.is_empty() {
                pieces.push(FPiece::Literal(std::mem::take(&mut literal)));
            }
            let (piece, next) = parse_field(&chars, i + 1, line)?;
            pieces.push(piece);
            i = next;
            continue;
        }
        if c == '}' {
            if chars.get(i + 1) == Some(&'}') {
                literal.push('}');
                i += 2;
                continue;
            }
            return Err(SyntaxError::new(line, "f-string: single '}' is not allowed"));
        }
        literal.push(c);
        i += 1;
    }
    if !literal.is_empty() {
        pieces.push(FPiece::Literal(literal));
    }
    Ok(pieces)
}

/// Parses `expr[!conv][:spec]}` starting after the opening brace.
pub(crate) fn parse_field(
    chars: &[char],
    start: usize,
    line: usize,
) -> Result<(FPiece, usize), SyntaxError> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut i = start;
    let mut source = String::new();
    let mut conversion = None;
    loop {
        let Some(&c) = chars.get(i) else {
            return Err(SyntaxError::new(line, "f-string: expecting '}'"));
        };
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            source.push(c);
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                source.push(c);
            }
            '(' | '[' | '{' => {
                depth += 1;
                source.push(c);
            }
            ')' | ']' | '}' if depth > 0 => {
                depth -= 1;
                source.push(c);
            }
            '!' if depth == 0 && chars.get(i + 1) != Some(&'=') => {
                let conv = chars.get(i + 1).copied();
                if !matches!(conv, Some('r' | 's' | 'a')) {
                    return Err(SyntaxError::new(line, "f-string: invalid conversion character"));
                }
                conversion = conv;
                i += 2;
                continue;
            }
            ':' | '}' if depth == 0 => break,
            _ => source.push(c),
        }
        i += 1;
    }

    let mut spec = None;
    if chars.get(i) == Some(&':') {
        i += 1;
        let mut text = String::new();
        loop {
            match chars.get(i) {
                Some('}') => break,
                Some(c) => {
                    text.push(*c);
                    i += 1;
                }
                None => return Err(SyntaxError::new(line, "f-string: expecting '}'")),
            }
        }
        spec = Some(text);
    }
    if source.trim().is_empty() {
        return Err(SyntaxError::new(line, "f-string: empty expression not allowed"));
    }
    Ok((
        FPiece::Field {
            source: source.trim().to_string(),
            conversion,
            spec,
        },
        i + 1,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Tok> {
        tokenize(source)
            .expect("tokenize")
            .into_iter()
            .map(|token| token.tok)
            .collect()
    }

    #[test]
    fn emits_indent_and_dedent() {
        let toks = kinds("if x:\n    y = 1\n\n    # note\nz = 2\n");
        assert_eq!(
            toks,
            vec![
                Tok::Keyword("if"),
                Tok::Name("x".into()),
                Tok::Op(":"),
                Tok::Newline,
                Tok::Indent,
                Tok::Name("y".into()),
                Tok::Op("="),
                Tok::Int(1),
                Tok::Newline,
                Tok::Dedent,
                Tok::Name("z".into()),
                Tok::Op("="),
                Tok::Int(2),
                Tok::Newline,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn brackets_join_lines() {
        let toks = kinds("x = [1,\n  2]\n");
        assert!(!toks[..toks.len() - 2].contains(&Tok::Newline));
    }

    #[test]
    fn fstring_fields() {
        let toks = kinds("f'{name!r:>5} and {{x}}'");
        assert_eq!(
            toks[0],
            Tok::FStr(vec![
                FPiece::Field {
                    source: "name".into(),
                    conversion: Some('r'),
                    spec: Some(">5".into()),
                },
                FPiece::Literal(" and {x}".into()),
            ])
        );
    }

    #[test]
    fn triple_quoted_strings_track_lines() {
        let tokens = tokenize("s = '''a\nb'''\nx = 1\n").expect("tokenize");
        let x = tokens
            .iter()
            .find(|token| token.tok == Tok::Name("x".into()))
            .expect("x");
        assert_eq!(x.line, 3);
    }

    #[test]
    fn bad_dedent_is_an_error() {
        let err = tokenize("if x:\n    y = 1\n  z = 2\n").expect_err("bad dedent");
        assert_eq!(err.line, 3);
    }
}
