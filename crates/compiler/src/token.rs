//! Tokenizer and preprocessor
//!
//! Tokens are produced from a layered input: a stack of open files (an
//! `#include` pushes a file) plus an in-memory expansion buffer that
//! takes lexical priority (macro expansions land there). Whitespace and
//! `/* .. */` comments are skipped; the physical line count advances
//! only in the outermost file, so diagnostics always point into the file
//! the compile was asked for.
//!
//! Preprocessor directives are recognized only when `#` is the first
//! non-whitespace character on a line: `#define` (object-like and
//! parameterized), `#undef`, `#include "mudlib path"` and
//! `#include <system path>`. A trailing `\` splices the next physical
//! line. Macro expansion is detected as runaway by a depth counter and
//! fails the compile when it exceeds the cap. String literal contents
//! are never re-scanned for macro names.

use crate::{CompileEnv, CompileError};
use tern_core::Op;

/// Identifiers longer than this are a compile error.
pub const MAX_IDENT_LEN: usize = 31;

const MAX_EXPAND_DEPTH: u32 = 64;
const MAX_INCLUDE_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Eof,
    Name(String),
    Str(String),
    Int(i64),
    /// `int`, `string`, `object`: storage is untyped, so one token.
    VarDecl,
    /// `mapping`
    MappingDecl,
    Static,
    If,
    Else,
    While,
    For,
    Do,
    Return,
    Inherit,
    Comma,
    Semi,
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Colon,
    ColonColon,
    Dot,
    Arrow,
    /// `({`
    ArrayOpen,
    /// `})`
    ArrayClose,
    /// `([`
    MapOpen,
    /// `])`
    MapClose,
    Oper(Op),
}

#[derive(Debug, Clone)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
}

#[derive(Debug, Clone)]
struct Define {
    name: String,
    body: String,
    /// `Some` for function-like macros, with the parameter names.
    params: Option<Vec<String>>,
}

struct Frame {
    chars: Vec<char>,
    pos: usize,
    /// True until a non-directive, non-whitespace char is seen on the
    /// current line; gates `#` directive recognition.
    line_blank: bool,
}

impl Frame {
    fn new(text: &str) -> Frame {
        Frame {
            chars: text.chars().collect(),
            pos: 0,
            line_blank: true,
        }
    }
}

pub struct Lexer {
    /// File stack; index 0 is the outermost file.
    frames: Vec<Frame>,
    /// Macro-expanded text, consumed before any file input.
    expansion: Vec<char>,
    exp_pos: usize,
    putback: Option<Token>,
    defines: Vec<Define>,
    expand_depth: u32,
    pub phys_line: u32,
}

impl Lexer {
    pub fn new(source: &str) -> Lexer {
        Lexer {
            frames: vec![Frame::new(source)],
            expansion: Vec::new(),
            exp_pos: 0,
            putback: None,
            defines: Vec::new(),
            expand_depth: 0,
            phys_line: 1,
        }
    }

    fn err(&self, message: impl Into<String>) -> CompileError {
        CompileError {
            line: self.phys_line,
            message: message.into(),
        }
    }

    fn in_expansion(&self) -> bool {
        self.exp_pos < self.expansion.len()
    }

    /// Next raw character, favoring the expansion buffer, then the file
    /// stack top-down. Line accounting happens only in the outermost
    /// file.
    fn next_char(&mut self) -> Option<char> {
        if self.in_expansion() {
            let c = self.expansion[self.exp_pos];
            self.exp_pos += 1;
            if !self.in_expansion() {
                self.expansion.clear();
                self.exp_pos = 0;
                self.expand_depth = 0;
            }
            return Some(c);
        }
        loop {
            let outermost = self.frames.len() == 1;
            let frame = self.frames.last_mut()?;
            if frame.pos >= frame.chars.len() {
                if self.frames.len() > 1 {
                    self.frames.pop();
                    continue;
                }
                return None;
            }
            let c = frame.chars[frame.pos];
            frame.pos += 1;
            if c == '\n' {
                frame.line_blank = true;
                if outermost {
                    self.phys_line += 1;
                }
            } else if !c.is_whitespace() && c != '#' {
                frame.line_blank = false;
            }
            return Some(c);
        }
    }

    fn peek_char(&self) -> Option<char> {
        if self.in_expansion() {
            return Some(self.expansion[self.exp_pos]);
        }
        for frame in self.frames.iter().rev() {
            if frame.pos < frame.chars.len() {
                return Some(frame.chars[frame.pos]);
            }
        }
        None
    }

    /// Consume the next char when it equals `want`.
    fn eat_char(&mut self, want: char) -> bool {
        if self.peek_char() == Some(want) {
            self.next_char();
            true
        } else {
            false
        }
    }

    /// True when `#` just read should start a directive: we are reading
    /// file input and nothing but whitespace preceded it on this line.
    fn at_directive(&self) -> bool {
        if self.in_expansion() {
            return false;
        }
        self.frames.last().map(|f| f.line_blank).unwrap_or(false)
    }

    /// Read the rest of the current line from the current file, splicing
    /// `\` continuations. Never reads past the end of the file the
    /// directive appeared in.
    fn read_directive_line(&mut self) -> String {
        let mut out = String::new();
        let depth = self.frames.len();
        loop {
            let more = match self.frames.last() {
                Some(f) if self.frames.len() == depth => f.pos < f.chars.len(),
                _ => false,
            };
            if !more {
                break;
            }
            let c = self.peek_char().unwrap();
            if c == '\n' {
                if out.ends_with('\\') {
                    out.pop();
                    self.next_char();
                    continue;
                }
                break;
            }
            out.push(c);
            self.next_char();
        }
        out
    }

    fn find_define(&self, name: &str) -> Option<Define> {
        self.defines.iter().find(|d| d.name == name).cloned()
    }

    fn process_directive(&mut self, env: &mut dyn CompileEnv) -> Result<(), CompileError> {
        let line = self.read_directive_line();
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("define") {
            self.directive_define(rest.trim_start())
        } else if let Some(rest) = line.strip_prefix("undef") {
            let name = rest.trim();
            self.defines.retain(|d| d.name != name);
            Ok(())
        } else if let Some(rest) = line.strip_prefix("include") {
            self.directive_include(rest.trim(), env)
        } else {
            Err(self.err(format!("unknown preprocessor directive '#{}'", line)))
        }
    }

    fn directive_define(&mut self, rest: &str) -> Result<(), CompileError> {
        let mut chars = rest.char_indices().peekable();
        let mut name = String::new();
        while let Some(&(_, c)) = chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                name.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(self.err("expected name after #define"));
        }
        // A '(' with no intervening space makes the macro function-like.
        let mut params = None;
        let mut body_start = name.len();
        if rest[body_start..].starts_with('(') {
            let close = rest[body_start..]
                .find(')')
                .ok_or_else(|| self.err(format!("unterminated parameter list in #define {}", name)))?;
            let list = &rest[body_start + 1..body_start + close];
            let names: Vec<String> = if list.trim().is_empty() {
                Vec::new()
            } else {
                list.split(',').map(|p| p.trim().to_string()).collect()
            };
            if names.iter().any(|p| p.is_empty()) {
                return Err(self.err(format!("bad parameter list in #define {}", name)));
            }
            params = Some(names);
            body_start += close + 1;
        }
        let body = rest[body_start..].trim().to_string();
        self.defines.retain(|d| d.name != name);
        self.defines.push(Define { name, body, params });
        Ok(())
    }

    fn directive_include(
        &mut self,
        rest: &str,
        env: &mut dyn CompileEnv,
    ) -> Result<(), CompileError> {
        let (path, system) = if rest.starts_with('"') && rest.len() >= 2 && rest.ends_with('"') {
            (&rest[1..rest.len() - 1], false)
        } else if rest.starts_with('<') && rest.ends_with('>') {
            (&rest[1..rest.len() - 1], true)
        } else {
            return Err(self.err("expected \"path\" or <path> after #include"));
        };
        if self.frames.len() >= MAX_INCLUDE_DEPTH {
            return Err(self.err("include depth exceeded"));
        }
        let text = env
            .load_source(path, system)
            .map_err(|e| self.err(format!("cannot include '{}': {}", path, e)))?;
        self.frames.push(Frame::new(&text));
        Ok(())
    }

    /// Expand a macro occurrence: substitute actuals into the body
    /// (function-like) and prepend the result to the expansion buffer.
    fn expand(&mut self, def: &Define, env: &mut dyn CompileEnv) -> Result<(), CompileError> {
        self.expand_depth += 1;
        if self.expand_depth > MAX_EXPAND_DEPTH {
            return Err(self.err(format!("macro expansion too deep at '{}'", def.name)));
        }
        let body = match &def.params {
            None => def.body.clone(),
            Some(params) => {
                // Function-like: the call's actuals must follow.
                self.skip_blank(env)?;
                if !self.eat_char('(') {
                    return Err(self.err(format!("macro '{}' requires arguments", def.name)));
                }
                let actuals = self.read_macro_actuals(&def.name)?;
                if actuals.len() != params.len() {
                    return Err(self.err(format!(
                        "macro '{}' expects {} argument(s), got {}",
                        def.name,
                        params.len(),
                        actuals.len()
                    )));
                }
                substitute(&def.body, params, &actuals)
            }
        };
        let mut new: Vec<char> = body.chars().collect();
        new.push(' ');
        new.extend_from_slice(&self.expansion[self.exp_pos..]);
        self.expansion = new;
        self.exp_pos = 0;
        Ok(())
    }

    /// Comma-separated actuals up to the matching ')'. Nested parens and
    /// string literals are respected.
    fn read_macro_actuals(&mut self, name: &str) -> Result<Vec<String>, CompileError> {
        let mut actuals = Vec::new();
        let mut current = String::new();
        let mut depth = 0u32;
        loop {
            let c = self
                .next_char()
                .ok_or_else(|| self.err(format!("unterminated call of macro '{}'", name)))?;
            match c {
                '(' => {
                    depth += 1;
                    current.push(c);
                }
                ')' if depth == 0 => {
                    if !current.trim().is_empty() || !actuals.is_empty() {
                        actuals.push(current.trim().to_string());
                    }
                    return Ok(actuals);
                }
                ')' => {
                    depth -= 1;
                    current.push(c);
                }
                ',' if depth == 0 => {
                    actuals.push(current.trim().to_string());
                    current.clear();
                }
                '"' => {
                    current.push(c);
                    loop {
                        let s = self.next_char().ok_or_else(|| {
                            self.err(format!("unterminated string in call of macro '{}'", name))
                        })?;
                        current.push(s);
                        if s == '\\' {
                            if let Some(esc) = self.next_char() {
                                current.push(esc);
                            }
                        } else if s == '"' {
                            break;
                        }
                    }
                }
                _ => current.push(c),
            }
        }
    }

    /// Skip whitespace, comments, and directives. Leaves the stream at
    /// the first significant character.
    fn skip_blank(&mut self, env: &mut dyn CompileEnv) -> Result<(), CompileError> {
        loop {
            match self.peek_char() {
                None => return Ok(()),
                Some(c) if c.is_whitespace() => {
                    self.next_char();
                }
                Some('\\') => {
                    // Line continuation outside a directive: splice.
                    self.next_char();
                    if !self.eat_char('\n') {
                        return Err(self.err("stray '\\'"));
                    }
                }
                Some('/') if self.peek_char2() == Some('*') => {
                    self.next_char();
                    self.next_char();
                    loop {
                        match self.next_char() {
                            None => return Err(self.err("unterminated comment")),
                            Some('*') if self.eat_char('/') => break,
                            Some(_) => {}
                        }
                    }
                }
                Some('#') if self.at_directive() => {
                    self.next_char();
                    self.process_directive(env)?;
                }
                Some(_) => return Ok(()),
            }
        }
    }

    /// The character after the current peek. Looks across the
    /// expansion/file boundary but not across file-stack frames.
    fn peek_char2(&self) -> Option<char> {
        if self.in_expansion() {
            if self.exp_pos + 1 < self.expansion.len() {
                return Some(self.expansion[self.exp_pos + 1]);
            }
            return self
                .frames
                .iter()
                .rev()
                .find(|f| f.pos < f.chars.len())
                .map(|f| f.chars[f.pos]);
        }
        let frame = self.frames.iter().rev().find(|f| f.pos < f.chars.len())?;
        frame.chars.get(frame.pos + 1).copied()
    }

    pub fn unget(&mut self, token: Token) {
        debug_assert!(self.putback.is_none(), "double putback");
        self.putback = Some(token);
    }

    pub fn next(&mut self, env: &mut dyn CompileEnv) -> Result<Token, CompileError> {
        if let Some(t) = self.putback.take() {
            return Ok(t);
        }
        self.skip_blank(env)?;
        let line = self.phys_line;
        let tok = self.scan(env)?;
        Ok(Token { tok, line })
    }

    fn scan(&mut self, env: &mut dyn CompileEnv) -> Result<Tok, CompileError> {
        let c = match self.next_char() {
            None => return Ok(Tok::Eof),
            Some(c) => c,
        };
        if c.is_ascii_digit() {
            return self.scan_int(c);
        }
        if c.is_alphabetic() || c == '_' {
            return self.scan_word(c, env);
        }
        match c {
            '"' => self.scan_string(),
            ',' => Ok(Tok::Comma),
            ';' => Ok(Tok::Semi),
            '{' => Ok(Tok::LBrace),
            '}' => {
                if self.eat_char(')') {
                    Ok(Tok::ArrayClose)
                } else {
                    Ok(Tok::RBrace)
                }
            }
            '(' => {
                if self.eat_char('{') {
                    Ok(Tok::ArrayOpen)
                } else if self.eat_char('[') {
                    Ok(Tok::MapOpen)
                } else {
                    Ok(Tok::LParen)
                }
            }
            ')' => Ok(Tok::RParen),
            '[' => Ok(Tok::LBracket),
            ']' => {
                if self.eat_char(')') {
                    Ok(Tok::MapClose)
                } else {
                    Ok(Tok::RBracket)
                }
            }
            ':' => {
                if self.eat_char(':') {
                    Ok(Tok::ColonColon)
                } else {
                    Ok(Tok::Colon)
                }
            }
            '.' => Ok(Tok::Dot),
            '?' => Ok(Tok::Oper(Op::Cond)),
            '=' => {
                if self.eat_char('=') {
                    Ok(Tok::Oper(Op::Eq))
                } else {
                    Ok(Tok::Oper(Op::Assign))
                }
            }
            '+' => {
                if self.eat_char('+') {
                    Ok(Tok::Oper(Op::PostIncr))
                } else if self.eat_char('=') {
                    Ok(Tok::Oper(Op::AddAssign))
                } else {
                    Ok(Tok::Oper(Op::Add))
                }
            }
            '-' => {
                if self.eat_char('-') {
                    Ok(Tok::Oper(Op::PostDecr))
                } else if self.eat_char('=') {
                    Ok(Tok::Oper(Op::SubAssign))
                } else if self.eat_char('>') {
                    Ok(Tok::Arrow)
                } else {
                    Ok(Tok::Oper(Op::Sub))
                }
            }
            '*' => {
                if self.eat_char('=') {
                    Ok(Tok::Oper(Op::MulAssign))
                } else {
                    Ok(Tok::Oper(Op::Mul))
                }
            }
            '/' => {
                if self.eat_char('=') {
                    Ok(Tok::Oper(Op::DivAssign))
                } else {
                    Ok(Tok::Oper(Op::Div))
                }
            }
            '%' => {
                if self.eat_char('=') {
                    Ok(Tok::Oper(Op::ModAssign))
                } else {
                    Ok(Tok::Oper(Op::Mod))
                }
            }
            '&' => {
                if self.eat_char('&') {
                    Ok(Tok::Oper(Op::LogicalAnd))
                } else if self.eat_char('=') {
                    Ok(Tok::Oper(Op::AndAssign))
                } else {
                    Ok(Tok::Oper(Op::BitAnd))
                }
            }
            '|' => {
                if self.eat_char('|') {
                    Ok(Tok::Oper(Op::LogicalOr))
                } else if self.eat_char('=') {
                    Ok(Tok::Oper(Op::OrAssign))
                } else {
                    Ok(Tok::Oper(Op::BitOr))
                }
            }
            '^' => {
                if self.eat_char('=') {
                    Ok(Tok::Oper(Op::XorAssign))
                } else {
                    Ok(Tok::Oper(Op::BitXor))
                }
            }
            '<' => {
                if self.eat_char('<') {
                    if self.eat_char('=') {
                        Ok(Tok::Oper(Op::ShlAssign))
                    } else {
                        Ok(Tok::Oper(Op::Shl))
                    }
                } else if self.eat_char('=') {
                    Ok(Tok::Oper(Op::LessEq))
                } else {
                    Ok(Tok::Oper(Op::Less))
                }
            }
            '>' => {
                if self.eat_char('>') {
                    if self.eat_char('=') {
                        Ok(Tok::Oper(Op::ShrAssign))
                    } else {
                        Ok(Tok::Oper(Op::Shr))
                    }
                } else if self.eat_char('=') {
                    Ok(Tok::Oper(Op::GreaterEq))
                } else {
                    Ok(Tok::Oper(Op::Greater))
                }
            }
            '!' => {
                if self.eat_char('=') {
                    Ok(Tok::Oper(Op::NotEq))
                } else {
                    Ok(Tok::Oper(Op::Not))
                }
            }
            '~' => Ok(Tok::Oper(Op::BitNot)),
            other => Err(self.err(format!("unexpected character '{}'", other))),
        }
    }

    fn scan_int(&mut self, first: char) -> Result<Tok, CompileError> {
        let mut text = String::new();
        text.push(first);
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                text.push(c);
                self.next_char();
            } else {
                break;
            }
        }
        text.parse::<i64>()
            .map(Tok::Int)
            .map_err(|_| self.err(format!("integer literal '{}' out of range", text)))
    }

    fn scan_word(&mut self, first: char, env: &mut dyn CompileEnv) -> Result<Tok, CompileError> {
        let mut name = String::new();
        name.push(first);
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                name.push(c);
                self.next_char();
            } else {
                break;
            }
        }
        if name.len() > MAX_IDENT_LEN {
            return Err(self.err(format!("identifier '{}' too long", name)));
        }
        match name.as_str() {
            "int" | "string" | "object" => return Ok(Tok::VarDecl),
            "mapping" => return Ok(Tok::MappingDecl),
            "static" => return Ok(Tok::Static),
            "if" => return Ok(Tok::If),
            "else" => return Ok(Tok::Else),
            "while" => return Ok(Tok::While),
            "for" => return Ok(Tok::For),
            "do" => return Ok(Tok::Do),
            "return" => return Ok(Tok::Return),
            "inherit" => return Ok(Tok::Inherit),
            _ => {}
        }
        if let Some(def) = self.find_define(&name) {
            self.expand(&def, env)?;
            let token = self.next(env)?;
            return Ok(token.tok);
        }
        Ok(Tok::Name(name))
    }

    fn scan_string(&mut self) -> Result<Tok, CompileError> {
        let mut out = String::new();
        loop {
            let c = self
                .next_char()
                .ok_or_else(|| self.err("unterminated string literal"))?;
            match c {
                '"' => return Ok(Tok::Str(out)),
                '\n' => return Err(self.err("newline in string literal")),
                '\\' => {
                    let esc = self
                        .next_char()
                        .ok_or_else(|| self.err("unterminated string literal"))?;
                    match esc {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '0' => out.push('\0'),
                        other => out.push(other),
                    }
                }
                other => out.push(other),
            }
        }
    }
}

/// Textual parameter substitution for function-like macros: identifier
/// occurrences of a parameter are replaced by the actual; string literal
/// contents are left alone.
fn substitute(body: &str, params: &[String], actuals: &[String]) -> String {
    let mut out = String::new();
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' {
            out.push(c);
            i += 1;
            while i < chars.len() {
                out.push(chars[i]);
                if chars[i] == '\\' && i + 1 < chars.len() {
                    out.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                if chars[i] == '"' {
                    i += 1;
                    break;
                }
                i += 1;
            }
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            match params.iter().position(|p| *p == word) {
                Some(k) => out.push_str(&actuals[k]),
                None => out.push_str(&word),
            }
            continue;
        }
        out.push(c);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapEnv(HashMap<String, String>);

    impl CompileEnv for MapEnv {
        fn load_source(&mut self, path: &str, _system: bool) -> Result<String, String> {
            self.0
                .get(path)
                .cloned()
                .ok_or_else(|| "no such file".to_string())
        }
    }

    fn toks(source: &str) -> Vec<Tok> {
        let mut env = MapEnv(HashMap::new());
        let mut lex = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let t = lex.next(&mut env).unwrap();
            if t.tok == Tok::Eof {
                break;
            }
            out.push(t.tok);
        }
        out
    }

    #[test]
    fn test_basic_tokens() {
        assert_eq!(
            toks("int a = 3;"),
            vec![
                Tok::VarDecl,
                Tok::Name("a".into()),
                Tok::Oper(Op::Assign),
                Tok::Int(3),
                Tok::Semi
            ]
        );
    }

    #[test]
    fn test_compound_operators() {
        assert_eq!(
            toks("<<= >>= << >> <= >= == != && || ++ -- -> ::"),
            vec![
                Tok::Oper(Op::ShlAssign),
                Tok::Oper(Op::ShrAssign),
                Tok::Oper(Op::Shl),
                Tok::Oper(Op::Shr),
                Tok::Oper(Op::LessEq),
                Tok::Oper(Op::GreaterEq),
                Tok::Oper(Op::Eq),
                Tok::Oper(Op::NotEq),
                Tok::Oper(Op::LogicalAnd),
                Tok::Oper(Op::LogicalOr),
                Tok::Oper(Op::PostIncr),
                Tok::Oper(Op::PostDecr),
                Tok::Arrow,
                Tok::ColonColon,
            ]
        );
    }

    #[test]
    fn test_literal_brackets() {
        assert_eq!(
            toks("({ 1, 2 }) ([ \"a\" : 1 ])"),
            vec![
                Tok::ArrayOpen,
                Tok::Int(1),
                Tok::Comma,
                Tok::Int(2),
                Tok::ArrayClose,
                Tok::MapOpen,
                Tok::Str("a".into()),
                Tok::Colon,
                Tok::Int(1),
                Tok::MapClose,
            ]
        );
    }

    #[test]
    fn test_comments_and_lines() {
        let mut env = MapEnv(HashMap::new());
        let mut lex = Lexer::new("a /* skip\nme */ b\nc");
        assert_eq!(lex.next(&mut env).unwrap().line, 1);
        let b = lex.next(&mut env).unwrap();
        assert_eq!(b.tok, Tok::Name("b".into()));
        assert_eq!(b.line, 2);
        assert_eq!(lex.next(&mut env).unwrap().line, 3);
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            toks(r#""a\nb\t\"q\"""#),
            vec![Tok::Str("a\nb\t\"q\"".into())]
        );
    }

    #[test]
    fn test_object_macro() {
        assert_eq!(
            toks("#define LIMIT 42\nint a = LIMIT;"),
            vec![
                Tok::VarDecl,
                Tok::Name("a".into()),
                Tok::Oper(Op::Assign),
                Tok::Int(42),
                Tok::Semi
            ]
        );
    }

    #[test]
    fn test_function_macro() {
        assert_eq!(
            toks("#define TWICE(x) (x + x)\nTWICE(3)"),
            vec![
                Tok::LParen,
                Tok::Int(3),
                Tok::Oper(Op::Add),
                Tok::Int(3),
                Tok::RParen,
            ]
        );
    }

    #[test]
    fn test_macro_not_expanded_in_string() {
        assert_eq!(
            toks("#define X 1\n\"X\""),
            vec![Tok::Str("X".into())]
        );
    }

    #[test]
    fn test_undef() {
        // After #undef the name is an ordinary identifier again.
        assert_eq!(
            toks("#define X 1\n#undef X\nX"),
            vec![Tok::Name("X".into())]
        );
    }

    #[test]
    fn test_macro_recursion_fails() {
        let mut env = MapEnv(HashMap::new());
        let mut lex = Lexer::new("#define A B\n#define B A\nA");
        let mut result = lex.next(&mut env);
        while let Ok(t) = &result {
            if t.tok == Tok::Eof {
                panic!("expected recursion error");
            }
            result = lex.next(&mut env);
        }
        let err = result.unwrap_err();
        assert!(err.message.contains("expansion too deep"), "{}", err.message);
    }

    #[test]
    fn test_include() {
        let mut files = HashMap::new();
        files.insert("/sys/defs.h".to_string(), "#define ONE 1\n".to_string());
        let mut env = MapEnv(files);
        let mut lex = Lexer::new("#include \"/sys/defs.h\"\nONE");
        let t = lex.next(&mut env).unwrap();
        assert_eq!(t.tok, Tok::Int(1));
    }

    #[test]
    fn test_directive_only_at_line_start() {
        // A '#' after content on the line is not a directive.
        let mut env = MapEnv(HashMap::new());
        let mut lex = Lexer::new("a #define");
        assert_eq!(lex.next(&mut env).unwrap().tok, Tok::Name("a".into()));
        assert!(lex.next(&mut env).is_err());
    }

    #[test]
    fn test_identifier_length_cap() {
        let long = "x".repeat(MAX_IDENT_LEN + 1);
        let mut env = MapEnv(HashMap::new());
        let mut lex = Lexer::new(&long);
        assert!(lex.next(&mut env).is_err());
    }

    #[test]
    fn test_putback() {
        let mut env = MapEnv(HashMap::new());
        let mut lex = Lexer::new("a b");
        let a = lex.next(&mut env).unwrap();
        lex.unget(a.clone());
        assert_eq!(lex.next(&mut env).unwrap().tok, a.tok);
        assert_eq!(lex.next(&mut env).unwrap().tok, Tok::Name("b".into()));
    }

    #[test]
    fn test_define_with_continuation() {
        assert_eq!(
            toks("#define SUM 1 + \\\n2\nSUM"),
            vec![Tok::Int(1), Tok::Oper(Op::Add), Tok::Int(2)]
        );
    }
}
