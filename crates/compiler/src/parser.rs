//! Single-pass parser and bytecode emitter
//!
//! One pass over the token stream emits reverse-Polish instruction cells
//! directly into each function's code vector. Expressions are compiled
//! by precedence climbing over the operator table (a comparison
//! precedence and a result precedence per operator; result < comparison
//! gives right associativity). Statements lower to conditional branches
//! and absolute jumps with back-patched offsets, and every statement
//! start emits a `NEW_LINE` marker carrying the physical line.
//!
//! Inheritance must precede all declarations. The first global
//! declaration or function body locks the inherit phase and computes the
//! final variable layout: ancestors linearized depth-first, base-first,
//! duplicates removed, inherited slots first, own globals after.

use crate::program::{
    default_alias, linearize, Ancestor, FnDef, InheritEntry, Program, VarDecl, VarShape,
};
use crate::token::{Lexer, Tok, Token};
use crate::{CompileEnv, CompileError};
use std::rc::Rc;
use tern_core::instr::{find_syscall, sys, Instr};
use tern_core::Op;

/// Comparison / result precedence per operator, indexed by opcode.
const PREC: [(u8, u8); 38] = [
    (1, 1),   // ,
    (3, 2),   // =
    (3, 2),   // +=
    (3, 2),   // -=
    (3, 2),   // *=
    (3, 2),   // /=
    (3, 2),   // %=
    (3, 2),   // &=
    (3, 2),   // ^=
    (3, 2),   // |=
    (3, 2),   // <<=
    (3, 2),   // >>=
    (5, 4),   // ?
    (6, 6),   // ||
    (7, 7),   // &&
    (8, 8),   // |
    (9, 9),   // ^
    (10, 10), // &
    (11, 11), // ==
    (11, 11), // !=
    (12, 12), // <
    (12, 12), // <=
    (12, 12), // >
    (12, 12), // >=
    (13, 13), // <<
    (13, 13), // >>
    (14, 14), // +
    (14, 14), // -
    (15, 15), // *
    (15, 15), // /
    (15, 15), // %
    (17, 16), // !
    (17, 16), // ~
    (17, 16), // ++ (post)
    (17, 16), // ++ (pre)
    (17, 16), // -- (post)
    (17, 16), // -- (pre)
    (17, 16), // - (unary)
];

const UNARY_RES_PREC: u8 = 16;

/// Code vector under construction for one function.
struct FnBuilder {
    code: Vec<Instr>,
}

impl FnBuilder {
    fn new() -> FnBuilder {
        FnBuilder { code: Vec::new() }
    }

    fn emit(&mut self, instr: Instr) -> usize {
        self.code.push(instr);
        self.code.len() - 1
    }

    fn here(&self) -> u32 {
        self.code.len() as u32
    }

    fn patch(&mut self, at: usize, target: u32) {
        match &mut self.code[at] {
            Instr::Jump(t) | Instr::Branch(t) => *t = target,
            other => unreachable!("patching non-branch {:?}", other),
        }
    }
}

pub struct Parser<'a> {
    lex: Lexer,
    env: &'a mut dyn CompileEnv,
    path: String,
    globals: Vec<VarDecl>,
    funcs: Vec<Rc<FnDef>>,
    inherits: Vec<InheritEntry>,
    ancestors: Vec<Ancestor>,
    own_base: u32,
    num_globals: u32,
    layout_locked: bool,
}

impl<'a> Parser<'a> {
    pub fn new(path: &str, source: &str, env: &'a mut dyn CompileEnv) -> Parser<'a> {
        Parser {
            lex: Lexer::new(source),
            env,
            path: path.to_string(),
            globals: Vec::new(),
            funcs: Vec::new(),
            inherits: Vec::new(),
            ancestors: Vec::new(),
            own_base: 0,
            num_globals: 0,
            layout_locked: false,
        }
    }

    fn err(&self, message: impl Into<String>) -> CompileError {
        CompileError {
            line: self.lex.phys_line,
            message: message.into(),
        }
    }

    fn next(&mut self) -> Result<Token, CompileError> {
        self.lex.next(&mut *self.env)
    }

    fn expect(&mut self, want: Tok, what: &str) -> Result<(), CompileError> {
        let t = self.next()?;
        if t.tok == want {
            Ok(())
        } else {
            Err(self.err(format!("expected {}", what)))
        }
    }

    /// First declaration or function body ends the inherit phase: the
    /// ancestor linearization and slot bases become final.
    fn lock_layout(&mut self) {
        if self.layout_locked {
            return;
        }
        let parents: Vec<Rc<Program>> = self.inherits.iter().map(|e| e.program.clone()).collect();
        let (ancestors, inherited) = linearize(&parents);
        let mut func_offset = 0u32;
        for entry in &mut self.inherits {
            entry.var_offset = ancestors
                .iter()
                .find(|a| Rc::ptr_eq(&a.program, &entry.program))
                .map(|a| a.base)
                .unwrap_or(0);
            entry.func_offset = func_offset;
            func_offset += entry.program.funcs.len() as u32;
        }
        self.ancestors = ancestors;
        self.own_base = inherited;
        self.num_globals = inherited;
        self.layout_locked = true;
        tracing::debug!(
            path = %self.path,
            inherited_slots = inherited,
            ancestors = self.ancestors.len(),
            "variable layout locked"
        );
    }

    pub fn parse(mut self) -> Result<Program, CompileError> {
        loop {
            let mut t = self.next()?;
            let mut is_static = false;
            if t.tok == Tok::Static {
                is_static = true;
                t = self.next()?;
            }
            match t.tok {
                Tok::Eof => break,
                Tok::VarDecl | Tok::MappingDecl => {
                    self.lock_layout();
                    self.parse_global_decls(t.tok == Tok::MappingDecl)?;
                }
                Tok::Inherit => {
                    if is_static {
                        return Err(self.err("'static' cannot precede inherit"));
                    }
                    self.parse_inherit()?;
                }
                Tok::Name(name) => {
                    self.lock_layout();
                    self.parse_function(name, is_static)?;
                }
                _ => return Err(self.err("expected declaration or function")),
            }
        }
        self.lock_layout();
        Ok(Program {
            path: self.path,
            globals: self.globals,
            num_globals: self.num_globals,
            own_base: self.own_base,
            funcs: self.funcs,
            inherits: self.inherits,
            ancestors: self.ancestors,
        })
    }

    fn parse_inherit(&mut self) -> Result<(), CompileError> {
        if self.layout_locked {
            return Err(self.err("inherit must appear before all declarations"));
        }
        // Macros in the path position expand through the ordinary token
        // stream, so a STRING is all we accept here.
        let t = self.next()?;
        let path = match t.tok {
            Tok::Str(p) => p,
            _ => return Err(self.err("expected string after inherit")),
        };
        let program = self
            .env
            .resolve_proto(&path)
            .map_err(|e| self.err(format!("cannot inherit '{}': {}", path, e)))?;
        self.inherits.push(InheritEntry {
            alias: default_alias(&path),
            path,
            program,
            var_offset: 0,
            func_offset: 0,
        });
        self.expect(Tok::Semi, "; after inherit")?;
        Ok(())
    }

    /// One declarator: optional `*`, the name, optional `[N]..[M]` or `[]`.
    fn parse_declarator(&mut self, is_mapping: bool) -> Result<(String, VarShape), CompileError> {
        let mut t = self.next()?;
        let mut pointer = false;
        if t.tok == Tok::Oper(Op::Mul) {
            pointer = true;
            t = self.next()?;
        }
        let name = match t.tok {
            Tok::Name(n) => n,
            _ => return Err(self.err("expected variable name")),
        };
        let mut dims: Vec<u32> = Vec::new();
        let mut unbounded = false;
        loop {
            let t = self.next()?;
            if t.tok != Tok::LBracket {
                self.lex.unget(t);
                break;
            }
            let t = self.next()?;
            match t.tok {
                Tok::RBracket => {
                    unbounded = true;
                    break;
                }
                Tok::Int(n) if n > 0 => {
                    dims.push(n as u32);
                    self.expect(Tok::RBracket, "] in array declaration")?;
                }
                _ => return Err(self.err("expected array size")),
            }
        }
        let shape = if is_mapping {
            if pointer || unbounded || !dims.is_empty() {
                return Err(self.err("mappings take no array dimensions"));
            }
            VarShape::Mapping
        } else if pointer || unbounded {
            if pointer && !dims.is_empty() {
                return Err(self.err("'*' and explicit dimensions conflict"));
            }
            VarShape::UnboundedArray
        } else if !dims.is_empty() {
            VarShape::Array(dims)
        } else {
            VarShape::Scalar
        };
        Ok((name, shape))
    }

    fn parse_global_decls(&mut self, is_mapping: bool) -> Result<(), CompileError> {
        loop {
            let (name, shape) = self.parse_declarator(is_mapping)?;
            self.add_global(name, shape)?;
            let t = self.next()?;
            match t.tok {
                Tok::Semi => return Ok(()),
                Tok::Comma => {}
                _ => return Err(self.err("expected ;")),
            }
        }
    }

    fn add_global(&mut self, name: String, shape: VarShape) -> Result<(), CompileError> {
        if self.globals.iter().any(|v| v.name == name) {
            return Err(self.err(format!("variable '{}' already defined", name)));
        }
        for anc in self.ancestors.iter().rev() {
            if anc.program.globals.iter().any(|v| v.name == name) {
                return Err(self.err(format!(
                    "variable '{}' already defined in ancestor '{}'",
                    name,
                    default_alias(&anc.program.path)
                )));
            }
        }
        let base = self.num_globals;
        self.num_globals += 1;
        self.globals.push(VarDecl { name, base, shape });
        Ok(())
    }

    /// Own global or (base-translated) ancestor global visible here.
    fn find_visible_global(&self, name: &str) -> Option<VarDecl> {
        if let Some(v) = self.globals.iter().find(|v| v.name == name) {
            return Some(v.clone());
        }
        for anc in self.ancestors.iter().rev() {
            if let Some(v) = anc.program.globals.iter().find(|v| v.name == name) {
                let mut v = v.clone();
                v.base = anc.base + (v.base - anc.program.own_base);
                return Some(v);
            }
        }
        None
    }

    fn parse_function(&mut self, name: String, is_static: bool) -> Result<(), CompileError> {
        if self.funcs.iter().any(|f| f.name == name) {
            return Err(self.err(format!("function '{}' already defined", name)));
        }
        self.expect(Tok::LParen, "( after function name")?;
        let mut locals: Vec<VarDecl> = Vec::new();
        loop {
            let t = self.next()?;
            match t.tok {
                Tok::RParen => break,
                Tok::VarDecl | Tok::MappingDecl => {
                    let is_mapping = t.tok == Tok::MappingDecl;
                    self.add_local(&mut locals, is_mapping)?;
                }
                _ => {
                    // Untyped parameter name.
                    self.lex.unget(t);
                    self.add_local(&mut locals, false)?;
                }
            }
            let t = self.next()?;
            match t.tok {
                Tok::RParen => break,
                Tok::Comma => {}
                _ => return Err(self.err("expected )")),
            }
        }
        let num_args = locals.len() as u32;
        self.expect(Tok::LBrace, "{ before function body")?;
        let mut fb = FnBuilder::new();
        fb.emit(Instr::NewLine(self.lex.phys_line));
        self.parse_block(&mut fb, &mut locals)?;
        // Fall-through return value.
        fb.emit(Instr::Int(0));
        fb.emit(Instr::Return);
        let num_locals = locals.len() as u32;
        self.funcs.push(Rc::new(FnDef {
            name,
            is_static,
            num_args,
            num_locals,
            code: fb.code,
            locals,
        }));
        Ok(())
    }

    fn add_local(
        &mut self,
        locals: &mut Vec<VarDecl>,
        is_mapping: bool,
    ) -> Result<(), CompileError> {
        let (name, shape) = self.parse_declarator(is_mapping)?;
        if locals.iter().any(|v| v.name == name) {
            return Err(self.err(format!("variable '{}' already defined", name)));
        }
        let base = locals.len() as u32;
        locals.push(VarDecl { name, base, shape });
        Ok(())
    }

    fn parse_block(
        &mut self,
        fb: &mut FnBuilder,
        locals: &mut Vec<VarDecl>,
    ) -> Result<(), CompileError> {
        loop {
            let t = self.next()?;
            if t.tok == Tok::RBrace {
                return Ok(());
            }
            if t.tok == Tok::Eof {
                return Err(self.err("unexpected end of file (missing })"));
            }
            self.lex.unget(t);
            self.parse_statement(fb, locals)?;
        }
    }

    fn parse_statement(
        &mut self,
        fb: &mut FnBuilder,
        locals: &mut Vec<VarDecl>,
    ) -> Result<(), CompileError> {
        let t = self.next()?;
        fb.emit(Instr::NewLine(t.line));
        match t.tok {
            Tok::LBrace => self.parse_block(fb, locals),
            Tok::Semi => Ok(()),
            Tok::VarDecl | Tok::MappingDecl => {
                let is_mapping = t.tok == Tok::MappingDecl;
                loop {
                    self.add_local(locals, is_mapping)?;
                    let t = self.next()?;
                    match t.tok {
                        Tok::Semi => return Ok(()),
                        Tok::Comma => {}
                        _ => return Err(self.err("expected ;")),
                    }
                }
            }
            Tok::Return => {
                let t = self.next()?;
                if t.tok == Tok::Semi {
                    fb.emit(Instr::Int(0));
                } else {
                    self.lex.unget(t);
                    self.parse_expr(fb, locals, 0)?;
                    self.expect(Tok::Semi, "; after return")?;
                }
                fb.emit(Instr::Return);
                Ok(())
            }
            Tok::If => self.parse_if(fb, locals),
            Tok::While => self.parse_while(fb, locals),
            Tok::Do => self.parse_do(fb, locals),
            Tok::For => self.parse_for(fb, locals),
            _ => {
                self.lex.unget(t);
                self.parse_expr(fb, locals, 0)?;
                self.expect(Tok::Semi, "; after expression")?;
                Ok(())
            }
        }
    }

    fn parse_if(&mut self, fb: &mut FnBuilder, locals: &mut Vec<VarDecl>) -> Result<(), CompileError> {
        self.expect(Tok::LParen, "( after if")?;
        self.parse_expr(fb, locals, 0)?;
        self.expect(Tok::RParen, ") after condition")?;
        let to_else = fb.emit(Instr::Branch(0));
        self.parse_statement(fb, locals)?;
        let t = self.next()?;
        if t.tok == Tok::Else {
            let to_end = fb.emit(Instr::Jump(0));
            let else_at = fb.here();
            fb.patch(to_else, else_at);
            self.parse_statement(fb, locals)?;
            let end = fb.here();
            fb.patch(to_end, end);
        } else {
            self.lex.unget(t);
            let end = fb.here();
            fb.patch(to_else, end);
        }
        Ok(())
    }

    fn parse_while(
        &mut self,
        fb: &mut FnBuilder,
        locals: &mut Vec<VarDecl>,
    ) -> Result<(), CompileError> {
        self.expect(Tok::LParen, "( after while")?;
        let top = fb.here();
        self.parse_expr(fb, locals, 0)?;
        self.expect(Tok::RParen, ") after condition")?;
        let out = fb.emit(Instr::Branch(0));
        self.parse_statement(fb, locals)?;
        fb.emit(Instr::Jump(top));
        let end = fb.here();
        fb.patch(out, end);
        Ok(())
    }

    fn parse_do(&mut self, fb: &mut FnBuilder, locals: &mut Vec<VarDecl>) -> Result<(), CompileError> {
        let top = fb.here();
        self.parse_statement(fb, locals)?;
        self.expect(Tok::While, "while after do body")?;
        self.expect(Tok::LParen, "( after while")?;
        self.parse_expr(fb, locals, 0)?;
        self.expect(Tok::RParen, ") after condition")?;
        self.expect(Tok::Semi, "; after do/while")?;
        let out = fb.emit(Instr::Branch(0));
        fb.emit(Instr::Jump(top));
        let end = fb.here();
        fb.patch(out, end);
        Ok(())
    }

    fn parse_for(&mut self, fb: &mut FnBuilder, locals: &mut Vec<VarDecl>) -> Result<(), CompileError> {
        self.expect(Tok::LParen, "( after for")?;
        // init
        let t = self.next()?;
        if t.tok != Tok::Semi {
            self.lex.unget(t);
            self.parse_expr(fb, locals, 0)?;
            self.expect(Tok::Semi, "; after for initializer")?;
            fb.emit(Instr::NewLine(self.lex.phys_line));
        }
        let top = fb.here();
        // condition
        let t = self.next()?;
        let out = if t.tok != Tok::Semi {
            self.lex.unget(t);
            self.parse_expr(fb, locals, 0)?;
            self.expect(Tok::Semi, "; after for condition")?;
            Some(fb.emit(Instr::Branch(0)))
        } else {
            None
        };
        let to_body = fb.emit(Instr::Jump(0));
        // increment, emitted before the body in a single pass
        let incr_at = fb.here();
        let t = self.next()?;
        if t.tok != Tok::RParen {
            self.lex.unget(t);
            self.parse_expr(fb, locals, 0)?;
            self.expect(Tok::RParen, ") after for clauses")?;
            fb.emit(Instr::NewLine(self.lex.phys_line));
        }
        fb.emit(Instr::Jump(top));
        let body_at = fb.here();
        fb.patch(to_body, body_at);
        self.parse_statement(fb, locals)?;
        fb.emit(Instr::Jump(incr_at));
        let end = fb.here();
        if let Some(out) = out {
            fb.patch(out, end);
        }
        Ok(())
    }

    /// Precedence-climbing expression emitter. Returns whether the
    /// emitted result is an l-value (assignable).
    fn parse_expr(
        &mut self,
        fb: &mut FnBuilder,
        locals: &mut Vec<VarDecl>,
        prec: u8,
    ) -> Result<bool, CompileError> {
        let mut is_lval = self.parse_unary(fb, locals)?;
        loop {
            let t = self.next()?;
            let op = match t.tok {
                Tok::Comma => Op::Comma,
                Tok::Oper(op) => match op {
                    // Prefix- and postfix-only tokens end the expression
                    // here; parse_unary consumes the ones that belong to
                    // it.
                    Op::Not | Op::BitNot | Op::PostIncr | Op::PostDecr => {
                        self.lex.unget(t);
                        return Ok(is_lval);
                    }
                    other => other,
                },
                _ => {
                    self.lex.unget(t);
                    return Ok(is_lval);
                }
            };
            let (comp, res) = PREC[op as usize];
            if comp <= prec {
                self.lex.unget(t);
                return Ok(is_lval);
            }
            match op {
                Op::Cond => {
                    let to_else = fb.emit(Instr::Branch(0));
                    self.parse_expr(fb, locals, res)?;
                    self.expect(Tok::Colon, ": in conditional")?;
                    let to_end = fb.emit(Instr::Jump(0));
                    let else_at = fb.here();
                    fb.patch(to_else, else_at);
                    self.parse_expr(fb, locals, res)?;
                    let end = fb.here();
                    fb.patch(to_end, end);
                    is_lval = false;
                }
                Op::LogicalAnd => {
                    let f1 = fb.emit(Instr::Branch(0));
                    self.parse_expr(fb, locals, res)?;
                    let f2 = fb.emit(Instr::Branch(0));
                    fb.emit(Instr::Int(1));
                    let to_end = fb.emit(Instr::Jump(0));
                    let false_at = fb.here();
                    fb.patch(f1, false_at);
                    fb.patch(f2, false_at);
                    fb.emit(Instr::Int(0));
                    let end = fb.here();
                    fb.patch(to_end, end);
                    is_lval = false;
                }
                Op::LogicalOr => {
                    let to_rhs = fb.emit(Instr::Branch(0));
                    fb.emit(Instr::Int(1));
                    let j1 = fb.emit(Instr::Jump(0));
                    let rhs_at = fb.here();
                    fb.patch(to_rhs, rhs_at);
                    self.parse_expr(fb, locals, res)?;
                    let to_false = fb.emit(Instr::Branch(0));
                    fb.emit(Instr::Int(1));
                    let j2 = fb.emit(Instr::Jump(0));
                    let false_at = fb.here();
                    fb.patch(to_false, false_at);
                    fb.emit(Instr::Int(0));
                    let end = fb.here();
                    fb.patch(j1, end);
                    fb.patch(j2, end);
                    is_lval = false;
                }
                op if op.is_assignment() => {
                    if !is_lval {
                        return Err(self.err("assignment to non-lvalue"));
                    }
                    self.parse_expr(fb, locals, res)?;
                    fb.emit(Instr::Code(op as u16));
                    is_lval = false;
                }
                op => {
                    self.parse_expr(fb, locals, res)?;
                    fb.emit(Instr::Code(op as u16));
                    is_lval = false;
                }
            }
        }
    }

    fn parse_unary(
        &mut self,
        fb: &mut FnBuilder,
        locals: &mut Vec<VarDecl>,
    ) -> Result<bool, CompileError> {
        let t = self.next()?;
        // Marker guiding the first generic subscript after this primary:
        // the declared size for slot bases, unlimited otherwise.
        let mut marker = u32::MAX;
        let mut is_lval = match t.tok {
            Tok::Int(n) => {
                fb.emit(Instr::Int(n));
                false
            }
            Tok::Str(s) => {
                // The empty string travels as integer 0.
                if s.is_empty() {
                    fb.emit(Instr::Int(0));
                } else {
                    fb.emit(Instr::Str(s));
                }
                false
            }
            Tok::LParen => {
                let lv = self.parse_expr(fb, locals, 0)?;
                self.expect(Tok::RParen, ")")?;
                lv
            }
            Tok::ArrayOpen => {
                let mut count = 0u32;
                let t = self.next()?;
                if t.tok != Tok::ArrayClose {
                    self.lex.unget(t);
                    loop {
                        self.parse_expr(fb, locals, 1)?;
                        count += 1;
                        let t = self.next()?;
                        match t.tok {
                            Tok::ArrayClose => break,
                            Tok::Comma => {}
                            _ => return Err(self.err("expected }) or , in array literal")),
                        }
                    }
                }
                fb.emit(Instr::NumArgs(count));
                fb.emit(Instr::Code(sys::ARRAY_LITERAL));
                false
            }
            Tok::MapOpen => {
                let mut count = 0u32;
                let t = self.next()?;
                if t.tok != Tok::MapClose {
                    self.lex.unget(t);
                    loop {
                        self.parse_expr(fb, locals, 1)?;
                        self.expect(Tok::Colon, ": in mapping literal")?;
                        self.parse_expr(fb, locals, 1)?;
                        count += 2;
                        let t = self.next()?;
                        match t.tok {
                            Tok::MapClose => break,
                            Tok::Comma => {}
                            _ => return Err(self.err("expected ]) or , in mapping literal")),
                        }
                    }
                }
                fb.emit(Instr::NumArgs(count));
                fb.emit(Instr::Code(sys::MAPPING_LITERAL));
                false
            }
            Tok::ColonColon => {
                // ::name(args) - next definition up the MRO.
                let t = self.next()?;
                let fname = match t.tok {
                    Tok::Name(n) => n,
                    _ => return Err(self.err("expected function name after ::")),
                };
                self.expect(Tok::LParen, "( in super call")?;
                let nargs = self.parse_args(fb, locals)?;
                let mut found = None;
                for (i, entry) in self.inherits.iter().enumerate() {
                    if let Some(idx) = Program::dispatch_index_of(&entry.program, &fname) {
                        found = Some((i as u32, idx));
                        break;
                    }
                }
                let (inherit_idx, func_idx) = found
                    .ok_or_else(|| self.err(format!("no inherited function '{}'", fname)))?;
                fb.emit(Instr::NumArgs(nargs));
                fb.emit(Instr::CallSuper {
                    inherit_idx,
                    func_idx,
                });
                false
            }
            Tok::Oper(Op::Not) => {
                self.parse_expr(fb, locals, UNARY_RES_PREC)?;
                fb.emit(Instr::Code(Op::Not as u16));
                false
            }
            Tok::Oper(Op::BitNot) => {
                self.parse_expr(fb, locals, UNARY_RES_PREC)?;
                fb.emit(Instr::Code(Op::BitNot as u16));
                false
            }
            Tok::Oper(Op::Sub) => {
                self.parse_expr(fb, locals, UNARY_RES_PREC)?;
                fb.emit(Instr::Code(Op::UnaryMinus as u16));
                false
            }
            Tok::Oper(Op::PostIncr) => {
                let lv = self.parse_expr(fb, locals, UNARY_RES_PREC)?;
                if !lv {
                    return Err(self.err("++ needs an lvalue"));
                }
                fb.emit(Instr::Code(Op::PreIncr as u16));
                false
            }
            Tok::Oper(Op::PostDecr) => {
                let lv = self.parse_expr(fb, locals, UNARY_RES_PREC)?;
                if !lv {
                    return Err(self.err("-- needs an lvalue"));
                }
                fb.emit(Instr::Code(Op::PreDecr as u16));
                false
            }
            Tok::Name(name) => {
                let (lv, m) = self.parse_name(name, fb, locals)?;
                marker = m;
                lv
            }
            _ => return Err(self.err("expected expression")),
        };
        // Postfix: ++/--, ->call, subscripts.
        loop {
            let t = self.next()?;
            match t.tok {
                Tok::Oper(Op::PostIncr) => {
                    if !is_lval {
                        return Err(self.err("++ needs an lvalue"));
                    }
                    fb.emit(Instr::Code(Op::PostIncr as u16));
                    is_lval = false;
                }
                Tok::Oper(Op::PostDecr) => {
                    if !is_lval {
                        return Err(self.err("-- needs an lvalue"));
                    }
                    fb.emit(Instr::Code(Op::PostDecr as u16));
                    is_lval = false;
                }
                Tok::Arrow => {
                    let t = self.next()?;
                    let fname = match t.tok {
                        Tok::Name(n) => n,
                        _ => return Err(self.err("expected function name after ->")),
                    };
                    fb.emit(Instr::Str(fname));
                    self.expect(Tok::LParen, "( in call")?;
                    let nargs = self.parse_args(fb, locals)?;
                    fb.emit(Instr::NumArgs(nargs + 2));
                    fb.emit(Instr::Code(sys::CALL_OTHER));
                    is_lval = false;
                }
                Tok::LBracket => {
                    self.parse_expr(fb, locals, 0)?;
                    self.expect(Tok::RBracket, "] after subscript")?;
                    fb.emit(Instr::ArraySize(marker));
                    fb.emit(Instr::GlobalRef);
                    marker = u32::MAX;
                    is_lval = true;
                }
                _ => {
                    self.lex.unget(t);
                    return Ok(is_lval);
                }
            }
        }
    }

    /// Comma-separated call arguments up to `)`. Each argument is parsed
    /// above comma precedence.
    fn parse_args(
        &mut self,
        fb: &mut FnBuilder,
        locals: &mut Vec<VarDecl>,
    ) -> Result<u32, CompileError> {
        let t = self.next()?;
        if t.tok == Tok::RParen {
            return Ok(0);
        }
        self.lex.unget(t);
        let mut count = 0u32;
        loop {
            self.parse_expr(fb, locals, 1)?;
            count += 1;
            let t = self.next()?;
            match t.tok {
                Tok::RParen => return Ok(count),
                Tok::Comma => {}
                _ => return Err(self.err("expected ) or , in argument list")),
            }
        }
    }

    /// An identifier in expression position: a call, an aliased super
    /// call, or a variable reference. Returns (is_lvalue, subscript
    /// marker for the following `[`).
    fn parse_name(
        &mut self,
        name: String,
        fb: &mut FnBuilder,
        locals: &mut Vec<VarDecl>,
    ) -> Result<(bool, u32), CompileError> {
        let t = self.next()?;
        match t.tok {
            Tok::LParen => {
                let nargs = self.parse_args(fb, locals)?;
                // Resolution order: own function, builtin, late-bound name.
                if let Some(idx) = self.funcs.iter().position(|f| f.name == name) {
                    fb.emit(Instr::NumArgs(nargs));
                    fb.emit(Instr::FuncCall(idx as u32));
                } else if let Some(op) = find_syscall(&name) {
                    fb.emit(Instr::NumArgs(nargs));
                    fb.emit(Instr::Code(op));
                } else {
                    fb.emit(Instr::NumArgs(nargs));
                    fb.emit(Instr::FuncName(name));
                }
                Ok((false, u32::MAX))
            }
            Tok::ColonColon => {
                // Alias::name(args)
                let t = self.next()?;
                let fname = match t.tok {
                    Tok::Name(n) => n,
                    _ => return Err(self.err("expected function name after ::")),
                };
                self.expect(Tok::LParen, "( in super call")?;
                let nargs = self.parse_args(fb, locals)?;
                let inherit_idx = self
                    .inherits
                    .iter()
                    .position(|e| e.alias == name)
                    .ok_or_else(|| self.err(format!("unknown inherit alias '{}'", name)))?;
                let func_idx =
                    Program::dispatch_index_of(&self.inherits[inherit_idx].program, &fname)
                        .ok_or_else(|| {
                        self.err(format!("'{}' has no function '{}'", name, fname))
                    })?;
                fb.emit(Instr::NumArgs(nargs));
                fb.emit(Instr::CallParentNamed {
                    inherit_idx: inherit_idx as u32,
                    func_idx,
                });
                Ok((false, u32::MAX))
            }
            _ => {
                self.lex.unget(t);
                if let Some(v) = locals.iter().find(|v| v.name == name).cloned() {
                    fb.emit(Instr::LocalLValue {
                        slot: v.base,
                        size: v.shape.size_marker(),
                    });
                    let marker = self.emit_fixed_subscripts(&v, fb, locals, false)?;
                    Ok((true, marker))
                } else if let Some(v) = self.find_visible_global(&name) {
                    fb.emit(Instr::GlobalLValue {
                        slot: v.base,
                        size: v.shape.size_marker(),
                    });
                    let marker = self.emit_fixed_subscripts(&v, fb, locals, true)?;
                    Ok((true, marker))
                } else {
                    Err(self.err(format!("undefined variable '{}'", name)))
                }
            }
        }
    }

    /// Multi-dimensional declared arrays consume all their subscripts at
    /// once: intermediate indices multiply by the product of the
    /// remaining dimensions and the single bounds check covers the
    /// flattened index. Single-dimension and dynamic shapes leave the
    /// subscripts to the generic postfix path and just report the size
    /// marker (declared bound; 0 for mappings).
    fn emit_fixed_subscripts(
        &mut self,
        v: &VarDecl,
        fb: &mut FnBuilder,
        locals: &mut Vec<VarDecl>,
        global: bool,
    ) -> Result<u32, CompileError> {
        let dims = match &v.shape {
            VarShape::Array(dims) if dims.len() >= 2 => dims.clone(),
            other => return Ok(other.size_marker()),
        };
        let t = self.next()?;
        if t.tok != Tok::LBracket {
            self.lex.unget(t);
            return Ok(v.shape.size_marker());
        }
        self.parse_expr(fb, locals, 0)?;
        self.expect(Tok::RBracket, "] after subscript")?;
        for dim in &dims[1..] {
            self.expect(Tok::LBracket, "[ (array has more dimensions)")?;
            fb.emit(Instr::Int(*dim as i64));
            fb.emit(Instr::Code(Op::Mul as u16));
            self.parse_expr(fb, locals, 0)?;
            fb.emit(Instr::Code(Op::Add as u16));
            self.expect(Tok::RBracket, "] after subscript")?;
        }
        fb.emit(Instr::ArraySize(v.shape.size_marker()));
        fb.emit(if global {
            Instr::GlobalRef
        } else {
            Instr::LocalRef
        });
        Ok(u32::MAX)
    }
}
