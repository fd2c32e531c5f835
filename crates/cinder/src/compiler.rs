//! Single-pass Pratt compiler: walks the token stream once and emits
//! bytecode directly into a `Chunk`, with no intermediate AST. Precedence
//! climbing is expressed as a `match` on `TokenKind` rather than a function
//! pointer table — the two are equivalent and this reads better in Rust.

use crate::chunk::Chunk;
use crate::error::CompileError;
use crate::heap::Heap;
use crate::lexer::Lexer;
use crate::object::{LFunction, Obj, ObjId};
use crate::op::Opcode;
use crate::token::{Token, TokenKind};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

#[derive(Clone, Copy)]
struct Local<'src> {
    name: &'src str,
    /// `-1` while the initializer expression is still being compiled.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct FunctionCompiler<'src> {
    function: LFunction,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl<'src> FunctionCompiler<'src> {
    fn new(kind: FunctionKind, name: Option<ObjId>) -> Self {
        let slot_zero_name = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) { "this" } else { "" };
        Self {
            function: LFunction { arity: 0, upvalue_count: 0, chunk: Chunk::new(), name },
            kind,
            locals: vec![Local { name: slot_zero_name, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

struct Compiler<'heap, 'src> {
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    heap: &'heap mut Heap,
    frames: Vec<FunctionCompiler<'src>>,
    classes: Vec<ClassState>,
    errors: Vec<CompileError>,
}

/// Compiles `source` into the top-level script function, ready to be
/// wrapped in a `Closure` and run. All reported errors are returned
/// together rather than stopping at the first one.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjId, Vec<CompileError>> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function_id, _upvalues) = compiler.end_function();
    if compiler.had_error { Err(compiler.errors) } else { Ok(function_id) }
}

impl<'heap, 'src> Compiler<'heap, 'src> {
    fn new(source: &'src str, heap: &'heap mut Heap) -> Self {
        let dummy = Token::synthetic(TokenKind::Eof, "", 0);
        Self {
            lexer: Lexer::new(source),
            current: dummy,
            previous: dummy,
            had_error: false,
            panic_mode: false,
            heap,
            frames: vec![FunctionCompiler::new(FunctionKind::Script, None)],
            classes: Vec::new(),
            errors: Vec::new(),
        }
    }

    // -- token plumbing --------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_owned();
            self.error_at_current_text(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            let found = self.current.kind;
            self.error_at_current_text(&format!("{message} Found {found} instead."));
        }
    }

    fn error_at_current_text(&mut self, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.errors.push(CompileError { line: self.current.line, message: message.to_owned() });
    }

    fn error(&mut self, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.errors.push(CompileError { line: self.previous.line, message: message.to_owned() });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // -- frame / scope bookkeeping ---------------------------------------

    fn current_frame(&self) -> &FunctionCompiler<'src> {
        self.frames.last().expect("at least the script frame is always present")
    }

    fn current_frame_mut(&mut self) -> &mut FunctionCompiler<'src> {
        self.frames.last_mut().expect("at least the script frame is always present")
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.current_frame_mut().function.chunk
    }

    fn current_kind(&self) -> FunctionKind {
        self.current_frame().kind
    }

    fn scope_depth(&self) -> i32 {
        self.current_frame().scope_depth
    }

    fn begin_scope(&mut self) {
        self.current_frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = {
            let frame = self.current_frame_mut();
            frame.scope_depth -= 1;
            frame.scope_depth
        };
        loop {
            let Some(local) = self.current_frame().locals.last() else { break };
            if local.depth <= depth {
                break;
            }
            if local.is_captured {
                self.emit_op(Opcode::CloseUpvalue);
            } else {
                self.emit_op(Opcode::Pop);
            }
            self.current_frame_mut().locals.pop();
        }
    }

    // -- emission ----------------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write_byte(byte, line);
    }

    fn emit_op(&mut self, op: Opcode) {
        self.emit_byte(op as u8);
    }

    fn emit_bytes(&mut self, op: Opcode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_jump(&mut self, op: Opcode) -> usize {
        let line = self.previous.line;
        self.current_chunk().emit_jump(op, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        if let Err(message) = self.current_chunk().patch_jump(offset) {
            self.error(&message);
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.previous.line;
        if let Err(message) = self.current_chunk().emit_loop(loop_start, line) {
            self.error(&message);
        }
    }

    fn emit_return(&mut self) {
        if self.current_kind() == FunctionKind::Initializer {
            self.emit_bytes(Opcode::GetLocal, 0);
        } else {
            self.emit_op(Opcode::Nil);
        }
        self.emit_op(Opcode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.current_chunk().add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_bytes(Opcode::Constant, index);
    }

    fn intern(&mut self, text: &str) -> ObjId {
        let bytes = text.as_bytes();
        match self.heap.find_interned(bytes) {
            Some(id) => id,
            None => self.heap.intern_new(bytes),
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let id = self.intern(name);
        self.make_constant(Value::Object(id))
    }

    // -- variable resolution ----------------------------------------------

    fn declare_variable(&mut self, name: Token<'src>) {
        if self.scope_depth() == 0 {
            return;
        }
        let depth = self.scope_depth();
        let mut duplicate = false;
        for local in self.current_frame().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name.lexeme {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
            return;
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: Token<'src>) {
        let frame = self.current_frame_mut();
        if frame.locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        frame.locals.push(Local { name: name.lexeme, depth: -1, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        let frame = self.current_frame_mut();
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        frame.locals.last_mut().expect("a local was just declared").depth = depth;
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        let name = self.previous;
        self.declare_variable(name);
        if self.scope_depth() > 0 {
            return 0;
        }
        self.identifier_constant(name.lexeme)
    }

    fn define_variable(&mut self, global: u8) {
        if self.scope_depth() > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(Opcode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        let position = self.frames[frame_idx].locals.iter().rposition(|local| local.name == name)?;
        if self.frames[frame_idx].locals[position].depth == -1 {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(position as u8)
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        let enclosing = frame_idx - 1;
        if let Some(local_index) = self.resolve_local(enclosing, name) {
            self.frames[enclosing].locals[local_index as usize].is_captured = true;
            return Some(self.add_upvalue(frame_idx, local_index, true));
        }
        if let Some(upvalue_index) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(frame_idx, upvalue_index, false));
        }
        None
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> u8 {
        let frame = &mut self.frames[frame_idx];
        if let Some(existing) = frame.upvalues.iter().position(|up| up.index == index && up.is_local == is_local) {
            return existing as u8;
        }
        if frame.upvalues.len() >= 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        frame.upvalues.push(UpvalueDesc { index, is_local });
        (frame.upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let frame_idx = self.frames.len() - 1;
        let (get_op, set_op, arg) = if let Some(local) = self.resolve_local(frame_idx, name.lexeme) {
            (Opcode::GetLocal, Opcode::SetLocal, local)
        } else if let Some(upvalue) = self.resolve_upvalue(frame_idx, name.lexeme) {
            (Opcode::GetUpvalue, Opcode::SetUpvalue, upvalue)
        } else {
            let index = self.identifier_constant(name.lexeme);
            (Opcode::GetGlobal, Opcode::SetGlobal, index)
        };
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(set_op, arg);
        } else {
            self.emit_bytes(get_op, arg);
        }
    }

    // -- functions -----------------------------------------------------------

    fn begin_function(&mut self, kind: FunctionKind, name: Option<ObjId>) {
        self.frames.push(FunctionCompiler::new(kind, name));
    }

    fn end_function(&mut self) -> (ObjId, Vec<UpvalueDesc>) {
        self.emit_return();
        let frame = self.frames.pop().expect("begin_function pushed a frame");
        let mut function = frame.function;
        function.upvalue_count = frame.upvalues.len() as u8;
        let id = self.heap.alloc(Obj::Function(function));
        (id, frame.upvalues)
    }

    fn compile_function(&mut self, kind: FunctionKind, name: Option<ObjId>) {
        self.begin_function(kind, name);
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.current_frame_mut().function.arity += 1;
                if self.current_frame().function.arity > 255 {
                    self.error_at_current_text("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();
        let (function_id, upvalues) = self.end_function();
        let constant = self.make_constant(Value::Object(function_id));
        self.emit_bytes(Opcode::Closure, constant);
        for upvalue in &upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        let name_id = self.intern(self.previous.lexeme);
        self.compile_function(FunctionKind::Function, Some(name_id));
        self.define_variable(global);
    }

    /// Anonymous `fun (...) { ... }` expression, e.g. an IIFE. Not part of
    /// the reference grammar for this family of languages, but required to
    /// express a function literal directly in expression position.
    fn fun_expression(&mut self) {
        self.compile_function(FunctionKind::Function, None);
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let method_name = self.previous.lexeme;
        let name_const = self.identifier_constant(method_name);
        let name_id = self.intern(method_name);
        let kind = if method_name == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.compile_function(kind, Some(name_id));
        self.emit_bytes(Opcode::Method, name_const);
    }

    // -- classes -------------------------------------------------------------

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name_tok = self.previous;
        let name_const = self.identifier_constant(name_tok.lexeme);
        self.declare_variable(name_tok);
        self.emit_bytes(Opcode::Class, name_const);
        self.define_variable(name_const);

        self.classes.push(ClassState { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_tok = self.previous;
            self.named_variable(super_tok, false);
            if super_tok.lexeme == name_tok.lexeme {
                self.error("A class can't inherit from itself.");
            }
            self.begin_scope();
            self.add_local(Token::synthetic(TokenKind::Super, "super", super_tok.line));
            self.define_variable(0);
            self.named_variable(name_tok, false);
            self.emit_op(Opcode::Inherit);
            self.classes.last_mut().expect("just pushed").has_superclass = true;
        }

        self.named_variable(name_tok, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(Opcode::Pop);

        if self.classes.last().expect("pushed above").has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    // -- statements ----------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Opcode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(Opcode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(Opcode::Pop);
    }

    fn return_statement(&mut self) {
        if self.current_kind() == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_kind() == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(Opcode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.statement();

        let else_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(Opcode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_frame_mut().function.chunk.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(Opcode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer clause
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
            self.emit_op(Opcode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Opcode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_op(Opcode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(Opcode::Pop);
        }
        self.end_scope();
    }

    // -- expressions ---------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }
        while precedence <= Self::infix_precedence(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string(),
            TokenKind::True | TokenKind::False | TokenKind::Nil => self.literal(),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::This => self.this_expr(),
            TokenKind::Super => self.super_expr(),
            TokenKind::Fun => self.fun_expression(),
            _ => return false,
        }
        true
    }

    fn infix_precedence(kind: TokenKind) -> Precedence {
        match kind {
            TokenKind::Or => Precedence::Or,
            TokenKind::And => Precedence::And,
            TokenKind::EqualEqual | TokenKind::BangEqual => Precedence::Equality,
            TokenKind::Less | TokenKind::LessEqual | TokenKind::Greater | TokenKind::GreaterEqual => {
                Precedence::Comparison
            }
            TokenKind::Plus | TokenKind::Minus => Precedence::Term,
            TokenKind::Star | TokenKind::Slash => Precedence::Factor,
            TokenKind::LeftParen | TokenKind::Dot => Precedence::Call,
            _ => Precedence::None,
        }
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::Or => self.or_expr(),
            TokenKind::And => self.and_expr(),
            TokenKind::EqualEqual
            | TokenKind::BangEqual
            | TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash => self.binary(kind),
            TokenKind::LeftParen => self.call(),
            TokenKind::Dot => self.dot(can_assign),
            _ => unreachable!("not registered as an infix operator"),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(f64::NAN);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1];
        let id = self.intern(content);
        self.emit_constant(Value::Object(id));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(Opcode::False),
            TokenKind::Nil => self.emit_op(Opcode::Nil),
            TokenKind::True => self.emit_op(Opcode::True),
            _ => unreachable!("only called for literal tokens"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous;
        self.named_variable(name, can_assign);
    }

    fn this_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        let line = self.previous.line;
        self.named_variable(Token::synthetic(TokenKind::This, "this", line), false);
    }

    fn super_expr(&mut self) {
        let has_superclass = self.classes.last().map(|c| c.has_superclass).unwrap_or(false);
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name_const = self.identifier_constant(self.previous.lexeme);
        let line = self.previous.line;

        self.named_variable(Token::synthetic(TokenKind::This, "this", line), false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable(Token::synthetic(TokenKind::Super, "super", line), false);
            self.emit_bytes(Opcode::SuperInvoke, name_const);
            self.emit_byte(argc);
        } else {
            self.named_variable(Token::synthetic(TokenKind::Super, "super", line), false);
            self.emit_bytes(Opcode::GetSuper, name_const);
        }
    }

    fn unary(&mut self) {
        let kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match kind {
            TokenKind::Minus => self.emit_op(Opcode::Negate),
            TokenKind::Bang => self.emit_op(Opcode::Not),
            _ => unreachable!("only called for unary operator tokens"),
        }
    }

    fn binary(&mut self, kind: TokenKind) {
        let precedence = Self::infix_precedence(kind);
        self.parse_precedence(precedence.next());
        match kind {
            TokenKind::Plus => self.emit_op(Opcode::Add),
            TokenKind::Minus => self.emit_op(Opcode::Subtract),
            TokenKind::Star => self.emit_op(Opcode::Multiply),
            TokenKind::Slash => self.emit_op(Opcode::Divide),
            TokenKind::EqualEqual => self.emit_op(Opcode::Equal),
            TokenKind::BangEqual => {
                self.emit_op(Opcode::Equal);
                self.emit_op(Opcode::Not);
            }
            TokenKind::Greater => self.emit_op(Opcode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(Opcode::Less);
                self.emit_op(Opcode::Not);
            }
            TokenKind::Less => self.emit_op(Opcode::Less),
            TokenKind::LessEqual => {
                self.emit_op(Opcode::Greater);
                self.emit_op(Opcode::Not);
            }
            _ => unreachable!("only called for binary operator tokens"),
        }
    }

    fn and_expr(&mut self) {
        let end_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self) {
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        let end_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Opcode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit_bytes(Opcode::Call, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name_const = self.identifier_constant(self.previous.lexeme);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(Opcode::SetProperty, name_const);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_bytes(Opcode::Invoke, name_const);
            self.emit_byte(argc);
        } else {
            self.emit_bytes(Opcode::GetProperty, name_const);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;

    fn compile_ok(source: &str) -> (Heap, ObjId) {
        let mut heap = Heap::new(&VmConfig::default());
        let id = compile(source, &mut heap).unwrap_or_else(|errors| {
            panic!("unexpected compile errors for {source:?}: {errors:?}")
        });
        (heap, id)
    }

    #[test]
    fn compiles_arithmetic_expression_statement() {
        let (heap, id) = compile_ok("print 1 + 2 * 3;");
        let function = heap.obj(id).as_function().unwrap();
        assert!(!function.chunk.is_empty());
    }

    #[test]
    fn reports_multiple_errors_in_one_pass() {
        let mut heap = Heap::new(&VmConfig::default());
        let errors = compile("var ;\nvar ;", &mut heap).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn rejects_reading_local_in_its_own_initializer() {
        let mut heap = Heap::new(&VmConfig::default());
        let errors = compile("{ var a = a; }", &mut heap).unwrap_err();
        assert!(errors[0].message.contains("own initializer"));
    }

    #[test]
    fn rejects_return_value_from_initializer() {
        let mut heap = Heap::new(&VmConfig::default());
        let errors = compile("class A { init() { return 1; } }", &mut heap).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("initializer")));
    }

    #[test]
    fn compiles_anonymous_function_expression() {
        let (heap, id) = compile_ok("var f = fun(x) { return x; }; print f(1);");
        let function = heap.obj(id).as_function().unwrap();
        assert!(!function.chunk.is_empty());
    }
}
