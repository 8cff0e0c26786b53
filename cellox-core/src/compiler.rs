//! Single-pass Pratt-style recursive-descent compiler: emits bytecode
//! directly into a [`Chunk`] as it parses, with no intermediate AST
//! (§4.2). This is the largest component of the core and the one place
//! in the crate that needs `&mut Heap` throughout, since every string
//! and nested-function constant it emits is interned/allocated as it is
//! parsed.

use crate::chunk::{Chunk, OpCode};
use crate::error::CompileError;
use crate::heap::{FunctionObj, Heap, HeapData, HeapId};
use crate::lexer::{Lexer, Token, TokenKind, unescape};
use crate::optimizer;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =  += -= *= /= %= **=
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * / %
    Unary,      // ! -
    Call,       // . () []
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call | Self::Primary => Self::Primary,
        }
    }
}

fn precedence_of(kind: TokenKind) -> Precedence {
    use TokenKind::{
        And, BangEqual, Dot, DotDot, Equal, EqualEqual, Greater, GreaterEqual, LeftBracket, LeftParen, Less,
        LessEqual, Minus, MinusEqual, Or, Percent, PercentEqual, Plus, PlusEqual, Slash, SlashEqual, Star, StarEqual,
        StarStar, StarStarEqual,
    };
    match kind {
        Equal | PlusEqual | MinusEqual | StarEqual | StarStarEqual | SlashEqual | PercentEqual => {
            Precedence::Assignment
        }
        Or => Precedence::Or,
        And => Precedence::And,
        EqualEqual | BangEqual => Precedence::Equality,
        Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
        Plus | Minus | DotDot => Precedence::Term,
        Star | StarStar | Slash | Percent => Precedence::Factor,
        LeftParen | Dot | LeftBracket => Precedence::Call,
        _ => Precedence::None,
    }
}

struct Local {
    name: String,
    /// `None` while the initialiser of its own declaration is still being
    /// compiled (§4.2 "uninitialised").
    depth: Option<usize>,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct FunctionFrame {
    kind: FunctionKind,
    name: Option<String>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: usize,
}

impl FunctionFrame {
    fn new(kind: FunctionKind, name: Option<String>) -> Self {
        // Slot 0 is reserved: `this` in methods/initializers, otherwise
        // an unaddressable empty name (§4.2).
        let slot0_name = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "this"
        } else {
            ""
        };
        Self {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local {
                name: slot0_name.to_owned(),
                depth: Some(0),
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassCompiler {
    has_superclass: bool,
}

/// Owns the lexer, the stack of in-progress function frames (innermost
/// last), and the class-compiler stack for `this`/`super`/`init`
/// handling. One `Compiler` compiles one top-level program (REPL line or
/// whole source file) to completion.
pub struct Compiler<'src, 'h> {
    lexer: Lexer<'src>,
    previous: Token,
    current: Token,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    frames: Vec<FunctionFrame>,
    classes: Vec<ClassCompiler>,
    heap: &'h mut Heap,
}

/// Result of a successful compile: the top-level script function.
pub struct CompileOutput {
    pub script: HeapId,
}

impl<'src, 'h> Compiler<'src, 'h> {
    #[must_use]
    pub fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        let mut lexer = Lexer::new(source);
        let current = lexer.scan_token();
        Self {
            lexer,
            previous: current.clone(),
            current,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            frames: vec![FunctionFrame::new(FunctionKind::Script, None)],
            classes: Vec::new(),
            heap,
        }
    }

    /// Compiles the whole source as a program body and returns the
    /// top-level script function, or the diagnostics collected along the
    /// way if any occurred (§4.2 "Compilation returns failure iff any
    /// error was emitted").
    pub fn compile(mut self) -> Result<CompileOutput, Vec<CompileError>> {
        while !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::Eof, "Expect end of expression.");
        let function = self.end_function();
        if self.had_error {
            return Err(self.errors);
        }
        Ok(CompileOutput { script: function })
    }

    // ----- token stream plumbing -----------------------------------

    fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, self.lexer.scan_token());
        loop {
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.clone();
            self.error_at_current(&message);
            self.current = self.lexer.scan_token();
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
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current.clone();
        self.error_at(&token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        self.error_at(&token, message);
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        tracing::warn!(line = token.line, lexeme = %token.lexeme, message, "entering panic mode");
        let lexeme = if token.kind == TokenKind::Eof { String::new() } else { token.lexeme.clone() };
        self.errors.push(CompileError::new(token.line, lexeme, message));
    }

    /// Resynchronises at the next statement boundary after a parse error
    /// (§4.2): a `;`, or one of the structural keywords that can start a
    /// declaration.
    fn synchronize(&mut self) {
        tracing::trace!(line = self.current.line, "leaving panic mode, resynchronising");
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            if matches!(
                self.current.kind,
                TokenKind::Class | TokenKind::Fun | TokenKind::Var | TokenKind::For | TokenKind::If | TokenKind::While | TokenKind::Return
            ) {
                return;
            }
            self.advance();
        }
    }

    // ----- chunk emission -------------------------------------------

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.frames.last_mut().unwrap().chunk
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.line();
        self.chunk_mut().write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.chunk_mut().write_byte(byte, line);
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.chunk_mut().add_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_byte(idx);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let id = self.heap.intern_string(name.as_bytes());
        self.chunk_mut().add_constant(Value::obj(id))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.line();
        self.chunk_mut().emit_jump(op, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        self.chunk_mut().patch_jump(offset);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.line();
        self.chunk_mut().emit_loop(loop_start, line);
    }

    /// Finishes the current (innermost) function frame: emits the
    /// implicit `return`, runs the peephole optimiser over its chunk
    /// (§4.5), allocates it as a heap `Function`, and pops the frame.
    fn end_function(&mut self) -> HeapId {
        self.emit_return_implicit();
        let mut frame = self.frames.pop().unwrap();
        optimizer::optimize(&mut frame.chunk);
        let name = frame.name.map(|n| self.heap.intern_string(n.as_bytes()));
        self.heap.allocate(HeapData::Function(FunctionObj {
            arity: frame.arity,
            upvalue_count: frame.upvalues.len(),
            name,
            chunk: frame.chunk,
        }))
    }

    fn emit_return_implicit(&mut self) {
        if self.frames.last().unwrap().kind == FunctionKind::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Null);
        }
        self.emit_op(OpCode::Return);
    }

    // ----- scopes and locals ------------------------------------------

    fn begin_scope(&mut self) {
        self.frames.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let frame = self.frames.last_mut().unwrap();
        frame.scope_depth -= 1;
        let depth = frame.scope_depth;
        while let Some(local) = frame.locals.last() {
            if local.depth.is_some_and(|d| d > depth) {
                let captured = local.is_captured;
                frame.locals.pop();
                if captured {
                    self.emit_op(OpCode::CloseUpvalue);
                } else {
                    self.emit_op(OpCode::Pop);
                }
            } else {
                break;
            }
        }
    }

    fn declare_variable(&mut self, name: &str) {
        let frame = self.frames.last().unwrap();
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        for local in frame.locals.iter().rev() {
            if local.depth.is_some_and(|d| d < depth) {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
                return;
            }
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &str) {
        let frame = self.frames.last_mut().unwrap();
        if frame.locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.frames.last_mut().unwrap().locals.push(Local {
            name: name.to_owned(),
            depth: None,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let frame = self.frames.last_mut().unwrap();
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        frame.locals.last_mut().unwrap().depth = Some(depth);
    }

    /// Resolves `name` as a local in frame `frame_idx`. Returns the slot,
    /// or an error if referenced inside its own still-uninitialised
    /// initialiser.
    fn resolve_local(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        let locals = &self.frames[frame_idx].locals;
        for (i, local) in locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth.is_none() {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(u8::try_from(i).unwrap());
            }
        }
        None
    }

    /// Resolves `name` as an upvalue of frame `frame_idx`, recursively
    /// walking outwards through enclosing frames (§4.2 "Variable
    /// resolution").
    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        let enclosing = frame_idx - 1;
        if let Some(local_slot) = self.resolve_local(enclosing, name) {
            self.frames[enclosing].locals[local_slot as usize].is_captured = true;
            return Some(self.add_upvalue(frame_idx, local_slot, true));
        }
        if let Some(up_slot) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(frame_idx, up_slot, false));
        }
        None
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> u8 {
        let frame = &mut self.frames[frame_idx];
        for (i, up) in frame.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return u8::try_from(i).unwrap();
            }
        }
        if frame.upvalues.len() >= 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        frame.upvalues.push(UpvalueDesc { index, is_local });
        u8::try_from(frame.upvalues.len() - 1).unwrap()
    }

    fn parse_variable(&mut self, error_message: &str) -> u8 {
        self.consume(TokenKind::Identifier, error_message);
        let name = self.previous.lexeme.clone();
        self.declare_variable(&name);
        if self.frames.last().unwrap().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(&name)
    }

    fn define_variable(&mut self, global_const: u8) {
        if self.frames.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal);
        self.emit_byte(global_const);
    }

    // ----- declarations and statements ---------------------------------

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
            self.emit_op(OpCode::Null);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect function name.");
        let name = self.previous.lexeme.clone();
        self.declare_variable(&name);
        if self.frames.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
        }
        let global = if self.frames.last().unwrap().scope_depth == 0 {
            self.identifier_constant(&name)
        } else {
            0
        };
        self.function(FunctionKind::Function, name);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind, name: String) {
        self.frames.push(FunctionFrame::new(kind, Some(name)));
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let frame = self.frames.last_mut().unwrap();
                frame.arity += 1;
                if frame.arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
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

        let upvalues: Vec<UpvalueDesc> = {
            let popped_idx = self.frames.len() - 1;
            std::mem::take(&mut self.frames[popped_idx].upvalues)
        };
        let function_id = self.end_function();
        let idx = self.chunk_mut().add_constant(Value::obj(function_id));
        self.emit_op(OpCode::Closure);
        self.emit_byte(idx);
        for up in upvalues {
            self.emit_byte(u8::from(up.is_local));
            self.emit_byte(up.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.clone();
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable(&class_name);
        self.emit_op(OpCode::Class);
        self.emit_byte(name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCompiler { has_superclass: false });

        if self.match_token(TokenKind::Colon) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.clone();
            if super_name.lexeme == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.variable_from_token(&super_name, false);

            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();

            self.named_variable_get(&class_name);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable_get(&class_name);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop); // the class itself, left on the stack by named_variable_get

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme.clone();
        let constant = self.identifier_constant(&name);
        let kind = if name == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind, name);
        self.emit_op(OpCode::Method);
        self.emit_byte(constant);
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::Do) {
            self.do_while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_mut().len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn do_while_statement(&mut self) {
        let loop_start = self.chunk_mut().len();
        self.statement();
        self.consume(TokenKind::While, "Expect 'while' after 'do' body.");
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        self.consume(TokenKind::Semicolon, "Expect ';' after 'do...while' statement.");
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_mut().len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_mut().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.frames.last().unwrap().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return_implicit();
        } else {
            if self.frames.last().unwrap().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    // ----- expressions -------------------------------------------------

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
        while precedence <= precedence_of(self.current.kind) {
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
            TokenKind::LeftBracket => self.array_literal(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string(),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Null => self.emit_op(OpCode::Null),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::This => self.this_expr(),
            TokenKind::Super => self.super_expr(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::StarStar
            | TokenKind::Slash
            | TokenKind::Percent
            | TokenKind::EqualEqual
            | TokenKind::BangEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => self.binary(kind),
            TokenKind::DotDot => self.error("Unexpected '..' outside of an index expression."),
            TokenKind::And => self.and_expr(),
            TokenKind::Or => self.or_expr(),
            TokenKind::LeftParen => self.call_expr(),
            TokenKind::Dot => self.dot_expr(can_assign),
            TokenKind::LeftBracket => self.index_expr(can_assign),
            _ => {}
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, kind: TokenKind) {
        // `**` is right-associative: climb at the same precedence rather
        // than `next()` (§4.2).
        let next_prec = if kind == TokenKind::StarStar { Precedence::Factor } else { precedence_of(kind).next() };
        self.parse_precedence(next_prec);
        match kind {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::StarStar => self.emit_op(OpCode::Exponent),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Percent => self.emit_op(OpCode::Modulo),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn and_expr(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn number(&mut self) {
        let text = self.previous.lexeme.as_str();
        let value = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16).map(f64::from).unwrap_or(0.0)
        } else if let Some(bin) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
            u32::from_str_radix(bin, 2).map(f64::from).unwrap_or(0.0)
        } else {
            text.parse::<f64>().unwrap_or(0.0)
        };
        self.emit_constant(Value::number(value));
    }

    fn string(&mut self) {
        let raw = self.previous.lexeme.clone();
        match unescape(&raw) {
            Ok(bytes) => {
                let id = self.heap.intern_string(&bytes);
                self.emit_constant(Value::obj(id));
            }
            Err(message) => self.error(&message),
        }
    }

    fn array_literal(&mut self) {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after array elements.");
        if count > 255 {
            self.error("Array literal has too many elements.");
        }
        self.emit_op(OpCode::ArrayLiteral);
        self.emit_byte(count as u8);
    }

    fn variable(&mut self, can_assign: bool) {
        let token = self.previous.clone();
        self.variable_from_token(&token, can_assign);
    }

    fn variable_from_token(&mut self, token: &Token, can_assign: bool) {
        self.named_variable(&token.lexeme, can_assign);
    }

    fn this_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
        }
        self.named_variable_get("this");
    }

    fn super_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let method_name = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&method_name);

        self.named_variable_get("this");
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable_get("super");
            self.emit_op(OpCode::SuperInvoke);
            self.emit_byte(name_const);
            self.emit_byte(argc);
        } else {
            self.named_variable_get("super");
            self.emit_op(OpCode::GetSuper);
            self.emit_byte(name_const);
        }
    }

    /// Emits a bare read of `name` (used for `this`/`super`/the
    /// superclass's own name — never an assignment target).
    fn named_variable_get(&mut self, name: &str) {
        self.named_variable(name, false);
    }

    /// Resolves `name` per §4.2's three-step rule and emits the
    /// appropriate get/set (or compound-assignment get+op+set) sequence.
    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let frame_idx = self.frames.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(frame_idx, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(frame_idx, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let idx = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        };

        if can_assign && self.match_compound_or_plain_assign(get_op, arg) {
            self.emit_op(set_op);
            self.emit_byte(arg);
        } else {
            self.emit_op(get_op);
            self.emit_byte(arg);
        }
    }

    /// On `=`/compound-assign tokens, compiles the RHS (emitting a prior
    /// `get` plus the arithmetic op for compound forms) and returns
    /// `true`. Otherwise leaves the parser untouched and returns `false`.
    fn match_compound_or_plain_assign(&mut self, get_op: OpCode, get_arg: u8) -> bool {
        if self.match_token(TokenKind::Equal) {
            self.expression();
            true
        } else if let Some(arith) = self.match_compound_token() {
            self.emit_op(get_op);
            self.emit_byte(get_arg);
            self.expression();
            self.emit_op(arith);
            true
        } else {
            false
        }
    }

    fn match_compound_token(&mut self) -> Option<OpCode> {
        let op = match self.current.kind {
            TokenKind::PlusEqual => OpCode::Add,
            TokenKind::MinusEqual => OpCode::Subtract,
            TokenKind::StarEqual => OpCode::Multiply,
            TokenKind::StarStarEqual => OpCode::Exponent,
            TokenKind::SlashEqual => OpCode::Divide,
            TokenKind::PercentEqual => OpCode::Modulo,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn call_expr(&mut self) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn dot_expr(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&name);

        if can_assign && self.match_compound_or_plain_assign(OpCode::GetProperty, name_const) {
            self.emit_op(OpCode::SetProperty);
            self.emit_byte(name_const);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_byte(name_const);
            self.emit_byte(argc);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_byte(name_const);
        }
    }

    /// `e[i]`, `e[i]=v`, and `e[lo..hi]` all share one opening bracket.
    fn index_expr(&mut self, can_assign: bool) {
        self.expression();
        if self.match_token(TokenKind::DotDot) {
            self.expression();
            self.consume(TokenKind::RightBracket, "Expect ']' after slice.");
            self.emit_op(OpCode::GetSliceOf);
            return;
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetIndexOf);
        } else {
            self.emit_op(OpCode::GetIndexOf);
        }
    }
}

/// Compiles `source` to a top-level script function. On success, returns
/// the function's `HeapId`; the caller is responsible for wrapping it in
/// a closure and calling it (mirroring how nested `fun`/method bodies
/// are always invoked through a `Closure`, never bare).
///
/// # Errors
/// Returns every diagnostic collected during compilation.
pub fn compile(source: &str, heap: &mut Heap) -> Result<HeapId, Vec<CompileError>> {
    Compiler::new(source, heap).compile().map(|out| out.script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::OpCode;

    fn compile_ok(src: &str) -> (HeapId, Heap) {
        let mut heap = Heap::new();
        let id = compile(src, &mut heap).unwrap_or_else(|errs| {
            panic!("unexpected compile errors: {errs:?}", errs = errs.iter().map(ToString::to_string).collect::<Vec<_>>())
        });
        (id, heap)
    }

    #[test]
    fn compiles_a_trivial_expression_statement() {
        let (id, heap) = compile_ok("1 + 2;");
        let HeapData::Function(f) = heap.get(id) else { panic!("expected function") };
        // The peephole optimiser folds `1 + 2` to a single CONSTANT, then
        // POP, then the implicit NULL/RETURN.
        assert_eq!(f.chunk.code()[0], OpCode::Constant.to_byte());
        assert!(f.chunk.code().contains(&OpCode::Pop.to_byte()));
        assert!(f.chunk.code().contains(&OpCode::Return.to_byte()));
    }

    #[test]
    fn reports_error_on_invalid_assignment_target() {
        let mut heap = Heap::new();
        let result = compile("1 + 2 = 3;", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn resolves_closures_as_upvalues() {
        let (id, heap) = compile_ok("fun mk() { var i = 0; fun step() { i = i + 1; return i; } return step; }");
        let HeapData::Function(script) = heap.get(id) else { panic!() };
        assert!(!script.chunk.is_empty());
    }

    #[test]
    fn synchronizes_after_a_parse_error_and_keeps_parsing() {
        let mut heap = Heap::new();
        let errs = compile("var ;  var y = 1;", &mut heap).unwrap_err();
        assert!(!errs.is_empty());
    }

    #[test]
    fn class_with_superclass_compiles() {
        let (id, heap) = compile_ok("class A { greet() { print 1; } } class B : A {} B();");
        let HeapData::Function(script) = heap.get(id) else { panic!() };
        assert!(script.chunk.code().contains(&OpCode::Inherit.to_byte()));
    }
}
