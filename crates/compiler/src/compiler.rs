//! Single-pass Pratt compiler: tokens in, bytecode out.
//!
//! A stack of per-function compiler frames tracks locals, upvalues, and
//! scope depth while the parser walks the source once. Functions compile
//! into their own chunks and land on the heap as constants of the
//! enclosing chunk; the whole script becomes one nameless function.
//!
//! Error handling is panic-mode: the first error in a statement is
//! reported, the rest are suppressed until the parser resynchronizes at a
//! statement boundary, and compilation continues to the end of the file so
//! every statement gets a chance to report.

use std::io::Write;

use lox_core::object::{Function, Obj, ObjHandle};
use lox_core::{Chunk, DebugOptions, Gc, Globals, OpCode, Value, debug};

use crate::scanner::{Scanner, Token, TokenType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . () []
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
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

type ParseFn<'src, 'ctx> = fn(&mut Parser<'src, 'ctx>, bool);

struct Rule<'src, 'ctx> {
    prefix: Option<ParseFn<'src, 'ctx>>,
    infix: Option<ParseFn<'src, 'ctx>>,
    precedence: Precedence,
}

fn rule<'src, 'ctx>(
    prefix: Option<ParseFn<'src, 'ctx>>,
    infix: Option<ParseFn<'src, 'ctx>>,
    precedence: Precedence,
) -> Rule<'src, 'ctx> {
    Rule {
        prefix,
        infix,
        precedence,
    }
}

fn get_rule<'src, 'ctx>(ttype: TokenType) -> Rule<'src, 'ctx> {
    use TokenType::*;
    match ttype {
        LeftParen => rule(Some(grouping), Some(call), Precedence::Call),
        LeftBrace => rule(Some(map_literal), None, Precedence::None),
        LeftBracket => rule(Some(list_literal), Some(index), Precedence::Call),
        Dot => rule(None, Some(dot), Precedence::Call),
        Minus => rule(Some(unary), Some(binary), Precedence::Term),
        Plus => rule(None, Some(binary), Precedence::Term),
        Slash | Star => rule(None, Some(binary), Precedence::Factor),
        Bang => rule(Some(unary), None, Precedence::None),
        BangEqual | EqualEqual => rule(None, Some(binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            rule(None, Some(binary), Precedence::Comparison)
        }
        Identifier => rule(Some(variable), None, Precedence::None),
        String => rule(Some(string_lit), None, Precedence::None),
        Number => rule(Some(number_lit), None, Precedence::None),
        And => rule(None, Some(and_), Precedence::And),
        Or => rule(None, Some(or_), Precedence::Or),
        False | Nil | True => rule(Some(literal), None, Precedence::None),
        Super => rule(Some(super_), None, Precedence::None),
        This => rule(Some(this_), None, Precedence::None),
        _ => rule(None, None, Precedence::None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: Token<'src>,
    /// -1 while the local is declared but not yet initialized.
    depth: i32,
    is_captured: bool,
}

struct CompilerUpvalue {
    index: u8,
    is_local: bool,
}

#[derive(Debug, Clone, Copy)]
struct LoopContext {
    /// Where `continue` jumps back to: the increment clause of a `for`, or
    /// the condition otherwise.
    continue_target: usize,
    /// Locals deeper than this are popped before the jump.
    scope_depth: i32,
}

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Per-function compiler state.
struct FunctionCompiler<'src> {
    function: Function,
    ftype: FunctionType,
    locals: Vec<Local<'src>>,
    upvalues: Vec<CompilerUpvalue>,
    scope_depth: i32,
    loop_ctx: Option<LoopContext>,
}

impl<'src> FunctionCompiler<'src> {
    fn new(ftype: FunctionType, name: Option<ObjHandle>) -> FunctionCompiler<'src> {
        // Slot zero belongs to the function itself, and doubles as `this`
        // inside methods.
        let slot_zero = Local {
            name: Token {
                ttype: TokenType::Identifier,
                lexeme: match ftype {
                    FunctionType::Method | FunctionType::Initializer => "this",
                    _ => "",
                },
                line: 0,
            },
            depth: 0,
            is_captured: false,
        };
        FunctionCompiler {
            function: Function::new(name),
            ftype,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            loop_ctx: None,
        }
    }
}

struct ClassCompiler {
    has_superclass: bool,
}

struct Parser<'src, 'ctx> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    gc: &'ctx mut Gc,
    globals: &'ctx mut Globals,
    opts: &'ctx DebugOptions,
    err: &'ctx mut dyn Write,
    compilers: Vec<FunctionCompiler<'src>>,
    classes: Vec<ClassCompiler>,
}

fn identifiers_equal(a: &Token<'_>, b: &Token<'_>) -> bool {
    a.lexeme == b.lexeme
}

fn synthetic_token(text: &'static str) -> Token<'static> {
    Token {
        ttype: TokenType::Identifier,
        lexeme: text,
        line: 0,
    }
}

/// Compile a whole source string into a script function. Diagnostics go to
/// `err`; `None` means at least one compile error was reported.
pub fn compile(
    source: &str,
    gc: &mut Gc,
    globals: &mut Globals,
    opts: &DebugOptions,
    err: &mut dyn Write,
) -> Option<ObjHandle> {
    let placeholder = Token {
        ttype: TokenType::Eof,
        lexeme: "",
        line: 0,
    };
    let mut parser = Parser {
        scanner: Scanner::new(source),
        current: placeholder,
        previous: placeholder,
        had_error: false,
        panic_mode: false,
        gc,
        globals,
        opts,
        err,
        compilers: vec![FunctionCompiler::new(FunctionType::Script, None)],
        classes: Vec::new(),
    };

    parser.advance();
    while !parser.match_token(TokenType::Eof) {
        parser.declaration();
    }
    let (function, _) = parser.end_compiler();
    if parser.had_error {
        return None;
    }
    Some(function)
}

impl<'src, 'ctx> Parser<'src, 'ctx> {
    // ---- token plumbing ------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.ttype != TokenType::Error {
                break;
            }
            let token = self.current;
            self.error_at(token, token.lexeme);
        }
    }

    fn consume(&mut self, ttype: TokenType, message: &str) {
        if self.current.ttype == ttype {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, ttype: TokenType) -> bool {
        self.current.ttype == ttype
    }

    fn match_token(&mut self, ttype: TokenType) -> bool {
        if !self.check(ttype) {
            return false;
        }
        self.advance();
        true
    }

    // ---- error reporting -----------------------------------------------

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let _ = write!(self.err, "[line {}] Error", token.line);
        match token.ttype {
            TokenType::Eof => {
                let _ = write!(self.err, " at end");
            }
            TokenType::Error => {}
            _ => {
                let _ = write!(self.err, " at '{}'", token.lexeme);
            }
        }
        let _ = writeln!(self.err, ": {}", message);
        self.had_error = true;
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.ttype != TokenType::Eof {
            if self.previous.ttype == TokenType::Semicolon {
                return;
            }
            match self.current.ttype {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- compiler-frame helpers ----------------------------------------

    fn fc(&self) -> &FunctionCompiler<'src> {
        let index = self.compilers.len() - 1;
        &self.compilers[index]
    }

    fn fc_mut(&mut self) -> &mut FunctionCompiler<'src> {
        let index = self.compilers.len() - 1;
        &mut self.compilers[index]
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.fc_mut().function.chunk
    }

    fn chunk_len(&self) -> usize {
        self.fc().function.chunk.code.len()
    }

    // ---- allocation with GC coordination -------------------------------

    /// Collect with the compiler chain and globals as roots before the
    /// next allocation, when the GC asks for it.
    fn maybe_collect(&mut self) {
        if !self.gc.should_collect() {
            return;
        }
        let Parser {
            gc,
            globals,
            compilers,
            ..
        } = self;
        gc.collect(|gc| {
            for fc in compilers.iter() {
                if let Some(name) = fc.function.name {
                    gc.mark_object(name);
                }
                for &constant in &fc.function.chunk.constants {
                    gc.mark_value(constant);
                }
            }
            globals.mark(gc);
        });
    }

    fn intern(&mut self, chars: &str) -> ObjHandle {
        if let Some(handle) = self.gc.find_string(chars) {
            return handle;
        }
        self.maybe_collect();
        self.gc.intern_new(chars)
    }

    // ---- bytecode emission ---------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_bytes(&mut self, byte1: u8, byte2: u8) {
        self.emit_byte(byte1);
        self.emit_byte(byte2);
    }

    fn emit_return(&mut self) {
        if self.fc().ftype == FunctionType::Initializer {
            self.emit_bytes(OpCode::GetLocal as u8, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 to step over the operand itself.
        let jump = self.chunk_len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = self.current_chunk();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let constant = self.current_chunk().add_constant(value);
        if constant > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        constant as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_bytes(OpCode::Constant as u8, constant);
    }

    fn identifier_constant(&mut self, name: Token<'src>) -> u8 {
        let handle = self.intern(name.lexeme);
        self.make_constant(Value::obj(handle))
    }

    /// Finish the innermost function and move it onto the heap. Any pending
    /// collection runs first, while the function's constants are still
    /// rooted through the compiler chain; the allocation itself never
    /// collects, so nothing is lost in between.
    fn end_compiler(&mut self) -> (ObjHandle, Vec<CompilerUpvalue>) {
        self.emit_return();
        {
            let fc = self.fc_mut();
            fc.function.upvalue_count = fc.upvalues.len();
        }
        self.maybe_collect();
        let fc = match self.compilers.pop() {
            Some(fc) => fc,
            None => FunctionCompiler::new(FunctionType::Script, None),
        };
        let upvalues = fc.upvalues;
        let handle = self.gc.alloc(Obj::Function(fc.function));
        if self.opts.print_code && !self.had_error {
            let function = self.gc.heap().function(handle);
            let name = match function.name {
                Some(name) => self.gc.heap().string(name).chars.clone(),
                None => "<script>".to_string(),
            };
            debug::disassemble_chunk(self.gc.heap(), &function.chunk, &name, &mut *self.err);
        }
        (handle, upvalues)
    }

    // ---- scopes and variables ------------------------------------------

    fn begin_scope(&mut self) {
        self.fc_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let fc = self.fc_mut();
        fc.scope_depth -= 1;
        let mut discards = Vec::new();
        while let Some(local) = fc.locals.last() {
            if local.depth <= fc.scope_depth {
                break;
            }
            discards.push(local.is_captured);
            fc.locals.pop();
        }
        for is_captured in discards {
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: Token<'src>) {
        if self.fc().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.fc_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.fc().scope_depth == 0 {
            return;
        }
        let name = self.previous;
        let mut duplicate = false;
        {
            let fc = self.fc();
            for local in fc.locals.iter().rev() {
                if local.depth != -1 && local.depth < fc.scope_depth {
                    break;
                }
                if identifiers_equal(&local.name, &name) {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenType::Identifier, message);
        self.declare_variable();
        if self.fc().scope_depth > 0 {
            return 0;
        }
        let name = self.previous;
        let handle = self.intern(name.lexeme);
        self.globals.ensure_slot(self.gc.heap(), handle);
        self.make_constant(Value::obj(handle))
    }

    fn mark_initialized(&mut self) {
        if self.fc().scope_depth == 0 {
            return;
        }
        let fc = self.fc_mut();
        let index = fc.locals.len() - 1;
        fc.locals[index].depth = fc.scope_depth;
    }

    fn define_variable(&mut self, global: u8) {
        if self.fc().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal as u8, global);
    }

    fn resolve_local(&mut self, ci: usize, name: &Token<'src>) -> Option<u8> {
        let mut uninitialized = false;
        let mut found = None;
        for (i, local) in self.compilers[ci].locals.iter().enumerate().rev() {
            if identifiers_equal(&local.name, name) {
                if local.depth == -1 {
                    uninitialized = true;
                }
                found = Some(i as u8);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    fn add_upvalue(&mut self, ci: usize, index: u8, is_local: bool) -> u8 {
        for (i, upvalue) in self.compilers[ci].upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i as u8;
            }
        }
        if self.compilers[ci].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.compilers[ci].upvalues.push(CompilerUpvalue { index, is_local });
        (self.compilers[ci].upvalues.len() - 1) as u8
    }

    /// Climb the enclosing chain for `name`. A local found in an enclosing
    /// frame is marked captured and threaded down through every
    /// intermediate frame as an upvalue.
    fn resolve_upvalue(&mut self, ci: usize, name: &Token<'src>) -> Option<u8> {
        if ci == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(ci - 1, name) {
            self.compilers[ci - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(ci, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(ci - 1, name) {
            return Some(self.add_upvalue(ci, upvalue, false));
        }
        None
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let ci = self.compilers.len() - 1;

        if let Some(slot) = self.resolve_local(ci, &name) {
            if can_assign && self.match_token(TokenType::Equal) {
                self.expression();
                self.emit_bytes(OpCode::SetLocal as u8, slot);
            } else {
                self.emit_bytes(OpCode::GetLocal as u8, slot);
            }
            return;
        }

        if let Some(slot) = self.resolve_upvalue(ci, &name) {
            if can_assign && self.match_token(TokenType::Equal) {
                self.expression();
                self.emit_bytes(OpCode::SetUpvalue as u8, slot);
            } else {
                self.emit_bytes(OpCode::GetUpvalue as u8, slot);
            }
            return;
        }

        // Globals: once a name has a slot, later references skip the name
        // lookup via the indexed opcodes.
        let handle = self.intern(name.lexeme);
        let seen = self.globals.slot_index(self.gc.heap(), handle);
        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            match seen {
                Some(slot) if slot <= u8::MAX as usize => {
                    self.emit_bytes(OpCode::SetGlobalI as u8, slot as u8);
                }
                _ => {
                    self.globals.ensure_slot(self.gc.heap(), handle);
                    let constant = self.make_constant(Value::obj(handle));
                    self.emit_bytes(OpCode::SetGlobal as u8, constant);
                }
            }
        } else {
            match seen {
                Some(slot) if slot <= u8::MAX as usize => {
                    self.emit_bytes(OpCode::GetGlobalI as u8, slot as u8);
                }
                _ => {
                    self.globals.ensure_slot(self.gc.heap(), handle);
                    let constant = self.make_constant(Value::obj(handle));
                    self.emit_bytes(OpCode::GetGlobal as u8, constant);
                }
            }
        }
    }

    // ---- expressions ----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = get_rule(self.previous.ttype).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule(self.current.ttype).precedence {
            self.advance();
            if let Some(infix) = get_rule(self.previous.ttype).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: u32 = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if arg_count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                arg_count += 1;
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        arg_count.min(255) as u8
    }

    // ---- declarations and statements ------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenType::Class) {
            self.class_declaration();
        } else if self.match_token(TokenType::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenType::Print) {
            self.print_statement();
        } else if self.match_token(TokenType::If) {
            self.if_statement();
        } else if self.match_token(TokenType::Return) {
            self.return_statement();
        } else if self.match_token(TokenType::While) {
            self.while_statement();
        } else if self.match_token(TokenType::For) {
            self.for_statement();
        } else if self.match_token(TokenType::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenType::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenType::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself; it is usable inside its own body.
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, ftype: FunctionType) {
        let name_token = self.previous;
        let name = Some(self.intern(name_token.lexeme));
        self.compilers.push(FunctionCompiler::new(ftype, name));
        self.begin_scope();

        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                self.fc_mut().function.arity += 1;
                if self.fc().function.arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (handle, upvalues) = self.end_compiler();
        let constant = self.make_constant(Value::obj(handle));
        self.emit_bytes(OpCode::Closure as u8, constant);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();
        if self.fc().scope_depth == 0 {
            let handle = self.intern(class_name.lexeme);
            self.globals.ensure_slot(self.gc.heap(), handle);
        }
        self.emit_bytes(OpCode::Class as u8, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCompiler {
            has_superclass: false,
        });

        if self.match_token(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            variable(self, false);
            if identifiers_equal(&class_name, &self.previous) {
                self.error("A class can't inherit from itself.");
            }

            // A hidden scope binds `super` to the superclass for every
            // method of this class.
            self.begin_scope();
            self.add_local(synthetic_token("super"));
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let has_superclass = self.classes.last().is_some_and(|c| c.has_superclass);
        if has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let name = self.previous;
        let constant = self.identifier_constant(name);
        let ftype = if name.lexeme == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(ftype);
        self.emit_bytes(OpCode::Method as u8, constant);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        if self.fc().ftype == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.fc().ftype == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::PjmpIfFalse);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        if self.match_token(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::PjmpIfFalse);
        let scope_depth = self.fc().scope_depth;
        let enclosing = self.fc_mut().loop_ctx.replace(LoopContext {
            continue_target: loop_start,
            scope_depth,
        });
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.fc_mut().loop_ctx = enclosing;
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenType::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_len();
        let mut exit_jump = None;
        if !self.match_token(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::PjmpIfFalse));
        }

        if !self.match_token(TokenType::RightParen) {
            // The increment executes after the body, so it is emitted first
            // and jumped over on the way in.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let scope_depth = self.fc().scope_depth;
        let enclosing = self.fc_mut().loop_ctx.replace(LoopContext {
            continue_target: loop_start,
            scope_depth,
        });
        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
        }
        self.fc_mut().loop_ctx = enclosing;
        self.end_scope();
    }

    fn continue_statement(&mut self) {
        let Some(ctx) = self.fc().loop_ctx else {
            self.error("Cannot 'continue' outside of a loop.");
            return;
        };
        self.consume(TokenType::Semicolon, "Expect ';' after 'continue'.");

        // Discard locals declared inside the loop before jumping back.
        let discards: Vec<bool> = self
            .fc()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > ctx.scope_depth)
            .map(|local| local.is_captured)
            .collect();
        for is_captured in discards {
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
        self.emit_loop(ctx.continue_target);
    }

    fn switch_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");

        // The switch value lives in a hidden local so each case can test it
        // without consuming it.
        self.begin_scope();
        self.add_local(synthetic_token(""));
        self.mark_initialized();
        let value_slot = (self.fc().locals.len() - 1) as u8;

        self.consume(TokenType::LeftBrace, "Expect '{' for switch body.");

        let mut end_jumps = Vec::new();
        let mut next_case: Option<usize> = None;
        let mut in_arm = false;
        let mut seen_default = false;

        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            if !seen_default && self.match_token(TokenType::Case) {
                if in_arm {
                    // A matched arm runs to here, then leaves the switch.
                    end_jumps.push(self.emit_jump(OpCode::Jump));
                }
                if let Some(jump) = next_case.take() {
                    self.patch_jump(jump);
                }
                self.emit_bytes(OpCode::GetLocal as u8, value_slot);
                self.expression();
                self.consume(TokenType::Colon, "Expect ':' after case expression.");
                self.emit_op(OpCode::Equal);
                next_case = Some(self.emit_jump(OpCode::PjmpIfFalse));
                in_arm = true;
            } else if !seen_default && self.match_token(TokenType::Default) {
                if in_arm {
                    end_jumps.push(self.emit_jump(OpCode::Jump));
                }
                if let Some(jump) = next_case.take() {
                    self.patch_jump(jump);
                }
                self.consume(TokenType::Colon, "Expect ':' after 'default'.");
                seen_default = true;
                in_arm = true;
            } else {
                self.statement();
            }
        }

        self.consume(TokenType::RightBrace, "Expect '}' after switch body.");
        for jump in end_jumps {
            self.patch_jump(jump);
        }
        if let Some(jump) = next_case {
            self.patch_jump(jump);
        }
        self.end_scope();
    }
}

// ---- parse rules (prefix/infix handlers) --------------------------------

fn grouping(p: &mut Parser<'_, '_>, _can_assign: bool) {
    p.expression();
    p.consume(TokenType::RightParen, "Expect ')' after expression.");
}

fn number_lit(p: &mut Parser<'_, '_>, _can_assign: bool) {
    let value: f64 = p.previous.lexeme.parse().unwrap_or(0.0);
    p.emit_constant(Value::number(value));
}

fn string_lit(p: &mut Parser<'_, '_>, _can_assign: bool) {
    let lexeme = p.previous.lexeme;
    let chars = &lexeme[1..lexeme.len() - 1];
    let handle = p.intern(chars);
    p.emit_constant(Value::obj(handle));
}

fn literal(p: &mut Parser<'_, '_>, _can_assign: bool) {
    match p.previous.ttype {
        TokenType::False => p.emit_op(OpCode::False),
        TokenType::Nil => p.emit_op(OpCode::Nil),
        TokenType::True => p.emit_op(OpCode::True),
        _ => {}
    }
}

fn variable(p: &mut Parser<'_, '_>, can_assign: bool) {
    let name = p.previous;
    p.named_variable(name, can_assign);
}

fn unary(p: &mut Parser<'_, '_>, _can_assign: bool) {
    let operator = p.previous.ttype;
    p.parse_precedence(Precedence::Unary);
    match operator {
        TokenType::Bang => p.emit_op(OpCode::Not),
        TokenType::Minus => p.emit_op(OpCode::Negate),
        _ => {}
    }
}

fn binary(p: &mut Parser<'_, '_>, _can_assign: bool) {
    let operator = p.previous.ttype;
    let precedence = get_rule(operator).precedence.next();
    let operand_start = p.chunk_len();
    p.parse_precedence(precedence);

    // When the right-hand operand compiled to a bare constant load, fold it
    // into the operation where a fused opcode exists.
    let fused = {
        let chunk = &p.fc().function.chunk;
        if chunk.code.len() == operand_start + 2
            && chunk.code[operand_start] == OpCode::Constant as u8
        {
            Some(chunk.code[operand_start + 1])
        } else {
            None
        }
    };

    match operator {
        TokenType::BangEqual => {
            p.emit_op(OpCode::Equal);
            p.emit_op(OpCode::Not);
        }
        TokenType::EqualEqual => p.emit_op(OpCode::Equal),
        TokenType::Greater => p.emit_op(OpCode::Greater),
        TokenType::GreaterEqual => {
            if let Some(constant) = fused {
                p.current_chunk().strip_last(2);
                p.emit_bytes(OpCode::LessC as u8, constant);
            } else {
                p.emit_op(OpCode::Less);
            }
            p.emit_op(OpCode::Not);
        }
        TokenType::Less => {
            if let Some(constant) = fused {
                p.current_chunk().strip_last(2);
                p.emit_bytes(OpCode::LessC as u8, constant);
            } else {
                p.emit_op(OpCode::Less);
            }
        }
        TokenType::LessEqual => {
            p.emit_op(OpCode::Greater);
            p.emit_op(OpCode::Not);
        }
        TokenType::Plus => {
            if let Some(constant) = fused {
                p.current_chunk().strip_last(2);
                p.emit_bytes(OpCode::AddC as u8, constant);
            } else {
                p.emit_op(OpCode::Add);
            }
        }
        TokenType::Minus => {
            if let Some(constant) = fused {
                p.current_chunk().strip_last(2);
                p.emit_bytes(OpCode::SubtractC as u8, constant);
            } else {
                p.emit_op(OpCode::Subtract);
            }
        }
        TokenType::Star => p.emit_op(OpCode::Multiply),
        TokenType::Slash => p.emit_op(OpCode::Divide),
        _ => {}
    }
}

fn and_(p: &mut Parser<'_, '_>, _can_assign: bool) {
    let end_jump = p.emit_jump(OpCode::JumpIfFalse);
    p.emit_op(OpCode::Pop);
    p.parse_precedence(Precedence::And);
    p.patch_jump(end_jump);
}

fn or_(p: &mut Parser<'_, '_>, _can_assign: bool) {
    let else_jump = p.emit_jump(OpCode::JumpIfFalse);
    let end_jump = p.emit_jump(OpCode::Jump);
    p.patch_jump(else_jump);
    p.emit_op(OpCode::Pop);
    p.parse_precedence(Precedence::Or);
    p.patch_jump(end_jump);
}

fn call(p: &mut Parser<'_, '_>, _can_assign: bool) {
    let arg_count = p.argument_list();
    p.emit_bytes(OpCode::Call as u8, arg_count);
}

fn dot(p: &mut Parser<'_, '_>, can_assign: bool) {
    p.consume(TokenType::Identifier, "Expect property name after '.'.");
    let name = p.previous;
    let constant = p.identifier_constant(name);

    if can_assign && p.match_token(TokenType::Equal) {
        p.expression();
        p.emit_bytes(OpCode::SetProperty as u8, constant);
    } else if p.match_token(TokenType::LeftParen) {
        let arg_count = p.argument_list();
        p.emit_bytes(OpCode::Invoke as u8, constant);
        p.emit_byte(arg_count);
    } else {
        p.emit_bytes(OpCode::GetProperty as u8, constant);
    }
}

fn index(p: &mut Parser<'_, '_>, can_assign: bool) {
    p.expression();
    p.consume(TokenType::RightBracket, "Expect ']' after index.");
    if can_assign && p.match_token(TokenType::Equal) {
        p.expression();
        p.emit_op(OpCode::SetIndex);
    } else {
        p.emit_op(OpCode::GetIndex);
    }
}

fn list_literal(p: &mut Parser<'_, '_>, _can_assign: bool) {
    p.emit_op(OpCode::ListInit);
    let mut pending: u32 = 0;
    if !p.check(TokenType::RightBracket) {
        loop {
            p.expression();
            pending += 1;
            if pending == 255 {
                p.emit_bytes(OpCode::ListData as u8, 255);
                pending = 0;
            }
            if !p.match_token(TokenType::Comma) {
                break;
            }
        }
    }
    p.consume(TokenType::RightBracket, "Expect ']' after list elements.");
    if pending > 0 {
        p.emit_bytes(OpCode::ListData as u8, pending as u8);
    }
}

fn map_literal(p: &mut Parser<'_, '_>, _can_assign: bool) {
    p.emit_op(OpCode::MapInit);
    let mut pending: u32 = 0;
    if !p.check(TokenType::RightBrace) {
        loop {
            p.expression();
            p.consume(TokenType::Colon, "Expect ':' after map key.");
            p.expression();
            pending += 1;
            if pending == 255 {
                p.emit_bytes(OpCode::MapData as u8, 255);
                pending = 0;
            }
            if !p.match_token(TokenType::Comma) {
                break;
            }
        }
    }
    p.consume(TokenType::RightBrace, "Expect '}' after map entries.");
    if pending > 0 {
        p.emit_bytes(OpCode::MapData as u8, pending as u8);
    }
}

fn this_(p: &mut Parser<'_, '_>, _can_assign: bool) {
    if p.classes.is_empty() {
        p.error("Can't use 'this' outside of a class.");
        return;
    }
    variable(p, false);
}

fn super_(p: &mut Parser<'_, '_>, _can_assign: bool) {
    match p.classes.last() {
        None => p.error("Can't use 'super' outside of a class."),
        Some(class) if !class.has_superclass => {
            p.error("Can't use 'super' in a class with no superclass.");
        }
        _ => {}
    }

    p.consume(TokenType::Dot, "Expect '.' after 'super'.");
    p.consume(TokenType::Identifier, "Expect superclass method name.");
    let name_token = p.previous;
    let name = p.identifier_constant(name_token);

    p.named_variable(synthetic_token("this"), false);
    if p.match_token(TokenType::LeftParen) {
        let arg_count = p.argument_list();
        p.named_variable(synthetic_token("super"), false);
        p.emit_bytes(OpCode::SuperInvoke as u8, name);
        p.emit_byte(arg_count);
    } else {
        p.named_variable(synthetic_token("super"), false);
        p.emit_bytes(OpCode::GetSuper as u8, name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn try_compile(source: &str) -> (Option<ObjHandle>, String, Gc) {
        let opts = DebugOptions::default();
        let mut gc = Gc::new(&opts);
        let mut globals = Globals::new();
        let mut err: Vec<u8> = Vec::new();
        let function = compile(source, &mut gc, &mut globals, &opts, &mut err);
        (function, String::from_utf8_lossy(&err).into_owned(), gc)
    }

    fn compile_error(source: &str) -> String {
        let (function, err, _gc) = try_compile(source);
        assert!(function.is_none(), "expected a compile error for {source:?}");
        err
    }

    fn script_code(source: &str) -> Vec<u8> {
        let (function, err, gc) = try_compile(source);
        let function = function.unwrap_or_else(|| panic!("compile failed: {err}"));
        gc.heap().function(function).chunk.code.clone()
    }

    #[test]
    fn test_empty_source_compiles_to_return() {
        assert_eq!(
            script_code(""),
            vec![OpCode::Nil as u8, OpCode::Return as u8]
        );
    }

    #[test]
    fn test_print_statement_bytecode() {
        // The constant operand of `1+2` fuses into OP_ADD_C.
        assert_eq!(
            script_code("print 1 + 2;"),
            vec![
                OpCode::Constant as u8,
                0,
                OpCode::AddC as u8,
                1,
                OpCode::Print as u8,
                OpCode::Nil as u8,
                OpCode::Return as u8,
            ]
        );
    }

    #[test]
    fn test_non_constant_operand_does_not_fuse() {
        // `1 + (2 * 3)` keeps the generic OP_ADD.
        let code = script_code("print 1 + 2 * 3;");
        assert!(code.contains(&(OpCode::Add as u8)));
        assert!(code.contains(&(OpCode::Multiply as u8)));
        assert!(!code.contains(&(OpCode::AddC as u8)));
    }

    #[test]
    fn test_comparison_fusion() {
        let code = script_code("var i; i < 10;");
        assert!(code.contains(&(OpCode::LessC as u8)));
        // `>=` lowers to the fused less plus a not.
        let code = script_code("var i; i >= 10;");
        assert!(code.contains(&(OpCode::LessC as u8)));
        assert!(code.contains(&(OpCode::Not as u8)));
    }

    #[test]
    fn test_global_fast_path_after_first_sight() {
        // The declaration reserves a slot, so both the read and the write
        // go through the indexed opcodes.
        let code = script_code("var x = 1; x = x;");
        assert!(code.contains(&(OpCode::GetGlobalI as u8)));
        assert!(code.contains(&(OpCode::SetGlobalI as u8)));
        // A never-declared global stays on the named path.
        let code = script_code("y;");
        assert!(code.contains(&(OpCode::GetGlobal as u8)));
        assert!(!code.contains(&(OpCode::GetGlobalI as u8)));
    }

    #[test]
    fn test_error_format_and_location() {
        let err = compile_error("1 +;");
        assert_eq!(err, "[line 1] Error at ';': Expect expression.\n");
        let err = compile_error("print 1");
        assert!(err.contains("Error at end: Expect ';' after value."));
    }

    #[test]
    fn test_panic_mode_suppresses_cascades_until_sync() {
        // Both statements report, but each reports only once.
        let err = compile_error("var 1; var 2;");
        assert_eq!(err.matches("Expect variable name.").count(), 2);
    }

    #[test]
    fn test_local_scoping_errors() {
        let err = compile_error("{var x; var x;}");
        assert!(err.contains("Already a variable with this name in this scope."));
        let err = compile_error("{var a; {var a = a;}}");
        assert!(err.contains("Can't read local variable in its own initializer."));
    }

    #[test]
    fn test_class_and_function_errors() {
        let err = compile_error("class A < A {}");
        assert!(err.contains("A class can't inherit from itself."));
        let err = compile_error("return 1;");
        assert!(err.contains("Can't return from top-level code."));
        let err = compile_error("class A { init() { return 1; } }");
        assert!(err.contains("Can't return a value from an initializer."));
        let err = compile_error("print this;");
        assert!(err.contains("Can't use 'this' outside of a class."));
        let err = compile_error("print super.x;");
        assert!(err.contains("Can't use 'super' outside of a class."));
        let err = compile_error("class A { f() { super.f(); } }");
        assert!(err.contains("Can't use 'super' in a class with no superclass."));
    }

    #[test]
    fn test_continue_requires_a_loop() {
        let err = compile_error("continue;");
        assert!(err.contains("Cannot 'continue' outside of a loop."));
        let err = compile_error("while(nil)0;continue;");
        assert!(err.contains("Cannot 'continue' outside of a loop."));
    }

    #[test]
    fn test_too_many_constants_in_one_chunk() {
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("var v{} = {}.5;", i, i));
        }
        let err = compile_error(&source);
        assert!(err.contains("Too many constants in one chunk."));
    }

    #[test]
    fn test_closure_upvalue_metadata() {
        let (function, err, gc) = try_compile(
            "fun outer() { var a = 1; fun inner() { a = a + 1; return a; } return inner; }",
        );
        let function = function.unwrap_or_else(|| panic!("compile failed: {err}"));
        // Find the inner function among the outer function's constants and
        // check it captured exactly one upvalue.
        let script = gc.heap().function(function);
        let outer = script
            .chunk
            .constants
            .iter()
            .filter_map(|v| v.as_obj())
            .find_map(|h| match gc.heap().get(h) {
                Obj::Function(f) if f.name.is_some() => Some(f),
                _ => None,
            })
            .expect("outer function constant");
        let inner = outer
            .chunk
            .constants
            .iter()
            .filter_map(|v| v.as_obj())
            .find_map(|h| match gc.heap().get(h) {
                Obj::Function(f) if f.upvalue_count > 0 => Some(f),
                _ => None,
            })
            .expect("inner function constant");
        assert_eq!(inner.upvalue_count, 1);
    }

    #[test]
    fn test_switch_case_after_default_is_rejected() {
        let err = compile_error("switch(0){default:case 0:}");
        assert!(err.contains("Expect expression."));
    }

    #[test]
    fn test_compile_is_repeatable() {
        let source = "var x = 1; { var y = x; print y; } fun f(n) { return n; } print f(x);";
        let a = script_code(source);
        let b = script_code(source);
        assert_eq!(a, b);
    }
}
