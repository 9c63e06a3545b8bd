//! Single-pass Pratt compiler.
//!
//! The compiler consumes tokens straight from the scanner and emits bytecode
//! into the chunk of the function currently being compiled; there is no AST.
//! Nested function declarations push a fresh [`FunctionCompiler`] onto an
//! enclosing-chain, so locals, upvalues, and scope depth always describe the
//! innermost function. Class bodies push a parallel class context used to
//! validate `this` and `super`.
//!
//! Assignment is only legal while parsing at assignment precedence or lower,
//! so the driver threads a `can_assign` flag into every prefix and infix
//! rule; a dangling `=` afterwards is an "Invalid assignment target." error.
//!
//! Errors set `had_error` and enter panic mode, which suppresses cascading
//! reports until `synchronize` reaches a statement boundary. On any error the
//! compiler still runs to end of input (to report as much as it can) and then
//! returns the collected diagnostics instead of a function.

use ahash::AHashMap;
use strum::FromRepr;

use crate::{
    bytecode::{chunk::Chunk, debug, op::Opcode},
    error::{CompileError, ErrorLocation},
    heap::{Function, Heap, HeapData, HeapId, Marker},
    intern::Interner,
    scanner::{Scanner, Token, TokenKind},
    value::Value,
};

/// Binding strength, weakest first. The discriminant order drives the Pratt
/// loop's `>=` comparison; `one_higher` implements left associativity.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromRepr)]
enum Precedence {
    None,
    Assignment, // =
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
    fn one_higher(self) -> Self {
        Self::from_repr(self as u8 + 1).unwrap_or(Self::Primary)
    }
}

/// What kind of function body is being compiled; drives the implicit return
/// and the meaning of stack slot zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// One local variable, indexed by its stack slot.
///
/// `depth` is `None` between declaration and the end of the initializer;
/// reading the variable in that window is an error. `is_captured` marks
/// locals that some closure captured, so scope exit closes the upvalue
/// instead of popping.
#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    depth: Option<u32>,
    is_captured: bool,
}

/// Compile-time upvalue descriptor: which slot to capture and whether it is
/// a local of the enclosing function or one of its upvalues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
/// Array/map literal entry cap; the build opcodes carry the count in one byte.
const MAX_LITERAL_ENTRIES: u32 = 255;

/// Per-function compilation state, chained through `enclosing`.
#[derive(Debug)]
struct FunctionCompiler<'src> {
    enclosing: Option<Box<FunctionCompiler<'src>>>,
    kind: FunctionKind,
    name: Option<HeapId>,
    arity: u8,
    upvalue_count: usize,
    chunk: Chunk,
    /// Interned-string constants already in this chunk's pool, so repeated
    /// identifiers share one slot.
    constant_cache: AHashMap<HeapId, u8>,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: u32,
}

impl<'src> FunctionCompiler<'src> {
    fn new(kind: FunctionKind, name: Option<HeapId>, enclosing: Option<Box<Self>>) -> Self {
        // Slot zero is reserved: it holds the callee for ordinary calls and
        // the receiver for methods, where it is addressable as `this`.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this"
            } else {
                ""
            },
            depth: Some(0),
            is_captured: false,
        };
        Self {
            enclosing,
            kind,
            name,
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            constant_cache: AHashMap::new(),
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Compile-time knowledge about the nearest enclosing class declaration.
#[derive(Debug)]
struct ClassContext {
    has_superclass: bool,
}

struct Compiler<'src, 'ctx> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    heap: &'ctx mut Heap,
    strings: &'ctx mut Interner,
    func: Box<FunctionCompiler<'src>>,
    classes: Vec<ClassContext>,
    print_code: bool,
    /// Marks the host's long-lived roots (globals, cached strings) when a
    /// collection runs mid-compile; without it, a compile-time GC would
    /// sweep objects only the VM can reach.
    host_roots: &'ctx dyn Fn(&mut Marker<'_>),
}

/// Compiles `source` into a top-level function, or returns the collected
/// diagnostics if anything failed to parse.
///
/// `host_roots` is invoked at every compile-time GC safe point, after the
/// compiler's own roots are marked.
pub(crate) fn compile(
    source: &str,
    heap: &mut Heap,
    strings: &mut Interner,
    print_code: bool,
    host_roots: &dyn Fn(&mut Marker<'_>),
) -> Result<HeapId, Vec<CompileError>> {
    let placeholder = Token {
        kind: TokenKind::Eof,
        lexeme: "",
        line: 1,
    };
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        current: placeholder,
        previous: placeholder,
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        heap: &mut *heap,
        strings: &mut *strings,
        func: Box::new(FunctionCompiler::new(FunctionKind::Script, None, None)),
        classes: Vec::new(),
        print_code,
        host_roots,
    };

    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.emit_return();

    if compiler.had_error {
        return Err(compiler.errors);
    }
    let finished = *compiler.func;
    if print_code {
        eprint!("{}", debug::disassemble_chunk(&finished.chunk, "<script>", heap));
    }
    Ok(heap.alloc(HeapData::Function(Function {
        arity: 0,
        upvalue_count: finished.upvalue_count,
        name: None,
        chunk: finished.chunk,
    })))
}

impl<'src> Compiler<'src, '_> {
    // === Token plumbing ===

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            match self.current.kind {
                TokenKind::Error(message) => self.error_at_current(message),
                _ => break,
            }
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
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

    // === Error reporting ===

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        // One report per panic; synchronize() clears the flag.
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let location = match token.kind {
            TokenKind::Eof => ErrorLocation::Eof,
            TokenKind::Error(_) => ErrorLocation::Unknown,
            _ => ErrorLocation::Lexeme(token.lexeme.to_string()),
        };
        self.errors.push(CompileError {
            line: token.line,
            location,
            message: message.to_string(),
        });
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    /// Skips tokens until a statement boundary, then resumes reporting.
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
                _ => {}
            }
            self.advance();
        }
    }

    // === Bytecode emission ===

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.func.chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: Opcode) {
        self.emit_byte(op as u8);
    }

    fn emit_ops(&mut self, first: Opcode, second: Opcode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_op_byte(&mut self, op: Opcode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    /// Emits a jump with a two-byte placeholder, returning the placeholder's
    /// offset for [`Compiler::patch_jump`].
    fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.func.chunk.len() - 2
    }

    /// Back-patches a forward jump to land on the next instruction.
    fn patch_jump(&mut self, offset: usize) {
        // Distance from the byte after the operand to the current position.
        let jump = self.func.chunk.len() - offset - 2;
        if jump > usize::from(u16::MAX) {
            self.error("Too much code to jump over.");
        }
        let [high, low] = (jump as u16).to_be_bytes();
        self.func.chunk.patch(offset, high);
        self.func.chunk.patch(offset + 1, low);
    }

    /// Emits a backward jump to `loop_start`.
    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Opcode::Loop);
        let offset = self.func.chunk.len() - loop_start + 2;
        if offset > usize::from(u16::MAX) {
            self.error("Loop body too large.");
        }
        let [high, low] = (offset as u16).to_be_bytes();
        self.emit_byte(high);
        self.emit_byte(low);
    }

    fn emit_return(&mut self) {
        if self.func.kind == FunctionKind::Initializer {
            // An initializer always returns its instance, sitting in slot 0.
            self.emit_op_byte(Opcode::GetLocal, 0);
        } else {
            self.emit_op(Opcode::Nil);
        }
        self.emit_op(Opcode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        if let Value::Ref(id) = value
            && let Some(&index) = self.func.constant_cache.get(&id)
        {
            return index;
        }
        match self.func.chunk.add_constant(value) {
            Some(index) => {
                if let Value::Ref(id) = value {
                    self.func.constant_cache.insert(id, index);
                }
                index
            }
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_byte(Opcode::Constant, constant);
    }

    // === Heap interaction ===

    /// Interns `text`, running a collection first if one is due so the fresh
    /// string cannot be reclaimed before it is rooted in a constant pool.
    fn intern(&mut self, text: &str) -> HeapId {
        self.maybe_collect();
        self.strings.intern(self.heap, text)
    }

    /// GC safe point. Roots are every in-progress function compiler (its
    /// name and everything already placed in its constant pool) plus
    /// whatever long-lived roots the host registered.
    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let func = &*self.func;
        let host_roots = self.host_roots;
        self.heap.collect(self.strings, |marker| {
            let mut current = Some(func);
            while let Some(fc) = current {
                if let Some(name) = fc.name {
                    marker.mark(name);
                }
                for &constant in fc.chunk.constants() {
                    marker.mark_value(constant);
                }
                current = fc.enclosing.as_deref();
            }
            host_roots(marker);
        });
    }

    // === Function compiler stack ===

    fn push_compiler(&mut self, kind: FunctionKind, name: Option<HeapId>) {
        let enclosing = std::mem::replace(
            &mut self.func,
            Box::new(FunctionCompiler::new(kind, name, None)),
        );
        self.func.enclosing = Some(enclosing);
    }

    /// Finishes the innermost function: emits the implicit return, allocates
    /// the Function object, and restores the enclosing compiler. Returns the
    /// function and its upvalue descriptors for the `Closure` operand bytes.
    fn pop_compiler(&mut self) -> (HeapId, Vec<UpvalueRef>) {
        self.emit_return();
        // Collect while the finished chunk is still reachable as a root.
        self.maybe_collect();
        let enclosing = self
            .func
            .enclosing
            .take()
            .expect("pop_compiler requires an enclosing compiler");
        let finished = std::mem::replace(&mut self.func, enclosing);
        if self.print_code && !self.had_error {
            let name = finished
                .name
                .map_or_else(|| "<fn>".to_string(), |id| self.heap.str_text(id).to_string());
            eprint!("{}", debug::disassemble_chunk(&finished.chunk, &name, self.heap));
        }
        let id = self.heap.alloc(HeapData::Function(Function {
            arity: finished.arity,
            upvalue_count: finished.upvalue_count,
            name: finished.name,
            chunk: finished.chunk,
        }));
        (id, finished.upvalues)
    }

    // === Scopes and variables ===

    fn begin_scope(&mut self) {
        self.func.scope_depth += 1;
    }

    /// Leaves a block: departing locals are popped, captured ones are closed
    /// into their upvalues instead.
    fn end_scope(&mut self) {
        self.func.scope_depth -= 1;
        loop {
            let captured = match self.func.locals.last() {
                Some(local) if local.depth.is_some_and(|depth| depth > self.func.scope_depth) => {
                    local.is_captured
                }
                _ => break,
            };
            self.emit_op(if captured { Opcode::CloseUpvalue } else { Opcode::Pop });
            self.func.locals.pop();
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let id = self.intern(name);
        self.make_constant(Value::Ref(id))
    }

    fn add_local(&mut self, name: &'src str) {
        if self.func.locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.func.locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    /// Registers the just-parsed identifier as a local, rejecting a
    /// redeclaration within the same scope. Globals are late-bound and skip
    /// this entirely.
    fn declare_variable(&mut self) {
        if self.func.scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let mut redeclared = false;
        for local in self.func.locals.iter().rev() {
            if local.depth.is_some_and(|depth| depth < self.func.scope_depth) {
                break;
            }
            if local.name == name {
                redeclared = true;
                break;
            }
        }
        if redeclared {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.func.scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        // Top-level function declarations stay global; nothing to mark.
        if self.func.scope_depth == 0 {
            return;
        }
        let depth = self.func.scope_depth;
        if let Some(local) = self.func.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.func.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(Opcode::DefineGlobal, global);
    }

    /// Emits the load or store for a name, resolving local, then upvalue,
    /// then falling back to a global.
    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let resolved = match resolve_local(&self.func, name) {
            Err(message) => {
                self.error(message);
                Some((Opcode::GetLocal, Opcode::SetLocal, 0))
            }
            Ok(Some(slot)) => Some((Opcode::GetLocal, Opcode::SetLocal, slot)),
            Ok(None) => match resolve_upvalue(&mut self.func, name) {
                Err(message) => {
                    self.error(message);
                    Some((Opcode::GetUpvalue, Opcode::SetUpvalue, 0))
                }
                Ok(Some(index)) => Some((Opcode::GetUpvalue, Opcode::SetUpvalue, index)),
                Ok(None) => None,
            },
        };
        let (get_op, set_op, arg) = match resolved {
            Some(triple) => triple,
            None => {
                let constant = self.identifier_constant(name);
                (Opcode::GetGlobal, Opcode::SetGlobal, constant)
            }
        };
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    // === Pratt driver ===

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_rule(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }
        while precedence <= infix_precedence(self.current.kind) {
            self.advance();
            self.infix_rule(self.previous.kind, can_assign);
        }
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// Runs the prefix rule for `kind`; false if the token cannot start an
    /// expression.
    fn prefix_rule(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::LeftBrace => self.map_literal(),
            TokenKind::LeftBracket => self.array_literal(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::Str => self.string(),
            TokenKind::Number => self.number(),
            TokenKind::False | TokenKind::Nil | TokenKind::True => self.literal(),
            TokenKind::This => self.this(),
            TokenKind::Super => self.super_(),
            _ => return false,
        }
        true
    }

    fn infix_rule(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::LeftParen => self.call(),
            TokenKind::LeftBracket => self.index(can_assign),
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::And => self.and(),
            TokenKind::Or => self.or(),
            TokenKind::Minus
            | TokenKind::Plus
            | TokenKind::Slash
            | TokenKind::Star
            | TokenKind::Percent
            | TokenKind::BangEqual
            | TokenKind::EqualEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => self.binary(),
            _ => unreachable!("token admitted by infix_precedence has a rule"),
        }
    }

    // === Expression rules ===

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self) {
        let value: f64 = self
            .previous
            .lexeme
            .parse()
            .expect("scanner produced an unparsable number literal");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        let unescaped = unescape(&lexeme[1..lexeme.len() - 1]);
        let id = self.intern(&unescaped);
        self.emit_constant(Value::Ref(id));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(Opcode::False),
            TokenKind::Nil => self.emit_op(Opcode::Nil),
            TokenKind::True => self.emit_op(Opcode::True),
            _ => unreachable!("literal rule only fires for false/nil/true"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.lexeme, can_assign);
    }

    fn this(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        // `this` is an ordinary lexically scoped local living in slot 0;
        // assignment to it is never legal.
        self.named_variable("this", false);
    }

    fn super_(&mut self) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
            }
            Some(_) => {}
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            // Fused path: receiver and arguments are in place, the popped
            // superclass picks the method table.
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_op_byte(Opcode::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_op_byte(Opcode::GetSuper, name);
        }
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_op(Opcode::Not),
            TokenKind::Minus => self.emit_op(Opcode::Negate),
            _ => unreachable!("unary rule only fires for ! and -"),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(infix_precedence(operator).one_higher());
        match operator {
            TokenKind::BangEqual => self.emit_ops(Opcode::Equal, Opcode::Not),
            TokenKind::EqualEqual => self.emit_op(Opcode::Equal),
            TokenKind::Greater => self.emit_op(Opcode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(Opcode::Less, Opcode::Not),
            TokenKind::Less => self.emit_op(Opcode::Less),
            TokenKind::LessEqual => self.emit_ops(Opcode::Greater, Opcode::Not),
            TokenKind::Plus => self.emit_op(Opcode::Add),
            TokenKind::Minus => self.emit_op(Opcode::Subtract),
            TokenKind::Star => self.emit_op(Opcode::Multiply),
            TokenKind::Slash => self.emit_op(Opcode::Divide),
            TokenKind::Percent => self.emit_op(Opcode::Modulo),
            _ => unreachable!("binary rule only fires for binary operators"),
        }
    }

    fn and(&mut self) {
        // Left operand is on the stack; skip the right side when falsy.
        let end_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self) {
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        let end_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Opcode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_op_byte(Opcode::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
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
        count.min(255) as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(Opcode::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            // Fused property-load + call.
            let arg_count = self.argument_list();
            self.emit_op_byte(Opcode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op_byte(Opcode::GetProperty, name);
        }
    }

    fn index(&mut self, can_assign: bool) {
        self.parse_precedence(Precedence::Or);
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(Opcode::IndexSet);
        } else {
            self.emit_op(Opcode::IndexGet);
        }
    }

    fn array_literal(&mut self) {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                if self.check(TokenKind::RightBracket) {
                    break; // trailing comma
                }
                self.parse_precedence(Precedence::Or);
                if count == MAX_LITERAL_ENTRIES {
                    self.error("Can't have more than 255 elements in an array literal.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after array literal.");
        self.emit_op_byte(Opcode::ArrayBuild, count.min(255) as u8);
    }

    fn map_literal(&mut self) {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightBrace) {
            loop {
                if self.check(TokenKind::RightBrace) {
                    break; // trailing comma
                }
                self.consume(TokenKind::Str, "Expect string key in map literal.");
                self.string();
                self.consume(TokenKind::Colon, "Expect ':' between key and value.");
                self.parse_precedence(Precedence::Or);
                if count == MAX_LITERAL_ENTRIES {
                    self.error("Can't have more than 255 entries in a map literal.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after map literal.");
        self.emit_op_byte(Opcode::MapBuild, count.min(255) as u8);
    }

    // === Declarations and statements ===

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

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            // `var a;` declares to nil.
            self.emit_op(Opcode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Initialized eagerly so the function body can refer to itself.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    /// Compiles a function body into a fresh compiler, then emits the
    /// `Closure` instruction with one `{is_local, index}` pair per upvalue.
    fn function(&mut self, kind: FunctionKind) {
        let name = self.intern(self.previous.lexeme);
        self.push_compiler(kind, Some(name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.func.arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.func.arity += 1;
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

        // No end_scope(): the frame teardown discards everything at once.
        let (function, upvalues) = self.pop_compiler();
        let constant = self.make_constant(Value::Ref(function));
        self.emit_op_byte(Opcode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous.lexeme);
        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_op_byte(Opcode::Method, constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();

        self.emit_op_byte(Opcode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassContext { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }
            // The superclass lives in a synthetic scope as a local named
            // `super`, so super-calls in methods capture it like any other
            // variable.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);
            self.named_variable(class_name.lexeme, false);
            self.emit_op(Opcode::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        // Methods bind against the class value, so load it back on the stack
        // for the duration of the body.
        self.named_variable(class_name.lexeme, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(Opcode::Pop);

        if self.classes.last().is_some_and(|class| class.has_superclass) {
            self.end_scope();
        }
        self.classes.pop();
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
        let loop_start = self.func.chunk.len();
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

    /// `for` desugars into initializer, condition with exit jump, and an
    /// increment that runs after the body via a jump around it.
    fn for_statement(&mut self) {
        // The loop variable, if declared here, is scoped to the loop.
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.func.chunk.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
            self.emit_op(Opcode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Opcode::Jump);
            let increment_start = self.func.chunk.len();
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

    fn return_statement(&mut self) {
        if self.func.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.func.kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(Opcode::Return);
        }
    }
}

/// Infix binding strength per token; `None` for tokens with no infix rule.
fn infix_precedence(kind: TokenKind) -> Precedence {
    match kind {
        TokenKind::LeftParen | TokenKind::Dot | TokenKind::LeftBracket => Precedence::Call,
        TokenKind::Minus | TokenKind::Plus => Precedence::Term,
        TokenKind::Slash | TokenKind::Star | TokenKind::Percent => Precedence::Factor,
        TokenKind::BangEqual | TokenKind::EqualEqual => Precedence::Equality,
        TokenKind::Greater | TokenKind::GreaterEqual | TokenKind::Less | TokenKind::LessEqual => {
            Precedence::Comparison
        }
        TokenKind::And => Precedence::And,
        TokenKind::Or => Precedence::Or,
        _ => Precedence::None,
    }
}

/// Searches the function's locals innermost-first. `Err` reports a read of a
/// variable inside its own initializer.
fn resolve_local(fc: &FunctionCompiler<'_>, name: &str) -> Result<Option<u8>, &'static str> {
    for (slot, local) in fc.locals.iter().enumerate().rev() {
        if local.name == name {
            if local.depth.is_none() {
                return Err("Can't read local variable in its own initializer.");
            }
            return Ok(Some(slot as u8));
        }
    }
    Ok(None)
}

/// Resolves `name` against enclosing functions, materializing a chain of
/// upvalues from the innermost function out to the captured local.
fn resolve_upvalue(fc: &mut FunctionCompiler<'_>, name: &str) -> Result<Option<u8>, &'static str> {
    let captured = {
        let Some(enclosing) = fc.enclosing.as_deref_mut() else {
            return Ok(None);
        };
        if let Some(slot) = resolve_local(enclosing, name)? {
            enclosing.locals[slot as usize].is_captured = true;
            Some((slot, true))
        } else if let Some(index) = resolve_upvalue(enclosing, name)? {
            Some((index, false))
        } else {
            None
        }
    };
    match captured {
        Some((index, is_local)) => add_upvalue(fc, index, is_local).map(Some),
        None => Ok(None),
    }
}

/// Appends an upvalue descriptor, deduplicating on `{index, is_local}`.
fn add_upvalue(fc: &mut FunctionCompiler<'_>, index: u8, is_local: bool) -> Result<u8, &'static str> {
    let wanted = UpvalueRef { index, is_local };
    for (i, existing) in fc.upvalues.iter().enumerate() {
        if *existing == wanted {
            return Ok(i as u8);
        }
    }
    if fc.upvalues.len() == MAX_UPVALUES {
        return Err("Too many closure variables in function.");
    }
    fc.upvalues.push(wanted);
    fc.upvalue_count = fc.upvalues.len();
    Ok((fc.upvalues.len() - 1) as u8)
}

/// Decodes the escape sequences a string literal supports: `\\`, `\'`,
/// `\"`, `\n`, `\t`. A backslash before a real newline elides both, letting
/// a literal continue on the next line; unknown escapes are dropped.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\n') => {}
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(_) => {}
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_source(source: &str) -> Result<(Heap, HeapId), Vec<CompileError>> {
        let mut heap = Heap::new(false, false);
        let mut strings = Interner::new();
        let script = compile(source, &mut heap, &mut strings, false, &|_| {})?;
        Ok((heap, script))
    }

    fn code_of(heap: &Heap, id: HeapId) -> &[u8] {
        heap.function(id).chunk.code()
    }

    #[test]
    fn arithmetic_expression_bytecode() {
        let (heap, script) = compile_source("1 + 2;").expect("compiles");
        assert_eq!(
            code_of(&heap, script),
            &[
                Opcode::Constant as u8,
                0,
                Opcode::Constant as u8,
                1,
                Opcode::Add as u8,
                Opcode::Pop as u8,
                Opcode::Nil as u8,
                Opcode::Return as u8,
            ]
        );
        let chunk = &heap.function(script).chunk;
        assert_eq!(chunk.constant(0), Value::Number(1.0));
        assert_eq!(chunk.constant(1), Value::Number(2.0));
    }

    #[test]
    fn precedence_orders_multiplication_first() {
        let (heap, script) = compile_source("print 1 + 2 * 3;").expect("compiles");
        assert_eq!(
            code_of(&heap, script),
            &[
                Opcode::Constant as u8,
                0,
                Opcode::Constant as u8,
                1,
                Opcode::Constant as u8,
                2,
                Opcode::Multiply as u8,
                Opcode::Add as u8,
                Opcode::Print as u8,
                Opcode::Nil as u8,
                Opcode::Return as u8,
            ]
        );
    }

    #[test]
    fn if_jump_is_patched_big_endian() {
        let (heap, script) = compile_source("if (true) print 1;").expect("compiles");
        let code = code_of(&heap, script);
        assert_eq!(code[0], Opcode::True as u8);
        assert_eq!(code[1], Opcode::JumpIfFalse as u8);
        // Skips Pop + Constant(2 bytes) + Print = 4, plus the 3-byte Jump.
        assert_eq!(u16::from_be_bytes([code[2], code[3]]), 7);
    }

    #[test]
    fn identifier_constants_are_deduplicated() {
        let (heap, script) = compile_source("var a = 1; a; a; a;").expect("compiles");
        // One name constant plus one number, despite three reads of `a`.
        assert_eq!(heap.function(script).chunk.constants().len(), 2);
    }

    #[test]
    fn string_escapes_decode() {
        assert_eq!(unescape(r"a\nb"), "a\nb");
        assert_eq!(unescape(r"a\tb"), "a\tb");
        assert_eq!(unescape(r#"say \"hi\""#), "say \"hi\"");
        assert_eq!(unescape(r"back\\slash"), "back\\slash");
        assert_eq!(unescape("line\\\ncontinued"), "linecontinued");
        assert_eq!(unescape(r"drop\q"), "drop");
    }

    #[test]
    fn closure_captures_emit_upvalue_operands() {
        let (heap, script) =
            compile_source("fun outer(x) { fun inner() { return x; } return inner; }").expect("compiles");
        // Find the inner function among the outer function's constants.
        let outer = heap
            .function(script)
            .chunk
            .constants()
            .iter()
            .find_map(|&v| match v {
                Value::Ref(id) => matches!(heap.get(id), HeapData::Function(_)).then_some(id),
                _ => None,
            })
            .expect("outer function constant");
        let inner = heap
            .function(outer)
            .chunk
            .constants()
            .iter()
            .find_map(|&v| match v {
                Value::Ref(id) => matches!(heap.get(id), HeapData::Function(_)).then_some(id),
                _ => None,
            })
            .expect("inner function constant");
        assert_eq!(heap.function(inner).upvalue_count, 1);
        assert_eq!(heap.function(outer).arity, 1);
    }

    fn first_error(source: &str) -> CompileError {
        let errors = compile_source(source).expect_err("should not compile");
        errors.into_iter().next().expect("at least one error")
    }

    #[test]
    fn missing_expression_reports() {
        assert_eq!(first_error("1 + ;").message, "Expect expression.");
    }

    #[test]
    fn invalid_assignment_target_reports() {
        assert_eq!(first_error("1 = 2;").message, "Invalid assignment target.");
        assert_eq!(first_error("a * b = 3;").message, "Invalid assignment target.");
    }

    #[test]
    fn redeclaration_in_same_scope_reports() {
        assert_eq!(
            first_error("{ var a = 1; var a = 2; }").message,
            "Already a variable with this name in this scope."
        );
    }

    #[test]
    fn reading_local_in_own_initializer_reports() {
        assert_eq!(
            first_error("{ var a = a; }").message,
            "Can't read local variable in its own initializer."
        );
    }

    #[test]
    fn return_outside_function_reports() {
        assert_eq!(first_error("return 1;").message, "Can't return from top-level code.");
    }

    #[test]
    fn this_outside_class_reports() {
        assert_eq!(first_error("print this;").message, "Can't use 'this' outside of a class.");
    }

    #[test]
    fn super_without_superclass_reports() {
        assert_eq!(
            first_error("class A { m() { return super.m(); } }").message,
            "Can't use 'super' in a class with no superclass."
        );
    }

    #[test]
    fn class_cannot_inherit_from_itself() {
        assert_eq!(
            first_error("class A < A {}").message,
            "A class can't inherit from itself."
        );
    }

    #[test]
    fn initializer_cannot_return_a_value() {
        assert_eq!(
            first_error("class A { init() { return 1; } }").message,
            "Can't return a value from an initializer."
        );
    }

    #[test]
    fn local_limit_reports() {
        // Slot zero is reserved, so the 256th declaration overflows.
        let mut source = String::from("{\n");
        for i in 0..256 {
            source.push_str(&format!("var l{i} = {i};\n"));
        }
        source.push('}');
        assert_eq!(
            first_error(&source).message,
            "Too many local variables in function."
        );
    }

    #[test]
    fn constant_pool_overflow_reports() {
        let mut source = String::from("print 0");
        for i in 1..=256 {
            source.push_str(&format!(" + {i}"));
        }
        source.push(';');
        assert_eq!(first_error(&source).message, "Too many constants in one chunk.");
    }

    #[test]
    fn panic_mode_reports_once_per_statement() {
        let errors = compile_source("var 1 = 2; print 3;").expect_err("should not compile");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Expect variable name.");
    }

    #[test]
    fn error_location_renders_lexeme() {
        let error = first_error("1 = 2;");
        assert_eq!(error.to_string(), "[line 1] Error at '=': Invalid assignment target.");
    }
}
