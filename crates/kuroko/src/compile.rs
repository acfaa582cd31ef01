//! Single-pass Pratt compiler: tokens in, bytecode out.
//!
//! The compiler maintains a stack of function records and a stack of
//! enclosing class records. Expressions are parsed by precedence climbing
//! over a rule table; assignment targets re-parse with a `can_assign` flag
//! and match the assignment operator post-hoc.
//!
//! Comprehensions and the `x if c else y` ternary are compiled by
//! *rewinding*: the head expression is parsed speculatively, and when a
//! `for` (or `if`) follows, the emitted bytecode is rolled back and the head
//! is re-parsed later from a saved scanner state, inside the scope that
//! defines its loop variables (or after the condition, for ternaries).

use crate::{
    chunk::{Chunk, ChunkMark, JumpLabel},
    heap::{Heap, HeapData, HeapId},
    object::{Bytes, Function, FunctionFlags, LocalDebug},
    op::Opcode,
    scan::{Scanner, Token, TokenKind},
    value::{Value, kwargs},
};

/// A compile-time failure, surfaced to embedders as a `SyntaxError`.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
    pub col: u32,
    pub width: u32,
}

type CResult<T = ()> = Result<T, ()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Ternary,
    Or,
    And,
    Comparison,
    BitOr,
    BitXor,
    BitAnd,
    Shift,
    Term,
    Factor,
    Unary,
    Exponent,
    Call,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Ternary,
            Self::Ternary => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Comparison,
            Self::Comparison => Self::BitOr,
            Self::BitOr => Self::BitXor,
            Self::BitXor => Self::BitAnd,
            Self::BitAnd => Self::Shift,
            Self::Shift => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Exponent,
            Self::Exponent | Self::Call => Self::Call,
        }
    }
}

type ParseFn = fn(&mut Compiler<'_, '_>, bool) -> CResult;

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

/// What a stack-resident local slot holds, so scope exits and
/// break/continue emit the right cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalKind {
    Normal,
    WithManager,
    WithHandler,
    TryHandler,
}

#[derive(Debug)]
struct Local {
    name: String,
    depth: i32,
    captured: bool,
    kind: LocalKind,
    birth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueRef {
    index: usize,
    is_local: bool,
}

#[derive(Debug)]
struct LoopCtx {
    /// Backward-jump target for `continue` (loop start, or the step clause
    /// of a C-style `for`).
    continue_target: usize,
    /// Local count at loop entry; break/continue clean up slots above this.
    locals_floor: usize,
    breaks: Vec<JumpLabel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FuncKind {
    Module,
    Function,
    Method,
    Init,
    Lambda,
    Comprehension,
    ClassBody,
}

/// Saved parser position (scanner plus the two-token window) for rewinds.
#[derive(Debug, Clone, Copy)]
struct ParserState {
    scan: crate::scan::ScannerState,
    previous: Token,
    current: Token,
}

struct FuncCtx {
    function: Function,
    kind: FuncKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
    /// Keyword parameters whose default expressions are compiled into the
    /// prologue once the whole parameter list is known.
    pending_defaults: Vec<(String, ParserState)>,
    /// Set once the body has emitted a statement (docstring detection).
    has_statement: bool,
}

impl FuncCtx {
    fn new(name: HeapId, filename: &str, kind: FuncKind) -> Self {
        let function = Function {
            name,
            chunk: Chunk::new(filename),
            required_args: Vec::new(),
            keyword_args: Vec::new(),
            flags: FunctionFlags {
                is_init: kind == FuncKind::Init,
                ..FunctionFlags::default()
            },
            upvalue_count: 0,
            docstring: Value::None,
            locals_debug: Vec::new(),
        };
        Self {
            function,
            kind,
            // Slot 0 holds the callee itself.
            locals: vec![Local {
                name: String::new(),
                depth: 0,
                captured: false,
                kind: LocalKind::Normal,
                birth: 0,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            pending_defaults: Vec::new(),
            has_statement: false,
        }
    }
}

struct ClassCtx {
    /// Local slot of the hidden class variable inside the synthetic body
    /// function.
    class_slot: usize,
}

/// Kinds of bracketed comprehension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompKind {
    List,
    Set,
    Dict,
    Generator,
}

enum DecodedLiteral {
    Text(String),
    Bytes(Vec<u8>),
}

/// The compiler. Produces a heap-allocated [`Function`] for a whole module.
pub struct Compiler<'src, 'heap> {
    scanner: Scanner<'src>,
    heap: &'heap mut Heap,
    filename: String,
    previous: Token,
    current: Token,
    funcs: Vec<FuncCtx>,
    classes: Vec<ClassCtx>,
    /// Start (chunk mark + parser state) of each in-flight
    /// `parse_precedence` level, innermost last; ternary rewind uses the
    /// top entry.
    expr_starts: Vec<(ChunkMark, ParserState)>,
    error: Option<CompileError>,
    panic_mode: bool,
}

impl<'src, 'heap> Compiler<'src, 'heap> {
    /// Compiles `source` into a module-body function.
    ///
    /// The heap's collector is paused for the duration: chunk constants are
    /// not reachable from any root until the finished function is handed to
    /// the VM.
    pub fn compile(heap: &'heap mut Heap, source: &'src str, filename: &str) -> Result<HeapId, CompileError> {
        let was_paused = heap.gc_paused;
        heap.gc_paused = true;
        let name = heap.intern_string("<module>");
        let mut compiler = Compiler {
            scanner: Scanner::new(source),
            heap,
            filename: filename.to_owned(),
            previous: Token::placeholder(),
            current: Token::placeholder(),
            funcs: vec![FuncCtx::new(name, filename, FuncKind::Module)],
            classes: Vec::new(),
            expr_starts: Vec::new(),
            error: None,
            panic_mode: false,
        };
        let result = compiler.run_module();
        let error = compiler.error.take();
        compiler.heap.gc_paused = was_paused;
        match (result, error) {
            (Ok(func), None) => Ok(func),
            (_, Some(err)) => Err(err),
            (Err(()), None) => Err(CompileError {
                message: "compilation failed".to_owned(),
                line: 0,
                col: 0,
                width: 0,
            }),
        }
    }

    fn run_module(&mut self) -> CResult<HeapId> {
        self.advance()?;
        while !self.check(TokenKind::Eof) {
            let before = (self.current.start, self.current.kind);
            if self.declaration_line(0).is_err() {
                // Abandon any half-built nested contexts and resynchronize.
                self.funcs.truncate(1);
                self.classes.clear();
                self.synchronize();
                if (self.current.start, self.current.kind) == before {
                    // Ensure forward progress even when the boundary token
                    // itself is the problem.
                    self.previous = self.current;
                    self.current = self.scanner.next_token();
                }
            }
        }
        if self.error.is_some() {
            return Err(());
        }
        let ctx = self.end_function();
        Ok(self.heap.allocate(HeapData::Function(ctx.function)))
    }

    // ---- token plumbing ----

    fn advance(&mut self) -> CResult {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                return Ok(());
            }
            let message = self.current.error.unwrap_or("scan error");
            let token = self.current;
            self.error_at(token, message)?;
        }
    }

    /// Pushes the current token back and restores the previous one as
    /// current; used when `else`/`elif`/`except` lookahead fails.
    fn retreat(&mut self) {
        self.scanner.unget(self.current);
        self.current = self.previous;
        self.previous = Token::placeholder();
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> CResult<bool> {
        if self.check(kind) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> CResult {
        if self.check(kind) {
            self.advance()
        } else {
            let token = self.current;
            self.error_at(token, message)
        }
    }

    fn error_at(&mut self, token: Token, message: &str) -> CResult {
        if !self.panic_mode {
            self.panic_mode = true;
            if self.error.is_none() {
                self.error = Some(CompileError {
                    message: message.to_owned(),
                    line: token.line,
                    col: token.col,
                    width: token.width.max(1),
                });
            }
        }
        Err(())
    }

    /// Skips tokens until a statement boundary so one mistake does not
    /// cascade into spurious diagnostics.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous.kind == TokenKind::Eol {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Def
                | TokenKind::Let
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return
                | TokenKind::Import
                | TokenKind::Try
                | TokenKind::With => return,
                _ => {}
            }
            self.previous = self.current;
            self.current = self.scanner.next_token();
            if self.current.kind == TokenKind::Error {
                self.current.kind = TokenKind::Eol;
            }
        }
    }

    fn parser_state(&self) -> ParserState {
        ParserState {
            scan: self.scanner.state(),
            previous: self.previous,
            current: self.current,
        }
    }

    fn restore_parser(&mut self, state: ParserState) {
        self.scanner.restore(state.scan);
        self.previous = state.previous;
        self.current = state.current;
    }

    // ---- emission helpers ----

    fn ctx(&mut self) -> &mut FuncCtx {
        self.funcs.last_mut().expect("function context stack is never empty")
    }

    fn ctx_ref(&self) -> &FuncCtx {
        self.funcs.last().expect("function context stack is never empty")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.ctx().function.chunk
    }

    fn emit(&mut self, op: Opcode) {
        let line = self.previous.line;
        self.chunk().emit(op, line);
    }

    fn emit_byte_op(&mut self, op: Opcode, operand: u8) {
        let line = self.previous.line;
        self.chunk().emit_byte(op, operand, line);
    }

    fn emit_operand(&mut self, op: Opcode, index: usize) {
        let line = self.previous.line;
        self.chunk().emit_operand(op, index, line);
    }

    fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        let line = self.previous.line;
        self.chunk().emit_jump(op, line)
    }

    fn patch_jump(&mut self, label: JumpLabel) {
        self.chunk().patch_jump(label);
    }

    fn emit_loop(&mut self, target: usize) {
        let line = self.previous.line;
        self.chunk().emit_loop(target, line);
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.chunk().add_constant(value);
        self.emit_operand(Opcode::Constant, index);
    }

    fn name_constant(&mut self, name: &str) -> usize {
        let id = self.heap.intern_string(name);
        self.chunk().add_constant(Value::Ref(id))
    }

    fn emit_string(&mut self, text: &str) {
        let id = self.heap.intern_string(text);
        self.emit_constant(Value::Ref(id));
    }

    fn code_len(&self) -> usize {
        self.ctx_ref().function.chunk.len()
    }

    // ---- scopes and locals ----

    fn begin_scope(&mut self) {
        self.ctx().scope_depth += 1;
    }

    /// Closes the current scope, emitting the cleanup each slot kind
    /// needs: plain pop, upvalue close, or `with` cleanup.
    fn end_scope(&mut self) {
        let depth = self.ctx().scope_depth;
        self.ctx().scope_depth -= 1;
        let code_len = u32::try_from(self.code_len()).unwrap_or(u32::MAX);
        while self.ctx_ref().locals.last().is_some_and(|l| l.depth >= depth) {
            let slot = self.ctx_ref().locals.len() - 1;
            let local = self.ctx().locals.pop().expect("checked above");
            if !local.name.is_empty() && !local.name.starts_with(' ') {
                let name = self.heap.intern_string(&local.name);
                self.ctx().function.locals_debug.push(LocalDebug {
                    slot: u32::try_from(slot).unwrap_or(u32::MAX),
                    name,
                    birth: local.birth,
                    death: code_len,
                });
            }
            match local.kind {
                LocalKind::WithHandler => {
                    let manager = self.ctx().locals.pop();
                    debug_assert!(matches!(manager.map(|l| l.kind), Some(LocalKind::WithManager)));
                    self.emit(Opcode::CleanupWith);
                }
                LocalKind::WithManager => {
                    debug_assert!(false, "with manager must be popped with its handler");
                }
                LocalKind::TryHandler | LocalKind::Normal => {
                    if local.captured {
                        self.emit(Opcode::CloseUpvalue);
                    } else {
                        self.emit(Opcode::Pop);
                    }
                }
            }
        }
    }

    /// Emits the stack cleanup for leaving slots above `floor` without
    /// forgetting the compile-time records (break/continue paths).
    fn emit_cleanup_to(&mut self, floor: usize) {
        let mut idx = self.ctx_ref().locals.len();
        while idx > floor {
            idx -= 1;
            let kind = self.ctx_ref().locals[idx].kind;
            let captured = self.ctx_ref().locals[idx].captured;
            match kind {
                LocalKind::WithHandler => {
                    self.emit(Opcode::CleanupWith);
                    // Skip the manager beneath; CleanupWith popped both.
                    idx -= 1;
                }
                LocalKind::WithManager => {
                    debug_assert!(false, "with manager encountered without its handler");
                }
                LocalKind::TryHandler => self.emit(Opcode::Pop),
                LocalKind::Normal => {
                    if captured {
                        self.emit(Opcode::CloseUpvalue);
                    } else {
                        self.emit(Opcode::Pop);
                    }
                }
            }
        }
    }

    fn add_local(&mut self, name: &str, kind: LocalKind) -> CResult<usize> {
        if self.ctx_ref().locals.len() >= (1 << 24) {
            let token = self.previous;
            return self.error_at(token, "too many local variables").map(|()| 0);
        }
        let depth = self.ctx().scope_depth;
        let birth = u32::try_from(self.code_len()).unwrap_or(u32::MAX);
        self.ctx().locals.push(Local {
            name: name.to_owned(),
            depth,
            captured: false,
            kind,
            birth,
        });
        Ok(self.ctx_ref().locals.len() - 1)
    }

    /// Declares a named local in the current scope; shadowing within a
    /// single scope is an error.
    fn declare_local(&mut self, name: &str) -> CResult<usize> {
        let depth = self.ctx().scope_depth;
        let shadowed = self
            .ctx_ref()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth >= depth)
            .any(|l| l.name == name);
        if shadowed {
            let token = self.previous;
            return self
                .error_at(token, "duplicate declaration in the same scope")
                .map(|()| 0);
        }
        self.add_local(name, LocalKind::Normal)
    }

    fn resolve_local(&self, func: usize, name: &str) -> Option<usize> {
        self.funcs[func].locals.iter().rposition(|local| local.name == name)
    }

    fn add_upvalue(&mut self, func: usize, index: usize, is_local: bool) -> usize {
        let candidate = UpvalueRef { index, is_local };
        if let Some(existing) = self.funcs[func].upvalues.iter().position(|&u| u == candidate) {
            return existing;
        }
        self.funcs[func].upvalues.push(candidate);
        self.funcs[func].function.upvalue_count = self.funcs[func].upvalues.len();
        self.funcs[func].upvalues.len() - 1
    }

    /// Resolves `name` in enclosing functions, threading an upvalue chain
    /// down to `func`.
    fn resolve_upvalue(&mut self, func: usize, name: &str) -> Option<usize> {
        if func == 0 {
            return None;
        }
        let parent = func - 1;
        if let Some(local) = self.resolve_local(parent, name) {
            self.funcs[parent].locals[local].captured = true;
            return Some(self.add_upvalue(func, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(parent, name) {
            return Some(self.add_upvalue(func, upvalue, false));
        }
        None
    }

    // ---- statements ----

    /// Parses one logical line at the given indent: the `Indentation`
    /// token, one or more `;`-separated statements, and the terminator.
    fn declaration_line(&mut self, indent: usize) -> CResult {
        self.consume(TokenKind::Indentation, "expected the start of a statement")?;
        if self.previous.length != indent {
            let token = self.previous;
            return self.error_at(token, "unexpected indentation level");
        }
        loop {
            self.statement(indent)?;
            self.ctx().has_statement = true;
            if self.matches(TokenKind::Semicolon)? {
                if self.check(TokenKind::Eol) || self.check(TokenKind::Eof) {
                    break;
                }
                continue;
            }
            break;
        }
        if self.matches(TokenKind::Eol)?
            || self.check(TokenKind::Eof)
            || self.check(TokenKind::Indentation)
        {
            return Ok(());
        }
        let token = self.current;
        self.error_at(token, "expected end of line")
    }

    fn statement(&mut self, indent: usize) -> CResult {
        match self.current.kind {
            TokenKind::If => self.if_statement(indent),
            TokenKind::While => self.while_statement(indent),
            TokenKind::For => self.for_statement(indent),
            TokenKind::With => {
                self.advance()?;
                self.with_clause(indent)
            }
            TokenKind::Try => self.try_statement(indent),
            TokenKind::Def => self.def_statement(indent),
            TokenKind::Class => self.class_statement(indent),
            TokenKind::At => self.decorated_statement(indent),
            _ => self.simple_statement(),
        }
    }

    /// Statements allowed in an inline (single-line) suite.
    fn simple_statement(&mut self) -> CResult {
        match self.current.kind {
            TokenKind::Let => self.let_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::Raise => self.raise_statement(),
            TokenKind::Break => self.break_statement(),
            TokenKind::Continue => self.continue_statement(),
            TokenKind::Pass => {
                self.advance()?;
                Ok(())
            }
            TokenKind::Del => self.del_statement(),
            TokenKind::Import => self.import_statement(),
            TokenKind::From => self.from_statement(),
            _ => self.expression_statement(),
        }
    }

    /// `:` followed by either an inline simple statement or an indented
    /// block, in its own scope. Consumes the block's final `Eol` but not
    /// the following `Indentation`.
    fn suite(&mut self, indent: usize) -> CResult {
        self.consume(TokenKind::Colon, "expected ':'")?;
        if !self.check(TokenKind::Eol) {
            self.begin_scope();
            let result = self.simple_statement();
            if result.is_ok() {
                self.end_scope();
            }
            return result;
        }
        self.advance()?;
        if !self.check(TokenKind::Indentation) || self.current.length <= indent {
            let token = self.current;
            return self.error_at(token, "expected an indented block");
        }
        let block_indent = self.current.length;
        self.begin_scope();
        let result = (|| -> CResult {
            loop {
                self.declaration_line(block_indent)?;
                if self.check(TokenKind::Indentation) && self.current.length == block_indent {
                    continue;
                }
                return Ok(());
            }
        })();
        if result.is_ok() {
            self.end_scope();
        }
        result
    }

    /// Consumes a pending `Eol` then checks for `keyword` at `indent`,
    /// retreating if the lookahead fails. Returns whether the keyword was
    /// consumed.
    fn lookahead_keyword(&mut self, indent: usize, first: TokenKind, second: Option<TokenKind>) -> CResult<bool> {
        if self.check(TokenKind::Eol) {
            self.advance()?;
        }
        if !(self.check(TokenKind::Indentation) && self.current.length == indent) {
            return Ok(false);
        }
        self.advance()?;
        if self.check(first) || second.is_some_and(|k| self.check(k)) {
            self.advance()?;
            Ok(true)
        } else {
            self.retreat();
            Ok(false)
        }
    }

    fn if_statement(&mut self, indent: usize) -> CResult {
        self.advance()?; // if / elif
        self.expression()?;
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.suite(indent)?;
        let end_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(else_jump);
        self.emit(Opcode::Pop);

        if self.check(TokenKind::Eol) {
            self.advance()?;
        }
        if self.check(TokenKind::Indentation) && self.current.length == indent {
            self.advance()?;
            if self.check(TokenKind::Elif) {
                self.if_statement(indent)?;
            } else if self.check(TokenKind::Else) {
                self.advance()?;
                self.suite(indent)?;
            } else {
                self.retreat();
            }
        }
        self.patch_jump(end_jump);
        Ok(())
    }

    fn while_statement(&mut self, indent: usize) -> CResult {
        self.advance()?;
        let loop_start = self.code_len();
        self.expression()?;
        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        let floor = self.ctx_ref().locals.len();
        self.ctx().loops.push(LoopCtx {
            continue_target: loop_start,
            locals_floor: floor,
            breaks: Vec::new(),
        });
        self.suite(indent)?;
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit(Opcode::Pop);
        let ctx = self.ctx().loops.pop().expect("loop context pushed above");
        for label in ctx.breaks {
            self.patch_jump(label);
        }
        Ok(())
    }

    fn for_statement(&mut self, indent: usize) -> CResult {
        self.advance()?;
        // Disambiguate the C-style form (`for i = 0; cond; step:`).
        let state = self.parser_state();
        let mut c_style = false;
        if self.check(TokenKind::Identifier) {
            self.advance()?;
            c_style = self.check(TokenKind::Equal);
            self.restore_parser(state);
        }
        if c_style {
            self.c_for_statement(indent)
        } else {
            self.iter_for_statement(indent)
        }
    }

    fn iter_for_statement(&mut self, indent: usize) -> CResult {
        self.begin_scope();
        let mut targets: Vec<String> = Vec::new();
        loop {
            if !self.matches(TokenKind::Identifier)? && !self.matches(TokenKind::SelfKw)? {
                let token = self.current;
                return self.error_at(token, "expected a loop variable");
            }
            targets.push(self.previous.text(self.scanner.source()).to_owned());
            if !self.matches(TokenKind::Comma)? {
                break;
            }
        }
        self.consume(TokenKind::In, "expected 'in' after loop variables")?;
        self.expression()?;
        self.emit(Opcode::InvokeIter);
        let iter_slot = self.add_local(" iter", LocalKind::Normal)?;
        let floor = self.ctx_ref().locals.len();

        let loop_start = self.code_len();
        self.emit_operand(Opcode::GetLocal, iter_slot);
        self.emit_byte_op(Opcode::Call, 0);
        self.emit_byte_op(Opcode::Dup, 0);
        self.emit_operand(Opcode::GetLocal, iter_slot);
        self.emit(Opcode::Is);
        let exit_jump = self.emit_jump(Opcode::JumpIfTrue);
        self.emit(Opcode::Pop);

        self.begin_scope();
        if targets.len() == 1 {
            self.declare_local(&targets[0])?;
        } else {
            let Ok(n) = u8::try_from(targets.len()) else {
                let token = self.previous;
                return self.error_at(token, "too many loop targets");
            };
            self.emit_byte_op(Opcode::Unpack, n);
            for target in &targets {
                self.declare_local(target)?;
            }
        }
        self.ctx().loops.push(LoopCtx {
            continue_target: loop_start,
            locals_floor: floor,
            breaks: Vec::new(),
        });
        self.suite(indent)?;
        self.end_scope();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit(Opcode::Pop);
        self.emit(Opcode::Pop);
        let loop_ctx = self.ctx().loops.pop().expect("loop context pushed above");
        for label in loop_ctx.breaks {
            self.patch_jump(label);
        }
        self.end_scope();
        Ok(())
    }

    fn c_for_statement(&mut self, indent: usize) -> CResult {
        self.begin_scope();
        // Init: `name = expr` declares a fresh loop variable.
        self.consume(TokenKind::Identifier, "expected a loop variable")?;
        let name = self.previous.text(self.scanner.source()).to_owned();
        self.consume(TokenKind::Equal, "expected '=' in loop initializer")?;
        self.expression()?;
        self.declare_local(&name)?;
        self.consume(TokenKind::Semicolon, "expected ';' after loop initializer")?;
        let floor = self.ctx_ref().locals.len();

        let loop_start = self.code_len();
        self.expression()?;
        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        let body_jump = self.emit_jump(Opcode::Jump);
        self.consume(TokenKind::Semicolon, "expected ';' after loop condition")?;

        let step_start = self.code_len();
        self.expression()?;
        self.emit(Opcode::Pop);
        self.emit_loop(loop_start);

        self.patch_jump(body_jump);
        self.ctx().loops.push(LoopCtx {
            continue_target: step_start,
            locals_floor: floor,
            breaks: Vec::new(),
        });
        self.suite(indent)?;
        self.emit_loop(step_start);

        self.patch_jump(exit_jump);
        self.emit(Opcode::Pop);
        let loop_ctx = self.ctx().loops.pop().expect("loop context pushed above");
        for label in loop_ctx.breaks {
            self.patch_jump(label);
        }
        self.end_scope();
        Ok(())
    }

    /// One `with` clause; multiple clauses on one line nest recursively.
    fn with_clause(&mut self, indent: usize) -> CResult {
        self.begin_scope();
        self.expression()?;
        self.add_local(" with", LocalKind::WithManager)?;
        let with_jump = self.emit_jump(Opcode::PushWith);
        self.add_local(" handler", LocalKind::WithHandler)?;
        // PushWith invoked __enter__; its result is on top.
        if self.matches(TokenKind::As)? {
            self.consume(TokenKind::Identifier, "expected a name after 'as'")?;
            let name = self.previous.text(self.scanner.source()).to_owned();
            self.declare_local(&name)?;
        } else {
            self.emit(Opcode::Pop);
        }
        if self.matches(TokenKind::Comma)? {
            self.with_clause(indent)?;
        } else {
            self.suite(indent)?;
        }
        // end_scope emits CleanupWith for the manager/handler pair; a
        // suppressed exception resumes at the same continuation.
        self.end_scope();
        self.patch_jump(with_jump);
        Ok(())
    }

    fn try_statement(&mut self, indent: usize) -> CResult {
        self.advance()?;
        self.begin_scope();
        let try_jump = self.emit_jump(Opcode::PushTry);
        let exc_slot = self.add_local(" exc", LocalKind::TryHandler)?;
        self.suite(indent)?;
        self.emit(Opcode::PopTry);
        let mut end_jumps = vec![self.emit_jump(Opcode::Jump)];
        self.patch_jump(try_jump);

        let mut saw_except = false;
        while self.lookahead_keyword(indent, TokenKind::Except, None)? {
            saw_except = true;
            let mut filter_jump = None;
            if !self.check(TokenKind::Colon) {
                self.emit_operand(Opcode::GetLocal, exc_slot);
                self.expression()?;
                self.emit(Opcode::FilterExcept);
                filter_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
                self.emit(Opcode::Pop);
            }
            let saved_name = if self.matches(TokenKind::As)? {
                self.consume(TokenKind::Identifier, "expected a name after 'as'")?;
                let name = self.previous.text(self.scanner.source()).to_owned();
                let old = std::mem::replace(&mut self.ctx().locals[exc_slot].name, name);
                Some(old)
            } else {
                None
            };
            self.suite(indent)?;
            if let Some(old) = saved_name {
                self.ctx().locals[exc_slot].name = old;
            }
            end_jumps.push(self.emit_jump(Opcode::Jump));
            if let Some(label) = filter_jump {
                self.patch_jump(label);
                self.emit(Opcode::Pop);
            }
        }
        if !saw_except {
            let token = self.current;
            return self.error_at(token, "expected 'except' after 'try' block");
        }
        // No clause matched: re-raise.
        self.emit_operand(Opcode::GetLocal, exc_slot);
        self.emit(Opcode::Raise);
        for label in end_jumps {
            self.patch_jump(label);
        }
        self.end_scope();
        Ok(())
    }

    fn def_statement(&mut self, indent: usize) -> CResult {
        self.advance()?;
        self.consume(TokenKind::Identifier, "expected a function name")?;
        let name = self.previous.text(self.scanner.source()).to_owned();
        if self.ctx_ref().scope_depth > 0 {
            self.declare_local(&name)?;
            self.function(&name, FuncKind::Function, indent)?;
        } else {
            self.function(&name, FuncKind::Function, indent)?;
            let constant = self.name_constant(&name);
            self.emit_operand(Opcode::DefineGlobal, constant);
        }
        Ok(())
    }

    /// Compiles a `def`/`lambda` body into a fresh function context and
    /// emits the closure in the enclosing chunk.
    fn function(&mut self, name: &str, kind: FuncKind, indent: usize) -> CResult {
        let name_id = self.heap.intern_string(name);
        let filename = self.filename.clone();
        self.funcs.push(FuncCtx::new(name_id, &filename, kind));
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "expected '(' after function name")?;
        self.scanner.begin_eating_whitespace();
        let params = self.parameter_list(TokenKind::RightParen);
        self.scanner.end_eating_whitespace();
        params?;
        self.consume(TokenKind::RightParen, "expected ')' after parameters")?;
        self.compile_keyword_defaults()?;
        self.suite(indent)?;
        self.finish_function()
    }

    fn parameter_list(&mut self, terminator: TokenKind) -> CResult {
        let mut seen_default = false;
        loop {
            if self.check(terminator) {
                break;
            }
            if self.matches(TokenKind::Star)? {
                if self.ctx_ref().function.flags.collects_args {
                    let token = self.previous;
                    return self.error_at(token, "only one '*' collector is allowed");
                }
                self.consume(TokenKind::Identifier, "expected a parameter name after '*'")?;
                let name = self.previous.text(self.scanner.source()).to_owned();
                self.ctx().function.flags.collects_args = true;
                self.declare_local(&name)?;
            } else if self.matches(TokenKind::StarStar)? {
                if self.ctx_ref().function.flags.collects_kwargs {
                    let token = self.previous;
                    return self.error_at(token, "only one '**' collector is allowed");
                }
                self.consume(TokenKind::Identifier, "expected a parameter name after '**'")?;
                let name = self.previous.text(self.scanner.source()).to_owned();
                self.ctx().function.flags.collects_kwargs = true;
                self.declare_local(&name)?;
            } else {
                if !self.matches(TokenKind::Identifier)? && !self.matches(TokenKind::SelfKw)? {
                    let token = self.current;
                    return self.error_at(token, "expected a parameter name");
                }
                let name = self.previous.text(self.scanner.source()).to_owned();
                let name_id = self.heap.intern_string(&name);
                if self.check(TokenKind::Equal) {
                    self.advance()?;
                    seen_default = true;
                    let default_state = self.parser_state();
                    self.skip_default_expression()?;
                    self.ctx().function.keyword_args.push(name_id);
                    self.declare_local(&name)?;
                    self.ctx().pending_defaults.push((name, default_state));
                } else {
                    if seen_default {
                        let token = self.previous;
                        return self.error_at(token, "non-default parameter follows default parameter");
                    }
                    self.ctx().function.required_args.push(name_id);
                    self.declare_local(&name)?;
                }
            }
            if !self.matches(TokenKind::Comma)? {
                break;
            }
        }
        Ok(())
    }

    /// Parses past a default-value expression without keeping its code; the
    /// prologue re-parses it from the saved state.
    fn skip_default_expression(&mut self) -> CResult {
        let mark = self.chunk().mark();
        self.expression()?;
        self.chunk().rollback(mark);
        Ok(())
    }

    /// Emits the keyword-default prologue: each slot still holding the
    /// unset sentinel is filled by its default, evaluated left to right.
    fn compile_keyword_defaults(&mut self) -> CResult {
        let pending = std::mem::take(&mut self.ctx().pending_defaults);
        for (name, default_state) in pending {
            let top = self.funcs.len() - 1;
            let slot = self.resolve_local(top, &name).expect("keyword parameter was declared");
            self.emit_operand(Opcode::GetLocal, slot);
            self.emit_constant(Value::Kwargs(kwargs::UNSET));
            self.emit(Opcode::Is);
            let skip = self.emit_jump(Opcode::JumpIfFalse);
            self.emit(Opcode::Pop);
            let here = self.parser_state();
            self.restore_parser(default_state);
            self.expression()?;
            self.restore_parser(here);
            self.emit_operand(Opcode::SetLocal, slot);
            self.emit(Opcode::Pop);
            let done = self.emit_jump(Opcode::Jump);
            self.patch_jump(skip);
            self.emit(Opcode::Pop);
            self.patch_jump(done);
        }
        Ok(())
    }

    /// Ends the innermost function, allocates it, and emits the `Closure`
    /// instruction (plus upvalue descriptors) in the enclosing chunk.
    fn finish_function(&mut self) -> CResult {
        let ctx = self.end_function();
        let upvalues = ctx.upvalues;
        let function = ctx.function;
        let func_id = self.heap.allocate(HeapData::Function(function));
        let constant = self.chunk().add_constant(Value::Ref(func_id));
        self.emit_operand(Opcode::Closure, constant);
        let line = self.previous.line;
        for upvalue in upvalues {
            let chunk = self.chunk();
            if let Ok(narrow) = u8::try_from(upvalue.index) {
                chunk.push_raw(u8::from(upvalue.is_local), line);
                chunk.push_raw(narrow, line);
            } else {
                chunk.push_raw(0x80 | u8::from(upvalue.is_local), line);
                chunk.push_raw((upvalue.index >> 16) as u8, line);
                chunk.push_raw((upvalue.index >> 8) as u8, line);
                chunk.push_raw(upvalue.index as u8, line);
            }
        }
        Ok(())
    }

    /// Pops the innermost function context after emitting its implicit
    /// return.
    fn end_function(&mut self) -> FuncCtx {
        match self.ctx_ref().kind {
            FuncKind::Init => {
                let top = self.funcs.len() - 1;
                let slot = self.resolve_local(top, "self").unwrap_or(1);
                self.emit_operand(Opcode::GetLocal, slot);
            }
            FuncKind::ClassBody => {
                let slot = self.classes.last().map_or(1, |c| c.class_slot);
                self.emit_operand(Opcode::GetLocal, slot);
                self.emit(Opcode::Finalize);
            }
            _ => self.emit(Opcode::LoadNone),
        }
        self.emit(Opcode::Return);
        self.funcs.pop().expect("function context stack is never empty")
    }

    // ---- classes ----

    fn class_statement(&mut self, indent: usize) -> CResult {
        self.advance()?;
        self.consume(TokenKind::Identifier, "expected a class name")?;
        let name = self.previous.text(self.scanner.source()).to_owned();
        let is_local = self.ctx_ref().scope_depth > 0;
        if is_local {
            self.declare_local(&name)?;
        }

        let name_id = self.heap.intern_string(&name);
        let filename = self.filename.clone();
        self.funcs.push(FuncCtx::new(name_id, &filename, FuncKind::ClassBody));
        self.begin_scope();
        let name_const = self.chunk().add_constant(Value::Ref(name_id));
        self.emit_operand(Opcode::BuildClass, name_const);
        let class_slot = self.add_local(" class", LocalKind::Normal)?;
        self.classes.push(ClassCtx { class_slot });

        // The base class becomes the `super` local.
        if self.matches(TokenKind::LeftParen)? {
            if self.check(TokenKind::RightParen) {
                let object_const = self.name_constant("object");
                self.emit_operand(Opcode::GetGlobal, object_const);
            } else {
                self.expression()?;
            }
            self.consume(TokenKind::RightParen, "expected ')' after base class")?;
        } else {
            let object_const = self.name_constant("object");
            self.emit_operand(Opcode::GetGlobal, object_const);
        }
        self.add_local("super", LocalKind::Normal)?;
        self.emit(Opcode::Inherit);

        self.class_suite(indent)?;

        self.classes.pop();
        self.finish_function()?;
        self.emit_byte_op(Opcode::Call, 0);
        if !is_local {
            let constant = self.name_constant(&name);
            self.emit_operand(Opcode::DefineGlobal, constant);
        }
        Ok(())
    }

    fn class_suite(&mut self, indent: usize) -> CResult {
        self.consume(TokenKind::Colon, "expected ':' after class header")?;
        if !self.check(TokenKind::Eol) {
            // Inline class bodies support only `pass`.
            return self.consume(TokenKind::Pass, "expected 'pass' or an indented class body");
        }
        self.advance()?;
        if !self.check(TokenKind::Indentation) || self.current.length <= indent {
            let token = self.current;
            return self.error_at(token, "expected an indented class body");
        }
        let block_indent = self.current.length;
        let mut first = true;
        loop {
            self.consume(TokenKind::Indentation, "expected the start of a class member")?;
            self.class_member(block_indent, first)?;
            first = false;
            if !self.matches(TokenKind::Eol)? && !self.check(TokenKind::Eof) && !self.check(TokenKind::Indentation) {
                let token = self.current;
                return self.error_at(token, "expected end of line");
            }
            if self.check(TokenKind::Indentation) && self.current.length == block_indent {
                continue;
            }
            break;
        }
        Ok(())
    }

    fn class_member(&mut self, indent: usize, first: bool) -> CResult {
        match self.current.kind {
            TokenKind::Pass => self.advance(),
            TokenKind::String if first => {
                // Class docstring.
                self.advance()?;
                let class_slot = self.classes.last().expect("inside class body").class_slot;
                self.emit_operand(Opcode::GetLocal, class_slot);
                self.string(false)?;
                let constant = self.name_constant("__doc__");
                self.emit_operand(Opcode::ClassProperty, constant);
                Ok(())
            }
            TokenKind::Def => self.method_def(indent, &[]),
            TokenKind::At => {
                let mut decorators: Vec<ParserState> = Vec::new();
                let mut special: Option<MethodDecorator> = None;
                loop {
                    self.advance()?; // '@'
                    if self.check(TokenKind::Identifier) {
                        let text = self.current.text(self.scanner.source());
                        if text == "staticmethod" || text == "property" {
                            special = Some(if text == "property" {
                                MethodDecorator::Property
                            } else {
                                MethodDecorator::StaticMethod
                            });
                            self.advance()?;
                            self.consume(TokenKind::Eol, "expected end of line after decorator")?;
                            self.consume(TokenKind::Indentation, "expected decorated method")?;
                            if self.check(TokenKind::Def) {
                                break;
                            }
                            continue;
                        }
                    }
                    decorators.push(self.parser_state());
                    // Skip the decorator expression for now.
                    let mark = self.chunk().mark();
                    self.expression()?;
                    self.chunk().rollback(mark);
                    self.consume(TokenKind::Eol, "expected end of line after decorator")?;
                    self.consume(TokenKind::Indentation, "expected decorated method")?;
                    if self.check(TokenKind::Def) {
                        break;
                    }
                    if !self.check(TokenKind::At) {
                        let token = self.current;
                        return self.error_at(token, "expected a method after decorators");
                    }
                }
                match special {
                    Some(MethodDecorator::Property) => self.method_def_special(indent, Opcode::CreateProperty),
                    Some(MethodDecorator::StaticMethod) => self.method_def_special(indent, Opcode::ClassProperty),
                    None => self.method_def(indent, &decorators),
                }
            }
            TokenKind::Identifier => {
                // Class static: `name = expr`.
                self.advance()?;
                let name = self.previous.text(self.scanner.source()).to_owned();
                self.consume(TokenKind::Equal, "expected '=' in class attribute")?;
                let class_slot = self.classes.last().expect("inside class body").class_slot;
                self.emit_operand(Opcode::GetLocal, class_slot);
                self.expression()?;
                let constant = self.name_constant(&name);
                self.emit_operand(Opcode::ClassProperty, constant);
                Ok(())
            }
            _ => {
                let token = self.current;
                self.error_at(token, "expected a method, attribute, or 'pass' in class body")
            }
        }
    }

    fn method_def(&mut self, indent: usize, decorators: &[ParserState]) -> CResult {
        self.consume(TokenKind::Def, "expected 'def'")?;
        if !self.matches(TokenKind::Identifier)? {
            let token = self.current;
            return self.error_at(token, "expected a method name");
        }
        let name = self.previous.text(self.scanner.source()).to_owned();
        let class_slot = self.classes.last().expect("inside class body").class_slot;
        self.emit_operand(Opcode::GetLocal, class_slot);

        // Decorators are applied innermost-last: emit them first, then the
        // method, then one call per decorator.
        let here = self.parser_state();
        for state in decorators {
            self.restore_parser(*state);
            self.expression()?;
        }
        if !decorators.is_empty() {
            self.restore_parser(here);
        }

        let kind = if name == "__init__" { FuncKind::Init } else { FuncKind::Method };
        self.function(&name, kind, indent)?;
        for _ in decorators {
            self.emit_byte_op(Opcode::Call, 1);
        }
        let constant = self.name_constant(&name);
        self.emit_operand(Opcode::Method, constant);
        Ok(())
    }

    fn method_def_special(&mut self, indent: usize, op: Opcode) -> CResult {
        self.consume(TokenKind::Def, "expected 'def'")?;
        if !self.matches(TokenKind::Identifier)? {
            let token = self.current;
            return self.error_at(token, "expected a method name");
        }
        let name = self.previous.text(self.scanner.source()).to_owned();
        let class_slot = self.classes.last().expect("inside class body").class_slot;
        self.emit_operand(Opcode::GetLocal, class_slot);
        let kind = if op == Opcode::CreateProperty { FuncKind::Method } else { FuncKind::Function };
        self.function(&name, kind, indent)?;
        let constant = self.name_constant(&name);
        self.emit_operand(op, constant);
        Ok(())
    }

    fn decorated_statement(&mut self, indent: usize) -> CResult {
        // Module- or function-level decorated def.
        let mut count = 0usize;
        while self.matches(TokenKind::At)? {
            self.expression()?;
            count += 1;
            self.consume(TokenKind::Eol, "expected end of line after decorator")?;
            self.consume(TokenKind::Indentation, "expected decorated function")?;
            if self.previous.length != indent {
                let token = self.previous;
                return self.error_at(token, "unexpected indentation level");
            }
        }
        if !self.check(TokenKind::Def) {
            let token = self.current;
            return self.error_at(token, "expected a function after decorators");
        }
        self.advance()?;
        self.consume(TokenKind::Identifier, "expected a function name")?;
        let name = self.previous.text(self.scanner.source()).to_owned();
        self.function(&name, FuncKind::Function, indent)?;
        for _ in 0..count {
            self.emit_byte_op(Opcode::Call, 1);
        }
        if self.ctx_ref().scope_depth > 0 {
            self.declare_local(&name)?;
        } else {
            let constant = self.name_constant(&name);
            self.emit_operand(Opcode::DefineGlobal, constant);
        }
        Ok(())
    }

    // ---- simple statements ----

    fn let_statement(&mut self) -> CResult {
        self.advance()?;
        let mut names: Vec<String> = Vec::new();
        loop {
            self.consume(TokenKind::Identifier, "expected a variable name after 'let'")?;
            names.push(self.previous.text(self.scanner.source()).to_owned());
            if !self.matches(TokenKind::Comma)? {
                break;
            }
        }
        let module_scope = self.ctx_ref().scope_depth == 0;
        if self.matches(TokenKind::Equal)? {
            self.expression()?;
            if names.len() > 1 {
                let Ok(n) = u8::try_from(names.len()) else {
                    let token = self.previous;
                    return self.error_at(token, "too many assignment targets");
                };
                self.emit_byte_op(Opcode::Unpack, n);
            }
            if module_scope {
                for name in names.iter().rev() {
                    let constant = self.name_constant(name);
                    self.emit_operand(Opcode::DefineGlobal, constant);
                }
            } else {
                for name in &names {
                    self.declare_local(name)?;
                }
            }
        } else if module_scope {
            for name in &names {
                self.emit(Opcode::LoadNone);
                let constant = self.name_constant(name);
                self.emit_operand(Opcode::DefineGlobal, constant);
            }
        } else {
            for name in &names {
                self.emit(Opcode::LoadNone);
                self.declare_local(name)?;
            }
        }
        Ok(())
    }

    fn return_statement(&mut self) -> CResult {
        self.advance()?;
        match self.ctx_ref().kind {
            FuncKind::Module | FuncKind::ClassBody => {
                let token = self.previous;
                return self.error_at(token, "'return' outside of a function");
            }
            FuncKind::Init => {
                // __init__ always returns the receiver.
                if starts_expression(self.current.kind) {
                    self.expression()?;
                    self.emit(Opcode::Pop);
                }
                let top = self.funcs.len() - 1;
                let slot = self.resolve_local(top, "self").unwrap_or(1);
                self.emit_operand(Opcode::GetLocal, slot);
            }
            _ => {
                if starts_expression(self.current.kind) {
                    self.expression()?;
                } else {
                    self.emit(Opcode::LoadNone);
                }
            }
        }
        self.emit(Opcode::Return);
        Ok(())
    }

    fn raise_statement(&mut self) -> CResult {
        self.advance()?;
        self.expression()?;
        self.emit(Opcode::Raise);
        Ok(())
    }

    fn break_statement(&mut self) -> CResult {
        self.advance()?;
        let Some(floor) = self.ctx_ref().loops.last().map(|l| l.locals_floor) else {
            let token = self.previous;
            return self.error_at(token, "'break' outside of a loop");
        };
        self.emit_cleanup_to(floor);
        let label = self.emit_jump(Opcode::Jump);
        self.ctx()
            .loops
            .last_mut()
            .expect("loop context checked above")
            .breaks
            .push(label);
        Ok(())
    }

    fn continue_statement(&mut self) -> CResult {
        self.advance()?;
        let Some((floor, target)) = self
            .ctx_ref()
            .loops
            .last()
            .map(|l| (l.locals_floor, l.continue_target))
        else {
            let token = self.previous;
            return self.error_at(token, "'continue' outside of a loop");
        };
        self.emit_cleanup_to(floor);
        self.emit_loop(target);
        Ok(())
    }

    fn del_statement(&mut self) -> CResult {
        self.advance()?;
        loop {
            self.del_target()?;
            if !self.matches(TokenKind::Comma)? {
                break;
            }
        }
        Ok(())
    }

    fn del_target(&mut self) -> CResult {
        if !self.matches(TokenKind::Identifier)? && !self.matches(TokenKind::SelfKw)? {
            let token = self.current;
            return self.error_at(token, "expected a deletion target");
        }
        let name = self.previous.text(self.scanner.source()).to_owned();
        if !self.check(TokenKind::Dot) && !self.check(TokenKind::LeftBracket) {
            // Bare name: only module-level names can be unbound.
            let top = self.funcs.len() - 1;
            if self.resolve_local(top, &name).is_some() {
                let token = self.previous;
                return self.error_at(token, "cannot delete a local variable");
            }
            if self.resolve_upvalue(top, &name).is_some() {
                let token = self.previous;
                return self.error_at(token, "cannot delete a captured variable");
            }
            let constant = self.name_constant(&name);
            self.emit_operand(Opcode::DelGlobal, constant);
            return Ok(());
        }
        // Chained target: load the base, walk to the last link, delete it.
        self.named_variable(&name, false)?;
        loop {
            if self.matches(TokenKind::Dot)? {
                self.consume(TokenKind::Identifier, "expected an attribute name after '.'")?;
                let attr = self.previous.text(self.scanner.source()).to_owned();
                let constant = self.name_constant(&attr);
                if self.check(TokenKind::Dot) || self.check(TokenKind::LeftBracket) {
                    self.emit_operand(Opcode::GetProperty, constant);
                } else {
                    self.emit_operand(Opcode::DelProperty, constant);
                    return Ok(());
                }
            } else if self.matches(TokenKind::LeftBracket)? {
                self.expression()?;
                self.consume(TokenKind::RightBracket, "expected ']' after subscript")?;
                if self.check(TokenKind::Dot) || self.check(TokenKind::LeftBracket) {
                    self.emit(Opcode::GetItem);
                } else {
                    self.emit(Opcode::DelItem);
                    return Ok(());
                }
            } else {
                let token = self.current;
                return self.error_at(token, "expected a deletion target");
            }
        }
    }

    fn dotted_name(&mut self) -> CResult<String> {
        self.consume(TokenKind::Identifier, "expected a module name")?;
        let mut name = self.previous.text(self.scanner.source()).to_owned();
        while self.matches(TokenKind::Dot)? {
            self.consume(TokenKind::Identifier, "expected a name after '.'")?;
            name.push('.');
            name.push_str(self.previous.text(self.scanner.source()));
        }
        Ok(name)
    }

    /// Binds the value on top of the stack to `name` in the current scope.
    fn bind_name(&mut self, name: &str) -> CResult {
        if self.ctx_ref().scope_depth > 0 {
            self.declare_local(name)?;
        } else {
            let constant = self.name_constant(name);
            self.emit_operand(Opcode::DefineGlobal, constant);
        }
        Ok(())
    }

    fn import_statement(&mut self) -> CResult {
        self.advance()?;
        loop {
            let dotted = self.dotted_name()?;
            if self.matches(TokenKind::As)? {
                self.consume(TokenKind::Identifier, "expected a name after 'as'")?;
                let alias = self.previous.text(self.scanner.source()).to_owned();
                let constant = self.name_constant(&dotted);
                self.emit_operand(Opcode::Import, constant);
                self.bind_name(&alias)?;
            } else {
                let root = dotted.split('.').next().expect("dotted name is non-empty").to_owned();
                let constant = self.name_constant(&dotted);
                self.emit_operand(Opcode::Import, constant);
                if root == dotted {
                    self.bind_name(&root)?;
                } else {
                    // `import a.b.c` binds the package root.
                    self.emit(Opcode::Pop);
                    let root_const = self.name_constant(&root);
                    self.emit_operand(Opcode::Import, root_const);
                    self.bind_name(&root)?;
                }
            }
            if !self.matches(TokenKind::Comma)? {
                break;
            }
        }
        Ok(())
    }

    fn from_statement(&mut self) -> CResult {
        self.advance()?;
        let package = self.dotted_name()?;
        self.consume(TokenKind::Import, "expected 'import' after module name")?;
        let constant = self.name_constant(&package);
        self.emit_operand(Opcode::Import, constant);
        loop {
            self.consume(TokenKind::Identifier, "expected a name to import")?;
            let name = self.previous.text(self.scanner.source()).to_owned();
            let target = if self.matches(TokenKind::As)? {
                self.consume(TokenKind::Identifier, "expected a name after 'as'")?;
                self.previous.text(self.scanner.source()).to_owned()
            } else {
                name.clone()
            };
            self.emit_byte_op(Opcode::Dup, 0);
            let name_const = self.name_constant(&name);
            self.emit_operand(Opcode::ImportFrom, name_const);
            if self.ctx_ref().scope_depth > 0 {
                // Keep the package floating above the new local slot.
                self.emit(Opcode::Swap);
                self.declare_local(&target)?;
                // The local slot is beneath the package; swap put the
                // imported value there already.
            } else {
                let target_const = self.name_constant(&target);
                self.emit_operand(Opcode::DefineGlobal, target_const);
            }
            if !self.matches(TokenKind::Comma)? {
                break;
            }
        }
        self.emit(Opcode::Pop);
        Ok(())
    }

    fn expression_statement(&mut self) -> CResult {
        // Function docstring: a bare string literal as the first statement.
        if !self.ctx_ref().has_statement
            && matches!(self.ctx_ref().kind, FuncKind::Function | FuncKind::Method | FuncKind::Init)
            && self.check(TokenKind::String)
        {
            self.advance()?;
            if self.check(TokenKind::Eol) || self.check(TokenKind::Eof) {
                self.string(false)?;
                self.emit(Opcode::Docstring);
                return Ok(());
            }
            self.retreat();
        }

        // Multi-target assignment: `a, b = expr` over plain names.
        if self.check(TokenKind::Identifier) {
            let state = self.parser_state();
            let mut names = Vec::new();
            let mut viable = true;
            loop {
                if !self.check(TokenKind::Identifier) {
                    viable = false;
                    break;
                }
                names.push(self.current.text(self.scanner.source()).to_owned());
                self.advance()?;
                if self.check(TokenKind::Comma) {
                    self.advance()?;
                    continue;
                }
                break;
            }
            if viable && names.len() > 1 && self.check(TokenKind::Equal) {
                self.advance()?;
                self.expression()?;
                let Ok(n) = u8::try_from(names.len()) else {
                    let token = self.previous;
                    return self.error_at(token, "too many assignment targets");
                };
                self.emit_byte_op(Opcode::Unpack, n);
                for name in names.iter().rev() {
                    self.store_name(name)?;
                    self.emit(Opcode::Pop);
                }
                return Ok(());
            }
            self.restore_parser(state);
        }

        self.expression()?;
        self.emit(Opcode::Pop);
        Ok(())
    }

    fn store_name(&mut self, name: &str) -> CResult {
        let top = self.funcs.len() - 1;
        if let Some(slot) = self.resolve_local(top, name) {
            self.emit_operand(Opcode::SetLocal, slot);
        } else if let Some(upvalue) = self.resolve_upvalue(top, name) {
            self.emit_operand(Opcode::SetUpvalue, upvalue);
        } else {
            let constant = self.name_constant(name);
            self.emit_operand(Opcode::SetGlobal, constant);
        }
        Ok(())
    }

    // ---- expressions ----

    fn expression(&mut self) -> CResult {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> CResult {
        let start = (self.ctx_ref().function.chunk.mark(), self.parser_state());
        self.expr_starts.push(start);
        let result = self.parse_precedence_inner(precedence);
        self.expr_starts.pop();
        result
    }

    fn parse_precedence_inner(&mut self, precedence: Precedence) -> CResult {
        self.advance()?;
        let Some(prefix) = rule_for(self.previous.kind).prefix else {
            let token = self.previous;
            return self.error_at(token, "expected an expression");
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign)?;
        while precedence <= rule_for(self.current.kind).precedence {
            self.advance()?;
            let Some(infix) = rule_for(self.previous.kind).infix else {
                let token = self.previous;
                return self.error_at(token, "unexpected operator");
            };
            infix(self, can_assign)?;
        }
        if can_assign && is_assignment_token(self.current.kind) {
            let token = self.current;
            return self.error_at(token, "invalid assignment target");
        }
        Ok(())
    }

    fn literal(&mut self, _can_assign: bool) -> CResult {
        match self.previous.kind {
            TokenKind::None => self.emit(Opcode::LoadNone),
            TokenKind::True => self.emit(Opcode::LoadTrue),
            TokenKind::False => self.emit(Opcode::LoadFalse),
            _ => unreachable!("literal rule on non-literal token"),
        }
        Ok(())
    }

    fn number(&mut self, _can_assign: bool) -> CResult {
        let token = self.previous;
        let raw: String = token.text(self.scanner.source()).replace('_', "");
        if token.kind == TokenKind::Float {
            match raw.parse::<f64>() {
                Ok(v) => self.emit_constant(Value::Float(v)),
                Err(_) => return self.error_at(token, "invalid float literal"),
            }
            return Ok(());
        }
        let parsed = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            i64::from_str_radix(hex, 16)
        } else if let Some(bin) = raw.strip_prefix("0b").or_else(|| raw.strip_prefix("0B")) {
            i64::from_str_radix(bin, 2)
        } else if let Some(oct) = raw.strip_prefix("0o").or_else(|| raw.strip_prefix("0O")) {
            i64::from_str_radix(oct, 8)
        } else {
            raw.parse::<i64>()
        };
        match parsed {
            Ok(v) => self.emit_constant(Value::Int(v)),
            Err(_) => return self.error_at(token, "integer literal out of range"),
        }
        Ok(())
    }

    fn string(&mut self, _can_assign: bool) -> CResult {
        let token = self.previous;
        match self.decode_string_literal(token, false)? {
            DecodedLiteral::Text(text) => self.emit_string(&text),
            DecodedLiteral::Bytes(_) => unreachable!("plain string decoded as bytes"),
        }
        Ok(())
    }

    fn bytes_literal(&mut self, _can_assign: bool) -> CResult {
        let token = self.previous;
        match self.decode_string_literal(token, true)? {
            DecodedLiteral::Bytes(bytes) => {
                let id = self.heap.allocate(HeapData::Bytes(Bytes::new(bytes)));
                self.emit_constant(Value::Ref(id));
            }
            DecodedLiteral::Text(_) => unreachable!("bytes literal decoded as text"),
        }
        Ok(())
    }

    /// Strips quotes/prefix from a string token, returning the interior
    /// byte range.
    fn literal_interior(&self, token: Token) -> (usize, usize) {
        let src = self.scanner.source().as_bytes();
        let mut start = token.start;
        let end = token.start + token.length;
        if matches!(token.kind, TokenKind::BString | TokenKind::FString) {
            start += 1;
        }
        let quote = src[start];
        let triple = end - start >= 6 && src[start + 1] == quote && src[start + 2] == quote;
        if triple { (start + 3, end - 3) } else { (start + 1, end - 1) }
    }

    fn decode_string_literal(&mut self, token: Token, as_bytes: bool) -> CResult<DecodedLiteral> {
        let (start, end) = self.literal_interior(token);
        let raw = self.scanner.source()[start..end].to_owned();
        let mut bytes: Vec<u8> = Vec::with_capacity(raw.len());
        let mut iter = raw.chars().peekable();
        while let Some(ch) = iter.next() {
            if ch != '\\' {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                continue;
            }
            let Some(esc) = iter.next() else {
                return self.error_at(token, "dangling escape in string literal").map(|()| unreachable!());
            };
            match esc {
                '\\' => bytes.push(b'\\'),
                '\'' => bytes.push(b'\''),
                '"' => bytes.push(b'"'),
                'a' => bytes.push(0x07),
                'b' => bytes.push(0x08),
                'f' => bytes.push(0x0c),
                'n' => bytes.push(b'\n'),
                'r' => bytes.push(b'\r'),
                't' => bytes.push(b'\t'),
                'v' => bytes.push(0x0b),
                '[' => bytes.push(0x1b),
                '\n' => {} // a backslash before a newline suppresses it
                'x' | 'u' | 'U' => {
                    let want = match esc {
                        'x' => 2,
                        'u' => 4,
                        _ => 8,
                    };
                    let mut value: u32 = 0;
                    for _ in 0..want {
                        let Some(nibble) = iter.peek().and_then(|d| d.to_digit(16)) else {
                            return self
                                .error_at(token, "invalid numeric escape in string literal")
                                .map(|()| unreachable!());
                        };
                        value = value << 4 | nibble;
                        iter.next();
                    }
                    if esc == 'x' {
                        bytes.push(value as u8);
                    } else if as_bytes {
                        // \u/\U in b"..." inject the literal bytes.
                        let mut significant = false;
                        for shift in (0..4).rev() {
                            let byte = (value >> (shift * 8)) as u8;
                            if byte != 0 || significant || shift == 0 {
                                significant = true;
                                bytes.push(byte);
                            }
                        }
                    } else {
                        let Some(ch) = char::from_u32(value) else {
                            return self
                                .error_at(token, "escape is not a valid codepoint")
                                .map(|()| unreachable!());
                        };
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                    }
                }
                other => {
                    // Unknown escapes pass through verbatim.
                    bytes.push(b'\\');
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        if as_bytes {
            Ok(DecodedLiteral::Bytes(bytes))
        } else {
            match String::from_utf8(bytes) {
                Ok(text) => Ok(DecodedLiteral::Text(text)),
                Err(_) => self
                    .error_at(token, "string literal is not valid UTF-8")
                    .map(|()| unreachable!()),
            }
        }
    }

    /// Compiles an f-string by re-scanning its interior: literal fragments
    /// become constants, `{expr}` becomes `str(expr)` (or `repr` with
    /// `!r`), all joined with `Add`.
    fn fstring(&mut self, _can_assign: bool) -> CResult {
        let token = self.previous;
        let (start, end) = self.literal_interior(token);
        let mut pieces = 0usize;
        let mut literal = String::new();
        let mut i = start;
        while i < end {
            let src = self.scanner.source();
            let rest = &src[i..end];
            let ch = rest.chars().next().expect("in-bounds slice");
            if rest.starts_with("{{") {
                literal.push('{');
                i += 2;
            } else if rest.starts_with("}}") {
                literal.push('}');
                i += 2;
            } else if ch == '{' {
                if !literal.is_empty() {
                    self.emit_fstring_fragment(&literal, &mut pieces);
                    literal.clear();
                }
                let expr_start = i + 1;
                let Some(expr_end) = find_fstring_expr_end(self.scanner.source(), expr_start, end) else {
                    return self.error_at(token, "unterminated expression in f-string");
                };
                let full = &self.scanner.source()[expr_start..expr_end];
                let (expr_range, use_repr) = if let Some(stripped) = full.strip_suffix("!r") {
                    ((expr_start, expr_start + stripped.len()), true)
                } else {
                    ((expr_start, expr_end), false)
                };
                self.compile_fstring_expr(expr_range, token.line, use_repr)?;
                pieces += 1;
                if pieces > 1 {
                    self.emit(Opcode::Add);
                    pieces = 1;
                }
                i = expr_end + 1;
            } else {
                literal.push(ch);
                i += ch.len_utf8();
            }
        }
        if !literal.is_empty() || pieces == 0 {
            self.emit_fstring_fragment(&literal, &mut pieces);
        }
        Ok(())
    }

    fn emit_fstring_fragment(&mut self, fragment: &str, pieces: &mut usize) {
        let decoded = decode_fragment_escapes(fragment);
        self.emit_string(&decoded);
        *pieces += 1;
        if *pieces > 1 {
            self.emit(Opcode::Add);
            *pieces = 1;
        }
    }

    /// Parses one embedded expression by temporarily swapping in a scanner
    /// over the substring.
    fn compile_fstring_expr(&mut self, range: (usize, usize), line: u32, use_repr: bool) -> CResult {
        let converter = self.name_constant(if use_repr { "repr" } else { "str" });
        self.emit_operand(Opcode::GetGlobal, converter);

        let expr_src = &self.scanner.source()[range.0..range.1];
        let outer_state = self.parser_state();
        let sub = Scanner::new_inline(expr_src, line);
        let saved = std::mem::replace(&mut self.scanner, sub);
        self.previous = Token::placeholder();
        let result = (|| -> CResult {
            self.advance()?;
            self.expression()?;
            if !self.check(TokenKind::Eof) {
                let token = self.current;
                return self.error_at(token, "unexpected token in f-string expression");
            }
            Ok(())
        })();
        self.scanner = saved;
        self.restore_parser(outer_state);
        result?;
        self.emit_byte_op(Opcode::Call, 1);
        Ok(())
    }

    fn variable(&mut self, can_assign: bool) -> CResult {
        let name = self.previous.text(self.scanner.source()).to_owned();
        self.named_variable(&name, can_assign)
    }

    fn self_(&mut self, can_assign: bool) -> CResult {
        self.named_variable("self", can_assign)
    }

    fn super_(&mut self, can_assign: bool) -> CResult {
        if self.classes.is_empty() && !self.funcs.iter().any(|f| f.kind == FuncKind::Method || f.kind == FuncKind::Init)
        {
            let token = self.previous;
            return self.error_at(token, "'super' outside of a class");
        }
        self.named_variable("super", can_assign)
    }

    /// Loads or stores a named variable (local, upvalue, or global), and
    /// handles post-hoc assignment operators.
    fn named_variable(&mut self, name: &str, can_assign: bool) -> CResult {
        let top = self.funcs.len() - 1;
        let (get_op, set_op, index) = if let Some(slot) = self.resolve_local(top, name) {
            (Opcode::GetLocal, Opcode::SetLocal, slot)
        } else if let Some(upvalue) = self.resolve_upvalue(top, name) {
            (Opcode::GetUpvalue, Opcode::SetUpvalue, upvalue)
        } else {
            let constant = self.name_constant(name);
            (Opcode::GetGlobal, Opcode::SetGlobal, constant)
        };

        if can_assign && self.check(TokenKind::Equal) {
            self.advance()?;
            self.expression()?;
            self.emit_operand(set_op, index);
            return Ok(());
        }
        if can_assign && let Some(binary) = compound_assign_op(self.current.kind) {
            self.advance()?;
            self.emit_operand(get_op, index);
            self.expression()?;
            self.emit(binary);
            self.emit_operand(set_op, index);
            return Ok(());
        }
        if can_assign && matches!(self.current.kind, TokenKind::PlusPlus | TokenKind::MinusMinus) {
            let delta: i8 = if self.current.kind == TokenKind::PlusPlus { 1 } else { -1 };
            self.advance()?;
            self.emit_operand(get_op, index);
            self.emit_byte_op(Opcode::Inc, delta.cast_unsigned());
            self.emit_operand(set_op, index);
            return Ok(());
        }
        self.emit_operand(get_op, index);
        Ok(())
    }

    fn grouping(&mut self, _can_assign: bool) -> CResult {
        self.scanner.begin_eating_whitespace();
        let result = self.grouping_inner();
        self.scanner.end_eating_whitespace();
        result
    }

    fn grouping_inner(&mut self) -> CResult {
        if self.matches(TokenKind::RightParen)? {
            self.emit_byte_op(Opcode::Tuple, 0);
            return Ok(());
        }
        let head_state = self.parser_state();
        let mark = self.chunk().mark();
        self.expression()?;
        if self.check(TokenKind::For) {
            self.advance()?;
            self.chunk().rollback(mark);
            return self.comprehension(head_state, CompKind::Generator, TokenKind::RightParen);
        }
        if self.check(TokenKind::Comma) {
            let mut count = 1usize;
            while self.matches(TokenKind::Comma)? {
                if self.check(TokenKind::RightParen) {
                    break;
                }
                self.expression()?;
                count += 1;
            }
            self.consume(TokenKind::RightParen, "expected ')' after tuple")?;
            let Ok(count) = u8::try_from(count) else {
                let token = self.previous;
                return self.error_at(token, "too many tuple elements");
            };
            self.emit_byte_op(Opcode::Tuple, count);
            return Ok(());
        }
        self.consume(TokenKind::RightParen, "expected ')' after expression")
    }

    fn list_literal(&mut self, _can_assign: bool) -> CResult {
        self.scanner.begin_eating_whitespace();
        let result = self.list_literal_inner();
        self.scanner.end_eating_whitespace();
        result
    }

    fn list_literal_inner(&mut self) -> CResult {
        if self.matches(TokenKind::RightBracket)? {
            self.emit_byte_op(Opcode::BuildList, 0);
            return Ok(());
        }
        let head_state = self.parser_state();
        let mark = self.chunk().mark();
        self.expression()?;
        if self.check(TokenKind::For) {
            self.advance()?;
            self.chunk().rollback(mark);
            return self.comprehension(head_state, CompKind::List, TokenKind::RightBracket);
        }
        let mut count = 1usize;
        while self.matches(TokenKind::Comma)? {
            if self.check(TokenKind::RightBracket) {
                break;
            }
            self.expression()?;
            count += 1;
        }
        self.consume(TokenKind::RightBracket, "expected ']' after list")?;
        let Ok(count) = u8::try_from(count) else {
            let token = self.previous;
            return self.error_at(token, "too many list elements");
        };
        self.emit_byte_op(Opcode::BuildList, count);
        Ok(())
    }

    fn brace_literal(&mut self, _can_assign: bool) -> CResult {
        self.scanner.begin_eating_whitespace();
        let result = self.brace_literal_inner();
        self.scanner.end_eating_whitespace();
        result
    }

    fn brace_literal_inner(&mut self) -> CResult {
        if self.matches(TokenKind::RightBrace)? {
            self.emit_byte_op(Opcode::BuildDict, 0);
            return Ok(());
        }
        let head_state = self.parser_state();
        let mark = self.chunk().mark();
        self.expression()?;
        if self.check(TokenKind::Colon) {
            self.advance()?;
            self.expression()?;
            if self.check(TokenKind::For) {
                self.advance()?;
                self.chunk().rollback(mark);
                return self.comprehension(head_state, CompKind::Dict, TokenKind::RightBrace);
            }
            let mut count = 1usize;
            while self.matches(TokenKind::Comma)? {
                if self.check(TokenKind::RightBrace) {
                    break;
                }
                self.expression()?;
                self.consume(TokenKind::Colon, "expected ':' in dict literal")?;
                self.expression()?;
                count += 1;
            }
            self.consume(TokenKind::RightBrace, "expected '}' after dict")?;
            let Ok(count) = u8::try_from(count) else {
                let token = self.previous;
                return self.error_at(token, "too many dict entries");
            };
            self.emit_byte_op(Opcode::BuildDict, count);
            return Ok(());
        }
        if self.check(TokenKind::For) {
            self.advance()?;
            self.chunk().rollback(mark);
            return self.comprehension(head_state, CompKind::Set, TokenKind::RightBrace);
        }
        let mut count = 1usize;
        while self.matches(TokenKind::Comma)? {
            if self.check(TokenKind::RightBrace) {
                break;
            }
            self.expression()?;
            count += 1;
        }
        self.consume(TokenKind::RightBrace, "expected '}' after set")?;
        let Ok(count) = u8::try_from(count) else {
            let token = self.previous;
            return self.error_at(token, "too many set elements");
        };
        self.emit_byte_op(Opcode::BuildSet, count);
        Ok(())
    }

    fn unary(&mut self, _can_assign: bool) -> CResult {
        let op = self.previous.kind;
        self.parse_precedence(Precedence::Unary)?;
        match op {
            TokenKind::Minus => self.emit(Opcode::Negate),
            TokenKind::Tilde => self.emit(Opcode::BitNegate),
            TokenKind::Not | TokenKind::Bang => self.emit(Opcode::Not),
            TokenKind::Plus => {}
            _ => unreachable!("unary rule on unexpected token"),
        }
        Ok(())
    }

    fn binary(&mut self, _can_assign: bool) -> CResult {
        let op = self.previous.kind;
        let rule = rule_for(op);
        // Exponentiation is right-associative.
        let next = if op == TokenKind::StarStar {
            rule.precedence
        } else {
            rule.precedence.next()
        };
        self.parse_precedence(next)?;
        match op {
            TokenKind::Plus => self.emit(Opcode::Add),
            TokenKind::Minus => self.emit(Opcode::Subtract),
            TokenKind::Star => self.emit(Opcode::Multiply),
            TokenKind::Slash => self.emit(Opcode::Divide),
            TokenKind::SlashSlash => self.emit(Opcode::FloorDivide),
            TokenKind::Percent => self.emit(Opcode::Modulo),
            TokenKind::StarStar => self.emit(Opcode::Power),
            TokenKind::Amp => self.emit(Opcode::BitAnd),
            TokenKind::Pipe => self.emit(Opcode::BitOr),
            TokenKind::Caret => self.emit(Opcode::BitXor),
            TokenKind::LeftShift => self.emit(Opcode::ShiftLeft),
            TokenKind::RightShift => self.emit(Opcode::ShiftRight),
            TokenKind::EqualEqual => self.emit(Opcode::Equal),
            TokenKind::BangEqual => {
                self.emit(Opcode::Equal);
                self.emit(Opcode::Not);
            }
            TokenKind::Less => self.emit(Opcode::Less),
            TokenKind::Greater => self.emit(Opcode::Greater),
            TokenKind::LessEqual => self.emit(Opcode::LessEqual),
            TokenKind::GreaterEqual => self.emit(Opcode::GreaterEqual),
            TokenKind::In => self.emit(Opcode::In),
            _ => unreachable!("binary rule on unexpected token"),
        }
        Ok(())
    }

    fn is_(&mut self, _can_assign: bool) -> CResult {
        let negate = self.matches(TokenKind::Not)?;
        self.parse_precedence(Precedence::Comparison.next())?;
        self.emit(Opcode::Is);
        if negate {
            self.emit(Opcode::Not);
        }
        Ok(())
    }

    fn not_in(&mut self, _can_assign: bool) -> CResult {
        self.consume(TokenKind::In, "expected 'in' after 'not'")?;
        self.parse_precedence(Precedence::Comparison.next())?;
        self.emit(Opcode::In);
        self.emit(Opcode::Not);
        Ok(())
    }

    fn and_(&mut self, _can_assign: bool) -> CResult {
        let short = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.parse_precedence(Precedence::And.next())?;
        self.patch_jump(short);
        Ok(())
    }

    fn or_(&mut self, _can_assign: bool) -> CResult {
        let short = self.emit_jump(Opcode::JumpIfTrue);
        self.emit(Opcode::Pop);
        self.parse_precedence(Precedence::Or.next())?;
        self.patch_jump(short);
        Ok(())
    }

    /// `x if c else y` — the condition must execute before `x`, so the
    /// already-emitted `x` is rolled back and re-parsed after `c`.
    fn ternary(&mut self, _can_assign: bool) -> CResult {
        let (mark, value_state) = *self
            .expr_starts
            .last()
            .expect("ternary fires inside parse_precedence");
        self.chunk().rollback(mark);
        // Condition (tokens after 'if'), stopping before 'else'.
        self.parse_precedence(Precedence::Or)?;
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        let after_cond = self.parser_state();
        // Re-parse the value expression; it stops at 'if' again.
        self.restore_parser(value_state);
        self.parse_precedence(Precedence::Or)?;
        let end_jump = self.emit_jump(Opcode::Jump);
        // Skip forward past the already-compiled condition.
        self.restore_parser(after_cond);
        self.consume(TokenKind::Else, "expected 'else' in conditional expression")?;
        self.patch_jump(else_jump);
        self.emit(Opcode::Pop);
        self.parse_precedence(Precedence::Ternary)?;
        self.patch_jump(end_jump);
        Ok(())
    }

    // ---- calls, attributes, subscripts ----

    fn call(&mut self, _can_assign: bool) -> CResult {
        self.scanner.begin_eating_whitespace();
        let result = self.call_inner();
        self.scanner.end_eating_whitespace();
        result
    }

    fn call_inner(&mut self) -> CResult {
        let start_state = self.parser_state();
        let mark = self.chunk().mark();
        match self.try_simple_args()? {
            Some(argc) => {
                let Ok(argc) = u8::try_from(argc) else {
                    let token = self.previous;
                    return self.error_at(token, "too many call arguments");
                };
                self.emit_byte_op(Opcode::Call, argc);
                Ok(())
            }
            None => {
                // Splats or keywords present: re-parse in complex mode.
                self.chunk().rollback(mark);
                self.restore_parser(start_state);
                self.complex_args()
            }
        }
    }

    /// Parses a plain positional argument list. Returns `None` when a splat
    /// or keyword argument is discovered, leaving the parser for a re-parse.
    fn try_simple_args(&mut self) -> CResult<Option<usize>> {
        let mut argc = 0usize;
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.check(TokenKind::Star) || self.check(TokenKind::StarStar) {
                    return Ok(None);
                }
                if self.check(TokenKind::Identifier) {
                    let state = self.parser_state();
                    self.advance()?;
                    let is_kwarg = self.check(TokenKind::Equal);
                    self.restore_parser(state);
                    if is_kwarg {
                        return Ok(None);
                    }
                }
                self.expression()?;
                argc += 1;
                if !self.matches(TokenKind::Comma)? {
                    break;
                }
                if self.check(TokenKind::RightParen) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments")?;
        Ok(Some(argc))
    }

    /// Complex call assembly: each argument unit is emitted followed by an
    /// `ExpandArgs` tag, with a final `Kwargs` unit-count marker; the VM
    /// walks the window in reverse.
    fn complex_args(&mut self) -> CResult {
        let mut units = 0usize;
        let mut slots = 0usize;
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.matches(TokenKind::Star)? {
                    self.expression()?;
                    self.emit_byte_op(Opcode::ExpandArgs, 1);
                    slots += 2;
                } else if self.matches(TokenKind::StarStar)? {
                    self.expression()?;
                    self.emit_byte_op(Opcode::ExpandArgs, 2);
                    slots += 2;
                } else {
                    let mut named = false;
                    if self.check(TokenKind::Identifier) {
                        let state = self.parser_state();
                        self.advance()?;
                        if self.check(TokenKind::Equal) {
                            let name = self.previous.text(self.scanner.source()).to_owned();
                            self.advance()?;
                            self.emit_string(&name);
                            self.expression()?;
                            self.emit_byte_op(Opcode::ExpandArgs, 3);
                            slots += 3;
                            named = true;
                        } else {
                            self.restore_parser(state);
                        }
                    }
                    if !named {
                        self.expression()?;
                        self.emit_byte_op(Opcode::ExpandArgs, 0);
                        slots += 2;
                    }
                }
                units += 1;
                if !self.matches(TokenKind::Comma)? {
                    break;
                }
                if self.check(TokenKind::RightParen) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments")?;
        let Ok(unit_count) = u8::try_from(units) else {
            let token = self.previous;
            return self.error_at(token, "too many call arguments");
        };
        self.emit_byte_op(Opcode::Kwargs, unit_count);
        slots += 1;
        let Ok(slots) = u8::try_from(slots) else {
            let token = self.previous;
            return self.error_at(token, "call arguments too large");
        };
        self.emit_byte_op(Opcode::Call, slots);
        Ok(())
    }

    fn dot(&mut self, can_assign: bool) -> CResult {
        self.consume(TokenKind::Identifier, "expected an attribute name after '.'")?;
        let name = self.previous.text(self.scanner.source()).to_owned();
        let constant = self.name_constant(&name);

        if can_assign && self.check(TokenKind::Equal) {
            self.advance()?;
            self.expression()?;
            self.emit_operand(Opcode::SetProperty, constant);
            return Ok(());
        }
        if can_assign && let Some(binary) = compound_assign_op(self.current.kind) {
            self.advance()?;
            self.emit_byte_op(Opcode::Dup, 0);
            self.emit_operand(Opcode::GetProperty, constant);
            self.expression()?;
            self.emit(binary);
            self.emit_operand(Opcode::SetProperty, constant);
            return Ok(());
        }
        if can_assign && matches!(self.current.kind, TokenKind::PlusPlus | TokenKind::MinusMinus) {
            let delta: i8 = if self.current.kind == TokenKind::PlusPlus { 1 } else { -1 };
            self.advance()?;
            self.emit_byte_op(Opcode::Dup, 0);
            self.emit_operand(Opcode::GetProperty, constant);
            self.emit_byte_op(Opcode::Inc, delta.cast_unsigned());
            self.emit_operand(Opcode::SetProperty, constant);
            return Ok(());
        }
        self.emit_operand(Opcode::GetProperty, constant);
        Ok(())
    }

    fn subscript(&mut self, can_assign: bool) -> CResult {
        self.scanner.begin_eating_whitespace();
        let result = self.subscript_inner(can_assign);
        self.scanner.end_eating_whitespace();
        result
    }

    fn subscript_inner(&mut self, can_assign: bool) -> CResult {
        let mut is_slice = false;
        if self.check(TokenKind::Colon) {
            self.emit(Opcode::LoadNone);
        } else {
            self.expression()?;
        }
        if self.matches(TokenKind::Colon)? {
            is_slice = true;
            if self.check(TokenKind::RightBracket) {
                self.emit(Opcode::LoadNone);
            } else {
                self.expression()?;
            }
        }
        self.consume(TokenKind::RightBracket, "expected ']' after subscript")?;

        if is_slice {
            if can_assign && self.matches(TokenKind::Equal)? {
                self.expression()?;
                self.emit(Opcode::SetSlice);
            } else {
                self.emit(Opcode::GetSlice);
            }
            return Ok(());
        }

        if can_assign && self.check(TokenKind::Equal) {
            self.advance()?;
            self.expression()?;
            self.emit(Opcode::SetItem);
            return Ok(());
        }
        if can_assign && let Some(binary) = compound_assign_op(self.current.kind) {
            self.advance()?;
            self.emit_byte_op(Opcode::Dup, 1);
            self.emit_byte_op(Opcode::Dup, 1);
            self.emit(Opcode::GetItem);
            self.expression()?;
            self.emit(binary);
            self.emit(Opcode::SetItem);
            return Ok(());
        }
        self.emit(Opcode::GetItem);
        Ok(())
    }

    fn lambda(&mut self, _can_assign: bool) -> CResult {
        let name = self.heap.intern_string("<lambda>");
        let filename = self.filename.clone();
        self.funcs.push(FuncCtx::new(name, &filename, FuncKind::Lambda));
        self.begin_scope();
        if !self.check(TokenKind::Colon) {
            self.parameter_list(TokenKind::Colon)?;
        }
        self.consume(TokenKind::Colon, "expected ':' after lambda parameters")?;
        self.compile_keyword_defaults()?;
        self.expression()?;
        self.emit(Opcode::Return);
        self.finish_function()
    }

    fn yield_(&mut self, _can_assign: bool) -> CResult {
        if matches!(self.ctx_ref().kind, FuncKind::Module | FuncKind::ClassBody) {
            let token = self.previous;
            return self.error_at(token, "'yield' outside of a function");
        }
        if starts_expression(self.current.kind) {
            self.expression()?;
        } else {
            self.emit(Opcode::LoadNone);
        }
        self.ctx().function.flags.is_generator = true;
        self.emit(Opcode::Yield);
        Ok(())
    }

    // ---- comprehensions ----

    /// Compiles a comprehension into a synthetic function taking the
    /// outermost iterable, then calls it. On entry the parser sits just
    /// past the `for`; `head_state` points at the head expression.
    fn comprehension(&mut self, head_state: ParserState, kind: CompKind, closing: TokenKind) -> CResult {
        let name = self.heap.intern_string(match kind {
            CompKind::List => "<listcomp>",
            CompKind::Set => "<setcomp>",
            CompKind::Dict => "<dictcomp>",
            CompKind::Generator => "<genexpr>",
        });
        let filename = self.filename.clone();
        let mut ctx = FuncCtx::new(name, &filename, FuncKind::Comprehension);
        let seq_name = self.heap.intern_string(" seq");
        ctx.function.required_args.push(seq_name);
        ctx.locals.push(Local {
            name: " seq".to_owned(),
            depth: 0,
            captured: false,
            kind: LocalKind::Normal,
            birth: 0,
        });
        if kind == CompKind::Generator {
            ctx.function.flags.is_generator = true;
        }
        self.funcs.push(ctx);
        self.begin_scope();

        let acc_slot = match kind {
            CompKind::List => {
                self.emit_byte_op(Opcode::BuildList, 0);
                Some(self.add_local(" acc", LocalKind::Normal)?)
            }
            CompKind::Set => {
                self.emit_byte_op(Opcode::BuildSet, 0);
                Some(self.add_local(" acc", LocalKind::Normal)?)
            }
            CompKind::Dict => {
                self.emit_byte_op(Opcode::BuildDict, 0);
                Some(self.add_local(" acc", LocalKind::Normal)?)
            }
            CompKind::Generator => None,
        };

        self.comp_clause(head_state, kind, acc_slot, 0)?;
        self.consume(closing, "expected closing bracket after comprehension")?;

        if let Some(slot) = acc_slot {
            self.emit_operand(Opcode::GetLocal, slot);
            self.emit(Opcode::Return);
        }
        // The outer iterable was emitted into the enclosing chunk before
        // the closure; swap so the callable is beneath its argument.
        self.finish_function()?;
        self.emit(Opcode::Swap);
        self.emit_byte_op(Opcode::Call, 1);
        Ok(())
    }

    /// One `for targets in iterable [if cond]*` clause; recurses for
    /// nested clauses and re-parses the head expression in the innermost
    /// position.
    fn comp_clause(
        &mut self,
        head_state: ParserState,
        kind: CompKind,
        acc_slot: Option<usize>,
        depth: usize,
    ) -> CResult {
        let mut targets: Vec<String> = Vec::new();
        loop {
            if !self.matches(TokenKind::Identifier)? && !self.matches(TokenKind::SelfKw)? {
                let token = self.current;
                return self.error_at(token, "expected a loop variable in comprehension");
            }
            targets.push(self.previous.text(self.scanner.source()).to_owned());
            if !self.matches(TokenKind::Comma)? {
                break;
            }
        }
        self.consume(TokenKind::In, "expected 'in' in comprehension")?;

        if depth == 0 {
            // The outermost iterable is evaluated in the enclosing scope.
            let synthetic = self.funcs.pop().expect("comprehension context exists");
            let outer_result = self.expression();
            self.funcs.push(synthetic);
            outer_result?;
            let seq_slot = self
                .resolve_local(self.funcs.len() - 1, " seq")
                .expect("comprehension parameter exists");
            self.emit_operand(Opcode::GetLocal, seq_slot);
        } else {
            self.expression()?;
        }
        self.emit(Opcode::InvokeIter);
        let iter_slot = self.add_local(" iter", LocalKind::Normal)?;

        let loop_start = self.code_len();
        self.emit_operand(Opcode::GetLocal, iter_slot);
        self.emit_byte_op(Opcode::Call, 0);
        self.emit_byte_op(Opcode::Dup, 0);
        self.emit_operand(Opcode::GetLocal, iter_slot);
        self.emit(Opcode::Is);
        let exit_jump = self.emit_jump(Opcode::JumpIfTrue);
        self.emit(Opcode::Pop);

        self.begin_scope();
        if targets.len() == 1 {
            self.declare_local(&targets[0])?;
        } else {
            let Ok(n) = u8::try_from(targets.len()) else {
                let token = self.previous;
                return self.error_at(token, "too many loop targets");
            };
            self.emit_byte_op(Opcode::Unpack, n);
            for target in &targets {
                self.declare_local(target)?;
            }
        }
        let target_count = targets.len();

        let mut skip_jumps = Vec::new();
        let mut nested = false;
        loop {
            if self.matches(TokenKind::If)? {
                self.parse_precedence(Precedence::Or)?;
                skip_jumps.push(self.emit_jump(Opcode::JumpIfFalse));
                self.emit(Opcode::Pop);
            } else if self.matches(TokenKind::For)? {
                self.comp_clause(head_state, kind, acc_slot, depth + 1)?;
                nested = true;
                break;
            } else {
                break;
            }
        }

        if !nested {
            // Re-parse the head with loop variables in scope, then return
            // the parser to the clause tail.
            let tail_state = self.parser_state();
            self.restore_parser(head_state);
            match kind {
                CompKind::List => {
                    self.expression()?;
                    let slot = comp_slot(self, acc_slot)?;
                    self.emit_byte_op(Opcode::ListAppend, slot);
                }
                CompKind::Set => {
                    self.expression()?;
                    let slot = comp_slot(self, acc_slot)?;
                    self.emit_byte_op(Opcode::SetAdd, slot);
                }
                CompKind::Dict => {
                    self.expression()?;
                    self.consume(TokenKind::Colon, "expected ':' in dict comprehension")?;
                    self.expression()?;
                    let slot = comp_slot(self, acc_slot)?;
                    self.emit_byte_op(Opcode::DictSet, slot);
                }
                CompKind::Generator => {
                    self.expression()?;
                    self.emit(Opcode::Yield);
                    self.emit(Opcode::Pop);
                }
            }
            self.restore_parser(tail_state);
        }

        // Iteration end: filtered paths land here with the failed
        // condition still on the stack.
        let cont = self.emit_jump(Opcode::Jump);
        for jump in skip_jumps {
            self.patch_jump(jump);
        }
        self.emit(Opcode::Pop);
        self.patch_jump(cont);
        for _ in 0..target_count {
            self.emit(Opcode::Pop);
        }
        self.discard_scope_locals();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit(Opcode::Pop);
        self.emit(Opcode::Pop);
        Ok(())
    }

    /// Forgets the innermost scope's locals without emitting pops (their
    /// stack slots were consumed on the loop path).
    fn discard_scope_locals(&mut self) {
        let depth = self.ctx().scope_depth;
        self.ctx().scope_depth -= 1;
        while self.ctx_ref().locals.last().is_some_and(|l| l.depth >= depth) {
            self.ctx().locals.pop();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum MethodDecorator {
    StaticMethod,
    Property,
}

fn comp_slot(compiler: &mut Compiler<'_, '_>, acc_slot: Option<usize>) -> CResult<u8> {
    let slot = acc_slot.expect("comprehension accumulator exists");
    match u8::try_from(slot) {
        Ok(slot) => Ok(slot),
        Err(_) => {
            let token = compiler.previous;
            compiler
                .error_at(token, "comprehension accumulator slot too deep")
                .map(|()| unreachable!())
        }
    }
}

fn is_assignment_token(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Equal
            | TokenKind::PlusEqual
            | TokenKind::MinusEqual
            | TokenKind::StarEqual
            | TokenKind::StarStarEqual
            | TokenKind::SlashEqual
            | TokenKind::SlashSlashEqual
            | TokenKind::PercentEqual
            | TokenKind::AmpEqual
            | TokenKind::PipeEqual
            | TokenKind::CaretEqual
            | TokenKind::LeftShiftEqual
            | TokenKind::RightShiftEqual
    )
}

fn compound_assign_op(kind: TokenKind) -> Option<Opcode> {
    Some(match kind {
        TokenKind::PlusEqual => Opcode::Add,
        TokenKind::MinusEqual => Opcode::Subtract,
        TokenKind::StarEqual => Opcode::Multiply,
        TokenKind::StarStarEqual => Opcode::Power,
        TokenKind::SlashEqual => Opcode::Divide,
        TokenKind::SlashSlashEqual => Opcode::FloorDivide,
        TokenKind::PercentEqual => Opcode::Modulo,
        TokenKind::AmpEqual => Opcode::BitAnd,
        TokenKind::PipeEqual => Opcode::BitOr,
        TokenKind::CaretEqual => Opcode::BitXor,
        TokenKind::LeftShiftEqual => Opcode::ShiftLeft,
        TokenKind::RightShiftEqual => Opcode::ShiftRight,
        _ => return None,
    })
}

fn starts_expression(kind: TokenKind) -> bool {
    rule_for(kind).prefix.is_some()
}

fn parse_grouping(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::grouping(c, can_assign)
}
fn parse_call(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::call(c, can_assign)
}
fn parse_list_literal(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::list_literal(c, can_assign)
}
fn parse_subscript(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::subscript(c, can_assign)
}
fn parse_brace_literal(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::brace_literal(c, can_assign)
}
fn parse_dot(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::dot(c, can_assign)
}
fn parse_unary(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::unary(c, can_assign)
}
fn parse_binary(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::binary(c, can_assign)
}
fn parse_is_(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::is_(c, can_assign)
}
fn parse_not_in(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::not_in(c, can_assign)
}
fn parse_and_(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::and_(c, can_assign)
}
fn parse_or_(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::or_(c, can_assign)
}
fn parse_ternary(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::ternary(c, can_assign)
}
fn parse_variable(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::variable(c, can_assign)
}
fn parse_self_(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::self_(c, can_assign)
}
fn parse_super_(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::super_(c, can_assign)
}
fn parse_number(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::number(c, can_assign)
}
fn parse_string(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::string(c, can_assign)
}
fn parse_bytes_literal(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::bytes_literal(c, can_assign)
}
fn parse_fstring(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::fstring(c, can_assign)
}
fn parse_literal(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::literal(c, can_assign)
}
fn parse_lambda(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::lambda(c, can_assign)
}
fn parse_yield_(c: &mut Compiler<'_, '_>, can_assign: bool) -> CResult {
    Compiler::yield_(c, can_assign)
}

fn rule_for(kind: TokenKind) -> ParseRule {
    macro_rules! rule {
        ($prefix:expr, $infix:expr, $prec:ident) => {
            ParseRule {
                prefix: $prefix,
                infix: $infix,
                precedence: Precedence::$prec,
            }
        };
    }
    match kind {
        TokenKind::LeftParen => rule!(Some(parse_grouping), Some(parse_call), Call),
        TokenKind::LeftBracket => rule!(Some(parse_list_literal), Some(parse_subscript), Call),
        TokenKind::LeftBrace => rule!(Some(parse_brace_literal), None, None),
        TokenKind::Dot => rule!(None, Some(parse_dot), Call),
        TokenKind::Minus | TokenKind::Plus => rule!(Some(parse_unary), Some(parse_binary), Term),
        TokenKind::Star | TokenKind::Slash | TokenKind::SlashSlash | TokenKind::Percent => {
            rule!(None, Some(parse_binary), Factor)
        }
        TokenKind::StarStar => rule!(None, Some(parse_binary), Exponent),
        TokenKind::Tilde => rule!(Some(parse_unary), None, None),
        TokenKind::Bang => rule!(Some(parse_unary), None, None),
        TokenKind::Amp => rule!(None, Some(parse_binary), BitAnd),
        TokenKind::Pipe => rule!(None, Some(parse_binary), BitOr),
        TokenKind::Caret => rule!(None, Some(parse_binary), BitXor),
        TokenKind::LeftShift | TokenKind::RightShift => rule!(None, Some(parse_binary), Shift),
        TokenKind::EqualEqual
        | TokenKind::BangEqual
        | TokenKind::Less
        | TokenKind::Greater
        | TokenKind::LessEqual
        | TokenKind::GreaterEqual
        | TokenKind::In => rule!(None, Some(parse_binary), Comparison),
        TokenKind::Is => rule!(None, Some(parse_is_), Comparison),
        TokenKind::Not => rule!(Some(parse_unary), Some(parse_not_in), Comparison),
        TokenKind::And => rule!(None, Some(parse_and_), And),
        TokenKind::Or => rule!(None, Some(parse_or_), Or),
        TokenKind::If => rule!(None, Some(parse_ternary), Ternary),
        TokenKind::Identifier => rule!(Some(parse_variable), None, None),
        TokenKind::SelfKw => rule!(Some(parse_self_), None, None),
        TokenKind::Super => rule!(Some(parse_super_), None, None),
        TokenKind::Int | TokenKind::Float => rule!(Some(parse_number), None, None),
        TokenKind::String => rule!(Some(parse_string), None, None),
        TokenKind::BString => rule!(Some(parse_bytes_literal), None, None),
        TokenKind::FString => rule!(Some(parse_fstring), None, None),
        TokenKind::True | TokenKind::False | TokenKind::None => rule!(Some(parse_literal), None, None),
        TokenKind::Lambda => rule!(Some(parse_lambda), None, None),
        TokenKind::Yield => rule!(Some(parse_yield_), None, None),
        _ => rule!(None, None, None),
    }
}

/// Finds the `}` closing an f-string expression, skipping nested brackets
/// and string literals.
fn find_fstring_expr_end(src: &str, start: usize, limit: usize) -> Option<usize> {
    let bytes = src.as_bytes();
    let mut depth = 0usize;
    let mut i = start;
    while i < limit {
        match bytes[i] {
            b'{' | b'[' | b'(' => depth += 1,
            b'}' if depth == 0 => return Some(i),
            b'}' | b']' | b')' => depth = depth.saturating_sub(1),
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < limit && bytes[i] != quote {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Decodes backslash escapes inside an f-string literal fragment.
fn decode_fragment_escapes(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    let mut chars = fragment.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn compile_ok(source: &str) -> (Heap, HeapId) {
        let mut heap = Heap::new();
        let func = Compiler::compile(&mut heap, source, "test.krk").expect("source should compile");
        (heap, func)
    }

    fn compile_err(source: &str) -> CompileError {
        let mut heap = Heap::new();
        Compiler::compile(&mut heap, source, "test.krk").expect_err("source should not compile")
    }

    fn chunk_of(heap: &Heap, func: HeapId) -> &Chunk {
        match heap.get(func) {
            HeapData::Function(f) => &f.chunk,
            other => panic!("expected function, found {}", other.type_name()),
        }
    }

    #[test]
    fn module_ends_with_return() {
        let (heap, func) = compile_ok("1 + 2\n");
        let chunk = chunk_of(&heap, func);
        assert_eq!(chunk.code().last().copied(), Some(Opcode::Return as u8));
    }

    #[test]
    fn compile_is_deterministic() {
        let src = "let x = 1\ndef f(a, b=2):\n    return a + b\nf(x)\n";
        let (heap_a, func_a) = compile_ok(src);
        let (heap_b, func_b) = compile_ok(src);
        assert_eq!(chunk_of(&heap_a, func_a).code(), chunk_of(&heap_b, func_b).code());
    }

    #[test]
    fn shadowing_in_one_scope_errors() {
        let err = compile_err("def f():\n    let a = 1\n    let a = 2\n");
        assert!(err.message.contains("duplicate declaration"));
    }

    #[test]
    fn break_outside_loop_errors() {
        let err = compile_err("break\n");
        assert!(err.message.contains("'break' outside"));
    }

    #[test]
    fn return_at_module_level_errors() {
        let err = compile_err("return 1\n");
        assert!(err.message.contains("'return' outside"));
    }

    #[test]
    fn yield_marks_generator() {
        let (heap, func) = compile_ok("def gen():\n    yield 1\n");
        let HeapData::Function(module) = heap.get(func) else {
            panic!("module function expected")
        };
        let inner = module
            .chunk
            .constants()
            .iter()
            .find_map(|&c| match c {
                Value::Ref(id) => match heap.get(id) {
                    HeapData::Function(f) if heap.str_value(f.name) == "gen" => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("inner function constant");
        assert!(inner.flags.is_generator);
    }

    #[test]
    fn keyword_defaults_use_sentinel_prologue() {
        let (heap, func) = compile_ok("def f(x=10):\n    return x\n");
        let HeapData::Function(module) = heap.get(func) else {
            panic!("module function expected")
        };
        let inner = module
            .chunk
            .constants()
            .iter()
            .find_map(|&c| match c {
                Value::Ref(id) => match heap.get(id) {
                    HeapData::Function(f) if heap.str_value(f.name) == "f" => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("inner function constant");
        assert_eq!(inner.keyword_args.len(), 1);
        assert!(
            inner
                .chunk
                .constants()
                .iter()
                .any(|c| matches!(c, Value::Kwargs(n) if *n == kwargs::UNSET))
        );
    }

    #[test]
    fn comprehension_compiles_to_synthetic_call() {
        let (heap, func) = compile_ok("let squares = [x * x for x in [1, 2, 3]]\n");
        let HeapData::Function(module) = heap.get(func) else {
            panic!("module function expected")
        };
        let found = module.chunk.constants().iter().any(|&c| match c {
            Value::Ref(id) => matches!(
                heap.get(id),
                HeapData::Function(f) if heap.str_value(f.name) == "<listcomp>"
            ),
            _ => false,
        });
        assert!(found, "list comprehension should produce a synthetic function");
    }

    #[test]
    fn ternary_orders_condition_first() {
        // The condition (GetGlobal c) must be emitted before either arm.
        let (heap, func) = compile_ok("let r = 1 if c else 2\n");
        let chunk = chunk_of(&heap, func);
        let code = chunk.code();
        let jump_pos = code
            .iter()
            .position(|&b| b == Opcode::JumpIfFalse as u8)
            .expect("ternary emits a conditional jump");
        assert_eq!(code[0], Opcode::GetGlobal as u8, "condition load comes first");
        assert!(jump_pos < code.len());
    }

    #[test]
    fn syntax_error_carries_location() {
        let err = compile_err("let = 3\n");
        assert_eq!(err.line, 1);
        assert!(err.col > 1);
    }

    #[test]
    fn missing_block_errors() {
        let err = compile_err("if True:\n");
        assert!(err.message.contains("expected an indented block"));
    }
}
