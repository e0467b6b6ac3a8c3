// File: src/compiler.rs
//
// Single-pass Pratt-parser bytecode compiler. There is no intermediate AST:
// parsing and code generation happen in the same walk over the token stream,
// the way a hand-written recursive-descent compiler for a stack VM normally
// does. Expression parsing is precedence climbing dispatched on token kind
// directly (a match, not a function-pointer rule table).

use std::rc::Rc;

use crate::chunk::{Chunk, Op};
use crate::errors::{RuffError, SourceLocation};
use crate::heap::Heap;
use crate::object::{LocalEntry, RFunction};
use crate::scanner::{Scanner, ScannerState, Token, TokenKind};
use crate::value::{kwargs, Value};

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Prec {
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
    Primary,
}

impl Prec {
    fn next(self) -> Prec {
        use Prec::*;
        match self {
            None => Assignment,
            Assignment => Ternary,
            Ternary => Or,
            Or => And,
            And => Comparison,
            Comparison => BitOr,
            BitOr => BitXor,
            BitXor => BitAnd,
            BitAnd => Shift,
            Shift => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Exponent,
            Exponent => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

fn infix_prec(kind: TokenKind) -> Prec {
    use TokenKind::*;
    match kind {
        Or => Prec::Or,
        And => Prec::And,
        EqualEqual | BangEqual | Less | LessEqual | Greater | GreaterEqual | In | Is => {
            Prec::Comparison
        }
        Pipe => Prec::BitOr,
        Caret => Prec::BitXor,
        Amp => Prec::BitAnd,
        LeftShift | RightShift => Prec::Shift,
        Plus | Minus => Prec::Term,
        Star | Slash | SlashSlash | Percent => Prec::Factor,
        StarStar => Prec::Exponent,
        LeftParen | Dot | LeftBracket => Prec::Call,
        _ => Prec::None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FunctionType {
    Module,
    Function,
    Method,
    Init,
    Lambda,
    Static,
    Property,
}

struct LocalVar {
    name: Rc<str>,
    depth: usize,
    captured: bool,
    id: u32,
}

#[derive(Clone, Copy)]
struct UpvalDesc {
    is_local: bool,
    index: u8,
}

struct LoopState {
    start: usize,
    break_jumps: Vec<usize>,
    local_depth: usize,
    handler_depth: usize,
}

struct FrameState {
    function_type: FunctionType,
    chunk: Chunk,
    name: Rc<str>,
    required_args: Vec<Rc<str>>,
    keyword_args: Vec<Rc<str>>,
    collects_args: bool,
    collects_kwargs: bool,
    docstring: Option<Rc<str>>,
    locals: Vec<LocalVar>,
    upvalues: Vec<UpvalDesc>,
    scope_depth: usize,
    loops: Vec<LoopState>,
    handler_depth: usize,
    next_local_id: u32,
    local_names_debug: Vec<LocalEntry>,
    /// Set once a `yield` is compiled anywhere directly in this frame's body
    /// (not inside a nested `def`/lambda). Marks the finished function as a
    /// generator function rather than an ordinary one.
    saw_yield: bool,
}

impl FrameState {
    fn new(function_type: FunctionType, name: Rc<str>, filename: Rc<str>) -> Self {
        let mut frame = FrameState {
            function_type,
            chunk: Chunk::new(filename),
            name,
            required_args: Vec::new(),
            keyword_args: Vec::new(),
            collects_args: false,
            collects_kwargs: false,
            docstring: None,
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            handler_depth: 0,
            next_local_id: 0,
            local_names_debug: Vec::new(),
            saw_yield: false,
        };
        // Slot 0 is reserved for the callee itself (methods read it as `self`).
        let reserved_name: Rc<str> = match function_type {
            FunctionType::Method | FunctionType::Init | FunctionType::Property => "self".into(),
            _ => "".into(),
        };
        frame.locals.push(LocalVar { name: reserved_name, depth: 0, captured: false, id: 0 });
        frame.next_local_id = 1;
        frame
    }
}

struct ClassState {
    has_base: bool,
}

pub struct Compiler<'a, 'h> {
    scanner: Scanner<'a>,
    heap: &'h mut Heap,
    previous: Token<'a>,
    current: Token<'a>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<RuffError>,
    frames: Vec<FrameState>,
    classes: Vec<ClassState>,
    filename: Rc<str>,
    in_del: bool,
}

type CompileResult = Result<(), ()>;

/// Compiles `source` into a callable module-level function.
pub fn compile(source: &str, filename: &str, heap: &mut Heap) -> Result<RFunction, Vec<RuffError>> {
    let filename: Rc<str> = filename.into();
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        heap,
        previous: Token { kind: TokenKind::Eof, lexeme: "", line: 0, column: 0 },
        current: Token { kind: TokenKind::Eof, lexeme: "", line: 0, column: 0 },
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        frames: vec![FrameState::new(FunctionType::Module, "<module>".into(), filename.clone())],
        classes: Vec::new(),
        filename,
        in_del: false,
    };
    compiler.advance();
    compiler.skip_eols();
    while !compiler.check(TokenKind::Eof) {
        let _ = compiler.declaration();
        compiler.skip_eols();
    }
    let (function, _module_upvalues) = compiler.finish_function(None);
    if compiler.had_error {
        Err(compiler.errors)
    } else {
        Ok(function)
    }
}

impl<'a, 'h> Compiler<'a, 'h> {
    // ---- token stream -----------------------------------------------------

    fn frame(&mut self) -> &mut FrameState {
        self.frames.last_mut().expect("frame stack never empty")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.frames.last_mut().expect("frame stack never empty").chunk
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.error_at_current(self.current.lexeme.to_string());
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
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
        self.error_at_current(message.to_string());
    }

    fn skip_eols(&mut self) {
        while self.check(TokenKind::Eol) {
            self.advance();
        }
    }

    fn end_statement(&mut self) {
        if self.check(TokenKind::Eof) || self.check(TokenKind::Eol) {
            if self.check(TokenKind::Eol) {
                self.advance();
            }
            return;
        }
        if self.check(TokenKind::Semicolon) {
            self.advance();
            return;
        }
        self.error_at_current("expected newline or ';' after statement".to_string());
    }

    fn tell(&self) -> ScannerState {
        self.scanner.tell_scanner()
    }

    fn rewind(&mut self, state: ScannerState) {
        self.scanner.rewind_scanner(state);
    }

    // ---- diagnostics --------------------------------------------------------

    fn error_at_current(&mut self, message: String) {
        self.error_at(self.current, message);
    }

    fn error(&mut self, message: String) {
        self.error_at(self.previous, message);
    }

    fn error_at(&mut self, token: Token<'a>, message: String) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let loc = SourceLocation::with_file(
            token.line as usize,
            token.column as usize,
            self.filename.to_string(),
        );
        self.errors.push(RuffError::parse_error(message, loc));
    }

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
                | TokenKind::Import => return,
                _ => self.advance(),
            }
        }
    }

    // ---- scope / locals / upvalues -----------------------------------------

    fn begin_scope(&mut self) {
        self.frame().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let line = self.line();
        let depth = self.frame().scope_depth;
        self.frame().scope_depth -= 1;
        let new_depth = self.frame().scope_depth;
        while let Some(local) = self.frame().locals.last() {
            if local.depth <= new_depth || local.depth < depth {
                break;
            }
            let captured = local.captured;
            self.frame().locals.pop();
            if captured {
                self.chunk().write_op(Op::CloseUpvalue, line);
            } else {
                self.chunk().write_op(Op::Pop, line);
            }
        }
    }

    fn declare_local(&mut self, name: Rc<str>) -> usize {
        let depth = self.frame().scope_depth;
        let id = self.frame().next_local_id;
        self.frame().next_local_id += 1;
        self.frame().locals.push(LocalVar { name, depth, captured: false, id });
        self.frame().locals.len() - 1
    }

    fn resolve_local(&self, frame_idx: usize, name: &str) -> Option<usize> {
        self.frames[frame_idx].locals.iter().rposition(|l| &*l.name == name)
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Option<usize> {
        if frame_idx == 0 {
            return None;
        }
        let enclosing = frame_idx - 1;
        if let Some(local_idx) = self.resolve_local(enclosing, name) {
            self.frames[enclosing].locals[local_idx].captured = true;
            return Some(self.add_upvalue(frame_idx, local_idx as u8, true));
        }
        if let Some(up_idx) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(frame_idx, up_idx as u8, false));
        }
        None
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> usize {
        let upvalues = &mut self.frames[frame_idx].upvalues;
        for (i, up) in upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i;
            }
        }
        upvalues.push(UpvalDesc { is_local, index });
        upvalues.len() - 1
    }

    // ---- declarations / statements ------------------------------------------

    fn declaration(&mut self) -> CompileResult {
        let result = if self.matches(TokenKind::At) {
            self.decorated()
        } else if self.matches(TokenKind::Def) {
            self.def_statement()
        } else if self.matches(TokenKind::Class) {
            self.class_statement()
        } else if self.matches(TokenKind::Let) {
            self.let_statement()
        } else {
            self.statement()
        };
        if result.is_err() {
            self.synchronize();
        }
        result
    }

    fn decorated(&mut self) -> CompileResult {
        // A decorator wraps the following def in a call: `name = dec(name)`.
        self.expression()?;
        self.skip_eols();
        let name = if self.matches(TokenKind::Def) {
            self.def_statement_named()?
        } else {
            self.error("decorators may only precede a function definition".to_string());
            return Err(());
        };
        // stack is already [decorator, closure]: decorator is the callee.
        let line = self.line();
        self.chunk().write_op(Op::Call, line);
        let line = self.line();
        self.chunk().write_byte(1, line);
        self.store_name(name);
        Ok(())
    }

    fn let_statement(&mut self) -> CompileResult {
        let mut targets = vec![self.parse_let_target()?];
        while self.matches(TokenKind::Comma) {
            targets.push(self.parse_let_target()?);
        }
        self.consume(TokenKind::Equal, "expected '=' in let statement".to_string().as_str());
        let mut values = vec![()];
        self.expression()?;
        while self.matches(TokenKind::Comma) {
            self.expression()?;
            values.push(());
        }
        let line = self.line();
        match (targets.len(), values.len()) {
            (1, 1) => {}
            (1, n) => {
                self.chunk().write_op(Op::Tuple, line);
                self.chunk().write_byte(n as u8, line);
            }
            (n, 1) => {
                self.chunk().write_op(Op::Unpack, line);
                self.chunk().write_byte(n as u8, line);
            }
            (n, m) if n == m => {
                self.chunk().write_op(Op::Tuple, line);
                self.chunk().write_byte(m as u8, line);
                self.chunk().write_op(Op::Unpack, line);
                self.chunk().write_byte(n as u8, line);
            }
            (n, m) => {
                self.error(format!("cannot unpack {} values into {} targets", m, n));
                return Err(());
            }
        }
        for target in targets.into_iter().rev() {
            self.bind_let_target(target);
        }
        self.end_statement();
        Ok(())
    }

    fn parse_let_target(&mut self) -> Result<Rc<str>, ()> {
        self.consume(TokenKind::Identifier, "expected name in let statement".to_string().as_str());
        Ok(self.previous.lexeme.into())
    }

    fn bind_let_target(&mut self, name: Rc<str>) {
        if self.frame().scope_depth == 0 {
            let line = self.line();
            let idx = self.name_constant(&name);
            self.chunk().emit_indexed(Op::DefineGlobal, idx, line);
        } else {
            self.declare_local(name);
        }
    }

    fn store_name(&mut self, name: Rc<str>) {
        let line = self.line();
        if let Some(slot) = self.resolve_local(self.frames.len() - 1, &name) {
            self.chunk().emit_indexed(Op::SetLocal, slot, line);
            self.chunk().write_op(Op::Pop, line);
        } else if let Some(slot) = self.resolve_upvalue(self.frames.len() - 1, &name) {
            self.chunk().emit_indexed(Op::SetUpvalue, slot, line);
            self.chunk().write_op(Op::Pop, line);
        } else {
            let idx = self.name_constant(&name);
            self.chunk().emit_indexed(Op::SetGlobal, idx, line);
            self.chunk().write_op(Op::Pop, line);
        }
    }

    fn name_constant(&mut self, name: &str) -> usize {
        let value = self.heap.new_str_value(name);
        self.chunk().add_constant(value)
    }

    fn statement(&mut self) -> CompileResult {
        if self.matches(TokenKind::If) {
            self.if_statement()
        } else if self.matches(TokenKind::While) {
            self.while_statement()
        } else if self.matches(TokenKind::For) {
            self.for_statement()
        } else if self.matches(TokenKind::Break) {
            self.break_statement()
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement()
        } else if self.matches(TokenKind::Return) {
            self.return_statement()
        } else if self.matches(TokenKind::Yield) {
            self.yield_statement()
        } else if self.matches(TokenKind::Raise) {
            self.raise_statement()
        } else if self.matches(TokenKind::Pass) {
            self.end_statement();
            Ok(())
        } else if self.matches(TokenKind::Import) {
            self.import_statement()
        } else if self.matches(TokenKind::From) {
            self.from_import_statement()
        } else if self.matches(TokenKind::Del) {
            self.del_statement()
        } else if self.matches(TokenKind::Try) {
            self.try_statement()
        } else if self.matches(TokenKind::With) {
            self.with_statement()
        } else {
            self.expression_statement()
        }
    }

    fn expression_statement(&mut self) -> CompileResult {
        self.expression()?;
        let line = self.line();
        self.chunk().write_op(Op::Pop, line);
        self.end_statement();
        Ok(())
    }

    /// Parses an indented block: `:` then `EOL` then a run of statements at a
    /// greater column than the current block's, read by comparing leading
    /// whitespace the scanner hands back as `Indentation` tokens.
    fn block(&mut self) -> CompileResult {
        self.consume(TokenKind::Colon, "expected ':'".to_string().as_str());
        self.consume(TokenKind::Eol, "expected newline after ':'".to_string().as_str());
        self.skip_eols();
        let base_col = self.current_indent();
        if !self.matches_indent(base_col) {
            self.error("expected an indented block".to_string());
            return Err(());
        }
        loop {
            self.declaration()?;
            self.skip_eols();
            if !self.matches_indent(base_col) {
                break;
            }
        }
        Ok(())
    }

    fn current_indent(&self) -> usize {
        if self.current.kind == TokenKind::Indentation {
            self.current.lexeme.len()
        } else {
            0
        }
    }

    fn matches_indent(&mut self, base_col: usize) -> bool {
        if self.current.kind == TokenKind::Indentation && self.current.lexeme.len() >= base_col.max(1)
        {
            self.advance();
            true
        } else {
            self.current.kind != TokenKind::Indentation && base_col == 0 && !self.check(TokenKind::Eof)
        }
    }

    /// Speculatively checks whether an `elif`/`else`/`except`/`finally` clause
    /// follows at the enclosing block's indentation, restoring the scanner if
    /// not so the caller can finish the statement normally.
    fn peek_clause(&mut self, kind: TokenKind) -> bool {
        let checkpoint = self.tell();
        let saved_current = self.current;
        let saved_previous = self.previous;
        self.skip_eols();
        let matched = self.check(kind);
        if !matched {
            self.rewind(checkpoint);
            self.current = saved_current;
            self.previous = saved_previous;
        }
        matched
    }

    fn if_statement(&mut self) -> CompileResult {
        self.expression()?;
        let line = self.line();
        let then_jump = self.chunk().emit_jump(Op::JumpIfFalse, line);
        self.chunk().write_op(Op::Pop, line);
        self.begin_scope();
        self.block()?;
        self.end_scope();
        let line = self.line();
        let else_jump = self.chunk().emit_jump(Op::Jump, line);
        self.chunk().patch_jump(then_jump);
        let line = self.line();
        self.chunk().write_op(Op::Pop, line);
        if self.peek_clause(TokenKind::Elif) {
            self.advance();
            self.if_statement()?;
        } else if self.peek_clause(TokenKind::Else) {
            self.advance();
            self.begin_scope();
            self.block()?;
            self.end_scope();
        }
        self.chunk().patch_jump(else_jump);
        Ok(())
    }

    fn while_statement(&mut self) -> CompileResult {
        let loop_start = self.chunk().code.len();
        let handler_depth = self.frame().handler_depth;
        let local_depth = self.frame().scope_depth;
        self.frame().loops.push(LoopState {
            start: loop_start,
            break_jumps: Vec::new(),
            local_depth,
            handler_depth,
        });
        self.expression()?;
        let line = self.line();
        let exit_jump = self.chunk().emit_jump(Op::JumpIfFalse, line);
        self.chunk().write_op(Op::Pop, line);
        self.begin_scope();
        self.block()?;
        self.end_scope();
        let line = self.line();
        self.chunk().emit_loop(loop_start, line);
        self.chunk().patch_jump(exit_jump);
        let line = self.line();
        self.chunk().write_op(Op::Pop, line);
        let state = self.frame().loops.pop().expect("loop pushed above");
        for jump in state.break_jumps {
            self.chunk().patch_jump(jump);
        }
        Ok(())
    }

    fn for_statement(&mut self) -> CompileResult {
        let line0 = self.line();
        let mut vars = vec![self.parse_let_target()?];
        while self.matches(TokenKind::Comma) {
            vars.push(self.parse_let_target()?);
        }
        self.consume(TokenKind::In, "expected 'in' in for statement".to_string().as_str());
        self.expression()?;
        let line = self.line();
        let iter_idx = self.name_constant("__iter__");
        self.chunk().emit_indexed(Op::GetProperty, iter_idx, line);
        self.chunk().write_op(Op::Call, line);
        self.chunk().write_byte(0, line);

        self.begin_scope();
        let iter_slot = self.declare_local("__iter".into());
        let _ = iter_slot;

        let loop_start = self.chunk().code.len();
        let handler_depth = self.frame().handler_depth;
        let local_depth = self.frame().scope_depth;
        self.frame().loops.push(LoopState {
            start: loop_start,
            break_jumps: Vec::new(),
            local_depth,
            handler_depth,
        });

        let slot = self.resolve_local(self.frames.len() - 1, "__iter").expect("just declared");
        let line = self.line();
        self.chunk().emit_indexed(Op::GetLocal, slot, line);
        let next_idx = self.name_constant("__next__");
        self.chunk().emit_indexed(Op::GetProperty, next_idx, line);
        self.chunk().write_op(Op::Call, line);
        self.chunk().write_byte(0, line);
        self.chunk().emit_indexed(Op::GetLocal, slot, line);
        self.chunk().write_op(Op::Is, line);
        let exit_jump = self.chunk().emit_jump(Op::JumpIfTrue, line);
        self.chunk().write_op(Op::Pop, line);

        self.begin_scope();
        if vars.len() == 1 {
            self.declare_local(vars[0].clone());
        } else {
            let n = vars.len();
            self.chunk().write_op(Op::Unpack, line);
            self.chunk().write_byte(n as u8, line);
            for v in vars.into_iter().rev() {
                self.declare_local(v);
            }
        }
        self.block()?;
        self.end_scope();

        let line = self.line();
        self.chunk().emit_loop(loop_start, line);
        self.chunk().patch_jump(exit_jump);
        let line = self.line();
        self.chunk().write_op(Op::Pop, line);
        let state = self.frame().loops.pop().expect("loop pushed above");
        for jump in state.break_jumps {
            self.chunk().patch_jump(jump);
        }
        self.end_scope();
        let _ = line0;
        Ok(())
    }

    fn unwind_to_loop_boundary(&mut self) -> Option<(usize, Vec<(usize, bool)>)> {
        let loop_state = self.frame().loops.last()?;
        let target_locals = loop_state.local_depth;
        let target_handlers = loop_state.handler_depth;
        let line = self.line();
        let to_pop: Vec<(usize, bool)> = self
            .frame()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth > target_locals)
            .map(|l| (0, l.captured))
            .collect();
        for (_, captured) in &to_pop {
            if *captured {
                self.chunk().write_op(Op::CloseUpvalue, line);
            } else {
                self.chunk().write_op(Op::Pop, line);
            }
        }
        let handlers_to_pop = self.frame().handler_depth.saturating_sub(target_handlers);
        for _ in 0..handlers_to_pop {
            self.chunk().write_op(Op::CleanupWith, line);
        }
        Some((target_locals, to_pop))
    }

    fn break_statement(&mut self) -> CompileResult {
        if self.frame().loops.is_empty() {
            self.error("'break' outside a loop".to_string());
            return Err(());
        }
        self.unwind_to_loop_boundary();
        let line = self.line();
        let jump = self.chunk().emit_jump(Op::Jump, line);
        self.frame().loops.last_mut().expect("checked above").break_jumps.push(jump);
        self.end_statement();
        Ok(())
    }

    fn continue_statement(&mut self) -> CompileResult {
        if self.frame().loops.is_empty() {
            self.error("'continue' outside a loop".to_string());
            return Err(());
        }
        self.unwind_to_loop_boundary();
        let start = self.frame().loops.last().expect("checked above").start;
        let line = self.line();
        self.chunk().emit_loop(start, line);
        self.end_statement();
        Ok(())
    }

    fn return_statement(&mut self) -> CompileResult {
        if self.frame().function_type == FunctionType::Module {
            self.error("'return' outside a function".to_string());
            return Err(());
        }
        if self.check(TokenKind::Eol) || self.check(TokenKind::Semicolon) || self.check(TokenKind::Eof)
        {
            let line = self.line();
            self.chunk().write_op(Op::None, line);
        } else if self.frame().function_type == FunctionType::Init {
            self.error("'__init__' cannot return a value".to_string());
            return Err(());
        } else {
            self.expression()?;
        }
        let line = self.line();
        self.chunk().write_op(Op::Return, line);
        self.end_statement();
        Ok(())
    }

    /// `yield expr` suspends the enclosing call. `OP_YIELD` pops the value
    /// being handed out and suspends the frame; on resume it pushes whatever
    /// was sent in (or `None` for a plain `next()`). Marks the enclosing
    /// function as a generator function, so `Call` wraps it in a `generator`
    /// instance instead of running its body immediately.
    fn yield_statement(&mut self) -> CompileResult {
        if self.frame().function_type == FunctionType::Module {
            self.error("'yield' outside a function".to_string());
            return Err(());
        }
        self.frame().saw_yield = true;
        let line = self.line();
        if self.check(TokenKind::Eol) || self.check(TokenKind::Semicolon) || self.check(TokenKind::Eof) {
            self.chunk().write_op(Op::None, line);
        } else {
            self.expression()?;
        }
        let line = self.line();
        self.chunk().write_op(Op::Yield, line);
        self.chunk().write_op(Op::Pop, line);
        self.end_statement();
        Ok(())
    }

    fn raise_statement(&mut self) -> CompileResult {
        self.expression()?;
        let line = self.line();
        self.chunk().write_op(Op::Raise, line);
        self.end_statement();
        Ok(())
    }

    fn import_statement(&mut self) -> CompileResult {
        self.consume(TokenKind::Identifier, "expected module name".to_string().as_str());
        let name: Rc<str> = self.previous.lexeme.into();
        let mut path = name.to_string();
        while self.matches(TokenKind::Dot) {
            self.consume(TokenKind::Identifier, "expected module name".to_string().as_str());
            path.push('.');
            path.push_str(self.previous.lexeme);
        }
        let bind_name: Rc<str> = if self.matches(TokenKind::As) {
            self.consume(TokenKind::Identifier, "expected name after 'as'".to_string().as_str());
            self.previous.lexeme.into()
        } else {
            name.clone()
        };
        let line = self.line();
        let idx = self.name_constant(&path);
        self.chunk().emit_indexed(Op::Import, idx, line);
        self.store_name(bind_name);
        self.end_statement();
        Ok(())
    }

    fn from_import_statement(&mut self) -> CompileResult {
        self.consume(TokenKind::Identifier, "expected module name".to_string().as_str());
        let mut path = self.previous.lexeme.to_string();
        while self.matches(TokenKind::Dot) {
            self.consume(TokenKind::Identifier, "expected module name".to_string().as_str());
            path.push('.');
            path.push_str(self.previous.lexeme);
        }
        self.consume(TokenKind::Import, "expected 'import' after module path".to_string().as_str());
        let line = self.line();
        let path_idx = self.name_constant(&path);
        self.chunk().emit_indexed(Op::Import, path_idx, line);
        loop {
            self.consume(TokenKind::Identifier, "expected imported name".to_string().as_str());
            let item: Rc<str> = self.previous.lexeme.into();
            let bind_name: Rc<str> = if self.matches(TokenKind::As) {
                self.consume(TokenKind::Identifier, "expected name after 'as'".to_string().as_str());
                self.previous.lexeme.into()
            } else {
                item.clone()
            };
            let line = self.line();
            self.chunk().write_op(Op::Dup, line);
            self.chunk().write_byte(1, line);
            let item_idx = self.name_constant(&item);
            self.chunk().emit_indexed(Op::ImportFrom, item_idx, line);
            self.store_name(bind_name);
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        let line = self.line();
        self.chunk().write_op(Op::Pop, line);
        self.end_statement();
        Ok(())
    }

    fn del_statement(&mut self) -> CompileResult {
        self.in_del = true;
        let result = self.expression();
        self.in_del = false;
        result?;
        let line = self.line();
        self.chunk().write_op(Op::Pop, line);
        self.end_statement();
        Ok(())
    }

    fn try_statement(&mut self) -> CompileResult {
        let line = self.line();
        let try_jump = self.chunk().emit_jump(Op::PushTry, line);
        self.frame().handler_depth += 1;
        self.begin_scope();
        self.block()?;
        self.end_scope();
        self.frame().handler_depth -= 1;
        let line = self.line();
        self.chunk().write_op(Op::CleanupWith, line); // retire the try handler on the non-exceptional path
        let else_jump = self.chunk().emit_jump(Op::Jump, line);
        self.chunk().patch_jump(try_jump);

        let mut except_ends = vec![else_jump];
        let mut had_except = false;
        while self.peek_clause(TokenKind::Except) {
            self.advance();
            had_except = true;
            let has_type = !self.check(TokenKind::Colon) && !self.check(TokenKind::As);
            if has_type {
                self.expression()?;
            } else {
                let line = self.line();
                self.chunk().write_op(Op::None, line);
            }
            let line = self.line();
            self.chunk().write_op(Op::ExceptMatch, line);
            let check_jump = self.chunk().emit_jump(Op::JumpIfFalse, line);
            self.chunk().write_op(Op::Pop, line); // discard the match bool, leaving the exception value

            self.begin_scope();
            if self.matches(TokenKind::As) {
                self.consume(TokenKind::Identifier, "expected name after 'as'".to_string().as_str());
                let name: Rc<str> = self.previous.lexeme.into();
                self.declare_local(name);
            } else {
                let line = self.line();
                self.chunk().write_op(Op::Pop, line);
            }
            self.block()?;
            self.end_scope();
            let line = self.line();
            let end_jump = self.chunk().emit_jump(Op::Jump, line);
            except_ends.push(end_jump);
            self.chunk().patch_jump(check_jump);
            let line = self.line();
            self.chunk().write_op(Op::Pop, line); // discard the match bool on the no-match path too
        }
        if had_except {
            // No except clause matched: re-raise the live exception.
            let line = self.line();
            self.chunk().write_op(Op::Raise, line);
        }
        for jump in except_ends {
            self.chunk().patch_jump(jump);
        }

        if self.peek_clause(TokenKind::Finally) {
            self.advance();
            self.begin_scope();
            self.block()?;
            self.end_scope();
        }
        Ok(())
    }

    fn with_statement(&mut self) -> CompileResult {
        self.expression()?;
        let bind_name = if self.matches(TokenKind::As) {
            self.consume(TokenKind::Identifier, "expected name after 'as'".to_string().as_str());
            Some(Rc::from(self.previous.lexeme))
        } else {
            None
        };
        let line = self.line();
        let with_jump = self.chunk().emit_jump(Op::PushWith, line);
        self.begin_scope();
        if let Some(name) = bind_name {
            self.declare_local(name);
        } else {
            self.declare_local("__with".into());
        }
        self.frame().handler_depth += 1;
        self.block()?;
        self.frame().handler_depth -= 1;
        // Jump target lands exactly on CleanupWith, so an unwind that reaches
        // this handler runs __exit__ the same way the fallthrough path does.
        self.chunk().patch_jump(with_jump);
        let line = self.line();
        self.chunk().write_op(Op::CleanupWith, line);
        self.end_scope();
        Ok(())
    }

    // ---- functions / classes -------------------------------------------------

    fn def_statement(&mut self) -> CompileResult {
        let name = self.def_statement_named()?;
        self.store_name(name);
        Ok(())
    }

    fn def_statement_named(&mut self) -> Result<Rc<str>, ()> {
        self.consume(TokenKind::Identifier, "expected function name".to_string().as_str());
        let name: Rc<str> = self.previous.lexeme.into();
        self.function_body(FunctionType::Function, name.clone())?;
        Ok(name)
    }

    fn function_body(&mut self, function_type: FunctionType, name: Rc<str>) -> CompileResult {
        self.frames.push(FrameState::new(function_type, name, self.filename.clone()));
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "expected '(' after function name".to_string().as_str());
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.matches(TokenKind::StarStar) {
                    self.consume(TokenKind::Identifier, "expected parameter name".to_string().as_str());
                    let pname: Rc<str> = self.previous.lexeme.into();
                    self.declare_local(pname);
                    self.frame().collects_kwargs = true;
                } else if self.matches(TokenKind::Star) {
                    self.consume(TokenKind::Identifier, "expected parameter name".to_string().as_str());
                    let pname: Rc<str> = self.previous.lexeme.into();
                    self.declare_local(pname);
                    self.frame().collects_args = true;
                } else {
                    self.consume(TokenKind::Identifier, "expected parameter name".to_string().as_str());
                    let pname: Rc<str> = self.previous.lexeme.into();
                    self.declare_local(pname.clone());
                    if self.matches(TokenKind::Equal) {
                        let slot = self.frame().locals.len() - 1;
                        let line = self.line();
                        self.chunk().emit_indexed(Op::GetLocal, slot, line);
                        let unset_idx = self.chunk().add_constant(Value::Kwargs(kwargs::UNSET_DEFAULT));
                        self.chunk().emit_indexed(Op::Constant, unset_idx, line);
                        self.chunk().write_op(Op::Is, line);
                        let skip_default = self.chunk().emit_jump(Op::JumpIfFalse, line);
                        self.chunk().write_op(Op::Pop, line);
                        self.expression()?;
                        let line = self.line();
                        self.chunk().emit_indexed(Op::SetLocal, slot, line);
                        let line = self.line();
                        self.chunk().write_op(Op::Pop, line);
                        self.chunk().patch_jump(skip_default);
                        let line = self.line();
                        self.chunk().write_op(Op::Pop, line);
                        self.frame().keyword_args.push(pname);
                    } else {
                        self.frame().required_args.push(pname);
                    }
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters".to_string().as_str());
        if self.matches(TokenKind::Arrow) {
            // Return-type annotations are skipped: no static typing. Consume
            // tokens up to the block's ':' without emitting any bytecode.
            while !self.check(TokenKind::Colon) && !self.check(TokenKind::Eof) {
                self.advance();
            }
        }
        self.block()?;
        let (function, upvalues) = self.finish_function(Some(function_type));
        self.emit_closure(function, upvalues)?;
        Ok(())
    }

    fn finish_function(&mut self, function_type: Option<FunctionType>) -> (RFunction, Vec<UpvalDesc>) {
        let line = self.line();
        match function_type {
            Some(FunctionType::Init) => {
                self.chunk().emit_indexed(Op::GetLocal, 0, line);
            }
            _ => self.chunk().write_op(Op::None, line),
        }
        self.chunk().write_op(Op::Return, line);
        let frame = self.frames.pop().expect("pushed in function_body/compile");
        let upvalue_count = frame.upvalues.len();
        let function = RFunction {
            chunk: frame.chunk,
            name: frame.name,
            docstring: frame.docstring,
            required_args: frame.required_args,
            keyword_args: frame.keyword_args,
            collects_args: frame.collects_args,
            collects_kwargs: frame.collects_kwargs,
            upvalue_count,
            local_names: frame.local_names_debug,
            globals_context: None,
            is_generator: frame.saw_yield,
        };
        (function, frame.upvalues)
    }

    /// Emits `OP_CLOSURE <const>` followed by one `(is_local, index)` byte
    /// pair per upvalue the function body captured, mirroring how the
    /// compiled function describes its own captures.
    fn emit_closure(&mut self, function: RFunction, upvalues: Vec<UpvalDesc>) -> CompileResult {
        let line = self.line();
        let obj = self.heap.new_function(function);
        let idx = self.chunk().add_constant(Value::Obj(obj));
        self.chunk().emit_indexed(Op::Closure, idx, line);
        for up in upvalues {
            self.chunk().write_byte(up.is_local as u8, line);
            self.chunk().write_byte(up.index, line);
        }
        Ok(())
    }

    fn class_statement(&mut self) -> CompileResult {
        self.consume(TokenKind::Identifier, "expected class name".to_string().as_str());
        let name: Rc<str> = self.previous.lexeme.into();
        let line = self.line();
        let name_idx = self.name_constant(&name);
        let has_base = self.matches(TokenKind::LeftParen);
        if has_base {
            if !self.check(TokenKind::RightParen) {
                self.expression()?;
            } else {
                self.chunk().write_op(Op::None, line);
            }
            self.consume(TokenKind::RightParen, "expected ')' after base class".to_string().as_str());
        } else {
            self.chunk().write_op(Op::None, line);
        }
        let line = self.line();
        self.chunk().emit_indexed(Op::Class, name_idx, line);
        self.chunk().write_op(Op::Inherit, line);

        self.classes.push(ClassState { has_base });
        self.consume(TokenKind::Colon, "expected ':' after class header".to_string().as_str());
        self.consume(TokenKind::Eol, "expected newline after class header".to_string().as_str());
        self.skip_eols();
        let base_col = self.current_indent();
        if self.matches_indent(base_col) {
            loop {
                if self.matches(TokenKind::At) {
                    self.decorated_method()?;
                } else if self.matches(TokenKind::Def) {
                    self.method()?;
                } else if self.matches(TokenKind::Pass) {
                    self.end_statement();
                } else {
                    self.error("expected a method definition in class body".to_string());
                    return Err(());
                }
                self.skip_eols();
                if !self.matches_indent(base_col) {
                    break;
                }
            }
        }
        self.classes.pop();
        self.store_name(name);
        Ok(())
    }

    fn decorated_method(&mut self) -> CompileResult {
        self.consume(TokenKind::Identifier, "expected decorator name".to_string().as_str());
        let decorator = self.previous.lexeme;
        let function_type = match decorator {
            "staticmethod" => FunctionType::Static,
            "property" => FunctionType::Property,
            _ => FunctionType::Method,
        };
        self.consume(TokenKind::Def, "expected 'def' after decorator".to_string().as_str());
        self.method_with_type(function_type)
    }

    fn method(&mut self) -> CompileResult {
        self.method_with_type(FunctionType::Method)
    }

    fn method_with_type(&mut self, function_type: FunctionType) -> CompileResult {
        self.consume(TokenKind::Identifier, "expected method name".to_string().as_str());
        let name: Rc<str> = self.previous.lexeme.into();
        let actual_type = if &*name == "__init__" { FunctionType::Init } else { function_type };
        let line = self.line();
        let name_idx = self.name_constant(&name);
        self.function_body(actual_type, name)?;
        let line = self.line();
        if actual_type == FunctionType::Property {
            self.chunk().write_op(Op::CreateProperty, line);
        }
        self.chunk().emit_indexed(Op::Method, name_idx, line);
        let _ = line;
        Ok(())
    }

    // ---- expressions ----------------------------------------------------------

    fn expression(&mut self) -> CompileResult {
        self.parse_precedence(Prec::Assignment)
    }

    fn parse_precedence(&mut self, min_prec: Prec) -> CompileResult {
        self.advance();
        let can_assign = min_prec <= Prec::Assignment;
        self.prefix(self.previous.kind, can_assign)?;
        while min_prec <= infix_prec(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign)?;
        }
        if can_assign && self.matches(TokenKind::Equal) {
            self.error("invalid assignment target".to_string());
            return Err(());
        }
        // Postfix `a if cond else b` ternary, parsed after the primary chain.
        if min_prec <= Prec::Ternary && self.matches(TokenKind::If) {
            self.ternary_tail()?;
        }
        Ok(())
    }

    fn ternary_tail(&mut self) -> CompileResult {
        // stack: [then_value]
        self.parse_precedence(Prec::Or)?; // condition
        let line = self.line();
        self.chunk().write_op(Op::Swap, line);
        let else_jump = self.chunk().emit_jump(Op::JumpIfFalse, line);
        self.chunk().write_op(Op::Pop, line);
        let line = self.line();
        let end_jump = self.chunk().emit_jump(Op::Jump, line);
        self.chunk().patch_jump(else_jump);
        let line = self.line();
        self.chunk().write_op(Op::Pop, line);
        self.consume(TokenKind::Else, "expected 'else' in conditional expression".to_string().as_str());
        self.parse_precedence(Prec::Ternary)?;
        self.chunk().patch_jump(end_jump);
        Ok(())
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> CompileResult {
        use TokenKind::*;
        match kind {
            Int => self.int_literal(),
            Float => self.float_literal(),
            String => self.string_literal(),
            ByteString => self.bytes_literal(),
            FString => self.fstring_literal(),
            True => {
                let line = self.line();
                self.chunk().write_op(Op::True, line);
                Ok(())
            }
            False => {
                let line = self.line();
                self.chunk().write_op(Op::False, line);
                Ok(())
            }
            None_ => {
                let line = self.line();
                self.chunk().write_op(Op::None, line);
                Ok(())
            }
            Identifier => self.variable(can_assign),
            SelfKw => self.self_expr(),
            Super => self.super_expr(),
            LeftParen => self.grouping_or_tuple(),
            LeftBracket => self.list_or_comprehension(),
            LeftBrace => self.dict_or_set(),
            Minus => self.unary(Op::Negate),
            Not => self.unary(Op::Not),
            Tilde => self.unary(Op::BitNegate),
            Plus => self.parse_precedence(Prec::Unary),
            Lambda => self.lambda(),
            _ => {
                self.error("expected an expression".to_string());
                Err(())
            }
        }
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) -> CompileResult {
        use TokenKind::*;
        match kind {
            Plus | Minus | Star | Slash | SlashSlash | Percent | StarStar | Amp | Pipe | Caret
            | LeftShift | RightShift | EqualEqual | BangEqual | Less | LessEqual | Greater
            | GreaterEqual => self.binary(kind),
            Is => self.is_expr(),
            In => self.in_expr(false),
            And => self.and_expr(),
            Or => self.or_expr(),
            Dot => self.dot(can_assign),
            LeftBracket => self.subscript(can_assign),
            LeftParen => self.call(),
            _ => Ok(()),
        }
    }

    fn binary(&mut self, kind: TokenKind) -> CompileResult {
        let prec = infix_prec(kind);
        self.parse_precedence(prec.next())?;
        let line = self.line();
        let op = match kind {
            TokenKind::Plus => Op::Add,
            TokenKind::Minus => Op::Subtract,
            TokenKind::Star => Op::Multiply,
            TokenKind::Slash => Op::Divide,
            TokenKind::SlashSlash => Op::Divide,
            TokenKind::Percent => Op::Modulo,
            TokenKind::StarStar => Op::Pow,
            TokenKind::Amp => Op::BitAnd,
            TokenKind::Pipe => Op::BitOr,
            TokenKind::Caret => Op::BitXor,
            TokenKind::LeftShift => Op::ShiftLeft,
            TokenKind::RightShift => Op::ShiftRight,
            TokenKind::EqualEqual => Op::Equal,
            TokenKind::BangEqual => Op::Equal,
            TokenKind::Less => Op::Less,
            TokenKind::Greater => Op::Greater,
            TokenKind::LessEqual => Op::Greater,
            TokenKind::GreaterEqual => Op::Less,
            _ => unreachable!("guarded by infix() dispatch"),
        };
        self.chunk().write_op(op, line);
        match kind {
            TokenKind::BangEqual | TokenKind::LessEqual | TokenKind::GreaterEqual => {
                self.chunk().write_op(Op::Not, line);
            }
            _ => {}
        }
        Ok(())
    }

    fn is_expr(&mut self) -> CompileResult {
        let negate = self.matches(TokenKind::Not);
        self.parse_precedence(Prec::Comparison.next())?;
        let line = self.line();
        self.chunk().write_op(Op::Is, line);
        if negate {
            self.chunk().write_op(Op::Not, line);
        }
        Ok(())
    }

    fn in_expr(&mut self, negate: bool) -> CompileResult {
        self.parse_precedence(Prec::Comparison.next())?;
        let line = self.line();
        let contains_idx = self.name_constant("__contains__");
        self.chunk().emit_indexed(Op::GetProperty, contains_idx, line);
        self.chunk().write_op(Op::Swap, line);
        self.chunk().write_op(Op::Call, line);
        self.chunk().write_byte(1, line);
        if negate {
            self.chunk().write_op(Op::Not, line);
        }
        Ok(())
    }

    fn and_expr(&mut self) -> CompileResult {
        let line = self.line();
        let end_jump = self.chunk().emit_jump(Op::JumpIfFalse, line);
        self.chunk().write_op(Op::Pop, line);
        self.parse_precedence(Prec::And.next())?;
        self.chunk().patch_jump(end_jump);
        Ok(())
    }

    fn or_expr(&mut self) -> CompileResult {
        let line = self.line();
        let end_jump = self.chunk().emit_jump(Op::JumpIfTrue, line);
        self.chunk().write_op(Op::Pop, line);
        self.parse_precedence(Prec::Or.next())?;
        self.chunk().patch_jump(end_jump);
        Ok(())
    }

    fn unary(&mut self, op: Op) -> CompileResult {
        self.parse_precedence(Prec::Unary)?;
        let line = self.line();
        self.chunk().write_op(op, line);
        Ok(())
    }

    fn variable(&mut self, can_assign: bool) -> CompileResult {
        self.named_variable(Rc::from(self.previous.lexeme), can_assign)
    }

    fn named_variable(&mut self, name: Rc<str>, can_assign: bool) -> CompileResult {
        let frame_idx = self.frames.len() - 1;
        let line = self.line();
        let (get_op, set_op, idx) = if let Some(slot) = self.resolve_local(frame_idx, &name) {
            (Op::GetLocal, Op::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(frame_idx, &name) {
            (Op::GetUpvalue, Op::SetUpvalue, slot)
        } else {
            (Op::GetGlobal, Op::SetGlobal, self.name_constant(&name))
        };
        if can_assign && self.matches_compound_assign() {
            let compound = self.previous.kind;
            self.chunk().emit_indexed(get_op, idx, line);
            self.compound_rhs(compound)?;
            let line = self.line();
            self.chunk().emit_indexed(set_op, idx, line);
        } else if can_assign && self.check(TokenKind::Equal) {
            self.advance();
            self.expression()?;
            let line = self.line();
            self.chunk().emit_indexed(set_op, idx, line);
        } else {
            self.chunk().emit_indexed(get_op, idx, line);
        }
        Ok(())
    }

    fn named_variable_readonly(&mut self, name: &str) {
        let frame_idx = self.frames.len() - 1;
        let line = self.line();
        if let Some(slot) = self.resolve_local(frame_idx, name) {
            self.chunk().emit_indexed(Op::GetLocal, slot, line);
        } else if let Some(slot) = self.resolve_upvalue(frame_idx, name) {
            self.chunk().emit_indexed(Op::GetUpvalue, slot, line);
        } else {
            let idx = self.name_constant(name);
            self.chunk().emit_indexed(Op::GetGlobal, idx, line);
        }
    }

    fn matches_compound_assign(&mut self) -> bool {
        use TokenKind::*;
        for kind in [
            PlusEqual,
            MinusEqual,
            StarEqual,
            SlashEqual,
            SlashSlashEqual,
            PercentEqual,
            AmpEqual,
            PipeEqual,
            CaretEqual,
            LeftShiftEqual,
            RightShiftEqual,
        ] {
            if self.check(kind) {
                self.advance();
                return true;
            }
        }
        false
    }

    fn compound_rhs(&mut self, compound: TokenKind) -> CompileResult {
        use TokenKind::*;
        self.expression()?;
        let line = self.line();
        let op = match compound {
            PlusEqual => Op::Add,
            MinusEqual => Op::Subtract,
            StarEqual => Op::Multiply,
            SlashEqual | SlashSlashEqual => Op::Divide,
            PercentEqual => Op::Modulo,
            AmpEqual => Op::BitAnd,
            PipeEqual => Op::BitOr,
            CaretEqual => Op::BitXor,
            LeftShiftEqual => Op::ShiftLeft,
            RightShiftEqual => Op::ShiftRight,
            _ => unreachable!("matches_compound_assign only returns these kinds"),
        };
        self.chunk().write_op(op, line);
        Ok(())
    }

    fn self_expr(&mut self) -> CompileResult {
        self.named_variable_readonly("self");
        Ok(())
    }

    fn super_expr(&mut self) -> CompileResult {
        if self.classes.is_empty() {
            self.error("'super' used outside a class".to_string());
            return Err(());
        }
        self.consume(TokenKind::Dot, "expected '.' after 'super'".to_string().as_str());
        self.consume(TokenKind::Identifier, "expected superclass method name".to_string().as_str());
        let name = self.previous.lexeme.to_string();
        self.named_variable_readonly("self");
        let line = self.line();
        let idx = self.name_constant(&name);
        self.chunk().emit_indexed(Op::GetSuper, idx, line);
        Ok(())
    }

    fn grouping_or_tuple(&mut self) -> CompileResult {
        if self.matches(TokenKind::RightParen) {
            let line = self.line();
            self.chunk().write_op(Op::Tuple, line);
            self.chunk().write_byte(0, line);
            return Ok(());
        }
        self.expression()?;
        let mut count = 1;
        let mut is_tuple = false;
        while self.matches(TokenKind::Comma) {
            is_tuple = true;
            if self.check(TokenKind::RightParen) {
                break;
            }
            self.expression()?;
            count += 1;
        }
        self.consume(TokenKind::RightParen, "expected ')'".to_string().as_str());
        if is_tuple {
            let line = self.line();
            self.chunk().write_op(Op::Tuple, line);
            self.chunk().write_byte(count as u8, line);
        }
        Ok(())
    }

    fn list_or_comprehension(&mut self) -> CompileResult {
        self.named_variable_readonly("list");
        if self.check(TokenKind::RightBracket) {
            self.advance();
            let line = self.line();
            self.chunk().write_op(Op::Tuple, line);
            self.chunk().write_byte(0, line);
            self.chunk().write_op(Op::Call, line);
            self.chunk().write_byte(1, line);
            return Ok(());
        }
        let checkpoint = self.tell();
        let saved_current = self.current;
        let saved_previous = self.previous;
        self.advance();
        let probe_start = self.chunk().code.len();
        let first_expr_ok = self.parse_precedence(Prec::Ternary).is_ok();
        if first_expr_ok && self.check(TokenKind::For) {
            self.chunk().code.truncate(probe_start);
            self.rewind(checkpoint);
            self.current = saved_current;
            self.previous = saved_previous;
            self.advance();
            return self.compile_comprehension(CollectionKind::List);
        }
        // Not a comprehension: the probe already compiled the first element.
        let mut count = 1;
        while self.matches(TokenKind::Comma) {
            if self.check(TokenKind::RightBracket) {
                break;
            }
            self.expression()?;
            count += 1;
        }
        self.consume(TokenKind::RightBracket, "expected ']'".to_string().as_str());
        let line = self.line();
        self.chunk().write_op(Op::Tuple, line);
        self.chunk().write_byte(count as u8, line);
        self.chunk().write_op(Op::Call, line);
        self.chunk().write_byte(1, line);
        Ok(())
    }

    fn dict_or_set(&mut self) -> CompileResult {
        if self.matches(TokenKind::RightBrace) {
            self.named_variable_readonly("dict");
            let line = self.line();
            self.chunk().write_op(Op::Tuple, line);
            self.chunk().write_byte(0, line);
            self.chunk().write_op(Op::Call, line);
            self.chunk().write_byte(1, line);
            return Ok(());
        }
        let checkpoint = self.tell();
        let saved_current = self.current;
        let saved_previous = self.previous;
        self.advance();
        let probe_start = self.chunk().code.len();
        let key_ok = self.parse_precedence(Prec::Ternary).is_ok();
        let is_dict_entry = key_ok && self.check(TokenKind::Colon);
        let mut value_ok = true;
        if is_dict_entry {
            self.advance();
            value_ok = self.parse_precedence(Prec::Ternary).is_ok();
        }
        if key_ok && value_ok && self.check(TokenKind::For) {
            self.chunk().code.truncate(probe_start);
            self.rewind(checkpoint);
            self.current = saved_current;
            self.previous = saved_previous;
            self.advance();
            if is_dict_entry {
                self.consume(TokenKind::Colon, "expected ':'".to_string().as_str());
                return self.compile_dict_comprehension();
            }
            return self.compile_comprehension(CollectionKind::Set);
        }
        let ctor = if is_dict_entry { "dict" } else { "set" };
        let mut count = 1;
        loop {
            if !self.matches(TokenKind::Comma) {
                break;
            }
            if self.check(TokenKind::RightBrace) {
                break;
            }
            if is_dict_entry {
                self.expression()?;
                self.consume(TokenKind::Colon, "expected ':' in dict literal".to_string().as_str());
                self.expression()?;
                count += 1;
            } else {
                self.expression()?;
                count += 1;
            }
        }
        self.consume(TokenKind::RightBrace, "expected '}'".to_string().as_str());
        let line = self.line();
        let tuple_items = if is_dict_entry { count * 2 } else { count };
        self.chunk().write_op(Op::Tuple, line);
        self.chunk().write_byte(tuple_items as u8, line);
        self.named_variable_readonly(ctor);
        let line = self.line();
        self.chunk().write_op(Op::Swap, line);
        let line = self.line();
        self.chunk().write_op(Op::Call, line);
        let line = self.line();
        self.chunk().write_byte(1, line);
        Ok(())
    }

    /// Lowers `[expr for var in iter (if cond)*]`/`{expr for ...}` into: build
    /// an empty accumulator, loop the iterator via the same `__iter__`/
    /// `__next__` protocol as a `for` statement (exhaustion signaled by
    /// `__next__` returning the iterator itself), binding the loop
    /// variable(s) each pass, and append each item that survives any `if`
    /// guards.
    fn compile_comprehension(&mut self, kind: CollectionKind) -> CompileResult {
        let ctor_name = match kind {
            CollectionKind::List => "list",
            CollectionKind::Set => "set",
        };
        self.named_variable_readonly(ctor_name);
        let line = self.line();
        self.chunk().write_op(Op::Tuple, line);
        self.chunk().write_byte(0, line);
        self.chunk().write_op(Op::Call, line);
        self.chunk().write_byte(1, line);

        self.begin_scope();
        let acc_slot = self.declare_local("__acc".into());

        self.consume(TokenKind::For, "expected 'for' in comprehension".to_string().as_str());
        let mut vars = vec![self.parse_let_target()?];
        while self.matches(TokenKind::Comma) {
            vars.push(self.parse_let_target()?);
        }
        self.consume(TokenKind::In, "expected 'in' in comprehension".to_string().as_str());
        self.expression()?;
        let line = self.line();
        let iter_idx = self.name_constant("__iter__");
        self.chunk().emit_indexed(Op::GetProperty, iter_idx, line);
        self.chunk().write_op(Op::Call, line);
        self.chunk().write_byte(0, line);
        self.begin_scope();
        self.declare_local("__iter".into());

        let loop_start = self.chunk().code.len();
        let iter_slot =
            self.resolve_local(self.frames.len() - 1, "__iter").expect("just declared");
        let line = self.line();
        self.chunk().emit_indexed(Op::GetLocal, iter_slot, line);
        let next_idx = self.name_constant("__next__");
        self.chunk().emit_indexed(Op::GetProperty, next_idx, line);
        self.chunk().write_op(Op::Call, line);
        self.chunk().write_byte(0, line);
        self.chunk().emit_indexed(Op::GetLocal, iter_slot, line);
        self.chunk().write_op(Op::Is, line);
        let exit_jump = self.chunk().emit_jump(Op::JumpIfTrue, line);
        self.chunk().write_op(Op::Pop, line);

        self.begin_scope();
        if vars.len() == 1 {
            self.declare_local(vars[0].clone());
        } else {
            let n = vars.len();
            let line = self.line();
            self.chunk().write_op(Op::Unpack, line);
            self.chunk().write_byte(n as u8, line);
            for v in vars.into_iter().rev() {
                self.declare_local(v);
            }
        }

        let mut guard_jumps = Vec::new();
        while self.matches(TokenKind::If) {
            self.expression()?;
            let line = self.line();
            let skip = self.chunk().emit_jump(Op::JumpIfFalse, line);
            self.chunk().write_op(Op::Pop, line);
            guard_jumps.push(skip);
        }

        let line = self.line();
        self.chunk().emit_indexed(Op::GetLocal, acc_slot, line);
        let append_idx = self.name_constant("append");
        self.chunk().emit_indexed(Op::GetProperty, append_idx, line);
        self.expression()?;
        let line = self.line();
        self.chunk().write_op(Op::Call, line);
        self.chunk().write_byte(1, line);
        self.chunk().write_op(Op::Pop, line);

        for jump in guard_jumps {
            self.chunk().patch_jump(jump);
            let line = self.line();
            self.chunk().write_op(Op::Pop, line);
        }
        self.end_scope();
        let line = self.line();
        self.chunk().emit_loop(loop_start, line);
        self.chunk().patch_jump(exit_jump);
        let line = self.line();
        self.chunk().write_op(Op::Pop, line);
        self.end_scope();
        self.consume(TokenKind::RightBracket, "expected closing bracket".to_string().as_str());

        let line = self.line();
        self.chunk().emit_indexed(Op::GetLocal, acc_slot, line);
        self.end_scope();
        Ok(())
    }

    fn compile_dict_comprehension(&mut self) -> CompileResult {
        // The probe already consumed `key : value`; recompile it for real
        // the same way `compile_comprehension` does for a single expression,
        // by treating `key, value` as a two-item accumulation via `__setitem__`.
        self.named_variable_readonly("dict");
        let line = self.line();
        self.chunk().write_op(Op::Tuple, line);
        self.chunk().write_byte(0, line);
        self.chunk().write_op(Op::Call, line);
        self.chunk().write_byte(1, line);
        self.begin_scope();
        let acc_slot = self.declare_local("__acc".into());

        self.consume(TokenKind::For, "expected 'for' in comprehension".to_string().as_str());
        let mut vars = vec![self.parse_let_target()?];
        while self.matches(TokenKind::Comma) {
            vars.push(self.parse_let_target()?);
        }
        self.consume(TokenKind::In, "expected 'in' in comprehension".to_string().as_str());
        self.expression()?;
        let line = self.line();
        let iter_idx = self.name_constant("__iter__");
        self.chunk().emit_indexed(Op::GetProperty, iter_idx, line);
        self.chunk().write_op(Op::Call, line);
        self.chunk().write_byte(0, line);
        self.begin_scope();
        self.declare_local("__iter".into());

        let loop_start = self.chunk().code.len();
        let iter_slot =
            self.resolve_local(self.frames.len() - 1, "__iter").expect("just declared");
        let line = self.line();
        self.chunk().emit_indexed(Op::GetLocal, iter_slot, line);
        let next_idx = self.name_constant("__next__");
        self.chunk().emit_indexed(Op::GetProperty, next_idx, line);
        self.chunk().write_op(Op::Call, line);
        self.chunk().write_byte(0, line);
        self.chunk().emit_indexed(Op::GetLocal, iter_slot, line);
        self.chunk().write_op(Op::Is, line);
        let exit_jump = self.chunk().emit_jump(Op::JumpIfTrue, line);
        self.chunk().write_op(Op::Pop, line);

        self.begin_scope();
        if vars.len() == 1 {
            self.declare_local(vars[0].clone());
        } else {
            let n = vars.len();
            let line = self.line();
            self.chunk().write_op(Op::Unpack, line);
            self.chunk().write_byte(n as u8, line);
            for v in vars.into_iter().rev() {
                self.declare_local(v);
            }
        }

        let mut guard_jumps = Vec::new();
        while self.matches(TokenKind::If) {
            self.expression()?;
            let line = self.line();
            let skip = self.chunk().emit_jump(Op::JumpIfFalse, line);
            self.chunk().write_op(Op::Pop, line);
            guard_jumps.push(skip);
        }

        let line = self.line();
        self.chunk().emit_indexed(Op::GetLocal, acc_slot, line);
        self.expression()?; // key
        self.consume(TokenKind::Colon, "expected ':' in dict comprehension".to_string().as_str());
        self.expression()?; // value
        let line = self.line();
        self.chunk().write_op(Op::InvokeSetter, line);

        for jump in guard_jumps {
            self.chunk().patch_jump(jump);
            let line = self.line();
            self.chunk().write_op(Op::Pop, line);
        }
        self.end_scope();
        let line = self.line();
        self.chunk().emit_loop(loop_start, line);
        self.chunk().patch_jump(exit_jump);
        let line = self.line();
        self.chunk().write_op(Op::Pop, line);
        self.end_scope();
        self.consume(TokenKind::RightBrace, "expected '}'".to_string().as_str());

        let line = self.line();
        self.chunk().emit_indexed(Op::GetLocal, acc_slot, line);
        self.end_scope();
        Ok(())
    }

    fn dot(&mut self, can_assign: bool) -> CompileResult {
        self.consume(TokenKind::Identifier, "expected property name after '.'".to_string().as_str());
        let name = self.previous.lexeme.to_string();
        let line = self.line();
        if self.in_del {
            let idx = self.name_constant(&name);
            self.chunk().emit_indexed(Op::DelProperty, idx, line);
            return Ok(());
        }
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression()?;
            let line = self.line();
            let idx = self.name_constant(&name);
            self.chunk().emit_indexed(Op::SetProperty, idx, line);
        } else if can_assign && self.matches_compound_assign() {
            let compound = self.previous.kind;
            self.chunk().write_op(Op::Dup, line);
            self.chunk().write_byte(1, line);
            let idx = self.name_constant(&name);
            self.chunk().emit_indexed(Op::GetProperty, idx, line);
            self.compound_rhs(compound)?;
            let line = self.line();
            self.chunk().emit_indexed(Op::SetProperty, idx, line);
        } else {
            let idx = self.name_constant(&name);
            self.chunk().emit_indexed(Op::GetProperty, idx, line);
        }
        Ok(())
    }

    fn subscript(&mut self, can_assign: bool) -> CompileResult {
        let is_slice = self.parse_slice_or_index()?;
        let line = self.line();
        self.consume(TokenKind::RightBracket, "expected ']'".to_string().as_str());
        if self.in_del {
            if is_slice {
                self.chunk().write_op(Op::InvokeDelSlice, line);
            } else {
                self.chunk().write_op(Op::InvokeDelete, line);
            }
            return Ok(());
        }
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression()?;
            let line = self.line();
            if is_slice {
                self.chunk().write_op(Op::InvokeSetSlice, line);
            } else {
                self.chunk().write_op(Op::InvokeSetter, line);
            }
        } else if can_assign && self.matches_compound_assign() {
            let compound = self.previous.kind;
            let line = self.line();
            self.chunk().write_op(Op::Dup, line);
            self.chunk().write_byte(if is_slice { 4 } else { 2 }, line);
            if is_slice {
                self.chunk().write_op(Op::InvokeGetSlice, line);
            } else {
                self.chunk().write_op(Op::InvokeGetter, line);
            }
            self.compound_rhs(compound)?;
            let line = self.line();
            if is_slice {
                self.chunk().write_op(Op::InvokeSetSlice, line);
            } else {
                self.chunk().write_op(Op::InvokeSetter, line);
            }
        } else if is_slice {
            self.chunk().write_op(Op::InvokeGetSlice, line);
        } else {
            self.chunk().write_op(Op::InvokeGetter, line);
        }
        Ok(())
    }

    /// Parses the bracketed portion of a subscript (already past `[`),
    /// leaving `object, key` (index) or `object, start, stop, step` (slice)
    /// on the stack. Returns whether a slice form was parsed.
    fn parse_slice_or_index(&mut self) -> Result<bool, ()> {
        let line = self.line();
        if self.check(TokenKind::Colon) {
            self.chunk().write_op(Op::None, line);
        } else {
            self.expression()?;
        }
        if !self.matches(TokenKind::Colon) {
            return Ok(false);
        }
        let line = self.line();
        if self.check(TokenKind::Colon) || self.check(TokenKind::RightBracket) {
            self.chunk().write_op(Op::None, line);
        } else {
            self.expression()?;
        }
        let line = self.line();
        if self.matches(TokenKind::Colon) {
            if self.check(TokenKind::RightBracket) {
                self.chunk().write_op(Op::None, line);
            } else {
                self.expression()?;
            }
        } else {
            self.chunk().write_op(Op::None, line);
        }
        Ok(true)
    }

    fn call(&mut self) -> CompileResult {
        let mut positional = 0usize;
        let mut kw_pairs = 0usize;
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.matches(TokenKind::StarStar) {
                    self.expression()?;
                    let line = self.line();
                    let sentinel = self.chunk().add_constant(Value::Kwargs(kwargs::DICT));
                    self.chunk().emit_indexed(Op::Constant, sentinel, line);
                    self.chunk().write_op(Op::Swap, line);
                    kw_pairs += 1;
                } else if self.matches(TokenKind::Star) {
                    self.expression()?;
                    let line = self.line();
                    let sentinel = self.chunk().add_constant(Value::Kwargs(kwargs::LIST));
                    self.chunk().emit_indexed(Op::Constant, sentinel, line);
                    self.chunk().write_op(Op::Swap, line);
                    kw_pairs += 1;
                } else if self.check(TokenKind::Identifier) && self.peeks_kwarg() {
                    self.advance();
                    let key_name: Rc<str> = self.previous.lexeme.into();
                    self.advance(); // consume '='
                    let key_value = self.heap.new_str_value(&key_name);
                    let idx = self.chunk().add_constant(key_value);
                    let line = self.line();
                    self.chunk().emit_indexed(Op::Constant, idx, line);
                    self.expression()?;
                    kw_pairs += 1;
                } else {
                    self.expression()?;
                    positional += 1;
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments".to_string().as_str());
        let line = self.line();
        if kw_pairs > 0 {
            self.chunk().write_op(Op::Kwargs, line);
            self.chunk().write_byte(kw_pairs as u8, line);
        }
        self.chunk().write_op(Op::Call, line);
        self.chunk().write_byte(positional as u8, line);
        Ok(())
    }

    /// Looks past the current `Identifier` token to see whether it is
    /// immediately followed by a bare `=` (a keyword argument), without
    /// consuming anything if not.
    fn peeks_kwarg(&mut self) -> bool {
        let checkpoint = self.tell();
        let saved_current = self.current;
        let name_lexeme = self.current.lexeme;
        let _ = name_lexeme;
        self.advance();
        let is_kw = self.check(TokenKind::Equal);
        self.rewind(checkpoint);
        self.current = saved_current;
        is_kw
    }

    fn lambda(&mut self) -> CompileResult {
        self.frames.push(FrameState::new(FunctionType::Lambda, "<lambda>".into(), self.filename.clone()));
        self.begin_scope();
        if !self.check(TokenKind::Colon) {
            loop {
                self.consume(TokenKind::Identifier, "expected parameter name".to_string().as_str());
                let pname: Rc<str> = self.previous.lexeme.into();
                self.declare_local(pname.clone());
                self.frame().required_args.push(pname);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::Colon, "expected ':' after lambda parameters".to_string().as_str());
        self.expression()?;
        let line = self.line();
        self.chunk().write_op(Op::Return, line);
        let (function, upvalues) = self.finish_function(Some(FunctionType::Lambda));
        self.emit_closure(function, upvalues)
    }

    // ---- literals -------------------------------------------------------------

    fn int_literal(&mut self) -> CompileResult {
        let text = self.previous.lexeme;
        let value = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            i64::from_str_radix(hex, 16)
        } else if let Some(bin) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
            i64::from_str_radix(bin, 2)
        } else if let Some(oct) = text.strip_prefix("0o").or_else(|| text.strip_prefix("0O")) {
            i64::from_str_radix(oct, 8)
        } else {
            text.replace('_', "").parse::<i64>()
        };
        let value = value.unwrap_or_else(|_| {
            self.error(format!("invalid integer literal '{}'", text));
            0
        });
        let line = self.line();
        self.chunk().emit_constant(Value::Int(value), line);
        Ok(())
    }

    fn float_literal(&mut self) -> CompileResult {
        let text = self.previous.lexeme.replace('_', "");
        let value = text.parse::<f64>().unwrap_or_else(|_| {
            self.error(format!("invalid float literal '{}'", text));
            0.0
        });
        let line = self.line();
        self.chunk().emit_constant(Value::Float(value), line);
        Ok(())
    }

    fn strip_quotes(text: &str) -> (&str, bool) {
        if let Some(rest) = text.strip_prefix("\"\"\"").and_then(|r| r.strip_suffix("\"\"\"")) {
            (rest, true)
        } else if let Some(rest) = text.strip_prefix("'''").and_then(|r| r.strip_suffix("'''")) {
            (rest, true)
        } else if let Some(rest) = text.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
            (rest, false)
        } else if let Some(rest) = text.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
            (rest, false)
        } else {
            (text, false)
        }
    }

    fn unescape(raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut chars = raw.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('0') => out.push('\0'),
                Some('\\') => out.push('\\'),
                Some('\'') => out.push('\''),
                Some('"') => out.push('"'),
                Some('\n') => {}
                Some(other) => out.push(other),
                Some(_) => {}
                None => {}
            }
        }
        out
    }

    fn string_literal(&mut self) -> CompileResult {
        let (raw, _triple) = Self::strip_quotes(self.previous.lexeme);
        let text = Self::unescape(raw);
        let value = self.heap.new_str_value(&text);
        let line = self.line();
        self.chunk().emit_constant(value, line);
        Ok(())
    }

    fn bytes_literal(&mut self) -> CompileResult {
        let lexeme = self.previous.lexeme;
        let after_prefix = &lexeme[1..]; // strip leading 'b'
        let (raw, _triple) = Self::strip_quotes(after_prefix);
        let text = Self::unescape(raw);
        let bytes = text.into_bytes();
        let obj = self.heap.new_bytes(bytes);
        let line = self.line();
        self.chunk().emit_constant(Value::Obj(obj), line);
        Ok(())
    }

    /// Compiles an f-string by splitting its raw text on `{expr}` segments:
    /// literal runs become string constants, each `{...}` segment is compiled
    /// by recursing into a fresh sub-compiler over just that substring so the
    /// real scanner never has to re-enter mid-token. The pieces are summed
    /// with `Add` the same way plain string concatenation is.
    fn fstring_literal(&mut self) -> CompileResult {
        let lexeme = self.previous.lexeme;
        let after_prefix = &lexeme[1..]; // strip leading 'f'
        let (raw, _triple) = Self::strip_quotes(after_prefix);
        let line = self.line();

        let mut parts: Vec<FStringPart> = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '{' {
                if let Some(&(_, '{')) = chars.peek() {
                    chars.next();
                    literal.push('{');
                    continue;
                }
                if !literal.is_empty() {
                    parts.push(FStringPart::Literal(std::mem::take(&mut literal)));
                }
                let start = i + 1;
                let mut depth = 1;
                let mut end = raw.len();
                for (j, c2) in chars.by_ref() {
                    if c2 == '{' {
                        depth += 1;
                    } else if c2 == '}' {
                        depth -= 1;
                        if depth == 0 {
                            end = j;
                            break;
                        }
                    }
                }
                parts.push(FStringPart::Expr(raw[start..end].to_string()));
            } else if c == '}' {
                if let Some(&(_, '}')) = chars.peek() {
                    chars.next();
                    literal.push('}');
                }
            } else {
                literal.push(c);
            }
        }
        if !literal.is_empty() {
            parts.push(FStringPart::Literal(literal));
        }
        if parts.is_empty() {
            let value = self.heap.new_str_value("");
            self.chunk().emit_constant(value, line);
            return Ok(());
        }

        let mut count = 0;
        for part in parts {
            match part {
                FStringPart::Literal(text) => {
                    let unescaped = Self::unescape(&text);
                    let value = self.heap.new_str_value(&unescaped);
                    self.chunk().emit_constant(value, line);
                }
                FStringPart::Expr(src) => {
                    let (expr_src, conversion) = Self::split_fstring_segment(&src);
                    self.compile_fstring_segment(expr_src)?;
                    let conv_fn = if conversion == Some('r') { "repr" } else { "str" };
                    self.named_variable_readonly(conv_fn);
                    let line = self.line();
                    self.chunk().write_op(Op::Swap, line);
                    let line = self.line();
                    self.chunk().write_op(Op::Call, line);
                    let line = self.line();
                    self.chunk().write_byte(1, line);
                }
            }
            count += 1;
        }
        for _ in 1..count {
            let line = self.line();
            self.chunk().write_op(Op::Add, line);
        }
        Ok(())
    }

    /// Splits a `{...}` segment's raw text into its expression part and an
    /// optional `!s`/`!r` conversion flag, stopping at whichever of a
    /// top-level `!conv` or `:format_spec` comes first (a bare `:` with no
    /// recognized conversion just trims a format spec, which isn't otherwise
    /// implemented). Ignores `!`/`:` that occur inside nested brackets or
    /// string literals, so `{d[0:1]}` and `{a != b}` aren't misparsed.
    fn split_fstring_segment(src: &str) -> (&str, Option<char>) {
        let mut depth: i32 = 0;
        let mut quote: Option<char> = None;
        let mut chars = src.char_indices().peekable();
        while let Some((pos, c)) = chars.next() {
            if let Some(q) = quote {
                if c == '\\' {
                    chars.next();
                } else if c == q {
                    quote = None;
                }
                continue;
            }
            match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                '!' if depth == 0 => {
                    let mut lookahead = chars.clone();
                    if let Some((_, conv_c)) = lookahead.next() {
                        if conv_c == 's' || conv_c == 'r' {
                            let at_end = matches!(lookahead.next(), None | Some((_, ':')));
                            if at_end {
                                return (&src[..pos], Some(conv_c));
                            }
                        }
                    }
                }
                ':' if depth == 0 => return (&src[..pos], None),
                _ => {}
            }
        }
        (src, None)
    }

    /// Compiles a `{expr}` segment extracted from an f-string by running a
    /// fresh scanner over just that substring inside a hidden zero-arg
    /// function frame, so the surrounding scanner's position is untouched.
    fn compile_fstring_segment(&mut self, src: &str) -> CompileResult {
        let outer_scanner = std::mem::replace(&mut self.scanner, Scanner::new(""));
        let outer_previous = self.previous;
        let outer_current = self.current;
        self.scanner = Scanner::new(src);
        self.advance();
        let result = self.expression();
        self.scanner = outer_scanner;
        self.previous = outer_previous;
        self.current = outer_current;
        result
    }
}

enum CollectionKind {
    List,
    Set,
}

enum FStringPart {
    Literal(String),
    Expr(String),
}
