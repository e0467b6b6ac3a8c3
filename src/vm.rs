// File: src/vm.rs
//
// The bytecode interpreter: value stack, call-frame stack, exception
// unwinding via side-registered handlers, `with`-statement cleanup, upvalue
// closing, generator suspend/resume, and method/operator dispatch. Consumes
// a `Chunk` the compiler produced; never inspects source text itself.
//
// Handler markers (`Op::PushTry`/`Op::PushWith`) are not control transfers in
// the non-exceptional path -- they register a `RuntimeHandler` in
// `Vm::handlers` (a side stack, not the operand stack; see value.rs's note on
// why `Handler` values never actually live there) and fall through to the
// next instruction. Only `unwind()` ever jumps to a handler's target.

use crate::builtins::Classes;
use crate::chunk::Op;
use crate::heap::{GcRoots, Heap};
use crate::object::{
    Callable, GeneratorState, NativeFn, NativeKind, NativeStorage, Obj, RClosure, RFunction,
    RGenerator, UpvalueState,
};
use crate::table::Table;
use crate::value::{kwargs, HandlerKind, ObjRef, Value};
use std::rc::Rc;

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    /// Stack index of local slot 0 (the first declared parameter/local).
    /// There is no reserved callee slot: the callee value itself lives one
    /// slot below, at `base - 1`.
    base: usize,
    /// When set, `Op::Return`'s popped value is discarded and this is pushed
    /// instead -- how a call to `__init__` always yields the instance
    /// regardless of what the (always-bare) `return` inside it produced.
    substitute_return: Option<Value>,
    /// Set only for a frame resumed from a suspended generator, so
    /// `Op::Yield` knows which generator object to save its state into.
    generator: Option<ObjRef>,
}

#[derive(Clone, Copy)]
struct RuntimeHandler {
    kind: HandlerKind,
    target: usize,
    frame_index: usize,
    stack_floor: usize,
}

pub type VmResult<T> = Result<T, Value>;

pub struct Vm {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    handlers: Vec<RuntimeHandler>,
    open_upvalues: Vec<ObjRef>,
    pub classes: Classes,
    /// Free functions and root classes every freshly loaded module's globals
    /// table is seeded with; see `crate::module`.
    pub builtin_globals: Vec<(Rc<str>, Value)>,
    main_module: ObjRef,
    /// Staged `key, value` pairs from a `Kwargs <n>` instruction, consumed by
    /// the `Call` that immediately follows it.
    pending_kwargs: Option<Vec<Value>>,
    /// Set while `unwind()` is walking back to a `With` handler, so
    /// `CleanupWith` knows to re-raise after running `__exit__` instead of
    /// falling through to the next instruction.
    unwinding: Option<Value>,
    /// Modules already loaded, keyed by the dotted/bare name an `import`
    /// statement resolved. See `module.rs`.
    pub(crate) module_cache: std::collections::HashMap<String, ObjRef>,
    /// Names currently being loaded, for circular-import detection.
    pub(crate) loading_stack: Vec<String>,
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let (classes, builtin_globals) = crate::builtins::install(&mut heap);
        let main_module = heap.new_instance(classes.module);
        heap.set_immortal(main_module);
        let mut vm = Vm {
            heap,
            stack: Vec::new(),
            frames: Vec::new(),
            handlers: Vec::new(),
            open_upvalues: Vec::new(),
            classes,
            builtin_globals,
            main_module,
            pending_kwargs: None,
            unwinding: None,
            module_cache: std::collections::HashMap::new(),
            loading_stack: Vec::new(),
        };
        vm.seed_module_globals(main_module);
        vm
    }

    pub fn seed_module_globals(&mut self, module: ObjRef) {
        let entries = self.builtin_globals.clone();
        for (name, value) in entries {
            let key = self.heap.new_str_value(&name);
            self.heap.instance_field_set(module, key, value);
        }
    }

    pub fn new_module(&mut self, name: &str) -> ObjRef {
        let m = self.heap.new_instance(self.classes.module);
        let name_key = self.heap.new_str_value("__name__");
        let name_val = self.heap.new_str_value(name);
        self.heap.instance_field_set(m, name_key, name_val);
        self.seed_module_globals(m);
        m
    }

    pub fn main_module(&self) -> ObjRef {
        self.main_module
    }

    // ---- public entry points -------------------------------------------

    /// Runs a freshly compiled top-level `Function` as the program's module
    /// body, against `self.main_module`'s globals.
    pub fn interpret(&mut self, function: RFunction) -> VmResult<Value> {
        let main = self.main_module;
        self.interpret_in_module(function, main)
    }

    pub fn interpret_in_module(&mut self, mut function: RFunction, module: ObjRef) -> VmResult<Value> {
        function.globals_context = Some(module);
        let func_ref = self.heap.new_function(function);
        let closure_ref = self.heap.new_closure(RClosure { function: func_ref, upvalues: Vec::new() });
        self.stack.push(Value::Obj(closure_ref));
        let floor = self.frames.len();
        self.push_frame(closure_ref, 1, None, None)?;
        self.run(floor)
    }

    /// Invokes any callable value from outside the bytecode loop (natives,
    /// the REPL, internal protocol calls that aren't already inside `run`).
    pub fn call(&mut self, callee: Value, args: &[Value]) -> VmResult<Value> {
        self.invoke_value(callee, None, args)
    }

    // ---- stack/frame plumbing -------------------------------------------

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, back: usize) -> Value {
        self.stack[self.stack.len() - 1 - back]
    }

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    fn current_closure(&self) -> &RClosure {
        match self.heap.get(self.current_frame().closure) {
            Obj::Closure(c) => c,
            _ => unreachable!("frame closure is always a Closure"),
        }
    }

    fn current_function(&self) -> &RFunction {
        let func_ref = self.current_closure().function;
        match self.heap.get(func_ref) {
            Obj::Function(f) => f,
            _ => unreachable!("closure always references a Function"),
        }
    }

    fn current_module(&self) -> ObjRef {
        self.current_function().globals_context.unwrap_or(self.main_module)
    }

    fn push_frame(
        &mut self,
        closure_ref: ObjRef,
        base: usize,
        substitute_return: Option<Value>,
        generator: Option<ObjRef>,
    ) -> VmResult<()> {
        if self.frames.len() >= 1024 {
            return Err(self.runtime_error("RecursionError", "maximum recursion depth exceeded"));
        }
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, base, substitute_return, generator });
        Ok(())
    }

    // ---- bytecode decode --------------------------------------------------

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let func_ref = match self.heap.get(frame.closure) {
            Obj::Closure(c) => c.function,
            _ => unreachable!(),
        };
        let byte = match self.heap.get(func_ref) {
            Obj::Function(f) => f.chunk.code[frame.ip],
            _ => unreachable!(),
        };
        frame.ip += 1;
        byte
    }

    fn read_operand(&mut self, len: usize) -> usize {
        match len {
            0 => 0,
            1 => self.read_byte() as usize,
            2 => {
                let lo = self.read_byte() as usize;
                let hi = self.read_byte() as usize;
                lo | (hi << 8)
            }
            3 => {
                let b0 = self.read_byte() as usize;
                let b1 = self.read_byte() as usize;
                let b2 = self.read_byte() as usize;
                b0 | (b1 << 8) | (b2 << 16)
            }
            _ => unreachable!(),
        }
    }

    fn constant(&self, idx: usize) -> Value {
        let func_ref = self.current_closure().function;
        match self.heap.get(func_ref) {
            Obj::Function(f) => f.chunk.constants[idx],
            _ => unreachable!(),
        }
    }

    // ---- the dispatch loop -------------------------------------------------

    /// Runs until `self.frames.len() <= floor`, returning the value the
    /// completing frame left behind. An exception not caught by any handler
    /// belonging to a frame `>= floor` propagates out as `Err` instead, for
    /// an enclosing (lower-floor) `run` -- or the top-level entry point --
    /// to handle.
    fn run(&mut self, floor: usize) -> VmResult<Value> {
        loop {
            if self.frames.len() <= floor {
                return Ok(self.stack.pop().unwrap_or(Value::None));
            }
            match self.step() {
                Ok(Some(value)) if self.frames.len() <= floor => return Ok(value),
                Ok(_) => {}
                Err(exc) => {
                    if !self.unwind(exc, floor)? {
                        return Err(exc);
                    }
                }
            }
        }
    }

    /// Executes one instruction. Returns `Ok(Some(value))` only when this
    /// instruction popped the frame `run`'s floor is watching for (a
    /// `Return` or a generator `Yield`), so `run` can notice completion
    /// without re-checking frame depth from scratch.
    fn step(&mut self) -> VmResult<Option<Value>> {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        let raw = self.read_byte();
        let decoded = Op::from_u8(raw).expect("bad opcode byte");
        let operand_len = decoded.operand_len();
        let operand = self.read_operand(operand_len);
        let op = decoded.short_form().unwrap_or(decoded);

        match op {
            Op::Add => self.dispatch_add()?,
            Op::Subtract | Op::Multiply | Op::Divide | Op::Modulo | Op::Pow => self.binary_arith(op)?,
            Op::BitAnd | Op::BitOr | Op::BitXor | Op::ShiftLeft | Op::ShiftRight => self.binary_int(op)?,
            Op::BitNegate => {
                let v = self.pop();
                match v {
                    Value::Int(i) => self.push(Value::Int(!i)),
                    _ => return Err(self.runtime_error("TypeError", "bad operand type for unary ~")),
                }
            }
            Op::Negate => {
                let v = self.pop();
                match v {
                    Value::Int(i) => self.push(Value::Int(-i)),
                    Value::Float(f) => self.push(Value::Float(-f)),
                    _ => return Err(self.runtime_error("TypeError", "bad operand type for unary -")),
                }
            }
            Op::Not => {
                let v = self.pop();
                self.push(Value::Bool(!v.truthy()));
            }
            Op::Equal => {
                let b = self.pop();
                let a = self.pop();
                let eq = self.values_equal_dispatch(a, b)?;
                self.push(Value::Bool(eq));
            }
            Op::Less | Op::Greater => {
                let b = self.pop();
                let a = self.pop();
                let ord = self.compare(a, b)?;
                let r = if op == Op::Less { ord < 0 } else { ord > 0 };
                self.push(Value::Bool(r));
            }
            Op::Is => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(self.heap.same(a, b)));
            }
            Op::True => self.push(Value::Bool(true)),
            Op::False => self.push(Value::Bool(false)),
            Op::None => self.push(Value::None),
            Op::Pop => {
                self.pop();
            }
            Op::Swap => {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            Op::Dup => {
                let n = operand.max(1);
                let len = self.stack.len();
                for i in 0..n {
                    self.push(self.stack[len - n + i]);
                }
            }
            Op::Constant => self.push(self.constant(operand)),
            Op::Tuple => {
                let n = operand;
                let len = self.stack.len();
                let items: Vec<Value> = self.stack[len - n..].to_vec();
                self.stack.truncate(len - n);
                let t = self.heap.new_tuple(items);
                self.push(Value::Obj(t));
            }
            Op::Unpack => {
                let v = self.pop();
                let items = self.iterable_snapshot(v)?;
                for item in items.iter().rev() {
                    self.push(*item);
                }
            }
            Op::GetLocal => {
                let slot = self.current_frame().base + operand;
                self.push(self.stack[slot]);
            }
            Op::SetLocal => {
                let slot = self.current_frame().base + operand;
                self.stack[slot] = self.peek(0);
            }
            Op::GetUpvalue => {
                let up_ref = self.current_closure().upvalues[operand];
                let v = self.read_upvalue(up_ref);
                self.push(v);
            }
            Op::SetUpvalue => {
                let up_ref = self.current_closure().upvalues[operand];
                let v = self.peek(0);
                self.write_upvalue(up_ref, v);
            }
            Op::CloseUpvalue => {
                let idx = self.stack.len() - 1;
                self.close_upvalues_from(idx);
                self.pop();
            }
            Op::GetGlobal => {
                let name = self.constant(operand);
                let module = self.current_module();
                match self.heap.instance_field_get(module, name) {
                    Some(v) => self.push(v),
                    None => {
                        let n = self.value_name(name).to_string();
                        return Err(self.runtime_error("NameError", &format!("name '{n}' is not defined")));
                    }
                }
            }
            Op::DefineGlobal | Op::SetGlobal => {
                let name = self.constant(operand);
                let module = self.current_module();
                let v = self.peek(0);
                self.heap.instance_field_set(module, name, v);
            }
            Op::DelGlobal => {
                let name = self.constant(operand);
                let module = self.current_module();
                if !self.heap.instance_field_delete(module, name) {
                    let n = self.value_name(name).to_string();
                    return Err(self.runtime_error("NameError", &format!("name '{n}' is not defined")));
                }
            }
            Op::GetProperty => {
                let name = self.constant(operand);
                let recv = self.pop();
                let v = self.get_attribute(recv, name)?;
                self.push(v);
            }
            Op::SetProperty => {
                let name = self.constant(operand);
                let value = self.pop();
                let recv = self.pop();
                self.set_attribute(recv, name, value)?;
                self.push(value);
            }
            Op::DelProperty => {
                let name = self.constant(operand);
                let recv = self.pop();
                self.del_attribute(recv, name)?;
                self.push(Value::None);
            }
            Op::InvokeGetter => {
                let index = self.pop();
                let recv = self.pop();
                let v = self.invoke_getitem(recv, index)?;
                self.push(v);
            }
            Op::InvokeSetter => {
                let value = self.pop();
                let index = self.pop();
                let recv = self.pop();
                self.invoke_setitem(recv, index, value)?;
                self.push(value);
            }
            Op::InvokeDelete => {
                let index = self.pop();
                let recv = self.pop();
                self.invoke_delitem(recv, index)?;
                self.push(Value::None);
            }
            Op::InvokeGetSlice => {
                let end = self.pop();
                let start = self.pop();
                let recv = self.pop();
                let v = self.invoke_getslice(recv, start, end)?;
                self.push(v);
            }
            Op::InvokeSetSlice => {
                let value = self.pop();
                let end = self.pop();
                let start = self.pop();
                let recv = self.pop();
                self.invoke_setslice(recv, start, end, value)?;
                self.push(value);
            }
            Op::InvokeDelSlice => {
                let end = self.pop();
                let start = self.pop();
                let recv = self.pop();
                self.invoke_delslice(recv, start, end)?;
                self.push(Value::None);
            }
            Op::GetSuper => {
                let name = self.constant(operand);
                let receiver = self.pop();
                let v = self.get_super(receiver, name)?;
                self.push(v);
            }
            Op::Class => {
                let name = self.constant(operand);
                let name_str: Rc<str> = Rc::from(self.value_name(name).to_string());
                let class_ref = self.heap.new_class(name_str, None);
                self.push(Value::Obj(class_ref));
            }
            Op::Inherit => {
                let base_val = self.pop();
                let class_val = self.peek(0);
                let class_ref = class_val.as_obj().expect("Inherit operand always a Class");
                let base_ref = match base_val {
                    Value::None => self.classes.object,
                    Value::Obj(r) if matches!(self.heap.get(r), Obj::Class(_)) => r,
                    _ => return Err(self.runtime_error("TypeError", "base must be a class")),
                };
                if let Obj::Class(c) = self.heap.get_mut(class_ref) {
                    c.base = Some(base_ref);
                }
            }
            Op::Method => {
                let name = self.constant(operand);
                let method = self.pop();
                let class_val = self.peek(0);
                let class_ref = class_val.as_obj().expect("Method operand always a Class");
                self.heap.class_set_method(class_ref, name, method);
            }
            Op::CreateProperty => {
                let getter = self.pop();
                let prop_ref = self.heap.new_property(getter);
                self.push(Value::Obj(prop_ref));
            }
            Op::Closure => {
                let func_val = self.constant(operand);
                let func_ref = func_val.as_obj().expect("Closure operand always a Function");
                let (upvalue_count, module) = match self.heap.get(func_ref) {
                    Obj::Function(f) => (f.upvalue_count, f.globals_context),
                    _ => unreachable!(),
                };
                if module.is_none() {
                    let current = self.current_module();
                    if let Obj::Function(f) = self.heap.get_mut(func_ref) {
                        f.globals_context = Some(current);
                    }
                }
                let mut upvalues = Vec::with_capacity(upvalue_count);
                for _ in 0..upvalue_count {
                    let is_local = self.read_byte() != 0;
                    let index = self.read_byte() as usize;
                    if is_local {
                        let stack_index = self.current_frame().base + index;
                        upvalues.push(self.capture_upvalue(stack_index));
                    } else {
                        upvalues.push(self.current_closure().upvalues[index]);
                    }
                }
                let closure_ref = self.heap.new_closure(RClosure { function: func_ref, upvalues });
                self.push(Value::Obj(closure_ref));
            }
            Op::Call => {
                if let Some(value) = self.dispatch_call(operand)? {
                    self.push(value);
                }
            }
            Op::CallStack => unreachable!("CallStack is never emitted by the compiler"),
            Op::Kwargs => {
                let n = operand;
                let len = self.stack.len();
                let trailer: Vec<Value> = self.stack[len - 2 * n..].to_vec();
                self.stack.truncate(len - 2 * n);
                self.pending_kwargs = Some(trailer);
            }
            Op::ExpandArgs | Op::Inc => {
                unreachable!("{op:?} is never emitted by the compiler")
            }
            Op::Import => {
                let path = self.constant(operand);
                let path_str = self.value_name(path).to_string();
                let module = self.load_module(&path_str)?;
                self.push(Value::Obj(module));
            }
            Op::ImportFrom => {
                let name = self.constant(operand);
                let module_val = self.pop();
                let module_ref = module_val.as_obj().expect("ImportFrom operand always a module Instance");
                match self.heap.instance_field_get(module_ref, name) {
                    Some(v) => self.push(v),
                    None => {
                        let n = self.value_name(name).to_string();
                        return Err(self.runtime_error("ImportError", &format!("cannot import name '{n}'")));
                    }
                }
            }
            Op::Raise => {
                let exc = self.pop();
                return Err(exc);
            }
            Op::ExceptMatch => {
                let class_or_none = self.pop();
                let exc = self.peek(0);
                let matched = match class_or_none {
                    Value::None => true,
                    Value::Obj(r) if matches!(self.heap.get(r), Obj::Class(_)) => self.heap.is_instance_of(exc, r),
                    _ => false,
                };
                self.push(Value::Bool(matched));
            }
            Op::PushTry => {
                let target = self.current_frame().ip + operand;
                self.handlers.push(RuntimeHandler {
                    kind: HandlerKind::Try,
                    target,
                    frame_index: self.frames.len() - 1,
                    stack_floor: self.stack.len(),
                });
            }
            Op::PushWith => {
                let target = self.current_frame().ip + operand;
                self.handlers.push(RuntimeHandler {
                    kind: HandlerKind::With,
                    target,
                    frame_index: self.frames.len() - 1,
                    stack_floor: self.stack.len() - 1,
                });
            }
            Op::CleanupWith => {
                if let Some(h) = self.handlers.pop() {
                    let cm = self.stack[h.stack_floor];
                    self.run_exit(cm)?;
                }
                if let Some(exc) = self.unwinding.take() {
                    return Err(exc);
                }
            }
            Op::Jump => {
                self.current_frame_mut().ip += operand;
            }
            Op::JumpIfFalse => {
                if !self.peek(0).truthy() {
                    self.current_frame_mut().ip += operand;
                }
            }
            Op::JumpIfTrue => {
                if self.peek(0).truthy() {
                    self.current_frame_mut().ip += operand;
                }
            }
            Op::Loop => {
                self.current_frame_mut().ip -= operand;
            }
            Op::Yield => return self.do_yield(),
            Op::Return => return self.do_return(),
            Op::Docstring | Op::Finalize => {
                // Never emitted by the compiler.
            }
            _ => unreachable!("unhandled opcode in dispatch: {op:?}"),
        }
        Ok(None)
    }

    fn do_return(&mut self) -> VmResult<Option<Value>> {
        let value = self.pop();
        let frame = self.frames.pop().expect("Return with no active frame");
        self.close_upvalues_from(frame.base - 1);
        self.stack.truncate(frame.base - 1);
        let result = frame.substitute_return.unwrap_or(value);
        self.push(result);
        Ok(Some(result))
    }

    /// Suspends the generator frame executing this `yield`: saves its local
    /// region and resume point into the owning `RGenerator`, pops the frame,
    /// and hands the yielded value back -- matching `Op::Return`'s contract
    /// closely enough that `run`'s floor check treats both uniformly.
    fn do_yield(&mut self) -> VmResult<Option<Value>> {
        let value = self.pop();
        let frame = self.frames.pop().expect("Yield with no active frame");
        let gen_ref = frame.generator.expect("Yield outside a resumed generator frame");
        self.close_upvalues_from(frame.base);
        let locals: Vec<Value> = self.stack.split_off(frame.base);
        self.stack.truncate(frame.base - 1);
        self.heap.with_generator(gen_ref, |g| {
            g.saved_stack = locals;
            g.ip = frame.ip;
            g.state = GeneratorState::Suspended;
        });
        self.push(value);
        Ok(Some(value))
    }

    // ---- arithmetic & comparison -----------------------------------------

    fn binary_arith(&mut self, op: Op) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        let result = match (a, b) {
            (Value::Int(x), Value::Int(y)) => match op {
                Op::Subtract => Value::Int(x.wrapping_sub(y)),
                Op::Multiply => Value::Int(x.wrapping_mul(y)),
                Op::Divide => {
                    if y == 0 {
                        return Err(self.runtime_error("ZeroDivisionError", "division by zero"));
                    }
                    Value::Float(x as f64 / y as f64)
                }
                Op::Modulo => {
                    if y == 0 {
                        return Err(self.runtime_error("ZeroDivisionError", "modulo by zero"));
                    }
                    Value::Int(x.rem_euclid(y))
                }
                Op::Pow => Value::Float((x as f64).powf(y as f64)),
                _ => unreachable!(),
            },
            (Value::Int(x), Value::Float(y)) => self.float_arith(op, x as f64, y)?,
            (Value::Float(x), Value::Int(y)) => self.float_arith(op, x, y as f64)?,
            (Value::Float(x), Value::Float(y)) => self.float_arith(op, x, y)?,
            _ => return Err(self.runtime_error("TypeError", "unsupported operand types")),
        };
        self.push(result);
        Ok(())
    }

    fn float_arith(&mut self, op: Op, x: f64, y: f64) -> VmResult<Value> {
        Ok(match op {
            Op::Subtract => Value::Float(x - y),
            Op::Multiply => Value::Float(x * y),
            Op::Divide => {
                if y == 0.0 {
                    return Err(self.runtime_error("ZeroDivisionError", "division by zero"));
                }
                Value::Float(x / y)
            }
            Op::Modulo => Value::Float(x.rem_euclid(y)),
            Op::Pow => Value::Float(x.powf(y)),
            _ => unreachable!(),
        })
    }

    /// `+` is handled separately from the other arithmetic ops because it
    /// overloads onto string/tuple/list concatenation.
    fn dispatch_add(&mut self) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => self.push(Value::Int(x.wrapping_add(y))),
            (Value::Int(x), Value::Float(y)) => self.push(Value::Float(x as f64 + y)),
            (Value::Float(x), Value::Int(y)) => self.push(Value::Float(x + y as f64)),
            (Value::Float(x), Value::Float(y)) => self.push(Value::Float(x + y)),
            (Value::Obj(ra), Value::Obj(rb)) => {
                let strs = match (self.heap.get(ra), self.heap.get(rb)) {
                    (Obj::Str(sa), Obj::Str(sb)) => Some((sa.as_str().to_string(), sb.as_str().to_string())),
                    _ => None,
                };
                if let Some((a, b)) = strs {
                    let v = self.heap.new_str_value(&(a + &b));
                    self.push(v);
                    return Ok(());
                }
                let tuples = match (self.heap.get(ra), self.heap.get(rb)) {
                    (Obj::Tuple(xs), Obj::Tuple(ys)) => Some((xs.clone(), ys.clone())),
                    _ => None,
                };
                if let Some((xs, mut ys)) = tuples {
                    let mut items = xs;
                    items.append(&mut ys);
                    let t = self.heap.new_tuple(items);
                    self.push(Value::Obj(t));
                    return Ok(());
                }
                if self.is_list(ra) && self.is_list(rb) {
                    let mut items = self.heap.list_snapshot(ra).unwrap_or_default();
                    items.extend(self.heap.list_snapshot(rb).unwrap_or_default());
                    let class = self.classes.list;
                    let l = self.heap.new_list(class, items);
                    self.push(Value::Obj(l));
                    return Ok(());
                }
                Err(self.runtime_error("TypeError", "unsupported operand types for +"))?
            }
            _ => return Err(self.runtime_error("TypeError", "unsupported operand types for +")),
        }
        Ok(())
    }

    fn is_list(&self, r: ObjRef) -> bool {
        self.heap.instance_class(r).and_then(|c| self.heap.native_kind_of(c)) == Some(NativeKind::List)
    }

    fn is_dict(&self, r: ObjRef) -> bool {
        self.heap.instance_class(r).and_then(|c| self.heap.native_kind_of(c)) == Some(NativeKind::Dict)
    }

    fn binary_int(&mut self, op: Op) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        let (x, y) = match (a, b) {
            (Value::Int(x), Value::Int(y)) => (x, y),
            _ => return Err(self.runtime_error("TypeError", "bitwise operators require int operands")),
        };
        let result = match op {
            Op::BitAnd => x & y,
            Op::BitOr => x | y,
            Op::BitXor => x ^ y,
            Op::ShiftLeft => x.wrapping_shl(y as u32),
            Op::ShiftRight => x.wrapping_shr(y as u32),
            _ => unreachable!(),
        };
        self.push(Value::Int(result));
        Ok(())
    }

    fn compare(&mut self, a: Value, b: Value) -> VmResult<i32> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(x.cmp(&y) as i32),
            (Value::Float(x), Value::Float(y)) => Ok(partial_cmp_i32(x, y)),
            (Value::Int(x), Value::Float(y)) => Ok(partial_cmp_i32(x as f64, y)),
            (Value::Float(x), Value::Int(y)) => Ok(partial_cmp_i32(x, y as f64)),
            (Value::Obj(ra), Value::Obj(rb)) => {
                let strs = match (self.heap.get(ra), self.heap.get(rb)) {
                    (Obj::Str(sa), Obj::Str(sb)) => Some(sa.as_str().cmp(sb.as_str()) as i32),
                    _ => None,
                };
                strs.ok_or_else(|| self.runtime_error_val("TypeError", "unorderable types"))
            }
            _ => Err(self.runtime_error("TypeError", "unorderable types")),
        }
    }

    fn values_equal_dispatch(&mut self, a: Value, b: Value) -> VmResult<bool> {
        if let Value::Obj(_) = a {
            if let Some(class) = self.class_of(a) {
                if let Some(eq) = self.resolve_dunder_on(class, |d| d.eq) {
                    let result = self.invoke_value(Value::Obj(eq), Some(a), &[b])?;
                    return Ok(result.truthy());
                }
            }
        }
        Ok(self.heap.values_equal(a, b))
    }

    // ---- attributes & subscripting -----------------------------------------

    fn class_of(&self, v: Value) -> Option<ObjRef> {
        match v {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Instance(i) => Some(i.class),
                Obj::Str(_) => Some(self.classes.str_),
                Obj::Bytes(_) => Some(self.classes.bytes),
                Obj::Tuple(_) => Some(self.classes.tuple),
                Obj::Closure(_) | Obj::Function(_) => Some(self.classes.function),
                Obj::BoundMethod(_) => Some(self.classes.method),
                Obj::Class(_) => Some(self.classes.object),
                Obj::Property(_) => Some(self.classes.property),
                Obj::Upvalue(_) => None,
                Obj::Native(_) => Some(self.classes.function),
            },
            Value::None => Some(self.classes.object),
            Value::Bool(_) => Some(self.classes.bool_),
            Value::Int(_) => Some(self.classes.int_),
            Value::Float(_) => Some(self.classes.float_),
            Value::Handler(_) | Value::Kwargs(_) => None,
        }
    }

    fn resolve_dunder_on(&self, class: ObjRef, pick: impl Fn(&crate::object::DunderSlots) -> Option<ObjRef>) -> Option<ObjRef> {
        match self.heap.get(class) {
            Obj::Class(c) => pick(&c.dunders),
            _ => None,
        }
    }

    fn get_attribute(&mut self, recv: Value, name: Value) -> VmResult<Value> {
        if let Value::Obj(r) = recv {
            if let Obj::Instance(inst) = self.heap.get(r) {
                if let Some(v) = inst.fields.get(&self.heap, name) {
                    return Ok(v);
                }
            }
        }
        let class = self
            .class_of(recv)
            .ok_or_else(|| self.runtime_error_val("AttributeError", "object has no attributes"))?;
        if let Some(m) = self.heap.resolve_method(class, name) {
            return Ok(self.bind_method(recv, m));
        }
        let class_field = match self.heap.get(class) {
            Obj::Class(c) => c.fields.get(&self.heap, name),
            _ => None,
        };
        if let Some(v) = class_field {
            return Ok(v);
        }
        if let Some(getattr) = self.resolve_dunder_on(class, |d| d.getattr) {
            return self.invoke_value(Value::Obj(getattr), Some(recv), &[name]);
        }
        let n = self.value_name(name).to_string();
        let tn = self.type_name(recv);
        Err(self.runtime_error("AttributeError", &format!("'{tn}' object has no attribute '{n}'")))
    }

    fn bind_method(&mut self, recv: Value, method: Value) -> Value {
        match method {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Closure(_) => Value::Obj(self.heap.new_bound_method(recv, Callable::Closure(r))),
                Obj::Native(_) => Value::Obj(self.heap.new_bound_method(recv, Callable::Native(r))),
                Obj::Property(p) => {
                    let getter = p.getter;
                    self.invoke_value(getter, Some(recv), &[]).unwrap_or(Value::None)
                }
                _ => method,
            },
            _ => method,
        }
    }

    fn set_attribute(&mut self, recv: Value, name: Value, value: Value) -> VmResult<()> {
        if let Value::Obj(r) = recv {
            if matches!(self.heap.get(r), Obj::Instance(_)) {
                self.heap.instance_field_set(r, name, value);
                return Ok(());
            }
            if matches!(self.heap.get(r), Obj::Class(_)) {
                self.heap.class_set_field(r, name, value);
                return Ok(());
            }
        }
        Err(self.runtime_error("AttributeError", "object does not support attribute assignment"))
    }

    fn del_attribute(&mut self, recv: Value, name: Value) -> VmResult<()> {
        if let Value::Obj(r) = recv {
            if self.heap.instance_field_delete(r, name) {
                return Ok(());
            }
        }
        let n = self.value_name(name).to_string();
        Err(self.runtime_error("AttributeError", &format!("no attribute '{n}' to delete")))
    }

    /// Single-level `super()`: resolves the method from the receiver's
    /// *runtime* class's base. Correct for a direct subclass calling
    /// `super()`; a method inherited from a grandparent that itself calls
    /// `super()` would re-resolve from the same immediate base rather than
    /// walking further up -- acceptable for the single-inheritance depth
    /// this language actually exposes in its class statement.
    fn get_super(&mut self, receiver: Value, name: Value) -> VmResult<Value> {
        let class = self.class_of(receiver).ok_or_else(|| self.runtime_error_val("TypeError", "no class"))?;
        let base = match self.heap.get(class) {
            Obj::Class(c) => c.base,
            _ => None,
        };
        let base = base.unwrap_or(self.classes.object);
        let m = self
            .heap
            .resolve_method(base, name)
            .ok_or_else(|| self.runtime_error_val("AttributeError", "no such method in base class"))?;
        Ok(self.bind_method(receiver, m))
    }

    fn invoke_getitem(&mut self, recv: Value, index: Value) -> VmResult<Value> {
        if let Value::Obj(r) = recv {
            if self.is_list(r) {
                let idx = self.index_as_usize(recv, index)?;
                return self
                    .heap
                    .with_list(r, |v| v.get(idx).copied())
                    .flatten()
                    .ok_or_else(|| self.runtime_error_val("IndexError", "list index out of range"));
            }
            if self.is_dict(r) {
                return self
                    .heap
                    .with_dict(r, |t, h| t.get(h, index))
                    .flatten()
                    .ok_or_else(|| self.runtime_error_val("KeyError", "key not found"));
            }
            let tuple_item = match self.heap.get(r) {
                Obj::Tuple(items) => Some(items.clone()),
                _ => None,
            };
            if let Some(items) = tuple_item {
                let idx = self.index_as_usize(recv, index)?;
                return items
                    .get(idx)
                    .copied()
                    .ok_or_else(|| self.runtime_error_val("IndexError", "tuple index out of range"));
            }
            let str_char = match self.heap.get(r) {
                Obj::Str(s) => Some(s.codepoints()),
                _ => None,
            };
            if let Some(codepoints) = str_char {
                let idx = self.index_as_usize(recv, index)?;
                let c = codepoints[idx];
                return Ok(self.heap.new_str_value(&c.to_string()));
            }
        }
        let class = self
            .class_of(recv)
            .ok_or_else(|| self.runtime_error_val("TypeError", "object is not subscriptable"))?;
        if let Some(getitem) = self.resolve_dunder_on(class, |d| d.getitem) {
            return self.invoke_value(Value::Obj(getitem), Some(recv), &[index]);
        }
        Err(self.runtime_error("TypeError", "object is not subscriptable"))
    }

    fn invoke_setitem(&mut self, recv: Value, index: Value, value: Value) -> VmResult<()> {
        if let Value::Obj(r) = recv {
            if self.is_list(r) {
                let idx = self.index_as_usize(recv, index)?;
                let ok = self.heap.with_list(r, |v| {
                    if idx < v.len() {
                        v[idx] = value;
                        true
                    } else {
                        false
                    }
                });
                return if ok == Some(true) {
                    Ok(())
                } else {
                    Err(self.runtime_error("IndexError", "list assignment index out of range"))
                };
            }
            if self.is_dict(r) {
                self.heap.with_dict(r, |t, h| t.set(h, index, value));
                return Ok(());
            }
        }
        let class = self
            .class_of(recv)
            .ok_or_else(|| self.runtime_error_val("TypeError", "object does not support item assignment"))?;
        if let Some(setitem) = self.resolve_dunder_on(class, |d| d.setitem) {
            self.invoke_value(Value::Obj(setitem), Some(recv), &[index, value])?;
            return Ok(());
        }
        Err(self.runtime_error("TypeError", "object does not support item assignment"))
    }

    fn invoke_delitem(&mut self, recv: Value, index: Value) -> VmResult<()> {
        if let Value::Obj(r) = recv {
            if self.is_list(r) {
                let idx = self.index_as_usize(recv, index)?;
                let ok = self.heap.with_list(r, |v| {
                    if idx < v.len() {
                        v.remove(idx);
                        true
                    } else {
                        false
                    }
                });
                return if ok == Some(true) {
                    Ok(())
                } else {
                    Err(self.runtime_error("IndexError", "list index out of range"))
                };
            }
            if self.is_dict(r) {
                let removed = self.heap.with_dict(r, |t, h| t.delete(h, index)).unwrap_or(false);
                return if removed {
                    Ok(())
                } else {
                    Err(self.runtime_error("KeyError", "key not found"))
                };
            }
        }
        let class = self
            .class_of(recv)
            .ok_or_else(|| self.runtime_error_val("TypeError", "object does not support item deletion"))?;
        if let Some(delitem) = self.resolve_dunder_on(class, |d| d.delitem) {
            self.invoke_value(Value::Obj(delitem), Some(recv), &[index])?;
            return Ok(());
        }
        Err(self.runtime_error("TypeError", "object does not support item deletion"))
    }

    fn slice_bounds(&mut self, len: usize, start: Value, end: Value) -> VmResult<(usize, usize)> {
        let s = match start {
            Value::None => 0,
            Value::Int(i) => normalize_index(i, len),
            _ => return Err(self.runtime_error("TypeError", "slice indices must be integers")),
        };
        let e = match end {
            Value::None => len,
            Value::Int(i) => normalize_index(i, len),
            _ => return Err(self.runtime_error("TypeError", "slice indices must be integers")),
        };
        let s = s.min(len);
        let e = e.min(len).max(s);
        Ok((s, e))
    }

    fn invoke_getslice(&mut self, recv: Value, start: Value, end: Value) -> VmResult<Value> {
        if let Value::Obj(r) = recv {
            if self.is_list(r) {
                let items = self.heap.list_snapshot(r).unwrap_or_default();
                let (s, e) = self.slice_bounds(items.len(), start, end)?;
                let class = self.classes.list;
                let l = self.heap.new_list(class, items[s..e].to_vec());
                return Ok(Value::Obj(l));
            }
            let codepoints = match self.heap.get(r) {
                Obj::Str(st) => Some(st.codepoints()),
                _ => None,
            };
            if let Some(codepoints) = codepoints {
                let (s, e) = self.slice_bounds(codepoints.len(), start, end)?;
                let text: String = codepoints[s..e].iter().collect();
                return Ok(self.heap.new_str_value(&text));
            }
        }
        let class = self.class_of(recv).ok_or_else(|| self.runtime_error_val("TypeError", "object is not sliceable"))?;
        if let Some(getslice) = self.resolve_dunder_on(class, |d| d.getslice) {
            return self.invoke_value(Value::Obj(getslice), Some(recv), &[start, end]);
        }
        Err(self.runtime_error("TypeError", "object is not sliceable"))
    }

    fn invoke_setslice(&mut self, recv: Value, start: Value, end: Value, value: Value) -> VmResult<()> {
        if let Value::Obj(r) = recv {
            if self.is_list(r) {
                let replacement = self.iterable_snapshot(value)?;
                let len = self.heap.list_snapshot(r).map(|v| v.len()).unwrap_or(0);
                let (s, e) = self.slice_bounds(len, start, end)?;
                self.heap.with_list(r, |v| {
                    v.splice(s..e, replacement.iter().copied());
                });
                return Ok(());
            }
        }
        let class = self
            .class_of(recv)
            .ok_or_else(|| self.runtime_error_val("TypeError", "object does not support slice assignment"))?;
        if let Some(setslice) = self.resolve_dunder_on(class, |d| d.setslice) {
            self.invoke_value(Value::Obj(setslice), Some(recv), &[start, end, value])?;
            return Ok(());
        }
        Err(self.runtime_error("TypeError", "object does not support slice assignment"))
    }

    fn invoke_delslice(&mut self, recv: Value, start: Value, end: Value) -> VmResult<()> {
        if let Value::Obj(r) = recv {
            if self.is_list(r) {
                let len = self.heap.list_snapshot(r).map(|v| v.len()).unwrap_or(0);
                let (s, e) = self.slice_bounds(len, start, end)?;
                self.heap.with_list(r, |v| {
                    v.drain(s..e);
                });
                return Ok(());
            }
        }
        let class = self
            .class_of(recv)
            .ok_or_else(|| self.runtime_error_val("TypeError", "object does not support slice deletion"))?;
        if let Some(delslice) = self.resolve_dunder_on(class, |d| d.delslice) {
            self.invoke_value(Value::Obj(delslice), Some(recv), &[start, end])?;
            return Ok(());
        }
        Err(self.runtime_error("TypeError", "object does not support slice deletion"))
    }

    fn index_as_usize(&mut self, recv: Value, index: Value) -> VmResult<usize> {
        let Value::Int(i) = index else {
            return Err(self.runtime_error("TypeError", "indices must be integers"));
        };
        let len = self.len_of(recv)?;
        let idx = normalize_index(i, len);
        if idx >= len {
            return Err(self.runtime_error("IndexError", "index out of range"));
        }
        Ok(idx)
    }

    fn len_of(&mut self, v: Value) -> VmResult<usize> {
        if let Value::Obj(r) = v {
            let immediate = match self.heap.get(r) {
                Obj::Str(s) => Some(s.char_len),
                Obj::Bytes(b) => Some(b.len()),
                Obj::Tuple(t) => Some(t.len()),
                Obj::Instance(inst) => match &inst.native {
                    Some(NativeStorage::List(v)) => Some(v.len()),
                    Some(NativeStorage::Dict(t)) | Some(NativeStorage::Set(t)) => Some(t.len()),
                    _ => None,
                },
                _ => None,
            };
            if let Some(n) = immediate {
                return Ok(n);
            }
        }
        let class = self.class_of(v).ok_or_else(|| self.runtime_error_val("TypeError", "object has no len()"))?;
        if let Some(len_fn) = self.resolve_dunder_on(class, |d| d.len) {
            let result = self.invoke_value(Value::Obj(len_fn), Some(v), &[])?;
            if let Value::Int(i) = result {
                return Ok(i.max(0) as usize);
            }
        }
        Err(self.runtime_error("TypeError", "object has no len()"))
    }

    pub(crate) fn iterable_snapshot(&mut self, v: Value) -> VmResult<Vec<Value>> {
        if let Value::Obj(r) = v {
            let tuple = match self.heap.get(r) {
                Obj::Tuple(t) => Some(t.clone()),
                _ => None,
            };
            if let Some(t) = tuple {
                return Ok(t);
            }
            let chars = match self.heap.get(r) {
                Obj::Str(s) => Some(s.codepoints()),
                _ => None,
            };
            if let Some(codepoints) = chars {
                return Ok(codepoints.iter().map(|c| self.heap.new_str_value(&c.to_string())).collect());
            }
            if self.is_list(r) {
                return Ok(self.heap.list_snapshot(r).unwrap_or_default());
            }
        }
        let mut out = Vec::new();
        let iter_name = self.name_value("__iter__");
        let next_name = self.name_value("__next__");
        let iter_fn = self.get_attribute(v, iter_name)?;
        let cursor = self.invoke_value(iter_fn, None, &[])?;
        loop {
            let next_fn = self.get_attribute(cursor, next_name)?;
            let item = self.invoke_value(next_fn, None, &[])?;
            if self.heap.same(item, cursor) {
                break;
            }
            out.push(item);
        }
        Ok(out)
    }

    fn name_value(&mut self, s: &str) -> Value {
        self.heap.new_str_value(s)
    }

    fn value_name(&self, v: Value) -> &str {
        match v {
            Value::Obj(r) => self.heap.as_str(r).unwrap_or("?"),
            _ => "?",
        }
    }

    pub fn type_name(&self, v: Value) -> &'static str {
        match v {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Handler(_) => "handler",
            Value::Kwargs(_) => "kwargs",
            Value::Obj(r) => self.heap.get(r).type_name(),
        }
    }

    // ---- calling convention -------------------------------------------------

    /// Executes `Op::Call <argc>`. `Ok(Some(value))` means the call already
    /// completed synchronously (native function, or zero-arg class with no
    /// `__init__`) and the result still needs pushing; `Ok(None)` means a new
    /// frame was pushed and the main loop should simply continue.
    fn dispatch_call(&mut self, argc: usize) -> VmResult<Option<Value>> {
        let kw_trailer = self.pending_kwargs.take();
        let (positional, named) = self.expand_kwpairs(argc, kw_trailer)?;
        let callee = self.pop();
        for v in &positional {
            self.push(*v);
        }
        self.call_value(callee, positional.len(), named)
    }

    /// Expands the `Kwargs` trailer (`key, value` pairs, with `*list`/`**dict`
    /// spreads marked by the `kwargs::LIST`/`kwargs::DICT` sentinel keys) plus
    /// the already-pushed positional args into a flat positional vec and a
    /// named `(key, value)` vec.
    fn expand_kwpairs(&mut self, argc: usize, trailer: Option<Vec<Value>>) -> VmResult<(Vec<Value>, Vec<(Value, Value)>)> {
        let len = self.stack.len();
        let mut positional: Vec<Value> = self.stack[len - argc..].to_vec();
        self.stack.truncate(len - argc);
        let mut named = Vec::new();
        if let Some(pairs) = trailer {
            for chunk in pairs.chunks(2) {
                let (key, value) = (chunk[0], chunk[1]);
                match key {
                    Value::Kwargs(kwargs::LIST) => positional.extend(self.iterable_snapshot(value)?),
                    Value::Kwargs(kwargs::DICT) => {
                        if let Value::Obj(r) = value {
                            if self.is_dict(r) {
                                let pairs = match self.heap.get(r) {
                                    Obj::Instance(inst) => match &inst.native {
                                        Some(NativeStorage::Dict(t)) => Some(t.iter().collect::<Vec<_>>()),
                                        _ => None,
                                    },
                                    _ => None,
                                };
                                if let Some(pairs) = pairs {
                                    named.extend(pairs);
                                }
                            }
                        }
                    }
                    _ => named.push((key, value)),
                }
            }
        }
        Ok((positional, named))
    }

    fn call_value(&mut self, callee: Value, argc: usize, named: Vec<(Value, Value)>) -> VmResult<Option<Value>> {
        match callee {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Closure(_) => {
                    self.call_closure(r, argc, named, None)?;
                    Ok(None)
                }
                Obj::Native(_) => self.call_native(r, argc, named).map(Some),
                Obj::Class(_) => self.instantiate_class(r, argc, named),
                Obj::BoundMethod(b) => {
                    let (receiver, method) = (b.receiver, b.method);
                    let base = self.stack.len() - argc;
                    self.stack.insert(base, receiver);
                    match method {
                        Callable::Closure(c) => {
                            self.call_closure(c, argc + 1, named, None)?;
                            Ok(None)
                        }
                        Callable::Native(n) => self.call_native(n, argc + 1, named).map(Some),
                    }
                }
                Obj::Instance(inst) => {
                    let class = inst.class;
                    if let Some(call) = self.resolve_dunder_on(class, |d| d.call) {
                        let base = self.stack.len() - argc;
                        self.stack.insert(base, callee);
                        self.call_closure(call, argc + 1, named, None)?;
                        Ok(None)
                    } else {
                        Err(self.runtime_error("TypeError", "object is not callable"))
                    }
                }
                _ => Err(self.runtime_error("TypeError", "object is not callable")),
            },
            _ => Err(self.runtime_error("TypeError", "object is not callable")),
        }
    }

    /// Binds the already-pushed `argc` positional args (callee already
    /// consumed by the caller) into a fresh frame's locals, in the fixed
    /// canonical order `required_args`, then `keyword_args`, then a
    /// `collects_args` rest-list, then a `collects_kwargs` rest-dict.
    fn call_closure(
        &mut self,
        closure_ref: ObjRef,
        argc: usize,
        named: Vec<(Value, Value)>,
        substitute_return: Option<Value>,
    ) -> VmResult<()> {
        let func_ref = match self.heap.get(closure_ref) {
            Obj::Closure(c) => c.function,
            _ => unreachable!(),
        };
        let (required, keyword, collects_args, collects_kwargs, is_generator, name) = match self.heap.get(func_ref) {
            Obj::Function(f) => (
                f.required_args.clone(),
                f.keyword_args.clone(),
                f.collects_args,
                f.collects_kwargs,
                f.is_generator,
                f.name.clone(),
            ),
            _ => unreachable!(),
        };
        let base = self.stack.len() - argc;
        let mut args: Vec<Value> = self.stack[base..].to_vec();
        self.stack.truncate(base);

        let required_n = required.len();
        let mut named_map: std::collections::HashMap<String, Value> = named
            .into_iter()
            .map(|(k, v)| (self.value_name(k).to_string(), v))
            .collect();

        self.push(Value::Obj(closure_ref));
        let frame_base = self.stack.len();

        for (i, pname) in required.iter().enumerate() {
            let v = if i < args.len().min(required_n) {
                args[i]
            } else if let Some(v) = named_map.remove(&**pname) {
                v
            } else {
                return Err(self.runtime_error("ArgumentError", &format!("{name}() missing argument '{pname}'")));
            };
            self.push(v);
        }
        let extra_positional: Vec<Value> = if args.len() > required_n {
            args.split_off(required_n)
        } else {
            Vec::new()
        };
        let mut extra_iter = extra_positional.into_iter();
        for pname in &keyword {
            let v = extra_iter
                .next()
                .or_else(|| named_map.remove(&**pname))
                .unwrap_or(Value::Kwargs(kwargs::UNSET_DEFAULT));
            self.push(v);
        }
        if collects_args {
            let rest: Vec<Value> = extra_iter.collect();
            let class = self.classes.list;
            let l = self.heap.new_list(class, rest);
            self.push(Value::Obj(l));
        }
        if collects_kwargs {
            let class = self.classes.dict;
            let d = self.heap.new_dict(class);
            for (k, v) in named_map {
                let key = self.heap.new_str_value(&k);
                self.heap.with_dict(d, |t, h| t.set(h, key, v));
            }
            self.push(Value::Obj(d));
        }

        if is_generator {
            let locals: Vec<Value> = self.stack.split_off(frame_base);
            self.stack.truncate(frame_base - 1);
            let gen_class = self.classes.generator;
            let gen_ref = self.heap.new_generator(gen_class, closure_ref);
            self.heap.with_generator(gen_ref, |g| g.saved_stack = locals);
            self.push(Value::Obj(gen_ref));
            return Ok(());
        }

        self.push_frame(closure_ref, frame_base, substitute_return, None)
    }

    fn call_native(&mut self, native_ref: ObjRef, argc: usize, named: Vec<(Value, Value)>) -> VmResult<Value> {
        let func = match self.heap.get(native_ref) {
            Obj::Native(n) => n.func,
            _ => unreachable!(),
        };
        let len = self.stack.len();
        let mut args: Vec<Value> = self.stack[len - argc..].to_vec();
        self.stack.truncate(len - argc);
        let has_kwargs = !named.is_empty();
        if has_kwargs {
            let class = self.classes.dict;
            let d = self.heap.new_dict(class);
            for (k, v) in named {
                self.heap.with_dict(d, |t, h| t.set(h, k, v));
            }
            args.push(Value::Obj(d));
        }
        self.call_native_fn(func, &args, has_kwargs)
    }

    fn call_native_fn(&mut self, func: NativeFn, args: &[Value], has_kwargs: bool) -> VmResult<Value> {
        func(self, args, has_kwargs)
    }

    /// Internal helper for operator/protocol dispatch (`__eq__`, `__iter__`,
    /// `__enter__`, ...) and the public `call()` entry point: invokes a
    /// value synchronously and gets its result back, without going through
    /// the `Op::Call` bytecode path. `receiver`, if given, is prepended as
    /// the first positional argument (for an unbound method resolved via
    /// `resolve_method` rather than already-bound through `bind_method`).
    pub fn invoke_value(&mut self, callee: Value, receiver: Option<Value>, args: &[Value]) -> VmResult<Value> {
        let argc = args.len() + if receiver.is_some() { 1 } else { 0 };
        if let Some(r) = receiver {
            self.push(r);
        }
        for a in args {
            self.push(*a);
        }
        let floor = self.frames.len();
        match self.call_value(callee, argc, Vec::new())? {
            Some(v) => Ok(v),
            None => self.run(floor),
        }
    }

    fn instantiate_class(&mut self, class_ref: ObjRef, argc: usize, named: Vec<(Value, Value)>) -> VmResult<Option<Value>> {
        let instance_ref = self.heap.new_instance(class_ref);
        if let Some(kind) = self.heap.native_kind_of(class_ref) {
            let storage = match kind {
                NativeKind::List => Some(NativeStorage::List(Vec::new())),
                NativeKind::Dict => Some(NativeStorage::Dict(Table::new())),
                NativeKind::Set => Some(NativeStorage::Set(Table::new())),
                NativeKind::BytesBuilder => Some(NativeStorage::Bytes(Vec::new())),
                // Generators are only ever produced by `call_closure`'s
                // `is_generator` branch, never through generic instantiation.
                NativeKind::Generator => None,
            };
            if let (Some(storage), Obj::Instance(i)) = (storage, self.heap.get_mut(instance_ref)) {
                i.native = Some(storage);
            }
        }
        let instance_val = Value::Obj(instance_ref);
        let init_name = self.heap.peek_interned("__init__");
        let init = init_name.and_then(|n| self.heap.resolve_method(class_ref, n));
        match init {
            Some(Value::Obj(init_ref)) if matches!(self.heap.get(init_ref), Obj::Closure(_)) => {
                let base = self.stack.len() - argc;
                self.stack.insert(base, instance_val);
                self.call_closure(init_ref, argc + 1, named, Some(instance_val))?;
                Ok(None)
            }
            Some(Value::Obj(init_ref)) if matches!(self.heap.get(init_ref), Obj::Native(_)) => {
                let base = self.stack.len() - argc;
                self.stack.insert(base, instance_val);
                self.call_native(init_ref, argc + 1, named)?;
                Ok(Some(instance_val))
            }
            _ => {
                let len = self.stack.len();
                self.stack.truncate(len - argc);
                Ok(Some(instance_val))
            }
        }
    }

    // ---- upvalues -----------------------------------------------------------

    fn capture_upvalue(&mut self, stack_index: usize) -> ObjRef {
        for &r in &self.open_upvalues {
            if let Obj::Upvalue(u) = self.heap.get(r) {
                if u.stack_index() == Some(stack_index) {
                    return r;
                }
            }
        }
        let r = self.heap.new_upvalue_open(stack_index);
        self.open_upvalues.push(r);
        r
    }

    fn read_upvalue(&self, r: ObjRef) -> Value {
        match self.heap.get(r) {
            Obj::Upvalue(u) => match u.state {
                UpvalueState::Open { stack_index } => self.stack[stack_index],
                UpvalueState::Closed(v) => v,
            },
            _ => unreachable!(),
        }
    }

    fn write_upvalue(&mut self, r: ObjRef, v: Value) {
        let stack_index = match self.heap.get(r) {
            Obj::Upvalue(u) => u.stack_index(),
            _ => None,
        };
        match stack_index {
            Some(idx) => self.stack[idx] = v,
            None => {
                if let Obj::Upvalue(u) = self.heap.get_mut(r) {
                    u.state = UpvalueState::Closed(v);
                }
            }
        }
    }

    fn close_upvalues_from(&mut self, from: usize) {
        let mut still_open = Vec::new();
        for &r in &self.open_upvalues {
            let idx = match self.heap.get(r) {
                Obj::Upvalue(u) => u.stack_index(),
                _ => None,
            };
            match idx {
                Some(i) if i >= from => {
                    let v = self.stack[i];
                    if let Obj::Upvalue(u) = self.heap.get_mut(r) {
                        u.state = UpvalueState::Closed(v);
                    }
                }
                Some(_) => still_open.push(r),
                None => {}
            }
        }
        self.open_upvalues = still_open;
    }

    // ---- exceptions & with-cleanup ------------------------------------------

    /// Builds an exception instance of `kind` (a root class name under
    /// `Exception`) with `message` as its `message` field -- the same shape
    /// every installed exception class's own `__init__` produces.
    pub fn runtime_error_val(&mut self, kind: &str, message: &str) -> Value {
        let class = self.classes.exception_class(kind).unwrap_or(self.classes.exception);
        let inst = self.heap.new_instance(class);
        let key = self.heap.new_str_value("message");
        let msg = self.heap.new_str_value(message);
        self.heap.instance_field_set(inst, key, msg);
        Value::Obj(inst)
    }

    fn runtime_error(&mut self, kind: &str, message: &str) -> Value {
        self.runtime_error_val(kind, message)
    }

    /// Walks `self.handlers` looking for one belonging to a frame `>= floor`.
    /// `Ok(true)` means a handler was found and control transferred to it
    /// (the main loop keeps running); `Ok(false)` means the exception
    /// propagates out of this `run(floor)` call entirely.
    fn unwind(&mut self, exc: Value, floor: usize) -> VmResult<bool> {
        loop {
            let Some(h) = self.handlers.last().copied() else { return Ok(false) };
            if h.frame_index < floor {
                return Ok(false);
            }
            self.handlers.pop();
            self.frames.truncate(h.frame_index + 1);
            self.close_upvalues_from(h.stack_floor);
            self.stack.truncate(h.stack_floor);
            self.current_frame_mut().ip = h.target;
            match h.kind {
                HandlerKind::Try => {
                    self.push(exc);
                    return Ok(true);
                }
                HandlerKind::With => {
                    self.unwinding = Some(exc);
                    return Ok(true);
                }
            }
        }
    }

    fn run_exit(&mut self, cm: Value) -> VmResult<()> {
        let class = self.class_of(cm).ok_or_else(|| self.runtime_error_val("TypeError", "not a context manager"))?;
        if let Some(exit) = self.resolve_dunder_on(class, |d| d.exit) {
            self.invoke_value(Value::Obj(exit), Some(cm), &[])?;
        }
        Ok(())
    }

    // ---- generators ----------------------------------------------------------

    /// Resumes a suspended generator with `sent` as the value `yield`
    /// evaluates to (ignored on the first resume, where the generator hasn't
    /// started yet and has no pending `yield` expression to receive it).
    /// Restores its saved local region as a fresh frame, runs until the next
    /// `yield`/`return`/unhandled raise, then saves state back out.
    pub fn resume_generator(&mut self, gen_ref: ObjRef, sent: Value) -> VmResult<Value> {
        let (closure, mut saved, ip, state) = self
            .heap
            .with_generator(gen_ref, |g| (g.closure, std::mem::take(&mut g.saved_stack), g.ip, g.state))
            .ok_or_else(|| self.runtime_error_val("TypeError", "not a generator"))?;
        if state == GeneratorState::Done {
            return Ok(Value::Obj(gen_ref));
        }
        if state != GeneratorState::NotStarted {
            saved.push(sent);
        }
        self.heap.with_generator(gen_ref, |g| g.state = GeneratorState::Running);
        self.push(Value::Obj(closure));
        let base = self.stack.len();
        for v in &saved {
            self.push(*v);
        }
        self.frames.push(CallFrame { closure, ip, base, substitute_return: None, generator: Some(gen_ref) });
        let floor = self.frames.len() - 1;
        let result = self.run(floor);
        match &result {
            Ok(_) => {
                self.heap.with_generator(gen_ref, |g| {
                    if g.state == GeneratorState::Running {
                        g.state = GeneratorState::Done;
                        g.saved_stack.clear();
                    }
                });
            }
            Err(_) => {
                self.frames.truncate(floor);
                self.heap.with_generator(gen_ref, |g| g.state = GeneratorState::Done);
            }
        }
        result
    }

    // ---- GC ------------------------------------------------------------------

    fn collect_garbage(&mut self) {
        self.heap.collect(self);
    }

    // ---- module loading -------------------------------------------------------

    fn load_module(&mut self, path: &str) -> VmResult<ObjRef> {
        crate::module::load(self, path)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl GcRoots for Vm {
    fn trace_roots(&self, push: &mut dyn FnMut(Value)) {
        for v in &self.stack {
            push(*v);
        }
        for f in &self.frames {
            push(Value::Obj(f.closure));
        }
        for r in &self.open_upvalues {
            push(Value::Obj(*r));
        }
        push(Value::Obj(self.main_module));
        for r in self.module_cache.values() {
            push(Value::Obj(*r));
        }
    }
}

fn normalize_index(i: i64, len: usize) -> usize {
    if i < 0 {
        (len as i64 + i).max(0) as usize
    } else {
        i as usize
    }
}

fn partial_cmp_i32(x: f64, y: f64) -> i32 {
    if x < y {
        -1
    } else if x > y {
        1
    } else {
        0
    }
}
