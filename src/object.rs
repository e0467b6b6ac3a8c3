// File: src/object.rs
//
// Heap object variants and the per-object header. Every object lives inside
// `Heap` (see heap.rs); this module only defines shapes, not allocation or
// GC policy.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::{ObjRef, Value};
use std::rc::Rc;

/// Header carried by every heap object, per the data model: a type tag is
/// implicit in which `Obj` variant a slot holds, so the header itself only
/// carries the bits shared across all variants.
#[derive(Clone, Copy, Debug, Default)]
pub struct ObjHeader {
    pub marked: bool,
    pub in_repr: bool,
    pub generation: u8,
    pub immortal: bool,
    pub hash: u32,
}

/// UTF-8 source bytes plus a lazily materialized per-codepoint view, so that
/// indexing a string by codepoint doesn't re-scan UTF-8 on every access.
#[derive(Debug, Clone)]
pub struct RStr {
    pub bytes: Rc<[u8]>,
    pub byte_len: usize,
    pub char_len: usize,
    /// Populated on first codepoint-indexed access; `None` beforehand.
    pub codepoints: std::cell::RefCell<Option<Rc<[char]>>>,
}

impl RStr {
    pub fn new(s: &str) -> Self {
        RStr {
            bytes: Rc::from(s.as_bytes()),
            byte_len: s.len(),
            char_len: s.chars().count(),
            codepoints: std::cell::RefCell::new(None),
        }
    }

    pub fn as_str(&self) -> &str {
        // Safety net: bytes always originate from a `&str`, so this cannot fail.
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }

    pub fn codepoints(&self) -> Rc<[char]> {
        if self.codepoints.borrow().is_none() {
            let chars: Vec<char> = self.as_str().chars().collect();
            *self.codepoints.borrow_mut() = Some(Rc::from(chars));
        }
        self.codepoints.borrow().clone().unwrap()
    }
}

/// One captured-variable debug entry; see `Function::local_names`.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub id: usize,
    pub birthday: usize,
    pub deathday: usize,
    pub name: Rc<str>,
}

#[derive(Debug)]
pub struct RFunction {
    pub chunk: Chunk,
    pub name: Rc<str>,
    pub docstring: Option<Rc<str>>,
    pub required_args: Vec<Rc<str>>,
    pub keyword_args: Vec<Rc<str>>,
    pub collects_args: bool,
    pub collects_kwargs: bool,
    pub upvalue_count: usize,
    pub local_names: Vec<LocalEntry>,
    /// The module (`Instance` of the `module` root class) this function's
    /// globals resolve against.
    pub globals_context: Option<ObjRef>,
    /// Set by the compiler when a `yield` was compiled anywhere in this
    /// function's own body (not a nested `def`). Calling such a closure
    /// produces a `generator` instance instead of running the body.
    pub is_generator: bool,
}

impl RFunction {
    pub fn arity(&self) -> usize {
        self.required_args.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UpvalueDescriptor {
    pub is_local: bool,
    pub index: u32,
}

#[derive(Debug)]
pub struct RClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// Either an open upvalue pointing at a live stack slot, or a closed upvalue
/// that owns its captured `Value`.
#[derive(Debug)]
pub enum UpvalueState {
    Open { stack_index: usize },
    Closed(Value),
}

#[derive(Debug)]
pub struct RUpvalue {
    pub state: UpvalueState,
}

impl RUpvalue {
    pub fn stack_index(&self) -> Option<usize> {
        match self.state {
            UpvalueState::Open { stack_index } => Some(stack_index),
            UpvalueState::Closed(_) => None,
        }
    }
}

/// Cached dunder method slots on a class, resolved once at class-finalization
/// time (i.e. whenever a method table changes) so dispatch doesn't need a
/// table probe on every operator/protocol use.
#[derive(Debug, Clone, Copy, Default)]
pub struct DunderSlots {
    pub getitem: Option<ObjRef>,
    pub setitem: Option<ObjRef>,
    pub delitem: Option<ObjRef>,
    pub getslice: Option<ObjRef>,
    pub setslice: Option<ObjRef>,
    pub delslice: Option<ObjRef>,
    pub repr: Option<ObjRef>,
    pub str: Option<ObjRef>,
    pub call: Option<ObjRef>,
    pub init: Option<ObjRef>,
    pub eq: Option<ObjRef>,
    pub len: Option<ObjRef>,
    pub enter: Option<ObjRef>,
    pub exit: Option<ObjRef>,
    pub iter: Option<ObjRef>,
    pub getattr: Option<ObjRef>,
    pub dir: Option<ObjRef>,
}

/// Per-type hooks a native "subclass" (list/dict/set/bytes-like builtins)
/// installs so the GC and the allocator know how to treat the native storage
/// riding alongside an `Instance`'s field table. Modeled on Kuroko's
/// `_ongcscan`/`_ongcsweep` class callbacks, and on list/dict there being
/// `KrkInstance` plus a trailing native array/table rather than a distinct
/// object kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NativeKind {
    List,
    Dict,
    Set,
    BytesBuilder,
    Generator,
}

#[derive(Debug)]
pub struct RClass {
    pub name: Rc<str>,
    pub base: Option<ObjRef>,
    pub methods: Table,
    pub fields: Table,
    pub dunders: DunderSlots,
    /// Present only for the native root classes (`list`, `dict`, `set`,
    /// `bytes`) whose instances carry a native backing store.
    pub native_kind: Option<NativeKind>,
}

impl RClass {
    pub fn new(name: Rc<str>, base: Option<ObjRef>) -> Self {
        RClass {
            name,
            base,
            methods: Table::new(),
            fields: Table::new(),
            dunders: DunderSlots::default(),
            native_kind: None,
        }
    }
}

/// The native storage backing list/dict/set/bytes-builder instances. A plain
/// user-defined class never sets this; it stays `None` and the instance is
/// just a class reference plus a field table, exactly as the data model
/// describes.
#[derive(Debug)]
pub enum NativeStorage {
    List(Vec<Value>),
    Dict(Table),
    Set(Table),
    Bytes(Vec<u8>),
    Generator(RGenerator),
}

/// A suspended call: per the calling-convention note on generators, "a
/// function whose call is suspended by yield is represented as a generator
/// object holding its closure, its saved ip, and a saved argument/local
/// region." Resuming restores `saved_stack` onto the VM's value stack at a
/// fresh frame base, runs until the next `yield`/`return`/raise, then saves
/// whatever remains back out.
#[derive(Debug)]
pub struct RGenerator {
    pub closure: ObjRef,
    pub saved_stack: Vec<Value>,
    pub ip: usize,
    pub state: GeneratorState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    NotStarted,
    Suspended,
    Running,
    Done,
}

impl RGenerator {
    pub fn new(closure: ObjRef) -> Self {
        RGenerator { closure, saved_stack: Vec::new(), ip: 0, state: GeneratorState::NotStarted }
    }
}

#[derive(Debug)]
pub struct RInstance {
    pub class: ObjRef,
    pub fields: Table,
    pub native: Option<NativeStorage>,
}

impl RInstance {
    pub fn new(class: ObjRef) -> Self {
        RInstance { class, fields: Table::new(), native: None }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Callable {
    Closure(ObjRef),
    Native(ObjRef),
}

#[derive(Debug)]
pub struct RBoundMethod {
    pub receiver: Value,
    pub method: Callable,
}

pub type NativeFn = fn(&mut crate::vm::Vm, &[Value], bool) -> Result<Value, Value>;

pub struct RNative {
    pub func: NativeFn,
    pub name: Rc<str>,
    pub doc: Option<Rc<str>>,
    pub is_method: bool,
}

impl std::fmt::Debug for RNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RNative").field("name", &self.name).finish()
    }
}

#[derive(Debug)]
pub struct RProperty {
    pub getter: Value,
}

/// Every heap-allocated thing the VM can reference. There is intentionally
/// no `List`/`Dict`/`Set` variant here: those are plain `Instance`s of the
/// `list`/`dict`/`set` root classes carrying `NativeStorage` (see
/// `RInstance`), matching how the reference implementation layers them on
/// top of its generic instance struct rather than giving them a dedicated
/// object tag.
#[derive(Debug)]
pub enum Obj {
    Str(RStr),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    Function(RFunction),
    Closure(RClosure),
    Upvalue(RUpvalue),
    Class(RClass),
    Instance(RInstance),
    BoundMethod(RBoundMethod),
    Native(RNative),
    Property(RProperty),
}

impl Obj {
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::Str(_) => "str",
            Obj::Bytes(_) => "bytes",
            Obj::Tuple(_) => "tuple",
            Obj::Function(_) => "function",
            Obj::Closure(_) => "function",
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "type",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "method",
            Obj::Native(_) => "nativefn",
            Obj::Property(_) => "property",
        }
    }
}
