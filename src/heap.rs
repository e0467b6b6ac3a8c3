// File: src/heap.rs
//
// The object heap and its tracing garbage collector.
//
// The spec describes an arena-less heap of objects linked via an intrusive
// `next` pointer. This implementation instead stores objects in an
// index-addressed arena (`Vec<Slot>` plus a free list), so `Value::Object`
// is a `Copy` handle (`ObjRef`) rather than a raw pointer, and the whole
// heap can be written without `unsafe`. The "global object list" from the
// data model is the arena's set of occupied slots, walked in slot order
// during sweep instead of via `next` links — functionally equivalent, and
// grounded on the id-into-arena pattern used by the lua-rs object pool in
// the retrieval pack (see DESIGN.md).
//
// A handle stays valid for as long as the object it names is reachable;
// since the GC only ever frees objects it proved unreachable from the root
// set, a `Value` holding a handle is itself part of that proof, so handles
// never dangle while in use.

use crate::object::{
    Callable, DunderSlots, NativeKind, NativeStorage, Obj, ObjHeader, RBoundMethod,
    RClass, RClosure, RFunction, RInstance, RNative, RProperty, RStr, RUpvalue, UpvalueState,
};
use crate::table::Table;
use crate::value::{ObjRef, Value};
use ahash::AHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::rc::Rc;

struct Slot {
    header: ObjHeader,
    data: Option<Obj>,
}

/// Root-providing callback. The VM implements this to expose its stacks,
/// frames, and open-upvalue list as GC roots; kept as a trait so `heap.rs`
/// doesn't need to know about `vm.rs`'s frame layout.
pub trait GcRoots {
    fn trace_roots(&self, push: &mut dyn FnMut(Value));
}

pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    /// String interning table: byte content -> handle. Kept as a plain map
    /// rather than a generic `Table` because intern lookups are always by
    /// raw string content, never by `Value`, and a generic `Table` would
    /// need a `&Heap` to hash/compare its own keys -- which would alias the
    /// very heap it lives inside.
    interned: HashMap<Rc<str>, ObjRef>,
    bytes_allocated: usize,
    next_gc_threshold: usize,
    pub collections_run: usize,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free_list: Vec::new(),
            interned: HashMap::new(),
            bytes_allocated: 0,
            next_gc_threshold: 1 << 20,
            collections_run: 0,
        }
    }

    // ---- allocation -------------------------------------------------

    fn alloc(&mut self, obj: Obj) -> ObjRef {
        let header = ObjHeader { hash: 0, ..ObjHeader::default() };
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Slot { header, data: Some(obj) };
            ObjRef(idx)
        } else {
            self.slots.push(Slot { header, data: Some(obj) });
            ObjRef((self.slots.len() - 1) as u32)
        }
    }

    fn slot(&self, r: ObjRef) -> &Obj {
        self.slots[r.0 as usize].data.as_ref().expect("dangling ObjRef")
    }

    fn slot_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.slots[r.0 as usize].data.as_mut().expect("dangling ObjRef")
    }

    pub fn header(&self, r: ObjRef) -> ObjHeader {
        self.slots[r.0 as usize].header
    }

    pub fn set_immortal(&mut self, r: ObjRef) {
        self.slots[r.0 as usize].header.immortal = true;
    }

    /// Reentrancy guard for `__repr__`/`__str__` on containers: set on entry,
    /// cleared on exit, consulted to break cycles with an ellipsis sentinel.
    pub fn enter_repr(&mut self, r: ObjRef) -> bool {
        let already = self.slots[r.0 as usize].header.in_repr;
        self.slots[r.0 as usize].header.in_repr = true;
        already
    }

    pub fn exit_repr(&mut self, r: ObjRef) {
        self.slots[r.0 as usize].header.in_repr = false;
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        self.slot(r)
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.slot_mut(r)
    }

    // ---- strings ------------------------------------------------------

    fn hash_bytes(bytes: &[u8]) -> u32 {
        let mut hasher = AHasher::default();
        hasher.write(bytes);
        hasher.finish() as u32
    }

    /// Intern `s`, allocating a new `String` object only if this exact byte
    /// sequence hasn't been seen before. Two literal occurrences of equal
    /// text are therefore always the same `ObjRef` (identity holds).
    pub fn intern(&mut self, s: &str) -> ObjRef {
        if let Some(r) = self.interned.get(s) {
            return *r;
        }
        let hash = Self::hash_bytes(s.as_bytes());
        let r = self.alloc(Obj::Str(RStr::new(s)));
        self.slots[r.0 as usize].header.hash = hash;
        self.interned.insert(Rc::from(s), r);
        r
    }

    /// Look up an already-interned string without allocating; used by
    /// `Table::get_str` so a missed lookup never needs to intern.
    pub fn peek_interned(&self, s: &str) -> Option<Value> {
        self.interned.get(s).map(|r| Value::Obj(*r))
    }

    pub fn new_str_value(&mut self, s: &str) -> Value {
        Value::Obj(self.intern(s))
    }

    pub fn as_str(&self, r: ObjRef) -> Option<&str> {
        match self.slot(r) {
            Obj::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    // ---- constructors ---------------------------------------------------

    pub fn new_bytes(&mut self, bytes: Vec<u8>) -> ObjRef {
        let hash = Self::hash_bytes(&bytes);
        let r = self.alloc(Obj::Bytes(bytes));
        self.slots[r.0 as usize].header.hash = hash;
        r
    }

    /// Tuple hash is fixed at construction by commutatively combining
    /// element hashes, so two tuples with the same elements in different
    /// orders still (generally) hash differently.
    pub fn new_tuple(&mut self, items: Vec<Value>) -> ObjRef {
        let mut hash: u32 = 0x9E3779B9;
        for (i, v) in items.iter().enumerate() {
            let h = self.hash_value(*v).unwrap_or(0);
            hash = hash.rotate_left(5) ^ h.wrapping_mul(i as u32 + 2654435761);
        }
        let r = self.alloc(Obj::Tuple(items));
        self.slots[r.0 as usize].header.hash = hash;
        r
    }

    pub fn new_function(&mut self, f: RFunction) -> ObjRef {
        self.alloc(Obj::Function(f))
    }

    pub fn new_closure(&mut self, c: RClosure) -> ObjRef {
        self.alloc(Obj::Closure(c))
    }

    pub fn new_upvalue_open(&mut self, stack_index: usize) -> ObjRef {
        self.alloc(Obj::Upvalue(RUpvalue { state: UpvalueState::Open { stack_index } }))
    }

    pub fn new_class(&mut self, name: Rc<str>, base: Option<ObjRef>) -> ObjRef {
        self.alloc(Obj::Class(RClass::new(name, base)))
    }

    pub fn new_instance(&mut self, class: ObjRef) -> ObjRef {
        self.alloc(Obj::Instance(RInstance::new(class)))
    }

    pub fn new_bound_method(&mut self, receiver: Value, method: Callable) -> ObjRef {
        self.alloc(Obj::BoundMethod(RBoundMethod { receiver, method }))
    }

    pub fn new_native(
        &mut self,
        name: &str,
        doc: Option<&str>,
        is_method: bool,
        func: crate::object::NativeFn,
    ) -> ObjRef {
        self.alloc(Obj::Native(RNative {
            func,
            name: Rc::from(name),
            doc: doc.map(Rc::from),
            is_method,
        }))
    }

    pub fn new_property(&mut self, getter: Value) -> ObjRef {
        self.alloc(Obj::Property(RProperty { getter }))
    }

    pub fn new_list(&mut self, class: ObjRef, items: Vec<Value>) -> ObjRef {
        let mut inst = RInstance::new(class);
        inst.native = Some(NativeStorage::List(items));
        self.alloc(Obj::Instance(inst))
    }

    pub fn new_dict(&mut self, class: ObjRef) -> ObjRef {
        let mut inst = RInstance::new(class);
        inst.native = Some(NativeStorage::Dict(Table::new()));
        self.alloc(Obj::Instance(inst))
    }

    pub fn new_set(&mut self, class: ObjRef) -> ObjRef {
        let mut inst = RInstance::new(class);
        inst.native = Some(NativeStorage::Set(Table::new()));
        self.alloc(Obj::Instance(inst))
    }

    pub fn new_generator(&mut self, class: ObjRef, closure: ObjRef) -> ObjRef {
        let mut inst = RInstance::new(class);
        inst.native = Some(NativeStorage::Generator(crate::object::RGenerator::new(closure)));
        self.alloc(Obj::Instance(inst))
    }

    // ---- hashing & equality --------------------------------------------

    /// `None` means unhashable (e.g. a `list`/`dict`/`set` instance).
    pub fn hash_value(&self, v: Value) -> Option<u32> {
        match v {
            Value::None => Some(0x1111_1111),
            Value::Bool(b) => Some(if b { 1 } else { 0 }),
            Value::Int(i) => Some((i as u64 ^ (i as u64 >> 32)) as u32),
            Value::Float(f) => Some(f.to_bits() as u32 ^ (f.to_bits() >> 32) as u32),
            Value::Handler(_) => None,
            Value::Kwargs(k) => Some(k as u32),
            Value::Obj(r) => match self.slot(r) {
                Obj::Str(_) | Obj::Tuple(_) | Obj::Bytes(_) => Some(self.header(r).hash),
                _ => None,
            },
        }
    }

    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::None, Value::None) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Float(x), Value::Float(y)) => x == y,
            (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => x as f64 == y,
            (Value::Kwargs(x), Value::Kwargs(y)) => x == y,
            (Value::Obj(x), Value::Obj(y)) => {
                if x == y {
                    return true;
                }
                match (self.slot(x), self.slot(y)) {
                    (Obj::Str(_), Obj::Str(_)) => false, // interned: distinct ObjRef => distinct content
                    (Obj::Tuple(xs), Obj::Tuple(ys)) => {
                        xs.len() == ys.len()
                            && xs.iter().zip(ys.iter()).all(|(e1, e2)| self.values_equal(*e1, *e2))
                    }
                    (Obj::Bytes(xs), Obj::Bytes(ys)) => xs == ys,
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Object identity, used by `is`/`is not` and the sentinel iterator
    /// protocol (a generator signals exhaustion by returning itself).
    pub fn same(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::None, Value::None) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
            (Value::Kwargs(x), Value::Kwargs(y)) => x == y,
            (Value::Obj(x), Value::Obj(y)) => x == y,
            _ => false,
        }
    }

    // ---- class/method/field access via take-then-put ------------------
    //
    // An `RClass`/`RInstance`'s `Table` lives inside this same arena, so a
    // naive `&mut self.slot_mut(r).methods` held alongside `&self` (for
    // hashing keys) would alias the heap with itself. Instead we swap the
    // table out to an owned local, operate with an unaliased `&Heap`, and
    // swap it back -- the standard pattern for self-referential arenas in
    // safe Rust.

    pub fn class_method_get(&self, class: ObjRef, name: Value) -> Option<Value> {
        match self.slot(class) {
            Obj::Class(c) => c.methods.get(self, name),
            _ => None,
        }
    }

    pub fn class_set_method(&mut self, class: ObjRef, name: Value, method: Value) {
        let mut table = match self.slot_mut(class) {
            Obj::Class(c) => std::mem::take(&mut c.methods),
            _ => return,
        };
        table.set(self, name, method);
        if let Obj::Class(c) = self.slot_mut(class) {
            c.methods = table;
        }
        self.refresh_dunders(class);
    }

    pub fn class_field_get(&self, class: ObjRef, name: Value) -> Option<Value> {
        match self.slot(class) {
            Obj::Class(c) => c.fields.get(self, name),
            _ => None,
        }
    }

    pub fn class_set_field(&mut self, class: ObjRef, name: Value, value: Value) {
        let mut table = match self.slot_mut(class) {
            Obj::Class(c) => std::mem::take(&mut c.fields),
            _ => return,
        };
        table.set(self, name, value);
        if let Obj::Class(c) = self.slot_mut(class) {
            c.fields = table;
        }
    }

    /// Walks the base chain resolving a method by name (string constant).
    pub fn resolve_method(&self, class: ObjRef, name_val: Value) -> Option<Value> {
        let mut cur = Some(class);
        while let Some(c) = cur {
            if let Some(m) = self.class_method_get(c, name_val) {
                return Some(m);
            }
            cur = match self.slot(c) {
                Obj::Class(cls) => cls.base,
                _ => None,
            };
        }
        None
    }

    /// Recompute the cached dunder slots after a method table mutation, by
    /// walking the base chain for each well-known name (innermost wins).
    fn refresh_dunders(&mut self, class: ObjRef) {
        fn lookup(heap: &Heap, class: ObjRef, name: &str) -> Option<ObjRef> {
            let key = heap.peek_interned(name)?;
            heap.resolve_method(class, key).and_then(|v| v.as_obj())
        }
        let dunders = DunderSlots {
            getitem: lookup(self, class, "__getitem__"),
            setitem: lookup(self, class, "__setitem__"),
            delitem: lookup(self, class, "__delitem__"),
            getslice: lookup(self, class, "__getslice__"),
            setslice: lookup(self, class, "__setslice__"),
            delslice: lookup(self, class, "__delslice__"),
            repr: lookup(self, class, "__repr__"),
            str: lookup(self, class, "__str__"),
            call: lookup(self, class, "__call__"),
            init: lookup(self, class, "__init__"),
            eq: lookup(self, class, "__eq__"),
            len: lookup(self, class, "__len__"),
            enter: lookup(self, class, "__enter__"),
            exit: lookup(self, class, "__exit__"),
            iter: lookup(self, class, "__iter__"),
            getattr: lookup(self, class, "__getattr__"),
            dir: lookup(self, class, "__dir__"),
        };
        if let Obj::Class(c) = self.slot_mut(class) {
            c.dunders = dunders;
        }
    }

    pub fn instance_field_get(&self, instance: ObjRef, name: Value) -> Option<Value> {
        match self.slot(instance) {
            Obj::Instance(i) => i.fields.get(self, name),
            _ => None,
        }
    }

    pub fn instance_field_set(&mut self, instance: ObjRef, name: Value, value: Value) {
        let mut table = match self.slot_mut(instance) {
            Obj::Instance(i) => std::mem::take(&mut i.fields),
            _ => return,
        };
        table.set(self, name, value);
        if let Obj::Instance(i) = self.slot_mut(instance) {
            i.fields = table;
        }
    }

    pub fn instance_field_delete(&mut self, instance: ObjRef, name: Value) -> bool {
        let mut table = match self.slot_mut(instance) {
            Obj::Instance(i) => std::mem::take(&mut i.fields),
            _ => return false,
        };
        let ok = table.delete(self, name);
        if let Obj::Instance(i) = self.slot_mut(instance) {
            i.fields = table;
        }
        ok
    }

    pub fn instance_class(&self, instance: ObjRef) -> Option<ObjRef> {
        match self.slot(instance) {
            Obj::Instance(i) => Some(i.class),
            _ => None,
        }
    }

    /// Is `class` (or a base of it) the given root class handle?
    pub fn is_instance_of(&self, value: Value, root: ObjRef) -> bool {
        let Value::Obj(r) = value else { return false };
        let Obj::Instance(inst) = self.slot(r) else { return false };
        let mut cur = Some(inst.class);
        while let Some(c) = cur {
            if c == root {
                return true;
            }
            cur = match self.slot(c) {
                Obj::Class(cls) => cls.base,
                _ => None,
            };
        }
        false
    }

    // ---- native storage (list/dict/set) --------------------------------

    pub fn with_list<R>(&mut self, instance: ObjRef, f: impl FnOnce(&mut Vec<Value>) -> R) -> Option<R> {
        let Obj::Instance(i) = self.slot_mut(instance) else { return None };
        match &mut i.native {
            Some(NativeStorage::List(v)) => Some(f(v)),
            _ => None,
        }
    }

    pub fn list_snapshot(&self, instance: ObjRef) -> Option<Vec<Value>> {
        match self.slot(instance) {
            Obj::Instance(i) => match &i.native {
                Some(NativeStorage::List(v)) => Some(v.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn with_dict<R>(&mut self, instance: ObjRef, f: impl FnOnce(&mut Table, &Heap) -> R) -> Option<R> {
        let mut table = match self.slot_mut(instance) {
            Obj::Instance(i) => match &mut i.native {
                Some(NativeStorage::Dict(_)) => {
                    let NativeStorage::Dict(t) = std::mem::replace(i.native.as_mut().unwrap(), NativeStorage::Dict(Table::new())) else { unreachable!() };
                    t
                }
                _ => return None,
            },
            _ => return None,
        };
        let r = f(&mut table, self);
        if let Obj::Instance(i) = self.slot_mut(instance) {
            i.native = Some(NativeStorage::Dict(table));
        }
        Some(r)
    }

    pub fn with_set<R>(&mut self, instance: ObjRef, f: impl FnOnce(&mut Table, &Heap) -> R) -> Option<R> {
        let mut table = match self.slot_mut(instance) {
            Obj::Instance(i) => match &mut i.native {
                Some(NativeStorage::Set(_)) => {
                    let NativeStorage::Set(t) = std::mem::replace(i.native.as_mut().unwrap(), NativeStorage::Set(Table::new())) else { unreachable!() };
                    t
                }
                _ => return None,
            },
            _ => return None,
        };
        let r = f(&mut table, self);
        if let Obj::Instance(i) = self.slot_mut(instance) {
            i.native = Some(NativeStorage::Set(table));
        }
        Some(r)
    }

    /// Runs `f` against the generator's suspended state; used by `__next__`/
    /// `send` to restore/save `saved_stack`/`ip` around a resume.
    pub fn with_generator<R>(
        &mut self,
        instance: ObjRef,
        f: impl FnOnce(&mut crate::object::RGenerator) -> R,
    ) -> Option<R> {
        let Obj::Instance(i) = self.slot_mut(instance) else { return None };
        match &mut i.native {
            Some(NativeStorage::Generator(g)) => Some(f(g)),
            _ => None,
        }
    }

    pub fn native_kind_of(&self, class: ObjRef) -> Option<NativeKind> {
        match self.slot(class) {
            Obj::Class(c) => c.native_kind,
            _ => None,
        }
    }

    // ---- GC -------------------------------------------------------------

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated >= self.next_gc_threshold
    }

    pub fn note_alloc(&mut self, bytes: usize) {
        self.bytes_allocated += bytes;
    }

    /// Mark-and-sweep from the given root provider. Strings are additionally
    /// kept in the weak `interned` map only while marked; unmarked interned
    /// entries are dropped during sweep (per §5: "the interned-string table
    /// (weak — dead strings are removed here)").
    pub fn collect(&mut self, roots: &impl GcRoots) {
        for slot in &mut self.slots {
            slot.header.marked = false;
        }
        let mut gray: Vec<Value> = Vec::new();
        roots.trace_roots(&mut |v| gray.push(v));
        while let Some(v) = gray.pop() {
            self.mark_value(v, &mut gray);
        }
        // Sweep.
        let mut freed = Vec::new();
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.data.is_none() {
                continue;
            }
            if slot.header.immortal || slot.header.marked {
                continue;
            }
            slot.data = None;
            freed.push(idx as u32);
        }
        self.free_list.extend(freed);
        self.interned.retain(|_, r| {
            self.slots[r.0 as usize].data.is_some()
        });
        self.collections_run += 1;
        self.next_gc_threshold = (self.bytes_allocated * 2).max(1 << 16);
    }

    fn mark_value(&mut self, v: Value, gray: &mut Vec<Value>) {
        let Value::Obj(r) = v else { return };
        let idx = r.0 as usize;
        if self.slots[idx].header.marked {
            return;
        }
        self.slots[idx].header.marked = true;
        // Scan outgoing references per-variant (the per-type gc-scan hook).
        match self.slots[idx].data.as_ref() {
            Some(Obj::Tuple(items)) => gray.extend(items.iter().copied()),
            Some(Obj::Closure(c)) => {
                gray.push(Value::Obj(c.function));
                gray.extend(c.upvalues.iter().map(|u| Value::Obj(*u)));
            }
            Some(Obj::Upvalue(u)) => {
                if let UpvalueState::Closed(v) = &u.state {
                    gray.push(*v);
                }
            }
            Some(Obj::Function(f)) => {
                gray.extend(f.chunk.constants.iter().copied());
                if let Some(g) = f.globals_context {
                    gray.push(Value::Obj(g));
                }
            }
            Some(Obj::Class(c)) => {
                if let Some(b) = c.base {
                    gray.push(Value::Obj(b));
                }
                gray.extend(c.methods.gc_roots());
                gray.extend(c.fields.gc_roots());
            }
            Some(Obj::Instance(i)) => {
                gray.push(Value::Obj(i.class));
                gray.extend(i.fields.gc_roots());
                match &i.native {
                    Some(NativeStorage::List(v)) => gray.extend(v.iter().copied()),
                    Some(NativeStorage::Dict(t)) => gray.extend(t.gc_roots()),
                    Some(NativeStorage::Set(t)) => gray.extend(t.gc_roots()),
                    Some(NativeStorage::Generator(g)) => {
                        gray.push(Value::Obj(g.closure));
                        gray.extend(g.saved_stack.iter().copied());
                    }
                    Some(NativeStorage::Bytes(_)) | None => {}
                }
            }
            Some(Obj::BoundMethod(b)) => {
                gray.push(b.receiver);
                match b.method {
                    Callable::Closure(c) => gray.push(Value::Obj(c)),
                    Callable::Native(n) => gray.push(Value::Obj(n)),
                }
            }
            Some(Obj::Property(p)) => gray.push(p.getter),
            Some(Obj::Str(_)) | Some(Obj::Bytes(_)) | Some(Obj::Native(_)) | None => {}
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
