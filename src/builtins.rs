// File: src/builtins.rs
//
// Constructs the root class hierarchy once, at VM startup: `object` and its
// native descendants (`str`, `int`, `float`, `bool`, `list`, `tuple`, `dict`,
// `set`, `bytes`, `function`, `method`, `generator`, `property`, `module`)
// plus the exception hierarchy, and returns both the `Classes` handle table
// and the free-function globals every fresh module's namespace is seeded
// with. Native methods are installed as plain `Native` objects in each
// class's method table, so the VM's dispatch never special-cases "native
// method" versus "bytecode method" beyond the `Obj::Native` tag itself.

use crate::heap::Heap;
use crate::object::{NativeKind, NativeStorage, Obj};
use crate::value::Value;
use std::rc::Rc;

/// Handles to every root class the VM or a native function needs to look up
/// by identity rather than by name lookup through a module's globals.
#[derive(Clone, Copy)]
pub struct Classes {
    pub object: crate::value::ObjRef,
    pub str_: crate::value::ObjRef,
    pub int_: crate::value::ObjRef,
    pub float_: crate::value::ObjRef,
    pub bool_: crate::value::ObjRef,
    pub list: crate::value::ObjRef,
    pub tuple: crate::value::ObjRef,
    pub dict: crate::value::ObjRef,
    pub set: crate::value::ObjRef,
    pub bytes: crate::value::ObjRef,
    pub function: crate::value::ObjRef,
    pub method: crate::value::ObjRef,
    pub generator: crate::value::ObjRef,
    pub property: crate::value::ObjRef,
    pub module: crate::value::ObjRef,
    pub exception: crate::value::ObjRef,
    type_error: crate::value::ObjRef,
    value_error: crate::value::ObjRef,
    argument_error: crate::value::ObjRef,
    name_error: crate::value::ObjRef,
    attribute_error: crate::value::ObjRef,
    index_error: crate::value::ObjRef,
    key_error: crate::value::ObjRef,
    import_error: crate::value::ObjRef,
    syntax_error: crate::value::ObjRef,
    stop_iteration: crate::value::ObjRef,
    os_error: crate::value::ObjRef,
    zero_division_error: crate::value::ObjRef,
    not_implemented_error: crate::value::ObjRef,
    recursion_error: crate::value::ObjRef,
}

impl Classes {
    /// Looks up an exception root class by the bare name used throughout
    /// `vm.rs`'s `runtime_error_val` call sites (`"TypeError"`, `"KeyError"`,
    /// ...). An internal native that raises under a kind this table doesn't
    /// recognize falls back to `None` rather than panicking -- callers treat
    /// that as "use the generic Exception class" instead.
    pub fn exception_class(&self, kind: &str) -> Option<crate::value::ObjRef> {
        Some(match kind {
            "Exception" => self.exception,
            "TypeError" => self.type_error,
            "ValueError" => self.value_error,
            "ArgumentError" => self.argument_error,
            "NameError" => self.name_error,
            "AttributeError" => self.attribute_error,
            "IndexError" => self.index_error,
            "KeyError" => self.key_error,
            "ImportError" => self.import_error,
            "SyntaxError" => self.syntax_error,
            "StopIteration" => self.stop_iteration,
            "OSError" => self.os_error,
            "ZeroDivisionError" => self.zero_division_error,
            "NotImplementedError" => self.not_implemented_error,
            "RecursionError" => self.recursion_error,
            _ => return None,
        })
    }
}

fn def_native(heap: &mut Heap, class: crate::value::ObjRef, name: &str, func: crate::object::NativeFn) {
    let native = heap.new_native(name, None, true, func);
    let key = heap.new_str_value(name);
    heap.class_set_method(class, key, Value::Obj(native));
}

fn new_root_class(heap: &mut Heap, name: &str, base: Option<crate::value::ObjRef>) -> crate::value::ObjRef {
    let class_ref = heap.new_class(Rc::from(name), base);
    heap.set_immortal(class_ref);
    class_ref
}

/// Builds the full root hierarchy and returns it alongside the free
/// functions (`len`, `range`, `sum`, `print`, ...) every module's globals
/// table is seeded with on creation (see `Vm::seed_module_globals`).
pub fn install(heap: &mut Heap) -> (Classes, Vec<(Rc<str>, Value)>) {
    let object = new_root_class(heap, "object", None);
    def_native(heap, object, "__repr__", native_object_repr);
    def_native(heap, object, "__str__", native_object_repr);
    def_native(heap, object, "__eq__", native_object_eq);
    def_native(heap, object, "__init__", native_noop_init);

    let str_ = new_root_class(heap, "str", Some(object));
    def_native(heap, str_, "__repr__", native_str_repr);
    def_native(heap, str_, "__str__", native_str_str);
    def_native(heap, str_, "__eq__", native_str_eq);
    def_native(heap, str_, "__len__", native_str_len);
    def_native(heap, str_, "__contains__", native_str_contains);

    let int_ = new_root_class(heap, "int", Some(object));
    def_native(heap, int_, "__repr__", native_int_repr);
    def_native(heap, int_, "__str__", native_int_repr);
    def_native(heap, int_, "__eq__", native_immediate_eq);

    let float_ = new_root_class(heap, "float", Some(object));
    def_native(heap, float_, "__repr__", native_float_repr);
    def_native(heap, float_, "__str__", native_float_repr);
    def_native(heap, float_, "__eq__", native_immediate_eq);

    let bool_ = new_root_class(heap, "bool", Some(object));
    def_native(heap, bool_, "__repr__", native_bool_repr);
    def_native(heap, bool_, "__str__", native_bool_repr);
    def_native(heap, bool_, "__eq__", native_immediate_eq);

    let list = new_root_class(heap, "list", Some(object));
    if let Obj::Class(c) = heap.get_mut(list) {
        c.native_kind = Some(NativeKind::List);
    }
    def_native(heap, list, "__repr__", native_list_repr);
    def_native(heap, list, "__str__", native_list_repr);
    def_native(heap, list, "__eq__", native_list_eq);
    def_native(heap, list, "__len__", native_list_len);
    def_native(heap, list, "__iter__", native_list_iter);
    def_native(heap, list, "__contains__", native_list_contains);
    def_native(heap, list, "append", native_list_append);
    def_native(heap, list, "pop", native_list_pop);

    let tuple = new_root_class(heap, "tuple", Some(object));
    def_native(heap, tuple, "__repr__", native_tuple_repr);
    def_native(heap, tuple, "__str__", native_tuple_repr);
    def_native(heap, tuple, "__len__", native_tuple_len);
    def_native(heap, tuple, "__iter__", native_tuple_iter);
    def_native(heap, tuple, "__contains__", native_tuple_contains);

    let dict = new_root_class(heap, "dict", Some(object));
    if let Obj::Class(c) = heap.get_mut(dict) {
        c.native_kind = Some(NativeKind::Dict);
    }
    def_native(heap, dict, "__repr__", native_dict_repr);
    def_native(heap, dict, "__str__", native_dict_repr);
    def_native(heap, dict, "__len__", native_dict_len);
    def_native(heap, dict, "__iter__", native_dict_iter);
    def_native(heap, dict, "__contains__", native_dict_contains);
    def_native(heap, dict, "keys", native_dict_keys);
    def_native(heap, dict, "values", native_dict_values);
    def_native(heap, dict, "get", native_dict_get);

    let set = new_root_class(heap, "set", Some(object));
    if let Obj::Class(c) = heap.get_mut(set) {
        c.native_kind = Some(NativeKind::Set);
    }
    def_native(heap, set, "__len__", native_set_len);
    def_native(heap, set, "__iter__", native_set_iter);
    def_native(heap, set, "__contains__", native_set_contains);
    def_native(heap, set, "add", native_set_add);

    let bytes = new_root_class(heap, "bytes", Some(object));
    if let Obj::Class(c) = heap.get_mut(bytes) {
        c.native_kind = Some(NativeKind::BytesBuilder);
    }
    def_native(heap, bytes, "__len__", native_bytes_len);
    def_native(heap, bytes, "__getitem__", native_bytes_getitem);

    let function = new_root_class(heap, "function", Some(object));
    def_native(heap, function, "__repr__", native_function_repr);

    let method = new_root_class(heap, "method", Some(object));
    def_native(heap, method, "__repr__", native_function_repr);

    let generator = new_root_class(heap, "generator", Some(object));
    if let Obj::Class(c) = heap.get_mut(generator) {
        c.native_kind = Some(NativeKind::Generator);
    }
    def_native(heap, generator, "__iter__", native_generator_self);
    def_native(heap, generator, "__next__", native_generator_next);
    def_native(heap, generator, "send", native_generator_send);

    let property = new_root_class(heap, "property", Some(object));

    let module = new_root_class(heap, "module", Some(object));
    def_native(heap, module, "__repr__", native_module_repr);

    let exception = new_root_class(heap, "Exception", Some(object));
    def_native(heap, exception, "__init__", native_exception_init);
    def_native(heap, exception, "__str__", native_exception_str);
    def_native(heap, exception, "__repr__", native_exception_str);

    let type_error = new_root_class(heap, "TypeError", Some(exception));
    let value_error = new_root_class(heap, "ValueError", Some(exception));
    let argument_error = new_root_class(heap, "ArgumentError", Some(exception));
    let name_error = new_root_class(heap, "NameError", Some(exception));
    let attribute_error = new_root_class(heap, "AttributeError", Some(exception));
    let index_error = new_root_class(heap, "IndexError", Some(exception));
    let key_error = new_root_class(heap, "KeyError", Some(exception));
    let import_error = new_root_class(heap, "ImportError", Some(exception));
    let syntax_error = new_root_class(heap, "SyntaxError", Some(exception));
    let stop_iteration = new_root_class(heap, "StopIteration", Some(exception));
    let os_error = new_root_class(heap, "OSError", Some(exception));
    let zero_division_error = new_root_class(heap, "ZeroDivisionError", Some(exception));
    let not_implemented_error = new_root_class(heap, "NotImplementedError", Some(exception));
    let recursion_error = new_root_class(heap, "RecursionError", Some(exception));

    let classes = Classes {
        object,
        str_,
        int_,
        float_,
        bool_,
        list,
        tuple,
        dict,
        set,
        bytes,
        function,
        method,
        generator,
        property,
        module,
        exception,
        type_error,
        value_error,
        argument_error,
        name_error,
        attribute_error,
        index_error,
        key_error,
        import_error,
        syntax_error,
        stop_iteration,
        os_error,
        zero_division_error,
        not_implemented_error,
        recursion_error,
    };

    let mut globals: Vec<(Rc<str>, Value)> = Vec::new();
    let mut add_class = |name: &str, class: crate::value::ObjRef| globals.push((Rc::from(name), Value::Obj(class)));
    add_class("object", object);
    add_class("str", str_);
    add_class("int", int_);
    add_class("float", float_);
    add_class("bool", bool_);
    add_class("list", list);
    add_class("tuple", tuple);
    add_class("dict", dict);
    add_class("set", set);
    add_class("bytes", bytes);
    add_class("function", function);
    add_class("method", method);
    add_class("generator", generator);
    add_class("property", property);
    add_class("module", module);
    add_class("Exception", exception);
    add_class("TypeError", type_error);
    add_class("ValueError", value_error);
    add_class("ArgumentError", argument_error);
    add_class("NameError", name_error);
    add_class("AttributeError", attribute_error);
    add_class("IndexError", index_error);
    add_class("KeyError", key_error);
    add_class("ImportError", import_error);
    add_class("SyntaxError", syntax_error);
    add_class("StopIteration", stop_iteration);
    add_class("OSError", os_error);
    add_class("ZeroDivisionError", zero_division_error);
    add_class("NotImplementedError", not_implemented_error);
    add_class("RecursionError", recursion_error);

    let mut add_fn = |name: &str, func: crate::object::NativeFn| {
        let native = heap.new_native(name, None, false, func);
        heap.set_immortal(native);
        globals.push((Rc::from(name), Value::Obj(native)));
    };
    add_fn("len", native_fn_len);
    add_fn("range", native_fn_range);
    add_fn("sum", native_fn_sum);
    add_fn("print", native_fn_print);
    add_fn("repr", native_fn_repr);
    add_fn("str", native_fn_str);
    add_fn("isinstance", native_fn_isinstance);
    add_fn("type", native_fn_type);
    add_fn("next", native_fn_next);

    (classes, globals)
}

// ---- argument-access helpers --------------------------------------------

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).copied().unwrap_or(Value::None)
}

// ---- object --------------------------------------------------------------

fn native_object_repr(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let recv = arg(args, 0);
    let tn = vm.type_name(recv);
    Ok(vm.heap.new_str_value(&format!("<{tn} object>")))
}

fn native_object_eq(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    Ok(Value::Bool(vm.heap.same(arg(args, 0), arg(args, 1))))
}

fn native_noop_init(_vm: &mut crate::vm::Vm, _args: &[Value], _kw: bool) -> Result<Value, Value> {
    Ok(Value::None)
}

// ---- str -------------------------------------------------------------------

fn native_str_repr(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else { return Ok(Value::None) };
    let text = vm.heap.as_str(r).unwrap_or("").to_string();
    Ok(vm.heap.new_str_value(&format!("{text:?}")))
}

fn native_str_str(_vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    Ok(arg(args, 0))
}

fn native_str_eq(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    Ok(Value::Bool(vm.heap.values_equal(arg(args, 0), arg(args, 1))))
}

fn native_str_len(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else { return Ok(Value::Int(0)) };
    match vm.heap.get(r) {
        Obj::Str(s) => Ok(Value::Int(s.char_len as i64)),
        _ => Ok(Value::Int(0)),
    }
}

fn native_str_contains(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else {
        return Err(vm.runtime_error_val("TypeError", "__contains__ requires a str receiver"));
    };
    let haystack = vm.heap.as_str(r).unwrap_or("").to_string();
    let needle = match arg(args, 1) {
        Value::Obj(nr) => vm.heap.as_str(nr).map(|s| s.to_string()),
        _ => None,
    };
    let needle = needle.ok_or_else(|| vm.runtime_error_val("TypeError", "'in <str>' requires a str as the left operand"))?;
    Ok(Value::Bool(haystack.contains(&needle)))
}

// ---- int / float / bool -----------------------------------------------------

fn native_int_repr(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    match arg(args, 0) {
        Value::Int(i) => Ok(vm.heap.new_str_value(&i.to_string())),
        _ => Ok(vm.heap.new_str_value("0")),
    }
}

fn native_float_repr(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    match arg(args, 0) {
        Value::Float(f) => Ok(vm.heap.new_str_value(&f.to_string())),
        _ => Ok(vm.heap.new_str_value("0.0")),
    }
}

fn native_bool_repr(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    match arg(args, 0) {
        Value::Bool(b) => Ok(vm.heap.new_str_value(if b { "True" } else { "False" })),
        _ => Ok(vm.heap.new_str_value("False")),
    }
}

fn native_immediate_eq(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    Ok(Value::Bool(vm.heap.values_equal(arg(args, 0), arg(args, 1))))
}

// ---- list --------------------------------------------------------------------

fn native_list_repr(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else { return Ok(vm.heap.new_str_value("[]")) };
    let items = vm.heap.list_snapshot(r).unwrap_or_default();
    let mut pieces = Vec::with_capacity(items.len());
    for item in items {
        pieces.push(stringify_repr(vm, item)?);
    }
    Ok(vm.heap.new_str_value(&format!("[{}]", pieces.join(", "))))
}

fn native_list_eq(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let (Value::Obj(ra), Value::Obj(rb)) = (arg(args, 0), arg(args, 1)) else {
        return Ok(Value::Bool(false));
    };
    let (Some(xs), Some(ys)) = (vm.heap.list_snapshot(ra), vm.heap.list_snapshot(rb)) else {
        return Ok(Value::Bool(false));
    };
    Ok(Value::Bool(
        xs.len() == ys.len() && xs.iter().zip(ys.iter()).all(|(x, y)| vm.heap.values_equal(*x, *y)),
    ))
}

fn native_list_len(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else { return Ok(Value::Int(0)) };
    Ok(Value::Int(vm.heap.list_snapshot(r).map(|v| v.len()).unwrap_or(0) as i64))
}

fn native_list_contains(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else {
        return Err(vm.runtime_error_val("TypeError", "__contains__ requires a list receiver"));
    };
    let needle = arg(args, 1);
    let items = vm.heap.list_snapshot(r).unwrap_or_default();
    Ok(Value::Bool(items.iter().any(|v| vm.heap.values_equal(*v, needle))))
}

fn native_list_iter(_vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    // Lists are walked by the VM's iterable-snapshot fast path; this exists
    // only so user code that explicitly calls `.__iter__()` gets something
    // sensible back rather than an AttributeError.
    Ok(arg(args, 0))
}

fn native_list_append(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else {
        return Err(vm.runtime_error_val("TypeError", "append() requires a list receiver"));
    };
    let v = arg(args, 1);
    vm.heap.with_list(r, |items| items.push(v));
    Ok(Value::None)
}

fn native_list_pop(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else {
        return Err(vm.runtime_error_val("TypeError", "pop() requires a list receiver"));
    };
    let popped = vm.heap.with_list(r, |items| items.pop()).flatten();
    popped.ok_or_else(|| vm.runtime_error_val("IndexError", "pop from empty list"))
}

// ---- tuple ---------------------------------------------------------------------

fn native_tuple_repr(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else { return Ok(vm.heap.new_str_value("()")) };
    let items = match vm.heap.get(r) {
        Obj::Tuple(t) => t.clone(),
        _ => Vec::new(),
    };
    let mut pieces = Vec::with_capacity(items.len());
    for item in items {
        pieces.push(stringify_repr(vm, item)?);
    }
    let suffix = if pieces.len() == 1 { "," } else { "" };
    Ok(vm.heap.new_str_value(&format!("({}{})", pieces.join(", "), suffix)))
}

fn native_tuple_len(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else { return Ok(Value::Int(0)) };
    match vm.heap.get(r) {
        Obj::Tuple(t) => Ok(Value::Int(t.len() as i64)),
        _ => Ok(Value::Int(0)),
    }
}

fn native_tuple_iter(_vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    Ok(arg(args, 0))
}

fn native_tuple_contains(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else {
        return Err(vm.runtime_error_val("TypeError", "__contains__ requires a tuple receiver"));
    };
    let needle = arg(args, 1);
    let items = match vm.heap.get(r) {
        Obj::Tuple(t) => t.clone(),
        _ => return Ok(Value::Bool(false)),
    };
    Ok(Value::Bool(items.iter().any(|v| vm.heap.values_equal(*v, needle))))
}

// ---- dict ----------------------------------------------------------------------

fn native_dict_repr(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else { return Ok(vm.heap.new_str_value("{}")) };
    let pairs = vm.heap.with_dict(r, |t, _h| t.iter().collect::<Vec<_>>()).unwrap_or_default();
    let mut pieces = Vec::with_capacity(pairs.len());
    for (k, v) in pairs {
        let ks = stringify_repr(vm, k)?;
        let vs = stringify_repr(vm, v)?;
        pieces.push(format!("{ks}: {vs}"));
    }
    Ok(vm.heap.new_str_value(&format!("{{{}}}", pieces.join(", "))))
}

fn native_dict_len(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else { return Ok(Value::Int(0)) };
    Ok(Value::Int(vm.heap.with_dict(r, |t, _h| t.len()).unwrap_or(0) as i64))
}

fn native_dict_iter(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    native_dict_keys(vm, args, false)
}

fn native_dict_keys(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else {
        return Err(vm.runtime_error_val("TypeError", "keys() requires a dict receiver"));
    };
    let keys = vm.heap.with_dict(r, |t, _h| t.keys().collect::<Vec<_>>()).unwrap_or_default();
    let class = vm.classes.list;
    Ok(Value::Obj(vm.heap.new_list(class, keys)))
}

fn native_dict_values(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else {
        return Err(vm.runtime_error_val("TypeError", "values() requires a dict receiver"));
    };
    let vals = vm
        .heap
        .with_dict(r, |t, _h| t.iter().map(|(_, v)| v).collect::<Vec<_>>())
        .unwrap_or_default();
    let class = vm.classes.list;
    Ok(Value::Obj(vm.heap.new_list(class, vals)))
}

fn native_dict_get(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else {
        return Err(vm.runtime_error_val("TypeError", "get() requires a dict receiver"));
    };
    let key = arg(args, 1);
    let default = if args.len() > 2 { arg(args, 2) } else { Value::None };
    Ok(vm.heap.with_dict(r, |t, h| t.get(h, key)).flatten().unwrap_or(default))
}

fn native_dict_contains(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else {
        return Err(vm.runtime_error_val("TypeError", "__contains__ requires a dict receiver"));
    };
    let key = arg(args, 1);
    Ok(Value::Bool(vm.heap.with_dict(r, |t, h| t.contains(h, key)).unwrap_or(false)))
}

// ---- set ----------------------------------------------------------------------

fn native_set_len(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else { return Ok(Value::Int(0)) };
    Ok(Value::Int(vm.heap.with_set(r, |t, _h| t.len()).unwrap_or(0) as i64))
}

fn native_set_iter(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else {
        return Err(vm.runtime_error_val("TypeError", "__iter__ requires a set receiver"));
    };
    let items = vm.heap.with_set(r, |t, _h| t.keys().collect::<Vec<_>>()).unwrap_or_default();
    let class = vm.classes.list;
    Ok(Value::Obj(vm.heap.new_list(class, items)))
}

fn native_set_add(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else {
        return Err(vm.runtime_error_val("TypeError", "add() requires a set receiver"));
    };
    let v = arg(args, 1);
    vm.heap.with_set(r, |t, h| t.set(h, v, Value::Bool(true)));
    Ok(Value::None)
}

fn native_set_contains(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else {
        return Err(vm.runtime_error_val("TypeError", "__contains__ requires a set receiver"));
    };
    let v = arg(args, 1);
    Ok(Value::Bool(vm.heap.with_set(r, |t, h| t.contains(h, v)).unwrap_or(false)))
}

// ---- bytes ---------------------------------------------------------------------

fn native_bytes_len(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else { return Ok(Value::Int(0)) };
    match vm.heap.get(r) {
        Obj::Instance(i) => match &i.native {
            Some(NativeStorage::Bytes(b)) => Ok(Value::Int(b.len() as i64)),
            _ => Ok(Value::Int(0)),
        },
        _ => Ok(Value::Int(0)),
    }
}

fn native_bytes_getitem(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else {
        return Err(vm.runtime_error_val("TypeError", "expected bytes receiver"));
    };
    let Value::Int(i) = arg(args, 1) else {
        return Err(vm.runtime_error_val("TypeError", "bytes indices must be integers"));
    };
    let byte = match vm.heap.get(r) {
        Obj::Instance(inst) => match &inst.native {
            Some(NativeStorage::Bytes(b)) => b.get(i.max(0) as usize).copied(),
            _ => None,
        },
        _ => None,
    };
    byte.map(|b| Value::Int(b as i64)).ok_or_else(|| vm.runtime_error_val("IndexError", "bytes index out of range"))
}

// ---- function / method -----------------------------------------------------------

fn native_function_repr(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else { return Ok(vm.heap.new_str_value("<function>")) };
    let name = match vm.heap.get(r) {
        Obj::Closure(c) => match vm.heap.get(c.function) {
            Obj::Function(f) => f.name.to_string(),
            _ => "?".to_string(),
        },
        Obj::Native(n) => n.name.to_string(),
        Obj::BoundMethod(_) => "bound method".to_string(),
        _ => "?".to_string(),
    };
    Ok(vm.heap.new_str_value(&format!("<function {name}>")))
}

// ---- generator --------------------------------------------------------------------

fn native_generator_self(_vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    Ok(arg(args, 0))
}

fn native_generator_next(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else {
        return Err(vm.runtime_error_val("TypeError", "expected a generator"));
    };
    vm.resume_generator(r, Value::None)
}

fn native_generator_send(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else {
        return Err(vm.runtime_error_val("TypeError", "expected a generator"));
    };
    vm.resume_generator(r, arg(args, 1))
}

// ---- module -----------------------------------------------------------------------

fn native_module_repr(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else { return Ok(vm.heap.new_str_value("<module>")) };
    let name_key = vm.heap.peek_interned("__name__");
    let name = name_key
        .and_then(|k| vm.heap.instance_field_get(r, k))
        .and_then(|v| v.as_obj())
        .and_then(|s| vm.heap.as_str(s).map(|s| s.to_string()))
        .unwrap_or_else(|| "?".to_string());
    Ok(vm.heap.new_str_value(&format!("<module '{name}'>")))
}

// ---- exceptions -----------------------------------------------------------------

fn native_exception_init(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else { return Ok(Value::None) };
    let message = if args.len() > 1 { arg(args, 1) } else { vm.heap.new_str_value("") };
    let key = vm.heap.new_str_value("message");
    vm.heap.instance_field_set(r, key, message);
    Ok(Value::None)
}

fn native_exception_str(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else { return Ok(vm.heap.new_str_value("")) };
    let tn = vm.type_name(arg(args, 0));
    let msg_key = vm.heap.new_str_value("message");
    let message = vm
        .heap
        .instance_field_get(r, msg_key)
        .and_then(|v| v.as_obj())
        .and_then(|s| vm.heap.as_str(s).map(|s| s.to_string()))
        .unwrap_or_default();
    Ok(vm.heap.new_str_value(&format!("{tn}: {message}")))
}

// ---- free functions -----------------------------------------------------------------

fn native_fn_len(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let v = arg(args, 0);
    if let Value::Obj(r) = v {
        match vm.heap.get(r) {
            Obj::Str(s) => return Ok(Value::Int(s.char_len as i64)),
            Obj::Tuple(t) => return Ok(Value::Int(t.len() as i64)),
            Obj::Instance(inst) => match &inst.native {
                Some(NativeStorage::List(items)) => return Ok(Value::Int(items.len() as i64)),
                Some(NativeStorage::Dict(t)) | Some(NativeStorage::Set(t)) => return Ok(Value::Int(t.len() as i64)),
                _ => {}
            },
            _ => {}
        }
    }
    Err(vm.runtime_error_val("TypeError", "object has no len()"))
}

fn native_fn_range(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let (start, stop, step) = match args.len() {
        1 => (0, int_arg(vm, args, 0)?, 1),
        2 => (int_arg(vm, args, 0)?, int_arg(vm, args, 1)?, 1),
        _ => (int_arg(vm, args, 0)?, int_arg(vm, args, 1)?, int_arg(vm, args, 2)?),
    };
    if step == 0 {
        return Err(vm.runtime_error_val("ValueError", "range() step must not be zero"));
    }
    let mut items = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        items.push(Value::Int(i));
        i += step;
    }
    let class = vm.classes.list;
    Ok(Value::Obj(vm.heap.new_list(class, items)))
}

fn int_arg(vm: &mut crate::vm::Vm, args: &[Value], i: usize) -> Result<i64, Value> {
    match arg(args, i) {
        Value::Int(n) => Ok(n),
        _ => Err(vm.runtime_error_val("TypeError", "expected an int argument")),
    }
}

fn native_fn_sum(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let recv = arg(args, 0);
    if !matches!(recv, Value::Obj(_)) {
        return Err(vm.runtime_error_val("TypeError", "sum() requires an iterable"));
    }
    let items = vm.iterable_snapshot(recv)?;
    let mut total_i: i64 = 0;
    let mut total_f: f64 = 0.0;
    let mut is_float = false;
    for item in items {
        match item {
            Value::Int(i) if !is_float => total_i += i,
            Value::Int(i) => total_f += i as f64,
            Value::Float(f) => {
                if !is_float {
                    total_f = total_i as f64;
                    is_float = true;
                }
                total_f += f;
            }
            _ => return Err(vm.runtime_error_val("TypeError", "sum() requires numeric elements")),
        }
    }
    Ok(if is_float { Value::Float(total_f) } else { Value::Int(total_i) })
}

fn native_fn_print(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let mut pieces = Vec::with_capacity(args.len());
    for &a in args {
        pieces.push(stringify_str(vm, a)?);
    }
    println!("{}", pieces.join(" "));
    Ok(Value::None)
}

fn native_fn_repr(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let text = stringify_repr(vm, arg(args, 0))?;
    Ok(vm.heap.new_str_value(&text))
}

fn native_fn_str(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let text = stringify_str(vm, arg(args, 0))?;
    Ok(vm.heap.new_str_value(&text))
}

fn native_fn_isinstance(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let value = arg(args, 0);
    let Value::Obj(class_ref) = arg(args, 1) else {
        return Err(vm.runtime_error_val("TypeError", "isinstance() arg 2 must be a class"));
    };
    Ok(Value::Bool(vm.heap.is_instance_of(value, class_ref)))
}

fn native_fn_type(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let v = arg(args, 0);
    let class = match v {
        Value::Obj(r) => match vm.heap.get(r) {
            Obj::Instance(i) => i.class,
            Obj::Str(_) => vm.classes.str_,
            Obj::Bytes(_) => vm.classes.bytes,
            Obj::Tuple(_) => vm.classes.tuple,
            Obj::Closure(_) | Obj::Native(_) => vm.classes.function,
            Obj::BoundMethod(_) => vm.classes.method,
            Obj::Class(_) => vm.classes.object,
            Obj::Property(_) => vm.classes.property,
            Obj::Function(_) | Obj::Upvalue(_) => vm.classes.object,
        },
        Value::None => vm.classes.object,
        Value::Bool(_) => vm.classes.bool_,
        Value::Int(_) => vm.classes.int_,
        Value::Float(_) => vm.classes.float_,
        Value::Handler(_) | Value::Kwargs(_) => vm.classes.object,
    };
    Ok(Value::Obj(class))
}

fn native_fn_next(vm: &mut crate::vm::Vm, args: &[Value], _kw: bool) -> Result<Value, Value> {
    let Value::Obj(r) = arg(args, 0) else {
        return Err(vm.runtime_error_val("TypeError", "next() requires a generator"));
    };
    let result = vm.resume_generator(r, Value::None)?;
    if vm.heap.same(result, Value::Obj(r)) {
        return Err(vm.runtime_error_val("StopIteration", "generator exhausted"));
    }
    Ok(result)
}

// ---- shared stringification helpers ------------------------------------------------

/// Public wrapper so the REPL can render a result the same way `repr()`
/// does, without reaching into this module's private dispatch helpers.
pub fn display_repr(vm: &mut crate::vm::Vm, v: Value) -> Result<String, Value> {
    stringify_repr(vm, v)
}

/// `str()`-style rendering: dispatches through `__str__` if the value's class
/// defines one, otherwise falls back to `Display`-level immediate formatting.
fn stringify_str(vm: &mut crate::vm::Vm, v: Value) -> Result<String, Value> {
    if let Value::Obj(r) = v {
        if let Obj::Instance(inst) = vm.heap.get(r) {
            let class = inst.class;
            if let Obj::Class(c) = vm.heap.get(class) {
                if let Some(str_fn) = c.dunders.str {
                    let result = vm.invoke_value(Value::Obj(str_fn), Some(v), &[])?;
                    if let Value::Obj(sr) = result {
                        if let Some(s) = vm.heap.as_str(sr) {
                            return Ok(s.to_string());
                        }
                    }
                }
            }
        }
        if let Obj::Str(s) = vm.heap.get(r) {
            return Ok(s.as_str().to_string());
        }
    }
    Ok(format!("{v}"))
}

/// `repr()`-style rendering: same dispatch but through `__repr__`, and a
/// string receiver renders with quotes rather than echoing its own content.
fn stringify_repr(vm: &mut crate::vm::Vm, v: Value) -> Result<String, Value> {
    if let Value::Obj(r) = v {
        if let Obj::Instance(inst) = vm.heap.get(r) {
            let class = inst.class;
            if let Obj::Class(c) = vm.heap.get(class) {
                if let Some(repr_fn) = c.dunders.repr {
                    let result = vm.invoke_value(Value::Obj(repr_fn), Some(v), &[])?;
                    if let Value::Obj(sr) = result {
                        if let Some(s) = vm.heap.as_str(sr) {
                            return Ok(s.to_string());
                        }
                    }
                }
            }
        }
        if let Obj::Str(s) = vm.heap.get(r) {
            return Ok(format!("{:?}", s.as_str()));
        }
    }
    Ok(format!("{v}"))
}
