// File: src/module.rs
//
// Resolves an `import`/`from ... import ...` name to a compiled, executed
// module, caching the result on the `Vm` itself (`Vm::module_cache`) so a
// name is only ever parsed, compiled, and run once per process. A loaded
// module is an ordinary `Instance` of the `module` root class whose fields
// are that module's top-level globals -- `from X import Y` is then nothing
// more than an attribute lookup (see `vm.rs`'s `Op::ImportFrom`).

use crate::errors::RuffError;
use crate::value::ObjRef;
use crate::vm::{Vm, VmResult};
use std::fs;
use std::path::{Path, PathBuf};

/// Search order for resolving a bare module name to a source file: the
/// current directory first, then a `modules/` subdirectory sibling to it.
fn search_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("."), PathBuf::from("./modules")]
}

fn resolve_path(name: &str) -> Option<PathBuf> {
    let relative = name.replace('.', "/");
    let filename = format!("{relative}.ruff");
    for dir in search_paths() {
        let candidate = dir.join(&filename);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn format_parse_errors(errors: &[RuffError]) -> String {
    errors.iter().map(|e| e.message.clone()).collect::<Vec<_>>().join("; ")
}

/// Loads (or returns the cached) module for `name`, running its top-level
/// code the first time against a fresh globals table.
pub fn load(vm: &mut Vm, name: &str) -> VmResult<ObjRef> {
    if let Some(&cached) = vm.module_cache.get(name) {
        return Ok(cached);
    }

    if vm.loading_stack.iter().any(|n| n == name) {
        return Err(vm.runtime_error_val(
            "ImportError",
            &format!("circular import detected while loading '{name}'"),
        ));
    }

    let path = resolve_path(name)
        .ok_or_else(|| vm.runtime_error_val("ImportError", &format!("no module named '{name}'")))?;

    let source = read_source(vm, &path, name)?;

    vm.loading_stack.push(name.to_string());
    let result = compile_and_run(vm, &source, &path, name);
    vm.loading_stack.pop();

    let module_ref = result?;
    vm.module_cache.insert(name.to_string(), module_ref);
    Ok(module_ref)
}

fn read_source(vm: &mut Vm, path: &Path, name: &str) -> VmResult<String> {
    fs::read_to_string(path)
        .map_err(|e| vm.runtime_error_val("ImportError", &format!("failed to read module '{name}': {e}")))
}

fn compile_and_run(vm: &mut Vm, source: &str, path: &Path, name: &str) -> VmResult<ObjRef> {
    let filename = path.to_string_lossy().to_string();
    let function = crate::compiler::compile(source, &filename, &mut vm.heap)
        .map_err(|errors| vm.runtime_error_val("SyntaxError", &format_parse_errors(&errors)))?;

    let module_ref = vm.new_module(name);
    vm.interpret_in_module(function, module_ref)?;
    Ok(module_ref)
}
