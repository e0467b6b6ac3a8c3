// File: src/disassemble.rs
//
// Pure, read-only bytecode renderer. Never touches the VM or runs anything;
// takes a `Chunk` (plus the `Heap` that holds its constant pool's objects,
// needed to print a function's name/upvalue count) and renders clox-style
// disassembly: offset, source line (blank when unchanged from the previous
// row), mnemonic, decoded operand.

use crate::chunk::{Chunk, Op};
use crate::heap::Heap;
use crate::object::Obj;
use crate::value::Value;
use std::fmt::Write as _;

/// Renders every instruction in `chunk` under a `== name ==` banner.
pub fn disassemble_chunk(chunk: &Chunk, heap: &Heap, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    let mut last_line: Option<u32> = None;
    while offset < chunk.code.len() {
        let (line_text, next) = disassemble_instruction(chunk, heap, offset, &mut last_line);
        out.push_str(&line_text);
        out.push('\n');
        offset = next;
    }
    out
}

fn disassemble_instruction(chunk: &Chunk, heap: &Heap, offset: usize, last_line: &mut Option<u32>) -> (String, usize) {
    let line = chunk.line_at(offset);
    let line_col = if *last_line == Some(line) { "   |".to_string() } else { format!("{line:4}") };
    *last_line = Some(line);

    let byte = chunk.code[offset];
    let Some(op) = Op::from_u8(byte) else {
        return (format!("{offset:04} {line_col} Unknown opcode {byte}"), offset + 1);
    };
    let operand_len = op.operand_len();
    let operand_offset = offset + 1;
    let operand = read_operand(chunk, operand_offset, operand_len);
    let next = operand_offset + operand_len;
    let mnemonic = op.short_form().unwrap_or(op);

    let body = match mnemonic {
        Op::Constant | Op::DefineGlobal | Op::GetGlobal | Op::SetGlobal | Op::DelGlobal | Op::GetProperty
        | Op::SetProperty | Op::DelProperty | Op::Import | Op::ImportFrom | Op::Method => {
            format!("{:<16} {:4} '{}'", format!("{mnemonic:?}"), operand, describe_constant(chunk, heap, operand))
        }
        Op::GetLocal | Op::SetLocal | Op::GetUpvalue | Op::SetUpvalue | Op::Dup | Op::Tuple | Op::Unpack
        | Op::Kwargs | Op::ExpandArgs | Op::Inc | Op::Call => {
            format!("{:<16} {:4}", format!("{mnemonic:?}"), operand)
        }
        Op::GetSuper => format!("{:<16} {:4} '{}'", format!("{mnemonic:?}"), operand, describe_constant(chunk, heap, operand)),
        Op::Class => format!("{:<16} {:4} '{}'", format!("{mnemonic:?}"), operand, describe_constant(chunk, heap, operand)),
        Op::Jump | Op::JumpIfFalse | Op::JumpIfTrue | Op::PushTry | Op::PushWith => {
            let target = offset + 3 + operand;
            format!("{:<16} {:4} -> {}", format!("{mnemonic:?}"), operand, target)
        }
        Op::Loop => {
            let target = offset + 3 - operand;
            format!("{:<16} {:4} -> {}", "Loop", operand, target)
        }
        Op::Closure => {
            let mut s = format!("{:<16} {:4} '{}'", "Closure", operand, describe_constant(chunk, heap, operand));
            let (names, total) = closure_upvalues(chunk, heap, operand, next);
            for (i, (is_local, idx)) in names.iter().enumerate() {
                let kind = if *is_local { "local" } else { "upvalue" };
                let _ = write!(s, "\n{:04}      |                     {i:4} {kind} {idx}", next + i * 2);
            }
            return (format!("{offset:04} {line_col} {s}"), next + total * 2);
        }
        _ => format!("{mnemonic:?}"),
    };
    (format!("{offset:04} {line_col} {body}"), next)
}

fn read_operand(chunk: &Chunk, offset: usize, len: usize) -> usize {
    match len {
        0 => 0,
        1 => chunk.code[offset] as usize,
        2 => chunk.read_u16(offset) as usize,
        3 => chunk.read_u24(offset) as usize,
        _ => unreachable!("operand length is always 0..=3"),
    }
}

fn closure_upvalues(chunk: &Chunk, heap: &Heap, const_idx: usize, byte_offset: usize) -> (Vec<(bool, u8)>, usize) {
    let count = match chunk.constants.get(const_idx) {
        Some(Value::Obj(r)) => match heap.get(*r) {
            Obj::Function(f) => f.upvalue_count,
            _ => 0,
        },
        _ => 0,
    };
    let mut pairs = Vec::with_capacity(count);
    for i in 0..count {
        let is_local = chunk.code[byte_offset + i * 2] != 0;
        let index = chunk.code[byte_offset + i * 2 + 1];
        pairs.push((is_local, index));
    }
    (pairs, count)
}

/// Best-effort human-readable rendering of a constant-pool entry, used only
/// for disassembly output -- never consulted by the VM itself.
fn describe_constant(chunk: &Chunk, heap: &Heap, index: usize) -> String {
    match chunk.constants.get(index) {
        None => "?".to_string(),
        Some(Value::Obj(r)) => match heap.get(*r) {
            Obj::Str(s) => s.as_str().to_string(),
            Obj::Function(f) => format!("<function {}>", f.name),
            _ => format!("{}", Value::Obj(*r)),
        },
        Some(v) => format!("{v}"),
    }
}
