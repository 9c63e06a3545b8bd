//! Chunk disassembler and execution-trace rendering.
//!
//! Pure formatting: callers decide where the text goes (stderr for the
//! `print_code` and tracing options, assertions in tests).

use std::fmt::Write as _;

use crate::{
    bytecode::{chunk::Chunk, op::Opcode},
    heap::Heap,
    value::{Value, format_value, write_value},
};

/// Renders a whole chunk with a header line.
pub(crate) fn disassemble_chunk(chunk: &Chunk, name: &str, heap: &Heap) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset, heap, &mut out);
        out.push('\n');
    }
    out
}

/// Renders the instruction at `offset`, returning the offset of the next one.
pub(crate) fn disassemble_instruction(chunk: &Chunk, offset: usize, heap: &Heap, out: &mut String) -> usize {
    let _ = write!(out, "{offset:04} ");
    if offset > 0 && chunk.line(offset) == chunk.line(offset - 1) {
        out.push_str("   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.line(offset));
    }

    let op = Opcode::decode(chunk.code()[offset]);
    match op {
        Opcode::Constant
        | Opcode::GetGlobal
        | Opcode::DefineGlobal
        | Opcode::SetGlobal
        | Opcode::Class
        | Opcode::Method
        | Opcode::GetProperty
        | Opcode::SetProperty
        | Opcode::GetSuper => constant_instruction(op, chunk, offset, heap, out),
        Opcode::GetLocal
        | Opcode::SetLocal
        | Opcode::GetUpvalue
        | Opcode::SetUpvalue
        | Opcode::Call
        | Opcode::ArrayBuild
        | Opcode::MapBuild => byte_instruction(op, chunk, offset, out),
        Opcode::Jump | Opcode::JumpIfFalse => jump_instruction(op, 1, chunk, offset, out),
        Opcode::Loop => jump_instruction(op, -1, chunk, offset, out),
        Opcode::Invoke | Opcode::SuperInvoke => invoke_instruction(op, chunk, offset, heap, out),
        Opcode::Closure => closure_instruction(chunk, offset, heap, out),
        _ => {
            out.push_str(op.name());
            offset + 1
        }
    }
}

/// One line showing the operand stack, as the execution tracer prints it.
pub(crate) fn stack_line(stack: &[Value], heap: &Heap) -> String {
    let mut out = String::from("          ");
    for &value in stack {
        out.push_str("[ ");
        write_value(&mut out, value, heap);
        out.push_str(" ]");
    }
    out
}

fn constant_instruction(op: Opcode, chunk: &Chunk, offset: usize, heap: &Heap, out: &mut String) -> usize {
    let index = chunk.code()[offset + 1];
    let rendered = format_value(chunk.constant(index), heap);
    let _ = write!(out, "{:<16} {index:4} '{rendered}'", op.name());
    offset + 2
}

fn byte_instruction(op: Opcode, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let operand = chunk.code()[offset + 1];
    let _ = write!(out, "{:<16} {operand:4}", op.name());
    offset + 2
}

fn jump_instruction(op: Opcode, sign: i64, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let jump = u16::from_be_bytes([chunk.code()[offset + 1], chunk.code()[offset + 2]]);
    let target = offset as i64 + 3 + sign * i64::from(jump);
    let _ = write!(out, "{:<16} {offset:4} -> {target}", op.name());
    offset + 3
}

fn invoke_instruction(op: Opcode, chunk: &Chunk, offset: usize, heap: &Heap, out: &mut String) -> usize {
    let index = chunk.code()[offset + 1];
    let arg_count = chunk.code()[offset + 2];
    let rendered = format_value(chunk.constant(index), heap);
    let _ = write!(out, "{:<16} ({arg_count} args) {index:4} '{rendered}'", op.name());
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize, heap: &Heap, out: &mut String) -> usize {
    let index = chunk.code()[offset + 1];
    let constant = chunk.constant(index);
    let rendered = format_value(constant, heap);
    let _ = write!(out, "{:<16} {index:4} {rendered}", Opcode::Closure.name());

    // Trailing {is_local, index} pairs, one per captured upvalue.
    let upvalue_count = match constant {
        Value::Ref(id) => heap.function(id).upvalue_count,
        _ => 0,
    };
    let mut next = offset + 2;
    for _ in 0..upvalue_count {
        let is_local = chunk.code()[next];
        let slot = chunk.code()[next + 1];
        let kind = if is_local == 1 { "local" } else { "upvalue" };
        let _ = write!(out, "\n{next:04}      |                     {kind} {slot}");
        next += 2;
    }
    next
}
