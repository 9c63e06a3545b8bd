//! Bytecode representation, compiler, and virtual machine.
//!
//! Source text flows through the scanner into the single-pass compiler,
//! which emits bytecode straight into a function's [`chunk::Chunk`] without
//! building an AST. The VM executes chunks on an operand stack with call
//! frames, closures, and method dispatch.
//!
//! - `op` — opcode enum
//! - `chunk` — byte buffer + source lines + constant pool
//! - `compiler` — Pratt parser emitting bytecode
//! - `debug` — disassembler
//! - `vm` — dispatch loop, call machinery, natives

pub(crate) mod chunk;
pub(crate) mod compiler;
pub(crate) mod debug;
pub(crate) mod op;
pub(crate) mod vm;
