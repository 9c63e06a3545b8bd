#![doc = include_str!("../../../README.md")]

mod bytecode;
mod error;
mod heap;
mod intern;
mod io;
mod scanner;
mod table;
mod tracer;
mod value;

pub use crate::{
    bytecode::vm::{Vm, VmOptions},
    error::{CompileError, ErrorLocation, InterpretError, RuntimeError, TraceFrame},
    heap::HeapStats,
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    tracer::{ExecutionTracer, NoopTracer, StderrTracer},
};
