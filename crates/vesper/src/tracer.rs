//! Execution tracing hooks.
//!
//! The VM renders each instruction (current stack contents plus the
//! disassembled instruction) only when a tracer says it wants them, so the
//! default [`NoopTracer`] costs nothing per instruction. [`StderrTracer`]
//! reproduces the classic trace format on stderr; tests can implement the
//! trait to capture the stream instead.

/// Receives rendered per-instruction trace lines from the VM.
pub trait ExecutionTracer {
    /// Whether the VM should spend time rendering trace text at all.
    fn enabled(&self) -> bool {
        false
    }

    /// Called before each instruction executes with the rendered stack line
    /// and disassembly.
    fn instruction(&mut self, rendered: &str) {
        let _ = rendered;
    }
}

/// Tracer that does nothing; the default.
#[derive(Debug, Default)]
pub struct NoopTracer;

impl ExecutionTracer for NoopTracer {}

/// Tracer printing every instruction to stderr.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl ExecutionTracer for StderrTracer {
    fn enabled(&self) -> bool {
        true
    }

    fn instruction(&mut self, rendered: &str) {
        eprintln!("{rendered}");
    }
}
