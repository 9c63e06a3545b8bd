//! Stack-based virtual machine.
//!
//! The VM owns all interpreter state: the heap arena and its GC accounting,
//! the string intern pool, the globals table, the operand stack, the
//! call-frame stack (capped at 64 frames), and the open-upvalue list. One
//! `Vm` runs one script at a time; `interpret` is synchronous and
//! non-reentrant, and a finished run always leaves both stacks empty.
//!
//! Dispatch is a straight decode-execute loop over the current frame's
//! chunk. Runtime errors propagate out of the loop as `Result`, carrying a
//! stack trace built from the frames before they are reset.

pub(crate) mod natives;

use std::{borrow::Cow, time::Instant};

use smallvec::SmallVec;

use crate::{
    bytecode::{compiler, debug, op::Opcode},
    error::{InterpretError, RuntimeError, TraceFrame},
    heap::{BoundMethod, Class, Closure, Heap, HeapData, HeapId, HeapStats, Instance, Native, Upvalue},
    intern::Interner,
    io::PrintWriter,
    table::Table,
    tracer::{ExecutionTracer, NoopTracer, StderrTracer},
    value::{Value, format_value},
};
use natives::{NATIVES, NativeCtx, NativeFn};

/// Maximum call depth; exceeding it is a "Stack overflow." runtime error.
const FRAMES_MAX: usize = 64;
/// Operand-stack capacity reserved up front: every frame can address up to
/// 256 slots.
const STACK_RESERVE: usize = FRAMES_MAX * 256;

/// Runtime toggles, all off by default.
///
/// These are diagnostics, not language features: chunk dumps after
/// compilation, per-instruction execution tracing, GC logging, and a stress
/// mode that collects on every allocation to shake out missing roots.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    /// Trace each instruction (stack contents plus disassembly) to stderr.
    pub trace_execution: bool,
    /// Dump each compiled chunk to stderr once compilation succeeds.
    pub print_code: bool,
    /// Run the collector at every allocation safe point.
    pub stress_gc: bool,
    /// Log allocation, mark, and free events to stderr.
    pub log_gc: bool,
}

/// One in-progress call: the closure being run, the instruction pointer into
/// its chunk, and the stack slot where its window begins (slot 0 holds the
/// callable, or the receiver for methods).
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: HeapId,
    /// The closure's function, cached to skip one heap hop per fetch.
    function: HeapId,
    ip: usize,
    base: usize,
}

/// The interpreter context. See the module docs for what it owns.
pub struct Vm {
    heap: Heap,
    strings: Interner,
    globals: Table,
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    /// Open upvalues, strictly descending by stack slot; no two entries
    /// alias the same slot.
    open_upvalues: Vec<HeapId>,
    /// Cached `"init"` so constructor lookup never re-interns.
    init_string: HeapId,
    options: VmOptions,
    started: Instant,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Pops two numbers, pushes `wrap(a op b)`; errors unless both operands are
/// numbers.
macro_rules! binary_op {
    ($self:expr, $wrap:expr, $op:tt) => {{
        let (Value::Number(b), Value::Number(a)) = ($self.peek(0), $self.peek(1)) else {
            return Err($self.runtime_error("Operands must be numbers."));
        };
        $self.pop();
        $self.pop();
        $self.push($wrap(a $op b));
    }};
}

impl Vm {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    #[must_use]
    pub fn with_options(options: VmOptions) -> Self {
        let mut heap = Heap::new(options.stress_gc, options.log_gc);
        let mut strings = Interner::new();
        let init_string = strings.intern(&mut heap, "init");
        let mut vm = Self {
            heap,
            strings,
            globals: Table::new(),
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: Vec::with_capacity(STACK_RESERVE),
            open_upvalues: Vec::new(),
            init_string,
            options,
            started: Instant::now(),
        };
        for &(name, func) in NATIVES {
            vm.define_native(name, func);
        }
        vm
    }

    /// Compiles and runs `source`, writing program output to `print`.
    ///
    /// Returns `InterpretError::Compile` (exit code 65) if parsing failed and
    /// nothing ran, or `InterpretError::Runtime` (exit code 70) if execution
    /// aborted. The VM survives either failure and can interpret again;
    /// globals persist across calls.
    pub fn interpret(&mut self, source: &str, print: &mut dyn PrintWriter) -> Result<(), InterpretError> {
        if self.options.trace_execution {
            self.interpret_traced(source, print, &mut StderrTracer)
        } else {
            self.interpret_traced(source, print, &mut NoopTracer)
        }
    }

    /// Like [`Vm::interpret`], with an explicit execution tracer.
    pub fn interpret_traced(
        &mut self,
        source: &str,
        print: &mut dyn PrintWriter,
        tracer: &mut dyn ExecutionTracer,
    ) -> Result<(), InterpretError> {
        self.reset();
        // Globals (natives included) and the cached `init` string must
        // survive any collection the compiler triggers.
        let globals = &self.globals;
        let init_string = self.init_string;
        let function = compiler::compile(
            source,
            &mut self.heap,
            &mut self.strings,
            self.options.print_code,
            &move |marker| {
                marker.mark_table(globals);
                marker.mark(init_string);
            },
        )
        .map_err(InterpretError::Compile)?;

        // Root the raw function on the stack before wrapping it, so a
        // collection triggered by the closure allocation cannot reclaim it.
        self.push(Value::Ref(function));
        self.maybe_collect();
        let closure = self.heap.alloc(HeapData::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Ref(closure));
        self.call_closure(closure, 0).map_err(InterpretError::Runtime)?;

        self.run(print, tracer).map_err(InterpretError::Runtime)
    }

    /// Heap and intern-pool statistics snapshot.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        let mut stats = self.heap.stats();
        stats.interned_strings = self.strings.len();
        stats
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    fn define_native(&mut self, name: &str, func: NativeFn) {
        let name_id = self.strings.intern(&mut self.heap, name);
        let native = self.heap.alloc(HeapData::Native(Native { name: name_id, func }));
        let hash = self.heap.str_hash(name_id);
        self.globals.set(name_id, hash, Value::Ref(native));
    }

    // === Stack and frame primitives ===

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> CallFrame {
        *self.frames.last().expect("no active call frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let byte = self.heap.function(frame.function).chunk.code()[frame.ip];
        frame.ip += 1;
        byte
    }

    /// Reads a two-byte big-endian operand.
    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        u16::from_be_bytes([high, low])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte();
        let frame = self.frames.last().expect("no active call frame");
        self.heap.function(frame.function).chunk.constant(index)
    }

    /// Reads a constant the compiler guarantees to be an interned string.
    fn read_string(&mut self) -> HeapId {
        match self.read_constant() {
            Value::Ref(id) => id,
            other => unreachable!("name constant is not a string: {other:?}"),
        }
    }

    // === GC safe point ===

    /// Collects if due. Roots: the operand stack, every frame's closure, the
    /// open upvalues, the globals table, and the cached `init` string.
    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let stack = &self.stack;
        let frames = &self.frames;
        let open_upvalues = &self.open_upvalues;
        let globals = &self.globals;
        let init_string = self.init_string;
        self.heap.collect(&mut self.strings, |marker| {
            for &value in stack {
                marker.mark_value(value);
            }
            for frame in frames {
                marker.mark(frame.closure);
            }
            for &upvalue in open_upvalues {
                marker.mark(upvalue);
            }
            marker.mark_table(globals);
            marker.mark(init_string);
        });
    }

    // === Error reporting ===

    /// Builds a runtime error with the current stack trace, then resets the
    /// operand and frame stacks.
    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            // ip already advanced past the failing instruction's operands;
            // any byte of the instruction maps to the same source line.
            let offset = frame.ip.saturating_sub(1);
            trace.push(TraceFrame {
                line: function.chunk.line(offset),
                function: function.name.map(|id| self.heap.str_text(id).to_string()),
            });
        }
        self.reset();
        RuntimeError {
            message: message.into(),
            trace,
        }
    }

    // === Calls ===

    fn call_value(
        &mut self,
        callee: Value,
        arg_count: usize,
        print: &mut dyn PrintWriter,
    ) -> Result<(), RuntimeError> {
        enum Callee {
            Closure(HeapId),
            Native(NativeFn),
            Class(HeapId),
            Bound { receiver: Value, method: HeapId },
        }
        let kind = match callee {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Closure(_) => Some(Callee::Closure(id)),
                HeapData::Native(native) => Some(Callee::Native(native.func)),
                HeapData::Class(_) => Some(Callee::Class(id)),
                HeapData::BoundMethod(bound) => Some(Callee::Bound {
                    receiver: bound.receiver,
                    method: bound.method,
                }),
                _ => None,
            },
            _ => None,
        };
        match kind {
            Some(Callee::Closure(closure)) => self.call_closure(closure, arg_count),
            Some(Callee::Native(func)) => self.call_native(func, arg_count, print),
            Some(Callee::Class(class)) => self.call_class(class, arg_count),
            Some(Callee::Bound { receiver, method }) => {
                // The receiver takes the callee slot: slot 0 of the new frame.
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, arg_count)
            }
            None => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    /// Pushes a frame for `closure`, validating arity and call depth.
    fn call_closure(&mut self, closure: HeapId, arg_count: usize) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;
        let arity = usize::from(self.heap.function(function).arity);
        if arg_count != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {arg_count}.")));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            base: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    /// `SomeClass(args)`: builds an instance into the callee slot and runs
    /// `init` if the class has one.
    fn call_class(&mut self, class: HeapId, arg_count: usize) -> Result<(), RuntimeError> {
        self.maybe_collect();
        let instance = self.heap.alloc(HeapData::Instance(Instance {
            class,
            fields: Table::new(),
        }));
        let slot = self.stack.len() - arg_count - 1;
        self.stack[slot] = Value::Ref(instance);

        let init_hash = self.heap.str_hash(self.init_string);
        if let Some(initializer) = self.heap.class(class).methods.get(self.init_string, init_hash) {
            let Value::Ref(closure) = initializer else {
                unreachable!("method table values are closures")
            };
            self.call_closure(closure, arg_count)
        } else if arg_count != 0 {
            Err(self.runtime_error(format!("Expected 0 arguments but got {arg_count}.")))
        } else {
            Ok(())
        }
    }

    fn call_native(
        &mut self,
        func: NativeFn,
        arg_count: usize,
        print: &mut dyn PrintWriter,
    ) -> Result<(), RuntimeError> {
        let base = self.stack.len() - arg_count;
        let args: SmallVec<[Value; 8]> = SmallVec::from_slice(&self.stack[base..]);
        let result = {
            let mut ctx = NativeCtx {
                heap: &mut self.heap,
                strings: &mut self.strings,
                print,
                started: self.started,
            };
            func(&mut ctx, &args)
        };
        match result {
            Ok(value) => {
                // Drop the arguments and the callee, push the result.
                self.stack.truncate(base - 1);
                self.push(value);
                self.maybe_collect();
                Ok(())
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    /// `receiver.name(args)` without materializing a bound method. A field
    /// with that name shadows the method and is called as a plain value.
    fn invoke(&mut self, name: HeapId, arg_count: usize, print: &mut dyn PrintWriter) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count);
        let instance_id = match receiver {
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Instance(_)) => id,
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };
        let hash = self.heap.str_hash(name);
        if let Some(field) = self.heap.instance(instance_id).fields.get(name, hash) {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = field;
            return self.call_value(field, arg_count, print);
        }
        let class = self.heap.instance(instance_id).class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(&mut self, class: HeapId, name: HeapId, arg_count: usize) -> Result<(), RuntimeError> {
        let hash = self.heap.str_hash(name);
        let Some(method) = self.heap.class(class).methods.get(name, hash) else {
            let message = format!("Undefined property '{}'.", self.heap.str_text(name));
            return Err(self.runtime_error(message));
        };
        let Value::Ref(closure) = method else {
            unreachable!("method table values are closures")
        };
        self.call_closure(closure, arg_count)
    }

    /// Replaces the instance on top of the stack with a `BoundMethod` pairing
    /// it with `class`'s method `name`.
    fn bind_method(&mut self, class: HeapId, name: HeapId) -> Result<(), RuntimeError> {
        let hash = self.heap.str_hash(name);
        let Some(method) = self.heap.class(class).methods.get(name, hash) else {
            let message = format!("Undefined property '{}'.", self.heap.str_text(name));
            return Err(self.runtime_error(message));
        };
        let Value::Ref(closure) = method else {
            unreachable!("method table values are closures")
        };
        self.maybe_collect();
        let bound = self.heap.alloc(HeapData::BoundMethod(BoundMethod {
            receiver: self.peek(0),
            method: closure,
        }));
        self.pop();
        self.push(Value::Ref(bound));
        Ok(())
    }

    // === Upvalues ===

    /// Returns the open upvalue for `slot`, creating and inserting one in
    /// descending-slot order if no closure has captured that slot yet.
    fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        let mut index = 0;
        while index < self.open_upvalues.len() {
            let id = self.open_upvalues[index];
            let Upvalue::Open(existing) = *self.heap.upvalue(id) else {
                unreachable!("open upvalue list holds only open upvalues")
            };
            if existing > slot {
                index += 1;
                continue;
            }
            if existing == slot {
                return id;
            }
            break;
        }
        self.maybe_collect();
        let created = self.heap.alloc(HeapData::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(index, created);
        created
    }

    /// Closes every open upvalue at or above `from_slot`: the value moves
    /// off the stack into the upvalue, which leaves the open list.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&id) = self.open_upvalues.first() {
            let Upvalue::Open(slot) = *self.heap.upvalue(id) else {
                unreachable!("open upvalue list holds only open upvalues")
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(id) = Upvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // === Dispatch loop ===

    fn run(&mut self, print: &mut dyn PrintWriter, tracer: &mut dyn ExecutionTracer) -> Result<(), RuntimeError> {
        loop {
            if tracer.enabled() {
                let frame = self.frame();
                let mut text = debug::stack_line(&self.stack, &self.heap);
                text.push('\n');
                let chunk = &self.heap.function(frame.function).chunk;
                debug::disassemble_instruction(chunk, frame.ip, &self.heap, &mut text);
                tracer.instruction(&text);
            }

            let op = Opcode::decode(self.read_byte());
            match op {
                Opcode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                Opcode::Nil => self.push(Value::Nil),
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::GetLocal => {
                    let slot = usize::from(self.read_byte());
                    let base = self.frame().base;
                    self.push(self.stack[base + slot]);
                }
                Opcode::SetLocal => {
                    let slot = usize::from(self.read_byte());
                    let base = self.frame().base;
                    // Assignment is an expression; the value stays on top.
                    self.stack[base + slot] = self.peek(0);
                }
                Opcode::GetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.str_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            let message = format!("Undefined variable '{}'.", self.heap.str_text(name));
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                Opcode::DefineGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                Opcode::SetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        // The assignment tentatively inserted a fresh entry;
                        // remove it so later reads don't see a zombie.
                        self.globals.delete(name, hash);
                        let message = format!("Undefined variable '{}'.", self.heap.str_text(name));
                        return Err(self.runtime_error(message));
                    }
                }
                Opcode::GetUpvalue => {
                    let index = usize::from(self.read_byte());
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                    let value = match *self.heap.upvalue(upvalue) {
                        Upvalue::Open(slot) => self.stack[slot],
                        Upvalue::Closed(value) => value,
                    };
                    self.push(value);
                }
                Opcode::SetUpvalue => {
                    let index = usize::from(self.read_byte());
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                    let value = self.peek(0);
                    match *self.heap.upvalue(upvalue) {
                        Upvalue::Open(slot) => self.stack[slot] = value,
                        Upvalue::Closed(_) => *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(value),
                    }
                }
                Opcode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                Opcode::Greater => binary_op!(self, Value::Bool, >),
                Opcode::Less => binary_op!(self, Value::Bool, <),
                Opcode::Add => self.add()?,
                Opcode::Subtract => binary_op!(self, Value::Number, -),
                Opcode::Multiply => binary_op!(self, Value::Number, *),
                Opcode::Divide => binary_op!(self, Value::Number, /),
                Opcode::Modulo => {
                    let (Value::Number(b), Value::Number(a)) = (self.peek(0), self.peek(1)) else {
                        return Err(self.runtime_error("Operands must be numbers."));
                    };
                    self.pop();
                    self.pop();
                    self.push(Value::Number(a - b * (a / b).floor()));
                }
                Opcode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsy()));
                }
                Opcode::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }
                Opcode::Print => {
                    let value = self.pop();
                    let text = format_value(value, &self.heap);
                    print.stdout_write(Cow::Owned(text));
                    print.stdout_push('\n');
                }
                Opcode::Jump => {
                    let offset = usize::from(self.read_u16());
                    self.frames.last_mut().expect("no active call frame").ip += offset;
                }
                Opcode::JumpIfFalse => {
                    let offset = usize::from(self.read_u16());
                    if self.peek(0).is_falsy() {
                        self.frames.last_mut().expect("no active call frame").ip += offset;
                    }
                }
                Opcode::Loop => {
                    let offset = usize::from(self.read_u16());
                    self.frames.last_mut().expect("no active call frame").ip -= offset;
                }
                Opcode::Call => {
                    let arg_count = usize::from(self.read_byte());
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count, print)?;
                }
                Opcode::Invoke => {
                    let name = self.read_string();
                    let arg_count = usize::from(self.read_byte());
                    self.invoke(name, arg_count, print)?;
                }
                Opcode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = usize::from(self.read_byte());
                    let Value::Ref(superclass) = self.pop() else {
                        unreachable!("the compiler pushes the validated superclass")
                    };
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                Opcode::Closure => {
                    let Value::Ref(function) = self.read_constant() else {
                        unreachable!("Closure operand is a function constant")
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    self.maybe_collect();
                    let closure = self.heap.alloc(HeapData::Closure(Closure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    self.push(Value::Ref(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = usize::from(self.read_byte());
                        let upvalue = if is_local {
                            let base = self.frame().base;
                            self.capture_upvalue(base + index)
                        } else {
                            self.heap.closure(self.frame().closure).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                Opcode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                Opcode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no active call frame");
                    self.close_upvalues(frame.base);
                    if self.frames.is_empty() {
                        // The top-level script itself; execution is done.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(result);
                }
                Opcode::Class => {
                    let name = self.read_string();
                    self.maybe_collect();
                    let class = self.heap.alloc(HeapData::Class(Class {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Ref(class));
                }
                Opcode::Inherit => {
                    let superclass = self.peek(1);
                    let super_id = match superclass {
                        Value::Ref(id) if matches!(self.heap.get(id), HeapData::Class(_)) => id,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let Value::Ref(sub_id) = self.peek(0) else {
                        unreachable!("Inherit operates on the class being declared")
                    };
                    // Methods are copied down once; later overrides in the
                    // subclass simply replace their entries.
                    let methods = self.heap.class(super_id).methods.clone();
                    self.heap.class_mut(sub_id).methods.add_all(&methods);
                    self.pop();
                }
                Opcode::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let Value::Ref(class) = self.peek(1) else {
                        unreachable!("Method operates on the class being declared")
                    };
                    let hash = self.heap.str_hash(name);
                    self.heap.class_mut(class).methods.set(name, hash, method);
                    self.pop();
                }
                Opcode::GetProperty => {
                    let name = self.read_string();
                    let instance_id = match self.peek(0) {
                        Value::Ref(id) if matches!(self.heap.get(id), HeapData::Instance(_)) => id,
                        _ => return Err(self.runtime_error("Only instances have properties.")),
                    };
                    let hash = self.heap.str_hash(name);
                    if let Some(value) = self.heap.instance(instance_id).fields.get(name, hash) {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = self.heap.instance(instance_id).class;
                        self.bind_method(class, name)?;
                    }
                }
                Opcode::SetProperty => {
                    let name = self.read_string();
                    let instance_id = match self.peek(1) {
                        Value::Ref(id) if matches!(self.heap.get(id), HeapData::Instance(_)) => id,
                        _ => return Err(self.runtime_error("Only instances have fields.")),
                    };
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.heap.instance_mut(instance_id).fields.set(name, hash, value);
                    // Replace instance and value with just the value; a
                    // setter is itself an expression.
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                Opcode::GetSuper => {
                    let name = self.read_string();
                    let Value::Ref(superclass) = self.pop() else {
                        unreachable!("the compiler pushes the validated superclass")
                    };
                    self.bind_method(superclass, name)?;
                }
                Opcode::ArrayBuild => {
                    let count = usize::from(self.read_byte());
                    self.maybe_collect();
                    let array = self.heap.alloc(HeapData::Array(Vec::with_capacity(count)));
                    // Keep the array rooted while filling it; items are in
                    // push order below it on the stack.
                    self.push(Value::Ref(array));
                    for distance in (1..=count).rev() {
                        let item = self.peek(distance);
                        self.heap.array_mut(array).push(item);
                    }
                    self.pop();
                    let new_len = self.stack.len() - count;
                    self.stack.truncate(new_len);
                    self.push(Value::Ref(array));
                }
                Opcode::MapBuild => {
                    let count = usize::from(self.read_byte());
                    self.maybe_collect();
                    let map = self.heap.alloc(HeapData::Map(Table::new()));
                    self.push(Value::Ref(map));
                    let mut distance = 2 * count;
                    while distance > 0 {
                        let key = self.peek(distance);
                        let value = self.peek(distance - 1);
                        let key_id = key
                            .as_str_id(&self.heap)
                            .expect("map literal keys are compiled as strings");
                        let hash = self.heap.str_hash(key_id);
                        self.heap.map_mut(map).set(key_id, hash, value);
                        distance -= 2;
                    }
                    self.pop();
                    let new_len = self.stack.len() - 2 * count;
                    self.stack.truncate(new_len);
                    self.push(Value::Ref(map));
                }
                Opcode::IndexGet => self.index_get()?,
                Opcode::IndexSet => self.index_set()?,
            }
        }
    }

    /// `Add` accepts two numbers or two strings; concatenation interns the
    /// result while both operands stay rooted on the stack.
    fn add(&mut self) -> Result<(), RuntimeError> {
        let (b, a) = (self.peek(0), self.peek(1));
        if let (Some(a_id), Some(b_id)) = (a.as_str_id(&self.heap), b.as_str_id(&self.heap)) {
            let mut text = String::with_capacity(
                self.heap.str_text(a_id).len() + self.heap.str_text(b_id).len(),
            );
            text.push_str(self.heap.str_text(a_id));
            text.push_str(self.heap.str_text(b_id));
            self.maybe_collect();
            let result = self.strings.intern(&mut self.heap, &text);
            self.pop();
            self.pop();
            self.push(Value::Ref(result));
            return Ok(());
        }
        if let (Value::Number(a), Value::Number(b)) = (a, b) {
            self.pop();
            self.pop();
            self.push(Value::Number(a + b));
            return Ok(());
        }
        Err(self.runtime_error("Operands must be two numbers or two strings."))
    }

    /// `container[index]`: array reads need a number index in bounds; map
    /// reads need a string key and yield nil on a miss.
    fn index_get(&mut self) -> Result<(), RuntimeError> {
        if let Value::Ref(container) = self.peek(1)
            && matches!(self.heap.get(container), HeapData::Map(_))
        {
            let Some(key) = self.peek(0).as_str_id(&self.heap) else {
                return Err(self.runtime_error("Map key must be a string."));
            };
            let hash = self.heap.str_hash(key);
            let result = self.heap.map(container).get(key, hash).unwrap_or(Value::Nil);
            self.pop();
            self.pop();
            self.push(result);
            return Ok(());
        }

        let Value::Number(raw_index) = self.peek(0) else {
            return Err(self.runtime_error("Array index must be a number."));
        };
        let array = match self.peek(1) {
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Array(_)) => id,
            _ => return Err(self.runtime_error("Can only index into an array or map.")),
        };
        let index = raw_index as i64;
        let length = self.heap.array(array).len();
        if index < 0 || index as usize >= length {
            let message = format!("Array index={index} out of range. Current len()={length}.");
            return Err(self.runtime_error(message));
        }
        let result = self.heap.array(array)[index as usize];
        self.pop();
        self.pop();
        self.push(result);
        Ok(())
    }

    /// `container[index] = value`: writing nil to a map key deletes it; the
    /// stored value replaces all three stack entries (assignments are
    /// expressions).
    fn index_set(&mut self) -> Result<(), RuntimeError> {
        let value = self.peek(0);
        if let Value::Ref(container) = self.peek(2)
            && matches!(self.heap.get(container), HeapData::Map(_))
        {
            let Some(key) = self.peek(1).as_str_id(&self.heap) else {
                return Err(self.runtime_error("Map key must be a string."));
            };
            let hash = self.heap.str_hash(key);
            if value == Value::Nil {
                self.heap.map_mut(container).delete(key, hash);
            } else {
                self.heap.map_mut(container).set(key, hash, value);
            }
            self.pop();
            self.pop();
            self.pop();
            self.push(value);
            return Ok(());
        }

        let Value::Number(raw_index) = self.peek(1) else {
            return Err(self.runtime_error("Array index must be a number."));
        };
        let array = match self.peek(2) {
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Array(_)) => id,
            _ => return Err(self.runtime_error("Can only store into an array or map.")),
        };
        let index = raw_index as i64;
        let length = self.heap.array(array).len();
        if index < 0 || index as usize >= length {
            return Err(self.runtime_error("Invalid index to array."));
        }
        self.heap.array_mut(array)[index as usize] = value;
        self.pop();
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }
}
