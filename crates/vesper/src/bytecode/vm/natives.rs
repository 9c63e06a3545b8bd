//! Built-in native functions, pre-registered as globals when a VM starts.
//!
//! Natives are plain function pointers with a uniform signature: they get a
//! [`NativeCtx`] (heap, intern pool, output sink, VM start time) and the
//! argument slice, and return `Result<Value, String>`. An `Err` surfaces
//! through the VM's unified runtime-error path; natives never unwind.

use std::{borrow::Cow, time::Instant};

use crate::{
    heap::{Heap, HeapData},
    intern::Interner,
    io::PrintWriter,
    value::{Value, format_value},
};

/// Signature shared by every built-in.
pub(crate) type NativeFn = fn(&mut NativeCtx<'_>, &[Value]) -> Result<Value, String>;

/// What a native is allowed to touch while it runs.
///
/// Arguments still live on the operand stack, so anything a native allocates
/// before returning is safe from the collector: the VM only collects at its
/// own safe points, after the native's result has been pushed.
pub(crate) struct NativeCtx<'a> {
    pub heap: &'a mut Heap,
    pub strings: &'a mut Interner,
    pub print: &'a mut dyn PrintWriter,
    pub started: Instant,
}

/// Registration table consumed by `Vm::new`.
pub(crate) const NATIVES: &[(&str, NativeFn)] = &[
    ("clock", clock),
    ("push", array_push),
    ("pop", array_pop),
    ("delete", array_delete),
    ("len", len),
    ("floor", floor),
    ("printf", printf),
    ("typeof", type_of),
];

/// `clock()` - seconds elapsed since the VM was created.
fn clock(ctx: &mut NativeCtx<'_>, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(ctx.started.elapsed().as_secs_f64()))
}

/// `len(x)` - length of an array, or byte length of a string.
fn len(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    if let [Value::Ref(id)] = args {
        match ctx.heap.get(*id) {
            HeapData::Array(items) => return Ok(Value::Number(items.len() as f64)),
            HeapData::Str(s) => return Ok(Value::Number(s.text.len() as f64)),
            _ => {}
        }
    }
    Err("'len()' can only get length from array or string.".to_string())
}

/// `push(array, value)` - appends to the end of an array.
fn array_push(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    if let [Value::Ref(id), item] = args
        && matches!(ctx.heap.get(*id), HeapData::Array(_))
    {
        let item = *item;
        ctx.heap.array_mut(*id).push(item);
        return Ok(Value::Nil);
    }
    Err("wrong arguments for: 'push(array, value)'.".to_string())
}

/// `pop(array)` - removes and returns the last element.
fn array_pop(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    if let [Value::Ref(id)] = args
        && matches!(ctx.heap.get(*id), HeapData::Array(_))
    {
        return ctx
            .heap
            .array_mut(*id)
            .pop()
            .ok_or_else(|| "can't pop empty array.".to_string());
    }
    Err("wrong arguments for: 'pop(array)'.".to_string())
}

/// `delete(array, index)` - removes the element at `index`, shifting the
/// tail down.
fn array_delete(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    if let [Value::Ref(id), Value::Number(index)] = args
        && matches!(ctx.heap.get(*id), HeapData::Array(_))
    {
        let index = *index as i64;
        let length = ctx.heap.array(*id).len();
        if index < 0 || index as usize >= length {
            return Err("index out of bounds for: 'delete(array, index)'.".to_string());
        }
        ctx.heap.array_mut(*id).remove(index as usize);
        return Ok(Value::Nil);
    }
    Err("wrong arguments for: 'delete(array, index)'.".to_string())
}

/// `floor(n)` - rounds down to the nearest integer.
fn floor(_ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::Number(n)] => Ok(Value::Number(n.floor())),
        _ => Err("'floor()' can only round numbers.".to_string()),
    }
}

/// `printf(...)` - prints every argument, concatenated with no separators
/// and no trailing newline.
fn printf(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    if args.is_empty() {
        return Err("printf(...) needs at least one argument.".to_string());
    }
    for &arg in args {
        let text = format_value(arg, ctx.heap);
        ctx.print.stdout_write(Cow::Owned(text));
    }
    Ok(Value::Nil)
}

/// `typeof(v)` - type name as a string; instances report their class name.
fn type_of(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    let [value] = args else {
        return Err("typeof(value) expects exactly one argument.".to_string());
    };
    let name = match value {
        Value::Number(_) => "number",
        Value::Bool(_) => "bool",
        Value::Nil => "nil",
        Value::Ref(id) => match ctx.heap.get(*id) {
            HeapData::Str(_) => "string",
            HeapData::Array(_) => "array",
            HeapData::Closure(_) => "fun",
            HeapData::Instance(instance) => {
                let class_name = ctx.heap.class(instance.class).name;
                return Ok(Value::Ref(class_name));
            }
            _ => "object",
        },
    };
    Ok(Value::Ref(ctx.strings.intern(ctx.heap, name)))
}
