//! The bytecode virtual machine.
//!
//! Three stacks drive execution: the operand stack holds intermediate
//! values, the environment stack holds per-frame slots (arguments first,
//! then locals), and the call stack holds suspended frames. The current
//! frame lives outside the call stack; `CALL` pushes it and `RET` pops back
//! into it. A frame is native when it has no closure or a native one;
//! control returns to the host whenever a return lands in a native frame.
//!
//! After a runtime error the VM is not safe for continued execution; the
//! stacks are left in place for traceback construction and [`Vm::reset`]
//! must run before the VM is reused.

use std::sync::{Arc, Mutex, PoisonError};

use smallvec::SmallVec;

use crate::error::ErrorRecord;
use crate::hook::VmHook;
use crate::image::ImageValue;
use crate::io::{Output, StdOutput};
use crate::loc::{Loc, LocRange, NOWHERE};
use crate::memblock::{MemBlock, pack};
use crate::op::{Opcode, decode};
use crate::prim;
use crate::value::{Closure, ClosureKind, NativeFn, ScriptFn, Value};

/// Slot counts for the three stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VmConfig {
    /// Operand stack length, in values.
    pub os_len: u32,
    /// Call stack length, in frames.
    pub cs_len: u32,
    /// Environment stack length, in values.
    pub env_len: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            os_len: 256,
            cs_len: 256,
            env_len: 256,
        }
    }
}

impl VmConfig {
    /// Byte footprint of the three stacks laid out back to back, computed
    /// with the shared block-packing procedure.
    #[must_use]
    pub fn memory_footprint(&self) -> usize {
        let mut blocks = [
            MemBlock::new(
                size_of::<Value>(),
                self.os_len as usize,
                align_of::<Value>(),
            ),
            MemBlock::new(
                size_of::<Value>(),
                self.env_len as usize,
                align_of::<Value>(),
            ),
            MemBlock::new(
                size_of::<StackFrame>(),
                self.cs_len as usize,
                align_of::<StackFrame>(),
            ),
        ];
        pack(&mut blocks).total_size
    }
}

/// One call frame.
#[derive(Debug, Clone, Default)]
pub(crate) struct StackFrame {
    closure: Option<Arc<Closure>>,
    /// Index of the next instruction.
    pc: usize,
    /// Base of this frame's environment slots.
    ep: usize,
    /// Operand stack height at frame entry.
    bp: usize,
    /// Environment slots holding arguments (before locals).
    num_args: u16,
    is_native: bool,
    native_function: Option<String>,
    native_filename: Option<String>,
    native_line: u32,
}

impl StackFrame {
    fn function_name(&self) -> String {
        if let Some(closure) = &self.closure
            && let Some(name) = closure.debug_name()
        {
            return name.to_owned();
        }
        match &self.native_function {
            Some(name) => name.clone(),
            None => "?".to_owned(),
        }
    }
}

/// Shared handle to the VM's output stream.
pub type OutputHandle = Arc<Mutex<dyn Output + Send>>;

/// A virtual machine.
pub struct Vm {
    config: VmConfig,
    os: Vec<Value>,
    env: Vec<Value>,
    frames: Vec<StackFrame>,
    /// The currently executing frame.
    ctx: StackFrame,
    hook: Option<Box<dyn VmHook>>,
    out: OutputHandle,
    pending_native_location: Option<(String, String, u32)>,
}

enum CallOutcome {
    /// A script frame was entered; the dispatch loop must run or reload.
    Entered,
    /// A native function ran to completion; its result is on the stack.
    Completed,
}

impl Vm {
    /// Creates a VM writing to the process stdout.
    #[must_use]
    pub fn new(config: VmConfig) -> Self {
        Self::with_output(config, Arc::new(Mutex::new(StdOutput)))
    }

    /// Creates a VM with an explicit output stream.
    #[must_use]
    pub fn with_output(config: VmConfig, out: OutputHandle) -> Self {
        Self {
            config,
            os: Vec::with_capacity(config.os_len as usize),
            env: Vec::with_capacity(config.env_len as usize),
            frames: Vec::with_capacity(config.cs_len as usize),
            ctx: StackFrame {
                is_native: true,
                ..StackFrame::default()
            },
            hook: None,
            out,
            pending_native_location: None,
        }
    }

    /// This VM's configuration.
    #[must_use]
    pub fn config(&self) -> VmConfig {
        self.config
    }

    /// Number of suspended frames on the call stack.
    #[must_use]
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Installs (or clears) the execution hook, returning the previous one.
    pub fn set_hook(&mut self, hook: Option<Box<dyn VmHook>>) -> Option<Box<dyn VmHook>> {
        std::mem::replace(&mut self.hook, hook)
    }

    /// Clears the stacks. Required after a runtime error before the VM may
    /// run again.
    pub fn reset(&mut self) {
        self.os.clear();
        self.env.clear();
        self.frames.clear();
        self.ctx = StackFrame {
            is_native: true,
            ..StackFrame::default()
        };
    }

    /// Registers the host-side source position for the current native
    /// frame, used in traceback records.
    pub fn set_native_location(
        &mut self,
        function: impl Into<String>,
        file: impl Into<String>,
        line: u32,
    ) {
        self.pending_native_location = Some((function.into(), file.into(), line));
    }

    /// Arguments of the current native frame, in call order.
    ///
    /// Only meaningful inside a native function invoked by this VM.
    #[must_use]
    pub fn args(&self) -> &[Value] {
        let start = self.ctx.ep.min(self.env.len());
        let end = (self.ctx.ep + self.ctx.num_args as usize).min(self.env.len());
        &self.env[start..end]
    }

    /// Bound environment of the current native closure.
    #[must_use]
    pub fn env(&self) -> Vec<Value> {
        match &self.ctx.closure {
            Some(closure) => closure.env_snapshot(),
            None => Vec::new(),
        }
    }

    /// Writes bytes to the VM's output stream.
    pub fn write_out(&self, bytes: &[u8]) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write(bytes);
    }

    /// Calls a function value with `args`, running the dispatch loop until
    /// the call returns. On error the VM is left error-inconsistent for
    /// traceback construction; [`Vm::reset`] it before reuse.
    pub fn call(&mut self, function: &Value, args: &[Value]) -> Result<Value, Value> {
        if let Some((name, file, line)) = self.pending_native_location.take() {
            self.ctx.native_function = Some(name);
            self.ctx.native_filename = Some(file);
            self.ctx.native_line = line;
        }

        for arg in args.iter().rev() {
            self.push(arg.clone())?;
        }
        self.push(function.clone())?;

        let result = match self.do_call(args.len())? {
            CallOutcome::Entered => self.run(),
            CallOutcome::Completed => Ok(()),
        };
        match result {
            Ok(()) => Ok(self.os.pop().unwrap_or(Value::Nil)),
            Err(err) => Err(err),
        }
    }

    /// Runs the dispatch loop until control returns to a native frame.
    fn run(&mut self) -> Result<(), Value> {
        let result = self.dispatch();
        if result.is_err()
            && let Some(mut hook) = self.hook.take()
        {
            hook.error(self);
            self.hook = Some(hook);
        }
        result
    }

    #[expect(clippy::too_many_lines, reason = "single dispatch loop over the opcode set")]
    fn dispatch(&mut self) -> Result<(), Value> {
        let mut cur = self.current_script_fn()?;

        loop {
            if let Some(mut hook) = self.hook.take() {
                hook.step(self);
                self.hook = Some(hook);
            }

            let Some(word) = cur.instruction(self.ctx.pc) else {
                return Err(self.error("Instruction pointer out of range"));
            };
            self.ctx.pc += 1;
            let Some((opcode, operand)) = decode(word) else {
                return Err(self.error("Invalid instruction"));
            };

            match opcode {
                Opcode::Nop => {}
                Opcode::Pop => {
                    let n = usize::try_from(operand).unwrap_or(0);
                    if n > self.os.len() {
                        return Err(self.error("Operand stack underflow"));
                    }
                    self.os.truncate(self.os.len() - n);
                }
                Opcode::Nil => self.push(Value::Nil)?,
                Opcode::Ldk => {
                    let value = self.load_constant(&cur, operand)?;
                    self.push(value)?;
                }
                Opcode::Ldi => self.push(Value::Number(f64::from(operand)))?,
                Opcode::Ldb => self.push(Value::Boolean(operand != 0))?,
                Opcode::Plhr => {
                    let index = self.local_slot(operand)?;
                    self.env[index] = Value::Placeholder(operand.cast_unsigned());
                }
                Opcode::Larg => {
                    let value = usize::try_from(operand)
                        .ok()
                        .and_then(|i| self.ctx.ep.checked_add(i))
                        .and_then(|index| self.env.get(index).cloned());
                    let Some(value) = value else {
                        return Err(self.error("Argument slot out of range"));
                    };
                    self.push(value)?;
                }
                Opcode::Ldlv => {
                    let index = self.local_slot(operand)?;
                    let value = self.env[index].clone();
                    self.push(value)?;
                }
                Opcode::Ldcv => {
                    let Some(closure) = self.ctx.closure.clone() else {
                        return Err(self.error("No closure in the current frame"));
                    };
                    let index = usize::try_from(operand).unwrap_or(usize::MAX);
                    let Some(value) = closure.env_get(index) else {
                        return Err(self.error("Capture slot out of range"));
                    };
                    self.push(value)?;
                }
                Opcode::Imp => {
                    let index = usize::try_from(operand).unwrap_or(usize::MAX);
                    match cur.links.get(cur.offset, index) {
                        Some(value) => self.push(value)?,
                        None => {
                            let name = cur
                                .image
                                .import_name(cur.offset, index)
                                .unwrap_or_else(|| "?".to_owned());
                            return Err(self.error(&format!("Undefined symbol: {name}")));
                        }
                    }
                }
                Opcode::Set => {
                    let index = self.local_slot(operand)?;
                    let Some(value) = self.os.pop() else {
                        return Err(self.error("Operand stack underflow"));
                    };
                    self.env[index] = value;
                }
                Opcode::Jmp => {
                    self.ctx.pc = usize::try_from(operand).unwrap_or(0);
                }
                Opcode::Jof => {
                    let Some(value) = self.os.pop() else {
                        return Err(self.error("Operand stack underflow"));
                    };
                    if value.is_falsy() {
                        self.ctx.pc = usize::try_from(operand).unwrap_or(0);
                    }
                }
                Opcode::Call => {
                    let argc = usize::try_from(operand).unwrap_or(0);
                    match self.do_call(argc)? {
                        CallOutcome::Entered => cur = self.current_script_fn()?,
                        CallOutcome::Completed => {}
                    }
                }
                Opcode::Tail => {
                    let argc = usize::try_from(operand).unwrap_or(0);
                    if self.do_tail_call(argc)? {
                        // A native tail call completed and control returned
                        // to a native frame.
                        return Ok(());
                    }
                    cur = self.current_script_fn()?;
                }
                Opcode::Ret => {
                    self.env.truncate(self.ctx.ep);
                    let Some(frame) = self.frames.pop() else {
                        return Err(self.error("Call stack underflow"));
                    };
                    self.ctx = frame;
                    if self.ctx.is_native {
                        return Ok(());
                    }
                    cur = self.current_script_fn()?;
                }
                Opcode::Cls => {
                    let fn_index = (operand & 0xFFF).cast_unsigned();
                    let num_captures = ((operand >> 12) & 0xFFF).cast_unsigned() as usize;
                    let value = self.make_closure(&cur, fn_index, num_captures)?;
                    self.push(value)?;
                }
                Opcode::Rcls => {
                    let index = self.local_slot(operand)?;
                    if let Value::Function(closure) = self.env[index].clone() {
                        let base = self.ctx.ep + self.ctx.num_args as usize;
                        let env = &self.env;
                        closure
                            .patch_placeholders(|slot| env.get(base + slot as usize).cloned());
                    }
                }
                Opcode::Add => self.prim_op(operand, prim::add)?,
                Opcode::Sub => self.prim_op(operand, prim::sub)?,
                Opcode::Mul => self.prim_op(operand, prim::mul)?,
                Opcode::Fdiv => self.prim_op(operand, prim::fdiv)?,
                Opcode::Not => self.prim_op(operand, prim::not)?,
                Opcode::Cmp => self.prim_op(operand, prim::cmp)?,
                Opcode::Eq => self.prim_op(operand, prim::eq)?,
                Opcode::Neq => self.prim_op(operand, prim::neq)?,
                Opcode::Gt => self.prim_op(operand, prim::gt)?,
                Opcode::Lt => self.prim_op(operand, prim::lt)?,
                Opcode::Gte => self.prim_op(operand, prim::gte)?,
                Opcode::Lte => self.prim_op(operand, prim::lte)?,
            }
        }
    }

    fn current_script_fn(&self) -> Result<ScriptFn, Value> {
        let Some(closure) = &self.ctx.closure else {
            return Err(self.error("No closure in the current frame"));
        };
        match &closure.kind {
            ClosureKind::Script(fun) => Ok(fun.clone()),
            ClosureKind::Native(_) => Err(self.error("Cannot dispatch inside a native frame")),
        }
    }

    /// Absolute environment index of local slot `operand` of the current
    /// frame; locals sit after the argument slots.
    fn local_slot(&self, operand: i32) -> Result<usize, Value> {
        let base = self.ctx.ep + self.ctx.num_args as usize;
        let index = usize::try_from(operand)
            .ok()
            .and_then(|i| base.checked_add(i));
        match index {
            Some(index) if index < self.env.len() => Ok(index),
            _ => Err(self.error("Local slot out of range")),
        }
    }

    fn load_constant(&self, cur: &ScriptFn, operand: i32) -> Result<Value, Value> {
        let index = usize::try_from(operand).unwrap_or(usize::MAX);
        let Some(constant) = cur.image.constant(cur.offset, index) else {
            return Err(self.error("Constant index out of range"));
        };
        match constant {
            ImageValue::Number(value) => Ok(Value::Number(value)),
            ImageValue::Str(offset) => self
                .image_string(cur, offset)
                .map(Value::String)
                .ok_or_else(|| self.error("Corrupted string constant")),
            ImageValue::Sym(offset) => self
                .image_string(cur, offset)
                .map(Value::Symbol)
                .ok_or_else(|| self.error("Corrupted string constant")),
            ImageValue::Placeholder => Ok(Value::Placeholder(0)),
        }
    }

    fn image_string(&self, cur: &ScriptFn, offset: u32) -> Option<Arc<str>> {
        cur.image
            .string_at(cur.offset as usize + offset as usize)
            .map(|bytes| Arc::from(String::from_utf8_lossy(bytes).into_owned().as_str()))
    }

    fn make_closure(
        &mut self,
        cur: &ScriptFn,
        fn_index: u32,
        num_captures: usize,
    ) -> Result<Value, Value> {
        let Some(offset) = cur.image.nested_offset(cur.offset, fn_index as usize) else {
            return Err(self.error("Nested function index out of range"));
        };

        let mut captures = Vec::with_capacity(num_captures);
        for _ in 0..num_captures {
            let Some(word) = cur.instruction(self.ctx.pc) else {
                return Err(self.error("Truncated capture list"));
            };
            self.ctx.pc += 1;
            let Some((opcode, index)) = decode(word) else {
                return Err(self.error("Invalid capture instruction"));
            };
            let Ok(index) = usize::try_from(index) else {
                return Err(self.error("Invalid capture instruction"));
            };
            let value = match opcode {
                Opcode::Larg => self
                    .ctx
                    .ep
                    .checked_add(index)
                    .and_then(|i| self.env.get(i).cloned()),
                Opcode::Ldlv => (self.ctx.ep + self.ctx.num_args as usize)
                    .checked_add(index)
                    .and_then(|i| self.env.get(i).cloned()),
                Opcode::Ldcv => self
                    .ctx
                    .closure
                    .as_ref()
                    .and_then(|closure| closure.env_get(index)),
                _ => return Err(self.error("Invalid capture instruction")),
            };
            let Some(value) = value else {
                return Err(self.error("Capture slot out of range"));
            };
            captures.push(value);
        }

        let fun = ScriptFn {
            image: Arc::clone(&cur.image),
            offset,
            links: Arc::clone(&cur.links),
        };
        Ok(Value::Function(Arc::new(Closure::script(fun, captures))))
    }

    fn prim_op(
        &mut self,
        operand: i32,
        op: impl Fn(&[Value]) -> Result<Value, String>,
    ) -> Result<(), Value> {
        let argc = usize::try_from(operand).unwrap_or(0);
        if argc > self.os.len() {
            return Err(self.error("Operand stack underflow"));
        }
        let args = self.collect_args(argc);
        self.os.truncate(self.os.len() - argc);
        match op(&args) {
            Ok(value) => self.push(value),
            Err(message) => Err(self.error(&message)),
        }
    }

    /// Copies the top `argc` operands in call order (the top of the stack
    /// is the first argument).
    fn collect_args(&self, argc: usize) -> SmallVec<[Value; 8]> {
        let top = self.os.len();
        (0..argc).map(|i| self.os[top - 1 - i].clone()).collect()
    }

    fn do_call(&mut self, argc: usize) -> Result<CallOutcome, Value> {
        let Some(callee) = self.os.pop() else {
            return Err(self.error("Operand stack underflow"));
        };
        let Value::Function(closure) = callee else {
            return Err(self.error(&format!(
                "Expected function, got {}",
                callee.type_name()
            )));
        };
        if argc > self.os.len() {
            return Err(self.error("Operand stack underflow"));
        }
        if self.frames.len() >= self.config.cs_len as usize {
            return Err(self.error("Call stack overflow"));
        }

        let args = self.collect_args(argc);
        self.os.truncate(self.os.len() - argc);

        match &closure.kind {
            ClosureKind::Script(fun) => {
                let frame = self.script_frame(&closure, fun, args)?;
                let caller = std::mem::replace(&mut self.ctx, frame);
                self.frames.push(caller);
                Ok(CallOutcome::Entered)
            }
            ClosureKind::Native(function) => {
                let function = Arc::clone(function);
                let frame = self.native_frame(&closure, function.as_ref(), args);
                let caller = std::mem::replace(&mut self.ctx, frame);
                self.frames.push(caller);
                self.finish_native_call(&function)
            }
        }
    }

    /// Tail call: the current frame is replaced instead of suspended.
    /// Returns `true` when control ended up in a native frame and the
    /// dispatch loop must exit.
    fn do_tail_call(&mut self, argc: usize) -> Result<bool, Value> {
        let Some(callee) = self.os.pop() else {
            return Err(self.error("Operand stack underflow"));
        };
        let Value::Function(closure) = callee else {
            return Err(self.error(&format!(
                "Expected function, got {}",
                callee.type_name()
            )));
        };
        if argc > self.os.len() {
            return Err(self.error("Operand stack underflow"));
        }

        let args = self.collect_args(argc);
        self.os.truncate(self.ctx.bp);
        self.env.truncate(self.ctx.ep);

        match &closure.kind {
            ClosureKind::Script(fun) => {
                let frame = self.script_frame(&closure, fun, args)?;
                self.ctx = frame;
                Ok(false)
            }
            ClosureKind::Native(function) => {
                let function = Arc::clone(function);
                let frame = self.native_frame(&closure, function.as_ref(), args);
                self.ctx = frame;
                self.finish_native_call(&function)?;
                Ok(self.ctx.is_native)
            }
        }
    }

    /// Builds a script frame with arguments (vararg-packed when declared)
    /// and zeroed locals placed on the environment stack.
    fn script_frame(
        &mut self,
        closure: &Arc<Closure>,
        fun: &ScriptFn,
        args: SmallVec<[Value; 8]>,
    ) -> Result<StackFrame, Value> {
        let header = fun.image.header(fun.offset);
        let num_args = header.num_args as usize;
        let argc = args.len();

        if header.is_vararg {
            let fixed = num_args.saturating_sub(1);
            if argc < fixed {
                return Err(self.error(&format!(
                    "Bad number of arguments (at least {fixed} expected, got {argc})"
                )));
            }
        } else if argc != num_args {
            return Err(self.error(&format!(
                "Bad number of arguments (exactly {num_args} expected, got {argc})"
            )));
        }

        if self.env.len() + num_args + header.num_locals as usize > self.config.env_len as usize {
            return Err(self.error("Environment stack overflow"));
        }

        let ep = self.env.len();
        if header.is_vararg {
            let fixed = num_args.saturating_sub(1);
            let mut args = args.into_vec();
            let rest = args.split_off(fixed);
            self.env.extend(args);
            self.env.push(Value::list(rest));
        } else {
            self.env.extend(args);
        }
        for _ in 0..header.num_locals {
            self.env.push(Value::Nil);
        }

        Ok(StackFrame {
            closure: Some(Arc::clone(closure)),
            pc: 0,
            ep,
            bp: self.os.len(),
            num_args: header.num_args,
            is_native: false,
            native_function: None,
            native_filename: None,
            native_line: 0,
        })
    }

    /// Builds a native frame; arguments go on the environment stack so the
    /// function can borrow them through [`Vm::args`].
    fn native_frame(
        &mut self,
        closure: &Arc<Closure>,
        function: &dyn NativeFn,
        args: SmallVec<[Value; 8]>,
    ) -> StackFrame {
        let ep = self.env.len();
        let num_args = u16::try_from(args.len()).unwrap_or(u16::MAX);
        self.env.extend(args);
        let (native_filename, native_line) = match function.location() {
            Some((file, line)) => (Some(file.to_owned()), line),
            None => (None, 0),
        };
        StackFrame {
            closure: Some(Arc::clone(closure)),
            pc: 0,
            ep,
            bp: self.os.len(),
            num_args,
            is_native: true,
            native_function: closure.debug_name().map(str::to_owned),
            native_filename,
            native_line,
        }
    }

    /// Invokes a native function for the frame already in `ctx`; on success
    /// pops the frame and pushes the result.
    fn finish_native_call(&mut self, function: &Arc<dyn NativeFn>) -> Result<CallOutcome, Value> {
        match function.call(self) {
            Ok(value) => {
                self.env.truncate(self.ctx.ep);
                let Some(frame) = self.frames.pop() else {
                    return Err(self.error("Call stack underflow"));
                };
                self.ctx = frame;
                self.push(value)?;
                Ok(CallOutcome::Completed)
            }
            // The failing frame stays in place for the traceback.
            Err(err) => Err(err),
        }
    }

    fn push(&mut self, value: Value) -> Result<(), Value> {
        if self.os.len() >= self.config.os_len as usize {
            return Err(self.error("Operand stack overflow"));
        }
        self.os.push(value);
        Ok(())
    }

    fn error(&self, message: &str) -> Value {
        Value::string(message)
    }

    /// Traceback records for the current (failed) activation, top frame
    /// first.
    #[must_use]
    pub fn traceback_records(&self) -> Vec<ErrorRecord> {
        let mut records = Vec::with_capacity(self.frames.len() + 1);
        for frame in std::iter::once(&self.ctx).chain(self.frames.iter().rev()) {
            let is_native = frame.is_native || frame.closure.is_none();
            if is_native {
                let filename = frame
                    .native_filename
                    .clone()
                    .unwrap_or_else(|| "<native>".to_owned());
                let location = if frame.native_line > 0 {
                    LocRange::new(
                        Loc::new(frame.native_line, 0),
                        Loc::new(frame.native_line, 0),
                    )
                } else {
                    NOWHERE
                };
                records.push(ErrorRecord {
                    filename,
                    location,
                    message: frame.function_name(),
                });
            } else if let Some(closure) = &frame.closure
                && let ClosureKind::Script(fun) = &closure.kind
            {
                records.push(ErrorRecord {
                    filename: fun.image.source_name(fun.offset),
                    location: fun.image.location(fun.offset, frame.pc),
                    message: frame.function_name(),
                });
            }
        }
        records
    }
}
