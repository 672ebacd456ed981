//! JVM runtime module responsible for creating a new runtime
//! environment and running programs.
use crate::bytecode::{DecodeError, Instruction, OPCode, Operand};
use crate::classpath::{ClassLoader, Classpath};
use crate::intrinsics::{CallKind, HostObject, HostStreams, IntrinsicTable, NativeCall};
use crate::jvm::CPInfo;
use crate::program::{parse_method_types, Class, Method, Type, ENTRY_POINT};

use log::{debug, trace};
use std::fmt;
use std::io::Write;
use std::rc::Rc;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Default bound on nested invocations.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 1024;

/// `RuntimeError` represents every way a run can fail. All of them are
/// fatal: execution stops and the error is surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("class {name} not found: {reason}")]
    ClassNotFound { name: String, reason: String },
    #[error("method {class}.{name}{descriptor} not found")]
    MethodNotFound {
        class: String,
        name: String,
        descriptor: String,
    },
    #[error("unsupported {opcode} at {class}.{method} pc {pc}")]
    UnsupportedOpcode {
        opcode: OPCode,
        class: String,
        method: String,
        pc: usize,
    },
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("invalid frame access: {0}")]
    InvalidFrameAccess(String),
    #[error("constant pool index {index} is not a valid {expected} entry")]
    MalformedReference { index: u16, expected: &'static str },
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: Value },
    #[error("invalid operand {operand:?} for {opcode}")]
    InvalidOperand { opcode: OPCode, operand: Operand },
    #[error("invalid method descriptor {0}")]
    InvalidDescriptor(String),
    #[error("invalid code in {class}.{method}: {source}")]
    InvalidCode {
        class: String,
        method: String,
        #[source]
        source: DecodeError,
    },
    #[error("arithmetic error: {0}")]
    ArithmeticError(&'static str),
    #[error("call stack exceeded {0} frames")]
    StackOverflow(usize),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// JVM value types manipulated by the runtime.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i32),
    Reference(HostObject),
    Null,
}

impl Value {
    pub fn as_int(&self) -> Result<i32> {
        match self {
            Self::Int(v) => Ok(*v),
            found => Err(RuntimeError::TypeMismatch {
                expected: "int",
                found: *found,
            }),
        }
    }

    /// Accepts references and null.
    pub fn as_reference(&self) -> Result<Value> {
        match self {
            Self::Int(_) => Err(RuntimeError::TypeMismatch {
                expected: "reference",
                found: *self,
            }),
            reference => Ok(*reference),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Reference(object) => write!(f, "{object}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// Activation record of one method invocation. We create a new frame each
/// time we start executing a method and destroy it once we leave it.
#[derive(Debug, Clone)]
pub struct Frame {
    class: Rc<Class>,
    method: Rc<Method>,
    pc: usize,
    stack: Vec<Value>,
    locals: Vec<Value>,
}

impl Frame {
    /// Frame with `max_locals` null locals.
    pub fn new(class: Rc<Class>, method: Rc<Method>) -> Self {
        Self::with_args(class, method, Vec::new())
    }

    /// Frame whose first locals hold `args`, first argument in slot 0.
    pub fn with_args(class: Rc<Class>, method: Rc<Method>, args: Vec<Value>) -> Self {
        let slots = (method.max_locals() as usize).max(args.len());
        let mut locals = args;
        locals.resize(slots, Value::Null);
        Self {
            stack: Vec::with_capacity(method.max_stack() as usize),
            class,
            method,
            pc: 0,
            locals,
        }
    }

    pub fn class(&self) -> &Rc<Class> {
        &self.class
    }

    pub fn method(&self) -> &Rc<Method> {
        &self.method
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn locals(&self) -> &[Value] {
        &self.locals
    }

    /// Returns the instruction at the program counter and advances it.
    fn fetch(&mut self) -> Result<Instruction> {
        let code = self.method.code().ok_or_else(|| {
            RuntimeError::Unsupported(format!(
                "{}.{} has no code",
                self.class.name(),
                self.method.name()
            ))
        })?;
        let inst = *code.get(self.pc).ok_or_else(|| {
            RuntimeError::InvalidFrameAccess(format!(
                "pc {} past the end of {}.{}",
                self.pc,
                self.class.name(),
                self.method.name()
            ))
        })?;
        self.pc += 1;
        Ok(inst)
    }

    fn jump(&mut self, target: usize) {
        self.pc = target;
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    fn pop_int(&mut self) -> Result<i32> {
        self.pop()?.as_int()
    }

    fn peek(&self) -> Result<Value> {
        self.stack.last().copied().ok_or(RuntimeError::StackUnderflow)
    }

    /// Pops `count` values, returned in push order.
    fn pop_args(&mut self, count: usize) -> Result<Vec<Value>> {
        if self.stack.len() < count {
            return Err(RuntimeError::StackUnderflow);
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn load(&self, index: u16) -> Result<Value> {
        self.locals.get(index as usize).copied().ok_or_else(|| {
            RuntimeError::InvalidFrameAccess(format!("local {index} out of range"))
        })
    }

    fn store(&mut self, index: u16, value: Value) -> Result<()> {
        let slot = self.locals.get_mut(index as usize).ok_or_else(|| {
            RuntimeError::InvalidFrameAccess(format!("local {index} out of range"))
        })?;
        *slot = value;
        Ok(())
    }
}

/// Stack of suspended and running frames, the top one is executing.
#[derive(Debug)]
pub struct CallStack {
    frames: Vec<Frame>,
    max_depth: usize,
}

impl CallStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
        }
    }

    pub fn push(&mut self, frame: Frame) -> Result<()> {
        if self.frames.len() >= self.max_depth {
            return Err(RuntimeError::StackOverflow(self.max_depth));
        }
        debug!(
            "enter {}.{}{} (depth {})",
            frame.class.name(),
            frame.method.name(),
            frame.method.descriptor(),
            self.frames.len() + 1
        );
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Frame> {
        let frame = self.frames.pop()?;
        debug!(
            "leave {}.{} (depth {})",
            frame.class.name(),
            frame.method.name(),
            self.frames.len()
        );
        Some(frame)
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Drops every frame, including those left behind by a failed run.
    pub fn clear(&mut self) {
        if !self.frames.is_empty() {
            debug!("discarding {} stale frames", self.frames.len());
        }
        self.frames.clear();
    }
}

/// `Runtime` represents an execution context for JVM programs and is
/// responsible for interpreting the program's instructions.
///
/// Each iteration fetches the instruction under the top frame's program
/// counter, advances the counter and evaluates the instruction, which may
/// touch the top frame or push and pop frames. The run terminates when the
/// call stack is empty.
pub struct Runtime {
    loader: ClassLoader,
    intrinsics: IntrinsicTable,
    host: HostStreams,
    frames: CallStack,
    executed: u64,
}

impl Runtime {
    /// Runtime writing to the process standard streams.
    pub fn new(loader: ClassLoader) -> Self {
        Self::with_streams(loader, HostStreams::stdio())
    }

    pub fn with_output(loader: ClassLoader, out: Box<dyn Write>, err: Box<dyn Write>) -> Self {
        Self::with_streams(loader, HostStreams::new(out, err))
    }

    fn with_streams(loader: ClassLoader, host: HostStreams) -> Self {
        Self {
            loader,
            intrinsics: IntrinsicTable::default(),
            host,
            frames: CallStack::new(DEFAULT_MAX_CALL_DEPTH),
            executed: 0,
        }
    }

    pub fn with_intrinsics(mut self, intrinsics: IntrinsicTable) -> Self {
        self.intrinsics = intrinsics;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.frames.max_depth = depth;
        self
    }

    pub fn loader(&self) -> &ClassLoader {
        &self.loader
    }

    /// Gives the loader back, with its cache, for use by another run.
    pub fn into_loader(self) -> ClassLoader {
        self.loader
    }

    pub fn call_stack(&self) -> &CallStack {
        &self.frames
    }

    pub fn instructions_executed(&self) -> u64 {
        self.executed
    }

    /// Resolve `main_class`, run its entry point to completion. Each call
    /// starts from an empty call stack.
    pub fn start(&mut self, main_class: &str) -> Result<()> {
        self.frames.clear();
        self.enter(main_class)?;
        self.run()
    }

    /// Push the initial frame for the entry point of `main_class`.
    pub fn enter(&mut self, main_class: &str) -> Result<()> {
        let class = self.loader.resolve(main_class)?;
        let (name, descriptor) = ENTRY_POINT;
        let main = class
            .entry_point()
            .ok_or_else(|| RuntimeError::MethodNotFound {
                class: class.name().to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            })?;
        if !main.is_static() || main.code().is_none() {
            return Err(RuntimeError::Unsupported(format!(
                "{}.{}{} is not a static bytecode method",
                class.name(),
                main.name(),
                main.descriptor()
            )));
        }
        self.frames.push(Frame::new(class, main))
    }

    /// Run until the call stack is empty.
    pub fn run(&mut self) -> Result<()> {
        while self.step()? {}
        debug!("run finished after {} instructions", self.executed);
        Ok(())
    }

    /// Execute one instruction. Returns false once the call stack is empty.
    pub fn step(&mut self) -> Result<bool> {
        let Some(frame) = self.frames.top_mut() else {
            return Ok(false);
        };
        let pc = frame.pc();
        let inst = frame.fetch()?;
        trace!("{pc:>4}: {} {:?}", inst.get_mnemonic(), inst.operand());
        self.eval(inst, pc)?;
        self.executed += 1;
        Ok(true)
    }

    fn frame(&mut self) -> Result<&mut Frame> {
        self.frames
            .top_mut()
            .ok_or_else(|| RuntimeError::InvalidFrameAccess("call stack is empty".to_string()))
    }

    fn current_class(&self) -> Result<Rc<Class>> {
        self.frames
            .top()
            .map(|frame| Rc::clone(&frame.class))
            .ok_or_else(|| RuntimeError::InvalidFrameAccess("call stack is empty".to_string()))
    }

    /// Evaluate a given instruction.
    fn eval(&mut self, inst: Instruction, pc: usize) -> Result<()> {
        match inst.get_mnemonic() {
            OPCode::Nop => (),
            OPCode::AconstNull => self.frame()?.push(Value::Null),
            OPCode::IconstM1
            | OPCode::Iconst0
            | OPCode::Iconst1
            | OPCode::Iconst2
            | OPCode::Iconst3
            | OPCode::Iconst4
            | OPCode::Iconst5
            | OPCode::BiPush
            | OPCode::SiPush => {
                let value = int_operand(&inst)?;
                self.frame()?.push(Value::Int(value));
            }
            OPCode::Ldc | OPCode::LdcW => self.ldc(index_operand(&inst)?)?,
            OPCode::ILoad | OPCode::ILoad0 | OPCode::ILoad1 | OPCode::ILoad2 | OPCode::ILoad3 => {
                let frame = self.frame()?;
                let value = frame.load(local_operand(&inst)?)?.as_int()?;
                frame.push(Value::Int(value));
            }
            OPCode::ALoad | OPCode::ALoad0 | OPCode::ALoad1 | OPCode::ALoad2 | OPCode::ALoad3 => {
                let frame = self.frame()?;
                let value = frame.load(local_operand(&inst)?)?.as_reference()?;
                frame.push(value);
            }
            OPCode::IStore
            | OPCode::IStore0
            | OPCode::IStore1
            | OPCode::IStore2
            | OPCode::IStore3 => {
                let frame = self.frame()?;
                let value = frame.pop_int()?;
                frame.store(local_operand(&inst)?, Value::Int(value))?;
            }
            OPCode::AStore
            | OPCode::AStore0
            | OPCode::AStore1
            | OPCode::AStore2
            | OPCode::AStore3 => {
                let frame = self.frame()?;
                let value = frame.pop()?.as_reference()?;
                frame.store(local_operand(&inst)?, value)?;
            }
            OPCode::Pop => {
                self.frame()?.pop()?;
            }
            OPCode::Dup => {
                let frame = self.frame()?;
                let value = frame.peek()?;
                frame.push(value);
            }
            OPCode::Swap => {
                let frame = self.frame()?;
                let top = frame.pop()?;
                let below = frame.pop()?;
                frame.push(top);
                frame.push(below);
            }
            OPCode::IAdd => self.binary_op(|a, b| Ok(a.wrapping_add(b)))?,
            OPCode::ISub => self.binary_op(|a, b| Ok(a.wrapping_sub(b)))?,
            OPCode::IMul => self.binary_op(|a, b| Ok(a.wrapping_mul(b)))?,
            OPCode::IDiv => self.binary_op(|a, b| match b {
                0 => Err(RuntimeError::ArithmeticError("/ by zero")),
                _ => Ok(a.wrapping_div(b)),
            })?,
            OPCode::IRem => self.binary_op(|a, b| match b {
                0 => Err(RuntimeError::ArithmeticError("/ by zero")),
                _ => Ok(a.wrapping_rem(b)),
            })?,
            OPCode::INeg => {
                let frame = self.frame()?;
                let value = frame.pop_int()?;
                frame.push(Value::Int(value.wrapping_neg()));
            }
            OPCode::IInc => {
                let (index, delta) = match inst.operand() {
                    Operand::Increment { index, delta } => (index, delta),
                    _ => return Err(invalid_operand(&inst)),
                };
                let frame = self.frame()?;
                let value = frame.load(index)?.as_int()?;
                frame.store(index, Value::Int(value.wrapping_add(delta)))?;
            }
            OPCode::IfEq
            | OPCode::IfNe
            | OPCode::IfLt
            | OPCode::IfGe
            | OPCode::IfGt
            | OPCode::IfLe => {
                let target = branch_operand(&inst)?;
                let frame = self.frame()?;
                let value = frame.pop_int()?;
                if compare(inst.get_mnemonic(), value, 0) {
                    frame.jump(target);
                }
            }
            OPCode::IfICmpEq
            | OPCode::IfICmpNe
            | OPCode::IfICmpLt
            | OPCode::IfICmpGe
            | OPCode::IfICmpGt
            | OPCode::IfICmpLe => {
                let target = branch_operand(&inst)?;
                let frame = self.frame()?;
                let b = frame.pop_int()?;
                let a = frame.pop_int()?;
                if compare(inst.get_mnemonic(), a, b) {
                    frame.jump(target);
                }
            }
            OPCode::IfNull | OPCode::IfNonNull => {
                let target = branch_operand(&inst)?;
                let frame = self.frame()?;
                let is_null = frame.pop()?.as_reference()? == Value::Null;
                if is_null == (inst.get_mnemonic() == OPCode::IfNull) {
                    frame.jump(target);
                }
            }
            OPCode::Goto => {
                let target = branch_operand(&inst)?;
                self.frame()?.jump(target);
            }
            OPCode::GetStatic => self.get_static(index_operand(&inst)?)?,
            OPCode::InvokeStatic => self.invoke_static(index_operand(&inst)?)?,
            OPCode::InvokeVirtual => self.invoke_virtual(index_operand(&inst)?)?,
            OPCode::IReturn => {
                let value = self.frame()?.pop_int()?;
                self.return_value(Value::Int(value))?;
            }
            OPCode::AReturn => {
                let value = self.frame()?.pop()?.as_reference()?;
                self.return_value(value)?;
            }
            OPCode::Return => {
                self.frames.pop();
            }
            OPCode::Unknown(_) => {
                let frame = self.frame()?;
                return Err(RuntimeError::UnsupportedOpcode {
                    opcode: inst.get_mnemonic(),
                    class: frame.class.name().to_string(),
                    method: frame.method.name().to_string(),
                    pc,
                });
            }
        }
        Ok(())
    }

    fn binary_op<F>(&mut self, op: F) -> Result<()>
    where
        F: FnOnce(i32, i32) -> Result<i32>,
    {
        let frame = self.frame()?;
        let b = frame.pop_int()?;
        let a = frame.pop_int()?;
        frame.push(Value::Int(op(a, b)?));
        Ok(())
    }

    /// Only Integer constants are loadable; other loadable kinds need an
    /// object model.
    fn ldc(&mut self, index: u16) -> Result<()> {
        let class = self.current_class()?;
        let pool = class.constant_pool();
        if let Some(
            other @ (CPInfo::ConstantFloat { .. }
            | CPInfo::ConstantString { .. }
            | CPInfo::ConstantClass { .. }
            | CPInfo::ConstantMethodType { .. }
            | CPInfo::ConstantMethodHandle { .. }
            | CPInfo::ConstantDynamic { .. }),
        ) = pool.get(index)
        {
            return Err(RuntimeError::Unsupported(format!("ldc of {other:?}")));
        }
        let value = pool.integer(index)?;
        self.frame()?.push(Value::Int(value));
        Ok(())
    }

    fn get_static(&mut self, index: u16) -> Result<()> {
        let class = self.current_class()?;
        let field = class.constant_pool().field_ref(index)?;
        let value = self
            .intrinsics
            .static_field(&field.class, &field.name)
            .ok_or_else(|| {
                RuntimeError::Unsupported(format!("static field {}.{}", field.class, field.name))
            })?;
        self.frame()?.push(value);
        Ok(())
    }

    fn invoke_static(&mut self, index: u16) -> Result<()> {
        let class = self.current_class()?;
        let target = class.constant_pool().method_ref(index)?;
        let arg_types = narrow_arg_types(&target.descriptor)?;

        if let Some(native) =
            self.intrinsics
                .method(CallKind::Static, &target.class, &target.name, arg_types.len())
        {
            let args = self.frame()?.pop_args(arg_types.len())?;
            let call = NativeCall {
                receiver: None,
                args,
                arg_types,
            };
            let result = native(&mut self.host, call)?;
            return self.finish_native(result);
        }

        let (callee_class, method) =
            self.resolve_method(&target.class, &target.name, &target.descriptor)?;
        if !method.is_static() || method.code().is_none() {
            return Err(RuntimeError::Unsupported(format!(
                "invokestatic of {}.{}{}",
                callee_class.name(),
                method.name(),
                method.descriptor()
            )));
        }
        let args = self.frame()?.pop_args(method.arg_count())?;
        self.frames
            .push(Frame::with_args(callee_class, method, args))
    }

    fn invoke_virtual(&mut self, index: u16) -> Result<()> {
        let class = self.current_class()?;
        let target = class.constant_pool().method_ref(index)?;
        let arg_types = narrow_arg_types(&target.descriptor)?;

        let native = self
            .intrinsics
            .method(CallKind::Virtual, &target.class, &target.name, arg_types.len())
            .ok_or_else(|| {
                RuntimeError::Unsupported(format!(
                    "virtual dispatch to {}.{}{}",
                    target.class, target.name, target.descriptor
                ))
            })?;
        let frame = self.frame()?;
        let args = frame.pop_args(arg_types.len())?;
        let receiver = frame.pop()?;
        let call = NativeCall {
            receiver: Some(receiver),
            args,
            arg_types,
        };
        let result = native(&mut self.host, call)?;
        self.finish_native(result)
    }

    fn finish_native(&mut self, result: Option<Value>) -> Result<()> {
        if let Some(value) = result {
            self.frame()?.push(value);
        }
        Ok(())
    }

    /// Looks `name` up in `class_name` and its superclasses.
    fn resolve_method(
        &mut self,
        class_name: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<(Rc<Class>, Rc<Method>)> {
        let mut class = self.loader.resolve(class_name)?;
        loop {
            if let Some(method) = class.find_method(name, descriptor) {
                return Ok((class, method));
            }
            // A superclass missing from every root ends the search; one that
            // exists but fails to load is an error of its own.
            let parent = match class.super_name() {
                Some(super_name) => self.loader.try_resolve(super_name)?,
                None => None,
            };
            match parent {
                Some(parent) => class = parent,
                None => {
                    return Err(RuntimeError::MethodNotFound {
                        class: class_name.to_string(),
                        name: name.to_string(),
                        descriptor: descriptor.to_string(),
                    })
                }
            }
        }
    }

    fn return_value(&mut self, value: Value) -> Result<()> {
        self.frames.pop();
        let caller = self.frames.top_mut().ok_or_else(|| {
            RuntimeError::InvalidFrameAccess("value returned from the outermost frame".to_string())
        })?;
        caller.push(value);
        Ok(())
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("loader", &self.loader)
            .field("frames", &self.frames)
            .field("executed", &self.executed)
            .finish_non_exhaustive()
    }
}

/// Run `main_class` from `classpath`, printing to the process streams.
pub fn run(classpath: Classpath, main_class: &str) -> Result<()> {
    Runtime::new(ClassLoader::new(classpath)).start(main_class)
}

/// Argument types of a call descriptor. 64-bit arguments are rejected since
/// values are single-slot.
fn narrow_arg_types(descriptor: &str) -> Result<Vec<Type>> {
    let (arg_types, _) = parse_method_types(descriptor)
        .ok_or_else(|| RuntimeError::InvalidDescriptor(descriptor.to_string()))?;
    if arg_types.iter().any(Type::is_wide) {
        return Err(RuntimeError::Unsupported(format!(
            "64-bit arguments in {descriptor}"
        )));
    }
    Ok(arg_types)
}

fn compare(opcode: OPCode, a: i32, b: i32) -> bool {
    match opcode {
        OPCode::IfEq | OPCode::IfICmpEq => a == b,
        OPCode::IfNe | OPCode::IfICmpNe => a != b,
        OPCode::IfLt | OPCode::IfICmpLt => a < b,
        OPCode::IfGe | OPCode::IfICmpGe => a >= b,
        OPCode::IfGt | OPCode::IfICmpGt => a > b,
        OPCode::IfLe | OPCode::IfICmpLe => a <= b,
        _ => false,
    }
}

fn invalid_operand(inst: &Instruction) -> RuntimeError {
    RuntimeError::InvalidOperand {
        opcode: inst.get_mnemonic(),
        operand: inst.operand(),
    }
}

fn int_operand(inst: &Instruction) -> Result<i32> {
    match inst.operand() {
        Operand::Int(value) => Ok(value),
        _ => Err(invalid_operand(inst)),
    }
}

fn index_operand(inst: &Instruction) -> Result<u16> {
    match inst.operand() {
        Operand::Index(index) => Ok(index),
        _ => Err(invalid_operand(inst)),
    }
}

fn local_operand(inst: &Instruction) -> Result<u16> {
    match inst.operand() {
        Operand::Local(index) => Ok(index),
        _ => Err(invalid_operand(inst)),
    }
}

fn branch_operand(inst: &Instruction) -> Result<usize> {
    match inst.operand() {
        Operand::Branch(target) => Ok(target),
        _ => Err(invalid_operand(inst)),
    }
}
