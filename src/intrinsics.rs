//! Host-provided fields and methods.
//!
//! The runtime has no object model, so the handful of library members a
//! program needs to produce output are recognized by owner, name and arity
//! and executed natively instead of being resolved on the classpath.
use crate::program::{BaseTypeKind, Type};
use crate::runtime::{Result, RuntimeError, Value};

use std::fmt;
use std::io::{self, Write};

/// Opaque objects owned by the host and handed to bytecode as references.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HostObject {
    Stdout,
    Stderr,
}

impl fmt::Display for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HostObject::Stdout => write!(f, "java.io.PrintStream@stdout"),
            HostObject::Stderr => write!(f, "java.io.PrintStream@stderr"),
        }
    }
}

/// Output sinks backing the host objects.
pub struct HostStreams {
    out: Box<dyn Write>,
    err: Box<dyn Write>,
}

impl HostStreams {
    pub fn new(out: Box<dyn Write>, err: Box<dyn Write>) -> Self {
        Self { out, err }
    }

    /// Streams of the current process.
    pub fn stdio() -> Self {
        Self::new(Box::new(io::stdout()), Box::new(io::stderr()))
    }

    pub fn stream(&mut self, object: HostObject) -> &mut dyn Write {
        match object {
            HostObject::Stdout => self.out.as_mut(),
            HostObject::Stderr => self.err.as_mut(),
        }
    }
}

impl fmt::Debug for HostStreams {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HostStreams").finish_non_exhaustive()
    }
}

/// Invocation kinds an intrinsic method can be bound to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallKind {
    Static,
    Virtual,
}

/// Arguments of one intrinsic call, already popped from the operand stack.
#[derive(Debug, Clone)]
pub struct NativeCall {
    pub receiver: Option<Value>,
    pub args: Vec<Value>,
    pub arg_types: Vec<Type>,
}

impl NativeCall {
    /// Receiver as a host stream handle.
    fn stream(&self) -> Result<HostObject> {
        match self.receiver {
            Some(Value::Reference(object)) => Ok(object),
            Some(Value::Null) => Err(RuntimeError::Unsupported(
                "intrinsic invoked on a null receiver".to_string(),
            )),
            Some(found) => Err(RuntimeError::TypeMismatch {
                expected: "reference",
                found,
            }),
            None => Err(RuntimeError::Unsupported(
                "intrinsic requires a receiver".to_string(),
            )),
        }
    }
}

/// Host implementation of an intrinsic method. Returns the value pushed
/// back onto the caller's operand stack, if any.
pub type NativeMethod = fn(&mut HostStreams, NativeCall) -> Result<Option<Value>>;

#[derive(Debug, Clone)]
struct FieldEntry {
    owner: String,
    name: String,
    value: Value,
}

#[derive(Debug, Clone)]
struct MethodEntry {
    kind: CallKind,
    owner: String,
    name: String,
    arity: usize,
    action: NativeMethod,
}

/// `IntrinsicTable` maps `(owner, member, arity)` to host behavior. It is
/// consulted before a callee is resolved on the classpath.
#[derive(Debug, Clone)]
pub struct IntrinsicTable {
    fields: Vec<FieldEntry>,
    methods: Vec<MethodEntry>,
}

impl IntrinsicTable {
    /// A table with no entries.
    pub fn empty() -> Self {
        Self {
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Registers a static field. Later registrations shadow earlier ones.
    pub fn register_field(&mut self, owner: &str, name: &str, value: Value) {
        self.fields.insert(
            0,
            FieldEntry {
                owner: owner.to_string(),
                name: name.to_string(),
                value,
            },
        );
    }

    /// Registers a method. Later registrations shadow earlier ones.
    pub fn register_method(
        &mut self,
        kind: CallKind,
        owner: &str,
        name: &str,
        arity: usize,
        action: NativeMethod,
    ) {
        self.methods.insert(
            0,
            MethodEntry {
                kind,
                owner: owner.to_string(),
                name: name.to_string(),
                arity,
                action,
            },
        );
    }

    pub fn static_field(&self, owner: &str, name: &str) -> Option<Value> {
        self.fields
            .iter()
            .find(|entry| entry.owner == owner && entry.name == name)
            .map(|entry| entry.value)
    }

    pub fn method(
        &self,
        kind: CallKind,
        owner: &str,
        name: &str,
        arity: usize,
    ) -> Option<NativeMethod> {
        self.methods
            .iter()
            .find(|entry| {
                entry.kind == kind
                    && entry.arity == arity
                    && entry.owner == owner
                    && entry.name == name
            })
            .map(|entry| entry.action)
    }
}

impl Default for IntrinsicTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.register_field("java/lang/System", "out", Value::Reference(HostObject::Stdout));
        table.register_field("java/lang/System", "err", Value::Reference(HostObject::Stderr));
        table.register_method(CallKind::Virtual, "java/io/PrintStream", "println", 0, println);
        table.register_method(CallKind::Virtual, "java/io/PrintStream", "println", 1, println);
        table.register_method(CallKind::Virtual, "java/io/PrintStream", "print", 1, print);
        table
    }
}

/// Renders a value the way `PrintStream` prints the declared parameter type.
fn render(value: &Value, t: Option<&Type>) -> String {
    match (t.map(Type::kind), value) {
        (Some(BaseTypeKind::Boolean), Value::Int(v)) => (*v != 0).to_string(),
        (Some(BaseTypeKind::Char), Value::Int(v)) => {
            char::from_u32(*v as u16 as u32)
                .unwrap_or(char::REPLACEMENT_CHARACTER)
                .to_string()
        }
        _ => value.to_string(),
    }
}

fn print(host: &mut HostStreams, call: NativeCall) -> Result<Option<Value>> {
    let stream = call.stream()?;
    let out = host.stream(stream);
    if let Some(value) = call.args.first() {
        write!(out, "{}", render(value, call.arg_types.first()))?;
    }
    out.flush()?;
    Ok(None)
}

fn println(host: &mut HostStreams, call: NativeCall) -> Result<Option<Value>> {
    let stream = call.stream()?;
    let out = host.stream(stream);
    match call.args.first() {
        Some(value) => writeln!(out, "{}", render(value, call.arg_types.first()))?,
        None => writeln!(out)?,
    }
    out.flush()?;
    Ok(None)
}
