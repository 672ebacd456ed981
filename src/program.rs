//! Abstract representation of a loaded Java class: its constant pool and
//! the methods the runtime can execute.
use crate::bytecode::{decode, Instruction};
use crate::jvm::{AttributeInfo, CPInfo, JVMClassFile};
use crate::runtime::{Result, RuntimeError};

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::OnceLock;

use regex::Regex;

/// Name and descriptor of the program entry point.
pub const ENTRY_POINT: (&str, &str) = ("main", "([Ljava/lang/String;)V");

const ACC_STATIC: u16 = 0x0008;

/// Primitive types supported by the JVM.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BaseTypeKind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Void,
    Reference,
    List,
}

/// JVM value type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    t: BaseTypeKind,
    sub_t: Option<Box<Type>>,
}

impl Type {
    fn base(t: BaseTypeKind) -> Self {
        Type { t, sub_t: None }
    }

    pub fn kind(&self) -> BaseTypeKind {
        self.t
    }

    /// Element type of an array type.
    pub fn element(&self) -> Option<&Type> {
        self.sub_t.as_deref()
    }

    /// Returns the size in words of a given type.
    pub fn size(&self) -> usize {
        match self.t {
            BaseTypeKind::Long | BaseTypeKind::Double => 2,
            BaseTypeKind::Void => 0,
            _ => 1,
        }
    }

    pub fn is_wide(&self) -> bool {
        self.size() == 2
    }
}

/// Parse a method descriptor such as `(I[Ljava/lang/String;)V`, returns a
/// tuple of argument types and return type.
pub fn parse_method_types(descriptor: &str) -> Option<(Vec<Type>, Type)> {
    static DESCRIPTOR: OnceLock<Regex> = OnceLock::new();
    let re = DESCRIPTOR.get_or_init(|| {
        Regex::new(r"^\(([^)]*)\)(.+)$").expect("method descriptor pattern is valid")
    });
    let caps = re.captures(descriptor)?;
    let mut args = caps.get(1).map_or("", |m| m.as_str());
    let ret = caps.get(2).map_or("", |m| m.as_str());

    let mut types = Vec::new();
    while !args.is_empty() {
        let (t, length) = decode_type(args)?;
        if t.t == BaseTypeKind::Void {
            return None;
        }
        types.push(t);
        args = &args[length..];
    }
    match decode_type(ret)? {
        (t, length) if length == ret.len() => Some((types, t)),
        _ => None,
    }
}

/// Decodes the field type at the start of `type_str`, returning it along
/// with the number of bytes it spans.
pub fn decode_type(type_str: &str) -> Option<(Type, usize)> {
    let t = match type_str.as_bytes().first()? {
        b'Z' => BaseTypeKind::Boolean,
        b'B' => BaseTypeKind::Byte,
        b'C' => BaseTypeKind::Char,
        b'S' => BaseTypeKind::Short,
        b'I' => BaseTypeKind::Int,
        b'J' => BaseTypeKind::Long,
        b'F' => BaseTypeKind::Float,
        b'D' => BaseTypeKind::Double,
        b'V' => BaseTypeKind::Void,
        b'L' => {
            let end = type_str.find(';')?;
            return (end > 1).then(|| (Type::base(BaseTypeKind::Reference), end + 1));
        }
        b'[' => {
            let (element, length) = decode_type(&type_str[1..])?;
            if element.t == BaseTypeKind::Void {
                return None;
            }
            let list = Type {
                t: BaseTypeKind::List,
                sub_t: Some(Box::new(element)),
            };
            return Some((list, length + 1));
        }
        _ => return None,
    };
    Some((Type::base(t), 1))
}

/// Symbolic field reference resolved from the constant pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

/// Symbolic method reference resolved from the constant pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRef {
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

/// Read-only view over a class constant pool. Every lookup interprets the
/// entry at `index` on demand and fails with `MalformedReference` when the
/// index is out of range or points at another kind of entry.
#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<CPInfo>,
}

impl ConstantPool {
    pub fn new(entries: Vec<CPInfo>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn get(&self, index: u16) -> Option<&CPInfo> {
        self.entries.get(index as usize)
    }

    pub fn utf8(&self, index: u16) -> Result<&str> {
        match self.get(index) {
            Some(CPInfo::ConstantUtf8 { bytes }) => Ok(bytes),
            _ => Err(malformed(index, "Utf8")),
        }
    }

    pub fn class_ref(&self, index: u16) -> Result<&str> {
        match self.get(index) {
            Some(CPInfo::ConstantClass { name_index }) => self.utf8(*name_index),
            _ => Err(malformed(index, "Class")),
        }
    }

    /// Returns `(name, descriptor)`.
    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.get(index) {
            Some(CPInfo::ConstantNameAndType {
                name_index,
                descriptor_index,
            }) => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => Err(malformed(index, "NameAndType")),
        }
    }

    pub fn field_ref(&self, index: u16) -> Result<FieldRef> {
        match self.get(index) {
            Some(CPInfo::ConstantFieldRef {
                class_index,
                name_and_type_index,
            }) => {
                let class = self.class_ref(*class_index)?;
                let (name, descriptor) = self.name_and_type(*name_and_type_index)?;
                Ok(FieldRef {
                    class: class.to_string(),
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                })
            }
            _ => Err(malformed(index, "Fieldref")),
        }
    }

    /// Accepts both `Methodref` and `InterfaceMethodref` entries.
    pub fn method_ref(&self, index: u16) -> Result<MethodRef> {
        match self.get(index) {
            Some(CPInfo::ConstantMethodRef {
                class_index,
                name_and_type_index,
            })
            | Some(CPInfo::ConstantInterfaceMethodRef {
                class_index,
                name_and_type_index,
            }) => {
                let class = self.class_ref(*class_index)?;
                let (name, descriptor) = self.name_and_type(*name_and_type_index)?;
                Ok(MethodRef {
                    class: class.to_string(),
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                })
            }
            _ => Err(malformed(index, "Methodref")),
        }
    }

    pub fn integer(&self, index: u16) -> Result<i32> {
        match self.get(index) {
            Some(CPInfo::ConstantInteger { bytes }) => Ok(*bytes),
            _ => Err(malformed(index, "Integer")),
        }
    }
}

fn malformed(index: u16, expected: &'static str) -> RuntimeError {
    RuntimeError::MalformedReference { index, expected }
}

/// Java class method representation for the interpreter.
#[derive(Debug, Clone)]
pub struct Method {
    name: String,
    descriptor: String,
    access_flags: u16,
    return_type: Type,
    arg_types: Vec<Type>,
    max_stack: u16,
    max_locals: u16,
    // None for abstract and native methods.
    code: Option<Vec<Instruction>>,
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub fn return_type(&self) -> &Type {
        &self.return_type
    }

    /// Number of values popped from the caller's operand stack, receiver
    /// excluded.
    pub fn arg_count(&self) -> usize {
        self.arg_types.len()
    }

    pub fn max_stack(&self) -> u16 {
        self.max_stack
    }

    pub fn max_locals(&self) -> u16 {
        self.max_locals
    }

    pub fn code(&self) -> Option<&[Instruction]> {
        self.code.as_deref()
    }
}

/// Representation of a loaded class. Immutable once built and shared by
/// every frame executing one of its methods.
#[derive(Debug, Clone)]
pub struct Class {
    name: String,
    super_name: Option<String>,
    constant_pool: ConstantPool,
    // Methods keyed by (name, descriptor).
    methods: HashMap<(String, String), Rc<Method>>,
}

impl Class {
    /// Build a new class from a parsed class file.
    pub fn new(class_file: &JVMClassFile) -> Result<Self> {
        let constant_pool = ConstantPool::new(class_file.constant_pool().to_vec());
        let name = constant_pool.class_ref(class_file.this_class())?.to_string();
        let super_name = match class_file.super_class() {
            0 => None,
            index => Some(constant_pool.class_ref(index)?.to_string()),
        };

        let mut methods = HashMap::new();
        for method_info in class_file.methods() {
            let method_name = constant_pool.utf8(method_info.name_index())?.to_string();
            let descriptor = constant_pool
                .utf8(method_info.descriptor_index())?
                .to_string();
            let (arg_types, return_type) = parse_method_types(&descriptor)
                .ok_or_else(|| RuntimeError::InvalidDescriptor(descriptor.clone()))?;

            let (max_stack, max_locals, code) = match method_info.attributes().get("Code") {
                Some(AttributeInfo::CodeAttribute {
                    max_stack,
                    max_locals,
                    code,
                    ..
                }) => {
                    let instructions =
                        decode(code).map_err(|source| RuntimeError::InvalidCode {
                            class: name.clone(),
                            method: method_name.clone(),
                            source,
                        })?;
                    (*max_stack, *max_locals, Some(instructions))
                }
                _ => (0, 0, None),
            };

            let method = Method {
                name: method_name.clone(),
                descriptor: descriptor.clone(),
                access_flags: method_info.access_flags(),
                return_type,
                arg_types,
                max_stack,
                max_locals,
                code,
            };
            methods.insert((method_name, descriptor), Rc::new(method));
        }

        Ok(Self {
            name,
            super_name,
            constant_pool,
            methods,
        })
    }

    /// Fully qualified name in internal form (`java/lang/Object`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn super_name(&self) -> Option<&str> {
        self.super_name.as_deref()
    }

    pub fn constant_pool(&self) -> &ConstantPool {
        &self.constant_pool
    }

    pub fn methods(&self) -> impl Iterator<Item = &Rc<Method>> {
        self.methods.values()
    }

    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<Rc<Method>> {
        self.methods
            .get(&(name.to_string(), descriptor.to_string()))
            .cloned()
    }

    /// Returns the program entry point: `main(String[])`, or failing that
    /// a static `main` the runtime can call without arguments.
    pub fn entry_point(&self) -> Option<Rc<Method>> {
        let (name, descriptor) = ENTRY_POINT;
        self.find_method(name, descriptor).or_else(|| {
            self.methods()
                .find(|m| m.name() == name && m.is_static() && m.arg_count() == 0)
                .cloned()
        })
    }
}
