//! Test helpers: a small class file assembler, scratch classpath
//! directories and a capturable output sink.
use crate::classpath::class_file_path;

use byteorder::{BigEndian, WriteBytesExt};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::rc::Rc;
use tempfile::TempDir;

/// Opcode bytes used by tests.
pub mod op {
    pub const ICONST_0: u8 = 0x03;
    pub const ICONST_1: u8 = 0x04;
    pub const ICONST_3: u8 = 0x06;
    pub const ICONST_4: u8 = 0x07;
    pub const BIPUSH: u8 = 0x10;
    pub const SIPUSH: u8 = 0x11;
    pub const LDC: u8 = 0x12;
    pub const ILOAD: u8 = 0x15;
    pub const ILOAD_0: u8 = 0x1a;
    pub const ILOAD_1: u8 = 0x1b;
    pub const ILOAD_2: u8 = 0x1c;
    pub const ACONST_NULL: u8 = 0x01;
    pub const ALOAD_1: u8 = 0x2b;
    pub const ISTORE: u8 = 0x36;
    pub const ISTORE_1: u8 = 0x3c;
    pub const ASTORE_1: u8 = 0x4c;
    pub const POP: u8 = 0x57;
    pub const DUP: u8 = 0x59;
    pub const SWAP: u8 = 0x5f;
    pub const IADD: u8 = 0x60;
    pub const ISUB: u8 = 0x64;
    pub const IMUL: u8 = 0x68;
    pub const IDIV: u8 = 0x6c;
    pub const IREM: u8 = 0x70;
    pub const INEG: u8 = 0x74;
    pub const IINC: u8 = 0x84;
    pub const IFLE: u8 = 0x9e;
    pub const IF_ICMPEQ: u8 = 0x9f;
    pub const IF_ICMPNE: u8 = 0xa0;
    pub const IF_ICMPLT: u8 = 0xa1;
    pub const IF_ICMPGE: u8 = 0xa2;
    pub const IF_ICMPGT: u8 = 0xa3;
    pub const IF_ICMPLE: u8 = 0xa4;
    pub const GOTO: u8 = 0xa7;
    pub const IRETURN: u8 = 0xac;
    pub const ARETURN: u8 = 0xb0;
    pub const RETURN: u8 = 0xb1;
    pub const GETSTATIC: u8 = 0xb2;
    pub const INVOKEVIRTUAL: u8 = 0xb6;
    pub const INVOKESTATIC: u8 = 0xb8;
    pub const NEW: u8 = 0xbb;
    pub const WIDE: u8 = 0xc4;
    pub const IFNULL: u8 = 0xc6;
    pub const IFNONNULL: u8 = 0xc7;
}

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_NATIVE: u16 = 0x0100;

/// Assembles minimal but well-formed class files.
pub struct ClassBuilder {
    name: String,
    pool: Vec<u8>,
    next_index: u16,
    utf8: HashMap<String, u16>,
    classes: HashMap<String, u16>,
    this_class: u16,
    super_class: u16,
    methods: Vec<Vec<u8>>,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        let mut builder = ClassBuilder {
            name: name.to_string(),
            pool: Vec::new(),
            next_index: 1,
            utf8: HashMap::new(),
            classes: HashMap::new(),
            this_class: 0,
            super_class: 0,
            methods: Vec::new(),
        };
        builder.this_class = builder.class(name);
        builder.super_class = builder.class("java/lang/Object");
        builder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Overrides the superclass.
    pub fn extends(&mut self, name: &str) -> &mut Self {
        self.super_class = self.class(name);
        self
    }

    fn entry(&mut self, bytes: Vec<u8>, slots: u16) -> u16 {
        let index = self.next_index;
        self.pool.extend(bytes);
        self.next_index += slots;
        index
    }

    pub fn utf8(&mut self, value: &str) -> u16 {
        if let Some(index) = self.utf8.get(value) {
            return *index;
        }
        let mut bytes = vec![1];
        bytes.write_u16::<BigEndian>(value.len() as u16).unwrap();
        bytes.extend_from_slice(value.as_bytes());
        let index = self.entry(bytes, 1);
        self.utf8.insert(value.to_string(), index);
        index
    }

    pub fn class(&mut self, name: &str) -> u16 {
        if let Some(index) = self.classes.get(name) {
            return *index;
        }
        let name_index = self.utf8(name);
        let mut bytes = vec![7];
        bytes.write_u16::<BigEndian>(name_index).unwrap();
        let index = self.entry(bytes, 1);
        self.classes.insert(name.to_string(), index);
        index
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        let mut bytes = vec![3];
        bytes.write_i32::<BigEndian>(value).unwrap();
        self.entry(bytes, 1)
    }

    pub fn long(&mut self, value: i64) -> u16 {
        let mut bytes = vec![5];
        bytes.write_i64::<BigEndian>(value).unwrap();
        self.entry(bytes, 2)
    }

    pub fn string(&mut self, value: &str) -> u16 {
        let string_index = self.utf8(value);
        let mut bytes = vec![8];
        bytes.write_u16::<BigEndian>(string_index).unwrap();
        self.entry(bytes, 1)
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let mut bytes = vec![12];
        bytes.write_u16::<BigEndian>(name_index).unwrap();
        bytes.write_u16::<BigEndian>(descriptor_index).unwrap();
        self.entry(bytes, 1)
    }

    fn member_ref(&mut self, tag: u8, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(class);
        let name_and_type_index = self.name_and_type(name, descriptor);
        let mut bytes = vec![tag];
        bytes.write_u16::<BigEndian>(class_index).unwrap();
        bytes.write_u16::<BigEndian>(name_and_type_index).unwrap();
        self.entry(bytes, 1)
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.member_ref(9, class, name, descriptor)
    }

    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.member_ref(10, class, name, descriptor)
    }

    pub fn interface_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.member_ref(11, class, name, descriptor)
    }

    /// Adds a `public static` method with a `Code` attribute.
    pub fn method(
        &mut self,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: &[u8],
    ) -> &mut Self {
        self.method_with_flags(
            ACC_PUBLIC | ACC_STATIC,
            name,
            descriptor,
            max_stack,
            max_locals,
            code,
        )
    }

    fn method_with_flags(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: &[u8],
    ) -> &mut Self {
        let code_name = self.utf8("Code");
        let mut bytes = self.member_header(access_flags, name, descriptor);
        bytes.write_u16::<BigEndian>(1).unwrap();
        bytes.write_u16::<BigEndian>(code_name).unwrap();
        // max_stack, max_locals, code_length, code, exception and attribute counts
        bytes.write_u32::<BigEndian>(2 + 2 + 4 + code.len() as u32 + 2 + 2).unwrap();
        bytes.write_u16::<BigEndian>(max_stack).unwrap();
        bytes.write_u16::<BigEndian>(max_locals).unwrap();
        bytes.write_u32::<BigEndian>(code.len() as u32).unwrap();
        bytes.extend_from_slice(code);
        bytes.write_u16::<BigEndian>(0).unwrap();
        bytes.write_u16::<BigEndian>(0).unwrap();
        self.methods.push(bytes);
        self
    }

    /// Adds a `public static native` method, which has no code.
    pub fn native_method(&mut self, name: &str, descriptor: &str) -> &mut Self {
        let mut bytes = self.member_header(ACC_PUBLIC | ACC_STATIC | ACC_NATIVE, name, descriptor);
        bytes.write_u16::<BigEndian>(0).unwrap();
        self.methods.push(bytes);
        self
    }

    fn member_header(&mut self, access_flags: u16, name: &str, descriptor: &str) -> Vec<u8> {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let mut bytes = Vec::new();
        bytes.write_u16::<BigEndian>(access_flags).unwrap();
        bytes.write_u16::<BigEndian>(name_index).unwrap();
        bytes.write_u16::<BigEndian>(descriptor_index).unwrap();
        bytes
    }

    pub fn build(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.write_u32::<BigEndian>(0xcafe_babe).unwrap();
        bytes.write_u16::<BigEndian>(0).unwrap();
        bytes.write_u16::<BigEndian>(52).unwrap();
        bytes.write_u16::<BigEndian>(self.next_index).unwrap();
        bytes.extend_from_slice(&self.pool);
        bytes.write_u16::<BigEndian>(0x0021).unwrap();
        bytes.write_u16::<BigEndian>(self.this_class).unwrap();
        bytes.write_u16::<BigEndian>(self.super_class).unwrap();
        // interfaces, fields
        bytes.write_u16::<BigEndian>(0).unwrap();
        bytes.write_u16::<BigEndian>(0).unwrap();
        bytes.write_u16::<BigEndian>(self.methods.len() as u16).unwrap();
        for method in &self.methods {
            bytes.extend_from_slice(method);
        }
        bytes.write_u16::<BigEndian>(0).unwrap();
        bytes
    }
}

/// Temporary classpath root, removed on drop.
pub struct ScratchDir(TempDir);

impl ScratchDir {
    pub fn new(tag: &str) -> Self {
        let dir = tempfile::Builder::new()
            .prefix(&format!("bela-{tag}-"))
            .tempdir()
            .unwrap();
        ScratchDir(dir)
    }

    pub fn path(&self) -> &Path {
        self.0.path()
    }

    /// Writes `bytes` where a class named `name` is looked up.
    pub fn write_class(&self, name: &str, bytes: &[u8]) {
        let path = class_file_path(self.path(), name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }
}

/// Output sink whose contents can be inspected after the writer has been
/// handed to a runtime.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
