//! Lightweight implementation of a parser and decoder for JVM bytecode
//! class files.
//!
//! The parser only materializes the class file structure: constant pool
//! entries keep their raw indices and are interpreted lazily by the
//! accessors in [`crate::program`].
use byteorder::{BigEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::path::Path;

/// Magic number every class file starts with.
pub const MAGIC: u32 = 0xCAFE_BABE;

/// `ParseError` covers every way a byte stream can fail to be a class file.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid magic {0:#010x}, expected 0xcafebabe")]
    InvalidMagic(u32),
    #[error("truncated class file: {0}")]
    Truncated(#[from] io::Error),
    #[error("unknown constant pool tag {tag} at index {index}")]
    UnknownTag { tag: u8, index: u16 },
    #[error("invalid modified UTF-8 in constant pool entry {0}")]
    InvalidUtf8(u16),
    #[error("attribute name index {0} does not point at a UTF-8 constant")]
    BadAttributeName(u16),
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// Constant pool entries as laid out in the class file.
#[derive(Debug, Clone, PartialEq)]
pub enum CPInfo {
    /// Slot 0 and the upper half of 8-byte constants.
    Unusable,
    ConstantUtf8 {
        bytes: String,
    },
    ConstantInteger {
        bytes: i32,
    },
    ConstantFloat {
        bytes: f32,
    },
    ConstantLong {
        bytes: i64,
    },
    ConstantDouble {
        bytes: f64,
    },
    ConstantClass {
        name_index: u16,
    },
    ConstantString {
        string_index: u16,
    },
    ConstantFieldRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantInterfaceMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantNameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    ConstantMethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    ConstantMethodType {
        descriptor_index: u16,
    },
    ConstantDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    ConstantInvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    ConstantModule {
        name_index: u16,
    },
    ConstantPackage {
        name_index: u16,
    },
}

/// One row of a `Code` attribute exception table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

/// Attributes we decode, everything else is kept as raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeInfo {
    CodeAttribute {
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
        exception_table: Vec<ExceptionEntry>,
        attributes: HashMap<String, AttributeInfo>,
    },
    ConstantValueAttribute {
        constant_value_index: u16,
    },
    RawAttribute {
        bytes: Vec<u8>,
    },
}

/// Field or method entry, both share the same layout.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberInfo {
    access_flags: u16,
    name_index: u16,
    descriptor_index: u16,
    attributes: HashMap<String, AttributeInfo>,
}

pub type FieldInfo = MemberInfo;
pub type MethodInfo = MemberInfo;

impl MemberInfo {
    pub fn access_flags(&self) -> u16 {
        self.access_flags
    }

    pub fn name_index(&self) -> u16 {
        self.name_index
    }

    pub fn descriptor_index(&self) -> u16 {
        self.descriptor_index
    }

    pub fn attributes(&self) -> &HashMap<String, AttributeInfo> {
        &self.attributes
    }
}

/// In-memory representation of a parsed class file.
#[derive(Debug, Clone, PartialEq)]
pub struct JVMClassFile {
    magic: u32,
    minor_version: u16,
    major_version: u16,
    constant_pool: Vec<CPInfo>,
    access_flags: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<FieldInfo>,
    methods: Vec<MethodInfo>,
    attributes: HashMap<String, AttributeInfo>,
}

impl JVMClassFile {
    pub fn magic(&self) -> u32 {
        self.magic
    }

    /// Returns `(major, minor)`.
    pub fn version(&self) -> (u16, u16) {
        (self.major_version, self.minor_version)
    }

    /// Constant pool, indexed exactly like the class file (slot 0 unusable).
    pub fn constant_pool(&self) -> &[CPInfo] {
        &self.constant_pool
    }

    pub fn access_flags(&self) -> u16 {
        self.access_flags
    }

    pub fn this_class(&self) -> u16 {
        self.this_class
    }

    pub fn super_class(&self) -> u16 {
        self.super_class
    }

    pub fn interfaces(&self) -> &[u16] {
        &self.interfaces
    }

    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    pub fn methods(&self) -> &[MethodInfo] {
        &self.methods
    }

    pub fn attributes(&self) -> &HashMap<String, AttributeInfo> {
        &self.attributes
    }
}

/// Reads a class file from disk.
pub fn read_class_file(path: &Path) -> io::Result<Vec<u8>> {
    std::fs::read(path)
}

/// `JVMParser` decodes class file bytes into a [`JVMClassFile`].
pub struct JVMParser<'a> {
    cursor: Cursor<&'a [u8]>,
    constant_pool: Vec<CPInfo>,
}

impl<'a> JVMParser<'a> {
    /// Parse a complete class file.
    pub fn parse(bytes: &'a [u8]) -> Result<JVMClassFile> {
        let mut parser = JVMParser {
            cursor: Cursor::new(bytes),
            constant_pool: Vec::new(),
        };
        parser.class_file()
    }

    fn class_file(&mut self) -> Result<JVMClassFile> {
        let magic = self.u32()?;
        if magic != MAGIC {
            return Err(ParseError::InvalidMagic(magic));
        }
        let minor_version = self.u16()?;
        let major_version = self.u16()?;
        self.parse_constant_pool()?;
        let access_flags = self.u16()?;
        let this_class = self.u16()?;
        let super_class = self.u16()?;

        let interfaces_count = self.u16()?;
        let interfaces = (0..interfaces_count)
            .map(|_| self.u16())
            .collect::<Result<Vec<_>>>()?;
        let fields = self.members()?;
        let methods = self.members()?;
        let attributes = self.attributes()?;

        Ok(JVMClassFile {
            magic,
            minor_version,
            major_version,
            constant_pool: std::mem::take(&mut self.constant_pool),
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    fn parse_constant_pool(&mut self) -> Result<()> {
        let count = self.u16()?;
        self.constant_pool.reserve(count as usize);
        self.constant_pool.push(CPInfo::Unusable);
        let mut index = 1;
        while index < count {
            let entry = self.constant(index)?;
            let wide = matches!(
                entry,
                CPInfo::ConstantLong { .. } | CPInfo::ConstantDouble { .. }
            );
            self.constant_pool.push(entry);
            index += 1;
            if wide {
                self.constant_pool.push(CPInfo::Unusable);
                index += 1;
            }
        }
        Ok(())
    }

    fn constant(&mut self, index: u16) -> Result<CPInfo> {
        let tag = self.u8()?;
        let entry = match tag {
            1 => {
                let length = self.u16()?;
                let mut raw = vec![0u8; length as usize];
                self.cursor.read_exact(&mut raw)?;
                let bytes = decode_mutf8(&raw).ok_or(ParseError::InvalidUtf8(index))?;
                CPInfo::ConstantUtf8 { bytes }
            }
            3 => CPInfo::ConstantInteger {
                bytes: self.cursor.read_i32::<BigEndian>()?,
            },
            4 => CPInfo::ConstantFloat {
                bytes: self.cursor.read_f32::<BigEndian>()?,
            },
            5 => CPInfo::ConstantLong {
                bytes: self.cursor.read_i64::<BigEndian>()?,
            },
            6 => CPInfo::ConstantDouble {
                bytes: self.cursor.read_f64::<BigEndian>()?,
            },
            7 => CPInfo::ConstantClass {
                name_index: self.u16()?,
            },
            8 => CPInfo::ConstantString {
                string_index: self.u16()?,
            },
            9 => CPInfo::ConstantFieldRef {
                class_index: self.u16()?,
                name_and_type_index: self.u16()?,
            },
            10 => CPInfo::ConstantMethodRef {
                class_index: self.u16()?,
                name_and_type_index: self.u16()?,
            },
            11 => CPInfo::ConstantInterfaceMethodRef {
                class_index: self.u16()?,
                name_and_type_index: self.u16()?,
            },
            12 => CPInfo::ConstantNameAndType {
                name_index: self.u16()?,
                descriptor_index: self.u16()?,
            },
            15 => CPInfo::ConstantMethodHandle {
                reference_kind: self.u8()?,
                reference_index: self.u16()?,
            },
            16 => CPInfo::ConstantMethodType {
                descriptor_index: self.u16()?,
            },
            17 => CPInfo::ConstantDynamic {
                bootstrap_method_attr_index: self.u16()?,
                name_and_type_index: self.u16()?,
            },
            18 => CPInfo::ConstantInvokeDynamic {
                bootstrap_method_attr_index: self.u16()?,
                name_and_type_index: self.u16()?,
            },
            19 => CPInfo::ConstantModule {
                name_index: self.u16()?,
            },
            20 => CPInfo::ConstantPackage {
                name_index: self.u16()?,
            },
            _ => return Err(ParseError::UnknownTag { tag, index }),
        };
        Ok(entry)
    }

    fn members(&mut self) -> Result<Vec<MemberInfo>> {
        let count = self.u16()?;
        let mut members = Vec::with_capacity(count as usize);
        for _ in 0..count {
            members.push(MemberInfo {
                access_flags: self.u16()?,
                name_index: self.u16()?,
                descriptor_index: self.u16()?,
                attributes: self.attributes()?,
            });
        }
        Ok(members)
    }

    fn attributes(&mut self) -> Result<HashMap<String, AttributeInfo>> {
        let count = self.u16()?;
        let mut attributes = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let name_index = self.u16()?;
            let name = match self.constant_pool.get(name_index as usize) {
                Some(CPInfo::ConstantUtf8 { bytes }) => bytes.clone(),
                _ => return Err(ParseError::BadAttributeName(name_index)),
            };
            let length = self.u32()?;
            let attribute = match name.as_str() {
                "Code" => self.code_attribute()?,
                "ConstantValue" => AttributeInfo::ConstantValueAttribute {
                    constant_value_index: self.u16()?,
                },
                _ => {
                    let mut bytes = vec![0u8; length as usize];
                    self.cursor.read_exact(&mut bytes)?;
                    AttributeInfo::RawAttribute { bytes }
                }
            };
            attributes.insert(name, attribute);
        }
        Ok(attributes)
    }

    fn code_attribute(&mut self) -> Result<AttributeInfo> {
        let max_stack = self.u16()?;
        let max_locals = self.u16()?;
        let code_length = self.u32()?;
        let mut code = vec![0u8; code_length as usize];
        self.cursor.read_exact(&mut code)?;

        let exception_table_length = self.u16()?;
        let mut exception_table = Vec::with_capacity(exception_table_length as usize);
        for _ in 0..exception_table_length {
            exception_table.push(ExceptionEntry {
                start_pc: self.u16()?,
                end_pc: self.u16()?,
                handler_pc: self.u16()?,
                catch_type: self.u16()?,
            });
        }
        let attributes = self.attributes()?;
        Ok(AttributeInfo::CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.cursor.read_u8()?)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(self.cursor.read_u16::<BigEndian>()?)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(self.cursor.read_u32::<BigEndian>()?)
    }
}

/// Decode the "modified UTF-8" used by class files: NUL is encoded on two
/// bytes and supplementary characters as surrogate pairs of three bytes each.
fn decode_mutf8(bytes: &[u8]) -> Option<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b0 = bytes[i] as u16;
        match b0 {
            0x01..=0x7f => {
                units.push(b0);
                i += 1;
            }
            0xc0..=0xdf => {
                let b1 = continuation(bytes.get(i + 1))?;
                units.push(((b0 & 0x1f) << 6) | b1);
                i += 2;
            }
            0xe0..=0xef => {
                let b1 = continuation(bytes.get(i + 1))?;
                let b2 = continuation(bytes.get(i + 2))?;
                units.push(((b0 & 0x0f) << 12) | (b1 << 6) | b2);
                i += 3;
            }
            _ => return None,
        }
    }
    String::from_utf16(&units).ok()
}

fn continuation(byte: Option<&u8>) -> Option<u16> {
    match byte {
        Some(b) if b & 0xc0 == 0x80 => Some((b & 0x3f) as u16),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ClassBuilder;

    #[test]
    fn can_parse_class_file() {
        let mut builder = ClassBuilder::new("demo/Hello");
        builder.method("main", "([Ljava/lang/String;)V", 2, 1, &[0x10, 12, 0x57, 0xb1]);
        let bytes = builder.build();
        assert_eq!(MAGIC, u32::from_be_bytes(bytes[..4].try_into().unwrap()));

        let class_file = JVMParser::parse(&bytes).unwrap();
        assert_eq!(class_file.magic(), MAGIC);
        assert_eq!(class_file.version(), (52, 0));
        assert!(class_file.interfaces().is_empty());
        assert!(class_file.fields().is_empty());
        assert_eq!(class_file.methods().len(), 1);

        let method = &class_file.methods()[0];
        let pool = class_file.constant_pool();
        assert_eq!(
            pool[method.name_index() as usize],
            CPInfo::ConstantUtf8 {
                bytes: "main".to_string()
            }
        );
        match method.attributes().get("Code") {
            Some(AttributeInfo::CodeAttribute {
                max_stack,
                max_locals,
                code,
                exception_table,
                ..
            }) => {
                assert_eq!((*max_stack, *max_locals), (2, 1));
                assert_eq!(code, &vec![0x10, 12, 0x57, 0xb1]);
                assert!(exception_table.is_empty());
            }
            other => panic!("expected a Code attribute, got {other:?}"),
        }
    }

    #[test]
    fn wide_constants_take_two_slots() {
        let mut builder = ClassBuilder::new("demo/Wide");
        let long = builder.long(1 << 40);
        let after = builder.integer(7);
        assert_eq!(after, long + 2);

        let class_file = JVMParser::parse(&builder.build()).unwrap();
        let pool = class_file.constant_pool();
        assert_eq!(pool[long as usize], CPInfo::ConstantLong { bytes: 1 << 40 });
        assert_eq!(pool[long as usize + 1], CPInfo::Unusable);
        assert_eq!(pool[after as usize], CPInfo::ConstantInteger { bytes: 7 });
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = ClassBuilder::new("demo/Bad").build();
        bytes[0] = 0xde;
        match JVMParser::parse(&bytes) {
            Err(ParseError::InvalidMagic(magic)) => assert_eq!(magic, 0xdefe_babe),
            other => panic!("expected InvalidMagic, got {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = ClassBuilder::new("demo/Short").build();
        let err = JVMParser::parse(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, ParseError::Truncated(_)), "got {err}");
    }

    #[test]
    fn decodes_modified_utf8() {
        // Embedded NUL on two bytes.
        assert_eq!(decode_mutf8(&[0x61, 0xc0, 0x80, 0x62]).unwrap(), "a\0b");
        // U+00E9 and U+20AC.
        assert_eq!(
            decode_mutf8(&[0xc3, 0xa9, 0xe2, 0x82, 0xac]).unwrap(),
            "\u{e9}\u{20ac}"
        );
        // U+1F600 as a surrogate pair.
        assert_eq!(
            decode_mutf8(&[0xed, 0xa0, 0xbd, 0xed, 0xb8, 0x80]).unwrap(),
            "\u{1f600}"
        );
        // Raw NUL bytes and four-byte UTF-8 are not valid here.
        assert!(decode_mutf8(&[0x00]).is_none());
        assert!(decode_mutf8(&[0xf0, 0x9f, 0x98, 0x80]).is_none());
    }
}
