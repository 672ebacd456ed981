//! JVM bytecode model: opcodes, decoded instructions and the decoder that
//! turns a method's raw `code` array into discrete instructions.
use byteorder::{BigEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;

/// Errors raised while splitting a code array into instructions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Instruction operands run past the end of the code array.
    #[error("truncated instruction at offset {0}")]
    Truncated(usize),
    /// A branch at `offset` targets a byte offset that is not the start
    /// of an instruction.
    #[error("branch at offset {offset} targets invalid offset {target}")]
    InvalidBranchTarget { offset: usize, target: i64 },
}

/// Supported JVM opcodes. Anything else decodes to `Unknown` and is
/// rejected by the runtime when executed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OPCode {
    Nop,
    AconstNull,
    IconstM1,
    Iconst0,
    Iconst1,
    Iconst2,
    Iconst3,
    Iconst4,
    Iconst5,
    BiPush,
    SiPush,
    Ldc,
    LdcW,
    ILoad,
    ALoad,
    ILoad0,
    ILoad1,
    ILoad2,
    ILoad3,
    ALoad0,
    ALoad1,
    ALoad2,
    ALoad3,
    IStore,
    AStore,
    IStore0,
    IStore1,
    IStore2,
    IStore3,
    AStore0,
    AStore1,
    AStore2,
    AStore3,
    Pop,
    Dup,
    Swap,
    IAdd,
    ISub,
    IMul,
    IDiv,
    IRem,
    INeg,
    IInc,
    IfEq,
    IfNe,
    IfLt,
    IfGe,
    IfGt,
    IfLe,
    IfICmpEq,
    IfICmpNe,
    IfICmpLt,
    IfICmpGe,
    IfICmpGt,
    IfICmpLe,
    Goto,
    IReturn,
    AReturn,
    Return,
    GetStatic,
    InvokeVirtual,
    InvokeStatic,
    IfNull,
    IfNonNull,
    Unknown(u8),
}

impl From<u8> for OPCode {
    fn from(byte: u8) -> Self {
        match byte {
            0x00 => OPCode::Nop,
            0x01 => OPCode::AconstNull,
            0x02 => OPCode::IconstM1,
            0x03 => OPCode::Iconst0,
            0x04 => OPCode::Iconst1,
            0x05 => OPCode::Iconst2,
            0x06 => OPCode::Iconst3,
            0x07 => OPCode::Iconst4,
            0x08 => OPCode::Iconst5,
            0x10 => OPCode::BiPush,
            0x11 => OPCode::SiPush,
            0x12 => OPCode::Ldc,
            0x13 => OPCode::LdcW,
            0x15 => OPCode::ILoad,
            0x19 => OPCode::ALoad,
            0x1a => OPCode::ILoad0,
            0x1b => OPCode::ILoad1,
            0x1c => OPCode::ILoad2,
            0x1d => OPCode::ILoad3,
            0x2a => OPCode::ALoad0,
            0x2b => OPCode::ALoad1,
            0x2c => OPCode::ALoad2,
            0x2d => OPCode::ALoad3,
            0x36 => OPCode::IStore,
            0x3a => OPCode::AStore,
            0x3b => OPCode::IStore0,
            0x3c => OPCode::IStore1,
            0x3d => OPCode::IStore2,
            0x3e => OPCode::IStore3,
            0x4b => OPCode::AStore0,
            0x4c => OPCode::AStore1,
            0x4d => OPCode::AStore2,
            0x4e => OPCode::AStore3,
            0x57 => OPCode::Pop,
            0x59 => OPCode::Dup,
            0x5f => OPCode::Swap,
            0x60 => OPCode::IAdd,
            0x64 => OPCode::ISub,
            0x68 => OPCode::IMul,
            0x6c => OPCode::IDiv,
            0x70 => OPCode::IRem,
            0x74 => OPCode::INeg,
            0x84 => OPCode::IInc,
            0x99 => OPCode::IfEq,
            0x9a => OPCode::IfNe,
            0x9b => OPCode::IfLt,
            0x9c => OPCode::IfGe,
            0x9d => OPCode::IfGt,
            0x9e => OPCode::IfLe,
            0x9f => OPCode::IfICmpEq,
            0xa0 => OPCode::IfICmpNe,
            0xa1 => OPCode::IfICmpLt,
            0xa2 => OPCode::IfICmpGe,
            0xa3 => OPCode::IfICmpGt,
            0xa4 => OPCode::IfICmpLe,
            0xa7 => OPCode::Goto,
            0xac => OPCode::IReturn,
            0xb0 => OPCode::AReturn,
            0xb1 => OPCode::Return,
            0xb2 => OPCode::GetStatic,
            0xb6 => OPCode::InvokeVirtual,
            0xb8 => OPCode::InvokeStatic,
            0xc6 => OPCode::IfNull,
            0xc7 => OPCode::IfNonNull,
            other => OPCode::Unknown(other),
        }
    }
}

impl fmt::Display for OPCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OPCode::Unknown(byte) => write!(f, "opcode {byte:#04x}"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}

/// Decoded instruction operand. Implicit operands (`iconst_3`,
/// `iload_1`...) are materialized so handlers never look at the mnemonic
/// to find them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operand {
    None,
    Int(i32),
    /// Constant pool index.
    Index(u16),
    /// Local variable slot.
    Local(u16),
    Increment { index: u16, delta: i32 },
    /// Branch target as an index into the method's instruction vector.
    Branch(usize),
}

/// Instructions are composed of an opcode and an optional operand, plus
/// the byte offset they were decoded from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Instruction {
    mnemonic: OPCode,
    operand: Operand,
    offset: usize,
}

impl Instruction {
    pub fn get_mnemonic(&self) -> OPCode {
        self.mnemonic
    }

    pub fn operand(&self) -> Operand {
        self.operand
    }

    /// Byte offset of the instruction in the original code array.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

const WIDE: u8 = 0xc4;
const TABLESWITCH: u8 = 0xaa;
const LOOKUPSWITCH: u8 = 0xab;

/// Decode a method's code array into instructions.
///
/// Branch operands are rewritten from relative byte offsets to indices in
/// the returned vector. Decoding stops after the first byte that is not a
/// defined JVM opcode, since its length is unknown; that byte is kept as
/// the last instruction so executing it fails at the right place.
pub fn decode(code: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
    let mut instructions: Vec<Instruction> = Vec::new();
    // (instruction index, raw relative offset)
    let mut branches: Vec<(usize, i64)> = Vec::new();
    let mut cursor = Cursor::new(code);

    while (cursor.position() as usize) < code.len() {
        let offset = cursor.position() as usize;
        let truncated = |_| DecodeError::Truncated(offset);
        let byte = cursor.read_u8().map_err(truncated)?;
        let mut mnemonic = OPCode::from(byte);
        let operand = match byte {
            0x01 => Operand::None,
            0x02..=0x08 => Operand::Int(byte as i32 - 0x03),
            0x10 => Operand::Int(cursor.read_i8().map_err(truncated)? as i32),
            0x11 => Operand::Int(cursor.read_i16::<BigEndian>().map_err(truncated)? as i32),
            0x12 => Operand::Index(cursor.read_u8().map_err(truncated)? as u16),
            0x13 => Operand::Index(cursor.read_u16::<BigEndian>().map_err(truncated)?),
            0x15 | 0x19 | 0x36 | 0x3a => {
                Operand::Local(cursor.read_u8().map_err(truncated)? as u16)
            }
            0x1a..=0x1d => Operand::Local((byte - 0x1a) as u16),
            0x2a..=0x2d => Operand::Local((byte - 0x2a) as u16),
            0x3b..=0x3e => Operand::Local((byte - 0x3b) as u16),
            0x4b..=0x4e => Operand::Local((byte - 0x4b) as u16),
            0x84 => Operand::Increment {
                index: cursor.read_u8().map_err(truncated)? as u16,
                delta: cursor.read_i8().map_err(truncated)? as i32,
            },
            0x99..=0xa4 | 0xa7 | 0xc6 | 0xc7 => {
                let relative = cursor.read_i16::<BigEndian>().map_err(truncated)?;
                branches.push((instructions.len(), relative as i64));
                Operand::None
            }
            0xb2 | 0xb6 | 0xb8 => {
                Operand::Index(cursor.read_u16::<BigEndian>().map_err(truncated)?)
            }
            WIDE => {
                let inner = cursor.read_u8().map_err(truncated)?;
                let index = cursor.read_u16::<BigEndian>().map_err(truncated)?;
                mnemonic = OPCode::from(inner);
                match inner {
                    0x84 => Operand::Increment {
                        index,
                        delta: cursor.read_i16::<BigEndian>().map_err(truncated)? as i32,
                    },
                    0x15 | 0x19 | 0x36 | 0x3a => Operand::Local(index),
                    _ => {
                        // Wide forms of unsupported loads and stores.
                        mnemonic = OPCode::Unknown(inner);
                        Operand::None
                    }
                }
            }
            _ => match skip_operands(byte, offset, &mut cursor)? {
                true => Operand::None,
                false => {
                    instructions.push(Instruction {
                        mnemonic,
                        operand: Operand::None,
                        offset,
                    });
                    break;
                }
            },
        };
        instructions.push(Instruction {
            mnemonic,
            operand,
            offset,
        });
    }

    for (index, relative) in branches {
        let offset = instructions[index].offset;
        let target = offset as i64 + relative;
        let resolved = instructions
            .binary_search_by_key(&target, |inst| inst.offset as i64)
            .map_err(|_| DecodeError::InvalidBranchTarget { offset, target })?;
        instructions[index].operand = Operand::Branch(resolved);
    }
    Ok(instructions)
}

/// Skip the operands of an opcode that has no decoded operand. Returns
/// false when `byte` is not a defined opcode at all.
fn skip_operands(
    byte: u8,
    offset: usize,
    cursor: &mut Cursor<&[u8]>,
) -> Result<bool, DecodeError> {
    let operand_bytes: u64 = match byte {
        0x00..=0x0f
        | 0x1a..=0x35
        | 0x3b..=0x83
        | 0x85..=0x98
        | 0xac..=0xb1
        | 0xbe
        | 0xbf
        | 0xc2
        | 0xc3 => 0,
        0x10 | 0x12 | 0x15..=0x19 | 0x36..=0x3a | 0xa9 | 0xbc => 1,
        0x11 | 0x13 | 0x14 | 0x84 | 0x99..=0xa8 | 0xb2..=0xb8 | 0xbb | 0xbd | 0xc0 | 0xc1
        | 0xc6 | 0xc7 => 2,
        0xc5 => 3,
        0xb9 | 0xba | 0xc8 | 0xc9 => 4,
        TABLESWITCH | LOOKUPSWITCH => {
            let truncated = |_| DecodeError::Truncated(offset);
            let padding = (4 - (offset + 1) % 4) % 4;
            cursor.set_position(cursor.position() + padding as u64);
            let _default = cursor.read_i32::<BigEndian>().map_err(truncated)?;
            if byte == TABLESWITCH {
                let low = cursor.read_i32::<BigEndian>().map_err(truncated)? as i64;
                let high = cursor.read_i32::<BigEndian>().map_err(truncated)? as i64;
                ((high - low + 1).max(0) * 4) as u64
            } else {
                let pairs = cursor.read_i32::<BigEndian>().map_err(truncated)? as i64;
                (pairs.max(0) * 8) as u64
            }
        }
        _ => return Ok(false),
    };
    let end = cursor.position() + operand_bytes;
    if end > cursor.get_ref().len() as u64 {
        return Err(DecodeError::Truncated(offset));
    }
    cursor.set_position(end);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rustfmt::skip]
    #[test]
    fn decodes_implicit_and_explicit_operands() {
        // iconst_m1, bipush -5, sipush 300, iload_2, istore 7, iinc 1 -1, return
        let code = [
            0x02, 0x10, 0xfb, 0x11, 0x01, 0x2c, 0x1c, 0x36, 0x07, 0x84, 0x01, 0xff, 0xb1,
        ];
        let instructions = decode(&code).unwrap();
        let decoded: Vec<(OPCode, Operand)> = instructions
            .iter()
            .map(|inst| (inst.get_mnemonic(), inst.operand()))
            .collect();
        assert_eq!(
            decoded,
            vec![
                (OPCode::IconstM1, Operand::Int(-1)),
                (OPCode::BiPush, Operand::Int(-5)),
                (OPCode::SiPush, Operand::Int(300)),
                (OPCode::ILoad2, Operand::Local(2)),
                (OPCode::IStore, Operand::Local(7)),
                (OPCode::IInc, Operand::Increment { index: 1, delta: -1 }),
                (OPCode::Return, Operand::None),
            ]
        );
        assert_eq!(instructions[2].offset(), 3);
    }

    #[test]
    fn branches_target_instruction_indices() {
        // 0: iconst_0, 1: ifeq +5 -> 6, 4: iconst_1, 5: ireturn... target 6: goto -6 -> 0
        let code = [0x03, 0x99, 0x00, 0x05, 0x04, 0xac, 0xa7, 0xff, 0xfa];
        let instructions = decode(&code).unwrap();
        assert_eq!(instructions[1].get_mnemonic(), OPCode::IfEq);
        assert_eq!(instructions[1].operand(), Operand::Branch(4));
        assert_eq!(instructions[4].get_mnemonic(), OPCode::Goto);
        assert_eq!(instructions[4].operand(), Operand::Branch(0));
    }

    #[test]
    fn rejects_branch_into_the_middle_of_an_instruction() {
        // goto +1 lands inside its own operand bytes.
        let err = decode(&[0xa7, 0x00, 0x01, 0xb1]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::InvalidBranchTarget {
                offset: 0,
                target: 1
            }
        );
    }

    #[test]
    fn reports_truncated_operands() {
        assert_eq!(decode(&[0xb1, 0x11, 0x00]), Err(DecodeError::Truncated(1)));
    }

    #[test]
    fn unsupported_opcodes_keep_their_length() {
        // new #2, dup, return
        let instructions = decode(&[0xbb, 0x00, 0x02, 0x59, 0xb1]).unwrap();
        assert_eq!(instructions.len(), 3);
        assert_eq!(instructions[0].get_mnemonic(), OPCode::Unknown(0xbb));
        assert_eq!(instructions[1].get_mnemonic(), OPCode::Dup);
    }

    #[test]
    fn skips_switch_padding() {
        // nop, tableswitch (pad 2) default=0 low=0 high=1 + 2 offsets, return
        let mut code = vec![0x00, 0xaa, 0x00, 0x00];
        for word in [0i32, 0, 1, 0, 0] {
            code.extend_from_slice(&word.to_be_bytes());
        }
        code.push(0xb1);
        let instructions = decode(&code).unwrap();
        assert_eq!(instructions.len(), 3);
        assert_eq!(instructions[2].get_mnemonic(), OPCode::Return);
        assert_eq!(instructions[2].offset(), code.len() - 1);
    }

    #[test]
    fn stops_at_undefined_opcode() {
        let instructions = decode(&[0x04, 0xfe, 0x00, 0xb1]).unwrap();
        assert_eq!(instructions.len(), 2);
        assert_eq!(instructions[1].get_mnemonic(), OPCode::Unknown(0xfe));
    }

    #[test]
    fn wide_loads_use_sixteen_bit_indices() {
        let instructions = decode(&[0xc4, 0x15, 0x01, 0x00, 0xc4, 0x84, 0x00, 0x02, 0x01, 0x00])
            .unwrap();
        assert_eq!(instructions[0].get_mnemonic(), OPCode::ILoad);
        assert_eq!(instructions[0].operand(), Operand::Local(256));
        assert_eq!(
            instructions[1].operand(),
            Operand::Increment {
                index: 2,
                delta: 256
            }
        );
    }

    #[test]
    fn displays_mnemonics() {
        assert_eq!(OPCode::InvokeStatic.to_string(), "invokestatic");
        assert_eq!(OPCode::Unknown(0xbb).to_string(), "opcode 0xbb");
    }
}
