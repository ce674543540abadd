//! Structural analysis of compiled JVM class files.
//!
//! Coverage reconstruction needs three things from a class: its VM name and
//! declared source file (to group classes by the source they came from), its
//! line-number tables (to map instructions back to source lines), and its
//! branch points (to derive condition coverage). The bytecode itself is
//! walked only to find instruction boundaries and branches; it is never
//! executed or verified.
//!
//! The probe layout derived here mirrors the instrumenter's: methods in
//! declaration order, instructions in pc order, one `Line` probe at each
//! line-table entry and one `Branch` probe per conditional outcome. The
//! execution-data record for a class is matched by the CRC64 checksum of
//! the raw class bytes.

use std::sync::LazyLock;

use crate::error::{GroocovError, Result};

/// What a single probe in the class's probe vector observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Execution reached the instructions of a line-table entry.
    Line,
    /// One outcome of a conditional branch was taken.
    Branch,
}

/// One probe, attributed to a source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSite {
    pub line: u32,
    pub kind: ProbeKind,
}

/// The structure of one compiled class, reduced to what coverage needs.
#[derive(Debug, Clone)]
pub struct ClassStructure {
    /// VM-internal name, e.g. `"pkg/sub/Foo"`.
    pub vm_name: String,
    /// Value of the SourceFile attribute, if compiled with one.
    pub source_file: Option<String>,
    /// Probe layout in probe-index order.
    pub probes: Vec<ProbeSite>,
}

impl ClassStructure {
    /// Package part of the VM name (`""` for the default package).
    #[must_use]
    pub fn package(&self) -> &str {
        match self.vm_name.rfind('/') {
            Some(idx) => &self.vm_name[..idx],
            None => "",
        }
    }
}

/// CRC64 lookup table for the execution-data class id polynomial.
static CRC64_TABLE: LazyLock<[u64; 256]> = LazyLock::new(|| {
    const POLY64REV: u64 = 0xd800000000000000;
    let mut table = [0u64; 256];
    for (i, entry) in table.iter_mut().enumerate() {
        let mut value = i as u64;
        for _ in 0..8 {
            if value & 1 != 0 {
                value = (value >> 1) ^ POLY64REV;
            } else {
                value >>= 1;
            }
        }
        *entry = value;
    }
    table
});

/// Class id as recorded in execution data: CRC64 of the raw class bytes.
#[must_use]
pub fn class_id(bytes: &[u8]) -> u64 {
    let mut sum = 0u64;
    for &byte in bytes {
        sum = CRC64_TABLE[((sum ^ u64::from(byte)) & 0xFF) as usize] ^ (sum >> 8);
    }
    sum
}

/// Parse a class file into its coverage-relevant structure.
pub fn parse(bytes: &[u8]) -> Result<ClassStructure> {
    Parser::new(bytes).parse()
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

/// Constant-pool entries we need to resolve; everything else is skipped.
enum PoolEntry {
    Utf8(String),
    Class(u16),
    Other,
}

impl<'a> Parser<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn parse(mut self) -> Result<ClassStructure> {
        if self.u32()? != 0xCAFE_BABE {
            return Err(GroocovError::ClassFile("Bad class file magic".into()));
        }
        self.skip(4)?; // minor, major version

        let pool = self.constant_pool()?;

        self.skip(2)?; // access flags
        let this_class = self.u16()?;
        let vm_name = class_name(&pool, this_class)?;
        self.skip(2)?; // super class

        let interfaces = self.u16()? as usize;
        self.skip(interfaces * 2)?;

        // Fields carry no coverage information.
        let fields = self.u16()?;
        for _ in 0..fields {
            self.skip(6)?;
            self.skip_attributes()?;
        }

        let mut probes = Vec::new();
        let methods = self.u16()?;
        for _ in 0..methods {
            self.skip(6)?;
            self.method_attributes(&pool, &mut probes)?;
        }

        let mut source_file = None;
        let attr_count = self.u16()?;
        for _ in 0..attr_count {
            let name_idx = self.u16()?;
            let len = self.u32()? as usize;
            if utf8(&pool, name_idx)? == "SourceFile" {
                let idx = self.u16()?;
                source_file = Some(utf8(&pool, idx)?.to_string());
            } else {
                self.skip(len)?;
            }
        }

        Ok(ClassStructure {
            vm_name,
            source_file,
            probes,
        })
    }

    fn constant_pool(&mut self) -> Result<Vec<PoolEntry>> {
        let count = self.u16()? as usize;
        let mut pool = Vec::with_capacity(count);
        pool.push(PoolEntry::Other); // index 0 is unused
        while pool.len() < count {
            let tag = self.u8()?;
            match tag {
                1 => {
                    let len = self.u16()? as usize;
                    let raw = self.slice(len)?;
                    let text = String::from_utf8_lossy(raw).into_owned();
                    pool.push(PoolEntry::Utf8(text));
                }
                7 => {
                    let name_idx = self.u16()?;
                    pool.push(PoolEntry::Class(name_idx));
                }
                3 | 4 => {
                    self.skip(4)?;
                    pool.push(PoolEntry::Other);
                }
                5 | 6 => {
                    self.skip(8)?;
                    pool.push(PoolEntry::Other);
                    // 8-byte constants occupy two pool slots.
                    pool.push(PoolEntry::Other);
                }
                8 | 16 | 19 | 20 => {
                    self.skip(2)?;
                    pool.push(PoolEntry::Other);
                }
                9 | 10 | 11 | 12 | 17 | 18 => {
                    self.skip(4)?;
                    pool.push(PoolEntry::Other);
                }
                15 => {
                    self.skip(3)?;
                    pool.push(PoolEntry::Other);
                }
                other => {
                    return Err(GroocovError::ClassFile(format!(
                        "Unknown constant pool tag {}",
                        other
                    )));
                }
            }
        }
        Ok(pool)
    }

    fn skip_attributes(&mut self) -> Result<()> {
        let count = self.u16()?;
        for _ in 0..count {
            self.skip(2)?;
            let len = self.u32()? as usize;
            self.skip(len)?;
        }
        Ok(())
    }

    fn method_attributes(&mut self, pool: &[PoolEntry], probes: &mut Vec<ProbeSite>) -> Result<()> {
        let count = self.u16()?;
        for _ in 0..count {
            let name_idx = self.u16()?;
            let len = self.u32()? as usize;
            if utf8(pool, name_idx)? == "Code" {
                let end = self
                    .pos
                    .checked_add(len)
                    .ok_or_else(|| truncated())?;
                self.code_attribute(pool, probes)?;
                if self.pos > end || end > self.bytes.len() {
                    return Err(GroocovError::ClassFile("Bad Code attribute length".into()));
                }
                self.pos = end;
            } else {
                self.skip(len)?;
            }
        }
        Ok(())
    }

    fn code_attribute(&mut self, pool: &[PoolEntry], probes: &mut Vec<ProbeSite>) -> Result<()> {
        self.skip(4)?; // max_stack, max_locals
        let code_len = self.u32()? as usize;
        let code = self.slice(code_len)?.to_vec();

        let exceptions = self.u16()? as usize;
        self.skip(exceptions * 8)?;

        let mut line_table: Vec<(u16, u16)> = Vec::new();
        let attr_count = self.u16()?;
        for _ in 0..attr_count {
            let name_idx = self.u16()?;
            let len = self.u32()? as usize;
            if utf8(pool, name_idx)? == "LineNumberTable" {
                let entries = self.u16()?;
                for _ in 0..entries {
                    let start_pc = self.u16()?;
                    let line = self.u16()?;
                    line_table.push((start_pc, line));
                }
            } else {
                self.skip(len)?;
            }
        }

        // Methods without debug line information contribute no probes.
        if !line_table.is_empty() {
            method_probes(&code, &line_table, probes)?;
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        let b = *self.bytes.get(self.pos).ok_or_else(truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16> {
        let raw = self.slice(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self.slice(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or_else(truncated)?;
        let raw = self.bytes.get(self.pos..end).ok_or_else(truncated)?;
        self.pos = end;
        Ok(raw)
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        self.slice(len)?;
        Ok(())
    }
}

fn truncated() -> GroocovError {
    GroocovError::ClassFile("Truncated class file".into())
}

fn utf8(pool: &[PoolEntry], index: u16) -> Result<&str> {
    match pool.get(index as usize) {
        Some(PoolEntry::Utf8(s)) => Ok(s),
        _ => Err(GroocovError::ClassFile(format!(
            "Constant pool index {} is not a Utf8 entry",
            index
        ))),
    }
}

fn class_name(pool: &[PoolEntry], index: u16) -> Result<String> {
    match pool.get(index as usize) {
        Some(PoolEntry::Class(name_idx)) => Ok(utf8(pool, *name_idx)?.to_string()),
        _ => Err(GroocovError::ClassFile(format!(
            "Constant pool index {} is not a Class entry",
            index
        ))),
    }
}

/// Walk one method's bytecode in pc order, emitting probe sites: a `Line`
/// probe where each line-table entry starts, then `Branch` probes for each
/// conditional instruction, attributed to the line active at that pc.
fn method_probes(
    code: &[u8],
    line_table: &[(u16, u16)],
    probes: &mut Vec<ProbeSite>,
) -> Result<()> {
    let mut table: Vec<(u16, u16)> = line_table.to_vec();
    table.sort_by_key(|&(pc, _)| pc);
    let mut next_entry = 0usize;

    let mut current_line: Option<u32> = None;
    let mut pc = 0usize;
    while pc < code.len() {
        while next_entry < table.len() && usize::from(table[next_entry].0) <= pc {
            let line = u32::from(table[next_entry].1);
            probes.push(ProbeSite {
                line,
                kind: ProbeKind::Line,
            });
            current_line = Some(line);
            next_entry += 1;
        }

        let opcode = code[pc];
        let outcomes = branch_outcomes(code, pc, opcode)?;
        if outcomes > 0 {
            if let Some(line) = current_line {
                for _ in 0..outcomes {
                    probes.push(ProbeSite {
                        line,
                        kind: ProbeKind::Branch,
                    });
                }
            }
        }

        pc += instruction_len(code, pc, opcode)?;
    }
    Ok(())
}

/// Number of conditional outcomes for the instruction at `pc`, zero for
/// non-branch instructions. Unconditional jumps are not conditions.
fn branch_outcomes(code: &[u8], pc: usize, opcode: u8) -> Result<u32> {
    match opcode {
        // ifeq..if_acmpne, ifnull, ifnonnull: two-way conditionals
        0x99..=0xA6 | 0xC6 | 0xC7 => Ok(2),
        // tableswitch: one outcome per table slot plus default
        0xAA => {
            let (low, high, _) = read_tableswitch(code, pc)?;
            let slots = i64::from(high) - i64::from(low) + 1;
            Ok(slots as u32 + 1)
        }
        // lookupswitch: one outcome per pair plus default
        0xAB => {
            let (npairs, _) = read_lookupswitch(code, pc)?;
            Ok(npairs + 1)
        }
        _ => Ok(0),
    }
}

/// Total size in bytes of the instruction at `pc`, opcode included.
fn instruction_len(code: &[u8], pc: usize, opcode: u8) -> Result<usize> {
    let len = match opcode {
        0x00..=0x0F => 1,
        0x10 => 2, // bipush
        0x11 => 3, // sipush
        0x12 => 2, // ldc
        0x13 | 0x14 => 3, // ldc_w, ldc2_w
        0x15..=0x19 => 2, // iload..aload
        0x1A..=0x35 => 1,
        0x36..=0x3A => 2, // istore..astore
        0x3B..=0x83 => 1,
        0x84 => 3, // iinc
        0x85..=0x98 => 1,
        0x99..=0xA8 => 3, // ifeq..jsr
        0xA9 => 2,        // ret
        0xAA => {
            let (low, high, operands) = read_tableswitch(code, pc)?;
            let slots = (i64::from(high) - i64::from(low) + 1) as usize;
            1 + operands + slots * 4
        }
        0xAB => {
            let (npairs, operands) = read_lookupswitch(code, pc)?;
            1 + operands + npairs as usize * 8
        }
        0xAC..=0xB1 => 1, // returns
        0xB2..=0xB8 => 3, // field/method access
        0xB9 | 0xBA => 5, // invokeinterface, invokedynamic
        0xBB => 3,        // new
        0xBC => 2,        // newarray
        0xBD => 3,        // anewarray
        0xBE | 0xBF => 1, // arraylength, athrow
        0xC0 | 0xC1 => 3, // checkcast, instanceof
        0xC2 | 0xC3 => 1, // monitorenter, monitorexit
        0xC4 => {
            // wide: modified opcode follows; iinc takes an extra operand pair
            match code.get(pc + 1) {
                Some(&0x84) => 6,
                Some(_) => 4,
                None => return Err(truncated_code(pc)),
            }
        }
        0xC5 => 4,        // multianewarray
        0xC8 | 0xC9 => 5, // goto_w, jsr_w
        other => {
            return Err(GroocovError::ClassFile(format!(
                "Unknown opcode {:#04x} at pc {}",
                other, pc
            )));
        }
    };
    Ok(len)
}

/// (low, high, operand bytes after the opcode excluding jump table).
fn read_tableswitch(code: &[u8], pc: usize) -> Result<(i32, i32, usize)> {
    let pad = switch_padding(pc);
    let base = pc + 1 + pad;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    if high < low {
        return Err(GroocovError::ClassFile(format!(
            "Bad tableswitch bounds at pc {}",
            pc
        )));
    }
    Ok((low, high, pad + 12))
}

/// (npairs, operand bytes after the opcode excluding match pairs).
fn read_lookupswitch(code: &[u8], pc: usize) -> Result<(u32, usize)> {
    let pad = switch_padding(pc);
    let base = pc + 1 + pad;
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        return Err(GroocovError::ClassFile(format!(
            "Bad lookupswitch pair count at pc {}",
            pc
        )));
    }
    Ok((npairs as u32, pad + 8))
}

/// Switch operands are padded so the default offset is 4-byte aligned
/// relative to the start of the code array.
fn switch_padding(pc: usize) -> usize {
    (4 - ((pc + 1) % 4)) % 4
}

fn read_i32(code: &[u8], at: usize) -> Result<i32> {
    let raw = code
        .get(at..at + 4)
        .ok_or_else(|| truncated_code(at))?;
    Ok(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn truncated_code(pc: usize) -> GroocovError {
    GroocovError::ClassFile(format!("Truncated bytecode at pc {}", pc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_id_is_deterministic_and_content_sensitive() {
        let a = class_id(b"\xCA\xFE\xBA\xBEabc");
        let b = class_id(b"\xCA\xFE\xBA\xBEabc");
        let c = class_id(b"\xCA\xFE\xBA\xBEabd");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(class_id(b""), 0);
    }

    #[test]
    fn test_package_split() {
        let class = ClassStructure {
            vm_name: "pkg/sub/Foo".into(),
            source_file: None,
            probes: Vec::new(),
        };
        assert_eq!(class.package(), "pkg/sub");

        let class = ClassStructure {
            vm_name: "Foo".into(),
            source_file: None,
            probes: Vec::new(),
        };
        assert_eq!(class.package(), "");
    }

    #[test]
    fn test_not_a_class_file() {
        assert!(matches!(
            parse(b"MZ not a class"),
            Err(GroocovError::ClassFile(_))
        ));
        assert!(matches!(parse(b"\xCA\xFE"), Err(GroocovError::ClassFile(_))));
    }

    #[test]
    fn test_instruction_lengths() {
        // nop
        assert_eq!(instruction_len(&[0x00], 0, 0x00).unwrap(), 1);
        // bipush 5
        assert_eq!(instruction_len(&[0x10, 0x05], 0, 0x10).unwrap(), 2);
        // sipush
        assert_eq!(instruction_len(&[0x11, 0, 0], 0, 0x11).unwrap(), 3);
        // ifeq
        assert_eq!(instruction_len(&[0x99, 0, 4], 0, 0x99).unwrap(), 3);
        // invokeinterface
        assert_eq!(
            instruction_len(&[0xB9, 0, 1, 2, 0], 0, 0xB9).unwrap(),
            5
        );
        // wide iinc
        assert_eq!(
            instruction_len(&[0xC4, 0x84, 0, 1, 0, 2], 0, 0xC4).unwrap(),
            6
        );
        // wide iload
        assert_eq!(instruction_len(&[0xC4, 0x15, 0, 1], 0, 0xC4).unwrap(), 4);
    }

    #[test]
    fn test_tableswitch_length_and_outcomes() {
        // tableswitch at pc 0: 3 padding bytes, default, low=1, high=3,
        // then 3 offsets.
        let mut code = vec![0xAA, 0, 0, 0];
        code.extend_from_slice(&0i32.to_be_bytes()); // default
        code.extend_from_slice(&1i32.to_be_bytes()); // low
        code.extend_from_slice(&3i32.to_be_bytes()); // high
        code.extend_from_slice(&[0; 12]); // 3 offsets

        assert_eq!(instruction_len(&code, 0, 0xAA).unwrap(), code.len());
        assert_eq!(branch_outcomes(&code, 0, 0xAA).unwrap(), 4);
    }

    #[test]
    fn test_lookupswitch_length_and_outcomes() {
        let mut code = vec![0xAB, 0, 0, 0];
        code.extend_from_slice(&0i32.to_be_bytes()); // default
        code.extend_from_slice(&2i32.to_be_bytes()); // npairs
        code.extend_from_slice(&[0; 16]); // 2 match/offset pairs

        assert_eq!(instruction_len(&code, 0, 0xAB).unwrap(), code.len());
        assert_eq!(branch_outcomes(&code, 0, 0xAB).unwrap(), 3);
    }

    #[test]
    fn test_method_probes_layout() {
        // Line 1 starts at pc 0, line 2 at pc 1 with a two-way branch,
        // line 3 at pc 4.
        let code = vec![
            0x03, // iconst_0          (pc 0, line 1)
            0x99, 0x00, 0x03, // ifeq  (pc 1, line 2)
            0xB1, // return            (pc 4, line 3)
        ];
        let table = vec![(0u16, 1u16), (1, 2), (4, 3)];
        let mut probes = Vec::new();
        method_probes(&code, &table, &mut probes).unwrap();

        assert_eq!(
            probes,
            vec![
                ProbeSite { line: 1, kind: ProbeKind::Line },
                ProbeSite { line: 2, kind: ProbeKind::Line },
                ProbeSite { line: 2, kind: ProbeKind::Branch },
                ProbeSite { line: 2, kind: ProbeKind::Branch },
                ProbeSite { line: 3, kind: ProbeKind::Line },
            ]
        );
    }
}
