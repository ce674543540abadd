//! Reader for the JaCoCo binary execution-data format (`.exec` files).
//!
//! The stream is a sequence of big-endian blocks:
//!   0x01  file header: magic 0xC0C0, format version
//!   0x10  session info: UTF-8 id, start millis, dump millis
//!   0x11  execution data: class id (CRC64), UTF-8 VM class name,
//!         probe bit vector (varint count, bits packed LSB-first)
//!
//! This crate is a consumer of the format only; the instrumentation runtime
//! that produces it is external.

use std::io::{ErrorKind, Read};

use fixedbitset::FixedBitSet;
use log::debug;
use std::collections::HashMap;

use crate::error::{GroocovError, Result};

const BLOCK_HEADER: u8 = 0x01;
const BLOCK_SESSION_INFO: u8 = 0x10;
const BLOCK_EXECUTION_DATA: u8 = 0x11;

const MAGIC: u16 = 0xC0C0;
const FORMAT_VERSION: u16 = 0x1007;

/// Probe hits recorded for one compiled class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionData {
    pub name: String,
    pub probes: FixedBitSet,
}

impl ExecutionData {
    #[must_use]
    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }
}

/// Merged execution data across all recorded sessions, keyed by class id.
/// A probe counts as hit if any session hit it.
#[derive(Debug, Default)]
pub struct ExecutionDataStore {
    classes: HashMap<u64, ExecutionData>,
    sessions: usize,
}

impl ExecutionDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// OR-merge one execution-data record into the store. Records for the
    /// same class id must agree on the probe count.
    pub fn visit(&mut self, id: u64, name: &str, probes: FixedBitSet) -> Result<()> {
        match self.classes.get_mut(&id) {
            Some(existing) => {
                if existing.probes.len() != probes.len() {
                    return Err(GroocovError::ExecData(format!(
                        "Incompatible execution data for class {}: {} probes vs {}",
                        name,
                        probes.len(),
                        existing.probes.len(),
                    )));
                }
                existing.probes.union_with(&probes);
            }
            None => {
                self.classes.insert(
                    id,
                    ExecutionData {
                        name: name.to_string(),
                        probes,
                    },
                );
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: u64) -> Option<&ExecutionData> {
        self.classes.get(&id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    #[must_use]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Number of session-info blocks seen while reading.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions
    }
}

/// Read a complete execution-data stream into the store.
pub fn read(input: &mut impl Read, store: &mut ExecutionDataStore) -> Result<()> {
    let mut first = true;
    loop {
        let block_type = match read_u8(input) {
            Ok(b) => b,
            // Clean EOF between blocks ends the stream.
            Err(GroocovError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        if first && block_type != BLOCK_HEADER {
            return Err(GroocovError::ExecData(
                "Invalid execution data file: missing header".into(),
            ));
        }
        first = false;

        match block_type {
            BLOCK_HEADER => read_header(input)?,
            BLOCK_SESSION_INFO => {
                let id = read_utf(input)?;
                let _start = read_u64(input)?;
                let _dump = read_u64(input)?;
                debug!("Execution data session: {}", id);
                store.sessions += 1;
            }
            BLOCK_EXECUTION_DATA => {
                let id = read_u64(input)?;
                let name = read_utf(input)?;
                let probes = read_probes(input)?;
                store.visit(id, &name, probes)?;
            }
            other => {
                return Err(GroocovError::ExecData(format!(
                    "Unknown block type {:#04x}",
                    other
                )));
            }
        }
    }
    Ok(())
}

fn read_header(input: &mut impl Read) -> Result<()> {
    let magic = read_u16(input)?;
    if magic != MAGIC {
        return Err(GroocovError::ExecData(format!(
            "Invalid execution data file: bad magic {:#06x}",
            magic
        )));
    }
    let version = read_u16(input)?;
    if version != FORMAT_VERSION {
        return Err(GroocovError::ExecData(format!(
            "Unsupported execution data version {:#06x}",
            version
        )));
    }
    Ok(())
}

fn read_probes(input: &mut impl Read) -> Result<FixedBitSet> {
    let count = read_var_int(input)?;
    let mut probes = FixedBitSet::with_capacity(count);
    let mut buffer = 0u8;
    for i in 0..count {
        if i % 8 == 0 {
            buffer = read_u8(input)?;
        }
        if buffer & 0x01 != 0 {
            probes.insert(i);
        }
        buffer >>= 1;
    }
    Ok(probes)
}

/// Variable-length non-negative int: 7 bits per byte, LSB group first, high
/// bit marks continuation.
fn read_var_int(input: &mut impl Read) -> Result<usize> {
    let mut value = 0usize;
    let mut shift = 0u32;
    loop {
        let byte = read_u8(input)?;
        value |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 28 {
            return Err(GroocovError::ExecData("Malformed varint".into()));
        }
    }
}

/// Length-prefixed modified-UTF8 string, as written by DataOutputStream.
fn read_utf(input: &mut impl Read) -> Result<String> {
    let len = read_u16(input)? as usize;
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| GroocovError::ExecData("Invalid UTF-8 in class name".into()))
}

fn read_u8(input: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    input.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16(input: &mut impl Read) -> Result<u16> {
    let mut buf = [0u8; 2];
    input.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u64(input: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits(values: &[bool]) -> FixedBitSet {
        let mut set = FixedBitSet::with_capacity(values.len());
        for (i, &v) in values.iter().enumerate() {
            if v {
                set.insert(i);
            }
        }
        set
    }

    /// Minimal writer mirroring the wire format, for test input only.
    pub(crate) fn write_exec(records: &[(u64, &str, &[bool])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(BLOCK_HEADER);
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());

        out.push(BLOCK_SESSION_INFO);
        out.extend_from_slice(&(4u16).to_be_bytes());
        out.extend_from_slice(b"test");
        out.extend_from_slice(&0u64.to_be_bytes());
        out.extend_from_slice(&0u64.to_be_bytes());

        for &(id, name, probes) in records {
            out.push(BLOCK_EXECUTION_DATA);
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&(name.len() as u16).to_be_bytes());
            out.extend_from_slice(name.as_bytes());
            write_var_int(&mut out, probes.len());
            let mut buffer = 0u8;
            for (i, &hit) in probes.iter().enumerate() {
                if hit {
                    buffer |= 1 << (i % 8);
                }
                if i % 8 == 7 {
                    out.push(buffer);
                    buffer = 0;
                }
            }
            if !probes.is_empty() && probes.len() % 8 != 0 {
                out.push(buffer);
            }
        }
        out
    }

    fn write_var_int(out: &mut Vec<u8>, mut value: usize) {
        loop {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    #[test]
    fn test_read_single_record() {
        let data = write_exec(&[(42, "pkg/Foo", &[true, false, true])]);
        let mut store = ExecutionDataStore::new();
        read(&mut data.as_slice(), &mut store).unwrap();

        assert_eq!(store.class_count(), 1);
        assert_eq!(store.session_count(), 1);
        let exec = store.get(42).unwrap();
        assert_eq!(exec.name, "pkg/Foo");
        assert_eq!(exec.probes, bits(&[true, false, true]));
    }

    #[test]
    fn test_merge_is_or_commutative_idempotent() {
        let a = bits(&[true, false, false, true]);
        let b = bits(&[false, true, false, true]);
        let expected = bits(&[true, true, false, true]);

        let mut ab = ExecutionDataStore::new();
        ab.visit(1, "C", a.clone()).unwrap();
        ab.visit(1, "C", b.clone()).unwrap();
        assert_eq!(ab.get(1).unwrap().probes, expected);

        let mut ba = ExecutionDataStore::new();
        ba.visit(1, "C", b).unwrap();
        ba.visit(1, "C", a.clone()).unwrap();
        assert_eq!(ba.get(1).unwrap().probes, expected);

        // merge(merge(a, b), a) == merge(a, b)
        ab.visit(1, "C", a).unwrap();
        assert_eq!(ab.get(1).unwrap().probes, expected);
    }

    #[test]
    fn test_probe_count_mismatch_rejected() {
        let mut store = ExecutionDataStore::new();
        store.visit(1, "C", bits(&[true, false])).unwrap();
        let err = store.visit(1, "C", bits(&[true, false, true]));
        assert!(matches!(err, Err(GroocovError::ExecData(_))));
    }

    #[test]
    fn test_sessions_merge_across_stream() {
        let data = write_exec(&[
            (9, "pkg/Bar", &[true, false, false]),
            (9, "pkg/Bar", &[false, false, true]),
        ]);
        let mut store = ExecutionDataStore::new();
        read(&mut data.as_slice(), &mut store).unwrap();
        assert_eq!(
            store.get(9).unwrap().probes,
            bits(&[true, false, true])
        );
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut data = write_exec(&[]);
        data[1] = 0x00;
        let mut store = ExecutionDataStore::new();
        assert!(matches!(
            read(&mut data.as_slice(), &mut store),
            Err(GroocovError::ExecData(_))
        ));
    }

    #[test]
    fn test_missing_header_rejected() {
        let data = [BLOCK_SESSION_INFO];
        let mut store = ExecutionDataStore::new();
        assert!(matches!(
            read(&mut data.as_slice(), &mut store),
            Err(GroocovError::ExecData(_))
        ));
    }

    #[test]
    fn test_empty_stream_is_empty_store() {
        let data: [u8; 0] = [];
        let mut store = ExecutionDataStore::new();
        read(&mut data.as_slice(), &mut store).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_large_probe_vector_round_trip() {
        let probes: Vec<bool> = (0..300).map(|i| i % 7 == 0).collect();
        let data = write_exec(&[(5, "pkg/Big", &probes)]);
        let mut store = ExecutionDataStore::new();
        read(&mut data.as_slice(), &mut store).unwrap();
        let exec = store.get(5).unwrap();
        assert_eq!(exec.probe_count(), 300);
        for (i, &hit) in probes.iter().enumerate() {
            assert_eq!(exec.probes.contains(i), hit, "probe {}", i);
        }
    }
}
