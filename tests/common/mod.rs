//! Shared fixture builders: minimal-but-valid JVM class files and JaCoCo
//! execution-data streams, so tests control the exact structure the
//! analyzer sees.

#![allow(dead_code)]

/// One executable statement in a synthetic method: a source line, optionally
/// ending in a two-way conditional branch.
#[derive(Debug, Clone, Copy)]
pub struct Stmt {
    pub line: u16,
    pub branch: bool,
}

pub fn stmt(line: u16) -> Stmt {
    Stmt {
        line,
        branch: false,
    }
}

pub fn branch_stmt(line: u16) -> Stmt {
    Stmt { line, branch: true }
}

/// Build a valid class file for `vm_name` (e.g. `"pkg/Foo"`), declaring
/// `source_file` and one method per statement slice. Each statement emits a
/// `nop` opening its line-table entry; branch statements append an `ifeq`.
///
/// The resulting probe layout is therefore one `Line` probe per statement,
/// followed by two `Branch` probes when the statement branches, in
/// statement order.
pub fn build_class(vm_name: &str, source_file: Option<&str>, methods: &[&[Stmt]]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // minor
    out.extend_from_slice(&52u16.to_be_bytes()); // major (Java 8)

    // Constant pool: 1 Utf8 name, 2 Class(1), 3 Utf8 Object, 4 Class(3),
    // 5 Utf8 "m", 6 Utf8 "()V", 7 Utf8 "Code", 8 Utf8 "LineNumberTable",
    // 9 Utf8 "SourceFile", 10 Utf8 <source file> (when declared).
    let entries: u16 = if source_file.is_some() { 10 } else { 9 };
    out.extend_from_slice(&(entries + 1).to_be_bytes());
    push_utf8(&mut out, vm_name);
    push_class(&mut out, 1);
    push_utf8(&mut out, "java/lang/Object");
    push_class(&mut out, 3);
    push_utf8(&mut out, "m");
    push_utf8(&mut out, "()V");
    push_utf8(&mut out, "Code");
    push_utf8(&mut out, "LineNumberTable");
    push_utf8(&mut out, "SourceFile");
    if let Some(name) = source_file {
        push_utf8(&mut out, name);
    }

    out.extend_from_slice(&0x0021u16.to_be_bytes()); // access flags
    out.extend_from_slice(&2u16.to_be_bytes()); // this_class
    out.extend_from_slice(&4u16.to_be_bytes()); // super_class
    out.extend_from_slice(&0u16.to_be_bytes()); // interfaces
    out.extend_from_slice(&0u16.to_be_bytes()); // fields

    out.extend_from_slice(&(methods.len() as u16).to_be_bytes());
    for stmts in methods {
        push_method(&mut out, stmts);
    }

    // Class attributes
    if source_file.is_some() {
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&9u16.to_be_bytes()); // "SourceFile"
        out.extend_from_slice(&2u32.to_be_bytes());
        out.extend_from_slice(&10u16.to_be_bytes());
    } else {
        out.extend_from_slice(&0u16.to_be_bytes());
    }

    out
}

fn push_method(out: &mut Vec<u8>, stmts: &[Stmt]) {
    let mut code = Vec::new();
    let mut line_table = Vec::new();
    for stmt in stmts {
        line_table.push((code.len() as u16, stmt.line));
        code.push(0x00); // nop
        if stmt.branch {
            code.extend_from_slice(&[0x99, 0x00, 0x03]); // ifeq +3
        }
    }
    code.push(0xB1); // return

    out.extend_from_slice(&0x0001u16.to_be_bytes()); // access
    out.extend_from_slice(&5u16.to_be_bytes()); // name "m"
    out.extend_from_slice(&6u16.to_be_bytes()); // descriptor "()V"
    out.extend_from_slice(&1u16.to_be_bytes()); // attribute count

    let lnt_body = 2 + 4 * line_table.len() as u32;
    let code_attr_len = 12 + code.len() as u32 + 6 + lnt_body;
    out.extend_from_slice(&7u16.to_be_bytes()); // "Code"
    out.extend_from_slice(&code_attr_len.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // max_stack
    out.extend_from_slice(&1u16.to_be_bytes()); // max_locals
    out.extend_from_slice(&(code.len() as u32).to_be_bytes());
    out.extend_from_slice(&code);
    out.extend_from_slice(&0u16.to_be_bytes()); // exception table
    out.extend_from_slice(&1u16.to_be_bytes()); // code attribute count
    out.extend_from_slice(&8u16.to_be_bytes()); // "LineNumberTable"
    out.extend_from_slice(&lnt_body.to_be_bytes());
    out.extend_from_slice(&(line_table.len() as u16).to_be_bytes());
    for (pc, line) in line_table {
        out.extend_from_slice(&pc.to_be_bytes());
        out.extend_from_slice(&line.to_be_bytes());
    }
}

fn push_utf8(out: &mut Vec<u8>, text: &str) {
    out.push(1);
    out.extend_from_slice(&(text.len() as u16).to_be_bytes());
    out.extend_from_slice(text.as_bytes());
}

fn push_class(out: &mut Vec<u8>, name_index: u16) {
    out.push(7);
    out.extend_from_slice(&name_index.to_be_bytes());
}

/// Serialize execution-data records into the binary stream format the
/// analyzer reads: header, one session-info block, then the records.
pub fn write_exec(records: &[(u64, &str, &[bool])]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(0x01); // header block
    out.extend_from_slice(&0xC0C0u16.to_be_bytes());
    out.extend_from_slice(&0x1007u16.to_be_bytes());

    out.push(0x10); // session info
    out.extend_from_slice(&(7u16).to_be_bytes());
    out.extend_from_slice(b"session");
    out.extend_from_slice(&1_000u64.to_be_bytes());
    out.extend_from_slice(&2_000u64.to_be_bytes());

    for &(id, name, probes) in records {
        out.push(0x11); // execution data
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
