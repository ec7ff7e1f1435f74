// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// wasm module writer for the wasi target.
//
// sections are emitted in the mandated order: type, import, function,
// memory, global, export, code, data. the module imports the three
// wasi functions the code generator lowers OS intrinsics to, declares
// one linear memory (exported as "memory" for the wasi runtime) and
// the mutable globals that carry the operand-stack and frame pointers,
// and exports the entry stub as "_start".

use std::path::Path;

use rtg_asm::wasm::write_uleb;

use crate::{write_executable, ByteBuffer, ObjectError};

/// imported function indices, fixed: the code generator emits calls
/// against these before any module function
pub const FD_WRITE: u32 = 0;
pub const FD_READ: u32 = 1;
pub const PROC_EXIT: u32 = 2;
pub const IMPORT_COUNT: u32 = 3;

const WASI_MODULE: &[u8] = b"wasi_snapshot_preview1";

pub struct WasmFunc {
    /// extra i32 locals beyond the (empty) parameter list
    pub local_i32s: u32,
    /// the body expression, including the trailing end opcode
    pub code: Vec<u8>,
}

pub struct WasmImage {
    pub funcs: Vec<WasmFunc>,
    /// index into 'funcs' of the entry stub, exported as _start
    pub start: u32,
    /// initialized data blob and its linear-memory load address
    pub data: Vec<u8>,
    pub data_offset: u32,
    /// initial linear-memory size in 64 KiB pages
    pub mem_pages: u32,
    /// mutable i32 globals with their init values
    pub globals: Vec<i32>,
}

fn section(out: &mut ByteBuffer, id: u8, payload: &[u8]) {
    out.put_u8(id);
    write_uleb(&mut out.buf, payload.len() as u64);
    out.put_bytes(payload);
}

fn name(buf: &mut Vec<u8>, text: &[u8]) {
    write_uleb(buf, text.len() as u64);
    buf.extend_from_slice(text);
}

pub fn write_wasm(image: WasmImage, path: &Path) -> Result<(), ObjectError> {
    let mut out = ByteBuffer::new();
    out.put_bytes(b"\0asm");
    out.put_u32(1);

    // type section: 0 = () -> (), 1 = (i32 x4) -> i32, 2 = (i32) -> ()
    let mut payload: Vec<u8> = Vec::new();
    write_uleb(&mut payload, 3);
    payload.extend_from_slice(&[0x60, 0x00, 0x00]);
    payload.extend_from_slice(&[0x60, 0x04, 0x7f, 0x7f, 0x7f, 0x7f, 0x01, 0x7f]);
    payload.extend_from_slice(&[0x60, 0x01, 0x7f, 0x00]);
    section(&mut out, 1, &payload);

    // import section: the three wasi functions
    let mut payload: Vec<u8> = Vec::new();
    write_uleb(&mut payload, 3);
    for (field, type_index) in [
        (&b"fd_write"[..], 1u64),
        (&b"fd_read"[..], 1),
        (&b"proc_exit"[..], 2),
    ] {
        name(&mut payload, WASI_MODULE);
        name(&mut payload, field);
        payload.push(0x00); // function import
        write_uleb(&mut payload, type_index);
    }
    section(&mut out, 2, &payload);

    // function section: every module function is () -> ()
    let mut payload: Vec<u8> = Vec::new();
    write_uleb(&mut payload, image.funcs.len() as u64);
    for _ in &image.funcs {
        write_uleb(&mut payload, 0);
    }
    section(&mut out, 3, &payload);

    // memory section
    let mut payload: Vec<u8> = Vec::new();
    write_uleb(&mut payload, 1);
    payload.push(0x00); // min only
    write_uleb(&mut payload, image.mem_pages as u64);
    section(&mut out, 5, &payload);

    // global section
    let mut payload: Vec<u8> = Vec::new();
    write_uleb(&mut payload, image.globals.len() as u64);
    for init in &image.globals {
        payload.push(0x7f); // i32
        payload.push(0x01); // mutable
        payload.push(0x41); // i32.const
        rtg_asm::wasm::write_sleb(&mut payload, *init as i64);
        payload.push(0x0b);
    }
    section(&mut out, 6, &payload);

    // export section: the memory and the entry stub
    let mut payload: Vec<u8> = Vec::new();
    write_uleb(&mut payload, 2);
    name(&mut payload, b"memory");
    payload.push(0x02);
    write_uleb(&mut payload, 0);
    name(&mut payload, b"_start");
    payload.push(0x00);
    write_uleb(&mut payload, (IMPORT_COUNT + image.start) as u64);
    section(&mut out, 7, &payload);

    // code section
    let mut payload: Vec<u8> = Vec::new();
    write_uleb(&mut payload, image.funcs.len() as u64);
    for func in &image.funcs {
        let mut body: Vec<u8> = Vec::new();
        if func.local_i32s == 0 {
            write_uleb(&mut body, 0);
        } else {
            write_uleb(&mut body, 1);
            write_uleb(&mut body, func.local_i32s as u64);
            body.push(0x7f);
        }
        body.extend_from_slice(&func.code);
        write_uleb(&mut payload, body.len() as u64);
        payload.extend_from_slice(&body);
    }
    section(&mut out, 10, &payload);

    // data section: one active segment
    let mut payload: Vec<u8> = Vec::new();
    write_uleb(&mut payload, 1);
    payload.push(0x00);
    payload.push(0x41); // i32.const
    rtg_asm::wasm::write_sleb(&mut payload, image.data_offset as i64);
    payload.push(0x0b);
    write_uleb(&mut payload, image.data.len() as u64);
    payload.extend_from_slice(&image.data);
    section(&mut out, 11, &payload);

    write_executable(path, &out.buf)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{WasmFunc, WasmImage};

    #[test]
    fn test_module_shape() {
        let dir = std::env::temp_dir().join("rtg-object-wasm-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.wasm");

        let image = WasmImage {
            funcs: vec![WasmFunc {
                local_i32s: 2,
                code: vec![0x0b],
            }],
            start: 0,
            data: b"hello".to_vec(),
            data_offset: 1024,
            mem_pages: 32,
            globals: vec![0x100000, 0x200000],
        };
        super::write_wasm(image, &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();

        assert_eq!(&bytes[0..4], b"\0asm");
        assert_eq!(&bytes[4..8], &[1, 0, 0, 0]);

        // walk the sections, the ids must be strictly increasing
        let mut at = 8usize;
        let mut ids: Vec<u8> = Vec::new();
        while at < bytes.len() {
            let id = bytes[at];
            ids.push(id);
            at += 1;
            let mut size = 0u64;
            let mut shift = 0;
            loop {
                let byte = bytes[at];
                at += 1;
                size |= ((byte & 0x7f) as u64) << shift;
                shift += 7;
                if byte & 0x80 == 0 {
                    break;
                }
            }
            at += size as usize;
        }
        assert_eq!(ids, vec![1, 2, 3, 5, 6, 7, 10, 11]);
        assert_eq!(at, bytes.len());
    }
}
