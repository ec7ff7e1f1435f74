// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// mach-o arm64 executable writer.
//
// segment layout, in file order:
//
//   __PAGEZERO   vm only, 4 GiB
//   __TEXT       file offset 0: header + load commands + __text + __const
//   __DATA       __data (globals + string headers) + __got
//   __LINKEDIT   bind opcodes, export trie, symbol table, string
//                table, code signature (must be last)
//
// the image is PIE: code references rodata and data through adrp pairs
// patched against the actual virtual address of each adrp instruction,
// string-header data pointers are materialized at runtime by the
// generated code, so no rebase opcodes are emitted at all. the GOT is
// populated by dyld from the bind opcodes, one pointer per libSystem
// symbol.

use std::path::Path;

use log::debug;

use rtg_asm::wasm::write_uleb;

use crate::{
    align_up, codesign, patch_code, write_executable, ByteBuffer, ObjectError, ProgramImage,
    SectRef,
};

pub const MACHO_BASE: u64 = 0x1_0000_0000;
const PAGE: usize = 0x4000;

const MH_MAGIC_64: u32 = 0xfeed_facf;
const CPU_TYPE_ARM64: u32 = 0x0100_000c;
const MH_EXECUTE: u32 = 2;
// MH_NOUNDEFS | MH_DYLDLINK | MH_TWOLEVEL | MH_PIE
const MH_FLAGS: u32 = 0x1 | 0x4 | 0x80 | 0x0020_0000;

const LC_SEGMENT_64: u32 = 0x19;
const LC_SYMTAB: u32 = 0x2;
const LC_DYSYMTAB: u32 = 0xb;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_LOAD_DYLINKER: u32 = 0xe;
const LC_CODE_SIGNATURE: u32 = 0x1d;
const LC_MAIN: u32 = 0x8000_0028;
const LC_DYLD_INFO_ONLY: u32 = 0x8000_0022;

const DYLD_PATH: &[u8] = b"/usr/lib/dyld\0";
const LIBSYSTEM_PATH: &[u8] = b"/usr/lib/libSystem.B.dylib\0";

const BIND_OPCODE_DONE: u8 = 0x00;
const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
const BIND_OPCODE_DO_BIND: u8 = 0x90;
const BIND_TYPE_POINTER: u8 = 1;

// load-command sizes; dylinker and dylib are padded to 8
const CMDSIZE_SEG: u32 = 72;
const CMDSIZE_SECT: u32 = 80;
const CMDSIZE_DYLINKER: u32 = (12 + DYLD_PATH.len() as u32 + 7) & !7;
const CMDSIZE_DYLIB: u32 = (24 + LIBSYSTEM_PATH.len() as u32 + 7) & !7;

fn sizeofcmds() -> u32 {
    CMDSIZE_SEG                      // __PAGEZERO
        + CMDSIZE_SEG + 2 * CMDSIZE_SECT // __TEXT
        + CMDSIZE_SEG + 2 * CMDSIZE_SECT // __DATA
        + CMDSIZE_SEG                // __LINKEDIT
        + 48                         // dyld info
        + 24                         // symtab
        + 80                         // dysymtab
        + CMDSIZE_DYLINKER
        + CMDSIZE_DYLIB
        + 24                         // main
        + 16 // code signature
}

/// bind one pointer per got slot: dylib ordinal 1 (libSystem), type
/// pointer, segment 2 (__DATA) at the slot's offset
fn build_bind_opcodes(got_symbols: &[String], got_seg_offset: usize) -> Vec<u8> {
    let mut bind: Vec<u8> = Vec::new();
    for (slot, symbol) in got_symbols.iter().enumerate() {
        bind.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1);
        bind.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
        bind.extend_from_slice(symbol.as_bytes());
        bind.push(0);
        bind.push(BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER);
        bind.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 2);
        write_uleb(&mut bind, (got_seg_offset + slot * 8) as u64);
        bind.push(BIND_OPCODE_DO_BIND);
    }
    bind.push(BIND_OPCODE_DONE);
    while bind.len() % 8 != 0 {
        bind.push(0);
    }
    bind
}

/// the export trie contains exactly "_main" at the entry offset
fn build_export_trie(entryoff: u64) -> Vec<u8> {
    let mut addr: Vec<u8> = Vec::new();
    write_uleb(&mut addr, entryoff);

    // root node: no terminal info, one edge labelled "_main"
    let mut trie: Vec<u8> = vec![0, 1];
    trie.extend_from_slice(b"_main\0");
    // the child node follows immediately; the root is 9 bytes as long
    // as the child offset fits one uleb byte
    trie.push(9);
    debug_assert_eq!(trie.len(), 9);

    // child node: terminal payload is flags + address, no edges
    trie.push((1 + addr.len()) as u8);
    trie.push(0); // flags: regular export
    trie.extend_from_slice(&addr);
    trie.push(0); // edge count

    while trie.len() % 8 != 0 {
        trie.push(0);
    }
    trie
}

#[allow(clippy::too_many_arguments)]
fn put_segment(
    out: &mut ByteBuffer,
    name: &[u8],
    nsects: u32,
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    maxprot: u32,
    initprot: u32,
) {
    out.put_u32(LC_SEGMENT_64);
    out.put_u32(CMDSIZE_SEG + nsects * CMDSIZE_SECT);
    out.put_fixed(name, 16);
    out.put_u64(vmaddr);
    out.put_u64(vmsize);
    out.put_u64(fileoff);
    out.put_u64(filesize);
    out.put_u32(maxprot);
    out.put_u32(initprot);
    out.put_u32(nsects);
    out.put_u32(0); // flags
}

#[allow(clippy::too_many_arguments)]
fn put_section(
    out: &mut ByteBuffer,
    sectname: &[u8],
    segname: &[u8],
    addr: u64,
    size: u64,
    offset: u32,
    align_log2: u32,
    flags: u32,
) {
    out.put_fixed(sectname, 16);
    out.put_fixed(segname, 16);
    out.put_u64(addr);
    out.put_u64(size);
    out.put_u32(offset);
    out.put_u32(align_log2);
    out.put_u32(0); // reloff
    out.put_u32(0); // nreloc
    out.put_u32(flags);
    out.put_u32(0);
    out.put_u32(0);
    out.put_u32(0);
}

pub fn write_macho_arm64(mut image: ProgramImage, path: &Path) -> Result<(), ObjectError> {
    let header_end = 32 + sizeofcmds() as usize;
    let text_off = align_up(header_end, 16);
    let const_off = align_up(text_off + image.code.len(), 16);
    let text_filesize = align_up(const_off + image.rodata.len(), PAGE);

    // __DATA: __data then __got, 8-aligned
    let data_seg_off = text_filesize;
    let got_seg_offset = align_up(image.data.len(), 8);
    let got_size = image.got_symbols.len() * 8;
    let data_filesize = align_up(got_seg_offset + got_size, PAGE);

    let linkedit_off = data_seg_off + data_filesize;

    let text_va = MACHO_BASE;
    let data_va = MACHO_BASE + data_seg_off as u64;
    let linkedit_va = MACHO_BASE + linkedit_off as u64;

    let code_va = text_va + text_off as u64;
    let const_va = text_va + const_off as u64;
    let got_va = data_va + got_seg_offset as u64;

    debug!(
        "macho: code {:#x} const {:#x} data {:#x} got {:#x}",
        code_va, const_va, data_va, got_va
    );

    patch_code(&mut image.code, &image.sect_fixups, code_va, |section| {
        match section {
            SectRef::RodataHeader => const_va,
            SectRef::DataAddr => data_va,
            SectRef::GotAddr => got_va,
            SectRef::Iat(_) => 0,
        }
    });

    let entryoff = (text_off + image.entry) as u64;
    let bind = build_bind_opcodes(&image.got_symbols, got_seg_offset);
    let trie = build_export_trie(entryoff);

    // symbol table: every function by name, plus _main at the entry
    let mut strtab: Vec<u8> = vec![0];
    let mut nlist = ByteBuffer::new();
    let put_sym = |nlist: &mut ByteBuffer, strtab: &mut Vec<u8>, name: &str, value: u64| {
        let strx = strtab.len() as u32;
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
        nlist.put_u32(strx);
        nlist.put_u8(0x0f); // N_SECT | N_EXT
        nlist.put_u8(1); // __text
        nlist.put_u16(0);
        nlist.put_u64(value);
    };
    put_sym(&mut nlist, &mut strtab, "_main", code_va + image.entry as u64);
    for func in &image.funcs {
        put_sym(&mut nlist, &mut strtab, &func.name, code_va + func.offset as u64);
    }
    let nsyms = 1 + image.funcs.len() as u32;

    let bind_off = linkedit_off;
    let export_off = bind_off + bind.len();
    let symoff = export_off + trie.len();
    let stroff = symoff + nlist.buf.len();
    let sig_off = align_up(stroff + strtab.len(), 16);

    let ident = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "a.out".to_owned());
    let sig_size = codesign::signature_size(sig_off, &ident);

    let linkedit_filesize = sig_off + sig_size - linkedit_off;

    let mut out = ByteBuffer::new();

    // header
    out.put_u32(MH_MAGIC_64);
    out.put_u32(CPU_TYPE_ARM64);
    out.put_u32(0);
    out.put_u32(MH_EXECUTE);
    out.put_u32(11);
    out.put_u32(sizeofcmds());
    out.put_u32(MH_FLAGS);
    out.put_u32(0);

    put_segment(&mut out, b"__PAGEZERO", 0, 0, MACHO_BASE, 0, 0, 0, 0);

    put_segment(
        &mut out,
        b"__TEXT",
        2,
        text_va,
        text_filesize as u64,
        0,
        text_filesize as u64,
        5,
        5,
    );
    put_section(
        &mut out,
        b"__text",
        b"__TEXT",
        code_va,
        image.code.len() as u64,
        text_off as u32,
        4,
        0x8000_0400, // pure + some instructions
    );
    put_section(
        &mut out,
        b"__const",
        b"__TEXT",
        const_va,
        image.rodata.len() as u64,
        const_off as u32,
        4,
        0,
    );

    put_segment(
        &mut out,
        b"__DATA",
        2,
        data_va,
        data_filesize as u64,
        data_seg_off as u64,
        data_filesize as u64,
        3,
        3,
    );
    put_section(
        &mut out,
        b"__data",
        b"__DATA",
        data_va,
        image.data.len() as u64,
        data_seg_off as u32,
        3,
        0,
    );
    put_section(
        &mut out,
        b"__got",
        b"__DATA",
        got_va,
        got_size as u64,
        (data_seg_off + got_seg_offset) as u32,
        3,
        0,
    );

    put_segment(
        &mut out,
        b"__LINKEDIT",
        0,
        linkedit_va,
        align_up(linkedit_filesize, PAGE) as u64,
        linkedit_off as u64,
        linkedit_filesize as u64,
        1,
        1,
    );

    // dyld info: no rebase, binds, no weak/lazy, export trie
    out.put_u32(LC_DYLD_INFO_ONLY);
    out.put_u32(48);
    out.put_u32(0);
    out.put_u32(0);
    out.put_u32(bind_off as u32);
    out.put_u32(bind.len() as u32);
    out.put_u32(0);
    out.put_u32(0);
    out.put_u32(0);
    out.put_u32(0);
    out.put_u32(export_off as u32);
    out.put_u32(trie.len() as u32);

    out.put_u32(LC_SYMTAB);
    out.put_u32(24);
    out.put_u32(symoff as u32);
    out.put_u32(nsyms);
    out.put_u32(stroff as u32);
    out.put_u32(strtab.len() as u32);

    out.put_u32(LC_DYSYMTAB);
    out.put_u32(80);
    out.put_u32(0); // ilocalsym
    out.put_u32(0); // nlocalsym
    out.put_u32(0); // iextdefsym
    out.put_u32(nsyms); // nextdefsym
    out.put_u32(nsyms); // iundefsym
    out.put_u32(0); // nundefsym
    for _ in 0..12 {
        out.put_u32(0);
    }

    out.put_u32(LC_LOAD_DYLINKER);
    out.put_u32(CMDSIZE_DYLINKER);
    out.put_u32(12); // name offset
    out.put_fixed(DYLD_PATH, CMDSIZE_DYLINKER as usize - 12);

    out.put_u32(LC_LOAD_DYLIB);
    out.put_u32(CMDSIZE_DYLIB);
    out.put_u32(24); // name offset
    out.put_u32(2); // timestamp
    out.put_u32(0x0001_0000); // current version
    out.put_u32(0x0001_0000); // compatibility version
    out.put_fixed(LIBSYSTEM_PATH, CMDSIZE_DYLIB as usize - 24);

    out.put_u32(LC_MAIN);
    out.put_u32(24);
    out.put_u64(entryoff);
    out.put_u64(0); // stack size: default

    out.put_u32(LC_CODE_SIGNATURE);
    out.put_u32(16);
    out.put_u32(sig_off as u32);
    out.put_u32(sig_size as u32);

    debug_assert_eq!(out.pos(), header_end);

    out.pad_to_pos(text_off);
    out.put_bytes(&image.code);
    out.pad_to_pos(const_off);
    out.put_bytes(&image.rodata);
    out.pad_to_pos(text_filesize);

    out.put_bytes(&image.data);
    out.pad_to_pos(data_seg_off + got_seg_offset);
    out.put_bytes(&vec![0u8; got_size]);
    out.pad_to_pos(linkedit_off);

    out.put_bytes(&bind);
    out.put_bytes(&trie);
    out.put_bytes(&nlist.buf);
    out.put_bytes(&strtab);
    out.pad_to_pos(sig_off);

    let signature = codesign::build_signature(&out.buf, sig_off, &ident, text_filesize as u64);
    debug_assert_eq!(signature.len(), sig_size);
    out.put_bytes(&signature);

    write_executable(path, &out.buf)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use sha2::{Digest, Sha256};

    use crate::{FuncSym, ProgramImage};

    fn sample_image() -> ProgramImage {
        ProgramImage {
            code: vec![0xd5, 0x03, 0x20, 0x1f, 0xc0, 0x03, 0x5f, 0xd6], // nop; ret
            rodata: b"hi".to_vec(),
            data: vec![0u8; 24],
            entry: 0,
            sect_fixups: vec![],
            string_headers: vec![],
            got_symbols: vec!["_write".to_owned(), "_exit".to_owned()],
            iat_symbols: vec![],
            funcs: vec![FuncSym {
                name: "main.main".to_owned(),
                offset: 4,
            }],
        }
    }

    fn read_u32(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn test_header_and_signature_roundtrip() {
        let dir = std::env::temp_dir().join("rtg-object-macho-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("demo");
        super::write_macho_arm64(sample_image(), &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();

        assert_eq!(read_u32(&bytes, 0), 0xfeed_facf);
        assert_eq!(read_u32(&bytes, 4), 0x0100_000c);
        assert_eq!(read_u32(&bytes, 12), 2); // MH_EXECUTE
        assert_eq!(read_u32(&bytes, 16), 11); // ncmds
        assert_eq!(read_u32(&bytes, 24), 0x0020_0085); // flags

        // walk the load commands to the signature command
        let ncmds = read_u32(&bytes, 16);
        let mut at = 32usize;
        let mut sig = None;
        for _ in 0..ncmds {
            let cmd = read_u32(&bytes, at);
            let cmdsize = read_u32(&bytes, at + 4) as usize;
            if cmd == 0x1d {
                sig = Some((
                    read_u32(&bytes, at + 8) as usize,
                    read_u32(&bytes, at + 12) as usize,
                ));
            }
            at += cmdsize;
        }
        let (sig_off, sig_size) = sig.expect("LC_CODE_SIGNATURE present");
        assert_eq!(sig_off + sig_size, bytes.len());

        // superblob magic, big-endian
        assert_eq!(
            &bytes[sig_off..sig_off + 4],
            &0xfade_0cc0u32.to_be_bytes()
        );

        // re-hash the first page and compare with the code directory
        let cd = &bytes[sig_off + 20..];
        let hash_offset = u32::from_be_bytes(cd[16..20].try_into().unwrap()) as usize;
        let n_slots = u32::from_be_bytes(cd[28..32].try_into().unwrap()) as usize;
        assert_eq!(n_slots, sig_off.div_ceil(4096));
        let first_page_end = 4096.min(sig_off);
        let expected = Sha256::digest(&bytes[0..first_page_end]);
        assert_eq!(&cd[hash_offset..hash_offset + 32], expected.as_slice());
    }

    #[test]
    fn test_bind_opcodes() {
        let bind = super::build_bind_opcodes(&["_write".to_owned()], 32);
        // ordinal, symbol, type, segment+offset, do_bind, done
        assert_eq!(bind[0], 0x11);
        assert_eq!(bind[1], 0x40);
        assert_eq!(&bind[2..9], b"_write\0");
        assert_eq!(bind[9], 0x51);
        assert_eq!(bind[10], 0x72);
        assert_eq!(bind[11], 32); // uleb offset
        assert_eq!(bind[12], 0x90);
        assert_eq!(bind[13], 0x00);
    }

    #[test]
    fn test_export_trie_shape() {
        let trie = super::build_export_trie(0x3a0);
        assert_eq!(trie[0], 0); // root: not terminal
        assert_eq!(trie[1], 1); // one edge
        assert_eq!(&trie[2..8], b"_main\0");
        assert_eq!(trie[8], 9); // child node offset
        let payload_len = trie[9] as usize;
        assert_eq!(trie[10], 0); // flags
        // the address uleb follows, then the zero edge count
        assert_eq!(trie[10 + payload_len], 0);
        assert_eq!(trie.len() % 8, 0);
    }
}
