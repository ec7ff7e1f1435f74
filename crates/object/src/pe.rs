// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// PE32 / PE32+ console executable writer.
//
// sections: .text, .rdata, .data, .idata, .debug_abbrev, .debug_info.
// the image base is fixed at 0x400000 and no .reloc section is
// emitted (relocs-stripped), so every address the code generator left
// behind is patched as an absolute virtual address.
//
// .idata carries the one import descriptor (kernel32.dll) plus ILT,
// IAT, hint/name entries and the dll name; each '$iat$<symbol>' fixup
// is patched with the virtual address of its IAT slot.
//
// a COFF symbol table names every compiled function so debuggers can
// resolve frames; section names longer than 8 bytes use the
// '/<decimal>' string-table indirection. the two .debug_* sections
// hold just enough DWARF-2 (a compile unit and one subprogram DIE per
// function) for symbolic backtraces.

use std::path::Path;

use log::debug;

use crate::{
    align_up, patch_code, patch_string_headers, write_executable, ByteBuffer, ObjectError,
    ProgramImage, SectRef,
};

pub const PE_IMAGE_BASE: u64 = 0x400000;

const SECTION_ALIGN: usize = 0x1000;
const FILE_ALIGN: usize = 0x200;
const SIZE_OF_HEADERS: usize = 0x400;

const MACHINE_I386: u16 = 0x014c;
const MACHINE_ARM64: u16 = 0xaa64;

const SUBSYSTEM_CONSOLE: u16 = 3;

const TEXT_CHARS: u32 = 0x6000_0020; // code | execute | read
const RDATA_CHARS: u32 = 0x4000_0040; // initialized | read
const DATA_CHARS: u32 = 0xc000_0040; // initialized | read | write
const DEBUG_CHARS: u32 = 0x4200_0040; // initialized | read | discardable

const DOS_STUB: &[u8] = &[
    0x0e, 0x1f, 0xba, 0x0e, 0x00, 0xb4, 0x09, 0xcd, 0x21, 0xb8, 0x01, 0x4c, 0xcd, 0x21,
];
const DOS_MESSAGE: &[u8] = b"This program cannot be run in DOS mode.\r\r\n$";

const DLL_NAME: &[u8] = b"KERNEL32.dll\0";

struct Section {
    name: &'static str,
    rva: usize,
    vsize: usize,
    raw_off: usize,
    raw_size: usize,
    chars: u32,
    bytes: Vec<u8>,
}

/// the .idata blob plus the rva of its IAT, built against its own rva
fn build_idata(symbols: &[String], idata_rva: usize, ptr: usize) -> (Vec<u8>, usize) {
    let count = symbols.len();
    let desc_size = 2 * 20;
    let ilt_off = desc_size;
    let iat_off = ilt_off + (count + 1) * ptr;
    let hints_off = iat_off + (count + 1) * ptr;

    // hint/name entries, 2-aligned
    let mut hints: Vec<u8> = Vec::new();
    let mut hint_rvas: Vec<usize> = Vec::new();
    for symbol in symbols {
        if hints.len() % 2 != 0 {
            hints.push(0);
        }
        hint_rvas.push(idata_rva + hints_off + hints.len());
        hints.extend_from_slice(&[0, 0]); // hint: let the loader search
        hints.extend_from_slice(symbol.as_bytes());
        hints.push(0);
    }
    if hints.len() % 2 != 0 {
        hints.push(0);
    }
    let name_off = hints_off + hints.len();

    let mut out = ByteBuffer::new();

    // import descriptor for kernel32, then the null terminator entry
    out.put_u32((idata_rva + ilt_off) as u32);
    out.put_u32(0);
    out.put_u32(0);
    out.put_u32((idata_rva + name_off) as u32);
    out.put_u32((idata_rva + iat_off) as u32);
    out.put_bytes(&[0u8; 20]);

    // ILT and IAT carry the same hint/name rvas before binding
    for table in 0..2 {
        let _ = table;
        for rva in &hint_rvas {
            if ptr == 8 {
                out.put_u64(*rva as u64);
            } else {
                out.put_u32(*rva as u32);
            }
        }
        if ptr == 8 {
            out.put_u64(0);
        } else {
            out.put_u32(0);
        }
    }

    out.put_bytes(&hints);
    out.put_bytes(DLL_NAME);

    (out.buf, idata_rva + iat_off)
}

fn build_debug_abbrev() -> Vec<u8> {
    let mut out: Vec<u8> = Vec::new();
    // abbrev 1: compile unit with children; name, low_pc, high_pc
    out.extend_from_slice(&[1, 0x11, 1]);
    out.extend_from_slice(&[0x03, 0x08]); // DW_AT_name, DW_FORM_string
    out.extend_from_slice(&[0x11, 0x01]); // DW_AT_low_pc, DW_FORM_addr
    out.extend_from_slice(&[0x12, 0x01]); // DW_AT_high_pc, DW_FORM_addr
    out.extend_from_slice(&[0, 0]);
    // abbrev 2: subprogram, no children; same attributes
    out.extend_from_slice(&[2, 0x2e, 0]);
    out.extend_from_slice(&[0x03, 0x08]);
    out.extend_from_slice(&[0x11, 0x01]);
    out.extend_from_slice(&[0x12, 0x01]);
    out.extend_from_slice(&[0, 0]);
    out.push(0);
    out
}

fn build_debug_info(image: &ProgramImage, text_va: u64, ptr: usize) -> Vec<u8> {
    let mut body = ByteBuffer::new();
    body.put_u16(2); // dwarf version
    body.put_u32(0); // abbrev offset
    body.put_u8(ptr as u8);

    let put_addr = |body: &mut ByteBuffer, value: u64| {
        if ptr == 8 {
            body.put_u64(value);
        } else {
            body.put_u32(value as u32);
        }
    };

    body.put_u8(1); // the compile unit
    body.put_bytes(b"rtg\0");
    put_addr(&mut body, text_va);
    put_addr(&mut body, text_va + image.code.len() as u64);

    for (i, func) in image.funcs.iter().enumerate() {
        let end = image
            .funcs
            .get(i + 1)
            .map(|next| next.offset)
            .unwrap_or(image.code.len());
        body.put_u8(2);
        body.put_bytes(func.name.as_bytes());
        body.put_u8(0);
        put_addr(&mut body, text_va + func.offset as u64);
        put_addr(&mut body, text_va + end as u64);
    }
    body.put_u8(0); // end of children

    let mut out = ByteBuffer::new();
    out.put_u32(body.buf.len() as u32);
    out.put_bytes(&body.buf);
    out.buf
}

fn write_pe(
    mut image: ProgramImage,
    path: &Path,
    machine: u16,
    ptr: usize,
) -> Result<(), ObjectError> {
    let is64 = ptr == 8;

    // rva layout; sizes of .text/.rdata/.data are known, .idata's size
    // is derived from the import list so its rva can be fixed first
    let text_rva = 0x1000;
    let rdata_rva = text_rva + align_up(image.code.len().max(1), SECTION_ALIGN);
    let data_rva = rdata_rva + align_up(image.rodata.len().max(1), SECTION_ALIGN);
    let idata_rva = data_rva + align_up(image.data.len().max(1), SECTION_ALIGN);

    let text_va = PE_IMAGE_BASE + text_rva as u64;
    let rodata_va = PE_IMAGE_BASE + rdata_rva as u64;
    let data_va = PE_IMAGE_BASE + data_rva as u64;

    let (idata, iat_rva) = build_idata(&image.iat_symbols, idata_rva, ptr);
    let iat_size = (image.iat_symbols.len() + 1) * ptr;

    debug!(
        "pe: text {:#x} rdata {:#x} data {:#x} idata {:#x}",
        text_rva, rdata_rva, data_rva, idata_rva
    );

    patch_string_headers(&mut image.data, &image.string_headers, rodata_va, ptr);
    patch_code(&mut image.code, &image.sect_fixups, text_va, |section| {
        match section {
            SectRef::RodataHeader => rodata_va,
            SectRef::DataAddr => data_va,
            SectRef::GotAddr => 0,
            SectRef::Iat(name) => {
                let slot = image
                    .iat_symbols
                    .iter()
                    .position(|sym| sym == name)
                    .expect("import symbol registered");
                PE_IMAGE_BASE + (iat_rva + slot * ptr) as u64
            }
        }
    });

    let abbrev = build_debug_abbrev();
    let info = build_debug_info(&image, text_va, ptr);

    let abbrev_rva = idata_rva + align_up(idata.len().max(1), SECTION_ALIGN);
    let info_rva = abbrev_rva + align_up(abbrev.len().max(1), SECTION_ALIGN);

    let mut sections: Vec<Section> = Vec::new();
    let mut raw_off = SIZE_OF_HEADERS;
    let mut push_section = |sections: &mut Vec<Section>,
                            name: &'static str,
                            rva: usize,
                            chars: u32,
                            bytes: Vec<u8>| {
        let raw_size = align_up(bytes.len(), FILE_ALIGN);
        let section = Section {
            name,
            rva,
            vsize: bytes.len(),
            raw_off,
            raw_size,
            chars,
            bytes,
        };
        raw_off += raw_size;
        sections.push(section);
    };

    push_section(&mut sections, ".text", text_rva, TEXT_CHARS, image.code.clone());
    push_section(&mut sections, ".rdata", rdata_rva, RDATA_CHARS, image.rodata.clone());
    push_section(&mut sections, ".data", data_rva, DATA_CHARS, image.data.clone());
    push_section(&mut sections, ".idata", idata_rva, DATA_CHARS, idata);
    push_section(&mut sections, ".debug_abbrev", abbrev_rva, DEBUG_CHARS, abbrev);
    push_section(&mut sections, ".debug_info", info_rva, DEBUG_CHARS, info);

    let size_of_image = align_up(info_rva + sections[5].vsize.max(1), SECTION_ALIGN);
    let symtab_off = raw_off;

    // string table: long section names first, then long symbol names.
    // offsets include the 4-byte length prefix.
    let mut strtab: Vec<u8> = Vec::new();
    let strtab_offset_of = |strtab: &mut Vec<u8>, name: &str| -> u32 {
        let off = 4 + strtab.len() as u32;
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
        off
    };
    let abbrev_name_off = strtab_offset_of(&mut strtab, ".debug_abbrev");
    let info_name_off = strtab_offset_of(&mut strtab, ".debug_info");

    let mut symtab = ByteBuffer::new();
    for func in &image.funcs {
        if func.name.len() <= 8 {
            symtab.put_fixed(func.name.as_bytes(), 8);
        } else {
            let off = strtab_offset_of(&mut strtab, &func.name);
            symtab.put_u32(0);
            symtab.put_u32(off);
        }
        symtab.put_u32(func.offset as u32); // value within .text
        symtab.put_u16(1); // .text
        symtab.put_u16(0x20); // function
        symtab.put_u8(2); // external
        symtab.put_u8(0);
    }

    let mut out = ByteBuffer::new();

    // ms-dos header and stub
    out.put_bytes(b"MZ");
    out.put_fixed(&[], 0x3a);
    out.put_u32(0x80); // e_lfanew
    out.put_bytes(DOS_STUB);
    out.put_bytes(DOS_MESSAGE);
    out.pad_to_pos(0x80);

    out.put_bytes(b"PE\0\0");

    // coff header
    out.put_u16(machine);
    out.put_u16(6);
    out.put_u32(0); // timestamp
    out.put_u32(symtab_off as u32);
    out.put_u32(image.funcs.len() as u32);
    out.put_u16(if is64 { 240 } else { 224 });
    out.put_u16(if is64 { 0x0023 } else { 0x0103 });

    // optional header
    out.put_u16(if is64 { 0x20b } else { 0x10b });
    out.put_u8(14);
    out.put_u8(0);
    out.put_u32(sections[0].raw_size as u32); // size of code
    out.put_u32((sections[1].raw_size + sections[2].raw_size + sections[3].raw_size) as u32);
    out.put_u32(0);
    out.put_u32((text_rva + image.entry) as u32);
    out.put_u32(text_rva as u32);
    if is64 {
        out.put_u64(PE_IMAGE_BASE);
    } else {
        out.put_u32(rdata_rva as u32); // base of data
        out.put_u32(PE_IMAGE_BASE as u32);
    }
    out.put_u32(SECTION_ALIGN as u32);
    out.put_u32(FILE_ALIGN as u32);
    out.put_u16(6); // os version
    out.put_u16(0);
    out.put_u16(0); // image version
    out.put_u16(0);
    out.put_u16(6); // subsystem version
    out.put_u16(0);
    out.put_u32(0);
    out.put_u32(size_of_image as u32);
    out.put_u32(SIZE_OF_HEADERS as u32);
    out.put_u32(0); // checksum
    out.put_u16(SUBSYSTEM_CONSOLE);
    out.put_u16(0); // dll characteristics: fixed base
    if is64 {
        out.put_u64(0x10_0000); // stack reserve
        out.put_u64(0x1000);
        out.put_u64(0x10_0000); // heap reserve
        out.put_u64(0x1000);
    } else {
        out.put_u32(0x10_0000);
        out.put_u32(0x1000);
        out.put_u32(0x10_0000);
        out.put_u32(0x1000);
    }
    out.put_u32(0); // loader flags
    out.put_u32(16);

    // data directories: import table and IAT, the rest empty
    for index in 0..16 {
        match index {
            1 => {
                out.put_u32(idata_rva as u32);
                out.put_u32(40);
            }
            12 => {
                out.put_u32(iat_rva as u32);
                out.put_u32(iat_size as u32);
            }
            _ => {
                out.put_u32(0);
                out.put_u32(0);
            }
        }
    }

    // section table
    for section in &sections {
        if section.name.len() <= 8 {
            out.put_fixed(section.name.as_bytes(), 8);
        } else {
            let off = if section.name == ".debug_abbrev" {
                abbrev_name_off
            } else {
                info_name_off
            };
            out.put_fixed(format!("/{}", off).as_bytes(), 8);
        }
        out.put_u32(section.vsize as u32);
        out.put_u32(section.rva as u32);
        out.put_u32(section.raw_size as u32);
        out.put_u32(section.raw_off as u32);
        out.put_u32(0);
        out.put_u32(0);
        out.put_u16(0);
        out.put_u16(0);
        out.put_u32(section.chars);
    }

    out.pad_to_pos(SIZE_OF_HEADERS);
    for section in &sections {
        out.pad_to_pos(section.raw_off);
        out.put_bytes(&section.bytes);
        out.pad_to_pos(section.raw_off + section.raw_size);
    }

    // coff symbol table and string table
    debug_assert_eq!(out.pos(), symtab_off);
    out.put_bytes(&symtab.buf);
    out.put_u32(4 + strtab.len() as u32);
    out.put_bytes(&strtab);

    write_executable(path, &out.buf)
}

pub fn write_pe32(image: ProgramImage, path: &Path) -> Result<(), ObjectError> {
    write_pe(image, path, MACHINE_I386, 4)
}

pub fn write_pe_arm64(image: ProgramImage, path: &Path) -> Result<(), ObjectError> {
    write_pe(image, path, MACHINE_ARM64, 8)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{FuncSym, PatchKind, ProgramImage, SectFixup, SectRef};

    fn sample_image() -> ProgramImage {
        ProgramImage {
            // call [abs32] through the IAT, then ret
            code: vec![0xff, 0x15, 0, 0, 0, 0, 0xc3],
            rodata: b"hi".to_vec(),
            data: vec![0u8; 8],
            entry: 0,
            sect_fixups: vec![SectFixup {
                at: 2,
                section: SectRef::Iat("ExitProcess".to_owned()),
                offset: 0,
                kind: PatchKind::Abs32,
            }],
            string_headers: vec![],
            got_symbols: vec![],
            iat_symbols: vec!["GetStdHandle".to_owned(), "ExitProcess".to_owned()],
            funcs: vec![FuncSym {
                name: "main.main".to_owned(),
                offset: 0,
            }],
        }
    }

    fn read_u16(bytes: &[u8], at: usize) -> u16 {
        u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap())
    }

    fn read_u32(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn test_pe32_structure() {
        let dir = std::env::temp_dir().join("rtg-object-pe-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.exe");
        super::write_pe32(sample_image(), &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();

        assert_eq!(&bytes[0..2], b"MZ");
        let pe_off = read_u32(&bytes, 0x3c) as usize;
        assert_eq!(pe_off, 0x80);
        assert_eq!(&bytes[pe_off..pe_off + 4], b"PE\0\0");
        assert_eq!(read_u16(&bytes, pe_off + 4), 0x014c);
        assert_eq!(read_u16(&bytes, pe_off + 6), 6); // sections

        let opt = pe_off + 24;
        assert_eq!(read_u16(&bytes, opt), 0x10b);
        // subsystem console at offset 68 of the pe32 optional header
        assert_eq!(read_u16(&bytes, opt + 68), 3);
        // entry point is the start of .text
        assert_eq!(read_u32(&bytes, opt + 16), 0x1000);

        // the IAT call was patched with an absolute slot address:
        // slot 1 of the iat (ExitProcess)
        let idata_rva = read_u32(&bytes, opt + 96 + 8) as usize; // data dir 1
        let iat_rva = read_u32(&bytes, opt + 96 + 12 * 8) as usize;
        assert_eq!(iat_rva, idata_rva + 40 + 3 * 4);
        let patched = read_u32(&bytes, 0x400 + 2);
        assert_eq!(patched as usize, 0x400000 + iat_rva + 4);
    }

    #[test]
    fn test_pe32plus_structure() {
        let dir = std::env::temp_dir().join("rtg-object-pe64-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.exe");
        let mut image = sample_image();
        image.sect_fixups.clear();
        super::write_pe_arm64(image, &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();

        let pe_off = read_u32(&bytes, 0x3c) as usize;
        assert_eq!(read_u16(&bytes, pe_off + 4), 0xaa64);
        let opt = pe_off + 24;
        assert_eq!(read_u16(&bytes, opt), 0x20b);
        // pe32+ has no BaseOfData, image base is a u64 at offset 24
        assert_eq!(
            u64::from_le_bytes(bytes[opt + 24..opt + 32].try_into().unwrap()),
            0x400000
        );
        assert_eq!(read_u16(&bytes, opt + 68), 3);
    }

    #[test]
    fn test_long_section_names_use_string_table() {
        let dir = std::env::temp_dir().join("rtg-object-pe-names-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.exe");
        super::write_pe32(sample_image(), &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();

        let pe_off = read_u32(&bytes, 0x3c) as usize;
        let sect_table = pe_off + 24 + 224;
        // the 5th section header is .debug_abbrev, stored as "/4"
        let name = &bytes[sect_table + 4 * 40..sect_table + 4 * 40 + 8];
        assert_eq!(&name[0..2], b"/4");

        // resolve it through the string table
        let symtab_off = read_u32(&bytes, pe_off + 12) as usize;
        let nsyms = read_u32(&bytes, pe_off + 16) as usize;
        let strtab_off = symtab_off + nsyms * 18;
        let resolved = &bytes[strtab_off + 4..strtab_off + 4 + 13];
        assert_eq!(resolved, b".debug_abbrev");
    }
}
