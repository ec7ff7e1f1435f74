// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// old-style static ELF executables: one RWX PT_LOAD segment mapping the
// whole file, absolute addresses, no relocations, no interpreter.
//
// the file layout is
//
//   | ehdr | phdr | pad16 | .text | .rodata | .data |
//   | .symtab | .strtab | .shstrtab | shdrs |
//
// everything up to and including .data is loaded; the symbol tables and
// section headers exist for debuggers only. e_type is ET_EXEC, the load
// address is fixed, so the string-header data pointers are final bytes
// in the file, there is nothing left for the runtime to do.

use std::path::Path;

use log::debug;

use crate::{
    align_up, patch_code, patch_string_headers, write_executable, ByteBuffer, ObjectError,
    ProgramImage, SectRef,
};

pub const ELF64_BASE: u64 = 0x400000;
pub const ELF32_BASE: u64 = 0x08048000;

const EM_X86_64: u16 = 62;
const EM_386: u16 = 3;

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;

const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;
const SHF_WRITE: u64 = 0x1;

// names laid out by hand, offsets into .shstrtab
const SHSTRTAB: &[u8] = b"\0.text\0.rodata\0.data\0.symtab\0.strtab\0.shstrtab\0";
const NAME_TEXT: u32 = 1;
const NAME_RODATA: u32 = 7;
const NAME_DATA: u32 = 15;
const NAME_SYMTAB: u32 = 21;
const NAME_STRTAB: u32 = 29;
const NAME_SHSTRTAB: u32 = 37;

struct Layout {
    text_off: usize,
    rodata_off: usize,
    data_off: usize,
    load_size: usize,
}

fn layout(image: &ProgramImage, headers_len: usize) -> Layout {
    let text_off = align_up(headers_len, 16);
    let rodata_off = align_up(text_off + image.code.len(), 16);
    let data_off = align_up(rodata_off + image.rodata.len(), 16);
    Layout {
        text_off,
        rodata_off,
        data_off,
        load_size: data_off + image.data.len(),
    }
}

/// function sizes from consecutive offsets, the last one runs to the
/// end of the code buffer
fn func_sizes(image: &ProgramImage) -> Vec<usize> {
    let mut sizes = Vec::with_capacity(image.funcs.len());
    for (i, func) in image.funcs.iter().enumerate() {
        let end = image
            .funcs
            .get(i + 1)
            .map(|next| next.offset)
            .unwrap_or(image.code.len());
        sizes.push(end - func.offset);
    }
    sizes
}

pub fn write_elf64(mut image: ProgramImage, path: &Path) -> Result<(), ObjectError> {
    let lay = layout(&image, 64 + 56);
    let text_va = ELF64_BASE + lay.text_off as u64;
    let rodata_va = ELF64_BASE + lay.rodata_off as u64;
    let data_va = ELF64_BASE + lay.data_off as u64;

    debug!(
        "elf64: text {:#x} rodata {:#x} data {:#x}",
        text_va, rodata_va, data_va
    );

    patch_code(&mut image.code, &image.sect_fixups, text_va, |section| {
        match section {
            SectRef::RodataHeader => rodata_va,
            SectRef::DataAddr => data_va,
            SectRef::GotAddr | SectRef::Iat(_) => 0,
        }
    });
    patch_string_headers(&mut image.data, &image.string_headers, rodata_va, 8);

    // build .strtab and the symbol entries first, the section headers
    // need their sizes
    let mut strtab: Vec<u8> = vec![0];
    let mut symtab = ByteBuffer::new();
    symtab.put_bytes(&[0u8; 24]); // index 0 is the null symbol
    let sizes = func_sizes(&image);
    for (func, size) in image.funcs.iter().zip(sizes.iter()) {
        let name_off = strtab.len() as u32;
        strtab.extend_from_slice(func.name.as_bytes());
        strtab.push(0);
        symtab.put_u32(name_off);
        symtab.put_u8(0x12); // global, func
        symtab.put_u8(0);
        symtab.put_u16(1); // .text
        symtab.put_u64(text_va + func.offset as u64);
        symtab.put_u64(*size as u64);
    }

    let symtab_off = lay.load_size;
    let strtab_off = symtab_off + symtab.buf.len();
    let shstrtab_off = strtab_off + strtab.len();
    let shoff = align_up(shstrtab_off + SHSTRTAB.len(), 8);

    let mut out = ByteBuffer::new();

    // ehdr
    out.put_bytes(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.put_bytes(&[0u8; 8]);
    out.put_u16(2); // ET_EXEC
    out.put_u16(EM_X86_64);
    out.put_u32(1);
    out.put_u64(text_va + image.entry as u64);
    out.put_u64(64); // phoff
    out.put_u64(shoff as u64);
    out.put_u32(0);
    out.put_u16(64); // ehsize
    out.put_u16(56); // phentsize
    out.put_u16(1);
    out.put_u16(64); // shentsize
    out.put_u16(7);
    out.put_u16(6); // shstrndx

    // the single PT_LOAD, mapping the file from offset 0
    out.put_u32(1); // PT_LOAD
    out.put_u32(7); // rwx
    out.put_u64(0);
    out.put_u64(ELF64_BASE);
    out.put_u64(ELF64_BASE);
    out.put_u64(lay.load_size as u64);
    out.put_u64(lay.load_size as u64);
    out.put_u64(0x1000);

    out.pad_to_pos(lay.text_off);
    out.put_bytes(&image.code);
    out.pad_to_pos(lay.rodata_off);
    out.put_bytes(&image.rodata);
    out.pad_to_pos(lay.data_off);
    out.put_bytes(&image.data);

    out.put_bytes(&symtab.buf);
    out.put_bytes(&strtab);
    out.put_bytes(&SHSTRTAB.to_vec());
    out.pad_to_pos(shoff);

    let shdr = |out: &mut ByteBuffer,
                name: u32,
                kind: u32,
                flags: u64,
                addr: u64,
                off: usize,
                size: usize,
                link: u32,
                info: u32,
                entsize: u64| {
        out.put_u32(name);
        out.put_u32(kind);
        out.put_u64(flags);
        out.put_u64(addr);
        out.put_u64(off as u64);
        out.put_u64(size as u64);
        out.put_u32(link);
        out.put_u32(info);
        out.put_u64(16);
        out.put_u64(entsize);
    };

    shdr(&mut out, 0, 0, 0, 0, 0, 0, 0, 0, 0);
    shdr(
        &mut out,
        NAME_TEXT,
        SHT_PROGBITS,
        SHF_ALLOC | SHF_EXECINSTR,
        text_va,
        lay.text_off,
        image.code.len(),
        0,
        0,
        0,
    );
    shdr(
        &mut out,
        NAME_RODATA,
        SHT_PROGBITS,
        SHF_ALLOC,
        rodata_va,
        lay.rodata_off,
        image.rodata.len(),
        0,
        0,
        0,
    );
    shdr(
        &mut out,
        NAME_DATA,
        SHT_PROGBITS,
        SHF_ALLOC | SHF_WRITE,
        data_va,
        lay.data_off,
        image.data.len(),
        0,
        0,
        0,
    );
    shdr(
        &mut out,
        NAME_SYMTAB,
        SHT_SYMTAB,
        0,
        0,
        symtab_off,
        symtab.buf.len(),
        5,
        1, // first non-local symbol index
        24,
    );
    shdr(
        &mut out, NAME_STRTAB, SHT_STRTAB, 0, 0, strtab_off, strtab.len(), 0, 0, 0,
    );
    shdr(
        &mut out,
        NAME_SHSTRTAB,
        SHT_STRTAB,
        0,
        0,
        shstrtab_off,
        SHSTRTAB.len(),
        0,
        0,
        0,
    );

    write_executable(path, &out.buf)
}

pub fn write_elf32(mut image: ProgramImage, path: &Path) -> Result<(), ObjectError> {
    let lay = layout(&image, 52 + 32);
    let text_va = ELF32_BASE + lay.text_off as u64;
    let rodata_va = ELF32_BASE + lay.rodata_off as u64;
    let data_va = ELF32_BASE + lay.data_off as u64;

    debug!(
        "elf32: text {:#x} rodata {:#x} data {:#x}",
        text_va, rodata_va, data_va
    );

    patch_code(&mut image.code, &image.sect_fixups, text_va, |section| {
        match section {
            SectRef::RodataHeader => rodata_va,
            SectRef::DataAddr => data_va,
            SectRef::GotAddr | SectRef::Iat(_) => 0,
        }
    });
    patch_string_headers(&mut image.data, &image.string_headers, rodata_va, 4);

    let mut strtab: Vec<u8> = vec![0];
    let mut symtab = ByteBuffer::new();
    symtab.put_bytes(&[0u8; 16]);
    let sizes = func_sizes(&image);
    for (func, size) in image.funcs.iter().zip(sizes.iter()) {
        let name_off = strtab.len() as u32;
        strtab.extend_from_slice(func.name.as_bytes());
        strtab.push(0);
        symtab.put_u32(name_off);
        symtab.put_u32((text_va + func.offset as u64) as u32);
        symtab.put_u32(*size as u32);
        symtab.put_u8(0x12);
        symtab.put_u8(0);
        symtab.put_u16(1);
    }

    let symtab_off = lay.load_size;
    let strtab_off = symtab_off + symtab.buf.len();
    let shstrtab_off = strtab_off + strtab.len();
    let shoff = align_up(shstrtab_off + SHSTRTAB.len(), 4);

    let mut out = ByteBuffer::new();

    out.put_bytes(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
    out.put_bytes(&[0u8; 8]);
    out.put_u16(2); // ET_EXEC
    out.put_u16(EM_386);
    out.put_u32(1);
    out.put_u32((text_va + image.entry as u64) as u32);
    out.put_u32(52); // phoff
    out.put_u32(shoff as u32);
    out.put_u32(0);
    out.put_u16(52);
    out.put_u16(32);
    out.put_u16(1);
    out.put_u16(40);
    out.put_u16(7);
    out.put_u16(6);

    out.put_u32(1); // PT_LOAD
    out.put_u32(0);
    out.put_u32(ELF32_BASE as u32);
    out.put_u32(ELF32_BASE as u32);
    out.put_u32(lay.load_size as u32);
    out.put_u32(lay.load_size as u32);
    out.put_u32(7); // rwx
    out.put_u32(0x1000);

    out.pad_to_pos(lay.text_off);
    out.put_bytes(&image.code);
    out.pad_to_pos(lay.rodata_off);
    out.put_bytes(&image.rodata);
    out.pad_to_pos(lay.data_off);
    out.put_bytes(&image.data);

    out.put_bytes(&symtab.buf);
    out.put_bytes(&strtab);
    out.put_bytes(&SHSTRTAB.to_vec());
    out.pad_to_pos(shoff);

    let shdr = |out: &mut ByteBuffer,
                name: u32,
                kind: u32,
                flags: u32,
                addr: u32,
                off: usize,
                size: usize,
                link: u32,
                info: u32,
                entsize: u32| {
        out.put_u32(name);
        out.put_u32(kind);
        out.put_u32(flags);
        out.put_u32(addr);
        out.put_u32(off as u32);
        out.put_u32(size as u32);
        out.put_u32(link);
        out.put_u32(info);
        out.put_u32(4);
        out.put_u32(entsize);
    };

    shdr(&mut out, 0, 0, 0, 0, 0, 0, 0, 0, 0);
    shdr(
        &mut out,
        NAME_TEXT,
        SHT_PROGBITS,
        (SHF_ALLOC | SHF_EXECINSTR) as u32,
        text_va as u32,
        lay.text_off,
        image.code.len(),
        0,
        0,
        0,
    );
    shdr(
        &mut out,
        NAME_RODATA,
        SHT_PROGBITS,
        SHF_ALLOC as u32,
        rodata_va as u32,
        lay.rodata_off,
        image.rodata.len(),
        0,
        0,
        0,
    );
    shdr(
        &mut out,
        NAME_DATA,
        SHT_PROGBITS,
        (SHF_ALLOC | SHF_WRITE) as u32,
        data_va as u32,
        lay.data_off,
        image.data.len(),
        0,
        0,
        0,
    );
    shdr(
        &mut out,
        NAME_SYMTAB,
        SHT_SYMTAB,
        0,
        0,
        symtab_off,
        symtab.buf.len(),
        5,
        1,
        16,
    );
    shdr(
        &mut out, NAME_STRTAB, SHT_STRTAB, 0, 0, strtab_off, strtab.len(), 0, 0, 0,
    );
    shdr(
        &mut out,
        NAME_SHSTRTAB,
        SHT_STRTAB,
        0,
        0,
        shstrtab_off,
        SHSTRTAB.len(),
        0,
        0,
        0,
    );

    write_executable(path, &out.buf)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{FuncSym, ProgramImage, SectFixup, SectRef, StringHeader};

    fn sample_image() -> ProgramImage {
        ProgramImage {
            // mov rax, imm64 with the header address to be patched
            code: vec![0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0xc3],
            rodata: b"hello\n".to_vec(),
            data: vec![0u8; 16],
            entry: 0,
            sect_fixups: vec![SectFixup {
                at: 2,
                section: SectRef::DataAddr,
                offset: 0,
                kind: crate::PatchKind::Abs64,
            }],
            string_headers: vec![StringHeader {
                data_offset: 0,
                rodata_offset: 0,
            }],
            got_symbols: vec![],
            iat_symbols: vec![],
            funcs: vec![FuncSym {
                name: "main.main".to_owned(),
                offset: 0,
            }],
        }
    }

    #[test]
    fn test_elf64_header_fields() {
        let dir = std::env::temp_dir().join("rtg-object-elf64-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out");
        super::write_elf64(sample_image(), &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();

        assert_eq!(&bytes[0..4], b"\x7fELF");
        assert_eq!(bytes[4], 2); // 64-bit
        assert_eq!(u16::from_le_bytes([bytes[16], bytes[17]]), 2); // ET_EXEC
        assert_eq!(u16::from_le_bytes([bytes[18], bytes[19]]), 62); // x86-64

        // entry points at the start of .text, which follows the padded headers
        let entry = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        assert_eq!(entry, 0x400080);

        // code fixup got the header's virtual address (.data start)
        let patched = u64::from_le_bytes(bytes[0x80 + 2..0x80 + 10].try_into().unwrap());
        assert_eq!(patched, 0x4000a0);

        // the string header's data pointer points into .rodata
        let header_ptr = u64::from_le_bytes(bytes[0xa0..0xa8].try_into().unwrap());
        assert_eq!(header_ptr, 0x400090);
        assert_eq!(&bytes[0x90..0x96], b"hello\n");
    }

    #[test]
    fn test_elf32_header_fields() {
        let dir = std::env::temp_dir().join("rtg-object-elf32-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out");
        let mut image = sample_image();
        image.code = vec![0xb8, 0, 0, 0, 0, 0xc3];
        image.sect_fixups[0].at = 1;
        image.sect_fixups[0].kind = crate::PatchKind::Abs32;
        super::write_elf32(image, &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();

        assert_eq!(bytes[4], 1); // 32-bit
        assert_eq!(u16::from_le_bytes([bytes[18], bytes[19]]), 3); // EM_386
        let entry = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        assert_eq!(entry, 0x08048060);
    }
}
