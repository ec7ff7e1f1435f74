// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// executable container writers.
//
// every writer consumes the same 'ProgramImage': the finished code,
// rodata and data buffers plus the section-relative fixups the code
// generator could not resolve. the writer computes the final layout,
// patches the code (and, on targets with a fixed load address, the
// string headers inside the data buffer), assembles the container
// headers and writes the file with mode 0755.
//
// layout knowledge stays inside each writer; the shared pieces are the
// byte buffer, the fixup patching and the image type itself.

pub mod codesign;
pub mod elf;
pub mod macho;
pub mod pe;
pub mod wasm;

use std::io::Write;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// a pointer-sized slot reference the code generator left for the
/// container writer, named by logical section
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum SectRef {
    /// string bytes inside rodata that back a string header
    RodataHeader,
    /// an address inside the writable data section (globals and
    /// string headers)
    DataAddr,
    /// a GOT slot, by byte offset into the GOT
    GotAddr,
    /// an import-table slot, by symbol name
    Iat(String),
}

/// how the bytes at the fixup site are rewritten
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PatchKind {
    /// 8-byte absolute address (x86-64 mov reg, imm64)
    Abs64,
    /// 4-byte absolute address (i386 mov reg, imm32 / call [abs32])
    Abs32,
    /// arm64 adrp + add pc-relative pair
    AdrpAdd,
    /// arm64 adrp + ldr pc-relative pair
    AdrpLdr,
    /// arm64 4-instruction movz/movk absolute sequence
    MovSeq64,
}

#[derive(Debug, Clone)]
pub struct SectFixup {
    /// offset of the patchable field (or first instruction) in code
    pub at: usize,
    pub section: SectRef,
    /// raw offset relative to the start of the referenced section
    pub offset: u64,
    pub kind: PatchKind,
}

/// a string header whose data-pointer word is filled at link time on
/// fixed-address targets (elf, pe)
#[derive(Debug, Clone, Copy)]
pub struct StringHeader {
    /// offset of the header inside the data section
    pub data_offset: usize,
    /// offset of the string bytes inside rodata
    pub rodata_offset: usize,
}

#[derive(Debug, Clone)]
pub struct FuncSym {
    pub name: String,
    pub offset: usize,
}

/// everything the code generator hands to a container writer
#[derive(Debug)]
pub struct ProgramImage {
    pub code: Vec<u8>,
    pub rodata: Vec<u8>,
    pub data: Vec<u8>,
    /// code offset of the startup stub
    pub entry: usize,
    pub sect_fixups: Vec<SectFixup>,
    pub string_headers: Vec<StringHeader>,
    /// GOT slot symbols in slot order (mach-o)
    pub got_symbols: Vec<String>,
    /// import symbols in slot order (pe)
    pub iat_symbols: Vec<String>,
    /// compiled functions in emission order, for symbol tables
    pub funcs: Vec<FuncSym>,
}

impl Default for ProgramImage {
    fn default() -> Self {
        Self {
            code: Vec::new(),
            rodata: Vec::new(),
            data: Vec::new(),
            entry: 0,
            sect_fixups: Vec::new(),
            string_headers: Vec::new(),
            got_symbols: Vec::new(),
            iat_symbols: Vec::new(),
            funcs: Vec::new(),
        }
    }
}

/// apply the section fixups against the final virtual addresses.
/// 'text_va' is needed for the pc-relative arm64 pairs; 'resolve' maps
/// a section reference to the virtual address of its start (for Iat,
/// of the named slot itself).
pub fn patch_code(
    code: &mut [u8],
    fixups: &[SectFixup],
    text_va: u64,
    resolve: impl Fn(&SectRef) -> u64,
) {
    for fixup in fixups {
        let target = resolve(&fixup.section) + fixup.offset;
        match fixup.kind {
            PatchKind::Abs64 => rtg_asm::patch_u64(code, fixup.at, target),
            PatchKind::Abs32 => rtg_asm::patch_u32(code, fixup.at, target as u32),
            PatchKind::AdrpAdd => {
                rtg_asm::arm64::patch_adrp_add(code, fixup.at, text_va + fixup.at as u64, target)
            }
            PatchKind::AdrpLdr => {
                rtg_asm::arm64::patch_adrp_ldr(code, fixup.at, text_va + fixup.at as u64, target)
            }
            PatchKind::MovSeq64 => rtg_asm::arm64::patch_load_imm64(code, fixup.at, target),
        }
    }
}

/// fill the data-pointer word of every string header (fixed-address
/// targets only); 'word' is 4 or 8
pub fn patch_string_headers(data: &mut [u8], headers: &[StringHeader], rodata_va: u64, word: usize) {
    for header in headers {
        let ptr = rodata_va + header.rodata_offset as u64;
        if word == 8 {
            rtg_asm::patch_u64(data, header.data_offset, ptr);
        } else {
            rtg_asm::patch_u32(data, header.data_offset, ptr as u32);
        }
    }
}

pub fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// a little-endian byte builder, the common base of every writer
pub struct ByteBuffer {
    pub buf: Vec<u8>,
}

impl ByteBuffer {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    // the code-signature structures are the lone big-endian corner
    pub fn put_u32_be(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64_be(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// a fixed-width name field padded with zeros (section names etc.)
    pub fn put_fixed(&mut self, text: &[u8], width: usize) {
        let mut field = vec![0u8; width];
        field[..text.len()].copy_from_slice(text);
        self.buf.extend_from_slice(&field);
    }

    pub fn pad_to(&mut self, align: usize) {
        while self.buf.len() % align != 0 {
            self.buf.push(0);
        }
    }

    pub fn pad_to_pos(&mut self, pos: usize) {
        assert!(pos >= self.buf.len());
        self.buf.resize(pos, 0);
    }
}

/// write the finished bytes with the executable file mode
pub fn write_executable(path: &Path, bytes: &[u8]) -> Result<(), ObjectError> {
    let io_err = |source: std::io::Error| ObjectError::Io {
        path: path.display().to_string(),
        source,
    };

    let mut file = std::fs::File::create(path).map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(io_err)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{align_up, patch_code, patch_string_headers, PatchKind, SectFixup, SectRef};

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(0x201, 0x200), 0x400);
    }

    #[test]
    fn test_patch_code_abs() {
        let mut code = vec![0u8; 16];
        let fixups = vec![
            SectFixup {
                at: 0,
                section: SectRef::DataAddr,
                offset: 0x10,
                kind: PatchKind::Abs64,
            },
            SectFixup {
                at: 8,
                section: SectRef::RodataHeader,
                offset: 4,
                kind: PatchKind::Abs32,
            },
        ];
        patch_code(&mut code, &fixups, 0, |section| match section {
            SectRef::DataAddr => 0x404000,
            SectRef::RodataHeader => 0x402000,
            _ => 0,
        });
        assert_eq!(u64::from_le_bytes(code[0..8].try_into().unwrap()), 0x404010);
        assert_eq!(u32::from_le_bytes(code[8..12].try_into().unwrap()), 0x402004);
    }

    #[test]
    fn test_patch_string_headers() {
        let mut data = vec![0u8; 32];
        let headers = vec![crate::StringHeader {
            data_offset: 16,
            rodata_offset: 6,
        }];
        patch_string_headers(&mut data, &headers, 0x402000, 8);
        assert_eq!(
            u64::from_le_bytes(data[16..24].try_into().unwrap()),
            0x402006
        );

        let mut data = vec![0u8; 32];
        patch_string_headers(&mut data, &headers, 0x402000, 4);
        assert_eq!(
            u32::from_le_bytes(data[16..20].try_into().unwrap()),
            0x402006
        );
    }
}
