// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// i386 code generator, shared between linux/386 and windows/386.
//
// register assignment:
//
//   edi        operand-stack top pointer (grows down)
//   ebp / esp  frame pointer / machine stack
//   eax ecx edx ebx  scratch
//
// linux OS intrinsics go through int 0x80 with the -errno return
// convention. windows intrinsics call kernel32 through the import
// address table; because the stdcall sequences need more values alive
// than i386 has registers, a small scratch area in the data section
// (fixed addresses, single-threaded by design) carries buffers,
// lengths and the bytes-written out-parameter.
//
// both flavours load at a fixed base, so section references are
// 4-byte absolute immediates patched by the container writer.

use std::collections::HashMap;
use std::path::Path;

use log::debug;

use rtg_asm::x86::{patch_rel32, Cond, Emitter, Reg};
use rtg_ir::literal::{decode_string_literal, is_init_func};
use rtg_ir::opcode::Opcode;
use rtg_ir::{IRFunc, IRModule, Inst, TYPE_ID_INT, TYPE_ID_STRING};
use rtg_object::{
    align_up, elf, pe, FuncSym, PatchKind, ProgramImage, SectFixup, SectRef, StringHeader,
};

use crate::{
    intrinsic_argc, tostring_impls, BranchFixup, CallFixup, CodeGenError, Generated, StringPool,
    ENOSYS, RESERVED_GLOBALS,
};

const WORD: usize = 4;
const LINUX_STACK_SIZE: i64 = 1 << 20; // 1 MiB
const WINDOWS_STACK_SIZE: i64 = 16 << 20; // 16 MiB

// linux i386 syscall numbers
const SYS_EXIT: i64 = 1;
const SYS_FORK: i64 = 2;
const SYS_READ: i64 = 3;
const SYS_WRITE: i64 = 4;
const SYS_OPEN: i64 = 5;
const SYS_CLOSE: i64 = 6;
const SYS_UNLINK: i64 = 10;
const SYS_EXECVE: i64 = 11;
const SYS_CHMOD: i64 = 15;
const SYS_GETPID: i64 = 20;
const SYS_MKDIR: i64 = 39;
const SYS_RMDIR: i64 = 40;
const SYS_PIPE: i64 = 42;
const SYS_DUP2: i64 = 63;
const SYS_WAIT4: i64 = 114;
const SYS_GETCWD: i64 = 183;
const SYS_MMAP2: i64 = 192;

// windows scratch slots, word offsets past the reserved globals
const SCRATCH_BUF: usize = 0;
const SCRATCH_LEN: usize = 1;
const SCRATCH_HANDLE: usize = 2;
const SCRATCH_OUT: usize = 3;
const SCRATCH_SLOTS: usize = 4;

#[derive(Debug, PartialEq, Clone, Copy)]
enum Os {
    Linux,
    Windows,
}

struct X86Codegen<'a> {
    module: &'a IRModule,
    os: Os,
    asm: Emitter,
    rodata: Vec<u8>,
    data: Vec<u8>,
    strings: StringPool,
    func_offsets: HashMap<String, usize>,
    funcs: Vec<FuncSym>,
    call_fixups: Vec<CallFixup>,
    sect_fixups: Vec<SectFixup>,
    string_headers: Vec<StringHeader>,
    iat_symbols: Vec<String>,

    branch_fixups: Vec<BranchFixup>,
    label_offsets: HashMap<i64, usize>,
    pending: Option<Reg>,
    cur_func: String,
    cur_pitch: usize,
    newline: Option<usize>,
}

impl<'a> X86Codegen<'a> {
    fn new(module: &'a IRModule, os: Os) -> Self {
        let mut data_words = module.globals + RESERVED_GLOBALS;
        if os == Os::Windows {
            data_words += SCRATCH_SLOTS;
        }
        Self {
            module,
            os,
            asm: Emitter::new(),
            rodata: Vec::new(),
            data: vec![0u8; data_words * WORD],
            strings: StringPool::new(WORD),
            func_offsets: HashMap::new(),
            funcs: Vec::new(),
            call_fixups: Vec::new(),
            sect_fixups: Vec::new(),
            string_headers: Vec::new(),
            iat_symbols: Vec::new(),
            branch_fixups: Vec::new(),
            label_offsets: HashMap::new(),
            pending: None,
            cur_func: String::new(),
            cur_pitch: WORD,
            newline: None,
        }
    }

    //
    // operand stack
    //

    fn emit_push(&mut self, reg: Reg) {
        self.asm.store_mem(Reg::Edi, -(WORD as i32), reg, 4);
        self.asm.sub_ri(Reg::Edi, WORD as i32);
    }

    fn push_pending(&mut self, reg: Reg) {
        self.flush();
        self.pending = Some(reg);
    }

    fn flush(&mut self) {
        if let Some(reg) = self.pending.take() {
            self.emit_push(reg);
        }
    }

    fn pop_reg(&mut self, reg: Reg) {
        if let Some(pending) = self.pending.take() {
            if pending != reg {
                self.asm.mov_rr(reg, pending);
            }
        } else {
            self.asm.load_mem(reg, Reg::Edi, 0, 4);
            self.asm.add_ri(Reg::Edi, WORD as i32);
        }
    }

    //
    // section references
    //

    fn data_fixup(&mut self, field: usize, offset: usize) {
        self.sect_fixups.push(SectFixup {
            at: field,
            section: SectRef::DataAddr,
            offset: offset as u64,
            kind: PatchKind::Abs32,
        });
    }

    fn load_data_addr(&mut self, reg: Reg, offset: usize) {
        let field = self.asm.mov_ri32(reg, 0);
        self.data_fixup(field, offset);
    }

    fn load_rodata_addr(&mut self, reg: Reg, offset: usize) {
        let field = self.asm.mov_ri32(reg, 0);
        self.sect_fixups.push(SectFixup {
            at: field,
            section: SectRef::RodataHeader,
            offset: offset as u64,
            kind: PatchKind::Abs32,
        });
    }

    fn scratch_offset(&self, slot: usize) -> usize {
        (self.module.globals + RESERVED_GLOBALS + slot) * WORD
    }

    fn store_scratch(&mut self, slot: usize, reg: Reg) {
        let field = self.asm.store_abs(reg);
        let offset = self.scratch_offset(slot);
        self.data_fixup(field, offset);
    }

    fn load_scratch(&mut self, slot: usize, reg: Reg) {
        let field = self.asm.load_abs(reg);
        let offset = self.scratch_offset(slot);
        self.data_fixup(field, offset);
    }

    fn push_scratch_addr(&mut self, slot: usize) {
        let field = self.asm.push_imm32(0);
        let offset = self.scratch_offset(slot);
        self.data_fixup(field, offset);
    }

    fn call_func(&mut self, name: &str) {
        self.flush();
        let at = self.asm.call_rel32();
        self.call_fixups.push(CallFixup {
            at,
            name: name.to_owned(),
        });
    }

    /// call through the import address table, registering the symbol
    fn iat_call(&mut self, symbol: &str) {
        if !self.iat_symbols.iter().any(|existing| existing == symbol) {
            self.iat_symbols.push(symbol.to_owned());
        }
        let field = self.asm.call_mem_abs();
        self.sect_fixups.push(SectFixup {
            at: field,
            section: SectRef::Iat(symbol.to_owned()),
            offset: 0,
            kind: PatchKind::Abs32,
        });
    }

    //
    // entry stub
    //

    fn emit_entry_stub(&mut self) {
        match self.os {
            Os::Linux => self.emit_linux_startup(),
            Os::Windows => self.emit_windows_startup(),
        }

        let inits: Vec<String> = self
            .module
            .funcs
            .iter()
            .filter(|func| is_init_func(&func.name))
            .map(|func| func.name.clone())
            .collect();
        for name in inits {
            self.call_func(&name);
        }
        self.call_func("main.main");

        match self.os {
            Os::Linux => {
                self.asm.mov_ri32(Reg::Ebx, 0);
                self.asm.mov_ri32(Reg::Eax, SYS_EXIT as u32);
                self.asm.int80();
            }
            Os::Windows => {
                self.asm.push_imm32(0);
                self.iat_call("ExitProcess");
            }
        }
    }

    fn emit_linux_startup(&mut self) {
        let argc_slot = self.module.globals * WORD;

        self.asm.load_mem(Reg::Eax, Reg::Esp, 0, 4);
        self.load_data_addr(Reg::Ecx, argc_slot);
        self.asm.store_mem(Reg::Ecx, 0, Reg::Eax, 4);
        self.asm.lea(Reg::Edx, Reg::Esp, WORD as i32);
        self.asm.store_mem(Reg::Ecx, WORD as i32, Reg::Edx, 4);
        // envp = esp + (argc + 2) * 4
        self.asm.mov_rr(Reg::Edx, Reg::Eax);
        self.asm.shl_imm8(Reg::Edx, 2);
        self.asm.add_rr(Reg::Edx, Reg::Esp);
        self.asm.add_ri(Reg::Edx, 2 * WORD as i32);
        self.asm.store_mem(Reg::Ecx, 2 * WORD as i32, Reg::Edx, 4);

        // operand stack: mmap2(0, 1 MiB, rw, private|anonymous, -1, 0)
        self.asm.mov_ri32(Reg::Ebx, 0);
        self.asm.mov_ri32(Reg::Ecx, LINUX_STACK_SIZE as u32);
        self.asm.mov_ri32(Reg::Edx, 3);
        self.asm.mov_ri32(Reg::Esi, 0x22);
        self.asm.mov_ri32(Reg::Edi, -1i32 as u32);
        self.asm.mov_ri32(Reg::Ebp, 0);
        self.asm.mov_ri32(Reg::Eax, SYS_MMAP2 as u32);
        self.asm.int80();
        self.asm.mov_rr(Reg::Edi, Reg::Eax);
        self.asm.add_ri(Reg::Edi, LINUX_STACK_SIZE as i32);
    }

    fn emit_windows_startup(&mut self) {
        // VirtualAlloc(0, 16 MiB, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        self.asm.push_imm32(4);
        self.asm.push_imm32(0x3000);
        self.asm.push_imm32(WINDOWS_STACK_SIZE as u32);
        self.asm.push_imm32(0);
        self.iat_call("VirtualAlloc");
        self.asm.mov_rr(Reg::Edi, Reg::Eax);
        self.asm.add_ri(Reg::Edi, WINDOWS_STACK_SIZE as i32);
        // the reserved argc/argv/envp slots stay zero on windows
    }

    //
    // functions
    //

    fn compile_func(&mut self, func: &IRFunc) -> Result<(), CodeGenError> {
        let offset = self.asm.pos();
        self.func_offsets.insert(func.name.clone(), offset);
        self.funcs.push(FuncSym {
            name: func.name.clone(),
            offset,
        });

        self.branch_fixups.clear();
        self.label_offsets.clear();
        self.pending = None;
        self.cur_func = func.name.clone();

        let widest = func
            .locals
            .iter()
            .map(|local| if local.width == 0 { WORD } else { local.width as usize })
            .max()
            .unwrap_or(WORD);
        let pitch = WORD.max(widest);
        self.cur_pitch = pitch;
        let slots = func.params.max(func.locals.len());
        let frame = align_up(slots * pitch, 16);

        self.asm.push(Reg::Ebp);
        self.asm.mov_rr(Reg::Ebp, Reg::Esp);
        if frame > 0 {
            self.asm.sub_ri(Reg::Esp, frame as i32);
        }

        for index in (0..func.params).rev() {
            self.pop_reg(Reg::Eax);
            let disp = self.local_disp(index);
            self.asm.store_mem(Reg::Ebp, disp, Reg::Eax, 4);
        }

        for inst in &func.insts {
            self.lower_inst(func, inst)?;
        }

        debug_assert!(self.pending.is_none());

        for fixup in std::mem::take(&mut self.branch_fixups) {
            let target = *self.label_offsets.get(&fixup.label).ok_or_else(|| {
                CodeGenError::UnknownLabel {
                    func: func.name.clone(),
                    label: fixup.label,
                }
            })?;
            patch_rel32(&mut self.asm.buf, fixup.at, target);
        }
        Ok(())
    }

    fn local_disp(&self, index: usize) -> i32 {
        -(((index + 1) * self.cur_pitch) as i32)
    }

    fn local_width(&self, func: &IRFunc, index: usize) -> u8 {
        match func.locals.get(index) {
            Some(local) if local.width != 0 => local.width,
            _ => 4,
        }
    }

    fn width_of(width: u8) -> u8 {
        if width == 0 || width > 4 {
            4
        } else {
            width
        }
    }

    fn lower_inst(&mut self, func: &IRFunc, inst: &Inst) -> Result<(), CodeGenError> {
        match inst.opcode {
            Opcode::const_i64 | Opcode::const_bool => {
                // 64-bit literals truncate to the 32-bit word
                self.asm.mov_ri32(Reg::Eax, inst.value as u32);
                self.push_pending(Reg::Eax);
            }
            Opcode::const_nil => {
                self.asm.mov_ri32(Reg::Eax, 0);
                self.push_pending(Reg::Eax);
            }
            Opcode::const_str => {
                let raw = inst.name.as_deref().unwrap_or("");
                let bytes = decode_string_literal(raw);
                let (header, rodata_off) =
                    self.strings
                        .intern(bytes, &mut self.rodata, &mut self.data);
                self.string_headers.push(StringHeader {
                    data_offset: header,
                    rodata_offset: rodata_off,
                });
                self.load_data_addr(Reg::Eax, header);
                self.push_pending(Reg::Eax);
            }

            Opcode::local_get => {
                let index = inst.arg as usize;
                let width = self.local_width(func, index);
                let disp = self.local_disp(index);
                self.asm.load_mem(Reg::Eax, Reg::Ebp, disp, width);
                self.push_pending(Reg::Eax);
            }
            Opcode::local_set => {
                let index = inst.arg as usize;
                let width = self.local_width(func, index);
                let disp = self.local_disp(index);
                self.pop_reg(Reg::Eax);
                self.asm.store_mem(Reg::Ebp, disp, Reg::Eax, width);
            }
            Opcode::local_addr => {
                let disp = self.local_disp(inst.arg as usize);
                self.asm.lea(Reg::Eax, Reg::Ebp, disp);
                self.push_pending(Reg::Eax);
            }

            Opcode::global_get => {
                let offset = inst.arg as usize * WORD;
                self.load_data_addr(Reg::Ecx, offset);
                self.asm.load_mem(Reg::Eax, Reg::Ecx, 0, 4);
                self.push_pending(Reg::Eax);
            }
            Opcode::global_set => {
                let offset = inst.arg as usize * WORD;
                self.pop_reg(Reg::Eax);
                self.load_data_addr(Reg::Ecx, offset);
                self.asm.store_mem(Reg::Ecx, 0, Reg::Eax, 4);
            }
            Opcode::global_addr => {
                let offset = inst.arg as usize * WORD;
                self.load_data_addr(Reg::Eax, offset);
                self.push_pending(Reg::Eax);
            }

            Opcode::drop => {
                if self.pending.take().is_none() {
                    self.asm.add_ri(Reg::Edi, WORD as i32);
                }
            }
            Opcode::dup => {
                self.pop_reg(Reg::Eax);
                self.emit_push(Reg::Eax);
                self.push_pending(Reg::Eax);
            }

            Opcode::add | Opcode::sub | Opcode::mul | Opcode::and | Opcode::or | Opcode::xor => {
                self.pop_reg(Reg::Ecx);
                self.pop_reg(Reg::Eax);
                match inst.opcode {
                    Opcode::add => self.asm.add_rr(Reg::Eax, Reg::Ecx),
                    Opcode::sub => self.asm.sub_rr(Reg::Eax, Reg::Ecx),
                    Opcode::mul => self.asm.imul_rr(Reg::Eax, Reg::Ecx),
                    Opcode::and => self.asm.and_rr(Reg::Eax, Reg::Ecx),
                    Opcode::or => self.asm.or_rr(Reg::Eax, Reg::Ecx),
                    _ => self.asm.xor_rr(Reg::Eax, Reg::Ecx),
                }
                self.push_pending(Reg::Eax);
            }
            Opcode::div | Opcode::mod_ => {
                self.pop_reg(Reg::Ecx);
                self.pop_reg(Reg::Eax);
                self.asm.cdq();
                self.asm.idiv(Reg::Ecx);
                let result = if inst.opcode == Opcode::div {
                    Reg::Eax
                } else {
                    Reg::Edx
                };
                self.push_pending(result);
            }
            Opcode::neg => {
                self.pop_reg(Reg::Eax);
                self.asm.neg(Reg::Eax);
                self.push_pending(Reg::Eax);
            }
            Opcode::not => {
                self.pop_reg(Reg::Eax);
                self.asm.not(Reg::Eax);
                self.push_pending(Reg::Eax);
            }
            Opcode::shl | Opcode::shr => {
                self.pop_reg(Reg::Ecx);
                self.pop_reg(Reg::Eax);
                if inst.opcode == Opcode::shl {
                    self.asm.shl_cl(Reg::Eax);
                } else {
                    self.asm.sar_cl(Reg::Eax);
                }
                self.push_pending(Reg::Eax);
            }

            Opcode::eq | Opcode::neq | Opcode::lt | Opcode::gt | Opcode::leq | Opcode::geq => {
                self.pop_reg(Reg::Ecx);
                self.pop_reg(Reg::Eax);
                self.asm.cmp_rr(Reg::Eax, Reg::Ecx);
                let cond = match inst.opcode {
                    Opcode::eq => Cond::Eq,
                    Opcode::neq => Cond::Ne,
                    Opcode::lt => Cond::Lt,
                    Opcode::gt => Cond::Gt,
                    Opcode::leq => Cond::Le,
                    _ => Cond::Ge,
                };
                self.asm.set_cond(cond, Reg::Eax);
                self.push_pending(Reg::Eax);
            }

            Opcode::label => {
                self.flush();
                self.label_offsets.insert(inst.arg, self.asm.pos());
            }
            Opcode::jmp => {
                self.flush();
                let at = self.asm.jmp_rel32();
                self.branch_fixups.push(BranchFixup {
                    at,
                    label: inst.arg,
                });
            }
            Opcode::jmp_if | Opcode::jmp_if_not => {
                self.pop_reg(Reg::Eax);
                self.flush();
                self.asm.test_rr(Reg::Eax, Reg::Eax);
                let cond = if inst.opcode == Opcode::jmp_if {
                    Cond::Ne
                } else {
                    Cond::Eq
                };
                let at = self.asm.jcc_rel32(cond);
                self.branch_fixups.push(BranchFixup {
                    at,
                    label: inst.arg,
                });
            }

            Opcode::call => {
                let name = inst.name.as_deref().unwrap_or("");
                if let Some(fields) = IRModule::composite_field_count(name) {
                    self.lower_composite(fields);
                } else {
                    self.call_func(name);
                }
            }
            Opcode::call_intrinsic => {
                let name = inst.name.clone().unwrap_or_default();
                self.lower_intrinsic(&name)?;
            }
            Opcode::return_ => {
                self.flush();
                self.asm.mov_rr(Reg::Esp, Reg::Ebp);
                self.asm.pop(Reg::Ebp);
                self.asm.ret();
            }

            Opcode::load => {
                let width = Self::width_of(inst.width);
                self.pop_reg(Reg::Eax);
                self.asm.mov_ri32(Reg::Ecx, 0);
                self.asm.test_rr(Reg::Eax, Reg::Eax);
                let skip = self.asm.jcc_rel32(Cond::Eq);
                self.asm.load_mem(Reg::Ecx, Reg::Eax, 0, width);
                let here = self.asm.pos();
                patch_rel32(&mut self.asm.buf, skip, here);
                self.push_pending(Reg::Ecx);
            }
            Opcode::store => {
                let width = Self::width_of(inst.width);
                self.pop_reg(Reg::Ecx);
                self.pop_reg(Reg::Eax);
                self.asm.store_mem(Reg::Eax, 0, Reg::Ecx, width);
            }
            Opcode::offset => {
                self.pop_reg(Reg::Eax);
                self.asm.add_ri(Reg::Eax, inst.arg as i32);
                self.push_pending(Reg::Eax);
            }
            Opcode::index_addr => {
                self.pop_reg(Reg::Ecx);
                self.pop_reg(Reg::Eax);
                self.asm.load_mem(Reg::Eax, Reg::Eax, 0, 4);
                match inst.value {
                    1 => {}
                    4 => self.asm.shl_imm8(Reg::Ecx, 2),
                    8 => self.asm.shl_imm8(Reg::Ecx, 3),
                    size => {
                        self.asm.mov_ri32(Reg::Edx, size as u32);
                        self.asm.imul_rr(Reg::Ecx, Reg::Edx);
                    }
                }
                self.asm.add_rr(Reg::Eax, Reg::Ecx);
                self.push_pending(Reg::Eax);
            }
            Opcode::len => {
                self.pop_reg(Reg::Eax);
                self.asm.mov_ri32(Reg::Ecx, 0);
                self.asm.test_rr(Reg::Eax, Reg::Eax);
                let skip = self.asm.jcc_rel32(Cond::Eq);
                self.asm.load_mem(Reg::Ecx, Reg::Eax, WORD as i32, 4);
                let here = self.asm.pos();
                patch_rel32(&mut self.asm.buf, skip, here);
                self.push_pending(Reg::Ecx);
            }

            Opcode::convert => {
                let name = inst.name.clone().unwrap_or_default();
                self.lower_convert(&name)?;
            }

            Opcode::iface_box => self.lower_iface_box(inst.value),
            Opcode::iface_call => {
                let name = inst.name.clone().unwrap_or_default();
                self.lower_iface_call(&name, inst.arg as usize)?;
            }

            Opcode::panic => self.lower_panic(),
        }
        Ok(())
    }

    fn lower_convert(&mut self, name: &str) -> Result<(), CodeGenError> {
        match name {
            "string" => self.call_func("runtime.BytesToString"),
            "[]byte" => self.call_func("runtime.StringToBytes"),
            // int64/uint64 silently truncate to the 32-bit word here
            "int" | "uint" | "uintptr" | "int64" | "uint64" | "int32" | "uint32" => {}
            "byte" | "uint8" => {
                self.pop_reg(Reg::Eax);
                self.asm.movzx(Reg::Eax, Reg::Eax, 1);
                self.push_pending(Reg::Eax);
            }
            "uint16" => {
                self.pop_reg(Reg::Eax);
                self.asm.movzx(Reg::Eax, Reg::Eax, 2);
                self.push_pending(Reg::Eax);
            }
            other => {
                return Err(CodeGenError::UnknownConvert {
                    func: self.cur_func.clone(),
                    name: other.to_owned(),
                })
            }
        }
        Ok(())
    }

    fn lower_composite(&mut self, fields: usize) {
        self.flush();
        for _ in 0..fields {
            self.pop_reg(Reg::Eax);
            self.asm.push(Reg::Eax);
        }
        self.asm.mov_ri32(Reg::Eax, (fields * WORD) as u32);
        self.emit_push(Reg::Eax);
        self.call_func("runtime.Alloc");
        self.pop_reg(Reg::Eax);
        for index in 0..fields {
            self.asm.pop(Reg::Ecx);
            self.asm
                .store_mem(Reg::Eax, (index * WORD) as i32, Reg::Ecx, 4);
        }
        self.push_pending(Reg::Eax);
    }

    fn lower_iface_box(&mut self, type_id: i64) {
        self.pop_reg(Reg::Eax);
        self.flush();
        self.asm.push(Reg::Eax);
        self.asm.mov_ri32(Reg::Eax, (2 * WORD) as u32);
        self.emit_push(Reg::Eax);
        self.call_func("runtime.Alloc");
        self.pop_reg(Reg::Eax);
        self.asm.mov_ri32(Reg::Ecx, type_id as u32);
        self.asm.store_mem(Reg::Eax, 0, Reg::Ecx, 4);
        self.asm.pop(Reg::Ecx);
        self.asm.store_mem(Reg::Eax, WORD as i32, Reg::Ecx, 4);
        self.push_pending(Reg::Eax);
    }

    fn lower_iface_call(&mut self, name: &str, argc: usize) -> Result<(), CodeGenError> {
        let bare = name.rsplit('.').next().unwrap_or(name);
        let impls = self.module.method_impls(bare);
        if impls.is_empty() {
            return Err(CodeGenError::EmptyDispatch {
                name: name.to_owned(),
            });
        }

        self.flush();
        for _ in 0..argc {
            self.pop_reg(Reg::Eax);
            self.asm.push(Reg::Eax);
        }
        // ebx keeps the type id across the re-push (eax/ecx only)
        self.pop_reg(Reg::Eax);
        self.asm.load_mem(Reg::Ebx, Reg::Eax, 0, 4);
        self.asm.load_mem(Reg::Ecx, Reg::Eax, WORD as i32, 4);
        self.emit_push(Reg::Ecx);
        for _ in 0..argc {
            self.asm.pop(Reg::Ecx);
            self.emit_push(Reg::Ecx);
        }

        let mut done: Vec<usize> = Vec::new();
        for (type_id, impl_name) in impls {
            self.asm.cmp_ri(Reg::Ebx, type_id as i32);
            let next = self.asm.jcc_rel32(Cond::Ne);
            self.call_func(&impl_name);
            done.push(self.asm.jmp_rel32());
            let here = self.asm.pos();
            patch_rel32(&mut self.asm.buf, next, here);
        }
        self.asm.int3();

        let here = self.asm.pos();
        for field in done {
            patch_rel32(&mut self.asm.buf, field, here);
        }
        Ok(())
    }

    fn lower_tostring(&mut self) {
        self.pop_reg(Reg::Eax);
        self.flush();
        self.asm.load_mem(Reg::Ebx, Reg::Eax, 0, 4);

        self.asm.cmp_ri(Reg::Ebx, 256);
        let not_header = self.asm.jcc_rel32(Cond::Lt);
        self.emit_push(Reg::Eax);
        let mut done = vec![self.asm.jmp_rel32()];
        let here = self.asm.pos();
        patch_rel32(&mut self.asm.buf, not_header, here);

        self.asm.cmp_ri(Reg::Ebx, TYPE_ID_INT as i32);
        let not_int = self.asm.jcc_rel32(Cond::Ne);
        self.asm.load_mem(Reg::Ecx, Reg::Eax, WORD as i32, 4);
        self.emit_push(Reg::Ecx);
        self.call_func("runtime.IntToString");
        done.push(self.asm.jmp_rel32());
        let here = self.asm.pos();
        patch_rel32(&mut self.asm.buf, not_int, here);

        self.asm.cmp_ri(Reg::Ebx, TYPE_ID_STRING as i32);
        let not_string = self.asm.jcc_rel32(Cond::Ne);
        self.asm.load_mem(Reg::Ecx, Reg::Eax, WORD as i32, 4);
        self.emit_push(Reg::Ecx);
        done.push(self.asm.jmp_rel32());
        let here = self.asm.pos();
        patch_rel32(&mut self.asm.buf, not_string, here);

        self.asm.load_mem(Reg::Ecx, Reg::Eax, WORD as i32, 4);
        self.emit_push(Reg::Ecx);
        for (type_id, impl_name) in tostring_impls(self.module) {
            self.asm.cmp_ri(Reg::Ebx, type_id as i32);
            let next = self.asm.jcc_rel32(Cond::Ne);
            self.call_func(&impl_name);
            done.push(self.asm.jmp_rel32());
            let here = self.asm.pos();
            patch_rel32(&mut self.asm.buf, next, here);
        }
        self.asm.int3();

        let here = self.asm.pos();
        for field in done {
            patch_rel32(&mut self.asm.buf, field, here);
        }
    }

    fn newline_rodata(&mut self) -> usize {
        if let Some(offset) = self.newline {
            return offset;
        }
        let offset = self.rodata.len();
        self.rodata.push(b'\n');
        self.newline = Some(offset);
        offset
    }

    fn lower_panic(&mut self) {
        self.pop_reg(Reg::Eax);
        self.flush();
        self.asm.load_mem(Reg::Ecx, Reg::Eax, 0, 4);
        self.asm.cmp_ri(Reg::Ecx, 256);
        let is_header = self.asm.jcc_rel32(Cond::Ge);
        self.asm.load_mem(Reg::Eax, Reg::Eax, WORD as i32, 4);
        let here = self.asm.pos();
        patch_rel32(&mut self.asm.buf, is_header, here);

        match self.os {
            Os::Linux => {
                // write(2, header.ptr, header.len); write(2, "\n", 1)
                self.asm.load_mem(Reg::Ecx, Reg::Eax, 0, 4);
                self.asm.load_mem(Reg::Edx, Reg::Eax, WORD as i32, 4);
                self.asm.mov_ri32(Reg::Ebx, 2);
                self.asm.mov_ri32(Reg::Eax, SYS_WRITE as u32);
                self.asm.int80();
                let newline = self.newline_rodata();
                self.load_rodata_addr(Reg::Ecx, newline);
                self.asm.mov_ri32(Reg::Edx, 1);
                self.asm.mov_ri32(Reg::Ebx, 2);
                self.asm.mov_ri32(Reg::Eax, SYS_WRITE as u32);
                self.asm.int80();
                self.asm.mov_ri32(Reg::Ebx, 2);
                self.asm.mov_ri32(Reg::Eax, SYS_EXIT as u32);
                self.asm.int80();
            }
            Os::Windows => {
                // stash the header fields, fetch the stderr handle
                self.asm.load_mem(Reg::Ecx, Reg::Eax, 0, 4);
                self.store_scratch(SCRATCH_BUF, Reg::Ecx);
                self.asm.load_mem(Reg::Ecx, Reg::Eax, WORD as i32, 4);
                self.store_scratch(SCRATCH_LEN, Reg::Ecx);
                self.asm.push_imm32(-12i32 as u32); // STD_ERROR_HANDLE
                self.iat_call("GetStdHandle");
                self.store_scratch(SCRATCH_HANDLE, Reg::Eax);
                self.emit_write_file_from_scratch();

                let newline = self.newline_rodata();
                let field = self.asm.mov_ri32(Reg::Ecx, 0);
                self.sect_fixups.push(SectFixup {
                    at: field,
                    section: SectRef::RodataHeader,
                    offset: newline as u64,
                    kind: PatchKind::Abs32,
                });
                self.store_scratch(SCRATCH_BUF, Reg::Ecx);
                self.asm.mov_ri32(Reg::Ecx, 1);
                self.store_scratch(SCRATCH_LEN, Reg::Ecx);
                self.emit_write_file_from_scratch();

                self.asm.push_imm32(2);
                self.iat_call("ExitProcess");
            }
        }
    }

    /// WriteFile(handle, buf, len, &written, 0) from the scratch slots
    fn emit_write_file_from_scratch(&mut self) {
        self.asm.push_imm32(0);
        self.push_scratch_addr(SCRATCH_OUT);
        self.load_scratch(SCRATCH_LEN, Reg::Ecx);
        self.asm.push(Reg::Ecx);
        self.load_scratch(SCRATCH_BUF, Reg::Ecx);
        self.asm.push(Reg::Ecx);
        self.load_scratch(SCRATCH_HANDLE, Reg::Ecx);
        self.asm.push(Reg::Ecx);
        self.iat_call("WriteFile");
    }

    //
    // linux intrinsics
    //

    /// pop arguments (rightmost on top) into ebx/ecx/edx/esi and trap
    fn emit_syscall(&mut self, number: i64, argc: usize) {
        const ARG_REGS: [Reg; 4] = [Reg::Ebx, Reg::Ecx, Reg::Edx, Reg::Esi];
        for index in (0..argc).rev() {
            self.pop_reg(ARG_REGS[index]);
        }
        self.asm.mov_ri32(Reg::Eax, number as u32);
        self.asm.int80();
    }

    fn emit_sys_triple(&mut self) {
        self.asm.cmp_ri(Reg::Eax, 0);
        let failed = self.asm.jcc_rel32(Cond::Lt);
        self.emit_push(Reg::Eax);
        self.asm.mov_ri32(Reg::Ecx, 0);
        self.emit_push(Reg::Ecx);
        self.emit_push(Reg::Ecx);
        let done = self.asm.jmp_rel32();
        let here = self.asm.pos();
        patch_rel32(&mut self.asm.buf, failed, here);
        self.asm.neg(Reg::Eax);
        self.asm.mov_rr(Reg::Ecx, Reg::Eax);
        self.asm.mov_ri32(Reg::Eax, 0);
        self.emit_push(Reg::Eax);
        self.emit_push(Reg::Eax);
        self.emit_push(Reg::Ecx);
        let here = self.asm.pos();
        patch_rel32(&mut self.asm.buf, done, here);
    }

    fn emit_enosys(&mut self, argc: usize) {
        for _ in 0..argc {
            self.pop_reg(Reg::Eax);
        }
        self.asm.mov_ri32(Reg::Eax, 0);
        self.emit_push(Reg::Eax);
        self.emit_push(Reg::Eax);
        self.asm.mov_ri32(Reg::Eax, ENOSYS as u32);
        self.emit_push(Reg::Eax);
    }

    fn lower_linux_intrinsic(&mut self, name: &str) -> Result<(), CodeGenError> {
        match name {
            "SysRead" => {
                self.emit_syscall(SYS_READ, 3);
                self.emit_sys_triple();
            }
            "SysWrite" => {
                self.emit_syscall(SYS_WRITE, 3);
                self.emit_sys_triple();
            }
            "SysOpen" => {
                self.emit_syscall(SYS_OPEN, 3);
                self.emit_sys_triple();
            }
            "SysClose" => {
                self.emit_syscall(SYS_CLOSE, 1);
                self.emit_sys_triple();
            }
            "SysMkdir" => {
                self.emit_syscall(SYS_MKDIR, 2);
                self.emit_sys_triple();
            }
            "SysRmdir" => {
                self.emit_syscall(SYS_RMDIR, 1);
                self.emit_sys_triple();
            }
            "SysUnlink" => {
                self.emit_syscall(SYS_UNLINK, 1);
                self.emit_sys_triple();
            }
            "SysGetcwd" => {
                self.emit_syscall(SYS_GETCWD, 2);
                self.emit_sys_triple();
            }
            "SysChmod" => {
                self.emit_syscall(SYS_CHMOD, 2);
                self.emit_sys_triple();
            }
            "SysDup2" => {
                self.emit_syscall(SYS_DUP2, 2);
                self.emit_sys_triple();
            }
            "SysFork" => {
                self.emit_syscall(SYS_FORK, 0);
                self.emit_sys_triple();
            }
            "SysExecve" => {
                self.emit_syscall(SYS_EXECVE, 3);
                self.emit_sys_triple();
            }
            "SysGetpid" => {
                self.emit_syscall(SYS_GETPID, 0);
                self.emit_sys_triple();
            }
            "SysExit" => {
                self.pop_reg(Reg::Ebx);
                self.asm.mov_ri32(Reg::Eax, SYS_EXIT as u32);
                self.asm.int80();
            }
            "SysMmap" => {
                // mmap2 needs edi (the fd argument) and ebp, both of
                // which carry our state; spill them around the trap
                self.pop_reg(Reg::Ecx); // length
                self.asm.push(Reg::Edi);
                self.asm.push(Reg::Ebp);
                self.asm.mov_ri32(Reg::Ebx, 0);
                self.asm.mov_ri32(Reg::Edx, 3);
                self.asm.mov_ri32(Reg::Esi, 0x22);
                self.asm.mov_ri32(Reg::Edi, -1i32 as u32);
                self.asm.mov_ri32(Reg::Ebp, 0);
                self.asm.mov_ri32(Reg::Eax, SYS_MMAP2 as u32);
                self.asm.int80();
                self.asm.pop(Reg::Ebp);
                self.asm.pop(Reg::Edi);
                self.emit_sys_triple();
            }
            "SysPipe" => {
                self.asm.sub_ri(Reg::Esp, 8);
                self.asm.mov_rr(Reg::Ebx, Reg::Esp);
                self.asm.mov_ri32(Reg::Eax, SYS_PIPE as u32);
                self.asm.int80();
                self.asm.load_mem(Reg::Ecx, Reg::Esp, 0, 4);
                self.asm.load_mem(Reg::Edx, Reg::Esp, 4, 4);
                self.asm.add_ri(Reg::Esp, 8);
                self.asm.cmp_ri(Reg::Eax, 0);
                let failed = self.asm.jcc_rel32(Cond::Lt);
                self.emit_push(Reg::Ecx);
                self.emit_push(Reg::Edx);
                self.asm.mov_ri32(Reg::Ecx, 0);
                self.emit_push(Reg::Ecx);
                let done = self.asm.jmp_rel32();
                let here = self.asm.pos();
                patch_rel32(&mut self.asm.buf, failed, here);
                self.asm.neg(Reg::Eax);
                self.asm.mov_rr(Reg::Ecx, Reg::Eax);
                self.asm.mov_ri32(Reg::Eax, 0);
                self.emit_push(Reg::Eax);
                self.emit_push(Reg::Eax);
                self.emit_push(Reg::Ecx);
                let here = self.asm.pos();
                patch_rel32(&mut self.asm.buf, done, here);
            }
            "SysWait4" => {
                // wait4(pid, &status, 0, 0), r2 is the status word
                self.pop_reg(Reg::Ebx);
                self.asm.sub_ri(Reg::Esp, 8);
                self.asm.mov_rr(Reg::Ecx, Reg::Esp);
                self.asm.mov_ri32(Reg::Edx, 0);
                self.asm.mov_ri32(Reg::Esi, 0);
                self.asm.mov_ri32(Reg::Eax, SYS_WAIT4 as u32);
                self.asm.int80();
                self.asm.load_mem(Reg::Edx, Reg::Esp, 0, 4);
                self.asm.add_ri(Reg::Esp, 8);
                self.asm.cmp_ri(Reg::Eax, 0);
                let failed = self.asm.jcc_rel32(Cond::Lt);
                self.emit_push(Reg::Eax);
                self.emit_push(Reg::Edx);
                self.asm.mov_ri32(Reg::Ecx, 0);
                self.emit_push(Reg::Ecx);
                let done = self.asm.jmp_rel32();
                let here = self.asm.pos();
                patch_rel32(&mut self.asm.buf, failed, here);
                self.asm.neg(Reg::Eax);
                self.asm.mov_rr(Reg::Ecx, Reg::Eax);
                self.asm.mov_ri32(Reg::Eax, 0);
                self.emit_push(Reg::Eax);
                self.emit_push(Reg::Eax);
                self.emit_push(Reg::Ecx);
                let here = self.asm.pos();
                patch_rel32(&mut self.asm.buf, done, here);
            }
            // the 32-bit stat layout diverges, the VM carries this one
            "SysStat" => self.emit_enosys(1),
            "SysOpendir" | "SysReaddir" | "SysClosedir" => {
                self.emit_enosys(intrinsic_argc(name).unwrap())
            }
            _ => {
                return Err(CodeGenError::UnknownIntrinsic {
                    func: self.cur_func.clone(),
                    name: name.to_owned(),
                })
            }
        }
        Ok(())
    }

    //
    // windows intrinsics
    //

    /// eax holds a BOOL: zero means failure. success pushes r1 from
    /// the given scratch slot (or zero), failure pushes GetLastError.
    fn emit_win_triple(&mut self, r1_slot: Option<usize>) {
        self.asm.test_rr(Reg::Eax, Reg::Eax);
        let failed = self.asm.jcc_rel32(Cond::Eq);
        match r1_slot {
            Some(slot) => self.load_scratch(slot, Reg::Eax),
            None => {
                self.asm.mov_ri32(Reg::Eax, 0);
            }
        }
        self.emit_push(Reg::Eax);
        self.asm.mov_ri32(Reg::Ecx, 0);
        self.emit_push(Reg::Ecx);
        self.emit_push(Reg::Ecx);
        let done = self.asm.jmp_rel32();
        let here = self.asm.pos();
        patch_rel32(&mut self.asm.buf, failed, here);
        self.iat_call("GetLastError");
        self.asm.mov_rr(Reg::Ecx, Reg::Eax);
        self.asm.mov_ri32(Reg::Eax, 0);
        self.emit_push(Reg::Eax);
        self.emit_push(Reg::Eax);
        self.emit_push(Reg::Ecx);
        let here = self.asm.pos();
        patch_rel32(&mut self.asm.buf, done, here);
    }

    /// convert the unix-style descriptor in eax: 0/1/2 become the
    /// process standard handles, anything else is already a handle
    fn emit_fd_to_handle(&mut self) {
        self.asm.cmp_ri(Reg::Eax, 3);
        let passthrough = self.asm.jcc_rel32(Cond::Ge);
        // GetStdHandle(-10 - fd)
        self.asm.mov_ri32(Reg::Ecx, -10i32 as u32);
        self.asm.sub_rr(Reg::Ecx, Reg::Eax);
        self.asm.push(Reg::Ecx);
        self.iat_call("GetStdHandle");
        let here = self.asm.pos();
        patch_rel32(&mut self.asm.buf, passthrough, here);
    }

    fn lower_windows_intrinsic(&mut self, name: &str) -> Result<(), CodeGenError> {
        match name {
            "SysWrite" | "SysRead" => {
                self.pop_reg(Reg::Ecx); // length
                self.store_scratch(SCRATCH_LEN, Reg::Ecx);
                self.pop_reg(Reg::Ecx); // buffer
                self.store_scratch(SCRATCH_BUF, Reg::Ecx);
                self.pop_reg(Reg::Eax); // descriptor
                self.emit_fd_to_handle();
                self.store_scratch(SCRATCH_HANDLE, Reg::Eax);

                self.asm.push_imm32(0);
                self.push_scratch_addr(SCRATCH_OUT);
                self.load_scratch(SCRATCH_LEN, Reg::Ecx);
                self.asm.push(Reg::Ecx);
                self.load_scratch(SCRATCH_BUF, Reg::Ecx);
                self.asm.push(Reg::Ecx);
                self.load_scratch(SCRATCH_HANDLE, Reg::Ecx);
                self.asm.push(Reg::Ecx);
                self.iat_call(if name == "SysWrite" {
                    "WriteFile"
                } else {
                    "ReadFile"
                });
                self.emit_win_triple(Some(SCRATCH_OUT));
            }
            "SysOpen" => {
                // CreateFileA(path, access, share, 0, disposition, 0, 0);
                // flags == 0 means read, anything else create+write
                self.pop_reg(Reg::Eax); // mode, unused
                self.pop_reg(Reg::Ebx); // flags
                self.pop_reg(Reg::Ecx); // path
                self.store_scratch(SCRATCH_BUF, Reg::Ecx);

                self.asm.push_imm32(0); // template
                self.asm.push_imm32(0x80); // FILE_ATTRIBUTE_NORMAL
                self.asm.cmp_ri(Reg::Ebx, 0);
                let writing = self.asm.jcc_rel32(Cond::Ne);
                self.asm.push_imm32(3); // OPEN_EXISTING
                self.asm.push_imm32(0);
                self.asm.mov_ri32(Reg::Ecx, 0x8000_0000); // GENERIC_READ
                let both = self.asm.jmp_rel32();
                let here = self.asm.pos();
                patch_rel32(&mut self.asm.buf, writing, here);
                self.asm.push_imm32(2); // CREATE_ALWAYS
                self.asm.push_imm32(0);
                self.asm.mov_ri32(Reg::Ecx, 0x4000_0000); // GENERIC_WRITE
                let here = self.asm.pos();
                patch_rel32(&mut self.asm.buf, both, here);
                self.asm.push_imm32(1); // FILE_SHARE_READ
                self.asm.push(Reg::Ecx); // access
                self.load_scratch(SCRATCH_BUF, Reg::Ecx);
                self.asm.push(Reg::Ecx); // path
                self.iat_call("CreateFileA");
                // INVALID_HANDLE_VALUE is -1
                self.asm.cmp_ri(Reg::Eax, -1);
                let failed = self.asm.jcc_rel32(Cond::Eq);
                self.emit_push(Reg::Eax);
                self.asm.mov_ri32(Reg::Ecx, 0);
                self.emit_push(Reg::Ecx);
                self.emit_push(Reg::Ecx);
                let done = self.asm.jmp_rel32();
                let here = self.asm.pos();
                patch_rel32(&mut self.asm.buf, failed, here);
                self.iat_call("GetLastError");
                self.asm.mov_rr(Reg::Ecx, Reg::Eax);
                self.asm.mov_ri32(Reg::Eax, 0);
                self.emit_push(Reg::Eax);
                self.emit_push(Reg::Eax);
                self.emit_push(Reg::Ecx);
                let here = self.asm.pos();
                patch_rel32(&mut self.asm.buf, done, here);
            }
            "SysClose" => {
                self.pop_reg(Reg::Eax);
                self.asm.push(Reg::Eax);
                self.iat_call("CloseHandle");
                self.emit_win_triple(None);
            }
            "SysMkdir" => {
                self.pop_reg(Reg::Eax); // mode, unused on windows
                self.pop_reg(Reg::Ecx);
                self.asm.push_imm32(0);
                self.asm.push(Reg::Ecx);
                self.iat_call("CreateDirectoryA");
                self.emit_win_triple(None);
            }
            "SysRmdir" => {
                self.pop_reg(Reg::Ecx);
                self.asm.push(Reg::Ecx);
                self.iat_call("RemoveDirectoryA");
                self.emit_win_triple(None);
            }
            "SysUnlink" => {
                self.pop_reg(Reg::Ecx);
                self.asm.push(Reg::Ecx);
                self.iat_call("DeleteFileA");
                self.emit_win_triple(None);
            }
            "SysGetcwd" => {
                // GetCurrentDirectoryA(size, buf) returns the length
                self.pop_reg(Reg::Ecx); // size
                self.pop_reg(Reg::Edx); // buf
                self.asm.push(Reg::Edx);
                self.asm.push(Reg::Ecx);
                self.iat_call("GetCurrentDirectoryA");
                self.emit_sys_triple_from_raw();
            }
            "SysChmod" => {
                // file modes do not map onto windows, succeed quietly
                self.pop_reg(Reg::Eax);
                self.pop_reg(Reg::Eax);
                self.asm.mov_ri32(Reg::Eax, 0);
                self.emit_push(Reg::Eax);
                self.emit_push(Reg::Eax);
                self.emit_push(Reg::Eax);
            }
            "SysGetpid" => {
                self.iat_call("GetCurrentProcessId");
                self.emit_sys_triple_from_raw();
            }
            "SysExit" => {
                self.pop_reg(Reg::Eax);
                self.asm.push(Reg::Eax);
                self.iat_call("ExitProcess");
            }
            "SysMmap" => {
                self.pop_reg(Reg::Ecx); // length
                self.asm.push_imm32(4); // PAGE_READWRITE
                self.asm.push_imm32(0x3000); // MEM_COMMIT | MEM_RESERVE
                self.asm.push(Reg::Ecx);
                self.asm.push_imm32(0);
                self.iat_call("VirtualAlloc");
                self.emit_sys_triple_from_raw();
            }
            "SysStat" | "SysDup2" | "SysFork" | "SysExecve" | "SysWait4" | "SysPipe"
            | "SysOpendir" | "SysReaddir" | "SysClosedir" => {
                self.emit_enosys(intrinsic_argc(name).unwrap());
            }
            _ => {
                return Err(CodeGenError::UnknownIntrinsic {
                    func: self.cur_func.clone(),
                    name: name.to_owned(),
                })
            }
        }
        Ok(())
    }

    /// eax already holds r1; treat zero/nonzero as unconditional
    /// success (the callers are apis that cannot meaningfully fail)
    fn emit_sys_triple_from_raw(&mut self) {
        self.emit_push(Reg::Eax);
        self.asm.mov_ri32(Reg::Ecx, 0);
        self.emit_push(Reg::Ecx);
        self.emit_push(Reg::Ecx);
    }

    //
    // shared intrinsic entry
    //

    fn lower_intrinsic(&mut self, name: &str) -> Result<(), CodeGenError> {
        if intrinsic_argc(name).is_none() {
            return Err(CodeGenError::UnknownIntrinsic {
                func: self.cur_func.clone(),
                name: name.to_owned(),
            });
        }
        self.flush();

        match name {
            "SysGetargc" | "SysGetargv" | "SysGetenvp" => {
                let slot = match name {
                    "SysGetargc" => 0,
                    "SysGetargv" => 1,
                    _ => 2,
                };
                let offset = (self.module.globals + slot) * WORD;
                self.load_data_addr(Reg::Ecx, offset);
                self.asm.load_mem(Reg::Eax, Reg::Ecx, 0, 4);
                self.push_pending(Reg::Eax);
                return Ok(());
            }
            "Sliceptr" | "Stringptr" | "ReadPtr" => {
                self.pop_reg(Reg::Eax);
                self.asm.load_mem(Reg::Eax, Reg::Eax, 0, 4);
                self.push_pending(Reg::Eax);
                return Ok(());
            }
            "WritePtr" => {
                self.pop_reg(Reg::Ecx);
                self.pop_reg(Reg::Eax);
                self.asm.store_mem(Reg::Eax, 0, Reg::Ecx, 4);
                return Ok(());
            }
            "WriteByte" => {
                self.pop_reg(Reg::Ecx);
                self.pop_reg(Reg::Eax);
                self.asm.store_mem(Reg::Eax, 0, Reg::Ecx, 1);
                return Ok(());
            }
            "Makestring" => {
                self.pop_reg(Reg::Eax);
                self.asm.push(Reg::Eax);
                self.pop_reg(Reg::Eax);
                self.asm.push(Reg::Eax);
                self.asm.mov_ri32(Reg::Eax, (2 * WORD) as u32);
                self.emit_push(Reg::Eax);
                self.call_func("runtime.Alloc");
                self.pop_reg(Reg::Eax);
                self.asm.pop(Reg::Ecx);
                self.asm.store_mem(Reg::Eax, 0, Reg::Ecx, 4);
                self.asm.pop(Reg::Ecx);
                self.asm.store_mem(Reg::Eax, WORD as i32, Reg::Ecx, 4);
                self.push_pending(Reg::Eax);
                return Ok(());
            }
            "Makeslice" => {
                for _ in 0..4 {
                    self.pop_reg(Reg::Eax);
                    self.asm.push(Reg::Eax);
                }
                self.asm.mov_ri32(Reg::Eax, (4 * WORD) as u32);
                self.emit_push(Reg::Eax);
                self.call_func("runtime.Alloc");
                self.pop_reg(Reg::Eax);
                for index in 0..4 {
                    self.asm.pop(Reg::Ecx);
                    self.asm
                        .store_mem(Reg::Eax, (index * WORD) as i32, Reg::Ecx, 4);
                }
                self.push_pending(Reg::Eax);
                return Ok(());
            }
            "Tostring" => {
                self.lower_tostring();
                return Ok(());
            }
            _ => {}
        }

        match self.os {
            Os::Linux => self.lower_linux_intrinsic(name),
            Os::Windows => self.lower_windows_intrinsic(name),
        }
    }

    //
    // resolution
    //

    fn finish(mut self, entry: usize) -> Result<(ProgramImage, Generated), CodeGenError> {
        let mut unresolved: Vec<String> = Vec::new();
        for fixup in &self.call_fixups {
            match self.func_offsets.get(&fixup.name) {
                Some(target) => patch_rel32(&mut self.asm.buf, fixup.at, *target),
                None => {
                    if !unresolved.contains(&fixup.name) {
                        unresolved.push(fixup.name.clone());
                    }
                }
            }
        }
        if !unresolved.is_empty() {
            return Err(CodeGenError::UnresolvedCalls(unresolved));
        }

        let generated = Generated {
            funcs: self
                .funcs
                .iter()
                .map(|func| (func.name.clone(), func.offset))
                .collect(),
            code_size: self.asm.buf.len(),
        };
        let image = ProgramImage {
            code: self.asm.buf,
            rodata: self.rodata,
            data: self.data,
            entry,
            sect_fixups: self.sect_fixups,
            string_headers: self.string_headers,
            got_symbols: Vec::new(),
            iat_symbols: self.iat_symbols,
            funcs: self.funcs,
        };
        Ok((image, generated))
    }
}

fn compile(module: &IRModule, os: Os) -> Result<(ProgramImage, Generated), CodeGenError> {
    let mut gen = X86Codegen::new(module, os);
    gen.emit_entry_stub();
    for func in &module.funcs {
        gen.compile_func(func)?;
    }
    debug!(
        "x86/{:?}: {} functions, {} bytes of code",
        os,
        module.funcs.len(),
        gen.asm.buf.len()
    );
    gen.finish(0)
}

pub fn generate_linux_386(module: &IRModule, path: &Path) -> Result<Generated, CodeGenError> {
    let (image, generated) = compile(module, Os::Linux)?;
    elf::write_elf32(image, path)?;
    Ok(generated)
}

pub fn generate_windows_386(module: &IRModule, path: &Path) -> Result<Generated, CodeGenError> {
    let (image, generated) = compile(module, Os::Windows)?;
    pe::write_pe32(image, path)?;
    Ok(generated)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use rtg_ir::opcode::Opcode;
    use rtg_ir::{IRFunc, IRModule, Inst};
    use rtg_object::SectRef;

    fn module_with_main(insts: Vec<Inst>) -> IRModule {
        IRModule {
            funcs: vec![IRFunc {
                name: "main.main".to_owned(),
                params: 0,
                locals: vec![],
                insts,
            }],
            globals: 0,
            methods: vec![],
            type_ids: vec![],
        }
    }

    #[test]
    fn test_linux_compile_resolves() {
        let module = module_with_main(vec![
            Inst::with_value(Opcode::const_i64, 0),
            Inst::intrinsic("SysExit"),
        ]);
        let (image, generated) = super::compile(&module, super::Os::Linux).unwrap();
        assert_eq!(generated.funcs.len(), 1);
        assert!(image.iat_symbols.is_empty());
        // int 0x80 appears in the code
        assert!(image.code.windows(2).any(|w| w == [0xcd, 0x80]));
    }

    #[test]
    fn test_windows_registers_imports() {
        let module = module_with_main(vec![
            Inst::with_value(Opcode::const_i64, 0),
            Inst::intrinsic("SysExit"),
        ]);
        let (image, _) = super::compile(&module, super::Os::Windows).unwrap();
        // the stub needs VirtualAlloc and ExitProcess at minimum
        assert!(image
            .iat_symbols
            .iter()
            .any(|symbol| symbol == "VirtualAlloc"));
        assert!(image
            .iat_symbols
            .iter()
            .any(|symbol| symbol == "ExitProcess"));
        // every import call site carries an Iat fixup
        let iat_fixups = image
            .sect_fixups
            .iter()
            .filter(|fixup| matches!(fixup.section, SectRef::Iat(_)))
            .count();
        assert!(iat_fixups >= 2);
    }

    #[test]
    fn test_int64_conversion_is_silent_truncation() {
        let module = module_with_main(vec![
            Inst::with_value(Opcode::const_i64, 0x1_0000_0001),
            Inst::with_name(Opcode::convert, "int64"),
            Inst::new(Opcode::drop),
            Inst::with_value(Opcode::const_i64, 0),
            Inst::intrinsic("SysExit"),
        ]);
        // compiles without error; the conversion emits nothing
        let (image_a, _) = super::compile(&module, super::Os::Linux).unwrap();
        let plain = module_with_main(vec![
            Inst::with_value(Opcode::const_i64, 0x1_0000_0001),
            Inst::new(Opcode::drop),
            Inst::with_value(Opcode::const_i64, 0),
            Inst::intrinsic("SysExit"),
        ]);
        let (image_b, _) = super::compile(&plain, super::Os::Linux).unwrap();
        assert_eq!(image_a.code, image_b.code);
    }
}
