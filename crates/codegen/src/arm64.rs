// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// arm64 code generator, shared between darwin/arm64 and windows/arm64.
//
// register assignment:
//
//   x28        operand-stack top pointer (grows down)
//   x29 / x30  frame pointer / link register
//   x0..x5     scratch and call arguments
//   x16        assembler scratch (wide offsets, indirect call target)
//   x17        compare scratch for wide immediates
//
// the two targets differ in how they reach the outside world:
//
// - darwin is PIE. data and rodata addresses are formed with
//   adrp+add pairs patched against the instruction's own virtual
//   address, and OS intrinsics call libSystem through the GOT
//   (adrp+ldr), with ___error supplying errno on failure. string
//   headers are materialized at runtime, so the image needs no
//   rebase information at all.
// - windows loads at a fixed base. addresses are 4-instruction
//   movz/movk sequences patched with absolute values, and intrinsics
//   go through the kernel32 import address table.

use std::collections::HashMap;
use std::path::Path;

use log::debug;

use rtg_asm::arm64::{patch_b, patch_b_cond, Cond, Emitter, Reg};
use rtg_ir::literal::{decode_string_literal, is_init_func};
use rtg_ir::opcode::Opcode;
use rtg_ir::{IRFunc, IRModule, Inst, TYPE_ID_INT, TYPE_ID_STRING};
use rtg_object::{
    align_up, macho, pe, FuncSym, PatchKind, ProgramImage, SectFixup, SectRef, StringHeader,
};

use crate::{
    intrinsic_argc, tostring_impls, BranchFixup, CallFixup, CodeGenError, Generated, StringPool,
    ENOSYS, RESERVED_GLOBALS,
};

const WORD: usize = 8;
const UNIX_STACK_SIZE: u64 = 1 << 20; // 1 MiB
const WINDOWS_STACK_SIZE: u64 = 16 << 20; // 16 MiB

// darwin mmap flags: MAP_PRIVATE | MAP_ANON
const DARWIN_MAP_FLAGS: u64 = 0x1002;

#[derive(Debug, PartialEq, Clone, Copy)]
enum Os {
    Darwin,
    Windows,
}

struct Arm64Codegen<'a> {
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
    got_symbols: Vec<String>,
    iat_symbols: Vec<String>,

    branch_fixups: Vec<BranchFixup>,
    label_offsets: HashMap<i64, usize>,
    pending: Option<Reg>,
    cur_func: String,
    cur_pitch: usize,
    newline: Option<usize>,
}

impl<'a> Arm64Codegen<'a> {
    fn new(module: &'a IRModule, os: Os) -> Self {
        Self {
            module,
            os,
            asm: Emitter::new(),
            rodata: Vec::new(),
            data: vec![0u8; (module.globals + RESERVED_GLOBALS) * WORD],
            strings: StringPool::new(WORD),
            func_offsets: HashMap::new(),
            funcs: Vec::new(),
            call_fixups: Vec::new(),
            sect_fixups: Vec::new(),
            string_headers: Vec::new(),
            got_symbols: Vec::new(),
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
        self.asm.str_pre(reg, Reg::X28, -(WORD as i32));
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
            self.asm.ldr_post(reg, Reg::X28, WORD as i32);
        }
    }

    //
    // addresses, calls, imports
    //

    fn load_data_address(&mut self, reg: Reg, offset: usize) {
        let (at, kind) = match self.os {
            Os::Darwin => (self.asm.adrp_add(reg), PatchKind::AdrpAdd),
            Os::Windows => (self.asm.load_imm64(reg, 0), PatchKind::MovSeq64),
        };
        self.sect_fixups.push(SectFixup {
            at,
            section: SectRef::DataAddr,
            offset: offset as u64,
            kind,
        });
    }

    fn load_rodata_address(&mut self, reg: Reg, offset: usize) {
        let (at, kind) = match self.os {
            Os::Darwin => (self.asm.adrp_add(reg), PatchKind::AdrpAdd),
            Os::Windows => (self.asm.load_imm64(reg, 0), PatchKind::MovSeq64),
        };
        self.sect_fixups.push(SectFixup {
            at,
            section: SectRef::RodataHeader,
            offset: offset as u64,
            kind,
        });
    }

    fn call_func(&mut self, name: &str) {
        self.flush();
        let at = self.asm.bl();
        self.call_fixups.push(CallFixup {
            at,
            name: name.to_owned(),
        });
    }

    /// call a libSystem function through its GOT slot (darwin)
    fn got_call(&mut self, symbol: &str) {
        let slot = match self.got_symbols.iter().position(|s| s == symbol) {
            Some(slot) => slot,
            None => {
                self.got_symbols.push(symbol.to_owned());
                self.got_symbols.len() - 1
            }
        };
        let at = self.asm.adrp_ldr(Reg::X16);
        self.sect_fixups.push(SectFixup {
            at,
            section: SectRef::GotAddr,
            offset: (slot * WORD) as u64,
            kind: PatchKind::AdrpLdr,
        });
        self.asm.blr(Reg::X16);
    }

    /// call a kernel32 function through its IAT slot (windows)
    fn iat_call(&mut self, symbol: &str) {
        if !self.iat_symbols.iter().any(|existing| existing == symbol) {
            self.iat_symbols.push(symbol.to_owned());
        }
        let at = self.asm.load_imm64(Reg::X16, 0);
        self.sect_fixups.push(SectFixup {
            at,
            section: SectRef::Iat(symbol.to_owned()),
            offset: 0,
            kind: PatchKind::MovSeq64,
        });
        self.asm.ldr(Reg::X16, Reg::X16, 0, 8);
        self.asm.blr(Reg::X16);
    }

    /// compare rn against an arbitrary immediate
    fn cmp_imm(&mut self, rn: Reg, value: i64) {
        if (0..=4095).contains(&value) {
            self.asm.cmp_ri(rn, value as u32);
        } else {
            self.asm.load_imm64_compact(Reg::X17, value as u64);
            self.asm.cmp_rr(rn, Reg::X17);
        }
    }

    fn add_imm(&mut self, rd: Reg, rn: Reg, value: i64) {
        if (0..=4095).contains(&value) {
            self.asm.add_ri(rd, rn, value as u32);
        } else if (-4095..0).contains(&value) {
            self.asm.sub_ri(rd, rn, (-value) as u32);
        } else {
            self.asm.load_imm64_compact(Reg::X17, value as u64);
            self.asm.add_rr(rd, rn, Reg::X17);
        }
    }

    fn sub_sp_wide(&mut self, mut amount: usize) {
        while amount > 0 {
            let step = amount.min(4095);
            self.asm.sub_sp(step as u32);
            amount -= step;
        }
    }

    fn add_sp_wide(&mut self, mut amount: usize) {
        while amount > 0 {
            let step = amount.min(4095);
            self.asm.add_sp(step as u32);
            amount -= step;
        }
    }

    //
    // entry stub
    //

    fn emit_entry_stub(&mut self) {
        let argc_slot = self.module.globals * WORD;
        match self.os {
            Os::Darwin => {
                // dyld invokes the entry as main(argc, argv, envp, apple)
                self.load_data_address(Reg::X3, argc_slot);
                self.asm.str_(Reg::X0, Reg::X3, 0, 8);
                self.asm.str_(Reg::X1, Reg::X3, 8, 8);
                self.asm.str_(Reg::X2, Reg::X3, 16, 8);

                self.asm.load_imm64_compact(Reg::X0, UNIX_STACK_SIZE);
                self.got_call("_malloc");
                self.asm.load_imm64_compact(Reg::X1, UNIX_STACK_SIZE);
                self.asm.add_rr(Reg::X28, Reg::X0, Reg::X1);
            }
            Os::Windows => {
                // the reserved argc/argv/envp slots stay zero
                self.asm.movz(Reg::X0, 0, 0);
                self.asm.load_imm64_compact(Reg::X1, WINDOWS_STACK_SIZE);
                self.asm.load_imm64_compact(Reg::X2, 0x3000);
                self.asm.movz(Reg::X3, 4, 0);
                self.iat_call("VirtualAlloc");
                self.asm.load_imm64_compact(Reg::X1, WINDOWS_STACK_SIZE);
                self.asm.add_rr(Reg::X28, Reg::X0, Reg::X1);
            }
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

        self.asm.movz(Reg::X0, 0, 0);
        match self.os {
            Os::Darwin => self.got_call("_exit"),
            Os::Windows => self.iat_call("ExitProcess"),
        }
        self.asm.brk();
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

        self.asm.stp_pre_sp(Reg::X29, Reg::X30, -16);
        self.asm.mov_from_sp(Reg::X29);
        self.sub_sp_wide(frame);

        for index in (0..func.params).rev() {
            self.pop_reg(Reg::X0);
            let disp = self.local_disp(index);
            self.asm.str_(Reg::X0, Reg::X29, disp, 8);
        }

        for inst in &func.insts {
            self.lower_inst(func, inst)?;
        }

        debug_assert!(self.pending.is_none());

        // the patch kind is recovered from the opcode bits at the site
        for fixup in std::mem::take(&mut self.branch_fixups) {
            let target = *self.label_offsets.get(&fixup.label).ok_or_else(|| {
                CodeGenError::UnknownLabel {
                    func: func.name.clone(),
                    label: fixup.label,
                }
            })?;
            let instr = u32::from_le_bytes(
                self.asm.buf[fixup.at..fixup.at + 4].try_into().unwrap(),
            );
            if instr >> 24 == 0x54 {
                patch_b_cond(&mut self.asm.buf, fixup.at, target);
            } else {
                patch_b(&mut self.asm.buf, fixup.at, target);
            }
        }
        Ok(())
    }

    fn local_disp(&self, index: usize) -> i64 {
        -(((index + 1) * self.cur_pitch) as i64)
    }

    fn local_width(&self, func: &IRFunc, index: usize) -> u8 {
        match func.locals.get(index) {
            Some(local) if local.width != 0 => local.width,
            _ => 8,
        }
    }

    fn width_of(width: u8) -> u8 {
        if width == 0 {
            8
        } else {
            width
        }
    }

    fn lower_inst(&mut self, func: &IRFunc, inst: &Inst) -> Result<(), CodeGenError> {
        match inst.opcode {
            Opcode::const_i64 | Opcode::const_bool => {
                self.asm.load_imm64_compact(Reg::X0, inst.value as u64);
                self.push_pending(Reg::X0);
            }
            Opcode::const_nil => {
                self.asm.movz(Reg::X0, 0, 0);
                self.push_pending(Reg::X0);
            }
            Opcode::const_str => self.lower_const_str(inst.name.as_deref().unwrap_or("")),

            Opcode::local_get => {
                let index = inst.arg as usize;
                let width = self.local_width(func, index);
                let disp = self.local_disp(index);
                self.asm.ldr(Reg::X0, Reg::X29, disp, width);
                self.push_pending(Reg::X0);
            }
            Opcode::local_set => {
                let index = inst.arg as usize;
                let width = self.local_width(func, index);
                let disp = self.local_disp(index);
                self.pop_reg(Reg::X0);
                self.asm.str_(Reg::X0, Reg::X29, disp, width);
            }
            Opcode::local_addr => {
                let disp = self.local_disp(inst.arg as usize);
                self.add_imm(Reg::X0, Reg::X29, disp);
                self.push_pending(Reg::X0);
            }

            Opcode::global_get => {
                let offset = inst.arg as usize * WORD;
                self.load_data_address(Reg::X1, offset);
                self.asm.ldr(Reg::X0, Reg::X1, 0, 8);
                self.push_pending(Reg::X0);
            }
            Opcode::global_set => {
                let offset = inst.arg as usize * WORD;
                self.pop_reg(Reg::X0);
                self.load_data_address(Reg::X1, offset);
                self.asm.str_(Reg::X0, Reg::X1, 0, 8);
            }
            Opcode::global_addr => {
                let offset = inst.arg as usize * WORD;
                self.load_data_address(Reg::X0, offset);
                self.push_pending(Reg::X0);
            }

            Opcode::drop => {
                if self.pending.take().is_none() {
                    self.asm.add_ri(Reg::X28, Reg::X28, WORD as u32);
                }
            }
            Opcode::dup => {
                self.pop_reg(Reg::X0);
                self.emit_push(Reg::X0);
                self.push_pending(Reg::X0);
            }

            Opcode::add | Opcode::sub | Opcode::mul | Opcode::and | Opcode::or | Opcode::xor => {
                self.pop_reg(Reg::X1);
                self.pop_reg(Reg::X0);
                match inst.opcode {
                    Opcode::add => self.asm.add_rr(Reg::X0, Reg::X0, Reg::X1),
                    Opcode::sub => self.asm.sub_rr(Reg::X0, Reg::X0, Reg::X1),
                    Opcode::mul => self.asm.mul(Reg::X0, Reg::X0, Reg::X1),
                    Opcode::and => self.asm.and_rr(Reg::X0, Reg::X0, Reg::X1),
                    Opcode::or => self.asm.orr_rr(Reg::X0, Reg::X0, Reg::X1),
                    _ => self.asm.eor_rr(Reg::X0, Reg::X0, Reg::X1),
                }
                self.push_pending(Reg::X0);
            }
            Opcode::div => {
                self.pop_reg(Reg::X1);
                self.pop_reg(Reg::X0);
                self.asm.sdiv(Reg::X0, Reg::X0, Reg::X1);
                self.push_pending(Reg::X0);
            }
            Opcode::mod_ => {
                self.pop_reg(Reg::X1);
                self.pop_reg(Reg::X0);
                self.asm.sdiv(Reg::X2, Reg::X0, Reg::X1);
                self.asm.msub(Reg::X0, Reg::X2, Reg::X1, Reg::X0);
                self.push_pending(Reg::X0);
            }
            Opcode::neg => {
                self.pop_reg(Reg::X0);
                self.asm.neg(Reg::X0, Reg::X0);
                self.push_pending(Reg::X0);
            }
            Opcode::not => {
                self.pop_reg(Reg::X0);
                self.asm.mvn(Reg::X0, Reg::X0);
                self.push_pending(Reg::X0);
            }
            Opcode::shl => {
                self.pop_reg(Reg::X1);
                self.pop_reg(Reg::X0);
                self.asm.lslv(Reg::X0, Reg::X0, Reg::X1);
                self.push_pending(Reg::X0);
            }
            Opcode::shr => {
                self.pop_reg(Reg::X1);
                self.pop_reg(Reg::X0);
                self.asm.asrv(Reg::X0, Reg::X0, Reg::X1);
                self.push_pending(Reg::X0);
            }

            Opcode::eq | Opcode::neq | Opcode::lt | Opcode::gt | Opcode::leq | Opcode::geq => {
                self.pop_reg(Reg::X1);
                self.pop_reg(Reg::X0);
                self.asm.cmp_rr(Reg::X0, Reg::X1);
                let cond = match inst.opcode {
                    Opcode::eq => Cond::Eq,
                    Opcode::neq => Cond::Ne,
                    Opcode::lt => Cond::Lt,
                    Opcode::gt => Cond::Gt,
                    Opcode::leq => Cond::Le,
                    _ => Cond::Ge,
                };
                self.asm.cset(Reg::X0, cond);
                self.push_pending(Reg::X0);
            }

            Opcode::label => {
                self.flush();
                self.label_offsets.insert(inst.arg, self.asm.pos());
            }
            Opcode::jmp => {
                self.flush();
                let at = self.asm.b();
                self.branch_fixups.push(BranchFixup {
                    at,
                    label: inst.arg,
                });
            }
            Opcode::jmp_if | Opcode::jmp_if_not => {
                self.pop_reg(Reg::X0);
                self.flush();
                self.asm.cmp_ri(Reg::X0, 0);
                let cond = if inst.opcode == Opcode::jmp_if {
                    Cond::Ne
                } else {
                    Cond::Eq
                };
                let at = self.asm.b_cond(cond);
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
                self.asm.mov_to_sp(Reg::X29);
                self.asm.ldp_post_sp(Reg::X29, Reg::X30, 16);
                self.asm.ret();
            }

            Opcode::load => {
                let width = Self::width_of(inst.width);
                self.pop_reg(Reg::X0);
                self.asm.movz(Reg::X1, 0, 0);
                self.asm.cmp_ri(Reg::X0, 0);
                let skip = self.asm.b_cond(Cond::Eq);
                self.asm.ldr(Reg::X1, Reg::X0, 0, width);
                let here = self.asm.pos();
                patch_b_cond(&mut self.asm.buf, skip, here);
                self.push_pending(Reg::X1);
            }
            Opcode::store => {
                let width = Self::width_of(inst.width);
                self.pop_reg(Reg::X1);
                self.pop_reg(Reg::X0);
                self.asm.str_(Reg::X1, Reg::X0, 0, width);
            }
            Opcode::offset => {
                self.pop_reg(Reg::X0);
                self.add_imm(Reg::X0, Reg::X0, inst.arg);
                self.push_pending(Reg::X0);
            }
            Opcode::index_addr => {
                self.pop_reg(Reg::X1);
                self.pop_reg(Reg::X0);
                self.asm.ldr(Reg::X0, Reg::X0, 0, 8);
                match inst.value {
                    1 => {}
                    8 => self.asm.lsl_imm(Reg::X1, Reg::X1, 3),
                    4 => self.asm.lsl_imm(Reg::X1, Reg::X1, 2),
                    size => {
                        self.asm.load_imm64_compact(Reg::X2, size as u64);
                        self.asm.mul(Reg::X1, Reg::X1, Reg::X2);
                    }
                }
                self.asm.add_rr(Reg::X0, Reg::X0, Reg::X1);
                self.push_pending(Reg::X0);
            }
            Opcode::len => {
                self.pop_reg(Reg::X0);
                self.asm.movz(Reg::X1, 0, 0);
                self.asm.cmp_ri(Reg::X0, 0);
                let skip = self.asm.b_cond(Cond::Eq);
                self.asm.ldr(Reg::X1, Reg::X0, WORD as i64, 8);
                let here = self.asm.pos();
                patch_b_cond(&mut self.asm.buf, skip, here);
                self.push_pending(Reg::X1);
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

    /// on darwin the rodata address is formed at runtime and stored
    /// into the header before the header address is pushed; on windows
    /// the container writer patches the header bytes instead
    fn lower_const_str(&mut self, raw: &str) {
        let bytes = decode_string_literal(raw);
        let (header, rodata_off) = self
            .strings
            .intern(bytes, &mut self.rodata, &mut self.data);
        match self.os {
            Os::Darwin => {
                self.load_rodata_address(Reg::X0, rodata_off);
                self.load_data_address(Reg::X1, header);
                self.asm.str_(Reg::X0, Reg::X1, 0, 8);
                self.push_pending(Reg::X1);
            }
            Os::Windows => {
                self.string_headers.push(StringHeader {
                    data_offset: header,
                    rodata_offset: rodata_off,
                });
                self.load_data_address(Reg::X0, header);
                self.push_pending(Reg::X0);
            }
        }
    }

    fn lower_convert(&mut self, name: &str) -> Result<(), CodeGenError> {
        match name {
            "string" => self.call_func("runtime.BytesToString"),
            "[]byte" => self.call_func("runtime.StringToBytes"),
            "int" | "uint" | "uintptr" | "int64" | "uint64" => {}
            "byte" | "uint8" => {
                self.pop_reg(Reg::X0);
                self.asm.uxtb(Reg::X0, Reg::X0);
                self.push_pending(Reg::X0);
            }
            "uint16" => {
                self.pop_reg(Reg::X0);
                self.asm.uxth(Reg::X0, Reg::X0);
                self.push_pending(Reg::X0);
            }
            "uint32" => {
                self.pop_reg(Reg::X0);
                self.asm.uxtw(Reg::X0, Reg::X0);
                self.push_pending(Reg::X0);
            }
            "int32" => {
                self.pop_reg(Reg::X0);
                self.asm.sxtw(Reg::X0, Reg::X0);
                self.push_pending(Reg::X0);
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
            self.pop_reg(Reg::X0);
            self.asm.push_sp(Reg::X0);
        }
        self.asm
            .load_imm64_compact(Reg::X0, (fields * WORD) as u64);
        self.emit_push(Reg::X0);
        self.call_func("runtime.Alloc");
        self.pop_reg(Reg::X0);
        for index in 0..fields {
            self.asm.pop_sp(Reg::X1);
            self.asm.str_(Reg::X1, Reg::X0, (index * WORD) as i64, 8);
        }
        self.push_pending(Reg::X0);
    }

    fn lower_iface_box(&mut self, type_id: i64) {
        self.pop_reg(Reg::X0);
        self.flush();
        self.asm.push_sp(Reg::X0);
        self.asm.load_imm64_compact(Reg::X0, (2 * WORD) as u64);
        self.emit_push(Reg::X0);
        self.call_func("runtime.Alloc");
        self.pop_reg(Reg::X0);
        self.asm.load_imm64_compact(Reg::X1, type_id as u64);
        self.asm.str_(Reg::X1, Reg::X0, 0, 8);
        self.asm.pop_sp(Reg::X1);
        self.asm.str_(Reg::X1, Reg::X0, WORD as i64, 8);
        self.push_pending(Reg::X0);
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
            self.pop_reg(Reg::X0);
            self.asm.push_sp(Reg::X0);
        }
        // x3 keeps the type id; the re-push below uses x0/x1 only
        self.pop_reg(Reg::X0);
        self.asm.ldr(Reg::X3, Reg::X0, 0, 8);
        self.asm.ldr(Reg::X1, Reg::X0, WORD as i64, 8);
        self.emit_push(Reg::X1);
        for _ in 0..argc {
            self.asm.pop_sp(Reg::X1);
            self.emit_push(Reg::X1);
        }

        let mut done: Vec<usize> = Vec::new();
        for (type_id, impl_name) in impls {
            self.cmp_imm(Reg::X3, type_id);
            let next = self.asm.b_cond(Cond::Ne);
            self.call_func(&impl_name);
            done.push(self.asm.b());
            let here = self.asm.pos();
            patch_b_cond(&mut self.asm.buf, next, here);
        }
        self.asm.brk();

        let here = self.asm.pos();
        for at in done {
            patch_b(&mut self.asm.buf, at, here);
        }
        Ok(())
    }

    fn lower_tostring(&mut self) {
        self.pop_reg(Reg::X0);
        self.flush();
        self.asm.ldr(Reg::X3, Reg::X0, 0, 8);

        self.cmp_imm(Reg::X3, 256);
        let not_header = self.asm.b_cond(Cond::Lt);
        self.emit_push(Reg::X0);
        let mut done = vec![self.asm.b()];
        let here = self.asm.pos();
        patch_b_cond(&mut self.asm.buf, not_header, here);

        self.cmp_imm(Reg::X3, TYPE_ID_INT);
        let not_int = self.asm.b_cond(Cond::Ne);
        self.asm.ldr(Reg::X1, Reg::X0, WORD as i64, 8);
        self.emit_push(Reg::X1);
        self.call_func("runtime.IntToString");
        done.push(self.asm.b());
        let here = self.asm.pos();
        patch_b_cond(&mut self.asm.buf, not_int, here);

        self.cmp_imm(Reg::X3, TYPE_ID_STRING);
        let not_string = self.asm.b_cond(Cond::Ne);
        self.asm.ldr(Reg::X1, Reg::X0, WORD as i64, 8);
        self.emit_push(Reg::X1);
        done.push(self.asm.b());
        let here = self.asm.pos();
        patch_b_cond(&mut self.asm.buf, not_string, here);

        self.asm.ldr(Reg::X1, Reg::X0, WORD as i64, 8);
        self.emit_push(Reg::X1);
        for (type_id, impl_name) in tostring_impls(self.module) {
            self.cmp_imm(Reg::X3, type_id);
            let next = self.asm.b_cond(Cond::Ne);
            self.call_func(&impl_name);
            done.push(self.asm.b());
            let here = self.asm.pos();
            patch_b_cond(&mut self.asm.buf, next, here);
        }
        self.asm.brk();

        let here = self.asm.pos();
        for at in done {
            patch_b(&mut self.asm.buf, at, here);
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
        self.pop_reg(Reg::X0);
        self.flush();
        self.asm.ldr(Reg::X1, Reg::X0, 0, 8);
        self.cmp_imm(Reg::X1, 256);
        let is_header = self.asm.b_cond(Cond::Ge);
        self.asm.ldr(Reg::X0, Reg::X0, WORD as i64, 8);
        let here = self.asm.pos();
        patch_b_cond(&mut self.asm.buf, is_header, here);

        match self.os {
            Os::Darwin => {
                // write(2, header.ptr, header.len), write(2, "\n", 1)
                self.asm.ldr(Reg::X2, Reg::X0, WORD as i64, 8);
                self.asm.ldr(Reg::X1, Reg::X0, 0, 8);
                self.asm.movz(Reg::X0, 2, 0);
                self.got_call("_write");
                let newline = self.newline_rodata();
                self.load_rodata_address(Reg::X1, newline);
                self.asm.movz(Reg::X2, 1, 0);
                self.asm.movz(Reg::X0, 2, 0);
                self.got_call("_write");
                // deliberately fault at address zero for a crash dump
                self.asm.movz(Reg::X0, 0, 0);
                self.asm.ldr(Reg::X0, Reg::X0, 0, 8);
                self.asm.brk();
            }
            Os::Windows => {
                self.asm.push_sp(Reg::X0); // the header
                self.asm.load_imm64_compact(Reg::X0, (-12i64) as u64);
                self.iat_call("GetStdHandle");
                self.asm.pop_sp(Reg::X1);
                self.asm.push_sp(Reg::X0); // the handle survives the write
                self.asm.ldr(Reg::X2, Reg::X1, WORD as i64, 8);
                self.asm.ldr(Reg::X1, Reg::X1, 0, 8);
                self.emit_write_file();

                let newline = self.newline_rodata();
                self.asm.pop_sp(Reg::X0);
                self.load_rodata_address(Reg::X1, newline);
                self.asm.movz(Reg::X2, 1, 0);
                self.emit_write_file();

                self.asm.movz(Reg::X0, 2, 0);
                self.iat_call("ExitProcess");
            }
        }
    }

    /// WriteFile(x0 handle, x1 buf, x2 len, &scratch, 0); the result
    /// is discarded (panic path)
    fn emit_write_file(&mut self) {
        self.asm.sub_sp(16);
        self.asm.mov_from_sp(Reg::X3);
        self.asm.movz(Reg::X4, 0, 0);
        self.iat_call("WriteFile");
        self.asm.add_sp(16);
    }

    //
    // intrinsics
    //

    fn emit_enosys(&mut self, argc: usize) {
        for _ in 0..argc {
            self.pop_reg(Reg::X0);
        }
        self.asm.movz(Reg::X0, 0, 0);
        self.emit_push(Reg::X0);
        self.emit_push(Reg::X0);
        self.asm.movz(Reg::X0, ENOSYS as u16, 0);
        self.emit_push(Reg::X0);
    }

    /// after a libSystem call: x0 < 0 means failure, errno comes from
    /// ___error. success pushes (x0, 0, 0).
    fn emit_darwin_triple(&mut self) {
        self.asm.cmp_ri(Reg::X0, 0);
        let failed = self.asm.b_cond(Cond::Lt);
        self.emit_push(Reg::X0);
        self.asm.movz(Reg::X1, 0, 0);
        self.emit_push(Reg::X1);
        self.emit_push(Reg::X1);
        let done = self.asm.b();
        let here = self.asm.pos();
        patch_b_cond(&mut self.asm.buf, failed, here);
        self.got_call("___error");
        self.asm.ldr(Reg::X1, Reg::X0, 0, 4);
        self.asm.movz(Reg::X0, 0, 0);
        self.emit_push(Reg::X0);
        self.emit_push(Reg::X0);
        self.emit_push(Reg::X1);
        let here = self.asm.pos();
        patch_b(&mut self.asm.buf, done, here);
    }

    /// success path pushes (x0, x2, 0) instead
    fn emit_darwin_triple_r2(&mut self) {
        self.asm.cmp_ri(Reg::X0, 0);
        let failed = self.asm.b_cond(Cond::Lt);
        self.emit_push(Reg::X0);
        self.emit_push(Reg::X2);
        self.asm.movz(Reg::X1, 0, 0);
        self.emit_push(Reg::X1);
        let done = self.asm.b();
        let here = self.asm.pos();
        patch_b_cond(&mut self.asm.buf, failed, here);
        self.got_call("___error");
        self.asm.ldr(Reg::X1, Reg::X0, 0, 4);
        self.asm.movz(Reg::X0, 0, 0);
        self.emit_push(Reg::X0);
        self.emit_push(Reg::X0);
        self.emit_push(Reg::X1);
        let here = self.asm.pos();
        patch_b(&mut self.asm.buf, done, here);
    }

    /// pop argc arguments into x0..x(argc-1) and call the libSystem
    /// function, then produce the standard triple
    fn darwin_call_triple(&mut self, symbol: &str, argc: usize) {
        const ARG_REGS: [Reg; 4] = [Reg::X0, Reg::X1, Reg::X2, Reg::X3];
        for index in (0..argc).rev() {
            self.pop_reg(ARG_REGS[index]);
        }
        self.got_call(symbol);
        self.emit_darwin_triple();
    }

    fn lower_darwin_intrinsic(&mut self, name: &str) -> Result<(), CodeGenError> {
        match name {
            "SysRead" => self.darwin_call_triple("_read", 3),
            "SysWrite" => self.darwin_call_triple("_write", 3),
            "SysOpen" => self.darwin_call_triple("_open", 3),
            "SysClose" => self.darwin_call_triple("_close", 1),
            "SysMkdir" => self.darwin_call_triple("_mkdir", 2),
            "SysRmdir" => self.darwin_call_triple("_rmdir", 1),
            "SysUnlink" => self.darwin_call_triple("_unlink", 1),
            "SysGetcwd" => self.darwin_call_triple("_getcwd", 2),
            "SysChmod" => self.darwin_call_triple("_chmod", 2),
            "SysDup2" => self.darwin_call_triple("_dup2", 2),
            "SysFork" => self.darwin_call_triple("_fork", 0),
            "SysExecve" => self.darwin_call_triple("_execve", 3),
            "SysGetpid" => self.darwin_call_triple("_getpid", 0),
            "SysExit" => {
                self.pop_reg(Reg::X0);
                self.got_call("_exit");
                self.asm.brk();
            }
            "SysMmap" => {
                self.pop_reg(Reg::X1);
                self.asm.movz(Reg::X0, 0, 0);
                self.asm.movz(Reg::X2, 3, 0);
                self.asm.load_imm64_compact(Reg::X3, DARWIN_MAP_FLAGS);
                self.asm.load_imm64_compact(Reg::X4, (-1i64) as u64);
                self.asm.movz(Reg::X5, 0, 0);
                self.got_call("_mmap");
                self.emit_darwin_triple();
            }
            "SysPipe" => {
                self.asm.sub_sp(16);
                self.asm.mov_from_sp(Reg::X0);
                self.got_call("_pipe");
                self.asm.mov_from_sp(Reg::X3);
                self.asm.ldr(Reg::X1, Reg::X3, 0, 4);
                self.asm.ldr(Reg::X2, Reg::X3, 4, 4);
                self.asm.add_sp(16);
                self.asm.cmp_ri(Reg::X0, 0);
                let failed = self.asm.b_cond(Cond::Lt);
                self.emit_push(Reg::X1);
                self.emit_push(Reg::X2);
                self.asm.movz(Reg::X1, 0, 0);
                self.emit_push(Reg::X1);
                let done = self.asm.b();
                let here = self.asm.pos();
                patch_b_cond(&mut self.asm.buf, failed, here);
                self.got_call("___error");
                self.asm.ldr(Reg::X1, Reg::X0, 0, 4);
                self.asm.movz(Reg::X0, 0, 0);
                self.emit_push(Reg::X0);
                self.emit_push(Reg::X0);
                self.emit_push(Reg::X1);
                let here = self.asm.pos();
                patch_b(&mut self.asm.buf, done, here);
            }
            "SysWait4" => {
                // wait4(pid, &status, 0, 0); r2 is the status word
                self.pop_reg(Reg::X0);
                self.asm.sub_sp(16);
                self.asm.mov_from_sp(Reg::X1);
                self.asm.movz(Reg::X2, 0, 0);
                self.asm.movz(Reg::X3, 0, 0);
                self.got_call("_wait4");
                self.asm.mov_from_sp(Reg::X3);
                self.asm.ldr(Reg::X2, Reg::X3, 0, 4);
                self.asm.add_sp(16);
                self.emit_darwin_triple_r2();
            }
            "SysStat" => {
                // stat(path, &buf); r1 = st_size, r2 = st_mode
                self.pop_reg(Reg::X0);
                self.asm.sub_sp(160);
                self.asm.mov_from_sp(Reg::X1);
                self.got_call("_stat");
                self.asm.mov_from_sp(Reg::X3);
                self.asm.ldr(Reg::X1, Reg::X3, 96, 8);
                self.asm.ldr(Reg::X2, Reg::X3, 4, 2);
                self.asm.add_sp(160);
                self.asm.cmp_ri(Reg::X0, 0);
                let failed = self.asm.b_cond(Cond::Lt);
                self.emit_push(Reg::X1);
                self.emit_push(Reg::X2);
                self.asm.movz(Reg::X1, 0, 0);
                self.emit_push(Reg::X1);
                let done = self.asm.b();
                let here = self.asm.pos();
                patch_b_cond(&mut self.asm.buf, failed, here);
                self.got_call("___error");
                self.asm.ldr(Reg::X1, Reg::X0, 0, 4);
                self.asm.movz(Reg::X0, 0, 0);
                self.emit_push(Reg::X0);
                self.emit_push(Reg::X0);
                self.emit_push(Reg::X1);
                let here = self.asm.pos();
                patch_b(&mut self.asm.buf, done, here);
            }
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

    /// convert the descriptor in x0: 0/1/2 become standard handles
    fn emit_fd_to_handle(&mut self) {
        self.asm.cmp_ri(Reg::X0, 3);
        let passthrough = self.asm.b_cond(Cond::Ge);
        // GetStdHandle(-10 - fd)
        self.asm.load_imm64_compact(Reg::X1, (-10i64) as u64);
        self.asm.sub_rr(Reg::X0, Reg::X1, Reg::X0);
        self.iat_call("GetStdHandle");
        let here = self.asm.pos();
        patch_b_cond(&mut self.asm.buf, passthrough, here);
    }

    /// the out-value slot is at [sp]; both paths release it.
    /// success: r1 = the 32-bit out value; failure: GetLastError.
    fn emit_win_triple_with_out(&mut self) {
        self.asm.cmp_ri(Reg::X0, 0);
        let failed = self.asm.b_cond(Cond::Eq);
        self.asm.mov_from_sp(Reg::X1);
        self.asm.ldr(Reg::X1, Reg::X1, 0, 4);
        self.asm.add_sp(16);
        self.emit_push(Reg::X1);
        self.asm.movz(Reg::X1, 0, 0);
        self.emit_push(Reg::X1);
        self.emit_push(Reg::X1);
        let done = self.asm.b();
        let here = self.asm.pos();
        patch_b_cond(&mut self.asm.buf, failed, here);
        self.asm.add_sp(16);
        self.iat_call("GetLastError");
        self.asm.mov_rr(Reg::X1, Reg::X0);
        self.asm.movz(Reg::X0, 0, 0);
        self.emit_push(Reg::X0);
        self.emit_push(Reg::X0);
        self.emit_push(Reg::X1);
        let here = self.asm.pos();
        patch_b(&mut self.asm.buf, done, here);
    }

    /// plain BOOL result, no out slot
    fn emit_win_triple_bool(&mut self) {
        self.asm.cmp_ri(Reg::X0, 0);
        let failed = self.asm.b_cond(Cond::Eq);
        self.asm.movz(Reg::X0, 0, 0);
        self.emit_push(Reg::X0);
        self.emit_push(Reg::X0);
        self.emit_push(Reg::X0);
        let done = self.asm.b();
        let here = self.asm.pos();
        patch_b_cond(&mut self.asm.buf, failed, here);
        self.iat_call("GetLastError");
        self.asm.mov_rr(Reg::X1, Reg::X0);
        self.asm.movz(Reg::X0, 0, 0);
        self.emit_push(Reg::X0);
        self.emit_push(Reg::X0);
        self.emit_push(Reg::X1);
        let here = self.asm.pos();
        patch_b(&mut self.asm.buf, done, here);
    }

    /// x0 already holds r1 and the call cannot fail
    fn emit_raw_triple(&mut self) {
        self.emit_push(Reg::X0);
        self.asm.movz(Reg::X1, 0, 0);
        self.emit_push(Reg::X1);
        self.emit_push(Reg::X1);
    }

    fn lower_windows_intrinsic(&mut self, name: &str) -> Result<(), CodeGenError> {
        match name {
            "SysWrite" | "SysRead" => {
                self.pop_reg(Reg::X2); // length
                self.pop_reg(Reg::X1); // buffer
                self.pop_reg(Reg::X0); // descriptor
                self.asm.push_sp(Reg::X1);
                self.asm.push_sp(Reg::X2);
                self.emit_fd_to_handle();
                self.asm.pop_sp(Reg::X2);
                self.asm.pop_sp(Reg::X1);
                self.asm.sub_sp(16);
                self.asm.mov_from_sp(Reg::X3);
                self.asm.movz(Reg::X4, 0, 0);
                self.iat_call(if name == "SysWrite" {
                    "WriteFile"
                } else {
                    "ReadFile"
                });
                self.emit_win_triple_with_out();
            }
            "SysOpen" => {
                self.pop_reg(Reg::X2); // mode, unused
                self.pop_reg(Reg::X1); // flags
                self.pop_reg(Reg::X0); // path
                // flags == 0 selects read, anything else create+write
                self.asm.cmp_ri(Reg::X1, 0);
                let writing = self.asm.b_cond(Cond::Ne);
                self.asm.load_imm64_compact(Reg::X1, 0x8000_0000); // GENERIC_READ
                self.asm.movz(Reg::X4, 3, 0); // OPEN_EXISTING
                let chosen = self.asm.b();
                let here = self.asm.pos();
                patch_b_cond(&mut self.asm.buf, writing, here);
                self.asm.load_imm64_compact(Reg::X1, 0x4000_0000); // GENERIC_WRITE
                self.asm.movz(Reg::X4, 2, 0); // CREATE_ALWAYS
                let here = self.asm.pos();
                patch_b(&mut self.asm.buf, chosen, here);
                self.asm.movz(Reg::X2, 1, 0); // FILE_SHARE_READ
                self.asm.movz(Reg::X3, 0, 0);
                self.asm.movz(Reg::X5, 0x80, 0); // FILE_ATTRIBUTE_NORMAL
                self.asm.movz(Reg::X6, 0, 0);
                self.iat_call("CreateFileA");
                // INVALID_HANDLE_VALUE is -1
                self.asm.load_imm64_compact(Reg::X17, (-1i64) as u64);
                self.asm.cmp_rr(Reg::X0, Reg::X17);
                let failed = self.asm.b_cond(Cond::Eq);
                self.emit_push(Reg::X0);
                self.asm.movz(Reg::X1, 0, 0);
                self.emit_push(Reg::X1);
                self.emit_push(Reg::X1);
                let done = self.asm.b();
                let here = self.asm.pos();
                patch_b_cond(&mut self.asm.buf, failed, here);
                self.iat_call("GetLastError");
                self.asm.mov_rr(Reg::X1, Reg::X0);
                self.asm.movz(Reg::X0, 0, 0);
                self.emit_push(Reg::X0);
                self.emit_push(Reg::X0);
                self.emit_push(Reg::X1);
                let here = self.asm.pos();
                patch_b(&mut self.asm.buf, done, here);
            }
            "SysClose" => {
                self.pop_reg(Reg::X0);
                self.iat_call("CloseHandle");
                self.emit_win_triple_bool();
            }
            "SysMkdir" => {
                self.pop_reg(Reg::X1); // mode, unused
                self.pop_reg(Reg::X0);
                self.asm.movz(Reg::X1, 0, 0);
                self.iat_call("CreateDirectoryA");
                self.emit_win_triple_bool();
            }
            "SysRmdir" => {
                self.pop_reg(Reg::X0);
                self.iat_call("RemoveDirectoryA");
                self.emit_win_triple_bool();
            }
            "SysUnlink" => {
                self.pop_reg(Reg::X0);
                self.iat_call("DeleteFileA");
                self.emit_win_triple_bool();
            }
            "SysGetcwd" => {
                self.pop_reg(Reg::X0); // size
                self.pop_reg(Reg::X1); // buffer
                self.iat_call("GetCurrentDirectoryA");
                self.emit_raw_triple();
            }
            "SysChmod" => {
                self.pop_reg(Reg::X0);
                self.pop_reg(Reg::X0);
                self.asm.movz(Reg::X0, 0, 0);
                self.emit_push(Reg::X0);
                self.emit_push(Reg::X0);
                self.emit_push(Reg::X0);
            }
            "SysGetpid" => {
                self.iat_call("GetCurrentProcessId");
                self.emit_raw_triple();
            }
            "SysExit" => {
                self.pop_reg(Reg::X0);
                self.iat_call("ExitProcess");
                self.asm.brk();
            }
            "SysMmap" => {
                self.pop_reg(Reg::X1);
                self.asm.movz(Reg::X0, 0, 0);
                self.asm.load_imm64_compact(Reg::X2, 0x3000);
                self.asm.movz(Reg::X3, 4, 0);
                self.iat_call("VirtualAlloc");
                self.asm.cmp_ri(Reg::X0, 0);
                let failed = self.asm.b_cond(Cond::Eq);
                self.emit_push(Reg::X0);
                self.asm.movz(Reg::X1, 0, 0);
                self.emit_push(Reg::X1);
                self.emit_push(Reg::X1);
                let done = self.asm.b();
                let here = self.asm.pos();
                patch_b_cond(&mut self.asm.buf, failed, here);
                self.iat_call("GetLastError");
                self.asm.mov_rr(Reg::X1, Reg::X0);
                self.asm.movz(Reg::X0, 0, 0);
                self.emit_push(Reg::X0);
                self.emit_push(Reg::X0);
                self.emit_push(Reg::X1);
                let here = self.asm.pos();
                patch_b(&mut self.asm.buf, done, here);
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
                self.load_data_address(Reg::X1, offset);
                self.asm.ldr(Reg::X0, Reg::X1, 0, 8);
                self.push_pending(Reg::X0);
                return Ok(());
            }
            "Sliceptr" | "Stringptr" | "ReadPtr" => {
                self.pop_reg(Reg::X0);
                self.asm.ldr(Reg::X0, Reg::X0, 0, 8);
                self.push_pending(Reg::X0);
                return Ok(());
            }
            "WritePtr" => {
                self.pop_reg(Reg::X1);
                self.pop_reg(Reg::X0);
                self.asm.str_(Reg::X1, Reg::X0, 0, 8);
                return Ok(());
            }
            "WriteByte" => {
                self.pop_reg(Reg::X1);
                self.pop_reg(Reg::X0);
                self.asm.str_(Reg::X1, Reg::X0, 0, 1);
                return Ok(());
            }
            "Makestring" => {
                self.pop_reg(Reg::X0);
                self.asm.push_sp(Reg::X0);
                self.pop_reg(Reg::X0);
                self.asm.push_sp(Reg::X0);
                self.asm.load_imm64_compact(Reg::X0, (2 * WORD) as u64);
                self.emit_push(Reg::X0);
                self.call_func("runtime.Alloc");
                self.pop_reg(Reg::X0);
                self.asm.pop_sp(Reg::X1);
                self.asm.str_(Reg::X1, Reg::X0, 0, 8);
                self.asm.pop_sp(Reg::X1);
                self.asm.str_(Reg::X1, Reg::X0, WORD as i64, 8);
                self.push_pending(Reg::X0);
                return Ok(());
            }
            "Makeslice" => {
                for _ in 0..4 {
                    self.pop_reg(Reg::X0);
                    self.asm.push_sp(Reg::X0);
                }
                self.asm.load_imm64_compact(Reg::X0, (4 * WORD) as u64);
                self.emit_push(Reg::X0);
                self.call_func("runtime.Alloc");
                self.pop_reg(Reg::X0);
                for index in 0..4 {
                    self.asm.pop_sp(Reg::X1);
                    self.asm.str_(Reg::X1, Reg::X0, (index * WORD) as i64, 8);
                }
                self.push_pending(Reg::X0);
                return Ok(());
            }
            "Tostring" => {
                self.lower_tostring();
                return Ok(());
            }
            _ => {}
        }

        match self.os {
            Os::Darwin => self.lower_darwin_intrinsic(name),
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
                Some(target) => patch_b(&mut self.asm.buf, fixup.at, *target),
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
            got_symbols: self.got_symbols,
            iat_symbols: self.iat_symbols,
            funcs: self.funcs,
        };
        Ok((image, generated))
    }
}

fn compile(module: &IRModule, os: Os) -> Result<(ProgramImage, Generated), CodeGenError> {
    let mut gen = Arm64Codegen::new(module, os);
    gen.emit_entry_stub();
    for func in &module.funcs {
        gen.compile_func(func)?;
    }
    debug!(
        "arm64/{:?}: {} functions, {} bytes of code",
        os,
        module.funcs.len(),
        gen.asm.buf.len()
    );
    gen.finish(0)
}

pub fn generate_darwin_arm64(module: &IRModule, path: &Path) -> Result<Generated, CodeGenError> {
    let (image, generated) = compile(module, Os::Darwin)?;
    macho::write_macho_arm64(image, path)?;
    Ok(generated)
}

pub fn generate_windows_arm64(module: &IRModule, path: &Path) -> Result<Generated, CodeGenError> {
    let (image, generated) = compile(module, Os::Windows)?;
    pe::write_pe_arm64(image, path)?;
    Ok(generated)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use rtg_ir::opcode::Opcode;
    use rtg_ir::{IRFunc, IRModule, Inst};
    use rtg_object::{PatchKind, SectRef};

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
    fn test_darwin_uses_got_and_adrp() {
        let module = module_with_main(vec![
            Inst::with_name(Opcode::const_str, "\"hi\""),
            Inst::new(Opcode::drop),
            Inst::with_value(Opcode::const_i64, 0),
            Inst::intrinsic("SysExit"),
        ]);
        let (image, _) = super::compile(&module, super::Os::Darwin).unwrap();

        assert!(image.got_symbols.iter().any(|s| s == "_malloc"));
        assert!(image.got_symbols.iter().any(|s| s == "_exit"));
        // string materialization leaves adrp pairs for both sections
        assert!(image.sect_fixups.iter().any(|f| {
            f.section == SectRef::RodataHeader && f.kind == PatchKind::AdrpAdd
        }));
        assert!(image
            .sect_fixups
            .iter()
            .any(|f| { f.section == SectRef::DataAddr && f.kind == PatchKind::AdrpAdd }));
        // no link-time header patches on darwin
        assert!(image.string_headers.is_empty());
    }

    #[test]
    fn test_windows_uses_mov_sequences() {
        let module = module_with_main(vec![
            Inst::with_name(Opcode::const_str, "\"hi\""),
            Inst::new(Opcode::drop),
            Inst::with_value(Opcode::const_i64, 0),
            Inst::intrinsic("SysExit"),
        ]);
        let (image, _) = super::compile(&module, super::Os::Windows).unwrap();

        assert!(image.iat_symbols.iter().any(|s| s == "VirtualAlloc"));
        assert!(image.iat_symbols.iter().any(|s| s == "ExitProcess"));
        assert!(image
            .sect_fixups
            .iter()
            .all(|f| f.kind == PatchKind::MovSeq64));
        assert_eq!(image.string_headers.len(), 1);

        // every movz/movk fixup site is exactly 4 instructions of
        // movz/movk so the patcher can rewrite it in place
        for fixup in &image.sect_fixups {
            for i in 0..4 {
                let instr = u32::from_le_bytes(
                    image.code[fixup.at + i * 4..fixup.at + i * 4 + 4]
                        .try_into()
                        .unwrap(),
                );
                let top = instr & 0xff80_0000;
                assert!(
                    top == 0xd280_0000 || top == 0xf280_0000 || top == 0xf2a0_0000
                        || top == 0xf2c0_0000 || top == 0xf2e0_0000,
                    "instruction {instr:#010x} at fixup is part of a mov sequence"
                );
            }
        }
    }

    #[test]
    fn test_branch_resolution_recovers_kind() {
        let module = module_with_main(vec![
            Inst::with_value(Opcode::const_i64, 1),
            Inst::with_arg(Opcode::jmp_if, 7),
            Inst::with_arg(Opcode::jmp, 7),
            Inst::with_arg(Opcode::label, 7),
            Inst::new(Opcode::return_),
        ]);
        let (image, generated) = super::compile(&module, super::Os::Darwin).unwrap();
        let (_, offset) = &generated.funcs[0];

        // scan the function for a b.cond (0x54 top byte) and a b
        // (0x14 top 6 bits) that both land inside the function
        let code = &image.code[*offset..];
        let mut saw_cond = false;
        let mut saw_plain = false;
        for i in (0..code.len()).step_by(4) {
            let instr = u32::from_le_bytes(code[i..i + 4].try_into().unwrap());
            if instr >> 24 == 0x54 {
                saw_cond = true;
            }
            if instr >> 26 == 0x05 {
                saw_plain = true;
            }
        }
        assert!(saw_cond);
        assert!(saw_plain);
    }

    #[test]
    fn test_prologue_keeps_sp_aligned() {
        let module = module_with_main(vec![Inst::new(Opcode::return_)]);
        let (image, generated) = super::compile(&module, super::Os::Darwin).unwrap();
        let (_, offset) = &generated.funcs[0];
        // stp x29, x30, [sp, #-16]!
        let first = u32::from_le_bytes(image.code[*offset..*offset + 4].try_into().unwrap());
        assert_eq!(first, 0xa9bf_7bfd);
    }
}
