// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// linux/amd64 code generator.
//
// register assignment:
//
//   r15        operand-stack top pointer (grows down)
//   rbp / rsp  frame pointer / machine stack
//   rax rcx rdx  scratch, rax is the usual pending-push register
//
// OS intrinsics are raw syscalls; the kernel returns -errno in rax,
// which maps directly onto the (r1, r2, err) triple convention.
//
// the load address is fixed (no PIE), so rodata, data and global
// addresses are 64-bit absolute immediates patched by the elf writer.

use std::collections::HashMap;
use std::path::Path;

use log::debug;

use rtg_asm::x64::{patch_rel32, Cond, Emitter, Reg};
use rtg_ir::literal::{decode_string_literal, is_init_func};
use rtg_ir::opcode::Opcode;
use rtg_ir::{IRFunc, IRModule, Inst, TYPE_ID_INT, TYPE_ID_STRING};
use rtg_object::{
    align_up, elf, FuncSym, PatchKind, ProgramImage, SectFixup, SectRef, StringHeader,
};

use crate::{
    intrinsic_argc, tostring_impls, BranchFixup, CallFixup, CodeGenError, Generated, StringPool,
    ENOSYS, RESERVED_GLOBALS,
};

const WORD: usize = 8;
const OPERAND_STACK_SIZE: i64 = 1 << 20; // 1 MiB on unix

// linux x86-64 syscall numbers
const SYS_READ: i64 = 0;
const SYS_WRITE: i64 = 1;
const SYS_OPEN: i64 = 2;
const SYS_CLOSE: i64 = 3;
const SYS_STAT: i64 = 4;
const SYS_MMAP: i64 = 9;
const SYS_PIPE: i64 = 22;
const SYS_DUP2: i64 = 33;
const SYS_GETPID: i64 = 39;
const SYS_FORK: i64 = 57;
const SYS_EXECVE: i64 = 59;
const SYS_EXIT: i64 = 60;
const SYS_WAIT4: i64 = 61;
const SYS_GETCWD: i64 = 79;
const SYS_MKDIR: i64 = 83;
const SYS_RMDIR: i64 = 84;
const SYS_UNLINK: i64 = 87;
const SYS_CHMOD: i64 = 90;

struct X64Codegen<'a> {
    module: &'a IRModule,
    asm: Emitter,
    rodata: Vec<u8>,
    data: Vec<u8>,
    strings: StringPool,
    func_offsets: HashMap<String, usize>,
    funcs: Vec<FuncSym>,
    call_fixups: Vec<CallFixup>,
    sect_fixups: Vec<SectFixup>,
    string_headers: Vec<StringHeader>,

    // per-function state, reset by compile_func
    branch_fixups: Vec<BranchFixup>,
    label_offsets: HashMap<i64, usize>,
    pending: Option<Reg>,
    cur_func: String,
    cur_pitch: usize,
    newline: Option<usize>,
}

impl<'a> X64Codegen<'a> {
    fn new(module: &'a IRModule) -> Self {
        Self {
            module,
            asm: Emitter::new(),
            rodata: Vec::new(),
            data: vec![0u8; (module.globals + RESERVED_GLOBALS) * WORD],
            strings: StringPool::new(WORD),
            func_offsets: HashMap::new(),
            funcs: Vec::new(),
            call_fixups: Vec::new(),
            sect_fixups: Vec::new(),
            string_headers: Vec::new(),
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
        self.asm.store_mem(Reg::R15, -(WORD as i32), reg, 8);
        self.asm.sub_ri(Reg::R15, WORD as i32);
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
            self.asm.load_mem(reg, Reg::R15, 0, 8);
            self.asm.add_ri(Reg::R15, WORD as i32);
        }
    }

    //
    // section references
    //

    /// load the absolute address of data + offset into a register
    fn load_data_addr(&mut self, reg: Reg, offset: usize) {
        let field = self.asm.mov_ri64(reg, 0);
        self.sect_fixups.push(SectFixup {
            at: field,
            section: SectRef::DataAddr,
            offset: offset as u64,
            kind: PatchKind::Abs64,
        });
    }

    fn load_rodata_addr(&mut self, reg: Reg, offset: usize) {
        let field = self.asm.mov_ri64(reg, 0);
        self.sect_fixups.push(SectFixup {
            at: field,
            section: SectRef::RodataHeader,
            offset: offset as u64,
            kind: PatchKind::Abs64,
        });
    }

    fn global_offset(&self, index: i64) -> usize {
        index as usize * WORD
    }

    fn call_func(&mut self, name: &str) {
        self.flush();
        let at = self.asm.call_rel32();
        self.call_fixups.push(CallFixup {
            at,
            name: name.to_owned(),
        });
    }

    //
    // entry stub
    //

    fn emit_entry_stub(&mut self) {
        let argc_slot = self.module.globals * WORD;

        // argc, argv and envp from the initial machine stack into the
        // reserved global slots
        self.asm.load_mem(Reg::Rax, Reg::Rsp, 0, 8);
        self.load_data_addr(Reg::Rcx, argc_slot);
        self.asm.store_mem(Reg::Rcx, 0, Reg::Rax, 8);
        self.asm.lea(Reg::Rdx, Reg::Rsp, 8);
        self.asm.store_mem(Reg::Rcx, 8, Reg::Rdx, 8);
        // envp = rsp + (argc + 2) * 8
        self.asm.mov_rr(Reg::Rdx, Reg::Rax);
        self.asm.shl_imm8(Reg::Rdx, 3);
        self.asm.add_rr(Reg::Rdx, Reg::Rsp);
        self.asm.add_ri(Reg::Rdx, 2 * WORD as i32);
        self.asm.store_mem(Reg::Rcx, 16, Reg::Rdx, 8);

        // operand stack: mmap(0, 1 MiB, rw, private|anonymous, -1, 0)
        self.asm.load_imm(Reg::Rdi, 0);
        self.asm.load_imm(Reg::Rsi, OPERAND_STACK_SIZE);
        self.asm.load_imm(Reg::Rdx, 3);
        self.asm.load_imm(Reg::R10, 0x22);
        self.asm.load_imm(Reg::R8, -1);
        self.asm.load_imm(Reg::R9, 0);
        self.asm.load_imm(Reg::Rax, SYS_MMAP);
        self.asm.syscall();
        self.asm.mov_rr(Reg::R15, Reg::Rax);
        self.asm.add_ri(Reg::R15, OPERAND_STACK_SIZE as i32);

        // package initializers in declaration order, then main
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

        self.asm.load_imm(Reg::Rdi, 0);
        self.asm.load_imm(Reg::Rax, SYS_EXIT);
        self.asm.syscall();
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

        // prologue
        self.asm.push(Reg::Rbp);
        self.asm.mov_rr(Reg::Rbp, Reg::Rsp);
        if frame > 0 {
            self.asm.sub_ri(Reg::Rsp, frame as i32);
        }

        // parameters arrive on the operand stack, rightmost on top
        for index in (0..func.params).rev() {
            self.pop_reg(Reg::Rax);
            let disp = self.local_disp(index);
            self.asm.store_mem(Reg::Rbp, disp, Reg::Rax, 8);
        }

        for inst in &func.insts {
            self.lower_inst(func, inst)?;
        }

        // the pending buffer must never survive a function body
        debug_assert!(self.pending.is_none());

        // resolve the branches of this function
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
                self.asm.load_imm(Reg::Rax, inst.value);
                self.push_pending(Reg::Rax);
            }
            Opcode::const_nil => {
                self.asm.load_imm(Reg::Rax, 0);
                self.push_pending(Reg::Rax);
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
                self.load_data_addr(Reg::Rax, header);
                self.push_pending(Reg::Rax);
            }

            Opcode::local_get => {
                let index = inst.arg as usize;
                let width = self.local_width(func, index);
                let disp = self.local_disp(index);
                self.asm.load_mem(Reg::Rax, Reg::Rbp, disp, width);
                self.push_pending(Reg::Rax);
            }
            Opcode::local_set => {
                let index = inst.arg as usize;
                let width = self.local_width(func, index);
                let disp = self.local_disp(index);
                self.pop_reg(Reg::Rax);
                self.asm.store_mem(Reg::Rbp, disp, Reg::Rax, width);
            }
            Opcode::local_addr => {
                let disp = self.local_disp(inst.arg as usize);
                self.asm.lea(Reg::Rax, Reg::Rbp, disp);
                self.push_pending(Reg::Rax);
            }

            Opcode::global_get => {
                let offset = self.global_offset(inst.arg);
                self.load_data_addr(Reg::Rcx, offset);
                self.asm.load_mem(Reg::Rax, Reg::Rcx, 0, 8);
                self.push_pending(Reg::Rax);
            }
            Opcode::global_set => {
                let offset = self.global_offset(inst.arg);
                self.pop_reg(Reg::Rax);
                self.load_data_addr(Reg::Rcx, offset);
                self.asm.store_mem(Reg::Rcx, 0, Reg::Rax, 8);
            }
            Opcode::global_addr => {
                let offset = self.global_offset(inst.arg);
                self.load_data_addr(Reg::Rax, offset);
                self.push_pending(Reg::Rax);
            }

            Opcode::drop => {
                if self.pending.take().is_none() {
                    self.asm.add_ri(Reg::R15, WORD as i32);
                }
            }
            Opcode::dup => {
                self.pop_reg(Reg::Rax);
                self.emit_push(Reg::Rax);
                self.push_pending(Reg::Rax);
            }

            Opcode::add | Opcode::sub | Opcode::mul | Opcode::and | Opcode::or | Opcode::xor => {
                self.pop_reg(Reg::Rcx);
                self.pop_reg(Reg::Rax);
                match inst.opcode {
                    Opcode::add => self.asm.add_rr(Reg::Rax, Reg::Rcx),
                    Opcode::sub => self.asm.sub_rr(Reg::Rax, Reg::Rcx),
                    Opcode::mul => self.asm.imul_rr(Reg::Rax, Reg::Rcx),
                    Opcode::and => self.asm.and_rr(Reg::Rax, Reg::Rcx),
                    Opcode::or => self.asm.or_rr(Reg::Rax, Reg::Rcx),
                    _ => self.asm.xor_rr(Reg::Rax, Reg::Rcx),
                }
                self.push_pending(Reg::Rax);
            }
            Opcode::div | Opcode::mod_ => {
                self.pop_reg(Reg::Rcx);
                self.pop_reg(Reg::Rax);
                self.asm.cqo();
                self.asm.idiv(Reg::Rcx);
                let result = if inst.opcode == Opcode::div {
                    Reg::Rax
                } else {
                    Reg::Rdx
                };
                self.push_pending(result);
            }
            Opcode::neg => {
                self.pop_reg(Reg::Rax);
                self.asm.neg(Reg::Rax);
                self.push_pending(Reg::Rax);
            }
            Opcode::not => {
                self.pop_reg(Reg::Rax);
                self.asm.not(Reg::Rax);
                self.push_pending(Reg::Rax);
            }
            Opcode::shl | Opcode::shr => {
                self.pop_reg(Reg::Rcx);
                self.pop_reg(Reg::Rax);
                if inst.opcode == Opcode::shl {
                    self.asm.shl_cl(Reg::Rax);
                } else {
                    self.asm.sar_cl(Reg::Rax);
                }
                self.push_pending(Reg::Rax);
            }

            Opcode::eq | Opcode::neq | Opcode::lt | Opcode::gt | Opcode::leq | Opcode::geq => {
                self.pop_reg(Reg::Rcx);
                self.pop_reg(Reg::Rax);
                self.asm.cmp_rr(Reg::Rax, Reg::Rcx);
                let cond = match inst.opcode {
                    Opcode::eq => Cond::Eq,
                    Opcode::neq => Cond::Ne,
                    Opcode::lt => Cond::Lt,
                    Opcode::gt => Cond::Gt,
                    Opcode::leq => Cond::Le,
                    _ => Cond::Ge,
                };
                self.asm.set_cond(cond, Reg::Rax);
                self.push_pending(Reg::Rax);
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
                self.pop_reg(Reg::Rax);
                self.flush();
                self.asm.test_rr(Reg::Rax, Reg::Rax);
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
                self.lower_intrinsic(&name, inst.arg)?;
            }
            Opcode::return_ => {
                self.flush();
                self.asm.mov_rr(Reg::Rsp, Reg::Rbp);
                self.asm.pop(Reg::Rbp);
                self.asm.ret();
            }

            Opcode::load => {
                let width = Self::width_of(inst.width);
                self.pop_reg(Reg::Rax);
                self.asm.load_imm(Reg::Rcx, 0);
                self.asm.test_rr(Reg::Rax, Reg::Rax);
                let skip = self.asm.jcc_rel32(Cond::Eq);
                self.asm.load_mem(Reg::Rcx, Reg::Rax, 0, width);
                let here = self.asm.pos();
                patch_rel32(&mut self.asm.buf, skip, here);
                self.push_pending(Reg::Rcx);
            }
            Opcode::store => {
                let width = Self::width_of(inst.width);
                self.pop_reg(Reg::Rcx);
                self.pop_reg(Reg::Rax);
                self.asm.store_mem(Reg::Rax, 0, Reg::Rcx, width);
            }
            Opcode::offset => {
                self.pop_reg(Reg::Rax);
                self.asm.add_ri(Reg::Rax, inst.arg as i32);
                self.push_pending(Reg::Rax);
            }
            Opcode::index_addr => {
                self.pop_reg(Reg::Rcx);
                self.pop_reg(Reg::Rax);
                self.asm.load_mem(Reg::Rax, Reg::Rax, 0, 8);
                match inst.value {
                    1 => {}
                    8 => self.asm.shl_imm8(Reg::Rcx, 3),
                    4 => self.asm.shl_imm8(Reg::Rcx, 2),
                    size => {
                        self.asm.load_imm(Reg::Rdx, size);
                        self.asm.imul_rr(Reg::Rcx, Reg::Rdx);
                    }
                }
                self.asm.add_rr(Reg::Rax, Reg::Rcx);
                self.push_pending(Reg::Rax);
            }
            Opcode::len => {
                self.pop_reg(Reg::Rax);
                self.asm.load_imm(Reg::Rcx, 0);
                self.asm.test_rr(Reg::Rax, Reg::Rax);
                let skip = self.asm.jcc_rel32(Cond::Eq);
                self.asm.load_mem(Reg::Rcx, Reg::Rax, WORD as i32, 8);
                let here = self.asm.pos();
                patch_rel32(&mut self.asm.buf, skip, here);
                self.push_pending(Reg::Rcx);
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
            "int" | "uint" | "uintptr" | "int64" | "uint64" => {}
            "byte" | "uint8" => {
                self.pop_reg(Reg::Rax);
                self.asm.movzx(Reg::Rax, Reg::Rax, 1);
                self.push_pending(Reg::Rax);
            }
            "uint16" => {
                self.pop_reg(Reg::Rax);
                self.asm.movzx(Reg::Rax, Reg::Rax, 2);
                self.push_pending(Reg::Rax);
            }
            "uint32" => {
                self.pop_reg(Reg::Rax);
                self.asm.mov_rr32(Reg::Rax, Reg::Rax);
                self.push_pending(Reg::Rax);
            }
            "int32" => {
                self.pop_reg(Reg::Rax);
                self.asm.movsxd(Reg::Rax, Reg::Rax);
                self.push_pending(Reg::Rax);
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

    /// builtin.composite.<n>: pop the field values, allocate, fill in
    /// declaration order
    fn lower_composite(&mut self, fields: usize) {
        self.flush();
        for _ in 0..fields {
            self.pop_reg(Reg::Rax);
            self.asm.push(Reg::Rax);
        }
        self.asm.load_imm(Reg::Rax, (fields * WORD) as i64);
        self.emit_push(Reg::Rax);
        self.call_func("runtime.Alloc");
        self.pop_reg(Reg::Rax);
        // the machine stack pops reverse the operand-stack pops, so
        // the fields come back in declaration order
        for index in 0..fields {
            self.asm.pop(Reg::Rcx);
            self.asm
                .store_mem(Reg::Rax, (index * WORD) as i32, Reg::Rcx, 8);
        }
        self.push_pending(Reg::Rax);
    }

    fn lower_iface_box(&mut self, type_id: i64) {
        self.pop_reg(Reg::Rax);
        self.flush();
        self.asm.push(Reg::Rax);
        self.asm.load_imm(Reg::Rax, (2 * WORD) as i64);
        self.emit_push(Reg::Rax);
        self.call_func("runtime.Alloc");
        self.pop_reg(Reg::Rax);
        self.asm.load_imm(Reg::Rcx, type_id);
        self.asm.store_mem(Reg::Rax, 0, Reg::Rcx, 8);
        self.asm.pop(Reg::Rcx);
        self.asm.store_mem(Reg::Rax, WORD as i32, Reg::Rcx, 8);
        self.push_pending(Reg::Rax);
    }

    /// the linear dispatch chain: compare the box type id against each
    /// implementation in method-table order, call the first match
    fn lower_iface_call(&mut self, name: &str, argc: usize) -> Result<(), CodeGenError> {
        let bare = name.rsplit('.').next().unwrap_or(name);
        let impls = self.module.method_impls(bare);
        if impls.is_empty() {
            return Err(CodeGenError::EmptyDispatch {
                name: name.to_owned(),
            });
        }

        self.flush();
        // spill the regular arguments to the machine stack
        for _ in 0..argc {
            self.pop_reg(Reg::Rax);
            self.asm.push(Reg::Rax);
        }
        // the interface box: rdx keeps the type id across the re-push
        // sequence, which only touches rax/rcx
        self.pop_reg(Reg::Rax);
        self.asm.load_mem(Reg::Rdx, Reg::Rax, 0, 8);
        self.asm.load_mem(Reg::Rcx, Reg::Rax, WORD as i32, 8);
        self.emit_push(Reg::Rcx); // receiver
        for _ in 0..argc {
            self.asm.pop(Reg::Rcx);
            self.emit_push(Reg::Rcx);
        }

        let mut done: Vec<usize> = Vec::new();
        for (type_id, impl_name) in impls {
            self.asm.cmp_ri(Reg::Rdx, type_id as i32);
            let next = self.asm.jcc_rel32(Cond::Ne);
            self.call_func(&impl_name);
            done.push(self.asm.jmp_rel32());
            let here = self.asm.pos();
            patch_rel32(&mut self.asm.buf, next, here);
        }
        self.asm.int3(); // no implementation matched

        let here = self.asm.pos();
        for field in done {
            patch_rel32(&mut self.asm.buf, field, here);
        }
        Ok(())
    }

    /// Tostring: string headers pass through, int and string boxes get
    /// special treatment, anything else goes through <type>.Error or
    /// <type>.String
    fn lower_tostring(&mut self) {
        self.pop_reg(Reg::Rax);
        self.flush();
        self.asm.load_mem(Reg::Rcx, Reg::Rax, 0, 8);

        // first word >= 256: already a string header
        self.asm.cmp_ri(Reg::Rcx, 256);
        let not_header = self.asm.jcc_rel32(Cond::Lt);
        self.emit_push(Reg::Rax);
        let mut done = vec![self.asm.jmp_rel32()];
        let here = self.asm.pos();
        patch_rel32(&mut self.asm.buf, not_header, here);

        // type id 1: box an int, convert through the runtime
        self.asm.cmp_ri(Reg::Rcx, TYPE_ID_INT as i32);
        let not_int = self.asm.jcc_rel32(Cond::Ne);
        self.asm.load_mem(Reg::Rdx, Reg::Rax, WORD as i32, 8);
        self.emit_push(Reg::Rdx);
        self.call_func("runtime.IntToString");
        done.push(self.asm.jmp_rel32());
        let here = self.asm.pos();
        patch_rel32(&mut self.asm.buf, not_int, here);

        // type id 2: the concrete value is the string header
        self.asm.cmp_ri(Reg::Rcx, TYPE_ID_STRING as i32);
        let not_string = self.asm.jcc_rel32(Cond::Ne);
        self.asm.load_mem(Reg::Rdx, Reg::Rax, WORD as i32, 8);
        self.emit_push(Reg::Rdx);
        done.push(self.asm.jmp_rel32());
        let here = self.asm.pos();
        patch_rel32(&mut self.asm.buf, not_string, here);

        // anything else: dispatch over Error / String implementations
        self.asm.load_mem(Reg::Rdx, Reg::Rax, WORD as i32, 8);
        self.emit_push(Reg::Rdx);
        for (type_id, impl_name) in tostring_impls(self.module) {
            self.asm.cmp_ri(Reg::Rcx, type_id as i32);
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

    /// write the string (unboxing an interface box first) plus a
    /// newline to stderr, exit 2
    fn lower_panic(&mut self) {
        self.pop_reg(Reg::Rax);
        self.flush();
        self.asm.load_mem(Reg::Rcx, Reg::Rax, 0, 8);
        self.asm.cmp_ri(Reg::Rcx, 256);
        let is_header = self.asm.jcc_rel32(Cond::Ge);
        self.asm.load_mem(Reg::Rax, Reg::Rax, WORD as i32, 8);
        let here = self.asm.pos();
        patch_rel32(&mut self.asm.buf, is_header, here);

        // write(2, header.ptr, header.len)
        self.asm.load_mem(Reg::Rsi, Reg::Rax, 0, 8);
        self.asm.load_mem(Reg::Rdx, Reg::Rax, WORD as i32, 8);
        self.asm.load_imm(Reg::Rdi, 2);
        self.asm.load_imm(Reg::Rax, SYS_WRITE);
        self.asm.syscall();

        // write(2, "\n", 1)
        let newline = self.newline_rodata();
        self.load_rodata_addr(Reg::Rsi, newline);
        self.asm.load_imm(Reg::Rdx, 1);
        self.asm.load_imm(Reg::Rdi, 2);
        self.asm.load_imm(Reg::Rax, SYS_WRITE);
        self.asm.syscall();

        self.asm.load_imm(Reg::Rdi, 2);
        self.asm.load_imm(Reg::Rax, SYS_EXIT);
        self.asm.syscall();
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

    //
    // intrinsics
    //

    /// success: r1 = rax, r2 = 0, err = 0; error (rax < 0): zeros and
    /// err = -rax
    fn emit_sys_triple(&mut self) {
        self.asm.cmp_ri(Reg::Rax, 0);
        let failed = self.asm.jcc_rel32(Cond::Lt);
        self.emit_push(Reg::Rax);
        self.asm.load_imm(Reg::Rcx, 0);
        self.emit_push(Reg::Rcx);
        self.emit_push(Reg::Rcx);
        let done = self.asm.jmp_rel32();
        let here = self.asm.pos();
        patch_rel32(&mut self.asm.buf, failed, here);
        self.asm.neg(Reg::Rax);
        self.asm.mov_rr(Reg::Rcx, Reg::Rax);
        self.asm.load_imm(Reg::Rax, 0);
        self.emit_push(Reg::Rax);
        self.emit_push(Reg::Rax);
        self.emit_push(Reg::Rcx);
        let here = self.asm.pos();
        patch_rel32(&mut self.asm.buf, done, here);
    }

    /// like emit_sys_triple, but the success path takes r2 from rdx
    fn emit_sys_triple_r2(&mut self) {
        self.asm.cmp_ri(Reg::Rax, 0);
        let failed = self.asm.jcc_rel32(Cond::Lt);
        self.emit_push(Reg::Rax);
        self.emit_push(Reg::Rdx);
        self.asm.load_imm(Reg::Rcx, 0);
        self.emit_push(Reg::Rcx);
        let done = self.asm.jmp_rel32();
        let here = self.asm.pos();
        patch_rel32(&mut self.asm.buf, failed, here);
        self.asm.neg(Reg::Rax);
        self.asm.mov_rr(Reg::Rcx, Reg::Rax);
        self.asm.load_imm(Reg::Rax, 0);
        self.emit_push(Reg::Rax);
        self.emit_push(Reg::Rax);
        self.emit_push(Reg::Rcx);
        let here = self.asm.pos();
        patch_rel32(&mut self.asm.buf, done, here);
    }

    fn emit_enosys(&mut self) {
        self.asm.load_imm(Reg::Rax, 0);
        self.emit_push(Reg::Rax);
        self.emit_push(Reg::Rax);
        self.asm.load_imm(Reg::Rax, ENOSYS);
        self.emit_push(Reg::Rax);
    }

    /// pop the arguments (rightmost on top) into the syscall registers
    /// and trap into the kernel
    fn emit_syscall(&mut self, number: i64, argc: usize) {
        const ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::R10, Reg::R8, Reg::R9];
        for index in (0..argc).rev() {
            self.pop_reg(ARG_REGS[index]);
        }
        self.asm.load_imm(Reg::Rax, number);
        self.asm.syscall();
    }

    fn lower_intrinsic(&mut self, name: &str, _arg: i64) -> Result<(), CodeGenError> {
        if intrinsic_argc(name).is_none() {
            return Err(CodeGenError::UnknownIntrinsic {
                func: self.cur_func.clone(),
                name: name.to_owned(),
            });
        }
        self.flush();

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
                self.pop_reg(Reg::Rdi);
                self.asm.load_imm(Reg::Rax, SYS_EXIT);
                self.asm.syscall();
            }
            "SysMmap" => {
                // mmap(0, len, rw, private|anonymous, -1, 0)
                self.pop_reg(Reg::Rsi);
                self.asm.load_imm(Reg::Rdi, 0);
                self.asm.load_imm(Reg::Rdx, 3);
                self.asm.load_imm(Reg::R10, 0x22);
                self.asm.load_imm(Reg::R8, -1);
                self.asm.load_imm(Reg::R9, 0);
                self.asm.load_imm(Reg::Rax, SYS_MMAP);
                self.asm.syscall();
                self.emit_sys_triple();
            }
            "SysPipe" => {
                self.asm.sub_ri(Reg::Rsp, 16);
                self.asm.mov_rr(Reg::Rdi, Reg::Rsp);
                self.asm.load_imm(Reg::Rax, SYS_PIPE);
                self.asm.syscall();
                self.asm.load_mem(Reg::Rcx, Reg::Rsp, 0, 4);
                self.asm.load_mem(Reg::Rdx, Reg::Rsp, 4, 4);
                self.asm.add_ri(Reg::Rsp, 16);
                // on success r1/r2 are the two descriptors
                self.asm.cmp_ri(Reg::Rax, 0);
                let failed = self.asm.jcc_rel32(Cond::Lt);
                self.emit_push(Reg::Rcx);
                self.emit_push(Reg::Rdx);
                self.asm.load_imm(Reg::Rcx, 0);
                self.emit_push(Reg::Rcx);
                let done = self.asm.jmp_rel32();
                let here = self.asm.pos();
                patch_rel32(&mut self.asm.buf, failed, here);
                self.asm.neg(Reg::Rax);
                self.asm.mov_rr(Reg::Rcx, Reg::Rax);
                self.asm.load_imm(Reg::Rax, 0);
                self.emit_push(Reg::Rax);
                self.emit_push(Reg::Rax);
                self.emit_push(Reg::Rcx);
                let here = self.asm.pos();
                patch_rel32(&mut self.asm.buf, done, here);
            }
            "SysWait4" => {
                // wait4(pid, &status, 0, 0), r2 is the status word
                self.pop_reg(Reg::Rdi);
                self.asm.sub_ri(Reg::Rsp, 16);
                self.asm.mov_rr(Reg::Rsi, Reg::Rsp);
                self.asm.load_imm(Reg::Rdx, 0);
                self.asm.load_imm(Reg::R10, 0);
                self.asm.load_imm(Reg::Rax, SYS_WAIT4);
                self.asm.syscall();
                self.asm.load_mem(Reg::Rdx, Reg::Rsp, 0, 4);
                self.asm.add_ri(Reg::Rsp, 16);
                self.emit_sys_triple_r2();
            }
            "SysStat" => {
                // stat(path, &buf); r1 = st_size, r2 = st_mode
                self.pop_reg(Reg::Rdi);
                self.asm.sub_ri(Reg::Rsp, 160);
                self.asm.mov_rr(Reg::Rsi, Reg::Rsp);
                self.asm.load_imm(Reg::Rax, SYS_STAT);
                self.asm.syscall();
                self.asm.load_mem(Reg::Rcx, Reg::Rsp, 48, 8); // st_size
                self.asm.load_mem(Reg::Rdx, Reg::Rsp, 24, 4); // st_mode
                self.asm.add_ri(Reg::Rsp, 160);
                self.asm.cmp_ri(Reg::Rax, 0);
                let failed = self.asm.jcc_rel32(Cond::Lt);
                self.emit_push(Reg::Rcx);
                self.emit_push(Reg::Rdx);
                self.asm.load_imm(Reg::Rcx, 0);
                self.emit_push(Reg::Rcx);
                let done = self.asm.jmp_rel32();
                let here = self.asm.pos();
                patch_rel32(&mut self.asm.buf, failed, here);
                self.asm.neg(Reg::Rax);
                self.asm.mov_rr(Reg::Rcx, Reg::Rax);
                self.asm.load_imm(Reg::Rax, 0);
                self.emit_push(Reg::Rax);
                self.emit_push(Reg::Rax);
                self.emit_push(Reg::Rcx);
                let here = self.asm.pos();
                patch_rel32(&mut self.asm.buf, done, here);
            }
            "SysOpendir" | "SysReaddir" | "SysClosedir" => {
                // only the VM provides directory streams
                let argc = intrinsic_argc(name).unwrap();
                for _ in 0..argc {
                    self.pop_reg(Reg::Rax);
                }
                self.emit_enosys();
            }

            "SysGetargc" | "SysGetargv" | "SysGetenvp" => {
                let slot = match name {
                    "SysGetargc" => 0,
                    "SysGetargv" => 1,
                    _ => 2,
                };
                let offset = (self.module.globals + slot) * WORD;
                self.load_data_addr(Reg::Rcx, offset);
                self.asm.load_mem(Reg::Rax, Reg::Rcx, 0, 8);
                self.push_pending(Reg::Rax);
            }

            "Sliceptr" | "Stringptr" => {
                self.pop_reg(Reg::Rax);
                self.asm.load_mem(Reg::Rax, Reg::Rax, 0, 8);
                self.push_pending(Reg::Rax);
            }
            "ReadPtr" => {
                self.pop_reg(Reg::Rax);
                self.asm.load_mem(Reg::Rax, Reg::Rax, 0, 8);
                self.push_pending(Reg::Rax);
            }
            "WritePtr" => {
                self.pop_reg(Reg::Rcx);
                self.pop_reg(Reg::Rax);
                self.asm.store_mem(Reg::Rax, 0, Reg::Rcx, 8);
            }
            "WriteByte" => {
                self.pop_reg(Reg::Rcx);
                self.pop_reg(Reg::Rax);
                self.asm.store_mem(Reg::Rax, 0, Reg::Rcx, 1);
            }

            "Makestring" => {
                // (ptr, len) -> 2-word header
                self.pop_reg(Reg::Rax); // len
                self.asm.push(Reg::Rax);
                self.pop_reg(Reg::Rax); // ptr
                self.asm.push(Reg::Rax);
                self.asm.load_imm(Reg::Rax, (2 * WORD) as i64);
                self.emit_push(Reg::Rax);
                self.call_func("runtime.Alloc");
                self.pop_reg(Reg::Rax);
                self.asm.pop(Reg::Rcx); // ptr
                self.asm.store_mem(Reg::Rax, 0, Reg::Rcx, 8);
                self.asm.pop(Reg::Rcx); // len
                self.asm.store_mem(Reg::Rax, WORD as i32, Reg::Rcx, 8);
                self.push_pending(Reg::Rax);
            }
            "Makeslice" => {
                // (ptr, len, cap, elem_size) -> 4-word header
                for _ in 0..4 {
                    self.pop_reg(Reg::Rax);
                    self.asm.push(Reg::Rax);
                }
                self.asm.load_imm(Reg::Rax, (4 * WORD) as i64);
                self.emit_push(Reg::Rax);
                self.call_func("runtime.Alloc");
                self.pop_reg(Reg::Rax);
                for index in 0..4 {
                    self.asm.pop(Reg::Rcx);
                    self.asm
                        .store_mem(Reg::Rax, (index * WORD) as i32, Reg::Rcx, 8);
                }
                self.push_pending(Reg::Rax);
            }

            "Tostring" => self.lower_tostring(),

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
    // resolution and assembly
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
            iat_symbols: Vec::new(),
            funcs: self.funcs,
        };
        Ok((image, generated))
    }
}

pub(crate) fn compile(module: &IRModule) -> Result<(ProgramImage, Generated), CodeGenError> {
    let mut gen = X64Codegen::new(module);
    gen.emit_entry_stub();
    for func in &module.funcs {
        gen.compile_func(func)?;
    }
    debug!(
        "x64: {} functions, {} bytes of code",
        module.funcs.len(),
        gen.asm.buf.len()
    );
    gen.finish(0)
}

pub fn generate_linux_amd64(module: &IRModule, path: &Path) -> Result<Generated, CodeGenError> {
    let (image, generated) = compile(module)?;
    elf::write_elf64(image, path)?;
    Ok(generated)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use rtg_ir::opcode::Opcode;
    use rtg_ir::{IRFunc, IRModule, Inst, LocalVar};

    fn module_with_main(insts: Vec<Inst>) -> IRModule {
        IRModule {
            funcs: vec![IRFunc {
                name: "main.main".to_owned(),
                params: 0,
                locals: vec![LocalVar { width: 0 }],
                insts,
            }],
            globals: 1,
            methods: vec![],
            type_ids: vec![],
        }
    }

    #[test]
    fn test_offsets_monotonic_and_resolved() {
        let mut module = module_with_main(vec![Inst::new(Opcode::return_)]);
        module.funcs.push(IRFunc {
            name: "main.helper".to_owned(),
            params: 1,
            locals: vec![LocalVar { width: 0 }],
            insts: vec![
                Inst::with_arg(Opcode::local_get, 0),
                Inst::new(Opcode::return_),
            ],
        });
        module.funcs[0].insts = vec![
            Inst::with_value(Opcode::const_i64, 7),
            Inst::call("main.helper"),
            Inst::new(Opcode::drop),
            Inst::new(Opcode::return_),
        ];

        let (image, generated) = super::compile(&module).unwrap();
        assert_eq!(generated.funcs.len(), 2);
        let (_, first) = &generated.funcs[0];
        let (_, second) = &generated.funcs[1];
        assert!(first < second);
        assert!(*second <= image.code.len());
        // the entry stub sits before the first function
        assert!(*first > 0);
    }

    #[test]
    fn test_branch_patched_with_signed_displacement() {
        // the S2 arithmetic scenario: a forward conditional branch
        let module = module_with_main(vec![
            Inst::with_value(Opcode::const_i64, 2),
            Inst::with_value(Opcode::const_i64, 3),
            Inst::with_value(Opcode::const_i64, 4),
            Inst::new(Opcode::mul),
            Inst::new(Opcode::add),
            Inst::with_value(Opcode::const_i64, 14),
            Inst::new(Opcode::eq),
            Inst::with_arg(Opcode::jmp_if_not, 1),
            Inst::with_value(Opcode::const_i64, 0),
            Inst::intrinsic("SysExit"),
            Inst::with_arg(Opcode::label, 1),
            Inst::with_value(Opcode::const_i64, 1),
            Inst::intrinsic("SysExit"),
        ]);

        let (image, _) = super::compile(&module).unwrap();
        // find the jcc rel32 (0f 84, jz) and verify its target is a
        // valid in-code offset
        let code = &image.code;
        let mut found = false;
        for at in 0..code.len() - 6 {
            if code[at] == 0x0f && code[at + 1] == 0x84 {
                let disp =
                    i32::from_le_bytes(code[at + 2..at + 6].try_into().unwrap());
                let target = (at as i64 + 6 + disp as i64) as usize;
                assert!(target < code.len());
                assert!(disp > 0, "forward branch");
                found = true;
                break;
            }
        }
        assert!(found, "conditional branch emitted");
    }

    #[test]
    fn test_unresolved_call_is_collected() {
        let module = module_with_main(vec![
            Inst::call("main.ghost"),
            Inst::new(Opcode::return_),
        ]);
        let err = super::compile(&module).unwrap_err();
        match err {
            crate::CodeGenError::UnresolvedCalls(names) => {
                assert_eq!(names, vec!["main.ghost".to_owned()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_const_str_interns_once() {
        let module = module_with_main(vec![
            Inst::with_name(Opcode::const_str, "\"hello\\n\""),
            Inst::new(Opcode::drop),
            Inst::with_name(Opcode::const_str, "\"hello\\n\""),
            Inst::new(Opcode::drop),
            Inst::new(Opcode::return_),
        ]);
        let (image, _) = super::compile(&module).unwrap();
        assert_eq!(image.rodata, b"hello\n");
        assert_eq!(image.string_headers.len(), 2);
        assert_eq!(
            image.string_headers[0].data_offset,
            image.string_headers[1].data_offset
        );
        // the header length word is 6
        let header = image.string_headers[0].data_offset;
        assert_eq!(
            u64::from_le_bytes(image.data[header + 8..header + 16].try_into().unwrap()),
            6
        );
    }

    #[test]
    fn test_frame_is_16_byte_aligned() {
        let module = module_with_main(vec![Inst::new(Opcode::return_)]);
        let (image, generated) = super::compile(&module).unwrap();
        let (_, offset) = &generated.funcs[0];
        // prologue: push rbp; mov rbp, rsp; sub rsp, imm8
        let code = &image.code[*offset..];
        assert_eq!(code[0], 0x55);
        assert_eq!(&code[1..4], &[0x48, 0x89, 0xe5]);
        assert_eq!(&code[4..7], &[0x48, 0x83, 0xec]);
        assert_eq!(code[7] % 16, 0);
    }

    #[test]
    fn test_pending_push_coalesces() {
        // const + local_set should not touch the operand stack memory:
        // the value goes from the immediate straight into the slot
        let module = module_with_main(vec![
            Inst::with_value(Opcode::const_i64, 5),
            Inst::with_arg(Opcode::local_set, 0),
            Inst::new(Opcode::return_),
        ]);
        let (image, generated) = super::compile(&module).unwrap();
        let (_, offset) = &generated.funcs[0];
        let body = &image.code[*offset..];
        // no store through r15 (would be 49 89 .. with modrm rm=7)
        // between prologue and epilogue for this function
        let mut r15_stores = 0;
        for window in body.windows(2) {
            if window == [0x49, 0x89] {
                r15_stores += 1;
            }
        }
        assert_eq!(r15_stores, 0);
    }
}
