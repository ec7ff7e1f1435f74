// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// wasi/wasm32 code generator.
//
// wasm has no registers and no goto, so the mechanical ABI is bent in
// two places:
//
// - the operand stack lives in linear memory behind mutable global 0,
//   the frame pointer region behind global 1; values pass through the
//   wasm value stack only within a single IR instruction, so there is
//   no pending-push buffer on this target
// - unstructured LABEL/JMP control flow maps onto one loop wrapping a
//   nest of blocks, dispatched by a br_table over a block-index local
//   (the classic virtual-pc pattern): every label starts a segment,
//   a jump sets the pc local and restarts the dispatch loop
//
// memory layout (word = 4):
//
//   0     .. 1024   scratch (iovec, out-values, spilled call args)
//   1024  ..        data (globals, reserved argv slots, string
//                   headers) then rodata bytes
//   aligned         operand stack, 1 MiB, grows down from its top
//   above that      frame region, 64 KiB, grows down from its top
//
// all string literals are interned in a prepass so every address is a
// constant by the time function bodies are emitted; header data
// pointers are final bytes in the data segment.

use std::collections::HashMap;
use std::path::Path;

use log::debug;

use rtg_asm::wasm::{CodeWriter, BLOCK_I32, BLOCK_VOID};
use rtg_ir::literal::{decode_string_literal, is_init_func};
use rtg_ir::opcode::Opcode;
use rtg_ir::{IRFunc, IRModule, Inst, TYPE_ID_INT, TYPE_ID_STRING};
use rtg_object::wasm::{WasmFunc, WasmImage, FD_READ, FD_WRITE, IMPORT_COUNT, PROC_EXIT};

use crate::{
    intrinsic_argc, tostring_impls, CodeGenError, Generated, StringPool, ENOSYS, RESERVED_GLOBALS,
};

const WORD: usize = 4;
const DATA_BASE: u32 = 1024;
const OPERAND_STACK_SIZE: u32 = 1 << 20;
const FRAME_REGION_SIZE: u32 = 64 << 10;

// scratch addresses below DATA_BASE
const IOVEC_ADDR: i32 = 64;
const OUT_ADDR: i32 = 72;
const ARGS_BASE: i32 = 128;
const MAX_SPILLED_ARGS: usize = 16;

// wasm locals of every compiled function
const FP: u32 = 0;
const TMP: u32 = 1;
const PC: u32 = 2;
const AUX: u32 = 3;
const LOCAL_COUNT: u32 = 4;

const OP_GLOBAL: u32 = 0;
const FRAME_GLOBAL: u32 = 1;

struct WasmCodegen<'a> {
    module: &'a IRModule,
    strings: StringPool,
    data: Vec<u8>,
    rodata: Vec<u8>,
    headers: Vec<(usize, usize)>,
    newline: usize,
    func_index: HashMap<String, u32>,
    unresolved: Vec<String>,
    cur_func: String,
}

impl<'a> WasmCodegen<'a> {
    fn new(module: &'a IRModule) -> Self {
        let mut index = HashMap::new();
        for (position, func) in module.funcs.iter().enumerate() {
            index.insert(func.name.clone(), IMPORT_COUNT + position as u32);
        }
        Self {
            module,
            strings: StringPool::new(WORD),
            data: vec![0u8; (module.globals + RESERVED_GLOBALS) * WORD],
            rodata: Vec::new(),
            headers: Vec::new(),
            newline: 0,
            func_index: index,
            unresolved: Vec::new(),
            cur_func: String::new(),
        }
    }

    /// intern every literal up front so all addresses are constants
    fn intern_all(&mut self) {
        for func in &self.module.funcs {
            for inst in &func.insts {
                if inst.opcode == Opcode::const_str {
                    let raw = inst.name.as_deref().unwrap_or("");
                    let bytes = decode_string_literal(raw);
                    let before = self.data.len();
                    let (header, rodata_off) =
                        self.strings.intern(bytes, &mut self.rodata, &mut self.data);
                    if self.data.len() != before {
                        self.headers.push((header, rodata_off));
                    }
                }
            }
        }
        self.newline = self.rodata.len();
        self.rodata.push(b'\n');
    }

    fn rodata_base(&self) -> u32 {
        DATA_BASE + self.data.len() as u32
    }

    fn global_addr(&self, index: usize) -> i32 {
        (DATA_BASE as usize + index * WORD) as i32
    }

    /// the finished data segment: data then rodata, header pointers
    /// already final
    fn data_blob(&self) -> Vec<u8> {
        let mut blob = self.data.clone();
        let rodata_base = self.rodata_base();
        for (header, rodata_off) in &self.headers {
            let ptr = rodata_base + *rodata_off as u32;
            blob[*header..*header + 4].copy_from_slice(&ptr.to_le_bytes());
        }
        blob.extend_from_slice(&self.rodata);
        blob
    }

    //
    // operand-stack helpers: the value moves between the wasm value
    // stack and the memory operand stack
    //

    fn op_push(&mut self, w: &mut CodeWriter) {
        w.local_set(TMP);
        w.global_get(OP_GLOBAL);
        w.i32_const(WORD as i32);
        w.i32_sub();
        w.global_set(OP_GLOBAL);
        w.global_get(OP_GLOBAL);
        w.local_get(TMP);
        w.i32_store(2, 0);
    }

    fn op_pop(&mut self, w: &mut CodeWriter) {
        w.global_get(OP_GLOBAL);
        w.i32_load(2, 0);
        w.global_get(OP_GLOBAL);
        w.i32_const(WORD as i32);
        w.i32_add();
        w.global_set(OP_GLOBAL);
    }

    fn op_push_const(&mut self, w: &mut CodeWriter, value: i32) {
        w.i32_const(value);
        self.op_push(w);
    }

    fn call_ir(&mut self, w: &mut CodeWriter, name: &str) {
        match self.func_index.get(name).copied() {
            Some(index) => {
                w.call(index);
            }
            None => {
                if !self.unresolved.contains(&name.to_owned()) {
                    self.unresolved.push(name.to_owned());
                }
                w.call(0);
            }
        }
    }

    //
    // functions
    //

    fn compile_func(&mut self, func: &IRFunc) -> Result<WasmFunc, CodeGenError> {
        self.cur_func = func.name.clone();
        let mut w = CodeWriter::new();

        let widest = func
            .locals
            .iter()
            .map(|local| if local.width == 0 { WORD } else { local.width as usize })
            .max()
            .unwrap_or(WORD);
        let pitch = WORD.max(widest);
        let slots = func.params.max(func.locals.len());
        let frame = rtg_object::align_up(slots * pitch, 16);

        // prologue: carve the frame, remember its base
        w.global_get(FRAME_GLOBAL);
        w.i32_const(frame as i32);
        w.i32_sub();
        w.global_set(FRAME_GLOBAL);
        w.global_get(FRAME_GLOBAL);
        w.local_set(FP);

        for index in (0..func.params).rev() {
            w.local_get(FP);
            self.op_pop(&mut w);
            w.i32_store(2, (index * pitch) as u32);
        }

        // label ids in appearance order; label k opens segment k+1
        let labels: Vec<i64> = func
            .insts
            .iter()
            .filter(|inst| inst.opcode == Opcode::label)
            .map(|inst| inst.arg)
            .collect();
        let segments = labels.len() + 1;
        let segment_of: HashMap<i64, usize> = labels
            .iter()
            .enumerate()
            .map(|(position, id)| (*id, position + 1))
            .collect();

        let dispatched = segments > 1;
        if dispatched {
            w.i32_const(0);
            w.local_set(PC);
            w.loop_(BLOCK_VOID);
            for _ in 0..segments {
                w.block(BLOCK_VOID);
            }
            let depths: Vec<u32> = (0..segments as u32).collect();
            w.local_get(PC);
            w.br_table(&depths, 0);
            w.end(); // opens segment 0
        }

        let mut segment = 0usize;
        for inst in &func.insts {
            self.lower_inst(func, pitch, frame, inst, &mut w, &segment_of, segments, &mut segment)?;
        }

        if dispatched {
            w.unreachable();
            w.end(); // the dispatch loop
        }
        w.end(); // function body

        Ok(WasmFunc {
            local_i32s: LOCAL_COUNT,
            code: w.buf,
        })
    }

    /// the loop depth that restarts the dispatch from inside the given
    /// segment, before any extra nesting
    fn loop_depth(segments: usize, segment: usize) -> u32 {
        (segments - 1 - segment) as u32
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_inst(
        &mut self,
        func: &IRFunc,
        pitch: usize,
        frame: usize,
        inst: &Inst,
        w: &mut CodeWriter,
        segment_of: &HashMap<i64, usize>,
        segments: usize,
        segment: &mut usize,
    ) -> Result<(), CodeGenError> {
        match inst.opcode {
            Opcode::const_i64 | Opcode::const_bool => {
                self.op_push_const(w, inst.value as i32);
            }
            Opcode::const_nil => self.op_push_const(w, 0),
            Opcode::const_str => {
                let raw = inst.name.as_deref().unwrap_or("");
                let bytes = decode_string_literal(raw);
                let before = self.data.len();
                let (header, _) = self
                    .strings
                    .intern(bytes, &mut self.rodata, &mut self.data);
                debug_assert_eq!(self.data.len(), before, "literal interned in the prepass");
                self.op_push_const(w, DATA_BASE as i32 + header as i32);
            }

            Opcode::local_get => {
                let index = inst.arg as usize;
                let width = match func.locals.get(index) {
                    Some(local) if local.width != 0 => local.width,
                    _ => 4,
                };
                w.local_get(FP);
                match width {
                    1 => w.i32_load8_u((index * pitch) as u32),
                    2 => w.i32_load16_u((index * pitch) as u32),
                    _ => w.i32_load(2, (index * pitch) as u32),
                }
                self.op_push(w);
            }
            Opcode::local_set => {
                let index = inst.arg as usize;
                let width = match func.locals.get(index) {
                    Some(local) if local.width != 0 => local.width,
                    _ => 4,
                };
                w.local_get(FP);
                self.op_pop(w);
                match width {
                    1 => w.i32_store8((index * pitch) as u32),
                    2 => w.i32_store16((index * pitch) as u32),
                    _ => w.i32_store(2, (index * pitch) as u32),
                }
            }
            Opcode::local_addr => {
                w.local_get(FP);
                w.i32_const((inst.arg as usize * pitch) as i32);
                w.i32_add();
                self.op_push(w);
            }

            Opcode::global_get => {
                w.i32_const(self.global_addr(inst.arg as usize));
                w.i32_load(2, 0);
                self.op_push(w);
            }
            Opcode::global_set => {
                w.i32_const(self.global_addr(inst.arg as usize));
                self.op_pop(w);
                w.i32_store(2, 0);
            }
            Opcode::global_addr => {
                self.op_push_const(w, self.global_addr(inst.arg as usize));
            }

            Opcode::drop => {
                w.global_get(OP_GLOBAL);
                w.i32_const(WORD as i32);
                w.i32_add();
                w.global_set(OP_GLOBAL);
            }
            Opcode::dup => {
                self.op_pop(w);
                w.local_set(AUX);
                w.local_get(AUX);
                self.op_push(w);
                w.local_get(AUX);
                self.op_push(w);
            }

            Opcode::add | Opcode::sub | Opcode::mul | Opcode::div | Opcode::mod_
            | Opcode::and | Opcode::or | Opcode::xor | Opcode::shl | Opcode::shr => {
                self.op_pop(w);
                w.local_set(AUX); // rhs
                self.op_pop(w);
                w.local_get(AUX);
                match inst.opcode {
                    Opcode::add => w.i32_add(),
                    Opcode::sub => w.i32_sub(),
                    Opcode::mul => w.i32_mul(),
                    Opcode::div => w.i32_div_s(),
                    Opcode::mod_ => w.i32_rem_s(),
                    Opcode::and => w.i32_and(),
                    Opcode::or => w.i32_or(),
                    Opcode::xor => w.i32_xor(),
                    Opcode::shl => w.i32_shl(),
                    _ => w.i32_shr_s(),
                }
                self.op_push(w);
            }
            Opcode::neg => {
                self.op_pop(w);
                w.local_set(AUX);
                w.i32_const(0);
                w.local_get(AUX);
                w.i32_sub();
                self.op_push(w);
            }
            Opcode::not => {
                self.op_pop(w);
                w.i32_const(-1);
                w.i32_xor();
                self.op_push(w);
            }

            Opcode::eq | Opcode::neq | Opcode::lt | Opcode::gt | Opcode::leq | Opcode::geq => {
                self.op_pop(w);
                w.local_set(AUX);
                self.op_pop(w);
                w.local_get(AUX);
                match inst.opcode {
                    Opcode::eq => w.i32_eq(),
                    Opcode::neq => w.i32_ne(),
                    Opcode::lt => w.i32_lt_s(),
                    Opcode::gt => w.i32_gt_s(),
                    Opcode::leq => w.i32_le_s(),
                    _ => w.i32_ge_s(),
                }
                self.op_push(w);
            }

            Opcode::label => {
                w.end();
                *segment += 1;
            }
            Opcode::jmp => {
                let target = segment_of[&inst.arg];
                w.i32_const(target as i32);
                w.local_set(PC);
                w.br(Self::loop_depth(segments, *segment));
            }
            Opcode::jmp_if | Opcode::jmp_if_not => {
                let target = segment_of[&inst.arg];
                self.op_pop(w);
                if inst.opcode == Opcode::jmp_if_not {
                    w.i32_eqz();
                }
                w.if_(BLOCK_VOID);
                w.i32_const(target as i32);
                w.local_set(PC);
                w.br(Self::loop_depth(segments, *segment) + 1);
                w.end();
            }

            Opcode::call => {
                let name = inst.name.as_deref().unwrap_or("").to_owned();
                if let Some(fields) = IRModule::composite_field_count(&name) {
                    self.lower_composite(w, fields);
                } else {
                    self.call_ir(w, &name);
                }
            }
            Opcode::call_intrinsic => {
                let name = inst.name.clone().unwrap_or_default();
                self.lower_intrinsic(w, &name)?;
            }
            Opcode::return_ => {
                // release the frame before leaving
                w.local_get(FP);
                w.i32_const(frame as i32);
                w.i32_add();
                w.global_set(FRAME_GLOBAL);
                w.return_();
            }

            Opcode::load => {
                let width = if inst.width == 0 { 4 } else { inst.width };
                self.op_pop(w);
                w.local_set(AUX);
                w.local_get(AUX);
                w.if_(BLOCK_I32);
                w.local_get(AUX);
                match width {
                    1 => w.i32_load8_u(0),
                    2 => w.i32_load16_u(0),
                    _ => w.i32_load(2, 0),
                }
                w.else_();
                w.i32_const(0);
                w.end();
                self.op_push(w);
            }
            Opcode::store => {
                let width = if inst.width == 0 { 4 } else { inst.width };
                self.op_pop(w);
                w.local_set(AUX); // value
                self.op_pop(w); // address
                w.local_get(AUX);
                match width {
                    1 => w.i32_store8(0),
                    2 => w.i32_store16(0),
                    _ => w.i32_store(2, 0),
                }
            }
            Opcode::offset => {
                self.op_pop(w);
                w.i32_const(inst.arg as i32);
                w.i32_add();
                self.op_push(w);
            }
            Opcode::index_addr => {
                self.op_pop(w);
                w.local_set(AUX); // index
                self.op_pop(w);
                w.i32_load(2, 0); // data pointer
                w.local_get(AUX);
                w.i32_const(inst.value as i32);
                w.i32_mul();
                w.i32_add();
                self.op_push(w);
            }
            Opcode::len => {
                self.op_pop(w);
                w.local_set(AUX);
                w.local_get(AUX);
                w.if_(BLOCK_I32);
                w.local_get(AUX);
                w.i32_load(2, WORD as u32);
                w.else_();
                w.i32_const(0);
                w.end();
                self.op_push(w);
            }

            Opcode::convert => {
                let name = inst.name.clone().unwrap_or_default();
                match name.as_str() {
                    "string" => self.call_ir(w, "runtime.BytesToString"),
                    "[]byte" => self.call_ir(w, "runtime.StringToBytes"),
                    "int" | "uint" | "uintptr" | "int64" | "uint64" | "int32" | "uint32" => {}
                    "byte" | "uint8" => {
                        self.op_pop(w);
                        w.i32_const(0xff);
                        w.i32_and();
                        self.op_push(w);
                    }
                    "uint16" => {
                        self.op_pop(w);
                        w.i32_const(0xffff);
                        w.i32_and();
                        self.op_push(w);
                    }
                    other => {
                        return Err(CodeGenError::UnknownConvert {
                            func: self.cur_func.clone(),
                            name: other.to_owned(),
                        })
                    }
                }
            }

            Opcode::iface_box => {
                self.op_pop(w);
                w.local_set(AUX);
                w.i32_const(ARGS_BASE);
                w.local_get(AUX);
                w.i32_store(2, 0);
                self.op_push_const(w, (2 * WORD) as i32);
                self.call_ir(w, "runtime.Alloc");
                self.op_pop(w);
                w.local_set(TMP);
                w.local_get(TMP);
                w.i32_const(inst.value as i32);
                w.i32_store(2, 0);
                w.local_get(TMP);
                w.i32_const(ARGS_BASE);
                w.i32_load(2, 0);
                w.i32_store(2, WORD as u32);
                w.local_get(TMP);
                self.op_push(w);
            }
            Opcode::iface_call => {
                let name = inst.name.clone().unwrap_or_default();
                self.lower_iface_call(w, &name, inst.arg as usize)?;
            }

            Opcode::panic => self.lower_panic(w),
        }
        Ok(())
    }

    fn lower_composite(&mut self, w: &mut CodeWriter, fields: usize) {
        assert!(fields <= MAX_SPILLED_ARGS);
        for index in 0..fields {
            w.i32_const(ARGS_BASE + (index * WORD) as i32);
            self.op_pop(w);
            w.i32_store(2, 0);
        }
        self.op_push_const(w, (fields * WORD) as i32);
        self.call_ir(w, "runtime.Alloc");
        self.op_pop(w);
        w.local_set(TMP);
        // the pops arrived last-field-first
        for field in 0..fields {
            w.local_get(TMP);
            w.i32_const(ARGS_BASE + ((fields - 1 - field) * WORD) as i32);
            w.i32_load(2, 0);
            w.i32_store(2, (field * WORD) as u32);
        }
        w.local_get(TMP);
        self.op_push(w);
    }

    fn lower_iface_call(
        &mut self,
        w: &mut CodeWriter,
        name: &str,
        argc: usize,
    ) -> Result<(), CodeGenError> {
        assert!(argc <= MAX_SPILLED_ARGS);
        let bare = name.rsplit('.').next().unwrap_or(name);
        let impls = self.module.method_impls(bare);
        if impls.is_empty() {
            return Err(CodeGenError::EmptyDispatch {
                name: name.to_owned(),
            });
        }

        for index in 0..argc {
            w.i32_const(ARGS_BASE + (index * WORD) as i32);
            self.op_pop(w);
            w.i32_store(2, 0);
        }
        self.op_pop(w);
        w.local_set(TMP); // the box
        w.local_get(TMP);
        w.i32_load(2, 0);
        w.local_set(AUX); // type id
        w.local_get(TMP);
        w.i32_load(2, WORD as u32);
        self.op_push(w); // receiver
        for index in (0..argc).rev() {
            w.i32_const(ARGS_BASE + (index * WORD) as i32);
            w.i32_load(2, 0);
            self.op_push(w);
        }

        w.block(BLOCK_VOID);
        for (type_id, impl_name) in impls {
            w.local_get(AUX);
            w.i32_const(type_id as i32);
            w.i32_eq();
            w.if_(BLOCK_VOID);
            self.call_ir(w, &impl_name);
            w.br(1);
            w.end();
        }
        w.unreachable();
        w.end();
        Ok(())
    }

    fn lower_tostring(&mut self, w: &mut CodeWriter) {
        self.op_pop(w);
        w.local_set(TMP);
        w.local_get(TMP);
        w.i32_load(2, 0);
        w.local_set(AUX);

        w.block(BLOCK_VOID);
        // first word >= 256: already a string header
        w.local_get(AUX);
        w.i32_const(256);
        w.i32_ge_s();
        w.if_(BLOCK_VOID);
        w.local_get(TMP);
        self.op_push(w);
        w.br(1);
        w.end();

        w.local_get(AUX);
        w.i32_const(TYPE_ID_INT as i32);
        w.i32_eq();
        w.if_(BLOCK_VOID);
        w.local_get(TMP);
        w.i32_load(2, WORD as u32);
        self.op_push(w);
        self.call_ir(w, "runtime.IntToString");
        w.br(1);
        w.end();

        w.local_get(AUX);
        w.i32_const(TYPE_ID_STRING as i32);
        w.i32_eq();
        w.if_(BLOCK_VOID);
        w.local_get(TMP);
        w.i32_load(2, WORD as u32);
        self.op_push(w);
        w.br(1);
        w.end();

        w.local_get(TMP);
        w.i32_load(2, WORD as u32);
        self.op_push(w);
        for (type_id, impl_name) in tostring_impls(self.module) {
            w.local_get(AUX);
            w.i32_const(type_id as i32);
            w.i32_eq();
            w.if_(BLOCK_VOID);
            self.call_ir(w, &impl_name);
            w.br(1);
            w.end();
        }
        w.unreachable();
        w.end();
    }

    /// fd_write(2, iovec, 1, out) of the header bytes plus a newline,
    /// then proc_exit(2)
    fn lower_panic(&mut self, w: &mut CodeWriter) {
        self.op_pop(w);
        w.local_set(TMP);
        // unbox when the first word is a small type id
        w.local_get(TMP);
        w.i32_load(2, 0);
        w.i32_const(256);
        w.i32_lt_s();
        w.if_(BLOCK_VOID);
        w.local_get(TMP);
        w.i32_load(2, WORD as u32);
        w.local_set(TMP);
        w.end();

        w.i32_const(IOVEC_ADDR);
        w.local_get(TMP);
        w.i32_load(2, 0);
        w.i32_store(2, 0);
        w.i32_const(IOVEC_ADDR);
        w.local_get(TMP);
        w.i32_load(2, WORD as u32);
        w.i32_store(2, 4);
        w.i32_const(2);
        w.i32_const(IOVEC_ADDR);
        w.i32_const(1);
        w.i32_const(OUT_ADDR);
        w.call(FD_WRITE);
        w.drop_();

        let newline = (self.rodata_base() + self.newline as u32) as i32;
        w.i32_const(IOVEC_ADDR);
        w.i32_const(newline);
        w.i32_store(2, 0);
        w.i32_const(IOVEC_ADDR);
        w.i32_const(1);
        w.i32_store(2, 4);
        w.i32_const(2);
        w.i32_const(IOVEC_ADDR);
        w.i32_const(1);
        w.i32_const(OUT_ADDR);
        w.call(FD_WRITE);
        w.drop_();

        w.i32_const(2);
        w.call(PROC_EXIT);
        w.unreachable();
    }

    fn emit_enosys(&mut self, w: &mut CodeWriter, argc: usize) {
        for _ in 0..argc {
            self.op_pop(w);
            w.drop_();
        }
        self.op_push_const(w, 0);
        self.op_push_const(w, 0);
        self.op_push_const(w, ENOSYS as i32);
    }

    fn lower_intrinsic(&mut self, w: &mut CodeWriter, name: &str) -> Result<(), CodeGenError> {
        let Some(argc) = intrinsic_argc(name) else {
            return Err(CodeGenError::UnknownIntrinsic {
                func: self.cur_func.clone(),
                name: name.to_owned(),
            });
        };

        match name {
            "SysWrite" | "SysRead" => {
                w.i32_const(IOVEC_ADDR);
                self.op_pop(w); // length
                w.i32_store(2, 4);
                w.i32_const(IOVEC_ADDR);
                self.op_pop(w); // buffer
                w.i32_store(2, 0);
                self.op_pop(w); // descriptor
                w.i32_const(IOVEC_ADDR);
                w.i32_const(1);
                w.i32_const(OUT_ADDR);
                w.call(if name == "SysWrite" { FD_WRITE } else { FD_READ });
                w.local_set(AUX); // wasi errno
                w.local_get(AUX);
                w.i32_eqz();
                w.if_(BLOCK_VOID);
                w.i32_const(OUT_ADDR);
                w.i32_load(2, 0);
                self.op_push(w);
                self.op_push_const(w, 0);
                self.op_push_const(w, 0);
                w.else_();
                self.op_push_const(w, 0);
                self.op_push_const(w, 0);
                w.local_get(AUX);
                self.op_push(w);
                w.end();
            }
            "SysExit" => {
                self.op_pop(w);
                w.call(PROC_EXIT);
                w.unreachable();
            }
            "SysGetargc" | "SysGetargv" | "SysGetenvp" => {
                let slot = match name {
                    "SysGetargc" => 0,
                    "SysGetargv" => 1,
                    _ => 2,
                };
                w.i32_const(self.global_addr(self.module.globals + slot));
                w.i32_load(2, 0);
                self.op_push(w);
            }
            "Sliceptr" | "Stringptr" | "ReadPtr" => {
                self.op_pop(w);
                w.i32_load(2, 0);
                self.op_push(w);
            }
            "WritePtr" => {
                self.op_pop(w);
                w.local_set(AUX);
                self.op_pop(w);
                w.local_get(AUX);
                w.i32_store(2, 0);
            }
            "WriteByte" => {
                self.op_pop(w);
                w.local_set(AUX);
                self.op_pop(w);
                w.local_get(AUX);
                w.i32_store8(0);
            }
            "Makestring" => {
                // (ptr, len) -> header
                w.i32_const(ARGS_BASE);
                self.op_pop(w); // len
                w.i32_store(2, 4);
                w.i32_const(ARGS_BASE);
                self.op_pop(w); // ptr
                w.i32_store(2, 0);
                self.op_push_const(w, (2 * WORD) as i32);
                self.call_ir(w, "runtime.Alloc");
                self.op_pop(w);
                w.local_set(TMP);
                w.local_get(TMP);
                w.i32_const(ARGS_BASE);
                w.i32_load(2, 0);
                w.i32_store(2, 0);
                w.local_get(TMP);
                w.i32_const(ARGS_BASE);
                w.i32_load(2, 4);
                w.i32_store(2, WORD as u32);
                w.local_get(TMP);
                self.op_push(w);
            }
            "Makeslice" => {
                // (ptr, len, cap, elem_size) -> header; pops arrive
                // last-argument-first
                for index in (0..4).rev() {
                    w.i32_const(ARGS_BASE + (index * WORD) as i32);
                    self.op_pop(w);
                    w.i32_store(2, 0);
                }
                self.op_push_const(w, (4 * WORD) as i32);
                self.call_ir(w, "runtime.Alloc");
                self.op_pop(w);
                w.local_set(TMP);
                for index in 0..4 {
                    w.local_get(TMP);
                    w.i32_const(ARGS_BASE + (index * WORD) as i32);
                    w.i32_load(2, 0);
                    w.i32_store(2, (index * WORD) as u32);
                }
                w.local_get(TMP);
                self.op_push(w);
            }
            "Tostring" => self.lower_tostring(w),
            _ => {
                // every other OS intrinsic is VM- or native-only
                self.emit_enosys(w, argc);
            }
        }
        Ok(())
    }

    fn emit_entry_stub(&mut self) -> WasmFunc {
        let mut w = CodeWriter::new();
        let inits: Vec<String> = self
            .module
            .funcs
            .iter()
            .filter(|func| is_init_func(&func.name))
            .map(|func| func.name.clone())
            .collect();
        for name in inits {
            self.call_ir(&mut w, &name);
        }
        self.call_ir(&mut w, "main.main");
        w.i32_const(0);
        w.call(PROC_EXIT);
        w.end();
        WasmFunc {
            local_i32s: 0,
            code: w.buf,
        }
    }
}

pub fn generate_wasi_wasm32(module: &IRModule, path: &Path) -> Result<Generated, CodeGenError> {
    let mut gen = WasmCodegen::new(module);
    gen.intern_all();

    let mut funcs: Vec<WasmFunc> = Vec::with_capacity(module.funcs.len() + 1);
    let mut offsets: Vec<(String, usize)> = Vec::with_capacity(module.funcs.len());
    let mut code_size = 0usize;
    for func in &module.funcs {
        let body = gen.compile_func(func)?;
        offsets.push((func.name.clone(), code_size));
        code_size += body.code.len();
        funcs.push(body);
    }
    let stub = gen.emit_entry_stub();
    let start = funcs.len() as u32;
    code_size += stub.code.len();
    funcs.push(stub);

    if !gen.unresolved.is_empty() {
        return Err(CodeGenError::UnresolvedCalls(std::mem::take(
            &mut gen.unresolved,
        )));
    }

    let blob = gen.data_blob();
    let op_base = rtg_object::align_up(DATA_BASE as usize + blob.len(), 16) as u32;
    let op_top = op_base + OPERAND_STACK_SIZE;
    let frame_top = op_top + FRAME_REGION_SIZE;
    let mem_pages = frame_top.div_ceil(65536) + 16;

    debug!(
        "wasm: {} functions, {} bytes of code, {} data",
        module.funcs.len(),
        code_size,
        blob.len()
    );

    let image = WasmImage {
        funcs,
        start,
        data: blob,
        data_offset: DATA_BASE,
        mem_pages,
        globals: vec![op_top as i32, frame_top as i32],
    };
    rtg_object::wasm::write_wasm(image, path)?;

    Ok(Generated {
        funcs: offsets,
        code_size,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use rtg_ir::opcode::Opcode;
    use rtg_ir::{IRFunc, IRModule, Inst};

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
    fn test_wasm_module_written() {
        let dir = std::env::temp_dir().join("rtg-codegen-wasm-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.wasm");

        let module = module_with_main(vec![
            Inst::with_name(Opcode::const_str, "\"hello\\n\""),
            Inst::new(Opcode::drop),
            Inst::with_value(Opcode::const_i64, 0),
            Inst::intrinsic("SysExit"),
        ]);
        let generated = super::generate_wasi_wasm32(&module, &path).unwrap();
        assert_eq!(generated.funcs.len(), 1);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"\0asm");
        // the data segment carries the literal
        let needle = b"hello\n";
        assert!(bytes
            .windows(needle.len())
            .any(|window| window == needle));
    }

    #[test]
    fn test_label_jump_uses_dispatch_loop() {
        let dir = std::env::temp_dir().join("rtg-codegen-wasm-loop-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.wasm");

        let module = module_with_main(vec![
            Inst::with_value(Opcode::const_i64, 1),
            Inst::with_arg(Opcode::jmp_if, 3),
            Inst::with_arg(Opcode::label, 3),
            Inst::with_value(Opcode::const_i64, 0),
            Inst::intrinsic("SysExit"),
        ]);
        super::generate_wasi_wasm32(&module, &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        // a loop opcode (0x03 0x40) and a br_table (0x0e) must appear
        assert!(bytes.windows(2).any(|w| w == [0x03, 0x40]));
        assert!(bytes.contains(&0x0e));
    }

    #[test]
    fn test_unresolved_call_reported() {
        let dir = std::env::temp_dir().join("rtg-codegen-wasm-unresolved");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.wasm");

        let module = module_with_main(vec![
            Inst::call("main.ghost"),
            Inst::new(Opcode::return_),
        ]);
        let err = super::generate_wasi_wasm32(&module, &path).unwrap_err();
        match err {
            crate::CodeGenError::UnresolvedCalls(names) => {
                assert_eq!(names, vec!["main.ghost".to_owned()])
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
