// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// the portable IR interpreter, used for bootstrapping and testing.
//
// the word size is configurable (2, 4 or 8 bytes) and every
// arithmetic result is masked to it. memory is the flat byte array of
// the memory module; function frames live in a dedicated 64 KiB
// downward-growing region inside it, so 'local_addr' hands out real
// addresses. the host operand stack is a plain Vec.
//
// interface dispatch goes through a table built once before
// execution: (type id, method id) -> function index, with method ids
// assigned to bare method names in table order.
//
// a step counter guards against runaways: when RTG_VM_STEPS is
// exceeded the VM prints the call stack and exits with code 99.

pub mod hostio;
pub mod memory;

use std::collections::HashMap;
use std::io::Write;

use log::debug;

use rtg_ir::literal::{decode_string_literal, is_init_func};
use rtg_ir::opcode::Opcode;
use rtg_ir::{IRModule, Inst, TYPE_ID_INT, TYPE_ID_STRING};

use hostio::{ok, HostIo, SysTriple};
use memory::{Allocator, Memory};

/// the exit code of a VM-level failure (dispatch miss, frame
/// overflow, panic)
pub const EXIT_FAULT: i32 = 2;
/// the exit code when the step limit fires
pub const EXIT_STEP_LIMIT: i32 = 99;

const GLOBALS_BASE: usize = 0x1000;
const FRAME_REGION: usize = 64 << 10;

pub struct VmConfig {
    pub word: usize,
    pub step_limit: Option<u64>,
    pub print_mem_summary: bool,
    pub log_allocs: bool,
    /// the executed program's own argv, argv[0] included
    pub args: Vec<String>,
}

impl VmConfig {
    pub fn new(args: Vec<String>) -> Self {
        Self {
            word: 8,
            step_limit: None,
            print_mem_summary: false,
            log_allocs: false,
            args,
        }
    }

    /// honor RTG_VM_STEPS, RTG_VM_MEM and RTG_VM_ALLOC
    pub fn from_env(args: Vec<String>) -> Self {
        let mut config = Self::new(args);
        if let Ok(text) = std::env::var("RTG_VM_STEPS") {
            config.step_limit = text.parse::<u64>().ok();
        }
        config.print_mem_summary = std::env::var("RTG_VM_MEM").is_ok();
        config.log_allocs = std::env::var("RTG_VM_ALLOC").is_ok();
        config
    }
}

struct Frame {
    func: usize,
    pc: usize,
    fp: usize,
}

enum Flow {
    Next,
    Jump(usize),
    /// a frame was pushed, execution continues in the callee
    Entered,
    Return,
    Exit(i32),
}

pub struct Vm<'a> {
    module: &'a IRModule,
    mem: Memory,
    alloc: Allocator,
    io: HostIo,
    stack: Vec<i64>,
    frames: Vec<Frame>,

    func_index: HashMap<String, usize>,
    labels: Vec<HashMap<i64, usize>>,
    pitches: Vec<usize>,
    frame_sizes: Vec<usize>,
    // (type id, method id) -> function index
    dispatch: HashMap<(i64, usize), usize>,
    method_ids: HashMap<String, usize>,
    strings: HashMap<Vec<u8>, usize>,

    frame_base: usize,
    fp: usize,
    steps: u64,
    step_limit: Option<u64>,
    print_mem_summary: bool,
}

impl<'a> Vm<'a> {
    pub fn new(module: &'a IRModule, config: &VmConfig) -> Self {
        let word = config.word;

        let mut func_index = HashMap::new();
        let mut labels = Vec::with_capacity(module.funcs.len());
        let mut pitches = Vec::with_capacity(module.funcs.len());
        let mut frame_sizes = Vec::with_capacity(module.funcs.len());
        for (position, func) in module.funcs.iter().enumerate() {
            func_index.insert(func.name.clone(), position);
            let mut map = HashMap::new();
            for (at, inst) in func.insts.iter().enumerate() {
                if inst.opcode == Opcode::label {
                    map.insert(inst.arg, at);
                }
            }
            labels.push(map);
            let widest = func
                .locals
                .iter()
                .map(|local| if local.width == 0 { word } else { local.width as usize })
                .max()
                .unwrap_or(word);
            let pitch = word.max(widest);
            pitches.push(pitch);
            frame_sizes.push(func.params.max(func.locals.len()) * pitch);
        }

        // method ids are assigned to bare names in table order; the
        // dispatch table then maps (type id, method id) to the
        // implementing function
        let mut method_ids: HashMap<String, usize> = HashMap::new();
        let mut dispatch: HashMap<(i64, usize), usize> = HashMap::new();
        for (qualified, impl_name) in &module.methods {
            let Some((type_name, bare)) = qualified.rsplit_once('.') else {
                continue;
            };
            let next_id = method_ids.len();
            let method_id = *method_ids.entry(bare.to_owned()).or_insert(next_id);
            let (Some(type_id), Some(func)) =
                (module.type_id(type_name), func_index.get(impl_name))
            else {
                continue;
            };
            dispatch.insert((type_id, method_id), *func);
        }

        let mut mem = Memory::new(1 << 20, word);
        let mut alloc_probe = GLOBALS_BASE + (module.globals + 3) * word;

        // the program's argv: strings, the pointer array, an empty
        // envp array, all written right after the globals
        let mut arg_ptrs: Vec<usize> = Vec::new();
        for arg in &config.args {
            mem.write_bytes(alloc_probe, arg.as_bytes());
            mem.write_byte(alloc_probe + arg.len(), 0);
            arg_ptrs.push(alloc_probe);
            alloc_probe += arg.len() + 1;
        }
        alloc_probe = (alloc_probe + word) & !(word - 1);
        let argv_addr = alloc_probe;
        for ptr in &arg_ptrs {
            mem.write_word(alloc_probe, *ptr as i64);
            alloc_probe += word;
        }
        mem.write_word(alloc_probe, 0);
        alloc_probe += word;
        let envp_addr = alloc_probe;
        mem.write_word(alloc_probe, 0);
        alloc_probe += word;

        let argc_slot = GLOBALS_BASE + module.globals * word;
        mem.write_word(argc_slot, config.args.len() as i64);
        mem.write_word(argc_slot + word, argv_addr as i64);
        mem.write_word(argc_slot + 2 * word, envp_addr as i64);

        let frame_base = (alloc_probe + 15) & !15;
        let frame_top = frame_base + FRAME_REGION;
        let mut alloc = Allocator::new(frame_top);
        alloc.log_each = config.log_allocs;

        Self {
            module,
            mem,
            alloc,
            io: HostIo::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            func_index,
            labels,
            pitches,
            frame_sizes,
            dispatch,
            method_ids,
            strings: HashMap::new(),
            frame_base,
            fp: frame_top,
            steps: 0,
            step_limit: config.step_limit,
            print_mem_summary: config.print_mem_summary,
        }
    }

    fn uaddr(&self, value: i64) -> usize {
        match self.mem.word {
            8 => value as u64 as usize,
            width => (value as u64 & ((1u64 << (8 * width)) - 1)) as usize,
        }
    }

    /// mask an arithmetic result to the configured word, keeping the
    /// sign so comparisons stay signed
    fn wrap(&self, value: i64) -> i64 {
        let bits = 8 * self.mem.word as u32;
        if bits == 64 {
            value
        } else {
            (value << (64 - bits)) >> (64 - bits)
        }
    }

    fn push(&mut self, value: i64) {
        self.stack.push(self.wrap(value));
    }

    fn pop(&mut self) -> i64 {
        self.stack.pop().unwrap_or(0)
    }

    fn push_triple(&mut self, triple: SysTriple) {
        self.push(triple.0);
        self.push(triple.1);
        self.push(triple.2);
    }

    fn fault(&mut self, message: &str) -> Flow {
        eprintln!("vm: {message}");
        self.dump_call_stack();
        Flow::Exit(EXIT_FAULT)
    }

    fn dump_call_stack(&self) {
        for frame in self.frames.iter().rev() {
            eprintln!("  at {}", self.module.funcs[frame.func].name);
        }
    }

    /// push a frame for the named function and import its parameters
    fn enter(&mut self, func: usize) -> Flow {
        let size = self.frame_sizes[func];
        if self.fp < self.frame_base + size {
            return self.fault("frame stack overflow");
        }
        self.fp -= size;
        self.frames.push(Frame { func, pc: 0, fp: self.fp });

        let pitch = self.pitches[func];
        let params = self.module.funcs[func].params;
        for index in (0..params).rev() {
            let value = self.pop();
            let fp = self.fp;
            self.mem.write_word(fp + index * pitch, value);
        }
        Flow::Entered
    }

    fn leave(&mut self) {
        if let Some(frame) = self.frames.pop() {
            self.fp = frame.fp + self.frame_sizes[frame.func];
        }
    }

    fn call_by_name(&mut self, name: &str) -> Flow {
        match self.func_index.get(name).copied() {
            Some(func) => self.enter(func),
            None => self.fault(&format!("call to unknown function '{name}'")),
        }
    }

    fn intern_string(&mut self, raw: &str) -> usize {
        let bytes = decode_string_literal(raw);
        if let Some(header) = self.strings.get(&bytes) {
            return *header;
        }
        let data = self.alloc.alloc_bump(bytes.len(), "string");
        self.mem.write_bytes(data, &bytes);
        let header = self.alloc.alloc_2(&mut self.mem, "string");
        self.mem.write_word(header, data as i64);
        let word = self.mem.word;
        self.mem.write_word(header + word, bytes.len() as i64);
        self.strings.insert(bytes, header);
        header
    }

    /// run the package initializers in declaration order, then
    /// main.main; returns the process exit code
    pub fn run(&mut self) -> i32 {
        let mut entries: Vec<usize> = Vec::new();
        for (position, func) in self.module.funcs.iter().enumerate() {
            if is_init_func(&func.name) {
                entries.push(position);
            }
        }
        match self.func_index.get("main.main") {
            Some(main) => entries.push(*main),
            None => {
                eprintln!("vm: module has no main.main");
                return EXIT_FAULT;
            }
        }

        let mut code = 0;
        'entries: for entry in entries {
            if let Flow::Exit(exit_code) = self.enter(entry) {
                code = exit_code;
                break 'entries;
            }
            loop {
                match self.step() {
                    Flow::Exit(exit_code) => {
                        code = exit_code;
                        break 'entries;
                    }
                    Flow::Return if self.frames.is_empty() => break,
                    _ => {}
                }
            }
        }

        if self.print_mem_summary {
            self.alloc.print_summary();
        }
        debug!("vm: {} steps", self.steps);
        code
    }

    fn step(&mut self) -> Flow {
        self.steps += 1;
        if let Some(limit) = self.step_limit {
            if self.steps > limit {
                eprintln!("vm: step limit of {limit} exceeded");
                self.dump_call_stack();
                return Flow::Exit(EXIT_STEP_LIMIT);
            }
        }

        let frame = self.frames.last().expect("an active frame");
        let func = frame.func;
        let pc = frame.pc;
        let Some(inst) = self.module.funcs[func].insts.get(pc) else {
            // falling off the end behaves like a return
            self.leave();
            return Flow::Return;
        };
        let inst = inst.clone();

        let flow = self.execute(func, &inst);
        match flow {
            Flow::Next => {
                self.frames.last_mut().expect("frame").pc = pc + 1;
                Flow::Next
            }
            Flow::Jump(target) => {
                self.frames.last_mut().expect("frame").pc = target;
                Flow::Next
            }
            Flow::Entered => {
                // the caller resumes after the call instruction
                let depth = self.frames.len();
                self.frames[depth - 2].pc = pc + 1;
                Flow::Next
            }
            Flow::Return => Flow::Return,
            Flow::Exit(code) => Flow::Exit(code),
        }
    }

    fn execute(&mut self, func: usize, inst: &Inst) -> Flow {
        let word = self.mem.word;
        let pitch = self.pitches[func];
        let fp = self.frames.last().expect("frame").fp;

        match inst.opcode {
            Opcode::const_i64 | Opcode::const_bool => self.push(inst.value),
            Opcode::const_nil => self.push(0),
            Opcode::const_str => {
                let header = self.intern_string(inst.name.as_deref().unwrap_or(""));
                self.push(header as i64);
            }

            Opcode::local_get => {
                let index = inst.arg as usize;
                let width = self.local_width(func, index);
                let value = self.mem.read_sized(fp + index * pitch, width);
                self.push(value);
            }
            Opcode::local_set => {
                let index = inst.arg as usize;
                let width = self.local_width(func, index);
                let value = self.pop();
                self.mem.write_sized(fp + index * pitch, value, width);
            }
            Opcode::local_addr => {
                let index = inst.arg as usize;
                self.push((fp + index * pitch) as i64);
            }

            Opcode::global_get => {
                let value = self.mem.read_word(GLOBALS_BASE + inst.arg as usize * word);
                self.push(value);
            }
            Opcode::global_set => {
                let value = self.pop();
                self.mem.write_word(GLOBALS_BASE + inst.arg as usize * word, value);
            }
            Opcode::global_addr => {
                self.push((GLOBALS_BASE + inst.arg as usize * word) as i64);
            }

            Opcode::drop => {
                self.pop();
            }
            Opcode::dup => {
                let value = self.pop();
                self.push(value);
                self.push(value);
            }

            Opcode::add | Opcode::sub | Opcode::mul | Opcode::and | Opcode::or | Opcode::xor
            | Opcode::shl | Opcode::shr => {
                let rhs = self.pop();
                let lhs = self.pop();
                let result = match inst.opcode {
                    Opcode::add => lhs.wrapping_add(rhs),
                    Opcode::sub => lhs.wrapping_sub(rhs),
                    Opcode::mul => lhs.wrapping_mul(rhs),
                    Opcode::and => lhs & rhs,
                    Opcode::or => lhs | rhs,
                    Opcode::xor => lhs ^ rhs,
                    Opcode::shl => lhs.wrapping_shl(rhs as u32),
                    _ => lhs.wrapping_shr(rhs as u32),
                };
                self.push(result);
            }
            Opcode::div | Opcode::mod_ => {
                let rhs = self.pop();
                let lhs = self.pop();
                // division by zero yields zero on the VM
                let result = if rhs == 0 {
                    0
                } else if inst.opcode == Opcode::div {
                    lhs.wrapping_div(rhs)
                } else {
                    lhs.wrapping_rem(rhs)
                };
                self.push(result);
            }
            Opcode::neg => {
                let value = self.pop();
                self.push(value.wrapping_neg());
            }
            Opcode::not => {
                let value = self.pop();
                self.push(!value);
            }

            Opcode::eq | Opcode::neq | Opcode::lt | Opcode::gt | Opcode::leq | Opcode::geq => {
                let rhs = self.pop();
                let lhs = self.pop();
                let result = match inst.opcode {
                    Opcode::eq => lhs == rhs,
                    Opcode::neq => lhs != rhs,
                    Opcode::lt => lhs < rhs,
                    Opcode::gt => lhs > rhs,
                    Opcode::leq => lhs <= rhs,
                    _ => lhs >= rhs,
                };
                self.push(result as i64);
            }

            Opcode::label => {}
            Opcode::jmp => return self.jump(func, inst.arg),
            Opcode::jmp_if => {
                let value = self.pop();
                if value != 0 {
                    return self.jump(func, inst.arg);
                }
            }
            Opcode::jmp_if_not => {
                let value = self.pop();
                if value == 0 {
                    return self.jump(func, inst.arg);
                }
            }

            Opcode::call => {
                let name = inst.name.as_deref().unwrap_or("").to_owned();
                if let Some(fields) = IRModule::composite_field_count(&name) {
                    self.composite(fields);
                } else {
                    return self.call_by_name(&name);
                }
            }
            Opcode::call_intrinsic => {
                let name = inst.name.as_deref().unwrap_or("").to_owned();
                return self.intrinsic(&name);
            }
            Opcode::return_ => {
                self.leave();
                return Flow::Return;
            }

            Opcode::load => {
                let addr = self.pop();
                let width = if inst.width == 0 { word } else { inst.width as usize };
                // nil-safe: a load through 0 produces 0
                let value = if addr == 0 {
                    0
                } else {
                    let addr = self.uaddr(addr);
                    self.mem.read_sized(addr, width)
                };
                self.push(value);
            }
            Opcode::store => {
                let value = self.pop();
                let raw = self.pop();
                let addr = self.uaddr(raw);
                let width = if inst.width == 0 { word } else { inst.width as usize };
                self.mem.write_sized(addr, value, width);
            }
            Opcode::offset => {
                let addr = self.pop();
                self.push(addr.wrapping_add(inst.arg));
            }
            Opcode::index_addr => {
                let index = self.pop();
                let raw = self.pop();
                let header = self.uaddr(raw);
                let data = self.mem.read_word(header);
                self.push(data.wrapping_add(index.wrapping_mul(inst.value)));
            }
            Opcode::len => {
                let addr = self.pop();
                let value = if addr == 0 {
                    0
                } else {
                    let addr = self.uaddr(addr);
                    self.mem.read_word(addr + word)
                };
                self.push(value);
            }

            Opcode::convert => {
                let name = inst.name.as_deref().unwrap_or("");
                match name {
                    "string" => return self.call_by_name("runtime.BytesToString"),
                    "[]byte" => return self.call_by_name("runtime.StringToBytes"),
                    "byte" | "uint8" => {
                        let value = self.pop();
                        self.push(value & 0xff);
                    }
                    "uint16" => {
                        let value = self.pop();
                        self.push(value & 0xffff);
                    }
                    "uint32" => {
                        let value = self.pop();
                        self.push(value & 0xffff_ffff);
                    }
                    "int32" => {
                        let value = self.pop();
                        self.push(value as i32 as i64);
                    }
                    _ => {}
                }
            }

            Opcode::iface_box => {
                let value = self.pop();
                let block = self.alloc.alloc_2(&mut self.mem, "iface-box");
                self.mem.write_word(block, inst.value);
                self.mem.write_word(block + word, value);
                self.push(block as i64);
            }
            Opcode::iface_call => {
                let name = inst.name.as_deref().unwrap_or("").to_owned();
                return self.iface_call(&name, inst.arg as usize);
            }

            Opcode::panic => return self.panic(),
        }
        Flow::Next
    }

    fn local_width(&self, func: usize, index: usize) -> usize {
        match self.module.funcs[func].locals.get(index) {
            Some(local) if local.width != 0 => local.width as usize,
            _ => self.mem.word,
        }
    }

    fn jump(&mut self, func: usize, label: i64) -> Flow {
        match self.labels[func].get(&label).copied() {
            Some(target) => Flow::Jump(target),
            None => self.fault(&format!(
                "{}: jump to undefined label {label}",
                self.module.funcs[func].name
            )),
        }
    }

    fn composite(&mut self, fields: usize) {
        let word = self.mem.word;
        let mut values = Vec::with_capacity(fields);
        for _ in 0..fields {
            values.push(self.pop());
        }
        let block = self.alloc.alloc_bump(fields * word, "composite");
        // pops arrived last-field-first
        for (position, value) in values.into_iter().rev().enumerate() {
            self.mem.write_word(block + position * word, value);
        }
        self.push(block as i64);
    }

    fn iface_call(&mut self, name: &str, argc: usize) -> Flow {
        let bare = name.rsplit('.').next().unwrap_or(name);
        let Some(method_id) = self.method_ids.get(bare).copied() else {
            return self.fault(&format!("interface method '{name}' is not in the method table"));
        };

        let word = self.mem.word;
        let split_at = self.stack.len().saturating_sub(argc);
        let args = self.stack.split_off(split_at);
        let raw = self.pop();
        let boxed = self.uaddr(raw);
        let type_id = self.mem.read_word(boxed);
        let concrete = self.mem.read_word(boxed + word);
        self.push(concrete);
        self.stack.extend(args);

        match self.dispatch.get(&(type_id, method_id)).copied() {
            Some(func) => self.enter(func),
            None => self.fault(&format!(
                "no implementation of '{bare}' for type id {type_id}"
            )),
        }
    }

    /// the Tostring routing: already-a-header passes through, int and
    /// string boxes unbox, everything else goes through its Error or
    /// String method
    fn tostring(&mut self) -> Flow {
        let word = self.mem.word;
        let value = self.pop();
        let addr = self.uaddr(value);
        let first = self.mem.read_word(addr);
        if first >= 256 {
            self.push(value);
            return Flow::Next;
        }

        let concrete = self.mem.read_word(addr + word);
        if first == TYPE_ID_INT {
            self.push(concrete);
            return self.call_by_name("runtime.IntToString");
        }
        if first == TYPE_ID_STRING {
            self.push(concrete);
            return Flow::Next;
        }

        self.push(concrete);
        for bare in ["Error", "String"] {
            let Some(method_id) = self.method_ids.get(bare).copied() else {
                continue;
            };
            if let Some(func) = self.dispatch.get(&(first, method_id)).copied() {
                return self.enter(func);
            }
        }
        self.fault(&format!("no string conversion for type id {first}"))
    }

    fn panic(&mut self) -> Flow {
        let word = self.mem.word;
        let value = self.pop();
        let mut addr = self.uaddr(value);
        let first = self.mem.read_word(addr);
        if first < 256 {
            // an interface box: unwrap the concrete value
            let concrete = self.mem.read_word(addr + word);
            addr = self.uaddr(concrete);
        }
        let data_word = self.mem.read_word(addr);
        let data = self.uaddr(data_word);
        let len = self.mem.read_word(addr + word) as usize;
        let bytes = self.mem.read_bytes(data, len);
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(&bytes);
        let _ = stderr.write_all(b"\n");
        Flow::Exit(EXIT_FAULT)
    }

    fn intrinsic(&mut self, name: &str) -> Flow {
        let word = self.mem.word;
        match name {
            "SysRead" => {
                let len = self.pop() as usize;
                let raw = self.pop();
                let buf = self.uaddr(raw);
                let fd = self.pop();
                let mut data = vec![0u8; len];
                let triple = self.io.read(fd, &mut data);
                if triple.2 == 0 {
                    self.mem.write_bytes(buf, &data[..triple.0 as usize]);
                }
                self.push_triple(triple);
            }
            "SysWrite" => {
                let len = self.pop() as usize;
                let raw = self.pop();
                let buf = self.uaddr(raw);
                let fd = self.pop();
                let data = self.mem.read_bytes(buf, len);
                let triple = self.io.write(fd, &data);
                self.push_triple(triple);
            }
            "SysOpen" => {
                let mode = self.pop();
                let flags = self.pop();
                let raw = self.pop();
                let path_addr = self.uaddr(raw);
                let path = self.mem.read_cstring(path_addr);
                let triple = self.io.open(&path, flags, mode);
                self.push_triple(triple);
            }
            "SysClose" => {
                let fd = self.pop();
                let triple = self.io.close(fd);
                self.push_triple(triple);
            }
            "SysStat" => {
                let raw = self.pop();
                let path_addr = self.uaddr(raw);
                let path = self.mem.read_cstring(path_addr);
                let triple = self.io.stat(&path);
                self.push_triple(triple);
            }
            "SysMkdir" => {
                let mode = self.pop();
                let raw = self.pop();
                let path_addr = self.uaddr(raw);
                let path = self.mem.read_cstring(path_addr);
                let triple = self.io.mkdir(&path, mode);
                self.push_triple(triple);
            }
            "SysRmdir" => {
                let raw = self.pop();
                let path_addr = self.uaddr(raw);
                let path = self.mem.read_cstring(path_addr);
                let triple = self.io.rmdir(&path);
                self.push_triple(triple);
            }
            "SysUnlink" => {
                let raw = self.pop();
                let path_addr = self.uaddr(raw);
                let path = self.mem.read_cstring(path_addr);
                let triple = self.io.unlink(&path);
                self.push_triple(triple);
            }
            "SysGetcwd" => {
                let size = self.pop() as usize;
                let raw = self.pop();
                let buf = self.uaddr(raw);
                match self.io.getcwd() {
                    Ok(dir) => {
                        let take = dir.len().min(size);
                        self.mem.write_bytes(buf, &dir[..take]);
                        self.push_triple(ok(take as i64, 0));
                    }
                    Err(triple) => self.push_triple(triple),
                }
            }
            "SysChmod" => {
                let mode = self.pop();
                let raw = self.pop();
                let path_addr = self.uaddr(raw);
                let path = self.mem.read_cstring(path_addr);
                let triple = self.io.chmod(&path, mode);
                self.push_triple(triple);
            }
            "SysDup2" => {
                let new_fd = self.pop();
                let old_fd = self.pop();
                let triple = self.io.dup2(old_fd, new_fd);
                self.push_triple(triple);
            }
            "SysFork" => {
                let triple = self.io.fork();
                self.push_triple(triple);
            }
            "SysExecve" => {
                let raw = self.pop();
                let envp = self.uaddr(raw);
                let raw = self.pop();
                let argv = self.uaddr(raw);
                let raw = self.pop();
                let path_addr = self.uaddr(raw);
                let path = self.mem.read_cstring(path_addr);
                let argv = self.read_pointer_strings(argv);
                let envp = self.read_pointer_strings(envp);
                let triple = self.io.execve(&path, argv, envp);
                self.push_triple(triple);
            }
            "SysWait4" => {
                let pid = self.pop();
                let triple = self.io.wait4(pid);
                self.push_triple(triple);
            }
            "SysPipe" => {
                let triple = self.io.pipe();
                self.push_triple(triple);
            }
            "SysGetpid" => {
                let triple = self.io.getpid();
                self.push_triple(triple);
            }
            "SysExit" => {
                let code = self.pop();
                return Flow::Exit(code as i32);
            }
            "SysMmap" => {
                let len = self.pop() as usize;
                let addr = self.alloc.alloc_bump(len, "mmap");
                self.push_triple(ok(addr as i64, 0));
            }
            "SysOpendir" => {
                let raw = self.pop();
                let path_addr = self.uaddr(raw);
                let path = self.mem.read_cstring(path_addr);
                let triple = self.io.opendir(&path);
                self.push_triple(triple);
            }
            "SysReaddir" => {
                let cap = self.pop() as usize;
                let raw = self.pop();
                let buf = self.uaddr(raw);
                let handle = self.pop();
                match self.io.readdir(handle) {
                    Ok(name) => {
                        let take = name.len().min(cap);
                        self.mem.write_bytes(buf, &name[..take]);
                        self.push_triple(ok(take as i64, 0));
                    }
                    Err(triple) => self.push_triple(triple),
                }
            }
            "SysClosedir" => {
                let handle = self.pop();
                let triple = self.io.closedir(handle);
                self.push_triple(triple);
            }

            "SysGetargc" => {
                let value = self.mem.read_word(GLOBALS_BASE + self.module.globals * word);
                self.push(value);
            }
            "SysGetargv" => {
                let value = self
                    .mem
                    .read_word(GLOBALS_BASE + (self.module.globals + 1) * word);
                self.push(value);
            }
            "SysGetenvp" => {
                let value = self
                    .mem
                    .read_word(GLOBALS_BASE + (self.module.globals + 2) * word);
                self.push(value);
            }

            "Sliceptr" | "Stringptr" | "ReadPtr" => {
                let raw = self.pop();
                let addr = self.uaddr(raw);
                let value = self.mem.read_word(addr);
                self.push(value);
            }
            "WritePtr" => {
                let value = self.pop();
                let raw = self.pop();
                let addr = self.uaddr(raw);
                self.mem.write_word(addr, value);
            }
            "WriteByte" => {
                let value = self.pop();
                let raw = self.pop();
                let addr = self.uaddr(raw);
                self.mem.write_byte(addr, value as u8);
            }

            "Makestring" => {
                let len = self.pop();
                let data = self.pop();
                let header = self.alloc.alloc_2(&mut self.mem, "string");
                self.mem.write_word(header, data);
                self.mem.write_word(header + word, len);
                self.push(header as i64);
            }
            "Makeslice" => {
                let elem_size = self.pop();
                let cap = self.pop();
                let len = self.pop();
                let data = self.pop();
                let header = self.alloc.alloc_4(&mut self.mem, "slice");
                self.mem.write_word(header, data);
                self.mem.write_word(header + word, len);
                self.mem.write_word(header + 2 * word, cap);
                self.mem.write_word(header + 3 * word, elem_size);
                self.push(header as i64);
            }

            "Tostring" => return self.tostring(),

            _ => return self.fault(&format!("unknown intrinsic '{name}'")),
        }
        Flow::Next
    }

    fn read_pointer_strings(&mut self, mut addr: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        if addr == 0 {
            return out;
        }
        loop {
            let ptr = self.mem.read_word(addr);
            if ptr == 0 {
                return out;
            }
            let target = self.uaddr(ptr);
            out.push(self.mem.read_cstring(target));
            addr += self.mem.word;
        }
    }
}

/// run a module to completion and return its exit code
pub fn run(module: &IRModule, config: &VmConfig) -> i32 {
    let mut vm = Vm::new(module, config);
    vm.run()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use rtg_ir::opcode::Opcode;
    use rtg_ir::{IRFunc, IRModule, Inst, LocalVar};

    use crate::{run, VmConfig};

    fn module_with_main(insts: Vec<Inst>) -> IRModule {
        IRModule {
            funcs: vec![IRFunc {
                name: "main.main".to_owned(),
                params: 0,
                locals: vec![LocalVar { width: 0 }, LocalVar { width: 0 }],
                insts,
            }],
            globals: 2,
            methods: vec![],
            type_ids: vec![],
        }
    }

    fn config() -> VmConfig {
        VmConfig::new(vec!["prog".to_owned()])
    }

    #[test]
    fn test_arithmetic_and_exit() {
        // 2 + 3 * 4 == 14 exits 0, the wrong branch exits 1
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
        assert_eq!(run(&module, &config()), 0);
    }

    #[test]
    fn test_div_by_zero_yields_zero() {
        let module = module_with_main(vec![
            Inst::with_value(Opcode::const_i64, 9),
            Inst::with_value(Opcode::const_i64, 0),
            Inst::new(Opcode::div),
            Inst::intrinsic("SysExit"),
        ]);
        assert_eq!(run(&module, &config()), 0);
    }

    #[test]
    fn test_locals_and_calls() {
        let mut module = module_with_main(vec![
            Inst::with_value(Opcode::const_i64, 20),
            Inst::with_value(Opcode::const_i64, 22),
            Inst::call("main.add"),
            Inst::intrinsic("SysExit"),
        ]);
        module.funcs.push(IRFunc {
            name: "main.add".to_owned(),
            params: 2,
            locals: vec![LocalVar { width: 0 }, LocalVar { width: 0 }],
            insts: vec![
                Inst::with_arg(Opcode::local_get, 0),
                Inst::with_arg(Opcode::local_get, 1),
                Inst::new(Opcode::add),
                Inst::new(Opcode::return_),
            ],
        });
        assert_eq!(run(&module, &config()), 42);
    }

    #[test]
    fn test_nil_safe_load_and_len() {
        let module = module_with_main(vec![
            Inst::new(Opcode::const_nil),
            Inst::new(Opcode::load),
            Inst::new(Opcode::const_nil),
            Inst::new(Opcode::len),
            Inst::new(Opcode::add),
            Inst::intrinsic("SysExit"),
        ]);
        assert_eq!(run(&module, &config()), 0);
    }

    #[test]
    fn test_globals_and_init_order() {
        // the initializer stores 7 into global 0, main reads it
        let module = IRModule {
            funcs: vec![
                IRFunc {
                    name: "main.init".to_owned(),
                    params: 0,
                    locals: vec![],
                    insts: vec![
                        Inst::with_value(Opcode::const_i64, 7),
                        Inst::with_arg(Opcode::global_set, 0),
                        Inst::new(Opcode::return_),
                    ],
                },
                IRFunc {
                    name: "main.main".to_owned(),
                    params: 0,
                    locals: vec![],
                    insts: vec![
                        Inst::with_arg(Opcode::global_get, 0),
                        Inst::intrinsic("SysExit"),
                    ],
                },
            ],
            globals: 1,
            methods: vec![],
            type_ids: vec![],
        };
        assert_eq!(run(&module, &config()), 7);
    }

    #[test]
    fn test_interface_dispatch() {
        // two concrete types implement Value(); type id 257 doubles
        let module = IRModule {
            funcs: vec![
                IRFunc {
                    name: "main.main".to_owned(),
                    params: 0,
                    locals: vec![],
                    insts: vec![
                        Inst::with_value(Opcode::const_i64, 21),
                        Inst::with_value(Opcode::iface_box, 257),
                        Inst {
                            opcode: Opcode::iface_call,
                            arg: 0,
                            width: 0,
                            value: 0,
                            name: Some("Thing.Value".to_owned()),
                        },
                        Inst::intrinsic("SysExit"),
                    ],
                },
                IRFunc {
                    name: "main.one".to_owned(),
                    params: 1,
                    locals: vec![LocalVar { width: 0 }],
                    insts: vec![
                        Inst::with_arg(Opcode::local_get, 0),
                        Inst::new(Opcode::return_),
                    ],
                },
                IRFunc {
                    name: "main.two".to_owned(),
                    params: 1,
                    locals: vec![LocalVar { width: 0 }],
                    insts: vec![
                        Inst::with_arg(Opcode::local_get, 0),
                        Inst::with_value(Opcode::const_i64, 2),
                        Inst::new(Opcode::mul),
                        Inst::new(Opcode::return_),
                    ],
                },
            ],
            globals: 0,
            methods: vec![
                ("One.Value".to_owned(), "main.one".to_owned()),
                ("Two.Value".to_owned(), "main.two".to_owned()),
            ],
            type_ids: vec![("One".to_owned(), 256), ("Two".to_owned(), 257)],
        };
        assert_eq!(run(&module, &config()), 42);
    }

    #[test]
    fn test_step_limit_exits_99() {
        let module = module_with_main(vec![
            Inst::with_arg(Opcode::label, 1),
            Inst::with_arg(Opcode::jmp, 1),
        ]);
        let mut config = config();
        config.step_limit = Some(1000);
        assert_eq!(run(&module, &config), crate::EXIT_STEP_LIMIT);
    }

    #[test]
    fn test_word_width_masks_arithmetic() {
        let module = module_with_main(vec![
            Inst::with_value(Opcode::const_i64, 0xffff),
            Inst::with_value(Opcode::const_i64, 1),
            Inst::new(Opcode::add),
            // on a 2-byte word this wraps to 0
            Inst::intrinsic("SysExit"),
        ]);
        let mut config = config();
        config.word = 2;
        assert_eq!(run(&module, &config), 0);
    }

    #[test]
    fn test_argv_exposed() {
        let module = module_with_main(vec![
            Inst::intrinsic("SysGetargc"),
            Inst::intrinsic("SysExit"),
        ]);
        let mut config = config();
        config.args = vec!["prog".to_owned(), "a".to_owned(), "b".to_owned()];
        assert_eq!(run(&module, &config), 3);
    }

    #[test]
    fn test_composite_constructor() {
        let module = module_with_main(vec![
            Inst::with_value(Opcode::const_i64, 10),
            Inst::with_value(Opcode::const_i64, 32),
            Inst::call("builtin.composite.2"),
            // the block holds {10, 32}; read the second field
            Inst::with_arg(Opcode::offset, 8),
            Inst::new(Opcode::load),
            Inst::intrinsic("SysExit"),
        ]);
        assert_eq!(run(&module, &config()), 32);
    }

    #[test]
    fn test_makestring_and_tostring_passthrough() {
        // a header made by Makestring has a data pointer >= 256, so
        // Tostring passes it through unchanged
        let module = module_with_main(vec![
            Inst::with_name(Opcode::const_str, "\"ab\""),
            Inst::intrinsic("Tostring"),
            Inst::new(Opcode::len),
            Inst::intrinsic("SysExit"),
        ]);
        assert_eq!(run(&module, &config()), 2);
    }
}
