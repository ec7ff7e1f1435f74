// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// IR lowering and instruction selection.
//
// one code generator exists per architecture (x64, x86, arm64, wasm),
// each owning its assembler, its buffers and its fixup tables for the
// duration of one compilation. nothing is shared between compilations.
//
// the generators all follow the same mechanical ABI:
//
// - a dedicated register holds the top of a downward-growing operand
//   stack (x86-64: r15, i386: edi, arm64: x28; wasm simulates it with
//   a global); every IR value flows through this stack
// - the machine stack carries only call frames and scratch spills
// - at most one push may be pending in a register; 'flush' stores it
//   and must run before every label, branch, call and return
//
// the driver below dispatches on (os, arch), runs the matching
// generator and hands the finished image to the container writer.

use std::collections::HashMap;
use std::path::Path;

use log::debug;
use serde::Serialize;
use thiserror::Error;

use rtg_ir::IRModule;
use rtg_object::ObjectError;

pub mod arm64;
pub mod wasm;
pub mod x64;
pub mod x86;

/// the number of word slots reserved after the user globals for the
/// startup values read by SysGetargc / SysGetargv / SysGetenvp
pub const RESERVED_GLOBALS: usize = 3;

/// the error value produced for OS intrinsics a target does not
/// provide (the directory trio natively, most of the table on wasi)
pub const ENOSYS: i64 = 38;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Target {
    LinuxAmd64,
    Linux386,
    Windows386,
    WindowsArm64,
    DarwinArm64,
    WasiWasm32,
}

impl Target {
    pub fn parse(text: &str) -> Option<Target> {
        match text {
            "linux/amd64" => Some(Target::LinuxAmd64),
            "linux/386" => Some(Target::Linux386),
            "windows/386" => Some(Target::Windows386),
            "windows/arm64" => Some(Target::WindowsArm64),
            "darwin/arm64" => Some(Target::DarwinArm64),
            "wasi/wasm32" => Some(Target::WasiWasm32),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Target::LinuxAmd64 => "linux/amd64",
            Target::Linux386 => "linux/386",
            Target::Windows386 => "windows/386",
            Target::WindowsArm64 => "windows/arm64",
            Target::DarwinArm64 => "darwin/arm64",
            Target::WasiWasm32 => "wasi/wasm32",
        }
    }

    pub fn word_size(&self) -> usize {
        match self {
            Target::Linux386 | Target::Windows386 | Target::WasiWasm32 => 4,
            _ => 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodeGenError {
    #[error("{func}: unknown intrinsic '{name}'")]
    UnknownIntrinsic { func: String, name: String },

    #[error("{func}: unknown conversion target '{name}'")]
    UnknownConvert { func: String, name: String },

    #[error("{func}: branch to undefined label {label}")]
    UnknownLabel { func: String, label: i64 },

    #[error("unresolved calls: {}", .0.join(", "))]
    UnresolvedCalls(Vec<String>),

    #[error("interface call '{name}' has no implementation in the method table")]
    EmptyDispatch { name: String },

    #[error(transparent)]
    Object(#[from] ObjectError),
}

/// a branch inside one function, resolved against the label offsets
/// once the function body is complete
#[derive(Debug, Clone, Copy)]
pub struct BranchFixup {
    pub at: usize,
    pub label: i64,
}

/// a call site, resolved against the function offsets once the whole
/// module is lowered
#[derive(Debug, Clone)]
pub struct CallFixup {
    pub at: usize,
    pub name: String,
}

/// string-literal interning: the decoded bytes go into rodata once,
/// the 2-word header (data pointer left zero, length filled) into the
/// writable data section once, and every further use of the same
/// literal reuses both
pub struct StringPool {
    interned: HashMap<Vec<u8>, (usize, usize)>,
    word: usize,
}

impl StringPool {
    pub fn new(word: usize) -> Self {
        Self {
            interned: HashMap::new(),
            word,
        }
    }

    /// returns (header offset in data, bytes offset in rodata)
    pub fn intern(
        &mut self,
        bytes: Vec<u8>,
        rodata: &mut Vec<u8>,
        data: &mut Vec<u8>,
    ) -> (usize, usize) {
        if let Some(entry) = self.interned.get(&bytes) {
            return *entry;
        }

        let rodata_offset = rodata.len();
        rodata.extend_from_slice(&bytes);

        while data.len() % self.word != 0 {
            data.push(0);
        }
        let header_offset = data.len();
        data.extend_from_slice(&vec![0u8; self.word]); // data pointer
        if self.word == 8 {
            data.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        } else {
            data.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        }

        self.interned
            .insert(bytes, (header_offset, rodata_offset));
        (header_offset, rodata_offset)
    }
}

/// argument count of each intrinsic, architecture-independent.
/// None means the name is not an intrinsic.
pub fn intrinsic_argc(name: &str) -> Option<usize> {
    let argc = match name {
        "SysFork" | "SysPipe" | "SysGetpid" | "SysGetargc" | "SysGetargv" | "SysGetenvp" => 0,
        "SysClose" | "SysStat" | "SysRmdir" | "SysUnlink" | "SysExit" | "SysMmap"
        | "SysWait4" | "SysOpendir" | "SysClosedir" | "Sliceptr" | "Stringptr" | "Tostring"
        | "ReadPtr" => 1,
        "SysMkdir" | "SysGetcwd" | "SysChmod" | "SysDup2" | "Makestring" | "WritePtr"
        | "WriteByte" => 2,
        "SysRead" | "SysWrite" | "SysOpen" | "SysExecve" | "SysReaddir" => 3,
        "Makeslice" => 4,
        _ => return None,
    };
    Some(argc)
}

/// whether the intrinsic produces the (r1, r2, err) triple of an OS
/// call rather than a single value (or none)
pub fn intrinsic_is_syscall(name: &str) -> bool {
    name.starts_with("Sys") && !matches!(name, "SysGetargc" | "SysGetargv" | "SysGetenvp")
}

/// the method-table pairs a 'Tostring' dispatch chain compares
/// against: every Error implementation first, then every String
/// implementation of types that have no Error
pub fn tostring_impls(module: &IRModule) -> Vec<(i64, String)> {
    let mut impls = module.method_impls("Error");
    let covered: Vec<i64> = impls.iter().map(|(id, _)| *id).collect();
    for (type_id, func) in module.method_impls("String") {
        if !covered.contains(&type_id) {
            impls.push((type_id, func));
        }
    }
    impls
}

#[derive(Debug, Serialize)]
pub struct SizeAnalysis {
    pub target: String,
    pub total: usize,
    pub functions: Vec<FuncSize>,
}

#[derive(Debug, Serialize)]
pub struct FuncSize {
    pub name: String,
    pub pkg: String,
    pub size: usize,
}

/// what the driver reports after one generation, enough for the
/// size-analysis output
#[derive(Debug)]
pub struct Generated {
    pub funcs: Vec<(String, usize)>,
    pub code_size: usize,
}

impl Generated {
    pub fn size_analysis(&self, target: Target) -> SizeAnalysis {
        let mut functions = Vec::with_capacity(self.funcs.len());
        for (i, (name, offset)) in self.funcs.iter().enumerate() {
            let end = self
                .funcs
                .get(i + 1)
                .map(|(_, next)| *next)
                .unwrap_or(self.code_size);
            let pkg = name.rsplit_once('.').map(|(p, _)| p).unwrap_or("");
            functions.push(FuncSize {
                name: name.clone(),
                pkg: pkg.to_owned(),
                size: end - offset,
            });
        }
        SizeAnalysis {
            target: target.name().to_owned(),
            total: self.code_size,
            functions,
        }
    }
}

/// generate the executable for one target and write it to 'path'.
/// on error no output file is left behind.
pub fn generate(
    module: &IRModule,
    target: Target,
    path: &Path,
) -> Result<Generated, CodeGenError> {
    debug!("generate {} -> {}", target.name(), path.display());
    let result = match target {
        Target::LinuxAmd64 => x64::generate_linux_amd64(module, path),
        Target::Linux386 => x86::generate_linux_386(module, path),
        Target::Windows386 => x86::generate_windows_386(module, path),
        Target::DarwinArm64 => arm64::generate_darwin_arm64(module, path),
        Target::WindowsArm64 => arm64::generate_windows_arm64(module, path),
        Target::WasiWasm32 => wasm::generate_wasi_wasm32(module, path),
    };
    if result.is_err() {
        let _ = std::fs::remove_file(path);
    }
    result
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{intrinsic_argc, intrinsic_is_syscall, StringPool, Target};

    #[test]
    fn test_target_parse() {
        assert_eq!(Target::parse("linux/amd64"), Some(Target::LinuxAmd64));
        assert_eq!(Target::parse("darwin/arm64"), Some(Target::DarwinArm64));
        assert_eq!(Target::parse("plan9/mips"), None);
        assert_eq!(Target::Linux386.word_size(), 4);
        assert_eq!(Target::LinuxAmd64.word_size(), 8);
    }

    #[test]
    fn test_string_pool_interning() {
        let mut pool = StringPool::new(8);
        let mut rodata = Vec::new();
        let mut data = vec![0u8; 24]; // pretend globals

        let (header_a, bytes_a) = pool.intern(b"hello".to_vec(), &mut rodata, &mut data);
        let (header_b, bytes_b) = pool.intern(b"hello".to_vec(), &mut rodata, &mut data);
        assert_eq!((header_a, bytes_a), (header_b, bytes_b));
        assert_eq!(rodata, b"hello");

        // the header length word is filled, the pointer word is zero
        assert_eq!(&data[header_a..header_a + 8], &[0u8; 8]);
        assert_eq!(
            u64::from_le_bytes(data[header_a + 8..header_a + 16].try_into().unwrap()),
            5
        );

        let (header_c, _) = pool.intern(b"world".to_vec(), &mut rodata, &mut data);
        assert_ne!(header_a, header_c);
        assert_eq!(rodata, b"helloworld");
    }

    #[test]
    fn test_intrinsic_table() {
        assert_eq!(intrinsic_argc("SysWrite"), Some(3));
        assert_eq!(intrinsic_argc("SysFork"), Some(0));
        assert_eq!(intrinsic_argc("Makeslice"), Some(4));
        assert_eq!(intrinsic_argc("runtime.Alloc"), None);

        assert!(intrinsic_is_syscall("SysWrite"));
        assert!(!intrinsic_is_syscall("SysGetargc"));
        assert!(!intrinsic_is_syscall("Tostring"));
    }

    #[test]
    fn test_size_analysis_pkg_split() {
        let generated = crate::Generated {
            funcs: vec![
                ("_start".to_owned(), 0),
                ("os.Open".to_owned(), 10),
                ("main.main".to_owned(), 30),
            ],
            code_size: 50,
        };
        let report = generated.size_analysis(Target::LinuxAmd64);
        assert_eq!(report.total, 50);
        assert_eq!(report.functions[1].pkg, "os");
        assert_eq!(report.functions[1].size, 20);
        assert_eq!(report.functions[2].size, 20);
        assert_eq!(report.functions[0].pkg, "");
    }
}
