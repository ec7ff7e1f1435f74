// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// end-to-end generation scenarios: one IR module through every
// target, checking the written containers structurally.

use std::path::PathBuf;

use pretty_assertions::assert_eq;

use rtg_codegen::{generate, CodeGenError, Target};
use rtg_ir::opcode::Opcode;
use rtg_ir::{IRFunc, IRModule, Inst, LocalVar};

fn temp_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("rtg-codegen-scenarios");
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

/// the hello-world module: write "hello\n" to stdout, exit 0
fn hello_module() -> IRModule {
    IRModule {
        funcs: vec![IRFunc {
            name: "main.main".to_owned(),
            params: 0,
            locals: vec![LocalVar { width: 0 }],
            insts: vec![
                Inst::with_value(Opcode::const_i64, 1),
                Inst::with_name(Opcode::const_str, "\"hello\\n\""),
                Inst::intrinsic("Stringptr"),
                Inst::with_value(Opcode::const_i64, 6),
                Inst::intrinsic("SysWrite"),
                Inst::new(Opcode::drop),
                Inst::new(Opcode::drop),
                Inst::new(Opcode::drop),
                Inst::with_value(Opcode::const_i64, 0),
                Inst::intrinsic("SysExit"),
            ],
        }],
        globals: 0,
        methods: vec![],
        type_ids: vec![],
    }
}

#[test]
fn test_every_target_writes_a_container() {
    let module = hello_module();
    let cases: [(Target, &str, &[u8]); 6] = [
        (Target::LinuxAmd64, "hello-amd64", b"\x7fELF"),
        (Target::Linux386, "hello-386", b"\x7fELF"),
        (Target::Windows386, "hello-win386.exe", b"MZ"),
        (Target::WindowsArm64, "hello-winarm64.exe", b"MZ"),
        (Target::DarwinArm64, "hello-darwin", &[0xcf, 0xfa, 0xed, 0xfe]),
        (Target::WasiWasm32, "hello.wasm", b"\0asm"),
    ];

    for (target, name, magic) in cases {
        let path = temp_path(name);
        let generated = generate(&module, target, &path)
            .unwrap_or_else(|error| panic!("{}: {error}", target.name()));
        assert_eq!(generated.funcs.len(), 1, "{}", target.name());

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..magic.len()], magic, "{}", target.name());
        // the literal travels into every container
        assert!(
            bytes.windows(6).any(|window| window == b"hello\n"),
            "{}: literal present",
            target.name()
        );
    }
}

#[test]
fn test_unresolved_calls_leave_no_file() {
    let mut module = hello_module();
    module.funcs[0]
        .insts
        .insert(0, Inst::call("missing.func"));
    let path = temp_path("unresolved-out");
    let _ = std::fs::remove_file(&path);

    let err = generate(&module, Target::LinuxAmd64, &path).unwrap_err();
    match err {
        CodeGenError::UnresolvedCalls(names) => {
            assert_eq!(names, vec!["missing.func".to_owned()])
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!path.exists(), "no output file on error");
}

#[test]
fn test_size_analysis_covers_all_functions() {
    let mut module = hello_module();
    module.funcs.push(IRFunc {
        name: "util.helper".to_owned(),
        params: 1,
        locals: vec![LocalVar { width: 0 }],
        insts: vec![
            Inst::with_arg(Opcode::local_get, 0),
            Inst::new(Opcode::return_),
        ],
    });
    // keep the helper reachable so nothing is left unresolved
    module.funcs[0].insts.insert(
        0,
        Inst::with_value(Opcode::const_i64, 1),
    );
    module.funcs[0].insts.insert(1, Inst::call("util.helper"));
    module.funcs[0].insts.insert(2, Inst::new(Opcode::drop));

    let path = temp_path("sized-out");
    let generated = generate(&module, Target::LinuxAmd64, &path).unwrap();
    let report = generated.size_analysis(Target::LinuxAmd64);

    assert_eq!(report.target, "linux/amd64");
    assert_eq!(report.functions.len(), 2);
    assert_eq!(report.functions[0].name, "main.main");
    assert_eq!(report.functions[0].pkg, "main");
    assert_eq!(report.functions[1].pkg, "util");
    assert!(report.functions.iter().all(|func| func.size > 0));
    let sum: usize = report.functions.iter().map(|func| func.size).sum();
    assert!(sum <= report.total);

    // it serializes to the documented shape
    let json = serde_json::to_value(&report).unwrap();
    assert!(json.get("target").is_some());
    assert!(json.get("total").is_some());
    assert!(json["functions"][0].get("name").is_some());
}

#[test]
fn test_init_functions_called_from_stub() {
    let mut module = hello_module();
    module.funcs.insert(
        0,
        IRFunc {
            name: "main.init".to_owned(),
            params: 0,
            locals: vec![],
            insts: vec![Inst::new(Opcode::return_)],
        },
    );
    let path = temp_path("init-out");
    let generated = generate(&module, Target::LinuxAmd64, &path).unwrap();

    // offsets stay monotonic with the init function first
    let offsets: Vec<usize> = generated.funcs.iter().map(|(_, off)| *off).collect();
    assert!(offsets.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(offsets[0] > 0, "the entry stub precedes all functions");
}

#[test]
fn test_interface_scenario_on_every_native_target() {
    // two types implementing String(); Tostring must route by type id
    let module = IRModule {
        funcs: vec![
            IRFunc {
                name: "main.main".to_owned(),
                params: 0,
                locals: vec![],
                insts: vec![
                    Inst::with_value(Opcode::const_i64, 1),
                    Inst::with_value(Opcode::iface_box, 257),
                    Inst::intrinsic("Tostring"),
                    Inst::new(Opcode::drop),
                    Inst::with_value(Opcode::const_i64, 0),
                    Inst::intrinsic("SysExit"),
                ],
            },
            IRFunc {
                name: "main.oneString".to_owned(),
                params: 1,
                locals: vec![LocalVar { width: 0 }],
                insts: vec![
                    Inst::with_arg(Opcode::local_get, 0),
                    Inst::new(Opcode::return_),
                ],
            },
            IRFunc {
                name: "main.twoString".to_owned(),
                params: 1,
                locals: vec![LocalVar { width: 0 }],
                insts: vec![
                    Inst::with_arg(Opcode::local_get, 0),
                    Inst::new(Opcode::return_),
                ],
            },
            IRFunc {
                name: "runtime.Alloc".to_owned(),
                params: 1,
                locals: vec![LocalVar { width: 0 }],
                insts: vec![
                    Inst::with_arg(Opcode::local_get, 0),
                    Inst::new(Opcode::return_),
                ],
            },
            IRFunc {
                name: "runtime.IntToString".to_owned(),
                params: 1,
                locals: vec![LocalVar { width: 0 }],
                insts: vec![
                    Inst::with_arg(Opcode::local_get, 0),
                    Inst::new(Opcode::return_),
                ],
            },
        ],
        globals: 0,
        methods: vec![
            ("One.String".to_owned(), "main.oneString".to_owned()),
            ("Two.String".to_owned(), "main.twoString".to_owned()),
        ],
        type_ids: vec![("One".to_owned(), 256), ("Two".to_owned(), 257)],
    };

    for target in [
        Target::LinuxAmd64,
        Target::Linux386,
        Target::Windows386,
        Target::WindowsArm64,
        Target::DarwinArm64,
        Target::WasiWasm32,
    ] {
        let path = temp_path(&format!("iface-{}", target.name().replace('/', "-")));
        generate(&module, target, &path)
            .unwrap_or_else(|error| panic!("{}: {error}", target.name()));
    }
}
