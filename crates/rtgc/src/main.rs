// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// the backend driver.
//
// rtgc consumes an IR module (the front end's serialized output) and
// either executes it on the portable VM or hands it to the native
// code generator for one of the supported (os, arch) targets:
//
//   rtgc program.ir --target vm -- arg1 arg2
//   rtgc program.ir --target linux/amd64 -o program
//   rtgc program.ir --target darwin/arm64 -o program --size-analysis sizes.json
//
// the VM honors RTG_VM_STEPS (step limit), RTG_VM_MEM (memory
// summary) and RTG_VM_ALLOC (per-allocation log).

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use log::debug;

use rtg_codegen::{generate, CodeGenError, Target};
use rtg_ir::IRModule;
use rtg_vm::VmConfig;

#[derive(Parser)]
#[command(name = "rtgc", about = "IR backend: native executables and a portable VM")]
struct Cli {
    /// the serialized IR module
    module: PathBuf,

    /// one of linux/amd64, linux/386, windows/386, windows/arm64,
    /// darwin/arm64, wasi/wasm32, vm
    #[arg(long, default_value = "vm")]
    target: String,

    /// output executable path (native targets)
    #[arg(short, long, default_value = "a.out")]
    output: PathBuf,

    /// write a per-function size report as json
    #[arg(long)]
    size_analysis: Option<PathBuf>,

    /// arguments passed through to the program when running on the VM
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let bytes = std::fs::read(&cli.module)
        .with_context(|| format!("read {}", cli.module.display()))?;
    let module: IRModule = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse {}", cli.module.display()))?;
    debug!(
        "module: {} functions, {} globals",
        module.funcs.len(),
        module.globals
    );

    if cli.target == "vm" {
        let mut args = vec![cli.module.display().to_string()];
        args.extend(cli.args.iter().cloned());
        let config = VmConfig::from_env(args);
        let code = rtg_vm::run(&module, &config);
        std::process::exit(code);
    }

    let Some(target) = Target::parse(&cli.target) else {
        bail!("unknown target '{}'", cli.target);
    };

    let generated = match generate(&module, target, &cli.output) {
        Ok(generated) => generated,
        Err(CodeGenError::UnresolvedCalls(names)) => {
            for name in &names {
                eprintln!("unresolved call: {name}");
            }
            bail!("{} unresolved calls", names.len());
        }
        Err(error) => return Err(error.into()),
    };

    // a historical permission quirk: the mode is set again after the
    // write on macOS
    #[cfg(unix)]
    if target == Target::DarwinArm64 {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&cli.output, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("chmod {}", cli.output.display()))?;
    }

    if let Some(report_path) = &cli.size_analysis {
        let report = generated.size_analysis(target);
        let text = serde_json::to_string_pretty(&report)?;
        std::fs::write(report_path, text)
            .with_context(|| format!("write {}", report_path.display()))?;
    }

    Ok(())
}
