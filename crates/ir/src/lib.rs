// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// the intermediate representation consumed by the backend.
//
// a module is an ordered list of functions plus the module-level tables:
//
// - globals: a count of word-sized slots, addressed by index
// - methods: the method table, mapping a qualified method name
//   (e.g. "File.Close") to the name of the implementing function
// - type_ids: the map from a concrete type name to its small integer id
//
// type ids 1 and 2 are reserved for 'int' and 'string', user-defined
// concrete types are assigned ids starting at 256. the gap is what makes
// the "first word >= 256 means string header" heuristic work, see the
// 'iface' handling in the code generators.

pub mod literal;
pub mod opcode;

use serde::{Deserialize, Serialize};

use opcode::Opcode;

/// type id of the builtin 'int' type inside an interface box
pub const TYPE_ID_INT: i64 = 1;
/// type id of the builtin 'string' type inside an interface box
pub const TYPE_ID_STRING: i64 = 2;
/// the first id assigned to a user-defined concrete type
pub const FIRST_USER_TYPE_ID: i64 = 256;

/// the name prefix of the synthetic struct-literal constructors,
/// the suffix is the field count, e.g. "builtin.composite.3"
pub const COMPOSITE_PREFIX: &str = "builtin.composite.";

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct IRModule {
    pub funcs: Vec<IRFunc>,

    // the number of word-sized global slots
    pub globals: usize,

    // (qualified method name, implementing function name)
    pub methods: Vec<(String, String)>,

    // (concrete type name, type id)
    pub type_ids: Vec<(String, i64)>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct IRFunc {
    pub name: String,
    pub params: usize,
    pub locals: Vec<LocalVar>,
    pub insts: Vec<Inst>,
}

/// a local variable slot, width 0 means the target's natural word
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct LocalVar {
    pub width: u8,
}

/// one IR instruction.
///
/// which of the auxiliary fields is meaningful depends on the opcode:
///
/// - arg: local/global index, label id, argument count, immediate offset
/// - width: byte width of a sub-word load/store/local, 0 = natural word
/// - value: the 64-bit literal of const_i64/const_bool, the type id of
///   iface_box, the element size of index_addr
/// - name: callee name, string literal text, conversion target type name
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Inst {
    pub opcode: Opcode,
    pub arg: i64,
    pub width: u8,
    pub value: i64,
    pub name: Option<String>,
}

impl Inst {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            arg: 0,
            width: 0,
            value: 0,
            name: None,
        }
    }

    pub fn with_arg(opcode: Opcode, arg: i64) -> Self {
        Self {
            arg,
            ..Inst::new(opcode)
        }
    }

    pub fn with_value(opcode: Opcode, value: i64) -> Self {
        Self {
            value,
            ..Inst::new(opcode)
        }
    }

    pub fn with_width(opcode: Opcode, width: u8) -> Self {
        Self {
            width,
            ..Inst::new(opcode)
        }
    }

    pub fn with_name(opcode: Opcode, name: &str) -> Self {
        Self {
            name: Some(name.to_owned()),
            ..Inst::new(opcode)
        }
    }

    pub fn call(name: &str) -> Self {
        Inst::with_name(Opcode::call, name)
    }

    pub fn intrinsic(name: &str) -> Self {
        Inst::with_name(Opcode::call_intrinsic, name)
    }
}

impl IRModule {
    /// the field count of a "builtin.composite.<n>" constructor name,
    /// or None when the name is a regular function
    pub fn composite_field_count(name: &str) -> Option<usize> {
        name.strip_prefix(COMPOSITE_PREFIX)
            .and_then(|suffix| suffix.parse::<usize>().ok())
    }

    /// look up the type id of a concrete type name
    pub fn type_id(&self, type_name: &str) -> Option<i64> {
        self.type_ids
            .iter()
            .find(|(name, _)| name == type_name)
            .map(|(_, id)| *id)
    }

    /// enumerate the (type id, implementing function) pairs of all
    /// implementations of the given bare method name, in table order.
    ///
    /// the qualified method names in the table are "<type>.<method>",
    /// the dispatch chains emitted for 'iface_call' and 'Tostring'
    /// compare against these pairs one by one.
    pub fn method_impls(&self, bare_method: &str) -> Vec<(i64, String)> {
        let mut impls: Vec<(i64, String)> = Vec::new();
        for (qualified, func_name) in &self.methods {
            let Some((type_name, method)) = qualified.rsplit_once('.') else {
                continue;
            };
            if method != bare_method {
                continue;
            }
            if let Some(type_id) = self.type_id(type_name) {
                impls.push((type_id, func_name.clone()));
            }
        }
        impls
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{opcode::Opcode, IRModule, Inst};

    fn module_with_tables() -> IRModule {
        IRModule {
            funcs: vec![],
            globals: 0,
            methods: vec![
                ("File.Close".to_owned(), "os.fileClose".to_owned()),
                ("Pipe.Close".to_owned(), "os.pipeClose".to_owned()),
                ("File.Read".to_owned(), "os.fileRead".to_owned()),
            ],
            type_ids: vec![
                ("File".to_owned(), 256),
                ("Pipe".to_owned(), 257),
            ],
        }
    }

    #[test]
    fn test_composite_field_count() {
        assert_eq!(IRModule::composite_field_count("builtin.composite.3"), Some(3));
        assert_eq!(IRModule::composite_field_count("builtin.composite.0"), Some(0));
        assert_eq!(IRModule::composite_field_count("main.main"), None);
        assert_eq!(IRModule::composite_field_count("builtin.composite.x"), None);
    }

    #[test]
    fn test_method_impls() {
        let module = module_with_tables();
        assert_eq!(
            module.method_impls("Close"),
            vec![
                (256, "os.fileClose".to_owned()),
                (257, "os.pipeClose".to_owned()),
            ]
        );
        assert_eq!(
            module.method_impls("Read"),
            vec![(256, "os.fileRead".to_owned())]
        );
        assert_eq!(module.method_impls("Write"), vec![]);
    }

    #[test]
    fn test_module_json_roundtrip() {
        let mut module = module_with_tables();
        module.funcs.push(crate::IRFunc {
            name: "main.main".to_owned(),
            params: 0,
            locals: vec![crate::LocalVar { width: 1 }],
            insts: vec![
                Inst::with_value(Opcode::const_i64, 42),
                Inst::intrinsic("SysExit"),
            ],
        });
        let text = serde_json::to_string(&module).unwrap();
        let back: IRModule = serde_json::from_str(&text).unwrap();
        assert_eq!(module, back);
    }

    #[test]
    fn test_inst_builders() {
        let inst = Inst::with_value(Opcode::const_i64, 42);
        assert_eq!(inst.value, 42);
        assert_eq!(inst.arg, 0);
        assert_eq!(inst.name, None);

        let inst = Inst::call("main.main");
        assert_eq!(inst.opcode, Opcode::call);
        assert_eq!(inst.name.as_deref(), Some("main.main"));
    }
}
