// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// the IR instruction set.
//
// the IR is a stack machine: every operand flows through the operand
// stack, there are no virtual registers. instructions that need more
// information carry it in the auxiliary fields of 'Inst' (arg, width,
// value, name), the opcode itself is a bare tag.
//
// a note on widths: 'load', 'store' and the local slots may carry a
// byte width (1, 2, 4) for sub-word accesses. width 0 always means
// "the natural word of the target", which is 8 on 64-bit targets and
// 4 on i386/wasm32.

use serde::{Deserialize, Serialize};

#[repr(u16)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum Opcode {
    //
    // constants
    //

    const_i64 = 0x100,  // push the 64-bit literal in 'value'
    const_bool,         // push 0 or 1 from 'value'
    const_nil,          // push 0
    const_str,          // intern the literal in 'name', push the header address

    //
    // local variables
    //

    local_get = 0x200,  // (param: local_variable_index) push the slot
    local_set,          // (param: local_variable_index) pop into the slot
    local_addr,         // (param: local_variable_index) push the slot address

    //
    // globals
    //

    global_get = 0x300, // (param: global_index) push data[index * word]
    global_set,         // (param: global_index) pop into data[index * word]
    global_addr,        // (param: global_index) push the slot address

    //
    // operand stack
    //

    drop = 0x400,       // discard the top operand
    dup,                // duplicate the top operand

    //
    // arithmetic, all signed
    //

    add = 0x500,
    sub,
    mul,
    div,                // division by zero: 0 on the VM, hardware trap natively
    mod_,               // remainder, same zero behaviour as div
    neg,

    //
    // bitwise
    //

    and = 0x600,
    or,
    xor,
    shl,
    shr,                // arithmetic (sign-propagating) right shift
    not,

    //
    // comparison, push 0 or 1
    //

    eq = 0x700,
    neq,
    lt,
    gt,
    leq,
    geq,

    //
    // control flow, within a single function
    //

    label = 0x800,      // (param: label_id) branch target
    jmp,                // (param: label_id)
    jmp_if,             // (param: label_id) pop, branch when non-zero
    jmp_if_not,         // (param: label_id) pop, branch when zero

    //
    // calls
    //

    call = 0x900,       // (param: name) arguments and results on the operand stack
    call_intrinsic,     // (param: name) see the intrinsic table in the code generators
    return_,

    //
    // memory
    //

    load = 0xa00,       // (param: width) pop address, push value; nil-safe: 0 from address 0
    store,              // (param: width) pop value, pop address, write
    offset,             // (param: byte_offset) pop address, push address + offset
    index_addr,         // (param: element_size) pop index, pop slice header, push element address
    len,                // pop header address, push the length word; nil-safe

    //
    // type conversion
    //

    convert = 0xb00,    // (param: target type name)

    //
    // interfaces
    //

    iface_box = 0xc00,  // (param: type_id) pop value, allocate {type_id, value}, push address
    iface_call,         // (param: name, argc) dynamic dispatch through the method table

    //
    // abort
    //

    panic = 0xd00,      // pop a string header or interface box, print it, exit 2
}
