// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// i386 instruction encoder, the x86-64 set without rex prefixes and
// with a 4-byte word. shares the x86-64 condition-code values.

pub use crate::x64::Cond;

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Reg {
    Eax = 0,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
}

pub struct Emitter {
    pub buf: Vec<u8>,
}

impl Emitter {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    fn put(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.put(mode << 6 | reg << 3 | rm);
    }

    // [base + disp] operand; rm = 0b100 (ESP) needs the SIB byte
    fn mem_operand(&mut self, reg_field: u8, base: Reg, disp: i32) {
        let short = (-128..=127).contains(&disp);
        let mode = if short { 0b01 } else { 0b10 };
        self.modrm(mode, reg_field, base as u8);
        if base == Reg::Esp {
            self.put(0x24);
        }
        if short {
            self.put(disp as u8);
        } else {
            self.put_u32(disp as u32);
        }
    }

    /// mov reg, imm32 — fixed 5 bytes, B8+rd + imm32.
    /// returns the offset of the immediate field.
    pub fn mov_ri32(&mut self, dst: Reg, imm: u32) -> usize {
        self.put(0xb8 + dst as u8);
        let field = self.pos();
        self.put_u32(imm);
        field
    }

    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.put(0x89);
        self.modrm(0b11, src as u8, dst as u8);
    }

    fn alu_rr(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.put(opcode);
        self.modrm(0b11, src as u8, dst as u8);
    }

    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x01, dst, src);
    }

    pub fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x29, dst, src);
    }

    pub fn and_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x21, dst, src);
    }

    pub fn or_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x09, dst, src);
    }

    pub fn xor_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x31, dst, src);
    }

    pub fn cmp_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x39, dst, src);
    }

    pub fn test_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x85, dst, src);
    }

    pub fn imul_rr(&mut self, dst: Reg, src: Reg) {
        self.put(0x0f);
        self.put(0xaf);
        self.modrm(0b11, dst as u8, src as u8);
    }

    /// sign-extend eax into edx:eax before idiv
    pub fn cdq(&mut self) {
        self.put(0x99);
    }

    pub fn idiv(&mut self, reg: Reg) {
        self.put(0xf7);
        self.modrm(0b11, 7, reg as u8);
    }

    pub fn neg(&mut self, reg: Reg) {
        self.put(0xf7);
        self.modrm(0b11, 3, reg as u8);
    }

    pub fn not(&mut self, reg: Reg) {
        self.put(0xf7);
        self.modrm(0b11, 2, reg as u8);
    }

    pub fn shl_cl(&mut self, reg: Reg) {
        self.put(0xd3);
        self.modrm(0b11, 4, reg as u8);
    }

    pub fn sar_cl(&mut self, reg: Reg) {
        self.put(0xd3);
        self.modrm(0b11, 7, reg as u8);
    }

    pub fn shl_imm8(&mut self, reg: Reg, count: u8) {
        self.put(0xc1);
        self.modrm(0b11, 4, reg as u8);
        self.put(count);
    }

    fn alu_ri(&mut self, reg_field: u8, dst: Reg, imm: i32) {
        if (-128..=127).contains(&imm) {
            self.put(0x83);
            self.modrm(0b11, reg_field, dst as u8);
            self.put(imm as u8);
        } else {
            self.put(0x81);
            self.modrm(0b11, reg_field, dst as u8);
            self.put_u32(imm as u32);
        }
    }

    pub fn add_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(0, dst, imm);
    }

    pub fn sub_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(5, dst, imm);
    }

    pub fn cmp_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(7, dst, imm);
    }

    /// store reg into [base + disp]; width 1, 2 or 4.
    /// byte stores require al/cl/dl/bl, the encoder does not check.
    pub fn store_mem(&mut self, base: Reg, disp: i32, src: Reg, width: u8) {
        match width {
            1 => self.put(0x88),
            2 => {
                self.put(0x66);
                self.put(0x89);
            }
            _ => self.put(0x89),
        }
        self.mem_operand(src as u8, base, disp);
    }

    /// load [base + disp] into reg, zero-extending sub-word widths
    pub fn load_mem(&mut self, dst: Reg, base: Reg, disp: i32, width: u8) {
        match width {
            1 => {
                self.put(0x0f);
                self.put(0xb6);
            }
            2 => {
                self.put(0x0f);
                self.put(0xb7);
            }
            _ => self.put(0x8b),
        }
        self.mem_operand(dst as u8, base, disp);
    }

    pub fn lea(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.put(0x8d);
        self.mem_operand(dst as u8, base, disp);
    }

    /// zero-extend the low 'width' bytes of src into dst (width 1 or 2)
    pub fn movzx(&mut self, dst: Reg, src: Reg, width: u8) {
        self.put(0x0f);
        self.put(if width == 2 { 0xb7 } else { 0xb6 });
        self.modrm(0b11, dst as u8, src as u8);
    }

    pub fn push(&mut self, reg: Reg) {
        self.put(0x50 + reg as u8);
    }

    pub fn pop(&mut self, reg: Reg) {
        self.put(0x58 + reg as u8);
    }

    /// push imm32, returns the offset of the immediate field
    pub fn push_imm32(&mut self, imm: u32) -> usize {
        self.put(0x68);
        let field = self.pos();
        self.put_u32(imm);
        field
    }

    /// mov reg, [abs32] — disp32-only addressing, returns the offset
    /// of the address field
    pub fn load_abs(&mut self, dst: Reg) -> usize {
        self.put(0x8b);
        self.modrm(0b00, dst as u8, 0b101);
        let field = self.pos();
        self.put_u32(0);
        field
    }

    /// mov [abs32], reg — returns the offset of the address field
    pub fn store_abs(&mut self, src: Reg) -> usize {
        self.put(0x89);
        self.modrm(0b00, src as u8, 0b101);
        let field = self.pos();
        self.put_u32(0);
        field
    }

    pub fn jmp_rel32(&mut self) -> usize {
        self.put(0xe9);
        let field = self.pos();
        self.put_u32(0);
        field
    }

    pub fn jcc_rel32(&mut self, cond: Cond) -> usize {
        self.put(0x0f);
        self.put(0x80 + cond as u8);
        let field = self.pos();
        self.put_u32(0);
        field
    }

    pub fn call_rel32(&mut self) -> usize {
        self.put(0xe8);
        let field = self.pos();
        self.put_u32(0);
        field
    }

    /// call through an absolute memory slot (FF /2 with disp32-only
    /// addressing), the import-table call on windows.
    /// returns the offset of the 4-byte absolute-address field.
    pub fn call_mem_abs(&mut self) -> usize {
        self.put(0xff);
        self.modrm(0b00, 2, 0b101);
        let field = self.pos();
        self.put_u32(0);
        field
    }

    /// set dst to 0/1 from the condition flags; dst must be eax..ebx
    /// so its byte register is encodable
    pub fn set_cond(&mut self, cond: Cond, dst: Reg) {
        self.put(0x0f);
        self.put(0x90 + cond as u8);
        self.modrm(0b11, 0, dst as u8);
        self.movzx(dst, dst, 1);
    }

    pub fn ret(&mut self) {
        self.put(0xc3);
    }

    /// int 0x80, the linux 32-bit syscall gate
    pub fn int80(&mut self) {
        self.put(0xcd);
        self.put(0x80);
    }

    pub fn int3(&mut self) {
        self.put(0xcc);
    }
}

/// patch a rel32 branch/call field, identical arithmetic to x86-64
pub fn patch_rel32(buf: &mut [u8], field: usize, target: usize) {
    let next = field + 4;
    let disp = target as i64 - next as i64;
    crate::patch_u32(buf, field, disp as u32);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{patch_rel32, Cond, Emitter, Reg};

    #[test]
    fn test_mov_ri32() {
        let mut e = Emitter::new();
        let field = e.mov_ri32(Reg::Edi, 0x08048000);
        assert_eq!(field, 1);
        assert_eq!(e.buf, vec![0xbf, 0x00, 0x80, 0x04, 0x08]);
    }

    #[test]
    fn test_esp_base_inserts_sib() {
        let mut e = Emitter::new();
        e.load_mem(Reg::Eax, Reg::Esp, 4, 4);
        assert_eq!(e.buf, vec![0x8b, 0x44, 0x24, 0x04]);
    }

    #[test]
    fn test_ebp_frame_access() {
        let mut e = Emitter::new();
        e.store_mem(Reg::Ebp, -4, Reg::Eax, 4);
        assert_eq!(e.buf, vec![0x89, 0x45, 0xfc]);

        let mut e = Emitter::new();
        e.load_mem(Reg::Ecx, Reg::Ebp, -300, 4);
        assert_eq!(e.buf[..2], [0x8b, 0x8d]);
        assert_eq!(e.buf[2..6], (-300i32 as u32).to_le_bytes());
    }

    #[test]
    fn test_call_mem_abs() {
        let mut e = Emitter::new();
        let field = e.call_mem_abs();
        assert_eq!(field, 2);
        assert_eq!(e.buf, vec![0xff, 0x15, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_branch_patch() {
        let mut e = Emitter::new();
        let field = e.jcc_rel32(Cond::Lt);
        e.int3();
        let target = e.pos();
        patch_rel32(&mut e.buf, field, target);
        assert_eq!(e.buf, vec![0x0f, 0x8c, 0x01, 0x00, 0x00, 0x00, 0xcc]);
    }

    #[test]
    fn test_int80() {
        let mut e = Emitter::new();
        e.int80();
        assert_eq!(e.buf, vec![0xcd, 0x80]);
    }
}
