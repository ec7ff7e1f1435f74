// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// x86-64 instruction encoder.
//
// every emitter appends exactly the bytes its mnemonic documents and
// never touches earlier bytes, with one exception: 'load_mem' and
// 'store_mem' retroactively insert an SIB byte when the base register
// is RSP, because an rm field of 0b100 selects SIB addressing instead
// of the register.

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Reg {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    fn low3(self) -> u8 {
        self as u8 & 0x7
    }

    fn ext(self) -> bool {
        self as u8 >= 8
    }
}

/// condition codes, the values are the low nibble of the 0F 8x / 0F 9x opcodes
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Cond {
    Eq = 0x4,
    Ne = 0x5,
    Lt = 0xc,
    Ge = 0xd,
    Le = 0xe,
    Gt = 0xf,
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

    fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    // rex prefix, always emitted: w for 64-bit operand size, r extends
    // the modrm reg field, b extends the modrm rm (or opcode register)
    // field. a bare 0x40 still matters, it selects sil/dil/spl/bpl
    // instead of the legacy high-byte registers.
    fn rex(&mut self, w: bool, r: bool, b: bool) {
        self.put(0x40 | (w as u8) << 3 | (r as u8) << 2 | (b as u8));
    }

    // rex prefix only when one of the bits is set
    fn rex_needed(&mut self, w: bool, r: bool, b: bool) {
        let byte = 0x40 | (w as u8) << 3 | (r as u8) << 2 | (b as u8);
        if byte != 0x40 {
            self.put(byte);
        }
    }

    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.put(mode << 6 | reg << 3 | rm);
    }

    // a [base + disp] memory operand for the given /reg field,
    // disp8 when the displacement fits, disp32 otherwise.
    // rm = 0b100 (RSP/R12) selects SIB addressing, so an SIB byte with
    // index = none is inserted right after the modrm byte.
    fn mem_operand(&mut self, reg_field: u8, base: Reg, disp: i32) {
        let short = (-128..=127).contains(&disp);
        let mode = if short { 0b01 } else { 0b10 };
        self.modrm(mode, reg_field, base.low3());
        if base.low3() == 0b100 {
            self.put(0x24); // SIB: scale 0, no index, base = rm
        }
        if short {
            self.put(disp as u8);
        } else {
            self.put_u32(disp as u32);
        }
    }

    /// mov reg, imm64 — the fixed 10-byte form, REX.W + B8+rd + imm64.
    /// returns the offset of the immediate field so it can be patched.
    pub fn mov_ri64(&mut self, dst: Reg, imm: u64) -> usize {
        self.rex(true, false, dst.ext());
        self.put(0xb8 + dst.low3());
        let field = self.pos();
        self.put_u64(imm);
        field
    }

    /// load an immediate with the shortest usable encoding:
    /// mov r32, imm32 zero-extends, REX.W C7 sign-extends imm32.
    /// never use this at a patch site, the length varies.
    pub fn load_imm(&mut self, dst: Reg, imm: i64) {
        if imm as u64 <= u32::MAX as u64 {
            self.rex_needed(false, false, dst.ext());
            self.put(0xb8 + dst.low3());
            self.put_u32(imm as u32);
        } else if (i32::MIN as i64..=i32::MAX as i64).contains(&imm) {
            self.rex(true, false, dst.ext());
            self.put(0xc7);
            self.modrm(0b11, 0, dst.low3());
            self.put_u32(imm as u32);
        } else {
            self.mov_ri64(dst, imm as u64);
        }
    }

    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.ext(), dst.ext());
        self.put(0x89);
        self.modrm(0b11, src.low3(), dst.low3());
    }

    /// mov r32, r32 — zero-extends into the upper half
    pub fn mov_rr32(&mut self, dst: Reg, src: Reg) {
        self.rex_needed(false, src.ext(), dst.ext());
        self.put(0x89);
        self.modrm(0b11, src.low3(), dst.low3());
    }

    fn alu_rr(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.rex(true, src.ext(), dst.ext());
        self.put(opcode);
        self.modrm(0b11, src.low3(), dst.low3());
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
        self.rex(true, dst.ext(), src.ext());
        self.put(0x0f);
        self.put(0xaf);
        self.modrm(0b11, dst.low3(), src.low3());
    }

    /// sign-extend rax into rdx:rax before idiv
    pub fn cqo(&mut self) {
        self.put(0x48);
        self.put(0x99);
    }

    /// signed divide rdx:rax by reg, quotient in rax, remainder in rdx
    pub fn idiv(&mut self, reg: Reg) {
        self.rex(true, false, reg.ext());
        self.put(0xf7);
        self.modrm(0b11, 7, reg.low3());
    }

    pub fn neg(&mut self, reg: Reg) {
        self.rex(true, false, reg.ext());
        self.put(0xf7);
        self.modrm(0b11, 3, reg.low3());
    }

    pub fn not(&mut self, reg: Reg) {
        self.rex(true, false, reg.ext());
        self.put(0xf7);
        self.modrm(0b11, 2, reg.low3());
    }

    pub fn shl_cl(&mut self, reg: Reg) {
        self.rex(true, false, reg.ext());
        self.put(0xd3);
        self.modrm(0b11, 4, reg.low3());
    }

    pub fn sar_cl(&mut self, reg: Reg) {
        self.rex(true, false, reg.ext());
        self.put(0xd3);
        self.modrm(0b11, 7, reg.low3());
    }

    pub fn shl_imm8(&mut self, reg: Reg, count: u8) {
        self.rex(true, false, reg.ext());
        self.put(0xc1);
        self.modrm(0b11, 4, reg.low3());
        self.put(count);
    }

    fn alu_ri(&mut self, reg_field: u8, dst: Reg, imm: i32) {
        self.rex(true, false, dst.ext());
        if (-128..=127).contains(&imm) {
            self.put(0x83);
            self.modrm(0b11, reg_field, dst.low3());
            self.put(imm as u8);
        } else {
            self.put(0x81);
            self.modrm(0b11, reg_field, dst.low3());
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

    /// store reg into [base + disp]; width 1, 2, 4 or 8
    pub fn store_mem(&mut self, base: Reg, disp: i32, src: Reg, width: u8) {
        match width {
            1 => {
                if src as u8 >= 4 {
                    self.rex(false, src.ext(), base.ext());
                } else {
                    self.rex_needed(false, src.ext(), base.ext());
                }
                self.put(0x88);
            }
            2 => {
                self.put(0x66);
                self.rex_needed(false, src.ext(), base.ext());
                self.put(0x89);
            }
            4 => {
                self.rex_needed(false, src.ext(), base.ext());
                self.put(0x89);
            }
            _ => {
                self.rex(true, src.ext(), base.ext());
                self.put(0x89);
            }
        }
        self.mem_operand(src.low3(), base, disp);
    }

    /// load [base + disp] into reg, zero-extending sub-word widths
    pub fn load_mem(&mut self, dst: Reg, base: Reg, disp: i32, width: u8) {
        match width {
            1 => {
                self.rex(true, dst.ext(), base.ext());
                self.put(0x0f);
                self.put(0xb6);
            }
            2 => {
                self.rex(true, dst.ext(), base.ext());
                self.put(0x0f);
                self.put(0xb7);
            }
            4 => {
                self.rex_needed(false, dst.ext(), base.ext());
                self.put(0x8b);
            }
            _ => {
                self.rex(true, dst.ext(), base.ext());
                self.put(0x8b);
            }
        }
        self.mem_operand(dst.low3(), base, disp);
    }

    pub fn lea(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.ext(), base.ext());
        self.put(0x8d);
        self.mem_operand(dst.low3(), base, disp);
    }

    /// load [src] sign-extended from 32 to 64 bits
    pub fn movsxd(&mut self, dst: Reg, src: Reg) {
        self.rex(true, dst.ext(), src.ext());
        self.put(0x63);
        self.modrm(0b11, dst.low3(), src.low3());
    }

    /// zero-extend the low 'width' bytes of src into dst (width 1 or 2)
    pub fn movzx(&mut self, dst: Reg, src: Reg, width: u8) {
        self.rex(true, dst.ext(), src.ext());
        self.put(0x0f);
        self.put(if width == 2 { 0xb7 } else { 0xb6 });
        self.modrm(0b11, dst.low3(), src.low3());
    }

    pub fn push(&mut self, reg: Reg) {
        if reg.ext() {
            self.put(0x41);
        }
        self.put(0x50 + reg.low3());
    }

    pub fn pop(&mut self, reg: Reg) {
        if reg.ext() {
            self.put(0x41);
        }
        self.put(0x58 + reg.low3());
    }

    /// jmp rel32, returns the offset of the 4-byte displacement field
    pub fn jmp_rel32(&mut self) -> usize {
        self.put(0xe9);
        let field = self.pos();
        self.put_u32(0);
        field
    }

    /// jcc rel32, returns the offset of the 4-byte displacement field
    pub fn jcc_rel32(&mut self, cond: Cond) -> usize {
        self.put(0x0f);
        self.put(0x80 + cond as u8);
        let field = self.pos();
        self.put_u32(0);
        field
    }

    /// call rel32, returns the offset of the 4-byte displacement field
    pub fn call_rel32(&mut self) -> usize {
        self.put(0xe8);
        let field = self.pos();
        self.put_u32(0);
        field
    }

    /// set dst to 0/1 from the condition flags (setcc + movzx)
    pub fn set_cond(&mut self, cond: Cond, dst: Reg) {
        // setcc accesses the byte register, dil/sil/r8b..r15b need a rex
        if dst as u8 >= 4 {
            self.rex(false, false, dst.ext());
        }
        self.put(0x0f);
        self.put(0x90 + cond as u8);
        self.modrm(0b11, 0, dst.low3());
        self.movzx(dst, dst, 1);
    }

    pub fn ret(&mut self) {
        self.put(0xc3);
    }

    pub fn syscall(&mut self) {
        self.put(0x0f);
        self.put(0x05);
    }

    pub fn int3(&mut self) {
        self.put(0xcc);
    }
}

/// patch a rel32 branch/call field: 'field' is the offset of the 4-byte
/// displacement, 'target' the code offset the transfer should reach
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
    fn test_mov_ri64_is_ten_bytes() {
        let mut e = Emitter::new();
        let field = e.mov_ri64(Reg::Rax, 0x1122334455667788);
        assert_eq!(field, 2);
        assert_eq!(
            e.buf,
            vec![0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );

        let mut e = Emitter::new();
        e.mov_ri64(Reg::R15, 0);
        assert_eq!(e.buf[0], 0x49);
        assert_eq!(e.buf[1], 0xbf);
        assert_eq!(e.buf.len(), 10);
    }

    #[test]
    fn test_alu_rr_rex() {
        let mut e = Emitter::new();
        e.add_rr(Reg::Rax, Reg::Rcx);
        assert_eq!(e.buf, vec![0x48, 0x01, 0xc8]);

        let mut e = Emitter::new();
        e.sub_rr(Reg::R15, Reg::Rax);
        // rex.wb, sub r/m64, r64
        assert_eq!(e.buf, vec![0x49, 0x29, 0xc7]);

        let mut e = Emitter::new();
        e.cmp_rr(Reg::Rax, Reg::R9);
        assert_eq!(e.buf, vec![0x4c, 0x39, 0xc8]);
    }

    #[test]
    fn test_mem_operand_disp_selection() {
        let mut e = Emitter::new();
        e.store_mem(Reg::Rbp, -8, Reg::Rax, 8);
        assert_eq!(e.buf, vec![0x48, 0x89, 0x45, 0xf8]);

        let mut e = Emitter::new();
        e.store_mem(Reg::Rbp, -4096, Reg::Rax, 8);
        assert_eq!(e.buf[..3], [0x48, 0x89, 0x85]);
        assert_eq!(e.buf[3..7], (-4096i32 as u32).to_le_bytes());
    }

    #[test]
    fn test_rsp_base_inserts_sib() {
        let mut e = Emitter::new();
        e.load_mem(Reg::Rax, Reg::Rsp, 8, 8);
        // modrm rm=100 requires the 0x24 sib byte, index = none
        assert_eq!(e.buf, vec![0x48, 0x8b, 0x44, 0x24, 0x08]);

        let mut e = Emitter::new();
        e.store_mem(Reg::Rsp, 0, Reg::Rcx, 8);
        assert_eq!(e.buf, vec![0x48, 0x89, 0x4c, 0x24, 0x00]);
    }

    #[test]
    fn test_push_pop_extended() {
        let mut e = Emitter::new();
        e.push(Reg::Rax);
        e.push(Reg::R15);
        e.pop(Reg::R8);
        e.pop(Reg::Rbp);
        assert_eq!(e.buf, vec![0x50, 0x41, 0x57, 0x41, 0x58, 0x5d]);
    }

    #[test]
    fn test_branch_patching() {
        let mut e = Emitter::new();
        let field = e.jmp_rel32();
        e.int3();
        let target = e.pos();
        e.ret();
        patch_rel32(&mut e.buf, field, target);
        // jmp skips the single int3 byte
        assert_eq!(e.buf, vec![0xe9, 0x01, 0x00, 0x00, 0x00, 0xcc, 0xc3]);
    }

    #[test]
    fn test_backward_branch_is_negative() {
        let mut e = Emitter::new();
        let target = e.pos();
        e.ret();
        let field = e.jcc_rel32(Cond::Ne);
        patch_rel32(&mut e.buf, field, target);
        let disp = i32::from_le_bytes(e.buf[field..field + 4].try_into().unwrap());
        assert_eq!(disp, -(7i32));
    }

    #[test]
    fn test_set_cond() {
        let mut e = Emitter::new();
        e.set_cond(Cond::Eq, Reg::Rax);
        // sete al; movzx rax, al
        assert_eq!(e.buf, vec![0x0f, 0x94, 0xc0, 0x48, 0x0f, 0xb6, 0xc0]);
    }

    #[test]
    fn test_load_imm_shortest_form() {
        let mut e = Emitter::new();
        e.load_imm(Reg::Rax, 1);
        assert_eq!(e.buf, vec![0xb8, 0x01, 0x00, 0x00, 0x00]);

        let mut e = Emitter::new();
        e.load_imm(Reg::Rax, -1);
        assert_eq!(e.buf, vec![0x48, 0xc7, 0xc0, 0xff, 0xff, 0xff, 0xff]);

        let mut e = Emitter::new();
        e.load_imm(Reg::Rax, 0x1_0000_0000);
        assert_eq!(e.buf.len(), 10);
    }
}
