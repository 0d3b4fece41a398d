use crate::{AssemblerBuffer, Label, PatchToken};
use std::convert::TryInto;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Register(u8);

impl Register {
    pub fn new(value: u8) -> Register {
        assert!(value < 16);
        Register(value)
    }

    fn low_bits(self) -> u8 {
        self.0 & 0b111
    }

    fn value(self) -> u8 {
        self.0
    }

    fn needs_rex(self) -> bool {
        self.0 > 7
    }
}

pub const RAX: Register = Register(0);
pub const RCX: Register = Register(1);
pub const RDX: Register = Register(2);
pub const RBX: Register = Register(3);
pub const RSP: Register = Register(4);
pub const RBP: Register = Register(5);
pub const RSI: Register = Register(6);
pub const RDI: Register = Register(7);

pub const R8: Register = Register(8);
pub const R9: Register = Register(9);
pub const R10: Register = Register(10);
pub const R11: Register = Register(11);
pub const R12: Register = Register(12);
pub const R13: Register = Register(13);
pub const R14: Register = Register(14);
pub const R15: Register = Register(15);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct XmmRegister(u8);

impl XmmRegister {
    pub fn new(value: u8) -> XmmRegister {
        assert!(value < 16);
        XmmRegister(value)
    }

    pub fn low_bits(self) -> u8 {
        self.0 & 0b111
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn needs_rex(self) -> bool {
        self.0 > 7
    }
}

pub const XMM0: XmmRegister = XmmRegister(0);
pub const XMM1: XmmRegister = XmmRegister(1);
pub const XMM2: XmmRegister = XmmRegister(2);
pub const XMM3: XmmRegister = XmmRegister(3);
pub const XMM4: XmmRegister = XmmRegister(4);
pub const XMM5: XmmRegister = XmmRegister(5);
pub const XMM6: XmmRegister = XmmRegister(6);
pub const XMM7: XmmRegister = XmmRegister(7);

pub const XMM8: XmmRegister = XmmRegister(8);
pub const XMM9: XmmRegister = XmmRegister(9);
pub const XMM10: XmmRegister = XmmRegister(10);
pub const XMM11: XmmRegister = XmmRegister(11);
pub const XMM12: XmmRegister = XmmRegister(12);
pub const XMM13: XmmRegister = XmmRegister(13);
pub const XMM14: XmmRegister = XmmRegister(14);
pub const XMM15: XmmRegister = XmmRegister(15);

#[derive(Copy, Clone)]
pub enum Condition {
    Overflow,
    NoOverflow,
    Below,
    AboveOrEqual,
    Equal,
    Zero,
    NotEqual,
    NotZero,
    BelowOrEqual,
    Above,
    Sign,
    NoSign,
    Parity,
    NoParity,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    Greater,
}

impl Condition {
    pub fn int(self) -> u8 {
        match self {
            Condition::Overflow => 0b0000,
            Condition::NoOverflow => 0b0001,
            Condition::Below => 0b0010,
            Condition::AboveOrEqual => 0b0011,
            Condition::Equal | Condition::Zero => 0b0100,
            Condition::NotEqual | Condition::NotZero => 0b0101,
            Condition::BelowOrEqual => 0b0110,
            Condition::Above => 0b0111,
            Condition::Sign => 0b1000,
            Condition::NoSign => 0b1001,
            Condition::Parity => 0b1010,
            Condition::NoParity => 0b1011,
            Condition::Less => 0b1100,
            Condition::GreaterOrEqual => 0b1101,
            Condition::LessOrEqual => 0b1110,
            Condition::Greater => 0b1111,
        }
    }

    pub fn negate(self) -> Condition {
        match self {
            Condition::Overflow => Condition::NoOverflow,
            Condition::NoOverflow => Condition::Overflow,
            Condition::Below => Condition::AboveOrEqual,
            Condition::AboveOrEqual => Condition::Below,
            Condition::Equal => Condition::NotEqual,
            Condition::Zero => Condition::NotZero,
            Condition::NotEqual => Condition::Equal,
            Condition::NotZero => Condition::Zero,
            Condition::BelowOrEqual => Condition::Above,
            Condition::Above => Condition::BelowOrEqual,
            Condition::Sign => Condition::NoSign,
            Condition::NoSign => Condition::Sign,
            Condition::Parity => Condition::NoParity,
            Condition::NoParity => Condition::Parity,
            Condition::Less => Condition::GreaterOrEqual,
            Condition::GreaterOrEqual => Condition::Less,
            Condition::LessOrEqual => Condition::Greater,
            Condition::Greater => Condition::LessOrEqual,
        }
    }
}

pub struct Immediate(pub i64);

impl Immediate {
    pub fn is_int8(&self) -> bool {
        let limit = 1i64 << 7;
        -limit <= self.0 && self.0 < limit
    }

    pub fn is_int32(&self) -> bool {
        let limit = 1i64 << 31;
        -limit <= self.0 && self.0 < limit
    }

    pub fn is_uint8(&self) -> bool {
        0 <= self.0 && self.0 < 256
    }

    pub fn is_uint32(&self) -> bool {
        let limit = 1i64 << 32;
        0 <= self.0 && self.0 < limit
    }

    pub fn uint8(&self) -> u8 {
        self.0 as u8
    }

    pub fn int8(&self) -> i8 {
        self.0 as i8
    }

    pub fn int32(&self) -> i32 {
        self.0 as i32
    }

    pub fn uint32(&self) -> u32 {
        self.0 as u32
    }

    pub fn int64(&self) -> i64 {
        self.0
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub enum ScaleFactor {
    One,
    Two,
    Four,
    Eight,
}

impl ScaleFactor {
    pub fn from_size(size: i32) -> ScaleFactor {
        match size {
            1 => ScaleFactor::One,
            2 => ScaleFactor::Two,
            4 => ScaleFactor::Four,
            8 => ScaleFactor::Eight,
            _ => panic!("unsupported scale {}", size),
        }
    }

    fn value(self) -> u8 {
        match self {
            ScaleFactor::One => 0,
            ScaleFactor::Two => 1,
            ScaleFactor::Four => 2,
            ScaleFactor::Eight => 3,
        }
    }
}

/// Memory operand, kept in component form and encoded when the
/// instruction referencing it is emitted.
#[derive(Copy, Clone)]
pub struct Address {
    base: Option<Register>,
    index: Option<(Register, ScaleFactor)>,
    disp: i32,
    rip: bool,
}

impl Address {
    pub fn reg(base: Register) -> Address {
        Address::offset(base, 0)
    }

    pub fn offset(base: Register, disp: i32) -> Address {
        Address {
            base: Some(base),
            index: None,
            disp,
            rip: false,
        }
    }

    pub fn array(base: Register, index: Register, scale: ScaleFactor, disp: i32) -> Address {
        assert_ne!(index, RSP);

        Address {
            base: Some(base),
            index: Some((index, scale)),
            disp,
            rip: false,
        }
    }

    pub fn index(index: Register, scale: ScaleFactor, disp: i32) -> Address {
        assert_ne!(index, RSP);

        Address {
            base: None,
            index: Some((index, scale)),
            disp,
            rip: false,
        }
    }

    pub fn rip(disp: i32) -> Address {
        Address {
            base: None,
            index: None,
            disp,
            rip: true,
        }
    }

    fn rex_x(&self) -> bool {
        match self.index {
            Some((reg, _)) => reg.needs_rex(),
            None => false,
        }
    }

    fn rex_b(&self) -> bool {
        match self.base {
            Some(reg) => reg.needs_rex(),
            None => false,
        }
    }

    fn has_rex(&self) -> bool {
        self.rex_x() || self.rex_b()
    }
}

struct ForwardJump {
    offset: u32,
    label: Label,
    distance: JumpDistance,
}

pub enum JumpDistance {
    Near,
    Far,
}

pub struct AssemblerX64 {
    unresolved_jumps: Vec<ForwardJump>,
    buffer: AssemblerBuffer,
}

/// Code bytes plus resolved label offsets, produced by `finalize`.
pub struct FinalizedCode {
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
}

impl FinalizedCode {
    pub fn code(self) -> Vec<u8> {
        self.code
    }

    pub fn offset(&self, lbl: Label) -> Option<u32> {
        let idx = lbl.index();
        self.labels[idx]
    }
}

impl Label {
    fn index(self) -> usize {
        let Label(idx) = self;
        idx
    }
}

impl AssemblerX64 {
    pub fn new() -> AssemblerX64 {
        AssemblerX64 {
            unresolved_jumps: Vec::new(),
            buffer: AssemblerBuffer::new(),
        }
    }

    pub fn create_label(&mut self) -> Label {
        self.buffer.create_label()
    }

    pub fn create_and_bind_label(&mut self) -> Label {
        self.buffer.create_and_bind_label()
    }

    pub fn bind_label(&mut self, lbl: Label) {
        self.buffer.bind_label(lbl);
    }

    pub fn offset(&self, lbl: Label) -> Option<u32> {
        self.buffer.offset(lbl)
    }

    pub fn finalize(mut self, alignment: usize) -> FinalizedCode {
        self.resolve_jumps();
        self.buffer.set_position_end();
        self.buffer.align_to(alignment);

        let AssemblerBuffer { code, labels, .. } = self.buffer;
        FinalizedCode { code, labels }
    }

    pub fn position(&self) -> usize {
        self.buffer.position()
    }

    pub fn set_position(&mut self, pos: usize) {
        self.buffer.set_position(pos);
    }

    pub fn set_position_end(&mut self) {
        self.buffer.set_position_end();
    }

    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.emit_u8(value);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.emit_u32(value);
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.buffer.emit_u64(value);
    }

    pub fn get_u32(&self, offset: usize) -> u32 {
        self.buffer.get_u32(offset)
    }

    pub fn emit_placeholder_u32(&mut self) -> PatchToken {
        self.buffer.emit_placeholder_u32()
    }

    pub fn patch_u32(&mut self, token: PatchToken, value: u32) {
        self.buffer.patch_u32(token, value);
    }

    pub fn align_to(&mut self, alignment: usize) {
        self.buffer.align_to(alignment);
    }

    fn resolve_jumps(&mut self) {
        let unresolved_jumps = std::mem::replace(&mut self.unresolved_jumps, Vec::new());

        let old_position = self.position();

        for jump in unresolved_jumps {
            let lbl_offset = self.offset(jump.label).expect("unbound label");
            self.set_position(jump.offset as usize);

            match jump.distance {
                JumpDistance::Near => {
                    let distance: i32 = lbl_offset as i32 - (jump.offset as i32 + 1);
                    assert!(-128 <= distance && distance < 128);
                    self.emit_u8(distance as u8);
                }

                JumpDistance::Far => {
                    let distance: i32 = lbl_offset as i32 - (jump.offset as i32 + 4);
                    self.emit_u32(distance as u32);
                }
            }
        }

        self.set_position(old_position);
    }
}

impl AssemblerX64 {
    pub fn pushq_r(&mut self, reg: Register) {
        self.emit_rex32_rm_optional(reg);
        self.emit_u8(0x50 + reg.low_bits());
    }

    pub fn popq_r(&mut self, reg: Register) {
        self.emit_rex32_rm_optional(reg);
        self.emit_u8(0x58 + reg.low_bits());
    }

    pub fn retq(&mut self) {
        self.emit_u8(0xC3);
    }

    pub fn nop(&mut self) {
        self.emit_u8(0x90);
    }

    pub fn int3(&mut self) {
        self.emit_u8(0xCC);
    }

    pub fn cdq(&mut self) {
        self.emit_u8(0x99);
    }

    pub fn cqo(&mut self) {
        self.emit_rex64();
        self.emit_u8(0x99);
    }

    pub fn movq_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex64_modrm(src, dest);
        self.emit_u8(0x89);
        self.emit_modrm_registers(src, dest);
    }

    pub fn movl_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex32_optional(src, dest);
        self.emit_u8(0x89);
        self.emit_modrm_registers(src, dest);
    }

    pub fn movq_ri(&mut self, dest: Register, imm: Immediate) {
        if imm.is_int32() {
            self.emit_rex64_rm(dest);
            self.emit_u8(0xC7);
            self.emit_modrm_opcode(0, dest);
            self.emit_u32(imm.int32() as u32);
        } else {
            self.emit_rex64_rm(dest);
            self.emit_u8(0xB8 + dest.low_bits());
            self.emit_u64(imm.int64() as u64);
        }
    }

    /// Always emits the 10-byte form with a full 64-bit immediate, for
    /// sites whose immediate is patched later.
    pub fn movq_ri64(&mut self, dest: Register, imm: Immediate) {
        self.emit_rex64_rm(dest);
        self.emit_u8(0xB8 + dest.low_bits());
        self.emit_u64(imm.int64() as u64);
    }

    pub fn movl_ri(&mut self, dest: Register, imm: Immediate) {
        assert!(imm.is_int32() || imm.is_uint32());
        self.emit_rex32_rm_optional(dest);
        self.emit_u8(0xB8 + dest.low_bits());
        self.emit_u32(imm.uint32());
    }

    pub fn movq_ra(&mut self, dest: Register, src: Address) {
        self.emit_rex64_modrm_address(dest, src);
        self.emit_u8(0x8B);
        self.emit_address(dest.low_bits(), src);
    }

    pub fn movq_ar(&mut self, dest: Address, src: Register) {
        self.emit_rex64_modrm_address(src, dest);
        self.emit_u8(0x89);
        self.emit_address(src.low_bits(), dest);
    }

    pub fn movq_ai(&mut self, dest: Address, imm: Immediate) {
        assert!(imm.is_int32());
        self.emit_rex64_address(dest);
        self.emit_u8(0xC7);
        self.emit_address(0b000, dest);
        self.emit_u32(imm.int32() as u32);
    }

    pub fn movl_ra(&mut self, dest: Register, src: Address) {
        self.emit_rex32_modrm_address(dest, src);
        self.emit_u8(0x8B);
        self.emit_address(dest.low_bits(), src);
    }

    pub fn movl_ar(&mut self, dest: Address, src: Register) {
        self.emit_rex32_modrm_address(src, dest);
        self.emit_u8(0x89);
        self.emit_address(src.low_bits(), dest);
    }

    pub fn movl_ai(&mut self, dest: Address, imm: Immediate) {
        assert!(imm.is_int32() || imm.is_uint32());
        self.emit_rex32_address_optional(dest);
        self.emit_u8(0xC7);
        self.emit_address(0b000, dest);
        self.emit_u32(imm.uint32());
    }

    pub fn movw_ar(&mut self, dest: Address, src: Register) {
        self.emit_u8(0x66);
        self.emit_rex32_modrm_address(src, dest);
        self.emit_u8(0x89);
        self.emit_address(src.low_bits(), dest);
    }

    pub fn movb_ar(&mut self, dest: Address, src: Register) {
        self.emit_rex32_byte_address(src, dest);
        self.emit_u8(0x88);
        self.emit_address(src.low_bits(), dest);
    }

    pub fn movb_ai(&mut self, dest: Address, imm: Immediate) {
        assert!(imm.is_int8() || imm.is_uint8());
        self.emit_rex32_address_optional(dest);
        self.emit_u8(0xC6);
        self.emit_address(0b000, dest);
        self.emit_u8(imm.uint8());
    }

    pub fn movzxb_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex32_byte_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0xB6);
        self.emit_modrm_registers(dest, src);
    }

    pub fn movzxb_ra(&mut self, dest: Register, src: Address) {
        self.emit_rex32_modrm_address(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0xB6);
        self.emit_address(dest.low_bits(), src);
    }

    pub fn movsxbl_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex32_byte_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0xBE);
        self.emit_modrm_registers(dest, src);
    }

    pub fn movsxbl_ra(&mut self, dest: Register, src: Address) {
        self.emit_rex32_modrm_address(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0xBE);
        self.emit_address(dest.low_bits(), src);
    }

    pub fn movzxw_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex32_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0xB7);
        self.emit_modrm_registers(dest, src);
    }

    pub fn movzxw_ra(&mut self, dest: Register, src: Address) {
        self.emit_rex32_modrm_address(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0xB7);
        self.emit_address(dest.low_bits(), src);
    }

    pub fn movsxwl_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex32_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0xBF);
        self.emit_modrm_registers(dest, src);
    }

    pub fn movsxwl_ra(&mut self, dest: Register, src: Address) {
        self.emit_rex32_modrm_address(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0xBF);
        self.emit_address(dest.low_bits(), src);
    }

    pub fn movsxlq_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex64_modrm(dest, src);
        self.emit_u8(0x63);
        self.emit_modrm_registers(dest, src);
    }

    pub fn lea(&mut self, dest: Register, src: Address) {
        self.emit_rex64_modrm_address(dest, src);
        self.emit_u8(0x8D);
        self.emit_address(dest.low_bits(), src);
    }

    pub fn addq_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex64_modrm(src, dest);
        self.emit_u8(0x01);
        self.emit_modrm_registers(src, dest);
    }

    pub fn addl_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex32_optional(src, dest);
        self.emit_u8(0x01);
        self.emit_modrm_registers(src, dest);
    }

    pub fn addq_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu64_imm(dest, imm, 0b000, 0x05);
    }

    pub fn addl_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu32_imm(dest, imm, 0b000, 0x05);
    }

    pub fn subq_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex64_modrm(src, dest);
        self.emit_u8(0x29);
        self.emit_modrm_registers(src, dest);
    }

    pub fn subl_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex32_optional(src, dest);
        self.emit_u8(0x29);
        self.emit_modrm_registers(src, dest);
    }

    pub fn subq_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu64_imm(dest, imm, 0b101, 0x2D);
    }

    pub fn subl_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu32_imm(dest, imm, 0b101, 0x2D);
    }

    pub fn andq_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex64_modrm(src, dest);
        self.emit_u8(0x21);
        self.emit_modrm_registers(src, dest);
    }

    pub fn andl_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex32_optional(src, dest);
        self.emit_u8(0x21);
        self.emit_modrm_registers(src, dest);
    }

    pub fn andq_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu64_imm(dest, imm, 0b100, 0x25);
    }

    pub fn andl_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu32_imm(dest, imm, 0b100, 0x25);
    }

    pub fn orq_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex64_modrm(src, dest);
        self.emit_u8(0x09);
        self.emit_modrm_registers(src, dest);
    }

    pub fn orl_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex32_optional(src, dest);
        self.emit_u8(0x09);
        self.emit_modrm_registers(src, dest);
    }

    pub fn orq_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu64_imm(dest, imm, 0b001, 0x0D);
    }

    pub fn orl_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu32_imm(dest, imm, 0b001, 0x0D);
    }

    pub fn xorq_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex64_modrm(src, dest);
        self.emit_u8(0x31);
        self.emit_modrm_registers(src, dest);
    }

    pub fn xorl_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex32_optional(src, dest);
        self.emit_u8(0x31);
        self.emit_modrm_registers(src, dest);
    }

    pub fn xorq_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu64_imm(dest, imm, 0b110, 0x35);
    }

    pub fn xorl_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu32_imm(dest, imm, 0b110, 0x35);
    }

    pub fn cmpq_rr(&mut self, lhs: Register, rhs: Register) {
        self.emit_rex64_modrm(rhs, lhs);
        self.emit_u8(0x39);
        self.emit_modrm_registers(rhs, lhs);
    }

    pub fn cmpl_rr(&mut self, lhs: Register, rhs: Register) {
        self.emit_rex32_optional(rhs, lhs);
        self.emit_u8(0x39);
        self.emit_modrm_registers(rhs, lhs);
    }

    pub fn cmpq_ri(&mut self, lhs: Register, imm: Immediate) {
        self.emit_alu64_imm(lhs, imm, 0b111, 0x3D);
    }

    pub fn cmpl_ri(&mut self, lhs: Register, imm: Immediate) {
        self.emit_alu32_imm(lhs, imm, 0b111, 0x3D);
    }

    pub fn cmpq_ar(&mut self, lhs: Address, rhs: Register) {
        self.emit_rex64_modrm_address(rhs, lhs);
        self.emit_u8(0x39);
        self.emit_address(rhs.low_bits(), lhs);
    }

    pub fn cmpl_ar(&mut self, lhs: Address, rhs: Register) {
        self.emit_rex32_modrm_address(rhs, lhs);
        self.emit_u8(0x39);
        self.emit_address(rhs.low_bits(), lhs);
    }

    pub fn cmpq_ai(&mut self, lhs: Address, imm: Immediate) {
        assert!(imm.is_int32());
        self.emit_rex64_address(lhs);
        self.emit_u8(0x81);
        self.emit_address(0b111, lhs);
        self.emit_u32(imm.int32() as u32);
    }

    pub fn cmpl_ai(&mut self, lhs: Address, imm: Immediate) {
        assert!(imm.is_int32());
        self.emit_rex32_address_optional(lhs);
        self.emit_u8(0x81);
        self.emit_address(0b111, lhs);
        self.emit_u32(imm.int32() as u32);
    }

    pub fn testq_rr(&mut self, lhs: Register, rhs: Register) {
        self.emit_rex64_modrm(rhs, lhs);
        self.emit_u8(0x85);
        self.emit_modrm_registers(rhs, lhs);
    }

    pub fn testl_rr(&mut self, lhs: Register, rhs: Register) {
        self.emit_rex32_optional(rhs, lhs);
        self.emit_u8(0x85);
        self.emit_modrm_registers(rhs, lhs);
    }

    pub fn testl_ri(&mut self, lhs: Register, imm: Immediate) {
        assert!(imm.is_int32());
        self.emit_rex32_rm_optional(lhs);

        if lhs == RAX {
            self.emit_u8(0xA9);
        } else {
            self.emit_u8(0xF7);
            self.emit_modrm_opcode(0b000, lhs);
        }

        self.emit_u32(imm.int32() as u32);
    }

    pub fn imulq_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex64_modrm(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0xAF);
        self.emit_modrm_registers(dest, src);
    }

    pub fn imull_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex32_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0xAF);
        self.emit_modrm_registers(dest, src);
    }

    pub fn idivl_r(&mut self, src: Register) {
        self.emit_rex32_rm_optional(src);
        self.emit_u8(0xF7);
        self.emit_modrm_opcode(0b111, src);
    }

    pub fn idivq_r(&mut self, src: Register) {
        self.emit_rex64_rm(src);
        self.emit_u8(0xF7);
        self.emit_modrm_opcode(0b111, src);
    }

    pub fn divl_r(&mut self, src: Register) {
        self.emit_rex32_rm_optional(src);
        self.emit_u8(0xF7);
        self.emit_modrm_opcode(0b110, src);
    }

    pub fn divq_r(&mut self, src: Register) {
        self.emit_rex64_rm(src);
        self.emit_u8(0xF7);
        self.emit_modrm_opcode(0b110, src);
    }

    pub fn negl(&mut self, reg: Register) {
        self.emit_rex32_rm_optional(reg);
        self.emit_u8(0xF7);
        self.emit_modrm_opcode(0b011, reg);
    }

    pub fn negq(&mut self, reg: Register) {
        self.emit_rex64_rm(reg);
        self.emit_u8(0xF7);
        self.emit_modrm_opcode(0b011, reg);
    }

    pub fn notl(&mut self, reg: Register) {
        self.emit_rex32_rm_optional(reg);
        self.emit_u8(0xF7);
        self.emit_modrm_opcode(0b010, reg);
    }

    pub fn notq(&mut self, reg: Register) {
        self.emit_rex64_rm(reg);
        self.emit_u8(0xF7);
        self.emit_modrm_opcode(0b010, reg);
    }

    pub fn shll_r(&mut self, lhs: Register) {
        self.emit_rex32_rm_optional(lhs);
        self.emit_u8(0xD3);
        self.emit_modrm_opcode(0b100, lhs);
    }

    pub fn shlq_r(&mut self, lhs: Register) {
        self.emit_rex64_rm(lhs);
        self.emit_u8(0xD3);
        self.emit_modrm_opcode(0b100, lhs);
    }

    pub fn shll_ri(&mut self, lhs: Register, rhs: Immediate) {
        assert!(rhs.is_int8());
        self.emit_rex32_rm_optional(lhs);
        self.emit_u8(0xC1);
        self.emit_modrm_opcode(0b100, lhs);
        self.emit_u8(rhs.int8() as u8);
    }

    pub fn shlq_ri(&mut self, lhs: Register, rhs: Immediate) {
        assert!(rhs.is_int8());
        self.emit_rex64_rm(lhs);
        self.emit_u8(0xC1);
        self.emit_modrm_opcode(0b100, lhs);
        self.emit_u8(rhs.int8() as u8);
    }

    pub fn shrl_r(&mut self, lhs: Register) {
        self.emit_rex32_rm_optional(lhs);
        self.emit_u8(0xD3);
        self.emit_modrm_opcode(0b101, lhs);
    }

    pub fn shrq_r(&mut self, lhs: Register) {
        self.emit_rex64_rm(lhs);
        self.emit_u8(0xD3);
        self.emit_modrm_opcode(0b101, lhs);
    }

    pub fn shrl_ri(&mut self, lhs: Register, rhs: Immediate) {
        assert!(rhs.is_int8());
        self.emit_rex32_rm_optional(lhs);
        self.emit_u8(0xC1);
        self.emit_modrm_opcode(0b101, lhs);
        self.emit_u8(rhs.int8() as u8);
    }

    pub fn shrq_ri(&mut self, lhs: Register, rhs: Immediate) {
        assert!(rhs.is_int8());
        self.emit_rex64_rm(lhs);
        self.emit_u8(0xC1);
        self.emit_modrm_opcode(0b101, lhs);
        self.emit_u8(rhs.int8() as u8);
    }

    pub fn sarl_r(&mut self, lhs: Register) {
        self.emit_rex32_rm_optional(lhs);
        self.emit_u8(0xD3);
        self.emit_modrm_opcode(0b111, lhs);
    }

    pub fn sarq_r(&mut self, lhs: Register) {
        self.emit_rex64_rm(lhs);
        self.emit_u8(0xD3);
        self.emit_modrm_opcode(0b111, lhs);
    }

    pub fn sarl_ri(&mut self, lhs: Register, rhs: Immediate) {
        assert!(rhs.is_int8());
        self.emit_rex32_rm_optional(lhs);
        self.emit_u8(0xC1);
        self.emit_modrm_opcode(0b111, lhs);
        self.emit_u8(rhs.int8() as u8);
    }

    pub fn sarq_ri(&mut self, lhs: Register, rhs: Immediate) {
        assert!(rhs.is_int8());
        self.emit_rex64_rm(lhs);
        self.emit_u8(0xC1);
        self.emit_modrm_opcode(0b111, lhs);
        self.emit_u8(rhs.int8() as u8);
    }

    pub fn setcc_r(&mut self, condition: Condition, dest: Register) {
        if dest.needs_rex() || dest.low_bits() > 3 {
            self.emit_rex(false, false, false, dest.needs_rex());
        }

        self.emit_u8(0x0F);
        self.emit_u8(0x90 + condition.int());
        self.emit_modrm_opcode(0, dest);
    }

    pub fn cmovl(&mut self, condition: Condition, dest: Register, src: Register) {
        self.emit_rex32_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0x40 + condition.int());
        self.emit_modrm_registers(dest, src);
    }

    pub fn cmovq(&mut self, condition: Condition, dest: Register, src: Register) {
        self.emit_rex64_modrm(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0x40 + condition.int());
        self.emit_modrm_registers(dest, src);
    }

    pub fn call_r(&mut self, reg: Register) {
        self.emit_rex32_rm_optional(reg);
        self.emit_u8(0xFF);
        self.emit_modrm_opcode(0b010, reg);
    }

    pub fn call_rel32(&mut self, disp: i32) {
        self.emit_u8(0xE8);
        self.emit_u32(disp as u32);
    }

    pub fn jcc(&mut self, condition: Condition, target: Label) {
        if let Some(target_offset) = self.offset(target) {
            // backwards jump
            // rip is at the end of the current instruction
            let target_offset = target_offset as usize;
            assert!(target_offset <= self.position());
            let distance = self.position() + 2 - target_offset;
            let distance = -(distance as isize);
            assert!(distance <= -2);

            if distance >= -128 {
                self.emit_u8(0x70 + condition.int());
                self.emit_u8(distance as u8);
            } else {
                let distance = self.position() + 6 - target_offset;
                let distance = -(distance as isize);
                self.emit_u8(0x0F);
                self.emit_u8(0x80 + condition.int());
                self.emit_u32(distance as u32);
            }
        } else {
            // forward jump - conservatively assume far jump
            self.emit_u8(0x0F);
            self.emit_u8(0x80 + condition.int());
            self.unresolved_jumps.push(ForwardJump {
                offset: self.position().try_into().unwrap(),
                label: target,
                distance: JumpDistance::Far,
            });
            self.emit_u32(0);
        }
    }

    pub fn jcc_near(&mut self, condition: Condition, target: Label) {
        if let Some(target_offset) = self.offset(target) {
            let target_offset = target_offset as usize;
            assert!(target_offset <= self.position());
            let distance = self.position() + 2 - target_offset;
            let distance = -(distance as isize);
            assert!(-128 <= distance && distance <= -2);
            self.emit_u8(0x70 + condition.int());
            self.emit_u8(distance as u8);
        } else {
            self.emit_u8(0x70 + condition.int());
            self.unresolved_jumps.push(ForwardJump {
                offset: self.position().try_into().unwrap(),
                label: target,
                distance: JumpDistance::Near,
            });
            self.emit_u8(0);
        }
    }

    pub fn jmp(&mut self, target: Label) {
        if let Some(target_offset) = self.offset(target) {
            let target_offset = target_offset as usize;
            assert!(target_offset <= self.position());
            let distance = self.position() + 2 - target_offset;
            let distance = -(distance as isize);
            assert!(distance <= -2);

            if distance >= -128 {
                self.emit_u8(0xEB);
                self.emit_u8(distance as u8);
            } else {
                let distance = self.position() + 5 - target_offset;
                let distance = -(distance as isize);
                self.emit_u8(0xE9);
                self.emit_u32(distance as u32);
            }
        } else {
            // forward jump - conservatively assume far jump
            self.emit_u8(0xE9);
            self.unresolved_jumps.push(ForwardJump {
                offset: self.position().try_into().unwrap(),
                label: target,
                distance: JumpDistance::Far,
            });
            self.emit_u32(0);
        }
    }

    pub fn jmp_near(&mut self, target: Label) {
        if let Some(target_offset) = self.offset(target) {
            let target_offset = target_offset as usize;
            assert!(target_offset <= self.position());
            let distance = self.position() + 2 - target_offset;
            let distance = -(distance as isize);
            assert!(-128 <= distance && distance <= -2);
            self.emit_u8(0xEB);
            self.emit_u8(distance as u8);
        } else {
            self.emit_u8(0xEB);
            self.unresolved_jumps.push(ForwardJump {
                offset: self.position().try_into().unwrap(),
                label: target,
                distance: JumpDistance::Near,
            });
            self.emit_u8(0);
        }
    }

    pub fn jmp_r(&mut self, reg: Register) {
        self.emit_rex32_rm_optional(reg);
        self.emit_u8(0xFF);
        self.emit_modrm_opcode(0b100, reg);
    }

    pub fn jmp_a(&mut self, target: Address) {
        self.emit_rex32_address_optional(target);
        self.emit_u8(0xFF);
        self.emit_address(0b100, target);
    }

    pub fn xchgq_ar(&mut self, lhs: Address, rhs: Register) {
        self.emit_rex64_modrm_address(rhs, lhs);
        self.emit_u8(0x87);
        self.emit_address(rhs.low_bits(), lhs);
    }

    pub fn xchgl_ar(&mut self, lhs: Address, rhs: Register) {
        self.emit_rex32_modrm_address(rhs, lhs);
        self.emit_u8(0x87);
        self.emit_address(rhs.low_bits(), lhs);
    }

    pub fn lock_cmpxchgq_ar(&mut self, dest: Address, src: Register) {
        self.emit_u8(0xF0);
        self.emit_rex64_modrm_address(src, dest);
        self.emit_u8(0x0F);
        self.emit_u8(0xB1);
        self.emit_address(src.low_bits(), dest);
    }

    pub fn lock_cmpxchgl_ar(&mut self, dest: Address, src: Register) {
        self.emit_u8(0xF0);
        self.emit_rex32_modrm_address(src, dest);
        self.emit_u8(0x0F);
        self.emit_u8(0xB1);
        self.emit_address(src.low_bits(), dest);
    }

    pub fn mfence(&mut self) {
        self.emit_u8(0x0F);
        self.emit_u8(0xAE);
        self.emit_u8(0xF0);
    }
}

impl AssemblerX64 {
    pub fn movss_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_u8(0xF3);
        self.emit_rex_sse_modrm_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0x10);
        self.emit_modrm_sse_registers(dest, src);
    }

    pub fn movss_ra(&mut self, dest: XmmRegister, src: Address) {
        self.emit_u8(0xF3);
        self.emit_rex_sse_address_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0x10);
        self.emit_address(dest.low_bits(), src);
    }

    pub fn movss_ar(&mut self, dest: Address, src: XmmRegister) {
        self.emit_u8(0xF3);
        self.emit_rex_sse_address_optional(src, dest);
        self.emit_u8(0x0F);
        self.emit_u8(0x11);
        self.emit_address(src.low_bits(), dest);
    }

    pub fn movsd_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_u8(0xF2);
        self.emit_rex_sse_modrm_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0x10);
        self.emit_modrm_sse_registers(dest, src);
    }

    pub fn movsd_ra(&mut self, dest: XmmRegister, src: Address) {
        self.emit_u8(0xF2);
        self.emit_rex_sse_address_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0x10);
        self.emit_address(dest.low_bits(), src);
    }

    pub fn movsd_ar(&mut self, dest: Address, src: XmmRegister) {
        self.emit_u8(0xF2);
        self.emit_rex_sse_address_optional(src, dest);
        self.emit_u8(0x0F);
        self.emit_u8(0x11);
        self.emit_address(src.low_bits(), dest);
    }

    pub fn addss_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_float_rr(false, dest, src, 0x58);
    }

    pub fn addsd_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_float_rr(true, dest, src, 0x58);
    }

    pub fn subss_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_float_rr(false, dest, src, 0x5C);
    }

    pub fn subsd_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_float_rr(true, dest, src, 0x5C);
    }

    pub fn mulss_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_float_rr(false, dest, src, 0x59);
    }

    pub fn mulsd_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_float_rr(true, dest, src, 0x59);
    }

    pub fn divss_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_float_rr(false, dest, src, 0x5E);
    }

    pub fn divsd_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_float_rr(true, dest, src, 0x5E);
    }

    pub fn sqrtss_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_float_rr(false, dest, src, 0x51);
    }

    pub fn sqrtsd_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_float_rr(true, dest, src, 0x51);
    }

    fn emit_sse_float_rr(&mut self, dbl: bool, dest: XmmRegister, src: XmmRegister, opcode: u8) {
        self.emit_u8(if dbl { 0xF2 } else { 0xF3 });
        self.emit_rex_sse_modrm_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(opcode);
        self.emit_modrm_sse_registers(dest, src);
    }

    pub fn ucomiss_rr(&mut self, lhs: XmmRegister, rhs: XmmRegister) {
        self.emit_rex_sse_modrm_optional(lhs, rhs);
        self.emit_u8(0x0F);
        self.emit_u8(0x2E);
        self.emit_modrm_sse_registers(lhs, rhs);
    }

    pub fn ucomisd_rr(&mut self, lhs: XmmRegister, rhs: XmmRegister) {
        self.emit_u8(0x66);
        self.emit_rex_sse_modrm_optional(lhs, rhs);
        self.emit_u8(0x0F);
        self.emit_u8(0x2E);
        self.emit_modrm_sse_registers(lhs, rhs);
    }

    pub fn xorps_ra(&mut self, dest: XmmRegister, src: Address) {
        self.emit_rex_sse_address_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0x57);
        self.emit_address(dest.low_bits(), src);
    }

    pub fn xorpd_ra(&mut self, dest: XmmRegister, src: Address) {
        self.emit_u8(0x66);
        self.emit_rex_sse_address_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0x57);
        self.emit_address(dest.low_bits(), src);
    }

    pub fn xorps_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_rex_sse_modrm_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0x57);
        self.emit_modrm_sse_registers(dest, src);
    }

    pub fn xorpd_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_u8(0x66);
        self.emit_rex_sse_modrm_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0x57);
        self.emit_modrm_sse_registers(dest, src);
    }

    pub fn pxor_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_u8(0x66);
        self.emit_rex_sse_modrm_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0xEF);
        self.emit_modrm_sse_registers(dest, src);
    }

    pub fn cvtss2sd_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_u8(0xF3);
        self.emit_rex_sse_modrm_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0x5A);
        self.emit_modrm_sse_registers(dest, src);
    }

    pub fn cvtsd2ss_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_u8(0xF2);
        self.emit_rex_sse_modrm_optional(dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0x5A);
        self.emit_modrm_sse_registers(dest, src);
    }

    pub fn cvtsi2ssd_rr(&mut self, dest: XmmRegister, src: Register) {
        self.emit_u8(0xF3);
        self.emit_rex_optional(false, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0x2A);
        self.emit_modrm(0b11, dest.low_bits(), src.low_bits());
    }

    pub fn cvtsi2ssq_rr(&mut self, dest: XmmRegister, src: Register) {
        self.emit_u8(0xF3);
        self.emit_rex(true, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0x2A);
        self.emit_modrm(0b11, dest.low_bits(), src.low_bits());
    }

    pub fn cvtsi2sdd_rr(&mut self, dest: XmmRegister, src: Register) {
        self.emit_u8(0xF2);
        self.emit_rex_optional(false, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0x2A);
        self.emit_modrm(0b11, dest.low_bits(), src.low_bits());
    }

    pub fn cvtsi2sdq_rr(&mut self, dest: XmmRegister, src: Register) {
        self.emit_u8(0xF2);
        self.emit_rex(true, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0x2A);
        self.emit_modrm(0b11, dest.low_bits(), src.low_bits());
    }

    pub fn cvttss2sid_rr(&mut self, dest: Register, src: XmmRegister) {
        self.emit_u8(0xF3);
        self.emit_rex_optional(false, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0x2C);
        self.emit_modrm(0b11, dest.low_bits(), src.low_bits());
    }

    pub fn cvttss2siq_rr(&mut self, dest: Register, src: XmmRegister) {
        self.emit_u8(0xF3);
        self.emit_rex(true, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0x2C);
        self.emit_modrm(0b11, dest.low_bits(), src.low_bits());
    }

    pub fn cvttsd2sid_rr(&mut self, dest: Register, src: XmmRegister) {
        self.emit_u8(0xF2);
        self.emit_rex_optional(false, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0x2C);
        self.emit_modrm(0b11, dest.low_bits(), src.low_bits());
    }

    pub fn cvttsd2siq_rr(&mut self, dest: Register, src: XmmRegister) {
        self.emit_u8(0xF2);
        self.emit_rex(true, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0x2C);
        self.emit_modrm(0b11, dest.low_bits(), src.low_bits());
    }

    pub fn movd_xr(&mut self, dest: XmmRegister, src: Register) {
        self.emit_u8(0x66);
        self.emit_rex_optional(false, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0x6E);
        self.emit_modrm(0b11, dest.low_bits(), src.low_bits());
    }

    pub fn movd_rx(&mut self, dest: Register, src: XmmRegister) {
        self.emit_u8(0x66);
        self.emit_rex_optional(false, src.needs_rex(), false, dest.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0x7E);
        self.emit_modrm(0b11, src.low_bits(), dest.low_bits());
    }

    pub fn movq_xr(&mut self, dest: XmmRegister, src: Register) {
        self.emit_u8(0x66);
        self.emit_rex(true, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0x6E);
        self.emit_modrm(0b11, dest.low_bits(), src.low_bits());
    }

    pub fn movq_rx(&mut self, dest: Register, src: XmmRegister) {
        self.emit_u8(0x66);
        self.emit_rex(true, src.needs_rex(), false, dest.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0x7E);
        self.emit_modrm(0b11, src.low_bits(), dest.low_bits());
    }
}

impl AssemblerX64 {
    fn emit_rex(&mut self, w: bool, r: bool, x: bool, b: bool) {
        // w - 64-bit operand width
        // r - extension of the modrm reg field
        // x - extension of the sib index field
        // b - extension of the modrm rm/sib base field
        let opcode = 0x40 | (w as u8) << 3 | (r as u8) << 2 | (x as u8) << 1 | b as u8;
        self.emit_u8(opcode);
    }

    fn emit_rex_optional(&mut self, w: bool, r: bool, x: bool, b: bool) {
        if w || r || x || b {
            self.emit_rex(w, r, x, b);
        }
    }

    fn emit_rex64(&mut self) {
        self.emit_rex(true, false, false, false);
    }

    fn emit_rex64_rm(&mut self, rm: Register) {
        self.emit_rex(true, false, false, rm.needs_rex());
    }

    fn emit_rex64_modrm(&mut self, reg: Register, rm: Register) {
        self.emit_rex(true, reg.needs_rex(), false, rm.needs_rex());
    }

    fn emit_rex64_modrm_address(&mut self, reg: Register, address: Address) {
        self.emit_rex(true, reg.needs_rex(), address.rex_x(), address.rex_b());
    }

    fn emit_rex64_address(&mut self, address: Address) {
        self.emit_rex(true, false, address.rex_x(), address.rex_b());
    }

    fn emit_rex32_optional(&mut self, reg: Register, rm: Register) {
        if reg.needs_rex() || rm.needs_rex() {
            self.emit_rex(false, reg.needs_rex(), false, rm.needs_rex());
        }
    }

    fn emit_rex32_rm_optional(&mut self, reg: Register) {
        if reg.needs_rex() {
            self.emit_rex(false, false, false, true);
        }
    }

    fn emit_rex32_byte_optional(&mut self, reg: Register, rm: Register) {
        if reg.needs_rex() || rm.needs_rex() || rm.value() > 3 {
            self.emit_rex(false, reg.needs_rex(), false, rm.needs_rex());
        }
    }

    fn emit_rex32_modrm_address(&mut self, reg: Register, address: Address) {
        if reg.needs_rex() || address.has_rex() {
            self.emit_rex(false, reg.needs_rex(), address.rex_x(), address.rex_b());
        }
    }

    fn emit_rex32_byte_address(&mut self, reg: Register, address: Address) {
        if reg.needs_rex() || reg.value() > 3 || address.has_rex() {
            self.emit_rex(false, reg.needs_rex(), address.rex_x(), address.rex_b());
        }
    }

    fn emit_rex32_address_optional(&mut self, address: Address) {
        if address.has_rex() {
            self.emit_rex(false, false, address.rex_x(), address.rex_b());
        }
    }

    fn emit_rex_sse_modrm_optional(&mut self, reg: XmmRegister, rm: XmmRegister) {
        self.emit_rex_optional(false, reg.needs_rex(), false, rm.needs_rex());
    }

    fn emit_rex_sse_address_optional(&mut self, reg: XmmRegister, address: Address) {
        self.emit_rex_optional(false, reg.needs_rex(), address.rex_x(), address.rex_b());
    }

    fn emit_modrm_registers(&mut self, reg: Register, rm: Register) {
        self.emit_modrm(0b11, reg.low_bits(), rm.low_bits());
    }

    fn emit_modrm_sse_registers(&mut self, reg: XmmRegister, rm: XmmRegister) {
        self.emit_modrm(0b11, reg.low_bits(), rm.low_bits());
    }

    fn emit_modrm_opcode(&mut self, opcode: u8, reg: Register) {
        self.emit_modrm(0b11, opcode, reg.low_bits());
    }

    fn emit_modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        assert!(mode < 4);
        assert!(reg < 8);
        assert!(rm < 8);
        self.emit_u8(mode << 6 | reg << 3 | rm);
    }

    fn emit_address(&mut self, reg_or_opcode: u8, address: Address) {
        assert!(reg_or_opcode < 8);

        if address.rip {
            // rip-relative: mode 00 with rm 101
            self.emit_modrm(0b00, reg_or_opcode, 0b101);
            self.emit_u32(address.disp as u32);
            return;
        }

        match (address.base, address.index) {
            (Some(base), None) => {
                // base low bits 101 (rbp/r13) has no disp-less encoding,
                // base low bits 100 (rsp/r12) requires a sib byte
                let mode = if address.disp == 0 && base.low_bits() != 0b101 {
                    0b00
                } else if -128 <= address.disp && address.disp < 128 {
                    0b01
                } else {
                    0b10
                };

                self.emit_modrm(mode, reg_or_opcode, base.low_bits());

                if base.low_bits() == 0b100 {
                    self.emit_sib(ScaleFactor::One, 0b100, base.low_bits());
                }

                self.emit_disp(mode, address.disp);
            }

            (Some(base), Some((index, scale))) => {
                let mode = if address.disp == 0 && base.low_bits() != 0b101 {
                    0b00
                } else if -128 <= address.disp && address.disp < 128 {
                    0b01
                } else {
                    0b10
                };

                self.emit_modrm(mode, reg_or_opcode, 0b100);
                self.emit_sib(scale, index.low_bits(), base.low_bits());
                self.emit_disp(mode, address.disp);
            }

            (None, Some((index, scale))) => {
                // scaled index without base: mode 00, sib base 101, disp32
                self.emit_modrm(0b00, reg_or_opcode, 0b100);
                self.emit_sib(scale, index.low_bits(), 0b101);
                self.emit_u32(address.disp as u32);
            }

            (None, None) => unreachable!(),
        }
    }

    fn emit_sib(&mut self, scale: ScaleFactor, index: u8, base: u8) {
        assert!(index < 8);
        assert!(base < 8);
        self.emit_u8(scale.value() << 6 | index << 3 | base);
    }

    fn emit_disp(&mut self, mode: u8, disp: i32) {
        match mode {
            0b00 => {}
            0b01 => self.emit_u8(disp as u8),
            0b10 => self.emit_u32(disp as u32),
            _ => unreachable!(),
        }
    }

    fn emit_alu64_imm(&mut self, reg: Register, imm: Immediate, modrm_reg: u8, rax_opcode: u8) {
        assert!(imm.is_int32());
        self.emit_rex64_rm(reg);

        if imm.is_int8() {
            self.emit_u8(0x83);
            self.emit_modrm_opcode(modrm_reg, reg);
            self.emit_u8(imm.int8() as u8);
        } else if reg == RAX {
            self.emit_u8(rax_opcode);
            self.emit_u32(imm.int32() as u32);
        } else {
            self.emit_u8(0x81);
            self.emit_modrm_opcode(modrm_reg, reg);
            self.emit_u32(imm.int32() as u32);
        }
    }

    fn emit_alu32_imm(&mut self, reg: Register, imm: Immediate, modrm_reg: u8, rax_opcode: u8) {
        assert!(imm.is_int32());
        self.emit_rex32_rm_optional(reg);

        if imm.is_int8() {
            self.emit_u8(0x83);
            self.emit_modrm_opcode(modrm_reg, reg);
            self.emit_u8(imm.int8() as u8);
        } else if reg == RAX {
            self.emit_u8(rax_opcode);
            self.emit_u32(imm.int32() as u32);
        } else {
            self.emit_u8(0x81);
            self.emit_modrm_opcode(modrm_reg, reg);
            self.emit_u32(imm.int32() as u32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! assert_emit {
        (
            $($expr:expr),*;
            $name:ident
        ) => {{
            let mut buf = AssemblerX64::new();
            buf.$name();
            let expected = vec![$($expr,)*];

            assert_eq!(expected, buf.finalize(1).code());
        }};

        (
            $($expr:expr),*;
            $name:ident
            (
                    $($param:expr),*
            )
        ) => {{
            let mut buf = AssemblerX64::new();
            buf.$name($($param,)*);
            let expected: Vec<u8> = vec![$($expr,)*];
            let data = buf.finalize(1).code();

            assert_eq!(expected, data, "emitted code wrong");
        }};
    }

    #[test]
    fn test_pushq_popq_r() {
        assert_emit!(0x50; pushq_r(RAX));
        assert_emit!(0x54; pushq_r(RSP));
        assert_emit!(0x41, 0x50; pushq_r(R8));
        assert_emit!(0x41, 0x57; pushq_r(R15));
        assert_emit!(0x58; popq_r(RAX));
        assert_emit!(0x41, 0x58; popq_r(R8));
        assert_emit!(0x41, 0x5F; popq_r(R15));
    }

    #[test]
    fn test_retq_nop_int3() {
        assert_emit!(0xC3; retq);
        assert_emit!(0x90; nop);
        assert_emit!(0xCC; int3);
    }

    #[test]
    fn test_movq_rr() {
        assert_emit!(0x49, 0x89, 0xC7; movq_rr(R15, RAX));
        assert_emit!(0x4C, 0x89, 0xF8; movq_rr(RAX, R15));
        assert_emit!(0x48, 0x89, 0xE5; movq_rr(RBP, RSP));
        assert_emit!(0x48, 0x89, 0xEC; movq_rr(RSP, RBP));
    }

    #[test]
    fn test_movl_rr() {
        assert_emit!(0x41, 0x89, 0xC7; movl_rr(R15, RAX));
        assert_emit!(0x44, 0x89, 0xF8; movl_rr(RAX, R15));
        assert_emit!(0x89, 0xC1; movl_rr(RCX, RAX));
    }

    #[test]
    fn test_movq_ri() {
        assert_emit!(0x48, 0xC7, 0xC0, 1, 0, 0, 0; movq_ri(RAX, Immediate(1)));
        assert_emit!(0x49, 0xC7, 0xC7, 0xFF, 0xFF, 0xFF, 0xFF; movq_ri(R15, Immediate(-1)));
        assert_emit!(0x48, 0xB8, 0, 0, 0, 0, 1, 0, 0, 0;
            movq_ri(RAX, Immediate(1 << 32)));
    }

    #[test]
    fn test_movq_ri64() {
        assert_emit!(0x48, 0xB8, 1, 0, 0, 0, 0, 0, 0, 0; movq_ri64(RAX, Immediate(1)));
        assert_emit!(0x49, 0xBF, 0, 0, 0, 0, 0, 0, 0, 0; movq_ri64(R15, Immediate(0)));
    }

    #[test]
    fn test_movl_ri() {
        assert_emit!(0xB8, 2, 0, 0, 0; movl_ri(RAX, Immediate(2)));
        assert_emit!(0x41, 0xB8, 3, 0, 0, 0; movl_ri(R8, Immediate(3)));
    }

    #[test]
    fn test_movq_ra() {
        assert_emit!(0x48, 0x8B, 0x00; movq_ra(RAX, Address::offset(RAX, 0)));
        assert_emit!(0x48, 0x8B, 0x45, 0x08; movq_ra(RAX, Address::offset(RBP, 8)));
        assert_emit!(0x48, 0x8B, 0x04, 0x24; movq_ra(RAX, Address::offset(RSP, 0)));
        assert_emit!(0x49, 0x8B, 0x04, 0x24; movq_ra(RAX, Address::offset(R12, 0)));
        assert_emit!(0x49, 0x8B, 0x45, 0x00; movq_ra(RAX, Address::offset(R13, 0)));
        assert_emit!(0x48, 0x8B, 0x83, 0x45, 0x23, 0x01, 0x00;
            movq_ra(RAX, Address::offset(RBX, 0x12345)));
    }

    #[test]
    fn test_movq_ar() {
        assert_emit!(0x48, 0x89, 0x08; movq_ar(Address::offset(RAX, 0), RCX));
        assert_emit!(0x4D, 0x89, 0x38; movq_ar(Address::offset(R8, 0), R15));
        assert_emit!(0x48, 0x89, 0x44, 0xD8, 0x10;
            movq_ar(Address::array(RAX, RBX, ScaleFactor::Eight, 16), RAX));
    }

    #[test]
    fn test_movl_ar_ra() {
        assert_emit!(0x89, 0x08; movl_ar(Address::offset(RAX, 0), RCX));
        assert_emit!(0x8B, 0x08; movl_ra(RCX, Address::offset(RAX, 0)));
        assert_emit!(0x45, 0x89, 0x38; movl_ar(Address::offset(R8, 0), R15));
    }

    #[test]
    fn test_movb_ar() {
        assert_emit!(0x88, 0x08; movb_ar(Address::offset(RAX, 0), RCX));
        assert_emit!(0x40, 0x88, 0x30; movb_ar(Address::offset(RAX, 0), RSI));
        assert_emit!(0x44, 0x88, 0x38; movb_ar(Address::offset(RAX, 0), R15));
    }

    #[test]
    fn test_movw_ar() {
        assert_emit!(0x66, 0x89, 0x08; movw_ar(Address::offset(RAX, 0), RCX));
        assert_emit!(0x66, 0x45, 0x89, 0x38; movw_ar(Address::offset(R8, 0), R15));
    }

    #[test]
    fn test_movl_ai() {
        assert_emit!(0xC7, 0x00, 1, 0, 0, 0; movl_ai(Address::offset(RAX, 0), Immediate(1)));
        assert_emit!(0x41, 0xC7, 0x00, 0xFF, 0xFF, 0xFF, 0xFF;
            movl_ai(Address::offset(R8, 0), Immediate(u32::max_value() as i64)));
    }

    #[test]
    fn test_movq_ai() {
        assert_emit!(0x48, 0xC7, 0x00, 1, 0, 0, 0; movq_ai(Address::offset(RAX, 0), Immediate(1)));
        assert_emit!(0x49, 0xC7, 0x07, 0, 0, 0, 0x80;
            movq_ai(Address::offset(R15, 0), Immediate(i32::min_value() as i64)));
    }

    #[test]
    fn test_movzx_movsx() {
        assert_emit!(0x0F, 0xB6, 0xC0; movzxb_rr(RAX, RAX));
        assert_emit!(0x0F, 0xB6, 0xC7; movzxb_rr(RAX, RDI));
        assert_emit!(0x40, 0x0F, 0xB6, 0xC6; movzxb_rr(RAX, RSI));
        assert_emit!(0x0F, 0xBE, 0xC8; movsxbl_rr(RCX, RAX));
        assert_emit!(0x0F, 0xB7, 0xC8; movzxw_rr(RCX, RAX));
        assert_emit!(0x44, 0x0F, 0xB7, 0xC0; movzxw_rr(R8, RAX));
        assert_emit!(0x0F, 0xBF, 0xC8; movsxwl_rr(RCX, RAX));
        assert_emit!(0x48, 0x63, 0xC8; movsxlq_rr(RCX, RAX));
        assert_emit!(0x4C, 0x63, 0xF8; movsxlq_rr(R15, RAX));
    }

    #[test]
    fn test_loads_extending() {
        assert_emit!(0x0F, 0xB6, 0x03; movzxb_ra(RAX, Address::offset(RBX, 0)));
        assert_emit!(0x0F, 0xBE, 0x03; movsxbl_ra(RAX, Address::offset(RBX, 0)));
        assert_emit!(0x0F, 0xB7, 0x03; movzxw_ra(RAX, Address::offset(RBX, 0)));
        assert_emit!(0x0F, 0xBF, 0x03; movsxwl_ra(RAX, Address::offset(RBX, 0)));
    }

    #[test]
    fn test_lea() {
        assert_emit!(0x48, 0x8D, 0x45, 0x08; lea(RAX, Address::offset(RBP, 8)));
        assert_emit!(0x48, 0x8D, 0x4C, 0xD8, 0x04;
            lea(RCX, Address::array(RAX, RBX, ScaleFactor::Eight, 4)));
        assert_emit!(0x48, 0x8D, 0x05, 0x10, 0, 0, 0; lea(RAX, Address::rip(0x10)));
        assert_emit!(0x48, 0x8D, 0x04, 0x24; lea(RAX, Address::offset(RSP, 0)));
        assert_emit!(0x48, 0x8D, 0x04, 0xCD, 0, 0, 0, 0;
            lea(RAX, Address::index(RCX, ScaleFactor::Eight, 0)));
    }

    #[test]
    fn test_alu_rr() {
        assert_emit!(0x48, 0x01, 0xD8; addq_rr(RAX, RBX));
        assert_emit!(0x4C, 0x01, 0xE0; addq_rr(RAX, R12));
        assert_emit!(0x01, 0xD8; addl_rr(RAX, RBX));
        assert_emit!(0x48, 0x29, 0xD8; subq_rr(RAX, RBX));
        assert_emit!(0x29, 0xD8; subl_rr(RAX, RBX));
        assert_emit!(0x48, 0x21, 0xD8; andq_rr(RAX, RBX));
        assert_emit!(0x21, 0xD8; andl_rr(RAX, RBX));
        assert_emit!(0x48, 0x09, 0xD8; orq_rr(RAX, RBX));
        assert_emit!(0x09, 0xD8; orl_rr(RAX, RBX));
        assert_emit!(0x48, 0x31, 0xD8; xorq_rr(RAX, RBX));
        assert_emit!(0x31, 0xD8; xorl_rr(RAX, RBX));
    }

    #[test]
    fn test_alu_ri() {
        assert_emit!(0x48, 0x83, 0xC0, 0x08; addq_ri(RAX, Immediate(8)));
        assert_emit!(0x48, 0x05, 0x00, 0x01, 0, 0; addq_ri(RAX, Immediate(256)));
        assert_emit!(0x48, 0x81, 0xC1, 0x00, 0x01, 0, 0; addq_ri(RCX, Immediate(256)));
        assert_emit!(0x83, 0xE8, 0x08; subl_ri(RAX, Immediate(8)));
        assert_emit!(0x48, 0x83, 0xEC, 0x10; subq_ri(RSP, Immediate(16)));
        assert_emit!(0x25, 0xFF, 0xFF, 0, 0; andl_ri(RAX, Immediate(0xFFFF)));
        assert_emit!(0x41, 0x83, 0xC8, 0x01; orl_ri(R8, Immediate(1)));
    }

    #[test]
    fn test_cmp_test() {
        assert_emit!(0x48, 0x39, 0xD8; cmpq_rr(RAX, RBX));
        assert_emit!(0x39, 0xD8; cmpl_rr(RAX, RBX));
        assert_emit!(0x48, 0x83, 0xF8, 0x00; cmpq_ri(RAX, Immediate(0)));
        assert_emit!(0x83, 0xF9, 0xFF; cmpl_ri(RCX, Immediate(-1)));
        assert_emit!(0x48, 0x39, 0x08; cmpq_ar(Address::offset(RAX, 0), RCX));
        assert_emit!(0x39, 0x08; cmpl_ar(Address::offset(RAX, 0), RCX));
        assert_emit!(0x48, 0x85, 0xC0; testq_rr(RAX, RAX));
        assert_emit!(0x85, 0xC0; testl_rr(RAX, RAX));
        assert_emit!(0xA9, 0x01, 0, 0, 0; testl_ri(RAX, Immediate(1)));
        assert_emit!(0xF7, 0xC1, 0x01, 0, 0, 0; testl_ri(RCX, Immediate(1)));
    }

    #[test]
    fn test_mul_div() {
        assert_emit!(0x48, 0x0F, 0xAF, 0xC3; imulq_rr(RAX, RBX));
        assert_emit!(0x0F, 0xAF, 0xC3; imull_rr(RAX, RBX));
        assert_emit!(0xF7, 0xF9; idivl_r(RCX));
        assert_emit!(0x41, 0xF7, 0xF9; idivl_r(R9));
        assert_emit!(0x48, 0xF7, 0xF9; idivq_r(RCX));
        assert_emit!(0xF7, 0xF1; divl_r(RCX));
        assert_emit!(0x48, 0xF7, 0xF1; divq_r(RCX));
        assert_emit!(0x99; cdq);
        assert_emit!(0x48, 0x99; cqo);
    }

    #[test]
    fn test_neg_not() {
        assert_emit!(0xF7, 0xD8; negl(RAX));
        assert_emit!(0x48, 0xF7, 0xD8; negq(RAX));
        assert_emit!(0xF7, 0xD0; notl(RAX));
        assert_emit!(0x48, 0xF7, 0xD0; notq(RAX));
    }

    #[test]
    fn test_shifts() {
        assert_emit!(0xD3, 0xE0; shll_r(RAX));
        assert_emit!(0x48, 0xD3, 0xE0; shlq_r(RAX));
        assert_emit!(0xC1, 0xE0, 2; shll_ri(RAX, Immediate(2)));
        assert_emit!(0x48, 0xC1, 0xE0, 2; shlq_ri(RAX, Immediate(2)));
        assert_emit!(0xD3, 0xE8; shrl_r(RAX));
        assert_emit!(0x48, 0xD3, 0xE8; shrq_r(RAX));
        assert_emit!(0xC1, 0xE8, 2; shrl_ri(RAX, Immediate(2)));
        assert_emit!(0x49, 0xC1, 0xE8, 2; shrq_ri(R8, Immediate(2)));
        assert_emit!(0xD3, 0xF8; sarl_r(RAX));
        assert_emit!(0x48, 0xD3, 0xF8; sarq_r(RAX));
        assert_emit!(0xC1, 0xF8, 2; sarl_ri(RAX, Immediate(2)));
        assert_emit!(0x48, 0xC1, 0xF8, 2; sarq_ri(RAX, Immediate(2)));
    }

    #[test]
    fn test_setcc_cmov() {
        assert_emit!(0x0F, 0x94, 0xC0; setcc_r(Condition::Equal, RAX));
        assert_emit!(0x40, 0x0F, 0x94, 0xC6; setcc_r(Condition::Equal, RSI));
        assert_emit!(0x41, 0x0F, 0x95, 0xC0; setcc_r(Condition::NotEqual, R8));
        assert_emit!(0x0F, 0x44, 0xC1; cmovl(Condition::Equal, RAX, RCX));
        assert_emit!(0x48, 0x0F, 0x44, 0xC1; cmovq(Condition::Equal, RAX, RCX));
        assert_emit!(0x4D, 0x0F, 0x4C, 0xF8; cmovq(Condition::Less, R15, R8));
    }

    #[test]
    fn test_call() {
        assert_emit!(0xFF, 0xD0; call_r(RAX));
        assert_emit!(0x41, 0xFF, 0xD7; call_r(R15));
        assert_emit!(0xE8, 0, 0, 0, 0; call_rel32(0));
    }

    #[test]
    fn test_jmp_r_a() {
        assert_emit!(0xFF, 0xE0; jmp_r(RAX));
        assert_emit!(0x41, 0xFF, 0xE1; jmp_r(R9));
        assert_emit!(0xFF, 0x20; jmp_a(Address::offset(RAX, 0)));
        assert_emit!(0xFF, 0x24, 0xD8; jmp_a(Address::array(RAX, RBX, ScaleFactor::Eight, 0)));
    }

    #[test]
    fn test_backward_jumps() {
        let mut asm = AssemblerX64::new();
        let lbl = asm.create_and_bind_label();
        asm.jmp(lbl);
        assert_eq!(vec![0xEB, 0xFE], asm.finalize(1).code());

        let mut asm = AssemblerX64::new();
        let lbl = asm.create_and_bind_label();
        asm.jcc(Condition::Equal, lbl);
        assert_eq!(vec![0x74, 0xFE], asm.finalize(1).code());
    }

    #[test]
    fn test_forward_jumps() {
        let mut asm = AssemblerX64::new();
        let lbl = asm.create_label();
        asm.jmp(lbl);
        asm.nop();
        asm.bind_label(lbl);
        assert_eq!(vec![0xE9, 1, 0, 0, 0, 0x90], asm.finalize(1).code());

        let mut asm = AssemblerX64::new();
        let lbl = asm.create_label();
        asm.jcc(Condition::NotEqual, lbl);
        asm.nop();
        asm.bind_label(lbl);
        assert_eq!(vec![0x0F, 0x85, 1, 0, 0, 0, 0x90], asm.finalize(1).code());

        let mut asm = AssemblerX64::new();
        let lbl = asm.create_label();
        asm.jmp_near(lbl);
        asm.nop();
        asm.bind_label(lbl);
        assert_eq!(vec![0xEB, 1, 0x90], asm.finalize(1).code());
    }

    #[test]
    fn test_multiple_forward_references() {
        let mut asm = AssemblerX64::new();
        let lbl = asm.create_label();
        asm.jcc(Condition::Equal, lbl);
        asm.jcc(Condition::NotEqual, lbl);
        asm.jmp(lbl);
        asm.bind_label(lbl);
        let code = asm.finalize(1).code();

        // all three displacements resolve to the same bound position
        assert_eq!(u32::from_le_bytes(code[2..6].try_into().unwrap()), 11);
        assert_eq!(u32::from_le_bytes(code[8..12].try_into().unwrap()), 5);
        assert_eq!(u32::from_le_bytes(code[13..17].try_into().unwrap()), 0);
    }

    #[test]
    fn test_xchg_cmpxchg() {
        assert_emit!(0x48, 0x87, 0x38; xchgq_ar(Address::offset(RAX, 0), RDI));
        assert_emit!(0x87, 0x38; xchgl_ar(Address::offset(RAX, 0), RDI));
        assert_emit!(0xF0, 0x48, 0x0F, 0xB1, 0x38; lock_cmpxchgq_ar(Address::offset(RAX, 0), RDI));
        assert_emit!(0xF0, 0x0F, 0xB1, 0x38; lock_cmpxchgl_ar(Address::offset(RAX, 0), RDI));
        assert_emit!(0xF0, 0x4C, 0x0F, 0xB1, 0x38; lock_cmpxchgq_ar(Address::offset(RAX, 0), R15));
        assert_emit!(0x0F, 0xAE, 0xF0; mfence());
    }

    #[test]
    fn test_sse_mov() {
        assert_emit!(0xF3, 0x0F, 0x10, 0xC1; movss_rr(XMM0, XMM1));
        assert_emit!(0xF2, 0x0F, 0x10, 0xC1; movsd_rr(XMM0, XMM1));
        assert_emit!(0xF2, 0x44, 0x0F, 0x10, 0xF8; movsd_rr(XMM15, XMM0));
        assert_emit!(0xF3, 0x0F, 0x10, 0x00; movss_ra(XMM0, Address::offset(RAX, 0)));
        assert_emit!(0xF3, 0x0F, 0x11, 0x00; movss_ar(Address::offset(RAX, 0), XMM0));
        assert_emit!(0xF2, 0x0F, 0x10, 0x00; movsd_ra(XMM0, Address::offset(RAX, 0)));
        assert_emit!(0xF2, 0x0F, 0x11, 0x00; movsd_ar(Address::offset(RAX, 0), XMM0));
        assert_emit!(0xF2, 0x0F, 0x10, 0x05, 0x10, 0, 0, 0; movsd_ra(XMM0, Address::rip(0x10)));
    }

    #[test]
    fn test_sse_arith() {
        assert_emit!(0xF3, 0x0F, 0x58, 0xC1; addss_rr(XMM0, XMM1));
        assert_emit!(0xF2, 0x0F, 0x58, 0xC1; addsd_rr(XMM0, XMM1));
        assert_emit!(0xF3, 0x0F, 0x5C, 0xC1; subss_rr(XMM0, XMM1));
        assert_emit!(0xF2, 0x0F, 0x5C, 0xC1; subsd_rr(XMM0, XMM1));
        assert_emit!(0xF3, 0x0F, 0x59, 0xC1; mulss_rr(XMM0, XMM1));
        assert_emit!(0xF2, 0x0F, 0x59, 0xC1; mulsd_rr(XMM0, XMM1));
        assert_emit!(0xF3, 0x0F, 0x5E, 0xC1; divss_rr(XMM0, XMM1));
        assert_emit!(0xF2, 0x0F, 0x5E, 0xC1; divsd_rr(XMM0, XMM1));
        assert_emit!(0xF3, 0x0F, 0x51, 0xC8; sqrtss_rr(XMM1, XMM0));
        assert_emit!(0xF2, 0x0F, 0x51, 0xC8; sqrtsd_rr(XMM1, XMM0));
    }

    #[test]
    fn test_sse_cmp_logic() {
        assert_emit!(0x0F, 0x2E, 0xC8; ucomiss_rr(XMM1, XMM0));
        assert_emit!(0x66, 0x0F, 0x2E, 0xC8; ucomisd_rr(XMM1, XMM0));
        assert_emit!(0x66, 0x44, 0x0F, 0x2E, 0xFB; ucomisd_rr(XMM15, XMM3));
        assert_emit!(0x0F, 0x57, 0xC1; xorps_rr(XMM0, XMM1));
        assert_emit!(0x66, 0x0F, 0x57, 0xC1; xorpd_rr(XMM0, XMM1));
        assert_emit!(0x0F, 0x57, 0x05, 0x10, 0, 0, 0; xorps_ra(XMM0, Address::rip(0x10)));
        assert_emit!(0x66, 0x0F, 0x57, 0x05, 0x10, 0, 0, 0; xorpd_ra(XMM0, Address::rip(0x10)));
        assert_emit!(0x66, 0x0F, 0xEF, 0xC8; pxor_rr(XMM1, XMM0));
    }

    #[test]
    fn test_sse_convert() {
        assert_emit!(0xF3, 0x0F, 0x5A, 0xC1; cvtss2sd_rr(XMM0, XMM1));
        assert_emit!(0xF2, 0x0F, 0x5A, 0xC1; cvtsd2ss_rr(XMM0, XMM1));
        assert_emit!(0xF3, 0x0F, 0x2A, 0xC1; cvtsi2ssd_rr(XMM0, RCX));
        assert_emit!(0xF3, 0x48, 0x0F, 0x2A, 0xC1; cvtsi2ssq_rr(XMM0, RCX));
        assert_emit!(0xF2, 0x0F, 0x2A, 0xC1; cvtsi2sdd_rr(XMM0, RCX));
        assert_emit!(0xF2, 0x48, 0x0F, 0x2A, 0xC1; cvtsi2sdq_rr(XMM0, RCX));
        assert_emit!(0xF3, 0x0F, 0x2C, 0xC8; cvttss2sid_rr(RCX, XMM0));
        assert_emit!(0xF3, 0x48, 0x0F, 0x2C, 0xC8; cvttss2siq_rr(RCX, XMM0));
        assert_emit!(0xF2, 0x0F, 0x2C, 0xC8; cvttsd2sid_rr(RCX, XMM0));
        assert_emit!(0xF2, 0x48, 0x0F, 0x2C, 0xC8; cvttsd2siq_rr(RCX, XMM0));
        assert_emit!(0xF2, 0x4C, 0x0F, 0x2C, 0xFB; cvttsd2siq_rr(R15, XMM3));
    }

    #[test]
    fn test_sse_bit_moves() {
        assert_emit!(0x66, 0x0F, 0x6E, 0xC0; movd_xr(XMM0, RAX));
        assert_emit!(0x66, 0x0F, 0x7E, 0xC7; movd_rx(RDI, XMM0));
        assert_emit!(0x66, 0x48, 0x0F, 0x6E, 0xC0; movq_xr(XMM0, RAX));
        assert_emit!(0x66, 0x48, 0x0F, 0x7E, 0xC7; movq_rx(RDI, XMM0));
        assert_emit!(0x66, 0x4D, 0x0F, 0x6E, 0xF8; movq_xr(XMM15, R8));
    }

    #[test]
    fn test_finalize_alignment() {
        let mut asm = AssemblerX64::new();
        asm.retq();
        let code = asm.finalize(16).code();
        assert_eq!(code.len(), 16);
        assert_eq!(code[0], 0xC3);
    }

    #[test]
    fn test_label_offset_after_finalize() {
        let mut asm = AssemblerX64::new();
        asm.nop();
        let lbl = asm.create_and_bind_label();
        asm.retq();
        let finalized = asm.finalize(1);
        assert_eq!(finalized.offset(lbl), Some(1));
    }
}
