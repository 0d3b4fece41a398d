use crate::code::{CallTarget, GcMap, RelocationKind};
use crate::cpu::{Reg, FReg, RAX, RBP, RCX, RDX, RSP};
use crate::frame::FrameMap;
use crate::masm::{CondCode, EmbeddedConstant, MacroAssembler, Mem};
use crate::mode::{MachineMode, ValueKind};
use crate::operand::{AnyReg, ConstValue, ObjectConstant};
use vela_asm::x64::{Address as AsmAddress, Condition, Immediate, ScaleFactor};
pub use vela_asm::x64::AssemblerX64 as Assembler;

pub fn convert_into_condition(cond: CondCode) -> Condition {
    match cond {
        CondCode::Zero => Condition::Zero,
        CondCode::NonZero => Condition::NotZero,
        CondCode::Equal => Condition::Equal,
        CondCode::NotEqual => Condition::NotEqual,
        CondCode::Greater => Condition::Greater,
        CondCode::GreaterEq => Condition::GreaterOrEqual,
        CondCode::Less => Condition::Less,
        CondCode::LessEq => Condition::LessOrEqual,
        CondCode::UnsignedGreater => Condition::Above,
        CondCode::UnsignedGreaterEq => Condition::AboveOrEqual,
        CondCode::UnsignedLess => Condition::Below,
        CondCode::UnsignedLessEq => Condition::BelowOrEqual,
    }
}

/// Condition mapping after a `ucomiss`/`ucomisd`, which reports through
/// the unsigned flags. An unordered result additionally raises parity;
/// callers decide what NaN means.
pub fn float_condition(cond: CondCode) -> Condition {
    match cond {
        CondCode::Equal => Condition::Equal,
        CondCode::NotEqual => Condition::NotEqual,
        CondCode::Greater => Condition::Above,
        CondCode::GreaterEq => Condition::AboveOrEqual,
        CondCode::Less => Condition::Below,
        CondCode::LessEq => Condition::BelowOrEqual,
        _ => panic!("condition {:?} not valid for float compare", cond),
    }
}

pub fn address_from_mem(mem: Mem) -> AsmAddress {
    match mem {
        Mem::Local(offset) => AsmAddress::offset(RBP.into(), offset),
        Mem::Base(base, disp) => AsmAddress::offset(base.into(), disp),
        Mem::Index(base, index, scale, disp) => AsmAddress::array(
            base.into(),
            index.into(),
            ScaleFactor::from_size(scale),
            disp,
        ),
        Mem::Outgoing(offset) => AsmAddress::offset(RSP.into(), offset),
    }
}

impl MacroAssembler {
    pub fn create_assembler() -> Assembler {
        Assembler::new()
    }

    pub fn prolog(&mut self, frame: &FrameMap) {
        debug_assert!(frame.frame_size() % 16 == 0);

        self.asm.pushq_r(RBP.into());
        self.asm.movq_rr(RBP.into(), RSP.into());

        let alloc = frame.allocation_size();
        if alloc > 0 {
            self.asm.subq_ri(RSP.into(), Immediate(alloc as i64));
        }

        self.bang_stack(frame);

        for &(reg, offset) in frame.callee_saved() {
            self.asm
                .movq_ar(AsmAddress::offset(RBP.into(), offset), reg.into());
        }
    }

    /// Touches one word per traversed guard page so the OS trap fires
    /// before the frame is used.
    pub fn bang_stack(&mut self, frame: &FrameMap) {
        for offset in frame.bang_offsets() {
            self.asm
                .movq_ar(AsmAddress::offset(RSP.into(), -offset), RAX.into());
        }
    }

    pub fn epilog(&mut self, frame: &FrameMap) {
        self.epilog_without_return(frame);
        self.asm.retq();
    }

    pub fn epilog_without_return(&mut self, frame: &FrameMap) {
        for &(reg, offset) in frame.callee_saved() {
            self.asm
                .movq_ra(reg.into(), AsmAddress::offset(RBP.into(), offset));
        }

        self.asm.movq_rr(RSP.into(), RBP.into());
        self.asm.popq_r(RBP.into());
    }

    /// Safepoint poll: a load through the thread anchor register. The
    /// table entry records the poll instruction itself so the runtime
    /// can map a faulting address back to the gc map.
    pub fn safepoint(&mut self, gc_map: GcMap) {
        let scratch = self.scratch();
        let thread = self.target.thread_register;
        let offset = self.target.safepoint_offset;

        let pos = self.pos() as u32;
        self.asm
            .movq_ra(scratch.into(), AsmAddress::offset(thread.into(), offset));
        self.safepoints.insert(pos, gc_map);
    }

    pub fn copy_reg(&mut self, mode: MachineMode, dest: Reg, src: Reg) {
        if dest == src {
            return;
        }

        if mode.is64() {
            self.asm.movq_rr(dest.into(), src.into());
        } else {
            self.asm.movl_rr(dest.into(), src.into());
        }
    }

    pub fn copy_freg(&mut self, mode: MachineMode, dest: FReg, src: FReg) {
        if dest == src {
            return;
        }

        match mode {
            MachineMode::Float32 => self.asm.movss_rr(dest.into(), src.into()),
            MachineMode::Float64 => self.asm.movsd_rr(dest.into(), src.into()),
            _ => unreachable!(),
        }
    }

    pub fn copy(&mut self, mode: MachineMode, dest: AnyReg, src: AnyReg) {
        assert!(dest.is_reg() == src.is_reg());

        if dest.is_reg() {
            self.copy_reg(mode, dest.reg(), src.reg());
        } else {
            self.copy_freg(mode, dest.freg(), src.freg());
        }
    }

    pub fn load_int_const(&mut self, mode: MachineMode, dest: Reg, imm: i64) {
        if imm == 0 {
            self.asm.xorl_rr(dest.into(), dest.into());
            return;
        }

        if mode.is64() {
            self.asm.movq_ri(dest.into(), Immediate(imm));
        } else {
            self.asm.movl_ri(dest.into(), Immediate(imm as i32 as i64));
        }
    }

    /// Constant load that leaves the flags untouched, for use between
    /// a compare and the conditional move consuming it.
    pub fn load_int_const_keep_flags(&mut self, mode: MachineMode, dest: Reg, imm: i64) {
        if mode.is64() {
            self.asm.movq_ri(dest.into(), Immediate(imm));
        } else {
            self.asm.movl_ri(dest.into(), Immediate(imm as i32 as i64));
        }
    }

    pub fn load_float_const(&mut self, mode: MachineMode, dest: FReg, bits: u64) {
        if bits == 0 {
            match mode {
                MachineMode::Float32 => self.asm.xorps_rr(dest.into(), dest.into()),
                MachineMode::Float64 => self.asm.xorpd_rr(dest.into(), dest.into()),
                _ => unreachable!(),
            }
            return;
        }

        match mode {
            MachineMode::Float32 => {
                let label = self.emit_const(EmbeddedConstant::Float32(bits as u32));
                self.asm.movss_ra(dest.into(), AsmAddress::rip(0));
                let disp_pos = self.pos() as u32 - 4;
                self.record_const_fixup(disp_pos, label);
            }

            MachineMode::Float64 => {
                let label = self.emit_const(EmbeddedConstant::Float64(bits));
                self.asm.movsd_ra(dest.into(), AsmAddress::rip(0));
                let disp_pos = self.pos() as u32 - 4;
                self.record_const_fixup(disp_pos, label);
            }

            _ => unreachable!(),
        }
    }

    /// Materializes an object constant under the configured policy:
    /// inline 64-bit immediate with a relocation on the immediate
    /// bytes, or a constant-pool load with the relocation on the slot.
    pub fn load_object_const(&mut self, dest: Reg, value: ObjectConstant) {
        match value {
            ObjectConstant::Null => {
                self.asm.xorl_rr(dest.into(), dest.into());
            }

            ObjectConstant::Handle(handle) => {
                if self.target.inline_objects {
                    self.asm
                        .movq_ri64(dest.into(), Immediate(handle.0 as i64));
                    let imm_pos = self.pos() as u32 - 8;
                    self.record_relocation(imm_pos, RelocationKind::ObjectHandle(handle));
                } else {
                    let label = self.emit_const(EmbeddedConstant::ObjectRef(handle));
                    self.asm.movq_ra(dest.into(), AsmAddress::rip(0));
                    let disp_pos = self.pos() as u32 - 4;
                    self.record_const_fixup(disp_pos, label);
                }
            }
        }
    }

    pub fn load_mem(&mut self, kind: ValueKind, dest: AnyReg, mem: Mem) {
        let address = address_from_mem(mem);

        match kind {
            ValueKind::Boolean => self.asm.movzxb_ra(dest.reg().into(), address),
            ValueKind::Byte => self.asm.movsxbl_ra(dest.reg().into(), address),
            ValueKind::Char => self.asm.movzxw_ra(dest.reg().into(), address),
            ValueKind::Short => self.asm.movsxwl_ra(dest.reg().into(), address),
            ValueKind::Int => self.asm.movl_ra(dest.reg().into(), address),
            ValueKind::Long | ValueKind::Object | ValueKind::Word => {
                self.asm.movq_ra(dest.reg().into(), address)
            }
            ValueKind::Float => self.asm.movss_ra(dest.freg().into(), address),
            ValueKind::Double => self.asm.movsd_ra(dest.freg().into(), address),
        }
    }

    pub fn store_mem(&mut self, kind: ValueKind, mem: Mem, src: AnyReg) {
        let address = address_from_mem(mem);

        match kind {
            ValueKind::Boolean | ValueKind::Byte => self.asm.movb_ar(address, src.reg().into()),
            ValueKind::Char | ValueKind::Short => self.asm.movw_ar(address, src.reg().into()),
            ValueKind::Int => self.asm.movl_ar(address, src.reg().into()),
            ValueKind::Long | ValueKind::Object | ValueKind::Word => {
                self.asm.movq_ar(address, src.reg().into())
            }
            ValueKind::Float => self.asm.movss_ar(address, src.freg().into()),
            ValueKind::Double => self.asm.movsd_ar(address, src.freg().into()),
        }
    }

    pub fn store_const(&mut self, kind: ValueKind, mem: Mem, value: ConstValue) {
        let scratch = self.scratch();

        match kind {
            ValueKind::Boolean | ValueKind::Byte => {
                let address = address_from_mem(mem);
                self.asm
                    .movb_ai(address, Immediate((value.int() & 0xFF) as i64));
            }

            ValueKind::Char | ValueKind::Short => {
                self.load_int_const(MachineMode::Int32, scratch, value.int() as i64);
                self.store_mem(kind, mem, scratch.into());
            }

            ValueKind::Int => {
                let address = address_from_mem(mem);
                self.asm.movl_ai(address, Immediate(value.int() as i64));
            }

            ValueKind::Float => {
                let address = address_from_mem(mem);
                self.asm
                    .movl_ai(address, Immediate(value.float_bits() as i64));
            }

            ValueKind::Long | ValueKind::Word => {
                let v = value.long();
                if Immediate(v).is_int32() {
                    let address = address_from_mem(mem);
                    self.asm.movq_ai(address, Immediate(v));
                } else {
                    self.load_int_const(MachineMode::Int64, scratch, v);
                    self.store_mem(kind, mem, scratch.into());
                }
            }

            ValueKind::Double => {
                let bits = value.double_bits() as i64;
                if Immediate(bits).is_int32() {
                    let address = address_from_mem(mem);
                    self.asm.movq_ai(address, Immediate(bits));
                } else {
                    self.asm.movq_ri(scratch.into(), Immediate(bits));
                    let address = address_from_mem(mem);
                    self.asm.movq_ar(address, scratch.into());
                }
            }

            ValueKind::Object => match value.object() {
                ObjectConstant::Null => {
                    let address = address_from_mem(mem);
                    self.asm.movq_ai(address, Immediate(0));
                }
                obj => {
                    self.load_object_const(scratch, obj);
                    self.store_mem(kind, mem, scratch.into());
                }
            },
        }
    }

    fn two_operand_setup(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, rhs: Reg) {
        assert!(
            dest != rhs || dest == lhs,
            "destination would clobber right operand"
        );
        self.copy_reg(mode, dest, lhs);
    }

    pub fn int_add(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, rhs: Reg) {
        self.two_operand_setup(mode, dest, lhs, rhs);

        if mode.is64() {
            self.asm.addq_rr(dest.into(), rhs.into());
        } else {
            self.asm.addl_rr(dest.into(), rhs.into());
        }
    }

    pub fn int_add_imm(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, value: i64) {
        self.copy_reg(mode, dest, lhs);

        if mode.is64() {
            self.asm.addq_ri(dest.into(), Immediate(value));
        } else {
            self.asm.addl_ri(dest.into(), Immediate(value));
        }
    }

    pub fn int_sub(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, rhs: Reg) {
        self.two_operand_setup(mode, dest, lhs, rhs);

        if mode.is64() {
            self.asm.subq_rr(dest.into(), rhs.into());
        } else {
            self.asm.subl_rr(dest.into(), rhs.into());
        }
    }

    pub fn int_sub_imm(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, value: i64) {
        self.copy_reg(mode, dest, lhs);

        if mode.is64() {
            self.asm.subq_ri(dest.into(), Immediate(value));
        } else {
            self.asm.subl_ri(dest.into(), Immediate(value));
        }
    }

    pub fn int_mul(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, rhs: Reg) {
        self.two_operand_setup(mode, dest, lhs, rhs);

        if mode.is64() {
            self.asm.imulq_rr(dest.into(), rhs.into());
        } else {
            self.asm.imull_rr(dest.into(), rhs.into());
        }
    }

    pub fn int_and(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, rhs: Reg) {
        self.two_operand_setup(mode, dest, lhs, rhs);

        if mode.is64() {
            self.asm.andq_rr(dest.into(), rhs.into());
        } else {
            self.asm.andl_rr(dest.into(), rhs.into());
        }
    }

    pub fn int_or(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, rhs: Reg) {
        self.two_operand_setup(mode, dest, lhs, rhs);

        if mode.is64() {
            self.asm.orq_rr(dest.into(), rhs.into());
        } else {
            self.asm.orl_rr(dest.into(), rhs.into());
        }
    }

    pub fn int_xor(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, rhs: Reg) {
        self.two_operand_setup(mode, dest, lhs, rhs);

        if mode.is64() {
            self.asm.xorq_rr(dest.into(), rhs.into());
        } else {
            self.asm.xorl_rr(dest.into(), rhs.into());
        }
    }

    pub fn int_neg(&mut self, mode: MachineMode, dest: Reg, src: Reg) {
        self.copy_reg(mode, dest, src);

        if mode.is64() {
            self.asm.negq(dest.into());
        } else {
            self.asm.negl(dest.into());
        }
    }

    pub fn int_not(&mut self, mode: MachineMode, dest: Reg, src: Reg) {
        self.copy_reg(mode, dest, src);

        if mode.is64() {
            self.asm.notq(dest.into());
        } else {
            self.asm.notl(dest.into());
        }
    }

    /// Signed division. The convention is fixed by the hardware:
    /// dividend and quotient live in rax, the sign extension in rdx.
    /// `MIN / -1` is detected up front and yields `MIN` without
    /// trapping. Returns the offset of the divide instruction for
    /// implicit-exception bookkeeping.
    pub fn int_div(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, rhs: Reg) -> u32 {
        self.div_common(mode, dest, lhs, rhs, RAX)
    }

    /// Signed remainder; `MIN % -1` yields 0 without trapping.
    pub fn int_mod(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, rhs: Reg) -> u32 {
        self.div_common(mode, dest, lhs, rhs, RDX)
    }

    fn div_common(
        &mut self,
        mode: MachineMode,
        dest: Reg,
        lhs: Reg,
        rhs: Reg,
        result: Reg,
    ) -> u32 {
        assert_eq!(lhs, RAX, "dividend must be in rax");
        assert_eq!(dest, result, "destination pinned by division convention");
        assert!(rhs != RAX && rhs != RDX, "divisor would be clobbered");
        assert!(rhs != self.scratch());

        let lbl_div = self.create_label();
        let lbl_done = self.create_label();
        let scratch = self.scratch();

        if mode.is64() {
            self.asm
                .movq_ri(scratch.into(), Immediate(i64::min_value()));
            self.asm.cmpq_rr(RAX.into(), scratch.into());
        } else {
            self.asm
                .cmpl_ri(RAX.into(), Immediate(i32::min_value() as i64));
        }
        self.asm.jcc(Condition::NotEqual, lbl_div);

        if mode.is64() {
            self.asm.cmpq_ri(rhs.into(), Immediate(-1));
        } else {
            self.asm.cmpl_ri(rhs.into(), Immediate(-1));
        }
        self.asm.jcc(Condition::NotEqual, lbl_div);

        // overflow case: quotient is MIN (already in rax), remainder 0
        if result == RDX {
            self.asm.xorl_rr(RDX.into(), RDX.into());
        }
        self.asm.jmp(lbl_done);

        self.bind_label(lbl_div);

        if mode.is64() {
            self.asm.cqo();
        } else {
            self.asm.cdq();
        }

        let div_pos = self.pos() as u32;

        if mode.is64() {
            self.asm.idivq_r(rhs.into());
        } else {
            self.asm.idivl_r(rhs.into());
        }

        self.bind_label(lbl_done);

        div_pos
    }

    /// Unsigned division; no overflow case exists.
    pub fn int_udiv(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, rhs: Reg) -> u32 {
        self.udiv_common(mode, dest, lhs, rhs, RAX)
    }

    pub fn int_umod(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, rhs: Reg) -> u32 {
        self.udiv_common(mode, dest, lhs, rhs, RDX)
    }

    fn udiv_common(
        &mut self,
        mode: MachineMode,
        dest: Reg,
        lhs: Reg,
        rhs: Reg,
        result: Reg,
    ) -> u32 {
        assert_eq!(lhs, RAX, "dividend must be in rax");
        assert_eq!(dest, result, "destination pinned by division convention");
        assert!(rhs != RAX && rhs != RDX, "divisor would be clobbered");

        self.asm.xorl_rr(RDX.into(), RDX.into());

        let div_pos = self.pos() as u32;

        if mode.is64() {
            self.asm.divq_r(rhs.into());
        } else {
            self.asm.divl_r(rhs.into());
        }

        div_pos
    }

    pub fn int_shl(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, count: Reg) {
        assert_eq!(count, RCX, "shift count must be in rcx");
        assert!(dest != RCX, "destination would clobber shift count");
        self.copy_reg(mode, dest, lhs);

        if mode.is64() {
            self.asm.shlq_r(dest.into());
        } else {
            self.asm.shll_r(dest.into());
        }
    }

    pub fn int_shr(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, count: Reg) {
        assert_eq!(count, RCX, "shift count must be in rcx");
        assert!(dest != RCX, "destination would clobber shift count");
        self.copy_reg(mode, dest, lhs);

        if mode.is64() {
            self.asm.shrq_r(dest.into());
        } else {
            self.asm.shrl_r(dest.into());
        }
    }

    pub fn int_sar(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, count: Reg) {
        assert_eq!(count, RCX, "shift count must be in rcx");
        assert!(dest != RCX, "destination would clobber shift count");
        self.copy_reg(mode, dest, lhs);

        if mode.is64() {
            self.asm.sarq_r(dest.into());
        } else {
            self.asm.sarl_r(dest.into());
        }
    }

    pub fn int_shl_imm(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, count: i32) {
        self.copy_reg(mode, dest, lhs);
        let count = count & if mode.is64() { 63 } else { 31 };

        if mode.is64() {
            self.asm.shlq_ri(dest.into(), Immediate(count as i64));
        } else {
            self.asm.shll_ri(dest.into(), Immediate(count as i64));
        }
    }

    pub fn int_shr_imm(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, count: i32) {
        self.copy_reg(mode, dest, lhs);
        let count = count & if mode.is64() { 63 } else { 31 };

        if mode.is64() {
            self.asm.shrq_ri(dest.into(), Immediate(count as i64));
        } else {
            self.asm.shrl_ri(dest.into(), Immediate(count as i64));
        }
    }

    pub fn int_sar_imm(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, count: i32) {
        self.copy_reg(mode, dest, lhs);
        let count = count & if mode.is64() { 63 } else { 31 };

        if mode.is64() {
            self.asm.sarq_ri(dest.into(), Immediate(count as i64));
        } else {
            self.asm.sarl_ri(dest.into(), Immediate(count as i64));
        }
    }

    fn two_operand_setup_freg(&mut self, mode: MachineMode, dest: FReg, lhs: FReg, rhs: FReg) {
        assert!(
            dest != rhs || dest == lhs,
            "destination would clobber right operand"
        );
        self.copy_freg(mode, dest, lhs);
    }

    pub fn float_add(&mut self, mode: MachineMode, dest: FReg, lhs: FReg, rhs: FReg) {
        self.two_operand_setup_freg(mode, dest, lhs, rhs);

        match mode {
            MachineMode::Float32 => self.asm.addss_rr(dest.into(), rhs.into()),
            MachineMode::Float64 => self.asm.addsd_rr(dest.into(), rhs.into()),
            _ => unreachable!(),
        }
    }

    pub fn float_sub(&mut self, mode: MachineMode, dest: FReg, lhs: FReg, rhs: FReg) {
        self.two_operand_setup_freg(mode, dest, lhs, rhs);

        match mode {
            MachineMode::Float32 => self.asm.subss_rr(dest.into(), rhs.into()),
            MachineMode::Float64 => self.asm.subsd_rr(dest.into(), rhs.into()),
            _ => unreachable!(),
        }
    }

    pub fn float_mul(&mut self, mode: MachineMode, dest: FReg, lhs: FReg, rhs: FReg) {
        self.two_operand_setup_freg(mode, dest, lhs, rhs);

        match mode {
            MachineMode::Float32 => self.asm.mulss_rr(dest.into(), rhs.into()),
            MachineMode::Float64 => self.asm.mulsd_rr(dest.into(), rhs.into()),
            _ => unreachable!(),
        }
    }

    pub fn float_div(&mut self, mode: MachineMode, dest: FReg, lhs: FReg, rhs: FReg) {
        self.two_operand_setup_freg(mode, dest, lhs, rhs);

        match mode {
            MachineMode::Float32 => self.asm.divss_rr(dest.into(), rhs.into()),
            MachineMode::Float64 => self.asm.divsd_rr(dest.into(), rhs.into()),
            _ => unreachable!(),
        }
    }

    pub fn float_sqrt(&mut self, mode: MachineMode, dest: FReg, src: FReg) {
        match mode {
            MachineMode::Float32 => self.asm.sqrtss_rr(dest.into(), src.into()),
            MachineMode::Float64 => self.asm.sqrtsd_rr(dest.into(), src.into()),
            _ => unreachable!(),
        }
    }

    /// Negation by flipping the sign bit with a constant-pool mask.
    pub fn float_neg(&mut self, mode: MachineMode, dest: FReg, src: FReg) {
        let mask: u128 = match mode {
            MachineMode::Float32 => 1 << 31,
            MachineMode::Float64 => 1 << 63,
            _ => unreachable!(),
        };

        let label = self.emit_const(EmbeddedConstant::Int128(mask));
        self.copy_freg(mode, dest, src);

        match mode {
            MachineMode::Float32 => self.asm.xorps_ra(dest.into(), AsmAddress::rip(0)),
            MachineMode::Float64 => self.asm.xorpd_ra(dest.into(), AsmAddress::rip(0)),
            _ => unreachable!(),
        }

        let disp_pos = self.pos() as u32 - 4;
        self.record_const_fixup(disp_pos, label);
    }

    pub fn cmp_reg(&mut self, mode: MachineMode, lhs: Reg, rhs: Reg) {
        match mode {
            MachineMode::Int8 | MachineMode::Int16 | MachineMode::Int32 => {
                self.asm.cmpl_rr(lhs.into(), rhs.into())
            }
            MachineMode::Int64 | MachineMode::Ptr => self.asm.cmpq_rr(lhs.into(), rhs.into()),
            _ => unreachable!(),
        }
    }

    pub fn cmp_reg_imm(&mut self, mode: MachineMode, lhs: Reg, imm: i32) {
        if mode.is64() {
            self.asm.cmpq_ri(lhs.into(), Immediate(imm as i64));
        } else {
            self.asm.cmpl_ri(lhs.into(), Immediate(imm as i64));
        }
    }

    pub fn cmp_reg_imm64(&mut self, mode: MachineMode, lhs: Reg, imm: i64) {
        if Immediate(imm).is_int32() {
            self.cmp_reg_imm(mode, lhs, imm as i32);
        } else {
            let scratch = self.scratch();
            assert!(lhs != scratch);
            self.asm.movq_ri(scratch.into(), Immediate(imm));
            self.asm.cmpq_rr(lhs.into(), scratch.into());
        }
    }

    pub fn cmp_zero(&mut self, mode: MachineMode, reg: Reg) {
        if mode.is64() {
            self.asm.testq_rr(reg.into(), reg.into());
        } else {
            self.asm.testl_rr(reg.into(), reg.into());
        }
    }

    pub fn float_cmp(&mut self, mode: MachineMode, lhs: FReg, rhs: FReg) {
        match mode {
            MachineMode::Float32 => self.asm.ucomiss_rr(lhs.into(), rhs.into()),
            MachineMode::Float64 => self.asm.ucomisd_rr(lhs.into(), rhs.into()),
            _ => unreachable!(),
        }
    }

    pub fn set_bool(&mut self, dest: Reg, cond: CondCode) {
        self.asm.setcc_r(convert_into_condition(cond), dest.into());
        self.asm.movzxb_rr(dest.into(), dest.into());
    }

    /// Three-way signed compare: dest becomes -1, 0 or 1.
    pub fn cmp_ordering(&mut self, mode: MachineMode, dest: Reg, lhs: Reg, rhs: Reg) {
        assert!(dest != lhs && dest != rhs, "destination aliases an input");
        let scratch = self.scratch();
        assert!(lhs != scratch && rhs != scratch);

        self.asm.xorl_rr(dest.into(), dest.into());
        self.cmp_reg(mode, lhs, rhs);
        // the result is a 32-bit ordering value whatever the input width
        self.set_bool(dest, CondCode::NotEqual);
        self.load_int_const_keep_flags(MachineMode::Int32, scratch, -1);
        self.cmov(MachineMode::Int32, CondCode::Less, dest, scratch);
    }

    /// Three-way float compare; `unordered_result` (-1 or 1) is
    /// produced when either input is NaN.
    pub fn float_cmp_ordering(
        &mut self,
        mode: MachineMode,
        dest: Reg,
        lhs: FReg,
        rhs: FReg,
        unordered_result: i32,
    ) {
        assert!(unordered_result == -1 || unordered_result == 1);
        let scratch = self.scratch();
        assert!(dest != scratch);

        let lbl_unordered = self.create_label();
        let lbl_done = self.create_label();

        self.asm.xorl_rr(dest.into(), dest.into());
        self.float_cmp(mode, lhs, rhs);
        self.jump_if_parity(lbl_unordered);
        self.set_bool(dest, CondCode::NotEqual);
        self.load_int_const_keep_flags(MachineMode::Int32, scratch, -1);
        self.cmov(MachineMode::Int32, CondCode::UnsignedLess, dest, scratch);
        self.jump(lbl_done);

        self.bind_label(lbl_unordered);
        self.load_int_const(MachineMode::Int32, dest, unordered_result as i64);
        self.bind_label(lbl_done);
    }

    pub fn cmov(&mut self, mode: MachineMode, cond: CondCode, dest: Reg, src: Reg) {
        let condition = convert_into_condition(cond);

        if mode.is64() {
            self.asm.cmovq(condition, dest.into(), src.into());
        } else {
            self.asm.cmovl(condition, dest.into(), src.into());
        }
    }

    pub fn cmov_mem(&mut self, mode: MachineMode, cond: CondCode, dest: Reg, src: Mem) {
        // load into scratch first, then a register conditional move
        let scratch = self.scratch();
        self.load_mem(
            if mode.is64() {
                ValueKind::Long
            } else {
                ValueKind::Int
            },
            scratch.into(),
            src,
        );
        self.cmov(mode, cond, dest, scratch);
    }

    pub fn jump_if(&mut self, cond: CondCode, target: vela_asm::Label) {
        self.asm.jcc(convert_into_condition(cond), target);
    }

    pub fn jump_if_parity(&mut self, target: vela_asm::Label) {
        self.asm.jcc(Condition::Parity, target);
    }

    pub fn jump_if_no_parity(&mut self, target: vela_asm::Label) {
        self.asm.jcc(Condition::NoParity, target);
    }

    pub fn jump_float(&mut self, cond: CondCode, target: vela_asm::Label) {
        self.asm.jcc(float_condition(cond), target);
    }

    pub fn jump(&mut self, target: vela_asm::Label) {
        self.asm.jmp(target);
    }

    pub fn jump_reg(&mut self, reg: Reg) {
        self.asm.jmp_r(reg.into());
    }

    pub fn jump_mem(&mut self, mem: Mem) {
        self.asm.jmp_a(address_from_mem(mem));
    }

    pub fn lea(&mut self, dest: Reg, mem: Mem) {
        self.asm.lea(dest.into(), address_from_mem(mem));
    }

    /// Materializes the address of the next instruction.
    pub fn load_pc(&mut self, dest: Reg) {
        self.asm.lea(dest.into(), AsmAddress::rip(0));
    }

    /// Loads the address of a later-emitted constant or table.
    pub fn lea_const(&mut self, dest: Reg, label: vela_asm::Label) {
        self.asm.lea(dest.into(), AsmAddress::rip(0));
        let disp_pos = self.pos() as u32 - 4;
        self.record_const_fixup(disp_pos, label);
    }

    pub fn int_extend_byte(&mut self, dest: Reg, src: Reg) {
        self.asm.movsxbl_rr(dest.into(), src.into());
    }

    pub fn int_extend_short(&mut self, dest: Reg, src: Reg) {
        self.asm.movsxwl_rr(dest.into(), src.into());
    }

    pub fn int_to_char(&mut self, dest: Reg, src: Reg) {
        self.asm.movzxw_rr(dest.into(), src.into());
    }

    pub fn int_to_long(&mut self, dest: Reg, src: Reg) {
        self.asm.movsxlq_rr(dest.into(), src.into());
    }

    pub fn long_to_int(&mut self, dest: Reg, src: Reg) {
        // 32-bit move truncates and clears the upper half
        self.asm.movl_rr(dest.into(), src.into());
    }

    pub fn int_to_float(
        &mut self,
        dest_mode: MachineMode,
        dest: FReg,
        src_mode: MachineMode,
        src: Reg,
    ) {
        match (dest_mode, src_mode.is64()) {
            (MachineMode::Float32, false) => self.asm.cvtsi2ssd_rr(dest.into(), src.into()),
            (MachineMode::Float32, true) => self.asm.cvtsi2ssq_rr(dest.into(), src.into()),
            (MachineMode::Float64, false) => self.asm.cvtsi2sdd_rr(dest.into(), src.into()),
            (MachineMode::Float64, true) => self.asm.cvtsi2sdq_rr(dest.into(), src.into()),
            _ => unreachable!(),
        }
    }

    /// Truncating conversion; out-of-range values produce the MIN
    /// sentinel the conversion stubs correct afterwards.
    pub fn float_to_int_trunc(
        &mut self,
        dest_mode: MachineMode,
        dest: Reg,
        src_mode: MachineMode,
        src: FReg,
    ) {
        match (src_mode, dest_mode.is64()) {
            (MachineMode::Float32, false) => self.asm.cvttss2sid_rr(dest.into(), src.into()),
            (MachineMode::Float32, true) => self.asm.cvttss2siq_rr(dest.into(), src.into()),
            (MachineMode::Float64, false) => self.asm.cvttsd2sid_rr(dest.into(), src.into()),
            (MachineMode::Float64, true) => self.asm.cvttsd2siq_rr(dest.into(), src.into()),
            _ => unreachable!(),
        }
    }

    pub fn float_to_double(&mut self, dest: FReg, src: FReg) {
        self.asm.cvtss2sd_rr(dest.into(), src.into());
    }

    pub fn double_to_float(&mut self, dest: FReg, src: FReg) {
        self.asm.cvtsd2ss_rr(dest.into(), src.into());
    }

    pub fn float_as_int(&mut self, dest: Reg, src: FReg) {
        self.asm.movd_rx(dest.into(), src.into());
    }

    pub fn int_as_float(&mut self, dest: FReg, src: Reg) {
        self.asm.movd_xr(dest.into(), src.into());
    }

    pub fn double_as_long(&mut self, dest: Reg, src: FReg) {
        self.asm.movq_rx(dest.into(), src.into());
    }

    pub fn long_as_double(&mut self, dest: FReg, src: Reg) {
        self.asm.movq_xr(dest.into(), src.into());
    }

    /// Compare-and-swap; expected value and result are pinned to rax by
    /// the hardware. The three registers must be pairwise distinct or
    /// the comparison would be silently corrupted.
    pub fn compare_and_swap(&mut self, mode: MachineMode, addr: Reg, expected: Reg, new_value: Reg) {
        assert_eq!(expected, RAX, "compare-and-swap expects old value in rax");
        assert!(
            addr != expected && addr != new_value && expected != new_value,
            "compare-and-swap operands must be pairwise distinct"
        );

        let address = AsmAddress::offset(addr.into(), 0);

        if mode.is64() {
            self.asm.lock_cmpxchgq_ar(address, new_value.into());
        } else {
            self.asm.lock_cmpxchgl_ar(address, new_value.into());
        }
    }

    fn align_patchable_call_site(&mut self) {
        // the 4 displacement bytes of `call rel32` must not straddle an
        // unaligned boundary so the target can be patched atomically
        while (self.pos() + 1) % 4 != 0 {
            self.asm.nop();
        }
    }

    /// Patchable direct call: displacement zero, identity carried by a
    /// relocation record at the return address.
    pub fn patchable_call(&mut self, target: CallTarget) -> u32 {
        self.align_patchable_call_site();
        self.asm.call_rel32(0);
        let ra = self.pos() as u32;
        self.record_relocation(ra, RelocationKind::DirectCall(target));
        ra
    }

    pub fn call_reg(&mut self, reg: Reg) {
        self.asm.call_r(reg.into());
    }

    /// Call to a C function at a known absolute address.
    pub fn native_call(&mut self, address: u64) {
        let scratch = self.scratch();
        self.asm
            .movq_ri(scratch.into(), Immediate(address as i64));
        self.asm.call_r(scratch.into());
    }

    /// Explicit null check: a faulting load through the pointer.
    /// Returns the offset of the load for implicit-exception records.
    pub fn null_check(&mut self, reg: Reg) -> u32 {
        let scratch = self.scratch();
        let pos = self.pos() as u32;
        self.asm
            .movq_ra(scratch.into(), AsmAddress::offset(reg.into(), 0));
        pos
    }

    pub fn align_with_nops(&mut self, alignment: usize) {
        while self.pos() % alignment != 0 {
            self.asm.nop();
        }
    }

    pub fn nop(&mut self) {
        self.asm.nop();
    }

    /// Trap filler; keeps disassemblers and return-address scans from
    /// running past the end of a no-return sequence.
    pub fn int3(&mut self) {
        self.asm.int3();
    }

    pub fn push_reg(&mut self, reg: Reg) {
        self.asm.pushq_r(reg.into());
    }

    pub fn pop_reg(&mut self, reg: Reg) {
        self.asm.popq_r(reg.into());
    }

    pub fn ret(&mut self) {
        self.asm.retq();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{R11, RBX};
    use crate::frame::{FrameDescriptor, FrameMap};
    use crate::target::Target;

    fn masm() -> MacroAssembler {
        MacroAssembler::new(Target::default())
    }

    #[test]
    fn test_empty_prolog_epilog() {
        let frame = FrameMap::new(&FrameDescriptor::empty(), &Target::default());
        let mut m = masm();
        m.prolog(&frame);
        m.epilog(&frame);

        // push rbp; mov rbp, rsp; mov rsp, rbp; pop rbp; ret
        assert_eq!(
            m.data(),
            vec![0x55, 0x48, 0x89, 0xE5, 0x48, 0x89, 0xEC, 0x5D, 0xC3]
        );
    }

    #[test]
    fn test_prolog_allocates_frame() {
        let desc = FrameDescriptor {
            spill_slots: 2,
            outgoing_slots: 0,
            callee_saved: Vec::new(),
        };
        let frame = FrameMap::new(&desc, &Target::default());
        let mut m = masm();
        m.prolog(&frame);

        // push rbp; mov rbp, rsp; sub rsp, 16
        assert_eq!(
            m.data(),
            vec![0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x10]
        );
    }

    #[test]
    fn test_load_int_const_zero_uses_xor() {
        let mut m = masm();
        m.load_int_const(MachineMode::Int64, RBX, 0);
        assert_eq!(m.data(), vec![0x31, 0xDB]);
    }

    #[test]
    fn test_safepoint_records_poll_position() {
        let mut m = masm();
        m.nop();
        m.safepoint(GcMap::empty());
        let descriptor = m.code(16);

        assert_eq!(descriptor.safepoints.len(), 1);
        assert!(descriptor.safepoints.get(1).is_some());
    }

    #[test]
    fn test_patchable_call_alignment() {
        for pad in 0..4 {
            let mut m = masm();
            for _ in 0..pad {
                m.nop();
            }
            let ra = m.patchable_call(CallTarget::Runtime(
                crate::code::RuntimeEntry::SafepointHandler,
            ));
            let data = m.data();

            // displacement starts right after the opcode byte, aligned
            assert_eq!((ra as usize - 4) % 4, 0);
            assert_eq!(data[ra as usize - 5], 0xE8);
            assert_eq!(&data[ra as usize - 4..ra as usize], &[0, 0, 0, 0]);
        }
    }

    #[test]
    fn test_div_min_sequence_smoke() {
        let mut m = masm();
        let pos = m.int_div(MachineMode::Int32, RAX, RAX, RBX);
        let data = m.data();

        // divide instruction is at the reported offset
        assert_eq!(&data[pos as usize..pos as usize + 2], &[0xF7, 0xFB]);
        // the sequence starts with the MIN comparison
        assert_eq!(data[0], 0x3D);
        assert_eq!(
            i32::from_le_bytes(data[1..5].try_into().unwrap()),
            i32::min_value()
        );
    }

    #[test]
    #[should_panic]
    fn test_cas_alias_is_fatal() {
        let mut m = masm();
        m.compare_and_swap(MachineMode::Int64, RAX, RAX, RBX);
    }

    #[test]
    #[should_panic]
    fn test_two_operand_alias_is_fatal() {
        let mut m = masm();
        // dest aliases the right operand without being the left one
        m.int_add(MachineMode::Int32, RBX, RAX, RBX);
    }

    #[test]
    fn test_object_const_inline_policy() {
        use crate::operand::{ObjectConstant, ObjectHandle};

        let mut m = masm();
        m.load_object_const(RBX, ObjectConstant::Handle(ObjectHandle(7)));
        let descriptor = m.code(16);

        let (offset, kind) = descriptor.relocations.iter().next().unwrap();
        assert_eq!(
            *kind,
            RelocationKind::ObjectHandle(crate::operand::ObjectHandle(7))
        );
        // relocation points at the 8 immediate bytes of movabs
        assert_eq!(*offset, 2);
        assert_eq!(
            u64::from_le_bytes(descriptor.code[2..10].try_into().unwrap()),
            7
        );
    }

    #[test]
    fn test_object_const_pool_policy() {
        use crate::operand::{ObjectConstant, ObjectHandle};

        let mut target = Target::default();
        target.inline_objects = false;
        let mut m = MacroAssembler::new(target);
        m.load_object_const(RBX, ObjectConstant::Handle(ObjectHandle(7)));
        let descriptor = m.code(16);

        let (offset, kind) = descriptor.relocations.iter().next().unwrap();
        assert_eq!(
            *kind,
            RelocationKind::ObjectHandle(crate::operand::ObjectHandle(7))
        );
        // relocation points at the constant-pool slot, after the load
        assert_eq!(*offset, 8);
        // the rip displacement points at that slot
        let disp = i32::from_le_bytes(descriptor.code[3..7].try_into().unwrap());
        assert_eq!(7 + disp, 8);
    }

    #[test]
    fn test_scratch_register_identity() {
        let m = masm();
        assert_eq!(m.scratch(), R11);
    }

    #[test]
    fn test_cmp_ordering_sequence() {
        let mut m = masm();
        m.cmp_ordering(MachineMode::Int32, RBX, RAX, RCX);

        // xor; cmp; setne+movzx; mov r11d, -1; cmovl
        assert_eq!(
            m.data(),
            vec![
                0x31, 0xDB, 0x39, 0xC8, 0x0F, 0x95, 0xC3, 0x0F, 0xB6, 0xDB, 0x41, 0xBB, 0xFF,
                0xFF, 0xFF, 0xFF, 0x41, 0x0F, 0x4C, 0xDB,
            ]
        );
    }

    #[test]
    fn test_float_cmp_ordering_branches_on_parity() {
        use crate::cpu::{XMM0, XMM1};

        let mut m = masm();
        m.float_cmp_ordering(MachineMode::Float32, RBX, XMM0, XMM1, 1);
        let data = m.data();

        // starts by zeroing the result, then ucomiss
        assert_eq!(&data[..2], &[0x31, 0xDB]);
        assert_eq!(&data[2..4], &[0x0F, 0x2E]);
        // unordered path materializes the caller's NaN result
        assert!(data.windows(5).any(|w| w == [0xBB, 0x01, 0x00, 0x00, 0x00]));
    }
}
