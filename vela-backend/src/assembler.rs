use std::collections::HashMap;

use crate::code::{CallTarget, CodeDescriptor, MarkKind, RuntimeEntry};
use crate::cpu::{Reg, FREG_PARAMS, FREG_RESULT, RAX, REG_PARAMS, REG_RESULT};
use crate::frame::FrameMap;
use crate::lir::{ArithOp, CallKind, ConvertOp, DebugInfo, LirLabel, LirOp, ShiftOp};
use crate::masm::{CondCode, Label, MacroAssembler, Mem};
use crate::mode::{MachineMode, ValueKind};
use crate::operand::{AddressOperand, AnyReg, ConstValue, ObjectConstant, Operand};
use crate::stubs::{StubCache, StubKey};
use crate::target::Target;
use crate::xir::XirSnippet;

#[derive(Copy, Clone, Debug, Default)]
pub struct CompilationFlags {
    pub emit_comments: bool,
}

/// A slow path discovered during the fast-path walk, emitted once after
/// all fast paths. Labels are shared with the fast-path instantiation
/// so the two halves can jump to each other.
pub(crate) struct SlowPathData {
    pub(crate) snippet: XirSnippet,
    pub(crate) labels: Vec<Label>,
    pub(crate) info: Option<DebugInfo>,
}

/// Emission advances through these states strictly forward; no
/// operation moves it backward.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Prologue,
    FastPath,
    SlowPaths,
    Epilogue,
    Finalized,
}

/// Drives one compilation: walks the register-allocated operation
/// stream in order and turns it into machine code plus side tables.
///
/// The assembler is architecture-agnostic and owns the macro assembler
/// by composition; it never reorders or mutates the input stream.
pub struct LirAssembler<'a> {
    pub(crate) masm: MacroAssembler,
    pub(crate) frame: &'a FrameMap,
    pub(crate) stubs: &'a StubCache,
    flags: CompilationFlags,
    state: State,
    lir_labels: HashMap<u32, Label>,
    slow_paths: Vec<SlowPathData>,
    last_compare_float: bool,
}

impl<'a> LirAssembler<'a> {
    pub fn new(
        frame: &'a FrameMap,
        target: Target,
        stubs: &'a StubCache,
        flags: CompilationFlags,
    ) -> LirAssembler<'a> {
        LirAssembler {
            masm: MacroAssembler::new(target),
            frame,
            stubs,
            flags,
            state: State::Prologue,
            lir_labels: HashMap::new(),
            slow_paths: Vec::new(),
            last_compare_float: false,
        }
    }

    pub fn assemble(mut self, ops: &[LirOp]) -> CodeDescriptor {
        self.emit_prolog();

        for op in ops {
            self.emit_op(op);
        }

        self.emit_slow_paths();
        self.finish()
    }

    /// Builds a standalone stub blob from a single snippet, with the
    /// same prologue/body/epilogue discipline as a full method.
    pub fn assemble_stub(mut self, snippet: &XirSnippet) -> CodeDescriptor {
        self.emit_prolog();
        self.emit_xir(snippet, None);
        self.masm.epilog(self.frame);
        self.emit_slow_paths();
        self.finish()
    }

    fn transition(&mut self, from: State, to: State) {
        assert_eq!(self.state, from, "emission states advance strictly forward");
        self.state = to;
    }

    fn emit_prolog(&mut self) {
        self.transition(State::Prologue, State::FastPath);

        if self.flags.emit_comments {
            self.masm.emit_comment("prolog".into());
        }

        self.masm.record_mark(MarkKind::EntryPoint);
        self.masm.prolog(self.frame);
    }

    fn emit_slow_paths(&mut self) {
        self.transition(State::FastPath, State::SlowPaths);

        let slow_paths = std::mem::take(&mut self.slow_paths);

        for path in slow_paths {
            if self.flags.emit_comments {
                self.masm
                    .emit_comment(format!("slow path {}", path.snippet.template.name));
            }

            self.emit_xir_slow_path(&path);
        }
    }

    fn finish(mut self) -> CodeDescriptor {
        self.transition(State::SlowPaths, State::Epilogue);
        self.transition(State::Epilogue, State::Finalized);
        self.masm.code(self.frame.frame_size())
    }

    pub(crate) fn defer_slow_path(&mut self, data: SlowPathData) {
        assert!(
            self.state != State::SlowPaths,
            "slow paths cannot defer further slow paths"
        );
        self.slow_paths.push(data);
    }

    fn lir_label(&mut self, lbl: LirLabel) -> Label {
        let LirLabel(idx) = lbl;

        if let Some(&label) = self.lir_labels.get(&idx) {
            label
        } else {
            let label = self.masm.create_label();
            self.lir_labels.insert(idx, label);
            label
        }
    }

    fn emit_op(&mut self, op: &LirOp) {
        assert_eq!(self.state, State::FastPath);

        match op {
            LirOp::Label(lbl) => {
                let label = self.lir_label(*lbl);
                self.masm.bind_label(label);
            }

            LirOp::Move { src, dest, info } => {
                self.emit_operand_move(src, dest, info.as_ref());
            }

            LirOp::Convert { op, src, dest } => {
                self.emit_convert(*op, src, dest);
            }

            LirOp::Arith {
                op,
                left,
                right,
                dest,
                info,
            } => {
                self.emit_arith(*op, left, right, dest, info.as_ref());
            }

            LirOp::Shift {
                op,
                value,
                count,
                dest,
            } => {
                self.emit_shift(*op, value, count, dest);
            }

            LirOp::Negate { src, dest } => {
                let kind = dest.kind();
                let mode = kind.mode();

                if kind.is_float_kind() {
                    self.masm.float_neg(mode, dest.fp_reg(), src.fp_reg());
                } else {
                    self.masm.int_neg(mode, dest.gp_reg(), src.gp_reg());
                }
            }

            LirOp::Compare { left, right } => {
                self.emit_compare(left, right);
            }

            LirOp::Branch {
                cond,
                target,
                unordered_is_true,
            } => {
                self.emit_branch(*cond, *target, *unordered_is_true);
            }

            LirOp::Jump(target) => {
                let label = self.lir_label(*target);
                self.masm.jump(label);
            }

            LirOp::CondMove {
                cond,
                opr1,
                opr2,
                dest,
            } => {
                self.emit_cond_move(*cond, opr1, opr2, dest);
            }

            LirOp::TableSwitch {
                index,
                temp,
                lo,
                targets,
                default,
            } => {
                self.emit_table_switch(index, temp, *lo, targets, *default);
            }

            LirOp::Call {
                kind,
                args,
                result,
                info,
            } => {
                self.emit_call(kind, args, result.as_ref(), info.as_ref());
            }

            LirOp::CompareAndSwap {
                addr,
                expected,
                new_value,
                result,
            } => {
                let mode = new_value.kind().mode();
                self.masm.compare_and_swap(
                    mode,
                    addr.gp_reg(),
                    expected.gp_reg(),
                    new_value.gp_reg(),
                );
                self.masm.copy_reg(mode, result.gp_reg(), RAX);
            }

            LirOp::Safepoint { info } => {
                self.masm.safepoint(info.gc_map.clone());
            }

            LirOp::Return(value) => {
                if let Some(value) = value {
                    self.move_to_result_register(value);
                }
                self.masm.epilog(self.frame);
            }

            LirOp::Throw { exception, info } => {
                self.emit_raise(RuntimeEntry::ThrowException, exception, info.as_ref());
            }

            LirOp::Unwind { exception } => {
                self.emit_raise(RuntimeEntry::UnwindException, exception, None);
            }

            LirOp::Xir { snippet, info } => {
                self.emit_xir(snippet, info.as_ref());
            }
        }
    }

    fn emit_arith(
        &mut self,
        op: ArithOp,
        left: &Operand,
        right: &Operand,
        dest: &Operand,
        info: Option<&DebugInfo>,
    ) {
        let kind = dest.kind();
        let mode = kind.mode();

        if kind.is_float_kind() {
            let dest = dest.fp_reg();
            let lhs = left.fp_reg();
            let rhs = if right.is_constant() {
                let fscratch = self.masm.fscratch();
                let bits = match right.constant() {
                    ConstValue::Float(bits) => bits as u64,
                    ConstValue::Double(bits) => bits,
                    other => panic!("constant {:?} is not a float constant", other),
                };
                self.masm.load_float_const(mode, fscratch, bits);
                fscratch
            } else {
                right.fp_reg()
            };

            match op {
                ArithOp::Add => self.masm.float_add(mode, dest, lhs, rhs),
                ArithOp::Sub => self.masm.float_sub(mode, dest, lhs, rhs),
                ArithOp::Mul => self.masm.float_mul(mode, dest, lhs, rhs),
                ArithOp::Div => self.masm.float_div(mode, dest, lhs, rhs),
                _ => panic!("arithmetic op {:?} has no float encoding", op),
            }

            return;
        }

        let dest = dest.gp_reg();
        let lhs = left.gp_reg();

        match op {
            ArithOp::Add if right.is_constant() => {
                self.masm
                    .int_add_imm(mode, dest, lhs, const_to_i64(right.constant()));
            }

            ArithOp::Sub if right.is_constant() => {
                self.masm
                    .int_sub_imm(mode, dest, lhs, const_to_i64(right.constant()));
            }

            ArithOp::Add => self.masm.int_add(mode, dest, lhs, right.gp_reg()),
            ArithOp::Sub => self.masm.int_sub(mode, dest, lhs, right.gp_reg()),
            ArithOp::And => {
                let rhs = self.arith_rhs_reg(mode, right);
                self.masm.int_and(mode, dest, lhs, rhs);
            }
            ArithOp::Or => {
                let rhs = self.arith_rhs_reg(mode, right);
                self.masm.int_or(mode, dest, lhs, rhs);
            }
            ArithOp::Xor => {
                let rhs = self.arith_rhs_reg(mode, right);
                self.masm.int_xor(mode, dest, lhs, rhs);
            }
            ArithOp::Mul => {
                let rhs = self.arith_rhs_reg(mode, right);
                self.masm.int_mul(mode, dest, lhs, rhs);
            }

            ArithOp::Div | ArithOp::Rem | ArithOp::Udiv | ArithOp::Urem => {
                assert!(
                    right.is_register(),
                    "divisor must have been allocated to a register"
                );
                let rhs = right.gp_reg();

                let div_pos = match op {
                    ArithOp::Div => self.masm.int_div(mode, dest, lhs, rhs),
                    ArithOp::Rem => self.masm.int_mod(mode, dest, lhs, rhs),
                    ArithOp::Udiv => self.masm.int_udiv(mode, dest, lhs, rhs),
                    ArithOp::Urem => self.masm.int_umod(mode, dest, lhs, rhs),
                    _ => unreachable!(),
                };
                self.record_implicit_exception(div_pos, info);
            }
        }
    }

    fn arith_rhs_reg(&mut self, mode: MachineMode, right: &Operand) -> Reg {
        if right.is_constant() {
            let scratch = self.masm.scratch();
            self.masm
                .load_int_const(mode, scratch, const_to_i64(right.constant()));
            scratch
        } else {
            right.gp_reg()
        }
    }

    fn emit_shift(&mut self, op: ShiftOp, value: &Operand, count: &Operand, dest: &Operand) {
        let mode = dest.kind().mode();
        let dest = dest.gp_reg();
        let value = value.gp_reg();

        if count.is_constant() {
            let count = count.constant().int();
            match op {
                ShiftOp::Shl => self.masm.int_shl_imm(mode, dest, value, count),
                ShiftOp::Shr => self.masm.int_sar_imm(mode, dest, value, count),
                ShiftOp::Ushr => self.masm.int_shr_imm(mode, dest, value, count),
            }
        } else {
            let count = count.gp_reg();
            match op {
                ShiftOp::Shl => self.masm.int_shl(mode, dest, value, count),
                ShiftOp::Shr => self.masm.int_sar(mode, dest, value, count),
                ShiftOp::Ushr => self.masm.int_shr(mode, dest, value, count),
            }
        }
    }

    fn emit_compare(&mut self, left: &Operand, right: &Operand) {
        let kind = left.kind();
        let mode = kind.mode();

        if kind.is_float_kind() {
            self.masm.float_cmp(mode, left.fp_reg(), right.fp_reg());
            self.last_compare_float = true;
            return;
        }

        if right.is_constant() {
            self.masm
                .cmp_reg_imm64(mode, left.gp_reg(), const_to_i64(right.constant()));
        } else {
            self.masm.cmp_reg(mode, left.gp_reg(), right.gp_reg());
        }
        self.last_compare_float = false;
    }

    fn emit_branch(&mut self, cond: CondCode, target: LirLabel, unordered_is_true: bool) {
        let label = self.lir_label(target);

        if !self.last_compare_float {
            self.masm.jump_if(cond, label);
            return;
        }

        // after ucomiss/ucomisd an unordered result raises parity; take
        // or skip the branch explicitly before testing the condition
        if unordered_is_true {
            self.masm.jump_if_parity(label);
            self.masm.jump_float(cond, label);
        } else {
            let ordered = self.masm.create_label();
            self.masm.jump_if_parity(ordered);
            self.masm.jump_float(cond, label);
            self.masm.bind_label(ordered);
        }
    }

    /// `dest = cond ? opr1 : opr2`. When `opr2` already occupies the
    /// destination register the value is left in place and only
    /// conditionally overwritten, with the condition sense flipped
    /// relative to the plain case.
    fn emit_cond_move(
        &mut self,
        cond: CondCode,
        opr1: &Operand,
        opr2: &Operand,
        dest: &Operand,
    ) {
        let kind = dest.kind();
        if kind.is_float_kind() {
            panic!("conditional move has no encoding for kind {:?}", kind);
        }
        let mode = kind.mode();
        let dest = dest.gp_reg();

        if opr2.is_register() && opr2.gp_reg() == dest {
            let other = self.cond_move_source(mode, opr1);
            self.masm.cmov(mode, cond, dest, other);
        } else {
            match opr1 {
                Operand::Register(..) => self.masm.copy_reg(mode, dest, opr1.gp_reg()),
                Operand::Constant(value) => {
                    self.masm
                        .load_int_const_keep_flags(mode, dest, const_to_i64(*value))
                }
                other => panic!("conditional move from operand {:?} not supported", other),
            }

            let other = self.cond_move_source(mode, opr2);
            self.masm.cmov(mode, cond.negate(), dest, other);
        }
    }

    fn cond_move_source(&mut self, mode: MachineMode, opr: &Operand) -> Reg {
        match opr {
            Operand::Register(..) => opr.gp_reg(),
            Operand::Constant(value) => {
                let scratch = self.masm.scratch();
                self.masm
                    .load_int_const_keep_flags(mode, scratch, const_to_i64(*value));
                scratch
            }
            other => panic!("conditional move from operand {:?} not supported", other),
        }
    }

    fn emit_table_switch(
        &mut self,
        index: &Operand,
        temp: &Operand,
        lo: i32,
        targets: &[LirLabel],
        default: LirLabel,
    ) {
        assert!(!targets.is_empty());

        let index = index.gp_reg();
        let temp = temp.gp_reg();
        let scratch = self.masm.scratch();
        assert!(temp != scratch && index != scratch);

        self.masm.copy_reg(MachineMode::Int32, temp, index);
        if lo != 0 {
            self.masm
                .int_sub_imm(MachineMode::Int32, temp, temp, lo as i64);
        }

        let default = self.lir_label(default);
        self.masm
            .cmp_reg_imm(MachineMode::Int32, temp, targets.len() as i32);
        self.masm.jump_if(CondCode::UnsignedGreaterEq, default);

        // table slots hold code offsets until the installer patches
        // them to absolute addresses through the relocation records
        let table_targets: Vec<Label> = targets.iter().map(|&t| self.lir_label(t)).collect();
        let table = self.masm.emit_jump_table(table_targets);
        self.masm.lea_const(scratch, table);
        self.masm.jump_mem(Mem::Index(scratch, temp, 8, 0));
    }

    fn emit_call(
        &mut self,
        kind: &CallKind,
        args: &[Operand],
        result: Option<&Operand>,
        info: Option<&DebugInfo>,
    ) {
        self.marshal_arguments(args);

        let start = self.masm.pos() as u32;

        match kind {
            CallKind::Direct(method) => {
                self.masm.patchable_call(CallTarget::Method(*method));
            }

            CallKind::Indirect(target) => match target {
                Operand::Register(..) => self.masm.call_reg(target.gp_reg()),
                Operand::Stack(slot) => {
                    let scratch = self.masm.scratch();
                    let offset = self.frame.slot_offset(slot);
                    self.masm
                        .load_mem(ValueKind::Word, scratch.into(), Mem::Local(offset));
                    self.masm.call_reg(scratch);
                }
                other => panic!("call target operand {:?} not supported", other),
            },

            CallKind::Native(address) => {
                self.masm.native_call(*address);
            }

            CallKind::Runtime(entry) => {
                self.masm.patchable_call(CallTarget::Runtime(*entry));
            }
        }

        self.call_bookkeeping(start, info);

        if let Some(result) = result {
            self.move_from_result_register(result);
        }
    }

    /// Call to a no-return runtime entry. The argument registers carry
    /// the exception object and the raising code address; a trap byte
    /// follows so nothing can fall through or be misdecoded.
    fn emit_raise(&mut self, entry: RuntimeEntry, exception: &Operand, info: Option<&DebugInfo>) {
        let param = Operand::reg(REG_PARAMS[0], ValueKind::Object);
        self.emit_operand_move(exception, &param, None);
        self.masm.load_pc(REG_PARAMS[1]);

        let start = self.masm.pos() as u32;
        self.masm.patchable_call(CallTarget::Runtime(entry));
        self.call_bookkeeping(start, info);

        self.masm.int3();
    }

    fn emit_convert(&mut self, op: ConvertOp, src: &Operand, dest: &Operand) {
        match op {
            ConvertOp::I2L => self.masm.int_to_long(dest.gp_reg(), src.gp_reg()),
            ConvertOp::L2I => self.masm.long_to_int(dest.gp_reg(), src.gp_reg()),
            ConvertOp::I2B => self.masm.int_extend_byte(dest.gp_reg(), src.gp_reg()),
            ConvertOp::I2C => self.masm.int_to_char(dest.gp_reg(), src.gp_reg()),
            ConvertOp::I2S => self.masm.int_extend_short(dest.gp_reg(), src.gp_reg()),

            ConvertOp::I2F => self.masm.int_to_float(
                MachineMode::Float32,
                dest.fp_reg(),
                MachineMode::Int32,
                src.gp_reg(),
            ),
            ConvertOp::I2D => self.masm.int_to_float(
                MachineMode::Float64,
                dest.fp_reg(),
                MachineMode::Int32,
                src.gp_reg(),
            ),
            ConvertOp::L2F => self.masm.int_to_float(
                MachineMode::Float32,
                dest.fp_reg(),
                MachineMode::Int64,
                src.gp_reg(),
            ),
            ConvertOp::L2D => self.masm.int_to_float(
                MachineMode::Float64,
                dest.fp_reg(),
                MachineMode::Int64,
                src.gp_reg(),
            ),

            ConvertOp::F2D => self.masm.float_to_double(dest.fp_reg(), src.fp_reg()),
            ConvertOp::D2F => self.masm.double_to_float(dest.fp_reg(), src.fp_reg()),

            ConvertOp::MovF2I => self.masm.float_as_int(dest.gp_reg(), src.fp_reg()),
            ConvertOp::MovI2F => self.masm.int_as_float(dest.fp_reg(), src.gp_reg()),
            ConvertOp::MovD2L => self.masm.double_as_long(dest.gp_reg(), src.fp_reg()),
            ConvertOp::MovL2D => self.masm.long_as_double(dest.fp_reg(), src.gp_reg()),

            ConvertOp::F2I | ConvertOp::F2L | ConvertOp::D2I | ConvertOp::D2L => {
                self.emit_float_to_int(op, src, dest);
            }
        }
    }

    /// Truncating float-to-int conversion. The hardware reports NaN and
    /// out-of-range inputs with the MIN sentinel; those inputs are
    /// routed through the conversion stub, which computes the source
    /// language's saturation semantics.
    fn emit_float_to_int(&mut self, op: ConvertOp, src: &Operand, dest: &Operand) {
        let (src_mode, src_kind, dest_mode, dest_kind, key) = match op {
            ConvertOp::F2I => (
                MachineMode::Float32,
                ValueKind::Float,
                MachineMode::Int32,
                ValueKind::Int,
                StubKey::F2I,
            ),
            ConvertOp::F2L => (
                MachineMode::Float32,
                ValueKind::Float,
                MachineMode::Int64,
                ValueKind::Long,
                StubKey::F2L,
            ),
            ConvertOp::D2I => (
                MachineMode::Float64,
                ValueKind::Double,
                MachineMode::Int32,
                ValueKind::Int,
                StubKey::D2I,
            ),
            ConvertOp::D2L => (
                MachineMode::Float64,
                ValueKind::Double,
                MachineMode::Int64,
                ValueKind::Long,
                StubKey::D2L,
            ),
            _ => unreachable!(),
        };

        let src = src.fp_reg();
        let dest = dest.gp_reg();

        self.masm.float_to_int_trunc(dest_mode, dest, src_mode, src);

        let done = self.masm.create_label();
        if dest_mode.is64() {
            self.masm
                .cmp_reg_imm64(MachineMode::Int64, dest, i64::min_value());
        } else {
            self.masm
                .cmp_reg_imm(MachineMode::Int32, dest, i32::min_value());
        }
        self.masm.jump_if(CondCode::NotEqual, done);

        self.stubs.lookup(key.clone());
        assert!(
            self.frame.outgoing_slots() > 0,
            "conversion stub call requires an outgoing argument slot"
        );
        let offset = self.frame.outgoing_slot_offset(0);
        self.masm.store_mem(src_kind, Mem::Outgoing(offset), src.into());
        self.masm.patchable_call(CallTarget::Stub(key));
        self.masm
            .load_mem(dest_kind, dest.into(), Mem::Outgoing(offset));

        self.masm.bind_label(done);
    }

    pub(crate) fn emit_operand_move(
        &mut self,
        src: &Operand,
        dest: &Operand,
        info: Option<&DebugInfo>,
    ) {
        let kind = dest.kind();
        let mode = kind.mode();

        match (src, dest) {
            (Operand::Register(..), Operand::Register(..)) => {
                self.masm.copy(mode, dest.any_reg(), src.any_reg());
            }

            (Operand::Constant(value), Operand::Register(..)) => {
                self.load_const_into_register(*value, dest.any_reg());
            }

            (Operand::Register(..), Operand::Stack(slot)) => {
                let offset = self.frame.slot_offset(slot);
                self.masm
                    .store_mem(slot.kind, Mem::Local(offset), src.any_reg());
            }

            (Operand::Stack(slot), Operand::Register(..)) => {
                let offset = self.frame.slot_offset(slot);
                self.masm.load_mem(kind, dest.any_reg(), Mem::Local(offset));
            }

            (Operand::Constant(value), Operand::Stack(slot)) => {
                let offset = self.frame.slot_offset(slot);
                self.masm.store_const(slot.kind, Mem::Local(offset), *value);
            }

            (Operand::Stack(from), Operand::Stack(to)) => {
                let tmp: AnyReg = if kind.is_float_kind() {
                    self.masm.fscratch().into()
                } else {
                    self.masm.scratch().into()
                };
                let from_offset = self.frame.slot_offset(from);
                let to_offset = self.frame.slot_offset(to);
                self.masm.load_mem(kind, tmp, Mem::Local(from_offset));
                self.masm.store_mem(kind, Mem::Local(to_offset), tmp);
            }

            (Operand::Address(addr), Operand::Register(..)) => {
                let pos = self.masm.pos() as u32;
                self.masm
                    .load_mem(kind, dest.any_reg(), mem_from_address(addr));
                self.record_implicit_exception(pos, info);
            }

            (Operand::Register(..), Operand::Address(addr)) => {
                let pos = self.masm.pos() as u32;
                self.masm
                    .store_mem(addr.kind, mem_from_address(addr), src.any_reg());
                self.record_implicit_exception(pos, info);
            }

            (Operand::Constant(value), Operand::Address(addr)) => {
                let pos = self.masm.pos() as u32;
                self.masm
                    .store_const(addr.kind, mem_from_address(addr), *value);
                self.record_implicit_exception(pos, info);
            }

            (src, dest) => panic!("move {:?} -> {:?} has no encoding", src, dest),
        }
    }

    fn load_const_into_register(&mut self, value: ConstValue, dest: AnyReg) {
        match value {
            ConstValue::Int(v) => {
                self.masm
                    .load_int_const(MachineMode::Int32, dest.reg(), v as i64)
            }
            ConstValue::Long(v) | ConstValue::Word(v) => {
                self.masm.load_int_const(MachineMode::Int64, dest.reg(), v)
            }
            ConstValue::Float(bits) => {
                self.masm
                    .load_float_const(MachineMode::Float32, dest.freg(), bits as u64)
            }
            ConstValue::Double(bits) => {
                self.masm
                    .load_float_const(MachineMode::Float64, dest.freg(), bits)
            }
            ConstValue::Object(obj) => self.masm.load_object_const(dest.reg(), obj),
        }
    }

    /// Places call arguments per the calling convention: register
    /// arguments first, the rest in outgoing stack slots. Register
    /// allocation is expected to have placed the sources so that no
    /// argument register is overwritten before it is read.
    pub(crate) fn marshal_arguments(&mut self, args: &[Operand]) {
        let mut next_gp = 0;
        let mut next_fp = 0;
        let mut next_slot = 0;

        for arg in args {
            if arg.kind().is_float_kind() {
                if next_fp < FREG_PARAMS.len() {
                    self.move_to_freg(FREG_PARAMS[next_fp], arg);
                    next_fp += 1;
                } else {
                    self.store_to_outgoing(next_slot, arg);
                    next_slot += 1;
                }
            } else {
                if next_gp < REG_PARAMS.len() {
                    self.move_to_reg(REG_PARAMS[next_gp], arg);
                    next_gp += 1;
                } else {
                    self.store_to_outgoing(next_slot, arg);
                    next_slot += 1;
                }
            }
        }
    }

    fn move_to_reg(&mut self, dest: Reg, arg: &Operand) {
        let kind = arg.kind();
        let mode = kind.mode();

        match arg {
            Operand::Register(..) => self.masm.copy_reg(mode, dest, arg.gp_reg()),
            Operand::Constant(value) => {
                self.load_const_into_register(*value, dest.into());
            }
            Operand::Stack(slot) => {
                let offset = self.frame.slot_offset(slot);
                self.masm.load_mem(kind, dest.into(), Mem::Local(offset));
            }
            other => panic!("argument operand {:?} not supported", other),
        }
    }

    fn move_to_freg(&mut self, dest: crate::cpu::FReg, arg: &Operand) {
        let kind = arg.kind();
        let mode = kind.mode();

        match arg {
            Operand::Register(..) => self.masm.copy_freg(mode, dest, arg.fp_reg()),
            Operand::Constant(value) => {
                self.load_const_into_register(*value, dest.into());
            }
            Operand::Stack(slot) => {
                let offset = self.frame.slot_offset(slot);
                self.masm.load_mem(kind, dest.into(), Mem::Local(offset));
            }
            other => panic!("argument operand {:?} not supported", other),
        }
    }

    pub(crate) fn store_to_outgoing(&mut self, index: u32, arg: &Operand) {
        let offset = self.frame.outgoing_slot_offset(index);
        let kind = arg.kind();

        match arg {
            Operand::Register(..) => {
                self.masm
                    .store_mem(kind, Mem::Outgoing(offset), arg.any_reg());
            }
            Operand::Constant(value) => {
                self.masm.store_const(kind, Mem::Outgoing(offset), *value);
            }
            Operand::Stack(slot) => {
                let tmp: AnyReg = if kind.is_float_kind() {
                    self.masm.fscratch().into()
                } else {
                    self.masm.scratch().into()
                };
                let slot_offset = self.frame.slot_offset(slot);
                self.masm.load_mem(kind, tmp, Mem::Local(slot_offset));
                self.masm.store_mem(kind, Mem::Outgoing(offset), tmp);
            }
            other => panic!("argument operand {:?} not supported", other),
        }
    }

    fn move_to_result_register(&mut self, value: &Operand) {
        let kind = value.kind();
        let mode = kind.mode();

        let result: AnyReg = if kind.is_float_kind() {
            FREG_RESULT.into()
        } else {
            REG_RESULT.into()
        };

        match value {
            Operand::Register(..) => self.masm.copy(mode, result, value.any_reg()),
            Operand::Constant(v) => self.load_const_into_register(*v, result),
            Operand::Stack(slot) => {
                let offset = self.frame.slot_offset(slot);
                self.masm.load_mem(kind, result, Mem::Local(offset));
            }
            other => panic!("return operand {:?} not supported", other),
        }
    }

    pub(crate) fn move_from_result_register(&mut self, dest: &Operand) {
        let kind = dest.kind();
        let mode = kind.mode();

        let result: AnyReg = if kind.is_float_kind() {
            FREG_RESULT.into()
        } else {
            REG_RESULT.into()
        };

        match dest {
            Operand::Register(..) => self.masm.copy(mode, dest.any_reg(), result),
            Operand::Stack(slot) => {
                let offset = self.frame.slot_offset(slot);
                self.masm.store_mem(kind, Mem::Local(offset), result);
            }
            other => panic!("call result operand {:?} not supported", other),
        }
    }

    /// Records the side facts for a call site: the safepoint at the
    /// return address and, for handled calls, the exception range
    /// covering the call instruction.
    pub(crate) fn call_bookkeeping(&mut self, start: u32, info: Option<&DebugInfo>) {
        if let Some(info) = info {
            self.masm.emit_safepoint(info.gc_map.clone());

            if let Some(handler) = info.exception_handler {
                let handler = self.lir_label(handler);
                let end = self.masm.pos() as u32;
                self.masm.record_exception(start, end, handler);
            }
        }
    }

    /// Bookkeeping for an instruction that faults instead of branching:
    /// the safepoint is recorded at the instruction itself so the
    /// runtime can map the trap address back to it.
    pub(crate) fn record_implicit_exception(&mut self, pos: u32, info: Option<&DebugInfo>) {
        if let Some(info) = info {
            self.masm.record_safepoint_at(pos, info.gc_map.clone());

            if let Some(handler) = info.exception_handler {
                let handler = self.lir_label(handler);
                let end = self.masm.pos() as u32;
                self.masm.record_exception(pos, end, handler);
            }
        }
    }
}

fn mem_from_address(addr: &AddressOperand) -> Mem {
    match addr.index {
        Some((index, scale)) => Mem::Index(addr.base, index, scale, addr.disp),
        None => Mem::Base(addr.base, addr.disp),
    }
}

fn const_to_i64(value: ConstValue) -> i64 {
    match value {
        ConstValue::Int(v) => v as i64,
        ConstValue::Long(v) | ConstValue::Word(v) => v,
        ConstValue::Object(ObjectConstant::Null) => 0,
        other => panic!("constant {:?} has no integer representation", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{GcMap, RelocationKind};
    use crate::cpu::{RBX, RCX, RDI, RSI, XMM0};
    use crate::frame::FrameDescriptor;
    use crate::xir;

    fn assemble_with(ops: &[LirOp], desc: FrameDescriptor) -> CodeDescriptor {
        let target = Target::default();
        let frame = FrameMap::new(&desc, &target);
        let stubs = StubCache::new(target);
        let asm = LirAssembler::new(&frame, target, &stubs, CompilationFlags::default());
        asm.assemble(ops)
    }

    fn assemble(ops: &[LirOp]) -> CodeDescriptor {
        assemble_with(ops, FrameDescriptor::empty())
    }

    fn int_reg(reg: Reg) -> Operand {
        Operand::reg(reg, ValueKind::Int)
    }

    #[test]
    fn test_end_to_end_add() {
        let ops = vec![
            LirOp::Move {
                src: Operand::Constant(ConstValue::Int(5)),
                dest: int_reg(RAX),
                info: None,
            },
            LirOp::Move {
                src: Operand::Constant(ConstValue::Int(7)),
                dest: int_reg(RCX),
                info: None,
            },
            LirOp::Arith {
                op: ArithOp::Add,
                left: int_reg(RAX),
                right: int_reg(RCX),
                dest: int_reg(RAX),
                info: None,
            },
            LirOp::Return(Some(int_reg(RAX))),
        ];

        let descriptor = assemble(&ops);

        // the same program driven through the macro assembler by hand
        let target = Target::default();
        let frame = FrameMap::new(&FrameDescriptor::empty(), &target);
        let mut masm = MacroAssembler::new(target);
        masm.prolog(&frame);
        masm.load_int_const(MachineMode::Int32, RAX, 5);
        masm.load_int_const(MachineMode::Int32, RCX, 7);
        masm.int_add(MachineMode::Int32, RAX, RAX, RCX);
        masm.epilog(&frame);
        let expected = masm.data();

        assert_eq!(&descriptor.code[..expected.len()], &expected[..]);
        assert_eq!(descriptor.frame_size, 16);
    }

    #[test]
    fn test_output_is_deterministic() {
        let ops = vec![
            LirOp::Move {
                src: Operand::Constant(ConstValue::from_f64(2.5)),
                dest: Operand::freg(XMM0, ValueKind::Double),
                info: None,
            },
            LirOp::Compare {
                left: int_reg(RAX),
                right: Operand::Constant(ConstValue::Int(3)),
            },
            LirOp::Branch {
                cond: CondCode::Equal,
                target: LirLabel(0),
                unordered_is_true: false,
            },
            LirOp::Label(LirLabel(0)),
            LirOp::Return(None),
        ];

        let first = assemble(&ops);
        let second = assemble(&ops);

        assert_eq!(first.code, second.code);
        assert_eq!(first.safepoints.len(), second.safepoints.len());
        assert_eq!(first.relocations.len(), second.relocations.len());
    }

    #[test]
    fn test_cond_move_plain() {
        let ops = vec![
            LirOp::Compare {
                left: int_reg(RAX),
                right: int_reg(RCX),
            },
            LirOp::CondMove {
                cond: CondCode::Less,
                opr1: int_reg(RDI),
                opr2: int_reg(RSI),
                dest: int_reg(RBX),
            },
            LirOp::Return(None),
        ];

        let descriptor = assemble(&ops);

        let target = Target::default();
        let frame = FrameMap::new(&FrameDescriptor::empty(), &target);
        let mut masm = MacroAssembler::new(target);
        masm.prolog(&frame);
        masm.cmp_reg(MachineMode::Int32, RAX, RCX);
        // true value moved in first, undone on the negated condition
        masm.copy_reg(MachineMode::Int32, RBX, RDI);
        masm.cmov(MachineMode::Int32, CondCode::GreaterEq, RBX, RSI);
        masm.epilog(&frame);
        let expected = masm.data();

        assert_eq!(&descriptor.code[..expected.len()], &expected[..]);
    }

    #[test]
    fn test_cond_move_tie_break() {
        // the false value already sits in the destination register
        let ops = vec![
            LirOp::Compare {
                left: int_reg(RAX),
                right: int_reg(RCX),
            },
            LirOp::CondMove {
                cond: CondCode::Less,
                opr1: int_reg(RDI),
                opr2: int_reg(RBX),
                dest: int_reg(RBX),
            },
            LirOp::Return(None),
        ];

        let descriptor = assemble(&ops);

        let target = Target::default();
        let frame = FrameMap::new(&FrameDescriptor::empty(), &target);
        let mut masm = MacroAssembler::new(target);
        masm.prolog(&frame);
        masm.cmp_reg(MachineMode::Int32, RAX, RCX);
        // no clobbering move; condition not negated
        masm.cmov(MachineMode::Int32, CondCode::Less, RBX, RDI);
        masm.epilog(&frame);
        let expected = masm.data();

        assert_eq!(&descriptor.code[..expected.len()], &expected[..]);
    }

    #[test]
    fn test_call_bookkeeping_complete() {
        let handler = LirLabel(0);
        let ops = vec![
            LirOp::Call {
                kind: CallKind::Runtime(RuntimeEntry::Deoptimize),
                args: Vec::new(),
                result: None,
                info: Some(DebugInfo::with_handler(GcMap::new(&[3], &[]), handler)),
            },
            LirOp::Return(None),
            LirOp::Label(handler),
            LirOp::Return(None),
        ];

        let descriptor = assemble(&ops);

        assert_eq!(descriptor.safepoints.len(), 1);
        assert_eq!(descriptor.exceptions.len(), 1);

        // safepoint and relocation both at the return address
        let (reloc_offset, kind) = descriptor.relocations.iter().next().unwrap();
        assert_eq!(
            *kind,
            RelocationKind::DirectCall(CallTarget::Runtime(RuntimeEntry::Deoptimize))
        );
        let (sp_offset, gc_map) = descriptor.safepoints.iter().next().unwrap();
        assert_eq!(sp_offset, reloc_offset);
        assert!(gc_map.has_register(3));

        let entry = descriptor.exceptions.iter().next().unwrap();
        assert_eq!(entry.end, *reloc_offset);
        assert!(entry.start < entry.end);
        assert!(entry.handler > entry.end);
    }

    #[test]
    fn test_division_records_implicit_exception() {
        let ops = vec![
            LirOp::Arith {
                op: ArithOp::Div,
                left: int_reg(RAX),
                right: int_reg(RBX),
                dest: int_reg(RAX),
                info: Some(DebugInfo::new(GcMap::empty())),
            },
            LirOp::Return(Some(int_reg(RAX))),
        ];

        let descriptor = assemble(&ops);

        assert_eq!(descriptor.safepoints.len(), 1);
        let (offset, _) = descriptor.safepoints.iter().next().unwrap();
        // the record points at the idiv instruction itself
        assert_eq!(
            &descriptor.code[*offset as usize..*offset as usize + 2],
            &[0xF7, 0xFB]
        );
    }

    #[test]
    fn test_unsigned_division_has_no_overflow_guard() {
        let ops = vec![
            LirOp::Arith {
                op: ArithOp::Udiv,
                left: int_reg(RAX),
                right: int_reg(RBX),
                dest: int_reg(RAX),
                info: None,
            },
            LirOp::Return(Some(int_reg(RAX))),
        ];

        let descriptor = assemble(&ops);

        // zero-extend rdx, then div; no MIN comparison anywhere
        let target = Target::default();
        let frame = FrameMap::new(&FrameDescriptor::empty(), &target);
        let mut masm = MacroAssembler::new(target);
        masm.prolog(&frame);
        masm.int_udiv(MachineMode::Int32, RAX, RAX, RBX);
        masm.epilog(&frame);
        let expected = masm.data();

        assert_eq!(&descriptor.code[..expected.len()], &expected[..]);
        assert!(!descriptor
            .code
            .windows(4)
            .any(|w| w == i32::min_value().to_le_bytes()));
    }

    #[test]
    fn test_throw_is_followed_by_trap_filler() {
        let ops = vec![LirOp::Throw {
            exception: Operand::reg(REG_PARAMS[0], ValueKind::Object),
            info: None,
        }];

        let descriptor = assemble(&ops);

        let (offset, kind) = descriptor.relocations.iter().next().unwrap();
        assert_eq!(
            *kind,
            RelocationKind::DirectCall(CallTarget::Runtime(RuntimeEntry::ThrowException))
        );
        assert_eq!(descriptor.code[*offset as usize], 0xCC);
    }

    #[test]
    fn test_table_switch_emits_relocated_table() {
        let ops = vec![
            LirOp::TableSwitch {
                index: int_reg(RAX),
                temp: int_reg(RCX),
                lo: 1,
                targets: vec![LirLabel(0), LirLabel(1)],
                default: LirLabel(2),
            },
            LirOp::Label(LirLabel(0)),
            LirOp::Return(None),
            LirOp::Label(LirLabel(1)),
            LirOp::Return(None),
            LirOp::Label(LirLabel(2)),
            LirOp::Return(None),
        ];

        let descriptor = assemble(&ops);

        let entries: Vec<u32> = descriptor
            .relocations
            .iter()
            .filter_map(|(_, kind)| match kind {
                RelocationKind::JumpTableEntry(target) => Some(*target),
                _ => None,
            })
            .collect();

        assert_eq!(entries.len(), 2);
        assert!(entries[0] < entries[1]);
        // both targets fall inside the code
        assert!((entries[1] as usize) < descriptor.code.len());
    }

    #[test]
    fn test_float_to_int_uses_conversion_stub() {
        let target = Target::default();
        let desc = FrameDescriptor {
            spill_slots: 0,
            outgoing_slots: 1,
            callee_saved: Vec::new(),
        };
        let frame = FrameMap::new(&desc, &target);
        let stubs = StubCache::new(target);

        let ops = vec![
            LirOp::Convert {
                op: ConvertOp::D2L,
                src: Operand::freg(XMM0, ValueKind::Double),
                dest: int_reg(RAX),
            },
            LirOp::Return(Some(int_reg(RAX))),
        ];

        let asm = LirAssembler::new(&frame, target, &stubs, CompilationFlags::default());
        let descriptor = asm.assemble(&ops);

        assert_eq!(stubs.len(), 1);
        let stub_calls = descriptor
            .relocations
            .iter()
            .filter(|(_, kind)| {
                matches!(kind, RelocationKind::DirectCall(CallTarget::Stub(StubKey::D2L)))
            })
            .count();
        assert_eq!(stub_calls, 1);
    }

    #[test]
    fn test_xir_slow_paths_follow_fast_paths() {
        let template = xir::array_access_template(ValueKind::Int, false);
        let snippet = |dest| {
            XirSnippet::new(
                template.clone(),
                vec![Operand::reg(RDI, ValueKind::Object), int_reg(RSI)],
                vec![int_reg(RCX)],
                Some(int_reg(dest)),
            )
        };

        let ops = vec![
            LirOp::Xir {
                snippet: snippet(RAX),
                info: None,
            },
            LirOp::Xir {
                snippet: snippet(RBX),
                info: None,
            },
            LirOp::Return(Some(int_reg(RAX))),
        ];

        let descriptor = assemble(&ops);

        // one bounds-check call per snippet, in deferral order, both
        // emitted behind the return
        let bounds_calls: Vec<u32> = descriptor
            .relocations
            .iter()
            .filter_map(|(offset, kind)| match kind {
                RelocationKind::DirectCall(CallTarget::Runtime(
                    RuntimeEntry::ThrowBoundsCheck,
                )) => Some(*offset),
                _ => None,
            })
            .collect();

        assert_eq!(bounds_calls.len(), 2);
        assert!(bounds_calls[0] < bounds_calls[1]);

        let ret_pos = descriptor.code.iter().position(|&b| b == 0xC3).unwrap() as u32;
        assert!(bounds_calls[0] > ret_pos);
    }

    #[test]
    #[should_panic(expected = "slow paths cannot defer further slow paths")]
    fn test_nested_deferral_is_fatal() {
        let target = Target::default();
        let frame = FrameMap::new(&FrameDescriptor::empty(), &target);
        let stubs = StubCache::new(target);
        let mut asm = LirAssembler::new(&frame, target, &stubs, CompilationFlags::default());

        asm.emit_prolog();
        asm.emit_slow_paths();

        let template = xir::checkcast_template();
        let snippet = XirSnippet::new(
            template,
            vec![
                Operand::reg(RDI, ValueKind::Object),
                Operand::reg(RSI, ValueKind::Word),
            ],
            vec![Operand::reg(RCX, ValueKind::Word)],
            None,
        );
        asm.defer_slow_path(SlowPathData {
            snippet,
            labels: Vec::new(),
            info: None,
        });
    }

    #[test]
    #[should_panic]
    fn test_binding_lir_label_twice_is_fatal() {
        let ops = vec![
            LirOp::Label(LirLabel(0)),
            LirOp::Label(LirLabel(0)),
            LirOp::Return(None),
        ];
        assemble(&ops);
    }

    #[test]
    fn test_forward_branches_all_resolve_to_bind_position() {
        let ops = vec![
            LirOp::Compare {
                left: int_reg(RAX),
                right: int_reg(RCX),
            },
            LirOp::Branch {
                cond: CondCode::Equal,
                target: LirLabel(0),
                unordered_is_true: false,
            },
            LirOp::Branch {
                cond: CondCode::Less,
                target: LirLabel(0),
                unordered_is_true: false,
            },
            LirOp::Label(LirLabel(0)),
            LirOp::Return(None),
        ];

        let descriptor = assemble(&ops);

        // locate the two forward jcc encodings (0F 8x rel32) and check
        // both displacements land on the same position
        let code = &descriptor.code;
        let mut targets = Vec::new();
        let mut i = 0;
        while i + 6 <= code.len() {
            if code[i] == 0x0F && (code[i + 1] & 0xF0) == 0x80 {
                let disp =
                    i32::from_le_bytes(code[i + 2..i + 6].try_into().unwrap());
                targets.push((i as i32 + 6) + disp);
                i += 6;
            } else {
                i += 1;
            }
        }

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0], targets[1]);
    }
}
