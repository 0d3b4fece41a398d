use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;

use crate::assembler::{LirAssembler, SlowPathData};
use crate::code::{CallTarget, MarkKind, RuntimeEntry};
use crate::cpu::{FREG_PARAMS, FREG_RESULT, R10, RCX, RDX, REG_PARAMS, REG_RESULT, XMM4, XMM5};
use crate::lir::{ClassRef, DebugInfo, FieldRef};
use crate::masm::{CondCode, Mem};
use crate::mode::ValueKind;
use crate::operand::{ConstValue, ObjectConstant, Operand};
use crate::stubs::StubKey;

pub const ARRAY_LENGTH_OFFSET: i32 = 8;
pub const ARRAY_DATA_OFFSET: i32 = 16;
pub const CLASS_WORD_OFFSET: i32 = 0;

/// Label local to one template instantiation. Separate executions of
/// the same template never share label state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct XirLabel(pub u32);

/// Reference to one of a template's declared operand slots.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum XirSlot {
    In(usize),
    Temp(usize),
    Const(ConstValue),
    Result,
}

#[derive(Clone, Debug, PartialEq)]
pub enum XirOp {
    Mov,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    Sar,
    And,
    Or,
    Xor,
    NullCheck,
    PointerLoad {
        can_trap: bool,
    },
    PointerStore {
        can_trap: bool,
    },
    PointerLoadDisp {
        disp: i32,
        scale: i32,
        can_trap: bool,
    },
    PointerStoreDisp {
        disp: i32,
        scale: i32,
        can_trap: bool,
    },
    PointerCas,
    LoadEffectiveAddress {
        disp: i32,
        scale: i32,
    },
    CallStub(StubKey),
    CallRuntime(RuntimeEntry),
    Jmp(XirLabel),
    Jeq(XirLabel),
    Jneq(XirLabel),
    Jgt(XirLabel),
    Jgteq(XirLabel),
    Jugteq(XirLabel),
    Jlt(XirLabel),
    Jlteq(XirLabel),
    Bind(XirLabel),
    Safepoint,
    Align(usize),
    StackOverflowCheck,
    PushFrame,
    PopFrame,
    Push,
    Pop,
    Mark(MarkKind),
    Nop,
    RawBytes(Vec<u8>),
    ShouldNotReachHere,
}

#[derive(Clone, Debug)]
pub struct XirInstr {
    pub op: XirOp,
    pub kind: ValueKind,
    pub result: Option<XirSlot>,
    pub args: Vec<XirSlot>,
}

/// An immutable, precomputed instruction sequence describing a complex
/// runtime-dependent operation. The fast path is emitted inline; the
/// slow path is deferred behind all fast paths.
#[derive(Debug)]
pub struct XirTemplate {
    pub name: &'static str,
    pub inputs: Vec<ValueKind>,
    pub temps: Vec<ValueKind>,
    pub result: Option<ValueKind>,
    pub fast_path: Vec<XirInstr>,
    pub slow_path: Vec<XirInstr>,
    pub label_count: u32,
}

/// A template plus concrete operands for its slots.
#[derive(Clone, Debug)]
pub struct XirSnippet {
    pub template: Arc<XirTemplate>,
    pub inputs: Vec<Operand>,
    pub temps: Vec<Operand>,
    pub result: Option<Operand>,
}

impl XirSnippet {
    pub fn new(
        template: Arc<XirTemplate>,
        inputs: Vec<Operand>,
        temps: Vec<Operand>,
        result: Option<Operand>,
    ) -> XirSnippet {
        assert_eq!(template.inputs.len(), inputs.len(), "input arity mismatch");
        assert_eq!(template.temps.len(), temps.len(), "temp arity mismatch");
        assert_eq!(
            template.result.is_some(),
            result.is_some(),
            "result arity mismatch"
        );

        XirSnippet {
            template,
            inputs,
            temps,
            result,
        }
    }

    fn resolve(&self, slot: &XirSlot) -> Operand {
        match slot {
            XirSlot::In(idx) => self.inputs[*idx],
            XirSlot::Temp(idx) => self.temps[*idx],
            XirSlot::Const(value) => Operand::Constant(*value),
            XirSlot::Result => self.result.expect("template has no result slot"),
        }
    }
}

pub struct XirTemplateBuilder {
    name: &'static str,
    inputs: Vec<ValueKind>,
    temps: Vec<ValueKind>,
    result: Option<ValueKind>,
    fast_path: Vec<XirInstr>,
    slow_path: Vec<XirInstr>,
    in_slow_path: bool,
    label_count: u32,
}

impl XirTemplateBuilder {
    pub fn new(name: &'static str) -> XirTemplateBuilder {
        XirTemplateBuilder {
            name,
            inputs: Vec::new(),
            temps: Vec::new(),
            result: None,
            fast_path: Vec::new(),
            slow_path: Vec::new(),
            in_slow_path: false,
            label_count: 0,
        }
    }

    pub fn input(&mut self, kind: ValueKind) -> XirSlot {
        self.inputs.push(kind);
        XirSlot::In(self.inputs.len() - 1)
    }

    pub fn temp(&mut self, kind: ValueKind) -> XirSlot {
        self.temps.push(kind);
        XirSlot::Temp(self.temps.len() - 1)
    }

    pub fn result(&mut self, kind: ValueKind) -> XirSlot {
        assert!(self.result.is_none(), "result declared twice");
        self.result = Some(kind);
        XirSlot::Result
    }

    pub fn create_label(&mut self) -> XirLabel {
        let label = XirLabel(self.label_count);
        self.label_count += 1;
        label
    }

    /// Everything pushed after this call lands in the slow path, which
    /// the assembler emits after all fast paths.
    pub fn begin_slow_path(&mut self) {
        self.in_slow_path = true;
    }

    fn append(&mut self, instr: XirInstr) {
        if self.in_slow_path {
            self.slow_path.push(instr);
        } else {
            self.fast_path.push(instr);
        }
    }

    pub fn op(
        &mut self,
        op: XirOp,
        kind: ValueKind,
        result: Option<XirSlot>,
        args: Vec<XirSlot>,
    ) {
        self.append(XirInstr {
            op,
            kind,
            result,
            args,
        });
    }

    pub fn mov(&mut self, kind: ValueKind, dest: XirSlot, src: XirSlot) {
        self.op(XirOp::Mov, kind, Some(dest), vec![src]);
    }

    pub fn add(&mut self, kind: ValueKind, dest: XirSlot, a: XirSlot, b: XirSlot) {
        self.op(XirOp::Add, kind, Some(dest), vec![a, b]);
    }

    pub fn sub(&mut self, kind: ValueKind, dest: XirSlot, a: XirSlot, b: XirSlot) {
        self.op(XirOp::Sub, kind, Some(dest), vec![a, b]);
    }

    pub fn pload(&mut self, kind: ValueKind, dest: XirSlot, ptr: XirSlot, can_trap: bool) {
        self.op(XirOp::PointerLoad { can_trap }, kind, Some(dest), vec![ptr]);
    }

    pub fn pstore(&mut self, kind: ValueKind, ptr: XirSlot, value: XirSlot, can_trap: bool) {
        self.op(XirOp::PointerStore { can_trap }, kind, None, vec![ptr, value]);
    }

    pub fn pload_disp(
        &mut self,
        kind: ValueKind,
        dest: XirSlot,
        ptr: XirSlot,
        index: Option<XirSlot>,
        disp: i32,
        scale: i32,
        can_trap: bool,
    ) {
        let mut args = vec![ptr];
        if let Some(index) = index {
            args.push(index);
        }
        self.op(
            XirOp::PointerLoadDisp {
                disp,
                scale,
                can_trap,
            },
            kind,
            Some(dest),
            args,
        );
    }

    pub fn pstore_disp(
        &mut self,
        kind: ValueKind,
        ptr: XirSlot,
        index: Option<XirSlot>,
        disp: i32,
        scale: i32,
        value: XirSlot,
        can_trap: bool,
    ) {
        let mut args = vec![ptr];
        if let Some(index) = index {
            args.push(index);
        }
        args.push(value);
        self.op(
            XirOp::PointerStoreDisp {
                disp,
                scale,
                can_trap,
            },
            kind,
            None,
            args,
        );
    }

    pub fn pcas(
        &mut self,
        kind: ValueKind,
        result: XirSlot,
        ptr: XirSlot,
        expected: XirSlot,
        new_value: XirSlot,
    ) {
        self.op(
            XirOp::PointerCas,
            kind,
            Some(result),
            vec![ptr, expected, new_value],
        );
    }

    pub fn jmp(&mut self, target: XirLabel) {
        self.op(XirOp::Jmp(target), ValueKind::Word, None, Vec::new());
    }

    pub fn jeq(&mut self, target: XirLabel, kind: ValueKind, a: XirSlot, b: XirSlot) {
        self.op(XirOp::Jeq(target), kind, None, vec![a, b]);
    }

    pub fn jneq(&mut self, target: XirLabel, kind: ValueKind, a: XirSlot, b: XirSlot) {
        self.op(XirOp::Jneq(target), kind, None, vec![a, b]);
    }

    pub fn jgt(&mut self, target: XirLabel, kind: ValueKind, a: XirSlot, b: XirSlot) {
        self.op(XirOp::Jgt(target), kind, None, vec![a, b]);
    }

    pub fn jgteq(&mut self, target: XirLabel, kind: ValueKind, a: XirSlot, b: XirSlot) {
        self.op(XirOp::Jgteq(target), kind, None, vec![a, b]);
    }

    pub fn jugteq(&mut self, target: XirLabel, kind: ValueKind, a: XirSlot, b: XirSlot) {
        self.op(XirOp::Jugteq(target), kind, None, vec![a, b]);
    }

    pub fn jlt(&mut self, target: XirLabel, kind: ValueKind, a: XirSlot, b: XirSlot) {
        self.op(XirOp::Jlt(target), kind, None, vec![a, b]);
    }

    pub fn jlteq(&mut self, target: XirLabel, kind: ValueKind, a: XirSlot, b: XirSlot) {
        self.op(XirOp::Jlteq(target), kind, None, vec![a, b]);
    }

    pub fn bind(&mut self, label: XirLabel) {
        self.op(XirOp::Bind(label), ValueKind::Word, None, Vec::new());
    }

    pub fn null_check(&mut self, ptr: XirSlot) {
        self.op(XirOp::NullCheck, ValueKind::Object, None, vec![ptr]);
    }

    pub fn call_runtime(
        &mut self,
        entry: RuntimeEntry,
        kind: ValueKind,
        result: Option<XirSlot>,
        args: Vec<XirSlot>,
    ) {
        self.op(XirOp::CallRuntime(entry), kind, result, args);
    }

    pub fn call_stub(
        &mut self,
        key: StubKey,
        kind: ValueKind,
        result: Option<XirSlot>,
        args: Vec<XirSlot>,
    ) {
        self.op(XirOp::CallStub(key), kind, result, args);
    }

    pub fn safepoint(&mut self) {
        self.op(XirOp::Safepoint, ValueKind::Word, None, Vec::new());
    }

    pub fn align(&mut self, alignment: usize) {
        self.op(XirOp::Align(alignment), ValueKind::Word, None, Vec::new());
    }

    pub fn stack_overflow_check(&mut self) {
        self.op(XirOp::StackOverflowCheck, ValueKind::Word, None, Vec::new());
    }

    pub fn push_frame(&mut self) {
        self.op(XirOp::PushFrame, ValueKind::Word, None, Vec::new());
    }

    pub fn pop_frame(&mut self) {
        self.op(XirOp::PopFrame, ValueKind::Word, None, Vec::new());
    }

    pub fn push(&mut self, value: XirSlot) {
        self.op(XirOp::Push, ValueKind::Word, None, vec![value]);
    }

    pub fn pop(&mut self, dest: XirSlot) {
        self.op(XirOp::Pop, ValueKind::Word, Some(dest), Vec::new());
    }

    pub fn mark(&mut self, kind: MarkKind) {
        self.op(XirOp::Mark(kind), ValueKind::Word, None, Vec::new());
    }

    pub fn nop(&mut self) {
        self.op(XirOp::Nop, ValueKind::Word, None, Vec::new());
    }

    pub fn raw_bytes(&mut self, bytes: Vec<u8>) {
        self.op(XirOp::RawBytes(bytes), ValueKind::Word, None, Vec::new());
    }

    pub fn should_not_reach_here(&mut self) {
        self.op(XirOp::ShouldNotReachHere, ValueKind::Word, None, Vec::new());
    }

    pub fn finish(self) -> Arc<XirTemplate> {
        Arc::new(XirTemplate {
            name: self.name,
            inputs: self.inputs,
            temps: self.temps,
            result: self.result,
            fast_path: self.fast_path,
            slow_path: self.slow_path,
            label_count: self.label_count,
        })
    }
}

impl<'a> LirAssembler<'a> {
    /// Executes a snippet's fast path inline and defers its slow path.
    pub(crate) fn emit_xir(&mut self, snippet: &XirSnippet, info: Option<&DebugInfo>) {
        let labels: Vec<vela_asm::Label> = (0..snippet.template.label_count)
            .map(|_| self.masm.create_label())
            .collect();

        self.exec_xir(&snippet.template.fast_path, snippet, &labels, info);

        if !snippet.template.slow_path.is_empty() {
            self.defer_slow_path(SlowPathData {
                snippet: snippet.clone(),
                labels,
                info: info.cloned(),
            });
        }
    }

    pub(crate) fn emit_xir_slow_path(&mut self, path: &SlowPathData) {
        let template = path.snippet.template.clone();
        self.exec_xir(
            &template.slow_path,
            &path.snippet,
            &path.labels,
            path.info.as_ref(),
        );
    }

    fn exec_xir(
        &mut self,
        instrs: &[XirInstr],
        snippet: &XirSnippet,
        labels: &[vela_asm::Label],
        info: Option<&DebugInfo>,
    ) {
        for instr in instrs {
            self.exec_xir_instr(instr, snippet, labels, info);
        }
    }

    fn exec_xir_instr(
        &mut self,
        instr: &XirInstr,
        snippet: &XirSnippet,
        labels: &[vela_asm::Label],
        info: Option<&DebugInfo>,
    ) {
        let kind = instr.kind;
        let mode = kind.mode();

        match &instr.op {
            XirOp::Mov => {
                let src = snippet.resolve(&instr.args[0]);
                let dest = snippet.resolve(instr.result.as_ref().unwrap());
                self.emit_operand_move(&src, &dest, None);
            }

            XirOp::Add | XirOp::Sub | XirOp::Mul | XirOp::And | XirOp::Or | XirOp::Xor => {
                let dest = snippet.resolve(instr.result.as_ref().unwrap()).gp_reg();
                let lhs = snippet.resolve(&instr.args[0]).gp_reg();
                let rhs = snippet.resolve(&instr.args[1]);

                let rhs = if rhs.is_constant() {
                    match (&instr.op, rhs.constant()) {
                        (XirOp::Add, ConstValue::Int(v)) => {
                            self.masm.int_add_imm(mode, dest, lhs, v as i64);
                            return;
                        }
                        (XirOp::Sub, ConstValue::Int(v)) => {
                            self.masm.int_sub_imm(mode, dest, lhs, v as i64);
                            return;
                        }
                        (_, value) => {
                            let scratch = self.masm.scratch();
                            self.masm.load_int_const(mode, scratch, const_as_i64(value));
                            scratch
                        }
                    }
                } else {
                    rhs.gp_reg()
                };

                match instr.op {
                    XirOp::Add => self.masm.int_add(mode, dest, lhs, rhs),
                    XirOp::Sub => self.masm.int_sub(mode, dest, lhs, rhs),
                    XirOp::Mul => self.masm.int_mul(mode, dest, lhs, rhs),
                    XirOp::And => self.masm.int_and(mode, dest, lhs, rhs),
                    XirOp::Or => self.masm.int_or(mode, dest, lhs, rhs),
                    XirOp::Xor => self.masm.int_xor(mode, dest, lhs, rhs),
                    _ => unreachable!(),
                }
            }

            XirOp::Div | XirOp::Mod => {
                let dest = snippet.resolve(instr.result.as_ref().unwrap()).gp_reg();
                let lhs = snippet.resolve(&instr.args[0]).gp_reg();
                let rhs = snippet.resolve(&instr.args[1]).gp_reg();

                let div_pos = match instr.op {
                    XirOp::Div => self.masm.int_div(mode, dest, lhs, rhs),
                    XirOp::Mod => self.masm.int_mod(mode, dest, lhs, rhs),
                    _ => unreachable!(),
                };
                self.record_implicit_exception(div_pos, info);
            }

            XirOp::Shl | XirOp::Shr | XirOp::Sar => {
                let dest = snippet.resolve(instr.result.as_ref().unwrap()).gp_reg();
                let lhs = snippet.resolve(&instr.args[0]).gp_reg();
                let count = snippet.resolve(&instr.args[1]);

                if count.is_constant() {
                    let count = count.constant().int();
                    match instr.op {
                        XirOp::Shl => self.masm.int_shl_imm(mode, dest, lhs, count),
                        XirOp::Shr => self.masm.int_shr_imm(mode, dest, lhs, count),
                        XirOp::Sar => self.masm.int_sar_imm(mode, dest, lhs, count),
                        _ => unreachable!(),
                    }
                } else {
                    let count = count.gp_reg();
                    assert_eq!(count, RCX, "variable shift count must be in rcx");
                    match instr.op {
                        XirOp::Shl => self.masm.int_shl(mode, dest, lhs, count),
                        XirOp::Shr => self.masm.int_shr(mode, dest, lhs, count),
                        XirOp::Sar => self.masm.int_sar(mode, dest, lhs, count),
                        _ => unreachable!(),
                    }
                }
            }

            XirOp::NullCheck => {
                let ptr = snippet.resolve(&instr.args[0]).gp_reg();
                let pos = self.masm.null_check(ptr);
                self.record_implicit_exception(pos, info);
            }

            XirOp::PointerLoad { can_trap } => {
                let ptr = snippet.resolve(&instr.args[0]).gp_reg();
                let dest = snippet.resolve(instr.result.as_ref().unwrap()).any_reg();

                let start = self.masm.pos() as u32;
                self.masm.load_mem(kind, dest, Mem::Base(ptr, 0));
                if *can_trap {
                    self.record_implicit_exception(start, info);
                }
            }

            XirOp::PointerStore { can_trap } => {
                let ptr = snippet.resolve(&instr.args[0]).gp_reg();
                let value = snippet.resolve(&instr.args[1]).any_reg();

                let start = self.masm.pos() as u32;
                self.masm.store_mem(kind, Mem::Base(ptr, 0), value);
                if *can_trap {
                    self.record_implicit_exception(start, info);
                }
            }

            XirOp::PointerLoadDisp {
                disp,
                scale,
                can_trap,
            } => {
                let ptr = snippet.resolve(&instr.args[0]).gp_reg();
                let dest = snippet.resolve(instr.result.as_ref().unwrap()).any_reg();
                let mem = self.xir_address(snippet, &instr.args, 1, ptr, *disp, *scale);

                let start = self.masm.pos() as u32;
                self.masm.load_mem(kind, dest, mem);
                if *can_trap {
                    self.record_implicit_exception(start, info);
                }
            }

            XirOp::PointerStoreDisp {
                disp,
                scale,
                can_trap,
            } => {
                let ptr = snippet.resolve(&instr.args[0]).gp_reg();
                let value = snippet
                    .resolve(instr.args.last().expect("missing value"))
                    .any_reg();
                let index_args = &instr.args[..instr.args.len() - 1];
                let mem = self.xir_address(snippet, index_args, 1, ptr, *disp, *scale);

                let start = self.masm.pos() as u32;
                self.masm.store_mem(kind, mem, value);
                if *can_trap {
                    self.record_implicit_exception(start, info);
                }
            }

            XirOp::PointerCas => {
                let ptr = snippet.resolve(&instr.args[0]).gp_reg();
                let expected = snippet.resolve(&instr.args[1]).gp_reg();
                let new_value = snippet.resolve(&instr.args[2]).gp_reg();
                let result = snippet.resolve(instr.result.as_ref().unwrap()).gp_reg();

                self.masm.compare_and_swap(mode, ptr, expected, new_value);
                self.masm.copy_reg(mode, result, crate::cpu::RAX);
            }

            XirOp::LoadEffectiveAddress { disp, scale } => {
                let ptr = snippet.resolve(&instr.args[0]).gp_reg();
                let dest = snippet.resolve(instr.result.as_ref().unwrap()).gp_reg();
                let mem = self.xir_address(snippet, &instr.args, 1, ptr, *disp, *scale);
                self.masm.lea(dest, mem);
            }

            XirOp::CallStub(key) => {
                self.stubs.lookup(key.clone());

                for (idx, arg) in instr.args.iter().enumerate() {
                    let operand = snippet.resolve(arg);
                    self.store_to_outgoing(idx as u32, &operand);
                }

                let start = self.masm.pos() as u32;
                self.masm.patchable_call(CallTarget::Stub(key.clone()));
                self.call_bookkeeping(start, info);

                if let Some(result) = &instr.result {
                    let dest = snippet.resolve(result);
                    let offset = self.frame.outgoing_slot_offset(0);
                    self.masm
                        .load_mem(dest.kind(), dest.any_reg(), Mem::Outgoing(offset));
                }
            }

            XirOp::CallRuntime(entry) => {
                let args: Vec<Operand> =
                    instr.args.iter().map(|slot| snippet.resolve(slot)).collect();
                self.marshal_arguments(&args);

                let start = self.masm.pos() as u32;
                self.masm
                    .patchable_call(CallTarget::Runtime(*entry));
                self.call_bookkeeping(start, info);

                if let Some(result) = &instr.result {
                    let dest = snippet.resolve(result);
                    self.move_from_result_register(&dest);
                }
            }

            XirOp::Jmp(target) => {
                self.masm.jump(labels[target.0 as usize]);
            }

            XirOp::Jeq(target) => self.xir_compare_jump(snippet, instr, labels, *target, CondCode::Equal),
            XirOp::Jneq(target) => {
                self.xir_compare_jump(snippet, instr, labels, *target, CondCode::NotEqual)
            }
            XirOp::Jgt(target) => {
                self.xir_compare_jump(snippet, instr, labels, *target, CondCode::Greater)
            }
            XirOp::Jgteq(target) => {
                self.xir_compare_jump(snippet, instr, labels, *target, CondCode::GreaterEq)
            }
            XirOp::Jugteq(target) => self.xir_compare_jump(
                snippet,
                instr,
                labels,
                *target,
                CondCode::UnsignedGreaterEq,
            ),
            XirOp::Jlt(target) => {
                self.xir_compare_jump(snippet, instr, labels, *target, CondCode::Less)
            }
            XirOp::Jlteq(target) => {
                self.xir_compare_jump(snippet, instr, labels, *target, CondCode::LessEq)
            }

            XirOp::Bind(label) => {
                self.masm.bind_label(labels[label.0 as usize]);
            }

            XirOp::Safepoint => {
                let gc_map = info
                    .map(|info| info.gc_map.clone())
                    .unwrap_or_else(crate::code::GcMap::empty);
                self.masm.safepoint(gc_map);
            }

            XirOp::Align(alignment) => {
                self.masm.align_with_nops(*alignment);
            }

            XirOp::StackOverflowCheck => {
                let frame = self.frame;
                self.masm.bang_stack(frame);
            }

            XirOp::PushFrame => {
                let frame = self.frame;
                self.masm.prolog(frame);
            }

            XirOp::PopFrame => {
                let frame = self.frame;
                self.masm.epilog_without_return(frame);
            }

            XirOp::Push => {
                let value = snippet.resolve(&instr.args[0]).gp_reg();
                self.masm.push_reg(value);
            }

            XirOp::Pop => {
                let dest = snippet.resolve(instr.result.as_ref().unwrap()).gp_reg();
                self.masm.pop_reg(dest);
            }

            XirOp::Mark(mark_kind) => {
                self.masm.record_mark(*mark_kind);
            }

            XirOp::Nop => {
                self.masm.nop();
            }

            XirOp::RawBytes(bytes) => {
                for &byte in bytes {
                    self.masm.emit_u8(byte);
                }
            }

            XirOp::ShouldNotReachHere => {
                self.masm.int3();
            }
        }
    }

    fn xir_address(
        &mut self,
        snippet: &XirSnippet,
        args: &[XirSlot],
        index_at: usize,
        ptr: crate::cpu::Reg,
        disp: i32,
        scale: i32,
    ) -> Mem {
        if args.len() <= index_at {
            return Mem::Base(ptr, disp);
        }

        let index = snippet.resolve(&args[index_at]);

        if index.is_constant() {
            let index = index.constant().int();
            Mem::Base(ptr, disp + index * scale)
        } else {
            Mem::Index(ptr, index.gp_reg(), scale, disp)
        }
    }

    fn xir_compare_jump(
        &mut self,
        snippet: &XirSnippet,
        instr: &XirInstr,
        labels: &[vela_asm::Label],
        target: XirLabel,
        cond: CondCode,
    ) {
        let mode = instr.kind.mode();
        let lhs = snippet.resolve(&instr.args[0]).gp_reg();
        let rhs = snippet.resolve(&instr.args[1]);

        if rhs.is_constant() {
            let value = const_as_i64(rhs.constant());
            self.masm.cmp_reg_imm64(mode, lhs, value);
        } else {
            self.masm.cmp_reg(mode, lhs, rhs.gp_reg());
        }

        self.masm.jump_if(cond, labels[target.0 as usize]);
    }
}

fn const_as_i64(value: ConstValue) -> i64 {
    match value {
        ConstValue::Int(v) => v as i64,
        ConstValue::Long(v) | ConstValue::Word(v) => v,
        ConstValue::Object(ObjectConstant::Null) => 0,
        other => panic!("constant {:?} has no integer representation", other),
    }
}

fn kind_suffix(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Boolean => "boolean",
        ValueKind::Byte => "byte",
        ValueKind::Char => "char",
        ValueKind::Short => "short",
        ValueKind::Int => "int",
        ValueKind::Long => "long",
        ValueKind::Float => "float",
        ValueKind::Double => "double",
        ValueKind::Object => "object",
        ValueKind::Word => "word",
    }
}

const TEMPLATE_KINDS: [ValueKind; 5] = [
    ValueKind::Int,
    ValueKind::Long,
    ValueKind::Float,
    ValueKind::Double,
    ValueKind::Object,
];

/// The canonical template set, built once per process.
pub struct XirTemplates {
    get_field: HashMap<ValueKind, Arc<XirTemplate>>,
    get_field_unresolved: HashMap<ValueKind, Arc<XirTemplate>>,
    put_field: HashMap<ValueKind, Arc<XirTemplate>>,
    put_field_unresolved: HashMap<ValueKind, Arc<XirTemplate>>,
    array_load: HashMap<ValueKind, Arc<XirTemplate>>,
    array_store: HashMap<ValueKind, Arc<XirTemplate>>,
    checkcast: Arc<XirTemplate>,
    checkcast_unresolved: Arc<XirTemplate>,
}

lazy_static! {
    pub static ref TEMPLATES: XirTemplates = XirTemplates::build();
}

impl XirTemplates {
    fn build() -> XirTemplates {
        let mut get_field = HashMap::new();
        let mut get_field_unresolved = HashMap::new();
        let mut put_field = HashMap::new();
        let mut put_field_unresolved = HashMap::new();
        let mut array_load = HashMap::new();
        let mut array_store = HashMap::new();

        for &kind in &TEMPLATE_KINDS {
            get_field.insert(kind, build_get_field(kind));
            get_field_unresolved.insert(kind, build_get_field_unresolved(kind));
            put_field.insert(kind, build_put_field(kind));
            put_field_unresolved.insert(kind, build_put_field_unresolved(kind));
            array_load.insert(kind, build_array_load(kind));
            array_store.insert(kind, build_array_store(kind));
        }

        XirTemplates {
            get_field,
            get_field_unresolved,
            put_field,
            put_field_unresolved,
            array_load,
            array_store,
            checkcast: build_checkcast(),
            checkcast_unresolved: build_checkcast_unresolved(),
        }
    }

    pub fn all(&self) -> Vec<Arc<XirTemplate>> {
        let mut templates = Vec::new();
        for map in [
            &self.get_field,
            &self.get_field_unresolved,
            &self.put_field,
            &self.put_field_unresolved,
            &self.array_load,
            &self.array_store,
        ] {
            templates.extend(map.values().cloned());
        }
        templates.push(self.checkcast.clone());
        templates.push(self.checkcast_unresolved.clone());
        templates
    }
}

fn template_name(prefix: &str, kind: ValueKind) -> &'static str {
    // template names are a small closed set; leak once at build time
    let name = format!("{}_{}", prefix, kind_suffix(kind));
    Box::leak(name.into_boxed_str())
}

fn build_get_field(kind: ValueKind) -> Arc<XirTemplate> {
    let mut b = XirTemplateBuilder::new(template_name("get_field", kind));
    let obj = b.input(ValueKind::Object);
    let offset = b.input(ValueKind::Int);
    let result = b.result(kind);
    b.pload_disp(kind, result, obj, Some(offset), 0, 1, true);
    b.finish()
}

fn build_get_field_unresolved(kind: ValueKind) -> Arc<XirTemplate> {
    let mut b = XirTemplateBuilder::new(template_name("get_field_unresolved", kind));
    let obj = b.input(ValueKind::Object);
    let field_id = b.input(ValueKind::Int);
    let offset = b.temp(ValueKind::Int);
    let result = b.result(kind);
    b.call_runtime(
        RuntimeEntry::ResolveField,
        ValueKind::Int,
        Some(offset),
        vec![field_id],
    );
    b.pload_disp(kind, result, obj, Some(offset), 0, 1, true);
    b.finish()
}

fn build_put_field(kind: ValueKind) -> Arc<XirTemplate> {
    let mut b = XirTemplateBuilder::new(template_name("put_field", kind));
    let obj = b.input(ValueKind::Object);
    let value = b.input(kind);
    let offset = b.input(ValueKind::Int);
    b.pstore_disp(kind, obj, Some(offset), 0, 1, value, true);
    b.finish()
}

fn build_put_field_unresolved(kind: ValueKind) -> Arc<XirTemplate> {
    let mut b = XirTemplateBuilder::new(template_name("put_field_unresolved", kind));
    let obj = b.input(ValueKind::Object);
    let value = b.input(kind);
    let field_id = b.input(ValueKind::Int);
    let offset = b.temp(ValueKind::Int);
    b.call_runtime(
        RuntimeEntry::ResolveField,
        ValueKind::Int,
        Some(offset),
        vec![field_id],
    );
    b.pstore_disp(kind, obj, Some(offset), 0, 1, value, true);
    b.finish()
}

fn build_array_load(kind: ValueKind) -> Arc<XirTemplate> {
    let mut b = XirTemplateBuilder::new(template_name("array_load", kind));
    let array = b.input(ValueKind::Object);
    let index = b.input(ValueKind::Int);
    let length = b.temp(ValueKind::Int);
    let result = b.result(kind);
    let oob = b.create_label();

    // the length load doubles as the null check
    b.pload_disp(
        ValueKind::Int,
        length,
        array,
        None,
        ARRAY_LENGTH_OFFSET,
        1,
        true,
    );
    b.jugteq(oob, ValueKind::Int, index, length);
    b.pload_disp(
        kind,
        result,
        array,
        Some(index),
        ARRAY_DATA_OFFSET,
        kind.size_in_bytes(),
        false,
    );

    b.begin_slow_path();
    b.bind(oob);
    b.call_runtime(
        RuntimeEntry::ThrowBoundsCheck,
        ValueKind::Int,
        None,
        vec![index],
    );
    b.should_not_reach_here();
    b.finish()
}

fn build_array_store(kind: ValueKind) -> Arc<XirTemplate> {
    let mut b = XirTemplateBuilder::new(template_name("array_store", kind));
    let array = b.input(ValueKind::Object);
    let index = b.input(ValueKind::Int);
    let value = b.input(kind);
    let length = b.temp(ValueKind::Int);
    let oob = b.create_label();

    b.pload_disp(
        ValueKind::Int,
        length,
        array,
        None,
        ARRAY_LENGTH_OFFSET,
        1,
        true,
    );
    b.jugteq(oob, ValueKind::Int, index, length);
    b.pstore_disp(
        kind,
        array,
        Some(index),
        ARRAY_DATA_OFFSET,
        kind.size_in_bytes(),
        value,
        false,
    );

    b.begin_slow_path();
    b.bind(oob);
    b.call_runtime(
        RuntimeEntry::ThrowBoundsCheck,
        ValueKind::Int,
        None,
        vec![index],
    );
    b.should_not_reach_here();
    b.finish()
}

fn build_checkcast() -> Arc<XirTemplate> {
    let mut b = XirTemplateBuilder::new("checkcast");
    let obj = b.input(ValueKind::Object);
    let expected = b.input(ValueKind::Word);
    let actual = b.temp(ValueKind::Word);
    let done = b.create_label();
    let fail = b.create_label();

    // null passes every cast
    b.jeq(
        done,
        ValueKind::Object,
        obj,
        XirSlot::Const(ConstValue::Object(ObjectConstant::Null)),
    );
    b.pload_disp(ValueKind::Word, actual, obj, None, CLASS_WORD_OFFSET, 1, false);
    b.jneq(fail, ValueKind::Word, actual, expected);
    b.bind(done);

    b.begin_slow_path();
    b.bind(fail);
    b.call_runtime(
        RuntimeEntry::ThrowClassCast,
        ValueKind::Object,
        None,
        vec![obj],
    );
    b.should_not_reach_here();
    b.finish()
}

/// Type check whose class word is not known yet: the class is resolved
/// through the runtime first, then compared as in the resolved variant.
fn build_checkcast_unresolved() -> Arc<XirTemplate> {
    let mut b = XirTemplateBuilder::new("checkcast_unresolved");
    let obj = b.input(ValueKind::Object);
    let class_id = b.input(ValueKind::Int);
    let expected = b.temp(ValueKind::Word);
    let actual = b.temp(ValueKind::Word);
    let done = b.create_label();
    let fail = b.create_label();

    b.jeq(
        done,
        ValueKind::Object,
        obj,
        XirSlot::Const(ConstValue::Object(ObjectConstant::Null)),
    );
    b.call_runtime(
        RuntimeEntry::ResolveClass,
        ValueKind::Word,
        Some(expected),
        vec![class_id],
    );
    b.pload_disp(ValueKind::Word, actual, obj, None, CLASS_WORD_OFFSET, 1, false);
    b.jneq(fail, ValueKind::Word, actual, expected);
    b.bind(done);

    b.begin_slow_path();
    b.bind(fail);
    b.call_runtime(
        RuntimeEntry::ThrowClassCast,
        ValueKind::Object,
        None,
        vec![obj],
    );
    b.should_not_reach_here();
    b.finish()
}

/// Picks the template variant for a field access based on the
/// reference's resolution state.
pub fn field_access_template(field: &FieldRef, kind: ValueKind, write: bool) -> Arc<XirTemplate> {
    let templates = &*TEMPLATES;

    let map = match (write, field.is_resolved()) {
        (false, true) => &templates.get_field,
        (false, false) => &templates.get_field_unresolved,
        (true, true) => &templates.put_field,
        (true, false) => &templates.put_field_unresolved,
    };

    map.get(&kind)
        .unwrap_or_else(|| panic!("no field template for kind {:?}", kind))
        .clone()
}

pub fn array_access_template(kind: ValueKind, write: bool) -> Arc<XirTemplate> {
    let templates = &*TEMPLATES;
    let map = if write {
        &templates.array_store
    } else {
        &templates.array_load
    };

    map.get(&kind)
        .unwrap_or_else(|| panic!("no array template for kind {:?}", kind))
        .clone()
}

pub fn checkcast_template() -> Arc<XirTemplate> {
    TEMPLATES.checkcast.clone()
}

/// Picks the type-check template variant from the class reference's
/// resolution state.
pub fn checkcast_template_for(class: &ClassRef) -> Arc<XirTemplate> {
    if class.resolved {
        TEMPLATES.checkcast.clone()
    } else {
        TEMPLATES.checkcast_unresolved.clone()
    }
}

pub fn template_by_name(name: &str) -> Option<Arc<XirTemplate>> {
    TEMPLATES.all().into_iter().find(|t| t.name == name)
}

/// Binds a template's slots to the calling convention, for standalone
/// template stubs: inputs from parameter registers, result in the
/// result register, temps in caller-saved registers.
pub fn bind_template_to_convention(template: &Arc<XirTemplate>) -> XirSnippet {
    let gp_temps = [R10, RDX];
    let fp_temps = [XMM4, XMM5];

    let mut next_gp_param = 0;
    let mut next_fp_param = 0;
    let inputs: Vec<Operand> = template
        .inputs
        .iter()
        .map(|&kind| {
            if kind.is_float_kind() {
                let reg = FREG_PARAMS[next_fp_param];
                next_fp_param += 1;
                Operand::freg(reg, kind)
            } else {
                let reg = REG_PARAMS[next_gp_param];
                next_gp_param += 1;
                Operand::reg(reg, kind)
            }
        })
        .collect();

    let mut next_gp_temp = 0;
    let mut next_fp_temp = 0;
    let temps: Vec<Operand> = template
        .temps
        .iter()
        .map(|&kind| {
            if kind.is_float_kind() {
                let reg = fp_temps[next_fp_temp];
                next_fp_temp += 1;
                Operand::freg(reg, kind)
            } else {
                let reg = gp_temps[next_gp_temp];
                next_gp_temp += 1;
                Operand::reg(reg, kind)
            }
        })
        .collect();

    let result = template.result.map(|kind| {
        if kind.is_float_kind() {
            Operand::freg(FREG_RESULT, kind)
        } else {
            Operand::reg(REG_RESULT, kind)
        }
    });

    XirSnippet::new(template.clone(), inputs, temps, result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_splits_paths() {
        let mut b = XirTemplateBuilder::new("split");
        let a = b.input(ValueKind::Int);
        let r = b.result(ValueKind::Int);
        let lbl = b.create_label();
        b.mov(ValueKind::Int, r, a);
        b.begin_slow_path();
        b.bind(lbl);
        b.should_not_reach_here();
        let template = b.finish();

        assert_eq!(template.fast_path.len(), 1);
        assert_eq!(template.slow_path.len(), 2);
        assert_eq!(template.label_count, 1);
    }

    #[test]
    fn test_template_registry() {
        assert!(template_by_name("get_field_int").is_some());
        assert!(template_by_name("array_load_object").is_some());
        assert!(template_by_name("checkcast").is_some());
        assert!(template_by_name("no_such_template").is_none());
    }

    #[test]
    fn test_variant_selection_follows_resolution() {
        let resolved = FieldRef {
            id: 1,
            offset: Some(16),
        };
        let unresolved = FieldRef { id: 2, offset: None };

        let a = field_access_template(&resolved, ValueKind::Int, false);
        let b = field_access_template(&unresolved, ValueKind::Int, false);

        assert_eq!(a.name, "get_field_int");
        assert_eq!(b.name, "get_field_unresolved_int");
    }

    #[test]
    fn test_checkcast_variant_follows_resolution() {
        let resolved = ClassRef {
            id: 1,
            resolved: true,
        };
        let unresolved = ClassRef {
            id: 2,
            resolved: false,
        };

        assert_eq!(checkcast_template_for(&resolved).name, "checkcast");
        assert_eq!(
            checkcast_template_for(&unresolved).name,
            "checkcast_unresolved"
        );
    }

    #[test]
    #[should_panic]
    fn test_snippet_arity_checked() {
        let template = checkcast_template();
        XirSnippet::new(template, Vec::new(), Vec::new(), None);
    }

    #[test]
    fn test_array_templates_have_slow_paths() {
        let template = array_access_template(ValueKind::Int, false);
        assert!(!template.slow_path.is_empty());
        assert_eq!(template.inputs.len(), 2);
        assert!(template.result.is_some());
    }
}
