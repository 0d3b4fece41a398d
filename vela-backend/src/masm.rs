use crate::code::{
    CodeDescriptor, CommentTable, ExceptionEntry, ExceptionTable, GcMap, MarkKind, MarkTable,
    RelocationKind, RelocationTable, SafepointTable, CODE_ALIGNMENT,
};
use crate::cpu::{FReg, Reg};
use crate::operand::ObjectHandle;
use crate::target::Target;
pub use vela_asm::Label;

pub use self::x64::*;

pub mod x64;

/// Memory operand forms used by the semantic emission layer.
pub enum Mem {
    // rbp + offset
    Local(i32),

    // base + offset
    Base(Reg, i32),

    // base + index * scale + offset
    Index(Reg, Reg, i32, i32),

    // rsp + offset
    Outgoing(i32),
}

/// Data emitted after the code, referenced rip-relative.
pub enum EmbeddedConstant {
    Float32(u32),
    Float64(u64),
    Int128(u128),
    ObjectRef(ObjectHandle),
    JumpTable(Vec<Label>),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CondCode {
    Zero,
    NonZero,
    Equal,
    NotEqual,
    Greater,
    GreaterEq,
    Less,
    LessEq,
    UnsignedGreater,
    UnsignedGreaterEq,
    UnsignedLess,
    UnsignedLessEq,
}

impl CondCode {
    pub fn negate(self) -> CondCode {
        match self {
            CondCode::Zero => CondCode::NonZero,
            CondCode::NonZero => CondCode::Zero,
            CondCode::Equal => CondCode::NotEqual,
            CondCode::NotEqual => CondCode::Equal,
            CondCode::Greater => CondCode::LessEq,
            CondCode::GreaterEq => CondCode::Less,
            CondCode::Less => CondCode::GreaterEq,
            CondCode::LessEq => CondCode::Greater,
            CondCode::UnsignedGreater => CondCode::UnsignedLessEq,
            CondCode::UnsignedGreaterEq => CondCode::UnsignedLess,
            CondCode::UnsignedLess => CondCode::UnsignedGreaterEq,
            CondCode::UnsignedLessEq => CondCode::UnsignedGreater,
        }
    }
}

pub struct MacroAssembler {
    asm: Assembler,
    target: Target,
    safepoints: SafepointTable,
    relocations: Vec<(u32, RelocationKind)>,
    exception_fixups: Vec<(u32, u32, Label)>,
    marks: MarkTable,
    comments: CommentTable,
    embedded_constants: Vec<(Label, EmbeddedConstant)>,
    const_fixups: Vec<(u32, Label)>,
}

impl MacroAssembler {
    pub fn new(target: Target) -> MacroAssembler {
        MacroAssembler {
            asm: MacroAssembler::create_assembler(),
            target,
            safepoints: SafepointTable::new(),
            relocations: Vec::new(),
            exception_fixups: Vec::new(),
            marks: MarkTable::new(),
            comments: CommentTable::new(),
            embedded_constants: Vec::new(),
            const_fixups: Vec::new(),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn scratch(&self) -> Reg {
        self.target.scratch
    }

    pub fn fscratch(&self) -> FReg {
        self.target.fscratch
    }

    pub fn pos(&self) -> usize {
        self.asm.position()
    }

    pub fn create_label(&mut self) -> Label {
        self.asm.create_label()
    }

    pub fn create_and_bind_label(&mut self) -> Label {
        self.asm.create_and_bind_label()
    }

    pub fn bind_label(&mut self, lbl: Label) {
        self.asm.bind_label(lbl);
    }

    pub fn emit_comment(&mut self, comment: String) {
        let offset = self.pos() as u32;
        self.comments.insert(offset, comment);
    }

    /// Records a safepoint at the current position, i.e. right after
    /// the instruction that can stop the thread.
    pub fn emit_safepoint(&mut self, gc_map: GcMap) {
        let pos = self.pos() as u32;
        self.safepoints.insert(pos, gc_map);
    }

    /// Records a safepoint for an already-emitted instruction that can
    /// fault implicitly (null-checking load, divide); `pos` is the
    /// instruction start.
    pub fn record_safepoint_at(&mut self, pos: u32, gc_map: GcMap) {
        self.safepoints.insert(pos, gc_map);
    }

    pub fn record_exception(&mut self, start: u32, end: u32, handler: Label) {
        self.exception_fixups.push((start, end, handler));
    }

    pub fn record_mark(&mut self, kind: MarkKind) {
        let pos = self.pos() as u32;
        self.marks.insert(pos, kind);
    }

    pub fn record_relocation(&mut self, offset: u32, kind: RelocationKind) {
        self.relocations.push((offset, kind));
    }

    pub fn emit_const(&mut self, value: EmbeddedConstant) -> Label {
        let label = self.create_label();
        self.embedded_constants.push((label, value));
        label
    }

    pub fn emit_jump_table(&mut self, targets: Vec<Label>) -> Label {
        assert!(!targets.is_empty());
        self.emit_const(EmbeddedConstant::JumpTable(targets))
    }

    /// Records a rip-relative 32-bit displacement at `disp_pos` that
    /// must point at `label` once the constant area is laid out.
    pub(crate) fn record_const_fixup(&mut self, disp_pos: u32, label: Label) {
        self.const_fixups.push((disp_pos, label));
    }

    pub fn emit_u8(&mut self, value: u8) {
        self.asm.emit_u8(value);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.asm.emit_u32(value);
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.asm.emit_u64(value);
    }

    /// Finalizes into the machine-code blob plus side tables.
    pub fn code(mut self, frame_size: i32) -> CodeDescriptor {
        let jump_table_sites = self.emit_embedded_constants();
        self.resolve_const_fixups();

        for (slot, target) in jump_table_sites {
            let offset = self.asm.offset(target).expect("unbound jump-table target");
            self.relocations
                .push((slot, RelocationKind::JumpTableEntry(offset)));
        }

        let mut exceptions = ExceptionTable::new();
        for (start, end, handler) in std::mem::take(&mut self.exception_fixups) {
            let handler = self.asm.offset(handler).expect("unbound exception handler");
            exceptions.insert(ExceptionEntry {
                start,
                end,
                handler,
            });
        }

        let finalized = self.asm.finalize(CODE_ALIGNMENT);

        CodeDescriptor {
            code: finalized.code(),
            safepoints: self.safepoints,
            relocations: RelocationTable::from(self.relocations),
            exceptions,
            marks: self.marks,
            comments: self.comments,
            frame_size,
        }
    }

    /// Raw finalized bytes, for code without side tables.
    pub fn data(mut self) -> Vec<u8> {
        let jump_table_sites = self.emit_embedded_constants();
        assert!(jump_table_sites.is_empty());
        self.resolve_const_fixups();
        self.asm.finalize(1).code()
    }

    fn emit_embedded_constants(&mut self) -> Vec<(u32, Label)> {
        let mut jump_table_sites = Vec::new();

        for (label, value) in std::mem::take(&mut self.embedded_constants) {
            let align = match value {
                EmbeddedConstant::Float32(..) => std::mem::size_of::<u32>(),
                EmbeddedConstant::Float64(..)
                | EmbeddedConstant::ObjectRef(..)
                | EmbeddedConstant::JumpTable(..) => std::mem::size_of::<u64>(),
                EmbeddedConstant::Int128(..) => std::mem::size_of::<u128>(),
            };

            self.asm.align_to(align);
            self.asm.bind_label(label);

            match value {
                EmbeddedConstant::Float32(bits) => {
                    self.asm.emit_u32(bits);
                }

                EmbeddedConstant::Float64(bits) => {
                    self.asm.emit_u64(bits);
                }

                EmbeddedConstant::Int128(value) => {
                    self.asm.emit_u64(value as u64);
                    self.asm.emit_u64((value >> 64) as u64);
                }

                EmbeddedConstant::ObjectRef(handle) => {
                    let pos = self.asm.position() as u32;
                    self.asm.emit_u64(handle.0 as u64);
                    self.relocations
                        .push((pos, RelocationKind::ObjectHandle(handle)));
                }

                EmbeddedConstant::JumpTable(targets) => {
                    for target in targets {
                        let pos = self.asm.position() as u32;
                        self.asm.emit_u64(0);
                        jump_table_sites.push((pos, target));
                    }
                }
            }
        }

        jump_table_sites
    }

    fn resolve_const_fixups(&mut self) {
        let fixups = std::mem::take(&mut self.const_fixups);
        let old_position = self.asm.position();

        for (disp_pos, label) in fixups {
            let target = self.asm.offset(label).expect("unbound constant") as i32;
            let disp = target - (disp_pos as i32 + 4);
            self.asm.set_position(disp_pos as usize);
            self.asm.emit_u32(disp as u32);
        }

        self.asm.set_position(old_position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_labels() {
        let mut masm = MacroAssembler::new(Target::default());

        masm.create_label();
        masm.create_label();
    }

    #[test]
    #[should_panic]
    fn test_bind_label_twice() {
        let mut masm = MacroAssembler::new(Target::default());
        let lbl = masm.create_label();

        masm.bind_label(lbl);
        masm.bind_label(lbl);
    }

    #[test]
    fn test_cond_negate() {
        assert_eq!(CondCode::Equal.negate(), CondCode::NotEqual);
        assert_eq!(CondCode::Less.negate(), CondCode::GreaterEq);
        assert_eq!(
            CondCode::UnsignedGreaterEq.negate(),
            CondCode::UnsignedLess
        );
    }

    #[test]
    fn test_float_const_pool() {
        let mut masm = MacroAssembler::new(Target::default());
        masm.load_float_const(crate::mode::MachineMode::Float64, crate::cpu::XMM1, 1.5f64.to_bits());
        let data = masm.data();

        // constant pool holds the exact bit pattern, 8-byte aligned
        let tail = &data[data.len() - 8..];
        assert_eq!(u64::from_le_bytes(tail.try_into().unwrap()), 1.5f64.to_bits());
    }

    #[test]
    fn test_comment_table() {
        let mut masm = MacroAssembler::new(Target::default());
        masm.emit_comment("prologue".into());
        let descriptor = masm.code(16);
        assert_eq!(descriptor.comments.iter().count(), 1);
    }
}
