use crate::code::{GcMap, MethodId, RuntimeEntry};
use crate::masm::CondCode;
use crate::operand::Operand;
use crate::xir::XirSnippet;

/// Branch target within one compilation's operation stream. Bound by a
/// `LirOp::Label` exactly once.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LirLabel(pub u32);

/// Reference to a field that may or may not be resolved yet. The
/// backend only consults the resolution state to pick a template
/// variant; it never resolves anything itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FieldRef {
    pub id: u32,
    pub offset: Option<i32>,
}

impl FieldRef {
    pub fn is_resolved(&self) -> bool {
        self.offset.is_some()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClassRef {
    pub id: u32,
    pub resolved: bool,
}

/// Garbage-collection roots and exception-handler reachability at one
/// program point.
#[derive(Clone, Debug)]
pub struct DebugInfo {
    pub gc_map: GcMap,
    pub exception_handler: Option<LirLabel>,
}

impl DebugInfo {
    pub fn new(gc_map: GcMap) -> DebugInfo {
        DebugInfo {
            gc_map,
            exception_handler: None,
        }
    }

    pub fn with_handler(gc_map: GcMap, handler: LirLabel) -> DebugInfo {
        DebugInfo {
            gc_map,
            exception_handler: Some(handler),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Udiv,
    Urem,
    And,
    Or,
    Xor,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Ushr,
}

/// Numeric conversions with the source language's exact semantics:
/// truncation, sign extension and float-to-int saturation are
/// correctness-critical.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConvertOp {
    I2L,
    L2I,
    I2B,
    I2C,
    I2S,
    I2F,
    I2D,
    L2F,
    L2D,
    F2D,
    D2F,
    F2I,
    F2L,
    D2I,
    D2L,
    MovI2F,
    MovF2I,
    MovL2D,
    MovD2L,
}

#[derive(Clone, Debug)]
pub enum CallKind {
    /// Patchable call to a compiled method.
    Direct(MethodId),
    /// Call through a register or stack value.
    Indirect(Operand),
    /// Call to a C function at a known absolute address.
    Native(u64),
    /// Call to a fixed runtime entry point.
    Runtime(RuntimeEntry),
}

/// One operation of the register-allocated low-level stream. Consumed
/// strictly in order; the assembler never reorders or mutates the list.
#[derive(Clone, Debug)]
pub enum LirOp {
    Label(LirLabel),
    Move {
        src: Operand,
        dest: Operand,
        info: Option<DebugInfo>,
    },
    Convert {
        op: ConvertOp,
        src: Operand,
        dest: Operand,
    },
    Arith {
        op: ArithOp,
        left: Operand,
        right: Operand,
        dest: Operand,
        info: Option<DebugInfo>,
    },
    Shift {
        op: ShiftOp,
        value: Operand,
        count: Operand,
        dest: Operand,
    },
    Negate {
        src: Operand,
        dest: Operand,
    },
    Compare {
        left: Operand,
        right: Operand,
    },
    Branch {
        cond: CondCode,
        target: LirLabel,
        /// For float compares: whether an unordered result (NaN) takes
        /// the branch.
        unordered_is_true: bool,
    },
    Jump(LirLabel),
    CondMove {
        cond: CondCode,
        opr1: Operand,
        opr2: Operand,
        dest: Operand,
    },
    TableSwitch {
        index: Operand,
        temp: Operand,
        lo: i32,
        targets: Vec<LirLabel>,
        default: LirLabel,
    },
    Call {
        kind: CallKind,
        args: Vec<Operand>,
        result: Option<Operand>,
        info: Option<DebugInfo>,
    },
    CompareAndSwap {
        addr: Operand,
        expected: Operand,
        new_value: Operand,
        result: Operand,
    },
    Safepoint {
        info: DebugInfo,
    },
    Return(Option<Operand>),
    Throw {
        exception: Operand,
        info: Option<DebugInfo>,
    },
    Unwind {
        exception: Operand,
    },
    Xir {
        snippet: XirSnippet,
        info: Option<DebugInfo>,
    },
}
