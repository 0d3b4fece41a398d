use crate::cpu::{FReg, Reg, FREG_SCRATCH, REG_SCRATCH, REG_THREAD};

/// Immutable target policy handed to every component at construction.
/// Nothing in the backend consults ambient state for these values.
#[derive(Copy, Clone, Debug)]
pub struct Target {
    pub page_size: usize,
    pub stack_shadow_pages: usize,

    /// Object constants are either materialized as an inline immediate
    /// (patched through a relocation on the immediate bytes) or loaded
    /// from a constant-pool slot (relocation on the slot).
    pub inline_objects: bool,

    /// Register reserved for multi-step address computation; must never
    /// alias an operand register.
    pub scratch: Reg,
    pub fscratch: FReg,

    /// Register holding the per-thread anchor; safepoint polls load
    /// through it.
    pub thread_register: Reg,
    pub safepoint_offset: i32,
}

impl Default for Target {
    fn default() -> Target {
        Target {
            page_size: 4096,
            stack_shadow_pages: 5,
            inline_objects: true,
            scratch: REG_SCRATCH,
            fscratch: FREG_SCRATCH,
            thread_register: REG_THREAD,
            safepoint_offset: 0,
        }
    }
}
