use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::assembler::{CompilationFlags, LirAssembler};
use crate::code::CodeDescriptor;
use crate::cpu::PARAM_OFFSET;
use crate::frame::{FrameDescriptor, FrameMap};
use crate::masm::{CondCode, MacroAssembler, Mem};
use crate::mode::{MachineMode, ValueKind};
use crate::operand::ConstValue;
use crate::target::Target;
use crate::xir;

/// Stable identity of a compiler stub. Stubs are built at most once
/// per cache and shared across call sites.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StubKey {
    F2I,
    F2L,
    D2I,
    D2L,
    Template(&'static str),
}

pub struct CompiledStub {
    pub key: StubKey,
    pub code: CodeDescriptor,
}

/// Shared stub cache. The only mutable state shared between
/// compilations; when two compilations race to build the same key,
/// both may build but only the first insert is retained and every
/// caller observes that one blob.
pub struct StubCache {
    target: Target,
    stubs: Mutex<HashMap<StubKey, Arc<CompiledStub>>>,
}

impl StubCache {
    pub fn new(target: Target) -> StubCache {
        StubCache {
            target,
            stubs: Mutex::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, key: StubKey) -> Arc<CompiledStub> {
        if let Some(stub) = self.stubs.lock().get(&key) {
            return stub.clone();
        }

        // Build outside the lock: a stub body may itself request other
        // stubs, and racing builders are resolved at insert time.
        let built = Arc::new(self.build(&key));

        let mut stubs = self.stubs.lock();
        stubs.entry(key).or_insert(built).clone()
    }

    pub fn len(&self) -> usize {
        self.stubs.lock().len()
    }

    fn build(&self, key: &StubKey) -> CompiledStub {
        let code = match key {
            StubKey::F2I => {
                conversion_stub(&self.target, MachineMode::Float32, MachineMode::Int32)
            }
            StubKey::F2L => {
                conversion_stub(&self.target, MachineMode::Float32, MachineMode::Int64)
            }
            StubKey::D2I => {
                conversion_stub(&self.target, MachineMode::Float64, MachineMode::Int32)
            }
            StubKey::D2L => {
                conversion_stub(&self.target, MachineMode::Float64, MachineMode::Int64)
            }
            StubKey::Template(name) => template_stub(self, name),
        };

        CompiledStub {
            key: key.clone(),
            code,
        }
    }
}

/// Correction stub for float-to-int conversions. Called only when the
/// hardware conversion produced the MIN sentinel; computes the source
/// language's saturation semantics instead: NaN becomes zero, overflow
/// saturates to MIN/MAX. The argument arrives in the caller's first
/// outgoing slot and the result replaces it; only the designated
/// scratch registers are touched.
fn conversion_stub(target: &Target, src: MachineMode, dest: MachineMode) -> CodeDescriptor {
    let mut masm = MacroAssembler::new(*target);
    let frame = FrameMap::new(&FrameDescriptor::empty(), target);
    let fscratch = masm.fscratch();
    let scratch = masm.scratch();

    let src_kind = match src {
        MachineMode::Float32 => ValueKind::Float,
        MachineMode::Float64 => ValueKind::Double,
        _ => unreachable!(),
    };

    let lbl_nan = masm.create_label();
    let lbl_neg = masm.create_label();
    let lbl_done = masm.create_label();

    masm.prolog(&frame);
    masm.load_mem(src_kind, fscratch.into(), Mem::Local(PARAM_OFFSET));
    masm.float_cmp(src, fscratch, fscratch);
    masm.jump_if_parity(lbl_nan);

    // sign bit decides which bound the value exceeded
    match src {
        MachineMode::Float32 => masm.float_as_int(scratch, fscratch),
        MachineMode::Float64 => masm.double_as_long(scratch, fscratch),
        _ => unreachable!(),
    }
    masm.cmp_reg_imm(src_int_mode(src), scratch, 0);
    masm.jump_if(CondCode::Less, lbl_neg);

    store_result(&mut masm, dest, max_value(dest));
    masm.jump(lbl_done);

    masm.bind_label(lbl_neg);
    store_result(&mut masm, dest, min_value(dest));
    masm.jump(lbl_done);

    masm.bind_label(lbl_nan);
    store_result(&mut masm, dest, 0);

    masm.bind_label(lbl_done);
    masm.epilog(&frame);

    masm.code(frame.frame_size())
}

fn src_int_mode(src: MachineMode) -> MachineMode {
    match src {
        MachineMode::Float32 => MachineMode::Int32,
        MachineMode::Float64 => MachineMode::Int64,
        _ => unreachable!(),
    }
}

fn max_value(dest: MachineMode) -> i64 {
    match dest {
        MachineMode::Int32 => i32::max_value() as i64,
        MachineMode::Int64 => i64::max_value(),
        _ => unreachable!(),
    }
}

fn min_value(dest: MachineMode) -> i64 {
    match dest {
        MachineMode::Int32 => i32::min_value() as i64,
        MachineMode::Int64 => i64::min_value(),
        _ => unreachable!(),
    }
}

fn store_result(masm: &mut MacroAssembler, dest: MachineMode, value: i64) {
    let kind = match dest {
        MachineMode::Int32 => ValueKind::Int,
        MachineMode::Int64 => ValueKind::Long,
        _ => unreachable!(),
    };

    let constant = match dest {
        MachineMode::Int32 => ConstValue::Int(value as i32),
        MachineMode::Int64 => ConstValue::Long(value),
        _ => unreachable!(),
    };

    masm.store_const(kind, Mem::Local(PARAM_OFFSET), constant);
}

/// Builds a standalone blob from a named template. The template is
/// responsible for its own frame via PushFrame/PopFrame.
fn template_stub(cache: &StubCache, name: &str) -> CodeDescriptor {
    let template =
        xir::template_by_name(name).unwrap_or_else(|| panic!("unknown template stub {}", name));
    let snippet = xir::bind_template_to_convention(&template);

    let frame = FrameMap::new(
        &FrameDescriptor {
            spill_slots: 0,
            outgoing_slots: 2,
            callee_saved: Vec::new(),
        },
        &cache.target,
    );

    let asm = LirAssembler::new(
        &frame,
        cache.target,
        cache,
        CompilationFlags {
            emit_comments: false,
        },
    );
    asm.assemble_stub(&snippet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memoization_identity() {
        let cache = StubCache::new(Target::default());
        let first = cache.lookup(StubKey::D2L);
        let second = cache.lookup(StubKey::D2L);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_request_order_does_not_change_bodies() {
        let cache_a = StubCache::new(Target::default());
        let a1 = cache_a.lookup(StubKey::F2I);
        let _ = cache_a.lookup(StubKey::D2I);

        let cache_b = StubCache::new(Target::default());
        let _ = cache_b.lookup(StubKey::D2I);
        let b1 = cache_b.lookup(StubKey::F2I);

        assert_eq!(a1.code.code, b1.code.code);
    }

    #[test]
    fn test_conversion_stub_shape() {
        let cache = StubCache::new(Target::default());
        let stub = cache.lookup(StubKey::F2I);

        // prologue, body, epilogue with a final ret
        let code = &stub.code.code;
        assert_eq!(code[0], 0x55);
        assert!(code.contains(&0xC3));
    }

    #[test]
    fn test_template_stub_builds_from_registry() {
        let cache = StubCache::new(Target::default());
        let stub = cache.lookup(StubKey::Template("checkcast"));

        assert_eq!(stub.code.code[0], 0x55);
        // the slow path ends in the trap filler behind the epilogue
        let ret = stub.code.code.iter().position(|&b| b == 0xC3).unwrap();
        assert!(stub.code.code[ret..].contains(&0xCC));

        let again = cache.lookup(StubKey::Template("checkcast"));
        assert!(Arc::ptr_eq(&stub, &again));
    }
}
