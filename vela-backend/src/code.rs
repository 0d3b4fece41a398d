use fixedbitset::FixedBitSet;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::operand::ObjectHandle;
use crate::stubs::StubKey;

pub const CODE_ALIGNMENT: usize = 16;

/// Identity of a method reachable through a patchable direct call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MethodId(pub u32);

/// Fixed runtime entry points this backend emits calls to. The runtime
/// resolves them to addresses when the code is installed.
#[derive(TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum RuntimeEntry {
    ThrowException,
    UnwindException,
    Deoptimize,
    StackOverflow,
    SafepointHandler,
    ResolveField,
    ResolveClass,
    ThrowBoundsCheck,
    ThrowClassCast,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallTarget {
    Runtime(RuntimeEntry),
    Method(MethodId),
    Stub(StubKey),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelocationKind {
    /// Patchable direct call; the recorded position is the return
    /// address, the four displacement bytes precede it.
    DirectCall(CallTarget),
    /// Inline or constant-pool resident object reference; the recorded
    /// position is the first byte of the 8-byte pattern to patch.
    ObjectHandle(ObjectHandle),
    /// 8-byte jump-table slot holding the given code offset.
    JumpTableEntry(u32),
}

#[derive(Clone, Debug)]
pub struct RelocationTable {
    entries: Vec<(u32, RelocationKind)>,
}

impl RelocationTable {
    pub fn new() -> RelocationTable {
        RelocationTable {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, offset: u32, kind: RelocationKind) {
        self.entries.push((offset, kind));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u32, RelocationKind)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl From<Vec<(u32, RelocationKind)>> for RelocationTable {
    fn from(entries: Vec<(u32, RelocationKind)>) -> RelocationTable {
        RelocationTable { entries }
    }
}

/// Live reference roots at one safepoint: which registers and which
/// stack slots hold object references.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcMap {
    registers: FixedBitSet,
    stack_slots: FixedBitSet,
}

impl GcMap {
    pub fn empty() -> GcMap {
        GcMap {
            registers: FixedBitSet::with_capacity(16),
            stack_slots: FixedBitSet::new(),
        }
    }

    pub fn new(registers: &[u8], stack_slots: &[u32]) -> GcMap {
        let mut reg_set = FixedBitSet::with_capacity(16);
        for &reg in registers {
            reg_set.insert(reg as usize);
        }

        let max_slot = stack_slots.iter().max().map(|&s| s as usize + 1).unwrap_or(0);
        let mut slot_set = FixedBitSet::with_capacity(max_slot);
        for &slot in stack_slots {
            slot_set.insert(slot as usize);
        }

        GcMap {
            registers: reg_set,
            stack_slots: slot_set,
        }
    }

    pub fn has_register(&self, reg: u8) -> bool {
        self.registers.contains(reg as usize)
    }

    pub fn has_stack_slot(&self, slot: u32) -> bool {
        self.stack_slots.contains(slot as usize)
    }

    pub fn registers(&self) -> impl Iterator<Item = usize> + '_ {
        self.registers.ones()
    }

    pub fn stack_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.stack_slots.ones()
    }
}

#[derive(Clone, Debug)]
pub struct SafepointTable {
    entries: Vec<(u32, GcMap)>,
}

impl SafepointTable {
    pub fn new() -> SafepointTable {
        SafepointTable {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, offset: u32, map: GcMap) {
        if let Some(last) = self.entries.last() {
            assert!(offset > last.0, "safepoints must be recorded in order");
        }

        self.entries.push((offset, map));
    }

    pub fn get(&self, offset: u32) -> Option<&GcMap> {
        self.entries
            .binary_search_by_key(&offset, |(o, _)| *o)
            .ok()
            .map(|idx| &self.entries[idx].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u32, GcMap)> {
        self.entries.iter()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
}

#[derive(Clone, Debug)]
pub struct ExceptionTable {
    entries: Vec<ExceptionEntry>,
}

impl ExceptionTable {
    pub fn new() -> ExceptionTable {
        ExceptionTable {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, entry: ExceptionEntry) {
        assert!(entry.start < entry.end);
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExceptionEntry> {
        self.entries.iter()
    }
}

/// Named code positions consumed by later binary patching, e.g. inline
/// cache rewriting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MarkKind {
    EntryPoint,
    InlineCache,
    StaticCallSite,
    Custom(u16),
}

#[derive(Clone, Debug)]
pub struct MarkTable {
    entries: Vec<(u32, MarkKind)>,
}

impl MarkTable {
    pub fn new() -> MarkTable {
        MarkTable {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, offset: u32, kind: MarkKind) {
        self.entries.push((offset, kind));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u32, MarkKind)> {
        self.entries.iter()
    }
}

#[derive(Clone, Debug)]
pub struct CommentTable {
    entries: Vec<(u32, String)>,
}

impl CommentTable {
    pub fn new() -> CommentTable {
        CommentTable {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, offset: u32, comment: String) {
        self.entries.push((offset, comment));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u32, String)> {
        self.entries.iter()
    }
}

/// The finished product of one compilation: machine code plus the side
/// tables the runtime needs to install, scan and patch it.
#[derive(Clone, Debug)]
pub struct CodeDescriptor {
    pub code: Vec<u8>,
    pub safepoints: SafepointTable,
    pub relocations: RelocationTable,
    pub exceptions: ExceptionTable,
    pub marks: MarkTable,
    pub comments: CommentTable,
    pub frame_size: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_map() {
        let map = GcMap::new(&[0, 3], &[1, 7]);
        assert!(map.has_register(0));
        assert!(map.has_register(3));
        assert!(!map.has_register(1));
        assert!(map.has_stack_slot(1));
        assert!(map.has_stack_slot(7));
        assert!(!map.has_stack_slot(0));
    }

    #[test]
    fn test_safepoint_lookup() {
        let mut table = SafepointTable::new();
        table.insert(4, GcMap::empty());
        table.insert(20, GcMap::new(&[2], &[]));
        assert!(table.get(4).is_some());
        assert!(table.get(20).unwrap().has_register(2));
        assert!(table.get(5).is_none());
    }

    #[test]
    #[should_panic]
    fn test_safepoint_order_enforced() {
        let mut table = SafepointTable::new();
        table.insert(20, GcMap::empty());
        table.insert(4, GcMap::empty());
    }

    #[test]
    #[should_panic]
    fn test_empty_exception_range_rejected() {
        let mut table = ExceptionTable::new();
        table.insert(ExceptionEntry {
            start: 8,
            end: 8,
            handler: 40,
        });
    }
}
