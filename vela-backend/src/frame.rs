use crate::cpu::{Reg, PARAM_OFFSET, STACK_FRAME_ALIGNMENT};
use crate::operand::StackSlot;
use crate::target::Target;

fn align_i32(value: i32, align: i32) -> i32 {
    (value + align - 1) / align * align
}

/// Frame requirements as computed upstream: slot counts and the set of
/// callee-saved registers the register allocator actually used.
#[derive(Clone, Debug)]
pub struct FrameDescriptor {
    pub spill_slots: u32,
    pub outgoing_slots: u32,
    pub callee_saved: Vec<Reg>,
}

impl FrameDescriptor {
    pub fn empty() -> FrameDescriptor {
        FrameDescriptor {
            spill_slots: 0,
            outgoing_slots: 0,
            callee_saved: Vec::new(),
        }
    }
}

/// Immutable frame layout, computed once before emission starts.
///
/// All offsets are relative to the frame pointer. Layout, top down:
///
///   rbp + 16 ..  incoming arguments (caller frame)
///   rbp +  8     return address
///   rbp +  0     saved frame pointer
///   rbp -  8 ..  spill slots
///   ...          callee-save area
///   rsp +  0 ..  outgoing argument slots
///
/// Every slot occupies eight bytes; the total is 16-byte aligned.
#[derive(Clone, Debug)]
pub struct FrameMap {
    spill_slots: u32,
    outgoing_slots: u32,
    callee_saved: Vec<(Reg, i32)>,
    frame_size: i32,
    page_size: usize,
    shadow_pages: usize,
}

impl FrameMap {
    pub fn new(desc: &FrameDescriptor, target: &Target) -> FrameMap {
        let spill_size = desc.spill_slots as i32 * 8;
        let callee_saved: Vec<(Reg, i32)> = desc
            .callee_saved
            .iter()
            .enumerate()
            .map(|(idx, &reg)| (reg, -(spill_size + (idx as i32 + 1) * 8)))
            .collect();

        let raw_size = 16
            + spill_size
            + callee_saved.len() as i32 * 8
            + desc.outgoing_slots as i32 * 8;
        let frame_size = align_i32(raw_size, STACK_FRAME_ALIGNMENT as i32);

        FrameMap {
            spill_slots: desc.spill_slots,
            outgoing_slots: desc.outgoing_slots,
            callee_saved,
            frame_size,
            page_size: target.page_size,
            shadow_pages: target.stack_shadow_pages,
        }
    }

    /// Total frame size including return address and saved frame
    /// pointer.
    pub fn frame_size(&self) -> i32 {
        self.frame_size
    }

    /// The amount the prologue subtracts from the stack pointer.
    pub fn allocation_size(&self) -> i32 {
        self.frame_size - 16
    }

    pub fn spill_slots(&self) -> u32 {
        self.spill_slots
    }

    pub fn outgoing_slots(&self) -> u32 {
        self.outgoing_slots
    }

    pub fn callee_saved(&self) -> &[(Reg, i32)] {
        &self.callee_saved
    }

    /// Frame-pointer-relative byte offset of a stack slot.
    pub fn stack_slot_offset(&self, index: u32, caller_frame: bool) -> i32 {
        if caller_frame {
            PARAM_OFFSET + index as i32 * 8
        } else {
            assert!(index < self.spill_slots, "spill slot out of range");
            -((index as i32 + 1) * 8)
        }
    }

    pub fn slot_offset(&self, slot: &StackSlot) -> i32 {
        self.stack_slot_offset(slot.index, slot.caller_frame)
    }

    /// Stack-pointer-relative byte offset of an outgoing argument slot.
    pub fn outgoing_slot_offset(&self, index: u32) -> i32 {
        assert!(index < self.outgoing_slots, "outgoing slot out of range");
        index as i32 * 8
    }

    /// Positions the prologue touches below the stack pointer so the
    /// guard page traps before a large frame is used. Offsets follow
    /// `(page + shadow_pages) * page_size - frame_size`; frames within
    /// a single page need no bang.
    pub fn bang_offsets(&self) -> Vec<i32> {
        let page_size = self.page_size as i32;

        if self.frame_size <= page_size {
            return Vec::new();
        }

        let last_page = self.frame_size / page_size;
        (0..=last_page)
            .map(|page| (page + self.shadow_pages as i32) * page_size - self.frame_size)
            .filter(|&offset| offset > 0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{R12, RBX};

    fn frame(spill: u32, outgoing: u32, saved: Vec<Reg>) -> FrameMap {
        let desc = FrameDescriptor {
            spill_slots: spill,
            outgoing_slots: outgoing,
            callee_saved: saved,
        };
        FrameMap::new(&desc, &Target::default())
    }

    #[test]
    fn test_empty_frame() {
        let map = frame(0, 0, Vec::new());
        assert_eq!(map.frame_size(), 16);
        assert_eq!(map.allocation_size(), 0);
        assert!(map.bang_offsets().is_empty());
    }

    #[test]
    fn test_frame_is_aligned() {
        let map = frame(1, 0, Vec::new());
        assert_eq!(map.frame_size() % STACK_FRAME_ALIGNMENT as i32, 0);
        assert_eq!(map.frame_size(), 32);
    }

    #[test]
    fn test_slot_offsets_disjoint() {
        let map = frame(4, 2, vec![RBX, R12]);

        let mut offsets: Vec<i32> = (0..4).map(|i| map.stack_slot_offset(i, false)).collect();
        for i in 0..4 {
            for j in 0..4 {
                if i != j {
                    assert_ne!(
                        map.stack_slot_offset(i, false),
                        map.stack_slot_offset(j, false)
                    );
                }
            }
        }

        // callee-save area below the spill area
        for &(_, offset) in map.callee_saved() {
            assert!(offset < -(4 * 8 - 8));
            offsets.push(offset);
        }

        offsets.sort();
        offsets.dedup();
        assert_eq!(offsets.len(), 6);
    }

    #[test]
    fn test_caller_frame_offsets() {
        let map = frame(0, 0, Vec::new());
        assert_eq!(map.stack_slot_offset(0, true), 16);
        assert_eq!(map.stack_slot_offset(1, true), 24);
    }

    #[test]
    fn test_outgoing_offsets_monotone() {
        let map = frame(0, 3, Vec::new());
        assert_eq!(map.outgoing_slot_offset(0), 0);
        assert_eq!(map.outgoing_slot_offset(1), 8);
        assert_eq!(map.outgoing_slot_offset(2), 16);
    }

    #[test]
    #[should_panic]
    fn test_spill_slot_out_of_range() {
        let map = frame(2, 0, Vec::new());
        map.stack_slot_offset(2, false);
    }

    #[test]
    fn test_bang_offsets_large_frame() {
        let desc = FrameDescriptor {
            spill_slots: 1200,
            outgoing_slots: 0,
            callee_saved: Vec::new(),
        };
        let target = Target::default();
        let map = FrameMap::new(&desc, &target);

        // 1200 slots -> 9616 bytes, two pages traversed
        let offsets = map.bang_offsets();
        assert!(!offsets.is_empty());

        let page = target.page_size as i32;
        let frame_size = map.frame_size();
        for &offset in &offsets {
            assert!(offset > 0);
            assert_eq!(
                (offset + frame_size) % page,
                0,
                "bang offset must land on a page boundary relative to the frame base"
            );
        }

        // one bang per traversed page
        for pair in offsets.windows(2) {
            assert_eq!(pair[1] - pair[0], page);
        }

        // deepest bang reaches past the whole frame plus shadow area
        let deepest = *offsets.last().unwrap();
        assert_eq!(
            deepest,
            (frame_size / page + target.stack_shadow_pages as i32) * page - frame_size
        );
    }
}
