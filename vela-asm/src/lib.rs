use byteorder::{LittleEndian, WriteBytesExt};

pub mod x64;

use std::convert::TryInto;

/// A code-buffer position that is referenced before it is known.
///
/// A label is bound at most once; binding twice is a bug in the emitter
/// driving the assembler and asserts.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Label(usize);

/// Handle for a 32-bit placeholder emitted into the instruction stream.
///
/// The token is move-only and consumed by `patch_u32`, so every
/// placeholder is resolved exactly once.
#[derive(Debug)]
pub struct PatchToken {
    offset: u32,
}

impl PatchToken {
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

pub struct AssemblerBuffer {
    code: Vec<u8>,
    position: usize,
    labels: Vec<Option<u32>>,
}

impl AssemblerBuffer {
    pub fn new() -> AssemblerBuffer {
        AssemblerBuffer {
            code: Vec::new(),
            position: 0,
            labels: Vec::new(),
        }
    }

    pub fn create_label(&mut self) -> Label {
        self.labels.push(None);

        Label(self.labels.len() - 1)
    }

    pub fn create_and_bind_label(&mut self) -> Label {
        self.labels.push(Some(self.position().try_into().unwrap()));
        Label(self.labels.len() - 1)
    }

    pub fn bind_label(&mut self, lbl: Label) {
        let Label(idx) = lbl;
        assert!(self.labels[idx].is_none(), "label bound twice");
        self.labels[idx] = Some(self.position().try_into().unwrap());
    }

    pub fn offset(&self, lbl: Label) -> Option<u32> {
        let Label(idx) = lbl;
        self.labels[idx]
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, pos: usize) {
        assert!(pos <= self.code.len());
        self.position = pos;
    }

    pub fn set_position_end(&mut self) {
        self.position = self.code.len();
    }

    /// Truncates the buffer back to empty. Only legal between two
    /// independent emission attempts, never in the middle of one.
    pub fn reset(&mut self) {
        self.code.clear();
        self.position = 0;
        self.labels.clear();
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, value: u8) {
        if self.position == self.code.len() {
            self.code.push(value);
        } else {
            self.code[self.position] = value;
        }
        self.position += 1;
    }

    pub fn emit_u32(&mut self, value: u32) {
        if self.position == self.code.len() {
            self.code.write_u32::<LittleEndian>(value).unwrap()
        } else {
            (&mut self.code[self.position..])
                .write_u32::<LittleEndian>(value)
                .unwrap();
        }
        self.position += 4;
    }

    pub fn emit_u64(&mut self, value: u64) {
        if self.position == self.code.len() {
            self.code.write_u64::<LittleEndian>(value).unwrap()
        } else {
            (&mut self.code[self.position..])
                .write_u64::<LittleEndian>(value)
                .unwrap();
        }
        self.position += 8;
    }

    pub fn get_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.code[offset..offset + 4].try_into().unwrap())
    }

    pub fn emit_placeholder_u32(&mut self) -> PatchToken {
        let offset = self.position().try_into().expect("offset overflow");
        self.emit_u32(0);
        PatchToken { offset }
    }

    pub fn patch_u32(&mut self, token: PatchToken, value: u32) {
        let old_position = self.position();
        self.set_position(token.offset as usize);
        self.emit_u32(value);
        self.set_position(old_position);
    }

    pub fn align_to(&mut self, alignment: usize) {
        assert_eq!(self.position, self.code.len());

        while self.code.len() % alignment != 0 {
            self.emit_u8(0);
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_position() {
        let mut buf = AssemblerBuffer::new();
        buf.emit_u8(0x90);
        buf.emit_u32(0xDEAD_BEEF);
        assert_eq!(buf.position(), 5);
        assert_eq!(buf.get_u32(1), 0xDEAD_BEEF);
    }

    #[test]
    fn test_positioned_overwrite() {
        let mut buf = AssemblerBuffer::new();
        buf.emit_u32(0);
        buf.emit_u8(0xC3);
        buf.set_position(0);
        buf.emit_u32(0x1234_5678);
        buf.set_position_end();
        assert_eq!(buf.get_u32(0), 0x1234_5678);
        assert_eq!(buf.position(), 5);
    }

    #[test]
    fn test_patch_token() {
        let mut buf = AssemblerBuffer::new();
        buf.emit_u8(0xE8);
        let token = buf.emit_placeholder_u32();
        buf.emit_u8(0xC3);
        buf.patch_u32(token, 0x1122_3344);
        assert_eq!(buf.get_u32(1), 0x1122_3344);
        assert_eq!(buf.position(), 6);
    }

    #[test]
    #[should_panic]
    fn test_bind_label_twice() {
        let mut buf = AssemblerBuffer::new();
        let lbl = buf.create_label();
        buf.bind_label(lbl);
        buf.bind_label(lbl);
    }

    #[test]
    fn test_reset() {
        let mut buf = AssemblerBuffer::new();
        buf.emit_u64(0x0102_0304_0506_0708);
        buf.reset();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.len(), 0);
    }
}
