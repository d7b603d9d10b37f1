//! Byte buffer for machine code with rel32 label fixups.

use thiserror::Error;

use super::JitError;
use super::memory::ExecutableMemory;

/// A position in the code, bound once and referenced any number of times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("label {0} referenced but never bound")]
pub struct UnboundLabel(pub usize);

#[derive(Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
    /// Bound offset per label
    labels: Vec<Option<usize>>,
    /// (offset of the rel32 field, label)
    fixups: Vec<(usize, Label)>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the current offset.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len());
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.labels[label.0].is_some()
    }

    /// Emits a rel32 field pointing at `label`, patched in [`Self::finish`].
    pub fn emit_rel32(&mut self, label: Label) {
        self.fixups.push((self.code.len(), label));
        self.emit_u32(0);
    }

    /// Resolves every fixup. Displacements are relative to the end of the
    /// 4-byte field.
    pub fn finish(mut self) -> Result<Vec<u8>, UnboundLabel> {
        for (at, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0].ok_or(UnboundLabel(label.0))?;
            let rel = target as i64 - (at as i64 + 4);
            self.code[at..at + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        Ok(self.code)
    }

    /// Resolves fixups and maps the code executable.
    pub fn into_executable(self) -> Result<ExecutableMemory, JitError> {
        let code = self.finish()?;
        Ok(ExecutableMemory::from_code(&code)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_and_backward_fixups() {
        let mut buf = CodeBuffer::new();
        let top = buf.new_label();
        let end = buf.new_label();
        buf.bind(top);
        buf.emit_u8(0xe9);
        buf.emit_rel32(end);
        buf.emit_u8(0xe9);
        buf.emit_rel32(top);
        buf.bind(end);
        let code = buf.finish().unwrap();
        // First jump skips the second: +5.
        assert_eq!(&code[1..5], &5i32.to_le_bytes());
        // Second jump lands on offset 0 from the end of its field at 10.
        assert_eq!(&code[6..10], &(-10i32).to_le_bytes());
    }

    #[test]
    fn test_unbound_label() {
        let mut buf = CodeBuffer::new();
        let l = buf.new_label();
        buf.emit_rel32(l);
        assert!(!buf.is_bound(l));
        assert_eq!(buf.finish(), Err(UnboundLabel(0)));
    }
}
