//! Variable-length bytecode encoding, the `Label` patch abstraction, and the
//! instruction→source-location side map (§4.6).

use crate::ast::Span;
use crate::bytecode::op::Opcode;

/// Reserved operand value meaning "this branch has not been patched yet".
/// §3: "The value 0x00FFFFFF is reserved as 'unpatched label'."
pub const UNPATCHED: u32 = 0x00FF_FFFF;

/// Largest value a 24-bit operand can hold, leaving `UNPATCHED` reserved.
pub const MAX_OPERAND: u32 = UNPATCHED - 1;

/// A forward (or backward) branch target. Labels are created with
/// [`BytecodeBuffer::new_label`], bound to a byte position with
/// [`BytecodeBuffer::bind_label`], and every label created must be bound
/// exactly once before the buffer is finalized — enforced by a debug-only
/// check in tests, since a silently-left sentinel would corrupt control
/// flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

struct PendingPatch {
    /// Byte offset of the operand (not the opcode) to patch.
    operand_at: usize,
    label: Label,
}

/// A growable bytecode stream plus its label table and source-location side
/// map.
#[derive(Debug, Default)]
pub struct BytecodeBuffer {
    code: Vec<u8>,
    source_map: Vec<(u32, Span)>,
    label_targets: Vec<Option<u32>>,
    pending: Vec<PendingPatchRecord>,
}

#[derive(Debug, Clone, Copy)]
struct PendingPatchRecord {
    operand_at: u32,
    label: Label,
}

impl BytecodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn new_label(&mut self) -> Label {
        self.label_targets.push(None);
        Label((self.label_targets.len() - 1) as u32)
    }

    /// Binds `label` to the current end of the buffer (the next instruction
    /// emitted will be its target).
    pub fn bind_label(&mut self, label: Label) {
        let here = self.code.len() as u32;
        let slot = &mut self.label_targets[label.0 as usize];
        debug_assert!(slot.is_none(), "label bound twice");
        *slot = Some(here);
    }

    fn record_source(&mut self, span: Span) {
        let at = self.code.len() as u32;
        if self.source_map.last().is_none_or(|(_, last)| *last != span) {
            self.source_map.push((at, span));
        }
    }

    /// Emits an opcode with no operand.
    pub fn emit(&mut self, op: Opcode, span: Span) {
        debug_assert!(!op.has_operand(), "{op:?} requires an operand");
        self.record_source(span);
        self.code.push(op.to_byte());
    }

    fn push_operand(&mut self, operand: u32) {
        debug_assert!(operand <= UNPATCHED, "operand overflows 24 bits");
        let bytes = operand.to_le_bytes();
        self.code.push(bytes[0]);
        self.code.push(bytes[1]);
        self.code.push(bytes[2]);
    }

    /// Emits an opcode with a resolved 24-bit operand.
    pub fn emit_operand(&mut self, op: Opcode, operand: u32, span: Span) {
        debug_assert!(op.has_operand(), "{op:?} takes no operand");
        self.record_source(span);
        self.code.push(op.to_byte());
        self.push_operand(operand);
    }

    /// Emits a branch opcode targeting `label`, which may not be bound yet.
    /// The operand is patched to the label's byte offset when the buffer is
    /// finalized with [`BytecodeBuffer::patch_all`].
    pub fn emit_branch(&mut self, op: Opcode, label: Label, span: Span) {
        debug_assert!(op.has_operand());
        self.record_source(span);
        self.code.push(op.to_byte());
        let operand_at = self.code.len() as u32;
        self.push_operand(UNPATCHED);
        self.pending.push(PendingPatchRecord { operand_at, label });
    }

    /// Resolves every pending branch against its now-bound label. Must be
    /// called once after a procedure body is fully emitted; panics (in
    /// debug builds) if any label was never bound, matching the invariant
    /// that no opcode's operand may remain `UNPATCHED` after compilation
    /// (§8 "Label patching").
    pub fn patch_all(&mut self) {
        for PendingPatchRecord { operand_at, label } in std::mem::take(&mut self.pending) {
            let target = self.label_targets[label.0 as usize].expect("label left unbound");
            let bytes = target.to_le_bytes();
            let at = operand_at as usize;
            self.code[at] = bytes[0];
            self.code[at + 1] = bytes[1];
            self.code[at + 2] = bytes[2];
        }
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<(u32, Span)>) {
        debug_assert!(self.pending.is_empty(), "patch_all not called before finalizing");
        (self.code, self.source_map)
    }
}

/// Reads the opcode and (if present) operand at `pc`, returning the byte
/// length consumed.
pub fn decode_at(code: &[u8], pc: usize) -> (Opcode, u32, usize) {
    let op = Opcode::from_byte(code[pc]);
    if op.has_operand() {
        let operand = u32::from_le_bytes([code[pc + 1], code[pc + 2], code[pc + 3], 0]);
        (op, operand, 4)
    } else {
        (op, 0, 1)
    }
}

/// Looks up the source span covering `pc` in a source map produced by
/// [`BytecodeBuffer::into_parts`] (§8 "Source map completeness").
pub fn span_at(source_map: &[(u32, Span)], pc: u32) -> Span {
    match source_map.binary_search_by_key(&pc, |(offset, _)| *offset) {
        Ok(i) => source_map[i].1,
        Err(0) => Span::UNKNOWN,
        Err(i) => source_map[i - 1].1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(line: u32) -> Span {
        Span { source_index: 0, line, column: 1 }
    }

    #[test]
    fn forward_branch_patches_to_bound_target() {
        let mut buf = BytecodeBuffer::new();
        let label = buf.new_label();
        buf.emit_branch(Opcode::Jmp, label, span(1));
        buf.emit(Opcode::Not, span(2));
        buf.bind_label(label);
        buf.emit(Opcode::Neg, span(3));
        buf.patch_all();
        let (code, _) = buf.into_parts();
        let (op, target, _) = decode_at(&code, 0);
        assert_eq!(op, Opcode::Jmp);
        assert_eq!(target, 5); // Jmp(4 bytes) + Not(1 byte)
    }

    #[test]
    #[should_panic(expected = "label left unbound")]
    fn unbound_label_panics_on_patch() {
        let mut buf = BytecodeBuffer::new();
        let label = buf.new_label();
        buf.emit_branch(Opcode::Jmp, label, span(1));
        buf.patch_all();
    }

    #[test]
    fn source_map_is_monotonic_and_queryable() {
        let mut buf = BytecodeBuffer::new();
        buf.emit(Opcode::Not, span(1));
        buf.emit(Opcode::Neg, span(2));
        buf.emit(Opcode::Not, span(2));
        buf.patch_all();
        let (_, map) = buf.into_parts();
        assert_eq!(span_at(&map, 0).line, 1);
        assert_eq!(span_at(&map, 1).line, 2);
        assert_eq!(span_at(&map, 2).line, 2);
    }
}
