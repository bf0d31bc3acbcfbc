//! VM execution tracing (§4.12, C12).
//!
//! [`crate::runtime::Tracer`] is a generic parameter rather than a trait
//! object, so [`crate::runtime::NoopTracer`] (the production default)
//! monomorphizes down to nothing — identical to how the teacher crate's
//! `VmTracer`/`NoopTracer` pair eliminates instrumentation overhead when
//! unused. This module supplies the two concrete, non-noop observers named
//! in the design: a human-readable [`StderrTracer`] and a machine-checkable
//! [`RecordingTracer`] used by this crate's own determinism tests.

use crate::bytecode::Opcode;
use crate::runtime::Tracer;

/// One recorded execution event, in the order the VM produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    /// An opcode was dispatched at `ip` within `procedure_index`.
    Instruction { procedure_index: u32, ip: usize, opcode: Opcode },
    /// A `Debug` opcode switched the current source file.
    DebugMarker { source_index: u32 },
}

/// Prints a human-readable execution log to stderr.
///
/// ```text
/// [proc 0 @   0] SLoad
/// [proc 0 @   4] SLoad
/// [proc 0 @   8] Add
/// ```
#[derive(Debug)]
pub struct StderrTracer {
    limit: Option<usize>,
    count: usize,
    stopped: bool,
}

impl StderrTracer {
    pub fn new() -> Self {
        Self { limit: None, count: 0, stopped: false }
    }

    /// Stops producing output after `limit` instructions, so tracing a hot
    /// loop doesn't flood stderr.
    pub fn with_limit(limit: usize) -> Self {
        Self { limit: Some(limit), count: 0, stopped: false }
    }
}

impl Default for StderrTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer for StderrTracer {
    fn on_instruction(&mut self, procedure_index: u32, ip: usize, opcode: Opcode) {
        if self.stopped {
            return;
        }
        eprintln!("[proc {procedure_index} @ {ip:>5}] {opcode:?}");
        self.count += 1;
        if let Some(limit) = self.limit
            && self.count >= limit
        {
            eprintln!("--- trace limit reached ({limit} instructions) ---");
            self.stopped = true;
        }
    }

    fn on_debug_marker(&mut self, source_index: u32) {
        if self.stopped {
            return;
        }
        eprintln!("  ... source {source_index}");
    }
}

/// Records every dispatched instruction and debug marker into a `Vec`, for
/// golden-trace assertions: two independent compiles of the same source and
/// seed are expected to produce identical event streams (§8 "Determinism").
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
    limit: Option<usize>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self { events: Vec::new(), limit: None }
    }

    pub fn with_limit(limit: usize) -> Self {
        Self { events: Vec::with_capacity(limit.min(1024)), limit: Some(limit) }
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    fn at_limit(&self) -> bool {
        self.limit.is_some_and(|l| self.events.len() >= l)
    }
}

impl Tracer for RecordingTracer {
    fn on_instruction(&mut self, procedure_index: u32, ip: usize, opcode: Opcode) {
        if self.at_limit() {
            return;
        }
        self.events.push(TraceEvent::Instruction { procedure_index, ip, opcode });
    }

    fn on_debug_marker(&mut self, source_index: u32) {
        if self.at_limit() {
            return;
        }
        self.events.push(TraceEvent::DebugMarker { source_index });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_tracer_captures_instructions_in_order() {
        let mut tracer = RecordingTracer::new();
        tracer.on_instruction(0, 0, Opcode::LInt);
        tracer.on_instruction(0, 4, Opcode::Ret);
        assert_eq!(
            tracer.events(),
            &[
                TraceEvent::Instruction { procedure_index: 0, ip: 0, opcode: Opcode::LInt },
                TraceEvent::Instruction { procedure_index: 0, ip: 4, opcode: Opcode::Ret },
            ]
        );
    }

    #[test]
    fn recording_tracer_stops_at_its_limit() {
        let mut tracer = RecordingTracer::with_limit(1);
        tracer.on_instruction(0, 0, Opcode::LInt);
        tracer.on_instruction(0, 4, Opcode::Ret);
        assert_eq!(tracer.events().len(), 1);
    }
}
