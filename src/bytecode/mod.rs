//! The bytecode buffer and opcode set (C6, §4.6).

pub mod buffer;
pub mod op;
pub mod procedure;

pub use buffer::{BytecodeBuffer, Label, MAX_OPERAND, UNPATCHED, decode_at, span_at};
pub use op::Opcode;
pub use procedure::{LiteralPool, PoolLiteral, Procedure};
