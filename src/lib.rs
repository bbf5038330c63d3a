//! Tokudae bytecode compiler core.
//!
//! The pipeline: characters → lexer → single-pass parser (which drives
//! the emitter and fills the constant pool) → a `Proto` tree →
//! optionally the marshaller → bytes. The VM executing the result, the
//! garbage collector and the standard libraries are external
//! collaborators reached through the seams in `state`.

pub mod bytecode;
mod compiler;
pub mod errors;
pub mod intern;
pub mod lexer;
pub mod limits;
pub mod marshal;
mod parser;
pub mod state;
pub mod value;

pub use errors::{Error, SyntaxError};
pub use state::{Closure, GcHooks, Mode, NullGc, State};
pub use bytecode::{OpCode, Proto};
pub use value::Value;

pub const VERSION: &str = "Tokudae 1.0";
