//! Core runtime for the Lox bytecode VM.
//!
//! Key design principles:
//! - Value: what the language talks about (nil, booleans, numbers, object
//!   handles). Two interchangeable representations behind one API: a tagged
//!   enum (default) and an 8-byte NaN-boxed word (`nanbox` feature).
//! - Obj: heap data owned by the garbage collector, addressed through
//!   stable arena handles rather than raw pointers.
//! - Chunk: one function's bytecode, constant pool, and line map.

pub mod chunk;
pub mod config;
pub mod debug;
pub mod gc;
pub mod globals;
pub mod object;
pub mod table;

pub mod value;

#[cfg(feature = "nanbox")]
pub mod nanbox;

pub use chunk::{Chunk, OpCode};
pub use config::DebugOptions;
pub use gc::{Gc, Heap};
pub use globals::Globals;
pub use object::{Obj, ObjHandle};
pub use table::Table;

#[cfg(not(feature = "nanbox"))]
pub use value::Value;

#[cfg(feature = "nanbox")]
pub use nanbox::Value;
