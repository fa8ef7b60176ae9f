//! Lox compiler front end.
//!
//! A single pass lowers source text straight to bytecode: the scanner feeds
//! tokens to a Pratt parser that emits into the current function's chunk
//! while resolving locals, upvalues, classes, and `super` on the fly.

pub mod compiler;
pub mod scanner;

pub use compiler::compile;
pub use scanner::{Scanner, Token, TokenType};
