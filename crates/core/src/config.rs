//! Diagnostic configuration shared by the compiler, the VM, and the GC.
//!
//! The CLI sets these once at startup and passes them down explicitly;
//! nothing in the pipeline reads process-wide state.

/// Diagnostic toggles for a compiler/VM instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugOptions {
    /// Disassemble each function's chunk after it compiles.
    pub print_code: bool,
    /// Trace the value stack and each instruction as it executes.
    pub trace_execution: bool,
    /// Log collection cycles and reclaimed byte counts.
    pub log_gc: bool,
    /// Collect before every allocation instead of waiting for the watermark.
    pub stress_gc: bool,
}
