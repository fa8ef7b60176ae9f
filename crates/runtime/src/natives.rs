//! Built-in native functions.

use lox_core::Value;

use crate::vm::Vm;

/// Register every native in a fresh VM's globals.
pub fn install(vm: &mut Vm<'_>) {
    let start = vm.start_time();
    vm.define_native(
        "clock",
        0,
        Box::new(move |_args| Ok(Value::number(start.elapsed().as_secs_f64()))),
    );
}
