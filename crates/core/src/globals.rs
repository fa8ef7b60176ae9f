//! Global variable registry shared by the compiler and the VM.
//!
//! Globals are identified by interned name. The first time a name is seen
//! (at compile time or when `DEFINE_GLOBAL` runs) it is assigned a stable
//! slot; the name table maps name -> slot and the slot array holds the
//! current value, `None` while the variable is still undefined. Stable
//! slots are what let the compiler emit the `GET_GLOBAL_I`/`SET_GLOBAL_I`
//! fast path for names it has already seen.

use crate::Value;
use crate::gc::{Gc, Heap};
use crate::object::ObjHandle;
use crate::table::Table;

#[derive(Default)]
pub struct Globals {
    /// Interned name -> slot index (stored as a number value).
    names: Table,
    /// Slot index -> name, for error messages and marking.
    list: Vec<ObjHandle>,
    /// Slot index -> value; `None` until defined.
    slots: Vec<Option<Value>>,
}

impl Globals {
    pub fn new() -> Globals {
        Globals::default()
    }

    /// The slot for `name`, if the name has been seen before.
    pub fn slot_index(&self, heap: &Heap, name: ObjHandle) -> Option<usize> {
        self.names
            .get(heap, Value::obj(name))
            .map(|v| v.as_number() as usize)
    }

    /// The slot for `name`, reserving a fresh undefined slot on first sight.
    pub fn ensure_slot(&mut self, heap: &Heap, name: ObjHandle) -> usize {
        if let Some(index) = self.slot_index(heap, name) {
            return index;
        }
        let index = self.slots.len();
        self.slots.push(None);
        self.list.push(name);
        self.names
            .set(heap, Value::obj(name), Value::number(index as f64));
        index
    }

    /// Current value of a slot; `None` while undefined.
    pub fn get(&self, index: usize) -> Option<Value> {
        self.slots.get(index).copied().flatten()
    }

    /// Define (or redefine) the variable in `index`.
    pub fn define(&mut self, index: usize, value: Value) {
        self.slots[index] = Some(value);
    }

    /// Assign to an already-defined variable. False when it was never
    /// defined, which the VM reports as an undefined-variable error.
    pub fn set_existing(&mut self, index: usize, value: Value) -> bool {
        match self.slots.get_mut(index) {
            Some(slot @ Some(_)) => {
                *slot = Some(value);
                true
            }
            _ => false,
        }
    }

    /// The name interned for a slot.
    pub fn name_at(&self, index: usize) -> ObjHandle {
        self.list[index]
    }

    /// Gray the name table and every defined value.
    pub fn mark(&self, gc: &mut Gc) {
        for &name in &self.list {
            gc.mark_object(name);
        }
        for value in self.slots.iter().flatten() {
            gc.mark_value(*value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DebugOptions;

    #[test]
    fn test_slots_are_stable_and_undefined_until_defined() {
        let mut gc = Gc::new(&DebugOptions::default());
        let mut globals = Globals::new();
        let x = gc.intern_new("x");
        let y = gc.intern_new("y");

        assert_eq!(globals.slot_index(gc.heap(), x), None);
        let xi = globals.ensure_slot(gc.heap(), x);
        let yi = globals.ensure_slot(gc.heap(), y);
        assert_ne!(xi, yi);
        assert_eq!(globals.ensure_slot(gc.heap(), x), xi);

        assert!(globals.get(xi).is_none());
        assert!(!globals.set_existing(xi, Value::number(1.0)));
        globals.define(xi, Value::number(1.0));
        assert!(globals.set_existing(xi, Value::number(2.0)));
        assert!(globals.get(xi).is_some_and(|v| v.equals(Value::number(2.0))));
        assert_eq!(globals.name_at(xi), x);
    }
}
