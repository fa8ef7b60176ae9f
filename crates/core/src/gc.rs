//! Precise mark-sweep garbage collection over an arena of heap objects.
//!
//! Every object lives in a slot of the [`Heap`] arena and is addressed by a
//! stable [`ObjHandle`]. Collection is triggered from allocation sites when
//! the allocated-byte watermark is crossed (or before every allocation in
//! stress mode). The caller that owns the root set passes a marking closure
//! to [`Gc::collect`]; the temp-root stack, pinned values, and the weak
//! intern table are handled internally.
//!
//! The mark "color" is a boolean that flips after each cycle, so survivors
//! never need their mark bit cleared: an object is marked when its bit
//! equals the collector's current flag.

use crate::DebugOptions;
use crate::Value;
use crate::object::{LoxString, Obj, ObjHandle};
use crate::table::{Table, hash_str};

/// After a collection the next trigger is `bytes_allocated * 2`.
pub const HEAP_GROW_FACTOR: usize = 2;

const FIRST_GC: usize = 1024 * 1024;

struct ObjHeader {
    marked: bool,
    size: usize,
    obj: Obj,
}

/// The object arena. Freed slots are recycled through a free list; live
/// objects never move, so handles stay valid across collections.
#[derive(Default)]
pub struct Heap {
    slots: Vec<Option<ObjHeader>>,
    free: Vec<usize>,
}

macro_rules! obj_accessors {
    ($( $get:ident, $get_mut:ident, $variant:ident, $ty:ty; )*) => {
        impl Heap {
            $(
                #[inline]
                pub fn $get(&self, handle: ObjHandle) -> &$ty {
                    match self.get(handle) {
                        Obj::$variant(inner) => inner,
                        _ => panic!(concat!("object is not a ", stringify!($variant))),
                    }
                }

                #[inline]
                pub fn $get_mut(&mut self, handle: ObjHandle) -> &mut $ty {
                    match self.get_mut(handle) {
                        Obj::$variant(inner) => inner,
                        _ => panic!(concat!("object is not a ", stringify!($variant))),
                    }
                }
            )*
        }
    };
}

obj_accessors! {
    string, string_mut, String, crate::object::LoxString;
    function, function_mut, Function, crate::object::Function;
    closure, closure_mut, Closure, crate::object::Closure;
    upvalue, upvalue_mut, Upvalue, crate::object::Upvalue;
    class, class_mut, Class, crate::object::Class;
    instance, instance_mut, Instance, crate::object::Instance;
    bound_method, bound_method_mut, BoundMethod, crate::object::BoundMethod;
    list, list_mut, List, crate::object::List;
    map, map_mut, Map, crate::object::LoxMap;
    native, native_mut, Native, crate::object::Native;
}

impl Heap {
    #[inline]
    pub fn get(&self, handle: ObjHandle) -> &Obj {
        match &self.slots[handle.index() as usize] {
            Some(header) => &header.obj,
            None => panic!("dangling object handle"),
        }
    }

    #[inline]
    pub fn get_mut(&mut self, handle: ObjHandle) -> &mut Obj {
        match &mut self.slots[handle.index() as usize] {
            Some(header) => &mut header.obj,
            None => panic!("dangling object handle"),
        }
    }

    #[inline]
    pub fn is_string(&self, value: Value) -> bool {
        value
            .as_obj()
            .is_some_and(|h| matches!(self.get(h), Obj::String(_)))
    }

    /// The characters of a string value. Only call on string values.
    #[inline]
    pub fn string_chars(&self, value: Value) -> &str {
        match value.as_obj() {
            Some(handle) => &self.string(handle).chars,
            None => panic!("value is not a string"),
        }
    }

    /// Set or insert an instance field. Taking the table out keeps the
    /// borrow on `self` available for hashing the key.
    pub fn set_field(&mut self, instance: ObjHandle, name: Value, value: Value) {
        let mut fields = std::mem::take(&mut self.instance_mut(instance).fields);
        fields.set(self, name, value);
        self.instance_mut(instance).fields = fields;
    }

    /// Insert or update a map entry.
    pub fn map_set(&mut self, map: ObjHandle, key: Value, value: Value) {
        let mut entries = std::mem::take(&mut self.map_mut(map).entries);
        entries.set(self, key, value);
        self.map_mut(map).entries = entries;
    }

    /// Add a method to a class's method table.
    pub fn add_method(&mut self, class: ObjHandle, name: Value, method: Value) {
        let mut methods = std::mem::take(&mut self.class_mut(class).methods);
        methods.set(self, name, method);
        self.class_mut(class).methods = methods;
    }

    /// Copy-import every method of `superclass` into `subclass`.
    pub fn inherit_methods(&mut self, superclass: ObjHandle, subclass: ObjHandle) {
        let inherited: Vec<(Value, Value)> = self.class(superclass).methods.iter().collect();
        let mut methods = std::mem::take(&mut self.class_mut(subclass).methods);
        for (name, method) in inherited {
            methods.set(self, name, method);
        }
        self.class_mut(subclass).methods = methods;
    }

    /// Render a value for `print` and the disassembler.
    pub fn format_value(&self, value: Value) -> String {
        if value.is_nil() {
            return "nil".to_string();
        }
        if value.is_bool() {
            return if value.as_bool() { "true" } else { "false" }.to_string();
        }
        if value.is_number() {
            return crate::value::format_number(value.as_number());
        }
        match value.as_obj() {
            Some(handle) => self.format_object(handle),
            None => "nil".to_string(),
        }
    }

    fn format_object(&self, handle: ObjHandle) -> String {
        match self.get(handle) {
            Obj::String(s) => s.chars.clone(),
            Obj::Function(f) => match f.name {
                Some(name) => format!("<fn {}>", self.string(name).chars),
                None => "<script>".to_string(),
            },
            Obj::Closure(c) => self.format_object(c.function),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Class(c) => self.string(c.name).chars.clone(),
            Obj::Instance(i) => {
                format!("{} instance", self.string(self.class(i.class).name).chars)
            }
            Obj::BoundMethod(b) => self.format_object(b.method),
            Obj::List(l) => {
                let items: Vec<String> = l.items.iter().map(|v| self.format_value(*v)).collect();
                format!("[{}]", items.join(", "))
            }
            Obj::Map(m) => {
                let entries: Vec<String> = m
                    .entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", self.format_value(k), self.format_value(v)))
                    .collect();
                format!("{{{}}}", entries.join(", "))
            }
            Obj::Native(_) => "<native fn>".to_string(),
        }
    }

    fn approximate_size(obj: &Obj) -> usize {
        let payload = match obj {
            Obj::String(s) => s.chars.len(),
            Obj::Function(f) => {
                f.chunk.code.capacity() + f.chunk.constants.capacity() * size_of::<Value>()
            }
            Obj::Closure(c) => c.upvalues.capacity() * size_of::<ObjHandle>(),
            Obj::List(l) => l.items.capacity() * size_of::<Value>(),
            _ => 0,
        };
        size_of::<ObjHeader>() + payload
    }
}

/// The collector: the arena plus the weak intern table, temp roots, pinned
/// roots, and allocation accounting.
pub struct Gc {
    heap: Heap,
    strings: Table,
    temp_roots: Vec<Value>,
    pinned: Vec<Value>,
    gray: Vec<ObjHandle>,
    bytes_allocated: usize,
    next_gc: usize,
    mark_flag: bool,
    log_gc: bool,
    stress_gc: bool,
}

impl Gc {
    pub fn new(opts: &DebugOptions) -> Gc {
        Gc {
            heap: Heap::default(),
            strings: Table::default(),
            temp_roots: Vec::new(),
            pinned: Vec::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC,
            mark_flag: true,
            log_gc: opts.log_gc,
            stress_gc: opts.stress_gc,
        }
    }

    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    #[inline]
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// True when the next allocation should collect first. Callers check
    /// this and run [`Gc::collect`] with their roots before allocating.
    #[inline]
    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    /// Move an object into the arena. Does not collect; new objects start
    /// white for the next cycle.
    pub fn alloc(&mut self, obj: Obj) -> ObjHandle {
        let size = Heap::approximate_size(&obj);
        self.bytes_allocated += size;
        let header = ObjHeader {
            marked: !self.mark_flag,
            size,
            obj,
        };
        let index = match self.heap.free.pop() {
            Some(index) => {
                self.heap.slots[index] = Some(header);
                index
            }
            None => {
                self.heap.slots.push(Some(header));
                self.heap.slots.len() - 1
            }
        };
        ObjHandle::from_index(index as u32)
    }

    /// Look up an interned string by contents.
    pub fn find_string(&self, chars: &str) -> Option<ObjHandle> {
        self.strings.find_string(&self.heap, chars, hash_str(chars))
    }

    /// Allocate and intern a new string. The caller is expected to have
    /// checked [`Gc::find_string`] first and run any pending collection;
    /// the new string is temp-rooted across the table insert.
    pub fn intern_new(&mut self, chars: &str) -> ObjHandle {
        let hash = hash_str(chars);
        let handle = self.alloc(Obj::String(LoxString {
            chars: chars.to_string(),
            hash,
        }));
        self.temp_roots.push(Value::obj(handle));
        let Gc { heap, strings, .. } = self;
        strings.set(heap, Value::obj(handle), Value::NIL);
        self.temp_roots.pop();
        handle
    }

    /// Protect a value while it is in flight between allocation and
    /// installation into a reachable container.
    pub fn push_temp(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub fn pop_temp(&mut self) {
        debug_assert!(!self.temp_roots.is_empty());
        self.temp_roots.pop();
    }

    /// Root a value for the rest of the VM's lifetime (the interned `init`
    /// string survives collections triggered mid-compile this way).
    pub fn pin(&mut self, value: Value) {
        self.pinned.push(value);
    }

    /// Run a full collection. `mark_roots` grays the caller's roots (value
    /// stack, call frames, open upvalues, globals, compiler chain); temp
    /// and pinned roots are added here, then reachability is traced, white
    /// strings drop out of the weak intern table, and the sweep frees
    /// everything unmarked.
    pub fn collect<F>(&mut self, mark_roots: F)
    where
        F: FnOnce(&mut Gc),
    {
        if self.log_gc {
            eprintln!("-- gc begin");
        }
        let before = self.bytes_allocated;

        mark_roots(self);
        for value in self.temp_roots.clone() {
            self.mark_value(value);
        }
        for value in self.pinned.clone() {
            self.mark_value(value);
        }
        self.trace_references();
        self.remove_white_strings();
        self.sweep();

        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;
        self.mark_flag = !self.mark_flag;

        if self.log_gc {
            eprintln!("-- gc end");
            eprintln!(
                "   collected {} bytes (from {} to {}) next at {}",
                before - self.bytes_allocated,
                before,
                self.bytes_allocated,
                self.next_gc
            );
        }
    }

    /// Gray a root value.
    pub fn mark_value(&mut self, value: Value) {
        if let Some(handle) = value.as_obj() {
            self.mark_object(handle);
        }
    }

    /// Gray a root object.
    pub fn mark_object(&mut self, handle: ObjHandle) {
        let Some(header) = &mut self.heap.slots[handle.index() as usize] else {
            return;
        };
        if header.marked == self.mark_flag {
            return;
        }
        header.marked = self.mark_flag;
        self.gray.push(handle);
    }

    /// Gray every key and value of a strong table (globals).
    pub fn mark_table(&mut self, table: &Table) {
        let entries: Vec<(Value, Value)> = table.iter().collect();
        for (key, value) in entries {
            self.mark_value(key);
            self.mark_value(value);
        }
    }

    /// Pop-and-blacken until no gray objects remain. Children are gathered
    /// first so the arena is not borrowed while marking; no Lox allocation
    /// can happen here, so marking never re-enters the collector.
    fn trace_references(&mut self) {
        while let Some(handle) = self.gray.pop() {
            let children = self.children_of(handle);
            for child in children {
                self.mark_value(child);
            }
        }
    }

    fn children_of(&self, handle: ObjHandle) -> Vec<Value> {
        let mut children = Vec::new();
        match self.heap.get(handle) {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    children.push(Value::obj(name));
                }
                children.extend_from_slice(&f.chunk.constants);
            }
            Obj::Closure(c) => {
                children.push(Value::obj(c.function));
                children.extend(c.upvalues.iter().map(|&u| Value::obj(u)));
            }
            Obj::Upvalue(u) => {
                if let crate::object::UpvalueState::Closed(value) = &u.state {
                    children.push(*value);
                }
            }
            Obj::Class(c) => {
                children.push(Value::obj(c.name));
                for (key, value) in c.methods.iter() {
                    children.push(key);
                    children.push(value);
                }
            }
            Obj::Instance(i) => {
                children.push(Value::obj(i.class));
                for (key, value) in i.fields.iter() {
                    children.push(key);
                    children.push(value);
                }
            }
            Obj::BoundMethod(b) => {
                children.push(b.receiver);
                children.push(Value::obj(b.method));
            }
            Obj::List(l) => children.extend_from_slice(&l.items),
            Obj::Map(m) => {
                for (key, value) in m.entries.iter() {
                    children.push(key);
                    children.push(value);
                }
            }
        }
        children
    }

    /// Drop unmarked strings from the weak intern table before the sweep
    /// would leave their entries dangling.
    fn remove_white_strings(&mut self) {
        let Gc {
            heap,
            strings,
            mark_flag,
            ..
        } = self;
        let flag = *mark_flag;
        strings.remove_white(|handle| match &heap.slots[handle.index() as usize] {
            Some(header) => header.marked != flag,
            None => true,
        });
    }

    fn sweep(&mut self) {
        for index in 0..self.heap.slots.len() {
            let Some(header) = &self.heap.slots[index] else {
                continue;
            };
            if header.marked != self.mark_flag {
                self.bytes_allocated -= header.size.min(self.bytes_allocated);
                self.heap.slots[index] = None;
                self.heap.free.push(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::List;

    fn gc() -> Gc {
        Gc::new(&DebugOptions::default())
    }

    fn alive(gc: &Gc, handle: ObjHandle) -> bool {
        gc.heap.slots[handle.index() as usize].is_some()
    }

    #[test]
    fn test_collect_frees_unreachable_objects() {
        let mut gc = gc();
        let garbage = gc.alloc(Obj::List(List { items: Vec::new() }));
        let rooted = gc.alloc(Obj::List(List { items: Vec::new() }));
        gc.collect(|gc| gc.mark_object(rooted));
        assert!(!alive(&gc, garbage));
        assert!(alive(&gc, rooted));
    }

    #[test]
    fn test_collect_traces_children() {
        let mut gc = gc();
        let inner = gc.intern_new("kept alive through the list");
        let outer = gc.alloc(Obj::List(List {
            items: vec![Value::obj(inner)],
        }));
        gc.collect(|gc| gc.mark_object(outer));
        assert!(alive(&gc, inner));
    }

    #[test]
    fn test_temp_roots_survive() {
        let mut gc = gc();
        let handle = gc.alloc(Obj::List(List { items: Vec::new() }));
        gc.push_temp(Value::obj(handle));
        gc.collect(|_| {});
        assert!(alive(&gc, handle));
        gc.pop_temp();
        gc.collect(|_| {});
        assert!(!alive(&gc, handle));
    }

    #[test]
    fn test_weak_intern_table_is_pruned() {
        let mut gc = gc();
        let dead = gc.intern_new("nobody references this");
        let kept = gc.intern_new("rooted");
        gc.collect(|gc| gc.mark_object(kept));
        assert!(!alive(&gc, dead));
        assert_eq!(gc.find_string("nobody references this"), None);
        assert_eq!(gc.find_string("rooted"), Some(kept));
    }

    #[test]
    fn test_pinned_values_survive_every_cycle() {
        let mut gc = gc();
        let init = gc.intern_new("init");
        gc.pin(Value::obj(init));
        gc.collect(|_| {});
        gc.collect(|_| {});
        assert!(alive(&gc, init));
        assert_eq!(gc.find_string("init"), Some(init));
    }

    #[test]
    fn test_mark_color_alternates_across_cycles() {
        let mut gc = gc();
        let rooted = gc.alloc(Obj::List(List { items: Vec::new() }));
        // Surviving one cycle must not make an object immortal.
        gc.collect(|gc| gc.mark_object(rooted));
        assert!(alive(&gc, rooted));
        gc.collect(|_| {});
        assert!(!alive(&gc, rooted));
    }

    #[test]
    fn test_slot_reuse_after_free() {
        let mut gc = gc();
        let first = gc.alloc(Obj::List(List { items: Vec::new() }));
        gc.collect(|_| {});
        let second = gc.alloc(Obj::List(List { items: Vec::new() }));
        assert_eq!(first.index(), second.index());
    }

    #[test]
    fn test_bytes_accounting_shrinks_after_collect() {
        let mut gc = gc();
        for i in 0..100 {
            gc.intern_new(&format!("string number {}", i));
        }
        let before = gc.bytes_allocated();
        gc.collect(|_| {});
        assert!(gc.bytes_allocated() < before);
    }

    #[test]
    fn test_interning_returns_identical_handles() {
        let mut gc = gc();
        let a = gc.intern_new("twice");
        // Callers consult find_string before interning anew.
        let b = gc.find_string("twice");
        assert_eq!(b, Some(a));
    }
}
