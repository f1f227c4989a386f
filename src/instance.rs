use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::debug_println;
use crate::error::Error::*;
use crate::error::*;
use crate::execute::{execute, ExecutionResult};
use crate::leb128::{read_leb128, read_sleb128};
use crate::memory::WasmMemory;
use crate::module::{ExternType, Module};
use crate::signature::{Signature, ValType};
use crate::stack::WasmValue;

// --------------- Callables ---------------

/// Host function ABI: (invoking instance, argument view, call depth).
/// One 64-bit word per Wasm parameter; the thunk may read and write the
/// instance's memory directly.
pub type HostFunc = Rc<dyn Fn(&Rc<Instance>, &[WasmValue], u32) -> ExecutionResult>;

#[derive(Clone)]
pub enum FuncKind {
    /// Function with a body in the owning module, named by its index in the
    /// module function index space.
    Wasm { func_idx: u32 },
    /// Imported callable behind the uniform host thunk. Cross-instance
    /// exports are host thunks that close over the exporting instance.
    Host { thunk: HostFunc },
}

#[derive(Clone)]
pub struct RuntimeFunction {
    pub ty: Signature,
    pub kind: FuncKind,
}

impl RuntimeFunction {
    pub fn new_host<F>(params: Vec<ValType>, result: Option<ValType>, f: F) -> Self
    where
        F: Fn(&Rc<Instance>, &[WasmValue], u32) -> ExecutionResult + 'static,
    {
        Self {
            ty: Signature { params, result },
            kind: FuncKind::Host { thunk: Rc::new(f) },
        }
    }

    /// Wraps an exported function of `instance` for import into another
    /// instance. The thunk re-enters `execute` in the exporting instance at
    /// the depth it was handed, so the depth limit spans both instances.
    pub fn exported(instance: &Rc<Instance>, func_idx: u32) -> Self {
        let ty = instance.functions[func_idx as usize].ty.clone();
        let owner = instance.clone();
        Self {
            ty,
            kind: FuncKind::Host {
                thunk: Rc::new(move |_, args, depth| {
                    execute(&owner, func_idx as usize, args, depth)
                }),
            },
        }
    }
}

// --------------- Tables ---------------

#[derive(Clone)]
pub enum TableTarget {
    /// Function owned by an instance; the reference is weak so a table can
    /// be entered into by instances it outlives.
    Instance { owner: Weak<Instance>, func_idx: u32 },
    /// Embedder-provided callable with no owning instance.
    Host { thunk: HostFunc },
}

/// An initialized table slot: the callable plus its type, checked against
/// the expected type at every indirect call.
#[derive(Clone)]
pub struct TableFunction {
    pub ty: Signature,
    pub target: TableTarget,
}

pub struct WasmTable {
    elements: Vec<Option<TableFunction>>,
    maximum: u32,
    /// Instances that failed to instantiate after writing entries into this
    /// table. Kept alive as long as the table so those entries stay
    /// callable.
    keepalive: Vec<Rc<Instance>>,
}

impl WasmTable {
    pub fn new(initial: u32, maximum: u32) -> Self {
        Self {
            elements: vec![None; initial as usize],
            maximum,
            keepalive: Vec::new(),
        }
    }

    pub fn size(&self) -> u32 {
        self.elements.len() as u32
    }

    pub fn max(&self) -> u32 {
        self.maximum
    }

    pub fn grow(&mut self, delta: u32) -> u32 {
        let current = self.size();
        if delta == 0 {
            return current;
        }
        if delta > self.maximum.saturating_sub(current) {
            return u32::MAX;
        }
        self.elements.resize((current + delta) as usize, None);
        current
    }

    pub fn get(&self, idx: u32) -> Result<Option<TableFunction>, &'static str> {
        self.elements.get(idx as usize).cloned().ok_or(UNDEF_ELEM)
    }

    pub fn set(&mut self, idx: u32, entry: Option<TableFunction>) -> Result<(), &'static str> {
        let slot = self.elements.get_mut(idx as usize).ok_or(UNDEF_ELEM)?;
        *slot = entry;
        Ok(())
    }

    fn keep_alive(&mut self, instance: Rc<Instance>) {
        self.keepalive.push(instance);
    }
}

// --------------- Globals ---------------

pub struct WasmGlobal {
    pub ty: ValType,
    pub mutable: bool,
    pub value: WasmValue,
}

// --------------- Instance ---------------

/// Runtime embodiment of a module: resolved callables for the whole
/// function index space, the (owned or imported) table and memory, and the
/// global cells.
pub struct Instance {
    pub module: Rc<Module>,
    pub functions: Vec<RuntimeFunction>,
    pub table: Option<Rc<RefCell<WasmTable>>>,
    pub memory: Option<Rc<RefCell<WasmMemory>>>,
    pub globals: Vec<Rc<RefCell<WasmGlobal>>>,
}

/// Builds an instance from a module and positional import lists: each
/// import of a kind is satisfied by the provided value at the same
/// position. Ordering is fixed and observable: match imports, allocate
/// defined table/memory, evaluate globals, apply element segments, apply
/// data segments, run the start function.
///
/// A failure after element segments have been copied into an *imported*
/// table leaves those writes in place; the failed instance then stays
/// alive as long as the table so the entries remain callable.
pub fn instantiate(
    module: Rc<Module>,
    imported_functions: Vec<RuntimeFunction>,
    imported_table: Option<Rc<RefCell<WasmTable>>>,
    imported_memory: Option<Rc<RefCell<WasmMemory>>>,
    imported_globals: Vec<Rc<RefCell<WasmGlobal>>>,
) -> Result<Rc<Instance>, Error> {
    // Functions: imports first, then defined, checked positionally
    let n_func_imports = module.imported_function_count();
    if imported_functions.len() != n_func_imports {
        return Err(Link(IMPORT_COUNT_MISMATCH));
    }
    let mut functions = Vec::with_capacity(module.functions.len());
    for (idx, function) in module.functions.iter().enumerate() {
        if function.import.is_some() {
            let provided = &imported_functions[idx];
            if provided.ty != function.ty {
                return Err(Link(INCOMPATIBLE_IMPORT));
            }
            functions.push(provided.clone());
        } else {
            functions.push(RuntimeFunction {
                ty: function.ty.clone(),
                kind: FuncKind::Wasm { func_idx: idx as u32 },
            });
        }
    }

    // Table
    let table = match &module.table {
        Some(t) if t.import.is_some() => {
            let provided = imported_table.ok_or(Link(UNKNOWN_IMPORT))?;
            {
                let tb = provided.borrow();
                if tb.size() < t.min || tb.max() > t.max {
                    return Err(Link(INCOMPATIBLE_IMPORT));
                }
            }
            Some(provided)
        }
        Some(t) => Some(Rc::new(RefCell::new(WasmTable::new(t.min, t.max)))),
        None => None,
    };

    // Memory
    let memory = match &module.memory {
        Some(m) if m.import.is_some() => {
            let provided = imported_memory.ok_or(Link(UNKNOWN_IMPORT))?;
            {
                let mb = provided.borrow();
                if mb.size() < m.min || mb.max() > m.max {
                    return Err(Link(INCOMPATIBLE_IMPORT));
                }
            }
            Some(provided)
        }
        Some(m) => Some(Rc::new(RefCell::new(WasmMemory::new(m.min, m.max)))),
        None => None,
    };

    // Globals: imports first, then defined ones evaluated in order, so an
    // initializer may refer to any imported global
    let n_global_imports = module.globals.iter().filter(|g| g.import.is_some()).count();
    if imported_globals.len() != n_global_imports {
        return Err(Link(IMPORT_COUNT_MISMATCH));
    }
    let mut globals: Vec<Rc<RefCell<WasmGlobal>>> = Vec::with_capacity(module.globals.len());
    for g in &module.globals {
        if g.import.is_some() {
            let provided = &imported_globals[globals.len()];
            {
                let gb = provided.borrow();
                if gb.ty != g.ty || gb.mutable != g.is_mutable {
                    return Err(Link(INCOMPATIBLE_IMPORT));
                }
            }
            globals.push(provided.clone());
        } else {
            let mut pc = g.initializer_offset;
            let value = eval_const(&module, &mut pc, &globals)?;
            globals.push(Rc::new(RefCell::new(WasmGlobal {
                ty: g.ty,
                mutable: g.is_mutable,
                value,
            })));
        }
    }

    let table_is_imported = module.table.as_ref().is_some_and(|t| t.import.is_some());
    let instance = Rc::new(Instance { module: module.clone(), functions, table, memory, globals });

    // Element segments, one at a time: bounds-checked right before the
    // copy, so writes from earlier segments survive a later failure
    let mut wrote_imported_table = false;
    for segment in &module.elements {
        let mut pc = segment.initializer_offset;
        let offset = eval_const(&module, &mut pc, &instance.globals)?.as_u32();
        let table_rc = instance.table.as_ref().ok_or(Link(UNKNOWN_TABLE))?;
        let mut tb = table_rc.borrow_mut();
        if offset as u64 + segment.func_indices.len() as u64 > tb.size() as u64 {
            drop(tb);
            return Err(discard(&instance, wrote_imported_table, ELEM_SEG_DNF, Link));
        }
        debug_println!("[elem] writing {} entries at {}", segment.func_indices.len(), offset);
        for (j, &func_idx) in segment.func_indices.iter().enumerate() {
            let rf = &instance.functions[func_idx as usize];
            let entry = TableFunction {
                ty: rf.ty.clone(),
                target: match &rf.kind {
                    FuncKind::Wasm { func_idx } => TableTarget::Instance {
                        owner: Rc::downgrade(&instance),
                        func_idx: *func_idx,
                    },
                    FuncKind::Host { thunk } => TableTarget::Host { thunk: thunk.clone() },
                },
            };
            tb.set(offset + j as u32, Some(entry)).unwrap();
        }
        if table_is_imported {
            wrote_imported_table = true;
        }
    }

    // Data segments after elements, same one-at-a-time discipline
    for segment in &module.data_segments {
        let mut pc = segment.initializer_offset;
        let offset = eval_const(&module, &mut pc, &instance.globals)?.as_u32();
        let memory_rc = instance.memory.as_ref().ok_or(Link(UNKNOWN_MEMORY))?;
        let data = &module.bytes[segment.data_range.clone()];
        let mut mb = memory_rc.borrow_mut();
        if offset as u64 + data.len() as u64 > mb.len_bytes() as u64 {
            drop(mb);
            return Err(discard(&instance, wrote_imported_table, DATA_SEG_DNF, Link));
        }
        mb.write_bytes(offset, data).unwrap();
    }

    // Start function runs last; its traps make the module uninstantiable
    // but do not roll back segment writes
    if let Some(start_idx) = module.start {
        let result = execute(&instance, start_idx as usize, &[], 0);
        if result.trapped {
            return Err(discard(&instance, wrote_imported_table, START_FUNCTION_FAILED, Uninstantiable));
        }
    }

    Ok(instance)
}

/// Failure path for instantiation: if the dying instance has entries in an
/// imported table, the table pins it so those entries stay callable.
fn discard(
    instance: &Rc<Instance>,
    wrote_imported_table: bool,
    msg: &'static str,
    kind: fn(&'static str) -> Error,
) -> Error {
    if wrote_imported_table {
        if let Some(table) = &instance.table {
            table.borrow_mut().keep_alive(instance.clone());
        }
    }
    kind(msg)
}

/// Evaluates a constant expression starting at `*pc`: immediates,
/// global.get of already-resolved globals, i32/i64 add/sub/mul.
pub(crate) fn eval_const(
    module: &Module,
    pc: &mut usize,
    globals: &[Rc<RefCell<WasmGlobal>>],
) -> Result<WasmValue, Error> {
    let bytes: &[u8] = &module.bytes;
    let mut stack: Vec<WasmValue> = Vec::new();
    loop {
        let op = bytes[*pc];
        *pc += 1;
        match op {
            0x41 => { let v: i32 = read_sleb128(bytes, pc)?; stack.push(WasmValue::from_i32(v)); }
            0x42 => { let v: i64 = read_sleb128(bytes, pc)?; stack.push(WasmValue::from_i64(v)); }
            0x43 => {
                let bits = u32::from_le_bytes(bytes[*pc..*pc + 4].try_into().unwrap());
                *pc += 4;
                stack.push(WasmValue::from_f32_bits(bits));
            }
            0x44 => {
                let bits = u64::from_le_bytes(bytes[*pc..*pc + 8].try_into().unwrap());
                *pc += 8;
                stack.push(WasmValue::from_f64_bits(bits));
            }
            0x23 => {
                let gi: u32 = read_leb128(bytes, pc)?;
                let g = globals.get(gi as usize).ok_or(Validation(UNKNOWN_GLOBAL))?;
                stack.push(g.borrow().value);
            }
            0x6a => { let b = stack.pop().unwrap().as_u32(); let a = stack.pop().unwrap().as_u32(); stack.push(WasmValue::from_u32(a.wrapping_add(b))); }
            0x6b => { let b = stack.pop().unwrap().as_u32(); let a = stack.pop().unwrap().as_u32(); stack.push(WasmValue::from_u32(a.wrapping_sub(b))); }
            0x6c => { let b = stack.pop().unwrap().as_u32(); let a = stack.pop().unwrap().as_u32(); stack.push(WasmValue::from_u32(a.wrapping_mul(b))); }
            0x7c => { let b = stack.pop().unwrap().as_u64(); let a = stack.pop().unwrap().as_u64(); stack.push(WasmValue::from_u64(a.wrapping_add(b))); }
            0x7d => { let b = stack.pop().unwrap().as_u64(); let a = stack.pop().unwrap().as_u64(); stack.push(WasmValue::from_u64(a.wrapping_sub(b))); }
            0x7e => { let b = stack.pop().unwrap().as_u64(); let a = stack.pop().unwrap().as_u64(); stack.push(WasmValue::from_u64(a.wrapping_mul(b))); }
            0x0b => break,
            _ => return Err(Validation(CONST_EXP_REQUIRED)),
        }
    }
    Ok(stack.pop().unwrap())
}

// --------------- Export lookup and import resolution ---------------

pub fn find_exported_function(module: &Module, name: &str) -> Option<u32> {
    module
        .exports
        .get(name)
        .filter(|e| e.extern_type == ExternType::Func)
        .map(|e| e.idx)
}

pub fn find_exported_table(instance: &Instance, name: &str) -> Option<Rc<RefCell<WasmTable>>> {
    instance
        .module
        .exports
        .get(name)
        .filter(|e| e.extern_type == ExternType::Table)?;
    instance.table.clone()
}

pub fn find_exported_memory(instance: &Instance, name: &str) -> Option<Rc<RefCell<WasmMemory>>> {
    instance
        .module
        .exports
        .get(name)
        .filter(|e| e.extern_type == ExternType::Mem)?;
    instance.memory.clone()
}

pub fn find_exported_global(instance: &Instance, name: &str) -> Option<Rc<RefCell<WasmGlobal>>> {
    let export = instance
        .module
        .exports
        .get(name)
        .filter(|e| e.extern_type == ExternType::Global)?;
    instance.globals.get(export.idx as usize).cloned()
}

/// Host function descriptor for name-based import resolution.
pub struct ImportedFunction {
    pub module: String,
    pub field: String,
    pub ty: Signature,
    pub function: HostFunc,
}

/// Matches host descriptors against the module's function imports by
/// (module, field) name pair and exact type, producing the positional list
/// `instantiate` takes. Unresolved imports are an error.
pub fn resolve_imported_functions(
    module: &Module,
    descriptors: &[ImportedFunction],
) -> Result<Vec<RuntimeFunction>, Error> {
    let mut resolved = Vec::new();
    for function in module.functions.iter().filter(|f| f.import.is_some()) {
        let import = function.import.as_ref().unwrap();
        let descriptor = descriptors
            .iter()
            .find(|d| d.module == import.module && d.field == import.field)
            .ok_or(Link(UNKNOWN_IMPORT))?;
        if descriptor.ty != function.ty {
            return Err(Link(INCOMPATIBLE_IMPORT));
        }
        resolved.push(RuntimeFunction {
            ty: descriptor.ty.clone(),
            kind: FuncKind::Host { thunk: descriptor.function.clone() },
        });
    }
    Ok(resolved)
}
