#![deny(unsafe_code)]

pub mod byte_iter;
pub mod error;
pub mod execute;
pub mod instance;
pub mod leb128;
pub mod memory;
pub mod module;
pub mod signature;
pub mod stack;
pub mod validator;

pub use error::Error;
pub use execute::{execute, ExecutionResult, CALL_STACK_LIMIT};
pub use instance::{
    find_exported_function, find_exported_global, find_exported_memory, find_exported_table,
    instantiate, resolve_imported_functions, FuncKind, HostFunc, ImportedFunction, Instance,
    RuntimeFunction, TableFunction, TableTarget, WasmGlobal, WasmTable,
};
pub use memory::WasmMemory;
pub use module::Module;
pub use signature::{Signature, ValType};
pub use stack::WasmValue;

// Debug macro that only prints when the wasm_debug feature is enabled
#[cfg(feature = "wasm_debug")]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

#[cfg(not(feature = "wasm_debug"))]
macro_rules! debug_println {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_println;
