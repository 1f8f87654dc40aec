//! tern-core: the shared foundation of the Tern world engine
//!
//! Everything the compiler and the runtime both need: the tagged value
//! model, refcounted heap arrays and mappings, the interned symbol
//! table, bytecode cell definitions, and runtime error kinds.

pub mod array;
pub mod error;
pub mod instr;
pub mod mapping;
pub mod table;
pub mod value;

pub use array::{HeapArray, MaxSize};
pub use error::RuntimeError;
pub use instr::{Instr, Op, NUM_OPERS, NUM_SCALLS};
pub use mapping::HeapMapping;
pub use table::SymbolTable;
pub use value::{ArrayHandle, MapKey, MappingHandle, ObjRef, Value};
