//! tern-runtime: the Tern world engine
//!
//! Everything that executes and persists a world: the bytecode
//! interpreter, the object store with its containment and attachment
//! graphs, the builtin function table, the residency cache with its
//! transaction log, checkpoint persistence, the filesystem mirror, the
//! telnet front end, and the cooperative outer loop that ties them
//! together. One `Engine` value owns all of it.

pub mod builtins;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod fsmirror;
pub mod interp;
pub mod net;
pub mod object;
pub mod queues;
pub mod sched;
pub mod telnet;

pub use config::Config;
pub use db::{create_db, init_db, save_db, DbError};
pub use engine::{Engine, MASTER};
pub use object::{ObjFlags, ObjState};
