//! Shared world-building harness: a temp mudlib, an engine booted from
//! it, and call helpers.
#![allow(dead_code)]

use std::path::Path;
use tempfile::TempDir;
use tern_core::{ObjRef, Value};
use tern_runtime::{Config, Engine};

pub fn write_world(dir: &Path, files: &[(&str, &str)]) {
    for (path, text) in files {
        let rel = path.trim_start_matches('/');
        let host = dir.join(rel);
        if let Some(parent) = host.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(host, text).unwrap();
    }
}

pub fn engine_for(dir: &TempDir) -> Engine {
    let mut config = Config::default();
    config.fs_root = dir.path().to_path_buf();
    config.load_path = dir.path().join("world.db");
    config.save_path = dir.path().join("world.db");
    config.panic_path = dir.path().join("panic.db");
    config.xlog_path = dir.path().join("transact.log");
    config.tmpdb_path = dir.path().join("tmp.db");
    Engine::new(config)
}

/// A booted world: `/boot.t` plus any extra prototypes.
pub fn world(files: &[(&str, &str)]) -> (TempDir, Engine) {
    let dir = TempDir::new().unwrap();
    write_world(dir.path(), files);
    let mut engine = engine_for(&dir);
    engine.boot().expect("boot");
    (dir, engine)
}

pub fn call(engine: &mut Engine, obj: ObjRef, func: &str, args: Vec<Value>) -> Value {
    engine
        .call_named(obj, func, None, None, args)
        .unwrap_or_else(|| panic!("no function '{}' on {}", func, obj))
}

pub fn clone_of(engine: &mut Engine, path: &str) -> ObjRef {
    let id = engine.load_proto(path).expect("prototype compiles");
    engine.clone_object(id, None).expect("clone")
}
