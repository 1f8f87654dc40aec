//! Residency cache and transaction log
//!
//! A bounded number of objects keep their heavy payload in memory.
//! Access promotes an object to the head of the LRU; when the resident
//! count exceeds the soft cap the tail is evicted. Evicting a mutated
//! object appends its payload to the append-only transaction log and
//! remembers the offset; a clean payload is simply dropped, since its
//! bytes still live in the checkpoint or the log.
//!
//! Eviction never runs while the interpreter is on the stack; the
//! scheduler calls `unload_to_cap` at the end of each tick.

use crate::db;
use crate::engine::Engine;
use crate::object::{ObjFlags, ObjState};
use std::fs::OpenOptions;
use std::io::{BufWriter, Seek, SeekFrom};
use std::path::PathBuf;
use tern_core::ObjRef;

#[derive(Debug)]
pub struct Cache {
    /// Resident objects, most recently used first.
    lru: Vec<ObjRef>,
    pub cap: usize,
    /// Append-only transaction log path.
    pub log_path: PathBuf,
    /// Where `InDb` payloads are read from (the last checkpoint).
    pub db_path: PathBuf,
    /// Bytes appended to the log since the last checkpoint.
    pub log_top: u64,
}

impl Cache {
    pub fn new(cap: usize, log_path: PathBuf, db_path: PathBuf) -> Cache {
        Cache {
            lru: Vec::new(),
            cap,
            log_path,
            db_path,
            log_top: 0,
        }
    }

    pub fn resident_count(&self) -> usize {
        self.lru.len()
    }

    pub fn resident(&self) -> &[ObjRef] {
        &self.lru
    }

    fn promote(&mut self, r: ObjRef) {
        if let Some(pos) = self.lru.iter().position(|x| *x == r) {
            self.lru.remove(pos);
        }
        self.lru.insert(0, r);
    }

    fn forget(&mut self, r: ObjRef) {
        self.lru.retain(|x| *x != r);
    }

    /// Remove the transaction log; called after a successful checkpoint
    /// (every payload now lives in the new image).
    pub fn reset_log(&mut self) {
        let _ = std::fs::remove_file(&self.log_path);
        self.log_top = 0;
    }
}

/// Mark an object resident and move it to the LRU head.
pub fn add_loaded(engine: &mut Engine, r: ObjRef) {
    engine.cache.promote(r);
    if let Some(obj) = engine.store.get_mut(r) {
        obj.flags.insert(ObjFlags::RESIDENT);
    }
}

/// Bring an object's payload into memory, reading from the transaction
/// log or the checkpoint when needed, and promote it.
pub fn load_data(engine: &mut Engine, r: ObjRef) {
    let (resident, garbage, state, offset) = match engine.store.get(r) {
        Some(o) => (
            o.flags.contains(ObjFlags::RESIDENT),
            o.is_garbage(),
            o.state,
            o.file_offset,
        ),
        None => return,
    };
    if resident {
        add_loaded(engine, r);
        return;
    }
    if garbage {
        return;
    }
    let source = match state {
        ObjState::InCache => Some(engine.cache.log_path.clone()),
        ObjState::InDb => Some(engine.cache.db_path.clone()),
        _ => None,
    };
    if let Some(path) = source {
        match db::read_payload_at(&path, offset) {
            Ok(mut data) => {
                // A prototype recompiled since the payload was written
                // may have changed its slot count; conform to it.
                let want = engine
                    .proto_of(r)
                    .map(|p| p.program.num_globals as usize)
                    .unwrap_or(data.globals.len());
                data.globals.resize(want, tern_core::Value::zero());
                let obj = engine.store.get_mut(r).unwrap();
                obj.data = Some(data);
                obj.state = if state == ObjState::InCache {
                    ObjState::FromCache
                } else {
                    ObjState::FromDb
                };
            }
            Err(e) => {
                tracing::error!(obj = %r, error = %e, "cannot page in object payload");
                crate::db::fatal_panic(engine, "payload read failure");
                return;
            }
        }
    } else if engine.store.get(r).map(|o| o.data.is_none()).unwrap_or(false) {
        // A never-persisted object with no payload: give it an empty
        // one sized to its program.
        let n = engine
            .proto_of(r)
            .map(|p| p.program.num_globals as usize)
            .unwrap_or(0);
        let obj = engine.store.get_mut(r).unwrap();
        obj.data = Some(crate::object::ObjData {
            globals: vec![tern_core::Value::zero(); n],
            refd_by: Vec::new(),
        });
        obj.state = ObjState::Dirty;
    }
    add_loaded(engine, r);
}

/// Drop an object from the cache entirely (destruct path): no write, no
/// state transition besides losing residency.
pub fn unload_object(engine: &mut Engine, r: ObjRef) {
    engine.cache.forget(r);
    if let Some(obj) = engine.store.get_mut(r) {
        obj.data = None;
        obj.flags.remove(ObjFlags::RESIDENT);
        obj.state = ObjState::Dirty;
    }
}

/// Evict from the LRU tail back toward the soft cap. Mutated payloads
/// are appended to the transaction log; clean ones are dropped in
/// place. Returns the number of objects evicted.
pub fn unload_to_cap(engine: &mut Engine) -> usize {
    let mut evicted = 0;
    while engine.cache.resident_count() > engine.cache.cap {
        let Some(&victim) = engine.cache.lru.last() else {
            break;
        };
        engine.cache.lru.pop();
        evicted += 1;
        let Some(obj) = engine.store.get(victim) else {
            continue;
        };
        let state = obj.state;
        if obj.is_garbage() {
            let obj = engine.store.get_mut(victim).unwrap();
            obj.data = None;
            obj.state = ObjState::Dirty;
            obj.flags.remove(ObjFlags::RESIDENT);
            continue;
        }
        match state {
            ObjState::Dirty => {
                let log_path = engine.cache.log_path.clone();
                match append_payload(engine, victim, &log_path) {
                    Ok(offset) => {
                        let obj = engine.store.get_mut(victim).unwrap();
                        obj.file_offset = offset;
                        obj.state = ObjState::InCache;
                    }
                    Err(e) => {
                        tracing::error!(obj = %victim, error = %e, "cannot append to transaction log");
                        crate::db::fatal_panic(engine, "transaction log write failure");
                        return evicted;
                    }
                }
            }
            ObjState::FromDb => {
                engine.store.get_mut(victim).unwrap().state = ObjState::InDb;
            }
            ObjState::FromCache => {
                engine.store.get_mut(victim).unwrap().state = ObjState::InCache;
            }
            ObjState::InDb | ObjState::InCache => {}
        }
        let obj = engine.store.get_mut(victim).unwrap();
        obj.data = None;
        obj.flags.remove(ObjFlags::RESIDENT);
    }
    evicted
}

fn append_payload(engine: &mut Engine, r: ObjRef, path: &std::path::Path) -> std::io::Result<u64> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let offset = file.seek(SeekFrom::End(0))?;
    let mut w = BufWriter::new(&mut file);
    db::write_payload(&mut w, engine, r)?;
    use std::io::Write;
    w.flush()?;
    drop(w);
    engine.cache.log_top = file.seek(SeekFrom::End(0))?;
    Ok(offset)
}
