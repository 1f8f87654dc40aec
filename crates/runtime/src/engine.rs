//! The engine
//!
//! One `Engine` value owns every process-wide singleton: the object
//! store, the prototype table, the interned symbol table, the queues,
//! the cache bookkeeping, the filesystem mirror, and the connection
//! table. The interpreter and the builtins borrow it; nothing hides in
//! globals or thread-locals. `now_time` is a plain field, updated only
//! at outer loop boundaries, never inside an opcode.

use crate::cache::Cache;
use crate::config::Config;
use crate::fsmirror::FsMirror;
use crate::interp;
use crate::net::Connections;
use crate::object::{ObjData, ObjFlags, ObjState, ObjectStore, ProtoId};
use crate::queues::Queues;
use std::collections::HashMap;
use std::rc::Rc;
use tern_compiler::{CompileEnv, CompileError, FnDef, Program};
use tern_core::{ObjRef, RuntimeError, SymbolTable, Value};

/// A prototype: an immutable compiled program bound to a path, rooting
/// the chain of its clones through its proto object.
#[derive(Debug)]
pub struct Proto {
    pub pathname: String,
    pub program: Rc<Program>,
    pub proto_obj: ObjRef,
}

/// Prototype table with stable ids and path lookup. Iteration order is
/// id order, which `next_proto` exposes to the world.
#[derive(Debug, Default)]
pub struct ProtoTable {
    protos: Vec<Option<Proto>>,
    by_path: HashMap<String, ProtoId>,
}

impl ProtoTable {
    pub fn new() -> ProtoTable {
        ProtoTable::default()
    }

    pub fn insert(&mut self, proto: Proto) -> ProtoId {
        let id = self.protos.len();
        self.by_path.insert(proto.pathname.clone(), id);
        self.protos.push(Some(proto));
        id
    }

    pub fn get(&self, id: ProtoId) -> Option<&Proto> {
        self.protos.get(id).and_then(|p| p.as_ref())
    }

    pub fn by_path(&self, path: &str) -> Option<ProtoId> {
        self.by_path.get(path).copied()
    }

    pub fn remove(&mut self, id: ProtoId) {
        if let Some(Some(p)) = self.protos.get(id) {
            self.by_path.remove(&p.pathname);
            self.protos[id] = None;
        }
    }

    /// Next live prototype after `id` in table order.
    pub fn next_after(&self, id: Option<ProtoId>) -> Option<ProtoId> {
        let start = id.map(|i| i + 1).unwrap_or(0);
        (start..self.protos.len()).find(|i| self.protos[*i].is_some())
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProtoId, &Proto)> {
        self.protos
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.as_ref().map(|p| (i, p)))
    }

    pub fn len(&self) -> usize {
        self.protos.iter().filter(|p| p.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Instruction-count limits; both counters reset at the top of every
/// externally scheduled invocation, the soft one also per command.
#[derive(Debug, Default)]
pub struct Cycles {
    pub hard: u64,
    pub soft: u64,
    pub hard_max: Option<u64>,
    pub soft_max: Option<u64>,
}

/// One synthesized traceback line.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub obj: ObjRef,
    pub path: String,
    pub func: String,
    pub line: u32,
}

/// What the outer loop should do after the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Running,
    SaveRequested,
    ShutdownRequested,
    PanicRequested,
}

pub struct Engine {
    pub store: ObjectStore,
    pub protos: ProtoTable,
    pub table: SymbolTable,
    pub fs: FsMirror,
    pub cache: Cache,
    pub queues: Queues,
    pub conns: Connections,
    pub config: Config,
    /// Wall-clock seconds, refreshed only at outer loop boundaries.
    pub now_time: i64,
    pub boot_time: i64,
    pub cycles: Cycles,
    /// Call-frame mirror for tracebacks.
    pub call_stack: Vec<TraceEntry>,
    /// Traceback depth shown in logs (sysctl-controlled).
    pub trace_depth: usize,
    pub run_state: RunState,
    /// Guards the master permission callback against re-entry.
    pub in_master_check: bool,
    /// Set by add_verb/remove_verb so an in-flight verb search knows its
    /// list was rewired.
    pub verbs_changed: bool,
    /// Compiles in flight, to reject inherit cycles.
    compiling: Vec<String>,
}

/// The master object: its `valid_read`/`valid_write` gate the
/// filesystem, and it is the root of the prototype chain.
pub const MASTER: ObjRef = ObjRef(0);

impl Engine {
    pub fn new(config: Config) -> Engine {
        let now = wall_clock();
        Engine {
            store: ObjectStore::new(),
            protos: ProtoTable::new(),
            table: SymbolTable::new(),
            fs: FsMirror::new(config.fs_root.clone()),
            cache: Cache::new(config.cache_size, config.xlog_path.clone(), config.load_path.clone()),
            queues: Queues::new(),
            conns: Connections::new(),
            config,
            now_time: now,
            boot_time: now,
            cycles: Cycles::default(),
            call_stack: Vec::new(),
            trace_depth: 16,
            run_state: RunState::Running,
            in_master_check: false,
            verbs_changed: false,
            compiling: Vec::new(),
        }
    }

    /// Boot: restore the checkpoint when one exists, otherwise compile
    /// `/boot` and start fresh.
    pub fn boot(&mut self) -> Result<(), crate::db::DbError> {
        if self.config.load_path.exists() {
            crate::db::init_db(self)
        } else {
            tracing::info!("no checkpoint; creating world from /boot");
            crate::db::create_db(self)
        }
    }

    pub fn refresh_clock(&mut self) {
        self.now_time = wall_clock();
    }

    // ---- residency ---------------------------------------------------

    /// Make an object's payload resident, reading it from the log or
    /// the checkpoint if needed, and promote it in the LRU.
    pub fn load_data(&mut self, r: ObjRef) {
        crate::cache::load_data(self, r);
    }

    /// Mark an object mutated: resident and state Dirty.
    pub fn dirty(&mut self, r: ObjRef) {
        self.load_data(r);
        if let Some(obj) = self.store.get_mut(r) {
            if !obj.is_garbage() {
                obj.state = ObjState::Dirty;
            }
        }
    }

    // ---- global slots ------------------------------------------------

    pub fn read_global(&mut self, r: ObjRef, slot: u32) -> Result<Value, RuntimeError> {
        self.load_data(r);
        let obj = self.store.get(r).ok_or(RuntimeError::MissingObject)?;
        let data = obj.data.as_ref().ok_or(RuntimeError::MissingObject)?;
        data.globals
            .get(slot as usize)
            .cloned()
            .ok_or(RuntimeError::OutOfBounds {
                index: slot as i64,
                size: data.globals.len() as u32,
            })
    }

    /// Store into a global slot, maintaining the dirty bit and the
    /// back-reference list on both the old and the new object target.
    pub fn write_global(&mut self, r: ObjRef, slot: u32, value: Value) -> Result<(), RuntimeError> {
        self.dirty(r);
        let old = {
            let obj = self.store.get(r).ok_or(RuntimeError::MissingObject)?;
            let data = obj.data.as_ref().ok_or(RuntimeError::MissingObject)?;
            if slot as usize >= data.globals.len() {
                return Err(RuntimeError::OutOfBounds {
                    index: slot as i64,
                    size: data.globals.len() as u32,
                });
            }
            data.globals[slot as usize].clone()
        };
        if let Value::Obj(old_target) = old {
            self.load_data(old_target);
            self.store.remove_backref(old_target, r, slot);
        }
        if let Value::Obj(new_target) = value {
            self.load_data(new_target);
            self.store.add_backref(new_target, r, slot);
        }
        let obj = self.store.get_mut(r).ok_or(RuntimeError::MissingObject)?;
        let data = obj.data.as_mut().ok_or(RuntimeError::MissingObject)?;
        data.globals[slot as usize] = value;
        Ok(())
    }

    // ---- prototypes and compilation ----------------------------------

    /// Load a prototype through the cache: an existing one is returned,
    /// otherwise the path is compiled and installed with a fresh proto
    /// object. Used by compile_object and by inherit resolution.
    pub fn load_proto(&mut self, path: &str) -> Result<ProtoId, CompileError> {
        if let Some(id) = self.protos.by_path(path) {
            return Ok(id);
        }
        if self.compiling.iter().any(|p| p == path) {
            return Err(CompileError {
                line: 0,
                message: format!("inheritance cycle through '{}'", path),
            });
        }
        self.compiling.push(path.to_string());
        let result = self.compile_and_install(path);
        self.compiling.pop();
        result
    }

    fn compile_and_install(&mut self, path: &str) -> Result<ProtoId, CompileError> {
        let file = format!("{}{}", path, tern_compiler::SOURCE_EXT);
        let source = self.fs.read_text(&file).map_err(|e| CompileError {
            line: 0,
            message: format!("cannot open '{}': {}", file, e),
        })?;
        let program = tern_compiler::compile_string(path, &source, self)?;
        Ok(self.install_program(path, Rc::new(program)))
    }

    /// Compile source text that is not backed by a file (the
    /// compile_string builtin) and install it under the given path.
    pub fn compile_source(&mut self, path: &str, source: &str) -> Result<ProtoId, CompileError> {
        if self.protos.by_path(path).is_some() {
            return Err(CompileError {
                line: 0,
                message: format!("prototype '{}' already exists", path),
            });
        }
        let program = tern_compiler::compile_string(path, source, self)?;
        Ok(self.install_program(path, Rc::new(program)))
    }

    /// Install a compiled program as a prototype with a proto object.
    pub fn install_program(&mut self, path: &str, program: Rc<Program>) -> ProtoId {
        let obj_ref = self.store.alloc();
        let num_globals = program.num_globals as usize;
        let id = self.protos.insert(Proto {
            pathname: path.to_string(),
            program,
            proto_obj: obj_ref,
        });
        let now = self.now_time;
        let obj = self.store.get_mut(obj_ref).unwrap();
        obj.flags = ObjFlags::PROTOTYPE;
        obj.proto = Some(id);
        obj.state = ObjState::Dirty;
        obj.last_access = now;
        obj.data = Some(ObjData {
            globals: vec![Value::zero(); num_globals],
            refd_by: Vec::new(),
        });
        crate::cache::add_loaded(self, obj_ref);
        tracing::info!(path, handle = %obj_ref, "prototype installed");
        id
    }

    /// Instantiate an object from a prototype: fresh handle, zeroed
    /// global-slot vector, linked into the clone chain, `init` invoked
    /// when defined.
    pub fn clone_object(&mut self, proto_id: ProtoId, player: Option<ObjRef>) -> Result<ObjRef, RuntimeError> {
        let (proto_obj, num_globals) = {
            let proto = self
                .protos
                .get(proto_id)
                .ok_or(RuntimeError::MissingObject)?;
            (proto.proto_obj, proto.program.num_globals as usize)
        };
        let new_ref = self.store.alloc();
        let now = self.now_time;
        {
            let obj = self.store.get_mut(new_ref).unwrap();
            obj.proto = Some(proto_id);
            obj.state = ObjState::Dirty;
            obj.last_access = now;
            obj.data = Some(ObjData {
                globals: vec![Value::zero(); num_globals],
                refd_by: Vec::new(),
            });
        }
        // Link into the sibling chain behind the proto object.
        let head_next = self.store.get(proto_obj).and_then(|o| o.next_child);
        self.store.get_mut(new_ref).unwrap().next_child = head_next;
        self.store.get_mut(proto_obj).unwrap().next_child = Some(new_ref);
        crate::cache::add_loaded(self, new_ref);
        tracing::debug!(handle = %new_ref, proto = proto_id, "cloned");
        // The user-visible constructor.
        self.call_named(new_ref, "init", player, None, Vec::new());
        Ok(new_ref)
    }

    // ---- function resolution and invocation --------------------------

    /// Resolve a function on an object through its prototype's MRO.
    /// `external` skips static functions (the call_other contract).
    pub fn find_function(
        &self,
        obj: ObjRef,
        name: &str,
        external: bool,
    ) -> Option<(Rc<FnDef>, Rc<Program>)> {
        let proto_id = self.store.live(obj)?.proto?;
        let program = &self.protos.get(proto_id)?.program;
        let (func, definer) = Program::resolve_func(program, name)?;
        if external && func.is_static {
            return None;
        }
        Some((func, definer))
    }

    /// Outermost invocation boundary: run a named function on an object
    /// and convert any runtime error into integer 0 plus a logged
    /// traceback. Returns None when the function does not exist.
    pub fn call_named(
        &mut self,
        obj: ObjRef,
        name: &str,
        player: Option<ObjRef>,
        caller: Option<ObjRef>,
        args: Vec<Value>,
    ) -> Option<Value> {
        let (func, definer) = self.find_function(obj, name, false)?;
        Some(self.call_boundary(obj, func, definer, player, caller, args))
    }

    /// Run a resolved function, absorbing errors at this boundary.
    pub fn call_boundary(
        &mut self,
        obj: ObjRef,
        func: Rc<FnDef>,
        definer: Rc<Program>,
        player: Option<ObjRef>,
        caller: Option<ObjRef>,
        args: Vec<Value>,
    ) -> Value {
        self.cycles.hard = 0;
        match interp::call_function(self, caller, obj, player, func, definer, args) {
            Ok(v) => v,
            Err(e) => {
                self.log_traceback(&e);
                self.call_stack.clear();
                Value::zero()
            }
        }
    }

    fn log_traceback(&self, err: &RuntimeError) {
        let mut lines = String::new();
        for entry in self.call_stack.iter().rev().take(self.trace_depth) {
            lines.push_str(&format!(
                "  at {}::{} (line {}) on {}\n",
                entry.path, entry.func, entry.line, entry.obj
            ));
        }
        tracing::warn!(error = %err, "runtime error\n{}", lines);
    }

    // ---- misc --------------------------------------------------------

    pub fn is_master(&self, r: ObjRef) -> bool {
        r == MASTER
    }

    /// Does the object (or the master itself) hold the PRIV bit?
    pub fn is_priv(&self, r: ObjRef) -> bool {
        self.store
            .live(r)
            .map(|o| o.flags.contains(ObjFlags::PRIV))
            .unwrap_or(false)
    }

    pub fn proto_of(&self, r: ObjRef) -> Option<&Proto> {
        self.store.live(r).and_then(|o| o.proto).and_then(|id| self.protos.get(id))
    }

    pub fn pathname_of(&self, r: ObjRef) -> String {
        self.proto_of(r)
            .map(|p| p.pathname.clone())
            .unwrap_or_else(|| "<none>".to_string())
    }
}

pub fn wall_clock() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// The compiler reaches back into the engine for include files (the
// filesystem mirror) and inherited prototypes (the prototype cache).
impl CompileEnv for Engine {
    fn load_source(&mut self, path: &str, system: bool) -> Result<String, String> {
        let path = if system {
            format!("/include/{}", path.trim_start_matches('/'))
        } else {
            path.to_string()
        };
        self.fs.read_text(&path)
    }

    fn resolve_proto(&mut self, path: &str) -> Result<Rc<Program>, String> {
        let id = self.load_proto(path).map_err(|e| e.to_string())?;
        Ok(self.protos.get(id).unwrap().program.clone())
    }
}
