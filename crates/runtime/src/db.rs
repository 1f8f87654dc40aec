//! Checkpoint persistence and the payload codec
//!
//! The checkpoint is one monolithic text-framed image: magic line,
//! `db_top`, the filesystem tree, the interned symbol table, every
//! object record (header, payload, attachments, verbs), the prototype
//! table with typed instruction streams, and the pending command and
//! alarm queues, each section closed by a `.END` marker and the whole
//! file by `db.END`. Restore validates every marker and refuses to boot
//! when one is missing.
//!
//! The image is written to the tmpdb path and atomically renamed over
//! the live database, with a manual copy fallback when rename crosses
//! devices. Object payloads that are not resident are streamed out of
//! their current home (previous checkpoint or transaction log) into the
//! new image before the rename - the explicit pre-rename flush phase.
//! Restore leaves payloads unread: each object gets its image offset
//! and the `InDb` state, and pages in on first access.

use crate::engine::{Engine, Proto};
use crate::fsmirror::FileFlags;
use crate::object::{ObjData, ObjFlags, ObjState, Verb};
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tern_compiler::{Ancestor, FnDef, InheritEntry, Program, VarDecl, VarShape};
use tern_core::array::{HeapArray, MaxSize};
use tern_core::instr::Instr;
use tern_core::mapping::HeapMapping;
use tern_core::{MapKey, ObjRef, Value};

pub const DB_MAGIC: &str = "ternDB/4";

#[derive(Debug)]
pub enum DbError {
    Io(io::Error),
    Corrupt {
        section: &'static str,
        detail: String,
    },
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Io(e) => write!(f, "database i/o error: {}", e),
            DbError::Corrupt { section, detail } => {
                write!(f, "database corrupt (while reading {}): {}", section, detail)
            }
        }
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DbError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DbError {
    fn from(e: io::Error) -> DbError {
        DbError::Io(e)
    }
}

fn corrupt(section: &'static str, detail: impl Into<String>) -> DbError {
    DbError::Corrupt {
        section,
        detail: detail.into(),
    }
}

// ---- low-level framing -----------------------------------------------

struct CountingWriter<W: Write> {
    inner: W,
    pos: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        CountingWriter { inner, pos: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn read_line<R: BufRead>(r: &mut R, section: &'static str) -> Result<String, DbError> {
    let mut line = String::new();
    let n = r.read_line(&mut line)?;
    if n == 0 {
        return Err(corrupt(section, "unexpected end of file"));
    }
    if line.ends_with('\n') {
        line.pop();
    }
    Ok(line)
}

fn read_i64<R: BufRead>(r: &mut R, section: &'static str) -> Result<i64, DbError> {
    let line = read_line(r, section)?;
    line.parse()
        .map_err(|_| corrupt(section, format!("expected number, got '{}'", line)))
}

fn read_sized<R: BufRead>(r: &mut R, section: &'static str) -> Result<String, DbError> {
    let len = read_i64(r, section)?;
    if !(0..=64 * 1024 * 1024).contains(&len) {
        return Err(corrupt(section, format!("implausible length {}", len)));
    }
    let mut buf = vec![0u8; len as usize];
    io::Read::read_exact(r, &mut buf)?;
    String::from_utf8(buf).map_err(|_| corrupt(section, "string is not UTF-8"))
}

fn peek_byte<R: BufRead>(r: &mut R) -> Result<Option<u8>, DbError> {
    let buf = r.fill_buf()?;
    Ok(buf.first().copied())
}

fn expect_end<R: BufRead>(r: &mut R, section: &'static str) -> Result<(), DbError> {
    let line = read_line(r, section)?;
    if line != ".END" {
        return Err(corrupt(section, format!("missing .END, got '{}'", line)));
    }
    Ok(())
}

fn refno_of(r: Option<ObjRef>) -> i64 {
    r.map(|x| x.0 as i64).unwrap_or(-1)
}

fn obj_of(n: i64) -> Option<ObjRef> {
    if n < 0 {
        None
    } else {
        Some(ObjRef(n as u32))
    }
}

// ---- value codec -----------------------------------------------------

pub fn write_value<W: Write>(w: &mut W, v: &Value) -> io::Result<()> {
    match v {
        Value::Int(n) => writeln!(w, "I{}", n),
        Value::Obj(r) => writeln!(w, "O{}", r.0),
        Value::Str(s) => {
            writeln!(w, "S{}", s.len())?;
            w.write_all(s.as_bytes())
        }
        Value::Array(arr) => {
            let arr = arr.borrow();
            writeln!(w, "A{}", arr.len())?;
            writeln!(w, "{}", arr.max_size().to_marker())?;
            for elem in arr.values() {
                write_value(w, elem)?;
            }
            Ok(())
        }
        Value::Mapping(map) => {
            let map = map.borrow();
            writeln!(w, "M{}", map.len())?;
            let mut result = Ok(());
            map.for_each(|k, v| {
                if result.is_ok() {
                    result = write_value(w, &k.to_value()).and_then(|_| write_value(w, v));
                }
            });
            result
        }
    }
}

pub fn read_value<R: BufRead>(r: &mut R, section: &'static str) -> Result<Value, DbError> {
    let mut tag = [0u8; 1];
    io::Read::read_exact(r, &mut tag)?;
    match tag[0] {
        b'I' => Ok(Value::Int(read_i64(r, section)?)),
        b'O' => {
            let n = read_i64(r, section)?;
            Ok(Value::Obj(ObjRef(n.max(0) as u32)))
        }
        b'S' => {
            let len = read_i64(r, section)?;
            if !(0..=64 * 1024 * 1024).contains(&len) {
                return Err(corrupt(section, format!("implausible string length {}", len)));
            }
            let mut buf = vec![0u8; len as usize];
            io::Read::read_exact(r, &mut buf)?;
            let s = String::from_utf8(buf)
                .map_err(|_| corrupt(section, "string value is not UTF-8"))?;
            Ok(Value::Str(s))
        }
        b'A' => {
            let count = read_i64(r, section)?;
            let marker = read_i64(r, section)?;
            let max = MaxSize::from_marker(marker as u32);
            let mut elems = Vec::with_capacity(count.max(0) as usize);
            for _ in 0..count {
                elems.push(read_value(r, section)?);
            }
            Ok(Value::Array(HeapArray::with_values(elems, max)))
        }
        b'M' => {
            let count = read_i64(r, section)?;
            let handle = HeapMapping::new();
            for _ in 0..count {
                let key = read_value(r, section)?;
                let value = read_value(r, section)?;
                let key = MapKey::from_value(&key)
                    .ok_or_else(|| corrupt(section, "unhashable mapping key"))?;
                handle.borrow_mut().set(key, value);
            }
            Ok(Value::Mapping(handle))
        }
        b'?' => Ok(Value::zero()),
        other => Err(corrupt(
            section,
            format!("unknown value tag '{}'", other as char),
        )),
    }
}

// ---- payload codec ---------------------------------------------------

pub fn write_payload_data<W: Write>(w: &mut W, data: &ObjData) -> io::Result<()> {
    for v in &data.globals {
        write_value(w, v)?;
    }
    writeln!(w, ".END")?;
    for (holder, slot) in &data.refd_by {
        writeln!(w, "{}", holder.0)?;
        writeln!(w, "{}", slot)?;
    }
    writeln!(w, ".END")
}

pub fn write_payload<W: Write>(w: &mut W, engine: &Engine, r: ObjRef) -> io::Result<()> {
    match engine.store.get(r).and_then(|o| o.data.as_ref()) {
        Some(data) => write_payload_data(w, data),
        // A destructed or empty object persists as an empty payload.
        None => write!(w, ".END\n.END\n"),
    }
}

pub fn read_payload<R: BufRead>(r: &mut R) -> Result<ObjData, DbError> {
    let mut globals = Vec::new();
    loop {
        match peek_byte(r)? {
            Some(b'.') => {
                expect_end(r, "object payload")?;
                break;
            }
            Some(_) => globals.push(read_value(r, "object payload")?),
            None => return Err(corrupt("object payload", "unexpected end of file")),
        }
    }
    let mut refd_by = Vec::new();
    loop {
        let line = read_line(r, "object references")?;
        if line == ".END" {
            break;
        }
        let holder: i64 = line
            .parse()
            .map_err(|_| corrupt("object references", format!("bad holder '{}'", line)))?;
        let slot = read_i64(r, "object references")?;
        if let Some(h) = obj_of(holder) {
            refd_by.push((h, slot as u32));
        }
    }
    Ok(ObjData { globals, refd_by })
}

/// Read one payload at an offset in a checkpoint or log file.
pub fn read_payload_at(path: &Path, offset: u64) -> Result<ObjData, DbError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut r = BufReader::new(file);
    read_payload(&mut r)
}

// ---- instruction codec -----------------------------------------------

// Cell tags are stable: they are part of the image format.
const T_INT: i64 = 0;
const T_STR: i64 = 1;
const T_OBJ: i64 = 2;
const T_CODE: i64 = 3;
const T_GLOBAL_LV: i64 = 4;
const T_LOCAL_LV: i64 = 5;
const T_NUM_ARGS: i64 = 7;
const T_ARRAY_SIZE: i64 = 8;
const T_JUMP: i64 = 9;
const T_BRANCH: i64 = 10;
const T_NEW_LINE: i64 = 11;
const T_RETURN: i64 = 12;
const T_LOCAL_REF: i64 = 13;
const T_GLOBAL_REF: i64 = 14;
const T_FUNC_NAME: i64 = 15;
const T_CALL_SUPER: i64 = 19;
const T_CALL_PARENT: i64 = 20;

/// Write one instruction cell. Direct calls are persisted by name and
/// re-bind lazily after a restore.
pub fn write_instr<W: Write>(w: &mut W, instr: &Instr, program: &Program) -> io::Result<()> {
    match instr {
        Instr::Int(n) => {
            writeln!(w, "{}", T_INT)?;
            writeln!(w, "{}", n)
        }
        Instr::Str(s) => {
            writeln!(w, "{}", T_STR)?;
            writeln!(w, "{}", s.len())?;
            w.write_all(s.as_bytes())
        }
        Instr::Obj(r) => {
            writeln!(w, "{}", T_OBJ)?;
            writeln!(w, "{}", r.0)
        }
        Instr::Code(c) => {
            writeln!(w, "{}", T_CODE)?;
            writeln!(w, "{}", c)
        }
        Instr::GlobalLValue { slot, size } => {
            writeln!(w, "{}", T_GLOBAL_LV)?;
            writeln!(w, "{}", slot)?;
            writeln!(w, "{}", size)
        }
        Instr::LocalLValue { slot, size } => {
            writeln!(w, "{}", T_LOCAL_LV)?;
            writeln!(w, "{}", slot)?;
            writeln!(w, "{}", size)
        }
        Instr::FuncCall(idx) => {
            let name = program
                .funcs
                .get(*idx as usize)
                .map(|f| f.name.as_str())
                .unwrap_or("");
            writeln!(w, "{}", T_FUNC_NAME)?;
            writeln!(w, "{}", name.len())?;
            w.write_all(name.as_bytes())
        }
        Instr::FuncName(name) => {
            writeln!(w, "{}", T_FUNC_NAME)?;
            writeln!(w, "{}", name.len())?;
            w.write_all(name.as_bytes())
        }
        Instr::NumArgs(n) => {
            writeln!(w, "{}", T_NUM_ARGS)?;
            writeln!(w, "{}", n)
        }
        Instr::ArraySize(n) => {
            writeln!(w, "{}", T_ARRAY_SIZE)?;
            writeln!(w, "{}", n)
        }
        Instr::Jump(t) => {
            writeln!(w, "{}", T_JUMP)?;
            writeln!(w, "{}", t)
        }
        Instr::Branch(t) => {
            writeln!(w, "{}", T_BRANCH)?;
            writeln!(w, "{}", t)
        }
        Instr::NewLine(l) => {
            writeln!(w, "{}", T_NEW_LINE)?;
            writeln!(w, "{}", l)
        }
        Instr::Return => writeln!(w, "{}", T_RETURN),
        Instr::LocalRef => writeln!(w, "{}", T_LOCAL_REF),
        Instr::GlobalRef => writeln!(w, "{}", T_GLOBAL_REF),
        Instr::CallSuper {
            inherit_idx,
            func_idx,
        } => {
            writeln!(w, "{}", T_CALL_SUPER)?;
            writeln!(w, "{}", inherit_idx)?;
            writeln!(w, "{}", func_idx)
        }
        Instr::CallParentNamed {
            inherit_idx,
            func_idx,
        } => {
            writeln!(w, "{}", T_CALL_PARENT)?;
            writeln!(w, "{}", inherit_idx)?;
            writeln!(w, "{}", func_idx)
        }
    }
}

pub fn read_instr<R: BufRead>(r: &mut R) -> Result<Instr, DbError> {
    const S: &str = "function code";
    let tag = read_i64(r, S)?;
    Ok(match tag {
        T_INT => Instr::Int(read_i64(r, S)?),
        T_STR => Instr::Str(read_sized(r, S)?),
        T_OBJ => Instr::Obj(ObjRef(read_i64(r, S)?.max(0) as u32)),
        T_CODE => Instr::Code(read_i64(r, S)? as u16),
        T_GLOBAL_LV => Instr::GlobalLValue {
            slot: read_i64(r, S)? as u32,
            size: read_i64(r, S)? as u32,
        },
        T_LOCAL_LV => Instr::LocalLValue {
            slot: read_i64(r, S)? as u32,
            size: read_i64(r, S)? as u32,
        },
        T_FUNC_NAME => Instr::FuncName(read_sized(r, S)?),
        T_NUM_ARGS => Instr::NumArgs(read_i64(r, S)? as u32),
        T_ARRAY_SIZE => Instr::ArraySize(read_i64(r, S)? as u32),
        T_JUMP => Instr::Jump(read_i64(r, S)? as u32),
        T_BRANCH => Instr::Branch(read_i64(r, S)? as u32),
        T_NEW_LINE => Instr::NewLine(read_i64(r, S)? as u32),
        T_RETURN => Instr::Return,
        T_LOCAL_REF => Instr::LocalRef,
        T_GLOBAL_REF => Instr::GlobalRef,
        T_CALL_SUPER => Instr::CallSuper {
            inherit_idx: read_i64(r, S)? as u32,
            func_idx: read_i64(r, S)? as u32,
        },
        T_CALL_PARENT => Instr::CallParentNamed {
            inherit_idx: read_i64(r, S)? as u32,
            func_idx: read_i64(r, S)? as u32,
        },
        other => return Err(corrupt(S, format!("unknown instruction tag {}", other))),
    })
}

fn shape_line(shape: &VarShape) -> String {
    match shape {
        VarShape::Scalar => "s".to_string(),
        VarShape::UnboundedArray => "u".to_string(),
        VarShape::Mapping => "m".to_string(),
        VarShape::Array(dims) => {
            let mut s = "a".to_string();
            for d in dims {
                s.push(' ');
                s.push_str(&d.to_string());
            }
            s
        }
    }
}

fn parse_shape(line: &str) -> Result<VarShape, DbError> {
    const S: &str = "prototype globals";
    match line.chars().next() {
        Some('s') => Ok(VarShape::Scalar),
        Some('u') => Ok(VarShape::UnboundedArray),
        Some('m') => Ok(VarShape::Mapping),
        Some('a') => {
            let dims: Result<Vec<u32>, _> =
                line[1..].split_whitespace().map(|d| d.parse()).collect();
            Ok(VarShape::Array(dims.map_err(|_| {
                corrupt(S, format!("bad dimensions '{}'", line))
            })?))
        }
        _ => Err(corrupt(S, format!("bad shape '{}'", line))),
    }
}

// ---- checkpoint write ------------------------------------------------

/// Write a full checkpoint. `filename` (when given) becomes the new
/// save path. On success the transaction log is discarded and all
/// `InDb` payloads point into the new image.
pub fn save_db(engine: &mut Engine, filename: Option<&Path>) -> Result<(), DbError> {
    let tmp_path = engine.config.tmpdb_path.clone();
    let final_path: PathBuf = filename
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| engine.config.save_path.clone());
    tracing::info!(path = %final_path.display(), "writing checkpoint");

    let file = File::create(&tmp_path)?;
    let mut w = CountingWriter::new(BufWriter::new(file));

    writeln!(w, "{}", DB_MAGIC)?;
    writeln!(w, "{}", engine.store.db_top())?;
    writeln!(w, "{}", engine.fs.root_flags().bits())?;
    writeln!(w, "{}", engine.fs.root_owner())?;
    let mut fs_entries: Vec<(String, FileFlags, i64)> = Vec::new();
    engine
        .fs
        .for_each_entry(|p, f, o| fs_entries.push((p.to_string(), f, o)));
    for (path, flags, owner) in &fs_entries {
        writeln!(w, "{}", path)?;
        writeln!(w, "{}", flags.bits())?;
        writeln!(w, "{}", owner)?;
    }
    writeln!(w, ".END")?;

    let mut pairs: Vec<(String, String)> = Vec::new();
    engine
        .table
        .for_each(|k, v| pairs.push((k.to_string(), v.to_string())));
    for (k, v) in &pairs {
        writeln!(w, "{}", k.len())?;
        w.write_all(k.as_bytes())?;
        writeln!(w, "{}", v.len())?;
        w.write_all(v.as_bytes())?;
    }
    writeln!(w, ".END")?;

    // Object records. Non-resident payloads are flushed from their
    // current home into the new image here, before the rename.
    let db_top = engine.store.db_top();
    for i in 0..db_top {
        let r = ObjRef(i as u32);
        let (input_func, flags, links, state, offset, garbage) = {
            let o = engine.store.get(r).unwrap();
            (
                o.input_func.clone(),
                o.flags.bits(),
                [
                    refno_of(o.next_child),
                    refno_of(o.location),
                    refno_of(o.contents),
                    refno_of(o.next_object),
                    refno_of(o.attacher),
                ],
                o.state,
                o.file_offset,
                o.is_garbage(),
            )
        };
        if let Some(f) = &input_func {
            write!(w, "*{}\n{}", f.len(), f)?;
        }
        writeln!(w, "{}", flags)?;
        for link in links {
            writeln!(w, "{}", link)?;
        }
        let place = w.pos;
        if garbage {
            write!(w, ".END\n.END\n")?;
        } else if engine.store.get(r).map(|o| o.data.is_some()).unwrap_or(false) {
            write_payload(&mut w, engine, r)?;
            let o = engine.store.get_mut(r).unwrap();
            o.file_offset = place;
            o.state = ObjState::FromDb;
        } else {
            let source = match state {
                ObjState::InCache => engine.cache.log_path.clone(),
                _ => engine.cache.db_path.clone(),
            };
            let data = read_payload_at(&source, offset)?;
            write_payload_data(&mut w, &data)?;
            let o = engine.store.get_mut(r).unwrap();
            o.file_offset = place;
            o.state = ObjState::InDb;
        }
        let (attachees, verbs) = {
            let o = engine.store.get(r).unwrap();
            (o.attachees.clone(), o.verbs.clone())
        };
        for a in &attachees {
            writeln!(w, "{}", a.0)?;
        }
        writeln!(w, ".END")?;
        for v in &verbs {
            writeln!(w, "{}", v.is_xverb as u8)?;
            writeln!(w, "{}", v.name.len())?;
            w.write_all(v.name.as_bytes())?;
            writeln!(w, "{}", v.func.len())?;
            w.write_all(v.func.as_bytes())?;
        }
        writeln!(w, ".END")?;
    }

    // Prototype table.
    let proto_list: Vec<(String, ObjRef, Rc<Program>)> = engine
        .protos
        .iter()
        .map(|(_, p)| (p.pathname.clone(), p.proto_obj, p.program.clone()))
        .collect();
    for (path, proto_obj, program) in &proto_list {
        writeln!(w, "{}", path)?;
        writeln!(w, "{}", proto_obj.0)?;
        writeln!(w, "{}", program.num_globals)?;
        writeln!(w, "{}", program.own_base)?;
        writeln!(w, "{}", program.inherits.len())?;
        for entry in &program.inherits {
            writeln!(w, "{}", entry.alias)?;
            writeln!(w, "{}", entry.path)?;
            writeln!(w, "{}", entry.var_offset)?;
            writeln!(w, "{}", entry.func_offset)?;
        }
        writeln!(w, "{}", program.ancestors.len())?;
        for anc in &program.ancestors {
            writeln!(w, "{}", anc.program.path)?;
            writeln!(w, "{}", anc.base)?;
        }
        writeln!(w, "{}", program.globals.len())?;
        for var in &program.globals {
            writeln!(w, "{}", var.name)?;
            writeln!(w, "{}", var.base)?;
            writeln!(w, "{}", shape_line(&var.shape))?;
        }
        writeln!(w, "{}", program.funcs.len())?;
        for func in &program.funcs {
            writeln!(w, "{}", func.is_static as u8)?;
            writeln!(w, "{}", func.num_args)?;
            writeln!(w, "{}", func.num_locals)?;
            writeln!(w, "{}", func.code.len())?;
            writeln!(w, "{}", func.name.len())?;
            w.write_all(func.name.as_bytes())?;
            for instr in &func.code {
                write_instr(&mut w, instr, program)?;
            }
        }
    }
    writeln!(w, ".END")?;

    for (obj, cmd) in engine.queues.commands() {
        writeln!(w, "{}", obj.0)?;
        writeln!(w, "{}", cmd.len())?;
        w.write_all(cmd.as_bytes())?;
    }
    writeln!(w, ".END")?;
    for alarm in engine.queues.alarms() {
        writeln!(w, "{}", alarm.obj.0)?;
        writeln!(w, "{}", alarm.deadline)?;
        writeln!(w, "{}", alarm.func.len())?;
        w.write_all(alarm.func.as_bytes())?;
    }
    writeln!(w, ".END")?;
    writeln!(w, "db.END")?;
    w.flush()?;
    drop(w);

    // Atomic install, with a copy fallback across filesystems.
    if std::fs::rename(&tmp_path, &final_path).is_err() {
        std::fs::copy(&tmp_path, &final_path)?;
        std::fs::remove_file(&tmp_path)?;
    }
    engine.cache.db_path = final_path.clone();
    engine.config.save_path = final_path;
    engine.cache.reset_log();
    tracing::info!(objects = db_top, protos = proto_list.len(), "checkpoint complete");
    Ok(())
}

// ---- restore ---------------------------------------------------------

struct RawFn {
    is_static: bool,
    num_args: u32,
    num_locals: u32,
    name: String,
    code: Vec<Instr>,
}

struct RawProto {
    path: String,
    proto_obj: ObjRef,
    num_globals: u32,
    own_base: u32,
    inherits: Vec<(String, String, u32, u32)>,
    ancestors: Vec<(String, u32)>,
    globals: Vec<VarDecl>,
    funcs: Vec<RawFn>,
}

/// Restore the engine from the load path. Object payloads are not
/// materialized; they page in on first access.
pub fn init_db(engine: &mut Engine) -> Result<(), DbError> {
    let load_path = engine.config.load_path.clone();
    tracing::info!(path = %load_path.display(), "restoring checkpoint");
    let file = File::open(&load_path)?;
    let mut r = BufReader::new(file);

    let magic = read_line(&mut r, "header")?;
    if magic != DB_MAGIC {
        return Err(corrupt("header", format!("'{}' is not a Tern database", magic)));
    }
    let db_top = read_i64(&mut r, "header")?;
    if db_top <= 0 {
        return Err(corrupt("db_top", format!("implausible object count {}", db_top)));
    }
    let root_flags = read_i64(&mut r, "header")? as u32;
    let root_owner = read_i64(&mut r, "header")?;
    engine.fs.clear();
    engine
        .fs
        .set_root_meta(FileFlags::from_bits_truncate(root_flags), root_owner);
    loop {
        let line = read_line(&mut r, "filesystem")?;
        if line == ".END" {
            break;
        }
        let flags = read_i64(&mut r, "filesystem")? as u32;
        let owner = read_i64(&mut r, "filesystem")?;
        engine
            .fs
            .add_entry(&line, owner, FileFlags::from_bits_truncate(flags))
            .map_err(|e| corrupt("filesystem", e))?;
    }

    engine.table.clear();
    loop {
        match peek_byte(&mut r)? {
            Some(b'.') => {
                expect_end(&mut r, "table")?;
                break;
            }
            Some(_) => {
                let key = read_sized(&mut r, "table")?;
                let value = read_sized(&mut r, "table")?;
                engine.table.set(&key, &value);
            }
            None => return Err(corrupt("table", "unexpected end of file")),
        }
    }

    engine.store.resize_for_restore(db_top as usize);
    for i in 0..db_top {
        let refno = ObjRef(i as u32);
        let input_func = if peek_byte(&mut r)? == Some(b'*') {
            let mut star = [0u8; 1];
            io::Read::read_exact(&mut r, &mut star)?;
            Some(read_sized(&mut r, "object header")?)
        } else {
            None
        };
        let mut flags = ObjFlags::from_bits_truncate(read_i64(&mut r, "object header")? as u32);
        flags.remove(ObjFlags::IN_EDITOR | ObjFlags::RESIDENT);
        let next_child = obj_of(read_i64(&mut r, "object header")?);
        let location = obj_of(read_i64(&mut r, "object header")?);
        let contents = obj_of(read_i64(&mut r, "object header")?);
        let next_object = obj_of(read_i64(&mut r, "object header")?);
        let attacher = obj_of(read_i64(&mut r, "object header")?);
        let offset = r.stream_position()?;
        // Payload stays on disk; skim past it.
        let _ = read_payload(&mut r)?;
        let mut attachees = Vec::new();
        loop {
            let line = read_line(&mut r, "object attachments")?;
            if line == ".END" {
                break;
            }
            let n: i64 = line
                .parse()
                .map_err(|_| corrupt("object attachments", format!("bad refno '{}'", line)))?;
            if let Some(a) = obj_of(n) {
                attachees.push(a);
            }
        }
        let mut verbs = Vec::new();
        loop {
            let line = read_line(&mut r, "object verbs")?;
            if line == ".END" {
                break;
            }
            let is_xverb = line == "1";
            let name = read_sized(&mut r, "object verbs")?;
            let func = read_sized(&mut r, "object verbs")?;
            verbs.push(Verb {
                name,
                is_xverb,
                func,
            });
        }
        let garbage = flags.contains(ObjFlags::GARBAGE);
        let obj = engine.store.get_mut(refno).unwrap();
        obj.input_func = input_func;
        obj.flags = flags;
        obj.next_child = next_child;
        obj.location = location;
        obj.contents = contents;
        obj.next_object = next_object;
        obj.attacher = attacher;
        obj.attachees = attachees;
        obj.verbs = verbs;
        obj.file_offset = offset;
        obj.state = if garbage {
            ObjState::Dirty
        } else {
            ObjState::InDb
        };
    }

    // Prototype table: raw records first, then link by path.
    let mut raw: Vec<RawProto> = Vec::new();
    loop {
        let path = read_line(&mut r, "prototypes")?;
        if path == ".END" {
            break;
        }
        let proto_obj = ObjRef(read_i64(&mut r, "prototypes")?.max(0) as u32);
        let num_globals = read_i64(&mut r, "prototypes")? as u32;
        let own_base = read_i64(&mut r, "prototypes")? as u32;
        let n_inherits = read_i64(&mut r, "prototypes")?;
        let mut inherits = Vec::new();
        for _ in 0..n_inherits {
            let alias = read_line(&mut r, "prototypes")?;
            let ipath = read_line(&mut r, "prototypes")?;
            let var_offset = read_i64(&mut r, "prototypes")? as u32;
            let func_offset = read_i64(&mut r, "prototypes")? as u32;
            inherits.push((alias, ipath, var_offset, func_offset));
        }
        let n_ancestors = read_i64(&mut r, "prototypes")?;
        let mut ancestors = Vec::new();
        for _ in 0..n_ancestors {
            let apath = read_line(&mut r, "prototypes")?;
            let base = read_i64(&mut r, "prototypes")? as u32;
            ancestors.push((apath, base));
        }
        let n_globals = read_i64(&mut r, "prototypes")?;
        let mut globals = Vec::new();
        for _ in 0..n_globals {
            let name = read_line(&mut r, "prototype globals")?;
            let base = read_i64(&mut r, "prototype globals")? as u32;
            let shape = parse_shape(&read_line(&mut r, "prototype globals")?)?;
            globals.push(VarDecl { name, base, shape });
        }
        let n_funcs = read_i64(&mut r, "functions")?;
        let mut funcs = Vec::new();
        for _ in 0..n_funcs {
            let is_static = read_i64(&mut r, "functions")? != 0;
            let num_args = read_i64(&mut r, "functions")? as u32;
            let num_locals = read_i64(&mut r, "functions")? as u32;
            let num_instr = read_i64(&mut r, "functions")?;
            let name = read_sized(&mut r, "functions")?;
            let mut code = Vec::with_capacity(num_instr.max(0) as usize);
            for _ in 0..num_instr {
                code.push(read_instr(&mut r)?);
            }
            funcs.push(RawFn {
                is_static,
                num_args,
                num_locals,
                name,
                code,
            });
        }
        raw.push(RawProto {
            path,
            proto_obj,
            num_globals,
            own_base,
            inherits,
            ancestors,
            globals,
            funcs,
        });
    }
    link_protos(engine, raw)?;

    loop {
        let line = read_line(&mut r, "commands")?;
        if line == ".END" {
            break;
        }
        let refno: i64 = line
            .parse()
            .map_err(|_| corrupt("commands", format!("bad refno '{}'", line)))?;
        let cmd = read_sized(&mut r, "commands")?;
        if let Some(obj) = obj_of(refno) {
            engine.queues.queue_command(obj, cmd);
        }
    }
    loop {
        let line = read_line(&mut r, "alarms")?;
        if line == ".END" {
            break;
        }
        let refno: i64 = line
            .parse()
            .map_err(|_| corrupt("alarms", format!("bad refno '{}'", line)))?;
        let deadline = read_i64(&mut r, "alarms")?;
        let func = read_sized(&mut r, "alarms")?;
        if let Some(obj) = obj_of(refno) {
            engine.queues.queue_alarm(obj, deadline, func);
        }
    }
    let trailer = read_line(&mut r, "trailer")?;
    if trailer != "db.END" {
        return Err(corrupt("trailer", "no db.END magic cookie"));
    }

    engine.store.rebuild_free_list();
    engine.cache.db_path = load_path;
    tracing::info!(objects = db_top, protos = engine.protos.len(), "restore complete");
    Ok(())
}

/// Turn raw prototype records into linked `Program`s. Ancestors resolve
/// by path, so parents must be constructed first; iterate until the set
/// stops shrinking.
fn link_protos(engine: &mut Engine, mut raw: Vec<RawProto>) -> Result<(), DbError> {
    use std::collections::HashMap;
    let mut built: HashMap<String, Rc<Program>> = HashMap::new();
    while !raw.is_empty() {
        let before = raw.len();
        let mut rest = Vec::new();
        for rp in raw {
            let ready = rp
                .ancestors
                .iter()
                .all(|(p, _)| built.contains_key(p))
                && rp.inherits.iter().all(|(_, p, _, _)| built.contains_key(p));
            if !ready {
                rest.push(rp);
                continue;
            }
            let program = Rc::new(Program {
                path: rp.path.clone(),
                globals: rp.globals,
                num_globals: rp.num_globals,
                own_base: rp.own_base,
                funcs: rp
                    .funcs
                    .into_iter()
                    .map(|f| {
                        Rc::new(FnDef {
                            name: f.name,
                            is_static: f.is_static,
                            num_args: f.num_args,
                            num_locals: f.num_locals,
                            code: f.code,
                            locals: Vec::new(),
                        })
                    })
                    .collect(),
                inherits: rp
                    .inherits
                    .into_iter()
                    .map(|(alias, path, var_offset, func_offset)| InheritEntry {
                        program: built[&path].clone(),
                        alias,
                        path,
                        var_offset,
                        func_offset,
                    })
                    .collect(),
                ancestors: rp
                    .ancestors
                    .into_iter()
                    .map(|(path, base)| Ancestor {
                        program: built[&path].clone(),
                        base,
                    })
                    .collect(),
            });
            built.insert(rp.path.clone(), program.clone());
            let id = engine.protos.insert(Proto {
                pathname: rp.path,
                program,
                proto_obj: rp.proto_obj,
            });
            // Every clone hangs off the proto object's child chain.
            let mut cursor = Some(rp.proto_obj);
            while let Some(c) = cursor {
                if let Some(o) = engine.store.get_mut(c) {
                    o.proto = Some(id);
                    cursor = o.next_child;
                } else {
                    break;
                }
            }
        }
        if rest.len() == before {
            return Err(corrupt(
                "prototypes",
                "unresolvable inheritance references",
            ));
        }
        raw = rest;
    }
    Ok(())
}

// ---- boot and panic --------------------------------------------------

/// First boot: compile `/boot` and make its proto object the master
/// (handle 0, PRIV).
pub fn create_db(engine: &mut Engine) -> Result<(), DbError> {
    let id = engine.load_proto("/boot").map_err(|e| corrupt("boot", e.to_string()))?;
    let boot_obj = engine.protos.get(id).unwrap().proto_obj;
    debug_assert_eq!(boot_obj, crate::engine::MASTER);
    if let Some(o) = engine.store.get_mut(boot_obj) {
        o.flags.insert(ObjFlags::PRIV);
    }
    engine.cycles.hard = 0;
    engine.cycles.soft = 0;
    engine.call_named(boot_obj, "init", None, None, Vec::new());
    crate::queues::handle_destruct(engine);
    Ok(())
}

/// Final write attempt on a fatal error: checkpoint to the panic path
/// and ask the loop to exit nonzero. Re-entrant calls (a failure during
/// the panic save itself) fall through to the exit request.
pub fn fatal_panic(engine: &mut Engine, reason: &str) {
    use crate::engine::RunState;
    if engine.run_state == RunState::PanicRequested {
        return;
    }
    engine.run_state = RunState::PanicRequested;
    tracing::error!(reason, "fatal error, attempting panic save");
    let panic_path = engine.config.panic_path.clone();
    if let Err(e) = save_db(engine, Some(&panic_path)) {
        tracing::error!(error = %e, "panic save failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip_value(v: &Value) -> Value {
        let mut buf = Vec::new();
        write_value(&mut buf, v).unwrap();
        let mut r = Cursor::new(buf);
        read_value(&mut r, "test").unwrap()
    }

    #[test]
    fn test_scalar_value_roundtrip() {
        assert_eq!(roundtrip_value(&Value::Int(-42)), Value::Int(-42));
        assert_eq!(
            roundtrip_value(&Value::Str("hi\nthere".into())),
            Value::Str("hi\nthere".into())
        );
        assert_eq!(roundtrip_value(&Value::Obj(ObjRef(7))), Value::Obj(ObjRef(7)));
    }

    #[test]
    fn test_nested_value_roundtrip() {
        let arr = HeapArray::with_values(
            vec![Value::Int(1), Value::Str("two".into())],
            MaxSize::Bounded(8),
        );
        let map = HeapMapping::new();
        map.borrow_mut()
            .set(MapKey::Str("inner".into()), Value::Array(arr));
        map.borrow_mut().set(MapKey::Int(3), Value::Int(9));
        let v = Value::Mapping(map);
        let back = roundtrip_value(&v);
        let Value::Mapping(m) = back else {
            panic!("expected mapping")
        };
        let m = m.borrow();
        assert_eq!(m.len(), 2);
        assert_eq!(m.get(&MapKey::Int(3)), Some(Value::Int(9)));
        let Some(Value::Array(a)) = m.get(&MapKey::Str("inner".into())) else {
            panic!("expected array")
        };
        assert_eq!(a.borrow().len(), 2);
        assert_eq!(a.borrow().max_size(), MaxSize::Bounded(8));
    }

    #[test]
    fn test_payload_roundtrip() {
        let data = ObjData {
            globals: vec![
                Value::Int(5),
                Value::Str("name".into()),
                Value::Obj(ObjRef(2)),
            ],
            refd_by: vec![(ObjRef(9), 1), (ObjRef(4), 0)],
        };
        let mut buf = Vec::new();
        write_payload_data(&mut buf, &data).unwrap();
        let mut r = Cursor::new(buf);
        let back = read_payload(&mut r).unwrap();
        assert_eq!(back.globals.len(), 3);
        assert_eq!(back.globals[0], Value::Int(5));
        assert_eq!(back.refd_by, vec![(ObjRef(9), 1), (ObjRef(4), 0)]);
    }

    #[test]
    fn test_instr_roundtrip() {
        let program = Program::empty("/t");
        let cells = vec![
            Instr::Int(12),
            Instr::Str("s".into()),
            Instr::Code(44),
            Instr::GlobalLValue { slot: 3, size: 10 },
            Instr::LocalLValue { slot: 1, size: 0 },
            Instr::NumArgs(2),
            Instr::ArraySize(6),
            Instr::Jump(17),
            Instr::Branch(4),
            Instr::NewLine(9),
            Instr::Return,
            Instr::LocalRef,
            Instr::GlobalRef,
            Instr::FuncName("late".into()),
            Instr::CallSuper {
                inherit_idx: 0,
                func_idx: 2,
            },
            Instr::CallParentNamed {
                inherit_idx: 1,
                func_idx: 0,
            },
        ];
        let mut buf = Vec::new();
        for c in &cells {
            write_instr(&mut buf, c, &program).unwrap();
        }
        let mut r = Cursor::new(buf);
        for c in &cells {
            assert_eq!(&read_instr(&mut r).unwrap(), c);
        }
    }

    #[test]
    fn test_funccall_persists_as_name() {
        let program = Program {
            path: "/t".into(),
            globals: vec![],
            num_globals: 0,
            own_base: 0,
            funcs: vec![Rc::new(FnDef {
                name: "helper".into(),
                is_static: false,
                num_args: 0,
                num_locals: 0,
                code: vec![],
                locals: vec![],
            })],
            inherits: vec![],
            ancestors: vec![],
        };
        let mut buf = Vec::new();
        write_instr(&mut buf, &Instr::FuncCall(0), &program).unwrap();
        let mut r = Cursor::new(buf);
        assert_eq!(
            read_instr(&mut r).unwrap(),
            Instr::FuncName("helper".into())
        );
    }

    #[test]
    fn test_bad_magic_detected() {
        let err = corrupt("header", "'junk' is not a Tern database");
        assert!(err.to_string().contains("header"));
    }
}
