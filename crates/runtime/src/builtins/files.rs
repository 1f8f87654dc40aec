//! Filesystem builtins
//!
//! Every operation funnels through one access check. If the master
//! object defines `valid_read` / `valid_write`, that function is called
//! with `(path, operation, caller_object, file_owner, file_flags)` and
//! its integer result is authoritative; otherwise a built-in owner/flag
//! check applies. The authority is suppressed while a master check is
//! already running and when the master itself asks, so it can never
//! re-enter itself.
//!
//! Denials are results: mutating operations return integer 1, readers
//! return integer 0. Only malformed arguments raise runtime errors.

use super::{as_int, as_obj, as_str, need};
use crate::engine::{Engine, MASTER};
use crate::fsmirror::{validate_path, FileFlags};
use crate::interp::{self, Ctx};
use tern_core::array::{HeapArray, MaxSize};
use tern_core::{ObjRef, RuntimeError, Value};

fn check_access(engine: &mut Engine, ctx: &mut Ctx, path: &str, write: bool) -> bool {
    if validate_path(path).is_err() {
        return false;
    }
    let meta = match engine.fs.lookup(path) {
        Ok(m) => m,
        Err(_) => return false,
    };
    let (flags, owner) = meta.unwrap_or((FileFlags::empty(), -1));
    // The master's own verdict, unless we are already inside one or the
    // master itself is asking.
    if !engine.in_master_check && ctx.obj != MASTER {
        let func_name = if write { "valid_write" } else { "valid_read" };
        if let Some((func, definer)) = engine.find_function(MASTER, func_name, false) {
            let owner_val = if owner >= 0 && engine.store.is_live(ObjRef(owner as u32)) {
                Value::Obj(ObjRef(owner as u32))
            } else {
                Value::zero()
            };
            let args = vec![
                Value::Str(path.to_string()),
                Value::Str(if write { "write" } else { "read" }.to_string()),
                Value::Obj(ctx.obj),
                owner_val,
                Value::Int(flags.bits() as i64),
            ];
            engine.in_master_check = true;
            let verdict = interp::call_function(
                engine,
                Some(ctx.obj),
                MASTER,
                ctx.player,
                func,
                definer,
                args,
            );
            engine.in_master_check = false;
            return match verdict {
                Ok(v) => v.is_true(),
                Err(_) => false,
            };
        }
    }
    if engine.is_priv(ctx.obj) {
        return true;
    }
    if owner >= 0 && owner as u32 == ctx.obj.0 {
        return true;
    }
    if write {
        flags.contains(FileFlags::WRITE_OK)
    } else {
        flags.contains(FileFlags::READ_OK)
    }
}

pub fn bi_read_file(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    if args.is_empty() || args.len() > 2 {
        return Err(RuntimeError::BadArgCount {
            name: "read_file",
            found: args.len() as u32,
        });
    }
    let path = as_str(&args[0])?.to_string();
    let pos = args.get(1).map(as_int).transpose()?.unwrap_or(0).max(0) as usize;
    if !check_access(engine, ctx, &path, false) {
        return Ok(Value::zero());
    }
    match engine.fs.read_text(&path) {
        Ok(text) => Ok(Value::Str(text[pos.min(text.len())..].to_string())),
        Err(_) => Ok(Value::zero()),
    }
}

pub fn bi_write_file(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "write_file")?;
    let path = as_str(&args[0])?.to_string();
    let text = as_str(&args[1])?.to_string();
    if !check_access(engine, ctx, &path, true) {
        return Ok(Value::Int(1));
    }
    let owner = ctx.obj.0 as i64;
    match engine.fs.append_text(&path, &text, owner) {
        Ok(()) => Ok(Value::zero()),
        Err(_) => Ok(Value::Int(1)),
    }
}

/// Stream a file to the caller's device.
pub fn bi_cat(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "cat")?;
    let path = as_str(&args[0])?.to_string();
    if !check_access(engine, ctx, &path, false) {
        return Ok(Value::Int(1));
    }
    let text = match engine.fs.read_text(&path) {
        Ok(t) => t,
        Err(_) => return Ok(Value::Int(1)),
    };
    let dev = ctx
        .player
        .or(Some(ctx.obj))
        .and_then(|o| engine.store.live(o))
        .and_then(|o| o.devnum);
    if let Some(dev) = dev {
        engine.conns.send(dev, &text);
    }
    Ok(Value::zero())
}

pub fn bi_remove(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "remove")?;
    let path = as_str(&args[0])?.to_string();
    if !check_access(engine, ctx, &path, true) {
        return Ok(Value::Int(1));
    }
    match engine.fs.remove_file(&path) {
        Ok(()) => Ok(Value::zero()),
        Err(_) => Ok(Value::Int(1)),
    }
}

pub fn bi_ferase(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "ferase")?;
    let path = as_str(&args[0])?.to_string();
    if !check_access(engine, ctx, &path, true) {
        return Ok(Value::Int(1));
    }
    match engine.fs.erase(&path) {
        Ok(()) => Ok(Value::zero()),
        Err(_) => Ok(Value::Int(1)),
    }
}

pub fn bi_cp(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "cp")?;
    let from = as_str(&args[0])?.to_string();
    let to = as_str(&args[1])?.to_string();
    if !check_access(engine, ctx, &from, false) || !check_access(engine, ctx, &to, true) {
        return Ok(Value::Int(1));
    }
    match engine.fs.copy_file(&from, &to, ctx.obj.0 as i64) {
        Ok(()) => Ok(Value::zero()),
        Err(_) => Ok(Value::Int(1)),
    }
}

pub fn bi_rename(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "rename")?;
    let from = as_str(&args[0])?.to_string();
    let to = as_str(&args[1])?.to_string();
    if !check_access(engine, ctx, &from, true) || !check_access(engine, ctx, &to, true) {
        return Ok(Value::Int(1));
    }
    match engine.fs.rename_file(&from, &to, ctx.obj.0 as i64) {
        Ok(()) => Ok(Value::zero()),
        Err(_) => Ok(Value::Int(1)),
    }
}

pub fn bi_mkdir(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "mkdir")?;
    let path = as_str(&args[0])?.to_string();
    if !check_access(engine, ctx, &path, true) {
        return Ok(Value::Int(1));
    }
    match engine.fs.make_dir(&path, ctx.obj.0 as i64) {
        Ok(()) => Ok(Value::zero()),
        Err(_) => Ok(Value::Int(1)),
    }
}

pub fn bi_rmdir(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "rmdir")?;
    let path = as_str(&args[0])?.to_string();
    if !check_access(engine, ctx, &path, true) {
        return Ok(Value::Int(1));
    }
    match engine.fs.remove_dir(&path) {
        Ok(()) => Ok(Value::zero()),
        Err(_) => Ok(Value::Int(1)),
    }
}

pub fn bi_get_dir(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "get_dir")?;
    let path = as_str(&args[0])?.to_string();
    if !check_access(engine, ctx, &path, false) {
        return Ok(Value::zero());
    }
    match engine.fs.list_dir(&path) {
        Ok(names) => Ok(Value::Array(HeapArray::with_values(
            names.into_iter().map(Value::Str).collect(),
            MaxSize::Unlimited,
        ))),
        Err(_) => Ok(Value::zero()),
    }
}

/// PRIV: mark an entry hidden (dropped from listings).
pub fn bi_hide(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "hide")?;
    let path = as_str(&args[0])?.to_string();
    if !engine.is_priv(ctx.obj) {
        return Ok(Value::Int(1));
    }
    let Ok(Some((flags, owner))) = engine.fs.lookup(&path) else {
        return Ok(Value::Int(1));
    };
    match engine
        .fs
        .set_meta(&path, Some(owner), Some(flags | FileFlags::HIDDEN))
    {
        Ok(()) => Ok(Value::zero()),
        Err(_) => Ok(Value::Int(1)),
    }
}

/// PRIV: unhide and reassign owner and flags in one step.
pub fn bi_unhide(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 3, "unhide")?;
    let path = as_str(&args[0])?.to_string();
    let owner = as_obj(&args[1])?;
    let flags = as_int(&args[2])? as u32;
    if !engine.is_priv(ctx.obj) {
        return Ok(Value::Int(1));
    }
    let flags = FileFlags::from_bits_truncate(flags) & !FileFlags::HIDDEN;
    match engine.fs.set_meta(&path, Some(owner.0 as i64), Some(flags)) {
        Ok(()) => Ok(Value::zero()),
        Err(_) => Ok(Value::Int(1)),
    }
}

pub fn bi_chown(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "chown")?;
    let path = as_str(&args[0])?.to_string();
    let owner = as_obj(&args[1])?;
    if !check_access(engine, ctx, &path, true) {
        return Ok(Value::Int(1));
    }
    match engine.fs.set_meta(&path, Some(owner.0 as i64), None) {
        Ok(()) => Ok(Value::zero()),
        Err(_) => Ok(Value::Int(1)),
    }
}

pub fn bi_chmod(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "chmod")?;
    let path = as_str(&args[0])?.to_string();
    let flags = as_int(&args[1])? as u32;
    if !check_access(engine, ctx, &path, true) {
        return Ok(Value::Int(1));
    }
    // The directory bit reflects reality; callers cannot toggle it.
    let keep_dir = engine
        .fs
        .lookup(&path)
        .ok()
        .flatten()
        .map(|(f, _)| f.contains(FileFlags::DIRECTORY))
        .unwrap_or(false);
    let mut flags = FileFlags::from_bits_truncate(flags);
    flags.set(FileFlags::DIRECTORY, keep_dir);
    match engine.fs.set_meta(&path, None, Some(flags)) {
        Ok(()) => Ok(Value::zero()),
        Err(_) => Ok(Value::Int(1)),
    }
}

/// `({ size, flags, owner })`, or 0 when unreadable.
pub fn bi_fstat(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "fstat")?;
    let path = as_str(&args[0])?.to_string();
    if !check_access(engine, ctx, &path, false) {
        return Ok(Value::zero());
    }
    let Ok(Some((flags, owner))) = engine.fs.lookup(&path) else {
        return Ok(Value::zero());
    };
    let size = engine.fs.file_size(&path).unwrap_or(-1);
    Ok(Value::Array(HeapArray::with_values(
        vec![
            Value::Int(size),
            Value::Int(flags.bits() as i64),
            Value::Int(owner),
        ],
        MaxSize::Unlimited,
    )))
}

pub fn bi_fowner(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "fowner")?;
    let path = as_str(&args[0])?.to_string();
    if !check_access(engine, ctx, &path, false) {
        return Ok(Value::zero());
    }
    let Ok(Some((_, owner))) = engine.fs.lookup(&path) else {
        return Ok(Value::zero());
    };
    if owner >= 0 && engine.store.is_live(ObjRef(owner as u32)) {
        Ok(Value::Obj(ObjRef(owner as u32)))
    } else {
        Ok(Value::zero())
    }
}

pub fn bi_file_size(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "file_size")?;
    let path = as_str(&args[0])?.to_string();
    if !check_access(engine, ctx, &path, false) {
        return Ok(Value::Int(-1));
    }
    Ok(Value::Int(engine.fs.file_size(&path).unwrap_or(-1)))
}

/// The on-disk editor is not part of the engine; the call is accepted
/// and denied.
pub fn bi_edit(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "edit")?;
    Ok(Value::Int(1))
}
