//! Scheduling, reflection, and privileged control builtins

use super::{as_int, as_obj, as_opt_str, as_str, need, need_at_least};
use crate::engine::{Engine, RunState, MASTER};
use crate::interp::Ctx;
use crate::object::ObjFlags;
use rand::Rng;
use tern_core::{RuntimeError, Value};

pub const VERSION: &str = concat!("Tern ", env!("CARGO_PKG_VERSION"));

// sysctl sub-operations.
const CTL_SAVE: i64 = 1;
const CTL_SHUTDOWN: i64 = 2;
const CTL_PANIC: i64 = 3;
const CTL_PENDING_COMMANDS: i64 = 4;
const CTL_PENDING_ALARMS: i64 = 5;
const CTL_PENDING_DESTRUCTS: i64 = 6;
const CTL_VERSION: i64 = 7;
const CTL_HARD_CYCLES: i64 = 8;
const CTL_SOFT_CYCLES: i64 = 9;
const CTL_TRACE_DEPTH: i64 = 10;
const CTL_RESIDENT_COUNT: i64 = 11;
const CTL_CACHE_SIZE: i64 = 12;
const CTL_DB_TOP: i64 = 13;

pub fn bi_alarm(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "alarm")?;
    let delay = as_int(&args[0])?.max(0);
    let func = as_str(&args[1])?.to_string();
    let deadline = engine.now_time + delay;
    engine.queues.queue_alarm(ctx.obj, deadline, func);
    Ok(Value::zero())
}

/// Cancel this object's first alarm (optionally by function name);
/// returns the remaining delay, or -1 when nothing matched.
pub fn bi_remove_alarm(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    let func = match args.first() {
        Some(v) => as_opt_str(v)?,
        None => None,
    };
    let now = engine.now_time;
    Ok(Value::Int(
        engine
            .queues
            .remove_alarm(ctx.obj, func, now)
            .unwrap_or(-1),
    ))
}

pub fn bi_time(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 0, "time")?;
    Ok(Value::Int(engine.now_time))
}

/// Render an epoch timestamp as "YYYY-MM-DD HH:MM:SS" UTC.
pub fn bi_mktime(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "mktime")?;
    Ok(Value::Str(format_time(as_int(&args[0])?)))
}

pub fn format_time(t: i64) -> String {
    let days = t.div_euclid(86_400);
    let secs = t.rem_euclid(86_400);
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    let (y, mo, d) = civil_from_days(days);
    format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}", y, mo, d, h, m, s)
}

// Days-since-epoch to calendar date (proleptic Gregorian).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

pub fn bi_random(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "random")?;
    let limit = as_int(&args[0])?;
    if limit <= 0 {
        return Ok(Value::zero());
    }
    Ok(Value::Int(rand::thread_rng().gen_range(0..limit)))
}

pub fn bi_typeof(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "typeof")?;
    Ok(Value::Int(args[0].type_tag()))
}

/// PRIV: a line into the server log.
pub fn bi_syslog(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "syslog")?;
    let msg = as_str(&args[0])?;
    if !engine.is_priv(ctx.obj) {
        return Ok(Value::Int(1));
    }
    tracing::info!(obj = %ctx.obj, "world: {}", msg);
    Ok(Value::zero())
}

/// PRIV: raw write to the server's standard output.
pub fn bi_syswrite(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "syswrite")?;
    let msg = as_str(&args[0])?;
    if !engine.is_priv(ctx.obj) {
        return Ok(Value::Int(1));
    }
    println!("{}", msg);
    Ok(Value::zero())
}

pub fn bi_compile_object(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "compile_object")?;
    let path = as_str(&args[0])?.to_string();
    if engine.fs.host_path(&path).is_err() {
        return Ok(Value::zero());
    }
    match engine.load_proto(&path) {
        Ok(id) => Ok(Value::Obj(engine.protos.get(id).unwrap().proto_obj)),
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "compile failed");
            if let Some(dev) = ctx
                .player
                .and_then(|p| engine.store.live(p))
                .and_then(|o| o.devnum)
            {
                engine.conns.send(dev, &format!("{}: {}\n", path, e));
            }
            Ok(Value::zero())
        }
    }
}

/// Compile source text under a synthetic path and return the new
/// prototype's object.
pub fn bi_compile_string(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "compile_string")?;
    let path = as_str(&args[0])?.to_string();
    let source = as_str(&args[1])?.to_string();
    match engine.compile_source(&path, &source) {
        Ok(id) => Ok(Value::Obj(engine.protos.get(id).unwrap().proto_obj)),
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "compile_string failed");
            Ok(Value::zero())
        }
    }
}

pub fn bi_set_priv(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "set_priv")?;
    let target = as_obj(&args[0])?;
    let on = as_int(&args[1])? != 0;
    if !engine.is_priv(ctx.obj) {
        return Ok(Value::Int(1));
    }
    engine.dirty(target);
    if let Some(o) = engine.store.live_mut(target) {
        o.flags.set(ObjFlags::PRIV, on);
        return Ok(Value::zero());
    }
    Ok(Value::Int(1))
}

pub fn bi_priv(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "priv")?;
    let r = as_obj(&args[0])?;
    Ok(Value::Int(engine.is_priv(r) as i64))
}

pub fn bi_in_editor(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "in_editor")?;
    let r = as_obj(&args[0])?;
    let on = engine
        .store
        .live(r)
        .map(|o| o.flags.contains(ObjFlags::IN_EDITOR))
        .unwrap_or(false);
    Ok(Value::Int(on as i64))
}

pub fn bi_set_localverbs(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "set_localverbs")?;
    let on = as_int(&args[0])? != 0;
    engine.dirty(ctx.obj);
    if let Some(o) = engine.store.live_mut(ctx.obj) {
        o.flags.set(ObjFlags::LOCALVERBS, on);
    }
    Ok(Value::zero())
}

pub fn bi_localverbs(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "localverbs")?;
    let r = as_obj(&args[0])?;
    let on = engine
        .store
        .live(r)
        .map(|o| o.flags.contains(ObjFlags::LOCALVERBS))
        .unwrap_or(false);
    Ok(Value::Int(on as i64))
}

pub fn bi_get_master(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    _args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    Ok(Value::Obj(MASTER))
}

pub fn bi_is_master(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "is_master")?;
    let r = as_obj(&args[0])?;
    Ok(Value::Int(engine.is_master(r) as i64))
}

// ---- interned table --------------------------------------------------

pub fn bi_table_get(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "table_get")?;
    let key = as_str(&args[0])?;
    Ok(engine
        .table
        .get(key)
        .map(|v| Value::Str(v.to_string()))
        .unwrap_or_else(Value::zero))
}

pub fn bi_table_set(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "table_set")?;
    let key = as_str(&args[0])?;
    if !engine.is_priv(ctx.obj) {
        return Ok(Value::Int(1));
    }
    match as_opt_str(&args[1])? {
        Some(value) => engine.table.set(key, value),
        None => engine.table.delete(key),
    }
    Ok(Value::zero())
}

pub fn bi_table_delete(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "table_delete")?;
    let key = as_str(&args[0])?;
    if !engine.is_priv(ctx.obj) {
        return Ok(Value::Int(1));
    }
    engine.table.delete(key);
    Ok(Value::zero())
}

// ---- sysctl ----------------------------------------------------------

/// Privileged control surface: checkpoint, shutdown, panic, queue
/// introspection, version, and the cycle/trace/cache knobs.
pub fn bi_sysctl(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need_at_least(&args, 1, "sysctl")?;
    if !engine.is_priv(ctx.obj) {
        return Ok(Value::Int(-1));
    }
    let oper = as_int(&args[0])?;
    let arg = args.get(1);
    Ok(match oper {
        CTL_SAVE => {
            engine.run_state = RunState::SaveRequested;
            Value::zero()
        }
        CTL_SHUTDOWN => {
            engine.run_state = RunState::ShutdownRequested;
            Value::zero()
        }
        CTL_PANIC => {
            engine.run_state = RunState::PanicRequested;
            Value::zero()
        }
        CTL_PENDING_COMMANDS => Value::Int(engine.queues.commands().len() as i64),
        CTL_PENDING_ALARMS => Value::Int(engine.queues.alarms().len() as i64),
        CTL_PENDING_DESTRUCTS => Value::Int(engine.queues.dest.len() as i64),
        CTL_VERSION => Value::Str(VERSION.to_string()),
        CTL_HARD_CYCLES => {
            let max = arg.map(as_int).transpose()?.unwrap_or(0);
            engine.cycles.hard_max = if max > 0 { Some(max as u64) } else { None };
            Value::zero()
        }
        CTL_SOFT_CYCLES => {
            let max = arg.map(as_int).transpose()?.unwrap_or(0);
            engine.cycles.soft_max = if max > 0 { Some(max as u64) } else { None };
            Value::zero()
        }
        CTL_TRACE_DEPTH => {
            let depth = arg.map(as_int).transpose()?.unwrap_or(16);
            engine.trace_depth = depth.clamp(1, 256) as usize;
            Value::zero()
        }
        CTL_RESIDENT_COUNT => Value::Int(engine.cache.resident_count() as i64),
        CTL_CACHE_SIZE => {
            if let Some(v) = arg {
                engine.cache.cap = as_int(v)?.max(1) as usize;
            }
            Value::Int(engine.cache.cap as i64)
        }
        CTL_DB_TOP => Value::Int(engine.store.db_top() as i64),
        _ => Value::zero(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_time_epoch() {
        assert_eq!(format_time(0), "1970-01-01 00:00:00");
        assert_eq!(format_time(86_400 + 3_661), "1970-01-02 01:01:01");
    }

    #[test]
    fn test_format_time_modern() {
        // 2024-03-01 00:00:00 UTC
        assert_eq!(format_time(1_709_251_200), "2024-03-01 00:00:00");
    }

    #[test]
    fn test_version_string() {
        assert!(VERSION.starts_with("Tern "));
    }
}
