//! Connection (device) builtins

use super::{as_int, as_obj, as_str, need, obj_result};
use crate::engine::Engine;
use crate::interp::Ctx;
use crate::object::ObjFlags;
use tern_core::array::{HeapArray, MaxSize};
use tern_core::{ObjRef, RuntimeError, Value};

fn dev_of(engine: &Engine, r: ObjRef) -> Option<usize> {
    engine.store.live(r).and_then(|o| o.devnum)
}

pub fn bi_set_interactive(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "set_interactive")?;
    let on = as_int(&args[0])? != 0;
    engine.dirty(ctx.obj);
    if let Some(obj) = engine.store.live_mut(ctx.obj) {
        obj.flags.set(ObjFlags::INTERACTIVE, on);
    }
    Ok(Value::zero())
}

pub fn bi_interactive(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "interactive")?;
    let r = as_obj(&args[0])?;
    let on = engine
        .store
        .live(r)
        .map(|o| o.flags.contains(ObjFlags::INTERACTIVE))
        .unwrap_or(false);
    Ok(Value::Int(on as i64))
}

pub fn bi_connected(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "connected")?;
    let r = as_obj(&args[0])?;
    let on = engine
        .store
        .live(r)
        .map(|o| o.flags.contains(ObjFlags::CONNECTED))
        .unwrap_or(false);
    Ok(Value::Int(on as i64))
}

/// Write a message to this object's device. Returns 1 when no device
/// is attached.
pub fn bi_send_device(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "send_device")?;
    let msg = as_str(&args[0])?;
    match dev_of(engine, ctx.obj) {
        Some(dev) => {
            let msg = msg.to_string();
            engine.conns.send(dev, &msg);
            Ok(Value::zero())
        }
        None => Ok(Value::Int(1)),
    }
}

pub fn bi_flush_device(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 0, "flush_device")?;
    if let Some(dev) = dev_of(engine, ctx.obj) {
        engine.conns.flush(dev);
    }
    Ok(Value::zero())
}

pub fn bi_disconnect_device(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 0, "disconnect_device")?;
    if let Some(dev) = dev_of(engine, ctx.obj) {
        engine.conns.flush(dev);
        engine.conns.disconnect(dev);
    }
    if let Some(obj) = engine.store.live_mut(ctx.obj) {
        obj.devnum = None;
        obj.flags.remove(ObjFlags::CONNECTED);
    }
    Ok(Value::zero())
}

/// Move this object's device onto another object (the login handoff).
/// PRIV only.
pub fn bi_reconnect_device(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "reconnect_device")?;
    let target = as_obj(&args[0])?;
    if !engine.is_priv(ctx.obj) {
        return Ok(Value::Int(1));
    }
    let Some(dev) = dev_of(engine, ctx.obj) else {
        return Ok(Value::Int(1));
    };
    if !engine.store.is_live(target) {
        return Ok(Value::Int(1));
    }
    if let Some(o) = engine.store.live_mut(ctx.obj) {
        o.devnum = None;
        o.flags.remove(ObjFlags::CONNECTED);
    }
    if let Some(o) = engine.store.live_mut(target) {
        o.devnum = Some(dev);
        o.flags.insert(ObjFlags::CONNECTED | ObjFlags::INTERACTIVE);
    }
    if let Some(conn) = engine.conns.get_mut(dev) {
        conn.obj = Some(target);
    }
    engine.dirty(ctx.obj);
    engine.dirty(target);
    Ok(Value::zero())
}

/// Open an outbound connection and attach it to this object. PRIV only.
pub fn bi_connect_device(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "connect_device")?;
    let address = as_str(&args[0])?.to_string();
    let port = as_int(&args[1])?;
    if !engine.is_priv(ctx.obj) {
        return Ok(Value::Int(1));
    }
    if !(1..=65535).contains(&port) {
        return Ok(Value::Int(1));
    }
    let now = engine.now_time;
    match engine.conns.connect_out(&address, port as u16, now) {
        Ok(dev) => {
            if let Some(conn) = engine.conns.get_mut(dev) {
                conn.obj = Some(ctx.obj);
            }
            if let Some(o) = engine.store.live_mut(ctx.obj) {
                o.devnum = Some(dev);
                o.flags.insert(ObjFlags::CONNECTED);
            }
            Ok(Value::zero())
        }
        Err(e) => {
            tracing::debug!(address, port, error = %e, "connect_device failed");
            Ok(Value::Int(1))
        }
    }
}

pub fn bi_get_devconn(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "get_devconn")?;
    let r = as_obj(&args[0])?;
    let Some(dev) = dev_of(engine, r) else {
        return Ok(Value::zero());
    };
    Ok(engine
        .conns
        .get(dev)
        .map(|c| Value::Str(c.peer.ip().to_string()))
        .unwrap_or_else(Value::zero))
}

pub fn bi_get_devport(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "get_devport")?;
    let r = as_obj(&args[0])?;
    let Some(dev) = dev_of(engine, r) else {
        return Ok(Value::Int(-1));
    };
    Ok(engine
        .conns
        .get(dev)
        .and_then(|c| c.local)
        .map(|a| Value::Int(a.port() as i64))
        .unwrap_or(Value::Int(-1)))
}

pub fn bi_get_devnet(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "get_devnet")?;
    let r = as_obj(&args[0])?;
    let Some(dev) = dev_of(engine, r) else {
        return Ok(Value::zero());
    };
    Ok(engine
        .conns
        .get(dev)
        .and_then(|c| c.local)
        .map(|a| Value::Str(a.ip().to_string()))
        .unwrap_or_else(Value::zero))
}

pub fn bi_get_devidle(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "get_devidle")?;
    let r = as_obj(&args[0])?;
    let Some(dev) = dev_of(engine, r) else {
        return Ok(Value::Int(-1));
    };
    Ok(engine
        .conns
        .get(dev)
        .map(|c| Value::Int((engine.now_time - c.last_input).max(0)))
        .unwrap_or(Value::Int(-1)))
}

pub fn bi_get_conntime(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "get_conntime")?;
    let r = as_obj(&args[0])?;
    let Some(dev) = dev_of(engine, r) else {
        return Ok(Value::Int(-1));
    };
    Ok(engine
        .conns
        .get(dev)
        .map(|c| Value::Int((engine.now_time - c.connect_time).max(0)))
        .unwrap_or(Value::Int(-1)))
}

fn connected_objects(engine: &Engine) -> Vec<ObjRef> {
    engine
        .conns
        .devices()
        .into_iter()
        .filter_map(|d| engine.conns.get(d).and_then(|c| c.obj))
        .collect()
}

/// Walk the connected objects: 0 gives the first, an object gives the
/// next one after it.
pub fn bi_next_who(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "next_who")?;
    let who = connected_objects(engine);
    let next = match &args[0] {
        Value::Int(0) => who.first().copied(),
        Value::Obj(r) => who
            .iter()
            .position(|x| x == r)
            .and_then(|p| who.get(p + 1))
            .copied(),
        other => {
            return Err(RuntimeError::TypeMismatch {
                expected: "object",
                found: other.type_name(),
            })
        }
    };
    Ok(obj_result(next))
}

pub fn bi_users(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 0, "users")?;
    let list: Vec<Value> = connected_objects(engine)
        .into_iter()
        .map(Value::Obj)
        .collect();
    Ok(Value::Array(HeapArray::with_values(list, MaxSize::Unlimited)))
}
