//! Verb and input-routing builtins

use super::{as_obj, as_opt_str, as_str, need};
use crate::engine::Engine;
use crate::interp::Ctx;
use crate::object::Verb;
use tern_core::{RuntimeError, Value};

/// Bind a command word to a function on this object. An xverb matches
/// by prefix. Mutating the verb list mid-command claims the command.
pub fn bi_add_verb(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
    is_xverb: bool,
) -> Result<Value, RuntimeError> {
    need(&args, 2, if is_xverb { "add_xverb" } else { "add_verb" })?;
    let name = as_str(&args[0])?.to_string();
    let func = as_str(&args[1])?.to_string();
    engine.dirty(ctx.obj);
    if let Some(obj) = engine.store.live_mut(ctx.obj) {
        obj.verbs.push(Verb {
            name,
            is_xverb,
            func,
        });
    }
    engine.verbs_changed = true;
    Ok(Value::zero())
}

pub fn bi_remove_verb(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "remove_verb")?;
    let name = as_str(&args[0])?.to_string();
    engine.dirty(ctx.obj);
    let removed = engine
        .store
        .live_mut(ctx.obj)
        .map(|obj| {
            let before = obj.verbs.len();
            let mut dropped = false;
            obj.verbs.retain(|v| {
                if !dropped && v.name == name {
                    dropped = true;
                    false
                } else {
                    true
                }
            });
            obj.verbs.len() != before
        })
        .unwrap_or(false);
    engine.verbs_changed = true;
    Ok(Value::Int(if removed { 0 } else { 1 }))
}

/// Walk an object's verb list: no name gives the first verb, a name
/// gives the one after it.
pub fn bi_next_verb(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "next_verb")?;
    let r = as_obj(&args[0])?;
    let after = as_opt_str(&args[1])?;
    let Some(obj) = engine.store.live(r) else {
        return Ok(Value::zero());
    };
    let next = match after {
        None => obj.verbs.first(),
        Some(name) => {
            let pos = obj.verbs.iter().position(|v| v.name == name);
            pos.and_then(|p| obj.verbs.get(p + 1))
        }
    };
    Ok(next
        .map(|v| Value::Str(v.name.clone()))
        .unwrap_or_else(Value::zero))
}

/// Enqueue a command as this object; it drains with the command queue.
pub fn bi_command(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "command")?;
    let cmd = as_str(&args[0])?.to_string();
    engine.queues.queue_command(ctx.obj, cmd);
    Ok(Value::Int(1))
}

/// One-shot redirect of this object's next input line to a function on
/// itself. Integer 0 cancels a pending redirection.
pub fn bi_redirect_input(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "redirect_input")?;
    let func = as_opt_str(&args[0])?.map(|s| s.to_string());
    if let Some(obj) = engine.store.live_mut(ctx.obj) {
        obj.input_func = func;
        obj.input_func_obj = None;
    }
    Ok(Value::zero())
}

/// Route the player's next input line to a function on this object.
pub fn bi_input_to(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "input_to")?;
    let func = as_str(&args[0])?.to_string();
    let Some(player) = ctx.player else {
        return Ok(Value::Int(1));
    };
    if let Some(obj) = engine.store.live_mut(player) {
        obj.input_func = Some(func);
        obj.input_func_obj = Some(ctx.obj);
        return Ok(Value::zero());
    }
    Ok(Value::Int(1))
}

pub fn bi_get_input_func(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 0, "get_input_func")?;
    let func = engine
        .store
        .live(ctx.obj)
        .and_then(|o| o.input_func.clone());
    Ok(func.map(Value::Str).unwrap_or_else(Value::zero))
}
