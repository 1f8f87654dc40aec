//! The bytecode interpreter
//!
//! A stack machine over `StackCell`s: plain values, polymorphic
//! l-values, and the argument-count / size markers the compiler spills
//! ahead of calls and subscripts. Each invocation gets its own operand
//! stack and local-slot vector; the call frame records the executing
//! function and its defining program, which fixes how raw global slot
//! numbers translate into the current object's layout (super-dispatch
//! then needs no runtime search).
//!
//! Errors unwind the whole call chain as `Err(RuntimeError)`; the
//! boundary in `Engine::call_boundary` converts them to integer 0 and
//! logs a traceback. No error escapes to the event loop, and no opcode
//! ever blocks.

use crate::builtins;
use crate::engine::Engine;
use std::rc::Rc;
use tern_compiler::{FnDef, Program};
use tern_core::array::{HeapArray, MaxSize};
use tern_core::instr::Instr;
use tern_core::mapping::HeapMapping;
use tern_core::{ArrayHandle, MapKey, MappingHandle, ObjRef, Op, RuntimeError, Value};

const MAX_CALL_DEPTH: usize = 256;

/// A resolvable storage location.
#[derive(Debug, Clone)]
pub enum LValue {
    /// Absolute global slot of the current object (shift already applied).
    Global { slot: u32, size: u32 },
    Local { slot: u32, size: u32 },
    /// An element of a heap array, addressed without materializing into
    /// a slot.
    Elem { arr: ArrayHandle, index: usize },
    /// An entry of a heap mapping (may not exist yet; reads give 0,
    /// writes autovivify).
    Entry { map: MappingHandle, key: MapKey },
}

#[derive(Debug, Clone)]
pub enum StackCell {
    Value(Value),
    LValue(LValue),
    NumArgs(u32),
    Marker(u32),
}

/// Per-invocation context handed to every builtin.
pub struct Ctx {
    pub obj: ObjRef,
    pub player: Option<ObjRef>,
    pub caller: Option<ObjRef>,
    pub locals: Vec<Value>,
    pub func: Rc<FnDef>,
    pub definer: Rc<Program>,
    pub line: u32,
}

/// Invoke a resolved function on an object. `caller` is the object the
/// call came from (None for scheduler entries), `player` the explicit
/// command originator.
pub fn call_function(
    engine: &mut Engine,
    caller: Option<ObjRef>,
    obj: ObjRef,
    player: Option<ObjRef>,
    func: Rc<FnDef>,
    definer: Rc<Program>,
    mut args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    if engine.call_stack.len() >= MAX_CALL_DEPTH {
        return Err(RuntimeError::Other("call stack too deep".to_string()));
    }
    engine.load_data(obj);
    let root = engine
        .proto_of(obj)
        .ok_or(RuntimeError::MissingObject)?
        .program
        .clone();
    let var_shift = Program::slot_shift(&root, &definer).unwrap_or(0);
    if let Some(o) = engine.store.live_mut(obj) {
        o.last_access = engine.now_time;
    }
    args.resize(func.num_args as usize, Value::zero());
    let mut locals = vec![Value::zero(); func.num_locals as usize];
    for (i, a) in args.into_iter().enumerate() {
        locals[i] = a;
    }
    let mut ctx = Ctx {
        obj,
        player,
        caller,
        locals,
        func: func.clone(),
        definer,
        line: 0,
    };
    engine.call_stack.push(crate::engine::TraceEntry {
        obj,
        path: ctx.definer.path.clone(),
        func: func.name.clone(),
        line: 0,
    });
    let result = exec(engine, &mut ctx, var_shift);
    if result.is_ok() {
        // Errors keep their frames so the boundary can synthesize the
        // traceback; the boundary clears the stack afterwards.
        engine.call_stack.pop();
    }
    result
}

fn exec(engine: &mut Engine, ctx: &mut Ctx, var_shift: u32) -> Result<Value, RuntimeError> {
    let func = ctx.func.clone();
    let mut stack: Vec<StackCell> = Vec::new();
    let mut pc = 0usize;
    while pc < func.code.len() {
        engine.cycles.hard += 1;
        engine.cycles.soft += 1;
        if let Some(max) = engine.cycles.hard_max {
            if engine.cycles.hard > max {
                return Err(RuntimeError::CycleLimit { hard: true });
            }
        }
        if let Some(max) = engine.cycles.soft_max {
            if engine.cycles.soft > max {
                return Err(RuntimeError::CycleLimit { hard: false });
            }
        }
        let instr = func.code[pc].clone();
        pc += 1;
        match instr {
            Instr::Int(n) => stack.push(StackCell::Value(Value::Int(n))),
            Instr::Str(s) => stack.push(StackCell::Value(Value::Str(s))),
            Instr::Obj(r) => stack.push(StackCell::Value(Value::Obj(r))),
            Instr::GlobalLValue { slot, size } => {
                stack.push(StackCell::LValue(LValue::Global {
                    slot: slot + var_shift,
                    size,
                }));
            }
            Instr::LocalLValue { slot, size } => {
                stack.push(StackCell::LValue(LValue::Local { slot, size }));
            }
            Instr::NumArgs(n) => stack.push(StackCell::NumArgs(n)),
            Instr::ArraySize(n) => stack.push(StackCell::Marker(n)),
            Instr::Jump(t) => pc = t as usize,
            Instr::Branch(t) => {
                let v = pop_value(engine, ctx, &mut stack)?;
                if !v.is_true() {
                    pc = t as usize;
                }
            }
            Instr::NewLine(line) => {
                stack.clear();
                ctx.line = line;
                if let Some(entry) = engine.call_stack.last_mut() {
                    entry.line = line;
                }
            }
            Instr::Return => {
                return pop_value(engine, ctx, &mut stack);
            }
            Instr::LocalRef | Instr::GlobalRef => {
                resolve_subscript(engine, ctx, &mut stack)?;
            }
            Instr::FuncCall(idx) => {
                let callee = ctx
                    .definer
                    .funcs
                    .get(idx as usize)
                    .cloned()
                    .ok_or_else(|| RuntimeError::Other("corrupt call index".to_string()))?;
                let args = pop_call_args(engine, ctx, &mut stack)?;
                let v = call_function(
                    engine,
                    ctx.caller,
                    ctx.obj,
                    ctx.player,
                    callee,
                    ctx.definer.clone(),
                    args,
                )?;
                stack.push(StackCell::Value(v));
            }
            Instr::FuncName(name) => {
                let args = pop_call_args(engine, ctx, &mut stack)?;
                let (callee, definer) = engine
                    .find_function(ctx.obj, &name, false)
                    .ok_or_else(|| RuntimeError::MissingFunction(name.clone()))?;
                let v = call_function(engine, ctx.caller, ctx.obj, ctx.player, callee, definer, args)?;
                stack.push(StackCell::Value(v));
            }
            Instr::CallSuper {
                inherit_idx,
                func_idx,
            }
            | Instr::CallParentNamed {
                inherit_idx,
                func_idx,
            } => {
                let entry = ctx
                    .definer
                    .inherits
                    .get(inherit_idx as usize)
                    .ok_or_else(|| RuntimeError::Other("corrupt inherit index".to_string()))?
                    .clone();
                let (prog, idx) = Program::decode_dispatch_index(&entry.program, func_idx)
                    .ok_or_else(|| RuntimeError::Other("corrupt super index".to_string()))?;
                let callee = prog.funcs[idx as usize].clone();
                let args = pop_call_args(engine, ctx, &mut stack)?;
                let v = call_function(engine, ctx.caller, ctx.obj, ctx.player, callee, prog, args)?;
                stack.push(StackCell::Value(v));
            }
            Instr::Code(code) => {
                if code < tern_core::NUM_OPERS {
                    let op = Op::from_u8(code as u8).expect("operator range");
                    exec_oper(engine, ctx, &mut stack, op)?;
                } else {
                    builtins::dispatch(engine, ctx, &mut stack, code)?;
                }
            }
        }
    }
    Ok(Value::zero())
}

// ---- stack helpers ---------------------------------------------------

pub(crate) fn pop_cell(stack: &mut Vec<StackCell>) -> Result<StackCell, RuntimeError> {
    stack.pop().ok_or(RuntimeError::StackUnderflow)
}

/// Pop and resolve to a plain value (l-values are read through).
pub(crate) fn pop_value(
    engine: &mut Engine,
    ctx: &Ctx,
    stack: &mut Vec<StackCell>,
) -> Result<Value, RuntimeError> {
    match pop_cell(stack)? {
        StackCell::Value(v) => Ok(v),
        StackCell::LValue(lv) => read_lvalue(engine, ctx, &lv),
        StackCell::NumArgs(_) | StackCell::Marker(_) => Err(RuntimeError::TypeMismatch {
            expected: "value",
            found: "marker",
        }),
    }
}

pub(crate) fn pop_lvalue(stack: &mut Vec<StackCell>) -> Result<LValue, RuntimeError> {
    match pop_cell(stack)? {
        StackCell::LValue(lv) => Ok(lv),
        other => Err(RuntimeError::TypeMismatch {
            expected: "lvalue",
            found: cell_type_name(&other),
        }),
    }
}

fn cell_type_name(cell: &StackCell) -> &'static str {
    match cell {
        StackCell::Value(v) => v.type_name(),
        StackCell::LValue(_) => "lvalue",
        StackCell::NumArgs(_) => "argument marker",
        StackCell::Marker(_) => "size marker",
    }
}

pub(crate) fn pop_int(
    engine: &mut Engine,
    ctx: &Ctx,
    stack: &mut Vec<StackCell>,
) -> Result<i64, RuntimeError> {
    match pop_value(engine, ctx, stack)? {
        Value::Int(n) => Ok(n),
        other => Err(RuntimeError::TypeMismatch {
            expected: "integer",
            found: other.type_name(),
        }),
    }
}

/// Pop the NUM_ARGS marker and the arguments under it, restoring
/// push order.
pub(crate) fn pop_call_args(
    engine: &mut Engine,
    ctx: &Ctx,
    stack: &mut Vec<StackCell>,
) -> Result<Vec<Value>, RuntimeError> {
    let n = match pop_cell(stack)? {
        StackCell::NumArgs(n) => n,
        other => {
            return Err(RuntimeError::TypeMismatch {
                expected: "argument marker",
                found: cell_type_name(&other),
            })
        }
    };
    let mut args = Vec::with_capacity(n as usize);
    for _ in 0..n {
        args.push(pop_value(engine, ctx, stack)?);
    }
    args.reverse();
    Ok(args)
}

// ---- l-value access --------------------------------------------------

pub(crate) fn read_lvalue(
    engine: &mut Engine,
    ctx: &Ctx,
    lv: &LValue,
) -> Result<Value, RuntimeError> {
    match lv {
        LValue::Global { slot, .. } => engine.read_global(ctx.obj, *slot),
        LValue::Local { slot, .. } => {
            ctx.locals
                .get(*slot as usize)
                .cloned()
                .ok_or(RuntimeError::OutOfBounds {
                    index: *slot as i64,
                    size: ctx.locals.len() as u32,
                })
        }
        LValue::Elem { arr, index } => {
            let a = arr.borrow();
            if *index < a.len() {
                a.get(*index as i64)
            } else if a.max_size().admits(*index) {
                // Unwritten cells inside the declared bound read as 0.
                Ok(Value::zero())
            } else {
                Err(RuntimeError::OutOfBounds {
                    index: *index as i64,
                    size: a.max_size().to_marker(),
                })
            }
        }
        LValue::Entry { map, key } => Ok(map.borrow().get(key).unwrap_or_else(Value::zero)),
    }
}

pub(crate) fn store_lvalue(
    engine: &mut Engine,
    ctx: &mut Ctx,
    lv: &LValue,
    value: Value,
) -> Result<(), RuntimeError> {
    match lv {
        LValue::Global { slot, .. } => engine.write_global(ctx.obj, *slot, value),
        LValue::Local { slot, .. } => {
            let slot = *slot as usize;
            if slot >= ctx.locals.len() {
                return Err(RuntimeError::OutOfBounds {
                    index: slot as i64,
                    size: ctx.locals.len() as u32,
                });
            }
            ctx.locals[slot] = value;
            Ok(())
        }
        LValue::Elem { arr, index } => {
            arr.borrow_mut().set(*index as i64, value)?;
            // Heap containers do not know their owner; charge the
            // mutation to the acting object so eviction persists it.
            engine.dirty(ctx.obj);
            Ok(())
        }
        LValue::Entry { map, key } => {
            map.borrow_mut().set(key.clone(), value);
            engine.dirty(ctx.obj);
            Ok(())
        }
    }
}

// ---- subscripts ------------------------------------------------------

/// `GLOBAL_REF` / `LOCAL_REF`: pop (size marker, key, base) and push the
/// element l-value. A zero marker means the base is a mapping; a nonzero
/// marker is the declared array bound, checked here for fixed arrays.
/// Empty slots autovivify to the marker's container kind.
fn resolve_subscript(
    engine: &mut Engine,
    ctx: &mut Ctx,
    stack: &mut Vec<StackCell>,
) -> Result<(), RuntimeError> {
    let marker = match pop_cell(stack)? {
        StackCell::Marker(m) => m,
        other => {
            return Err(RuntimeError::TypeMismatch {
                expected: "size marker",
                found: cell_type_name(&other),
            })
        }
    };
    let key = pop_value(engine, ctx, stack)?;
    let base = pop_cell(stack)?;
    let container = match base {
        StackCell::LValue(lv) => {
            let current = read_lvalue(engine, ctx, &lv)?;
            match current {
                Value::Array(_) | Value::Mapping(_) => current,
                // An empty slot autovivifies to the declared container
                // kind. A scalar slot (marker 1) holds no container and
                // cannot be subscripted.
                v if v.is_zero() && marker != 1 => {
                    let fresh = if marker == 0 {
                        Value::Mapping(HeapMapping::new())
                    } else {
                        Value::Array(HeapArray::new(MaxSize::from_marker(marker)))
                    };
                    store_lvalue(engine, ctx, &lv, fresh.clone())?;
                    fresh
                }
                other => {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "array or mapping",
                        found: other.type_name(),
                    })
                }
            }
        }
        StackCell::Value(v @ (Value::Array(_) | Value::Mapping(_))) => v,
        other => {
            return Err(RuntimeError::TypeMismatch {
                expected: "array or mapping",
                found: cell_type_name(&other),
            })
        }
    };
    match container {
        Value::Array(arr) => {
            let index = match key {
                Value::Int(i) => i,
                other => {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "integer subscript",
                        found: other.type_name(),
                    })
                }
            };
            if index < 0 {
                return Err(RuntimeError::OutOfBounds {
                    index,
                    size: arr.borrow().len() as u32,
                });
            }
            // Declared fixed bounds are checked at ref time; dynamic
            // shapes (marker 1 or unlimited) defer to the array itself.
            if marker > 1 && marker != u32::MAX && index as u64 >= marker as u64 {
                return Err(RuntimeError::OutOfBounds {
                    index,
                    size: marker,
                });
            }
            stack.push(StackCell::LValue(LValue::Elem {
                arr,
                index: index as usize,
            }));
        }
        Value::Mapping(map) => {
            let key = MapKey::from_value(&key).ok_or(RuntimeError::TypeMismatch {
                expected: "hashable key",
                found: "container",
            })?;
            stack.push(StackCell::LValue(LValue::Entry { map, key }));
        }
        _ => unreachable!(),
    }
    Ok(())
}

// ---- operators -------------------------------------------------------

fn exec_oper(
    engine: &mut Engine,
    ctx: &mut Ctx,
    stack: &mut Vec<StackCell>,
    op: Op,
) -> Result<(), RuntimeError> {
    match op {
        Op::Comma => {
            let rhs = pop_value(engine, ctx, stack)?;
            let _lhs = pop_value(engine, ctx, stack)?;
            stack.push(StackCell::Value(rhs));
        }
        op if op.is_assignment() => {
            let rhs = pop_value(engine, ctx, stack)?;
            let lv = pop_lvalue(stack)?;
            let new = if op == Op::Assign {
                rhs
            } else {
                let current = read_lvalue(engine, ctx, &lv)?;
                apply_binop(compound_base(op), current, rhs)?
            };
            store_lvalue(engine, ctx, &lv, new.clone())?;
            stack.push(StackCell::Value(new));
        }
        Op::Eq | Op::NotEq => {
            let rhs = pop_value(engine, ctx, stack)?;
            let lhs = pop_value(engine, ctx, stack)?;
            let eq = lhs == rhs;
            let truth = if op == Op::Eq { eq } else { !eq };
            stack.push(StackCell::Value(Value::Int(truth as i64)));
        }
        Op::Less | Op::LessEq | Op::Greater | Op::GreaterEq => {
            let rhs = pop_int(engine, ctx, stack)?;
            let lhs = pop_int(engine, ctx, stack)?;
            let truth = match op {
                Op::Less => lhs < rhs,
                Op::LessEq => lhs <= rhs,
                Op::Greater => lhs > rhs,
                _ => lhs >= rhs,
            };
            stack.push(StackCell::Value(Value::Int(truth as i64)));
        }
        Op::Not => {
            let v = pop_value(engine, ctx, stack)?;
            stack.push(StackCell::Value(Value::Int(!v.is_true() as i64)));
        }
        Op::BitNot => {
            let v = pop_int(engine, ctx, stack)?;
            stack.push(StackCell::Value(Value::Int(!v)));
        }
        Op::UnaryMinus => {
            let v = pop_int(engine, ctx, stack)?;
            stack.push(StackCell::Value(Value::Int(v.wrapping_neg())));
        }
        Op::PostIncr | Op::PreIncr | Op::PostDecr | Op::PreDecr => {
            let lv = pop_lvalue(stack)?;
            let old = match read_lvalue(engine, ctx, &lv)? {
                Value::Int(n) => n,
                other => {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "integer",
                        found: other.type_name(),
                    })
                }
            };
            let delta = if matches!(op, Op::PostIncr | Op::PreIncr) {
                1
            } else {
                -1
            };
            let new = old.wrapping_add(delta);
            store_lvalue(engine, ctx, &lv, Value::Int(new))?;
            let pushed = if matches!(op, Op::PostIncr | Op::PostDecr) {
                old
            } else {
                new
            };
            stack.push(StackCell::Value(Value::Int(pushed)));
        }
        Op::Cond | Op::LogicalAnd | Op::LogicalOr => {
            // The compiler lowers these into branches.
            return Err(RuntimeError::Other(format!(
                "stray '{}' opcode",
                op.symbol()
            )));
        }
        op => {
            let rhs = pop_value(engine, ctx, stack)?;
            let lhs = pop_value(engine, ctx, stack)?;
            stack.push(StackCell::Value(apply_binop(op, lhs, rhs)?));
        }
    }
    Ok(())
}

fn compound_base(op: Op) -> Op {
    match op {
        Op::AddAssign => Op::Add,
        Op::SubAssign => Op::Sub,
        Op::MulAssign => Op::Mul,
        Op::DivAssign => Op::Div,
        Op::ModAssign => Op::Mod,
        Op::AndAssign => Op::BitAnd,
        Op::XorAssign => Op::BitXor,
        Op::OrAssign => Op::BitOr,
        Op::ShlAssign => Op::Shl,
        Op::ShrAssign => Op::Shr,
        other => other,
    }
}

fn apply_binop(op: Op, lhs: Value, rhs: Value) -> Result<Value, RuntimeError> {
    if op == Op::Add {
        // String concatenation; the empty string travels as integer 0,
        // so a zero operand beside a string acts as "".
        match (&lhs, &rhs) {
            (Value::Str(a), Value::Str(b)) => return Ok(Value::Str(format!("{}{}", a, b))),
            (Value::Int(0), Value::Str(b)) => return Ok(Value::Str(b.clone())),
            (Value::Str(a), Value::Int(0)) => return Ok(Value::Str(a.clone())),
            _ => {}
        }
    }
    let (a, b) = match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => (a, b),
        (l, r) => {
            let found = if matches!(l, Value::Int(_)) {
                r.type_name()
            } else {
                l.type_name()
            };
            return Err(RuntimeError::TypeMismatch {
                expected: "integer",
                found,
            });
        }
    };
    let out = match op {
        Op::Add => a.wrapping_add(b),
        Op::Sub => a.wrapping_sub(b),
        Op::Mul => a.wrapping_mul(b),
        Op::Div => {
            if b == 0 {
                return Err(RuntimeError::DivisionByZero);
            }
            a.wrapping_div(b)
        }
        Op::Mod => {
            if b == 0 {
                return Err(RuntimeError::DivisionByZero);
            }
            a.wrapping_rem(b)
        }
        Op::BitAnd => a & b,
        Op::BitOr => a | b,
        Op::BitXor => a ^ b,
        Op::Shl => a.wrapping_shl(b as u32 & 63),
        Op::Shr => a.wrapping_shr(b as u32 & 63),
        other => {
            return Err(RuntimeError::Other(format!(
                "'{}' is not a binary operator",
                other.symbol()
            )))
        }
    };
    Ok(Value::Int(out))
}
