//! String builtins
//!
//! Positions are zero-based byte offsets; out-of-range arguments clamp
//! rather than error, matching the forgiving string surface the world
//! code expects. Slicing always goes through the byte view and is
//! rebuilt lossily, so an offset landing inside a multi-byte sequence
//! yields replacement characters instead of a panic (connection input
//! arrives as arbitrary UTF-8).

use super::{as_array, as_int, as_obj, as_str, need, need_at_least};
use crate::engine::Engine;
use crate::interp::{self, Ctx, StackCell};
use tern_core::array::{HeapArray, MaxSize};
use tern_core::{ObjRef, RuntimeError, Value};

/// Byte-range slice rebuilt as a string, tolerant of split characters.
fn byte_slice(s: &str, start: usize, end: usize) -> String {
    String::from_utf8_lossy(&s.as_bytes()[start..end]).into_owned()
}

pub fn bi_strlen(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "strlen")?;
    Ok(Value::Int(as_str(&args[0])?.len() as i64))
}

pub fn bi_midstr(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 3, "midstr")?;
    let s = as_str(&args[0])?;
    let pos = as_int(&args[1])?.max(0) as usize;
    let len = as_int(&args[2])?.max(0) as usize;
    let start = pos.min(s.len());
    let end = start.saturating_add(len).min(s.len());
    Ok(Value::Str(byte_slice(s, start, end)))
}

pub fn bi_leftstr(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "leftstr")?;
    let s = as_str(&args[0])?;
    let len = as_int(&args[1])?.max(0) as usize;
    Ok(Value::Str(byte_slice(s, 0, len.min(s.len()))))
}

pub fn bi_rightstr(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "rightstr")?;
    let s = as_str(&args[0])?;
    let len = as_int(&args[1])?.max(0) as usize;
    let start = s.len().saturating_sub(len);
    Ok(Value::Str(byte_slice(s, start, s.len())))
}

/// Replace `len` bytes at `pos` with a replacement string.
pub fn bi_subst(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 4, "subst")?;
    let s = as_str(&args[0])?;
    let pos = as_int(&args[1])?.max(0) as usize;
    let len = as_int(&args[2])?.max(0) as usize;
    let rep = as_str(&args[3])?;
    let bytes = s.as_bytes();
    let start = pos.min(bytes.len());
    let end = start.saturating_add(len).min(bytes.len());
    let mut out = Vec::with_capacity(bytes.len() + rep.len());
    out.extend_from_slice(&bytes[..start]);
    out.extend_from_slice(rep.as_bytes());
    out.extend_from_slice(&bytes[end..]);
    Ok(Value::Str(String::from_utf8_lossy(&out).into_owned()))
}

/// Find `search` at or after `start`; -1 when absent. Byte-wise, so a
/// start offset inside a multi-byte character is just a position that
/// will not match.
pub fn bi_instr(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 3, "instr")?;
    let s = as_str(&args[0])?;
    let start = as_int(&args[1])?.max(0) as usize;
    let search = as_str(&args[2])?;
    let hay = s.as_bytes();
    let needle = search.as_bytes();
    if start > hay.len() || needle.is_empty() || needle.len() > hay.len() - start {
        return Ok(Value::Int(-1));
    }
    Ok(Value::Int(
        hay[start..]
            .windows(needle.len())
            .position(|w| w == needle)
            .map(|p| (p + start) as i64)
            .unwrap_or(-1),
    ))
}

pub fn bi_upcase(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "upcase")?;
    Ok(Value::Str(as_str(&args[0])?.to_ascii_uppercase()))
}

pub fn bi_downcase(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "downcase")?;
    Ok(Value::Str(as_str(&args[0])?.to_ascii_lowercase()))
}

/// One-character string for an ASCII code. Only graphic and whitespace
/// characters in 0..=127 are representable; anything else answers
/// integer 0.
pub fn bi_chr(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "chr")?;
    let n = as_int(&args[0])?;
    if !(0..=127).contains(&n) {
        return Ok(Value::zero());
    }
    let c = n as u8 as char;
    if !(c.is_ascii_graphic() || c.is_ascii_whitespace() || c == '\x0b') {
        return Ok(Value::zero());
    }
    Ok(Value::Str(c.to_string()))
}

/// First byte of a string as an integer. The empty string travels as
/// integer 0, which passes straight through.
pub fn bi_asc(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "asc")?;
    if args[0] == Value::Int(0) {
        return Ok(Value::zero());
    }
    Ok(Value::Int(
        as_str(&args[0])?.bytes().next().map(|b| b as i64).unwrap_or(0),
    ))
}

pub fn bi_itoa(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "itoa")?;
    Ok(Value::Str(as_int(&args[0])?.to_string()))
}

/// Leading-prefix integer parse; garbage gives 0.
pub fn bi_atoi(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "atoi")?;
    let s = as_str(&args[0])?.trim_start();
    let mut end = 0;
    let bytes = s.as_bytes();
    if end < bytes.len() && (bytes[end] == b'-' || bytes[end] == b'+') {
        end += 1;
    }
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    Ok(Value::Int(s[..end].parse().unwrap_or(0)))
}

pub fn bi_otoa(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "otoa")?;
    let r = as_obj(&args[0])?;
    Ok(Value::Str(format!("#{}", r.0)))
}

/// Parse "#refno" (a "#refno:path" form is accepted and the path
/// ignored); dead handles give 0.
pub fn bi_atoo(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "atoo")?;
    let s = as_str(&args[0])?;
    let body = match s.strip_prefix('#') {
        Some(b) => b,
        None => return Ok(Value::zero()),
    };
    let num = body.split(':').next().unwrap_or("");
    let Ok(refno) = num.parse::<u32>() else {
        return Ok(Value::zero());
    };
    let r = ObjRef(refno);
    if engine.store.is_live(r) {
        Ok(Value::Obj(r))
    } else {
        Ok(Value::zero())
    }
}

pub fn bi_otoi(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "otoi")?;
    Ok(Value::Int(as_obj(&args[0])?.0 as i64))
}

pub fn bi_itoo(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "itoo")?;
    let n = as_int(&args[0])?;
    if n < 0 {
        return Ok(Value::zero());
    }
    let r = ObjRef(n as u32);
    if engine.store.is_live(r) {
        Ok(Value::Obj(r))
    } else {
        Ok(Value::zero())
    }
}

/// Is this a legal identifier-style name (letters, digits, underscore,
/// starting with a letter)?
pub fn bi_is_legal(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "is_legal")?;
    let s = as_str(&args[0])?;
    let legal = !s.is_empty()
        && s.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false)
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    Ok(Value::Int(legal as i64))
}

/// Join array elements with a separator; integers format in decimal,
/// other element kinds are skipped.
pub fn bi_implode(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "implode")?;
    let arr = as_array(&args[0])?;
    let sep = as_str(&args[1])?;
    let arr = arr.borrow();
    let parts: Vec<String> = arr
        .values()
        .iter()
        .filter_map(|v| match v {
            Value::Str(s) => Some(s.clone()),
            Value::Int(n) => Some(n.to_string()),
            _ => None,
        })
        .collect();
    Ok(Value::Str(parts.join(sep)))
}

pub fn bi_explode(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 2, "explode")?;
    let s = as_str(&args[0])?;
    let sep = as_str(&args[1])?;
    let parts: Vec<Value> = if sep.is_empty() {
        vec![Value::Str(s.to_string())]
    } else {
        s.split(sep).map(|p| Value::Str(p.to_string())).collect()
    };
    Ok(Value::Array(HeapArray::with_values(
        parts,
        MaxSize::Unlimited,
    )))
}

pub fn bi_replace_string(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 3, "replace_string")?;
    let s = as_str(&args[0])?;
    let from = as_str(&args[1])?;
    let to = as_str(&args[2])?;
    if from.is_empty() {
        return Ok(Value::Str(s.to_string()));
    }
    Ok(Value::Str(s.replace(from, to)))
}

/// printf-lite: %d, %s, %x, %c and %%. Anything else passes through.
pub fn bi_sprintf(
    _engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need_at_least(&args, 1, "sprintf")?;
    let format = as_str(&args[0])?;
    let mut out = String::with_capacity(format.len());
    let mut next_arg = 1;
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('d') => {
                let v = args.get(next_arg).cloned().unwrap_or_else(Value::zero);
                next_arg += 1;
                match v {
                    Value::Int(n) => out.push_str(&n.to_string()),
                    other => out.push_str(other.type_name()),
                }
            }
            Some('x') => {
                let v = args.get(next_arg).cloned().unwrap_or_else(Value::zero);
                next_arg += 1;
                match v {
                    Value::Int(n) => out.push_str(&format!("{:x}", n)),
                    other => out.push_str(other.type_name()),
                }
            }
            Some('s') => {
                let v = args.get(next_arg).cloned().unwrap_or_else(Value::zero);
                next_arg += 1;
                match v {
                    Value::Str(s) => out.push_str(&s),
                    Value::Int(n) => out.push_str(&n.to_string()),
                    Value::Obj(r) => out.push_str(&format!("#{}", r.0)),
                    other => out.push_str(other.type_name()),
                }
            }
            Some('c') => {
                let v = args.get(next_arg).cloned().unwrap_or_else(Value::zero);
                next_arg += 1;
                if let Value::Int(n) = v {
                    if (1..=255).contains(&n) {
                        out.push(n as u8 as char);
                    }
                }
            }
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    Ok(Value::Str(out))
}

// sscanf needs raw stack access: its trailing arguments are l-values it
// assigns through. Supports %d, %x, %s, %*d/%*x/%*s (match, no assign)
// and %% per the original format engine.
pub fn bi_sscanf(
    engine: &mut Engine,
    ctx: &mut Ctx,
    stack: &mut Vec<StackCell>,
) -> Result<(), RuntimeError> {
    let n = match interp::pop_cell(stack)? {
        StackCell::NumArgs(n) => n,
        _ => {
            return Err(RuntimeError::TypeMismatch {
                expected: "argument marker",
                found: "value",
            })
        }
    };
    if n < 2 {
        return Err(RuntimeError::BadArgCount {
            name: "sscanf",
            found: n,
        });
    }
    let mut targets = Vec::new();
    for _ in 0..n - 2 {
        targets.push(interp::pop_lvalue(stack)?);
    }
    targets.reverse();
    let format = match interp::pop_value(engine, ctx, stack)? {
        Value::Str(s) => s,
        other => {
            return Err(RuntimeError::TypeMismatch {
                expected: "string",
                found: other.type_name(),
            })
        }
    };
    let input = match interp::pop_value(engine, ctx, stack)? {
        Value::Str(s) => s,
        other => {
            return Err(RuntimeError::TypeMismatch {
                expected: "string",
                found: other.type_name(),
            })
        }
    };

    let mut assigned = 0i64;
    let mut target_iter = targets.into_iter();
    let inb = input.as_bytes();
    let mut ip = 0usize;
    let fmt: Vec<char> = format.chars().collect();
    let mut fp = 0usize;
    'scan: while fp < fmt.len() {
        let c = fmt[fp];
        if c != '%' {
            // Match the literal's full encoding so ip always stays on a
            // character boundary.
            let mut enc = [0u8; 4];
            let lit = c.encode_utf8(&mut enc).as_bytes();
            if inb[ip..].starts_with(lit) {
                ip += lit.len();
                fp += 1;
                continue;
            }
            break 'scan;
        }
        fp += 1;
        let mut skip = false;
        if fmt.get(fp) == Some(&'*') {
            skip = true;
            fp += 1;
        }
        match fmt.get(fp) {
            Some('%') => {
                if ip < inb.len() && inb[ip] == b'%' {
                    ip += 1;
                    fp += 1;
                } else {
                    break 'scan;
                }
            }
            Some('d') => {
                let start = ip;
                if ip < inb.len() && (inb[ip] == b'-' || inb[ip] == b'+') {
                    ip += 1;
                }
                while ip < inb.len() && inb[ip].is_ascii_digit() {
                    ip += 1;
                }
                if ip == start {
                    break 'scan;
                }
                let v: i64 = input[start..ip].parse().unwrap_or(0);
                if !skip {
                    let Some(lv) = target_iter.next() else { break 'scan };
                    interp::store_lvalue(engine, ctx, &lv, Value::Int(v))?;
                    assigned += 1;
                }
                fp += 1;
            }
            Some('x') => {
                let start = ip;
                while ip < inb.len() && inb[ip].is_ascii_hexdigit() {
                    ip += 1;
                }
                if ip == start {
                    break 'scan;
                }
                let v = i64::from_str_radix(&input[start..ip], 16).unwrap_or(0);
                if !skip {
                    let Some(lv) = target_iter.next() else { break 'scan };
                    interp::store_lvalue(engine, ctx, &lv, Value::Int(v))?;
                    assigned += 1;
                }
                fp += 1;
            }
            Some('s') => {
                // A string match runs to the next literal segment (or
                // the end of the input).
                let next_literal = fmt.get(fp + 1).copied().filter(|c| *c != '%');
                let end = match next_literal {
                    Some(delim) => input[ip..]
                        .find(delim)
                        .map(|p| ip + p)
                        .unwrap_or(inb.len()),
                    None => inb.len(),
                };
                let v = input[ip..end].to_string();
                ip = end;
                if !skip {
                    let Some(lv) = target_iter.next() else { break 'scan };
                    interp::store_lvalue(engine, ctx, &lv, Value::Str(v))?;
                    assigned += 1;
                }
                fp += 1;
            }
            _ => break 'scan,
        }
    }
    stack.push(StackCell::Value(Value::Int(assigned)));
    Ok(())
}
