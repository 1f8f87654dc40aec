//! Value persistence builtins
//!
//! `save_value` renders a value as source-shaped text that
//! `restore_value` parses back: integers in decimal, strings quoted
//! with escapes, arrays as `({ ... })`, mappings as `([ k : v, ... ])`,
//! and object handles as `#refno:path`. The round-trip is structural
//! equality for anything built from integers, strings, arrays, and
//! mappings; handles come back live or as 0 when the object is gone.
//!
//! `save_object`/`restore_object` apply the same codec to an object's
//! named globals, one `name value` line per variable, through the
//! filesystem mirror (with the usual permission gate via write_file's
//! own rules: the saving object owns its file).

use super::{as_str, need};
use crate::engine::Engine;
use crate::interp::Ctx;
use tern_core::array::{HeapArray, MaxSize};
use tern_core::mapping::HeapMapping;
use tern_core::{MapKey, ObjRef, RuntimeError, Value};

pub fn encode_value(engine: &Engine, v: &Value, out: &mut String) {
    match v {
        Value::Int(n) => out.push_str(&n.to_string()),
        Value::Str(s) => {
            out.push('"');
            for c in s.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    other => out.push(other),
                }
            }
            out.push('"');
        }
        Value::Obj(r) => {
            out.push('#');
            out.push_str(&r.0.to_string());
            out.push(':');
            out.push_str(&engine.pathname_of(*r));
        }
        Value::Array(arr) => {
            out.push_str("({");
            for elem in arr.borrow().values() {
                encode_value(engine, elem, out);
                out.push(',');
            }
            out.push_str("})");
        }
        Value::Mapping(map) => {
            out.push_str("([");
            map.borrow().for_each(|k, v| {
                encode_value(engine, &k.to_value(), out);
                out.push(':');
                encode_value(engine, v, out);
                out.push(',');
            });
            out.push_str("])");
        }
    }
}

struct Decoder<'a> {
    chars: Vec<char>,
    pos: usize,
    engine: &'a Engine,
}

impl<'a> Decoder<'a> {
    fn new(engine: &'a Engine, text: &str) -> Decoder<'a> {
        Decoder {
            chars: text.chars().collect(),
            pos: 0,
            engine,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, want: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(want) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn starts(&mut self, a: char, b: char) -> bool {
        self.skip_ws();
        if self.chars.get(self.pos) == Some(&a) && self.chars.get(self.pos + 1) == Some(&b) {
            self.pos += 2;
            true
        } else {
            false
        }
    }

    fn value(&mut self) -> Option<Value> {
        self.skip_ws();
        match self.peek()? {
            '"' => self.string(),
            '#' => self.object(),
            '(' => {
                if self.starts('(', '{') {
                    self.array()
                } else if self.starts('(', '[') {
                    self.mapping()
                } else {
                    None
                }
            }
            c if c == '-' || c.is_ascii_digit() => self.integer(),
            _ => None,
        }
    }

    fn integer(&mut self) -> Option<Value> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse().ok().map(Value::Int)
    }

    fn string(&mut self) -> Option<Value> {
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            match self.bump()? {
                '"' => return Some(Value::Str(out)),
                '\\' => match self.bump()? {
                    'n' => out.push('\n'),
                    'r' => out.push('\r'),
                    other => out.push(other),
                },
                other => out.push(other),
            }
        }
    }

    fn object(&mut self) -> Option<Value> {
        self.bump(); // '#'
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        let refno: u32 = self.chars[start..self.pos]
            .iter()
            .collect::<String>()
            .parse()
            .ok()?;
        // The path component documents which program the handle meant;
        // it is consumed and the live handle wins.
        if self.peek() == Some(':') {
            self.pos += 1;
            while matches!(self.peek(), Some(c) if c != ',' && c != ':' && c != '}' && c != ']' && !c.is_whitespace())
            {
                self.pos += 1;
            }
        }
        let r = ObjRef(refno);
        if self.engine.store.is_live(r) {
            Some(Value::Obj(r))
        } else {
            Some(Value::zero())
        }
    }

    fn array(&mut self) -> Option<Value> {
        let mut elems = Vec::new();
        loop {
            self.skip_ws();
            if self.starts('}', ')') {
                return Some(Value::Array(HeapArray::with_values(
                    elems,
                    MaxSize::Unlimited,
                )));
            }
            elems.push(self.value()?);
            if !self.eat(',') {
                self.skip_ws();
                if self.starts('}', ')') {
                    return Some(Value::Array(HeapArray::with_values(
                        elems,
                        MaxSize::Unlimited,
                    )));
                }
                return None;
            }
        }
    }

    fn mapping(&mut self) -> Option<Value> {
        let handle = HeapMapping::new();
        loop {
            self.skip_ws();
            if self.starts(']', ')') {
                return Some(Value::Mapping(handle));
            }
            let key = self.value()?;
            if !self.eat(':') {
                return None;
            }
            let value = self.value()?;
            let key = MapKey::from_value(&key)?;
            handle.borrow_mut().set(key, value);
            if !self.eat(',') {
                self.skip_ws();
                if self.starts(']', ')') {
                    return Some(Value::Mapping(handle));
                }
                return None;
            }
        }
    }
}

pub fn decode_value(engine: &Engine, text: &str) -> Option<Value> {
    let mut d = Decoder::new(engine, text);
    let v = d.value()?;
    d.skip_ws();
    Some(v)
}

pub fn bi_save_value(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "save_value")?;
    let mut out = String::new();
    encode_value(engine, &args[0], &mut out);
    Ok(Value::Str(out))
}

/// Parse failure is a result (0), not an error.
pub fn bi_restore_value(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "restore_value")?;
    let text = as_str(&args[0])?;
    Ok(decode_value(engine, text).unwrap_or_else(Value::zero))
}

/// Parse a mapping encoding specifically; anything else gives 0.
pub fn bi_restore_map(
    engine: &mut Engine,
    _ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "restore_map")?;
    let text = as_str(&args[0])?;
    match decode_value(engine, text) {
        Some(v @ Value::Mapping(_)) => Ok(v),
        _ => Ok(Value::zero()),
    }
}

/// The visible globals of an object, as (name, absolute slot) pairs.
fn named_slots(engine: &Engine, obj: ObjRef) -> Vec<(String, u32)> {
    let Some(proto) = engine.proto_of(obj) else {
        return Vec::new();
    };
    let program = &proto.program;
    let mut out = Vec::new();
    for anc in &program.ancestors {
        for var in &anc.program.globals {
            out.push((var.name.clone(), anc.base + (var.base - anc.program.own_base)));
        }
    }
    for var in &program.globals {
        out.push((var.name.clone(), var.base));
    }
    out
}

/// Write this object's named globals to a file, one `name value` line
/// each.
pub fn bi_save_object(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "save_object")?;
    let path = as_str(&args[0])?.to_string();
    let slots = named_slots(engine, ctx.obj);
    let mut text = String::new();
    for (name, slot) in slots {
        let value = engine.read_global(ctx.obj, slot)?;
        text.push_str(&name);
        text.push(' ');
        encode_value(engine, &value, &mut text);
        text.push('\n');
    }
    // Truncate any previous save; a missing file is fine, append_text
    // creates it.
    let _ = engine.fs.erase(&path);
    match engine.fs.append_text(&path, &text, ctx.obj.0 as i64) {
        Ok(()) => Ok(Value::zero()),
        Err(_) => Ok(Value::Int(1)),
    }
}

/// Read a save file and assign every line whose name matches one of
/// this object's globals. Unknown names are skipped.
pub fn bi_restore_object(
    engine: &mut Engine,
    ctx: &mut Ctx,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    need(&args, 1, "restore_object")?;
    let path = as_str(&args[0])?.to_string();
    let text = match engine.fs.read_text(&path) {
        Ok(t) => t,
        Err(_) => return Ok(Value::Int(1)),
    };
    let slots = named_slots(engine, ctx.obj);
    let mut restored = 0i64;
    for line in text.lines() {
        let Some((name, data)) = line.split_once(' ') else {
            continue;
        };
        let Some((_, slot)) = slots.iter().find(|(n, _)| n == name) else {
            continue;
        };
        if let Some(value) = decode_value(engine, data) {
            engine.write_global(ctx.obj, *slot, value)?;
            restored += 1;
        }
    }
    Ok(Value::Int(restored))
}
