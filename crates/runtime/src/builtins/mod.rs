//! The built-in function table
//!
//! Builtins occupy the opcode range above the operators; the
//! interpreter dispatches here with `opcode - NUM_OPERS` effectively
//! indexing one fixed table. Every builtin pops its NUM_ARGS marker and
//! arguments, does its work, and pushes exactly one result value.
//!
//! Permission denials are results, not errors: file operations return a
//! distinguished nonzero integer and the caller decides how to present
//! it. Only malformed calls (bad types, bad arity) unwind as runtime
//! errors.

mod arrays;
mod device;
mod files;
mod mappings;
mod misc;
mod objects;
mod persist;
mod strings;
mod verbs;

use crate::engine::Engine;
use crate::interp::{pop_call_args, Ctx, StackCell};
use tern_core::instr::{sys, syscall_name};
use tern_core::{RuntimeError, Value};

/// Execute one builtin opcode against the operand stack.
pub fn dispatch(
    engine: &mut Engine,
    ctx: &mut Ctx,
    stack: &mut Vec<StackCell>,
    opcode: u16,
) -> Result<(), RuntimeError> {
    // The literal constructors keep raw stack access; everything else
    // gets its arguments popped and resolved here.
    match opcode {
        sys::ARRAY_LITERAL => return arrays::array_literal(engine, ctx, stack),
        sys::MAPPING_LITERAL => return mappings::mapping_literal(engine, ctx, stack),
        83 => return strings::bi_sscanf(engine, ctx, stack), // sscanf writes through lvalues
        _ => {}
    }
    let args = pop_call_args(engine, ctx, stack)?;
    let result = match opcode {
        // Verb and input routing.
        38 => verbs::bi_add_verb(engine, ctx, args, false),
        39 => verbs::bi_add_verb(engine, ctx, args, true),
        103 => verbs::bi_remove_verb(engine, ctx, args),
        127 => verbs::bi_next_verb(engine, ctx, args),
        69 => verbs::bi_command(engine, ctx, args),
        130 => verbs::bi_redirect_input(engine, ctx, args),
        134 => verbs::bi_input_to(engine, ctx, args),
        131 => verbs::bi_get_input_func(engine, ctx, args),

        // Object lifecycle and graph.
        40 => objects::bi_call_other(engine, ctx, args),
        44 => objects::bi_clone_object(engine, ctx, args),
        45 => objects::bi_destruct(engine, ctx, args),
        46 => objects::bi_contents(engine, ctx, args),
        47 => objects::bi_next_object(engine, ctx, args),
        48 => objects::bi_location(engine, ctx, args),
        49 => objects::bi_next_child(engine, ctx, args),
        50 => objects::bi_parent(engine, ctx, args),
        51 => objects::bi_next_proto(engine, ctx, args),
        52 => objects::bi_move_object(engine, ctx, args),
        53 => objects::bi_this_object(engine, ctx, args),
        54 => objects::bi_this_player(engine, ctx, args),
        43 => objects::bi_caller_object(engine, ctx, args),
        108 => objects::bi_prototype(engine, ctx, args),
        109 => objects::bi_iterate(engine, ctx, args),
        115 => objects::bi_attach(engine, ctx, args),
        116 => objects::bi_this_component(engine, ctx, args),
        117 => objects::bi_detach(engine, ctx, args),
        162 => device::bi_users(engine, ctx, args),
        163 => objects::bi_objects(engine, ctx, args),
        164 => objects::bi_children(engine, ctx, args),
        165 => objects::bi_all_inventory(engine, ctx, args),

        // Flags.
        55 => device::bi_set_interactive(engine, ctx, args),
        56 => device::bi_interactive(engine, ctx, args),
        57 => misc::bi_set_priv(engine, ctx, args),
        58 => misc::bi_priv(engine, ctx, args),
        59 => misc::bi_in_editor(engine, ctx, args),
        60 => device::bi_connected(engine, ctx, args),
        125 => misc::bi_set_localverbs(engine, ctx, args),
        126 => misc::bi_localverbs(engine, ctx, args),
        132 => misc::bi_get_master(engine, ctx, args),
        133 => misc::bi_is_master(engine, ctx, args),

        // Devices.
        61 => device::bi_get_devconn(engine, ctx, args),
        62 => device::bi_send_device(engine, ctx, args),
        63 => device::bi_reconnect_device(engine, ctx, args),
        64 => device::bi_disconnect_device(engine, ctx, args),
        110 => device::bi_next_who(engine, ctx, args),
        111 => device::bi_get_devidle(engine, ctx, args),
        112 => device::bi_get_conntime(engine, ctx, args),
        113 => device::bi_connect_device(engine, ctx, args),
        114 => device::bi_flush_device(engine, ctx, args),
        128 => device::bi_get_devport(engine, ctx, args),
        129 => device::bi_get_devnet(engine, ctx, args),

        // Scheduling and misc.
        41 => misc::bi_alarm(engine, ctx, args),
        42 => misc::bi_remove_alarm(engine, ctx, args),
        65 => misc::bi_random(engine, ctx, args),
        66 => misc::bi_time(engine, ctx, args),
        67 => misc::bi_mktime(engine, ctx, args),
        68 => misc::bi_typeof(engine, ctx, args),
        82 => misc::bi_syslog(engine, ctx, args),
        107 => misc::bi_sysctl(engine, ctx, args),
        153 => misc::bi_syswrite(engine, ctx, args),
        70 => misc::bi_compile_object(engine, ctx, args),
        154 => misc::bi_compile_string(engine, ctx, args),

        // Strings.
        84 => strings::bi_sprintf(engine, ctx, args),
        85 => strings::bi_midstr(engine, ctx, args),
        86 => strings::bi_strlen(engine, ctx, args),
        87 => strings::bi_leftstr(engine, ctx, args),
        88 => strings::bi_rightstr(engine, ctx, args),
        89 => strings::bi_subst(engine, ctx, args),
        90 => strings::bi_instr(engine, ctx, args),
        91 => strings::bi_otoa(engine, ctx, args),
        92 => strings::bi_itoa(engine, ctx, args),
        93 => strings::bi_atoi(engine, ctx, args),
        94 => strings::bi_atoo(engine, ctx, args),
        95 => strings::bi_upcase(engine, ctx, args),
        96 => strings::bi_downcase(engine, ctx, args),
        97 => strings::bi_is_legal(engine, ctx, args),
        98 => strings::bi_otoi(engine, ctx, args),
        99 => strings::bi_itoo(engine, ctx, args),
        105 => strings::bi_chr(engine, ctx, args),
        106 => strings::bi_asc(engine, ctx, args),
        136 => strings::bi_implode(engine, ctx, args),
        137 => strings::bi_explode(engine, ctx, args),
        150 => strings::bi_replace_string(engine, ctx, args),

        // Arrays.
        135 => arrays::bi_sizeof(engine, ctx, args),
        138 => arrays::bi_member_array(engine, ctx, args),
        139 => arrays::bi_sort_array(engine, ctx, args),
        140 => arrays::bi_reverse(engine, ctx, args),
        141 => arrays::bi_unique_array(engine, ctx, args),

        // Mappings.
        143 => mappings::bi_keys(engine, ctx, args),
        144 => mappings::bi_values(engine, ctx, args),
        145 => mappings::bi_map_delete(engine, ctx, args),
        146 => mappings::bi_member(engine, ctx, args),

        // Interned table.
        118 => misc::bi_table_get(engine, ctx, args),
        119 => misc::bi_table_set(engine, ctx, args),
        120 => misc::bi_table_delete(engine, ctx, args),

        // Persistence.
        148 => persist::bi_save_value(engine, ctx, args),
        149 => persist::bi_restore_value(engine, ctx, args),
        151 => persist::bi_save_object(engine, ctx, args),
        152 => persist::bi_restore_object(engine, ctx, args),
        166 => persist::bi_restore_map(engine, ctx, args),

        // Filesystem.
        71 => files::bi_edit(engine, ctx, args),
        72 => files::bi_cat(engine, ctx, args),
        75 => files::bi_cp(engine, ctx, args),
        77 => files::bi_mkdir(engine, ctx, args),
        78 => files::bi_rmdir(engine, ctx, args),
        79 => files::bi_hide(engine, ctx, args),
        80 => files::bi_unhide(engine, ctx, args),
        81 => files::bi_chown(engine, ctx, args),
        100 => files::bi_chmod(engine, ctx, args),
        104 => files::bi_ferase(engine, ctx, args),
        121 => files::bi_fstat(engine, ctx, args),
        122 => files::bi_fowner(engine, ctx, args),
        156 => files::bi_read_file(engine, ctx, args),
        157 => files::bi_write_file(engine, ctx, args),
        158 => files::bi_remove(engine, ctx, args),
        159 => files::bi_rename(engine, ctx, args),
        160 => files::bi_get_dir(engine, ctx, args),
        161 => files::bi_file_size(engine, ctx, args),

        other => Err(RuntimeError::Other(format!(
            "builtin {} ({}) is not implemented",
            other,
            syscall_name(other).unwrap_or("?")
        ))),
    }?;
    stack.push(StackCell::Value(result));
    Ok(())
}

// ---- shared argument helpers ----------------------------------------

pub(crate) fn need(
    args: &[Value],
    n: usize,
    name: &'static str,
) -> Result<(), RuntimeError> {
    if args.len() != n {
        return Err(RuntimeError::BadArgCount {
            name,
            found: args.len() as u32,
        });
    }
    Ok(())
}

pub(crate) fn need_at_least(
    args: &[Value],
    n: usize,
    name: &'static str,
) -> Result<(), RuntimeError> {
    if args.len() < n {
        return Err(RuntimeError::BadArgCount {
            name,
            found: args.len() as u32,
        });
    }
    Ok(())
}

pub(crate) fn as_int(v: &Value) -> Result<i64, RuntimeError> {
    match v {
        Value::Int(n) => Ok(*n),
        other => Err(RuntimeError::TypeMismatch {
            expected: "integer",
            found: other.type_name(),
        }),
    }
}

pub(crate) fn as_str(v: &Value) -> Result<&str, RuntimeError> {
    match v {
        Value::Str(s) => Ok(s),
        other => Err(RuntimeError::TypeMismatch {
            expected: "string",
            found: other.type_name(),
        }),
    }
}

/// A string argument where integer 0 stands for "absent" (the engine's
/// empty-string convention).
pub(crate) fn as_opt_str(v: &Value) -> Result<Option<&str>, RuntimeError> {
    match v {
        Value::Str(s) => Ok(Some(s)),
        Value::Int(0) => Ok(None),
        other => Err(RuntimeError::TypeMismatch {
            expected: "string",
            found: other.type_name(),
        }),
    }
}

pub(crate) fn as_obj(v: &Value) -> Result<tern_core::ObjRef, RuntimeError> {
    match v {
        Value::Obj(r) => Ok(*r),
        other => Err(RuntimeError::TypeMismatch {
            expected: "object",
            found: other.type_name(),
        }),
    }
}

pub(crate) fn as_array(v: &Value) -> Result<tern_core::ArrayHandle, RuntimeError> {
    match v {
        Value::Array(a) => Ok(a.clone()),
        other => Err(RuntimeError::TypeMismatch {
            expected: "array",
            found: other.type_name(),
        }),
    }
}

pub(crate) fn as_mapping(v: &Value) -> Result<tern_core::MappingHandle, RuntimeError> {
    match v {
        Value::Mapping(m) => Ok(m.clone()),
        other => Err(RuntimeError::TypeMismatch {
            expected: "mapping",
            found: other.type_name(),
        }),
    }
}

/// Object-or-zero result helper.
pub(crate) fn obj_result(r: Option<tern_core::ObjRef>) -> Value {
    match r {
        Some(r) => Value::Obj(r),
        None => Value::zero(),
    }
}
