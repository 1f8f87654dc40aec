//! Bytecode definitions
//!
//! The compiler emits a flat vector of `Instr` cells per function; the
//! interpreter walks it left to right. Operator opcodes occupy 0..38,
//! builtin opcodes sit above them, and the two literal constructors
//! (array, mapping) are pseudo-builtins emitted only by the compiler.
//!
//! Opcode numbering is part of the checkpoint format (function bodies are
//! persisted as typed instruction streams), so the values here are
//! stable: do not renumber.

use crate::value::ObjRef;

/// Number of operator opcodes. Builtin opcodes start here.
pub const NUM_OPERS: u16 = 38;

/// Operator opcodes, in precedence-table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Comma = 0,
    Assign = 1,
    AddAssign = 2,
    SubAssign = 3,
    MulAssign = 4,
    DivAssign = 5,
    ModAssign = 6,
    AndAssign = 7,
    XorAssign = 8,
    OrAssign = 9,
    ShlAssign = 10,
    ShrAssign = 11,
    Cond = 12,
    LogicalOr = 13,
    LogicalAnd = 14,
    BitOr = 15,
    BitXor = 16,
    BitAnd = 17,
    Eq = 18,
    NotEq = 19,
    Less = 20,
    LessEq = 21,
    Greater = 22,
    GreaterEq = 23,
    Shl = 24,
    Shr = 25,
    Add = 26,
    Sub = 27,
    Mul = 28,
    Div = 29,
    Mod = 30,
    Not = 31,
    BitNot = 32,
    PostIncr = 33,
    PreIncr = 34,
    PostDecr = 35,
    PreDecr = 36,
    UnaryMinus = 37,
}

impl Op {
    pub fn from_u8(code: u8) -> Option<Op> {
        if code < NUM_OPERS as u8 {
            // Safety: Op is repr(u8) and covers 0..NUM_OPERS densely.
            Some(unsafe { std::mem::transmute::<u8, Op>(code) })
        } else {
            None
        }
    }

    pub fn is_assignment(self) -> bool {
        matches!(
            self,
            Op::Assign
                | Op::AddAssign
                | Op::SubAssign
                | Op::MulAssign
                | Op::DivAssign
                | Op::ModAssign
                | Op::AndAssign
                | Op::XorAssign
                | Op::OrAssign
                | Op::ShlAssign
                | Op::ShrAssign
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Op::Comma => ",",
            Op::Assign => "=",
            Op::AddAssign => "+=",
            Op::SubAssign => "-=",
            Op::MulAssign => "*=",
            Op::DivAssign => "/=",
            Op::ModAssign => "%=",
            Op::AndAssign => "&=",
            Op::XorAssign => "^=",
            Op::OrAssign => "|=",
            Op::ShlAssign => "<<=",
            Op::ShrAssign => ">>=",
            Op::Cond => "?",
            Op::LogicalOr => "||",
            Op::LogicalAnd => "&&",
            Op::BitOr => "|",
            Op::BitXor => "^",
            Op::BitAnd => "&",
            Op::Eq => "==",
            Op::NotEq => "!=",
            Op::Less => "<",
            Op::LessEq => "<=",
            Op::Greater => ">",
            Op::GreaterEq => ">=",
            Op::Shl => "<<",
            Op::Shr => ">>",
            Op::Add => "+",
            Op::Sub => "-",
            Op::Mul => "*",
            Op::Div => "/",
            Op::Mod => "%",
            Op::Not => "!",
            Op::BitNot => "~",
            Op::PostIncr | Op::PreIncr => "++",
            Op::PostDecr | Op::PreDecr => "--",
            Op::UnaryMinus => "-",
        }
    }
}

/// Builtin opcode constants. The table below gives each slot its name;
/// these constants exist for the handful the compiler and interpreter
/// address directly.
pub mod sys {
    pub const CALL_OTHER: u16 = 40;
    pub const CLONE_OBJECT: u16 = 44;
    pub const ARRAY_LITERAL: u16 = 142;
    pub const MAPPING_LITERAL: u16 = 147;
}

/// Builtin name table, indexed by `opcode - NUM_OPERS`. `None` slots are
/// pseudo-opcodes (literal constructors) or retired entries whose
/// numbering must be preserved for old checkpoints.
pub const SYSCALL_NAMES: [Option<&str>; 129] = [
    Some("add_verb"),          // 38
    Some("add_xverb"),         // 39
    Some("call_other"),        // 40
    Some("alarm"),             // 41
    Some("remove_alarm"),      // 42
    Some("caller_object"),     // 43
    Some("clone_object"),      // 44
    Some("destruct"),          // 45
    Some("contents"),          // 46
    Some("next_object"),       // 47
    Some("location"),          // 48
    Some("next_child"),        // 49
    Some("parent"),            // 50
    Some("next_proto"),        // 51
    Some("move_object"),       // 52
    Some("this_object"),       // 53
    Some("this_player"),       // 54
    Some("set_interactive"),   // 55
    Some("interactive"),       // 56
    Some("set_priv"),          // 57
    Some("priv"),              // 58
    Some("in_editor"),         // 59
    Some("connected"),         // 60
    Some("get_devconn"),       // 61
    Some("send_device"),       // 62
    Some("reconnect_device"),  // 63
    Some("disconnect_device"), // 64
    Some("random"),            // 65
    Some("time"),              // 66
    Some("mktime"),            // 67
    Some("typeof"),            // 68
    Some("command"),           // 69
    Some("compile_object"),    // 70
    Some("edit"),              // 71
    Some("cat"),               // 72
    None,                      // 73 (retired: ls; use get_dir)
    None,                      // 74 (retired: rm; use remove)
    Some("cp"),                // 75
    None,                      // 76 (retired: mv; use rename)
    Some("mkdir"),             // 77
    Some("rmdir"),             // 78
    Some("hide"),              // 79
    Some("unhide"),            // 80
    Some("chown"),             // 81
    Some("syslog"),            // 82
    Some("sscanf"),            // 83
    Some("sprintf"),           // 84
    Some("midstr"),            // 85
    Some("strlen"),            // 86
    Some("leftstr"),           // 87
    Some("rightstr"),          // 88
    Some("subst"),             // 89
    Some("instr"),             // 90
    Some("otoa"),              // 91
    Some("itoa"),              // 92
    Some("atoi"),              // 93
    Some("atoo"),              // 94
    Some("upcase"),            // 95
    Some("downcase"),          // 96
    Some("is_legal"),          // 97
    Some("otoi"),              // 98
    Some("itoo"),              // 99
    Some("chmod"),             // 100
    None,                      // 101 (retired: fread; use read_file)
    None,                      // 102 (retired: fwrite; use write_file)
    Some("remove_verb"),       // 103
    Some("ferase"),            // 104
    Some("chr"),               // 105
    Some("asc"),               // 106
    Some("sysctl"),            // 107
    Some("prototype"),         // 108
    Some("iterate"),           // 109
    Some("next_who"),          // 110
    Some("get_devidle"),       // 111
    Some("get_conntime"),      // 112
    Some("connect_device"),    // 113
    Some("flush_device"),      // 114
    Some("attach"),            // 115
    Some("this_component"),    // 116
    Some("detach"),            // 117
    Some("table_get"),         // 118
    Some("table_set"),         // 119
    Some("table_delete"),      // 120
    Some("fstat"),             // 121
    Some("fowner"),            // 122
    None,                      // 123 (retired: get_hostname)
    None,                      // 124 (retired: get_address)
    Some("set_localverbs"),    // 125
    Some("localverbs"),        // 126
    Some("next_verb"),         // 127
    Some("get_devport"),       // 128
    Some("get_devnet"),        // 129
    Some("redirect_input"),    // 130
    Some("get_input_func"),    // 131
    Some("get_master"),        // 132
    Some("is_master"),         // 133
    Some("input_to"),          // 134
    Some("sizeof"),            // 135
    Some("implode"),           // 136
    Some("explode"),           // 137
    Some("member_array"),      // 138
    Some("sort_array"),        // 139
    Some("reverse"),           // 140
    Some("unique_array"),      // 141
    None,                      // 142 ARRAY_LITERAL (compiler-emitted)
    Some("keys"),              // 143
    Some("values"),            // 144
    Some("map_delete"),        // 145
    Some("member"),            // 146
    None,                      // 147 MAPPING_LITERAL (compiler-emitted)
    Some("save_value"),        // 148
    Some("restore_value"),     // 149
    Some("replace_string"),    // 150
    Some("save_object"),       // 151
    Some("restore_object"),    // 152
    Some("syswrite"),          // 153
    Some("compile_string"),    // 154
    None,                      // 155 (retired: crypt)
    Some("read_file"),         // 156
    Some("write_file"),        // 157
    Some("remove"),            // 158
    Some("rename"),            // 159
    Some("get_dir"),           // 160
    Some("file_size"),         // 161
    Some("users"),             // 162
    Some("objects"),           // 163
    Some("children"),          // 164
    Some("all_inventory"),     // 165
    Some("restore_map"),       // 166
];

pub const NUM_SCALLS: u16 = SYSCALL_NAMES.len() as u16;

/// Deprecated aliases, resolved at name-table lookup (no recursion; the
/// canonical names are the documented surface).
const ALIASES: [(&str, &str); 6] = [
    ("fread", "read_file"),
    ("fwrite", "write_file"),
    ("rm", "remove"),
    ("mv", "rename"),
    ("ls", "get_dir"),
    ("new", "clone_object"),
];

/// Look a builtin up by name, returning its absolute opcode.
pub fn find_syscall(name: &str) -> Option<u16> {
    let canonical = ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, c)| *c)
        .unwrap_or(name);
    SYSCALL_NAMES
        .iter()
        .position(|n| *n == Some(canonical))
        .map(|i| i as u16 + NUM_OPERS)
}

/// Name of a builtin opcode, for tracebacks and persistence.
pub fn syscall_name(opcode: u16) -> Option<&'static str> {
    SYSCALL_NAMES
        .get(opcode.checked_sub(NUM_OPERS)? as usize)
        .copied()
        .flatten()
}

/// One cell of a compiled function body.
///
/// `FuncCall` holds the index of a function in the owning program's
/// function table; it is persisted by name (as `FuncName`) and re-bound
/// lazily after a restore.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    /// Push an integer constant.
    Int(i64),
    /// Push a string constant.
    Str(String),
    /// Push an object handle constant.
    Obj(ObjRef),
    /// Execute an operator or builtin opcode.
    Code(u16),
    /// Push a global l-value: (raw slot, declared size; 0 marks a mapping).
    GlobalLValue { slot: u32, size: u32 },
    /// Push a local l-value.
    LocalLValue { slot: u32, size: u32 },
    /// Direct call to a function of the current program, by index.
    FuncCall(u32),
    /// Late-bound call, resolved by name in the current object at run time.
    FuncName(String),
    /// Argument-count marker preceding a call or builtin.
    NumArgs(u32),
    /// Element-count marker used by multi-dimensional subscripts.
    ArraySize(u32),
    /// Unconditional jump to an absolute instruction offset.
    Jump(u32),
    /// Pop a value; jump when it is false (integer 0).
    Branch(u32),
    /// Statement boundary: clear the operand stack, record the line.
    NewLine(u32),
    /// Pop the return value and leave the function.
    Return,
    /// Resolve a subscript against a local base: pops (base, index, size).
    LocalRef,
    /// Resolve a subscript against a global base.
    GlobalRef,
    /// Call `func_idx` in the prototype at the current program's inherit
    /// slot `inherit_idx` (the `::f()` form).
    CallSuper { inherit_idx: u32, func_idx: u32 },
    /// Same, selected by inherit alias (`Alias::f()`).
    CallParentNamed { inherit_idx: u32, func_idx: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_roundtrip() {
        for code in 0..NUM_OPERS as u8 {
            let op = Op::from_u8(code).unwrap();
            assert_eq!(op as u8, code);
        }
        assert_eq!(Op::from_u8(NUM_OPERS as u8), None);
    }

    #[test]
    fn test_find_syscall_canonical() {
        assert_eq!(find_syscall("clone_object"), Some(44));
        assert_eq!(find_syscall("call_other"), Some(sys::CALL_OTHER));
        assert_eq!(find_syscall("sizeof"), Some(135));
        assert_eq!(find_syscall("restore_map"), Some(166));
        assert_eq!(find_syscall("no_such_builtin"), None);
    }

    #[test]
    fn test_find_syscall_aliases() {
        assert_eq!(find_syscall("fread"), find_syscall("read_file"));
        assert_eq!(find_syscall("mv"), find_syscall("rename"));
        assert_eq!(find_syscall("ls"), find_syscall("get_dir"));
        assert_eq!(find_syscall("new"), find_syscall("clone_object"));
    }

    #[test]
    fn test_literal_slots_are_not_callable() {
        assert_eq!(syscall_name(sys::ARRAY_LITERAL), None);
        assert_eq!(syscall_name(sys::MAPPING_LITERAL), None);
        // But the slots are reserved and inside the table.
        assert!(sys::ARRAY_LITERAL < NUM_OPERS + NUM_SCALLS);
        assert!(sys::MAPPING_LITERAL < NUM_OPERS + NUM_SCALLS);
    }

    #[test]
    fn test_syscall_name_lookup() {
        assert_eq!(syscall_name(44), Some("clone_object"));
        assert_eq!(syscall_name(165), Some("all_inventory"));
        assert_eq!(syscall_name(37), None); // operator range
    }

    #[test]
    fn test_assignment_ops() {
        assert!(Op::Assign.is_assignment());
        assert!(Op::ShrAssign.is_assignment());
        assert!(!Op::Add.is_assignment());
        assert!(!Op::Cond.is_assignment());
    }
}
