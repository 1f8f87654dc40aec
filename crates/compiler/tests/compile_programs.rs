//! Whole-program compiles: layout, inheritance, emission shape.

use std::collections::HashMap;
use std::rc::Rc;
use tern_compiler::{compile_string, CompileEnv, CompileError, Program, VarShape};
use tern_core::instr::{find_syscall, Instr};

/// Compiles inherits out of an in-memory path->source map, caching like
/// the runtime's prototype cache does.
struct MapEnv {
    sources: HashMap<String, String>,
    cache: HashMap<String, Rc<Program>>,
}

impl CompileEnv for MapEnv {
    fn load_source(&mut self, path: &str, _system: bool) -> Result<String, String> {
        self.sources
            .get(path)
            .cloned()
            .ok_or_else(|| "file not found".to_string())
    }

    fn resolve_proto(&mut self, path: &str) -> Result<Rc<Program>, String> {
        if let Some(p) = self.cache.get(path) {
            return Ok(p.clone());
        }
        let source = self
            .sources
            .get(path)
            .cloned()
            .ok_or_else(|| format!("no such prototype '{}'", path))?;
        let mut nested = MapEnv {
            sources: self.sources.clone(),
            cache: self.cache.clone(),
        };
        let program =
            Rc::new(compile_string(path, &source, &mut nested).map_err(|e| e.to_string())?);
        self.cache.insert(path.to_string(), program.clone());
        Ok(program)
    }
}

fn compile(source: &str) -> Result<Program, CompileError> {
    compile_with(source, &[])
}

fn compile_with(source: &str, protos: &[(&str, &str)]) -> Result<Program, CompileError> {
    let mut env = MapEnv {
        sources: protos
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        cache: HashMap::new(),
    };
    compile_string("/test", source, &mut env)
}

#[test]
fn test_globals_and_function() {
    let prog = compile("int a;\nint b;\nf() { a = 3; b = a + 2; return b; }").unwrap();
    assert_eq!(prog.num_globals, 2);
    assert_eq!(prog.own_base, 0);
    assert_eq!(prog.funcs.len(), 1);
    let f = &prog.funcs[0];
    assert_eq!(f.name, "f");
    assert_eq!(f.num_args, 0);
    // Body ends with the implicit return 0.
    let n = f.code.len();
    assert_eq!(f.code[n - 2], Instr::Int(0));
    assert_eq!(f.code[n - 1], Instr::Return);
}

#[test]
fn test_locals_and_args() {
    let prog = compile("add(int x, int y) { int sum; sum = x + y; return sum; }").unwrap();
    let f = &prog.funcs[0];
    assert_eq!(f.num_args, 2);
    assert_eq!(f.num_locals, 3);
    assert!(f
        .code
        .iter()
        .any(|i| matches!(i, Instr::LocalLValue { slot: 2, .. })));
}

#[test]
fn test_var_shapes() {
    let prog = compile("int s;\nint *u;\nint v[];\nint m[4];\nint grid[2][3];\nmapping t;").unwrap();
    assert_eq!(prog.num_globals, 6);
    assert_eq!(prog.globals[0].shape, VarShape::Scalar);
    assert_eq!(prog.globals[1].shape, VarShape::UnboundedArray);
    assert_eq!(prog.globals[2].shape, VarShape::UnboundedArray);
    assert_eq!(prog.globals[3].shape, VarShape::Array(vec![4]));
    assert_eq!(prog.globals[4].shape, VarShape::Array(vec![2, 3]));
    assert_eq!(prog.globals[5].shape, VarShape::Mapping);
    assert_eq!(prog.globals[5].shape.size_marker(), 0);
    assert_eq!(prog.globals[4].shape.size_marker(), 6);
}

#[test]
fn test_call_resolution_order() {
    let prog = compile(
        "helper() { return 1; }\n\
         f() { helper(); strlen(\"x\"); later(); }",
    )
    .unwrap();
    let f = &prog.funcs[1];
    assert!(f.code.contains(&Instr::FuncCall(0)));
    assert!(f
        .code
        .contains(&Instr::Code(find_syscall("strlen").unwrap())));
    assert!(f.code.contains(&Instr::FuncName("later".to_string())));
}

#[test]
fn test_array_literal_emission() {
    let prog = compile("f() { return ({ 10, 20, 30 }); }").unwrap();
    let f = &prog.funcs[0];
    assert!(f.code.contains(&Instr::NumArgs(3)));
    assert!(f.code.contains(&Instr::Code(tern_core::instr::sys::ARRAY_LITERAL)));
}

#[test]
fn test_mapping_literal_emission() {
    let prog = compile("f() { return ([ \"a\" : 1, \"b\" : 2 ]); }").unwrap();
    let f = &prog.funcs[0];
    assert!(f.code.contains(&Instr::NumArgs(4)));
    assert!(f.code.contains(&Instr::Code(tern_core::instr::sys::MAPPING_LITERAL)));
}

#[test]
fn test_call_other_emission() {
    let prog = compile("int target;\nf() { return target->ping(1, 2); }").unwrap();
    let f = &prog.funcs[0];
    assert!(f.code.contains(&Instr::Str("ping".to_string())));
    // Two extra stack arguments: the target and the name.
    assert!(f.code.contains(&Instr::NumArgs(4)));
    assert!(f.code.contains(&Instr::Code(tern_core::instr::sys::CALL_OTHER)));
}

#[test]
fn test_inherit_layout() {
    let prog = compile_with(
        "inherit \"/base\";\nint own;\naccessor() { return x; }",
        &[("/base", "int x;\nint y;\nwho() { return x; }")],
    )
    .unwrap();
    // Inherited slots first, own after.
    assert_eq!(prog.num_globals, 3);
    assert_eq!(prog.own_base, 2);
    assert_eq!(prog.globals[0].name, "own");
    assert_eq!(prog.globals[0].base, 2);
    // Referencing the inherited x resolves to slot 0.
    let f = &prog.funcs[0];
    assert!(f
        .code
        .iter()
        .any(|i| matches!(i, Instr::GlobalLValue { slot: 0, .. })));
}

#[test]
fn test_shadowing_ancestor_variable_errors() {
    let err = compile_with(
        "inherit \"/P\";\nint x;",
        &[("/P", "int x;\nwho() { return x; }")],
    )
    .unwrap_err();
    assert_eq!(
        err.message,
        "variable 'x' already defined in ancestor 'P'"
    );
}

#[test]
fn test_inherit_after_declaration_errors() {
    let err = compile_with(
        "int a;\ninherit \"/base\";",
        &[("/base", "int x;")],
    )
    .unwrap_err();
    assert!(err.message.contains("inherit must appear before"));
}

#[test]
fn test_super_call_emission() {
    let prog = compile_with(
        "inherit \"/P\";\ncheck() { return ::who(); }",
        &[("/P", "int x;\nwho() { return x; }")],
    )
    .unwrap();
    let f = &prog.funcs[0];
    assert!(f.code.iter().any(|i| matches!(
        i,
        Instr::CallSuper {
            inherit_idx: 0,
            func_idx: 0
        }
    )));
}

#[test]
fn test_aliased_super_call() {
    let prog = compile_with(
        "inherit \"/obj/armor\";\nf() { return armor::rating(); }",
        &[("/obj/armor", "rating() { return 7; }")],
    )
    .unwrap();
    let f = &prog.funcs[0];
    assert!(f
        .code
        .iter()
        .any(|i| matches!(i, Instr::CallParentNamed { inherit_idx: 0, .. })));
}

#[test]
fn test_unknown_alias_errors() {
    let err = compile_with(
        "inherit \"/obj/armor\";\nf() { return shield::rating(); }",
        &[("/obj/armor", "rating() { return 7; }")],
    )
    .unwrap_err();
    assert!(err.message.contains("unknown inherit alias 'shield'"));
}

#[test]
fn test_diamond_dedup_is_legal() {
    // Both parents carry the same grandparent; its slots appear once.
    let prog = compile_with(
        "inherit \"/a\";\ninherit \"/b\";\nint own;",
        &[
            ("/x", "int shared;"),
            ("/a", "inherit \"/x\";\nint a1;"),
            ("/b", "inherit \"/x\";\nint b1;"),
        ],
    )
    .unwrap();
    assert_eq!(prog.num_globals, 4);
    assert_eq!(prog.ancestors.len(), 3);
}

#[test]
fn test_undefined_variable_errors() {
    let err = compile("f() { return nothing; }").unwrap_err();
    assert!(err.message.contains("undefined variable 'nothing'"));
    assert!(err.line >= 1);
}

#[test]
fn test_assignment_to_rvalue_errors() {
    let err = compile("f() { 3 = 4; }").unwrap_err();
    assert!(err.message.contains("assignment to non-lvalue"));
}

#[test]
fn test_control_flow_backpatching() {
    let prog = compile(
        "f(int n) {\n\
           int total;\n\
           for (n = 0; n < 10; n++) {\n\
             if (n % 2) total += n; else total += 1;\n\
           }\n\
           while (total > 100) total -= 10;\n\
           do { total++; } while (total < 5);\n\
           return total;\n\
         }",
    )
    .unwrap();
    let f = &prog.funcs[0];
    // Every branch and jump lands inside the function.
    let len = f.code.len() as u32;
    for instr in &f.code {
        match instr {
            Instr::Jump(t) | Instr::Branch(t) => assert!(*t <= len, "target {} of {}", t, len),
            _ => {}
        }
    }
    // NEW_LINE markers carry plausible lines.
    assert!(f
        .code
        .iter()
        .any(|i| matches!(i, Instr::NewLine(l) if *l >= 1)));
}

#[test]
fn test_macro_in_inherit_path() {
    let prog = compile_with(
        "#define BASE \"/base\"\ninherit BASE;\nint own;",
        &[("/base", "int x;")],
    )
    .unwrap();
    assert_eq!(prog.inherits.len(), 1);
    assert_eq!(prog.inherits[0].path, "/base");
}

#[test]
fn test_first_error_line_reported() {
    let err = compile("int a;\nf() {\n  a = ;\n}").unwrap_err();
    assert_eq!(err.line, 3);
}

#[test]
fn test_conditional_operator() {
    let prog = compile("f(int n) { return n ? 1 : 2; }").unwrap();
    let f = &prog.funcs[0];
    assert!(f.code.iter().any(|i| matches!(i, Instr::Branch(_))));
    assert!(f.code.iter().any(|i| matches!(i, Instr::Jump(_))));
}

#[test]
fn test_multidim_subscript_flattening() {
    let prog = compile("int g[2][3];\nf() { return g[1][2]; }").unwrap();
    let f = &prog.funcs[0];
    // Flattening multiplies by the trailing dimension.
    assert!(f.code.contains(&Instr::Int(3)));
    assert!(f.code.contains(&Instr::Code(tern_core::Op::Mul as u16)));
    assert!(f.code.contains(&Instr::Code(tern_core::Op::Add as u16)));
    assert!(f.code.contains(&Instr::ArraySize(6)));
    assert!(f.code.contains(&Instr::GlobalRef));
}

#[test]
fn test_static_function_flag() {
    let prog = compile("static hidden() { return 1; }\nshown() { return 2; }").unwrap();
    assert!(prog.funcs[0].is_static);
    assert!(!prog.funcs[1].is_static);
}
