//! tern-compiler: Tern source to stack-machine bytecode
//!
//! A single pass over the token stream produces an immutable `Program`:
//! per-function instruction vectors, the global symbol table, and the
//! inheritance linearization with per-ancestor slot bases. The first
//! diagnostic wins (there is no error recovery), and a failed compile
//! installs nothing.
//!
//! The compiler reaches its environment through two small traits:
//! `SourceLoader` maps include/compile paths to text (the runtime backs
//! it with the filesystem mirror) and `ProtoResolver` hands back the
//! compiled program for an `inherit "path"` (the runtime backs it with
//! the prototype cache, compiling on demand).

pub mod parser;
pub mod program;
pub mod token;

use std::fmt;
use std::rc::Rc;

pub use program::{Ancestor, FnDef, InheritEntry, Program, VarDecl, VarShape};

/// Extension appended to logical object paths to find their source.
pub const SOURCE_EXT: &str = ".t";

#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    /// Physical line in the outermost file.
    pub line: u32,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

/// The compiler's view of its surroundings: include files come from the
/// mudlib (`system` marks `#include <...>` against the system include
/// root), and `inherit "path"` resolves through the prototype cache,
/// compiling on demand. The runtime engine implements this directly.
pub trait CompileEnv {
    fn load_source(&mut self, path: &str, system: bool) -> Result<String, String>;

    fn resolve_proto(&mut self, path: &str) -> Result<Rc<Program>, String> {
        Err(format!("no prototype cache available for '{}'", path))
    }
}

/// Compile source text under a logical path.
pub fn compile_string(
    path: &str,
    source: &str,
    env: &mut dyn CompileEnv,
) -> Result<Program, CompileError> {
    tracing::debug!(path, "compiling");
    let parser = parser::Parser::new(path, source, env);
    let program = parser.parse()?;
    tracing::debug!(
        path,
        functions = program.funcs.len(),
        globals = program.num_globals,
        "compiled"
    );
    Ok(program)
}

/// Compile the source file for a logical object path (`/obj/thing` reads
/// `/obj/thing.t` through the environment).
pub fn compile_path(path: &str, env: &mut dyn CompileEnv) -> Result<Program, CompileError> {
    let file = format!("{}{}", path, SOURCE_EXT);
    let source = env.load_source(&file, false).map_err(|e| CompileError {
        line: 0,
        message: format!("cannot open '{}': {}", file, e),
    })?;
    compile_string(path, &source, env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapEnv(HashMap<String, String>);

    impl CompileEnv for MapEnv {
        fn load_source(&mut self, path: &str, _system: bool) -> Result<String, String> {
            self.0
                .get(path)
                .cloned()
                .ok_or_else(|| "file not found".to_string())
        }
    }

    #[test]
    fn test_compile_path_missing_file() {
        let mut env = MapEnv(HashMap::new());
        let err = compile_path("/boot", &mut env).unwrap_err();
        assert_eq!(err.line, 0);
        assert!(err.message.contains("/boot.t"));
    }

    #[test]
    fn test_compile_trivial() {
        let mut env = MapEnv(HashMap::new());
        let prog = compile_string("/empty", "", &mut env).unwrap();
        assert_eq!(prog.num_globals, 0);
        assert!(prog.funcs.is_empty());
    }
}
