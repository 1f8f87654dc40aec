//! Compiled programs
//!
//! A `Program` is the immutable result of compiling one source path: its
//! function list, its own global declarations, the inherit list, and the
//! ancestor linearization with per-ancestor slot bases. Programs are
//! shared (`Rc`) between the prototype cache, child programs that
//! inherit them, and every call frame executing their code.

use std::rc::Rc;
use tern_core::instr::Instr;

/// Declared shape of a variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarShape {
    /// Plain scalar slot.
    Scalar,
    /// `T *v` or `T v[]`: array with no declared bound.
    UnboundedArray,
    /// `T v[d1][d2]...`: array with fixed dimensions.
    Array(Vec<u32>),
    /// `mapping m`.
    Mapping,
}

impl VarShape {
    /// Total declared element count; the size marker carried by l-value
    /// instructions. 0 marks a mapping, 1 a scalar, `u32::MAX` an
    /// unbounded array.
    pub fn size_marker(&self) -> u32 {
        match self {
            VarShape::Scalar => 1,
            VarShape::UnboundedArray => u32::MAX,
            VarShape::Array(dims) => dims.iter().product(),
            VarShape::Mapping => 0,
        }
    }

    pub fn is_subscriptable(&self) -> bool {
        !matches!(self, VarShape::Scalar)
    }
}

#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: String,
    /// Slot index. For globals this is absolute within the declaring
    /// program's layout; for locals it is the local slot.
    pub base: u32,
    pub shape: VarShape,
}

/// One compiled function.
#[derive(Debug)]
pub struct FnDef {
    pub name: String,
    /// Static functions are not reachable through call_other.
    pub is_static: bool,
    pub num_args: u32,
    pub num_locals: u32,
    pub code: Vec<Instr>,
    /// Local symbol table, kept for array-shape markers and diagnostics.
    pub locals: Vec<VarDecl>,
}

/// One `inherit "path"` entry.
#[derive(Debug, Clone)]
pub struct InheritEntry {
    /// Dispatch alias; defaults to the basename of the path without its
    /// extension.
    pub alias: String,
    pub path: String,
    pub program: Rc<Program>,
    /// Slot where this parent's own globals begin in the child layout.
    pub var_offset: u32,
    /// Starting index of this parent in the child's flattened
    /// super-dispatch view.
    pub func_offset: u32,
}

/// An ancestor in the linearization, with the slot where its own global
/// region begins in this program's layout.
#[derive(Debug, Clone)]
pub struct Ancestor {
    pub program: Rc<Program>,
    pub base: u32,
}

#[derive(Debug)]
pub struct Program {
    pub path: String,
    /// Own global declarations. `base` is absolute in this layout.
    pub globals: Vec<VarDecl>,
    /// Total slot count: every linearized ancestor's own globals plus ours.
    pub num_globals: u32,
    /// Slot where our own globals begin.
    pub own_base: u32,
    pub funcs: Vec<Rc<FnDef>>,
    pub inherits: Vec<InheritEntry>,
    /// Depth-first, base-first, duplicate-free linearization of the
    /// inheritance DAG, excluding this program itself.
    pub ancestors: Vec<Ancestor>,
}

impl Program {
    /// A program with no inherits and no declarations (the empty unit
    /// used by tests and by failed-compile placeholders).
    pub fn empty(path: &str) -> Program {
        Program {
            path: path.to_string(),
            globals: Vec::new(),
            num_globals: 0,
            own_base: 0,
            funcs: Vec::new(),
            inherits: Vec::new(),
            ancestors: Vec::new(),
        }
    }

    /// Find one of our own functions by name.
    pub fn own_func(&self, name: &str) -> Option<(u32, &Rc<FnDef>)> {
        self.funcs
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
            .map(|(i, f)| (i as u32, f))
    }

    /// Method resolution: the program's own table first, then the
    /// linearization derived-first. Returns the function and its
    /// defining program.
    pub fn resolve_func(this: &Rc<Program>, name: &str) -> Option<(Rc<FnDef>, Rc<Program>)> {
        if let Some((_, f)) = this.own_func(name) {
            return Some((f.clone(), this.clone()));
        }
        for anc in this.ancestors.iter().rev() {
            if let Some((_, f)) = anc.program.own_func(name) {
                return Some((f.clone(), anc.program.clone()));
            }
        }
        None
    }

    /// Dispatch view for super calls: the program, then its ancestors
    /// derived-first. `CALL_SUPER`'s `func_idx` indexes the function
    /// tables of this sequence laid end to end.
    pub fn dispatch_order(this: &Rc<Program>) -> Vec<Rc<Program>> {
        let mut order = Vec::with_capacity(this.ancestors.len() + 1);
        order.push(this.clone());
        for anc in this.ancestors.iter().rev() {
            order.push(anc.program.clone());
        }
        order
    }

    /// Decode a flattened dispatch index into (program, own index).
    pub fn decode_dispatch_index(
        this: &Rc<Program>,
        mut func_idx: u32,
    ) -> Option<(Rc<Program>, u32)> {
        for prog in Program::dispatch_order(this) {
            let len = prog.funcs.len() as u32;
            if func_idx < len {
                return Some((prog, func_idx));
            }
            func_idx -= len;
        }
        None
    }

    /// Flattened dispatch index of `name`, searching the program and
    /// its ancestors derived-first.
    pub fn dispatch_index_of(this: &Rc<Program>, name: &str) -> Option<u32> {
        let mut offset = 0u32;
        for prog in Program::dispatch_order(this) {
            if let Some((i, _)) = prog.own_func(name) {
                return Some(offset + i);
            }
            offset += prog.funcs.len() as u32;
        }
        None
    }

    /// The slot shift that maps `definer`-layout slot numbers into this
    /// program's layout: `definer`'s own-region base here minus its
    /// own-region base at home. Zero whenever `definer`'s layout embeds
    /// at the front of ours (the single-inheritance and first-parent
    /// cases), which keeps inherited code's view of its ancestors intact.
    pub fn slot_shift(this: &Rc<Program>, definer: &Rc<Program>) -> Option<u32> {
        if Rc::ptr_eq(this, definer) {
            return Some(0);
        }
        this.ancestors
            .iter()
            .find(|a| Rc::ptr_eq(&a.program, definer))
            .map(|a| a.base - definer.own_base)
    }

    /// Visible global lookup during compilation and reflection: our own
    /// declarations, then ancestors derived-first. Bases are returned in
    /// this program's layout.
    pub fn find_global(&self, name: &str) -> Option<VarDecl> {
        if let Some(v) = self.globals.iter().find(|v| v.name == name) {
            return Some(v.clone());
        }
        for anc in self.ancestors.iter().rev() {
            if let Some(v) = anc.program.globals.iter().find(|v| v.name == name) {
                let mut v = v.clone();
                v.base = anc.base + (v.base - anc.program.own_base);
                return Some(v);
            }
        }
        None
    }

    /// The ancestor (if any) that declares `name`, for shadowing
    /// diagnostics.
    pub fn global_origin(&self, name: &str) -> Option<&Rc<Program>> {
        for anc in self.ancestors.iter().rev() {
            if anc.program.globals.iter().any(|v| v.name == name) {
                return Some(&anc.program);
            }
        }
        None
    }
}

/// Basename of a path without extension; the default inherit alias.
pub fn default_alias(path: &str) -> String {
    let base = path.rsplit('/').next().unwrap_or(path);
    match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => base.to_string(),
    }
}

/// Build the linearization for a program with the given inherit entries:
/// depth-first over each entry (that entry's own ancestors first, then
/// the entry itself), duplicates removed, base-first. Returns the
/// linearized programs and the total slot count they occupy; per-program
/// bases are assigned in order.
pub fn linearize(inherits: &[Rc<Program>]) -> (Vec<Ancestor>, u32) {
    let mut out: Vec<Ancestor> = Vec::new();
    let mut next_base = 0u32;
    let mut push_unique = |prog: &Rc<Program>, next_base: &mut u32, out: &mut Vec<Ancestor>| {
        if out.iter().any(|a| Rc::ptr_eq(&a.program, prog)) {
            return;
        }
        out.push(Ancestor {
            program: prog.clone(),
            base: *next_base,
        });
        *next_base += prog.globals.len() as u32;
    };
    for entry in inherits {
        for anc in &entry.ancestors {
            push_unique(&anc.program, &mut next_base, &mut out);
        }
        push_unique(entry, &mut next_base, &mut out);
    }
    (out, next_base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prog(path: &str, nvars: usize, inherits: Vec<Rc<Program>>) -> Rc<Program> {
        let (ancestors, inherited) = linearize(&inherits);
        let own_base = inherited;
        let globals: Vec<VarDecl> = (0..nvars)
            .map(|i| VarDecl {
                name: format!("{}_v{}", default_alias(path), i),
                base: own_base + i as u32,
                shape: VarShape::Scalar,
            })
            .collect();
        Rc::new(Program {
            path: path.to_string(),
            num_globals: inherited + nvars as u32,
            own_base,
            globals,
            funcs: Vec::new(),
            inherits: inherits
                .iter()
                .map(|p| InheritEntry {
                    alias: default_alias(&p.path),
                    path: p.path.clone(),
                    program: p.clone(),
                    var_offset: ancestors
                        .iter()
                        .find(|a| Rc::ptr_eq(&a.program, p))
                        .map(|a| a.base)
                        .unwrap_or(0),
                    func_offset: 0,
                })
                .collect(),
            ancestors,
        })
    }

    #[test]
    fn test_default_alias() {
        assert_eq!(default_alias("/obj/thing.t"), "thing");
        assert_eq!(default_alias("/obj/thing"), "thing");
        assert_eq!(default_alias("base"), "base");
    }

    #[test]
    fn test_chain_layout() {
        let x = prog("/x", 2, vec![]);
        let a = prog("/a", 3, vec![x.clone()]);
        let b = prog("/b", 1, vec![a.clone()]);
        // b's layout: x's 2, a's 3, then b's own.
        assert_eq!(b.num_globals, 6);
        assert_eq!(b.own_base, 5);
        assert_eq!(Program::slot_shift(&b, &a), Some(0));
        assert_eq!(Program::slot_shift(&b, &x), Some(0));
        assert_eq!(Program::slot_shift(&b, &b), Some(0));
    }

    #[test]
    fn test_diamond_dedup() {
        let x = prog("/x", 2, vec![]);
        let a = prog("/a", 1, vec![x.clone()]);
        let b = prog("/b", 1, vec![x.clone()]);
        let e = prog("/e", 1, vec![a.clone(), b.clone()]);
        // x appears once: 2 + 1 + 1 + 1 slots.
        assert_eq!(e.num_globals, 5);
        assert_eq!(e.ancestors.len(), 3);
        // Base-first: x before a before b.
        assert!(Rc::ptr_eq(&e.ancestors[0].program, &x));
        assert!(Rc::ptr_eq(&e.ancestors[1].program, &a));
        assert!(Rc::ptr_eq(&e.ancestors[2].program, &b));
        // a's layout ([x, a]) embeds at the front of e's.
        assert_eq!(Program::slot_shift(&e, &a), Some(0));
    }

    #[test]
    fn test_find_global_resolves_ancestor_base() {
        let x = prog("/x", 1, vec![]);
        let a = prog("/a", 1, vec![x.clone()]);
        let v = a.find_global("x_v0").unwrap();
        assert_eq!(v.base, 0);
        let v = a.find_global("a_v0").unwrap();
        assert_eq!(v.base, 1);
        assert!(a.find_global("nothing").is_none());
    }
}
