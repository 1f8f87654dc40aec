//! End-to-end engine scenarios: compile small Tern programs from a temp
//! mudlib and drive them through the interpreter.

mod common;

use common::{call, clone_of, world};
use tern_core::{MapKey, ObjRef, Value};
use tern_runtime::object::ObjState;
use tern_runtime::queues::handle_destruct;

const EMPTY_BOOT: &str = "init() { return 0; }\n";

#[test]
fn test_globals_and_arithmetic() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "int a;\n\
         int b;\n\
         f() { a = 3; b = a + 2; return b; }\n\
         seta(int v) { a = v; }\n\
         g() { b = a + 2; return b; }\n",
    )]);
    let obj = clone_of(&mut engine, "/boot");
    assert_eq!(call(&mut engine, obj, "f", vec![]), Value::Int(5));
    call(&mut engine, obj, "seta", vec![Value::Int(7)]);
    assert_eq!(call(&mut engine, obj, "g", vec![]), Value::Int(9));
    // f reassigns a=3, so it answers 5 again on the same object.
    assert_eq!(call(&mut engine, obj, "f", vec![]), Value::Int(5));
}

#[test]
fn test_control_flow_and_operators() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "sum(int n) { int total; int i; for (i = 1; i <= n; i++) total += i; return total; }\n\
         parity(int n) { if (n % 2) return \"odd\"; else return \"even\"; }\n\
         countdown(int n) { int steps; while (n > 0) { n--; steps++; } return steps; }\n\
         once() { int n; do { n++; } while (0); return n; }\n\
         pick(int n) { return n ? 10 : 20; }\n\
         logic(int a, int b) { return (a && b) + (a || b) * 2; }\n",
    )]);
    let obj = clone_of(&mut engine, "/boot");
    assert_eq!(call(&mut engine, obj, "sum", vec![Value::Int(10)]), Value::Int(55));
    assert_eq!(
        call(&mut engine, obj, "parity", vec![Value::Int(3)]),
        Value::Str("odd".into())
    );
    assert_eq!(
        call(&mut engine, obj, "parity", vec![Value::Int(4)]),
        Value::Str("even".into())
    );
    assert_eq!(
        call(&mut engine, obj, "countdown", vec![Value::Int(5)]),
        Value::Int(5)
    );
    assert_eq!(call(&mut engine, obj, "once", vec![]), Value::Int(1));
    assert_eq!(call(&mut engine, obj, "pick", vec![Value::Int(1)]), Value::Int(10));
    assert_eq!(call(&mut engine, obj, "pick", vec![Value::Int(0)]), Value::Int(20));
    assert_eq!(
        call(&mut engine, obj, "logic", vec![Value::Int(1), Value::Int(0)]),
        Value::Int(2)
    );
}

#[test]
fn test_inheritance_and_super_calls() {
    let (_dir, mut engine) = world(&[
        ("/boot.t", EMPTY_BOOT),
        ("/P.t", "int x;\nwho() { return x; }\n"),
        (
            "/Q.t",
            "inherit \"/P\";\n\
             setx(int v) { x = v; }\n\
             check() { return ::who(); }\n\
             named() { return P::who(); }\n",
        ),
    ]);
    let q = clone_of(&mut engine, "/Q");
    call(&mut engine, q, "setx", vec![Value::Int(11)]);
    assert_eq!(call(&mut engine, q, "check", vec![]), Value::Int(11));
    assert_eq!(call(&mut engine, q, "named", vec![]), Value::Int(11));
    // The inherited function resolves through the MRO too.
    assert_eq!(call(&mut engine, q, "who", vec![]), Value::Int(11));
}

#[test]
fn test_shadowing_is_a_compile_error() {
    let (_dir, mut engine) = world(&[
        ("/boot.t", EMPTY_BOOT),
        ("/P.t", "int x;\nwho() { return x; }\n"),
        ("/Q.t", "inherit \"/P\";\nint x;\n"),
    ]);
    let err = engine.load_proto("/Q").unwrap_err();
    assert!(
        err.message
            .contains("variable 'x' already defined in ancestor 'P'"),
        "{}",
        err.message
    );
}

#[test]
fn test_mapping_literals_and_ops() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "mapping m;\n\
         build() { m = ([ \"a\" : 1, \"b\" : 2 ]); m[\"c\"] = 3; return sizeof(keys(m)); }\n\
         has_b() { return member(m, \"b\"); }\n\
         getc() { return m[\"c\"]; }\n\
         drop_a() { map_delete(m, \"a\"); return sizeof(keys(m)); }\n",
    )]);
    let obj = clone_of(&mut engine, "/boot");
    assert_eq!(call(&mut engine, obj, "build", vec![]), Value::Int(3));
    assert_eq!(call(&mut engine, obj, "has_b", vec![]), Value::Int(1));
    assert_eq!(call(&mut engine, obj, "getc", vec![]), Value::Int(3));
    assert_eq!(call(&mut engine, obj, "drop_a", vec![]), Value::Int(2));
}

#[test]
fn test_array_growth_and_bounds() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "int *v;\n\
         int w[4];\n\
         build() { v = ({ 10, 20, 30 }); return sizeof(v); }\n\
         grow() { v[5] = 99; return sizeof(v); }\n\
         at(int i) { return v[i]; }\n\
         wfill() { w[3] = 1; return sizeof(w); }\n\
         wbad() { w[4] = 9; return 123; }\n",
    )]);
    let obj = clone_of(&mut engine, "/boot");
    assert_eq!(call(&mut engine, obj, "build", vec![]), Value::Int(3));
    assert_eq!(call(&mut engine, obj, "grow", vec![]), Value::Int(6));
    // Intermediate cells were zero-filled.
    assert_eq!(call(&mut engine, obj, "at", vec![Value::Int(3)]), Value::Int(0));
    assert_eq!(call(&mut engine, obj, "at", vec![Value::Int(4)]), Value::Int(0));
    assert_eq!(call(&mut engine, obj, "at", vec![Value::Int(5)]), Value::Int(99));
    // A write at the declared bound fails and unwinds to 0, without
    // mutating the array.
    assert_eq!(call(&mut engine, obj, "wfill", vec![]), Value::Int(4));
    assert_eq!(call(&mut engine, obj, "wbad", vec![]), Value::Int(0));
    assert_eq!(call(&mut engine, obj, "wfill", vec![]), Value::Int(4));
}

#[test]
fn test_backrefs_cleared_on_destruct() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "object holder;\n\
         sethold(object o) { holder = o; }\n\
         gethold() { return holder; }\n",
    )]);
    let a = clone_of(&mut engine, "/boot");
    let b = clone_of(&mut engine, "/boot");
    call(&mut engine, a, "sethold", vec![Value::Obj(b)]);
    // The back-reference exists on the target.
    let slot = {
        let data = engine.store.get(b).unwrap().data.as_ref().unwrap();
        assert_eq!(data.refd_by.len(), 1);
        assert_eq!(data.refd_by[0].0, a);
        data.refd_by[0].1
    };
    assert_eq!(call(&mut engine, a, "gethold", vec![]), Value::Obj(b));

    engine.queues.queue_for_destruct(b);
    handle_destruct(&mut engine);

    assert!(!engine.store.is_live(b));
    // The holder's slot reads integer 0 and the holder is dirty.
    assert_eq!(call(&mut engine, a, "gethold", vec![]), Value::Int(0));
    assert_eq!(engine.read_global(a, slot).unwrap(), Value::Int(0));
    assert_eq!(engine.store.get(a).unwrap().state, ObjState::Dirty);
}

#[test]
fn test_reassignment_retargets_backref() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "object holder;\nsethold(object o) { holder = o; }\nclear() { holder = 0; }\n",
    )]);
    let a = clone_of(&mut engine, "/boot");
    let b = clone_of(&mut engine, "/boot");
    let c = clone_of(&mut engine, "/boot");
    call(&mut engine, a, "sethold", vec![Value::Obj(b)]);
    call(&mut engine, a, "sethold", vec![Value::Obj(c)]);
    assert!(engine.store.get(b).unwrap().data.as_ref().unwrap().refd_by.is_empty());
    assert_eq!(engine.store.get(c).unwrap().data.as_ref().unwrap().refd_by.len(), 1);
    call(&mut engine, a, "clear", vec![]);
    assert!(engine.store.get(c).unwrap().data.as_ref().unwrap().refd_by.is_empty());
}

#[test]
fn test_call_other_and_late_binding() {
    let (_dir, mut engine) = world(&[
        ("/boot.t", EMPTY_BOOT),
        (
            "/calc.t",
            "double(int n) { return n * 2; }\n\
             static hidden() { return 42; }\n",
        ),
        (
            "/user.t",
            "object target;\n\
             set(object o) { target = o; }\n\
             run(int n) { return target->double(n); }\n\
             sneak() { return target->hidden(); }\n\
             by_path(int n) { return \"/calc\"->double(n); }\n",
        ),
    ]);
    let calc = clone_of(&mut engine, "/calc");
    let user = clone_of(&mut engine, "/user");
    call(&mut engine, user, "set", vec![Value::Obj(calc)]);
    assert_eq!(call(&mut engine, user, "run", vec![Value::Int(21)]), Value::Int(42));
    // Static functions are invisible to call_other.
    assert_eq!(call(&mut engine, user, "sneak", vec![]), Value::Int(0));
    // A pathname target reaches the prototype object.
    assert_eq!(
        call(&mut engine, user, "by_path", vec![Value::Int(5)]),
        Value::Int(10)
    );
}

#[test]
fn test_verb_dispatch_via_command_queue() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "int kicks;\n\
         init() { add_verb(\"kick\", \"do_kick\"); add_xverb(\"'\", \"do_say\"); }\n\
         do_kick(string arg) { kicks++; return 1; }\n\
         kicked() { return kicks; }\n\
         string said;\n\
         do_say(string arg) { said = arg; return 1; }\n\
         last_said() { return said; }\n",
    )]);
    let player = clone_of(&mut engine, "/boot");
    engine.queues.queue_command(player, "kick the bucket".to_string());
    tern_runtime::queues::handle_command(&mut engine);
    assert_eq!(call(&mut engine, player, "kicked", vec![]), Value::Int(1));
    // xverbs match by prefix and receive the remainder.
    engine.queues.queue_command(player, "'hello world".to_string());
    tern_runtime::queues::handle_command(&mut engine);
    assert_eq!(
        call(&mut engine, player, "last_said", vec![]),
        Value::Str("hello world".into())
    );
}

#[test]
fn test_input_redirect_is_one_shot() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "string got;\n\
         int kicks;\n\
         init() { add_verb(\"kick\", \"do_kick\"); }\n\
         do_kick(string arg) { kicks++; return 1; }\n\
         kicked() { return kicks; }\n\
         arm() { redirect_input(\"catch\"); }\n\
         catch(string line) { got = line; }\n\
         caught() { return got; }\n",
    )]);
    let player = clone_of(&mut engine, "/boot");
    call(&mut engine, player, "arm", vec![]);
    engine.queues.queue_command(player, "kick".to_string());
    engine.queues.queue_command(player, "kick".to_string());
    tern_runtime::queues::handle_command(&mut engine);
    // First line went to the redirect, second to verb dispatch.
    assert_eq!(
        call(&mut engine, player, "caught", vec![]),
        Value::Str("kick".into())
    );
    assert_eq!(call(&mut engine, player, "kicked", vec![]), Value::Int(1));
}

#[test]
fn test_alarms_fire_in_deadline_order() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "string order;\n\
         init() { order = \"\"; }\n\
         first() { order = order + \"a\"; }\n\
         second() { order = order + \"b\"; }\n\
         trace() { return order; }\n",
    )]);
    let obj = clone_of(&mut engine, "/boot");
    let now = engine.now_time;
    engine.queues.queue_alarm(obj, now - 1, "second".into());
    engine.queues.queue_alarm(obj, now - 2, "first".into());
    tern_runtime::queues::handle_alarm(&mut engine);
    assert_eq!(
        call(&mut engine, obj, "trace", vec![]),
        Value::Str("ab".into())
    );
    // Nothing left queued.
    assert!(engine.queues.alarms().is_empty());
}

#[test]
fn test_containment_and_move() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "go(object item, object dest) { return move_object(item, dest); }\n\
         here(object o) { return location(o); }\n",
    )]);
    let room = clone_of(&mut engine, "/boot");
    let item = clone_of(&mut engine, "/boot");
    // The engine-level move (no PRIV) is exercised directly.
    engine.store.link_location(item, room);
    assert_eq!(
        call(&mut engine, room, "here", vec![Value::Obj(item)]),
        Value::Obj(room)
    );
    let inv = call(&mut engine, room, "go", vec![Value::Obj(room), Value::Obj(item)]);
    // Moving the room into its own content is refused (cycle).
    assert_eq!(inv, Value::Int(1));
}

#[test]
fn test_runtime_error_unwinds_to_zero() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "crash() { return 1 / 0; }\n\
         nested() { return crash() + 5; }\n\
         fine() { return 7; }\n",
    )]);
    let obj = clone_of(&mut engine, "/boot");
    // The whole chain unwinds; the boundary yields integer 0.
    assert_eq!(call(&mut engine, obj, "nested", vec![]), Value::Int(0));
    // The engine keeps going afterwards.
    assert_eq!(call(&mut engine, obj, "fine", vec![]), Value::Int(7));
}

#[test]
fn test_cycle_limit_aborts_loops() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "spin() { while (1) { } return 1; }\nok() { return 2; }\n",
    )]);
    let obj = clone_of(&mut engine, "/boot");
    engine.cycles.hard_max = Some(10_000);
    assert_eq!(call(&mut engine, obj, "spin", vec![]), Value::Int(0));
    assert_eq!(call(&mut engine, obj, "ok", vec![]), Value::Int(2));
}

#[test]
fn test_string_builtins() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "mid(string s) { return midstr(s, 2, 3); }\n\
         shout(string s) { return upcase(s); }\n\
         pieces(string s) { return sizeof(explode(s, \",\")); }\n\
         joined() { return implode(({ \"a\", \"b\", \"c\" }), \"-\"); }\n\
         fmt(int n, string w) { return sprintf(\"%d-%s\", n, w); }\n\
         scan(string s) { int n; string rest; sscanf(s, \"%d %s\", n, rest); return n; }\n",
    )]);
    let obj = clone_of(&mut engine, "/boot");
    assert_eq!(
        call(&mut engine, obj, "mid", vec![Value::Str("abcdef".into())]),
        Value::Str("cde".into())
    );
    assert_eq!(
        call(&mut engine, obj, "shout", vec![Value::Str("hi".into())]),
        Value::Str("HI".into())
    );
    assert_eq!(
        call(&mut engine, obj, "pieces", vec![Value::Str("a,b,c,d".into())]),
        Value::Int(4)
    );
    assert_eq!(call(&mut engine, obj, "joined", vec![]), Value::Str("a-b-c".into()));
    assert_eq!(
        call(
            &mut engine,
            obj,
            "fmt",
            vec![Value::Int(9), Value::Str("lives".into())]
        ),
        Value::Str("9-lives".into())
    );
    assert_eq!(
        call(&mut engine, obj, "scan", vec![Value::Str("42 rooms".into())]),
        Value::Int(42)
    );
}

#[test]
fn test_string_builtins_survive_multibyte() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "mid(string s, int p, int l) { return midstr(s, p, l); }\n\
         left(string s, int n) { return leftstr(s, n); }\n\
         right(string s, int n) { return rightstr(s, n); }\n\
         cut(string s) { return subst(s, 1, 1, \"-\"); }\n\
         find(string s, string t) { return instr(s, 2, t); }\n\
         len(string s) { return strlen(s); }\n",
    )]);
    let obj = clone_of(&mut engine, "/boot");
    // "é" is two bytes; positions are byte offsets.
    let word = || Value::Str("héllo".into());
    assert_eq!(call(&mut engine, obj, "len", vec![word()]), Value::Int(6));
    assert_eq!(
        call(&mut engine, obj, "mid", vec![word(), Value::Int(1), Value::Int(2)]),
        Value::Str("é".into())
    );
    assert_eq!(
        call(&mut engine, obj, "left", vec![word(), Value::Int(3)]),
        Value::Str("hé".into())
    );
    assert_eq!(
        call(&mut engine, obj, "right", vec![word(), Value::Int(5)]),
        Value::Str("éllo".into())
    );
    // Offsets landing inside the character yield replacement characters
    // instead of aborting the engine.
    assert_eq!(
        call(&mut engine, obj, "mid", vec![word(), Value::Int(2), Value::Int(1)]),
        Value::Str("\u{fffd}".into())
    );
    assert_eq!(
        call(&mut engine, obj, "left", vec![word(), Value::Int(2)]),
        Value::Str("h\u{fffd}".into())
    );
    assert_eq!(
        call(&mut engine, obj, "cut", vec![word()]),
        Value::Str("h-\u{fffd}llo".into())
    );
    // Byte-wise search still lands on the right offset, even when the
    // start position splits a character.
    assert_eq!(
        call(&mut engine, obj, "find", vec![word(), Value::Str("llo".into())]),
        Value::Int(3)
    );
    // The engine is still healthy afterwards.
    assert_eq!(call(&mut engine, obj, "len", vec![word()]), Value::Int(6));
}

#[test]
fn test_chr_asc_ascii_rules() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "code(int n) { return chr(n); }\n\
         ord(string s) { return asc(s); }\n\
         both(int n) { return asc(chr(n)); }\n",
    )]);
    let obj = clone_of(&mut engine, "/boot");
    assert_eq!(
        call(&mut engine, obj, "code", vec![Value::Int(65)]),
        Value::Str("A".into())
    );
    assert_eq!(
        call(&mut engine, obj, "code", vec![Value::Int(10)]),
        Value::Str("\n".into())
    );
    assert_eq!(call(&mut engine, obj, "both", vec![Value::Int(65)]), Value::Int(65));
    assert_eq!(
        call(&mut engine, obj, "ord", vec![Value::Str("zebra".into())]),
        Value::Int(122)
    );
    // Out of range or unprintable answers integer 0, and asc passes
    // that 0 straight through.
    assert_eq!(call(&mut engine, obj, "code", vec![Value::Int(200)]), Value::Int(0));
    assert_eq!(call(&mut engine, obj, "code", vec![Value::Int(-1)]), Value::Int(0));
    assert_eq!(call(&mut engine, obj, "code", vec![Value::Int(7)]), Value::Int(0));
    assert_eq!(call(&mut engine, obj, "both", vec![Value::Int(200)]), Value::Int(0));
}

#[test]
fn test_save_restore_value_roundtrip() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "mixed() { return save_value(({ 1, \"two\", ([ 3 : \"three\" ]) })); }\n\
         back(string s) { return restore_value(s); }\n",
    )]);
    let obj = clone_of(&mut engine, "/boot");
    let encoded = call(&mut engine, obj, "mixed", vec![]);
    let Value::Str(text) = encoded else {
        panic!("expected string, got {:?}", encoded)
    };
    let back = call(&mut engine, obj, "back", vec![Value::Str(text)]);
    let Value::Array(arr) = back else {
        panic!("expected array, got {:?}", back)
    };
    let arr = arr.borrow();
    assert_eq!(arr.len(), 3);
    assert_eq!(arr.get(0).unwrap(), Value::Int(1));
    assert_eq!(arr.get(1).unwrap(), Value::Str("two".into()));
    let Value::Mapping(m) = arr.get(2).unwrap() else {
        panic!("expected mapping")
    };
    assert_eq!(
        m.borrow().get(&MapKey::Int(3)),
        Some(Value::Str("three".into()))
    );
}

#[test]
fn test_object_handle_roundtrip_in_save_value() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "enc(object o) { return save_value(o); }\ndec(string s) { return restore_value(s); }\n",
    )]);
    let obj = clone_of(&mut engine, "/boot");
    let encoded = call(&mut engine, obj, "enc", vec![Value::Obj(obj)]);
    let Value::Str(text) = encoded.clone() else {
        panic!("expected string")
    };
    assert!(text.starts_with(&format!("#{}:", obj.0)), "{}", text);
    assert!(text.contains("/boot"), "{}", text);
    assert_eq!(
        call(&mut engine, obj, "dec", vec![Value::Str(text.clone())]),
        Value::Obj(obj)
    );
    // A dead handle restores as 0.
    engine.queues.queue_for_destruct(obj);
    handle_destruct(&mut engine);
    let master = ObjRef(0);
    assert_eq!(
        call(&mut engine, master, "dec", vec![Value::Str(text)]),
        Value::Int(0)
    );
}

#[test]
fn test_multidim_arrays_flatten() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "int g[2][3];\n\
         put(int r, int c, int v) { g[r][c] = v; }\n\
         at(int r, int c) { return g[r][c]; }\n",
    )]);
    let obj = clone_of(&mut engine, "/boot");
    call(
        &mut engine,
        obj,
        "put",
        vec![Value::Int(1), Value::Int(2), Value::Int(7)],
    );
    assert_eq!(
        call(&mut engine, obj, "at", vec![Value::Int(1), Value::Int(2)]),
        Value::Int(7)
    );
    assert_eq!(
        call(&mut engine, obj, "at", vec![Value::Int(0), Value::Int(0)]),
        Value::Int(0)
    );
}

#[test]
fn test_attachment_builtins() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "hook(object host) { return attach(host); }\n\
         host_of() { return this_component(); }\n\
         unhook() { return detach(0); }\n",
    )]);
    let body = clone_of(&mut engine, "/boot");
    let arm = clone_of(&mut engine, "/boot");
    assert_eq!(
        call(&mut engine, arm, "hook", vec![Value::Obj(body)]),
        Value::Int(0)
    );
    assert_eq!(call(&mut engine, arm, "host_of", vec![]), Value::Obj(body));
    assert_eq!(engine.store.get(body).unwrap().attachees, vec![arm]);
    assert_eq!(call(&mut engine, arm, "unhook", vec![]), Value::Int(0));
    assert_eq!(call(&mut engine, arm, "host_of", vec![]), Value::Int(0));
}

#[test]
fn test_prototype_destruct_cascades_to_clones() {
    let (_dir, mut engine) = world(&[
        ("/boot.t", EMPTY_BOOT),
        ("/thing.t", "ping() { return 1; }\n"),
    ]);
    let a = clone_of(&mut engine, "/thing");
    let b = clone_of(&mut engine, "/thing");
    let proto_obj = engine.proto_of(a).unwrap().proto_obj;
    engine.queues.queue_for_destruct(proto_obj);
    handle_destruct(&mut engine);
    assert!(!engine.store.is_live(a));
    assert!(!engine.store.is_live(b));
    assert!(!engine.store.is_live(proto_obj));
    assert!(engine.protos.by_path("/thing").is_none());
}

#[test]
fn test_this_player_is_explicit() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "whoami() { return this_player(); }\n",
    )]);
    let obj = clone_of(&mut engine, "/boot");
    let player = clone_of(&mut engine, "/boot");
    // Without a player the answer is 0; with one, exactly that object.
    assert_eq!(call(&mut engine, obj, "whoami", vec![]), Value::Int(0));
    let v = engine
        .call_named(obj, "whoami", Some(player), None, vec![])
        .unwrap();
    assert_eq!(v, Value::Obj(player));
}
