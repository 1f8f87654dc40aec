//! Cache, transaction log, and checkpoint round-trips.

mod common;

use common::{call, clone_of, engine_for, world};
use serial_test::serial;
use tern_core::{ObjRef, Value};
use tern_runtime::object::{ObjFlags, ObjState};
use tern_runtime::{cache, save_db};

const STRING_WORLD: &str = "string tag;\n\
                            set(string s) { tag = s; }\n\
                            get() { return tag; }\n";

#[test]
#[serial]
fn test_eviction_writes_dirty_payloads_to_log() {
    let (dir, mut engine) = world(&[("/boot.t", STRING_WORLD)]);
    let a = clone_of(&mut engine, "/boot");
    let b = clone_of(&mut engine, "/boot");
    let c = clone_of(&mut engine, "/boot");
    call(&mut engine, a, "set", vec![Value::Str("alpha".into())]);
    call(&mut engine, b, "set", vec![Value::Str("beta".into())]);
    call(&mut engine, c, "set", vec![Value::Str("gamma".into())]);

    engine.cache.cap = 2;
    let evicted = cache::unload_to_cap(&mut engine);
    assert!(evicted >= 1, "something must leave the cache");
    assert!(engine.cache.resident_count() <= 2);
    // The log holds exactly the dirty evictions.
    let log = std::fs::metadata(dir.path().join("transact.log")).unwrap();
    assert!(log.len() > 0);

    // Re-reading pages the payloads back in with their values intact.
    assert_eq!(call(&mut engine, a, "get", vec![]), Value::Str("alpha".into()));
    assert_eq!(call(&mut engine, b, "get", vec![]), Value::Str("beta".into()));
    assert_eq!(call(&mut engine, c, "get", vec![]), Value::Str("gamma".into()));
}

#[test]
#[serial]
fn test_clean_eviction_skips_log() {
    let (dir, mut engine) = world(&[("/boot.t", STRING_WORLD)]);
    let a = clone_of(&mut engine, "/boot");
    call(&mut engine, a, "set", vec![Value::Str("kept".into())]);
    save_db(&mut engine, None).unwrap();
    // The checkpoint reset the log and left the object clean (FromDb).
    assert_eq!(engine.store.get(a).unwrap().state, ObjState::FromDb);
    assert!(!dir.path().join("transact.log").exists());

    engine.cache.cap = 0;
    cache::unload_to_cap(&mut engine);
    assert_eq!(engine.store.get(a).unwrap().state, ObjState::InDb);
    // Clean drop: still no transaction log.
    assert!(!dir.path().join("transact.log").exists());
    assert_eq!(call(&mut engine, a, "get", vec![]), Value::Str("kept".into()));
}

#[test]
#[serial]
fn test_checkpoint_restore_reproduces_world() {
    let boot = "string name;\n\
                int score;\n\
                int *list;\n\
                mapping stats;\n\
                object buddy;\n\
                init() { add_verb(\"poke\", \"do_poke\"); }\n\
                do_poke(string a) { return 1; }\n\
                fill(string n, int s) {\n\
                  name = n; score = s;\n\
                  list = ({ 1, 2, 3 });\n\
                  stats = ([ \"hp\" : 10 ]);\n\
                }\n\
                befriend(object o) { buddy = o; }\n\
                get_name() { return name; }\n\
                get_score() { return score; }\n\
                third() { return list[2]; }\n\
                hp() { return stats[\"hp\"]; }\n\
                friend() { return buddy; }\n";
    let (dir, mut engine) = world(&[("/boot.t", boot)]);
    let a = clone_of(&mut engine, "/boot");
    let b = clone_of(&mut engine, "/boot");
    call(
        &mut engine,
        a,
        "fill",
        vec![Value::Str("alice".into()), Value::Int(42)],
    );
    call(&mut engine, a, "befriend", vec![Value::Obj(b)]);
    engine.store.link_location(b, a);
    engine.store.attach(b, a);
    engine.table.set("motd", "welcome");
    engine.queues.queue_command(a, "poke b".into());
    let deadline = engine.now_time + 500;
    engine.queues.queue_alarm(a, deadline, "do_poke".into());

    save_db(&mut engine, None).unwrap();
    drop(engine);

    // A fresh process restores from the same path.
    let mut engine = engine_for(&dir);
    engine.boot().unwrap();
    assert_eq!(call(&mut engine, a, "get_name", vec![]), Value::Str("alice".into()));
    assert_eq!(call(&mut engine, a, "get_score", vec![]), Value::Int(42));
    assert_eq!(call(&mut engine, a, "third", vec![]), Value::Int(3));
    assert_eq!(call(&mut engine, a, "hp", vec![]), Value::Int(10));
    assert_eq!(call(&mut engine, a, "friend", vec![]), Value::Obj(b));
    // Containment and attachment links survived.
    assert_eq!(engine.store.get(b).unwrap().location, Some(a));
    assert_eq!(engine.store.get(a).unwrap().contents, Some(b));
    assert_eq!(engine.store.get(b).unwrap().attacher, Some(a));
    assert_eq!(engine.store.get(a).unwrap().attachees, vec![b]);
    // Verb list, interned table, pending queues.
    assert_eq!(engine.store.get(a).unwrap().verbs.len(), 1);
    assert_eq!(engine.store.get(a).unwrap().verbs[0].name, "poke");
    assert_eq!(engine.table.get("motd"), Some("welcome"));
    assert_eq!(engine.queues.commands().len(), 1);
    assert_eq!(engine.queues.commands()[0], (a, "poke b".to_string()));
    assert_eq!(engine.queues.alarms().len(), 1);
    assert_eq!(engine.queues.alarms()[0].deadline, deadline);
    assert_eq!(engine.queues.alarms()[0].func, "do_poke");
}

#[test]
#[serial]
fn test_restore_preserves_inheritance() {
    let (dir, mut engine) = world(&[
        ("/boot.t", "init() { return 0; }\n"),
        ("/base.t", "int hp;\nsethp(int v) { hp = v; }\nhealth() { return hp; }\n"),
        (
            "/fighter.t",
            "inherit \"/base\";\nint rage;\nfury() { return ::health() + rage; }\nenrage(int v) { rage = v; }\n",
        ),
    ]);
    let f = clone_of(&mut engine, "/fighter");
    call(&mut engine, f, "sethp", vec![Value::Int(30)]);
    call(&mut engine, f, "enrage", vec![Value::Int(5)]);
    assert_eq!(call(&mut engine, f, "fury", vec![]), Value::Int(35));

    save_db(&mut engine, None).unwrap();
    drop(engine);

    let mut engine = engine_for(&dir);
    engine.boot().unwrap();
    // Super-dispatch and the inherited slot layout survive the trip.
    assert_eq!(call(&mut engine, f, "fury", vec![]), Value::Int(35));
    assert_eq!(call(&mut engine, f, "health", vec![]), Value::Int(30));
    call(&mut engine, f, "sethp", vec![Value::Int(1)]);
    assert_eq!(call(&mut engine, f, "fury", vec![]), Value::Int(6));
}

#[test]
#[serial]
fn test_restore_rejects_corrupt_markers() {
    let (dir, mut engine) = world(&[("/boot.t", "init() { return 0; }\n")]);
    save_db(&mut engine, None).unwrap();
    drop(engine);

    let db_path = dir.path().join("world.db");
    let image = std::fs::read_to_string(&db_path).unwrap();
    // Drop the trailer; the restore must refuse to boot.
    let truncated = image.replace("db.END\n", "");
    std::fs::write(&db_path, truncated).unwrap();

    let mut engine = engine_for(&dir);
    let err = engine.boot().unwrap_err();
    assert!(err.to_string().contains("corrupt"), "{}", err);
}

#[test]
#[serial]
fn test_restore_rejects_bad_magic() {
    let (dir, mut engine) = world(&[("/boot.t", "init() { return 0; }\n")]);
    save_db(&mut engine, None).unwrap();
    drop(engine);

    let db_path = dir.path().join("world.db");
    std::fs::write(&db_path, "not a database\n").unwrap();
    let mut engine = engine_for(&dir);
    assert!(engine.boot().is_err());
}

#[test]
#[serial]
fn test_garbage_slots_survive_checkpoint() {
    let (dir, mut engine) = world(&[("/boot.t", STRING_WORLD)]);
    let a = clone_of(&mut engine, "/boot");
    let b = clone_of(&mut engine, "/boot");
    call(&mut engine, b, "set", vec![Value::Str("second".into())]);
    engine.queues.queue_for_destruct(a);
    tern_runtime::queues::handle_destruct(&mut engine);
    assert!(!engine.store.is_live(a));

    save_db(&mut engine, None).unwrap();
    drop(engine);

    let mut engine = engine_for(&dir);
    engine.boot().unwrap();
    // The garbage slot is preserved (stable handles) and back on the
    // free list: the next clone reuses it.
    assert!(!engine.store.is_live(a));
    assert!(engine.store.get(a).unwrap().flags.contains(ObjFlags::GARBAGE));
    assert_eq!(call(&mut engine, b, "get", vec![]), Value::Str("second".into()));
    let reused = clone_of(&mut engine, "/boot");
    assert_eq!(reused, a);
}

#[test]
#[serial]
fn test_save_db_after_eviction_flushes_log() {
    let (dir, mut engine) = world(&[("/boot.t", STRING_WORLD)]);
    let a = clone_of(&mut engine, "/boot");
    let b = clone_of(&mut engine, "/boot");
    call(&mut engine, a, "set", vec![Value::Str("logged".into())]);
    call(&mut engine, b, "set", vec![Value::Str("resident".into())]);
    engine.cache.cap = 1;
    cache::unload_to_cap(&mut engine);
    // One payload now lives only in the transaction log; the checkpoint
    // must fold it into the image before the rename.
    save_db(&mut engine, None).unwrap();
    assert!(!dir.path().join("transact.log").exists());
    drop(engine);

    let mut engine = engine_for(&dir);
    engine.boot().unwrap();
    assert_eq!(call(&mut engine, a, "get", vec![]), Value::Str("logged".into()));
    assert_eq!(call(&mut engine, b, "get", vec![]), Value::Str("resident".into()));
}

#[test]
#[serial]
fn test_save_object_restore_object() {
    let (_dir, mut engine) = world(&[(
        "/boot.t",
        "int gold;\n\
         string title;\n\
         setup() { gold = 250; title = \"baron\"; }\n\
         wipe() { gold = 0; title = 0; }\n\
         save_me() { return save_object(\"/save.o\"); }\n\
         load_me() { return restore_object(\"/save.o\"); }\n\
         gold_now() { return gold; }\n\
         title_now() { return title; }\n",
    )]);
    let obj = clone_of(&mut engine, "/boot");
    call(&mut engine, obj, "setup", vec![]);
    assert_eq!(call(&mut engine, obj, "save_me", vec![]), Value::Int(0));
    call(&mut engine, obj, "wipe", vec![]);
    assert_eq!(call(&mut engine, obj, "gold_now", vec![]), Value::Int(0));
    let restored = call(&mut engine, obj, "load_me", vec![]);
    assert_eq!(restored, Value::Int(2));
    assert_eq!(call(&mut engine, obj, "gold_now", vec![]), Value::Int(250));
    assert_eq!(call(&mut engine, obj, "title_now", vec![]), Value::Str("baron".into()));
}

#[test]
#[serial]
fn test_object_handles_stay_stable_across_restore() {
    let (dir, mut engine) = world(&[("/boot.t", STRING_WORLD)]);
    let ids: Vec<ObjRef> = (0..5).map(|_| clone_of(&mut engine, "/boot")).collect();
    for (i, id) in ids.iter().enumerate() {
        call(&mut engine, *id, "set", vec![Value::Str(format!("obj{}", i))]);
    }
    save_db(&mut engine, None).unwrap();
    drop(engine);

    let mut engine = engine_for(&dir);
    engine.boot().unwrap();
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(
            call(&mut engine, *id, "get", vec![]),
            Value::Str(format!("obj{}", i))
        );
    }
}
