//! The outer loop
//!
//! One cooperative tick: wait for I/O (the poll deadline is the soonest
//! alarm), frame incoming lines into commands, then drain the queues in
//! their contractual order - destructions, due alarms, commands, then
//! destructions and alarms once more - and finally evict the cache back
//! toward its soft cap. All user-visible computation happens
//! synchronously inside this loop; no opcode ever blocks it.

use crate::db;
use crate::engine::{Engine, RunState, MASTER};
use crate::net::NetEvent;
use crate::object::ObjFlags;
use crate::queues::{handle_alarm, handle_command, handle_destruct};
use crate::telnet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tern_core::Value;

const MAX_POLL_MS: i32 = 1000;

/// Run until shutdown or panic. Returns the process exit code. A
/// nonzero value in `signal` (set from a signal handler) is treated as
/// a shutdown request at the next tick boundary.
pub fn run(engine: &mut Engine, signal: Option<&AtomicUsize>) -> i32 {
    if !engine.conns.is_listening() {
        if let Err(e) = engine.conns.listen(engine.config.port) {
            tracing::error!(port = engine.config.port, error = %e, "cannot listen");
            return 1;
        }
    }
    loop {
        if let Some(flag) = signal {
            if flag.load(Ordering::SeqCst) != 0 && engine.run_state == RunState::Running {
                tracing::info!("signal received; shutting down");
                engine.run_state = RunState::ShutdownRequested;
            }
        }
        engine.refresh_clock();
        let timeout = poll_timeout(engine);
        let now = engine.now_time;
        let events = engine.conns.pump(timeout, now);
        engine.refresh_clock();

        for event in events {
            match event {
                NetEvent::Connected(dev) => {
                    if engine.config.single && engine.conns.count() > 1 {
                        engine.conns.send(dev, "Single-user mode; try again later.\n");
                        engine.conns.flush(dev);
                        engine.conns.disconnect(dev);
                        continue;
                    }
                    greet_connection(engine, dev);
                }
                NetEvent::Line(dev, line) => {
                    let obj = engine.conns.get(dev).and_then(|c| c.obj);
                    match obj {
                        Some(obj) => engine.queues.queue_command(obj, line),
                        None => tracing::debug!(dev, "line from unattached device dropped"),
                    }
                }
                NetEvent::Gone(dev) => {
                    if let Some(obj) = engine.conns.get(dev).and_then(|c| c.obj) {
                        if let Some(o) = engine.store.live_mut(obj) {
                            o.devnum = None;
                            o.flags.remove(ObjFlags::CONNECTED);
                        }
                        engine.dirty(obj);
                    }
                    tracing::info!(dev, "connection closed");
                }
            }
        }
        advertise_mssp(engine);

        handle_destruct(engine);
        handle_alarm(engine);
        handle_command(engine);
        handle_destruct(engine);
        handle_alarm(engine);

        match engine.run_state {
            RunState::Running => {}
            RunState::SaveRequested => {
                engine.run_state = RunState::Running;
                if let Err(e) = db::save_db(engine, None) {
                    tracing::error!(error = %e, "checkpoint failed");
                    db::fatal_panic(engine, "checkpoint write failure");
                }
            }
            RunState::ShutdownRequested => {
                tracing::info!("shutdown requested");
                if let Err(e) = db::save_db(engine, None) {
                    tracing::error!(error = %e, "final checkpoint failed");
                    return 1;
                }
                return 0;
            }
            RunState::PanicRequested => {
                // fatal_panic already wrote the panic image if it could;
                // a sysctl-driven panic still needs the write.
                let panic_path = engine.config.panic_path.clone();
                let _ = db::save_db(engine, Some(&panic_path));
                return 2;
            }
        }

        let evicted = crate::cache::unload_to_cap(engine);
        if evicted > 0 {
            tracing::debug!(evicted, resident = engine.cache.resident_count(), "evicted");
        }
        // A transaction log past its soft cap is folded into a fresh
        // checkpoint on the next tick.
        if engine.config.xlog_size > 0
            && engine.cache.log_top > engine.config.xlog_size
            && engine.run_state == RunState::Running
        {
            tracing::info!(bytes = engine.cache.log_top, "transaction log over cap");
            engine.run_state = RunState::SaveRequested;
        }
    }
}

fn poll_timeout(engine: &Engine) -> i32 {
    match engine.queues.next_alarm_deadline() {
        Some(deadline) => {
            let wait = (deadline - engine.now_time).max(0) * 1000;
            wait.min(MAX_POLL_MS as i64) as i32
        }
        None => MAX_POLL_MS,
    }
}

/// A fresh connection asks the master for a login object; the device
/// attaches to whatever object `connect()` returns.
fn greet_connection(engine: &mut Engine, dev: usize) {
    let login = engine
        .call_named(MASTER, "connect", None, None, Vec::new())
        .unwrap_or_else(Value::zero);
    match login {
        Value::Obj(obj) if engine.store.is_live(obj) => {
            let now = engine.now_time;
            if let Some(conn) = engine.conns.get_mut(dev) {
                conn.obj = Some(obj);
                conn.connect_time = now;
            }
            if let Some(o) = engine.store.live_mut(obj) {
                o.devnum = Some(dev);
                o.flags.insert(ObjFlags::CONNECTED | ObjFlags::INTERACTIVE);
            }
            engine.dirty(obj);
            // The login object announces itself.
            engine.call_named(obj, "logon", Some(obj), None, Vec::new());
        }
        _ => {
            tracing::warn!(dev, "master has no login object; dropping connection");
            engine.conns.send(dev, "This world is not accepting connections.\n");
            engine.conns.flush(dev);
            engine.conns.disconnect(dev);
        }
    }
}

/// Answer DO MSSP once per connection with the server-identifying
/// variable set.
fn advertise_mssp(engine: &mut Engine) {
    let devices = engine.conns.devices();
    for dev in devices {
        let wants = engine
            .conns
            .get(dev)
            .map(|c| c.telnet.wants_mssp && !c.mssp_sent)
            .unwrap_or(false);
        if !wants {
            continue;
        }
        let vars = vec![
            ("NAME".to_string(), engine.config.title.clone()),
            ("PLAYERS".to_string(), engine.conns.count().to_string()),
            (
                "UPTIME".to_string(),
                (engine.now_time - engine.boot_time).to_string(),
            ),
            ("PORT".to_string(), engine.config.port.to_string()),
            ("FAMILY".to_string(), "Tern".to_string()),
        ];
        let payload = telnet::mssp_payload(&vars);
        engine.conns.send_raw(dev, &payload);
        if let Some(conn) = engine.conns.get_mut(dev) {
            conn.mssp_sent = true;
        }
    }
}
