//! Pending-work queues and their drain protocols
//!
//! Three queues drive all user-visible computation: a command FIFO, an
//! unordered destruction list, and an alarm list kept sorted by
//! deadline (ties fire in insertion order). A destruction queued during
//! any handler drains before the next event of any kind; the scheduler
//! interleaves the drains between I/O wakes.

use crate::engine::Engine;
use crate::object::{ObjFlags, ObjState, Verb};
use std::collections::VecDeque;
use tern_core::{ObjRef, Value};

#[derive(Debug, Clone)]
pub struct Alarm {
    pub obj: ObjRef,
    pub deadline: i64,
    pub func: String,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct Queues {
    pub cmd: VecDeque<(ObjRef, String)>,
    pub dest: Vec<ObjRef>,
    alarms: Vec<Alarm>,
    next_seq: u64,
}

impl Queues {
    pub fn new() -> Queues {
        Queues::default()
    }

    pub fn queue_command(&mut self, obj: ObjRef, cmd: String) {
        self.cmd.push_back((obj, cmd));
    }

    pub fn queue_for_destruct(&mut self, obj: ObjRef) {
        if !self.dest.contains(&obj) {
            self.dest.push(obj);
        }
    }

    /// Insert an alarm at its deadline position; equal deadlines keep
    /// insertion order.
    pub fn queue_alarm(&mut self, obj: ObjRef, deadline: i64, func: String) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let alarm = Alarm {
            obj,
            deadline,
            func,
            seq,
        };
        let at = self
            .alarms
            .partition_point(|a| (a.deadline, a.seq) <= (deadline, seq));
        self.alarms.insert(at, alarm);
    }

    /// Remove the first alarm on `obj` (matching `func` when given).
    /// Returns its remaining delay relative to `now`.
    pub fn remove_alarm(&mut self, obj: ObjRef, func: Option<&str>, now: i64) -> Option<i64> {
        let pos = self
            .alarms
            .iter()
            .position(|a| a.obj == obj && func.map(|f| a.func == f).unwrap_or(true))?;
        let alarm = self.alarms.remove(pos);
        Some((alarm.deadline - now).max(0))
    }

    /// Drop every command and alarm targeting `obj` (destruct protocol).
    pub fn purge_for(&mut self, obj: ObjRef) {
        self.cmd.retain(|(o, _)| *o != obj);
        self.alarms.retain(|a| a.obj != obj);
    }

    pub fn next_alarm_deadline(&self) -> Option<i64> {
        self.alarms.first().map(|a| a.deadline)
    }

    pub fn alarms(&self) -> &[Alarm] {
        &self.alarms
    }

    pub fn commands(&self) -> &VecDeque<(ObjRef, String)> {
        &self.cmd
    }
}

// ---- destruction -----------------------------------------------------

/// Drain the destruction list until empty. For each object: cancel its
/// input redirection, purge its commands and alarms, cascade prototype
/// destruction through all clones, clear every global slot (dropping
/// outgoing back-references), null every inbound reference and dirty
/// the holders, unlink containment and attachment, free the verb list,
/// and return the slot to the free list flagged GARBAGE.
pub fn handle_destruct(engine: &mut Engine) {
    while let Some(target) = engine.queues.dest.pop() {
        if !engine.store.is_live(target) {
            continue;
        }
        tracing::info!(
            obj = %target,
            path = %engine.pathname_of(target),
            "destructing"
        );
        // Device teardown first: pending input can never fire again.
        if let Some(dev) = engine.store.get(target).and_then(|o| o.devnum) {
            engine.conns.disconnect(dev);
        }
        if let Some(obj) = engine.store.get_mut(target) {
            obj.devnum = None;
            obj.input_func = None;
            obj.input_func_obj = None;
            obj.flags.remove(ObjFlags::CONNECTED);
        }
        engine.queues.purge_for(target);

        let proto_id = engine.store.get(target).and_then(|o| o.proto);
        let is_proto = engine
            .store
            .get(target)
            .map(|o| o.flags.contains(ObjFlags::PROTOTYPE))
            .unwrap_or(false);
        if is_proto {
            // Every clone goes first, recursively.
            let mut child = engine.store.get(target).and_then(|o| o.next_child);
            while let Some(c) = child {
                engine.queues.queue_for_destruct(c);
                child = engine.store.get(c).and_then(|o| o.next_child);
            }
            handle_destruct(engine);
            if let Some(id) = proto_id {
                engine.protos.remove(id);
            }
        } else if let Some(id) = proto_id {
            if let Some(head) = engine.protos.get(id).map(|p| p.proto_obj) {
                engine.store.unlink_child(head, target);
            }
        }

        // Clear our own slots; write_global unhooks outgoing backrefs.
        engine.load_data(target);
        let num_globals = engine
            .store
            .get(target)
            .and_then(|o| o.data.as_ref())
            .map(|d| d.globals.len())
            .unwrap_or(0);
        for slot in 0..num_globals {
            let _ = engine.write_global(target, slot as u32, Value::zero());
        }
        // Null inbound references and dirty each holder.
        let inbound = engine
            .store
            .get_mut(target)
            .and_then(|o| o.data.as_mut())
            .map(|d| std::mem::take(&mut d.refd_by))
            .unwrap_or_default();
        for (holder, slot) in inbound {
            if !engine.store.is_live(holder) {
                continue;
            }
            engine.load_data(holder);
            if let Some(h) = engine.store.get_mut(holder) {
                h.state = ObjState::Dirty;
                if let Some(data) = h.data.as_mut() {
                    if let Some(cell) = data.globals.get_mut(slot as usize) {
                        *cell = Value::zero();
                    }
                }
            }
        }

        // Attachment unlinking, both directions.
        let attachees = engine
            .store
            .get_mut(target)
            .map(|o| std::mem::take(&mut o.attachees))
            .unwrap_or_default();
        for a in attachees {
            if let Some(o) = engine.store.get_mut(a) {
                o.attacher = None;
            }
        }
        engine.store.detach(target);

        // Spill contents into our location (or into nowhere).
        let new_home = engine.store.get(target).and_then(|o| o.location);
        let mut item = engine.store.get(target).and_then(|o| o.contents);
        while let Some(i) = item {
            let next = engine.store.get(i).and_then(|o| o.next_object);
            if let Some(o) = engine.store.get_mut(i) {
                o.location = None;
                o.next_object = None;
            }
            if let Some(home) = new_home {
                engine.store.link_location(i, home);
            }
            item = next;
        }
        if let Some(o) = engine.store.get_mut(target) {
            o.contents = None;
        }
        engine.store.unlink_location(target);

        if let Some(o) = engine.store.get_mut(target) {
            o.verbs.clear();
        }
        crate::cache::unload_object(engine, target);
        engine.store.release(target);
    }
}

// ---- alarms ----------------------------------------------------------

/// Fire every alarm whose deadline has been reached, in deadline order.
/// The soft cycle counter resets per alarm, and destructions queued by
/// a handler drain before the next alarm fires.
pub fn handle_alarm(engine: &mut Engine) {
    loop {
        let due_now = engine
            .queues
            .alarms
            .first()
            .map(|a| a.deadline <= engine.now_time)
            .unwrap_or(false);
        if !due_now {
            return;
        }
        let due = engine.queues.alarms.remove(0);
        engine.cycles.soft = 0;
        if let Some((func, definer)) = engine.find_function(due.obj, &due.func, false) {
            engine.call_boundary(due.obj, func, definer, None, None, Vec::new());
        }
        handle_destruct(engine);
    }
}

// ---- commands and verbs ----------------------------------------------

/// Drain the command FIFO. A pending input-function consumes the whole
/// line (one-shot, swapped out before the handler runs so a re-entrant
/// handler can set a new redirection); otherwise the line goes through
/// verb resolution against the player's location, its other contents,
/// the player's inventory, and the player itself.
pub fn handle_command(engine: &mut Engine) {
    while let Some((player, cmd)) = engine.queues.cmd.pop_front() {
        if !engine.store.is_live(player) {
            continue;
        }
        engine.cycles.soft = 0;
        let redirect = engine.store.get_mut(player).and_then(|o| {
            o.input_func.take().map(|f| (f, o.input_func_obj.take()))
        });
        if let Some((funcname, target)) = redirect {
            let target_obj = target.unwrap_or(player);
            if let Some((func, definer)) = engine.find_function(target_obj, &funcname, false) {
                let arg = if cmd.is_empty() {
                    Value::zero()
                } else {
                    Value::Str(cmd)
                };
                engine.call_boundary(target_obj, func, definer, Some(player), None, vec![arg]);
            }
            handle_destruct(engine);
            continue;
        }

        let trimmed_start = cmd.trim_start_matches(' ');
        let word_len = trimmed_start.find(' ').unwrap_or(trimmed_start.len());
        let vname = &trimmed_start[..word_len];
        let lead = cmd.len() - trimmed_start.len();
        let mut disp = lead + word_len;
        while cmd[disp..].starts_with(' ') {
            disp += 1;
        }

        engine.verbs_changed = false;
        let mut done = false;
        let localverbs = engine
            .store
            .get(player)
            .map(|o| o.flags.contains(ObjFlags::LOCALVERBS))
            .unwrap_or(false);
        if !localverbs {
            let location = engine.store.get(player).and_then(|o| o.location);
            if let Some(loc) = location {
                done = find_verb(engine, player, loc, vname, &cmd, disp);
                let mut sibling = engine.store.get(loc).and_then(|o| o.contents);
                while let (false, Some(s)) = (done, sibling) {
                    if s != player {
                        done = find_verb(engine, player, s, vname, &cmd, disp);
                    }
                    sibling = engine.store.get(s).and_then(|o| o.next_object);
                }
            }
            let mut item = engine.store.get(player).and_then(|o| o.contents);
            while let (false, Some(i)) = (done, item) {
                done = find_verb(engine, player, i, vname, &cmd, disp);
                item = engine.store.get(i).and_then(|o| o.next_object);
            }
        }
        if !done {
            find_verb(engine, player, player, vname, &cmd, disp);
        }

        // Prompt discipline: interactive objects with no new input
        // redirection get a fresh prompt.
        let wants_prompt = engine
            .store
            .get(player)
            .map(|o| o.flags.contains(ObjFlags::INTERACTIVE) && o.input_func.is_none())
            .unwrap_or(false);
        if wants_prompt {
            if let Some(dev) = engine.store.get(player).and_then(|o| o.devnum) {
                engine.conns.send_prompt(dev, "> ");
            }
        }
        handle_destruct(engine);
    }
}

/// Try every verb on `obj` against the command: exact words first-class,
/// xverbs by prefix. The handler's nonzero return claims the command; a
/// handler that rewired any verb list claims it too (the iteration
/// cannot trust the list any more). The object's own verbs are searched
/// before its prototype's.
pub fn find_verb(
    engine: &mut Engine,
    player: ObjRef,
    obj: ObjRef,
    vname: &str,
    cmd: &str,
    disp: usize,
) -> bool {
    let Some(o) = engine.store.live(obj) else {
        return false;
    };
    if o.flags.contains(ObjFlags::INTERACTIVE) && player != obj {
        return false;
    }
    let mut candidates: Vec<Verb> = o.verbs.clone();
    if !o.flags.contains(ObjFlags::PROTOTYPE) {
        if let Some(proto_obj) = engine.proto_of(obj).map(|p| p.proto_obj) {
            if proto_obj != obj {
                if let Some(po) = engine.store.live(proto_obj) {
                    candidates.extend(po.verbs.iter().cloned());
                }
            }
        }
    }
    for verb in candidates {
        let arg: Option<String> = if verb.is_xverb {
            if verb.name.is_empty() || cmd.trim_start_matches(' ').starts_with(&verb.name) {
                let rest = cmd.trim_start_matches(' ');
                Some(rest[verb.name.len().min(rest.len())..].to_string())
            } else {
                None
            }
        } else if verb.name == vname {
            Some(cmd[disp.min(cmd.len())..].to_string())
        } else {
            None
        };
        let Some(arg) = arg else { continue };
        let Some((func, definer)) = engine.find_function(obj, &verb.func, false) else {
            continue;
        };
        let argv = if arg.is_empty() {
            Value::zero()
        } else {
            Value::Str(arg)
        };
        let result = engine.call_boundary(obj, func, definer, Some(player), None, vec![argv]);
        let matched = result.is_true() || (!verb.is_xverb && engine.verbs_changed);
        if matched {
            if let Some(o) = engine.store.live_mut(obj) {
                if !o.flags.intersects(ObjFlags::INTERACTIVE | ObjFlags::PROTOTYPE) {
                    o.last_access = engine.now_time;
                }
            }
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alarm_ordering() {
        let mut q = Queues::new();
        let a = ObjRef(1);
        q.queue_alarm(a, 30, "late".into());
        q.queue_alarm(a, 10, "early".into());
        q.queue_alarm(a, 10, "early2".into());
        let order: Vec<&str> = q.alarms().iter().map(|x| x.func.as_str()).collect();
        // Deadline order; equal deadlines keep insertion order.
        assert_eq!(order, vec!["early", "early2", "late"]);
        assert_eq!(q.next_alarm_deadline(), Some(10));
    }

    #[test]
    fn test_remove_alarm_by_name() {
        let mut q = Queues::new();
        let a = ObjRef(1);
        q.queue_alarm(a, 100, "tick".into());
        q.queue_alarm(a, 200, "tock".into());
        assert_eq!(q.remove_alarm(a, Some("tock"), 50), Some(150));
        assert_eq!(q.remove_alarm(a, Some("tock"), 50), None);
        assert_eq!(q.alarms().len(), 1);
    }

    #[test]
    fn test_purge_for_object() {
        let mut q = Queues::new();
        let (a, b) = (ObjRef(1), ObjRef(2));
        q.queue_command(a, "north".into());
        q.queue_command(b, "south".into());
        q.queue_alarm(a, 5, "beat".into());
        q.purge_for(a);
        assert_eq!(q.commands().len(), 1);
        assert_eq!(q.commands()[0].0, b);
        assert!(q.alarms().is_empty());
    }

    #[test]
    fn test_command_fifo_order() {
        let mut q = Queues::new();
        let a = ObjRef(1);
        q.queue_command(a, "one".into());
        q.queue_command(a, "two".into());
        assert_eq!(q.cmd.pop_front().unwrap().1, "one");
        assert_eq!(q.cmd.pop_front().unwrap().1, "two");
    }
}
