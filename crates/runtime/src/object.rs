//! The object store
//!
//! Objects live in one growable table with stable handles; destructed
//! slots are threaded onto a free list (through `next_object`) and
//! reused, so handles stay small and dense. Containment and attachment
//! are intrusive singly-linked lists over handles, redundant in both
//! directions, which keeps link and unlink constant-time.
//!
//! The heavy per-object payload (the global-slot vector and the
//! back-reference list) is an `Option<ObjData>`: `Some` only while the
//! object is resident. The cache layer decides when to drop it.

use bitflags::bitflags;
use tern_core::{ObjRef, Value};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjFlags: u32 {
        const CONNECTED   = 1 << 0;
        const INTERACTIVE = 1 << 1;
        const LOCALVERBS  = 1 << 2;
        const PRIV        = 1 << 3;
        const PROTOTYPE   = 1 << 4;
        const IN_EDITOR   = 1 << 5;
        const RESIDENT    = 1 << 6;
        const GARBAGE     = 1 << 7;
    }
}

/// Cache state lattice. `Dirty` has never been written anywhere this
/// session; `InDb`/`InCache` name where the last clean payload bytes
/// live (checkpoint vs transaction log) while not resident;
/// `FromDb`/`FromCache` are the resident-and-unmodified counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjState {
    Dirty,
    InDb,
    InCache,
    FromDb,
    FromCache,
}

impl ObjState {
    /// Persisted numeric tag (kept stable for the checkpoint format).
    pub fn tag(self) -> u8 {
        match self {
            ObjState::Dirty => 0,
            ObjState::FromDb => 2,
            ObjState::InDb => 3,
            ObjState::FromCache => 6,
            ObjState::InCache => 7,
        }
    }
}

/// A verb binding: a command word mapped to a function on the object.
/// An xverb matches by prefix instead of exact word.
#[derive(Debug, Clone, PartialEq)]
pub struct Verb {
    pub name: String,
    pub is_xverb: bool,
    pub func: String,
}

/// Resident payload: the global-slot vector plus the back-reference
/// list recording which other objects' slots point here.
#[derive(Debug, Default)]
pub struct ObjData {
    pub globals: Vec<Value>,
    pub refd_by: Vec<(ObjRef, u32)>,
}

/// Index of a prototype in the prototype table.
pub type ProtoId = usize;

#[derive(Debug)]
pub struct Object {
    pub flags: ObjFlags,
    pub proto: Option<ProtoId>,
    pub next_child: Option<ObjRef>,
    pub location: Option<ObjRef>,
    pub contents: Option<ObjRef>,
    pub next_object: Option<ObjRef>,
    pub attacher: Option<ObjRef>,
    pub attachees: Vec<ObjRef>,
    pub verbs: Vec<Verb>,
    pub state: ObjState,
    /// Offset of the payload in its current home (checkpoint or log).
    pub file_offset: u64,
    /// Pending one-shot input redirection: function name, and the object
    /// the function lives on for input_to() (None means self).
    pub input_func: Option<String>,
    pub input_func_obj: Option<ObjRef>,
    /// Connection id, when a device is attached.
    pub devnum: Option<usize>,
    pub data: Option<ObjData>,
    pub last_access: i64,
}

impl Object {
    fn fresh() -> Object {
        Object {
            flags: ObjFlags::empty(),
            proto: None,
            next_child: None,
            location: None,
            contents: None,
            next_object: None,
            attacher: None,
            attachees: Vec::new(),
            verbs: Vec::new(),
            state: ObjState::Dirty,
            file_offset: 0,
            input_func: None,
            input_func_obj: None,
            devnum: None,
            data: None,
            last_access: 0,
        }
    }

    pub fn is_garbage(&self) -> bool {
        self.flags.contains(ObjFlags::GARBAGE)
    }
}

#[derive(Debug, Default)]
pub struct ObjectStore {
    objects: Vec<Object>,
    free_head: Option<ObjRef>,
}

impl ObjectStore {
    pub fn new() -> ObjectStore {
        ObjectStore {
            objects: Vec::new(),
            free_head: None,
        }
    }

    /// Total table size, including garbage slots (the persisted
    /// `db_top`).
    pub fn db_top(&self) -> usize {
        self.objects.len()
    }

    /// Allocate a slot, reusing the free list first.
    pub fn alloc(&mut self) -> ObjRef {
        if let Some(r) = self.free_head {
            self.free_head = self.objects[r.index()].next_object;
            self.objects[r.index()] = Object::fresh();
            return r;
        }
        self.objects.push(Object::fresh());
        ObjRef(self.objects.len() as u32 - 1)
    }

    /// Return a destructed slot to the free list. The caller has already
    /// stripped links and payload; this sets the terminal flag.
    pub fn release(&mut self, r: ObjRef) {
        let obj = &mut self.objects[r.index()];
        obj.flags = ObjFlags::GARBAGE;
        obj.state = ObjState::Dirty;
        obj.proto = None;
        obj.data = None;
        obj.next_object = self.free_head;
        self.free_head = Some(r);
    }

    /// Rebuild the free list from GARBAGE flags (used after a restore).
    pub fn rebuild_free_list(&mut self) {
        self.free_head = None;
        for i in (0..self.objects.len()).rev() {
            if self.objects[i].is_garbage() {
                self.objects[i].next_object = self.free_head;
                self.free_head = Some(ObjRef(i as u32));
            }
        }
    }

    pub fn get(&self, r: ObjRef) -> Option<&Object> {
        self.objects.get(r.index())
    }

    pub fn get_mut(&mut self, r: ObjRef) -> Option<&mut Object> {
        self.objects.get_mut(r.index())
    }

    /// Live (non-garbage) object lookup.
    pub fn live(&self, r: ObjRef) -> Option<&Object> {
        self.objects.get(r.index()).filter(|o| !o.is_garbage())
    }

    pub fn live_mut(&mut self, r: ObjRef) -> Option<&mut Object> {
        self.objects.get_mut(r.index()).filter(|o| !o.is_garbage())
    }

    pub fn is_live(&self, r: ObjRef) -> bool {
        self.live(r).is_some()
    }

    pub fn iter_refs(&self) -> impl Iterator<Item = ObjRef> + '_ {
        (0..self.objects.len() as u32).map(ObjRef)
    }

    /// Grow the table to exactly `n` fresh slots (restore path).
    pub fn resize_for_restore(&mut self, n: usize) {
        self.objects.clear();
        self.free_head = None;
        for _ in 0..n {
            self.objects.push(Object::fresh());
        }
    }

    // ---- containment -------------------------------------------------

    /// Unlink `item` from its current location's contents list.
    pub fn unlink_location(&mut self, item: ObjRef) {
        let Some(loc) = self.objects[item.index()].location else {
            return;
        };
        let mut prev: Option<ObjRef> = None;
        let mut curr = self.objects[loc.index()].contents;
        while let Some(c) = curr {
            if c == item {
                let next = self.objects[c.index()].next_object;
                match prev {
                    Some(p) => self.objects[p.index()].next_object = next,
                    None => self.objects[loc.index()].contents = next,
                }
                break;
            }
            prev = curr;
            curr = self.objects[c.index()].next_object;
        }
        let obj = &mut self.objects[item.index()];
        obj.location = None;
        obj.next_object = None;
    }

    /// Move `item` into `dest`'s contents (prepend, constant time).
    pub fn link_location(&mut self, item: ObjRef, dest: ObjRef) {
        self.unlink_location(item);
        let head = self.objects[dest.index()].contents;
        let obj = &mut self.objects[item.index()];
        obj.location = Some(dest);
        obj.next_object = head;
        self.objects[dest.index()].contents = Some(item);
    }

    /// Would placing `item` inside `dest` create a containment cycle?
    pub fn would_cycle(&self, item: ObjRef, dest: ObjRef) -> bool {
        let mut cursor = Some(dest);
        while let Some(c) = cursor {
            if c == item {
                return true;
            }
            cursor = self.objects[c.index()].location;
        }
        false
    }

    // ---- attachment --------------------------------------------------

    pub fn attach(&mut self, attachee: ObjRef, attacher: ObjRef) {
        self.detach(attachee);
        self.objects[attachee.index()].attacher = Some(attacher);
        self.objects[attacher.index()].attachees.push(attachee);
    }

    pub fn detach(&mut self, attachee: ObjRef) {
        if let Some(a) = self.objects[attachee.index()].attacher.take() {
            self.objects[a.index()].attachees.retain(|x| *x != attachee);
        }
    }

    // ---- sibling (clone) list ----------------------------------------

    /// Unlink `obj` from its prototype's child chain, given the chain
    /// head object.
    pub fn unlink_child(&mut self, head: ObjRef, obj: ObjRef) {
        let mut prev = head;
        let mut curr = self.objects[head.index()].next_child;
        while let Some(c) = curr {
            if c == obj {
                self.objects[prev.index()].next_child = self.objects[c.index()].next_child;
                self.objects[c.index()].next_child = None;
                return;
            }
            prev = c;
            curr = self.objects[c.index()].next_child;
        }
    }

    // ---- back-references ---------------------------------------------

    /// Record that `holder`'s slot `slot` now points at `target`.
    /// Requires `target` to be resident.
    pub fn add_backref(&mut self, target: ObjRef, holder: ObjRef, slot: u32) {
        if let Some(data) = self.objects[target.index()].data.as_mut() {
            data.refd_by.push((holder, slot));
        }
    }

    /// Remove exactly one back-entry `(holder, slot)` from `target`.
    pub fn remove_backref(&mut self, target: ObjRef, holder: ObjRef, slot: u32) {
        if let Some(data) = self.objects[target.index()].data.as_mut() {
            if let Some(pos) = data
                .refd_by
                .iter()
                .position(|(h, s)| *h == holder && *s == slot)
            {
                data.refd_by.swap_remove(pos);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(n: usize) -> (ObjectStore, Vec<ObjRef>) {
        let mut s = ObjectStore::new();
        let refs = (0..n).map(|_| s.alloc()).collect();
        (s, refs)
    }

    #[test]
    fn test_alloc_reuses_free_slots() {
        let (mut s, refs) = store_with(3);
        assert_eq!(s.db_top(), 3);
        s.release(refs[1]);
        assert!(!s.is_live(refs[1]));
        let again = s.alloc();
        assert_eq!(again, refs[1]);
        assert_eq!(s.db_top(), 3);
        assert!(s.is_live(again));
    }

    #[test]
    fn test_containment_links() {
        let (mut s, r) = store_with(3);
        let (room, a, b) = (r[0], r[1], r[2]);
        s.link_location(a, room);
        s.link_location(b, room);
        // Prepend order: b is the head.
        assert_eq!(s.get(room).unwrap().contents, Some(b));
        assert_eq!(s.get(b).unwrap().next_object, Some(a));
        assert_eq!(s.get(a).unwrap().location, Some(room));
        s.unlink_location(b);
        assert_eq!(s.get(room).unwrap().contents, Some(a));
        assert_eq!(s.get(b).unwrap().location, None);
    }

    #[test]
    fn test_move_between_rooms() {
        let (mut s, r) = store_with(3);
        let (room1, room2, item) = (r[0], r[1], r[2]);
        s.link_location(item, room1);
        s.link_location(item, room2);
        assert_eq!(s.get(room1).unwrap().contents, None);
        assert_eq!(s.get(room2).unwrap().contents, Some(item));
        assert_eq!(s.get(item).unwrap().location, Some(room2));
    }

    #[test]
    fn test_containment_cycle_detection() {
        let (mut s, r) = store_with(3);
        let (bag, box_, room) = (r[0], r[1], r[2]);
        s.link_location(bag, room);
        s.link_location(box_, bag);
        assert!(s.would_cycle(room, box_));
        assert!(s.would_cycle(bag, bag));
        assert!(!s.would_cycle(box_, room));
    }

    #[test]
    fn test_attachment_pairs() {
        let (mut s, r) = store_with(3);
        let (body, arm, leg) = (r[0], r[1], r[2]);
        s.attach(arm, body);
        s.attach(leg, body);
        assert_eq!(s.get(arm).unwrap().attacher, Some(body));
        assert_eq!(s.get(body).unwrap().attachees, vec![arm, leg]);
        s.detach(arm);
        assert_eq!(s.get(arm).unwrap().attacher, None);
        assert_eq!(s.get(body).unwrap().attachees, vec![leg]);
        // Re-attaching moves, never duplicates.
        s.attach(leg, arm);
        assert_eq!(s.get(body).unwrap().attachees, Vec::<ObjRef>::new());
        assert_eq!(s.get(arm).unwrap().attachees, vec![leg]);
    }

    #[test]
    fn test_backref_add_remove() {
        let (mut s, r) = store_with(2);
        let (holder, target) = (r[0], r[1]);
        s.get_mut(target).unwrap().data = Some(ObjData::default());
        s.add_backref(target, holder, 2);
        s.add_backref(target, holder, 5);
        s.remove_backref(target, holder, 2);
        let data = s.get(target).unwrap().data.as_ref().unwrap();
        assert_eq!(data.refd_by, vec![(holder, 5)]);
    }

    #[test]
    fn test_rebuild_free_list() {
        let (mut s, refs) = store_with(4);
        s.release(refs[0]);
        s.release(refs[2]);
        s.rebuild_free_list();
        // Lowest index first after rebuild.
        assert_eq!(s.alloc(), refs[0]);
        assert_eq!(s.alloc(), refs[2]);
    }
}
