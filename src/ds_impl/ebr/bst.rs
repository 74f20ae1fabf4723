use super::concurrent_set::ConcurrentSet;
use crossbeam_ebr::{unprotected, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;

use std::cmp::Ordering::{Equal, Greater, Less};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Key of the root sentinel. It is never a member of the set.
const SENTINEL: i32 = i32::MIN;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Direction {
    Left,
    Right,
}

impl Direction {
    /// The side of a node keyed `current` on which `target` belongs.
    ///
    /// Callers rule out a match before asking, so equal keys mean the tree is broken.
    #[inline]
    fn next(current: i32, target: i32) -> Self {
        match current.cmp(&target) {
            Less => Direction::Right,
            Greater => Direction::Left,
            Equal => panic!("no direction between equal keys {} and {}", current, target),
        }
    }
}

/// A tree node. `left`, `right` and `marked` are written only while `lock` is held;
/// `key` never changes.
struct Node {
    key: i32,
    left: Atomic<Node>,
    right: Atomic<Node>,
    marked: AtomicBool,
    lock: Mutex<()>,
}

impl Node {
    fn new(key: i32) -> Self {
        Self::with_children(key, Shared::null(), Shared::null())
    }

    fn with_children(key: i32, left: Shared<'_, Node>, right: Shared<'_, Node>) -> Self {
        Self {
            key,
            left: Atomic::from(left),
            right: Atomic::from(right),
            marked: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    #[inline]
    fn child(&self, dir: Direction) -> &Atomic<Node> {
        match dir {
            Direction::Left => &self.left,
            Direction::Right => &self.right,
        }
    }

    #[inline]
    fn load<'g>(&self, dir: Direction, guard: &'g Guard) -> Shared<'g, Node> {
        self.child(dir).load(Ordering::SeqCst, guard)
    }

    /// Must be called with `self.lock` held.
    #[inline]
    fn store(&self, dir: Direction, node: Shared<'_, Node>) {
        if let Some(node_ref) = unsafe { node.as_ref() } {
            debug_assert!(
                match dir {
                    Direction::Left => node_ref.key < self.key,
                    Direction::Right => node_ref.key > self.key,
                },
                "linking {} as {:?} child of {}",
                node_ref.key,
                dir,
                self.key
            );
        }
        self.child(dir).store(node, Ordering::SeqCst);
    }

    #[inline]
    fn is_marked(&self) -> bool {
        self.marked.load(Ordering::SeqCst)
    }

    /// Must be called with `self.lock` held. A marked node stays marked.
    #[inline]
    fn mark(&self) {
        self.marked.store(true, Ordering::SeqCst);
    }

    /// Checks, with both locks held, that `parent` still links to `child` on the side
    /// its key belongs and that neither has been removed.
    fn validate(parent: &Node, child: Shared<'_, Node>, guard: &Guard) -> bool {
        let child_ref = unsafe { child.deref() };
        if parent.is_marked() || child_ref.is_marked() {
            return false;
        }
        match parent.key.cmp(&child_ref.key) {
            Less => parent.load(Direction::Right, guard) == child,
            Greater => parent.load(Direction::Left, guard) == child,
            Equal => false,
        }
    }
}

/// Result of a lock-free descent.
struct Cursor<'g> {
    /// Parent of `curr` on the search path. Null iff `curr` is the root.
    pred: Shared<'g, Node>,
    /// Node holding the key if `found`, otherwise the last node visited.
    curr: Shared<'g, Node>,
    found: bool,
}

impl<'g> Cursor<'g> {
    /// Descends from `root` towards `key` without taking any lock, stopping at a node
    /// with the key or at a missing child.
    #[inline]
    fn search(root: Shared<'g, Node>, key: i32, guard: &'g Guard) -> Self {
        let mut cursor = Cursor {
            pred: Shared::null(),
            curr: root,
            found: false,
        };
        loop {
            let curr_node = unsafe { cursor.curr.deref() };
            if curr_node.key == key {
                cursor.found = true;
                return cursor;
            }
            let next = curr_node.load(Direction::next(curr_node.key, key), guard);
            if next.is_null() {
                return cursor;
            }
            cursor.pred = cursor.curr;
            cursor.curr = next;
        }
    }
}

/// Unbalanced binary search tree of `i32` keys with per-node locks and lock-free lookups.
///
/// Removed nodes are marked before they are unlinked, and handed to the epoch collector
/// by the removal that unlinked them.
pub struct BST {
    root: Atomic<Node>,
    /// Bumped by every removal that moves a successor's key up the tree. Lock-free
    /// descents that saw it change may have walked past the moved key and retry.
    relocations: AtomicUsize,
}

impl Default for BST {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BST {
    fn drop(&mut self) {
        unsafe {
            let mut stack = vec![self.root.load(Ordering::Relaxed, unprotected())];
            while let Some(node) = stack.pop() {
                if node.is_null() {
                    continue;
                }
                let node_ref = node.deref();
                stack.push(node_ref.left.load(Ordering::Relaxed, unprotected()));
                stack.push(node_ref.right.load(Ordering::Relaxed, unprotected()));
                drop(node.into_owned());
            }
        }
    }
}

impl BST {
    pub fn new() -> Self {
        Self {
            root: Atomic::new(Node::new(SENTINEL)),
            relocations: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn root<'g>(&self, guard: &'g Guard) -> Shared<'g, Node> {
        self.root.load(Ordering::Relaxed, guard)
    }

    pub fn contains(&self, key: i32, guard: &Guard) -> bool {
        if key == SENTINEL {
            debug!("contains: key {} is reserved", key);
            return false;
        }
        loop {
            let relocations = self.relocations.load(Ordering::SeqCst);
            let cursor = Cursor::search(self.root(guard), key, guard);
            let present = cursor.found && !unsafe { cursor.curr.deref() }.is_marked();
            if relocations == self.relocations.load(Ordering::SeqCst) {
                return present;
            }
            trace!("contains({}): successor relocated during descent, retrying", key);
        }
    }

    pub fn insert(&self, key: i32, guard: &Guard) -> bool {
        if key == SENTINEL {
            debug!("insert: key {} is reserved", key);
            return false;
        }
        loop {
            let cursor = Cursor::search(self.root(guard), key, guard);
            let curr = unsafe { cursor.curr.deref() };
            if cursor.found && !curr.is_marked() {
                return false;
            }

            let _curr_lock = curr.lock.lock();
            if curr.is_marked() {
                trace!("insert({}): parent {} was removed, retrying", key, curr.key);
                continue;
            }
            if curr.key == key {
                return false;
            }

            let dir = Direction::next(curr.key, key);
            if !curr.load(dir, guard).is_null() {
                trace!("insert({}): {:?} child of {} taken, retrying", key, dir, curr.key);
                continue;
            }

            // A concurrent removal may have moved a successor above `curr`, making it
            // the wrong parent for `key`. The relinked path is visible from the root.
            let recheck = Cursor::search(self.root(guard), key, guard);
            if recheck.curr != cursor.curr {
                trace!("insert({}): parent {} no longer on path, retrying", key, curr.key);
                continue;
            }

            curr.store(dir, Owned::new(Node::new(key)).into_shared(guard));
            return true;
        }
    }

    pub fn remove(&self, key: i32, guard: &Guard) -> bool {
        if key == SENTINEL {
            debug!("remove: key {} is reserved", key);
            return false;
        }
        loop {
            let relocations = self.relocations.load(Ordering::SeqCst);
            let cursor = Cursor::search(self.root(guard), key, guard);
            if !cursor.found {
                if relocations == self.relocations.load(Ordering::SeqCst) {
                    return false;
                }
                trace!("remove({}): successor relocated during descent, retrying", key);
                continue;
            }

            // The sentinel never matches, so a found node always has a parent.
            let pred = unsafe { cursor.pred.deref() };
            let curr = unsafe { cursor.curr.deref() };

            let _pred_lock = pred.lock.lock();
            let _curr_lock = curr.lock.lock();
            if !Node::validate(pred, cursor.curr, guard) {
                trace!("remove({}): {} -> {} changed, retrying", key, pred.key, curr.key);
                continue;
            }

            let curr_dir = Direction::next(pred.key, curr.key);
            let left = curr.load(Direction::Left, guard);
            let right = curr.load(Direction::Right, guard);

            match (left.is_null(), right.is_null()) {
                (true, true) => {
                    curr.mark();
                    pred.store(curr_dir, Shared::null());
                }
                (false, true) | (true, false) => {
                    let child = if left.is_null() { right } else { left };
                    let _child_lock = unsafe { child.deref() }.lock.lock();
                    if !Node::validate(curr, child, guard) {
                        trace!("remove({}): only child changed, retrying", key);
                        continue;
                    }
                    curr.mark();
                    pred.store(curr_dir, child);
                }
                (false, false) => {
                    if !self.replace_with_successor(pred, curr_dir, cursor.curr, guard) {
                        trace!("remove({}): successor changed, retrying", key);
                        continue;
                    }
                    return true;
                }
            }

            unsafe { guard.defer_destroy(cursor.curr) };
            return true;
        }
    }

    /// Removes `curr`, which has two children, by splicing a copy of its in-order
    /// successor into its place and then unlinking the successor.
    ///
    /// `pred` and `curr` are locked and validated by the caller. Returns `false` without
    /// modifying the tree if the successor changed before it could be locked.
    fn replace_with_successor<'g>(
        &self,
        pred: &Node,
        curr_dir: Direction,
        curr: Shared<'g, Node>,
        guard: &'g Guard,
    ) -> bool {
        let curr_node = unsafe { curr.deref() };
        let left = curr_node.load(Direction::Left, guard);
        let right = curr_node.load(Direction::Right, guard);

        let mut succ_pred = curr;
        let mut succ = right;
        loop {
            let next = unsafe { succ.deref() }.load(Direction::Left, guard);
            if next.is_null() {
                break;
            }
            succ_pred = succ;
            succ = next;
        }

        let succ_pred_node = unsafe { succ_pred.deref() };
        let succ_node = unsafe { succ.deref() };
        let adjacent = succ_pred == curr;

        // `curr` is already locked when it is the successor's parent.
        let _succ_pred_lock = if adjacent {
            None
        } else {
            Some(succ_pred_node.lock.lock())
        };
        let _succ_lock = succ_node.lock.lock();
        if !Node::validate(succ_pred_node, succ, guard)
            || !succ_node.load(Direction::Left, guard).is_null()
        {
            return false;
        }

        let succ_right = succ_node.load(Direction::Right, guard);
        let replacement = Owned::new(Node::with_children(
            succ_node.key,
            left,
            if adjacent { succ_right } else { right },
        ))
        .into_shared(guard);

        curr_node.mark();
        pred.store(curr_dir, replacement);
        self.relocations.fetch_add(1, Ordering::SeqCst);
        succ_node.mark();
        if !adjacent {
            succ_pred_node.store(Direction::Left, succ_right);
        }

        unsafe {
            guard.defer_destroy(curr);
            guard.defer_destroy(succ);
        }
        true
    }

    /// Visits every node below the sentinel. Only meaningful when quiescent.
    fn for_each_node<F: FnMut(&Node)>(&self, guard: &Guard, mut f: F) {
        let root = unsafe { self.root(guard).deref() };
        let mut stack = vec![root.load(Direction::Right, guard)];
        while let Some(node) = stack.pop() {
            if let Some(node_ref) = unsafe { node.as_ref() } {
                f(node_ref);
                stack.push(node_ref.load(Direction::Left, guard));
                stack.push(node_ref.load(Direction::Right, guard));
            }
        }
    }

    pub fn size(&self, guard: &Guard) -> usize {
        let mut size = 0;
        self.for_each_node(guard, |_| size += 1);
        size
    }

    pub fn key_sum(&self, guard: &Guard) -> i64 {
        let mut sum = 0i64;
        self.for_each_node(guard, |node| sum += node.key as i64);
        sum
    }
}

impl ConcurrentSet<i32> for BST {
    fn new() -> Self {
        BST::new()
    }

    #[inline(always)]
    fn contains(&self, key: &i32, guard: &Guard) -> bool {
        self.contains(*key, guard)
    }

    #[inline(always)]
    fn insert(&self, key: i32, guard: &Guard) -> bool {
        self.insert(key, guard)
    }

    #[inline(always)]
    fn remove(&self, key: &i32, guard: &Guard) -> bool {
        self.remove(*key, guard)
    }

    fn size(&self, guard: &Guard) -> usize {
        self.size(guard)
    }

    fn key_sum(&self, guard: &Guard) -> i64 {
        self.key_sum(guard)
    }
}
