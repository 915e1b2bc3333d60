//! Cursors and range iteration.
//!
//! Pages have no sibling or parent pointers, so a cursor keeps the whole path
//! from the root to its current leaf as a stack of `(page, index)` frames.
//! Moving past the end of a leaf pops frames until one can advance, then
//! descends again along the first (or last) edge.
//!
//! Cursors are detached: they own clones of the pages on their path and a
//! reader guard, so they keep reading the version they were created on while
//! the tree moves on.

use std::iter::FusedIterator;
use std::ops::Bound;
use std::sync::Arc;

use crate::btree::lookup::seek_last_le;
use crate::btree::node::{NodeKind, NodeRef};
use crate::btree::tree::{TreeError, load_page, parse_node};
use crate::page::{Page, PageId};
use crate::store::PageStore;

/// One level of the cursor path.
struct Frame {
    page: Page,
    kind: NodeKind,
    count: u16,
    index: u16,
}

impl Frame {
    fn load<S: PageStore + ?Sized>(store: &S, id: PageId) -> Result<Self, TreeError> {
        let page = load_page(store, id)?;
        let (kind, count) = {
            let node = parse_node(&page, id)?;
            (node.kind(), node.key_count())
        };
        Ok(Self {
            page,
            kind,
            count,
            index: 0,
        })
    }

    fn node(&self) -> NodeRef<'_> {
        NodeRef::from_parts(self.page.as_bytes(), self.kind, self.count)
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

impl Direction {
    /// Index a descent in this direction enters a node at.
    const fn entry_index(self, count: u16) -> u16 {
        match self {
            Self::Forward => 0,
            Self::Backward => count.saturating_sub(1),
        }
    }
}

/// A position within one version of a tree.
///
/// A fresh cursor is unpositioned. After a seek it either points at an entry
/// ([`Cursor::is_valid`]) or at nothing; stepping off either end leaves it
/// unpositioned until the next seek.
pub struct Cursor<S: PageStore> {
    store: Arc<S>,
    root: PageId,
    stack: Vec<Frame>,
    _guard: Arc<()>,
}

impl<S: PageStore> Cursor<S> {
    pub(crate) const fn new(store: Arc<S>, root: PageId, guard: Arc<()>) -> Self {
        Self {
            store,
            root,
            stack: Vec::new(),
            _guard: guard,
        }
    }

    /// Whether the cursor points at an entry.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.leaf().is_some()
    }

    /// Key at the current position.
    #[must_use]
    pub fn key(&self) -> Option<&[u8]> {
        self.leaf().map(|frame| frame.node().key(frame.index))
    }

    /// Value at the current position.
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        self.leaf().map(|frame| frame.node().value(frame.index))
    }

    pub(crate) fn entry(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.leaf().map(|frame| {
            let node = frame.node();
            (node.key(frame.index).to_vec(), node.value(frame.index).to_vec())
        })
    }

    fn leaf(&self) -> Option<&Frame> {
        self.stack
            .last()
            .filter(|frame| frame.kind == NodeKind::Leaf && frame.index < frame.count)
    }

    /// Move to the smallest key. Returns whether the tree has one.
    pub fn seek_first(&mut self) -> Result<bool, TreeError> {
        self.guarded(|cursor| cursor.seek_edge(Direction::Forward))
    }

    /// Move to the largest key. Returns whether the tree has one.
    pub fn seek_last(&mut self) -> Result<bool, TreeError> {
        self.guarded(|cursor| cursor.seek_edge(Direction::Backward))
    }

    /// Move to the largest key `<= key`. Returns whether there is one.
    pub fn seek_le(&mut self, key: &[u8]) -> Result<bool, TreeError> {
        self.guarded(|cursor| cursor.seek_le_inner(key))
    }

    /// Move to the smallest key `>= key`. Returns whether there is one.
    pub fn seek_ge(&mut self, key: &[u8]) -> Result<bool, TreeError> {
        self.guarded(|cursor| {
            if !cursor.seek_le_inner(key)? {
                return cursor.seek_edge(Direction::Forward);
            }
            if cursor.key() == Some(key) {
                return Ok(true);
            }
            cursor.step(Direction::Forward)
        })
    }

    /// Advance to the next key. Returns whether the cursor is still valid.
    pub fn next(&mut self) -> Result<bool, TreeError> {
        if !self.is_valid() {
            return Ok(false);
        }
        self.guarded(|cursor| cursor.step(Direction::Forward))
    }

    /// Step back to the previous key. Returns whether the cursor is still
    /// valid.
    pub fn prev(&mut self) -> Result<bool, TreeError> {
        if !self.is_valid() {
            return Ok(false);
        }
        self.guarded(|cursor| cursor.step(Direction::Backward))
    }

    /// Run a movement, dropping the position if it fails half way.
    fn guarded(
        &mut self,
        movement: impl FnOnce(&mut Self) -> Result<bool, TreeError>,
    ) -> Result<bool, TreeError> {
        let result = movement(self);
        if result.is_err() {
            self.stack.clear();
        }
        result
    }

    fn seek_edge(&mut self, direction: Direction) -> Result<bool, TreeError> {
        self.stack.clear();
        let mut root = Frame::load(&*self.store, self.root)?;
        root.index = direction.entry_index(root.count);
        self.stack.push(root);
        self.descend(direction)?;
        Ok(self.is_valid())
    }

    fn seek_le_inner(&mut self, key: &[u8]) -> Result<bool, TreeError> {
        self.stack.clear();
        let mut id = self.root;
        loop {
            let mut frame = Frame::load(&*self.store, id)?;
            frame.index = seek_last_le(frame.node(), key);
            let child = (frame.kind == NodeKind::Internal).then(|| frame.node().child(frame.index));
            self.stack.push(frame);
            match child {
                Some(child) => id = child,
                None => break,
            }
        }

        // Index 0 is only greater than the target on the leftmost path.
        if self.key().is_none_or(|found| found > key) {
            self.stack.clear();
            return Ok(false);
        }
        Ok(true)
    }

    /// Move one entry in `direction`, crossing into a neighbouring leaf if
    /// needed.
    fn step(&mut self, direction: Direction) -> Result<bool, TreeError> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(false);
            };
            match direction {
                Direction::Forward if top.index + 1 < top.count => {
                    top.index += 1;
                    break;
                }
                Direction::Backward if top.index > 0 => {
                    top.index -= 1;
                    break;
                }
                _ => {
                    self.stack.pop();
                }
            }
        }
        self.descend(direction)?;
        Ok(self.is_valid())
    }

    /// Follow the current child of the top frame down to a leaf.
    fn descend(&mut self, direction: Direction) -> Result<(), TreeError> {
        loop {
            let Some(top) = self.stack.last() else {
                return Ok(());
            };
            if top.kind == NodeKind::Leaf {
                return Ok(());
            }
            let child = top.node().child(top.index);
            let mut frame = Frame::load(&*self.store, child)?;
            frame.index = direction.entry_index(frame.count);
            self.stack.push(frame);
        }
    }
}

/// Entries of one tree version whose keys fall within a range.
///
/// Iterates lazily from both ends; the two ends never cross.
pub struct Range<S: PageStore> {
    front: Cursor<S>,
    back: Cursor<S>,
    start: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,
    front_started: bool,
    back_started: bool,
    last_front: Option<Vec<u8>>,
    last_back: Option<Vec<u8>>,
    finished: bool,
}

impl<S: PageStore> Range<S> {
    pub(crate) const fn new(
        front: Cursor<S>,
        back: Cursor<S>,
        start: Bound<Vec<u8>>,
        end: Bound<Vec<u8>>,
    ) -> Self {
        Self {
            front,
            back,
            start,
            end,
            front_started: false,
            back_started: false,
            last_front: None,
            last_back: None,
            finished: false,
        }
    }

    fn advance_front(&mut self) -> Result<bool, TreeError> {
        if self.front_started {
            return self.front.next();
        }
        self.front_started = true;
        match &self.start {
            Bound::Unbounded => self.front.seek_first(),
            Bound::Included(start) => self.front.seek_ge(start),
            Bound::Excluded(start) => {
                if !self.front.seek_ge(start)? {
                    return Ok(false);
                }
                if self.front.key() == Some(start.as_slice()) {
                    return self.front.next();
                }
                Ok(true)
            }
        }
    }

    fn advance_back(&mut self) -> Result<bool, TreeError> {
        if self.back_started {
            return self.back.prev();
        }
        self.back_started = true;
        match &self.end {
            Bound::Unbounded => self.back.seek_last(),
            Bound::Included(end) => self.back.seek_le(end),
            Bound::Excluded(end) => {
                if !self.back.seek_le(end)? {
                    return Ok(false);
                }
                if self.back.key() == Some(end.as_slice()) {
                    return self.back.prev();
                }
                Ok(true)
            }
        }
    }

    fn below_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Unbounded => true,
            Bound::Included(end) => key <= end.as_slice(),
            Bound::Excluded(end) => key < end.as_slice(),
        }
    }

    fn above_start(&self, key: &[u8]) -> bool {
        match &self.start {
            Bound::Unbounded => true,
            Bound::Included(start) => key >= start.as_slice(),
            Bound::Excluded(start) => key > start.as_slice(),
        }
    }
}

impl<S: PageStore> Iterator for Range<S> {
    type Item = Result<(Vec<u8>, Vec<u8>), TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let entry = match self.advance_front() {
            Ok(true) => self.front.entry(),
            Ok(false) => None,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };

        let Some((key, value)) = entry else {
            self.finished = true;
            return None;
        };
        let crossed = self.last_back.as_ref().is_some_and(|back| key >= *back);
        if crossed || !self.below_end(&key) {
            self.finished = true;
            return None;
        }
        self.last_front = Some(key.clone());
        Some(Ok((key, value)))
    }
}

impl<S: PageStore> DoubleEndedIterator for Range<S> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let entry = match self.advance_back() {
            Ok(true) => self.back.entry(),
            Ok(false) => None,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };

        let Some((key, value)) = entry else {
            self.finished = true;
            return None;
        };
        let crossed = self.last_front.as_ref().is_some_and(|front| key <= *front);
        if crossed || !self.above_start(&key) {
            self.finished = true;
            return None;
        }
        self.last_back = Some(key.clone());
        Some(Ok((key, value)))
    }
}

impl<S: PageStore> FusedIterator for Range<S> {}
