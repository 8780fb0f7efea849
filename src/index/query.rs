use super::SpatialIndex;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::identifier::ReadGuard;
use crate::node::Node;
use bytes::Bytes;
use std::sync::Arc;

struct Frame {
    /// Held until the frame is popped.
    _guard: ReadGuard,
    node: Arc<Node>,
    next: usize,
}

/// Lazy traversal of the entries intersecting a region.
///
/// The iterator read-locks every node on its current root-to-leaf path and
/// takes a child's lock before moving past its parent, so entries moved by a
/// concurrent split are never skipped. Locks are released deepest first when
/// the traversal finishes, fails or is dropped. Writers touching the locked
/// path wait until then, so do not keep an iterator alive across a mutation
/// of the same index on the same thread.
///
/// After yielding an error the iterator is exhausted.
pub struct QueryIter<'a> {
    index: &'a SpatialIndex,
    region: Envelope,
    stack: Vec<Frame>,
    started: bool,
    done: bool,
}

impl<'a> QueryIter<'a> {
    fn new(index: &'a SpatialIndex, region: Envelope) -> Self {
        Self {
            index,
            region,
            stack: Vec::new(),
            started: false,
            done: false,
        }
    }

    pub fn region(&self) -> &Envelope {
        &self.region
    }

    fn advance(&mut self) -> Result<Option<(Envelope, Bytes)>> {
        if !self.started {
            self.started = true;
            let guard = self.index.lock_root_read()?;
            let node = self.index.resolve(guard.identifier())?;
            self.stack.push(Frame {
                _guard: guard,
                node,
                next: 0,
            });
        }

        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };

            if frame.node.is_leaf() {
                let entries = frame.node.leaf_entries();
                while frame.next < entries.len() {
                    let entry = &entries[frame.next];
                    frame.next += 1;
                    if entry.shape.intersects(&self.region) {
                        return Ok(Some((entry.shape.clone(), entry.payload.clone())));
                    }
                }
                self.stack.pop();
                continue;
            }

            let candidate = frame.node.children()[frame.next..]
                .iter()
                .position(|c| c.shape.intersects(&self.region))
                .map(|offset| frame.next + offset);
            let Some(index) = candidate else {
                self.stack.pop();
                continue;
            };
            frame.next = index + 1;

            let parent = Arc::clone(&frame.node);
            let child = self.index.child_identifier(&parent, index)?;
            let guard = self.index.read_lock(&child)?;
            self.index.check_child(&parent, index, &guard)?;
            let node = self.index.resolve(&child)?;
            self.stack.push(Frame {
                _guard: guard,
                node,
                next: 0,
            });
        }
    }

    fn release(&mut self) {
        while self.stack.pop().is_some() {}
    }
}

impl Iterator for QueryIter<'_> {
    type Item = Result<(Envelope, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(hit)) => Some(Ok(hit)),
            Ok(None) => {
                self.done = true;
                self.release();
                None
            }
            Err(e) => {
                self.done = true;
                self.release();
                Some(Err(e))
            }
        }
    }
}

impl std::iter::FusedIterator for QueryIter<'_> {}

impl Drop for QueryIter<'_> {
    fn drop(&mut self) {
        self.release();
        self.index.enforce_cache_budget();
    }
}

impl SpatialIndex {
    /// Entries whose shape intersects `region` (closed intervals), as a lazy
    /// iterator. No lock is taken until the first call to `next`.
    ///
    /// # Examples
    ///
    /// ```
    /// use spatree::{Envelope, IndexConfig, SpatialIndex};
    ///
    /// let index = SpatialIndex::memory(IndexConfig::default()).unwrap();
    /// index.insert(Envelope::rect(0.0, 0.0, 1.0, 1.0), "a").unwrap();
    /// index.insert(Envelope::rect(5.0, 5.0, 6.0, 6.0), "b").unwrap();
    ///
    /// let hits = index
    ///     .query(&Envelope::rect(0.0, 0.0, 2.0, 2.0))
    ///     .unwrap()
    ///     .collect::<Result<Vec<_>, _>>()
    ///     .unwrap();
    /// assert_eq!(hits.len(), 1);
    /// assert_eq!(hits[0].1.as_ref(), b"a");
    /// ```
    pub fn query(&self, region: &Envelope) -> Result<QueryIter<'_>> {
        region.validate(self.config.dimensions)?;
        Ok(QueryIter::new(self, region.clone()))
    }

    /// Collect all matches of [`query`](Self::query).
    pub fn query_to_vec(&self, region: &Envelope) -> Result<Vec<(Envelope, Bytes)>> {
        self.query(region)?.collect()
    }

    /// True if an entry equal to `(shape, payload)` is stored.
    pub fn contains(&self, shape: &Envelope, payload: impl AsRef<[u8]>) -> Result<bool> {
        let payload = payload.as_ref();
        for hit in self.query(shape)? {
            let (found, data) = hit?;
            if found == *shape && data.as_ref() == payload {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
