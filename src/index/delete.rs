use super::SpatialIndex;
use super::insert::node_error;
use super::split;
use super::staged::{Route, StagedTree};
use crate::envelope::Envelope;
use crate::error::{Result, SpatreeError};
use crate::identifier::{NodeId, WriteGuard};
use crate::node::{ChildEntry, Item, Node, NodeError};
use std::sync::Arc;

/// A write-locked node on the search path.
struct SearchStep {
    guard: WriteGuard,
    node: Arc<Node>,
    /// Slot followed below this node (or the matching entry in the leaf).
    index: usize,
    /// Next slot to try when backtracking.
    next: usize,
}

enum Outcome {
    Eliminated,
    Tightened(Envelope),
}

impl SpatialIndex {
    /// Remove one entry equal to `(shape, payload)`.
    ///
    /// Fails with [`SpatreeError::EntryNotFound`] if no such entry is stored.
    /// Underfull nodes are dissolved and their contents reinserted, and a root
    /// left with a single child hands the root role to that child. The whole
    /// restructuring commits at once or not at all, and never adds a level.
    pub fn delete(&self, shape: &Envelope, payload: impl AsRef<[u8]>) -> Result<()> {
        shape.validate(self.config.dimensions)?;
        let result = self.delete_entry(shape, payload.as_ref());
        self.enforce_cache_budget();
        result
    }

    fn delete_entry(&self, shape: &Envelope, payload: &[u8]) -> Result<()> {
        let root = self.lock_root_write()?;
        let path = self.find_entry(root, shape, payload)?;

        let mut steps = path.into_iter();
        let first = steps
            .next()
            .ok_or_else(|| SpatreeError::invariant("empty search path"))?;
        let mut route = vec![(first.guard.id(), first.index)];
        let mut tree = StagedTree::new(self, first.guard, first.node);
        for step in steps {
            route.push((step.guard.id(), step.index));
            tree.adopt(step.guard, step.node);
        }

        let orphans = condense(&mut tree, &route)?;
        let reinserted = orphans.len();
        for (item, level) in orphans {
            place(&mut tree, item, level)?;
        }
        if reinserted > 0 {
            log::trace!("Reinserted {} orphaned item(s)", reinserted);
        }
        shorten(&mut tree)?;

        tree.commit(1)
    }

    /// Depth-first search for the leaf holding `(shape, payload)`, following
    /// only children whose recorded shape covers `shape`. Returns the
    /// write-locked path from the root to that leaf.
    fn find_entry(
        &self,
        root: WriteGuard,
        shape: &Envelope,
        payload: &[u8],
    ) -> Result<Vec<SearchStep>> {
        let node = self.resolve(root.identifier())?;
        let mut path = vec![SearchStep {
            guard: root,
            node,
            index: 0,
            next: 0,
        }];

        loop {
            let Some(top) = path.last_mut() else {
                return Err(SpatreeError::EntryNotFound);
            };

            if top.node.is_leaf() {
                match top.node.position_of(shape, payload) {
                    Some(position) => {
                        top.index = position;
                        return Ok(path);
                    }
                    None => {
                        path.pop();
                        continue;
                    }
                }
            }

            let candidate = top.node.children()[top.next..]
                .iter()
                .position(|c| c.shape.contains(shape))
                .map(|offset| top.next + offset);
            let Some(child_index) = candidate else {
                path.pop();
                continue;
            };
            top.index = child_index;
            top.next = child_index + 1;

            let parent = Arc::clone(&top.node);
            let child = self.child_identifier(&parent, child_index)?;
            let guard = self.write_lock(&child)?;
            self.check_child(&parent, child_index, &guard)?;
            let node = self.resolve(&child)?;
            path.push(SearchStep {
                guard,
                node,
                index: 0,
                next: 0,
            });
        }
    }
}

/// Remove the found entry and fix up `route` bottom-up. Non-root nodes left
/// with fewer than `m` items are dissolved; their items are returned with the
/// level they must be placed at, highest level first.
fn condense(tree: &mut StagedTree<'_>, route: &[(NodeId, usize)]) -> Result<Vec<(Item, u32)>> {
    let dims = tree.dimensions();
    let min = tree.min_entries();
    // the root's only child is kept so it can be adopted as the root
    let root_has_one_child = match route.first() {
        Some(&(root, _)) if route.len() > 1 => tree.body(root)?.child_count() == 1,
        _ => false,
    };

    let mut orphans: Vec<(Item, u32)> = Vec::new();
    let mut outcome: Option<Outcome> = None;
    for (depth, &(id, slot)) in route.iter().enumerate().rev() {
        let body = tree.body_mut(id)?;
        match outcome.take() {
            None | Some(Outcome::Eliminated) => {
                body.delete_entry(slot).map_err(node_error)?;
            }
            Some(Outcome::Tightened(shape)) => {
                body.set_child_shape(slot, shape).map_err(node_error)?;
            }
        }

        let keep = depth == 0 || (depth == 1 && root_has_one_child);
        if !keep && body.child_count() < min {
            let level = body.level();
            orphans.extend(body.take_items().into_iter().map(|item| (item, level)));
            tree.remove(id)?;
            outcome = Some(Outcome::Eliminated);
            log::debug!("Dissolving underfull node {} at level {}", id, level);
        } else {
            outcome = Some(Outcome::Tightened(body.bounds(dims)));
        }
    }

    orphans.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(orphans)
}

/// Put `item` into a node at `level`.
///
/// The subtree chosen by least enlargement is preferred; when its node is
/// full, any node at that level with room is used instead. A split happens
/// only once every node at the level is full, which keeps each level no
/// larger than it was before the delete, so the root never overflows.
fn place(tree: &mut StagedTree<'_>, item: Item, level: u32) -> Result<()> {
    let max = tree.max_entries();
    let mut route = choose_route(tree, item.shape(), level)?;
    if tree.body(route.target)?.child_count() >= max
        && let Some(roomy) = find_room(tree, item.shape(), level)?
    {
        route = roomy;
    }

    let inserted = tree.body_mut(route.target)?.insert_item(item, max);
    match inserted {
        Ok(()) => tree.tighten(&route),
        Err(NodeError::Overflow(item)) => {
            if route.target == tree.root() {
                return Err(SpatreeError::invariant(format!(
                    "reinsertion would split root {}",
                    route.target
                )));
            }
            let sibling = split_full(tree, route.target, item)?;
            tree.tighten(&route)?;
            place(tree, Item::Child(sibling), level + 1)
        }
        Err(e) => Err(node_error(e)),
    }
}

/// Descend from the root by least enlargement down to `level`.
fn choose_route(tree: &mut StagedTree<'_>, shape: &Envelope, level: u32) -> Result<Route> {
    let mut steps = Vec::new();
    let mut current = tree.root();
    loop {
        let body = tree.body(current)?;
        if body.level() == level {
            return Ok(Route {
                steps,
                target: current,
            });
        }
        if body.level() < level {
            return Err(SpatreeError::invariant(format!(
                "cannot place an item at level {} below node {} at level {}",
                level,
                current,
                body.level()
            )));
        }
        let slot = split::choose_subtree(body.children(), shape).ok_or_else(|| {
            SpatreeError::invariant(format!("internal node {} has no children", current))
        })?;
        let child = tree.child(current, slot)?;
        steps.push((current, slot));
        current = child;
    }
}

/// First node at `level` with a free slot, visiting children in order of
/// least enlargement.
fn find_room(tree: &mut StagedTree<'_>, shape: &Envelope, level: u32) -> Result<Option<Route>> {
    let mut steps = Vec::new();
    let root = tree.root();
    search_room(tree, root, shape, level, &mut steps)
}

fn search_room(
    tree: &mut StagedTree<'_>,
    node: NodeId,
    shape: &Envelope,
    level: u32,
    steps: &mut Vec<(NodeId, usize)>,
) -> Result<Option<Route>> {
    let body = tree.body(node)?;
    if body.level() == level {
        let route = (body.child_count() < tree.max_entries()).then(|| Route {
            steps: steps.clone(),
            target: node,
        });
        return Ok(route);
    }
    if body.level() < level {
        return Ok(None);
    }

    let mut order: Vec<(usize, f64, f64)> = body
        .children()
        .iter()
        .enumerate()
        .map(|(i, c)| (i, c.shape.enlargement(shape), c.shape.union(shape).area()))
        .collect();
    order.sort_by(|a, b| {
        a.1.total_cmp(&b.1)
            .then(a.2.total_cmp(&b.2))
            .then(a.0.cmp(&b.0))
    });

    for (slot, _, _) in order {
        let child = tree.child(node, slot)?;
        steps.push((node, slot));
        if let Some(route) = search_room(tree, child, shape, level, steps)? {
            return Ok(Some(route));
        }
        steps.pop();
    }
    Ok(None)
}

/// Quadratic split of a full staged node plus `extra`. The node keeps the
/// first group and a new sibling takes the second.
fn split_full(tree: &mut StagedTree<'_>, id: NodeId, extra: Item) -> Result<ChildEntry> {
    let min = tree.min_entries();
    let dims = tree.dimensions();
    let body = tree.body_mut(id)?;
    let level = body.level();
    let mut items = body.take_items();
    items.push(extra);
    let (keep, moved) = split::quadratic_split(items, min);
    *body = Node::from_items(id, level, keep).map_err(node_error)?;

    let sibling = tree.create(level, moved)?;
    let shape = tree.body(sibling)?.bounds(dims);
    log::debug!(
        "Split node {} at level {} during reinsertion, new sibling {}",
        id,
        level,
        sibling
    );
    Ok(ChildEntry { shape, id: sibling })
}

/// While the root is internal with a single child, make that child the root.
fn shorten(tree: &mut StagedTree<'_>) -> Result<()> {
    loop {
        let root = tree.root();
        let body = tree.body(root)?;
        if body.is_leaf() || body.child_count() != 1 {
            return Ok(());
        }
        let child = tree.child(root, 0)?;
        tree.remove(root)?;
        tree.set_root(child);
    }
}
