//! Subtree choice and node splitting (Guttman's quadratic split).

use crate::envelope::Envelope;
use crate::node::{ChildEntry, Item};

/// Child needing the least enlargement to cover `shape`. Ties go to the
/// smaller resulting area, then to the lowest index.
pub(crate) fn choose_subtree(children: &[ChildEntry], shape: &Envelope) -> Option<usize> {
    let mut best: Option<(usize, f64, f64)> = None;
    for (i, child) in children.iter().enumerate() {
        let enlargement = child.shape.enlargement(shape);
        let area = child.shape.union(shape).area();
        let better = match best {
            None => true,
            Some((_, best_enlargement, best_area)) => {
                enlargement < best_enlargement
                    || (enlargement == best_enlargement && area < best_area)
            }
        };
        if better {
            best = Some((i, enlargement, area));
        }
    }
    best.map(|(i, _, _)| i)
}

/// Distribute `items` over two groups of at least `min_entries` each.
pub(crate) fn quadratic_split(items: Vec<Item>, min_entries: usize) -> (Vec<Item>, Vec<Item>) {
    debug_assert!(items.len() >= 2, "cannot split fewer than two items");
    debug_assert!(items.len() >= 2 * min_entries);

    let (seed_a, seed_b) = pick_seeds(&items);
    let mut pending: Vec<Option<Item>> = items.into_iter().map(Some).collect();

    let mut left = Group::seeded(pending[seed_a].take());
    let mut right = Group::seeded(pending[seed_b].take());
    let mut remaining = pending.iter().filter(|i| i.is_some()).count();

    while remaining > 0 {
        // force-fill a group that needs everything left to reach the minimum
        if left.len() + remaining <= min_entries {
            left.extend(pending.iter_mut().filter_map(Option::take));
            break;
        }
        if right.len() + remaining <= min_entries {
            right.extend(pending.iter_mut().filter_map(Option::take));
            break;
        }

        let Some((next, d_left, d_right)) = pick_next(&pending, &left.shape, &right.shape) else {
            break;
        };
        let Some(item) = pending[next].take() else {
            break;
        };
        remaining -= 1;

        let to_left = if d_left != d_right {
            d_left < d_right
        } else if left.shape.area() != right.shape.area() {
            left.shape.area() < right.shape.area()
        } else {
            left.len() <= right.len()
        };
        if to_left {
            left.push(item);
        } else {
            right.push(item);
        }
    }

    (left.items, right.items)
}

struct Group {
    items: Vec<Item>,
    shape: Envelope,
}

impl Group {
    fn seeded(seed: Option<Item>) -> Self {
        let mut group = Self {
            items: Vec::new(),
            shape: Envelope::empty(0),
        };
        if let Some(item) = seed {
            group.shape = item.shape().clone();
            group.items.push(item);
        }
        group
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn push(&mut self, item: Item) {
        self.shape.expand_to_include(item.shape());
        self.items.push(item);
    }

    fn extend(&mut self, items: impl Iterator<Item = Item>) {
        for item in items {
            self.push(item);
        }
    }
}

/// The pair wasting the most area if grouped together.
fn pick_seeds(items: &[Item]) -> (usize, usize) {
    let mut best = (0, 1);
    let mut worst_waste = f64::NEG_INFINITY;
    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            let a = items[i].shape();
            let b = items[j].shape();
            let waste = a.union(b).area() - a.area() - b.area();
            if waste > worst_waste {
                worst_waste = waste;
                best = (i, j);
            }
        }
    }
    best
}

/// The pending item with the strongest preference for one group.
fn pick_next(
    pending: &[Option<Item>],
    left: &Envelope,
    right: &Envelope,
) -> Option<(usize, f64, f64)> {
    let mut best: Option<(usize, f64, f64)> = None;
    let mut best_diff = f64::NEG_INFINITY;
    for (i, item) in pending.iter().enumerate() {
        let Some(item) = item else { continue };
        let d_left = left.enlargement(item.shape());
        let d_right = right.enlargement(item.shape());
        let diff = (d_left - d_right).abs();
        if diff > best_diff {
            best_diff = diff;
            best = Some((i, d_left, d_right));
        }
    }
    best
}
