use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{AABB, RTree};
use spatree::Point;
use spatree::prelude::*;
use std::collections::BTreeSet;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

type Oracle = RTree<GeomWithData<Rectangle<[f64; 2]>, u32>>;

fn payloads(hits: &[(Envelope, Bytes)]) -> BTreeSet<Vec<u8>> {
    hits.iter().map(|(_, payload)| payload.to_vec()).collect()
}

fn random_rect(rng: &mut SmallRng) -> Envelope {
    let x = rng.gen_range(0.0..100.0);
    let y = rng.gen_range(0.0..100.0);
    let w = rng.gen_range(0.0..5.0);
    let h = rng.gen_range(0.0..5.0);
    Envelope::rect(x, y, x + w, y + h)
}

fn to_rectangle(env: &Envelope) -> Rectangle<[f64; 2]> {
    Rectangle::from_corners([env.min()[0], env.min()[1]], [env.max()[0], env.max()[1]])
}

fn id_of(payload: &Bytes) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(payload);
    u32::from_be_bytes(raw)
}

#[test]
fn test_query_with_minimal_fanout() {
    let index = SpatialIndex::memory(IndexConfig::default().with_fanout(1, 2)).unwrap();
    index.insert(Envelope::rect(0.0, 0.0, 1.0, 1.0), "a").unwrap();
    index.insert(Envelope::rect(5.0, 5.0, 6.0, 6.0), "b").unwrap();
    index.insert(Envelope::rect(0.5, 0.5, 1.5, 1.5), "c").unwrap();

    let hits = index.query_to_vec(&Envelope::rect(0.0, 0.0, 2.0, 2.0)).unwrap();
    let expected: BTreeSet<Vec<u8>> = [b"a".to_vec(), b"c".to_vec()].into();
    assert_eq!(payloads(&hits), expected);
    assert_eq!(hits.len(), 2);
    index.validate().unwrap();
}

#[test]
fn test_delete_with_minimal_fanout() {
    init_logging();
    let index = SpatialIndex::memory(IndexConfig::default().with_fanout(1, 2)).unwrap();
    index.insert(Envelope::rect(0.0, 0.0, 1.0, 1.0), "a").unwrap();
    index.insert(Envelope::rect(5.0, 5.0, 6.0, 6.0), "b").unwrap();
    index.insert(Envelope::rect(0.5, 0.5, 1.5, 1.5), "c").unwrap();

    index.delete(&Envelope::rect(5.0, 5.0, 6.0, 6.0), "b").unwrap();

    let hits = index
        .query_to_vec(&Envelope::rect(-100.0, -100.0, 100.0, 100.0))
        .unwrap();
    let expected: BTreeSet<Vec<u8>> = [b"a".to_vec(), b"c".to_vec()].into();
    assert_eq!(payloads(&hits), expected);
    assert_eq!(hits.len(), 2);
    assert_eq!(index.len(), 2);
    index.validate().unwrap();
}

#[test]
fn test_delete_missing_entry() {
    let index = SpatialIndex::memory(IndexConfig::default()).unwrap();
    index.insert(Envelope::rect(0.0, 0.0, 1.0, 1.0), "a").unwrap();

    let wrong_payload = index.delete(&Envelope::rect(0.0, 0.0, 1.0, 1.0), "z");
    assert!(matches!(wrong_payload, Err(SpatreeError::EntryNotFound)));
    let wrong_shape = index.delete(&Envelope::rect(0.0, 0.0, 2.0, 2.0), "a");
    assert!(wrong_shape.unwrap_err().is_not_found());
    assert_eq!(index.len(), 1);
}

#[test]
fn test_duplicate_entries_are_distinct() {
    let index = SpatialIndex::memory(IndexConfig::default().with_fanout(1, 2)).unwrap();
    let shape = Envelope::rect(1.0, 1.0, 2.0, 2.0);
    for _ in 0..3 {
        index.insert(shape.clone(), "same").unwrap();
    }
    assert_eq!(index.query_to_vec(&shape).unwrap().len(), 3);

    index.delete(&shape, "same").unwrap();
    assert_eq!(index.query_to_vec(&shape).unwrap().len(), 2);
    assert!(index.contains(&shape, "same").unwrap());
    index.validate().unwrap();
}

#[test]
fn test_rejects_invalid_shapes() {
    let index = SpatialIndex::memory(IndexConfig::default()).unwrap();

    let three_d = Envelope::new(&[0.0, 0.0, 0.0], &[1.0, 1.0, 1.0]).unwrap();
    assert!(matches!(
        index.insert(three_d, "x"),
        Err(SpatreeError::InvalidInput(_))
    ));
    assert!(matches!(
        index.insert(Envelope::empty(2), "x"),
        Err(SpatreeError::InvalidInput(_))
    ));
    assert!(matches!(
        index.query(&Envelope::rect(f64::NAN, 0.0, 1.0, 1.0)),
        Err(SpatreeError::InvalidInput(_))
    ));
    assert!(index.is_empty());
}

#[test]
fn test_touching_boundaries_match() {
    let index = SpatialIndex::memory(IndexConfig::default()).unwrap();
    index.insert(Envelope::rect(0.0, 0.0, 1.0, 1.0), "left").unwrap();
    index.insert(Envelope::point(&[3.0, 3.0]), "point").unwrap();

    let edge = index.query_to_vec(&Envelope::rect(1.0, 0.0, 2.0, 1.0)).unwrap();
    assert_eq!(edge.len(), 1);
    let corner = index.query_to_vec(&Envelope::point(&[3.0, 3.0])).unwrap();
    assert_eq!(corner[0].1.as_ref(), b"point");
}

#[test]
fn test_geo_shapes() {
    let index = SpatialIndex::memory(IndexConfig::default()).unwrap();
    index
        .insert(Point::new(-74.0060, 40.7128).into(), "new_york")
        .unwrap();
    index
        .insert(Point::new(-0.1278, 51.5074).into(), "london")
        .unwrap();

    let americas = Envelope::rect(-130.0, 20.0, -60.0, 50.0);
    let hits = index.query_to_vec(&americas).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].1.as_ref(), b"new_york");
}

#[test]
fn test_three_dimensional_index() {
    let index = SpatialIndex::memory(IndexConfig::default().with_dimensions(3).with_fanout(2, 4))
        .unwrap();
    for i in 0..40 {
        let z = i as f64;
        let shape = Envelope::new(&[0.0, 0.0, z], &[1.0, 1.0, z + 0.5]).unwrap();
        index.insert(shape, format!("layer{}", i)).unwrap();
    }

    let slab = Envelope::new(&[0.0, 0.0, 10.0], &[1.0, 1.0, 14.9]).unwrap();
    assert_eq!(index.query_to_vec(&slab).unwrap().len(), 5);
    assert_eq!(index.validate().unwrap().entry_count, 40);
}

#[test]
fn test_random_operations_match_rstar() {
    init_logging();
    let mut rng = SmallRng::seed_from_u64(7);
    let index = SpatialIndex::memory(IndexConfig::default().with_fanout(2, 4)).unwrap();
    let mut oracle = Oracle::new();
    let mut live: Vec<(Envelope, u32)> = Vec::new();

    for round in 0..1_500u32 {
        if live.is_empty() || rng.gen_bool(0.65) {
            let shape = random_rect(&mut rng);
            index
                .insert(shape.clone(), round.to_be_bytes().to_vec())
                .unwrap();
            oracle.insert(GeomWithData::new(to_rectangle(&shape), round));
            live.push((shape, round));
        } else {
            let (shape, id) = live.swap_remove(rng.gen_range(0..live.len()));
            index.delete(&shape, id.to_be_bytes()).unwrap();
            assert!(
                oracle
                    .remove(&GeomWithData::new(to_rectangle(&shape), id))
                    .is_some()
            );
        }

        if round % 100 == 0 {
            index.validate().unwrap();
        }
    }
    assert_eq!(index.len(), live.len() as u64);
    index.validate().unwrap();

    for _ in 0..50 {
        let region = random_rect(&mut rng).union(&random_rect(&mut rng));
        let mut found: Vec<u32> = index
            .query_to_vec(&region)
            .unwrap()
            .iter()
            .map(|(_, payload)| id_of(payload))
            .collect();
        let mut expected: Vec<u32> = oracle
            .locate_in_envelope_intersecting(&AABB::from_corners(
                [region.min()[0], region.min()[1]],
                [region.max()[0], region.max()[1]],
            ))
            .map(|hit| hit.data)
            .collect();
        found.sort_unstable();
        expected.sort_unstable();
        assert_eq!(found, expected);
    }
}

#[test]
fn test_every_live_entry_is_found() {
    let mut rng = SmallRng::seed_from_u64(42);
    let index = SpatialIndex::memory(IndexConfig::default().with_fanout(2, 5)).unwrap();
    let mut entries: Vec<(Envelope, u32)> = (0..400u32)
        .map(|i| (random_rect(&mut rng), i))
        .collect();
    for (shape, id) in &entries {
        index.insert(shape.clone(), id.to_be_bytes().to_vec()).unwrap();
    }

    let removed = entries.split_off(200);
    for (shape, id) in &removed {
        index.delete(shape, id.to_be_bytes()).unwrap();
    }

    for (shape, id) in &entries {
        assert!(index.contains(shape, id.to_be_bytes()).unwrap());
    }
    for (shape, id) in &removed {
        assert!(!index.contains(shape, id.to_be_bytes()).unwrap());
    }
    assert_eq!(index.validate().unwrap().entry_count, 200);
}

#[test]
fn test_height_never_increases_on_delete() {
    init_logging();
    let index = SpatialIndex::memory(IndexConfig::default()).unwrap();
    let mut entries = Vec::new();
    for i in 0..60u32 {
        let x = (i % 8) as f64 * 3.0;
        let y = (i / 8) as f64 * 3.0;
        let shape = Envelope::rect(x, y, x + 1.0, y + 1.0);
        index.insert(shape.clone(), i.to_be_bytes().to_vec()).unwrap();
        entries.push((shape, i));
    }
    assert!(index.height() >= 2);

    let mut height = index.height();
    for (shape, id) in entries {
        index.delete(&shape, id.to_be_bytes()).unwrap();
        assert!(index.height() <= height);
        height = index.height();
        index.validate().unwrap();
    }
    assert!(index.is_empty());
    assert_eq!(index.height(), 1);
}

#[test]
fn test_random_deletes_never_grow_tree() {
    init_logging();
    for (min, max) in [(2, 4), (1, 3), (3, 6)] {
        for seed in 0..24u64 {
            let mut rng = SmallRng::seed_from_u64(seed);
            let config = IndexConfig::default().with_fanout(min, max);
            let index = SpatialIndex::memory(config).unwrap();
            let mut live: Vec<(Envelope, u32)> = Vec::new();
            for id in 0..120u32 {
                let shape = random_rect(&mut rng);
                index.insert(shape.clone(), id.to_be_bytes().to_vec()).unwrap();
                live.push((shape, id));
            }

            while !live.is_empty() {
                let before = index.height();
                let (shape, id) = live.swap_remove(rng.gen_range(0..live.len()));
                index.delete(&shape, id.to_be_bytes()).unwrap();
                assert!(
                    index.height() <= before,
                    "fanout ({}, {}) seed {}: height {} -> {} with {} left",
                    min,
                    max,
                    seed,
                    before,
                    index.height(),
                    live.len()
                );
                if live.len() % 10 == 0 {
                    assert_eq!(index.validate().unwrap().entry_count, live.len() as u64);
                }
            }
            assert_eq!(index.height(), 1);
        }
    }
}

#[test]
fn test_shrinks_back_to_single_leaf() {
    let index = SpatialIndex::memory(IndexConfig::default().with_fanout(2, 4)).unwrap();
    for i in 0..100u32 {
        let x = i as f64;
        index
            .insert(Envelope::rect(x, 0.0, x + 0.5, 0.5), i.to_be_bytes().to_vec())
            .unwrap();
    }
    assert!(index.height() >= 3);

    for i in 0..98u32 {
        let x = i as f64;
        index
            .delete(&Envelope::rect(x, 0.0, x + 0.5, 0.5), i.to_be_bytes())
            .unwrap();
    }
    let stats = index.validate().unwrap();
    assert_eq!(stats.entry_count, 2);
    assert_eq!(stats.height, 1);
    assert_eq!(stats.node_count, 1);
}

#[test]
fn test_query_iterator_is_lazy_and_fused() {
    let index = SpatialIndex::memory(IndexConfig::default().with_fanout(2, 4)).unwrap();
    for i in 0..20 {
        let x = i as f64;
        index
            .insert(Envelope::rect(x, x, x + 1.0, x + 1.0), format!("{}", i))
            .unwrap();
    }

    let region = Envelope::rect(0.0, 0.0, 100.0, 100.0);
    let mut iter = index.query(&region).unwrap();
    assert_eq!(iter.region(), &region);
    let first = iter.next().unwrap().unwrap();
    assert!(first.0.intersects(&region));
    assert_eq!(iter.by_ref().count(), 19);
    assert!(iter.next().is_none());
    drop(iter);

    // dropped iterators release their locks
    index.insert(Envelope::rect(50.0, 50.0, 51.0, 51.0), "late").unwrap();
    assert_eq!(index.query(&region).unwrap().count(), 21);
}
