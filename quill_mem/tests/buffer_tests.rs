//! Growth, bias and content-preservation tests for record content.

use proptest::prelude::*;
use quill_mem::{Cell, Growth, Heap, MemConfig, StubFlags};
use quill_mem::buffer::MAX_BIAS;
use std::sync::atomic::Ordering;

// =============================================================================
// Model Tests
// =============================================================================

#[derive(Debug, Clone)]
enum CellOp {
    Push(i64),
    Insert(usize, i64),
    RemoveHead(usize),
    RemoveTail(usize),
}

fn cell_op() -> impl Strategy<Value = CellOp> {
    prop_oneof![
        any::<i64>().prop_map(CellOp::Push),
        (any::<usize>(), any::<i64>()).prop_map(|(at, value)| CellOp::Insert(at, value)),
        (0usize..6).prop_map(CellOp::RemoveHead),
        (0usize..6).prop_map(CellOp::RemoveTail),
    ]
}

#[derive(Debug, Clone)]
enum ByteOp {
    Append(Vec<u8>),
    RemoveHead(usize),
    RemoveTail(usize),
}

fn byte_op() -> impl Strategy<Value = ByteOp> {
    prop_oneof![
        proptest::collection::vec(1u8..=255, 0..300).prop_map(ByteOp::Append),
        (0usize..400).prop_map(ByteOp::RemoveHead),
        (0usize..400).prop_map(ByteOp::RemoveTail),
    ]
}

proptest! {
    #[test]
    fn array_matches_vec_model(ops in proptest::collection::vec(cell_op(), 0..150)) {
        let mut heap = Heap::with_defaults();
        let id = heap.make_array(0, StubFlags::empty()).unwrap();
        let mut model: Vec<i64> = Vec::new();

        for op in ops {
            match op {
                CellOp::Push(value) => {
                    heap.push_cell(id, Cell::integer(value)).unwrap();
                    model.push(value);
                }
                CellOp::Insert(at, value) => {
                    let at = at % (model.len() + 1);
                    heap.insert_cells(id, at, &[Cell::integer(value)]).unwrap();
                    model.insert(at, value);
                }
                CellOp::RemoveHead(n) => {
                    let n = n.min(model.len());
                    heap.remove_head(id, n).unwrap();
                    model.drain(..n);
                }
                CellOp::RemoveTail(n) => {
                    let n = n.min(model.len());
                    heap.remove_tail(id, n).unwrap();
                    model.truncate(model.len() - n);
                }
            }
        }

        prop_assert_eq!(heap.len(id).unwrap(), model.len());
        for (index, value) in model.iter().enumerate() {
            prop_assert_eq!(heap.cell_at(id, index).unwrap(), Cell::integer(*value));
        }
        heap.free_unmanaged(id).unwrap();
        prop_assert_eq!(heap.stub_count(), 0);
    }

    #[test]
    fn bytes_match_vec_model(ops in proptest::collection::vec(byte_op(), 0..60)) {
        let mut heap = Heap::with_defaults();
        let id = heap.make_bytes(b"", StubFlags::empty()).unwrap();
        let mut model: Vec<u8> = Vec::new();

        for op in ops {
            match op {
                ByteOp::Append(data) => {
                    heap.append_bytes(id, &data).unwrap();
                    model.extend_from_slice(&data);
                }
                ByteOp::RemoveHead(n) => {
                    let n = n.min(model.len());
                    heap.remove_head(id, n).unwrap();
                    model.drain(..n);
                }
                ByteOp::RemoveTail(n) => {
                    let n = n.min(model.len());
                    heap.remove_tail(id, n).unwrap();
                    model.truncate(model.len() - n);
                }
            }

            let stub = heap.stub(id).unwrap();
            // SAFETY: byte records always keep a terminator past the end.
            let terminator = unsafe { *stub.data().add(model.len()) };
            prop_assert_eq!(terminator, 0);
        }

        prop_assert_eq!(heap.bytes(id).unwrap(), &model[..]);
    }
}

// =============================================================================
// Growth Paths
// =============================================================================

#[test]
fn test_head_insert_consumes_bias() {
    let mut heap = Heap::with_defaults();
    let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    let id = heap.make_bytes(&data, StubFlags::empty()).unwrap();

    let allocations = heap.stats().buffer_allocations();
    let reallocations = heap.stats().reallocations.load(Ordering::Relaxed);

    heap.remove_head(id, 100).unwrap();
    assert_eq!(heap.expand(id, 0, 100).unwrap(), Growth::ConsumedBias);

    assert_eq!(heap.stats().buffer_allocations(), allocations);
    assert_eq!(heap.stats().reallocations.load(Ordering::Relaxed), reallocations);

    let bytes = heap.bytes(id).unwrap();
    assert!(bytes[..100].iter().all(|&b| b == 0));
    assert_eq!(&bytes[100..], &data[100..]);
}

#[test]
fn test_repeated_head_reinsert_does_not_allocate() {
    let mut heap = Heap::with_defaults();
    let id = heap.make_array(0, StubFlags::empty()).unwrap();
    for n in 0..200 {
        heap.push_cell(id, Cell::integer(n)).unwrap();
    }

    let allocations = heap.stats().buffer_allocations();
    let reallocations = heap.stats().reallocations.load(Ordering::Relaxed);

    for (round, count) in [1usize, 7, 3, 16, 5, 12, 2, 9].into_iter().cycle().take(40).enumerate() {
        heap.remove_head(id, count).unwrap();
        assert_eq!(heap.len(id).unwrap(), 200 - count);
        assert_eq!(heap.expand(id, 0, count).unwrap(), Growth::ConsumedBias);
        for index in 0..count {
            heap.set_cell(id, index, Cell::integer(-(round as i64))).unwrap();
        }
        assert_eq!(heap.len(id).unwrap(), 200);
    }

    assert_eq!(heap.stats().buffer_allocations(), allocations);
    assert_eq!(heap.stats().reallocations.load(Ordering::Relaxed), reallocations);
    assert_eq!(heap.cell_at(id, 199).unwrap(), Cell::integer(199));
    assert_eq!(heap.cell_at(id, 0).unwrap(), Cell::integer(-39));
}

#[test]
fn test_insert_slides_within_capacity() {
    let mut heap = Heap::with_defaults();
    let id = heap.make_array(16, StubFlags::empty()).unwrap();
    heap.insert_cells(id, 0, &[Cell::integer(1), Cell::integer(4)]).unwrap();

    assert_eq!(heap.expand(id, 1, 2).unwrap(), Growth::Slid);
    heap.set_cell(id, 1, Cell::integer(2)).unwrap();
    heap.set_cell(id, 2, Cell::integer(3)).unwrap();

    let values: Vec<Cell> = (0..4).map(|i| heap.cell_at(id, i).unwrap()).collect();
    assert_eq!(
        values,
        vec![Cell::integer(1), Cell::integer(2), Cell::integer(3), Cell::integer(4)]
    );
}

#[test]
fn test_growth_past_capacity_reallocates() {
    let mut heap = Heap::with_defaults();
    let id = heap.make_bytes(&[9u8; 500], StubFlags::empty()).unwrap();
    let capacity = heap.stub(id).unwrap().capacity();
    let reallocations = heap.stats().reallocations.load(Ordering::Relaxed);

    let more = vec![7u8; capacity];
    heap.append_bytes(id, &more).unwrap();
    assert_eq!(
        heap.stats().reallocations.load(Ordering::Relaxed),
        reallocations + 1
    );

    let bytes = heap.bytes(id).unwrap();
    assert_eq!(bytes.len(), 500 + capacity);
    assert!(bytes[..500].iter().all(|&b| b == 9));
    assert!(bytes[500..].iter().all(|&b| b == 7));
}

#[test]
fn test_large_bias_is_compacted() {
    let mut heap = Heap::with_defaults();
    let data: Vec<u8> = (0..=255u8).cycle().take(3 * MAX_BIAS).collect();
    let id = heap.make_bytes(&data, StubFlags::empty()).unwrap();

    heap.remove_head(id, MAX_BIAS / 2).unwrap();
    assert_eq!(heap.stub(id).unwrap().buffer().unwrap().bias(), MAX_BIAS / 2);

    heap.remove_head(id, MAX_BIAS).unwrap();
    assert_eq!(heap.stub(id).unwrap().buffer().unwrap().bias(), 0);
    assert_eq!(heap.bytes(id).unwrap(), &data[MAX_BIAS / 2 + MAX_BIAS..]);
}

#[test]
fn test_growth_with_pools_disabled() {
    let mut heap = Heap::new(MemConfig::sanitizer()).unwrap();
    let id = heap.make_array(0, StubFlags::empty()).unwrap();
    for n in 0..100 {
        heap.push_cell(id, Cell::integer(n)).unwrap();
    }
    for n in 0..100 {
        assert_eq!(heap.cell_at(id, n as usize).unwrap(), Cell::integer(n));
    }
    assert_eq!(heap.stats().pool_allocations.load(Ordering::Relaxed), 0);
    assert!(heap.stats().system_allocations.load(Ordering::Relaxed) > 0);
}

#[test]
fn test_freed_buffers_return_bytes() {
    let mut heap = Heap::with_defaults();
    let before = heap.outstanding_bytes();

    let id = heap.make_array(0, StubFlags::empty()).unwrap();
    for n in 0..300 {
        heap.push_cell(id, Cell::integer(n)).unwrap();
    }
    assert!(heap.outstanding_bytes() > before);

    heap.free_unmanaged(id).unwrap();
    assert_eq!(heap.outstanding_bytes(), before);
}
