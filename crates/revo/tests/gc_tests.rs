//! Collector tests through the public surface: reachability, explicit
//! recycling, handles, and correctness under allocation torture.

use revo::{Datum, Machine, MachineConfig, NoLimitTracker};

fn w(s: &str) -> Datum {
    Datum::Word(s.into())
}

fn sw(s: &str) -> Datum {
    Datum::SetWord(s.into())
}

fn i(n: i64) -> Datum {
    Datum::Integer(n)
}

fn blk(items: Vec<Datum>) -> Datum {
    Datum::Block(items)
}

// =============================================================================
// 1. Reachability
// =============================================================================

#[test]
fn garbage_from_evaluation_is_collected() {
    let mut m = Machine::boot();
    // settle boot-time garbage first
    m.recycle();
    // reduce allocates a result block nothing ends up referencing
    m.eval(&[w("reduce"), blk(vec![i(1), w("+"), i(1)])]).unwrap();
    let freed = m.recycle();
    assert!(freed > 0, "the reduced block should have been garbage");
}

#[test]
fn values_reachable_from_lib_survive_collection() {
    let mut m = Machine::boot();
    m.eval(&[sw("keep"), w("reduce"), blk(vec![i(1), i(2), i(3)])]).unwrap();
    m.recycle();
    m.recycle();
    assert_eq!(
        m.eval(&[w("keep")]).unwrap(),
        blk(vec![i(1), i(2), i(3)]),
        "lib-referenced data must survive any number of collections"
    );
}

#[test]
fn nested_structures_survive_through_their_roots() {
    let mut m = Machine::boot();
    m.eval(&[sw("outer"), blk(vec![blk(vec![blk(vec![i(42)])])])]).unwrap();
    m.recycle();
    let out = m
        .eval(&[Datum::Path(vec![w("outer"), i(1)])])
        .unwrap();
    assert_eq!(out, blk(vec![blk(vec![i(42)])]), "interior arrays are marked through parents");
}

#[test]
fn collection_count_stabilizes_without_new_garbage() {
    let mut m = Machine::boot();
    m.recycle();
    let second = m.recycle();
    assert_eq!(second, 0, "an idle machine has nothing left to free");
}

// =============================================================================
// 2. Handles
// =============================================================================

#[test]
fn handles_keep_values_alive_until_released() {
    let mut m = Machine::boot();
    let handle = m.make_handle(&blk(vec![i(7), i(8)])).unwrap();
    m.recycle();
    assert_eq!(m.read_handle(&handle), blk(vec![i(7), i(8)]));
    m.release_handle(handle);
    let freed = m.recycle();
    assert!(freed > 0, "released handle contents become garbage");
}

// =============================================================================
// 3. Cycles
// =============================================================================

#[test]
fn cyclic_blocks_are_collected_once_unreachable() {
    let mut m = Machine::boot();
    m.recycle();
    // b references itself; then its only named root goes away
    m.eval(&[sw("b"), blk(vec![i(1)])]).unwrap();
    m.eval(&[w("append"), w("b"), w("b")]).unwrap();
    m.eval(&[sw("b"), i(0)]).unwrap();
    let freed = m.recycle();
    assert!(freed > 0, "the self-referential block must be collected");
}

// =============================================================================
// 4. Torture mode
// =============================================================================

#[test]
fn torture_mode_collects_every_step_without_breaking_evaluation() {
    let config = MachineConfig {
        memory_torture: true,
        ..MachineConfig::default()
    };
    let mut m = Machine::with_tracker(config, NoLimitTracker);
    m.eval(&[
        sw("f"),
        w("func"),
        blk(vec![w("x")]),
        blk(vec![w("return"), w("x"), w("+"), i(1)]),
    ])
    .unwrap();
    assert_eq!(m.eval(&[w("f"), i(10)]).unwrap(), i(11));
    let out = m
        .eval(&[w("reduce"), blk(vec![i(1), w("+"), i(1), i(2), w("*"), i(3)])])
        .unwrap();
    assert_eq!(out, blk(vec![i(2), i(6)]), "collection at every step must not eat live values");
}

#[test]
fn always_malloc_mode_still_evaluates() {
    let config = MachineConfig {
        always_malloc: true,
        ..MachineConfig::default()
    };
    let mut m = Machine::with_tracker(config, NoLimitTracker);
    assert_eq!(m.eval(&[i(1), w("+"), i(2)]).unwrap(), i(3));
    m.recycle();
    assert_eq!(m.eval(&[i(2), w("+"), i(3)]).unwrap(), i(5));
}

// =============================================================================
// 5. The recycle and stats natives
// =============================================================================

#[test]
fn recycle_native_reports_freed_count() {
    let mut m = Machine::boot();
    m.recycle();
    m.eval(&[w("reduce"), blk(vec![i(1), i(2)])]).unwrap();
    let out = m.eval(&[w("recycle")]).unwrap();
    let Datum::Integer(freed) = out else {
        panic!("recycle returns an integer, got {out:?}");
    };
    assert!(freed > 0);
}

#[test]
fn stats_native_reports_live_nodes() {
    let mut m = Machine::boot();
    let out = m.eval(&[w("stats")]).unwrap();
    let Datum::Integer(live) = out else {
        panic!("stats returns an integer, got {out:?}");
    };
    assert!(live > 0, "boot globals are live nodes");
}
