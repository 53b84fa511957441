//! Tests for the `HeapStats` snapshot surface.
//!
//! Verifies that `Machine::stats()` returns accurate, deterministic
//! snapshots of arena state: live node counts, per-variant breakdowns,
//! and diffs between two points in time.

use revo::{Datum, Machine};

fn w(s: &str) -> Datum {
    Datum::Word(s.into())
}

fn sw(s: &str) -> Datum {
    Datum::SetWord(s.into())
}

fn i(n: i64) -> Datum {
    Datum::Integer(n)
}

// =============================================================================
// 1. Boot-time stats
// =============================================================================

#[test]
fn booted_machine_has_live_nodes_and_symbols() {
    let m = Machine::boot();
    let stats = m.stats();
    assert!(stats.live_nodes > 0, "boot globals occupy the arena");
    assert!(stats.interned_symbols > 100, "the well-known symbol set is pre-interned");
    assert!(
        stats.nodes_by_type.contains_key("ParamList"),
        "native paramlists show in the breakdown: {:?}",
        stats.nodes_by_type
    );
    assert!(stats.nodes_by_type.contains_key("Context"));
}

#[test]
fn totals_are_consistent() {
    let m = Machine::boot();
    let stats = m.stats();
    assert_eq!(
        stats.live_nodes + stats.free_slots,
        stats.total_slots,
        "live + free must cover the arena"
    );
    let counted: usize = stats.nodes_by_type.values().sum();
    assert_eq!(counted, stats.live_nodes, "breakdown sums to the live count");
}

// =============================================================================
// 2. Growth and diffs
// =============================================================================

#[test]
fn evaluation_growth_shows_in_the_diff() {
    let mut m = Machine::boot();
    m.recycle();
    let before = m.stats();
    m.eval(&[sw("data"), w("reduce"), Datum::Block(vec![i(1), i(2), i(3)])])
        .unwrap();
    let after = m.stats();
    let diff = before.diff(&after);
    assert!(diff.live_nodes_delta > 0, "defining data grows the arena: {diff}");
    assert!(
        diff.nodes_by_type_delta.get("Array").copied().unwrap_or(0) > 0,
        "the growth is in arrays: {diff}"
    );
}

#[test]
fn diff_of_identical_snapshots_is_empty() {
    let m = Machine::boot();
    let stats = m.stats();
    let diff = stats.diff(&stats.clone());
    assert!(diff.is_empty());
    assert_eq!(diff.to_string(), "HeapDiff: no changes");
}

#[test]
fn collection_shrinkage_shows_as_negative_deltas() {
    let mut m = Machine::boot();
    m.recycle();
    m.eval(&[w("reduce"), Datum::Block(vec![i(1), i(2), i(3)])]).unwrap();
    let before = m.stats();
    m.recycle();
    let after = m.stats();
    let diff = before.diff(&after);
    assert!(diff.live_nodes_delta < 0, "garbage collection shrinks live nodes: {diff}");
}

#[test]
fn interned_symbols_grow_with_new_spellings() {
    let mut m = Machine::boot();
    let before = m.stats();
    m.eval(&[sw("completely-fresh-spelling"), i(1)]).unwrap();
    let after = m.stats();
    assert!(
        before.diff(&after).interned_symbols_delta >= 1,
        "a new word spelling interns a symbol"
    );
}

// =============================================================================
// 3. Display
// =============================================================================

#[test]
fn diff_display_lists_changed_types() {
    let mut m = Machine::boot();
    m.recycle();
    let before = m.stats();
    m.eval(&[sw("t"), Datum::Text("hello".into())]).unwrap();
    let after = m.stats();
    let rendered = before.diff(&after).to_string();
    assert!(rendered.starts_with("HeapDiff:"), "got: {rendered}");
    assert!(rendered.contains("Text"), "got: {rendered}");
}
