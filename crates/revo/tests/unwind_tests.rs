//! Two-channel unwind tests: RESCUE barriers, FAIL construction,
//! throw/fail separation, halt, and post-fail state balance.

use revo::{Datum, LimitedTracker, Machine, MachineConfig};

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
// 1. RESCUE catches fails into error values
// =============================================================================

#[test]
fn rescue_returns_the_error_context() {
    let mut m = Machine::boot();
    let out = m.eval(&[w("rescue"), blk(vec![i(1), w("/"), i(0)])]).unwrap();
    let Datum::Error(fault) = out else {
        panic!("rescue of a failing block must yield an error, got {out:?}");
    };
    assert_eq!(fault.id, "zero-divide");
    assert_eq!(fault.category, "math");
    assert!(!fault.message.is_empty());
}

#[test]
fn rescue_passes_successful_results_through() {
    let mut m = Machine::boot();
    assert_eq!(m.eval(&[w("rescue"), blk(vec![i(1), w("+"), i(1)])]).unwrap(), i(2));
}

#[test]
fn rescued_error_reports_where_and_near() {
    let mut m = Machine::boot();
    m.eval(&[
        sw("f"),
        w("func"),
        blk(vec![w("x")]),
        blk(vec![w("x"), w("/"), i(0)]),
    ])
    .unwrap();
    let out = m.eval(&[w("rescue"), blk(vec![w("f"), i(1)])]).unwrap();
    let Datum::Error(fault) = out else {
        panic!("expected an error value");
    };
    assert!(
        fault.where_.contains(&"f".to_string()),
        "WHERE must include the failing call, got {:?}",
        fault.where_
    );
    assert!(!fault.near.is_empty(), "NEAR must show the source excerpt");
}

#[test]
fn evaluation_continues_after_a_caught_fail() {
    let mut m = Machine::boot();
    m.eval(&[w("rescue"), blk(vec![i(1), w("/"), i(0)])]).unwrap();
    assert_eq!(m.eval(&[i(2), w("+"), i(2)]).unwrap(), i(4), "machine state stayed balanced");
}

#[test]
fn fail_mid_fulfillment_leaves_no_partial_frame() {
    let mut m = Machine::boot();
    // the fail happens while gathering add's second argument
    let out = m
        .eval(&[w("rescue"), blk(vec![w("add"), i(1), Datum::Group(vec![i(1), w("/"), i(0)])])])
        .unwrap();
    assert!(matches!(out, Datum::Error(_)));
    // a leftover frame would corrupt this next call
    assert_eq!(m.eval(&[w("add"), i(2), i(3)]).unwrap(), i(5));
}

// =============================================================================
// 2. FAIL raises structured errors
// =============================================================================

#[test]
fn fail_with_text_makes_a_user_error() {
    let mut m = Machine::boot();
    let fault = m.eval(&[w("fail"), Datum::Text("boom".into())]).unwrap_err();
    assert_eq!(fault.id, "user");
    assert_eq!(fault.category, "user");
    assert_eq!(fault.message, "boom");
}

#[test]
fn fail_with_an_error_value_re_raises_it() {
    let mut m = Machine::boot();
    m.eval(&[sw("err"), w("rescue"), blk(vec![i(1), w("/"), i(0)])]).unwrap();
    let fault = m.eval(&[w("fail"), w("err")]).unwrap_err();
    assert_eq!(fault.id, "zero-divide");
}

#[test]
fn attempt_converts_fails_to_null() {
    let mut m = Machine::boot();
    assert_eq!(m.eval(&[w("attempt"), blk(vec![i(1), w("/"), i(0)])]).unwrap(), Datum::Null);
    assert_eq!(m.eval(&[w("attempt"), blk(vec![i(7)])]).unwrap(), i(7));
}

#[test]
fn script_provenance_reaches_the_error() {
    let mut m = Machine::boot();
    let fault = m
        .eval_script(&[i(1), w("/"), i(0)], "deploy.reb", 12)
        .unwrap_err();
    assert_eq!(fault.file.as_deref(), Some("deploy.reb"));
    assert_eq!(fault.line, Some(12));
}

#[test]
fn uncaught_fail_renders_a_display_form() {
    let mut m = Machine::boot();
    let fault = m.eval(&[i(1), w("/"), i(0)]).unwrap_err();
    let display = fault.to_string();
    assert!(display.starts_with("** math error:"), "got: {display}");
}

// =============================================================================
// 3. Throw and fail stay separate channels
// =============================================================================

#[test]
fn throw_crosses_rescue_uncaught() {
    let mut m = Machine::boot();
    let out = m
        .eval(&[w("catch"), blk(vec![w("rescue"), blk(vec![w("throw"), i(3)])])])
        .unwrap();
    assert_eq!(out, i(3), "rescue catches fail only, never throw");
}

#[test]
fn fail_crosses_catch_uncaught() {
    let mut m = Machine::boot();
    let fault = m
        .eval(&[w("catch"), blk(vec![i(1), w("/"), i(0)])])
        .unwrap_err();
    assert_eq!(fault.id, "zero-divide", "catch must not intercept fails");
}

#[test]
fn return_is_not_caught_by_intervening_catch() {
    let mut m = Machine::boot();
    // catch inside f must not see f's definitional return
    m.eval(&[
        sw("f"),
        w("func"),
        blk(vec![]),
        blk(vec![w("catch"), blk(vec![w("return"), i(1)]), i(999)]),
    ])
    .unwrap();
    assert_eq!(m.eval(&[w("f")]).unwrap(), i(1));
}

// =============================================================================
// 4. Stack overflow and halt
// =============================================================================

#[test]
fn runaway_recursion_raises_the_prebuilt_overflow_error() {
    let mut m = Machine::boot();
    m.eval(&[sw("f"), w("func"), blk(vec![]), blk(vec![w("f")])]).unwrap();
    let fault = m.eval(&[w("f")]).unwrap_err();
    assert_eq!(fault.id, "stack-overflow");
}

#[test]
fn depth_budget_is_configurable_through_the_tracker() {
    let mut m = Machine::with_tracker(MachineConfig::default(), LimitedTracker::new(None, None, 16));
    m.eval(&[sw("f"), w("func"), blk(vec![]), blk(vec![w("f")])]).unwrap();
    let fault = m.eval(&[w("f")]).unwrap_err();
    assert_eq!(fault.id, "stack-overflow");
}

#[test]
fn requested_halt_raises_at_the_next_step() {
    let mut m = Machine::boot();
    m.request_halt();
    let fault = m.eval(&[i(1), w("+"), i(1)]).unwrap_err();
    assert_eq!(fault.id, "halted");
    // the signal is consumed: the machine runs normally afterwards
    assert_eq!(m.eval(&[i(1), w("+"), i(1)]).unwrap(), i(2));
}

// =============================================================================
// 5. Error values are plain contexts
// =============================================================================

#[test]
fn error_fields_read_through_paths() {
    let mut m = Machine::boot();
    m.eval(&[sw("err"), w("rescue"), blk(vec![i(1), w("/"), i(0)])]).unwrap();
    let out = m.eval(&[Datum::Path(vec![w("err"), w("id")])]).unwrap();
    assert_eq!(out, w("zero-divide"), "error id field is a word");
    let out = m.eval(&[Datum::Path(vec![w("err"), w("type")])]).unwrap();
    assert_eq!(out, w("math"));
}
