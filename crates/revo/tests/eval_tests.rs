//! Evaluator end-to-end tests: step classification, enfix dispatch,
//! deferral, control constructs, and definitional return.

use revo::{Datum, Machine};

fn w(s: &str) -> Datum {
    Datum::Word(s.into())
}

fn sw(s: &str) -> Datum {
    Datum::SetWord(s.into())
}

fn gw(s: &str) -> Datum {
    Datum::GetWord(s.into())
}

fn lw(s: &str) -> Datum {
    Datum::LitWord(s.into())
}

fn i(n: i64) -> Datum {
    Datum::Integer(n)
}

fn blk(items: Vec<Datum>) -> Datum {
    Datum::Block(items)
}

// =============================================================================
// 1. Basics: inert values, set-words, words
// =============================================================================

#[test]
fn empty_evaluation_yields_null() {
    let mut m = Machine::boot();
    assert_eq!(m.eval(&[]).unwrap(), Datum::Null, "do [] must be null");
}

#[test]
fn inert_values_evaluate_to_themselves() {
    let mut m = Machine::boot();
    assert_eq!(m.eval(&[i(7)]).unwrap(), i(7));
    assert_eq!(m.eval(&[Datum::Text("hi".into())]).unwrap(), Datum::Text("hi".into()));
    assert_eq!(m.eval(&[blk(vec![i(1), i(2)])]).unwrap(), blk(vec![i(1), i(2)]));
}

#[test]
fn set_word_defines_and_word_fetches() {
    let mut m = Machine::boot();
    let out = m.eval(&[sw("x"), i(41), w("x"), w("+"), i(1)]).unwrap();
    assert_eq!(out, i(42));
}

#[test]
fn definitions_persist_across_evaluations() {
    let mut m = Machine::boot();
    m.eval(&[sw("x"), i(10)]).unwrap();
    assert_eq!(m.eval(&[w("x")]).unwrap(), i(10));
}

#[test]
fn unbound_word_raises_not_bound() {
    let mut m = Machine::boot();
    let fault = m.eval(&[w("no-such-word")]).unwrap_err();
    assert_eq!(fault.id, "not-bound", "got: {fault}");
}

#[test]
fn lit_word_evaluates_to_word() {
    let mut m = Machine::boot();
    assert_eq!(m.eval(&[lw("abc")]).unwrap(), w("abc"));
}

#[test]
fn get_word_fetches_action_without_invoking() {
    let mut m = Machine::boot();
    assert_eq!(m.eval(&[gw("add")]).unwrap(), Datum::Action);
}

#[test]
fn quoted_value_peels_one_level_per_evaluation() {
    let mut m = Machine::boot();
    let out = m.eval(&[Datum::Quoted(2, Box::new(i(5)))]).unwrap();
    assert_eq!(out, Datum::Quoted(1, Box::new(i(5))));
}

// =============================================================================
// 2. Enfix: precedence, chaining, errors
// =============================================================================

#[test]
fn enfix_math_is_left_to_right() {
    let mut m = Machine::boot();
    assert_eq!(m.eval(&[i(1), w("+"), i(2), w("*"), i(3)]).unwrap(), i(9));
}

#[test]
fn prefix_argument_completes_enfix() {
    let mut m = Machine::boot();
    // add 1 2 * 3 -> the second argument is the full `2 * 3`
    assert_eq!(m.eval(&[w("add"), i(1), i(2), w("*"), i(3)]).unwrap(), i(7));
}

#[test]
fn enfix_at_head_of_expression_errors() {
    let mut m = Machine::boot();
    let fault = m.eval(&[w("+"), i(1)]).unwrap_err();
    assert_eq!(fault.id, "no-left-arg", "got: {fault}");
}

#[test]
fn comparison_operators_work_enfixed() {
    let mut m = Machine::boot();
    assert_eq!(m.eval(&[i(1), w("<"), i(2)]).unwrap(), Datum::Logic(true));
    assert_eq!(m.eval(&[i(1), w(">"), i(2)]).unwrap(), Datum::Logic(false));
    assert_eq!(m.eval(&[i(3), w("="), i(3)]).unwrap(), Datum::Logic(true));
}

// =============================================================================
// 3. Branching with deferred enfix (ELSE / THEN)
// =============================================================================

#[test]
fn if_true_else_takes_the_if_branch() {
    let mut m = Machine::boot();
    let out = m
        .eval(&[w("if"), Datum::Logic(true), blk(vec![i(1)]), w("else"), blk(vec![i(2)])])
        .unwrap();
    assert_eq!(out, i(1), "else must defer to the whole if expression");
}

#[test]
fn if_false_else_takes_the_else_branch() {
    let mut m = Machine::boot();
    let out = m
        .eval(&[w("if"), Datum::Logic(false), blk(vec![i(1)]), w("else"), blk(vec![i(2)])])
        .unwrap();
    assert_eq!(out, i(2));
}

#[test]
fn then_runs_on_non_null_only() {
    let mut m = Machine::boot();
    let out = m
        .eval(&[w("if"), Datum::Logic(true), blk(vec![i(5)]), w("then"), blk(vec![i(9)])])
        .unwrap();
    assert_eq!(out, i(9));
    let out = m
        .eval(&[w("if"), Datum::Logic(false), blk(vec![i(5)]), w("then"), blk(vec![i(9)])])
        .unwrap();
    assert_eq!(out, Datum::Null);
}

#[test]
fn either_picks_branches() {
    let mut m = Machine::boot();
    let out = m
        .eval(&[w("either"), Datum::Logic(false), blk(vec![i(1)]), blk(vec![i(2)])])
        .unwrap();
    assert_eq!(out, i(2));
}

#[test]
fn if_false_yields_null() {
    let mut m = Machine::boot();
    assert_eq!(m.eval(&[w("if"), Datum::Logic(false), blk(vec![i(1)])]).unwrap(), Datum::Null);
}

// =============================================================================
// 4. Definitional return
// =============================================================================

#[test]
fn return_jumps_to_the_functions_frame() {
    let mut m = Machine::boot();
    // f: func [x] [return x + 1 | 999]  (the `| 999` is unreachable)
    m.eval(&[
        sw("f"),
        w("func"),
        blk(vec![w("x")]),
        blk(vec![w("return"), w("x"), w("+"), i(1), w("|"), i(999)]),
    ])
    .unwrap();
    assert_eq!(m.eval(&[w("f"), i(10)]).unwrap(), i(11));
}

#[test]
fn function_without_return_yields_last_value() {
    let mut m = Machine::boot();
    m.eval(&[
        sw("g"),
        w("func"),
        blk(vec![w("a"), w("b")]),
        blk(vec![w("a"), w("*"), w("b")]),
    ])
    .unwrap();
    assert_eq!(m.eval(&[w("g"), i(6), i(7)]).unwrap(), i(42));
}

#[test]
fn return_in_nested_block_still_returns_from_function() {
    let mut m = Machine::boot();
    m.eval(&[
        sw("f"),
        w("func"),
        blk(vec![w("x")]),
        blk(vec![
            w("if"),
            Datum::Logic(true),
            blk(vec![w("return"), i(1)]),
            i(999),
        ]),
    ])
    .unwrap();
    assert_eq!(m.eval(&[w("f"), i(0)]).unwrap(), i(1));
}

#[test]
fn each_activation_gets_its_own_arguments() {
    let mut m = Machine::boot();
    // recursion: sum: func [n] [if n < 1 [return 0] n + sum n - 1]
    m.eval(&[
        sw("sum"),
        w("func"),
        blk(vec![w("n")]),
        blk(vec![
            w("if"),
            w("n"),
            w("<"),
            i(1),
            blk(vec![w("return"), i(0)]),
            w("n"),
            w("+"),
            w("sum"),
            w("n"),
            w("-"),
            i(1),
        ]),
    ])
    .unwrap();
    assert_eq!(m.eval(&[w("sum"), i(4)]).unwrap(), i(10));
}

// =============================================================================
// 5. Invisibles
// =============================================================================

#[test]
fn comment_is_invisible_and_leaves_no_stale_output() {
    let mut m = Machine::boot();
    let out = m.eval(&[w("comment"), Datum::Text("hi".into())]).unwrap();
    assert_eq!(out, Datum::Null);
}

#[test]
fn comment_between_statements_preserves_the_previous_value() {
    let mut m = Machine::boot();
    let out = m.eval(&[i(3), w("comment"), Datum::Text("x".into())]).unwrap();
    assert_eq!(out, i(3));
}

// =============================================================================
// 6. Loops and loop throws
// =============================================================================

#[test]
fn while_loops_until_condition_fails() {
    let mut m = Machine::boot();
    let out = m
        .eval(&[
            sw("total"),
            i(0),
            sw("i"),
            i(0),
            w("while"),
            blk(vec![w("i"), w("<"), i(5)]),
            blk(vec![
                sw("i"),
                w("i"),
                w("+"),
                i(1),
                sw("total"),
                w("total"),
                w("+"),
                w("i"),
            ]),
            w("total"),
        ])
        .unwrap();
    assert_eq!(out, i(15));
}

#[test]
fn repeat_runs_a_fixed_count() {
    let mut m = Machine::boot();
    let out = m
        .eval(&[
            sw("n"),
            i(0),
            w("repeat"),
            i(4),
            blk(vec![sw("n"), w("n"), w("+"), i(1)]),
            w("n"),
        ])
        .unwrap();
    assert_eq!(out, i(4));
}

#[test]
fn break_stops_the_nearest_loop() {
    let mut m = Machine::boot();
    let out = m
        .eval(&[
            sw("n"),
            i(0),
            w("repeat"),
            i(5),
            blk(vec![
                sw("n"),
                w("n"),
                w("+"),
                i(1),
                w("if"),
                w("n"),
                w(">"),
                i(2),
                blk(vec![w("break")]),
            ]),
            w("n"),
        ])
        .unwrap();
    assert_eq!(out, i(3), "break must cross the if branch to stop repeat");
}

#[test]
fn continue_skips_to_the_next_iteration() {
    let mut m = Machine::boot();
    let out = m
        .eval(&[
            sw("n"),
            i(0),
            sw("total"),
            i(0),
            w("repeat"),
            i(5),
            blk(vec![
                sw("n"),
                w("n"),
                w("+"),
                i(1),
                w("if"),
                w("n"),
                w("="),
                i(2),
                blk(vec![w("continue")]),
                sw("total"),
                w("total"),
                w("+"),
                i(1),
            ]),
            w("total"),
        ])
        .unwrap();
    assert_eq!(out, i(4));
}

#[test]
fn any_returns_first_truthy_and_all_requires_every() {
    let mut m = Machine::boot();
    let out = m
        .eval(&[w("any"), blk(vec![Datum::Logic(false), i(7), i(9)])])
        .unwrap();
    assert_eq!(out, i(7));
    let out = m.eval(&[w("all"), blk(vec![i(1), i(2), i(3)])]).unwrap();
    assert_eq!(out, i(3));
    let out = m
        .eval(&[w("all"), blk(vec![i(1), Datum::Logic(false), i(3)])])
        .unwrap();
    assert_eq!(out, Datum::Null);
}

// =============================================================================
// 7. Catch / throw
// =============================================================================

#[test]
fn catch_receives_the_thrown_value() {
    let mut m = Machine::boot();
    let out = m
        .eval(&[w("catch"), blk(vec![w("throw"), i(7), i(999)])])
        .unwrap();
    assert_eq!(out, i(7), "code after throw must not run");
}

#[test]
fn named_throw_matches_named_catch() {
    let mut m = Machine::boot();
    let out = m
        .eval(&[
            Datum::Path(vec![w("catch"), w("name")]),
            blk(vec![
                Datum::Path(vec![w("throw"), w("name")]),
                i(5),
                lw("tag"),
            ]),
            lw("tag"),
        ])
        .unwrap();
    assert_eq!(out, i(5));
}

#[test]
fn named_throw_passes_an_unnamed_catch() {
    let mut m = Machine::boot();
    let fault = m
        .eval(&[
            w("catch"),
            blk(vec![
                Datum::Path(vec![w("throw"), w("name")]),
                i(5),
                lw("tag"),
            ]),
        ])
        .unwrap_err();
    assert_eq!(fault.id, "no-catch", "unmatched throw becomes a no-catch fail");
}

#[test]
fn uncaught_throw_reports_no_catch() {
    let mut m = Machine::boot();
    let fault = m.eval(&[w("throw"), i(5)]).unwrap_err();
    assert_eq!(fault.id, "no-catch");
}

// =============================================================================
// 8. Get/set, paths, series
// =============================================================================

#[test]
fn set_and_get_words() {
    let mut m = Machine::boot();
    assert_eq!(m.eval(&[w("set"), lw("a"), i(3)]).unwrap(), i(3));
    assert_eq!(m.eval(&[w("get"), lw("a")]).unwrap(), i(3));
}

#[test]
fn path_picks_from_blocks() {
    let mut m = Machine::boot();
    m.eval(&[sw("b"), blk(vec![i(10), i(20), i(30)])]).unwrap();
    assert_eq!(m.eval(&[Datum::Path(vec![w("b"), i(2)])]).unwrap(), i(20));
}

#[test]
fn set_path_pokes_into_blocks() {
    let mut m = Machine::boot();
    m.eval(&[sw("b"), blk(vec![i(10), i(20)])]).unwrap();
    m.eval(&[Datum::SetPath(vec![w("b"), i(2)]), i(99)]).unwrap();
    assert_eq!(m.eval(&[Datum::Path(vec![w("b"), i(2)])]).unwrap(), i(99));
}

#[test]
fn group_in_path_evaluates_to_picker() {
    let mut m = Machine::boot();
    m.eval(&[sw("b"), blk(vec![i(10), i(20), i(30)])]).unwrap();
    let out = m
        .eval(&[Datum::Path(vec![
            w("b"),
            Datum::Group(vec![i(1), w("+"), i(1)]),
        ])])
        .unwrap();
    assert_eq!(out, i(20));
}

#[test]
fn series_natives_append_insert_pick() {
    let mut m = Machine::boot();
    m.eval(&[sw("b"), blk(vec![i(1)])]).unwrap();
    assert_eq!(
        m.eval(&[w("append"), w("b"), i(2)]).unwrap(),
        blk(vec![i(1), i(2)])
    );
    assert_eq!(m.eval(&[w("length-of"), w("b")]).unwrap(), i(2));
    assert_eq!(m.eval(&[w("first"), w("b")]).unwrap(), i(1));
    assert_eq!(m.eval(&[w("last"), w("b")]).unwrap(), i(2));
    assert_eq!(m.eval(&[w("pick"), w("b"), i(2)]).unwrap(), i(2));
}

#[test]
fn reduce_evaluates_each_expression() {
    let mut m = Machine::boot();
    let out = m
        .eval(&[w("reduce"), blk(vec![i(1), w("+"), i(1), i(2), w("*"), i(2)])])
        .unwrap();
    assert_eq!(out, blk(vec![i(2), i(4)]));
}

#[test]
fn groups_evaluate_inline() {
    let mut m = Machine::boot();
    let out = m
        .eval(&[Datum::Group(vec![i(2), w("+"), i(3)]), w("*"), i(4)])
        .unwrap();
    assert_eq!(out, i(20));
}

#[test]
fn variadic_parameter_pulls_on_demand() {
    let mut m = Machine::boot();
    // f: func [rest [varargs!]] [add take rest take rest]
    m.eval(&[
        sw("f"),
        w("func"),
        blk(vec![w("rest"), blk(vec![w("varargs!")])]),
        blk(vec![w("add"), w("take"), w("rest"), w("take"), w("rest")]),
    ])
    .unwrap();
    assert_eq!(m.eval(&[w("f"), i(3), i(4)]).unwrap(), i(7));
}

#[test]
fn frozen_series_refuse_mutation() {
    let mut m = Machine::boot();
    m.eval(&[sw("b"), blk(vec![i(1), blk(vec![i(2)])])]).unwrap();
    m.eval(&[Datum::Path(vec![w("freeze"), w("deep")]), w("b")]).unwrap();
    let fault = m.eval(&[w("append"), w("b"), i(9)]).unwrap_err();
    assert_eq!(fault.id, "protected");
    // deep freeze reaches interior arrays
    let fault = m
        .eval(&[w("append"), Datum::Path(vec![w("b"), i(2)]), i(9)])
        .unwrap_err();
    assert_eq!(fault.id, "protected");
}

#[test]
fn take_removes_from_the_head_of_a_block() {
    let mut m = Machine::boot();
    m.eval(&[sw("b"), blk(vec![i(1), i(2)])]).unwrap();
    assert_eq!(m.eval(&[w("take"), w("b")]).unwrap(), i(1));
    assert_eq!(m.eval(&[w("b")]).unwrap(), blk(vec![i(2)]));
}

// =============================================================================
// 9. Math edge cases
// =============================================================================

#[test]
fn integer_division_promotes_when_uneven() {
    let mut m = Machine::boot();
    assert_eq!(m.eval(&[i(6), w("/"), i(2)]).unwrap(), i(3));
    assert_eq!(m.eval(&[i(1), w("/"), i(2)]).unwrap(), Datum::Decimal(0.5));
}

#[test]
fn integer_overflow_raises() {
    let mut m = Machine::boot();
    let fault = m.eval(&[i(i64::MAX), w("+"), i(1)]).unwrap_err();
    assert_eq!(fault.id, "overflow");
}

#[test]
fn type_of_reports_datatypes() {
    let mut m = Machine::boot();
    assert_eq!(m.eval(&[w("type-of"), i(1)]).unwrap(), Datum::Datatype("integer!".into()));
    assert_eq!(
        m.eval(&[w("type-of"), blk(vec![])]).unwrap(),
        Datum::Datatype("block!".into())
    );
}

#[test]
fn argument_type_mismatch_reports_expect_arg() {
    let mut m = Machine::boot();
    let fault = m.eval(&[w("add"), i(1), Datum::Text("x".into())]).unwrap_err();
    assert_eq!(fault.id, "expect-arg", "got: {fault}");
    assert!(fault.where_.contains(&"add".to_string()), "WHERE must name the call");
}
