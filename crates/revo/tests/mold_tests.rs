//! MOLD and FORM through the natives and the host surface: delimiters,
//! cycle safety, and the /limit option.

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

fn blk(items: Vec<Datum>) -> Datum {
    Datum::Block(items)
}

fn molded(m: &mut Machine, code: &[Datum]) -> String {
    match m.eval(code).unwrap() {
        Datum::Text(s) => s,
        other => panic!("mold must yield text, got {other:?}"),
    }
}

// =============================================================================
// 1. Scalars and words
// =============================================================================

#[test]
fn scalars_mold_to_source_forms() {
    let mut m = Machine::boot();
    assert_eq!(molded(&mut m, &[w("mold"), i(-7)]), "-7");
    assert_eq!(molded(&mut m, &[w("mold"), Datum::Decimal(2.5)]), "2.5");
    assert_eq!(molded(&mut m, &[w("mold"), Datum::Logic(true)]), "true");
    assert_eq!(molded(&mut m, &[w("mold"), Datum::Blank]), "_");
    assert_eq!(molded(&mut m, &[w("mold"), Datum::Char('x')]), "#\"x\"");
}

#[test]
fn words_mold_with_their_sigils() {
    let mut m = Machine::boot();
    assert_eq!(molded(&mut m, &[w("mold"), Datum::LitWord("abc".into())]), "abc");
    assert_eq!(
        molded(&mut m, &[w("mold"), Datum::Quoted(1, Box::new(Datum::SetWord("abc".into())))]),
        "abc:"
    );
    assert_eq!(
        molded(&mut m, &[w("mold"), Datum::Quoted(1, Box::new(Datum::GetWord("abc".into())))]),
        ":abc"
    );
}

#[test]
fn text_molds_with_delimiters_and_forms_without() {
    let mut m = Machine::boot();
    assert_eq!(molded(&mut m, &[w("mold"), Datum::Text("hi".into())]), "\"hi\"");
    assert_eq!(molded(&mut m, &[w("form"), Datum::Text("hi".into())]), "hi");
}

#[test]
fn binary_molds_as_hex() {
    let mut m = Machine::boot();
    assert_eq!(
        molded(&mut m, &[w("mold"), Datum::Binary(vec![0xDE, 0xAD])]),
        "#{DEAD}"
    );
}

// =============================================================================
// 2. Arrays and paths
// =============================================================================

#[test]
fn blocks_and_groups_mold_with_brackets() {
    let mut m = Machine::boot();
    assert_eq!(
        molded(&mut m, &[w("mold"), blk(vec![i(1), i(2), blk(vec![i(3)])])]),
        "[1 2 [3]]"
    );
    assert_eq!(
        molded(&mut m, &[w("mold"), Datum::Quoted(1, Box::new(Datum::Group(vec![i(1)])))]),
        "(1)"
    );
}

#[test]
fn paths_mold_with_slashes() {
    let mut m = Machine::boot();
    let path = Datum::Quoted(1, Box::new(Datum::Path(vec![w("a"), w("b"), i(3)])));
    assert_eq!(molded(&mut m, &[w("mold"), path]), "a/b/3");
}

#[test]
fn form_of_a_block_drops_delimiters() {
    let mut m = Machine::boot();
    assert_eq!(
        molded(&mut m, &[w("form"), blk(vec![i(1), Datum::Text("a".into()), i(2)])]),
        "1 a 2"
    );
}

// =============================================================================
// 3. Cycle safety
// =============================================================================

#[test]
fn cyclic_block_molds_with_ellipsis_and_terminates() {
    let mut m = Machine::boot();
    // b: [a] append b b mold b
    let out = m
        .eval(&[
            sw("b"),
            blk(vec![w("a")]),
            w("append"),
            w("b"),
            w("b"),
            w("mold"),
            w("b"),
        ])
        .unwrap();
    assert_eq!(out, Datum::Text("[a [...]]".into()), "revisited node renders as ellipsis");
}

#[test]
fn mutually_cyclic_blocks_terminate() {
    let mut m = Machine::boot();
    m.eval(&[sw("x"), blk(vec![i(1)]), sw("y"), blk(vec![i(2)])]).unwrap();
    m.eval(&[w("append"), w("x"), w("y")]).unwrap();
    m.eval(&[w("append"), w("y"), w("x")]).unwrap();
    let out = molded(&mut m, &[w("mold"), w("x")]);
    assert!(out.contains("..."), "cross-cycle must hit the ellipsis, got {out}");
    assert!(out.len() < 100, "output stays bounded");
}

// =============================================================================
// 4. The /limit option
// =============================================================================

#[test]
fn mold_limit_truncates_long_output() {
    let mut m = Machine::boot();
    let long = blk((1..=50).map(i).collect());
    let out = molded(
        &mut m,
        &[Datum::Path(vec![w("mold"), w("limit")]), long, i(10)],
    );
    assert!(out.chars().count() <= 13, "10 chars plus the ellipsis, got {out:?}");
    assert!(out.ends_with("..."));
}

// =============================================================================
// 5. Host-side mold
// =============================================================================

#[test]
fn host_mold_matches_native_mold() {
    let mut m = Machine::boot();
    let value = blk(vec![i(1), Datum::Text("x".into())]);
    let host = m.mold(&value).unwrap();
    let native = molded(&mut m, &[w("mold"), value]);
    assert_eq!(host, native);
}
