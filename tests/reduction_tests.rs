//! Integration tests for automaton reduction

mod utils;

use libsandbox::automaton::{State, Symbol};
use libsandbox::policy::parse_policy;
use libsandbox::reduce::{
    eliminate_epsilon, epsilon_closure, fold_entry_closure, prune_unreachable, reduce,
    ReduceOptions,
};
use utils::{simulate, states};

fn call(name: &str) -> Symbol {
    Symbol::call(name)
}

#[test]
fn test_epsilon_heavy_entry_region_is_eliminated() {
    // 0 -ε-> 1 -ε-> 2, each with its own call
    let a = parse_policy("0\n0 0 1\n1 0 2\n0 init 3\n1 open 4\n2 read 5\n").unwrap();
    let b = reduce(&a, ReduceOptions::default());

    assert!(!b.has_epsilon());
    assert_eq!(b.transitions_from(&State::from("0"), &call("init")), &states(&["3"]));
    assert_eq!(b.transitions_from(&State::from("0"), &call("open")), &states(&["4"]));
    assert_eq!(b.transitions_from(&State::from("0"), &call("read")), &states(&["5"]));
    // 1 and 2 are only reachable through epsilon, so pruning drops them
    assert!(!b.contains_state(&State::from("1")));
    assert!(!b.contains_state(&State::from("2")));
}

#[test]
fn test_target_closure_is_widened() {
    // after `open` the automaton is in 1 or (via ε) 2
    let a = parse_policy("0\n0 open 1\n1 0 2\n2 close 3\n").unwrap();
    let b = eliminate_epsilon(&a);
    assert_eq!(b.transitions_from(&State::from("0"), &call("open")), &states(&["1", "2"]));
    assert_eq!(b.transitions_from(&State::from("1"), &call("close")), &states(&["3"]));
}

#[test]
fn test_elimination_matches_closure_simulation() {
    let a = parse_policy("0\n0 0 1\n1 open 2\n2 0 0\n2 read 2\n2 close 3\n").unwrap();
    let b = eliminate_epsilon(&a);
    let words = [
        vec![call("open")],
        vec![call("open"), call("read")],
        vec![call("open"), call("open")],
        vec![call("open"), call("read"), call("close")],
        vec![call("close")],
    ];
    for word in &words {
        assert_eq!(simulate(&a, word), simulate(&b, word), "word {:?}", word);
    }
}

#[test]
fn test_epsilon_cycle_terminates() {
    let a = parse_policy("0\n0 0 1\n1 0 0\n1 open 1\n").unwrap();
    assert_eq!(epsilon_closure(&a, &State::from("0")), states(&["0", "1"]));
    let b = reduce(&a, ReduceOptions::default());
    assert!(!b.has_epsilon());
}

#[test]
fn test_prune_strips_dangling_targets() {
    let a = parse_policy("0\n0 open 1\n7 read 8\n").unwrap();
    let b = prune_unreachable(&a);
    assert_eq!(b.all_states(), &states(&["0", "1"]));
    assert_eq!(prune_unreachable(&b), b);
}

#[test]
fn test_fold_preserves_acceptance() {
    let a = parse_policy("0\n0 0 1\n1 0 0\n1 open 2\n2 read 1\n2 close 3\n").unwrap();
    let folded = reduce(
        &a,
        ReduceOptions {
            fold_entry_closure: true,
        },
    );
    let plain = reduce(&a, ReduceOptions::default());
    let words = [
        vec![call("open"), call("read"), call("open")],
        vec![call("open"), call("close")],
        vec![call("read")],
    ];
    for word in &words {
        assert_eq!(
            simulate(&folded, word).is_empty(),
            simulate(&plain, word).is_empty(),
            "word {:?}",
            word
        );
    }
    assert!(folded.state_count() <= plain.state_count());
}

#[test]
fn test_fold_without_epsilon_is_identity() {
    let a = parse_policy("0\n0 open 1\n").unwrap();
    assert_eq!(fold_entry_closure(&a), a);
}
