#![no_main]

use libfuzzer_sys::fuzz_target;
use libsandbox::policy::{parse_function_policy, parse_policy, write_policy};

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Parsing must never panic, and whatever parses must survive a rewrite
        if let Ok(automaton) = parse_policy(input) {
            let text = write_policy(&automaton);
            let reparsed = parse_policy(&text).expect("written policy must parse");
            assert_eq!(reparsed.transition_count(), automaton.transition_count());
        }
        let _ = parse_function_policy(input);
    }
});
