#![no_main]

use libfuzzer_sys::fuzz_target;
use ytview::api::oauth::{PollOutcome, classify};

fuzz_target!(|data: &[u8]| {
    let Ok(body) = std::str::from_utf8(data) else {
        return;
    };

    // Any body classifies; a grant never expires before `now`.
    let now = 1_700_000_000;
    if let PollOutcome::Granted(token) = classify(body, now) {
        assert!(!token.access.is_empty());
        assert!(token.expiry_epoch >= now);
    }
});
