#![no_main]

use libfuzzer_sys::fuzz_target;
use ytview::api::ytdlp::{parse_feed_lines, parse_streams};
use ytview::model::{FEED_MAX_VIDEOS, STREAM_SET_MAX, VideoId};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Malformed lines are skipped, never a panic.
    let feed = parse_feed_lines(text);
    assert!(feed.len() <= FEED_MAX_VIDEOS);
    for v in &feed.videos {
        assert!(VideoId::new(v.id.as_str()).is_ok(), "invalid id {:?} accepted", v.id);
    }

    let Ok(id) = VideoId::new("fuzz") else {
        return;
    };
    if let Ok(set) = parse_streams(id, text) {
        assert!(set.streams.len() <= STREAM_SET_MAX);
        let _ = set.best_for_height(1080);
    }
});
