use proptest::prelude::*;
use shepherd::services::OutputLog;

proptest! {
    /// Property: the retained bytes never exceed the cap.
    #[test]
    fn prop_bytes_never_exceed_cap(
        cap in 1usize..256,
        chunks in prop::collection::vec(".{0,64}", 0..40)
    ) {
        let mut log = OutputLog::new(cap);
        for chunk in chunks {
            log.push(chunk);
            prop_assert!(log.bytes() <= cap, "{} > {}", log.bytes(), cap);
            let counted: usize = log.chunks().map(str::len).sum();
            prop_assert_eq!(counted, log.bytes());
        }
    }

    /// Property: the newest chunk survives, cut to its tail if oversized.
    #[test]
    fn prop_newest_chunk_suffix_is_retained(
        cap in 1usize..128,
        chunks in prop::collection::vec("[a-z0-9é]{1,200}", 1..20)
    ) {
        let mut log = OutputLog::new(cap);
        for chunk in &chunks {
            log.push(chunk.clone());
        }
        let newest = chunks.last().unwrap();
        let kept = log.chunks().last().unwrap();
        prop_assert!(newest.ends_with(kept));
        if newest.len() <= cap {
            prop_assert_eq!(kept, newest.as_str());
        }
    }
}
