//! Property tests for message tokenization.
//!
//! Verifies that tokens are deterministic and that distinct
//! `(channel, second, id)` triples never share a token.

use proptest::prelude::*;
use textlog_proto::channel::ChannelPath;
use textlog_proto::token::{PendingMessageId, tokenize};

/// Strategy for channel object paths.
fn arb_channel() -> impl Strategy<Value = ChannelPath> {
    "/[a-z0-9_/]{0,24}".prop_map(ChannelPath::new)
}

/// Strategy for timestamps in a range every platform can render locally.
fn arb_timestamp() -> impl Strategy<Value = i64> {
    0i64..4_102_444_800
}

fn arb_message_id() -> impl Strategy<Value = PendingMessageId> {
    any::<u32>().prop_map(PendingMessageId::new)
}

proptest! {
    #[test]
    fn tokenize_is_deterministic(
        channel in arb_channel(),
        ts in arb_timestamp(),
        id in arb_message_id(),
    ) {
        prop_assert_eq!(tokenize(&channel, ts, id), tokenize(&channel, ts, id));
    }

    #[test]
    fn distinct_ids_give_distinct_tokens(
        channel in arb_channel(),
        ts in arb_timestamp(),
        a in arb_message_id(),
        b in arb_message_id(),
    ) {
        prop_assume!(a != b);
        prop_assert_ne!(tokenize(&channel, ts, a), tokenize(&channel, ts, b));
    }

    #[test]
    fn distinct_channels_give_distinct_tokens(
        a in arb_channel(),
        b in arb_channel(),
        ts in arb_timestamp(),
        id in arb_message_id(),
    ) {
        prop_assume!(a != b);
        prop_assert_ne!(tokenize(&a, ts, id), tokenize(&b, ts, id));
    }

    #[test]
    fn distinct_seconds_give_distinct_tokens(
        channel in arb_channel(),
        ts in arb_timestamp(),
        // Larger than any DST shift, so local renderings cannot coincide.
        delta in 7_201i64..86_400,
        id in arb_message_id(),
    ) {
        prop_assert_ne!(tokenize(&channel, ts, id), tokenize(&channel, ts + delta, id));
    }
}
