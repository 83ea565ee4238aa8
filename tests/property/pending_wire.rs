//! Property tests for pending-message normalization.
//!
//! Both wire shapes must describe the same logical record, and no input may
//! make normalization panic.

use proptest::prelude::*;
use textlog_proto::entry::{MessageFlags, MessageType};
use textlog_proto::pending::{
    HEADER_PENDING_ID, HEADER_RECEIVED, HEADER_SENDER, HEADER_TYPE, LegacyPendingMessage,
    MessagePart, PART_CONTENT, PartValue, PendingMessage, RichPendingMessage,
};

fn arb_part_value() -> impl Strategy<Value = PartValue> {
    prop_oneof![
        any::<bool>().prop_map(PartValue::Bool),
        any::<u64>().prop_map(PartValue::UInt),
        ".{0,16}".prop_map(PartValue::Text),
    ]
}

fn arb_part() -> impl Strategy<Value = MessagePart> {
    prop::collection::btree_map(
        prop_oneof![
            Just(HEADER_PENDING_ID.to_string()),
            Just(HEADER_RECEIVED.to_string()),
            Just(HEADER_SENDER.to_string()),
            Just(HEADER_TYPE.to_string()),
            Just(PART_CONTENT.to_string()),
            "[a-z-]{1,12}",
        ],
        arb_part_value(),
        0..6,
    )
}

proptest! {
    #[test]
    fn arbitrary_rich_messages_never_panic(parts in prop::collection::vec(arb_part(), 0..4)) {
        let _ = PendingMessage::try_from(RichPendingMessage { parts });
    }

    #[test]
    fn rich_and_legacy_shapes_agree(
        id in any::<u32>(),
        ts in any::<u32>(),
        sender in any::<u32>(),
        kind in 0u32..4,
        text in "[^\x00]{1,64}",
    ) {
        let mut headers = MessagePart::new();
        headers.insert(HEADER_PENDING_ID.into(), PartValue::UInt(u64::from(id)));
        headers.insert(HEADER_RECEIVED.into(), PartValue::UInt(u64::from(ts)));
        headers.insert(HEADER_SENDER.into(), PartValue::UInt(u64::from(sender)));
        headers.insert(HEADER_TYPE.into(), PartValue::UInt(u64::from(kind)));
        let mut body = MessagePart::new();
        body.insert(PART_CONTENT.into(), PartValue::Text(text.clone()));

        let rich = PendingMessage::try_from(RichPendingMessage { parts: vec![headers, body] });
        let legacy = PendingMessage::from(LegacyPendingMessage {
            id,
            timestamp: ts,
            sender,
            message_type: kind,
            flags: 0,
            text,
        });

        prop_assert_eq!(rich, Ok(legacy.clone()));
        prop_assert_eq!(legacy.flags, MessageFlags::empty());
        prop_assert_ne!(legacy.message_type, MessageType::DeliveryReport);
    }
}
