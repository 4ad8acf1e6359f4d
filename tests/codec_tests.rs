use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};

use salt_dispatch::error::CodecError;
use salt_dispatch::protocol::{
    decode, encode, encode_message, Envelope, FrameHeader, JobId, JobRequest, Message, MessageKind,
    MinionResult, FRAME_HEADER_SIZE,
};
use salt_dispatch::targeting::TargetType;

fn arb_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 _.:-]{0,16}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..4_102_444_800, 0u32..1_000_000_000)
        .prop_map(|(secs, nanos)| Utc.timestamp_opt(secs, nanos).unwrap())
}

fn arb_target_type() -> impl Strategy<Value = TargetType> {
    prop_oneof![
        Just(TargetType::Glob),
        Just(TargetType::List),
        Just(TargetType::Grain),
        Just(TargetType::GrainPcre),
        Just(TargetType::Pillar),
        Just(TargetType::PillarPcre),
        Just(TargetType::Pcre),
        Just(TargetType::Nodegroup),
        Just(TargetType::Compound),
    ]
}

prop_compose! {
    fn arb_job_request()(
        jid in "[0-9]{20}",
        function_name in "[a-z]{1,8}\\.[a-z_]{1,12}",
        arguments in prop::collection::vec(arb_value(), 0..4),
        keyword_arguments in prop::collection::btree_map("[a-z_]{1,8}", arb_value(), 0..4),
        target_expression in "[a-z0-9*,@: ]{1,24}",
        target_type in arb_target_type(),
        issued_at in arb_timestamp(),
        timeout_ms in 1u64..86_400_000,
        tgt_minions in prop::collection::btree_set("[a-z]{1,6}[0-9]{0,2}", 0..8),
    ) -> JobRequest {
        JobRequest {
            job_id: JobId::new(jid),
            function_name,
            arguments,
            keyword_arguments,
            target_expression,
            target_type,
            issued_at,
            timeout: Duration::from_millis(timeout_ms),
            tgt_minions,
        }
    }
}

proptest! {
    #[test]
    fn job_requests_survive_the_wire(request in arb_job_request()) {
        let frame = encode_message(&Message::Job(request.clone())).unwrap();
        let (envelope, message) = decode(&frame).unwrap();

        prop_assert_eq!(envelope.kind, MessageKind::Job);
        prop_assert_eq!(message, Message::Job(request.clone()));
        // The deadline is derived, so it must agree on both sides
        if let Message::Job(decoded) = decode(&frame).unwrap().1 {
            prop_assert_eq!(decoded.deadline(), request.deadline());
        }
    }

    #[test]
    fn decode_never_panics_on_arbitrary_bytes(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode(&bytes);
    }

    #[test]
    fn every_truncation_is_rejected(request in arb_job_request(), cut in any::<prop::sample::Index>()) {
        let frame = encode_message(&Message::Job(request)).unwrap();
        let len = cut.index(frame.len());
        prop_assert!(decode(&frame[..len]).is_err());
    }
}

#[test]
fn header_is_big_endian() {
    let frame = encode_message(&Message::Result(MinionResult {
        job_id: JobId::new("20240101000000000001"),
        minion_id: "web1".to_string(),
        return_value: json!(true),
        retcode: 0,
        success: true,
        received_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap(),
    }))
    .unwrap();

    let header = FrameHeader::decode(&frame).unwrap();
    assert_eq!(header.kind, MessageKind::Result);
    assert_eq!(header.body_len as usize, frame.len() - FRAME_HEADER_SIZE);
    assert_eq!(
        u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]),
        header.body_len
    );
    assert_eq!(u16::from_be_bytes([frame[0], frame[1]]), header.version);
}

#[test]
fn envelope_kind_must_match_body() {
    let request = JobRequest {
        job_id: JobId::new("20240101000000000001"),
        function_name: "test.ping".to_string(),
        arguments: vec![],
        keyword_arguments: BTreeMap::new(),
        target_expression: "*".to_string(),
        target_type: TargetType::Glob,
        issued_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        timeout: Duration::from_secs(5),
        tgt_minions: BTreeSet::new(),
    };

    let err = encode(&Envelope::new(MessageKind::Heartbeat), &Message::Job(request)).unwrap_err();
    assert!(matches!(err, CodecError::KindMismatch { .. }));
}
