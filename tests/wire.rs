//! End-to-end wire tests: raw bytes through the codecs into packets and
//! their derived views.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use camlink::{
    to_user_id, BinaryCodec, FcType, Packet, Payload, TextDecoder, TxFrame,
};

fn encode_binary(frame: TxFrame) -> BytesMut {
    let mut buf = BytesMut::new();
    BinaryCodec.encode(frame, &mut buf).expect("encode");
    buf
}

fn decode_all(buf: &mut BytesMut) -> Vec<Packet> {
    let mut codec = BinaryCodec;
    let mut packets = Vec::new();
    while let Some(packet) = codec.decode(buf).expect("decode") {
        packets.push(packet);
    }
    packets
}

#[test]
fn login_then_session_state_arrive_in_order() {
    let mut buf = encode_binary(
        TxFrame::new(FcType::Login, 12345, 0, 0).with_payload("someuser"),
    );
    buf.extend_from_slice(&encode_binary(
        TxFrame::new(FcType::SessionState, 0, 0, 0)
            .with_payload(r#"{"sid":900,"uid":3113,"lv":4,"vs":0,"camscore":850.2}"#),
    ));

    let packets = decode_all(&mut buf);
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].fc_type, FcType::Login);
    assert_eq!(packets[0].n_to, 12345);

    let state = packets[1].payload_state().expect("session state");
    assert_eq!(state.sid(), 900);
    assert_eq!(state.uid(), Some(3113));
    assert_eq!(packets[1].about_model_uid(), Some(3113));
    assert!(buf.is_empty());
}

#[test]
fn binary_frames_survive_arbitrary_fragmentation() {
    let frame = encode_binary(
        TxFrame::new(FcType::CMesg, 100003113, 0, 0)
            .with_payload(r#"{"nm":"alice","msg":"hello"}"#),
    );

    // Deliver in every possible two-chunk split.
    for split in 1..frame.len() {
        let mut codec = BinaryCodec;
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&frame[..split]);
        assert!(codec.decode(&mut buf).expect("decode").is_none());

        buf.extend_from_slice(&frame[split..]);
        let packet = codec.decode(&mut buf).expect("decode").expect("complete frame");
        assert_eq!(packet.chat_string().as_deref(), Some("alice: hello"));
    }
}

#[test]
fn text_noise_then_frame_yields_exactly_one_packet() {
    let body = "13 1 100003113 0 0 %7B%22nm%22%3A%22alice%22%2C%22msg%22%3A%22hi%22%7D\n\0";
    let mut decoder = TextDecoder::new();
    decoder.push("garbage0123 5 6 7 8 9 ");
    decoder.push(&format!("{:04}{}", body.len(), body));

    let packet = decoder.next_packet().expect("ok").expect("one packet");
    assert_eq!(packet.fc_type, FcType::CMesg);
    assert_eq!(to_user_id(packet.n_to as i64), 3113);
    assert_eq!(packet.chat_string().as_deref(), Some("alice: hi"));
    assert!(decoder.next_packet().expect("ok").is_none());
}

#[test]
fn emote_markup_renders_as_codes_across_the_wire() {
    let payload = r#"{"nm":"bettie","msg":"hi #~ue,0a1b2c3d.gif,wave~# there"}"#;
    let mut buf = encode_binary(TxFrame::new(FcType::CMesg, 100000007, 0, 0).with_payload(payload));

    let packets = decode_all(&mut buf);
    assert_eq!(packets[0].chat_string().as_deref(), Some("bettie: hi :wave there"));
}

#[test]
fn raw_payloads_degrade_gracefully() {
    let mut buf = encode_binary(
        TxFrame::new(FcType::UsernameLookup, 0, 20, 0).with_payload("no_such_user"),
    );
    let packets = decode_all(&mut buf);
    assert_eq!(packets[0].payload, Payload::Raw("no_such_user".to_string()));
    assert!(packets[0].payload_state().is_none());
}
