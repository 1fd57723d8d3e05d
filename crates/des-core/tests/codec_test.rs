use des_core::codec::{self, CodecError, FRAME_LEN};
use des_core::SampleRecord;
use proptest::prelude::*;

fn arb_sample() -> impl Strategy<Value = SampleRecord> {
    (
        any::<i64>(),
        prop::array::uniform7(-1.0e6f32..1.0e6f32),
        any::<u16>(),
        any::<u16>(),
    )
        .prop_map(|(time, f, vlv_tgt, vlv_pos)| SampleRecord {
            time,
            ch4: f[0],
            hi_flow: f[1],
            lo_flow: f[2],
            press: f[3],
            bat_amp: f[4],
            bat_volt: f[5],
            mot_volt: f[6],
            vlv_tgt,
            vlv_pos,
            job_name: String::new(),
        })
}

proptest! {
    #[test]
    fn text_form_preserves_every_field(sample in arb_sample()) {
        let text = codec::encode_text(&sample);
        prop_assert!(text.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '='));
        let decoded = codec::decode_text(&text).unwrap();
        prop_assert_eq!(decoded.len(), 1);
        prop_assert_eq!(&decoded[0], &sample);
    }

    #[test]
    fn truncated_frames_are_rejected(len in 0usize..FRAME_LEN) {
        let buf = vec![0u8; len];
        prop_assert_eq!(
            codec::decode(&buf),
            Err(CodecError::MalformedFrame { len, expected: FRAME_LEN })
        );
    }
}

#[test]
fn test_batched_text_payload() {
    let samples: Vec<SampleRecord> = (0..5)
        .map(|i| SampleRecord {
            time: 1_700_000_000_000 + i * 1000,
            press: 100.0 + i as f32,
            ..Default::default()
        })
        .collect();

    let mut bytes = Vec::new();
    for s in &samples {
        bytes.extend_from_slice(&codec::encode(s));
    }
    let decoded = codec::decode_text(&codec::to_text(&bytes)).unwrap();
    assert_eq!(decoded, samples);
}

#[test]
fn test_standard_alphabet_rejected() {
    // '+' and '/' are not part of the URL-safe alphabet.
    assert!(matches!(
        codec::from_text("++//"),
        Err(CodecError::InvalidText(_))
    ));
}
