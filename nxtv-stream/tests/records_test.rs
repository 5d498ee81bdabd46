use smallvec::smallvec;

use nxtv_ttx::packet::Cni;

use nxtv_stream::alphabet::AlphabetSet;
use nxtv_stream::block::{BlockType, RawBlock, StreamId};
use nxtv_stream::records::{
    self, Descriptor, Li, LangDesc, Mi, Ni, NiEvent, Oi, Pi, Record, SubtDesc, Subtitle, Ti,
    DESC_TYPE_LANGUAGE, DESC_TYPE_SUBTITLE, EV_ATTRIB_NETWOP, EV_ATTRIB_START_TIME,
    EV_ATTRIB_THEME,
};
use nxtv_stream::testing::{li_image, mi_image, ni_image, oi_image, pi_image, ti_image, BlockImage};

fn raw_block(btype: BlockType, image: BlockImage) -> RawBlock {
    RawBlock {
        btype,
        stream: StreamId::Stream1,
        version: 0,
        ctrl_len: image.ctrl_len,
        parity_errors: 0,
        image: image.image,
    }
}

#[test]
fn test_pi_decode_roundtrip() {
    let pi = Pi::new(17, 2, 700_000_500 / 60 * 60, 700_000_500 / 60 * 60 + 5400)
        .with_title("Die Sendung")
        .with_short_info("Kurztext")
        .with_themes(&[0x21])
        .with_descriptors(&[
            Descriptor {
                dtype: DESC_TYPE_LANGUAGE,
                id: 3,
            },
            Descriptor {
                dtype: DESC_TYPE_SUBTITLE,
                id: 7,
            },
        ]);
    let block = raw_block(BlockType::Pi, pi_image(1, &pi));
    match records::decode(&block, &AlphabetSet::default()).unwrap() {
        Record::Pi(decoded) => {
            assert_eq!(decoded, pi);
            assert!(decoded.has_short_info());
            assert!(!decoded.has_long_info());
            assert_eq!(decoded.title(), "Die Sendung");
        }
        other => panic!("expected PI, got {other:?}"),
    }
}

#[test]
fn test_ni_decode_roundtrip() {
    let ni = Ni {
        block_no: 3,
        msg_size: 2,
        msg_attrib: 0x10,
        descriptors: smallvec![],
        header: "Spielfilme".into(),
        events: vec![
            NiEvent {
                next_id: 4,
                next_is_ni: true,
                attribs: smallvec![(EV_ATTRIB_THEME, 0x10), (EV_ATTRIB_NETWOP, 2)],
                ev_str: "Abends".into(),
            },
            NiEvent {
                next_id: 9,
                next_is_ni: false,
                attribs: smallvec![(EV_ATTRIB_START_TIME, 0x2000)],
                ev_str: "Jetzt".into(),
            },
        ],
    };
    let block = raw_block(BlockType::Ni, ni_image(1, &ni));
    match records::decode(&block, &AlphabetSet::default()).unwrap() {
        Record::Ni(decoded) => assert_eq!(decoded, ni),
        other => panic!("expected NI, got {other:?}"),
    }
}

#[test]
fn test_oi_and_mi_decode_roundtrip() {
    let oi = Oi {
        block_no: 9,
        header_size: 1,
        msg_size: 4,
        msg_attrib: 0,
        descriptors: smallvec![],
        header: "Heute".into(),
        message: "Programmhinweise am Abend".into(),
    };
    let block = raw_block(BlockType::Oi, oi_image(1, &oi));
    match records::decode(&block, &AlphabetSet::default()).unwrap() {
        Record::Oi(decoded) => assert_eq!(decoded, oi),
        other => panic!("expected OI, got {other:?}"),
    }

    let mi = Mi {
        block_no: 1,
        descriptors: smallvec![Descriptor {
            dtype: DESC_TYPE_LANGUAGE,
            id: 0
        }],
        message: "Willkommen".into(),
    };
    let block = raw_block(BlockType::Mi, mi_image(1, &mi));
    match records::decode(&block, &AlphabetSet::default()).unwrap() {
        Record::Mi(decoded) => assert_eq!(decoded, mi),
        other => panic!("expected MI, got {other:?}"),
    }
}

#[test]
fn test_li_and_ti_decode_roundtrip() {
    let li = Li {
        block_no: 0,
        netwop_no: 1,
        descs: vec![
            LangDesc {
                id: 0,
                langs: vec![*b"deu", *b"eng"],
            },
            LangDesc {
                id: 1,
                langs: vec![*b"fra"],
            },
        ],
    };
    let block = raw_block(BlockType::Li, li_image(1, &li));
    match records::decode(&block, &AlphabetSet::default()).unwrap() {
        Record::Li(decoded) => assert_eq!(decoded, li),
        other => panic!("expected LI, got {other:?}"),
    }

    let ti = Ti {
        block_no: 0x8000,
        netwop_no: 0,
        descs: vec![SubtDesc {
            id: 2,
            subtitles: vec![Subtitle {
                page: 0x150,
                subpage: 0,
                lang: *b"deu",
            }],
        }],
    };
    let block = raw_block(BlockType::Ti, ti_image(1, &ti));
    match records::decode(&block, &AlphabetSet::default()).unwrap() {
        Record::Ti(decoded) => assert_eq!(decoded, ti),
        other => panic!("expected TI, got {other:?}"),
    }
}

#[test]
fn test_pi_per_netwop_alphabet_dispatch() {
    // netwop 1 uses the German subset: 0x5B decodes to Ä there
    let alphabets = AlphabetSet::from_alphabets([0, 1]);
    let mut image = pi_image(1, &Pi::new(1, 1, 699_999_960, 699_999_960 + 600).with_title("Xrger"));
    let text_start = image.ctrl_len + 2;
    image.image[text_start] = 0x5B;

    let block = raw_block(BlockType::Pi, image);
    match records::decode(&block, &alphabets).unwrap() {
        Record::Pi(decoded) => assert_eq!(decoded.title(), "Ärger"),
        other => panic!("expected PI, got {other:?}"),
    }
}

#[test]
fn test_truncated_control_section_is_rejected() {
    let mi = Mi {
        block_no: 1,
        descriptors: smallvec![],
        message: "hi".into(),
    };
    let mut image = mi_image(1, &mi);
    image.image.truncate(6);
    image.ctrl_len = 4;
    let block = raw_block(BlockType::Mi, image);
    assert!(records::decode(&block, &AlphabetSet::default()).is_err());
}

#[test]
fn test_string_beyond_text_section_is_rejected() {
    let mi = Mi {
        block_no: 1,
        descriptors: smallvec![],
        message: "hello".into(),
    };
    let mut image = mi_image(1, &mi);
    // claim a longer message than the text section holds
    let len_off = 5 + 3;
    image.image[len_off] = 200;
    let block = raw_block(BlockType::Mi, image);
    assert!(matches!(
        records::decode(&block, &AlphabetSet::default()),
        Err(nxtv_stream::BlockError::StringBounds { .. })
    ));
}

#[test]
fn test_pil_decoding() {
    use nxtv_stream::records::decode_pil;
    // 14th of July, 20:15
    let pil = ((14u32) << 15) | ((7u32) << 11) | ((20u32) << 6) | 15;
    assert_eq!(decode_pil(pil), Some((14, 7, 20, 15)));
    assert_eq!(decode_pil(0xFFFFF), None);
}
