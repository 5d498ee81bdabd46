use nxtv_stream::alphabet::AlphabetSet;
use nxtv_stream::block::{compute_checksum, BlockType, StreamId};
use nxtv_stream::records::{self, Record};
use nxtv_stream::testing::{
    ai_image, bi_image, build_pages, encode_wire, mi_image, pi_image, TestPage,
};
use nxtv_stream::{Ai, AiNetwop, Mi, Pi, StreamDecoder};

const APP_ID: u16 = 1;

fn feed(decoder: &mut StreamDecoder, pages: &[TestPage]) {
    for page in pages {
        assert!(decoder.new_page(page.sub));
        for (pkg, payload) in &page.packets {
            decoder.decode_packet(*pkg, payload);
        }
    }
}

fn sample_ai() -> Ai {
    Ai {
        version: 4,
        version_swo: 2,
        this_netwop: 0,
        ni_count: 1,
        ni_count_swo: 0,
        oi_count: 1,
        oi_count_swo: 0,
        mi_count: 0,
        mi_count_swo: 0,
        service_name: "nexTView".into(),
        netwops: vec![
            AiNetwop {
                cni: nxtv_ttx::packet::Cni(0x0DC1),
                start_no: 1,
                stop_no: 100,
                stop_no_swo: 200,
                lto: 4,
                day_count: 7,
                alphabet: 1,
                add_info: 0,
                name: "ARD".into(),
            },
            AiNetwop {
                cni: nxtv_ttx::packet::Cni(0x0DC2),
                start_no: 1,
                stop_no: 80,
                stop_no_swo: 160,
                lto: 4,
                day_count: 7,
                alphabet: 1,
                add_info: 0,
                name: "ZDF".into(),
            },
        ],
    }
}

#[test]
fn test_bi_and_ai_roundtrip() {
    let ai = sample_ai();
    let raw_blocks = vec![
        encode_wire(&bi_image(APP_ID)),
        encode_wire(&ai_image(APP_ID, &ai)),
    ];
    let pages = build_pages(&raw_blocks, StreamId::Stream1, 0, 8);

    let mut decoder = StreamDecoder::new(true, APP_ID);
    feed(&mut decoder, &pages);

    let bi_block = decoder.take_block_of_type(BlockType::Bi).expect("BI block");
    let ai_block = decoder.take_block_of_type(BlockType::Ai).expect("AI block");
    assert!(decoder.next_block().is_none());

    let alphabets = AlphabetSet::default();
    match records::decode(&bi_block, &alphabets).unwrap() {
        Record::Bi(bi) => assert_eq!(bi.app_id, APP_ID),
        other => panic!("expected BI, got {other:?}"),
    }
    match records::decode(&ai_block, &alphabets).unwrap() {
        Record::Ai(decoded) => assert_eq!(decoded, ai),
        other => panic!("expected AI, got {other:?}"),
    }
}

#[test]
fn test_checksum_constant() {
    // a control section whose nibbles sum to 0x42 gets checksum
    // 0x100 - 0x42 = 0xBE
    let data = [0x0F, 0x0F, 0x0F, 0x0F, 0x06];
    assert_eq!(compute_checksum(&data), 0xBE);
}

#[test]
fn test_corrupted_checksum_drops_block() {
    let mut image = bi_image(APP_ID);
    image.image[2] ^= 0x01; // break the stored checksum
    let pages = build_pages(&[encode_wire(&image)], StreamId::Stream1, 0, 8);

    let mut decoder = StreamDecoder::new(false, APP_ID);
    feed(&mut decoder, &pages);
    assert!(decoder.next_block().is_none());
}

#[test]
fn test_scratch_mode_gates_non_ai_blocks() {
    let pi = Pi::new(10, 0, 700_000_000 / 60 * 60, 700_000_000 / 60 * 60 + 3600)
        .with_title("News");
    let raw_blocks = vec![
        encode_wire(&pi_image(APP_ID, &pi)),
        encode_wire(&bi_image(APP_ID)),
    ];
    let pages = build_pages(&raw_blocks, StreamId::Stream1, 0, 8);

    let mut decoder = StreamDecoder::new(true, APP_ID);
    feed(&mut decoder, &pages);

    // only the BI block may leave the decoder before an AI was accepted
    assert!(decoder.take_block_of_type(BlockType::Pi).is_none());
    assert!(decoder.take_block_of_type(BlockType::Bi).is_some());
}

#[test]
fn test_pi_roundtrip_with_all_attributes() {
    let pi = Pi::new(42, 1, 699_998_400, 700_002_000)
        .with_title("Tagesschau")
        .with_short_info("Nachrichten")
        .with_long_info("Mit Wetterbericht im Anschluss")
        .with_themes(&[0x20, 0x81])
        .with_sortcrits(&[0x10])
        .with_features(0x0143)
        .with_ratings(3, 5);
    let pages = build_pages(
        &[encode_wire(&pi_image(APP_ID, &pi))],
        StreamId::Stream1,
        3,
        8,
    );

    let mut decoder = StreamDecoder::new(false, APP_ID);
    decoder.set_ai_version(4, 2);
    feed(&mut decoder, &pages);

    let block = decoder.next_block().expect("PI block");
    assert_eq!(block.btype, BlockType::Pi);
    assert_eq!(block.stream, StreamId::Stream1);
    assert_eq!(block.version, 4);
    assert_eq!(block.parity_errors, 0);

    match records::decode(&block, &AlphabetSet::default()).unwrap() {
        Record::Pi(decoded) => assert_eq!(decoded, pi),
        other => panic!("expected PI, got {other:?}"),
    }
}

#[test]
fn test_multiple_small_blocks_share_packets() {
    // several short MI blocks force filler skipping and multiple
    // block starts within single packets
    let mis: Vec<Mi> = (1..=5)
        .map(|i| Mi {
            block_no: i,
            descriptors: Default::default(),
            message: format!("msg {i}").into(),
        })
        .collect();
    let raw_blocks: Vec<Vec<u8>> = mis
        .iter()
        .map(|mi| encode_wire(&mi_image(APP_ID, mi)))
        .collect();
    let pages = build_pages(&raw_blocks, StreamId::Stream1, 0, 10);

    let mut decoder = StreamDecoder::new(false, APP_ID);
    feed(&mut decoder, &pages);

    for mi in &mis {
        let block = decoder.next_block().expect("MI block");
        match records::decode(&block, &AlphabetSet::default()).unwrap() {
            Record::Mi(decoded) => assert_eq!(&decoded, mi),
            other => panic!("expected MI, got {other:?}"),
        }
    }
    assert!(decoder.next_block().is_none());
}

#[test]
fn test_fragmented_header_across_packets() {
    // first block sized so the second block's header starts at payload
    // offset 37 and continues in the next packet
    let mi1 = Mi {
        block_no: 1,
        descriptors: Default::default(),
        message: "123456789012345".into(),
    };
    let mi2 = Mi {
        block_no: 2,
        descriptors: Default::default(),
        message: "hello".into(),
    };
    let raw1 = encode_wire(&mi_image(APP_ID, &mi1));
    assert_eq!(raw1.len(), 35, "fragmentation setup relies on this length");
    let raw2 = encode_wire(&mi_image(APP_ID, &mi2));
    let pages = build_pages(&[raw1, raw2], StreamId::Stream1, 0, 8);

    let mut decoder = StreamDecoder::new(false, APP_ID);
    feed(&mut decoder, &pages);

    for expect in [&mi1, &mi2] {
        let block = decoder.next_block().expect("MI block");
        match records::decode(&block, &AlphabetSet::default()).unwrap() {
            Record::Mi(decoded) => assert_eq!(&decoded, expect),
            other => panic!("expected MI, got {other:?}"),
        }
    }
}

#[test]
fn test_missing_packet_discards_block_only() {
    let mi1 = Mi {
        block_no: 1,
        descriptors: Default::default(),
        message: "a longer message body spanning packets........".into(),
    };
    let mi2 = Mi {
        block_no: 2,
        descriptors: Default::default(),
        message: "intact".into(),
    };
    let raw_blocks = vec![
        encode_wire(&mi_image(APP_ID, &mi1)),
        encode_wire(&mi_image(APP_ID, &mi2)),
    ];
    let mut pages = build_pages(&raw_blocks, StreamId::Stream1, 0, 25);
    // drop the first data packet: the first block is lost, the second
    // must still be recovered from its own block start
    pages[0].packets.remove(0);

    let mut decoder = StreamDecoder::new(false, APP_ID);
    feed(&mut decoder, &pages);

    let block = decoder.next_block().expect("second MI block");
    match records::decode(&block, &AlphabetSet::default()).unwrap() {
        Record::Mi(decoded) => assert_eq!(decoded.block_no, 2),
        other => panic!("expected MI, got {other:?}"),
    }
    assert!(decoder.next_block().is_none());
}

#[test]
fn test_ci_gap_discards_partial_block() {
    let mi = Mi {
        block_no: 7,
        descriptors: Default::default(),
        message: "a message long enough to span several packets......".into(),
    };
    let raw = encode_wire(&mi_image(APP_ID, &mi));
    let pages = build_pages(&[raw], StreamId::Stream1, 0, 1);
    assert!(pages.len() >= 2, "block must span pages for this test");

    let mut decoder = StreamDecoder::new(false, APP_ID);
    // feed the first page, then skip a CI step by feeding a later page
    let first = &pages[0];
    assert!(decoder.new_page(first.sub));
    for (pkg, payload) in &first.packets {
        decoder.decode_packet(*pkg, payload);
    }
    let last = pages.last().unwrap();
    let skipped_sub = (last.sub & !0x0F) | ((last.sub + 1) & 0x0F);
    assert!(decoder.new_page(skipped_sub));
    for (pkg, payload) in &last.packets {
        decoder.decode_packet(*pkg, payload);
    }

    assert!(decoder.next_block().is_none());
}

#[test]
fn test_stream2_pages_tag_blocks() {
    let mi = Mi {
        block_no: 9,
        descriptors: Default::default(),
        message: "far future".into(),
    };
    let pages = build_pages(
        &[encode_wire(&mi_image(APP_ID, &mi))],
        StreamId::Stream2,
        0,
        8,
    );

    let mut decoder = StreamDecoder::new(false, APP_ID);
    decoder.set_ai_version(4, 2);
    feed(&mut decoder, &pages);

    let block = decoder.next_block().expect("MI block");
    assert_eq!(block.stream, StreamId::Stream2);
    assert_eq!(block.version, 2);
}

#[test]
fn test_foreign_app_id_is_ignored() {
    let mi = Mi {
        block_no: 1,
        descriptors: Default::default(),
        message: "other app".into(),
    };
    let pages = build_pages(
        &[encode_wire(&mi_image(APP_ID + 1, &mi))],
        StreamId::Stream1,
        0,
        8,
    );

    let mut decoder = StreamDecoder::new(false, APP_ID);
    feed(&mut decoder, &pages);
    assert!(decoder.next_block().is_none());
}
