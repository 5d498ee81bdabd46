use nxtv_ttx::packet::Cni;

use nxtv_stream::alphabet::AlphabetSet;
use nxtv_stream::block::{BlockType, StreamId};
use nxtv_stream::records::{self, Record};
use nxtv_stream::testing::{ai_image, build_pages, encode_wire, TestPage};
use nxtv_stream::{Ai, AiNetwop, StreamDecoder};

const APP_ID: u16 = 1;

fn sample_ai() -> Ai {
    Ai {
        version: 9,
        version_swo: 3,
        this_netwop: 0,
        ni_count: 0,
        ni_count_swo: 0,
        oi_count: 0,
        oi_count_swo: 0,
        mi_count: 0,
        mi_count_swo: 0,
        service_name: "nexTView".into(),
        netwops: vec![
            AiNetwop {
                cni: Cni(0x0DC1),
                start_no: 1,
                stop_no: 50,
                stop_no_swo: 99,
                lto: 4,
                day_count: 7,
                alphabet: 1,
                add_info: 0,
                name: "ARD".into(),
            },
            AiNetwop {
                cni: Cni(0x2C11),
                start_no: 10,
                stop_no: 60,
                stop_no_swo: 120,
                lto: 0,
                day_count: 7,
                alphabet: 0,
                add_info: 0,
                name: "BBC1".into(),
            },
        ],
    }
}

fn feed(decoder: &mut StreamDecoder, pages: &[TestPage]) {
    for page in pages {
        assert!(decoder.new_page(page.sub));
        for (pkg, payload) in &page.packets {
            decoder.decode_packet(*pkg, payload);
        }
    }
}

#[test]
fn test_clean_ai_also_assembles_in_fragment_buffer() {
    let ai = sample_ai();
    let raw = encode_wire(&ai_image(APP_ID, &ai));
    let pages = build_pages(&[raw], StreamId::Stream1, 0, 8);

    let mut decoder = StreamDecoder::new(true, APP_ID);
    feed(&mut decoder, &pages);

    // the stream decoder recovered it directly...
    assert!(decoder.take_block_of_type(BlockType::Ai).is_some());
    // ...and the fragment assembler did too
    let frag = decoder.ai_assembler().assemble().expect("assembled AI");
    assert_eq!(frag.version, ai.version);
    assert_eq!(frag.parity_errors, 0);
    match records::decode(&frag.into_raw_block(), &AlphabetSet::default()).unwrap() {
        Record::Ai(decoded) => assert_eq!(decoded, ai),
        other => panic!("expected AI, got {other:?}"),
    }
}

#[test]
fn test_fragments_merge_across_damaged_transmissions() {
    let ai = sample_ai();
    let clean = encode_wire(&ai_image(APP_ID, &ai));
    assert!(clean.len() > 70, "AI must span several packets");

    // two transmissions, each with a Hamming-destroyed control byte at
    // a different offset: neither decodes alone
    let mut tx1 = clean.clone();
    tx1[40] = 0x01;
    let mut tx2 = clean.clone();
    tx2[60] = 0x01;

    let mut decoder = StreamDecoder::new(true, APP_ID);
    let pages1 = build_pages(&[tx1], StreamId::Stream1, 0, 8);
    feed(&mut decoder, &pages1);
    assert!(decoder.take_block_of_type(BlockType::Ai).is_none());
    assert!(!decoder.ai_assembler().has_complete_block());

    let ci_cont = pages1.len() as u8;
    let pages2 = build_pages(&[tx2], StreamId::Stream1, ci_cont, 8);
    feed(&mut decoder, &pages2);
    assert!(decoder.take_block_of_type(BlockType::Ai).is_none());

    // merged across both transmissions the block is whole
    let frag = decoder.ai_assembler().assemble().expect("merged AI");
    match records::decode(&frag.into_raw_block(), &AlphabetSet::default()).unwrap() {
        Record::Ai(decoded) => assert_eq!(decoded, ai),
        other => panic!("expected AI, got {other:?}"),
    }
    // assemble is one-shot until the next completion
    assert!(decoder.ai_assembler().assemble().is_none());
}

#[test]
fn test_version_change_discards_stored_fragment() {
    let ai_old = sample_ai();
    let mut ai_new = sample_ai();
    ai_new.version = 10;

    let mut damaged_old = encode_wire(&ai_image(APP_ID, &ai_old));
    damaged_old[40] = 0x01;

    let mut decoder = StreamDecoder::new(true, APP_ID);
    let pages1 = build_pages(&[damaged_old], StreamId::Stream1, 0, 8);
    feed(&mut decoder, &pages1);

    // a new AI version arrives damaged at a spot the old fragment
    // would have covered: the old fragment must not contribute
    let mut damaged_new = encode_wire(&ai_image(APP_ID, &ai_new));
    damaged_new[60] = 0x01;
    let pages2 = build_pages(&[damaged_new], StreamId::Stream1, pages1.len() as u8, 8);
    feed(&mut decoder, &pages2);

    assert!(
        decoder.ai_assembler().assemble().is_none(),
        "fragments of different versions must not merge"
    );
}

#[test]
fn test_restart_clears_pending_block() {
    let ai = sample_ai();
    let raw = encode_wire(&ai_image(APP_ID, &ai));
    let pages = build_pages(&[raw], StreamId::Stream1, 0, 8);

    let mut decoder = StreamDecoder::new(true, APP_ID);
    feed(&mut decoder, &pages);

    assert!(decoder.ai_assembler().has_complete_block());
    decoder.ai_assembler().restart();
    assert!(!decoder.ai_assembler().has_complete_block());
    assert!(decoder.ai_assembler().assemble().is_none());
}

#[test]
fn test_parity_errors_are_counted() {
    let ai = sample_ai();
    let image = ai_image(APP_ID, &ai);
    let mut raw = encode_wire(&image);
    // damage one text byte's parity: the stream decoder still accepts
    // the block, the assembler reports the error count
    let text_start = (image.ctrl_len + 2) * 2;
    raw[text_start] ^= 0x80;

    let mut decoder = StreamDecoder::new(true, APP_ID);
    feed(&mut decoder, &build_pages(&[raw], StreamId::Stream1, 0, 8));

    let direct = decoder.take_block_of_type(BlockType::Ai).expect("AI block");
    assert_eq!(direct.parity_errors, 1);

    let frag = decoder.ai_assembler().assemble().expect("assembled AI");
    assert_eq!(frag.parity_errors, 1);
}
