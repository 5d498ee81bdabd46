use proptest::prelude::*;

use nxtv_stream::alphabet::AlphabetSet;
use nxtv_stream::block::{BlockType, RawBlock, StreamId};
use nxtv_stream::records::{self, Record};
use nxtv_stream::testing::{build_pages, encode_wire, mi_image, pi_image};
use nxtv_stream::{Mi, Pi, StreamDecoder};

const APP_ID: u16 = 1;

proptest! {
    #[test]
    fn prop_pi_image_roundtrip(
        block_no in any::<u16>(),
        netwop in 0u8..80,
        start_min in 10_000_000i64..12_000_000,
        duration in 1i64..1440,
        features in 0u16..0x1000,
        parental in 0u8..16,
        editorial in 0u8..8,
        themes in prop::collection::vec(any::<u8>(), 0..7),
        title in "[a-zA-Z0-9 ]{0,40}",
    ) {
        let pi = Pi::new(block_no, netwop, start_min * 60, (start_min + duration) * 60)
            .with_title(&title)
            .with_themes(&themes)
            .with_features(features)
            .with_ratings(parental & 0x0F, editorial);
        let image = pi_image(APP_ID, &pi);
        let block = RawBlock {
            btype: BlockType::Pi,
            stream: StreamId::Stream1,
            version: 0,
            ctrl_len: image.ctrl_len,
            parity_errors: 0,
            image: image.image,
        };
        match records::decode(&block, &AlphabetSet::default()).unwrap() {
            Record::Pi(decoded) => prop_assert_eq!(decoded, pi),
            other => prop_assert!(false, "expected PI, got {:?}", other),
        }
    }

    #[test]
    fn prop_wire_transmission_roundtrip(
        messages in prop::collection::vec("[a-zA-Z0-9 ]{1,60}", 1..6),
        pkgs_per_page in 1u8..12,
        start_ci in 0u8..16,
    ) {
        // any mix of block sizes must survive packetization bit-exactly
        let mis: Vec<Mi> = messages
            .iter()
            .enumerate()
            .map(|(i, msg)| Mi {
                block_no: i as u16 + 1,
                descriptors: Default::default(),
                message: msg.as_str().into(),
            })
            .collect();
        let raw: Vec<Vec<u8>> = mis.iter().map(|mi| encode_wire(&mi_image(APP_ID, mi))).collect();
        let pages = build_pages(&raw, StreamId::Stream1, start_ci, pkgs_per_page);

        let mut decoder = StreamDecoder::new(false, APP_ID);
        for page in &pages {
            prop_assert!(decoder.new_page(page.sub));
            for (pkg, payload) in &page.packets {
                decoder.decode_packet(*pkg, payload);
            }
        }

        for mi in &mis {
            let block = decoder.next_block().expect("block lost in transmission");
            match records::decode(&block, &AlphabetSet::default()).unwrap() {
                Record::Mi(decoded) => prop_assert_eq!(&decoded, mi),
                other => prop_assert!(false, "expected MI, got {:?}", other),
            }
        }
        prop_assert!(decoder.next_block().is_none());
    }

    #[test]
    fn prop_single_bit_error_never_yields_wrong_block(
        message in "[a-zA-Z0-9 ]{1,40}",
        flip_byte in 0usize..60,
        flip_bit in 0u32..8,
    ) {
        // flipping one wire bit either loses the block or still decodes
        // it correctly (Hamming correction); it never produces a
        // different record
        let mi = Mi {
            block_no: 5,
            descriptors: Default::default(),
            message: message.as_str().into(),
        };
        let mut raw = encode_wire(&mi_image(APP_ID, &mi));
        let idx = flip_byte % raw.len();
        raw[idx] ^= 1 << flip_bit;
        let pages = build_pages(&[raw], StreamId::Stream1, 0, 8);

        let mut decoder = StreamDecoder::new(false, APP_ID);
        for page in &pages {
            decoder.new_page(page.sub);
            for (pkg, payload) in &page.packets {
                decoder.decode_packet(*pkg, payload);
            }
        }

        if let Some(block) = decoder.next_block() {
            if block.parity_errors == 0 {
                match records::decode(&block, &AlphabetSet::default()) {
                    Ok(Record::Mi(decoded)) => prop_assert_eq!(&decoded, &mi),
                    Ok(other) => prop_assert!(false, "expected MI, got {:?}", other),
                    Err(_) => {} // structurally damaged, dropped downstream
                }
            }
        }
    }
}
