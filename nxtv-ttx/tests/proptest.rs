use nxtv_ttx::hamming::{ham84, parity_encode, parity_strip, unham84, unham84_pair};
use nxtv_ttx::slicer::{slice_teletext, FPSHIFT, VBI_LINE_SAMPLES, VTSTEP};
use proptest::prelude::*;

proptest! {
    #[test]
    fn prop_ham84_roundtrip_survives_one_bit_flip(nibble in 0u8..16, bit in 0u32..9) {
        // bit == 8 means no corruption
        let mut cw = ham84(nibble);
        if bit < 8 {
            cw ^= 1 << bit;
        }
        prop_assert_eq!(unham84(cw), Some(nibble));
    }

    #[test]
    fn prop_ham84_pair_roundtrip(byte in any::<u8>()) {
        let lo = ham84(byte & 0x0F);
        let hi = ham84(byte >> 4);
        prop_assert_eq!(unham84_pair(lo, hi), Some(byte));
    }

    #[test]
    fn prop_parity_ok_iff_odd_bit_count(byte in any::<u8>()) {
        let decoded = parity_strip(byte);
        if byte.count_ones() & 1 == 1 {
            prop_assert_eq!(decoded, Some(byte & 0x7F));
        } else {
            prop_assert_eq!(decoded, None);
        }
    }

    #[test]
    fn prop_parity_encode_is_fixpoint_of_strip(byte in any::<u8>()) {
        prop_assert_eq!(parity_strip(parity_encode(byte)), Some(byte & 0x7F));
    }

    #[test]
    fn prop_slicer_recovers_arbitrary_payloads(payload in prop::array::uniform32(any::<u8>())) {
        // a clean synthesized line must decode bit-exactly regardless
        // of payload content
        let mut bytes = vec![0x55u8, 0x55, 0x27];
        bytes.extend_from_slice(&payload);
        bytes.resize(45, 0x00);

        let mut line = vec![0u8; VBI_LINE_SAMPLES];
        let start = 160usize;
        for (byte_idx, &b) in bytes.iter().enumerate() {
            for j in 0..8u64 {
                if (b >> j) & 1 == 1 {
                    let cell = byte_idx as u64 * 8 + j;
                    let lo = start + ((cell * VTSTEP) >> FPSHIFT) as usize;
                    let hi = start + (((cell + 1) * VTSTEP) >> FPSHIFT) as usize;
                    for sample in &mut line[lo..hi] {
                        *sample = 0xFF;
                    }
                }
            }
        }

        let sliced = slice_teletext(&line);
        prop_assert!(sliced.is_some());
        prop_assert_eq!(&sliced.unwrap()[..32], &payload[..]);
    }
}
