use std::sync::Arc;

use proptest::prelude::*;

use nxtv_core::db::EpgDb;
use nxtv_core::time::ManualTimeProvider;
use nxtv_stream::block::StreamId;
use nxtv_stream::records::{Ai, AiNetwop, Pi};
use nxtv_ttx::packet::Cni;

const NOW: i64 = 700_000_000;

fn make_db(netwops: u8) -> EpgDb {
    let time = Arc::new(ManualTimeProvider::new(NOW));
    let mut db = EpgDb::new(time);
    let ai = Ai {
        version: 1,
        version_swo: 1,
        this_netwop: 0,
        ni_count: 0,
        ni_count_swo: 0,
        oi_count: 0,
        oi_count_swo: 0,
        mi_count: 0,
        mi_count_swo: 0,
        service_name: "svc".into(),
        netwops: (0..netwops)
            .map(|i| AiNetwop {
                cni: Cni(0x100 + i as u16),
                start_no: 1,
                stop_no: 500,
                stop_no_swo: 1000,
                lto: 0,
                day_count: 7,
                alphabet: 0,
                add_info: 0,
                name: "n".into(),
            })
            .collect(),
    };
    db.insert_ai(ai, StreamId::Stream1).unwrap();
    db
}

proptest! {
    #[test]
    fn prop_db_invariants_hold_under_random_insertion(
        inserts in prop::collection::vec(
            (1u16..200, 0u8..6, 0i64..500, 1i64..48),
            1..60,
        ),
    ) {
        let mut db = make_db(4);
        for (block_no, netwop, start_slot, duration) in inserts {
            let start = NOW + start_slot * 1800;
            let pi = Pi::new(block_no, netwop, start, start + duration * 600).with_title("x");
            let _ = db.insert_pi(pi, StreamId::Stream1, 1).unwrap();
        }

        db.lock();
        // every stored netwop index is valid against the AI
        let count = db.get_ai().unwrap().netwop_count();
        prop_assert!(db.pi_iter().all(|s| s.pi.netwop_no < count));

        // the time axis is strictly sorted by (start time, netwop)
        let keys: Vec<(i64, u8)> = db
            .pi_iter()
            .map(|s| (s.pi.start_time, s.pi.netwop_no))
            .collect();
        prop_assert!(keys.windows(2).all(|w| w[0] < w[1]));

        // per network no two intervals overlap
        for netwop in 0..count {
            let spans: Vec<(i64, i64)> = db
                .pi_iter_net(netwop)
                .map(|s| (s.pi.start_time, s.pi.stop_time))
                .collect();
            for (i, a) in spans.iter().enumerate() {
                for b in &spans[i + 1..] {
                    prop_assert!(
                        a.1 <= b.0 || b.1 <= a.0,
                        "overlap between {:?} and {:?}",
                        a,
                        b
                    );
                }
            }
        }

        // both axes hold the same set of programmes
        let by_net: usize = (0..count).map(|n| db.pi_iter_net(n).count()).sum();
        prop_assert_eq!(by_net, db.pi_iter().count());
        db.unlock();
    }
}
