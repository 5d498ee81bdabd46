use std::sync::Arc;

use nxtv_core::db::EpgDb;
use nxtv_core::time::ManualTimeProvider;
use nxtv_core::tsc::{TimescaleQueue, TscFlags, TscMode};
use nxtv_stream::block::StreamId;
use nxtv_stream::records::{Ai, AiNetwop, Pi};
use nxtv_ttx::packet::Cni;

const NOW: i64 = 700_000_000;
const PROV: Cni = Cni(0x0DC1);

fn make_db(stop_no: u16) -> (EpgDb, Arc<ManualTimeProvider>) {
    let time = Arc::new(ManualTimeProvider::new(NOW));
    let mut db = EpgDb::new(time.clone());
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
        netwops: (0..2)
            .map(|i| AiNetwop {
                cni: if i == 0 { PROV } else { Cni(0x0DC2) },
                start_no: 1,
                stop_no,
                stop_no_swo: stop_no,
                lto: 0,
                day_count: 2,
                alphabet: 0,
                add_info: 0,
                name: format!("n{i}").into(),
            })
            .collect(),
    };
    db.insert_ai(ai, StreamId::Stream1).unwrap();
    (db, time)
}

fn insert_pi(db: &mut EpgDb, block_no: u16, netwop: u8, start: i64, stop: i64) -> Pi {
    let pi = Pi::new(block_no, netwop, start, stop).with_title("p");
    assert!(db.insert_pi(pi.clone(), StreamId::Stream1, 1).unwrap());
    pi
}

#[test]
fn test_adjacent_pi_merge_into_one_element() {
    // two seamless programmes collapse into one element of 120
    // minutes with concat count 2
    let (mut db, _) = make_db(500);
    let mut tsc = TimescaleQueue::new();
    tsc.set_prov_cni(PROV);

    let pi1 = insert_pi(&mut db, 10, 0, NOW, NOW + 3600);
    tsc.add_pi(&db, &pi1, StreamId::Stream1, NOW);
    let pi2 = insert_pi(&mut db, 11, 0, NOW + 3600, NOW + 7200);
    tsc.add_pi(&db, &pi2, StreamId::Stream1, NOW);

    let (elem, base) = tsc.pop_elem().expect("one merged element");
    assert_eq!(elem.duration_mins, 120);
    assert_eq!(elem.concat_count, 2);
    assert_eq!(elem.netwop, 0);
    assert_eq!(base + elem.start_off_mins as i64 * 60, NOW);
    assert!(tsc.pop_elem().is_none());
}

#[test]
fn test_no_merge_across_netwops_or_gaps() {
    let (mut db, _) = make_db(500);
    let mut tsc = TimescaleQueue::new();
    tsc.set_prov_cni(PROV);

    let pi1 = insert_pi(&mut db, 10, 0, NOW, NOW + 3600);
    tsc.add_pi(&db, &pi1, StreamId::Stream1, NOW);
    // gap of one hour
    let pi2 = insert_pi(&mut db, 11, 0, NOW + 7200, NOW + 10_800);
    tsc.add_pi(&db, &pi2, StreamId::Stream1, NOW);
    // seamless but on another network
    let pi3 = insert_pi(&mut db, 10, 1, NOW + 10_800, NOW + 14_400);
    tsc.add_pi(&db, &pi3, StreamId::Stream1, NOW);

    let mut elems = Vec::new();
    while let Some((elem, _)) = tsc.pop_elem() {
        elems.push(elem);
    }
    assert_eq!(elems.len(), 3);
    assert!(elems.iter().all(|e| e.concat_count == 1));
}

#[test]
fn test_base_time_rebases_for_earlier_starts() {
    // invariant: base_time <= every element start
    let (mut db, _) = make_db(500);
    let mut tsc = TimescaleQueue::new();
    tsc.set_prov_cni(PROV);

    let late = insert_pi(&mut db, 20, 0, NOW + 86_400, NOW + 90_000);
    tsc.add_pi(&db, &late, StreamId::Stream1, NOW);
    // an element 12 days earlier undercuts the estimated base
    let early = insert_pi(&mut db, 10, 0, NOW - 12 * 86_400, NOW - 12 * 86_400 + 3600);
    tsc.add_pi(&db, &early, StreamId::Stream1, NOW);

    let mut seen = Vec::new();
    while let Some((elem, base)) = tsc.pop_elem() {
        let start = base + elem.start_off_mins as i64 * 60;
        assert!(base <= start);
        seen.push(start);
    }
    assert_eq!(seen.len(), 2);
    assert!(seen.contains(&(NOW + 86_400)));
    assert!(seen.contains(&(NOW - 12 * 86_400)));
}

#[test]
fn test_add_pi_flags() {
    let (mut db, _) = make_db(500);
    let mut tsc = TimescaleQueue::new();
    tsc.set_prov_cni(PROV);

    // expired programme
    let old = insert_pi(&mut db, 10, 0, NOW - 7200, NOW - 3600);
    tsc.add_pi(&db, &old, StreamId::Stream1, NOW);
    let (elem, _) = tsc.pop_elem().unwrap();
    assert!(elem.flags.contains(TscFlags::EXPIRED));
    assert!(elem.flags.contains(TscFlags::STREAM_1));
    assert!(elem.flags.contains(TscFlags::CUR_VERSION));

    // overlap eviction marks the replacement as defective coverage
    let a = insert_pi(&mut db, 20, 0, NOW, NOW + 3600);
    tsc.add_pi(&db, &a, StreamId::Stream1, NOW);
    let b = insert_pi(&mut db, 21, 0, NOW + 1800, NOW + 5400);
    tsc.add_pi(&db, &b, StreamId::Stream1, NOW);

    let (_, _) = tsc.pop_elem().expect("element for block 20");
    let (defective, _) = tsc.pop_elem().expect("element for block 21");
    assert!(defective.flags.contains(TscFlags::DEFECTIVE));

    // info flags are mirrored
    let info = Pi::new(30, 0, NOW + 20_000, NOW + 23_600)
        .with_title("t")
        .with_short_info("s")
        .with_long_info("l");
    assert!(db.insert_pi(info.clone(), StreamId::Stream1, 1).unwrap());
    tsc.add_pi(&db, &info, StreamId::Stream1, NOW);
    let (elem, _) = tsc.pop_elem().unwrap();
    assert!(elem.flags.contains(TscFlags::HAS_SHORT_INFO));
    assert!(elem.flags.contains(TscFlags::HAS_LONG_INFO));

    // the announced last block of the network
    let last = insert_pi(&mut db, 500, 0, NOW + 30_000, NOW + 33_600);
    tsc.add_pi(&db, &last, StreamId::Stream1, NOW);
    let (elem, _) = tsc.pop_elem().unwrap();
    assert!(elem.flags.contains(TscFlags::LAST));
}

#[test]
fn test_add_all_marks_missing_ranges() {
    let (mut db, _) = make_db(5);
    let mut tsc = TimescaleQueue::new();
    tsc.set_prov_cni(PROV);

    // blocks 1 and 3 present on netwop 0: gap at 2, tail at 4..5;
    // netwop 1 completely missing
    insert_pi(&mut db, 1, 0, NOW, NOW + 3600);
    insert_pi(&mut db, 3, 0, NOW + 7200, NOW + 10_800);
    tsc.add_all(&db, NOW);

    assert!(!tsc.is_incremental());
    let mut elems = Vec::new();
    while let Some((elem, _)) = tsc.pop_elem() {
        elems.push(elem);
    }
    let missing: Vec<&_> = elems
        .iter()
        .filter(|e| e.flags.contains(TscFlags::MISSING))
        .collect();
    // one gap inside netwop 0, one tail range, one whole-network range
    assert_eq!(missing.len(), 3);
    assert!(elems
        .iter()
        .any(|e| !e.flags.contains(TscFlags::MISSING) && e.block_idx == 0));
}

#[test]
fn test_initial_push_purges_incremental_of_same_provider() {
    let (mut db, _) = make_db(500);
    let mut tsc = TimescaleQueue::new();
    tsc.set_prov_cni(PROV);

    let pi1 = insert_pi(&mut db, 10, 0, NOW, NOW + 3600);
    tsc.add_pi(&db, &pi1, StreamId::Stream1, NOW);
    assert!(tsc.has_elems());

    // a snapshot buffer of the same provider arrives over the network
    let mut snapshot_queue = TimescaleQueue::new();
    snapshot_queue.set_prov_cni(PROV);
    tsc_snapshot(&mut snapshot_queue, &db);
    let buf = snapshot_queue.pop_buffer().expect("snapshot buffer");
    assert_eq!(buf.mode, TscMode::Initial);

    assert!(tsc.push_buffer(buf));
    // the incremental data is gone, the locked snapshot remains
    assert!(tsc.pop_elem().is_none(), "locked buffers are not popped");
    tsc.unlock_buffers();
    assert!(tsc.pop_elem().is_some());
}

fn tsc_snapshot(tsc: &mut TimescaleQueue, db: &EpgDb) {
    tsc.add_all(db, NOW);
}

#[test]
fn test_clear_unprocessed_keeps_locked() {
    let (mut db, _) = make_db(500);
    let mut tsc = TimescaleQueue::new();
    tsc.set_prov_cni(PROV);

    let pi1 = insert_pi(&mut db, 10, 0, NOW, NOW + 3600);
    tsc.add_pi(&db, &pi1, StreamId::Stream1, NOW);

    let mut other = TimescaleQueue::new();
    other.add_all(&db, NOW);
    let buf = other.pop_buffer().unwrap();
    tsc.push_buffer(buf);

    tsc.clear_unprocessed();
    // only the locked (pushed) buffer survived
    assert!(tsc.has_elems());
    assert!(tsc.pop_elem().is_none());
    tsc.unlock_buffers();
    assert!(tsc.pop_elem().is_some());
}

#[test]
fn test_pop_order_is_oldest_first() {
    let (mut db, _) = make_db(500);
    let mut tsc = TimescaleQueue::new();
    tsc.set_prov_cni(PROV);

    for i in 0..3u16 {
        // gaps prevent merging
        let start = NOW + i as i64 * 7200;
        let pi = insert_pi(&mut db, 10 + i, 0, start, start + 3600);
        tsc.add_pi(&db, &pi, StreamId::Stream1, NOW);
    }

    let mut starts = Vec::new();
    while let Some((elem, base)) = tsc.pop_elem() {
        starts.push(base + elem.start_off_mins as i64 * 60);
    }
    assert_eq!(starts, vec![NOW, NOW + 7200, NOW + 14_400]);
}

#[test]
fn test_peek_tail_sees_latest_element() {
    let (mut db, _) = make_db(500);
    let mut tsc = TimescaleQueue::new();
    tsc.set_prov_cni(PROV);

    let pi1 = insert_pi(&mut db, 10, 0, NOW, NOW + 3600);
    tsc.add_pi(&db, &pi1, StreamId::Stream1, NOW);
    let pi2 = insert_pi(&mut db, 11, 1, NOW + 7200, NOW + 10_800);
    tsc.add_pi(&db, &pi2, StreamId::Stream1, NOW);

    let tail = tsc.peek_tail(PROV).expect("latest element");
    assert_eq!(tail.netwop, 1);
}
