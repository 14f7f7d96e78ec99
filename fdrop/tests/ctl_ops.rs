use std::{collections::BTreeMap, net::Ipv4Addr, sync::Arc, thread};

use fdrop::{
    TableError, Verdict, classify,
    ops::{self, Op, Report},
    table::{BlockTable, MemTable, Schema},
};

fn addr(i: u32) -> Ipv4Addr {
    Ipv4Addr::from(0x0a00_0000 + i)
}

fn frame_from(src: Ipv4Addr) -> Vec<u8> {
    let mut pkt = vec![0u8; 14 + 20];
    pkt[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
    pkt[14] = 0x45;
    pkt[26..30].copy_from_slice(&src.octets());
    pkt
}

#[test]
fn add_then_get_is_zero() {
    let table = MemTable::new(Schema::blocklist(16));
    for i in 1..=5 {
        ops::execute(&table, Op::Add(addr(i))).unwrap();
        assert_eq!(
            ops::execute(&table, Op::Get(addr(i))).unwrap(),
            Report::Counter {
                addr: addr(i),
                counter: Some(0)
            }
        );
    }
}

#[test]
fn delete_of_absent_address_succeeds() {
    let table = MemTable::new(Schema::blocklist(16));
    assert_eq!(
        ops::execute(&table, Op::Del(addr(1))).unwrap(),
        Report::Deleted {
            addr: addr(1),
            existed: false
        }
    );
}

#[test]
fn dump_matches_adds_and_counters() {
    let table = MemTable::new(Schema::blocklist(64));
    let mut expected = BTreeMap::new();
    for i in 0..40 {
        ops::execute(&table, Op::Add(addr(i))).unwrap();
        for _ in 0..(i % 3) {
            assert_eq!(classify(&frame_from(addr(i)), &table), Verdict::Drop);
        }
        expected.insert(addr(i), u64::from(i % 3));
    }

    let Report::Dump(rows) = ops::execute(&table, Op::Dump).unwrap() else {
        panic!("dump returned another report");
    };
    assert_eq!(rows.len(), 40);
    let dumped: BTreeMap<_, _> = rows.into_iter().collect();
    assert_eq!(dumped, expected);
}

#[test]
fn capacity_boundary() {
    let capacity = 4096;
    let table = MemTable::new(Schema::blocklist(capacity));
    for i in 0..capacity {
        ops::execute(&table, Op::Add(addr(i))).unwrap();
    }
    classify(&frame_from(addr(7)), &table);

    let err = ops::execute(&table, Op::Add(addr(capacity))).unwrap_err();
    assert!(matches!(err, TableError::Full { capacity: 4096 }));
    assert_eq!(table.len(), capacity as usize);
    assert_eq!(table.get(addr(7).into()).unwrap(), Some(1));
    assert_eq!(table.get(addr(capacity).into()).unwrap(), None);

    // Existing addresses are still accepted as no-ops.
    assert_eq!(
        ops::execute(&table, Op::Add(addr(0))).unwrap(),
        Report::Added {
            addr: addr(0),
            created: false
        }
    );
}

#[test]
fn classify_and_admin_run_concurrently() {
    let table = Arc::new(MemTable::new(Schema::blocklist(256)));
    for i in 0..8 {
        ops::execute(&table, Op::Add(addr(i))).unwrap();
    }

    let hitters: Vec<_> = (0..4)
        .map(|_| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let mut dropped = 0u64;
                for round in 0..2000u32 {
                    match classify(&frame_from(addr(round % 8)), &table) {
                        Verdict::Drop => dropped += 1,
                        Verdict::Pass => unreachable!("blocked rows are never deleted"),
                        Verdict::Aborted => {}
                    }
                }
                dropped
            })
        })
        .collect();

    // Churn unrelated rows while packets flow.
    let admin = {
        let table = Arc::clone(&table);
        thread::spawn(move || {
            for round in 0..500 {
                let churn = addr(100 + round % 50);
                ops::execute(&table, Op::Add(churn)).unwrap();
                ops::execute(&table, Op::Del(churn)).unwrap();
            }
        })
    };

    let dropped: u64 = hitters.into_iter().map(|h| h.join().unwrap()).sum();
    admin.join().unwrap();

    let counted: u64 = (0..8)
        .map(|i| table.get(addr(i).into()).unwrap().unwrap())
        .sum();
    assert_eq!(dropped, 8000);
    assert_eq!(counted, dropped);
    assert_eq!(table.len(), 8);
}
