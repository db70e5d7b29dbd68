use std::net::Ipv6Addr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use bluerdma::api::gid::{Gid, GidAttr, GidType, MacAddr};
use bluerdma::gid::GidTable;

const THREADS: usize = 8;
const LEN: usize = 64;

fn gid_for(thread: usize, round: u32) -> Gid {
    Ipv6Addr::new(0xfd00, thread as u16, 0, 0, 0, 0, (round >> 16) as u16, round as u16).into()
}

#[test]
fn disjoint_indices_do_not_interfere() {
    let table = GidTable::with_default(LEN, MacAddr::with_default_prefix(1), 1, "blue0");
    let default_gid = table.query(0).unwrap();

    crossbeam::thread::scope(|s| {
        for t in 0..THREADS {
            let table = &table;
            s.spawn(move |_| {
                let mut rng = StdRng::seed_from_u64(t as u64);
                // thread t owns the indices congruent to t, skipping the default entry
                let owned: Vec<_> = (1..LEN).filter(|i| i % THREADS == t).collect();
                for round in 0..500u32 {
                    let index = owned[rng.gen_range(0..owned.len())];
                    if rng.gen_bool(0.7) {
                        let attr = GidAttr {
                            gid_type: GidType::RoceV2,
                            port_num: 1,
                            index: 0,
                            ndev: Some("blue0".to_owned()),
                        };
                        table.add(index, gid_for(t, round), attr).unwrap();
                        assert_eq!(table.query(index).unwrap(), gid_for(t, round));
                    } else {
                        table.del(index).unwrap();
                        assert!(table.query(index).is_err());
                    }
                }
            });
        }
    })
    .unwrap();

    assert_eq!(table.query(0).unwrap(), default_gid);
    for (index, gid) in table.valid_entries().into_iter().skip(1) {
        let owner = gid.raw()[3] as usize;
        assert_eq!(index % THREADS, owner);
        assert_eq!(table.query_entry(index).unwrap().attr.index as usize, index);
    }
}

#[test]
fn readers_never_see_torn_entries() {
    let table = GidTable::new(4);
    let a: Gid = Ipv6Addr::new(0xfe80, 0, 0, 0, 0xaaaa, 0xaaaa, 0xaaaa, 0xaaaa).into();
    let b: Gid = Ipv6Addr::new(0xfe80, 0, 0, 0, 0xbbbb, 0xbbbb, 0xbbbb, 0xbbbb).into();
    table.add(2, a, GidAttr::default()).unwrap();

    crossbeam::thread::scope(|s| {
        let table = &table;
        s.spawn(move |_| {
            for i in 0..10_000 {
                let gid = if i % 2 == 0 { b } else { a };
                table.add(2, gid, GidAttr::default()).unwrap();
            }
        });
        s.spawn(move |_| {
            for _ in 0..10_000 {
                let gid = table.query(2).unwrap();
                assert!(gid == a || gid == b, "torn read: {}", gid);
            }
        });
    })
    .unwrap();
}
