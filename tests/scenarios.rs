// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Six concrete scenarios exercising the allocator/committer/permission
//! state machine end to end, driven through the `sim` backend against a
//! real (but unattached-to-hardware) address window. Each test cleans up
//! every EMA it creates so the shared `Emm` comes back to its baseline
//! state for the next test in this binary.

mod common;

use common::{setup, PAGE};
use sgx_emm::emm::error::{EACCES, EEXIST, EINVAL};
use sgx_emm::emm::{self, snapshot, AllocFlags, PageType, ProtFlags, RangeType};
use sgx_emm::inst::sim::FAKE_EPC;

fn alloc(len: usize, flags: AllocFlags, typ: PageType, prot: ProtFlags) -> usize {
    emm::alloc_region(None, len, flags, typ, prot, None, 0).expect("alloc should succeed")
}

fn find_ema(addr: usize) -> sgx_emm::emm::EmaSnapshot {
    snapshot(RangeType::User)
        .into_iter()
        .find(|e| e.start == addr)
        .expect("ema must be present at addr")
}

#[test]
fn s1_commit_on_demand_round_trip() {
    let _g = setup();
    let len = 16 * PAGE; // 0x10000
    let addr = alloc(len, AllocFlags::COMMIT_ON_DEMAND, PageType::Reg, ProtFlags::RW);
    assert_eq!(addr % PAGE, 0);

    let ema = find_ema(addr);
    assert_eq!(ema.end - ema.start, len);
    let bits = ema.committed.expect("non-reserve ema must carry a bitmap");
    assert!(bits.iter().all(|&b| !b), "freshly allocated pages start uncommitted");

    emm::commit(addr, len).expect("commit");
    let bits = find_ema(addr).committed.unwrap();
    assert!(bits.iter().all(|&b| b), "commit must turn every bit on");

    emm::dealloc(addr, len).expect("dealloc");
    assert!(
        snapshot(RangeType::User).iter().all(|e| e.start != addr),
        "dealloc must remove the ema from the list"
    );
}

#[test]
fn s2_growsdown_commit_now_accepts_high_to_low() {
    let _g = setup();
    FAKE_EPC.lock().reset_order();

    let len = 4 * PAGE; // 0x4000
    let addr = alloc(
        len,
        AllocFlags::COMMIT_NOW | AllocFlags::GROWSDOWN,
        PageType::Reg,
        ProtFlags::RW,
    );

    let order = FAKE_EPC.lock().eaccept_order.clone();
    let expected: Vec<usize> = (0..4).rev().map(|i| addr + i * PAGE).collect();
    assert_eq!(order, expected, "GROWSDOWN must EACCEPT from the high end down");

    let bits = find_ema(addr).committed.unwrap();
    assert!(bits.iter().all(|&b| b), "COMMIT_NOW must land with every bit set");

    emm::dealloc(addr, len).unwrap();
}

#[test]
fn s3_reserve_has_no_bitmap_and_rejects_commit() {
    let _g = setup();
    let len = 16 * PAGE; // 0x10000
    let addr = alloc(len, AllocFlags::RESERVE, PageType::Reg, ProtFlags::RW);

    assert!(find_ema(addr).committed.is_none(), "a RESERVE ema must carry no bitmap");

    let err = emm::commit(addr, PAGE).unwrap_err();
    assert_eq!(err, EACCES);

    emm::dealloc(addr, len).unwrap();
}

#[test]
fn s4_partial_commit_then_modify_permissions_splits_ema() {
    let _g = setup();
    let len = 16 * PAGE; // 0x10000
    let addr = alloc(len, AllocFlags::COMMIT_ON_DEMAND, PageType::Reg, ProtFlags::RW);

    emm::commit(addr + 2 * PAGE, 2 * PAGE).unwrap();
    let bits = find_ema(addr).committed.unwrap();
    assert_eq!(
        &bits[..4],
        &[false, false, true, true],
        "only pages 2 and 3 should be committed"
    );

    let err = emm::modify_permissions(addr, len, ProtFlags::R).unwrap_err();
    assert_eq!(err, EINVAL, "uncommitted pages in range must reject modify_permissions");

    emm::modify_permissions(addr + 2 * PAGE, 2 * PAGE, ProtFlags::R).expect("modify_permissions");

    let mut emas: Vec<_> = snapshot(RangeType::User)
        .into_iter()
        .filter(|e| e.start >= addr && e.end <= addr + len)
        .collect();
    emas.sort_by_key(|e| e.start);
    assert_eq!(emas.len(), 3, "modify_permissions over the middle must split the ema in three");
    assert_eq!(emas[0].start, addr);
    assert_eq!(emas[0].end, addr + 2 * PAGE);
    assert_eq!(emas[0].info.prot, ProtFlags::RW);
    assert_eq!(emas[1].start, addr + 2 * PAGE);
    assert_eq!(emas[1].end, addr + 4 * PAGE);
    assert_eq!(emas[1].info.prot, ProtFlags::R);
    assert_eq!(emas[2].start, addr + 4 * PAGE);
    assert_eq!(emas[2].end, addr + len);
    assert_eq!(emas[2].info.prot, ProtFlags::RW);

    emm::dealloc(addr, len).unwrap();
}

#[test]
fn s5_modify_type_to_tcs_is_idempotent() {
    let _g = setup();
    let len = PAGE; // 0x1000
    let addr = alloc(len, AllocFlags::COMMIT_NOW, PageType::Reg, ProtFlags::RW);

    emm::modify_type(addr, len, PageType::Tcs).expect("REG -> TCS");
    let ema = find_ema(addr);
    assert_eq!(ema.info.typ, PageType::Tcs);
    assert_eq!(ema.info.prot, ProtFlags::NONE);

    emm::modify_type(addr, len, PageType::Tcs).expect("re-invoking on an already-TCS page succeeds");
    assert_eq!(find_ema(addr).info.typ, PageType::Tcs);

    emm::dealloc(addr, len).unwrap();
}

#[test]
fn s6_fixed_alloc_colliding_with_live_ema_fails_eexist() {
    let _g = setup();
    let len = 4 * PAGE;
    let addr = alloc(len, AllocFlags::COMMIT_ON_DEMAND, PageType::Reg, ProtFlags::RW);

    let mut before: Vec<_> = snapshot(RangeType::User).into_iter().map(|e| (e.start, e.end)).collect();
    before.sort();

    let err = emm::alloc_region(
        Some(addr + PAGE),
        PAGE,
        AllocFlags::FIXED | AllocFlags::COMMIT_ON_DEMAND,
        PageType::Reg,
        ProtFlags::RW,
        None,
        0,
    )
    .unwrap_err();
    assert_eq!(err, EEXIST);

    let mut after: Vec<_> = snapshot(RangeType::User).into_iter().map(|e| (e.start, e.end)).collect();
    after.sort();
    assert_eq!(before, after, "a rejected FIXED alloc must not mutate the list");

    emm::dealloc(addr, len).unwrap();
}
