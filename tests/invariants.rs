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

//! Invariants the EDMM state machine must uphold: non-overlap, sortedness,
//! windowing, bitmap presence, commit-bit monotonicity, round-tripping,
//! idempotence, and split composition. Checked both deterministically and,
//! for the structural invariants that hold after *any* sequence of
//! operations, against randomized operation sequences via `proptest`.

mod common;

use common::{setup, PAGE};
use proptest::prelude::*;
use sgx_emm::emm::{self, user_window, AllocFlags, EmaSnapshot, PageType, ProtFlags, RangeType};

fn alloc(len: usize, flags: AllocFlags) -> usize {
    emm::alloc_region(None, len, flags, PageType::Reg, ProtFlags::RW, None, 0).expect("alloc")
}

fn find_ema(addr: usize) -> EmaSnapshot {
    emm::snapshot(RangeType::User)
        .into_iter()
        .find(|e| e.start == addr)
        .expect("ema must be present at addr")
}

/// Invariants 1-4 (non-overlap, sortedness, windowing, bitmap presence),
/// checked against whatever is on the user root right now.
fn check_structural_invariants() {
    let (user_base, user_end) = user_window();
    let snap = emm::snapshot(RangeType::User);
    let mut prev_end: Option<usize> = None;
    for ema in &snap {
        assert!(ema.start < ema.end, "ema must be non-empty");
        assert!(
            ema.start >= user_base && ema.end <= user_end,
            "ema [{:#x}, {:#x}) escapes the user window [{:#x}, {:#x})",
            ema.start,
            ema.end,
            user_base,
            user_end
        );
        if let Some(pe) = prev_end {
            assert!(
                ema.start >= pe,
                "ema at {:#x} overlaps or is out of order w.r.t. previous end {:#x}",
                ema.start,
                pe
            );
        }
        prev_end = Some(ema.end);

        assert_eq!(
            ema.committed.is_some(),
            !ema.alloc_flags.is_reserve(),
            "bitmap presence must track RESERVE exactly"
        );
    }
}

#[test]
fn commit_bit_monotonicity() {
    let _g = setup();
    let len = 8 * PAGE;
    let addr = alloc(len, AllocFlags::COMMIT_ON_DEMAND);

    emm::commit(addr, 4 * PAGE).unwrap();
    let after_first = find_ema(addr).committed.unwrap();
    assert!(after_first[..4].iter().all(|&b| b));
    assert!(after_first[4..].iter().all(|&b| !b));

    // Re-committing an overlapping range only ever turns 0 bits into 1.
    emm::commit(addr + 2 * PAGE, 4 * PAGE).unwrap();
    let after_second = find_ema(addr).committed.unwrap();
    for (i, (&before, &after)) in after_first.iter().zip(after_second.iter()).enumerate() {
        assert!(!before || after, "page {i} lost its commit bit on a second commit");
    }
    assert!(after_second.iter().all(|&b| b));

    emm::uncommit(addr, len).unwrap();
    let after_uncommit = find_ema(addr).committed.unwrap();
    assert!(after_uncommit.iter().all(|&b| !b), "uncommit must turn only 1 bits into 0");

    emm::dealloc(addr, len).unwrap();
}

#[test]
fn commit_is_idempotent() {
    let _g = setup();
    let len = 4 * PAGE;
    let addr = alloc(len, AllocFlags::COMMIT_ON_DEMAND);

    emm::commit(addr, len).unwrap();
    let first = find_ema(addr).committed.unwrap();
    emm::commit(addr, len).expect("re-committing an already-committed range is a no-op, not an error");
    let second = find_ema(addr).committed.unwrap();
    assert_eq!(first, second);

    emm::dealloc(addr, len).unwrap();
}

#[test]
fn modify_permissions_to_current_perms_is_idempotent() {
    let _g = setup();
    let len = 4 * PAGE;
    let addr = alloc(len, AllocFlags::COMMIT_NOW);

    emm::modify_permissions(addr, len, ProtFlags::RW).expect("no-op modify_permissions must succeed");
    let ema = find_ema(addr);
    assert_eq!(ema.info.prot, ProtFlags::RW);
    assert_eq!(ema.start, addr);
    assert_eq!(ema.end, addr + len);

    emm::dealloc(addr, len).unwrap();
}

#[test]
fn split_composition_is_idempotent() {
    let _g = setup();
    let len = 8 * PAGE;
    let addr = alloc(len, AllocFlags::COMMIT_NOW);

    // Splits the ema into three at [2, 6) pages.
    emm::modify_permissions(addr + 2 * PAGE, 4 * PAGE, ProtFlags::R).unwrap();
    let mut first: Vec<_> = emm::snapshot(RangeType::User)
        .into_iter()
        .filter(|e| e.start >= addr && e.end <= addr + len)
        .map(|e| (e.start, e.end, e.info.prot))
        .collect();
    first.sort();

    // The range is already exactly one ema; re-applying the same split
    // boundaries and permission must not change the list further.
    emm::modify_permissions(addr + 2 * PAGE, 4 * PAGE, ProtFlags::R).unwrap();
    let mut second: Vec<_> = emm::snapshot(RangeType::User)
        .into_iter()
        .filter(|e| e.start >= addr && e.end <= addr + len)
        .map(|e| (e.start, e.end, e.info.prot))
        .collect();
    second.sort();

    assert_eq!(first, second);
    assert_eq!(first.len(), 3);

    emm::dealloc(addr, len).unwrap();
}

#[test]
fn alloc_dealloc_round_trip_restores_the_list() {
    let _g = setup();
    let before: Vec<_> = emm::snapshot(RangeType::User).into_iter().map(|e| (e.start, e.end)).collect();

    let len = 6 * PAGE;
    let addr = alloc(len, AllocFlags::COMMIT_ON_DEMAND);
    emm::commit(addr, len).unwrap();
    emm::dealloc(addr, len).unwrap();

    let after: Vec<_> = emm::snapshot(RangeType::User).into_iter().map(|e| (e.start, e.end)).collect();
    assert_eq!(before, after, "alloc followed by dealloc of the same range must restore the list");
}

#[derive(Clone, Debug)]
enum Op {
    Alloc { pages: u8, reserve: bool },
    Commit { hint: usize },
    Uncommit { hint: usize },
    Dealloc { hint: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u8..=8, any::<bool>()).prop_map(|(pages, reserve)| Op::Alloc { pages, reserve }),
        2 => any::<usize>().prop_map(|hint| Op::Commit { hint }),
        1 => any::<usize>().prop_map(|hint| Op::Uncommit { hint }),
        2 => any::<usize>().prop_map(|hint| Op::Dealloc { hint }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Invariants 1-4, after every operation in a randomized sequence of
    /// allocations, commits, uncommits, and deallocations, and again once
    /// everything still live has been torn down.
    #[test]
    fn random_op_sequences_preserve_structural_invariants(ops in prop::collection::vec(op_strategy(), 1..24)) {
        let _g = setup();
        let mut live: Vec<(usize, usize, bool)> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc { pages, reserve } => {
                    let len = (pages as usize) * PAGE;
                    let flags = if reserve {
                        AllocFlags::RESERVE
                    } else {
                        AllocFlags::COMMIT_ON_DEMAND
                    };
                    if let Ok(addr) = emm::alloc_region(None, len, flags, PageType::Reg, ProtFlags::RW, None, 0) {
                        live.push((addr, len, reserve));
                    }
                }
                Op::Commit { hint } => {
                    if !live.is_empty() {
                        let (addr, len, reserve) = live[hint % live.len()];
                        if !reserve {
                            let _ = emm::commit(addr, len);
                        }
                    }
                }
                Op::Uncommit { hint } => {
                    if !live.is_empty() {
                        let (addr, len, reserve) = live[hint % live.len()];
                        if !reserve {
                            let _ = emm::uncommit(addr, len);
                        }
                    }
                }
                Op::Dealloc { hint } => {
                    if !live.is_empty() {
                        let (addr, len, _) = live.remove(hint % live.len());
                        emm::dealloc(addr, len).expect("dealloc of a live region must succeed");
                    }
                }
            }

            check_structural_invariants();
        }

        for (addr, len, _) in live {
            emm::dealloc(addr, len).expect("cleanup dealloc must succeed");
        }
        check_structural_invariants();
    }
}
