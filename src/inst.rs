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

//! In-enclave instruction wrappers: `EACCEPT`, `EMODPE`, `EACCEPTCOPY`.
//!
//! This is a runtime-abstraction collaborator, not part of the EMM core:
//! the core only needs "accept this page", "add this permission",
//! "accept-and-copy this page" to succeed or fail. The `sim` backend
//! models the same contract against an in-memory fake EPC so the EDMM
//! driver can be exercised without hardware.

use crate::arch::Secinfo;

cfg_if::cfg_if! {
    if #[cfg(feature = "sim")] {
        pub use sim::EnclUInst;
    } else {
        pub use hw::EnclUInst;
    }
}

#[cfg(not(feature = "sim"))]
mod hw {
    use super::Secinfo;
    use crate::arch::Enclu;
    use core::arch::asm;

    pub struct EnclUInst;

    impl EnclUInst {
        pub fn eaccept(info: &Secinfo, addr: usize) -> Result<(), u32> {
            unsafe {
                let error: u32;
                asm!(
                    "xchg rbx, {0}",
                    "enclu",
                    "mov rbx, {0}",
                    inout(reg) info => _,
                    inlateout("eax") Enclu::EAccept as u32 => error,
                    in("rcx") addr,
                    options(nostack),
                );
                if error == 0 {
                    Ok(())
                } else {
                    Err(error)
                }
            }
        }

        pub fn eacceptcopy(info: &Secinfo, addr: usize, source: usize) -> Result<(), u32> {
            unsafe {
                let error: u32;
                asm!(
                    "xchg rbx, {0}",
                    "enclu",
                    "mov rbx, {0}",
                    inout(reg) info => _,
                    inlateout("eax") Enclu::EAcceptcopy as u32 => error,
                    in("rcx") addr,
                    in("rdx") source,
                    options(nostack),
                );
                if error == 0 {
                    Ok(())
                } else {
                    Err(error)
                }
            }
        }

        pub fn emodpe(info: &Secinfo, addr: usize) -> Result<(), u32> {
            unsafe {
                asm!(
                    "xchg rbx, {0}",
                    "enclu",
                    "mov rbx, {0}",
                    inout(reg) info => _,
                    in("eax") Enclu::EModpe as u32,
                    in("rcx") addr,
                    options(preserves_flags, nostack),
                );
                Ok(())
            }
        }
    }
}

#[cfg(feature = "sim")]
pub mod sim {
    use super::Secinfo;
    use crate::emm::page::PageInfo;
    use alloc::collections::BTreeMap;
    use spin::Mutex;

    /// One simulated EPC page's last-accepted state, recorded so tests can
    /// assert on it directly instead of re-deriving it from bitmaps.
    #[derive(Clone, Copy, Debug)]
    pub struct AcceptedPage {
        pub info: PageInfo,
    }

    #[derive(Default)]
    pub struct FakeEpc {
        pages: BTreeMap<usize, AcceptedPage>,
        pub eaccept_count: usize,
        pub emodpe_count: usize,
        pub eacceptcopy_count: usize,
        pub eaccept_order: alloc::vec::Vec<usize>,
    }

    impl FakeEpc {
        pub fn page(&self, addr: usize) -> Option<AcceptedPage> {
            self.pages.get(&addr).copied()
        }

        pub fn reset_order(&mut self) {
            self.eaccept_order.clear();
        }
    }

    pub static FAKE_EPC: Mutex<FakeEpc> = Mutex::new(FakeEpc {
        pages: BTreeMap::new(),
        eaccept_count: 0,
        emodpe_count: 0,
        eacceptcopy_count: 0,
        eaccept_order: alloc::vec::Vec::new(),
    });

    pub struct EnclUInst;

    impl EnclUInst {
        pub fn eaccept(info: &Secinfo, addr: usize) -> Result<(), u32> {
            let mut epc = FAKE_EPC.lock();
            epc.eaccept_count += 1;
            epc.eaccept_order.push(addr);
            epc.pages.insert(
                addr,
                AcceptedPage {
                    info: PageInfo::from_secinfo_bits(info.flags),
                },
            );
            Ok(())
        }

        pub fn eacceptcopy(info: &Secinfo, addr: usize, _source: usize) -> Result<(), u32> {
            let mut epc = FAKE_EPC.lock();
            epc.eacceptcopy_count += 1;
            epc.pages.insert(
                addr,
                AcceptedPage {
                    info: PageInfo::from_secinfo_bits(info.flags),
                },
            );
            Ok(())
        }

        pub fn emodpe(_info: &Secinfo, _addr: usize) -> Result<(), u32> {
            FAKE_EPC.lock().emodpe_count += 1;
            Ok(())
        }
    }
}
