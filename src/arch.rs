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

//! Architectural constants and the `ENCLU` leaf/`SECINFO` wire formats the
//! EMM drives. Mirrors `sgx_trts::arch`, trimmed to what the EDMM driver
//! needs.

use crate::emm::page::{PageInfo, ProtFlags};

pub const SE_PAGE_SHIFT: usize = 12;
pub const SE_PAGE_SIZE: usize = 1 << SE_PAGE_SHIFT;

pub fn page_base(addr: usize) -> usize {
    addr & !(SE_PAGE_SIZE - 1)
}

pub fn page_round_up(addr: usize) -> usize {
    page_base(addr + SE_PAGE_SIZE - 1)
}

/// `ENCLU` leaf function numbers used by the in-enclave instruction
/// wrappers in [`crate::inst`].
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Enclu {
    EAccept = 5,
    EModpe = 6,
    EAcceptcopy = 7,
}

/// `SECINFO`: a 64-byte, 64-byte-aligned structure passed to `EACCEPT` and
/// `EMODPE`. Only the first qword (page type, permission, and state bits
/// packed by [`PageInfo`]) is meaningful to EDMM; the rest is reserved and
/// must be zero.
#[repr(C, align(64))]
#[derive(Clone, Copy, Debug, Default)]
pub struct Secinfo {
    pub flags: u64,
    reserved: [u64; 7],
}

impl From<PageInfo> for Secinfo {
    fn from(info: PageInfo) -> Self {
        Secinfo {
            flags: info.into(),
            reserved: [0; 7],
        }
    }
}

/// `EMODPE` only ever *adds* permissions; removing one always goes through
/// an untrusted `modify_ocall` first. Several `do_*_loop` drivers in
/// [`crate::emm::ema`] need this without constructing an `EMA`.
pub fn adds_permission(old: ProtFlags, new: ProtFlags) -> bool {
    (new | old) != old
}
