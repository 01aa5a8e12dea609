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

//! Per-page types: `PageType`, `ProtFlags`, `PageInfo`, and the `Page`/
//! `PageRange` helpers that drive `EACCEPT`/`EMODPE` one page (or one
//! contiguous run) at a time.

use crate::arch::{Secinfo, SE_PAGE_SIZE};
use crate::inst::EnclUInst;
use bitflags::bitflags;

/// `SECINFO.flags` page-type field (low byte).
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageType {
    Secs = 0,
    Tcs = 1,
    Reg = 2,
    Va = 3,
    Trim = 4,
}

impl PageType {
    fn from_bits(bits: u8) -> PageType {
        match bits {
            1 => PageType::Tcs,
            2 => PageType::Reg,
            3 => PageType::Va,
            4 => PageType::Trim,
            _ => PageType::Secs,
        }
    }
}

bitflags! {
    /// Permission and state bits, packed into `SECINFO.flags` bits 8..=15.
    /// `PENDING`/`MODIFIED`/`PR` are EDMM transition-state bits, not
    /// mapping permissions, and coexist with `R`/`W`/`X` in the same byte.
    #[derive(Default)]
    pub struct ProtFlags: u8 {
        const NONE     = 0x00;
        const R        = 0x01;
        const W        = 0x02;
        const X        = 0x04;
        const PENDING  = 0x08;
        const MODIFIED = 0x10;
        const PR       = 0x20;
        const RW       = Self::R.bits | Self::W.bits;
        const RX       = Self::R.bits | Self::X.bits;
        const RWX      = Self::R.bits | Self::W.bits | Self::X.bits;
    }
}

/// Page type plus permission/state bits, the unit the EDMM driver passes
/// to `EACCEPT`/`EMODPE` for a single page (via [`Secinfo`]).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageInfo {
    pub typ: PageType,
    pub prot: ProtFlags,
}

impl PageInfo {
    pub fn new(typ: PageType, prot: ProtFlags) -> PageInfo {
        PageInfo { typ, prot }
    }

    pub(crate) fn from_secinfo_bits(bits: u64) -> PageInfo {
        PageInfo {
            typ: PageType::from_bits((bits & 0xff) as u8),
            prot: ProtFlags::from_bits_truncate(((bits >> 8) & 0xff) as u8),
        }
    }
}

impl From<PageInfo> for u64 {
    fn from(info: PageInfo) -> u64 {
        (info.typ as u64) | ((info.prot.bits() as u64) << 8)
    }
}

/// A single enclave page, addressed by its base address.
#[derive(Clone, Copy, Debug)]
pub struct Page {
    addr: usize,
    info: PageInfo,
}

impl Page {
    pub fn new(addr: usize, info: PageInfo) -> Page {
        debug_assert!(is_page_aligned!(addr));
        Page { addr, info }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn info(&self) -> PageInfo {
        self.info
    }

    /// `EACCEPT` this page with the given info (normally `PENDING` set for
    /// the forward transition, cleared once the page settles).
    pub fn accept(&self, info: PageInfo) -> Result<(), u32> {
        let secinfo: Secinfo = info.into();
        EnclUInst::eaccept(&secinfo, self.addr)
    }

    /// `EACCEPTCOPY` this page, copying from `source` in the untrusted
    /// out-call buffer, used by `commit_data`.
    pub fn accept_copy(&self, info: PageInfo, source: usize) -> Result<(), u32> {
        let secinfo: Secinfo = info.into();
        EnclUInst::eacceptcopy(&secinfo, self.addr, source)
    }

    /// `EMODPE`, which can only ever add permission bits.
    pub fn modpe(&self, info: PageInfo) -> Result<(), u32> {
        let secinfo: Secinfo = info.into();
        EnclUInst::emodpe(&secinfo, self.addr)
    }
}

/// A contiguous, page-aligned run of pages sharing one starting `PageInfo`,
/// walked either low-to-high (`GROWSUP`/default) or high-to-low
/// (`GROWSDOWN`, e.g. a stack region).
#[derive(Clone, Copy, Debug)]
pub struct PageRange {
    start: usize,
    end: usize,
    info: PageInfo,
}

impl PageRange {
    pub fn new(start: usize, length: usize, info: PageInfo) -> PageRange {
        debug_assert!(is_page_aligned!(start));
        debug_assert!(is_page_aligned!(length));
        PageRange {
            start,
            end: start + length,
            info,
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// `EACCEPT` every page from `start` up to `end`.
    pub fn accept_forward(&self) -> Result<(), u32> {
        let mut addr = self.start;
        while addr < self.end {
            Page::new(addr, self.info).accept(self.info)?;
            addr += SE_PAGE_SIZE;
        }
        Ok(())
    }

    /// `EACCEPT` every page from `end` down to `start`, used when the
    /// owning EMA grows down (stack-like regions).
    pub fn accept_backward(&self) -> Result<(), u32> {
        let mut addr = self.end;
        while addr > self.start {
            addr -= SE_PAGE_SIZE;
            Page::new(addr, self.info).accept(self.info)?;
        }
        Ok(())
    }

    /// `EMODPE` every page in the range, adding the range's permission
    /// bits without going through an out-call.
    pub fn modpe(&self) -> Result<(), u32> {
        let mut addr = self.start;
        while addr < self.end {
            Page::new(addr, self.info).modpe(self.info)?;
            addr += SE_PAGE_SIZE;
        }
        Ok(())
    }

    pub fn iter(&self) -> PageRangeIter {
        PageRangeIter {
            next: self.start,
            end: self.end,
            info: self.info,
        }
    }
}

pub struct PageRangeIter {
    next: usize,
    end: usize,
    info: PageInfo,
}

impl Iterator for PageRangeIter {
    type Item = Page;

    fn next(&mut self) -> Option<Page> {
        if self.next >= self.end {
            return None;
        }
        let page = Page::new(self.next, self.info);
        self.next += SE_PAGE_SIZE;
        Some(page)
    }
}
