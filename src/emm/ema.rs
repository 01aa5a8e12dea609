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

//! `Ema`: an Enclave Memory Area, and the EDMM state-machine driver that
//! turns `alloc`/`commit`/`uncommit`/`dealloc`/`modify_permissions`
//! requests into `EACCEPT`/`EMODPE` sequences and out-calls.
//!
//! Every `can_*` precheck here is pure: it walks the requested range and
//! either finds it all in a valid starting state or returns an error
//! without touching anything. Its paired `do_*_loop` then drives the
//! actual transition page-run by page-run and, per spec, does **not** roll
//! back a partial failure — a caller that sees an error from a `do_*_loop`
//! must assume the range is left in whatever state the last successful run
//! reached.

use crate::arch::{adds_permission, SE_PAGE_SIZE};
use crate::emm::alloc::{ResAlloc, StaticAlloc};
use crate::emm::bitmap::BitArray;
use crate::emm::error::{OsResult, EACCES, EFAULT, EINVAL};
use crate::emm::flags::AllocFlags;
use crate::emm::ocall::{alloc_ocall, modify_ocall};
use crate::emm::page::{Page, PageInfo, PageRange, PageType, ProtFlags};
use crate::veh::ExceptionHandler;
use alloc::boxed::Box;
use core::alloc::{AllocError, Allocator, Layout};
use core::ptr::NonNull;
use intrusive_collections::{intrusive_adapter, LinkedListLink, UnsafeRef};

/// Which backing allocator an `Ema`'s own node and bitmap were carved
/// from: almost everything uses `Reserve`; the handful of EMAs created before
/// the reserve arena exists (and everything the reserve's own growth
/// machinery allocates) uses `Static`.
#[derive(Clone, Copy, Debug, Default)]
pub enum EmaAlloc {
    #[default]
    Reserve,
    Static,
}

unsafe impl Allocator for EmaAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        match self {
            EmaAlloc::Reserve => ResAlloc.allocate(layout),
            EmaAlloc::Static => StaticAlloc.allocate(layout),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        match self {
            EmaAlloc::Reserve => ResAlloc.deallocate(ptr, layout),
            EmaAlloc::Static => StaticAlloc.deallocate(ptr, layout),
        }
    }
}

pub struct Ema {
    start: usize,
    length: usize,
    alloc_flags: AllocFlags,
    info: PageInfo,
    eaccept_map: Option<BitArray<EmaAlloc>>,
    handler: Option<ExceptionHandler>,
    priv_data: usize,
    alloc: EmaAlloc,
    link: LinkedListLink,
}

intrusive_adapter!(pub EmaAdapter = UnsafeRef<Ema>: Ema { link: LinkedListLink });

/// `EACCEPT`/`EMODPE`/`EACCEPTCOPY` failing after a `can_*` precheck has
/// already validated the range means the driver's model of EPC state has
/// diverged from reality. That is an invariant violation, not a recoverable
/// error, so it aborts rather than bubbling up an errno.
fn eaccept_fatal(err: u32) -> ! {
    panic!("EDMM instruction failed on a state the driver believed valid: {:#x}", err);
}

impl Ema {
    pub fn new(
        start: usize,
        length: usize,
        alloc_flags: AllocFlags,
        info: PageInfo,
        handler: Option<ExceptionHandler>,
        priv_data: usize,
        alloc: EmaAlloc,
    ) -> UnsafeRef<Ema> {
        debug_assert!(is_page_aligned!(start));
        debug_assert!(is_page_aligned!(length));
        let pages = length / SE_PAGE_SIZE;
        let eaccept_map = if alloc_flags.is_reserve() {
            None
        } else {
            Some(BitArray::new(pages, alloc))
        };
        let ema = Ema {
            start,
            length,
            alloc_flags,
            info,
            eaccept_map,
            handler,
            priv_data,
            alloc,
            link: LinkedListLink::new(),
        };
        let boxed = Box::new_in(ema, alloc);
        UnsafeRef::from_box(boxed)
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn end(&self) -> usize {
        self.start + self.length
    }

    pub fn alloc_flags(&self) -> AllocFlags {
        self.alloc_flags
    }

    pub fn info(&self) -> PageInfo {
        self.info
    }

    pub fn handler(&self) -> Option<(ExceptionHandler, usize)> {
        self.handler.map(|h| (h, self.priv_data))
    }

    pub fn set_handler(&mut self, handler: Option<ExceptionHandler>, priv_data: usize) {
        self.handler = handler;
        self.priv_data = priv_data;
    }

    pub fn overlap_addr(&self, addr: usize, len: usize) -> bool {
        addr < self.end() && addr + len > self.start
    }

    pub fn lower_than_addr(&self, addr: usize) -> bool {
        self.end() <= addr
    }

    pub fn higher_than_addr(&self, addr: usize) -> bool {
        self.start >= addr
    }

    fn page_index(&self, addr: usize) -> usize {
        (addr - self.start) / SE_PAGE_SIZE
    }

    fn is_committed(&self, addr: usize) -> bool {
        match &self.eaccept_map {
            Some(map) => map.get(self.page_index(addr)),
            None => false,
        }
    }

    /// Test-only: every page's commit bit in address order, for invariant
    /// and scenario assertions against the `sim` backend.
    #[cfg(feature = "sim")]
    pub fn committed_bits(&self) -> Option<alloc::vec::Vec<bool>> {
        self.eaccept_map
            .as_ref()
            .map(|map| (0..map.len()).map(|i| map.get(i)).collect())
    }

    /// Splits this EMA at `addr`, keeping `[start, addr)` in `self` and
    /// returning a freshly allocated `Ema` for `[addr, end)`, with the
    /// commit bitmap split to match.
    pub fn split(&mut self, addr: usize) -> UnsafeRef<Ema> {
        debug_assert!(addr > self.start && addr < self.end());
        debug_assert!(is_page_aligned!(addr));
        let upper_len = self.end() - addr;
        let pos = self.page_index(addr);
        let upper_map = self.eaccept_map.as_mut().map(|m| m.split(pos));
        let upper = Ema {
            start: addr,
            length: upper_len,
            alloc_flags: self.alloc_flags,
            info: self.info,
            eaccept_map: upper_map,
            handler: self.handler,
            priv_data: self.priv_data,
            alloc: self.alloc,
            link: LinkedListLink::new(),
        };
        self.length = addr - self.start;
        let boxed = Box::new_in(upper, self.alloc);
        UnsafeRef::from_box(boxed)
    }

    /// `sgx_mm_alloc`'s per-EMA work: reserve-only EMAs do nothing further;
    /// otherwise ask the untrusted side for backing EPC, then `EACCEPT`
    /// every page (direction following `GROWSDOWN`/`GROWSUP`), and mark the
    /// committed pages in the bitmap.
    pub fn do_alloc(&mut self) -> OsResult {
        if self.alloc_flags.is_reserve() {
            return Ok(());
        }

        let prot = if self.alloc_flags.commit_now() {
            self.info.prot
        } else {
            ProtFlags::NONE
        };

        alloc_ocall(self.start, self.length, self.info.typ, prot.bits() as i32)
            .map_err(|_| EFAULT)?;

        let range_info = PageInfo::new(self.info.typ, self.info.prot | ProtFlags::PENDING);
        let range = PageRange::new(self.start, self.length, range_info);
        let result = if self.alloc_flags.grows_down() {
            range.accept_backward()
        } else {
            range.accept_forward()
        };
        result.unwrap_or_else(|e| eaccept_fatal(e));

        if let Some(map) = &mut self.eaccept_map {
            if self.alloc_flags.commit_now() {
                map.set_all();
            } else {
                map.reset_all();
            }
        }
        Ok(())
    }

    /// Precheck for `commit`: the covered EMA must be a real (non-`RESERVE`)
    /// `REG` region with write permission — a `RESERVE` EMA has no backing
    /// to commit into, which is treated as a permission violation rather
    /// than a malformed request.
    pub fn can_commit(&self, addr: usize, len: usize) -> OsResult {
        ensure!(self.overlap_addr(addr, len), EINVAL);
        ensure!(!self.alloc_flags.is_reserve(), EACCES);
        ensure!(self.info.typ == PageType::Reg, EINVAL);
        ensure!(self.info.prot.contains(ProtFlags::W), EACCES);
        Ok(())
    }

    /// Commits `[addr, addr+len)` one uncommitted page at a time; already
    /// committed pages are skipped rather than treated as an error, so a
    /// re-commit of an overlapping range is idempotent.
    pub fn do_commit_loop(&mut self, addr: usize, len: usize) -> OsResult {
        let info = PageInfo::new(self.info.typ, self.info.prot);
        let mut cur = addr;
        let end = addr + len;
        while cur < end {
            if !self.is_committed(cur) {
                Page::new(cur, info).accept(info).unwrap_or_else(|e| eaccept_fatal(e));
                let idx = self.page_index(cur);
                if let Some(map) = &mut self.eaccept_map {
                    map.set(idx, true);
                }
            }
            cur += SE_PAGE_SIZE;
        }
        Ok(())
    }

    /// Precheck for `commit_data`: every covered page must currently be
    /// uncommitted — unlike plain `commit`, re-running `commit_data` over
    /// an already-populated page is not idempotent (it would silently skip
    /// the copy), so that is treated as malformed input.
    pub fn can_commit_data(&self, addr: usize, len: usize) -> OsResult {
        self.can_commit(addr, len)?;
        let start_idx = self.page_index(addr);
        let count = len / SE_PAGE_SIZE;
        let clean = self
            .eaccept_map
            .as_ref()
            .map(|m| !m.test_range_any(start_idx, count))
            .unwrap_or(false);
        ensure!(clean, EINVAL);
        Ok(())
    }

    /// Commits `[addr, addr+len)` by `EACCEPTCOPY`, copying initial
    /// contents from the untrusted `source` buffer page by page.
    pub fn do_commit_data_loop(&mut self, addr: usize, len: usize, source: usize) -> OsResult {
        let info = PageInfo::new(self.info.typ, self.info.prot);
        let mut cur = addr;
        let mut src = source;
        let end = addr + len;
        while cur < end {
            if !self.is_committed(cur) {
                Page::new(cur, info)
                    .accept_copy(info, src)
                    .unwrap_or_else(|e| eaccept_fatal(e));
                let idx = self.page_index(cur);
                if let Some(map) = &mut self.eaccept_map {
                    map.set(idx, true);
                }
            }
            cur += SE_PAGE_SIZE;
            src += SE_PAGE_SIZE;
        }
        Ok(())
    }

    pub fn can_uncommit(&self, addr: usize, len: usize) -> OsResult {
        ensure!(self.overlap_addr(addr, len), EINVAL);
        ensure!(!self.alloc_flags.is_reserve(), EACCES);
        Ok(())
    }

    /// Uncommits `[addr, addr+len)` by finding maximal committed runs and,
    /// for each: retyping to `TRIM` at the OS level, `EACCEPT`ing the
    /// `MODIFIED | TRIM` transition forward, clearing the commit bits, and
    /// issuing the `TRIM -> TRIM` out-call that finalizes the trim.
    ///
    /// Per spec, a range whose current permission is `NONE` is first raised
    /// to `READ` (EDMM requires a readable page to retype it) via `EMODPE`
    /// alone — no out-call, since the untrusted mapping stays `PROT_NONE`.
    /// `self.info.prot` is deliberately left at `NONE`: pages this call
    /// doesn't end up trimming keep the hardware-level `READ` grant with no
    /// record of it, reproducing the source driver's behavior as-is.
    pub fn do_uncommit_loop(&mut self, addr: usize, len: usize) -> OsResult {
        if self.info.prot == ProtFlags::NONE {
            let readable = PageInfo::new(self.info.typ, ProtFlags::R);
            PageRange::new(addr, len, readable)
                .modpe()
                .unwrap_or_else(|e| eaccept_fatal(e));
        }

        let end = addr + len;
        let mut cur = addr;
        while cur < end {
            if !self.is_committed(cur) {
                cur += SE_PAGE_SIZE;
                continue;
            }
            let run_start = cur;
            while cur < end && self.is_committed(cur) {
                cur += SE_PAGE_SIZE;
            }
            let run_len = cur - run_start;

            let from_info = PageInfo::new(self.info.typ, self.info.prot);
            let to_info = PageInfo::new(PageType::Trim, self.info.prot);
            modify_ocall(run_start, run_len, from_info, to_info).map_err(|_| EFAULT)?;

            let trim_info = PageInfo::new(PageType::Trim, ProtFlags::MODIFIED);
            PageRange::new(run_start, run_len, trim_info)
                .accept_forward()
                .unwrap_or_else(|e| eaccept_fatal(e));

            let start_idx = self.page_index(run_start);
            let count = run_len / SE_PAGE_SIZE;
            if let Some(map) = &mut self.eaccept_map {
                map.reset_range(start_idx, count);
            }

            let trim_notify = PageInfo::new(PageType::Trim, self.info.prot);
            modify_ocall(run_start, run_len, trim_notify, trim_notify).map_err(|_| EFAULT)?;
        }
        Ok(())
    }

    /// Uncommits the whole EMA ahead of unlinking/destroying it. `RESERVE`
    /// EMAs have no backing to release, so they are a no-op here rather
    /// than `can_uncommit`'s `EACCES` — dealloc must tolerate tearing down
    /// a mix of committed and purely reserved regions in one call.
    pub fn do_dealloc_loop(&mut self) -> OsResult {
        if self.alloc_flags.is_reserve() {
            return Ok(());
        }
        self.do_uncommit_loop(self.start, self.length)
    }

    /// Precheck for `modify_permissions`: the whole covered EMA must be a
    /// committed `REG` region. Spec.md's S4 scenario requires this to
    /// reject a request spanning still-uncommitted pages with `EINVAL`
    /// rather than silently skipping them.
    pub fn can_modify_permissions(&self, new_prot: ProtFlags) -> OsResult {
        ensure!(!self.alloc_flags.is_reserve(), EACCES);
        ensure!(self.info.typ == PageType::Reg, EINVAL);
        let committed = self
            .eaccept_map
            .as_ref()
            .map(|m| m.all_true())
            .unwrap_or(false);
        ensure!(committed, EINVAL);
        let _ = new_prot;
        Ok(())
    }

    /// `EMODPE` can only add permission bits; anything that removes a bit
    /// (or a target of exactly `NONE`) must first go through the untrusted
    /// `modify_ocall` so the OS-level mapping agrees before the trusted
    /// side is told to restrict itself.
    pub fn do_modify_permissions_loop(&mut self, new_prot: ProtFlags) -> OsResult {
        if new_prot == self.info.prot {
            return Ok(());
        }

        let from_info = PageInfo::new(self.info.typ, self.info.prot);
        let to_info = PageInfo::new(self.info.typ, new_prot);

        if !adds_permission(self.info.prot, new_prot) || new_prot == ProtFlags::NONE {
            modify_ocall(self.start, self.length, from_info, to_info).map_err(|_| EFAULT)?;
        }

        if adds_permission(self.info.prot, new_prot) {
            let add_info = PageInfo::new(self.info.typ, new_prot);
            PageRange::new(self.start, self.length, add_info)
                .modpe()
                .unwrap_or_else(|e| eaccept_fatal(e));
            if new_prot != ProtFlags::RWX {
                let settle = PageInfo::new(self.info.typ, ProtFlags::PR | new_prot);
                PageRange::new(self.start, self.length, settle)
                    .accept_forward()
                    .unwrap_or_else(|e| eaccept_fatal(e));
            }
        }

        if new_prot == ProtFlags::NONE {
            let none_info = PageInfo::new(self.info.typ, ProtFlags::NONE);
            modify_ocall(self.start, self.length, none_info, none_info).map_err(|_| EFAULT)?;
        }

        self.info.prot = new_prot;
        Ok(())
    }

    /// Reclaims the node itself, after its caller has already unlinked it
    /// from whichever `EmaList` root held it.
    pub fn delete(this: UnsafeRef<Ema>) {
        let alloc = this.alloc;
        unsafe {
            let raw = UnsafeRef::into_raw(this);
            drop(Box::from_raw_in(raw as *mut Ema, alloc));
        }
    }

    /// Precheck for `modify_type(REG -> TCS)`: the page must be committed,
    /// `REG`, and currently `R+W` (or already `TCS`, so re-invoking the
    /// conversion on an already-converted page is idempotent).
    pub fn can_change_to_tcs(&self) -> OsResult {
        if self.info.typ == PageType::Tcs {
            return Ok(());
        }
        ensure!(self.info.typ == PageType::Reg, EINVAL);
        ensure!(self.info.prot == ProtFlags::RW, EACCES);
        let committed = self
            .eaccept_map
            .as_ref()
            .map(|m| m.all_true())
            .unwrap_or(false);
        ensure!(committed, EACCES);
        Ok(())
    }

    /// Retypes a committed `REG` EMA to `TCS`: `modify_ocall` first, then
    /// one `EMODT`-equivalent `EACCEPT` of the new type.
    pub fn do_change_to_tcs_loop(&mut self) -> OsResult {
        if self.info.typ == PageType::Tcs {
            return Ok(());
        }
        let from_info = PageInfo::new(PageType::Reg, self.info.prot);
        let to_info = PageInfo::new(PageType::Tcs, self.info.prot);
        modify_ocall(self.start, self.length, from_info, to_info).map_err(|_| EFAULT)?;
        let tcs_info = PageInfo::new(PageType::Tcs, ProtFlags::MODIFIED);
        PageRange::new(self.start, self.length, tcs_info)
            .accept_forward()
            .unwrap_or_else(|e| eaccept_fatal(e));
        self.info.typ = PageType::Tcs;
        self.info.prot = ProtFlags::NONE;
        Ok(())
    }
}
