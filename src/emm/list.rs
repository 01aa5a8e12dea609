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

//! `EmaList`: the two EMA roots (RTS window and user window), kept sorted
//! and non-overlapping, with the free-region search and split-at-boundary
//! machinery the dispatcher needs before driving an EDMM transition.

use crate::emm::ema::{Ema, EmaAdapter};
use crate::emm::error::{OsResult, EEXIST, EINVAL, ENOMEM};
use crate::emm::flags::AllocFlags;
use intrusive_collections::LinkedList;

/// Test-only snapshot of one `Ema`'s externally observable state, used by
/// the integration test suite's invariant and scenario checks against the
/// `sim` backend. Never constructed or consumed outside `#[cfg(test)]`
/// code paths.
#[cfg(feature = "sim")]
#[derive(Clone, Debug)]
pub struct EmaSnapshot {
    pub start: usize,
    pub end: usize,
    pub alloc_flags: AllocFlags,
    pub info: crate::emm::page::PageInfo,
    pub committed: Option<alloc::vec::Vec<bool>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RangeType {
    Rts,
    User,
}

pub struct EmaList {
    rts: LinkedList<EmaAdapter>,
    user: LinkedList<EmaAdapter>,
    user_base: usize,
    user_end: usize,
}

impl EmaList {
    pub const fn new() -> EmaList {
        EmaList {
            rts: LinkedList::new(EmaAdapter::NEW),
            user: LinkedList::new(EmaAdapter::NEW),
            user_base: 0,
            user_end: 0,
        }
    }

    pub fn init_user_window(&mut self, base: usize, end: usize) {
        self.user_base = base;
        self.user_end = end;
    }

    pub fn user_base(&self) -> usize {
        self.user_base
    }

    pub fn user_end(&self) -> usize {
        self.user_end
    }

    fn root(&mut self, ty: RangeType) -> &mut LinkedList<EmaAdapter> {
        match ty {
            RangeType::Rts => &mut self.rts,
            RangeType::User => &mut self.user,
        }
    }

    /// Which window `[addr, addr+len)` falls in, per spec's windowing
    /// invariant: the user window is `[user_base, user_end)`; everything
    /// else inside the enclave belongs to the RTS window.
    pub fn check(&self, addr: usize, len: usize) -> OsResult<RangeType> {
        let end = addr + len;
        if self.user_end > self.user_base && addr >= self.user_base && end <= self.user_end {
            Ok(RangeType::User)
        } else if crate::enclave::is_within_enclave(addr, len) {
            Ok(RangeType::Rts)
        } else {
            Err(EINVAL)
        }
    }

    /// Inserts `ema` keeping the list ordered by start address. Errors if
    /// it overlaps an existing entry.
    pub fn insert_ref(&mut self, ty: RangeType, node: intrusive_collections::UnsafeRef<Ema>) -> OsResult {
        let list = self.root(ty);
        let mut cursor = list.front_mut();
        while let Some(existing) = cursor.get() {
            if existing.overlap_addr(node.start(), node.length()) {
                return Err(EEXIST);
            }
            if existing.start() > node.start() {
                break;
            }
            cursor.move_next();
        }
        cursor.insert_before(node);
        Ok(())
    }

    /// Removes and returns the `Ema` starting exactly at `addr`, if any.
    pub fn remove_at(&mut self, ty: RangeType, addr: usize) -> Option<intrusive_collections::UnsafeRef<Ema>> {
        let list = self.root(ty);
        let mut cursor = list.front_mut();
        while cursor.get().is_some() {
            if cursor.get().unwrap().start() == addr {
                return cursor.remove();
            }
            cursor.move_next();
        }
        None
    }

    pub fn search_at(&self, ty: RangeType, addr: usize) -> Option<&Ema> {
        let list = match ty {
            RangeType::Rts => &self.rts,
            RangeType::User => &self.user,
        };
        let mut cursor = list.front();
        while let Some(ema) = cursor.get() {
            if ema.overlap_addr(addr, 1) {
                return Some(ema);
            }
            cursor.move_next();
        }
        None
    }

    /// Walks both roots looking for an EMA covering `addr`. Used by the
    /// page-fault handler, which doesn't know in advance which window a
    /// faulting address belongs to.
    pub fn search_any(&self, addr: usize) -> Option<&Ema> {
        self.search_at(RangeType::User, addr)
            .or_else(|| self.search_at(RangeType::Rts, addr))
    }

    /// Splits whichever EMAs straddle `addr` and `addr+len` so that
    /// afterward some EMA (or run of EMAs) in `ty`'s root starts exactly
    /// at `addr` and another ends exactly at `addr+len`.
    fn split_at_boundaries(&mut self, ty: RangeType, addr: usize, len: usize) -> OsResult {
        let end = addr + len;
        if let Some(split_addr) = self.find_straddle(ty, addr) {
            self.split_one(ty, split_addr, addr)?;
        }
        if let Some(split_addr) = self.find_straddle(ty, end) {
            self.split_one(ty, split_addr, end)?;
        }
        Ok(())
    }

    fn find_straddle(&self, ty: RangeType, at: usize) -> Option<usize> {
        let list = match ty {
            RangeType::Rts => &self.rts,
            RangeType::User => &self.user,
        };
        let mut cursor = list.front();
        while let Some(ema) = cursor.get() {
            if ema.start() < at && at < ema.end() {
                return Some(ema.start());
            }
            cursor.move_next();
        }
        None
    }

    fn split_one(&mut self, ty: RangeType, ema_start: usize, at: usize) -> OsResult {
        let list = self.root(ty);
        let mut cursor = list.front_mut();
        while let Some(ema_ref) = cursor.get() {
            if ema_ref.start() == ema_start {
                let new_upper = unsafe {
                    let raw = cursor.get().unwrap() as *const Ema as *mut Ema;
                    (*raw).split(at)
                };
                cursor.insert_after(new_upper);
                return Ok(());
            }
            cursor.move_next();
        }
        Err(EINVAL)
    }

    /// Ensures `[addr, addr+len)` is fully covered by EMAs in `ty`'s root
    /// with no gap, splitting boundary EMAs first, then calls `f` once per
    /// whole EMA inside the range in address order.
    pub fn for_each_whole_ema<F>(&mut self, ty: RangeType, addr: usize, len: usize, mut f: F) -> OsResult
    where
        F: FnMut(&mut Ema) -> OsResult,
    {
        self.split_at_boundaries(ty, addr, len)?;
        let end = addr + len;
        let list = self.root(ty);
        let mut cursor = list.front_mut();
        let mut cur = addr;
        while let Some(ema) = cursor.get() {
            if ema.start() >= end {
                break;
            }
            if ema.start() == cur {
                let raw = ema as *const Ema as *mut Ema;
                unsafe {
                    f(&mut *raw)?;
                }
                cur = ema.end();
            }
            cursor.move_next();
        }
        if cur != end {
            return Err(EINVAL);
        }
        Ok(())
    }

    /// Calls `f` once for every (possibly partial) EMA overlapping
    /// `[addr, addr+len)`, with the clipped sub-range, erroring if the
    /// range is not fully covered.
    pub fn for_each_overlap<F>(&mut self, ty: RangeType, addr: usize, len: usize, mut f: F) -> OsResult
    where
        F: FnMut(&mut Ema, usize, usize) -> OsResult,
    {
        let end = addr + len;
        let list = self.root(ty);
        let mut cursor = list.front_mut();
        let mut cur = addr;
        while let Some(ema) = cursor.get() {
            if ema.start() >= end {
                break;
            }
            if ema.overlap_addr(addr, len) {
                if ema.start() > cur {
                    return Err(EINVAL);
                }
                let lo = cur.max(ema.start());
                let hi = end.min(ema.end());
                let raw = ema as *const Ema as *mut Ema;
                unsafe {
                    f(&mut *raw, lo, hi - lo)?;
                }
                cur = hi;
            }
            cursor.move_next();
        }
        if cur != end {
            return Err(EINVAL);
        }
        Ok(())
    }

    /// Finds `len` bytes of free space in `ty`'s window, preferring low
    /// addresses (first-fit).
    ///
    /// The user window only ever offers space at or above `user_base`
    /// (never below it) even when its list is empty; this asymmetry is
    /// intentional. The RTS window has no such fixed
    /// floor: when it holds no EMAs yet, the highest enclave-resident,
    /// page-aligned address below `user_base` is preferred (loader-owned
    /// regions grow down toward the user window from above), falling back
    /// to the first free address above `user_end` if that doesn't fit.
    pub fn find_free_region(&self, ty: RangeType, len: usize, flags: AllocFlags) -> OsResult<usize> {
        let _ = flags;
        match ty {
            RangeType::User => self.find_free_region_user(len),
            RangeType::Rts => self.find_free_region_rts(len),
        }
    }

    fn find_free_region_user(&self, len: usize) -> OsResult<usize> {
        let mut cur = self.user_base;
        let mut cursor = self.user.front();
        while let Some(ema) = cursor.get() {
            if ema.start() >= cur + len {
                break;
            }
            cur = ema.end();
            cursor.move_next();
        }
        if cur + len > self.user_end {
            return Err(ENOMEM);
        }
        Ok(cur)
    }

    fn find_free_region_rts(&self, len: usize) -> OsResult<usize> {
        if self.rts.is_empty() {
            if self.user_base >= len {
                let addr = crate::arch::page_base(self.user_base - len);
                if crate::enclave::is_within_enclave(addr, len) {
                    return Ok(addr);
                }
            }
            let addr = crate::arch::page_round_up(self.user_end);
            if crate::enclave::is_within_enclave(addr, len) {
                return Ok(addr);
            }
            return Err(ENOMEM);
        }

        let mut cursor = self.rts.front();
        let mut prev_end = None;
        while let Some(ema) = cursor.get() {
            if let Some(prev_end) = prev_end {
                let gap = ema.start().saturating_sub(prev_end);
                if gap >= len && crate::enclave::is_within_enclave(prev_end, len) {
                    return Ok(prev_end);
                }
            }
            prev_end = Some(ema.end());
            cursor.move_next();
        }

        // No gap fit: try above the last node.
        let last_end = prev_end.unwrap();
        if crate::enclave::is_within_enclave(last_end, len) {
            return Ok(last_end);
        }

        // Fall back to below the first node.
        let first_start = self.rts.front().get().unwrap().start();
        if first_start < len {
            return Err(ENOMEM);
        }
        let addr = first_start - len;
        if crate::enclave::is_within_enclave(addr, len) {
            return Ok(addr);
        }
        Err(ENOMEM)
    }

    /// Test-only: every `Ema` currently on `ty`'s root, in address order.
    #[cfg(feature = "sim")]
    pub fn snapshot(&self, ty: RangeType) -> alloc::vec::Vec<EmaSnapshot> {
        let list = match ty {
            RangeType::Rts => &self.rts,
            RangeType::User => &self.user,
        };
        let mut out = alloc::vec::Vec::new();
        let mut cursor = list.front();
        while let Some(ema) = cursor.get() {
            out.push(EmaSnapshot {
                start: ema.start(),
                end: ema.end(),
                alloc_flags: ema.alloc_flags(),
                info: ema.info(),
                committed: ema.committed_bits(),
            });
            cursor.move_next();
        }
        out
    }

    pub fn find_free_region_at(&self, ty: RangeType, addr: usize, len: usize) -> OsResult {
        match ty {
            RangeType::User => {
                if addr < self.user_base || addr + len > self.user_end {
                    return Err(EINVAL);
                }
            }
            RangeType::Rts => {
                if !crate::enclave::is_within_enclave(addr, len) {
                    return Err(EINVAL);
                }
            }
        }
        let list = match ty {
            RangeType::Rts => &self.rts,
            RangeType::User => &self.user,
        };
        let mut cursor = list.front();
        while let Some(ema) = cursor.get() {
            if ema.overlap_addr(addr, len) {
                return Err(EEXIST);
            }
            cursor.move_next();
        }
        Ok(())
    }

    /// Repurposes a run of existing `RESERVE` EMAs in `ty`'s window to back
    /// a new fixed-address allocation request that collides with them: a
    /// `RESERVE` placeholder promises the address range, not committed
    /// backing, so a later `alloc` at that exact range is expected to
    /// succeed by replacing the placeholder rather than failing `EEXIST`.
    ///
    /// Fails if `[addr, addr+len)` is not fully, contiguously covered by
    /// the existing list (a gap means the caller asked for address space
    /// nobody reserved), if any covering EMA is not `RESERVE`, or if any
    /// covering EMA is `SYSTEM`-flagged (internal-heap-owned regions are
    /// never reinterpreted as ordinary reservations). On success the
    /// covering EMAs are removed (boundary ones split first) and handed
    /// back to the caller for disposal; the caller installs the
    /// replacement EMA itself.
    pub fn realloc_from_reserve_range(
        &mut self,
        ty: RangeType,
        addr: usize,
        len: usize,
    ) -> OsResult<LinkedList<EmaAdapter>> {
        let end = addr + len;
        {
            let list = match ty {
                RangeType::Rts => &self.rts,
                RangeType::User => &self.user,
            };
            let mut cursor = list.front();
            let mut cur = addr;
            while let Some(ema) = cursor.get() {
                if ema.start() >= end {
                    break;
                }
                if ema.overlap_addr(addr, len) {
                    if ema.start() > cur {
                        return Err(EEXIST);
                    }
                    if !ema.alloc_flags().is_reserve() || ema.alloc_flags().is_system() {
                        return Err(EEXIST);
                    }
                    cur = ema.end();
                }
                cursor.move_next();
            }
            if cur != end {
                return Err(EEXIST);
            }
        }

        self.split_at_boundaries(ty, addr, len)?;

        let mut removed = LinkedList::new(EmaAdapter::NEW);
        let list = self.root(ty);
        let mut cursor = list.front_mut();
        while let Some(ema) = cursor.get() {
            if ema.start() >= end {
                break;
            }
            if ema.start() >= addr {
                let node = cursor.remove().unwrap();
                removed.push_back(node);
            } else {
                cursor.move_next();
            }
        }
        Ok(removed)
    }
}
