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

//! The EMM's public surface: one free function per memory-management
//! operation, each acquiring [`GLOBAL`] and routing to [`crate::emm::list`] and
//! [`crate::emm::ema`]. This is the only module callers outside
//! `crate::emm` are expected to use directly (re-exported from
//! `crate::emm`).

use crate::arch::SE_PAGE_SIZE;
use crate::emm::ema::{Ema, EmaAlloc};
use crate::emm::error::{OsResult, EEXIST, EINVAL};
use crate::emm::flags::AllocFlags;
use crate::emm::list::{EmaList, RangeType};
use crate::emm::page::{PageInfo, PageType, ProtFlags};
use crate::sync::{SpinReentrantMutex, Tcs};
use crate::veh::ExceptionHandler;

pub struct Emm {
    pub(crate) list: EmaList,
}

pub static GLOBAL: SpinReentrantMutex<Emm, Tcs> = SpinReentrantMutex::new(Emm {
    list: EmaList::new(),
});

fn validate_range(addr: usize, len: usize) -> OsResult {
    ensure!(len > 0, EINVAL);
    ensure!(is_page_aligned!(addr), EINVAL);
    ensure!(is_page_aligned!(len), EINVAL);
    Ok(())
}

/// Records the enclave's bounds and the user allocation window, and
/// prepares the internal heap. Must be called exactly once, before any
/// other entry point in this module, by the runtime that embeds this
/// crate.
pub fn init(enclave_base: usize, enclave_size: usize, user_base: usize, user_end: usize) -> OsResult {
    ensure!(is_page_aligned!(enclave_base), EINVAL);
    ensure!(is_page_aligned!(enclave_size), EINVAL);
    ensure!(user_base >= enclave_base, EINVAL);
    ensure!(user_end > user_base, EINVAL);
    ensure!(user_end <= enclave_base + enclave_size, EINVAL);

    crate::enclave::set_enclave_range(enclave_base, enclave_size);
    let mut emm = GLOBAL.lock();
    emm.list.init_user_window(user_base, user_end);
    Ok(())
}

/// Registers a range the loader already `EADD`ed at build time (a static
/// RTS region), without driving any out-call: the page is already backed
/// and already accepted. The entry point the enclave loader itself calls
/// through, distinct from the dynamic allocation operations below.
pub fn register_static(addr: usize, len: usize, typ: PageType, prot: ProtFlags) -> OsResult {
    validate_range(addr, len)?;
    let info = PageInfo::new(typ, prot);
    let mut emm = GLOBAL.lock();
    let ema = Ema::new(
        addr,
        len,
        AllocFlags::COMMIT_NOW | AllocFlags::SYSTEM,
        info,
        None,
        0,
        EmaAlloc::Static,
    );
    emm.list.insert_ref(RangeType::Rts, ema)
}

#[allow(clippy::too_many_arguments)]
pub fn alloc(
    addr_hint: Option<usize>,
    len: usize,
    alloc_flags: AllocFlags,
    typ: PageType,
    prot: ProtFlags,
    handler: Option<ExceptionHandler>,
    priv_data: usize,
) -> OsResult<usize> {
    ensure!(len > 0 && is_page_aligned!(len), EINVAL);
    let mut emm = GLOBAL.lock();

    // `alloc` only ever serves the user window: RTS regions are the
    // loader's own statically `EADD`ed pages, installed directly through
    // `register_static` rather than through this dynamic path. The
    // internal heap's own reserve arena (`SYSTEM`-flagged, see
    // `reserve_grow`) is carved from the user window too.
    let ty = RangeType::User;

    let addr = match addr_hint {
        Some(addr) => {
            ensure!(is_page_aligned!(addr), EINVAL);
            match emm.list.find_free_region_at(ty, addr, len) {
                Ok(()) => {}
                Err(EEXIST) => {
                    // A FIXED request may legitimately collide with
                    // existing RESERVE placeholders it means to replace.
                    let mut removed = emm.list.realloc_from_reserve_range(ty, addr, len)?;
                    while let Some(ema) = removed.pop_front() {
                        Ema::delete(ema);
                    }
                }
                Err(e) => return Err(e),
            }
            addr
        }
        None => {
            if alloc_flags.contains(AllocFlags::FIXED) {
                return Err(EINVAL);
            }
            emm.list.find_free_region(ty, len, alloc_flags)?
        }
    };

    let info = PageInfo::new(typ, prot);
    let ema = Ema::new(addr, len, alloc_flags, info, handler, priv_data, EmaAlloc::Reserve);

    // `do_alloc` must run before the EMA is visible in the list (a fault
    // landing mid-alloc has nothing sane to do), so mutate it through a
    // raw pointer before handing ownership to `insert_ref`.
    let raw = &*ema as *const Ema as *mut Ema;
    unsafe { (*raw).do_alloc()? };

    emm.list.insert_ref(ty, ema)?;
    Ok(addr)
}

pub fn dealloc(addr: usize, len: usize) -> OsResult {
    validate_range(addr, len)?;
    let mut emm = GLOBAL.lock();
    let ty = emm.list.check(addr, len)?;
    emm.list.for_each_whole_ema(ty, addr, len, |ema| ema.do_dealloc_loop())?;
    let mut cur = addr;
    while cur < addr + len {
        match emm.list.remove_at(ty, cur) {
            Some(ema) => {
                cur = ema.end();
                Ema::delete(ema);
            }
            None => break,
        }
    }
    Ok(())
}

pub fn commit(addr: usize, len: usize) -> OsResult {
    validate_range(addr, len)?;
    let mut emm = GLOBAL.lock();
    let ty = emm.list.check(addr, len)?;
    emm.list.for_each_overlap(ty, addr, len, |ema, lo, hi_len| {
        ema.can_commit(lo, hi_len)?;
        ema.do_commit_loop(lo, hi_len)
    })
}

pub fn commit_data(addr: usize, len: usize, source: usize) -> OsResult {
    validate_range(addr, len)?;
    let mut emm = GLOBAL.lock();
    let ty = emm.list.check(addr, len)?;
    let mut src = source;
    emm.list.for_each_overlap(ty, addr, len, |ema, lo, hi_len| {
        ema.can_commit_data(lo, hi_len)?;
        let r = ema.do_commit_data_loop(lo, hi_len, src);
        src += hi_len;
        r
    })
}

pub fn uncommit(addr: usize, len: usize) -> OsResult {
    validate_range(addr, len)?;
    let mut emm = GLOBAL.lock();
    let ty = emm.list.check(addr, len)?;
    emm.list.for_each_overlap(ty, addr, len, |ema, lo, hi_len| {
        ema.can_uncommit(lo, hi_len)?;
        ema.do_uncommit_loop(lo, hi_len)
    })
}

pub fn modify_permissions(addr: usize, len: usize, new_prot: ProtFlags) -> OsResult {
    validate_range(addr, len)?;
    let mut emm = GLOBAL.lock();
    let ty = emm.list.check(addr, len)?;
    emm.list.for_each_whole_ema(ty, addr, len, |ema| {
        ema.can_modify_permissions(new_prot)?;
        ema.do_modify_permissions_loop(new_prot)
    })
}

/// The only supported type transition: a committed `REG` region becoming
/// the `TCS` page(s) for a new thread.
pub fn modify_type(addr: usize, len: usize, new_typ: PageType) -> OsResult {
    ensure!(new_typ == PageType::Tcs, EINVAL);
    validate_range(addr, len)?;
    ensure!(len == SE_PAGE_SIZE, EINVAL);
    let mut emm = GLOBAL.lock();
    let ty = emm.list.check(addr, len)?;
    emm.list.for_each_whole_ema(ty, addr, len, |ema| {
        ema.can_change_to_tcs()?;
        ema.do_change_to_tcs_loop()
    })
}

pub fn register_pfhandler(addr: usize, len: usize, handler: ExceptionHandler, priv_data: usize) -> OsResult {
    validate_range(addr, len)?;
    let mut emm = GLOBAL.lock();
    let ty = emm.list.check(addr, len)?;
    emm.list.for_each_whole_ema(ty, addr, len, |ema| {
        ema.set_handler(Some(handler), priv_data);
        Ok(())
    })
}

/// Test-only introspection used by the integration test suite: a
/// point-in-time snapshot of one window's EMA list, for asserting on
/// sortedness, non-overlap, and bitmap state without reaching past the
/// crate's own lock.
#[cfg(feature = "sim")]
pub fn snapshot(ty: RangeType) -> alloc::vec::Vec<crate::emm::list::EmaSnapshot> {
    let emm = GLOBAL.lock();
    emm.list.snapshot(ty)
}

/// Test-only: the configured user-window bounds.
#[cfg(feature = "sim")]
pub fn user_window() -> (usize, usize) {
    let emm = GLOBAL.lock();
    (emm.list.user_base(), emm.list.user_end())
}

/// Grows the internal reserve arena: allocates `total_len` bytes of user
/// window space (reserving the final page as an always-uncommitted guard)
/// and commits the rest. Called only from [`crate::emm::heap::add_reserve`]
/// while the caller already holds [`GLOBAL`] re-entrantly.
///
/// Uses `COMMIT_ON_DEMAND`, not `RESERVE` — the reserve's arenas are
/// ordinary `sgx_mm_alloc` + `sgx_mm_commit` regions, never `RESERVE`
/// placeholders (`commit` on a `RESERVE` EMA is `EACCES`, not a usable path
/// to back it). `SYSTEM` marks the EMA as internal-heap-owned so
/// `realloc_from_reserve_range` refuses to repurpose it.
pub(crate) fn reserve_grow(total_len: usize, commit_len: usize) -> OsResult<(usize, usize)> {
    debug_assert!(total_len >= commit_len + SE_PAGE_SIZE);
    let addr = alloc(
        None,
        total_len,
        AllocFlags::COMMIT_ON_DEMAND | AllocFlags::SYSTEM,
        PageType::Reg,
        ProtFlags::RW,
        None,
        0,
    )?;
    commit(addr, commit_len)?;
    Ok((addr, commit_len))
}
