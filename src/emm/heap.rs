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

//! The EMM's own small-object allocator: a segregated free-list heap that
//! backs `Ema` nodes and `BitArray` buffers out of a "reserve" arena the
//! EMM itself carves from the user address window, plus a tiny static
//! "meta-reserve" used to bootstrap the reserve and to break the
//! recursion that growing it would otherwise cause.
//!
//! Every entry point here is only ever called while the caller already
//! holds the crate-wide `SpinReentrantMutex<Emm>` (see
//! [`crate::emm::dispatch`]), so `RESERVE` below needs no lock of its own
//! beyond what `Mutex` requires for `Sync` — it is never contended.

use crate::arch::SE_PAGE_SIZE;
use crate::emm::error::OsResult;
use alloc::vec::Vec;
use buddy_system_allocator::LockedHeap;
use core::alloc::{AllocError, Layout};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink, UnsafeRef};
use spin::{Mutex, Once};

// ---------------------------------------------------------------------
// Static meta-reserve: bootstraps EMAs/bitmaps created before the reserve
// arena exists, and everything allocated while `add_reserve` is re-entering
// the EMM to grow that arena.
// ---------------------------------------------------------------------

const STATIC_MEM_SIZE: usize = 64 * 1024;
static mut STATIC_MEM: [u8; STATIC_MEM_SIZE] = [0; STATIC_MEM_SIZE];
static STATIC: LockedHeap<32> = LockedHeap::empty();
static STATIC_INIT: Once<()> = Once::new();

fn static_range() -> (usize, usize) {
    let base = unsafe { STATIC_MEM.as_ptr() as usize };
    (base, base + STATIC_MEM_SIZE)
}

fn ensure_static_init() {
    STATIC_INIT.call_once(|| unsafe {
        STATIC
            .lock()
            .init(STATIC_MEM.as_mut_ptr() as usize, STATIC_MEM_SIZE);
    });
}

pub fn static_alloc(layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
    ensure_static_init();
    let ptr = STATIC.lock().alloc(layout).map_err(|_| AllocError)?;
    Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
}

pub unsafe fn static_dealloc(ptr: NonNull<u8>, layout: Layout) {
    STATIC.lock().dealloc(ptr, layout)
}

/// Set for the duration of [`add_reserve`]'s callback into
/// `dispatch::alloc`/`dispatch::commit`, so any `ResAlloc` traffic those
/// calls generate (an `Ema` node, a `BitArray`) is served from the static
/// meta-reserve instead of recursing back into the (currently exhausted)
/// reserve arena.
static ADDING_RESERVE: AtomicBool = AtomicBool::new(false);

// ---------------------------------------------------------------------
// Reserve: the growable segregated free-list arena.
// ---------------------------------------------------------------------

const NUM_EXACT_LISTS: usize = 256;
const EXACT_GRANULARITY: usize = 16;
const MAX_EXACT_SIZE: usize = NUM_EXACT_LISTS * EXACT_GRANULARITY;
const HEADER_SIZE: usize = core::mem::size_of::<usize>();
const FREE_BIT: usize = 1 << (usize::BITS - 1);
const MIN_BLOCK_SIZE: usize = core::mem::size_of::<FreeNode>();
const INITIAL_GROWTH: usize = 64 * 1024;
const MAX_GROWTH: usize = 256 * 1024 * 1024;

struct FreeNode {
    link: LinkedListLink,
}

intrusive_adapter!(FreeNodeAdapter = UnsafeRef<FreeNode>: FreeNode { link: LinkedListLink });

struct Reserve {
    exact: [LinkedList<FreeNodeAdapter>; NUM_EXACT_LISTS],
    large: LinkedList<FreeNodeAdapter>,
    /// `(base, end)` of every chunk obtained from `add_reserve`, used to
    /// bound the right-neighbor coalescing scan to memory the reserve
    /// actually owns.
    chunks: Vec<(usize, usize)>,
    total: usize,
    allocated: usize,
    growth_granted: usize,
}

impl Reserve {
    fn owns(&self, addr: usize) -> bool {
        self.chunks.iter().any(|&(base, end)| addr >= base && addr < end)
    }
}

static RESERVE: Mutex<Reserve> = Mutex::new(Reserve {
    exact: [const { LinkedList::new(FreeNodeAdapter::NEW) }; NUM_EXACT_LISTS],
    large: LinkedList::new(FreeNodeAdapter::NEW),
    chunks: Vec::new(),
    total: 0,
    allocated: 0,
    growth_granted: 0,
});

fn exact_class(size: usize) -> Option<usize> {
    if size == 0 || size > MAX_EXACT_SIZE {
        None
    } else {
        Some((size - 1) / EXACT_GRANULARITY)
    }
}

fn block_size_for(layout: Layout) -> usize {
    debug_assert!(layout.align() <= EXACT_GRANULARITY);
    let size = layout.size().max(MIN_BLOCK_SIZE);
    (size + EXACT_GRANULARITY - 1) & !(EXACT_GRANULARITY - 1)
}

unsafe fn header_ptr(block_addr: usize) -> *mut usize {
    block_addr as *mut usize
}

unsafe fn write_header(block_addr: usize, size: usize, free: bool) {
    let bit = if free { FREE_BIT } else { 0 };
    *header_ptr(block_addr) = size | bit;
}

unsafe fn read_size(block_addr: usize) -> usize {
    *header_ptr(block_addr) & !FREE_BIT
}

unsafe fn is_free(block_addr: usize) -> bool {
    *header_ptr(block_addr) & FREE_BIT != 0
}

fn free_list_for(reserve: &mut Reserve, size: usize) -> &mut LinkedList<FreeNodeAdapter> {
    match exact_class(size) {
        Some(class) => &mut reserve.exact[class],
        None => &mut reserve.large,
    }
}

unsafe fn push_free(reserve: &mut Reserve, block_addr: usize, size: usize) {
    write_header(block_addr, size, true);
    let node_addr = block_addr + HEADER_SIZE;
    let node = UnsafeRef::from_raw(node_addr as *const FreeNode);
    core::ptr::write(node_addr as *mut FreeNode, FreeNode { link: LinkedListLink::new() });
    free_list_for(reserve, size).push_back(node);
}

/// Finds a free block for `size` usable bytes: an exact match off the
/// segregated list if `size` falls in that range, else best-fit on the
/// large list (the smallest block that's still big enough). A large-list
/// match bigger than `size` is split, with the leftover pushed back onto
/// the free lists, provided it's big enough to hold a block of its own;
/// otherwise the whole block is handed out, the remainder's slack lost.
unsafe fn pop_free_fit(reserve: &mut Reserve, size: usize) -> Option<usize> {
    if let Some(class) = exact_class(size) {
        if let Some(node) = reserve.exact[class].pop_front() {
            return Some(node.as_ptr() as usize - HEADER_SIZE);
        }
    }

    let mut best: Option<(usize, usize)> = None;
    {
        let mut cursor = reserve.large.front();
        while let Some(node) = cursor.get() {
            let addr = node as *const FreeNode as usize - HEADER_SIZE;
            let block_size = read_size(addr);
            if block_size >= size && best.map_or(true, |(_, best_size)| block_size < best_size) {
                best = Some((addr, block_size));
            }
            cursor.move_next();
        }
    }
    let (addr, block_size) = best?;
    remove_free(reserve, addr, block_size);

    let leftover = block_size - size;
    if leftover >= HEADER_SIZE + MIN_BLOCK_SIZE {
        let remainder_addr = addr + HEADER_SIZE + size;
        let remainder_size = leftover - HEADER_SIZE;
        write_header(addr, size, true);
        push_free(reserve, remainder_addr, remainder_size);
    }
    Some(addr)
}

unsafe fn remove_free(reserve: &mut Reserve, block_addr: usize, size: usize) {
    let node_addr = block_addr + HEADER_SIZE;
    let list = free_list_for(reserve, size);
    let mut cursor = list.cursor_mut_from_ptr(node_addr as *const FreeNode);
    cursor.remove();
}

fn round_up_page(n: usize) -> usize {
    (n + SE_PAGE_SIZE - 1) & !(SE_PAGE_SIZE - 1)
}

/// Picks the next growth size: doubling from 64KiB, capped at 256MiB, and
/// never smaller than what the caller actually needs right now.
fn next_growth_size(reserve: &Reserve, needed: usize) -> usize {
    let mut candidate = if reserve.growth_granted == 0 {
        INITIAL_GROWTH
    } else {
        (reserve.growth_granted * 2).min(MAX_GROWTH)
    };
    if candidate < needed {
        candidate = round_up_page(needed);
    }
    round_up_page(candidate)
}

/// Grows the reserve arena by allocating+committing a fresh chunk from the
/// user window (via `dispatch`) plus one guard page left uncommitted, then
/// carves `needed` bytes of usable space out of it as one free block.
fn add_reserve(needed: usize) -> OsResult {
    let growth = {
        let reserve = RESERVE.lock();
        next_growth_size(&reserve, needed + HEADER_SIZE)
    };

    ADDING_RESERVE.store(true, Ordering::SeqCst);
    let result = crate::emm::dispatch::reserve_grow(growth + SE_PAGE_SIZE, growth);
    ADDING_RESERVE.store(false, Ordering::SeqCst);
    let (base, committed_len) = result?;

    let mut reserve = RESERVE.lock();
    unsafe {
        push_free(&mut reserve, base, committed_len - HEADER_SIZE);
    }
    reserve.chunks.push((base, base + committed_len));
    reserve.total += committed_len;
    reserve.growth_granted = growth;
    Ok(())
}

pub fn reserve_alloc(layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
    if ADDING_RESERVE.load(Ordering::SeqCst) {
        return static_alloc(layout);
    }
    let size = block_size_for(layout);
    loop {
        {
            let mut reserve = RESERVE.lock();
            if let Some(addr) = unsafe { pop_free_fit(&mut reserve, size) } {
                let block_size = unsafe { read_size(addr) };
                unsafe {
                    write_header(addr, block_size, false);
                }
                reserve.allocated += block_size + HEADER_SIZE;
                let user_ptr = NonNull::new((addr + HEADER_SIZE) as *mut u8).unwrap();
                return Ok(NonNull::slice_from_raw_parts(user_ptr, layout.size()));
            }
        }
        if add_reserve(size).is_err() {
            return Err(AllocError);
        }
    }
}

pub unsafe fn reserve_dealloc(ptr: NonNull<u8>, layout: Layout) {
    let (static_base, static_end) = static_range();
    let addr = ptr.as_ptr() as usize;
    if addr >= static_base && addr < static_end {
        // Served from the meta-reserve while `add_reserve` was re-entering.
        STATIC.lock().dealloc(ptr, layout);
        return;
    }

    let block_addr = addr - HEADER_SIZE;
    let mut size = read_size(block_addr);
    let mut reserve = RESERVE.lock();

    let neighbor = block_addr + HEADER_SIZE + size;
    if reserve.owns(neighbor) && is_free(neighbor) {
        let neighbor_size = read_size(neighbor);
        remove_free(&mut reserve, neighbor, neighbor_size);
        size += HEADER_SIZE + neighbor_size;
    }

    reserve.allocated -= read_size(block_addr) + HEADER_SIZE;
    push_free(&mut reserve, block_addr, size);
}

/// Bytes currently handed out of the reserve arena, for diagnostics and
/// property tests.
pub fn reserve_allocated() -> usize {
    RESERVE.lock().allocated
}

pub fn reserve_total() -> usize {
    RESERVE.lock().total
}
