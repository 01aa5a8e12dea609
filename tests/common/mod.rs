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

//! Shared harness for the integration suite: a real, page-aligned buffer
//! standing in for enclave linear address space (the `sim` EDMM backend
//! never touches the pages it "accepts", but the internal heap in
//! `emm::heap` writes real block headers through the addresses `alloc`
//! hands out, so the window has to back real memory), plus a lock
//! serializing access to the crate's single process-wide `Emm`.
//!
//! `emm::init` may only run once per process; every test in this binary
//! reuses the same arena and window rather than re-initializing.

use std::alloc::{alloc_zeroed, Layout};
use std::sync::{Mutex, MutexGuard, Once, OnceLock};

use sgx_emm::arch::SE_PAGE_SIZE;

pub const PAGE: usize = SE_PAGE_SIZE;

const ARENA_PAGES: usize = 32 * 1024; // 128 MiB: headroom for reserve growth.
const ARENA_SIZE: usize = ARENA_PAGES * SE_PAGE_SIZE;
const RTS_PAGES: usize = 64; // space below `user_base` for the RTS window.

static TEST_LOCK: Mutex<()> = Mutex::new(());
static INIT: Once = Once::new();

fn arena_base() -> usize {
    static BASE: OnceLock<usize> = OnceLock::new();
    *BASE.get_or_init(|| {
        let layout = Layout::from_size_align(ARENA_SIZE, SE_PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "failed to reserve the test arena");
        ptr as usize
    })
}

pub fn user_base() -> usize {
    arena_base() + RTS_PAGES * SE_PAGE_SIZE
}

pub fn user_end() -> usize {
    arena_base() + ARENA_SIZE
}

/// Locks out other tests sharing this binary's process-wide `Emm`, and
/// makes sure `emm::init` has run exactly once against the shared arena.
/// Hold the returned guard for the duration of the test.
pub fn setup() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    INIT.call_once(|| {
        sgx_emm::emm::init(arena_base(), ARENA_SIZE, user_base(), user_end()).expect("emm::init");
    });
    guard
}
