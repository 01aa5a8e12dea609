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

//! Enclave address-space bounds.
//!
//! The teacher derives this from the loader's `MmLayout` global, built at
//! enclave-load time from the signed layout table. That table walk is a
//! loader concern out of this crate's scope; instead `emm::init` records
//! the bounds the loader hands it and this module answers containment
//! queries against that record.

use core::sync::atomic::{AtomicUsize, Ordering};

static ENCLAVE_BASE: AtomicUsize = AtomicUsize::new(0);
static ENCLAVE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Records the enclave's address range. Called once, by `emm::init`.
pub fn set_enclave_range(base: usize, size: usize) {
    ENCLAVE_BASE.store(base, Ordering::Relaxed);
    ENCLAVE_SIZE.store(size, Ordering::Relaxed);
}

pub fn enclave_base() -> usize {
    ENCLAVE_BASE.load(Ordering::Relaxed)
}

pub fn enclave_size() -> usize {
    ENCLAVE_SIZE.load(Ordering::Relaxed)
}

/// Whether `[addr, addr+len)` lies entirely within the enclave's address
/// space.
pub fn is_within_enclave(addr: usize, len: usize) -> bool {
    let base = enclave_base();
    let size = enclave_size();
    if size == 0 {
        return false;
    }
    match addr.checked_add(len) {
        Some(end) => addr >= base && end <= base + size && end >= addr,
        None => false,
    }
}
