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

//! Zero-sized `Allocator` handles selecting which backing store an `Ema`
//! or `BitArray` draws from: the growable reserve arena (the common case)
//! or the small static meta-reserve used to bootstrap the reserve itself
//! and to serve `emalloc` while `add_reserve` is re-entering the EMM.

use crate::emm::heap;
use core::alloc::{AllocError, Allocator, Layout};
use core::ptr::NonNull;

#[derive(Clone, Copy, Debug, Default)]
pub struct ResAlloc;

unsafe impl Allocator for ResAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        heap::reserve_alloc(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        heap::reserve_dealloc(ptr, layout)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StaticAlloc;

unsafe impl Allocator for StaticAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        heap::static_alloc(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        heap::static_dealloc(ptr, layout)
    }
}
