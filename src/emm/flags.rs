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

//! Allocation-time flags, supplied by the caller of `sgx_mm_alloc` and
//! carried on the owning `Ema` for the lifetime of the region.

use bitflags::bitflags;

bitflags! {
    pub struct AllocFlags: u32 {
        /// Reserve address space only; no backing EPC until `commit`.
        const RESERVE           = 0x0001;
        /// Back every page with EPC immediately at `alloc` time.
        const COMMIT_NOW        = 0x0002;
        /// Back pages lazily, on first access, via the page-fault handler.
        const COMMIT_ON_DEMAND  = 0x0004;
        /// Region grows toward lower addresses (stack-like).
        const GROWSDOWN         = 0x0008;
        /// Region grows toward higher addresses (heap-like). Default when
        /// neither `GROWSDOWN` nor this bit is set.
        const GROWSUP           = 0x0010;
        /// Caller pins the exact start address; fail rather than relocate.
        const FIXED             = 0x0020;
        /// Reserved for EMM-internal regions (meta-reserve, reserve arena).
        const SYSTEM            = 0x0040;
    }
}

impl AllocFlags {
    pub fn grows_down(self) -> bool {
        self.contains(AllocFlags::GROWSDOWN)
    }

    pub fn commit_on_demand(self) -> bool {
        self.contains(AllocFlags::COMMIT_ON_DEMAND)
    }

    pub fn commit_now(self) -> bool {
        self.contains(AllocFlags::COMMIT_NOW)
    }

    pub fn is_reserve(self) -> bool {
        self.contains(AllocFlags::RESERVE)
    }

    pub fn is_system(self) -> bool {
        self.contains(AllocFlags::SYSTEM)
    }
}
