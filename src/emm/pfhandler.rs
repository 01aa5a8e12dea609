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

//! The page-fault entry point `register_pfhandler` installs into the
//! enclave's vectored exception handling, registered by the runtime (out
//! of this crate's scope) ahead of every other handler so user-mode page
//! faults inside the EMM's EMAs resolve before falling through to the
//! application's own handlers.

use crate::emm::dispatch::GLOBAL;
use crate::emm::flags::AllocFlags;
use crate::veh::{HandleResult, PfInfo};

/// Resolves a page fault landing inside an EMA this crate manages:
/// - a caller-registered per-EMA handler gets first refusal;
/// - a write fault on a page whose recorded permission forbids writes (or
///   any fault on a page not yet committed when the EMA is
///   `COMMIT_ON_DEMAND`) commits the page and retries;
/// - anything else is not this crate's fault to resolve.
pub fn mm_enclave_pfhandler(info: &PfInfo) -> HandleResult {
    let addr = crate::arch::page_base(info.maddr);
    let mut emm = GLOBAL.lock();

    let ema_ptr = match emm.list.search_any(addr) {
        Some(ema) => ema as *const crate::emm::ema::Ema as *mut crate::emm::ema::Ema,
        None => return HandleResult::Search,
    };
    let ema = unsafe { &mut *ema_ptr };

    if let Some((handler, priv_data)) = ema.handler() {
        if handler(info, priv_data) == HandleResult::Continue {
            return HandleResult::Continue;
        }
    }

    if !ema.alloc_flags().contains(AllocFlags::COMMIT_ON_DEMAND) {
        return HandleResult::Search;
    }

    if ema.do_commit_loop(addr, crate::arch::SE_PAGE_SIZE).is_ok() {
        HandleResult::Continue
    } else {
        HandleResult::Search
    }
}
