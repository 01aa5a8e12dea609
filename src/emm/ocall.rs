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

//! Out-calls to the untrusted runtime that must change the OS-level
//! mapping backing a region: adding EPC pages, and retyping or reprotecting
//! them at the OS page-table level. `EACCEPT`/`EMODPE` only change the
//! trusted side; these calls drive the untrusted side first.

use crate::emm::error::OsResult;
use crate::emm::page::{PageInfo, PageType};

cfg_if::cfg_if! {
    if #[cfg(feature = "sim")] {
        pub use sim::{alloc_ocall, modify_ocall};
    } else {
        pub use hw::{alloc_ocall, modify_ocall};
    }
}

#[cfg(not(feature = "sim"))]
mod hw {
    use super::*;

    extern "C" {
        fn ocall_mm_alloc(ret: *mut i32, addr: usize, size: usize, typ: i32, prot: i32) -> u32;
        fn ocall_mm_modify(
            ret: *mut i32,
            addr: usize,
            size: usize,
            info_from: u64,
            info_to: u64,
        ) -> u32;
    }

    /// Asks the untrusted runtime to back `[addr, addr+size)` with EPC of
    /// the given type and protection, before the trusted side `EACCEPT`s
    /// it.
    pub fn alloc_ocall(addr: usize, size: usize, typ: PageType, prot: i32) -> OsResult {
        let mut ret: i32 = 0;
        let sgx_ret = unsafe { ocall_mm_alloc(&mut ret, addr, size, typ as i32, prot) };
        if sgx_ret != 0 || ret != 0 {
            return Err(libc::EFAULT);
        }
        Ok(())
    }

    /// Asks the untrusted runtime to retype and/or reprotect
    /// `[addr, addr+size)` at the OS page-table level, e.g. `REG|RW ->
    /// TRIM|RW` during uncommit, `TRIM -> TRIM` to finalize a trim, or
    /// `REG|RW -> REG|new_prot` during a permission change. Carries both
    /// type and permission bits, since the host side must agree on both.
    pub fn modify_ocall(addr: usize, size: usize, info_from: PageInfo, info_to: PageInfo) -> OsResult {
        let mut ret: i32 = 0;
        let sgx_ret =
            unsafe { ocall_mm_modify(&mut ret, addr, size, info_from.into(), info_to.into()) };
        if sgx_ret != 0 || ret != 0 {
            return Err(libc::EFAULT);
        }
        Ok(())
    }
}

#[cfg(feature = "sim")]
pub mod sim {
    use super::*;
    use alloc::vec::Vec;
    use spin::Mutex;

    #[derive(Clone, Copy, Debug)]
    pub enum OcallRecord {
        Alloc { addr: usize, size: usize, typ: PageType },
        Modify { addr: usize, size: usize, from: PageInfo, to: PageInfo },
    }

    pub static OCALL_LOG: Mutex<Vec<OcallRecord>> = Mutex::new(Vec::new());

    pub fn alloc_ocall(addr: usize, size: usize, typ: PageType, _prot: i32) -> OsResult {
        OCALL_LOG.lock().push(OcallRecord::Alloc { addr, size, typ });
        Ok(())
    }

    pub fn modify_ocall(addr: usize, size: usize, info_from: PageInfo, info_to: PageInfo) -> OsResult {
        OCALL_LOG.lock().push(OcallRecord::Modify {
            addr,
            size,
            from: info_from,
            to: info_to,
        });
        Ok(())
    }
}
