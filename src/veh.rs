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

//! Vectored exception handler plumbing. The enclave runtime registers
//! `emm::pfhandler::mm_enclave_pfhandler` with its own VEH dispatch (out of
//! this crate's scope); this module only defines the shape that dispatch
//! hands the EMM on a page fault.

/// Page-fault error code bits, mirroring the x86 `#PF` error code pushed by
/// the processor and relayed by the untrusted runtime through `PfInfo`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PfecBits {
    pub p: u32,
    pub rw: u32,
    pub reserved1: u32,
    pub sgx: u32,
    pub reserved2: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union Pfec {
    pub errcd: u32,
    pub bits: PfecBits,
}

impl core::fmt::Debug for Pfec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        unsafe { write!(f, "Pfec {{ errcd: {:#x} }}", self.errcd) }
    }
}

/// Faulting address and page-fault error code, as delivered to the EMM's
/// registered page-fault handler.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PfInfo {
    pub maddr: usize,
    pub pfec: Pfec,
    pub reserved: u32,
}

/// Outcome a caller-registered per-EMA fault handler returns.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandleResult {
    Search,
    Continue,
}

/// Per-EMA fault handler signature used by `register_pfhandler`.
pub type ExceptionHandler = fn(info: &PfInfo, private: usize) -> HandleResult;

/// Marker type kept for parity with the enclave runtime's `ExceptionInfo`;
/// the EMM only consumes `PfInfo`, the CPU-level fault record.
pub type ExceptionInfo = PfInfo;
