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

//! The Enclave Memory Manager: page-granular virtual memory for SGX2/EDMM
//! enclaves, built from a bit-array commit tracker, a segregated free-list
//! internal heap, an EMA list per address-space window, and the EDMM state
//! machine that drives `EACCEPT`/`EMODPE`/out-calls.

pub(crate) mod alloc;
pub mod bitmap;
pub mod dispatch;
pub(crate) mod ema;
pub mod error;
pub mod flags;
pub(crate) mod heap;
pub(crate) mod list;
pub mod ocall;
pub mod page;
pub mod pfhandler;

pub use dispatch::{
    alloc as alloc_region, commit, commit_data, dealloc, init, modify_permissions, modify_type,
    register_pfhandler, register_static, uncommit,
};
pub use error::{OsError, OsResult};
pub use flags::AllocFlags;
pub use page::{PageInfo, PageType, ProtFlags};
pub use pfhandler::mm_enclave_pfhandler;

/// Test-only introspection surface, gated behind the same `sim` feature
/// that makes the EDMM driver safe to exercise outside a real enclave.
#[cfg(feature = "sim")]
pub use dispatch::{snapshot, user_window};
#[cfg(feature = "sim")]
pub use list::{EmaSnapshot, RangeType};
