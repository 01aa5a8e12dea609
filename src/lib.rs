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

//! Page-granular virtual memory manager for SGX2/EDMM enclaves.
//!
//! See [`emm`] for the public surface: `init`, `alloc`, `dealloc`,
//! `commit`, `uncommit`, `commit_data`, `modify_permissions`,
//! `modify_type`, `register_pfhandler`, `register_static`.

#![no_std]
#![feature(allocator_api)]
#![feature(negative_impls)]

extern crate alloc;

#[macro_use]
mod macros;

pub mod arch;
pub mod emm;
pub mod enclave;
pub mod inst;
pub mod sync;
pub mod veh;
