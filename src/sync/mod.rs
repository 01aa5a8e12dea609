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

mod remutex;

pub use remutex::{SpinReentrantMutex, SpinReentrantMutexGuard, ThreadId};

use core::sync::atomic::{AtomicUsize, Ordering};

/// Owning-thread id for the global EMM lock. Real enclave code keys this
/// off the current TCS; outside the `hw` backend we fall back to a single
/// fixed id since the `sim` backend models a single-threaded test harness.
pub struct Tcs;

#[cfg(not(feature = "hw"))]
impl ThreadId for Tcs {
    fn current() -> usize {
        1
    }
}

#[cfg(feature = "hw")]
impl ThreadId for Tcs {
    fn current() -> usize {
        CURRENT_TCS.load(Ordering::Relaxed)
    }
}

#[cfg(feature = "hw")]
static CURRENT_TCS: AtomicUsize = AtomicUsize::new(1);

#[cfg(feature = "hw")]
pub fn set_current_tcs(id: usize) {
    CURRENT_TCS.store(id, Ordering::Relaxed);
}
