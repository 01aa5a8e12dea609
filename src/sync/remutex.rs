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

//! A spinlock-based mutex that the same logical thread may re-acquire.
//!
//! The EMM needs this because growing the internal reserve
//! (`heap::add_reserve`) calls back into `dispatch::alloc`/`commit`, which
//! re-acquire the same global lock from the same thread. A plain spinlock
//! would deadlock; this one counts re-entrant acquisitions instead.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Identifies the logical thread of execution for re-entrancy tracking.
/// Backed by the TCS id on real hardware; a test harness may use any
/// stable, non-zero, per-thread value.
pub trait ThreadId {
    fn current() -> usize;
}

const UNOWNED: usize = 0;

pub struct SpinReentrantMutex<T: ?Sized, I> {
    lock: AtomicBool,
    owner: AtomicUsize,
    count: UnsafeCell<u32>,
    data: UnsafeCell<T>,
    _id: core::marker::PhantomData<I>,
}

unsafe impl<T: ?Sized + Send, I> Send for SpinReentrantMutex<T, I> {}
unsafe impl<T: ?Sized + Send, I> Sync for SpinReentrantMutex<T, I> {}

impl<T, I: ThreadId> SpinReentrantMutex<T, I> {
    pub const fn new(data: T) -> Self {
        SpinReentrantMutex {
            lock: AtomicBool::new(false),
            owner: AtomicUsize::new(UNOWNED),
            count: UnsafeCell::new(0),
            data: UnsafeCell::new(data),
            _id: core::marker::PhantomData,
        }
    }

    pub fn lock(&self) -> SpinReentrantMutexGuard<'_, T, I> {
        let me = I::current();
        if self.owner.load(Ordering::Relaxed) != me {
            while self
                .lock
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                core::hint::spin_loop();
            }
            self.owner.store(me, Ordering::Relaxed);
        }
        unsafe {
            *self.count.get() += 1;
        }
        SpinReentrantMutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<SpinReentrantMutexGuard<'_, T, I>> {
        let me = I::current();
        if self.owner.load(Ordering::Relaxed) != me {
            if self
                .lock
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                return None;
            }
            self.owner.store(me, Ordering::Relaxed);
        }
        unsafe {
            *self.count.get() += 1;
        }
        Some(SpinReentrantMutexGuard { mutex: self })
    }

    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }

    /// # Safety
    /// Only for use by a page-fault handler that must recover a mutex left
    /// locked by a thread that took a fault while holding it.
    pub unsafe fn force_unlock(&self) {
        *self.count.get() = 0;
        self.owner.store(UNOWNED, Ordering::Relaxed);
        self.lock.store(false, Ordering::Release);
    }

    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

pub struct SpinReentrantMutexGuard<'a, T: ?Sized + 'a, I: ThreadId> {
    mutex: &'a SpinReentrantMutex<T, I>,
}

impl<'a, T: ?Sized, I: ThreadId> !Send for SpinReentrantMutexGuard<'a, T, I> {}
unsafe impl<'a, T: ?Sized + Sync, I: ThreadId> Sync for SpinReentrantMutexGuard<'a, T, I> {}

impl<'a, T: ?Sized, I: ThreadId> Deref for SpinReentrantMutexGuard<'a, T, I> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized, I: ThreadId> DerefMut for SpinReentrantMutexGuard<'a, T, I> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized, I: ThreadId> Drop for SpinReentrantMutexGuard<'a, T, I> {
    fn drop(&mut self) {
        unsafe {
            let count = &mut *self.mutex.count.get();
            *count -= 1;
            if *count == 0 {
                self.mutex.owner.store(UNOWNED, Ordering::Relaxed);
                self.mutex.lock.store(false, Ordering::Release);
            }
        }
    }
}
