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

//! `BitArray`: a packed per-page commit bitmap, one bit per page of an
//! EMA's eaccept state. Allocator-generic so an EMA's bitmap can live in
//! the reserve arena or, for the handful of EMAs bootstrapped before the
//! reserve exists, in the static meta-reserve.

use core::alloc::{Allocator, Layout};
use core::ptr::NonNull;

pub struct BitArray<A: Allocator> {
    bits: usize,
    bytes: usize,
    data: NonNull<u8>,
    alloc: A,
}

unsafe impl<A: Allocator + Send> Send for BitArray<A> {}
unsafe impl<A: Allocator + Sync> Sync for BitArray<A> {}

fn byte_layout(bytes: usize) -> Layout {
    Layout::array::<u8>(bytes.max(1)).expect("bitarray layout overflow")
}

impl<A: Allocator> BitArray<A> {
    fn with_fill(bits: usize, alloc: A, fill: u8) -> Self {
        let bytes = (bits + 7) / 8;
        let layout = byte_layout(bytes);
        let ptr = alloc
            .allocate(layout)
            .expect("bitarray allocation failed")
            .cast::<u8>();
        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), fill, bytes);
        }
        let mut arr = BitArray {
            bits,
            bytes,
            data: ptr,
            alloc,
        };
        if fill != 0 {
            arr.mask_tail();
        }
        arr
    }

    /// All bits initially clear.
    pub fn new(bits: usize, alloc: A) -> Self {
        Self::with_fill(bits, alloc, 0x00)
    }

    /// All bits initially set.
    pub fn new_set(bits: usize, alloc: A) -> Self {
        Self::with_fill(bits, alloc, 0xFF)
    }

    /// All bits initially clear; named for parity with `new_set`.
    pub fn new_reset(bits: usize, alloc: A) -> Self {
        Self::with_fill(bits, alloc, 0x00)
    }

    /// Clears any bits past `self.bits` in the final byte, so whole-byte
    /// fast paths (`all_true`, `set_all`) never see stray set bits.
    fn mask_tail(&mut self) {
        let rem = self.bits % 8;
        if rem != 0 {
            let mask = (1u8 << rem) - 1;
            unsafe {
                let last = self.data.as_ptr().add(self.bytes - 1);
                *last &= mask;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    fn byte_at(&self, idx: usize) -> u8 {
        unsafe { *self.data.as_ptr().add(idx) }
    }

    pub fn get(&self, idx: usize) -> bool {
        debug_assert!(idx < self.bits);
        (self.byte_at(idx / 8) >> (idx % 8)) & 1 != 0
    }

    pub fn set(&mut self, idx: usize, val: bool) {
        debug_assert!(idx < self.bits);
        unsafe {
            let byte = self.data.as_ptr().add(idx / 8);
            let mask = 1u8 << (idx % 8);
            if val {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        }
    }

    /// Whether the whole array is set, byte-at-a-time once the scan
    /// reaches a byte boundary.
    pub fn all_true(&self) -> bool {
        if self.bits == 0 {
            return true;
        }
        for i in 0..self.bytes {
            let expect = if i == self.bytes - 1 {
                let rem = self.bits % 8;
                if rem == 0 {
                    0xFFu8
                } else {
                    (1u8 << rem) - 1
                }
            } else {
                0xFF
            };
            if self.byte_at(i) != expect {
                return false;
            }
        }
        true
    }

    /// True if every bit in `[start, start+len)` is set.
    pub fn test_range(&self, start: usize, len: usize) -> bool {
        self.scan_range(start, len, true)
    }

    /// True if any bit in `[start, start+len)` is set.
    pub fn test_range_any(&self, start: usize, len: usize) -> bool {
        !self.scan_range(start, len, false)
    }

    /// `all` selects which early-exit condition ends the scan: for
    /// `test_range` we bail as soon as a clear bit appears (and the
    /// caller wants "all set" == no early exit); for `test_range_any` we
    /// bail as soon as a set bit appears.
    fn scan_range(&self, start: usize, len: usize, want_all_set: bool) -> bool {
        debug_assert!(start + len <= self.bits);
        for i in start..start + len {
            let bit = self.get(i);
            if want_all_set && !bit {
                return false;
            }
            if !want_all_set && bit {
                return false;
            }
        }
        true
    }

    pub fn set_range(&mut self, start: usize, len: usize) {
        self.write_range(start, len, true);
    }

    pub fn reset_range(&mut self, start: usize, len: usize) {
        self.write_range(start, len, false);
    }

    pub fn set_all(&mut self) {
        self.write_range(0, self.bits, true);
    }

    pub fn reset_all(&mut self) {
        self.write_range(0, self.bits, false);
    }

    /// Byte-aligned fast path in the middle of the range, bit-at-a-time on
    /// the unaligned head and tail.
    fn write_range(&mut self, start: usize, len: usize, val: bool) {
        debug_assert!(start + len <= self.bits);
        if len == 0 {
            return;
        }
        let end = start + len;
        let aligned_start = round_up8(start);
        let aligned_end = trim_down8(end);

        let head_end = aligned_start.min(end);
        for i in start..head_end {
            self.set(i, val);
        }
        if aligned_start < aligned_end {
            let fill = if val { 0xFFu8 } else { 0x00u8 };
            unsafe {
                let ptr = self.data.as_ptr().add(aligned_start / 8);
                core::ptr::write_bytes(ptr, fill, (aligned_end - aligned_start) / 8);
            }
        }
        let tail_start = aligned_end.max(start);
        for i in tail_start..end {
            self.set(i, val);
        }
    }

    /// Splits off `[pos, bits)` into a freshly allocated `BitArray`,
    /// shrinking `self` to `[0, pos)`. Used when an EMA splits in two.
    pub fn split(&mut self, pos: usize) -> BitArray<A>
    where
        A: Clone,
    {
        debug_assert!(pos <= self.bits);
        let tail_bits = self.bits - pos;
        let mut tail = BitArray::new(tail_bits, self.alloc.clone());
        for i in 0..tail_bits {
            tail.set(i, self.get(pos + i));
        }

        let new_bytes = (pos + 7) / 8;
        if new_bytes < self.bytes {
            unsafe {
                if let Ok(shrunk) = self.alloc.shrink(
                    self.data,
                    byte_layout(self.bytes),
                    byte_layout(new_bytes.max(1)),
                ) {
                    self.data = shrunk.cast();
                }
            }
            self.bytes = new_bytes.max(if pos == 0 { 0 } else { new_bytes });
        }
        self.bits = pos;
        self.mask_tail();
        tail
    }

    /// Rebinds a buffer this `BitArray` already owns to a new bit count,
    /// without allocating, after external code has shifted bytes in place
    /// (the counterpart to `split`'s shift-copy on the other half).
    ///
    /// # Safety
    /// `bits` must fit within the array's existing byte capacity.
    pub unsafe fn reattach(&mut self, bits: usize) {
        debug_assert!((bits + 7) / 8 <= self.bytes);
        self.bits = bits;
        self.mask_tail();
    }

    /// Explicit, named consuming drop: frees an EMA's bitmap as a step
    /// distinct from unlinking it.
    pub fn delete(self) {}
}

fn round_up8(n: usize) -> usize {
    (n + 7) & !7
}

fn trim_down8(n: usize) -> usize {
    n & !7
}

impl<A: Allocator> Drop for BitArray<A> {
    fn drop(&mut self) {
        unsafe {
            self.alloc.deallocate(self.data, byte_layout(self.bytes));
        }
    }
}
