// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Growable circular byte buffer sitting between a socket and the framer.
//!
//! The buffer keeps a read cursor `r`, a write cursor `w` and an `is_empty`
//! flag. `r == w` means either empty or full, the flag tells which one.
//! At every point `buffered() + available() == capacity()`.

use std::io::{self, Read};
use std::os::unix::io::RawFd;

/// Capacity handed out when a zero sized buffer first grows.
const MIN_CAPACITY: usize = 1024;
/// Below this size the buffer doubles, above it grows in 25% steps.
const GROWTH_THRESHOLD: usize = 4096;
/// Free space guaranteed before every pull in [`RingBuffer::read_from`].
const READ_FROM_CHUNK: usize = 512;

#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    r: usize,
    w: usize,
    is_empty: bool,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl RingBuffer {
    pub fn with_capacity(size: usize) -> Self {
        RingBuffer {
            buf: vec![0; size],
            r: 0,
            w: 0,
            is_empty: true,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes written and not yet read.
    pub fn buffered(&self) -> usize {
        if self.is_empty {
            return 0;
        }
        if self.w > self.r {
            self.w - self.r
        } else {
            self.capacity() - self.r + self.w
        }
    }

    /// Free bytes before the buffer has to grow.
    pub fn available(&self) -> usize {
        self.capacity() - self.buffered()
    }

    pub fn is_empty(&self) -> bool {
        self.is_empty
    }

    pub fn is_full(&self) -> bool {
        !self.is_empty && self.r == self.w
    }

    pub fn reset(&mut self) {
        self.is_empty = true;
        self.r = 0;
        self.w = 0;
    }

    /// Returns the first `n` buffered bytes without consuming them.
    ///
    /// The window comes back as `(head, tail)`; `tail` is non-empty only
    /// when the window wraps past the physical end of the array. `n == 0`
    /// or `n` larger than the buffered length peeks everything.
    pub fn peek(&self, n: usize) -> (&[u8], &[u8]) {
        let len = self.buffered();
        if len == 0 {
            return (&[], &[]);
        }
        let n = if n == 0 || n > len { len } else { n };
        let first = n.min(self.capacity() - self.r);
        (&self.buf[self.r..self.r + first], &self.buf[..n - first])
    }

    /// Skips up to `n` buffered bytes and returns how many were skipped.
    pub fn discard(&mut self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let len = self.buffered();
        if n < len {
            self.r = (self.r + n) % self.capacity();
            return n;
        }
        self.reset();
        len
    }

    /// Copies buffered bytes into `p` and consumes them.
    pub fn read(&mut self, p: &mut [u8]) -> usize {
        if p.is_empty() || self.is_empty {
            return 0;
        }
        let (head, tail) = self.peek(p.len());
        let (h, t) = (head.len(), tail.len());
        p[..h].copy_from_slice(head);
        p[h..h + t].copy_from_slice(tail);

        let n = h + t;
        self.r = (self.r + n) % self.capacity();
        if self.r == self.w {
            self.reset();
        }
        n
    }

    /// Appends `p`, growing first when it does not fit.
    pub fn write(&mut self, p: &[u8]) -> usize {
        let n = p.len();
        if n == 0 {
            return 0;
        }
        let free = self.available();
        if n > free {
            self.grow(self.capacity() + n - free);
        }

        let cap = self.capacity();
        let first = n.min(cap - self.w);
        self.buf[self.w..self.w + first].copy_from_slice(&p[..first]);
        self.buf[..n - first].copy_from_slice(&p[first..]);
        self.w = (self.w + n) % cap;
        self.is_empty = false;
        n
    }

    /// Reads once from `fd` straight into the free region.
    ///
    /// A wrapped free region is filled with a single two-segment `readv`.
    /// Returns `Ok(0)` when the peer has closed its side.
    pub fn copy_from_socket(&mut self, fd: RawFd) -> io::Result<usize> {
        if self.available() == 0 {
            self.grow(self.capacity() + self.capacity() / 2);
        }
        if self.is_empty {
            self.r = 0;
            self.w = 0;
        }

        let cap = self.capacity();
        let n = if self.w < self.r || self.r == 0 {
            let end = if self.w < self.r { self.r } else { cap };
            let region = &mut self.buf[self.w..end];
            // SAFETY: `region` is an initialized, exclusively borrowed slice
            // and the length passed to read(2) is its exact length.
            unsafe { libc::read(fd, region.as_mut_ptr().cast(), region.len()) }
        } else {
            let (front, back) = self.buf.split_at_mut(self.w);
            let iov = [
                libc::iovec {
                    iov_base: back.as_mut_ptr().cast(),
                    iov_len: back.len(),
                },
                libc::iovec {
                    iov_base: front.as_mut_ptr().cast(),
                    iov_len: self.r,
                },
            ];
            // SAFETY: both iovecs point into disjoint parts of `self.buf`,
            // which stays mutably borrowed for the whole call.
            unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int) }
        };

        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n > 0 {
            self.w = (self.w + n) % cap;
            self.is_empty = false;
        }
        Ok(n)
    }

    /// Pulls from `reader` until it reports end of input.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<u64> {
        let mut total = 0u64;
        loop {
            let free = self.available();
            if free < READ_FROM_CHUNK {
                self.grow(self.capacity() + READ_FROM_CHUNK - free);
            }
            if self.is_empty {
                self.r = 0;
                self.w = 0;
            }

            let end = if self.w < self.r {
                self.r
            } else {
                self.capacity()
            };
            let m = match reader.read(&mut self.buf[self.w..end]) {
                Ok(0) => return Ok(total),
                Ok(m) => m,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.w = (self.w + m) % self.capacity();
            self.is_empty = false;
            total += m as u64;
        }
    }

    /// Reallocates to at least `requested` bytes, keeping the unread bytes
    /// in order at the front of the new array.
    fn grow(&mut self, requested: usize) {
        let new_cap = grown_capacity(self.capacity(), requested);
        let mut new_buf = vec![0; new_cap];

        let old_len = {
            let (head, tail) = self.peek(0);
            new_buf[..head.len()].copy_from_slice(head);
            new_buf[head.len()..head.len() + tail.len()].copy_from_slice(tail);
            head.len() + tail.len()
        };

        self.buf = new_buf;
        self.r = 0;
        self.w = old_len % new_cap;
        self.is_empty = old_len == 0;
    }
}

fn grown_capacity(current: usize, requested: usize) -> usize {
    if current == 0 {
        return if requested <= MIN_CAPACITY {
            MIN_CAPACITY
        } else {
            requested.next_power_of_two()
        };
    }

    let double = current * 2;
    if requested > double {
        return requested;
    }
    if current < GROWTH_THRESHOLD {
        return double;
    }
    let mut n = current;
    while n < requested {
        n += n / 4;
    }
    n.max(requested)
}
