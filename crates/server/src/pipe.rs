// Copyright 2025-2026 CEMAXECUTER LLC

//! Bounded byte ring between the data pump and the network pump.
//!
//! The pipe absorbs the mismatch between the device's steady sample rate
//! and TCP's bursty write rate. The API is item-oriented: transfers are
//! whole elements, readers never observe a partial item. The producer side
//! runs non-blocking so a stalled network can never stall the device; the
//! consumer side blocks until data or shutdown.

use std::sync::{Condvar, Mutex};

struct Inner {
    buf: Box<[u8]>,
    /// Read position in bytes.
    tail: usize,
    /// Bytes resident.
    len: usize,
    closed: bool,
}

pub struct JitterPipe {
    inner: Mutex<Inner>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

impl JitterPipe {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "pipe capacity must be non-zero");
        JitterPipe {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity].into_boxed_slice(),
                tail: 0,
                len: 0,
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every blocked caller; subsequent writes are refused and reads
    /// drain whatever remains, then return 0.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Write up to `max_items` items of `item_size` bytes from `src`.
    /// Blocking mode waits until at least one item fits; non-blocking
    /// returns 0 immediately when there is no room. Returns items written.
    pub fn write(&self, src: &[u8], item_size: usize, max_items: usize, blocking: bool) -> usize {
        debug_assert!(item_size > 0 && item_size <= self.capacity);
        debug_assert!(src.len() >= item_size * max_items);
        let mut inner = self.inner.lock().unwrap();
        if blocking {
            while !inner.closed && self.capacity - inner.len < item_size {
                inner = self.not_full.wait(inner).unwrap();
            }
        }
        if inner.closed {
            return 0;
        }
        let free = self.capacity - inner.len;
        let n = (free / item_size).min(max_items);
        if n == 0 {
            return 0;
        }
        let bytes = n * item_size;
        let head = (inner.tail + inner.len) % self.capacity;
        let first = bytes.min(self.capacity - head);
        inner.buf[head..head + first].copy_from_slice(&src[..first]);
        if bytes > first {
            inner.buf[..bytes - first].copy_from_slice(&src[first..bytes]);
        }
        inner.len += bytes;
        drop(inner);
        self.not_empty.notify_one();
        n
    }

    /// Read up to `max_items` items of `item_size` bytes into `dst`.
    /// Blocking mode waits until at least one item is available or the
    /// pipe is closed; non-blocking returns 0 immediately when the pipe
    /// holds less than one item. Returns items read.
    pub fn read(&self, dst: &mut [u8], item_size: usize, max_items: usize, blocking: bool) -> usize {
        debug_assert!(item_size > 0);
        debug_assert!(dst.len() >= item_size * max_items);
        let mut inner = self.inner.lock().unwrap();
        if blocking {
            while !inner.closed && inner.len < item_size {
                inner = self.not_empty.wait(inner).unwrap();
            }
        }
        let n = (inner.len / item_size).min(max_items);
        if n == 0 {
            return 0;
        }
        let bytes = n * item_size;
        let tail = inner.tail;
        let first = bytes.min(self.capacity - tail);
        dst[..first].copy_from_slice(&inner.buf[tail..tail + first]);
        if bytes > first {
            dst[first..bytes].copy_from_slice(&inner.buf[..bytes - first]);
        }
        inner.tail = (tail + bytes) % self.capacity;
        inner.len -= bytes;
        drop(inner);
        self.not_full.notify_one();
        n
    }
}
