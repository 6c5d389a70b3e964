// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::BTreeSet;
use std::sync::Mutex;

use codec::PacketId;
use tokio::sync::Notify;

use crate::error::{Error, ErrorKind};

/// Assigns/frees 16-bit packet identifiers. `0` is reserved by the protocol and never
/// handed out. `acquire()` suspends the caller until an id is free rather than failing
/// outright; `IdExhausted` is only returned when every one of the 65535 usable ids is
/// outstanding at once, which callers are expected to back-pressure against.
#[derive(Debug, Default)]
pub struct MsgIdAllocator {
    used: Mutex<BTreeSet<u16>>,
    notify: Notify,
}

impl MsgIdAllocator {
    #[must_use]
    pub fn new() -> Self {
        MsgIdAllocator {
            used: Mutex::new(BTreeSet::new()),
            notify: Notify::new(),
        }
    }

    fn try_acquire(&self) -> Option<PacketId> {
        let mut used = self.used.lock().unwrap();
        if used.len() >= u16::MAX as usize {
            return None;
        }
        let mut candidate: u16 = 1;
        for &id in used.iter() {
            if id != candidate {
                break;
            }
            candidate = candidate.checked_add(1)?;
        }
        used.insert(candidate);
        Some(PacketId::new(candidate))
    }

    /// Returns the smallest unused id, suspending until one is freed if the allocator is
    /// currently saturated.
    pub async fn acquire(&self) -> Result<PacketId, Error> {
        loop {
            if let Some(id) = self.try_acquire() {
                return Ok(id);
            }
            self.notify.notified().await;
        }
    }

    /// Marks `id` free and wakes any waiter. No-op if `id` was not allocated.
    pub fn release(&self, id: PacketId) {
        self.used.lock().unwrap().remove(&id.value());
        self.notify.notify_one();
    }

    /// Marks a set of ids as used at startup, when resuming a persisted session.
    pub fn rehydrate(&self, ids: &[u16]) -> Result<(), Error> {
        let mut used = self.used.lock().unwrap();
        for &id in ids {
            if id == 0 {
                return Err(Error::new(ErrorKind::ProtocolAnomaly, "rehydrate id 0"));
            }
            used.insert(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_returns_smallest_unused() {
        let allocator = MsgIdAllocator::new();
        let a = allocator.acquire().await.unwrap();
        let b = allocator.acquire().await.unwrap();
        assert_eq!(a.value(), 1);
        assert_eq!(b.value(), 2);
        allocator.release(a);
        let c = allocator.acquire().await.unwrap();
        assert_eq!(c.value(), 1);
    }

    #[tokio::test]
    async fn rehydrate_marks_ids_used() {
        let allocator = MsgIdAllocator::new();
        allocator.rehydrate(&[1, 2]).unwrap();
        let id = allocator.acquire().await.unwrap();
        assert_eq!(id.value(), 3);
    }

    #[tokio::test]
    async fn acquire_suspends_until_release() {
        use std::sync::Arc;

        let allocator = Arc::new(MsgIdAllocator::new());
        let id = allocator.acquire().await.unwrap();
        allocator.rehydrate(&[2]).unwrap();
        // saturate everything except `id`
        let mut ids = Vec::new();
        for v in 3..=u16::MAX {
            ids.push(v);
        }
        allocator.rehydrate(&ids).unwrap();

        let waiter = Arc::clone(&allocator);
        let handle = tokio::spawn(async move { waiter.acquire().await });
        tokio::task::yield_now().await;
        allocator.release(id);
        let acquired = handle.await.unwrap().unwrap();
        assert_eq!(acquired.value(), 1);
    }
}
