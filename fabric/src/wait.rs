// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The narrow wait-station primitive the bulk engine and the small-message channel need
//! to hand a reply back to a blocked caller: register a tag, block on it, fulfil it from
//! the completion engine. This is not the higher-level page-coherence rendezvous station
//! (out of scope for this subsystem) — just the local "sender parks until a tagged
//! completion or reply arrives" primitive.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::Error;

enum Outcome<T> {
    Pending,
    Ready(T),
    Failed(Error),
}

struct Slot<T> {
    mutex: Mutex<Outcome<T>>,
    condvar: Condvar,
}

/// A table of outstanding tagged waiters, keyed by caller-chosen `u32` tags (rendezvous
/// tags, region slots, or any other opaque correlation id the caller already has on
/// hand).
pub struct WaitStation<T> {
    slots: Mutex<HashMap<u32, Arc<Slot<T>>>>,
}

impl<T> Default for WaitStation<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WaitStation<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Register `tag` before the corresponding request is posted to the fabric, to close
    /// the race between posting and the reply arriving before the waiter is listening.
    pub fn register(&self, tag: u32) {
        let slot = Arc::new(Slot {
            mutex: Mutex::new(Outcome::Pending),
            condvar: Condvar::new(),
        });
        let previous = self.slots.lock().unwrap().insert(tag, slot);
        debug_assert!(previous.is_none(), "wait station tag reused while still pending");
    }

    /// Block until `tag` is fulfilled or failed, then remove it from the table.
    pub fn wait(&self, tag: u32) -> Result<T, Error> {
        let slot = self
            .slots
            .lock()
            .unwrap()
            .get(&tag)
            .cloned()
            .expect("wait() called on a tag that was never registered");

        let mut outcome = slot.mutex.lock().unwrap();
        while matches!(*outcome, Outcome::Pending) {
            outcome = slot.condvar.wait(outcome).unwrap();
        }

        self.slots.lock().unwrap().remove(&tag);

        match std::mem::replace(&mut *outcome, Outcome::Pending) {
            Outcome::Ready(value) => Ok(value),
            Outcome::Failed(err) => Err(err),
            Outcome::Pending => unreachable!(),
        }
    }

    /// Wake the waiter on `tag` with a successful value. No-op if the tag isn't
    /// registered (the waiter gave up, or the tag never existed) — a late or duplicate
    /// completion must never panic the completion engine.
    pub fn fulfil(&self, tag: u32, value: T) {
        let slot = self.slots.lock().unwrap().get(&tag).cloned();
        if let Some(slot) = slot {
            *slot.mutex.lock().unwrap() = Outcome::Ready(value);
            slot.condvar.notify_all();
        }
    }

    /// Wake the waiter on `tag` with a failure (used when the owning peer's connection
    /// transitions to `Error`).
    pub fn fail(&self, tag: u32, err: Error) {
        let slot = self.slots.lock().unwrap().get(&tag).cloned();
        if let Some(slot) = slot {
            *slot.mutex.lock().unwrap() = Outcome::Failed(err);
            slot.condvar.notify_all();
        }
    }

    /// Fail every currently registered tag. Used when a peer's connection enters `Error`
    /// with operations outstanding.
    pub fn fail_all(&self, mut err: impl FnMut() -> Error) {
        let tags: Vec<u32> = self.slots.lock().unwrap().keys().copied().collect();
        for tag in tags {
            self.fail(tag, err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fulfil_wakes_the_waiter() {
        let station: StdArc<WaitStation<u32>> = StdArc::new(WaitStation::new());
        station.register(1);

        let waiter_station = station.clone();
        let handle = thread::spawn(move || waiter_station.wait(1).unwrap());

        thread::sleep(Duration::from_millis(20));
        station.fulfil(1, 42);

        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn fail_all_wakes_every_outstanding_waiter() {
        let station: StdArc<WaitStation<u32>> = StdArc::new(WaitStation::new());
        station.register(1);
        station.register(2);

        let s1 = station.clone();
        let h1 = thread::spawn(move || s1.wait(1));
        let s2 = station.clone();
        let h2 = thread::spawn(move || s2.wait(2));

        thread::sleep(Duration::from_millis(20));
        station.fail_all(|| Error::PeerUnreachable(1));

        assert!(h1.join().unwrap().is_err());
        assert!(h2.join().unwrap().is_err());
    }
}
