// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::any::Any;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Locks the status, without notifying anyone.
    ///
    /// A poisoned status is recovered: the protected values are only ever
    /// replaced as a whole, so a panicking holder can't leave them torn.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Updates the status with the given function and notifies all waiting
    /// threads.
    pub fn update_all<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut *self.lock());
        self.condvar.notify_all();
        result
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify the
    /// status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.lock(), predicate)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Extracts a human-readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn status_wakes_up_waiter() {
        let status = Arc::new(Status::new(0usize));
        let barrier = Arc::new(Barrier::new(2));

        let waiter = std::thread::spawn({
            let status = status.clone();
            let barrier = barrier.clone();
            move || {
                barrier.wait();
                let value = *status.wait_while(|x| *x < 3);
                value
            }
        });

        barrier.wait();
        for _ in 0..3 {
            status.update_all(|x| *x += 1);
        }
        assert_eq!(waiter.join().unwrap(), 3);
    }

    #[test]
    fn status_survives_poisoning() {
        let status = Arc::new(Status::new(1));
        let result = std::thread::spawn({
            let status = status.clone();
            move || {
                let _guard = status.lock();
                panic!("poisoning the status");
            }
        })
        .join();
        assert!(result.is_err());

        assert_eq!(status.update_all(|x| std::mem::replace(x, 2)), 1);
        assert_eq!(*status.lock(), 2);
    }

    #[test]
    fn panic_message_payloads() {
        let payload = std::panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_message(&*payload), "static message");

        let payload = std::panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(&*payload), "formatted 42");

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(7u8)).unwrap_err();
        assert_eq!(panic_message(&*payload), "<non-string panic payload>");
    }
}
