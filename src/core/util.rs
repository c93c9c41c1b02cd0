// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::ptr::NonNull;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// A [`Mutex`]-protected value paired with a [`Condvar`] to wait for changes.
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

    /// Attempts to set the status to the given value and wakes up one waiting
    /// thread.
    ///
    /// Fails if the [`Mutex`] is poisoned.
    pub fn try_notify_one(&self, t: T) -> Result<(), PoisonError<MutexGuard<'_, T>>> {
        *self.mutex.lock()? = t;
        self.condvar.notify_one();
        Ok(())
    }

    /// Sets the status to the given value and wakes up all waiting threads.
    pub fn notify_all(&self, t: T) {
        self.update_all(|status| *status = t);
    }

    /// Modifies the status in place and wakes up all waiting threads.
    ///
    /// This doesn't panic if the [`Mutex`] was poisoned, so that it can be
    /// called from a destructor during unwinding.
    pub fn update_all(&self, f: impl FnOnce(&mut T)) {
        f(&mut *self.mutex.lock().unwrap_or_else(PoisonError::into_inner));
        self.condvar.notify_all();
    }

    /// Blocks until the predicate becomes false on this status.
    ///
    /// The returned [`MutexGuard`] allows to further inspect or modify the
    /// status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }
}

/// A type family indexed by a lifetime.
///
/// Rust has no higher-kinded types, so a generic associated type stands in
/// for "`T<'a>` for any `'a`".
pub trait LifetimeParameterized {
    type T<'a>: ?Sized;
}

/// A reference to a `T<'a>` whose lifetime has been erased, so that it can be
/// stored in a structure shared with long-lived threads.
///
/// Setting a reference is safe, reading it back via [`get()`](Self::get) is
/// `unsafe`: the caller must guarantee that the referent is still alive and
/// not mutated.
pub struct ErasedRef<T: LifetimeParameterized> {
    ptr: Option<NonNull<T::T<'static>>>,
}

impl<T: LifetimeParameterized> ErasedRef<T> {
    /// Creates an empty reference.
    pub fn empty() -> Self {
        Self { ptr: None }
    }

    /// Stores the given reference.
    // The cast extends the lifetime to 'static.
    #[allow(clippy::unnecessary_cast)]
    pub fn set(&mut self, value: &T::T<'_>) {
        self.ptr = NonNull::new(NonNull::from(value).as_ptr() as *mut T::T<'static>);
    }

    /// Forgets the stored reference.
    pub fn clear(&mut self) {
        self.ptr = None;
    }

    /// Returns `true` if a reference is currently stored.
    pub fn is_set(&self) -> bool {
        self.ptr.is_some()
    }

    /// Returns the stored reference, or [`None`] if the reference is empty.
    ///
    /// # Safety
    ///
    /// The value passed to [`set()`](Self::set) must be alive and not
    /// mutated for the whole output lifetime `'a`.
    // The cast shortens the lifetime to 'a.
    #[allow(clippy::unnecessary_cast)]
    pub unsafe fn get<'a>(&self) -> Option<&'a T::T<'a>> {
        self.ptr.map(|static_ptr| {
            let ptr = static_ptr.as_ptr() as *mut T::T<'a>;
            // SAFETY:
            // - The pointer was obtained from a valid reference in `set()`.
            // - The caller guarantees that the referent outlives 'a and isn't mutated
            //   during 'a.
            unsafe { &*ptr }
        })
    }
}

/// SAFETY:
///
/// An [`ErasedRef`] behaves like a `&'a T<'a>`, which is [`Send`] if and only
/// if `T<'a>` is [`Sync`].
unsafe impl<T: LifetimeParameterized> Send for ErasedRef<T> where for<'a> T::T<'a>: Sync {}
/// SAFETY:
///
/// An [`ErasedRef`] behaves like a `&'a T<'a>`, which is [`Sync`] if and only
/// if `T<'a>` is [`Sync`].
unsafe impl<T: LifetimeParameterized> Sync for ErasedRef<T> where for<'a> T::T<'a>: Sync {}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, RwLock};

    struct DynCounter;

    impl LifetimeParameterized for DynCounter {
        type T<'a> = dyn Fn(usize) -> usize + Sync + 'a;
    }

    #[test]
    fn test_erased_ref_set_get_clear() {
        let mut erased = ErasedRef::<DynCounter>::empty();
        assert!(!erased.is_set());

        let offset = 10;
        let add = |x: usize| x + offset;
        erased.set(&add);
        assert!(erased.is_set());
        let f = unsafe { erased.get().unwrap() };
        assert_eq!(f(5), 15);

        erased.clear();
        assert!(!erased.is_set());
        assert!(unsafe { erased.get() }.is_none());
    }

    #[test]
    fn test_erased_ref_shared_with_threads() {
        const NUM_THREADS: usize = 4;

        let erased = Arc::new(RwLock::new(ErasedRef::<DynCounter>::empty()));
        let calls = AtomicUsize::new(0);
        let started = Arc::new(Barrier::new(NUM_THREADS + 1));
        let finished = Arc::new(Barrier::new(NUM_THREADS + 1));

        let count = |x: usize| {
            calls.fetch_add(1, Ordering::SeqCst);
            x * 2
        };
        erased.write().unwrap().set(&count);

        std::thread::scope(|scope| {
            for id in 0..NUM_THREADS {
                let erased = erased.clone();
                let started = started.clone();
                let finished = finished.clone();
                scope.spawn(move || {
                    started.wait();
                    let guard = erased.read().unwrap();
                    let f = unsafe { guard.get().unwrap() };
                    assert_eq!(f(id), 2 * id);
                    drop(guard);
                    finished.wait();
                });
            }
            started.wait();
            finished.wait();
            erased.write().unwrap().clear();
        });

        assert_eq!(calls.load(Ordering::SeqCst), NUM_THREADS);
    }

    #[test]
    fn test_status_wait_for_update() {
        let status = Arc::new(Status::new(0usize));
        let worker = std::thread::spawn({
            let status = status.clone();
            move || {
                for _ in 0..3 {
                    status.update_all(|count| *count += 1);
                }
            }
        });

        let guard = status.wait_while(|count| *count < 3);
        assert_eq!(*guard, 3);
        drop(guard);
        worker.join().unwrap();
    }
}
