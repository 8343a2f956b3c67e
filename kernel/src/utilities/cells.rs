// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Cell types for the single-threaded, callback-driven concurrency model.
//!
//! Every capsule keeps its state behind `&self` and mutates it through these
//! cells. [`TakeCell`] holds a mutable reference that is temporarily taken
//! out, [`MapCell`] does the same for an owned value, and [`OptionalCell`] is
//! a `Cell<Option<T>>` with a friendlier API.

use core::cell::{Cell, UnsafeCell};
use core::mem::MaybeUninit;

/// A shared reference to a mutable reference.
///
/// The contained `&'a mut T` can be taken out, used, and put back; `map`
/// wraps that pattern. While a closure passed to `map` runs, the cell is
/// empty, so reentrant access observes `None` instead of aliasing.
pub struct TakeCell<'a, T: 'a + ?Sized> {
    val: Cell<Option<&'a mut T>>,
}

impl<'a, T: ?Sized> TakeCell<'a, T> {
    pub const fn empty() -> TakeCell<'a, T> {
        TakeCell {
            val: Cell::new(None),
        }
    }

    pub fn new(value: &'a mut T) -> TakeCell<'a, T> {
        TakeCell {
            val: Cell::new(Some(value)),
        }
    }

    pub fn is_none(&self) -> bool {
        !self.is_some()
    }

    pub fn is_some(&self) -> bool {
        let inner = self.val.take();
        let has = inner.is_some();
        self.val.set(inner);
        has
    }

    /// Take the mutable reference out, leaving the cell empty.
    pub fn take(&self) -> Option<&'a mut T> {
        self.val.take()
    }

    /// Store a new reference, dropping any previous one.
    pub fn put(&self, val: Option<&'a mut T>) {
        self.val.set(val);
    }

    /// Replace the contents, returning the previous reference.
    pub fn replace(&self, val: &'a mut T) -> Option<&'a mut T> {
        self.val.replace(Some(val))
    }

    /// Run `closure` on the contents, if any, putting them back afterwards.
    pub fn map<F, R>(&self, closure: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        self.val.take().map(|val| {
            let res = closure(val);
            self.val.set(Some(val));
            res
        })
    }

    /// Like `map`, with a default result when the cell is empty.
    pub fn map_or<F, R>(&self, default: R, closure: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        self.map(closure).unwrap_or(default)
    }
}

/// A cell holding an owned `T` that can be temporarily moved out.
///
/// Like [`TakeCell`] but for values rather than references. During a `map`
/// the occupied flag is cleared so reentrant access sees an empty cell.
pub struct MapCell<T> {
    val: UnsafeCell<MaybeUninit<T>>,
    occupied: Cell<bool>,
}

impl<T> MapCell<T> {
    pub const fn empty() -> MapCell<T> {
        MapCell {
            val: UnsafeCell::new(MaybeUninit::uninit()),
            occupied: Cell::new(false),
        }
    }

    pub const fn new(value: T) -> MapCell<T> {
        MapCell {
            val: UnsafeCell::new(MaybeUninit::new(value)),
            occupied: Cell::new(true),
        }
    }

    pub fn is_none(&self) -> bool {
        !self.is_some()
    }

    pub fn is_some(&self) -> bool {
        self.occupied.get()
    }

    /// Move the value out, leaving the cell empty.
    pub fn take(&self) -> Option<T> {
        if !self.occupied.get() {
            return None;
        }
        self.occupied.set(false);
        // occupied was true, so the MaybeUninit is initialized, and clearing
        // the flag first means nobody else can observe it as initialized.
        unsafe { Some(self.val.get().read().assume_init()) }
    }

    /// Store a value, dropping any previous one.
    pub fn put(&self, val: T) {
        drop(self.take());
        unsafe {
            self.val.get().write(MaybeUninit::new(val));
        }
        self.occupied.set(true);
    }

    /// Replace the contents, returning the previous value.
    pub fn replace(&self, val: T) -> Option<T> {
        let prev = self.take();
        self.put(val);
        prev
    }

    /// Run `closure` on the contents in place, if any.
    ///
    /// The occupied flag is cleared for the duration of the closure, so a
    /// reentrant `map`/`take` observes an empty cell rather than an aliased
    /// value.
    pub fn map<F, R>(&self, closure: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        if !self.occupied.get() {
            return None;
        }
        self.occupied.set(false);
        // Initialized because occupied was true; unaliased because the flag
        // is down while the closure runs.
        let res = closure(unsafe { (*self.val.get()).assume_init_mut() });
        self.occupied.set(true);
        Some(res)
    }

    /// Like `map`, with a default result when the cell is empty.
    pub fn map_or<F, R>(&self, default: R, closure: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        self.map(closure).unwrap_or(default)
    }

    /// Like `map_or`, with a closure producing the default lazily.
    pub fn map_or_else<U, D, F>(&self, default: D, closure: F) -> U
    where
        D: FnOnce() -> U,
        F: FnOnce(&mut T) -> U,
    {
        self.map(closure).unwrap_or_else(default)
    }
}

impl<T> Drop for MapCell<T> {
    fn drop(&mut self) {
        drop(self.take());
    }
}

/// A `Cell<Option<T>>` with convenience methods.
///
/// Used pervasively for client references (`OptionalCell<&'a dyn Client>`)
/// and small optional state.
pub struct OptionalCell<T> {
    value: Cell<Option<T>>,
}

impl<T> OptionalCell<T> {
    pub const fn empty() -> OptionalCell<T> {
        OptionalCell {
            value: Cell::new(None),
        }
    }

    pub const fn new(val: T) -> OptionalCell<T> {
        OptionalCell {
            value: Cell::new(Some(val)),
        }
    }

    pub fn is_none(&self) -> bool {
        !self.is_some()
    }

    pub fn is_some(&self) -> bool {
        let inner = self.value.take();
        let has = inner.is_some();
        self.value.set(inner);
        has
    }

    pub fn set(&self, val: T) {
        self.value.set(Some(val));
    }

    pub fn clear(&self) {
        self.value.set(None);
    }

    pub fn insert(&self, opt: Option<T>) {
        self.value.set(opt);
    }

    pub fn take(&self) -> Option<T> {
        self.value.take()
    }

    pub fn replace(&self, val: T) -> Option<T> {
        self.value.replace(Some(val))
    }
}

impl<T: Copy> OptionalCell<T> {
    pub fn get(&self) -> Option<T> {
        self.value.get()
    }

    pub fn unwrap_or(&self, default: T) -> T {
        self.value.get().unwrap_or(default)
    }

    /// Run `closure` on the contained value, if any.
    pub fn map<F, R>(&self, closure: F) -> Option<R>
    where
        F: FnOnce(T) -> R,
    {
        self.value.get().map(closure)
    }

    pub fn map_or<F, R>(&self, default: R, closure: F) -> R
    where
        F: FnOnce(T) -> R,
    {
        self.value.get().map_or(default, closure)
    }

    pub fn and_then<F, R>(&self, closure: F) -> Option<R>
    where
        F: FnOnce(T) -> Option<R>,
    {
        self.value.get().and_then(closure)
    }
}

impl<T: Copy> Clone for OptionalCell<T> {
    fn clone(&self) -> Self {
        OptionalCell {
            value: self.value.clone(),
        }
    }
}
