use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};
use kernel_error::{Fatal, fatal};

/// A cell that hands out one mutable borrow at a time.
///
/// Unlike a spin lock, a second [`enter`](Self::enter) while a guard is alive
/// does not wait: on a single CPU the holder can never run again to release
/// it, so nested entry is reported as [`Fatal::Reentered`].
pub struct ExclusiveCell<T> {
    /// * `false`: free
    /// * `true`: entered
    entered: AtomicBool,
    inner: UnsafeCell<T>,
}

// Safety: at most one guard exists at a time; only T: Send may cross contexts.
unsafe impl<T: Send> Sync for ExclusiveCell<T> {}

impl<T> ExclusiveCell<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            entered: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Try once; `None` while another guard is alive.
    #[inline]
    pub fn try_enter(&self) -> Option<ExclusiveGuard<'_, T>> {
        if self
            .entered
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(ExclusiveGuard { cell: self })
        } else {
            None
        }
    }

    /// Enter the cell; stops the kernel if it is already entered.
    #[inline]
    #[track_caller]
    pub fn enter(&self) -> ExclusiveGuard<'_, T> {
        match self.try_enter() {
            Some(guard) => guard,
            None => fatal(Fatal::Reentered),
        }
    }

    /// Closure convenience, built on the guard.
    #[inline]
    #[track_caller]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.enter();
        f(&mut g)
    }

    #[inline]
    pub fn is_entered(&self) -> bool {
        self.entered.load(Ordering::Relaxed)
    }

    /// Mutable access when you have `&mut self` (no other guard possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct ExclusiveGuard<'a, T> {
    cell: &'a ExclusiveCell<T>,
}

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.cell.inner.get() }
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.cell.inner.get() }
    }
}

impl<T> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        self.cell.entered.store(false, Ordering::Release);
    }
}
