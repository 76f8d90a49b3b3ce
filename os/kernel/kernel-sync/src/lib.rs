//! # Kernel synchronization primitives
//!
//! The memory subsystem runs in a single execution context. Its global state
//! is not protected by a lock that could spin forever on re-entry; instead an
//! [`ExclusiveCell`] detects a nested entry and stops the kernel.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod exclusive;

pub use exclusive::{ExclusiveCell, ExclusiveGuard};
