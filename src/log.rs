// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Feature-gated logging macros.
//!
//! Mirrors the teacher crate's `logging` feature: `tracing` is an optional
//! dependency, and these wrappers no-op to nothing when the feature is off
//! so call sites never need `#[cfg(feature = "logging")]` of their own.

#[cfg(feature = "logging")]
macro_rules! sched_debug {
    ($($arg:tt)*) => { tracing::debug!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! sched_debug {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "logging")]
macro_rules! sched_info {
    ($($arg:tt)*) => { tracing::info!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! sched_info {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "logging")]
macro_rules! sched_warn {
    ($($arg:tt)*) => { tracing::warn!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! sched_warn {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "logging")]
macro_rules! sched_error {
    ($($arg:tt)*) => { tracing::error!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! sched_error {
    ($($arg:tt)*) => {};
}

pub(crate) use sched_debug;
pub(crate) use sched_error;
pub(crate) use sched_info;
pub(crate) use sched_warn;
