//! # Host implementation of the RTOS services interface.
//!
//! Implements [`esp-rtos-driver`] on top of `std::thread`, so that crates
//! written against the interface (the VFS layer, the LP core mailbox) can
//! run their test suites as ordinary host binaries: tasks are threads,
//! semaphores are condition variables, and "interrupt context" is whichever
//! thread happens to deliver the event.
//!
//! Linking this crate also enables `critical-section`'s `std`
//! implementation, so a test binary that depends on it (even only as
//! `use esp_rtos_std as _;`) has every runtime service the library crates
//! expect.
//!
//! Not meant for production firmware; the scheduling it provides is
//! whatever the host OS does.
//!
//! [`esp-rtos-driver`]: https://crates.io/crates/esp-rtos-driver

mod semaphore;
mod task;

pub use semaphore::StdSemaphore;
pub use task::StdTask;
