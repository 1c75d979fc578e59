//! # RTOS services interface for the BSP core components.
//!
//! The VFS layer and the LP core mailbox block tasks, wake them from
//! interrupt handlers and serialize operations with mutexes, but they do not
//! care which scheduler provides those services. This crate is that boundary:
//! it declares the primitives as `extern "Rust"` functions and lets exactly
//! one implementation crate provide them at link time. Linking two
//! implementation crates into the same image will not build.
//!
//! On hardware the implementation is the FreeRTOS port (or any other
//! preemptive scheduler); on the host the [`esp-rtos-std`] crate implements
//! the same interface on top of `std::thread`, which is how the dependent
//! crates run their test suites as ordinary `cargo test` binaries.
//!
//! [`esp-rtos-std`]: https://crates.io/crates/esp-rtos-std
//!
//! ## Implementing the interface
//!
//! Implement [`semaphore::SemaphoreImplementation`] and
//! [`TaskImplementation`] for (typically zero-sized) types, then register
//! them with [`register_semaphore_implementation!`] and
//! [`register_task_implementation!`]. The macros emit the `#[no_mangle]`
//! shims the extern declarations resolve against.
//!
//! ## Using the interface
//!
//! Consumers interact with semaphores through
//! [`semaphore::SemaphoreHandle`], and with the current task through the
//! free functions in this crate. The only task-level services the core
//! components need are yielding, identifying the running task and the
//! per-task notification semaphore (the FreeRTOS task-notification
//! equivalent, used by the pipe driver to park and wake blocked readers and
//! writers).

#![cfg_attr(docsrs, feature(doc_cfg))]
#![no_std]

use core::ptr::NonNull;

use crate::semaphore::SemaphorePtr;

pub mod semaphore;

/// Pointer to an opaque task owned by the scheduler implementation.
pub type ThreadPtr = NonNull<()>;

unsafe extern "Rust" {
    fn esp_rtos_yield_task();
    fn esp_rtos_current_task() -> ThreadPtr;
    fn esp_rtos_current_task_thread_semaphore() -> SemaphorePtr;
}

/// Task-level scheduler services.
///
/// The following snippet demonstrates the boilerplate necessary to implement
/// the task interface:
///
/// ```rust,no_run
/// use esp_rtos_driver::{
///     TaskImplementation,
///     ThreadPtr,
///     register_task_implementation,
///     semaphore::SemaphorePtr,
/// };
///
/// struct MyRtos;
///
/// impl TaskImplementation for MyRtos {
///     fn yield_task() {
///         unimplemented!()
///     }
///
///     fn current_task() -> ThreadPtr {
///         unimplemented!()
///     }
///
///     fn current_task_thread_semaphore() -> SemaphorePtr {
///         unimplemented!()
///     }
/// }
///
/// register_task_implementation!(MyRtos);
/// ```
pub trait TaskImplementation {
    /// Gives up the remainder of the current task's time slice.
    fn yield_task();

    /// Returns a handle identifying the currently running task.
    fn current_task() -> ThreadPtr;

    /// Returns the notification semaphore of the currently running task.
    ///
    /// The returned semaphore must behave like a binary semaphore created
    /// with an initial count of zero, must stay valid for the lifetime of
    /// the task, and must be the same object every time the same task asks
    /// for it. Any context (another task or an ISR) may give it to wake the
    /// owning task.
    fn current_task_thread_semaphore() -> SemaphorePtr;
}

#[macro_export]
macro_rules! register_task_implementation {
    ($t: ty) => {
        #[unsafe(no_mangle)]
        #[inline]
        fn esp_rtos_yield_task() {
            <$t as $crate::TaskImplementation>::yield_task()
        }

        #[unsafe(no_mangle)]
        #[inline]
        fn esp_rtos_current_task() -> $crate::ThreadPtr {
            <$t as $crate::TaskImplementation>::current_task()
        }

        #[unsafe(no_mangle)]
        #[inline]
        fn esp_rtos_current_task_thread_semaphore() -> $crate::semaphore::SemaphorePtr {
            <$t as $crate::TaskImplementation>::current_task_thread_semaphore()
        }
    };
}

/// Gives up the remainder of the current task's time slice.
#[inline]
pub fn yield_task() {
    unsafe { esp_rtos_yield_task() }
}

/// Returns a handle identifying the currently running task.
#[inline]
pub fn current_task() -> ThreadPtr {
    unsafe { esp_rtos_current_task() }
}

/// Returns the notification semaphore of the currently running task.
///
/// The semaphore belongs to the task, not to the caller. Do not wrap the
/// returned pointer in an owning [`semaphore::SemaphoreHandle`]; use
/// [`semaphore::SemaphoreHandle::ref_from_ptr`] instead so the task keeps
/// its semaphore when the reference goes away.
#[inline]
pub fn current_task_thread_semaphore() -> SemaphorePtr {
    unsafe { esp_rtos_current_task_thread_semaphore() }
}
