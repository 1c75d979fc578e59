//! Threads as tasks.

use std::{cell::Cell, ptr::NonNull, thread};

use esp_rtos_driver::{
    TaskImplementation,
    ThreadPtr,
    register_task_implementation,
    semaphore::{SemaphoreImplementation, SemaphoreKind, SemaphorePtr},
};

use crate::semaphore::StdSemaphore;

struct TaskRecord {
    thread_semaphore: SemaphorePtr,
}

thread_local! {
    static TASK_RECORD: Cell<Option<NonNull<TaskRecord>>> = const { Cell::new(None) };
}

// Records are leaked on purpose: other tasks and "interrupt" threads hold
// raw pointers to a task's notification semaphore and may give it after the
// owning thread has already exited. One record per test thread is cheap.
fn task_record() -> NonNull<TaskRecord> {
    TASK_RECORD.with(|slot| match slot.get() {
        Some(record) => record,
        None => {
            let thread_semaphore =
                StdSemaphore::create(SemaphoreKind::Counting { max: 1, initial: 0 });
            let record = NonNull::from(Box::leak(Box::new(TaskRecord { thread_semaphore })));
            slot.set(Some(record));
            record
        }
    })
}

/// Task services for test threads.
///
/// Every thread that touches the interface lazily becomes a "task": it gets
/// a stable identity and a binary notification semaphore, whether it was
/// spawned by the test or is the harness's own main thread.
pub struct StdTask;

impl TaskImplementation for StdTask {
    fn yield_task() {
        thread::yield_now();
    }

    fn current_task() -> ThreadPtr {
        task_record().cast()
    }

    fn current_task_thread_semaphore() -> SemaphorePtr {
        unsafe { task_record().as_ref() }.thread_semaphore
    }
}

register_task_implementation!(StdTask);
