//! Condition-variable semaphores.

use std::{
    ptr::NonNull,
    sync::{Condvar, Mutex},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use esp_rtos_driver::{
    register_semaphore_implementation,
    semaphore::{SemaphoreImplementation, SemaphoreKind, SemaphorePtr},
};

struct SemaphoreInner {
    count: u32,
    max: u32,
    recursive: bool,
    owner: Option<ThreadId>,
    depth: u32,
}

/// Counting semaphore / mutex backed by a [`Mutex`] and a [`Condvar`].
pub struct StdSemaphore {
    inner: Mutex<SemaphoreInner>,
    notify: Condvar,
}

impl StdSemaphore {
    fn new(kind: SemaphoreKind) -> Self {
        let inner = match kind {
            SemaphoreKind::Counting { max, initial } => SemaphoreInner {
                count: initial.min(max),
                max,
                recursive: false,
                owner: None,
                depth: 0,
            },
            SemaphoreKind::Mutex => SemaphoreInner {
                count: 1,
                max: 1,
                recursive: false,
                owner: None,
                depth: 0,
            },
            SemaphoreKind::RecursiveMutex => SemaphoreInner {
                count: 1,
                max: 1,
                recursive: true,
                owner: None,
                depth: 0,
            },
        };

        Self {
            inner: Mutex::new(inner),
            notify: Condvar::new(),
        }
    }

    unsafe fn from_ptr<'a>(semaphore: SemaphorePtr) -> &'a Self {
        unsafe { semaphore.cast::<StdSemaphore>().as_ref() }
    }
}

impl SemaphoreImplementation for StdSemaphore {
    fn create(kind: SemaphoreKind) -> SemaphorePtr {
        let sem = Box::leak(Box::new(StdSemaphore::new(kind)));
        NonNull::from(sem).cast()
    }

    unsafe fn delete(semaphore: SemaphorePtr) {
        let sem = unsafe { Box::from_raw(semaphore.cast::<StdSemaphore>().as_ptr()) };
        drop(sem);
    }

    unsafe fn take(semaphore: SemaphorePtr, timeout_us: Option<u32>) -> bool {
        let sem = unsafe { Self::from_ptr(semaphore) };
        let me = thread::current().id();

        let mut inner = sem.inner.lock().unwrap();
        if inner.recursive && inner.owner == Some(me) {
            inner.depth += 1;
            return true;
        }

        let deadline = timeout_us.map(|us| Instant::now() + Duration::from_micros(us as u64));
        while inner.count == 0 {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = sem.notify.wait_timeout(inner, deadline - now).unwrap();
                    inner = guard;
                }
                None => inner = sem.notify.wait(inner).unwrap(),
            }
        }

        inner.count -= 1;
        if inner.recursive {
            inner.owner = Some(me);
            inner.depth = 1;
        }
        true
    }

    unsafe fn give(semaphore: SemaphorePtr) -> bool {
        let sem = unsafe { Self::from_ptr(semaphore) };
        let mut inner = sem.inner.lock().unwrap();

        if inner.recursive {
            if inner.owner != Some(thread::current().id()) {
                return false;
            }
            inner.depth -= 1;
            if inner.depth > 0 {
                return true;
            }
            inner.owner = None;
        }

        if inner.count == inner.max {
            return false;
        }
        inner.count += 1;
        sem.notify.notify_one();
        true
    }

    unsafe fn try_give_from_isr(
        semaphore: SemaphorePtr,
        higher_prio_task_waken: Option<&mut bool>,
    ) -> bool {
        // There are no interrupt priorities on the host; a "from ISR" give
        // is an ordinary give from whatever thread models the interrupt.
        if let Some(waken) = higher_prio_task_waken {
            *waken = false;
        }
        unsafe { Self::give(semaphore) }
    }

    unsafe fn current_count(semaphore: SemaphorePtr) -> u32 {
        let sem = unsafe { Self::from_ptr(semaphore) };
        sem.inner.lock().unwrap().count
    }

    unsafe fn try_take(semaphore: SemaphorePtr) -> bool {
        let sem = unsafe { Self::from_ptr(semaphore) };
        let me = thread::current().id();

        let mut inner = sem.inner.lock().unwrap();
        if inner.recursive && inner.owner == Some(me) {
            inner.depth += 1;
            return true;
        }
        if inner.count == 0 {
            return false;
        }
        inner.count -= 1;
        if inner.recursive {
            inner.owner = Some(me);
            inner.depth = 1;
        }
        true
    }
}

register_semaphore_implementation!(StdSemaphore);

#[cfg(test)]
mod tests {
    use std::{
        thread,
        time::{Duration, Instant},
    };

    use esp_rtos_driver::semaphore::{SemaphoreHandle, SemaphoreKind};

    #[test]
    fn counting_semaphore_caps_at_max() {
        let sem = SemaphoreHandle::new(SemaphoreKind::Counting { max: 2, initial: 0 });
        assert!(sem.give());
        assert!(sem.give());
        assert!(!sem.give());
        assert_eq!(sem.current_count(), 2);
    }

    #[test]
    fn take_times_out() {
        let sem = SemaphoreHandle::new(SemaphoreKind::Counting { max: 1, initial: 0 });
        let started = Instant::now();
        assert!(!sem.take(Some(20_000)));
        assert!(started.elapsed().as_micros() >= 20_000);
    }

    #[test]
    fn take_wakes_on_cross_thread_give() {
        let sem = SemaphoreHandle::new(SemaphoreKind::Counting { max: 1, initial: 0 });
        thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(10));
                assert!(sem.give());
            });
            assert!(sem.take(Some(1_000_000)));
        });
    }

    #[test]
    fn recursive_mutex_tracks_depth() {
        let mutex = SemaphoreHandle::new(SemaphoreKind::RecursiveMutex);
        assert!(mutex.take(Some(0)));
        assert!(mutex.take(Some(0)));
        assert!(mutex.give());

        // Still held once; another thread must not be able to take it.
        thread::scope(|scope| {
            let contender = scope.spawn(|| mutex.take(Some(1_000)));
            assert!(!contender.join().unwrap());
        });

        assert!(mutex.give());
        assert!(mutex.take(Some(0)));
    }

    #[test]
    fn try_take_never_blocks() {
        let sem = SemaphoreHandle::new(SemaphoreKind::Counting { max: 1, initial: 1 });
        assert!(sem.try_take());
        assert!(!sem.try_take());
    }
}
