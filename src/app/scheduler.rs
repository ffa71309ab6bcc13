use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Counting semaphore bounding how many workers run at once.
pub struct GlobalSemaphore {
    limit: usize,
    used: Mutex<usize>,
    cv: Condvar,
}

impl GlobalSemaphore {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            used: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Waits for a slot. Returns `None` if `cancel` is raised while queued.
    pub fn acquire(self: &Arc<Self>, cancel: &AtomicBool) -> Option<GlobalPermit> {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        while *used >= self.limit {
            if cancel.load(Ordering::Relaxed) {
                return None;
            }
            used = self
                .cv
                .wait_timeout(used, CANCEL_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *used += 1;
        Some(GlobalPermit {
            semaphore: Arc::clone(self),
        })
    }

    pub fn in_use(&self) -> usize {
        *self.used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self) {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        *used = used.saturating_sub(1);
        self.cv.notify_one();
    }
}

pub struct GlobalPermit {
    semaphore: Arc<GlobalSemaphore>,
}

impl Drop for GlobalPermit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Global worker limit plus one lock per device, so deploy protocols on the same device never
/// overlap on the shared remote path.
pub struct TaskScheduler {
    global: Arc<GlobalSemaphore>,
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TaskScheduler {
    pub fn new(global_limit: usize) -> Self {
        Self {
            global: Arc::new(GlobalSemaphore::new(global_limit)),
            device_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquire_global(&self, cancel: &AtomicBool) -> Option<GlobalPermit> {
        self.global.acquire(cancel)
    }

    pub fn running(&self) -> usize {
        self.global.in_use()
    }

    pub fn device_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        let mut guard = self
            .device_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn global_semaphore_limits_concurrency() {
        let scheduler = Arc::new(TaskScheduler::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let scheduler = Arc::clone(&scheduler);
            let running = Arc::clone(&running);
            let max_running = Arc::clone(&max_running);
            handles.push(thread::spawn(move || {
                let never = AtomicBool::new(false);
                let _permit = scheduler.acquire_global(&never).expect("permit");
                let current = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(current, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.join().expect("join");
        }

        assert!(max_running.load(Ordering::SeqCst) <= 2);
        assert_eq!(scheduler.running(), 0);
    }

    #[test]
    fn queued_acquire_gives_up_when_cancelled() {
        let scheduler = Arc::new(TaskScheduler::new(1));
        let never = AtomicBool::new(false);
        let _held = scheduler.acquire_global(&never).expect("permit");

        let cancel = Arc::new(AtomicBool::new(false));
        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || scheduler.acquire_global(&cancel).is_some())
        };
        thread::sleep(Duration::from_millis(100));
        let start = Instant::now();
        cancel.store(true, Ordering::Relaxed);

        assert!(!waiter.join().expect("join"));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn device_lock_serializes_same_device() {
        let scheduler = Arc::new(TaskScheduler::new(8));
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let scheduler = Arc::clone(&scheduler);
            let running = Arc::clone(&running);
            let max_running = Arc::clone(&max_running);
            handles.push(thread::spawn(move || {
                let lock = scheduler.device_lock("device-1");
                let _guard = lock.lock().expect("lock");
                let current = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(current, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.join().expect("join");
        }

        assert_eq!(max_running.load(Ordering::SeqCst), 1);
    }
}
