use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::types::{From, Publish};

pub type MessageQueue = Queue<(From, Publish)>;

/// Which value gives way when a full queue receives another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    //Discard current value
    Current,
    //Discard earliest value
    Early,
}

/// Bounded multi-producer, single-consumer queue.
///
/// Producers never hold the lock across an await. The consumer waits on `readable`,
/// producers using the blocking policy wait on `writable`.
pub struct Queue<T> {
    cap: usize,
    inner: Mutex<VecDeque<T>>,
    readable: Notify,
    writable: Notify,
}

impl<T> Drop for Queue<T> {
    #[inline]
    fn drop(&mut self) {
        log::debug!("Queue Drop ... len: {}", self.len());
    }
}

impl<T> Queue<T> {
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self { cap: cap.max(1), inner: Mutex::new(VecDeque::new()), readable: Notify::new(), writable: Notify::new() }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Pushes without waiting. When the queue is full the value chosen by `policy` is
    /// discarded and returned.
    #[inline]
    pub fn push(&self, v: T, policy: Policy) -> Result<(), T> {
        self.push_with(v, policy, |_| ())
    }

    /// Like [`Queue::push`], running `on_push` on the accepted value while the queue is
    /// still locked, so whatever it records is ordered with [`Queue::snapshot_with`].
    pub fn push_with(&self, v: T, policy: Policy, on_push: impl FnOnce(&T)) -> Result<(), T> {
        let dropped = {
            let mut inner = self.inner.lock();
            if inner.len() < self.cap {
                on_push(&v);
                inner.push_back(v);
                None
            } else {
                match policy {
                    Policy::Current => return Err(v),
                    Policy::Early => {
                        let removed = inner.pop_front();
                        on_push(&v);
                        inner.push_back(v);
                        removed
                    }
                }
            }
        };
        self.readable.notify_one();
        match dropped {
            Some(removed) => Err(removed),
            None => Ok(()),
        }
    }

    /// Waits up to `timeout` for a free slot, then falls back to discarding the
    /// earliest value.
    pub async fn push_wait_with(&self, mut v: T, timeout: Duration, on_push: impl FnOnce(&T)) -> Result<(), T> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut on_push = Some(on_push);
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let res = self.push_with(v, Policy::Current, |v| {
                if let Some(f) = on_push.take() {
                    f(v)
                }
            });
            match res {
                Ok(()) => return Ok(()),
                Err(back) => v = back,
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                log::warn!("queue is full for {:?}, queue len is {}", timeout, self.len());
                return self.push_with(v, Policy::Early, |v| {
                    if let Some(f) = on_push.take() {
                        f(v)
                    }
                });
            }
        }
    }

    #[inline]
    pub fn pop(&self) -> Option<T> {
        let v = self.inner.lock().pop_front();
        if v.is_some() {
            self.writable.notify_one();
        }
        v
    }

    /// Puts values back at the head, ahead of anything queued, ignoring the capacity.
    pub fn push_front_all(&self, values: Vec<T>) {
        if values.is_empty() {
            return;
        }
        {
            let mut inner = self.inner.lock();
            for v in values.into_iter().rev() {
                inner.push_front(v);
            }
        }
        self.readable.notify_one();
    }

    /// Waits until a value is available. Only one task may consume.
    pub async fn recv(&self) -> T {
        loop {
            if let Some(v) = self.pop() {
                return v;
            }
            self.readable.notified().await;
        }
    }

    pub fn drain(&self) -> Vec<T> {
        let values = self.inner.lock().drain(..).collect::<Vec<_>>();
        self.writable.notify_waiters();
        values
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl<T: Clone> Queue<T> {
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.lock().iter().cloned().collect()
    }

    /// Hands a copy of the queued values to `f` while the queue stays locked.
    pub fn snapshot_with<R>(&self, f: impl FnOnce(Vec<T>) -> R) -> R {
        let inner = self.inner.lock();
        f(inner.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn drop_policies() {
        let q = Queue::new(2);
        assert_eq!(q.push(1, Policy::Current), Ok(()));
        assert_eq!(q.push(2, Policy::Current), Ok(()));
        assert_eq!(q.push(3, Policy::Current), Err(3));
        assert_eq!(q.push(4, Policy::Early), Err(1));
        assert_eq!(q.snapshot(), vec![2, 4]);

        q.push_front_all(vec![8, 9]);
        assert_eq!(q.len(), 4);
        assert_eq!(q.drain(), vec![8, 9, 2, 4]);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn recv_wakes_on_push() {
        let q = Arc::new(Queue::new(4));
        let q1 = q.clone();
        let h = tokio::spawn(async move { q1.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push(7, Policy::Current).unwrap();
        assert_eq!(h.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn blocking_push_waits_for_room() {
        let q = Arc::new(Queue::new(1));
        q.push(1, Policy::Current).unwrap();
        let q1 = q.clone();
        let h = tokio::spawn(async move { q1.push_wait_with(2, Duration::from_secs(5), |_| ()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(q.pop(), Some(1));
        assert_eq!(h.await.unwrap(), Ok(()));
        assert_eq!(q.pop(), Some(2));
    }

    #[tokio::test]
    async fn blocking_push_gives_up_after_timeout() {
        let q = Queue::new(1);
        q.push(1, Policy::Current).unwrap();
        assert_eq!(q.push_wait_with(2, Duration::from_millis(10), |_| ()).await, Err(1));
        assert_eq!(q.snapshot(), vec![2]);
    }

    #[test]
    fn push_hook_runs_only_for_accepted_values() {
        let q = Queue::new(1);
        let seen = std::cell::RefCell::new(Vec::new());
        q.push_with(1, Policy::Current, |v| seen.borrow_mut().push(*v)).unwrap();
        assert_eq!(q.push_with(2, Policy::Current, |v| seen.borrow_mut().push(*v)), Err(2));
        assert_eq!(q.push_with(3, Policy::Early, |v| seen.borrow_mut().push(*v)), Err(1));
        assert_eq!(*seen.borrow(), vec![1, 3]);
        assert_eq!(q.snapshot_with(|vs| vs.len()), 1);
    }
}
