use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};

use serde_json::json;

/// Gauge tracking a current value and the peak it ever reached.
#[derive(Default)]
pub struct Counter {
    current: AtomicIsize,
    peak: AtomicIsize,
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#"{{ "count":{}, "max":{} }}"#, self.count(), self.max())
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Counter { current: AtomicIsize::new(self.count()), peak: AtomicIsize::new(self.max()) }
    }
}

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(&self) {
        self.incs(1);
    }

    #[inline]
    pub fn incs(&self, c: isize) {
        let prev = self.current.fetch_add(c, Ordering::SeqCst);
        self.peak.fetch_max(prev + c, Ordering::SeqCst);
    }

    #[inline]
    pub fn dec(&self) {
        self.decs(1)
    }

    #[inline]
    pub fn decs(&self, c: isize) {
        self.current.fetch_sub(c, Ordering::SeqCst);
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.current.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.peak.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "count": self.count(),
            "max": self.max()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Counter;

    #[test]
    fn peak_survives_decrement() {
        let c = Counter::new();
        c.incs(3);
        c.dec();
        c.dec();
        assert_eq!(c.count(), 1);
        assert_eq!(c.max(), 3);
        assert_eq!(c.to_json()["count"], 1);
    }
}
