//! Rolling duration-bounded buffers
//!
//! Each live stream feeds one `RollingWindow`: a FIFO bounded by elapsed
//! duration rather than item count. New items are appended first and only
//! then is anything evicted, so a concurrent snapshot never observes a gap
//! or a window wider than the configured duration.

use crate::capture::frame::HostStamped;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Default retention window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30);

/// A time-windowed FIFO store for timestamped items.
///
/// The internal lock is held only for the deque mutation or the snapshot
/// copy, never across I/O, so a slow reader cannot stall the producer.
pub struct RollingWindow<T: HostStamped> {
    inner: Mutex<VecDeque<T>>,
    duration: Duration,
}

impl<T: HostStamped + Clone> RollingWindow<T> {
    /// Create a window retaining `duration` of history.
    pub fn new(duration: Duration) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            duration,
        }
    }

    /// The configured retention duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Append an item, then evict anything older than the window.
    ///
    /// Items with equal host times keep their insertion order. Eviction uses
    /// the latest host time seen so far, so an append never removes the item
    /// it just stored.
    pub fn append(&self, item: T) {
        let mut inner = self.inner.lock();
        inner.push_back(item);

        // Latest item defines the trailing edge of the window.
        let latest = inner
            .back()
            .map(|i| i.host_time())
            .unwrap_or(Duration::ZERO);
        let cutoff = latest.saturating_sub(self.duration);

        while let Some(front) = inner.front() {
            if front.host_time() < cutoff {
                inner.pop_front();
            } else {
                break;
            }
        }
    }

    /// Copy the current contents in order.
    ///
    /// The returned items alias nothing inside the buffer; cost is bounded
    /// by the copy itself. A buffer that has run for less than the window
    /// duration returns the partial history it has.
    pub fn snapshot(&self) -> Vec<T> {
        let inner = self.inner.lock();
        inner.iter().cloned().collect()
    }

    /// Number of items currently retained.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Discard all contents.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Host-time span currently covered, zero when fewer than two items.
    pub fn span(&self) -> Duration {
        let inner = self.inner.lock();
        match (inner.front(), inner.back()) {
            (Some(first), Some(last)) => last.host_time().saturating_sub(first.host_time()),
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Stamped {
        at_ms: u64,
        id: u32,
    }

    impl HostStamped for Stamped {
        fn host_time(&self) -> Duration {
            Duration::from_millis(self.at_ms)
        }
    }

    fn item(at_ms: u64, id: u32) -> Stamped {
        Stamped { at_ms, id }
    }

    #[test]
    fn test_span_never_exceeds_window() {
        let window = RollingWindow::new(Duration::from_secs(30));
        for i in 0..100u64 {
            window.append(item(i * 1000, i as u32));
            assert!(window.span() <= Duration::from_secs(30));
        }
        // 31 items fit exactly in a 30s span at 1Hz (inclusive boundaries).
        assert_eq!(window.len(), 31);
    }

    #[test]
    fn test_no_item_older_than_cutoff() {
        let window = RollingWindow::new(Duration::from_secs(10));
        for i in 0..50u64 {
            window.append(item(i * 1000, i as u32));
        }
        let snap = window.snapshot();
        let latest = snap.last().unwrap().host_time();
        for entry in &snap {
            assert!(entry.host_time() >= latest - Duration::from_secs(10));
        }
    }

    #[test]
    fn test_partial_window_returned_as_is() {
        let window = RollingWindow::new(Duration::from_secs(30));
        window.append(item(0, 0));
        window.append(item(5000, 1));
        let snap = window.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(window.span(), Duration::from_secs(5));
    }

    #[test]
    fn test_insertion_order_preserved_on_ties() {
        let window = RollingWindow::new(Duration::from_secs(30));
        window.append(item(1000, 1));
        window.append(item(1000, 2));
        window.append(item(1000, 3));
        let ids: Vec<u32> = window.snapshot().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let window = RollingWindow::new(Duration::from_secs(30));
        window.append(item(0, 1));
        let snap = window.snapshot();
        window.clear();
        assert_eq!(snap.len(), 1);
        assert!(window.is_empty());
    }

    #[test]
    fn test_clear_discards_everything() {
        let window = RollingWindow::new(Duration::from_secs(30));
        for i in 0..10u64 {
            window.append(item(i, i as u32));
        }
        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.snapshot().len(), 0);
    }

    #[test]
    fn test_concurrent_appends_with_mid_stream_snapshot() {
        // Two producer threads, one snapshot mid-stream: the snapshot must
        // be a consistent cut with no torn or duplicated items.
        let audio = Arc::new(RollingWindow::new(Duration::from_secs(60)));
        let video = Arc::new(RollingWindow::new(Duration::from_secs(60)));

        let a = {
            let audio = audio.clone();
            std::thread::spawn(move || {
                for i in 0..100u64 {
                    audio.append(item(i * 10, i as u32));
                }
            })
        };
        let v = {
            let video = video.clone();
            std::thread::spawn(move || {
                for i in 0..10u64 {
                    video.append(item(i * 100, 1000 + i as u32));
                }
            })
        };

        let audio_snap = audio.snapshot();
        let video_snap = video.snapshot();

        a.join().unwrap();
        v.join().unwrap();

        // Consistent cut: strictly increasing ids, each id seen once.
        for snap in [&audio_snap, &video_snap] {
            for pair in snap.windows(2) {
                assert!(pair[1].id > pair[0].id);
            }
        }
        assert_eq!(audio.len(), 100);
        assert_eq!(video.len(), 10);
    }
}
