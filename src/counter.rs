//! Download and upload accounting.
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter of transferred bytes. Totals are monotonic; the download window
/// resets every time the choking policy samples it.
#[derive(Debug, Default)]
pub struct Counter {
    total_downloaded: AtomicU64,
    total_uploaded: AtomicU64,
    window_downloaded: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_download(&self, bytes: u64) {
        self.total_downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_upload(&self, bytes: u64) {
        self.total_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total_download(&self) -> u64 {
        self.total_downloaded.load(Ordering::Relaxed)
    }

    pub fn total_upload(&self) -> u64 {
        self.total_uploaded.load(Ordering::Relaxed)
    }

    /// Bytes downloaded since the last sampling, resetting the window.
    pub fn take_window_download(&self) -> u64 {
        self.window_downloaded.swap(0, Ordering::Relaxed)
    }

    /// Seed the totals from a resume record.
    pub fn restore(&self, downloaded: u64, uploaded: u64) {
        self.total_downloaded.store(downloaded, Ordering::Relaxed);
        self.total_uploaded.store(uploaded, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_are_monotonic_across_window_sampling() {
        let counter = Counter::new();
        counter.record_download(1000);
        counter.record_upload(500);

        assert_eq!(counter.take_window_download(), 1000);
        assert_eq!(counter.take_window_download(), 0);

        counter.record_download(24);
        assert_eq!(counter.total_download(), 1024);
        assert_eq!(counter.total_upload(), 500);
    }

    #[test]
    fn restore_seeds_totals() {
        let counter = Counter::new();
        counter.restore(10, 20);
        counter.record_download(5);
        assert_eq!(counter.total_download(), 15);
        assert_eq!(counter.total_upload(), 20);
    }
}
