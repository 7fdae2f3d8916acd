//! Per-subject sliding windows
//!
//! Each subject owns one time-ordered window of recent readings. Windows are
//! bounded by a time horizon (every reading satisfies `now - timestamp <=
//! horizon`) and by a sample cap, whichever is smaller. Writes to one subject are
//! serialized by that subject's lock; different subjects never contend beyond
//! the brief registry lookup.

use crate::config::WindowConfig;
use crate::types::Reading;
use chrono::{DateTime, Duration, Utc};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
struct SubjectWindow {
    readings: VecDeque<Reading>,
    last_seen: DateTime<Utc>,
}

impl SubjectWindow {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            readings: VecDeque::new(),
            last_seen: now,
        }
    }

    /// Insert keeping timestamp order; in-order arrivals append in O(1)
    fn insert(&mut self, reading: Reading) {
        let position = self
            .readings
            .iter()
            .rposition(|r| r.timestamp <= reading.timestamp)
            .map_or(0, |idx| idx + 1);
        self.readings.insert(position, reading);
    }

    fn evict(&mut self, cutoff: DateTime<Utc>, max_samples: usize) {
        while self
            .readings
            .front()
            .map_or(false, |r| r.timestamp < cutoff)
        {
            self.readings.pop_front();
        }
        while self.readings.len() > max_samples {
            self.readings.pop_front();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Registry of subject windows
pub struct WindowManager {
    horizon: Duration,
    max_samples: usize,
    idle_reclaim: Duration,
    windows: Mutex<HashMap<String, Arc<Mutex<SubjectWindow>>>>,
}

impl Default for WindowManager {
    fn default() -> Self {
        Self::new(&WindowConfig::default())
    }
}

impl WindowManager {
    pub fn new(config: &WindowConfig) -> Self {
        Self {
            horizon: config.horizon(),
            max_samples: config.max_samples.max(1),
            idle_reclaim: config.idle_reclaim(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn subject_window(&self, subject_id: &str, now: DateTime<Utc>) -> Arc<Mutex<SubjectWindow>> {
        let mut windows = lock(&self.windows);
        windows
            .entry(subject_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SubjectWindow::new(now))))
            .clone()
    }

    /// Add a reading and return the subject's current window, newest last
    pub fn add_to_window(&self, subject_id: &str, reading: Reading) -> Vec<Reading> {
        self.add_to_window_at(subject_id, reading, Utc::now())
    }

    /// Same as `add_to_window` against an explicit clock, for replay.
    ///
    /// A reading already older than `now - horizon` is evicted immediately, so
    /// the returned window can be empty.
    pub fn add_to_window_at(
        &self,
        subject_id: &str,
        reading: Reading,
        now: DateTime<Utc>,
    ) -> Vec<Reading> {
        let window = self.subject_window(subject_id, now);
        let mut window = lock(&window);

        window.insert(reading);
        window.evict(now - self.horizon, self.max_samples);
        window.last_seen = now;

        window.readings.iter().cloned().collect()
    }

    /// Current window for a subject without modifying it
    pub fn window(&self, subject_id: &str) -> Vec<Reading> {
        let window = lock(&self.windows).get(subject_id).cloned();
        match window {
            Some(window) => lock(&window).readings.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn window_len(&self, subject_id: &str) -> usize {
        let window = lock(&self.windows).get(subject_id).cloned();
        window.map_or(0, |w| lock(&w).readings.len())
    }

    pub fn active_subjects(&self) -> usize {
        lock(&self.windows).len()
    }

    /// Drop windows that have not received a reading within the idle horizon
    pub fn reclaim_idle(&self) -> usize {
        self.reclaim_idle_at(Utc::now())
    }

    pub fn reclaim_idle_at(&self, now: DateTime<Utc>) -> usize {
        let mut windows = lock(&self.windows);
        let before = windows.len();
        let idle = self.idle_reclaim;
        windows.retain(|_, window| now - lock(window).last_seen <= idle);
        let reclaimed = before - windows.len();
        if reclaimed > 0 {
            debug!("reclaimed {reclaimed} idle subject windows");
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> DateTime<Utc> {
        "2024-01-15T14:00:00Z".parse().unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        base() + Duration::seconds(secs)
    }

    fn reading_at(secs: i64, hr: f64) -> Reading {
        Reading {
            heart_rate: Some(hr),
            ..Reading::new("subject-1", base() + Duration::seconds(secs))
        }
    }

    fn manager(horizon_secs: u64, max_samples: usize) -> WindowManager {
        WindowManager::new(&WindowConfig {
            horizon_secs,
            max_samples,
            idle_reclaim_secs: 1_800,
        })
    }

    #[test]
    fn test_window_accumulates_in_order() {
        let manager = manager(300, 100);
        for i in 0..5 {
            manager.add_to_window_at("subject-1", reading_at(i * 30, 70.0 + i as f64), at(120));
        }

        let window = manager.window("subject-1");
        assert_eq!(window.len(), 5);
        assert!(window.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(window.last().unwrap().heart_rate, Some(74.0));
    }

    #[test]
    fn test_horizon_invariant_holds_after_every_insert() {
        let manager = manager(60, 1_000);
        let horizon = Duration::seconds(60);

        for i in 0..50 {
            // Clock runs ahead of the sensor timestamps
            let now = at(i * 7 + 30);
            let window = manager.add_to_window_at("subject-1", reading_at(i * 7, 70.0), now);
            assert!(!window.is_empty());
            assert!(window.iter().all(|r| now - r.timestamp <= horizon));
        }
    }

    #[test]
    fn test_reading_older_than_horizon_is_evicted_on_insert() {
        let manager = manager(300, 100);
        let now = at(20 * 60);

        let window = manager.add_to_window_at("subject-1", reading_at(0, 70.0), now);
        assert!(window.is_empty());

        // A fresh reading does not resurrect the stale one
        let window = manager.add_to_window_at("subject-1", reading_at(20 * 60 - 10, 72.0), now);
        assert_eq!(window.len(), 1);
        assert!(window.iter().all(|r| now - r.timestamp <= Duration::seconds(300)));
    }

    #[test]
    fn test_window_ages_out_as_clock_advances() {
        let manager = manager(300, 100);
        manager.add_to_window_at("subject-1", reading_at(0, 70.0), at(0));
        manager.add_to_window_at("subject-1", reading_at(200, 71.0), at(200));

        let window = manager.add_to_window_at("subject-1", reading_at(400, 72.0), at(400));
        let rates: Vec<f64> = window.iter().filter_map(|r| r.heart_rate).collect();
        assert_eq!(rates, vec![71.0, 72.0]);
    }

    #[test]
    fn test_sample_cap() {
        let manager = manager(3_600, 3);
        for i in 0..10 {
            manager.add_to_window_at("subject-1", reading_at(i, 70.0 + i as f64), at(10));
        }
        let window = manager.window("subject-1");
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].heart_rate, Some(77.0));
    }

    #[test]
    fn test_late_reading_is_inserted_in_order() {
        let manager = manager(300, 100);
        manager.add_to_window_at("subject-1", reading_at(0, 70.0), at(60));
        manager.add_to_window_at("subject-1", reading_at(60, 72.0), at(60));
        let window = manager.add_to_window_at("subject-1", reading_at(30, 71.0), at(60));

        let rates: Vec<f64> = window.iter().filter_map(|r| r.heart_rate).collect();
        assert_eq!(rates, vec![70.0, 71.0, 72.0]);
    }

    #[test]
    fn test_live_clock_keeps_fresh_readings() {
        let manager = manager(300, 100);
        let reading = Reading {
            heart_rate: Some(70.0),
            ..Reading::new("subject-1", Utc::now())
        };
        assert_eq!(manager.add_to_window("subject-1", reading).len(), 1);
    }

    #[test]
    fn test_subjects_are_isolated() {
        let manager = manager(300, 100);
        manager.add_to_window_at("a", reading_at(0, 70.0), at(1));
        manager.add_to_window_at("b", reading_at(0, 80.0), at(1));
        manager.add_to_window_at("b", reading_at(1, 81.0), at(1));

        assert_eq!(manager.window_len("a"), 1);
        assert_eq!(manager.window_len("b"), 2);
        assert_eq!(manager.window_len("missing"), 0);
        assert_eq!(manager.active_subjects(), 2);
    }

    #[test]
    fn test_idle_windows_are_reclaimed() {
        let manager = manager(300, 100);
        manager.add_to_window_at("subject-1", reading_at(0, 70.0), at(0));

        assert_eq!(manager.reclaim_idle_at(at(60)), 0);
        assert_eq!(manager.reclaim_idle_at(at(31 * 60)), 1);
        assert_eq!(manager.active_subjects(), 0);
    }
}
