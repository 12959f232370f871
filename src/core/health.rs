//! Authentication health aggregation.
//!
//! Each provider gets a bounded ring buffer of classified errors. Verdicts are
//! recomputed on demand from the buffers; nothing is persisted. Notification
//! is gated per provider: once a provider's recent errors reach the threshold
//! and a notification is taken, its buffer is cleared so the next alert needs
//! a fresh run of failures.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};

use super::models::{ClassifiedError, HealthStatus, HealthVerdict, ProviderVerdict};

/// Default ring buffer capacity per provider.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10;
/// Default error count that makes a provider critical.
pub const DEFAULT_NOTIFICATION_THRESHOLD: usize = 3;
/// Default sliding window for verdicts and notifications.
pub const DEFAULT_WINDOW: Duration = Duration::minutes(5);

/// Aggregator tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSettings {
    pub capacity: usize,
    pub threshold: usize,
    pub window: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUFFER_CAPACITY,
            threshold: DEFAULT_NOTIFICATION_THRESHOLD,
            window: DEFAULT_WINDOW,
        }
    }
}

/// Per-provider ring buffers of classified errors.
#[derive(Debug)]
pub struct HealthAggregator {
    settings: HealthSettings,
    buffers: Mutex<HashMap<String, VecDeque<ClassifiedError>>>,
}

impl HealthAggregator {
    #[must_use]
    pub fn new(settings: HealthSettings) -> Self {
        Self {
            settings: HealthSettings {
                capacity: settings.capacity.max(1),
                threshold: settings.threshold.max(1),
                window: settings.window,
            },
            buffers: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn settings(&self) -> HealthSettings {
        self.settings
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<ClassifiedError>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append to the provider's buffer, evicting the oldest past capacity.
    pub fn record(&self, error: ClassifiedError) {
        let mut buffers = self.lock();
        let buffer = buffers
            .entry(error.provider.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.settings.capacity));
        buffer.push_back(error);
        while buffer.len() > self.settings.capacity {
            buffer.pop_front();
        }
    }

    /// Verdict as of now.
    #[must_use]
    pub fn verdict(&self) -> HealthVerdict {
        self.verdict_at(Utc::now())
    }

    /// Verdict over errors inside the window ending at `now`.
    ///
    /// Affected-pipeline counts are summed across errors without
    /// deduplication; repeated failures on the same pipeline raise the count.
    #[must_use]
    pub fn verdict_at(&self, now: DateTime<Utc>) -> HealthVerdict {
        let buffers = self.lock();
        let mut providers = BTreeMap::new();
        let mut all_errors = Vec::new();

        for (provider, buffer) in buffers.iter() {
            let errors: Vec<ClassifiedError> = buffer
                .iter()
                .filter(|e| self.in_window(e, now))
                .cloned()
                .collect();
            if errors.is_empty() {
                continue;
            }
            providers.insert(provider.clone(), self.provider_verdict(provider, errors.clone()));
            all_errors.extend(errors);
        }
        drop(buffers);

        all_errors.sort_by_key(|e| e.timestamp);
        let affected_pipeline_count = all_errors.iter().map(|e| e.affected_pipelines.len()).sum();

        HealthVerdict {
            status: HealthStatus::from_count(all_errors.len(), self.settings.threshold),
            errors: all_errors,
            affected_pipeline_count,
            providers,
        }
    }

    /// Whether `provider`'s recent error count has reached the threshold.
    #[must_use]
    pub fn should_notify(&self, provider: &str) -> bool {
        self.should_notify_at(provider, Utc::now())
    }

    #[must_use]
    pub fn should_notify_at(&self, provider: &str, now: DateTime<Utc>) -> bool {
        self.lock()
            .get(provider)
            .is_some_and(|buffer| self.recent_count(buffer, now) >= self.settings.threshold)
    }

    /// Check and clear in one step.
    ///
    /// Returns the provider's verdict when a notification is due and empties
    /// its buffer; concurrent callers cannot both observe the same alert.
    pub fn take_notification(&self, provider: &str) -> Option<ProviderVerdict> {
        self.take_notification_at(provider, Utc::now())
    }

    pub fn take_notification_at(&self, provider: &str, now: DateTime<Utc>) -> Option<ProviderVerdict> {
        let mut buffers = self.lock();
        let buffer = buffers.get_mut(provider)?;
        if self.recent_count(buffer, now) < self.settings.threshold {
            return None;
        }
        let errors: Vec<ClassifiedError> = buffer
            .drain(..)
            .filter(|e| self.in_window(e, now))
            .collect();
        Some(self.provider_verdict(provider, errors))
    }

    /// Current buffer contents for `provider`, oldest first.
    #[must_use]
    pub fn buffered(&self, provider: &str) -> Vec<ClassifiedError> {
        self.lock()
            .get(provider)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn in_window(&self, error: &ClassifiedError, now: DateTime<Utc>) -> bool {
        error.timestamp > now - self.settings.window && error.timestamp <= now
    }

    fn recent_count(&self, buffer: &VecDeque<ClassifiedError>, now: DateTime<Utc>) -> usize {
        buffer.iter().filter(|e| self.in_window(e, now)).count()
    }

    fn provider_verdict(&self, provider: &str, errors: Vec<ClassifiedError>) -> ProviderVerdict {
        ProviderVerdict {
            provider: provider.to_string(),
            status: HealthStatus::from_count(errors.len(), self.settings.threshold),
            affected_pipeline_count: errors.iter().map(|e| e.affected_pipelines.len()).sum(),
            errors,
        }
    }
}

impl Default for HealthAggregator {
    fn default() -> Self {
        Self::new(HealthSettings::default())
    }
}
