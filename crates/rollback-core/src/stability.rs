//! Stability analysis
//!
//! Confirms that a replica shortage is persistent before any attempt is
//! created. One analyzer exists per monitored app and is owned by that app's
//! monitor task.

use crate::types::{AppTarget, CorrelationId, HealthSample, SampleWindow};
use chrono::{DateTime, Utc};

/// Signal produced by [`StabilityAnalyzer::observe`]
#[derive(Debug, Clone, PartialEq)]
pub enum StabilitySignal {
    /// First shortage of a new episode
    Detected {
        correlation_id: CorrelationId,
        sample: HealthSample,
    },
    /// Window now holds three consecutive shortages
    Confirmed {
        correlation_id: CorrelationId,
        samples: SampleWindow,
    },
}

#[derive(Debug, Clone, Copy)]
struct Episode {
    correlation_id: CorrelationId,
    confirmed: bool,
}

/// Per-app persistence detector
#[derive(Debug)]
pub struct StabilityAnalyzer {
    app: AppTarget,
    window: SampleWindow,
    newest: Option<DateTime<Utc>>,
    episode: Option<Episode>,
}

impl StabilityAnalyzer {
    #[must_use]
    pub fn new(app: AppTarget) -> Self {
        Self {
            app,
            window: SampleWindow::new(),
            newest: None,
            episode: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn app(&self) -> &AppTarget {
        &self.app
    }

    #[inline]
    #[must_use]
    pub fn window(&self) -> &SampleWindow {
        &self.window
    }

    /// Feed one raw sample
    ///
    /// Samples not newer than the newest seen are dropped, which makes the
    /// analyzer idempotent under duplicate and out-of-order delivery.
    pub fn observe(&mut self, sample: HealthSample) -> Option<StabilitySignal> {
        if self.newest.is_some_and(|newest| sample.timestamp <= newest) {
            tracing::debug!(app = %self.app.name, timestamp = %sample.timestamp, "dropping duplicate or out-of-order sample");
            return None;
        }
        self.newest = Some(sample.timestamp);
        self.window.push(sample);

        if !sample.is_shortage() {
            if let Some(episode) = self.episode.take() {
                tracing::info!(app = %self.app.name, correlation_id = %episode.correlation_id, "shortage episode ended");
            }
            return None;
        }

        match self.episode {
            None => {
                let correlation_id = CorrelationId::new();
                let confirmed = self.window.is_persistently_short();
                self.episode = Some(Episode { correlation_id, confirmed });
                tracing::info!(
                    app = %self.app.name,
                    %correlation_id,
                    available = sample.available,
                    desired = sample.desired,
                    "replica shortage detected"
                );
                if confirmed {
                    Some(self.confirmed(correlation_id))
                } else {
                    Some(StabilitySignal::Detected { correlation_id, sample })
                }
            }
            // One confirmation per episode. An attempt reset while the app is
            // still short gets no successor until a healthy sample ends the
            // episode; an operator restarts the search by hand.
            Some(Episode { confirmed: true, .. }) => None,
            Some(Episode { correlation_id, confirmed: false }) => {
                if self.window.is_persistently_short() {
                    self.episode = Some(Episode { correlation_id, confirmed: true });
                    Some(self.confirmed(correlation_id))
                } else {
                    None
                }
            }
        }
    }

    /// Re-arm an episode whose confirmation could not be delivered; the next
    /// shortage sample of the same episode confirms it again
    pub fn retract_confirmation(&mut self, correlation_id: CorrelationId) {
        if let Some(episode) = self.episode.as_mut().filter(|e| e.correlation_id == correlation_id) {
            episode.confirmed = false;
            tracing::info!(app = %self.app.name, %correlation_id, "confirmation retracted; episode re-armed");
        }
    }

    fn confirmed(&self, correlation_id: CorrelationId) -> StabilitySignal {
        tracing::warn!(app = %self.app.name, %correlation_id, "persistent degradation confirmed");
        StabilitySignal::Confirmed {
            correlation_id,
            samples: self.window.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Environment;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn app() -> AppTarget {
        AppTarget {
            name: "checkout".to_string(),
            environment: Environment::Staging,
            repo: "acme/deploy".to_string(),
            branch: "main".to_string(),
            namespace: "shop".to_string(),
            workload: "checkout".to_string(),
        }
    }

    fn sample(secs: i64, available: u32) -> HealthSample {
        HealthSample {
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            available,
            desired: 3,
        }
    }

    fn confirmations(analyzer: &mut StabilityAnalyzer, samples: &[HealthSample]) -> usize {
        samples
            .iter()
            .filter_map(|s| analyzer.observe(*s))
            .filter(|s| matches!(s, StabilitySignal::Confirmed { .. }))
            .count()
    }

    #[test]
    fn three_bad_samples_confirm() {
        let mut analyzer = StabilityAnalyzer::new(app());
        assert!(matches!(analyzer.observe(sample(0, 1)), Some(StabilitySignal::Detected { .. })));
        assert_eq!(analyzer.observe(sample(10, 1)), None);
        let signal = analyzer.observe(sample(20, 1));
        assert!(matches!(signal, Some(StabilitySignal::Confirmed { ref samples, .. }) if samples.len() == 3));
    }

    #[test]
    fn good_sample_in_between_prevents_confirmation() {
        let mut analyzer = StabilityAnalyzer::new(app());
        let n = confirmations(&mut analyzer, &[sample(0, 1), sample(10, 3), sample(20, 1)]);
        assert_eq!(n, 0);
    }

    #[test]
    fn detected_and_confirmed_share_correlation_id() {
        let mut analyzer = StabilityAnalyzer::new(app());
        let Some(StabilitySignal::Detected { correlation_id: first, .. }) = analyzer.observe(sample(0, 1)) else {
            panic!("expected detection");
        };
        analyzer.observe(sample(10, 1));
        let Some(StabilitySignal::Confirmed { correlation_id, .. }) = analyzer.observe(sample(20, 1)) else {
            panic!("expected confirmation");
        };
        assert_eq!(first, correlation_id);
    }

    #[test]
    fn duplicates_and_out_of_order_are_dropped() {
        let mut analyzer = StabilityAnalyzer::new(app());
        analyzer.observe(sample(10, 1));
        assert_eq!(analyzer.observe(sample(10, 1)), None);
        assert_eq!(analyzer.observe(sample(5, 1)), None);
        assert_eq!(analyzer.window().len(), 1);
    }

    #[test]
    fn confirms_once_per_episode() {
        let mut analyzer = StabilityAnalyzer::new(app());
        let bad: Vec<_> = (0..6).map(|i| sample(i * 10, 1)).collect();
        assert_eq!(confirmations(&mut analyzer, &bad), 1);

        // recovery then a new episode
        analyzer.observe(sample(100, 3));
        let again: Vec<_> = (11..14).map(|i| sample(i * 10, 0)).collect();
        assert_eq!(confirmations(&mut analyzer, &again), 1);
    }

    #[test]
    fn retracted_confirmation_fires_again_with_same_id() {
        let mut analyzer = StabilityAnalyzer::new(app());
        analyzer.observe(sample(0, 1));
        analyzer.observe(sample(10, 1));
        let Some(StabilitySignal::Confirmed { correlation_id, .. }) = analyzer.observe(sample(20, 1)) else {
            panic!("expected confirmation");
        };
        assert_eq!(analyzer.observe(sample(30, 1)), None);

        analyzer.retract_confirmation(correlation_id);
        let Some(StabilitySignal::Confirmed { correlation_id: again, .. }) = analyzer.observe(sample(40, 1)) else {
            panic!("expected confirmation after retraction");
        };
        assert_eq!(again, correlation_id);
        assert_eq!(analyzer.observe(sample(50, 1)), None);
    }

    #[test]
    fn retraction_ignores_other_episodes() {
        let mut analyzer = StabilityAnalyzer::new(app());
        let bad: Vec<_> = (0..3).map(|i| sample(i * 10, 1)).collect();
        assert_eq!(confirmations(&mut analyzer, &bad), 1);

        analyzer.retract_confirmation(CorrelationId::new());
        assert_eq!(analyzer.observe(sample(30, 1)), None);
    }

    #[test]
    fn still_short_after_confirmation_stays_silent() {
        let mut analyzer = StabilityAnalyzer::new(app());
        let bad: Vec<_> = (0..30).map(|i| sample(i * 10, 1)).collect();
        assert_eq!(confirmations(&mut analyzer, &bad), 1);
    }

    proptest! {
        #[test]
        fn fewer_than_three_samples_never_confirm(avail in proptest::collection::vec(0u32..=3, 0..3)) {
            let mut analyzer = StabilityAnalyzer::new(app());
            let samples: Vec<_> = avail.iter().enumerate().map(|(i, a)| sample(i as i64 * 10, *a)).collect();
            prop_assert_eq!(confirmations(&mut analyzer, &samples), 0);
        }

        #[test]
        fn confirmation_implies_three_recent_shortages(avail in proptest::collection::vec(0u32..=3, 0..40)) {
            let mut analyzer = StabilityAnalyzer::new(app());
            let mut history = Vec::new();
            for (i, a) in avail.iter().enumerate() {
                let s = sample(i as i64 * 10, *a);
                history.push(s);
                if let Some(StabilitySignal::Confirmed { .. }) = analyzer.observe(s) {
                    prop_assert!(history.len() >= 3);
                    prop_assert!(history[history.len() - 3..].iter().all(HealthSample::is_shortage));
                }
            }
        }

        #[test]
        fn three_recent_shortages_imply_confirmed_episode(avail in proptest::collection::vec(0u32..=3, 3..40)) {
            let mut analyzer = StabilityAnalyzer::new(app());
            let mut confirmed_in_episode = false;
            for (i, a) in avail.iter().enumerate() {
                let s = sample(i as i64 * 10, *a);
                if !s.is_shortage() {
                    confirmed_in_episode = false;
                }
                if let Some(StabilitySignal::Confirmed { .. }) = analyzer.observe(s) {
                    confirmed_in_episode = true;
                }
                if analyzer.window().is_persistently_short() {
                    prop_assert!(confirmed_in_episode);
                }
            }
        }
    }
}
