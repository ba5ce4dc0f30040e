use std::time::Duration;

use regex::Regex;

use crate::error::{RecoveryError, Result};
use crate::types::{ErrorKind, ErrorSeverity, RecoveryAction, TaskError};

/// How to react to one family of errors.
#[derive(Debug, Clone)]
pub struct RecoveryStrategy {
    pub name: String,
    /// Typed kinds handled by this strategy. Checked before `pattern`.
    pub kinds: Vec<ErrorKind>,
    /// Case-insensitive fallback match over `"{kind} {message}"`.
    pub pattern: Option<Regex>,
    pub severity: ErrorSeverity,
    /// Uses of each repeatable action before escalating to the next one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    /// Tried in order; escalation moves one step down the list.
    pub actions: Vec<RecoveryAction>,
}

impl RecoveryStrategy {
    pub fn new(name: impl Into<String>, severity: ErrorSeverity) -> Self {
        Self {
            name: name.into(),
            kinds: Vec::new(),
            pattern: None,
            severity,
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            actions: Vec::new(),
        }
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// Compiles `pattern` case-insensitively.
    pub fn pattern(mut self, pattern: &str) -> Result<Self> {
        self.pattern = Some(Regex::new(&format!("(?i){pattern}"))?);
        Ok(self)
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn backoff(mut self, initial_delay: Duration, multiplier: f64) -> Self {
        self.initial_delay = initial_delay;
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn actions(mut self, actions: impl IntoIterator<Item = RecoveryAction>) -> Result<Self> {
        self.actions = actions.into_iter().collect();
        if self.actions.is_empty() {
            return Err(RecoveryError::NoActions { name: self.name });
        }
        Ok(self)
    }

    /// `initial_delay * multiplier^retry_count`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(retry_count as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    fn matches_kind(&self, error: &TaskError) -> bool {
        error.kind != ErrorKind::Unclassified && self.kinds.contains(&error.kind)
    }

    fn matches_text(&self, text: &str) -> bool {
        self.pattern.as_ref().is_some_and(|re| re.is_match(text))
    }
}

/// The built-in strategy table, in priority order.
pub fn default_strategies() -> Vec<RecoveryStrategy> {
    build_default_strategies().unwrap_or_else(|e| {
        tracing::error!("built-in recovery strategies failed to build: {e}");
        Vec::new()
    })
}

fn build_default_strategies() -> Result<Vec<RecoveryStrategy>> {
    Ok(vec![
        RecoveryStrategy::new("network", ErrorSeverity::Medium)
            .kinds([ErrorKind::Network, ErrorKind::Timeout])
            .pattern(r"(timeout|connection|network|api)")?
            .max_retries(3)
            .backoff(Duration::from_secs(5), 2.0)
            .actions([
                RecoveryAction::RetryWithBackoff,
                RecoveryAction::FallbackApproach,
            ])?,
        RecoveryStrategy::new("rate_limit", ErrorSeverity::Medium)
            .kinds([ErrorKind::RateLimited])
            .pattern(r"rate.?limit|too.?many.?requests")?
            .max_retries(5)
            .backoff(Duration::from_secs(60), 3.0)
            .actions([RecoveryAction::RetryWithBackoff])?,
        RecoveryStrategy::new("resource_exhausted", ErrorSeverity::Critical)
            .kinds([ErrorKind::ResourceExhausted])
            .pattern(r"out.?of.?memory|disk.?full|resource.?exhausted")?
            .max_retries(1)
            .actions([RecoveryAction::GracefulTerminate])?,
        RecoveryStrategy::new("generation", ErrorSeverity::Medium)
            .kinds([ErrorKind::Generation, ErrorKind::Validation])
            .pattern(r"generation.?failed|validation.?error|syntax.?error")?
            .max_retries(2)
            .actions([
                RecoveryAction::FallbackApproach,
                RecoveryAction::SkipAndContinue,
            ])?,
        RecoveryStrategy::new("auth", ErrorSeverity::High)
            .kinds([ErrorKind::Auth, ErrorKind::Permission])
            .pattern(r"auth|permission|unauthorized|forbidden")?
            .max_retries(1)
            .actions([RecoveryAction::GracefulTerminate])?,
    ])
}

/// Ordered strategy table.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    strategies: Vec<RecoveryStrategy>,
}

impl Classifier {
    pub fn new(strategies: Vec<RecoveryStrategy>) -> Self {
        Self { strategies }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_strategies())
    }

    /// Appended after existing entries, so earlier strategies keep priority.
    pub fn push(&mut self, strategy: RecoveryStrategy) {
        self.strategies.push(strategy);
    }

    pub fn strategies(&self) -> &[RecoveryStrategy] {
        &self.strategies
    }

    /// Typed kind match across the whole table first, then the first pattern
    /// match. `None` means the error is unclassified.
    pub fn classify(&self, error: &TaskError) -> Option<&RecoveryStrategy> {
        if let Some(s) = self.strategies.iter().find(|s| s.matches_kind(error)) {
            return Some(s);
        }
        let text = error.match_text();
        self.strategies.iter().find(|s| s.matches_text(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(error: TaskError) -> Option<String> {
        Classifier::with_defaults()
            .classify(&error)
            .map(|s| s.name.clone())
    }

    #[test]
    fn defaults_build() {
        let names: Vec<String> = default_strategies().into_iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            ["network", "rate_limit", "resource_exhausted", "generation", "auth"]
        );
    }

    #[test]
    fn typed_kind_wins_over_message() {
        // message mentions "connection" but the producer said rate limited
        let e = TaskError::new(ErrorKind::RateLimited, "connection throttled");
        assert_eq!(classify(e).as_deref(), Some("rate_limit"));
    }

    #[test]
    fn untyped_errors_fall_back_to_patterns() {
        let cases = [
            ("Connection reset by peer", "network"),
            ("HTTP 429 Too Many Requests", "rate_limit"),
            ("Out of memory while allocating", "resource_exhausted"),
            ("code generation failed", "generation"),
            ("403 Forbidden", "auth"),
        ];
        for (msg, expected) in cases {
            assert_eq!(
                classify(TaskError::unclassified(msg)).as_deref(),
                Some(expected),
                "{msg}"
            );
        }
    }

    #[test]
    fn unmatched_error_is_unclassified() {
        assert!(classify(TaskError::unclassified("division by zero")).is_none());
    }

    #[test]
    fn backoff_grows_geometrically() {
        let s = &default_strategies()[0];
        assert_eq!(s.backoff_delay(0), Duration::from_secs(5));
        assert_eq!(s.backoff_delay(1), Duration::from_secs(10));
        assert_eq!(s.backoff_delay(2), Duration::from_secs(20));
    }

    #[test]
    fn strategy_without_actions_is_rejected() {
        let err = RecoveryStrategy::new("empty", ErrorSeverity::Low)
            .actions([])
            .unwrap_err();
        assert!(matches!(err, RecoveryError::NoActions { .. }));
    }

    #[test]
    fn custom_strategy_is_appended() {
        let mut c = Classifier::with_defaults();
        c.push(
            RecoveryStrategy::new("disk_quota", ErrorSeverity::High)
                .pattern("quota exceeded")
                .unwrap()
                .actions([RecoveryAction::SkipAndContinue])
                .unwrap(),
        );
        let hit = c.classify(&TaskError::unclassified("Quota Exceeded for bucket"));
        assert_eq!(hit.map(|s| s.name.as_str()), Some("disk_quota"));
    }
}
