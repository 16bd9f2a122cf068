//! Session timeout arithmetic.
//!
//! Pure functions over explicit clocks so the boundary behavior is
//! testable without waiting on real time.
//!
//! ```text
//! base        = autoRenew ? lastActivity : createdAt
//! candidate   = base + timeoutMinutes
//! maxBoundary = createdAt + maxDurationMinutes
//! expiresAt   = min(candidate, maxBoundary)
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{
    MAX_DURATION_CEILING_MINUTES, MAX_TIMEOUT_MINUTES, MIN_TIMEOUT_MINUTES, SessionDefaults,
};
use crate::validate::clamp_i64;

/// Effective per-session timeout configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    pub timeout_minutes: i64,
    pub auto_renew: bool,
    pub max_duration_minutes: i64,
    pub warning_threshold_minutes: i64,
}

impl TimeoutConfig {
    pub fn from_defaults(defaults: &SessionDefaults) -> Self {
        Self {
            timeout_minutes: defaults.timeout_minutes,
            auto_renew: defaults.auto_renew,
            max_duration_minutes: defaults.max_duration_minutes,
            warning_threshold_minutes: defaults.warning_threshold_minutes,
        }
    }

    /// Re-establish the invariants after any merge: timeout within design
    /// bounds, max duration at least the timeout, warning threshold ≥ 1.
    pub fn normalized(mut self) -> Self {
        self.timeout_minutes = self
            .timeout_minutes
            .clamp(MIN_TIMEOUT_MINUTES, MAX_TIMEOUT_MINUTES);
        self.max_duration_minutes = self
            .max_duration_minutes
            .clamp(self.timeout_minutes, MAX_DURATION_CEILING_MINUTES);
        self.warning_threshold_minutes = self.warning_threshold_minutes.max(1);
        self
    }
}

/// Client-supplied partial overrides. Numeric fields arrive as raw JSON so
/// clamp-and-default parsing can absorb junk input.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfigPatch {
    #[serde(default)]
    pub timeout_minutes: Option<Value>,
    #[serde(default)]
    pub auto_renew: Option<bool>,
    #[serde(default)]
    pub max_duration_minutes: Option<Value>,
    #[serde(default)]
    pub warning_threshold_minutes: Option<Value>,
}

impl TimeoutConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.timeout_minutes.is_none()
            && self.auto_renew.is_none()
            && self.max_duration_minutes.is_none()
            && self.warning_threshold_minutes.is_none()
    }
}

/// Merge precedence: request overrides agent settings, which override the
/// global defaults. The result is normalized.
pub fn merge_config(
    request: Option<&TimeoutConfigPatch>,
    agent: Option<&TimeoutConfig>,
    defaults: &SessionDefaults,
) -> TimeoutConfig {
    let base = agent
        .copied()
        .unwrap_or_else(|| TimeoutConfig::from_defaults(defaults));

    let Some(patch) = request else {
        return base.normalized();
    };

    let timeout_minutes = clamp_i64(
        "timeoutMinutes",
        patch.timeout_minutes.as_ref(),
        base.timeout_minutes,
        MIN_TIMEOUT_MINUTES,
        MAX_TIMEOUT_MINUTES,
    );

    TimeoutConfig {
        timeout_minutes,
        auto_renew: patch.auto_renew.unwrap_or(base.auto_renew),
        max_duration_minutes: clamp_i64(
            "maxDurationMinutes",
            patch.max_duration_minutes.as_ref(),
            base.max_duration_minutes,
            MIN_TIMEOUT_MINUTES,
            MAX_DURATION_CEILING_MINUTES,
        ),
        warning_threshold_minutes: clamp_i64(
            "warningThresholdMinutes",
            patch.warning_threshold_minutes.as_ref(),
            base.warning_threshold_minutes,
            1,
            MAX_TIMEOUT_MINUTES,
        ),
    }
    .normalized()
}

/// The authoritative expiry computation.
pub fn compute_expiry(
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    config: &TimeoutConfig,
) -> DateTime<Utc> {
    let base = if config.auto_renew {
        last_activity
    } else {
        created_at
    };
    let candidate = base + Duration::minutes(config.timeout_minutes);
    let max_boundary = created_at + Duration::minutes(config.max_duration_minutes);
    candidate.min(max_boundary)
}

/// Renewal is possible only while the session is inside its hard duration
/// ceiling.
pub fn can_renew(created_at: DateTime<Utc>, now: DateTime<Utc>, config: &TimeoutConfig) -> bool {
    now - created_at < Duration::minutes(config.max_duration_minutes)
}

pub fn time_remaining_ms(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expires_at - now).num_milliseconds().max(0)
}

pub fn is_near_expiration(
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    config: &TimeoutConfig,
) -> bool {
    expires_at - now <= Duration::minutes(config.warning_threshold_minutes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn defaults() -> SessionDefaults {
        SessionDefaults::default()
    }

    fn patch(timeout: Value) -> TimeoutConfigPatch {
        TimeoutConfigPatch {
            timeout_minutes: Some(timeout),
            ..TimeoutConfigPatch::default()
        }
    }

    #[test]
    fn merge_precedence_request_over_agent_over_defaults() {
        let agent = TimeoutConfig {
            timeout_minutes: 60,
            auto_renew: false,
            max_duration_minutes: 240,
            warning_threshold_minutes: 10,
        };

        let merged = merge_config(Some(&patch(json!(90))), Some(&agent), &defaults());
        assert_eq!(merged.timeout_minutes, 90);
        assert!(!merged.auto_renew);
        assert_eq!(merged.max_duration_minutes, 240);

        let agent_only = merge_config(None, Some(&agent), &defaults());
        assert_eq!(agent_only.timeout_minutes, 60);

        let default_only = merge_config(None, None, &defaults());
        assert_eq!(default_only.timeout_minutes, defaults().timeout_minutes);
    }

    #[test]
    fn boundary_clamping() {
        let low = merge_config(
            Some(&patch(json!(MIN_TIMEOUT_MINUTES - 1))),
            None,
            &defaults(),
        );
        assert_eq!(low.timeout_minutes, MIN_TIMEOUT_MINUTES);

        let high = merge_config(
            Some(&patch(json!(MAX_TIMEOUT_MINUTES + 1))),
            None,
            &defaults(),
        );
        assert_eq!(high.timeout_minutes, MAX_TIMEOUT_MINUTES);
    }

    #[test]
    fn junk_input_falls_back_to_default() {
        for junk in [json!("NaN"), json!(""), json!("1,000")] {
            let merged = merge_config(Some(&patch(junk.clone())), None, &defaults());
            assert_eq!(merged.timeout_minutes, defaults().timeout_minutes, "input: {junk}");
        }
    }

    #[test]
    fn max_duration_never_below_timeout() {
        let merged = merge_config(
            Some(&TimeoutConfigPatch {
                timeout_minutes: Some(json!(120)),
                max_duration_minutes: Some(json!(30)),
                ..TimeoutConfigPatch::default()
            }),
            None,
            &defaults(),
        );
        assert!(merged.max_duration_minutes >= merged.timeout_minutes);
    }

    #[test]
    fn expiry_uses_created_at_without_auto_renew() {
        let created = Utc::now();
        let active = created + Duration::minutes(20);
        let config = TimeoutConfig {
            timeout_minutes: 30,
            auto_renew: false,
            max_duration_minutes: 720,
            warning_threshold_minutes: 5,
        };
        assert_eq!(
            compute_expiry(created, active, &config),
            created + Duration::minutes(30)
        );
    }

    #[test]
    fn expiry_follows_activity_with_auto_renew() {
        let created = Utc::now();
        let active = created + Duration::minutes(20);
        let config = TimeoutConfig {
            timeout_minutes: 30,
            auto_renew: true,
            max_duration_minutes: 720,
            warning_threshold_minutes: 5,
        };
        assert_eq!(
            compute_expiry(created, active, &config),
            active + Duration::minutes(30)
        );
    }

    #[test]
    fn expiry_never_passes_max_boundary() {
        let created = Utc::now();
        let active = created + Duration::minutes(700);
        let config = TimeoutConfig {
            timeout_minutes: 60,
            auto_renew: true,
            max_duration_minutes: 720,
            warning_threshold_minutes: 5,
        };
        assert_eq!(
            compute_expiry(created, active, &config),
            created + Duration::minutes(720)
        );
    }

    #[test]
    fn renewal_blocked_at_ceiling() {
        let created = Utc::now();
        let config = TimeoutConfig {
            timeout_minutes: 30,
            auto_renew: true,
            max_duration_minutes: 720,
            warning_threshold_minutes: 5,
        };
        assert!(can_renew(created, created + Duration::minutes(719), &config));
        assert!(!can_renew(created, created + Duration::minutes(720), &config));
    }

    #[test]
    fn near_expiration_window() {
        let now = Utc::now();
        let config = TimeoutConfig {
            timeout_minutes: 30,
            auto_renew: false,
            max_duration_minutes: 720,
            warning_threshold_minutes: 5,
        };
        assert!(is_near_expiration(now + Duration::minutes(4), now, &config));
        assert!(!is_near_expiration(now + Duration::minutes(6), now, &config));
        assert_eq!(time_remaining_ms(now - Duration::minutes(1), now), 0);
    }

    proptest! {
        #[test]
        fn merged_config_always_satisfies_invariants(
            timeout in any::<i64>(),
            max_duration in any::<i64>(),
            warning in any::<i64>(),
        ) {
            let merged = merge_config(
                Some(&TimeoutConfigPatch {
                    timeout_minutes: Some(json!(timeout)),
                    max_duration_minutes: Some(json!(max_duration)),
                    warning_threshold_minutes: Some(json!(warning)),
                    ..TimeoutConfigPatch::default()
                }),
                None,
                &defaults(),
            );
            prop_assert!(merged.timeout_minutes >= MIN_TIMEOUT_MINUTES);
            prop_assert!(merged.timeout_minutes <= MAX_TIMEOUT_MINUTES);
            prop_assert!(merged.max_duration_minutes >= merged.timeout_minutes);
            prop_assert!(merged.warning_threshold_minutes >= 1);
        }

        #[test]
        fn expiry_bounded_by_max_duration(
            timeout in MIN_TIMEOUT_MINUTES..=MAX_TIMEOUT_MINUTES,
            activity_offset in 0i64..=5000,
            auto_renew in any::<bool>(),
        ) {
            let created = Utc::now();
            let config = TimeoutConfig {
                timeout_minutes: timeout,
                auto_renew,
                max_duration_minutes: 720.max(timeout),
                warning_threshold_minutes: 5,
            }.normalized();
            let expiry = compute_expiry(created, created + Duration::minutes(activity_offset), &config);
            prop_assert!(expiry <= created + Duration::minutes(config.max_duration_minutes));
        }
    }
}
