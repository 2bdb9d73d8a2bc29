//! Composite health score.
//!
//! A deterministic function of repository and package signals. The only
//! time dependence is the recency bonus, computed from the explicit `now`
//! carried in [`HealthSignals`].
//!
//! | Signal | Contribution |
//! |--------|--------------|
//! | base | 20 |
//! | stars | `min(20, 5·log10(stars+1))` |
//! | forks | `min(10, 4·log10(forks+1))` |
//! | README / docs | 10 |
//! | license | 10 |
//! | tests | 10 |
//! | last activity | 15 (≤30d), 10 (≤90d), 5 (≤180d), 2 (≤365d) |
//! | open issues | `max(0, 5 − 2·log10(issues+1))` |

use chrono::{DateTime, Utc};

use crate::models::Server;

pub const MIN_SCORE: i64 = 0;
pub const MAX_SCORE: i64 = 100;
const BASE_SCORE: f64 = 20.0;

/// Inputs to [`score`].
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSignals {
    pub stars: Option<i64>,
    pub forks: Option<i64>,
    pub has_readme: bool,
    pub has_license: bool,
    pub has_tests: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub open_issues: Option<i64>,
    pub now: DateTime<Utc>,
}

impl HealthSignals {
    /// Signals stored on a server, evaluated at `now`.
    pub fn from_server(server: &Server, now: DateTime<Utc>) -> Self {
        Self {
            stars: server.stars,
            forks: server.forks,
            has_readme: server.has_readme,
            has_license: server.has_license,
            has_tests: server.has_tests,
            last_activity: server.last_activity_at,
            open_issues: server.open_issues,
            now,
        }
    }
}

/// Compute a score in `[0, 100]`.
pub fn score(signals: &HealthSignals) -> i64 {
    let mut total = BASE_SCORE;

    total += log_bonus(signals.stars, 5.0, 20.0);
    total += log_bonus(signals.forks, 4.0, 10.0);

    if signals.has_readme {
        total += 10.0;
    }
    if signals.has_license {
        total += 10.0;
    }
    if signals.has_tests {
        total += 10.0;
    }

    total += recency_bonus(signals.last_activity, signals.now);

    if let Some(issues) = signals.open_issues {
        let issues = issues.max(0) as f64;
        total += (5.0 - 2.0 * (issues + 1.0).log10()).max(0.0);
    }

    clamp(total.round() as i64)
}

/// Clamp any value into the valid score range.
pub fn clamp(value: i64) -> i64 {
    value.clamp(MIN_SCORE, MAX_SCORE)
}

fn log_bonus(count: Option<i64>, weight: f64, cap: f64) -> f64 {
    match count {
        Some(n) if n > 0 => (weight * ((n as f64) + 1.0).log10()).min(cap),
        _ => 0.0,
    }
}

fn recency_bonus(last_activity: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(last) = last_activity else {
        return 0.0;
    };
    let days = (now - last).num_days().max(0);
    match days {
        0..=30 => 15.0,
        31..=90 => 10.0,
        91..=180 => 5.0,
        181..=365 => 2.0,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn empty() -> HealthSignals {
        HealthSignals {
            stars: None,
            forks: None,
            has_readme: false,
            has_license: false,
            has_tests: false,
            last_activity: None,
            open_issues: None,
            now: now(),
        }
    }

    #[test]
    fn test_base_score() {
        assert_eq!(score(&empty()), 20);
    }

    #[test]
    fn test_maximal_signals_capped_at_100() {
        let s = HealthSignals {
            stars: Some(10_000_000),
            forks: Some(10_000_000),
            has_readme: true,
            has_license: true,
            has_tests: true,
            last_activity: Some(now()),
            open_issues: Some(0),
            now: now(),
        };
        assert_eq!(score(&s), 100);
    }

    #[test]
    fn test_flags_add_ten_each() {
        let mut s = empty();
        s.has_readme = true;
        assert_eq!(score(&s), 30);
        s.has_license = true;
        s.has_tests = true;
        assert_eq!(score(&s), 50);
    }

    #[test]
    fn test_recency_steps() {
        let mut s = empty();
        s.last_activity = Some(now() - Duration::days(10));
        assert_eq!(score(&s), 35);
        s.last_activity = Some(now() - Duration::days(60));
        assert_eq!(score(&s), 30);
        s.last_activity = Some(now() - Duration::days(150));
        assert_eq!(score(&s), 25);
        s.last_activity = Some(now() - Duration::days(300));
        assert_eq!(score(&s), 22);
        s.last_activity = Some(now() - Duration::days(1000));
        assert_eq!(score(&s), 20);
        // future timestamps count as fresh, never negative
        s.last_activity = Some(now() + Duration::days(5));
        assert_eq!(score(&s), 35);
    }

    #[test]
    fn test_issues_inversely_weighted() {
        let mut s = empty();
        s.open_issues = Some(0);
        let none = score(&s);
        s.open_issues = Some(9);
        let some = score(&s);
        s.open_issues = Some(10_000);
        let many = score(&s);
        assert_eq!(none, 25);
        assert!(some < none);
        assert_eq!(many, 20);
    }

    #[test]
    fn test_negative_counts_do_not_reduce_score() {
        let mut s = empty();
        s.stars = Some(-50);
        s.forks = Some(-1);
        s.open_issues = Some(-3);
        assert_eq!(score(&s), 25);
    }

    #[test]
    fn test_bounded_and_pure_over_grid() {
        let counts = [None, Some(0), Some(1), Some(42), Some(1_000), Some(i64::MAX)];
        for stars in counts {
            for issues in counts {
                for flag in [false, true] {
                    let s = HealthSignals {
                        stars,
                        forks: stars,
                        has_readme: flag,
                        has_license: !flag,
                        has_tests: flag,
                        last_activity: Some(now() - Duration::days(45)),
                        open_issues: issues,
                        now: now(),
                    };
                    let a = score(&s);
                    assert!((MIN_SCORE..=MAX_SCORE).contains(&a));
                    assert_eq!(a, score(&s.clone()));
                }
            }
        }
    }
}
