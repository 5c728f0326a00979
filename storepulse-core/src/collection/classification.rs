//! Maps an extension's audience size to its refresh tier.

use super::config::TrendingPolicy;
use crate::types::{PriorityClass, UpdateFrequency};

pub const HIGH_TIER_USERS: u64 = 1_000_000;
pub const MEDIUM_TIER_USERS: u64 = 100_000;

/// Tier by user count alone.
pub fn classify(user_count: u64) -> (PriorityClass, UpdateFrequency) {
    if user_count >= HIGH_TIER_USERS {
        (PriorityClass::High, UpdateFrequency::Daily)
    } else if user_count >= MEDIUM_TIER_USERS {
        (PriorityClass::Medium, UpdateFrequency::Weekly)
    } else {
        (PriorityClass::Low, UpdateFrequency::Monthly)
    }
}

/// Growth since the previous scrape clears both the relative and the absolute
/// bar.
pub fn is_trending(previous: u64, current: u64, policy: &TrendingPolicy) -> bool {
    let Some(delta) = current.checked_sub(previous) else {
        return false;
    };
    if delta == 0 || delta < policy.min_delta {
        return false;
    }
    if previous == 0 {
        return true;
    }
    (delta as f64) / (previous as f64) >= policy.growth_ratio
}

/// Tier by user count, promoted to high/daily when the extension is trending.
pub fn classify_with_trend(
    user_count: u64,
    previous: Option<u64>,
    policy: &TrendingPolicy,
) -> (PriorityClass, UpdateFrequency) {
    match previous {
        Some(prev) if is_trending(prev, user_count, policy) => {
            (PriorityClass::High, UpdateFrequency::Daily)
        }
        _ => classify(user_count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_by_user_count() {
        assert_eq!(
            classify(2_000_000),
            (PriorityClass::High, UpdateFrequency::Daily)
        );
        assert_eq!(
            classify(500_000),
            (PriorityClass::Medium, UpdateFrequency::Weekly)
        );
        assert_eq!(
            classify(5_000),
            (PriorityClass::Low, UpdateFrequency::Monthly)
        );
    }

    #[test]
    fn boundaries_are_inclusive() {
        assert_eq!(classify(1_000_000).0, PriorityClass::High);
        assert_eq!(classify(999_999).0, PriorityClass::Medium);
        assert_eq!(classify(100_000).0, PriorityClass::Medium);
        assert_eq!(classify(99_999).0, PriorityClass::Low);
        assert_eq!(classify(0).0, PriorityClass::Low);
    }

    #[test]
    fn trending_needs_both_ratio_and_delta() {
        let policy = TrendingPolicy::default();
        // +50% but only 2,500 users.
        assert!(!is_trending(5_000, 7_500, &policy));
        // +15,000 users but only 3%.
        assert!(!is_trending(500_000, 515_000, &policy));
        // +30,000 users and +60%.
        assert!(is_trending(50_000, 80_000, &policy));
        // Shrinking never trends.
        assert!(!is_trending(80_000, 50_000, &policy));
    }

    #[test]
    fn trending_extension_is_promoted() {
        let policy = TrendingPolicy::default();
        assert_eq!(
            classify_with_trend(80_000, Some(50_000), &policy),
            (PriorityClass::High, UpdateFrequency::Daily)
        );
        assert_eq!(
            classify_with_trend(80_000, None, &policy),
            (PriorityClass::Low, UpdateFrequency::Monthly)
        );
    }
}
