use crate::types::{Descriptor, MatchResult, ReferenceProfile};

/// Acceptance threshold of the reference extractor's 128-d descriptors.
pub const DEFAULT_ACCEPT_THRESHOLD: f32 = 0.6;

/// Strategy for comparing a query descriptor against the enrolled profiles.
pub trait Matcher: Send + Sync {
    fn find_best_match(
        &self,
        query: &Descriptor,
        profiles: &[ReferenceProfile],
        threshold: f32,
    ) -> Option<MatchResult>;
}

/// Nearest-neighbour matcher over Euclidean distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn find_best_match(
        &self,
        query: &Descriptor,
        profiles: &[ReferenceProfile],
        threshold: f32,
    ) -> Option<MatchResult> {
        find_best_match(query, profiles, threshold)
    }
}

/// Find the enrolled profile closest to `query`.
///
/// Ties go to the earliest enrolled profile. The result is returned only when
/// its distance is strictly below `threshold`. Profiles at a NaN distance are
/// never candidates.
pub fn find_best_match(
    query: &Descriptor,
    profiles: &[ReferenceProfile],
    threshold: f32,
) -> Option<MatchResult> {
    let mut best: Option<(usize, f32)> = None;

    for (i, profile) in profiles.iter().enumerate() {
        let distance = query.euclidean_distance(&profile.descriptor);
        if distance.is_nan() {
            continue;
        }
        let closer = match best {
            None => true,
            Some((_, best_distance)) => distance < best_distance,
        };
        if closer {
            best = Some((i, distance));
        }
    }

    match best {
        Some((idx, distance)) if distance < threshold => Some(MatchResult {
            profile: profiles[idx].clone(),
            distance,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, values: &[f32]) -> ReferenceProfile {
        ReferenceProfile::from_source(id, Descriptor::new(values.to_vec()))
    }

    #[test]
    fn test_exact_descriptor_matches_itself() {
        let profiles = vec![
            profile("jane_doe", &[0.1, 0.2, 0.3]),
            profile("john_roe", &[0.9, 0.8, 0.7]),
        ];
        for p in &profiles {
            let result = find_best_match(&p.descriptor, &profiles, 0.01).unwrap();
            assert_eq!(result.profile.id, p.id);
            assert_eq!(result.distance, 0.0);
        }
    }

    #[test]
    fn test_no_match_when_all_beyond_threshold() {
        let profiles = vec![profile("a", &[1.0, 0.0]), profile("b", &[0.0, 1.0])];
        let query = Descriptor::new(vec![-1.0, -1.0]);
        assert!(find_best_match(&query, &profiles, 0.6).is_none());
    }

    #[test]
    fn test_threshold_is_strict() {
        let profiles = vec![profile("a", &[0.0, 0.0]), profile("b", &[0.0, 0.0])];
        let query = Descriptor::new(vec![0.5, 0.0]);
        assert!(find_best_match(&query, &profiles, 0.5).is_none());
        assert!(find_best_match(&query, &profiles, 0.51).is_some());
    }

    #[test]
    fn test_closest_profile_wins() {
        let profiles = vec![
            profile("far", &[0.5, 0.0]),
            profile("near", &[0.1, 0.0]),
            profile("mid", &[0.3, 0.0]),
        ];
        let query = Descriptor::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher.find_best_match(&query, &profiles, 0.6).unwrap();
        assert_eq!(result.profile.id, "near");
        assert!((result.distance - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_tie_goes_to_first_enrolled() {
        let profiles = vec![
            profile("first", &[0.2, 0.0]),
            profile("second", &[-0.2, 0.0]),
        ];
        let query = Descriptor::new(vec![0.0, 0.0]);
        for _ in 0..10 {
            let result = find_best_match(&query, &profiles, 0.6).unwrap();
            assert_eq!(result.profile.id, "first");
        }
    }

    #[test]
    fn test_empty_profiles() {
        let query = Descriptor::new(vec![0.0, 0.0]);
        assert!(find_best_match(&query, &[], 0.6).is_none());
    }

    #[test]
    fn test_dimension_mismatch_never_matches() {
        let profiles = vec![profile("a", &[0.0, 0.0, 0.0])];
        let query = Descriptor::new(vec![0.0, 0.0]);
        assert!(find_best_match(&query, &profiles, f32::MAX).is_none());
    }

    #[test]
    fn test_nan_profile_does_not_shadow_later_profiles() {
        let profiles = vec![
            profile("broken", &[f32::NAN, 0.0]),
            profile("jane_doe", &[0.0, 0.0]),
        ];
        let query = Descriptor::new(vec![0.0, 0.0]);
        let result = find_best_match(&query, &profiles, 0.6).unwrap();
        assert_eq!(result.profile.id, "jane_doe");
        assert_eq!(result.distance, 0.0);
    }

    #[test]
    fn test_nan_query_matches_nothing() {
        let profiles = vec![profile("jane_doe", &[0.0, 0.0])];
        let query = Descriptor::new(vec![f32::NAN, 0.0]);
        assert!(find_best_match(&query, &profiles, f32::MAX).is_none());
    }
}
