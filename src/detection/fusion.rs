//! Candidate fusion strategies. All functions are pure so they can be shared
//! between live detection and cache re-analysis.

use std::cmp::Ordering;
use std::collections::HashSet;

use super::DetectionCandidate;
use crate::config::FusionStrategy;

const AGREEMENT_WEIGHT: f64 = 0.5;
const DIVERSITY_WEIGHT: f64 = 0.1;

/// Candidates merged around a representative timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateGroup {
    pub representative: f64,
    pub score: f64,
    pub members: Vec<DetectionCandidate>,
}

/// Reduce candidates to one timestamp with the chosen strategy
pub fn fuse(
    candidates: &[DetectionCandidate],
    strategy: FusionStrategy,
    window: f64,
) -> Option<f64> {
    if candidates.is_empty() {
        return None;
    }

    match strategy {
        FusionStrategy::CorrelationScoring => correlation_scoring(candidates, window),
        FusionStrategy::Earliest => timestamps(candidates).reduce(f64::min),
        FusionStrategy::Latest => timestamps(candidates).reduce(f64::max),
        FusionStrategy::Average => average(&timestamps(candidates).collect::<Vec<_>>()),
        FusionStrategy::Median => median(&timestamps(candidates).collect::<Vec<_>>()),
        FusionStrategy::Priority => by_priority(candidates),
    }
}

fn timestamps(candidates: &[DetectionCandidate]) -> impl Iterator<Item = f64> + '_ {
    candidates.iter().map(|c| c.timestamp)
}

/// Greedy time-windowed grouping; a candidate joins the first group whose
/// representative is within `window` seconds, otherwise it opens a new group
pub fn group_candidates(candidates: &[DetectionCandidate], window: f64) -> Vec<CandidateGroup> {
    let mut sorted = candidates.to_vec();
    sorted.sort_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap_or(Ordering::Equal));

    let mut groups: Vec<CandidateGroup> = Vec::new();
    for candidate in sorted {
        match groups
            .iter_mut()
            .find(|g| (g.representative - candidate.timestamp).abs() <= window)
        {
            Some(group) => {
                group.score += candidate.confidence;
                group.members.push(candidate);
            }
            None => groups.push(CandidateGroup {
                representative: candidate.timestamp,
                score: candidate.confidence,
                members: vec![candidate],
            }),
        }
    }

    groups
}

/// Representative of the highest scoring group; ties go to the earlier group
pub fn correlation_scoring(candidates: &[DetectionCandidate], window: f64) -> Option<f64> {
    group_candidates(candidates, window)
        .into_iter()
        .fold(None::<CandidateGroup>, |best, group| match best {
            Some(best) if best.score >= group.score => Some(best),
            _ => Some(group),
        })
        .map(|group| group.representative)
}

pub fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

fn by_priority(candidates: &[DetectionCandidate]) -> Option<f64> {
    candidates
        .iter()
        .min_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal))
                .then_with(|| a.timestamp.partial_cmp(&b.timestamp).unwrap_or(Ordering::Equal))
        })
        .map(|c| c.timestamp)
}

/// Raise each candidate's confidence by how well sibling episodes agree with it.
///
/// Agreement bonus is the fraction of comparison episodes with a candidate
/// inside the window, times 0.5. Diversity bonus is 0.1 for every distinct
/// agreeing method beyond the first. The result is capped at 1.0.
pub fn score_with_comparison(
    candidates: &[DetectionCandidate],
    comparisons: &[Vec<DetectionCandidate>],
    window: f64,
) -> Vec<DetectionCandidate> {
    if comparisons.is_empty() {
        return candidates.to_vec();
    }

    candidates
        .iter()
        .map(|candidate| {
            let mut agreeing_methods: HashSet<&str> = HashSet::new();
            agreeing_methods.insert(candidate.method.as_str());

            let mut agreeing_episodes = 0usize;
            for episode in comparisons {
                let mut agrees = false;
                for other in episode {
                    if (other.timestamp - candidate.timestamp).abs() <= window {
                        agrees = true;
                        agreeing_methods.insert(other.method.as_str());
                    }
                }
                if agrees {
                    agreeing_episodes += 1;
                }
            }

            let agreement = agreeing_episodes as f64 / comparisons.len() as f64 * AGREEMENT_WEIGHT;
            let diversity = (agreeing_methods.len() as f64 - 1.0) * DIVERSITY_WEIGHT;

            DetectionCandidate {
                confidence: (candidate.confidence + agreement + diversity).min(1.0),
                ..candidate.clone()
            }
        })
        .collect()
}

/// Season estimate for an episode with no candidates of its own: the median
/// of per-episode average timestamps, provided enough siblings detected anything
pub fn fallback_estimate(
    comparisons: &[Vec<DetectionCandidate>],
    min_success_rate: f64,
) -> Result<f64, String> {
    if comparisons.is_empty() {
        return Err("No comparison episodes available for fallback".to_string());
    }

    let averages: Vec<f64> = comparisons
        .iter()
        .filter_map(|episode| average(&episode.iter().map(|c| c.timestamp).collect::<Vec<_>>()))
        .collect();

    let success_rate = averages.len() as f64 / comparisons.len() as f64;
    if averages.is_empty() || success_rate < min_success_rate {
        return Err(format!(
            "Fallback unavailable: {}/{} comparison episodes detected credits ({:.0}% < {:.0}%)",
            averages.len(),
            comparisons.len(),
            success_rate * 100.0,
            min_success_rate * 100.0
        ));
    }

    median(&averages).ok_or_else(|| "Fallback produced no estimate".to_string())
}
