//! Priority scoring for `queue:pending` (spec.md §4.1).
//!
//! Lower score sorts first. Priority dominates, then workflow priority, then
//! workflow age (older wins), then FIFO by creation time.

/// Inputs needed to compute a job's position in `queue:pending`.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInput {
    pub priority: i32,
    pub workflow_priority: Option<i32>,
    pub workflow_datetime: Option<i64>,
    pub created_at: i64,
}

const PRIORITY_SCALE: f64 = 1e13;

/// `score = -priority * 10^13 + (workflow_priority? * 10^13) - workflow_datetime? + created_at`
pub fn job_score(input: ScoreInput) -> f64 {
    let mut score = -(input.priority as f64) * PRIORITY_SCALE;
    if let Some(wp) = input.workflow_priority {
        score += (wp as f64) * PRIORITY_SCALE;
    }
    if let Some(wd) = input.workflow_datetime {
        score -= wd as f64;
    }
    score += input.created_at as f64;
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_sorts_first() {
        let low = job_score(ScoreInput {
            priority: 10,
            workflow_priority: None,
            workflow_datetime: None,
            created_at: 1000,
        });
        let high = job_score(ScoreInput {
            priority: 50,
            workflow_priority: None,
            workflow_datetime: None,
            created_at: 1000,
        });
        assert!(high < low, "higher priority must score lower (sorts first)");
    }

    #[test]
    fn workflow_priority_breaks_ties() {
        let plain = job_score(ScoreInput {
            priority: 50,
            workflow_priority: None,
            workflow_datetime: None,
            created_at: 1000,
        });
        let boosted = job_score(ScoreInput {
            priority: 50,
            workflow_priority: Some(99),
            workflow_datetime: Some(500),
            created_at: 1000,
        });
        assert!(boosted < plain);
    }

    #[test]
    fn fifo_on_creation_time_within_equal_priority() {
        let earlier = job_score(ScoreInput {
            priority: 50,
            workflow_priority: None,
            workflow_datetime: None,
            created_at: 1000,
        });
        let later = job_score(ScoreInput {
            priority: 50,
            workflow_priority: None,
            workflow_datetime: None,
            created_at: 2000,
        });
        assert!(earlier < later);
    }

    #[test]
    fn matches_scenario_s2_ordering() {
        // J2: priority 10; J3: priority 50; J4: priority 50, workflow_priority
        // 99, workflow_datetime earlier than J3's created_at.
        let j2 = job_score(ScoreInput {
            priority: 10,
            workflow_priority: None,
            workflow_datetime: None,
            created_at: 100,
        });
        let j3 = job_score(ScoreInput {
            priority: 50,
            workflow_priority: None,
            workflow_datetime: None,
            created_at: 200,
        });
        let j4 = job_score(ScoreInput {
            priority: 50,
            workflow_priority: Some(99),
            workflow_datetime: Some(50),
            created_at: 300,
        });

        let mut scores = vec![("J2", j2), ("J3", j3), ("J4", j4)];
        scores.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        let order: Vec<&str> = scores.iter().map(|(name, _)| *name).collect();
        assert_eq!(order, vec!["J4", "J3", "J2"]);
    }
}
