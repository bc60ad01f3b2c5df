use std::collections::BTreeMap;

use tracing::debug;

use crate::models::{GroupId, GroupReport, Roster, Vote, VoteKind};
use crate::sanitize::{self, OutlierPolicy};

/// Votes of one evaluation split by kind.
#[derive(Debug, Default)]
pub struct PartitionedVotes<'a> {
    pub peer: Vec<&'a Vote>,
    pub self_assessment: Vec<&'a Vote>,
}

pub fn partition_votes<'a>(votes: &'a [Vote], evaluation_id: &str) -> PartitionedVotes<'a> {
    let evaluation_id = evaluation_id.trim();
    let mut partitioned = PartitionedVotes::default();

    for vote in votes {
        if vote.evaluation_id.trim() != evaluation_id {
            continue;
        }
        match vote.kind {
            VoteKind::Peer => partitioned.peer.push(vote),
            VoteKind::SelfAssessment => partitioned.self_assessment.push(vote),
        }
    }

    debug!(
        evaluation = evaluation_id,
        peer = partitioned.peer.len(),
        self_assessment = partitioned.self_assessment.len(),
        "partitioned votes"
    );
    partitioned
}

/// Sample standard deviation; a single score has zero spread.
pub fn std_dev(scores: &[f64]) -> f64 {
    if scores.len() < 2 {
        return 0.0;
    }
    let mean = sanitize::mean(scores);
    let variance = scores
        .iter()
        .map(|score| (score - mean).powi(2))
        .sum::<f64>()
        / (scores.len() - 1) as f64;
    variance.sqrt()
}

/// One row per group with at least one peer vote, ordered by group id.
pub fn aggregate_peer_votes(
    peer_votes: &[&Vote],
    roster: &Roster,
    policy: &OutlierPolicy,
) -> Vec<GroupReport> {
    let mut grouped: BTreeMap<&GroupId, (Vec<f64>, &str)> = BTreeMap::new();

    for vote in peer_votes {
        let entry = grouped
            .entry(&vote.target_group_id)
            .or_insert_with(|| (Vec::new(), ""));
        entry.0.push(vote.total_score);
        entry.1 = vote.target_group_label.as_str();
    }

    grouped
        .into_iter()
        .map(|(group_id, (scores, label))| {
            let display_name = roster
                .group(group_id)
                .map(|group| group.name.clone())
                .unwrap_or_else(|| label.to_string());

            GroupReport {
                group_id: group_id.clone(),
                display_name,
                vote_count: scores.len(),
                raw_mean: sanitize::mean(&scores),
                std_dev: std_dev(&scores),
                sanitized_mean: sanitize::sanitized_mean_with(&scores, policy),
                self_score: None,
                delta: 0.0,
            }
        })
        .collect()
}

/// Attach each group's averaged self-assessment and its gap to the peer score.
pub fn reconcile_self_scores(
    self_votes: &[&Vote],
    mut reports: Vec<GroupReport>,
) -> Vec<GroupReport> {
    let mut self_scores: BTreeMap<&GroupId, Vec<f64>> = BTreeMap::new();
    for vote in self_votes {
        self_scores
            .entry(&vote.target_group_id)
            .or_default()
            .push(vote.total_score);
    }

    for report in reports.iter_mut() {
        match self_scores.get(&report.group_id) {
            Some(scores) => {
                let self_score = sanitize::mean(scores);
                report.self_score = Some(self_score);
                report.delta = self_score - report.sanitized_mean;
            }
            None => {
                report.self_score = None;
                report.delta = 0.0;
            }
        }
    }

    reports
}

/// Full peer + self pass for one evaluation.
pub fn build_group_reports(
    votes: &[Vote],
    evaluation_id: &str,
    roster: &Roster,
    policy: &OutlierPolicy,
) -> Vec<GroupReport> {
    let partitioned = partition_votes(votes, evaluation_id);
    let reports = aggregate_peer_votes(&partitioned.peer, roster, policy);
    reconcile_self_scores(&partitioned.self_assessment, reports)
}
