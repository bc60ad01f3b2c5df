use std::collections::BTreeMap;

use chrono::NaiveDateTime;

use crate::error::BallotError;
use crate::models::{
    Criterion, Evaluation, EvaluationStatus, GroupId, Roster, Student, Vote, VoteKind,
};

/// Picks the first open evaluation, or the first one listed if all are closed.
pub fn active_evaluation(evaluations: &[Evaluation]) -> Result<&Evaluation, BallotError> {
    evaluations
        .iter()
        .find(|evaluation| evaluation.status == EvaluationStatus::Open)
        .or_else(|| evaluations.first())
        .ok_or(BallotError::NoEvaluation)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Evaluated,
    SelfAssessment,
    Pending,
}

impl GroupStatus {
    pub fn label(&self) -> &'static str {
        match self {
            GroupStatus::Evaluated => "done",
            GroupStatus::SelfAssessment => "self-assessment",
            GroupStatus::Pending => "pending",
        }
    }
}

fn has_voted(votes: &[Vote], evaluation_id: &str, evaluator_id: &str, group: &GroupId) -> bool {
    votes.iter().any(|vote| {
        vote.evaluation_id.trim() == evaluation_id.trim()
            && vote.evaluator_id.trim() == evaluator_id.trim()
            && &vote.target_group_id == group
    })
}

/// What the student still has to do for each roster group.
pub fn voting_status(
    votes: &[Vote],
    evaluation_id: &str,
    student: &Student,
    roster: &Roster,
) -> Vec<(GroupId, String, GroupStatus)> {
    roster
        .groups
        .iter()
        .map(|group| {
            let status = if has_voted(votes, evaluation_id, &student.id, &group.id) {
                GroupStatus::Evaluated
            } else if group.id == student.group_id {
                GroupStatus::SelfAssessment
            } else {
                GroupStatus::Pending
            };
            (group.id.clone(), group.name.clone(), status)
        })
        .collect()
}

/// A filled-in voting form before it becomes a vote.
#[derive(Debug, Clone)]
pub struct Ballot {
    pub student_id: String,
    pub group_id: GroupId,
    pub ratings: BTreeMap<String, u8>,
    pub comment: Option<String>,
}

/// Validate a ballot and turn it into the vote row to append.
pub fn cast_vote(
    ballot: &Ballot,
    evaluation: &Evaluation,
    criteria: &[Criterion],
    roster: &Roster,
    existing: &[Vote],
    timestamp: NaiveDateTime,
) -> Result<Vote, BallotError> {
    if evaluation.status != EvaluationStatus::Open {
        return Err(BallotError::EvaluationClosed(evaluation.id.clone()));
    }
    if criteria.is_empty() {
        return Err(BallotError::NoCriteria(evaluation.id.clone()));
    }

    let student = roster
        .student(&ballot.student_id)
        .ok_or_else(|| BallotError::UnknownStudent(ballot.student_id.clone()))?;
    let group = roster
        .group(&ballot.group_id)
        .ok_or_else(|| BallotError::UnknownGroup(ballot.group_id.to_string()))?;

    if has_voted(existing, &evaluation.id, &student.id, &group.id) {
        return Err(BallotError::AlreadyVoted {
            student: student.id.clone(),
            group: group.id.to_string(),
        });
    }

    if let Some(unknown) = ballot
        .ratings
        .keys()
        .find(|name| !criteria.iter().any(|criterion| &criterion.name == *name))
    {
        return Err(BallotError::UnknownCriterion(unknown.clone()));
    }

    let mut total_score = 0.0;
    let mut detail = serde_json::Map::new();
    for criterion in criteria {
        let rating = *ballot
            .ratings
            .get(&criterion.name)
            .ok_or_else(|| BallotError::MissingRating(criterion.name.clone()))?;
        if !(1..=5).contains(&rating) {
            return Err(BallotError::RatingOutOfRange {
                criterion: criterion.name.clone(),
                rating,
            });
        }
        total_score += f64::from(rating) * criterion.weight;
        detail.insert(criterion.name.clone(), rating.into());
    }

    let kind = if group.id == student.group_id {
        VoteKind::SelfAssessment
    } else {
        VoteKind::Peer
    };

    Ok(Vote {
        timestamp,
        evaluation_id: evaluation.id.clone(),
        evaluator_id: student.id.clone(),
        target_group_id: group.id.clone(),
        target_group_label: group.name.clone(),
        total_score,
        criteria_detail: serde_json::Value::Object(detail).to_string(),
        free_text: ballot
            .comment
            .as_ref()
            .map(|comment| comment.trim().to_string())
            .filter(|comment| !comment.is_empty()),
        kind,
    })
}

/// Parses a `NAME=N` rating argument.
pub fn parse_rating(arg: &str) -> Result<(String, u8), String> {
    let (name, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=RATING, got '{arg}'"))?;
    let rating = value
        .trim()
        .parse::<u8>()
        .map_err(|_| format!("rating for '{}' must be a whole number", name.trim()))?;
    Ok((name.trim().to_string(), rating))
}
