use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::error::ParseError;
use crate::models::{CriterionBreakdown, GroupId, Vote};

const MIN_RATING: f64 = 1.0;
const MAX_RATING: f64 = 5.0;

/// Breakdown rows plus how many payloads had to be skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakdownResult {
    pub rows: Vec<CriterionBreakdown>,
    pub skipped: usize,
}

pub fn parse_criteria_detail(raw: &str) -> Result<BTreeMap<String, f64>, ParseError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|err| ParseError::InvalidJson(err.to_string()))?;
    let object = value.as_object().ok_or(ParseError::NotAnObject)?;
    if object.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut ratings = BTreeMap::new();
    for (criterion, rating) in object {
        let rating = match rating {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse::<f64>().ok(),
            _ => None,
        }
        .ok_or_else(|| ParseError::NotANumber {
            criterion: criterion.clone(),
        })?;

        if !(MIN_RATING..=MAX_RATING).contains(&rating) {
            return Err(ParseError::OutOfRange {
                criterion: criterion.clone(),
                rating,
            });
        }
        ratings.insert(criterion.trim().to_string(), rating);
    }

    Ok(ratings)
}

/// Average each criterion over a group's parseable peer votes.
///
/// A corrupt payload drops only that vote from the breakdown.
pub fn build_breakdown(peer_votes: &[&Vote]) -> BreakdownResult {
    let mut totals: BTreeMap<&GroupId, BTreeMap<String, (f64, usize)>> = BTreeMap::new();
    let mut skipped = 0usize;

    for vote in peer_votes {
        let ratings = match parse_criteria_detail(&vote.criteria_detail) {
            Ok(ratings) => ratings,
            Err(err) => {
                warn!(
                    group = %vote.target_group_id,
                    evaluator = %vote.evaluator_id,
                    error = %err,
                    "skipping vote in criterion breakdown"
                );
                skipped += 1;
                continue;
            }
        };

        let group = totals.entry(&vote.target_group_id).or_default();
        for (criterion, rating) in ratings {
            let entry = group.entry(criterion).or_insert((0.0, 0));
            entry.0 += rating;
            entry.1 += 1;
        }
    }

    let rows = totals
        .into_iter()
        .map(|(group_id, criteria)| CriterionBreakdown {
            group_id: group_id.clone(),
            means: criteria
                .into_iter()
                .map(|(name, (sum, count))| (name, sum / count as f64))
                .collect(),
        })
        .collect();

    BreakdownResult { rows, skipped }
}

/// Every criterion name seen across the rows, sorted.
pub fn criterion_names(rows: &[CriterionBreakdown]) -> Vec<String> {
    let mut names: Vec<String> = rows
        .iter()
        .flat_map(|row| row.means.keys().cloned())
        .collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::tests::sample_vote;
    use crate::models::VoteKind;

    fn vote_with_detail(group: &str, detail: &str) -> Vote {
        let mut vote = sample_vote(group, 10.0, VoteKind::Peer);
        vote.criteria_detail = detail.to_string();
        vote
    }

    #[test]
    fn parses_integer_and_text_ratings() {
        let parsed =
            parse_criteria_detail(r#"{"Clarity": 4, "Depth": "3", "Slides": 2.5}"#).unwrap();
        assert_eq!(parsed["Clarity"], 4.0);
        assert_eq!(parsed["Depth"], 3.0);
        assert_eq!(parsed["Slides"], 2.5);
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(
            parse_criteria_detail("{not json"),
            Err(ParseError::InvalidJson(_))
        ));
        assert_eq!(parse_criteria_detail("[1, 2]"), Err(ParseError::NotAnObject));
        assert_eq!(parse_criteria_detail("{}"), Err(ParseError::Empty));
        assert_eq!(
            parse_criteria_detail(r#"{"Clarity": null}"#),
            Err(ParseError::NotANumber {
                criterion: "Clarity".to_string()
            })
        );
        assert_eq!(
            parse_criteria_detail(r#"{"Clarity": 9}"#),
            Err(ParseError::OutOfRange {
                criterion: "Clarity".to_string(),
                rating: 9.0
            })
        );
    }

    #[test]
    fn averages_ratings_per_group_and_criterion() {
        let votes = vec![
            vote_with_detail("1", r#"{"Clarity": 4, "Content": 2}"#),
            vote_with_detail("1", r#"{"Clarity": 5, "Content": 3}"#),
            vote_with_detail("2", r#"{"Clarity": 1, "Content": 1}"#),
        ];
        let refs: Vec<&Vote> = votes.iter().collect();
        let result = build_breakdown(&refs);

        assert_eq!(result.skipped, 0);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0].group_id, GroupId::new("1"));
        assert_eq!(result.rows[0].means["Clarity"], 4.5);
        assert_eq!(result.rows[0].means["Content"], 2.5);
        assert_eq!(result.rows[1].means["Clarity"], 1.0);
    }

    #[test]
    fn corrupt_payload_is_skipped_not_fatal() {
        let votes = vec![
            vote_with_detail("A", r#"{"Clarity": 4}"#),
            vote_with_detail("A", "not-json"),
            vote_with_detail("A", r#"{"Clarity": 2}"#),
        ];
        let refs: Vec<&Vote> = votes.iter().collect();
        let result = build_breakdown(&refs);

        assert_eq!(result.skipped, 1);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].means["Clarity"], 3.0);
    }

    #[test]
    fn group_with_only_corrupt_payloads_has_no_row() {
        let votes = vec![vote_with_detail("A", "{}"), vote_with_detail("B", r#"{"Clarity": 3}"#)];
        let refs: Vec<&Vote> = votes.iter().collect();
        let result = build_breakdown(&refs);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].group_id, GroupId::new("B"));
    }

    #[test]
    fn criterion_names_are_merged() {
        let votes = vec![
            vote_with_detail("1", r#"{"Clarity": 4}"#),
            vote_with_detail("2", r#"{"Depth": 4, "Clarity": 2}"#),
        ];
        let refs: Vec<&Vote> = votes.iter().collect();
        let result = build_breakdown(&refs);
        assert_eq!(criterion_names(&result.rows), vec!["Clarity", "Depth"]);
    }
}
