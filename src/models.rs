use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Canonical group identifier.
///
/// Group ids arrive as text, numbers, or spreadsheet floats depending on who
/// wrote the row. Every comparison and map key in the pipeline goes through
/// this type so that `"3"`, `" 3 "` and `3` land in the same bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(into = "String")]
pub struct GroupId(String);

impl GroupId {
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim();
        let integral = trimmed
            .split_once('.')
            .filter(|(whole, fraction)| {
                !whole.is_empty()
                    && whole.bytes().all(|b| b.is_ascii_digit())
                    && !fraction.is_empty()
                    && fraction.bytes().all(|b| b == b'0')
            })
            .map(|(whole, _)| whole);

        GroupId(integral.unwrap_or(trimmed).to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GroupId {
    fn from(raw: &str) -> Self {
        GroupId::new(raw)
    }
}

impl From<String> for GroupId {
    fn from(raw: String) -> Self {
        GroupId::new(&raw)
    }
}

impl From<i64> for GroupId {
    fn from(raw: i64) -> Self {
        GroupId::new(&raw.to_string())
    }
}

impl From<GroupId> for String {
    fn from(id: GroupId) -> Self {
        id.0
    }
}

impl<'de> Deserialize<'de> for GroupId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Int(i64),
            Float(f64),
            Text(String),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Int(value) => GroupId::from(value),
            RawId::Float(value) => GroupId::new(&value.to_string()),
            RawId::Text(value) => GroupId::new(&value),
        })
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteKind {
    Peer,
    SelfAssessment,
}

impl VoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteKind::Peer => "peer",
            VoteKind::SelfAssessment => "self",
        }
    }
}

impl FromStr for VoteKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "peer" | "par" => Ok(VoteKind::Peer),
            "self" | "self_assessment" | "selfassessment" | "autoavaliacao" => {
                Ok(VoteKind::SelfAssessment)
            }
            other => Err(format!("unknown vote kind: {other}")),
        }
    }
}

/// One submitted vote. Immutable once appended to the log.
#[derive(Debug, Clone)]
pub struct Vote {
    pub timestamp: NaiveDateTime,
    pub evaluation_id: String,
    pub evaluator_id: String,
    pub target_group_id: GroupId,
    pub target_group_label: String,
    pub total_score: f64,
    /// Raw JSON object of criterion name to 1-5 rating. Kept unparsed so a
    /// corrupt payload only affects the breakdown.
    pub criteria_detail: String,
    pub free_text: Option<String>,
    pub kind: VoteKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,
    pub description: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationStatus {
    Open,
    Closed,
}

impl FromStr for EvaluationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" | "aberto" => Ok(EvaluationStatus::Open),
            "closed" | "fechado" => Ok(EvaluationStatus::Closed),
            other => Err(format!("unknown evaluation status: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub id: String,
    pub status: EvaluationStatus,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Student {
    /// Opaque text; never parsed as a number so leading zeros survive.
    pub id: String,
    pub name: String,
    pub group_id: GroupId,
}

#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub groups: Vec<Group>,
    pub students: Vec<Student>,
}

impl Roster {
    pub fn group(&self, id: &GroupId) -> Option<&Group> {
        self.groups.iter().find(|group| &group.id == id)
    }

    pub fn student(&self, id: &str) -> Option<&Student> {
        let id = id.trim();
        self.students.iter().find(|student| student.id == id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupReport {
    pub group_id: GroupId,
    pub display_name: String,
    pub vote_count: usize,
    pub raw_mean: f64,
    pub std_dev: f64,
    pub sanitized_mean: f64,
    pub self_score: Option<f64>,
    pub delta: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CriterionBreakdown {
    pub group_id: GroupId,
    pub means: BTreeMap<String, f64>,
}

/// One student row of the consolidated class report.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalScoreRow {
    pub student_id: String,
    pub student_name: String,
    pub group_id: GroupId,
    pub vote_count: usize,
    pub final_score: f64,
}

impl FinalScoreRow {
    pub fn rounded_score(&self) -> f64 {
        (self.final_score * 100.0).round() / 100.0
    }
}
