use thiserror::Error;

/// Why a `criteria_detail` payload could not be read.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("criteria payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("criteria payload must be a JSON object")]
    NotAnObject,

    #[error("criteria payload has no ratings")]
    Empty,

    #[error("rating for '{criterion}' is not a number")]
    NotANumber { criterion: String },

    #[error("rating {rating} for '{criterion}' is outside 1-5")]
    OutOfRange { criterion: String, rating: f64 },
}

/// Why a vote could not be built for the active evaluation.
#[derive(Debug, Error, PartialEq)]
pub enum BallotError {
    #[error("evaluation '{0}' is closed")]
    EvaluationClosed(String),

    #[error("no evaluation events are configured")]
    NoEvaluation,

    #[error("evaluation '{0}' has no criteria to rate")]
    NoCriteria(String),

    #[error("student '{0}' is not on the roster")]
    UnknownStudent(String),

    #[error("group '{0}' is not on the roster")]
    UnknownGroup(String),

    #[error("'{0}' is not a criterion of this evaluation")]
    UnknownCriterion(String),

    #[error("missing rating for criterion '{0}'")]
    MissingRating(String),

    #[error("rating {rating} for '{criterion}' is outside 1-5")]
    RatingOutOfRange { criterion: String, rating: u8 },

    #[error("student '{student}' already evaluated group '{group}' in this evaluation")]
    AlreadyVoted { student: String, group: String },
}
