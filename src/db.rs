use std::collections::BTreeMap;
use std::io::Read;

use anyhow::Context;
use chrono::NaiveDateTime;
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{
    Criterion, Evaluation, EvaluationStatus, Group, GroupId, Roster, Student, Vote, VoteKind,
};
use crate::report::ExportTable;
use crate::voting::{self, Ballot};

const TIMESTAMP_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn fetch_evaluations(pool: &PgPool) -> anyhow::Result<Vec<Evaluation>> {
    let rows = sqlx::query("SELECT id, status FROM peer_review.evaluations ORDER BY position, id")
        .fetch_all(pool)
        .await?;

    let mut evaluations = Vec::new();
    for row in rows {
        let id: String = row.get("id");
        let status: String = row.get("status");
        let status = status
            .parse::<EvaluationStatus>()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("evaluation '{id}' has an invalid status"))?;
        evaluations.push(Evaluation { id, status });
    }

    Ok(evaluations)
}

pub async fn fetch_roster(pool: &PgPool) -> anyhow::Result<Roster> {
    let groups: Vec<Group> = sqlx::query("SELECT id, name FROM peer_review.groups ORDER BY id")
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|row| Group {
            id: GroupId::new(row.get::<String, _>("id").as_str()),
            name: row.get("name"),
        })
        .collect();

    let students: Vec<Student> =
        sqlx::query("SELECT id, full_name, group_id FROM peer_review.students ORDER BY id")
            .fetch_all(pool)
            .await?
            .into_iter()
            .map(|row| Student {
                id: row.get::<String, _>("id").trim().to_string(),
                name: row.get("full_name"),
                group_id: GroupId::new(row.get::<String, _>("group_id").as_str()),
            })
            .collect();

    Ok(Roster { groups, students })
}

pub async fn fetch_criteria(pool: &PgPool, evaluation_id: &str) -> anyhow::Result<Vec<Criterion>> {
    let rows = sqlx::query(
        r#"
        SELECT name, description, weight
        FROM peer_review.criteria
        WHERE evaluation_id = $1
        ORDER BY position, name
        "#,
    )
    .bind(evaluation_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| Criterion {
            name: row.get("name"),
            description: row.get("description"),
            weight: row.get("weight"),
        })
        .collect())
}

/// Loads the whole vote log. Rows with an unrecognised kind are skipped.
pub async fn fetch_votes(pool: &PgPool) -> anyhow::Result<Vec<Vote>> {
    let rows = sqlx::query(
        r#"
        SELECT created_at, evaluation_id, evaluator_id, target_group_id, target_group_label,
               total_score, criteria_detail, free_text, kind
        FROM peer_review.votes
        ORDER BY created_at, id
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut votes = Vec::with_capacity(rows.len());
    for row in rows {
        let kind: String = row.get("kind");
        let kind = match kind.parse::<VoteKind>() {
            Ok(kind) => kind,
            Err(err) => {
                warn!(error = %err, "skipping vote with unknown kind");
                continue;
            }
        };

        votes.push(Vote {
            timestamp: row.get("created_at"),
            evaluation_id: row.get("evaluation_id"),
            evaluator_id: row.get("evaluator_id"),
            target_group_id: GroupId::new(row.get::<String, _>("target_group_id").as_str()),
            target_group_label: row.get("target_group_label"),
            total_score: row.get("total_score"),
            criteria_detail: row.get("criteria_detail"),
            free_text: row.get("free_text"),
            kind,
        });
    }

    Ok(votes)
}

/// Appends one vote. Returns false when `source_key` was already imported.
pub async fn append_vote(
    pool: &PgPool,
    vote: &Vote,
    source_key: Option<&str>,
) -> anyhow::Result<bool> {
    insert_vote(pool, vote, source_key).await
}

/// Key for the advisory lock held while a ballot is checked and appended.
pub fn ballot_lock_key(vote: &Vote) -> String {
    format!(
        "{}|{}|{}",
        vote.evaluation_id.trim(),
        vote.evaluator_id.trim(),
        vote.target_group_id
    )
}

/// Appends a ballot unless the evaluator already voted on that group in the
/// same evaluation. The check and insert share one transaction under an
/// advisory lock, so concurrent submissions cannot both get through.
pub async fn append_ballot(pool: &PgPool, vote: &Vote) -> anyhow::Result<bool> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(ballot_lock_key(vote))
        .execute(&mut *tx)
        .await?;

    let already_voted: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM peer_review.votes
            WHERE evaluation_id = $1 AND evaluator_id = $2 AND target_group_id = $3
        )
        "#,
    )
    .bind(vote.evaluation_id.trim())
    .bind(vote.evaluator_id.trim())
    .bind(vote.target_group_id.as_str())
    .fetch_one(&mut *tx)
    .await?;

    if already_voted {
        tx.rollback().await?;
        return Ok(false);
    }

    insert_vote(&mut *tx, vote, None).await?;
    tx.commit().await.context("failed to append vote")?;
    Ok(true)
}

async fn insert_vote<'e, E>(
    executor: E,
    vote: &Vote,
    source_key: Option<&str>,
) -> anyhow::Result<bool>
where
    E: sqlx::PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO peer_review.votes
        (id, created_at, evaluation_id, evaluator_id, target_group_id, target_group_label,
         total_score, criteria_detail, free_text, kind, source_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(vote.timestamp)
    .bind(&vote.evaluation_id)
    .bind(&vote.evaluator_id)
    .bind(vote.target_group_id.as_str())
    .bind(&vote.target_group_label)
    .bind(vote.total_score)
    .bind(&vote.criteria_detail)
    .bind(&vote.free_text)
    .bind(vote.kind.as_str())
    .bind(source_key)
    .execute(executor)
    .await
    .context("failed to append vote")?;

    Ok(result.rows_affected() > 0)
}

/// Clears the named table and writes header plus rows in one transaction.
pub async fn replace_table(pool: &PgPool, table: &ExportTable) -> anyhow::Result<usize> {
    let mut tx = pool.begin().await?;

    let cleared = sqlx::query("DELETE FROM peer_review.report_rows WHERE table_name = $1")
        .bind(&table.name)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let all_rows = std::iter::once(&table.header).chain(table.rows.iter());
    for (index, cells) in all_rows.enumerate() {
        sqlx::query(
            "INSERT INTO peer_review.report_rows (table_name, row_index, cells) VALUES ($1, $2, $3)",
        )
        .bind(&table.name)
        .bind(index as i32)
        .bind(serde_json::to_string(cells)?)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit()
        .await
        .with_context(|| format!("failed to write table {}", table.name))?;

    if cleared > 0 {
        info!(table = %table.name, "replaced existing export table");
    } else {
        info!(table = %table.name, "created export table");
    }
    Ok(table.rows.len())
}

#[derive(Debug, serde::Deserialize)]
struct VoteCsvRow {
    timestamp: String,
    evaluation_id: String,
    evaluator_id: String,
    target_group_id: String,
    target_group_label: String,
    total_score: f64,
    criteria_detail: String,
    free_text: Option<String>,
    kind: String,
    source_key: Option<String>,
}

pub fn parse_timestamp(raw: &str) -> anyhow::Result<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .with_context(|| format!("unrecognised timestamp: {raw}"))
}

/// Reads vote rows (and their optional source keys) from CSV.
pub fn read_vote_csv<R: Read>(input: R) -> anyhow::Result<Vec<(Vote, Option<String>)>> {
    let mut reader = csv::Reader::from_reader(input);
    let mut votes = Vec::new();

    for (index, result) in reader.deserialize::<VoteCsvRow>().enumerate() {
        let line = index + 2;
        let row = result.with_context(|| format!("invalid vote on line {line}"))?;
        let kind = row
            .kind
            .parse::<VoteKind>()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("invalid vote on line {line}"))?;

        let vote = Vote {
            timestamp: parse_timestamp(&row.timestamp)
                .with_context(|| format!("invalid vote on line {line}"))?,
            evaluation_id: row.evaluation_id.trim().to_string(),
            evaluator_id: row.evaluator_id.trim().to_string(),
            target_group_id: GroupId::new(&row.target_group_id),
            target_group_label: row.target_group_label,
            total_score: row.total_score,
            criteria_detail: row.criteria_detail,
            free_text: row.free_text.filter(|text| !text.trim().is_empty()),
            kind,
        };
        let source_key = row.source_key.filter(|key| !key.trim().is_empty());
        votes.push((vote, source_key));
    }

    Ok(votes)
}

pub async fn import_votes_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let rows = read_vote_csv(file)?;

    let mut inserted = 0usize;
    for (vote, source_key) in rows {
        let source_key =
            source_key.unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));
        if append_vote(pool, &vote, Some(&source_key)).await? {
            inserted += 1;
        }
    }

    Ok(inserted)
}

#[derive(Debug, serde::Deserialize)]
struct RosterCsvRow {
    student_id: String,
    full_name: String,
    group_id: String,
    group_name: String,
}

pub fn read_roster_csv<R: Read>(input: R) -> anyhow::Result<Roster> {
    let mut reader = csv::Reader::from_reader(input);
    let mut groups: BTreeMap<GroupId, String> = BTreeMap::new();
    let mut students = Vec::new();

    for (index, result) in reader.deserialize::<RosterCsvRow>().enumerate() {
        let row = result.with_context(|| format!("invalid roster entry on line {}", index + 2))?;
        let group_id = GroupId::new(&row.group_id);
        groups.entry(group_id.clone()).or_insert(row.group_name);
        students.push(Student {
            id: row.student_id.trim().to_string(),
            name: row.full_name,
            group_id,
        });
    }

    Ok(Roster {
        groups: groups
            .into_iter()
            .map(|(id, name)| Group { id, name })
            .collect(),
        students,
    })
}

pub async fn upsert_roster(pool: &PgPool, roster: &Roster) -> anyhow::Result<()> {
    for group in &roster.groups {
        sqlx::query(
            r#"
            INSERT INTO peer_review.groups (id, name)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name
            "#,
        )
        .bind(group.id.as_str())
        .bind(&group.name)
        .execute(pool)
        .await?;
    }

    for student in &roster.students {
        sqlx::query(
            r#"
            INSERT INTO peer_review.students (id, full_name, group_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET full_name = EXCLUDED.full_name, group_id = EXCLUDED.group_id
            "#,
        )
        .bind(&student.id)
        .bind(&student.name)
        .bind(student.group_id.as_str())
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub async fn import_roster_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let roster = read_roster_csv(file)?;
    upsert_roster(pool, &roster).await?;
    Ok(roster.students.len())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let evaluations = [("seminar-1", "open", 1), ("seminar-0", "closed", 0)];
    for (id, status, position) in evaluations {
        sqlx::query(
            r#"
            INSERT INTO peer_review.evaluations (id, status, position)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, position = EXCLUDED.position
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(position)
        .execute(pool)
        .await?;
    }

    let groups = [
        ("1", "Solar Kiosk"),
        ("2", "Water Quality Sensors"),
        ("3", "Library Chatbot"),
        ("4", "Campus Bike Share"),
    ];
    let students = [
        ("2026001", "Avery Lee", "1"),
        ("2026002", "Jules Moreno", "1"),
        ("2026003", "Kiara Patel", "2"),
        ("2026004", "Noah Silva", "2"),
        ("2026005", "Maya Chen", "3"),
        ("2026006", "Rui Tanaka", "3"),
        ("2026007", "Lena Fischer", "4"),
    ];
    let roster = Roster {
        groups: groups
            .iter()
            .map(|(id, name)| Group {
                id: GroupId::new(id),
                name: name.to_string(),
            })
            .collect(),
        students: students
            .iter()
            .map(|(id, name, group)| Student {
                id: id.to_string(),
                name: name.to_string(),
                group_id: GroupId::new(group),
            })
            .collect(),
    };
    upsert_roster(pool, &roster).await?;

    let criteria = [
        ("Clarity", "Was the presentation easy to follow?", 2.0),
        ("Content", "Depth and correctness of the material", 2.0),
        ("Delivery", "Timing, voice and use of slides", 1.0),
    ];
    for (position, (name, description, weight)) in criteria.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO peer_review.criteria (evaluation_id, name, description, weight, position)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (evaluation_id, name) DO UPDATE
            SET description = EXCLUDED.description, weight = EXCLUDED.weight
            "#,
        )
        .bind("seminar-1")
        .bind(*name)
        .bind(*description)
        .bind(*weight)
        .bind(position as i32)
        .execute(pool)
        .await?;
    }

    let evaluation = Evaluation {
        id: "seminar-1".to_string(),
        status: EvaluationStatus::Open,
    };
    let criteria: Vec<Criterion> = criteria
        .iter()
        .map(|(name, description, weight)| Criterion {
            name: name.to_string(),
            description: description.to_string(),
            weight: *weight,
        })
        .collect();

    let ballots = [
        ("seed-001", "2026003", "1", [4, 4, 3]),
        ("seed-002", "2026005", "1", [5, 4, 4]),
        ("seed-003", "2026007", "1", [4, 3, 4]),
        ("seed-004", "2026006", "1", [1, 1, 1]),
        ("seed-005", "2026001", "1", [5, 5, 5]),
        ("seed-006", "2026001", "2", [3, 4, 3]),
        ("seed-007", "2026005", "2", [4, 4, 5]),
        ("seed-008", "2026002", "3", [5, 4, 5]),
        ("seed-009", "2026003", "3", [4, 5, 4]),
    ];

    let timestamp = NaiveDateTime::parse_from_str("2026-03-10 09:30:00", "%Y-%m-%d %H:%M:%S")?;
    let mut cast = Vec::new();
    for (source_key, student_id, group_id, ratings) in ballots {
        let ballot = Ballot {
            student_id: student_id.to_string(),
            group_id: GroupId::new(group_id),
            ratings: criteria
                .iter()
                .map(|criterion| criterion.name.clone())
                .zip(ratings)
                .collect(),
            comment: None,
        };
        let vote = voting::cast_vote(&ballot, &evaluation, &criteria, &roster, &cast, timestamp)?;
        append_vote(pool, &vote, Some(source_key)).await?;
        cast.push(vote);
    }

    Ok(())
}
