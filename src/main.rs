use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod aggregate;
mod breakdown;
mod config;
mod db;
mod error;
mod models;
mod report;
mod sanitize;
mod voting;

use config::Config;
use models::{GroupId, Vote, VoteKind};

#[derive(Parser)]
#[command(name = "peer-review")]
#[command(about = "Peer evaluation voting and outlier-resistant class scoring", long_about = None)]
struct Cli {
    /// Path to a TOML config file (defaults to ./peer-review.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo class with one open evaluation
    Seed,
    /// Append votes from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Add or update students and groups from a CSV file
    ImportRoster {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Show which groups a student still has to evaluate
    Status {
        #[arg(long)]
        student: String,
    },
    /// Cast a vote in the active evaluation
    Vote {
        #[arg(long)]
        student: String,
        #[arg(long)]
        group: String,
        /// Criterion rating as NAME=N (1-5); repeat for each criterion
        #[arg(long = "rating", value_parser = voting::parse_rating)]
        ratings: Vec<(String, u8)>,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Print per-group peer scores
    Score {
        #[arg(long)]
        event: Option<String>,
    },
    /// Print per-criterion averages for each group
    Breakdown {
        #[arg(long)]
        event: Option<String>,
    },
    /// Generate a markdown class report
    Report {
        #[arg(long)]
        event: Option<String>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Replace the stored grade table for an evaluation
    Export {
        #[arg(long)]
        event: Option<String>,
        /// Also write the table to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    let database_url = config.database_url()?;
    PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

/// Uses `--event` when given, otherwise the active evaluation.
async fn resolve_event(pool: &PgPool, event: Option<String>) -> anyhow::Result<String> {
    if let Some(event) = event {
        return Ok(event.trim().to_string());
    }
    let evaluations = db::fetch_evaluations(pool).await?;
    let active = voting::active_evaluation(&evaluations)?;
    Ok(active.id.clone())
}

fn peer_votes<'a>(votes: &'a [Vote], event: &str) -> Vec<&'a Vote> {
    aggregate::partition_votes(votes, event).peer
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;
    debug!(
        scoring = ?config.scoring,
        report = ?config.report,
        "loaded configuration"
    );
    let pool = connect(&config).await?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_votes_csv(&pool, &csv).await?;
            println!("Inserted {inserted} votes from {}.", csv.display());
        }
        Commands::ImportRoster { csv } => {
            let students = db::import_roster_csv(&pool, &csv).await?;
            println!("Updated {students} students from {}.", csv.display());
        }
        Commands::Status { student } => {
            let evaluations = db::fetch_evaluations(&pool).await?;
            let evaluation = voting::active_evaluation(&evaluations)?;
            let roster = db::fetch_roster(&pool).await?;
            let student = roster
                .student(&student)
                .ok_or_else(|| error::BallotError::UnknownStudent(student.clone()))?;
            let votes = db::fetch_votes(&pool).await?;

            println!(
                "{} (group {}) in {}:",
                student.name, student.group_id, evaluation.id
            );
            for (group_id, name, status) in
                voting::voting_status(&votes, &evaluation.id, student, &roster)
            {
                println!("- {} {}: {}", group_id, name, status.label());
            }

            let criteria = db::fetch_criteria(&pool, &evaluation.id).await?;
            if !criteria.is_empty() {
                println!("Criteria (rate each 1-5):");
                for criterion in criteria {
                    println!(
                        "- {} (weight {}): {}",
                        criterion.name, criterion.weight, criterion.description
                    );
                }
            }
        }
        Commands::Vote {
            student,
            group,
            ratings,
            comment,
        } => {
            let evaluations = db::fetch_evaluations(&pool).await?;
            let evaluation = voting::active_evaluation(&evaluations)?;
            let criteria = db::fetch_criteria(&pool, &evaluation.id).await?;
            let roster = db::fetch_roster(&pool).await?;
            let existing = db::fetch_votes(&pool).await?;

            let ballot = voting::Ballot {
                student_id: student,
                group_id: GroupId::new(&group),
                ratings: ratings.into_iter().collect::<BTreeMap<_, _>>(),
                comment,
            };
            let vote = voting::cast_vote(
                &ballot,
                evaluation,
                &criteria,
                &roster,
                &existing,
                Utc::now().naive_utc(),
            )?;
            if !db::append_ballot(&pool, &vote).await? {
                return Err(error::BallotError::AlreadyVoted {
                    student: vote.evaluator_id.clone(),
                    group: vote.target_group_id.to_string(),
                }
                .into());
            }
            info!(
                evaluation = %vote.evaluation_id,
                group = %vote.target_group_id,
                kind = vote.kind.as_str(),
                "vote appended"
            );

            let kind = match vote.kind {
                VoteKind::Peer => "peer",
                VoteKind::SelfAssessment => "self-assessment",
            };
            println!(
                "Saved {} vote for {} ({:.2} points).",
                kind, vote.target_group_label, vote.total_score
            );
        }
        Commands::Score { event } => {
            let event = resolve_event(&pool, event).await?;
            let votes = db::fetch_votes(&pool).await?;
            let roster = db::fetch_roster(&pool).await?;
            let reports = aggregate::build_group_reports(&votes, &event, &roster, &config.scoring);

            if reports.is_empty() {
                println!("No peer votes found for {event}.");
                return Ok(());
            }

            println!("Group scores for {event}:");
            for group in report::ranked(&reports) {
                let self_part = group
                    .self_score
                    .map(|score| format!(", self {:.2} (delta {:+.2})", score, group.delta))
                    .unwrap_or_default();
                println!(
                    "- {} {}: score {:.2} (raw {:.2}, sd {:.2}) across {} votes{}",
                    group.group_id,
                    group.display_name,
                    group.sanitized_mean,
                    group.raw_mean,
                    group.std_dev,
                    group.vote_count,
                    self_part
                );
            }
            for missing in report::groups_without_votes(&reports, &roster) {
                println!("- {missing}: no peer votes");
            }
        }
        Commands::Breakdown { event } => {
            let event = resolve_event(&pool, event).await?;
            let votes = db::fetch_votes(&pool).await?;
            let result = breakdown::build_breakdown(&peer_votes(&votes, &event));

            if result.rows.is_empty() {
                println!("No readable criteria ratings for {event}.");
                return Ok(());
            }

            println!("Criterion averages for {event}:");
            for row in &result.rows {
                let cells: Vec<String> = row
                    .means
                    .iter()
                    .map(|(name, mean)| format!("{name} {mean:.2}"))
                    .collect();
                println!("- {}: {}", row.group_id, cells.join(", "));
            }
            if result.skipped > 0 {
                println!("Skipped {} votes with unreadable ratings.", result.skipped);
            }
        }
        Commands::Report { event, out } => {
            let event = resolve_event(&pool, event).await?;
            let votes = db::fetch_votes(&pool).await?;
            let roster = db::fetch_roster(&pool).await?;
            let reports = aggregate::build_group_reports(&votes, &event, &roster, &config.scoring);
            let breakdown = breakdown::build_breakdown(&peer_votes(&votes, &event));
            let final_rows = report::consolidate(&reports, &roster);

            let markdown = report::build_report(
                &event,
                &reports,
                &breakdown,
                &final_rows,
                &roster,
                config.report.top_groups,
            );
            std::fs::write(&out, markdown)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Export { event, csv } => {
            let event = resolve_event(&pool, event).await?;
            let votes = db::fetch_votes(&pool).await?;
            let roster = db::fetch_roster(&pool).await?;
            let reports = aggregate::build_group_reports(&votes, &event, &roster, &config.scoring);
            let final_rows = report::consolidate(&reports, &roster);
            let table = report::export_table(&config.report.table_prefix, &event, &final_rows);

            let written = db::replace_table(&pool, &table).await?;
            println!("Saved {written} rows to table {}.", table.name);

            if let Some(path) = csv {
                let file = std::fs::File::create(&path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                report::write_csv(&table, file)?;
                println!("CSV written to {}.", path.display());
            }
        }
    }

    Ok(())
}
