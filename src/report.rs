use std::collections::HashMap;
use std::fmt::Write;
use std::io;

use crate::breakdown::{self, BreakdownResult};
use crate::models::{FinalScoreRow, GroupId, GroupReport, Roster};

pub const EXPORT_HEADER: [&str; 4] = ["student_id", "student_name", "group_id", "final_score"];

/// Rectangular table handed to the record store for whole-table replace.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportTable {
    pub name: String,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// One row per roster student, carrying their group's peer score.
///
/// Students whose group received no peer votes get a score of 0 and a vote
/// count of 0.
pub fn consolidate(reports: &[GroupReport], roster: &Roster) -> Vec<FinalScoreRow> {
    let by_group: HashMap<&GroupId, &GroupReport> = reports
        .iter()
        .map(|report| (&report.group_id, report))
        .collect();

    let mut rows: Vec<FinalScoreRow> = roster
        .students
        .iter()
        .map(|student| {
            let report = by_group.get(&student.group_id);
            FinalScoreRow {
                student_id: student.id.clone(),
                student_name: student.name.clone(),
                group_id: student.group_id.clone(),
                vote_count: report.map(|r| r.vote_count).unwrap_or(0),
                final_score: report.map(|r| r.sanitized_mean).unwrap_or(0.0),
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        a.group_id
            .cmp(&b.group_id)
            .then_with(|| a.student_id.cmp(&b.student_id))
    });
    rows
}

pub fn export_table_name(prefix: &str, evaluation_id: &str) -> String {
    format!("{prefix}{}", evaluation_id.trim())
}

pub fn export_table(prefix: &str, evaluation_id: &str, rows: &[FinalScoreRow]) -> ExportTable {
    ExportTable {
        name: export_table_name(prefix, evaluation_id),
        header: EXPORT_HEADER.iter().map(|h| h.to_string()).collect(),
        rows: rows
            .iter()
            .map(|row| {
                vec![
                    row.student_id.clone(),
                    row.student_name.clone(),
                    row.group_id.to_string(),
                    format!("{:.2}", row.rounded_score()),
                ]
            })
            .collect(),
    }
}

pub fn write_csv<W: io::Write>(table: &ExportTable, writer: W) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(&table.header)?;
    for row in &table.rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Roster groups that received no peer votes at all.
pub fn groups_without_votes<'a>(reports: &[GroupReport], roster: &'a Roster) -> Vec<&'a GroupId> {
    let mut missing: Vec<&GroupId> = roster
        .groups
        .iter()
        .map(|group| &group.id)
        .chain(roster.students.iter().map(|student| &student.group_id))
        .filter(|id| !reports.iter().any(|report| &report.group_id == *id))
        .collect();
    missing.sort();
    missing.dedup();
    missing
}

pub fn ranked(reports: &[GroupReport]) -> Vec<&GroupReport> {
    let mut ranked: Vec<&GroupReport> = reports.iter().collect();
    ranked.sort_by(|a, b| {
        b.sanitized_mean
            .total_cmp(&a.sanitized_mean)
            .then_with(|| a.group_id.cmp(&b.group_id))
    });
    ranked
}

fn format_self_score(report: &GroupReport) -> String {
    report
        .self_score
        .map(|score| format!("{score:.2}"))
        .unwrap_or_else(|| "-".to_string())
}

pub fn build_report(
    evaluation_id: &str,
    reports: &[GroupReport],
    breakdown: &BreakdownResult,
    final_rows: &[FinalScoreRow],
    roster: &Roster,
    top_groups: usize,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Peer Review Report");
    let _ = writeln!(output, "Evaluation: {}", evaluation_id.trim());
    let _ = writeln!(output);
    let _ = writeln!(output, "## Group Ranking");

    if reports.is_empty() {
        let _ = writeln!(output, "No peer votes recorded for this evaluation.");
    } else {
        let _ = writeln!(
            output,
            "| Group | Name | Votes | Raw mean | Std dev | Score | Self | Delta |"
        );
        let _ = writeln!(output, "|---|---|---|---|---|---|---|---|");
        for report in ranked(reports).into_iter().take(top_groups) {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {:.2} | {:.2} | {:.2} | {} | {:+.2} |",
                report.group_id,
                report.display_name,
                report.vote_count,
                report.raw_mean,
                report.std_dev,
                report.sanitized_mean,
                format_self_score(report),
                report.delta
            );
        }
    }

    let missing = groups_without_votes(reports, roster);
    if !missing.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Groups Without Peer Votes");
        for group_id in missing {
            let name = roster
                .group(group_id)
                .map(|group| group.name.as_str())
                .unwrap_or("unknown");
            let _ = writeln!(output, "- {} ({}): score 0, 0 votes", group_id, name);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Criterion Breakdown");

    let names = breakdown::criterion_names(&breakdown.rows);
    if breakdown.rows.is_empty() {
        let _ = writeln!(output, "No readable criteria ratings for this evaluation.");
    } else {
        let _ = writeln!(output, "| Group | {} |", names.join(" | "));
        let _ = writeln!(output, "|---|{}", "---|".repeat(names.len()));
        for row in &breakdown.rows {
            let cells: Vec<String> = names
                .iter()
                .map(|name| {
                    row.means
                        .get(name)
                        .map(|mean| format!("{mean:.2}"))
                        .unwrap_or_else(|| "-".to_string())
                })
                .collect();
            let _ = writeln!(output, "| {} | {} |", row.group_id, cells.join(" | "));
        }
    }
    if breakdown.skipped > 0 {
        let _ = writeln!(
            output,
            "\n{} vote(s) had unreadable criteria ratings and were left out of this table.",
            breakdown.skipped
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Final Scores");

    if final_rows.is_empty() {
        let _ = writeln!(output, "No students on the roster.");
    } else {
        for row in final_rows {
            let _ = writeln!(
                output,
                "- {} ({}, group {}): {:.2}",
                row.student_name,
                row.student_id,
                row.group_id,
                row.rounded_score()
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::build_group_reports;
    use crate::aggregate::tests::sample_vote;
    use crate::breakdown::build_breakdown;
    use crate::models::{Group, Student, Vote, VoteKind};
    use crate::sanitize::OutlierPolicy;

    fn roster() -> Roster {
        Roster {
            groups: vec![
                Group {
                    id: GroupId::new("1"),
                    name: "Solar Kiosk".to_string(),
                },
                Group {
                    id: GroupId::new("2"),
                    name: "Water Sensors".to_string(),
                },
                Group {
                    id: GroupId::new("3"),
                    name: "Library Bot".to_string(),
                },
            ],
            students: vec![
                student("0042", "Bruna Costa", "1"),
                student("0007", "Ana Lima", "1"),
                student("0101", "Caio Ramos", " 2 "),
                student("0150", "Davi Souza", "3"),
            ],
        }
    }

    fn student(id: &str, name: &str, group: &str) -> Student {
        Student {
            id: id.to_string(),
            name: name.to_string(),
            group_id: GroupId::new(group),
        }
    }

    fn reports_for(votes: &[Vote], roster: &Roster) -> Vec<GroupReport> {
        build_group_reports(votes, "seminar-1", roster, &OutlierPolicy::default())
    }

    fn votes() -> Vec<Vote> {
        vec![
            sample_vote("1", 4.0, VoteKind::Peer),
            sample_vote("1 ", 5.0, VoteKind::Peer),
            sample_vote("2", 3.333, VoteKind::Peer),
            sample_vote("2", 5.0, VoteKind::SelfAssessment),
        ]
    }

    #[test]
    fn every_student_appears_once() {
        let roster = roster();
        let reports = reports_for(&votes(), &roster);
        let rows = consolidate(&reports, &roster);

        assert_eq!(rows.len(), roster.students.len());
        for student in &roster.students {
            assert_eq!(rows.iter().filter(|r| r.student_id == student.id).count(), 1);
        }
    }

    #[test]
    fn members_share_group_score() {
        let roster = roster();
        let reports = reports_for(&votes(), &roster);
        let rows = consolidate(&reports, &roster);

        assert_eq!(rows[0].student_id, "0007");
        assert_eq!(rows[1].student_id, "0042");
        assert_eq!(rows[0].final_score, 4.5);
        assert_eq!(rows[1].final_score, 4.5);
        assert_eq!(rows[2].final_score, 3.333);
        assert_eq!(rows[2].rounded_score(), 3.33);
    }

    #[test]
    fn group_without_votes_defaults_to_zero() {
        let roster = roster();
        let reports = reports_for(&votes(), &roster);
        let rows = consolidate(&reports, &roster);

        let davi = rows.iter().find(|r| r.student_id == "0150").unwrap();
        assert_eq!(davi.final_score, 0.0);
        assert_eq!(davi.vote_count, 0);
        assert_eq!(groups_without_votes(&reports, &roster), vec![&GroupId::new("3")]);
    }

    #[test]
    fn export_table_is_named_after_evaluation() {
        let roster = roster();
        let reports = reports_for(&votes(), &roster);
        let table = export_table("grades_", " seminar-1 ", &consolidate(&reports, &roster));

        assert_eq!(table.name, "grades_seminar-1");
        assert_eq!(table.header, EXPORT_HEADER.to_vec());
        assert_eq!(table.rows.len(), 4);
        assert_eq!(table.rows[2], vec!["0101", "Caio Ramos", "2", "3.33"]);
        assert_eq!(table.rows[3][3], "0.00");
    }

    #[test]
    fn pipeline_is_idempotent() {
        let roster = roster();
        let run = || {
            let reports = reports_for(&votes(), &roster);
            let rows = consolidate(&reports, &roster);
            let mut buffer = Vec::new();
            write_csv(&export_table("grades_", "seminar-1", &rows), &mut buffer).unwrap();
            buffer
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn csv_output_has_header_and_rows() {
        let table = ExportTable {
            name: "grades_x".to_string(),
            header: EXPORT_HEADER.iter().map(|h| h.to_string()).collect(),
            rows: vec![vec![
                "0007".to_string(),
                "Ana, Lima".to_string(),
                "1".to_string(),
                "4.50".to_string(),
            ]],
        };
        let mut buffer = Vec::new();
        write_csv(&table, &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(
            text,
            "student_id,student_name,group_id,final_score\n0007,\"Ana, Lima\",1,4.50\n"
        );
    }

    #[test]
    fn markdown_report_lists_sections() {
        let roster = roster();
        let votes = votes();
        let reports = reports_for(&votes, &roster);
        let peer: Vec<&Vote> = votes.iter().filter(|v| v.kind == VoteKind::Peer).collect();
        let breakdown = build_breakdown(&peer);
        let rows = consolidate(&reports, &roster);

        let report = build_report("seminar-1", &reports, &breakdown, &rows, &roster, 10);
        assert!(report.contains("# Peer Review Report"));
        assert!(report.contains("| 1 | Solar Kiosk | 2 | 4.50 |"));
        assert!(report.contains("- 3 (Library Bot): score 0, 0 votes"));
        assert!(report.contains("| Group | Clarity | Content |"));
        assert!(report.contains("- Ana Lima (0007, group 1): 4.50"));
        assert!(report.contains("| +1.67 |"));
    }
}
