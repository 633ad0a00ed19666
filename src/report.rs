//! Report assembly, CSV output and CSV re-reading.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregationOutcome, SkippedFetch};
use crate::config::Cutoff;
use crate::error::{DormantError, Result};
use crate::types::User;

pub const CSV_HEADER: [&str; 4] = ["Username", "Email", "Active", "ActivityTypes"];

const SAMPLE_SIZE: usize = 10;

/// One line of the report table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    pub username: String,
    pub email: String,
    pub active: bool,
    /// Comma-joined activity tags, or `none`.
    pub activity_types: String,
}

impl From<&User> for ReportRow {
    fn from(user: &User) -> Self {
        let activity_types = if user.activity_types.is_empty() {
            "none".to_string()
        } else {
            user.activity_types
                .iter()
                .map(|a| a.as_str())
                .collect::<Vec<_>>()
                .join(",")
        };

        Self {
            username: user.login.clone(),
            email: user.email.clone().unwrap_or_default(),
            active: user.is_active(),
            activity_types,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub username: String,
    pub has_email: bool,
    pub active: bool,
    pub activity_types: String,
}

/// Aggregate figures over a report table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportStats {
    pub total_users: usize,
    pub active_users: usize,
    pub dormant_users: usize,
    pub dormant_percent: f64,
    pub users_with_email: usize,
    /// Active users per activity tag.
    pub activity_counts: BTreeMap<String, usize>,
    pub sample_active: Vec<UserSummary>,
    pub sample_dormant: Vec<UserSummary>,
}

impl ReportStats {
    pub fn from_rows(rows: &[ReportRow]) -> Self {
        let mut stats = ReportStats::default();
        for row in rows {
            stats.add_row(row);
        }
        stats.finish();
        stats
    }

    /// Re-read a table written by [`write_csv`] (or any CSV with
    /// `username`, `active` and `activitytypes` columns, in any order and
    /// any letter case).
    pub fn from_csv<R: Read>(mut reader: R) -> Result<Self> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;

        let records = parse_csv(&text)?;
        let Some((header, body)) = records.split_first() else {
            return Err(DormantError::ReportFormat("CSV file is empty".to_string()));
        };

        let columns: HashMap<String, usize> = header
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim().to_lowercase(), i))
            .collect();
        let column = |name: &str| {
            columns
                .get(name)
                .copied()
                .ok_or_else(|| DormantError::ReportFormat(format!("missing required column: {}", name)))
        };
        let username_col = column("username")?;
        let active_col = column("active")?;
        let types_col = column("activitytypes")?;
        let email_col = columns.get("email").copied();

        let mut stats = ReportStats::default();
        for record in body {
            if record.len() <= username_col {
                continue;
            }
            let field = |i: usize| record.get(i).map(String::as_str).unwrap_or("");

            let row = ReportRow {
                username: field(username_col).to_string(),
                email: email_col.map(field).unwrap_or("").to_string(),
                active: field(active_col).trim().eq_ignore_ascii_case("true"),
                activity_types: field(types_col).to_string(),
            };
            stats.add_row(&row);
        }
        stats.finish();

        Ok(stats)
    }

    pub fn active_percent(&self) -> f64 {
        percent(self.active_users, self.total_users)
    }

    pub fn email_percent(&self) -> f64 {
        percent(self.users_with_email, self.total_users)
    }

    fn add_row(&mut self, row: &ReportRow) {
        self.total_users += 1;

        let has_email = !row.email.is_empty();
        if has_email {
            self.users_with_email += 1;
        }

        let summary = UserSummary {
            username: row.username.clone(),
            has_email,
            active: row.active,
            activity_types: row.activity_types.clone(),
        };

        if row.active {
            self.active_users += 1;
            if row.activity_types != "none" {
                for tag in row.activity_types.split(',').map(str::trim) {
                    if !tag.is_empty() {
                        *self.activity_counts.entry(tag.to_string()).or_default() += 1;
                    }
                }
            }
            if self.sample_active.len() < SAMPLE_SIZE {
                self.sample_active.push(summary);
            }
        } else {
            self.dormant_users += 1;
            if self.sample_dormant.len() < SAMPLE_SIZE {
                self.sample_dormant.push(summary);
            }
        }
    }

    fn finish(&mut self) {
        self.dormant_percent = percent(self.dormant_users, self.total_users);
    }
}

impl fmt::Display for ReportStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total users:    {}", self.total_users)?;
        writeln!(
            f,
            "Active users:   {} ({:.1}%)",
            self.active_users,
            self.active_percent()
        )?;
        writeln!(
            f,
            "Dormant users:  {} ({:.1}%)",
            self.dormant_users, self.dormant_percent
        )?;
        writeln!(
            f,
            "With email:     {} ({:.1}%)",
            self.users_with_email,
            self.email_percent()
        )?;

        if !self.activity_counts.is_empty() {
            writeln!(f, "Activity among active users:")?;
            let mut counts: Vec<_> = self.activity_counts.iter().collect();
            counts.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            for (tag, count) in counts {
                writeln!(
                    f,
                    "  {}: {} ({:.1}% of active)",
                    tag,
                    count,
                    percent(*count, self.active_users)
                )?;
            }
        }
        Ok(())
    }
}

/// Final result of a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DormantReport {
    pub organization: String,
    /// ISO-8601 cutoff the activity was counted from.
    pub since: String,
    pub generated_at: DateTime<Utc>,
    /// Sorted by username.
    pub rows: Vec<ReportRow>,
    pub stats: ReportStats,
    pub skipped: Vec<SkippedFetch>,
}

impl DormantReport {
    pub fn assemble(organization: &str, cutoff: &Cutoff, outcome: AggregationOutcome) -> Self {
        let mut rows: Vec<ReportRow> = outcome.users.iter().map(ReportRow::from).collect();
        rows.sort_by(|a, b| a.username.cmp(&b.username));
        let stats = ReportStats::from_rows(&rows);

        Self {
            organization: organization.to_string(),
            since: cutoff.to_iso(),
            generated_at: Utc::now(),
            rows,
            stats,
            skipped: outcome.skipped,
        }
    }

    /// Default output file name, `<org>-dormant-users.csv`.
    pub fn file_name(&self) -> String {
        format!("{}-dormant-users.csv", self.organization)
    }

    pub fn dormant(&self) -> impl Iterator<Item = &ReportRow> {
        self.rows.iter().filter(|r| !r.active)
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        write_csv(&self.rows, writer)
    }
}

/// Write rows under the `Username,Email,Active,ActivityTypes` header.
pub fn write_csv<W: Write>(rows: &[ReportRow], mut writer: W) -> Result<()> {
    write_record(&mut writer, &CSV_HEADER)?;
    for row in rows {
        let active = if row.active { "true" } else { "false" };
        write_record(
            &mut writer,
            &[
                row.username.as_str(),
                row.email.as_str(),
                active,
                row.activity_types.as_str(),
            ],
        )?;
    }
    writer.flush()?;
    Ok(())
}

fn write_record<W: Write>(writer: &mut W, fields: &[&str]) -> Result<()> {
    let line = fields
        .iter()
        .map(|f| quote_field(f))
        .collect::<Vec<_>>()
        .join(",");
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    Ok(())
}

fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Split RFC 4180 text into records. Blank lines are dropped.
fn parse_csv(text: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                record.push(std::mem::take(&mut field));
                push_record(&mut records, std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(DormantError::ReportFormat(
            "unterminated quoted field".to_string(),
        ));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        push_record(&mut records, record);
    }

    Ok(records)
}

fn push_record(records: &mut Vec<Vec<String>>, record: Vec<String>) {
    let blank = record.len() == 1 && record[0].is_empty();
    if !blank {
        records.push(record);
    }
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityType;

    fn scenario_users() -> Vec<User> {
        let mut alice = User::new("alice", 1);
        alice.mark_active(ActivityType::Commits);
        alice.email = Some("alice@acme.io".to_string());
        let mut bob = User::new("bob", 2);
        bob.mark_active(ActivityType::Issues);
        let carol = User::new("carol", 3);
        vec![carol, alice, bob]
    }

    fn scenario_report() -> DormantReport {
        let cutoff = Cutoff::parse("Jan 1 2025").unwrap();
        DormantReport::assemble(
            "acme",
            &cutoff,
            AggregationOutcome {
                users: scenario_users(),
                skipped: Vec::new(),
            },
        )
    }

    #[test]
    fn test_assembled_rows_are_sorted_and_labelled() {
        let report = scenario_report();
        let names: Vec<_> = report.rows.iter().map(|r| r.username.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob", "carol"]);

        assert_eq!(report.rows[0].activity_types, "commits");
        assert_eq!(report.rows[2].activity_types, "none");
        assert!(!report.rows[2].active);
        assert_eq!(report.since, "2025-01-01T00:00:00Z");
        assert_eq!(report.file_name(), "acme-dormant-users.csv");
    }

    #[test]
    fn test_scenario_stats() {
        let stats = scenario_report().stats;
        assert_eq!(stats.total_users, 3);
        assert_eq!(stats.active_users, 2);
        assert_eq!(stats.dormant_users, 1);
        assert_eq!(format!("{:.1}", stats.dormant_percent), "33.3");
        assert_eq!(stats.activity_counts.get("commits"), Some(&1));
        assert_eq!(stats.activity_counts.get("issues"), Some(&1));
        assert_eq!(stats.users_with_email, 1);
    }

    #[test]
    fn test_multiple_types_are_comma_joined() {
        let mut user = User::new("dave", 4);
        user.mark_active(ActivityType::PrComments);
        user.mark_active(ActivityType::Commits);
        assert_eq!(ReportRow::from(&user).activity_types, "commits,pr-comments");
    }

    #[test]
    fn test_csv_round_trip() {
        let report = scenario_report();
        let mut buffer = Vec::new();
        report.write_csv(&mut buffer).unwrap();

        let text = String::from_utf8(buffer.clone()).unwrap();
        assert!(text.starts_with("Username,Email,Active,ActivityTypes\n"));
        assert!(text.contains("alice,alice@acme.io,true,commits\n"));
        assert!(text.contains("carol,,false,none\n"));

        let stats = ReportStats::from_csv(buffer.as_slice()).unwrap();
        assert_eq!(stats, report.stats);
    }

    #[test]
    fn test_csv_quotes_fields_with_commas() {
        let rows = vec![ReportRow {
            username: "erin".to_string(),
            email: "\"erin\"@acme.io".to_string(),
            active: true,
            activity_types: "commits,issues".to_string(),
        }];
        let mut buffer = Vec::new();
        write_csv(&rows, &mut buffer).unwrap();

        let text = String::from_utf8(buffer.clone()).unwrap();
        assert!(text.contains(r#"erin,"""erin""@acme.io",true,"commits,issues""#));

        let stats = ReportStats::from_csv(buffer.as_slice()).unwrap();
        assert_eq!(stats.activity_counts.get("commits"), Some(&1));
        assert_eq!(stats.activity_counts.get("issues"), Some(&1));
        assert_eq!(stats.sample_active[0].activity_types, "commits,issues");
    }

    #[test]
    fn test_from_csv_locates_columns_by_name() {
        let csv = "ActivityTypes,ACTIVE,username\r\nissues,TRUE,zed\r\nnone,false,amy\r\n\r\n";
        let stats = ReportStats::from_csv(csv.as_bytes()).unwrap();
        assert_eq!(stats.total_users, 2);
        assert_eq!(stats.active_users, 1);
        assert_eq!(stats.users_with_email, 0);
        assert_eq!(stats.sample_active[0].username, "zed");
        assert_eq!(stats.sample_dormant[0].username, "amy");
    }

    #[test]
    fn test_from_csv_rejects_bad_input() {
        assert!(matches!(
            ReportStats::from_csv("".as_bytes()),
            Err(DormantError::ReportFormat(_))
        ));
        let err = ReportStats::from_csv("Username,Email\nalice,a@x.io\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("active"));
        assert!(ReportStats::from_csv("Username,Active,ActivityTypes\n\"alice,true".as_bytes()).is_err());
    }

    #[test]
    fn test_samples_are_capped() {
        let rows: Vec<ReportRow> = (0..25)
            .map(|i| ReportRow {
                username: format!("user{:02}", i),
                email: String::new(),
                active: i % 2 == 0,
                activity_types: if i % 2 == 0 { "commits" } else { "none" }.to_string(),
            })
            .collect();
        let stats = ReportStats::from_rows(&rows);
        assert_eq!(stats.active_users, 13);
        assert_eq!(stats.sample_active.len(), 10);
        assert_eq!(stats.sample_dormant.len(), 10);
        assert_eq!(stats.activity_counts.get("commits"), Some(&13));
        assert!(!stats.activity_counts.contains_key("none"));
    }

    #[test]
    fn test_empty_table_has_zero_percentages() {
        let stats = ReportStats::from_rows(&[]);
        assert_eq!(stats.dormant_percent, 0.0);
        assert_eq!(stats.active_percent(), 0.0);
        assert!(stats.to_string().contains("Total users:    0"));
    }
}
