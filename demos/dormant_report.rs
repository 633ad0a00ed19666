use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;

use dormant_users::{ActivityType, Cutoff, DormantUserReporterBuilder, ProgressEvent};

/// Usage: dormant_report <org> "<Mon D YYYY>" [activity types...]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let org = args
        .next()
        .or_else(|| std::env::var("DORMANT_ORG").ok())
        .ok_or_else(|| anyhow::anyhow!("usage: dormant_report <org> \"Jan 2 2006\" [types...]"))?;
    let date = args.next().unwrap_or_else(|| {
        let month_ago = chrono::Utc::now() - chrono::Duration::days(30);
        month_ago.format("%b %-d %Y").to_string()
    });
    let tags: Vec<String> = args.collect();

    let cutoff = Cutoff::parse(&date)?;
    let enabled = ActivityType::parse_set(&tags)?;

    let reporter = DormantUserReporterBuilder::new()
        .fetch_emails(true)
        .on_progress(Arc::new(|event: ProgressEvent| {
            if let ProgressEvent::Advanced {
                repository,
                activity,
                completed,
                total,
            } = event
            {
                println!("   [{}/{}] {} {}", completed, total, repository, activity);
            }
        }))
        .build()?;

    println!("Checking {} for activity since {}...\n", org, cutoff.to_iso());
    let report = reporter.run(&org, &cutoff, &enabled).await?;

    println!("\n=== Summary ===");
    println!("{}", report.stats);

    if !report.skipped.is_empty() {
        println!("Skipped fetches:");
        for skip in &report.skipped {
            println!("  {} {}: {}", skip.repository, skip.activity, skip.reason);
        }
        println!();
    }

    println!("Dormant members:");
    for row in report.dormant().take(20) {
        println!("  {}", row.username);
    }

    let path = report.file_name();
    report.write_csv(BufWriter::new(File::create(&path)?))?;
    println!("\n✓ Report written to {}", path);

    Ok(())
}
