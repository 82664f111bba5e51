use anyhow::Result;
use clap::Parser;
use colored::*;
use tracing::{debug, error};

use course_mirror::{CourseMirror, MirrorCommand, Session};

#[tokio::main]
async fn main() -> Result<()> {
    let args = MirrorCommand::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    debug!(courses = ?args.course_ids, base_url = %args.base_url, "CLI arguments parsed");

    let config = args.to_config();
    let session = match args.credentials()? {
        Some(credentials) => Session::login(&config, &credentials).await?,
        None => Session::anonymous(&config)?,
    };
    let mirror = CourseMirror::new(session, config)?;

    let mut failures = Vec::new();
    for course_id in &args.course_ids {
        match mirror.mirror_course(course_id).await {
            Ok(report) => {
                let stats = report.stats;
                println!(
                    "{} {} -> {} ({} fetched, {} reused, {} sections, {} skipped, {} failed)",
                    "✔".green(),
                    report.title.bold(),
                    report.path.display(),
                    stats.fetched,
                    stats.reused,
                    stats.sub_pages,
                    stats.skipped,
                    stats.failed,
                );
            }
            Err(e) => {
                error!(course_id = %course_id, error = %format!("{:#}", e), "Course mirror failed");
                println!("{} course {}: {:#}", "✘".red(), course_id, e);
                failures.push(course_id.clone());
            }
        }
    }

    if !failures.is_empty() {
        anyhow::bail!("{} of {} courses failed: {}", failures.len(), args.course_ids.len(), failures.join(", "));
    }

    Ok(())
}
