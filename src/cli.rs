use anyhow::{bail, Result};
use clap::builder::RangedU64ValueParser;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::config::{MirrorConfig, RetryPolicy};
use crate::session::Credentials;

#[derive(Parser, Debug)]
#[command(
    name = "course-mirror",
    about = "A CLI utility to mirror Moodle courses for offline archival",
    version,
    long_about = "Logs in once, then saves each course page with its resources, images, stylesheets and scripts. Section pages linked from a course are mirrored one level deep and every link is rewritten to the local copy."
)]
pub struct MirrorCommand {
    /// Course IDs to mirror (the `id=` of `course/view.php`)
    #[arg(required = true, value_parser = parse_course_id)]
    pub course_ids: Vec<String>,

    /// Root URL of the Moodle site
    #[arg(short = 'b', long, env = "MOODLE_URL")]
    pub base_url: Url,

    /// Login form URL of the single sign-on service
    #[arg(long, env = "MOODLE_AUTH_URL")]
    pub auth_url: Option<Url>,

    #[arg(short = 'u', long, env = "MOODLE_USERNAME")]
    pub username: Option<String>,

    #[arg(short = 'p', long, env = "MOODLE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Hidden `execution` value of the login form
    #[arg(long, env = "MOODLE_EXECUTION", default_value = "")]
    pub execution: String,

    /// Output directory for the mirrored courses
    #[arg(short, long, default_value = "./output")]
    pub output_dir: PathBuf,

    /// Maximum concurrent asset downloads per page
    #[arg(short = 'c', long, default_value = "8", value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub max_concurrent: usize,

    /// Timeout for requests in seconds
    #[arg(long, default_value = "60", value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: u64,

    /// Attempts to write a file that another process holds locked
    #[arg(long, default_value = "10", value_parser = clap::value_parser!(u32).range(1..))]
    pub write_retries: u32,

    /// Delay between locked-file write attempts, in milliseconds
    #[arg(long, default_value = "250")]
    pub write_retry_delay_ms: u64,

    /// Accept invalid TLS certificates
    #[arg(long)]
    pub insecure: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors and hide progress bars
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

fn parse_course_id(value: &str) -> Result<String, String> {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
        Ok(value.to_string())
    } else {
        Err(format!("course ID must be numeric, got {:?}", value))
    }
}

impl MirrorCommand {
    pub fn to_config(&self) -> MirrorConfig {
        let mut config = MirrorConfig::new(self.base_url.clone(), &self.output_dir);
        config.max_concurrent = self.max_concurrent;
        config.timeout = Duration::from_secs(self.timeout);
        config.write_retry = RetryPolicy {
            attempts: self.write_retries,
            delay: Duration::from_millis(self.write_retry_delay_ms),
        };
        config.accept_invalid_certs = self.insecure;
        config.show_progress = !self.quiet;
        config
    }

    /// Login details, or `None` for an anonymous session when none were given.
    pub fn credentials(&self) -> Result<Option<Credentials>> {
        match (&self.auth_url, &self.username, &self.password) {
            (None, None, None) => Ok(None),
            (Some(auth_url), Some(username), Some(password)) => Ok(Some(Credentials {
                auth_url: auth_url.clone(),
                username: username.clone(),
                password: password.clone(),
                execution: self.execution.clone(),
            })),
            _ => bail!("--auth-url, --username and --password must be given together"),
        }
    }

    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: [&str; 3] = ["course-mirror", "--base-url", "https://moodle.example.ac.uk"];

    fn parse(extra: &[&str]) -> Result<MirrorCommand, clap::Error> {
        let args: Vec<&str> = BASE.iter().chain(extra.iter()).copied().collect();
        MirrorCommand::try_parse_from(args)
    }

    #[test]
    fn test_parse_basic_args() {
        let args = parse(&["123", "-o", "./archive"]).unwrap();

        assert_eq!(args.course_ids, vec!["123".to_string()]);
        assert_eq!(args.output_dir, PathBuf::from("./archive"));
        assert_eq!(args.max_concurrent, 8);
        assert_eq!(args.timeout, 60);
        assert!(!args.insecure);

        let config = args.to_config();
        assert_eq!(config.base_url.as_str(), "https://moodle.example.ac.uk/");
        assert_eq!(config.write_retry.attempts, 10);
        assert!(config.show_progress);
    }

    #[test]
    fn test_parse_all_args() {
        let args = parse(&[
            "123",
            "456",
            "--auth-url",
            "https://auth.example.ac.uk/login",
            "-u",
            "student",
            "-p",
            "secret",
            "--execution",
            "e1s1",
            "-c",
            "20",
            "--timeout",
            "5",
            "--write-retries",
            "3",
            "--write-retry-delay-ms",
            "10",
            "--insecure",
            "-q",
        ])
        .unwrap();

        assert_eq!(args.course_ids, vec!["123".to_string(), "456".to_string()]);
        let config = args.to_config();
        assert_eq!(config.max_concurrent, 20);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.write_retry.delay, Duration::from_millis(10));
        assert!(config.accept_invalid_certs);
        assert!(!config.show_progress);
        assert_eq!(args.log_level(), "error");

        let credentials = args.credentials().unwrap().unwrap();
        assert_eq!(credentials.username, "student");
        assert_eq!(credentials.execution, "e1s1");
    }

    #[test]
    fn test_anonymous_and_partial_credentials() {
        assert!(parse(&["123"]).unwrap().credentials().unwrap().is_none());
        assert!(parse(&["123", "-u", "student"]).unwrap().credentials().is_err());
    }

    #[test]
    fn test_parse_missing_course() {
        assert!(parse(&[]).is_err());
    }

    #[test]
    fn test_parse_invalid_course_id() {
        assert!(parse(&["abc"]).is_err());
    }

    #[test]
    fn test_parse_invalid_concurrent() {
        assert!(parse(&["123", "-c", "0"]).is_err());
    }

    #[test]
    fn test_verbosity() {
        assert_eq!(parse(&["123"]).unwrap().log_level(), "info");
        assert_eq!(parse(&["123", "-vv"]).unwrap().log_level(), "trace");
    }
}
