//! Shared CLI helpers and small reusable Clap fragments

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use crate::auth::User;
use crate::eventlog::EventLog;
use crate::ignore::{GlobIgnore, IgnorePolicy, NoIgnore};
use crate::retry::Retry;

/// Connection options shared by the push and monitor commands
#[derive(Clone, Debug, Parser)]
pub struct ConnOpts {
    /// Credentials as user:pass (first user authenticates the session)
    #[arg(short = 'u', long = "user", action = clap::ArgAction::Append)]
    pub users: Vec<String>,

    /// Number of retries for reconnects and command re-sends
    #[arg(short = 'R', long = "retry", default_value_t = 10)]
    pub retries: u32,

    /// Base wait between retries in milliseconds
    #[arg(short = 'W', long = "wait", default_value_t = 500)]
    pub wait_ms: u64,

    /// Exclude paths matching patterns (repeatable, * wildcards)
    #[arg(long = "exclude", action = clap::ArgAction::Append)]
    pub exclude: Vec<String>,

    /// Append applied events to this JSONL file
    #[arg(long = "event-log")]
    pub event_log: Option<PathBuf>,

    /// Verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl ConnOpts {
    pub fn parse_users(&self) -> Result<Vec<User>> {
        self.users.iter().map(|s| User::parse(s)).collect()
    }

    pub fn retry(&self) -> Retry {
        Retry::new(
            self.retries,
            Duration::from_millis(self.wait_ms),
            Duration::from_secs(30),
        )
    }

    pub fn ignore(&self) -> Arc<dyn IgnorePolicy> {
        if self.exclude.is_empty() {
            Arc::new(NoIgnore)
        } else {
            Arc::new(GlobIgnore::new(self.exclude.clone()))
        }
    }

    pub fn event_log(&self) -> Result<EventLog> {
        match &self.event_log {
            Some(path) => EventLog::new(path),
            None => Ok(EventLog::disabled()),
        }
    }
}
