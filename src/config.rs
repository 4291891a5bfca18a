use std::time::Duration;

use crate::lsn::Lsn;
use crate::protocol::Startup;

/// Value of the `replication` startup parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Ordinary session; the key is omitted.
    #[default]
    Off,
    /// `replication=true`: physical replication walsender.
    Physical,
    /// `replication=database`: walsender bound to `database`.
    Database,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,

    pub user: String,
    pub database: Option<String>,

    pub replication: ReplicationMode,
    pub application_name: Option<String>,

    /// Extra startup parameters, sent in order after the ones above.
    pub options: Vec<(String, String)>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5432,
            user: "postgres".into(),
            database: None,
            replication: ReplicationMode::Physical,
            application_name: Some("pg-replicant".into()),
            options: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn startup_message(&self) -> Startup {
        let mut msg = Startup::new(self.user.as_str());
        if let Some(db) = &self.database {
            msg = msg.with_param("database", db.as_str());
        }
        match self.replication {
            ReplicationMode::Off => {}
            ReplicationMode::Physical => msg = msg.with_param("replication", "true"),
            ReplicationMode::Database => msg = msg.with_param("replication", "database"),
        }
        if let Some(name) = &self.application_name {
            msg = msg.with_param("application_name", name.as_str());
        }
        for (k, v) in &self.options {
            msg = msg.with_param(k.as_str(), v.as_str());
        }
        msg
    }
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub connection: ConnectionConfig,

    /// Resume point. `None` starts at the server's current position as
    /// reported by IDENTIFY_SYSTEM; the timeline always comes from there.
    pub resume_from: Option<Lsn>,

    /// Optional bound: stop once an XLogData ending at or past this position
    /// has been delivered.
    pub stop_at: Option<Lsn>,

    /// `xmin` reported in HotStandbyFeedback replies.
    pub feedback_xmin: u32,

    /// If no server messages arrive within this interval, treat it as an error.
    pub idle_timeout: Duration,

    /// Bounded buffer size (#events) between replication worker and consumer.
    pub buffer_events: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            resume_from: None,
            stop_at: None,
            feedback_xmin: 0,
            idle_timeout: Duration::from_secs(30),
            buffer_events: 8192,
        }
    }
}
