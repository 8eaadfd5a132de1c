use serde::{Deserialize, Serialize};

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the HTTP server binds to
    pub http_listen: String,

    /// File storage path: `:memory:` or a redb database file
    pub file_storage: String,

    /// Allowed Origin headers for provider socket upgrades; `*` allows any
    pub allowed_origins: Vec<String>,

    /// Provider selection strategy
    pub scheduler: SchedulerKind,

    /// Directory with the provider frontend to serve at `/`, if any
    pub static_files: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_listen: "127.0.0.1:4080".to_string(),
            file_storage: ":memory:".to_string(),
            allowed_origins: vec!["*".to_string()],
            scheduler: SchedulerKind::SimpleMatch,
            static_files: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_http_listen(mut self, addr: impl Into<String>) -> Self {
        self.http_listen = addr.into();
        self
    }

    pub fn with_file_storage(mut self, path: impl Into<String>) -> Self {
        self.file_storage = path.into();
        self
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_static_files(mut self, dir: impl Into<String>) -> Self {
        self.static_files = Some(dir.into());
        self
    }
}

/// Which provider selection strategy the dispatcher uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Any provider, no requirements checked
    AnyFree,
    /// One provider after the next in stable key order
    RoundRobin,
    /// Providers holding all required files, preferring free capacity
    #[default]
    SimpleMatch,
}

impl std::str::FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anyfree" | "any_free" => Ok(SchedulerKind::AnyFree),
            "roundrobin" | "round_robin" => Ok(SchedulerKind::RoundRobin),
            "simplematch" | "simple_match" => Ok(SchedulerKind::SimpleMatch),
            other => Err(format!("unknown scheduler: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.http_listen, "127.0.0.1:4080");
        assert_eq!(config.file_storage, ":memory:");
        assert_eq!(config.scheduler, SchedulerKind::SimpleMatch);
        assert!(config.static_files.is_none());
    }

    #[test]
    fn test_builder() {
        let config = Config::new()
            .with_http_listen("0.0.0.0:8080")
            .with_file_storage("/var/lib/wharf/files.redb")
            .with_scheduler(SchedulerKind::RoundRobin)
            .with_static_files("./dist");
        assert_eq!(config.http_listen, "0.0.0.0:8080");
        assert_eq!(config.file_storage, "/var/lib/wharf/files.redb");
        assert_eq!(config.scheduler, SchedulerKind::RoundRobin);
        assert_eq!(config.static_files.as_deref(), Some("./dist"));
    }

    #[test]
    fn test_scheduler_from_str() {
        assert_eq!(
            "simple_match".parse::<SchedulerKind>().unwrap(),
            SchedulerKind::SimpleMatch
        );
        assert_eq!(
            "RoundRobin".parse::<SchedulerKind>().unwrap(),
            SchedulerKind::RoundRobin
        );
        assert!("fancy".parse::<SchedulerKind>().is_err());
    }
}
