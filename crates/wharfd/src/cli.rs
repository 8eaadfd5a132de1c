use clap::Parser;
use wharf_core::{Config, SchedulerKind};

/// Wharf broker: accepts offloading jobs and distributes tasks to
/// browser-resident compute providers.
#[derive(Debug, Parser)]
#[command(name = "wharfd", version, about)]
pub struct Cli {
    /// Address for the HTTP server to listen on
    #[arg(long, env = "WHARF_HTTP_LISTEN", default_value = "127.0.0.1:4080")]
    pub listen: String,

    /// File storage path, `:memory:` for a throwaway in-memory store
    #[arg(long, env = "WHARF_FILE_STORAGE", default_value = ":memory:")]
    pub file_storage: String,

    /// Allowed Origin headers for provider sockets (comma separated, `*` for any)
    #[arg(
        long,
        env = "WHARF_ALLOWED_ORIGINS",
        default_value = "*",
        value_delimiter = ','
    )]
    pub allowed_origins: Vec<String>,

    /// Provider selection strategy: any_free, round_robin or simple_match
    #[arg(long, env = "WHARF_SCHEDULER", default_value = "simple_match")]
    pub scheduler: SchedulerKind,

    /// Directory with the provider frontend to serve at `/`
    #[arg(long, env = "WHARF_STATIC_FILES")]
    pub static_files: Option<String>,

    /// Serve Prometheus metrics on `/metrics`
    #[arg(
        long,
        env = "WHARF_METRICS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub metrics: bool,

    /// Log filter when RUST_LOG is not set
    #[arg(long, env = "WHARF_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn into_config(self) -> (Config, bool, String) {
        let mut config = Config::new()
            .with_http_listen(self.listen)
            .with_file_storage(self.file_storage)
            .with_allowed_origins(self.allowed_origins)
            .with_scheduler(self.scheduler);
        if let Some(dir) = self.static_files {
            config = config.with_static_files(dir);
        }
        (config, self.metrics, self.log_level)
    }
}
