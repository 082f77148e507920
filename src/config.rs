//! Process configuration: CLI flags only, parsed once at startup into
//! a `Config` that is threaded explicitly through the store, evaluator,
//! and HTTP router. No config file, no environment layer: a flat set
//! of flags is enough for a single-binary service like this one.

use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "kmvd", about = "KMV sketch storage service")]
pub struct Config {
    /// HTTP service address.
    #[structopt(long, default_value = "127.0.0.1:8080")]
    pub http: String,

    /// Number of store worker threads.
    #[structopt(long, default_value = "1")]
    pub nworkers: usize,

    /// Default KMV capacity for sketches created implicitly.
    #[structopt(long = "default-size", default_value = "1024")]
    pub default_size: usize,

    /// Storage directory for the embedded key-value store.
    #[structopt(long, default_value = "./db/tmp")]
    pub db: std::path::PathBuf,

    /// In-memory cache budget (bytes) handed to the embedded store.
    #[structopt(long = "cache-capacity", default_value = "1073741824")]
    pub cache_capacity: u64,

    /// `tracing` filter directive controlling log verbosity.
    #[structopt(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Print the version string and exit.
    #[structopt(long)]
    pub version: bool,
}

impl Config {
    /// Bounded command channel capacity, tied to worker count by
    /// default; a dedicated flag isn't exposed since no deployment has
    /// needed to decouple the two.
    pub fn channel_capacity(&self) -> usize {
        self.nworkers.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::from_iter(["kmvd"]);
        assert_eq!(cfg.http, "127.0.0.1:8080");
        assert_eq!(cfg.nworkers, 1);
        assert_eq!(cfg.default_size, 1024);
        assert_eq!(cfg.db, std::path::PathBuf::from("./db/tmp"));
        assert_eq!(cfg.cache_capacity, 1 << 30);
        assert_eq!(cfg.log_level, "info");
        assert!(!cfg.version);
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = Config::from_iter([
            "kmvd",
            "--http",
            "0.0.0.0:9090",
            "--nworkers",
            "4",
            "--default-size",
            "256",
        ]);
        assert_eq!(cfg.http, "0.0.0.0:9090");
        assert_eq!(cfg.nworkers, 4);
        assert_eq!(cfg.default_size, 256);
        assert_eq!(cfg.channel_capacity(), 4);
    }
}
