//! Command line: `cacheserver [cache_dir] [port] [quota_mb] [--config FILE]`.

use std::path::PathBuf;

use assetcache_server::{ServerConfig, ServerError};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "cacheserver", version)]
#[command(about = "Shares build artifacts between machines")]
pub struct Args {
    /// Directory holding cached artifacts (created if missing)
    pub cache_dir: Option<PathBuf>,

    /// TCP port to listen on
    pub port: Option<u16>,

    /// Disk quota for the cache directory, in MiB
    pub quota_mb: Option<u64>,

    /// TOML configuration file; positional arguments override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl Args {
    /// Merges the configuration file (if any) with command line overrides.
    pub fn resolve(&self) -> Result<ServerConfig, ServerError> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(quota) = self.quota_mb {
            config.quota_mb = quota;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_arguments() {
        let args = Args::try_parse_from(["cacheserver", "/srv/cache", "4000", "50"]).unwrap();
        let config = args.resolve().unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/srv/cache"));
        assert_eq!(config.port, 4000);
        assert_eq!(config.quota_mb, 50);
    }

    #[test]
    fn defaults_without_arguments() {
        let config = Args::try_parse_from(["cacheserver"]).unwrap().resolve().unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("AssetCache"));
        assert_eq!(config.port, 20);
        assert_eq!(config.quota_mb, 1024);
    }

    #[test]
    fn arguments_override_config_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.toml");
        std::fs::write(&path, "port = 7000\nquota_mb = 64\nidentifier = \"Farm\"\n").unwrap();

        let args = Args::try_parse_from([
            "cacheserver",
            "/data/cache",
            "7100",
            "--config",
            path.to_str().unwrap(),
        ])
        .unwrap();
        let config = args.resolve().unwrap();
        assert_eq!(config.port, 7100);
        assert_eq!(config.quota_mb, 64);
        assert_eq!(config.identifier, "Farm");
    }

    #[test]
    fn zero_quota_rejected() {
        let args = Args::try_parse_from(["cacheserver", "c", "20", "0"]).unwrap();
        assert!(matches!(args.resolve(), Err(ServerError::InvalidConfig(_))));
    }

    #[test]
    fn non_numeric_port_rejected() {
        assert!(Args::try_parse_from(["cacheserver", "c", "http"]).is_err());
    }
}
