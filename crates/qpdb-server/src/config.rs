//! Command-line configuration.
//!
//! Every flag can also be set through a `QPDB_*` environment variable.

use crate::logging::LOG_FILE_NAME;
use crate::store::symserver::DEFAULT_SYMBOL_SERVER;
use anyhow::{bail, Context};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "qpdb-server",
    version,
    about = "Resolve symbol addresses, struct field offsets and enum values from PDBs over HTTP"
)]
pub struct Args {
    /// Address to listen on
    #[arg(short, long, env = "QPDB_IP", default_value = "0.0.0.0")]
    pub ip: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "QPDB_PORT", default_value_t = 8080)]
    pub port: u16,

    /// PDB cache directory
    #[arg(short = 'd', long, env = "QPDB_PATH", default_value = "save")]
    pub path: PathBuf,

    /// Symbol server base URL
    #[arg(short, long, env = "QPDB_SERVER", default_value = DEFAULT_SYMBOL_SERVER)]
    pub server: String,

    /// Also write logs to server.log
    #[arg(short, long, env = "QPDB_LOG")]
    pub log: bool,
}

/// Validated runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub bind: SocketAddr,
    pub cache_dir: PathBuf,
    pub symbol_server: String,
    pub log_file: Option<PathBuf>,
}

impl Settings {
    pub fn from_args(args: Args) -> anyhow::Result<Self> {
        check_server_url(&args.server)
            .with_context(|| format!("invalid symbol server URL {:?}", args.server))?;
        Ok(Settings {
            bind: SocketAddr::new(args.ip, args.port),
            cache_dir: args.path,
            symbol_server: args.server,
            log_file: args.log.then(|| PathBuf::from(LOG_FILE_NAME)),
        })
    }
}

/// Accept `http://host[/path]` or `https://host[/path]`.
fn check_server_url(url: &str) -> anyhow::Result<()> {
    let Some(rest) = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
    else {
        bail!("scheme must be http or https");
    };
    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() || host.contains(char::is_whitespace) {
        bail!("missing host");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("qpdb-server").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        // Only meaningful when no QPDB_* variables leak in from the environment.
        if std::env::vars().any(|(k, _)| k.starts_with("QPDB_")) {
            return;
        }
        let settings = Settings::from_args(parse(&[])).unwrap();
        assert_eq!(settings.bind, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(settings.cache_dir, PathBuf::from("save"));
        assert_eq!(settings.symbol_server, DEFAULT_SYMBOL_SERVER);
        assert_eq!(settings.log_file, None);
    }

    #[test]
    fn test_short_flags() {
        let args = parse(&[
            "-i", "127.0.0.1", "-p", "9025", "-d", "/tmp/pdbs", "-s", "https://symbols.example/", "-l",
        ]);
        let settings = Settings::from_args(args).unwrap();
        assert_eq!(settings.bind, "127.0.0.1:9025".parse().unwrap());
        assert_eq!(settings.cache_dir, PathBuf::from("/tmp/pdbs"));
        assert_eq!(settings.symbol_server, "https://symbols.example/");
        assert_eq!(settings.log_file, Some(PathBuf::from("server.log")));
    }

    #[test]
    fn test_rejects_bad_port() {
        let res = Args::try_parse_from(["qpdb-server", "--port", "70000"]);
        assert!(res.is_err());
    }

    #[test]
    fn test_server_url_validation() {
        assert!(check_server_url("http://msdl.microsoft.com/download/symbols/").is_ok());
        assert!(check_server_url("https://symbols.example").is_ok());
        assert!(check_server_url("http://10.0.0.5:8000/sym").is_ok());
        assert!(check_server_url("ftp://symbols.example/").is_err());
        assert!(check_server_url("msdl.microsoft.com/download/symbols").is_err());
        assert!(check_server_url("http:///symbols").is_err());
        assert!(check_server_url("").is_err());
    }

    #[test]
    fn test_invalid_server_url_fails_settings() {
        let err = Settings::from_args(parse(&["--server", "not a url"])).unwrap_err();
        assert!(err.to_string().contains("invalid symbol server URL"));
    }
}
