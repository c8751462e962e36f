use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_derive::Deserialize;

fn default_net_endpoint() -> String {
    "0.0.0.0:25565".to_string()
}

fn default_chunk_cache() -> usize {
    2048
}

/// Tunables read from an optional `server.toml` next to the binary.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_net_endpoint")]
    pub net_endpoint: String,
    /// Resident chunk bound before cold chunks become eligible for
    /// eviction.
    #[serde(default = "default_chunk_cache")]
    pub chunk_cache: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            net_endpoint: default_net_endpoint(),
            chunk_cache: default_chunk_cache(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> io::Result<ServerConfig> {
        let data = fs::read_to_string(path)?;
        toml::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn load_or_default(path: &Path) -> io::Result<ServerConfig> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(ServerConfig::default())
        }
    }
}

/// Command-line launch state: the world directory plus the optional
/// connection recorder/replayer flags.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub world_root: PathBuf,
    pub record: Option<PathBuf>,
    pub replay: Option<PathBuf>,
}

impl LaunchOptions {
    pub fn parse<I>(mut args: I) -> Result<LaunchOptions, String>
    where
        I: Iterator<Item = String>,
    {
        let mut world_root = None;
        let mut record = None;
        let mut replay = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-record" => {
                    let value = args.next().ok_or("-record requires a file argument")?;
                    record = Some(PathBuf::from(value));
                }
                "-replay" => {
                    let value = args.next().ok_or("-replay requires a file argument")?;
                    replay = Some(PathBuf::from(value));
                }
                _ if world_root.is_none() && !arg.starts_with('-') => {
                    world_root = Some(PathBuf::from(arg));
                }
                other => return Err(format!("unexpected argument {:?}", other)),
            }
        }

        Ok(LaunchOptions {
            world_root: world_root.ok_or("missing world directory argument")?,
            record,
            replay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<LaunchOptions, String> {
        LaunchOptions::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn world_root_is_required() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["-record", "log.bin"]).is_err());
    }

    #[test]
    fn parses_world_and_flags() {
        let options = parse(&["-record", "log.bin", "world"]).unwrap();
        assert_eq!(options.world_root, PathBuf::from("world"));
        assert_eq!(options.record, Some(PathBuf::from("log.bin")));
        assert_eq!(options.replay, None);

        let options = parse(&["world", "-replay", "log.bin"]).unwrap();
        assert_eq!(options.replay, Some(PathBuf::from("log.bin")));
    }

    #[test]
    fn rejects_unknown_flags() {
        assert!(parse(&["-verbose", "world"]).is_err());
    }

    #[test]
    fn config_defaults_apply() {
        let config = ServerConfig::default();
        assert_eq!(config.net_endpoint, "0.0.0.0:25565");
        assert_eq!(config.chunk_cache, 2048);

        let parsed: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(parsed.net_endpoint, config.net_endpoint);
    }

    #[test]
    fn config_parses_toml() {
        let parsed: ServerConfig =
            toml::from_str("net_endpoint = \"127.0.0.1:9999\"\nchunk_cache = 64\n").unwrap();
        assert_eq!(parsed.net_endpoint, "127.0.0.1:9999");
        assert_eq!(parsed.chunk_cache, 64);
    }

    #[test]
    fn load_or_default_tolerates_missing_file() {
        let config = ServerConfig::load_or_default(Path::new("/nonexistent/server.toml")).unwrap();
        assert_eq!(config.net_endpoint, default_net_endpoint());
    }
}
