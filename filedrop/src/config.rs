//! Daemon configuration, read from one TOML file at startup.
//!
//! The parsed [`Config`] is passed by value into each component; nothing in
//! here is global.  Byte sizes and durations are given in the same notations
//! the upload form accepts, e.g. `max_size = "10MiB"` and
//! `max_lifetime = "1d"`.

use crate::{
    error::{Error, Result},
    human,
};
use serde_derive::Deserialize;
use std::{collections::HashMap, fs, path::{Path, PathBuf}, time::Duration};

fn default_id_length() -> usize {
    // 4 bytes of randomness: 2^32 possible combinations
    4
}

fn default_word_count() -> usize {
    3
}

fn default_rpc_timeout() -> String {
    "3s".to_string()
}

fn default_unix_chmod() -> String {
    "0600".to_string()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Unprivileged user the processes drop to.
    pub user: String,
    /// Unprivileged group the processes drop to.
    pub group: String,

    pub store: StoreConfig,
    pub webserver: WebserverConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Base directory for the index database and the blobs; also the store
    /// process' chroot.
    pub path: PathBuf,

    #[serde(default)]
    pub id_generator: IdGeneratorConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IdGeneratorConfig {
    /// `length` random bytes, base58-encoded.
    Random {
        #[serde(default = "default_id_length")]
        length: usize,
    },
    /// `length` words drawn from a one-word-per-line file, joined by `-`.
    Wordlist {
        wordlist: PathBuf,
        #[serde(default = "default_word_count")]
        length: usize,
    },
}

impl Default for IdGeneratorConfig {
    fn default() -> Self {
        IdGeneratorConfig::Random {
            length: default_id_length(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebserverConfig {
    pub listen: ListenConfig,

    #[serde(default)]
    pub unix_socket: UnixSocketConfig,

    /// Path prefix under which the service is reachable, e.g. `/drop`.
    #[serde(default)]
    pub url_prefix: String,

    /// Contact address shown on the index page.
    #[serde(default)]
    pub contact: String,

    /// Replacement for the built-in index page.
    #[serde(default)]
    pub custom_index: Option<PathBuf>,

    /// Deadline for a single store call, upload streaming included.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout: String,

    pub item: ItemConfig,

    /// Replaces the declared MIME type on delivery, e.g. `"text/html" =
    /// "text/plain"`.
    #[serde(default)]
    pub mime_map: HashMap<String, String>,

    /// Extra routes served from preloaded files.
    #[serde(default)]
    pub static_files: HashMap<String, StaticFileConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    pub protocol: ListenProtocol,
    /// `host:port` for TCP, a socket path otherwise.
    pub bound: String,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ListenProtocol {
    Tcp,
    Unix,
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct UnixSocketConfig {
    /// Octal socket file mode.
    #[serde(default = "default_unix_chmod")]
    pub chmod: String,
    /// Socket file owner; defaults to the service user.
    #[serde(default)]
    pub owner: Option<String>,
    /// Socket file group; defaults to the service group.
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticFileConfig {
    /// File to preload before the sandbox cuts off filesystem access.
    pub path: PathBuf,
    pub mime: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemConfig {
    /// Upper bound for one upload, e.g. `"10MiB"`.
    pub max_size: String,
    /// Upper bound for an upload's lifetime, e.g. `"1d"`.
    pub max_lifetime: String,

    /// Declared MIME types that are rejected outright.
    #[serde(default)]
    pub mime_drop: Vec<String>,
}

impl Config {
    /// Read and validate the configuration file.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("cannot read {}: {}", path.display(), err)))?;

        let config: Config = toml::from_str(&raw)
            .map_err(|err| Error::Config(format!("cannot parse {}: {}", path.display(), err)))?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.webserver.max_size()?;
        self.webserver.max_lifetime()?;
        self.webserver.rpc_deadline()?;

        if self.webserver.listen.protocol == ListenProtocol::Unix {
            u32::from_str_radix(&self.webserver.unix_socket.chmod, 8).map_err(|_| {
                Error::Config(format!(
                    "unix_socket.chmod {:?} is not an octal mode",
                    self.webserver.unix_socket.chmod
                ))
            })?;
        }

        if !self.webserver.url_prefix.is_empty() && !self.webserver.url_prefix.starts_with('/') {
            return Err(Error::Config(format!(
                "url_prefix {:?} does not start with a slash",
                self.webserver.url_prefix
            )));
        }

        Ok(())
    }
}

impl WebserverConfig {
    pub fn max_size(&self) -> Result<u64> {
        human::parse_bytesize(&self.item.max_size)
            .map_err(|_| Error::Config(format!("invalid max_size {:?}", self.item.max_size)))
    }

    pub fn max_lifetime(&self) -> Result<Duration> {
        human::parse_duration(&self.item.max_lifetime).map_err(|_| {
            Error::Config(format!("invalid max_lifetime {:?}", self.item.max_lifetime))
        })
    }

    pub fn rpc_deadline(&self) -> Result<Duration> {
        human::parse_duration(&self.rpc_timeout)
            .map_err(|_| Error::Config(format!("invalid rpc_timeout {:?}", self.rpc_timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        user = "_filedrop"
        group = "_filedrop"

        [store]
        path = "/var/db/filedrop"

        [store.id_generator]
        type = "random"
        length = 4

        [webserver]
        url_prefix = ""
        contact = "nobody@example.com"

        [webserver.listen]
        protocol = "tcp"
        bound = "127.0.0.1:8080"

        [webserver.item]
        max_size = "10MiB"
        max_lifetime = "1d"
        mime_drop = ["application/x-dosexec"]

        [webserver.mime_map]
        "text/html" = "text/plain"

        [webserver.static_files."/favicon.ico"]
        path = "/usr/local/share/filedrop/favicon.ico"
        mime = "image/x-icon"
    "#;

    #[test]
    fn parse_example() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.user, "_filedrop");
        assert_eq!(config.webserver.max_size().unwrap(), 10 * 1024 * 1024);
        assert_eq!(
            config.webserver.max_lifetime().unwrap(),
            Duration::from_secs(24 * 60 * 60)
        );
        assert_eq!(config.webserver.rpc_deadline().unwrap(), Duration::from_secs(3));
        assert!(matches!(
            config.store.id_generator,
            IdGeneratorConfig::Random { length: 4 }
        ));
        assert_eq!(config.webserver.static_files.len(), 1);
    }

    #[test]
    fn reject_bad_lifetime() {
        let mangled = EXAMPLE.replace("\"1d\"", "\"1m10h\"");
        let config: Config = toml::from_str(&mangled).unwrap();

        assert!(config.validate().is_err());
    }
}
