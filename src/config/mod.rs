use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, trace, LevelFilter};
use once_cell::sync::Lazy;
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::filter::build_filter;

static HOST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:(?:\d{1,3}\.){3}\d{1,3}|[0-9a-f:]*:[0-9a-f:]+|[a-z0-9.-]+)$")
        .expect("Invalid regex pattern for host validation")
});

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(nested)]
    pub listener: Listener,

    /// `KEY:VALUE` selectors scoping which hosts receive purges.
    #[validate(length(min = 1), custom(function = "Config::validate_tags"))]
    pub tags: Vec<String>,

    #[serde(default)]
    #[validate(nested)]
    pub client: Client,
    #[serde(default)]
    #[validate(nested)]
    pub fanout: FanOut,
    #[validate(nested)]
    pub discovery: Discovery,

    pub log: Option<Log>,
    pub status: Option<Status>,
    pub prometheus: Option<Prometheus>,
    pub sentry: Option<Sentry>,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    fn validate_tags(tags: &[String]) -> Result<(), ValidationError> {
        build_filter(tags).map(|_| ()).map_err(|e| {
            let mut err = ValidationError::new("invalid_tag");
            err.add_param("tag".into(), &e.raw());
            err
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Listener {
    pub address: SocketAddr,
}

/// Outbound client timeouts, in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Client::validate_timeouts"))]
pub struct Client {
    #[serde(default = "Client::default_connect_timeout")]
    #[validate(range(min = 1))]
    pub connect_timeout: u64,
    #[serde(default = "Client::default_total_timeout")]
    #[validate(range(min = 1))]
    pub total_timeout: u64,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            connect_timeout: Self::default_connect_timeout(),
            total_timeout: Self::default_total_timeout(),
        }
    }
}

impl Client {
    fn default_connect_timeout() -> u64 {
        2000
    }

    fn default_total_timeout() -> u64 {
        5000
    }

    fn validate_timeouts(&self) -> Result<(), ValidationError> {
        if self.connect_timeout > self.total_timeout {
            Err(ValidationError::new("connect_timeout_exceeds_total_timeout"))
        } else {
            Ok(())
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct FanOut {
    /// Overall wait for one purge, in milliseconds.
    #[serde(default = "FanOut::default_deadline")]
    #[validate(range(min = 1))]
    pub deadline: u64,
    /// Treat a purge that resolves to zero hosts as a failure.
    #[serde(default)]
    pub fail_on_empty: bool,
}

impl Default for FanOut {
    fn default() -> Self {
        Self {
            deadline: Self::default_deadline(),
            fail_on_empty: false,
        }
    }
}

impl FanOut {
    fn default_deadline() -> u64 {
        10_000
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Discovery::validate_source"))]
pub struct Discovery {
    #[serde(default)]
    #[validate(nested)]
    pub hosts: Vec<Host>,
    pub etcd: Option<Etcd>,
    /// Seconds between background inventory refreshes. Unset means every
    /// purge queries the inventory directly.
    #[validate(range(min = 1))]
    pub refresh_interval: Option<u64>,
}

impl Discovery {
    fn validate_source(&self) -> Result<(), ValidationError> {
        match (&self.etcd, self.hosts.is_empty()) {
            (None, true) => Err(ValidationError::new("hosts_or_etcd_required")),
            (Some(_), false) => Err(ValidationError::new("hosts_and_etcd_exclusive")),
            _ => Ok(()),
        }
    }
}

/// One cache server known to the inventory, with the tags it carries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
pub struct Host {
    #[validate(custom(function = "Host::validate_host"))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl Host {
    fn validate_host(host: &str) -> Result<(), ValidationError> {
        if HOST_RE.is_match(host) {
            Ok(())
        } else {
            let mut err = ValidationError::new("invalid_host");
            err.add_param("host".into(), &host);
            Err(err)
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Etcd {
    pub host: Vec<String>,
    pub prefix: String,
    pub timeout: Option<u32>,
    pub connect_timeout: Option<u32>,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
    #[serde(default = "Log::default_level")]
    pub level: LevelFilter,
}

impl Log {
    fn default_level() -> LevelFilter {
        LevelFilter::Info
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Status {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prometheus {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sentry {
    pub dsn: String,
}
