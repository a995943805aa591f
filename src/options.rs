use std::io::Read;

use serde::Deserialize;

use crate::Result;

/// Where and how to reach the cluster's configuration feed.
///
/// Every field has a default, so a JSON options file only needs the fields that differ:
///
/// ```json
/// { "hostname": "10.0.0.5", "bucket": "sessions" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// admin host of any cluster node
    pub hostname: String,
    /// admin (REST) port
    pub port: u16,
    /// resource pool name
    pub pool: String,
    /// bucket to open
    pub bucket: String,
    /// user for the configuration feed
    pub username: Option<String>,
    /// password for the configuration feed
    pub password: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            hostname: "localhost".to_string(),
            port: 8091,
            pool: "default".to_string(),
            bucket: "default".to_string(),
            username: None,
            password: None,
        }
    }
}

impl ConnectOptions {
    /// loads options from a JSON document, missing fields keep their defaults
    pub fn from_json<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// sets the admin host
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// sets the admin port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// sets the pool name
    pub fn pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    /// sets the bucket name
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    /// sets the feed credentials
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// the `(username, password)` pair, only when both are configured
    pub fn auth(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }

    /// the streaming configuration endpoint of the bucket
    pub fn streaming_url(&self) -> String {
        format!(
            "http://{}:{}/pools/{}/bucketsStreaming/{}/",
            self.hostname, self.port, self.pool, self.bucket
        )
    }

    /// the same options pointed at a different admin endpoint
    pub fn with_endpoint(&self, hostname: &str, port: u16) -> Self {
        ConnectOptions {
            hostname: hostname.to_string(),
            port,
            ..self.clone()
        }
    }
}
