use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("no '//' scheme separator in '{0}'")]
    MissingSeparator(String),
    #[error("unsupported scheme in '{0}'")]
    UnsupportedScheme(String),
    #[error("tcp:// locations are not implemented")]
    Unimplemented,
    #[error("no path separator in '{0}'")]
    MissingPath(String),
    #[error("no host in '{0}'")]
    MissingHost(String),
    #[error("invalid host in '{0}'")]
    InvalidHost(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `dir://<path>`
    Directory,
    /// `ssh://[user@]host[:port]/path`
    RemoteShell,
}

/// A scheme tagged address, unused fields are left empty.
///
/// `Directory` locations never carry a host, `RemoteShell` locations always carry a host and a path.
/// Parsing is a pure string decomposition, nothing is resolved or touched on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub scheme: Scheme,
    pub host: String,
    pub user: String,
    pub port: String,
    pub path: String,
}

impl Location {
    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Directory,
            host: String::new(),
            user: String::new(),
            port: String::new(),
            path: path.into(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, LocationError> {
        let marker = text
            .find("//")
            .ok_or_else(|| LocationError::MissingSeparator(text.to_owned()))?;
        let (scheme, rest) = (&text[..marker], &text[marker + 2..]);

        match scheme {
            "dir:" => Ok(Self::directory(rest)),
            "ssh:" => Self::parse_remote(text, rest),
            "tcp:" => Err(LocationError::Unimplemented),
            _ => Err(LocationError::UnsupportedScheme(text.to_owned())),
        }
    }

    fn parse_remote(text: &str, rest: &str) -> Result<Self, LocationError> {
        // the path separator is mandatory, the leading '/' is not part of the path
        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| LocationError::MissingPath(text.to_owned()))?;

        let (user, authority) = authority.split_once('@').unwrap_or(("", authority));
        let (host, port) = authority.split_once(':').unwrap_or((authority, ""));

        if host.is_empty() {
            return Err(LocationError::MissingHost(text.to_owned()));
        }
        // handed to scp as an argument, it must not read as an option
        if host.starts_with('-') {
            return Err(LocationError::InvalidHost(text.to_owned()));
        }

        Ok(Self {
            scheme: Scheme::RemoteShell,
            host: host.to_owned(),
            user: user.to_owned(),
            port: port.to_owned(),
            path: path.to_owned(),
        })
    }

    pub fn is_remote(&self) -> bool {
        !self.host.is_empty()
    }

    /// `[user@]host:path` as understood by scp
    pub fn copy_target(&self) -> String {
        if self.user.is_empty() {
            format!("{}:{}", self.host, self.path)
        } else {
            format!("{}@{}:{}", self.user, self.host, self.path)
        }
    }
}

impl FromStr for Location {
    type Err = LocationError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Self::parse(text)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Directory => write!(f, "dir://{}", self.path),
            Scheme::RemoteShell => {
                f.write_str("ssh://")?;
                if !self.user.is_empty() {
                    write!(f, "{}@", self.user)?;
                }
                f.write_str(&self.host)?;
                if !self.port.is_empty() {
                    write!(f, ":{}", self.port)?;
                }
                write!(f, "/{}", self.path)
            }
        }
    }
}
