//! Alarm endpoint parsing.

use std::fmt;
use thiserror::Error;
use url::Url;

/// Errors produced while parsing the alarm server URL.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Invalid endpoint URL {url}: {reason}")]
    Invalid { url: String, reason: String },

    #[error("Unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Endpoint URL has no host: {0}")]
    MissingHost(String),
}

/// Parsed destination of outbound alarm reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    /// `http` or `https`
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Request path, including any query string
    pub path: String,
}

impl ServerEndpoint {
    /// Parse `scheme://host[:port]/path`. The port defaults from the scheme.
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let url = Url::parse(raw.trim()).map_err(|e| EndpointError::Invalid {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;

        let scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(EndpointError::UnsupportedScheme(scheme));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| EndpointError::MissingHost(raw.to_string()))?
            .to_string();

        let default_port = if scheme == "https" { 443 } else { 80 };
        let port = url.port_or_known_default().unwrap_or(default_port);

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }

    /// Full request URL.
    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_port() {
        let ep = ServerEndpoint::parse("http://10.0.0.5:8080/api/alarm").unwrap();
        assert_eq!(ep.scheme, "http");
        assert_eq!(ep.host, "10.0.0.5");
        assert_eq!(ep.port, 8080);
        assert_eq!(ep.path, "/api/alarm");
        assert_eq!(ep.url(), "http://10.0.0.5:8080/api/alarm");
    }

    #[test]
    fn test_parse_default_ports() {
        let ep = ServerEndpoint::parse("https://alarms.example.com/report").unwrap();
        assert_eq!(ep.port, 443);

        let ep = ServerEndpoint::parse("http://alarms.example.com/report?src=cam").unwrap();
        assert_eq!(ep.port, 80);
        assert_eq!(ep.path, "/report?src=cam");
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert_eq!(
            ServerEndpoint::parse("ftp://host/upload"),
            Err(EndpointError::UnsupportedScheme("ftp".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            ServerEndpoint::parse("not a url"),
            Err(EndpointError::Invalid { .. })
        ));
    }
}
