//! Domain list parsing
//!
//! One `hostname:port` per line. Blank lines and `#` comments are ignored;
//! malformed lines are reported and skipped so one typo does not block the
//! rest of the customer's hosts.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

use crate::error::SignerError;

/// A `hostname:port` endpoint to pin
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainEntry {
    pub hostname: String,
    pub port: u16,
}

impl fmt::Display for DomainEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

impl FromStr for DomainEntry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (hostname, port) = trimmed
            .rsplit_once(':')
            .ok_or_else(|| format!("expected hostname:port, got {trimmed:?}"))?;

        let hostname = hostname.trim();
        if hostname.is_empty() || hostname.contains(char::is_whitespace) {
            return Err(format!("invalid hostname in {trimmed:?}"));
        }

        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| format!("invalid port in {trimmed:?}"))?;
        if port == 0 {
            return Err(format!("port must be between 1 and 65535 in {trimmed:?}"));
        }

        Ok(DomainEntry {
            hostname: hostname.to_string(),
            port,
        })
    }
}

/// Parse a domain list, skipping blanks, comments and malformed lines
pub fn parse_domain_list(content: &str) -> Vec<DomainEntry> {
    let mut entries = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.parse::<DomainEntry>() {
            Ok(entry) => entries.push(entry),
            Err(reason) => warn!("Skipping domain list line {}: {}", index + 1, reason),
        }
    }
    entries
}

/// Read a customer's domain list
pub fn load_domain_list(path: &Path, customer: &str) -> Result<Vec<DomainEntry>, SignerError> {
    if !path.is_file() {
        return Err(SignerError::DomainListMissing {
            customer: customer.to_string(),
            path: path.to_path_buf(),
        });
    }

    let content = std::fs::read_to_string(path).map_err(|source| SignerError::DomainListRead {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(parse_domain_list(&content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_parse_entry() {
        let entry: DomainEntry = "www.example.com:443".parse().unwrap();
        assert_eq!(entry.hostname, "www.example.com");
        assert_eq!(entry.port, 443);
        assert_eq!(entry.to_string(), "www.example.com:443");
    }

    #[test]
    fn test_parse_list_skips_noise() {
        let list = "\n# production\nwww.example.com:443\n  api.example.com:8443  \nbroken\nbad.example.com:https\nzero.example.com:0\n\n";
        let entries = parse_domain_list(list);
        assert_eq!(
            entries,
            vec![
                DomainEntry {
                    hostname: "www.example.com".to_string(),
                    port: 443
                },
                DomainEntry {
                    hostname: "api.example.com".to_string(),
                    port: 8443
                },
            ]
        );
    }

    #[test]
    fn test_missing_list_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("acme.domains");
        let err = load_domain_list(&path, "acme").unwrap_err();
        assert!(matches!(err, SignerError::DomainListMissing { .. }));
    }
}
