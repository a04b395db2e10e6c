//! Application and drone descriptors shared by the registry, the record
//! store, the balancer and the REST API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum length of an application or user name
const MAX_NAME_LEN: usize = 128;

/// Description of a user application, usually read from its `package.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationDescriptor {
    pub name: String,

    #[serde(default)]
    pub user: String,

    /// Single virtual host the app answers on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Additional virtual hosts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,

    #[serde(default)]
    pub repository: RepositoryInfo,

    #[serde(default)]
    pub scripts: Scripts,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub directories: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Content hash of the deployed source (set by the deploy endpoint)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,

    /// Any other package.json keys, carried through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Where the application source comes from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    /// One of `git`, `local`, `tar`, `zip`, `npm`
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scripts {
    /// Start command line (or a `.js` entry point)
    #[serde(default)]
    pub start: String,

    /// Optional command run once after the source is fetched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<String>,
}

impl ApplicationDescriptor {
    /// Identity key of the application
    pub fn key(&self) -> (&str, &str) {
        (&self.user, &self.name)
    }

    /// All virtual hosts of the app, lowercased, `domain` first
    pub fn all_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = Vec::new();
        for d in self.domain.iter().chain(self.domains.iter()) {
            let d = d.trim().to_lowercase();
            if !d.is_empty() && !domains.contains(&d) {
                domains.push(d);
            }
        }
        domains
    }

    /// Check the fields every start depends on
    pub fn validate(&self) -> Result<(), String> {
        validate_name("name", &self.name)?;
        validate_name("user", &self.user)?;
        if self.scripts.start.trim().is_empty() {
            return Err("scripts.start is required".to_string());
        }
        Ok(())
    }
}

/// Names end up in file names, so keep them to a safe alphabet
pub fn validate_name(field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{} is required", field));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(format!("{} must be at most {} characters", field, MAX_NAME_LEN));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(format!(
            "{} may only contain letters, digits, '-', '_' and '.'",
            field
        ));
    }
    if value.starts_with('.') {
        return Err(format!("{} must not start with '.'", field));
    }
    Ok(())
}

/// A desired-to-actual port substitution reported by a drone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub desired: u16,
    pub actual: u16,
}

/// Public view of one running drone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroneInfo {
    pub name: String,
    pub user: String,
    pub pid: u32,
    pub host: String,
    pub port: u16,
    pub ctime: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_mappings: Vec<PortMapping>,
}

impl DroneInfo {
    /// `host:port` of the drone's public endpoint
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Row of `GET /drones/info`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroneSummary {
    pub user: String,
    pub name: String,
    pub version: Option<String>,
    pub ctime: DateTime<Utc>,
    pub host: String,
    pub port: u16,
    pub hash: Option<String>,
    /// Port of the drone API on this host
    #[serde(rename = "haibuPort")]
    pub api_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hellonode() -> ApplicationDescriptor {
        serde_json::from_str(
            r#"{
                "name": "test",
                "user": "marak",
                "domain": "Hello.Example.com",
                "domains": ["hello.example.com", "hi.example.org"],
                "repository": { "type": "git", "url": "https://github.com/Marak/hellonode.git" },
                "scripts": { "start": "server.js" },
                "engines": { "node": ">= 0.4" }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_package_json() {
        let app = hellonode();
        assert_eq!(app.key(), ("marak", "test"));
        assert_eq!(app.repository.kind, "git");
        assert_eq!(app.scripts.start, "server.js");
        assert!(app.extra.contains_key("engines"));
        assert!(app.validate().is_ok());
    }

    #[test]
    fn test_extra_keys_round_trip() {
        let app = hellonode();
        let json = serde_json::to_value(&app).unwrap();
        assert_eq!(json["engines"]["node"], ">= 0.4");
        assert_eq!(json["repository"]["type"], "git");
    }

    #[test]
    fn test_all_domains_dedups_and_lowercases() {
        let app = hellonode();
        assert_eq!(
            app.all_domains(),
            vec!["hello.example.com".to_string(), "hi.example.org".to_string()]
        );
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        let mut app = hellonode();
        app.name = "../etc".to_string();
        assert!(app.validate().unwrap_err().contains("name"));

        let mut app = hellonode();
        app.user = String::new();
        assert!(app.validate().unwrap_err().contains("user is required"));

        let mut app = hellonode();
        app.scripts.start = "  ".to_string();
        assert!(app.validate().unwrap_err().contains("scripts.start"));
    }

    #[test]
    fn test_summary_uses_wire_name_for_api_port() {
        let summary = DroneSummary {
            user: "marak".to_string(),
            name: "test".to_string(),
            version: None,
            ctime: Utc::now(),
            host: "127.0.0.1".to_string(),
            port: 4000,
            hash: None,
            api_port: 9002,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["haibuPort"], 9002);
    }
}
