// Agent bootstrap arguments
//
// The host passes one string:
//   jdwphost=localhost,jdwpport=9999,debughost=0.0.0.0,debugport=10000,jarpath=/abs/agent.jar
// Keys are case-insensitive; cfhost/cfport are accepted as older spellings of
// debughost/debugport. Unknown keys are ignored.

use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing agent args: {}", .0.join(" "))]
    Missing(Vec<&'static str>),

    #[error("Invalid agent args string (bad pair '{0}')")]
    MalformedPair(String),

    #[error("Invalid {key} value in agent args string (got '{value}' but expected a port number)")]
    InvalidPort { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentArgs {
    /// Where the JVM's JDWP listener is reachable
    pub jdwp_host: String,
    pub jdwp_port: u16,
    /// Where the debug adapter listens for the IDE
    pub debug_host: String,
    pub debug_port: u16,
    /// The agent's own jar; helper classes are read from it
    pub jar_path: PathBuf,
}

impl AgentArgs {
    pub fn parse(arg_string: &str) -> Result<Self, ConfigError> {
        let mut jdwp_host = None;
        let mut jdwp_port = None;
        let mut debug_host = None;
        let mut debug_port = None;
        let mut jar_path = None;

        for pair in arg_string.split(',').filter(|p| !p.trim().is_empty()) {
            let parts: Vec<&str> = pair.split('=').collect();
            let [name, value] = parts.as_slice() else {
                return Err(ConfigError::MalformedPair(pair.to_string()));
            };
            let value = value.trim();
            if value.is_empty() || name.trim().is_empty() {
                return Err(ConfigError::MalformedPair(pair.to_string()));
            }

            match name.trim().to_ascii_lowercase().as_str() {
                "jdwphost" => jdwp_host = Some(value.to_string()),
                "jdwpport" => jdwp_port = Some(parse_port("jdwpport", value)?),
                "cfhost" => {
                    warn!("Agent arg 'cfhost' is deprecated, use 'debughost'");
                    debug_host = Some(value.to_string());
                }
                "debughost" => debug_host = Some(value.to_string()),
                "cfport" => {
                    warn!("Agent arg 'cfport' is deprecated, use 'debugport'");
                    debug_port = Some(parse_port("debugport", value)?);
                }
                "debugport" => debug_port = Some(parse_port("debugport", value)?),
                "jarpath" => jar_path = Some(PathBuf::from(value)),
                other => warn!("Ignoring unknown agent arg '{}'", other),
            }
        }

        let mut missing = Vec::new();
        if jdwp_host.is_none() {
            missing.push("jdwphost");
        }
        if debug_host.is_none() {
            missing.push("debughost");
        }
        if jdwp_port.is_none() {
            missing.push("jdwpport");
        }
        if debug_port.is_none() {
            missing.push("debugport");
        }
        if jar_path.is_none() {
            missing.push("jarpath");
        }

        match (jdwp_host, jdwp_port, debug_host, debug_port, jar_path) {
            (Some(jdwp_host), Some(jdwp_port), Some(debug_host), Some(debug_port), Some(jar_path)) => {
                Ok(Self {
                    jdwp_host,
                    jdwp_port,
                    debug_host,
                    debug_port,
                    jar_path,
                })
            }
            _ => Err(ConfigError::Missing(missing)),
        }
    }
}

impl FromStr for AgentArgs {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_port(key: &'static str, value: &str) -> Result<u16, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidPort {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_args() {
        let args = AgentArgs::parse(
            "jdwpHost=localhost,jdwpPort=9999,debugHost=0.0.0.0,debugPort=10000,jarPath=/opt/agent.jar",
        )
        .unwrap();

        assert_eq!(args.jdwp_host, "localhost");
        assert_eq!(args.jdwp_port, 9999);
        assert_eq!(args.debug_host, "0.0.0.0");
        assert_eq!(args.debug_port, 10000);
        assert_eq!(args.jar_path, PathBuf::from("/opt/agent.jar"));
    }

    #[test]
    fn test_deprecated_aliases_and_unknown_keys() {
        let args: AgentArgs =
            "JDWPHOST=h,jdwpport=1,cfhost=d,CFPORT=2,jarpath=/j,flavor=vanilla".parse().unwrap();
        assert_eq!(args.debug_host, "d");
        assert_eq!(args.debug_port, 2);
    }

    #[test]
    fn test_missing_keys_reported_together() {
        let err = AgentArgs::parse("jdwphost=h,debugport=2").unwrap_err();
        assert_eq!(err, ConfigError::Missing(vec!["debughost", "jdwpport", "jarpath"]));
        assert_eq!(err.to_string(), "Missing agent args: debughost jdwpport jarpath");

        let err = AgentArgs::parse("").unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing(vec!["jdwphost", "debughost", "jdwpport", "debugport", "jarpath"])
        );
    }

    #[test]
    fn test_invalid_values() {
        let err = AgentArgs::parse("jdwphost=h,jdwpport=abc").unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidPort {
                key: "jdwpport",
                value: "abc".to_string()
            }
        );

        assert!(matches!(
            AgentArgs::parse("cfport=70000").unwrap_err(),
            ConfigError::InvalidPort { key: "debugport", .. }
        ));

        assert_eq!(
            AgentArgs::parse("jdwphost").unwrap_err(),
            ConfigError::MalformedPair("jdwphost".to_string())
        );
        assert!(matches!(
            AgentArgs::parse("jarpath=/a=b").unwrap_err(),
            ConfigError::MalformedPair(_)
        ));
    }

    #[test]
    fn test_empty_value_is_malformed() {
        let err = AgentArgs::parse(
            "jdwphost=h,jdwpport=1,debughost=d,debugport=2,jarpath=",
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::MalformedPair("jarpath=".to_string()));

        assert_eq!(
            AgentArgs::parse("jdwphost= ,jdwpport=1").unwrap_err(),
            ConfigError::MalformedPair("jdwphost= ".to_string())
        );
        assert!(matches!(
            AgentArgs::parse("=localhost").unwrap_err(),
            ConfigError::MalformedPair(_)
        ));
    }
}
