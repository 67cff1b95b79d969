//! Deployment configuration.
//!
//! Four variables drive every service built on svcbase:
//!
//! | Variable | Values | Meaning |
//! |---|---|---|
//! | `TRACE` | `0` `1` `2` | trace verbosity: off, bodies, bodies + headers |
//! | `LOG` | `no` `error` `all` | which responses produce an access-log record |
//! | `EXCEPTION` | `0` `1` | report full exceptions to the exception channel |
//! | `INSTANCE` | any | deployment tier, e.g. `stage` or `main` |
//!
//! They are read once, when the service is assembled.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::{Error, Result};

/// Trace verbosity. Ordered so escalation is a plain `max`.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TraceLevel {
    #[default]
    Off,
    /// Request and response bodies, no headers.
    On,
    /// Bodies and headers.
    Verbose,
}

impl TraceLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::On => 1,
            Self::Verbose => 2,
        }
    }

    pub fn try_from_u8(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::Off),
            1 => Some(Self::On),
            2 => Some(Self::Verbose),
            _ => None,
        }
    }

    pub fn is_on(self) -> bool {
        self != Self::Off
    }

    /// The level in effect after receiving `inbound` from a caller.
    ///
    /// Trace level only ever escalates along a call chain.
    pub fn escalate(self, inbound: Option<TraceLevel>) -> TraceLevel {
        match inbound {
            Some(level) => self.max(level),
            None => self,
        }
    }

    /// Lenient parse used for propagated values: anything other than 0, 1 or
    /// 2 is ignored.
    pub fn parse_propagated(raw: &str) -> Option<TraceLevel> {
        raw.trim().parse::<u8>().ok().and_then(Self::try_from_u8)
    }
}

impl FromStr for TraceLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "0" => Ok(Self::Off),
            "1" => Ok(Self::On),
            "2" => Ok(Self::Verbose),
            other => Err(Error::Config(format!("TRACE must be 0, 1 or 2, got `{other}`"))),
        }
    }
}

impl fmt::Display for TraceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

impl Serialize for TraceLevel {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u8(self.as_u8())
    }
}

/// Access-log policy.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogPolicy {
    #[default]
    No,
    Error,
    All,
}

impl LogPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Error => "error",
            Self::All => "all",
        }
    }

    /// Whether a response with `status` gets an access-log record.
    pub fn allows(self, status: u16) -> bool {
        match self {
            Self::No => false,
            Self::Error => !(200..300).contains(&status),
            Self::All => true,
        }
    }
}

impl FromStr for LogPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "no" => Ok(Self::No),
            "error" => Ok(Self::Error),
            "all" => Ok(Self::All),
            other => Err(Error::Config(format!("LOG must be no, error or all, got `{other}`"))),
        }
    }
}

/// Whether full exceptions are reported to the exception channel.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ExceptionPolicy {
    #[default]
    Off,
    Report,
}

impl ExceptionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "0",
            Self::Report => "1",
        }
    }
}

impl FromStr for ExceptionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "0" => Ok(Self::Off),
            "1" => Ok(Self::Report),
            other => Err(Error::Config(format!("EXCEPTION must be 0 or 1, got `{other}`"))),
        }
    }
}

/// Runtime configuration of one service.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub trace: TraceLevel,
    pub log: LogPolicy,
    pub exception: ExceptionPolicy,
    pub instance: String,
    /// Extra service-declared variables echoed by the introspection route.
    pub vars: BTreeMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            trace: TraceLevel::Off,
            log: LogPolicy::No,
            exception: ExceptionPolicy::Off,
            instance: "stage".to_owned(),
            vars: BTreeMap::new(),
        }
    }
}

impl ServiceConfig {
    /// Reads the configuration from the process environment.
    ///
    /// `extra_vars` names additional variables to capture for introspection;
    /// unset ones are recorded as empty strings.
    pub fn from_env(extra_vars: &[&str]) -> Result<Self> {
        Self::from_lookup(extra_vars, |name| std::env::var(name).ok())
    }

    /// Reads the configuration through an arbitrary lookup function.
    pub fn from_lookup<F>(extra_vars: &[&str], lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let trace = lookup("TRACE").map(|v| v.parse()).transpose()?.unwrap_or_default();
        let log = lookup("LOG").map(|v| v.parse()).transpose()?.unwrap_or_default();
        let exception = lookup("EXCEPTION").map(|v| v.parse()).transpose()?.unwrap_or_default();
        let instance = lookup("INSTANCE")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "stage".to_owned());
        let vars = extra_vars
            .iter()
            .map(|name| ((*name).to_owned(), lookup(name).unwrap_or_default()))
            .collect();

        Ok(Self { trace, log, exception, instance, vars })
    }

    /// Variables published by the `all_requests_id` route.
    ///
    /// The built-in entries always report the values in effect, even when an
    /// extra var shares their name.
    pub(crate) fn published_vars(&self) -> BTreeMap<String, String> {
        let mut vars = self.vars.clone();
        vars.extend([
            ("TRACE".to_owned(), self.trace.to_string()),
            ("LOG".to_owned(), self.log.as_str().to_owned()),
            ("EXCEPTION".to_owned(), self.exception.as_str().to_owned()),
            ("INSTANCE".to_owned(), self.instance.clone()),
        ]);
        vars
    }
}
