//! Connections and their establishment state

use crate::record::Record;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a connection, derived from its `established` flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Unestablished,
    Established,
}

/// Encryption scheme of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Encryption {
    Plain,
    Aes,
    Spongent,
    Other(String),
}

impl Encryption {
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "plain" | "none" => Encryption::Plain,
            "aes" => Encryption::Aes,
            "spongent" => Encryption::Spongent,
            _ => Encryption::Other(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Encryption::Plain => "plain",
            Encryption::Aes => "aes",
            Encryption::Spongent => "spongent",
            Encryption::Other(name) => name,
        }
    }

    /// Key length in bytes
    pub fn key_size(&self) -> usize {
        match self {
            Encryption::Plain => 0,
            Encryption::Aes | Encryption::Spongent | Encryption::Other(_) => 16,
        }
    }
}

impl fmt::Display for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source and destination endpoints of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoints<'a> {
    /// output → input
    Output { from_output: Option<&'a str>, to_input: &'a str },
    /// request → handler
    Request { from_request: Option<&'a str>, to_handler: &'a str },
}

/// Read-only typed access to a connection record
#[derive(Debug, Clone, Copy)]
pub struct ConnectionView<'a> {
    record: &'a Record,
}

impl<'a> ConnectionView<'a> {
    pub fn new(record: &'a Record) -> Self {
        Self { record }
    }

    pub fn record(&self) -> &'a Record {
        self.record
    }

    pub fn state(&self) -> ConnectionState {
        if self.record.get_bool("established").unwrap_or(false) {
            ConnectionState::Established
        } else {
            ConnectionState::Unestablished
        }
    }

    pub fn is_established(&self) -> bool {
        self.state() == ConnectionState::Established
    }

    pub fn name(&self) -> Option<&'a str> {
        self.record.get_str("name")
    }

    pub fn from_module(&self) -> Option<&'a str> {
        self.record.get_str("from_module")
    }

    pub fn to_module(&self) -> Option<&'a str> {
        self.record.get_str("to_module")
    }

    pub fn encryption(&self) -> Option<Encryption> {
        self.record.get_str("encryption").map(Encryption::parse)
    }

    pub fn id(&self) -> Option<u16> {
        self.record.get_int("id").and_then(|id| u16::try_from(id).ok())
    }

    pub fn key(&self) -> Option<&'a str> {
        self.record.get_str("key")
    }

    pub fn nonce(&self) -> Option<i64> {
        self.record.get_int("nonce")
    }

    pub fn is_direct(&self) -> bool {
        self.record.get_bool("direct").unwrap_or(false)
    }

    /// `None` when neither destination endpoint is set, or both are
    pub fn endpoints(&self) -> Option<Endpoints<'a>> {
        let r = self.record;
        match (r.get_str("to_input"), r.get_str("to_handler")) {
            (Some(to_input), None) => Some(Endpoints::Output {
                from_output: r.get_str("from_output"),
                to_input,
            }),
            (None, Some(to_handler)) => Some(Endpoints::Request {
                from_request: r.get_str("from_request"),
                to_handler,
            }),
            _ => None,
        }
    }

    /// Human-readable label: the name, or `from -> to`
    pub fn label(&self) -> String {
        match self.name() {
            Some(name) => name.to_string(),
            None => format!(
                "{} -> {}",
                self.from_module().unwrap_or("*"),
                self.to_module().unwrap_or("?")
            ),
        }
    }
}
