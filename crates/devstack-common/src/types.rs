//! Domain primitive types used across the ceph-devstack workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DevstackError;

/// A lifecycle action that can be applied to a resource or the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Fetch the image from its registry.
    Pull,
    /// Build the image from a local source repository.
    Build,
    /// Create the resource if it does not exist.
    Create,
    /// Start the resource.
    Start,
    /// Stop the resource.
    Stop,
    /// Remove the resource.
    Remove,
}

impl Action {
    /// Every supported action, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Pull,
        Self::Build,
        Self::Create,
        Self::Start,
        Self::Stop,
        Self::Remove,
    ];

    /// Returns the lowercase action name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Build => "build",
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Remove => "remove",
        }
    }

    /// Whether applying the action twice in one run is redundant.
    pub const fn is_idempotent(self) -> bool {
        matches!(self, Self::Pull | Self::Build | Self::Create)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = DevstackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| DevstackError::UnknownAction { name: s.to_string() })
    }
}

/// The fixed set of services making up the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Relational database backing the results API.
    Postgres,
    /// Results API server.
    Paddles,
    /// Job queue.
    Beanstalk,
    /// Results web UI.
    Pulpito,
    /// Test orchestration container.
    Teuthology,
    /// SSH-accessible test node.
    TestNode,
    /// Log archive web server.
    Archive,
}

impl ServiceKind {
    /// Every service, in the order the topology declares them.
    pub const ALL: [Self; 7] = [
        Self::Postgres,
        Self::Paddles,
        Self::Beanstalk,
        Self::Pulpito,
        Self::Teuthology,
        Self::TestNode,
        Self::Archive,
    ];

    /// Base name used for containers and configuration keys.
    pub const fn base_name(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Paddles => "paddles",
            Self::Beanstalk => "beanstalk",
            Self::Pulpito => "pulpito",
            Self::Teuthology => "teuthology",
            Self::TestNode => "testnode",
            Self::Archive => "archive",
        }
    }

    /// Replica names for a desired count: bare base name for one replica,
    /// `{base}_{index}` otherwise.
    pub fn replica_names(self, count: u32) -> Vec<String> {
        match count {
            0 => Vec::new(),
            1 => vec![self.base_name().to_string()],
            n => (0..n).map(|i| format!("{}_{i}", self.base_name())).collect(),
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base_name())
    }
}

impl FromStr for ServiceKind {
    type Err = DevstackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.base_name() == s)
            .ok_or_else(|| DevstackError::NotFound {
                kind: "service",
                id: s.to_string(),
            })
    }
}

/// Ordered environment for a container.
///
/// Insertion order is preserved so generated command lines are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvMap(Vec<(String, String)>);

impl EnvMap {
    /// Creates an empty map.
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Sets a variable, replacing an existing value in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.0.push((key, value));
        }
    }

    /// Returns the value of a variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterates over `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map holds no variables.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Replaces every value whose name is known to `lookup`.
    ///
    /// Pass `|k| std::env::var(k).ok()` to let the invoking shell override
    /// defaults without editing them.
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        for (key, value) in &mut self.0 {
            if let Some(v) = lookup(key) {
                *value = v;
            }
        }
        self
    }

    /// Applies overrides from the current process environment.
    #[must_use]
    pub fn with_host_overrides(self) -> Self {
        self.with_overrides(|k| std::env::var(k).ok())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.set(k, v);
        }
        map
    }
}
