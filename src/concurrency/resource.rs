//! Lockable resource names.

use anyhow::{bail, Error};
use std::fmt;
use std::str::FromStr;

/// A lockable resource: a whole table or one key within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceId {
    Table(String),
    Key { table: String, key: String },
}

impl ResourceId {
    pub fn table(name: impl Into<String>) -> Self {
        ResourceId::Table(name.into())
    }

    /// Key resources are named by the key's display form.
    pub fn key(table: impl Into<String>, key: impl fmt::Display) -> Self {
        ResourceId::Key {
            table: table.into(),
            key: key.to_string(),
        }
    }

    pub fn table_name(&self) -> &str {
        match self {
            ResourceId::Table(name) => name,
            ResourceId::Key { table, .. } => table,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Table(name) => write!(f, "table:{}", name),
            ResourceId::Key { table, key } => write!(f, "key:{}:{}", table, key),
        }
    }
}

impl FromStr for ResourceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix("table:") {
            if name.is_empty() {
                bail!("Empty table name in resource '{}'", s);
            }
            return Ok(ResourceId::table(name));
        }
        if let Some(rest) = s.strip_prefix("key:") {
            // Table names never contain ':'; keys may.
            if let Some((table, key)) = rest.split_once(':') {
                if !table.is_empty() {
                    return Ok(ResourceId::key(table, key));
                }
            }
        }
        bail!("Invalid resource id '{}'", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_display() {
        assert_eq!(ResourceId::table("users").to_string(), "table:users");
        assert_eq!(ResourceId::key("users", 42).to_string(), "key:users:42");
        assert_eq!(ResourceId::key("users", 42).table_name(), "users");
    }

    #[test]
    fn test_parse() -> Result<()> {
        assert_eq!("table:users".parse::<ResourceId>()?, ResourceId::table("users"));
        assert_eq!(
            "key:users:a:b".parse::<ResourceId>()?,
            ResourceId::key("users", "a:b")
        );
        assert!("table:".parse::<ResourceId>().is_err());
        assert!("key:users".parse::<ResourceId>().is_err());
        assert!("row:users:1".parse::<ResourceId>().is_err());
        Ok(())
    }
}
