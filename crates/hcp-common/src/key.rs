//! Identity of an Operation record
//!
//! The `(namespace, name)` pair is the dedup key used by the work queue,
//! the store, and the cache. Its wire form is `"{namespace}/{name}"`.

use std::fmt;
use std::str::FromStr;

use crate::Error;

/// `(namespace, name)` identity of an Operation
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, empty for cluster-scoped lookups
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Create a key from its parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = match s.split_once('/') {
            Some((ns, name)) => (ns, name),
            None => ("", s),
        };

        if name.contains('/') {
            return Err(Error::validation_for(
                s,
                "unexpected key format: expected \"namespace/name\"",
            ));
        }
        if name.is_empty() {
            return Err(Error::validation_for(s, "key has an empty name"));
        }

        Ok(Self::new(namespace, name))
    }
}
