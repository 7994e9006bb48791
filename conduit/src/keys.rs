use serde::Serialize;
use shared::{Error, Result};
use std::fmt::Debug;
use std::sync::Arc;

type KeyFn<A> = Arc<dyn Fn(&A) -> Result<String> + Send + Sync>;

/// Derives a stable string key from an operation's identity and arguments.
///
/// Keys look like `"{prefix}:{argument-part}"`. The default argument part is
/// the JSON serialization of the arguments; unordered collections must be
/// normalized by the caller for the key to stay deterministic.
pub struct KeyGenerator<A> {
    prefix: String,
    derive: KeyFn<A>,
}

impl<A: 'static> KeyGenerator<A> {
    /// Key from the serialized argument list
    pub fn serialized(prefix: impl Into<String>) -> Self
    where
        A: Serialize,
    {
        Self {
            prefix: prefix.into(),
            derive: Arc::new(|args: &A| {
                serde_json::to_string(args).map_err(|e| {
                    Error::Serialization(format!("failed to serialize key arguments: {}", e))
                })
            }),
        }
    }

    /// Key from a caller-supplied function
    pub fn custom<F>(prefix: impl Into<String>, derive: F) -> Self
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        Self {
            prefix: prefix.into(),
            derive: Arc::new(move |args: &A| Ok(derive(args))),
        }
    }

    /// One key for every call, whatever the arguments
    pub fn constant(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            prefix: key,
            derive: Arc::new(|_: &A| Ok(String::new())),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn generate(&self, args: &A) -> Result<String> {
        let part = (self.derive)(args)?;
        if part.is_empty() {
            Ok(self.prefix.clone())
        } else {
            Ok(format!("{}:{}", self.prefix, part))
        }
    }
}

impl<A> Clone for KeyGenerator<A> {
    fn clone(&self) -> Self {
        Self {
            prefix: self.prefix.clone(),
            derive: Arc::clone(&self.derive),
        }
    }
}

impl<A> Debug for KeyGenerator<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGenerator")
            .field("prefix", &self.prefix)
            .finish()
    }
}
