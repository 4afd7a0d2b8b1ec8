//! Store-side scripts.
//!
//! A [`Script`] is a named procedure the store runs as one indivisible step.
//! Multi-step protocol logic (read, compare, write) lives in scripts so that
//! no other caller can observe or interleave with the intermediate state.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{StoreError, StoreResult};

/// Remaining lifetime of a key as seen from inside a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist (or has expired).
    Missing,
    /// The key exists without expiry.
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

/// Value returned by a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Int(i64),
    Text(String),
}

impl Reply {
    /// Interpret the reply as an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Reply::Int(v) => Some(*v),
            Reply::Text(s) => s.parse().ok(),
            Reply::Nil => None,
        }
    }

    /// Interpret the reply as text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Reply::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }
}

/// Primitive operations available to a running script.
///
/// All reads observe the same store clock value for the duration of one run.
pub trait ScriptContext {
    /// Store clock in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;

    /// Read a live value.
    fn get(&self, key: &str) -> Option<String>;

    /// Write a value, replacing any previous value and expiry.
    fn set(&mut self, key: &str, value: String, ttl: Option<Duration>);

    /// Remaining lifetime of a key.
    fn pttl(&self, key: &str) -> KeyTtl;

    /// Delete a key. Returns whether a live key was removed.
    fn delete(&mut self, key: &str) -> bool;

    /// Increment an integer counter, creating it at zero first.
    fn incr(&mut self, key: &str) -> StoreResult<i64>;

    /// Wake everyone waiting on `channel` once the script commits.
    fn publish(&mut self, channel: &str);
}

/// A named atomic procedure executed by the store.
pub trait Script: Send + Sync {
    /// Stable name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Run the script against the store.
    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String])
        -> StoreResult<Reply>;
}

/// Fetch the key at `index`.
pub fn key_at<'a>(script: &dyn Script, keys: &'a [String], index: usize) -> StoreResult<&'a str> {
    keys.get(index)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Script {
            script: script.name().to_string(),
            reason: format!("missing key #{}", index),
        })
}

/// Parse the argument at `index`.
pub fn arg_at<T: FromStr>(script: &dyn Script, args: &[String], index: usize) -> StoreResult<T> {
    let raw = args.get(index).ok_or_else(|| StoreError::Script {
        script: script.name().to_string(),
        reason: format!("missing argument #{}", index),
    })?;

    raw.parse().map_err(|_| StoreError::Script {
        script: script.name().to_string(),
        reason: format!("argument #{} is malformed: {:?}", index, raw),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Script for Noop {
        fn name(&self) -> &'static str {
            "noop"
        }

        fn run(&self, _: &mut dyn ScriptContext, _: &[String], _: &[String]) -> StoreResult<Reply> {
            Ok(Reply::Nil)
        }
    }

    #[test]
    fn test_arg_parsing() {
        let args = vec!["42".to_string(), "abc".to_string()];
        assert_eq!(arg_at::<u64>(&Noop, &args, 0).unwrap(), 42);
        assert!(arg_at::<u64>(&Noop, &args, 1).is_err());
        assert!(arg_at::<u64>(&Noop, &args, 2).is_err());
    }

    #[test]
    fn test_reply_conversions() {
        assert_eq!(Reply::Int(3).as_int(), Some(3));
        assert_eq!(Reply::Text("7".into()).as_int(), Some(7));
        assert!(Reply::Nil.is_nil());
    }
}
