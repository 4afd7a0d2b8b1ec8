//! JSON encoding of stored values and structured script replies.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StoreError, StoreResult};
use crate::script::{Reply, ScriptContext};

/// Decode a raw stored value.
pub fn decode_value<T: DeserializeOwned>(key: &str, raw: &str) -> StoreResult<T> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Read and decode a live value inside a script.
pub fn read_json<T: DeserializeOwned>(ctx: &dyn ScriptContext, key: &str) -> StoreResult<Option<T>> {
    ctx.get(key).map(|raw| decode_value(key, &raw)).transpose()
}

/// Encode and write a value inside a script.
pub fn write_json<T: Serialize>(
    ctx: &mut dyn ScriptContext,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> StoreResult<()> {
    let raw = serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    ctx.set(key, raw, ttl);
    Ok(())
}

/// Encode a structured script reply.
pub fn json_reply<T: Serialize>(script: &str, value: &T) -> StoreResult<Reply> {
    serde_json::to_string(value)
        .map(Reply::Text)
        .map_err(|e| StoreError::Script {
            script: script.to_string(),
            reason: e.to_string(),
        })
}

/// Decode a structured script reply.
pub fn decode_reply<T: DeserializeOwned>(script: &str, reply: &Reply) -> StoreResult<T> {
    let raw = reply.as_text().ok_or_else(|| StoreError::Script {
        script: script.to_string(),
        reason: format!("expected a text reply, got {:?}", reply),
    })?;
    serde_json::from_str(raw).map_err(|e| StoreError::Script {
        script: script.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        count: u32,
    }

    #[test]
    fn test_reply_decoding() {
        let reply = json_reply("sample", &Sample { count: 2 }).unwrap();
        let decoded: Sample = decode_reply("sample", &reply).unwrap();
        assert_eq!(decoded, Sample { count: 2 });

        assert!(decode_reply::<Sample>("sample", &Reply::Int(1)).is_err());
    }

    #[test]
    fn test_corrupt_value() {
        let err = decode_value::<Sample>("k", "not json").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
