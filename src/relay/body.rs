use bytes::Bytes;
use serde_json::Value;

/// Rewrite the caller's JSON body before forwarding: force `stream: true`
/// (the usage extractor depends on an SSE response) and stamp
/// `metadata.user_id` with this deployment's identity. A body that does not
/// parse as a JSON object passes through untouched; the upstream is the one
/// to reject it.
pub fn prepare_body(body: Bytes, instance_id: &str) -> Bytes {
    let Ok(Value::Object(mut obj)) = serde_json::from_slice::<Value>(&body) else {
        return body;
    };

    obj.insert("stream".into(), Value::Bool(true));

    let metadata = obj
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));
    match metadata {
        Value::Object(m) => {
            m.insert("user_id".into(), Value::String(instance_id.to_string()));
        }
        // A non-object metadata value is replaced wholesale.
        other => {
            *other = serde_json::json!({ "user_id": instance_id });
        }
    }

    match serde_json::to_vec(&Value::Object(obj)) {
        Ok(v) => Bytes::from(v),
        Err(_) => body,
    }
}
