//! Secret generation, comparison and scrubbing

use rand::RngCore;
use serde_json::Value;
use subtle::ConstantTimeEq;

/// Placeholder written over scrubbed secret values.
const REDACTED: &str = "**********";

/// Generate a random 32-byte secret, hex encoded.
///
/// Used for container callback keys and data container file keys.
pub fn generate_secret() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Compare two secrets without leaking timing information.
pub fn secrets_equal(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Whether a document key holds secret material.
fn is_secret_key(key: &str) -> bool {
    key.contains("key") || key.contains("password")
}

/// Replace every secret leaf in a document tree with a placeholder.
///
/// A value is secret when any ancestor key contains "key" or "password";
/// container shapes (objects, arrays) are preserved so scrubbed documents
/// still deserialize into their typed form.
pub fn scrub_secrets(value: &mut Value) {
    scrub(value, false);
}

fn scrub(value: &mut Value, secret: bool) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                scrub(val, secret || is_secret_key(key));
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                scrub(item, secret);
            }
        }
        Value::Null => {}
        other => {
            if secret {
                *other = Value::String(REDACTED.to_string());
            }
        }
    }
}
