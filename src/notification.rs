//! Best-effort HTTP notifications
//!
//! Terminal task states and dead nodes are announced to user-supplied
//! endpoints. Failures are logged and swallowed; notifications never
//! influence scheduling state.

use serde_json::Value;
use tracing::warn;

use crate::types::NotificationConnector;

/// Fire all notification connectors with the given meta payload.
pub async fn notify(connectors: &[NotificationConnector], meta: Value) {
    for connector in connectors {
        if let Err(e) = notify_one(connector, &meta).await {
            warn!("Notification to {} failed: {}", connector.connector_access.url, e);
        }
    }
}

async fn notify_one(connector: &NotificationConnector, meta: &Value) -> anyhow::Result<()> {
    let access = &connector.connector_access;

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(!access.ssl_verify.unwrap_or(true))
        .build()?;

    let mut request = match access.method.to_lowercase().as_str() {
        "post" => client.post(&access.url),
        "put" => client.put(&access.url),
        other => anyhow::bail!("HTTP method not valid: {}", other),
    };

    // Merge the meta payload into the user-supplied body
    let mut body = access.json_data.clone().unwrap_or_else(|| Value::Object(Default::default()));
    if let (Value::Object(body_map), Value::Object(meta_map)) = (&mut body, meta) {
        for (key, val) in meta_map {
            body_map.insert(key.clone(), val.clone());
        }
    }
    request = request.json(&body);

    if let Some(auth) = &access.auth {
        match auth.auth_type.as_str() {
            "basic" => {
                request = request.basic_auth(&auth.username, Some(&auth.password));
            }
            other => {
                warn!("Unsupported notification auth_type '{}', sending without auth", other);
            }
        }
    }

    request.send().await?.error_for_status()?;
    Ok(())
}
