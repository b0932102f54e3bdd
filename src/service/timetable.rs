use super::{DriverContext, ServiceDriver};
use crate::identity::Parameter;
use crate::identity::cas::CAS_TYPE_TAG;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

const DEFAULT_INTERVAL_MS: i64 = 30 * 60 * 1000;

/// Class timetable mirror. Periodically pulls the schedule feed through a
/// CAS-authorized ticket and caches it in the service's runtime blob.
pub struct TimetableDriver;

impl TimetableDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TimetableDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceDriver for TimetableDriver {
    fn type_tag(&self) -> &str {
        "timetable"
    }

    fn name(&self) -> &str {
        "Class Timetable"
    }

    fn description(&self) -> &str {
        "Mirrors your class schedule from the campus portal"
    }

    fn category(&self) -> &str {
        "timetable"
    }

    fn identity_types(&self) -> Vec<&str> {
        vec![CAS_TYPE_TAG]
    }

    fn params(&self) -> Vec<Parameter> {
        vec![
            Parameter::required("endpoint", "string", "Schedule Endpoint")
                .with_description("URL of the portal's schedule feed"),
        ]
    }

    fn interval_ms(&self) -> i64 {
        DEFAULT_INTERVAL_MS
    }

    async fn update(&self, ctx: &DriverContext) -> Result<()> {
        let endpoint = ctx
            .config_str("endpoint")
            .context("timetable service is missing its endpoint")?
            .to_string();

        let auth = ctx
            .authority
            .ensure_authorized(&ctx.identity_id, &endpoint)
            .await?;

        let response = ctx
            .http
            .get(&endpoint)
            .query(&[("ticket", auth.ticket.ticket.as_str())])
            .send()
            .await
            .with_context(|| format!("schedule fetch failed: {endpoint}"))?;

        if !response.status().is_success() {
            anyhow::bail!("schedule feed returned {}", response.status());
        }

        let body = response
            .text()
            .await
            .context("schedule feed body unreadable")?;
        let content_hash = hex::encode(Sha256::digest(body.as_bytes()));

        // Skip the write when nothing changed; update must stay idempotent
        // under at-least-once delivery anyway.
        if let Some(runtime) = ctx.load_runtime()?
            && runtime.get("content_hash").and_then(Value::as_str) == Some(content_hash.as_str())
        {
            tracing::debug!(service_id = %ctx.service_id, "timetable unchanged");
            return Ok(());
        }

        let entries: Value =
            serde_json::from_str(&body).context("schedule feed is not valid JSON")?;

        ctx.save_runtime(&json!({
            "fetched_at": Utc::now().to_rfc3339(),
            "content_hash": content_hash,
            "entries": entries,
        }))?;

        tracing::info!(service_id = %ctx.service_id, "timetable refreshed");
        Ok(())
    }

    async fn prompt(&self, ctx: &DriverContext, _question: &str) -> Result<String> {
        let Some(runtime) = ctx.load_runtime()? else {
            return Ok("Your timetable has not been fetched yet; try a refresh.".into());
        };

        let count = runtime
            .get("entries")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        let fetched_at = runtime
            .get("fetched_at")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        Ok(format!(
            "Your timetable has {count} entries (last fetched {fetched_at})."
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::required_params_present;

    #[test]
    fn endpoint_is_required() {
        let driver = TimetableDriver::new();
        let params = driver.params();

        assert!(required_params_present(
            &params,
            &json!({"endpoint": "https://portal.campus.example/schedule"})
        ));
        assert!(!required_params_present(&params, &json!({})));
    }

    #[test]
    fn descriptor_reflects_metadata() {
        let descriptor = TimetableDriver::new().descriptor();
        assert_eq!(descriptor.type_tag, "timetable");
        assert_eq!(descriptor.interval_ms, DEFAULT_INTERVAL_MS);
        assert!(!descriptor.rag);
    }
}
