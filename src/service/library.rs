use super::{DriverContext, ServiceDriver};
use crate::identity::cas::CAS_TYPE_TAG;
use anyhow::Result;
use async_trait::async_trait;

/// Library catalog access. Session-backed lookups only; the catalog has no
/// data worth mirroring, so the refresh interval is 0 (never scheduled).
pub struct LibraryDriver;

impl LibraryDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LibraryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceDriver for LibraryDriver {
    fn type_tag(&self) -> &str {
        "library"
    }

    fn name(&self) -> &str {
        "Campus Library"
    }

    fn description(&self) -> &str {
        "Access to the campus library catalog and loan records"
    }

    fn category(&self) -> &str {
        "library"
    }

    fn identity_types(&self) -> Vec<&str> {
        vec![CAS_TYPE_TAG]
    }

    fn interval_ms(&self) -> i64 {
        0
    }

    async fn update(&self, ctx: &DriverContext) -> Result<()> {
        // Nothing cached locally; just confirm the session still authorizes
        // so a broken binding surfaces on manual refresh.
        let target = ctx
            .config_str("catalog_url")
            .unwrap_or("https://library.campus.example/")
            .to_string();
        ctx.authority
            .ensure_authorized(&ctx.identity_id, &target)
            .await?;
        tracing::debug!(service_id = %ctx.service_id, "library session verified");
        Ok(())
    }

    async fn prompt(&self, _ctx: &DriverContext, _question: &str) -> Result<String> {
        Ok("The library catalog is queried live; ask about a specific title or your loans.".into())
    }
}
