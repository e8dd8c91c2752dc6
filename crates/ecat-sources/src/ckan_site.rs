//! Live deployments through their public action API.

use async_trait::async_trait;
use ecat_core::{Identifier, Record, Schema};
use ecat_storage::HttpFetcher;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::debug;

use crate::{ApiError, MetadataApi};

#[derive(Debug, Clone)]
pub struct CkanSiteApi {
    http: HttpFetcher,
    schema: Schema,
}

impl CkanSiteApi {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            schema: Schema::sites(),
        }
    }

    async fn action(&self, base: &str, action: &str) -> Result<JsonValue, ApiError> {
        let url = format!("{base}/api/3/action/{action}");
        let body = self.http.get_json(&url, &[], None).await?.body;
        if body.get("success").and_then(JsonValue::as_bool) != Some(true) {
            return Err(ApiError::Permanent(format!("{action} answered success=false")));
        }
        Ok(body.get("result").cloned().unwrap_or(JsonValue::Null))
    }

    /// `None` when the site refuses or lacks the listing; outages propagate.
    async fn list_len(&self, base: &str, action: &str) -> Result<Option<usize>, ApiError> {
        match self.action(base, action).await {
            Ok(JsonValue::Array(items)) => Ok(Some(items.len())),
            Ok(_) => Ok(None),
            Err(err @ ApiError::Transient(_)) => Err(err),
            Err(err) => {
                debug!(action, error = %err, "optional count unavailable");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl MetadataApi for CkanSiteApi {
    fn name(&self) -> &'static str {
        "ckan-site"
    }

    async fn get_metadata(&self, identifier: &Identifier) -> Result<Record, ApiError> {
        let base = normalize_site_url(identifier.as_str())
            .ok_or_else(|| ApiError::Permanent("empty site url".into()))?;

        let status = self.action(&base, "status_show").await?;
        let mut raw = JsonMap::new();
        for (field, key) in [
            ("ckan_version", "ckan_version"),
            ("description", "site_description"),
            ("api_title", "site_title"),
            ("contact_email", "error_emails_to"),
            ("primary_language", "locale_default"),
        ] {
            if let Some(value) = status.get(key) {
                raw.insert(field.to_string(), value.clone());
            }
        }
        match status.get("extensions") {
            Some(JsonValue::Array(items)) => {
                let joined = items
                    .iter()
                    .filter_map(JsonValue::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                raw.insert("extensions".into(), joined.into());
            }
            Some(JsonValue::String(s)) => {
                raw.insert("extensions".into(), s.clone().into());
            }
            _ => {}
        }

        for (field, action) in [
            ("num_groups", "group_list"),
            ("num_organizations", "organization_list"),
            ("num_datasets", "package_list"),
        ] {
            if let Some(count) = self.list_len(&base, action).await? {
                raw.insert(field.to_string(), (count as i64).into());
            }
        }

        Ok(self.schema.record_from_json(&raw)?)
    }
}

/// Adds a missing scheme and strips trailing slashes.
pub fn normalize_site_url(input: &str) -> Option<String> {
    let url = input.trim();
    if url.is_empty() {
        return None;
    }
    let url = if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    };
    Some(url.trim_end_matches('/').to_string())
}
