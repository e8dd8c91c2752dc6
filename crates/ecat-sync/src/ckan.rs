//! Catalog backed by CKAN DataStore resources.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use ecat_core::{ChangeEvent, ChangeKind, Identifier, Record, Schema, Snapshot};
use ecat_storage::HttpFetcher;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CatalogError};

pub const DEFAULT_PAGE_SIZE: usize = 1000;

type Row = JsonMap<String, JsonValue>;

/// Where one dataset's two resources live and how its rows are typed.
#[derive(Debug, Clone)]
pub struct CkanBinding {
    pub schema: Schema,
    pub snapshot_resource: String,
    pub timeseries_resource: String,
}

/// Time-series columns; `tstamp` stays text so rows read back exactly as written.
const TIMESERIES_FIELDS: [(&str, &str); 6] = [
    ("identifier", "text"),
    ("change", "text"),
    ("tstamp", "text"),
    ("changed_fields", "text"),
    ("before", "text"),
    ("after", "text"),
];

#[derive(Debug, Clone, PartialEq)]
enum TimeSeries {
    Active(String),
    /// Resource exists but was never given a DataStore table.
    Inactive(String),
    Missing,
}

#[derive(Debug, Clone)]
struct ResourceIds {
    package_id: String,
    snapshot: String,
    timeseries: TimeSeries,
}

#[derive(Debug)]
pub struct CkanCatalog {
    http: HttpFetcher,
    base_url: String,
    api_key: Option<String>,
    bindings: HashMap<String, CkanBinding>,
    resolved: Mutex<HashMap<String, ResourceIds>>,
    page_size: usize,
}

impl CkanCatalog {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            bindings: HashMap::new(),
            resolved: Mutex::new(HashMap::new()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_binding(mut self, dataset_id: impl Into<String>, binding: CkanBinding) -> Self {
        self.bindings.insert(dataset_id.into(), binding);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn binding(&self, dataset_id: &str) -> Result<&CkanBinding, CatalogError> {
        self.bindings
            .get(dataset_id)
            .ok_or_else(|| CatalogError::UnknownDataset(dataset_id.to_string()))
    }

    async fn action(&self, action: &str, body: JsonValue) -> Result<JsonValue, CatalogError> {
        let url = format!("{}/api/3/action/{action}", self.base_url);
        let resp = self.http.post_json(&url, &body, self.api_key.as_deref()).await?;
        if resp.body.get("success").and_then(JsonValue::as_bool) != Some(true) {
            let message = resp
                .body
                .get("error")
                .map(JsonValue::to_string)
                .unwrap_or_else(|| "success=false".to_string());
            return Err(CatalogError::Rejected {
                action: action.to_string(),
                message,
            });
        }
        Ok(resp.body.get("result").cloned().unwrap_or(JsonValue::Null))
    }

    /// Resource ids are looked up by name prefix once per dataset. The snapshot resource must
    /// exist; the time-series resource is created on first append.
    async fn resources(&self, dataset_id: &str) -> Result<ResourceIds, CatalogError> {
        let mut cache = self.resolved.lock().await;
        if let Some(ids) = cache.get(dataset_id) {
            return Ok(ids.clone());
        }
        let binding = self.binding(dataset_id)?;
        let package = self.action("package_show", json!({ "id": dataset_id })).await?;
        let package_id = package
            .get("id")
            .and_then(JsonValue::as_str)
            .unwrap_or(dataset_id)
            .to_string();
        let resources = package
            .get("resources")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        let find = |prefix: &str| {
            resources.iter().find(|r| {
                r.get("name")
                    .and_then(JsonValue::as_str)
                    .is_some_and(|name| name.starts_with(prefix))
            })
        };
        let resource_id = |r: &JsonValue| r.get("id").and_then(JsonValue::as_str).map(str::to_string);

        let snapshot = find(&binding.snapshot_resource)
            .and_then(resource_id)
            .ok_or_else(|| CatalogError::MissingResource {
                dataset: dataset_id.to_string(),
                resource: binding.snapshot_resource.clone(),
            })?;
        let timeseries = match find(&binding.timeseries_resource) {
            Some(r) => match resource_id(r) {
                Some(id) if r.get("datastore_active").and_then(JsonValue::as_bool) == Some(false) => {
                    TimeSeries::Inactive(id)
                }
                Some(id) => TimeSeries::Active(id),
                None => TimeSeries::Missing,
            },
            None => TimeSeries::Missing,
        };
        let ids = ResourceIds {
            package_id,
            snapshot,
            timeseries,
        };
        debug!(dataset_id, snapshot = %ids.snapshot, timeseries = ?ids.timeseries, "resolved resources");
        cache.insert(dataset_id.to_string(), ids.clone());
        Ok(ids)
    }

    /// Creates the time-series table (no primary key) seeded with `rows`; returns its resource id.
    async fn create_time_series(
        &self,
        dataset_id: &str,
        ids: &ResourceIds,
        rows: Vec<Row>,
    ) -> Result<String, CatalogError> {
        let binding = self.binding(dataset_id)?;
        let fields: Vec<JsonValue> = TIMESERIES_FIELDS
            .iter()
            .map(|(id, kind)| json!({ "id": id, "type": kind }))
            .collect();
        let mut body = json!({ "fields": fields, "records": rows, "force": true });
        match &ids.timeseries {
            TimeSeries::Inactive(resource_id) | TimeSeries::Active(resource_id) => {
                body["resource_id"] = resource_id.clone().into();
            }
            TimeSeries::Missing => {
                body["resource"] = json!({
                    "package_id": ids.package_id,
                    "name": binding.timeseries_resource,
                    "description": last_updated_description(&binding.timeseries_resource, Utc::now()),
                    "format": "CSV",
                });
            }
        }
        let result = self.action("datastore_create", body).await?;
        let resource_id = result
            .get("resource_id")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .or_else(|| match &ids.timeseries {
                TimeSeries::Inactive(id) | TimeSeries::Active(id) => Some(id.clone()),
                TimeSeries::Missing => None,
            })
            .ok_or_else(|| CatalogError::Rejected {
                action: "datastore_create".to_string(),
                message: "response carried no resource_id".to_string(),
            })?;
        info!(dataset_id, resource_id = %resource_id, "time-series table created");

        if let Some(cached) = self.resolved.lock().await.get_mut(dataset_id) {
            cached.timeseries = TimeSeries::Active(resource_id.clone());
        }
        Ok(resource_id)
    }

    /// Refreshes the resource description; a failure only logs, the data is already written.
    async fn stamp_updated(&self, resource_id: &str, label: &str) {
        let body = json!({
            "id": resource_id,
            "description": last_updated_description(label, Utc::now()),
        });
        if let Err(err) = self.action("resource_patch", body).await {
            warn!(resource_id, error = %err, "could not stamp resource description");
        }
    }

    async fn search_all(&self, resource_id: &str) -> Result<Vec<Row>, CatalogError> {
        let mut rows = Vec::new();
        loop {
            let result = self
                .action(
                    "datastore_search",
                    json!({
                        "resource_id": resource_id,
                        "limit": self.page_size,
                        "offset": rows.len(),
                    }),
                )
                .await?;
            let page = result
                .get("records")
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default();
            let total = result.get("total").and_then(JsonValue::as_u64);
            let fetched = page.len();
            for record in page {
                if let JsonValue::Object(mut row) = record {
                    row.remove("_id");
                    rows.push(row);
                }
            }
            let done = fetched < self.page_size
                || total.is_some_and(|total| rows.len() as u64 >= total);
            if fetched == 0 || done {
                break;
            }
        }
        Ok(rows)
    }

    async fn delete_all(&self, resource_id: &str) -> Result<(), CatalogError> {
        self.action(
            "datastore_delete",
            json!({ "resource_id": resource_id, "filters": {}, "force": true }),
        )
        .await
        .map(|_| ())
    }

    async fn insert(&self, resource_id: &str, rows: Vec<Row>) -> Result<(), CatalogError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.action(
            "datastore_upsert",
            json!({
                "resource_id": resource_id,
                "records": rows,
                "method": "insert",
                "force": true,
            }),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl Catalog for CkanCatalog {
    async fn check_connection(&self) -> Result<(), CatalogError> {
        self.action("site_read", json!({})).await?;
        Ok(())
    }

    async fn get_snapshot(&self, dataset_id: &str) -> Result<Snapshot, CatalogError> {
        let schema = &self.binding(dataset_id)?.schema;
        let ids = self.resources(dataset_id).await?;
        let mut snapshot = Snapshot::new();
        for row in self.search_all(&ids.snapshot).await? {
            let unknown: Vec<&str> = row
                .keys()
                .map(String::as_str)
                .filter(|k| *k != schema.id_column && schema.field(k).is_none())
                .collect();
            if !unknown.is_empty() {
                debug!(dataset_id, ?unknown, "ignoring columns outside the schema");
            }
            let (id, record) = schema
                .row_to_entry(&row)
                .map_err(|e| CatalogError::InvalidRow(e.to_string()))?;
            if snapshot.insert(id.clone(), record).is_some() {
                return Err(CatalogError::DuplicateIdentifier(id));
            }
        }
        Ok(snapshot)
    }

    /// Delete then insert; a failed insert re-inserts the rows read beforehand.
    async fn replace_snapshot(&self, dataset_id: &str, snapshot: &Snapshot) -> Result<(), CatalogError> {
        let schema = &self.binding(dataset_id)?.schema;
        let ids = self.resources(dataset_id).await?;
        let current = self.search_all(&ids.snapshot).await?;
        let rows: Vec<Row> = snapshot
            .iter()
            .map(|(id, record)| schema.entry_to_row(id, record))
            .collect();

        self.delete_all(&ids.snapshot).await?;
        match self.insert(&ids.snapshot, rows).await {
            Ok(()) => {
                info!(dataset_id, rows = snapshot.len(), "snapshot replaced");
                let binding = self.binding(dataset_id)?;
                self.stamp_updated(&ids.snapshot, &binding.snapshot_resource).await;
                Ok(())
            }
            Err(insert_err) => {
                warn!(dataset_id, error = %insert_err, "snapshot insert failed, restoring previous rows");
                match self.insert(&ids.snapshot, current).await {
                    Ok(()) => Err(insert_err),
                    Err(restore_err) => Err(CatalogError::Inconsistent(format!(
                        "insert failed ({insert_err}); restore failed ({restore_err})"
                    ))),
                }
            }
        }
    }

    async fn append_time_series(&self, dataset_id: &str, events: &[ChangeEvent]) -> Result<(), CatalogError> {
        if events.is_empty() {
            return Ok(());
        }
        let ids = self.resources(dataset_id).await?;
        let rows: Vec<Row> = events.iter().map(event_to_row).collect();
        let resource_id = match &ids.timeseries {
            TimeSeries::Active(resource_id) => {
                self.insert(resource_id, rows).await?;
                resource_id.clone()
            }
            TimeSeries::Inactive(_) | TimeSeries::Missing => {
                self.create_time_series(dataset_id, &ids, rows).await?
            }
        };
        let binding = self.binding(dataset_id)?;
        self.stamp_updated(&resource_id, &binding.timeseries_resource).await;
        Ok(())
    }

    async fn get_time_series(&self, dataset_id: &str) -> Result<Vec<ChangeEvent>, CatalogError> {
        let ids = self.resources(dataset_id).await?;
        let TimeSeries::Active(resource_id) = &ids.timeseries else {
            debug!(dataset_id, "no time-series table yet");
            return Ok(Vec::new());
        };
        let rows = self.search_all(resource_id).await?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            match row_to_event(&row) {
                Some(event) => events.push(event),
                None => debug!(dataset_id, "skipping time-series row without event columns"),
            }
        }
        Ok(events)
    }
}

fn last_updated_description(label: &str, at: DateTime<Utc>) -> String {
    format!("{label}. Last updated: {}", at.to_rfc3339_opts(SecondsFormat::Secs, true))
}

pub fn event_to_row(event: &ChangeEvent) -> Row {
    let encode = |record: &Option<Record>| match record {
        Some(record) => serde_json::to_string(record)
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null),
        None => JsonValue::Null,
    };
    let mut row = Row::new();
    row.insert("identifier".into(), event.identifier.to_string().into());
    row.insert("change".into(), event.kind.as_str().into());
    row.insert(
        "tstamp".into(),
        event.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true).into(),
    );
    row.insert("changed_fields".into(), event.changed_fields.join(",").into());
    row.insert("before".into(), encode(&event.before));
    row.insert("after".into(), encode(&event.after));
    row
}

pub fn row_to_event(row: &Row) -> Option<ChangeEvent> {
    let identifier = Identifier::new(row.get("identifier")?.as_str()?);
    let kind = ChangeKind::parse(row.get("change")?.as_str()?)?;
    let timestamp = DateTime::parse_from_rfc3339(row.get("tstamp")?.as_str()?)
        .ok()?
        .with_timezone(&Utc);
    let changed_fields = row
        .get("changed_fields")
        .and_then(JsonValue::as_str)
        .map(|s| {
            s.split(',')
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let decode = |key: &str| -> Option<Record> {
        row.get(key)
            .and_then(JsonValue::as_str)
            .and_then(|s| serde_json::from_str(s).ok())
    };
    Some(ChangeEvent {
        identifier,
        kind,
        timestamp,
        changed_fields,
        before: decode("before"),
        after: decode("after"),
    })
}
