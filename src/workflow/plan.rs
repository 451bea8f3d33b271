use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::export::extract::DEFAULT_ID_KEY;
use crate::transport::rest::is_api_name;
use crate::transport::UpdateRequest;

fn default_survey_id_key() -> String {
    DEFAULT_ID_KEY.to_string()
}

/// Which records to read and how each becomes an update.
///
/// Paths are dotted Salesforce field paths; `Related_Project__r.Name` walks
/// into the relationship object returned by the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub object_type: String,
    pub soql: String,
    /// Target field -> source path.
    #[serde(default)]
    pub field_map: BTreeMap<String, String>,
    /// Constant values written on every update.
    #[serde(default)]
    pub static_fields: Map<String, Value>,
    #[serde(default)]
    pub survey_id_path: Option<String>,
    /// Metadata key -> source path; carried into the outcome files.
    #[serde(default)]
    pub metadata_paths: BTreeMap<String, String>,
    #[serde(default = "default_survey_id_key")]
    pub survey_id_key: String,
}

impl SyncPlan {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading sync plan {}", path.display()))?;
        let plan: SyncPlan = serde_json::from_str(&content)
            .with_context(|| format!("parsing sync plan {}", path.display()))?;
        Ok(plan)
    }

    /// Reject plans that would build invalid SOQL paths or empty updates.
    pub fn validate(&self) -> Result<(), String> {
        if !is_api_name(&self.object_type) || self.object_type.contains('.') {
            return Err(format!("invalid object type: {:?}", self.object_type));
        }
        let is_select = self
            .soql
            .split_whitespace()
            .next()
            .is_some_and(|word| word.eq_ignore_ascii_case("select"));
        if !is_select {
            return Err("soql must be a SELECT query".into());
        }
        if self.field_map.is_empty() && self.static_fields.is_empty() {
            return Err("plan updates no fields".into());
        }
        if let Some(target) = self
            .field_map
            .keys()
            .chain(self.static_fields.keys())
            .find(|name| !is_api_name(name) || name.contains('.'))
        {
            return Err(format!("invalid target field: {target:?}"));
        }
        if let Some(path) = self
            .field_map
            .values()
            .chain(self.metadata_paths.values())
            .chain(self.survey_id_path.iter())
            .find(|path| !is_api_name(path))
        {
            return Err(format!("invalid source path: {path:?}"));
        }
        if self.survey_id_key.trim().is_empty() {
            return Err("survey_id_key is empty".into());
        }
        Ok(())
    }
}

/// Walk a dotted path through nested relationship objects. Null counts as absent.
pub fn resolve_path<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |current, segment| current.as_object()?.get(segment))
        .filter(|value| !value.is_null())
}

/// Qualified path of `field` when it only exists under a relationship object.
pub fn nested_candidate(record: &Value, field: &str) -> Option<String> {
    record
        .as_object()?
        .iter()
        .filter(|(key, _)| key.as_str() != "attributes")
        .find(|(_, value)| value.get(field).is_some_and(|v| !v.is_null()))
        .map(|(key, _)| format!("{key}.{field}"))
}

fn lookup(record: &Value, path: &str, record_id: &str) -> Option<Value> {
    if let Some(value) = resolve_path(record, path) {
        return Some(value.clone());
    }
    match (path.contains('.'), nested_candidate(record, path)) {
        (false, Some(candidate)) => warn!(
            record_id = %record_id,
            path = %path,
            candidate = %candidate,
            "field only exists under a relationship; qualify the path"
        ),
        _ => debug!(record_id = %record_id, path = %path, "source value absent"),
    }
    None
}

/// Build one update per queried record.
///
/// Records without an `Id`, or that would update nothing, are skipped. Absent
/// source values are left out of the PATCH rather than written as null.
pub fn transform(records: &[Value], plan: &SyncPlan) -> Vec<UpdateRequest> {
    let mut requests = Vec::with_capacity(records.len());

    for (index, record) in records.iter().enumerate() {
        let Some(record_id) = record.get("Id").and_then(Value::as_str) else {
            warn!(index, "queried record has no Id; skipped");
            continue;
        };

        let mut fields = plan.static_fields.clone();
        for (target, path) in &plan.field_map {
            if let Some(value) = lookup(record, path, record_id) {
                fields.insert(target.clone(), value);
            }
        }
        if fields.is_empty() {
            warn!(record_id = %record_id, "no field values resolved; skipped");
            continue;
        }

        let mut metadata = Map::new();
        metadata.insert("recordId".into(), Value::String(record_id.to_string()));
        for (key, path) in &plan.metadata_paths {
            if let Some(value) = lookup(record, path, record_id) {
                metadata.insert(key.clone(), value);
            }
        }
        if let Some(path) = &plan.survey_id_path {
            if let Some(value) = lookup(record, path, record_id) {
                metadata.insert(plan.survey_id_key.clone(), value);
            }
        }

        requests.push(UpdateRequest::by_id(&plan.object_type, record_id, fields).with_metadata(metadata));
    }

    debug!(records = records.len(), requests = requests.len(), "records transformed");
    requests
}
