use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::transport::rest::{escape_soql_literal, is_api_name, SalesforceClient};
use crate::transport::{NaturalKey, OutcomeError, RecordTarget, UpdateOutcome, UpdateRequest};

/// Applies one update and always reports an outcome; failures are data, not errors.
#[async_trait]
pub trait RecordUpdater: Send + Sync {
    async fn apply(&self, request: &UpdateRequest) -> UpdateOutcome;
}

/// [`RecordUpdater`] backed by the Salesforce REST API.
#[derive(Debug, Clone)]
pub struct SalesforceUpdater {
    client: SalesforceClient,
}

impl SalesforceUpdater {
    pub fn new(client: SalesforceClient) -> Self {
        Self { client }
    }

    pub async fn update_record(
        &self,
        object_type: &str,
        record_id: &str,
        fields: Map<String, Value>,
        metadata: Map<String, Value>,
    ) -> UpdateOutcome {
        let request = UpdateRequest::by_id(object_type, record_id, fields).with_metadata(metadata);
        self.apply(&request).await
    }

    /// Resolve `field = value` to a record id first; zero matches yields a not-found outcome
    /// without issuing the PATCH. When several records match, the first one is updated.
    pub async fn update_by_natural_key(
        &self,
        object_type: &str,
        field: &str,
        value: &str,
        fields: Map<String, Value>,
        metadata: Map<String, Value>,
    ) -> UpdateOutcome {
        let request =
            UpdateRequest::by_natural_key(object_type, field, value, fields).with_metadata(metadata);
        self.apply(&request).await
    }

    async fn resolve(&self, object_type: &str, key: &NaturalKey) -> Result<String, OutcomeError> {
        if !is_api_name(&key.field) {
            return Err(OutcomeError::other(format!("invalid lookup field: {:?}", key.field)));
        }

        let soql = format!(
            "SELECT Id FROM {object_type} WHERE {} = '{}' LIMIT 2",
            key.field,
            escape_soql_literal(&key.value)
        );
        let records = self.client.query(&soql).await?;

        let first = records.first().ok_or_else(|| OutcomeError::NotFound {
            field: key.field.clone(),
            value: key.value.clone(),
        })?;
        if records.len() > 1 {
            warn!(
                object_type = %object_type,
                field = %key.field,
                value = %key.value,
                "lookup matched more than one record; using the first"
            );
        }

        first
            .get("Id")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| OutcomeError::other("lookup result has no Id"))
    }

    async fn patch(&self, request: &UpdateRequest, record_id: &str) -> UpdateOutcome {
        if !record_id.chars().all(|c| c.is_ascii_alphanumeric()) || record_id.is_empty() {
            return UpdateOutcome::failed(
                request,
                Some(record_id),
                OutcomeError::other(format!("invalid record id: {record_id:?}")),
            );
        }

        match self
            .client
            .update(&request.object_type, record_id, &request.fields)
            .await
        {
            Ok(status) => {
                debug!(object_type = %request.object_type, record_id = %record_id, status, "record updated");
                UpdateOutcome::succeeded(request, record_id, status)
            }
            Err(err) => {
                warn!(
                    object_type = %request.object_type,
                    record_id = %record_id,
                    error = %err,
                    "record update failed"
                );
                UpdateOutcome::failed(request, Some(record_id), err.into())
            }
        }
    }
}

#[async_trait]
impl RecordUpdater for SalesforceUpdater {
    async fn apply(&self, request: &UpdateRequest) -> UpdateOutcome {
        if !is_api_name(&request.object_type) || request.object_type.contains('.') {
            return UpdateOutcome::failed(
                request,
                request.record_id(),
                OutcomeError::other(format!("invalid object type: {:?}", request.object_type)),
            );
        }

        match &request.target {
            RecordTarget::Id { record_id } => self.patch(request, record_id).await,
            RecordTarget::NaturalKey { lookup } => match self.resolve(&request.object_type, lookup).await {
                Ok(record_id) => self.patch(request, &record_id).await,
                Err(err) => {
                    warn!(
                        object_type = %request.object_type,
                        field = %lookup.field,
                        value = %lookup.value,
                        error = %err,
                        "natural key lookup failed"
                    );
                    UpdateOutcome::failed(request, None, err)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::auth::{AuthFlow, Session};
    use crate::transport::rest::DEFAULT_API_VERSION;
    use chrono::Utc;
    use mockito::{Matcher, Server};
    use serde_json::json;
    use std::time::Duration;

    fn updater_for(url: &str) -> SalesforceUpdater {
        let session = Session {
            access_token: "tok".into(),
            instance_url: url.to_string(),
            flow: AuthFlow::JwtBearer,
            issued_at: Utc::now(),
        };
        SalesforceUpdater::new(
            SalesforceClient::new(session, DEFAULT_API_VERSION, Duration::from_secs(5)).unwrap(),
        )
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_update_record_success_echoes_request() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PATCH", "/services/data/v59.0/sobjects/Account/001xx")
            .match_body(Matcher::Json(json!({"Name": "Acme"})))
            .with_status(204)
            .create_async()
            .await;

        let outcome = updater_for(&server.url())
            .update_record("Account", "001xx", fields(json!({"Name": "Acme"})), Map::new())
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.record_id.as_deref(), Some("001xx"));
        assert_eq!(outcome.update_data, fields(json!({"Name": "Acme"})));
        assert_eq!(outcome.status_code, Some(204));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_update_failure_is_captured() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("PATCH", "/services/data/v59.0/sobjects/Account/001xx")
            .with_status(400)
            .with_body(r#"[{"errorCode":"INVALID_FIELD","message":"No such column 'Nmae'"}]"#)
            .create_async()
            .await;

        let outcome = updater_for(&server.url())
            .update_record(
                "Account",
                "001xx",
                fields(json!({"Nmae": "Acme"})),
                fields(json!({"source": "row-7"})),
            )
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.status_code, Some(400));
        assert_eq!(outcome.metadata["source"], "row-7");
        match outcome.error.unwrap() {
            OutcomeError::Http { body, .. } => assert_eq!(body[0]["errorCode"], "INVALID_FIELD"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_natural_key_not_found_skips_patch() {
        let mut server = Server::new_async().await;
        let query = server
            .mock("GET", "/services/data/v59.0/query")
            .match_query(Matcher::UrlEncoded(
                "q".into(),
                "SELECT Id FROM Project__c WHERE Project_Number__c = 'P-404' LIMIT 2".into(),
            ))
            .with_status(200)
            .with_body(r#"{"totalSize":0,"done":true,"records":[]}"#)
            .create_async()
            .await;
        let patch = server
            .mock("PATCH", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let outcome = updater_for(&server.url())
            .update_by_natural_key(
                "Project__c",
                "Project_Number__c",
                "P-404",
                fields(json!({"Status__c": "Closed"})),
                Map::new(),
            )
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.status_code, Some(404));
        assert!(matches!(outcome.error, Some(OutcomeError::NotFound { .. })));
        query.assert_async().await;
        patch.assert_async().await;
    }

    #[tokio::test]
    async fn test_natural_key_uses_first_match() {
        let mut server = Server::new_async().await;
        let _query = server
            .mock("GET", "/services/data/v59.0/query")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"totalSize":2,"done":true,"records":[{"Id":"a01A"},{"Id":"a01B"}]}"#)
            .create_async()
            .await;
        let patch = server
            .mock("PATCH", "/services/data/v59.0/sobjects/Project__c/a01A")
            .with_status(204)
            .create_async()
            .await;

        let outcome = updater_for(&server.url())
            .update_by_natural_key(
                "Project__c",
                "Name",
                "O'Hare",
                fields(json!({"Status__c": "Active"})),
                Map::new(),
            )
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.record_id.as_deref(), Some("a01A"));
        patch.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_names_fail_without_network() {
        let updater = updater_for("http://127.0.0.1:9");

        let bad_object = updater
            .update_record("Account; DROP", "001xx", Map::new(), Map::new())
            .await;
        assert!(matches!(bad_object.error, Some(OutcomeError::Other { .. })));

        let bad_id = updater
            .update_record("Account", "../001", Map::new(), Map::new())
            .await;
        assert!(matches!(bad_id.error, Some(OutcomeError::Other { .. })));

        let bad_field = updater
            .update_by_natural_key("Account", "Name OR Id", "x", Map::new(), Map::new())
            .await;
        assert!(matches!(bad_field.error, Some(OutcomeError::Other { .. })));
    }
}
