//! Straight-line survey sync: query, update, export, extract, hand off.

pub mod plan;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::commands::batch::{BatchProcessor, BatchSummary};
use crate::commands::updater::SalesforceUpdater;
use crate::config::Settings;
use crate::connectors::sassie::{SassieClient, UploadReceipt};
use crate::export::csv::{run_stamp, write_outcomes, OutcomeFiles};
use crate::export::extract::{extract_ids_from_path, SkippedRow, DEFAULT_METADATA_COLUMN};
use crate::security::auth::AuthError;
use crate::security::token_cache::SessionCache;
use crate::transport::rest::{RestError, SalesforceClient};

pub use plan::{nested_candidate, resolve_path, transform, SyncPlan};

/// Setup-level failures; per-record failures land in the outcome files instead.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid sync plan: {0}")]
    InvalidPlan(String),
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("query failed: {0}")]
    Query(RestError),
    #[error("writing outputs failed: {0:#}")]
    Output(anyhow::Error),
    #[error("survey upload failed: {0:#}")]
    Upload(anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub records_queried: usize,
    pub requests: usize,
    pub summary: BatchSummary,
    pub files: OutcomeFiles,
    pub survey_ids: Vec<String>,
    pub skipped_rows: Vec<SkippedRow>,
    pub upload: Option<UploadReceipt>,
}

pub async fn run_sync(
    settings: &Settings,
    sessions: &SessionCache,
    plan: &SyncPlan,
) -> Result<SyncSummary, SyncError> {
    plan.validate().map_err(SyncError::InvalidPlan)?;
    let run_id = Uuid::new_v4();
    info!(run_id = %run_id, object_type = %plan.object_type, "sync started");

    let session = sessions.session().await?;
    let client = SalesforceClient::new(session, sessions.api_version(), settings.http_timeout)
        .map_err(SyncError::Query)?;
    let records = client.query(&plan.soql).await.map_err(SyncError::Query)?;
    let requests = transform(&records, plan);
    info!(
        run_id = %run_id,
        records = records.len(),
        requests = requests.len(),
        "records queried"
    );

    let request_count = requests.len();
    let processor = BatchProcessor::new(SalesforceUpdater::new(client), settings.batch);
    let report = processor.run(requests).await;

    let stamp = run_stamp(run_id);
    let files = write_outcomes(&settings.output_dir, &report, &stamp).map_err(SyncError::Output)?;

    let extraction =
        extract_ids_from_path(&files.successes, DEFAULT_METADATA_COLUMN, &plan.survey_id_key)
            .map_err(SyncError::Output)?;
    if !extraction.skipped.is_empty() {
        warn!(
            run_id = %run_id,
            skipped = extraction.skipped.len(),
            "some successful rows carried no survey id"
        );
    }

    let upload = match (&settings.sassie, extraction.ids.is_empty()) {
        (None, _) => {
            info!(run_id = %run_id, "SASSIE not configured; upload skipped");
            None
        }
        (Some(_), true) => {
            info!(run_id = %run_id, "no survey ids extracted; upload skipped");
            None
        }
        (Some(config), false) => {
            let client =
                SassieClient::new(config.clone(), settings.http_timeout).map_err(SyncError::Upload)?;
            Some(
                client
                    .upload_ids(&extraction.ids)
                    .await
                    .map_err(SyncError::Upload)?,
            )
        }
    };

    let summary = report.summary();
    info!(
        run_id = %run_id,
        successful = summary.successful,
        failed = summary.failed,
        survey_ids = extraction.ids.len(),
        uploaded = upload.is_some(),
        "sync finished"
    );

    Ok(SyncSummary {
        run_id,
        records_queried: records.len(),
        requests: request_count,
        summary,
        files,
        survey_ids: extraction.ids,
        skipped_rows: extraction.skipped,
        upload,
    })
}
