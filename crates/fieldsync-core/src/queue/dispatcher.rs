//! Per-entry analysis dispatch.
//!
//! Each state transition is committed before the next step acts on it: the
//! claim is persisted before the external call, and the result (or failure
//! marker) is written together with the entry's next state.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::TransactionBehavior;
use serde_json::json;

use crate::analysis::{build_payload, AnalysisService};
use crate::config::QueueConfig;
use crate::db::{CollectionRepository, Database, QueueRepository};
use crate::error::Result;
use crate::models::timestamp::now;
use crate::models::{Case, CaseStatus, Patient, QueueStats, QueueStatus, RecoveryReport};

/// What one dispatch call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Result stored, entry completed
    Completed,
    /// Attempt failed, entry re-queued
    Retrying {
        attempts: u32,
        retry_at: DateTime<Utc>,
    },
    /// Attempt failed with no attempts left
    Failed { attempts: u32 },
    /// Entry referenced a case that does not exist
    Dropped,
    /// Entry was not eligible (terminal, leased, backing off, or gone)
    Skipped,
}

/// Durable analysis queue and its dispatch logic
pub struct DispatchQueue {
    db: Database,
    service: Arc<dyn AnalysisService>,
    config: QueueConfig,
}

impl DispatchQueue {
    pub fn new(db: Database, service: Arc<dyn AnalysisService>, config: QueueConfig) -> Self {
        Self {
            db,
            service,
            config,
        }
    }

    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Ids of entries eligible for pickup now, at most `limit`.
    pub async fn ready(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.db.lock().await;
        QueueRepository::new(&conn).ready(now(), limit)
    }

    /// Entry counts per status.
    pub async fn stats(&self) -> Result<QueueStats> {
        let conn = self.db.lock().await;
        QueueRepository::new(&conn).stats()
    }

    /// Reclaim leases abandoned by a worker that stopped mid-dispatch.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let now = now();
        let lease = TimeDelta::from_std(self.config.lease_timeout).unwrap_or(TimeDelta::MAX);
        let cutoff = now.checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let conn = self.db.lock().await;
        let report = QueueRepository::new(&conn).recover_stale(cutoff, self.config.max_attempts, now)?;
        if report.requeued > 0 || report.failed > 0 {
            tracing::warn!(
                requeued = report.requeued,
                failed = report.failed,
                "Recovered abandoned analysis leases"
            );
        }
        Ok(report)
    }

    /// Run one analysis attempt for a queue entry.
    pub async fn dispatch(&self, entry_id: &str) -> Result<DispatchOutcome> {
        let (case, attempts, demographics) = {
            let conn = self.db.lock().await;
            let started = now();
            let queue = QueueRepository::new(&conn);

            let Some(entry) = queue.get(entry_id)? else {
                return Ok(DispatchOutcome::Skipped);
            };
            if entry.status != QueueStatus::Queued || entry.available_at > started {
                tracing::debug!(entry_id, status = %entry.status, "Entry not eligible for dispatch");
                return Ok(DispatchOutcome::Skipped);
            }

            let Some(stored) = CollectionRepository::<Case>::new(&conn).get(&entry.entity_id)? else {
                tracing::warn!(entry_id, case_id = %entry.entity_id, "Queued case not found; dropping entry");
                queue.fail(entry_id, "case not found", started)?;
                return Ok(DispatchOutcome::Dropped);
            };

            let Some(claimed) = queue.claim(entry_id, started)? else {
                return Ok(DispatchOutcome::Skipped);
            };
            let demographics = CollectionRepository::<Patient>::new(&conn)
                .get(&stored.record.patient_id)?
                .map(|patient| patient.record.demographics);
            (stored.record, claimed.attempts, demographics)
        };

        let payload = build_payload(&case, demographics.as_deref());
        tracing::info!(case_id = %case.id, attempts, "Dispatching case for analysis");
        let result = self.service.analyze(&payload).await;

        let mut conn = self.db.lock().await;
        let finished = now();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let cases = CollectionRepository::<Case>::new(&tx);
        let queue = QueueRepository::new(&tx);

        // Re-read so edits synced while the call was in flight are kept.
        let mut case = match cases.get(&case.id)? {
            Some(stored) => stored.record,
            None => {
                tracing::warn!(entry_id, case_id = %case.id, "Case disappeared during analysis; dropping entry");
                queue.fail(entry_id, "case not found", finished)?;
                tx.commit()?;
                return Ok(DispatchOutcome::Dropped);
            }
        };

        let outcome = match result {
            Ok(response) => {
                if !queue.complete(entry_id, finished)? {
                    tracing::warn!(entry_id, case_id = %case.id, "Lease lost before completion; result discarded");
                    return Ok(DispatchOutcome::Skipped);
                }
                let reported = response.status().unwrap_or("completed").to_string();
                case.ai_analysis = Some(serde_json::to_string(&response.into_value())?);
                case.status = CaseStatus::PendingDiagnosis;
                tracing::info!(case_id = %case.id, attempts, status = %reported, "Analysis completed");
                DispatchOutcome::Completed
            }
            Err(err) => {
                let error = err.to_string();
                let outcome = if attempts < self.config.max_attempts {
                    let retry_at = self.retry_at(finished, attempts);
                    if !queue.requeue(entry_id, retry_at, &error, finished)? {
                        tracing::warn!(entry_id, case_id = %case.id, "Lease lost before retry scheduling");
                        return Ok(DispatchOutcome::Skipped);
                    }
                    tracing::warn!(case_id = %case.id, attempts, retry_at = %retry_at, error = %error, "Analysis failed; retry scheduled");
                    DispatchOutcome::Retrying { attempts, retry_at }
                } else {
                    if !queue.fail(entry_id, &error, finished)? {
                        tracing::warn!(entry_id, case_id = %case.id, "Lease lost before failure");
                        return Ok(DispatchOutcome::Skipped);
                    }
                    tracing::error!(case_id = %case.id, attempts, error = %error, "Analysis failed permanently");
                    DispatchOutcome::Failed { attempts }
                };
                case.ai_analysis = Some(
                    json!({"status": "failed", "error": error, "attempts": attempts}).to_string(),
                );
                case.status = CaseStatus::AnalysisFailed;
                outcome
            }
        };

        case.last_modified_at = finished;
        cases.put(&case, finished)?;
        tx.commit()?;
        Ok(outcome)
    }

    fn retry_at(&self, from: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        let delay = TimeDelta::from_std(self.config.backoff_for(attempts)).unwrap_or(TimeDelta::MAX);
        from.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisError, AnalysisResponse};
    use crate::services::{Caller, NewCase, NewPatient, RecordService};
    use crate::sync::{SyncRequest, SyncService};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Replays scripted results and records every payload it receives.
    #[derive(Default)]
    struct ScriptedService {
        script: Mutex<VecDeque<std::result::Result<Value, String>>>,
        calls: Mutex<Vec<Value>>,
    }

    impl ScriptedService {
        fn with(results: Vec<std::result::Result<Value, String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(results.into()),
                calls: Mutex::default(),
            })
        }

        fn calls(&self) -> Vec<Value> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AnalysisService for ScriptedService {
        async fn analyze(&self, payload: &Value) -> std::result::Result<AnalysisResponse, AnalysisError> {
            self.calls.lock().unwrap().push(payload.clone());
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err("script exhausted".to_string()));
            match next {
                Ok(body) => AnalysisResponse::from_json(body),
                Err(message) => Err(AnalysisError::Transport(message)),
            }
        }
    }

    fn config() -> QueueConfig {
        QueueConfig::default().with_backoff_base(Duration::ZERO)
    }

    async fn seed_high_risk_case(db: &Database) -> String {
        let records = RecordService::new(db.clone(), Arc::new(Notify::new()));
        let patient = records
            .create_patient(
                Caller::chw("chw-1"),
                NewPatient {
                    id: Some("p1".into()),
                    demographics: json!({"age": 52}),
                },
            )
            .await
            .unwrap();
        records
            .create_case(
                Caller::chw("chw-1"),
                NewCase {
                    id: Some("c1".into()),
                    patient_id: patient.record.id,
                    triage_data: Some(json!({"lesion": "irregular border"})),
                    image_urls: Some(json!(["lesion.jpg"])),
                    risk_level: Some("high".into()),
                },
            )
            .await
            .unwrap()
            .record
            .id
    }

    async fn entry_id(db: &Database, case_id: &str) -> String {
        let conn = db.lock().await;
        QueueRepository::new(&conn)
            .get_by_entity(case_id)
            .unwrap()
            .unwrap()
            .id
    }

    async fn case(db: &Database, case_id: &str) -> Case {
        let conn = db.lock().await;
        CollectionRepository::<Case>::new(&conn)
            .get(case_id)
            .unwrap()
            .unwrap()
            .record
    }

    async fn entry(db: &Database, case_id: &str) -> crate::models::AnalysisQueueEntry {
        let conn = db.lock().await;
        QueueRepository::new(&conn)
            .get_by_entity(case_id)
            .unwrap()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_success_stores_result_and_completes() {
        let db = Database::open_in_memory().unwrap();
        let case_id = seed_high_risk_case(&db).await;
        let service = ScriptedService::with(vec![Ok(json!({
            "status": "completed",
            "analysis": {"diagnosis": "Suspicious melanocytic lesion", "confidence": 0.87}
        }))]);
        let queue = DispatchQueue::new(db.clone(), service.clone(), config());

        let id = entry_id(&db, &case_id).await;
        assert_eq!(queue.dispatch(&id).await.unwrap(), DispatchOutcome::Completed);

        let stored = case(&db, &case_id).await;
        assert_eq!(stored.status, CaseStatus::PendingDiagnosis);
        let analysis: Value = serde_json::from_str(stored.ai_analysis.as_deref().unwrap()).unwrap();
        assert_eq!(analysis["analysis"]["confidence"], json!(0.87));

        let entry = entry(&db, &case_id).await;
        assert_eq!(entry.status, QueueStatus::Completed);
        assert_eq!(entry.attempts, 1);

        let payload = &service.calls()[0];
        assert_eq!(payload["case_id"], json!("c1"));
        assert_eq!(payload["triage_data"], json!({"lesion": "irregular border"}));
        assert_eq!(payload["image_urls"], json!(["lesion.jpg"]));
        assert_eq!(payload["patient_demographics"], json!({"age": 52}));

        // Completed entries are never reprocessed.
        assert_eq!(queue.dispatch(&id).await.unwrap(), DispatchOutcome::Skipped);
        assert_eq!(service.calls().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_newer_client_resync_keeps_analysis_result() {
        let db = Database::open_in_memory().unwrap();
        let case_id = seed_high_risk_case(&db).await;
        let service = ScriptedService::with(vec![Ok(json!({
            "status": "completed",
            "analysis": {"diagnosis": "melanoma"}
        }))]);
        let queue = DispatchQueue::new(db.clone(), service, config());
        let id = entry_id(&db, &case_id).await;
        assert_eq!(queue.dispatch(&id).await.unwrap(), DispatchOutcome::Completed);
        let analyzed = case(&db, &case_id).await;

        SyncService::new(db.clone(), Arc::new(Notify::new()))
            .reconcile(
                SyncRequest::from_json(json!({"changes": {"cases": [{
                    "id": "c1",
                    "patient_id": "p1",
                    "triage_data": {"lesion": "irregular border", "itching": true},
                    "risk_level": "high",
                    "last_modified_at": "2099-01-01T00:00:00Z"
                }]}}))
                .unwrap(),
                "chw-1",
            )
            .await
            .unwrap();

        let resynced = case(&db, &case_id).await;
        assert_eq!(resynced.status, CaseStatus::PendingDiagnosis);
        assert_eq!(resynced.ai_analysis, analyzed.ai_analysis);
        assert_eq!(resynced.image_urls, analyzed.image_urls);
        assert_eq!(resynced.triage_data, r#"{"itching":true,"lesion":"irregular border"}"#);
        assert_eq!(entry(&db, &case_id).await.status, QueueStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_always_failing_service_exhausts_attempts() {
        let db = Database::open_in_memory().unwrap();
        let case_id = seed_high_risk_case(&db).await;
        let service = ScriptedService::with(Vec::new());
        let queue = DispatchQueue::new(db.clone(), service.clone(), config());
        let id = entry_id(&db, &case_id).await;

        let mut outcomes = Vec::new();
        for _ in 0..5 {
            outcomes.push(queue.dispatch(&id).await.unwrap());
        }

        assert!(matches!(outcomes[0], DispatchOutcome::Retrying { attempts: 1, .. }));
        assert!(matches!(outcomes[1], DispatchOutcome::Retrying { attempts: 2, .. }));
        assert_eq!(outcomes[2], DispatchOutcome::Failed { attempts: 3 });
        assert_eq!(outcomes[3], DispatchOutcome::Skipped);
        assert_eq!(outcomes[4], DispatchOutcome::Skipped);
        assert_eq!(service.calls().len(), 3);

        let entry = entry(&db, &case_id).await;
        assert_eq!(entry.status, QueueStatus::Failed);
        assert_eq!(entry.attempts, 3);
        assert!(entry.last_error.unwrap().contains("script exhausted"));

        let stored = case(&db, &case_id).await;
        assert_eq!(stored.status, CaseStatus::AnalysisFailed);
        let marker: Value = serde_json::from_str(stored.ai_analysis.as_deref().unwrap()).unwrap();
        assert_eq!(marker["status"], json!("failed"));
        assert_eq!(marker["attempts"], json!(3));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retry_waits_for_backoff() {
        let db = Database::open_in_memory().unwrap();
        let case_id = seed_high_risk_case(&db).await;
        let service = ScriptedService::with(vec![Err("connection refused".into())]);
        let queue = DispatchQueue::new(
            db.clone(),
            service.clone(),
            QueueConfig::default().with_backoff_base(Duration::from_secs(60)),
        );
        let id = entry_id(&db, &case_id).await;

        let before = now();
        let DispatchOutcome::Retrying { attempts, retry_at } = queue.dispatch(&id).await.unwrap() else {
            panic!("expected a retry");
        };
        assert_eq!(attempts, 1);
        assert!(retry_at >= before + TimeDelta::seconds(120));

        assert!(queue.ready(10).await.unwrap().is_empty());
        assert_eq!(queue.dispatch(&id).await.unwrap(), DispatchOutcome::Skipped);
        assert_eq!(service.calls().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_then_success() {
        let db = Database::open_in_memory().unwrap();
        let case_id = seed_high_risk_case(&db).await;
        let service = ScriptedService::with(vec![
            Err("timeout".into()),
            Ok(json!({"status": "completed", "analysis": {"severity_score": 3}})),
        ]);
        let queue = DispatchQueue::new(db.clone(), service, config());
        let id = entry_id(&db, &case_id).await;

        assert!(matches!(queue.dispatch(&id).await.unwrap(), DispatchOutcome::Retrying { .. }));
        assert_eq!(case(&db, &case_id).await.status, CaseStatus::AnalysisFailed);
        assert_eq!(queue.dispatch(&id).await.unwrap(), DispatchOutcome::Completed);

        let entry = entry(&db, &case_id).await;
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.last_error, None);
        assert_eq!(case(&db, &case_id).await.status, CaseStatus::PendingDiagnosis);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_case_is_dropped_without_retry() {
        let db = Database::open_in_memory().unwrap();
        {
            let conn = db.lock().await;
            QueueRepository::new(&conn).enqueue("ghost", now()).unwrap();
        }
        let service = ScriptedService::with(Vec::new());
        let queue = DispatchQueue::new(db.clone(), service.clone(), config());
        let id = entry_id(&db, "ghost").await;

        assert_eq!(queue.dispatch(&id).await.unwrap(), DispatchOutcome::Dropped);
        assert!(service.calls().is_empty());

        let entry = entry(&db, "ghost").await;
        assert_eq!(entry.status, QueueStatus::Failed);
        assert_eq!(entry.attempts, 0);
        assert_eq!(queue.stats().await.unwrap().failed, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recover_requeues_abandoned_lease() {
        let db = Database::open_in_memory().unwrap();
        let case_id = seed_high_risk_case(&db).await;
        let id = entry_id(&db, &case_id).await;
        {
            let conn = db.lock().await;
            QueueRepository::new(&conn)
                .claim(&id, now() - TimeDelta::hours(1))
                .unwrap();
        }

        let queue = DispatchQueue::new(db.clone(), ScriptedService::with(Vec::new()), config());
        let report = queue.recover().await.unwrap();
        assert_eq!(report, RecoveryReport { requeued: 1, failed: 0 });

        let entry = entry(&db, &case_id).await;
        assert_eq!(entry.status, QueueStatus::Queued);
        assert_eq!(entry.attempts, 1);
    }
}
