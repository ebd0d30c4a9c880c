//! Server-side record writes and role-scoped reads
//!
//! Direct writes are authoritative: they stamp the server's wall clock as
//! `last_modified_at` and overwrite unconditionally, unlike synced
//! candidates which go through last-write-wins.
//!
//! Field workers see only what they own. Clinicians read every patient and
//! case and are the only callers that may record a diagnosis.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

use crate::db::{CollectionRepository, ConflictLog, Database, QueueRepository};
use crate::error::{Error, Result};
use crate::models::timestamp::now;
use crate::models::{
    is_high_risk, new_record_id, Case, CaseStatus, Diagnosis, Patient, QueueEntryView, QueueStats,
    Role, StoredRecord, SyncConflict, SyncEntity, SyncStatus, Vitals, OWNER_FIELD,
};
use crate::normalize::to_storage;
use crate::util::{normalize_text_option, user_fingerprint};

const DEFAULT_RISK_LEVEL: &str = "low";

/// Case statuses still waiting on a clinician.
const OPEN_STATUSES: [CaseStatus; 4] = [
    CaseStatus::Triaged,
    CaseStatus::AwaitingAnalysis,
    CaseStatus::PendingDiagnosis,
    CaseStatus::AnalysisFailed,
];

/// Window for the `this_week` counters
const WEEK: Duration = Duration::days(7);

/// Authenticated identity behind a direct request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller<'a> {
    pub id: &'a str,
    pub role: Role,
}

impl<'a> Caller<'a> {
    pub const fn new(id: &'a str, role: Role) -> Self {
        Self { id, role }
    }

    pub const fn chw(id: &'a str) -> Self {
        Self::new(id, Role::Chw)
    }

    pub const fn doctor(id: &'a str) -> Self {
        Self::new(id, Role::Doctor)
    }

    fn require(self, role: Role, action: &str) -> Result<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(Error::Forbidden(format!("{action} requires the {role} role")))
        }
    }

    fn can_read(self, owner: Option<&str>) -> bool {
        self.role == Role::Doctor || owner == Some(self.id)
    }
}

/// Body of a direct patient registration
#[derive(Debug, Clone, Deserialize)]
pub struct NewPatient {
    #[serde(default)]
    pub id: Option<String>,
    pub demographics: Value,
}

/// Body of a direct case creation
#[derive(Debug, Clone, Deserialize)]
pub struct NewCase {
    #[serde(default)]
    pub id: Option<String>,
    pub patient_id: String,
    #[serde(default)]
    pub triage_data: Option<Value>,
    #[serde(default)]
    pub image_urls: Option<Value>,
    #[serde(default)]
    pub risk_level: Option<String>,
}

/// Body of a clinician's diagnosis
#[derive(Debug, Clone, Deserialize)]
pub struct NewDiagnosis {
    pub diagnosis_text: String,
    #[serde(default)]
    pub prescription: Option<Value>,
}

/// Body of a vitals reading
#[derive(Debug, Clone, Deserialize)]
pub struct NewVitals {
    pub temperature: String,
    pub blood_pressure: String,
    pub weight: String,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A patient with its vitals readings and cases
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientDetail {
    pub patient: StoredRecord<Patient>,
    pub vitals: Vec<StoredRecord<Vitals>>,
    pub cases: Vec<StoredRecord<Case>>,
}

/// Activity counters shown to a signed-in caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CallerStats {
    Chw {
        patients: usize,
        cases: usize,
        /// Cases created in the last seven days
        this_week: usize,
    },
    Doctor {
        diagnoses: usize,
        pending_cases: usize,
        /// Diagnoses recorded in the last seven days
        this_week: usize,
    },
}

/// Direct-write service used by the HTTP routes
#[derive(Clone)]
pub struct RecordService {
    db: Database,
    work_available: Arc<Notify>,
}

impl RecordService {
    pub const fn new(db: Database, work_available: Arc<Notify>) -> Self {
        Self { db, work_available }
    }

    /// Register a patient owned by the calling field worker.
    pub async fn create_patient(&self, caller: Caller<'_>, input: NewPatient) -> Result<StoredRecord<Patient>> {
        caller.require(Role::Chw, "registering a patient")?;
        let demographics = storage_text(input.demographics, "demographics")?;
        let patient = Patient {
            id: record_id(input.id)?,
            chw_id: caller.id.to_string(),
            demographics,
            sync_status: SyncStatus::New,
            last_modified_at: now(),
        };

        let mut conn = self.db.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let repo = CollectionRepository::<Patient>::new(&tx);
        if repo.get(&patient.id)?.is_some() {
            return Err(Error::validation(format!("patient {} already exists", patient.id)));
        }
        repo.put(&patient, patient.last_modified_at)?;
        let stored = require(repo.get(&patient.id)?, "patient", &patient.id)?;
        tx.commit()?;

        tracing::info!(patient_id = %patient.id, user = user_fingerprint(caller.id), "Registered patient");
        Ok(stored)
    }

    /// Patients registered by the calling field worker, oldest first.
    pub async fn list_patients(&self, caller: Caller<'_>) -> Result<Vec<StoredRecord<Patient>>> {
        caller.require(Role::Chw, "listing patients")?;
        let conn = self.db.lock().await;
        CollectionRepository::<Patient>::new(&conn).find_by(OWNER_FIELD, caller.id)
    }

    /// A patient with its vitals and cases.
    pub async fn get_patient(&self, caller: Caller<'_>, patient_id: &str) -> Result<PatientDetail> {
        let conn = self.db.lock().await;
        let patient = visible::<Patient>(&conn, caller, patient_id, "patient")?;
        let vitals = CollectionRepository::<Vitals>::new(&conn).find_by("patient_id", patient_id)?;
        let cases = CollectionRepository::<Case>::new(&conn).find_by("patient_id", patient_id)?;
        Ok(PatientDetail {
            patient,
            vitals,
            cases,
        })
    }

    /// Create a case for one of the caller's patients.
    ///
    /// High-risk cases are queued for analysis in the same transaction.
    pub async fn create_case(&self, caller: Caller<'_>, input: NewCase) -> Result<StoredRecord<Case>> {
        caller.require(Role::Chw, "creating a case")?;
        let risk_level = normalize_text_option(input.risk_level)
            .unwrap_or_else(|| DEFAULT_RISK_LEVEL.to_string());
        let high_risk = is_high_risk(&risk_level);
        let triage_data = storage_text(
            input.triage_data.unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            "triage_data",
        )?;
        let image_urls = storage_text(
            input.image_urls.unwrap_or_else(|| Value::Array(Vec::new())),
            "image_urls",
        )?;
        let case = Case {
            id: record_id(input.id)?,
            patient_id: input.patient_id,
            chw_id: caller.id.to_string(),
            triage_data,
            ai_analysis: None,
            status: if high_risk {
                CaseStatus::AwaitingAnalysis
            } else {
                CaseStatus::Triaged
            },
            risk_level,
            image_urls: Some(image_urls),
            sync_status: SyncStatus::New,
            last_modified_at: now(),
        };

        let mut conn = self.db.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        visible::<Patient>(&tx, caller, &case.patient_id, "patient")?;

        let repo = CollectionRepository::<Case>::new(&tx);
        if repo.get(&case.id)?.is_some() {
            return Err(Error::validation(format!("case {} already exists", case.id)));
        }
        repo.put(&case, case.last_modified_at)?;
        let queued = high_risk && QueueRepository::new(&tx).enqueue(&case.id, case.last_modified_at)?;
        let stored = require(repo.get(&case.id)?, "case", &case.id)?;
        tx.commit()?;
        drop(conn);

        tracing::info!(case_id = %case.id, high_risk, user = user_fingerprint(caller.id), "Created case");
        if queued {
            tracing::info!(case_id = %case.id, "Queued case for analysis");
            self.work_available.notify_one();
        }
        Ok(stored)
    }

    /// Cases created by the calling field worker, oldest first.
    pub async fn list_cases(&self, caller: Caller<'_>) -> Result<Vec<StoredRecord<Case>>> {
        caller.require(Role::Chw, "listing cases")?;
        let conn = self.db.lock().await;
        CollectionRepository::<Case>::new(&conn).find_by(OWNER_FIELD, caller.id)
    }

    /// High-risk cases still waiting on a clinician, oldest first.
    pub async fn pending_cases(&self, caller: Caller<'_>) -> Result<Vec<StoredRecord<Case>>> {
        caller.require(Role::Doctor, "reviewing pending cases")?;
        let conn = self.db.lock().await;
        pending(&conn)
    }

    /// A case the caller may read.
    pub async fn get_case(&self, caller: Caller<'_>, case_id: &str) -> Result<StoredRecord<Case>> {
        let conn = self.db.lock().await;
        visible::<Case>(&conn, caller, case_id, "case")
    }

    /// Analysis queue state for a case the caller may read.
    pub async fn case_analysis(&self, caller: Caller<'_>, case_id: &str) -> Result<QueueEntryView> {
        let conn = self.db.lock().await;
        visible::<Case>(&conn, caller, case_id, "case")?;
        QueueRepository::new(&conn)
            .get_by_entity(case_id)?
            .map(QueueEntryView::from)
            .ok_or_else(|| Error::NotFound(format!("no analysis queued for case {case_id}")))
    }

    /// Synced edits of a case that lost to a newer stored version, oldest first.
    pub async fn case_conflicts(&self, caller: Caller<'_>, case_id: &str) -> Result<Vec<SyncConflict>> {
        let conn = self.db.lock().await;
        visible::<Case>(&conn, caller, case_id, "case")?;
        ConflictLog::new(&conn).for_record(Case::COLLECTION, case_id)
    }

    /// Record a clinician's diagnosis and close the case.
    pub async fn record_diagnosis(
        &self,
        caller: Caller<'_>,
        case_id: &str,
        input: NewDiagnosis,
    ) -> Result<StoredRecord<Diagnosis>> {
        caller.require(Role::Doctor, "recording a diagnosis")?;
        let diagnosis_text = normalize_text_option(Some(input.diagnosis_text))
            .ok_or_else(|| Error::validation("diagnosis_text must not be empty"))?;
        let prescription = input
            .prescription
            .filter(|value| !value.is_null())
            .map(|value| storage_text(value, "prescription"))
            .transpose()?;
        let modified_at = now();
        let diagnosis = Diagnosis {
            id: new_record_id(),
            case_id: case_id.to_string(),
            doctor_id: caller.id.to_string(),
            diagnosis_text,
            prescription,
            sync_status: SyncStatus::New,
            last_modified_at: modified_at,
        };

        let mut conn = self.db.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let cases = CollectionRepository::<Case>::new(&tx);
        let mut case = require(cases.get(case_id)?, "case", case_id)?.record;
        case.status = CaseStatus::Diagnosed;
        case.last_modified_at = modified_at;
        cases.put(&case, modified_at)?;

        let diagnoses = CollectionRepository::<Diagnosis>::new(&tx);
        diagnoses.put(&diagnosis, modified_at)?;
        let stored = require(diagnoses.get(&diagnosis.id)?, "diagnosis", &diagnosis.id)?;
        tx.commit()?;

        tracing::info!(
            case_id = %case_id,
            diagnosis_id = %diagnosis.id,
            user = user_fingerprint(caller.id),
            "Recorded diagnosis"
        );
        Ok(stored)
    }

    /// Add a vitals reading for one of the caller's patients.
    pub async fn add_vitals(
        &self,
        caller: Caller<'_>,
        patient_id: &str,
        input: NewVitals,
    ) -> Result<StoredRecord<Vitals>> {
        caller.require(Role::Chw, "recording vitals")?;
        let vitals = Vitals {
            id: new_record_id(),
            patient_id: patient_id.to_string(),
            chw_id: caller.id.to_string(),
            temperature: required_text(input.temperature, "temperature")?,
            blood_pressure: required_text(input.blood_pressure, "blood_pressure")?,
            weight: required_text(input.weight, "weight")?,
            notes: normalize_text_option(input.notes),
            sync_status: SyncStatus::New,
            last_modified_at: now(),
        };

        let mut conn = self.db.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        visible::<Patient>(&tx, caller, patient_id, "patient")?;
        let repo = CollectionRepository::<Vitals>::new(&tx);
        repo.put(&vitals, vitals.last_modified_at)?;
        let stored = require(repo.get(&vitals.id)?, "vitals", &vitals.id)?;
        tx.commit()?;
        Ok(stored)
    }

    /// Vitals readings for a patient the caller may read, oldest first.
    pub async fn list_vitals(&self, caller: Caller<'_>, patient_id: &str) -> Result<Vec<StoredRecord<Vitals>>> {
        let conn = self.db.lock().await;
        visible::<Patient>(&conn, caller, patient_id, "patient")?;
        CollectionRepository::<Vitals>::new(&conn).find_by("patient_id", patient_id)
    }

    /// Counters for the caller's own activity.
    pub async fn caller_stats(&self, caller: Caller<'_>) -> Result<CallerStats> {
        let conn = self.db.lock().await;
        let week_start = now() - WEEK;
        match caller.role {
            Role::Chw => {
                let patients = CollectionRepository::<Patient>::new(&conn).find_by(OWNER_FIELD, caller.id)?;
                let cases = CollectionRepository::<Case>::new(&conn).find_by(OWNER_FIELD, caller.id)?;
                Ok(CallerStats::Chw {
                    patients: patients.len(),
                    cases: cases.len(),
                    this_week: created_since(&cases, week_start),
                })
            }
            Role::Doctor => {
                let diagnoses = CollectionRepository::<Diagnosis>::new(&conn).find_by("doctor_id", caller.id)?;
                Ok(CallerStats::Doctor {
                    diagnoses: diagnoses.len(),
                    pending_cases: pending(&conn)?.len(),
                    this_week: created_since(&diagnoses, week_start),
                })
            }
        }
    }

    /// Queue entry counts per status.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.db.lock().await;
        QueueRepository::new(&conn).stats()
    }
}

/// A record the caller may read; hidden records read as missing.
fn visible<E: SyncEntity>(conn: &Connection, caller: Caller<'_>, id: &str, kind: &str) -> Result<StoredRecord<E>> {
    CollectionRepository::<E>::new(conn)
        .get(id)?
        .filter(|stored| caller.can_read(stored.record.owner_id()))
        .ok_or_else(|| Error::NotFound(format!("{kind} {id}")))
}

fn pending(conn: &Connection) -> Result<Vec<StoredRecord<Case>>> {
    let statuses = OPEN_STATUSES.map(CaseStatus::as_str);
    let mut cases = CollectionRepository::<Case>::new(conn).find_in("status", &statuses)?;
    cases.retain(|stored| is_high_risk(&stored.record.risk_level));
    Ok(cases)
}

fn created_since<E>(records: &[StoredRecord<E>], since: DateTime<Utc>) -> usize {
    records.iter().filter(|stored| stored.created_at >= since).count()
}

fn require<T>(value: Option<T>, kind: &str, id: &str) -> Result<T> {
    value.ok_or_else(|| Error::NotFound(format!("{kind} {id}")))
}

fn record_id(id: Option<String>) -> Result<String> {
    match id {
        None => Ok(new_record_id()),
        Some(id) => normalize_text_option(Some(id)).ok_or_else(|| Error::validation("id must not be empty")),
    }
}

fn required_text(value: String, field: &str) -> Result<String> {
    normalize_text_option(Some(value)).ok_or_else(|| Error::validation(format!("{field} is required")))
}

fn storage_text(value: Value, field: &str) -> Result<String> {
    match to_storage(value)? {
        Value::String(text) => Ok(text),
        _ => Err(Error::validation(format!("{field} is required"))),
    }
}
