//! Application services shared by the HTTP boundary

mod records;

pub use records::{
    Caller, CallerStats, NewCase, NewDiagnosis, NewPatient, NewVitals, PatientDetail, RecordService,
};
