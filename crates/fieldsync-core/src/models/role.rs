//! Caller roles

use serde::{Deserialize, Serialize};

/// What an authenticated caller is allowed to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Field worker. Owns the patients, cases and vitals they record.
    #[default]
    Chw,
    /// Clinician. Reads every case and records diagnoses.
    Doctor,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chw => "chw",
            Self::Doctor => "doctor",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
