use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Sequencing run accession (SRR/ERR/DRR prefix followed by digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunAccession(String);

impl RunAccession {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunAccession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunAccession {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        if !normalized.is_ascii() || normalized.len() < 4 {
            return Err(PipelineError::InvalidRunAccession(value.to_string()));
        }
        let (prefix, digits) = normalized.split_at(3);
        let is_valid = matches!(prefix, "SRR" | "ERR" | "DRR")
            && digits.chars().all(|ch| ch.is_ascii_digit());
        if !is_valid {
            return Err(PipelineError::InvalidRunAccession(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum SampleStatus {
    Pending,
    Downloading,
    Converting,
    QcRunning,
    Cleaning,
    Cleaned,
    Failed(String),
}

impl SampleStatus {
    /// Terminal statuses admit no further automatic transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SampleStatus::Cleaned | SampleStatus::Failed(_))
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            SampleStatus::Downloading
                | SampleStatus::Converting
                | SampleStatus::QcRunning
                | SampleStatus::Cleaning
        )
    }
}

impl fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleStatus::Pending => write!(f, "pending"),
            SampleStatus::Downloading => write!(f, "downloading"),
            SampleStatus::Converting => write!(f, "converting"),
            SampleStatus::QcRunning => write!(f, "qc_running"),
            SampleStatus::Cleaning => write!(f, "cleaning"),
            SampleStatus::Cleaned => write!(f, "cleaned"),
            SampleStatus::Failed(reason) => write!(f, "failed:{reason}"),
        }
    }
}

/// One sequencing sample queued for download and QC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub id: RunAccession,
    pub disease: String,
    pub estimated_footprint_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Planned,
    Running,
    Settled,
}

/// Fixed-size ordered group of samples processed together under the
/// concurrency and quota bounds. Batches execute strictly in index order.
#[derive(Debug, Clone)]
pub struct Batch {
    pub index: u64,
    pub members: Vec<Sample>,
    pub state: BatchState,
}

impl Batch {
    pub fn new(index: u64, members: Vec<Sample>) -> Self {
        Self {
            index,
            members,
            state: BatchState::Planned,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_run_accession_valid() {
        let id: RunAccession = "srr014966".parse().unwrap();
        assert_eq!(id.as_str(), "SRR014966");

        let err_id: RunAccession = "ERR123456".parse().unwrap();
        assert_eq!(err_id.as_str(), "ERR123456");
    }

    #[test]
    fn parse_run_accession_invalid() {
        let err = "GSM12345".parse::<RunAccession>().unwrap_err();
        assert_matches!(err, PipelineError::InvalidRunAccession(_));

        let err = "SRR".parse::<RunAccession>().unwrap_err();
        assert_matches!(err, PipelineError::InvalidRunAccession(_));

        let err = "SRRabc".parse::<RunAccession>().unwrap_err();
        assert_matches!(err, PipelineError::InvalidRunAccession(_));
    }

    #[test]
    fn status_terminality() {
        assert!(SampleStatus::Cleaned.is_terminal());
        assert!(SampleStatus::Failed("network".to_string()).is_terminal());
        assert!(!SampleStatus::Pending.is_terminal());
        assert!(!SampleStatus::Downloading.is_terminal());
        assert!(SampleStatus::QcRunning.is_in_flight());
    }

    #[test]
    fn status_round_trips_through_json() {
        let status = SampleStatus::Failed("tool_exit:2".to_string());
        let json = serde_json::to_string(&status).unwrap();
        let back: SampleStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
