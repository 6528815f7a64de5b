//! Request/response DTOs and JSON mapping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dunning_core::Entity;
use dunning_sequence::{AttemptOutcome, DunningSequence};

#[derive(Debug, Deserialize)]
pub struct OpenSequenceRequest {
    pub organization_id: String,
    pub invoice_id: String,
    pub subscription_id: String,
    /// Minor units (e.g. halalas).
    pub amount: u64,
    pub currency: String,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EscalateRequest {
    pub csm_id: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AssignCsmRequest {
    pub csm_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PauseRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecoverRequest {
    pub method: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NoteRequest {
    pub author: Option<String>,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct AttemptDto {
    pub attempt_number: u32,
    pub attempted_at: DateTime<Utc>,
    pub outcome: &'static str,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NoteDto {
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct SequenceResponse {
    pub id: String,
    pub organization_id: String,
    pub invoice_id: String,
    pub subscription_id: String,
    pub status: String,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub amount: u64,
    pub currency: String,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub recovered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub assigned_csm_id: Option<String>,
    pub pause_reason: Option<String>,
    pub cancel_reason: Option<String>,
    pub recovery_method: Option<String>,
    pub attempts: Vec<AttemptDto>,
    pub notes: Vec<NoteDto>,
    pub version: u64,
}

impl From<&DunningSequence> for SequenceResponse {
    fn from(seq: &DunningSequence) -> Self {
        Self {
            id: seq.id_typed().to_string(),
            organization_id: seq.organization_id().to_string(),
            invoice_id: seq.invoice_id().to_string(),
            subscription_id: seq.subscription_id().to_string(),
            status: seq.status().as_str().to_string(),
            attempts_made: seq.attempts_made(),
            max_attempts: seq.max_attempts(),
            amount: seq.amount_at_risk().amount(),
            currency: seq.amount_at_risk().currency().as_str().to_string(),
            failure_reason: seq.failure_reason().map(str::to_string),
            created_at: seq.created_at(),
            next_retry_at: seq.next_retry_at(),
            escalated_at: seq.escalated_at(),
            recovered_at: seq.recovered_at(),
            cancelled_at: seq.cancelled_at(),
            assigned_csm_id: seq.assigned_csm_id().map(|id| id.to_string()),
            pause_reason: seq.pause_reason().map(str::to_string),
            cancel_reason: seq.cancel_reason().map(str::to_string),
            recovery_method: seq.recovery_method().map(str::to_string),
            attempts: seq
                .attempts()
                .iter()
                .map(|a| AttemptDto {
                    attempt_number: a.attempt_number,
                    attempted_at: a.attempted_at,
                    outcome: match a.outcome {
                        AttemptOutcome::Success => "success",
                        AttemptOutcome::Failure => "failure",
                        AttemptOutcome::SkippedPaused => "skipped_paused",
                    },
                    failure_reason: a.failure_reason.clone(),
                })
                .collect(),
            notes: seq
                .notes()
                .iter()
                .map(|n| NoteDto {
                    author: n.author.clone(),
                    timestamp: n.timestamp,
                    text: n.text.clone(),
                })
                .collect(),
            version: seq.version(),
        }
    }
}

pub fn sequence_list(sequences: &[DunningSequence]) -> Vec<SequenceResponse> {
    sequences.iter().map(SequenceResponse::from).collect()
}
