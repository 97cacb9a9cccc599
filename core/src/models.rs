//! Data models for Wavecall

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::error::{Error, Result};

// ============================================================================
// Call type
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
    Screen,
}

impl CallType {
    /// Value written to the call record. Screen shares are stored as video.
    pub fn stored(self) -> Self {
        match self {
            CallType::Screen => CallType::Video,
            other => other,
        }
    }

    pub fn wants_video(self) -> bool {
        matches!(self, CallType::Video | CallType::Screen)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
            CallType::Screen => "screen",
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Call record
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Answered,
    Ended,
    Rejected,
    Failed,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Ended => "ended",
            CallStatus::Rejected => "rejected",
            CallStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initiated" => Some(CallStatus::Initiated),
            "ringing" => Some(CallStatus::Ringing),
            "answered" => Some(CallStatus::Answered),
            "ended" => Some(CallStatus::Ended),
            "rejected" => Some(CallStatus::Rejected),
            "failed" => Some(CallStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Ended | CallStatus::Rejected | CallStatus::Failed
        )
    }
}

/// One row of the call table. Acts as the audit log of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub caller_id: String,
    pub receiver_id: String,
    pub call_type: CallType,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: i64,
}

impl CallRecord {
    pub fn initiated(
        call_id: &str,
        caller_id: &str,
        receiver_id: &str,
        call_type: CallType,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id: call_id.to_string(),
            caller_id: caller_id.to_string(),
            receiver_id: receiver_id.to_string(),
            call_type: call_type.stored(),
            status: CallStatus::Initiated,
            started_at,
            answered_at: None,
            ended_at: None,
            duration_seconds: 0,
        }
    }

    pub fn apply(&mut self, update: &CallRecordUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(at) = update.answered_at {
            self.answered_at = Some(at);
        }
        if let Some(at) = update.ended_at {
            self.ended_at = Some(at);
        }
        if let Some(d) = update.duration_seconds {
            self.duration_seconds = d;
        }
    }
}

/// Partial update of a call record. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallRecordUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
}

impl CallRecordUpdate {
    pub fn status(status: CallStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn answered(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(CallStatus::Answered),
            answered_at: Some(at),
            ..Default::default()
        }
    }

    pub fn finished(status: CallStatus, ended_at: DateTime<Utc>, duration_seconds: i64) -> Self {
        Self {
            status: Some(status),
            ended_at: Some(ended_at),
            duration_seconds: Some(duration_seconds),
            ..Default::default()
        }
    }
}

/// Builds the shared room id: `call_<callerId>_<calleeId>_<epochMillis>`.
pub fn make_call_id(caller_id: &str, receiver_id: &str, at: DateTime<Utc>) -> String {
    format!("call_{}_{}_{}", caller_id, receiver_id, at.timestamp_millis())
}

/// Whole seconds between answer and end; 0 for calls that never connected.
pub fn call_duration_seconds(answered_at: Option<DateTime<Utc>>, ended_at: DateTime<Utc>) -> i64 {
    match answered_at {
        Some(answered) => {
            let millis = (ended_at - answered).num_milliseconds();
            if millis <= 0 {
                0
            } else {
                millis / 1000
            }
        }
        None => 0,
    }
}

// ============================================================================
// Session descriptions and candidates
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Serialized ICE candidate, in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

// ============================================================================
// Signals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
    CallEnd,
}

impl SignalType {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Offer => "offer",
            SignalType::Answer => "answer",
            SignalType::IceCandidate => "ice_candidate",
            SignalType::CallEnd => "call_end",
        }
    }
}

/// Decoded `signal_data`, one variant per `signal_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    Offer {
        description: SessionDescription,
        call_type: CallType,
    },
    Answer {
        description: SessionDescription,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    Hangup {
        reason: String,
    },
}

#[derive(Serialize, Deserialize)]
struct OfferData {
    sdp: String,
    #[serde(rename = "type")]
    sdp_type: SdpType,
    #[serde(rename = "callType")]
    call_type: CallType,
}

#[derive(Serialize, Deserialize)]
struct CandidateData {
    candidate: IceCandidate,
}

#[derive(Serialize, Deserialize)]
struct HangupData {
    #[serde(default)]
    reason: String,
}

impl SignalPayload {
    pub fn signal_type(&self) -> SignalType {
        match self {
            SignalPayload::Offer { .. } => SignalType::Offer,
            SignalPayload::Answer { .. } => SignalType::Answer,
            SignalPayload::IceCandidate { .. } => SignalType::IceCandidate,
            SignalPayload::Hangup { .. } => SignalType::CallEnd,
        }
    }

    pub fn to_data(&self) -> Value {
        match self {
            SignalPayload::Offer {
                description,
                call_type,
            } => json!({
                "sdp": description.sdp,
                "type": description.sdp_type,
                "callType": call_type,
            }),
            SignalPayload::Answer { description } => json!({
                "sdp": description.sdp,
                "type": description.sdp_type,
            }),
            SignalPayload::IceCandidate { candidate } => json!({ "candidate": candidate }),
            SignalPayload::Hangup { reason } => json!({ "reason": reason }),
        }
    }

    pub fn from_data(signal_type: SignalType, data: Value) -> Result<Self> {
        let payload = match signal_type {
            SignalType::Offer => {
                let offer: OfferData = serde_json::from_value(data)?;
                SignalPayload::Offer {
                    description: SessionDescription {
                        sdp_type: offer.sdp_type,
                        sdp: offer.sdp,
                    },
                    call_type: offer.call_type,
                }
            }
            SignalType::Answer => {
                let answer: SessionDescription = serde_json::from_value(data)?;
                SignalPayload::Answer {
                    description: answer,
                }
            }
            SignalType::IceCandidate => {
                let data: CandidateData = serde_json::from_value(data)?;
                SignalPayload::IceCandidate {
                    candidate: data.candidate,
                }
            }
            SignalType::CallEnd => {
                let data: HangupData = if data.is_null() {
                    HangupData {
                        reason: String::new(),
                    }
                } else {
                    serde_json::from_value(data)?
                };
                SignalPayload::Hangup {
                    reason: data.reason,
                }
            }
        };
        Ok(payload)
    }
}

/// A signal addressed from one call participant to the other.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub call_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub payload: SignalPayload,
}

impl Signal {
    pub fn new(call_id: &str, from_user_id: &str, to_user_id: &str, payload: SignalPayload) -> Self {
        Self {
            call_id: call_id.to_string(),
            from_user_id: from_user_id.to_string(),
            to_user_id: to_user_id.to_string(),
            payload,
        }
    }

    pub fn signal_type(&self) -> SignalType {
        self.payload.signal_type()
    }

    pub fn to_row(&self) -> SignalRow {
        SignalRow {
            call_id: self.call_id.clone(),
            from_user_id: self.from_user_id.clone(),
            to_user_id: self.to_user_id.clone(),
            signal_type: self.signal_type(),
            signal_data: self.payload.to_data(),
        }
    }

    pub fn from_row(row: SignalRow) -> Result<Self> {
        let payload = SignalPayload::from_data(row.signal_type, row.signal_data).map_err(|e| {
            Error::InvalidSignal(format!("{} for call {}: {}", row.signal_type.as_str(), row.call_id, e))
        })?;
        Ok(Self {
            call_id: row.call_id,
            from_user_id: row.from_user_id,
            to_user_id: row.to_user_id,
            payload,
        })
    }

    /// Decodes a raw row as delivered by the realtime feed or a select.
    pub fn from_value(value: Value) -> Result<Self> {
        let row: SignalRow = serde_json::from_value(value)
            .map_err(|e| Error::InvalidSignal(e.to_string()))?;
        Self::from_row(row)
    }
}

/// Signal as stored in the signaling table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRow {
    pub call_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub signal_type: SignalType,
    #[serde(default)]
    pub signal_data: Value,
}

// ============================================================================
// Incoming calls
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCall {
    pub call_id: String,
    pub caller_id: String,
    pub receiver_id: String,
    pub call_type: CallType,
    pub started_at: DateTime<Utc>,
}

impl IncomingCall {
    pub fn from_record(record: &CallRecord) -> Self {
        Self {
            call_id: record.call_id.clone(),
            caller_id: record.caller_id.clone(),
            receiver_id: record.receiver_id.clone(),
            call_type: record.call_type,
            started_at: record.started_at,
        }
    }
}
