//! Wire frames carried on a topic's event stream.
//!
//! Every frame is a JSON object with a `kind` discriminator. Payload bodies
//! are opaque to the core (`serde_json::Value`); only the envelope fields
//! needed for classification, ordering, and routing are modeled.

use serde::{Deserialize, Serialize};

/// Frame payload, discriminated by `kind`.
///
/// The match sites over this enum are exhaustive on purpose: adding a kind
/// is a compile-time-visible change everywhere frames are routed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FramePayload {
    /// Incremental analysis progress.
    Progress {
        stage: String,
        #[serde(default)]
        percent: Option<f64>,
    },
    /// Analysis output, partial or final.
    Result {
        phase: ResultPhase,
        body: serde_json::Value,
    },
    /// Out-of-band alert.
    Alert {
        severity: AlertSeverity,
        body: serde_json::Value,
    },
    /// Keepalive; updates activity tracking only.
    Heartbeat,
    /// Stream-level error. Non-fatal errors are routed to telemetry without
    /// terminating the stream; fatal ones end it.
    Error {
        #[serde(default)]
        fatal: bool,
        message: String,
    },
}

/// Whether a result frame is an intermediate or the final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultPhase {
    Partial,
    Final,
}

/// Alert severity as tagged by the analysis backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// A complete frame: sequence envelope plus payload.
///
/// `seq` is assigned by the server, monotonic per topic. Heartbeats carry no
/// sequence number and are exempt from duplicate suppression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub payload: FramePayload,
}

impl StreamFrame {
    /// Short kind label for logging.
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            FramePayload::Progress { .. } => "progress",
            FramePayload::Result { .. } => "result",
            FramePayload::Alert { .. } => "alert",
            FramePayload::Heartbeat => "heartbeat",
            FramePayload::Error { .. } => "error",
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.payload, FramePayload::Heartbeat)
    }

    /// True for an error frame carrying the explicit fatal flag.
    pub fn is_fatal_error(&self) -> bool {
        matches!(self.payload, FramePayload::Error { fatal: true, .. })
    }
}

/// Per-subscription request parameters, encoded onto the stream URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamParams {
    /// Requested analysis depth.
    pub depth: AnalysisDepth,
    /// Strategic context passed through to the analysis backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            depth: AnalysisDepth::Standard,
            context: None,
        }
    }
}

/// Analysis depth requested for a topic's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisDepth {
    Quick,
    Standard,
    Deep,
}

impl AnalysisDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisDepth::Quick => "quick",
            AnalysisDepth::Standard => "standard",
            AnalysisDepth::Deep => "deep",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip_via_kind_tag() {
        let json = r#"{"seq":12,"kind":"progress","stage":"canvassing","percent":40.0}"#;
        let frame: StreamFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.seq, Some(12));
        assert_eq!(frame.kind(), "progress");
    }

    #[test]
    fn test_heartbeat_without_seq() {
        let frame: StreamFrame = serde_json::from_str(r#"{"kind":"heartbeat"}"#).unwrap();
        assert!(frame.is_heartbeat());
        assert_eq!(frame.seq, None);
    }

    #[test]
    fn test_error_fatal_flag_defaults_to_false() {
        let frame: StreamFrame =
            serde_json::from_str(r#"{"seq":3,"kind":"error","message":"model overloaded"}"#)
                .unwrap();
        assert!(!frame.is_fatal_error());

        let fatal: StreamFrame = serde_json::from_str(
            r#"{"seq":4,"kind":"error","fatal":true,"message":"analysis corpus missing"}"#,
        )
        .unwrap();
        assert!(fatal.is_fatal_error());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let result = serde_json::from_str::<StreamFrame>(r#"{"seq":1,"kind":"telepathy"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_result_phase() {
        let frame: StreamFrame = serde_json::from_str(
            r#"{"seq":9,"kind":"result","phase":"final","body":{"summary":"..."}}"#,
        )
        .unwrap();
        match frame.payload {
            FramePayload::Result { phase, .. } => assert_eq!(phase, ResultPhase::Final),
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
