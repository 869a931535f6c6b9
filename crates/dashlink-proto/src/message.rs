//! The typed message envelope and its payload shapes.
//!
//! Every message in either direction is a [`PanelMessage`]: a discriminated
//! union keyed by a `type` field, where each discriminator maps 1:1 to a
//! payload shape (or to no payload at all). On the wire this is
//! `{"type": "<Name>", "payload": {...}}`, with `payload` absent for
//! messages that carry no data.
//!
//! Decoding is strict per message: an unrecognized `type` or a malformed
//! payload fails that one message only. The connection it arrived on is
//! unaffected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One message between the game process and a panel.
///
/// Serde's adjacent tagging reads the `type` discriminator first, then
/// dispatches to the matching payload decoder, so the enum itself is the
/// fixed dispatch table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum PanelMessage {
    // =====================
    // panel -> game
    // =====================
    Ping,

    /// Start playing the sequence at the given resource path.
    PlaySequence(ResourceRef),
    /// Start playing the segment at the given resource path.
    PlaySegment(ResourceRef),

    /// Stop any currently-running sequence or segment replay.
    StopReplay,

    /// Ask for the raw JSON of a sequence resource.
    RequestSequenceJson(ResourceRef),
    /// Ask for the raw JSON of a segment resource.
    RequestSegmentJson(ResourceRef),

    /// Persist a segment list, optionally over an existing resource.
    SaveSegment(SaveSegmentRequest),
    /// Delete the segment resource at the given path.
    DeleteSegment(ResourceRef),

    // =====================
    // game -> panel
    // =====================
    Pong,

    /// The file-based sequences available in this game instance.
    AvailableSequences(AvailableSequencesData),
    /// The file-based segments available in this game instance.
    AvailableSegments(AvailableSegmentsData),

    /// The currently-running sequence, or null when idle.
    ActiveSequence(ActiveSequenceData),

    /// Raw sequence JSON, answering `RequestSequenceJson`.
    SendSequenceJson(ResourceJsonData),
    /// Raw segment JSON, answering `RequestSegmentJson`.
    SendSegmentJson(ResourceJsonData),

    /// Sent to every panel just before a server-initiated shutdown so open
    /// panel windows can close themselves.
    CloseConnection,
}

impl PanelMessage {
    /// Encode to the wire JSON form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode one message from its wire JSON form.
    pub fn from_json(text: &str) -> Result<PanelMessage, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Payload naming a single file-based resource.
///
/// Shared by the play, request-json, and delete messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub resource_path: String,
}

/// Payload of `SaveSegment`.
///
/// The segment list itself is opaque to the endpoint and carried as raw
/// JSON; `resourcePath` is omitted when the panel is saving a new resource
/// rather than overwriting one.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SaveSegmentRequest {
    pub segment_list: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_path: Option<String>,
}

/// One entry of `AvailableSequences`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SequenceSummary {
    pub name: String,
    pub description: String,
    pub resource_path: String,
}

/// Payload of `AvailableSequences`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AvailableSequencesData {
    pub available_sequences: Vec<SequenceSummary>,
}

/// One entry of `AvailableSegments`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentSummary {
    pub api_version: i32,
    pub resource_path: String,
    /// Segment kind, written as `type` on the wire.
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
}

/// Payload of `AvailableSegments`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AvailableSegmentsData {
    pub available_segments: Vec<SegmentSummary>,
}

/// The sequence currently being replayed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSequence {
    pub name: String,
    pub description: String,
    pub resource_path: String,
}

/// Payload of `ActiveSequence`. `activeSequence` is written as an explicit
/// `null` when no replay is running, so panels can clear their display.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSequenceData {
    pub active_sequence: Option<ActiveSequence>,
}

/// Payload of the two `Send*Json` replies: the raw JSON of a resource plus
/// the path it was loaded from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceJsonData {
    pub resource_path: String,
    pub json_data: Value,
}
