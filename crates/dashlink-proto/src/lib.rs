//! Protocol model types for the dashlink panel endpoint.
//!
//! Defines the tagged-union message envelope exchanged between a running
//! game process and its connected control panels, together with every
//! payload shape. The transport that carries these messages lives in
//! `dashlink-server`; this crate is pure data so panels and tooling can
//! depend on it without pulling in any socket code.

pub mod message;

pub use message::{
    ActiveSequence, ActiveSequenceData, AvailableSegmentsData, AvailableSequencesData,
    PanelMessage, ResourceJsonData, ResourceRef, SaveSegmentRequest, SegmentSummary,
    SequenceSummary,
};
