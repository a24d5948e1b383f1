//! Conversions between the `archon_core` domain types and the generated
//! proto types, following the `ToDomain<T>` + `From` split the teacher's
//! `daq_proto::convert` module uses for its own instrument RPC surface.

use crate::archon as proto;
use archon_core::data::{FetchedFrame, FrameData};
use archon_core::status::{status_names, StatusFlags};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Converts a proto type into its domain counterpart.
pub trait ToDomain<T> {
    /// Performs the conversion.
    fn to_domain(self) -> T;
}

/// Packs frame samples into big-endian bytes for the wire, the same byte
/// order `archon-exposure::frame::decode_frame` expects back on decode.
fn pack_samples(data: &FrameData) -> Vec<u8> {
    match data {
        FrameData::U16(samples) => samples.iter().flat_map(|s| s.to_be_bytes()).collect(),
        FrameData::U32(samples) => samples.iter().flat_map(|s| s.to_be_bytes()).collect(),
    }
}

/// The bit width a [`FetchReply`](proto::FetchReply) declares for its
/// packed sample data, matching the controller's native buffer bit depth.
fn bit_width_of(data: &FrameData) -> u32 {
    match data {
        FrameData::U16(_) => 16,
        FrameData::U32(_) => 32,
    }
}

/// Builds a `FetchReply` from a fetched frame and its computed header.
#[must_use]
pub fn fetched_frame_to_reply(
    controller: &str,
    frame: &FetchedFrame,
    header: &BTreeMap<String, String>,
) -> proto::FetchReply {
    proto::FetchReply {
        controller: controller.to_string(),
        width: frame.width,
        height: frame.height,
        bit_width: bit_width_of(&frame.data),
        data: pack_samples(&frame.data),
        header: header.clone().into_iter().collect(),
    }
}

/// Builds an `Event` from a reply-sink key/payload pair (`spec.md` §6).
#[must_use]
pub fn event_from_publish(
    key: &str,
    controller: &str,
    payload: &serde_json::Value,
    at: DateTime<Utc>,
) -> proto::Event {
    proto::Event {
        key: key.to_string(),
        controller: controller.to_string(),
        payload_json: payload.to_string(),
        timestamp_unix_ms: at.timestamp_millis(),
    }
}

/// Renders a controller's status bitmask as its set of named flags, for
/// inclusion in a `status` event payload.
#[must_use]
pub fn status_event_payload(flags: StatusFlags) -> serde_json::Value {
    let names: Vec<&str> = status_names(flags);
    serde_json::json!({ "flags": names, "bits": flags })
}
