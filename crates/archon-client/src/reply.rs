//! Parses the text payloads of `FRAME` and `STATUS` replies.
//!
//! The Archon wire grammar in `spec.md` §6 only specifies framing
//! (`>II.../\n`, `<II.../\n`, `?II\n`); the payload text of `FRAME`/`STATUS`
//! is a flat space-separated `KEY=VALUE` list, following the same
//! convention the controller uses for its `CONFIG` lines. Three numbered
//! buffers (`BUF1`..`BUF3`) are supported, matching `spec.md` §3's "typically
//! N=3".

use archon_core::data::BufferDescriptor;
use archon_core::error::{ArchonError, ArchonResult};
use std::collections::HashMap;

/// The controller's reported power rail state, from a `STATUS` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Power good; normal operation.
    Good,
    /// Power rail reported an error.
    Bad,
    /// Power deliberately off.
    Off,
}

/// Splits a `KEY=VALUE` payload line into a lookup map.
fn tokenize(payload: &str) -> HashMap<&str, &str> {
    payload
        .split_whitespace()
        .filter_map(|tok| tok.split_once('='))
        .collect()
}

/// Parses a `FRAME` reply payload into up to three buffer descriptors.
/// Buffers with no `BUFnCOMPLETE` key are omitted.
///
/// # Errors
///
/// Returns [`ArchonError::Protocol`] if a present buffer's numeric fields do
/// not parse.
pub fn parse_frame_reply(payload: &str, controller: &str) -> ArchonResult<Vec<BufferDescriptor>> {
    let tokens = tokenize(payload);
    let mut buffers = Vec::new();
    for index in 1..=3u8 {
        let prefix = format!("BUF{index}");
        let Some(complete) = tokens.get(format!("{prefix}COMPLETE").as_str()) else {
            continue;
        };
        let field = |name: &str| -> ArchonResult<u64> {
            tokens
                .get(format!("{prefix}{name}").as_str())
                .ok_or_else(|| ArchonError::Protocol {
                    controller: controller.to_string(),
                    message: format!("FRAME reply missing {prefix}{name}"),
                })?
                .parse()
                .map_err(|_| ArchonError::Protocol {
                    controller: controller.to_string(),
                    message: format!("FRAME reply field {prefix}{name} is not numeric"),
                })
        };
        buffers.push(BufferDescriptor {
            index,
            complete: *complete == "1",
            frame_number: field("FRAME")?,
            width: field("WIDTH")? as u32,
            height: field("HEIGHT")? as u32,
            bit_width: field("BITS")? as u8,
            timestamp_raw: field("TIMESTAMP").unwrap_or(0),
        });
    }
    Ok(buffers)
}

/// Parses a `STATUS` reply payload's `POWER` field.
///
/// # Errors
///
/// Returns [`ArchonError::Protocol`] if the `POWER` key is absent or
/// unrecognized.
pub fn parse_power_state(payload: &str, controller: &str) -> ArchonResult<PowerState> {
    let tokens = tokenize(payload);
    match tokens.get("POWER").copied() {
        Some("GOOD") => Ok(PowerState::Good),
        Some("BAD") => Ok(PowerState::Bad),
        Some("OFF") => Ok(PowerState::Off),
        other => Err(ArchonError::Protocol {
            controller: controller.to_string(),
            message: format!("STATUS reply has unrecognized POWER field: {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_complete_buffers() {
        let payload = "TIMER=42 \
            BUF1COMPLETE=1 BUF1FRAME=10 BUF1WIDTH=100 BUF1HEIGHT=100 BUF1BITS=16 BUF1TIMESTAMP=1 \
            BUF2COMPLETE=1 BUF2FRAME=12 BUF2WIDTH=100 BUF2HEIGHT=100 BUF2BITS=16 BUF2TIMESTAMP=2 \
            BUF3COMPLETE=1 BUF3FRAME=11 BUF3WIDTH=100 BUF3HEIGHT=100 BUF3BITS=16 BUF3TIMESTAMP=3";
        let buffers = parse_frame_reply(payload, "ccd1").unwrap();
        assert_eq!(buffers.len(), 3);
        let best = archon_core::data::select_fetch_buffer(&buffers).unwrap();
        assert_eq!(best.index, 2);
    }

    #[test]
    fn skips_buffers_without_complete_field() {
        let payload = "BUF1COMPLETE=1 BUF1FRAME=1 BUF1WIDTH=1 BUF1HEIGHT=1 BUF1BITS=16";
        let buffers = parse_frame_reply(payload, "ccd1").unwrap();
        assert_eq!(buffers.len(), 1);
    }

    #[test]
    fn parses_power_states() {
        assert_eq!(
            parse_power_state("POWER=GOOD", "ccd1").unwrap(),
            PowerState::Good
        );
        assert_eq!(
            parse_power_state("POWER=BAD", "ccd1").unwrap(),
            PowerState::Bad
        );
    }

    #[test]
    fn missing_power_is_protocol_error() {
        assert!(parse_power_state("FOO=1", "ccd1").is_err());
    }
}
