//! The sectioned ACF text model: an ordered map of sections, with a
//! secondary name→slot index over the dense `[CONFIG]` parameter table.
//!
//! `spec.md` §4.3/§9: "the parameter table has a dense numeric index; named
//! parameters are addressed through their numeric slot; editing a named
//! entry must locate its slot first. Keep the name→slot map alongside the
//! parsed ACF so edits are O(1)."

use std::collections::HashMap;
use thiserror::Error;

/// The `[CONFIG]` section name, case-normalized.
pub const CONFIG_SECTION: &str = "CONFIG";
/// The `[SYSTEM]` section name, case-normalized.
pub const SYSTEM_SECTION: &str = "SYSTEM";

/// Errors from parsing ACF text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A `PARAMETERn=NAME=VALUE` line did not have the expected two `=`
    /// separators.
    #[error("malformed PARAMETER line in CONFIG section: {0:?}")]
    MalformedParameterLine(String),
}

/// One named section: an ordered list of raw lines exactly as they appeared
/// in the source text (minus trailing CR and trailing whitespace).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Section {
    /// The lines of this section, in file order. For `[CONFIG]` this is the
    /// dense parameter table: line index == `WCONFIGnnnn`/`RCONFIGnnnn` slot.
    pub lines: Vec<String>,
}

/// A parsed ACF document: ordered sections plus a name→slot index over
/// `[CONFIG]`'s `PARAMETERn=NAME=VALUE` lines.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AcfDocument {
    /// Sections in file order, including any preamble before the first
    /// `[...]` header (stored under the empty-string key).
    pub sections: Vec<(String, Section)>,
    /// Named parameter → CONFIG slot index, built while parsing.
    pub param_slots: HashMap<String, usize>,
}

impl AcfDocument {
    /// Parses ACF text into a document, case-insensitively matching section
    /// headers and building the named-parameter slot index over `[CONFIG]`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::MalformedParameterLine`] if a `PARAMETERn=...`
    /// line in `[CONFIG]` does not have the `NAME=VALUE` shape after the
    /// first `=`.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut sections: Vec<(String, Section)> = vec![(String::new(), Section::default())];
        for raw_line in text.lines() {
            let line = raw_line.trim_end_matches('\r');
            if let Some(name) = section_header(line) {
                sections.push((name, Section::default()));
            } else if let Some((_, section)) = sections.last_mut() {
                section.lines.push(line.to_string());
            }
        }

        let mut param_slots = HashMap::new();
        if let Some((_, config)) = sections
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(CONFIG_SECTION))
        {
            for (slot, line) in config.lines.iter().enumerate() {
                if let Some(rest) = line_after_parameter_tag(line) {
                    let (name, _value) = rest
                        .split_once('=')
                        .ok_or_else(|| ParseError::MalformedParameterLine(line.clone()))?;
                    param_slots.insert(name.to_string(), slot);
                }
            }
        }

        Ok(Self {
            sections,
            param_slots,
        })
    }

    /// Re-serializes the document to ACF text. Trailing whitespace on each
    /// line is trimmed (the "comment whitespace" normalization `spec.md` §8
    /// allows), but line order, section order, and content are preserved
    /// exactly.
    #[must_use]
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (name, section) in &self.sections {
            if !name.is_empty() {
                out.push('[');
                out.push_str(name);
                out.push_str("]\n");
            }
            for line in &section.lines {
                out.push_str(line.trim_end());
                out.push('\n');
            }
        }
        out
    }

    /// Returns the `[CONFIG]` section, if present.
    #[must_use]
    pub fn config(&self) -> Option<&Section> {
        self.section(CONFIG_SECTION)
    }

    /// Returns a named section case-insensitively.
    #[must_use]
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, s)| s)
    }

    /// Looks up a named parameter's current value by locating its slot in
    /// `[CONFIG]` and parsing the `PARAMETERn=NAME=VALUE` line.
    #[must_use]
    pub fn named_value(&self, name: &str) -> Option<&str> {
        let slot = *self.param_slots.get(name)?;
        let config = self.config()?;
        let line = config.lines.get(slot)?;
        let rest = line_after_parameter_tag(line)?;
        let (_, value) = rest.split_once('=')?;
        Some(value)
    }

    /// Rewrites the named parameter's CONFIG-slot line in place, preserving
    /// the `PARAMETERn=` prefix, and returns the updated slot index and
    /// full line text for the caller to push over the wire.
    ///
    /// Returns `None` if `name` has no known slot.
    pub fn set_named(&mut self, name: &str, value: &str) -> Option<(usize, String)> {
        let slot = *self.param_slots.get(name)?;
        let config_idx = self
            .sections
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(CONFIG_SECTION))?;
        let line = self.sections[config_idx].1.lines.get_mut(slot)?;
        let tag_end = line.find('=')? + 1; // keep "PARAMETERn="
        let new_line = format!("{}{}={}", &line[..tag_end], name, value);
        *line = new_line.clone();
        Some((slot, new_line))
    }
}

/// Returns `Some(name)` if `line` is a `[NAME]` section header.
fn section_header(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.starts_with('[') && trimmed.ends_with(']') && trimmed.len() >= 2 {
        Some(trimmed[1..trimmed.len() - 1].to_ascii_uppercase())
    } else {
        None
    }
}

/// If `line` looks like `PARAMETERn=...`, returns the text after the tag's
/// `=` (i.e. the `NAME=VALUE` portion).
fn line_after_parameter_tag(line: &str) -> Option<&str> {
    let (tag, rest) = line.split_once('=')?;
    let digits = tag.strip_prefix("PARAMETER")?;
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        Some(rest)
    } else {
        None
    }
}
