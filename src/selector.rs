//! Substream selection: maps input substreams to dense output indices.

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    stream::{MediaType, StreamParameters},
};

/// `mapping[input] = Some(output)` for kept substreams.
pub type Mapping = Vec<Option<usize>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectType {
    Video,
    Audio,
    All,
}

impl SelectType {
    fn matches(&self, media_type: MediaType) -> bool {
        match self {
            SelectType::All => true,
            SelectType::Video => media_type == MediaType::Video,
            SelectType::Audio => media_type == MediaType::Audio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Keyword {
    All,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectTarget {
    Index(usize),
    Keyword(Keyword),
}

/// One selection rule as written by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectionSpec {
    /// Nth substream of any type.
    Ordinal(usize),
    /// `v`, `a`, `v1`, `a0`, `2`, ...
    Text(String),
    Full {
        #[serde(rename = "type")]
        kind: SelectType,
        selection: SelectTarget,
    },
}

impl SelectionSpec {
    pub fn canonical(&self) -> Result<(SelectType, SelectTarget)> {
        match self {
            SelectionSpec::Ordinal(n) => Ok((SelectType::All, SelectTarget::Index(*n))),
            SelectionSpec::Full { kind, selection } => Ok((*kind, *selection)),
            SelectionSpec::Text(text) => {
                let (kind, rest) = match text.as_bytes().first() {
                    Some(b'v') => (SelectType::Video, &text[1..]),
                    Some(b'a') => (SelectType::Audio, &text[1..]),
                    _ => (SelectType::All, text.as_str()),
                };
                let index = if rest.is_empty() {
                    0
                } else {
                    rest.parse::<usize>()
                        .map_err(|_| Error::InvalidSelection(text.clone()))?
                };
                Ok((kind, SelectTarget::Index(index)))
            }
        }
    }
}

impl From<usize> for SelectionSpec {
    fn from(n: usize) -> Self {
        SelectionSpec::Ordinal(n)
    }
}

impl From<&str> for SelectionSpec {
    fn from(text: &str) -> Self {
        SelectionSpec::Text(text.to_string())
    }
}

/// A single rule or a list of rules, applied left to right.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Selection {
    One(SelectionSpec),
    Many(Vec<SelectionSpec>),
}

impl Selection {
    pub fn specs(&self) -> &[SelectionSpec] {
        match self {
            Selection::One(spec) => std::slice::from_ref(spec),
            Selection::Many(specs) => specs,
        }
    }

    /// Checks every rule without needing any stream parameters.
    pub fn validate(&self) -> Result<()> {
        for spec in self.specs() {
            spec.canonical()?;
        }
        Ok(())
    }
}

impl<T: Into<SelectionSpec>> From<Vec<T>> for Selection {
    fn from(specs: Vec<T>) -> Self {
        Selection::Many(specs.into_iter().map(Into::into).collect())
    }
}

impl From<&str> for Selection {
    fn from(text: &str) -> Self {
        Selection::One(text.into())
    }
}

impl From<usize> for Selection {
    fn from(n: usize) -> Self {
        Selection::One(n.into())
    }
}

/// Computes the mapping of `streams` under `selection`.
///
/// A substream claimed by an earlier rule is never remapped by a later one,
/// and output indices are handed out in claim order.
pub fn resolve(streams: &[StreamParameters], selection: &Selection) -> Result<Mapping> {
    let mut mapping: Mapping = vec![None; streams.len()];
    let mut next = 0;

    for spec in selection.specs() {
        let (kind, target) = spec.canonical()?;
        match target {
            SelectTarget::Keyword(Keyword::None) => {}
            SelectTarget::Keyword(Keyword::All) => {
                for (i, stream) in streams.iter().enumerate() {
                    if mapping[i].is_none() && kind.matches(stream.media_type) {
                        mapping[i] = Some(next);
                        next += 1;
                    }
                }
            }
            SelectTarget::Index(wanted) => {
                let found = streams
                    .iter()
                    .enumerate()
                    .filter(|(_, stream)| kind.matches(stream.media_type))
                    .nth(wanted);
                if let Some((i, _)) = found {
                    if mapping[i].is_none() {
                        mapping[i] = Some(next);
                        next += 1;
                    }
                }
            }
        }
    }

    Ok(mapping)
}

/// Output parameters of a mapping, ordered by output index.
pub fn mapped_streams(streams: &[StreamParameters], mapping: &Mapping) -> Vec<StreamParameters> {
    let mut out: Vec<(usize, StreamParameters)> = mapping
        .iter()
        .enumerate()
        .filter_map(|(i, m)| m.map(|o| (o, streams[i].clone())))
        .collect();
    out.sort_by_key(|(o, _)| *o);
    out.into_iter().map(|(_, s)| s).collect()
}

#[cfg(test)]
#[path = "selector_test.rs"]
mod selector_test;
