/*
Structural markers placed by hand on a recording's timeline.

A marker file is a JSON document of the form
`{"markers": [{"name": "HEAD_IN_START", "position": 12.5}, ...]}` with
positions in seconds.
*/

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Marks the first downbeat of the head; the meter grid is anchored on it.
pub const HEAD_IN_START: &str = "HEAD_IN_START";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub name: String,
    pub position: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkerFile {
    #[serde(default)]
    pub markers: Vec<Marker>,
}

impl MarkerFile {
    /// Reads a marker file. A file that does not exist is reported as a
    /// missing input of `track`.
    pub fn load(path: &Path, track: &str) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::missing(track, format!("marker file {}", path.display())))
            }
            Err(e) => return Err(Error::io(path, e)),
        };

        let mut file: MarkerFile = serde_json::from_str(&text).map_err(|source| Error::Marker {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(bad) = file.markers.iter().find(|m| !m.position.is_finite()) {
            return Err(Error::format(
                path,
                format!("marker {} has a non-finite position", bad.name),
            ));
        }

        // Stable sort keeps file order among markers sharing a position.
        file.markers
            .sort_by(|a, b| a.position.total_cmp(&b.position));
        Ok(file)
    }

    /// Position of the earliest marker called exactly `name`.
    pub fn position(&self, name: &str) -> Option<f64> {
        self.markers
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.position)
    }

    /// Finds a marker by a user-supplied query.
    ///
    /// A case-insensitive exact match wins. Otherwise the earliest marker whose
    /// name starts with the query followed by a non-alphanumeric character (or
    /// nothing) is returned, so `LICK01` finds `LICK01-START`.
    pub fn find(&self, query: &str) -> Option<&Marker> {
        let exact = self
            .markers
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(query));

        exact.or_else(|| {
            self.markers.iter().find(|m| {
                let name = m.name.as_bytes();
                name.len() >= query.len()
                    && name[..query.len()].eq_ignore_ascii_case(query.as_bytes())
                    && name
                        .get(query.len())
                        .map_or(true, |c| !c.is_ascii_alphanumeric())
            })
        })
    }

    /// Resolves a `[start, end)` region in seconds from optional marker
    /// queries. An unset bound leaves that side of the recording open.
    pub fn region(
        &self,
        track: &str,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<(Option<f64>, Option<f64>)> {
        let lookup = |query: Option<&str>| -> Result<Option<f64>> {
            query
                .map(|q| {
                    self.find(q)
                        .map(|m| m.position)
                        .ok_or_else(|| Error::missing(track, format!("marker {}", q)))
                })
                .transpose()
        };

        let (start_sec, end_sec) = (lookup(start)?, lookup(end)?);
        if let (Some(s), Some(e)) = (start_sec, end_sec) {
            if s >= e {
                return Err(Error::InvalidParameter(format!(
                    "region of {} is empty: start {}s is not before end {}s",
                    track, s, e
                )));
            }
        }
        Ok((start_sec, end_sec))
    }
}
