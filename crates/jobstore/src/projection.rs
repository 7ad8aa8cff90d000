//! Read projections
//!
//! `Fields` is the caller-facing selection (path -> include?), `Projection`
//! the validated form applied to stored records.

use std::collections::BTreeMap;

use crate::error::DbError;
use crate::record::{get_path, remove_path, set_path, Record, INTERNAL_ID, PUBLIC_ID};

/// Field selection: `true` includes a path, `false` excludes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields(BTreeMap<String, bool>);

impl Fields {
    pub fn include<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Fields(paths.into_iter().map(|p| (p.into(), true)).collect())
    }

    pub fn exclude<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Fields(paths.into_iter().map(|p| (p.into(), false)).collect())
    }

    pub fn with(mut self, path: impl Into<String>, included: bool) -> Self {
        self.0.insert(path.into(), included);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    All,
    Include(Vec<String>),
    Exclude(Vec<String>),
}

/// A validated projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    mode: Mode,
    keep_id: bool,
}

impl Default for Projection {
    fn default() -> Self {
        Self::all()
    }
}

impl Projection {
    /// Whole documents, id included.
    pub fn all() -> Self {
        Projection {
            mode: Mode::All,
            keep_id: true,
        }
    }

    /// Build from a caller selection.
    ///
    /// Mixing included and excluded paths fails, except for the id field,
    /// which may be excluded from an inclusion projection.
    pub fn new(fields: Option<&Fields>, exclude_id: bool) -> Result<Self, DbError> {
        let mut keep_id = !exclude_id;
        let mut id_included = false;
        let mut include = Vec::new();
        let mut exclude = Vec::new();

        for (path, included) in fields.map(|f| f.0.iter()).into_iter().flatten() {
            if path == INTERNAL_ID || path == PUBLIC_ID {
                keep_id = keep_id && *included;
                id_included |= *included;
                continue;
            }
            if *included {
                include.push(path.clone());
            } else {
                exclude.push(path.clone());
            }
        }

        let mode = match (include.is_empty(), exclude.is_empty()) {
            (true, true) if id_included => Mode::Include(include),
            (true, true) => Mode::All,
            (false, true) => Mode::Include(include),
            (true, false) => Mode::Exclude(exclude),
            (false, false) => {
                return Err(DbError::InvalidParams(format!(
                    "projection cannot mix inclusion ({}) and exclusion ({})",
                    include.join(", "),
                    exclude.join(", ")
                )))
            }
        };

        Ok(Projection { mode, keep_id })
    }

    pub fn keeps_id(&self) -> bool {
        self.keep_id
    }

    /// Apply to a stored record.
    pub fn apply(&self, record: Record) -> Record {
        let mut out = match &self.mode {
            Mode::All => record,
            Mode::Exclude(paths) => {
                let mut record = record;
                for path in paths {
                    remove_path(&mut record, path);
                }
                record
            }
            Mode::Include(paths) => {
                let mut out = Record::new();
                if let Some(id) = record.get(INTERNAL_ID) {
                    out.insert(INTERNAL_ID.to_string(), id.clone());
                }
                for path in paths {
                    if let Some(value) = get_path(&record, path) {
                        set_path(&mut out, path, value.clone());
                    }
                }
                out
            }
        };
        if !self.keep_id {
            out.shift_remove(INTERNAL_ID);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn sample() -> Record {
        json!({
            "_id": "5f1b2c3d4e5f6a7b8c9d0e1f",
            "jobId": "job-1",
            "status": {"status": "active", "progress": 20},
            "graph": {"nodes": []}
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn inclusion_keeps_listed_paths_and_id() {
        let p = Projection::new(Some(&Fields::include(["status.status", "jobId"])), false).unwrap();
        assert_eq!(
            Value::Object(p.apply(sample())),
            json!({"_id": "5f1b2c3d4e5f6a7b8c9d0e1f", "status": {"status": "active"}, "jobId": "job-1"})
        );
    }

    #[test]
    fn exclusion_drops_listed_paths() {
        let p = Projection::new(Some(&Fields::exclude(["graph"])), true).unwrap();
        assert_eq!(
            Value::Object(p.apply(sample())),
            json!({"jobId": "job-1", "status": {"status": "active", "progress": 20}})
        );
    }

    #[test]
    fn mixing_modes_fails_fast() {
        let fields = Fields::include(["status"]).with("graph", false);
        let err = Projection::new(Some(&fields), false).unwrap_err();
        assert!(matches!(err, DbError::InvalidParams(_)));
    }

    #[test]
    fn id_may_be_excluded_from_inclusion() {
        let fields = Fields::include(["jobId"]).with("_id", false);
        let p = Projection::new(Some(&fields), false).unwrap();
        assert!(!p.keeps_id());
        assert_eq!(Value::Object(p.apply(sample())), json!({"jobId": "job-1"}));
    }

    #[test]
    fn id_alone_keeps_only_the_id() {
        let p = Projection::new(Some(&Fields::include(["id"])), false).unwrap();
        assert_eq!(
            Value::Object(p.apply(sample())),
            json!({"_id": "5f1b2c3d4e5f6a7b8c9d0e1f"})
        );

        let p = Projection::new(Some(&Fields::include(["id"])), true).unwrap();
        assert!(p.apply(sample()).is_empty());
    }

    #[test]
    fn no_fields_means_whole_document() {
        let p = Projection::new(None, false).unwrap();
        assert_eq!(p, Projection::all());
        assert_eq!(p.apply(sample()), sample());
    }
}
