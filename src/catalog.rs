use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use tracing::{info, warn};

use crate::limits::{MAX_CATALOG_ENTRIES, MAX_FIELD_LEN};
use crate::model::CatalogEntry;

/// Course offerings a reservation can be created from, keyed by
/// `subject|cohort|owner`.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    by_key: HashMap<String, usize>,
}

impl Catalog {
    /// Build from raw entries. Later duplicates of a key are dropped.
    pub fn from_entries(raw: Vec<CatalogEntry>) -> Result<Self, CatalogError> {
        let mut catalog = Self::default();
        for entry in raw {
            for (field, value) in [("subject", &entry.subject), ("cohort", &entry.cohort), ("owner", &entry.owner)] {
                if value.is_empty() || value.len() > MAX_FIELD_LEN {
                    return Err(CatalogError::BadField { field, len: value.len() });
                }
            }
            let key = entry.key();
            if catalog.by_key.contains_key(&key) {
                warn!("catalog: dropping duplicate entry {key}");
                continue;
            }
            if catalog.entries.len() >= MAX_CATALOG_ENTRIES {
                return Err(CatalogError::TooMany(MAX_CATALOG_ENTRIES));
            }
            catalog.by_key.insert(key, catalog.entries.len());
            catalog.entries.push(entry);
        }
        Ok(catalog)
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let raw: Vec<CatalogEntry> = serde_json::from_str(json).map_err(|e| CatalogError::Json(e.to_string()))?;
        Self::from_entries(raw)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path).map_err(|e| CatalogError::Io(format!("{}: {e}", path.display())))?;
        let catalog = Self::from_json(&json)?;
        info!("catalog: loaded {} entries from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    /// Entries shipped with the server when no catalog file is configured.
    pub fn builtin() -> Self {
        let entries = vec![
            CatalogEntry::new("CIENCIA DE LOS MATERIALES", "4A", "ARELLANO ORTIZ GABRIEL ALEJANDRO"),
            CatalogEntry::new("ÁLGEBRA LINEAL", "1A", "ALMEIDA MURILLO WILMER FABRICIO"),
        ];
        let by_key = entries.iter().enumerate().map(|(i, e)| (e.key(), i)).collect();
        Self { entries, by_key }
    }

    pub fn get(&self, key: &str) -> Option<&CatalogEntry> {
        self.by_key.get(key).map(|&i| &self.entries[i])
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
pub enum CatalogError {
    Io(String),
    Json(String),
    BadField { field: &'static str, len: usize },
    TooMany(usize),
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::Io(e) => write!(f, "catalog unreadable: {e}"),
            CatalogError::Json(e) => write!(f, "catalog is not valid JSON: {e}"),
            CatalogError::BadField { field, len } => {
                write!(f, "catalog {field} must be 1..={MAX_FIELD_LEN} bytes, got {len}")
            }
            CatalogError::TooMany(max) => write!(f, "catalog exceeds {max} entries"),
        }
    }
}

impl std::error::Error for CatalogError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_looks_up() {
        let json = r#"[
            {"subject": "REDES", "cohort": "5A", "owner": "PEREZ"},
            {"subject": "REDES", "cohort": "5B", "owner": "PEREZ"}
        ]"#;
        let catalog = Catalog::from_json(json).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("REDES|5B|PEREZ").unwrap().cohort, "5B");
        assert!(catalog.get("REDES|5C|PEREZ").is_none());
    }

    #[test]
    fn duplicates_dropped_first_wins() {
        let catalog = Catalog::from_entries(vec![
            CatalogEntry::new("A", "1", "X"),
            CatalogEntry::new("B", "1", "X"),
            CatalogEntry::new("A", "1", "X"),
        ])
        .unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.entries()[1].subject, "B");
    }

    #[test]
    fn rejects_bad_fields() {
        let long = "x".repeat(MAX_FIELD_LEN + 1);
        assert!(matches!(
            Catalog::from_entries(vec![CatalogEntry::new(long, "1", "X")]),
            Err(CatalogError::BadField { field: "subject", .. })
        ));
        assert!(matches!(
            Catalog::from_entries(vec![CatalogEntry::new("A", "", "X")]),
            Err(CatalogError::BadField { field: "cohort", len: 0 })
        ));
        assert!(matches!(Catalog::from_json("{}"), Err(CatalogError::Json(_))));
    }

    #[test]
    fn builtin_entries_resolve() {
        let catalog = Catalog::builtin();
        for entry in catalog.entries() {
            assert_eq!(catalog.get(&entry.key()), Some(entry));
        }
    }
}
