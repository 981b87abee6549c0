use std::{
    collections::HashSet,
    fmt::Debug,
    hash::Hash,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::relations::{RelationKind, Relations};

/// Source of the five named relations.
pub trait RelationSource: Send + Sync {
    /// Short description used in logs (directory, fixture name, ...).
    fn describe(&self) -> String;

    /// Loads and validates every relation.
    fn load(&self) -> Result<Relations, LoadError>;
}

/// File names of the relations inside a data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationFiles {
    /// Orders file.
    pub orders: String,
    /// Prior order lines file.
    pub prior: String,
    /// Products file.
    pub products: String,
    /// Aisles file.
    pub aisles: String,
    /// Departments file.
    pub departments: String,
}

impl Default for RelationFiles {
    fn default() -> Self {
        Self {
            orders: RelationKind::Orders.default_file_name().into(),
            prior: RelationKind::PriorOrderLines.default_file_name().into(),
            products: RelationKind::Products.default_file_name().into(),
            aisles: RelationKind::Aisles.default_file_name().into(),
            departments: RelationKind::Departments.default_file_name().into(),
        }
    }
}

impl RelationFiles {
    /// File name configured for `kind`.
    #[must_use]
    pub fn file_name(&self, kind: RelationKind) -> &str {
        match kind {
            RelationKind::Orders => &self.orders,
            RelationKind::PriorOrderLines => &self.prior,
            RelationKind::Products => &self.products,
            RelationKind::Aisles => &self.aisles,
            RelationKind::Departments => &self.departments,
        }
    }
}

/// Reads headered CSV files from a directory.
#[derive(Debug, Clone)]
pub struct CsvDirectorySource {
    dir: PathBuf,
    files: RelationFiles,
}

impl CsvDirectorySource {
    /// Uses the conventional file names inside `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_files(dir, RelationFiles::default())
    }

    /// Uses custom file names inside `dir`.
    #[must_use]
    pub fn with_files(dir: impl Into<PathBuf>, files: RelationFiles) -> Self {
        Self {
            dir: dir.into(),
            files,
        }
    }

    /// Full path of a relation file.
    #[must_use]
    pub fn path_for(&self, kind: RelationKind) -> PathBuf {
        self.dir.join(self.files.file_name(kind))
    }

    fn read<T: DeserializeOwned>(&self, kind: RelationKind) -> Result<Vec<T>, LoadError> {
        read_relation(&self.path_for(kind), kind)
    }
}

impl RelationSource for CsvDirectorySource {
    fn describe(&self) -> String {
        format!("csv:{}", self.dir.display())
    }

    fn load(&self) -> Result<Relations, LoadError> {
        // Every file must exist before any is parsed.
        for kind in RelationKind::ALL {
            let path = self.path_for(kind);
            if !path.is_file() {
                return Err(LoadError::MissingRelation {
                    relation: kind,
                    path,
                });
            }
        }
        let relations = Relations {
            orders: self.read(RelationKind::Orders)?,
            prior: self.read(RelationKind::PriorOrderLines)?,
            products: self.read(RelationKind::Products)?,
            aisles: self.read(RelationKind::Aisles)?,
            departments: self.read(RelationKind::Departments)?,
        };
        validate(&relations)?;
        Ok(relations)
    }
}

/// Serves relations already held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    relations: Relations,
}

impl InMemorySource {
    /// Wraps pre-built relations.
    #[must_use]
    pub const fn new(relations: Relations) -> Self {
        Self { relations }
    }
}

impl RelationSource for InMemorySource {
    fn describe(&self) -> String {
        "memory".into()
    }

    fn load(&self) -> Result<Relations, LoadError> {
        validate(&self.relations)?;
        Ok(self.relations.clone())
    }
}

fn read_relation<T: DeserializeOwned>(path: &Path, kind: RelationKind) -> Result<Vec<T>, LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| LoadError::Csv {
            relation: kind,
            source,
        })?;
    let mut rows = Vec::new();
    for (idx, row) in reader.deserialize::<T>().enumerate() {
        let row = row.map_err(|err| LoadError::Malformed {
            relation: kind,
            record: err
                .position()
                .map_or(idx as u64 + 1, csv::Position::record),
            reason: err.to_string(),
        })?;
        rows.push(row);
    }
    Ok(rows)
}

/// Checks primary-key uniqueness and value domains of loaded relations.
pub fn validate(relations: &Relations) -> Result<(), LoadError> {
    ensure_unique(
        RelationKind::Orders,
        relations.orders.iter().map(|order| order.order_id),
    )?;
    ensure_unique(
        RelationKind::PriorOrderLines,
        relations
            .prior
            .iter()
            .map(|line| (line.order_id, line.product_id)),
    )?;
    ensure_unique(
        RelationKind::Products,
        relations.products.iter().map(|product| product.product_id),
    )?;
    ensure_unique(
        RelationKind::Aisles,
        relations.aisles.iter().map(|aisle| aisle.aisle_id),
    )?;
    ensure_unique(
        RelationKind::Departments,
        relations.departments.iter().map(|dept| dept.department_id),
    )?;

    for (record, order) in (1_u64..).zip(&relations.orders) {
        if order.order_number == 0 {
            return Err(LoadError::Malformed {
                relation: RelationKind::Orders,
                record,
                reason: format!("order {} has order_number 0", order.order_id),
            });
        }
        if let Some(days) = order.days_since_prior_order {
            if !days.is_finite() || days < 0.0 {
                return Err(LoadError::Malformed {
                    relation: RelationKind::Orders,
                    record,
                    reason: format!(
                        "order {} has invalid days_since_prior_order {days}",
                        order.order_id
                    ),
                });
            }
        }
    }
    for (record, line) in (1_u64..).zip(&relations.prior) {
        if line.reordered > 1 {
            return Err(LoadError::Malformed {
                relation: RelationKind::PriorOrderLines,
                record,
                reason: format!(
                    "reordered must be 0 or 1, found {} for ({}, {})",
                    line.reordered, line.order_id, line.product_id
                ),
            });
        }
    }
    Ok(())
}

fn ensure_unique<K, I>(relation: RelationKind, keys: I) -> Result<(), LoadError>
where
    K: Eq + Hash + Debug + Copy,
    I: IntoIterator<Item = K>,
{
    let mut seen = HashSet::new();
    for key in keys {
        if !seen.insert(key) {
            return Err(LoadError::DuplicateKey {
                relation,
                key: format!("{key:?}"),
            });
        }
    }
    Ok(())
}

/// Errors raised while loading relations. All of them abort the pipeline.
#[derive(Debug, Error)]
pub enum LoadError {
    /// A required relation file is absent.
    #[error("relation `{relation}` not found at {}", path.display())]
    MissingRelation {
        /// Relation that is missing.
        relation: RelationKind,
        /// Path that was probed.
        path: PathBuf,
    },
    /// A record could not be parsed or violates a value constraint.
    #[error("relation `{relation}` record {record} is malformed: {reason}")]
    Malformed {
        /// Offending relation.
        relation: RelationKind,
        /// 1-based data record index.
        record: u64,
        /// Parser or validation message.
        reason: String,
    },
    /// A primary key occurs more than once.
    #[error("relation `{relation}` has duplicate key {key}")]
    DuplicateKey {
        /// Offending relation.
        relation: RelationKind,
        /// Debug rendering of the repeated key.
        key: String,
    },
    /// The file could not be opened or read.
    #[error("relation `{relation}` could not be read: {source}")]
    Csv {
        /// Offending relation.
        relation: RelationKind,
        /// Underlying reader error.
        source: csv::Error,
    },
}

impl LoadError {
    /// Relation the error refers to.
    #[must_use]
    pub const fn relation(&self) -> RelationKind {
        match self {
            Self::MissingRelation { relation, .. }
            | Self::Malformed { relation, .. }
            | Self::DuplicateKey { relation, .. }
            | Self::Csv { relation, .. } => *relation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relations::{Order, PriorOrderLine};
    use std::fs;
    use tempfile::tempdir;

    fn write_fixture(dir: &Path) {
        fs::write(
            dir.join("orders.csv"),
            "order_id,user_id,eval_set,order_number,order_dow,order_hour_of_day,days_since_prior_order\n\
             1,1,prior,1,2,8,\n\
             2,1,prior,2,3,7,10.0\n",
        )
        .unwrap();
        fs::write(
            dir.join("order_products__prior.csv"),
            "order_id,product_id,add_to_cart_order,reordered\n1,9,1,0\n2,9,1,1\n",
        )
        .unwrap();
        fs::write(
            dir.join("products.csv"),
            "product_id,product_name,aisle_id,department_id\n9,\"Milk, Whole\",3,4\n",
        )
        .unwrap();
        fs::write(dir.join("aisles.csv"), "aisle_id,aisle\n3,milk\n").unwrap();
        fs::write(
            dir.join("departments.csv"),
            "department_id,department\n4,dairy eggs\n",
        )
        .unwrap();
    }

    #[test]
    fn loads_csv_directory_with_nullable_days() {
        let tmp = tempdir().unwrap();
        write_fixture(tmp.path());
        let relations = CsvDirectorySource::new(tmp.path()).load().unwrap();
        assert_eq!(relations.orders.len(), 2);
        assert_eq!(relations.orders[0].days_since_prior_order, None);
        assert_eq!(relations.orders[1].days_since_prior_order, Some(10.0));
        assert_eq!(relations.products[0].product_name, "Milk, Whole");
        assert_eq!(relations.prior.len(), 2);
    }

    #[test]
    fn missing_file_is_a_load_failure() {
        let tmp = tempdir().unwrap();
        write_fixture(tmp.path());
        fs::remove_file(tmp.path().join("aisles.csv")).unwrap();
        let err = CsvDirectorySource::new(tmp.path()).load().unwrap_err();
        assert!(matches!(
            err,
            LoadError::MissingRelation {
                relation: RelationKind::Aisles,
                ..
            }
        ));
    }

    #[test]
    fn unparsable_record_reports_relation_and_record() {
        let tmp = tempdir().unwrap();
        write_fixture(tmp.path());
        fs::write(
            tmp.path().join("order_products__prior.csv"),
            "order_id,product_id,add_to_cart_order,reordered\n1,9,1,0\n2,oops,1,1\n",
        )
        .unwrap();
        let err = CsvDirectorySource::new(tmp.path()).load().unwrap_err();
        match err {
            LoadError::Malformed {
                relation, record, ..
            } => {
                assert_eq!(relation, RelationKind::PriorOrderLines);
                assert_eq!(record, 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn reordered_flag_outside_domain_is_rejected() {
        let relations = Relations {
            orders: vec![Order {
                order_id: 1,
                user_id: 1,
                order_number: 1,
                days_since_prior_order: None,
            }],
            prior: vec![PriorOrderLine {
                order_id: 1,
                product_id: 9,
                add_to_cart_order: 1,
                reordered: 2,
            }],
            ..Relations::default()
        };
        let err = InMemorySource::new(relations).load().unwrap_err();
        assert_eq!(err.relation(), RelationKind::PriorOrderLines);
        assert!(err.to_string().contains("reordered must be 0 or 1"));
    }

    #[test]
    fn duplicate_order_ids_are_rejected() {
        let order = Order {
            order_id: 7,
            user_id: 1,
            order_number: 1,
            days_since_prior_order: None,
        };
        let relations = Relations {
            orders: vec![order.clone(), order],
            ..Relations::default()
        };
        let err = validate(&relations).unwrap_err();
        assert!(matches!(err, LoadError::DuplicateKey { relation: RelationKind::Orders, .. }));
    }

    #[test]
    fn bundled_sample_dataset_loads() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("dataset");
        let relations = CsvDirectorySource::new(dir).load().unwrap();
        assert!(!relations.orders.is_empty());
        assert!(!relations.prior.is_empty());
        assert_eq!(relations.aisles.len(), 6);
    }
}
