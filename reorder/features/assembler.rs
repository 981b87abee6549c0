use std::{
    collections::HashMap,
    fmt,
    path::Path,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    aggregate::Aggregates,
    error::{AggregateKind, PipelineError},
    join::EnrichedRelation,
    relations::{ProductId, UserId},
};

/// Number of numeric features per (user, product) pair.
pub const FEATURE_DIM: usize = 7;

/// Fixed-order numeric feature vector.
pub type FeatureVector = [f64; FEATURE_DIM];

/// Feature columns in the order used by the scaler and the scoring model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureColumn {
    /// Lines for the pair.
    UpOrderCount,
    /// Reordered lines for the pair.
    UpReorderCount,
    /// Highest order number of the user.
    UserTotalOrders,
    /// Mean days between the user's orders (filled when missing).
    AvgDaysBetweenOrders,
    /// Reorders of the product across all users.
    TimesReordered,
    /// Purchases of the product across all users.
    TimesPurchased,
    /// `times_reordered / times_purchased`.
    ReorderRatio,
}

impl FeatureColumn {
    /// Every column, in vector order.
    pub const ALL: [Self; FEATURE_DIM] = [
        Self::UpOrderCount,
        Self::UpReorderCount,
        Self::UserTotalOrders,
        Self::AvgDaysBetweenOrders,
        Self::TimesReordered,
        Self::TimesPurchased,
        Self::ReorderRatio,
    ];

    /// Column name as written to artifacts and CSV exports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::UpOrderCount => "up_order_count",
            Self::UpReorderCount => "up_reorder_count",
            Self::UserTotalOrders => "user_total_orders",
            Self::AvgDaysBetweenOrders => "avg_days_between_orders",
            Self::TimesReordered => "times_reordered",
            Self::TimesPurchased => "times_purchased",
            Self::ReorderRatio => "reorder_ratio",
        }
    }

    /// Position in [`FeatureVector`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Column names in vector order; persisted next to fitted parameters.
    #[must_use]
    pub fn names() -> Vec<String> {
        Self::ALL.iter().map(|col| col.name().to_string()).collect()
    }
}

impl fmt::Display for FeatureColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fill policy for missing feature values.
///
/// A user whose orders carry no `days_since_prior_order` has no average; the row gets
/// `avg_days_fill` instead and is flagged `avg_days_imputed`. Training and inference read
/// the same filled value from the table, so the policy is applied once, at assembly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MissingValuePolicy {
    /// Value substituted for a missing `avg_days_between_orders`.
    pub avg_days_fill: f64,
}

impl Default for MissingValuePolicy {
    fn default() -> Self {
        Self { avg_days_fill: 0.0 }
    }
}

/// One row of the feature table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureRow {
    /// User key.
    pub user_id: UserId,
    /// Product key.
    pub product_id: ProductId,
    /// Lines for the pair.
    pub up_order_count: u32,
    /// Reordered lines for the pair.
    pub up_reorder_count: u32,
    /// Highest order number of the user.
    pub user_total_orders: u32,
    /// Mean days between orders, already filled per [`MissingValuePolicy`].
    pub avg_days_between_orders: f64,
    /// True when `avg_days_between_orders` is the fill value.
    pub avg_days_imputed: bool,
    /// Reorders of the product.
    pub times_reordered: u32,
    /// Purchases of the product.
    pub times_purchased: u32,
    /// Product reorder ratio.
    pub reorder_ratio: f64,
    /// 1 iff `up_reorder_count > 0`.
    pub label: u8,
    /// Product name, when the catalogue has one.
    pub product_name: Option<Arc<str>>,
    /// Aisle name.
    pub aisle: Option<Arc<str>>,
    /// Department name.
    pub department: Option<Arc<str>>,
}

impl FeatureRow {
    /// Numeric features in [`FeatureColumn::ALL`] order.
    #[must_use]
    pub fn vector(&self) -> FeatureVector {
        FeatureColumn::ALL.map(|col| self.value(col))
    }

    /// Value of a single column.
    #[must_use]
    pub fn value(&self, column: FeatureColumn) -> f64 {
        match column {
            FeatureColumn::UpOrderCount => f64::from(self.up_order_count),
            FeatureColumn::UpReorderCount => f64::from(self.up_reorder_count),
            FeatureColumn::UserTotalOrders => f64::from(self.user_total_orders),
            FeatureColumn::AvgDaysBetweenOrders => self.avg_days_between_orders,
            FeatureColumn::TimesReordered => f64::from(self.times_reordered),
            FeatureColumn::TimesPurchased => f64::from(self.times_purchased),
            FeatureColumn::ReorderRatio => self.reorder_ratio,
        }
    }

    /// Display name of the user, e.g. `User_42`.
    #[must_use]
    pub fn user_name(&self) -> String {
        format!("User_{}", self.user_id)
    }
}

/// Derives the training label from the pair's reorder count.
#[must_use]
pub const fn label_for(up_reorder_count: u32) -> u8 {
    if up_reorder_count > 0 {
        1
    } else {
        0
    }
}

/// Feature rows sorted by (user, product) with key lookup.
#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    rows: Vec<FeatureRow>,
    index: HashMap<(UserId, ProductId), usize>,
    policy: MissingValuePolicy,
}

impl FeatureTable {
    fn from_rows(mut rows: Vec<FeatureRow>, policy: MissingValuePolicy) -> Self {
        rows.sort_unstable_by_key(|row| (row.user_id, row.product_id));
        let index = rows
            .iter()
            .enumerate()
            .map(|(idx, row)| ((row.user_id, row.product_id), idx))
            .collect();
        Self {
            rows,
            index,
            policy,
        }
    }

    /// All rows, sorted by (user, product).
    #[must_use]
    pub fn rows(&self) -> &[FeatureRow] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Fill policy the table was assembled with.
    #[must_use]
    pub const fn policy(&self) -> MissingValuePolicy {
        self.policy
    }

    /// Row for a pair, if the user ever bought the product.
    #[must_use]
    pub fn get(&self, user_id: UserId, product_id: ProductId) -> Option<&FeatureRow> {
        self.index
            .get(&(user_id, product_id))
            .map(|idx| &self.rows[*idx])
    }

    /// Rows of one user, sorted by product.
    #[must_use]
    pub fn for_user(&self, user_id: UserId) -> &[FeatureRow] {
        let start = self.rows.partition_point(|row| row.user_id < user_id);
        let end = self.rows.partition_point(|row| row.user_id <= user_id);
        &self.rows[start..end]
    }

    /// Distinct users, ascending.
    #[must_use]
    pub fn users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.rows.iter().map(|row| row.user_id).collect();
        users.dedup();
        users
    }

    /// The user's `limit` most reordered products; ties go to the lower product id.
    #[must_use]
    pub fn top_reordered(&self, user_id: UserId, limit: usize) -> Vec<&FeatureRow> {
        let mut rows: Vec<&FeatureRow> = self.for_user(user_id).iter().collect();
        rows.sort_by(|a, b| {
            b.up_reorder_count
                .cmp(&a.up_reorder_count)
                .then(a.product_id.cmp(&b.product_id))
        });
        rows.truncate(limit);
        rows
    }

    /// Feature vectors of every row, in row order.
    #[must_use]
    pub fn vectors(&self) -> Vec<FeatureVector> {
        self.rows.iter().map(FeatureRow::vector).collect()
    }

    /// Labels of every row, in row order.
    #[must_use]
    pub fn labels(&self) -> Vec<u8> {
        self.rows.iter().map(|row| row.label).collect()
    }

    /// Writes the table as CSV: keys, feature columns, label, then display attributes.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
        let path = path.as_ref();
        let artifact_err = |reason: String| PipelineError::Artifact {
            path: path.to_path_buf(),
            reason,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| artifact_err(err.to_string()))?;
        }
        let mut writer = csv::Writer::from_path(path).map_err(|err| artifact_err(err.to_string()))?;
        let mut header = vec!["user_id".to_string(), "product_id".to_string()];
        header.extend(FeatureColumn::names());
        header.extend(
            ["label", "user_name", "product_name", "aisle", "department"]
                .iter()
                .map(ToString::to_string),
        );
        writer
            .write_record(&header)
            .map_err(|err| artifact_err(err.to_string()))?;
        for row in &self.rows {
            let mut record = vec![row.user_id.to_string(), row.product_id.to_string()];
            record.extend(row.vector().iter().map(ToString::to_string));
            record.push(row.label.to_string());
            record.push(row.user_name());
            for attr in [&row.product_name, &row.aisle, &row.department] {
                record.push(attr.as_deref().unwrap_or_default().to_string());
            }
            writer
                .write_record(&record)
                .map_err(|err| artifact_err(err.to_string()))?;
        }
        writer.flush().map_err(|err| artifact_err(err.to_string()))?;
        Ok(())
    }
}

/// Merges the pair view with the user and product views into the feature table.
///
/// Fails with [`PipelineError::JoinIntegrity`] if a pair has no matching user or product
/// aggregate, and with [`PipelineError::EmptyFeatureTable`] if no pair exists.
pub fn assemble(
    aggregates: &Aggregates,
    enriched: &EnrichedRelation,
    policy: MissingValuePolicy,
) -> Result<FeatureTable, PipelineError> {
    let mut rows = Vec::with_capacity(aggregates.user_products.len());
    for pair in aggregates.user_products.values() {
        let user = aggregates
            .users
            .get(&pair.user_id)
            .ok_or(PipelineError::JoinIntegrity {
                user_id: pair.user_id,
                product_id: pair.product_id,
                missing: AggregateKind::User,
            })?;
        let product =
            aggregates
                .products
                .get(&pair.product_id)
                .ok_or(PipelineError::JoinIntegrity {
                    user_id: pair.user_id,
                    product_id: pair.product_id,
                    missing: AggregateKind::Product,
                })?;
        debug_assert!(pair.up_reorder_count <= pair.up_order_count);
        let display = enriched.display_for(pair.product_id);
        rows.push(FeatureRow {
            user_id: pair.user_id,
            product_id: pair.product_id,
            up_order_count: pair.up_order_count,
            up_reorder_count: pair.up_reorder_count,
            user_total_orders: user.user_total_orders,
            avg_days_between_orders: user
                .avg_days_between_orders
                .unwrap_or(policy.avg_days_fill),
            avg_days_imputed: user.avg_days_between_orders.is_none(),
            times_reordered: product.times_reordered,
            times_purchased: product.times_purchased,
            reorder_ratio: product.reorder_ratio,
            label: label_for(pair.up_reorder_count),
            product_name: display.product_name,
            aisle: display.aisle,
            department: display.department,
        });
    }
    if rows.is_empty() {
        return Err(PipelineError::EmptyFeatureTable);
    }
    Ok(FeatureTable::from_rows(rows, policy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregate::{aggregate, UserProductAggregate},
        join::enrich,
        relations::{Order, PriorOrderLine, Relations},
    };
    use proptest::prelude::*;

    fn order(order_id: u64, user_id: u64, order_number: u32, days: Option<f64>) -> Order {
        Order {
            order_id,
            user_id,
            order_number,
            days_since_prior_order: days,
        }
    }

    fn line(order_id: u64, product_id: u64, reordered: u8) -> PriorOrderLine {
        PriorOrderLine {
            order_id,
            product_id,
            add_to_cart_order: 1,
            reordered,
        }
    }

    fn build(relations: &Relations, policy: MissingValuePolicy) -> Result<FeatureTable, PipelineError> {
        let enriched = enrich(relations);
        let aggregates = aggregate(&relations.orders, &enriched.lines, 1);
        assemble(&aggregates, &enriched, policy)
    }

    #[test]
    fn two_order_scenario_yields_positive_label() {
        let relations = Relations {
            orders: vec![order(1, 1, 1, None), order(2, 1, 2, Some(10.0))],
            prior: vec![line(1, 9, 0), line(2, 9, 1)],
            ..Relations::default()
        };
        let table = build(&relations, MissingValuePolicy::default()).unwrap();
        assert_eq!(table.len(), 1);
        let row = table.get(1, 9).unwrap();
        assert_eq!(row.user_total_orders, 2);
        assert!((row.avg_days_between_orders - 10.0).abs() < f64::EPSILON);
        assert!(!row.avg_days_imputed);
        assert_eq!(row.up_order_count, 2);
        assert_eq!(row.up_reorder_count, 1);
        assert_eq!(row.label, 1);
        assert_eq!(row.vector()[FeatureColumn::ReorderRatio.index()], 0.5);
    }

    #[test]
    fn single_order_user_gets_fill_value_and_negative_labels() {
        let relations = Relations {
            orders: vec![order(1, 7, 1, None)],
            prior: vec![line(1, 3, 0), line(1, 4, 0)],
            ..Relations::default()
        };
        let table = build(&relations, MissingValuePolicy { avg_days_fill: -1.0 }).unwrap();
        assert_eq!(table.len(), 2);
        for row in table.rows() {
            assert_eq!(row.label, 0);
            assert!(row.avg_days_imputed);
            assert!((row.avg_days_between_orders + 1.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn empty_history_is_fatal() {
        let relations = Relations {
            orders: vec![order(1, 7, 1, None)],
            ..Relations::default()
        };
        assert!(matches!(
            build(&relations, MissingValuePolicy::default()),
            Err(PipelineError::EmptyFeatureTable)
        ));
    }

    #[test]
    fn missing_user_aggregate_is_a_join_integrity_failure() {
        let relations = Relations {
            orders: vec![order(1, 1, 1, None)],
            prior: vec![line(1, 9, 0)],
            ..Relations::default()
        };
        let enriched = enrich(&relations);
        let mut aggregates = aggregate(&relations.orders, &enriched.lines, 1);
        aggregates.user_products.insert(
            (2, 9),
            UserProductAggregate {
                user_id: 2,
                product_id: 9,
                up_order_count: 1,
                up_reorder_count: 0,
            },
        );
        let err = assemble(&aggregates, &enriched, MissingValuePolicy::default()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::JoinIntegrity {
                user_id: 2,
                missing: AggregateKind::User,
                ..
            }
        ));
    }

    #[test]
    fn top_reordered_orders_by_count_then_product() {
        let relations = Relations {
            orders: vec![
                order(1, 1, 1, None),
                order(2, 1, 2, Some(3.0)),
                order(3, 1, 3, Some(5.0)),
                order(4, 2, 1, None),
            ],
            prior: vec![
                line(1, 10, 0),
                line(1, 20, 0),
                line(1, 30, 0),
                line(2, 20, 1),
                line(2, 30, 1),
                line(3, 30, 1),
                line(4, 10, 0),
            ],
            ..Relations::default()
        };
        let table = build(&relations, MissingValuePolicy::default()).unwrap();
        let top: Vec<u64> = table
            .top_reordered(1, 5)
            .iter()
            .map(|row| row.product_id)
            .collect();
        assert_eq!(top, vec![30, 20, 10]);
        assert_eq!(table.top_reordered(1, 1).len(), 1);
        assert_eq!(table.for_user(2).len(), 1);
        assert_eq!(table.users(), vec![1, 2]);
        assert!(table.for_user(3).is_empty());
    }

    #[test]
    fn exports_csv_with_display_columns() {
        let relations = Relations {
            orders: vec![order(1, 1, 1, None)],
            prior: vec![line(1, 9, 0)],
            products: vec![crate::relations::Product {
                product_id: 9,
                product_name: "Soda".into(),
                aisle_id: 77,
                department_id: 7,
            }],
            ..Relations::default()
        };
        let table = build(&relations, MissingValuePolicy::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/features.csv");
        table.write_csv(&path).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        let mut lines = content.lines();
        assert!(lines.next().unwrap().starts_with("user_id,product_id,up_order_count"));
        let row = lines.next().unwrap();
        assert!(row.contains("User_1"));
        assert!(row.contains("Soda"));
    }

    fn arbitrary_history() -> impl Strategy<Value = Relations> {
        (
            prop::collection::vec((1_u64..5, prop::option::of(1.0_f64..30.0)), 1..12),
            prop::collection::vec((0_usize..12, 1_u64..6, 0_u8..2), 1..40),
        )
            .prop_map(|(orders, lines)| {
                let orders: Vec<Order> = orders
                    .into_iter()
                    .enumerate()
                    .map(|(idx, (user_id, days))| order(idx as u64 + 1, user_id, idx as u32 + 1, days))
                    .collect();
                let mut seen = std::collections::HashSet::new();
                let prior = lines
                    .into_iter()
                    .map(|(idx, product_id, reordered)| {
                        line((idx % orders.len()) as u64 + 1, product_id, reordered)
                    })
                    .filter(|l| seen.insert((l.order_id, l.product_id)))
                    .collect();
                Relations {
                    orders,
                    prior,
                    ..Relations::default()
                }
            })
    }

    proptest! {
        #[test]
        fn label_matches_reorder_count_both_ways(relations in arbitrary_history()) {
            let table = build(&relations, MissingValuePolicy::default()).unwrap();
            for row in table.rows() {
                prop_assert_eq!(row.label == 1, row.up_reorder_count > 0);
                prop_assert_eq!(row.label == 0, row.up_reorder_count == 0);
            }
        }

        #[test]
        fn one_row_per_distinct_pair(relations in arbitrary_history()) {
            let table = build(&relations, MissingValuePolicy::default()).unwrap();
            let users: HashMap<u64, u64> = relations
                .orders
                .iter()
                .map(|o| (o.order_id, o.user_id))
                .collect();
            let pairs: std::collections::BTreeSet<(u64, u64)> = relations
                .prior
                .iter()
                .filter_map(|l| users.get(&l.order_id).map(|u| (*u, l.product_id)))
                .collect();
            let keys: Vec<(u64, u64)> = table.rows().iter().map(|r| (r.user_id, r.product_id)).collect();
            prop_assert_eq!(keys, pairs.into_iter().collect::<Vec<_>>());
        }

        #[test]
        fn input_order_does_not_change_the_table(relations in arbitrary_history()) {
            let forward = build(&relations, MissingValuePolicy::default()).unwrap();
            let mut reversed = relations.clone();
            reversed.orders.reverse();
            reversed.prior.reverse();
            let backward = build(&reversed, MissingValuePolicy::default()).unwrap();
            prop_assert_eq!(forward.len(), backward.len());
            for (a, b) in forward.rows().iter().zip(backward.rows()) {
                prop_assert_eq!((a.user_id, a.product_id, a.label), (b.user_id, b.product_id, b.label));
                for (x, y) in a.vector().iter().zip(b.vector().iter()) {
                    prop_assert!((x - y).abs() < 1e-9);
                }
            }
        }
    }
}
