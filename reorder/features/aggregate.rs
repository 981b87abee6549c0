use std::{collections::HashMap, hash::Hash};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    join::EnrichedLine,
    relations::{Order, ProductId, UserId},
};

/// Per-user statistics computed from the Orders relation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserAggregate {
    /// User key.
    pub user_id: UserId,
    /// Highest order number seen for the user.
    pub user_total_orders: u32,
    /// Mean of the non-null `days_since_prior_order` values; `None` when there are none.
    pub avg_days_between_orders: Option<f64>,
}

/// Per-product statistics computed from enriched lines.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProductAggregate {
    /// Product key.
    pub product_id: ProductId,
    /// Number of lines containing the product.
    pub times_purchased: u32,
    /// Number of those lines flagged as reorders.
    pub times_reordered: u32,
    /// `times_reordered / times_purchased`.
    pub reorder_ratio: f64,
}

/// Per-(user, product) statistics computed from enriched lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProductAggregate {
    /// User key.
    pub user_id: UserId,
    /// Product key.
    pub product_id: ProductId,
    /// Lines for the pair.
    pub up_order_count: u32,
    /// Reordered lines for the pair.
    pub up_reorder_count: u32,
}

/// The three aggregate views, keyed by their grouping keys.
#[derive(Debug, Clone, Default)]
pub struct Aggregates {
    /// Keyed by user.
    pub users: HashMap<UserId, UserAggregate>,
    /// Keyed by product.
    pub products: HashMap<ProductId, ProductAggregate>,
    /// Keyed by (user, product).
    pub user_products: HashMap<(UserId, ProductId), UserProductAggregate>,
}

/// Partial state of a grouped reduction; `merge` must be associative.
trait Accumulator: Default + Send {
    type Row;

    fn add(&mut self, row: &Self::Row);

    fn merge(&mut self, other: Self);
}

#[derive(Debug, Default, Clone, Copy)]
struct UserAccumulator {
    max_order_number: u32,
    days_sum: f64,
    days_count: u32,
}

impl Accumulator for UserAccumulator {
    type Row = Order;

    fn add(&mut self, order: &Order) {
        self.max_order_number = self.max_order_number.max(order.order_number);
        if let Some(days) = order.days_since_prior_order {
            self.days_sum += days;
            self.days_count += 1;
        }
    }

    fn merge(&mut self, other: Self) {
        self.max_order_number = self.max_order_number.max(other.max_order_number);
        self.days_sum += other.days_sum;
        self.days_count += other.days_count;
    }
}

impl UserAccumulator {
    fn mean_days(&self) -> Option<f64> {
        (self.days_count > 0).then(|| self.days_sum / f64::from(self.days_count))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LineAccumulator {
    count: u32,
    reordered: u32,
}

impl Accumulator for LineAccumulator {
    type Row = EnrichedLine;

    fn add(&mut self, line: &EnrichedLine) {
        self.count += 1;
        self.reordered += u32::from(line.reordered);
    }

    fn merge(&mut self, other: Self) {
        self.count += other.count;
        self.reordered += other.reordered;
    }
}

/// Groups `rows` by `key`, folding each shard independently and merging the partials.
fn reduce_grouped<K, A, F>(rows: &[A::Row], shards: usize, key: F) -> HashMap<K, A>
where
    K: Eq + Hash + Send,
    A: Accumulator,
    A::Row: Sync,
    F: Fn(&A::Row) -> Option<K> + Sync,
{
    let fold = |chunk: &[A::Row]| {
        let mut groups: HashMap<K, A> = HashMap::new();
        for row in chunk {
            if let Some(k) = key(row) {
                groups.entry(k).or_default().add(row);
            }
        }
        groups
    };
    if shards <= 1 || rows.len() < 2 {
        return fold(rows);
    }
    let chunk_size = rows.len().div_ceil(shards).max(1);
    rows.par_chunks(chunk_size)
        .map(fold)
        .reduce(HashMap::new, merge_groups)
}

fn merge_groups<K: Eq + Hash, A: Accumulator>(
    mut left: HashMap<K, A>,
    right: HashMap<K, A>,
) -> HashMap<K, A> {
    for (key, partial) in right {
        left.entry(key).or_default().merge(partial);
    }
    left
}

/// Groups Orders by user: `max(order_number)` and the mean of non-null day gaps.
#[must_use]
pub fn aggregate_users(orders: &[Order], shards: usize) -> HashMap<UserId, UserAggregate> {
    reduce_grouped::<_, UserAccumulator, _>(orders, shards, |order| Some(order.user_id))
        .into_iter()
        .map(|(user_id, acc)| {
            (
                user_id,
                UserAggregate {
                    user_id,
                    user_total_orders: acc.max_order_number,
                    avg_days_between_orders: acc.mean_days(),
                },
            )
        })
        .collect()
}

/// Groups enriched lines by product: purchase count, reorder count, and their ratio.
#[must_use]
pub fn aggregate_products(
    lines: &[EnrichedLine],
    shards: usize,
) -> HashMap<ProductId, ProductAggregate> {
    reduce_grouped::<_, LineAccumulator, _>(lines, shards, |line| Some(line.product_id))
        .into_iter()
        .map(|(product_id, acc)| {
            // Every group holds at least one line, so `count` is never zero.
            let ratio = f64::from(acc.reordered) / f64::from(acc.count);
            (
                product_id,
                ProductAggregate {
                    product_id,
                    times_purchased: acc.count,
                    times_reordered: acc.reordered,
                    reorder_ratio: ratio,
                },
            )
        })
        .collect()
}

/// Groups enriched lines by (user, product). Lines without a resolved user are skipped.
#[must_use]
pub fn aggregate_user_products(
    lines: &[EnrichedLine],
    shards: usize,
) -> HashMap<(UserId, ProductId), UserProductAggregate> {
    reduce_grouped::<_, LineAccumulator, _>(lines, shards, |line| {
        line.user_id.map(|user_id| (user_id, line.product_id))
    })
    .into_iter()
    .map(|((user_id, product_id), acc)| {
        (
            (user_id, product_id),
            UserProductAggregate {
                user_id,
                product_id,
                up_order_count: acc.count,
                up_reorder_count: acc.reordered,
            },
        )
    })
    .collect()
}

/// Computes all three views.
#[must_use]
pub fn aggregate(orders: &[Order], lines: &[EnrichedLine], shards: usize) -> Aggregates {
    Aggregates {
        users: aggregate_users(orders, shards),
        products: aggregate_products(lines, shards),
        user_products: aggregate_user_products(lines, shards),
    }
}
