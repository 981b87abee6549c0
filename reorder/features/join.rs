use std::{collections::HashMap, sync::Arc};

use serde::Serialize;

use crate::relations::{
    AisleId, DepartmentId, OrderId, PriorOrderLine, ProductId, Relations, UserId,
};

/// Presentation attributes of a product, each `None` when its lookup missed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProductDisplay {
    /// Product name.
    pub product_name: Option<Arc<str>>,
    /// Aisle name.
    pub aisle: Option<Arc<str>>,
    /// Department name.
    pub department: Option<Arc<str>>,
}

/// A prior order line with product, aisle, department, and order attributes attached.
///
/// Every field of the source line is preserved; looked-up fields are `None` when the
/// corresponding relation has no matching key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedLine {
    /// Order the line belongs to.
    pub order_id: OrderId,
    /// Product purchased.
    pub product_id: ProductId,
    /// Cart position.
    pub add_to_cart_order: u32,
    /// Reorder flag (0/1).
    pub reordered: u8,
    /// Owning user, resolved through the order.
    pub user_id: Option<UserId>,
    /// Order sequence number for the user.
    pub order_number: Option<u32>,
    /// Days since the user's previous order.
    pub days_since_prior_order: Option<f64>,
    /// Aisle of the product.
    pub aisle_id: Option<AisleId>,
    /// Department of the product.
    pub department_id: Option<DepartmentId>,
    /// Product, aisle, and department names.
    pub display: ProductDisplay,
}

/// Lookup statistics of a join pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JoinSummary {
    /// Output rows (always equal to input prior lines).
    pub lines: usize,
    /// Lines whose order id did not resolve to a user.
    pub orphan_lines: usize,
    /// Lines whose product id is absent from Products.
    pub unmatched_products: usize,
    /// Lines whose aisle id is absent from Aisles.
    pub unmatched_aisles: usize,
    /// Lines whose department id is absent from Departments.
    pub unmatched_departments: usize,
}

/// Output of the join layer.
#[derive(Debug, Clone, Default)]
pub struct EnrichedRelation {
    /// One enriched row per prior order line, in input order.
    pub lines: Vec<EnrichedLine>,
    /// Display attributes per product seen in `lines`.
    pub display: HashMap<ProductId, ProductDisplay>,
    /// Lookup statistics.
    pub summary: JoinSummary,
}

impl EnrichedRelation {
    /// Display attributes for a product, empty when it never appeared.
    #[must_use]
    pub fn display_for(&self, product_id: ProductId) -> ProductDisplay {
        self.display.get(&product_id).cloned().unwrap_or_default()
    }
}

struct ProductLookup {
    name: Arc<str>,
    aisle_id: AisleId,
    department_id: DepartmentId,
}

struct OrderLookup {
    user_id: UserId,
    order_number: u32,
    days_since_prior_order: Option<f64>,
}

/// Left-joins prior lines to Products, Aisles, Departments, and Orders.
///
/// Output cardinality equals `relations.prior.len()`: every lookup key is unique, so the
/// join never fans out, and unmatched lookups leave attributes empty instead of dropping rows.
#[must_use]
pub fn enrich(relations: &Relations) -> EnrichedRelation {
    let products: HashMap<ProductId, ProductLookup> = relations
        .products
        .iter()
        .map(|product| {
            (
                product.product_id,
                ProductLookup {
                    name: Arc::from(product.product_name.as_str()),
                    aisle_id: product.aisle_id,
                    department_id: product.department_id,
                },
            )
        })
        .collect();
    let aisles: HashMap<AisleId, Arc<str>> = relations
        .aisles
        .iter()
        .map(|aisle| (aisle.aisle_id, Arc::from(aisle.aisle.as_str())))
        .collect();
    let departments: HashMap<DepartmentId, Arc<str>> = relations
        .departments
        .iter()
        .map(|dept| (dept.department_id, Arc::from(dept.department.as_str())))
        .collect();
    let orders: HashMap<OrderId, OrderLookup> = relations
        .orders
        .iter()
        .map(|order| {
            (
                order.order_id,
                OrderLookup {
                    user_id: order.user_id,
                    order_number: order.order_number,
                    days_since_prior_order: order.days_since_prior_order,
                },
            )
        })
        .collect();

    let mut summary = JoinSummary {
        lines: relations.prior.len(),
        ..JoinSummary::default()
    };
    let mut display = HashMap::new();
    let lines = relations
        .prior
        .iter()
        .map(|line| {
            let enriched = enrich_line(line, &products, &aisles, &departments, &orders);
            tally(&mut summary, &enriched);
            display
                .entry(enriched.product_id)
                .or_insert_with(|| enriched.display.clone());
            enriched
        })
        .collect::<Vec<_>>();

    debug_assert_eq!(lines.len(), relations.prior.len());
    EnrichedRelation {
        lines,
        display,
        summary,
    }
}

fn enrich_line(
    line: &PriorOrderLine,
    products: &HashMap<ProductId, ProductLookup>,
    aisles: &HashMap<AisleId, Arc<str>>,
    departments: &HashMap<DepartmentId, Arc<str>>,
    orders: &HashMap<OrderId, OrderLookup>,
) -> EnrichedLine {
    let product = products.get(&line.product_id);
    let aisle_id = product.map(|p| p.aisle_id);
    let department_id = product.map(|p| p.department_id);
    let order = orders.get(&line.order_id);
    EnrichedLine {
        order_id: line.order_id,
        product_id: line.product_id,
        add_to_cart_order: line.add_to_cart_order,
        reordered: line.reordered,
        user_id: order.map(|o| o.user_id),
        order_number: order.map(|o| o.order_number),
        days_since_prior_order: order.and_then(|o| o.days_since_prior_order),
        aisle_id,
        department_id,
        display: ProductDisplay {
            product_name: product.map(|p| Arc::clone(&p.name)),
            aisle: aisle_id.and_then(|id| aisles.get(&id).cloned()),
            department: department_id.and_then(|id| departments.get(&id).cloned()),
        },
    }
}

fn tally(summary: &mut JoinSummary, line: &EnrichedLine) {
    if line.user_id.is_none() {
        summary.orphan_lines += 1;
    }
    if line.display.product_name.is_none() {
        summary.unmatched_products += 1;
        return;
    }
    if line.display.aisle.is_none() {
        summary.unmatched_aisles += 1;
    }
    if line.display.department.is_none() {
        summary.unmatched_departments += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relations::{Aisle, Department, Order, Product};

    fn relations() -> Relations {
        Relations {
            orders: vec![
                Order {
                    order_id: 1,
                    user_id: 10,
                    order_number: 1,
                    days_since_prior_order: None,
                },
                Order {
                    order_id: 2,
                    user_id: 10,
                    order_number: 2,
                    days_since_prior_order: Some(6.0),
                },
            ],
            prior: vec![
                PriorOrderLine {
                    order_id: 1,
                    product_id: 100,
                    add_to_cart_order: 1,
                    reordered: 0,
                },
                PriorOrderLine {
                    order_id: 2,
                    product_id: 100,
                    add_to_cart_order: 1,
                    reordered: 1,
                },
                // Product missing from the catalogue.
                PriorOrderLine {
                    order_id: 2,
                    product_id: 200,
                    add_to_cart_order: 2,
                    reordered: 0,
                },
                // Order missing from Orders.
                PriorOrderLine {
                    order_id: 99,
                    product_id: 300,
                    add_to_cart_order: 1,
                    reordered: 0,
                },
            ],
            products: vec![
                Product {
                    product_id: 100,
                    product_name: "Bananas".into(),
                    aisle_id: 24,
                    department_id: 4,
                },
                Product {
                    product_id: 300,
                    product_name: "Tofu".into(),
                    aisle_id: 99,
                    department_id: 4,
                },
            ],
            aisles: vec![Aisle {
                aisle_id: 24,
                aisle: "fresh fruits".into(),
            }],
            departments: vec![Department {
                department_id: 4,
                department: "produce".into(),
            }],
        }
    }

    #[test]
    fn join_preserves_cardinality_and_fields() {
        let input = relations();
        let enriched = enrich(&input);
        assert_eq!(enriched.lines.len(), input.prior.len());
        for (line, source) in enriched.lines.iter().zip(&input.prior) {
            assert_eq!(line.order_id, source.order_id);
            assert_eq!(line.product_id, source.product_id);
            assert_eq!(line.add_to_cart_order, source.add_to_cart_order);
            assert_eq!(line.reordered, source.reordered);
        }
        let first = &enriched.lines[1];
        assert_eq!(first.user_id, Some(10));
        assert_eq!(first.days_since_prior_order, Some(6.0));
        assert_eq!(first.display.product_name.as_deref(), Some("Bananas"));
        assert_eq!(first.display.aisle.as_deref(), Some("fresh fruits"));
        assert_eq!(first.display.department.as_deref(), Some("produce"));
    }

    #[test]
    fn unmatched_lookups_become_missing_not_dropped() {
        let enriched = enrich(&relations());
        let unknown_product = &enriched.lines[2];
        assert_eq!(unknown_product.user_id, Some(10));
        assert_eq!(unknown_product.display, ProductDisplay::default());
        let orphan = &enriched.lines[3];
        assert_eq!(orphan.user_id, None);
        assert_eq!(orphan.display.product_name.as_deref(), Some("Tofu"));
        assert_eq!(orphan.display.aisle, None);

        assert_eq!(
            enriched.summary,
            JoinSummary {
                lines: 4,
                orphan_lines: 1,
                unmatched_products: 1,
                unmatched_aisles: 1,
                unmatched_departments: 0,
            }
        );
        assert_eq!(
            enriched.display_for(100).product_name.as_deref(),
            Some("Bananas")
        );
        assert_eq!(enriched.display_for(12345), ProductDisplay::default());
    }
}
