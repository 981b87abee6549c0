use std::fmt;

use serde::{Deserialize, Serialize};

/// Order identifier.
pub type OrderId = u64;
/// User identifier.
pub type UserId = u64;
/// Product identifier.
pub type ProductId = u64;
/// Aisle identifier.
pub type AisleId = u64;
/// Department identifier.
pub type DepartmentId = u64;

/// One customer order. Extra CSV columns (`eval_set`, `order_dow`, ...) are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Primary key.
    pub order_id: OrderId,
    /// Owning user.
    pub user_id: UserId,
    /// Sequence number of the order for its user, starting at 1.
    pub order_number: u32,
    /// Days since the user's previous order; empty for a first order.
    #[serde(default)]
    pub days_since_prior_order: Option<f64>,
}

/// One product line of a prior order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorOrderLine {
    /// Order the line belongs to.
    pub order_id: OrderId,
    /// Product purchased.
    pub product_id: ProductId,
    /// Position at which the product was added to the cart.
    pub add_to_cart_order: u32,
    /// 1 when the user had bought this product before, else 0.
    pub reordered: u8,
}

impl PriorOrderLine {
    /// True when the line is flagged as a reorder.
    #[must_use]
    pub const fn is_reorder(&self) -> bool {
        self.reordered == 1
    }
}

/// Product catalogue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Primary key.
    pub product_id: ProductId,
    /// Display name.
    pub product_name: String,
    /// Aisle the product is shelved in.
    pub aisle_id: AisleId,
    /// Department the product belongs to.
    pub department_id: DepartmentId,
}

/// Aisle lookup entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aisle {
    /// Primary key.
    pub aisle_id: AisleId,
    /// Aisle name.
    pub aisle: String,
}

/// Department lookup entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    /// Primary key.
    pub department_id: DepartmentId,
    /// Department name.
    pub department: String,
}

/// Names of the five input relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// Orders relation.
    Orders,
    /// Prior order lines relation.
    PriorOrderLines,
    /// Products relation.
    Products,
    /// Aisles relation.
    Aisles,
    /// Departments relation.
    Departments,
}

impl RelationKind {
    /// All relations in load order.
    pub const ALL: [Self; 5] = [
        Self::Orders,
        Self::PriorOrderLines,
        Self::Products,
        Self::Aisles,
        Self::Departments,
    ];

    /// Relation name used in logs and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::PriorOrderLines => "prior_order_lines",
            Self::Products => "products",
            Self::Aisles => "aisles",
            Self::Departments => "departments",
        }
    }

    /// Conventional CSV file name for the relation.
    #[must_use]
    pub const fn default_file_name(self) -> &'static str {
        match self {
            Self::Orders => "orders.csv",
            Self::PriorOrderLines => "order_products__prior.csv",
            Self::Products => "products.csv",
            Self::Aisles => "aisles.csv",
            Self::Departments => "departments.csv",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The five relations the pipeline consumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relations {
    /// Orders.
    pub orders: Vec<Order>,
    /// Prior order lines.
    pub prior: Vec<PriorOrderLine>,
    /// Products.
    pub products: Vec<Product>,
    /// Aisles.
    pub aisles: Vec<Aisle>,
    /// Departments.
    pub departments: Vec<Department>,
}

impl Relations {
    /// Row count of a single relation.
    #[must_use]
    pub fn row_count(&self, kind: RelationKind) -> usize {
        match kind {
            RelationKind::Orders => self.orders.len(),
            RelationKind::PriorOrderLines => self.prior.len(),
            RelationKind::Products => self.products.len(),
            RelationKind::Aisles => self.aisles.len(),
            RelationKind::Departments => self.departments.len(),
        }
    }

    /// Row counts keyed by relation name, for logging.
    #[must_use]
    pub fn row_counts(&self) -> serde_json::Value {
        let counts: serde_json::Map<String, serde_json::Value> = RelationKind::ALL
            .iter()
            .map(|kind| (kind.name().to_string(), self.row_count(*kind).into()))
            .collect();
        serde_json::Value::Object(counts)
    }
}
