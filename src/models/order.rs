//! Order line items, the discount engine input. Not persisted by this
//! service; the order service passes them in at calculation time.

use models::{CategoryId, ProductId};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OrderLineItem {
    pub product_id: ProductId,
    pub category_id: CategoryId,
    /// Unit price in minor currency units
    pub unit_price: i64,
    pub quantity: i64,
}

impl OrderLineItem {
    pub fn line_total(&self) -> i64 {
        self.unit_price * self.quantity
    }
}
