//! Models contain all structures that are used in different
//! modules of the app

pub mod coupon_template;
pub mod ids;
pub mod order;
pub mod user_coupon;
pub mod validation_rules;

pub use self::coupon_template::*;
pub use self::ids::*;
pub use self::order::*;
pub use self::user_coupon::*;
