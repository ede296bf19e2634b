//! Error taxonomy of the coupons service

use validator::ValidationErrors;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "Not found")]
    NotFound,
    #[fail(display = "Parse error")]
    Parse,
    #[fail(display = "Validation error: {}", _0)]
    Validate(ValidationErrors),
    #[fail(display = "Invalid discount rule")]
    InvalidRule,
    #[fail(display = "Server is refusing to fullfil the request")]
    Forbidden,
    #[fail(display = "Coupon template is not available for claims")]
    TemplateUnavailable,
    #[fail(display = "Coupon stock exhausted")]
    StockExhausted,
    #[fail(display = "Per-user claim limit reached")]
    PerUserLimitReached,
    #[fail(display = "Invalid coupon code")]
    InvalidCode,
    #[fail(display = "Coupon is already consumed")]
    AlreadyConsumed,
    #[fail(display = "Coupon is out of its validity window")]
    OutOfValidityWindow,
    #[fail(display = "No items of the order are covered by the coupon")]
    NoApplicableItems,
    #[fail(display = "Order total is below coupon threshold {}", _0)]
    ThresholdNotMet(String),
    #[fail(display = "Unknown coupon type")]
    UnknownCouponType,
    #[fail(display = "Connection error")]
    Connection,
}
