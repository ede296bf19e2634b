//! Model coupon templates

use std::time::{Duration, SystemTime};

use validator::Validate;

use models::validation_rules::*;
use models::{CategoryId, CouponTemplateId, ProductId};

use schema::coupon_templates;

const SECONDS_PER_DAY: u64 = 86_400;

/// DB presenting by coupon template
#[derive(Debug, Serialize, Deserialize, Queryable, Clone, Identifiable)]
#[table_name = "coupon_templates"]
pub struct CouponTemplate {
    pub id: CouponTemplateId,
    pub title: String,
    pub scope: CouponScope,
    pub rules: CouponRules,
    pub validity: CouponValidity,
    pub total_quantity: i64,
    pub issued_quantity: i64,
    pub per_user_limit: i64,
    pub status: TemplateStatus,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl CouponTemplate {
    /// Value of `total_quantity` meaning that the template stock is not bounded
    pub const UNLIMITED: i64 = 0;
}

/// Payload for creating coupon template.
/// `issued_quantity` and `status` are assigned by the server and are not
/// part of the payload.
#[derive(Serialize, Deserialize, Insertable, Clone, Validate, Debug)]
#[table_name = "coupon_templates"]
pub struct NewCouponTemplate {
    #[validate(custom = "validate_not_blank_title")]
    pub title: String,
    pub scope: CouponScope,
    pub rules: CouponRules,
    pub validity: CouponValidity,
    #[validate(custom = "validate_non_negative_quantity")]
    pub total_quantity: i64,
    #[validate(range(min = "1", max = "9223372036854775807"))]
    pub per_user_limit: i64,
}

/// Payload for updating coupon template. Rules, scope and validity of a
/// published template are frozen; already-issued coupons are never touched.
#[derive(Serialize, Deserialize, Insertable, AsChangeset, Validate, Debug)]
#[table_name = "coupon_templates"]
pub struct UpdateCouponTemplate {
    #[validate(custom = "validate_not_blank_title")]
    pub title: Option<String>,
    #[validate(range(min = "0", max = "9223372036854775807"))]
    pub total_quantity: Option<i64>,
    #[validate(range(min = "1", max = "9223372036854775807"))]
    pub per_user_limit: Option<i64>,
    pub status: Option<TemplateStatus>,
}

/// Subset of the order items the coupon is allowed to discount
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CouponScope {
    All,
    Categories(Vec<CategoryId>),
    Products(Vec<ProductId>),
}

/// Discount rule set; the `kind` tag selects the discount formula.
/// Thresholds, amounts and deduction caps are in minor currency units,
/// `percent` is percent-points off. `max_deduction` of zero is unbounded.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CouponRules {
    FullReduction { threshold: i64, amount: i64 },
    PercentDiscount { threshold: i64, percent: i64, max_deduction: i64 },
    Unconditional { amount: i64 },
}

/// Validity policy of coupons issued from the template
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouponValidity {
    FixedWindow { valid_from: SystemTime, valid_to: SystemTime },
    Relative { valid_days_after_claim: i64 },
}

impl CouponValidity {
    /// Validity window of a coupon claimed at `now`. Fixed windows are
    /// copied verbatim, relative windows open at claim time. The window is
    /// frozen on the issued coupon: later template edits must not alter it.
    pub fn window_at(&self, now: SystemTime) -> (SystemTime, SystemTime) {
        match *self {
            CouponValidity::FixedWindow { valid_from, valid_to } => (valid_from, valid_to),
            CouponValidity::Relative { valid_days_after_claim } => (
                now,
                now + Duration::from_secs(valid_days_after_claim as u64 * SECONDS_PER_DAY),
            ),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TemplateStatus {
    Available,
    Disabled,
}

mod diesel_impl {
    use std::error::Error;
    use std::io::Write;
    use std::str;

    use diesel::deserialize::Queryable;
    use diesel::expression::bound::Bound;
    use diesel::expression::AsExpression;
    use diesel::pg::Pg;
    use diesel::row::Row;
    use diesel::serialize::Output;
    use diesel::sql_types::{Jsonb, VarChar};
    use diesel::types::{FromSql, FromSqlRow, IsNull, NotNull, SingleValue, ToSql};
    use serde_json;

    use super::{CouponRules, CouponScope, CouponValidity, TemplateStatus};

    /// Tagged payload columns travel as jsonb and are (de)serialized
    /// through serde
    macro_rules! jsonb_column_impls {
        ($t:ty) => {
            impl NotNull for $t {}
            impl SingleValue for $t {}

            impl FromSqlRow<Jsonb, Pg> for $t {
                fn build_from_row<R: Row<Pg>>(row: &mut R) -> Result<Self, Box<Error + Send + Sync>> {
                    let value = <serde_json::Value as FromSql<Jsonb, Pg>>::from_sql(row.take())?;
                    serde_json::from_value(value).map_err(|e| format!("Unrecognized payload: {}", e).into())
                }
            }

            impl Queryable<Jsonb, Pg> for $t {
                type Row = $t;
                fn build(row: Self::Row) -> Self {
                    row
                }
            }

            impl ToSql<Jsonb, Pg> for $t {
                fn to_sql<W: Write>(&self, out: &mut Output<W, Pg>) -> Result<IsNull, Box<Error + Send + Sync>> {
                    let value = serde_json::to_value(self)?;
                    <serde_json::Value as ToSql<Jsonb, Pg>>::to_sql(&value, out)
                }
            }

            impl AsExpression<Jsonb> for $t {
                type Expression = Bound<Jsonb, $t>;
                fn as_expression(self) -> Self::Expression {
                    Bound::new(self)
                }
            }

            impl<'a> AsExpression<Jsonb> for &'a $t {
                type Expression = Bound<Jsonb, &'a $t>;
                fn as_expression(self) -> Self::Expression {
                    Bound::new(self)
                }
            }
        };
    }

    jsonb_column_impls!(CouponScope);
    jsonb_column_impls!(CouponRules);
    jsonb_column_impls!(CouponValidity);

    impl NotNull for TemplateStatus {}
    impl SingleValue for TemplateStatus {}

    impl FromSqlRow<VarChar, Pg> for TemplateStatus {
        fn build_from_row<R: Row<Pg>>(row: &mut R) -> Result<Self, Box<Error + Send + Sync>> {
            match row.take() {
                Some(b"available") => Ok(TemplateStatus::Available),
                Some(b"disabled") => Ok(TemplateStatus::Disabled),
                Some(value) => Err(format!(
                    "Unrecognized enum variant for TemplateStatus: {}",
                    str::from_utf8(value).unwrap_or("unreadable value")
                ).into()),
                None => Err("Unexpected null for non-null column `status`".into()),
            }
        }
    }

    impl Queryable<VarChar, Pg> for TemplateStatus {
        type Row = TemplateStatus;
        fn build(row: Self::Row) -> Self {
            row
        }
    }

    impl ToSql<VarChar, Pg> for TemplateStatus {
        fn to_sql<W: Write>(&self, out: &mut Output<W, Pg>) -> Result<IsNull, Box<Error + Send + Sync>> {
            match *self {
                TemplateStatus::Available => out.write_all(b"available")?,
                TemplateStatus::Disabled => out.write_all(b"disabled")?,
            }
            Ok(IsNull::No)
        }
    }

    impl AsExpression<VarChar> for TemplateStatus {
        type Expression = Bound<VarChar, TemplateStatus>;
        fn as_expression(self) -> Self::Expression {
            Bound::new(self)
        }
    }

    impl<'a> AsExpression<VarChar> for &'a TemplateStatus {
        type Expression = Bound<VarChar, &'a TemplateStatus>;
        fn as_expression(self) -> Self::Expression {
            Bound::new(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use serde_json;

    use super::*;

    #[test]
    fn test_rules_payload_is_tagged_by_kind() {
        let rules = CouponRules::PercentDiscount {
            threshold: 0,
            percent: 12,
            max_deduction: 2000,
        };
        let value = serde_json::to_value(&rules).unwrap();
        assert_eq!(value["kind"], "percent_discount");
        assert_eq!(serde_json::from_value::<CouponRules>(value).unwrap(), rules);
    }

    #[test]
    fn test_rules_payload_with_unknown_kind_is_rejected() {
        let value = json!({ "kind": "buy_one_get_one", "amount": 100 });
        assert!(serde_json::from_value::<CouponRules>(value).is_err());
    }

    #[test]
    fn test_fixed_window_is_copied_verbatim() {
        let valid_from = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let valid_to = SystemTime::UNIX_EPOCH + Duration::from_secs(2_000);
        let validity = CouponValidity::FixedWindow { valid_from, valid_to };

        assert_eq!(validity.window_at(SystemTime::now()), (valid_from, valid_to));
    }

    #[test]
    fn test_relative_window_opens_at_claim_time() {
        let validity = CouponValidity::Relative { valid_days_after_claim: 7 };
        let now = SystemTime::now();

        let (valid_from, valid_to) = validity.window_at(now);
        assert_eq!(valid_from, now);
        assert_eq!(valid_to, now + Duration::from_secs(7 * 86_400));
    }
}
