//! Model user coupons

use std::time::SystemTime;

use models::{CouponCode, CouponTemplateId, OrderId, UserCouponId, UserId};

use schema::user_coupons;

/// DB presenting by claimed coupon instance.
/// The validity window is computed at claim time from the template's
/// validity policy and frozen on this row.
#[derive(Debug, Serialize, Deserialize, Queryable, Clone, Identifiable)]
#[table_name = "user_coupons"]
pub struct UserCoupon {
    pub id: UserCouponId,
    pub template_id: CouponTemplateId,
    pub user_id: UserId,
    pub code: CouponCode,
    pub status: UserCouponStatus,
    pub claimed_at: SystemTime,
    pub valid_from: SystemTime,
    pub valid_to: SystemTime,
    pub order_id: Option<OrderId>,
    pub used_at: Option<SystemTime>,
}

/// Payload for creating user coupon. `order_id` and `used_at` are set only
/// by redemption, never at claim time.
#[derive(Serialize, Deserialize, Insertable, Clone, Debug)]
#[table_name = "user_coupons"]
pub struct NewUserCoupon {
    pub template_id: CouponTemplateId,
    pub user_id: UserId,
    pub code: CouponCode,
    pub status: UserCouponStatus,
    pub claimed_at: SystemTime,
    pub valid_from: SystemTime,
    pub valid_to: SystemTime,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserCouponStatus {
    Unused,
    Used,
    Expired,
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
    use diesel::sql_types::VarChar;
    use diesel::types::{FromSqlRow, IsNull, NotNull, SingleValue, ToSql};

    use super::UserCouponStatus;

    impl NotNull for UserCouponStatus {}
    impl SingleValue for UserCouponStatus {}

    impl FromSqlRow<VarChar, Pg> for UserCouponStatus {
        fn build_from_row<R: Row<Pg>>(row: &mut R) -> Result<Self, Box<Error + Send + Sync>> {
            match row.take() {
                Some(b"unused") => Ok(UserCouponStatus::Unused),
                Some(b"used") => Ok(UserCouponStatus::Used),
                Some(b"expired") => Ok(UserCouponStatus::Expired),
                Some(value) => Err(format!(
                    "Unrecognized enum variant for UserCouponStatus: {}",
                    str::from_utf8(value).unwrap_or("unreadable value")
                ).into()),
                None => Err("Unexpected null for non-null column `status`".into()),
            }
        }
    }

    impl Queryable<VarChar, Pg> for UserCouponStatus {
        type Row = UserCouponStatus;
        fn build(row: Self::Row) -> Self {
            row
        }
    }

    impl ToSql<VarChar, Pg> for UserCouponStatus {
        fn to_sql<W: Write>(&self, out: &mut Output<W, Pg>) -> Result<IsNull, Box<Error + Send + Sync>> {
            match *self {
                UserCouponStatus::Unused => out.write_all(b"unused")?,
                UserCouponStatus::Used => out.write_all(b"used")?,
                UserCouponStatus::Expired => out.write_all(b"expired")?,
            }
            Ok(IsNull::No)
        }
    }

    impl AsExpression<VarChar> for UserCouponStatus {
        type Expression = Bound<VarChar, UserCouponStatus>;
        fn as_expression(self) -> Self::Expression {
            Bound::new(self)
        }
    }

    impl<'a> AsExpression<VarChar> for &'a UserCouponStatus {
        type Expression = Bound<VarChar, &'a UserCouponStatus>;
        fn as_expression(self) -> Self::Expression {
            Bound::new(self)
        }
    }
}
