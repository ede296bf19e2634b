use std::time::SystemTime;

use diesel;
use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::query_dsl::RunQueryDsl;
use diesel::Connection;
use failure::Error as FailureError;

use models::{CouponCode, CouponTemplateId, NewUserCoupon, OrderId, UserCoupon, UserCouponId, UserCouponStatus, UserId};
use repos::types::RepoResult;
use schema::user_coupons::dsl as DslUserCoupons;

/// UserCoupons repository, responsible for handling user_coupons table
pub struct UserCouponsRepoImpl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> {
    pub db_conn: &'a T,
}

pub trait UserCouponsRepo {
    /// Creates new user coupon
    fn create(&self, payload: NewUserCoupon) -> RepoResult<UserCoupon>;

    /// Count claims of the user against the template. The count runs on the
    /// claim transaction's connection and sees its in-flight rows.
    fn count_for_user(&self, user_id_arg: UserId, template_id_arg: CouponTemplateId) -> RepoResult<i64>;

    /// Get user coupon by code
    fn get_by_code(&self, user_id_arg: UserId, code_arg: CouponCode) -> RepoResult<Option<UserCoupon>>;

    /// List coupons claimed by the user
    fn list_for_user(&self, user_id_arg: UserId) -> RepoResult<Vec<UserCoupon>>;

    /// Mark unused coupon as used by the order. Returns the affected rows
    /// count: zero means the coupon was not unused anymore.
    fn mark_used(&self, id_arg: UserCouponId, order_id_arg: OrderId, now_arg: SystemTime) -> RepoResult<usize>;

    /// Mark all overdue unused coupons as expired, returns affected rows count
    fn mark_expired(&self, now_arg: SystemTime) -> RepoResult<usize>;
}

impl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> UserCouponsRepoImpl<'a, T> {
    pub fn new(db_conn: &'a T) -> Self {
        Self { db_conn }
    }
}

impl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> UserCouponsRepo
    for UserCouponsRepoImpl<'a, T>
{
    /// Creates new user coupon
    fn create(&self, payload: NewUserCoupon) -> RepoResult<UserCoupon> {
        debug!("Create new user coupon record {:?}.", payload);
        let mut payload = payload;
        payload.code = CouponCode(payload.code.0.to_uppercase());

        let query = diesel::insert_into(DslUserCoupons::user_coupons).values(&payload);
        query
            .get_result::<UserCoupon>(self.db_conn)
            .map_err(From::from)
            .map_err(|e: FailureError| {
                e.context(format!("Creates new user coupon record: {:?} error occurred", payload))
                    .into()
            })
    }

    /// Count claims of the user against the template
    fn count_for_user(&self, user_id_arg: UserId, template_id_arg: CouponTemplateId) -> RepoResult<i64> {
        debug!("Count claims of user {} against template {}.", user_id_arg, template_id_arg);

        let query = DslUserCoupons::user_coupons
            .filter(DslUserCoupons::user_id.eq(&user_id_arg))
            .filter(DslUserCoupons::template_id.eq(&template_id_arg))
            .count();

        query.get_result::<i64>(self.db_conn).map_err(From::from).map_err(|e: FailureError| {
            e.context(format!(
                "Count claims of user: {} against template: {} error occurred",
                user_id_arg, template_id_arg
            )).into()
        })
    }

    /// Get user coupon by code
    fn get_by_code(&self, user_id_arg: UserId, code_arg: CouponCode) -> RepoResult<Option<UserCoupon>> {
        debug!("Find in user coupon with code {} for user {}.", code_arg, user_id_arg);
        let code_arg = CouponCode(code_arg.0.to_uppercase());

        let query = DslUserCoupons::user_coupons
            .filter(DslUserCoupons::user_id.eq(&user_id_arg))
            .filter(DslUserCoupons::code.eq(&code_arg));

        query
            .get_result(self.db_conn)
            .optional()
            .map_err(From::from)
            .map_err(|e: FailureError| {
                e.context(format!(
                    "Find user coupon by code: {} for user: {} error occurred",
                    code_arg, user_id_arg
                )).into()
            })
    }

    /// List coupons claimed by the user
    fn list_for_user(&self, user_id_arg: UserId) -> RepoResult<Vec<UserCoupon>> {
        debug!("Find all coupons of user {}.", user_id_arg);

        let query = DslUserCoupons::user_coupons
            .filter(DslUserCoupons::user_id.eq(&user_id_arg))
            .order(DslUserCoupons::id);

        query
            .get_results(self.db_conn)
            .map_err(From::from)
            .map_err(|e: FailureError| e.context(format!("List coupons of user {} error occurred", user_id_arg)).into())
    }

    /// Mark unused coupon as used by the order
    fn mark_used(&self, id_arg: UserCouponId, order_id_arg: OrderId, now_arg: SystemTime) -> RepoResult<usize> {
        debug!("Mark user coupon {} as used by order {}.", id_arg, order_id_arg);

        let filtered = DslUserCoupons::user_coupons
            .filter(DslUserCoupons::id.eq(&id_arg))
            .filter(DslUserCoupons::status.eq(UserCouponStatus::Unused));
        let query = diesel::update(filtered).set((
            DslUserCoupons::status.eq(UserCouponStatus::Used),
            DslUserCoupons::order_id.eq(Some(order_id_arg)),
            DslUserCoupons::used_at.eq(Some(now_arg)),
        ));

        query.execute(self.db_conn).map_err(From::from).map_err(|e: FailureError| {
            e.context(format!(
                "Mark user coupon: {} as used by order: {} error occurred",
                id_arg, order_id_arg
            )).into()
        })
    }

    /// Mark all overdue unused coupons as expired
    fn mark_expired(&self, now_arg: SystemTime) -> RepoResult<usize> {
        debug!("Mark overdue user coupons as expired.");

        let filtered = DslUserCoupons::user_coupons
            .filter(DslUserCoupons::status.eq(UserCouponStatus::Unused))
            .filter(DslUserCoupons::valid_to.lt(&now_arg));
        let query = diesel::update(filtered).set(DslUserCoupons::status.eq(UserCouponStatus::Expired));

        query
            .execute(self.db_conn)
            .map_err(From::from)
            .map_err(|e: FailureError| e.context("Mark overdue user coupons as expired error occurred").into())
    }
}
