use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::Connection;

use repos::*;

pub trait ReposFactory<C: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static>:
    Clone + Send + 'static
{
    fn create_coupon_templates_repo<'a>(&self, db_conn: &'a C) -> Box<CouponTemplatesRepo + 'a>;
    fn create_user_coupons_repo<'a>(&self, db_conn: &'a C) -> Box<UserCouponsRepo + 'a>;
}

#[derive(Default, Copy, Clone)]
pub struct ReposFactoryImpl;

impl<C: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> ReposFactory<C> for ReposFactoryImpl {
    fn create_coupon_templates_repo<'a>(&self, db_conn: &'a C) -> Box<CouponTemplatesRepo + 'a> {
        Box::new(CouponTemplatesRepoImpl::new(db_conn)) as Box<CouponTemplatesRepo>
    }

    fn create_user_coupons_repo<'a>(&self, db_conn: &'a C) -> Box<UserCouponsRepo + 'a> {
        Box::new(UserCouponsRepoImpl::new(db_conn)) as Box<UserCouponsRepo>
    }
}
