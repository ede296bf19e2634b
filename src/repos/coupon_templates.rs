use diesel;
use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::query_dsl::RunQueryDsl;
use diesel::result::Error as DieselError;
use diesel::Connection;
use failure::Error as FailureError;
use failure::Fail;

use errors::Error;
use models::{CouponTemplate, CouponTemplateId, NewCouponTemplate, UpdateCouponTemplate};
use repos::types::RepoResult;
use schema::coupon_templates::dsl as Templates;

/// CouponTemplates repository, responsible for handling coupon_templates table
pub struct CouponTemplatesRepoImpl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> {
    pub db_conn: &'a T,
}

pub trait CouponTemplatesRepo {
    /// Creates new coupon template
    fn create(&self, payload: NewCouponTemplate) -> RepoResult<CouponTemplate>;

    /// Get coupon template
    fn get(&self, id_arg: CouponTemplateId) -> RepoResult<Option<CouponTemplate>>;

    /// Get coupon template acquiring a row-level update lock. The lock is
    /// held until the current transaction ends and serializes concurrent
    /// claimants of the same template.
    fn lock_for_update(&self, id_arg: CouponTemplateId) -> RepoResult<Option<CouponTemplate>>;

    /// Atomically increment issued quantity of the template. Returns the
    /// affected rows count: zero means the row is gone and the caller must
    /// abort its transaction.
    fn increment_issued(&self, id_arg: CouponTemplateId) -> RepoResult<usize>;

    /// List all coupon templates
    fn list(&self) -> RepoResult<Vec<CouponTemplate>>;

    /// Update coupon template
    fn update(&self, id_arg: CouponTemplateId, payload: UpdateCouponTemplate) -> RepoResult<CouponTemplate>;
}

impl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> CouponTemplatesRepoImpl<'a, T> {
    pub fn new(db_conn: &'a T) -> Self {
        Self { db_conn }
    }
}

impl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> CouponTemplatesRepo
    for CouponTemplatesRepoImpl<'a, T>
{
    /// Creates new coupon template
    fn create(&self, payload: NewCouponTemplate) -> RepoResult<CouponTemplate> {
        debug!("Create new coupon template {:?}.", payload);

        let query = diesel::insert_into(Templates::coupon_templates).values(&payload);
        query
            .get_result::<CouponTemplate>(self.db_conn)
            .map_err(From::from)
            .map_err(|e: FailureError| {
                e.context(format!("Creates new coupon template: {:?} error occurred", payload))
                    .into()
            })
    }

    /// Get coupon template
    fn get(&self, id_arg: CouponTemplateId) -> RepoResult<Option<CouponTemplate>> {
        debug!("Find in coupon template with id {}.", id_arg);

        let query = Templates::coupon_templates.filter(Templates::id.eq(&id_arg));
        query
            .get_result(self.db_conn)
            .optional()
            .map_err(|e| match e {
                DieselError::DeserializationError(_) => e.context(Error::UnknownCouponType).into(),
                _ => FailureError::from(e),
            }).map_err(|e: FailureError| e.context(format!("Find coupon template by id: {} error occurred", id_arg)).into())
    }

    /// Get coupon template acquiring a row-level update lock
    fn lock_for_update(&self, id_arg: CouponTemplateId) -> RepoResult<Option<CouponTemplate>> {
        debug!("Lock coupon template with id {} for update.", id_arg);

        let query = Templates::coupon_templates.filter(Templates::id.eq(&id_arg)).for_update();
        query
            .get_result(self.db_conn)
            .optional()
            .map_err(From::from)
            .map_err(|e: FailureError| {
                e.context(format!("Lock coupon template by id: {} for update error occurred", id_arg))
                    .into()
            })
    }

    /// Atomically increment issued quantity of the template
    fn increment_issued(&self, id_arg: CouponTemplateId) -> RepoResult<usize> {
        debug!("Increment issued quantity of coupon template with id {}.", id_arg);

        let filtered = Templates::coupon_templates.filter(Templates::id.eq(&id_arg));
        let query = diesel::update(filtered).set(Templates::issued_quantity.eq(Templates::issued_quantity + 1i64));

        query.execute(self.db_conn).map_err(From::from).map_err(|e: FailureError| {
            e.context(format!(
                "Increment issued quantity of coupon template: {} error occurred",
                id_arg
            )).into()
        })
    }

    /// List all coupon templates
    fn list(&self) -> RepoResult<Vec<CouponTemplate>> {
        debug!("Find all coupon templates.");

        let query = Templates::coupon_templates.order(Templates::id);
        query
            .get_results(self.db_conn)
            .map_err(From::from)
            .map_err(|e: FailureError| e.context("List all coupon templates").into())
    }

    /// Update coupon template
    fn update(&self, id_arg: CouponTemplateId, payload: UpdateCouponTemplate) -> RepoResult<CouponTemplate> {
        debug!("Updating coupon template with id {} and payload {:?}.", id_arg, payload);

        let filtered = Templates::coupon_templates.filter(Templates::id.eq(&id_arg));
        let query = diesel::update(filtered).set(&payload);

        query
            .get_result::<CouponTemplate>(self.db_conn)
            .map_err(From::from)
            .map_err(|e: FailureError| {
                e.context(format!(
                    "Updates specific coupon template: id: {}, payload: {:?}, error occurred",
                    id_arg, payload
                )).into()
            })
    }
}
