//! Coupons Services, presents claim and discount operations with coupon templates

use std::borrow::Cow;
use std::collections::HashMap;
use std::time::SystemTime;

use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::Connection;
use r2d2::ManageConnection;

use failure::Error as FailureError;
use futures::future;

use uuid::prelude::*;
use validator::{Validate, ValidationError, ValidationErrors};

use super::types::ServiceFuture;
use errors::Error;
use models::*;
use repos::ReposFactory;
use services::Service;

pub trait CouponsService {
    /// Creates new coupon template
    fn create_coupon_template(&self, payload: NewCouponTemplate) -> ServiceFuture<CouponTemplate>;
    /// Returns coupon template by id
    fn get_coupon_template(&self, template_id_arg: CouponTemplateId) -> ServiceFuture<Option<CouponTemplate>>;
    /// Returns all coupon templates
    fn list_coupon_templates(&self) -> ServiceFuture<Vec<CouponTemplate>>;
    /// Update coupon template
    fn update_coupon_template(&self, template_id_arg: CouponTemplateId, payload: UpdateCouponTemplate) -> ServiceFuture<CouponTemplate>;
    /// Claims one coupon of the template for the current user
    fn claim_coupon(&self, template_id_arg: CouponTemplateId) -> ServiceFuture<UserCoupon>;
    /// Returns coupons claimed by the current user
    fn list_user_coupons(&self) -> ServiceFuture<Vec<UserCoupon>>;
    /// Calculates the deduction of the current user's coupon applied to the order items
    fn calculate_discount(&self, code_arg: CouponCode, items: Vec<OrderLineItem>) -> ServiceFuture<i64>;
    /// Marks the current user's coupon as used by the order
    fn redeem_coupon(&self, code_arg: CouponCode, order_id_arg: OrderId) -> ServiceFuture<UserCoupon>;
    /// Marks all overdue unused coupons as expired
    fn expire_user_coupons(&self) -> ServiceFuture<usize>;
}

impl<
        T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
        M: ManageConnection<Connection = T>,
        F: ReposFactory<T>,
    > CouponsService for Service<T, M, F>
{
    /// Creates new coupon template
    fn create_coupon_template(&self, payload: NewCouponTemplate) -> ServiceFuture<CouponTemplate> {
        let repo_factory = self.static_context.repo_factory.clone();

        if let Err(errors) = payload.validate() {
            return Box::new(future::err(
                format_err!("Invalid new coupon template payload.")
                    .context(Error::Validate(errors))
                    .into(),
            ));
        }
        if let Err(e) = validate_template_rules(&payload.rules) {
            return Box::new(future::err(e));
        }
        if let Err(e) = validate_template_validity(&payload.validity) {
            return Box::new(future::err(e));
        }

        self.spawn_on_pool(move |conn| {
            let templates_repo = repo_factory.create_coupon_templates_repo(&*conn);
            conn.transaction::<CouponTemplate, FailureError, _>(move || templates_repo.create(payload))
                .map_err(|e| e.context("Service Coupons, create_coupon_template endpoint error occurred.").into())
        })
    }

    /// Returns coupon template by id
    fn get_coupon_template(&self, template_id_arg: CouponTemplateId) -> ServiceFuture<Option<CouponTemplate>> {
        let repo_factory = self.static_context.repo_factory.clone();

        self.spawn_on_pool(move |conn| {
            let templates_repo = repo_factory.create_coupon_templates_repo(&*conn);

            templates_repo
                .get(template_id_arg)
                .map_err(|e| e.context("Service Coupons, get_coupon_template endpoint error occurred.").into())
        })
    }

    /// Returns all coupon templates
    fn list_coupon_templates(&self) -> ServiceFuture<Vec<CouponTemplate>> {
        let repo_factory = self.static_context.repo_factory.clone();

        self.spawn_on_pool(move |conn| {
            let templates_repo = repo_factory.create_coupon_templates_repo(&*conn);

            templates_repo
                .list()
                .map_err(|e| e.context("Service Coupons, list_coupon_templates endpoint error occurred.").into())
        })
    }

    /// Update coupon template
    fn update_coupon_template(&self, template_id_arg: CouponTemplateId, payload: UpdateCouponTemplate) -> ServiceFuture<CouponTemplate> {
        let repo_factory = self.static_context.repo_factory.clone();

        if let Err(errors) = payload.validate() {
            return Box::new(future::err(
                format_err!("Invalid update coupon template payload.")
                    .context(Error::Validate(errors))
                    .into(),
            ));
        }

        self.spawn_on_pool(move |conn| {
            let templates_repo = repo_factory.create_coupon_templates_repo(&*conn);

            templates_repo
                .update(template_id_arg, payload)
                .map_err(|e| e.context("Service Coupons, update_coupon_template endpoint error occurred.").into())
        })
    }

    /// Claims one coupon of the template for the current user.
    /// The whole claim is one transaction: the template row lock serializes
    /// claimants of the same template, and the per-user count runs under
    /// that lock. Any failure rolls back both the coupon row and the
    /// issued counter.
    fn claim_coupon(&self, template_id_arg: CouponTemplateId) -> ServiceFuture<UserCoupon> {
        let repo_factory = self.static_context.repo_factory.clone();

        let user_id = match self.dynamic_context.user_id {
            Some(user_id) => user_id,
            None => {
                return Box::new(future::err(
                    format_err!("Denied request to claim coupon for unauthorized user")
                        .context(Error::Forbidden)
                        .into(),
                ));
            }
        };

        self.spawn_on_pool(move |conn| {
            let templates_repo = repo_factory.create_coupon_templates_repo(&*conn);
            let user_coupons_repo = repo_factory.create_user_coupons_repo(&*conn);

            conn.transaction::<UserCoupon, FailureError, _>(move || {
                let template = match templates_repo.lock_for_update(template_id_arg)? {
                    Some(template) => template,
                    None => {
                        return Err(format_err!("Coupon template {} not found", template_id_arg)
                            .context(Error::NotFound)
                            .into());
                    }
                };

                if template.status != TemplateStatus::Available {
                    return Err(format_err!("Coupon template {} is not available", template_id_arg)
                        .context(Error::TemplateUnavailable)
                        .into());
                }

                if template.total_quantity != CouponTemplate::UNLIMITED && template.issued_quantity >= template.total_quantity {
                    return Err(format_err!(
                        "Coupon template {} has no stock left: {} of {} issued",
                        template_id_arg,
                        template.issued_quantity,
                        template.total_quantity
                    ).context(Error::StockExhausted)
                    .into());
                }

                let claimed = user_coupons_repo.count_for_user(user_id, template_id_arg)?;
                if claimed >= template.per_user_limit {
                    return Err(format_err!(
                        "User {} already claimed {} of {} allowed coupons of template {}",
                        user_id,
                        claimed,
                        template.per_user_limit,
                        template_id_arg
                    ).context(Error::PerUserLimitReached)
                    .into());
                }

                let now = SystemTime::now();
                let (valid_from, valid_to) = template.validity.window_at(now);

                let user_coupon = user_coupons_repo.create(NewUserCoupon {
                    template_id: template_id_arg,
                    user_id,
                    code: generate_coupon_code(),
                    status: UserCouponStatus::Unused,
                    claimed_at: now,
                    valid_from,
                    valid_to,
                })?;

                let updated = templates_repo.increment_issued(template_id_arg)?;
                if updated == 0 {
                    return Err(format_err!("Coupon template {} disappeared during claim", template_id_arg)
                        .context(Error::NotFound)
                        .into());
                }

                Ok(user_coupon)
            }).map_err(|e| e.context("Service Coupons, claim_coupon endpoint error occurred.").into())
        })
    }

    /// Returns coupons claimed by the current user
    fn list_user_coupons(&self) -> ServiceFuture<Vec<UserCoupon>> {
        let repo_factory = self.static_context.repo_factory.clone();

        let user_id = match self.dynamic_context.user_id {
            Some(user_id) => user_id,
            None => {
                return Box::new(future::err(
                    format_err!("Denied request to list coupons for unauthorized user")
                        .context(Error::Forbidden)
                        .into(),
                ));
            }
        };

        self.spawn_on_pool(move |conn| {
            let user_coupons_repo = repo_factory.create_user_coupons_repo(&*conn);

            user_coupons_repo
                .list_for_user(user_id)
                .map_err(|e| e.context("Service Coupons, list_user_coupons endpoint error occurred.").into())
        })
    }

    /// Calculates the deduction of the current user's coupon applied to the
    /// order items. Read only: redemption is a separate settlement step.
    fn calculate_discount(&self, code_arg: CouponCode, items: Vec<OrderLineItem>) -> ServiceFuture<i64> {
        let repo_factory = self.static_context.repo_factory.clone();

        let user_id = match self.dynamic_context.user_id {
            Some(user_id) => user_id,
            None => {
                return Box::new(future::err(
                    format_err!("Denied request to calculate discount for unauthorized user")
                        .context(Error::Forbidden)
                        .into(),
                ));
            }
        };

        self.spawn_on_pool(move |conn| {
            {
                let templates_repo = repo_factory.create_coupon_templates_repo(&*conn);
                let user_coupons_repo = repo_factory.create_user_coupons_repo(&*conn);

                let user_coupon = match user_coupons_repo.get_by_code(user_id, code_arg.clone())? {
                    Some(user_coupon) => user_coupon,
                    None => {
                        return Err(format_err!("No coupon with code {} claimed by user {}", code_arg, user_id)
                            .context(Error::InvalidCode)
                            .into());
                    }
                };

                validate_user_coupon(&user_coupon, SystemTime::now())?;

                let template = match templates_repo.get(user_coupon.template_id)? {
                    Some(template) => template,
                    None => {
                        return Err(format_err!(
                            "Coupon template {} of coupon code {} is gone",
                            user_coupon.template_id,
                            code_arg
                        ).context(Error::NotFound)
                        .into());
                    }
                };

                calculate_coupon_deduction(&template, &items)
            }.map_err(|e: FailureError| e.context("Service Coupons, calculate_discount endpoint error occurred.").into())
        })
    }

    /// Marks the current user's coupon as used by the order
    fn redeem_coupon(&self, code_arg: CouponCode, order_id_arg: OrderId) -> ServiceFuture<UserCoupon> {
        let repo_factory = self.static_context.repo_factory.clone();

        let user_id = match self.dynamic_context.user_id {
            Some(user_id) => user_id,
            None => {
                return Box::new(future::err(
                    format_err!("Denied request to redeem coupon for unauthorized user")
                        .context(Error::Forbidden)
                        .into(),
                ));
            }
        };

        self.spawn_on_pool(move |conn| {
            let user_coupons_repo = repo_factory.create_user_coupons_repo(&*conn);

            conn.transaction::<UserCoupon, FailureError, _>(move || {
                let user_coupon = match user_coupons_repo.get_by_code(user_id, code_arg.clone())? {
                    Some(user_coupon) => user_coupon,
                    None => {
                        return Err(format_err!("No coupon with code {} claimed by user {}", code_arg, user_id)
                            .context(Error::InvalidCode)
                            .into());
                    }
                };

                let now = SystemTime::now();
                validate_user_coupon(&user_coupon, now)?;

                let updated = user_coupons_repo.mark_used(user_coupon.id, order_id_arg, now)?;
                if updated == 0 {
                    return Err(format_err!("Coupon {} is not unused anymore", code_arg)
                        .context(Error::AlreadyConsumed)
                        .into());
                }

                match user_coupons_repo.get_by_code(user_id, code_arg.clone())? {
                    Some(user_coupon) => Ok(user_coupon),
                    None => Err(format_err!("Coupon {} is gone after redemption", code_arg)
                        .context(Error::NotFound)
                        .into()),
                }
            }).map_err(|e| e.context("Service Coupons, redeem_coupon endpoint error occurred.").into())
        })
    }

    /// Marks all overdue unused coupons as expired
    fn expire_user_coupons(&self) -> ServiceFuture<usize> {
        let repo_factory = self.static_context.repo_factory.clone();

        self.spawn_on_pool(move |conn| {
            let user_coupons_repo = repo_factory.create_user_coupons_repo(&*conn);

            user_coupons_repo
                .mark_expired(SystemTime::now())
                .map_err(|e| e.context("Service Coupons, expire_user_coupons endpoint error occurred.").into())
        })
    }
}

/// Coupon codes are 128-bit random tokens: collisions are negligible and
/// the code carries no information about other issued coupons
pub fn generate_coupon_code() -> CouponCode {
    CouponCode(Uuid::new_v4().simple().to_string().to_uppercase())
}

/// Status and validity-window gates of an already claimed coupon
pub fn validate_user_coupon(user_coupon: &UserCoupon, now: SystemTime) -> Result<(), FailureError> {
    if user_coupon.status != UserCouponStatus::Unused {
        return Err(format_err!("Coupon {} is {:?}", user_coupon.code, user_coupon.status)
            .context(Error::AlreadyConsumed)
            .into());
    }

    if now < user_coupon.valid_from || now > user_coupon.valid_to {
        return Err(format_err!("Coupon {} is outside of its validity window", user_coupon.code)
            .context(Error::OutOfValidityWindow)
            .into());
    }

    Ok(())
}

/// Part of the order the coupon scope covers, in minor currency units
pub fn applicable_total(scope: &CouponScope, items: &[OrderLineItem]) -> i64 {
    items
        .iter()
        .filter(|item| match *scope {
            CouponScope::All => true,
            CouponScope::Categories(ref ids) => ids.contains(&item.category_id),
            CouponScope::Products(ref ids) => ids.contains(&item.product_id),
        }).map(OrderLineItem::line_total)
        .sum()
}

/// Deduction of the coupon template rules applied to the order items.
/// The deduction never exceeds the applicable part of the order.
pub fn calculate_coupon_deduction(template: &CouponTemplate, items: &[OrderLineItem]) -> Result<i64, FailureError> {
    let total = applicable_total(&template.scope, items);
    if total == 0 {
        return Err(format_err!("No items of the order are covered by coupon template {}", template.id)
            .context(Error::NoApplicableItems)
            .into());
    }

    let deduction = match template.rules {
        CouponRules::FullReduction { threshold, amount } => {
            if total < threshold {
                return Err(threshold_not_met(threshold));
            }
            amount
        }
        CouponRules::PercentDiscount {
            threshold,
            percent,
            max_deduction,
        } => {
            if total < threshold {
                return Err(threshold_not_met(threshold));
            }
            // truncated towards zero to whole minor units
            let raw = total * (100 - percent) / 100;
            if max_deduction > 0 && raw > max_deduction {
                max_deduction
            } else {
                raw
            }
        }
        CouponRules::Unconditional { amount } => amount,
    };

    Ok(deduction.min(total))
}

fn threshold_not_met(threshold: i64) -> FailureError {
    format_err!("Order total is below coupon threshold")
        .context(Error::ThresholdNotMet(format_minor_units(threshold)))
        .into()
}

/// Minor units formatted for user display, e.g. 10000 -> "100.00"
fn format_minor_units(amount: i64) -> String {
    format!("{}.{:02}", amount / 100, (amount % 100).abs())
}

/// Template-level rule checks spanning multiple fields of the payload
fn validate_template_rules(rules: &CouponRules) -> Result<(), FailureError> {
    match *rules {
        CouponRules::FullReduction { threshold, amount } => {
            if threshold < 0 || amount < 0 {
                return Err(invalid_rule("Threshold and amount must be non negative."));
            }
            // a reduction must stay below the spending it is conditioned on
            if amount >= threshold {
                return Err(invalid_rule("Full reduction amount must be less than its threshold."));
            }
        }
        CouponRules::PercentDiscount {
            threshold,
            percent,
            max_deduction,
        } => {
            if threshold < 0 || max_deduction < 0 {
                return Err(invalid_rule("Threshold and deduction cap must be non negative."));
            }
            if percent < 0 || percent > 100 {
                return Err(invalid_rule("Percent must be between 0 and 100."));
            }
        }
        CouponRules::Unconditional { amount } => {
            if amount < 0 {
                return Err(invalid_rule("Amount must be non negative."));
            }
        }
    }

    Ok(())
}

/// Validity invariants of the template payload
fn validate_template_validity(validity: &CouponValidity) -> Result<(), FailureError> {
    match *validity {
        CouponValidity::FixedWindow { valid_from, valid_to } => {
            if valid_to <= valid_from {
                return Err(invalid_validity("Validity window must end after it starts."));
            }
        }
        CouponValidity::Relative { valid_days_after_claim } => {
            if valid_days_after_claim <= 0 {
                return Err(invalid_validity("Validity days after claim must be positive."));
            }
        }
    }

    Ok(())
}

fn invalid_rule(message: &'static str) -> FailureError {
    format_err!("{}", message).context(Error::InvalidRule).into()
}

fn invalid_validity(message: &'static str) -> FailureError {
    let mut errors = ValidationErrors::new();
    errors.add(
        "validity",
        ValidationError {
            code: Cow::from("validity"),
            message: Some(Cow::from(message)),
            params: HashMap::new(),
        },
    );

    format_err!("Invalid coupon template validity.").context(Error::Validate(errors)).into()
}

#[cfg(test)]
pub mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, SystemTime};

    use failure::{Context, Error as FailureError};
    use tokio_core::reactor::Core;

    use errors::Error;
    use models::*;
    use repos::repo_factory::tests::*;
    use services::coupons::*;

    /// Digs the service error variant out of the failure context chain
    fn service_error(err: &FailureError) -> Option<&Error> {
        err.iter_chain()
            .filter_map(|fail| {
                fail.downcast_ref::<Error>()
                    .or_else(|| fail.downcast_ref::<Context<Error>>().map(Context::get_context))
            }).next()
    }

    fn window_around_now() -> CouponValidity {
        let now = SystemTime::now();
        CouponValidity::FixedWindow {
            valid_from: now - Duration::from_secs(3_600),
            valid_to: now + Duration::from_secs(3_600),
        }
    }

    fn new_template(rules: CouponRules, scope: CouponScope, validity: CouponValidity, total_quantity: i64, per_user_limit: i64) -> NewCouponTemplate {
        NewCouponTemplate {
            title: "10 off".to_string(),
            scope,
            rules,
            validity,
            total_quantity,
            per_user_limit,
        }
    }

    fn unconditional_template(amount: i64) -> NewCouponTemplate {
        new_template(
            CouponRules::Unconditional { amount },
            CouponScope::All,
            window_around_now(),
            CouponTemplate::UNLIMITED,
            10,
        )
    }

    fn line_item(product_id: i64, category_id: i64, unit_price: i64, quantity: i64) -> OrderLineItem {
        OrderLineItem {
            product_id: ProductId(product_id),
            category_id: CategoryId(category_id),
            unit_price,
            quantity,
        }
    }

    #[test]
    fn test_create_coupon_template() {
        let mut core = Core::new().unwrap();
        let service = create_service(Some(MOCK_USER_ID));
        let work = service.create_coupon_template(unconditional_template(500));
        let result = core.run(work).unwrap();
        assert_eq!(result.id, CouponTemplateId(1));
        assert_eq!(result.issued_quantity, 0);
        assert_eq!(result.status, TemplateStatus::Available);
    }

    #[test]
    fn test_create_coupon_template_with_blank_title() {
        let mut core = Core::new().unwrap();
        let service = create_service(Some(MOCK_USER_ID));
        let mut payload = unconditional_template(500);
        payload.title = "  ".to_string();
        let work = service.create_coupon_template(payload);
        let err = core.run(work).unwrap_err();
        match service_error(&err) {
            Some(&Error::Validate(_)) => {}
            other => panic!("Expected Validate, got {:?}", other),
        }
    }

    #[test]
    fn test_create_coupon_template_with_backwards_window() {
        let mut core = Core::new().unwrap();
        let service = create_service(Some(MOCK_USER_ID));
        let now = SystemTime::now();
        let mut payload = unconditional_template(500);
        payload.validity = CouponValidity::FixedWindow {
            valid_from: now,
            valid_to: now - Duration::from_secs(60),
        };
        let work = service.create_coupon_template(payload);
        let err = core.run(work).unwrap_err();
        match service_error(&err) {
            Some(&Error::Validate(_)) => {}
            other => panic!("Expected Validate, got {:?}", other),
        }
    }

    #[test]
    fn test_create_full_reduction_template_with_amount_at_threshold() {
        let mut core = Core::new().unwrap();
        let service = create_service(Some(MOCK_USER_ID));
        let payload = new_template(
            CouponRules::FullReduction {
                threshold: 1000,
                amount: 1000,
            },
            CouponScope::All,
            window_around_now(),
            CouponTemplate::UNLIMITED,
            1,
        );
        let work = service.create_coupon_template(payload);
        let err = core.run(work).unwrap_err();
        match service_error(&err) {
            Some(&Error::InvalidRule) => {}
            other => panic!("Expected InvalidRule, got {:?}", other),
        }
    }

    #[test]
    fn test_list_coupon_templates() {
        let mut core = Core::new().unwrap();
        let service = create_service(Some(MOCK_USER_ID));
        core.run(service.create_coupon_template(unconditional_template(100))).unwrap();
        core.run(service.create_coupon_template(unconditional_template(200))).unwrap();

        let templates = core.run(service.list_coupon_templates()).unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].id, CouponTemplateId(1));
        assert_eq!(templates[1].id, CouponTemplateId(2));
    }

    #[test]
    fn test_claim_coupon() {
        let mut core = Core::new().unwrap();
        let service = create_service(Some(MOCK_USER_ID));
        let template = core.run(service.create_coupon_template(unconditional_template(500))).unwrap();

        let user_coupon = core.run(service.claim_coupon(template.id)).unwrap();
        assert_eq!(user_coupon.template_id, template.id);
        assert_eq!(user_coupon.user_id, MOCK_USER_ID);
        assert_eq!(user_coupon.status, UserCouponStatus::Unused);
        assert_eq!(user_coupon.code.0.len(), 32);

        let template = core.run(service.get_coupon_template(template.id)).unwrap().unwrap();
        assert_eq!(template.issued_quantity, 1);
    }

    #[test]
    fn test_claim_coupon_for_unauthorized_user() {
        let mut core = Core::new().unwrap();
        let service = create_service(None);
        let work = service.claim_coupon(CouponTemplateId(1));
        let err = core.run(work).unwrap_err();
        match service_error(&err) {
            Some(&Error::Forbidden) => {}
            other => panic!("Expected Forbidden, got {:?}", other),
        }
    }

    #[test]
    fn test_claim_coupon_of_missing_template() {
        let mut core = Core::new().unwrap();
        let service = create_service(Some(MOCK_USER_ID));
        let work = service.claim_coupon(CouponTemplateId(404));
        let err = core.run(work).unwrap_err();
        match service_error(&err) {
            Some(&Error::NotFound) => {}
            other => panic!("Expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_claim_coupon_of_disabled_template() {
        let mut core = Core::new().unwrap();
        let service = create_service(Some(MOCK_USER_ID));
        let template = core.run(service.create_coupon_template(unconditional_template(500))).unwrap();
        core.run(service.update_coupon_template(
            template.id,
            UpdateCouponTemplate {
                title: None,
                total_quantity: None,
                per_user_limit: None,
                status: Some(TemplateStatus::Disabled),
            },
        )).unwrap();

        let err = core.run(service.claim_coupon(template.id)).unwrap_err();
        match service_error(&err) {
            Some(&Error::TemplateUnavailable) => {}
            other => panic!("Expected TemplateUnavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_claim_coupon_until_stock_exhausted() {
        let mut core = Core::new().unwrap();
        let store = Arc::new(InMemoryStore::default());
        let service = create_service_with_store(Some(MOCK_USER_ID), store.clone());
        let payload = new_template(
            CouponRules::Unconditional { amount: 500 },
            CouponScope::All,
            window_around_now(),
            2,
            10,
        );
        let template = core.run(service.create_coupon_template(payload)).unwrap();

        assert!(core.run(service.claim_coupon(template.id)).is_ok());
        assert!(core.run(service.claim_coupon(template.id)).is_ok());

        let err = core.run(service.claim_coupon(template.id)).unwrap_err();
        match service_error(&err) {
            Some(&Error::StockExhausted) => {}
            other => panic!("Expected StockExhausted, got {:?}", other),
        }
        assert_eq!(store.template(template.id).unwrap().issued_quantity, 2);
        assert_eq!(store.user_coupon_count(), 2);
    }

    #[test]
    fn test_claim_coupon_over_per_user_limit() {
        let mut core = Core::new().unwrap();
        let store = Arc::new(InMemoryStore::default());
        let service = create_service_with_store(Some(MOCK_USER_ID), store.clone());
        let payload = new_template(
            CouponRules::Unconditional { amount: 500 },
            CouponScope::All,
            window_around_now(),
            CouponTemplate::UNLIMITED,
            1,
        );
        let template = core.run(service.create_coupon_template(payload)).unwrap();

        assert!(core.run(service.claim_coupon(template.id)).is_ok());
        let err = core.run(service.claim_coupon(template.id)).unwrap_err();
        match service_error(&err) {
            Some(&Error::PerUserLimitReached) => {}
            other => panic!("Expected PerUserLimitReached, got {:?}", other),
        }

        // the limit is per user, another user still claims
        let other_service = create_service_with_store(Some(UserId(2)), store);
        assert!(core.run(other_service.claim_coupon(template.id)).is_ok());
    }

    #[test]
    fn test_concurrent_claims_never_oversell() {
        let mut core = Core::new().unwrap();
        let store = Arc::new(InMemoryStore::default());
        let service = create_service_with_store(Some(MOCK_USER_ID), store.clone());
        let payload = new_template(
            CouponRules::Unconditional { amount: 500 },
            CouponScope::All,
            window_around_now(),
            4,
            1,
        );
        let template = core.run(service.create_coupon_template(payload)).unwrap();

        let mut claimants = vec![];
        for claimant in 0..8i64 {
            let store = store.clone();
            let template_id = template.id;
            claimants.push(thread::spawn(move || {
                let mut core = Core::new().unwrap();
                let service = create_service_with_store(Some(UserId(100 + claimant)), store);
                core.run(service.claim_coupon(template_id))
            }));
        }

        let results = claimants.into_iter().map(|claimant| claimant.join().unwrap()).collect::<Vec<_>>();
        let successes = results.iter().filter(|result| result.is_ok()).count();
        assert_eq!(successes, 4);
        for result in results.iter().filter(|result| result.is_err()) {
            match result.as_ref().map_err(service_error) {
                Err(Some(&Error::StockExhausted)) => {}
                other => panic!("Expected StockExhausted, got {:?}", other),
            }
        }

        assert_eq!(store.template(template.id).unwrap().issued_quantity, 4);
        assert_eq!(store.user_coupon_count(), 4);
    }

    #[test]
    fn test_failed_claim_rolls_back_coupon_and_counter() {
        let mut core = Core::new().unwrap();
        let store = Arc::new(InMemoryStore::default());
        let service = create_service_with_store(Some(MOCK_USER_ID), store.clone());
        let template = core.run(service.create_coupon_template(unconditional_template(500))).unwrap();

        store.set_fail_increment(true);
        let err = core.run(service.claim_coupon(template.id)).unwrap_err();
        match service_error(&err) {
            Some(&Error::NotFound) => {}
            other => panic!("Expected NotFound, got {:?}", other),
        }

        // no partial coupon and no partial counter increment survive the abort
        assert_eq!(store.user_coupon_count(), 0);
        assert_eq!(store.template(template.id).unwrap().issued_quantity, 0);

        store.set_fail_increment(false);
        assert!(core.run(service.claim_coupon(template.id)).is_ok());
        assert_eq!(store.user_coupon_count(), 1);
    }

    #[test]
    fn test_relative_validity_window_is_frozen_at_claim_time() {
        let mut core = Core::new().unwrap();
        let store = Arc::new(InMemoryStore::default());
        let service = create_service_with_store(Some(MOCK_USER_ID), store.clone());
        let payload = new_template(
            CouponRules::Unconditional { amount: 500 },
            CouponScope::All,
            CouponValidity::Relative { valid_days_after_claim: 7 },
            CouponTemplate::UNLIMITED,
            1,
        );
        let template = core.run(service.create_coupon_template(payload)).unwrap();

        let user_coupon = core.run(service.claim_coupon(template.id)).unwrap();
        assert_eq!(user_coupon.valid_from, user_coupon.claimed_at);
        assert_eq!(
            user_coupon.valid_to,
            user_coupon.claimed_at + Duration::from_secs(7 * 86_400)
        );

        // later template edits must not touch the issued coupon
        core.run(service.update_coupon_template(
            template.id,
            UpdateCouponTemplate {
                title: Some("changed".to_string()),
                total_quantity: Some(1),
                per_user_limit: None,
                status: Some(TemplateStatus::Disabled),
            },
        )).unwrap();
        let stored = store.user_coupons().into_iter().find(|c| c.id == user_coupon.id).unwrap();
        assert_eq!(stored.valid_to, user_coupon.valid_to);
    }

    #[test]
    fn test_fixed_validity_window_is_copied_verbatim() {
        let mut core = Core::new().unwrap();
        let service = create_service(Some(MOCK_USER_ID));
        let valid_from = SystemTime::now() - Duration::from_secs(60);
        let valid_to = SystemTime::now() + Duration::from_secs(60);
        let payload = new_template(
            CouponRules::Unconditional { amount: 500 },
            CouponScope::All,
            CouponValidity::FixedWindow { valid_from, valid_to },
            CouponTemplate::UNLIMITED,
            1,
        );
        let template = core.run(service.create_coupon_template(payload)).unwrap();

        let user_coupon = core.run(service.claim_coupon(template.id)).unwrap();
        assert_eq!(user_coupon.valid_from, valid_from);
        assert_eq!(user_coupon.valid_to, valid_to);
    }

    fn claim_with_rules(core: &mut Core, store: &Arc<InMemoryStore>, rules: CouponRules, scope: CouponScope) -> CouponCode {
        let service = create_service_with_store(Some(MOCK_USER_ID), store.clone());
        let payload = new_template(rules, scope, window_around_now(), CouponTemplate::UNLIMITED, 10);
        let template = core.run(service.create_coupon_template(payload)).unwrap();
        core.run(service.claim_coupon(template.id)).unwrap().code
    }

    #[test]
    fn test_discount_full_reduction_above_threshold() {
        let mut core = Core::new().unwrap();
        let store = Arc::new(InMemoryStore::default());
        let code = claim_with_rules(
            &mut core,
            &store,
            CouponRules::FullReduction {
                threshold: 10000,
                amount: 1000,
            },
            CouponScope::All,
        );

        let service = create_service_with_store(Some(MOCK_USER_ID), store);
        let deduction = core.run(service.calculate_discount(code, vec![line_item(1, 1, 15000, 1)])).unwrap();
        assert_eq!(deduction, 1000);
    }

    #[test]
    fn test_discount_full_reduction_below_threshold() {
        let mut core = Core::new().unwrap();
        let store = Arc::new(InMemoryStore::default());
        let code = claim_with_rules(
            &mut core,
            &store,
            CouponRules::FullReduction {
                threshold: 10000,
                amount: 1000,
            },
            CouponScope::All,
        );

        let service = create_service_with_store(Some(MOCK_USER_ID), store);
        let err = core.run(service.calculate_discount(code, vec![line_item(1, 1, 5000, 1)])).unwrap_err();
        match service_error(&err) {
            // the displayable message carries the formatted threshold
            Some(&Error::ThresholdNotMet(ref formatted)) => assert_eq!(formatted, "100.00"),
            other => panic!("Expected ThresholdNotMet, got {:?}", other),
        }
    }

    #[test]
    fn test_discount_percent_clamped_to_max_deduction() {
        let mut core = Core::new().unwrap();
        let store = Arc::new(InMemoryStore::default());
        let code = claim_with_rules(
            &mut core,
            &store,
            CouponRules::PercentDiscount {
                threshold: 0,
                percent: 12,
                max_deduction: 2000,
            },
            CouponScope::All,
        );

        let service = create_service_with_store(Some(MOCK_USER_ID), store);
        // raw 50000 * 88 / 100 = 44000, clamped to the cap
        let deduction = core.run(service.calculate_discount(code, vec![line_item(1, 1, 50000, 1)])).unwrap();
        assert_eq!(deduction, 2000);
    }

    #[test]
    fn test_discount_unconditional_never_exceeds_applicable_total() {
        let mut core = Core::new().unwrap();
        let store = Arc::new(InMemoryStore::default());
        let code = claim_with_rules(&mut core, &store, CouponRules::Unconditional { amount: 500 }, CouponScope::All);

        let service = create_service_with_store(Some(MOCK_USER_ID), store);
        let deduction = core.run(service.calculate_discount(code, vec![line_item(1, 1, 300, 1)])).unwrap();
        assert_eq!(deduction, 300);
    }

    #[test]
    fn test_discount_scope_covers_listed_products_only() {
        let mut core = Core::new().unwrap();
        let store = Arc::new(InMemoryStore::default());
        let code = claim_with_rules(
            &mut core,
            &store,
            CouponRules::FullReduction {
                threshold: 1500,
                amount: 200,
            },
            CouponScope::Products(vec![ProductId(7), ProductId(8)]),
        );

        let service = create_service_with_store(Some(MOCK_USER_ID), store);
        // product 9 is out of scope: applicable total is 2000 of 2500
        let items = vec![line_item(7, 1, 1000, 2), line_item(9, 1, 500, 1)];
        let deduction = core.run(service.calculate_discount(code, items)).unwrap();
        assert_eq!(deduction, 200);
    }

    #[test]
    fn test_discount_scope_without_covered_items() {
        let mut core = Core::new().unwrap();
        let store = Arc::new(InMemoryStore::default());
        let code = claim_with_rules(
            &mut core,
            &store,
            CouponRules::Unconditional { amount: 500 },
            CouponScope::Categories(vec![CategoryId(3)]),
        );

        let service = create_service_with_store(Some(MOCK_USER_ID), store);
        let err = core.run(service.calculate_discount(code, vec![line_item(1, 1, 1000, 1)])).unwrap_err();
        match service_error(&err) {
            Some(&Error::NoApplicableItems) => {}
            other => panic!("Expected NoApplicableItems, got {:?}", other),
        }
    }

    #[test]
    fn test_discount_with_unknown_code() {
        let mut core = Core::new().unwrap();
        let service = create_service(Some(MOCK_USER_ID));
        let work = service.calculate_discount(CouponCode("NOSUCHCODE".to_string()), vec![line_item(1, 1, 1000, 1)]);
        let err = core.run(work).unwrap_err();
        match service_error(&err) {
            Some(&Error::InvalidCode) => {}
            other => panic!("Expected InvalidCode, got {:?}", other),
        }
    }

    #[test]
    fn test_discount_with_expired_window() {
        let mut core = Core::new().unwrap();
        let store = Arc::new(InMemoryStore::default());
        let service = create_service_with_store(Some(MOCK_USER_ID), store.clone());
        let now = SystemTime::now();
        let payload = new_template(
            CouponRules::Unconditional { amount: 500 },
            CouponScope::All,
            CouponValidity::FixedWindow {
                valid_from: now - Duration::from_secs(7_200),
                valid_to: now - Duration::from_secs(3_600),
            },
            CouponTemplate::UNLIMITED,
            1,
        );
        let template = core.run(service.create_coupon_template(payload)).unwrap();
        let user_coupon = core.run(service.claim_coupon(template.id)).unwrap();

        let err = core.run(service.calculate_discount(user_coupon.code, vec![line_item(1, 1, 1000, 1)])).unwrap_err();
        match service_error(&err) {
            Some(&Error::OutOfValidityWindow) => {}
            other => panic!("Expected OutOfValidityWindow, got {:?}", other),
        }
    }

    #[test]
    fn test_redeem_coupon() {
        let mut core = Core::new().unwrap();
        let store = Arc::new(InMemoryStore::default());
        let code = claim_with_rules(&mut core, &store, CouponRules::Unconditional { amount: 500 }, CouponScope::All);

        let service = create_service_with_store(Some(MOCK_USER_ID), store);
        let redeemed = core.run(service.redeem_coupon(code.clone(), OrderId(77))).unwrap();
        assert_eq!(redeemed.status, UserCouponStatus::Used);
        assert_eq!(redeemed.order_id, Some(OrderId(77)));
        assert!(redeemed.used_at.is_some());

        // a consumed coupon neither redeems nor discounts again
        let err = core.run(service.redeem_coupon(code.clone(), OrderId(78))).unwrap_err();
        match service_error(&err) {
            Some(&Error::AlreadyConsumed) => {}
            other => panic!("Expected AlreadyConsumed, got {:?}", other),
        }
        let err = core.run(service.calculate_discount(code, vec![line_item(1, 1, 1000, 1)])).unwrap_err();
        match service_error(&err) {
            Some(&Error::AlreadyConsumed) => {}
            other => panic!("Expected AlreadyConsumed, got {:?}", other),
        }
    }

    #[test]
    fn test_expire_user_coupons() {
        let mut core = Core::new().unwrap();
        let store = Arc::new(InMemoryStore::default());
        let service = create_service_with_store(Some(MOCK_USER_ID), store.clone());
        let now = SystemTime::now();
        let payload = new_template(
            CouponRules::Unconditional { amount: 500 },
            CouponScope::All,
            CouponValidity::FixedWindow {
                valid_from: now - Duration::from_secs(7_200),
                valid_to: now - Duration::from_secs(3_600),
            },
            CouponTemplate::UNLIMITED,
            1,
        );
        let template = core.run(service.create_coupon_template(payload)).unwrap();
        core.run(service.claim_coupon(template.id)).unwrap();

        let affected = core.run(service.expire_user_coupons()).unwrap();
        assert_eq!(affected, 1);

        let coupons = core.run(service.list_user_coupons()).unwrap();
        assert_eq!(coupons.len(), 1);
        assert_eq!(coupons[0].status, UserCouponStatus::Expired);

        // the sweep is idempotent
        let affected = core.run(service.expire_user_coupons()).unwrap();
        assert_eq!(affected, 0);
    }

    #[test]
    fn test_get_coupon_template_does_not_mutate() {
        let mut core = Core::new().unwrap();
        let store = Arc::new(InMemoryStore::default());
        let service = create_service_with_store(Some(MOCK_USER_ID), store.clone());
        let template = core.run(service.create_coupon_template(unconditional_template(500))).unwrap();

        for _ in 0..3 {
            let read = core.run(service.get_coupon_template(template.id)).unwrap().unwrap();
            assert_eq!(read.issued_quantity, 0);
        }
        assert_eq!(store.template(template.id).unwrap().issued_quantity, 0);
    }

    #[test]
    fn test_generate_coupon_code() {
        let code = generate_coupon_code();
        assert_eq!(code.0.len(), 32);
        assert_eq!(code.0, code.0.to_uppercase());
        assert_ne!(code, generate_coupon_code());
    }

    fn template_with_rules(rules: CouponRules, scope: CouponScope) -> CouponTemplate {
        CouponTemplate {
            id: CouponTemplateId(1),
            title: "test".to_string(),
            scope,
            rules,
            validity: window_around_now(),
            total_quantity: CouponTemplate::UNLIMITED,
            issued_quantity: 0,
            per_user_limit: 1,
            status: TemplateStatus::Available,
            created_at: SystemTime::now(),
            updated_at: SystemTime::now(),
        }
    }

    #[test]
    fn test_calculate_deduction_percent_without_cap() {
        let template = template_with_rules(
            CouponRules::PercentDiscount {
                threshold: 0,
                percent: 12,
                max_deduction: 0,
            },
            CouponScope::All,
        );
        let deduction = calculate_coupon_deduction(&template, &[line_item(1, 1, 50000, 1)]).unwrap();
        assert_eq!(deduction, 44000);
    }

    #[test]
    fn test_calculate_deduction_truncates_towards_zero() {
        let template = template_with_rules(
            CouponRules::PercentDiscount {
                threshold: 0,
                percent: 7,
                max_deduction: 0,
            },
            CouponScope::All,
        );
        // 99 * 93 / 100 = 92.07 truncated to 92
        let deduction = calculate_coupon_deduction(&template, &[line_item(1, 1, 99, 1)]).unwrap();
        assert_eq!(deduction, 92);
    }

    #[test]
    fn test_applicable_total_by_category_scope() {
        let scope = CouponScope::Categories(vec![CategoryId(5)]);
        let items = vec![line_item(1, 5, 1000, 2), line_item(2, 6, 700, 1)];
        assert_eq!(applicable_total(&scope, &items), 2000);
    }
}
