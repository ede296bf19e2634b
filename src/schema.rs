//! Diesel table definitions of the coupons service

/// diesel table for coupon_templates
table! {
    coupon_templates (id) {
        id -> BigInt,
        title -> VarChar,
        scope -> Jsonb,
        rules -> Jsonb,
        validity -> Jsonb,
        total_quantity -> BigInt,
        issued_quantity -> BigInt,
        per_user_limit -> BigInt,
        status -> VarChar,
        created_at -> Timestamp, // UTC 0, generated at db level
        updated_at -> Timestamp, // UTC 0, generated at db level
    }
}

/// diesel table for user_coupons
table! {
    user_coupons (id) {
        id -> BigInt,
        template_id -> BigInt,
        user_id -> BigInt,
        code -> VarChar,
        status -> VarChar,
        claimed_at -> Timestamp,
        valid_from -> Timestamp,
        valid_to -> Timestamp,
        order_id -> Nullable<BigInt>,
        used_at -> Nullable<Timestamp>,
    }
}
