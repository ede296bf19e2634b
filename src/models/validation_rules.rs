use std::borrow::Cow;
use std::collections::HashMap;

use validator::ValidationError;

pub fn validate_not_blank_title(title: &str) -> Result<(), ValidationError> {
    if title.trim().is_empty() {
        Err(ValidationError {
            code: Cow::from("title"),
            message: Some(Cow::from("Title must not be empty.")),
            params: HashMap::new(),
        })
    } else {
        Ok(())
    }
}

pub fn validate_non_negative_quantity(quantity: i64) -> Result<(), ValidationError> {
    if quantity < 0 {
        Err(ValidationError {
            code: Cow::from("quantity"),
            message: Some(Cow::from("Quantity must be non negative.")),
            params: HashMap::new(),
        })
    } else {
        Ok(())
    }
}
