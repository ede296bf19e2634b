//! Coupons is a microservice responsible for issuing limited-quantity
//! promotional coupons and computing order-time discounts from them.
//! The layered structure of the app is
//!
//! `Application -> Controller -> Service -> Repo`
//!
//! The transport layer is not part of this crate: the `Service` layer is
//! the externally consumed contract. Each layer can throw Error with
//! context or cover occurred error with Error in the context.

#![allow(proc_macro_derive_resolution_fallback)]
#![recursion_limit = "128"]
extern crate config as config_crate;
#[macro_use]
extern crate diesel;
#[macro_use]
extern crate diesel_derive_newtype;
#[macro_use]
extern crate failure;
extern crate futures;
extern crate futures_cpupool;
#[macro_use]
extern crate log;
extern crate r2d2;
extern crate serde;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate serde_json;
#[cfg(test)]
extern crate tokio_core;
extern crate uuid;
extern crate validator;
#[macro_use]
extern crate validator_derive;

pub mod config;
pub mod errors;
pub mod models;
pub mod repos;
pub mod schema;
pub mod services;
