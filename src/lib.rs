// src/lib.rs
//! Edge gateway for QSL card tracking: desktop sync, public callsign
//! lookup, carrier route webhooks and subscriber push.

pub mod auth;
pub mod canon;
pub mod captcha;
pub mod config;
pub mod error;
pub mod push;
pub mod ratelimit;
pub mod routes;
pub mod store;
pub mod sync;
pub mod types;
pub mod webhook;
pub mod wechat;
