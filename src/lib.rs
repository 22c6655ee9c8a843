//! PPOB gateway: routes prepaid top-ups and postpaid bill payments across
//! upstream billers, drives each transaction to a terminal state and
//! notifies the client with signed webhooks.

pub mod api;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
