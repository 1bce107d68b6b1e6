//! # VNG Connect
//!
//! Per-tenant OAuth2 connections to the Bling ERP: credential storage, the
//! token lifecycle with single-flight refresh, health checks, the integration
//! facade other features call through, and the HTTP API in front of them.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod facade;
pub mod handlers;
pub mod health;
pub mod models;
pub mod order_sync;
pub mod providers;
pub mod repositories;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod token_manager;
pub use migration;

#[cfg(test)]
pub(crate) mod test_support;
