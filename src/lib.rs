//! NFT Lending Ledger Library
//!
//! This library exports the core modules for the lending ledger server.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod explore;
pub mod handlers;
pub mod identity;
pub mod ledger;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod terms;
