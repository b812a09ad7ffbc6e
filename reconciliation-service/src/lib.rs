//! Reconciliation Service - bank transaction ingestion and invoice settlement.

pub mod config;
pub mod dtos;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
