//! Company Context API Library
//!
//! Resolves a French business (SIRET/SIREN) from free text or explicit input,
//! aggregates registry, certification, legal, compliance and market reference
//! data from independent providers, caches the result with staleness-aware
//! refresh, and synthesizes a scored context.
//!
//! # Modules
//!
//! - `api`: HTTP-layer namespace.
//! - `core`: Domain-layer namespace.
//! - `integrations`: External provider namespace.
//! - `aggregator`: Scatter-gather over the configured providers.
//! - `ai_client`: Text-generation client used by the extractor fallback.
//! - `cache`: Record store trait, in-memory store and refresh manager.
//! - `cache_validator`: Payload checksum validation.
//! - `circuit_breaker`: Per-provider circuit breakers.
//! - `config`: Configuration management.
//! - `db`: Database connection and pool management.
//! - `db_storage`: PostgreSQL record store.
//! - `errors`: Error handling types.
//! - `extractor`: SIRET/SIREN and company name extraction.
//! - `handlers`: HTTP request handlers and application wiring.
//! - `models`: Request, record and response models.
//! - `providers`: Provider capability traits, payload types and the source ledger.
//! - `reference_data`: Versioned reference tables and the table-backed providers.
//! - `resolution`: Request orchestration.
//! - `scatter`: Timeout-guarded provider branches.
//! - `scorer`: Quality score and risk flags.
//! - `services`: HTTP provider clients.
//! - `siret`: Identifier checksum and formatting.
//! - `synthesizer`: Final context assembly.

pub mod api;
pub mod core;
pub mod integrations;

pub mod aggregator;
pub mod ai_client;
pub mod cache;
pub mod cache_validator;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod errors;
pub mod extractor;
pub mod handlers;
pub mod models;
pub mod providers;
pub mod reference_data;
pub mod resolution;
pub mod scatter;
pub mod scorer;
pub mod services;
pub mod siret;
pub mod synthesizer;
