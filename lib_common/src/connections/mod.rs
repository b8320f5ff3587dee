//! # Connections Module
//!
//! This module handles persistent connections to external services,
//! currently the PostGIS-backed durable mirror of the live vessel state.

/// Module for PostgreSQL database connection pooling and the vessel mirror.
pub mod db_postgres;
