//! Peer-to-peer federation layer for an MCP server / A2A agent registry.

pub mod admin_routes;
pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod export_routes;
pub mod federation_service;
pub mod models;
pub mod peer_client;
pub mod peer_store;
pub mod record_store;
pub mod scan_store;
pub mod scheduler;
pub mod state;
pub mod token_source;
