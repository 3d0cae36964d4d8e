//! Wakegate - an on-demand activator and reverse proxy for Docker containers
//!
//! This library provides a reverse proxy that:
//! - Maps each request to a service name (query parameter, header, path or subdomain)
//! - Finds the container serving it through Docker labels
//! - Starts the container's whole group on first access and serves a loading page meanwhile
//! - Forwards requests once every member of the group is running
//! - Stops groups that have seen no traffic for a configurable timeout

pub mod client;
pub mod config;
pub mod container;
pub mod docker;
pub mod error;
pub mod extract;
pub mod orchestrator;
pub mod pages;
pub mod pending;
pub mod pool;
pub mod proxy;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
