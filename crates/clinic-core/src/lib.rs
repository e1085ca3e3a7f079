//! Core library for the clinic management client.
//!
//! The interesting part of this crate is the authenticated request pipeline
//! in [`api::pipeline`]: it attaches the current bearer credential to every
//! outgoing request, detects credential expiry, runs at most one token
//! refresh at a time (shared by every caller that noticed the expiry), replays
//! the failed request once, and tears the session down when the refresh
//! itself fails.
//!
//! Everything else is plumbing around it:
//! - [`auth`]: credential store, persisted slots, session terminator
//! - [`api`]: dispatcher, pipeline, auth endpoints, typed resource client
//! - [`models`]: patient, appointment, and finance wire types
//! - [`config`]: on-disk configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError, AuthApi, AuthPipeline};
pub use auth::{CredentialStore, SessionTerminator};
pub use config::Config;
