//! REST API access for the clinic backend.
//!
//! This module provides:
//! - `Dispatcher` / `ReqwestDispatcher`: sends one request, no auth logic
//! - `AuthPipeline`: bearer attachment, expiry detection, refresh and replay
//! - `AuthApi`: login, refresh, logout endpoints
//! - `ApiClient`: typed patient, appointment, and finance calls
//!
//! The backend uses short-lived JWT bearer tokens obtained from `/auth/login`
//! and renewed through `/auth/refresh`.

pub mod auth;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod pipeline;

pub use auth::AuthApi;
pub use client::{ApiClient, AppointmentQuery, InvoiceQuery, PatientQuery};
pub use dispatch::{Dispatcher, HttpResponse, ReqwestDispatcher, RequestDescriptor, TransportError};
pub use error::ApiError;
pub use pipeline::{
    AuthPipeline, AuthPipelineBuilder, HeaderStage, Inbound, InboundStage, OutboundStage,
    PendingRequest, TraceStage,
};
