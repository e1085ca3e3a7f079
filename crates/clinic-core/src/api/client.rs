//! Typed client for the clinic backend resources.
//!
//! Every call goes through the [`AuthPipeline`], so an expired access token is
//! refreshed and the call replayed without the caller noticing. Only a failed
//! refresh surfaces, as [`ApiError::SessionExpired`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use reqwest::header::{self, HeaderValue};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use super::dispatch::{Dispatcher, HttpResponse, ReqwestDispatcher, RequestDescriptor};
use super::pipeline::{AuthPipeline, HeaderStage};
use super::{ApiError, AuthApi};
use crate::auth::{
    CredentialStore, FileStorage, KeyValueStore, KeyringStorage, Navigator, SessionTerminator,
    TokenRefresher,
};
use crate::config::{Config, StorageBackend};
use crate::models::{
    Appointment, AppointmentCreate, AppointmentStatus, AvailableSlot, FinancialReportRequest,
    Invoice, InvoiceCreate, InvoiceStatus, Page, Patient, PatientCreate, PatientUpdate, Payment,
    PaymentCreate,
};

// ============================================================================
// Constants
// ============================================================================

/// Page size used when a query does not set one
const DEFAULT_PAGE_SIZE: u32 = 20;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay for rate limiting, doubled on every retry.
const INITIAL_BACKOFF: Duration = Duration::from_millis(1000);

/// Slot length the scheduler uses when none is asked for
const DEFAULT_SLOT_MINUTES: u32 = 30;

const USER_AGENT: &str = concat!("clinic-client/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Queries
// ============================================================================

/// Append `skip`/`limit` for a 1-based page number
fn paginate(request: RequestDescriptor, page: u32, limit: u32) -> RequestDescriptor {
    let limit = if limit == 0 { DEFAULT_PAGE_SIZE } else { limit };
    let skip = u64::from(page.max(1) - 1) * u64::from(limit);
    request.query("skip", skip).query("limit", limit)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientQuery {
    /// 1-based
    pub page: u32,
    pub limit: u32,
    pub search: Option<String>,
    pub is_active: Option<bool>,
}

impl Default for PatientQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
            search: None,
            is_active: None,
        }
    }
}

impl PatientQuery {
    pub fn search(term: impl Into<String>) -> Self {
        Self {
            search: Some(term.into()),
            ..Default::default()
        }
    }

    fn apply(&self, request: RequestDescriptor) -> RequestDescriptor {
        let mut request = paginate(request, self.page, self.limit);
        if let Some(ref search) = self.search {
            let search = search.trim();
            if !search.is_empty() {
                request = request.query("search", search);
            }
        }
        if let Some(active) = self.is_active {
            request = request.query("is_active", active);
        }
        request
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentQuery {
    pub page: u32,
    pub limit: u32,
    pub patient_id: Option<String>,
    pub doctor_id: Option<String>,
    pub status: Option<AppointmentStatus>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl Default for AppointmentQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
            patient_id: None,
            doctor_id: None,
            status: None,
            start_date: None,
            end_date: None,
        }
    }
}

impl AppointmentQuery {
    fn apply(&self, request: RequestDescriptor) -> Result<RequestDescriptor, ApiError> {
        let mut request = paginate(request, self.page, self.limit);
        if let Some(ref id) = self.patient_id {
            request = request.query("patient_id", id);
        }
        if let Some(ref id) = self.doctor_id {
            request = request.query("doctor_id", id);
        }
        if let Some(status) = self.status {
            request = request.query("status", wire_name(&status)?);
        }
        if let Some(date) = self.start_date {
            request = request.query("start_date", date.format("%Y-%m-%d"));
        }
        if let Some(date) = self.end_date {
            request = request.query("end_date", date.format("%Y-%m-%d"));
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceQuery {
    pub page: u32,
    pub limit: u32,
    pub patient_id: Option<String>,
    pub status: Option<InvoiceStatus>,
    pub overdue_only: bool,
}

impl Default for InvoiceQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
            patient_id: None,
            status: None,
            overdue_only: false,
        }
    }
}

impl InvoiceQuery {
    fn apply(&self, request: RequestDescriptor) -> Result<RequestDescriptor, ApiError> {
        let mut request = paginate(request, self.page, self.limit);
        if let Some(ref id) = self.patient_id {
            request = request.query("patient_id", id);
        }
        if let Some(status) = self.status {
            request = request.query("status", wire_name(&status)?);
        }
        if self.overdue_only {
            request = request.query("overdue_only", true);
        }
        Ok(request)
    }
}

/// The serde name of a unit enum variant, as used in query strings
fn wire_name<T: Serialize>(value: &T) -> Result<String, ApiError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(ApiError::InvalidResponse(format!("Not a query value: {}", other))),
    }
}

// ============================================================================
// Client
// ============================================================================

#[derive(Serialize)]
struct CancelRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

/// Typed client for the clinic backend.
/// Clone is cheap - everything behind it is shared.
#[derive(Clone)]
pub struct ApiClient {
    pipeline: Arc<AuthPipeline>,
    auth: Arc<AuthApi>,
    initial_backoff: Duration,
}

impl ApiClient {
    pub fn new(pipeline: Arc<AuthPipeline>, auth: Arc<AuthApi>) -> Self {
        Self {
            pipeline,
            auth,
            initial_backoff: INITIAL_BACKOFF,
        }
    }

    /// Build the whole stack from configuration, restoring any persisted session.
    pub fn from_config(config: &Config, navigator: Arc<dyn Navigator>) -> Result<Self> {
        let storage: Arc<dyn KeyValueStore> = match config.storage {
            StorageBackend::File => Arc::new(FileStorage::new(config.data_dir()?)),
            StorageBackend::Keyring => Arc::new(KeyringStorage::new()),
        };
        Self::with_storage(config, storage, navigator)
    }

    /// Like [`ApiClient::from_config`] with an explicit slot backend.
    pub fn with_storage(
        config: &Config,
        storage: Arc<dyn KeyValueStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self> {
        let store = Arc::new(CredentialStore::load(storage).context("Failed to restore session")?);

        let dispatcher: Arc<dyn Dispatcher> = Arc::new(
            ReqwestDispatcher::new(config.api_base_url.clone(), config.request_timeout())
                .context("Failed to build HTTP client")?,
        );
        let terminator = Arc::new(SessionTerminator::new(store, navigator, config.login_route.clone()));
        let auth = Arc::new(AuthApi::new(Arc::clone(&dispatcher), Arc::clone(&terminator)));
        let refresher: Arc<dyn TokenRefresher> = auth.clone();

        let pipeline = AuthPipeline::builder(dispatcher, refresher, terminator)
            .outbound(Arc::new(
                HeaderStage::new().with(header::USER_AGENT, HeaderValue::from_static(USER_AGENT)),
            ))
            .with_tracing()
            .build();

        Ok(Self::new(Arc::new(pipeline), auth))
    }

    /// Override the first rate-limit backoff delay
    pub fn with_rate_limit_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff = initial;
        self
    }

    pub fn auth(&self) -> &AuthApi {
        &self.auth
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        self.pipeline.store()
    }

    pub fn pipeline(&self) -> &AuthPipeline {
        &self.pipeline
    }

    /// Send through the pipeline, retrying 429s with backoff.
    /// Non-2xx statuses become errors.
    async fn send(&self, request: RequestDescriptor) -> Result<HttpResponse, ApiError> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = self.pipeline.request(request.clone()).await?;
            if response.is_success() {
                return Ok(response);
            }
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Err(ApiError::from_status(response.status(), response.body()));
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(
                path = %request.path,
                retry = retries,
                backoff_ms = backoff.as_millis() as u64,
                "Rate limited, backing off"
            );
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }

    async fn get<T: DeserializeOwned>(&self, request: RequestDescriptor) -> Result<T, ApiError> {
        let response = self.send(request).await?;
        Ok(response.json()?)
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let response = self.send(RequestDescriptor::post(path).json(body)?).await?;
        Ok(response.json()?)
    }

    async fn put<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let response = self.send(RequestDescriptor::put(path).json(body)?).await?;
        Ok(response.json()?)
    }

    async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(RequestDescriptor::delete(path)).await?;
        Ok(())
    }

    // ===== Patients =====

    pub async fn list_patients(&self, query: &PatientQuery) -> Result<Page<Patient>, ApiError> {
        self.get(query.apply(RequestDescriptor::get("/patients"))).await
    }

    pub async fn get_patient(&self, id: &str) -> Result<Patient, ApiError> {
        self.get(RequestDescriptor::get(format!("/patients/{}", id))).await
    }

    pub async fn create_patient(&self, patient: &PatientCreate) -> Result<Patient, ApiError> {
        self.post("/patients", patient).await
    }

    pub async fn update_patient(&self, id: &str, update: &PatientUpdate) -> Result<Patient, ApiError> {
        self.put(&format!("/patients/{}", id), update).await
    }

    /// Soft delete; the backend marks the patient inactive
    pub async fn delete_patient(&self, id: &str) -> Result<(), ApiError> {
        self.delete(&format!("/patients/{}", id)).await
    }

    // ===== Appointments =====

    pub async fn list_appointments(&self, query: &AppointmentQuery) -> Result<Page<Appointment>, ApiError> {
        self.get(query.apply(RequestDescriptor::get("/appointments"))?).await
    }

    pub async fn create_appointment(&self, appointment: &AppointmentCreate) -> Result<Appointment, ApiError> {
        self.post("/appointments", appointment).await
    }

    /// Free slots for a doctor on `date`. The backend accepts 15 to 120 minute slots.
    pub async fn available_slots(
        &self,
        doctor_id: &str,
        date: NaiveDate,
        duration_minutes: Option<u32>,
    ) -> Result<Vec<AvailableSlot>, ApiError> {
        let request = RequestDescriptor::get(format!("/appointments/available-slots/{}", doctor_id))
            .query("target_date", date.format("%Y-%m-%d"))
            .query("duration_minutes", duration_minutes.unwrap_or(DEFAULT_SLOT_MINUTES));
        self.get(request).await
    }

    pub async fn cancel_appointment(&self, id: &str, reason: Option<&str>) -> Result<Appointment, ApiError> {
        self.post(&format!("/appointments/{}/cancel", id), &CancelRequest { reason })
            .await
    }

    // ===== Finance =====

    pub async fn list_invoices(&self, query: &InvoiceQuery) -> Result<Page<Invoice>, ApiError> {
        self.get(query.apply(RequestDescriptor::get("/finance/invoices"))?).await
    }

    pub async fn create_invoice(&self, invoice: &InvoiceCreate) -> Result<Invoice, ApiError> {
        self.post("/finance/invoices", invoice).await
    }

    pub async fn create_payment(&self, payment: &PaymentCreate) -> Result<Payment, ApiError> {
        self.post("/finance/payments", payment).await
    }

    /// Revenue overview for a period; the layout depends on the grouping
    pub async fn financial_report(&self, request: &FinancialReportRequest) -> Result<serde_json::Value, ApiError> {
        self.post("/finance/reports/financial", request).await
    }
}
