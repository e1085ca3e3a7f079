//! Wire types for the clinic backend resources.
//!
//! - `Patient`, `PatientCreate`, `PatientUpdate`: patient records
//! - `Appointment`, `AppointmentCreate`, `AvailableSlot`: scheduling
//! - `Invoice`, `InvoiceCreate`, `Payment`, `PaymentCreate`: finance (decimal amounts)
//! - `Page<T>`: the paginated list envelope every list endpoint returns

pub mod appointment;
pub mod finance;
pub mod patient;

use serde::{Deserialize, Serialize};

pub use appointment::{
    Appointment, AppointmentCreate, AppointmentDoctor, AppointmentPatient, AppointmentStatus,
    AvailableSlot,
};
pub use finance::{
    FinancialReportRequest, Invoice, InvoiceCreate, InvoiceItem, InvoiceItemCreate, InvoicePatient,
    InvoiceStatus, Payment, PaymentCreate, PaymentMethod, ReportGrouping,
};
pub use patient::{Patient, PatientCreate, PatientUpdate};

/// Paginated list envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub pages: Option<u64>,
}

impl<T> Page<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
