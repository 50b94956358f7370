//! Spreadsheet-backed storage for unitboard.
//!
//! The shared spreadsheet is the system's only database. This crate owns
//! everything that touches it:
//! - service-account credential loading + OAuth token exchange
//!   ([`credentials`]),
//! - the tabular read/append client over the Sheets REST API, plus a
//!   deterministic in-memory mock for demos and tests ([`store`]),
//! - reshaping the raw tab rows into the lookup structure the form consumes
//!   ([`catalog`]).
//!
//! Nothing here caches across calls: every [`store::SheetStore::open`]
//! re-authenticates and re-resolves worksheets. That keeps request handling
//! stateless at the cost of latency, which is the intended trade-off for
//! this deployment.

pub mod catalog;
pub mod credentials;
pub mod store;

pub use catalog::{build_catalog, school_names, unit_rows, Catalog, UnitEntry, UnitRow};
pub use credentials::{load_service_key, CredentialsError, ServiceAccountKey, SERVICE_KEY_ENV};
pub use store::{
    MockStore, OpenSheets, SheetStore, StoreError, DEFAULT_SPREADSHEET_ID, RECORDS_TAB,
    REQUIRED_TABS, SCHOOL_TAB, UNITS_TAB,
};
