//! Tabular access to the shared spreadsheet.
//!
//! Two backends sit behind [`SheetStore`]:
//! - `Google`: the real spreadsheet over the Sheets v4 REST API. Every
//!   [`SheetStore::open`] loads credentials, exchanges a JWT for an access
//!   token, and re-resolves worksheet titles; nothing is cached between
//!   requests.
//! - `Mock`: a deterministic in-memory store for local demos and tests. No
//!   network, no credentials; appends accumulate for the life of the
//!   process.
//!
//! The store contract is five operations: open by ID, list worksheet
//! titles, resolve a tab by name, read all rows of a tab as header-keyed
//! mappings, and append multiple rows to a tab in one call.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::credentials::{load_service_key, CredentialsError, ServiceAccountKey};

/// Spreadsheet the deployment writes to unless overridden on the CLI.
pub const DEFAULT_SPREADSHEET_ID: &str = "1rsplfNq4e7d-nrp-Wlg1Mn9dsgjAcNn49yPQDXdzwg8";

pub const UNITS_TAB: &str = "units";
pub const SCHOOL_TAB: &str = "school";
pub const RECORDS_TAB: &str = "records";

/// Tabs the server needs; opening fails if any is absent.
pub const REQUIRED_TABS: [&str; 3] = [UNITS_TAB, SCHOOL_TAB, RECORDS_TAB];

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
    #[error("spreadsheet request failed: {0}")]
    Network(String),
    #[error("spreadsheet API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("worksheet `{0}` not found in spreadsheet")]
    MissingTab(String),
    #[error("unexpected spreadsheet response: {0}")]
    InvalidResponse(String),
    #[error("store internal error: {0}")]
    Internal(String),
}

/// Handle-less description of where the data lives.
///
/// Cheap to clone; the expensive work happens in [`SheetStore::open`], once
/// per request by design.
#[derive(Debug, Clone)]
pub enum SheetStore {
    Google {
        spreadsheet_id: String,
        key_file: Option<PathBuf>,
    },
    Mock(Arc<Mutex<MockStore>>),
}

impl SheetStore {
    pub fn google(spreadsheet_id: impl Into<String>, key_file: Option<PathBuf>) -> Self {
        Self::Google {
            spreadsheet_id: spreadsheet_id.into(),
            key_file,
        }
    }

    pub fn mock(store: MockStore) -> Self {
        Self::Mock(Arc::new(Mutex::new(store)))
    }

    /// One-line description for operational logs.
    pub fn label(&self) -> String {
        match self {
            Self::Google { spreadsheet_id, .. } => format!("google({spreadsheet_id})"),
            Self::Mock(_) => "mock".to_string(),
        }
    }

    /// Authenticate and resolve worksheet titles, without requiring the
    /// three well-known tabs to exist. Diagnostics use this directly.
    pub async fn connect(&self) -> Result<OpenSheets, StoreError> {
        match self {
            Self::Google {
                spreadsheet_id,
                key_file,
            } => {
                let key = load_service_key(key_file.as_deref())?;
                let sheets = GoogleSheets::connect(key, spreadsheet_id.clone()).await?;
                Ok(OpenSheets::Google(sheets))
            }
            Self::Mock(store) => Ok(OpenSheets::Mock(store.clone())),
        }
    }

    /// [`connect`](Self::connect), then verify all required tabs resolve.
    pub async fn open(&self) -> Result<OpenSheets, StoreError> {
        let sheets = self.connect().await?;
        sheets.ensure_required_tabs()?;
        Ok(sheets)
    }
}

/// An opened spreadsheet: authenticated (for the Google backend) and with
/// worksheet titles resolved. Valid for a single request.
pub enum OpenSheets {
    Google(GoogleSheets),
    Mock(Arc<Mutex<MockStore>>),
}

impl OpenSheets {
    pub fn worksheet_titles(&self) -> Result<Vec<String>, StoreError> {
        match self {
            Self::Google(sheets) => Ok(sheets.titles.clone()),
            Self::Mock(store) => Ok(lock_mock(store)?.titles()),
        }
    }

    pub fn ensure_required_tabs(&self) -> Result<(), StoreError> {
        let titles = self.worksheet_titles()?;
        for tab in REQUIRED_TABS {
            if !titles.iter().any(|t| t == tab) {
                return Err(StoreError::MissingTab(tab.to_string()));
            }
        }
        Ok(())
    }

    /// Read all rows of a tab, each row keyed by the tab's header row.
    ///
    /// Short rows are padded with empty strings; cells beyond the header
    /// row are dropped. An empty tab yields no rows.
    pub async fn read_rows(&self, tab: &str) -> Result<Vec<BTreeMap<String, String>>, StoreError> {
        match self {
            Self::Google(sheets) => sheets.read_rows(tab).await,
            Self::Mock(store) => lock_mock(store)?.read_rows(tab),
        }
    }

    /// Append rows to a tab in a single batched call. Returns the number of
    /// rows appended, which is exactly the number passed in.
    pub async fn append_rows(
        &self,
        tab: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<usize, StoreError> {
        match self {
            Self::Google(sheets) => sheets.append_rows(tab, rows).await,
            Self::Mock(store) => lock_mock(store)?.append_rows(tab, rows),
        }
    }
}

fn lock_mock(store: &Mutex<MockStore>) -> Result<std::sync::MutexGuard<'_, MockStore>, StoreError> {
    store
        .lock()
        .map_err(|_| StoreError::Internal("mock store lock poisoned".to_string()))
}

// ---------------------------------------------------------------------------
// Google backend
// ---------------------------------------------------------------------------

pub struct GoogleSheets {
    client: reqwest::Client,
    token: String,
    spreadsheet_id: String,
    titles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AccessTokenV1 {
    access_token: String,
    #[serde(default)]
    #[allow(unused)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMetaV1 {
    #[serde(default)]
    sheets: Vec<SheetEntryV1>,
}

#[derive(Debug, Deserialize)]
struct SheetEntryV1 {
    properties: SheetPropertiesV1,
}

#[derive(Debug, Deserialize)]
struct SheetPropertiesV1 {
    title: String,
}

#[derive(Debug, Deserialize)]
struct ValueRangeV1 {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl GoogleSheets {
    async fn connect(key: ServiceAccountKey, spreadsheet_id: String) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| StoreError::Internal(format!("failed to build HTTP client: {e}")))?;

        let token = fetch_access_token(&client, &key).await?;

        let url = format!("{SHEETS_API_BASE}/{spreadsheet_id}?fields=sheets.properties.title");
        let meta: SpreadsheetMetaV1 = get_json(&client, &token, &url).await?;
        let titles: Vec<String> = meta.sheets.into_iter().map(|s| s.properties.title).collect();
        debug!(spreadsheet = %spreadsheet_id, worksheets = titles.len(), "opened spreadsheet");

        Ok(Self {
            client,
            token,
            spreadsheet_id,
            titles,
        })
    }

    async fn read_rows(&self, tab: &str) -> Result<Vec<BTreeMap<String, String>>, StoreError> {
        let url = format!(
            "{SHEETS_API_BASE}/{}/values/{tab}",
            self.spreadsheet_id
        );
        let range: ValueRangeV1 = get_json(&self.client, &self.token, &url).await?;

        let mut raw = range.values.into_iter().map(|row| {
            row.iter().map(cell_to_string).collect::<Vec<String>>()
        });
        let Some(headers) = raw.next() else {
            return Ok(Vec::new());
        };
        Ok(keyed_rows(&headers, raw))
    }

    async fn append_rows(&self, tab: &str, rows: Vec<Vec<String>>) -> Result<usize, StoreError> {
        let url = format!(
            "{SHEETS_API_BASE}/{}/values/{tab}:append?valueInputOption=RAW&insertDataOption=INSERT_ROWS",
            self.spreadsheet_id
        );
        let count = rows.len();
        let body = serde_json::json!({ "values": rows });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                status: status.as_u16(),
                message,
            });
        }
        debug!(tab, rows = count, "appended rows");
        Ok(count)
    }
}

async fn fetch_access_token(
    client: &reqwest::Client,
    key: &ServiceAccountKey,
) -> Result<String, StoreError> {
    let assertion = key.signed_jwt(chrono::Utc::now())?;
    let params = [
        ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
        ("assertion", assertion.as_str()),
    ];

    let response = client
        .post(&key.token_uri)
        .form(&params)
        .send()
        .await
        .map_err(|e| StoreError::Network(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(StoreError::Api {
            status: status.as_u16(),
            message,
        });
    }

    let token: AccessTokenV1 = response
        .json()
        .await
        .map_err(|e| StoreError::InvalidResponse(format!("token endpoint: {e}")))?;
    Ok(token.access_token)
}

async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    token: &str,
    url: &str,
) -> Result<T, StoreError> {
    let response = client
        .get(url)
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| StoreError::Network(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(StoreError::Api {
            status: status.as_u16(),
            message,
        });
    }
    response
        .json()
        .await
        .map_err(|e| StoreError::InvalidResponse(e.to_string()))
}

fn cell_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn keyed_rows<I>(headers: &[String], rows: I) -> Vec<BTreeMap<String, String>>
where
    I: IntoIterator<Item = Vec<String>>,
{
    rows.into_iter()
        .map(|row| {
            headers
                .iter()
                .enumerate()
                .map(|(i, header)| {
                    let value = row.get(i).cloned().unwrap_or_default();
                    (header.trim().to_string(), value)
                })
                .collect()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Mock backend
// ---------------------------------------------------------------------------

/// Deterministic in-memory store, same contract as the Google backend.
#[derive(Debug, Clone, Default)]
pub struct MockStore {
    tabs: BTreeMap<String, MockTab>,
}

#[derive(Debug, Clone)]
struct MockTab {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The demo fixture: a handful of middle-school math units and schools.
    ///
    /// Tabs are deliberately unsorted (and the school list carries a
    /// duplicate) so the lookup shaping is observable end to end.
    pub fn with_fixture() -> Self {
        let mut store = Self::new();
        store.insert_tab(
            UNITS_TAB,
            &["grade", "number", "units"],
            &[
                &["2", "1", "Rational Numbers and Recurring Decimals"],
                &["1", "1", "Prime Factorization"],
                &["1", "2", "Integers and Rational Numbers"],
                &["3", "1", "Square Roots and Real Numbers"],
                &["2", "2", "Monomial Arithmetic"],
                &["3", "2", "Quadratic Equations"],
            ],
        );
        store.insert_tab(
            SCHOOL_TAB,
            &["school"],
            &[
                &["Riverside Middle School"],
                &["Oakwood Middle School"],
                &["Eastwood Middle School"],
                &["Oakwood Middle School"],
            ],
        );
        store.insert_tab(
            RECORDS_TAB,
            &["date", "grade", "school", "number", "units"],
            &[],
        );
        store
    }

    pub fn insert_tab(&mut self, name: &str, headers: &[&str], rows: &[&[&str]]) {
        self.tabs.insert(
            name.to_string(),
            MockTab {
                headers: headers.iter().map(|h| h.to_string()).collect(),
                rows: rows
                    .iter()
                    .map(|row| row.iter().map(|c| c.to_string()).collect())
                    .collect(),
            },
        );
    }

    fn titles(&self) -> Vec<String> {
        self.tabs.keys().cloned().collect()
    }

    fn tab(&self, name: &str) -> Result<&MockTab, StoreError> {
        self.tabs
            .get(name)
            .ok_or_else(|| StoreError::MissingTab(name.to_string()))
    }

    fn read_rows(&self, tab: &str) -> Result<Vec<BTreeMap<String, String>>, StoreError> {
        let tab = self.tab(tab)?;
        Ok(keyed_rows(&tab.headers, tab.rows.iter().cloned()))
    }

    fn append_rows(&mut self, tab: &str, rows: Vec<Vec<String>>) -> Result<usize, StoreError> {
        let entry = self
            .tabs
            .get_mut(tab)
            .ok_or_else(|| StoreError::MissingTab(tab.to_string()))?;
        let count = rows.len();
        entry.rows.extend(rows);
        Ok(count)
    }

    /// Raw rows of a tab, for tests inspecting what was appended.
    pub fn tab_rows(&self, tab: &str) -> Option<&[Vec<String>]> {
        self.tabs.get(tab).map(|t| t.rows.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn keyed_rows_pads_short_rows_and_drops_extras() {
        let rows = keyed_rows(
            &headers(&["grade", "number", "units"]),
            vec![
                vec!["3".to_string(), "1".to_string()],
                vec![
                    "2".to_string(),
                    "1".to_string(),
                    "Fractions".to_string(),
                    "extra".to_string(),
                ],
            ],
        );
        assert_eq!(rows[0]["units"], "");
        assert_eq!(rows[1]["units"], "Fractions");
        assert_eq!(rows[1].len(), 3);
    }

    #[test]
    fn keyed_rows_trims_header_names() {
        let rows = keyed_rows(
            &headers(&[" grade ", "number"]),
            vec![vec!["1".to_string(), "2".to_string()]],
        );
        assert_eq!(rows[0]["grade"], "1");
    }

    #[test]
    fn cell_values_become_plain_strings() {
        assert_eq!(cell_to_string(&serde_json::json!("abc")), "abc");
        assert_eq!(cell_to_string(&serde_json::json!(3)), "3");
        assert_eq!(cell_to_string(&serde_json::Value::Null), "");
    }

    #[tokio::test]
    async fn mock_store_round_trips_appends() {
        let store = SheetStore::mock(MockStore::with_fixture());
        let sheets = store.open().await.unwrap();

        let appended = sheets
            .append_rows(
                RECORDS_TAB,
                vec![vec![
                    "2026-08-05".to_string(),
                    "3".to_string(),
                    "Oakwood Middle School".to_string(),
                    "1".to_string(),
                    "Square Roots and Real Numbers".to_string(),
                ]],
            )
            .await
            .unwrap();
        assert_eq!(appended, 1);

        let records = sheets.read_rows(RECORDS_TAB).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["school"], "Oakwood Middle School");
    }

    #[tokio::test]
    async fn open_requires_all_well_known_tabs() {
        let mut store = MockStore::new();
        store.insert_tab(UNITS_TAB, &["grade", "number", "units"], &[]);
        store.insert_tab(SCHOOL_TAB, &["school"], &[]);

        let err = SheetStore::mock(store).open().await.unwrap_err();
        match err {
            StoreError::MissingTab(tab) => assert_eq!(tab, RECORDS_TAB),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn reading_an_unknown_tab_fails() {
        let store = SheetStore::mock(MockStore::with_fixture());
        let sheets = store.connect().await.unwrap();
        assert!(matches!(
            sheets.read_rows("bogus").await,
            Err(StoreError::MissingTab(_))
        ));
    }
}
