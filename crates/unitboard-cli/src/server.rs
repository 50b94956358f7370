//! HTTP server hosting the selection form and its API.
//!
//! Four surfaces:
//! - `GET /` — the static form page (embedded template),
//! - `GET /api/data` — lookup data reshaped from the `units`/`school` tabs,
//! - `POST /api/save` — append one record row per selected unit,
//! - `GET /api/debug` — operator diagnostics; always 200, never the secret.
//!
//! Every response is a JSON envelope `{ok: bool, ...}` except the page and
//! `/healthz`. Failures are converted to envelopes at the handler boundary;
//! nothing propagates to hyper as an unhandled fault. Requests are
//! stateless: the store is re-opened (credentials and worksheets included)
//! on every call that touches it.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use unitboard_sheets::{
    build_catalog, load_service_key, school_names, unit_rows, MockStore, SheetStore, StoreError,
    UnitEntry, RECORDS_TAB, SCHOOL_TAB, SERVICE_KEY_ENV, UNITS_TAB,
};

const FORM_PAGE: &str = include_str!("../templates/index.html");

/// How much of the raw key diagnostics may echo back. Length and prefix
/// only; the full secret never leaves the process.
const KEY_PREFIX_CHARS: usize = 60;

#[derive(Debug, Clone)]
struct ServerConfig {
    listen: SocketAddr,
    ready_file: Option<PathBuf>,
    store: SheetStore,
}

struct ServerState {
    config: ServerConfig,
}

pub(crate) fn cmd_serve(args: crate::ServeArgs) -> Result<()> {
    let store = if args.mock_store {
        SheetStore::mock(MockStore::with_fixture())
    } else {
        SheetStore::google(args.spreadsheet_id, args.key_file)
    };

    let config = ServerConfig {
        listen: args.listen,
        ready_file: args.ready_file,
        store,
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("failed to initialize tokio runtime: {e}"))?;

    rt.block_on(async move { serve_async(config).await })
}

async fn serve_async(config: ServerConfig) -> Result<()> {
    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(|e| anyhow!("serve: failed to bind {}: {e}", config.listen))?;
    let bound = listener
        .local_addr()
        .map_err(|e| anyhow!("serve: failed to read bound addr: {e}"))?;

    eprintln!(
        "serve: listening on http://{} (store={})",
        bound,
        config.store.label()
    );
    if let Some(path) = config.ready_file.as_ref() {
        let payload = serde_json::json!({
            "version": "unitboard_server_ready_v1",
            "addr": bound.to_string(),
            "pid": std::process::id(),
        });
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(path, serde_json::to_string_pretty(&payload).unwrap_or_default()).ok();
    }

    let state = Arc::new(ServerState { config });

    loop {
        let (stream, _peer) = listener
            .accept()
            .await
            .map_err(|e| anyhow!("serve: accept failed: {e}"))?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, state.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                eprintln!("serve: connection error: {e}");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServerState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let resp = match (method, path.as_str()) {
        (Method::GET, "/") => html_response(StatusCode::OK, FORM_PAGE),
        (Method::GET, "/healthz") => text_response(StatusCode::OK, "ok\n"),
        (Method::GET, "/api/data") => match handle_data(&state).await {
            Ok(r) => r,
            Err(e) => store_error_response(e),
        },
        (Method::POST, "/api/save") => {
            let body = req.into_body().collect().await?.to_bytes().to_vec();
            match handle_save(&state, &body).await {
                Ok(r) => r,
                Err(e) => store_error_response(e),
            }
        }
        (Method::GET, "/api/debug") => handle_debug(&state).await,
        _ => json_error(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(resp)
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct DataResponseV1 {
    ok: bool,
    grades: Vec<String>,
    schools: Vec<String>,
    #[serde(rename = "unitsByGrade")]
    units_by_grade: BTreeMap<String, Vec<UnitEntry>>,
}

async fn handle_data(state: &Arc<ServerState>) -> Result<Response<Full<Bytes>>, StoreError> {
    let sheets = state.config.store.open().await?;
    let unit_records = sheets.read_rows(UNITS_TAB).await?;
    let school_records = sheets.read_rows(SCHOOL_TAB).await?;

    let catalog = build_catalog(unit_rows(&unit_records), school_names(&school_records));
    Ok(json_response(
        StatusCode::OK,
        &DataResponseV1 {
            ok: true,
            grades: catalog.grades,
            schools: catalog.schools,
            units_by_grade: catalog.units_by_grade,
        },
    ))
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct SaveRequestV1 {
    #[serde(default)]
    grade: String,
    #[serde(default)]
    school: String,
    #[serde(default)]
    units: Vec<SaveUnitV1>,
}

#[derive(Debug, Clone, Deserialize)]
struct SaveUnitV1 {
    #[serde(default)]
    number: String,
    #[serde(default)]
    unit: String,
}

#[derive(Debug, Clone, Serialize)]
struct SaveResponseV1 {
    ok: bool,
    saved: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveRejection {
    MissingFields,
    NothingToSave,
}

impl SaveRejection {
    fn message(self) -> &'static str {
        match self {
            Self::MissingFields => "missing required fields",
            Self::NothingToSave => "nothing to save",
        }
    }
}

/// Turn a save request into record rows, or reject it.
///
/// Rejection happens before any store access: a request without grade,
/// school, and at least one unit never leaves the process. Units whose
/// number or name trim to empty are dropped; dropping all of them is its
/// own rejection so the caller can tell "bad form" from "empty selection".
fn plan_record_rows(req: &SaveRequestV1, date: &str) -> Result<Vec<Vec<String>>, SaveRejection> {
    let grade = req.grade.trim();
    let school = req.school.trim();
    if grade.is_empty() || school.is_empty() || req.units.is_empty() {
        return Err(SaveRejection::MissingFields);
    }

    let rows: Vec<Vec<String>> = req
        .units
        .iter()
        .filter_map(|u| {
            let number = u.number.trim();
            let unit = u.unit.trim();
            if number.is_empty() || unit.is_empty() {
                return None;
            }
            Some(vec![
                date.to_string(),
                grade.to_string(),
                school.to_string(),
                number.to_string(),
                unit.to_string(),
            ])
        })
        .collect();

    if rows.is_empty() {
        return Err(SaveRejection::NothingToSave);
    }
    Ok(rows)
}

fn today() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

async fn handle_save(
    state: &Arc<ServerState>,
    body: &[u8],
) -> Result<Response<Full<Bytes>>, StoreError> {
    let req: SaveRequestV1 = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            return Ok(json_error(
                StatusCode::BAD_REQUEST,
                &format!("failed to parse save request JSON: {e}"),
            ));
        }
    };

    let rows = match plan_record_rows(&req, &today()) {
        Ok(rows) => rows,
        Err(reject) => return Ok(json_error(StatusCode::BAD_REQUEST, reject.message())),
    };

    let sheets = state.config.store.open().await?;
    let saved = sheets.append_rows(RECORDS_TAB, rows).await?;

    Ok(json_response(
        StatusCode::OK,
        &SaveResponseV1 { ok: true, saved },
    ))
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct DebugResponseV1 {
    env_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    env_start: Option<String>,
    credential_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    worksheets: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sheets_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
}

fn key_prefix(raw: &str) -> String {
    raw.chars().take(KEY_PREFIX_CHARS).collect()
}

/// Operator diagnostics. Every failure path lands in the response body;
/// this endpoint never answers with anything but 200.
async fn handle_debug(state: &Arc<ServerState>) -> Response<Full<Bytes>> {
    let raw = std::env::var(SERVICE_KEY_ENV)
        .ok()
        .filter(|v| !v.is_empty());

    let mut resp = DebugResponseV1 {
        env_length: raw.as_deref().map(|r| r.chars().count()).unwrap_or(0),
        env_start: raw.as_deref().map(key_prefix),
        credential_status: String::new(),
        worksheets: None,
        sheets_error: None,
        trace: None,
        status: None,
    };

    match &state.config.store {
        SheetStore::Mock(_) => {
            resp.credential_status = "mock store (credentials unused)".to_string();
        }
        SheetStore::Google { key_file, .. } => {
            match load_service_key(key_file.as_deref()) {
                Ok(_) => resp.credential_status = "OK".to_string(),
                Err(e) => {
                    resp.credential_status = e.to_string();
                    return json_response(StatusCode::OK, &resp);
                }
            }
        }
    }

    match state
        .config
        .store
        .connect()
        .await
        .and_then(|sheets| sheets.worksheet_titles())
    {
        Ok(titles) => {
            resp.worksheets = Some(titles);
            resp.status = Some("OK".to_string());
        }
        Err(e) => {
            let err = anyhow::Error::new(e);
            resp.sheets_error = Some(err.to_string());
            resp.trace = Some(format!("{err:?}"));
        }
    }

    json_response(StatusCode::OK, &resp)
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"internal error"))))
}

fn html_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"internal error"))))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{\"ok\":false}".to_vec());
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"{\"ok\":false}"))))
}

fn json_error(status: StatusCode, msg: &str) -> Response<Full<Bytes>> {
    let v = serde_json::json!({ "ok": false, "error": msg });
    json_response(status, &v)
}

/// 500 envelope for credential/store failures: message plus the rendered
/// error chain as `trace`.
fn store_error_response(err: StoreError) -> Response<Full<Bytes>> {
    let err = anyhow::Error::new(err);
    let v = serde_json::json!({
        "ok": false,
        "error": err.to_string(),
        "trace": format!("{err:?}"),
    });
    json_response(StatusCode::INTERNAL_SERVER_ERROR, &v)
}
