use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn unitboard_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_unitboard"))
}

fn unique_run_dir(label: &str) -> PathBuf {
    let pid = std::process::id();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    let dir = std::env::temp_dir()
        .join("unitboard_server_e2e")
        .join(format!("{label}_{pid}_{nanos}"));
    fs::create_dir_all(&dir).expect("create run dir");
    dir
}

struct ChildGuard {
    child: Child,
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawn `unitboard serve --mock-store` on an auto-picked port and wait for
/// the ready file. SERVICE_KEY is scrubbed so diagnostics are deterministic.
fn spawn_mock_server(label: &str) -> (ChildGuard, String) {
    let run_dir = unique_run_dir(label);
    let ready_file = run_dir.join("ready.json");

    let child = Command::new(unitboard_bin())
        .arg("serve")
        .arg("--mock-store")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .arg("--ready-file")
        .arg(&ready_file)
        .env_remove("SERVICE_KEY")
        .spawn()
        .expect("spawn unitboard serve");
    let guard = ChildGuard { child };

    let deadline = Instant::now() + Duration::from_secs(10);
    let addr = loop {
        if Instant::now() >= deadline {
            panic!("server did not write a usable ready file");
        }
        if let Ok(text) = fs::read_to_string(&ready_file) {
            if let Ok(ready) = serde_json::from_str::<serde_json::Value>(&text) {
                if let Some(addr) = ready["addr"].as_str() {
                    break addr.to_string();
                }
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    (guard, addr)
}

fn http_exchange(addr: &str, request: &str, body: &[u8]) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
    stream.set_write_timeout(Some(Duration::from_secs(5))).ok();

    stream.write_all(request.as_bytes()).expect("write request");
    stream.write_all(body).expect("write body");
    stream.flush().ok();

    let mut response_bytes = Vec::new();
    stream
        .read_to_end(&mut response_bytes)
        .expect("read response");
    let response = String::from_utf8_lossy(&response_bytes);

    let status = response
        .lines()
        .next()
        .unwrap_or("")
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);

    let (_, body_text) = response
        .split_once("\r\n\r\n")
        .unwrap_or(("", response.as_ref()));
    (status, body_text.to_string())
}

fn http_get_text(addr: &str, path: &str) -> (u16, String) {
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    http_exchange(addr, &request, &[])
}

fn http_get_json(addr: &str, path: &str) -> (u16, serde_json::Value) {
    let (status, body) = http_get_text(addr, path);
    let json = serde_json::from_str(&body).expect("parse JSON response");
    (status, json)
}

fn http_post_json(addr: &str, path: &str, body: &serde_json::Value) -> (u16, serde_json::Value) {
    let body_bytes = serde_json::to_vec(body).expect("serialize request");
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body_bytes.len()
    );
    let (status, body) = http_exchange(addr, &request, &body_bytes);
    let json = serde_json::from_str(&body).expect("parse JSON response");
    (status, json)
}

#[test]
fn serve_mock_lookup_and_save() {
    let (_guard, addr) = spawn_mock_server("lookup_save");

    let (status, body) = http_get_text(&addr, "/healthz");
    assert_eq!(status, 200);
    assert_eq!(body.trim(), "ok");

    let (status, page) = http_get_text(&addr, "/");
    assert_eq!(status, 200);
    assert!(page.contains("saveBtn"), "form page should carry the save button");

    let (status, data) = http_get_json(&addr, "/api/data");
    assert_eq!(status, 200);
    assert_eq!(data["ok"], true);
    assert_eq!(
        data["grades"],
        serde_json::json!(["1", "2", "3"]),
        "grades sort numerically regardless of tab order"
    );
    assert_eq!(
        data["schools"],
        serde_json::json!([
            "Eastwood Middle School",
            "Oakwood Middle School",
            "Riverside Middle School"
        ]),
        "schools are deduplicated and sorted"
    );
    let grade_two = data["unitsByGrade"]["2"].as_array().expect("grade 2 units");
    assert_eq!(grade_two.len(), 2);
    assert_eq!(grade_two[0]["number"], "1");
    assert_eq!(
        grade_two[0]["unit"],
        "Rational Numbers and Recurring Decimals"
    );

    let (status, saved) = http_post_json(
        &addr,
        "/api/save",
        &serde_json::json!({
            "grade": "3",
            "school": "Oakwood Middle School",
            "units": [
                {"number": "1", "unit": "Square Roots and Real Numbers"},
                {"number": "", "unit": "Dropped"}
            ]
        }),
    );
    assert_eq!(status, 200);
    assert_eq!(saved["ok"], true);
    assert_eq!(saved["saved"], 1, "the blank-number unit is filtered out");
}

#[test]
fn serve_save_validation() {
    let (_guard, addr) = spawn_mock_server("validation");

    let (status, resp) = http_post_json(
        &addr,
        "/api/save",
        &serde_json::json!({"grade": "3", "school": "Oakwood Middle School", "units": []}),
    );
    assert_eq!(status, 400);
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"], "missing required fields");

    let (status, resp) = http_post_json(
        &addr,
        "/api/save",
        &serde_json::json!({"grade": "3", "units": [{"number": "1", "unit": "Primes"}]}),
    );
    assert_eq!(status, 400);
    assert_eq!(resp["ok"], false);

    let (status, resp) = http_post_json(
        &addr,
        "/api/save",
        &serde_json::json!({
            "grade": "3",
            "school": "  ",
            "units": [{"number": "1", "unit": "Primes"}]
        }),
    );
    assert_eq!(status, 400);
    assert_eq!(resp["ok"], false);

    let (status, resp) = http_post_json(
        &addr,
        "/api/save",
        &serde_json::json!({
            "grade": "3",
            "school": "Oakwood Middle School",
            "units": [{"number": " ", "unit": "Primes"}, {"number": "2", "unit": ""}]
        }),
    );
    assert_eq!(status, 400);
    assert_eq!(resp["error"], "nothing to save");

    let request = format!(
        "POST /api/save HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: 9\r\nConnection: close\r\n\r\n"
    );
    let (status, body) = http_exchange(&addr, &request, b"{not json");
    assert_eq!(status, 400);
    let resp: serde_json::Value = serde_json::from_str(&body).expect("error envelope");
    assert_eq!(resp["ok"], false);
}

#[test]
fn serve_debug_reports_configuration() {
    let (_guard, addr) = spawn_mock_server("debug");

    let (status, resp) = http_get_json(&addr, "/api/debug");
    assert_eq!(status, 200, "diagnostics never answer with an error status");
    assert_eq!(resp["env_length"], 0);
    assert!(resp["env_start"].is_null());
    assert!(resp["credential_status"].is_string());

    let worksheets = resp["worksheets"].as_array().expect("worksheet titles");
    for tab in ["units", "school", "records"] {
        assert!(
            worksheets.iter().any(|w| w == tab),
            "missing worksheet {tab}"
        );
    }
    assert_eq!(resp["status"], "OK");
    assert!(!resp.to_string().contains("private_key"));
}
