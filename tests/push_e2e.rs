//! End-to-end push-pipeline tests against in-process control and HTTP
//! servers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use driftsync::auth::User;
use driftsync::contract::{ApiResult, ApiType, FileServerInfo, Status};
use driftsync::ignore::{GlobIgnore, NoIgnore};
use driftsync::protocol::code;
use driftsync::push::PushClientSync;
use driftsync::retry::Retry;
use driftsync::syncer::Syncer;
use driftsync::transport::{encode_frame, read_frame};
use driftsync::vfs::Vfs;

// ---------------------------------------------------------------------------
// fake control server (framed handshake endpoint)
// ---------------------------------------------------------------------------

async fn spawn_control_server(http_origin: String) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let origin = http_origin.clone();
            tokio::spawn(async move {
                while let Ok(frame) = read_frame(&mut sock).await {
                    if frame.starts_with(b"auth") {
                        let status = Status::new(ApiType::Auth, code::SUCCESS, "ok");
                        let _ = sock
                            .write_all(&encode_frame(&serde_json::to_vec(&status).unwrap()))
                            .await;
                    } else if frame == b"info" {
                        let info = FileServerInfo {
                            status: Status::new(ApiType::Info, code::SUCCESS, "success"),
                            server_addr: origin.clone(),
                            push_addr: "/upload".to_string(),
                            source_path: "/source".to_string(),
                        };
                        let _ = sock
                            .write_all(&encode_frame(&serde_json::to_vec(&info).unwrap()))
                            .await;
                    }
                }
            });
        }
    });
    port
}

// ---------------------------------------------------------------------------
// fake HTTP server (push + signin endpoints)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn content_type(&self) -> &str {
        self.headers.get("content-type").map(|s| s.as_str()).unwrap_or("")
    }

    fn is_multipart(&self) -> bool {
        self.content_type().starts_with("multipart/form-data")
    }

    fn is_urlencoded(&self) -> bool {
        self.content_type()
            .starts_with("application/x-www-form-urlencoded")
    }
}

type Handler =
    Arc<dyn Fn(&HttpRequest) -> (u16, Vec<(String, String)>, String) + Send + Sync>;

struct FakeHttpServer {
    port: u16,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl FakeHttpServer {
    async fn spawn(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests: Arc<Mutex<Vec<HttpRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let reqs = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                let handler = handler.clone();
                let reqs = reqs.clone();
                tokio::spawn(async move {
                    if let Some(req) = read_http_request(&mut sock).await {
                        let (status, headers, body) = handler(&req);
                        reqs.lock().push(req);
                        let reason = match status {
                            200 => "OK",
                            401 => "Unauthorized",
                            404 => "Not Found",
                            _ => "Status",
                        };
                        let mut resp = format!("HTTP/1.1 {} {}\r\n", status, reason);
                        resp.push_str("Content-Type: application/json\r\n");
                        for (k, v) in &headers {
                            resp.push_str(&format!("{}: {}\r\n", k, v));
                        }
                        resp.push_str(&format!("Content-Length: {}\r\n", body.len()));
                        resp.push_str("Connection: close\r\n\r\n");
                        resp.push_str(&body);
                        let _ = sock.write_all(resp.as_bytes()).await;
                        let _ = sock.flush().await;
                    }
                });
            }
        });
        Self { port, requests }
    }

    fn origin(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }
}

async fn read_http_request(sock: &mut TcpStream) -> Option<HttpRequest> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];
    let header_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = sock.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let header_text = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = header_text.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = sock.read(&mut tmp).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&tmp[..n]);
    }

    Some(HttpRequest {
        method,
        path,
        headers,
        body,
    })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

fn api_ok() -> String {
    serde_json::to_string(&ApiResult::<serde_json::Value>::ok(serde_json::Value::Null)).unwrap()
}

fn always_ok_handler() -> Handler {
    Arc::new(|_req| (200, Vec::new(), api_ok()))
}

async fn connect_pusher(
    source_dir: &std::path::Path,
    control_port: u16,
    users: Vec<User>,
    exclude: Vec<String>,
) -> Arc<PushClientSync> {
    let source = Vfs::parse(&source_dir.to_string_lossy()).unwrap();
    let dest = Vfs::parse(&format!("drift://127.0.0.1:{}/dest", control_port)).unwrap();
    let ignore: Arc<dyn driftsync::ignore::IgnorePolicy> = if exclude.is_empty() {
        Arc::new(NoIgnore)
    } else {
        Arc::new(GlobIgnore::new(exclude))
    };
    PushClientSync::connect(
        source,
        dest,
        users,
        None,
        ignore,
        Retry::new(5, Duration::from_millis(20), Duration::from_millis(200)),
    )
    .await
    .unwrap()
}

// ---------------------------------------------------------------------------
// scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_small_file_sends_multipart_with_hash() {
    let http = FakeHttpServer::spawn(always_ok_handler()).await;
    let control_port = spawn_control_server(http.origin()).await;

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), b"hello\n").unwrap();

    let pusher = connect_pusher(
        src.path(),
        control_port,
        vec![User::new("alice", "secret").unwrap()],
        Vec::new(),
    )
    .await;
    assert_eq!(pusher.push_addr(), format!("{}/upload", http.origin()));

    pusher
        .write(&src.path().join("a.txt").to_string_lossy())
        .await
        .unwrap();

    let reqs = http.requests();
    assert_eq!(reqs.len(), 1);
    let req = &reqs[0];
    assert_eq!(req.method, "POST");
    assert_eq!(req.path, "/upload");
    assert!(req.is_multipart(), "write must be multipart: {}", req.content_type());
    let body = req.body_text();
    assert!(body.contains("name=\"FileInfo\""));
    assert!(body.contains("name=\"UpFile\""));
    assert!(body.contains("hello\n"));
    assert!(body.contains("b1946ac92492d2347c6235b4d2611184"));
    assert!(body.contains("\"Size\":6"));
    assert!(body.contains("\"Path\":\"a.txt\""));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auto_login_on_401_retries_exactly_once() {
    let uploads = Arc::new(AtomicU32::new(0));
    let u = uploads.clone();
    let handler: Handler = Arc::new(move |req| {
        if req.path == "/signin" {
            return (
                200,
                vec![
                    (
                        "Set-Cookie".to_string(),
                        "session=abc123; Path=/; HttpOnly".to_string(),
                    ),
                    ("Set-Cookie".to_string(), "csrf=xyz".to_string()),
                ],
                api_ok(),
            );
        }
        if u.fetch_add(1, Ordering::SeqCst) == 0 {
            (401, Vec::new(), String::new())
        } else {
            (200, Vec::new(), api_ok())
        }
    });
    let http = FakeHttpServer::spawn(handler).await;
    let control_port = spawn_control_server(http.origin()).await;

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), b"hello\n").unwrap();

    let pusher = connect_pusher(
        src.path(),
        control_port,
        vec![User::new("alice", "secret").unwrap()],
        Vec::new(),
    )
    .await;
    pusher
        .write(&src.path().join("a.txt").to_string_lossy())
        .await
        .unwrap();

    let reqs = http.requests();
    let paths: Vec<&str> = reqs.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(paths, vec!["/upload", "/signin", "/upload"]);
    assert!(reqs[0].headers.get("cookie").is_none());
    let retry_cookie = reqs[2].headers.get("cookie").unwrap();
    assert!(retry_cookie.contains("session=abc123"));
    assert!(retry_cookie.contains("csrf=xyz"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persistent_401_without_cookies_fails() {
    let handler: Handler = Arc::new(|req| {
        if req.path == "/signin" {
            // no cookies returned
            (200, Vec::new(), api_ok())
        } else {
            (401, Vec::new(), String::new())
        }
    });
    let http = FakeHttpServer::spawn(handler).await;
    let control_port = spawn_control_server(http.origin()).await;

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), b"x").unwrap();

    let pusher = connect_pusher(
        src.path(),
        control_port,
        vec![User::new("alice", "secret").unwrap()],
        Vec::new(),
    )
    .await;
    let err = pusher
        .create(&src.path().join("a.txt").to_string_lossy())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unauthorized"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_endpoint_404_is_a_permanent_error() {
    let handler: Handler = Arc::new(|_req| (404, Vec::new(), String::new()));
    let http = FakeHttpServer::spawn(handler).await;
    let control_port = spawn_control_server(http.origin()).await;

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), b"x").unwrap();

    let pusher = connect_pusher(src.path(), control_port, Vec::new(), Vec::new()).await;
    let err = pusher
        .create(&src.path().join("a.txt").to_string_lossy())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unsupported"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_once_emits_create_then_write_per_file() {
    let http = FakeHttpServer::spawn(always_ok_handler()).await;
    let control_port = spawn_control_server(http.origin()).await;

    let src = tempfile::tempdir().unwrap();
    std::fs::create_dir(src.path().join("dir1")).unwrap();
    std::fs::write(src.path().join("dir1/a"), b"hello\n").unwrap();
    std::fs::write(src.path().join("b"), b"hello\n").unwrap();

    let pusher = connect_pusher(src.path(), control_port, Vec::new(), Vec::new()).await;
    pusher
        .sync_once(&src.path().to_string_lossy())
        .await
        .unwrap();

    let reqs = http.requests();
    assert_eq!(reqs.len(), 5, "3 creates + 2 writes expected");
    assert_eq!(reqs.iter().filter(|r| r.is_urlencoded()).count(), 3);
    assert_eq!(reqs.iter().filter(|r| r.is_multipart()).count(), 2);
    // walk order is sorted by file name: b, dir1, dir1/a
    let kinds: Vec<&str> = reqs
        .iter()
        .map(|r| if r.is_multipart() { "write" } else { "create" })
        .collect();
    assert_eq!(kinds, vec!["create", "write", "create", "create", "write"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_once_skips_ignored_subtrees() {
    let http = FakeHttpServer::spawn(always_ok_handler()).await;
    let control_port = spawn_control_server(http.origin()).await;

    let src = tempfile::tempdir().unwrap();
    std::fs::create_dir(src.path().join("logs")).unwrap();
    std::fs::write(src.path().join("logs/debug.log"), b"noise").unwrap();
    std::fs::write(src.path().join("keep.txt"), b"data").unwrap();

    let pusher = connect_pusher(
        src.path(),
        control_port,
        Vec::new(),
        vec!["logs".to_string()],
    )
    .await;
    pusher
        .sync_once(&src.path().to_string_lossy())
        .await
        .unwrap();

    let reqs = http.requests();
    // keep.txt only: one create + one write
    assert_eq!(reqs.len(), 2);
    for r in &reqs {
        assert!(!r.body_text().contains("debug.log"));
    }
}
