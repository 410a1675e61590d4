use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tiny_http::Method;
use tungstenite::stream::MaybeTlsStream;

use treegui::client::snapshot::ViewNode;
use treegui::config_file::ConfigError;
use treegui::load_config;
use treegui::render::{RenderOptions, render_gui};
use treegui::server::{App, GuiServer, IncomingRequest, route};

const CALCULATOR: &str = r#"
treegui_version: "0.1.0"
server:
  address: "127.0.0.1:0"
  page: page.html
name: root
short: Calculator
persistent_flags:
  - name: timeout
    type: int
    default: 30
children:
  - name: add
    short: Add two numbers
    cmd: echo $((FLAG_NUM1 + FLAG_NUM2))
    flags:
      - name: num1
        type: int
        default: 1
      - name: num2
        type: int
        default: 1
  - name: cat
    cmd: for f in $(echo "$FLAG_INPUTS" | tr ',' ' '); do cat "$f"; done
    flags:
      - name: inputs
        type: stringSlice
        uploadable: true
  - name: fail
    cmd: echo broken >&2; exit 3
"#;

fn write_config(dir: &std::path::Path, content: &str) -> String {
    let path = dir.join(".treegui.yaml");
    std::fs::write(&path, content).unwrap();
    path.to_string_lossy().to_string()
}

fn calculator_app(dir: &std::path::Path) -> App {
    std::fs::write(dir.join("page.html"), "<html><body>{{gui}}</body></html>").unwrap();
    let path = write_config(dir, CALCULATOR);
    let (root, server, _) = load_config(Some(&path)).unwrap();
    App::from_config(Arc::new(root), &server).unwrap()
}

#[test]
fn test_load_config_minimal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("page.html"), "{{gui}}").unwrap();
    let path = write_config(dir.path(), CALCULATOR);
    let (root, server, config_path) = load_config(Some(&path)).unwrap();
    assert_eq!(root.name, "root");
    assert_eq!(root.short, "Calculator");
    assert_eq!(root.children.len(), 3);
    assert_eq!(root.children[0].flags.len(), 2);
    assert_eq!(server.address, "127.0.0.1:0");
    assert_eq!(server.page, Some(dir.path().join("page.html")));
    assert!(server.live_output);
    assert_eq!(config_path.to_string_lossy(), path);
}

#[test]
fn test_load_config_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".treegui.json");
    std::fs::write(
        &path,
        r#"{"treegui_version": "0.1.0", "name": "tool", "flags": [{"name": "names", "type": "string-list", "default": ["a", "b,c"]}]}"#,
    )
    .unwrap();
    let (root, server, _) = load_config(Some(&path.to_string_lossy())).unwrap();
    assert_eq!(root.name, "tool");
    assert_eq!(
        root.flags[0].default.as_str_list().unwrap(),
        ["a".to_string(), "b,c".to_string()]
    );
    assert_eq!(server.address, "127.0.0.1:8080");
}

#[test]
fn test_load_config_missing_file() {
    assert!(matches!(
        load_config(Some("/definitely/not/here/.treegui.yaml")),
        Err(ConfigError::ConfigNotFound(_))
    ));
}

#[test]
fn test_load_config_duplicate_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
treegui_version: "0.1.0"
name: root
persistent_flags:
  - name: verbose
    type: bool
children:
  - name: run
    flags:
      - name: verbose
        type: bool
"#,
    );
    match load_config(Some(&path)).unwrap_err() {
        ConfigError::DuplicateFlag { command, flag } => {
            assert_eq!(command, "run");
            assert_eq!(flag, "verbose");
        }
        other => panic!("Expected DuplicateFlag, got: {other:?}"),
    }
}

#[test]
fn test_load_config_invalid_default() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
treegui_version: "0.1.0"
name: root
flags:
  - name: count
    type: int
    default: many
"#,
    );
    assert!(matches!(
        load_config(Some(&path)),
        Err(ConfigError::InvalidDefault { .. })
    ));
}

#[test]
fn test_load_config_missing_cwd() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
treegui_version: "0.1.0"
name: root
children:
  - name: build
    cwd: ./does-not-exist
    cmd: make
"#,
    );
    assert!(matches!(
        load_config(Some(&path)),
        Err(ConfigError::DirectoryNotFound { .. })
    ));
}

#[test]
fn test_rendered_containers_match_tree() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("page.html"), "{{gui}}").unwrap();
    let path = write_config(dir.path(), CALCULATOR);
    let (root, _, _) = load_config(Some(&path)).unwrap();
    let html = render_gui(&root, &RenderOptions::default());

    let container =
        Regex::new(r#"<div data-gui-node data-gui-name="([^"]+)" data-gui-path="([^"]+)"( style="display:none;")?>"#)
            .unwrap();
    let found: Vec<(String, bool)> = container
        .captures_iter(&html)
        .map(|c| (c[2].to_string(), c.get(3).is_none()))
        .collect();
    assert_eq!(
        found,
        [
            ("root".to_string(), true),
            ("root/add".to_string(), false),
            ("root/cat".to_string(), false),
            ("root/fail".to_string(), false),
        ]
    );
    assert_eq!(found.len(), root.count());
}

#[test]
fn test_end_to_end_add() {
    let dir = tempfile::tempdir().unwrap();
    let app = calculator_app(dir.path());
    let reply = route(
        &app,
        &IncomingRequest::new(Method::Get, "/root/add?num1=5&num2=7"),
    );
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body_text(), "12\n");

    // Values from the previous request do not stick
    let reply = route(&app, &IncomingRequest::new(Method::Post, "/root/add"));
    assert_eq!(reply.body_text(), "2\n");
}

#[test]
fn test_end_to_end_unknown_command() {
    let dir = tempfile::tempdir().unwrap();
    let app = calculator_app(dir.path());
    let reply = route(&app, &IncomingRequest::new(Method::Get, "/root/unknown"));
    assert_eq!(reply.status, 404);
}

#[test]
fn test_end_to_end_failing_command() {
    let dir = tempfile::tempdir().unwrap();
    let app = calculator_app(dir.path());
    let reply = route(&app, &IncomingRequest::new(Method::Get, "/root/fail"));
    assert_eq!(reply.status, 500);
    assert!(reply.body_text().contains("broken"));
}

#[test]
fn test_end_to_end_page() {
    let dir = tempfile::tempdir().unwrap();
    let app = calculator_app(dir.path());
    let reply = route(&app, &IncomingRequest::new(Method::Get, "/"));
    assert_eq!(reply.status, 200);
    let page = reply.body_text();
    assert!(page.starts_with("<html><body><div class=\"treegui\" id=\"gui-root\">"));
    assert!(page.contains(r#""live":true"#));
}

#[test]
fn test_upload_then_execute() {
    let dir = tempfile::tempdir().unwrap();
    let app = calculator_app(dir.path());
    let body = "--xx\r\nContent-Disposition: form-data; name=\"name\"\r\n\r\ninputs\r\n\
                --xx\r\nContent-Disposition: form-data; name=\"type\"\r\n\r\nstringSlice\r\n\
                --xx\r\nContent-Disposition: form-data; name=\"data\"; filename=\"a.txt\"\r\n\r\nalpha\n\r\n\
                --xx\r\nContent-Disposition: form-data; name=\"data\"; filename=\"b.txt\"\r\n\r\nbeta\n\r\n\
                --xx--\r\n";
    let upload = route(
        &app,
        &IncomingRequest::new(Method::Post, "/upload")
            .with_body("multipart/form-data; boundary=xx", body),
    );
    assert_eq!(upload.status, 200);
    let path: serde_json::Value = serde_json::from_slice(&upload.body).unwrap();
    let path = path["path"].as_str().unwrap().to_string();

    let mut view = ViewNode::initial(app.dispatcher().root());
    view.select(&["root"], "cat").unwrap();
    view.set_flag(&["root", "cat"], "inputs", vec![path]).unwrap();
    let target = view.collect().request_target();

    let reply = route(&app, &IncomingRequest::new(Method::Post, target));
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body_text(), "alpha\nbeta\n");
}

fn http_get(addr: SocketAddr, target: &str) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    write!(
        stream,
        "GET {target} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"
    )
    .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

#[tokio::test(flavor = "multi_thread")]
async fn test_live_output_over_websocket() {
    let dir = tempfile::tempdir().unwrap();
    let app = calculator_app(dir.path());
    let server = GuiServer::bind("127.0.0.1:0", app).unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let running = tokio::spawn(server.run());

    tokio::task::spawn_blocking(move || {
        let (mut ws, _) = tungstenite::connect(format!("ws://{addr}/ws")).unwrap();
        if let MaybeTlsStream::Plain(stream) = ws.get_ref() {
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
        }

        let response = http_get(addr, "/root/add?num1=5&num2=7");
        assert!(response.ends_with("\r\n\r\n12\n"), "{response}");
        let message = ws.read().unwrap();
        assert_eq!(message.to_text().unwrap(), "12\n");

        // The server answers the close handshake and drops the connection
        ws.close(None).unwrap();
        loop {
            match ws.read() {
                Ok(message) => assert!(message.is_close(), "{message:?}"),
                Err(tungstenite::Error::ConnectionClosed) => break,
                Err(e) => panic!("Expected the close handshake to finish, got: {e}"),
            }
        }
    })
    .await
    .unwrap();

    shutdown.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_over_tcp() {
    let dir = tempfile::tempdir().unwrap();
    let app = calculator_app(dir.path());
    let server = GuiServer::bind("127.0.0.1:0", app).unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let running = tokio::spawn(server.run());

    let response = tokio::task::spawn_blocking(move || http_get(addr, "/root/add?num1=5&num2=7"))
        .await
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("\r\n\r\n12\n"), "{response}");

    shutdown.shutdown();
    running.await.unwrap().unwrap();
}
