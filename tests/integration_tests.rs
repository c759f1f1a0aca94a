//! Integration tests for sls-proxy.
//!
//! These tests verify the complete behavior of the proxy components
//! working together, against a minimal in-process HTTP upstream.

use sls_proxy::config::{AppConfig, ConfigManager, ServerConfig};
use sls_proxy::directory::UpstreamTarget;
use sls_proxy::overrides::{apply_overrides, OverrideRule, OverrideTable};
use sls_proxy::proxy::SlsProxy;
use sls_proxy::xml;
use std::io::{Seek, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const DIRECTORY_PATH: &str = "/servers/list.en";

const ALPHA: &str = r#"<servers><server><id>7</id><ip>10.0.0.1</ip><port>1234</port><name><![CDATA[Alpha]]></name><crowdness sort="5"/></server></servers>"#;

/// Helper to create a temporary config file.
fn create_temp_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn rule(ip: Option<&str>, overwrite: bool) -> OverrideRule {
    OverrideRule {
        ip: ip.map(str::to_string),
        overwrite,
        ..Default::default()
    }
}

fn single_rule(id: &str, rule: OverrideRule) -> OverrideTable {
    let mut table = OverrideTable::new();
    table.insert(id.to_string(), rule);
    table
}

mod config_tests {
    use super::*;

    #[test]
    fn test_full_config_load() {
        let yaml = r#"
upstream:
  url: "http://sls.service.enmasse.com:8080/servers/list.en"

server:
  hostname: "0.0.0.0"
  port: 9080
  connect_timeout: 3
  read_timeout: 20
  write_timeout: 20
  total_timeout: 40
  max_directory_size: 65536

logging:
  level: "debug"
  output: "stderr"
  format: "json"
  include_target: false

servers:
  "4004":
    ip: "10.0.0.5"
    port: 9250
    name: "Private"
    overwrite: true
  "4005":
    name: "Loopback copy"
"#;
        let file = create_temp_config(yaml);
        let config = AppConfig::load(file.path()).unwrap();

        assert_eq!(config.server.hostname, "0.0.0.0");
        assert_eq!(config.server.port, Some(9080));
        assert_eq!(config.server.total_timeout, 40);
        assert_eq!(config.server.max_directory_size, 65536);
        assert_eq!(config.logging.output, "stderr");

        assert_eq!(config.servers.len(), 2);
        assert!(config.servers["4004"].overwrite);
        assert_eq!(config.servers["4004"].port.as_deref(), Some("9250"));
        assert_eq!(config.servers["4005"].effective_ip(), "127.0.0.1");
    }

    #[test]
    fn test_minimal_config() {
        let yaml = "# Empty config uses defaults\n{}";
        let file = create_temp_config(yaml);
        let config = AppConfig::load(file.path()).unwrap();

        let target = config.upstream_target().unwrap();
        assert_eq!(target.host, "sls.service.enmasse.com");
        assert_eq!(target.port, 8080);
        assert_eq!(config.server.hostname, "127.0.0.1");
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_malformed_rules_rejected_at_load() {
        let yaml = r#"
servers:
  "1":
    ip: "10.0.0.1"
    colour: "red"
"#;
        let file = create_temp_config(yaml);
        assert!(AppConfig::load(file.path()).is_err());

        let yaml = r#"
servers:
  "1":
    port: "eighty"
"#;
        let file = create_temp_config(yaml);
        assert!(AppConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_config_manager_reload() {
        let yaml = r#"
servers:
  "1":
    ip: "10.0.0.1"
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();

        let manager = ConfigManager::new(file.path()).unwrap();
        assert_eq!(manager.get().servers.len(), 1);

        let new_yaml = r#"
servers:
  "1":
    ip: "10.0.0.1"
  "2":
    ip: "10.0.0.2"
    overwrite: true
"#;
        file.rewind().unwrap();
        file.write_all(new_yaml.as_bytes()).unwrap();
        file.flush().unwrap();

        manager.reload().unwrap();
        let config = manager.get();
        assert_eq!(config.servers.len(), 2);
        assert!(config.servers["2"].overwrite);
    }

    #[test]
    fn test_invalid_reload_keeps_previous_config() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"servers:\n  \"1\": { ip: \"10.0.0.1\" }\n").unwrap();
        file.flush().unwrap();

        let manager = ConfigManager::new(file.path()).unwrap();

        file.as_file().set_len(0).unwrap();
        file.rewind().unwrap();
        file.write_all(b"servers:\n  \"1\": { ip: \"bogus\" }\n").unwrap();
        file.flush().unwrap();

        assert!(manager.reload().is_err());
        assert_eq!(
            manager.get().servers["1"].ip.as_deref(),
            Some("10.0.0.1")
        );
    }
}

mod rewrite_tests {
    use super::*;

    fn rewrite(input: &str, table: &OverrideTable) -> String {
        let mut doc = xml::parse(input.as_bytes()).unwrap();
        apply_overrides(&mut doc, table);
        String::from_utf8(doc.serialize()).unwrap()
    }

    #[test]
    fn test_duplicate_scenario() {
        let output = rewrite(ALPHA, &single_rule("7", rule(Some("1.2.3.4"), false)));
        assert_eq!(
            output,
            concat!(
                "<servers>",
                r#"<server><id>7</id><ip>10.0.0.1</ip><port>1234</port><name><![CDATA[Alpha]]></name><crowdness sort="5"/></server>"#,
                r#"<server><id>7</id><ip>1.2.3.4</ip><port>1234</port><name><![CDATA[Alpha]]></name><crowdness sort="0"/></server>"#,
                "</servers>"
            )
        );
    }

    #[test]
    fn test_overwrite_scenario() {
        let output = rewrite(ALPHA, &single_rule("7", rule(Some("1.2.3.4"), true)));
        assert_eq!(
            output,
            r#"<servers><server><id>7</id><ip>1.2.3.4</ip><port>1234</port><name><![CDATA[Alpha]]></name><crowdness sort="5"/></server></servers>"#
        );
    }

    #[test]
    fn test_unknown_content_round_trips() {
        let input = r#"<?xml version="1.0" encoding="UTF-8"?>
<serverlist region="eu">
  <server flag="new">
    <id>12</id>
    <ip>10.1.1.1</ip>
    <category sort="2"><![CDATA[PvP]]></category>
    <lang>en</lang>
  </server>
</serverlist>"#;
        let output = rewrite(input, &single_rule("99", rule(None, false)));
        assert_eq!(output, input);
    }
}

/// Minimal HTTP/1.1 upstream serving canned responses.
struct FakeUpstream {
    port: u16,
    requests: Arc<Mutex<Vec<String>>>,
    directory: Arc<Mutex<String>>,
}

impl FakeUpstream {
    async fn start(directory: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let directory = Arc::new(Mutex::new(directory.to_string()));

        let seen = requests.clone();
        let body_source = directory.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let seen = seen.clone();
                let body_source = body_source.clone();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&buf[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&head).to_string();
                    let path = head
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or("/")
                        .split('?')
                        .next()
                        .unwrap_or("/")
                        .to_string();
                    seen.lock().unwrap().push(head);

                    let (content_type, body) = if path == DIRECTORY_PATH {
                        ("text/xml", body_source.lock().unwrap().clone())
                    } else {
                        ("text/plain", "hello from upstream".to_string())
                    };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        content_type,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self {
            port,
            requests,
            directory,
        }
    }

    fn url(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, DIRECTORY_PATH)
    }

    fn set_directory(&self, body: &str) {
        *self.directory.lock().unwrap() = body.to_string();
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn proxy_settings(port: u16) -> ServerConfig {
    ServerConfig {
        port: Some(port),
        connect_timeout: 2,
        read_timeout: 5,
        write_timeout: 5,
        total_timeout: 5,
        ..Default::default()
    }
}

async fn get(url: &str) -> reqwest::Response {
    reqwest::get(url).await.unwrap()
}

/// Upstream that accepts connections and never answers.
async fn stalled_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    port
}

/// Upstream that answers every request with the same raw response.
async fn canned_upstream(response: String) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let response = response.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                if stream.read(&mut buf).await.unwrap_or(0) == 0 {
                    return;
                }
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    port
}

/// Upstream that sends headers and then one body byte every 200ms.
async fn trickling_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                if stream.read(&mut buf).await.unwrap_or(0) == 0 {
                    return;
                }
                let head = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 1000\r\n\r\n";
                if stream.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                for _ in 0..1000 {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    if stream.write_all(b"x").await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    port
}

mod fetch_tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_directory() {
        let upstream = FakeUpstream::start(ALPHA).await;
        let target = UpstreamTarget::from_url(&upstream.url()).unwrap();
        let proxy = SlsProxy::new(target, ServerConfig::default(), OverrideTable::new()).unwrap();

        let servers = proxy.fetch_directory().await.unwrap();
        assert_eq!(servers.len(), 1);
        let alpha = &servers["7"];
        assert_eq!(alpha.ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(alpha.port.as_deref(), Some("1234"));
        assert_eq!(alpha.name.as_deref(), Some("Alpha"));
        assert_eq!(alpha.sort.as_deref(), Some("5"));

        let requests = upstream.requests();
        assert!(requests[0].starts_with(&format!("GET {} ", DIRECTORY_PATH)));
    }

    #[tokio::test]
    async fn test_fetch_malformed_directory_is_an_error() {
        let upstream = FakeUpstream::start("<servers><server><id>7").await;
        let target = UpstreamTarget::from_url(&upstream.url()).unwrap();
        let proxy = SlsProxy::new(target, ServerConfig::default(), OverrideTable::new()).unwrap();

        assert!(proxy.fetch_directory().await.is_err());
    }
}

mod proxy_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_directory_is_rewritten_and_other_paths_pass_through() {
        let upstream = FakeUpstream::start(ALPHA).await;
        let target = UpstreamTarget::from_url(&upstream.url()).unwrap();
        let port = free_port();
        let proxy = SlsProxy::new(
            target,
            proxy_settings(port),
            single_rule("7", rule(Some("1.2.3.4"), false)),
        )
        .unwrap();

        let addr = proxy.start("127.0.0.1").await.unwrap();
        assert_eq!(addr, format!("127.0.0.1:{}", port));
        assert!(proxy.start("127.0.0.1").await.is_err());

        let body = get(&format!("http://{}{}?lang=en", addr, DIRECTORY_PATH))
            .await
            .text()
            .await
            .unwrap();
        assert!(body.contains("<ip>10.0.0.1</ip>"));
        assert!(body.contains("<ip>1.2.3.4</ip>"));
        assert!(body.contains(r#"<crowdness sort="0"/>"#));

        let response = get(&format!("http://{}/hello", addr)).await;
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), "hello from upstream");

        let directory_request = upstream
            .requests()
            .into_iter()
            .find(|r| r.contains(DIRECTORY_PATH))
            .unwrap()
            .to_lowercase();
        assert!(directory_request.contains(&format!("host: 127.0.0.1:{}", upstream.port)));
        assert!(!directory_request.contains("accept-encoding"));

        // Hot swap: the next response reflects the new table.
        proxy
            .update_overrides(single_rule("7", rule(Some("5.6.7.8"), true)))
            .unwrap();
        let body = get(&format!("http://{}{}", addr, DIRECTORY_PATH))
            .await
            .text()
            .await
            .unwrap();
        assert!(body.contains("<ip>5.6.7.8</ip>"));
        assert!(!body.contains("<ip>10.0.0.1</ip>"));
        assert_eq!(body.matches("<server>").count(), 1);

        proxy.stop().await;
        assert!(proxy.listen_addr().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_directory_fails_open() {
        let upstream = FakeUpstream::start(ALPHA).await;
        let truncated = "<servers><server><id>7</id><ip>10.0";
        upstream.set_directory(truncated);

        let target = UpstreamTarget::from_url(&upstream.url()).unwrap();
        let port = free_port();
        let proxy = SlsProxy::new(
            target,
            proxy_settings(port),
            single_rule("7", rule(Some("1.2.3.4"), false)),
        )
        .unwrap();
        let addr = proxy.start("127.0.0.1").await.unwrap();

        let response = get(&format!("http://{}{}", addr, DIRECTORY_PATH)).await;
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), truncated);

        proxy.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unreachable_upstream_yields_500() {
        let dead_port = free_port();
        let target =
            UpstreamTarget::from_url(&format!("http://127.0.0.1:{}/servers/list.en", dead_port))
                .unwrap();
        let port = free_port();
        let proxy = SlsProxy::new(target, proxy_settings(port), OverrideTable::new()).unwrap();
        let addr = proxy.start("127.0.0.1").await.unwrap();

        let response = get(&format!("http://{}/anything", addr)).await;
        assert_eq!(response.status().as_u16(), 500);

        // The listener survives the failure.
        let response = get(&format!("http://{}/again", addr)).await;
        assert_eq!(response.status().as_u16(), 500);

        proxy.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_silent_upstream_times_out_with_500() {
        let upstream_port = stalled_upstream().await;
        let target = UpstreamTarget::from_url(&format!(
            "http://127.0.0.1:{}{}",
            upstream_port, DIRECTORY_PATH
        ))
        .unwrap();
        let settings = ServerConfig {
            read_timeout: 1,
            ..proxy_settings(0)
        };
        let proxy = SlsProxy::new(target, settings, OverrideTable::new()).unwrap();
        let addr = proxy.start("127.0.0.1").await.unwrap();

        let started = std::time::Instant::now();
        let response = get(&format!("http://{}{}", addr, DIRECTORY_PATH)).await;
        assert_eq!(response.status().as_u16(), 500);
        assert!(started.elapsed() < Duration::from_secs(4));

        proxy.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_trickling_upstream_is_cut_off_at_total_timeout() {
        let upstream_port = trickling_upstream().await;
        let target = UpstreamTarget::from_url(&format!(
            "http://127.0.0.1:{}{}",
            upstream_port, DIRECTORY_PATH
        ))
        .unwrap();
        let settings = ServerConfig {
            read_timeout: 2,
            total_timeout: 1,
            ..proxy_settings(0)
        };
        let proxy = SlsProxy::new(target, settings, OverrideTable::new()).unwrap();
        let addr = proxy.start("127.0.0.1").await.unwrap();

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(10), async {
            let response = reqwest::get(format!("http://{}/slow", addr)).await?;
            response.text().await
        })
        .await
        .expect("exchange was not cut off");

        // Either an error response or a truncated body.
        if let Ok(body) = outcome {
            assert!(body.len() < 1000, "full body was delivered");
        }
        assert!(started.elapsed() < Duration::from_secs(5));

        proxy.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_head_on_directory_path_passes_through() {
        let upstream = FakeUpstream::start(ALPHA).await;
        let target = UpstreamTarget::from_url(&upstream.url()).unwrap();
        let proxy = SlsProxy::new(
            target,
            proxy_settings(0),
            single_rule("7", rule(Some("1.2.3.4"), false)),
        )
        .unwrap();
        let addr = proxy.start("127.0.0.1").await.unwrap();

        let response = reqwest::Client::new()
            .head(format!("http://{}{}", addr, DIRECTORY_PATH))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(
            response.headers()[reqwest::header::CONTENT_LENGTH],
            ALPHA.len().to_string().as_str()
        );
        assert!(upstream.requests()[0].starts_with("HEAD "));

        proxy.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_only_200_directory_responses_are_rewritten() {
        let upstream_port = canned_upstream(format!(
            "HTTP/1.1 203 Non-Authoritative Information\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            ALPHA.len(),
            ALPHA
        ))
        .await;
        let target = UpstreamTarget::from_url(&format!(
            "http://127.0.0.1:{}{}",
            upstream_port, DIRECTORY_PATH
        ))
        .unwrap();
        let proxy = SlsProxy::new(
            target,
            proxy_settings(0),
            single_rule("7", rule(Some("1.2.3.4"), false)),
        )
        .unwrap();
        let addr = proxy.start("127.0.0.1").await.unwrap();

        let response = get(&format!("http://{}{}", addr, DIRECTORY_PATH)).await;
        assert_eq!(response.status().as_u16(), 203);
        assert_eq!(
            response.headers()[reqwest::header::CONTENT_LENGTH],
            ALPHA.len().to_string().as_str()
        );
        assert_eq!(response.text().await.unwrap(), ALPHA);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_start_reports_bind_failure() {
        let upstream = FakeUpstream::start(ALPHA).await;
        let target = UpstreamTarget::from_url(&upstream.url()).unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let proxy = SlsProxy::new(target, proxy_settings(port), OverrideTable::new()).unwrap();
        let err = proxy.start("127.0.0.1").await.unwrap_err();
        assert!(matches!(err, sls_proxy::ProxyError::Io(_)));
        assert!(proxy.listen_addr().is_none());
    }

    #[tokio::test]
    async fn test_start_fails_when_upstream_does_not_resolve() {
        let target = UpstreamTarget::from_url("http://does-not-exist.invalid/servers/list.en").unwrap();
        let proxy =
            SlsProxy::new(target, proxy_settings(free_port()), OverrideTable::new()).unwrap();

        let err = proxy.start("127.0.0.1").await.unwrap_err();
        assert!(matches!(err, sls_proxy::ProxyError::Resolution(_)));
        assert!(proxy.listen_addr().is_none());
    }
}
