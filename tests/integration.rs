//! Integration tests for the prefork binary.
//!
//! The CLI surface is checked with assert_cmd; the process-group behavior is
//! checked by running the real binary as a coordinator with live workers.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};

const BIN: &str = env!("CARGO_BIN_EXE_prefork");

/// Get a command for the prefork binary.
fn prefork() -> Command {
    let mut cmd = Command::new(BIN);
    cmd.env_remove("PREFORK_WORKER");
    cmd
}

fn free_addr() -> SocketAddr {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap()
}

fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

/// A coordinator process started in the background; killed on drop.
struct Group {
    child: Child,
    addr: SocketAddr,
}

impl Group {
    fn start(workers: usize, extra: &[&str], stderr: Stdio) -> Self {
        let addr = free_addr();
        let child = std::process::Command::new(BIN)
            .args(["--quiet", "serve", "--addr", &addr.to_string()])
            .args(["--workers", &workers.to_string()])
            .args(extra)
            .env_remove("PREFORK_WORKER")
            .stdout(Stdio::null())
            .stderr(stderr)
            .spawn()
            .expect("start coordinator");
        Self { child, addr }
    }

    fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    fn signal(&self, sig: nix::sys::signal::Signal) {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(self.pid()), sig).unwrap();
    }

    fn wait_timeout(&mut self, timeout: Duration) -> std::process::ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            assert!(Instant::now() < deadline, "coordinator did not exit");
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Plain HTTP/1.1 GET over a fresh connection; returns the body.
fn http_get(addr: SocketAddr, path: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(1))?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    write!(
        stream,
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    )?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    match response.split_once("\r\n\r\n") {
        Some((head, body)) if head.starts_with("HTTP/1.1 200") => Ok(body.to_string()),
        _ => Err(std::io::Error::other(format!(
            "unexpected response: {response}"
        ))),
    }
}

fn worker_pid(addr: SocketAddr) -> std::io::Result<u32> {
    let body = http_get(addr, "/health")?;
    let json: serde_json::Value = serde_json::from_str(&body).map_err(std::io::Error::other)?;
    assert_eq!(json["role"], "worker");
    json["pid"]
        .as_u64()
        .map(|pid| pid as u32)
        .ok_or_else(|| std::io::Error::other("missing pid"))
}

fn wait_until_serving(addr: SocketAddr) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match worker_pid(addr) {
            Ok(pid) => return pid,
            Err(e) if Instant::now() > deadline => panic!("group never came up: {e}"),
            Err(_) => std::thread::sleep(Duration::from_millis(50)),
        }
    }
}

fn wait_until_closed(addr: SocketAddr, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok() {
        assert!(Instant::now() < deadline, "port {addr} still accepting");
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_help_displays() {
    prefork()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"));
}

#[test]
fn test_version_displays() {
    prefork()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_zero_workers_rejected() {
    prefork()
        .args(["serve", "--workers", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("workers"));
}

#[test]
fn test_tls_cert_requires_key() {
    prefork()
        .args(["serve", "--tls-cert", "cert.pem"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--tls-key"));
}

#[test]
fn test_missing_certificate_is_reported() {
    prefork()
        .args(["--quiet", "serve", "--tls-cert", "/nonexistent/cert.pem"])
        .args(["--tls-key", "/nonexistent/key.pem"])
        .timeout(Duration::from_secs(30))
        .assert()
        .failure()
        .stderr(predicate::str::contains("/nonexistent/cert.pem"));
}

#[test]
fn test_worker_bind_failure_stops_group() {
    // Each worker fails to resolve the address and exits 1; the coordinator
    // reports the first of those exits.
    prefork()
        .args(["serve", "--addr", "not an address", "--workers", "2"])
        .timeout(Duration::from_secs(30))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid listen address"))
        .stderr(predicate::str::contains("exited with code 1"));
}

#[test]
fn test_workers_share_one_port() {
    let group = Group::start(2, &[], Stdio::null());
    let first = wait_until_serving(group.addr);
    assert_ne!(first, group.child.id(), "coordinator must not serve");

    let mut pids = std::collections::HashSet::from([first]);
    // The second worker may still be starting; give it a few seconds.
    for _ in 0..200 {
        pids.insert(worker_pid(group.addr).unwrap());
        if pids.len() == 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    assert_eq!(pids.len(), 2, "both workers should receive connections");
    assert!(!pids.contains(&group.child.id()));
}

#[test]
fn test_sigterm_stops_whole_group() {
    let mut group = Group::start(2, &[], Stdio::null());
    wait_until_serving(group.addr);

    group.signal(nix::sys::signal::Signal::SIGTERM);
    let status = group.wait_timeout(Duration::from_secs(10));
    assert!(status.success(), "coordinator exit: {status}");
    wait_until_closed(group.addr, Duration::from_secs(5));
}

#[test]
fn test_worker_death_stops_group() {
    let mut group = Group::start(2, &[], Stdio::piped());
    let victim = wait_until_serving(group.addr);

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(victim as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    let status = group.wait_timeout(Duration::from_secs(10));
    assert_eq!(status.code(), Some(1));
    wait_until_closed(group.addr, Duration::from_secs(5));

    let mut stderr = String::new();
    group
        .child
        .stderr
        .take()
        .unwrap()
        .read_to_string(&mut stderr)
        .unwrap();
    assert!(stderr.contains(&victim.to_string()), "stderr: {stderr}");
    assert!(stderr.contains("SIGKILL"), "stderr: {stderr}");
}

#[test]
fn test_orphaned_workers_exit() {
    let mut group = Group::start(2, &[], Stdio::null());
    wait_until_serving(group.addr);

    // No teardown runs on SIGKILL; the workers must notice on their own.
    group.signal(nix::sys::signal::Signal::SIGKILL);
    group.wait_timeout(Duration::from_secs(5));

    wait_until_closed(group.addr, Duration::from_secs(5));
}

#[tokio::test]
async fn test_tls_group_serves_https() {
    use rustls::pki_types::{CertificateDer, ServerName, pem::PemObject};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (cert, key) = (fixture("cert.pem"), fixture("key.pem"));
    let group = Group::start(
        2,
        &["--tls-cert", &cert, "--tls-key", &key],
        Stdio::null(),
    );

    let mut roots = rustls::RootCertStore::empty();
    for ca in CertificateDer::pem_file_iter(fixture("ca.pem")).unwrap() {
        roots.add(ca.unwrap()).unwrap();
    }
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let deadline = Instant::now() + Duration::from_secs(10);
    let response = loop {
        let attempt = async {
            let tcp = tokio::net::TcpStream::connect(group.addr).await?;
            let name = ServerName::try_from("localhost").unwrap();
            let mut tls = connector.connect(name, tcp).await?;
            tls.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .await?;
            let mut response = String::new();
            tls.read_to_string(&mut response).await?;
            Ok::<_, std::io::Error>(response)
        };
        match attempt.await {
            Ok(response) => break response,
            Err(e) if Instant::now() > deadline => panic!("TLS group never came up: {e}"),
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    };

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("hello from worker"));

    // Plaintext clients get nothing from a TLS group.
    assert!(http_get(group.addr, "/").is_err());
}
