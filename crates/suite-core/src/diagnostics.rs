//! Context-aware dependency/resource diagnostics with handshake-verified TCP
//! reachability probing. See spec §4.10.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Reachable,
    Uncertain,
    NotReachable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub status: ProbeStatus,
    pub connected_host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DependencyStatus {
    Ok,
    NotInstalled,
    Outdated { found: String, min: String },
    ImportError { class: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiagnosticsReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub missing_deps: Vec<String>,
    pub recommendations: Vec<String>,
    pub probes: std::collections::HashMap<String, ProbeStatus>,
    pub system_hints: Vec<String>,
}

/// A single required dependency and the feature that makes it relevant. Only
/// missing deps whose `required_when` predicate is true are ever reported
/// (spec §4.10 "context-aware rule").
pub struct DependencyCheck {
    pub name: String,
    pub min_version: Option<String>,
    pub required_when: bool,
}

/// One declared loopback/TCP service to probe by handshake.
pub struct ServiceProbeSpec {
    pub host: String,
    pub port: u16,
    pub service_tag: String,
}

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
const CONNECT_BACKOFFS_MS: [u64; 3] = [250, 500, 1000];
const LOW_DISK_GB: f64 = 2.0;
const LOW_RAM_GB: f64 = 2.0;

/// Runs the full diagnostics pass: dependency checks, TCP handshake probes,
/// and resource warnings, folding everything into one actionable report.
pub async fn run_diagnostics(
    deps: &[DependencyCheck],
    probes: &[ServiceProbeSpec],
    vector_store_path: &std::path::Path,
) -> DiagnosticsReport {
    let mut report = DiagnosticsReport::default();

    for dep in deps {
        if !dep.required_when {
            continue;
        }
        match check_dependency(dep) {
            DependencyStatus::Ok => {}
            DependencyStatus::NotInstalled => {
                report.missing_deps.push(dep.name.clone());
                report.recommendations.push(format!("install {}: not found on this host", dep.name));
            }
            DependencyStatus::Outdated { found, min } => {
                report.recommendations.push(format!("{} is outdated: found {found} < required {min}", dep.name));
            }
            DependencyStatus::ImportError { class } => {
                report.recommendations.push(format!("{} failed to load ({class}); try a forced reinstall", dep.name));
            }
        }
    }

    for spec in probes {
        let result = probe(&spec.host, spec.port, &spec.service_tag).await;
        if result.status == ProbeStatus::Uncertain {
            report
                .recommendations
                .push(format!("port {} on {} answered but not as {} (wrong_service)", spec.port, spec.host, spec.service_tag));
        }
        tracing::info!(service = %spec.service_tag, status = ?result.status, "diagnostics probe state");
        report.probes.insert(spec.service_tag.clone(), result.status);
    }

    for hint in resource_hints(vector_store_path) {
        report.warnings.push(hint.clone());
        report.system_hints.push(hint);
    }

    report
}

/// Best-effort installed/version/importable check: first a PATH lookup, then
/// (only when `min_version` is set) an import smoke test — actually running
/// `<name> --version` rather than trusting PATH presence alone. A binary that
/// is on PATH but crashes, exits non-zero, or prints nothing version-shaped
/// is reported `ImportError`, not `Ok`.
fn check_dependency(dep: &DependencyCheck) -> DependencyStatus {
    let Some(path) = which(&dep.name) else { return DependencyStatus::NotInstalled };
    let Some(min) = &dep.min_version else { return DependencyStatus::Ok };
    match probe_installed_version(&path) {
        Some(found) if version_less_than(&found, min) => DependencyStatus::Outdated { found, min: min.clone() },
        Some(_) => DependencyStatus::Ok,
        None => DependencyStatus::ImportError { class: "version_probe_failed".to_string() },
    }
}

fn which(binary: &str) -> Option<std::path::PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join(binary)).find(|p| p.exists())
}

fn probe_installed_version(path: &std::path::Path) -> Option<String> {
    let output = std::process::Command::new(path).arg("--version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    extract_version(&String::from_utf8_lossy(&output.stdout))
}

fn extract_version(text: &str) -> Option<String> {
    text.split_whitespace().find_map(|tok| {
        let trimmed = tok.trim_matches(|c: char| !c.is_ascii_digit() && c != '.');
        let starts_with_digit = trimmed.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false);
        (starts_with_digit && trimmed.contains('.')).then(|| trimmed.to_string())
    })
}

/// Compares dotted numeric version strings component-wise (missing trailing
/// components treated as `0`); mirrors the dotted-numeric-core comparison an
/// auto-updater would use, generalized to arbitrary length instead of a fixed
/// major.minor.patch.
fn version_less_than(found: &str, min: &str) -> bool {
    let found_parts = version_parts(found);
    let min_parts = version_parts(min);
    for i in 0..found_parts.len().max(min_parts.len()) {
        let f = found_parts.get(i).copied().unwrap_or(0);
        let m = min_parts.get(i).copied().unwrap_or(0);
        if f != m {
            return f < m;
        }
    }
    false
}

fn version_parts(v: &str) -> Vec<u32> {
    v.split('.').map(|p| p.chars().take_while(|c| c.is_ascii_digit()).collect::<String>().parse().unwrap_or(0)).collect()
}

/// TCP reachability with a ping/pong handshake verification, to rule out a
/// different service squatting on the expected port (spec §4.10).
pub async fn probe(host: &str, port: u16, service_tag: &str) -> ProbeResult {
    let candidates = candidate_hosts(host);
    for candidate in &candidates {
        for (attempt, backoff_ms) in CONNECT_BACKOFFS_MS.iter().enumerate() {
            if attempt > 0 {
                let jitter = rand::thread_rng().gen_range(0..100);
                tokio::time::sleep(Duration::from_millis(*backoff_ms + jitter)).await;
            }
            match timeout(Duration::from_millis(*backoff_ms), TcpStream::connect((candidate.as_str(), port))).await {
                Ok(Ok(mut stream)) => {
                    return handshake(&mut stream, service_tag, candidate.clone()).await;
                }
                _ => continue,
            }
        }
    }
    ProbeResult { status: ProbeStatus::NotReachable, connected_host: None }
}

async fn handshake(stream: &mut TcpStream, service_tag: &str, host: String) -> ProbeResult {
    let request = serde_json::json!({ "ping": service_tag }).to_string();
    if stream.write_all(request.as_bytes()).await.is_err() {
        return ProbeResult { status: ProbeStatus::Uncertain, connected_host: Some(host) };
    }
    let mut buf = vec![0u8; 1024];
    let read = timeout(HANDSHAKE_TIMEOUT, stream.read(&mut buf)).await;
    match read {
        Ok(Ok(n)) if n > 0 => match serde_json::from_slice::<serde_json::Value>(&buf[..n]) {
            Ok(v) if v.get("pong").and_then(|p| p.as_str()) == Some(service_tag) => {
                ProbeResult { status: ProbeStatus::Reachable, connected_host: Some(host) }
            }
            _ => ProbeResult { status: ProbeStatus::Uncertain, connected_host: Some(host) },
        },
        _ => ProbeResult { status: ProbeStatus::Uncertain, connected_host: Some(host) },
    }
}

fn candidate_hosts(host: &str) -> Vec<String> {
    let mut hosts = vec![host.to_string()];
    if is_loopback_like(host) {
        for alt in ["127.0.0.1", "localhost", "::1"] {
            if !hosts.iter().any(|h| h == alt) {
                hosts.push(alt.to_string());
            }
        }
    }
    hosts
}

fn is_loopback_like(host: &str) -> bool {
    matches!(host, "127.0.0.1" | "localhost" | "::1") || host.starts_with("127.")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub disk_free_gb: Option<f64>,
    pub ram_free_gb: Option<f64>,
}

/// Point-in-time disk/RAM readout, shared by `run_diagnostics`'s resource
/// warnings and the `/health/full` `sys` block.
pub fn system_snapshot(vector_store_path: &std::path::Path) -> SystemSnapshot {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let ram_free_gb = sys.available_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
    SystemSnapshot {
        disk_free_gb: disk_free_gb(vector_store_path),
        ram_free_gb: (ram_free_gb > 0.0).then_some(ram_free_gb),
    }
}

fn resource_hints(vector_store_path: &std::path::Path) -> Vec<String> {
    let mut hints = Vec::new();
    let snapshot = system_snapshot(vector_store_path);
    if let Some(disk_free_gb) = snapshot.disk_free_gb {
        if disk_free_gb < LOW_DISK_GB {
            hints.push(format!("low disk space at vector store path: {disk_free_gb:.1} GB free"));
        }
    }
    if let Some(ram_free_gb) = snapshot.ram_free_gb {
        if ram_free_gb < LOW_RAM_GB {
            hints.push(format!("low available memory: {ram_free_gb:.1} GB free"));
        }
    }
    hints
}

fn disk_free_gb(_path: &std::path::Path) -> Option<f64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;
        let c_path = CString::new(_path.as_os_str().as_bytes()).ok()?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return None;
        }
        let bytes_free = stat.f_bavail as f64 * stat.f_frsize as f64;
        Some(bytes_free / (1024.0 * 1024.0 * 1024.0))
    }
    #[cfg(not(unix))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_matches_correct_pong() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 1024];
                let n = socket.read(&mut buf).await.unwrap();
                let _req: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
                let resp = serde_json::json!({ "pong": "clo" }).to_string();
                let _ = socket.write_all(resp.as_bytes()).await;
            }
        });
        let result = probe("127.0.0.1", port, "clo").await;
        assert_eq!(result.status, ProbeStatus::Reachable);
    }

    #[tokio::test]
    async fn probe_reports_uncertain_on_wrong_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let resp = serde_json::json!({ "pong": "different" }).to_string();
                let _ = socket.write_all(resp.as_bytes()).await;
            }
        });
        let result = probe("127.0.0.1", port, "clo").await;
        assert_eq!(result.status, ProbeStatus::Uncertain);
    }

    #[tokio::test]
    async fn probe_reports_not_reachable_on_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let result = probe("127.0.0.1", port, "clo").await;
        assert_eq!(result.status, ProbeStatus::NotReachable);
    }

    #[test]
    fn version_less_than_compares_dotted_components() {
        assert!(version_less_than("1.2.3", "1.3.0"));
        assert!(!version_less_than("1.3.0", "1.2.3"));
        assert!(!version_less_than("2.0", "2.0.0"));
        assert!(version_less_than("2.0", "2.0.1"));
    }

    #[test]
    fn extract_version_finds_the_first_dotted_numeric_token() {
        assert_eq!(extract_version("chroma-like-client, version 1.2.3"), Some("1.2.3".to_string()));
        assert_eq!(extract_version("no version here"), None);
    }

    #[test]
    fn check_dependency_reports_not_installed_when_absent_from_path() {
        let dep = DependencyCheck { name: "definitely-not-a-real-binary-xyz".to_string(), min_version: None, required_when: true };
        assert!(matches!(check_dependency(&dep), DependencyStatus::NotInstalled));
    }

    #[test]
    fn check_dependency_skips_version_probe_without_a_min_version() {
        let dep = DependencyCheck { name: "sh".to_string(), min_version: None, required_when: true };
        // Only exercised when `sh` actually resolves on PATH; otherwise this degrades
        // to the NotInstalled case, which is still a valid assertion of the contract.
        match check_dependency(&dep) {
            DependencyStatus::Ok | DependencyStatus::NotInstalled => {}
            other => panic!("expected Ok or NotInstalled without a min_version, got {other:?}"),
        }
    }

    #[test]
    fn dependency_not_required_is_skipped() {
        let dep = DependencyCheck { name: "chroma-like-pkg".to_string(), min_version: None, required_when: false };
        // required_when false means callers skip this dependency entirely before calling check_dependency;
        // this just documents the contract the `run_diagnostics` loop relies on.
        assert!(!dep.required_when);
    }
}
