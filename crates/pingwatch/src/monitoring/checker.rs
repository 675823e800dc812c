use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;

use super::types::FailureReason;
use crate::target::{MonitoredTarget, ProbeKind};

/// Failure of a single check attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    #[error("probe timed out")]
    Timeout,

    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("dns lookup failed: {0}")]
    Dns(String),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("checker fault: {0}")]
    Internal(String),
}

impl CheckError {
    pub fn reason(&self) -> FailureReason {
        match self {
            CheckError::Timeout => FailureReason::Timeout,
            CheckError::Unreachable(_) => FailureReason::Unreachable,
            CheckError::Refused(_) => FailureReason::ConnectionRefused,
            CheckError::Dns(_) => FailureReason::DnsFailure,
            CheckError::Status(_) => FailureReason::BadStatus,
            CheckError::Internal(_) => FailureReason::Internal,
        }
    }

    /// Fast network failures may be packet loss; a timeout already used the budget
    pub fn is_retryable(&self) -> bool {
        matches!(self, CheckError::Unreachable(_) | CheckError::Refused(_))
    }
}

/// One way of checking whether a device answers
#[async_trait::async_trait]
pub trait Checker: Send + Sync {
    /// Perform the check and return the round trip in milliseconds
    async fn check(&self, target: &MonitoredTarget) -> Result<u64, CheckError>;
}

/// Resolve `host` to its first socket address
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, CheckError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| CheckError::Dns(format!("{host}: {e}")))?;

    addrs.next().ok_or_else(|| CheckError::Dns(format!("{host}: no addresses")))
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn classify_io(error: std::io::Error, addr: SocketAddr) -> CheckError {
    match error.kind() {
        std::io::ErrorKind::ConnectionRefused => CheckError::Refused(addr.to_string()),
        std::io::ErrorKind::TimedOut => CheckError::Timeout,
        _ => CheckError::Unreachable(format!("{addr}: {error}")),
    }
}

/// HTTP/HTTPS checker
pub struct HttpChecker {
    client: reqwest::Client,
}

impl HttpChecker {
    pub fn new(timeout: Duration) -> Result<Self, CheckError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CheckError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    fn url_for(target: &MonitoredTarget) -> String {
        match &target.probe {
            ProbeKind::Http { url: Some(url) } => url.clone(),
            _ => format!("http://{}/", target.host()),
        }
    }
}

fn classify_reqwest(error: reqwest::Error) -> CheckError {
    if error.is_timeout() {
        return CheckError::Timeout;
    }

    let mut chain = error.to_string();
    let mut source = std::error::Error::source(&error);
    while let Some(inner) = source {
        chain.push_str(": ");
        chain.push_str(&inner.to_string());
        source = inner.source();
    }

    let lowered = chain.to_lowercase();
    if lowered.contains("dns error") || lowered.contains("failed to lookup address") {
        CheckError::Dns(chain)
    } else if lowered.contains("connection refused") {
        CheckError::Refused(chain)
    } else if error.is_connect() || error.is_request() {
        CheckError::Unreachable(chain)
    } else {
        CheckError::Internal(chain)
    }
}

#[async_trait::async_trait]
impl Checker for HttpChecker {
    async fn check(&self, target: &MonitoredTarget) -> Result<u64, CheckError> {
        let url = Self::url_for(target);
        let start = Instant::now();

        let response = self.client.get(&url).send().await.map_err(classify_reqwest)?;

        let latency = elapsed_ms(start);
        let status = response.status();

        // 2xx and 3xx count as up
        if status.is_success() || status.is_redirection() {
            Ok(latency)
        } else {
            Err(CheckError::Status(status.as_u16()))
        }
    }
}

/// TCP connect checker
pub struct TcpChecker;

#[async_trait::async_trait]
impl Checker for TcpChecker {
    async fn check(&self, target: &MonitoredTarget) -> Result<u64, CheckError> {
        let ProbeKind::Tcp { port } = target.probe else {
            return Err(CheckError::Internal(format!("{} is not a tcp target", target.device_id)));
        };

        let addr = resolve(target.host(), port).await?;
        let start = Instant::now();

        TcpStream::connect(addr).await.map_err(|e| classify_io(e, addr))?;

        Ok(elapsed_ms(start))
    }
}

/// ICMP echo through the system `ping` binary, which carries the raw socket privileges
pub struct IcmpChecker {
    binary: String,
    wait_secs: u64,
}

impl IcmpChecker {
    pub fn new(timeout: Duration) -> Self {
        Self::with_binary("ping", timeout)
    }

    pub fn with_binary(binary: impl Into<String>, timeout: Duration) -> Self {
        Self { binary: binary.into(), wait_secs: timeout.as_secs().max(1) }
    }
}

/// Extract the `time=0.045 ms` round trip from ping output
pub fn parse_rtt_ms(output: &str) -> Option<u64> {
    let start = output.find("time=")? + "time=".len();
    let rest = &output[start..];
    let end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
    let millis: f64 = rest[..end].parse().ok()?;
    Some(millis.round() as u64)
}

#[async_trait::async_trait]
impl Checker for IcmpChecker {
    async fn check(&self, target: &MonitoredTarget) -> Result<u64, CheckError> {
        let addr = resolve(target.host(), 0).await?;
        let start = Instant::now();

        let output = Command::new(&self.binary)
            .arg("-n")
            .arg("-c")
            .arg("1")
            .arg("-W")
            .arg(self.wait_secs.to_string())
            .arg(addr.ip().to_string())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CheckError::Internal(format!("failed to run {}: {e}", self.binary)))?;

        let elapsed = elapsed_ms(start);

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(parse_rtt_ms(&stdout).unwrap_or(elapsed))
        } else {
            Err(CheckError::Unreachable(format!("{} did not answer echo request", addr.ip())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_linux_ping_output() {
        let out = "64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=3.62 ms\n";
        assert_eq!(parse_rtt_ms(out), Some(4));
    }

    #[test]
    fn missing_rtt_is_none() {
        assert_eq!(parse_rtt_ms("1 packets transmitted, 0 received"), None);
    }

    #[test]
    fn retry_policy_skips_timeouts_and_dns() {
        assert!(CheckError::Refused("x".into()).is_retryable());
        assert!(CheckError::Unreachable("x".into()).is_retryable());
        assert!(!CheckError::Timeout.is_retryable());
        assert!(!CheckError::Dns("x".into()).is_retryable());
        assert!(!CheckError::Status(503).is_retryable());
    }

    #[test]
    fn http_url_defaults_to_host_root() {
        let target = MonitoredTarget::new("web", "10.1.1.1", 1000)
            .with_probe(ProbeKind::Http { url: None });
        assert_eq!(HttpChecker::url_for(&target), "http://10.1.1.1/");
    }

    #[tokio::test]
    async fn tcp_check_connects_to_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = MonitoredTarget::new("local", "127.0.0.1", 1000).with_probe(ProbeKind::Tcp { port });

        assert!(TcpChecker.check(&target).await.is_ok());
    }

    #[tokio::test]
    async fn tcp_check_reports_refused_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let target = MonitoredTarget::new("local", "127.0.0.1", 1000).with_probe(ProbeKind::Tcp { port });

        let err = TcpChecker.check(&target).await.unwrap_err();
        assert_eq!(err.reason(), FailureReason::ConnectionRefused);
    }
}
