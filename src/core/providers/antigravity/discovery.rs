use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::core::error::QuotaError;
use crate::core::process::run_command;

/// `lsof` truncates command names, so listeners show up as `language_`.
const LSOF_COMMAND_PREFIX: &str = "language_";

static LISTEN_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":(\d+)\s").expect("Invalid regex"));

/// A running language server, as seen in the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageServer {
    pub pid: u32,
    pub csrf_token: String,
}

/// Find the language server and its CSRF token via `pgrep -af`.
pub async fn find_language_server(process_name: &str, timeout: Duration) -> Result<LanguageServer, QuotaError> {
    let output = run_command("pgrep", &["-af", process_name], timeout)
        .await
        .map_err(|e| {
            debug!(error = %e, "pgrep found no language server");
            not_running()
        })?;
    parse_pgrep(&output, process_name).ok_or_else(not_running)
}

fn not_running() -> QuotaError {
    QuotaError::NotAuthenticated("Language server not running".to_string())
}

fn parse_pgrep(output: &str, process_name: &str) -> Option<LanguageServer> {
    output
        .lines()
        .filter(|line| line.contains(process_name))
        .find_map(|line| {
            let pid = line.split_whitespace().next()?.parse().ok()?;
            let csrf_token = extract_arg(line, "--csrf_token")?;
            Some(LanguageServer { pid, csrf_token })
        })
}

fn extract_arg(line: &str, flag: &str) -> Option<String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    for (i, part) in parts.iter().enumerate() {
        // Handle --flag value
        if *part == flag {
            return parts.get(i + 1).map(|s| s.to_string());
        }
        // Handle --flag=value
        if let Some(val) = part.strip_prefix(flag).and_then(|rest| rest.strip_prefix('=')) {
            return Some(val.to_string());
        }
    }
    None
}

/// Listening TCP ports owned by language-server processes, at most `max_ports`.
pub async fn find_listening_ports(max_ports: usize, timeout: Duration) -> Result<Vec<u16>, QuotaError> {
    let output = run_command("lsof", &["-nP", "-iTCP", "-sTCP:LISTEN"], timeout)
        .await
        .unwrap_or_else(|e| {
            debug!(error = %e, "lsof failed");
            String::new()
        });
    let ports = parse_lsof_ports(&output, max_ports);
    if ports.is_empty() {
        return Err(QuotaError::NoData("No ports found".to_string()));
    }
    debug!(?ports, "Language server port candidates");
    Ok(ports)
}

fn parse_lsof_ports(output: &str, max_ports: usize) -> Vec<u16> {
    let mut ports: Vec<u16> = Vec::new();
    for line in output.lines().filter(|l| l.contains(LSOF_COMMAND_PREFIX)) {
        // IPv4 and IPv6 listeners repeat the same port
        let Some(port) = LISTEN_PORT_RE
            .captures(line)
            .and_then(|c| c[1].parse::<u16>().ok())
        else {
            continue;
        };
        if !ports.contains(&port) {
            ports.push(port);
        }
        if ports.len() >= max_ports {
            break;
        }
    }
    ports
}
