use std::net::IpAddr;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use regex::Regex;
use tokio::process::Command;

use crate::error::ScanError;
use crate::presence::{DeviceId, Observation, ScanSnapshot};

/// Produces point-in-time snapshots of reachable devices.
#[async_trait]
pub trait Scanner: Send {
    async fn scan(&mut self) -> Result<ScanSnapshot, ScanError>;
}

/// Ping-sweeps a network with nmap. ARP-based detection, and with it
/// hardware addresses, needs root.
pub struct NmapScanner {
    network: String,
    binary: String,
}

impl NmapScanner {
    pub fn new(network: impl Into<String>) -> Self {
        NmapScanner {
            network: network.into(),
            binary: "nmap".to_string(),
        }
    }
}

#[async_trait]
impl Scanner for NmapScanner {
    async fn scan(&mut self) -> Result<ScanSnapshot, ScanError> {
        debug!("Scanning {} with {}", self.network, self.binary);

        let output = Command::new(&self.binary)
            .args(["-sn", "-oX", "-", self.network.as_str()])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ScanError::Launch {
                tool: self.binary.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ScanError::Failed {
                tool: self.binary.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let taken_at = Utc::now();
        let xml = String::from_utf8_lossy(&output.stdout);
        let observations = parse_nmap_xml(&xml)?;

        debug!("Scan found {} device(s)", observations.len());
        Ok(ScanSnapshot {
            taken_at,
            observations,
        })
    }
}

static HOST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<host\b.*?</host>").expect("valid host pattern"));
static STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<status\s+state="(\w+)""#).expect("valid status pattern"));
static ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<address\s+addr="([^"]+)"\s+addrtype="(\w+)"(?:\s+vendor="([^"]*)")?"#)
        .expect("valid address pattern")
});

/// Extract up hosts that reported a hardware address from nmap's XML
/// output. Hosts without one (usually the scanning host) are skipped.
fn parse_nmap_xml(xml: &str) -> Result<Vec<Observation>, ScanError> {
    if !xml.contains("<nmaprun") {
        return Err(ScanError::Output("missing <nmaprun> element".to_string()));
    }

    let mut observations = Vec::new();
    let mut unaddressed = 0;
    for host in HOST.find_iter(xml).map(|m| m.as_str()) {
        let up = STATUS
            .captures(host)
            .is_some_and(|caps| &caps[1] == "up");
        if !up {
            continue;
        }

        let mut id = None;
        let mut address = None;
        let mut vendor_hint = None;
        for caps in ADDRESS.captures_iter(host) {
            match &caps[2] {
                "mac" => match caps[1].parse::<DeviceId>() {
                    Ok(parsed) => {
                        id = Some(parsed);
                        vendor_hint = caps
                            .get(3)
                            .map(|v| unescape(v.as_str()))
                            .filter(|v| !v.is_empty());
                    }
                    Err(err) => warn!("Ignoring host with {}", err),
                },
                "ipv4" | "ipv6" => address = caps[1].parse::<IpAddr>().ok(),
                _ => {}
            }
        }

        match id {
            Some(id) => observations.push(Observation {
                id,
                address,
                vendor_hint,
            }),
            None => unaddressed += 1,
        }
    }

    // Unprivileged scans still find hosts, just without their MACs.
    if observations.is_empty() && unaddressed > 1 {
        return Err(ScanError::NoHardwareAddresses { hosts: unaddressed });
    }
    Ok(observations)
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
