//! Usage accounting for install, upgrade and remove operations.

use crate::config::Config;
use crate::platform::HostInfo;
use crate::transport::Transport;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Install,
    Upgrade,
    Remove,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Install => "install",
            Operation::Upgrade => "upgrade",
            Operation::Remove => "remove",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageEvent {
    pub package: String,
    pub operation: Operation,
    pub version: Option<String>,
    pub old_version: Option<String>,
}

impl UsageEvent {
    pub fn new(package: &str, operation: Operation, version: Option<&str>) -> Self {
        Self {
            package: package.to_string(),
            operation,
            version: version.map(str::to_string),
            old_version: None,
        }
    }

    pub fn with_old_version(mut self, old: Option<&str>) -> Self {
        self.old_version = old.map(str::to_string);
        self
    }

    fn params(&self, host: &HostInfo) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("package", self.package.clone()),
            ("operation", self.operation.as_str().to_string()),
            ("version", self.version.clone().unwrap_or_default()),
            ("host_platform", host.platform.clone()),
            ("host_version", host.version.to_string()),
            ("engine_version", env!("CARGO_PKG_VERSION").to_string()),
        ];
        if let Some(old) = &self.old_version {
            params.push(("old_version", old.clone()));
        }
        params
    }
}

#[derive(Deserialize)]
struct SubmitResponse {
    result: String,
}

/// Log an event and, when enabled, submit it.
pub async fn record(event: &UsageEvent, config: &Config, host: &HostInfo, transport: &dyn Transport) {
    info!(
        target: "stowage::usage",
        package = %event.package,
        operation = event.operation.as_str(),
        version = event.version.as_deref().unwrap_or(""),
        old_version = event.old_version.as_deref().unwrap_or(""),
        "usage"
    );

    if !config.submit_usage || config.submit_url.is_empty() {
        return;
    }

    let url = match reqwest::Url::parse_with_params(&config.submit_url, event.params(host)) {
        Ok(url) => url,
        Err(e) => {
            warn!(url = %config.submit_url, error = %e, "invalid usage submission URL");
            return;
        }
    };

    let body = match transport.get(url.as_str()).await {
        Ok(body) => body,
        Err(e) => {
            warn!(package = %event.package, error = %e, "error submitting usage information");
            return;
        }
    };

    match serde_json::from_slice::<SubmitResponse>(&body) {
        Ok(response) if response.result == "success" => {}
        _ => warn!(package = %event.package, "usage server rejected submission"),
    }
}
