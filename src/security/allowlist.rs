//! Allowlist validation for order parameters
//!
//! Orders are authenticated, but their parameters are still network input.
//! Every handler with an OS-level side effect passes its parameters through
//! one of these validators before touching anything.

use appliance_shared::{limits, OrderError};
use regex::Regex;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::sync::OnceLock;
use thiserror::Error;
use url::Url;

/// Flake used when a rebuild order does not name one
pub const DEFAULT_FLAKE_REF: &str = "github:fleet-appliance/appliance-os#appliance";

/// Hosts artifact downloads may come from
pub const ALLOWED_DOWNLOAD_HOSTS: &[&str] = &[
    "github.com",
    "objects.githubusercontent.com",
    "releases.fleet-appliance.io",
];

/// Remediation actions a promoted rule may request
pub const ALLOWED_RULE_ACTIONS: &[&str] = &[
    "restart_service",
    "restart_agent",
    "run_windows_runbook",
    "run_linux_runbook",
    "rotate_logs",
    "renew_certificate",
    "alert",
    "escalate",
];

/// Journal units whose logs may be retrieved
pub const LOG_UNITS: &[&str] = &[
    "appliance-agent.service",
    "nix-daemon.service",
    "sshd.service",
    "systemd-networkd.service",
    "chronyd.service",
];

/// Pre-baked diagnostic argument vectors, selected by name
const DIAGNOSTIC_COMMANDS: &[(&str, &[&str])] = &[
    ("disk_usage", &["df", "-h"]),
    ("memory", &["free", "-m"]),
    ("uptime", &["uptime"]),
    ("network", &["ip", "-brief", "address"]),
    ("routes", &["ip", "route"]),
    ("failed_units", &["systemctl", "--failed", "--no-pager"]),
    (
        "agent_status",
        &["systemctl", "status", "appliance-agent.service", "--no-pager"],
    ),
    (
        "generations",
        &["nix-env", "--list-generations", "--profile", "/nix/var/nix/profiles/system"],
    ),
];

/// Reasons a parameter failed allowlist validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("flake reference not allowed: {0}")]
    FlakeRefRejected(String),

    #[error("download URL is required")]
    MissingUrl,

    #[error("download URL does not parse: {0}")]
    UnparsableUrl(String),

    #[error("download URL must use https, got {0}")]
    SchemeNotAllowed(String),

    #[error("download host not allowed: {0}")]
    HostNotAllowed(String),

    #[error("download URL must not carry credentials or a custom port")]
    UrlAuthority,

    #[error("invalid sha256 digest")]
    InvalidDigest,

    #[error("invalid rule_id: {0}")]
    InvalidRuleId(String),

    #[error("rule YAML is {0} bytes, limit is {max}", max = limits::PROMOTED_RULE_MAX_BYTES)]
    RuleTooLarge(usize),

    #[error("rule YAML does not parse: {0}")]
    RuleUnparsable(String),

    #[error("rule id {found:?} does not match rule_id {expected}")]
    RuleIdMismatch { expected: String, found: Option<String> },

    #[error("rule is missing required field: {0}")]
    RuleMissingField(&'static str),

    #[error("rule action not allowed: {0}")]
    ActionNotAllowed(String),

    #[error("rule needs at least one condition with field and operator")]
    RuleWithoutConditions,

    #[error("unknown diagnostic command: {0}")]
    UnknownDiagnostic(String),

    #[error("log unit not allowed: {0}")]
    LogUnitNotAllowed(String),

    #[error("invalid hostname: {0}")]
    InvalidHostname(String),

    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),
}

impl From<ValidationError> for OrderError {
    fn from(e: ValidationError) -> Self {
        OrderError::ValidationFailure(e.to_string())
    }
}

static FLAKE_REF_RE: OnceLock<Regex> = OnceLock::new();
static RULE_ID_RE: OnceLock<Regex> = OnceLock::new();
static HOSTNAME_RE: OnceLock<Regex> = OnceLock::new();
static SHA256_RE: OnceLock<Regex> = OnceLock::new();

fn flake_ref_re() -> &'static Regex {
    FLAKE_REF_RE.get_or_init(|| {
        Regex::new(r"^github:fleet-appliance/appliance-os(/[A-Za-z0-9][A-Za-z0-9._-]*)?#[A-Za-z0-9][A-Za-z0-9_-]*$")
            .unwrap()
    })
}

fn rule_id_re() -> &'static Regex {
    RULE_ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").unwrap())
}

fn hostname_re() -> &'static Regex {
    HOSTNAME_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$")
            .unwrap()
    })
}

fn sha256_re() -> &'static Regex {
    SHA256_RE.get_or_init(|| Regex::new(r"^[0-9a-fA-F]{64}$").unwrap())
}

/// Resolve the flake to rebuild from. Empty selects the built-in default.
pub fn validate_flake_ref(flake_ref: &str) -> Result<String, ValidationError> {
    if flake_ref.is_empty() {
        return Ok(DEFAULT_FLAKE_REF.to_string());
    }
    if flake_ref.contains("..") || !flake_ref_re().is_match(flake_ref) {
        return Err(ValidationError::FlakeRefRejected(flake_ref.to_string()));
    }
    Ok(flake_ref.to_string())
}

/// Accept only https URLs on an allowlisted host
pub fn validate_download_url(raw: &str) -> Result<Url, ValidationError> {
    if raw.trim().is_empty() {
        return Err(ValidationError::MissingUrl);
    }
    let url = Url::parse(raw).map_err(|e| ValidationError::UnparsableUrl(e.to_string()))?;

    if url.scheme() != "https" {
        return Err(ValidationError::SchemeNotAllowed(url.scheme().to_string()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| ValidationError::HostNotAllowed(String::new()))?;
    if !ALLOWED_DOWNLOAD_HOSTS.contains(&host) {
        return Err(ValidationError::HostNotAllowed(host.to_string()));
    }
    if !url.username().is_empty() || url.password().is_some() || url.port().is_some() {
        return Err(ValidationError::UrlAuthority);
    }
    Ok(url)
}

/// Normalise a hex sha256 digest to lowercase
pub fn validate_sha256(digest: &str) -> Result<String, ValidationError> {
    if !sha256_re().is_match(digest) {
        return Err(ValidationError::InvalidDigest);
    }
    Ok(digest.to_ascii_lowercase())
}

/// Hostname or IPv4 address of a managed workstation
pub fn validate_hostname(host: &str) -> Result<String, ValidationError> {
    if host.parse::<Ipv4Addr>().is_ok() {
        return Ok(host.to_string());
    }
    if host.len() > 253 || !hostname_re().is_match(host) {
        return Err(ValidationError::InvalidHostname(host.to_string()));
    }
    Ok(host.to_ascii_lowercase())
}

#[derive(Debug, Deserialize)]
struct RawRule {
    id: Option<String>,
    name: Option<String>,
    action: Option<String>,
    #[serde(default)]
    conditions: Vec<RawCondition>,
}

#[derive(Debug, Deserialize)]
struct RawCondition {
    #[serde(default)]
    field: String,
    #[serde(default)]
    operator: String,
}

/// Summary of a promoted rule that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotedRule {
    pub id: String,
    pub name: String,
    pub action: String,
    pub conditions: usize,
}

/// Check a promoted rule before it is allowed anywhere near disk
pub fn validate_promoted_rule(rule_id: &str, rule_yaml: &str) -> Result<PromotedRule, ValidationError> {
    if !rule_id_re().is_match(rule_id) {
        return Err(ValidationError::InvalidRuleId(rule_id.to_string()));
    }
    if rule_yaml.len() > limits::PROMOTED_RULE_MAX_BYTES {
        return Err(ValidationError::RuleTooLarge(rule_yaml.len()));
    }

    let rule: RawRule = serde_yaml::from_str(rule_yaml)
        .map_err(|e| ValidationError::RuleUnparsable(e.to_string()))?;

    if rule.id.as_deref() != Some(rule_id) {
        return Err(ValidationError::RuleIdMismatch {
            expected: rule_id.to_string(),
            found: rule.id,
        });
    }
    let name = rule
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or(ValidationError::RuleMissingField("name"))?;
    let action = rule
        .action
        .filter(|a| !a.is_empty())
        .ok_or(ValidationError::RuleMissingField("action"))?;
    if !ALLOWED_RULE_ACTIONS.contains(&action.as_str()) {
        return Err(ValidationError::ActionNotAllowed(action));
    }

    let conditions = rule
        .conditions
        .iter()
        .filter(|c| !c.field.is_empty() && !c.operator.is_empty())
        .count();
    if conditions == 0 {
        return Err(ValidationError::RuleWithoutConditions);
    }

    Ok(PromotedRule {
        id: rule_id.to_string(),
        name,
        action,
        conditions,
    })
}

/// Look up the argument vector for a named diagnostic
pub fn diagnostic_command(name: &str) -> Result<Vec<String>, ValidationError> {
    DIAGNOSTIC_COMMANDS
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, argv)| argv.iter().map(|s| s.to_string()).collect())
        .ok_or_else(|| ValidationError::UnknownDiagnostic(name.to_string()))
}

/// Build the journal query for an allowlisted unit.
///
/// Line counts are clamped rather than rejected.
pub fn log_command(unit: Option<&str>, lines: Option<u64>) -> Result<Vec<String>, ValidationError> {
    let unit = unit.unwrap_or(LOG_UNITS[0]);
    if !LOG_UNITS.contains(&unit) {
        return Err(ValidationError::LogUnitNotAllowed(unit.to_string()));
    }
    let lines = lines
        .map(|n| n.clamp(1, u64::from(limits::LOG_LINES_MAX)))
        .unwrap_or(u64::from(limits::LOG_LINES_DEFAULT));

    Ok(vec![
        "journalctl".into(),
        "-u".into(),
        unit.into(),
        "-n".into(),
        lines.to_string(),
        "--no-pager".into(),
    ])
}
