//! Utility functions for Farol
//!
//! Common helper functions used across the codebase.

use std::sync::LazyLock;

use if_addrs::IfAddr;

/// Regex pattern for validating identifiers (service names, run ids, target ids)
static VALID_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new("^[a-zA-Z0-9_.:-]+$").expect("Invalid regex pattern"));

/// Validate a non-empty identifier.
///
/// Allowed characters: alphanumeric, underscore, dot, colon, hyphen.
/// Slashes are rejected because identifiers become path segments in the
/// coordination store.
///
/// # Examples
///
/// ```
/// use farol_common::is_valid_name;
///
/// assert!(is_valid_name("payment-service"));
/// assert!(is_valid_name("run_1.targets:v2"));
/// assert!(!is_valid_name(""));
/// assert!(!is_valid_name("a/b"));
/// ```
pub fn is_valid_name(name: &str) -> bool {
    VALID_PATTERN.is_match(name)
}

/// Get the local IP address
///
/// Returns the first non-loopback IPv4 address found,
/// or "127.0.0.1" as fallback.
pub fn local_host() -> String {
    if_addrs::get_if_addrs()
        .ok()
        .and_then(|addrs| {
            addrs
                .into_iter()
                .find(|iface| !iface.is_loopback() && matches!(iface.addr, IfAddr::V4(_)))
                .and_then(|iface| match iface.addr {
                    IfAddr::V4(addr) => Some(addr.ip.to_string()),
                    _ => None,
                })
        })
        .unwrap_or_else(|| "127.0.0.1".to_string())
}
