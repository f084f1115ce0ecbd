use std::env;
use std::sync::OnceLock;

static AUTOMEM_PAGING: OnceLock<bool> = OnceLock::new();
static AUTOMEM_DEBUG_LOG: OnceLock<bool> = OnceLock::new();
static AUTOMEM_PROFILE: OnceLock<bool> = OnceLock::new();
static AUTOMEM_LOG_CAP: OnceLock<usize> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_usize(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok()
}

pub(crate) fn paging_enabled() -> bool {
    *AUTOMEM_PAGING.get_or_init(|| match env::var("AUTOMEM_PAGING") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => true,
    })
}

pub(crate) fn debug_log_enabled() -> bool {
    *AUTOMEM_DEBUG_LOG.get_or_init(|| match env::var("AUTOMEM_DEBUG_LOG") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

pub(crate) fn profile_enabled() -> bool {
    *AUTOMEM_PROFILE.get_or_init(|| match env::var("AUTOMEM_PROFILE") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

pub(crate) fn log_cap() -> usize {
    *AUTOMEM_LOG_CAP.get_or_init(|| {
        env::var("AUTOMEM_LOG_CAP")
            .ok()
            .and_then(|v| parse_usize(&v))
            .unwrap_or(32_768)
    })
}
