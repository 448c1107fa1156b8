use std::env;
use std::sync::OnceLock;

static DISABLE_MEMORY_SHARING: OnceLock<bool> = OnceLock::new();
static VALIDATE_PLANS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn read_flag(cell: &OnceLock<bool>, name: &str) -> bool {
    *cell.get_or_init(|| match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

/// Intermediate buffers with disjoint lifetimes share storage unless
/// `FNGRAPH_DISABLE_MEMORY_SHARING` is set.
pub(crate) fn memory_sharing_enabled() -> bool {
    !read_flag(&DISABLE_MEMORY_SHARING, "FNGRAPH_DISABLE_MEMORY_SHARING")
}

/// `FNGRAPH_VALIDATE_PLANS` re-checks evaluation order after every plan build.
pub(crate) fn validate_plans() -> bool {
    read_flag(&VALIDATE_PLANS, "FNGRAPH_VALIDATE_PLANS")
}
