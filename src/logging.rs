//! Logging setup and field formatting.
//!
//! The connector logs through `tracing`. Embedding applications usually install
//! their own subscriber; [`init`] is for those that don't, and is safe to call
//! more than once.

use tracing_subscriber::EnvFilter;

/// Install a stderr fmt subscriber filtered by `filter` (e.g. `"idlink=debug"`).
/// Returns `false` if a global subscriber was already set.
pub fn init(filter: &str) -> bool {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

const LOG_DATA_TRUNCATE_LEN: usize = 24;

/// Shorten attribute data for log lines. Author strings and addresses can be
/// long, and the full value is already in the database.
pub fn attr_data(data: &str) -> String {
    match data.char_indices().nth(LOG_DATA_TRUNCATE_LEN) {
        Some((end, _)) => format!("{}...", &data[..end]),
        None => data.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_data_unchanged() {
        assert_eq!(attr_data("durden"), "durden");
    }

    #[test]
    fn test_long_data_truncated_on_char_boundary() {
        let long = "Tyler Durden <tyler@mayhem.net>";
        assert_eq!(attr_data(long), "Tyler Durden <tyler@mayh...");

        let wide = "ü".repeat(30);
        assert_eq!(attr_data(&wide), format!("{}...", "ü".repeat(24)));
    }

    #[test]
    fn test_init_is_idempotent() {
        init("idlink=debug");
        assert!(!init("idlink=debug"));
    }
}
