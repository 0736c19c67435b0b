//! Small helpers shared by the service and the binaries

use std::env;
use std::time::Duration;

/// Consumer identity for this host: `<prefix>-<hostname>`.
///
/// The name has to survive a restart: pending entries belong to the consumer
/// that read them, and only a consumer with the same name drains them again.
pub fn host_consumer_name(prefix: &str) -> String {
    let host = env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok());
    consumer_name_for(prefix, host.as_deref())
}

/// `<prefix>-<host>`, or just `<prefix>` when the host is unknown
pub fn consumer_name_for(prefix: &str, host: Option<&str>) -> String {
    match host.map(str::trim).filter(|host| !host.is_empty()) {
        Some(host) => format!("{}-{}", prefix, host),
        None => prefix.to_string(),
    }
}

/// Next delay of an exponential backoff, capped at `max`
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_name_is_stable_per_host() {
        assert_eq!(
            host_consumer_name("sudoku-engine"),
            host_consumer_name("sudoku-engine")
        );
        assert_eq!(
            consumer_name_for("sudoku-engine", Some("node-a\n")),
            "sudoku-engine-node-a"
        );
        assert_eq!(consumer_name_for("sudoku-engine", Some("  ")), "sudoku-engine");
        assert_eq!(consumer_name_for("sudoku-engine", None), "sudoku-engine");
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let max = Duration::from_secs(5);
        assert_eq!(
            next_backoff(Duration::from_secs(1), max),
            Duration::from_secs(2)
        );
        assert_eq!(next_backoff(Duration::from_secs(4), max), max);
        assert_eq!(next_backoff(max, max), max);
    }
}
