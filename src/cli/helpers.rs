//! Shared helper functions for CLI commands.

use std::sync::Arc;

use anyhow::Context;

use crate::config::Settings;
use crate::pipeline::Pipeline;

/// Connect the configured backends and wire a pipeline around them.
pub async fn build_pipeline(settings: &Settings) -> anyhow::Result<Arc<Pipeline>> {
    let store = settings
        .connect_queue()
        .await
        .context("Failed to open queue store")?;
    let collab = settings
        .collaborators()
        .context("Failed to set up collaborators")?;
    Ok(Arc::new(settings.assemble(store, collab)))
}

/// Resolves on Ctrl+C (or SIGTERM on unix).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Parse a bind address that can be:
/// - Just a port: "3030" -> default host, port 3030
/// - Just a host: "127.0.0.1" -> that host, default port
/// - Host and port: "0.0.0.0:3030"
pub fn parse_bind_address(bind: &str, default_host: &str, default_port: u16) -> (String, u16) {
    if let Ok(port) = bind.parse::<u16>() {
        return (default_host.to_string(), port);
    }

    if let Some((host, port_str)) = bind.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            return (host.to_string(), port);
        }
    }

    (bind.to_string(), default_port)
}

/// Parse a decimal amount ("1250", "1250.5", "1,250.00") into minor units.
pub fn parse_amount_minor(raw: &str) -> anyhow::Result<i64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.as_str()),
    };

    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() || frac.len() > 2 {
        anyhow::bail!("Invalid amount: {}", raw);
    }
    if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        anyhow::bail!("Invalid amount: {}", raw);
    }

    let whole: i64 = whole.parse().with_context(|| format!("Invalid amount: {}", raw))?;
    let cents: i64 = format!("{:0<2}", frac).parse().unwrap_or(0);
    let minor = whole
        .checked_mul(100)
        .and_then(|w| w.checked_add(cents))
        .with_context(|| format!("Amount out of range: {}", raw))?;

    Ok(if negative { -minor } else { minor })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bind_address() {
        assert_eq!(parse_bind_address("9000", "0.0.0.0", 8080), ("0.0.0.0".into(), 9000));
        assert_eq!(
            parse_bind_address("127.0.0.1", "0.0.0.0", 8080),
            ("127.0.0.1".into(), 8080)
        );
        assert_eq!(
            parse_bind_address("10.0.0.5:3030", "0.0.0.0", 8080),
            ("10.0.0.5".into(), 3030)
        );
    }

    #[test]
    fn test_parse_amount_minor() {
        assert_eq!(parse_amount_minor("1250").unwrap(), 125_000);
        assert_eq!(parse_amount_minor("1,250.5").unwrap(), 125_050);
        assert_eq!(parse_amount_minor("0.07").unwrap(), 7);
        assert_eq!(parse_amount_minor("-3.10").unwrap(), -310);
        assert!(parse_amount_minor("12.345").is_err());
        assert!(parse_amount_minor("abc").is_err());
        assert!(parse_amount_minor(".50").is_err());
    }
}
