/*
 * DPIS Line Assistant - LINE registration and AI relay gateway
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Process bootstrap helpers shared by DPIS Line services.
//!
//! - [`load_dotenv`]: read `KEY=value` pairs from `.env` before the runtime starts
//! - [`shutdown_signal`]: graceful SIGINT/SIGTERM handler

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]

use std::path::Path;
use tracing::{error, info};

// ---------------------------------------------------------------------------
// .env loading
// ---------------------------------------------------------------------------

/// Split one `.env` line into key and value.
///
/// Blank lines and `#` comments yield `None`. An optional `export ` prefix
/// and one layer of matching single or double quotes around the value are
/// stripped.
#[must_use]
pub fn parse_dotenv_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, val) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let val = val.trim();
    let val = ['"', '\'']
        .iter()
        .find_map(|q| val.strip_prefix(*q).and_then(|v| v.strip_suffix(*q)))
        .unwrap_or(val);
    Some((key, val))
}

/// Load `path` into the process environment. Variables already set in the
/// environment are left alone. Returns how many variables were set.
///
/// Call this from `main()` before building the tokio runtime: it mutates
/// the environment and must run while the process is single-threaded.
/// Tracing is not initialized yet at that point, so progress goes to stderr.
pub fn load_dotenv_from(path: &Path) -> usize {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: not loaded ({e})", path.display());
            return 0;
        }
    };
    let mut loaded = 0;
    for (key, val) in contents.lines().filter_map(parse_dotenv_line) {
        if std::env::var_os(key).is_some() {
            continue;
        }
        std::env::set_var(key, val);
        eprintln!("{}: loaded {key}", path.display());
        loaded += 1;
    }
    loaded
}

/// [`load_dotenv_from`] for `.env` in the working directory.
pub fn load_dotenv() -> usize {
    load_dotenv_from(Path::new(".env"))
}

// ---------------------------------------------------------------------------
// Shutdown signal
// ---------------------------------------------------------------------------

/// Wait for SIGINT (ctrl-c) or SIGTERM, then return.
///
/// Use with `axum::serve(...).with_graceful_shutdown(...)`.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .unwrap_or_else(|e| error!(error = %e, "ctrl-c handler failed"));
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler unavailable, relying on ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_pair() {
        assert_eq!(
            parse_dotenv_line("LINE_CHANNEL_SECRET=abc123"),
            Some(("LINE_CHANNEL_SECRET", "abc123"))
        );
    }

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        assert_eq!(parse_dotenv_line("# comment"), None);
        assert_eq!(parse_dotenv_line("   "), None);
        assert_eq!(parse_dotenv_line("no_equals_sign"), None);
        assert_eq!(parse_dotenv_line("=value"), None);
    }

    #[test]
    fn test_parse_strips_export_and_quotes() {
        assert_eq!(
            parse_dotenv_line("export OPENAI_API_KEY=\"sk-test\""),
            Some(("OPENAI_API_KEY", "sk-test"))
        );
        assert_eq!(parse_dotenv_line("PORT = '8080' "), Some(("PORT", "8080")));
    }

    #[test]
    fn test_parse_keeps_equals_in_value() {
        assert_eq!(
            parse_dotenv_line("TOKEN=a=b=c"),
            Some(("TOKEN", "a=b=c"))
        );
    }

    #[test]
    fn test_load_dotenv_from_file_does_not_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "DPL_RT_TEST_FRESH=from-file\nDPL_RT_TEST_PRESET=from-file\n# ignored\n",
        )
        .unwrap();
        std::env::set_var("DPL_RT_TEST_PRESET", "from-env");
        std::env::remove_var("DPL_RT_TEST_FRESH");

        let loaded = load_dotenv_from(&path);

        assert_eq!(loaded, 1);
        assert_eq!(std::env::var("DPL_RT_TEST_FRESH").unwrap(), "from-file");
        assert_eq!(std::env::var("DPL_RT_TEST_PRESET").unwrap(), "from-env");
    }

    #[test]
    fn test_load_dotenv_missing_file() {
        let loaded = load_dotenv_from(Path::new("/tmp/dpisline_no_such_dotenv_file"));
        assert_eq!(loaded, 0);
    }
}
