// Copyright 2024-2026 GG-DEPLOY Contributors
// SPDX-License-Identifier: Apache-2.0

//! Config CLI subcommands: show, defaults, validate.

use crate::config::{DeployConfig, EffectiveConfig};

use super::load_config;

/// Print the effective configuration. Returns the exit code.
pub fn run_show(json: bool) -> i32 {
    match load_config() {
        Ok(cfg) => {
            print_config(&cfg.effective_config(), json);
            0
        }
        Err(e) => {
            eprintln!("Config error: {}", e);
            1
        }
    }
}

/// Print built-in defaults as a TOML file.
pub fn run_defaults() -> i32 {
    match toml::to_string_pretty(&DeployConfig::default()) {
        Ok(text) => {
            print!("{}", text);
            0
        }
        Err(e) => {
            eprintln!("Failed to render defaults: {}", e);
            1
        }
    }
}

/// Warn about combinations that load but behave poorly.
///
/// Returns 0 if valid, 1 if the file is broken or any warning is found.
pub fn run_validate() -> i32 {
    let cfg = match load_config() {
        Ok(cfg) => cfg.effective_config(),
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return 1;
        }
    };
    let warnings = validate(&cfg);
    for warning in &warnings {
        eprintln!("WARNING: {}", warning);
    }
    if warnings.is_empty() {
        println!("Configuration is valid.");
        0
    } else {
        1
    }
}

fn validate(cfg: &EffectiveConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if cfg.request_timeout_ms < cfg.queue_timeout_ms {
        warnings.push(format!(
            "request timeout ({} ms) is below the queue timeout ({} ms); loads may time out on the control side",
            cfg.request_timeout_ms, cfg.queue_timeout_ms
        ));
    }
    if cfg.event_poll_ms > cfg.request_timeout_ms {
        warnings.push(format!(
            "event poll ({} ms) exceeds the request timeout ({} ms)",
            cfg.event_poll_ms, cfg.request_timeout_ms
        ));
    }
    if cfg.download_chunk_size < 4096 {
        warnings.push(format!("download chunk of {} bytes makes transfers chatty", cfg.download_chunk_size));
    }
    warnings
}

fn print_config(cfg: &EffectiveConfig, json: bool) {
    if json {
        match serde_json::to_string_pretty(cfg) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to render config: {}", e),
        }
        return;
    }
    println!("GG_DEPLOY_EVENT_POLL_MS={}", cfg.event_poll_ms);
    println!("GG_DEPLOY_DISPATCHER_POLL_MS={}", cfg.dispatcher_poll_ms);
    println!("GG_DEPLOY_WORKER_POLL_MS={}", cfg.worker_poll_ms);
    println!("GG_DEPLOY_QUEUE_TIMEOUT_MS={}", cfg.queue_timeout_ms);
    println!("GG_DEPLOY_REQUEST_TIMEOUT_MS={}", cfg.request_timeout_ms);
    println!("GG_DEPLOY_DOWNLOAD_CHUNK={}", cfg.download_chunk_size);
    println!("GG_DEPLOY_MAX_MESSAGE={}", cfg.max_message_size);
    println!("GG_DEPLOY_MBUF_CAPACITY={}", cfg.mbuf_capacity);
    println!("GG_DEPLOY_QUEUE_DEPTH={}", cfg.default_queue_depth);
    println!("GG_DEPLOY_LOG_LEVEL={}", cfg.log_level);
    println!("GG_DEPLOY_LOG_FORMAT={}", cfg.log_format);
    if let Some(path) = &cfg.log_file {
        println!("GG_DEPLOY_LOG_FILE={}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_clean() {
        assert!(validate(&DeployConfig::default().effective_config()).is_empty());
    }

    #[test]
    fn short_request_timeout_warns() {
        let cfg = DeployConfig { request_timeout_ms: 100, ..DeployConfig::default() };
        let warnings = validate(&cfg.effective_config());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("request timeout"));
    }
}
