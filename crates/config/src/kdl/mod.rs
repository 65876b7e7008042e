//! KDL document to [`Config`] conversion.

mod acme;
mod helpers;
mod service;

use anyhow::Result;
use tracing::{trace, warn};

use crate::Config;

/// Convert a parsed KDL document into a [`Config`]
pub fn parse_document(doc: &kdl::KdlDocument) -> Result<Config> {
    let mut config = Config::default();

    for node in doc.nodes() {
        let name = node.name().value();
        trace!(block = %name, "Parsing configuration block");

        match name {
            "storage" => config.storage = service::parse_storage_config(node)?,
            "acme" => config.acme = acme::parse_acme_config(node)?,
            "scheduler" => config.scheduler = service::parse_scheduler_config(node)?,
            "policy" => config.policy = acme::parse_policy_config(node)?,
            "hooks" => {
                for (hook_name, hook) in acme::parse_hooks(node)? {
                    if config.hooks.insert(hook_name.clone(), hook).is_some() {
                        return Err(anyhow::anyhow!(
                            "Hook '{}' is defined more than once",
                            hook_name
                        ));
                    }
                }
            }
            "certificate" => config.certificates.push(acme::parse_certificate(node)?),
            "logging" => config.logging = service::parse_logging_config(node)?,
            "metrics" => config.metrics = service::parse_metrics_config(node)?,
            other => {
                warn!(block = %other, "Ignoring unknown configuration block");
            }
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use crate::{Config, LogFormat};
    use warden_common::ChallengeKind;

    const FULL: &str = r#"
        storage { path "/tmp/warden" }
        acme {
            email "ops@example.com"
            directory "https://acme.internal/directory"
            challenge "dns-01"
            dns-present "/usr/local/bin/dns add"
            dns-cleanup "/usr/local/bin/dns del"
            request-timeout-secs 10
        }
        scheduler {
            tick-interval-secs 3600
            pool-size 8
            horizon-secs 600
        }
        policy {
            renew-before-days 21
            max-retries 3
            backoff-base-secs 60
        }
        hooks {
            hook "reload-proxy" {
                command "systemctl reload nginx"
                timeout-secs 5
                retries 1
            }
        }
        certificate "example.com" {
            domains "www.example.com" "example.com"
            challenge "http-01"
            hooks "reload-proxy"
            renew-before-days 10
        }
        certificate "api.example.com" {}
        logging { level "debug" format "json" }
        metrics { textfile "/tmp/warden.prom" }
    "#;

    #[test]
    fn test_parse_full_document() {
        let config = Config::from_kdl(FULL).unwrap();

        assert_eq!(config.storage.path.to_str(), Some("/tmp/warden"));
        assert_eq!(config.acme.directory_url(), "https://acme.internal/directory");
        assert_eq!(config.acme.challenge, ChallengeKind::Dns01);
        assert!(config.acme.has_dns_responder());
        assert_eq!(config.acme.request_timeout_secs, 10);

        assert_eq!(config.scheduler.tick_interval_secs, 3600);
        assert_eq!(config.scheduler.pool_size, 8);
        assert_eq!(config.scheduler.horizon_secs, 600);

        assert_eq!(config.policy.renew_before_expiry_secs, 21 * 86400);
        assert_eq!(config.policy.max_retries, 3);
        assert_eq!(config.policy.retry_backoff.base_secs, 60);

        let hook = &config.hooks["reload-proxy"];
        assert_eq!(hook.command, "systemctl reload nginx");
        assert_eq!(hook.timeout_secs, 5);
        assert_eq!(hook.retries, 1);

        assert_eq!(config.certificates.len(), 2);
        let cert = &config.certificates[0];
        assert_eq!(cert.domains, vec!["example.com", "www.example.com"]);
        assert_eq!(cert.challenge, Some(ChallengeKind::Http01));
        assert_eq!(cert.hooks, vec!["reload-proxy"]);
        assert_eq!(cert.renew_before_days, Some(10));
        assert_eq!(config.certificates[1].domains, vec!["api.example.com"]);

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.metrics.textfile.is_some());
    }

    #[test]
    fn test_invalid_challenge_rejected() {
        let err = Config::from_kdl(r#"acme { challenge "tls-alpn-01" }"#).unwrap_err();
        assert!(err.to_string().contains("Invalid challenge"));
    }

    #[test]
    fn test_hook_requires_command() {
        let err = Config::from_kdl(r#"hooks { hook "x" { timeout-secs 3 } }"#).unwrap_err();
        assert!(err.to_string().contains("requires a 'command'"));
    }

    #[test]
    fn test_negative_integer_rejected() {
        let err = Config::from_kdl(r#"scheduler { pool-size -1 }"#).unwrap_err();
        assert!(err.to_string().contains("non-negative"));
    }
}
