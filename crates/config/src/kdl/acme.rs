//! ACME, renewal policy, hook and certificate KDL parsing.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::trace;

use warden_common::{ChallengeKind, RenewalPolicy};

use crate::{AcmeConfig, HookConfig, ManagedCertificateConfig};

use super::helpers::{
    get_bool_entry, get_first_arg_string, get_string_args, get_string_entry, get_u32_entry,
    get_u64_entry,
};

fn parse_challenge(value: &str, context: &str) -> Result<ChallengeKind> {
    ChallengeKind::from_str_loose(value).ok_or_else(|| {
        anyhow::anyhow!(
            "Invalid challenge '{}' in {}. Valid challenges: http-01, dns-01",
            value,
            context
        )
    })
}

/// Parse acme configuration block
pub fn parse_acme_config(node: &kdl::KdlNode) -> Result<AcmeConfig> {
    trace!("Parsing acme configuration block");
    let defaults = AcmeConfig::default();

    let challenge = match get_string_entry(node, "challenge") {
        Some(value) => parse_challenge(&value, "acme block")?,
        None => defaults.challenge,
    };

    let config = AcmeConfig {
        email: get_string_entry(node, "email"),
        directory: get_string_entry(node, "directory"),
        staging: get_bool_entry(node, "staging").unwrap_or(defaults.staging),
        challenge,
        webroot: get_string_entry(node, "webroot").map(PathBuf::from),
        dns_present: get_string_entry(node, "dns-present"),
        dns_cleanup: get_string_entry(node, "dns-cleanup"),
        dns_propagation_secs: get_u64_entry(node, "dns-propagation-secs")?
            .unwrap_or(defaults.dns_propagation_secs),
        request_timeout_secs: get_u64_entry(node, "request-timeout-secs")?
            .unwrap_or(defaults.request_timeout_secs),
        default_retry_after_secs: get_u64_entry(node, "default-retry-after-secs")?
            .unwrap_or(defaults.default_retry_after_secs),
        poll_interval_secs: get_u64_entry(node, "poll-interval-secs")?
            .unwrap_or(defaults.poll_interval_secs),
        poll_attempts: get_u32_entry(node, "poll-attempts")?.unwrap_or(defaults.poll_attempts),
    };

    trace!(
        directory = %config.directory_url(),
        challenge = %config.challenge,
        has_webroot = config.webroot.is_some(),
        has_dns_responder = config.has_dns_responder(),
        "Parsed acme configuration"
    );
    Ok(config)
}

/// Parse the default renewal policy block
pub fn parse_policy_config(node: &kdl::KdlNode) -> Result<RenewalPolicy> {
    let mut policy = RenewalPolicy::default();

    if let Some(days) = get_u32_entry(node, "renew-before-days")? {
        policy = policy.with_renew_before_days(days);
    }
    if let Some(secs) = get_u64_entry(node, "renew-before-secs")? {
        policy.renew_before_expiry_secs = secs;
    }
    if let Some(max_retries) = get_u32_entry(node, "max-retries")? {
        policy.max_retries = max_retries;
    }
    if let Some(base) = get_u64_entry(node, "backoff-base-secs")? {
        policy.retry_backoff.base_secs = base;
    }
    if let Some(max) = get_u64_entry(node, "backoff-max-secs")? {
        policy.retry_backoff.max_secs = max;
    }
    if let Some(multiplier) = get_u32_entry(node, "backoff-multiplier")? {
        policy.retry_backoff.multiplier = multiplier;
    }

    trace!(
        renew_before_expiry_secs = policy.renew_before_expiry_secs,
        max_retries = policy.max_retries,
        "Parsed renewal policy"
    );
    Ok(policy)
}

/// Parse hooks configuration block
pub fn parse_hooks(node: &kdl::KdlNode) -> Result<BTreeMap<String, HookConfig>> {
    trace!("Parsing hooks configuration block");
    let mut hooks = BTreeMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() != "hook" {
                continue;
            }

            let name = get_first_arg_string(child).ok_or_else(|| {
                anyhow::anyhow!("Hook requires a name argument, e.g., hook \"reload-proxy\" {{ ... }}")
            })?;

            let command = get_string_entry(child, "command").ok_or_else(|| {
                anyhow::anyhow!(
                    "Hook '{}' requires a 'command' field, e.g., command \"systemctl reload nginx\"",
                    name
                )
            })?;

            let mut hook = HookConfig::new(command);
            if let Some(timeout) = get_u64_entry(child, "timeout-secs")? {
                hook.timeout_secs = timeout;
            }
            if let Some(retries) = get_u32_entry(child, "retries")? {
                hook.retries = retries;
            }

            trace!(hook = %name, timeout_secs = hook.timeout_secs, "Parsed hook");

            if hooks.insert(name.clone(), hook).is_some() {
                return Err(anyhow::anyhow!("Hook '{}' is defined more than once", name));
            }
        }
    }

    Ok(hooks)
}

/// Parse a `certificate "<primary>" { ... }` block
pub fn parse_certificate(node: &kdl::KdlNode) -> Result<ManagedCertificateConfig> {
    let primary = get_first_arg_string(node).ok_or_else(|| {
        anyhow::anyhow!(
            "Certificate requires its primary domain as argument, e.g., certificate \"example.com\" {{ ... }}"
        )
    })?;

    // The primary domain always leads, even if `domains` omits or reorders it
    let mut domains = vec![primary.clone()];
    for domain in get_string_args(node, "domains") {
        if !domain.eq_ignore_ascii_case(&primary) {
            domains.push(domain);
        }
    }

    let challenge = get_string_entry(node, "challenge")
        .map(|value| parse_challenge(&value, &format!("certificate '{}'", primary)))
        .transpose()?;

    let config = ManagedCertificateConfig {
        domains,
        challenge,
        hooks: get_string_args(node, "hooks"),
        renew_before_days: get_u32_entry(node, "renew-before-days")?,
        max_retries: get_u32_entry(node, "max-retries")?,
    };

    trace!(
        certificate = %primary,
        domains = config.domains.len(),
        hooks = config.hooks.len(),
        "Parsed certificate"
    );
    Ok(config)
}
