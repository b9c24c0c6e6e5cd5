//! Declarative configuration (§4.11): resolved once at domain-open time and
//! never mutated afterward. This is the only place caller-supplied strings
//! are validated; everything downstream trusts a `Config` unconditionally.

use crate::error::{NaError, NaResult};
use crate::provider::ProviderKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    /// The caller drives progress explicitly via repeated `progress()` calls.
    Auto,
    /// The provider is asked to run its own background progress thread
    /// (forced when the provider can't combine a wait object with manual
    /// progress for the requested capabilities, §4.1).
    Manual,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// The provider name as given by the caller, before alias resolution
    /// (kept around purely for diagnostics).
    pub provider_name: String,
    pub kind: ProviderKind,
    pub host: Option<String>,
    pub service: Option<String>,
    pub progress_mode: ProgressMode,
    pub max_contexts: u8,
    pub auth_key: Option<Vec<u8>>,
}

impl Config {
    /// Validate and resolve caller-supplied configuration fields. Invalid
    /// input surfaces as `NaError::InvalidParameter` before any provider
    /// call is made (§4.11, §4.12).
    pub fn parse(
        provider_name: &str,
        host_name: Option<&str>,
        progress_mode: ProgressMode,
        max_contexts: u8,
        auth_key: Option<Vec<u8>>,
    ) -> NaResult<Config> {
        let kind = ProviderKind::from_alias(provider_name)
            .ok_or(NaError::InvalidParameter("unrecognized provider name"))?;
        log::debug!(
            "config: provider `{provider_name}` resolved to `{}`",
            kind.wire_name()
        );

        let (host, service) = match host_name {
            Some(raw) => split_host_service(raw)?,
            None => (None, None),
        };

        if !(1..=255).contains(&max_contexts) {
            return Err(NaError::InvalidParameter("max_contexts out of range 1..=255"));
        }

        let auth_key = match (kind, auth_key) {
            (ProviderKind::Gni, key) => key,
            (_, Some(_)) => {
                log::warn!(
                    "config: auth_key supplied for provider `{}`, which ignores it",
                    kind.wire_name()
                );
                None
            }
            (_, None) => None,
        };

        Ok(Config {
            provider_name: provider_name.to_string(),
            kind,
            host,
            service,
            progress_mode,
            max_contexts,
            auth_key,
        })
    }
}

/// Split a `host[:service]` string on the last `:`. A bare host with no
/// colon leaves `service` unset. More than one colon outside a bracketed
/// IPv6 literal is rejected.
fn split_host_service(raw: &str) -> NaResult<(Option<String>, Option<String>)> {
    if raw.is_empty() {
        return Ok((None, None));
    }
    if let Some(rest) = raw.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or(NaError::InvalidParameter("unterminated IPv6 literal in host_name"))?;
        let host = rest[..close].to_string();
        let tail = &rest[close + 1..];
        let service = match tail.strip_prefix(':') {
            Some(s) if !s.is_empty() => Some(s.to_string()),
            Some(_) => return Err(NaError::InvalidParameter("empty service after ':'")),
            None if tail.is_empty() => None,
            None => return Err(NaError::InvalidParameter("malformed host_name")),
        };
        return Ok((Some(host), service));
    }

    let colons = raw.matches(':').count();
    match colons {
        0 => Ok((Some(raw.to_string()), None)),
        1 => {
            let (host, service) = raw.rsplit_once(':').unwrap();
            if host.is_empty() || service.is_empty() {
                return Err(NaError::InvalidParameter("malformed host_name"));
            }
            Ok((Some(host.to_string()), Some(service.to_string())))
        }
        _ => Err(NaError::InvalidParameter(
            "host_name has more than one ':' outside an IPv6 literal",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_provider_aliases() {
        let cfg = Config::parse("tcp", None, ProgressMode::Auto, 4, None).unwrap();
        assert_eq!(cfg.kind, ProviderKind::Sockets);
        let cfg = Config::parse("verbs", None, ProgressMode::Auto, 4, None).unwrap();
        assert_eq!(cfg.kind, ProviderKind::VerbsRxm);
    }

    #[test]
    fn rejects_unknown_provider() {
        assert!(Config::parse("rocketnic", None, ProgressMode::Auto, 1, None).is_err());
    }

    #[test]
    fn splits_host_and_service() {
        let cfg =
            Config::parse("tcp", Some("127.0.0.1:7890"), ProgressMode::Auto, 4, None).unwrap();
        assert_eq!(cfg.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(cfg.service.as_deref(), Some("7890"));
    }

    #[test]
    fn bare_host_leaves_service_unset() {
        let cfg = Config::parse("tcp", Some("127.0.0.1"), ProgressMode::Auto, 4, None).unwrap();
        assert_eq!(cfg.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(cfg.service, None);
    }

    #[test]
    fn rejects_multiple_colons() {
        assert!(Config::parse("tcp", Some("a:b:c"), ProgressMode::Auto, 4, None).is_err());
    }

    #[test]
    fn max_contexts_out_of_range_is_rejected_before_anything_else() {
        // the literal scenario in §8.7: alias already resolved in the
        // diagnostic, but max_contexts = 0 still fails
        let err = Config::parse("tcp", Some("127.0.0.1:7890"), ProgressMode::Auto, 0, None)
            .unwrap_err();
        assert!(matches!(err, NaError::InvalidParameter(_)));
    }

    #[test]
    fn auth_key_on_non_gni_is_ignored_not_fatal() {
        let cfg =
            Config::parse("tcp", None, ProgressMode::Auto, 4, Some(vec![1, 2, 3])).unwrap();
        assert_eq!(cfg.auth_key, None);
    }

    #[test]
    fn auth_key_on_gni_is_kept() {
        let cfg =
            Config::parse("gni", None, ProgressMode::Auto, 4, Some(vec![1, 2, 3])).unwrap();
        assert_eq!(cfg.auth_key, Some(vec![1, 2, 3]));
    }
}
