//! DNS adapter for sender verification.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bpmail_core::verify::{IPN_RECORD_TYPE, NodeResolver, ResolveError};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::xfer::Protocol;
use hickory_resolver::Resolver;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use thiserror::Error;

use crate::config::ResolverSettings;

const DEFAULT_DNS_PORT: u16 = 53;

/// Resolver construction errors.
#[derive(Debug, Error)]
pub enum ResolverSetupError {
    /// Server list entry is not `addr[:port]`.
    #[error("invalid resolver server `{0}`")]
    InvalidServer(String),
    /// Server list is empty.
    #[error("resolver server list is empty")]
    NoServers,
    /// System resolver configuration could not be read.
    #[error("could not read system resolver configuration: {0}")]
    System(String),
}

/// [`NodeResolver`] backed by `hickory-resolver`.
pub struct DnsNodeResolver {
    resolver: Resolver<TokioConnectionProvider>,
}

impl DnsNodeResolver {
    /// Builds a resolver from settings.
    ///
    /// `servers_override` replaces `settings.servers`; with neither set the
    /// system configuration is used.
    pub fn from_settings(
        settings: &ResolverSettings,
        servers_override: Option<&str>,
    ) -> Result<Self, ResolverSetupError> {
        let (config, mut opts) = match servers_override.or(settings.servers.as_deref()) {
            Some(list) => {
                let name_servers: Vec<NameServerConfig> = parse_server_list(list)?
                    .into_iter()
                    .map(|addr| NameServerConfig::new(addr, Protocol::Udp))
                    .collect();
                (
                    ResolverConfig::from_parts(None, vec![], name_servers),
                    ResolverOpts::default(),
                )
            }
            None => hickory_resolver::system_conf::read_system_conf()
                .map_err(|err| ResolverSetupError::System(err.to_string()))?,
        };
        opts.timeout = Duration::from_secs(settings.timeout_secs);
        opts.attempts = settings.attempts;
        opts.cache_size = 0;

        let resolver = Resolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build();
        tracing::debug!(
            name_servers = resolver.config().name_servers().len(),
            "created node record resolver"
        );
        Ok(Self { resolver })
    }
}

#[async_trait]
impl NodeResolver for DnsNodeResolver {
    async fn node_records(&self, domain: &str) -> Result<Vec<Vec<u8>>, ResolveError> {
        let mut name = Name::from_ascii(domain)
            .map_err(|err| ResolveError::Enqueue(format!("{domain}: {err}")))?;
        name.set_fqdn(true);

        let lookup = self
            .resolver
            .lookup(name, RecordType::Unknown(IPN_RECORD_TYPE))
            .await
            .map_err(|err| ResolveError::Lookup(format!("{domain}: {err}")))?;

        Ok(lookup
            .iter()
            .filter_map(|rdata| match rdata {
                RData::Unknown { code, rdata } if u16::from(*code) == IPN_RECORD_TYPE => {
                    Some(rdata.anything().to_vec())
                }
                _ => None,
            })
            .collect())
    }
}

/// Parses a comma-separated `addr[:port]` list; IPv6 with a port is `[addr]:port`.
pub fn parse_server_list(list: &str) -> Result<Vec<SocketAddr>, ResolverSetupError> {
    let servers = list
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_server)
        .collect::<Result<Vec<_>, _>>()?;
    if servers.is_empty() {
        return Err(ResolverSetupError::NoServers);
    }
    Ok(servers)
}

fn parse_server(entry: &str) -> Result<SocketAddr, ResolverSetupError> {
    if let Ok(addr) = entry.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let bare = entry
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(entry);
    bare.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_DNS_PORT))
        .map_err(|_| ResolverSetupError::InvalidServer(entry.to_owned()))
}
