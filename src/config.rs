use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_with::{serde_as, OneOrMany};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub listen_address: HostAndPort,
    pub doh_client_configuration: DohClientConfiguration,
    #[serde(default)]
    pub dns_proxy_configuration: DnsProxyConfiguration,
    #[serde(default)]
    pub cache_configuration: CacheConfiguration,
    #[serde(default)]
    pub prefetch_configuration: PrefetchConfiguration,
    /// Janitor period in seconds.
    #[serde(default = "default_timer_interval_seconds")]
    pub timer_interval_seconds: u64,
    /// Accepted for config compatibility; this build has no debug HTTP
    /// surface.
    #[serde(default)]
    pub pprof_configuration: PprofConfiguration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .with_context(|| format!("listen host is not an ip address: {:?}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DohClientConfiguration {
    /// One upstream URL or a list; one is picked at random per request.
    #[serde_as(as = "OneOrMany<_>")]
    pub url: Vec<String>,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_semaphore_acquire_timeout_milliseconds")]
    pub semaphore_acquire_timeout_milliseconds: u64,
    #[serde(default = "default_request_timeout_milliseconds")]
    pub request_timeout_milliseconds: u64,
    #[serde(default)]
    pub transport: DohTransport,
}

impl DohClientConfiguration {
    pub fn semaphore_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.semaphore_acquire_timeout_milliseconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_milliseconds)
    }
}

/// Upstream wire format: binary POST bodies or the JSON GET API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DohTransport {
    #[default]
    Post,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsProxyConfiguration {
    #[serde(rename = "clampMinTTLSeconds", default = "default_clamp_min_ttl_seconds")]
    pub clamp_min_ttl_seconds: u32,
    #[serde(rename = "clampMaxTTLSeconds", default = "default_clamp_max_ttl_seconds")]
    pub clamp_max_ttl_seconds: u32,
    #[serde(default)]
    pub forward_domain_configurations: Vec<ForwardDomainConfiguration>,
    #[serde(default)]
    pub reverse_domain_configurations: Vec<ReverseDomainConfiguration>,
    #[serde(default)]
    pub blocked_domains_file: Option<PathBuf>,
    /// Pad outgoing binary requests to 128-byte blocks.
    #[serde(default)]
    pub pad_outgoing_requests: bool,
}

impl Default for DnsProxyConfiguration {
    fn default() -> Self {
        Self {
            clamp_min_ttl_seconds: default_clamp_min_ttl_seconds(),
            clamp_max_ttl_seconds: default_clamp_max_ttl_seconds(),
            forward_domain_configurations: Vec::new(),
            reverse_domain_configurations: Vec::new(),
            blocked_domains_file: None,
            pad_outgoing_requests: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardDomainConfiguration {
    pub domain: String,
    #[serde(default)]
    pub names_to_addresses: Vec<ForwardNameToAddress>,
    #[serde(rename = "responseTTLSeconds", default = "default_response_ttl_seconds")]
    pub response_ttl_seconds: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardNameToAddress {
    pub name: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseDomainConfiguration {
    pub domain: String,
    #[serde(default)]
    pub addresses_to_names: Vec<ReverseAddressToName>,
    #[serde(rename = "responseTTLSeconds", default = "default_response_ttl_seconds")]
    pub response_ttl_seconds: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseAddressToName {
    pub reverse_address: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfiguration {
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
    #[serde(default = "default_max_purges_per_timer_pop")]
    pub max_purges_per_timer_pop: usize,
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            max_purges_per_timer_pop: default_max_purges_per_timer_pop(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchConfiguration {
    #[serde(default = "default_prefetch_max_cache_size")]
    pub max_cache_size: u64,
    #[serde(default = "default_prefetch_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_prefetch_sleep_interval_seconds")]
    pub sleep_interval_seconds: u64,
    #[serde(default = "default_prefetch_max_cache_entry_age_seconds")]
    pub max_cache_entry_age_seconds: u64,
}

impl PrefetchConfiguration {
    pub fn sleep_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_interval_seconds)
    }

    pub fn max_cache_entry_age(&self) -> Duration {
        Duration::from_secs(self.max_cache_entry_age_seconds)
    }
}

impl Default for PrefetchConfiguration {
    fn default() -> Self {
        Self {
            max_cache_size: default_prefetch_max_cache_size(),
            num_workers: default_prefetch_num_workers(),
            sleep_interval_seconds: default_prefetch_sleep_interval_seconds(),
            max_cache_entry_age_seconds: default_prefetch_max_cache_entry_age_seconds(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PprofConfiguration {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub listen_address: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Configuration> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: Configuration = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    validate(&cfg)?;

    info!(path = %path.display(), "config loaded");
    Ok(cfg)
}

fn validate(cfg: &Configuration) -> Result<()> {
    cfg.listen_address.socket_addr()?;

    let doh = &cfg.doh_client_configuration;
    if doh.url.is_empty() {
        anyhow::bail!("dohClientConfiguration.url must name at least one upstream");
    }
    if doh.max_concurrent_requests == 0 {
        anyhow::bail!("dohClientConfiguration.maxConcurrentRequests must be at least 1");
    }
    if doh.request_timeout_milliseconds == 0 {
        anyhow::bail!("dohClientConfiguration.requestTimeoutMilliseconds must be positive");
    }

    let proxy = &cfg.dns_proxy_configuration;
    if proxy.clamp_max_ttl_seconds == 0 {
        anyhow::bail!("dnsProxyConfiguration.clampMaxTTLSeconds must be positive");
    }
    if proxy.clamp_min_ttl_seconds > proxy.clamp_max_ttl_seconds {
        anyhow::bail!(
            "dnsProxyConfiguration clamp range is inverted: min {} > max {}",
            proxy.clamp_min_ttl_seconds,
            proxy.clamp_max_ttl_seconds
        );
    }
    for forward in &proxy.forward_domain_configurations {
        if forward.domain.trim().is_empty() {
            anyhow::bail!("forward domain configuration with empty domain");
        }
        for entry in &forward.names_to_addresses {
            entry.ip_address.parse::<Ipv4Addr>().with_context(|| {
                format!(
                    "forward entry {:?} has invalid ipv4 address {:?}",
                    entry.name, entry.ip_address
                )
            })?;
        }
    }
    for reverse in &proxy.reverse_domain_configurations {
        if reverse.domain.trim().is_empty() {
            anyhow::bail!("reverse domain configuration with empty domain");
        }
        for entry in &reverse.addresses_to_names {
            if entry.name.trim().is_empty() {
                anyhow::bail!(
                    "reverse entry {:?} has an empty target name",
                    entry.reverse_address
                );
            }
        }
    }

    if cfg.cache_configuration.max_size == 0 {
        anyhow::bail!("cacheConfiguration.maxSize must be at least 1");
    }
    if cfg.cache_configuration.max_purges_per_timer_pop == 0 {
        anyhow::bail!("cacheConfiguration.maxPurgesPerTimerPop must be at least 1");
    }

    let prefetch = &cfg.prefetch_configuration;
    if prefetch.max_cache_size == 0 {
        anyhow::bail!("prefetchConfiguration.maxCacheSize must be at least 1");
    }
    if prefetch.num_workers == 0 {
        anyhow::bail!("prefetchConfiguration.numWorkers must be at least 1");
    }
    if prefetch.sleep_interval_seconds == 0 {
        anyhow::bail!("prefetchConfiguration.sleepIntervalSeconds must be positive");
    }
    if prefetch.max_cache_entry_age_seconds == 0 {
        anyhow::bail!("prefetchConfiguration.maxCacheEntryAgeSeconds must be positive");
    }

    if cfg.timer_interval_seconds == 0 {
        anyhow::bail!("timerIntervalSeconds must be positive");
    }

    Ok(())
}

fn default_timer_interval_seconds() -> u64 {
    60
}

fn default_max_concurrent_requests() -> usize {
    10
}

fn default_semaphore_acquire_timeout_milliseconds() -> u64 {
    2_000
}

fn default_request_timeout_milliseconds() -> u64 {
    5_000
}

fn default_clamp_min_ttl_seconds() -> u32 {
    60
}

fn default_clamp_max_ttl_seconds() -> u32 {
    86_400
}

fn default_response_ttl_seconds() -> u32 {
    60
}

fn default_cache_max_size() -> usize {
    10_000
}

fn default_max_purges_per_timer_pop() -> usize {
    100
}

fn default_prefetch_max_cache_size() -> u64 {
    1_000
}

fn default_prefetch_num_workers() -> usize {
    4
}

fn default_prefetch_sleep_interval_seconds() -> u64 {
    30
}

fn default_prefetch_max_cache_entry_age_seconds() -> u64 {
    3_600
}
