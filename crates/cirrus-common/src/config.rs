//! Startup configuration for the operator
//!
//! Parsed once from flags and environment, validated, then passed down by
//! value. Nothing reads the environment after startup.

use std::time::Duration;

use clap::Args;
use ipnetwork::Ipv4Network;

use crate::{Error, Result};

/// Smallest allowed allocation prefix; anything larger than a /16 per
/// cluster is not supported
pub const MIN_ALLOCATED_MASK_BITS: u8 = 16;

/// Largest allowed allocation prefix; the block must still split into
/// overlay, master and worker ranges
pub const MAX_ALLOCATED_MASK_BITS: u8 = 28;

/// Operator configuration
#[derive(Args, Clone, Debug)]
pub struct OperatorConfig {
    /// Installation name, used to key the allocator lock
    #[arg(long, env = "CIRRUS_INSTALLATION", default_value = "cirrus")]
    pub installation_name: String,

    /// Namespace holding operator-owned coordination objects
    #[arg(long, env = "CIRRUS_NAMESPACE", default_value = "cirrus-system")]
    pub namespace: String,

    /// Identity of this operator replica (lock holder)
    #[arg(long, env = "POD_NAME", default_value = "cirrus-operator")]
    pub identity: String,

    /// Address pool cluster blocks are allocated from
    #[arg(long, env = "CIRRUS_IPAM_NETWORK_RANGE", default_value = "10.0.0.0/8")]
    pub ipam_network_range: Ipv4Network,

    /// Ranges inside the pool that must never be handed out
    #[arg(long, env = "CIRRUS_IPAM_RESERVED_RANGES", value_delimiter = ',')]
    pub ipam_reserved_ranges: Vec<Ipv4Network>,

    /// Default prefix length of a cluster block
    #[arg(long, env = "CIRRUS_ALLOCATED_MASK_BITS", default_value_t = 16)]
    pub allocated_mask_bits: u8,

    /// Seconds before a cluster's next pass is requeued
    ///
    /// An upper bound: every status write is a watch event, so a pass that
    /// persists a record triggers the next one right away.
    #[arg(long, env = "CIRRUS_PASS_INTERVAL_SECS", default_value_t = 60)]
    pub pass_interval_secs: u64,

    /// Seconds to wait for the allocator lock before giving up the pass
    #[arg(long, env = "CIRRUS_LOCK_TIMEOUT_SECS", default_value_t = 30)]
    pub lock_timeout_secs: u64,

    /// Attempts per provider call before the pass fails
    #[arg(long, env = "CIRRUS_RETRY_ATTEMPTS", default_value_t = 4)]
    pub retry_attempts: u32,

    /// Provider management endpoint
    #[arg(
        long,
        env = "CIRRUS_ARM_ENDPOINT",
        default_value = "https://management.azure.com"
    )]
    pub arm_endpoint: String,

    /// Provider subscription all cluster resources live in
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID", default_value = "")]
    pub subscription_id: String,

    /// Bearer token for the provider API, obtained by the credential sidecar
    #[arg(long, env = "AZURE_ACCESS_TOKEN", default_value = "", hide_env_values = true)]
    pub access_token: String,
}

impl OperatorConfig {
    /// Validate the configuration once at startup
    pub fn validate(&self) -> Result<()> {
        if self.installation_name.trim().is_empty() {
            return Err(Error::validation("installation name cannot be empty"));
        }
        if self.ipam_network_range.prefix() == 0 {
            return Err(Error::validation("IPAM network range must not be empty"));
        }
        validate_mask_bits(self.allocated_mask_bits, &self.ipam_network_range)?;
        if self.pass_interval_secs == 0 {
            return Err(Error::validation("pass interval must be positive"));
        }
        if self.lock_timeout_secs == 0 {
            return Err(Error::validation("lock timeout must be positive"));
        }
        if self.retry_attempts == 0 {
            return Err(Error::validation("retry attempts must be positive"));
        }
        if self.subscription_id.trim().is_empty() {
            return Err(Error::validation("subscription id is required"));
        }
        Ok(())
    }

    /// Interval between passes
    pub fn pass_interval(&self) -> Duration {
        Duration::from_secs(self.pass_interval_secs)
    }

    /// Bounded allocator lock wait
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Retry policy for provider calls
    pub fn retry(&self) -> crate::retry::RetryConfig {
        crate::retry::RetryConfig::with_max_attempts(self.retry_attempts)
    }
}

/// Check a requested block prefix against the pool it is carved from
pub fn validate_mask_bits(mask_bits: u8, pool: &Ipv4Network) -> Result<()> {
    if mask_bits < MIN_ALLOCATED_MASK_BITS {
        return Err(Error::validation(format!(
            "allocated mask bits ({}) must not be smaller than {}",
            mask_bits, MIN_ALLOCATED_MASK_BITS
        )));
    }
    if mask_bits > MAX_ALLOCATED_MASK_BITS {
        return Err(Error::validation(format!(
            "allocated mask bits ({}) must not be larger than {}",
            mask_bits, MAX_ALLOCATED_MASK_BITS
        )));
    }
    if mask_bits < pool.prefix() {
        return Err(Error::validation(format!(
            "allocated mask bits ({}) must not be smaller than the pool prefix /{}",
            mask_bits,
            pool.prefix()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: OperatorConfig,
    }

    fn parse(args: &[&str]) -> OperatorConfig {
        let mut argv = vec!["cirrus"];
        argv.extend_from_slice(args);
        TestCli::parse_from(argv).config
    }

    #[test]
    fn defaults_need_only_a_subscription() {
        let config = parse(&["--subscription-id", "sub-1"]);
        assert_eq!(config.allocated_mask_bits, 16);
        assert_eq!(config.ipam_network_range.to_string(), "10.0.0.0/8");
        assert!(config.validate().is_ok());
        assert_eq!(config.pass_interval(), Duration::from_secs(60));
        assert!(config.ipam_reserved_ranges.is_empty());
    }

    #[test]
    fn reserved_ranges_are_comma_separated() {
        let config = parse(&[
            "--subscription-id",
            "sub-1",
            "--ipam-reserved-ranges",
            "10.0.0.0/16,10.255.0.0/16",
        ]);
        assert_eq!(config.ipam_reserved_ranges.len(), 2);
        assert_eq!(config.ipam_reserved_ranges[1].to_string(), "10.255.0.0/16");
    }

    #[test]
    fn missing_subscription_rejected() {
        let mut config = parse(&["--subscription-id", "sub-1"]);
        config.subscription_id = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn mask_bits_bounds() {
        let pool: Ipv4Network = "10.0.0.0/16".parse().unwrap();
        assert!(validate_mask_bits(15, &pool).is_err());
        assert!(validate_mask_bits(16, &pool).is_ok());
        assert!(validate_mask_bits(24, &pool).is_ok());
        assert!(validate_mask_bits(29, &pool).is_err());

        let narrow: Ipv4Network = "10.0.0.0/20".parse().unwrap();
        assert!(validate_mask_bits(16, &narrow).is_err());
    }
}
