//! Error types for weftnet.
//!
//! Each subsystem gets its own enum so callers can match on the cases that
//! change control flow (non-retriable lease conflicts, lock failures, partial
//! enforcement). Application glue wraps these in `anyhow`.

use thiserror::Error;

/// Overlay network and CIDR pool construction errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("network must be provided")]
    EmptyNetworkList,

    #[error("invalid CIDR address: {0}")]
    InvalidCidr(String),

    #[error("mask must be between 0 and 32, got {0}")]
    InvalidMask(u8),
}

/// Lease allocation, storage and transport errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("no lease available")]
    NoLeaseAvailable,

    /// The caller must stop retrying and release/reacquire instead.
    #[error("non-retriable: {0}")]
    NonRetriable(String),

    #[error("invalid lease: {0}")]
    Invalid(String),

    #[error("lease store: {0}")]
    Store(String),

    #[error("{0}")]
    Network(#[from] NetworkError),

    #[error("http: {0}")]
    Transport(String),

    #[error("failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl LeaseError {
    pub fn is_non_retriable(&self) -> bool {
        matches!(self, LeaseError::NonRetriable(_))
    }
}

/// Lease store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Uniqueness violation on underlay IP or overlay subnet.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Backend(String),
}

impl From<StoreError> for LeaseError {
    fn from(err: StoreError) -> Self {
        LeaseError::Store(err.to_string())
    }
}

/// VTEP configuration and device errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VtepError {
    #[error("empty vtep name")]
    EmptyName,

    #[error("vtep port must be greater than 0")]
    InvalidPort,

    #[error("parse underlay ip: {0}")]
    UnderlayIp(String),

    #[error("find device from name {name}: {reason}")]
    DeviceByName { name: String, reason: String },

    #[error("find device from ip {ip}: {reason}")]
    DeviceByIp { ip: String, reason: String },

    #[error("determine vtep overlay ip: {0}")]
    OverlayIp(String),

    #[error("parsing hardware address: {0}")]
    HardwareAddr(String),

    #[error("no overlay networks specified")]
    NoOverlayNetworks,

    #[error("creating multiple CIDR Network: {0}")]
    OverlayNetwork(NetworkError),

    #[error("overlay prefix {overlay} must be smaller than subnet prefix {subnet}")]
    PrefixTooLarge { overlay: u8, subnet: u8 },

    #[error("create link {name}: {reason}")]
    CreateLink { name: String, reason: String },

    #[error("up link: {0}")]
    UpLink(String),

    #[error("add address: {0}")]
    AddAddress(String),

    #[error("lease IP '{0}' is not in any of the overlay networks")]
    LeaseOutsideOverlay(String),

    #[error("find link: {0}")]
    LinkLookup(String),

    #[error("find link {name}: {reason}")]
    FindLink { name: String, reason: String },

    #[error("list addresses: {0}")]
    ListAddresses(String),

    #[error("no addresses")]
    NoAddresses,

    #[error("delete link {name}: {reason}")]
    DeleteLink { name: String, reason: String },
}

/// Convergence cycle errors. Each names the kernel operation that failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvergeError {
    #[error("link by index: {0}")]
    LinkLookup(String),

    #[error("list routes: {0}")]
    ListRoutes(String),

    #[error("list fdb: {0}")]
    ListFdb(String),

    #[error("list arp: {0}")]
    ListArp(String),

    #[error("parse lease: {0}")]
    ParseLease(String),

    #[error("invalid underlay ip: {0}")]
    InvalidUnderlayIp(String),

    #[error("invalid hardware addr: {0}")]
    InvalidHardwareAddr(String),

    #[error("add route: {0}")]
    AddRoute(String),

    #[error("set neigh: {0}")]
    SetNeigh(String),

    #[error("del route: {0}")]
    DelRoute(String),

    #[error("del neigh with ip/hwaddr {ip} {mac}: {reason}")]
    DelNeigh {
        ip: String,
        mac: String,
        reason: String,
    },
}

/// Locked iptables executor errors.
///
/// A `Lock` error means nothing ran. A `Call` error means the operation ran
/// (or was attempted) and carries the outcome of the unlock that followed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IptablesError {
    #[error("lock: {0}")]
    Lock(String),

    #[error("iptables call: {call} and unlock: {}", .unlock.as_deref().unwrap_or("ok"))]
    Call {
        call: String,
        unlock: Option<String>,
    },

    #[error("iptables command runner: {call} and unlock: {}", .unlock.as_deref().unwrap_or("ok"))]
    Runner {
        call: String,
        unlock: Option<String>,
    },

    #[error("unlock: {0}")]
    Unlock(String),
}

/// Rule enforcement errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnforceError {
    /// The new chain was installed but removing the previous ones failed.
    #[error("cleaning up: {reason}")]
    Cleanup { chain: String, reason: String },

    #[error("{0}")]
    Iptables(#[from] IptablesError),
}

/// Policy and ASG cycle errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("get-rules: {0}")]
    GetRules(String),

    #[error("enforce: {0}")]
    Enforce(String),

    #[error("get-asg-rules: {0}")]
    GetAsgRules(String),

    #[error("clean-up-asg-chains-matching: {0}")]
    CleanupMatching(String),

    #[error("clean-up-orphaned-asg-chains: {0}")]
    CleanupOrphaned(String),

    #[error("{}", .0.join("; "))]
    Multiple(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iptables_call_error_includes_unlock_outcome() {
        let err = IptablesError::Call {
            call: "boom".to_string(),
            unlock: Some("stuck".to_string()),
        };
        assert_eq!(err.to_string(), "iptables call: boom and unlock: stuck");

        let err = IptablesError::Call {
            call: "boom".to_string(),
            unlock: None,
        };
        assert_eq!(err.to_string(), "iptables call: boom and unlock: ok");
    }

    #[test]
    fn test_non_retriable_is_distinguishable() {
        let err = LeaseError::NonRetriable("renew-subnet-lease: lease mismatch".to_string());
        assert!(err.is_non_retriable());
        assert_eq!(
            err.to_string(),
            "non-retriable: renew-subnet-lease: lease mismatch"
        );
        assert!(!LeaseError::NoLeaseAvailable.is_non_retriable());
    }

    #[test]
    fn test_del_neigh_message() {
        let err = ConvergeError::DelNeigh {
            ip: "10.255.19.0".to_string(),
            mac: "ee:ee:aa:aa:aa:ff".to_string(),
            reason: "mango".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "del neigh with ip/hwaddr 10.255.19.0 ee:ee:aa:aa:aa:ff: mango"
        );
    }

    #[test]
    fn test_multiple_policy_errors_joined() {
        let err = PolicyError::Multiple(vec!["enforce-asg: a".into(), "enforce-asg: b".into()]);
        assert_eq!(err.to_string(), "enforce-asg: a; enforce-asg: b");
    }
}
