//! QoS rate-limit types
//!
//! A QoS policy limits exactly one dimension of a volume's throughput. The
//! declared form ([`QoSPolicyLimitSpec`](crate::crd::QoSPolicyLimitSpec))
//! allows any combination of members, so it is converted per policy into
//! the [`QoSLimit`] sum type before anything is sent to the backend.

use crate::crd::{QoSPolicyLimitSpec, QoSPolicySpec};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Smallest non-zero IOPS limit the backend accepts
pub const MIN_IOPS_LIMIT: u32 = 256;

/// Read/write pair of limit values; 0 means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadWrite {
    pub read: u32,
    pub write: u32,
}

impl ReadWrite {
    pub fn new(read: u32, write: u32) -> Self {
        Self { read, write }
    }
}

/// The single dimension a QoS policy limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QoSLimit {
    /// Bandwidth in full MB/s
    Bandwidth(ReadWrite),
    /// Absolute IOPS; a power of two of at least 256
    Iops(ReadWrite),
    /// IOPS per GB of volume size
    IopsPerGb(ReadWrite),
}

impl QoSLimit {
    /// Short name of the limited dimension
    pub fn kind(&self) -> &'static str {
        match self {
            QoSLimit::Bandwidth(_) => "bandwidth",
            QoSLimit::Iops(_) => "iops",
            QoSLimit::IopsPerGb(_) => "iopsPerGb",
        }
    }

    pub fn values(&self) -> ReadWrite {
        match self {
            QoSLimit::Bandwidth(rw) | QoSLimit::Iops(rw) | QoSLimit::IopsPerGb(rw) => *rw,
        }
    }

    /// Check the per-dimension value rules
    pub fn check(&self) -> std::result::Result<(), String> {
        if let QoSLimit::Iops(rw) = self {
            for (direction, value) in [("read", rw.read), ("write", rw.write)] {
                if !is_valid_iops(value) {
                    return Err(format!(
                        "{} iops limit {} must be 0 or a power of two of at least {}",
                        direction, value, MIN_IOPS_LIMIT
                    ));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for QoSLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rw = self.values();
        write!(f, "{}(read={}, write={})", self.kind(), rw.read, rw.write)
    }
}

fn is_valid_iops(value: u32) -> bool {
    value == 0 || (value >= MIN_IOPS_LIMIT && value.is_power_of_two())
}

impl TryFrom<&QoSPolicyLimitSpec> for QoSLimit {
    type Error = String;

    fn try_from(spec: &QoSPolicyLimitSpec) -> std::result::Result<Self, Self::Error> {
        let limit = match (&spec.bandwidth, &spec.iops, &spec.iops_per_gb) {
            (Some(bw), None, None) => QoSLimit::Bandwidth(ReadWrite::new(bw.read, bw.write)),
            (None, Some(iops), None) => QoSLimit::Iops(ReadWrite::new(iops.read, iops.write)),
            (None, None, Some(per_gb)) => {
                QoSLimit::IopsPerGb(ReadWrite::new(per_gb.read, per_gb.write))
            }
            (None, None, None) => return Err("missing limit".to_string()),
            _ => {
                return Err(
                    "more than one of bandwidth, iops and iopsPerGb is set".to_string(),
                )
            }
        };
        limit.check()?;
        Ok(limit)
    }
}

/// A desired QoS policy with a checked limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QoSPolicyDef {
    pub name: String,
    pub description: String,
    pub limit: QoSLimit,
}

impl QoSPolicyDef {
    pub fn new(name: impl Into<String>, description: impl Into<String>, limit: QoSLimit) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            limit,
        }
    }
}

impl TryFrom<&QoSPolicySpec> for QoSPolicyDef {
    type Error = Error;

    fn try_from(spec: &QoSPolicySpec) -> Result<Self> {
        let limit = QoSLimit::try_from(&spec.limit).map_err(|reason| Error::PolicyLimit {
            policy: spec.name.clone(),
            reason,
        })?;
        Ok(Self {
            name: spec.name.clone(),
            description: spec.description.clone(),
            limit,
        })
    }
}
