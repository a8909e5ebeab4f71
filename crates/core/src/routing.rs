//! Size-based endpoint routing.
//!
//! Uploads at or below the threshold travel through the size-limited edge
//! path; anything larger goes straight to the storage backend's direct
//! endpoint.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which upload path a client should use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointClass {
    /// Through the edge proxy network (payload-size limited).
    Edge,
    /// Straight to the storage backend (no payload limit).
    Direct,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Edge => "edge",
            Self::Direct => "direct",
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a routing decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDecision {
    pub target_endpoint_class: EndpointClass,
    pub threshold: u64,
    pub reason: String,
}

/// Pure size-based router.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Router {
    threshold: u64,
}

impl Router {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Choose the endpoint class for a declared size.
    ///
    /// A size exactly equal to the threshold stays on the edge path.
    pub fn route(&self, declared_size: i64) -> crate::Result<RouteDecision> {
        if declared_size <= 0 {
            return Err(crate::Error::InvalidSize(declared_size));
        }
        let size = declared_size as u64;
        let (class, reason) = if size <= self.threshold {
            (
                EndpointClass::Edge,
                format!("{size} bytes is within the {} byte edge limit", self.threshold),
            )
        } else {
            (
                EndpointClass::Direct,
                format!("{size} bytes exceeds the {} byte edge limit", self.threshold),
            )
        };
        Ok(RouteDecision {
            target_endpoint_class: class,
            threshold: self.threshold,
            reason,
        })
    }

    /// Whether a session of this size counts against the large-file admission limit.
    pub fn is_large(&self, declared_size: u64) -> bool {
        declared_size > self.threshold
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(crate::DEFAULT_ROUTE_THRESHOLD)
    }
}
