//! Quota accounting and runtime allocation for hierarchical quota groups.
//!
//! [`GroupQuotaManager`] is the entry point: it receives quota specs and
//! workload deltas, keeps one [`QuotaInfo`] per group, assembles them into a
//! [`QuotaTopology`] and recomputes every group's runtime entitlement.

pub mod calculator;
pub mod error;
pub mod manager;
pub mod quota_info;
pub mod topology;

pub use error::QuotaError;
pub use manager::{GroupQuotaManager, RecalculationReport};
pub use quota_info::{QuotaCalculateInfo, QuotaInfo, QuotaInfoSnapshot};
pub use topology::{QuotaTopoNode, QuotaTopology};
