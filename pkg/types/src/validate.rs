use anyhow::{Result, bail};
use pkg_constants::quota::MAX_QUOTA_NAME_LEN;

use crate::quota::QuotaGroupSpec;

/// Validate a quota group name.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_quota_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("quota name must not be empty");
    }
    if name.len() > MAX_QUOTA_NAME_LEN {
        bail!(
            "quota name '{}' exceeds {} characters (got {})",
            name,
            MAX_QUOTA_NAME_LEN,
            name.len()
        );
    }
    if name.starts_with('-') || name.ends_with('-') {
        bail!("quota name '{}' must not start or end with a hyphen", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "quota name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        );
    }
    Ok(())
}

/// Structural checks on a single spec. Tree-level consistency (missing
/// parents, cycles) is checked when the topology is built.
pub fn validate_quota_spec(spec: &QuotaGroupSpec) -> Result<()> {
    validate_quota_name(&spec.name)?;
    if !spec.parent_name.is_empty() {
        validate_quota_name(&spec.parent_name)?;
    }
    if spec.parent_name == spec.name {
        bail!("quota '{}' cannot be its own parent", spec.name);
    }
    for (label, vector) in [
        ("max", &spec.max),
        ("min", &spec.min),
        ("sharedWeight", &spec.shared_weight),
    ] {
        let negative = vector.is_negative();
        if !negative.is_empty() {
            bail!(
                "quota '{}' has negative {} for {}",
                spec.name,
                label,
                negative.join(", ")
            );
        }
    }
    Ok(())
}
