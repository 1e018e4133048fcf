use anyhow::{Result, bail};

/// Validate a single lowercase-hyphen segment.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.len() > 63 {
        bail!("name '{}' exceeds 63 characters (got {})", name, name.len());
    }
    if name.starts_with('-') || name.ends_with('-') {
        bail!("name '{}' must not start or end with a hyphen", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        );
    }
    Ok(())
}

/// Validate a runner group (`scope/name`), the job queue partition key.
pub fn validate_group(group: &str) -> Result<()> {
    let Some((scope, name)) = group.split_once('/') else {
        bail!("group '{}' must have the form scope/name", group);
    };
    if name.contains('/') {
        bail!("group '{}' must contain exactly one '/'", group);
    }
    validate_name(scope).map_err(|e| anyhow::anyhow!("group '{}' scope: {}", group, e))?;
    validate_name(name).map_err(|e| anyhow::anyhow!("group '{}' name: {}", group, e))?;
    Ok(())
}

/// Validate a control-plane URL (http or https, non-empty host).
pub fn validate_url(url: &str) -> Result<()> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    match rest {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(()),
        _ => bail!("url '{}' must start with http:// or https:// and name a host", url),
    }
}
