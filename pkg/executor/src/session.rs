//! Where a resumed session's history goes inside the guest.

use anyhow::{Result, bail};
use pkg_constants::vm::{GUEST_HOME, GUEST_SESSION_DIR};

/// Directory name for a working directory: every character outside
/// `[A-Za-z0-9]` becomes `-`, so `/home/user/workspace` is
/// `-home-user-workspace`.
pub fn sanitize_working_dir(dir: &str) -> String {
    dir.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Session ids become file names; anything that could escape the session
/// directory is refused.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() || session_id == "." || session_id == ".." {
        bail!("invalid session id {:?}", session_id);
    }
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        bail!("invalid session id {:?}", session_id);
    }
    Ok(())
}

/// `<home>/.agent/sessions/<sanitized working dir>`
pub fn session_dir(working_dir: &str) -> String {
    format!(
        "{}/{}/{}",
        GUEST_HOME,
        GUEST_SESSION_DIR,
        sanitize_working_dir(working_dir)
    )
}

/// `<home>/.agent/sessions/<sanitized working dir>/<session_id>.jsonl`
pub fn session_history_path(working_dir: &str, session_id: &str) -> Result<String> {
    validate_session_id(session_id)?;
    Ok(format!("{}/{}.jsonl", session_dir(working_dir), session_id))
}
