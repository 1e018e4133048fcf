//! Scripts staged into every guest before the payload runs.

use pkg_constants::vm::GUEST_SCRIPT_DIR;

/// Downloads one storage archive and unpacks it: `fetch-storage.sh <url> <dest>`.
pub const FETCH_STORAGE_SCRIPT: &str = r#"#!/bin/sh
set -eu
url="$1"
dest="$2"
mkdir -p "$dest"
curl -fsSL --retry 3 --retry-delay 1 "$url" | tar -xz -C "$dest"
"#;

/// Starts the agent in the working directory, resuming a session if one was
/// restored.
pub const RUN_AGENT_SCRIPT: &str = r#"#!/bin/sh
set -eu
cd "${FLEETVM_WORKING_DIR:-$HOME}"
agent="${FLEETVM_AGENT:-agent}"
if [ -n "${FLEETVM_SESSION_ID:-}" ]; then
    exec "$agent" --prompt-file "$FLEETVM_PROMPT_FILE" --resume "$FLEETVM_SESSION_ID"
fi
exec "$agent" --prompt-file "$FLEETVM_PROMPT_FILE"
"#;

pub const FETCH_STORAGE_NAME: &str = "fetch-storage.sh";
pub const RUN_AGENT_NAME: &str = "run-agent.sh";

/// `(guest path, content)` of every staged script.
pub fn staged_scripts() -> Vec<(String, &'static str)> {
    vec![
        (script_path(FETCH_STORAGE_NAME), FETCH_STORAGE_SCRIPT),
        (script_path(RUN_AGENT_NAME), RUN_AGENT_SCRIPT),
    ]
}

pub fn script_path(name: &str) -> String {
    format!("{}/{}", GUEST_SCRIPT_DIR, name)
}

/// Single-quote `s` for `/bin/sh`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
