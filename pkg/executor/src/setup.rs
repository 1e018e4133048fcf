//! Guest-side steps of an execution, written against [`GuestChannel`] so they
//! run the same over vsock and in tests.

use anyhow::{Context, Result, bail};
use pkg_constants::runtime::STORAGE_DOWNLOAD_TIMEOUT_MS;
use pkg_constants::vm::GUEST_HOME;
use pkg_guest::GuestChannel;
use pkg_types::job::{ExecMode, ExecutionContext, ResumeSession, StorageArchive};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::scripts::{FETCH_STORAGE_NAME, RUN_AGENT_NAME, script_path, shell_quote, staged_scripts};
use crate::session::{session_dir, session_history_path};

/// Where the proxy CA is installed in the guest trust store.
pub const PROXY_CA_GUEST_PATH: &str = "/usr/local/share/ca-certificates/fleetvm-proxy.crt";

pub fn prompt_path() -> String {
    format!("{}/.agent/prompt.txt", GUEST_HOME)
}

pub fn agent_command() -> String {
    script_path(RUN_AGENT_NAME)
}

pub async fn stage_scripts(guest: &dyn GuestChannel) -> Result<()> {
    let scripts = staged_scripts();
    for (path, content) in &scripts {
        guest
            .write_file_with_sudo(path, content.as_bytes(), Some(0o755))
            .await
            .with_context(|| format!("upload {}", path))?;
    }
    let quoted: Vec<String> = scripts.iter().map(|(p, _)| shell_quote(p)).collect();
    guest
        .exec_or_throw(&format!("sudo chmod 0755 {}", quoted.join(" ")))
        .await
        .context("chmod execution scripts")?;
    Ok(())
}

/// Trust the host proxy's CA so intercepted TLS verifies inside the guest.
pub async fn install_proxy_ca(guest: &dyn GuestChannel, pem: &[u8]) -> Result<()> {
    guest
        .write_file_with_sudo(PROXY_CA_GUEST_PATH, pem, Some(0o644))
        .await
        .context("upload proxy CA")?;
    guest
        .exec_or_throw("sudo update-ca-certificates")
        .await
        .context("update-ca-certificates")?;
    Ok(())
}

/// Download every archive of the storage manifest. The first failure aborts.
pub async fn restore_storage(guest: &dyn GuestChannel, archives: &[StorageArchive]) -> Result<()> {
    let fetch = script_path(FETCH_STORAGE_NAME);
    for archive in archives {
        guest
            .mkdir(&archive.mount_path)
            .await
            .with_context(|| format!("mkdir {}", archive.mount_path))?;
        let command = format!(
            "{} {} {}",
            fetch,
            shell_quote(&archive.url),
            shell_quote(&archive.mount_path)
        );
        let res = guest
            .exec(&command, STORAGE_DOWNLOAD_TIMEOUT_MS, &HashMap::new())
            .await
            .with_context(|| format!("download storage {}", archive.name))?;
        if !res.success() {
            bail!(
                "storage {} failed (exit {}): {}",
                archive.name,
                res.exit_code,
                res.stderr.trim()
            );
        }
        info!(storage = %archive.name, "[executor] restored into {}", archive.mount_path);
    }
    Ok(())
}

/// Write the session history where the agent looks for it. Returns the path.
pub async fn restore_session(
    guest: &dyn GuestChannel,
    working_dir: &str,
    session: &ResumeSession,
) -> Result<String> {
    let path = session_history_path(working_dir, &session.session_id)?;
    guest
        .mkdir(&session_dir(working_dir))
        .await
        .context("create session directory")?;
    guest
        .write_file(&path, session.history.as_bytes())
        .await
        .with_context(|| format!("write session history {}", path))?;
    Ok(path)
}

pub async fn write_prompt(guest: &dyn GuestChannel, ctx: &ExecutionContext) -> Result<()> {
    guest
        .mkdir(&format!("{}/.agent", GUEST_HOME))
        .await
        .context("create agent directory")?;
    guest
        .mkdir(&ctx.working_dir)
        .await
        .with_context(|| format!("mkdir {}", ctx.working_dir))?;
    guest
        .write_file(&prompt_path(), ctx.prompt.as_bytes())
        .await
        .context("write prompt")?;
    Ok(())
}

/// Job env plus the variables the run script reads. Ours win on conflict.
pub fn payload_env(ctx: &ExecutionContext) -> HashMap<String, String> {
    let mut env = ctx.env.clone();
    env.insert("FLEETVM_RUN_ID".into(), ctx.run_id.clone());
    env.insert("FLEETVM_SANDBOX_TOKEN".into(), ctx.sandbox_token.clone());
    env.insert("FLEETVM_WORKING_DIR".into(), ctx.working_dir.clone());
    env.insert("FLEETVM_PROMPT_FILE".into(), prompt_path());
    match &ctx.resume_session {
        Some(session) => {
            env.insert("FLEETVM_SESSION_ID".into(), session.session_id.clone());
        }
        None => {
            env.remove("FLEETVM_SESSION_ID");
        }
    }
    if let Some(image) = &ctx.image {
        env.insert("FLEETVM_IMAGE".into(), image.clone());
    }
    env
}

/// Run the payload and return its exit code.
pub async fn run_payload(
    guest: &dyn GuestChannel,
    command: &str,
    env: &HashMap<String, String>,
    timeout_ms: u64,
    mode: ExecMode,
) -> Result<i32> {
    match mode {
        ExecMode::Exec => {
            let res = guest
                .exec(command, timeout_ms, env)
                .await
                .context("payload")?;
            debug!(
                "[executor] payload exited {} ({} bytes stdout)",
                res.exit_code,
                res.stdout.len()
            );
            Ok(res.exit_code)
        }
        ExecMode::Spawn => {
            let spawned = guest
                .spawn_and_watch(command, timeout_ms, env)
                .await
                .context("spawn payload")?;
            debug!("[executor] payload running as guest pid {}", spawned.pid);
            let exit = guest
                .wait_for_exit(spawned.pid, timeout_ms)
                .await
                .context("payload")?;
            Ok(exit.exit_code)
        }
    }
}
