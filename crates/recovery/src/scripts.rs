/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Operator recovery scripts
//!
//! Executable shell artifacts mirroring the playbook sequences, for the
//! cases where automatic recovery is disabled or has failed. Generation
//! is deterministic: the same configuration always produces byte-equal
//! scripts, so they can be kept under configuration management and
//! regenerated at will.

use crate::error::Result;
use common::ServicesConfig;
use std::path::{Path, PathBuf};
use tracing::info;

/// Inputs the scripts are rendered from.
#[derive(Debug, Clone)]
pub struct ScriptContext {
    pub backup_dir: PathBuf,
    pub services: ServicesConfig,
    /// The `ppdr` binary the scripts call back into.
    pub cli_path: PathBuf,
}

/// Render all operator scripts into `dest_dir`. Returns their paths.
pub fn generate_recovery_scripts(dest_dir: &Path, ctx: &ScriptContext) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dest_dir)?;
    let scripts = [
        ("recover_database.sh", render_recover_database(ctx)),
        ("recover_files.sh", render_recover_files(ctx)),
        ("recover_full.sh", render_recover_full(ctx)),
        ("verify_recovery.sh", render_verify_recovery(ctx)),
    ];

    let mut paths = Vec::new();
    for (name, body) in scripts {
        let path = dest_dir.join(name);
        std::fs::write(&path, body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        }
        paths.push(path);
    }
    info!(count = paths.len(), dir = %dest_dir.display(), "recovery scripts generated");
    Ok(paths)
}

fn header(purpose: &str) -> String {
    format!(
        "#!/bin/sh\n\
         # {purpose}\n\
         # Generated by passprint-dr; regenerate with 'ppdr gen-scripts'.\n\
         set -eu\n\n"
    )
}

fn render_recover_database(ctx: &ScriptContext) -> String {
    let mut s = header("Restore the newest database archive over the live database.");
    s.push_str(&format!(
        "BACKUP_DIR=\"{}\"\n\n\
         latest=$(ls -t \"$BACKUP_DIR\"/passprint_full_*.gz 2>/dev/null | head -n 1)\n\
         if [ -z \"$latest\" ]; then\n\
         \techo \"no database archive found in $BACKUP_DIR\" >&2\n\
         \texit 1\n\
         fi\n\
         echo \"restoring $latest\"\n\
         {} restore \"$latest\"\n",
        ctx.backup_dir.display(),
        ctx.cli_path.display()
    ));
    s
}

fn render_recover_files(ctx: &ScriptContext) -> String {
    let mut s = header("Restore the newest application fileset bundle.");
    s.push_str(&format!(
        "BACKUP_DIR=\"{}\"\n\n\
         latest=$(ls -t \"$BACKUP_DIR\"/passprint_files_*.tar.gz 2>/dev/null | head -n 1)\n\
         if [ -z \"$latest\" ]; then\n\
         \techo \"no fileset archive found in $BACKUP_DIR\" >&2\n\
         \texit 1\n\
         fi\n\
         echo \"restoring $latest\"\n\
         {} restore \"$latest\"\n",
        ctx.backup_dir.display(),
        ctx.cli_path.display()
    ));
    s
}

fn render_recover_full(ctx: &ScriptContext) -> String {
    let mut s = header("Full manual recovery: services, database, files, workers.");
    for unit in &ctx.services.essential_services {
        s.push_str(&format!("systemctl restart {unit}\n"));
    }
    s.push('\n');
    s.push_str("./recover_database.sh\n./recover_files.sh\n\n");
    s.push_str(&format!(
        "systemctl restart {}\nsystemctl restart {}\n",
        ctx.services.app_service, ctx.services.worker_service
    ));
    s
}

fn render_verify_recovery(ctx: &ScriptContext) -> String {
    let mut s = header("Post-recovery health checks.");
    for unit in &ctx.services.essential_services {
        s.push_str(&format!("systemctl is-active {unit}\n"));
    }
    s.push_str(&format!(
        "systemctl is-active {}\n\n\
         BACKUP_DIR=\"{}\"\n\
         latest=$(ls -t \"$BACKUP_DIR\"/passprint_*.gz 2>/dev/null | head -n 1)\n\
         if [ -n \"$latest\" ]; then\n\
         \t{} verify \"$latest\"\n\
         fi\n",
        ctx.services.app_service,
        ctx.backup_dir.display(),
        ctx.cli_path.display()
    ));
    s
}
