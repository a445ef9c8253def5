//! CLI entrypoint wiring for the caplaunch binary.

use crate::exec::Launcher;
use crate::iab::{IabSet, Vector};
use crate::types::{CapMode, CapValue};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{Gid, Uid};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "caplaunch", author, version, about = "Run programs with reduced privilege", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the capability mode of the current process
    Mode,
    /// Lock the current process into a capability mode, then optionally run
    /// a command under it
    SetMode {
        /// One of: hybrid, pure1e, pure1e-init, nopriv
        posture: String,
        /// Command to run after the mode change
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Fork a reduced-privilege child and exec a program in it
    Launch {
        /// Target uid for the child
        #[arg(long)]
        uid: Option<u32>,
        /// Target gid for the child
        #[arg(long)]
        gid: Option<u32>,
        /// Supplementary groups for the child (requires --gid)
        #[arg(long, value_delimiter = ',')]
        groups: Vec<u32>,
        /// Capability mode to lock the child into
        #[arg(long)]
        mode: Option<String>,
        /// Chroot for the child, applied after all capability changes
        #[arg(long)]
        chroot: Option<String>,
        /// Capability indices to grant in the child's Inheritable set
        #[arg(long, value_delimiter = ',')]
        inh: Vec<u32>,
        /// Capability indices to raise in the child's Ambient set
        #[arg(long, value_delimiter = ',')]
        amb: Vec<u32>,
        /// Capability indices to drop from the child's bounding set
        #[arg(long, value_delimiter = ',')]
        drop_bound: Vec<u32>,
        /// Program and arguments to exec
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn cap_value(index: u32) -> Result<CapValue> {
    CapValue::new(index).with_context(|| format!("capability index {} out of range", index))
}

fn run_command(command: &[String]) -> Result<i32> {
    let status = std::process::Command::new(&command[0])
        .args(&command[1..])
        .status()
        .with_context(|| format!("failed to run {}", command[0]))?;
    Ok(status.code().unwrap_or(1))
}

fn launch(
    uid: Option<u32>,
    gid: Option<u32>,
    groups: &[u32],
    mode: Option<&str>,
    chroot: Option<&str>,
    inh: &[u32],
    amb: &[u32],
    drop_bound: &[u32],
    command: &[String],
) -> Result<i32> {
    let launcher = Launcher::new(&command[0], command)?;

    if let Some(uid) = uid {
        launcher.set_uid(Uid::from_raw(uid));
    }
    if let Some(gid) = gid {
        let groups: Vec<Gid> = groups.iter().map(|g| Gid::from_raw(*g)).collect();
        launcher.set_groups(Gid::from_raw(gid), &groups);
    } else if !groups.is_empty() {
        bail!("--groups requires --gid");
    }
    if let Some(mode) = mode {
        launcher.set_mode(mode.parse::<CapMode>()?);
    }
    if let Some(root) = chroot {
        launcher.set_chroot(root)?;
    }

    if !(inh.is_empty() && amb.is_empty() && drop_bound.is_empty()) {
        let iab = IabSet::new();
        for index in inh {
            iab.set_vector(Vector::Inheritable, cap_value(*index)?, true);
        }
        for index in amb {
            iab.set_vector(Vector::Ambient, cap_value(*index)?, true);
        }
        for index in drop_bound {
            iab.set_vector(Vector::Bound, cap_value(*index)?, true);
        }
        launcher.set_iab(Some(Arc::new(iab)));
    }

    let child = launcher.launch().context("launch failed")?;
    log::info!("launched pid {}", child);

    match waitpid(child, None).context("waitpid failed")? {
        WaitStatus::Exited(_, code) => Ok(code),
        WaitStatus::Signaled(_, signal, _) => Ok(128 + signal as i32),
        other => bail!("unexpected wait status: {:?}", other),
    }
}

pub fn run() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let code = match &cli.command {
        Commands::Mode => {
            println!("{}", crate::mode::get_mode());
            0
        }
        Commands::SetMode { posture, command } => {
            let mode = posture.parse::<CapMode>()?;
            crate::mode::set_mode(mode).context("mode change failed")?;
            if command.is_empty() {
                0
            } else {
                run_command(command)?
            }
        }
        Commands::Launch {
            uid,
            gid,
            groups,
            mode,
            chroot,
            inh,
            amb,
            drop_bound,
            command,
        } => launch(
            *uid,
            *gid,
            groups,
            mode.as_deref(),
            chroot.as_deref(),
            inh,
            amb,
            drop_bound,
            command,
        )?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
