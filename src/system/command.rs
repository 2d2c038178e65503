use std::{
    net::{IpAddr, Ipv4Addr},
    process::Stdio,
    time::Duration,
};

use log::{debug, trace};
use tokio::process::Command;

use crate::error::Result;

use super::{ArpingTool, PingTool};

const ARPING: &str = "arping";
const ARP_PING_EXE: &str = "arp-ping.exe";

/// Command line tools only take whole seconds; rounds up, never below one.
fn whole_seconds(timeout: Duration) -> String {
    timeout.as_millis().div_ceil(1000).max(1).to_string()
}

fn command(program: &str) -> Command {
    let mut command = Command::new(program);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    command
}

pub(super) fn ping(tool: PingTool, address: IpAddr, timeout: Duration) -> Command {
    let seconds = whole_seconds(timeout);
    let millis = timeout.as_millis().to_string();
    let mut ping = command("ping");
    match tool {
        PingTool::Unix => ping.args(["-w", seconds.as_str(), "-c", "1"]),
        PingTool::MacOs => ping.args(["-t", seconds.as_str(), "-c", "1"]),
        PingTool::Windows => ping.args(["-w", millis.as_str(), "-n", "1"]),
    };
    ping.arg(address.to_string());
    ping
}

pub(super) fn arping(
    tool: ArpingTool,
    interface: &str,
    address: Ipv4Addr,
    timeout: Duration,
) -> Command {
    let address = address.to_string();
    let address = address.as_str();
    let seconds = whole_seconds(timeout);
    let millis = timeout.as_millis().to_string();
    match tool {
        ArpingTool::Iputils => {
            let mut arping = command(ARPING);
            arping.args(["-w", seconds.as_str(), "-c", "1", "-I", interface, address]);
            arping
        }
        ArpingTool::ThomasHabets => {
            let mut arping = command(ARPING);
            arping.args(["-w", seconds.as_str(), "-C", "1", "-i", interface, address]);
            arping
        }
        ArpingTool::EliFulkerson => {
            let mut arping = command(ARP_PING_EXE);
            arping.args(["-w", millis.as_str(), "-x", address]);
            arping
        }
    }
}

/// Runs `command`; it succeeds on a zero exit status and, when given, the
/// `marker` appearing in its output.
pub(super) async fn succeeds(mut command: Command, marker: Option<&str>) -> Result<bool> {
    let output = command.output().await?;
    let found = marker.map_or(true, |marker| {
        String::from_utf8_lossy(&output.stdout).contains(marker)
    });
    trace!("{:?} exited with {}", command.as_std(), output.status);
    Ok(output.status.success() && found)
}

pub(super) fn arping_tool_from_help(help: &str) -> Option<ArpingTool> {
    if help.contains("Thomas Habets") {
        Some(ArpingTool::ThomasHabets)
    } else if help.contains("-w timeout") || help.contains("-w <timeout>") {
        Some(ArpingTool::Iputils)
    } else if help.contains("Usage: arp-ping.exe") {
        Some(ArpingTool::EliFulkerson)
    } else {
        None
    }
}

/// Finds out which arping flavour is installed, if any.
pub(super) async fn detect_arping() -> Option<ArpingTool> {
    for program in [ARPING, ARP_PING_EXE] {
        let output = match Command::new(program)
            .arg("--help")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                trace!("{} not usable: {}", program, err);
                continue;
            }
        };
        let mut help = String::from_utf8_lossy(&output.stdout).into_owned();
        help.push_str(&String::from_utf8_lossy(&output.stderr));
        if let Some(tool) = arping_tool_from_help(&help) {
            debug!("using {} as {:?}", program, tool);
            return Some(tool);
        }
    }
    None
}
