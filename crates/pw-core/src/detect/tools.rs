//! Tool, shell and OS version probing.
//!
//! Every probe is bounded by a timeout and isolated: a missing or hanging
//! tool produces a recorded absence, never an error for the caller.

use super::platform::{OsVersion, ToolInfo};
use crate::collect::tool_runner::CommandRunner;
use pw_common::OsFamily;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

/// Tool candidates probed on Unix-family hosts.
pub const UNIX_TOOLS: &[&str] = &[
    "ps",
    "kill",
    "killall",
    "pkill",
    "pgrep",
    "lsof",
    "netstat",
    "ss",
    "systemctl",
];

/// Tool candidates probed on Windows.
pub const WINDOWS_TOOLS: &[&str] = &[
    "taskkill",
    "wmic",
    "tasklist",
    "powershell",
    "sc",
    "netstat",
];

/// Shell candidates per family.
pub fn shell_candidates(family: OsFamily) -> &'static [&'static str] {
    match family {
        OsFamily::Unix => &["sh", "bash", "zsh", "dash", "fish"],
        OsFamily::Windows => &["cmd", "powershell", "pwsh"],
    }
}

pub fn tool_candidates(family: OsFamily) -> &'static [&'static str] {
    match family {
        OsFamily::Unix => UNIX_TOOLS,
        OsFamily::Windows => WINDOWS_TOOLS,
    }
}

/// Arguments that make a tool print its version, if it has such a mode.
fn version_args(name: &str) -> Option<&'static [&'static str]> {
    match name {
        "ps" | "netstat" | "systemctl" => Some(&["--version"]),
        "pkill" | "pgrep" | "killall" | "ss" => Some(&["-V"]),
        "lsof" => Some(&["-v"]),
        "powershell" => Some(&[
            "-NoProfile",
            "-Command",
            "$PSVersionTable.PSVersion.ToString()",
        ]),
        _ => None,
    }
}

/// Locate a tool and read its version.
pub async fn probe_tool(
    runner: &dyn CommandRunner,
    family: OsFamily,
    name: &str,
    timeout: Duration,
) -> ToolInfo {
    trace!(tool = name, "probing tool");

    let locator = match family {
        OsFamily::Unix => "which",
        OsFamily::Windows => "where",
    };

    let path = match runner.run_tool(locator, &[name], Some(timeout)).await {
        Ok(output) if output.success() => {
            match output.stdout_str().lines().map(str::trim).find(|l| !l.is_empty()) {
                Some(path) => path.to_string(),
                None => return ToolInfo::unavailable(),
            }
        }
        Ok(_) => {
            trace!(tool = name, "not found");
            return ToolInfo::unavailable();
        }
        Err(e) if e.is_not_found() => {
            debug!(tool = name, locator, "locator missing, trying direct invocation");
            return probe_without_locator(runner, name, timeout).await;
        }
        Err(e) => {
            debug!(tool = name, error = %e, "tool probe failed");
            return ToolInfo::probe_failed(e.to_string());
        }
    };

    let version = read_version(runner, name, timeout).await;
    trace!(tool = name, version = ?version, "tool found");
    ToolInfo::found(path, version)
}

/// Minimal images may lack `which`; any exit status from the tool itself
/// proves it is on PATH.
async fn probe_without_locator(
    runner: &dyn CommandRunner,
    name: &str,
    timeout: Duration,
) -> ToolInfo {
    let args = version_args(name).unwrap_or(&["--help"]);
    match runner.run_tool(name, args, Some(timeout)).await {
        Ok(output) if output.exit_code.is_some() => {
            let text = format!("{}\n{}", output.stdout_str(), output.stderr_str());
            ToolInfo::found(name.to_string(), parse_version(&text))
        }
        Ok(_) => ToolInfo::probe_failed(format!("{name} did not exit cleanly")),
        Err(e) if e.is_not_found() => ToolInfo::unavailable(),
        Err(e) => ToolInfo::probe_failed(e.to_string()),
    }
}

async fn read_version(runner: &dyn CommandRunner, name: &str, timeout: Duration) -> Option<String> {
    let args = version_args(name)?;
    let output = runner.run_tool(name, args, Some(timeout)).await.ok()?;
    // Several tools (lsof, pgrep on some BSDs) print the version to stderr
    let text = format!("{}\n{}", output.stdout_str(), output.stderr_str());
    parse_version(&text)
}

/// Probe every candidate tool for the family.
pub async fn probe_tools(
    runner: &dyn CommandRunner,
    family: OsFamily,
    timeout: Duration,
) -> BTreeMap<String, ToolInfo> {
    let probes = tool_candidates(family).iter().map(|name| async move {
        (name.to_string(), probe_tool(runner, family, name, timeout).await)
    });
    futures::future::join_all(probes).await.into_iter().collect()
}

/// Shells that respond to a trivial invocation.
pub async fn probe_shells(
    runner: &dyn CommandRunner,
    family: OsFamily,
    timeout: Duration,
) -> Vec<String> {
    let probes = shell_candidates(family).iter().map(|shell| async move {
        let args: &[&str] = match *shell {
            "cmd" => &["/C", "exit 0"],
            "powershell" | "pwsh" => &["-NoProfile", "-Command", "exit 0"],
            _ => &["-c", "exit 0"],
        };
        let ok = matches!(
            runner.run_tool(shell, args, Some(timeout)).await,
            Ok(output) if output.success()
        );
        ok.then(|| shell.to_string())
    });
    futures::future::join_all(probes)
        .await
        .into_iter()
        .flatten()
        .collect()
}

type ProbeChain = &'static [(&'static str, &'static [&'static str])];

const LINUX_VERSION_CHAIN: ProbeChain = &[("lsb_release", &["-ds"]), ("uname", &["-sr"])];
const MACOS_VERSION_CHAIN: ProbeChain = &[("sw_vers", &["-productVersion"]), ("uname", &["-r"])];
const WINDOWS_VERSION_CHAIN: ProbeChain = &[
    ("cmd", &["/C", "ver"]),
    ("wmic", &["os", "get", "Version", "/value"]),
    (
        "powershell",
        &[
            "-NoProfile",
            "-Command",
            "[Environment]::OSVersion.VersionString",
        ],
    ),
];
const GENERIC_VERSION_CHAIN: ProbeChain = &[("uname", &["-sr"])];

/// Determine the OS version through the platform's probe chain.
pub async fn detect_os_version(
    runner: &dyn CommandRunner,
    platform: &str,
    timeout: Duration,
) -> OsVersion {
    let chain = match platform {
        "linux" | "android" => LINUX_VERSION_CHAIN,
        "macos" => MACOS_VERSION_CHAIN,
        "windows" => WINDOWS_VERSION_CHAIN,
        _ => GENERIC_VERSION_CHAIN,
    };

    for (index, (cmd, args)) in chain.iter().enumerate() {
        if let Ok(output) = runner.run_tool(cmd, args, Some(timeout)).await {
            if output.success() {
                if let Some(version) = clean_version_output(cmd, &output.stdout_str()) {
                    return OsVersion {
                        version,
                        source: cmd.to_string(),
                    };
                }
            }
        }

        // /etc/os-release sits between the primary command and uname on Linux
        if index == 0 && matches!(platform, "linux" | "android") {
            if let Some(pretty) = read_os_release() {
                return OsVersion {
                    version: pretty,
                    source: "os-release".to_string(),
                };
            }
        }
    }

    OsVersion {
        version: runtime_release().unwrap_or_else(|| "unknown".to_string()),
        source: "runtime".to_string(),
    }
}

fn clean_version_output(cmd: &str, stdout: &str) -> Option<String> {
    let text = stdout.trim();
    if text.is_empty() {
        return None;
    }
    let cleaned = match cmd {
        "wmic" => text
            .lines()
            .find_map(|l| l.trim().strip_prefix("Version="))
            .map(str::trim)?
            .to_string(),
        "cmd" => text
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())?
            .to_string(),
        _ => text.trim_matches('"').to_string(),
    };
    (!cleaned.is_empty()).then_some(cleaned)
}

fn read_os_release() -> Option<String> {
    let content = std::fs::read_to_string("/etc/os-release").ok()?;
    parse_os_release(&content)
}

/// Extract `PRETTY_NAME` from os-release content.
pub fn parse_os_release(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|l| l.strip_prefix("PRETTY_NAME="))
        .map(|v| v.trim().trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}

/// Kernel release as reported by the runtime.
#[cfg(unix)]
pub fn runtime_release() -> Option<String> {
    let mut uname = std::mem::MaybeUninit::<libc::utsname>::uninit();
    let result = unsafe { libc::uname(uname.as_mut_ptr()) };
    if result != 0 {
        return None;
    }
    let uname = unsafe { uname.assume_init() };
    let sysname = unsafe { std::ffi::CStr::from_ptr(uname.sysname.as_ptr()) };
    let release = unsafe { std::ffi::CStr::from_ptr(uname.release.as_ptr()) };
    Some(format!(
        "{} {}",
        sysname.to_string_lossy(),
        release.to_string_lossy()
    ))
}

#[cfg(not(unix))]
pub fn runtime_release() -> Option<String> {
    sysinfo::System::long_os_version()
}

/// Parse version from tool output.
///
/// Returns the first whitespace-separated word that looks like `X.Y[...]`,
/// with a leading `v` and trailing punctuation removed.
pub fn parse_version(output: &str) -> Option<String> {
    for word in output.split_whitespace() {
        let cleaned = word
            .trim_start_matches(|c: char| c == 'v' || c == '(')
            .trim_end_matches([',', ')', ';']);
        if !cleaned
            .chars()
            .next()
            .map(|c| c.is_ascii_digit())
            .unwrap_or(false)
            || !cleaned.contains('.')
        {
            continue;
        }
        let parts: Vec<&str> = cleaned.split('.').collect();
        if parts.len() >= 2
            && parts[0].chars().all(|c| c.is_ascii_digit())
            && parts[1].chars().next().is_some_and(|c| c.is_ascii_digit())
        {
            return Some(cleaned.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("ps from procps-ng 4.0.4"),
            Some("4.0.4".to_string())
        );
        assert_eq!(
            parse_version("systemd 255 (255.4-1ubuntu8)"),
            Some("255.4-1ubuntu8".to_string())
        );
        assert_eq!(parse_version("lsof version 4.95.0"), Some("4.95.0".into()));
        assert_eq!(parse_version("v7.4.1"), Some("7.4.1".into()));
        assert_eq!(parse_version("no version here"), None);
    }

    #[test]
    fn test_parse_os_release() {
        let content = "NAME=\"Ubuntu\"\nPRETTY_NAME=\"Ubuntu 24.04 LTS\"\nID=ubuntu\n";
        assert_eq!(parse_os_release(content), Some("Ubuntu 24.04 LTS".into()));
        assert_eq!(parse_os_release("ID=alpine\n"), None);
    }

    #[test]
    fn test_clean_version_output() {
        assert_eq!(
            clean_version_output("wmic", "\r\n\r\nVersion=10.0.19045\r\n\r\n"),
            Some("10.0.19045".into())
        );
        assert_eq!(
            clean_version_output("cmd", "\r\nMicrosoft Windows [Version 10.0.19045.3803]\r\n"),
            Some("Microsoft Windows [Version 10.0.19045.3803]".into())
        );
        assert_eq!(
            clean_version_output("lsb_release", "\"Debian GNU/Linux 12\"\n"),
            Some("Debian GNU/Linux 12".into())
        );
        assert_eq!(clean_version_output("uname", "  \n"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_runtime_release() {
        let release = runtime_release().expect("uname should work");
        assert!(!release.trim().is_empty());
    }
}
