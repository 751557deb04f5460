//! Capability synthesis and confidence scoring.
//!
//! Both functions are pure: a flag is derived only from tools that were
//! actually located (plus the empirical process-group probe), never assumed.

use super::platform::{caps, ToolInfo};
use pw_common::OsFamily;
use std::collections::BTreeMap;

/// Tools whose absence makes a provider unusable.
pub fn required_tools(family: OsFamily) -> &'static [&'static str] {
    match family {
        OsFamily::Unix => &["ps", "kill"],
        OsFamily::Windows => &["tasklist", "taskkill"],
    }
}

/// Derive the capability map from tool availability.
pub fn derive_capabilities(
    family: OsFamily,
    tools: &BTreeMap<String, ToolInfo>,
    process_group_probe: bool,
) -> BTreeMap<String, bool> {
    let has = |name: &str| tools.get(name).is_some_and(|t| t.available);
    let mut flags = BTreeMap::new();
    let mut set = |name: &str, value: bool| {
        flags.insert(name.to_string(), value);
    };

    match family {
        OsFamily::Unix => {
            let ps = has("ps");
            let kill = has("kill");
            set(caps::LIST_PROCESSES, ps);
            set(caps::GET_PROCESS_INFO, ps);
            set(caps::KILL_BY_PID, kill);
            set(caps::SEND_SIGNAL, kill);
            set(caps::KILL_BY_NAME, has("pkill") || (ps && kill));
            set(caps::KILL_PROCESS_TREE, ps && kill);
            set(caps::PROCESS_GROUP_KILL, process_group_probe);
            set(caps::ADVANCED_PROCESS_CONTROL, has("pkill") && has("pgrep"));
            set(caps::PATTERN_MATCHING, has("pgrep"));
            set(caps::KILL_SERVICE, has("systemctl"));
            set(
                caps::NETWORK_INSPECTION,
                has("ss") || has("netstat") || has("lsof"),
            );
            set(caps::OPEN_FILE_INSPECTION, has("lsof"));
            set(caps::KILL_ALL, has("killall"));
        }
        OsFamily::Windows => {
            let listing = has("tasklist") || has("wmic") || has("powershell");
            let taskkill = has("taskkill");
            let scripting = has("wmic") || has("powershell");
            set(caps::LIST_PROCESSES, listing);
            set(caps::GET_PROCESS_INFO, listing);
            set(caps::KILL_BY_PID, taskkill);
            set(caps::KILL_BY_NAME, taskkill);
            set(caps::KILL_PROCESS_TREE, taskkill);
            set(caps::PROCESS_GROUP_KILL, process_group_probe);
            set(caps::ADVANCED_PROCESS_CONTROL, scripting);
            set(caps::PATTERN_MATCHING, scripting);
            set(caps::KILL_SERVICE, has("sc"));
            set(caps::NETWORK_INSPECTION, has("netstat"));
            set(caps::SEND_SIGNAL, false);
        }
    }

    flags
}

/// Weighted confidence in [0, 1].
///
/// `w_tools * required_present / required_total + w_caps * true_flags / total_flags`.
pub fn compute_confidence(
    required_present: usize,
    required_total: usize,
    true_flags: usize,
    total_flags: usize,
    tool_weight: f64,
    capability_weight: f64,
) -> f64 {
    let tool_fraction = if required_total == 0 {
        1.0
    } else {
        required_present.min(required_total) as f64 / required_total as f64
    };
    let cap_fraction = if total_flags == 0 {
        0.0
    } else {
        true_flags.min(total_flags) as f64 / total_flags as f64
    };
    (tool_weight * tool_fraction + capability_weight * cap_fraction).clamp(0.0, 1.0)
}

/// Confidence for a detected tool set and capability map.
pub fn confidence_for(
    family: OsFamily,
    tools: &BTreeMap<String, ToolInfo>,
    capabilities: &BTreeMap<String, bool>,
    tool_weight: f64,
    capability_weight: f64,
) -> f64 {
    let required = required_tools(family);
    let present = required
        .iter()
        .filter(|name| tools.get(**name).is_some_and(|t| t.available))
        .count();
    let true_flags = capabilities.values().filter(|v| **v).count();
    compute_confidence(
        present,
        required.len(),
        true_flags,
        capabilities.len(),
        tool_weight,
        capability_weight,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tools(names: &[&str]) -> BTreeMap<String, ToolInfo> {
        names
            .iter()
            .map(|n| (n.to_string(), ToolInfo::found(format!("/usr/bin/{n}"), None)))
            .collect()
    }

    #[test]
    fn test_unix_without_pkill_pgrep() {
        let flags = derive_capabilities(OsFamily::Unix, &tools(&["ps", "kill"]), false);
        assert!(flags[caps::KILL_PROCESS_TREE]);
        assert!(flags[caps::KILL_BY_NAME]);
        assert!(!flags[caps::ADVANCED_PROCESS_CONTROL]);
        assert!(!flags[caps::PATTERN_MATCHING]);
        assert!(!flags[caps::PROCESS_GROUP_KILL]);
    }

    #[test]
    fn test_unix_flags_never_inferred_from_missing_tools() {
        let flags = derive_capabilities(OsFamily::Unix, &BTreeMap::new(), false);
        assert!(flags.values().all(|v| !v));
    }

    #[test]
    fn test_windows_send_signal_always_false() {
        let flags = derive_capabilities(
            OsFamily::Windows,
            &tools(&["tasklist", "taskkill", "wmic", "powershell", "sc", "netstat"]),
            true,
        );
        assert!(!flags[caps::SEND_SIGNAL]);
        assert!(flags[caps::KILL_SERVICE]);
        assert!(flags[caps::PROCESS_GROUP_KILL]);
    }

    #[test]
    fn test_unavailable_entries_do_not_count() {
        let mut set = tools(&["ps"]);
        set.insert("kill".into(), ToolInfo::unavailable());
        let flags = derive_capabilities(OsFamily::Unix, &set, false);
        assert!(!flags[caps::KILL_BY_PID]);
        assert!(flags[caps::LIST_PROCESSES]);
    }

    #[test]
    fn test_confidence_bounds() {
        assert_eq!(compute_confidence(0, 2, 0, 10, 0.6, 0.4), 0.0);
        assert!((compute_confidence(2, 2, 10, 10, 0.6, 0.4) - 1.0).abs() < 1e-9);
        assert!((compute_confidence(1, 2, 5, 10, 0.6, 0.4) - 0.5).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_confidence_monotone_in_required_tools(
            total in 1usize..6,
            present in 0usize..6,
            flags_true in 0usize..14,
            tool_weight in 0.0f64..=1.0,
        ) {
            let present = present.min(total);
            let flags_total = 13usize;
            let cap_weight = 1.0 - tool_weight;
            let confidence = |present| {
                compute_confidence(present, total, flags_true, flags_total, tool_weight, cap_weight)
            };
            let before = confidence(present);
            let after = confidence((present + 1).min(total));
            prop_assert!(after >= before);
            prop_assert!((0.0..=1.0).contains(&before));
        }
    }
}
