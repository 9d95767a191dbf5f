//! The batched probe command and the parsers for each of its sections.
//!
//! The probe prints `@@NAME@@` marker lines between sections. Parsing is
//! per-section: a section that is missing, empty or garbled yields `None`
//! for that metric only.

use std::collections::HashMap;

use serde::Serialize;

/// Build the composite shell command. `top` is how many processes to list.
pub fn probe_command(top: usize) -> String {
    format!(
        "export LC_ALL=C; \
         echo '@@CPU@@'; head -n1 /proc/stat 2>/dev/null; sleep 0.2; head -n1 /proc/stat 2>/dev/null; \
         echo '@@LOAD@@'; cat /proc/loadavg 2>/dev/null; \
         echo '@@MEM@@'; cat /proc/meminfo 2>/dev/null; \
         echo '@@DISK@@'; df -Pk / 2>/dev/null; \
         echo '@@NET@@'; cat /proc/net/dev 2>/dev/null; \
         echo '@@HOST@@'; \
         echo \"hostname=$(hostname 2>/dev/null)\"; \
         echo \"kernel=$(uname -sr 2>/dev/null)\"; \
         echo \"arch=$(uname -m 2>/dev/null)\"; \
         echo \"uptime=$(cut -d' ' -f1 /proc/uptime 2>/dev/null)\"; \
         echo \"cores=$(nproc 2>/dev/null)\"; \
         echo \"model=$(grep -m1 -E '^(model name|Hardware)' /proc/cpuinfo 2>/dev/null | cut -d: -f2)\"; \
         echo '@@PROC@@'; ps aux --sort=-%cpu 2>/dev/null | head -n {}; \
         echo '@@END@@'",
        top + 1
    )
}

/// Split probe output into `name → body` by marker lines.
pub fn split_sections(output: &str) -> HashMap<&str, String> {
    let mut sections: HashMap<&str, String> = HashMap::new();
    let mut current: Option<&str> = None;
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(name) = trimmed
            .strip_prefix("@@")
            .and_then(|rest| rest.strip_suffix("@@"))
        {
            current = Some(name);
            sections.entry(name).or_default();
            continue;
        }
        if let Some(name) = current {
            let body = sections.entry(name).or_default();
            body.push_str(line);
            body.push('\n');
        }
    }
    sections
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub total: u64,
    pub idle: u64,
}

/// Parse an aggregate `cpu  user nice system idle iowait ...` line.
pub fn parse_cpu_line(line: &str) -> Option<CpuTimes> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.map(|f| f.parse().ok()).collect::<Option<_>>()?;
    if values.len() < 4 {
        return None;
    }
    let idle = values[3].checked_add(values.get(4).copied().unwrap_or(0))?;
    let total = values.iter().try_fold(0u64, |acc, v| acc.checked_add(*v))?;
    Some(CpuTimes { total, idle })
}

/// CPU busy percentage between the two `/proc/stat` samples in the section.
pub fn parse_cpu_usage(section: &str) -> Option<f64> {
    let samples: Vec<CpuTimes> = section.lines().filter_map(parse_cpu_line).collect();
    let [first, second] = samples.as_slice() else {
        return None;
    };
    let total = second.total.saturating_sub(first.total);
    let idle = second.idle.saturating_sub(first.idle);
    if total == 0 {
        return Some(0.0);
    }
    #[allow(clippy::cast_precision_loss)]
    let usage = (total - idle.min(total)) as f64 / total as f64 * 100.0;
    Some(round1(usage))
}

/// Parse the 1/5/15-minute load averages from `/proc/loadavg`.
pub fn parse_loadavg(section: &str) -> Option<[f64; 3]> {
    let values: Vec<f64> = section
        .split_whitespace()
        .take(3)
        .filter_map(|s| s.parse::<f64>().ok())
        .collect();
    match values.as_slice() {
        [one, five, fifteen] => Some([*one, *five, *fifteen]),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInfo {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub percentage: f64,
}

/// Parse `/proc/meminfo`. `MemAvailable` is preferred; kernels older than
/// 3.14 only have `MemFree`.
pub fn parse_meminfo(section: &str) -> Option<MemoryInfo> {
    let mut total = None;
    let mut available = None;
    let mut free = None;
    for line in section.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kb_value(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kb_value(rest);
        } else if let Some(rest) = line.strip_prefix("MemFree:") {
            free = parse_kb_value(rest);
        }
    }
    let total = total.filter(|t| *t > 0)?;
    let available = available.or(free)?.min(total);
    let used = total - available;
    #[allow(clippy::cast_precision_loss)]
    let percentage = round1(used as f64 / total as f64 * 100.0);
    Some(MemoryInfo {
        total,
        used,
        available,
        percentage,
    })
}

/// `"  16303204 kB"` → bytes.
fn parse_kb_value(s: &str) -> Option<u64> {
    s.split_whitespace()
        .next()
        .and_then(|v| v.parse::<u64>().ok())
        .and_then(|kb| kb.checked_mul(1024))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskInfo {
    pub filesystem: String,
    pub size: u64,
    pub used: u64,
    pub available: u64,
    pub percentage: f64,
    pub mountpoint: String,
}

/// Parse POSIX `df -Pk` output (header plus one row).
pub fn parse_df(section: &str) -> Option<DiskInfo> {
    let row = section
        .lines()
        .filter(|l| !l.starts_with("Filesystem") && !l.trim().is_empty())
        .last()?;
    let fields: Vec<&str> = row.split_whitespace().collect();
    if fields.len() < 6 {
        return None;
    }
    let kb = |s: &str| s.parse::<u64>().ok().and_then(|v| v.checked_mul(1024));
    Some(DiskInfo {
        filesystem: fields[0].to_string(),
        size: kb(fields[1])?,
        used: kb(fields[2])?,
        available: kb(fields[3])?,
        percentage: fields[4].trim_end_matches('%').parse().ok()?,
        mountpoint: fields[5..].join(" "),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Sum receive/transmit byte counters from `/proc/net/dev`, loopback excluded.
pub fn parse_net_dev(section: &str) -> Option<NetCounters> {
    let mut seen = false;
    let mut rx_bytes = 0u64;
    let mut tx_bytes = 0u64;
    for line in section.lines() {
        let Some((iface, counters)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            seen = true;
            continue;
        }
        let fields: Vec<&str> = counters.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        let (Ok(rx), Ok(tx)) = (fields[0].parse::<u64>(), fields[8].parse::<u64>()) else {
            continue;
        };
        rx_bytes = rx_bytes.saturating_add(rx);
        tx_bytes = tx_bytes.saturating_add(tx);
        seen = true;
    }
    seen.then_some(NetCounters { rx_bytes, tx_bytes })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostFacts {
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_model: Option<String>,
}

/// Parse the `key=value` lines of the host section. Only the hostname is
/// required.
pub fn parse_host(section: &str) -> Option<HostFacts> {
    let values: HashMap<&str, &str> = section
        .lines()
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .filter(|(_, v)| !v.is_empty())
        .collect();
    let hostname = (*values.get("hostname")?).to_string();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let uptime_secs = values
        .get("uptime")
        .and_then(|s| s.parse::<f64>().ok())
        .map(|secs| secs.max(0.0) as u64);
    Some(HostFacts {
        hostname,
        kernel: values.get("kernel").map(|s| (*s).to_string()),
        arch: values.get("arch").map(|s| (*s).to_string()),
        uptime_secs,
        cores: values.get("cores").and_then(|s| s.parse().ok()),
        cpu_model: values.get("model").map(|s| (*s).to_string()),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub user: String,
    pub pid: u32,
    pub cpu: f64,
    pub mem: f64,
    pub command: String,
}

/// Parse `ps aux` output. The header line must be present; without it the
/// section is considered garbled.
pub fn parse_processes(section: &str, limit: usize) -> Option<Vec<ProcessInfo>> {
    let mut lines = section.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next()?;
    if !header.trim_start().starts_with("USER") {
        return None;
    }
    Some(
        lines
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 11 {
                    return None;
                }
                Some(ProcessInfo {
                    user: fields[0].to_string(),
                    pid: fields[1].parse().ok()?,
                    cpu: fields[2].parse().ok()?,
                    mem: fields[3].parse().ok()?,
                    command: fields[10..].join(" "),
                })
            })
            .take(limit)
            .collect(),
    )
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_OUTPUT: &str = "\
@@CPU@@
cpu  1000 0 500 8000 500 0 0 0 0 0
cpu  1060 0 530 8100 510 0 0 0 0 0
@@LOAD@@
0.52 0.58 0.59 1/389 12345
@@MEM@@
MemTotal:        2000000 kB
MemFree:          200000 kB
MemAvailable:     500000 kB
@@DISK@@
Filesystem     1024-blocks     Used Available Capacity Mounted on
/dev/vda1         41152736 12345678  26700000      32% /
@@NET@@
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  999999    100    0    0    0     0          0         0   999999    100    0    0    0     0       0          0
  eth0:    1000     10    0    0    0     0          0         0     4000     20    0    0    0     0       0          0
@@HOST@@
hostname=vps-1
kernel=Linux 5.15.0-91-generic
arch=x86_64
uptime=93784.12
cores=2
model= Intel Xeon Processor (Skylake)
@@PROC@@
USER         PID %CPU %MEM    VSZ   RSS TTY      STAT START   TIME COMMAND
root        1234 12.5  3.1 123456 65432 ?        Ssl  10:00   1:23 /usr/bin/dockerd -H fd://
www-data    2345  2.0  1.0  54321 12345 ?        S    10:01   0:10 nginx: worker process
@@END@@
";

    #[test]
    fn test_split_sections() {
        let sections = split_sections(PROBE_OUTPUT);
        assert!(sections["LOAD"].starts_with("0.52"));
        assert!(sections.contains_key("END"));
        assert_eq!(sections["CPU"].lines().count(), 2);
    }

    #[test]
    fn test_parse_cpu_usage() {
        let sections = split_sections(PROBE_OUTPUT);
        // delta total = 200, delta idle+iowait = 110 → 45%
        assert_eq!(parse_cpu_usage(&sections["CPU"]), Some(45.0));
        assert_eq!(parse_cpu_usage("cpu 1 2 3 4\n"), None);
    }

    #[test]
    fn test_parse_meminfo_prefers_available() {
        let sections = split_sections(PROBE_OUTPUT);
        let mem = parse_meminfo(&sections["MEM"]).unwrap();
        assert_eq!(mem.total, 2_000_000 * 1024);
        assert_eq!(mem.available, 500_000 * 1024);
        assert!((mem.percentage - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_meminfo_falls_back_to_free() {
        let mem = parse_meminfo("MemTotal: 1000 kB\nMemFree: 250 kB\n").unwrap();
        assert_eq!(mem.used, 750 * 1024);
        assert!(parse_meminfo("garbage\n").is_none());
    }

    #[test]
    fn test_parse_df() {
        let sections = split_sections(PROBE_OUTPUT);
        let disk = parse_df(&sections["DISK"]).unwrap();
        assert_eq!(disk.filesystem, "/dev/vda1");
        assert_eq!(disk.mountpoint, "/");
        assert!((disk.percentage - 32.0).abs() < f64::EPSILON);
        assert!(parse_df("Filesystem 1024-blocks Used\n").is_none());
    }

    #[test]
    fn test_overflowing_counters_degrade_to_none() {
        let huge = "cpu 18446744073709551615 1 1 1\n";
        assert_eq!(parse_cpu_line(huge), None);
        assert_eq!(parse_cpu_usage(&huge.repeat(2)), None);
        assert_eq!(
            parse_cpu_line("cpu 1 1 1 18446744073709551615 1"),
            None
        );

        let mem = "MemTotal: 18446744073709551 kB\nMemAvailable: 1 kB\n";
        assert!(parse_meminfo(mem).is_none());

        let df = "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
                  /dev/vda1 18446744073709551 1 1 1% /\n";
        assert!(parse_df(df).is_none());
    }

    #[test]
    fn test_parse_net_dev_skips_loopback() {
        let sections = split_sections(PROBE_OUTPUT);
        let net = parse_net_dev(&sections["NET"]).unwrap();
        assert_eq!(net.rx_bytes, 1000);
        assert_eq!(net.tx_bytes, 4000);
    }

    #[test]
    fn test_parse_host() {
        let sections = split_sections(PROBE_OUTPUT);
        let host = parse_host(&sections["HOST"]).unwrap();
        assert_eq!(host.hostname, "vps-1");
        assert_eq!(host.uptime_secs, Some(93_784));
        assert_eq!(host.cores, Some(2));
        assert_eq!(host.cpu_model.as_deref(), Some("Intel Xeon Processor (Skylake)"));
        assert!(parse_host("kernel=Linux\n").is_none());
    }

    #[test]
    fn test_parse_processes() {
        let sections = split_sections(PROBE_OUTPUT);
        let procs = parse_processes(&sections["PROC"], 10).unwrap();
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].pid, 1234);
        assert_eq!(procs[0].command, "/usr/bin/dockerd -H fd://");
        assert_eq!(parse_processes(&sections["PROC"], 1).unwrap().len(), 1);
        assert!(parse_processes("ps: unknown option\n", 10).is_none());
    }

    #[test]
    fn test_probe_command_lists_every_section() {
        let cmd = probe_command(10);
        for marker in ["CPU", "LOAD", "MEM", "DISK", "NET", "HOST", "PROC", "END"] {
            assert!(cmd.contains(&format!("@@{marker}@@")), "missing {marker}");
        }
        assert!(cmd.contains("head -n 11"));
    }
}
