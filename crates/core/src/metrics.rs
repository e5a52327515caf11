//! Metrics Collector: periodic per-VM resource sampling from procfs, kept in a bounded
//! in-memory history independent of the VM record-store lock.
//!
//! Network counters are best-effort: a `query-netdev` QMP call is attempted first to locate the
//! guest's netdev, but modern QEMU QMP does not expose per-netdev byte counters, so this almost
//! always falls through to the host-side `/proc/net/dev` aggregate, which for user-mode
//! networking reflects the host's interface traffic rather than the guest's.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use vps_common::config::{METRICS_CADENCE, RAM_SIZE_MIB, RETENTION_WINDOW};
use vps_common::qmp::QmpClient;
use vps_common::ResourceSample;

const QMP_NETDEV_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Default)]
struct PrevCounters {
    utime: u64,
    stime: u64,
    uptime_secs: f64,
    disk_read_bytes: u64,
    disk_write_bytes: u64,
    disk_read_ops: u64,
    disk_write_ops: u64,
    net_rx_bytes: u64,
    net_tx_bytes: u64,
    net_rx_pkts: u64,
    net_tx_pkts: u64,
    sampled_at: Option<tokio::time::Instant>,
}

struct VmHistory {
    pid: u32,
    monitor_socket_path: PathBuf,
    samples: VecDeque<ResourceSample>,
    prev: PrevCounters,
}

/// Collects and retains resource samples for every tracked VM, polling procfs on its own ticker
/// independent of the VM record-store lock.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<RwLock<HashMap<String, VmHistory>>>,
    cpu_count: f64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            cpu_count: num_cpus(),
        }
    }

    pub fn track(&self, vm_id: &str, pid: u32, monitor_socket_path: PathBuf) {
        self.inner.write().insert(
            vm_id.to_string(),
            VmHistory {
                pid,
                monitor_socket_path,
                samples: VecDeque::with_capacity(RETENTION_WINDOW),
                prev: PrevCounters::default(),
            },
        );
    }

    pub fn untrack(&self, vm_id: &str) {
        self.inner.write().remove(vm_id);
    }

    /// Returns the retained samples for `vm_id`, oldest first.
    pub fn history(&self, vm_id: &str) -> Vec<ResourceSample> {
        self.inner
            .read()
            .get(vm_id)
            .map(|h| h.samples.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Runs the sampling ticker until the process stops. A sampling failure for one VM never
    /// affects the others; it is logged and that VM is simply skipped for the tick.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(METRICS_CADENCE);
        loop {
            ticker.tick().await;
            let ids: Vec<String> = self.inner.read().keys().cloned().collect();
            for vm_id in ids {
                if let Err(e) = self.sample_one(&vm_id).await {
                    warn!(vm_id, error = %e, "metrics sample failed");
                }
            }
        }
    }

    async fn sample_one(&self, vm_id: &str) -> anyhow::Result<()> {
        let (pid, monitor_socket_path) = match self.inner.read().get(vm_id) {
            Some(h) => (h.pid, h.monitor_socket_path.clone()),
            None => return Ok(()),
        };

        let stat = read_proc_stat(pid).await?;
        let status = read_proc_status(pid).await?;
        let io = read_proc_io(pid).await.unwrap_or_default();
        let net = match try_qmp_netdev(&monitor_socket_path).await {
            Some(net) => net,
            None => read_net_dev().await.unwrap_or_default(),
        };

        let now = tokio::time::Instant::now();
        let uptime_secs = read_uptime_secs().await?;

        let mut guard = self.inner.write();
        let Some(history) = guard.get_mut(vm_id) else {
            return Ok(());
        };

        let prev = history.prev;
        let cpu_percent = match prev.sampled_at {
            Some(_) => {
                let delta_ticks = (stat.utime + stat.stime)
                    .saturating_sub(prev.utime + prev.stime) as f64;
                let delta_secs = uptime_secs - prev.uptime_secs;
                if delta_secs > 0.0 {
                    let ticks_per_sec = clock_ticks_per_sec();
                    ((delta_ticks / ticks_per_sec) / delta_secs / self.cpu_count) * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        let elapsed = prev
            .sampled_at
            .map(|t| now.duration_since(t).as_secs_f64())
            .filter(|s| *s > 0.0);

        let disk_read_rate = elapsed
            .map(|s| (io.read_bytes.saturating_sub(prev.disk_read_bytes)) as f64 / s)
            .unwrap_or(0.0);
        let disk_write_rate = elapsed
            .map(|s| (io.write_bytes.saturating_sub(prev.disk_write_bytes)) as f64 / s)
            .unwrap_or(0.0);
        let net_rx_rate = elapsed
            .map(|s| (net.rx_bytes.saturating_sub(prev.net_rx_bytes)) as f64 / s)
            .unwrap_or(0.0);
        let net_tx_rate = elapsed
            .map(|s| (net.tx_bytes.saturating_sub(prev.net_tx_bytes)) as f64 / s)
            .unwrap_or(0.0);

        let sample = ResourceSample {
            t: unix_time_secs(),
            cpu_percent,
            mem_used: status.vm_rss_kb * 1024,
            mem_total: RAM_SIZE_MIB * 1024 * 1024,
            mem_cache: status.vm_size_kb.saturating_sub(status.vm_rss_kb) * 1024,
            disk_read_bytes: io.read_bytes,
            disk_write_bytes: io.write_bytes,
            disk_read_ops: io.read_ops,
            disk_write_ops: io.write_ops,
            disk_read_rate,
            disk_write_rate,
            net_rx_bytes: net.rx_bytes,
            net_tx_bytes: net.tx_bytes,
            net_rx_pkts: net.rx_pkts,
            net_tx_pkts: net.tx_pkts,
            net_rx_rate,
            net_tx_rate,
        };

        if history.samples.len() >= RETENTION_WINDOW {
            history.samples.pop_front();
        }
        history.samples.push_back(sample);
        history.prev = PrevCounters {
            utime: stat.utime,
            stime: stat.stime,
            uptime_secs,
            disk_read_bytes: io.read_bytes,
            disk_write_bytes: io.write_bytes,
            disk_read_ops: io.read_ops,
            disk_write_ops: io.write_ops,
            net_rx_bytes: net.rx_bytes,
            net_tx_bytes: net.tx_bytes,
            net_rx_pkts: net.rx_pkts,
            net_tx_pkts: net.tx_pkts,
            sampled_at: Some(now),
        };

        debug!(vm_id, cpu_percent, "sampled");
        Ok(())
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

struct ProcStat {
    utime: u64,
    stime: u64,
}

async fn read_proc_stat(pid: u32) -> anyhow::Result<ProcStat> {
    let content = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await?;
    // Fields after the trailing ')' of comm are space-separated and positionally stable.
    let after_comm = content
        .rfind(')')
        .map(|idx| &content[idx + 2..])
        .unwrap_or(&content);
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // utime is field 14 (1-indexed overall), stime is field 15; after_comm starts at field 3.
    let utime = fields.get(11).and_then(|s| s.parse().ok()).unwrap_or(0);
    let stime = fields.get(12).and_then(|s| s.parse().ok()).unwrap_or(0);
    Ok(ProcStat { utime, stime })
}

struct ProcStatus {
    vm_rss_kb: u64,
    vm_size_kb: u64,
}

async fn read_proc_status(pid: u32) -> anyhow::Result<ProcStatus> {
    let content = tokio::fs::read_to_string(format!("/proc/{pid}/status")).await?;
    let mut vm_rss_kb = 0;
    let mut vm_size_kb = 0;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            vm_rss_kb = parse_kb_field(rest);
        } else if let Some(rest) = line.strip_prefix("VmSize:") {
            vm_size_kb = parse_kb_field(rest);
        }
    }
    Ok(ProcStatus { vm_rss_kb, vm_size_kb })
}

fn parse_kb_field(s: &str) -> u64 {
    s.split_whitespace().next().and_then(|v| v.parse().ok()).unwrap_or(0)
}

#[derive(Default)]
struct ProcIo {
    read_bytes: u64,
    write_bytes: u64,
    read_ops: u64,
    write_ops: u64,
}

async fn read_proc_io(pid: u32) -> anyhow::Result<ProcIo> {
    let content = tokio::fs::read_to_string(format!("/proc/{pid}/io")).await?;
    let mut io = ProcIo::default();
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("read_bytes:") {
            io.read_bytes = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("write_bytes:") {
            io.write_bytes = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("syscr:") {
            io.read_ops = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("syscw:") {
            io.write_ops = rest.trim().parse().unwrap_or(0);
        }
    }
    Ok(io)
}

#[derive(Default)]
struct NetDev {
    rx_bytes: u64,
    tx_bytes: u64,
    rx_pkts: u64,
    tx_pkts: u64,
}

/// Best-effort host-side network counters aggregated across non-loopback interfaces. For
/// user-mode QEMU networking these counters reflect host socket activity, not guest traffic;
/// callers should treat them as an approximation rather than a guest-accurate figure.
async fn read_net_dev() -> anyhow::Result<NetDev> {
    let content = tokio::fs::read_to_string("/proc/net/dev").await?;
    let mut total = NetDev::default();
    for line in content.lines().skip(2) {
        let Some((iface, rest)) = line.split_once(':') else { continue };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 16 {
            continue;
        }
        total.rx_bytes += fields[0].parse().unwrap_or(0);
        total.rx_pkts += fields[1].parse().unwrap_or(0);
        total.tx_bytes += fields[8].parse().unwrap_or(0);
        total.tx_pkts += fields[9].parse().unwrap_or(0);
    }
    Ok(total)
}

/// Attempts a best-effort `query-netdev` QMP call to locate the guest's netdev before falling
/// back to `/proc/net/dev`. QEMU's `query-netdev` does not return byte/packet counters, so a
/// successful call still yields no usable `NetDev` and this always returns `None` — the attempt
/// exists to keep a connectivity probe in the sampling path for when a future QEMU exposes
/// richer netdev introspection, per the collector's documented network-stats limitation.
async fn try_qmp_netdev(monitor_socket_path: &std::path::Path) -> Option<NetDev> {
    match tokio::time::timeout(QMP_NETDEV_TIMEOUT, QmpClient::connect(monitor_socket_path)).await {
        Ok(Ok(mut client)) => {
            match client.execute::<(), serde_json::Value>("query-netdev", None).await {
                Ok(_) => debug!("qmp query-netdev reachable, no byte counters available"),
                Err(e) => debug!(error = %e, "qmp query-netdev failed"),
            }
            None
        }
        Ok(Err(e)) => {
            debug!(error = %e, "qmp connect failed for network introspection");
            None
        }
        Err(_) => {
            debug!("qmp connect timed out for network introspection");
            None
        }
    }
}

async fn read_uptime_secs() -> anyhow::Result<f64> {
    let content = tokio::fs::read_to_string("/proc/uptime").await?;
    let first = content
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty /proc/uptime"))?;
    Ok(first.parse()?)
}

fn clock_ticks_per_sec() -> f64 {
    100.0
}

fn num_cpus() -> f64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as f64)
        .unwrap_or(1.0)
}

fn unix_time_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_empty_for_unknown_vm() {
        let collector = MetricsCollector::new();
        assert!(collector.history("missing").is_empty());
    }

    #[test]
    fn untrack_removes_history() {
        let collector = MetricsCollector::new();
        collector.track("vm-1", 123, PathBuf::from("/tmp/vm-1.qmp"));
        collector.untrack("vm-1");
        assert!(collector.history("vm-1").is_empty());
    }

    #[test]
    fn net_dev_parses_and_skips_loopback() {
        let sample = "Inter-|   Receive                                                |  Transmit\n face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n    lo:  100    1    0    0    0     0          0         0   100    1    0    0    0     0       0          0\n  eth0: 2000   20    0    0    0     0          0         0  1000   10    0    0    0     0       0          0\n";
        let mut total = NetDev::default();
        for line in sample.lines().skip(2) {
            let Some((iface, rest)) = line.split_once(':') else { continue };
            if iface.trim() == "lo" {
                continue;
            }
            let fields: Vec<&str> = rest.split_whitespace().collect();
            total.rx_bytes += fields[0].parse::<u64>().unwrap_or(0);
            total.tx_bytes += fields[8].parse::<u64>().unwrap_or(0);
        }
        assert_eq!(total.rx_bytes, 2000);
        assert_eq!(total.tx_bytes, 1000);
    }
}
