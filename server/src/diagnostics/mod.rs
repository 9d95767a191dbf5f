//! Remote host diagnostics over the session's connection.
//!
//! Every sample runs exactly one remote command (see [`parse::probe_command`])
//! that prints all metrics in marker-delimited sections. Opening one exec
//! channel per metric would burn through the connection's channel limit at
//! every poll; one batched command costs a single channel.
//!
//! Per session the sampler keeps the previous network counters (to derive
//! throughput) and a bounded [`SampleHistory`] for the client's charts.

pub mod parse;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::MuxError;
use crate::sessions::{
    ChannelKind, CloseReason, ConnectionHandle, SessionListener, SessionRegistry,
};
use crate::util::{format_uptime, now_ms, short_id};
use crate::ws::ClientTx;
use parse::{DiskInfo, HostFacts, MemoryInfo, NetCounters, ProcessInfo};

#[derive(Debug, Clone)]
pub struct DiagnosticsSettings {
    pub history_capacity: usize,
    pub top_processes: usize,
    pub command_timeout: Duration,
    pub default_interval: Duration,
    pub min_interval: Duration,
}

/// A metric that is either present or degraded.
///
/// Serializes as the value itself, or the string `"unavailable"`.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading<T> {
    Available(T),
    Unavailable,
}

impl<T> Reading<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Available(v) => Some(v),
            Self::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}

impl<T> From<Option<T>> for Reading<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Unavailable, Self::Available)
    }
}

impl<T: Serialize> Serialize for Reading<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Available(value) => value.serialize(serializer),
            Self::Unavailable => serializer.serialize_str("unavailable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuInfo {
    pub usage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_average: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Bytes per second since the previous sample of this session.
    pub rx_rate: f64,
    pub tx_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    #[serde(flatten)]
    pub facts: HostFacts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
}

/// One chart point.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    pub timestamp: u64,
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub rx_rate: f64,
    pub tx_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub timestamp: u64,
    pub cpu: Reading<CpuInfo>,
    pub memory: Reading<MemoryInfo>,
    pub disk: Reading<DiskInfo>,
    pub network: Reading<NetworkInfo>,
    pub system: Reading<SystemInfo>,
    pub processes: Reading<Vec<ProcessInfo>>,
    pub history: Vec<HistoryPoint>,
}

/// Fixed-capacity ring of recent points; the oldest is evicted first.
#[derive(Debug, Clone)]
pub struct SampleHistory {
    points: VecDeque<HistoryPoint>,
    capacity: usize,
}

impl SampleHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, point: HistoryPoint) {
        if self.points.len() >= self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn to_vec(&self) -> Vec<HistoryPoint> {
        self.points.iter().cloned().collect()
    }
}

/// Throughput between two cumulative counter readings.
///
/// Counter resets (reboot, interface re-created) and zero elapsed time read
/// as 0 rather than a negative or infinite rate.
pub fn compute_rate(previous: u64, current: u64, elapsed_secs: f64) -> f64 {
    if current < previous || elapsed_secs <= 0.0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let delta = (current - previous) as f64;
    delta / elapsed_secs
}

struct NetBaseline {
    counters: NetCounters,
    at: Instant,
}

struct SessionSamples {
    history: SampleHistory,
    baseline: Option<NetBaseline>,
}

/// Parsed probe output before rates and history are attached.
struct Report {
    cpu: Option<CpuInfo>,
    memory: Option<MemoryInfo>,
    disk: Option<DiskInfo>,
    net: Option<NetCounters>,
    system: Option<SystemInfo>,
    processes: Option<Vec<ProcessInfo>>,
}

fn parse_report(output: &str, top: usize) -> Report {
    let sections = parse::split_sections(output);
    let section = |name: &str| sections.get(name).map(String::as_str);

    let host = section("HOST").and_then(parse::parse_host);
    let cpu = section("CPU")
        .and_then(parse::parse_cpu_usage)
        .map(|usage| CpuInfo {
            usage,
            load_average: section("LOAD").and_then(parse::parse_loadavg),
            cores: host.as_ref().and_then(|h| h.cores),
            model: host.as_ref().and_then(|h| h.cpu_model.clone()),
        });
    let system = host.map(|facts| SystemInfo {
        uptime: facts.uptime_secs.map(format_uptime),
        facts,
    });

    Report {
        cpu,
        memory: section("MEM").and_then(parse::parse_meminfo),
        disk: section("DISK").and_then(parse::parse_df),
        net: section("NET").and_then(parse::parse_net_dev),
        system,
        processes: section("PROC").and_then(|s| parse::parse_processes(s, top)),
    }
}

#[derive(Clone)]
pub struct DiagnosticsSampler {
    registry: SessionRegistry,
    sessions: Arc<Mutex<HashMap<String, SessionSamples>>>,
    settings: Arc<DiagnosticsSettings>,
}

impl DiagnosticsSampler {
    pub fn new(registry: SessionRegistry, settings: DiagnosticsSettings) -> Self {
        Self {
            registry,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &DiagnosticsSettings {
        &self.settings
    }

    /// Run one probe and fold it into the session's history.
    ///
    /// A failed probe returns the error and leaves history untouched.
    pub async fn sample(&self, session_id: &str) -> Result<Snapshot, MuxError> {
        let handle = self.registry.lookup(session_id).await?;
        let permit = handle.acquire(ChannelKind::Exec).await?;
        let command = parse::probe_command(self.settings.top_processes);

        let result = timeout(self.settings.command_timeout, handle.transport().exec(&command)).await;
        drop(permit);
        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(self.registry.io_failed(session_id, e).await),
            Err(_) => {
                return Err(MuxError::UpstreamIo(format!(
                    "diagnostics probe timed out after {}s",
                    self.settings.command_timeout.as_secs()
                )))
            }
        };
        self.registry.touch(session_id).await;

        let report = parse_report(&output.stdout, self.settings.top_processes);
        self.record(session_id, &handle, report).await
    }

    /// Fold a report into the session's history. The cancellation check runs
    /// under the map lock so a concurrent teardown cannot be undone here.
    async fn record(
        &self,
        session_id: &str,
        handle: &ConnectionHandle,
        report: Report,
    ) -> Result<Snapshot, MuxError> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        if handle.cancel_token().is_cancelled() {
            return Err(MuxError::SessionExpired);
        }
        let samples = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionSamples {
                history: SampleHistory::new(self.settings.history_capacity),
                baseline: None,
            });

        let network = report.net.map(|counters| {
            let (rx_rate, tx_rate) = match &samples.baseline {
                Some(prev) => {
                    let elapsed = now.duration_since(prev.at).as_secs_f64();
                    (
                        compute_rate(prev.counters.rx_bytes, counters.rx_bytes, elapsed),
                        compute_rate(prev.counters.tx_bytes, counters.tx_bytes, elapsed),
                    )
                }
                None => (0.0, 0.0),
            };
            samples.baseline = Some(NetBaseline { counters, at: now });
            NetworkInfo {
                rx_bytes: counters.rx_bytes,
                tx_bytes: counters.tx_bytes,
                rx_rate,
                tx_rate,
            }
        });

        let timestamp = now_ms();
        samples.history.push(HistoryPoint {
            timestamp,
            cpu: report.cpu.as_ref().map(|c| c.usage),
            memory: report.memory.as_ref().map(|m| m.percentage),
            rx_rate: network.as_ref().map_or(0.0, |n| n.rx_rate),
            tx_rate: network.as_ref().map_or(0.0, |n| n.tx_rate),
        });

        Ok(Snapshot {
            timestamp,
            cpu: report.cpu.into(),
            memory: report.memory.into(),
            disk: report.disk.into(),
            network: network.into(),
            system: report.system.into(),
            processes: report.processes.into(),
            history: samples.history.to_vec(),
        })
    }

    /// History without probing the remote host.
    pub async fn history(&self, session_id: &str) -> Result<Vec<HistoryPoint>, MuxError> {
        self.registry.lookup(session_id).await?;
        Ok(self
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|s| s.history.to_vec())
            .unwrap_or_default())
    }

    /// Clamp a client-requested polling interval to the configured floor.
    pub fn interval_for(&self, requested_ms: Option<u64>) -> Duration {
        requested_ms
            .map_or(self.settings.default_interval, Duration::from_millis)
            .max(self.settings.min_interval)
    }

    /// Push snapshots to `client` every `interval` until the session ends,
    /// the client goes away, or the task is aborted.
    ///
    /// A failed tick sends one `error` frame and polling carries on; only a
    /// lost session stops the loop.
    pub fn spawn_poller(
        &self,
        session_id: String,
        client: ClientTx,
        interval: Duration,
    ) -> JoinHandle<()> {
        let sampler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let frame = match sampler.sample(&session_id).await {
                    Ok(snapshot) => json!({
                        "kind": "diagnostics",
                        "action": "snapshot",
                        "snapshot": snapshot,
                    }),
                    Err(e) => {
                        warn!(session = short_id(&session_id), "Diagnostics tick failed: {e}");
                        let fatal = e.is_session_fatal();
                        let frame = e.to_frame("diagnostics");
                        if fatal {
                            client.send_json(frame).await;
                            break;
                        }
                        frame
                    }
                };
                if !client.send_json(frame).await {
                    break;
                }
            }
            debug!(session = short_id(&session_id), "Diagnostics poller stopped");
        })
    }
}

#[async_trait]
impl SessionListener for DiagnosticsSampler {
    async fn session_closed(&self, session_id: &str, _reason: CloseReason) {
        self.sessions.lock().await.remove(session_id);
    }
}
