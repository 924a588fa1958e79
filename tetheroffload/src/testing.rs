// In-memory stand-ins for kernel maps, the daemon, sinks and interface hooks.
// Every fake is cheap to clone and clones share state, so a test keeps one
// copy as a probe after handing the other to the code under test.

use anyhow::{Result, anyhow, bail};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tetheroffload_common::{
    Tether4Key, Tether4Value, Tether6Value, TetherDownstream6Key, TetherLimitKey,
    TetherLimitValue, TetherStatsKey, TetherStatsValue, TetherUpstream6Key,
};

use crate::backends::attach::{ProgramAttacher, StreamDirection};
use crate::backends::conntrack::ConntrackMonitor;
use crate::backends::offload::daemon::{OffloadDaemon, RuleParcel};
use crate::backends::offload::map::{OffloadMap, OffloadMaps};
use crate::backends::offload::{BackendMode, OffloadBackend};
use crate::rule::ForwardingRule;
use crate::stats::{ForwardedStats, InterfaceStats, StatsRecord, StatsSink};

/// Wire bytes of a map key, used for ordering and the op log
pub trait KeyBytes {
    fn key_bytes(&self) -> Vec<u8>;
}

impl KeyBytes for Tether4Key {
    fn key_bytes(&self) -> Vec<u8> {
        let mut bytes = self.iif.to_ne_bytes().to_vec();
        bytes.extend_from_slice(&self.dst_mac);
        bytes.extend_from_slice(&[self.l4_proto, self.pad]);
        bytes.extend_from_slice(&self.src4);
        bytes.extend_from_slice(&self.dst4);
        bytes.extend_from_slice(&self.src_port.to_ne_bytes());
        bytes.extend_from_slice(&self.dst_port.to_ne_bytes());
        bytes
    }
}

impl KeyBytes for TetherDownstream6Key {
    fn key_bytes(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}

impl KeyBytes for TetherUpstream6Key {
    fn key_bytes(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}

impl KeyBytes for TetherStatsKey {
    fn key_bytes(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}

impl KeyBytes for TetherLimitKey {
    fn key_bytes(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}

/// One logged map access
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapOp {
    pub map: String,
    pub op: String,
    pub key: Vec<u8>,
}

impl MapOp {
    pub fn new(map: &str, op: &str, key: &[u8]) -> Self {
        Self {
            map: map.to_string(),
            op: op.to_string(),
            key: key.to_vec(),
        }
    }
}

type OpLog = Arc<Mutex<Vec<MapOp>>>;

/// Hash map with kernel map semantics. Lookups and writes are logged,
/// iteration is not.
pub struct MemoryMap<K, V> {
    name: String,
    entries: Arc<Mutex<BTreeMap<Vec<u8>, (K, V)>>>,
    log: OpLog,
    fail_deletes: Arc<AtomicBool>,
}

impl<K, V> Clone for MemoryMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            entries: Arc::clone(&self.entries),
            log: Arc::clone(&self.log),
            fail_deletes: Arc::clone(&self.fail_deletes),
        }
    }
}

impl<K: KeyBytes + Copy, V: Copy> MemoryMap<K, V> {
    fn with_log(name: &str, log: OpLog) -> Self {
        Self {
            name: name.to_string(),
            entries: Arc::default(),
            log,
            fail_deletes: Arc::default(),
        }
    }

    fn record(&self, op: &str, key: &[u8]) {
        self.log.lock().unwrap().push(MapOp::new(&self.name, op, key));
    }

    pub fn get_entry(&self, key: &K) -> Option<V> {
        self.entries
            .lock()
            .unwrap()
            .get(&key.key_bytes())
            .map(|(_, v)| *v)
    }

    /// Write without logging, as the forwarding program would
    pub fn put(&self, key: K, value: V) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.key_bytes(), (key, value));
    }

    /// Entries ordered by key bytes
    pub fn entries(&self) -> Vec<(K, V)> {
        self.entries.lock().unwrap().values().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Make every following delete fail with EIO, leaving the entry in place
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

impl<K, V> OffloadMap<K, V> for MemoryMap<K, V>
where
    K: KeyBytes + Copy + Send,
    V: Copy + Send,
{
    fn get(&self, key: &K) -> Result<Option<V>> {
        let bytes = key.key_bytes();
        self.record("get", &bytes);
        Ok(self.entries.lock().unwrap().get(&bytes).map(|(_, v)| *v))
    }

    fn insert(&mut self, key: K, value: V) -> Result<()> {
        let bytes = key.key_bytes();
        self.record("insert", &bytes);
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&bytes) {
            bail!("{}: key exists", self.name);
        }
        entries.insert(bytes, (key, value));
        Ok(())
    }

    fn update(&mut self, key: K, value: V) -> Result<()> {
        let bytes = key.key_bytes();
        self.record("update", &bytes);
        self.entries.lock().unwrap().insert(bytes, (key, value));
        Ok(())
    }

    fn delete(&mut self, key: &K) -> Result<bool> {
        let bytes = key.key_bytes();
        self.record("delete", &bytes);
        if self.fail_deletes.load(Ordering::SeqCst) {
            bail!("{}: delete failed: EIO", self.name);
        }
        Ok(self.entries.lock().unwrap().remove(&bytes).is_some())
    }

    fn for_each(&self, f: &mut dyn FnMut(&K, &V)) -> Result<()> {
        for (k, v) in self.entries.lock().unwrap().values() {
            f(k, v);
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.record("clear", &[]);
        self.entries.lock().unwrap().clear();
        Ok(())
    }
}

/// The six tethering maps sharing one op log
#[derive(Clone)]
pub struct MapHarness {
    pub downstream4: MemoryMap<Tether4Key, Tether4Value>,
    pub upstream4: MemoryMap<Tether4Key, Tether4Value>,
    pub downstream6: MemoryMap<TetherDownstream6Key, Tether6Value>,
    pub upstream6: MemoryMap<TetherUpstream6Key, Tether6Value>,
    pub stats: MemoryMap<TetherStatsKey, TetherStatsValue>,
    pub limit: MemoryMap<TetherLimitKey, TetherLimitValue>,
    log: OpLog,
}

impl MapHarness {
    pub fn new() -> Self {
        let log = OpLog::default();
        Self {
            downstream4: MemoryMap::with_log("downstream4", Arc::clone(&log)),
            upstream4: MemoryMap::with_log("upstream4", Arc::clone(&log)),
            downstream6: MemoryMap::with_log("downstream6", Arc::clone(&log)),
            upstream6: MemoryMap::with_log("upstream6", Arc::clone(&log)),
            stats: MemoryMap::with_log("stats", Arc::clone(&log)),
            limit: MemoryMap::with_log("limit", Arc::clone(&log)),
            log,
        }
    }

    /// Every map present, backed by this harness
    pub fn maps(&self) -> OffloadMaps {
        OffloadMaps {
            downstream4: Some(Box::new(self.downstream4.clone())),
            upstream4: Some(Box::new(self.upstream4.clone())),
            downstream6: Some(Box::new(self.downstream6.clone())),
            upstream6: Some(Box::new(self.upstream6.clone())),
            stats: Some(Box::new(self.stats.clone())),
            limit: Some(Box::new(self.limit.clone())),
        }
    }

    pub fn op_log(&self) -> Vec<MapOp> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_op_log(&self) {
        self.log.lock().unwrap().clear();
    }

    /// Maps cleared so far, in order
    pub fn cleared_maps(&self) -> Vec<String> {
        self.op_log()
            .into_iter()
            .filter(|op| op.op == "clear")
            .map(|op| op.map)
            .collect()
    }

    /// Set the cumulative counters of an interface the way the kernel does
    pub fn set_stats(
        &self,
        if_index: u32,
        rx_bytes: u64,
        rx_packets: u64,
        tx_bytes: u64,
        tx_packets: u64,
    ) {
        self.stats.put(
            TetherStatsKey::new(if_index),
            TetherStatsValue {
                rx_bytes,
                rx_packets,
                tx_bytes,
                tx_packets,
                ..TetherStatsValue::new()
            },
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonCall {
    RuleAdd(RuleParcel),
    RuleRemove(RuleParcel),
    GetStats,
    SetQuota(u32, i64),
    GetAndClear(u32),
}

#[derive(Default)]
struct DaemonState {
    calls: Vec<DaemonCall>,
    installed: BTreeMap<(u32, [u8; 16]), RuleParcel>,
    stats: BTreeMap<u32, ForwardedStats>,
    fail_rule_ops: bool,
}

/// Offload daemon keeping its tables in memory
#[derive(Clone, Default)]
pub struct FakeDaemon {
    state: Arc<Mutex<DaemonState>>,
}

impl FakeDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<DaemonCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Installed rules ordered by (input interface, destination)
    pub fn installed(&self) -> Vec<RuleParcel> {
        self.state
            .lock()
            .unwrap()
            .installed
            .values()
            .copied()
            .collect()
    }

    pub fn set_stats(&self, if_index: u32, stats: ForwardedStats) {
        self.state.lock().unwrap().stats.insert(if_index, stats);
    }

    pub fn fail_rule_ops(&self, fail: bool) {
        self.state.lock().unwrap().fail_rule_ops = fail;
    }
}

impl OffloadDaemon for FakeDaemon {
    fn rule_add(&mut self, rule: &RuleParcel) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DaemonCall::RuleAdd(*rule));
        if state.fail_rule_ops {
            bail!("remote exception");
        }
        state
            .installed
            .insert((rule.input_if_index, rule.destination.octets()), *rule);
        Ok(())
    }

    fn rule_remove(&mut self, rule: &RuleParcel) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DaemonCall::RuleRemove(*rule));
        if state.fail_rule_ops {
            bail!("remote exception");
        }
        state
            .installed
            .remove(&(rule.input_if_index, rule.destination.octets()));
        Ok(())
    }

    fn get_stats(&mut self) -> Result<Vec<InterfaceStats>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DaemonCall::GetStats);
        Ok(state
            .stats
            .iter()
            .map(|(if_index, stats)| InterfaceStats::new(*if_index, *stats))
            .collect())
    }

    fn set_interface_quota(&mut self, if_index: u32, quota_bytes: i64) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(DaemonCall::SetQuota(if_index, quota_bytes));
        Ok(())
    }

    fn get_and_clear_stats(&mut self, if_index: u32) -> Result<InterfaceStats> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DaemonCall::GetAndClear(if_index));
        let stats = state.stats.remove(&if_index).unwrap_or_default();
        Ok(InterfaceStats::new(if_index, stats))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    AddRule(ForwardingRule),
    RemoveRule(ForwardingRule),
    StartUpstream(u32, u32),
    StopUpstream(u32, u32),
    SetQuota(u32, i64, bool),
    GetAndClear(u32),
    ClearAll,
}

/// Backend recording every call. Stats reads are not recorded.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Vec<BackendCall>,
    stats: BTreeMap<u32, ForwardedStats>,
    fail_rule_ops: bool,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_calls(&mut self) -> Vec<BackendCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn set_stats(&mut self, if_index: u32, stats: ForwardedStats) {
        self.stats.insert(if_index, stats);
    }

    pub fn fail_rule_ops(&mut self, fail: bool) {
        self.fail_rule_ops = fail;
    }

    fn rule_op(&mut self, call: BackendCall) -> Result<()> {
        self.calls.push(call);
        if self.fail_rule_ops {
            return Err(anyhow!("injected failure"));
        }
        Ok(())
    }
}

impl OffloadBackend for RecordingBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::MapBased
    }

    fn add_rule(&mut self, rule: &ForwardingRule) -> Result<()> {
        self.rule_op(BackendCall::AddRule(*rule))
    }

    fn remove_rule(&mut self, rule: &ForwardingRule) -> Result<()> {
        self.rule_op(BackendCall::RemoveRule(*rule))
    }

    fn start_upstream_forwarding(&mut self, downstream_if: u32, upstream_if: u32) -> Result<()> {
        self.calls
            .push(BackendCall::StartUpstream(downstream_if, upstream_if));
        Ok(())
    }

    fn stop_upstream_forwarding(&mut self, downstream_if: u32, upstream_if: u32) -> Result<()> {
        self.calls
            .push(BackendCall::StopUpstream(downstream_if, upstream_if));
        Ok(())
    }

    fn get_all_stats(&mut self) -> Result<Vec<InterfaceStats>> {
        Ok(self
            .stats
            .iter()
            .map(|(if_index, stats)| InterfaceStats::new(*if_index, *stats))
            .collect())
    }

    fn set_quota(&mut self, if_index: u32, quota_bytes: i64, is_init: bool) -> Result<()> {
        self.calls
            .push(BackendCall::SetQuota(if_index, quota_bytes, is_init));
        Ok(())
    }

    fn get_and_clear_stats(&mut self, if_index: u32) -> Result<InterfaceStats> {
        self.calls.push(BackendCall::GetAndClear(if_index));
        let stats = self.stats.remove(&if_index).unwrap_or_default();
        Ok(InterfaceStats::new(if_index, stats))
    }

    fn clear_all(&mut self) -> Result<()> {
        self.calls.push(BackendCall::ClearAll);
        Ok(())
    }
}

type Push = (Vec<StatsRecord>, Vec<StatsRecord>);

#[derive(Default)]
struct SinkState {
    pushes: Vec<Push>,
    alerts: usize,
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    state: Arc<Mutex<SinkState>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pushes(&self) -> Vec<Push> {
        self.state.lock().unwrap().pushes.clone()
    }

    pub fn alerts(&self) -> usize {
        self.state.lock().unwrap().alerts
    }
}

impl StatsSink for RecordingSink {
    fn notify_stats_updated(&mut self, per_iface: &[StatsRecord], per_owner: &[StatsRecord]) {
        self.state
            .lock()
            .unwrap()
            .pushes
            .push((per_iface.to_vec(), per_owner.to_vec()));
    }

    fn notify_alert_reached(&mut self) {
        self.state.lock().unwrap().alerts += 1;
    }
}

#[derive(Default)]
struct ConntrackState {
    events: Vec<&'static str>,
    fail_start: bool,
}

#[derive(Clone, Default)]
pub struct FakeConntrack {
    state: Arc<Mutex<ConntrackState>>,
}

impl FakeConntrack {
    pub fn new() -> Self {
        Self::default()
    }

    /// "start"/"stop" in call order
    pub fn events(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn fail_start(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }
}

impl ConntrackMonitor for FakeConntrack {
    fn start(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push("start");
        if state.fail_start {
            bail!("netlink socket unavailable");
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.state.lock().unwrap().events.push("stop");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachCall {
    Attach(String, StreamDirection),
    Detach(String),
}

#[derive(Clone, Default)]
pub struct FakeAttacher {
    calls: Arc<Mutex<Vec<AttachCall>>>,
}

impl FakeAttacher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<AttachCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn take_calls(&self) -> Vec<AttachCall> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }
}

impl ProgramAttacher for FakeAttacher {
    fn attach(&mut self, iface: &str, direction: StreamDirection) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(AttachCall::Attach(iface.to_string(), direction));
        Ok(())
    }

    fn detach(&mut self, iface: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(AttachCall::Detach(iface.to_string()));
        Ok(())
    }
}
