//! Concurrent MD churn with lifecycle bookkeeping
use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::unbounded;
use fail_inject::FailParams;
use lnet_md::{
    DelayedMsg, Event, EventHandler, HostPageMap, MatchEntry, MdConfig, MdDesc, MdError, MdHandle,
    MdInfo, MdLayer, MdOptions, MdStats, OpKind, PageMap, Portal, Threshold, UnlinkPolicy,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Stress run configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    /// Worker threads
    pub threads: usize,
    /// MDs created by each worker
    pub iterations: usize,
    /// Most operations started against one MD
    pub max_ops: u32,
    /// Percent of MDs unlinked while their operations are in flight
    pub early_unlink_pct: u32,
    /// Size of each worker's buffer, in pages
    pub buffer_pages: usize,
    /// Fault injection armed for the duration of the run
    pub faults: Option<FailParams>,
    pub md: MdConfig,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            iterations: 2000,
            max_ops: 8,
            early_unlink_pct: 30,
            buffer_pages: 64,
            faults: None,
            md: MdConfig::default(),
        }
    }
}

impl StressConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&text).context("Failed to parse stress config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            bail!("threads must be non-zero");
        }
        if self.buffer_pages == 0 {
            bail!("buffer_pages must be non-zero");
        }
        if self.early_unlink_pct > 100 {
            bail!("early_unlink_pct is a percentage, got {}", self.early_unlink_pct);
        }
        self.md.validate()
    }
}

/// Portal with no parked messages; counts what the MD layer does to it.
#[derive(Default)]
struct StressPortal {
    attached: AtomicU64,
    detached: AtomicU64,
    me_unlinked: AtomicU64,
}

impl Portal for StressPortal {
    fn attach_md(&self, _: &MatchEntry, _: &MdInfo, _: &mut Vec<DelayedMsg>, _: &mut Vec<DelayedMsg>) {
        self.attached.fetch_add(1, Ordering::Relaxed);
    }

    fn detach_md(&self, _: &MatchEntry, _: MdHandle) {
        self.detached.fetch_add(1, Ordering::Relaxed);
    }

    fn me_unlink(&self, _: &MatchEntry) {
        self.me_unlinked.fetch_add(1, Ordering::Relaxed);
    }

    fn drop_delayed(&self, _: Vec<DelayedMsg>, _: &str) {}

    fn recv_delayed(&self, _: Vec<DelayedMsg>) {}
}

/// Events seen by the shared handler, with unlink notifications per MD
#[derive(Default)]
struct Tally {
    events: AtomicU64,
    terminal: Mutex<HashMap<MdHandle, u32>>,
}

impl Tally {
    fn record(&self, event: &Event) {
        self.events.fetch_add(1, Ordering::Relaxed);
        if event.unlinked {
            *self.terminal.lock().entry(event.md_handle).or_default() += 1;
        }
    }
}

#[derive(Debug, Default)]
struct WorkerReport {
    created: u64,
    rejected: u64,
    ops: u64,
    early_unlinks: u64,
    handles: Vec<MdHandle>,
}

#[derive(Debug, Serialize)]
pub struct StressReport {
    pub created: u64,
    pub rejected: u64,
    pub ops: u64,
    pub early_unlinks: u64,
    pub events: u64,
    pub me_attached: u64,
    pub me_detached: u64,
    pub me_unlinked: u64,
    pub stats: MdStats,
    pub violations: Vec<String>,
}

fn worker(
    id: usize,
    layer: &MdLayer,
    config: &StressConfig,
    handler: &EventHandler,
    page_size: usize,
) -> WorkerReport {
    let buf = vec![0u8; config.buffer_pages * page_size];
    let base = buf.as_ptr() as usize;
    let mut rng = rand::thread_rng();
    let mut report = WorkerReport::default();

    for i in 0..config.iterations {
        let len = rng.gen_range(1..=buf.len().min(4 * page_size));
        let offset = rng.gen_range(0..=buf.len() - len);
        let threshold = if rng.gen_bool(0.5) {
            Threshold::Infinite
        } else {
            Threshold::Ops(rng.gen_range(1..=config.max_ops.max(1)))
        };
        let policy = if threshold.is_infinite() {
            UnlinkPolicy::Retain
        } else {
            UnlinkPolicy::Unlink
        };
        let desc = MdDesc::contiguous(base + offset, len)
            .threshold(threshold)
            .user_ptr(((id as u64) << 32) | i as u64);

        let attached = rng.gen_bool(0.5);
        let rc = if attached {
            let me = MatchEntry {
                id: ((id as u64) << 32) | i as u64,
                cpt: rng.gen_range(0..layer.ncpts()),
                portal: 0,
                match_bits: rng.gen(),
                ignore_bits: 0,
                unlink: policy,
            };
            let desc = desc.options(MdOptions::OP_PUT | MdOptions::OP_GET);
            layer.attach(me, desc, policy, Some(handler.clone()))
        } else {
            layer.bind(desc, policy, Some(handler.clone()))
        };
        let handle = match rc {
            Ok(handle) => handle,
            Err(e) => {
                debug!("worker {}: MD rejected: {}", id, e);
                report.rejected += 1;
                continue;
            }
        };
        report.created += 1;
        report.handles.push(handle);

        let kind = if attached { OpKind::Put } else { OpKind::Send };
        let mut ops = Vec::new();
        for _ in 0..rng.gen_range(0..=config.max_ops) {
            match layer.begin_op(handle, kind, rng.gen_range(0..=64)) {
                Ok(op) => ops.push(op),
                Err(_) => break,
            }
        }
        report.ops += ops.len() as u64;
        let _ = layer.cpt_of(handle, rng.gen_range(0..len));

        if rng.gen_range(0..100) < config.early_unlink_pct && layer.unlink(handle).is_ok() {
            report.early_unlinks += 1;
        }
        for op in ops {
            layer.complete(op, 0);
        }
        match layer.unlink(handle) {
            Ok(()) | Err(MdError::NotFound(_)) => {}
            Err(e) => warn!("worker {}: unlink of md {} failed: {}", id, handle, e),
        }
    }

    report
}

/// Run the configured workers to completion and check the lifecycle
/// bookkeeping afterwards.
pub fn run(config: &StressConfig) -> Result<StressReport> {
    config.validate()?;

    let pages = Arc::new(HostPageMap::new());
    let page_size = pages.page_size();
    let portal = Arc::new(StressPortal::default());
    let layer = Arc::new(
        MdLayer::new(config.md.clone(), pages, portal.clone())
            .context("Failed to create MD layer")?,
    );

    if let Some(params) = &config.faults {
        info!(
            "Arming fault injection: fail_loc={:#x} fail_val={} fail_err={}",
            params.fail_loc, params.fail_val, params.fail_err
        );
        fail_inject::global().apply(params);
    }

    let tally = Arc::new(Tally::default());
    let handler = {
        let tally = Arc::clone(&tally);
        EventHandler::new(move |event: &Event| tally.record(event))
    };

    let (tx, rx) = unbounded();
    let workers = (0..config.threads)
        .map(|id| {
            let layer = Arc::clone(&layer);
            let handler = handler.clone();
            let config = config.clone();
            let tx = tx.clone();
            thread::Builder::new()
                .name(format!("md-stress-{}", id))
                .spawn(move || {
                    let report = worker(id, &layer, &config, &handler, page_size);
                    let _ = tx.send(report);
                })
                .context("Failed to spawn worker")
        })
        .collect::<Result<Vec<_>>>()?;
    drop(tx);

    for w in workers {
        w.join().map_err(|_| anyhow!("stress worker panicked"))?;
    }
    if config.faults.is_some() {
        fail_inject::global().clear();
    }

    let mut created = 0;
    let mut rejected = 0;
    let mut ops = 0;
    let mut early_unlinks = 0;
    let mut handles = Vec::new();
    for r in rx.iter() {
        created += r.created;
        rejected += r.rejected;
        ops += r.ops;
        early_unlinks += r.early_unlinks;
        handles.extend(r.handles);
    }

    let mut violations = Vec::new();
    {
        let terminal = tally.terminal.lock();
        for h in &handles {
            let seen = terminal.get(h).copied().unwrap_or(0);
            if seen != 1 {
                violations.push(format!("md {} got {} unlink notifications", h, seen));
            }
            if layer.md_info(*h).is_ok() {
                violations.push(format!("md {} still resolves after unlink", h));
            }
        }
    }

    let stats = layer.stats();
    if stats.total_active() != 0 {
        violations.push(format!("{} MDs still linked", stats.total_active()));
    }
    if stats.alloc.live() != 0 {
        violations.push(format!("{} MD allocations leaked", stats.alloc.live()));
    }
    let me_attached = portal.attached.load(Ordering::Relaxed);
    let me_detached = portal.detached.load(Ordering::Relaxed);
    if me_attached != me_detached {
        violations.push(format!(
            "{} MDs attached to match entries but {} detached",
            me_attached, me_detached
        ));
    }
    if violations.is_empty() {
        layer.assert_handler_unused(&handler);
    }

    Ok(StressReport {
        created,
        rejected,
        ops,
        early_unlinks,
        events: tally.events.load(Ordering::Relaxed),
        me_attached,
        me_detached,
        me_unlinked: portal.me_unlinked.load(Ordering::Relaxed),
        stats,
        violations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fail_inject::loc::RAND;
    use lnet_md::failpoints::FAIL_MD_ALLOC;

    fn small() -> StressConfig {
        StressConfig {
            threads: 3,
            iterations: 300,
            buffer_pages: 16,
            ..Default::default()
        }
    }

    #[test]
    fn test_stress_config_default() {
        let config = StressConfig::default();
        assert_eq!(config.threads, 4);
        assert_eq!(config.iterations, 2000);
        assert!(config.faults.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stress_config_json() {
        let config: StressConfig = serde_json::from_str(
            r#"{"threads": 2, "faults": {"fail_loc": 57345, "fail_val": 4, "fail_err": 0},
                "md": {"ncpts": 8}}"#,
        )
        .unwrap();
        assert_eq!(config.threads, 2);
        assert_eq!(config.iterations, 2000);
        assert_eq!(config.md.ncpts, 8);
        assert_eq!(config.faults.unwrap().fail_loc, 0xe001);
    }

    #[test]
    fn test_stress_config_rejects_bad_values() {
        let config = StressConfig {
            threads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = StressConfig {
            early_unlink_pct: 101,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stress_run_is_clean() {
        let report = run(&small()).unwrap();
        assert!(report.violations.is_empty(), "{:?}", report.violations);
        assert_eq!(report.created + report.rejected, 900);
        assert_eq!(report.stats.total_active(), 0);
    }

    #[test]
    fn test_stress_run_with_alloc_failures() {
        let config = StressConfig {
            faults: Some(FailParams {
                fail_loc: u64::from(FAIL_MD_ALLOC) | RAND,
                fail_val: 4,
                fail_err: 0,
            }),
            ..small()
        };
        let report = run(&config).unwrap();
        assert!(report.violations.is_empty(), "{:?}", report.violations);
        assert_eq!(report.created + report.rejected, 900);
        assert_eq!(report.stats.alloc.live(), 0);
    }
}
