use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
};

use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, Mode, MAX_COUNT},
    error::{ConfigError, Error, Result},
    kill::KillSwitch,
    station::Station,
    worker::{Role, Stats, StatsSnapshot, Worker},
};

/// コントローラとワーカーで共有する同期オブジェクト
///
/// active は専用の Mutex の中でだけ書き換え、減らしたら必ず changed を notify する。
/// ステーションのロックを持ったままここに触ることはない
#[derive(Debug)]
pub struct Shared {
    running: AtomicBool,
    failed: AtomicBool, // panic したワーカーがいる
    active: Mutex<usize>,
    changed: Condvar,
}

impl Default for Shared {
    fn default() -> Self {
        Shared {
            running: AtomicBool::new(true),
            failed: AtomicBool::new(false),
            active: Mutex::new(0),
            changed: Condvar::new(),
        }
    }
}

impl Shared {
    pub fn new() -> Self {
        Self::default()
    }

    fn count(&self) -> MutexGuard<'_, usize> {
        self.active.lock().expect("active count poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop_running(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn active(&self) -> usize {
        *self.count()
    }

    pub(crate) fn worker_started(&self) {
        *self.count() += 1;
    }

    pub(crate) fn worker_finished(&self) {
        let mut n = self.count();
        *n -= 1;
        self.changed.notify_all();
    }

    // unwind 中に呼ばれるので poison でも panic しない
    pub(crate) fn worker_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
        let mut n = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        *n -= 1;
        self.changed.notify_all();
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    // ポーリングせず条件変数で 0 になるのを待つ。
    // 誰かが panic したら残りは kill で打ち切られて 0 にならないので、そこで諦める
    pub fn wait_drained(&self) {
        let n = self.count();
        let _n = self
            .changed
            .wait_while(n, |n| *n > 0 && !self.has_failed())
            .expect("active count poisoned");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Stopping,
    Drained,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Running => write!(f, "running"),
            Phase::Stopping => write!(f, "stopping"),
            Phase::Drained => write!(f, "drained"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub mode: Mode,
    pub forced: bool,            // kill スイッチを使ったか
    pub panicked: usize,         // panic で死んだワーカー数
    pub remaining_active: usize, // 協調的に抜けられなかったワーカー数
    pub abandoned: usize,        // 持ち主が消えたまま残ったリソース数
    pub stats: StatsSnapshot,
}

pub struct Simulation {
    config: Config,
    stations: Option<Arc<[Station]>>,
    handles: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    kill: Arc<KillSwitch>,
    stats: Arc<Stats>,
    phase: Phase,
}

impl Simulation {
    pub fn start(config: Config) -> Result<Self> {
        if config.stations == 0 {
            return Err(ConfigError::Stations(0).into());
        }
        if config.workers == 0 {
            return Err(ConfigError::Workers(0).into());
        }
        if config.stations > MAX_COUNT {
            let n = i64::try_from(config.stations).unwrap_or(i64::MAX);
            return Err(ConfigError::Stations(n).into());
        }
        if config.workers > MAX_COUNT {
            let n = i64::try_from(config.workers).unwrap_or(i64::MAX);
            return Err(ConfigError::Workers(n).into());
        }

        let stations: Arc<[Station]> = (1..=config.stations).map(Station::new).collect();

        let mut sim = Simulation {
            stations: Some(stations.clone()),
            handles: Vec::new(),
            shared: Arc::new(Shared::new()),
            kill: Arc::new(KillSwitch::new()),
            stats: Arc::new(Stats::default()),
            phase: Phase::Running,
            config,
        };

        for idx in 0..sim.config.workers {
            let role = Role::for_index(idx);
            let worker = Worker {
                id: idx + 1,
                role,
                mode: sim.config.mode,
                timing: sim.config.timing.clone(),
                stations: stations.clone(),
                shared: sim.shared.clone(),
                kill: sim.kill.clone(),
                stats: sim.stats.clone(),
            };

            // スレッドが先に終わっても数がずれないよう spawn 前に数える
            sim.shared.worker_started();
            let spawned = thread::Builder::new()
                .name(format!("{role}-{}", idx + 1))
                .spawn(move || worker.run());

            match spawned {
                Ok(t) => sim.handles.push(t),
                Err(e) => {
                    sim.shared.worker_finished();
                    // sim の Drop が起動済みのワーカーを片付ける
                    return Err(Error::Spawn(e));
                }
            }
        }

        info!(
            mode = %sim.config.mode,
            stations = sim.config.stations,
            workers = sim.config.workers,
            "simulation started"
        );
        Ok(sim)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn active_workers(&self) -> usize {
        self.shared.active()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // drain 後は空
    pub fn stations(&self) -> &[Station] {
        self.stations.as_deref().unwrap_or(&[])
    }

    /// 循環待ちに陥っているステーションの id
    pub fn deadlocked_stations(&self) -> Vec<usize> {
        self.stations()
            .iter()
            .filter(|s| s.is_deadlocked())
            .map(Station::id)
            .collect()
    }

    /// Running -> Stopping
    ///
    /// Correction モードでは running を下ろして全員が抜けるまで待つ。
    /// Deadlock モードではロック待ちで止まったワーカーは running を見られないので、
    /// kill で全員を打ち切る。稼働数が 0 になるのは待たない
    pub fn stop(&mut self) {
        if self.phase != Phase::Running {
            return;
        }
        self.phase = Phase::Stopping;

        match self.config.mode {
            Mode::Correction => {
                info!("stopping: waiting for workers to leave");
                self.shared.stop_running();
                self.shared.wait_drained();
            }
            Mode::Deadlock => {
                warn!("stopping: terminating workers");
                self.kill.fire();
                self.shared.stop_running();
                for station in self.stations() {
                    station.wake_all();
                }
            }
        }
    }

    /// Stopping -> Drained
    ///
    /// 2 回目以降は何もせず None を返す
    pub fn drain(&mut self) -> Option<ShutdownReport> {
        if self.phase == Phase::Drained {
            return None;
        }
        self.stop();

        // kill 済みか全員抜けた後なので join はすぐ終わる
        let mut panicked = 0;
        for t in self.handles.drain(..) {
            let name = t.thread().name().unwrap_or("worker").to_string();
            if t.join().is_err() {
                error!(thread = %name, "worker panicked");
                panicked += 1;
            }
        }

        let abandoned: usize = self.stations().iter().map(Station::held_count).sum();
        self.stations = None;
        self.phase = Phase::Drained;

        let report = ShutdownReport {
            mode: self.config.mode,
            forced: self.kill.is_fired(),
            panicked,
            remaining_active: self.shared.active(),
            abandoned,
            stats: self.stats.snapshot(),
        };
        debug!(
            forced = report.forced,
            panicked = report.panicked,
            remaining_active = report.remaining_active,
            abandoned = report.abandoned,
            delivered = report.stats.completed,
            "simulation drained"
        );
        Some(report)
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        self.drain();
    }
}
