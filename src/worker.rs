use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
};

use rand::Rng;
use tracing::{debug, error, info, info_span};

use crate::{
    config::{Mode, Timing},
    error::Aborted,
    kill::KillSwitch,
    simulation::Shared,
    station::{ResourceKind, Station},
};

// 役割によってリソースを取る順番が逆になる。これがデッドロックの原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Veteran, // A -> B
    Rookie,  // B -> A
}

impl Role {
    // 偶数番目はベテラン、奇数番目は新人
    pub fn for_index(idx: usize) -> Self {
        if idx % 2 == 0 {
            Role::Veteran
        } else {
            Role::Rookie
        }
    }

    pub fn first(self) -> ResourceKind {
        match self {
            Role::Veteran => ResourceKind::A,
            Role::Rookie => ResourceKind::B,
        }
    }

    pub fn second(self) -> ResourceKind {
        self.first().other()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Veteran => write!(f, "veteran"),
            Role::Rookie => write!(f, "rookie"),
        }
    }
}

/// ログに出すイベントごとの発生回数
#[derive(Debug, Default)]
pub struct Stats {
    first_acquired: AtomicU64,
    wait_begun: AtomicU64,
    contention_releases: AtomicU64,
    both_acquired: AtomicU64,
    completed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub first_acquired: u64,
    pub wait_begun: u64,
    pub contention_releases: u64,
    pub both_acquired: u64,
    pub completed: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            first_acquired: self.first_acquired.load(Ordering::Relaxed),
            wait_begun: self.wait_begun.load(Ordering::Relaxed),
            contention_releases: self.contention_releases.load(Ordering::Relaxed),
            both_acquired: self.both_acquired.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Worker {
    pub(crate) id: usize,
    pub(crate) role: Role,
    pub(crate) mode: Mode,
    pub(crate) timing: Timing,
    pub(crate) stations: Arc<[Station]>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) kill: Arc<KillSwitch>,
    pub(crate) stats: Arc<Stats>,
}

// panic で unwind するときだけ働く。
// 死んだワーカーの握ったロックは二度と空かないので、全体を強制終了に切り替える
struct Casualty<'a> {
    worker: &'a Worker,
}

impl Drop for Casualty<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        let w = self.worker;
        error!("worker panicked, terminating every worker");
        w.kill.fire();
        for station in w.stations.iter() {
            station.wake_all();
        }
        w.shared.worker_failed();
    }
}

impl Worker {
    /// スレッドの本体
    ///
    /// running が下ろされてループを抜けたときだけ稼働数を減らす。
    /// kill で打ち切られた場合は後始末を一切せず、握っているリソースもそのまま
    pub fn run(self) {
        let span = info_span!("worker", id = self.id, role = %self.role);
        let _enter = span.enter();
        let _casualty = Casualty { worker: &self };

        match self.work_loop() {
            Ok(()) => {
                self.shared.worker_finished();
                debug!("left the loop");
            }
            Err(Aborted) => debug!("terminated by the kill switch"),
        }
    }

    fn work_loop(&self) -> Result<(), Aborted> {
        let mut rng = rand::thread_rng();

        while self.shared.is_running() {
            self.kill.check()?;

            let station = &self.stations[rng.gen_range(0..self.stations.len())];
            self.attempt(station, &mut rng)?;

            // Correction モードのリトライで CPU を回しすぎないように
            self.kill.sleep(self.timing.pause)?;
        }

        // kill と running が同時に下ろされた場合はループ先頭で抜けてくるので、
        // ここでも kill を見て後始末に進まないようにする
        self.kill.check()
    }

    // 1 回分の取得の試み。成功しても競合で手放しても Ok
    fn attempt<R: Rng>(&self, station: &Station, rng: &mut R) -> Result<(), Aborted> {
        let first = self.role.first();
        let second = self.role.second();
        let sid = station.id();

        station.resource(first).acquire(self.id, &self.kill)?;
        Stats::bump(&self.stats.first_acquired);
        info!(station = sid, event = "first_acquired", "took {first}");

        self.kill.sleep(self.timing.think)?;

        Stats::bump(&self.stats.wait_begun);
        info!(station = sid, event = "wait_begin", "waiting for {second}...");

        match self.mode {
            Mode::Deadlock => {
                // 相手が逆順で取っていればここで永遠に止まる
                station.resource(second).acquire(self.id, &self.kill)?;
            }
            Mode::Correction => {
                if !station.resource(second).try_acquire(self.id) {
                    // 持っている方を手放して循環待ちを断つ
                    station.resource(first).release(self.id);
                    Stats::bump(&self.stats.contention_releases);
                    info!(
                        station = sid,
                        event = "contention_release",
                        "gave up {first} to avoid deadlock"
                    );

                    let backoff = rng.gen_range(self.timing.backoff.clone());
                    return self.kill.sleep(backoff);
                }
            }
        }

        Stats::bump(&self.stats.both_acquired);
        info!(station = sid, event = "both_acquired", "took {second}");

        Stats::bump(&self.stats.completed);
        info!(station = sid, event = "completed", "delivered the order");

        station.resource(second).release(self.id);
        station.resource(first).release(self.id);

        let rest = rng.gen_range(self.timing.rest.clone());
        self.kill.sleep(rest)
    }
}
