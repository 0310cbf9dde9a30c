use std::{
    fmt,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
};

use crate::{error::Aborted, kill::KillSwitch};

// ステーションが持つ 2 種類のリソース
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    A,
    B,
}

impl ResourceKind {
    pub fn other(self) -> Self {
        match self {
            ResourceKind::A => ResourceKind::B,
            ResourceKind::B => ResourceKind::A,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::A => write!(f, "resource A"),
            ResourceKind::B => write!(f, "resource B"),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    holder: Option<usize>,  // 保持しているワーカーの id
    waiters: Vec<usize>,    // ブロッキング取得で待っているワーカーの id
}

/// 1 本のロック
///
/// std の MutexGuard は RAII で自動解放されてしまうため、
/// 強制終了時にロックを「持ったまま放置」できるよう所有者を明示的に記録する。
#[derive(Debug, Default)]
pub struct Resource {
    state: Mutex<State>,
    freed: Condvar,
}

impl Resource {
    pub fn new() -> Self {
        Self::default()
    }

    // 内部 Mutex の poison はロックプリミティブの故障なので続行不能
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("resource state poisoned")
    }

    // 観測と後始末用。ワーカーが死んだ後でも読めるよう poison を無視する
    fn peek(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 空くまでブロックして取得する。待機中に kill されたら Aborted
    pub fn acquire(&self, worker: usize, kill: &KillSwitch) -> Result<(), Aborted> {
        let mut state = self.state();
        let mut waiting = false;

        while state.holder.is_some() {
            if kill.is_fired() {
                state.waiters.retain(|&w| w != worker);
                return Err(Aborted);
            }
            if !waiting {
                state.waiters.push(worker);
                waiting = true;
            }
            state = self.freed.wait(state).expect("resource state poisoned");
        }

        if waiting {
            state.waiters.retain(|&w| w != worker);
        }
        state.holder = Some(worker);
        Ok(())
    }

    /// 取得できなければ即座に false。決して待たない
    pub fn try_acquire(&self, worker: usize) -> bool {
        let mut state = self.state();
        if state.holder.is_some() {
            return false;
        }
        state.holder = Some(worker);
        true
    }

    pub fn release(&self, worker: usize) {
        let mut state = self.state();
        // 他人のロックを解放するのは不変条件違反。
        // Mutex を poison しないよう guard を手放してから panic する
        let holder = state.holder;
        if holder != Some(worker) {
            drop(state);
            panic!("worker {worker} released a resource it does not hold (holder: {holder:?})");
        }
        state.holder = None;
        self.freed.notify_one();
    }

    pub fn holder(&self) -> Option<usize> {
        self.peek().holder
    }

    pub fn waiters(&self) -> Vec<usize> {
        self.peek().waiters.clone()
    }

    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let _ = std::thread::scope(|s| {
            s.spawn(|| {
                let _state = self.state();
                panic!("poisoning resource state");
            })
            .join()
        });
    }

    // KillSwitch::fire の後に呼ぶ。Mutex を取ってから notify するので起こし損ねない
    // unwind 中にも呼ばれるので poison では panic しない
    pub fn wake_all(&self) {
        let _state = self.peek();
        self.freed.notify_all();
    }
}

#[derive(Debug)]
pub struct Station {
    id: usize,
    a: Resource,
    b: Resource,
}

impl Station {
    pub fn new(id: usize) -> Self {
        Station {
            id,
            a: Resource::new(),
            b: Resource::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn resource(&self, kind: ResourceKind) -> &Resource {
        match kind {
            ResourceKind::A => &self.a,
            ResourceKind::B => &self.b,
        }
    }

    /// A を持って B を待つワーカーと、B を持って A を待つワーカーがいるか (循環待ち)
    pub fn is_deadlocked(&self) -> bool {
        // 2 つ同時に見ないと途中経過を循環待ちと誤判定する。
        // 内部 Mutex を 2 つ重ねて取るのはここと holders だけで、順番は常に A -> B
        let a = self.a.peek();
        let b = self.b.peek();
        match (a.holder, b.holder) {
            (Some(x), Some(y)) if x != y => b.waiters.contains(&x) && a.waiters.contains(&y),
            _ => false,
        }
    }

    /// (A の持ち主, B の持ち主) を同じ瞬間で見たもの
    pub fn holders(&self) -> (Option<usize>, Option<usize>) {
        let a = self.a.peek();
        let b = self.b.peek();
        (a.holder, b.holder)
    }

    /// 保持されたまま残っているリソースの数
    pub fn held_count(&self) -> usize {
        let (a, b) = self.holders();
        usize::from(a.is_some()) + usize::from(b.is_some())
    }

    pub fn wake_all(&self) {
        self.a.wake_all();
        self.b.wake_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    };

    const NUM_THREADS: usize = 8;
    const NUM_LOOP: usize = 2000;

    #[test]
    fn test_try_acquire_fails_when_held() {
        let r = Resource::new();
        assert!(r.try_acquire(1));
        assert!(!r.try_acquire(2));
        assert_eq!(r.holder(), Some(1));

        r.release(1);
        assert!(r.try_acquire(2));
        assert_eq!(r.holder(), Some(2));
    }

    #[test]
    #[should_panic]
    fn test_release_by_non_holder_panics() {
        let r = Resource::new();
        r.acquire(1, &KillSwitch::new()).unwrap();
        r.release(2);
    }

    #[test]
    fn test_bad_release_does_not_poison() {
        let r = Resource::new();
        r.acquire(1, &KillSwitch::new()).unwrap();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| r.release(2)));
        assert!(res.is_err());
        // 持ち主はそのままで、以降も普通に使える
        assert_eq!(r.holder(), Some(1));
        r.release(1);
        assert!(r.try_acquire(2));
    }

    #[test]
    fn test_poisoned_resource_still_observable() {
        let station = Station::new(1);
        assert!(station.resource(ResourceKind::A).try_acquire(3));
        station.resource(ResourceKind::A).poison();

        assert_eq!(station.holders(), (Some(3), None));
        assert_eq!(station.held_count(), 1);
        assert!(!station.is_deadlocked());
        station.wake_all();
    }

    #[test]
    fn test_mutual_exclusion() {
        // 同時に 2 つ以上のスレッドがクリティカルセクションに入らないこと
        let station = Arc::new(Station::new(1));
        let kill = Arc::new(KillSwitch::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut v = Vec::new();

        for i in 0..NUM_THREADS {
            let station = station.clone();
            let kill = kill.clone();
            let inside = inside.clone();
            let t = thread::spawn(move || {
                for _ in 0..NUM_LOOP {
                    // A -> B の一方向だけなのでデッドロックしない
                    station.resource(ResourceKind::A).acquire(i, &kill).unwrap();
                    station.resource(ResourceKind::B).acquire(i, &kill).unwrap();

                    let n = inside.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(n, 0);
                    assert_eq!(station.resource(ResourceKind::A).holder(), Some(i));
                    assert_eq!(station.resource(ResourceKind::B).holder(), Some(i));
                    inside.fetch_sub(1, Ordering::SeqCst);

                    station.resource(ResourceKind::B).release(i);
                    station.resource(ResourceKind::A).release(i);
                }
            });
            v.push(t);
        }

        for t in v {
            t.join().unwrap();
        }

        assert_eq!(station.held_count(), 0);
        assert!(station.resource(ResourceKind::A).waiters().is_empty());
    }

    #[test]
    fn test_blocked_acquire_is_aborted() {
        let r = Arc::new(Resource::new());
        let kill = Arc::new(KillSwitch::new());
        r.acquire(1, &kill).unwrap();

        let r0 = r.clone();
        let kill0 = kill.clone();
        let t = thread::spawn(move || r0.acquire(2, &kill0));

        let start = Instant::now();
        while r.waiters() != vec![2] {
            assert!(start.elapsed() < Duration::from_secs(10));
            thread::sleep(Duration::from_millis(5));
        }

        kill.fire();
        r.wake_all();

        assert_eq!(t.join().unwrap(), Err(Aborted));
        // 強制終了ではロックは放置されたまま
        assert_eq!(r.holder(), Some(1));
        assert!(r.waiters().is_empty());
    }

    #[test]
    fn test_circular_wait_is_detected() {
        let station = Arc::new(Station::new(1));
        let kill = Arc::new(KillSwitch::new());

        station.resource(ResourceKind::A).acquire(1, &kill).unwrap();
        station.resource(ResourceKind::B).acquire(2, &kill).unwrap();
        assert!(!station.is_deadlocked());

        let mut v = Vec::new();
        for (worker, kind) in [(1, ResourceKind::B), (2, ResourceKind::A)] {
            let station = station.clone();
            let kill = kill.clone();
            v.push(thread::spawn(move || station.resource(kind).acquire(worker, &kill)));
        }

        let start = Instant::now();
        while !station.is_deadlocked() {
            assert!(start.elapsed() < Duration::from_secs(10));
            thread::sleep(Duration::from_millis(5));
        }

        kill.fire();
        station.wake_all();
        for t in v {
            assert_eq!(t.join().unwrap(), Err(Aborted));
        }
        assert_eq!(station.held_count(), 2);
    }

    #[test]
    fn test_resource_kind_other() {
        assert_eq!(ResourceKind::A.other(), ResourceKind::B);
        assert_eq!(ResourceKind::B.other(), ResourceKind::A);
    }
}
