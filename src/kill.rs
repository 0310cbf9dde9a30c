use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Condvar, Mutex,
    },
    time::Duration,
};

use crate::error::Aborted;

/// 強制終了用のスイッチ
///
/// 一度 fire したら戻らない。ワーカーのスリープはすべてこのスイッチ上の
/// タイムアウト付き待機で行うので、fire すると即座に起こされる。
/// ロック待ちで寝ているワーカーは Station::wake_all で起こす。
#[derive(Debug, Default)]
pub struct KillSwitch {
    fired: AtomicBool,
    state: Mutex<bool>,
    cond: Condvar,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn fire(&self) {
        // Resource::acquire はこのフラグを自分の Mutex 内で見るので、
        // 起こす側より先に store しておく
        self.fired.store(true, Ordering::SeqCst);
        let mut fired = self.state.lock().expect("kill switch poisoned");
        *fired = true;
        self.cond.notify_all();
    }

    /// dur だけ眠る。途中で fire されたら Aborted
    pub fn sleep(&self, dur: Duration) -> Result<(), Aborted> {
        let fired = self.state.lock().expect("kill switch poisoned");
        let (fired, _) = self
            .cond
            .wait_timeout_while(fired, dur, |fired| !*fired)
            .expect("kill switch poisoned");
        if *fired {
            Err(Aborted)
        } else {
            Ok(())
        }
    }

    pub fn check(&self) -> Result<(), Aborted> {
        if self.is_fired() {
            Err(Aborted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    #[test]
    fn test_sleep_runs_full_interval() {
        let kill = KillSwitch::new();
        let start = Instant::now();
        assert_eq!(kill.sleep(Duration::from_millis(30)), Ok(()));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_fire_interrupts_sleep() {
        let kill = Arc::new(KillSwitch::new());
        let kill0 = kill.clone();

        let start = Instant::now();
        let t = thread::spawn(move || kill0.sleep(Duration::from_secs(60)));

        thread::sleep(Duration::from_millis(50));
        kill.fire();

        assert_eq!(t.join().unwrap(), Err(Aborted));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_sleep_after_fire_returns_immediately() {
        let kill = KillSwitch::new();
        kill.fire();
        assert!(kill.is_fired());
        assert_eq!(kill.check(), Err(Aborted));
        assert_eq!(kill.sleep(Duration::from_secs(60)), Err(Aborted));
    }
}
