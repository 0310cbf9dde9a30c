use std::{
    fmt,
    io::{BufRead, Write},
    ops::Range,
    time::Duration,
};

use clap::Parser;

use crate::error::{ConfigError, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Deadlock,   // 2 つ目もブロッキング取得する
    Correction, // 2 つ目は try して駄目なら手放す
}

impl Mode {
    // 1: デッドロック, 2: 修正版
    pub fn from_selector(n: i64) -> std::result::Result<Self, ConfigError> {
        match n {
            1 => Ok(Mode::Deadlock),
            2 => Ok(Mode::Correction),
            n => Err(ConfigError::UnknownMode(n)),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Deadlock => write!(f, "deadlock"),
            Mode::Correction => write!(f, "correction"),
        }
    }
}

/// ワーカーの待ち時間
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    pub think: Duration,         // 1 つ目を取ってから 2 つ目を試すまで
    pub backoff: Range<Duration>, // 競合で手放した後
    pub rest: Range<Duration>,    // 配達完了後
    pub pause: Duration,         // 毎イテレーションの最後
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            think: Duration::from_millis(800),
            backoff: Duration::from_millis(1000)..Duration::from_millis(2200),
            rest: Duration::from_millis(1000)..Duration::from_millis(2500),
            pause: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mode: Mode,
    pub stations: usize,
    pub workers: usize,
    pub timing: Timing,
}

impl Config {
    pub fn new(mode: Mode, stations: usize, workers: usize) -> Self {
        Config {
            mode,
            stations,
            workers,
            timing: Timing::default(),
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }
}

// 入力は %d の範囲まで
pub const MAX_COUNT: usize = i32::MAX as usize;

fn count_from(n: i64) -> Option<usize> {
    usize::try_from(n)
        .ok()
        .filter(|n| (1..=MAX_COUNT).contains(n))
}

pub fn stations_from(n: i64) -> std::result::Result<usize, ConfigError> {
    count_from(n).ok_or(ConfigError::Stations(n))
}

pub fn workers_from(n: i64) -> std::result::Result<usize, ConfigError> {
    count_from(n).ok_or(ConfigError::Workers(n))
}

#[derive(Debug, Parser)]
#[command(version, about = "Two workers, two locks, one station: watch it deadlock or not")]
pub struct Cli {
    /// 1 = deadlock mode, 2 = correction mode
    #[arg(long)]
    pub mode: Option<i64>,

    /// number of stations
    #[arg(long)]
    pub stations: Option<i64>,

    /// number of workers
    #[arg(long)]
    pub workers: Option<i64>,

    /// think time between the first and the second acquisition
    #[arg(long, default_value_t = 800)]
    pub think_ms: u64,
}

// scanf("%d") と同じく空白区切りで 1 トークンずつ読む
pub struct Prompter<R, W> {
    input: R,
    output: W,
    pending: Vec<String>,
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Prompter {
            input,
            output,
            pending: Vec::new(),
        }
    }

    fn next_token(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(token) = self.pending.pop() {
                return Ok(Some(token));
            }
            let mut line = String::new();
            if self.input.read_line(&mut line).map_err(Error::Input)? == 0 {
                return Ok(None);
            }
            // pop で先頭から取り出せるよう逆順に積む
            self.pending = line.split_whitespace().rev().map(String::from).collect();
        }
    }

    pub fn ask(&mut self, prompt: &str, what: &'static str) -> Result<i64> {
        write!(self.output, "{prompt}").map_err(Error::Input)?;
        self.output.flush().map_err(Error::Input)?;

        let token = self.next_token()?.ok_or(ConfigError::Eof(what))?;
        let n = token
            .parse::<i64>()
            .map_err(|_| ConfigError::NotANumber(token))?;
        Ok(n)
    }

    pub fn banner(&mut self, text: &str) -> Result<()> {
        writeln!(self.output, "{text}").map_err(Error::Input)
    }
}

/// フラグで与えられなかった値だけプロンプトで聞く
pub fn collect<R: BufRead, W: Write>(cli: &Cli, prompter: &mut Prompter<R, W>) -> Result<Config> {
    prompter.banner("----- STATION DEADLOCK SIMULATOR -----")?;

    let mode = match cli.mode {
        Some(n) => n,
        None => prompter.ask(
            "Choose a mode:\n1- Deadlock mode\n2- Correction mode\nOption: ",
            "mode",
        )?,
    };
    let mode = Mode::from_selector(mode)?;

    let stations = match cli.stations {
        Some(n) => n,
        None => prompter.ask("\nNumber of stations: ", "station count")?,
    };
    let stations = stations_from(stations)?;

    let workers = match cli.workers {
        Some(n) => n,
        None => prompter.ask("Number of workers: ", "worker count")?,
    };
    let workers = workers_from(workers)?;

    let timing = Timing {
        think: Duration::from_millis(cli.think_ms),
        ..Timing::default()
    };

    Ok(Config::new(mode, stations, workers).with_timing(timing))
}
