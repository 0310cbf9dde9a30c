use std::io;

use thiserror::Error;

// 設定入力の不正。ユーザーによる中断として扱い、終了コードは 0
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown mode selector: {0}")]
    UnknownMode(i64),
    #[error("station count must be between 1 and 2147483647, got {0}")]
    Stations(i64),
    #[error("worker count must be between 1 and 2147483647, got {0}")]
    Workers(i64),
    #[error("expected a number, got {0:?}")]
    NotANumber(String),
    #[error("input closed before {0} was given")]
    Eof(&'static str),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to register SIGINT handler: {0}")]
    Signal(#[source] io::Error),
    #[error("console i/o failed: {0}")]
    Input(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// キルスイッチによって待機が打ち切られたことを示す
// エラーではなく強制終了の合図
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aborted;
