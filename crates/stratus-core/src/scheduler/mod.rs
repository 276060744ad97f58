//! Scheduler - 時刻トリガーで recurring job を起動する
//!
//! # 設計原則
//! - job ごとに独立した timing loop（1 つの job の失敗や panic は他に波及しない）
//! - 同一 job の firing は重ならない
//! - `stop()` は実行中の firing の完了を待つ

pub mod job;
pub mod runner;

pub use self::job::{FnJob, Job, JobHandler, Trigger};
pub use self::runner::Scheduler;
