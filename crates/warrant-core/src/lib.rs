//! warrant-core
//!
//! Task dispatch and capability security for agent workers.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, action, manifest, envelope, budget, proposal, events, audit, checkpoint）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, ActionExecutor, DurableStateApplier, ReferenceResolver）
//! - **queue**: タスクキュー（状態遷移、claim、retry、reaper）
//! - **registry**: agent / trust context ごとのマニフェスト
//! - **policy**: すべてのアクションが通る判定（allow / deny / needs_approval）
//! - **inbox**: 提案された操作のレビューと適用
//! - **events / audit / checkpoint**: 進捗ストリーム、監査ログ、再開ポイント
//! - **app**: 組み立て（KernelBuilder, Kernel, Runtime, WorkerGroup, ReaperLoop）
//! - **impls**: 開発用の実装（InMemoryApplier）

pub mod app;
pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod impls;
pub mod inbox;
pub mod observability;
pub mod policy;
pub mod ports;
pub mod queue;
pub mod rate_limit;
pub mod registry;

pub use app::{Kernel, KernelBuilder};
pub use error::KernelError;
