//! App - アプリケーション層
//!
//! このモジュールは、コンポーネントを組み合わせてカーネルを組み立てます。
//!
//! # 主要コンポーネント
//! - **KernelBuilder**: カーネルの構築とワイヤリング（fail-fast 検証）
//! - **Kernel**: ワーカー側・利用側の入口
//! - **Runtime**: agent_id → AgentRunner のディスパッチ
//! - **WorkerGroup**: claim→run→complete/fail のループ
//! - **ReaperLoop**: 切断・期限切れ・retry・archive の定期処理

pub mod builder;
pub mod kernel;
pub mod reaper_loop;
pub mod runtime;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, KernelBuilder};
pub use self::kernel::Kernel;
pub use self::reaper_loop::{ReaperHandle, ReaperLoop};
pub use self::runtime::{AgentRunner, RunnerError, RunnerRegistry, Runtime, TaskContext};
pub use self::worker_loop::{WorkerGroup, WorkerOptions};
