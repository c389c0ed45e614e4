//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。kernel の外にあるもの（時刻、ID、
//! アクション実行、永続状態）はすべてここの trait 越しに扱う。

pub mod applier;
pub mod clock;
pub mod executor;
pub mod id_generator;
pub mod resolver;

pub use self::applier::DurableStateApplier;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::ActionExecutor;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::resolver::ReferenceResolver;
