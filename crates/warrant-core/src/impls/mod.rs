//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryApplier**: 開発用の永続状態（DurableStateApplier + ReferenceResolver）
//!
//! 本番の永続状態は利用側アプリケーションが持ちます。

pub mod inmem_applier;

pub use self::inmem_applier::{InMemoryApplier, Node};
