//! 传输引擎接口
//!
//! 实际的 depot 分片传输由外部引擎完成，编排器只依赖以下能力：
//! 入队工作项、注册监听器、结束入队、启动、等待整体完成、关闭。
//! 引擎观察创建时传入的取消令牌，取消后以 [`TransferError::Cancelled`] 结束。

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::catalog::{AppId, DepotId};

/// 传输错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// 协作式取消（暂停或删除）
    #[error("传输已取消")]
    Cancelled,
    /// 非取消类失败
    #[error("传输失败: {0}")]
    Failed(String),
}

impl TransferError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

/// 传输引擎上报的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Preparing,
    Downloading,
    Verifying,
    Unknown,
}

/// 交给引擎的工作项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    pub app_id: AppId,
    pub install_dir: PathBuf,
    pub depot_ids: Vec<DepotId>,
    pub branch: String,
    pub verify: bool,
}

/// 引擎运行参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub max_downloads: usize,
    pub max_decompress: usize,
}

impl TransferOptions {
    /// 根据下载速度档位与 CPU 核数计算并发度
    ///
    /// 档位 8/16/24/32 对应下载并发 0.6/1.2/1.5/2.4 倍核数，
    /// 解压并发 0.2/0.4/0.5/0.8 倍核数，最小为 1
    pub fn from_speed_profile(speed: u32, cpu_cores: usize) -> Self {
        let (download_ratio, decompress_ratio) = match speed {
            s if s <= 8 => (0.6, 0.2),
            s if s <= 16 => (1.2, 0.4),
            s if s <= 24 => (1.5, 0.5),
            _ => (2.4, 0.8),
        };
        let cores = cpu_cores.max(1) as f64;
        Self {
            max_downloads: ((cores * download_ratio) as usize).max(1),
            max_decompress: ((cores * decompress_ratio) as usize).max(1),
        }
    }
}

/// 传输回调
///
/// 回调可能来自引擎内部任意线程，实现必须是线程安全的
pub trait TransferListener: Send + Sync {
    fn on_item_added(&self, _app_id: AppId) {}

    fn on_download_started(&self, _app_id: AppId) {}

    fn on_phase_changed(&self, _phase: TransferPhase) {}

    fn on_item_completed(&self, _app_id: AppId) {}

    fn on_item_failed(&self, _app_id: AppId, _error: &TransferError) {}

    fn on_status_message(&self, _message: &str) {}

    /// 分片完成
    ///
    /// `depot_percent` 取值 0-100，`uncompressed_bytes` 为引擎全局累计的解压后字节数
    fn on_chunk_completed(
        &self,
        _depot_id: DepotId,
        _depot_percent: f32,
        _compressed_bytes: u64,
        _uncompressed_bytes: u64,
    ) {
    }

    fn on_depot_completed(&self, _depot_id: DepotId, _compressed_bytes: u64, _uncompressed_bytes: u64) {}
}

/// 传输引擎
#[async_trait]
pub trait TransferEngine: Send + Sync {
    fn add_listener(&self, listener: Arc<dyn TransferListener>);

    fn enqueue(&self, item: TransferItem) -> Result<(), TransferError>;

    fn finish_adding(&self);

    fn start(&self) -> Result<(), TransferError>;

    /// 等待整体完成
    async fn completion(&self) -> Result<(), TransferError>;

    /// 释放引擎资源
    async fn close(&self);
}

/// 传输引擎工厂
///
/// 每个下载任务创建一个独立引擎
pub trait TransferEngineFactory: Send + Sync {
    fn create(
        &self,
        cancel_token: CancellationToken,
        options: TransferOptions,
    ) -> anyhow::Result<Box<dyn TransferEngine>>;
}
