//! 测试用脚本化传输引擎

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::engine::{
    TransferEngine, TransferEngineFactory, TransferError, TransferItem, TransferListener,
    TransferOptions, TransferPhase,
};
use crate::catalog::DepotId;

/// 引擎行为脚本
#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// 逐个 depot 上报完成
    CompleteAll,
    /// 开始后立即失败
    Fail(String),
    /// 上报一次分块进度后挂起，直到被取消
    Hang { chunk_bytes: u64 },
    /// 直接返回成功，不发任何 depot 回调
    CompleteSilently,
}

#[derive(Default)]
pub(crate) struct ScriptedEngineFactory {
    script: Mutex<Option<Script>>,
    depot_sizes: Mutex<HashMap<DepotId, u64>>,
    enqueued: Arc<Mutex<Vec<TransferItem>>>,
    created: AtomicUsize,
}

impl ScriptedEngineFactory {
    pub(crate) fn new(script: Script) -> Arc<Self> {
        let factory = Self::default();
        *factory.script.lock() = Some(script);
        Arc::new(factory)
    }

    pub(crate) fn set_script(&self, script: Script) {
        *self.script.lock() = Some(script);
    }

    pub(crate) fn set_depot_size(&self, depot_id: DepotId, size: u64) {
        self.depot_sizes.lock().insert(depot_id, size);
    }

    pub(crate) fn enqueued(&self) -> Vec<TransferItem> {
        self.enqueued.lock().clone()
    }

    pub(crate) fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl TransferEngineFactory for ScriptedEngineFactory {
    fn create(
        &self,
        cancel_token: CancellationToken,
        _options: TransferOptions,
    ) -> anyhow::Result<Box<dyn TransferEngine>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let script = self
            .script
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("未设置引擎脚本"))?;
        Ok(Box::new(ScriptedEngine {
            script,
            cancel_token,
            depot_sizes: self.depot_sizes.lock().clone(),
            listeners: Mutex::new(Vec::new()),
            items: Mutex::new(Vec::new()),
            log: self.enqueued.clone(),
        }))
    }
}

struct ScriptedEngine {
    script: Script,
    cancel_token: CancellationToken,
    depot_sizes: HashMap<DepotId, u64>,
    listeners: Mutex<Vec<Arc<dyn TransferListener>>>,
    items: Mutex<Vec<TransferItem>>,
    log: Arc<Mutex<Vec<TransferItem>>>,
}

impl ScriptedEngine {
    fn each(&self, f: impl Fn(&dyn TransferListener)) {
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            f(listener.as_ref());
        }
    }
}

#[async_trait]
impl TransferEngine for ScriptedEngine {
    fn add_listener(&self, listener: Arc<dyn TransferListener>) {
        self.listeners.lock().push(listener);
    }

    fn enqueue(&self, item: TransferItem) -> Result<(), TransferError> {
        self.log.lock().push(item.clone());
        self.items.lock().push(item);
        Ok(())
    }

    fn finish_adding(&self) {}

    fn start(&self) -> Result<(), TransferError> {
        Ok(())
    }

    async fn completion(&self) -> Result<(), TransferError> {
        let items = self.items.lock().clone();
        let Some(first) = items.first() else {
            return Ok(());
        };

        match &self.script {
            Script::CompleteSilently => Ok(()),
            Script::CompleteAll => {
                self.each(|l| l.on_phase_changed(TransferPhase::Preparing));
                self.each(|l| l.on_download_started(first.app_id));
                let mut global = 0;
                for item in &items {
                    for depot_id in &item.depot_ids {
                        let size = self.depot_sizes.get(depot_id).copied().unwrap_or(1);
                        global += size;
                        self.each(|l| l.on_chunk_completed(*depot_id, 100.0, size, global));
                        self.each(|l| l.on_depot_completed(*depot_id, size, global));
                    }
                    self.each(|l| l.on_item_completed(item.app_id));
                }
                Ok(())
            }
            Script::Fail(message) => {
                self.each(|l| l.on_download_started(first.app_id));
                let error = TransferError::Failed(message.clone());
                self.each(|l| l.on_item_failed(first.app_id, &error));
                Err(error)
            }
            Script::Hang { chunk_bytes } => {
                self.each(|l| l.on_download_started(first.app_id));
                if *chunk_bytes > 0 {
                    if let Some(depot_id) = first.depot_ids.first() {
                        self.each(|l| {
                            l.on_chunk_completed(*depot_id, 10.0, *chunk_bytes, *chunk_bytes)
                        });
                    }
                }
                self.cancel_token.cancelled().await;
                self.each(|l| l.on_item_failed(first.app_id, &TransferError::Cancelled));
                Err(TransferError::Cancelled)
            }
        }
    }

    async fn close(&self) {}
}
