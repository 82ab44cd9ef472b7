//! 目录服务接口
//!
//! 编排器通过该 trait 读取 depot 列表、DLC 关系与所有权信息，
//! 具体实现（网络目录、本地缓存）由宿主提供。

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::types::{AppId, CatalogApp, DepotId, DepotRecord};

/// 目录服务
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// 获取应用直属的 depot；应用未知时返回 `None`
    async fn app_depots(&self, app_id: AppId) -> Result<Option<BTreeMap<DepotId, DepotRecord>>>;

    /// 获取可下载的间接 DLC 应用 ID
    async fn dlc_apps_of(&self, app_id: AppId) -> Result<Vec<AppId>>;

    /// 已知隐藏 DLC 列表
    async fn hidden_dlc_apps_of(&self, _app_id: AppId) -> Result<Vec<AppId>> {
        Ok(Vec::new())
    }

    /// 当前账号拥有的 DLC；`None` 表示无所有权信息
    async fn owned_dlc_app_ids(&self, _app_id: AppId) -> Result<Option<BTreeSet<AppId>>> {
        Ok(None)
    }

    /// 安装目录名；`None` 时使用应用 ID
    async fn install_dir_name(&self, _app_id: AppId) -> Result<Option<String>> {
        Ok(None)
    }
}

/// 内存目录
///
/// 供嵌入方和测试使用
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    apps: RwLock<HashMap<AppId, CatalogApp>>,
    dlc_apps: RwLock<HashMap<AppId, Vec<AppId>>>,
    hidden_dlcs: RwLock<HashMap<AppId, Vec<AppId>>>,
    owned: RwLock<HashMap<AppId, BTreeSet<AppId>>>,
    dir_names: RwLock<HashMap<AppId, String>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_app(&self, app: CatalogApp) {
        self.apps.write().insert(app.app_id, app);
    }

    /// 注册间接 DLC（同时写入该 DLC 的 depot）
    pub fn insert_indirect_dlc(&self, parent: AppId, dlc: CatalogApp) {
        self.dlc_apps.write().entry(parent).or_default().push(dlc.app_id);
        self.insert_app(dlc);
    }

    pub fn set_hidden_dlcs(&self, app_id: AppId, ids: Vec<AppId>) {
        self.hidden_dlcs.write().insert(app_id, ids);
    }

    pub fn set_owned_dlcs(&self, app_id: AppId, ids: impl IntoIterator<Item = AppId>) {
        self.owned.write().insert(app_id, ids.into_iter().collect());
    }

    pub fn set_install_dir_name(&self, app_id: AppId, name: &str) {
        self.dir_names.write().insert(app_id, name.to_string());
    }
}

#[async_trait]
impl CatalogService for InMemoryCatalog {
    async fn app_depots(&self, app_id: AppId) -> Result<Option<BTreeMap<DepotId, DepotRecord>>> {
        Ok(self.apps.read().get(&app_id).map(|app| app.depots.clone()))
    }

    async fn dlc_apps_of(&self, app_id: AppId) -> Result<Vec<AppId>> {
        Ok(self.dlc_apps.read().get(&app_id).cloned().unwrap_or_default())
    }

    async fn hidden_dlc_apps_of(&self, app_id: AppId) -> Result<Vec<AppId>> {
        Ok(self.hidden_dlcs.read().get(&app_id).cloned().unwrap_or_default())
    }

    async fn owned_dlc_app_ids(&self, app_id: AppId) -> Result<Option<BTreeSet<AppId>>> {
        Ok(self.owned.read().get(&app_id).cloned())
    }

    async fn install_dir_name(&self, app_id: AppId) -> Result<Option<String>> {
        Ok(self.dir_names.read().get(&app_id).cloned())
    }
}
