//! 网络策略门
//!
//! 跟踪连接状态，判断“仅 Wi-Fi 下载”策略是否阻止下载。
//! Wi-Fi 与有线网络都视为不计流量网络。

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// 连接状态事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectivityEvent {
    /// 网络可用
    Available { unmetered: bool },
    /// 网络能力变化
    CapabilitiesChanged { unmetered: bool },
    /// 网络断开
    Lost,
}

/// 网络策略门
#[derive(Debug)]
pub struct NetworkGate {
    wifi_only: AtomicBool,
    connected: AtomicBool,
    unmetered: AtomicBool,
}

impl NetworkGate {
    /// 初始假定网络可用且不计流量，直到收到第一个事件
    pub fn new(wifi_only: bool) -> Self {
        Self {
            wifi_only: AtomicBool::new(wifi_only),
            connected: AtomicBool::new(true),
            unmetered: AtomicBool::new(true),
        }
    }

    pub fn wifi_only(&self) -> bool {
        self.wifi_only.load(Ordering::SeqCst)
    }

    pub fn set_wifi_only(&self, enabled: bool) {
        self.wifi_only.store(enabled, Ordering::SeqCst);
    }

    pub fn has_unmetered_connection(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.unmetered.load(Ordering::SeqCst)
    }

    /// 当前策略是否阻止下载
    pub fn is_blocked(&self) -> bool {
        self.wifi_only() && !self.has_unmetered_connection()
    }

    /// 应用连接事件
    ///
    /// # Returns
    /// 本次事件使下载从允许变为阻止时返回 true
    pub fn apply(&self, event: ConnectivityEvent) -> bool {
        let was_blocked = self.is_blocked();
        match event {
            ConnectivityEvent::Available { unmetered }
            | ConnectivityEvent::CapabilitiesChanged { unmetered } => {
                self.connected.store(true, Ordering::SeqCst);
                self.unmetered.store(unmetered, Ordering::SeqCst);
            }
            ConnectivityEvent::Lost => {
                self.connected.store(false, Ordering::SeqCst);
                self.unmetered.store(false, Ordering::SeqCst);
            }
        }
        !was_blocked && self.is_blocked()
    }
}

impl Default for NetworkGate {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_off_never_blocks() {
        let gate = NetworkGate::new(false);
        assert!(!gate.apply(ConnectivityEvent::Lost));
        assert!(!gate.is_blocked());
    }

    #[test]
    fn test_wifi_only_transitions() {
        let gate = NetworkGate::new(true);
        assert!(!gate.is_blocked());

        assert!(gate.apply(ConnectivityEvent::CapabilitiesChanged { unmetered: false }));
        assert!(gate.is_blocked());

        // 已阻止时再次断开不算新的转换
        assert!(!gate.apply(ConnectivityEvent::Lost));

        assert!(!gate.apply(ConnectivityEvent::Available { unmetered: true }));
        assert!(!gate.is_blocked());
    }

    #[test]
    fn test_event_json() {
        let event: ConnectivityEvent =
            serde_json::from_str(r#"{"kind":"available","unmetered":false}"#).unwrap();
        assert_eq!(event, ConnectivityEvent::Available { unmetered: false });
    }
}
