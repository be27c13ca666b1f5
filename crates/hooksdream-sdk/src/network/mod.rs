use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::Result;
use crate::utils::{now_millis, Timestamp};

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 连接中
    Connecting,
    /// 网络受限
    Limited,
}

impl NetworkStatus {
    /// 能否发起请求
    pub fn is_reachable(&self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: Timestamp,
}

impl NetworkStatusEvent {
    /// 从不可达变为可达
    pub fn is_reconnect(&self) -> bool {
        !self.old_status.is_reachable() && self.new_status.is_reachable()
    }
}

/// 网络状态监听器 trait（由宿主平台实现）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控
///
/// 状态来源有两个：宿主通过 `set_status` 直接设置，或者挂接一个平台监听器。
#[derive(Debug)]
pub struct NetworkMonitor {
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<RwLock<NetworkStatus>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (status_sender, _) = broadcast::channel(100);
        Self {
            status_sender,
            current_status: Arc::new(RwLock::new(initial)),
        }
    }

    /// 挂接平台监听器，后台转发其状态变化
    pub async fn attach(self: &Arc<Self>, listener: Arc<dyn NetworkStatusListener>) -> Result<()> {
        self.set_status(listener.get_current_status().await);
        let mut receiver = listener.start_monitoring().await?;
        let monitor = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.set_status(event.new_status);
            }
        });
        Ok(())
    }

    /// 获取当前网络状态
    pub fn status(&self) -> NetworkStatus {
        *self.current_status.read()
    }

    pub fn is_online(&self) -> bool {
        self.status().is_reachable()
    }

    /// 设置网络状态；状态未变化时不广播。返回是否变化
    pub fn set_status(&self, new_status: NetworkStatus) -> bool {
        let old_status = {
            let mut status = self.current_status.write();
            let old = *status;
            *status = new_status;
            old
        };
        if old_status == new_status {
            return false;
        }

        info!("🌐 网络状态变化: {:?} -> {:?}", old_status, new_status);
        let _ = self.status_sender.send(NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: now_millis(),
        });
        true
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;

    /// 测试用：可手动推送状态的监听器
    #[derive(Debug)]
    pub struct ManualNetworkListener {
        pub status: NetworkStatus,
        pub sender: broadcast::Sender<NetworkStatusEvent>,
    }

    impl ManualNetworkListener {
        pub fn new(status: NetworkStatus) -> Self {
            let (sender, _) = broadcast::channel(16);
            Self { status, sender }
        }

        pub fn push(&self, old_status: NetworkStatus, new_status: NetworkStatus) {
            let _ = self.sender.send(NetworkStatusEvent {
                old_status,
                new_status,
                timestamp: now_millis(),
            });
        }
    }

    #[async_trait]
    impl NetworkStatusListener for ManualNetworkListener {
        async fn get_current_status(&self) -> NetworkStatus {
            self.status
        }

        async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
            Ok(self.sender.subscribe())
        }

        async fn stop_monitoring(&self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::test_helpers::ManualNetworkListener;
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_set_status_broadcasts_only_changes() {
        let monitor = NetworkMonitor::new(NetworkStatus::Offline);
        let mut rx = monitor.subscribe();

        assert!(!monitor.set_status(NetworkStatus::Offline));
        assert!(monitor.set_status(NetworkStatus::Online));
        assert!(monitor.is_online());

        let event = rx.try_recv().unwrap();
        assert!(event.is_reconnect());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_attached_listener_drives_status() {
        let monitor = Arc::new(NetworkMonitor::new(NetworkStatus::Online));
        let listener = Arc::new(ManualNetworkListener::new(NetworkStatus::Offline));
        monitor.attach(listener.clone()).await.unwrap();
        assert_eq!(monitor.status(), NetworkStatus::Offline);

        let mut rx = monitor.subscribe();
        listener.push(NetworkStatus::Offline, NetworkStatus::Limited);
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.new_status, NetworkStatus::Limited);
        assert!(monitor.is_online());
    }
}
