//! 事件总线
//!
//! 所有组件通过这里通知外部协作者：缓存变化、操作结算、乐观更新结算、
//! 实时推送、状态变化、能力降级。两种订阅方式：
//! - `subscribe()` 拿到 broadcast 接收端，适合在独立任务里消费；
//! - `on(event_type, callback)` 注册同步回调，返回一个取消订阅的闭包。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::capability::Capability;
use crate::sdk::SyncStatus;
use crate::storage::entities::{EntityTable, QueryKey};
use crate::storage::queue::{ActionId, ActionKind};
use crate::utils::{now_millis, Timestamp};

/// 操作的最终结果
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// 服务端确认
    Confirmed { response: Option<Value> },
    /// 永久失败（4xx、序列化失败或重试耗尽），已从队列移除
    Failed { reason: String, status: Option<u16> },
    /// 用户取消
    Cancelled,
}

/// 乐观更新的结算方式
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Confirmed,
    /// 已写入待同步队列，乐观值保留
    Queued { action_id: ActionId },
    RolledBack { error: String },
}

/// SDK 事件
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    CacheUpdated {
        table: EntityTable,
        key: String,
        updated_at: Timestamp,
    },
    CacheRemoved {
        table: EntityTable,
        key: String,
    },
    ActionQueued {
        action_id: ActionId,
        kind: ActionKind,
    },
    ActionSettled {
        action_id: ActionId,
        kind: ActionKind,
        outcome: ActionOutcome,
        timestamp: Timestamp,
    },
    ActionRetryScheduled {
        action_id: ActionId,
        kind: ActionKind,
        retry_count: u32,
        delay_ms: u64,
    },
    /// 队列里无法识别类型的行被丢弃
    ActionDiscarded {
        action_id: ActionId,
        kind: String,
        reason: String,
        timestamp: Timestamp,
    },
    MutationSettled {
        query_key: QueryKey,
        outcome: MutationOutcome,
    },
    /// 双工通道收到的原始推送
    RealtimeReceived {
        event_type: String,
        payload: Value,
    },
    StatusChanged(SyncStatus),
    CapabilityDowngraded {
        capability: Capability,
        reason: String,
    },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::CacheUpdated { .. } => "cache_updated",
            SyncEvent::CacheRemoved { .. } => "cache_removed",
            SyncEvent::ActionQueued { .. } => "action_queued",
            SyncEvent::ActionSettled { .. } => "action_settled",
            SyncEvent::ActionRetryScheduled { .. } => "action_retry_scheduled",
            SyncEvent::ActionDiscarded { .. } => "action_discarded",
            SyncEvent::MutationSettled { .. } => "mutation_settled",
            SyncEvent::RealtimeReceived { .. } => "realtime_received",
            SyncEvent::StatusChanged(_) => "status_changed",
            SyncEvent::CapabilityDowngraded { .. } => "capability_downgraded",
        }
    }

    /// 事件涉及的表
    pub fn table(&self) -> Option<EntityTable> {
        match self {
            SyncEvent::CacheUpdated { table, .. } | SyncEvent::CacheRemoved { table, .. } => Some(*table),
            SyncEvent::MutationSettled { query_key, .. } => Some(query_key.table),
            _ => None,
        }
    }

    /// 事件涉及的操作类型
    pub fn action_kind(&self) -> Option<ActionKind> {
        match self {
            SyncEvent::ActionQueued { kind, .. }
            | SyncEvent::ActionSettled { kind, .. }
            | SyncEvent::ActionRetryScheduled { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 表过滤器
    pub tables: Option<Vec<EntityTable>>,
    /// 操作类型过滤器
    pub action_kinds: Option<Vec<ActionKind>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_tables(mut self, tables: Vec<EntityTable>) -> Self {
        self.tables = Some(tables);
        self
    }

    pub fn with_action_kinds(mut self, kinds: Vec<ActionKind>) -> Self {
        self.action_kinds = Some(kinds);
        self
    }

    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        if let Some(tables) = &self.tables {
            match event.table() {
                Some(table) if tables.contains(&table) => {}
                _ => return false,
            }
        }
        if let Some(kinds) = &self.action_kinds {
            match event.action_kind() {
                Some(kind) if kinds.contains(&kind) => {}
                _ => return false,
            }
        }
        true
    }
}

/// 同步回调
pub type EventListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// 取消订阅的闭包；调用一次即移除对应回调
pub type Disposer = Box<dyn FnOnce() + Send + Sync>;

/// 事件统计
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub last_event_time: Option<Timestamp>,
}

struct RegisteredListener {
    event_type: String,
    callback: EventListener,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    listeners: RwLock<HashMap<u64, RegisteredListener>>,
    next_listener_id: AtomicU64,
    stats: Mutex<EventStats>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            stats: Mutex::new(EventStats::default()),
        }
    }

    /// 发送事件：先广播，再按注册顺序调用匹配的回调
    pub fn emit(&self, event: SyncEvent) {
        {
            let mut stats = self.stats.lock();
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(now_millis());
        }

        // 没有接收端时 send 返回 Err，属于正常情况
        let _ = self.sender.send(event.clone());

        // 回调里可能再次 emit 或取消订阅，所以先拷贝出来再调用
        let mut matching: Vec<(u64, EventListener)> = self
            .listeners
            .read()
            .iter()
            .filter(|(_, l)| l.event_type == "*" || l.event_type == event.event_type())
            .map(|(id, l)| (*id, l.callback.clone()))
            .collect();
        matching.sort_by_key(|(id, _)| *id);

        for (_, callback) in matching {
            callback(&event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 注册回调；`event_type` 为 `"*"` 时接收所有事件
    pub fn on<F>(self: &Arc<Self>, event_type: &str, callback: F) -> Disposer
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().insert(
            id,
            RegisteredListener {
                event_type: event_type.to_string(),
                callback: Arc::new(callback),
            },
        );
        debug!("事件回调已注册: id={}, type={}", id, event_type);

        let manager: Weak<Self> = Arc::downgrade(self);
        Box::new(move || {
            if let Some(manager) = manager.upgrade() {
                manager.listeners.write().remove(&id);
                debug!("事件回调已移除: id={}", id);
            }
        })
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> EventStats {
        self.stats.lock().clone()
    }
}

/// 带过滤的接收端
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件；发送端关闭时返回 None，落后时跳过丢失的事件
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("事件接收落后，跳过 {} 条", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
