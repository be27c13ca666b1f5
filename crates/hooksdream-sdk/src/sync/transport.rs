//! 操作回放的传输层抽象
//!
//! 调度器只依赖 `ActionTransport`；生产实现是 `crate::http_client::HttpTransport`，
//! 测试使用脚本化的传输。

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::storage::queue::EndpointDescriptor;

/// 一次请求的响应
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl TransportResponse {
    pub fn new(status: u16, body: Option<Value>) -> Self {
        Self { status, body }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(200, Some(body))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 错误信息（服务端 `{ message }` 或 `{ error }`）
    pub fn error_message(&self) -> String {
        self.body
            .as_ref()
            .and_then(|b| b.get("message").or_else(|| b.get("error")))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", self.status))
    }
}

/// 发送一次请求
///
/// 网络层失败（连接、超时）返回 `TransientNetwork`；拿到任何 HTTP 状态码都返回 Ok，
/// 由调用方分类。
#[async_trait]
pub trait ActionTransport: Send + Sync {
    async fn send(&self, endpoint: &EndpointDescriptor, body: Option<&Value>) -> Result<TransportResponse>;
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::*;
    use crate::error::HooksDreamSDKError;

    /// 一次请求记录
    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        pub endpoint: EndpointDescriptor,
        pub body: Option<Value>,
    }

    /// 按脚本依次返回响应的传输；脚本用完后返回 200 空响应
    #[derive(Default)]
    pub struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<TransportResponse>>>,
        requests: Mutex<Vec<RecordedRequest>>,
        gate: Mutex<Option<Arc<Notify>>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn push(&self, response: TransportResponse) {
            self.responses.lock().push_back(Ok(response));
        }

        pub fn push_status(&self, status: u16) {
            self.push(TransportResponse::new(status, None));
        }

        pub fn push_network_error(&self) {
            self.responses
                .lock()
                .push_back(Err(HooksDreamSDKError::TransientNetwork("connection refused".to_string())));
        }

        /// 之后的请求在 `notify_one` 之前阻塞
        pub fn gate(&self) -> Arc<Notify> {
            let notify = Arc::new(Notify::new());
            *self.gate.lock() = Some(notify.clone());
            notify
        }

        pub fn requests(&self) -> Vec<RecordedRequest> {
            self.requests.lock().clone()
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait]
    impl ActionTransport for ScriptedTransport {
        async fn send(&self, endpoint: &EndpointDescriptor, body: Option<&Value>) -> Result<TransportResponse> {
            self.requests.lock().push(RecordedRequest {
                endpoint: endpoint.clone(),
                body: body.cloned(),
            });
            let gate = self.gate.lock().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(TransportResponse::new(200, None)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_message_prefers_server_text() {
        let resp = TransportResponse::new(400, Some(json!({ "success": false, "message": "content too long" })));
        assert!(!resp.is_success());
        assert_eq!(resp.error_message(), "content too long");
        assert_eq!(TransportResponse::new(503, None).error_message(), "HTTP 503");
        assert!(TransportResponse::ok(json!({})).is_success());
    }
}
