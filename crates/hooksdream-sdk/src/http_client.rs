//! HTTP 传输 - 待同步操作的生产回放通道
//!
//! 使用 reqwest 作为底层 HTTP 客户端。连接失败和超时映射为 `TransientNetwork`，
//! 其余情况一律返回状态码，由调度器按重试策略分类。

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client, Method};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{HooksDreamSDKError, Result};
use crate::sdk::HttpClientConfig;
use crate::storage::queue::{BodyEncoding, EndpointDescriptor, HttpMethod};
use crate::sync::transport::{ActionTransport, TransportResponse};

/// 基于 reqwest 的传输
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// 创建新的 HTTP 传输
    pub fn new(config: &HttpClientConfig) -> Result<Self> {
        let mut builder = Client::builder();

        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }

        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| HooksDreamSDKError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ HTTP 传输已创建");
        Ok(Self { client })
    }

    async fn multipart_form(file_field: &str, body: Option<&Value>) -> Result<multipart::Form> {
        let fields = body.and_then(Value::as_object).ok_or_else(|| {
            HooksDreamSDKError::Serialization("multipart 请求缺少表单字段".to_string())
        })?;
        let local_path = fields
            .get("localPath")
            .and_then(Value::as_str)
            .ok_or_else(|| HooksDreamSDKError::Serialization("multipart 请求缺少 localPath".to_string()))?;

        // 本地文件已不存在属于永久失败
        let file_data = tokio::fs::read(local_path).await.map_err(|e| {
            HooksDreamSDKError::Serialization(format!("读取待上传文件失败 {}: {}", local_path, e))
        })?;
        let file_name = fields
            .get("fileName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| file_name_of(Path::new(local_path)));
        let mime_type = fields
            .get("contentType")
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream");

        let part = multipart::Part::bytes(file_data)
            .file_name(file_name)
            .mime_str(mime_type)
            .map_err(|e| HooksDreamSDKError::Serialization(format!("创建 multipart part 失败: {}", e)))?;

        let mut form = multipart::Form::new().part(file_field.to_string(), part);
        for (name, value) in fields {
            if matches!(name.as_str(), "localPath" | "fileName" | "contentType") {
                continue;
            }
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Null => continue,
                other => other.to_string(),
            };
            form = form.text(name.clone(), text);
        }
        Ok(form)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file")
        .to_string()
}

fn to_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn classify_send_error(error: reqwest::Error) -> HooksDreamSDKError {
    if error.is_builder() {
        HooksDreamSDKError::InvalidArgument(format!("请求构造失败: {}", error))
    } else {
        HooksDreamSDKError::TransientNetwork(error.to_string())
    }
}

#[async_trait]
impl ActionTransport for HttpTransport {
    async fn send(&self, endpoint: &EndpointDescriptor, body: Option<&Value>) -> Result<TransportResponse> {
        let mut request = self.client.request(to_method(endpoint.method), &endpoint.url);
        for (name, value) in &endpoint.headers {
            request = request.header(name, value);
        }
        request = match &endpoint.encoding {
            BodyEncoding::Json => match body {
                Some(body) => request.json(body),
                None => request,
            },
            BodyEncoding::Multipart { file_field } => request.multipart(Self::multipart_form(file_field, body).await?),
        };

        debug!("📤 {} {}", endpoint.method.as_str(), endpoint.url);
        let response = request.send().await.map_err(classify_send_error)?;
        let status = response.status().as_u16();

        let text = response
            .text()
            .await
            .map_err(|e| HooksDreamSDKError::TransientNetwork(format!("读取响应失败: {}", e)))?;
        let body = if text.trim().is_empty() {
            None
        } else {
            // 非 JSON 的响应体按字符串保留，便于错误信息展示
            Some(serde_json::from_str(&text).unwrap_or(Value::String(text)))
        };
        debug!("📥 {} {} -> {}", endpoint.method.as_str(), endpoint.url, status);
        Ok(TransportResponse { status, body })
    }
}
