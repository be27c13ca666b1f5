//! 离线同步演示
//!
//! 用一个内存里的模拟服务端替代 HTTP：先离线关注、点赞、发消息，
//! 再恢复网络，观察队列回放和状态变化。
//!
//! 运行：`RUST_LOG=hooksdream_sdk=debug cargo run --example offline_sync_demo`

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hooksdream_sdk::{
    ActionTransport, CachedEntity, CachedUser, EndpointDescriptor, HooksDreamSDK, HttpMethod, NetworkStatus,
    PlatformProviders, Result, SdkConfig, TransportResponse,
};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 模拟服务端，只认识关注接口，其余请求一律成功
struct MockServer {
    followers: AtomicI64,
}

#[async_trait]
impl ActionTransport for MockServer {
    async fn send(&self, endpoint: &EndpointDescriptor, body: Option<&Value>) -> Result<TransportResponse> {
        info!("🌐 {} {} {:?}", endpoint.method.as_str(), endpoint.url, body);
        if endpoint.url.ends_with("/follow") {
            let followers = match endpoint.method {
                HttpMethod::Delete => self.followers.fetch_sub(1, Ordering::SeqCst) - 1,
                _ => self.followers.fetch_add(1, Ordering::SeqCst) + 1,
            };
            return Ok(TransportResponse::ok(json!({
                "success": true,
                "data": { "isFollowing": endpoint.method != HttpMethod::Delete, "followerCount": followers }
            })));
        }
        Ok(TransportResponse::ok(json!({ "success": true })))
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let data_dir = std::env::temp_dir().join("hooksdream-demo");
    let config = SdkConfig::builder()
        .data_dir(&data_dir)
        .api_base_url("https://api.hooksdream.app")
        .local_user_id("me")
        .auth_token("demo-token")
        .build();
    let providers = PlatformProviders::filesystem(&data_dir, 50 * 1024 * 1024);
    let transport = Arc::new(MockServer {
        followers: AtomicI64::new(10),
    });

    let sdk = HooksDreamSDK::initialize(config, providers, transport).await?;
    let _dispose = sdk.on_status_change(|status| {
        info!(
            "📥 状态变化: online={} pending={}",
            status.is_online, status.pending_actions_count
        );
    });
    sdk.start()?;

    let neo = CachedUser {
        hash_id: "42".to_string(),
        username: "neo".to_string(),
        full_name: Some("Thomas Anderson".to_string()),
        avatar: None,
        bio: None,
        is_following: false,
        follower_count: 10,
        following_count: 3,
        is_online: false,
        last_seen: None,
    };
    sdk.store().put(&CachedEntity::new(neo, 1)).await?;

    info!("🚫 模拟断网");
    sdk.set_network_status(NetworkStatus::Offline);
    sdk.toggle_follow("42").await?;
    sdk.queue_send_message("conversation-1", "在地铁上，稍后回复", "text").await?;

    for action in sdk.pending_actions().await? {
        info!("待同步: {} ({})", action.id, action.kind());
    }

    info!("🔄 网络恢复");
    sdk.set_network_status(NetworkStatus::Online);
    tokio::time::sleep(Duration::from_millis(500)).await;

    if let Some(user) = sdk.store().get::<CachedUser>("42").await? {
        info!(
            "✅ neo: following={} followers={}",
            user.payload.is_following, user.payload.follower_count
        );
    }

    let report = sdk.health_report().await?;
    info!("健康报告: {}", serde_json::to_string_pretty(&report)?);

    sdk.shutdown().await?;
    Ok(())
}
