// 访问令牌提供方
//
// 令牌的获取与刷新（OAuth 流程）不在本 crate 范围内，
// 这里只定义注入点：每次 API 请求前向提供方索取当前令牌。

use crate::error::{DriveError, DriveResult};
use async_trait::async_trait;
use parking_lot::RwLock;

/// 访问令牌提供方
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// 当前有效的访问令牌
    async fn access_token(&self) -> DriveResult<String>;
}

/// 固定令牌（来自环境变量或配置文件）
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    token: RwLock<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    /// 未配置令牌，调用 API 时返回认证错误
    pub fn missing() -> Self {
        Self::default()
    }

    /// 替换令牌（外部刷新后调用）
    pub fn set(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> DriveResult<String> {
        self.token.read().clone().ok_or_else(|| {
            DriveError::Auth(format!(
                "未配置访问令牌，请设置环境变量 {}",
                crate::config::ACCESS_TOKEN_ENV
            ))
        })
    }
}
