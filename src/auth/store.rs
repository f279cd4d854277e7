use async_trait::async_trait;
use bcrypt::{hash, verify, DEFAULT_COST};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::types::{Role, User};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("用户存储不可用: {0}")]
    Unavailable(String),

    #[error("密码处理失败: {0}")]
    Hash(String),
}

/// 用户凭据查询；实现不得把密码或哈希返回给调用方
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// 邮箱不区分大小写；无论邮箱是否存在耗时都应相近
    async fn authenticate(&self, email: &str, password: &str) -> Result<Option<User>, StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<User>, StoreError>;
}

struct StoredUser {
    user: User,
    password_hash: String,
}

pub struct InMemoryCredentialStore {
    users: HashMap<String, Arc<StoredUser>>,
    // 邮箱不存在时也做一次 bcrypt 校验
    dummy_hash: Arc<str>,
}

impl InMemoryCredentialStore {
    pub fn new(cost: u32) -> Result<Self, StoreError> {
        Ok(Self {
            users: HashMap::new(),
            dummy_hash: hash_password("rr-gate-dummy-password", cost)?.into(),
        })
    }

    pub fn add_user(
        &mut self,
        id: &str,
        email: &str,
        password: &str,
        role: Role,
        cost: u32,
    ) -> Result<(), StoreError> {
        let key = normalize_email(email);
        let stored = StoredUser {
            user: User {
                id: id.to_string(),
                email: email.trim().to_string(),
                role,
            },
            password_hash: hash_password(password, cost)?,
        };
        self.users.insert(key, Arc::new(stored));
        debug!("添加用户: {} ({})", id, role);
        Ok(())
    }

    /// 开发和测试用的固定账号
    pub fn seeded() -> Result<Self, StoreError> {
        Self::seeded_with_cost(DEFAULT_COST)
    }

    pub fn seeded_with_cost(cost: u32) -> Result<Self, StoreError> {
        let mut store = Self::new(cost)?;
        store.add_user("admin-1", "admin@example.com", "admin123", Role::Admin, cost)?;
        store.add_user("user-1", "user@example.com", "user123", Role::User, cost)?;
        info!("已加载 {} 个预置账号", store.users.len());
        Ok(store)
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn authenticate(&self, email: &str, password: &str) -> Result<Option<User>, StoreError> {
        let stored = self.users.get(&normalize_email(email)).cloned();
        let hash = match &stored {
            Some(s) => s.password_hash.clone(),
            None => self.dummy_hash.to_string(),
        };
        let password = password.to_string();

        let matched = tokio::task::spawn_blocking(move || verify(password, &hash))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .map_err(|e| {
                error!("密码验证过程出错: {}", e);
                StoreError::Hash(e.to_string())
            })?;

        match stored {
            Some(s) if matched => Ok(Some(s.user.clone())),
            _ => {
                warn!("凭据校验失败");
                Ok(None)
            }
        }
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .users
            .values()
            .find(|s| s.user.id == id)
            .map(|s| s.user.clone()))
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn hash_password(password: &str, cost: u32) -> Result<String, StoreError> {
    hash(password.as_bytes(), cost).map_err(|e| {
        error!("密码加密失败: {}", e);
        StoreError::Hash(e.to_string())
    })
}

#[cfg(test)]
pub(crate) const TEST_COST: u32 = 4;
