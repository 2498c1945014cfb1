//! 数据访问层
//!
//! 事件计数存储与规则仓储。计数存储是整个管道唯一的可变共享状态，
//! 其原子性由数据库的行级锁保证；规则仓储只在启动期读取一次快照。

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use rewards_shared::error::RewardError;

use crate::models::{Reward, RewardKind, Rule, RuleConditions, UserEventCount};

// ---------------------------------------------------------------------------
// EventCountStore — 事件计数存储
// ---------------------------------------------------------------------------

/// 事件计数存储接口
///
/// 键为 (user_id, event_type, category) 三元组。并发递增同一三元组
/// 必须串行化：任意两次递增不得观测到相同的后置状态。
#[async_trait]
pub trait EventCountStore: Send + Sync {
    /// 原子递增：行不存在则以 count=1 插入，否则 count 加一并刷新
    /// updated_at。必须是单个逻辑事务。
    async fn increment(
        &self,
        user_id: &str,
        event_type: &str,
        category: &str,
    ) -> Result<(), RewardError>;

    /// 查询三元组的当前计数；行不存在返回 0 而非错误
    async fn get_count(
        &self,
        user_id: &str,
        event_type: &str,
        category: &str,
    ) -> Result<i32, RewardError>;
}

/// PostgreSQL 计数存储
///
/// 递增通过单条 `INSERT ... ON CONFLICT DO UPDATE` 完成：
/// 一条语句即一个事务，冲突路径在行锁上排队，天然满足串行化要求。
pub struct PgEventCountStore {
    pool: PgPool,
}

impl PgEventCountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventCountStore for PgEventCountStore {
    async fn increment(
        &self,
        user_id: &str,
        event_type: &str,
        category: &str,
    ) -> Result<(), RewardError> {
        sqlx::query(
            r#"
            INSERT INTO user_event_counts (user_id, event_type, category, count, updated_at)
            VALUES ($1, $2, $3, 1, now())
            ON CONFLICT (user_id, event_type, category)
            DO UPDATE SET count = user_event_counts.count + 1, updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(event_type)
        .bind(category)
        .execute(&self.pool)
        .await?;

        debug!(user_id, event_type, category, "事件计数已递增");
        Ok(())
    }

    async fn get_count(
        &self,
        user_id: &str,
        event_type: &str,
        category: &str,
    ) -> Result<i32, RewardError> {
        let row = sqlx::query_as::<_, UserEventCount>(
            r#"
            SELECT user_id, event_type, category, count, updated_at
            FROM user_event_counts
            WHERE user_id = $1 AND event_type = $2 AND category = $3
            "#,
        )
        .bind(user_id)
        .bind(event_type)
        .bind(category)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|c| c.count).unwrap_or(0))
    }
}

/// 内存计数存储
///
/// 供单元测试与场景测试使用，行为与 PostgreSQL 实现一致
/// （单进程内通过互斥锁串行化递增）。
#[derive(Default)]
pub struct MemoryEventCountStore {
    counts: Mutex<HashMap<(String, String, String), i32>>,
}

impl MemoryEventCountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventCountStore for MemoryEventCountStore {
    async fn increment(
        &self,
        user_id: &str,
        event_type: &str,
        category: &str,
    ) -> Result<(), RewardError> {
        let mut counts = self
            .counts
            .lock()
            .map_err(|e| RewardError::Internal(format!("计数锁被毒化: {e}")))?;
        let key = (
            user_id.to_string(),
            event_type.to_string(),
            category.to_string(),
        );
        *counts.entry(key).or_insert(0) += 1;
        Ok(())
    }

    async fn get_count(
        &self,
        user_id: &str,
        event_type: &str,
        category: &str,
    ) -> Result<i32, RewardError> {
        let counts = self
            .counts
            .lock()
            .map_err(|e| RewardError::Internal(format!("计数锁被毒化: {e}")))?;
        let key = (
            user_id.to_string(),
            event_type.to_string(),
            category.to_string(),
        );
        Ok(counts.get(&key).copied().unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// RuleRepository — 规则仓储
// ---------------------------------------------------------------------------

/// 规则仓储接口
///
/// 规则由外部管理面创建与停用；引擎只在启动期读取一次已启用规则的快照。
#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn get_enabled_rules(&self) -> Result<Vec<Rule>, RewardError>;
}

/// rules 表的行映射
///
/// conditions_category 为 NULL 表示无条件规则，对应封闭记录的 None。
#[derive(Debug, sqlx::FromRow)]
struct RuleRow {
    id: String,
    event_type: String,
    count: i32,
    conditions_category: Option<String>,
    reward_type: String,
    reward_amount: i32,
    reward_description: String,
    enabled: bool,
}

impl TryFrom<RuleRow> for Rule {
    type Error = RewardError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        let kind = match row.reward_type.as_str() {
            "BADGE" => RewardKind::Badge,
            "POINTS" => RewardKind::Points,
            other => {
                return Err(RewardError::Validation(format!(
                    "未知的奖励类型: rule_id={}, reward_type={other}",
                    row.id
                )));
            }
        };

        Ok(Rule {
            id: row.id,
            event_type: row.event_type,
            count: row.count,
            conditions: RuleConditions {
                category: row.conditions_category,
            },
            reward: Reward {
                kind,
                amount: row.reward_amount,
                description: row.reward_description,
            },
            enabled: row.enabled,
        })
    }
}

/// PostgreSQL 规则仓储
pub struct PgRuleRepository {
    pool: PgPool,
}

impl PgRuleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RuleRepository for PgRuleRepository {
    /// 读取全部已启用规则，按 id 排序保证快照遍历顺序稳定
    async fn get_enabled_rules(&self) -> Result<Vec<Rule>, RewardError> {
        let rows = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT id, event_type, count, conditions_category,
                   reward_type, reward_amount, reward_description, enabled
            FROM rules
            WHERE enabled
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Rule::try_from).collect()
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
