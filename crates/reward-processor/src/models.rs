//! 奖励管道的数据模型定义
//!
//! 线上格式（UserEvent / RewardTriggered）的字段名与序列化行为是
//! 对外契约的一部分：输入侧忽略未知字段、缺失必填字段视为畸形；
//! 输出侧 amount 为零时省略。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Reward — 奖励定义
// ---------------------------------------------------------------------------

/// 奖励类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RewardKind {
    Badge,
    Points,
}

impl std::fmt::Display for RewardKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 与 serde 的 SCREAMING_SNAKE_CASE 保持一致，便于日志与存储统一引用
        let s = match self {
            Self::Badge => "BADGE",
            Self::Points => "POINTS",
        };
        write!(f, "{s}")
    }
}

/// 奖励定义
///
/// 约束：Points 奖励 amount 必须为正，Badge 奖励 amount 恒为零。
/// 该约束在规则快照构建时校验（见 engine 模块），而非此处。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reward {
    #[serde(rename = "type")]
    pub kind: RewardKind,
    /// 积分数量；线上格式中为零时省略
    #[serde(default, skip_serializing_if = "amount_is_zero")]
    pub amount: i32,
    pub description: String,
}

fn amount_is_zero(amount: &i32) -> bool {
    *amount == 0
}

impl Reward {
    /// 徽章奖励（amount 恒为零）
    pub fn badge(description: impl Into<String>) -> Self {
        Self {
            kind: RewardKind::Badge,
            amount: 0,
            description: description.into(),
        }
    }

    /// 积分奖励
    pub fn points(amount: i32, description: impl Into<String>) -> Self {
        Self {
            kind: RewardKind::Points,
            amount,
            description: description.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rule — 奖励规则
// ---------------------------------------------------------------------------

/// 规则条件
///
/// 封闭记录：当前版本唯一支持的条件是 category 精确匹配。
/// `None` 表示无条件规则。新增条件种类时在此追加字段，
/// 不引入字符串键的开放映射。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConditions {
    pub category: Option<String>,
}

impl RuleConditions {
    /// 按 category 精确匹配的条件
    pub fn category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
        }
    }

    /// 无条件
    pub fn none() -> Self {
        Self::default()
    }

    /// 事件是否满足全部条件
    pub fn matches(&self, event: &UserEvent) -> bool {
        match &self.category {
            Some(category) => *category == event.category,
            None => true,
        }
    }

    /// 计数查询使用的类目键
    ///
    /// 无 category 条件的规则读取空类目的计数行，只会匹配自身
    /// category 为空串的事件；需要跨类目触发的规则应按类目逐条配置。
    pub fn lookup_category(&self) -> &str {
        self.category.as_deref().unwrap_or("")
    }
}

/// 奖励规则
///
/// `count == 1` 即单次触发规则，里程碑规则与单次规则共用同一条
/// 评估路径：计数严格等于 count 时触发。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub event_type: String,
    pub count: i32,
    #[serde(default)]
    pub conditions: RuleConditions,
    pub reward: Reward,
    pub enabled: bool,
}

// ---------------------------------------------------------------------------
// UserEvent / RewardTriggered — 线上格式
// ---------------------------------------------------------------------------

/// 输入事件（消费 topic 的线上格式）
///
/// 所有字符串字段大小写敏感；category 允许为空串（空串是合法类目）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    pub user_id: String,
    pub event_type: String,
    pub course_id: String,
    pub category: String,
    pub timestamp: DateTime<Utc>,
}

/// 奖励触发事件（生产 topic 的线上格式）
///
/// timestamp 是规则触发时的服务端时钟，不是输入事件的时间戳。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardTriggered {
    pub user_id: String,
    pub rule_id: String,
    pub reward: Reward,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// UserEventCount — 持久化计数行
// ---------------------------------------------------------------------------

/// 用户事件计数行
///
/// 主键 (user_id, event_type, category) 是引擎唯一的并发协调变量，
/// category 原样取自事件本身，空串是合法取值。
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserEventCount {
    pub user_id: String,
    pub event_type: String,
    pub category: String,
    pub count: i32,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
